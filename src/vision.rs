//! Vision bus frame types and sources
//!
//! The camera/vision subsystem delivers frames over a shared-memory ring
//! with sequence numbers. This module defines the consuming seam:
//! - `VisionFrame`: one frame as handed to the encoder pipeline
//! - `FrameSource`: blocking receive with a liveness-timeout tick
//! - `FrameRing`: bounded drop-oldest buffer mirroring the ring's behavior
//! - a synthetic test source for development without camera hardware

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

/// A single camera frame in arrival order.
#[derive(Debug, Clone)]
pub struct VisionFrame {
    /// Vision-bus sequence number (monotonic per stream, gaps visible)
    pub frame_id: u64,
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
    /// Pixel buffer
    pub data: Bytes,
}

/// A blocking stream of frames for one physical camera.
///
/// `recv_frame` blocks until a frame arrives or `timeout` elapses.
/// `None` is a liveness tick, not an error: absence of frames is
/// observable, and the caller counts missed intervals.
pub trait FrameSource: Send {
    fn recv_frame(&mut self, timeout: Duration) -> Option<VisionFrame>;
}

struct RingShared {
    queue: Mutex<VecDeque<VisionFrame>>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Consumer side of a bounded frame ring.
///
/// When the consumer falls behind, the producer evicts the oldest
/// undelivered frame rather than stalling: bounded-latency logging
/// over completeness.
pub struct FrameRing {
    shared: Arc<RingShared>,
}

/// Producer handle for a [`FrameRing`]. Never blocks.
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<RingShared>,
}

/// Create a frame ring with room for `capacity` undelivered frames.
pub fn frame_ring(capacity: usize) -> (FrameSender, FrameRing) {
    let shared = Arc::new(RingShared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        available: Condvar::new(),
        capacity: capacity.max(1),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    (
        FrameSender {
            shared: Arc::clone(&shared),
        },
        FrameRing { shared },
    )
}

impl FrameSender {
    /// Push a frame, evicting the oldest one if the ring is full.
    pub fn push(&self, frame: VisionFrame) {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.shared.capacity {
            queue.pop_front();
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                debug!(dropped, "frame ring full, evicting oldest frame");
            }
        }
        queue.push_back(frame);
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Mark the stream ended; pending frames remain readable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.available.notify_all();
    }

    /// Total frames evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSource for FrameRing {
    fn recv_frame(&mut self, timeout: Duration) -> Option<VisionFrame> {
        let mut queue = self.shared.queue.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                return Some(frame);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            let (guard, wait) = self
                .shared
                .available
                .wait_timeout(queue, timeout)
                .unwrap();
            queue = guard;
            if wait.timed_out() {
                return queue.pop_front();
            }
        }
    }
}

/// Configuration for the synthetic frame source.
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    pub fps: u32,
    /// Simulated pixel buffer size in bytes
    pub frame_size: usize,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            fps: 20,
            frame_size: 4096,
        }
    }
}

/// Start a synthetic frame generator feeding `tx` at the configured fps.
///
/// Runs until the returned task is dropped with the runtime or all ring
/// consumers disappear. Used by `roadlogd` in place of real camera
/// hardware and by the integration tests.
pub fn start_test_source(config: TestSourceConfig, tx: FrameSender) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_micros(1_000_000 / config.fps.max(1) as u64));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut frame_id = 0u64;
        let start = tokio::time::Instant::now();

        info!(fps = config.fps, frame_size = config.frame_size, "test frame source started");

        loop {
            interval.tick().await;

            let mut data = Vec::with_capacity(config.frame_size);
            data.extend_from_slice(&frame_id.to_be_bytes());
            while data.len() < config.frame_size {
                data.push((frame_id & 0xFF) as u8);
            }

            tx.push(VisionFrame {
                frame_id,
                timestamp_us: start.elapsed().as_micros() as u64,
                data: Bytes::from(data),
            });
            frame_id += 1;
        }
    })
}
