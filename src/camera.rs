//! Per-camera encoder thread
//!
//! One dedicated thread per physical camera receives frames in arrival
//! order and feeds every active encoder variant. All variants of a
//! camera share the same `frame_index` per source frame, so downstream
//! consumers can correlate multiple resolutions of the same moment.
//!
//! The thread blocks on the frame source for at most one frame interval;
//! a timeout is a liveness tick, counted in `missed`. Rotation arrives
//! as a control message: flush every variant (mandatory), acknowledge to
//! the coordinator, then park until the coordinator hands over the new
//! segment, the rendezvous that makes rotation a barrier.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn};

use crate::bus::LocalBus;
use crate::encoder::{Encoder, EncoderSlot};
use crate::registry::{CameraId, PhysicalCamera};
use crate::rotation::Segment;
use crate::vision::FrameSource;

/// Coordinator → camera thread control messages.
#[derive(Debug, Clone)]
pub enum Control {
    /// Flush the current segment's encoders and acknowledge.
    Rotate,
    /// Rebind to the new segment and resume encoding.
    Resume(Arc<Segment>),
    /// Flush, acknowledge, and exit.
    Stop,
}

/// Camera thread → coordinator flush acknowledgment.
#[derive(Debug, Clone)]
pub struct FlushAck {
    pub camera: CameraId,
    /// Frames encoded into the segment just flushed
    pub frames: u32,
}

/// Written only by the owning camera thread, read by the coordinator.
/// Reads may be stale by one tick; the rotation decisions only need
/// eventual sub-second correctness.
#[derive(Default)]
pub struct CameraCounters {
    /// Frames encoded into the current segment
    pub frames: AtomicU32,
    /// Consecutive frame intervals with no frame received
    pub missed: AtomicU32,
}

/// Coordinator-side handle to one running camera thread.
pub struct CameraHandle {
    pub id: CameraId,
    pub fps: u32,
    pub control_tx: mpsc::Sender<Control>,
    pub counters: Arc<CameraCounters>,
}

/// Spawn the encoder thread for one physical camera.
///
/// `encoders` pairs up with `camera.variants` in order. The worker runs
/// on a dedicated blocking thread; the returned handle is what the
/// rotation coordinator drives.
pub fn spawn(
    camera: PhysicalCamera,
    source: Box<dyn FrameSource + 'static>,
    encoders: Vec<Box<dyn Encoder>>,
    bus: Arc<LocalBus>,
    ack_tx: mpsc::Sender<FlushAck>,
    initial: Arc<Segment>,
) -> (CameraHandle, tokio::task::JoinHandle<()>) {
    debug_assert_eq!(camera.variants.len(), encoders.len());

    let (control_tx, control_rx) = mpsc::channel(4);
    let counters = Arc::new(CameraCounters::default());

    let handle = CameraHandle {
        id: camera.id,
        fps: camera.fps,
        control_tx,
        counters: Arc::clone(&counters),
    };

    let worker = CameraWorker {
        camera,
        source,
        slots: Vec::new(),
        encoders: Some(encoders),
        bus,
        counters,
        control_rx,
        ack_tx,
    };
    let join = tokio::task::spawn_blocking(move || worker.run(initial));

    (handle, join)
}

struct CameraWorker {
    camera: PhysicalCamera,
    source: Box<dyn FrameSource>,
    slots: Vec<EncoderSlot>,
    encoders: Option<Vec<Box<dyn Encoder>>>,
    bus: Arc<LocalBus>,
    counters: Arc<CameraCounters>,
    control_rx: mpsc::Receiver<Control>,
    ack_tx: mpsc::Sender<FlushAck>,
}

impl CameraWorker {
    fn run(mut self, initial: Arc<Segment>) {
        let span = info_span!("camera", name = self.camera.thread_name);
        let _guard = span.enter();

        let encoders = match self.encoders.take() {
            Some(e) => e,
            None => return,
        };
        self.slots = self
            .camera
            .variants
            .iter()
            .cloned()
            .zip(encoders)
            .map(|(variant, encoder)| EncoderSlot::new(variant, encoder))
            .collect();

        let tick = Duration::from_micros(1_000_000 / self.camera.fps.max(1) as u64);
        let mut segment = initial;
        for slot in &mut self.slots {
            slot.bind_segment(&segment.dir);
        }

        info!(
            segment = segment.index,
            variants = self.slots.len(),
            "camera encoder thread started"
        );

        // Position within the current segment, shared by all variants
        let mut frame_index: u32 = 0;

        loop {
            match self.control_rx.try_recv() {
                Ok(Control::Rotate) => {
                    match self.rotate(frame_index) {
                        Some(next) => {
                            segment = next;
                            frame_index = 0;
                        }
                        None => break,
                    }
                    continue;
                }
                Ok(Control::Resume(_)) => {
                    warn!("unexpected resume outside rotation, ignoring");
                    continue;
                }
                Ok(Control::Stop) => {
                    self.flush_and_ack(frame_index);
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    // Coordinator is gone; flush so nothing buffered is lost
                    for slot in &mut self.slots {
                        slot.flush();
                    }
                    break;
                }
            }

            match self.source.recv_frame(tick) {
                Some(frame) => {
                    self.counters.missed.store(0, Ordering::Relaxed);
                    for slot in &mut self.slots {
                        slot.encode(&frame, segment.index, frame_index, &self.bus);
                    }
                    frame_index += 1;
                    self.counters.frames.store(frame_index, Ordering::Relaxed);
                }
                None => {
                    self.counters.missed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        info!("camera encoder thread exiting");
    }

    /// Barrier protocol, camera side: flush, acknowledge, park until the
    /// coordinator publishes the new segment, rebind.
    fn rotate(&mut self, frames: u32) -> Option<Arc<Segment>> {
        self.flush_and_ack(frames);

        loop {
            match self.control_rx.blocking_recv() {
                Some(Control::Resume(next)) => {
                    for slot in &mut self.slots {
                        slot.bind_segment(&next.dir);
                    }
                    debug!(segment = next.index, "rebound to new segment");
                    return Some(next);
                }
                Some(Control::Stop) | None => return None,
                Some(Control::Rotate) => {
                    warn!("duplicate rotate while awaiting resume, ignoring");
                }
            }
        }
    }

    fn flush_and_ack(&mut self, frames: u32) {
        for slot in &mut self.slots {
            slot.flush();
        }
        // Zero the shared counter before the ack goes out: the coordinator
        // reads it again as soon as all acks are in, and a stale
        // at-threshold value would fire a spurious back-to-back rotation.
        self.counters.frames.store(0, Ordering::Relaxed);
        let ack = FlushAck {
            camera: self.camera.id,
            frames,
        };
        if self.ack_tx.blocking_send(ack).is_err() {
            warn!("coordinator dropped ack channel");
        }
    }
}
