//! Segment rotation coordinator
//!
//! Owns segment numbering and the rotation state machine. Segments are
//! fixed-duration units of log output; under normal operation a boundary
//! fires when the first camera reaches `fps * segment_length` frames.
//! When every camera has been silent past the patience threshold the
//! coordinator falls back to wall-clock rotation so logging keeps
//! producing segments with zero camera input.
//!
//! Rotation is a barrier: every camera thread must acknowledge the flush
//! of the old segment before any thread is handed the new one. This is
//! the only cross-thread synchronization point in the pipeline; between
//! barriers the current segment is read-only to camera threads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::camera::{CameraHandle, Control, FlushAck};
use crate::preserve;

/// How long to wait for camera flush acknowledgments before declaring
/// the barrier broken.
const FLUSH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// One rotation period's output directory. Created by the coordinator,
/// read-only to camera threads between barriers.
#[derive(Debug)]
pub struct Segment {
    /// Monotonically increasing, process-lifetime-unique
    pub index: u64,
    pub dir: PathBuf,
}

/// What fired a segment boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// Normal: first camera reaching its frame-count threshold
    FrameCount,
    /// Degraded: all cameras silent, wall-clock elapsed time
    WallClock,
}

/// A finalized segment. Immutable once the next segment has been opened.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub index: u64,
    pub dir: PathBuf,
    /// Frames each camera encoded into this segment
    pub frames: HashMap<crate::registry::CameraId, u32>,
    pub duration: Duration,
    pub closed_by: RotationMode,
    pub preserved: bool,
}

/// Rotation configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Root directory; one subdirectory per segment
    pub root: PathBuf,
    /// Nominal segment duration (60 s in production, shorter under test)
    pub segment_length: Duration,
    /// Consecutive missed frame intervals before a camera counts as dead
    pub patience: u32,
}

/// External control over a running coordinator.
pub struct CoordinatorHandle {
    preserve_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl CoordinatorHandle {
    /// Flag the current segment as must-preserve (e.g. on a crash or
    /// disengagement event). The marker is set immediately.
    pub async fn preserve_current(&self) {
        let _ = self.preserve_tx.send(()).await;
    }

    /// Begin coordinated shutdown: every camera flushes its encoders
    /// before the coordinator returns.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub struct Coordinator {
    cfg: SegmentConfig,
    cameras: Vec<CameraHandle>,
    ack_rx: mpsc::Receiver<FlushAck>,
    preserve_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,

    /// Route identifier prefixed to segment directory names
    route_id: u64,
    next_index: u64,
    current: Arc<Segment>,
    started_at: Instant,
    mode: RotationMode,
    preserve_requested: bool,
    preserve_marked: bool,

    records: Vec<SegmentRecord>,
    records_tx: Option<mpsc::Sender<SegmentRecord>>,
}

impl Coordinator {
    /// Create the coordinator and open segment 0.
    ///
    /// Returns the handle, the initial segment for camera threads, and
    /// the ack sender each camera thread gets a clone of. Cameras are
    /// attached with [`add_camera`](Self::add_camera) before `run`.
    pub fn new(
        cfg: SegmentConfig,
    ) -> Result<(Self, CoordinatorHandle, Arc<Segment>, mpsc::Sender<FlushAck>)> {
        let route_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let (ack_tx, ack_rx) = mpsc::channel(16);
        let (preserve_tx, preserve_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let current = Arc::new(create_segment(&cfg.root, route_id, 0)?);

        let coordinator = Self {
            cfg,
            cameras: Vec::new(),
            ack_rx,
            preserve_rx,
            shutdown_rx,
            route_id,
            next_index: 1,
            current: Arc::clone(&current),
            started_at: Instant::now(),
            mode: RotationMode::FrameCount,
            preserve_requested: false,
            preserve_marked: false,
            records: Vec::new(),
            records_tx: None,
        };
        let handle = CoordinatorHandle {
            preserve_tx,
            shutdown_tx,
        };

        Ok((coordinator, handle, current, ack_tx))
    }

    pub fn add_camera(&mut self, camera: CameraHandle) {
        self.cameras.push(camera);
    }

    /// Stream finalized segment records as they close.
    pub fn segment_records(&mut self) -> mpsc::Receiver<SegmentRecord> {
        let (tx, rx) = mpsc::channel(16);
        self.records_tx = Some(tx);
        rx
    }

    /// Drive rotation until shutdown. Returns every finalized segment,
    /// including the one open at shutdown.
    pub async fn run(mut self) -> Result<Vec<SegmentRecord>> {
        if self.cameras.is_empty() {
            bail!("coordinator started with no cameras");
        }

        // Tick at the shortest frame interval among the cameras; liveness
        // reads may be stale by one tick, which is acceptable.
        let max_fps = self.cameras.iter().map(|c| c.fps).max().unwrap_or(20);
        let tick = Duration::from_micros(1_000_000 / max_fps.max(1) as u64);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut preserve_closed = false;

        info!(
            segment = self.current.index,
            segment_length_s = self.cfg.segment_length.as_secs_f64(),
            cameras = self.cameras.len(),
            "rotation coordinator running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // A due boundary fires before any mode transition
                    if self.rotation_due() {
                        self.rotate(self.mode).await?;
                    }
                    self.check_fallback_entry();
                }
                msg = self.preserve_rx.recv(), if !preserve_closed => {
                    match msg {
                        Some(()) => self.preserve_now(),
                        None => preserve_closed = true,
                    }
                }
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown_flush().await?;
        Ok(self.records)
    }

    fn rotation_due(&self) -> bool {
        match self.mode {
            RotationMode::FrameCount => self.cameras.iter().any(|camera| {
                let threshold =
                    (camera.fps as f64 * self.cfg.segment_length.as_secs_f64()).round() as u32;
                camera.counters.frames.load(std::sync::atomic::Ordering::Relaxed)
                    >= threshold.max(1)
            }),
            RotationMode::WallClock => self.started_at.elapsed() >= self.cfg.segment_length,
        }
    }

    fn all_cameras_dead(&self) -> bool {
        self.cameras.iter().all(|camera| {
            camera.counters.missed.load(std::sync::atomic::Ordering::Relaxed) > self.cfg.patience
        })
    }

    fn any_camera_alive(&self) -> bool {
        !self.all_cameras_dead()
    }

    /// Fallback is entered only when every camera is silent past the
    /// patience threshold simultaneously. A single dead camera is not an
    /// error; all of them at once is reportable.
    fn check_fallback_entry(&mut self) {
        if self.mode == RotationMode::FrameCount && self.all_cameras_dead() {
            error!(
                patience = self.cfg.patience,
                "all cameras silent, falling back to time-based segment rotation"
            );
            self.mode = RotationMode::WallClock;
        }
    }

    /// The rotation barrier: flush request to every camera, wait for all
    /// acknowledgments, finalize the old segment, open the new one, and
    /// only then let any camera resume.
    async fn rotate(&mut self, closed_by: RotationMode) -> Result<()> {
        debug!(segment = self.current.index, ?closed_by, "rotation boundary");

        let expected = self.broadcast(Control::Rotate).await;
        let frames = self.collect_acks(expected).await?;
        self.finalize(frames, closed_by);

        let next = Arc::new(create_segment(&self.cfg.root, self.route_id, self.next_index)?);
        self.next_index += 1;
        self.current = Arc::clone(&next);
        self.started_at = Instant::now();

        self.broadcast(Control::Resume(next)).await;

        info!(segment = self.current.index, "rotated to new segment");

        // Mode recovers to frame-count at the completion of the first
        // boundary after any camera resumes; that boundary itself was
        // still time-driven.
        if self.mode == RotationMode::WallClock && self.any_camera_alive() {
            info!("camera frames resumed, returning to frame-count rotation");
            self.mode = RotationMode::FrameCount;
        }
        Ok(())
    }

    /// Send a control message to every camera thread; returns how many
    /// deliveries succeeded (dead threads are skipped, not waited on).
    async fn broadcast(&self, msg: Control) -> usize {
        let mut delivered = 0;
        for camera in &self.cameras {
            match camera.control_tx.send(msg.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => warn!(camera = %camera.id, "camera thread unreachable"),
            }
        }
        delivered
    }

    async fn collect_acks(
        &mut self,
        expected: usize,
    ) -> Result<HashMap<crate::registry::CameraId, u32>> {
        let mut frames = HashMap::new();
        for _ in 0..expected {
            let ack = tokio::time::timeout(FLUSH_ACK_TIMEOUT, self.ack_rx.recv())
                .await
                .context("timed out waiting for encoder flush acknowledgment")?;
            match ack {
                Some(ack) => {
                    frames.insert(ack.camera, ack.frames);
                }
                None => bail!("camera threads gone during rotation"),
            }
        }
        Ok(frames)
    }

    fn finalize(
        &mut self,
        frames: HashMap<crate::registry::CameraId, u32>,
        closed_by: RotationMode,
    ) {
        // A flagged segment that could not be marked earlier gets one
        // more attempt before it becomes immutable.
        if self.preserve_requested && !self.preserve_marked {
            self.preserve_now();
        }

        let record = SegmentRecord {
            index: self.current.index,
            dir: self.current.dir.clone(),
            frames,
            duration: self.started_at.elapsed(),
            closed_by,
            preserved: self.preserve_marked,
        };
        if let Some(tx) = &self.records_tx {
            let _ = tx.try_send(record.clone());
        }
        self.records.push(record);
        self.preserve_requested = false;
        self.preserve_marked = false;
    }

    /// Mark the current segment's directory for retention. Idempotent.
    /// A marking failure risks losing a flagged segment, so it is
    /// surfaced loudly rather than swallowed.
    fn preserve_now(&mut self) {
        self.preserve_requested = true;
        match preserve::mark_preserved(&self.current.dir) {
            Ok(()) => {
                info!(segment = self.current.index, "segment marked preserved");
                self.preserve_marked = true;
            }
            Err(e) => {
                error!(
                    segment = self.current.index,
                    dir = %self.current.dir.display(),
                    error = %e,
                    "FAILED to mark segment preserved; flagged data is at risk"
                );
            }
        }
    }

    /// Shutdown is not clean until every camera acknowledged the flush
    /// of the final segment.
    async fn shutdown_flush(&mut self) -> Result<()> {
        info!("shutting down, flushing all camera encoders");
        let expected = self.broadcast(Control::Stop).await;
        let frames = self.collect_acks(expected).await?;
        self.finalize(frames, self.mode);
        info!(segments = self.records.len(), "shutdown flush complete");
        Ok(())
    }
}

fn create_segment(root: &std::path::Path, route_id: u64, index: u64) -> Result<Segment> {
    let dir = root.join(format!("{route_id}--{index}"));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating segment directory {}", dir.display()))?;
    Ok(Segment { index, dir })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraCounters;
    use crate::registry::CameraId;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Emulated camera thread: flushes on Rotate (zeroing the shared
    /// counter before the ack, like the real worker), logs barrier events.
    fn fake_camera(
        id: CameraId,
        fps: u32,
        ack_tx: mpsc::Sender<FlushAck>,
        log: Arc<Mutex<Vec<(CameraId, String, u64)>>>,
    ) -> (CameraHandle, std::thread::JoinHandle<()>) {
        let (control_tx, mut control_rx) = mpsc::channel(4);
        let counters = Arc::new(CameraCounters::default());
        let thread_counters = Arc::clone(&counters);

        let join = std::thread::spawn(move || {
            loop {
                match control_rx.blocking_recv() {
                    Some(Control::Rotate) => {
                        let frames = thread_counters.frames.swap(0, Ordering::Relaxed);
                        log.lock().unwrap().push((id, "flush".into(), 0));
                        ack_tx.blocking_send(FlushAck { camera: id, frames }).unwrap();
                    }
                    Some(Control::Resume(seg)) => {
                        log.lock().unwrap().push((id, "resume".into(), seg.index));
                    }
                    Some(Control::Stop) => {
                        let frames = thread_counters.frames.load(Ordering::Relaxed);
                        let _ = ack_tx.blocking_send(FlushAck { camera: id, frames });
                        break;
                    }
                    None => break,
                }
            }
        });

        (
            CameraHandle {
                id,
                fps,
                control_tx,
                counters,
            },
            join,
        )
    }

    fn test_config(root: &std::path::Path, segment_length: Duration, patience: u32) -> SegmentConfig {
        SegmentConfig {
            root: root.to_path_buf(),
            segment_length,
            patience,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn barrier_all_flushes_precede_any_resume() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Duration::from_secs(1), 500);
        let (mut coordinator, handle, _seg0, ack_tx) = Coordinator::new(cfg).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut joins = Vec::new();
        for id in [CameraId::Road, CameraId::WideRoad, CameraId::Driver] {
            let (camera, join) = fake_camera(id, 10, ack_tx.clone(), Arc::clone(&log));
            // threshold = 10 frames; pretend every camera is at it
            camera.counters.frames.store(10, Ordering::Relaxed);
            coordinator.add_camera(camera);
            joins.push(join);
        }
        drop(ack_tx);

        let mut records_rx = coordinator.segment_records();
        let run = tokio::spawn(coordinator.run());

        let first = tokio::time::timeout(Duration::from_secs(5), records_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.closed_by, RotationMode::FrameCount);
        assert_eq!(first.frames.len(), 3);
        assert_eq!(first.frames[&CameraId::Road], 10);

        handle.shutdown();
        let records = run.await.unwrap().unwrap();
        assert_eq!(records.last().unwrap().index, 1);

        for join in joins {
            join.join().unwrap();
        }

        // Barrier property: every flush for segment N precedes every
        // resume into segment N+1.
        let log = log.lock().unwrap();
        let resume_positions: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, (_, what, seg))| what == "resume" && *seg == 1)
            .map(|(i, _)| i)
            .collect();
        let flush_positions: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, (_, what, _))| what == "flush")
            .map(|(i, _)| i)
            .take(3)
            .collect();
        assert_eq!(resume_positions.len(), 3);
        assert_eq!(flush_positions.len(), 3);
        assert!(flush_positions.iter().max() < resume_positions.iter().min());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_live_camera_prevents_fallback() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Duration::from_millis(100), 2);
        let (mut coordinator, handle, _seg0, ack_tx) = Coordinator::new(cfg).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut joins = Vec::new();
        let mut handles = Vec::new();
        for id in [CameraId::Road, CameraId::WideRoad] {
            let (camera, join) = fake_camera(id, 50, ack_tx.clone(), Arc::clone(&log));
            handles.push(Arc::clone(&camera.counters));
            coordinator.add_camera(camera);
            joins.push(join);
        }
        drop(ack_tx);

        // Road dead, WideRoad alive: no fallback, and no frame-count
        // boundary either since nobody reaches the threshold.
        handles[0].missed.store(100, Ordering::Relaxed);
        handles[1].missed.store(0, Ordering::Relaxed);

        let mut records_rx = coordinator.segment_records();
        let run = tokio::spawn(coordinator.run());

        let rotated =
            tokio::time::timeout(Duration::from_millis(400), records_rx.recv()).await;
        assert!(rotated.is_err(), "must not rotate with one camera alive");

        handle.shutdown();
        run.await.unwrap().unwrap();
        for join in joins {
            join.join().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn all_dead_cameras_trigger_wall_clock_rotation() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Duration::from_millis(200), 2);
        let (mut coordinator, handle, _seg0, ack_tx) = Coordinator::new(cfg).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut joins = Vec::new();
        for id in [CameraId::Road, CameraId::WideRoad] {
            let (camera, join) = fake_camera(id, 50, ack_tx.clone(), Arc::clone(&log));
            camera.counters.missed.store(100, Ordering::Relaxed);
            coordinator.add_camera(camera);
            joins.push(join);
        }
        drop(ack_tx);

        let mut records_rx = coordinator.segment_records();
        let run = tokio::spawn(coordinator.run());

        // Two consecutive wall-clock segments with zero frames
        for expected_index in 0..2 {
            let record = tokio::time::timeout(Duration::from_secs(5), records_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.index, expected_index);
            assert_eq!(record.closed_by, RotationMode::WallClock);
            assert!(record.frames.values().all(|&f| f == 0));
        }

        handle.shutdown();
        run.await.unwrap().unwrap();
        for join in joins {
            join.join().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn segment_indices_strictly_increase() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), Duration::from_millis(100), 1);
        let (mut coordinator, handle, seg0, ack_tx) = Coordinator::new(cfg).unwrap();
        assert_eq!(seg0.index, 0);

        let log = Arc::new(Mutex::new(Vec::new()));
        let (camera, join) = fake_camera(CameraId::Road, 50, ack_tx.clone(), Arc::clone(&log));
        camera.counters.missed.store(100, Ordering::Relaxed);
        coordinator.add_camera(camera);
        drop(ack_tx);

        let run = tokio::spawn(coordinator.run());
        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.shutdown();
        let records = run.await.unwrap().unwrap();
        join.join().unwrap();

        assert!(records.len() >= 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.index, i as u64);
            assert!(record.dir.is_dir());
        }
    }
}
