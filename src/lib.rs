//! roadlog: vehicle camera logging daemon core
//!
//! Consumes live camera frames from a vision bus, drives one or more
//! encoder variants per camera, tags every encoded frame with ordering
//! metadata published on a process-wide event bus, and groups output
//! into fixed-duration, independently replayable segments with a
//! retention marker honored by space reclaim.
//!
//! The pieces, leaf first:
//!
//! 1. **Registry**: static per-camera encoder variant tables, selected
//!    by runtime mode (recording vs livestream) at process start
//! 2. **Camera threads**: one dedicated thread per physical camera
//!    fanning frames out to its variants
//! 3. **Rotation coordinator**: segment boundaries (frame-count, with
//!    wall-clock fallback when every camera is dead) behind a
//!    flush/ack/resume barrier
//! 4. **Preserve**: xattr retention marking and the sweep that honors it
//!
//! External collaborators (vision bus transport, inter-process bus
//! transport, non-video log writing, codec internals) sit behind the
//! `FrameSource` and `Encoder` seams.

pub mod bus;
pub mod camera;
pub mod config;
pub mod encoder;
pub mod preserve;
pub mod registry;
pub mod rotation;
pub mod vision;

pub use bus::{EncodeIndex, LocalBus};
pub use camera::{CameraCounters, CameraHandle, Control, FlushAck};
pub use config::Config;
pub use encoder::{Encoder, EncoderSlot, WriterEncoder};
pub use registry::{
    build_cameras, CameraId, Codec, EncoderVariant, PhysicalCamera, RuntimeMode, MAIN_FPS,
    NO_CAMERA_PATIENCE,
};
pub use rotation::{
    Coordinator, CoordinatorHandle, RotationMode, Segment, SegmentConfig, SegmentRecord,
};
pub use vision::{frame_ring, FrameRing, FrameSender, FrameSource, VisionFrame};
