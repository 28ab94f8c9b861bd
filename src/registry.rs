//! Encoder variant registry
//!
//! Static description of which encoder variants run per physical camera,
//! selected once at process start by runtime mode. The registry is
//! configuration-as-data: built from literals, validated eagerly, and
//! immutable for the life of the process. Mode switching requires a
//! restart, not reconfiguration.

use std::collections::HashSet;
use std::fmt;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Nominal camera cadence in frames per second.
pub const MAIN_FPS: u32 = 20;
/// Full-resolution recording bitrate budget (bytes/sec).
pub const MAIN_BITRATE: u32 = 10_000_000;
/// Low-bitrate budget for live-stream variants (bytes/sec).
pub const LIVESTREAM_BITRATE: u32 = 1_000_000;
/// Thumbnail-stream bitrate budget (bytes/sec).
pub const QCAM_BITRATE: u32 = 256_000;
/// Debug-stream bitrate budgets, sized per minute of output (bytes/sec).
pub const BITRATE_8MB: u32 = 1024 * 1024;
pub const BITRATE_16MB: u32 = 2 * 1024 * 1024;

/// Consecutive missed frame intervals before a camera counts as dead
/// for rotation-mode purposes.
pub const NO_CAMERA_PATIENCE: u32 = 500;

/// Codec selection for one encoder variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// Full-resolution HEVC recording
    FullHevc,
    /// Low-resolution H.264 thumbnail/stream ("qcam")
    QcamH264,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::FullHevc => write!(f, "hevc"),
            Codec::QcamH264 => write!(f, "qcam-h264"),
        }
    }
}

/// The process runs exactly one of these camera/encoder sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Normal on-disk logging
    Recording,
    /// Low-bitrate live streaming, nothing written to disk
    Livestream,
}

/// Identifies one physical camera stream on the vision bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraId {
    Road,
    WideRoad,
    Driver,
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraId::Road => write!(f, "road"),
            CameraId::WideRoad => write!(f, "wide_road"),
            CameraId::Driver => write!(f, "driver"),
        }
    }
}

/// One encoder instance for one physical camera.
#[derive(Debug, Clone)]
pub struct EncoderVariant {
    /// Bus topic this variant publishes encode-index events on.
    /// Unique process-wide.
    pub publish_name: &'static str,
    /// Base file name within a segment directory, if recorded.
    pub file_name: Option<&'static str>,
    /// Whether encoded output is written to disk.
    pub record: bool,
    /// Target resolution; -1/-1 means use the source resolution.
    pub frame_width: i32,
    pub frame_height: i32,
    /// Target cadence.
    pub fps: u32,
    /// Bitrate budget in bytes/sec.
    pub bitrate: u32,
    pub codec: Codec,
}

impl EncoderVariant {
    const fn hevc(publish_name: &'static str, file_name: &'static str) -> Self {
        Self {
            publish_name,
            file_name: Some(file_name),
            record: true,
            frame_width: -1,
            frame_height: -1,
            fps: MAIN_FPS,
            bitrate: MAIN_BITRATE,
            codec: Codec::FullHevc,
        }
    }

    const fn scaled(
        publish_name: &'static str,
        file_name: &'static str,
        frame_width: i32,
        frame_height: i32,
        bitrate: u32,
        codec: Codec,
    ) -> Self {
        Self {
            publish_name,
            file_name: Some(file_name),
            record: true,
            frame_width,
            frame_height,
            fps: MAIN_FPS,
            bitrate,
            codec,
        }
    }

    const fn livestream(publish_name: &'static str) -> Self {
        Self {
            publish_name,
            file_name: None,
            record: false,
            frame_width: -1,
            frame_height: -1,
            fps: MAIN_FPS,
            bitrate: LIVESTREAM_BITRATE,
            codec: Codec::QcamH264,
        }
    }
}

/// One hardware camera stream with its ordered encoder variants.
/// The first variant is the primary.
#[derive(Debug, Clone)]
pub struct PhysicalCamera {
    pub id: CameraId,
    pub thread_name: &'static str,
    pub fps: u32,
    pub variants: Vec<EncoderVariant>,
}

impl PhysicalCamera {
    /// The primary (main record) variant.
    pub fn primary(&self) -> &EncoderVariant {
        &self.variants[0]
    }
}

/// Build the camera/encoder set for `mode`, validated.
///
/// `record_front` gates whether the privacy-sensitive driver camera's
/// primary variant records; it is read once from persisted parameter
/// storage by the caller.
pub fn build_cameras(mode: RuntimeMode, record_front: bool) -> Result<Vec<PhysicalCamera>> {
    let cameras = match mode {
        RuntimeMode::Recording => vec![
            PhysicalCamera {
                id: CameraId::Road,
                thread_name: "road_cam_encoder",
                fps: MAIN_FPS,
                variants: vec![
                    EncoderVariant::hevc("roadEncodeData", "fcamera.hevc"),
                    EncoderVariant::scaled(
                        "qRoadEncodeData", "qcamera.ts", 526, 330,
                        QCAM_BITRATE, Codec::QcamH264,
                    ),
                    // Scaled-down debug streams next to the qcam
                    EncoderVariant::scaled(
                        "debug0EncodeData", "qcamera.hevc", 526, 330,
                        QCAM_BITRATE, Codec::FullHevc,
                    ),
                    EncoderVariant::scaled(
                        "debug1EncodeData", "qcamera_720.ts", 1148, 720,
                        BITRATE_8MB, Codec::QcamH264,
                    ),
                    EncoderVariant::scaled(
                        "debug2EncodeData", "qcamera_720.hevc", 1148, 720,
                        BITRATE_8MB, Codec::FullHevc,
                    ),
                    EncoderVariant::scaled(
                        "debug3EncodeData", "qcamera_720_vh.ts", 1148, 720,
                        BITRATE_16MB, Codec::QcamH264,
                    ),
                    EncoderVariant::scaled(
                        "debug4EncodeData", "qcamera_720_vh.hevc", 1148, 720,
                        BITRATE_16MB, Codec::FullHevc,
                    ),
                ],
            },
            PhysicalCamera {
                id: CameraId::WideRoad,
                thread_name: "wide_road_cam_encoder",
                fps: MAIN_FPS,
                variants: vec![EncoderVariant::hevc("wideRoadEncodeData", "ecamera.hevc")],
            },
            PhysicalCamera {
                id: CameraId::Driver,
                thread_name: "driver_cam_encoder",
                fps: MAIN_FPS,
                variants: vec![EncoderVariant {
                    record: record_front,
                    ..EncoderVariant::hevc("driverEncodeData", "dcamera.hevc")
                }],
            },
        ],
        RuntimeMode::Livestream => vec![
            PhysicalCamera {
                id: CameraId::Road,
                thread_name: "road_cam_encoder",
                fps: MAIN_FPS,
                variants: vec![EncoderVariant::livestream("livestreamRoadEncodeData")],
            },
            PhysicalCamera {
                id: CameraId::WideRoad,
                thread_name: "wide_road_cam_encoder",
                fps: MAIN_FPS,
                variants: vec![EncoderVariant::livestream("livestreamWideRoadEncodeData")],
            },
            PhysicalCamera {
                id: CameraId::Driver,
                thread_name: "driver_cam_encoder",
                fps: MAIN_FPS,
                variants: vec![EncoderVariant::livestream("livestreamDriverEncodeData")],
            },
        ],
    };

    validate(&cameras)?;
    Ok(cameras)
}

/// Reject configurations the pipeline must not run with.
pub fn validate(cameras: &[PhysicalCamera]) -> Result<()> {
    ensure!(!cameras.is_empty(), "registry has no cameras");

    let mut seen = HashSet::new();
    for camera in cameras {
        ensure!(
            !camera.variants.is_empty(),
            "camera {} has no encoder variants",
            camera.id
        );
        ensure!(camera.fps > 0, "camera {} has zero fps", camera.id);

        for variant in &camera.variants {
            if !seen.insert(variant.publish_name) {
                bail!("duplicate publish name: {}", variant.publish_name);
            }
            if variant.record && variant.file_name.is_none() {
                bail!(
                    "recorded variant {} has no file name",
                    variant.publish_name
                );
            }
            let full_res = variant.frame_width == -1 && variant.frame_height == -1;
            let scaled = variant.frame_width > 0 && variant.frame_height > 0;
            ensure!(
                full_res || scaled,
                "variant {} has invalid resolution {}x{}",
                variant.publish_name,
                variant.frame_width,
                variant.frame_height
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_set_is_valid() {
        let cameras = build_cameras(RuntimeMode::Recording, true).unwrap();
        assert_eq!(cameras.len(), 3);

        let road = &cameras[0];
        assert_eq!(road.id, CameraId::Road);
        assert_eq!(road.primary().publish_name, "roadEncodeData");
        assert_eq!(road.primary().file_name, Some("fcamera.hevc"));
        assert_eq!(road.variants.len(), 7);
        assert_eq!(road.variants[1].codec, Codec::QcamH264);
        assert_eq!(road.variants[1].frame_width, 526);
    }

    #[test]
    fn road_debug_variants_record_scaled_streams() {
        let cameras = build_cameras(RuntimeMode::Recording, true).unwrap();
        let road = &cameras[0];

        let debug0 = road
            .variants
            .iter()
            .find(|v| v.publish_name == "debug0EncodeData")
            .unwrap();
        assert_eq!(debug0.file_name, Some("qcamera.hevc"));
        assert_eq!(debug0.codec, Codec::FullHevc);
        assert_eq!((debug0.frame_width, debug0.frame_height), (526, 330));
        assert_eq!(debug0.bitrate, QCAM_BITRATE);

        // Four 720p debug rows: .ts/.hevc pairs at the 8 MB and 16 MB budgets
        for (name, file, bitrate, codec) in [
            ("debug1EncodeData", "qcamera_720.ts", BITRATE_8MB, Codec::QcamH264),
            ("debug2EncodeData", "qcamera_720.hevc", BITRATE_8MB, Codec::FullHevc),
            ("debug3EncodeData", "qcamera_720_vh.ts", BITRATE_16MB, Codec::QcamH264),
            ("debug4EncodeData", "qcamera_720_vh.hevc", BITRATE_16MB, Codec::FullHevc),
        ] {
            let v = road
                .variants
                .iter()
                .find(|v| v.publish_name == name)
                .unwrap_or_else(|| panic!("missing variant {name}"));
            assert_eq!(v.file_name, Some(file));
            assert_eq!(v.bitrate, bitrate);
            assert_eq!(v.codec, codec);
            assert_eq!((v.frame_width, v.frame_height), (1148, 720));
            assert!(v.record);
        }
    }

    #[test]
    fn livestream_set_never_records() {
        let cameras = build_cameras(RuntimeMode::Livestream, true).unwrap();
        for camera in &cameras {
            for variant in &camera.variants {
                assert!(!variant.record, "{} must not record", variant.publish_name);
                assert!(variant.file_name.is_none());
                assert_eq!(variant.bitrate, LIVESTREAM_BITRATE);
            }
        }
    }

    #[test]
    fn record_front_gates_driver_camera() {
        let cameras = build_cameras(RuntimeMode::Recording, false).unwrap();
        let driver = cameras.iter().find(|c| c.id == CameraId::Driver).unwrap();
        assert!(!driver.primary().record);
        // Still publishes its index events even when not recording
        assert_eq!(driver.primary().publish_name, "driverEncodeData");

        let cameras = build_cameras(RuntimeMode::Recording, true).unwrap();
        let driver = cameras.iter().find(|c| c.id == CameraId::Driver).unwrap();
        assert!(driver.primary().record);
    }

    #[test]
    fn duplicate_publish_name_rejected() {
        let mut cameras = build_cameras(RuntimeMode::Recording, true).unwrap();
        cameras[1].variants[0].publish_name = "roadEncodeData";
        let err = validate(&cameras).unwrap_err();
        assert!(err.to_string().contains("duplicate publish name"));
    }

    #[test]
    fn recorded_variant_without_file_name_rejected() {
        let mut cameras = build_cameras(RuntimeMode::Recording, true).unwrap();
        cameras[0].variants[0].file_name = None;
        let err = validate(&cameras).unwrap_err();
        assert!(err.to_string().contains("no file name"));
    }

    #[test]
    fn half_set_resolution_rejected() {
        let mut cameras = build_cameras(RuntimeMode::Recording, true).unwrap();
        cameras[0].variants[0].frame_width = 1920;
        assert!(validate(&cameras).is_err());
    }

    #[test]
    fn empty_variant_list_rejected() {
        let mut cameras = build_cameras(RuntimeMode::Recording, true).unwrap();
        cameras[2].variants.clear();
        assert!(validate(&cameras).is_err());
    }
}
