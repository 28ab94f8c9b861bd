//! Process configuration and runtime mode selection
//!
//! Everything is read exactly once at startup into an explicit `Config`
//! passed to constructors, never from global scope at arbitrary points,
//! so the registry and rotation coordinator stay deterministic and
//! testable in isolation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::registry::RuntimeMode;

/// Nominal segment duration in production.
pub const SEGMENT_LENGTH_SECS: u64 = 60;

/// Default storage budget for the space-reclaiming sweep.
const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024; // 10 GB

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory; one subdirectory per segment
    pub root: PathBuf,
    /// Nominal segment duration (60 s unless overridden under test mode)
    pub segment_length: Duration,
    /// Logged camera set vs livestream set; chosen once, never switched
    pub mode: RuntimeMode,
    /// Persisted privacy gate for the driver camera's recorded variant
    pub record_front: bool,
    /// Storage budget enforced by the periodic sweep
    pub max_bytes: u64,
}

impl Config {
    /// Read configuration from the environment and argv.
    pub fn from_env() -> Result<Self> {
        let root = std::env::var("ROADLOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/roadlog/segments"));

        let test_mode = std::env::var("ROADLOG_TEST").is_ok_and(|v| v != "0" && !v.is_empty());
        let override_secs = std::env::var("ROADLOG_SEGMENT_LENGTH")
            .ok()
            .and_then(|s| s.parse().ok());
        let segment_length = segment_length_from(test_mode, override_secs);

        let args: Vec<String> = std::env::args().collect();
        let livestream = args.iter().any(|arg| arg == "--livestream")
            || std::env::var("ROADLOG_LIVESTREAM").is_ok_and(|v| v == "1");
        let mode = if livestream {
            RuntimeMode::Livestream
        } else {
            RuntimeMode::Recording
        };

        let params_root = std::env::var("ROADLOG_PARAMS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/roadlog/params"));
        let record_front = read_bool_param(&params_root, "RecordFront");

        let max_bytes = std::env::var("ROADLOG_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_BYTES);

        if test_mode {
            warn!(
                segment_length_s = segment_length.as_secs_f64(),
                "test mode: non-default segment length"
            );
        }

        Ok(Self {
            root,
            segment_length,
            mode,
            record_front,
            max_bytes,
        })
    }
}

/// The test-mode override selects a shorter nominal segment duration for
/// accelerated testing; in normal operation duration is fixed at 60 s.
fn segment_length_from(test_mode: bool, override_secs: Option<u64>) -> Duration {
    match (test_mode, override_secs) {
        (true, Some(secs)) if secs > 0 => Duration::from_secs(secs),
        _ => Duration::from_secs(SEGMENT_LENGTH_SECS),
    }
}

/// Read one persisted boolean parameter. Absent or unreadable parameters
/// default to false (the privacy-safe reading for RecordFront).
pub fn read_bool_param(params_root: &Path, name: &str) -> bool {
    let path = params_root.join(name);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let value = contents.trim();
            value == "1" || value.eq_ignore_ascii_case("true")
        }
        Err(e) => {
            info!(param = name, error = %e, "param not readable, defaulting to false");
            false
        }
    }
}
