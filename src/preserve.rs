//! Segment retention marking and space reclaim
//!
//! A completed segment of interest is flagged with a persistent extended
//! attribute on its directory; the space-reclaiming sweep skips flagged
//! directories regardless of age or space pressure. Losing a flagged
//! segment is a correctness failure for the product, so marking failures
//! are surfaced, never swallowed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Extended attribute marking a segment directory as must-preserve.
pub const PRESERVE_ATTR_NAME: &str = "user.preserve";
pub const PRESERVE_ATTR_VALUE: &[u8] = b"1";

/// Set the preserve marker on a segment directory. Idempotent: marking
/// twice leaves exactly one marker set.
pub fn mark_preserved(dir: &Path) -> Result<()> {
    xattr::set(dir, PRESERVE_ATTR_NAME, PRESERVE_ATTR_VALUE)
        .with_context(|| format!("setting {} on {}", PRESERVE_ATTR_NAME, dir.display()))
}

/// Whether a segment directory bears the preserve marker.
pub fn is_preserved(dir: &Path) -> bool {
    matches!(
        xattr::get(dir, PRESERVE_ATTR_NAME),
        Ok(Some(value)) if value == PRESERVE_ATTR_VALUE
    )
}

/// Delete oldest unpreserved segment directories until total usage under
/// `root` fits within `max_bytes`. Preserved directories are never
/// touched. Returns bytes reclaimed.
pub fn sweep(root: &Path, max_bytes: u64) -> Result<u64> {
    let mut segments: Vec<(PathBuf, u64, bool)> = Vec::new();
    let mut total = 0u64;

    for entry in std::fs::read_dir(root)
        .with_context(|| format!("reading segment root {}", root.display()))?
        .flatten()
    {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let size = dir_size(&path);
        let preserved = is_preserved(&path);
        total += size;
        segments.push((path, size, preserved));
    }

    if total <= max_bytes {
        return Ok(0);
    }

    // Directory names are "<route>--<index>"; lexicographic order on the
    // fixed route prefix puts oldest segments first within a route, and
    // older routes have smaller unix-second prefixes.
    segments.sort_by(|a, b| a.0.cmp(&b.0));

    let mut reclaimed = 0u64;
    for (path, size, preserved) in segments {
        if total.saturating_sub(reclaimed) <= max_bytes {
            break;
        }
        if preserved {
            debug!(dir = %path.display(), "sweep skipping preserved segment");
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(dir = %path.display(), size, "sweep deleted segment");
                reclaimed += size;
            }
            Err(e) => warn!(dir = %path.display(), error = %e, "sweep failed to delete segment"),
        }
    }
    Ok(reclaimed)
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Free bytes on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_bytes(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    let c_path = CString::new(path.to_str().unwrap_or("/"))
        .map_err(|e| anyhow::anyhow!("invalid path: {}", e))?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            anyhow::bail!("statvfs failed: {}", std::io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}
