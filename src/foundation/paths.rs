use std::time::{SystemTime, UNIX_EPOCH};

use crate::foundation::error::{AnimakeError, AnimakeResult};

/// Normalize and validate project-relative asset paths.
///
/// The normalized result uses `/` separators, removes `.` segments, and rejects absolute paths or
/// parent traversals (`..`).
pub(crate) fn normalize_rel_path(source: &str) -> AnimakeResult<String> {
    let s = source.replace('\\', "/");
    if s.starts_with('/') {
        return Err(AnimakeError::validation("asset paths must be relative"));
    }
    if s.is_empty() {
        return Err(AnimakeError::validation("asset path must be non-empty"));
    }

    let mut out = Vec::<&str>::new();
    for part in s.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return Err(AnimakeError::validation("asset paths must not contain '..'"));
        }
        out.push(part);
    }

    if out.is_empty() {
        return Err(AnimakeError::validation(
            "asset path must contain a file name",
        ));
    }

    Ok(out.join("/"))
}

/// Milliseconds since the unix epoch, saturating to 0 for clocks set before 1970.
pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
