use crate::models::error::{BrowserError, Result};
use log::{debug, trace};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

const COPY_SUFFIX: &str = " - Copy";

/// Finds a sibling of `path` that does not exist yet, following the
/// `name - Copy.ext`, `name - Copy (1).ext`, `name - Copy (2).ext` convention.
///
/// Only existence is checked, nothing is created. With `max_attempts` set,
/// gives up with [`BrowserError::TooManyCollisions`] after that many numbered
/// names were taken; without it the search is unbounded.
pub fn resolve_duplicate_path(path: &Path, max_attempts: Option<u64>) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .ok_or_else(|| BrowserError::InvalidSource {
            path: path.to_path_buf(),
            reason: "path has no file name".to_string(),
        })?;
    let extension = path.extension();
    let directory = path.parent().unwrap_or_else(|| Path::new(""));

    let candidate = directory.join(copy_name(stem, extension, None));
    if !is_taken(&candidate) {
        debug!("Resolved duplicate of {} to {}", path.display(), candidate.display());
        return Ok(candidate);
    }

    let mut counter: u64 = 1;
    loop {
        if let Some(limit) = max_attempts {
            if counter > limit {
                return Err(BrowserError::TooManyCollisions {
                    path: path.to_path_buf(),
                    attempts: limit,
                });
            }
        }

        let candidate = directory.join(copy_name(stem, extension, Some(counter)));
        if !is_taken(&candidate) {
            debug!("Resolved duplicate of {} to {}", path.display(), candidate.display());
            return Ok(candidate);
        }
        trace!("{} is taken", candidate.display());
        counter += 1;
    }
}

/// Builds `stem - Copy[ (n)][.ext]`.
pub fn copy_name(stem: &OsStr, extension: Option<&OsStr>, counter: Option<u64>) -> OsString {
    let mut name = OsString::from(stem);
    name.push(COPY_SUFFIX);
    if let Some(n) = counter {
        name.push(format!(" ({})", n));
    }
    if let Some(ext) = extension {
        name.push(".");
        name.push(ext);
    }
    name
}

// A dangling symlink still occupies the name.
fn is_taken(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}
