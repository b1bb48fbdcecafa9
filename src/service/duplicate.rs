use crate::models::config::Config;
use crate::models::error::{BrowserError, Result};
use crate::service::name_resolver::resolve_duplicate_path;
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Copies `source` next to itself under the first free `- Copy` name and
/// returns the new path.
///
/// The destination is opened with `create_new`, so a name taken by someone
/// else after it was resolved is never overwritten: the name is resolved
/// again and the copy retried, up to `config.max_copy_races` times.
pub fn duplicate_file(source: &Path, config: &Config) -> Result<PathBuf> {
    duplicate_file_with(source, config, resolve_duplicate_path)
}

/// The name `duplicate_file` would pick right now, without copying anything.
pub fn preview_duplicate(source: &Path, config: &Config) -> Result<PathBuf> {
    check_source(source)?;
    resolve_duplicate_path(source, config.max_copy_attempts)
}

fn duplicate_file_with<F>(source: &Path, config: &Config, mut resolve: F) -> Result<PathBuf>
where
    F: FnMut(&Path, Option<u64>) -> Result<PathBuf>,
{
    let metadata = check_source(source)?;

    let mut last_target = None;
    for attempt in 1..=config.max_copy_races {
        let target = resolve(source, config.max_copy_attempts)?;

        match copy_to_new_file(source, &target, &metadata) {
            Ok(bytes) => {
                info!(
                    "Duplicated {} to {} ({} bytes)",
                    source.display(),
                    target.display(),
                    bytes
                );
                return Ok(target);
            }
            Err(cause) if cause.kind() == io::ErrorKind::AlreadyExists => {
                warn!(
                    "{} was created by someone else before the copy (attempt {}/{}), resolving again",
                    target.display(),
                    attempt,
                    config.max_copy_races
                );
                last_target = Some(target);
            }
            Err(cause) => {
                return Err(BrowserError::FileCopy {
                    from: source.to_path_buf(),
                    to: target,
                    cause,
                });
            }
        }
    }

    Err(BrowserError::FileCopy {
        from: source.to_path_buf(),
        to: last_target.unwrap_or_default(),
        cause: io::Error::new(
            io::ErrorKind::AlreadyExists,
            "every resolved copy name was taken before it could be created",
        ),
    })
}

fn check_source(source: &Path) -> Result<fs::Metadata> {
    let metadata = fs::metadata(source).map_err(|cause| BrowserError::MetadataError {
        path: source.to_path_buf(),
        cause,
    })?;
    if !metadata.is_file() {
        return Err(BrowserError::InvalidSource {
            path: source.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }
    Ok(metadata)
}

/// Whole-file copy into a file that must not exist yet. Removes the
/// half-written destination when the copy fails.
fn copy_to_new_file(source: &Path, target: &Path, metadata: &fs::Metadata) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(source)?);
    let dest = OpenOptions::new().write(true).create_new(true).open(target)?;

    let result = (|| -> io::Result<u64> {
        let mut writer = BufWriter::new(dest);
        let bytes = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        let dest = writer.into_inner().map_err(|e| e.into_error())?;
        dest.set_permissions(metadata.permissions())?;
        if let Ok(modified) = metadata.modified() {
            if let Err(e) = dest.set_modified(modified) {
                warn!("Could not keep modification time on {}: {}", target.display(), e);
            }
        }
        Ok(bytes)
    })();

    if result.is_err() {
        if let Err(e) = fs::remove_file(target) {
            warn!("Failed to remove partial copy {}: {}", target.display(), e);
        }
    }
    result
}
