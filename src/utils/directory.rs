use crate::models::error::{BrowserError, Result};
use crate::models::file_row::{FileRow, FolderContents, FolderDetails};
use chrono::{DateTime, Local};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

/// Lists the direct children of `dir`: subfolders as full paths, files as rows.
/// Both lists are sorted by name.
pub fn load_folder_contents(dir: &Path, show_hidden: bool) -> Result<FolderContents> {
    ensure_directory(dir)?;

    let mut folders = Vec::new();
    let mut files = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };

        if !show_hidden && is_hidden(&entry) {
            continue;
        }

        if entry.file_type().is_dir() {
            folders.push(entry.path().to_path_buf());
            continue;
        }

        let metadata = entry.metadata().map_err(|e| BrowserError::MetadataError {
            path: entry.path().to_path_buf(),
            cause: e.into(),
        })?;
        let last_modified = modified_time(entry.path(), &metadata)?;

        files.push(FileRow::new(
            entry.file_name().to_string_lossy().into_owned(),
            last_modified,
            metadata.len(),
        ));
    }

    debug!(
        "Loaded {} folders and {} files from {}",
        folders.len(),
        files.len(),
        dir.display()
    );

    Ok(FolderContents {
        folder: dir.to_path_buf(),
        folders,
        files,
    })
}

/// Name and last-modified time of a folder, for the details view.
pub fn folder_details(folder: &Path) -> Result<FolderDetails> {
    ensure_directory(folder)?;

    let metadata = fs::metadata(folder).map_err(|cause| BrowserError::MetadataError {
        path: folder.to_path_buf(),
        cause,
    })?;

    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.display().to_string());

    Ok(FolderDetails {
        name,
        path: folder.to_path_buf(),
        last_modified: modified_time(folder, &metadata)?,
    })
}

fn ensure_directory(dir: &Path) -> Result<()> {
    let metadata = fs::metadata(dir).map_err(|cause| BrowserError::DirectoryRead {
        path: dir.to_path_buf(),
        cause,
    })?;

    if !metadata.is_dir() {
        return Err(BrowserError::DirectoryRead {
            path: dir.to_path_buf(),
            cause: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        });
    }

    // A directory can be stat-able but not listable.
    fs::read_dir(dir).map_err(|cause| BrowserError::DirectoryRead {
        path: dir.to_path_buf(),
        cause,
    })?;

    Ok(())
}

fn modified_time(path: &Path, metadata: &fs::Metadata) -> Result<DateTime<Local>> {
    let modified = metadata
        .modified()
        .map_err(|cause| BrowserError::MetadataError {
            path: path.to_path_buf(),
            cause,
        })?;
    Ok(DateTime::<Local>::from(modified))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}
