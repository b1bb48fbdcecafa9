use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;

/// One file shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRow {
    pub name: String,
    pub last_modified: DateTime<Local>,
    pub size: u64,
    /// Filled in by a processing batch. `None` until the row's timer fires.
    pub delay: Option<u64>,
}

impl FileRow {
    pub fn new(name: String, last_modified: DateTime<Local>, size: u64) -> Self {
        Self {
            name,
            last_modified,
            size,
            delay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderDetails {
    pub name: String,
    pub path: PathBuf,
    pub last_modified: DateTime<Local>,
}

/// Everything listed for a selected folder: subfolders first, then files.
#[derive(Debug, Clone, Serialize)]
pub struct FolderContents {
    pub folder: PathBuf,
    pub folders: Vec<PathBuf>,
    pub files: Vec<FileRow>,
}
