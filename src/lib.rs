//! Folder browsing core: listing folders, duplicating files under
//! non-colliding `- Copy` names, and delayed batch processing of file rows.

pub mod models;
pub mod service;
pub mod utils;
