pub mod config;
pub mod delay_assignment;
pub mod error;
pub mod file_row;
