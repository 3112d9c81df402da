//! File metadata, the transfer engine and its progress plumbing

pub mod entry;
pub mod ops;
pub mod progress;

pub use entry::{DirEntry, FileInfo};
pub use ops::{Transfer, calc_dir_size, copy, delete, mkdir, move_path};
pub use progress::{CancelToken, Progress, ProgressSink, ProgressThrottle};
