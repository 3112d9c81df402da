//! Bark VFS - the filesystem core of a dual-pane file manager
//!
//! One [`FileSystem`] contract over local disk, SFTP and FTP/FTPS, a
//! [`ConnectionManager`] keyed by server name, a cancellable transfer engine
//! that works across backends, plus archive and single-file encryption helpers.

pub mod archive;
pub mod background;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod fs;
pub mod logging;
pub mod providers;

pub use config::{Protocol, ServerConfig, Settings};
pub use errors::{VfsError, VfsResult};
pub use fs::{CancelToken, DirEntry, FileInfo, Progress, ProgressSink, Transfer};
pub use providers::{ConnectionManager, FileSystem, FileWriter, FtpFs, LocalFs, SftpFs};
