//! Filesystem backends
//!
//! Every backend implements [`FileSystem`], so the transfer engine and the UI
//! work the same way against:
//! - the local filesystem
//! - a remote host over SFTP
//! - a remote host over FTP or FTPS

mod ftp;
mod local;
mod manager;
mod pipe;
mod sftp;
pub mod unix_path;

#[cfg(test)]
pub(crate) mod memory;

pub use ftp::FtpFs;
pub use local::LocalFs;
pub use manager::{ConnectionManager, Connector, NetworkConnector};
pub use sftp::SftpFs;

use std::io::{Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::errors::{VfsError, VfsResult};
use crate::fs::{DirEntry, FileInfo};

/// Callback for [`FileSystem::walk`].
///
/// Receives the visited path and its metadata, or the error hit while reading it.
/// Returning an error stops the walk and propagates that error.
pub type WalkFn<'a> = dyn FnMut(&str, VfsResult<FileInfo>) -> VfsResult<()> + 'a;

/// Streaming reader returned by [`FileSystem::open`]
pub type FileReader = Box<dyn Read + Send>;

/// Streaming writer returned by [`FileSystem::create`].
///
/// Dropping the writer releases the handle, but only [`FileWriter::finish`]
/// reports errors that surface when the transfer completes (e.g. an FTP store).
pub trait FileWriter: Write + Send {
    fn finish(self: Box<Self>) -> VfsResult<()>;
}

/// Capability contract shared by all backends.
///
/// Paths are backend-native strings. Callers compose them with
/// [`join`](FileSystem::join), [`dir`](FileSystem::dir) and
/// [`base`](FileSystem::base) and never hardcode a separator.
pub trait FileSystem: Send + Sync {
    /// List a directory, in the order the backend returns it
    fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>>;

    /// Metadata, following symlinks
    fn stat(&self, path: &str) -> VfsResult<FileInfo>;

    /// Metadata of the path itself, not following symlinks
    fn lstat(&self, path: &str) -> VfsResult<FileInfo>;

    /// Read a symlink's target
    fn read_link(&self, path: &str) -> VfsResult<String>;

    /// Open a file for streaming read
    fn open(&self, path: &str) -> VfsResult<FileReader>;

    /// Create or truncate a file for streaming write with the given permission bits
    fn create(&self, path: &str, mode: u32) -> VfsResult<Box<dyn FileWriter>>;

    /// Create a directory and all missing parents
    fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()>;

    /// Remove a file or an empty directory
    fn remove(&self, path: &str) -> VfsResult<()>;

    /// Rename/move within this backend
    fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    /// Remove a path recursively. A path that does not exist counts as removed.
    ///
    /// The default recurses by hand for protocols whose directory delete is
    /// non-recursive: children go first, the directory last.
    fn remove_all(&self, path: &str) -> VfsResult<()> {
        let info = match self.lstat(path) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        if !info.is_dir {
            return self.remove(path);
        }

        for entry in self.read_dir(path)? {
            self.remove_all(&self.join(path, &entry.name))?;
        }
        self.remove(path)
    }

    /// Read a whole file into memory
    fn read_file(&self, path: &str) -> VfsResult<Vec<u8>> {
        let mut reader = self.open(path)?;
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// Walk the subtree at `root` (root first), calling `visit` for every entry.
    ///
    /// Directories are descended through `stat`, so a symlinked directory is
    /// followed; errors reading an entry are handed to `visit`.
    fn walk(&self, root: &str, visit: &mut WalkFn<'_>) -> VfsResult<()> {
        let info = match self.stat(root) {
            Ok(info) => info,
            Err(e) => return visit(root, Err(e)),
        };
        let is_dir = info.is_dir;
        visit(root, Ok(info))?;
        if !is_dir {
            return Ok(());
        }

        let entries = match self.read_dir(root) {
            Ok(entries) => entries,
            Err(e) => return visit(root, Err(e)),
        };

        for entry in entries {
            let child = self.join(root, &entry.name);
            if entry.is_dir {
                self.walk(&child, visit)?;
            } else {
                visit(&child, Ok(entry.info()))?;
            }
        }
        Ok(())
    }

    /// Join a base path and a child name
    fn join(&self, base: &str, name: &str) -> String;

    /// Parent directory of a path
    fn dir(&self, path: &str) -> String;

    /// Final component of a path
    fn base(&self, path: &str) -> String;

    /// Whether paths of this backend are host filesystem paths
    fn is_local(&self) -> bool;

    /// Release backend resources (sockets, handles). Safe to call more than once.
    fn close(&self) -> VfsResult<()>;
}

/// Background loop that pings a session on an idle schedule.
///
/// `tick` runs once per interval until [`stop`](KeepAlive::stop) is called or
/// the handle is dropped.
pub(crate) struct KeepAlive {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    pub(crate) fn spawn(interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self { stop, handle }
    }

    /// End the loop and wait for it; false if the loop panicked
    pub(crate) fn stop(self) -> bool {
        drop(self.stop);
        self.handle.join().is_ok()
    }
}

/// Map a poisoned lock to an error instead of panicking
pub(crate) fn poisoned<T>(_: T) -> VfsError {
    VfsError::Connection("session lock poisoned".to_string())
}
