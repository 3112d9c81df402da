//! Transfer engine: copy, move, delete, mkdir and size calculation over any
//! pair of backends.

use std::io::{self, Read, Write};

use tracing::{debug, warn};

use super::entry::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, MODE_MASK};
use super::progress::{CancelToken, ProgressSink};
use crate::errors::{VfsError, VfsResult};
use crate::providers::{FileSystem, FileWriter};

/// Default transfer chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Cancellation, progress and chunking for one copy or move
pub struct Transfer<'a> {
    cancel: &'a CancelToken,
    progress: Option<&'a ProgressSink<'a>>,
    chunk_size: usize,
}

impl<'a> Transfer<'a> {
    pub fn new(cancel: &'a CancelToken) -> Self {
        Self {
            cancel,
            progress: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_progress(mut self, sink: &'a ProgressSink<'a>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn check_cancel(&self) -> VfsResult<()> {
        if self.cancel.is_cancelled() {
            Err(VfsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn dir_mode(mode: u32) -> u32 {
    match mode & MODE_MASK {
        0 => DEFAULT_DIR_MODE,
        m => m,
    }
}

fn file_mode(mode: u32) -> u32 {
    match mode & MODE_MASK {
        0 => DEFAULT_FILE_MODE,
        m => m,
    }
}

/// Whether a rename can move `src_fs` paths into `dst_fs`
fn same_backend(src_fs: &dyn FileSystem, dst_fs: &dyn FileSystem) -> bool {
    std::ptr::addr_eq(src_fs as *const dyn FileSystem, dst_fs as *const dyn FileSystem)
        || (src_fs.is_local() && dst_fs.is_local())
}

/// Copy a file or directory tree from one backend to another.
///
/// Links are followed. On cancellation the partially written file is removed
/// and [`VfsError::Cancelled`] is returned; files already completed stay.
pub fn copy(
    src_fs: &dyn FileSystem,
    src: &str,
    dst_fs: &dyn FileSystem,
    dst: &str,
    transfer: &Transfer<'_>,
) -> VfsResult<()> {
    let info = src_fs.stat(src)?;
    if info.is_dir {
        copy_dir(src_fs, src, dst_fs, dst, info.mode, transfer)
    } else {
        copy_file(src_fs, src, dst_fs, dst, info.size, info.mode, transfer)
    }
}

fn copy_dir(
    src_fs: &dyn FileSystem,
    src: &str,
    dst_fs: &dyn FileSystem,
    dst: &str,
    mode: u32,
    transfer: &Transfer<'_>,
) -> VfsResult<()> {
    dst_fs.mkdir_all(dst, dir_mode(mode))?;

    for entry in src_fs.read_dir(src)? {
        transfer.check_cancel()?;
        copy(
            src_fs,
            &src_fs.join(src, &entry.name),
            dst_fs,
            &dst_fs.join(dst, &entry.name),
            transfer,
        )?;
    }
    Ok(())
}

fn copy_file(
    src_fs: &dyn FileSystem,
    src: &str,
    dst_fs: &dyn FileSystem,
    dst: &str,
    size: u64,
    mode: u32,
    transfer: &Transfer<'_>,
) -> VfsResult<()> {
    transfer.check_cancel()?;
    dst_fs.mkdir_all(&dst_fs.dir(dst), DEFAULT_DIR_MODE)?;

    let mut reader = src_fs.open(src)?;
    let mut writer = dst_fs.create(dst, file_mode(mode))?;

    let Some(sink) = transfer.progress else {
        io::copy(&mut reader, &mut writer)?;
        return writer.finish();
    };

    let name = src_fs.base(src);
    let mut buf = vec![0u8; transfer.chunk_size];
    let mut done: u64 = 0;

    loop {
        if transfer.cancel.is_cancelled() {
            discard_partial(writer, dst_fs, dst);
            return Err(VfsError::Cancelled);
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        done += n as u64;
        sink.emit(&name, done, size.max(done));
    }

    if done == 0 {
        sink.emit(&name, 0, 0);
    }
    writer.finish()
}

/// Close the destination handle and delete what was written so far
fn discard_partial(writer: Box<dyn FileWriter>, dst_fs: &dyn FileSystem, dst: &str) {
    if let Err(e) = writer.finish() {
        debug!("Closing cancelled transfer to {} failed: {}", dst, e);
    }
    if let Err(e) = dst_fs.remove(dst) {
        warn!("Could not remove partial file {}: {}", dst, e);
    }
}

/// Move a file or directory tree.
///
/// Within one backend a rename is tried first. Otherwise the tree is copied and
/// the source removed afterwards. A cancelled copy leaves the source untouched
/// and removes what it created: the whole destination if it did not exist
/// before, else only the partially written file.
pub fn move_path(
    src_fs: &dyn FileSystem,
    src: &str,
    dst_fs: &dyn FileSystem,
    dst: &str,
    transfer: &Transfer<'_>,
) -> VfsResult<()> {
    transfer.check_cancel()?;
    dst_fs.mkdir_all(&dst_fs.dir(dst), DEFAULT_DIR_MODE)?;

    if same_backend(src_fs, dst_fs) {
        match src_fs.rename(src, dst) {
            Ok(()) => {
                // Report the full size since rename is instant
                if let Some(sink) = transfer.progress
                    && let Ok(info) = dst_fs.stat(dst)
                    && !info.is_dir
                {
                    sink.emit(&dst_fs.base(dst), info.size, info.size);
                }
                return Ok(());
            }
            Err(e) => debug!("Rename {} -> {} failed, copying instead: {}", src, dst, e),
        }
    }

    // Anything already at the destination belongs to the user and survives a cancel
    let dst_existed = !matches!(dst_fs.lstat(dst), Err(e) if e.is_not_found());

    match copy(src_fs, src, dst_fs, dst, transfer) {
        Ok(()) => src_fs.remove_all(src),
        Err(e) => {
            if e.is_cancelled()
                && !dst_existed
                && let Err(cleanup) = dst_fs.remove_all(dst)
            {
                warn!("Could not remove partial copy {}: {}", dst, cleanup);
            }
            Err(e)
        }
    }
}

/// Remove a path recursively; an absent path is not an error
pub fn delete(fs: &dyn FileSystem, path: &str) -> VfsResult<()> {
    fs.remove_all(path)
}

/// Create a directory and any missing parents
pub fn mkdir(fs: &dyn FileSystem, path: &str) -> VfsResult<()> {
    fs.mkdir_all(path, DEFAULT_DIR_MODE)
}

/// Total size of the files under `path`. Entries that cannot be read are skipped.
pub fn calc_dir_size(fs: &dyn FileSystem, path: &str) -> u64 {
    calc_dir_size_with_cancel(fs, path, &CancelToken::new()).unwrap_or(0)
}

/// Like [`calc_dir_size`], stopping with [`VfsError::Cancelled`] when asked to
pub fn calc_dir_size_with_cancel(fs: &dyn FileSystem, path: &str, cancel: &CancelToken) -> VfsResult<u64> {
    let mut total: u64 = 0;
    fs.walk(path, &mut |_, info| {
        if cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }
        if let Ok(info) = info
            && !info.is_dir
        {
            total += info.size;
        }
        Ok(())
    })?;
    Ok(total)
}
