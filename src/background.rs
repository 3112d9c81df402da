//! Background task handling for long-running operations
//!
//! Each task runs on its own thread and reports through channels the UI
//! polls: one for the final [`TaskResult`] and, for transfers, one for
//! throttled [`Progress`] updates.

use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::archive::{self, ArchiveFormat};
use crate::config::{ServerConfig, Settings};
use crate::crypto;
use crate::errors::VfsError;
use crate::fs::ops::{self, Transfer};
use crate::fs::{CancelToken, Progress, ProgressSink, ProgressThrottle};
use crate::providers::{ConnectionManager, FileSystem};

/// Copy or move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Copy,
    Move,
}

impl TransferKind {
    fn past_tense(self) -> &'static str {
        match self {
            TransferKind::Copy => "Copied",
            TransferKind::Move => "Moved",
        }
    }
}

/// Outcome of a batch operation
#[derive(Debug, Clone, Default)]
pub struct FileOpResult {
    /// Items that completed
    pub count: usize,
    /// One message per failed item
    pub errors: Vec<String>,
    pub op_name: String,
    /// The batch stopped early because it was cancelled
    pub cancelled: bool,
}

impl FileOpResult {
    fn new(op_name: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            ..Default::default()
        }
    }

    /// Record one item's outcome; returns false when the batch should stop
    fn record(&mut self, item: &str, result: Result<(), VfsError>) -> bool {
        match result {
            Ok(()) => {
                self.count += 1;
                true
            }
            Err(e) if e.is_cancelled() => {
                self.cancelled = true;
                false
            }
            Err(e) => {
                self.errors.push(format!("{}: {}", item, e));
                true
            }
        }
    }
}

/// Result of a background task
pub enum TaskResult {
    Connected {
        name: String,
        fs: Arc<dyn FileSystem>,
    },
    ConnectFailed {
        name: String,
        error: String,
        /// The server rejected the credentials; the UI may ask for a password
        auth_failed: bool,
    },
    /// Directory size; `None` when cancelled
    DirSize {
        path: String,
        bytes: Option<u64>,
    },
    FileOpCompleted(FileOpResult),
}

/// A background task with its communication channels
pub struct BackgroundTask {
    /// Receiver for task completion
    pub receiver: Receiver<TaskResult>,
    /// Progress receiver for transfers
    pub progress_rx: Option<Receiver<Progress>>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn spawn(progress_rx: Option<Receiver<Progress>>, job: impl FnOnce(Sender<TaskResult>) + Send + 'static) -> Self {
        let (tx, rx) = channel::<TaskResult>();
        let handle = thread::spawn(move || job(tx));
        BackgroundTask {
            receiver: rx,
            progress_rx,
            handle,
        }
    }

    /// Check if the task has completed (non-blocking)
    pub fn try_recv(&self) -> Option<TaskResult> {
        self.receiver.try_recv().ok()
    }

    /// Block until the task finishes and return its result
    pub fn wait(self) -> Option<TaskResult> {
        let result = self.receiver.recv().ok();
        let _ = self.handle.join();
        result
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Open (or reuse) the session for `config` through the manager
    pub fn connect(manager: Arc<ConnectionManager>, config: ServerConfig) -> Self {
        Self::spawn(None, move |tx| {
            let result = match manager.connect(&config) {
                Ok(fs) => TaskResult::Connected {
                    name: config.name,
                    fs,
                },
                Err(e) => TaskResult::ConnectFailed {
                    auth_failed: matches!(e, VfsError::Auth(_)),
                    error: e.to_string(),
                    name: config.name,
                },
            };
            let _ = tx.send(result);
        })
    }

    /// Copy or move `sources` into `dest`.
    ///
    /// Each source lands at `dest/<name>`, except that a single source whose
    /// `dest` is not an existing directory is copied or moved to `dest` itself.
    /// Items run in order; a failed item is recorded and the batch goes on,
    /// a cancelled one ends the batch.
    pub fn transfer(
        kind: TransferKind,
        src_fs: Arc<dyn FileSystem>,
        sources: Vec<String>,
        dst_fs: Arc<dyn FileSystem>,
        dest: String,
        cancel: CancelToken,
        settings: &Settings,
    ) -> Self {
        let (progress_tx, progress_rx) = channel::<Progress>();
        let interval = settings.progress_interval();
        let chunk_size = settings.chunk_size();

        Self::spawn(Some(progress_rx), move |tx| {
            let mut result = FileOpResult::new(kind.past_tense());
            let file_count = sources.len();
            let is_rename = file_count == 1 && !dst_fs.stat(&dest).map(|i| i.is_dir).unwrap_or(false);

            let throttle = RefCell::new(ProgressThrottle::new(interval));
            let report = |p: &Progress| {
                if throttle.borrow_mut().should_emit(p) {
                    let _ = progress_tx.send(p.clone());
                }
            };

            for (i, src) in sources.iter().enumerate() {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    break;
                }

                let target = if is_rename {
                    dest.clone()
                } else {
                    dst_fs.join(&dest, &src_fs.base(src))
                };

                let sink = ProgressSink::new(&report).with_batch(i, file_count);
                let transfer = Transfer::new(&cancel).with_progress(&sink).with_chunk_size(chunk_size);
                let outcome = match kind {
                    TransferKind::Copy => ops::copy(src_fs.as_ref(), src, dst_fs.as_ref(), &target, &transfer),
                    TransferKind::Move => ops::move_path(src_fs.as_ref(), src, dst_fs.as_ref(), &target, &transfer),
                };
                if !result.record(src, outcome) {
                    break;
                }
            }

            info!("{} {} of {} item(s)", result.op_name, result.count, file_count);
            let _ = tx.send(TaskResult::FileOpCompleted(result));
        })
    }

    /// Delete `paths` recursively, checking for cancellation between items
    pub fn delete(fs: Arc<dyn FileSystem>, paths: Vec<String>, cancel: CancelToken) -> Self {
        Self::spawn(None, move |tx| {
            let mut result = FileOpResult::new("Deleted");
            for path in &paths {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    break;
                }
                result.record(path, ops::delete(fs.as_ref(), path));
            }
            let _ = tx.send(TaskResult::FileOpCompleted(result));
        })
    }

    /// Sum the file sizes under `path`
    pub fn dir_size(fs: Arc<dyn FileSystem>, path: String, cancel: CancelToken) -> Self {
        Self::spawn(None, move |tx| {
            let bytes = ops::calc_dir_size_with_cancel(fs.as_ref(), &path, &cancel).ok();
            let _ = tx.send(TaskResult::DirSize { path, bytes });
        })
    }

    /// Pack `entries` (relative to `base_dir`) into `destination`
    pub fn create_archive(format: ArchiveFormat, destination: PathBuf, base_dir: PathBuf, entries: Vec<String>) -> Self {
        Self::spawn(None, move |tx| {
            let mut result = FileOpResult::new("Archived");
            let outcome = archive::create_archive(format, &destination, &base_dir, &entries);
            result.record(&destination.display().to_string(), outcome);
            let _ = tx.send(TaskResult::FileOpCompleted(result));
        })
    }

    /// Unpack `source` into `destination_dir`
    pub fn extract_archive(source: PathBuf, destination_dir: PathBuf) -> Self {
        Self::spawn(None, move |tx| {
            let mut result = FileOpResult::new("Extracted");
            let outcome = archive::extract_archive(&source, &destination_dir);
            result.record(&source.display().to_string(), outcome);
            let _ = tx.send(TaskResult::FileOpCompleted(result));
        })
    }

    /// Encrypt each source to `<source>.enc`
    pub fn encrypt(sources: Vec<PathBuf>, passphrase: Zeroizing<String>, cancel: CancelToken) -> Self {
        Self::spawn(None, move |tx| {
            let mut result = FileOpResult::new("Encrypted");
            for source in &sources {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    break;
                }
                let destination = crypto::default_encrypted_name(source);
                let outcome = crypto::encrypt_file(source, &destination, &passphrase);
                result.record(&source.display().to_string(), outcome);
            }
            let _ = tx.send(TaskResult::FileOpCompleted(result));
        })
    }

    /// Decrypt each source into `destination_dir` under its stored name
    pub fn decrypt(
        sources: Vec<PathBuf>,
        destination_dir: PathBuf,
        passphrase: Zeroizing<String>,
        cancel: CancelToken,
    ) -> Self {
        Self::spawn(None, move |tx| {
            let mut result = FileOpResult::new("Decrypted");
            for source in &sources {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    break;
                }
                let outcome = crypto::decrypt_file(source, &destination_dir, &passphrase).map(|name| {
                    debug!("Restored {}", name);
                });
                result.record(&source.display().to_string(), outcome);
            }
            let _ = tx.send(TaskResult::FileOpCompleted(result));
        })
    }
}
