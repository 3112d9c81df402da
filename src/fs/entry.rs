//! File metadata snapshots returned by every backend

use std::fs::Metadata;
use std::time::SystemTime;

/// Permission bits kept in `mode` (rwx for owner/group/other plus setuid/setgid/sticky)
pub const MODE_MASK: u32 = 0o7777;

/// Default permission bits for created directories
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Default permission bits for created files
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Metadata about a file or directory, as returned by `stat`/`lstat`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Final path component
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time, if the backend reports one
    pub modified: Option<SystemTime>,
    /// Permission bits (masked with [`MODE_MASK`])
    pub mode: u32,
    pub is_dir: bool,
}

/// A single entry of a directory listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Size in bytes; for symlinks, the size of the resolved target
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub mode: u32,
    /// For symlinks, whether the resolved target is a directory
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Link target as stored in the link, when readable
    pub link_target: Option<String>,
}

impl FileInfo {
    /// Build a snapshot from local metadata
    pub fn from_metadata(name: String, metadata: &Metadata) -> Self {
        Self {
            name,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            mode: mode_of(metadata),
            is_dir: metadata.is_dir(),
        }
    }
}

impl DirEntry {
    /// Entry for a plain (non-link) file or directory
    pub fn from_info(info: FileInfo) -> Self {
        Self {
            name: info.name,
            size: info.size,
            modified: info.modified,
            mode: info.mode,
            is_dir: info.is_dir,
            is_symlink: false,
            link_target: None,
        }
    }

    /// Entry for a symlink whose target could not be resolved
    pub fn unresolved_link(name: String, link_target: Option<String>) -> Self {
        Self {
            name,
            size: 0,
            modified: None,
            mode: 0,
            is_dir: false,
            is_symlink: true,
            link_target,
        }
    }

    /// Entry for a symlink, carrying the resolved target's attributes
    pub fn resolved_link(name: String, link_target: Option<String>, target: &FileInfo) -> Self {
        Self {
            name,
            size: target.size,
            modified: target.modified,
            mode: target.mode,
            is_dir: target.is_dir,
            is_symlink: true,
            link_target,
        }
    }

    /// The entry's attributes as a [`FileInfo`]
    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name.clone(),
            size: self.size,
            modified: self.modified,
            mode: self.mode,
            is_dir: self.is_dir,
        }
    }
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
fn mode_of(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => DEFAULT_DIR_MODE,
        (false, true) => 0o444,
        (false, false) => DEFAULT_FILE_MODE,
    }
}
