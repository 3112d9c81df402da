//! Local filesystem backend

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use super::{FileReader, FileSystem, FileWriter, WalkFn};
use crate::errors::{VfsError, VfsResult};
use crate::fs::{DirEntry, FileInfo};

/// Backend over the host filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Build a listing entry, resolving a symlink one level
fn dir_entry(path: &Path) -> io::Result<DirEntry> {
    let metadata = fs::symlink_metadata(path)?;
    let name = name_of(path);

    if !metadata.is_symlink() {
        return Ok(DirEntry::from_info(FileInfo::from_metadata(name, &metadata)));
    }

    let link_target = fs::read_link(path)
        .ok()
        .map(|t| t.to_string_lossy().into_owned());

    Ok(match fs::metadata(path) {
        Ok(target) => {
            let info = FileInfo::from_metadata(name.clone(), &target);
            DirEntry::resolved_link(name, link_target, &info)
        }
        Err(_) => DirEntry::unresolved_link(name, link_target),
    })
}

/// Only an entry removed between readdir and lstat is left out of a listing
fn listed(path: &Path, entry: io::Result<DirEntry>) -> VfsResult<Option<DirEntry>> {
    match entry {
        Ok(entry) => Ok(Some(entry)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} vanished while listing", path.display());
            Ok(None)
        }
        Err(e) => Err(VfsError::Io(io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))),
    }
}

impl FileWriter for File {
    fn finish(mut self: Box<Self>) -> VfsResult<()> {
        self.flush()?;
        Ok(())
    }
}

impl FileSystem for LocalFs {
    fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let path = entry?.path();
            if let Some(e) = listed(&path, dir_entry(&path))? {
                entries.push(e);
            }
        }
        Ok(entries)
    }

    fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        let metadata = fs::metadata(path)?;
        Ok(FileInfo::from_metadata(name_of(Path::new(path)), &metadata))
    }

    fn lstat(&self, path: &str) -> VfsResult<FileInfo> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(FileInfo::from_metadata(name_of(Path::new(path)), &metadata))
    }

    fn read_link(&self, path: &str) -> VfsResult<String> {
        Ok(fs::read_link(path)?.to_string_lossy().into_owned())
    }

    fn open(&self, path: &str) -> VfsResult<FileReader> {
        Ok(Box::new(File::open(path)?))
    }

    fn create(&self, path: &str, mode: u32) -> VfsResult<Box<dyn FileWriter>> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(Box::new(options.open(path)?))
    }

    fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(path)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> VfsResult<()> {
        let metadata = fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            fs::remove_dir(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn remove_all(&self, path: &str) -> VfsResult<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let result = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn read_file(&self, path: &str) -> VfsResult<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn walk(&self, root: &str, visit: &mut WalkFn<'_>) -> VfsResult<()> {
        for entry in WalkDir::new(root) {
            match entry {
                Ok(entry) => {
                    let path = entry.path().to_string_lossy().into_owned();
                    let info = entry
                        .metadata()
                        .map(|m| FileInfo::from_metadata(name_of(entry.path()), &m))
                        .map_err(|e| VfsError::Io(e.into()));
                    visit(&path, info)?;
                }
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_else(|| root.to_string());
                    visit(&path, Err(VfsError::Io(e.into())))?;
                }
            }
        }
        Ok(())
    }

    fn join(&self, base: &str, name: &str) -> String {
        Path::new(base).join(name).to_string_lossy().into_owned()
    }

    fn dir(&self, path: &str) -> String {
        match Path::new(path).parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
            Some(_) => ".".to_string(),
            None => path.to_string(),
        }
    }

    fn base(&self, path: &str) -> String {
        name_of(Path::new(path))
    }

    fn is_local(&self) -> bool {
        true
    }

    fn close(&self) -> VfsResult<()> {
        Ok(())
    }
}
