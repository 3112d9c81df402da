//! In-memory backend standing in for a remote server in tests

use std::collections::BTreeMap;
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::{FileReader, FileSystem, FileWriter, poisoned, unix_path};
use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::DEFAULT_DIR_MODE;
use crate::fs::{DirEntry, FileInfo};

#[derive(Clone, Debug)]
enum Node {
    Dir { mode: u32 },
    File { data: Vec<u8>, mode: u32 },
}

type Tree = Arc<Mutex<BTreeMap<String, Node>>>;

/// Slash-separated, non-local filesystem held in a map from cleaned path to node
#[derive(Clone)]
pub(crate) struct MemoryFs {
    tree: Tree,
}

struct MemoryWriter {
    tree: Tree,
    path: String,
    mode: u32,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemoryWriter {
    fn store(&mut self) -> VfsResult<()> {
        let data = std::mem::take(&mut self.buf);
        self.tree.lock().map_err(poisoned)?.insert(
            self.path.clone(),
            Node::File {
                data,
                mode: self.mode,
            },
        );
        Ok(())
    }
}

impl FileWriter for MemoryWriter {
    fn finish(mut self: Box<Self>) -> VfsResult<()> {
        self.store()
    }
}

impl MemoryFs {
    pub(crate) fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::Dir { mode: DEFAULT_DIR_MODE });
        Self {
            tree: Arc::new(Mutex::new(tree)),
        }
    }

    /// Test helper: write a file, creating parents
    pub(crate) fn put(&self, path: &str, data: &[u8]) {
        let path = unix_path::clean(path);
        self.mkdir_all(&unix_path::parent(&path), DEFAULT_DIR_MODE).unwrap();
        self.tree.lock().unwrap().insert(
            path,
            Node::File {
                data: data.to_vec(),
                mode: 0o644,
            },
        );
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.tree.lock().unwrap().contains_key(&unix_path::clean(path))
    }

    fn info(path: &str, node: &Node) -> FileInfo {
        let (size, mode, is_dir) = match node {
            Node::Dir { mode } => (0, *mode, true),
            Node::File { data, mode } => (data.len() as u64, *mode, false),
        };
        FileInfo {
            name: unix_path::base(path),
            size,
            modified: Some(SystemTime::UNIX_EPOCH),
            mode,
            is_dir,
        }
    }

    fn node(&self, path: &str) -> VfsResult<Node> {
        self.tree
            .lock()
            .map_err(poisoned)?
            .get(&unix_path::clean(path))
            .cloned()
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }
}

impl FileSystem for MemoryFs {
    fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let dir = unix_path::clean(path);
        if !matches!(self.node(&dir)?, Node::Dir { .. }) {
            return Err(VfsError::remote("readdir", path, "not a directory"));
        }
        let tree = self.tree.lock().map_err(poisoned)?;
        Ok(tree
            .iter()
            .filter(|(p, _)| p.as_str() != dir && unix_path::parent(p) == dir)
            .map(|(p, node)| DirEntry::from_info(Self::info(p, node)))
            .collect())
    }

    fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        Ok(Self::info(path, &self.node(path)?))
    }

    fn lstat(&self, path: &str) -> VfsResult<FileInfo> {
        self.stat(path)
    }

    fn read_link(&self, path: &str) -> VfsResult<String> {
        Err(VfsError::NotSupported(format!("readlink {}", path)))
    }

    fn open(&self, path: &str) -> VfsResult<FileReader> {
        match self.node(path)? {
            Node::File { data, .. } => Ok(Box::new(Cursor::new(data))),
            Node::Dir { .. } => Err(VfsError::remote("open", path, "is a directory")),
        }
    }

    fn create(&self, path: &str, mode: u32) -> VfsResult<Box<dyn FileWriter>> {
        let path = unix_path::clean(path);
        if !matches!(self.node(&unix_path::parent(&path))?, Node::Dir { .. }) {
            return Err(VfsError::remote("create", &path, "parent is not a directory"));
        }
        let mut writer = MemoryWriter {
            tree: Arc::clone(&self.tree),
            path,
            mode,
            buf: Vec::new(),
        };
        // Truncate on open, like a real create
        writer.store()?;
        Ok(Box::new(writer))
    }

    fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()> {
        let mut tree = self.tree.lock().map_err(poisoned)?;
        let mut current = "/".to_string();
        for component in unix_path::components(path) {
            current = unix_path::join(&current, &component);
            match tree.get(&current) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => {
                    return Err(VfsError::remote("mkdir", &current, "not a directory"));
                }
                None => {
                    tree.insert(current.clone(), Node::Dir { mode });
                }
            }
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> VfsResult<()> {
        let path = unix_path::clean(path);
        let mut tree = self.tree.lock().map_err(poisoned)?;
        let has_children = tree.keys().any(|p| *p != path && unix_path::parent(p) == path);
        if has_children {
            return Err(VfsError::remote("rmdir", &path, "directory not empty"));
        }
        tree.remove(&path)
            .map(|_| ())
            .ok_or(VfsError::NotFound(path))
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let from = unix_path::clean(from);
        let to = unix_path::clean(to);
        let mut tree = self.tree.lock().map_err(poisoned)?;
        if !tree.contains_key(&from) {
            return Err(VfsError::NotFound(from));
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = tree
            .keys()
            .filter(|p| **p == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = tree.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                tree.insert(new, node);
            }
        }
        Ok(())
    }

    fn join(&self, base: &str, name: &str) -> String {
        unix_path::join(base, name)
    }

    fn dir(&self, path: &str) -> String {
        unix_path::parent(path)
    }

    fn base(&self, path: &str) -> String {
        unix_path::base(path)
    }

    fn is_local(&self) -> bool {
        false
    }

    fn close(&self) -> VfsResult<()> {
        Ok(())
    }
}
