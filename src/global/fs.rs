//! Filesystem capability used by the package cache.
//!
//! The cache never touches `std::fs` directly. It is handed an [`Fs`] at
//! construction, so tests can run against [`MemFs`] and simulate a read-only
//! mount with [`ReadOnlyFs`].

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

pub trait Fs: Debug + Send + Sync {
    fn stat(&self, path: &Path) -> io::Result<FileType>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Creates or truncates the file. The parent directory must exist.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    /// Moves a file or directory. An existing empty directory at `to` is replaced.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Lists every regular file below `root`, sorted.
    fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>>;
    /// Lists the immediate children of the directory `path`, sorted.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// The operating system's filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl Fs for OsFs {
    fn stat(&self, path: &Path) -> io::Result<FileType> {
        let meta = std::fs::metadata(path)?;
        Ok(if meta.is_dir() { FileType::Dir } else { FileType::File })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut children = std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        children.sort();
        Ok(children)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// In-memory filesystem. Clones share the same tree.
#[derive(Debug, Clone)]
pub struct MemFs {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
}

impl Default for MemFs {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::Dir);
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Node>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{}: no such file or directory", path.display()))
}

fn descendants(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> Vec<PathBuf> {
    nodes
        .range(path.to_path_buf()..)
        .take_while(|(k, _)| k.starts_with(path))
        .filter(|(k, _)| k.as_path() != path)
        .map(|(k, _)| k.clone())
        .collect()
}

fn require_parent_dir(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<()> {
    match path.parent() {
        None => Ok(()),
        Some(parent) => match nodes.get(parent) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{}: not a directory", parent.display()),
            )),
            None => Err(not_found(parent)),
        },
    }
}

impl Fs for MemFs {
    fn stat(&self, path: &Path) -> io::Result<FileType> {
        match self.nodes().get(path) {
            Some(Node::Dir) => Ok(FileType::Dir),
            Some(Node::File(_)) => Ok(FileType::File),
            None => Err(not_found(path)),
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.nodes().get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{}: is a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut nodes = self.nodes();
        require_parent_dir(&nodes, path)?;
        if let Some(Node::Dir) = nodes.get(path) {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{}: is a directory", path.display()),
            ));
        }
        nodes.insert(path.to_path_buf(), Node::File(contents.to_vec()));
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes();
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            match nodes.get(&current) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("{}: not a directory", current.display()),
                    ));
                }
                None => {
                    nodes.insert(current.clone(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes();
        if !nodes.contains_key(path) {
            return Err(not_found(path));
        }
        for child in descendants(&nodes, path) {
            nodes.remove(&child);
        }
        nodes.remove(path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut nodes = self.nodes();
        let node = nodes.get(from).cloned().ok_or_else(|| not_found(from))?;
        require_parent_dir(&nodes, to)?;
        match (nodes.get(to), &node) {
            (Some(Node::Dir), Node::Dir) => {
                if !descendants(&nodes, to).is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::DirectoryNotEmpty,
                        format!("{}: directory not empty", to.display()),
                    ));
                }
            }
            (Some(Node::Dir), Node::File(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::IsADirectory,
                    format!("{}: is a directory", to.display()),
                ));
            }
            (Some(Node::File(_)), Node::Dir) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("{}: not a directory", to.display()),
                ));
            }
            _ => {}
        }

        let moved: Vec<(PathBuf, Node)> = descendants(&nodes, from)
            .into_iter()
            .filter_map(|k| nodes.remove(&k).map(|n| (k, n)))
            .collect();
        nodes.remove(from);
        nodes.insert(to.to_path_buf(), node);
        for (old, child) in moved {
            if let Ok(rest) = old.strip_prefix(from) {
                nodes.insert(to.join(rest), child);
            }
        }
        Ok(())
    }

    fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let nodes = self.nodes();
        match nodes.get(root) {
            None => Err(not_found(root)),
            Some(Node::File(_)) => Ok(vec![root.to_path_buf()]),
            Some(Node::Dir) => Ok(descendants(&nodes, root)
                .into_iter()
                .filter(|k| matches!(nodes.get(k), Some(Node::File(_))))
                .collect()),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let nodes = self.nodes();
        match nodes.get(path) {
            None => Err(not_found(path)),
            Some(Node::File(_)) => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{}: not a directory", path.display()),
            )),
            Some(Node::Dir) => Ok(descendants(&nodes, path)
                .into_iter()
                .filter(|k| k.parent() == Some(path))
                .collect()),
        }
    }
}

/// Wraps another filesystem and rejects every mutation with
/// [`io::ErrorKind::PermissionDenied`]. Reads pass through.
#[derive(Debug, Clone)]
pub struct ReadOnlyFs<F> {
    inner: F,
}

impl<F: Fs> ReadOnlyFs<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

fn read_only(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{}: operation not permitted on read-only filesystem", path.display()),
    )
}

impl<F: Fs> Fs for ReadOnlyFs<F> {
    fn stat(&self, path: &Path) -> io::Result<FileType> {
        self.inner.stat(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn write(&self, path: &Path, _contents: &[u8]) -> io::Result<()> {
        Err(read_only(path))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        Err(read_only(path))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        Err(read_only(path))
    }

    fn rename(&self, from: &Path, _to: &Path) -> io::Result<()> {
        Err(read_only(from))
    }

    fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.walk(root)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.read_dir(path)
    }
}
