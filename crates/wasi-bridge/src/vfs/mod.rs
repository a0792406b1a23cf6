//! An in-memory filesystem tree rooted at `/`.
//!
//! Nodes live in an inode arena. Directories map names to inodes, files own
//! their bytes. The tree is seeded once from a [`VfsSnapshot`] and afterwards
//! only changes through the operations below.
//!
//! A node is freed once it is neither linked into a directory nor held open
//! through [`Vfs::open`]; its slot is then reused by the next insert.

mod snapshot;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

pub use snapshot::{FileContent, VfsSnapshot};

use crate::wasi::clock::{Clock, SystemClock};

pub type Inode = u64;

pub const ROOT: Inode = 0;

/// Largest file the tree accepts unless configured otherwise.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("file would grow past {limit} bytes")]
    FileTooLarge { limit: u64 },
}

pub type Result<T, E = VfsError> = ::std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub ino: Inode,
    pub kind: NodeKind,
    pub size: u64,
    pub nlink: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: Inode,
    pub kind: NodeKind,
}

#[derive(Debug)]
enum Data {
    File(Vec<u8>),
    Dir(BTreeMap<String, Inode>),
}

#[derive(Debug)]
struct Node {
    data: Data,
    parent: Inode,
    linked: bool,
    open: usize,
    atim: u64,
    mtim: u64,
    ctim: u64,
}

impl Node {
    fn new(data: Data, parent: Inode, now: u64) -> Self {
        Self {
            data,
            parent,
            linked: true,
            open: 0,
            atim: now,
            mtim: now,
            ctim: now,
        }
    }

    fn kind(&self) -> NodeKind {
        match self.data {
            Data::File(_) => NodeKind::File,
            Data::Dir(_) => NodeKind::Directory,
        }
    }
}

pub struct Vfs {
    nodes: Vec<Option<Node>>,
    free: Vec<Inode>,
    max_file_size: u64,
    clock: Arc<dyn Clock>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::default()))
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("live_nodes", &self.live_nodes())
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}

impl Vfs {
    /// An empty tree containing only `/`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let root = Node::new(Data::Dir(BTreeMap::new()), ROOT, clock.realtime());
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            clock,
        }
    }

    /// Caps the size any file can grow to through writes or truncation.
    pub fn with_max_file_size(mut self, limit: u64) -> Self {
        self.max_file_size = limit;
        self
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Number of nodes currently allocated, reachable or held open.
    pub fn live_nodes(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Seeds a tree from a snapshot. The `/` entry is required and missing
    /// intermediate directories are created.
    pub fn from_snapshot(snapshot: &VfsSnapshot, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut vfs = Self::new(clock);
        match snapshot.entries().get("/") {
            Some(None) => {}
            Some(Some(_)) => {
                return Err(VfsError::InvalidSnapshot("`/` must be a directory".into()));
            }
            None => return Err(VfsError::InvalidSnapshot("missing root entry `/`".into())),
        }
        for (path, content) in snapshot.entries() {
            if !path.starts_with('/') {
                return Err(VfsError::InvalidSnapshot(format!(
                    "path {path:?} is not absolute"
                )));
            }
            let seeded = match content {
                None => vfs.create_dir_all(path).map(|_| ()),
                Some(content) => vfs.write_file(path, content.as_bytes()),
            };
            seeded.map_err(|err| VfsError::InvalidSnapshot(format!("{path}: {err}")))?;
        }
        Ok(vfs)
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let snapshot: VfsSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(&snapshot, Arc::new(SystemClock::default()))?)
    }

    /// Serialises the current tree back into a snapshot.
    pub fn to_snapshot(&self) -> VfsSnapshot {
        let mut entries = BTreeMap::new();
        let mut stack = vec![("/".to_string(), ROOT)];
        while let Some((path, ino)) = stack.pop() {
            let Ok(node) = self.node(ino) else {
                continue;
            };
            match &node.data {
                Data::File(bytes) => {
                    entries.insert(path, Some(FileContent::from_bytes(bytes.clone())));
                }
                Data::Dir(children) => {
                    for (name, child) in children {
                        stack.push((join(&path, name), *child));
                    }
                    entries.insert(path, None);
                }
            }
        }
        VfsSnapshot::new(entries)
    }

    fn node(&self, ino: Inode) -> Result<&Node> {
        self.nodes
            .get(ino as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| VfsError::NotFound(format!("inode {ino}")))
    }

    fn node_mut(&mut self, ino: Inode) -> Result<&mut Node> {
        self.nodes
            .get_mut(ino as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| VfsError::NotFound(format!("inode {ino}")))
    }

    fn children(&self, ino: Inode) -> Result<&BTreeMap<String, Inode>> {
        match &self.node(ino)?.data {
            Data::Dir(children) => Ok(children),
            Data::File(_) => Err(VfsError::NotADirectory(format!("inode {ino}"))),
        }
    }

    fn children_mut(&mut self, ino: Inode) -> Result<&mut BTreeMap<String, Inode>> {
        match &mut self.node_mut(ino)?.data {
            Data::Dir(children) => Ok(children),
            Data::File(_) => Err(VfsError::NotADirectory(format!("inode {ino}"))),
        }
    }

    pub fn kind(&self, ino: Inode) -> Result<NodeKind> {
        Ok(self.node(ino)?.kind())
    }

    /// Resolves `path` relative to the directory `base`.
    /// Absolute paths resolve from `/`; `..` never climbs above `/`.
    pub fn resolve(&self, base: Inode, path: &str) -> Result<Inode> {
        let mut current = if path.starts_with('/') { ROOT } else { base };
        for component in path.split('/') {
            match component {
                "" | "." => {
                    self.children(current)?;
                }
                ".." => current = self.node(current)?.parent,
                name => {
                    current = *self
                        .children(current)
                        .map_err(|_| VfsError::NotADirectory(path.to_string()))?
                        .get(name)
                        .ok_or_else(|| VfsError::NotFound(path.to_string()))?;
                }
            }
        }
        Ok(current)
    }

    /// Resolves everything but the last component of `path`, returning the
    /// parent directory and the final name.
    pub fn resolve_parent(&self, base: Inode, path: &str) -> Result<(Inode, String)> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => ("", trimmed),
        };
        if name.is_empty() || name == "." || name == ".." {
            return Err(VfsError::InvalidPath(path.to_string()));
        }
        let parent = self.resolve(base, dir)?;
        if self.kind(parent)? != NodeKind::Directory {
            return Err(VfsError::NotADirectory(dir.to_string()));
        }
        Ok((parent, name.to_string()))
    }

    pub fn lookup(&self, path: &str) -> Result<Inode> {
        self.resolve(ROOT, path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_ok()
    }

    pub fn stat(&self, ino: Inode) -> Result<Stat> {
        let node = self.node(ino)?;
        let (size, nlink) = match &node.data {
            Data::File(bytes) => (bytes.len() as u64, 1),
            Data::Dir(children) => (children.len() as u64, 2),
        };
        let nlink = if node.linked { nlink } else { 0 };
        Ok(Stat {
            ino,
            kind: node.kind(),
            size,
            nlink,
            atim: node.atim,
            mtim: node.mtim,
            ctim: node.ctim,
        })
    }

    fn insert(&mut self, parent: Inode, name: &str, data: Data) -> Result<Inode> {
        if self.children(parent)?.contains_key(name) {
            return Err(VfsError::AlreadyExists(name.to_string()));
        }
        let node = Node::new(data, parent, self.clock.realtime());
        let ino = match self.free.pop() {
            Some(ino) => {
                self.nodes[ino as usize] = Some(node);
                ino
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as Inode
            }
        };
        self.children_mut(parent)?.insert(name.to_string(), ino);
        self.touch(parent);
        Ok(ino)
    }

    /// Takes a hold on `ino` that keeps it alive after it is unlinked.
    pub fn open(&mut self, ino: Inode) -> Result<()> {
        self.node_mut(ino)?.open += 1;
        Ok(())
    }

    /// Releases a hold taken by [`Vfs::open`], freeing the node if it was
    /// the last reference.
    pub fn close(&mut self, ino: Inode) {
        if let Ok(node) = self.node_mut(ino) {
            node.open = node.open.saturating_sub(1);
        }
        self.reclaim(ino);
    }

    /// Marks `ino` as removed from its directory.
    fn drop_link(&mut self, ino: Inode) {
        if let Ok(node) = self.node_mut(ino) {
            node.linked = false;
        }
        self.reclaim(ino);
    }

    fn reclaim(&mut self, ino: Inode) {
        if ino == ROOT {
            return;
        }
        let Some(slot) = self.nodes.get_mut(ino as usize) else {
            return;
        };
        if matches!(slot, Some(node) if !node.linked && node.open == 0) {
            *slot = None;
            self.free.push(ino);
        }
    }

    fn touch(&mut self, ino: Inode) {
        let now = self.clock.realtime();
        if let Ok(node) = self.node_mut(ino) {
            node.mtim = now;
            node.ctim = now;
        }
    }

    pub fn create_file(&mut self, parent: Inode, name: &str) -> Result<Inode> {
        self.insert(parent, name, Data::File(Vec::new()))
    }

    pub fn create_dir(&mut self, parent: Inode, name: &str) -> Result<Inode> {
        self.insert(parent, name, Data::Dir(BTreeMap::new()))
    }

    /// Creates `path` and any missing ancestors.
    pub fn create_dir_all(&mut self, path: &str) -> Result<Inode> {
        let mut current = ROOT;
        for name in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if name == ".." {
                return Err(VfsError::InvalidPath(path.to_string()));
            }
            current = match self.children(current)?.get(name) {
                Some(&child) if self.kind(child)? == NodeKind::Directory => child,
                Some(_) => return Err(VfsError::NotADirectory(path.to_string())),
                None => self.create_dir(current, name)?,
            };
        }
        Ok(current)
    }

    /// Reads up to `buf.len()` bytes at `offset`. Reading at or past the end
    /// returns a short (possibly empty) read.
    pub fn read_at(&mut self, ino: Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let now = self.clock.realtime();
        let node = self.node_mut(ino)?;
        let Data::File(bytes) = &node.data else {
            return Err(VfsError::IsADirectory(format!("inode {ino}")));
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        node.atim = now;
        Ok(n)
    }

    /// Converts a requested file size to an index, rejecting anything past
    /// the configured limit.
    fn checked_size(&self, size: Option<u64>) -> Result<usize> {
        let limit = self.max_file_size;
        size.filter(|size| *size <= limit)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or(VfsError::FileTooLarge { limit })
    }

    /// Writes `data` at `offset`, zero-filling any gap past the current end.
    pub fn write_at(&mut self, ino: Inode, offset: u64, data: &[u8]) -> Result<usize> {
        let end = self.checked_size(offset.checked_add(data.len() as u64))?;
        let start = end - data.len();
        let now = self.clock.realtime();
        let node = self.node_mut(ino)?;
        let Data::File(bytes) = &mut node.data else {
            return Err(VfsError::IsADirectory(format!("inode {ino}")));
        };
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        node.mtim = now;
        node.ctim = now;
        Ok(data.len())
    }

    pub fn set_len(&mut self, ino: Inode, size: u64) -> Result<()> {
        let size = self.checked_size(Some(size))?;
        let now = self.clock.realtime();
        let node = self.node_mut(ino)?;
        let Data::File(bytes) = &mut node.data else {
            return Err(VfsError::IsADirectory(format!("inode {ino}")));
        };
        bytes.resize(size, 0);
        node.mtim = now;
        node.ctim = now;
        Ok(())
    }

    /// Updates access and modification times; `None` leaves a time unchanged.
    pub fn set_times(&mut self, ino: Inode, atim: Option<u64>, mtim: Option<u64>) -> Result<()> {
        let now = self.clock.realtime();
        let node = self.node_mut(ino)?;
        if let Some(atim) = atim {
            node.atim = atim;
        }
        if let Some(mtim) = mtim {
            node.mtim = mtim;
        }
        node.ctim = now;
        Ok(())
    }

    pub fn now(&self) -> u64 {
        self.clock.realtime()
    }

    pub fn read_dir(&self, ino: Inode) -> Result<Vec<DirEntry>> {
        self.children(ino)?
            .iter()
            .map(|(name, &child)| {
                Ok(DirEntry {
                    name: name.clone(),
                    ino: child,
                    kind: self.kind(child)?,
                })
            })
            .collect()
    }

    pub fn parent(&self, ino: Inode) -> Result<Inode> {
        Ok(self.node(ino)?.parent)
    }

    pub fn unlink(&mut self, parent: Inode, name: &str) -> Result<()> {
        let child = self.child(parent, name)?;
        if self.kind(child)? == NodeKind::Directory {
            return Err(VfsError::IsADirectory(name.to_string()));
        }
        self.children_mut(parent)?.remove(name);
        self.touch(parent);
        self.drop_link(child);
        Ok(())
    }

    pub fn remove_dir(&mut self, parent: Inode, name: &str) -> Result<()> {
        let child = self.child(parent, name)?;
        if !self.children(child)?.is_empty() {
            return Err(VfsError::NotEmpty(name.to_string()));
        }
        self.children_mut(parent)?.remove(name);
        self.touch(parent);
        self.drop_link(child);
        Ok(())
    }

    fn child(&self, parent: Inode, name: &str) -> Result<Inode> {
        self.children(parent)?
            .get(name)
            .copied()
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    fn is_ancestor(&self, ancestor: Inode, mut ino: Inode) -> bool {
        loop {
            if ino == ancestor {
                return true;
            }
            match self.node(ino) {
                Ok(node) if ino != ROOT => ino = node.parent,
                _ => return false,
            }
        }
    }

    /// Moves `old_parent/old_name` to `new_parent/new_name`, replacing a
    /// target of the same kind (an empty directory, or a file).
    pub fn rename(
        &mut self,
        old_parent: Inode,
        old_name: &str,
        new_parent: Inode,
        new_name: &str,
    ) -> Result<()> {
        let source = self.child(old_parent, old_name)?;
        let source_kind = self.kind(source)?;
        self.children(new_parent)?;
        if source_kind == NodeKind::Directory && self.is_ancestor(source, new_parent) {
            return Err(VfsError::InvalidPath(format!(
                "cannot move {old_name} into itself"
            )));
        }
        if let Ok(target) = self.child(new_parent, new_name) {
            if target == source {
                return Ok(());
            }
            match (source_kind, self.kind(target)?) {
                (NodeKind::File, NodeKind::Directory) => {
                    return Err(VfsError::IsADirectory(new_name.to_string()));
                }
                (NodeKind::Directory, NodeKind::File) => {
                    return Err(VfsError::NotADirectory(new_name.to_string()));
                }
                (NodeKind::Directory, NodeKind::Directory)
                    if !self.children(target)?.is_empty() =>
                {
                    return Err(VfsError::NotEmpty(new_name.to_string()));
                }
                _ => {}
            }
        }
        self.children_mut(old_parent)?.remove(old_name);
        let replaced = self
            .children_mut(new_parent)?
            .insert(new_name.to_string(), source);
        self.node_mut(source)?.parent = new_parent;
        self.touch(old_parent);
        self.touch(new_parent);
        if let Some(target) = replaced {
            self.drop_link(target);
        }
        Ok(())
    }

    /// Reads a whole file by absolute path.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let ino = self.lookup(path)?;
        let size = self.stat(ino)?.size as usize;
        let mut buf = vec![0; size];
        let n = self.read_at(ino, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Creates or replaces a file by absolute path, creating missing
    /// parent directories.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let (dir, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((dir, name)) if !name.is_empty() => (dir, name),
            _ => return Err(VfsError::InvalidPath(path.to_string())),
        };
        let parent = self.create_dir_all(dir)?;
        let ino = match self.child(parent, name) {
            Ok(ino) => ino,
            Err(_) => self.create_file(parent, name)?,
        };
        self.set_len(ino, 0)?;
        self.write_at(ino, 0, data)?;
        Ok(())
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
