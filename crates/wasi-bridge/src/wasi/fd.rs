use std::collections::BTreeMap;

use super::Errno;
use crate::vfs::{Inode, ROOT};

pub const RIGHT_FD_READ: u64 = 1 << 1;
pub const RIGHT_FD_SEEK: u64 = 1 << 2;
pub const RIGHT_FD_TELL: u64 = 1 << 5;
pub const RIGHT_FD_WRITE: u64 = 1 << 6;
pub const RIGHT_POLL_FD_READWRITE: u64 = 1 << 27;
pub const RIGHTS_ALL: u64 = (1 << 29) - 1;

pub const FDFLAG_APPEND: u16 = 1 << 0;

pub const FILETYPE_CHARACTER_DEVICE: u8 = 2;
pub const FILETYPE_DIRECTORY: u8 = 3;
pub const FILETYPE_REGULAR_FILE: u8 = 4;

/// Descriptor of the preopened root directory.
pub const PREOPEN_FD: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FdKind {
    Stdin,
    Stdout,
    Stderr,
    File { ino: Inode, offset: u64 },
    Dir { ino: Inode, preopen: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdEntry {
    pub kind: FdKind,
    pub rights_base: u64,
    pub rights_inheriting: u64,
    pub flags: u16,
}

impl FdEntry {
    pub fn file(ino: Inode, rights_base: u64, flags: u16) -> Self {
        Self {
            kind: FdKind::File { ino, offset: 0 },
            rights_base,
            rights_inheriting: 0,
            flags,
        }
    }

    pub fn dir(ino: Inode, rights_base: u64, rights_inheriting: u64) -> Self {
        Self {
            kind: FdKind::Dir { ino, preopen: None },
            rights_base,
            rights_inheriting,
            flags: 0,
        }
    }

    pub fn filetype(&self) -> u8 {
        match self.kind {
            FdKind::Stdin | FdKind::Stdout | FdKind::Stderr => FILETYPE_CHARACTER_DEVICE,
            FdKind::File { .. } => FILETYPE_REGULAR_FILE,
            FdKind::Dir { .. } => FILETYPE_DIRECTORY,
        }
    }

    pub fn require(&self, rights: u64) -> Result<(), Errno> {
        if self.rights_base & rights == rights {
            Ok(())
        } else {
            Err(Errno::Notcapable)
        }
    }

    /// The inode the descriptor holds open, if any.
    pub fn ino(&self) -> Option<Inode> {
        match self.kind {
            FdKind::File { ino, .. } | FdKind::Dir { ino, .. } => Some(ino),
            _ => None,
        }
    }

    /// The directory inode a path-based call resolves against.
    pub fn dir_ino(&self) -> Result<Inode, Errno> {
        match self.kind {
            FdKind::Dir { ino, .. } => Ok(ino),
            FdKind::File { .. } => Err(Errno::Notdir),
            _ => Err(Errno::Badf),
        }
    }
}

/// The descriptor table of a session, shared by the calling thread and every
/// worker.
#[derive(Debug)]
pub struct FdTable {
    entries: BTreeMap<u32, FdEntry>,
}

impl Default for FdTable {
    fn default() -> Self {
        let stdio = |kind, rights| FdEntry {
            kind,
            rights_base: rights | RIGHT_POLL_FD_READWRITE,
            rights_inheriting: 0,
            flags: 0,
        };
        let entries = BTreeMap::from([
            (0, stdio(FdKind::Stdin, RIGHT_FD_READ)),
            (1, stdio(FdKind::Stdout, RIGHT_FD_WRITE)),
            (2, stdio(FdKind::Stderr, RIGHT_FD_WRITE)),
            (
                PREOPEN_FD,
                FdEntry {
                    kind: FdKind::Dir {
                        ino: ROOT,
                        preopen: Some("/".to_string()),
                    },
                    rights_base: RIGHTS_ALL,
                    rights_inheriting: RIGHTS_ALL,
                    flags: 0,
                },
            ),
        ]);
        Self { entries }
    }
}

impl FdTable {
    pub fn get(&self, fd: u32) -> Result<&FdEntry, Errno> {
        self.entries.get(&fd).ok_or(Errno::Badf)
    }

    pub fn get_mut(&mut self, fd: u32) -> Result<&mut FdEntry, Errno> {
        self.entries.get_mut(&fd).ok_or(Errno::Badf)
    }

    /// Stores `entry` under the lowest free descriptor.
    pub fn insert(&mut self, entry: FdEntry) -> u32 {
        let fd = self
            .entries
            .keys()
            .zip(0u32..)
            .find(|(fd, expected)| **fd != *expected)
            .map(|(_, expected)| expected)
            .unwrap_or(self.entries.len() as u32);
        self.entries.insert(fd, entry);
        fd
    }

    pub fn remove(&mut self, fd: u32) -> Result<FdEntry, Errno> {
        self.entries.remove(&fd).ok_or(Errno::Badf)
    }

    /// Moves `from` onto `to` and returns the entry `to` held before.
    pub fn renumber(&mut self, from: u32, to: u32) -> Result<Option<FdEntry>, Errno> {
        self.get(to)?;
        let entry = self.remove(from)?;
        Ok(self.entries.insert(to, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let table = FdTable::default();
        assert_eq!(table.get(0).unwrap().kind, FdKind::Stdin);
        assert_eq!(table.get(1).unwrap().kind, FdKind::Stdout);
        assert_eq!(table.get(2).unwrap().kind, FdKind::Stderr);
        assert_eq!(
            table.get(PREOPEN_FD).unwrap().kind,
            FdKind::Dir {
                ino: ROOT,
                preopen: Some("/".into())
            }
        );
        assert_eq!(table.get(4), Err(Errno::Badf));
    }

    #[test]
    fn test_lowest_free_fd_is_reused() {
        let mut table = FdTable::default();
        assert_eq!(table.insert(FdEntry::file(1, RIGHTS_ALL, 0)), 4);
        assert_eq!(table.insert(FdEntry::file(2, RIGHTS_ALL, 0)), 5);
        table.remove(4).unwrap();
        assert_eq!(table.insert(FdEntry::file(3, RIGHTS_ALL, 0)), 4);
        table.remove(0).unwrap();
        assert_eq!(table.insert(FdEntry::file(4, RIGHTS_ALL, 0)), 0);
        assert_eq!(table.remove(9), Err(Errno::Badf));
    }

    #[test]
    fn test_renumber() {
        let mut table = FdTable::default();
        let fd = table.insert(FdEntry::file(7, RIGHTS_ALL, 0));
        assert_eq!(table.renumber(fd, 9), Err(Errno::Badf));
        let displaced = table.renumber(fd, 1).unwrap();
        assert_eq!(displaced.map(|e| e.kind), Some(FdKind::Stdout));
        assert_eq!(table.get(1).unwrap().kind, FdKind::File { ino: 7, offset: 0 });
        assert_eq!(table.get(fd), Err(Errno::Badf));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_rights() {
        let entry = FdEntry::file(1, RIGHT_FD_READ, 0);
        assert!(entry.require(RIGHT_FD_READ).is_ok());
        assert_eq!(entry.require(RIGHT_FD_WRITE), Err(Errno::Notcapable));
        assert_eq!(entry.dir_ino(), Err(Errno::Notdir));
        assert_eq!(entry.ino(), Some(1));
        assert_eq!(FdTable::default().get(0).unwrap().ino(), None);
    }
}
