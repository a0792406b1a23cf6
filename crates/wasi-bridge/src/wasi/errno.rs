use thiserror::Error;

use crate::vfs::VfsError;

/// The preview1 errno values the shim reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[repr(u16)]
pub enum Errno {
    #[error("permission denied")]
    Acces = 2,
    #[error("resource unavailable, try again")]
    Again = 6,
    #[error("bad file descriptor")]
    Badf = 8,
    #[error("file exists")]
    Exist = 20,
    #[error("bad address")]
    Fault = 21,
    #[error("file too large")]
    Fbig = 22,
    #[error("illegal byte sequence")]
    Ilseq = 25,
    #[error("invalid argument")]
    Inval = 28,
    #[error("i/o error")]
    Io = 29,
    #[error("is a directory")]
    Isdir = 31,
    #[error("filename too long")]
    Nametoolong = 37,
    #[error("no such file or directory")]
    Noent = 44,
    #[error("function not supported")]
    Nosys = 52,
    #[error("not a directory")]
    Notdir = 54,
    #[error("directory not empty")]
    Notempty = 55,
    #[error("not supported")]
    Notsup = 58,
    #[error("value too large")]
    Overflow = 61,
    #[error("invalid seek")]
    Spipe = 70,
    #[error("capabilities insufficient")]
    Notcapable = 76,
}

impl Errno {
    pub fn raw(self) -> i32 {
        self as u16 as i32
    }
}

impl From<VfsError> for Errno {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::NotFound(_) => Errno::Noent,
            VfsError::NotADirectory(_) => Errno::Notdir,
            VfsError::IsADirectory(_) => Errno::Isdir,
            VfsError::AlreadyExists(_) => Errno::Exist,
            VfsError::NotEmpty(_) => Errno::Notempty,
            VfsError::InvalidPath(_) | VfsError::InvalidSnapshot(_) => Errno::Inval,
            VfsError::FileTooLarge { .. } => Errno::Fbig,
        }
    }
}

impl From<std::num::TryFromIntError> for Errno {
    fn from(_: std::num::TryFromIntError) -> Self {
        Errno::Overflow
    }
}
