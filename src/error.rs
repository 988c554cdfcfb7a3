//! The error taxonomy shared by every engine in this crate.
//!
//! Each engine propagates the first error it hits verbatim; nothing in this
//! crate synthesizes a different code for the same underlying condition.

use thiserror::Error;

/// One error kind per `spec.md` §7, plus enough context to be useful in a
/// `Display` impl.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Inval(&'static str),

    #[error("no such path: {0}")]
    NoEnt(String),

    #[error("already exists: {0}")]
    Exist(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("unsupported: {0}")]
    NotSup(&'static str),

    #[error("permission denied: {0}")]
    Perm(&'static str),

    #[error("read-only filesystem")]
    RoFs,

    #[error("out of memory")]
    NoMem,

    #[error("no space left on device")]
    NoSpc,

    #[error("cluster chain ended early")]
    NxIo,

    #[error("a transaction is already open")]
    Already,

    #[error("device busy: {0}")]
    Busy(String),

    #[error("i/o error: {0}")]
    Io(&'static str),

    #[error("seek past end of device")]
    Fault,

    #[error("no backend bound to device")]
    NoData,

    #[error("no such mount or device: {0}")]
    NoDev(String),
}

pub type Result<T> = core::result::Result<T, Error>;
