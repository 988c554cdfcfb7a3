//! Portable FAT12/16/32 and ext2 filesystem engines over a generic block
//! device, fronted by a single mount registry.

pub mod error;
pub mod meta;
pub mod mutex;
pub mod path;
pub mod util;

pub mod device;

pub mod ext2;
pub mod fat;

pub mod mount;

pub use error::{Error, Result};
pub use mount::{Filesystem, FsKind};
