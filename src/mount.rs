//! The mount registry (`spec.md` §4.2/§4.3): owns every [`BlockDevice`],
//! routes a path to the engine mounted over the longest matching prefix, and
//! keeps the one-transaction-per-device overlay `spec.md` §4.3 describes.
//!
//! This hub is path-at-a-time rather than handle-at-a-time: an engine's
//! `open` result borrows its own superblock (FAT) or stands alone (ext2),
//! and threading that borrow back out across further hub calls would make
//! [`Filesystem`] self-referential. Every operation below resolves the
//! mount, opens, acts, and (for mutations) persists in one call instead.

use std::collections::HashMap;

use crate::device::transaction::Transaction;
use crate::device::{BlockDevice, BlockDeviceBackend};
use crate::error::{Error, Result};
use crate::ext2::Ext2Filesystem;
use crate::fat::FatFilesystem;
use crate::meta::{Metadata, OpenFlags};
use crate::path;

/// Which engine a mount point is served by.
pub enum MountedFs {
    Fat(FatFilesystem),
    Ext2(Ext2Filesystem),
}

pub struct MountEntry {
    pub mount_point: String,
    pub device_name: String,
    pub fs: MountedFs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat,
    Ext2,
}

#[derive(Default)]
pub struct Filesystem {
    devices: HashMap<String, BlockDevice>,
    mounts: Vec<MountEntry>,
    transactions: HashMap<String, Transaction>,
}

impl Filesystem {
    pub fn new() -> Self {
        Self { devices: HashMap::new(), mounts: Vec::new(), transactions: HashMap::new() }
    }

    /// Registers and opens a device under `name` (`spec.md` §4.1's
    /// reference-counted `init`).
    pub fn add_device(&mut self, name: impl Into<String>, backend: Box<dyn BlockDeviceBackend>, part_offset: u64) -> Result<()> {
        let name = name.into();
        let mut dev = BlockDevice::new(name.clone(), backend, part_offset);
        dev.init()?;
        self.devices.insert(name, dev);
        Ok(())
    }

    pub fn device_mut(&mut self, name: &str) -> Result<&mut BlockDevice> {
        self.devices.get_mut(name).ok_or_else(|| Error::NoDev(name.to_string()))
    }

    /// Mounts `device_name` at `mount_point` (`spec.md` §4.2): every mount
    /// point must be unique and end in `/` so prefix matching is unambiguous.
    pub fn mount(&mut self, device_name: &str, mount_point: &str, kind: FsKind, read_only: bool) -> Result<()> {
        if !mount_point.ends_with(path::SEPARATOR) {
            return Err(Error::Inval("mount point must end in '/'"));
        }
        if self.mounts.iter().any(|m| m.mount_point == mount_point) {
            return Err(Error::Exist(mount_point.to_string()));
        }

        let dev = self.device_mut(device_name)?;
        let fs = match kind {
            FsKind::Fat => MountedFs::Fat(FatFilesystem::mount(dev, read_only)?),
            FsKind::Ext2 => MountedFs::Ext2(Ext2Filesystem::mount(dev, read_only)?),
        };
        dev.set_mounted_as(Some(mount_point.to_string()));

        log::debug!("mounted {device_name} at {mount_point}");
        self.mounts.push(MountEntry { mount_point: mount_point.to_string(), device_name: device_name.to_string(), fs });
        Ok(())
    }

    pub fn unmount(&mut self, mount_point: &str) -> Result<()> {
        let idx = self.mounts.iter().position(|m| m.mount_point == mount_point).ok_or_else(|| Error::NoDev(mount_point.to_string()))?;
        let entry = self.mounts.remove(idx);
        if let Some(dev) = self.devices.get_mut(&entry.device_name) {
            dev.set_mounted_as(None);
        }
        Ok(())
    }

    fn find_mount(&mut self, path: &str) -> Result<(usize, String)> {
        let candidates = self.mounts.iter().map(|m| m.mount_point.as_str());
        let (idx, mp) = path::longest_prefix_index(path, candidates).ok_or_else(|| Error::NoEnt(path.to_string()))?;
        Ok((idx, mp.to_string()))
    }

    /// Starts a write-buffering transaction on `device_name` (`spec.md`
    /// §4.3): only one may be open per device at a time.
    pub fn begin_transaction(&mut self, device_name: &str) -> Result<()> {
        if !self.devices.contains_key(device_name) {
            return Err(Error::NoDev(device_name.to_string()));
        }
        if self.transactions.contains_key(device_name) {
            return Err(Error::Already);
        }
        self.transactions.insert(device_name.to_string(), Transaction::new());
        Ok(())
    }

    pub fn commit_transaction(&mut self, device_name: &str) -> Result<()> {
        let mut txn = self.transactions.remove(device_name).ok_or(Error::Already)?;
        let dev = self.device_mut(device_name)?;
        txn.commit(|block_id, block_count, data| dev.write_block(block_id, block_count, data))
    }

    pub fn rollback_transaction(&mut self, device_name: &str) -> Result<()> {
        let txn = self.transactions.get_mut(device_name).ok_or(Error::Already)?;
        txn.rollback();
        self.transactions.remove(device_name);
        Ok(())
    }

    fn with_mount<R>(&mut self, path: &str, f: impl FnOnce(&mut BlockDevice, Option<&mut Transaction>, &mut MountedFs, &str) -> Result<R>) -> Result<R> {
        let (idx, mp) = self.find_mount(path)?;
        let rel = &path[mp.len()..];
        let device_name = self.mounts[idx].device_name.clone();
        let dev = self.devices.get_mut(&device_name).ok_or_else(|| Error::NoDev(device_name.clone()))?;
        let mut txn = self.transactions.get_mut(&device_name);
        f(dev, txn.as_deref_mut(), &mut self.mounts[idx].fs, rel)
    }

    pub fn read(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_mount(path, |dev, mut txn, fs, rel| match fs {
            MountedFs::Fat(fat) => {
                let handle = fat.open(dev, txn.as_deref_mut(), rel, OpenFlags::RDONLY)?;
                handle.read(dev, txn, offset, buf).map(|_| ())
            }
            MountedFs::Ext2(ext2) => {
                let mut handle = ext2.open(dev, txn.as_deref_mut(), rel, OpenFlags::RDONLY)?;
                ext2.read(dev, txn, &mut handle, offset, buf)
            }
        })
    }

    pub fn write(&mut self, path: &str, offset: u64, data: &[u8], flags: OpenFlags, append: bool) -> Result<()> {
        self.with_mount(path, |dev, mut txn, fs, rel| match fs {
            MountedFs::Fat(fat) => {
                let mut handle = fat.open(dev, txn.as_deref_mut(), rel, flags)?;
                handle.write(dev, txn.as_deref_mut(), offset, data, append)?;
                fat.persist(dev, txn, rel, &handle)
            }
            MountedFs::Ext2(ext2) => {
                let mut handle = ext2.open(dev, txn.as_deref_mut(), rel, flags)?;
                ext2.write(dev, txn, &mut handle, offset, data, append)
            }
        })
    }

    pub fn truncate(&mut self, path: &str, new_size: u64) -> Result<()> {
        self.with_mount(path, |dev, mut txn, fs, rel| match fs {
            MountedFs::Fat(fat) => {
                let mut handle = fat.open(dev, txn.as_deref_mut(), rel, OpenFlags::RDWR)?;
                handle.truncate(dev, txn.as_deref_mut(), new_size)?;
                fat.persist(dev, txn, rel, &handle)
            }
            MountedFs::Ext2(ext2) => {
                let mut handle = ext2.open(dev, txn.as_deref_mut(), rel, OpenFlags::RDWR)?;
                ext2.truncate(dev, txn, &mut handle, new_size)
            }
        })
    }

    pub fn stat(&mut self, path: &str) -> Result<Metadata> {
        self.with_mount(path, |dev, txn, fs, rel| match fs {
            MountedFs::Fat(fat) => fat.stat(dev, txn, rel),
            MountedFs::Ext2(ext2) => ext2.stat(dev, txn, rel),
        })
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.with_mount(path, |dev, txn, fs, rel| match fs {
            MountedFs::Fat(fat) => fat.mkdir(dev, txn, rel),
            MountedFs::Ext2(ext2) => ext2.mkdir(dev, txn, rel),
        })
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.with_mount(path, |dev, txn, fs, rel| match fs {
            MountedFs::Fat(fat) => fat.rmdir(dev, txn, rel),
            MountedFs::Ext2(ext2) => ext2.rmdir(dev, txn, rel),
        })
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.with_mount(path, |dev, txn, fs, rel| match fs {
            MountedFs::Fat(fat) => fat.remove(dev, txn, rel),
            MountedFs::Ext2(ext2) => ext2.remove(dev, txn, rel),
        })
    }

    pub fn read_dir(&mut self, path: &str) -> Result<Vec<String>> {
        self.with_mount(path, |dev, txn, fs, rel| match fs {
            MountedFs::Fat(fat) => Ok(fat.read_dir(dev, txn, rel)?.into_iter().map(|e| e.name).collect()),
            MountedFs::Ext2(ext2) => Ok(ext2.read_dir(dev, txn, rel)?.into_iter().map(|e| e.name).collect()),
        })
    }

    /// Moves `old` to `new`. Both paths MUST resolve to the same mount
    /// (`spec.md` §4.7 cross-filesystem moves are a separate copy+remove the
    /// caller composes; this hub only performs the in-place rename).
    pub fn move_entry(&mut self, old: &str, new: &str) -> Result<()> {
        let (old_idx, old_mp) = self.find_mount(old)?;
        let (new_idx, new_mp) = self.find_mount(new)?;
        if old_idx != new_idx {
            return Err(Error::NotSup("cross-filesystem move"));
        }
        let old_rel = old[old_mp.len()..].to_string();
        let new_rel = new[new_mp.len()..].to_string();

        let device_name = self.mounts[old_idx].device_name.clone();
        let dev = self.devices.get_mut(&device_name).ok_or_else(|| Error::NoDev(device_name.clone()))?;
        let mut txn = self.transactions.get_mut(&device_name);
        match &mut self.mounts[old_idx].fs {
            MountedFs::Fat(fat) => fat.move_entry(dev, txn.as_deref_mut(), &old_rel, &new_rel),
            MountedFs::Ext2(ext2) => ext2.move_entry(dev, txn.as_deref_mut(), &old_rel, &new_rel),
        }
    }
}
