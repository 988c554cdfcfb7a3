//! The FAT12/16/32 engine (`spec.md` §4.4–§4.8): superblock discovery,
//! cluster arithmetic, directory iteration/mutation, file I/O and stat,
//! tied together behind path-based operations the mount hub dispatches
//! into.

pub mod dirent;
pub mod directory;
pub mod file;
pub mod superblock;
pub mod table;

use crate::device::transaction::Transaction;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::meta::{Metadata, OpenFlags};
use crate::path;
use directory::{DirLocation, Directory, FoundEntry};
use file::FileHandle;
use superblock::Superblock;

pub struct FatFilesystem {
    pub sb: Superblock,
    pub read_only: bool,
}

impl FatFilesystem {
    /// Reads the 512-byte boot sector at the start of the partition and
    /// parses it (`spec.md` §4.4).
    pub fn mount(dev: &mut BlockDevice, read_only: bool) -> Result<Self> {
        let mut boot = vec![0u8; 512];
        dev.read_bytes(None, 0, &mut boot)?;
        let sb = Superblock::parse(&boot)?;
        log::debug!("mounted FAT volume: type={:?} clusters={}", sb.fat_type, sb.total_clusters);
        Ok(Self { sb, read_only })
    }

    fn root(&self) -> Directory<'_> {
        Directory::root(&self.sb)
    }

    /// Walks `components` from the root, requiring every intermediate
    /// component to be a directory, and returns the directory that should
    /// contain the final component (not included in `components`).
    fn resolve_parent(
        &self,
        dev: &mut BlockDevice,
        mut txn: Option<&mut Transaction>,
        components: &[&str],
    ) -> Result<Directory<'_>> {
        let mut dir = self.root();
        for &component in components {
            let found = dir
                .lookup(dev, txn.as_deref_mut(), component)?
                .ok_or_else(|| Error::NoEnt(component.to_string()))?;
            if !found.short.is_directory() {
                return Err(Error::NoEnt(component.to_string()));
            }
            dir = Directory::new(&self.sb, DirLocation::Chain { start_cluster: found.short.first_cluster() });
        }
        Ok(dir)
    }

    fn resolve(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<(Directory<'_>, FoundEntry)> {
        let (parent_components, name) = path::split_last(path).ok_or_else(|| Error::NoEnt(path.to_string()))?;
        let parent = self.resolve_parent(dev, txn.as_deref_mut(), &parent_components)?;
        let found = parent.lookup(dev, txn, name)?.ok_or_else(|| Error::NoEnt(path.to_string()))?;
        Ok((parent, found))
    }

    pub fn open(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str, flags: OpenFlags) -> Result<FileHandle<'_>> {
        if self.read_only && flags.is_write_class() {
            return Err(Error::RoFs);
        }

        match self.resolve(dev, txn.as_deref_mut(), path) {
            Ok((_, found)) => {
                if flags.contains(OpenFlags::TRUNC) {
                    let mut handle = FileHandle::new(&self.sb, found.short, found.short_offset);
                    handle.truncate(dev, txn.as_deref_mut(), 0)?;
                    self.persist(dev, txn, path, &handle)?;
                    return self.open_existing(path, &handle);
                }
                Ok(FileHandle::new(&self.sb, found.short, found.short_offset))
            }
            Err(Error::NoEnt(_)) if flags.contains(OpenFlags::CREAT) => {
                let (parent_components, name) = path::split_last(path).ok_or_else(|| Error::NoEnt(path.to_string()))?;
                let mut parent = self.resolve_parent(dev, txn.as_deref_mut(), &parent_components)?;
                let short = parent.insert(dev, txn, name, false)?;
                Ok(FileHandle::new(&self.sb, short, 0))
            }
            Err(e) => Err(e),
        }
    }

    fn open_existing<'s>(&'s self, _path: &str, handle: &FileHandle<'s>) -> Result<FileHandle<'s>> {
        Ok(FileHandle::new(&self.sb, handle.short, handle.short_offset))
    }

    /// Rewrites the parent's short-entry slot for `path` after a mutating
    /// file operation (`spec.md` §4.8's "rewrite the short entry" step).
    pub fn persist(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str, handle: &FileHandle<'_>) -> Result<()> {
        let (parent, _) = self.resolve(dev, txn.as_deref_mut(), path)?;
        parent.rewrite_short(dev, txn, handle.short_offset, &handle.short)
    }

    pub fn stat(&self, dev: &mut BlockDevice, txn: Option<&mut Transaction>, path: &str) -> Result<Metadata> {
        let (_, found) = self.resolve(dev, txn, path)?;
        Ok(FileHandle::new(&self.sb, found.short, found.short_offset).stat())
    }

    pub fn read_dir(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<Vec<FoundEntry>> {
        if path::components(path).next().is_none() {
            return self.root().entries(dev, txn);
        }
        let components: Vec<&str> = path::components(path).collect();
        let dir = self.resolve_parent(dev, txn.as_deref_mut(), &components[..components.len() - 1])?;
        let found = dir
            .lookup(dev, txn.as_deref_mut(), components[components.len() - 1])?
            .ok_or_else(|| Error::NoEnt(path.to_string()))?;
        Directory::new(&self.sb, DirLocation::Chain { start_cluster: found.short.first_cluster() }).entries(dev, txn)
    }

    pub fn mkdir(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        let (parent_components, name) = path::split_last(path).ok_or_else(|| Error::Inval("empty path"))?;
        let mut parent = self.resolve_parent(dev, txn.as_deref_mut(), &parent_components)?;
        parent.insert(dev, txn, name, true)?;
        Ok(())
    }

    pub fn rmdir(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        let (parent, found) = self.resolve(dev, txn.as_deref_mut(), path)?;
        if !found.short.is_directory() {
            return Err(Error::NoEnt(path.to_string()));
        }
        let sub = Directory::new(&self.sb, DirLocation::Chain { start_cluster: found.short.first_cluster() });
        let entry_count = sub.entries(dev, txn.as_deref_mut())?.len();
        if entry_count != 2 {
            return Err(Error::NotEmpty(path.to_string()));
        }
        parent.unlink(dev, txn, &found)
    }

    pub fn remove(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        let (parent, found) = self.resolve(dev, txn.as_deref_mut(), path)?;
        if found.short.is_directory() {
            return Err(Error::Inval("remove called on a directory"));
        }
        parent.unlink(dev, txn, &found)
    }

    /// `spec.md` §4.7 move: target must not exist, source directories must
    /// be empty, `..` is rewritten when moving a directory.
    pub fn move_entry(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, old: &str, new: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        if self.resolve(dev, txn.as_deref_mut(), new).is_ok() {
            return Err(Error::Exist(new.to_string()));
        }
        let (old_parent, found) = self.resolve(dev, txn.as_deref_mut(), old)?;

        if found.short.is_directory() {
            let sub = Directory::new(&self.sb, DirLocation::Chain { start_cluster: found.short.first_cluster() });
            let entry_count = sub.entries(dev, txn.as_deref_mut())?.len();
            if entry_count != 2 {
                return Err(Error::NotEmpty(old.to_string()));
            }
        }

        let (new_parent_components, new_name) = path::split_last(new).ok_or_else(|| Error::Inval("empty path"))?;
        let mut new_parent = self.resolve_parent(dev, txn.as_deref_mut(), &new_parent_components)?;
        let new_parent_cluster = match new_parent.location {
            DirLocation::Chain { start_cluster } => start_cluster,
            DirLocation::Root { .. } => 0,
        };

        // Insert as a plain placeholder slot (never directory-flavored): the
        // real attributes/cluster/size are carried over from `found.short`
        // below, so insert() must not also allocate a fresh first cluster
        // and `.`/`..` pair for what is, in fact, an existing directory.
        let mut new_short = found.short;
        let name_for_insert = new_name.to_string();
        let inserted = new_parent.insert(dev, txn.as_deref_mut(), &name_for_insert, false)?;
        new_short.name = inserted.name;
        let inserted_found = new_parent
            .lookup(dev, txn.as_deref_mut(), &name_for_insert)?
            .ok_or(Error::Io("inserted entry vanished"))?;
        new_parent.rewrite_short(dev, txn.as_deref_mut(), inserted_found.short_offset, &new_short)?;

        if found.short.is_directory() && found.short.first_cluster() != 0 {
            let sub = Directory::new(&self.sb, DirLocation::Chain { start_cluster: found.short.first_cluster() });
            if let Some(dotdot) = sub.lookup(dev, txn.as_deref_mut(), "..")? {
                let mut dotdot_short = dotdot.short;
                dotdot_short.set_first_cluster(new_parent_cluster, self.sb.fat_type == superblock::FatType::Fat32);
                sub.rewrite_short(dev, txn.as_deref_mut(), dotdot.short_offset, &dotdot_short)?;
            }
        }

        old_parent.unlink(dev, txn, &found)
    }
}
