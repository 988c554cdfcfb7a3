//! The ext2 engine (`spec.md` §4.9–§4.13): superblock/group bookkeeping,
//! bitmap allocators, inode block mapping and directory entries, tied
//! together behind path-based operations the mount hub dispatches into.

pub mod bitmap;
pub mod blockgroup;
pub mod directory;
pub mod inode;
pub mod superblock;

use crate::device::transaction::Transaction;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::meta::{Metadata, OpenFlags};
use crate::path;
use directory::FoundEntry;
use inode::Inode;
use superblock::Superblock;

/// ext2 reserves inode 2 for the filesystem root, unconditionally.
pub const ROOT_INODE: u32 = 2;

pub struct Ext2Filesystem {
    pub sb: Superblock,
    pub read_only: bool,
}

/// A resolved open file: the inode number plus its current in-memory copy,
/// written back explicitly after each mutation (`spec.md` §4.13).
pub struct Handle {
    pub inode_no: u32,
    pub inode: Inode,
}

impl Ext2Filesystem {
    pub fn mount(dev: &mut BlockDevice, read_only: bool) -> Result<Self> {
        let sb = Superblock::read(dev, None)?;
        log::debug!("mounted ext2 volume: blocks={} groups={}", sb.blocks_count, sb.group_count());
        Ok(Self { sb, read_only })
    }

    fn read_inode(&mut self, dev: &mut BlockDevice, txn: Option<&mut Transaction>, inode_no: u32) -> Result<Inode> {
        inode::read_inode(&self.sb, dev, txn, inode_no)
    }

    /// Walks `components` from the root inode, requiring every intermediate
    /// component to be a directory, and returns the inode number/contents of
    /// the directory that should contain the final component.
    fn resolve_parent(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, components: &[&str]) -> Result<(u32, Inode)> {
        let mut dir_no = ROOT_INODE;
        let mut dir = self.read_inode(dev, txn.as_deref_mut(), dir_no)?;
        for &component in components {
            let found = directory::entry_by_name(&mut self.sb, dev, txn.as_deref_mut(), &mut dir, component)?
                .ok_or_else(|| Error::NoEnt(component.to_string()))?;
            if found.file_type != directory::FILE_TYPE_DIR {
                return Err(Error::NoEnt(component.to_string()));
            }
            dir_no = found.inode;
            dir = self.read_inode(dev, txn.as_deref_mut(), dir_no)?;
        }
        Ok((dir_no, dir))
    }

    fn resolve(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<(u32, Inode, FoundEntry)> {
        let (parent_components, name) = path::split_last(path).ok_or_else(|| Error::NoEnt(path.to_string()))?;
        let (parent_no, mut parent) = self.resolve_parent(dev, txn.as_deref_mut(), &parent_components)?;
        let found = directory::entry_by_name(&mut self.sb, dev, txn, &mut parent, name)?.ok_or_else(|| Error::NoEnt(path.to_string()))?;
        Ok((parent_no, parent, found))
    }

    pub fn open(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str, flags: OpenFlags) -> Result<Handle> {
        if self.read_only && flags.is_write_class() {
            return Err(Error::RoFs);
        }

        match self.resolve(dev, txn.as_deref_mut(), path) {
            Ok((_, _, found)) => {
                let mut inode = self.read_inode(dev, txn.as_deref_mut(), found.inode)?;
                if flags.contains(OpenFlags::TRUNC) {
                    self.truncate_inode(dev, txn.as_deref_mut(), &mut inode, 0)?;
                    inode::write_inode(&self.sb, dev, txn, found.inode, &inode)?;
                }
                Ok(Handle { inode_no: found.inode, inode })
            }
            Err(Error::NoEnt(_)) if flags.contains(OpenFlags::CREAT) => {
                let (parent_components, name) = path::split_last(path).ok_or_else(|| Error::NoEnt(path.to_string()))?;
                let (parent_no, mut parent) = self.resolve_parent(dev, txn.as_deref_mut(), &parent_components)?;
                let new_no = bitmap::alloc_inode(&mut self.sb, dev, txn.as_deref_mut(), false)?;
                let mut new_inode = Inode::decode(&[0u8; inode::INODE_SIZE_ON_DISK]);
                new_inode.mode = inode::S_IFREG | 0o644;
                directory::link(&mut self.sb, dev, txn, parent_no, &mut parent, new_no, &mut new_inode, name, directory::FILE_TYPE_REG)?;
                Ok(Handle { inode_no: new_no, inode: new_inode })
            }
            Err(e) => Err(e),
        }
    }

    pub fn read(&mut self, dev: &mut BlockDevice, txn: Option<&mut Transaction>, handle: &mut Handle, offset: u64, buf: &mut [u8]) -> Result<()> {
        inode::read_data(&mut self.sb, dev, txn, &mut handle.inode, offset, buf)
    }

    pub fn write(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, handle: &mut Handle, offset: u64, data: &[u8], append: bool) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        let write_offset = if append { handle.inode.size as u64 } else { offset };
        inode::write_data(&mut self.sb, dev, txn.as_deref_mut(), &mut handle.inode, write_offset, data)?;
        inode::write_inode(&self.sb, dev, txn, handle.inode_no, &handle.inode)
    }

    fn truncate_inode(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, inode: &mut Inode, new_size: u64) -> Result<()> {
        let block_size = self.sb.block_size() as u64;
        let old_size = inode.size as u64;

        if new_size < old_size {
            let old_blocks = (old_size + block_size - 1) / block_size;
            let new_blocks = (new_size + block_size - 1) / block_size;
            for l in new_blocks..old_blocks {
                let block_no = inode::unmap_block(&mut self.sb, dev, txn.as_deref_mut(), inode, l)?;
                if block_no != 0 {
                    inode.blocks = inode.blocks.saturating_sub(block_size as u32 / 512);
                    bitmap::free_block(&mut self.sb, dev, txn.as_deref_mut(), block_no)?;
                }
            }
            inode.size = new_size as u32;
        } else if new_size > old_size {
            let zeros = vec![0u8; (new_size - old_size) as usize];
            inode::write_data(&mut self.sb, dev, txn.as_deref_mut(), inode, old_size, &zeros)?;
        }
        Ok(())
    }

    pub fn truncate(&mut self, dev: &mut BlockDevice, txn: Option<&mut Transaction>, handle: &mut Handle, new_size: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        self.truncate_inode(dev, txn, &mut handle.inode, new_size)
    }

    pub fn stat(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<Metadata> {
        if path::components(path).next().is_none() {
            let inode = self.read_inode(dev, txn, ROOT_INODE)?;
            return Ok(metadata_of(ROOT_INODE, &inode));
        }
        let (_, _, found) = self.resolve(dev, txn.as_deref_mut(), path)?;
        let inode = self.read_inode(dev, txn, found.inode)?;
        Ok(metadata_of(found.inode, &inode))
    }

    pub fn read_dir(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<Vec<FoundEntry>> {
        let components: Vec<&str> = path::components(path).collect();
        let (_, mut dir) = self.resolve_parent(dev, txn.as_deref_mut(), &components)?;
        directory::entries(&mut self.sb, dev, txn, &mut dir)
    }

    pub fn mkdir(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        let (parent_components, name) = path::split_last(path).ok_or_else(|| Error::Inval("empty path"))?;
        let (parent_no, mut parent) = self.resolve_parent(dev, txn.as_deref_mut(), &parent_components)?;

        let new_no = bitmap::alloc_inode(&mut self.sb, dev, txn.as_deref_mut(), true)?;
        let mut new_inode = Inode::decode(&[0u8; inode::INODE_SIZE_ON_DISK]);
        new_inode.mode = inode::S_IFDIR | 0o755;

        directory::link(&mut self.sb, dev, txn.as_deref_mut(), parent_no, &mut parent, new_no, &mut new_inode, name, directory::FILE_TYPE_DIR)?;

        let block_size = self.sb.block_size();
        let mut block_data = vec![0u8; block_size as usize];
        write_dot_entry(&mut block_data, 0, new_no, ".");
        write_dot_entry(&mut block_data, 12, parent_no, "..");
        inode::write_data(&mut self.sb, dev, txn.as_deref_mut(), &mut new_inode, 0, &block_data)?;
        new_inode.links_count += 1; // "." pointing at itself
        inode::write_inode(&self.sb, dev, txn.as_deref_mut(), new_no, &new_inode)?;

        // The child's ".." points back at `parent_no`, so the parent gains
        // a link too.
        parent.links_count += 1;
        inode::write_inode(&self.sb, dev, txn, parent_no, &parent)
    }

    pub fn rmdir(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        let (parent_no, mut parent, found) = self.resolve(dev, txn.as_deref_mut(), path)?;
        if found.file_type != directory::FILE_TYPE_DIR {
            return Err(Error::NoEnt(path.to_string()));
        }
        let mut target = self.read_inode(dev, txn.as_deref_mut(), found.inode)?;
        let entry_count = directory::entries(&mut self.sb, dev, txn.as_deref_mut(), &mut target)?.len();
        if entry_count != 2 {
            return Err(Error::NotEmpty(path.to_string()));
        }

        let name = path::split_last(path).unwrap().1;
        let target_no = directory::unlink(&mut self.sb, dev, txn.as_deref_mut(), &mut parent, name)?;
        // The directory's own "." self-reference keeps its link count from
        // reaching zero through the ordinary unlink path, so tear it down
        // explicitly.
        let target_inode = self.read_inode(dev, txn.as_deref_mut(), target_no)?;
        directory::force_free(&mut self.sb, dev, txn.as_deref_mut(), target_no, &target_inode)?;

        parent.links_count = parent.links_count.saturating_sub(1);
        inode::write_inode(&self.sb, dev, txn, parent_no, &parent)
    }

    pub fn remove(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        let (_, mut parent, found) = self.resolve(dev, txn.as_deref_mut(), path)?;
        if found.file_type == directory::FILE_TYPE_DIR {
            return Err(Error::Inval("remove called on a directory"));
        }
        directory::unlink(&mut self.sb, dev, txn, &mut parent, path::split_last(path).unwrap().1)?;
        Ok(())
    }

    /// `spec.md` §4.7-equivalent move for ext2: target must not exist,
    /// source directories must be empty, the child's `..` is rewritten when
    /// moving a directory to a new parent.
    pub fn move_entry(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, old: &str, new: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::RoFs);
        }
        if self.resolve(dev, txn.as_deref_mut(), new).is_ok() {
            return Err(Error::Exist(new.to_string()));
        }
        let (old_parent_no, mut old_parent, found) = self.resolve(dev, txn.as_deref_mut(), old)?;

        if found.file_type == directory::FILE_TYPE_DIR {
            let mut target = self.read_inode(dev, txn.as_deref_mut(), found.inode)?;
            let entry_count = directory::entries(&mut self.sb, dev, txn.as_deref_mut(), &mut target)?.len();
            if entry_count != 2 {
                return Err(Error::NotEmpty(old.to_string()));
            }
        }

        let (new_parent_components, new_name) = path::split_last(new).ok_or_else(|| Error::Inval("empty path"))?;
        let (new_parent_no, mut new_parent) = self.resolve_parent(dev, txn.as_deref_mut(), &new_parent_components)?;
        let mut target_inode = self.read_inode(dev, txn.as_deref_mut(), found.inode)?;

        // link() then unlink() cancel out on the moved entry's own
        // i_links_count (one name gained, the other lost), leaving it
        // unchanged — exactly what a rename should do.
        directory::link(&mut self.sb, dev, txn.as_deref_mut(), new_parent_no, &mut new_parent, found.inode, &mut target_inode, new_name, found.file_type)?;

        if found.file_type == directory::FILE_TYPE_DIR && new_parent_no != old_parent_no {
            let mut sub = self.read_inode(dev, txn.as_deref_mut(), found.inode)?;
            if let Some(dotdot) = directory::entry_by_name(&mut self.sb, dev, txn.as_deref_mut(), &mut sub, "..")? {
                let mut dotdot_data = [0u8; 4];
                dotdot_data.copy_from_slice(&new_parent_no.to_le_bytes());
                inode::write_data(&mut self.sb, dev, txn.as_deref_mut(), &mut sub, dotdot.offset, &dotdot_data)?;
            }
            // The moved directory's ".." now points at the new parent, so
            // link ownership of that back-reference moves with it.
            old_parent.links_count = old_parent.links_count.saturating_sub(1);
            inode::write_inode(&self.sb, dev, txn.as_deref_mut(), old_parent_no, &old_parent)?;
            new_parent.links_count += 1;
            inode::write_inode(&self.sb, dev, txn.as_deref_mut(), new_parent_no, &new_parent)?;
        }

        let (_, old_name) = path::split_last(old).ok_or_else(|| Error::Inval("empty path"))?;
        directory::unlink(&mut self.sb, dev, txn, &mut old_parent, old_name)?;
        Ok(())
    }
}

fn metadata_of(inode_no: u32, inode: &Inode) -> Metadata {
    Metadata {
        mode: inode.mode as u32,
        ino: inode_no as u64,
        size: inode.size as u64,
        blocks: inode.blocks as u64,
        atime: inode.atime,
        mtime: inode.mtime,
        ctime: inode.ctime,
    }
}

fn write_dot_entry(block: &mut [u8], offset: usize, inode_no: u32, name: &str) {
    let rec_len = if offset == 0 { 12u16 } else { (block.len() - offset) as u16 };
    block[offset..offset + 4].copy_from_slice(&inode_no.to_le_bytes());
    block[offset + 4..offset + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[offset + 6] = name.len() as u8;
    block[offset + 7] = directory::FILE_TYPE_DIR;
    block[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_backend::MemoryBackend;

    fn format(blocks: u32) -> (Superblock, BlockDevice) {
        let mut d = BlockDevice::new("t", Box::new(MemoryBackend::new(1024, blocks as u64)), 0);
        d.init().unwrap();
        let mut sb = Superblock {
            inodes_count: 64,
            blocks_count: blocks,
            free_blocks_count: blocks - 20,
            free_inodes_count: 64 - 11,
            first_data_block: 20,
            log_block_size: 0,
            blocks_per_group: blocks,
            inodes_per_group: 64,
            rev_level: 1,
            first_ino: 11,
            inode_size: 128,
            feature_ro_compat: 0,
            feature_incompat: 0,
        };
        sb.write_all_copies(&mut d, None).unwrap();
        let desc = blockgroup::GroupDescriptor {
            block_bitmap: 2,
            inode_bitmap: 3,
            inode_table: 4,
            free_blocks_count: blocks as u16 - 20,
            free_inodes_count: 64 - 11,
            used_dirs_count: 1,
        };
        blockgroup::write_all_copies(&sb, &mut d, None, 0, &desc).unwrap();

        // inode 2 (root), pre-linked to itself as "." and ".." so
        // `resolve_parent` always has somewhere to start from.
        let mut root = Inode::decode(&[0u8; inode::INODE_SIZE_ON_DISK]);
        root.mode = inode::S_IFDIR | 0o755;
        root.links_count = 2;
        let block_size = sb.block_size();
        let mut block_data = vec![0u8; block_size as usize];
        write_dot_entry(&mut block_data, 0, ROOT_INODE, ".");
        write_dot_entry(&mut block_data, 12, ROOT_INODE, "..");
        inode::write_data(&mut sb, &mut d, None, &mut root, 0, &block_data).unwrap();
        inode::write_inode(&sb, &mut d, None, ROOT_INODE, &root).unwrap();
        (sb, d)
    }

    #[test]
    fn create_write_read_round_trips() {
        let (sb, mut d) = format(256);
        let mut fs = Ext2Filesystem { sb, read_only: false };
        let mut handle = fs.open(&mut d, None, "hello.txt", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        fs.write(&mut d, None, &mut handle, 0, b"hi there", false).unwrap();

        let mut out = [0u8; 8];
        fs.read(&mut d, None, &mut handle, 0, &mut out).unwrap();
        assert_eq!(&out, b"hi there");

        let meta = fs.stat(&mut d, None, "hello.txt").unwrap();
        assert_eq!(meta.size, 8);
        assert!(meta.is_file());
    }

    #[test]
    fn mkdir_then_rmdir_round_trips() {
        let (sb, mut d) = format(256);
        let mut fs = Ext2Filesystem { sb, read_only: false };
        fs.mkdir(&mut d, None, "sub").unwrap();
        let meta = fs.stat(&mut d, None, "sub").unwrap();
        assert!(meta.is_dir());

        fs.rmdir(&mut d, None, "sub").unwrap();
        assert!(fs.stat(&mut d, None, "sub").is_err());
    }

    #[test]
    fn truncate_grows_with_zeros() {
        let (sb, mut d) = format(256);
        let mut fs = Ext2Filesystem { sb, read_only: false };
        let mut handle = fs.open(&mut d, None, "f", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        fs.write(&mut d, None, &mut handle, 0, b"ab", false).unwrap();
        fs.truncate(&mut d, None, &mut handle, 6).unwrap();

        let mut out = [0u8; 6];
        fs.read(&mut d, None, &mut handle, 0, &mut out).unwrap();
        assert_eq!(&out, b"ab\0\0\0\0");
    }
}
