//! Block and inode bitmap allocators (`spec.md` §4.10).

use super::blockgroup::{self, GroupDescriptor};
use super::superblock::Superblock;
use crate::device::transaction::Transaction;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::util::bitmap::BitMap;

fn read_bitmap(dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, block: u32, block_size: u32, bit_count: usize) -> Result<BitMap> {
    let mut raw = vec![0u8; block_size as usize];
    dev.read_bytes(txn.as_deref_mut(), block as u64 * block_size as u64, &mut raw)?;
    Ok(BitMap::from_bytes(raw, bit_count))
}

fn write_bitmap(dev: &mut BlockDevice, txn: Option<&mut Transaction>, block: u32, block_size: u32, bitmap: BitMap) -> Result<()> {
    let mut raw = bitmap.into_bytes();
    raw.resize(block_size as usize, 0);
    dev.write_bytes(txn, block as u64 * block_size as u64, &raw)
}

/// Allocates a free block (`spec.md` §4.10 block allocator): scans groups
/// ascending, claims the lowest clear bit, zeroes the block, and persists
/// both counters.
pub fn alloc_block(sb: &mut Superblock, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>) -> Result<u32> {
    let block_size = sb.block_size();

    for group in 0..sb.group_count() {
        let mut descriptor = blockgroup::read(sb, dev, txn.as_deref_mut(), group)?;
        if descriptor.free_blocks_count == 0 {
            continue;
        }

        let bits_in_group = sb.blocks_per_group.min(sb.blocks_count - group * sb.blocks_per_group) as usize;
        let mut bitmap = read_bitmap(dev, txn.as_deref_mut(), descriptor.block_bitmap, block_size, bits_in_group)?;
        let bit = bitmap.next_empty_bit().map_err(|_| Error::NoSpc)?;
        bitmap.set(bit, true).ok();
        write_bitmap(dev, txn.as_deref_mut(), descriptor.block_bitmap, block_size, bitmap)?;

        descriptor.free_blocks_count -= 1;
        blockgroup::write_all_copies(sb, dev, txn.as_deref_mut(), group, &descriptor)?;

        sb.free_blocks_count -= 1;
        sb.write_all_copies(dev, txn.as_deref_mut())?;

        let block_no = sb.first_data_block + group * sb.blocks_per_group + bit as u32;
        let zeros = vec![0u8; block_size as usize];
        dev.write_bytes(txn, block_no as u64 * block_size as u64, &zeros)?;

        log::debug!("allocated ext2 block {block_no} in group {group}");
        return Ok(block_no);
    }
    Err(Error::NoSpc)
}

pub fn free_block(sb: &mut Superblock, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, block_no: u32) -> Result<()> {
    let block_size = sb.block_size();
    let relative = block_no - sb.first_data_block;
    let group = relative / sb.blocks_per_group;
    let bit = (relative % sb.blocks_per_group) as usize;

    let mut descriptor = blockgroup::read(sb, dev, txn.as_deref_mut(), group)?;
    let bits_in_group = sb.blocks_per_group.min(sb.blocks_count - group * sb.blocks_per_group) as usize;
    let mut bitmap = read_bitmap(dev, txn.as_deref_mut(), descriptor.block_bitmap, block_size, bits_in_group)?;
    bitmap.set(bit, false).map_err(|_| Error::Inval("block index out of range"))?;
    write_bitmap(dev, txn.as_deref_mut(), descriptor.block_bitmap, block_size, bitmap)?;

    descriptor.free_blocks_count += 1;
    blockgroup::write_all_copies(sb, dev, txn.as_deref_mut(), group, &descriptor)?;
    sb.free_blocks_count += 1;
    sb.write_all_copies(dev, txn)
}

/// Allocates a free inode, respecting the reserved-inode floor
/// (`s_first_ino`, or 11 on rev-0).
pub fn alloc_inode(sb: &mut Superblock, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, want_dir: bool) -> Result<u32> {
    let block_size = sb.block_size();

    for group in 0..sb.group_count() {
        let mut descriptor = blockgroup::read(sb, dev, txn.as_deref_mut(), group)?;
        if descriptor.free_inodes_count == 0 {
            continue;
        }

        let bits_in_group = sb.inodes_per_group as usize;
        let mut bitmap = read_bitmap(dev, txn.as_deref_mut(), descriptor.inode_bitmap, block_size, bits_in_group)?;

        let mut chosen = None;
        for bit in 0..bits_in_group {
            let inode_no = group * sb.inodes_per_group + bit as u32 + 1;
            if inode_no < sb.first_ino {
                continue; // reserved
            }
            if bitmap.get(bit) == Ok(false) {
                chosen = Some(bit);
                break;
            }
        }
        let bit = match chosen {
            Some(b) => b,
            None => continue,
        };

        bitmap.set(bit, true).ok();
        write_bitmap(dev, txn.as_deref_mut(), descriptor.inode_bitmap, block_size, bitmap)?;

        descriptor.free_inodes_count -= 1;
        if want_dir {
            descriptor.used_dirs_count += 1;
        }
        blockgroup::write_all_copies(sb, dev, txn.as_deref_mut(), group, &descriptor)?;

        sb.free_inodes_count -= 1;
        sb.write_all_copies(dev, txn)?;

        let inode_no = group * sb.inodes_per_group + bit as u32 + 1;
        log::debug!("allocated ext2 inode {inode_no} in group {group}");
        return Ok(inode_no);
    }
    Err(Error::NoSpc)
}

pub fn free_inode(sb: &mut Superblock, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, inode_no: u32, was_dir: bool) -> Result<()> {
    let block_size = sb.block_size();
    let group = (inode_no - 1) / sb.inodes_per_group;
    let bit = ((inode_no - 1) % sb.inodes_per_group) as usize;

    let mut descriptor = blockgroup::read(sb, dev, txn.as_deref_mut(), group)?;
    let mut bitmap = read_bitmap(dev, txn.as_deref_mut(), descriptor.inode_bitmap, block_size, sb.inodes_per_group as usize)?;
    bitmap.set(bit, false).map_err(|_| Error::Inval("inode index out of range"))?;
    write_bitmap(dev, txn.as_deref_mut(), descriptor.inode_bitmap, block_size, bitmap)?;

    descriptor.free_inodes_count += 1;
    if was_dir {
        descriptor.used_dirs_count = descriptor.used_dirs_count.saturating_sub(1);
    }
    blockgroup::write_all_copies(sb, dev, txn.as_deref_mut(), group, &descriptor)?;
    sb.free_inodes_count += 1;
    sb.write_all_copies(dev, txn)
}

pub fn write_descriptor(dev: &mut BlockDevice, txn: Option<&mut Transaction>, sb: &Superblock, group: u32, descriptor: &GroupDescriptor) -> Result<()> {
    blockgroup::write_all_copies(sb, dev, txn, group, descriptor)
}
