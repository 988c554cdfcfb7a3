//! The block group descriptor table (`spec.md` §4.9): one 32-byte descriptor
//! per group, packed back-to-back starting at [`Superblock::bgdt_start_block`].

use super::superblock::Superblock;
use crate::device::transaction::Transaction;
use crate::device::BlockDevice;
use crate::error::Result;

pub const DESCRIPTOR_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    fn decode(raw: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        let u16_at = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        Self {
            block_bitmap: u32_at(0),
            inode_bitmap: u32_at(4),
            inode_table: u32_at(8),
            free_blocks_count: u16_at(12),
            free_inodes_count: u16_at(14),
            used_dirs_count: u16_at(16),
        }
    }

    fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        raw[0..4].copy_from_slice(&self.block_bitmap.to_le_bytes());
        raw[4..8].copy_from_slice(&self.inode_bitmap.to_le_bytes());
        raw[8..12].copy_from_slice(&self.inode_table.to_le_bytes());
        raw[12..14].copy_from_slice(&self.free_blocks_count.to_le_bytes());
        raw[14..16].copy_from_slice(&self.free_inodes_count.to_le_bytes());
        raw[16..18].copy_from_slice(&self.used_dirs_count.to_le_bytes());
        raw
    }
}

fn table_offset(sb: &Superblock, group: u32) -> u64 {
    sb.bgdt_start_block() as u64 * sb.block_size() as u64 + group as u64 * DESCRIPTOR_SIZE as u64
}

pub fn read(sb: &Superblock, dev: &mut BlockDevice, txn: Option<&mut Transaction>, group: u32) -> Result<GroupDescriptor> {
    let mut raw = [0u8; DESCRIPTOR_SIZE];
    dev.read_bytes(txn, table_offset(sb, group), &mut raw)?;
    Ok(GroupDescriptor::decode(&raw))
}

/// Writes the descriptor for `group`, fanning out to every superblock copy
/// per `spec.md` §4.9's "superblock write fan-out MUST update every copy."
pub fn write_all_copies(
    sb: &Superblock,
    dev: &mut BlockDevice,
    mut txn: Option<&mut Transaction>,
    group: u32,
    descriptor: &GroupDescriptor,
) -> Result<()> {
    let raw = descriptor.encode();
    for g in 0..sb.group_count() {
        if sb.group_has_superblock(g) {
            let group_base = g as u64 * sb.blocks_per_group as u64 * sb.block_size() as u64;
            let offset = group_base + sb.bgdt_start_block() as u64 * sb.block_size() as u64 + group as u64 * DESCRIPTOR_SIZE as u64;
            dev.write_bytes(txn.as_deref_mut(), offset, &raw)?;
        }
    }
    Ok(())
}
