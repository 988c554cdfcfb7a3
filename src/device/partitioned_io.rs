//! Partitioned, byte-addressed I/O layered over the block-aligned BDI
//! (`spec.md` §4.1, component 2), with the [`Transaction`] overlay spliced
//! in at the single seam every block read/write passes through.

use super::BlockDevice;
use crate::device::transaction::Transaction;
use crate::error::{Error, Result};

fn read_blocks(dev: &mut BlockDevice, txn: Option<&mut Transaction>, block_id: u64, block_count: u32) -> Result<Vec<u8>> {
    let block_size = dev.block_size();
    match txn {
        Some(txn) => txn.read(block_id, block_count, block_size, |b, c| {
            let mut buf = vec![0u8; c as usize * block_size as usize];
            dev.read_block(b, c, &mut buf)?;
            Ok(buf)
        }),
        None => {
            let mut buf = vec![0u8; block_count as usize * block_size as usize];
            dev.read_block(block_id, block_count, &mut buf)?;
            Ok(buf)
        }
    }
}

fn write_blocks(dev: &mut BlockDevice, txn: Option<&mut Transaction>, block_id: u64, block_count: u32, data: &[u8]) -> Result<()> {
    let block_size = dev.block_size();
    match txn {
        Some(txn) => txn.write(block_id, block_count, block_size, data),
        None => dev.write_block(block_id, block_count, data),
    }
}

/// Reads `buf.len()` bytes starting at partition-relative byte `offset`,
/// performing the head/body/tail splitting `spec.md` §4.1 describes.
pub fn read_bytes(dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, offset: u64, buf: &mut [u8]) -> Result<()> {
    let block_size = dev.block_size() as u64;
    let part_size = dev.part_size();
    let len = buf.len() as u64;

    if offset + len > part_size {
        return Err(Error::Inval("read past end of partition"));
    }
    if len == 0 {
        return Ok(());
    }

    let mut remaining = len;
    let mut cursor = offset;
    let mut out_pos = 0usize;

    // Head: straddling block, if misaligned.
    let head_off = cursor % block_size;
    if head_off != 0 {
        let block_id = cursor / block_size;
        let block = read_blocks(dev, txn.as_deref_mut(), block_id, 1)?;
        let take = core::cmp::min(block_size - head_off, remaining);
        buf[out_pos..out_pos + take as usize]
            .copy_from_slice(&block[head_off as usize..head_off as usize + take as usize]);
        cursor += take;
        remaining -= take;
        out_pos += take as usize;
    }

    // Body: aligned whole blocks, transferred directly.
    let body_blocks = remaining / block_size;
    if body_blocks > 0 {
        let block_id = cursor / block_size;
        let block = read_blocks(dev, txn.as_deref_mut(), block_id, body_blocks as u32)?;
        buf[out_pos..out_pos + block.len()].copy_from_slice(&block);
        let consumed = body_blocks * block_size;
        cursor += consumed;
        remaining -= consumed;
        out_pos += consumed as usize;
    }

    // Tail: trailing partial block.
    if remaining > 0 {
        let block_id = cursor / block_size;
        let block = read_blocks(dev, txn, block_id, 1)?;
        buf[out_pos..out_pos + remaining as usize].copy_from_slice(&block[..remaining as usize]);
    }

    Ok(())
}

/// Writes `buf` at partition-relative byte `offset`, read-modify-writing
/// any unaligned head/tail block through the device's scratch path.
pub fn write_bytes(dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, offset: u64, buf: &[u8]) -> Result<()> {
    let block_size = dev.block_size() as u64;
    let part_size = dev.part_size();
    let len = buf.len() as u64;

    if offset + len > part_size {
        return Err(Error::Inval("write past end of partition"));
    }
    if len == 0 {
        return Ok(());
    }

    let mut remaining = len;
    let mut cursor = offset;
    let mut in_pos = 0usize;

    let head_off = cursor % block_size;
    if head_off != 0 {
        let block_id = cursor / block_size;
        let mut block = read_blocks(dev, txn.as_deref_mut(), block_id, 1)?;
        let take = core::cmp::min(block_size - head_off, remaining);
        block[head_off as usize..head_off as usize + take as usize]
            .copy_from_slice(&buf[in_pos..in_pos + take as usize]);
        write_blocks(dev, txn.as_deref_mut(), block_id, 1, &block)?;
        cursor += take;
        remaining -= take;
        in_pos += take as usize;
    }

    let body_blocks = remaining / block_size;
    if body_blocks > 0 {
        let block_id = cursor / block_size;
        write_blocks(dev, txn.as_deref_mut(), block_id, body_blocks as u32, &buf[in_pos..in_pos + (body_blocks * block_size) as usize])?;
        let consumed = body_blocks * block_size;
        cursor += consumed;
        remaining -= consumed;
        in_pos += consumed as usize;
    }

    if remaining > 0 {
        let block_id = cursor / block_size;
        let mut block = read_blocks(dev, txn.as_deref_mut(), block_id, 1)?;
        block[..remaining as usize].copy_from_slice(&buf[in_pos..in_pos + remaining as usize]);
        write_blocks(dev, txn, block_id, 1, &block)?;
    }

    Ok(())
}
