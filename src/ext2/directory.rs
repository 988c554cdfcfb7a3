//! ext2 directory entries (`spec.md` §4.12): a `rec_len`-linked byte stream,
//! iterated linearly and compacted in place on unlink.

use super::bitmap;
use super::inode::{self, Inode};
use super::superblock::Superblock;
use crate::device::transaction::Transaction;
use crate::device::BlockDevice;
use crate::error::{Error, Result};

pub const FILE_TYPE_UNKNOWN: u8 = 0;
pub const FILE_TYPE_REG: u8 = 1;
pub const FILE_TYPE_DIR: u8 = 2;

const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

impl RawEntry {
    fn actual_len(&self) -> u16 {
        round4(HEADER_SIZE as u16 + self.name_len as u16)
    }
}

fn round4(n: u16) -> u16 {
    (n + 3) & !3
}

fn decode_header(raw: &[u8]) -> RawEntry {
    RawEntry {
        inode: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        rec_len: u16::from_le_bytes([raw[4], raw[5]]),
        name_len: raw[6],
        file_type: raw[7],
    }
}

fn encode_header(e: &RawEntry, raw: &mut [u8]) {
    raw[0..4].copy_from_slice(&e.inode.to_le_bytes());
    raw[4..6].copy_from_slice(&e.rec_len.to_le_bytes());
    raw[6] = e.name_len;
    raw[7] = e.file_type;
}

#[derive(Debug, Clone)]
pub struct FoundEntry {
    pub inode: u32,
    pub name: String,
    pub file_type: u8,
    /// Byte offset, within the directory inode's data, of this entry's
    /// header.
    pub offset: u64,
    pub rec_len: u16,
}

/// Reads the whole directory inode's data (directories are small enough in
/// this crate's scope to buffer wholesale, matching the teacher's
/// whole-block-cache iteration style).
fn read_whole(sb: &mut Superblock, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, inode: &mut Inode) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; inode.size as usize];
    inode::read_data(sb, dev, txn.as_deref_mut(), inode, 0, &mut buf)?;
    Ok(buf)
}

fn write_whole(sb: &mut Superblock, dev: &mut BlockDevice, txn: Option<&mut Transaction>, inode: &mut Inode, data: &[u8]) -> Result<()> {
    inode::write_data(sb, dev, txn, inode, 0, data)
}

/// Iterates every entry (`spec.md` §4.12): skips `file_type == UNKNOWN`
/// placeholder slots left by merges, rejects zero `rec_len` as corruption.
pub fn entries(sb: &mut Superblock, dev: &mut BlockDevice, txn: Option<&mut Transaction>, inode: &mut Inode) -> Result<Vec<FoundEntry>> {
    let data = read_whole(sb, dev, txn, inode)?;
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + HEADER_SIZE <= data.len() {
        let header = decode_header(&data[pos..pos + HEADER_SIZE]);
        if header.rec_len == 0 {
            return Err(Error::Inval("zero rec_len in ext2 directory"));
        }
        if header.file_type != FILE_TYPE_UNKNOWN && header.inode != 0 {
            let name_bytes = &data[pos + HEADER_SIZE..pos + HEADER_SIZE + header.name_len as usize];
            out.push(FoundEntry {
                inode: header.inode,
                name: String::from_utf8_lossy(name_bytes).into_owned(),
                file_type: header.file_type,
                offset: pos as u64,
                rec_len: header.rec_len,
            });
        }
        pos += header.rec_len as usize;
    }
    Ok(out)
}

pub fn entry_by_name(sb: &mut Superblock, dev: &mut BlockDevice, txn: Option<&mut Transaction>, inode: &mut Inode, name: &str) -> Result<Option<FoundEntry>> {
    Ok(entries(sb, dev, txn, inode)?.into_iter().find(|e| e.name == name))
}

/// Links `name` -> `inode_no` into `dir_inode` (`spec.md` §4.12).
pub fn link(
    sb: &mut Superblock,
    dev: &mut BlockDevice,
    mut txn: Option<&mut Transaction>,
    dir_inode_no: u32,
    dir_inode: &mut Inode,
    target_inode_no: u32,
    target_inode: &mut Inode,
    name: &str,
    file_type: u8,
) -> Result<()> {
    let new_len = round4(HEADER_SIZE as u16 + name.len() as u16);
    let mut data = read_whole(sb, dev, txn.as_deref_mut(), dir_inode)?;

    let mut pos = 0usize;
    let mut spliced = false;
    while pos + HEADER_SIZE <= data.len() {
        let mut header = decode_header(&data[pos..pos + HEADER_SIZE]);
        if header.rec_len == 0 {
            return Err(Error::Inval("zero rec_len in ext2 directory"));
        }
        let actual = header.actual_len();
        if header.rec_len.saturating_sub(actual) >= new_len {
            let remainder_len = header.rec_len - actual;
            header.rec_len = actual;
            encode_header(&header, &mut data[pos..pos + HEADER_SIZE]);

            let new_pos = pos + actual as usize;
            let new_entry = RawEntry { inode: target_inode_no, rec_len: remainder_len, name_len: name.len() as u8, file_type };
            encode_header(&new_entry, &mut data[new_pos..new_pos + HEADER_SIZE]);
            data[new_pos + HEADER_SIZE..new_pos + HEADER_SIZE + name.len()].copy_from_slice(name.as_bytes());
            spliced = true;
            break;
        }
        pos += header.rec_len as usize;
    }

    if !spliced {
        let block_size = sb.block_size();
        let l = (dir_inode.size as u64) / block_size as u64;
        let block_no = inode::resolve_block(sb, dev, txn.as_deref_mut(), dir_inode, l, true)?;

        let mut block_data = vec![0u8; block_size as usize];
        let entry = RawEntry { inode: target_inode_no, rec_len: block_size as u16, name_len: name.len() as u8, file_type };
        encode_header(&entry, &mut block_data[0..HEADER_SIZE]);
        block_data[HEADER_SIZE..HEADER_SIZE + name.len()].copy_from_slice(name.as_bytes());
        dev.write_bytes(txn.as_deref_mut(), block_no as u64 * block_size as u64, &block_data)?;

        dir_inode.size += block_size;
    } else {
        write_whole(sb, dev, txn.as_deref_mut(), dir_inode, &data)?;
    }

    target_inode.links_count += 1;
    inode::write_inode(sb, dev, txn.as_deref_mut(), target_inode_no, target_inode)?;
    inode::write_inode(sb, dev, txn, dir_inode_no, dir_inode)?;
    Ok(())
}

/// Unlinks `name` from `dir_inode` (`spec.md` §4.12): merges the cleared
/// slot with the previous entry (or splices the following entry forward
/// when there is no previous entry), decrements the target's link count,
/// and frees the inode once it reaches zero.
pub fn unlink(
    sb: &mut Superblock,
    dev: &mut BlockDevice,
    mut txn: Option<&mut Transaction>,
    dir_inode: &mut Inode,
    name: &str,
) -> Result<u32> {
    let mut data = read_whole(sb, dev, txn.as_deref_mut(), dir_inode)?;

    let mut pos = 0usize;
    let mut prev: Option<usize> = None;
    let mut target: Option<(usize, RawEntry)> = None;
    while pos + HEADER_SIZE <= data.len() {
        let header = decode_header(&data[pos..pos + HEADER_SIZE]);
        if header.rec_len == 0 {
            return Err(Error::Inval("zero rec_len in ext2 directory"));
        }
        if header.file_type != FILE_TYPE_UNKNOWN && header.inode != 0 {
            let name_bytes = &data[pos + HEADER_SIZE..pos + HEADER_SIZE + header.name_len as usize];
            if name_bytes == name.as_bytes() {
                target = Some((pos, header));
                break;
            }
        }
        prev = Some(pos);
        pos += header.rec_len as usize;
    }

    let (target_pos, target_header) = target.ok_or_else(|| Error::NoEnt(name.to_string()))?;
    let target_inode_no = target_header.inode;

    let mut target_inode = inode::read_inode(sb, dev, txn.as_deref_mut(), target_inode_no)?;
    target_inode.links_count = target_inode.links_count.saturating_sub(1);

    match prev {
        Some(prev_pos) => {
            let mut prev_header = decode_header(&data[prev_pos..prev_pos + HEADER_SIZE]);
            prev_header.rec_len += target_header.rec_len;
            encode_header(&prev_header, &mut data[prev_pos..prev_pos + HEADER_SIZE]);
        }
        None => {
            // No previous entry to merge into: splice the following entry
            // forward into the cleared slot instead, absorbing the freed
            // space into its rec_len, rather than leaving a bare placeholder.
            let next_pos = target_pos + target_header.rec_len as usize;
            let next_header = if next_pos + HEADER_SIZE <= data.len() { Some(decode_header(&data[next_pos..next_pos + HEADER_SIZE])) } else { None };

            match next_header {
                Some(next_header) if next_header.rec_len != 0 => {
                    let moved_len = next_header.actual_len() as usize;
                    let moved = data[next_pos..next_pos + moved_len].to_vec();
                    data[target_pos..target_pos + moved_len].copy_from_slice(&moved);

                    let mut spliced = decode_header(&data[target_pos..target_pos + HEADER_SIZE]);
                    spliced.rec_len = spliced.rec_len.saturating_add(target_header.rec_len);
                    encode_header(&spliced, &mut data[target_pos..target_pos + HEADER_SIZE]);
                }
                _ => {
                    let cleared = RawEntry { inode: 0, rec_len: target_header.rec_len, name_len: 0, file_type: FILE_TYPE_UNKNOWN };
                    encode_header(&cleared, &mut data[target_pos..target_pos + HEADER_SIZE]);
                }
            }
        }
    }

    write_whole(sb, dev, txn.as_deref_mut(), dir_inode, &data)?;

    if target_inode.links_count == 0 {
        free_inode_blocks(sb, dev, txn.as_deref_mut(), &target_inode)?;
        bitmap::free_inode(sb, dev, txn.as_deref_mut(), target_inode_no, target_inode.is_dir())?;
    } else {
        inode::write_inode(sb, dev, txn.as_deref_mut(), target_inode_no, &target_inode)?;
    }

    Ok(target_inode_no)
}

/// Frees an inode's blocks and the inode itself unconditionally, regardless
/// of its current `links_count`. Used by directory removal, where the
/// directory's own "." self-reference means its link count never reaches
/// zero through ordinary decrement-on-unlink.
pub fn force_free(sb: &mut Superblock, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, inode_no: u32, inode: &Inode) -> Result<()> {
    free_inode_blocks(sb, dev, txn.as_deref_mut(), inode)?;
    bitmap::free_inode(sb, dev, txn, inode_no, inode.is_dir())
}

/// Frees every block (direct and indirect) an inode owns, using a bounded
/// iterative stack rather than recursion (`spec.md` §9 design notes).
fn free_inode_blocks(sb: &mut Superblock, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, inode: &Inode) -> Result<()> {
    let block_size = sb.block_size();
    let p = block_size as u64 / 4;

    for &direct in &inode.block[0..12] {
        if direct != 0 {
            bitmap::free_block(sb, dev, txn.as_deref_mut(), direct)?;
        }
    }

    // (block_number, remaining levels to descend before it's a leaf).
    let mut stack: Vec<(u32, u32)> = Vec::new();
    if inode.block[12] != 0 {
        stack.push((inode.block[12], 1));
    }
    if inode.block[13] != 0 {
        stack.push((inode.block[13], 2));
    }
    if inode.block[14] != 0 {
        stack.push((inode.block[14], 3));
    }

    while let Some((block_no, level)) = stack.pop() {
        if level > 1 {
            for i in 0..p {
                let child = read_u32(dev, txn.as_deref_mut(), block_no, i, block_size)?;
                if child != 0 {
                    stack.push((child, level - 1));
                }
            }
        } else {
            for i in 0..p {
                let leaf = read_u32(dev, txn.as_deref_mut(), block_no, i, block_size)?;
                if leaf != 0 {
                    bitmap::free_block(sb, dev, txn.as_deref_mut(), leaf)?;
                }
            }
        }
        bitmap::free_block(sb, dev, txn.as_deref_mut(), block_no)?;
    }
    Ok(())
}

fn read_u32(dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, block_no: u32, index: u64, block_size: u32) -> Result<u32> {
    let mut raw = [0u8; 4];
    dev.read_bytes(txn.as_deref_mut(), block_no as u64 * block_size as u64 + index * 4, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_backend::MemoryBackend;
    use crate::ext2::blockgroup::{self, GroupDescriptor};
    use crate::ext2::inode::INODE_SIZE_ON_DISK;

    fn setup() -> (Superblock, BlockDevice) {
        let mut d = BlockDevice::new("t", Box::new(MemoryBackend::new(1024, 4096)), 0);
        d.init().unwrap();
        let sb = Superblock {
            inodes_count: 32,
            blocks_count: 4096,
            free_blocks_count: 4000,
            free_inodes_count: 20,
            first_data_block: 20,
            log_block_size: 0,
            blocks_per_group: 4096,
            inodes_per_group: 32,
            rev_level: 1,
            first_ino: 11,
            inode_size: 128,
            feature_ro_compat: 0,
            feature_incompat: 0,
        };
        sb.write_all_copies(&mut d, None).unwrap();
        let desc = GroupDescriptor { block_bitmap: 2, inode_bitmap: 3, inode_table: 4, free_blocks_count: 4000, free_inodes_count: 20, used_dirs_count: 0 };
        blockgroup::write_all_copies(&sb, &mut d, None, 0, &desc).unwrap();
        (sb, d)
    }

    #[test]
    fn link_two_then_unlink_one_leaves_the_other_reachable() {
        let (mut sb, mut d) = setup();
        let mut dir_inode = Inode::decode(&[0u8; INODE_SIZE_ON_DISK]);
        dir_inode.size = sb.block_size();
        let block_size = sb.block_size() as usize;
        inode::write_data(&mut sb, &mut d, None, &mut dir_inode, 0, &vec![0u8; block_size]).unwrap();
        // A directory block always starts life as one entry spanning the
        // whole block, same as `link`'s append-a-fresh-block path.
        let mut whole = vec![0u8; sb.block_size() as usize];
        let placeholder = RawEntry { inode: 0, rec_len: sb.block_size() as u16, name_len: 0, file_type: FILE_TYPE_UNKNOWN };
        encode_header(&placeholder, &mut whole[0..HEADER_SIZE]);
        inode::write_data(&mut sb, &mut d, None, &mut dir_inode, 0, &whole).unwrap();

        let mut inode_a = Inode::decode(&[0u8; INODE_SIZE_ON_DISK]);
        inode_a.mode = inode::S_IFREG;
        let mut inode_b = inode_a;

        link(&mut sb, &mut d, None, 11, &mut dir_inode, 12, &mut inode_a, "a", FILE_TYPE_REG).unwrap();
        link(&mut sb, &mut d, None, 11, &mut dir_inode, 13, &mut inode_b, "b", FILE_TYPE_REG).unwrap();
        unlink(&mut sb, &mut d, None, &mut dir_inode, "a").unwrap();

        let found = entries(&mut sb, &mut d, None, &mut dir_inode).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "b");

        let remaining_inode = inode::read_inode(&sb, &mut d, None, 13).unwrap();
        assert_eq!(remaining_inode.links_count, 1);
    }

    #[test]
    fn unlink_without_a_previous_entry_splices_the_next_one_forward() {
        let (mut sb, mut d) = setup();
        let mut dir_inode = Inode::decode(&[0u8; INODE_SIZE_ON_DISK]);
        dir_inode.size = sb.block_size();
        let block_size = sb.block_size() as usize;
        inode::write_data(&mut sb, &mut d, None, &mut dir_inode, 0, &vec![0u8; block_size]).unwrap();
        let mut whole = vec![0u8; sb.block_size() as usize];
        let placeholder = RawEntry { inode: 0, rec_len: sb.block_size() as u16, name_len: 0, file_type: FILE_TYPE_UNKNOWN };
        encode_header(&placeholder, &mut whole[0..HEADER_SIZE]);
        inode::write_data(&mut sb, &mut d, None, &mut dir_inode, 0, &whole).unwrap();

        let mut inode_a = Inode::decode(&[0u8; INODE_SIZE_ON_DISK]);
        inode_a.mode = inode::S_IFREG;
        let mut inode_b = inode_a;

        link(&mut sb, &mut d, None, 11, &mut dir_inode, 12, &mut inode_a, "a", FILE_TYPE_REG).unwrap();
        link(&mut sb, &mut d, None, 11, &mut dir_inode, 13, &mut inode_b, "b", FILE_TYPE_REG).unwrap();

        // "a" is first in the block, so unlinking it has no previous entry
        // to merge into — the splice path must pull "b" forward instead of
        // leaving a dangling placeholder in front of it.
        unlink(&mut sb, &mut d, None, &mut dir_inode, "a").unwrap();

        let found = entries(&mut sb, &mut d, None, &mut dir_inode).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "b");
        assert_eq!(found[0].offset, 0); // spliced forward into "a"'s old slot
        assert_eq!(found[0].rec_len, 24); // absorbed "a"'s freed 12 bytes
    }
}
