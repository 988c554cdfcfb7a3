//! The FAT directory scanner and its mutating operations (`spec.md` §4.6,
//! §4.7): a byte-stream view over either the fixed root-directory region
//! (FAT12/16) or a cluster chain (everything else), with VFAT long-name
//! assembly layered over the 8.3 short entries.

use super::dirent::{
    build_long_entries, decode_long_name, generate_short_name, LongEntry, ShortEntry, ATTR_ARCHIVE, ATTR_DIRECTORY,
    ATTR_LONG_NAME, ATTR_VOLUME_ID, DELETED_MARKER, DOT_MARKER, ENTRY_SIZE, FREE_MARKER,
};
use super::superblock::{FatType, Superblock};
use super::table::{self, ClusterEntry};
use crate::device::transaction::Transaction;
use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Where a directory's byte stream lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirLocation {
    /// FAT12/16 fixed-size root region.
    Root { start_sector: u32, sector_count: u32 },
    /// A normal cluster chain (FAT32 root, or any subdirectory).
    Chain { start_cluster: u32 },
}

/// One directory entry found by the iterator, with the slot offsets needed
/// to mutate it later.
#[derive(Debug, Clone)]
pub struct FoundEntry {
    pub name: String,
    pub short: ShortEntry,
    pub short_offset: u64,
    pub long_offsets: Vec<u64>,
}

pub struct Directory<'s> {
    pub sb: &'s Superblock,
    pub location: DirLocation,
}

impl<'s> Directory<'s> {
    pub fn new(sb: &'s Superblock, location: DirLocation) -> Self {
        Self { sb, location }
    }

    pub fn root(sb: &'s Superblock) -> Self {
        match sb.fat_type {
            FatType::Fat32 => Self::new(sb, DirLocation::Chain { start_cluster: sb.root_cluster }),
            _ => Self::new(sb, DirLocation::Root { start_sector: sb.root_dir_start_sector(), sector_count: sb.root_dir_sectors }),
        }
    }

    /// Current byte length of the directory's backing stream. For a chain
    /// this walks the chain to count clusters.
    pub fn size(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>) -> Result<u64> {
        match self.location {
            DirLocation::Root { sector_count, .. } => Ok(sector_count as u64 * self.sb.bytes_per_sector as u64),
            DirLocation::Chain { start_cluster } => {
                if start_cluster == 0 {
                    return Ok(0);
                }
                let mut count = 1u64;
                let mut current = start_cluster;
                loop {
                    match table::next(self.sb, dev, txn.as_deref_mut(), current)? {
                        ClusterEntry::Next(c) => {
                            current = c;
                            count += 1;
                        }
                        _ => break,
                    }
                }
                Ok(count * self.sb.bytes_per_cluster() as u64)
            }
        }
    }

    fn absolute_offset(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, offset: u64) -> Result<u64> {
        match self.location {
            DirLocation::Root { start_sector, .. } => Ok(start_sector as u64 * self.sb.bytes_per_sector as u64 + offset),
            DirLocation::Chain { start_cluster } => {
                let cluster_size = self.sb.bytes_per_cluster() as u64;
                let index = (offset / cluster_size) as u32;
                let cluster = table::get_by_num(self.sb, dev, txn.as_deref_mut(), start_cluster, index)?;
                Ok(self.sb.to_lba(cluster) as u64 * self.sb.bytes_per_sector as u64 + offset % cluster_size)
            }
        }
    }

    fn read_slot(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, offset: u64) -> Result<[u8; ENTRY_SIZE]> {
        let abs = self.absolute_offset(dev, txn.as_deref_mut(), offset)?;
        let mut raw = [0u8; ENTRY_SIZE];
        dev.read_bytes(txn, abs, &mut raw)?;
        Ok(raw)
    }

    fn write_slot(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, offset: u64, raw: &[u8; ENTRY_SIZE]) -> Result<()> {
        let abs = self.absolute_offset(dev, txn.as_deref_mut(), offset)?;
        dev.write_bytes(txn, abs, raw)
    }

    /// Allocates and zero-fills one new cluster, linking it onto the end of
    /// the chain. Only valid for [`DirLocation::Chain`].
    fn extend_by_cluster(&mut self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>) -> Result<u32> {
        let start_cluster = match self.location {
            DirLocation::Chain { start_cluster } => start_cluster,
            DirLocation::Root { .. } => return Err(Error::NoSpc),
        };

        let new_cluster = table::get_free(self.sb, dev, txn.as_deref_mut())?;
        table::set(self.sb, dev, txn.as_deref_mut(), new_cluster, ClusterEntry::End)?;

        let zeros = vec![0u8; self.sb.bytes_per_cluster() as usize];
        let lba = self.sb.to_lba(new_cluster) as u64 * self.sb.bytes_per_sector as u64;
        dev.write_bytes(txn.as_deref_mut(), lba, &zeros)?;

        if start_cluster == 0 {
            self.location = DirLocation::Chain { start_cluster: new_cluster };
        } else {
            let mut tail = start_cluster;
            loop {
                match table::next(self.sb, dev, txn.as_deref_mut(), tail)? {
                    ClusterEntry::Next(c) => tail = c,
                    _ => break,
                }
            }
            table::set(self.sb, dev, txn, tail, ClusterEntry::Next(new_cluster))?;
        }
        Ok(new_cluster)
    }

    /// Walks every entry, invoking `f` with each. Stops early if `f` returns
    /// `Some`.
    pub fn find_map<T>(
        &self,
        dev: &mut BlockDevice,
        mut txn: Option<&mut Transaction>,
        mut f: impl FnMut(&FoundEntry) -> Option<T>,
    ) -> Result<Option<T>> {
        let size = self.size(dev, txn.as_deref_mut())?;
        let mut pos = 0u64;
        let mut scratch = [0u16; 260];
        let mut long_offsets: Vec<u64> = Vec::new();
        let mut last_checksum: Option<u8> = None;

        while pos < size {
            let raw = self.read_slot(dev, txn.as_deref_mut(), pos)?;
            let first_byte = raw[0];
            let attr = raw[11];

            if first_byte == FREE_MARKER {
                pos += ENTRY_SIZE as u64;
                continue;
            }
            if first_byte == DELETED_MARKER {
                long_offsets.clear();
                last_checksum = None;
                pos += ENTRY_SIZE as u64;
                continue;
            }
            if attr == ATTR_LONG_NAME {
                let long = LongEntry::decode(&raw);
                long.write_into(&mut scratch);
                long_offsets.push(pos);
                last_checksum = Some(long.checksum);
                pos += ENTRY_SIZE as u64;
                continue;
            }
            if attr & ATTR_VOLUME_ID != 0 && attr & ATTR_DIRECTORY == 0 {
                long_offsets.clear();
                last_checksum = None;
                pos += ENTRY_SIZE as u64;
                continue;
            }

            let short = ShortEntry::decode(&raw);
            let name = if !long_offsets.is_empty() && last_checksum == Some(short.vfat_checksum()) {
                decode_long_name(&scratch)
            } else {
                if !long_offsets.is_empty() {
                    log::warn!("VFAT checksum mismatch, falling back to 8.3 name");
                }
                short.short_name_string()
            };

            let found = FoundEntry { name, short, short_offset: pos, long_offsets: core::mem::take(&mut long_offsets) };
            last_checksum = None;
            scratch = [0u16; 260];

            if let Some(result) = f(&found) {
                return Ok(Some(result));
            }
            pos += ENTRY_SIZE as u64;
        }
        Ok(None)
    }

    pub fn entries(&self, dev: &mut BlockDevice, txn: Option<&mut Transaction>) -> Result<Vec<FoundEntry>> {
        let mut out = Vec::new();
        self.find_map(dev, txn, |e| {
            out.push(e.clone());
            None::<()>
        })?;
        Ok(out)
    }

    pub fn lookup(&self, dev: &mut BlockDevice, txn: Option<&mut Transaction>, name: &str) -> Result<Option<FoundEntry>> {
        self.find_map(dev, txn, |e| if e.name == name { Some(e.clone()) } else { None })
    }

    /// Inserts `name` (`spec.md` §4.7): generates a collision-free 8.3 alias,
    /// finds or makes room, and writes the long+short entry sequence.
    pub fn insert(
        &mut self,
        dev: &mut BlockDevice,
        mut txn: Option<&mut Transaction>,
        name: &str,
        is_dir: bool,
    ) -> Result<ShortEntry> {
        if self.lookup(dev, txn.as_deref_mut(), name)?.is_some() {
            return Err(Error::Exist(name.to_string()));
        }

        let existing_shorts = self.entries(dev, txn.as_deref_mut())?;
        let short_name = generate_short_name(name, |candidate| existing_shorts.iter().any(|e| &e.short.name == candidate));

        let mut short = ShortEntry {
            name: short_name,
            attr: if is_dir { ATTR_DIRECTORY } else { ATTR_ARCHIVE },
            creation_time: 0,
            creation_date: 0,
            last_access_date: 0,
            first_cluster_hi: 0,
            write_time: 0,
            write_date: 0,
            first_cluster_lo: 0,
            file_size: 0,
        };

        let checksum = short.vfat_checksum();
        let longs = build_long_entries(name, checksum);
        let need_entries = longs.len() + 1;

        let run_start = self.find_free_run(dev, txn.as_deref_mut(), need_entries)?;
        let run_start = match run_start {
            Some(start) => start,
            None => {
                let size_before = self.size(dev, txn.as_deref_mut())?;
                self.extend_by_cluster(dev, txn.as_deref_mut())?;
                size_before
            }
        };

        if is_dir {
            let first_cluster = table::get_free(self.sb, dev, txn.as_deref_mut())?;
            table::set(self.sb, dev, txn.as_deref_mut(), first_cluster, ClusterEntry::End)?;
            short.set_first_cluster(first_cluster, self.sb.fat_type == FatType::Fat32);
            self.write_dot_entries(dev, txn.as_deref_mut(), first_cluster)?;
        }

        let mut offset = run_start;
        for long in &longs {
            self.write_slot(dev, txn.as_deref_mut(), offset, &long.encode())?;
            offset += ENTRY_SIZE as u64;
        }
        self.write_slot(dev, txn.as_deref_mut(), offset, &short.encode())?;

        Ok(short)
    }

    fn write_dot_entries(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, first_cluster: u32) -> Result<()> {
        let parent_cluster = match self.location {
            DirLocation::Chain { start_cluster } => start_cluster,
            DirLocation::Root { .. } => 0,
        };
        let zeros = vec![0u8; self.sb.bytes_per_cluster() as usize];
        let lba = self.sb.to_lba(first_cluster) as u64 * self.sb.bytes_per_sector as u64;
        dev.write_bytes(txn.as_deref_mut(), lba, &zeros)?;

        let is_fat32 = self.sb.fat_type == FatType::Fat32;
        let mut dot_name = [b' '; 11];
        dot_name[0] = DOT_MARKER;
        let mut dotdot_name = dot_name;
        dotdot_name[1] = DOT_MARKER;

        let mut dot = ShortEntry {
            name: dot_name,
            attr: ATTR_DIRECTORY,
            creation_time: 0,
            creation_date: 0,
            last_access_date: 0,
            first_cluster_hi: 0,
            write_time: 0,
            write_date: 0,
            first_cluster_lo: 0,
            file_size: 0,
        };
        dot.set_first_cluster(first_cluster, is_fat32);
        let mut dotdot = ShortEntry { name: dotdot_name, ..dot };
        dotdot.set_first_cluster(parent_cluster, is_fat32);

        dev.write_bytes(txn.as_deref_mut(), lba, &dot.encode())?;
        dev.write_bytes(txn, lba + ENTRY_SIZE as u64, &dotdot.encode())?;
        Ok(())
    }

    fn find_free_run(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, need: usize) -> Result<Option<u64>> {
        let size = self.size(dev, txn.as_deref_mut())?;
        let mut pos = 0u64;
        let mut run_start: Option<u64> = None;
        let mut run_len = 0usize;

        while pos < size {
            let raw = self.read_slot(dev, txn.as_deref_mut(), pos)?;
            if raw[0] == FREE_MARKER || raw[0] == DELETED_MARKER {
                if run_len == 0 {
                    run_start = Some(pos);
                }
                run_len += 1;
                if run_len >= need {
                    return Ok(run_start);
                }
            } else {
                run_len = 0;
                run_start = None;
            }
            pos += ENTRY_SIZE as u64;
        }
        Ok(None)
    }

    /// Unlinks the entry found at `found` (`spec.md` §4.7): marks every
    /// slot deleted and, for directories, frees the owned cluster chain.
    pub fn unlink(&self, dev: &mut BlockDevice, mut txn: Option<&mut Transaction>, found: &FoundEntry) -> Result<()> {
        if found.short.is_directory() && found.short.first_cluster() != 0 {
            table::free_chain(self.sb, dev, txn.as_deref_mut(), found.short.first_cluster())?;
        }
        for &offset in &found.long_offsets {
            let mut raw = [0u8; ENTRY_SIZE];
            raw[0] = DELETED_MARKER;
            self.write_slot(dev, txn.as_deref_mut(), offset, &raw)?;
        }
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = DELETED_MARKER;
        self.write_slot(dev, txn, found.short_offset, &raw)?;
        Ok(())
    }

    /// Rewrites the short entry at `offset` in place (used by file
    /// write/truncate to update `file_size` and the cluster pointer).
    pub fn rewrite_short(&self, dev: &mut BlockDevice, txn: Option<&mut Transaction>, offset: u64, short: &ShortEntry) -> Result<()> {
        self.write_slot(dev, txn, offset, &short.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_backend::MemoryBackend;
    use crate::fat::superblock::FatType;

    fn fat16_superblock() -> Superblock {
        Superblock {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sector_count: 1,
            table_count: 1,
            root_entry_count: 16,
            hidden_sector_count: 0,
            media_type: 0xF8,
            fat_type: FatType::Fat16,
            root_cluster: 0,
            fat_size: 2,
            total_sectors: 200,
            root_dir_sectors: 1,
            first_data_sector: 4,
            first_fat_sector: 1,
            data_sectors: 196,
            total_clusters: 196,
        }
    }

    fn dev() -> BlockDevice {
        let mut d = BlockDevice::new("t", Box::new(MemoryBackend::new(512, 200)), 0);
        d.init().unwrap();
        d
    }

    #[test]
    fn insert_then_lookup_round_trips_long_name() {
        let sb = fat16_superblock();
        let mut d = dev();
        let mut root = Directory::root(&sb);

        root.insert(&mut d, None, "asdftolongname2.jpeg", false).unwrap();
        let found = root.lookup(&mut d, None, "asdftolongname2.jpeg").unwrap().unwrap();
        assert_eq!(found.name, "asdftolongname2.jpeg");
    }

    #[test]
    fn insert_rejects_duplicate_name() {
        let sb = fat16_superblock();
        let mut d = dev();
        let mut root = Directory::root(&sb);
        root.insert(&mut d, None, "a.txt", false).unwrap();
        assert!(matches!(root.insert(&mut d, None, "a.txt", false), Err(Error::Exist(_))));
    }

    #[test]
    fn unlink_removes_entry() {
        let sb = fat16_superblock();
        let mut d = dev();
        let mut root = Directory::root(&sb);
        root.insert(&mut d, None, "a.txt", false).unwrap();
        let found = root.lookup(&mut d, None, "a.txt").unwrap().unwrap();
        root.unlink(&mut d, None, &found).unwrap();
        assert!(root.lookup(&mut d, None, "a.txt").unwrap().is_none());
    }

    #[test]
    fn mkdir_writes_dot_and_dotdot() {
        let sb = fat16_superblock();
        let mut d = dev();
        let mut root = Directory::root(&sb);
        let short = root.insert(&mut d, None, "sub", true).unwrap();

        let sub = Directory::new(&sb, DirLocation::Chain { start_cluster: short.first_cluster() });
        let entries = sub.entries(&mut d, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, ".");
        assert_eq!(entries[1].name, "..");
    }
}
