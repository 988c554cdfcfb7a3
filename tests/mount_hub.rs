//! End-to-end exercises of `mount::Filesystem` routing requests into the
//! FAT and ext2 engines over an in-memory backend, in place of the
//! `fat12.img`/`fat16.img`/`fat32.img`/`ext2.img` fixtures a build with a
//! real disk image would mount.

use blockfs::device::{BlockDeviceBackend, Geometry};
use blockfs::error::Error;
use blockfs::meta::OpenFlags;
use blockfs::mount::{Filesystem, FsKind};

struct MemoryBackend {
    data: Vec<u8>,
    block_size: u32,
}

impl MemoryBackend {
    fn new(block_size: u32, block_count: u64) -> Self {
        Self { data: vec![0u8; block_size as usize * block_count as usize], block_size }
    }
}

impl BlockDeviceBackend for MemoryBackend {
    fn open(&mut self) -> blockfs::error::Result<Geometry> {
        Ok(Geometry { block_size: self.block_size, part_size: self.data.len() as u64 })
    }

    fn close(&mut self) -> blockfs::error::Result<()> {
        Ok(())
    }

    fn read(&mut self, block_id: u64, block_count: u32, buf: &mut [u8]) -> blockfs::error::Result<()> {
        let start = block_id as usize * self.block_size as usize;
        let len = block_count as usize * self.block_size as usize;
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(())
    }

    fn write(&mut self, block_id: u64, block_count: u32, buf: &[u8]) -> blockfs::error::Result<()> {
        let start = block_id as usize * self.block_size as usize;
        let len = block_count as usize * self.block_size as usize;
        self.data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }
}

/// Builds the 512-byte FAT16 boot sector this crate's own superblock
/// parser expects, then writes it directly into `fs`'s backend.
fn format_fat16(fs: &mut Filesystem, device_name: &str, total_sectors: u16) {
    let mut boot = vec![0u8; 512];
    boot[0x00B..0x00D].copy_from_slice(&512u16.to_le_bytes());
    boot[0x00D] = 1; // sectors_per_cluster
    boot[0x00E..0x010].copy_from_slice(&1u16.to_le_bytes());
    boot[0x010] = 1; // one FAT
    boot[0x011..0x013].copy_from_slice(&16u16.to_le_bytes());
    boot[0x013..0x015].copy_from_slice(&total_sectors.to_le_bytes());
    boot[0x015] = 0xF8;
    boot[0x016..0x018].copy_from_slice(&4u16.to_le_bytes());
    boot[510] = 0x55;
    boot[511] = 0xAA;

    fs.add_device(device_name, Box::new(MemoryBackend::new(512, total_sectors as u64)), 0).unwrap();
    fs.device_mut(device_name).unwrap().write_bytes(None, 0, &boot).unwrap();
}

#[test]
fn fat_mount_create_write_read_round_trips() {
    let mut fs = Filesystem::new();
    format_fat16(&mut fs, "ram0", 2000);
    fs.mount("ram0", "/fat16/", FsKind::Fat, false).unwrap();

    fs.write("/fat16/hello.txt", 0, b"world\n", OpenFlags::RDWR | OpenFlags::CREAT, false).unwrap();

    let mut buf = [0u8; 6];
    fs.read("/fat16/hello.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"world\n");

    let meta = fs.stat("/fat16/hello.txt").unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.size, 6);
}

#[test]
fn fat_mount_mkdir_move_and_remove() {
    let mut fs = Filesystem::new();
    format_fat16(&mut fs, "ram0", 2000);
    fs.mount("ram0", "/fat16/", FsKind::Fat, false).unwrap();

    fs.mkdir("/fat16/hello").unwrap();
    fs.write("/fat16/asdf.txt", 0, b"data", OpenFlags::RDWR | OpenFlags::CREAT, false).unwrap();

    fs.move_entry("/fat16/asdf.txt", "/fat16/hello/asdf.txt").unwrap();
    assert!(matches!(fs.stat("/fat16/asdf.txt"), Err(Error::NoEnt(_))));
    assert!(fs.stat("/fat16/hello/asdf.txt").unwrap().is_file());

    let names = fs.read_dir("/fat16/hello").unwrap();
    assert!(names.contains(&"asdf.txt".to_string()));

    fs.remove("/fat16/hello/asdf.txt").unwrap();
    fs.rmdir("/fat16/hello").unwrap();
    assert!(matches!(fs.stat("/fat16/hello"), Err(Error::NoEnt(_))));
}

#[test]
fn unmounted_path_is_not_found() {
    let mut fs = Filesystem::new();
    assert!(matches!(fs.read("/nowhere/x", 0, &mut [0u8; 1]), Err(Error::NoEnt(_))));
}

#[test]
fn routes_to_the_right_device_when_an_earlier_mount_does_not_match() {
    // A non-matching mount registered first used to corrupt the routing:
    // filtering candidates before enumerating them reindexed the surviving
    // match against the filtered subsequence instead of `self.mounts`.
    let mut fs = Filesystem::new();
    format_fat16(&mut fs, "usb", 2000);
    format_fat16(&mut fs, "fat", 2000);
    fs.mount("usb", "/usb/", FsKind::Fat, false).unwrap();
    fs.mount("fat", "/fat/", FsKind::Fat, false).unwrap();

    fs.write("/fat/hello.txt", 0, b"world", OpenFlags::RDWR | OpenFlags::CREAT, false).unwrap();

    let mut buf = [0u8; 5];
    fs.read("/fat/hello.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"world");
    assert!(matches!(fs.stat("/usb/hello.txt"), Err(Error::NoEnt(_))));
}

#[test]
fn duplicate_mount_point_is_rejected() {
    let mut fs = Filesystem::new();
    format_fat16(&mut fs, "ram0", 2000);
    format_fat16(&mut fs, "ram1", 2000);
    fs.mount("ram0", "/fat16/", FsKind::Fat, false).unwrap();
    assert!(matches!(fs.mount("ram1", "/fat16/", FsKind::Fat, false), Err(Error::Exist(_))));
}

#[test]
fn read_only_mount_rejects_writes() {
    let mut fs = Filesystem::new();
    format_fat16(&mut fs, "ram0", 2000);
    fs.mount("ram0", "/fat16/", FsKind::Fat, true).unwrap();
    assert!(matches!(
        fs.write("/fat16/a.txt", 0, b"x", OpenFlags::RDWR | OpenFlags::CREAT, false),
        Err(Error::RoFs)
    ));
}

#[test]
fn transaction_commit_persists_writes() {
    let mut fs = Filesystem::new();
    format_fat16(&mut fs, "ram0", 2000);
    fs.mount("ram0", "/fat16/", FsKind::Fat, false).unwrap();

    fs.begin_transaction("ram0").unwrap();
    assert!(matches!(fs.begin_transaction("ram0"), Err(Error::Already)));
    fs.write("/fat16/hello.txt", 0, b"world", OpenFlags::RDWR | OpenFlags::CREAT, false).unwrap();
    fs.commit_transaction("ram0").unwrap();

    let mut buf = [0u8; 5];
    fs.read("/fat16/hello.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"world");
}
