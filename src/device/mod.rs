//! The Block Device Interface (BDI): a uniform fixed-block I/O façade over a
//! host-supplied backend, per `spec.md` §4.1/§6.
//!
//! The six function pointers the original C contract passes around become a
//! capability trait here, per the design notes' guidance — a host implements
//! [`BlockDeviceBackend`] once per kind of storage (raw file, RAM disk, an
//! SD-card driver, …) and hands an owned `Box<dyn BlockDeviceBackend>` to
//! [`BlockDevice::new`].

pub mod partitioned_io;
pub mod transaction;

use crate::error::{Error, Result};

/// Geometry a backend reports once it has opened its backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per block; must be a power of two, >= 512.
    pub block_size: u32,
    /// Size of the partition window, in bytes; must be a multiple of `block_size`.
    pub part_size: u64,
}

/// The backend contract a host implements to back a [`BlockDevice`].
///
/// `open`/`close` are distinct from construction: a `BlockDeviceBackend` can
/// be constructed (e.g. holding a file path) well before anything touches
/// the backing storage, mirroring `spec.md`'s `reference_counter`-gated
/// open/close lifecycle.
pub trait BlockDeviceBackend {
    fn open(&mut self) -> Result<Geometry>;
    fn close(&mut self) -> Result<()>;

    /// Transfers exactly `block_count` blocks starting at `block_id` into
    /// `buf` (`buf.len() == block_count * block_size`). MUST fail with
    /// [`Error::Io`] rather than perform a short read.
    fn read(&mut self, block_id: u64, block_count: u32, buf: &mut [u8]) -> Result<()>;

    /// Transfers exactly `block_count` blocks from `buf` starting at
    /// `block_id`. MUST fail with [`Error::Io`] rather than perform a short
    /// write.
    fn write(&mut self, block_id: u64, block_count: u32, buf: &[u8]) -> Result<()>;

    /// Default no-op: hosts embedding this crate in a multi-threaded
    /// environment can interpose a real mutex here.
    fn lock(&mut self) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reserved for backends that support dynamic block-size adjustment.
    fn resize(&mut self, _new_block_size: u32) -> Result<()> {
        Err(Error::NotSup("resize"))
    }
}

/// A block device bound to a partition window: a block size, a reference
/// count nesting `init`/`fini`, a one-block scratch buffer, and the backend
/// trait object doing the actual I/O.
pub struct BlockDevice {
    name: String,
    backend: Box<dyn BlockDeviceBackend>,

    block_size: u32,
    part_offset: u64,
    part_size: u64,
    block_count: u64,

    reference_count: u32,
    scratch: Vec<u8>,

    read_count: u64,
    write_count: u64,

    filename: Option<String>,
    /// The mount-point string of the filesystem currently mounted on this
    /// device, if any — an identity key rather than a raw back-pointer, per
    /// the design notes (breaks the BlockDevice <-> Filesystem ownership
    /// cycle the teacher's `bdev.fs` pointer would otherwise create).
    mounted_as: Option<String>,
}

impl BlockDevice {
    /// Registers a device under `name`, unopened. `part_offset` is a byte
    /// offset within the backend's address space; the backend itself
    /// reports `part_size` (and `block_size`) once opened.
    pub fn new(name: impl Into<String>, backend: Box<dyn BlockDeviceBackend>, part_offset: u64) -> Self {
        Self {
            name: name.into(),
            backend,
            block_size: 0,
            part_offset,
            part_size: 0,
            block_count: 0,
            reference_count: 0,
            scratch: Vec::new(),
            read_count: 0,
            write_count: 0,
            filename: None,
            mounted_as: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted_as.is_some()
    }

    pub fn mounted_as(&self) -> Option<&str> {
        self.mounted_as.as_deref()
    }

    pub(crate) fn set_mounted_as(&mut self, mount_point: Option<String>) {
        self.mounted_as = mount_point;
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// Idempotent open: increments the reference count and only opens the
    /// backend on the 0 -> 1 transition.
    pub fn init(&mut self) -> Result<()> {
        if self.reference_count == 0 {
            let geometry = self.backend.open()?;
            if geometry.block_size == 0 || !geometry.block_size.is_power_of_two() || geometry.block_size < 512 {
                return Err(Error::Inval("block_size must be a power of two >= 512"));
            }
            if geometry.part_size % geometry.block_size as u64 != 0 {
                return Err(Error::Inval("block_size must divide part_size"));
            }
            self.block_size = geometry.block_size;
            self.part_size = geometry.part_size;
            self.block_count = geometry.part_size / geometry.block_size as u64;
            self.scratch = vec![0u8; geometry.block_size as usize];
        }
        self.reference_count += 1;
        Ok(())
    }

    /// Idempotent close: decrements the reference count and only closes the
    /// backend on the transition to 0.
    pub fn fini(&mut self) -> Result<()> {
        if self.reference_count == 0 {
            return Err(Error::Io("fini called on an unopened device"));
        }
        self.reference_count -= 1;
        if self.reference_count == 0 {
            self.backend.close()?;
        }
        Ok(())
    }

    pub fn set_filename(&mut self, filename: impl Into<String>) {
        self.filename = Some(filename.into());
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Block-aligned bulk transfer. `block_id` is relative to the start of
    /// the partition window.
    pub fn read_block(&mut self, block_id: u64, block_count: u32, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        self.check_block_range(block_id, block_count)?;
        self.backend.lock()?;
        let result = self.backend.read(self.to_absolute_block(block_id), block_count, buf);
        self.backend.unlock()?;
        result?;
        self.read_count += 1;
        Ok(())
    }

    pub fn write_block(&mut self, block_id: u64, block_count: u32, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_block_range(block_id, block_count)?;
        self.backend.lock()?;
        let result = self.backend.write(self.to_absolute_block(block_id), block_count, buf);
        self.backend.unlock()?;
        result?;
        self.write_count += 1;
        Ok(())
    }

    pub fn resize(&mut self, new_block_size: u32) -> Result<()> {
        self.backend.resize(new_block_size)
    }

    /// Byte-addressed read within the partition window, transparently
    /// handling unaligned head/tail blocks (`spec.md` §4.1) and consulting
    /// `txn` first when a transaction is open on this device.
    pub fn read_bytes(&mut self, txn: Option<&mut transaction::Transaction>, offset: u64, buf: &mut [u8]) -> Result<()> {
        partitioned_io::read_bytes(self, txn, offset, buf)
    }

    /// Byte-addressed write within the partition window; see [`BlockDevice::read_bytes`].
    pub fn write_bytes(&mut self, txn: Option<&mut transaction::Transaction>, offset: u64, buf: &[u8]) -> Result<()> {
        partitioned_io::write_bytes(self, txn, offset, buf)
    }

    fn to_absolute_block(&self, block_id: u64) -> u64 {
        (self.part_offset / self.block_size as u64) + block_id
    }

    fn check_open(&self) -> Result<()> {
        if self.reference_count == 0 {
            Err(Error::Io("device is not open"))
        } else {
            Ok(())
        }
    }

    fn check_block_range(&self, block_id: u64, block_count: u32) -> Result<()> {
        if block_id + block_count as u64 > self.block_count {
            Err(Error::Inval("block range out of range"))
        } else {
            Ok(())
        }
    }
}

impl core::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockDevice")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("part_size", &self.part_size)
            .field("reference_count", &self.reference_count)
            .field("mounted_as", &self.mounted_as)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_backend {
    //! An in-memory [`BlockDeviceBackend`] used across this crate's tests —
    //! the `no_std`-agnostic analogue of the teacher's file-backed test
    //! storage.

    use super::*;

    pub struct MemoryBackend {
        data: Vec<u8>,
        block_size: u32,
        opened: bool,
    }

    impl MemoryBackend {
        pub fn new(block_size: u32, block_count: u64) -> Self {
            Self { data: vec![0u8; block_size as usize * block_count as usize], block_size, opened: false }
        }
    }

    impl BlockDeviceBackend for MemoryBackend {
        fn open(&mut self) -> Result<Geometry> {
            self.opened = true;
            Ok(Geometry { block_size: self.block_size, part_size: self.data.len() as u64 })
        }

        fn close(&mut self) -> Result<()> {
            self.opened = false;
            Ok(())
        }

        fn read(&mut self, block_id: u64, block_count: u32, buf: &mut [u8]) -> Result<()> {
            if !self.opened {
                return Err(Error::Io("backend not open"));
            }
            let start = block_id as usize * self.block_size as usize;
            let len = block_count as usize * self.block_size as usize;
            if start + len > self.data.len() || buf.len() < len {
                return Err(Error::Io("short read"));
            }
            buf[..len].copy_from_slice(&self.data[start..start + len]);
            Ok(())
        }

        fn write(&mut self, block_id: u64, block_count: u32, buf: &[u8]) -> Result<()> {
            if !self.opened {
                return Err(Error::Io("backend not open"));
            }
            let start = block_id as usize * self.block_size as usize;
            let len = block_count as usize * self.block_size as usize;
            if start + len > self.data.len() || buf.len() < len {
                return Err(Error::Io("short write"));
            }
            self.data[start..start + len].copy_from_slice(&buf[..len]);
            Ok(())
        }
    }

    #[test]
    fn init_fini_nests() {
        let mut dev = BlockDevice::new("ram0", Box::new(MemoryBackend::new(512, 16)), 0);
        dev.init().unwrap();
        dev.init().unwrap();
        assert_eq!(dev.reference_count, 2);
        dev.fini().unwrap();
        assert_eq!(dev.reference_count, 1);
        assert!(dev.backend.close().is_ok()); // backend still "open" to us
        dev.fini().unwrap();
        assert_eq!(dev.reference_count, 0);
    }

    #[test]
    fn rejects_block_size_below_512() {
        struct Bad;
        impl BlockDeviceBackend for Bad {
            fn open(&mut self) -> Result<Geometry> {
                Ok(Geometry { block_size: 256, part_size: 256 * 4 })
            }
            fn close(&mut self) -> Result<()> { Ok(()) }
            fn read(&mut self, _: u64, _: u32, _: &mut [u8]) -> Result<()> { Ok(()) }
            fn write(&mut self, _: u64, _: u32, _: &[u8]) -> Result<()> { Ok(()) }
        }

        let mut dev = BlockDevice::new("bad", Box::new(Bad), 0);
        assert!(matches!(dev.init(), Err(Error::Inval(_))));
    }
}
