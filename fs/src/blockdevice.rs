//! Block Device support
//!
//! Generic code for handling sector-addressed storage, plus an in-memory
//! device for hosted use and tests.

use crate::{MAX_SS, MIN_SS};

/// The linear numeric address of a sector (or block).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIdx(pub u64);

/// The a number of sectors (or blocks) on a disk.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockCount(pub u64);

impl core::ops::Add<BlockCount> for BlockIdx {
    type Output = BlockIdx;
    fn add(self, rhs: BlockCount) -> BlockIdx {
        BlockIdx(self.0 + rhs.0)
    }
}

impl core::ops::AddAssign<BlockCount> for BlockIdx {
    fn add_assign(&mut self, rhs: BlockCount) {
        self.0 += rhs.0
    }
}

impl core::ops::Sub<BlockIdx> for BlockIdx {
    type Output = BlockCount;
    fn sub(self, rhs: BlockIdx) -> BlockCount {
        BlockCount(self.0 - rhs.0)
    }
}

/// Lifecycle flags reported by a device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DiskStatus {
    /// The device has not been initialised yet.
    pub not_initialized: bool,
    /// There is no medium in the device.
    pub no_disk: bool,
    /// The medium refuses writes.
    pub write_protected: bool,
}

impl DiskStatus {
    /// A ready, writable device.
    pub const READY: DiskStatus = DiskStatus {
        not_initialized: false,
        no_disk: false,
        write_protected: false,
    };

    /// Can the device be used at all?
    pub fn is_ready(&self) -> bool {
        !self.not_initialized && !self.no_disk
    }
}

/// Control requests sent through [`BlockDevice::ioctl`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlCommand {
    /// Finish any pending write.
    Sync,
    /// How many sectors the medium holds.
    GetSectorCount,
    /// Size of one sector in bytes.
    GetSectorSize,
    /// Erase block size in sectors.
    GetBlockSize,
    /// The sectors `start..=end` hold no useful data any more.
    Trim {
        /// First sector of the range
        start: BlockIdx,
        /// Last sector of the range (inclusive)
        end: BlockIdx,
    },
}

/// Answers to [`IoctlCommand`]s.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlResult {
    /// The command had nothing to report.
    Done,
    /// Answer to [`IoctlCommand::GetSectorCount`].
    SectorCount(BlockCount),
    /// Answer to [`IoctlCommand::GetSectorSize`].
    SectorSize(u16),
    /// Answer to [`IoctlCommand::GetBlockSize`].
    BlockSize(u32),
}

/// Represents a block device - a device which can read and write sectors.
///
/// Sectors are all the same size, between 512 and 4096 bytes and a power
/// of two. Every transfer moves `count` whole sectors, so `buf` is always
/// `count * sector size` bytes long.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type E: core::fmt::Debug;
    /// Report the current lifecycle flags.
    fn status(&self) -> DiskStatus;
    /// Bring the device up and report the resulting flags.
    fn initialize(&mut self) -> DiskStatus;
    /// Read one or more sectors, starting at the given index.
    fn read(&mut self, buf: &mut [u8], start: BlockIdx, count: u32) -> Result<(), Self::E>;
    /// Write one or more sectors, starting at the given index.
    fn write(&mut self, buf: &[u8], start: BlockIdx, count: u32) -> Result<(), Self::E>;
    /// Perform a control request.
    fn ioctl(&mut self, cmd: IoctlCommand) -> Result<IoctlResult, Self::E>;
}

/// Errors produced by a [`RamDisk`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RamDiskError {
    /// The request reaches past the end of the medium.
    OutOfRange,
    /// The buffer does not match the sector count.
    BadBuffer,
    /// A failure was injected with [`RamDisk::fail_after`].
    Injected,
}

/// A block device kept entirely in memory.
///
/// Any byte container works as storage, a `Vec<u8>` on hosted targets or a
/// static array on bare metal. A write failure can be armed to hit after a
/// given number of successful transfers.
pub struct RamDisk<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    storage: T,
    sector_size: usize,
    block_size: u32,
    status: DiskStatus,
    countdown: Option<u32>,
    trimmed: u64,
}

impl<T> RamDisk<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Wrap `storage` as a device with `sector_size` byte sectors.
    ///
    /// The sector size is clamped to the 512-4096 range the engine accepts.
    pub fn new(storage: T, sector_size: usize) -> RamDisk<T> {
        let sector_size = sector_size.clamp(MIN_SS, MAX_SS);
        RamDisk {
            storage,
            sector_size,
            block_size: 1,
            status: DiskStatus {
                not_initialized: true,
                ..DiskStatus::READY
            },
            countdown: None,
            trimmed: 0,
        }
    }

    /// Report `sectors` as the erase block size.
    pub fn with_block_size(mut self, sectors: u32) -> RamDisk<T> {
        self.block_size = sectors;
        self
    }

    /// Let the next `transfers` reads or writes succeed, then fail every one
    /// after that until [`RamDisk::heal`] is called.
    pub fn fail_after(&mut self, transfers: u32) {
        self.countdown = Some(transfers);
    }

    /// Stop injecting failures.
    pub fn heal(&mut self) {
        self.countdown = None;
    }

    /// Flip the write-protect switch.
    pub fn set_write_protected(&mut self, on: bool) {
        self.status.write_protected = on;
    }

    /// Number of sectors reported through TRIM so far.
    pub fn trimmed_sectors(&self) -> u64 {
        self.trimmed
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_ref()
    }

    /// Mutably borrow the raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut()
    }

    /// Give back the storage.
    pub fn into_inner(self) -> T {
        self.storage
    }

    fn tick(&mut self) -> Result<(), RamDiskError> {
        match self.countdown {
            Some(0) => Err(RamDiskError::Injected),
            Some(n) => {
                self.countdown = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn span(&self, start: BlockIdx, count: u32, len: usize) -> Result<(usize, usize), RamDiskError> {
        let bytes = count as usize * self.sector_size;
        if len != bytes {
            return Err(RamDiskError::BadBuffer);
        }
        let from = usize::try_from(start.0)
            .ok()
            .and_then(|s| s.checked_mul(self.sector_size))
            .ok_or(RamDiskError::OutOfRange)?;
        let to = from.checked_add(bytes).ok_or(RamDiskError::OutOfRange)?;
        if to > self.storage.as_ref().len() {
            return Err(RamDiskError::OutOfRange);
        }
        Ok((from, to))
    }
}

impl<T> BlockDevice for RamDisk<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    type E = RamDiskError;

    fn status(&self) -> DiskStatus {
        self.status
    }

    fn initialize(&mut self) -> DiskStatus {
        self.status.not_initialized = false;
        self.status
    }

    fn read(&mut self, buf: &mut [u8], start: BlockIdx, count: u32) -> Result<(), Self::E> {
        self.tick()?;
        let (from, to) = self.span(start, count, buf.len())?;
        buf.copy_from_slice(&self.storage.as_ref()[from..to]);
        Ok(())
    }

    fn write(&mut self, buf: &[u8], start: BlockIdx, count: u32) -> Result<(), Self::E> {
        self.tick()?;
        let (from, to) = self.span(start, count, buf.len())?;
        self.storage.as_mut()[from..to].copy_from_slice(buf);
        Ok(())
    }

    fn ioctl(&mut self, cmd: IoctlCommand) -> Result<IoctlResult, Self::E> {
        match cmd {
            IoctlCommand::Sync => Ok(IoctlResult::Done),
            IoctlCommand::GetSectorCount => Ok(IoctlResult::SectorCount(BlockCount(
                (self.storage.as_ref().len() / self.sector_size) as u64,
            ))),
            IoctlCommand::GetSectorSize => Ok(IoctlResult::SectorSize(self.sector_size as u16)),
            IoctlCommand::GetBlockSize => Ok(IoctlResult::BlockSize(self.block_size)),
            IoctlCommand::Trim { start, end } => {
                if end.0 >= start.0 {
                    self.trimmed += end.0 - start.0 + 1;
                }
                Ok(IoctlResult::Done)
            }
        }
    }
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
