//! # fatcore
//!
//! A FAT12/FAT16/FAT32/exFAT filesystem engine for anything that can read
//! and write fixed-size sectors.
//!
//! The engine owns a [`BlockDevice`] and a [`TimeSource`] and mounts one
//! volume at a time. Files and directories are plain handles owned by the
//! caller; every operation goes through the [`FileSystem`] that produced them.
//!
//! ```rust
//! use fatcore::{FileSystem, Mode, MkfsOptions, RamDisk, Timestamp, TimeSource};
//!
//! struct Clock;
//!
//! impl TimeSource for Clock {
//!     fn get_timestamp(&self) -> Timestamp {
//!         Timestamp::from_calendar(2024, 1, 1, 0, 0, 0).unwrap()
//!     }
//! }
//!
//! # fn main() -> Result<(), fatcore::Error<fatcore::RamDiskError>> {
//! let disk = RamDisk::new(vec![0u8; 4 * 1024 * 1024], 512);
//! let mut fs = FileSystem::new(disk, Clock);
//! fs.mkfs(&MkfsOptions::default())?;
//! fs.mount(0, true)?;
//! let mut file = fs.open("/hello.txt", Mode::ReadWriteCreateOrTruncate)?;
//! fs.write(&mut file, b"hello")?;
//! fs.close(file)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

pub mod blockdevice;
pub mod fat;
pub mod filesystem;

#[doc(inline)]
pub use crate::blockdevice::{
    BlockCount, BlockDevice, BlockIdx, DiskStatus, IoctlCommand, IoctlResult, RamDisk,
    RamDiskError,
};

#[doc(inline)]
pub use crate::fat::{mkfs::FormatKind, mkfs::MkfsOptions, partition::PartitionSize, FatType};

#[doc(inline)]
pub use crate::filesystem::{
    attributes::Attributes,
    directory::{inode_of, Dir, FileInfo, MAX_NAME_BYTES},
    files::{File, Mode, StickyError},
    lock::{NoLock, VolumeLock},
    search_id::SearchId,
    timestamp::{TimeSource, Timestamp},
};

mod volume_mgr;
#[doc(inline)]
pub use volume_mgr::{FileSystem, VolumeLabel, VolumeStats, MAX_LABEL_BYTES};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Represents all the ways the functions in this crate can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<E>
where
    E: core::fmt::Debug,
{
    /// The underlying block device threw an error.
    DeviceError(E),
    /// A disk operation failed earlier on this handle and the handle is now
    /// unusable. Only closing it is still allowed.
    DiskFault,
    /// The on-disk structures contradict themselves (bad cluster link,
    /// corrupted directory entry set, and so on).
    Inconsistent(&'static str),
    /// The device reported that it is not initialised or has no medium.
    NotReady,
    /// The last path segment does not exist.
    NotFound,
    /// An intermediate path segment does not exist or is not a directory.
    NoPath,
    /// The name is not acceptable on this volume.
    InvalidName,
    /// The operation is not allowed on this object (read-only entry,
    /// directory not empty, handle opened without the needed access, no room
    /// for a directory entry).
    Denied,
    /// The target name already exists.
    AlreadyExists,
    /// The handle does not belong to the currently mounted volume.
    BadHandle,
    /// The medium is write protected.
    WriteProtected,
    /// The requested partition does not exist.
    NoSuchVolume,
    /// No volume is mounted.
    NotMounted,
    /// No FAT or exFAT volume was found.
    NoFilesystem,
    /// Formatting was refused because the geometry does not fit.
    MkfsAborted,
    /// The reentrancy lock could not be acquired.
    Timeout,
    /// The object is already open in a conflicting mode.
    Locked,
    /// The open-object table is full.
    TooManyOpenFiles,
    /// A parameter is out of range.
    InvalidParameter,
    /// There are no free clusters left.
    DiskFull,
    /// The file has more fragments than a link map can hold.
    TooFragmented,
}

impl<E> From<E> for Error<E>
where
    E: core::fmt::Debug,
{
    fn from(value: E) -> Error<E> {
        Error::DeviceError(value)
    }
}

/// Smallest sector size the engine accepts.
pub const MIN_SS: usize = 512;

/// Largest sector size the engine accepts. Every sector buffer is this big.
pub const MAX_SS: usize = 4096;

/// Longest file name, in UTF-16 code units.
pub const MAX_LFN: usize = 255;

/// How many numeric tails (`~1` .. `~99`) are tried before giving up on a
/// short name.
pub const NUMERIC_TAIL_RETRIES: u32 = 100;

/// Longest path segment stack kept while resolving `..`.
pub const MAX_PATH_DEPTH: usize = 32;

/// Most chain fragments a file's link map can record.
pub const MAX_LINK_FRAGMENTS: usize = 16;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
