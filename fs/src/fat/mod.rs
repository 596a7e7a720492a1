//! FAT12/FAT16/FAT32/exFAT file system implementation
//!
//! Implements the File Allocation Table file system and its exFAT
//! successor. Everything in here works on raw sector bytes seen through the
//! volume's single sector window.

/// Generate a little-endian field accessor over `self.data`.
macro_rules! define_field {
    ($name:ident, u8, $offset:expr) => {
        pub(crate) fn $name(&self) -> u8 {
            self.data[$offset]
        }
    };
    ($name:ident, u16, $offset:expr) => {
        pub(crate) fn $name(&self) -> u16 {
            LittleEndian::read_u16(&self.data[$offset..$offset + 2])
        }
    };
    ($name:ident, u32, $offset:expr) => {
        pub(crate) fn $name(&self) -> u32 {
            LittleEndian::read_u32(&self.data[$offset..$offset + 4])
        }
    };
    ($name:ident, u64, $offset:expr) => {
        pub(crate) fn $name(&self) -> u64 {
            LittleEndian::read_u64(&self.data[$offset..$offset + 8])
        }
    };
}

pub(crate) mod bitmap;
pub(crate) mod bpb;
pub(crate) mod chain;
pub(crate) mod dir;
pub(crate) mod file;
pub(crate) mod info;
pub(crate) mod lfn;
pub(crate) mod linkmap;
pub mod mkfs;
pub(crate) mod mount;
pub(crate) mod ondiskdirentry;
pub(crate) mod partition;
pub(crate) mod path;
pub(crate) mod sfn;
pub(crate) mod table;
pub(crate) mod volume;
pub(crate) mod window;
pub(crate) mod xdir;

use crate::{warn, Error};

/// Number of entries reserved at the start of a File Allocation Table
pub const RESERVED_ENTRIES: u32 = 2;

/// Size of one directory entry, short, long-name fragment or exFAT record.
pub const DIR_ENTRY_SIZE: usize = 32;

/// Largest FAT directory, in bytes.
pub const MAX_DIR: u32 = 0x0020_0000;

/// Largest exFAT directory, in bytes.
pub const MAX_DIR_EX: u32 = 0x1000_0000;

/// Most clusters a FAT12 volume can have.
pub const MAX_FAT12: u32 = 0xFF5;

/// Most clusters a FAT16 volume can have.
pub const MAX_FAT16: u32 = 0xFFF5;

/// Most clusters a FAT32 volume can have.
pub const MAX_FAT32: u32 = 0x0FFF_FFF5;

/// Most clusters an exFAT volume can have.
pub const MAX_EXFAT: u32 = 0x7FFF_FFFD;

/// Report a consistency error found in the on-disk structures.
pub(crate) fn inconsistent<E: core::fmt::Debug>(reason: &'static str) -> Error<E> {
    warn!("consistency error: {}", reason);
    Error::Inconsistent(reason)
}

/// Indentifies the supported types of FAT format
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FatType {
    /// FAT12 Format
    Fat12,
    /// FAT16 Format
    Fat16,
    /// FAT32 Format
    Fat32,
    /// exFAT Format
    ExFat,
}

impl FatType {
    /// Pick the FAT variant from the cluster count alone. The type string
    /// in the boot sector is not trusted.
    pub(crate) fn from_cluster_count(clusters: u32) -> Option<FatType> {
        if clusters == 0 || clusters > MAX_FAT32 {
            None
        } else if clusters <= MAX_FAT12 {
            Some(FatType::Fat12)
        } else if clusters <= MAX_FAT16 {
            Some(FatType::Fat16)
        } else {
            Some(FatType::Fat32)
        }
    }

    /// Is the root directory a cluster chain rather than a fixed table?
    pub(crate) fn has_dynamic_root(self) -> bool {
        matches!(self, FatType::Fat32 | FatType::ExFat)
    }
}

/// exFAT chain status: the FAT chain is valid.
pub(crate) const STAT_FAT_CHAIN: u8 = 0;
/// exFAT chain status: the clusters are contiguous and the FAT is unused.
pub(crate) const STAT_CONTIGUOUS: u8 = 2;
/// exFAT chain status: the chain fragmented during this mount and its head
/// has not been written to the FAT yet.
pub(crate) const STAT_FRAGMENTED: u8 = 3;

/// The allocation state of one object (file or directory), plus where its
/// parent directory lives on exFAT.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ObjectId {
    /// Attribute bits from the directory entry
    pub attr: u8,
    /// exFAT chain status, one of the `STAT_*` values
    pub stat: u8,
    /// First cluster, 0 when nothing is allocated
    pub sclust: u32,
    /// Size in bytes
    pub objsize: u64,
    /// exFAT: clusters in the contiguous head when `stat` is fragmented
    pub n_cont: u32,
    /// exFAT: clusters in the trailing fragment not yet written to the FAT
    pub n_frag: u32,
    /// exFAT: last cluster of that trailing fragment
    pub frag_end: u32,
    /// exFAT: start cluster of the containing directory
    pub c_scl: u32,
    /// exFAT: size of the containing directory
    pub c_size: u32,
    /// exFAT: chain status of the containing directory
    pub c_stat: u8,
    /// exFAT: offset of this object's entry block in the containing directory
    pub c_ofs: u32,
}

impl ObjectId {
    /// The root directory, or a blank object about to get its first cluster.
    pub(crate) const fn root() -> ObjectId {
        ObjectId {
            attr: crate::Attributes::DIRECTORY,
            stat: STAT_FAT_CHAIN,
            sclust: 0,
            objsize: 0,
            n_cont: 0,
            n_frag: 0,
            frag_end: 0,
            c_scl: 0,
            c_size: 0,
            c_stat: 0,
            c_ofs: 0,
        }
    }

    /// Record `self` as the containing directory of whatever is opened next.
    pub(crate) fn enter_child(&mut self, blk_ofs: u32) {
        self.c_scl = self.sclust;
        self.c_size = self.objsize as u32;
        self.c_stat = self.stat;
        self.c_ofs = blk_ofs;
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
