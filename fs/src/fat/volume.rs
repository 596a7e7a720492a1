//! The state of one mounted FAT or exFAT volume.

use crate::fat::{lfn::LfnBuf, window::Window, xdir::XDIR_BUF_SIZE, FatType, MAX_DIR, MAX_DIR_EX};
use crate::MAX_LFN;

/// `free_clust` value meaning "not counted yet".
pub(crate) const FREE_UNKNOWN: u32 = u32::MAX;

/// Geometry, allocation hints and the sector window of a mounted volume.
///
/// Built by the mount logic in `mount`, mutated by every write through the
/// window, and dropped on unmount.
pub(crate) struct FatVolume {
    pub fs_type: FatType,
    /// Bytes per sector
    pub ss: u16,
    /// Sectors per cluster
    pub csize: u16,
    pub n_fats: u8,
    /// Entries in the fixed FAT12/FAT16 root directory
    pub n_rootdir: u16,
    /// Number of FAT entries, that is the cluster count plus two
    pub n_fatent: u32,
    /// Sectors per FAT
    pub fsize: u32,
    pub volbase: u64,
    pub fatbase: u64,
    /// Root directory: a sector on FAT12/FAT16, a cluster on FAT32/exFAT
    pub dirbase: u64,
    pub database: u64,
    /// exFAT allocation bitmap sector
    pub bitbase: u64,
    /// FAT32 only: the FSInfo sector may be rewritten
    pub fsi_enabled: bool,
    /// FAT32 only: the free count or hint changed since FSInfo was written
    pub fsi_dirty: bool,
    pub free_clust: u32,
    pub last_clust: u32,
    pub win: Window,
    /// Scratch buffer for one exFAT directory entry block
    pub dirbuf: [u8; XDIR_BUF_SIZE],
    /// Long name collected by the last directory read
    pub lfnbuf: LfnBuf,
}

impl FatVolume {
    /// An unmounted volume with empty geometry. `mount` fills it in.
    pub(crate) fn blank() -> FatVolume {
        FatVolume {
            fs_type: FatType::Fat12,
            ss: crate::MIN_SS as u16,
            csize: 1,
            n_fats: 1,
            n_rootdir: 0,
            n_fatent: 0,
            fsize: 0,
            volbase: 0,
            fatbase: 0,
            dirbase: 0,
            database: 0,
            bitbase: 0,
            fsi_enabled: false,
            fsi_dirty: false,
            free_clust: FREE_UNKNOWN,
            last_clust: FREE_UNKNOWN,
            win: Window::new(),
            dirbuf: [0u8; XDIR_BUF_SIZE],
            lfnbuf: [0u16; MAX_LFN + 1],
        }
    }

    /// Bytes per cluster.
    pub(crate) fn cluster_bytes(&self) -> u32 {
        u32::from(self.ss) * u32::from(self.csize)
    }

    /// Number of data clusters on the volume.
    pub(crate) fn cluster_count(&self) -> u32 {
        self.n_fatent - 2
    }

    /// First sector of a data cluster, or `None` when `clst` is not a data
    /// cluster of this volume.
    pub(crate) fn clust2sect(&self, clst: u32) -> Option<u64> {
        let c = clst.wrapping_sub(2);
        if c >= self.n_fatent.wrapping_sub(2) {
            None
        } else {
            Some(self.database + u64::from(c) * u64::from(self.csize))
        }
    }

    /// Largest directory size in bytes.
    pub(crate) fn max_dir(&self) -> u32 {
        if self.fs_type == FatType::ExFat {
            MAX_DIR_EX
        } else {
            MAX_DIR
        }
    }

    /// Is the cached free cluster count trustworthy?
    pub(crate) fn free_count_known(&self) -> bool {
        self.free_clust <= self.cluster_count()
    }

    /// Account for one cluster being freed.
    pub(crate) fn note_freed(&mut self) {
        if self.free_clust < self.cluster_count() {
            self.free_clust += 1;
            self.fsi_dirty = true;
        }
    }

    /// Account for one cluster being allocated.
    pub(crate) fn note_allocated(&mut self, clst: u32) {
        self.last_clust = clst;
        if self.free_clust <= self.cluster_count() && self.free_clust > 0 {
            self.free_clust -= 1;
        }
        self.fsi_dirty = true;
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
