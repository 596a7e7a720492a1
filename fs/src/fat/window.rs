//! The single sector window every on-disk structure is accessed through.

use crate::blockdevice::{BlockDevice, BlockIdx, IoctlCommand};
use crate::fat::{info, volume::FatVolume, FatType};
use crate::{trace, warn, Error, MAX_SS};

/// `Window::sect` value meaning "nothing valid is loaded".
pub(crate) const INVALID_SECTOR: u64 = u64::MAX;

/// One sector of the volume mirrored in memory.
pub(crate) struct Window {
    pub buf: [u8; MAX_SS],
    pub sect: u64,
    pub dirty: bool,
}

impl Window {
    pub(crate) const fn new() -> Window {
        Window {
            buf: [0u8; MAX_SS],
            sect: INVALID_SECTOR,
            dirty: false,
        }
    }

    /// Drop whatever is loaded without writing it back.
    pub(crate) fn invalidate(&mut self) {
        self.sect = INVALID_SECTOR;
        self.dirty = false;
    }
}

impl FatVolume {
    /// The loaded sector, read only.
    pub(crate) fn win(&self) -> &[u8] {
        &self.win.buf[..usize::from(self.ss)]
    }

    /// The loaded sector, for writing. Marks the window dirty.
    pub(crate) fn win_mut(&mut self) -> &mut [u8] {
        self.win.dirty = true;
        &mut self.win.buf[..usize::from(self.ss)]
    }

    /// Write the window back if it is dirty. Sectors inside the first FAT
    /// are mirrored to the second FAT.
    pub(crate) fn sync_window<D: BlockDevice>(&mut self, dev: &mut D) -> Result<(), Error<D::E>> {
        if !self.win.dirty {
            return Ok(());
        }
        let sect = self.win.sect;
        let ss = usize::from(self.ss);
        trace!("flush window sector {}", sect);
        if let Err(e) = dev.write(&self.win.buf[..ss], BlockIdx(sect), 1) {
            warn!("window flush of sector {} failed", sect);
            self.win.invalidate();
            return Err(Error::DeviceError(e));
        }
        self.win.dirty = false;
        if sect.wrapping_sub(self.fatbase) < u64::from(self.fsize) && self.n_fats == 2 {
            let mirror = sect + u64::from(self.fsize);
            if let Err(e) = dev.write(&self.win.buf[..ss], BlockIdx(mirror), 1) {
                warn!("FAT mirror write of sector {} failed", mirror);
                return Err(Error::DeviceError(e));
            }
        }
        Ok(())
    }

    /// Make `sect` the loaded sector, flushing the previous one first.
    pub(crate) fn move_window<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        sect: u64,
    ) -> Result<(), Error<D::E>> {
        if sect == self.win.sect {
            return Ok(());
        }
        self.sync_window(dev)?;
        let ss = usize::from(self.ss);
        trace!("load window sector {}", sect);
        match dev.read(&mut self.win.buf[..ss], BlockIdx(sect), 1) {
            Ok(()) => {
                self.win.sect = sect;
                Ok(())
            }
            Err(e) => {
                warn!("window load of sector {} failed", sect);
                self.win.invalidate();
                Err(Error::DeviceError(e))
            }
        }
    }

    /// Flush the window, rewrite FSInfo if needed, and ask the device to
    /// commit its own caches.
    pub(crate) fn sync_fs<D: BlockDevice>(&mut self, dev: &mut D) -> Result<(), Error<D::E>> {
        self.sync_window(dev)?;
        if self.fs_type == FatType::Fat32 && self.fsi_enabled && self.fsi_dirty {
            let ss = usize::from(self.ss);
            let sect = self.volbase + 1;
            info::write_fsinfo(&mut self.win.buf[..ss], self.free_clust, self.last_clust);
            self.win.sect = sect;
            self.win.dirty = false;
            if let Err(e) = dev.write(&self.win.buf[..ss], BlockIdx(sect), 1) {
                warn!("FSInfo write failed");
                self.win.invalidate();
                return Err(Error::DeviceError(e));
            }
            self.fsi_dirty = false;
        }
        dev.ioctl(IoctlCommand::Sync).map_err(|e| {
            warn!("device sync failed");
            Error::DeviceError(e)
        })?;
        Ok(())
    }

    /// Zero the window and point it at `sect` without reading the disk.
    /// The caller is expected to fill it and flush it.
    pub(crate) fn clear_window_at<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        sect: u64,
    ) -> Result<(), Error<D::E>> {
        self.sync_window(dev)?;
        self.win.buf.fill(0);
        self.win.sect = sect;
        self.win.dirty = false;
        Ok(())
    }
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamDisk;

    fn volume() -> FatVolume {
        let mut vol = FatVolume::blank();
        vol.fs_type = FatType::Fat16;
        vol.fatbase = 1;
        vol.fsize = 2;
        vol.n_fats = 2;
        vol
    }

    #[test]
    fn fat_sectors_are_mirrored() {
        let mut disk = RamDisk::new(vec![0u8; 512 * 16], 512);
        let mut vol = volume();
        vol.move_window(&mut disk, 2).unwrap();
        vol.win_mut()[7] = 0xAB;
        vol.move_window(&mut disk, 8).unwrap();
        assert_eq!(disk.as_bytes()[2 * 512 + 7], 0xAB);
        assert_eq!(disk.as_bytes()[4 * 512 + 7], 0xAB);

        vol.win_mut()[0] = 0xCD;
        vol.sync_window(&mut disk).unwrap();
        assert_eq!(disk.as_bytes()[8 * 512], 0xCD);
        assert_eq!(disk.as_bytes()[10 * 512], 0);
    }

    #[test]
    fn failed_load_invalidates_window() {
        let mut disk = RamDisk::new(vec![0u8; 512 * 16], 512);
        let mut vol = volume();
        vol.move_window(&mut disk, 3).unwrap();
        disk.fail_after(0);
        assert!(matches!(
            vol.move_window(&mut disk, 5),
            Err(Error::DeviceError(_))
        ));
        assert_eq!(vol.win.sect, INVALID_SECTOR);
        disk.heal();
        vol.move_window(&mut disk, 5).unwrap();
        assert_eq!(vol.win.sect, 5);
    }

    #[test]
    fn failed_flush_invalidates_window() {
        let mut disk = RamDisk::new(vec![0u8; 512 * 16], 512);
        let mut vol = volume();
        vol.move_window(&mut disk, 6).unwrap();
        vol.win_mut()[0] = 1;
        disk.fail_after(0);
        assert!(vol.move_window(&mut disk, 7).is_err());
        assert_eq!(vol.win.sect, INVALID_SECTOR);
        assert!(!vol.win.dirty);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
