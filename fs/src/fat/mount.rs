//! Finding and mounting a FAT or exFAT volume on a device.
//!
//! Sector 0 is tried as a volume without a partition table first. Failing
//! that it is read as an MBR, or as the protective MBR of a GPT disk whose
//! Microsoft basic data partitions are then tried in order.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::{BlockDevice, IoctlCommand, IoctlResult};
use crate::fat::{
    bpb::Bpb,
    info::InfoSector,
    volume::{FatVolume, FREE_UNKNOWN},
    xdir::{ET_BITMAP, XDIR_SYS_FST_CLUS},
    FatType, DIR_ENTRY_SIZE, MAX_EXFAT,
};
use crate::{debug, warn, Error, MAX_SS, MIN_SS};

pub(crate) const MBR_TABLE: usize = 446;
pub(crate) const SZ_PTE: usize = 16;
pub(crate) const PTE_SYSTEM: usize = 4;
pub(crate) const PTE_ST_LBA: usize = 8;
/// MBR system id of a GPT protective partition.
pub(crate) const PTE_GPT_PROTECTIVE: u8 = 0xEE;

pub(crate) const GPTH_SIGN: usize = 0;
pub(crate) const GPTH_SIZE: usize = 12;
pub(crate) const GPTH_BCC: usize = 16;
pub(crate) const GPTH_PT_OFS: usize = 72;
pub(crate) const GPTH_PT_NUM: usize = 80;
pub(crate) const GPTH_PTE_SIZE: usize = 84;
pub(crate) const SZ_GPTE: usize = 128;
pub(crate) const GPTE_PT_GUID: usize = 0;
pub(crate) const GPTE_FST_LBA: usize = 32;

/// Signature and revision 1.0 of a GPT header.
pub(crate) const GPT_SIGNATURE: &[u8; 12] = b"EFI PART\x00\x00\x01\x00";

/// Partition type GUID of a Microsoft basic data partition, as stored.
pub(crate) const GUID_MS_BASIC: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

/// What a boot sector turned out to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BootKind {
    Fat,
    ExFat,
    /// Signed, but not a FAT volume (an MBR, say)
    Other,
    /// Not a boot sector at all
    Invalid,
}

/// One step of the CRC-32 used by GPT.
pub(crate) fn crc32(mut crc: u32, d: u8) -> u32 {
    for bit in 0..8 {
        crc ^= u32::from((d >> bit) & 1);
        crc = if crc & 1 != 0 {
            (crc >> 1) ^ 0xEDB8_8320
        } else {
            crc >> 1
        };
    }
    crc
}

/// Is `gpth` a sane GPT header with entries we can read?
pub(crate) fn test_gpt_header(gpth: &[u8]) -> bool {
    if &gpth[GPTH_SIGN..GPTH_SIGN + 12] != GPT_SIGNATURE {
        return false;
    }
    let hlen = LittleEndian::read_u32(&gpth[GPTH_SIZE..]) as usize;
    if !(92..=MIN_SS).contains(&hlen) {
        return false;
    }
    let mut bcc = 0xFFFF_FFFFu32;
    for (i, &b) in gpth[..hlen].iter().enumerate() {
        let b = if (GPTH_BCC..GPTH_BCC + 4).contains(&i) { 0 } else { b };
        bcc = crc32(bcc, b);
    }
    !bcc == LittleEndian::read_u32(&gpth[GPTH_BCC..])
        && LittleEndian::read_u32(&gpth[GPTH_PTE_SIZE..]) == SZ_GPTE as u32
        && LittleEndian::read_u32(&gpth[GPTH_PT_NUM..]) <= 128
}

impl FatVolume {
    /// Load `sect` and classify it.
    fn check_fs<D: BlockDevice>(&mut self, dev: &mut D, sect: u64) -> Result<BootKind, Error<D::E>> {
        self.win.invalidate();
        self.move_window(dev, sect)?;
        let bpb = Bpb::new(self.win());
        if bpb.is_exfat() {
            return Ok(BootKind::ExFat);
        }
        let signed = bpb.signature() == crate::fat::bpb::BOOT_SIGNATURE;
        if bpb.has_jump() && ((signed && bpb.says_fat32()) || bpb.looks_like_fat()) {
            return Ok(BootKind::Fat);
        }
        Ok(if signed { BootKind::Other } else { BootKind::Invalid })
    }

    /// Locate the volume. `part` 0 takes the first FAT volume found, any
    /// other value picks that partition (1-based). Returns what was found
    /// and the sector it starts at; the window holds its boot sector.
    fn find_volume<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        part: u8,
    ) -> Result<(BootKind, u64), Error<D::E>> {
        let fmt = self.check_fs(dev, 0)?;
        if fmt != BootKind::Other && (fmt == BootKind::Invalid || part == 0) {
            return Ok((fmt, 0));
        }

        if self.win()[MBR_TABLE + PTE_SYSTEM] == PTE_GPT_PROTECTIVE {
            return self.find_gpt_volume(dev, part);
        }

        let mut starts = [0u64; 4];
        for (i, s) in starts.iter_mut().enumerate() {
            *s = u64::from(LittleEndian::read_u32(
                &self.win()[MBR_TABLE + i * SZ_PTE + PTE_ST_LBA..],
            ));
        }
        if part > 0 {
            let start = match starts.get(usize::from(part) - 1) {
                Some(&s) if s != 0 => s,
                _ => return Err(Error::NoSuchVolume),
            };
            return Ok((self.check_fs(dev, start)?, start));
        }
        for &start in starts.iter().filter(|s| **s != 0) {
            let fmt = self.check_fs(dev, start)?;
            if matches!(fmt, BootKind::Fat | BootKind::ExFat) {
                return Ok((fmt, start));
            }
        }
        Ok((BootKind::Invalid, 0))
    }

    fn find_gpt_volume<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        part: u8,
    ) -> Result<(BootKind, u64), Error<D::E>> {
        self.move_window(dev, 1)?;
        if !test_gpt_header(self.win()) {
            warn!("GPT header is not valid");
            return Ok((BootKind::Invalid, 0));
        }
        let n_ent = LittleEndian::read_u32(&self.win()[GPTH_PT_NUM..]) as usize;
        let pt_lba = LittleEndian::read_u64(&self.win()[GPTH_PT_OFS..]);
        let ss = usize::from(self.ss);
        let mut found = 0u8;
        for i in 0..n_ent {
            self.move_window(dev, pt_lba + (i * SZ_GPTE / ss) as u64)?;
            let ofs = i * SZ_GPTE % ss;
            if self.win()[ofs + GPTE_PT_GUID..ofs + GPTE_PT_GUID + 16] != GUID_MS_BASIC {
                continue;
            }
            found += 1;
            let start = LittleEndian::read_u64(&self.win()[ofs + GPTE_FST_LBA..]);
            let fmt = self.check_fs(dev, start)?;
            if part == 0 && matches!(fmt, BootKind::Fat | BootKind::ExFat) {
                return Ok((fmt, start));
            }
            if part != 0 && found == part {
                return Ok((fmt, start));
            }
        }
        if part != 0 {
            return Err(Error::NoSuchVolume);
        }
        Ok((BootKind::Invalid, 0))
    }

    /// Bring the device up, find a volume on it and work out its geometry.
    pub(crate) fn mount<D: BlockDevice>(dev: &mut D, part: u8) -> Result<FatVolume, Error<D::E>> {
        let status = dev.initialize();
        if !status.is_ready() {
            return Err(Error::NotReady);
        }
        let ss = match dev.ioctl(IoctlCommand::GetSectorSize)? {
            IoctlResult::SectorSize(n)
                if n.is_power_of_two() && (MIN_SS..=MAX_SS).contains(&usize::from(n)) =>
            {
                n
            }
            _ => {
                warn!("device reports an unusable sector size");
                return Err(Error::NotReady);
            }
        };

        let mut vol = FatVolume::blank();
        vol.ss = ss;
        let (fmt, bsect) = vol.find_volume(dev, part)?;
        match fmt {
            BootKind::ExFat => vol.init_exfat(dev, bsect)?,
            BootKind::Fat => vol.init_fat(dev, bsect)?,
            BootKind::Other | BootKind::Invalid => return Err(Error::NoFilesystem),
        }
        debug!(
            "mounted {:?} at sector {}: {} clusters of {} sectors, data at {}",
            vol.fs_type,
            bsect,
            vol.cluster_count(),
            vol.csize,
            vol.database
        );
        Ok(vol)
    }

    fn init_exfat<D: BlockDevice>(&mut self, dev: &mut D, bsect: u64) -> Result<(), Error<D::E>> {
        let bpb = Bpb::new(&self.win.buf[..usize::from(self.ss)]);
        if !bpb.ex_zeroed_ok() || bpb.ex_fs_ver() != 0x100 {
            return Err(Error::NoFilesystem);
        }
        let shift = bpb.ex_bytes_per_sector_shift();
        if shift >= 16 || 1u32 << shift != u32::from(self.ss) {
            return Err(Error::NoFilesystem);
        }
        let maxlba = bpb.ex_total_sectors().saturating_add(bsect);
        self.fsize = bpb.ex_fat_size();
        self.n_fats = bpb.ex_num_fats();
        if self.n_fats != 1 {
            return Err(Error::NoFilesystem);
        }
        let cshift = bpb.ex_sectors_per_cluster_shift();
        if cshift > 15 {
            return Err(Error::NoFilesystem);
        }
        self.csize = 1 << cshift;
        let nclst = bpb.ex_cluster_count();
        if nclst > MAX_EXFAT || nclst == 0 {
            return Err(Error::NoFilesystem);
        }
        self.n_fatent = nclst + 2;
        self.volbase = bsect;
        self.database = bsect + u64::from(bpb.ex_data_offset());
        self.fatbase = bsect + u64::from(bpb.ex_fat_offset());
        if maxlba < self.database + u64::from(nclst) * u64::from(self.csize) {
            return Err(Error::NoFilesystem);
        }
        self.dirbase = u64::from(bpb.ex_root_cluster());
        self.fs_type = FatType::ExFat;

        // The bitmap entry sits in the first cluster of the root directory.
        let root = self
            .clust2sect(self.dirbase as u32)
            .ok_or(Error::NoFilesystem)?;
        let ss = usize::from(self.ss);
        let mut bcl = None;
        'search: for so in 0..u64::from(self.csize) {
            self.move_window(dev, root + so)?;
            for ofs in (0..ss).step_by(DIR_ENTRY_SIZE) {
                if self.win()[ofs] == ET_BITMAP {
                    bcl = Some(LittleEndian::read_u32(&self.win()[ofs + XDIR_SYS_FST_CLUS..]));
                    break 'search;
                }
            }
        }
        let mut bcl = bcl.ok_or(Error::NoFilesystem)?;
        if bcl < 2 || bcl >= self.n_fatent {
            return Err(Error::NoFilesystem);
        }
        self.bitbase = self.database + u64::from(self.csize) * u64::from(bcl - 2);

        // The bitmap must be contiguous.
        let per_sector = u32::from(self.ss) / 4;
        loop {
            self.move_window(dev, self.fatbase + u64::from(bcl / per_sector))?;
            let ofs = (bcl % per_sector * 4) as usize;
            let cv = LittleEndian::read_u32(&self.win()[ofs..]);
            if cv == 0xFFFF_FFFF {
                break;
            }
            bcl += 1;
            if cv != bcl || bcl >= self.n_fatent {
                return Err(Error::NoFilesystem);
            }
        }
        self.last_clust = FREE_UNKNOWN;
        self.free_clust = FREE_UNKNOWN;
        Ok(())
    }

    fn init_fat<D: BlockDevice>(&mut self, dev: &mut D, bsect: u64) -> Result<(), Error<D::E>> {
        let bpb = Bpb::new(&self.win.buf[..usize::from(self.ss)]);
        if bpb.bytes_per_sector() != self.ss {
            return Err(Error::NoFilesystem);
        }
        self.fsize = bpb.fat_size();
        self.n_fats = bpb.num_fats();
        if self.n_fats != 1 && self.n_fats != 2 {
            return Err(Error::NoFilesystem);
        }
        let fasize = self.fsize * u32::from(self.n_fats);
        let csize = bpb.sectors_per_cluster();
        if !csize.is_power_of_two() {
            return Err(Error::NoFilesystem);
        }
        self.csize = u16::from(csize);
        self.n_rootdir = bpb.root_entries_count();
        let per_sector = u32::from(self.ss) / DIR_ENTRY_SIZE as u32;
        if u32::from(self.n_rootdir) % per_sector != 0 {
            return Err(Error::NoFilesystem);
        }
        let tsect = bpb.total_sectors();
        let nrsv = bpb.reserved_sectors();
        if nrsv == 0 {
            return Err(Error::NoFilesystem);
        }
        let sysect = u32::from(nrsv) + fasize + u32::from(self.n_rootdir) / per_sector;
        if tsect < sysect {
            return Err(Error::NoFilesystem);
        }
        let nclst = (tsect - sysect) / u32::from(self.csize);
        let fs_type = FatType::from_cluster_count(nclst).ok_or(Error::NoFilesystem)?;

        self.n_fatent = nclst + 2;
        self.volbase = bsect;
        self.fatbase = bsect + u64::from(nrsv);
        self.database = bsect + u64::from(sysect);
        let needed = if fs_type == FatType::Fat32 {
            if bpb.fs_ver() != 0 || self.n_rootdir != 0 {
                return Err(Error::NoFilesystem);
            }
            self.dirbase = u64::from(bpb.first_root_dir_cluster());
            self.n_fatent * 4
        } else {
            if self.n_rootdir == 0 {
                return Err(Error::NoFilesystem);
            }
            self.dirbase = self.fatbase + u64::from(fasize);
            if fs_type == FatType::Fat16 {
                self.n_fatent * 2
            } else {
                self.n_fatent * 3 / 2 + (self.n_fatent & 1)
            }
        };
        if self.fsize < (needed + u32::from(self.ss) - 1) / u32::from(self.ss) {
            return Err(Error::NoFilesystem);
        }
        self.fs_type = fs_type;

        self.last_clust = FREE_UNKNOWN;
        self.free_clust = FREE_UNKNOWN;
        self.fsi_enabled = false;
        if fs_type == FatType::Fat32 && bpb.fs_info() == 1 {
            self.move_window(dev, bsect + 1)?;
            self.fsi_enabled = true;
            let counts = InfoSector::create_from_bytes(self.win())
                .map(|info| (info.free_count(), info.next_free()));
            if let Some((free, last)) = counts {
                self.free_clust = free;
                self.last_clust = last;
            }
        }
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

    #[test]
    fn crc32_check_value() {
        let crc = b"123456789".iter().fold(0xFFFF_FFFF, |c, &b| crc32(c, b));
        assert_eq!(!crc, 0xCBF4_3926);
    }

    fn gpt_header(entries: u32) -> [u8; 512] {
        let mut h = [0u8; 512];
        h[..12].copy_from_slice(GPT_SIGNATURE);
        LittleEndian::write_u32(&mut h[GPTH_SIZE..], 92);
        LittleEndian::write_u64(&mut h[GPTH_PT_OFS..], 2);
        LittleEndian::write_u32(&mut h[GPTH_PT_NUM..], entries);
        LittleEndian::write_u32(&mut h[GPTH_PTE_SIZE..], SZ_GPTE as u32);
        let crc = h[..92].iter().fold(0xFFFF_FFFF, |c, &b| crc32(c, b));
        LittleEndian::write_u32(&mut h[GPTH_BCC..], !crc);
        h
    }

    #[test]
    fn gpt_header_checks() {
        assert!(test_gpt_header(&gpt_header(4)));
        let mut bad = gpt_header(4);
        bad[40] ^= 0x01;
        assert!(!test_gpt_header(&bad));
        assert!(!test_gpt_header(&gpt_header(129)));
        let mut small = gpt_header(4);
        LittleEndian::write_u32(&mut small[GPTH_SIZE..], 91);
        assert!(!test_gpt_header(&small));
    }

    #[test]
    fn classify_sectors() {
        let mut disk = RamDisk::new(vec![0u8; 512 * 4], 512);
        let mut vol = FatVolume::blank();
        assert_eq!(vol.check_fs(&mut disk, 0), Ok(BootKind::Invalid));

        disk.as_bytes_mut()[510] = 0x55;
        disk.as_bytes_mut()[511] = 0xAA;
        assert_eq!(vol.check_fs(&mut disk, 0), Ok(BootKind::Other));

        disk.as_bytes_mut()[0] = 0xEB;
        disk.as_bytes_mut()[82..90].copy_from_slice(b"FAT32   ");
        assert_eq!(vol.check_fs(&mut disk, 0), Ok(BootKind::Fat));

        disk.as_bytes_mut()[512..523].copy_from_slice(crate::fat::bpb::EXFAT_MAGIC);
        disk.as_bytes_mut()[1022] = 0x55;
        disk.as_bytes_mut()[1023] = 0xAA;
        assert_eq!(vol.check_fs(&mut disk, 1), Ok(BootKind::ExFat));
    }

    #[test]
    fn blank_device_has_no_filesystem() {
        let mut disk = RamDisk::new(vec![0u8; 512 * 64], 512);
        assert_eq!(
            FatVolume::mount(&mut disk, 0).err(),
            Some(Error::NoFilesystem)
        );
        assert_eq!(
            FatVolume::mount(&mut disk, 2).err(),
            Some(Error::NoFilesystem)
        );
    }

    #[test]
    fn forced_partition_must_exist() {
        let mut disk = RamDisk::new(vec![0u8; 512 * 64], 512);
        let mbr = disk.as_bytes_mut();
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        mbr[MBR_TABLE + PTE_SYSTEM] = 0x0C;
        LittleEndian::write_u32(&mut mbr[MBR_TABLE + PTE_ST_LBA..], 8);
        assert_eq!(
            FatVolume::mount(&mut disk, 2).err(),
            Some(Error::NoSuchVolume)
        );
        // Partition 1 exists but holds nothing.
        assert_eq!(
            FatVolume::mount(&mut disk, 1).err(),
            Some(Error::NoFilesystem)
        );
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
