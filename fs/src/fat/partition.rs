//! MBR partition tables: creating them, and formatting inside one slot.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::{BlockCount, BlockDevice, BlockIdx, DiskStatus, IoctlCommand, IoctlResult};
use crate::fat::{
    bpb::{BOOT_SIGNATURE, BS_55AA},
    mount::{MBR_TABLE, PTE_GPT_PROTECTIVE, PTE_ST_LBA, PTE_SYSTEM, SZ_PTE},
    FatType,
};
use crate::{debug, Error, MAX_SS, MIN_SS};

const PTE_BOOT: usize = 0;
const PTE_ST_HEAD: usize = 1;
const PTE_ST_SEC: usize = 2;
const PTE_ST_CYL: usize = 3;
const PTE_ED_HEAD: usize = 5;
const PTE_ED_SEC: usize = 6;
const PTE_ED_CYL: usize = 7;
const PTE_SIZ_LBA: usize = 12;

/// Sectors per track of the made-up CHS geometry.
const N_SEC_TRACK: u32 = 63;

/// Placeholder system ID for a fresh partition. Formatting it sets the
/// real one.
const SYS_UNFORMATTED: u8 = 0x07;

/// How big one partition should be.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionSize {
    /// A share of the whole device, 1 to 100 percent
    Percent(u8),
    /// An exact number of sectors
    Sectors(u32),
}

/// Sector size of `dev`, if it is one the engine handles.
fn sector_size<D: BlockDevice>(dev: &mut D) -> Result<usize, Error<D::E>> {
    match dev.ioctl(IoctlCommand::GetSectorSize)? {
        IoctlResult::SectorSize(n)
            if n.is_power_of_two() && (MIN_SS..=MAX_SS).contains(&usize::from(n)) =>
        {
            Ok(usize::from(n))
        }
        _ => Err(Error::NotReady),
    }
}

/// Fill one partition table entry, with CHS values derived from a geometry
/// of `n_hd` heads and 63 sectors per track.
fn put_entry(pte: &mut [u8], start: u32, len: u32, sys: u8, n_hd: u32) {
    let chs = |lba: u32| {
        let cy = lba / N_SEC_TRACK / n_hd;
        let hd = (lba / N_SEC_TRACK % n_hd) as u8;
        let sc = (lba % N_SEC_TRACK + 1) as u8;
        (hd, ((cy >> 2) as u8 & 0xC0) | sc, cy as u8)
    };
    pte[PTE_BOOT] = 0;
    let (hd, sc, cy) = chs(start);
    pte[PTE_ST_HEAD] = hd;
    pte[PTE_ST_SEC] = sc;
    pte[PTE_ST_CYL] = cy;
    pte[PTE_SYSTEM] = sys;
    let (hd, sc, cy) = chs(start + len - 1);
    pte[PTE_ED_HEAD] = hd;
    pte[PTE_ED_SEC] = sc;
    pte[PTE_ED_CYL] = cy;
    LittleEndian::write_u32(&mut pte[PTE_ST_LBA..], start);
    LittleEndian::write_u32(&mut pte[PTE_SIZ_LBA..], len);
}

/// Write a fresh MBR to sector 0 of `dev` dividing it into up to four
/// primary partitions.
///
/// Partitions are laid out in order from sector 63. A size that would run
/// past the end of the device is clipped, and partitions that no longer
/// fit are left out. Nothing is formatted; use
/// [`crate::MkfsOptions::partition`] for that.
pub(crate) fn create_partitions<D: BlockDevice>(
    dev: &mut D,
    sizes: &[PartitionSize],
) -> Result<(), Error<D::E>> {
    if sizes.is_empty() || sizes.len() > 4 {
        return Err(Error::InvalidParameter);
    }
    if sizes
        .iter()
        .any(|s| matches!(s, PartitionSize::Percent(0) | PartitionSize::Percent(101..=u8::MAX)))
    {
        return Err(Error::InvalidParameter);
    }
    let status = dev.initialize();
    if !status.is_ready() {
        return Err(Error::NotReady);
    }
    if status.write_protected {
        return Err(Error::WriteProtected);
    }
    let ss = sector_size(dev)?;
    let sz_drv = match dev.ioctl(IoctlCommand::GetSectorCount)? {
        IoctlResult::SectorCount(BlockCount(n)) => n,
        _ => return Err(Error::NotReady),
    };
    // An MBR cannot address more.
    let sz_drv = u32::try_from(sz_drv).map_err(|_| Error::InvalidParameter)?;

    let mut n_hd = 8u32;
    while n_hd <= 128 && sz_drv / n_hd / N_SEC_TRACK > 1024 {
        n_hd *= 2;
    }
    if n_hd > 128 {
        n_hd = 255;
    }

    let mut buf = [0u8; MAX_SS];
    let buf = &mut buf[..ss];
    let mut start = N_SEC_TRACK;
    for (i, size) in sizes.iter().enumerate() {
        if start >= sz_drv {
            break;
        }
        let mut len = match *size {
            PartitionSize::Percent(100) => sz_drv,
            PartitionSize::Percent(p) => sz_drv / 100 * u32::from(p),
            PartitionSize::Sectors(n) => n,
        };
        if start.checked_add(len).map_or(true, |end| end > sz_drv) {
            len = sz_drv - start;
        }
        if len == 0 {
            break;
        }
        let ofs = MBR_TABLE + i * SZ_PTE;
        put_entry(&mut buf[ofs..ofs + SZ_PTE], start, len, SYS_UNFORMATTED, n_hd);
        debug!("fdisk: partition {} at {}, {} sectors", i + 1, start, len);
        start += len;
    }
    LittleEndian::write_u16(&mut buf[BS_55AA..], BOOT_SIGNATURE);
    dev.write(buf, BlockIdx(0), 1).map_err(Error::DeviceError)?;
    dev.ioctl(IoctlCommand::Sync)?;
    Ok(())
}

/// Start and length of MBR slot `part` (1 to 4).
pub(crate) fn partition_slot<D: BlockDevice>(
    dev: &mut D,
    part: u8,
) -> Result<(u64, u64), Error<D::E>> {
    if !(1..=4).contains(&part) {
        return Err(Error::NoSuchVolume);
    }
    let ss = sector_size(dev)?;
    let mut buf = [0u8; MAX_SS];
    let buf = &mut buf[..ss];
    dev.read(buf, BlockIdx(0), 1).map_err(Error::DeviceError)?;
    if LittleEndian::read_u16(&buf[BS_55AA..]) != BOOT_SIGNATURE {
        return Err(Error::NoSuchVolume);
    }
    let pte = &buf[MBR_TABLE + usize::from(part - 1) * SZ_PTE..];
    let start = LittleEndian::read_u32(&pte[PTE_ST_LBA..]);
    let len = LittleEndian::read_u32(&pte[PTE_SIZ_LBA..]);
    if pte[PTE_SYSTEM] == 0 || pte[PTE_SYSTEM] == PTE_GPT_PROTECTIVE || start == 0 || len == 0 {
        return Err(Error::NoSuchVolume);
    }
    Ok((u64::from(start), u64::from(len)))
}

/// The MBR system ID for a freshly made volume.
pub(crate) fn system_id(fs_type: FatType, sz_vol: u64) -> u8 {
    match fs_type {
        FatType::ExFat => 0x07,
        FatType::Fat32 => 0x0C,
        _ if sz_vol >= 0x1_0000 => 0x06,
        FatType::Fat16 => 0x04,
        FatType::Fat12 => 0x01,
    }
}

/// Record `sys` as the system ID of MBR slot `part`.
pub(crate) fn set_system_id<D: BlockDevice>(
    dev: &mut D,
    part: u8,
    sys: u8,
) -> Result<(), Error<D::E>> {
    let ss = sector_size(dev)?;
    let mut buf = [0u8; MAX_SS];
    let buf = &mut buf[..ss];
    dev.read(buf, BlockIdx(0), 1).map_err(Error::DeviceError)?;
    buf[MBR_TABLE + usize::from(part - 1) * SZ_PTE + PTE_SYSTEM] = sys;
    dev.write(buf, BlockIdx(0), 1).map_err(Error::DeviceError)
}

/// A run of sectors of another device, seen as a device of its own.
pub(crate) struct Region<'a, D: BlockDevice> {
    dev: &'a mut D,
    start: u64,
    len: u64,
}

impl<'a, D: BlockDevice> Region<'a, D> {
    pub(crate) fn new(dev: &'a mut D, start: u64, len: u64) -> Region<'a, D> {
        Region { dev, start, len }
    }
}

impl<D: BlockDevice> BlockDevice for Region<'_, D> {
    type E = D::E;

    fn status(&self) -> DiskStatus {
        self.dev.status()
    }

    fn initialize(&mut self) -> DiskStatus {
        self.dev.initialize()
    }

    fn read(&mut self, buf: &mut [u8], start: BlockIdx, count: u32) -> Result<(), Self::E> {
        self.dev.read(buf, BlockIdx(self.start + start.0), count)
    }

    fn write(&mut self, buf: &[u8], start: BlockIdx, count: u32) -> Result<(), Self::E> {
        self.dev.write(buf, BlockIdx(self.start + start.0), count)
    }

    fn ioctl(&mut self, cmd: IoctlCommand) -> Result<IoctlResult, Self::E> {
        match cmd {
            IoctlCommand::GetSectorCount => Ok(IoctlResult::SectorCount(BlockCount(self.len))),
            IoctlCommand::Trim { start, end } => self.dev.ioctl(IoctlCommand::Trim {
                start: BlockIdx(self.start + start.0),
                end: BlockIdx(self.start + end.0),
            }),
            other => self.dev.ioctl(other),
        }
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

    fn entry(disk: &RamDisk<Vec<u8>>, i: usize) -> (u8, u32, u32) {
        let pte = &disk.as_bytes()[MBR_TABLE + i * SZ_PTE..MBR_TABLE + (i + 1) * SZ_PTE];
        (
            pte[PTE_SYSTEM],
            LittleEndian::read_u32(&pte[PTE_ST_LBA..]),
            LittleEndian::read_u32(&pte[PTE_SIZ_LBA..]),
        )
    }

    #[test]
    fn percentages_and_sector_counts() {
        // 8 MiB
        let mut d = RamDisk::new(vec![0u8; 16384 * 512], 512);
        let sizes = [
            PartitionSize::Percent(50),
            PartitionSize::Sectors(1000),
            PartitionSize::Percent(100),
        ];
        create_partitions(&mut d, &sizes).unwrap();
        assert_eq!(&d.as_bytes()[510..512], &[0x55, 0xAA]);
        // Percentages are taken of whole hundredths of the device.
        assert_eq!(entry(&d, 0), (SYS_UNFORMATTED, 63, 8150));
        assert_eq!(entry(&d, 1), (SYS_UNFORMATTED, 8213, 1000));
        // Clipped to what is left.
        assert_eq!(entry(&d, 2), (SYS_UNFORMATTED, 9213, 16384 - 9213));
        assert_eq!(entry(&d, 3), (0, 0, 0));
        assert_eq!(partition_slot(&mut d, 2), Ok((8213, 1000)));
        assert_eq!(partition_slot(&mut d, 4), Err(Error::NoSuchVolume));
        assert_eq!(partition_slot(&mut d, 5), Err(Error::NoSuchVolume));
    }

    #[test]
    fn chs_fields() {
        let mut pte = [0u8; SZ_PTE];
        put_entry(&mut pte, 63, 16384 - 63, 0x0C, 8);
        // Starts on cylinder 0, head 1, sector 1
        assert_eq!(&pte[1..4], &[1, 1, 0]);
        // Ends on LBA 16383: cylinder 32, head 4, sector 4
        assert_eq!(&pte[5..8], &[4, 4, 32]);
    }

    #[test]
    fn bad_requests() {
        let mut d = RamDisk::new(vec![0u8; 1024 * 512], 512);
        assert_eq!(create_partitions(&mut d, &[]), Err(Error::InvalidParameter));
        assert_eq!(
            create_partitions(&mut d, &[PartitionSize::Percent(101)]),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            create_partitions(&mut d, &[PartitionSize::Percent(10); 5]),
            Err(Error::InvalidParameter)
        );
        // Without a signature there is no table.
        assert_eq!(partition_slot(&mut d, 1), Err(Error::NoSuchVolume));
    }

    #[test]
    fn system_ids() {
        assert_eq!(system_id(FatType::Fat12, 8000), 0x01);
        assert_eq!(system_id(FatType::Fat16, 30000), 0x04);
        assert_eq!(system_id(FatType::Fat16, 0x2_0000), 0x06);
        assert_eq!(system_id(FatType::Fat32, 0x2_0000), 0x0C);
        assert_eq!(system_id(FatType::ExFat, 0x2_0000), 0x07);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
