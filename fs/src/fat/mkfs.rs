//! Creating a fresh FAT or exFAT volume.
//!
//! The volume covers either the whole device from sector 0, with no
//! partition table, or one slot of an existing MBR.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::{BlockCount, BlockDevice, BlockIdx, IoctlCommand, IoctlResult};
use crate::fat::{
    bpb::*,
    info::write_fsinfo,
    lfn::wtoupper,
    xdir::{
        xsum32, ET_BITMAP, ET_UPCASE, ET_VLABEL, XDIR_CASE_SUM, XDIR_SYS_DATA_LEN,
        XDIR_SYS_FST_CLUS,
    },
    partition::{partition_slot, set_system_id, system_id, Region},
    FatType, DIR_ENTRY_SIZE, MAX_FAT12, MAX_FAT16, MAX_FAT32,
};
use crate::{debug, warn, Error, MAX_SS, MIN_SS};

/// Boot sector label of a volume without one.
const NO_NAME: &[u8; 11] = b"NO NAME    ";

/// Which file system types [`format`] may choose from.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FormatKind {
    /// FAT12 or FAT16, whichever the cluster count gives
    Fat,
    /// FAT32 only
    Fat32,
    /// exFAT only
    ExFat,
    /// Any of FAT12, FAT16 or FAT32
    AnyFat,
    /// Any type, exFAT included
    #[default]
    Any,
}

impl FormatKind {
    fn allows_fat(self) -> bool {
        matches!(self, FormatKind::Fat | FormatKind::AnyFat | FormatKind::Any)
    }

    fn allows_fat32(self) -> bool {
        matches!(self, FormatKind::Fat32 | FormatKind::AnyFat | FormatKind::Any)
    }

    fn allows_exfat(self) -> bool {
        matches!(self, FormatKind::ExFat | FormatKind::Any)
    }
}

/// Parameters for creating a volume.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MkfsOptions {
    /// The allowed file system types
    pub fmt: FormatKind,
    /// Number of FAT copies, 1 or 2. Anything else means 1. exFAT always
    /// gets one.
    pub n_fat: u8,
    /// Data area alignment in sectors. 0 asks the device for its erase
    /// block size.
    pub align: u32,
    /// Root directory entries on FAT12/16. Must be a multiple of the
    /// entries in one sector, otherwise 512 is used.
    pub n_root: u16,
    /// Cluster size in bytes, a power of two. 0 picks one from the
    /// volume size.
    pub au_size: u32,
    /// MBR slot to format, 1 to 4. 0 formats the whole device.
    pub partition: u8,
}

impl Default for MkfsOptions {
    fn default() -> MkfsOptions {
        MkfsOptions {
            fmt: FormatKind::Any,
            n_fat: 1,
            align: 0,
            n_root: 512,
            au_size: 0,
            partition: 0,
        }
    }
}

/// Cluster sizes picked for FAT32, by volume size in 64 MiB steps.
const CST32: [u32; 6] = [1, 2, 4, 8, 16, 32];
/// Cluster sizes picked for FAT12/16, by volume size in 2 MiB steps.
const CST16: [u32; 6] = [1, 4, 16, 64, 256, 512];

/// Media descriptor of a fixed disk.
const MEDIA_FIXED: u8 = 0xF8;

/// Geometry shared by both layouts.
struct Geometry {
    ss: u32,
    /// Sectors before the volume on the device
    hidden: u64,
    sz_vol: u64,
    sz_blk: u32,
    n_fats: u32,
    n_root: u32,
    au: u32,
}

/// Write one sector of `buf`.
fn put<D: BlockDevice>(dev: &mut D, buf: &[u8], sect: u64) -> Result<(), Error<D::E>> {
    dev.write(buf, BlockIdx(sect), 1).map_err(|e| {
        warn!("format: writing sector {} failed", sect);
        Error::DeviceError(e)
    })
}

/// Zero `count` sectors starting at `sect`.
fn zero_fill<D: BlockDevice>(
    dev: &mut D,
    buf: &mut [u8],
    sect: u64,
    count: u64,
) -> Result<(), Error<D::E>> {
    buf.fill(0);
    for s in sect..sect + count {
        put(dev, buf, s)?;
    }
    Ok(())
}

/// Lay a file system over `dev`, or over the MBR slot picked by
/// `opt.partition`.
///
/// `serial` becomes the volume serial number. Returns the type that was
/// created.
pub(crate) fn format<D: BlockDevice>(
    dev: &mut D,
    opt: &MkfsOptions,
    serial: u32,
) -> Result<FatType, Error<D::E>> {
    if opt.partition == 0 {
        return format_volume(dev, opt, serial, 0);
    }
    let (start, len) = partition_slot(dev, opt.partition)?;
    let fs_type = format_volume(&mut Region::new(dev, start, len), opt, serial, start)?;
    set_system_id(dev, opt.partition, system_id(fs_type, len))?;
    dev.ioctl(IoctlCommand::Sync)?;
    debug!("format: partition {} is now {:?}", opt.partition, fs_type);
    Ok(fs_type)
}

/// Lay a file system over the whole of `dev`, which starts `hidden`
/// sectors into the physical device.
fn format_volume<D: BlockDevice>(
    dev: &mut D,
    opt: &MkfsOptions,
    serial: u32,
    hidden: u64,
) -> Result<FatType, Error<D::E>> {
    let status = dev.initialize();
    if !status.is_ready() {
        return Err(Error::NotReady);
    }
    if status.write_protected {
        return Err(Error::WriteProtected);
    }
    let ss = match dev.ioctl(IoctlCommand::GetSectorSize)? {
        IoctlResult::SectorSize(n)
            if n.is_power_of_two() && (MIN_SS..=MAX_SS).contains(&usize::from(n)) =>
        {
            u32::from(n)
        }
        _ => return Err(Error::NotReady),
    };
    let sz_blk = match opt.align {
        0 => match dev.ioctl(IoctlCommand::GetBlockSize) {
            Ok(IoctlResult::BlockSize(n)) => n,
            _ => 1,
        },
        n => n,
    };
    let sz_blk = if sz_blk.is_power_of_two() && sz_blk <= 0x8000 {
        sz_blk
    } else {
        1
    };
    let n_fats = if opt.n_fat == 2 { 2 } else { 1 };
    let n_root = u32::from(opt.n_root);
    let n_root = if n_root >= 1 && n_root <= 0x8000 && n_root % (ss / DIR_ENTRY_SIZE as u32) == 0
    {
        n_root
    } else {
        512
    };
    if opt.au_size > 0x100_0000 || (opt.au_size != 0 && !opt.au_size.is_power_of_two()) {
        return Err(Error::InvalidParameter);
    }
    let au = opt.au_size / ss;
    let sz_vol = match dev.ioctl(IoctlCommand::GetSectorCount)? {
        IoctlResult::SectorCount(BlockCount(n)) => n,
        _ => return Err(Error::NotReady),
    };
    if sz_vol < 128 {
        return Err(Error::MkfsAborted);
    }

    let geo = Geometry {
        ss,
        hidden,
        sz_vol,
        sz_blk,
        n_fats,
        n_root,
        au,
    };
    let mut buf = [0u8; MAX_SS];
    let buf = &mut buf[..ss as usize];

    let any_fat = opt.fmt.allows_fat() || opt.fmt.allows_fat32();
    let fs_type = if opt.fmt.allows_exfat() && (!any_fat || sz_vol >= 0x400_0000 || au > 128) {
        format_exfat(dev, &geo, buf, serial)?
    } else {
        if !any_fat || au > 128 || sz_vol > u64::from(u32::MAX) {
            return Err(Error::MkfsAborted);
        }
        format_fat(dev, &geo, opt.fmt, buf, serial)?
    };

    dev.ioctl(IoctlCommand::Sync)?;
    Ok(fs_type)
}

/// The sizes the FAT layout settled on.
struct FatLayout {
    fmt: FatType,
    pau: u32,
    n_clst: u32,
    sz_rsv: u32,
    sz_fat: u32,
    sz_dir: u32,
}

/// Pick a FAT sub-type and cluster size that give a legal cluster count.
fn plan_fat(geo: &Geometry, kind: FormatKind) -> Option<FatLayout> {
    let ss = geo.ss;
    let sz_vol = geo.sz_vol as u32;
    let mut fmt = if kind.allows_fat32() && (!kind.allows_fat() || sz_vol >= 0x40_0000) {
        FatType::Fat32
    } else {
        FatType::Fat16
    };
    let mut au = geo.au;
    loop {
        let mut pau = au;
        let mut sz_fat;
        let mut sz_rsv;
        let sz_dir;
        if fmt == FatType::Fat32 {
            if pau == 0 {
                let n = sz_vol / 0x2_0000;
                pau = 1 << CST32.iter().take_while(|&&c| c <= n).count();
            }
            let n_clst = sz_vol / pau;
            sz_fat = (n_clst * 4 + 8 + ss - 1) / ss;
            sz_rsv = 32;
            sz_dir = 0;
            if n_clst <= MAX_FAT16 || n_clst > MAX_FAT32 {
                return None;
            }
        } else {
            if pau == 0 {
                let n = sz_vol / 0x1000;
                pau = 1 << CST16.iter().take_while(|&&c| c <= n).count();
            }
            let n_clst = sz_vol / pau;
            let bytes = if n_clst > MAX_FAT12 {
                n_clst * 2 + 4
            } else {
                fmt = FatType::Fat12;
                (n_clst * 3 + 1) / 2 + 3
            };
            sz_fat = (bytes + ss - 1) / ss;
            sz_rsv = 1;
            sz_dir = geo.n_root * DIR_ENTRY_SIZE as u32 / ss;
        }

        let b_data = sz_rsv + sz_fat * geo.n_fats + sz_dir;
        let pad = ((b_data + geo.sz_blk - 1) & !(geo.sz_blk - 1)) - b_data;
        if fmt == FatType::Fat32 {
            sz_rsv += pad;
        } else {
            sz_fat += pad / geo.n_fats;
        }
        if sz_vol < b_data + pau * 16 {
            return None;
        }
        let n_clst = (sz_vol - sz_rsv - sz_fat * geo.n_fats - sz_dir) / pau;

        if fmt == FatType::Fat32 && n_clst <= MAX_FAT16 {
            if au == 0 {
                au = pau / 2;
                if au != 0 {
                    continue;
                }
            }
            return None;
        }
        if fmt == FatType::Fat16 {
            if n_clst > MAX_FAT16 {
                if au == 0 && pau * 2 <= 64 {
                    au = pau * 2;
                    continue;
                }
                if kind.allows_fat32() {
                    fmt = FatType::Fat32;
                    continue;
                }
                if au == 0 {
                    au = pau * 2;
                    if au <= 128 {
                        continue;
                    }
                }
                return None;
            }
            if n_clst <= MAX_FAT12 {
                if au == 0 {
                    au = pau * 2;
                    if au <= 128 {
                        continue;
                    }
                }
                return None;
            }
        }
        if fmt == FatType::Fat12 && n_clst > MAX_FAT12 {
            return None;
        }
        return Some(FatLayout {
            fmt,
            pau,
            n_clst,
            sz_rsv,
            sz_fat,
            sz_dir,
        });
    }
}

fn format_fat<D: BlockDevice>(
    dev: &mut D,
    geo: &Geometry,
    kind: FormatKind,
    buf: &mut [u8],
    serial: u32,
) -> Result<FatType, Error<D::E>> {
    let Some(lay) = plan_fat(geo, kind) else {
        warn!("format: no FAT layout fits {} sectors", geo.sz_vol);
        return Err(Error::MkfsAborted);
    };
    let ss = geo.ss;
    let sz_vol = geo.sz_vol as u32;
    let b_fat = u64::from(lay.sz_rsv);
    let b_dir = b_fat + u64::from(lay.sz_fat) * u64::from(geo.n_fats);
    let b_data = b_dir + u64::from(lay.sz_dir);
    debug!(
        "format: {:?}, {} clusters of {} sectors, data at {}",
        lay.fmt, lay.n_clst, lay.pau, b_data
    );

    // Boot sector
    buf.fill(0);
    buf[BS_JMP_BOOT..BS_JMP_BOOT + 3].copy_from_slice(b"\xEB\xFE\x90");
    buf[BS_OEM_NAME..BS_OEM_NAME + 8].copy_from_slice(b"MSDOS5.0");
    LittleEndian::write_u16(&mut buf[BPB_BYTS_PER_SEC..], ss as u16);
    buf[BPB_SEC_PER_CLUS] = lay.pau as u8;
    LittleEndian::write_u16(&mut buf[BPB_RSVD_SEC_CNT..], lay.sz_rsv as u16);
    buf[BPB_NUM_FATS] = geo.n_fats as u8;
    let root_ents = if lay.fmt == FatType::Fat32 { 0 } else { geo.n_root };
    LittleEndian::write_u16(&mut buf[BPB_ROOT_ENT_CNT..], root_ents as u16);
    if sz_vol < 0x1_0000 {
        LittleEndian::write_u16(&mut buf[BPB_TOT_SEC16..], sz_vol as u16);
    } else {
        LittleEndian::write_u32(&mut buf[BPB_TOT_SEC32..], sz_vol);
    }
    buf[BPB_MEDIA] = MEDIA_FIXED;
    LittleEndian::write_u16(&mut buf[BPB_SEC_PER_TRK..], 63);
    LittleEndian::write_u16(&mut buf[BPB_NUM_HEADS..], 255);
    LittleEndian::write_u32(&mut buf[BPB_HIDD_SEC..], geo.hidden as u32);
    if lay.fmt == FatType::Fat32 {
        LittleEndian::write_u32(&mut buf[BS_VOL_ID32..], serial);
        LittleEndian::write_u32(&mut buf[BPB_FAT_SZ32..], lay.sz_fat);
        LittleEndian::write_u32(&mut buf[BPB_ROOT_CLUS32..], 2);
        LittleEndian::write_u16(&mut buf[BPB_FS_INFO32..], 1);
        LittleEndian::write_u16(&mut buf[BPB_BK_BOOT_SEC32..], 6);
        buf[BS_DRV_NUM32] = 0x80;
        buf[BS_BOOT_SIG32] = 0x29;
        buf[BS_VOL_LAB32..BS_VOL_LAB32 + 11].copy_from_slice(NO_NAME);
        buf[BS_FIL_SYS_TYPE32..BS_FIL_SYS_TYPE32 + 8].copy_from_slice(b"FAT32   ");
    } else {
        LittleEndian::write_u32(&mut buf[BS_VOL_ID..], serial);
        LittleEndian::write_u16(&mut buf[BPB_FAT_SZ16..], lay.sz_fat as u16);
        buf[BS_DRV_NUM] = 0x80;
        buf[BS_BOOT_SIG] = 0x29;
        let fs_type: &[u8; 8] = if lay.fmt == FatType::Fat12 {
            b"FAT12   "
        } else {
            b"FAT16   "
        };
        buf[BS_VOL_LAB..BS_VOL_LAB + 11].copy_from_slice(NO_NAME);
        buf[BS_FIL_SYS_TYPE..BS_FIL_SYS_TYPE + 8].copy_from_slice(fs_type);
    }
    LittleEndian::write_u16(&mut buf[BS_55AA..], BOOT_SIGNATURE);
    put(dev, buf, 0)?;

    if lay.fmt == FatType::Fat32 {
        put(dev, buf, 6)?;
        write_fsinfo(buf, lay.n_clst - 1, 2);
        put(dev, buf, 1)?;
        put(dev, buf, 7)?;
    }

    // FATs
    for i in 0..u64::from(geo.n_fats) {
        let base = b_fat + i * u64::from(lay.sz_fat);
        buf.fill(0);
        match lay.fmt {
            FatType::Fat32 => {
                LittleEndian::write_u32(&mut buf[0..], 0xFFFF_FF00 | u32::from(MEDIA_FIXED));
                LittleEndian::write_u32(&mut buf[4..], 0xFFFF_FFFF);
                // Root directory cluster
                LittleEndian::write_u32(&mut buf[8..], 0x0FFF_FFFF);
            }
            FatType::Fat16 => {
                LittleEndian::write_u32(&mut buf[0..], 0xFFFF_FF00 | u32::from(MEDIA_FIXED));
            }
            _ => {
                LittleEndian::write_u32(&mut buf[0..], 0x00FF_FF00 | u32::from(MEDIA_FIXED));
            }
        }
        put(dev, buf, base)?;
        zero_fill(dev, buf, base + 1, u64::from(lay.sz_fat) - 1)?;
    }

    // Root directory: the fixed table, or the first cluster on FAT32.
    let root_len = if lay.fmt == FatType::Fat32 {
        lay.pau
    } else {
        lay.sz_dir
    };
    zero_fill(dev, buf, b_dir, u64::from(root_len))?;

    trim(dev, b_data, geo.sz_vol);
    Ok(lay.fmt)
}

/// Tell the device the data area holds nothing. Failure is harmless.
fn trim<D: BlockDevice>(dev: &mut D, from: u64, sz_vol: u64) {
    let cmd = IoctlCommand::Trim {
        start: BlockIdx(from),
        end: BlockIdx(sz_vol - 1),
    };
    if dev.ioctl(cmd).is_err() {
        debug!("format: device ignored trim");
    }
}

/// Buffers bytes into whole sectors on their way to the device.
struct SectorStream<'a> {
    buf: &'a mut [u8],
    sect: u64,
    fill: usize,
}

impl<'a> SectorStream<'a> {
    fn new(buf: &'a mut [u8], sect: u64) -> SectorStream<'a> {
        buf.fill(0);
        SectorStream { buf, sect, fill: 0 }
    }

    fn push<D: BlockDevice>(&mut self, dev: &mut D, bytes: &[u8]) -> Result<(), Error<D::E>> {
        for &b in bytes {
            self.buf[self.fill] = b;
            self.fill += 1;
            if self.fill == self.buf.len() {
                put(dev, self.buf, self.sect)?;
                self.buf.fill(0);
                self.sect += 1;
                self.fill = 0;
            }
        }
        Ok(())
    }

    /// Write out a partly filled sector. Returns the next sector.
    fn finish<D: BlockDevice>(self, dev: &mut D) -> Result<u64, Error<D::E>> {
        if self.fill != 0 {
            put(dev, self.buf, self.sect)?;
            return Ok(self.sect + 1);
        }
        Ok(self.sect)
    }
}

/// The up-case table in its compressed form, one UTF-16 unit at a time.
///
/// Runs of 128 or more characters that map to themselves are written as
/// `0xFFFF` followed by the run length.
struct UpcaseTable {
    next: u32,
    run: u32,
    state: u8,
}

impl UpcaseTable {
    fn new() -> UpcaseTable {
        UpcaseTable {
            next: 0,
            run: 0,
            state: 0,
        }
    }
}

impl Iterator for UpcaseTable {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.next >= 0x1_0000 {
            return None;
        }
        let si = self.next;
        let ch = match self.state {
            0 => {
                let up = wtoupper(si as u16);
                if up != si as u16 {
                    self.next += 1;
                    up
                } else {
                    let mut j = 1;
                    while si + j < 0x1_0000 && wtoupper((si + j) as u16) == (si + j) as u16 {
                        j += 1;
                    }
                    if j >= 128 {
                        self.run = j;
                        self.state = 2;
                        0xFFFF
                    } else {
                        self.run = j - 1;
                        self.state = if self.run == 0 { 0 } else { 1 };
                        self.next += 1;
                        si as u16
                    }
                }
            }
            1 => {
                self.next += 1;
                self.run -= 1;
                if self.run == 0 {
                    self.state = 0;
                }
                si as u16
            }
            _ => {
                self.next += self.run;
                self.state = 0;
                self.run as u16
            }
        };
        Some(ch)
    }
}

/// Where the exFAT allocation map, up-case table and root directory go.
struct ExFatLayout {
    au: u32,
    b_fat: u64,
    sz_fat: u32,
    b_data: u64,
    n_clst: u32,
    bitmap_bytes: u32,
    upcase_bytes: u32,
    upcase_sum: u32,
    /// Clusters used by the bitmap, the up-case table and the root
    tbl: [u32; 3],
}

fn format_exfat<D: BlockDevice>(
    dev: &mut D,
    geo: &Geometry,
    buf: &mut [u8],
    serial: u32,
) -> Result<FatType, Error<D::E>> {
    let ss = geo.ss;
    let sz_vol = geo.sz_vol;
    if sz_vol < 0x1000 {
        return Err(Error::MkfsAborted);
    }
    let au = match geo.au {
        0 if sz_vol >= 0x400_0000 => 256,
        0 if sz_vol >= 0x8_0000 => 64,
        0 => 8,
        n => n,
    };
    let b_fat = 32u64;
    let sz_fat = ((sz_vol / u64::from(au) + 2) * 4 + u64::from(ss) - 1) / u64::from(ss);
    let blk = u64::from(geo.sz_blk);
    let b_data = (b_fat + sz_fat + blk - 1) & !(blk - 1);
    if b_data >= sz_vol / 2 {
        return Err(Error::MkfsAborted);
    }
    let n_clst = (sz_vol - b_data) / u64::from(au);
    if n_clst < 16 || n_clst > u64::from(crate::fat::MAX_EXFAT) {
        return Err(Error::MkfsAborted);
    }
    let n_clst = n_clst as u32;
    let clst_bytes = au * ss;
    let bitmap_bytes = (n_clst + 7) / 8;

    // Size and checksum of the up-case table come from a dry run.
    let (upcase_bytes, upcase_sum) = UpcaseTable::new().fold((0u32, 0u32), |(n, sum), ch| {
        let sum = xsum32((ch >> 8) as u8, xsum32(ch as u8, sum));
        (n + 2, sum)
    });
    let lay = ExFatLayout {
        au,
        b_fat,
        sz_fat: sz_fat as u32,
        b_data,
        n_clst,
        bitmap_bytes,
        upcase_bytes,
        upcase_sum,
        tbl: [
            (bitmap_bytes + clst_bytes - 1) / clst_bytes,
            (upcase_bytes + clst_bytes - 1) / clst_bytes,
            1,
        ],
    };
    debug!(
        "format: exFAT, {} clusters of {} sectors, data at {}",
        n_clst, au, b_data
    );

    write_exfat_tables(dev, &lay, buf)?;
    write_exfat_root(dev, &lay, buf)?;
    for base in [0u64, 12] {
        write_exfat_boot_region(dev, geo, &lay, buf, base, serial)?;
    }
    let used: u32 = lay.tbl.iter().sum();
    trim(
        dev,
        b_data + u64::from(used) * u64::from(au),
        sz_vol,
    );
    Ok(FatType::ExFat)
}

fn cluster_sector(lay: &ExFatLayout, clst: u32) -> u64 {
    lay.b_data + u64::from(clst - 2) * u64::from(lay.au)
}

/// FAT, allocation bitmap and up-case table.
fn write_exfat_tables<D: BlockDevice>(
    dev: &mut D,
    lay: &ExFatLayout,
    buf: &mut [u8],
) -> Result<(), Error<D::E>> {
    let ss = buf.len() as u64;
    let used: u32 = lay.tbl.iter().sum();

    // FAT: entries 0 and 1 are reserved, then one chain per table.
    let fat_entry = |cl: u32| -> u32 {
        match cl {
            0 => 0xFFFF_FFF8,
            1 => 0xFFFF_FFFF,
            _ => {
                let mut start = 2;
                for &len in lay.tbl.iter() {
                    if cl < start + len {
                        return if cl + 1 < start + len {
                            cl + 1
                        } else {
                            0xFFFF_FFFF
                        };
                    }
                    start += len;
                }
                0
            }
        }
    };
    let per_sector = (ss / 4) as u32;
    let used_fat_sectors = u64::from((used + 2 + per_sector - 1) / per_sector);
    for s in 0..used_fat_sectors {
        for i in 0..per_sector {
            let cl = s as u32 * per_sector + i;
            LittleEndian::write_u32(&mut buf[i as usize * 4..], fat_entry(cl));
        }
        put(dev, buf, lay.b_fat + s)?;
    }
    zero_fill(
        dev,
        buf,
        lay.b_fat + used_fat_sectors,
        u64::from(lay.sz_fat) - used_fat_sectors,
    )?;

    // Allocation bitmap: the system clusters are in use.
    let bitmap_sectors = u64::from(lay.tbl[0]) * u64::from(lay.au);
    let bits_per_sector = ss * 8;
    for s in 0..bitmap_sectors {
        buf.fill(0);
        let first = s * bits_per_sector;
        for bit in first..(first + bits_per_sector).min(u64::from(used)) {
            let b = (bit - first) as usize;
            buf[b / 8] |= 1 << (b % 8);
        }
        put(dev, buf, cluster_sector(lay, 2) + s)?;
    }

    // Up-case table
    let start = cluster_sector(lay, 2 + lay.tbl[0]);
    let mut out = SectorStream::new(buf, start);
    for ch in UpcaseTable::new() {
        out.push(dev, &ch.to_le_bytes())?;
    }
    let next = out.finish(dev)?;
    let end = start + u64::from(lay.tbl[1]) * u64::from(lay.au);
    zero_fill(dev, buf, next, end - next)?;
    Ok(())
}

/// Root directory with the label, bitmap and up-case entries.
fn write_exfat_root<D: BlockDevice>(
    dev: &mut D,
    lay: &ExFatLayout,
    buf: &mut [u8],
) -> Result<(), Error<D::E>> {
    let root = cluster_sector(lay, 2 + lay.tbl[0] + lay.tbl[1]);
    buf.fill(0);
    buf[0] = ET_VLABEL;
    buf[DIR_ENTRY_SIZE] = ET_BITMAP;
    LittleEndian::write_u32(&mut buf[DIR_ENTRY_SIZE + XDIR_SYS_FST_CLUS..], 2);
    LittleEndian::write_u64(&mut buf[DIR_ENTRY_SIZE + XDIR_SYS_DATA_LEN..], u64::from(lay.bitmap_bytes));
    buf[DIR_ENTRY_SIZE * 2] = ET_UPCASE;
    LittleEndian::write_u32(&mut buf[DIR_ENTRY_SIZE * 2 + XDIR_CASE_SUM..], lay.upcase_sum);
    LittleEndian::write_u32(&mut buf[DIR_ENTRY_SIZE * 2 + XDIR_SYS_FST_CLUS..], 2 + lay.tbl[0]);
    LittleEndian::write_u64(&mut buf[DIR_ENTRY_SIZE * 2 + XDIR_SYS_DATA_LEN..], u64::from(lay.upcase_bytes));
    put(dev, buf, root)?;
    zero_fill(dev, buf, root + 1, u64::from(lay.au) - 1)
}

/// One copy of the twelve sector boot region, at `base`.
fn write_exfat_boot_region<D: BlockDevice>(
    dev: &mut D,
    geo: &Geometry,
    lay: &ExFatLayout,
    buf: &mut [u8],
    base: u64,
    serial: u32,
) -> Result<(), Error<D::E>> {
    let ss = buf.len();
    let mut sum = 0u32;

    // Main boot sector
    buf.fill(0);
    buf[..11].copy_from_slice(EXFAT_MAGIC);
    LittleEndian::write_u64(&mut buf[BPB_VOL_OFS_EX..], geo.hidden);
    LittleEndian::write_u64(&mut buf[BPB_TOT_SEC_EX..], geo.sz_vol);
    LittleEndian::write_u32(&mut buf[BPB_FAT_OFS_EX..], lay.b_fat as u32);
    LittleEndian::write_u32(&mut buf[BPB_FAT_SZ_EX..], lay.sz_fat);
    LittleEndian::write_u32(&mut buf[BPB_DATA_OFS_EX..], lay.b_data as u32);
    LittleEndian::write_u32(&mut buf[BPB_NUM_CLUS_EX..], lay.n_clst);
    LittleEndian::write_u32(
        &mut buf[BPB_ROOT_CLUS_EX..],
        2 + lay.tbl[0] + lay.tbl[1],
    );
    LittleEndian::write_u32(&mut buf[BPB_VOL_ID_EX..], serial);
    LittleEndian::write_u16(&mut buf[BPB_FS_VER_EX..], 0x100);
    buf[BPB_BYTS_PER_SEC_EX] = ss.trailing_zeros() as u8;
    buf[BPB_SEC_PER_CLUS_EX] = lay.au.trailing_zeros() as u8;
    buf[BPB_NUM_FATS_EX] = 1;
    buf[BPB_DRV_NUM_EX] = 0x80;
    LittleEndian::write_u16(&mut buf[BS_BOOT_CODE_EX..], 0xFEEB);
    LittleEndian::write_u16(&mut buf[BS_55AA..], BOOT_SIGNATURE);
    for (i, &b) in buf.iter().enumerate() {
        if i != BPB_VOL_FLAG_EX && i != BPB_VOL_FLAG_EX + 1 && i != BPB_PERC_IN_USE_EX {
            sum = xsum32(b, sum);
        }
    }
    put(dev, buf, base)?;

    // Extended boot sectors, OEM parameters and the reserved sector
    for n in 1..11u64 {
        buf.fill(0);
        if n < 9 {
            LittleEndian::write_u16(&mut buf[ss - 2..], BOOT_SIGNATURE);
        }
        sum = buf.iter().fold(sum, |s, &b| xsum32(b, s));
        put(dev, buf, base + n)?;
    }

    // Checksum sector
    for chunk in buf.chunks_exact_mut(4) {
        LittleEndian::write_u32(chunk, sum);
    }
    put(dev, buf, base + 11)
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::volume::FatVolume;
    use crate::RamDisk;

    fn disk(mib: usize) -> RamDisk<Vec<u8>> {
        RamDisk::new(vec![0u8; mib * 1024 * 1024], 512)
    }

    fn opts(fmt: FormatKind) -> MkfsOptions {
        MkfsOptions {
            fmt,
            ..MkfsOptions::default()
        }
    }

    #[test]
    fn small_volume_gets_fat12() {
        let mut d = disk(4);
        assert_eq!(format(&mut d, &opts(FormatKind::Any), 1), Ok(FatType::Fat12));
        let vol = FatVolume::mount(&mut d, 0).unwrap();
        assert_eq!(vol.fs_type, FatType::Fat12);
        assert_eq!(vol.csize, 4);
        assert_eq!(vol.cluster_count(), 2038);
        assert_eq!(&d.as_bytes()[54..62], b"FAT12   ");
    }

    #[test]
    fn medium_volume_gets_fat16() {
        let mut d = disk(16);
        assert_eq!(format(&mut d, &opts(FormatKind::AnyFat), 1), Ok(FatType::Fat16));
        let vol = FatVolume::mount(&mut d, 0).unwrap();
        assert_eq!(vol.fs_type, FatType::Fat16);
        assert_eq!(vol.cluster_count(), 8175);
        assert_eq!(vol.n_rootdir, 512);
    }

    #[test]
    fn forced_fat32() {
        let mut d = disk(40);
        assert_eq!(format(&mut d, &opts(FormatKind::Fat32), 7), Ok(FatType::Fat32));
        let bytes = d.as_bytes();
        // The backup boot sector matches the primary.
        assert_eq!(bytes[..512], bytes[6 * 512..7 * 512]);
        assert_eq!(LittleEndian::read_u32(&bytes[BS_VOL_ID32..]), 7);
        let vol = FatVolume::mount(&mut d, 0).unwrap();
        assert_eq!(vol.fs_type, FatType::Fat32);
        assert_eq!(vol.cluster_count(), 81247);
        assert_eq!(vol.dirbase, 2);
        assert!(vol.fsi_enabled);
        assert_eq!(vol.free_clust, 81246);
        assert_eq!(vol.last_clust, 2);
    }

    #[test]
    fn data_area_follows_erase_blocks() {
        let mut d = disk(16).with_block_size(64);
        assert_eq!(format(&mut d, &opts(FormatKind::Fat), 1), Ok(FatType::Fat16));
        let vol = FatVolume::mount(&mut d, 0).unwrap();
        assert_eq!(vol.database, 128);
        assert_eq!(vol.fsize, 95);
        assert!(d.trimmed_sectors() > 0);
    }

    #[test]
    fn two_fats() {
        let mut d = disk(16);
        let o = MkfsOptions {
            fmt: FormatKind::Fat,
            n_fat: 2,
            ..MkfsOptions::default()
        };
        assert_eq!(format(&mut d, &o, 1), Ok(FatType::Fat16));
        let vol = FatVolume::mount(&mut d, 0).unwrap();
        assert_eq!(vol.n_fats, 2);
        assert_eq!(vol.fatbase + 2 * u64::from(vol.fsize), vol.dirbase);
    }

    #[test]
    fn exfat_volume_mounts() {
        let mut d = disk(8);
        assert_eq!(format(&mut d, &opts(FormatKind::ExFat), 0x1234), Ok(FatType::ExFat));
        let bytes = d.as_bytes();
        // Both boot regions are identical.
        assert_eq!(bytes[..12 * 512], bytes[12 * 512..24 * 512]);
        let vol = FatVolume::mount(&mut d, 0).unwrap();
        assert_eq!(vol.fs_type, FatType::ExFat);
        assert_eq!(vol.csize, 8);
        assert_eq!(vol.cluster_count(), 2041);
        assert_eq!(vol.bitbase, vol.database);
    }

    #[test]
    fn exfat_boot_checksum() {
        let mut d = disk(8);
        format(&mut d, &opts(FormatKind::ExFat), 1).unwrap();
        let bytes = d.as_bytes();
        let mut sum = 0u32;
        for (i, &b) in bytes[..11 * 512].iter().enumerate() {
            if i != 106 && i != 107 && i != 112 {
                sum = xsum32(b, sum);
            }
        }
        assert_eq!(LittleEndian::read_u32(&bytes[11 * 512..]), sum);
        assert_eq!(LittleEndian::read_u32(&bytes[12 * 512 - 4..]), sum);
    }

    #[test]
    fn upcase_table_is_compressed() {
        let table: Vec<u16> = UpcaseTable::new().collect();
        // 'a'..'z' map onto 'A'..'Z' right after the leading identity run.
        assert_eq!(&table[..0x61], &(0..0x61).collect::<Vec<u16>>()[..]);
        assert_eq!(table[0x61], u16::from(b'A'));
        assert_eq!(table[0x7A], u16::from(b'Z'));
        assert!(table.windows(2).any(|w| w[0] == 0xFFFF && w[1] >= 128));
        assert!(table.len() < 0x1_0000 / 4);

        // Expanding it gives back one entry per character.
        let mut expanded = 0u32;
        let mut it = table.iter();
        while let Some(&c) = it.next() {
            if c == 0xFFFF {
                expanded += u32::from(*it.next().unwrap());
            } else {
                expanded += 1;
            }
        }
        assert_eq!(expanded, 0x1_0000);
    }

    #[test]
    fn refuses_tiny_and_protected_devices() {
        let mut d = RamDisk::new(vec![0u8; 64 * 512], 512);
        assert_eq!(format(&mut d, &opts(FormatKind::Any), 1), Err(Error::MkfsAborted));

        let mut d = disk(4);
        d.set_write_protected(true);
        assert_eq!(format(&mut d, &opts(FormatKind::Any), 1), Err(Error::WriteProtected));
    }

    #[test]
    fn rejects_bad_cluster_size() {
        let mut d = disk(4);
        let o = MkfsOptions {
            au_size: 3000,
            ..MkfsOptions::default()
        };
        assert_eq!(format(&mut d, &o, 1), Err(Error::InvalidParameter));
    }

    #[test]
    fn fat32_refused_on_small_volume() {
        let mut d = disk(4);
        assert_eq!(format(&mut d, &opts(FormatKind::Fat32), 1), Err(Error::MkfsAborted));
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
