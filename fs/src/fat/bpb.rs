//! Boot Parameter Block

use byteorder::{ByteOrder, LittleEndian};

use crate::fat::FatType;

pub(crate) const BS_JMP_BOOT: usize = 0;
pub(crate) const BS_OEM_NAME: usize = 3;
pub(crate) const BPB_BYTS_PER_SEC: usize = 11;
pub(crate) const BPB_SEC_PER_CLUS: usize = 13;
pub(crate) const BPB_RSVD_SEC_CNT: usize = 14;
pub(crate) const BPB_NUM_FATS: usize = 16;
pub(crate) const BPB_ROOT_ENT_CNT: usize = 17;
pub(crate) const BPB_TOT_SEC16: usize = 19;
pub(crate) const BPB_MEDIA: usize = 21;
pub(crate) const BPB_FAT_SZ16: usize = 22;
pub(crate) const BPB_SEC_PER_TRK: usize = 24;
pub(crate) const BPB_NUM_HEADS: usize = 26;
pub(crate) const BPB_HIDD_SEC: usize = 28;
pub(crate) const BPB_TOT_SEC32: usize = 32;
pub(crate) const BS_DRV_NUM: usize = 36;
pub(crate) const BS_BOOT_SIG: usize = 38;
pub(crate) const BS_VOL_ID: usize = 39;
pub(crate) const BS_VOL_LAB: usize = 43;
pub(crate) const BS_FIL_SYS_TYPE: usize = 54;
pub(crate) const BS_55AA: usize = 510;

pub(crate) const BPB_FAT_SZ32: usize = 36;
pub(crate) const BPB_FS_VER32: usize = 42;
pub(crate) const BPB_ROOT_CLUS32: usize = 44;
pub(crate) const BPB_FS_INFO32: usize = 48;
pub(crate) const BPB_BK_BOOT_SEC32: usize = 50;
pub(crate) const BS_DRV_NUM32: usize = 64;
pub(crate) const BS_BOOT_SIG32: usize = 66;
pub(crate) const BS_VOL_ID32: usize = 67;
pub(crate) const BS_VOL_LAB32: usize = 71;
pub(crate) const BS_FIL_SYS_TYPE32: usize = 82;

pub(crate) const BPB_ZEROED_EX: usize = 11;
pub(crate) const BPB_VOL_OFS_EX: usize = 64;
pub(crate) const BPB_TOT_SEC_EX: usize = 72;
pub(crate) const BPB_FAT_OFS_EX: usize = 80;
pub(crate) const BPB_FAT_SZ_EX: usize = 84;
pub(crate) const BPB_DATA_OFS_EX: usize = 88;
pub(crate) const BPB_NUM_CLUS_EX: usize = 92;
pub(crate) const BPB_ROOT_CLUS_EX: usize = 96;
pub(crate) const BPB_VOL_ID_EX: usize = 100;
pub(crate) const BPB_FS_VER_EX: usize = 104;
pub(crate) const BPB_BYTS_PER_SEC_EX: usize = 108;
pub(crate) const BPB_SEC_PER_CLUS_EX: usize = 109;
pub(crate) const BPB_NUM_FATS_EX: usize = 110;
pub(crate) const BPB_DRV_NUM_EX: usize = 111;
pub(crate) const BPB_VOL_FLAG_EX: usize = 106;
pub(crate) const BPB_PERC_IN_USE_EX: usize = 112;
pub(crate) const BS_BOOT_CODE_EX: usize = 120;

/// The boot sector signature at offset 510.
pub(crate) const BOOT_SIGNATURE: u16 = 0xAA55;
/// Jump code and OEM name of an exFAT boot sector.
pub(crate) const EXFAT_MAGIC: &[u8; 11] = b"\xEB\x76\x90EXFAT   ";
pub(crate) const FAT32_TYPE: &[u8; 8] = b"FAT32   ";

/// A borrowed view of a boot sector, FAT or exFAT.
pub(crate) struct Bpb<'a> {
    data: &'a [u8],
}

impl<'a> Bpb<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Bpb<'a> {
        Bpb { data }
    }

    define_field!(bytes_per_sector, u16, BPB_BYTS_PER_SEC);
    define_field!(sectors_per_cluster, u8, BPB_SEC_PER_CLUS);
    define_field!(reserved_sectors, u16, BPB_RSVD_SEC_CNT);
    define_field!(num_fats, u8, BPB_NUM_FATS);
    define_field!(root_entries_count, u16, BPB_ROOT_ENT_CNT);
    define_field!(total_sectors16, u16, BPB_TOT_SEC16);
    define_field!(fat_size16, u16, BPB_FAT_SZ16);
    define_field!(total_sectors32, u32, BPB_TOT_SEC32);
    define_field!(fat_size32, u32, BPB_FAT_SZ32);
    define_field!(fs_ver, u16, BPB_FS_VER32);
    define_field!(first_root_dir_cluster, u32, BPB_ROOT_CLUS32);
    define_field!(fs_info, u16, BPB_FS_INFO32);
    define_field!(signature, u16, BS_55AA);

    define_field!(ex_total_sectors, u64, BPB_TOT_SEC_EX);
    define_field!(ex_fat_offset, u32, BPB_FAT_OFS_EX);
    define_field!(ex_fat_size, u32, BPB_FAT_SZ_EX);
    define_field!(ex_data_offset, u32, BPB_DATA_OFS_EX);
    define_field!(ex_cluster_count, u32, BPB_NUM_CLUS_EX);
    define_field!(ex_root_cluster, u32, BPB_ROOT_CLUS_EX);
    define_field!(serial16, u32, BS_VOL_ID);
    define_field!(serial32, u32, BS_VOL_ID32);
    define_field!(ex_serial, u32, BPB_VOL_ID_EX);
    define_field!(ex_fs_ver, u16, BPB_FS_VER_EX);
    define_field!(ex_bytes_per_sector_shift, u8, BPB_BYTS_PER_SEC_EX);
    define_field!(ex_sectors_per_cluster_shift, u8, BPB_SEC_PER_CLUS_EX);
    define_field!(ex_num_fats, u8, BPB_NUM_FATS_EX);

    /// Volume serial number, from where `fat_type` keeps it.
    pub(crate) fn serial(&self, fat_type: FatType) -> u32 {
        match fat_type {
            FatType::ExFat => self.ex_serial(),
            FatType::Fat32 => self.serial32(),
            FatType::Fat12 | FatType::Fat16 => self.serial16(),
        }
    }

    /// Is this an exFAT boot sector?
    pub(crate) fn is_exfat(&self) -> bool {
        self.signature() == BOOT_SIGNATURE && &self.data[..11] == EXFAT_MAGIC
    }

    /// Does the sector start with a jump (or call) instruction?
    pub(crate) fn has_jump(&self) -> bool {
        matches!(self.data[BS_JMP_BOOT], 0xEB | 0xE9 | 0xE8)
    }

    /// Does the FAT32 file system type string say so?
    pub(crate) fn says_fat32(&self) -> bool {
        &self.data[BS_FIL_SYS_TYPE32..BS_FIL_SYS_TYPE32 + 8] == FAT32_TYPE
    }

    /// Plausibility checks for boot sectors written by early DOS, which
    /// lack the signature and type string.
    pub(crate) fn looks_like_fat(&self) -> bool {
        let ss = self.bytes_per_sector();
        let spc = self.sectors_per_cluster();
        ss.is_power_of_two()
            && usize::from(ss) >= crate::MIN_SS
            && usize::from(ss) <= crate::MAX_SS
            && spc.is_power_of_two()
            && self.reserved_sectors() != 0
            && (1..=2).contains(&self.num_fats())
            && self.root_entries_count() != 0
            && (self.total_sectors16() >= 128 || self.total_sectors32() >= 0x10000)
            && self.fat_size16() != 0
    }

    /// Sectors per FAT, from whichever field is in use.
    pub(crate) fn fat_size(&self) -> u32 {
        match self.fat_size16() {
            0 => self.fat_size32(),
            n => u32::from(n),
        }
    }

    /// Sectors in the volume, from whichever field is in use.
    pub(crate) fn total_sectors(&self) -> u32 {
        match self.total_sectors16() {
            0 => self.total_sectors32(),
            n => u32::from(n),
        }
    }

    /// Are the 53 bytes exFAT requires to be zero actually zero?
    pub(crate) fn ex_zeroed_ok(&self) -> bool {
        self.data[BPB_ZEROED_EX..BPB_ZEROED_EX + 53]
            .iter()
            .all(|b| *b == 0)
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

    #[test]
    fn fat16_boot_sector() {
        let mut sector = [0u8; 512];
        sector[..62].copy_from_slice(&hex!(
            "EB 3C 90 4D 53 44 4F 53 35 2E 30 00 02 04 04 00
             02 00 02 00 00 F8 20 00 3F 00 FF 00 00 00 00 00
             00 00 01 00 80 00 29 78 56 34 12 4E 4F 20 4E 41
             4D 45 20 20 20 20 46 41 54 31 36 20 20 20"
        ));
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let bpb = Bpb::new(&sector);
        assert!(bpb.has_jump());
        assert!(!bpb.is_exfat());
        assert!(!bpb.says_fat32());
        assert!(bpb.looks_like_fat());
        assert_eq!(bpb.bytes_per_sector(), 512);
        assert_eq!(bpb.sectors_per_cluster(), 4);
        assert_eq!(bpb.reserved_sectors(), 4);
        assert_eq!(bpb.num_fats(), 2);
        assert_eq!(bpb.root_entries_count(), 512);
        assert_eq!(bpb.fat_size(), 32);
        assert_eq!(bpb.total_sectors(), 0x1_0000);
        assert_eq!(bpb.signature(), BOOT_SIGNATURE);
    }

    #[test]
    fn exfat_magic() {
        let mut sector = [0u8; 512];
        sector[..11].copy_from_slice(EXFAT_MAGIC);
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let bpb = Bpb::new(&sector);
        assert!(bpb.is_exfat());
        assert!(bpb.ex_zeroed_ok());
        sector[20] = 1;
        assert!(!Bpb::new(&sector).ex_zeroed_ok());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
