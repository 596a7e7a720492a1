//! Short (8.3) directory entries.
//!
//! 32 bytes: name@0 (11, space padded), attributes@11, NT case flags@12,
//! creation tenths@13, creation time/date@14, access date@18, cluster
//! high@20, write time/date@22, cluster low@26, size@28.

use byteorder::{ByteOrder, LittleEndian};

use crate::fat::FatType;
use crate::filesystem::attributes::Attributes;

pub(crate) const DIR_NAME: usize = 0;
pub(crate) const DIR_ATTR: usize = 11;
pub(crate) const DIR_NTRES: usize = 12;
pub(crate) const DIR_CRT_TIME: usize = 14;
pub(crate) const DIR_LST_ACC_DATE: usize = 18;
pub(crate) const DIR_FST_CLUS_HI: usize = 20;
pub(crate) const DIR_MOD_TIME: usize = 22;
pub(crate) const DIR_FST_CLUS_LO: usize = 26;
pub(crate) const DIR_FILE_SIZE: usize = 28;

/// First name byte of a deleted entry.
pub(crate) const DELETED: u8 = 0xE5;
/// Stored instead of a real leading 0xE5.
pub(crate) const DELETED_SUBSTITUTE: u8 = 0x05;

/// Attribute bits that exist in a FAT entry.
pub(crate) const ATTR_MASK: u8 = 0x3F;

/// NT case flag: the body is all lower case.
pub(crate) const NT_LOWER_BODY: u8 = 0x08;
/// NT case flag: the extension is all lower case.
pub(crate) const NT_LOWER_EXT: u8 = 0x10;

/// A borrowed view of one short directory entry.
pub(crate) struct OnDiskDirEntry<'a> {
    data: &'a [u8],
}

impl<'a> core::fmt::Debug for OnDiskDirEntry<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("OnDiskDirEntry")
            .field("name", &self.name())
            .field("attr", &self.attributes())
            .field("cluster_lo", &self.first_cluster_lo())
            .field("size", &self.file_size())
            .finish()
    }
}

impl<'a> OnDiskDirEntry<'a> {
    pub(crate) const LEN: usize = 32;

    define_field!(raw_attr, u8, DIR_ATTR);
    define_field!(nt_res, u8, DIR_NTRES);
    define_field!(first_cluster_hi, u16, DIR_FST_CLUS_HI);
    define_field!(first_cluster_lo, u16, DIR_FST_CLUS_LO);
    define_field!(modified, u32, DIR_MOD_TIME);
    define_field!(file_size, u32, DIR_FILE_SIZE);

    /// View the first 32 bytes of `data`.
    pub(crate) fn new(data: &'a [u8]) -> OnDiskDirEntry<'a> {
        OnDiskDirEntry {
            data: &data[..Self::LEN],
        }
    }

    /// The 11 raw name bytes.
    pub(crate) fn name(&self) -> &[u8] {
        &self.data[DIR_NAME..DIR_NAME + 11]
    }

    /// The defined attribute bits.
    pub(crate) fn attributes(&self) -> Attributes {
        Attributes::create_from_fat(self.raw_attr() & ATTR_MASK)
    }

    /// Start cluster. The high word only counts on FAT32.
    pub(crate) fn first_cluster(&self, fat_type: FatType) -> u32 {
        let lo = u32::from(self.first_cluster_lo());
        if fat_type == FatType::Fat32 {
            lo | (u32::from(self.first_cluster_hi()) << 16)
        } else {
            lo
        }
    }

    /// Render the 8.3 name as `NAME.EXT`. With `lower` the NT case flags
    /// are applied, which is how a name without long name is shown.
    pub(crate) fn short_name<const N: usize>(&self, out: &mut heapless::String<N>, lower: bool) {
        out.clear();
        let nt = self.nt_res();
        let mut case = NT_LOWER_BODY;
        for (i, &b) in self.name().iter().enumerate() {
            if b == b' ' {
                continue;
            }
            if i >= 8 && case == NT_LOWER_BODY {
                let _ = out.push('.');
                case = NT_LOWER_EXT;
            }
            let mut c = if i == 0 && b == DELETED_SUBSTITUTE {
                char::from(DELETED)
            } else {
                char::from(b)
            };
            if lower && nt & case != 0 && c.is_ascii_uppercase() {
                c = c.to_ascii_lowercase();
            }
            let _ = out.push(c);
        }
    }
}

/// Store a start cluster. Only FAT32 has a high word.
pub(crate) fn st_clust(entry: &mut [u8], fat_type: FatType, cl: u32) {
    LittleEndian::write_u16(&mut entry[DIR_FST_CLUS_LO..], cl as u16);
    if fat_type == FatType::Fat32 {
        LittleEndian::write_u16(&mut entry[DIR_FST_CLUS_HI..], (cl >> 16) as u16);
    }
}

/// Turn `entry` into a fresh short entry.
pub(crate) fn init_sfn_entry(entry: &mut [u8], sfn: &[u8; 11], nt: u8) {
    entry[..OnDiskDirEntry::LEN].fill(0);
    entry[DIR_NAME..DIR_NAME + 11].copy_from_slice(sfn);
    entry[DIR_NTRES] = nt;
}

/// Set the creation and modification stamps to the packed DOS value `tm`.
pub(crate) fn stamp_created(entry: &mut [u8], tm: u32) {
    LittleEndian::write_u32(&mut entry[DIR_CRT_TIME..], tm);
    LittleEndian::write_u32(&mut entry[DIR_MOD_TIME..], tm);
}

/// Set the modification stamp and access date.
pub(crate) fn stamp_modified(entry: &mut [u8], tm: u32) {
    LittleEndian::write_u32(&mut entry[DIR_MOD_TIME..], tm);
    LittleEndian::write_u16(&mut entry[DIR_LST_ACC_DATE..], (tm >> 16) as u16);
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
