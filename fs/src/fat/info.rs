//! The FAT32 FSInfo sector.
//!
//! It caches the free cluster count and a hint where to look for the next
//! free cluster. Both are advisory: a count larger than the volume is
//! ignored.

use byteorder::{ByteOrder, LittleEndian};

use crate::fat::bpb::{BOOT_SIGNATURE, BS_55AA};

const FSI_LEAD_SIG: usize = 0;
const FSI_STRUC_SIG: usize = 484;
const FSI_FREE_COUNT: usize = 488;
const FSI_NXT_FREE: usize = 492;

const LEAD_SIGNATURE: u32 = 0x4161_5252;
const STRUC_SIGNATURE: u32 = 0x6141_7272;

/// A borrowed view of an FSInfo sector.
pub(crate) struct InfoSector<'a> {
    data: &'a [u8],
}

impl<'a> InfoSector<'a> {
    /// View `data` as an FSInfo sector, if all three signatures match.
    pub(crate) fn create_from_bytes(data: &'a [u8]) -> Option<InfoSector<'a>> {
        let info = InfoSector { data };
        if info.lead_sig() != LEAD_SIGNATURE
            || info.struc_sig() != STRUC_SIGNATURE
            || info.trail_sig() != BOOT_SIGNATURE
        {
            return None;
        }
        Some(info)
    }

    define_field!(lead_sig, u32, FSI_LEAD_SIG);
    define_field!(struc_sig, u32, FSI_STRUC_SIG);
    define_field!(free_count, u32, FSI_FREE_COUNT);
    define_field!(next_free, u32, FSI_NXT_FREE);
    define_field!(trail_sig, u16, BS_55AA);
}

/// Fill `buf` (one whole sector) with an FSInfo sector.
pub(crate) fn write_fsinfo(buf: &mut [u8], free: u32, last: u32) {
    buf.fill(0);
    LittleEndian::write_u32(&mut buf[FSI_LEAD_SIG..], LEAD_SIGNATURE);
    LittleEndian::write_u32(&mut buf[FSI_STRUC_SIG..], STRUC_SIGNATURE);
    LittleEndian::write_u32(&mut buf[FSI_FREE_COUNT..], free);
    LittleEndian::write_u32(&mut buf[FSI_NXT_FREE..], last);
    LittleEndian::write_u16(&mut buf[BS_55AA..], BOOT_SIGNATURE);
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
    fn write_then_view() {
        let mut buf = [0xFFu8; 512];
        write_fsinfo(&mut buf, 1000, 17);
        assert_eq!(&buf[..4], &hex!("52 52 61 41"));
        assert_eq!(&buf[484..496], &hex!("72 72 41 61 E8 03 00 00 11 00 00 00"));
        assert_eq!(&buf[508..], &hex!("00 00 55 AA"));
        let info = InfoSector::create_from_bytes(&buf).unwrap();
        assert_eq!(info.free_count(), 1000);
        assert_eq!(info.next_free(), 17);
    }

    #[test]
    fn rejects_bad_signatures() {
        let mut buf = [0u8; 512];
        write_fsinfo(&mut buf, 1, 2);
        buf[485] ^= 1;
        assert!(InfoSector::create_from_bytes(&buf).is_none());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
