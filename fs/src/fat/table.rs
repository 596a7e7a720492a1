//! File Allocation Table entry access.
//!
//! FAT12 packs two entries into three bytes, FAT16 and FAT32 store plain
//! little-endian words. exFAT only consults its FAT for chains that are not
//! contiguous, the rest is derived from the object's allocation state.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::BlockDevice;
use crate::fat::{
    inconsistent, volume::FatVolume, FatType, ObjectId, STAT_CONTIGUOUS, STAT_FAT_CHAIN,
    STAT_FRAGMENTED,
};
use crate::Error;

/// What a FAT entry says about the cluster after this one.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Link {
    /// The cluster is not allocated.
    Free,
    /// The chain continues at this cluster.
    Next(u32),
    /// The cluster is the last one of its chain.
    End,
}

impl Link {
    /// Classify a raw entry value. `1` never appears in a sane table.
    fn from_raw(raw: u32, n_fatent: u32) -> Option<Link> {
        match raw {
            0 => Some(Link::Free),
            1 => None,
            n if n >= n_fatent => Some(Link::End),
            n => Some(Link::Next(n)),
        }
    }
}

/// Byte offset of a FAT12 entry inside the table.
pub(crate) fn fat12_offset(clst: u32) -> u32 {
    clst + clst / 2
}

/// Extract a FAT12 entry from the two bytes it straddles.
pub(crate) fn unpack12(first: u8, second: u8, clst: u32) -> u16 {
    let word = u16::from(first) | (u16::from(second) << 8);
    if clst & 1 == 1 {
        word >> 4
    } else {
        word & 0x0FFF
    }
}

/// New value for the first byte of a FAT12 entry.
pub(crate) fn pack12_first(old: u8, clst: u32, val: u16) -> u8 {
    if clst & 1 == 1 {
        (old & 0x0F) | ((val << 4) as u8)
    } else {
        val as u8
    }
}

/// New value for the second byte of a FAT12 entry.
pub(crate) fn pack12_second(old: u8, clst: u32, val: u16) -> u8 {
    if clst & 1 == 1 {
        (val >> 4) as u8
    } else {
        (old & 0xF0) | ((val >> 8) as u8 & 0x0F)
    }
}

/// Read entry `clst` from an in-memory FAT12 table.
#[cfg(test)]
fn read_fat12(table: &[u8], clst: u32) -> u16 {
    let bc = fat12_offset(clst) as usize;
    unpack12(table[bc], table[bc + 1], clst)
}

/// Store entry `clst` into an in-memory FAT12 table.
#[cfg(test)]
fn write_fat12(table: &mut [u8], clst: u32, val: u16) {
    let bc = fat12_offset(clst) as usize;
    table[bc] = pack12_first(table[bc], clst, val);
    table[bc + 1] = pack12_second(table[bc + 1], clst, val);
}

impl FatVolume {
    /// Read the link stored for `clst`. `obj` is the chain owner; exFAT
    /// needs it to answer for chains it never wrote to the FAT.
    pub(crate) fn get_fat<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &ObjectId,
        clst: u32,
    ) -> Result<Link, Error<D::E>> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(inconsistent("FAT read out of range"));
        }
        let ss = u32::from(self.ss);
        let raw = match self.fs_type {
            FatType::Fat12 => {
                let bc = fat12_offset(clst);
                let sect = self.fatbase + u64::from(bc / ss);
                self.move_window(dev, sect)?;
                let first = self.win()[(bc % ss) as usize];
                let bc = bc + 1;
                let sect = self.fatbase + u64::from(bc / ss);
                self.move_window(dev, sect)?;
                let second = self.win()[(bc % ss) as usize];
                u32::from(unpack12(first, second, clst))
            }
            FatType::Fat16 => {
                let sect = self.fatbase + u64::from(clst / (ss / 2));
                self.move_window(dev, sect)?;
                let ofs = (clst * 2 % ss) as usize;
                u32::from(LittleEndian::read_u16(&self.win()[ofs..]))
            }
            FatType::Fat32 => self.read_fat32_raw(dev, clst)? & 0x0FFF_FFFF,
            FatType::ExFat => return self.get_exfat_link(dev, obj, clst),
        };
        Link::from_raw(raw, self.n_fatent).ok_or_else(|| inconsistent("FAT entry is 1"))
    }

    fn read_fat32_raw<D: BlockDevice>(&mut self, dev: &mut D, clst: u32) -> Result<u32, Error<D::E>> {
        let ss = u32::from(self.ss);
        let sect = self.fatbase + u64::from(clst / (ss / 4));
        self.move_window(dev, sect)?;
        let ofs = (clst * 4 % ss) as usize;
        Ok(LittleEndian::read_u32(&self.win()[ofs..]))
    }

    fn get_exfat_link<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &ObjectId,
        clst: u32,
    ) -> Result<Link, Error<D::E>> {
        if (obj.objsize != 0 && obj.sclust != 0) || obj.stat == STAT_FAT_CHAIN {
            let cofs = clst.wrapping_sub(obj.sclust);
            if obj.stat == STAT_CONTIGUOUS && obj.objsize != 0 {
                let last = ((obj.objsize - 1) / u64::from(self.cluster_bytes())) as u32;
                if cofs <= last {
                    return Ok(if cofs == last {
                        Link::End
                    } else {
                        Link::Next(clst + 1)
                    });
                }
            }
            if obj.stat == STAT_FRAGMENTED && cofs < obj.n_cont {
                return Ok(Link::Next(clst + 1));
            }
            if obj.stat != STAT_CONTIGUOUS {
                // The trailing fragment is not on the FAT yet.
                if obj.n_frag != 0 {
                    let first = obj.frag_end + 1 - obj.n_frag;
                    if (first..=obj.frag_end).contains(&clst) {
                        return Ok(if clst == obj.frag_end {
                            Link::End
                        } else {
                            Link::Next(clst + 1)
                        });
                    }
                }
                let raw = self.read_fat32_raw(dev, clst)? & 0x7FFF_FFFF;
                return Link::from_raw(raw, self.n_fatent)
                    .ok_or_else(|| inconsistent("FAT entry is 1"));
            }
        }
        Err(inconsistent("cluster outside of object"))
    }

    /// Store a link for `clst`. FAT32 keeps the four reserved top bits of
    /// the entry.
    pub(crate) fn put_fat<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        clst: u32,
        link: Link,
    ) -> Result<(), Error<D::E>> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(inconsistent("FAT write out of range"));
        }
        let val = match link {
            Link::Free => 0,
            Link::Next(n) => n,
            Link::End => 0xFFFF_FFFF,
        };
        let ss = u32::from(self.ss);
        match self.fs_type {
            FatType::Fat12 => {
                let val = (val & 0x0FFF) as u16;
                let bc = fat12_offset(clst);
                let sect = self.fatbase + u64::from(bc / ss);
                self.move_window(dev, sect)?;
                let p = (bc % ss) as usize;
                let win = self.win_mut();
                win[p] = pack12_first(win[p], clst, val);
                let bc = bc + 1;
                let sect = self.fatbase + u64::from(bc / ss);
                self.move_window(dev, sect)?;
                let p = (bc % ss) as usize;
                let win = self.win_mut();
                win[p] = pack12_second(win[p], clst, val);
            }
            FatType::Fat16 => {
                let sect = self.fatbase + u64::from(clst / (ss / 2));
                self.move_window(dev, sect)?;
                let ofs = (clst * 2 % ss) as usize;
                LittleEndian::write_u16(&mut self.win_mut()[ofs..], val as u16);
            }
            FatType::Fat32 | FatType::ExFat => {
                let sect = self.fatbase + u64::from(clst / (ss / 4));
                self.move_window(dev, sect)?;
                let ofs = (clst * 4 % ss) as usize;
                let val = if self.fs_type == FatType::Fat32 {
                    (val & 0x0FFF_FFFF) | (LittleEndian::read_u32(&self.win()[ofs..]) & 0xF000_0000)
                } else {
                    val
                };
                LittleEndian::write_u32(&mut self.win_mut()[ofs..], val);
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


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
