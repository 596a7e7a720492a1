//! exFAT allocation bitmap and the deferred FAT links of fragmented chains.

use crate::blockdevice::BlockDevice;
use crate::fat::{
    inconsistent, table::Link, volume::FatVolume, ObjectId, STAT_FAT_CHAIN, STAT_FRAGMENTED,
};
use crate::Error;

impl FatVolume {
    /// Look for `ncl` free clusters in a row, starting at `clst` and
    /// wrapping around the end of the volume once.
    pub(crate) fn find_bitmap<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        clst: u32,
        ncl: u32,
    ) -> Result<Option<u32>, Error<D::E>> {
        let total = self.cluster_count();
        let ss = u32::from(self.ss);
        let mut start = clst.wrapping_sub(2);
        if start >= total {
            start = 0;
        }
        let mut scl = start;
        let mut val = start;
        let mut ctr = 0;
        loop {
            let sect = self.bitbase + u64::from(val / 8 / ss);
            self.move_window(dev, sect)?;
            let mut i = val / 8 % ss;
            let mut bm: u8 = 1 << (val % 8);
            loop {
                loop {
                    let bv = self.win()[i as usize] & bm;
                    bm <<= 1;
                    val += 1;
                    let wrapped = val >= total;
                    if wrapped {
                        val = 0;
                        bm = 0;
                        i = ss;
                    }
                    if bv == 0 {
                        ctr += 1;
                        if ctr == ncl {
                            return Ok(Some(scl + 2));
                        }
                    } else {
                        scl = val;
                        ctr = 0;
                    }
                    // A run never continues across the end of the volume.
                    if wrapped {
                        scl = 0;
                        ctr = 0;
                    }
                    if val == start {
                        return Ok(None);
                    }
                    if bm == 0 {
                        break;
                    }
                }
                bm = 1;
                i += 1;
                if i >= ss {
                    break;
                }
            }
        }
    }

    /// Set or clear `ncl` bits starting at cluster `clst`. Every bit must
    /// currently hold the opposite value.
    pub(crate) fn change_bitmap<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        clst: u32,
        ncl: u32,
        set: bool,
    ) -> Result<(), Error<D::E>> {
        if ncl == 0 {
            return Ok(());
        }
        let ss = u32::from(self.ss);
        let bit = clst.wrapping_sub(2);
        let mut sect = self.bitbase + u64::from(bit / 8 / ss);
        let mut i = (bit / 8 % ss) as usize;
        let mut bm: u8 = 1 << (bit % 8);
        let mut left = ncl;
        loop {
            self.move_window(dev, sect)?;
            sect += 1;
            loop {
                loop {
                    if (self.win()[i] & bm != 0) == set {
                        return Err(inconsistent("allocation bitmap out of step"));
                    }
                    self.win_mut()[i] ^= bm;
                    left -= 1;
                    if left == 0 {
                        return Ok(());
                    }
                    bm <<= 1;
                    if bm == 0 {
                        break;
                    }
                }
                bm = 1;
                i += 1;
                if i >= ss as usize {
                    break;
                }
            }
            i = 0;
        }
    }

    /// Count the clear bits of the allocation bitmap.
    pub(crate) fn count_free_bits<D: BlockDevice>(&mut self, dev: &mut D) -> Result<u32, Error<D::E>> {
        let mut left = self.cluster_count();
        let mut sect = self.bitbase;
        let mut free = 0;
        while left > 0 {
            self.move_window(dev, sect)?;
            sect += 1;
            for &byte in self.win() {
                let bits = left.min(8);
                free += bits - (byte & (0xFFu16 >> (8 - bits)) as u8).count_ones();
                left -= bits;
                if left == 0 {
                    break;
                }
            }
        }
        Ok(free)
    }

    /// Write the links of the contiguous head of a chain that fragmented
    /// during this mount. Afterwards the FAT describes the whole head.
    pub(crate) fn fill_first_frag<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &mut ObjectId,
    ) -> Result<(), Error<D::E>> {
        if obj.stat == STAT_FRAGMENTED {
            let mut cl = obj.sclust;
            for _ in 0..obj.n_cont {
                self.put_fat(dev, cl, Link::Next(cl + 1))?;
                cl += 1;
            }
            obj.stat = STAT_FAT_CHAIN;
        }
        Ok(())
    }

    /// Write the links of the trailing fragment that ends at
    /// `obj.frag_end`. Its last cluster gets `term`.
    pub(crate) fn fill_last_frag<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &mut ObjectId,
        term: Link,
    ) -> Result<(), Error<D::E>> {
        let lcl = obj.frag_end;
        while obj.n_frag > 0 {
            let cl = lcl - obj.n_frag + 1;
            let link = if obj.n_frag > 1 { Link::Next(cl + 1) } else { term };
            self.put_fat(dev, cl, link)?;
            obj.n_frag -= 1;
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
