//! Growing and freeing cluster chains.

use crate::blockdevice::{BlockDevice, BlockIdx, IoctlCommand};
use crate::fat::{
    inconsistent, table::Link, volume::FatVolume, FatType, ObjectId, STAT_CONTIGUOUS,
    STAT_FAT_CHAIN, STAT_FRAGMENTED,
};
use crate::{trace, Error};

impl FatVolume {
    /// Append a cluster to the chain ending at `clst`, or start a new chain
    /// when `clst` is 0. Returns `None` when the volume is full.
    ///
    /// If `clst` is already followed by another cluster, that cluster is
    /// returned and nothing changes.
    pub(crate) fn create_chain<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &mut ObjectId,
        clst: u32,
    ) -> Result<Option<u32>, Error<D::E>> {
        let mut scl = if clst == 0 {
            let hint = self.last_clust;
            if hint == 0 || hint >= self.n_fatent {
                1
            } else {
                hint
            }
        } else {
            match self.get_fat(dev, obj, clst)? {
                Link::Free => return Err(inconsistent("stretching a free cluster")),
                Link::Next(n) => return Ok(Some(n)),
                Link::End => clst,
            }
        };
        if self.free_clust == 0 {
            return Ok(None);
        }

        let ncl = if self.fs_type == FatType::ExFat {
            let ncl = match self.find_bitmap(dev, scl, 1)? {
                Some(n) => n,
                None => return Ok(None),
            };
            self.change_bitmap(dev, ncl, 1, true)?;
            if clst == 0 {
                obj.stat = STAT_CONTIGUOUS;
            } else if obj.stat == STAT_CONTIGUOUS && ncl != scl + 1 {
                obj.n_cont = scl - obj.sclust;
                obj.stat = STAT_FRAGMENTED;
            }
            if obj.stat != STAT_CONTIGUOUS {
                if ncl == clst + 1 {
                    obj.n_frag = if obj.n_frag != 0 { obj.n_frag + 1 } else { 2 };
                } else {
                    if obj.n_frag == 0 {
                        obj.n_frag = 1;
                        obj.frag_end = clst;
                    }
                    self.fill_last_frag(dev, obj, Link::Next(ncl))?;
                    obj.n_frag = 1;
                }
                obj.frag_end = ncl;
            }
            ncl
        } else {
            let mut ncl = 0;
            if scl == clst {
                ncl = scl + 1;
                if ncl >= self.n_fatent {
                    ncl = 2;
                }
                if self.get_fat(dev, obj, ncl)? != Link::Free {
                    let hint = self.last_clust;
                    if hint >= 2 && hint < self.n_fatent {
                        scl = hint;
                    }
                    ncl = 0;
                }
            }
            if ncl == 0 {
                ncl = scl;
                loop {
                    ncl += 1;
                    if ncl >= self.n_fatent {
                        ncl = 2;
                        if ncl > scl {
                            return Ok(None);
                        }
                    }
                    if self.get_fat(dev, obj, ncl)? == Link::Free {
                        break;
                    }
                    if ncl == scl {
                        return Ok(None);
                    }
                }
            }
            self.put_fat(dev, ncl, Link::End)?;
            if clst != 0 {
                self.put_fat(dev, clst, Link::Next(ncl))?;
            }
            ncl
        };

        trace!("allocated cluster {} after {}", ncl, clst);
        self.note_allocated(ncl);
        Ok(Some(ncl))
    }

    /// Free the chain starting at `clst`. When `pclst` is not 0 it is the
    /// cluster before `clst` and becomes the new end of the chain.
    pub(crate) fn remove_chain<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &mut ObjectId,
        clst: u32,
        pclst: u32,
    ) -> Result<(), Error<D::E>> {
        if clst < 2 || clst >= self.n_fatent {
            return Err(inconsistent("removing a chain out of range"));
        }
        let exfat = self.fs_type == FatType::ExFat;
        if pclst != 0 && (!exfat || obj.stat != STAT_CONTIGUOUS) {
            self.put_fat(dev, pclst, Link::End)?;
        }

        trace!("freeing chain from cluster {}", clst);
        let (mut scl, mut ecl) = (clst, clst);
        let mut clst = clst;
        loop {
            let nxt = match self.get_fat(dev, obj, clst)? {
                Link::Free => break,
                Link::Next(n) => n,
                Link::End => u32::MAX,
            };
            if !exfat {
                self.put_fat(dev, clst, Link::Free)?;
            }
            self.note_freed();
            if ecl + 1 == nxt {
                ecl = nxt;
            } else {
                if exfat {
                    self.change_bitmap(dev, scl, ecl - scl + 1, false)?;
                }
                self.trim_clusters(dev, scl, ecl);
                scl = nxt;
                ecl = nxt;
            }
            clst = nxt;
            if clst >= self.n_fatent {
                break;
            }
        }

        if exfat {
            if pclst == 0 {
                obj.stat = STAT_FAT_CHAIN;
                obj.n_frag = 0;
            } else {
                self.trim_pending_fragment(obj, pclst);
                if obj.stat == STAT_FAT_CHAIN {
                    let mut c = obj.sclust;
                    while c != pclst {
                        match self.get_fat(dev, obj, c)? {
                            Link::Free => return Err(inconsistent("free cluster inside a chain")),
                            Link::Next(n) if n == c + 1 => c += 1,
                            _ => break,
                        }
                    }
                    if c == pclst {
                        obj.stat = STAT_CONTIGUOUS;
                        obj.n_frag = 0;
                    }
                } else if obj.stat == STAT_FRAGMENTED
                    && pclst >= obj.sclust
                    && pclst <= obj.sclust + obj.n_cont
                {
                    obj.stat = STAT_CONTIGUOUS;
                    obj.n_frag = 0;
                }
            }
        }
        Ok(())
    }

    /// Cut the deferred trailing fragment down after a truncation ending
    /// at `pclst`.
    fn trim_pending_fragment(&self, obj: &mut ObjectId, pclst: u32) {
        if obj.n_frag == 0 {
            return;
        }
        let first = obj.frag_end + 1 - obj.n_frag;
        if (first..=obj.frag_end).contains(&pclst) {
            obj.n_frag = pclst - first + 1;
            obj.frag_end = pclst;
        } else {
            obj.n_frag = 0;
        }
    }

    /// Tell the device the clusters `scl..=ecl` are unused. A failure is
    /// not an error, the hint is only an optimisation.
    fn trim_clusters<D: BlockDevice>(&mut self, dev: &mut D, scl: u32, ecl: u32) {
        if let (Some(start), Some(last)) = (self.clust2sect(scl), self.clust2sect(ecl)) {
            let end = last + u64::from(self.csize) - 1;
            let _ = dev.ioctl(IoctlCommand::Trim {
                start: BlockIdx(start),
                end: BlockIdx(end),
            });
        }
    }

    /// Walk the chain from `clst` and count its clusters.
    #[cfg(test)]
    pub(crate) fn chain_length<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &ObjectId,
        clst: u32,
    ) -> Result<u32, Error<D::E>> {
        let mut n = 0;
        let mut c = clst;
        while c >= 2 && c < self.n_fatent {
            n += 1;
            if n > self.cluster_count() {
                return Err(inconsistent("cluster chain loops"));
            }
            c = match self.get_fat(dev, obj, c)? {
                Link::Next(next) => next,
                Link::End => break,
                Link::Free => return Err(inconsistent("free cluster inside a chain")),
            };
        }
        Ok(n)
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

    fn fat16_volume() -> (FatVolume, RamDisk<Vec<u8>>) {
        let mut vol = FatVolume::blank();
        vol.fs_type = FatType::Fat16;
        vol.fatbase = 1;
        vol.fsize = 1;
        vol.n_fats = 1;
        vol.database = 2;
        vol.n_fatent = 66;
        vol.free_clust = 64;
        (vol, RamDisk::new(vec![0u8; 512 * 80], 512))
    }

    /// Walk a chain, failing on a revisited cluster.
    fn walk(vol: &mut FatVolume, disk: &mut RamDisk<Vec<u8>>, obj: &ObjectId) -> Vec<u32> {
        let mut seen = Vec::new();
        let mut c = obj.sclust;
        while c != 0 {
            assert!(!seen.contains(&c), "cycle at cluster {}", c);
            seen.push(c);
            c = match vol.get_fat(disk, obj, c).unwrap() {
                Link::Next(n) => n,
                Link::End => 0,
                Link::Free => panic!("free cluster {} inside chain", c),
            };
        }
        seen
    }

    #[test]
    fn grows_and_shrinks_without_cycles() {
        let (mut vol, mut disk) = fat16_volume();
        let mut obj = ObjectId::default();
        let mut last = 0;
        let mut others = ObjectId::default();
        let mut others_last = 0;
        for round in 0..20 {
            let c = vol.create_chain(&mut disk, &mut obj, last).unwrap().unwrap();
            if last == 0 {
                obj.sclust = c;
            }
            last = c;
            // Interleave a second object so the first one fragments.
            if round % 3 == 0 {
                others_last = vol
                    .create_chain(&mut disk, &mut others, others_last)
                    .unwrap()
                    .unwrap();
            }
        }
        let chain = walk(&mut vol, &mut disk, &obj);
        assert_eq!(chain.len(), 20);
        assert!(chain.windows(2).any(|w| w[1] != w[0] + 1));
        assert_eq!(vol.free_clust, 64 - 20 - 7);

        // Cut after the fifth cluster.
        vol.remove_chain(&mut disk, &mut obj, chain[5], chain[4]).unwrap();
        assert_eq!(walk(&mut vol, &mut disk, &obj), chain[..5].to_vec());
        for c in &chain[5..] {
            assert_eq!(vol.get_fat(&mut disk, &obj, *c).unwrap(), Link::Free);
        }

        let first = obj.sclust;
        vol.remove_chain(&mut disk, &mut obj, first, 0).unwrap();
        for c in &chain {
            assert_eq!(vol.get_fat(&mut disk, &obj, *c).unwrap(), Link::Free);
        }
        assert!(disk.trimmed_sectors() >= 20);
    }

    #[test]
    fn stretching_returns_existing_link() {
        let (mut vol, mut disk) = fat16_volume();
        let mut obj = ObjectId::default();
        let a = vol.create_chain(&mut disk, &mut obj, 0).unwrap().unwrap();
        obj.sclust = a;
        let b = vol.create_chain(&mut disk, &mut obj, a).unwrap().unwrap();
        assert_eq!(b, a + 1);
        let free = vol.free_clust;
        assert_eq!(vol.create_chain(&mut disk, &mut obj, a).unwrap(), Some(b));
        assert_eq!(vol.free_clust, free);
        assert!(matches!(
            vol.create_chain(&mut disk, &mut obj, 40),
            Err(Error::Inconsistent(_))
        ));
    }

    #[test]
    fn full_volume_reports_none() {
        let (mut vol, mut disk) = fat16_volume();
        let mut obj = ObjectId::default();
        let mut last = 0;
        for _ in 0..64 {
            last = vol.create_chain(&mut disk, &mut obj, last).unwrap().unwrap();
        }
        assert_eq!(vol.free_clust, 0);
        assert_eq!(vol.create_chain(&mut disk, &mut obj, last).unwrap(), None);
        // Even without the cached count the scan finds nothing.
        vol.free_clust = crate::fat::volume::FREE_UNKNOWN;
        assert_eq!(vol.create_chain(&mut disk, &mut obj, last).unwrap(), None);
        assert_eq!(vol.create_chain(&mut disk, &mut obj, 0).unwrap(), None);
    }

    #[test]
    fn exfat_chain_status_transitions() {
        let mut vol = FatVolume::blank();
        vol.fs_type = FatType::ExFat;
        vol.fatbase = 1;
        vol.fsize = 1;
        vol.bitbase = 2;
        vol.database = 3;
        vol.n_fatent = 42;
        vol.free_clust = 40;
        let mut disk = RamDisk::new(vec![0u8; 512 * 48], 512);

        let mut obj = ObjectId::default();
        let a = vol.create_chain(&mut disk, &mut obj, 0).unwrap().unwrap();
        obj.sclust = a;
        obj.objsize = 512;
        assert_eq!(obj.stat, STAT_CONTIGUOUS);
        let b = vol.create_chain(&mut disk, &mut obj, a).unwrap().unwrap();
        obj.objsize = 1024;
        assert_eq!(b, a + 1);
        assert_eq!(obj.stat, STAT_CONTIGUOUS);

        // Occupy the next cluster so the chain has to jump.
        vol.change_bitmap(&mut disk, b + 1, 1, true).unwrap();
        vol.last_clust = b + 1;
        let c = vol.create_chain(&mut disk, &mut obj, b).unwrap().unwrap();
        obj.objsize = 1536;
        assert_eq!(c, b + 2);
        assert_eq!(obj.stat, STAT_FRAGMENTED);
        assert_eq!(obj.n_cont, 1);
        assert_eq!(obj.n_frag, 1);
        assert_eq!(obj.frag_end, c);
        assert_eq!(vol.get_fat(&mut disk, &obj, a).unwrap(), Link::Next(b));
        assert_eq!(vol.get_fat(&mut disk, &obj, b).unwrap(), Link::Next(c));
        assert_eq!(vol.get_fat(&mut disk, &obj, c).unwrap(), Link::End);

        // Dropping the fragment makes the chain contiguous again.
        vol.remove_chain(&mut disk, &mut obj, c, b).unwrap();
        assert_eq!(obj.stat, STAT_CONTIGUOUS);
        assert_eq!(obj.n_frag, 0);
        obj.objsize = 1024;
        vol.remove_chain(&mut disk, &mut obj, a, 0).unwrap();
        assert_eq!(obj.stat, STAT_FAT_CHAIN);
        assert_eq!(vol.count_free_bits(&mut disk).unwrap(), 39);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
