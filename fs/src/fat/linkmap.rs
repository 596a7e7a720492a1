//! Cluster link maps for fast seeking.
//!
//! A link map lists the fragments of a file's cluster chain, so the
//! cluster holding any offset can be found without reading the FAT. While
//! a file carries a map it cannot grow past its last cluster.

use crate::blockdevice::BlockDevice;
use crate::fat::{inconsistent, table::Link, volume::FatVolume};
use crate::filesystem::files::File;
use crate::{trace, Error, MAX_LINK_FRAGMENTS};

/// A run of consecutive clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    /// First cluster of the run
    pub start: u32,
    /// Number of clusters in the run
    pub len: u32,
}

/// The fragments of one file's chain, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LinkMap {
    pub frags: heapless::Vec<Fragment, MAX_LINK_FRAGMENTS>,
}

impl LinkMap {
    /// The cluster holding byte `ofs`, given the cluster size in bytes.
    /// `None` past the last mapped cluster.
    pub(crate) fn cluster_at(&self, ofs: u64, cluster_bytes: u32) -> Option<u32> {
        let mut cl = ofs / u64::from(cluster_bytes);
        for frag in &self.frags {
            let len = u64::from(frag.len);
            if cl < len {
                return Some(frag.start + cl as u32);
            }
            cl -= len;
        }
        None
    }

    /// Total clusters covered.
    pub(crate) fn clusters(&self) -> u32 {
        self.frags.iter().map(|f| f.len).sum()
    }
}

impl FatVolume {
    /// Walk the chain of `fp` and return its map. `Error::TooFragmented`
    /// when the chain has more fragments than a map can hold.
    pub(crate) fn build_link_map<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        fp: &File,
    ) -> Result<LinkMap, Error<D::E>> {
        let mut map = LinkMap::default();
        let mut cl = fp.obj.sclust;
        if cl == 0 {
            return Ok(map);
        }
        let limit = self.n_fatent;
        let mut walked = 0u32;
        loop {
            let start = cl;
            let mut len = 0u32;
            let next = loop {
                len += 1;
                walked += 1;
                if walked > limit {
                    return Err(inconsistent("cluster chain loops"));
                }
                match self.get_fat(dev, &fp.obj, cl)? {
                    Link::Next(n) if n == cl + 1 => cl = n,
                    Link::Next(n) => break Some(n),
                    Link::End => break None,
                    Link::Free => return Err(inconsistent("free cluster inside a file")),
                }
            };
            if map.frags.push(Fragment { start, len }).is_err() {
                trace!("chain from {} has too many fragments for a map", fp.obj.sclust);
                return Err(Error::TooFragmented);
            }
            match next {
                Some(n) => cl = n,
                None => return Ok(map),
            }
        }
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
