//! exFAT directory entry sets.
//!
//! A file or directory is described by a block of 3 to 19 consecutive
//! entries: one File entry (0x85), one Stream Extension entry (0xC0) and
//! one or more File Name entries (0xC1), protected by a 16-bit checksum in
//! the File entry. The whole block is handled as a unit in
//! `FatVolume::dirbuf`.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::BlockDevice;
use crate::fat::{
    dir::DirCursor,
    inconsistent,
    lfn::{lfn_len, wtoupper, LfnBuf},
    volume::FatVolume,
    ObjectId, DIR_ENTRY_SIZE,
};
use crate::filesystem::attributes::Attributes;
use crate::{Error, MAX_LFN};

pub(crate) const ET_BITMAP: u8 = 0x81;
pub(crate) const ET_UPCASE: u8 = 0x82;
pub(crate) const ET_VLABEL: u8 = 0x83;
pub(crate) const ET_FILEDIR: u8 = 0x85;
pub(crate) const ET_STREAM: u8 = 0xC0;
pub(crate) const ET_FILENAME: u8 = 0xC1;

/// Set on every entry type that is in use.
pub(crate) const ET_IN_USE: u8 = 0x80;

pub(crate) const XDIR_TYPE: usize = 0;
pub(crate) const XDIR_NUM_LABEL: usize = 1;
pub(crate) const XDIR_LABEL: usize = 2;
pub(crate) const XDIR_NUM_SEC: usize = 1;
pub(crate) const XDIR_SET_SUM: usize = 2;
pub(crate) const XDIR_ATTR: usize = 4;
/// Up-case table checksum, in the up-case entry
pub(crate) const XDIR_CASE_SUM: usize = 4;
pub(crate) const XDIR_CRT_TIME: usize = 8;
pub(crate) const XDIR_MOD_TIME: usize = 12;
pub(crate) const XDIR_ACC_TIME: usize = 16;
pub(crate) const XDIR_MOD_TIME10: usize = 21;
pub(crate) const XDIR_GEN_FLAGS: usize = 33;
pub(crate) const XDIR_NUM_NAME: usize = 35;
pub(crate) const XDIR_NAME_HASH: usize = 36;
pub(crate) const XDIR_VALID_FILE_SIZE: usize = 40;
pub(crate) const XDIR_FST_CLUS: usize = 52;
pub(crate) const XDIR_FILE_SIZE: usize = 56;
/// First cluster of the bitmap and up-case system entries
pub(crate) const XDIR_SYS_FST_CLUS: usize = 20;
/// Data length of the bitmap and up-case system entries
pub(crate) const XDIR_SYS_DATA_LEN: usize = 24;

/// GeneralSecondaryFlags: allocation possible
pub(crate) const GEN_FLAG_ALLOC: u8 = 0x01;
/// GeneralSecondaryFlags: the FAT chain is not used
pub(crate) const GEN_FLAG_NO_FAT_CHAIN: u8 = 0x02;

/// Name units per File Name entry.
pub(crate) const XDIR_NAME_UNITS: usize = 15;

/// Attribute bits defined for exFAT.
pub(crate) const XATTR_MASK: u8 = 0x37;

/// Bytes in an entry block for a name of `nc` units.
pub(crate) const fn maxdirb(nc: usize) -> usize {
    (nc + 44) / XDIR_NAME_UNITS * DIR_ENTRY_SIZE
}

/// Bytes needed for the largest entry block.
pub(crate) const XDIR_BUF_SIZE: usize = maxdirb(MAX_LFN);

fn rotate_add16(sum: u16, b: u8) -> u16 {
    (if sum & 1 != 0 { 0x8000u16 } else { 0 })
        .wrapping_add(sum >> 1)
        .wrapping_add(u16::from(b))
}

/// Checksum of an entry block, skipping the checksum field itself.
pub(crate) fn xdir_sum(dirb: &[u8]) -> u16 {
    let size = (usize::from(dirb[XDIR_NUM_SEC]) + 1) * DIR_ENTRY_SIZE;
    dirb[..size]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != XDIR_SET_SUM && *i != XDIR_SET_SUM + 1)
        .fold(0u16, |sum, (_, &b)| rotate_add16(sum, b))
}

/// Hash of a name, computed on its upper-case form.
pub(crate) fn xname_sum(name: &[u16]) -> u16 {
    name.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| wtoupper(c))
        .fold(0u16, |sum, c| {
            let sum = rotate_add16(sum, c as u8);
            rotate_add16(sum, (c >> 8) as u8)
        })
}

/// Running 32-bit checksum used for the boot region and up-case table.
pub(crate) fn xsum32(dat: u8, sum: u32) -> u32 {
    (if sum & 1 != 0 { 0x8000_0000u32 } else { 0 })
        .wrapping_add(sum >> 1)
        .wrapping_add(u32::from(dat))
}

/// Validate a loaded entry block: entry order, counts and checksum.
pub(crate) fn check_xdir_block(dirb: &[u8]) -> Result<usize, &'static str> {
    if dirb[XDIR_TYPE] != ET_FILEDIR {
        return Err("entry block does not start with a file entry");
    }
    let size = (usize::from(dirb[XDIR_NUM_SEC]) + 1) * DIR_ENTRY_SIZE;
    if !(3 * DIR_ENTRY_SIZE..=19 * DIR_ENTRY_SIZE).contains(&size) || size > dirb.len() {
        return Err("bad secondary count");
    }
    if dirb[DIR_ENTRY_SIZE + XDIR_TYPE] != ET_STREAM {
        return Err("missing stream extension entry");
    }
    if maxdirb(usize::from(dirb[XDIR_NUM_NAME])) > size {
        return Err("name longer than the entry block");
    }
    if dirb[2 * DIR_ENTRY_SIZE..size]
        .chunks(DIR_ENTRY_SIZE)
        .any(|e| e[XDIR_TYPE] != ET_FILENAME)
    {
        return Err("missing file name entry");
    }
    if xdir_sum(dirb) != LittleEndian::read_u16(&dirb[XDIR_SET_SUM..]) {
        return Err("entry block checksum mismatch");
    }
    Ok(size)
}

/// Build a fresh entry block for `lfn` in `dirb`. Times, attributes and
/// allocation are left zero.
pub(crate) fn create_xdir(dirb: &mut [u8], lfn: &LfnBuf) {
    dirb[..2 * DIR_ENTRY_SIZE].fill(0);
    dirb[XDIR_TYPE] = ET_FILEDIR;
    dirb[DIR_ENTRY_SIZE + XDIR_TYPE] = ET_STREAM;

    let len = lfn_len(lfn);
    let mut i = 2 * DIR_ENTRY_SIZE;
    let mut nlen = 0;
    let mut nc1 = 0u8;
    let mut wc = 1u16;
    loop {
        dirb[i] = ET_FILENAME;
        dirb[i + 1] = 0;
        i += 2;
        while i % DIR_ENTRY_SIZE != 0 {
            if wc != 0 {
                wc = if nlen < len { lfn[nlen] } else { 0 };
                if wc != 0 {
                    nlen += 1;
                }
            }
            LittleEndian::write_u16(&mut dirb[i..], wc);
            i += 2;
        }
        nc1 += 1;
        if nlen >= len {
            break;
        }
    }
    dirb[XDIR_NUM_NAME] = nlen as u8;
    dirb[XDIR_NUM_SEC] = 1 + nc1;
    LittleEndian::write_u16(&mut dirb[XDIR_NAME_HASH..], xname_sum(&lfn[..len]));
}

/// Copy the name out of a loaded entry block.
pub(crate) fn xdir_name(dirb: &[u8], out: &mut LfnBuf) -> usize {
    let nc = usize::from(dirb[XDIR_NUM_NAME]).min(MAX_LFN);
    let mut si = 2 * DIR_ENTRY_SIZE + 2;
    for slot in out.iter_mut().take(nc) {
        if si % DIR_ENTRY_SIZE == 0 {
            si += 2;
        }
        *slot = LittleEndian::read_u16(&dirb[si..]);
        si += 2;
    }
    out[nc] = 0;
    nc
}

impl FatVolume {
    /// Read the entry block starting at the cursor into `dirbuf`. The
    /// cursor is left on the last entry of the block.
    pub(crate) fn load_xdir<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
    ) -> Result<(), Error<D::E>> {
        self.move_window(dev, dp.sect)?;
        let first = self.entry(dp);
        if first[XDIR_TYPE] != ET_FILEDIR {
            return Err(inconsistent("entry block does not start with a file entry"));
        }
        self.dirbuf[..DIR_ENTRY_SIZE].copy_from_slice(&first);
        let size = (usize::from(first[XDIR_NUM_SEC]) + 1) * DIR_ENTRY_SIZE;
        if !(3 * DIR_ENTRY_SIZE..=XDIR_BUF_SIZE).contains(&size) {
            return Err(inconsistent("bad secondary count"));
        }
        let mut i = DIR_ENTRY_SIZE;
        while i < size {
            match self.dir_next(dev, dp, false) {
                Ok(()) => {}
                Err(Error::NotFound) => return Err(inconsistent("entry block truncated")),
                Err(e) => return Err(e),
            }
            self.move_window(dev, dp.sect)?;
            let e = self.entry(dp);
            self.dirbuf[i..i + DIR_ENTRY_SIZE].copy_from_slice(&e);
            i += DIR_ENTRY_SIZE;
        }
        check_xdir_block(&self.dirbuf[..size]).map_err(|r| inconsistent::<D::E>(r))?;
        Ok(())
    }

    /// Write `dirbuf` back to where the cursor's block starts, with a
    /// fresh checksum.
    pub(crate) fn store_xdir<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
    ) -> Result<(), Error<D::E>> {
        let sum = xdir_sum(&self.dirbuf);
        LittleEndian::write_u16(&mut self.dirbuf[XDIR_SET_SUM..], sum);
        let nent = usize::from(self.dirbuf[XDIR_NUM_SEC]) + 1;
        match self.write_xdir_entries(dev, dp, nent) {
            Err(Error::NotFound) => Err(inconsistent("entry block runs past the directory")),
            other => other,
        }
    }

    fn write_xdir_entries<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        nent: usize,
    ) -> Result<(), Error<D::E>> {
        self.dir_sdi(dev, dp, dp.blk_ofs)?;
        for k in 0..nent {
            if k > 0 {
                self.dir_next(dev, dp, false)?;
            }
            self.move_window(dev, dp.sect)?;
            let ofs = dp.dptr as usize % usize::from(self.ss);
            self.win.buf[ofs..ofs + DIR_ENTRY_SIZE]
                .copy_from_slice(&self.dirbuf[k * DIR_ENTRY_SIZE..(k + 1) * DIR_ENTRY_SIZE]);
            self.win.dirty = true;
        }
        Ok(())
    }

    /// Position `dp` on the entry block of `obj` inside its parent and
    /// load it.
    pub(crate) fn load_obj_xdir<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        obj: &ObjectId,
    ) -> Result<(), Error<D::E>> {
        dp.obj = ObjectId {
            attr: Attributes::DIRECTORY,
            sclust: obj.c_scl,
            stat: obj.c_stat,
            objsize: u64::from(obj.c_size),
            ..ObjectId::default()
        };
        dp.blk_ofs = obj.c_ofs;
        self.dir_sdi(dev, dp, dp.blk_ofs)?;
        self.load_xdir(dev, dp)
    }

    /// Allocation state of the object described by `dirbuf`.
    pub(crate) fn init_alloc_info(&self, obj: &mut ObjectId) {
        obj.sclust = LittleEndian::read_u32(&self.dirbuf[XDIR_FST_CLUS..]);
        obj.objsize = LittleEndian::read_u64(&self.dirbuf[XDIR_FILE_SIZE..]);
        obj.stat = self.dirbuf[XDIR_GEN_FLAGS] & GEN_FLAG_NO_FAT_CHAIN;
        obj.n_frag = 0;
        obj.n_cont = 0;
        obj.frag_end = 0;
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
