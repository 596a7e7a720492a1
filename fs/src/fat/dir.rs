//! Walking, searching and growing directories.
//!
//! A [`DirCursor`] points at one 32-byte entry of a directory: either the
//! fixed root table of FAT12/FAT16 or a cluster chain. All entry access goes
//! through the sector window; the cursor only remembers where it is.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::{BlockDevice, BlockIdx};
use crate::fat::{
    inconsistent,
    lfn::{
        fragments_for, lfn_eq, lfn_is_legal, lfn_len, put_lfn, LfnAssembler, LAST_LONG_ENTRY,
    },
    ondiskdirentry::{init_sfn_entry, OnDiskDirEntry, ATTR_MASK, DELETED},
    sfn::{gen_numname, ObjName, NS_BODY, NS_DOT, NS_EXT, NS_NOLFN, NS_NONAME},
    table::Link,
    volume::FatVolume,
    xdir::{
        create_xdir, xdir_name, xname_sum, ET_FILEDIR, ET_IN_USE, ET_VLABEL, GEN_FLAG_ALLOC,
        XATTR_MASK, XDIR_ATTR, XDIR_FILE_SIZE, XDIR_GEN_FLAGS, XDIR_MOD_TIME, XDIR_NAME_HASH,
        XDIR_NAME_UNITS, XDIR_NUM_NAME, XDIR_VALID_FILE_SIZE,
    },
    FatType, ObjectId, DIR_ENTRY_SIZE,
};
use crate::filesystem::{
    attributes::Attributes,
    directory::{inode_of, FileInfo},
    timestamp::Timestamp,
};
use crate::{trace, warn, Error, NUMERIC_TAIL_RETRIES};

/// `DirCursor::blk_ofs` when the entry has no long name.
pub(crate) const BLK_NONE: u32 = u32::MAX;

/// Position inside a directory plus the name being looked for.
#[derive(Clone)]
pub(crate) struct DirCursor {
    /// The directory being walked
    pub obj: ObjectId,
    /// Byte offset of the current entry
    pub dptr: u32,
    /// Current cluster, 0 for the fixed root
    pub clust: u32,
    /// Sector holding the current entry, 0 at the end of the table
    pub sect: u64,
    /// Offset of the first entry belonging to the current object (long
    /// name fragments or exFAT block)
    pub blk_ofs: u32,
    pub name: ObjName,
    /// exFAT: a cluster was added to the directory
    pub stretched: bool,
}

impl DirCursor {
    pub(crate) fn new(obj: ObjectId) -> DirCursor {
        DirCursor {
            obj,
            dptr: 0,
            clust: 0,
            sect: 0,
            blk_ofs: BLK_NONE,
            name: ObjName::none(),
            stretched: false,
        }
    }

    /// Index of the current entry, as used in lock keys.
    pub(crate) fn index(&self) -> u32 {
        self.dptr / DIR_ENTRY_SIZE as u32
    }
}

impl FatVolume {
    fn entry_offset(&self, dp: &DirCursor) -> usize {
        dp.dptr as usize % usize::from(self.ss)
    }

    /// Copy of the entry under the cursor. The window must hold `dp.sect`.
    pub(crate) fn entry(&self, dp: &DirCursor) -> [u8; DIR_ENTRY_SIZE] {
        let ofs = self.entry_offset(dp);
        let mut e = [0u8; DIR_ENTRY_SIZE];
        e.copy_from_slice(&self.win.buf[ofs..ofs + DIR_ENTRY_SIZE]);
        e
    }

    /// The entry under the cursor, for writing. Marks the window dirty.
    pub(crate) fn entry_mut(&mut self, dp: &DirCursor) -> &mut [u8] {
        let ofs = self.entry_offset(dp);
        self.win.dirty = true;
        &mut self.win.buf[ofs..ofs + DIR_ENTRY_SIZE]
    }

    /// Start cluster stored in a short entry.
    pub(crate) fn ld_clust(&self, entry: &[u8]) -> u32 {
        OnDiskDirEntry::new(entry).first_cluster(self.fs_type)
    }

    /// Zero every sector of `clst`. The window ends up holding the first
    /// of them.
    pub(crate) fn dir_clear<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        clst: u32,
    ) -> Result<(), Error<D::E>> {
        self.sync_window(dev)?;
        let sect = self
            .clust2sect(clst)
            .ok_or_else(|| inconsistent("clearing a cluster out of range"))?;
        let ss = usize::from(self.ss);
        self.win.buf.fill(0);
        self.win.sect = sect;
        self.win.dirty = false;
        for n in 0..u64::from(self.csize) {
            if let Err(e) = dev.write(&self.win.buf[..ss], BlockIdx(sect + n), 1) {
                warn!("clearing directory sector {} failed", sect + n);
                self.win.invalidate();
                return Err(Error::DeviceError(e));
            }
        }
        Ok(())
    }

    /// Point the cursor at byte offset `ofs` of its directory.
    pub(crate) fn dir_sdi<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        ofs: u32,
    ) -> Result<(), Error<D::E>> {
        if ofs >= self.max_dir() || ofs % DIR_ENTRY_SIZE as u32 != 0 {
            return Err(inconsistent("directory offset out of range"));
        }
        dp.dptr = ofs;
        let mut clst = dp.obj.sclust;
        if clst == 0 && self.fs_type.has_dynamic_root() {
            clst = self.dirbase as u32;
            if self.fs_type == FatType::ExFat {
                dp.obj.stat = 0;
            }
        }
        let mut idx = ofs;
        if clst == 0 {
            if ofs / DIR_ENTRY_SIZE as u32 >= u32::from(self.n_rootdir) {
                return Err(inconsistent("root directory index out of range"));
            }
            dp.sect = self.dirbase;
        } else {
            let csz = self.cluster_bytes();
            while idx >= csz {
                clst = match self.get_fat(dev, &dp.obj, clst)? {
                    Link::Next(n) => n,
                    _ => return Err(inconsistent("directory ends before the offset")),
                };
                idx -= csz;
            }
            dp.sect = self
                .clust2sect(clst)
                .ok_or_else(|| inconsistent("directory cluster out of range"))?;
        }
        dp.clust = clst;
        dp.sect += u64::from(idx / u32::from(self.ss));
        Ok(())
    }

    /// Step to the next entry. At the end of the chain the directory is
    /// grown by one zeroed cluster when `stretch` is set; otherwise, and at
    /// the end of a fixed root, `NotFound` is returned.
    pub(crate) fn dir_next<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        stretch: bool,
    ) -> Result<(), Error<D::E>> {
        let ofs = dp.dptr + DIR_ENTRY_SIZE as u32;
        if ofs >= self.max_dir() {
            dp.sect = 0;
        }
        if dp.sect == 0 {
            return Err(Error::NotFound);
        }
        let ss = u32::from(self.ss);
        if ofs % ss == 0 {
            dp.sect += 1;
            if dp.clust == 0 {
                if ofs / DIR_ENTRY_SIZE as u32 >= u32::from(self.n_rootdir) {
                    dp.sect = 0;
                    return Err(Error::NotFound);
                }
            } else if (ofs / ss) & (u32::from(self.csize) - 1) == 0 {
                let next = match self.get_fat(dev, &dp.obj, dp.clust)? {
                    Link::Next(n) => n,
                    Link::Free => return Err(inconsistent("free cluster inside a directory")),
                    Link::End => {
                        if !stretch {
                            dp.sect = 0;
                            return Err(Error::NotFound);
                        }
                        let n = match self.create_chain(dev, &mut dp.obj, dp.clust)? {
                            Some(n) => n,
                            None => return Err(Error::Denied),
                        };
                        self.dir_clear(dev, n)?;
                        if self.fs_type == FatType::ExFat {
                            dp.stretched = true;
                            dp.obj.objsize += u64::from(self.cluster_bytes());
                        }
                        trace!("directory stretched with cluster {}", n);
                        n
                    }
                };
                dp.clust = next;
                dp.sect = self
                    .clust2sect(next)
                    .ok_or_else(|| inconsistent("directory cluster out of range"))?;
            }
        }
        dp.dptr = ofs;
        Ok(())
    }

    /// Find `n_ent` consecutive free entries, growing the directory if
    /// needed. The cursor ends on the last of them.
    pub(crate) fn dir_alloc<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        n_ent: usize,
    ) -> Result<(), Error<D::E>> {
        self.dir_sdi(dev, dp, 0)?;
        let mut n = 0;
        loop {
            self.move_window(dev, dp.sect)?;
            let b = self.win.buf[self.entry_offset(dp)];
            let free = if self.fs_type == FatType::ExFat {
                b & ET_IN_USE == 0
            } else {
                b == DELETED || b == 0
            };
            if free {
                n += 1;
                if n == n_ent {
                    return Ok(());
                }
            } else {
                n = 0;
            }
            match self.dir_next(dev, dp, true) {
                Ok(()) => {}
                Err(Error::NotFound) => return Err(Error::Denied),
                Err(e) => return Err(e),
            }
        }
    }

    /// Advance to the next object (or to the volume label when `label` is
    /// set), starting at the current entry. On a FAT volume the long name
    /// lands in `lfnbuf`; on exFAT the entry block lands in `dirbuf`.
    pub(crate) fn dir_read<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        label: bool,
    ) -> Result<(), Error<D::E>> {
        let mut res = Err(Error::NotFound);
        let mut asm = LfnAssembler::new();
        while dp.sect != 0 {
            if let Err(e) = self.move_window(dev, dp.sect) {
                res = Err(e);
                break;
            }
            let e = self.entry(dp);
            let b = e[0];
            if b == 0 {
                res = Err(Error::NotFound);
                break;
            }
            if self.fs_type == FatType::ExFat {
                if label {
                    if b == ET_VLABEL {
                        res = Ok(());
                        break;
                    }
                } else if b == ET_FILEDIR {
                    dp.blk_ofs = dp.dptr;
                    res = self.load_xdir(dev, dp);
                    if res.is_ok() {
                        dp.obj.attr = self.dirbuf[XDIR_ATTR] & ATTR_MASK;
                    }
                    break;
                }
            } else {
                let attr = e[11] & ATTR_MASK;
                dp.obj.attr = attr;
                let is_label = attr & !Attributes::ARCHIVE == Attributes::VOLUME;
                if b == DELETED || b == b'.' || is_label != label {
                    asm.reset();
                } else if attr == Attributes::LFN {
                    if asm.feed(&mut self.lfnbuf, &e) {
                        dp.blk_ofs = dp.dptr;
                    }
                } else {
                    if !(asm.completes(&e) && lfn_is_legal(&self.lfnbuf)) {
                        dp.blk_ofs = BLK_NONE;
                    }
                    res = Ok(());
                    break;
                }
            }
            if let Err(e) = self.dir_next(dev, dp, false) {
                res = Err(e);
                break;
            }
        }
        if res.is_err() {
            dp.sect = 0;
        }
        res
    }

    /// Search the directory for `dp.name`. On success the cursor is on the
    /// short entry (FAT) or the last entry of the block (exFAT).
    pub(crate) fn dir_find<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
    ) -> Result<(), Error<D::E>> {
        self.dir_sdi(dev, dp, 0)?;
        if self.fs_type == FatType::ExFat {
            let hash = xname_sum(&dp.name.lfn);
            loop {
                self.dir_read(dev, dp, false)?;
                if LittleEndian::read_u16(&self.dirbuf[XDIR_NAME_HASH..]) != hash {
                    continue;
                }
                let nc = usize::from(self.dirbuf[XDIR_NUM_NAME]);
                if nc != dp.name.len {
                    continue;
                }
                let mut name = [0u16; crate::MAX_LFN + 1];
                xdir_name(&self.dirbuf, &mut name);
                let same = name[..nc]
                    .iter()
                    .zip(dp.name.lfn[..nc].iter())
                    .all(|(&a, &b)| crate::fat::lfn::wtoupper(a) == crate::fat::lfn::wtoupper(b));
                if same {
                    return Ok(());
                }
            }
        }

        let mut asm = LfnAssembler::new();
        dp.blk_ofs = BLK_NONE;
        loop {
            self.move_window(dev, dp.sect)?;
            let e = self.entry(dp);
            let c = e[0];
            if c == 0 {
                return Err(Error::NotFound);
            }
            let a = e[11] & ATTR_MASK;
            dp.obj.attr = a;
            if c == DELETED || (a & Attributes::VOLUME != 0 && a != Attributes::LFN) {
                asm.reset();
                dp.blk_ofs = BLK_NONE;
            } else if a == Attributes::LFN {
                if c & LAST_LONG_ENTRY != 0 {
                    dp.blk_ofs = dp.dptr;
                }
                asm.feed(&mut self.lfnbuf, &e);
            } else {
                // The collected name stays in `lfnbuf` for `file_info`.
                let owned = asm.completes(&e);
                if !(owned && lfn_is_legal(&self.lfnbuf)) {
                    self.lfnbuf[0] = 0;
                }
                let by_lfn = dp.name.flags & NS_NOLFN == 0
                    && self.lfnbuf[0] != 0
                    && lfn_eq(&self.lfnbuf, &dp.name.lfn);
                if by_lfn || (!dp.name.is_lossy() && e[..11] == dp.name.sfn) {
                    if !owned {
                        dp.blk_ofs = BLK_NONE;
                    }
                    return Ok(());
                }
                asm.reset();
                dp.blk_ofs = BLK_NONE;
            }
            self.dir_next(dev, dp, false)?;
        }
    }

    /// Reserve entries for `dp.name` and write its name. FAT volumes get
    /// the long name fragments and a blank short entry on disk; exFAT
    /// volumes get a fresh block in `dirbuf` which the caller stores.
    pub(crate) fn dir_register<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
    ) -> Result<(), Error<D::E>> {
        if dp.name.flags & (NS_DOT | NS_NONAME) != 0 {
            return Err(Error::InvalidName);
        }
        let len = lfn_len(&dp.name.lfn);

        if self.fs_type == FatType::ExFat {
            let n_ent = (len + XDIR_NAME_UNITS - 1) / XDIR_NAME_UNITS + 2;
            self.dir_alloc(dev, dp, n_ent)?;
            dp.blk_ofs = dp.dptr - (DIR_ENTRY_SIZE * (n_ent - 1)) as u32;
            if dp.stretched {
                dp.stretched = false;
                self.fill_first_frag(dev, &mut dp.obj)?;
                self.fill_last_frag(dev, &mut dp.obj, Link::End)?;
                if dp.obj.sclust != 0 {
                    let mut dj = DirCursor::new(ObjectId::default());
                    self.load_obj_xdir(dev, &mut dj, &dp.obj)?;
                    LittleEndian::write_u64(&mut self.dirbuf[XDIR_FILE_SIZE..], dp.obj.objsize);
                    LittleEndian::write_u64(
                        &mut self.dirbuf[XDIR_VALID_FILE_SIZE..],
                        dp.obj.objsize,
                    );
                    self.dirbuf[XDIR_GEN_FLAGS] = dp.obj.stat | GEN_FLAG_ALLOC;
                    self.store_xdir(dev, &mut dj)?;
                }
            }
            create_xdir(&mut self.dirbuf, &dp.name.lfn);
            return Ok(());
        }

        let sn = dp.name.sfn;
        let flags = dp.name.flags;
        if dp.name.is_lossy() {
            dp.name.flags = NS_NOLFN;
            let mut free_tail = false;
            for n in 1..NUMERIC_TAIL_RETRIES {
                dp.name.sfn = gen_numname(&sn, &dp.name.lfn, n);
                match self.dir_find(dev, dp) {
                    Ok(()) => {}
                    Err(Error::NotFound) => {
                        free_tail = true;
                        break;
                    }
                    Err(e) => {
                        dp.name.flags = flags;
                        return Err(e);
                    }
                }
            }
            dp.name.flags = flags;
            if !free_tail {
                warn!("no free numeric tail");
                return Err(Error::Denied);
            }
        }

        let mut n_ent = if dp.name.needs_lfn() {
            fragments_for(len) + 1
        } else {
            1
        };
        self.dir_alloc(dev, dp, n_ent)?;
        n_ent -= 1;
        if n_ent > 0 {
            self.dir_sdi(dev, dp, dp.dptr - (n_ent * DIR_ENTRY_SIZE) as u32)?;
            let sum = crate::fat::lfn::sum_sfn(&dp.name.sfn);
            while n_ent > 0 {
                self.move_window(dev, dp.sect)?;
                let ofs = self.entry_offset(dp);
                put_lfn(
                    &dp.name.lfn,
                    &mut self.win.buf[ofs..ofs + DIR_ENTRY_SIZE],
                    n_ent as u8,
                    sum,
                );
                self.win.dirty = true;
                match self.dir_next(dev, dp, false) {
                    Ok(()) => {}
                    Err(Error::NotFound) => {
                        return Err(inconsistent("allocated entries vanished"))
                    }
                    Err(e) => return Err(e),
                }
                n_ent -= 1;
            }
        }
        self.move_window(dev, dp.sect)?;
        let sfn = dp.name.sfn;
        init_sfn_entry(self.entry_mut(dp), &sfn, flags & (NS_BODY | NS_EXT));
        Ok(())
    }

    /// Mark the object under the cursor, and its long name or entry block,
    /// as deleted.
    pub(crate) fn dir_remove<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
    ) -> Result<(), Error<D::E>> {
        let last = dp.dptr;
        if dp.blk_ofs != BLK_NONE {
            self.dir_sdi(dev, dp, dp.blk_ofs)?;
        }
        loop {
            self.move_window(dev, dp.sect)?;
            let exfat = self.fs_type == FatType::ExFat;
            let e = self.entry_mut(dp);
            if exfat {
                e[0] &= !ET_IN_USE;
            } else {
                e[0] = DELETED;
            }
            if dp.dptr >= last {
                return Ok(());
            }
            match self.dir_next(dev, dp, false) {
                Ok(()) => {}
                Err(Error::NotFound) => return Err(inconsistent("entry block runs past the directory")),
                Err(e) => return Err(e),
            }
        }
    }

    /// Describe the object the cursor was left on by `dir_read` or
    /// `dir_find`.
    pub(crate) fn file_info(&self, dp: &DirCursor) -> FileInfo {
        let mut info = FileInfo::default();
        info.inode = inode_of(dp.sect, dp.index());

        if self.fs_type == FatType::ExFat {
            let mut name = [0u16; crate::MAX_LFN + 1];
            let len = xdir_name(&self.dirbuf, &mut name);
            if !utf16_into(&name[..len], &mut info.name) {
                info.name.clear();
                let _ = info.name.push('?');
            }
            let attr = self.dirbuf[XDIR_ATTR] & XATTR_MASK;
            info.attributes = Attributes::create_from_fat(attr);
            info.size = if attr & Attributes::DIRECTORY != 0 {
                0
            } else {
                LittleEndian::read_u64(&self.dirbuf[XDIR_FILE_SIZE..])
            };
            info.modified =
                Timestamp::from_fat_packed(LittleEndian::read_u32(&self.dirbuf[XDIR_MOD_TIME..]));
            return info;
        }

        let raw = self.entry(dp);
        let entry = OnDiskDirEntry::new(&raw);
        if dp.blk_ofs != BLK_NONE {
            let len = lfn_len(&self.lfnbuf);
            if !utf16_into(&self.lfnbuf[..len], &mut info.name) {
                info.name.clear();
            }
        }
        entry.short_name(&mut info.short_name, false);
        if info.name.is_empty() {
            let mut shown: heapless::String<24> = heapless::String::new();
            entry.short_name(&mut shown, true);
            let _ = info.name.push_str(&shown);
            if entry.nt_res() == 0 {
                info.short_name.clear();
            }
        }
        info.attributes = entry.attributes();
        info.size = u64::from(entry.file_size());
        info.modified = Timestamp::from_fat_packed(entry.modified());
        info
    }
}

/// Decode UTF-16 into `out`. Returns `false` on a broken surrogate pair or
/// when the name does not fit.
fn utf16_into<const N: usize>(units: &[u16], out: &mut heapless::String<N>) -> bool {
    out.clear();
    for c in char::decode_utf16(units.iter().copied()) {
        match c {
            Ok(c) => {
                if out.push(c).is_err() {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
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
