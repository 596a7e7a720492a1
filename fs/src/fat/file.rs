//! Moving bytes between caller buffers and a file's clusters.
//!
//! There is no per-file sector buffer. Whole sectors go straight between
//! the caller's buffer and the device; partial sectors go through the
//! volume's window, which is kept coherent with the direct transfers.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::{BlockDevice, BlockIdx};
use crate::fat::{
    dir::DirCursor,
    inconsistent,
    ondiskdirentry::{st_clust, stamp_modified, DIR_ATTR, DIR_FILE_SIZE},
    table::Link,
    volume::FatVolume,
    xdir::{
        GEN_FLAG_ALLOC, XDIR_ACC_TIME, XDIR_ATTR, XDIR_FILE_SIZE, XDIR_FST_CLUS, XDIR_GEN_FLAGS,
        XDIR_MOD_TIME, XDIR_MOD_TIME10, XDIR_VALID_FILE_SIZE,
    },
    FatType, ObjectId, DIR_ENTRY_SIZE,
};
use crate::filesystem::{attributes::Attributes, files::File, MAX_FILE_SIZE};
use crate::{trace, Error};

impl FatVolume {
    /// The cluster following `clst` in a file's chain, which must exist.
    fn next_file_cluster<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        obj: &ObjectId,
        clst: u32,
    ) -> Result<u32, Error<D::E>> {
        match self.get_fat(dev, obj, clst)? {
            Link::Next(n) => Ok(n),
            Link::End => Err(inconsistent("file chain ends before its size")),
            Link::Free => Err(inconsistent("free cluster inside a file")),
        }
    }

    /// First sector of `clst`, which must be a data cluster.
    fn data_sector<E: core::fmt::Debug>(&self, clst: u32) -> Result<u64, Error<E>> {
        self.clust2sect(clst)
            .ok_or_else(|| inconsistent("file cluster out of range"))
    }

    /// Sector index of `fptr` inside its cluster.
    fn sector_in_cluster(&self, fptr: u64) -> u32 {
        ((fptr / u64::from(self.ss)) & u64::from(self.csize - 1)) as u32
    }

    /// Copy up to `buf.len()` bytes from the current offset. Stops at the
    /// end of the file.
    pub(crate) fn read_file<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        fp: &mut File,
        buf: &mut [u8],
    ) -> Result<usize, Error<D::E>> {
        let remain = fp.obj.objsize.saturating_sub(fp.fptr);
        let mut btr = (buf.len() as u64).min(remain) as usize;
        let ss = usize::from(self.ss);
        let mut done = 0;

        while btr > 0 {
            let in_sect = (fp.fptr % ss as u64) as usize;
            if in_sect == 0 {
                let csect = self.sector_in_cluster(fp.fptr);
                if csect == 0 {
                    fp.clust = if let Some(map) = &fp.link_map {
                        map.cluster_at(fp.fptr, self.cluster_bytes())
                            .ok_or_else(|| inconsistent("link map ends before the file"))?
                    } else if fp.fptr == 0 {
                        fp.obj.sclust
                    } else {
                        self.next_file_cluster(dev, &fp.obj, fp.clust)?
                    };
                }
                let sect = self.data_sector(fp.clust)? + u64::from(csect);
                let mut cc = btr / ss;
                if cc > 0 {
                    cc = cc.min((u32::from(self.csize) - csect) as usize);
                    let bytes = cc * ss;
                    let chunk = &mut buf[done..done + bytes];
                    dev.read(chunk, BlockIdx(sect), cc as u32)
                        .map_err(Error::DeviceError)?;
                    // The window may hold newer data for one of these sectors.
                    if self.win.dirty && self.win.sect.wrapping_sub(sect) < cc as u64 {
                        let o = (self.win.sect - sect) as usize * ss;
                        chunk[o..o + ss].copy_from_slice(&self.win.buf[..ss]);
                    }
                    fp.fptr += bytes as u64;
                    done += bytes;
                    btr -= bytes;
                    continue;
                }
                fp.sect = sect;
            }
            if fp.sect == 0 {
                return Err(inconsistent("file position has no sector"));
            }
            self.move_window(dev, fp.sect)?;
            let n = (ss - in_sect).min(btr);
            buf[done..done + n].copy_from_slice(&self.win.buf[in_sect..in_sect + n]);
            fp.fptr += n as u64;
            done += n;
            btr -= n;
        }
        Ok(done)
    }

    /// Copy `buf` to the current offset, growing the chain as needed.
    ///
    /// Running out of clusters part way is not an error: the count written
    /// so far is returned. Only a write that could place nothing at all
    /// reports `DiskFull`. A file with a link map never grows past its last
    /// cluster; the write stops there instead.
    pub(crate) fn write_file<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        fp: &mut File,
        buf: &[u8],
    ) -> Result<usize, Error<D::E>> {
        let mut btw = buf.len();
        if self.fs_type != FatType::ExFat {
            let room = MAX_FILE_SIZE.saturating_sub(fp.fptr);
            btw = (btw as u64).min(room) as usize;
        }
        let ss = usize::from(self.ss);
        let mut done = 0;
        let mut full = false;

        while btw > 0 {
            let in_sect = (fp.fptr % ss as u64) as usize;
            if in_sect == 0 {
                let csect = self.sector_in_cluster(fp.fptr);
                if csect == 0 {
                    let next = if let Some(map) = &fp.link_map {
                        match map.cluster_at(fp.fptr, self.cluster_bytes()) {
                            Some(c) => Some(c),
                            None => break,
                        }
                    } else if fp.fptr == 0 && fp.obj.sclust != 0 {
                        Some(fp.obj.sclust)
                    } else {
                        let from = if fp.fptr == 0 { 0 } else { fp.clust };
                        self.create_chain(dev, &mut fp.obj, from)?
                    };
                    match next {
                        Some(c) => {
                            fp.clust = c;
                            if fp.obj.sclust == 0 {
                                fp.obj.sclust = c;
                            }
                        }
                        None => {
                            full = true;
                            break;
                        }
                    }
                }
                let sect = self.data_sector(fp.clust)? + u64::from(csect);
                let mut cc = btw / ss;
                if cc > 0 {
                    cc = cc.min((u32::from(self.csize) - csect) as usize);
                    let wcnt = cc * ss;
                    let chunk = &buf[done..done + wcnt];
                    dev.write(chunk, BlockIdx(sect), cc as u32)
                        .map_err(Error::DeviceError)?;
                    // Keep the window from writing stale data over these sectors.
                    if self.win.sect.wrapping_sub(sect) < cc as u64 {
                        let o = (self.win.sect - sect) as usize * ss;
                        self.win.buf[..ss].copy_from_slice(&chunk[o..o + ss]);
                        self.win.dirty = false;
                    }
                    advance_written(fp, wcnt);
                    done += wcnt;
                    btw -= wcnt;
                    continue;
                }
                if fp.fptr >= fp.obj.objsize {
                    // Nothing worth reading lives past the end of the file.
                    self.clear_window_at(dev, sect)?;
                }
                fp.sect = sect;
            }
            if fp.sect == 0 {
                return Err(inconsistent("file position has no sector"));
            }
            let wcnt = (ss - in_sect).min(btw);
            self.move_window(dev, fp.sect)?;
            self.win.buf[in_sect..in_sect + wcnt].copy_from_slice(&buf[done..done + wcnt]);
            self.win.dirty = true;
            advance_written(fp, wcnt);
            done += wcnt;
            btw -= wcnt;
        }

        if done > 0 {
            fp.modified = true;
        }
        if full && done == 0 {
            trace!("no cluster left for file data");
            return Err(Error::DiskFull);
        }
        Ok(done)
    }

    /// Move the offset to `ofs`.
    ///
    /// A read-only handle cannot move past the end of the file. A writable
    /// handle extends the file, allocating clusters on the way; when the
    /// volume fills up the offset stops at the end of the last cluster.
    /// With a link map the target cluster comes straight from the map and
    /// the offset never passes the end of the file.
    pub(crate) fn seek_file<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        fp: &mut File,
        ofs: u64,
    ) -> Result<(), Error<D::E>> {
        let mut ofs = ofs;
        if self.fs_type != FatType::ExFat {
            ofs = ofs.min(MAX_FILE_SIZE);
        }
        let write = fp.mode.is_write();
        if ofs > fp.obj.objsize && (!write || fp.link_map.is_some()) {
            ofs = fp.obj.objsize;
        }
        if let Some(map) = &fp.link_map {
            fp.fptr = ofs;
            if ofs > 0 {
                fp.clust = map
                    .cluster_at(ofs - 1, self.cluster_bytes())
                    .ok_or_else(|| inconsistent("link map ends before the file"))?;
                let sect = self.data_sector(fp.clust)? + u64::from(self.sector_in_cluster(ofs - 1));
                if ofs % u64::from(self.ss) != 0 {
                    fp.sect = sect;
                }
            }
            return Ok(());
        }

        let ifptr = fp.fptr;
        fp.fptr = 0;
        let mut nsect = 0;
        if ofs > 0 {
            let bcs = u64::from(self.cluster_bytes());
            let mut clst;
            if ifptr > 0 && (ofs - 1) / bcs >= (ifptr - 1) / bcs {
                // Same or later cluster: start from where we are.
                fp.fptr = (ifptr - 1) & !(bcs - 1);
                ofs -= fp.fptr;
                clst = fp.clust;
            } else {
                clst = fp.obj.sclust;
                if clst == 0 {
                    clst = self.create_chain(dev, &mut fp.obj, 0)?.unwrap_or(0);
                    fp.obj.sclust = clst;
                }
                fp.clust = clst;
            }
            if clst != 0 {
                while ofs > bcs {
                    ofs -= bcs;
                    fp.fptr += bcs;
                    if write {
                        if self.fs_type == FatType::ExFat && fp.fptr > fp.obj.objsize {
                            fp.obj.objsize = fp.fptr;
                            fp.modified = true;
                        }
                        match self.create_chain(dev, &mut fp.obj, clst)? {
                            Some(n) => clst = n,
                            None => {
                                ofs = 0;
                                break;
                            }
                        }
                    } else {
                        clst = self.next_file_cluster(dev, &fp.obj, clst)?;
                    }
                    fp.clust = clst;
                }
                fp.fptr += ofs;
                if ofs % u64::from(self.ss) != 0 {
                    nsect = self.data_sector(clst)? + ofs / u64::from(self.ss);
                }
            }
        }
        if fp.fptr > fp.obj.objsize {
            fp.obj.objsize = fp.fptr;
            fp.modified = true;
        }
        if fp.fptr % u64::from(self.ss) != 0 && nsect != fp.sect {
            fp.sect = nsect;
        }
        Ok(())
    }

    /// Cut the file at the current offset and free the clusters past it.
    pub(crate) fn truncate_file<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        fp: &mut File,
    ) -> Result<(), Error<D::E>> {
        if !fp.mode.is_write() {
            return Err(Error::Denied);
        }
        if fp.fptr >= fp.obj.objsize {
            return Ok(());
        }
        if fp.fptr == 0 {
            let scl = fp.obj.sclust;
            if scl != 0 {
                self.remove_chain(dev, &mut fp.obj, scl, 0)?;
            }
            fp.obj.sclust = 0;
        } else {
            match self.get_fat(dev, &fp.obj, fp.clust)? {
                Link::Next(ncl) => {
                    let pcl = fp.clust;
                    self.remove_chain(dev, &mut fp.obj, ncl, pcl)?;
                }
                Link::End => {}
                Link::Free => return Err(inconsistent("free cluster inside a file")),
            }
        }
        // The map may now name freed clusters.
        fp.link_map = None;
        trace!("file truncated to {} bytes", fp.fptr);
        fp.obj.objsize = fp.fptr;
        fp.modified = true;
        Ok(())
    }

    /// Write the directory entry of a modified file back and flush the
    /// volume. `tm` is the packed modification time.
    pub(crate) fn sync_file<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        fp: &mut File,
        tm: u32,
    ) -> Result<(), Error<D::E>> {
        if !fp.modified {
            return Ok(());
        }
        if self.fs_type == FatType::ExFat {
            self.fill_first_frag(dev, &mut fp.obj)?;
            self.fill_last_frag(dev, &mut fp.obj, Link::End)?;
            let mut dj = DirCursor::new(ObjectId::default());
            self.load_obj_xdir(dev, &mut dj, &fp.obj)?;
            let size = fp.obj.objsize;
            let b = &mut self.dirbuf;
            b[XDIR_ATTR] |= Attributes::ARCHIVE;
            b[XDIR_GEN_FLAGS] = fp.obj.stat | GEN_FLAG_ALLOC;
            LittleEndian::write_u32(&mut b[XDIR_FST_CLUS..], fp.obj.sclust);
            LittleEndian::write_u64(&mut b[XDIR_FILE_SIZE..], size);
            LittleEndian::write_u64(&mut b[XDIR_VALID_FILE_SIZE..], size);
            LittleEndian::write_u32(&mut b[XDIR_MOD_TIME..], tm);
            b[XDIR_MOD_TIME10] = 0;
            LittleEndian::write_u32(&mut b[XDIR_ACC_TIME..], 0);
            self.store_xdir(dev, &mut dj)?;
        } else {
            self.move_window(dev, fp.dir_sect)?;
            let fs_type = self.fs_type;
            let ofs = (fp.dir_ptr % u32::from(self.ss)) as usize;
            let e = &mut self.win_mut()[ofs..ofs + DIR_ENTRY_SIZE];
            e[DIR_ATTR] |= Attributes::ARCHIVE;
            st_clust(e, fs_type, fp.obj.sclust);
            LittleEndian::write_u32(&mut e[DIR_FILE_SIZE..], fp.obj.objsize as u32);
            stamp_modified(e, tm);
        }
        self.sync_fs(dev)?;
        fp.modified = false;
        Ok(())
    }
}

fn advance_written(fp: &mut File, n: usize) {
    fp.fptr += n as u64;
    if fp.fptr > fp.obj.objsize {
        fp.obj.objsize = fp.fptr;
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
