//! The filesystem facade.
//!
//! [`FileSystem`] owns the block device, the clock and at most one mounted
//! volume. Every public operation takes the reentrancy lock first, checks
//! that any handle it was given belongs to the current mount, and then runs
//! the `fat` machinery against the volume.

use byteorder::{ByteOrder, LittleEndian};

use crate::blockdevice::BlockDevice;
use crate::fat::{
    bpb::Bpb,
    dir::DirCursor,
    lfn::wtoupper,
    mkfs::{self, MkfsOptions},
    ondiskdirentry::{
        st_clust, stamp_created, DELETED, DIR_ATTR, DIR_FILE_SIZE, DIR_MOD_TIME,
    },
    partition::{self, PartitionSize},
    path::{is_noname, Ancestors},
    table::Link,
    volume::FatVolume,
    xdir::{
        ET_VLABEL, GEN_FLAG_ALLOC, GEN_FLAG_NO_FAT_CHAIN, XDIR_ATTR, XDIR_CRT_TIME,
        XDIR_FILE_SIZE, XDIR_FST_CLUS, XDIR_GEN_FLAGS, XDIR_LABEL, XDIR_MOD_TIME,
        XDIR_NAME_HASH, XDIR_NUM_LABEL, XDIR_NUM_NAME, XDIR_NUM_SEC, XDIR_TYPE,
        XDIR_VALID_FILE_SIZE,
    },
    FatType, ObjectId, DIR_ENTRY_SIZE,
};
use crate::filesystem::{
    attributes::Attributes,
    directory::{Dir, FileInfo},
    files::{File, Mode},
    lock::{Access, LockConflict, LockGuard, LockKey, LockTable, NoLock, VolumeLock},
    search_id::{SearchId, SearchIdGenerator},
    timestamp::{TimeSource, Timestamp},
};
use crate::{debug, trace, warn, Error, MIN_SS};

/// Longest volume label, in UTF-8 bytes.
pub const MAX_LABEL_BYTES: usize = 33;

/// A volume label as returned by [`FileSystem::getlabel`].
pub type VolumeLabel = heapless::String<MAX_LABEL_BYTES>;

/// Characters a volume label may not contain, besides control characters.
const LABEL_REJECTS: &[u8] = b"\"*+,.:;<=>?[]|\x7F";

/// Longest label in characters (FAT) or UTF-16 units (exFAT).
const LABEL_LEN: usize = 11;

/// Space figures for the mounted volume.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VolumeStats {
    /// Which FAT variant the volume uses
    pub fat_type: FatType,
    /// Bytes per sector
    pub sector_size: u16,
    /// Bytes per cluster
    pub cluster_size: u32,
    /// Number of data clusters
    pub total_clusters: u32,
    /// Number of data clusters not in use
    pub free_clusters: u32,
}

impl VolumeStats {
    /// Free space in bytes.
    pub fn free_bytes(&self) -> u64 {
        u64::from(self.free_clusters) * u64::from(self.cluster_size)
    }
}

/// The mounted volume and what belongs to this one mount.
struct MountedVolume<const N: usize> {
    fat: FatVolume,
    id: SearchId,
    part: u8,
    locks: LockTable<N>,
}

/// A FAT/exFAT filesystem on one block device.
///
/// `L` is the reentrancy lock taken by every operation and `MAX_OPEN` the
/// number of distinct objects (files and subdirectories) that can be open
/// at once.
pub struct FileSystem<D, T, L = NoLock, const MAX_OPEN: usize = 4>
where
    D: BlockDevice,
    T: TimeSource,
    L: VolumeLock,
{
    block_device: D,
    time_source: T,
    lock: L,
    id_generator: SearchIdGenerator,
    /// Partition to mount on the next operation
    pending: Option<u8>,
    volume: Option<MountedVolume<MAX_OPEN>>,
}

impl<D, T> FileSystem<D, T, NoLock, 4>
where
    D: BlockDevice,
    T: TimeSource,
{
    /// Create a new filesystem over a generic `BlockDevice`. Nothing is
    /// mounted until [`FileSystem::mount`] is called.
    ///
    /// This creates a `FileSystem` without a reentrancy lock and room for
    /// four open objects. Call `FileSystem::new_with_limits` or
    /// `FileSystem::new_with_lock` if you need something else.
    pub fn new(block_device: D, time_source: T) -> FileSystem<D, T, NoLock, 4> {
        // Pick a random starting point for the IDs that's not zero, because
        // zero doesn't stand out in the logs.
        Self::new_with_lock(block_device, time_source, NoLock, 5000)
    }
}

impl<D, T, L, const MAX_OPEN: usize> FileSystem<D, T, L, MAX_OPEN>
where
    D: BlockDevice,
    T: TimeSource,
    L: VolumeLock + Default,
{
    /// Create a new filesystem with a default constructed lock.
    ///
    /// You can also give an offset for the mount IDs this filesystem
    /// generates, which might help you find them in your logs when
    /// debugging.
    pub fn new_with_limits(
        block_device: D,
        time_source: T,
        id_offset: u32,
    ) -> FileSystem<D, T, L, MAX_OPEN> {
        Self::new_with_lock(block_device, time_source, L::default(), id_offset)
    }
}

impl<D, T, L, const MAX_OPEN: usize> FileSystem<D, T, L, MAX_OPEN>
where
    D: BlockDevice,
    T: TimeSource,
    L: VolumeLock,
{
    /// Create a new filesystem guarded by `lock`.
    pub fn new_with_lock(
        block_device: D,
        time_source: T,
        lock: L,
        id_offset: u32,
    ) -> FileSystem<D, T, L, MAX_OPEN> {
        FileSystem {
            block_device,
            time_source,
            lock,
            id_generator: SearchIdGenerator::new(id_offset),
            pending: None,
            volume: None,
        }
    }

    /// Temporarily get access to the underlying block device.
    pub fn device(&mut self) -> &mut D {
        &mut self.block_device
    }

    /// Consume self and return BlockDevice and TimeSource
    pub fn free(self) -> (D, T) {
        (self.block_device, self.time_source)
    }

    /// The FAT variant of the mounted volume, if one is mounted right now.
    pub fn fat_type(&self) -> Option<FatType> {
        self.volume.as_ref().map(|v| v.fat.fs_type)
    }

    /// Number of files and subdirectories currently open.
    pub fn open_objects(&self) -> usize {
        self.volume.as_ref().map_or(0, |v| v.locks.len())
    }

    /// Register partition `partition` (0 to auto-detect) as the volume to
    /// use. With `force` the volume is looked for now; otherwise on the first
    /// operation that needs it.
    ///
    /// Whatever was mounted before is dropped and its handles become stale.
    pub fn mount(&mut self, partition: u8, force: bool) -> Result<(), Error<D::E>> {
        let FileSystem {
            block_device,
            lock,
            id_generator,
            pending,
            volume,
            ..
        } = self;
        let _guard = LockGuard::acquire(&*lock).ok_or(Error::Timeout)?;
        if let Some(mut old) = volume.take() {
            if old.fat.sync_fs(block_device).is_err() {
                warn!("could not flush volume {:?} before remounting", old.id);
            }
        }
        *pending = Some(partition);
        if force {
            *volume = Some(mount_now(block_device, id_generator, partition)?);
            *pending = None;
        }
        Ok(())
    }

    /// Flush and forget the mounted volume.
    pub fn unmount(&mut self) -> Result<(), Error<D::E>> {
        let FileSystem {
            block_device,
            lock,
            pending,
            volume,
            ..
        } = self;
        let _guard = LockGuard::acquire(&*lock).ok_or(Error::Timeout)?;
        *pending = None;
        match volume.take() {
            Some(mut old) => {
                debug!("unmounting volume {:?}", old.id);
                old.fat.sync_fs(block_device)
            }
            None => Ok(()),
        }
    }

    /// Format the device. Any mounted volume is dropped first without
    /// being flushed; a pending mount is kept and picks up the new volume.
    pub fn mkfs(&mut self, opts: &MkfsOptions) -> Result<FatType, Error<D::E>> {
        let FileSystem {
            block_device,
            time_source,
            lock,
            pending,
            volume,
            ..
        } = self;
        let _guard = LockGuard::acquire(&*lock).ok_or(Error::Timeout)?;
        if let Some(old) = volume.take() {
            debug!("volume {:?} dropped for formatting", old.id);
            pending.get_or_insert(old.part);
        }
        let serial = time_source.get_timestamp().to_fat_packed();
        mkfs::format(block_device, opts, serial)
    }

    /// Write a new MBR dividing the device into up to four partitions.
    /// Any mounted volume is dropped first, as for [`FileSystem::mkfs`].
    /// The partitions are left unformatted; format each one by setting
    /// [`MkfsOptions::partition`].
    pub fn fdisk(&mut self, sizes: &[PartitionSize]) -> Result<(), Error<D::E>> {
        let FileSystem {
            block_device,
            lock,
            pending,
            volume,
            ..
        } = self;
        let _guard = LockGuard::acquire(&*lock).ok_or(Error::Timeout)?;
        if let Some(old) = volume.take() {
            debug!("volume {:?} dropped for partitioning", old.id);
            pending.get_or_insert(old.part);
        }
        partition::create_partitions(block_device, sizes)
    }

    /// Open the file at `path`.
    pub fn open(&mut self, path: &str, mode: Mode) -> Result<File, Error<D::E>> {
        self.session(mode.is_write())?.open(path, mode)
    }

    /// Read from the current offset. Returns how many bytes were read,
    /// which is less than `buf.len()` only at the end of the file.
    pub fn read(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize, Error<D::E>> {
        let s = self.file_session(file, false)?;
        let res = s.vol.fat.read_file(s.dev, file, buf);
        file.note(res)
    }

    /// Write at the current offset. Returns how many bytes were written,
    /// which is less than `buf.len()` when the volume filled up.
    pub fn write(&mut self, file: &mut File, buf: &[u8]) -> Result<usize, Error<D::E>> {
        if !file.mode.is_write() {
            return Err(Error::Denied);
        }
        let s = self.file_session(file, true)?;
        let res = s.vol.fat.write_file(s.dev, file, buf);
        file.note(res)
    }

    /// Hand up to `btf` bytes from the current offset to `sink`, at most
    /// one sector's worth per call. `sink` returns how many bytes it took;
    /// taking fewer than offered ends the transfer there. Returns the total
    /// taken.
    pub fn forward<F>(&mut self, file: &mut File, btf: usize, mut sink: F) -> Result<usize, Error<D::E>>
    where
        F: FnMut(&[u8]) -> usize,
    {
        let mut chunk = [0u8; MIN_SS];
        let mut done = 0;
        while done < btf {
            let in_sect = (file.tell() % MIN_SS as u64) as usize;
            let want = (MIN_SS - in_sect).min(btf - done);
            let n = self.read(file, &mut chunk[..want])?;
            if n == 0 {
                break;
            }
            let took = sink(&chunk[..n]).min(n);
            done += took;
            if took < n {
                let back = file.tell() - (n - took) as u64;
                self.lseek(file, back)?;
                break;
            }
        }
        Ok(done)
    }

    /// Read one line into `buf`, up to and including its `\n`. Stops early
    /// when `buf` is full or the file ends. Returns the number of bytes
    /// stored, 0 only at the end of the file.
    pub fn read_line(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize, Error<D::E>> {
        let mut got = 0;
        while got < buf.len() {
            let n = self.read(file, &mut buf[got..])?;
            if n == 0 {
                break;
            }
            if let Some(i) = buf[got..got + n].iter().position(|&b| b == b'\n') {
                let extra = n - (i + 1);
                if extra > 0 {
                    let back = file.tell() - extra as u64;
                    self.lseek(file, back)?;
                }
                return Ok(got + i + 1);
            }
            got += n;
        }
        Ok(got)
    }

    /// Write formatted text at the current offset:
    /// `fs.print(&mut file, format_args!("{} items", n))`. Returns the
    /// bytes written, which fall short when the volume fills up.
    pub fn print(&mut self, file: &mut File, args: core::fmt::Arguments<'_>) -> Result<usize, Error<D::E>> {
        let mut written = 0;
        let mut short = false;
        let mut failure = None;
        let _ = core::fmt::write(
            &mut FmtSink(|bytes: &[u8]| match self.write(file, bytes) {
                Ok(n) => {
                    written += n;
                    short = n < bytes.len();
                    !short
                }
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }),
            args,
        );
        match failure {
            Some(Error::DiskFull) if written > 0 => Ok(written),
            Some(e) => Err(e),
            None if short && written == 0 => Err(Error::DiskFull),
            None => Ok(written),
        }
    }

    /// Move the offset to `ofs` bytes from the start of the file.
    pub fn lseek(&mut self, file: &mut File, ofs: u64) -> Result<(), Error<D::E>> {
        let grows = file.mode.is_write() && ofs > file.size();
        let s = self.file_session(file, grows)?;
        let res = s.vol.fat.seek_file(s.dev, file, ofs);
        file.note(res)
    }

    /// Turn on fast seeking: record the file's cluster chain so that seeks
    /// and reads find clusters without walking the FAT. Returns the number
    /// of fragments in the chain.
    ///
    /// While it is on, the file cannot grow past its last cluster. Writes
    /// stop there and seeks stop at the end of the file. Truncating the file
    /// turns it off again.
    pub fn enable_fast_seek(&mut self, file: &mut File) -> Result<usize, Error<D::E>> {
        let s = self.file_session(file, false)?;
        let res = s.vol.fat.build_link_map(s.dev, file);
        let map = file.note(res)?;
        let frags = map.frags.len();
        debug!("fast seek on for {:?} with {} fragments", file.lock, frags);
        file.link_map = Some(map);
        Ok(frags)
    }

    /// Turn fast seeking off.
    pub fn disable_fast_seek(&mut self, file: &mut File) {
        file.link_map = None;
    }

    /// Cut the file at the current offset.
    pub fn truncate(&mut self, file: &mut File) -> Result<(), Error<D::E>> {
        let s = self.file_session(file, true)?;
        let res = s.vol.fat.truncate_file(s.dev, file);
        file.note(res)
    }

    /// Write the file's size, start cluster and time stamp back to its
    /// directory entry and flush the volume.
    pub fn sync(&mut self, file: &mut File) -> Result<(), Error<D::E>> {
        let s = self.file_session(file, file.modified)?;
        let tm = s.now();
        let res = s.vol.fat.sync_file(s.dev, file, tm);
        file.note(res)
    }

    /// Sync and release the file.
    ///
    /// A handle that has recorded a disk or consistency error is released
    /// without syncing.
    pub fn close(&mut self, mut file: File) -> Result<(), Error<D::E>> {
        let s = self.handle_session(file.vol_id, false)?;
        let res = if file.err.is_none() {
            let tm = s.now();
            s.vol.fat.sync_file(s.dev, &mut file, tm)
        } else {
            Ok(())
        };
        if !s.vol.locks.release(file.lock) {
            warn!("closed file {:?} was not in the lock table", file.lock);
        }
        res
    }

    /// Open the directory at `path` for listing.
    pub fn opendir(&mut self, path: &str) -> Result<Dir, Error<D::E>> {
        self.session(false)?.opendir(path)
    }

    /// Return the next entry, or `None` at the end of the directory.
    pub fn readdir(&mut self, dir: &mut Dir) -> Result<Option<FileInfo>, Error<D::E>> {
        self.handle_session(dir.vol_id, false)?.readdir(dir)
    }

    /// Start the listing over.
    pub fn rewinddir(&mut self, dir: &mut Dir) -> Result<(), Error<D::E>> {
        let s = self.handle_session(dir.vol_id, false)?;
        let mut dp = cursor_of(dir);
        s.vol.fat.dir_sdi(s.dev, &mut dp, 0)?;
        save_cursor(dir, &dp);
        Ok(())
    }

    /// Release the directory.
    pub fn closedir(&mut self, dir: Dir) -> Result<(), Error<D::E>> {
        let s = self.handle_session(dir.vol_id, false)?;
        if let Some(key) = dir.lock {
            s.vol.locks.release(key);
        }
        Ok(())
    }

    /// Describe the file or directory at `path`.
    pub fn stat(&mut self, path: &str) -> Result<FileInfo, Error<D::E>> {
        self.session(false)?.stat(path)
    }

    /// Create a directory. Its parent must exist.
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error<D::E>> {
        self.session(true)?.mkdir(path)
    }

    /// Remove a file or an empty directory.
    pub fn unlink(&mut self, path: &str) -> Result<(), Error<D::E>> {
        self.session(true)?.unlink(path)
    }

    /// Rename or move a file or directory. The new name must not exist.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), Error<D::E>> {
        self.session(true)?.rename(old_path, new_path)
    }

    /// Change the attribute bits selected by `mask` to the values in
    /// `attr`. Only read-only, hidden, system and archive can change.
    pub fn chmod(&mut self, path: &str, attr: u8, mask: u8) -> Result<(), Error<D::E>> {
        self.session(true)?.chmod(path, attr, mask)
    }

    /// Set the modification time.
    pub fn utime(&mut self, path: &str, when: Timestamp) -> Result<(), Error<D::E>> {
        self.session(true)?.utime(path, when)
    }

    /// Report the volume geometry and how many clusters are free. The free
    /// count is worked out once per mount and then kept up to date.
    pub fn getfree(&mut self) -> Result<VolumeStats, Error<D::E>> {
        self.session(false)?.getfree()
    }

    /// The volume label (empty if there is none) and the serial number.
    pub fn getlabel(&mut self) -> Result<(VolumeLabel, u32), Error<D::E>> {
        self.session(false)?.getlabel()
    }

    /// Set the volume label. An empty string removes it.
    pub fn setlabel(&mut self, label: &str) -> Result<(), Error<D::E>> {
        self.session(true)?.setlabel(label)
    }

    /// Take the lock and make sure a volume is mounted.
    fn session(&mut self, write: bool) -> Result<Session<'_, D, T, L, MAX_OPEN>, Error<D::E>> {
        let FileSystem {
            block_device,
            time_source,
            lock,
            id_generator,
            pending,
            volume,
        } = self;
        let guard = LockGuard::acquire(&*lock).ok_or(Error::Timeout)?;
        if !block_device.status().is_ready() {
            if let Some(old) = volume.take() {
                debug!("medium of volume {:?} went away", old.id);
                *pending = Some(old.part);
            }
        }
        if volume.is_none() {
            let part = pending.ok_or(Error::NotMounted)?;
            // A failed mount stays pending and is retried next time.
            *volume = Some(mount_now(block_device, id_generator, part)?);
            *pending = None;
        }
        let vol = volume.as_mut().ok_or(Error::NotMounted)?;
        if write && block_device.status().write_protected {
            return Err(Error::WriteProtected);
        }
        Ok(Session {
            _guard: guard,
            dev: block_device,
            clock: time_source,
            vol,
        })
    }

    /// A session for an operation on a handle from mount `id`.
    fn handle_session(
        &mut self,
        id: SearchId,
        write: bool,
    ) -> Result<Session<'_, D, T, L, MAX_OPEN>, Error<D::E>> {
        let s = match self.session(write) {
            Err(Error::NotMounted) => return Err(Error::BadHandle),
            other => other?,
        };
        if s.vol.id != id {
            trace!("handle from mount {:?} used on mount {:?}", id, s.vol.id);
            return Err(Error::BadHandle);
        }
        Ok(s)
    }

    /// A session for a data operation on `file`, which must not carry a
    /// sticky error.
    fn file_session(
        &mut self,
        file: &File,
        write: bool,
    ) -> Result<Session<'_, D, T, L, MAX_OPEN>, Error<D::E>> {
        let s = self.handle_session(file.vol_id, write)?;
        if let Some(e) = file.err {
            return Err(e.to_error());
        }
        Ok(s)
    }
}

fn mount_now<D: BlockDevice, const N: usize>(
    dev: &mut D,
    ids: &mut SearchIdGenerator,
    part: u8,
) -> Result<MountedVolume<N>, Error<D::E>> {
    let fat = FatVolume::mount(dev, part)?;
    let id = ids.get();
    debug!("partition {} mounted as volume {:?}", part, id);
    Ok(MountedVolume {
        fat,
        id,
        part,
        locks: LockTable::new(),
    })
}

/// Feeds formatted text to a closure that reports whether it all fitted.
struct FmtSink<F: FnMut(&[u8]) -> bool>(F);

impl<F: FnMut(&[u8]) -> bool> core::fmt::Write for FmtSink<F> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if (self.0)(s.as_bytes()) {
            Ok(())
        } else {
            Err(core::fmt::Error)
        }
    }
}

fn lock_key(dj: &DirCursor) -> LockKey {
    LockKey {
        dir_cluster: dj.obj.sclust,
        entry: dj.index(),
    }
}

fn lock_error<E: core::fmt::Debug>(c: LockConflict) -> Error<E> {
    match c {
        LockConflict::Locked => Error::Locked,
        LockConflict::Full => Error::TooManyOpenFiles,
    }
}

fn cursor_of(dir: &Dir) -> DirCursor {
    let mut dp = DirCursor::new(dir.obj);
    dp.dptr = dir.dptr;
    dp.clust = dir.clust;
    dp.sect = dir.sect;
    dp
}

fn save_cursor(dir: &mut Dir, dp: &DirCursor) {
    dir.obj = dp.obj;
    dir.dptr = dp.dptr;
    dir.clust = dp.clust;
    dir.sect = dp.sect;
}

/// Is `w` allowed in a volume label?
fn label_char_ok(w: u16) -> bool {
    w >= 0x20 && !(w < 0x80 && LABEL_REJECTS.contains(&(w as u8)))
}

/// Everything one operation needs, borrowed out of the [`FileSystem`] for
/// as long as the reentrancy lock is held.
struct Session<'a, D, T, L, const N: usize>
where
    D: BlockDevice,
    T: TimeSource,
    L: VolumeLock,
{
    _guard: LockGuard<'a, L>,
    dev: &'a mut D,
    clock: &'a T,
    vol: &'a mut MountedVolume<N>,
}

impl<'a, D, T, L, const N: usize> Session<'a, D, T, L, N>
where
    D: BlockDevice,
    T: TimeSource,
    L: VolumeLock,
{
    /// The current time, packed.
    fn now(&self) -> u32 {
        self.clock.get_timestamp().to_fat_packed()
    }

    fn open(self, path: &str, mode: Mode) -> Result<File, Error<D::E>> {
        let tm = self.now();
        let vol = self.vol;
        let dev = self.dev;
        let fs = &mut vol.fat;
        let access = if mode.is_write() {
            Access::Write
        } else {
            Access::Read
        };

        let mut dj = DirCursor::new(ObjectId::root());
        let recreate;
        match fs.follow_path(dev, &mut dj, path) {
            Ok(()) => {
                if is_noname(&dj) {
                    return Err(Error::InvalidName);
                }
                vol.locks.check(lock_key(&dj), access).map_err(lock_error)?;
                let attr = dj.obj.attr;
                if mode.creates() {
                    if attr & (Attributes::READ_ONLY | Attributes::DIRECTORY) != 0 {
                        return Err(Error::Denied);
                    }
                    if mode == Mode::ReadWriteCreate {
                        return Err(Error::AlreadyExists);
                    }
                } else {
                    if attr & Attributes::DIRECTORY != 0 {
                        return Err(Error::NotFound);
                    }
                    if mode.is_write() && attr & Attributes::READ_ONLY != 0 {
                        return Err(Error::Denied);
                    }
                }
                recreate = mode.truncates();
            }
            Err(Error::NotFound) if mode.creates() => {
                if !vol.locks.has_room() {
                    return Err(Error::TooManyOpenFiles);
                }
                fs.dir_register(dev, &mut dj)?;
                trace!("registered new file {}", path);
                recreate = true;
            }
            Err(e) => return Err(e),
        }

        let mut obj;
        if fs.fs_type == FatType::ExFat {
            obj = dj.obj;
            obj.enter_child(dj.blk_ofs);
            fs.init_alloc_info(&mut obj);
            if recreate {
                fs.dirbuf[2..DIR_ENTRY_SIZE].fill(0);
                fs.dirbuf[38..2 * DIR_ENTRY_SIZE].fill(0);
                fs.dirbuf[XDIR_ATTR] = Attributes::ARCHIVE;
                LittleEndian::write_u32(&mut fs.dirbuf[XDIR_CRT_TIME..], tm);
                LittleEndian::write_u32(&mut fs.dirbuf[XDIR_MOD_TIME..], tm);
                fs.dirbuf[XDIR_GEN_FLAGS] = GEN_FLAG_ALLOC;
                fs.store_xdir(dev, &mut dj)?;
                let scl = obj.sclust;
                if scl != 0 {
                    fs.remove_chain(dev, &mut obj, scl, 0)?;
                    fs.last_clust = scl - 1;
                }
                fs.init_alloc_info(&mut obj);
            }
            obj.attr = fs.dirbuf[XDIR_ATTR];
        } else {
            fs.move_window(dev, dj.sect)?;
            let entry = fs.entry(&dj);
            let scl = fs.ld_clust(&entry);
            if recreate {
                let fs_type = fs.fs_type;
                let e = fs.entry_mut(&dj);
                stamp_created(e, tm);
                e[DIR_ATTR] = Attributes::ARCHIVE;
                st_clust(e, fs_type, 0);
                LittleEndian::write_u32(&mut e[DIR_FILE_SIZE..], 0);
                if scl != 0 {
                    let mut old = ObjectId {
                        sclust: scl,
                        ..ObjectId::default()
                    };
                    fs.remove_chain(dev, &mut old, scl, 0)?;
                    fs.last_clust = scl - 1;
                    fs.move_window(dev, dj.sect)?;
                }
                obj = ObjectId {
                    attr: Attributes::ARCHIVE,
                    ..ObjectId::default()
                };
            } else {
                obj = ObjectId {
                    attr: entry[DIR_ATTR],
                    sclust: scl,
                    objsize: u64::from(LittleEndian::read_u32(&entry[DIR_FILE_SIZE..])),
                    ..ObjectId::default()
                };
            }
        }

        let key = lock_key(&dj);
        let mut fp = File {
            vol_id: vol.id,
            mode,
            obj,
            fptr: 0,
            clust: 0,
            sect: 0,
            dir_sect: dj.sect,
            dir_ptr: dj.dptr,
            modified: recreate,
            err: None,
            lock: key,
            link_map: None,
        };
        if mode.appends() && fp.obj.objsize > 0 {
            let size = fp.obj.objsize;
            fs.seek_file(dev, &mut fp, size)?;
        }
        vol.locks.acquire(key, access).map_err(lock_error)?;
        debug!("opened {} as {:?}", path, key);
        Ok(fp)
    }

    fn opendir(self, path: &str) -> Result<Dir, Error<D::E>> {
        let vol = self.vol;
        let dev = self.dev;
        let fs = &mut vol.fat;
        let mut dj = DirCursor::new(ObjectId::root());
        match fs.follow_path(dev, &mut dj, path) {
            Ok(()) => {}
            Err(Error::NotFound) => return Err(Error::NoPath),
            Err(e) => return Err(e),
        }
        let mut lock = None;
        if !is_noname(&dj) {
            if dj.obj.attr & Attributes::DIRECTORY == 0 {
                return Err(Error::NoPath);
            }
            let key = lock_key(&dj);
            vol.locks.check(key, Access::Read).map_err(lock_error)?;
            fs.enter_directory(&mut dj);
            lock = Some(key);
        }
        fs.dir_sdi(dev, &mut dj, 0)?;
        if let Some(key) = lock {
            vol.locks.acquire(key, Access::Read).map_err(lock_error)?;
        }
        Ok(Dir {
            vol_id: vol.id,
            obj: dj.obj,
            dptr: dj.dptr,
            clust: dj.clust,
            sect: dj.sect,
            lock,
        })
    }

    fn readdir(self, dir: &mut Dir) -> Result<Option<FileInfo>, Error<D::E>> {
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        let mut dp = cursor_of(dir);
        match fs.dir_read(dev, &mut dp, false) {
            Ok(()) => {}
            Err(Error::NotFound) => {
                save_cursor(dir, &dp);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let info = fs.file_info(&dp);
        match fs.dir_next(dev, &mut dp, false) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
        save_cursor(dir, &dp);
        Ok(Some(info))
    }

    /// Resolve `path` to an entry, refusing the names of directories by
    /// themselves (`/`, `.`, `..`).
    fn find_entry(&mut self, path: &str) -> Result<DirCursor, Error<D::E>> {
        let mut dj = DirCursor::new(ObjectId::root());
        self.vol.fat.follow_path(&mut *self.dev, &mut dj, path)?;
        if is_noname(&dj) {
            return Err(Error::InvalidName);
        }
        Ok(dj)
    }

    fn stat(mut self, path: &str) -> Result<FileInfo, Error<D::E>> {
        let dj = self.find_entry(path)?;
        Ok(self.vol.fat.file_info(&dj))
    }

    fn mkdir(self, path: &str) -> Result<(), Error<D::E>> {
        let tm = self.now();
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        let mut dj = DirCursor::new(ObjectId::root());
        match fs.follow_path(dev, &mut dj, path) {
            Ok(()) => return Err(Error::AlreadyExists),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let mut dobj = ObjectId::root();
        let dcl = match fs.create_chain(dev, &mut dobj, 0)? {
            Some(c) => c,
            None => return Err(Error::Denied),
        };
        dobj.sclust = dcl;
        let res = build_directory(fs, dev, &mut dj, &dobj, tm);
        if res.is_err() {
            if fs.remove_chain(dev, &mut dobj, dcl, 0).is_err() {
                warn!("could not free cluster {} of a failed mkdir", dcl);
            }
            return res;
        }
        trace!("created directory {} at cluster {}", path, dcl);
        fs.sync_fs(dev)
    }

    fn unlink(mut self, path: &str) -> Result<(), Error<D::E>> {
        let mut dj = self.find_entry(path)?;
        self.vol
            .locks
            .check(lock_key(&dj), Access::Remove)
            .map_err(lock_error)?;
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        if dj.obj.attr & Attributes::READ_ONLY != 0 {
            return Err(Error::Denied);
        }

        let mut obj = ObjectId::root();
        if fs.fs_type == FatType::ExFat {
            fs.init_alloc_info(&mut obj);
        } else {
            let entry = fs.entry(&dj);
            obj.sclust = fs.ld_clust(&entry);
        }
        let dclst = obj.sclust;

        if dj.obj.attr & Attributes::DIRECTORY != 0 {
            let mut sub = DirCursor::new(obj);
            fs.dir_sdi(dev, &mut sub, 0)?;
            match fs.dir_read(dev, &mut sub, false) {
                Ok(()) => return Err(Error::Denied),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        fs.dir_remove(dev, &mut dj)?;
        if dclst != 0 {
            fs.remove_chain(dev, &mut obj, dclst, 0)?;
        }
        trace!("removed {}", path);
        fs.sync_fs(dev)
    }

    fn rename(mut self, old_path: &str, new_path: &str) -> Result<(), Error<D::E>> {
        let mut djo = self.find_entry(old_path)?;
        self.vol
            .locks
            .check(lock_key(&djo), Access::Remove)
            .map_err(lock_error)?;
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        let exfat = fs.fs_type == FatType::ExFat;

        let mut saved = [0u8; 2 * DIR_ENTRY_SIZE];
        if exfat {
            saved.copy_from_slice(&fs.dirbuf[..2 * DIR_ENTRY_SIZE]);
        } else {
            saved[..DIR_ENTRY_SIZE].copy_from_slice(&fs.entry(&djo));
        }

        let (moved_attr, moved_clust) = if exfat {
            (saved[XDIR_ATTR], LittleEndian::read_u32(&saved[XDIR_FST_CLUS..]))
        } else {
            (saved[DIR_ATTR], fs.ld_clust(&saved[..DIR_ENTRY_SIZE]))
        };

        let mut djn = DirCursor::new(ObjectId::root());
        let mut ancestors = Ancestors::new();
        let exists = match fs.follow_path_from_root(dev, &mut djn, new_path, &mut ancestors) {
            Ok(()) => true,
            Err(Error::NotFound) => false,
            Err(e) => return Err(e),
        };
        // A directory cannot be moved into itself or below itself.
        if moved_attr & Attributes::DIRECTORY != 0
            && moved_clust != 0
            && ancestors
                .iter()
                .chain(core::iter::once(&djn.obj))
                .any(|dir| dir.sclust == moved_clust)
        {
            return Err(Error::InvalidName);
        }
        if exists {
            if is_noname(&djn) {
                return Err(Error::InvalidName);
            }
            let same = djn.obj.sclust == djo.obj.sclust && djn.dptr == djo.dptr;
            if !same {
                return Err(Error::AlreadyExists);
            }
        }
        fs.dir_register(dev, &mut djn)?;

        if exfat {
            let nf = fs.dirbuf[XDIR_NUM_SEC];
            let nn = fs.dirbuf[XDIR_NUM_NAME];
            let nh = LittleEndian::read_u16(&fs.dirbuf[XDIR_NAME_HASH..]);
            fs.dirbuf[..2 * DIR_ENTRY_SIZE].copy_from_slice(&saved);
            fs.dirbuf[XDIR_NUM_SEC] = nf;
            fs.dirbuf[XDIR_NUM_NAME] = nn;
            LittleEndian::write_u16(&mut fs.dirbuf[XDIR_NAME_HASH..], nh);
            if fs.dirbuf[XDIR_ATTR] & Attributes::DIRECTORY == 0 {
                fs.dirbuf[XDIR_ATTR] |= Attributes::ARCHIVE;
            }
            fs.store_xdir(dev, &mut djn)?;
        } else {
            let e = fs.entry_mut(&djn);
            e[13..DIR_ENTRY_SIZE].copy_from_slice(&saved[13..DIR_ENTRY_SIZE]);
            e[DIR_ATTR] = saved[DIR_ATTR];
            if e[DIR_ATTR] & Attributes::DIRECTORY == 0 {
                e[DIR_ATTR] |= Attributes::ARCHIVE;
            } else if djo.obj.sclust != djn.obj.sclust {
                // The moved directory's ".." must point at its new parent.
                let dcl = fs.ld_clust(&saved[..DIR_ENTRY_SIZE]);
                let sect = fs
                    .clust2sect(dcl)
                    .ok_or_else(|| crate::fat::inconsistent("moved directory has no cluster"))?;
                fs.move_window(dev, sect)?;
                let fs_type = fs.fs_type;
                let parent = djn.obj.sclust;
                if fs.win()[DIR_ENTRY_SIZE + 1] == b'.' {
                    let dotdot = &mut fs.win_mut()[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE];
                    st_clust(dotdot, fs_type, parent);
                }
            }
        }

        fs.dir_remove(dev, &mut djo)?;
        trace!("renamed {} to {}", old_path, new_path);
        fs.sync_fs(dev)
    }

    fn chmod(mut self, path: &str, attr: u8, mask: u8) -> Result<(), Error<D::E>> {
        let mut dj = self.find_entry(path)?;
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        let mask = mask & Attributes::CHANGEABLE;
        if fs.fs_type == FatType::ExFat {
            let old = fs.dirbuf[XDIR_ATTR];
            fs.dirbuf[XDIR_ATTR] = (attr & mask) | (old & !mask);
            fs.store_xdir(dev, &mut dj)?;
        } else {
            let e = fs.entry_mut(&dj);
            e[DIR_ATTR] = (attr & mask) | (e[DIR_ATTR] & !mask);
        }
        fs.sync_fs(dev)
    }

    fn utime(mut self, path: &str, when: Timestamp) -> Result<(), Error<D::E>> {
        let mut dj = self.find_entry(path)?;
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        let tm = when.to_fat_packed();
        if fs.fs_type == FatType::ExFat {
            LittleEndian::write_u32(&mut fs.dirbuf[XDIR_MOD_TIME..], tm);
            fs.store_xdir(dev, &mut dj)?;
        } else {
            let e = fs.entry_mut(&dj);
            LittleEndian::write_u32(&mut e[DIR_MOD_TIME..], tm);
        }
        fs.sync_fs(dev)
    }

    fn getfree(self) -> Result<VolumeStats, Error<D::E>> {
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        if !fs.free_count_known() {
            let free = if fs.fs_type == FatType::ExFat {
                fs.count_free_bits(dev)?
            } else {
                let owner = ObjectId::default();
                let mut n = 0;
                for clst in 2..fs.n_fatent {
                    if fs.get_fat(dev, &owner, clst)? == Link::Free {
                        n += 1;
                    }
                }
                n
            };
            debug!("counted {} free clusters", free);
            fs.free_clust = free;
            fs.fsi_dirty = true;
        }
        Ok(VolumeStats {
            fat_type: fs.fs_type,
            sector_size: fs.ss,
            cluster_size: fs.cluster_bytes(),
            total_clusters: fs.cluster_count(),
            free_clusters: fs.free_clust,
        })
    }

    fn getlabel(self) -> Result<(VolumeLabel, u32), Error<D::E>> {
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        let mut dj = DirCursor::new(ObjectId::root());
        fs.dir_sdi(dev, &mut dj, 0)?;
        let mut label = VolumeLabel::new();
        match fs.dir_read(dev, &mut dj, true) {
            Ok(()) => {
                let e = fs.entry(&dj);
                if fs.fs_type == FatType::ExFat {
                    let n = usize::from(e[XDIR_NUM_LABEL]).min(LABEL_LEN);
                    let units = (0..n).map(|i| LittleEndian::read_u16(&e[XDIR_LABEL + 2 * i..]));
                    for c in char::decode_utf16(units) {
                        let _ = label.push(c.unwrap_or(char::REPLACEMENT_CHARACTER));
                    }
                } else {
                    let name = &e[..LABEL_LEN];
                    let len = name.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
                    for &b in &name[..len] {
                        let _ = label.push(char::from(b));
                    }
                }
            }
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let vbr = fs.volbase;
        fs.move_window(dev, vbr)?;
        let serial = Bpb::new(fs.win()).serial(fs.fs_type);
        Ok((label, serial))
    }

    fn setlabel(self, label: &str) -> Result<(), Error<D::E>> {
        let tm = self.now();
        let fs = &mut self.vol.fat;
        let dev = self.dev;
        let exfat = fs.fs_type == FatType::ExFat;
        let label = label.trim_end_matches(' ');

        // On-disk form: UTF-16 units on exFAT, upper-cased Latin-1 on FAT.
        let mut vn = [0u8; 2 * LABEL_LEN];
        let mut len = 0;
        if exfat {
            for w in label.encode_utf16() {
                if len >= LABEL_LEN || !label_char_ok(w) {
                    return Err(Error::InvalidName);
                }
                LittleEndian::write_u16(&mut vn[2 * len..], w);
                len += 1;
            }
        } else {
            vn[..LABEL_LEN].fill(b' ');
            for c in label.chars() {
                let w = u32::from(c);
                if w > 0xFF {
                    return Err(Error::InvalidName);
                }
                let up = wtoupper(w as u16);
                if up > 0xFF || !label_char_ok(up) || len >= LABEL_LEN {
                    return Err(Error::InvalidName);
                }
                vn[len] = up as u8;
                len += 1;
            }
            if vn[0] == DELETED {
                return Err(Error::InvalidName);
            }
        }

        let mut dj = DirCursor::new(ObjectId::root());
        fs.dir_sdi(dev, &mut dj, 0)?;
        match fs.dir_read(dev, &mut dj, true) {
            Ok(()) => {
                let e = fs.entry_mut(&dj);
                if exfat {
                    e[XDIR_NUM_LABEL] = len as u8;
                    e[XDIR_LABEL..XDIR_LABEL + 2 * LABEL_LEN].copy_from_slice(&vn);
                } else if len > 0 {
                    e[..LABEL_LEN].copy_from_slice(&vn[..LABEL_LEN]);
                    LittleEndian::write_u32(&mut e[DIR_MOD_TIME..], tm);
                } else {
                    e[0] = DELETED;
                }
            }
            Err(Error::NotFound) => {
                if len > 0 {
                    fs.dir_alloc(dev, &mut dj, 1)?;
                    fs.move_window(dev, dj.sect)?;
                    let e = fs.entry_mut(&dj);
                    e.fill(0);
                    if exfat {
                        e[XDIR_TYPE] = ET_VLABEL;
                        e[XDIR_NUM_LABEL] = len as u8;
                        e[XDIR_LABEL..XDIR_LABEL + 2 * LABEL_LEN].copy_from_slice(&vn);
                    } else {
                        e[..LABEL_LEN].copy_from_slice(&vn[..LABEL_LEN]);
                        e[DIR_ATTR] = Attributes::VOLUME;
                        LittleEndian::write_u32(&mut e[DIR_MOD_TIME..], tm);
                    }
                }
            }
            Err(e) => return Err(e),
        }
        fs.sync_fs(dev)
    }
}

/// Fill the fresh cluster of a new directory and register its entry in
/// the parent `dj`.
fn build_directory<D: BlockDevice>(
    fs: &mut FatVolume,
    dev: &mut D,
    dj: &mut DirCursor,
    dobj: &ObjectId,
    tm: u32,
) -> Result<(), Error<D::E>> {
    let dcl = dobj.sclust;
    fs.dir_clear(dev, dcl)?;
    let exfat = fs.fs_type == FatType::ExFat;
    if !exfat {
        let fs_type = fs.fs_type;
        let parent = dj.obj.sclust;
        let w = fs.win_mut();
        let (dot, rest) = w.split_at_mut(DIR_ENTRY_SIZE);
        dot[..11].fill(b' ');
        dot[0] = b'.';
        dot[DIR_ATTR] = Attributes::DIRECTORY;
        LittleEndian::write_u32(&mut dot[DIR_MOD_TIME..], tm);
        st_clust(dot, fs_type, dcl);
        let dotdot = &mut rest[..DIR_ENTRY_SIZE];
        dotdot.copy_from_slice(dot);
        dotdot[1] = b'.';
        st_clust(dotdot, fs_type, parent);
    }

    fs.dir_register(dev, dj)?;
    if exfat {
        let size = u64::from(fs.cluster_bytes());
        let b = &mut fs.dirbuf;
        LittleEndian::write_u32(&mut b[XDIR_CRT_TIME..], tm);
        LittleEndian::write_u32(&mut b[XDIR_MOD_TIME..], tm);
        LittleEndian::write_u32(&mut b[XDIR_FST_CLUS..], dcl);
        LittleEndian::write_u64(&mut b[XDIR_FILE_SIZE..], size);
        LittleEndian::write_u64(&mut b[XDIR_VALID_FILE_SIZE..], size);
        b[XDIR_GEN_FLAGS] = GEN_FLAG_ALLOC | GEN_FLAG_NO_FAT_CHAIN;
        b[XDIR_ATTR] = Attributes::DIRECTORY;
        fs.store_xdir(dev, dj)?;
    } else {
        let fs_type = fs.fs_type;
        let e = fs.entry_mut(dj);
        stamp_created(e, tm);
        st_clust(e, fs_type, dcl);
        e[DIR_ATTR] = Attributes::DIRECTORY;
    }
    Ok(())
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
