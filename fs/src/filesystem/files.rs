use crate::fat::{linkmap::LinkMap, ObjectId};
use crate::filesystem::{lock::LockKey, search_id::SearchId};
use crate::Error;

/// How a file is opened.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Open a file for reading, if it exists.
    ReadOnly,
    /// Open a file for reading and writing, if it exists. The offset starts
    /// at 0.
    ReadWrite,
    /// Open a file for appending (writing to the end of the existing file), if it exists.
    ReadWriteAppend,
    /// Open a file and remove all contents, before writing to the start of the existing file, if it exists.
    ReadWriteTruncate,
    /// Create a new empty file. Fail if it exists.
    ReadWriteCreate,
    /// Create a new empty file, or truncate an existing file.
    ReadWriteCreateOrTruncate,
    /// Create a new empty file, or append to an existing file.
    ReadWriteCreateOrAppend,
}

impl Mode {
    /// Does this mode allow writing?
    pub fn is_write(self) -> bool {
        self != Mode::ReadOnly
    }

    /// Is a missing file created?
    pub(crate) fn creates(self) -> bool {
        matches!(
            self,
            Mode::ReadWriteCreate | Mode::ReadWriteCreateOrTruncate | Mode::ReadWriteCreateOrAppend
        )
    }

    /// Is an existing file emptied?
    pub(crate) fn truncates(self) -> bool {
        matches!(self, Mode::ReadWriteTruncate | Mode::ReadWriteCreateOrTruncate)
    }

    /// Does the offset start at the end of the file?
    pub(crate) fn appends(self) -> bool {
        matches!(self, Mode::ReadWriteAppend | Mode::ReadWriteCreateOrAppend)
    }
}

/// The failure a file handle remembers after a disk operation went wrong
/// half way.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyError {
    /// The device failed
    Disk,
    /// The on-disk structures turned out inconsistent
    Internal(&'static str),
}

impl StickyError {
    /// Remember `err` if it leaves the handle in an unknown state.
    pub(crate) fn from_error<E: core::fmt::Debug>(err: &Error<E>) -> Option<StickyError> {
        match err {
            Error::DeviceError(_) | Error::DiskFault => Some(StickyError::Disk),
            Error::Inconsistent(r) => Some(StickyError::Internal(r)),
            _ => None,
        }
    }

    pub(crate) fn to_error<E: core::fmt::Debug>(self) -> Error<E> {
        match self {
            StickyError::Disk => Error::DiskFault,
            StickyError::Internal(r) => Error::Inconsistent(r),
        }
    }
}

/// Represents an open file on disk.
///
/// Do NOT drop this object! It doesn't hold a reference to the
/// [`crate::FileSystem`] it was created from, so dropping it leaves the
/// object locked and any buffered size change unwritten. Pass it to
/// [`crate::FileSystem::close`] instead.
#[derive(Debug)]
pub struct File {
    pub(crate) vol_id: SearchId,
    pub(crate) mode: Mode,
    /// Allocation state; `objsize` is the file length
    pub(crate) obj: ObjectId,
    /// Current offset
    pub(crate) fptr: u64,
    /// Cluster holding `fptr`, 0 before the first access
    pub(crate) clust: u32,
    /// Data sector of `fptr`, 0 when not known
    pub(crate) sect: u64,
    /// Sector holding the directory entry (the short entry or the last
    /// record of the exFAT block)
    pub(crate) dir_sect: u64,
    /// Byte offset of that entry in its directory
    pub(crate) dir_ptr: u32,
    /// The entry needs rewriting on sync
    pub(crate) modified: bool,
    pub(crate) err: Option<StickyError>,
    pub(crate) lock: LockKey,
    /// Fragments of the chain, when fast seeking is on
    pub(crate) link_map: Option<LinkMap>,
}

impl File {
    /// The mode the file was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current offset from the start of the file.
    pub fn tell(&self) -> u64 {
        self.fptr
    }

    /// Length of the file in bytes.
    pub fn size(&self) -> u64 {
        self.obj.objsize
    }

    /// Is the offset at (or past) the end of the file?
    pub fn eof(&self) -> bool {
        self.fptr >= self.obj.objsize
    }

    /// Is fast seeking on? See [`crate::FileSystem::enable_fast_seek`].
    pub fn fast_seek(&self) -> bool {
        self.link_map.is_some()
    }

    /// The failure that made this handle unusable, if any.
    pub fn error(&self) -> Option<StickyError> {
        self.err
    }

    /// Remember the outcome of a disk operation on this handle if it was a
    /// failure that leaves the handle in an unknown state.
    pub(crate) fn note<T, E: core::fmt::Debug>(
        &mut self,
        res: Result<T, Error<E>>,
    ) -> Result<T, Error<E>> {
        if let Err(e) = &res {
            if let Some(sticky) = StickyError::from_error(e) {
                self.err = Some(sticky);
            }
        }
        res
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

    #[test]
    fn mode_properties() {
        assert!(!Mode::ReadOnly.is_write());
        assert!(Mode::ReadWrite.is_write());
        assert!(Mode::ReadWriteCreate.creates());
        assert!(!Mode::ReadWriteTruncate.creates());
        assert!(Mode::ReadWriteCreateOrTruncate.truncates());
        assert!(Mode::ReadWriteCreateOrAppend.appends());
        assert!(!Mode::ReadWriteCreate.appends());
    }

    #[test]
    fn only_disk_and_consistency_errors_stick() {
        assert_eq!(
            StickyError::from_error(&Error::DeviceError(7u8)),
            Some(StickyError::Disk)
        );
        assert_eq!(
            StickyError::from_error(&Error::<u8>::Inconsistent("loop")),
            Some(StickyError::Internal("loop"))
        );
        assert_eq!(StickyError::from_error(&Error::<u8>::DiskFull), None);
        assert_eq!(StickyError::Disk.to_error::<u8>(), Error::DiskFault);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
