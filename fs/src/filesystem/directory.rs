use crate::fat::ObjectId;
use crate::filesystem::{
    attributes::Attributes, lock::LockKey, search_id::SearchId, timestamp::Timestamp,
};
use crate::MAX_LFN;

/// Longest name a [`FileInfo`] can hold, in UTF-8 bytes.
pub const MAX_NAME_BYTES: usize = 3 * MAX_LFN;

/// What [`crate::FileSystem::stat`] and [`crate::FileSystem::readdir`] tell
/// you about a file or directory.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct FileInfo {
    /// The long name, or the short name when there is none
    pub name: heapless::String<MAX_NAME_BYTES>,
    /// The 8.3 name, empty when it adds nothing to `name`. Always empty on
    /// exFAT.
    pub short_name: heapless::String<24>,
    /// The size of the file in bytes. Directories report 0.
    pub size: u64,
    /// The file attributes (Read Only, Archive, etc)
    pub attributes: Attributes,
    /// When the file was last modified
    pub modified: Timestamp,
    /// A number derived from where the entry sits on disk. Stable while the
    /// entry is not moved; never 0 or 1.
    pub inode: u64,
}

/// Derive a pseudo inode number from the sector holding an entry and the
/// entry index inside its directory.
///
/// The index is reduced modulo 16, so entries in sectors larger than 512
/// bytes can collide. Numbers 0 and 1 are never produced.
pub fn inode_of(sector: u64, index: u32) -> u64 {
    let ino = (sector << 4) | u64::from(index % 16);
    ino.max(2)
}

/// Represents an open directory on disk.
///
/// Do NOT drop this object without passing it to
/// [`crate::FileSystem::closedir`]: an open subdirectory holds a read lock
/// and the lock table only learns the directory is gone when it is closed.
#[derive(Debug)]
pub struct Dir {
    pub(crate) vol_id: SearchId,
    pub(crate) obj: ObjectId,
    pub(crate) dptr: u32,
    pub(crate) clust: u32,
    pub(crate) sect: u64,
    pub(crate) lock: Option<LockKey>,
}

impl Dir {
    /// Is this the root directory of its volume?
    pub fn is_root(&self) -> bool {
        self.lock.is_none()
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
    fn inode_numbers() {
        assert_eq!(inode_of(0, 0), 2);
        assert_eq!(inode_of(0, 1), 2);
        assert_eq!(inode_of(0, 5), 5);
        assert_eq!(inode_of(100, 3), 1603);
        // Only the low four bits of the index survive.
        assert_eq!(inode_of(100, 19), 1603);
    }

    #[test]
    fn file_info_defaults() {
        let info = FileInfo::default();
        assert!(info.name.is_empty());
        assert_eq!(info.size, 0);
        assert!(!info.attributes.is_directory());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
