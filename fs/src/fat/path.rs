//! Resolving slash separated paths.

use crate::blockdevice::BlockDevice;
use crate::fat::{
    dir::DirCursor,
    sfn::{ObjName, NS_LAST},
    volume::FatVolume,
    FatType, ObjectId,
};
use crate::filesystem::attributes::Attributes;
use crate::{Error, MAX_PATH_DEPTH};

/// The directories walked through on the way to an entry.
pub(crate) type Ancestors = heapless::Vec<ObjectId, MAX_PATH_DEPTH>;

/// Is `c` a path separator?
pub(crate) fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

impl FatVolume {
    /// Walk `path` from the root directory.
    ///
    /// On success `dp` sits on the entry of the last segment and `dp.obj`
    /// is the directory holding it. When the path names a directory by
    /// itself (`/`, or a path ending in `.` or `..`), `dp.name` has
    /// `NS_NONAME` set and `dp.obj` is that directory.
    ///
    /// A missing last segment gives `NotFound` with the cursor ready for
    /// `dir_register`; a missing or non-directory intermediate segment
    /// gives `NoPath`.
    pub(crate) fn follow_path<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        path: &str,
    ) -> Result<(), Error<D::E>> {
        let mut ancestors = Ancestors::new();
        self.follow_path_from_root(dev, dp, path, &mut ancestors)
    }

    /// `follow_path`, leaving in `ancestors` every directory above `dp.obj`
    /// on the resolved path, root first.
    pub(crate) fn follow_path_from_root<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dp: &mut DirCursor,
        path: &str,
        ancestors: &mut Ancestors,
    ) -> Result<(), Error<D::E>> {
        dp.obj = ObjectId::root();
        dp.stretched = false;
        ancestors.clear();
        let mut segments = path.split(is_separator).filter(|s| !s.is_empty()).peekable();

        if segments.peek().is_none() {
            dp.name = ObjName::none();
            return self.dir_sdi(dev, dp, 0);
        }

        while let Some(seg) = segments.next() {
            let last = segments.peek().is_none();
            let mut name = ObjName::from_segment::<D::E>(seg)?;
            if last {
                name.flags |= NS_LAST;
            }

            if name.is_dot() {
                if name.len == 2 {
                    dp.obj = ancestors.pop().unwrap_or_else(ObjectId::root);
                }
                if last {
                    dp.name = ObjName::none();
                    return self.dir_sdi(dev, dp, 0);
                }
                continue;
            }

            dp.name = name;
            match self.dir_find(dev, dp) {
                Ok(()) => {}
                Err(Error::NotFound) if !last => return Err(Error::NoPath),
                Err(e) => return Err(e),
            }
            if last {
                return Ok(());
            }
            if dp.obj.attr & Attributes::DIRECTORY == 0 {
                return Err(Error::NoPath);
            }
            if ancestors.push(dp.obj).is_err() {
                return Err(Error::InvalidName);
            }
            self.enter_directory(dp);
        }
        Ok(())
    }

    /// Make the directory under the cursor the one being walked.
    pub(crate) fn enter_directory(&self, dp: &mut DirCursor) {
        if self.fs_type == FatType::ExFat {
            dp.obj.enter_child(dp.blk_ofs);
            self.init_alloc_info(&mut dp.obj);
        } else {
            let entry = self.entry(dp);
            dp.obj = ObjectId {
                sclust: self.ld_clust(&entry),
                ..ObjectId::root()
            };
        }
        dp.obj.attr = Attributes::DIRECTORY;
    }
}

/// Does the cursor name the directory itself rather than an entry in it?
pub(crate) fn is_noname(dp: &DirCursor) -> bool {
    dp.name.is_noname()
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
