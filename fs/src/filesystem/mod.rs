//! Generic filesystem types
//!
//! The caller-facing values: attributes, timestamps and the handles the
//! engine hands out.

/// Entry attribute bits
pub mod attributes;
/// Directory handles and entry metadata
pub mod directory;
/// File handles and open modes
pub mod files;
/// Reentrancy lock and open-object table
pub mod lock;
/// Mount generation ids
pub mod search_id;
/// Wall clock values and the time source
pub mod timestamp;

/// Largest file size on a FAT12/16/32 volume.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;
