/// Unique ID used to tell one mount of a volume from the next.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SearchId(pub(crate) u32);

/// A Search ID generator.
///
/// This object will always return a different ID.
///
/// Well, it will wrap after `2**32` IDs. But most systems won't remount
/// that many times, and if they do, they are unlikely to still hold a handle
/// from four billion mounts ago.
#[derive(Debug)]
pub struct SearchIdGenerator {
    next_id: core::num::Wrapping<u32>,
}

impl SearchIdGenerator {
    /// Create a new generator of Search IDs.
    pub const fn new(offset: u32) -> Self {
        Self {
            next_id: core::num::Wrapping(offset),
        }
    }

    /// Generate a new, unique [`SearchId`].
    pub fn get(&mut self) -> SearchId {
        let id = self.next_id;
        self.next_id += 1;
        SearchId(id.0)
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
    fn ids_are_unique_and_wrap() {
        let mut generator = SearchIdGenerator::new(u32::MAX - 1);
        assert_eq!(generator.get(), SearchId(u32::MAX - 1));
        assert_eq!(generator.get(), SearchId(u32::MAX));
        assert_eq!(generator.get(), SearchId(0));
    }
}
