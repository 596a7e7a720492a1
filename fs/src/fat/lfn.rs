//! Long file name fragments.
//!
//! A long name is split into groups of 13 UTF-16 units. Each group lives in
//! one 32-byte entry tagged with the LFN attribute combination, stored in
//! reverse order right before the short entry it belongs to. Every fragment
//! carries the checksum of that short entry's 11 name bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::filesystem::attributes::Attributes;
use crate::MAX_LFN;

pub(crate) const LFN_ORD: usize = 0;
pub(crate) const LFN_ATTR: usize = 11;
pub(crate) const LFN_TYPE: usize = 12;
pub(crate) const LFN_CHKSUM: usize = 13;
pub(crate) const LFN_FST_CLUS_LO: usize = 26;

/// Ordinal flag on the fragment holding the end of the name.
pub(crate) const LAST_LONG_ENTRY: u8 = 0x40;

/// UTF-16 units per fragment.
pub(crate) const CHARS_PER_ENTRY: usize = 13;

/// Where each of the 13 units sits inside a fragment.
const LFN_OFS: [usize; CHARS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// A zero-terminated UTF-16 name buffer.
pub(crate) type LfnBuf = [u16; MAX_LFN + 1];

/// Checksum of an 8.3 name, as stored in each of its fragments.
pub(crate) fn sum_sfn(name: &[u8]) -> u8 {
    name[..11]
        .iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// Upper-case one UTF-16 unit. Surrogates and characters whose upper case
/// form is not a single BMP character are returned unchanged.
pub(crate) fn wtoupper(c: u16) -> u16 {
    if c < 0x80 {
        return u16::from((c as u8).to_ascii_uppercase());
    }
    let Some(ch) = char::from_u32(u32::from(c)) else {
        return c;
    };
    let mut up = ch.to_uppercase();
    match (up.next(), up.next()) {
        (Some(u), None) if (u as u32) < 0x1_0000 => u as u16,
        _ => c,
    }
}

/// Length of a zero-terminated name.
pub(crate) fn lfn_len(lfn: &[u16]) -> usize {
    lfn.iter().position(|&c| c == 0).unwrap_or(lfn.len())
}

/// Can this decoded name have been written by a conforming
/// implementation? Rejects control and reserved characters, and unpaired
/// surrogates.
pub(crate) fn lfn_is_legal(lfn: &[u16]) -> bool {
    let len = lfn_len(lfn);
    if len == 0 {
        return false;
    }
    let mut expect_low = false;
    for &c in &lfn[..len] {
        let is_high = (0xD800..0xDC00).contains(&c);
        let is_low = (0xDC00..0xE000).contains(&c);
        if expect_low != is_low {
            return false;
        }
        expect_low = is_high;
        if c < 0x20 || (c < 0x80 && b"\"*/:<>?\\|\x7F".contains(&(c as u8))) {
            return false;
        }
    }
    !expect_low
}

fn fragment_start(entry: &[u8]) -> Option<usize> {
    let ord = usize::from(entry[LFN_ORD] & !LAST_LONG_ENTRY);
    if ord == 0 {
        None
    } else {
        Some((ord - 1) * CHARS_PER_ENTRY)
    }
}

/// Copy the units of one fragment into `lfnbuf`. Returns `false` when the
/// fragment is malformed.
pub(crate) fn pick_lfn(lfnbuf: &mut LfnBuf, entry: &[u8]) -> bool {
    if LittleEndian::read_u16(&entry[LFN_FST_CLUS_LO..]) != 0 || entry[LFN_TYPE] != 0 {
        return false;
    }
    let Some(mut i) = fragment_start(entry) else {
        return false;
    };
    let mut wc = 1u16;
    for ofs in LFN_OFS {
        let uc = LittleEndian::read_u16(&entry[ofs..]);
        if wc != 0 {
            if i > MAX_LFN || (i == MAX_LFN && uc != 0) {
                return false;
            }
            lfnbuf[i] = uc;
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    if entry[LFN_ORD] & LAST_LONG_ENTRY != 0 && wc != 0 {
        if i > MAX_LFN {
            return false;
        }
        lfnbuf[i] = 0;
    }
    true
}

/// Do two zero-terminated names match, ignoring case?
pub(crate) fn lfn_eq(a: &[u16], b: &[u16]) -> bool {
    let len = lfn_len(a);
    len == lfn_len(b)
        && a[..len]
            .iter()
            .zip(&b[..len])
            .all(|(&x, &y)| wtoupper(x) == wtoupper(y))
}

/// Fill `entry` with fragment number `ord` (1-based) of `lfn`.
pub(crate) fn put_lfn(lfn: &LfnBuf, entry: &mut [u8], ord: u8, sum: u8) {
    entry[LFN_CHKSUM] = sum;
    entry[LFN_ATTR] = Attributes::LFN;
    entry[LFN_TYPE] = 0;
    LittleEndian::write_u16(&mut entry[LFN_FST_CLUS_LO..], 0);

    let mut i = usize::from(ord - 1) * CHARS_PER_ENTRY;
    let mut wc = 0u16;
    for ofs in LFN_OFS {
        if wc != 0xFFFF {
            wc = lfn[i];
            i += 1;
        }
        LittleEndian::write_u16(&mut entry[ofs..], wc);
        if wc == 0 {
            wc = 0xFFFF;
        }
    }
    let mut ord = ord;
    if wc == 0xFFFF || lfn[i] == 0 {
        ord |= LAST_LONG_ENTRY;
    }
    entry[LFN_ORD] = ord;
}

/// Number of fragments needed for a name of `len` units.
pub(crate) fn fragments_for(len: usize) -> usize {
    (len + CHARS_PER_ENTRY - 1) / CHARS_PER_ENTRY
}

/// Collects a long name from the fragments met while walking a directory
/// forwards, and decides whether it belongs to the short entry that
/// follows.
#[derive(Debug, Copy, Clone)]
pub(crate) struct LfnAssembler {
    ord: u8,
    sum: u8,
}

impl LfnAssembler {
    pub(crate) const fn new() -> LfnAssembler {
        LfnAssembler {
            ord: 0xFF,
            sum: 0xFF,
        }
    }

    /// Forget any partial sequence.
    pub(crate) fn reset(&mut self) {
        *self = LfnAssembler::new();
    }

    /// Feed one fragment. Returns `true` if it starts a new sequence.
    pub(crate) fn feed(&mut self, lfnbuf: &mut LfnBuf, entry: &[u8]) -> bool {
        let mut c = entry[LFN_ORD];
        let starts = c & LAST_LONG_ENTRY != 0;
        if starts {
            self.sum = entry[LFN_CHKSUM];
            c &= !LAST_LONG_ENTRY;
            self.ord = c;
        }
        self.ord = if c == self.ord && self.sum == entry[LFN_CHKSUM] && pick_lfn(lfnbuf, entry) {
            self.ord.wrapping_sub(1)
        } else {
            0xFF
        };
        starts
    }

    /// Does the collected sequence end right here and match `sfn`?
    pub(crate) fn completes(&self, sfn: &[u8]) -> bool {
        self.ord == 0 && self.sum == sum_sfn(sfn)
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

    fn to_buf(s: &str) -> LfnBuf {
        let mut buf = [0u16; MAX_LFN + 1];
        for (i, u) in s.encode_utf16().enumerate() {
            buf[i] = u;
        }
        buf
    }

    /// Lay out fragments the way they sit on disk, followed by the short
    /// entry.
    fn encode(name: &str, sfn: &[u8; 11]) -> Vec<[u8; 32]> {
        let buf = to_buf(name);
        let n = fragments_for(lfn_len(&buf));
        let sum = sum_sfn(sfn);
        let mut out = Vec::new();
        for ord in (1..=n).rev() {
            let mut e = [0u8; 32];
            put_lfn(&buf, &mut e, ord as u8, sum);
            out.push(e);
        }
        let mut short = [0u8; 32];
        short[..11].copy_from_slice(sfn);
        short[11] = Attributes::ARCHIVE;
        out.push(short);
        out
    }

    /// Walk entries the way a directory read does. Returns the long name
    /// if it is accepted for the short entry.
    fn decode(entries: &[[u8; 32]]) -> Option<String> {
        let mut asm = LfnAssembler::new();
        let mut buf = [0u16; MAX_LFN + 1];
        for e in entries {
            if e[LFN_ATTR] & 0x3F == Attributes::LFN {
                asm.feed(&mut buf, e);
            } else {
                if asm.completes(&e[..11]) && lfn_is_legal(&buf) {
                    return Some(String::from_utf16(&buf[..lfn_len(&buf)]).unwrap());
                }
                return None;
            }
        }
        None
    }

    #[test]
    fn checksum_matches_known_value() {
        assert_eq!(sum_sfn(b"FOO     BAR"), 0x53);
        assert_eq!(sum_sfn(b"ALONGN~1   "), 0xA5);
    }

    #[test]
    fn fragment_padding() {
        let buf = to_buf("abc");
        let mut e = [0u8; 32];
        put_lfn(&buf, &mut e, 1, 0x12);
        assert_eq!(e[0], 0x41);
        assert_eq!(e[11], 0x0F);
        assert_eq!(e[13], 0x12);
        assert_eq!(&e[1..9], &hex!("61 00 62 00 63 00 00 00"));
        assert_eq!(&e[9..11], &hex!("FF FF"));
        assert_eq!(&e[28..32], &hex!("FF FF FF FF"));
    }

    #[test]
    fn long_names_round_trip() {
        let names = [
            "a",
            "exactly13char",
            "twenty-six characters....",
            "Grüße aus Köln.txt",
            "\u{1F600} smile.png",
            "a name that is quite a lot longer than one fragment and then some.data",
        ];
        for name in names {
            let entries = encode(name, b"SHORT   TXT");
            assert_eq!(decode(&entries).as_deref(), Some(name), "{}", name);
        }
        let longest: String = core::iter::repeat('x').take(MAX_LFN).collect();
        assert_eq!(decode(&encode(&longest, b"X~1        ")), Some(longest));
    }

    #[test]
    fn corrupted_fragments_lose_the_long_name() {
        let name = "a long name spread across three fragments";
        let clean = encode(name, b"ALONGN~1   ");
        assert_eq!(clean.len(), 5);
        // Every fragment but the one holding the end of the name is full.
        for frag in 1..clean.len() - 1 {
            for (ofs, bad) in [
                (LFN_ORD, 0x07u8),
                (LFN_CHKSUM, 0x3C),
                (LFN_TYPE, 0x01),
                (LFN_FST_CLUS_LO, 0x01),
                (LFN_ATTR, 0x20),
                (1, b'/'),
                (2, 0xD8),
            ] {
                let mut entries = clean.clone();
                entries[frag][ofs] = bad;
                assert_eq!(decode(&entries), None, "fragment {} offset {}", frag, ofs);
            }
        }
        // A different short name breaks the checksum.
        let mut entries = clean.clone();
        entries.last_mut().unwrap()[0] = b'B';
        assert_eq!(decode(&entries), None);
        // So does a missing fragment.
        let mut entries = clean;
        entries.remove(2);
        assert_eq!(decode(&entries), None);
    }

    #[test]
    fn filler_after_terminator_is_checked() {
        let mut entries = encode("abc", b"ABC        ");
        entries[0][30] = 0x00;
        assert_eq!(decode(&entries), None);
    }

    #[test]
    fn compare_ignores_case() {
        let name = decode(&encode("Mixed Case Name.Txt", b"MIXEDC~1TXT")).unwrap();
        let found = to_buf(&name);
        assert!(lfn_eq(&found, &to_buf("MIXED CASE name.TXT")));
        assert!(!lfn_eq(&found, &to_buf("Mixed Case Name.Tx")));
        assert!(!lfn_eq(&found, &to_buf("Mixed Case Name.Txt2")));
    }

    #[test]
    fn upper_casing() {
        assert_eq!(wtoupper(u16::from(b'a')), u16::from(b'A'));
        assert_eq!(wtoupper(0x00E9), 0x00C9);
        assert_eq!(wtoupper(0x03B1), 0x0391);
        // ß upper-cases to two characters and is left alone.
        assert_eq!(wtoupper(0x00DF), 0x00DF);
        assert_eq!(wtoupper(0xD83D), 0xD83D);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
