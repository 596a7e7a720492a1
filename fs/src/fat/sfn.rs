//! Turning a path segment into the names a directory is searched with.
//!
//! Each segment yields the UTF-16 long name plus an 8.3 short name. The
//! short name is marked lossy when it cannot represent the long one, in
//! which case a numeric tail is chosen at creation time.

use crate::fat::lfn::{lfn_len, LfnBuf};
use crate::fat::ondiskdirentry::{DELETED, DELETED_SUBSTITUTE};
use crate::{Error, MAX_LFN};

/// The short name lost information
pub(crate) const NS_LOSS: u8 = 0x01;
/// A long name entry is needed
pub(crate) const NS_LFN: u8 = 0x02;
/// Last segment of the path
pub(crate) const NS_LAST: u8 = 0x04;
/// Lower case body
pub(crate) const NS_BODY: u8 = 0x08;
/// Lower case extension
pub(crate) const NS_EXT: u8 = 0x10;
/// `.` or `..`
pub(crate) const NS_DOT: u8 = 0x20;
/// Search by short name only
pub(crate) const NS_NOLFN: u8 = 0x40;
/// No name: the object is the directory itself
pub(crate) const NS_NONAME: u8 = 0x80;

/// Characters that may appear in a long name but not in a short one.
const SFN_REJECTS: &[u8] = b"+,;=[]";

/// Characters that may appear in neither.
const LFN_REJECTS: &[u8] = b"\"*:<>?|\x7F";

/// The search name of one path segment.
#[derive(Clone)]
pub(crate) struct ObjName {
    pub lfn: LfnBuf,
    pub len: usize,
    pub sfn: [u8; 11],
    pub flags: u8,
}

impl core::fmt::Debug for ObjName {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ObjName")
            .field("sfn", &core::str::from_utf8(&self.sfn).unwrap_or("?"))
            .field("len", &self.len)
            .field("flags", &self.flags)
            .finish()
    }
}

impl ObjName {
    /// The directory itself, with no name of its own.
    pub(crate) const fn none() -> ObjName {
        ObjName {
            lfn: [0u16; MAX_LFN + 1],
            len: 0,
            sfn: [b' '; 11],
            flags: NS_NONAME,
        }
    }

    /// Build the search names for one path segment.
    pub(crate) fn from_segment<E: core::fmt::Debug>(seg: &str) -> Result<ObjName, Error<E>> {
        let mut name = ObjName::none();
        name.flags = 0;
        let mut di = 0;
        for ch in seg.chars() {
            if (ch as u32) < 0x20 || (ch.is_ascii() && LFN_REJECTS.contains(&(ch as u8))) {
                return Err(Error::InvalidName);
            }
            let mut units = [0u16; 2];
            for &u in ch.encode_utf16(&mut units).iter() {
                if di >= MAX_LFN {
                    return Err(Error::InvalidName);
                }
                name.lfn[di] = u;
                di += 1;
            }
        }

        if seg == "." || seg == ".." {
            name.len = di;
            name.sfn[..di].fill(b'.');
            name.flags = NS_DOT;
            return Ok(name);
        }

        while di > 0 && (name.lfn[di - 1] == u16::from(b' ') || name.lfn[di - 1] == u16::from(b'.')) {
            di -= 1;
        }
        name.lfn[di] = 0;
        name.len = di;
        if di == 0 {
            return Err(Error::InvalidName);
        }

        let (sfn, flags) = build_sfn(&name.lfn[..di]);
        name.sfn = sfn;
        name.flags = flags;
        Ok(name)
    }

    pub(crate) fn is_dot(&self) -> bool {
        self.flags & NS_DOT != 0
    }

    pub(crate) fn is_noname(&self) -> bool {
        self.flags & NS_NONAME != 0
    }

    pub(crate) fn needs_lfn(&self) -> bool {
        self.flags & NS_LFN != 0
    }

    pub(crate) fn is_lossy(&self) -> bool {
        self.flags & NS_LOSS != 0
    }
}

/// Map a UTF-16 unit onto the single byte character set used for short
/// names (Latin-1) and upper-case it. Returns 0 when there is no mapping.
fn oem_upper(wc: u16) -> u8 {
    if wc >= 0x100 {
        return 0;
    }
    let c = wc as u8;
    match c {
        b'a'..=b'z' => c - 0x20,
        0xE0..=0xFE if c != 0xF7 => c - 0x20,
        _ => c,
    }
}

/// Derive the 8.3 form of `lfn` (trimmed, non-empty) and the `NS_*` flags
/// describing how faithful it is.
fn build_sfn(lfn: &[u16]) -> ([u8; 11], u8) {
    let mut sfn = [b' '; 11];
    let mut cf = 0u8;
    let di_end = lfn.len();
    let at = |i: usize| if i < di_end { lfn[i] } else { 0 };

    let mut si = 0;
    while at(si) == u16::from(b' ') {
        si += 1;
    }
    if si > 0 || at(si) == u16::from(b'.') {
        cf |= NS_LOSS | NS_LFN;
    }
    // Index just past the last dot, 0 when there is none.
    let mut di = di_end;
    while di > 0 && lfn[di - 1] != u16::from(b'.') {
        di -= 1;
    }

    let mut i = 0;
    let mut ni = 8;
    let mut b = 0u8;
    loop {
        let wc = at(si);
        si += 1;
        if wc == 0 {
            break;
        }
        if wc == u16::from(b' ') || (wc == u16::from(b'.') && si != di) {
            cf |= NS_LOSS | NS_LFN;
            continue;
        }
        if i >= ni || si == di {
            if ni == 11 {
                cf |= NS_LOSS | NS_LFN;
                break;
            }
            if si != di {
                cf |= NS_LOSS | NS_LFN;
            }
            if si > di {
                break;
            }
            si = di;
            i = 8;
            ni = 11;
            b <<= 2;
            continue;
        }

        let mut c = if wc >= 0x80 {
            cf |= NS_LFN;
            oem_upper(wc)
        } else {
            wc as u8
        };
        if c == 0 || SFN_REJECTS.contains(&c) {
            c = b'_';
            cf |= NS_LOSS | NS_LFN;
        } else if c.is_ascii_uppercase() {
            b |= 2;
        } else if c.is_ascii_lowercase() {
            b |= 1;
            c -= 0x20;
        }
        sfn[i] = c;
        i += 1;
    }

    if sfn[0] == DELETED {
        sfn[0] = DELETED_SUBSTITUTE;
    }
    if ni == 8 {
        b <<= 2;
    }
    if b & 0x0C == 0x0C || b & 0x03 == 0x03 {
        cf |= NS_LFN;
    }
    if cf & NS_LFN == 0 {
        if b & 0x01 != 0 {
            cf |= NS_EXT;
        }
        if b & 0x04 != 0 {
            cf |= NS_BODY;
        }
    }
    (sfn, cf)
}

/// Short name `src` with numeric tail number `seq` appended to the body.
/// Past a handful of collisions the tail is a hash of the long name.
pub(crate) fn gen_numname(src: &[u8; 11], lfn: &LfnBuf, seq: u32) -> [u8; 11] {
    let mut dst = *src;
    let mut seq = seq;
    if seq > 5 {
        // CRC-CCITT of the long name, seeded with the sequence number
        let mut sreg = seq;
        for &wc in &lfn[..lfn_len(lfn)] {
            let mut wc = wc;
            for _ in 0..16 {
                sreg = (sreg << 1) + u32::from(wc & 1);
                wc >>= 1;
                if sreg & 0x1_0000 != 0 {
                    sreg ^= 0x1_1021;
                }
            }
        }
        seq = sreg;
    }

    let mut ns = [0u8; 8];
    let mut i = 7;
    loop {
        let mut c = (seq % 16) as u8 + b'0';
        seq /= 16;
        if c > b'9' {
            c += 7;
        }
        ns[i] = c;
        i -= 1;
        if i == 0 || seq == 0 {
            break;
        }
    }
    ns[i] = b'~';

    let mut j = 0;
    while j < i && dst[j] != b' ' {
        j += 1;
    }
    while j < 8 {
        dst[j] = if i < 8 {
            let c = ns[i];
            i += 1;
            c
        } else {
            b' '
        };
        j += 1;
    }
    dst
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
