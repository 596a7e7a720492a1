//! Useful library code for tests

#![allow(dead_code)]

use std::io::prelude::*;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use fatcore::{
    Error, FileSystem, FormatKind, MkfsOptions, Mode, RamDisk, RamDiskError, TimeSource,
    Timestamp,
};
use sha2::{Digest, Sha256};

/// The device every test runs on.
pub type Disk = RamDisk<Vec<u8>>;

/// A filesystem over a [`Disk`] with the default limits.
pub type TestFs = FileSystem<Disk, TestTimeSource>;

/// Shorthand for results in tests.
pub type TestResult<T> = Result<T, Error<RamDiskError>>;

/// A time source that always reports the same moment.
#[derive(Debug, Clone)]
pub struct TestTimeSource {
    fixed: NaiveDateTime,
}

impl TestTimeSource {
    /// The moment this clock reports.
    pub fn now(&self) -> NaiveDateTime {
        self.fixed
    }
}

impl TimeSource for TestTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        to_timestamp(&self.fixed)
    }
}

/// Convert a chrono date into the engine's timestamp.
pub fn to_timestamp(when: &NaiveDateTime) -> Timestamp {
    Timestamp::from_calendar(
        when.year() as u16,
        when.month() as u8,
        when.day() as u8,
        when.hour() as u8,
        when.minute() as u8,
        when.second() as u8,
    )
    .unwrap()
}

/// Make a new time source that reports a fixed date (2024-03-14 15:09:26;
/// an even second, so FAT can store it exactly).
pub fn make_time_source() -> TestTimeSource {
    TestTimeSource {
        fixed: NaiveDate::from_ymd_opt(2024, 3, 14)
            .unwrap()
            .and_hms_opt(15, 9, 26)
            .unwrap(),
    }
}

/// A zeroed disk of `mib` MiB with 512 byte sectors.
pub fn make_block_device(mib: usize) -> Disk {
    RamDisk::new(vec![0u8; mib * 1024 * 1024], 512)
}

/// Format a `mib` MiB disk as `kind` and mount it.
pub fn make_filesystem(kind: FormatKind, mib: usize) -> TestFs {
    let mut fs = FileSystem::new(make_block_device(mib), make_time_source());
    fs.mkfs(&MkfsOptions {
        fmt: kind,
        ..MkfsOptions::default()
    })
    .expect("format");
    fs.mount(0, true).expect("mount");
    fs
}

/// Compress a disk image.
pub fn pack_image(image: &[u8]) -> Vec<u8> {
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::best());
    gz.write_all(image).expect("compress image");
    gz.finish().expect("finish image")
}

/// Turn a compressed image back into a disk.
pub fn unpack_image(packed: &[u8], sector_size: usize) -> Disk {
    let mut gz = flate2::read::GzDecoder::new(packed);
    let mut image = Vec::new();
    gz.read_to_end(&mut image).expect("decompress image");
    RamDisk::new(image, sector_size)
}

/// SHA-256 of some bytes.
pub fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `len` bytes that do not repeat with any short period, so misplaced
/// sectors show up.
pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

/// Create (or replace) `path` with `data`.
pub fn write_file(fs: &mut TestFs, path: &str, data: &[u8]) -> TestResult<()> {
    let mut f = fs.open(path, Mode::ReadWriteCreateOrTruncate)?;
    let n = fs.write(&mut f, data)?;
    assert_eq!(n, data.len(), "short write to {}", path);
    fs.close(f)
}

/// Read the whole of `path`, a few odd-sized chunks at a time.
pub fn read_file(fs: &mut TestFs, path: &str) -> TestResult<Vec<u8>> {
    let mut f = fs.open(path, Mode::ReadOnly)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 777];
    loop {
        let n = fs.read(&mut f, &mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert!(f.eof());
    fs.close(f)?;
    Ok(out)
}

/// Names of everything in the directory at `path`, in directory order.
pub fn list_dir(fs: &mut TestFs, path: &str) -> TestResult<Vec<String>> {
    let mut dir = fs.opendir(path)?;
    let mut names = Vec::new();
    while let Some(info) = fs.readdir(&mut dir)? {
        names.push(info.name.as_str().to_owned());
    }
    fs.closedir(dir)?;
    Ok(names)
}

/// The bitwise CRC-32 of GPT headers and partition arrays.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
