//! File handle tests: seeking, truncation, append mode, attributes and
//! what happens when the disk fails.

use fatcore::{Attributes, Error, FormatKind, Mode, RamDiskError, StickyError, Timestamp};

mod utils;

#[test]
fn seek_past_the_end_grows_the_file() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let free = fs.getfree().unwrap().free_clusters;
    let mut f = fs.open("sparse.bin", Mode::ReadWriteCreate).unwrap();
    fs.lseek(&mut f, 10_000).expect("extend");
    assert_eq!(f.tell(), 10_000);
    assert_eq!(f.size(), 10_000);
    assert_eq!(fs.write(&mut f, b"end"), Ok(3));
    assert_eq!(f.size(), 10_003);
    fs.close(f).unwrap();
    assert_eq!(fs.stat("sparse.bin").unwrap().size, 10_003);
    let stats = fs.getfree().unwrap();
    let clusters = (10_003 + stats.cluster_size - 1) / stats.cluster_size;
    assert_eq!(stats.free_clusters, free - clusters);

    // Read-only handles stop at the end.
    let mut f = fs.open("sparse.bin", Mode::ReadOnly).unwrap();
    fs.lseek(&mut f, 1_000_000).unwrap();
    assert_eq!(f.tell(), 10_003);
    assert!(f.eof());
    fs.lseek(&mut f, 10_000).unwrap();
    let mut tail = [0u8; 8];
    assert_eq!(fs.read(&mut f, &mut tail), Ok(3));
    assert_eq!(&tail[..3], b"end");
    fs.close(f).unwrap();
}

#[test]
fn truncate_frees_clusters() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let free = fs.getfree().unwrap().free_clusters;
    let data = utils::pattern(20_000, 7);
    utils::write_file(&mut fs, "cut.bin", &data).unwrap();

    let mut f = fs.open("cut.bin", Mode::ReadWrite).unwrap();
    fs.lseek(&mut f, 4000).unwrap();
    fs.truncate(&mut f).expect("truncate");
    assert_eq!(f.size(), 4000);
    assert!(f.eof());
    fs.close(f).unwrap();

    let stats = fs.getfree().unwrap();
    let kept = (4000 + stats.cluster_size - 1) / stats.cluster_size;
    assert_eq!(stats.free_clusters, free - kept);
    assert_eq!(utils::read_file(&mut fs, "cut.bin").unwrap(), &data[..4000]);

    // Cutting at 0 gives the whole chain back.
    let mut f = fs.open("cut.bin", Mode::ReadWrite).unwrap();
    fs.truncate(&mut f).unwrap();
    fs.close(f).unwrap();
    assert_eq!(fs.getfree().unwrap().free_clusters, free);
    assert_eq!(fs.stat("cut.bin").unwrap().size, 0);

    let mut f = fs.open("cut.bin", Mode::ReadOnly).unwrap();
    assert_eq!(fs.truncate(&mut f), Err(Error::Denied));
    fs.close(f).unwrap();
}

#[test]
fn append_and_truncate_modes() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    utils::write_file(&mut fs, "log.txt", b"abc").unwrap();

    let mut f = fs.open("log.txt", Mode::ReadWriteAppend).unwrap();
    assert_eq!(f.tell(), 3);
    fs.write(&mut f, b"def").unwrap();
    fs.close(f).unwrap();
    assert_eq!(utils::read_file(&mut fs, "log.txt").unwrap(), b"abcdef");

    let mut f = fs.open("fresh.txt", Mode::ReadWriteCreateOrAppend).unwrap();
    assert_eq!(f.tell(), 0);
    fs.write(&mut f, b"x").unwrap();
    fs.close(f).unwrap();

    let f = fs.open("log.txt", Mode::ReadWriteTruncate).unwrap();
    assert_eq!(f.size(), 0);
    fs.close(f).unwrap();
    assert_eq!(fs.stat("log.txt").unwrap().size, 0);
    assert_eq!(
        fs.open("missing.txt", Mode::ReadWriteTruncate).unwrap_err(),
        Error::NotFound
    );
}

#[test]
fn size_is_published_on_sync() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let mut f = fs.open("grow.txt", Mode::ReadWriteCreate).unwrap();
    fs.write(&mut f, &[0xCC; 64]).unwrap();
    // Nothing reaches the directory entry before a sync.
    assert_eq!(fs.stat("grow.txt").unwrap().size, 0);
    fs.sync(&mut f).unwrap();
    assert_eq!(fs.stat("grow.txt").unwrap().size, 64);
    fs.write(&mut f, &[0xDD; 64]).unwrap();
    fs.close(f).unwrap();
    assert_eq!(fs.stat("grow.txt").unwrap().size, 128);
}

#[test]
fn attributes_and_times() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    utils::write_file(&mut fs, "meta.txt", b"m").unwrap();
    let info = fs.stat("meta.txt").unwrap();
    assert!(info.attributes.is_archive());
    assert_eq!(
        info.modified,
        utils::to_timestamp(&utils::make_time_source().now())
    );

    fs.chmod(
        "meta.txt",
        Attributes::HIDDEN | Attributes::SYSTEM | Attributes::DIRECTORY,
        Attributes::CHANGEABLE | Attributes::DIRECTORY,
    )
    .unwrap();
    let attr = fs.stat("meta.txt").unwrap().attributes;
    assert!(attr.is_hidden() && attr.is_system());
    assert!(!attr.is_archive() && !attr.is_read_only());
    // The directory bit is not ours to change.
    assert!(!attr.is_directory());

    let when = Timestamp::from_calendar(2001, 2, 3, 4, 5, 6).unwrap();
    fs.utime("meta.txt", when).unwrap();
    assert_eq!(fs.stat("meta.txt").unwrap().modified, when);
    assert_eq!(fs.utime("nothing", when), Err(Error::NotFound));
    assert_eq!(fs.chmod("/", 0, 0), Err(Error::InvalidName));
}

#[test]
fn failed_transfers_stick_to_the_handle() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let data = utils::pattern(20_000, 3);
    utils::write_file(&mut fs, "big.bin", &data).unwrap();
    utils::write_file(&mut fs, "small.txt", b"hello").unwrap();
    fs.mount(0, true).unwrap();

    let mut f = fs.open("big.bin", Mode::ReadOnly).unwrap();
    fs.device().fail_after(2);
    let mut buf = vec![0u8; 20_000];
    assert_eq!(
        fs.read(&mut f, &mut buf),
        Err(Error::DeviceError(RamDiskError::Injected))
    );
    assert_eq!(f.error(), Some(StickyError::Disk));
    fs.device().heal();
    assert_eq!(fs.read(&mut f, &mut buf), Err(Error::DiskFault));
    assert_eq!(fs.lseek(&mut f, 0), Err(Error::DiskFault));
    // Closing still releases the handle.
    fs.close(f).unwrap();
    assert_eq!(fs.open_objects(), 0);

    // The volume itself is fine and nothing stale is served.
    assert_eq!(utils::read_file(&mut fs, "small.txt").unwrap(), b"hello");
    assert_eq!(
        utils::digest(&utils::read_file(&mut fs, "big.bin").unwrap()),
        utils::digest(&data)
    );
}

#[test]
fn failed_write_sticks_too() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let mut f = fs.open("w.bin", Mode::ReadWriteCreate).unwrap();
    fs.device().fail_after(0);
    let chunk = utils::pattern(8192, 4);
    assert_eq!(
        fs.write(&mut f, &chunk),
        Err(Error::DeviceError(RamDiskError::Injected))
    );
    fs.device().heal();
    assert_eq!(fs.write(&mut f, &chunk), Err(Error::DiskFault));
    assert_eq!(fs.sync(&mut f), Err(Error::DiskFault));
    fs.close(f).unwrap();
    // A new handle starts clean.
    let mut f = fs.open("w.bin", Mode::ReadWriteCreateOrTruncate).unwrap();
    assert_eq!(fs.write(&mut f, &chunk), Ok(8192));
    fs.close(f).unwrap();
}

#[test]
fn mount_errors_propagate_and_retry() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    utils::write_file(&mut fs, "keep.txt", b"kept").unwrap();
    fs.device().fail_after(0);
    assert_eq!(
        fs.mount(0, true),
        Err(Error::DeviceError(RamDiskError::Injected))
    );
    assert_eq!(
        fs.stat("keep.txt").unwrap_err(),
        Error::DeviceError(RamDiskError::Injected)
    );
    fs.device().heal();
    // The failed mount is still pending and happens on the next call.
    assert_eq!(fs.stat("keep.txt").unwrap().size, 4);
}

#[test]
fn colliding_short_names_get_tails() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let mut shorts = Vec::new();
    for i in 0..10 {
        let name = format!("Quarterly Report {}.txt", i);
        utils::write_file(&mut fs, &name, name.as_bytes()).unwrap();
        let info = fs.stat(&name).unwrap();
        assert_eq!(info.name.as_str(), name);
        shorts.push(info.short_name.as_str().to_owned());
    }
    let mut unique = shorts.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 10);
    // Later collisions switch to hashed tails, which leave less of the body.
    assert!(shorts
        .iter()
        .all(|s| s.starts_with("QUA") && s.contains('~') && s.ends_with(".TXT")));

    // Each one leads back to its own file.
    for (i, short) in shorts.iter().enumerate() {
        let info = fs.stat(short).unwrap();
        assert_eq!(info.name.as_str(), format!("Quarterly Report {}.txt", i));
        assert_eq!(utils::read_file(&mut fs, short).unwrap(), info.name.as_bytes());
    }
}

#[test]
fn invalid_names() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    for bad in ["a*b", "what?", "pipe|", "quote\"", "<x>"] {
        assert_eq!(
            fs.open(bad, Mode::ReadWriteCreate).unwrap_err(),
            Error::InvalidName,
            "{}",
            bad
        );
    }
    let long = "n".repeat(256);
    assert_eq!(
        fs.open(&long, Mode::ReadWriteCreate).unwrap_err(),
        Error::InvalidName
    );
    let longest = "n".repeat(255);
    let f = fs.open(&longest, Mode::ReadWriteCreate).unwrap();
    fs.close(f).unwrap();
    assert_eq!(fs.stat(&longest).unwrap().name.len(), 255);
}

#[test]
fn stat_after_listing_reports_its_own_name() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let names = ["First Long Name.txt", "Second Long Name.txt", "plain.txt"];
    for name in names {
        utils::write_file(&mut fs, name, name.as_bytes()).unwrap();
    }
    assert_eq!(utils::list_dir(&mut fs, "/").unwrap(), names);

    // The listing left the last long name behind; each lookup must collect
    // its own.
    let first = fs.stat("First Long Name.txt").unwrap();
    assert_eq!(first.name.as_str(), "First Long Name.txt");
    assert_eq!(first.short_name.as_str(), "FIRSTL~1.TXT");
    assert_eq!(first.size, 19);

    let second = fs.stat("second long name.TXT").unwrap();
    assert_eq!(second.name.as_str(), "Second Long Name.txt");
    assert_eq!(second.short_name.as_str(), "SECOND~1.TXT");

    // A name without long entries right after one with them.
    assert_eq!(fs.stat("plain.txt").unwrap().name.as_str(), "plain.txt");
    // Looking a file up by its 8.3 alias still reports the long name.
    assert_eq!(
        fs.stat("FIRSTL~1.TXT").unwrap().name.as_str(),
        "First Long Name.txt"
    );

    let mut dir = fs.opendir("/").unwrap();
    let listed = fs.readdir(&mut dir).unwrap().unwrap();
    assert_eq!(listed.short_name.as_str(), "FIRSTL~1.TXT");
    fs.closedir(dir).unwrap();
}

/// Write `rounds` clusters to `name`, interleaved with another file so that
/// every cluster of `name` is a fragment of its own.
fn fragmented(fs: &mut utils::TestFs, name: &str, rounds: usize) -> Vec<u8> {
    let bcs = fs.getfree().unwrap().cluster_size as usize;
    let data = utils::pattern(rounds * bcs, rounds as u32);
    let mut f = fs.open(name, Mode::ReadWriteCreate).unwrap();
    let mut other = fs.open("spacer.bin", Mode::ReadWriteCreateOrTruncate).unwrap();
    for piece in data.chunks(bcs) {
        assert_eq!(fs.write(&mut f, piece), Ok(bcs));
        assert_eq!(fs.write(&mut other, piece), Ok(bcs));
    }
    fs.close(other).unwrap();
    fs.close(f).unwrap();
    data
}

#[test]
fn fast_seek_follows_fragmented_files() {
    for kind in [FormatKind::Fat, FormatKind::ExFat] {
        let mut fs = utils::make_filesystem(kind, 16);
        let bcs = fs.getfree().unwrap().cluster_size as usize;
        let data = fragmented(&mut fs, "frag.bin", 4);

        let mut f = fs.open("frag.bin", Mode::ReadWrite).unwrap();
        assert!(!f.fast_seek());
        assert_eq!(fs.enable_fast_seek(&mut f), Ok(4));
        assert!(f.fast_seek());
        for ofs in [3 * bcs + 17, 5, bcs, 2 * bcs - 1, 0, 4 * bcs - 30] {
            fs.lseek(&mut f, ofs as u64).unwrap();
            let mut buf = [0u8; 100];
            let n = fs.read(&mut f, &mut buf).unwrap();
            assert_eq!(n, 100.min(data.len() - ofs), "at {}", ofs);
            assert_eq!(&buf[..n], &data[ofs..ofs + n], "at {}", ofs);
        }

        // Overwrites cross fragment boundaries, but the file cannot grow.
        fs.lseek(&mut f, bcs as u64 - 2).unwrap();
        assert_eq!(fs.write(&mut f, b"WXYZ"), Ok(4));
        fs.lseek(&mut f, 10 * bcs as u64).unwrap();
        assert_eq!(f.tell(), data.len() as u64);
        assert_eq!(fs.write(&mut f, b"more"), Ok(0));
        fs.lseek(&mut f, bcs as u64 - 2).unwrap();
        let mut four = [0u8; 4];
        assert_eq!(fs.read(&mut f, &mut four), Ok(4));
        assert_eq!(&four, b"WXYZ");

        // Truncating turns fast seeking off; the handle keeps working.
        fs.lseek(&mut f, 10).unwrap();
        fs.truncate(&mut f).unwrap();
        assert!(!f.fast_seek());
        assert_eq!(fs.write(&mut f, b"tail"), Ok(4));
        fs.close(f).unwrap();

        let mut expected = data[..10].to_vec();
        expected.extend_from_slice(b"tail");
        assert_eq!(utils::read_file(&mut fs, "frag.bin").unwrap(), expected);
    }
}

#[test]
fn fast_seek_needs_few_fragments() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let data = fragmented(&mut fs, "scattered.bin", fatcore::MAX_LINK_FRAGMENTS + 1);

    let mut f = fs.open("scattered.bin", Mode::ReadOnly).unwrap();
    assert_eq!(fs.enable_fast_seek(&mut f), Err(Error::TooFragmented));
    assert!(!f.fast_seek());
    assert_eq!(f.error(), None);
    let mut all = vec![0u8; data.len()];
    assert_eq!(fs.read(&mut f, &mut all), Ok(data.len()));
    assert_eq!(all, data);

    // An empty file maps to nothing at all.
    utils::write_file(&mut fs, "empty.bin", b"").unwrap();
    let mut e = fs.open("empty.bin", Mode::ReadOnly).unwrap();
    assert_eq!(fs.enable_fast_seek(&mut e), Ok(0));
    fs.disable_fast_seek(&mut e);
    assert!(!e.fast_seek());
    fs.close(e).unwrap();
    fs.close(f).unwrap();
}

#[test]
fn text_lines_and_streaming() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    let mut f = fs.open("notes.txt", Mode::ReadWriteCreate).unwrap();
    for i in 0..3 {
        let n = fs.print(&mut f, format_args!("line {} of {}\n", i, 3)).unwrap();
        assert_eq!(n, 12);
    }
    assert_eq!(fs.print(&mut f, format_args!("no newline")), Ok(10));
    fs.close(f).unwrap();

    let mut f = fs.open("notes.txt", Mode::ReadOnly).unwrap();
    let mut line = [0u8; 64];
    assert_eq!(fs.read_line(&mut f, &mut line), Ok(12));
    assert_eq!(&line[..12], b"line 0 of 3\n");
    // A short buffer takes part of the line; the rest comes next.
    assert_eq!(fs.read_line(&mut f, &mut line[..4]), Ok(4));
    assert_eq!(&line[..4], b"line");
    assert_eq!(fs.read_line(&mut f, &mut line), Ok(8));
    assert_eq!(&line[..8], b" 1 of 3\n");
    assert_eq!(fs.read_line(&mut f, &mut line), Ok(12));
    assert_eq!(fs.read_line(&mut f, &mut line), Ok(10));
    assert_eq!(&line[..10], b"no newline");
    assert_eq!(fs.read_line(&mut f, &mut line), Ok(0));
    fs.close(f).unwrap();

    // Streaming stops where the consumer does, and picks up from there.
    let data = utils::pattern(3000, 9);
    utils::write_file(&mut fs, "stream.bin", &data).unwrap();
    let mut f = fs.open("stream.bin", Mode::ReadOnly).unwrap();
    let mut out = Vec::new();
    let taken = fs
        .forward(&mut f, 5000, |chunk| {
            assert!(chunk.len() <= 512);
            let room = 1000 - out.len();
            let n = chunk.len().min(room);
            out.extend_from_slice(&chunk[..n]);
            n
        })
        .unwrap();
    assert_eq!(taken, 1000);
    assert_eq!(f.tell(), 1000);
    let rest = fs
        .forward(&mut f, 5000, |chunk| {
            out.extend_from_slice(chunk);
            chunk.len()
        })
        .unwrap();
    assert_eq!(rest, 2000);
    assert_eq!(out, data);
    fs.close(f).unwrap();
}
