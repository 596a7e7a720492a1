//! Whole-volume scenarios: nested files, filling the disk, moving
//! directories between parents.

use byteorder::{ByteOrder, LittleEndian};
use fatcore::{Error, FatType, FormatKind, Mode};

mod utils;

#[test]
fn nested_file_round_trip() {
    let mut fs = utils::make_filesystem(FormatKind::Any, 16);
    assert_eq!(fs.fat_type(), Some(FatType::Fat16));

    // Parents are not created on the way.
    assert_eq!(
        fs.open("/a/b/c.txt", Mode::ReadWriteCreate).unwrap_err(),
        Error::NoPath
    );
    fs.mkdir("/a").expect("mkdir a");
    fs.mkdir("/a/b").expect("mkdir b");

    let data = utils::pattern(5000, 1);
    let mut f = fs.open("/a/b/c.txt", Mode::ReadWriteCreate).expect("create");
    assert_eq!(fs.write(&mut f, &data), Ok(5000));
    assert_eq!(f.tell(), 5000);
    fs.close(f).expect("close");

    let mut f = fs.open("/a/b/c.txt", Mode::ReadOnly).expect("reopen");
    assert_eq!(f.size(), 5000);
    let mut back = vec![0u8; 6000];
    assert_eq!(fs.read(&mut f, &mut back), Ok(5000));
    assert!(f.eof());
    fs.close(f).expect("close");
    assert_eq!(utils::digest(&back[..5000]), utils::digest(&data));

    // And from a fresh mount
    fs.mount(0, true).expect("remount");
    assert_eq!(utils::read_file(&mut fs, "a/b/c.txt").unwrap(), data);
    assert_eq!(utils::list_dir(&mut fs, "/a").unwrap(), ["b"]);
}

fn fill_then_free(kind: FormatKind, mib: usize) {
    let mut fs = utils::make_filesystem(kind, mib);
    let before = fs.getfree().expect("getfree");
    assert!(before.free_clusters > 0);

    let chunk = utils::pattern(3 * 1024, 2);
    let mut f = fs.open("hog.bin", Mode::ReadWriteCreate).expect("create");
    let mut written = 0u64;
    loop {
        match fs.write(&mut f, &chunk) {
            Ok(n) => {
                written += n as u64;
                if n < chunk.len() {
                    // The volume just filled up; the next write gets nothing.
                    assert_eq!(fs.write(&mut f, &chunk), Err(Error::DiskFull));
                    break;
                }
            }
            Err(Error::DiskFull) => break,
            Err(e) => panic!("write failed: {:?}", e),
        }
    }
    assert_eq!(f.size(), written);
    // Running out of space is not a handle failure.
    assert_eq!(f.error(), None);
    fs.close(f).expect("close");

    let full = fs.getfree().expect("getfree");
    assert_eq!(full.free_clusters, 0);
    assert_eq!(
        written,
        u64::from(before.free_clusters) * u64::from(before.cluster_size)
    );
    assert_eq!(fs.stat("hog.bin").unwrap().size, written);

    fs.unlink("hog.bin").expect("unlink");
    assert_eq!(fs.getfree().unwrap().free_clusters, before.free_clusters);

    // A fresh count agrees with the running one.
    fs.mount(0, true).expect("remount");
    assert_eq!(fs.getfree().unwrap().free_clusters, before.free_clusters);
}

#[test]
fn fill_and_reclaim_fat12() {
    fill_then_free(FormatKind::Fat, 4);
}

#[test]
fn fill_and_reclaim_exfat() {
    fill_then_free(FormatKind::ExFat, 8);
}

/// Just enough FAT32 reading to check what the engine wrote.
struct Fat32Image<'a> {
    img: &'a [u8],
    fat: usize,
    data: usize,
    cluster: usize,
    root: u32,
}

impl<'a> Fat32Image<'a> {
    fn new(img: &'a [u8]) -> Fat32Image<'a> {
        let bps = usize::from(LittleEndian::read_u16(&img[11..]));
        let spc = usize::from(img[13]);
        let rsvd = usize::from(LittleEndian::read_u16(&img[14..]));
        let n_fats = usize::from(img[16]);
        let fat_sz = LittleEndian::read_u32(&img[36..]) as usize;
        Fat32Image {
            img,
            fat: rsvd * bps,
            data: (rsvd + n_fats * fat_sz) * bps,
            cluster: spc * bps,
            root: LittleEndian::read_u32(&img[44..]),
        }
    }

    fn entries(&self, first: u32) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        let mut cl = first;
        while (2..0x0FFF_FFF8).contains(&cl) {
            let start = self.data + (cl as usize - 2) * self.cluster;
            out.extend(self.img[start..start + self.cluster].chunks(32));
            cl = LittleEndian::read_u32(&self.img[self.fat + 4 * cl as usize..]) & 0x0FFF_FFFF;
        }
        out
    }

    fn lookup(&self, dir: u32, name: &[u8; 11]) -> &'a [u8] {
        self.entries(dir)
            .into_iter()
            .find(|e| &e[..11] == name && e[11] != 0x0F)
            .expect("entry on disk")
    }
}

fn first_cluster(entry: &[u8]) -> u32 {
    u32::from(LittleEndian::read_u16(&entry[20..])) << 16
        | u32::from(LittleEndian::read_u16(&entry[26..]))
}

#[test]
fn moved_directory_follows_its_parent() {
    let mut fs = utils::make_filesystem(FormatKind::Fat32, 40);
    assert_eq!(fs.fat_type(), Some(FatType::Fat32));
    fs.mkdir("src").unwrap();
    fs.mkdir("dst").unwrap();
    fs.mkdir("src/moved").unwrap();
    utils::write_file(&mut fs, "src/moved/inner.txt", b"still here").unwrap();

    fs.rename("src/moved", "dst/moved").expect("rename across parents");
    assert_eq!(fs.stat("src/moved").unwrap_err(), Error::NotFound);
    assert!(fs.stat("dst/moved").unwrap().attributes.is_directory());
    assert_eq!(
        utils::read_file(&mut fs, "dst/moved/inner.txt").unwrap(),
        b"still here"
    );
    {
        let img = Fat32Image::new(fs.device().as_bytes());
        let dst = first_cluster(img.lookup(img.root, b"DST        "));
        let moved = first_cluster(img.lookup(dst, b"MOVED      "));
        let dotdot = img.entries(moved)[1];
        assert_eq!(&dotdot[..2], b"..");
        assert_eq!(first_cluster(dotdot), dst);
        assert!(img.entries(first_cluster(img.lookup(img.root, b"SRC        ")))
            .iter()
            .all(|e| &e[..11] != b"MOVED      " || e[0] == 0xE5));
    }

    // Into the root, where ".." holds 0.
    fs.rename("dst/moved", "/moved").expect("rename to root");
    {
        let img = Fat32Image::new(fs.device().as_bytes());
        let moved = first_cluster(img.lookup(img.root, b"MOVED      "));
        assert_eq!(first_cluster(img.entries(moved)[1]), 0);
    }
    assert_eq!(utils::list_dir(&mut fs, "moved").unwrap(), ["inner.txt"]);
}

#[test]
fn rename_rules() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 4);
    utils::write_file(&mut fs, "one.txt", b"1").unwrap();
    utils::write_file(&mut fs, "two.txt", b"2").unwrap();
    assert_eq!(fs.rename("one.txt", "two.txt"), Err(Error::AlreadyExists));
    assert_eq!(fs.rename("none.txt", "x.txt"), Err(Error::NotFound));
    assert_eq!(fs.rename("one.txt", "/"), Err(Error::InvalidName));
    // Changing only the case of a name is allowed.
    fs.rename("one.txt", "ONE.txt").expect("case change");
    assert_eq!(fs.stat("one.txt").unwrap().name.as_str(), "ONE.txt");
    assert_eq!(utils::read_file(&mut fs, "ONE.TXT").unwrap(), b"1");
}

#[test]
fn directories_cannot_move_below_themselves() {
    for kind in [FormatKind::Fat, FormatKind::ExFat] {
        let mut fs = utils::make_filesystem(kind, 16);
        fs.mkdir("p").unwrap();
        fs.mkdir("p/q").unwrap();
        utils::write_file(&mut fs, "p/q/keep.txt", b"kept").unwrap();

        assert_eq!(fs.rename("/p", "/p/q/r"), Err(Error::InvalidName));
        assert_eq!(fs.rename("/p", "/p/r"), Err(Error::InvalidName));
        assert_eq!(fs.rename("p/q", "p/q/../q/r"), Err(Error::InvalidName));
        assert_eq!(utils::list_dir(&mut fs, "/").unwrap(), ["p"]);
        assert_eq!(utils::list_dir(&mut fs, "p").unwrap(), ["q"]);
        assert_eq!(utils::list_dir(&mut fs, "p/q").unwrap(), ["keep.txt"]);

        // Sideways and upwards moves are fine, even through "..".
        fs.rename("p/q", "p/q/../r").expect("rename in place");
        fs.rename("p/r", "/r").expect("move up");
        fs.rename("/p", "/r/p").expect("move into a sibling");
        assert_eq!(utils::read_file(&mut fs, "r/keep.txt").unwrap(), b"kept");
        assert_eq!(utils::list_dir(&mut fs, "r").unwrap(), ["keep.txt", "p"]);
    }
}

#[test]
fn open_objects_are_locked() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 4);
    fs.mkdir("logs").unwrap();
    utils::write_file(&mut fs, "logs/today.txt", b"busy").unwrap();

    let dir = fs.opendir("logs").unwrap();
    assert_eq!(fs.unlink("logs"), Err(Error::Locked));
    assert_eq!(fs.rename("logs", "old"), Err(Error::Locked));
    fs.closedir(dir).unwrap();
    // Still not empty
    assert_eq!(fs.unlink("logs"), Err(Error::Denied));

    let f = fs.open("logs/today.txt", Mode::ReadOnly).unwrap();
    assert_eq!(fs.unlink("logs/today.txt"), Err(Error::Locked));
    assert_eq!(
        fs.open("logs/today.txt", Mode::ReadWrite).unwrap_err(),
        Error::Locked
    );
    fs.close(f).unwrap();
    assert_eq!(fs.open_objects(), 0);

    fs.unlink("logs/today.txt").unwrap();
    fs.rename("logs", "old").unwrap();
    fs.unlink("old").unwrap();
    assert!(utils::list_dir(&mut fs, "/").unwrap().is_empty());
}

#[test]
fn listing_restarts_and_free_space_in_bytes() {
    let mut fs = utils::make_filesystem(FormatKind::Fat, 16);
    for name in ["x", "y", "z"] {
        utils::write_file(&mut fs, name, name.as_bytes()).unwrap();
    }
    let mut dir = fs.opendir("/").unwrap();
    let first = fs.readdir(&mut dir).unwrap().expect("an entry");
    assert_eq!(first.name.as_str(), "x");
    while fs.readdir(&mut dir).unwrap().is_some() {}
    assert!(fs.readdir(&mut dir).unwrap().is_none());
    fs.rewinddir(&mut dir).unwrap();
    assert_eq!(fs.readdir(&mut dir).unwrap().unwrap().name.as_str(), "x");
    fs.closedir(dir).unwrap();

    let stats = fs.getfree().unwrap();
    assert_eq!(
        stats.free_bytes(),
        u64::from(stats.free_clusters) * u64::from(stats.cluster_size)
    );
    assert!(stats.free_clusters < stats.total_clusters);
}
