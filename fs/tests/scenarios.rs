//! Integration tests for the six scenarios spec'd as acceptance seeds:
//! growth across addressing-tier boundaries, concurrent open/remove,
//! directory lifecycle, name collision, deny-write, and readdir stability.

mod common;

use fs::error::FsError;
use fs::inode::DIRECT_COUNT;
use fs::mount::Filesystem;
use fs::path::Handle;
use fs::task::SingleTask;
use fs_device::SECTOR_SIZE;

use common::{disk_cleanup, disk_prep_path, NSECTORS};

fn as_file(handle: Handle) -> fs::path::FileHandle {
    match handle {
        Handle::File(f) => f,
        Handle::Dir(_) => panic!("expected a file handle"),
    }
}

fn as_dir(handle: Handle) -> fs::directory::Directory {
    match handle {
        Handle::Dir(d) => d,
        Handle::File(_) => panic!("expected a directory handle"),
    }
}

#[test]
fn grow_across_indirect_boundary_and_survive_remount() {
    let path = disk_prep_path("grow-boundary");
    let fs = Filesystem::format(&path, NSECTORS).unwrap();
    let task = SingleTask::new();

    fs.create(&task, "/a", 0, false).unwrap();
    let handle = fs.open(&task, "/a").unwrap();
    let file = as_file(handle);

    // 63000 bytes lands past the 123-sector direct range (123*512=62976),
    // inside the indirect block.
    assert!(63000 >= DIRECT_COUNT as u64 * SECTOR_SIZE);
    fs.seek(&file, 63000);
    fs.write(&file, b"X").unwrap();
    assert_eq!(fs.length(&file), 63001);

    fs.seek(&file, 0);
    let mut head = vec![0xFFu8; 100];
    let read = fs.read(&file, &mut head).unwrap();
    assert_eq!(read, 100);
    assert!(head.iter().all(|b| *b == 0), "gap should read back as zero");

    fs.seek(&file, 63000);
    let mut one = [0u8; 1];
    fs.read(&file, &mut one).unwrap();
    assert_eq!(one[0], b'X');

    fs.close(Handle::File(file)).unwrap();
    let device = fs.unmount().unwrap();
    drop(device);

    let fs2 = Filesystem::mount(&path, NSECTORS).unwrap();
    let task2 = SingleTask::new();
    let file2 = as_file(fs2.open(&task2, "/a").unwrap());
    assert_eq!(fs2.length(&file2), 63001);
    fs2.seek(&file2, 63000);
    let mut one = [0u8; 1];
    fs2.read(&file2, &mut one).unwrap();
    assert_eq!(one[0], b'X');
    fs2.close(Handle::File(file2)).unwrap();
    drop(fs2.unmount().unwrap());

    disk_cleanup(&path);
}

#[test]
fn concurrent_open_and_remove() {
    let path = disk_prep_path("open-remove");
    let fs = Filesystem::format(&path, NSECTORS).unwrap();
    let task_a = SingleTask::new();
    let task_b = SingleTask::new();

    fs.create(&task_a, "/f", 10, false).unwrap();
    let ha = as_file(fs.open(&task_a, "/f").unwrap());
    fs.write(&ha, b"helloworld").unwrap();
    fs.seek(&ha, 0);

    fs.remove(&task_b, "/f").unwrap();
    assert!(matches!(fs.open(&task_b, "/f"), Err(FsError::NotFound(_))));

    let mut buf = vec![0u8; 10];
    fs.read(&ha, &mut buf).unwrap();
    assert_eq!(&buf, b"helloworld");

    fs.close(Handle::File(ha)).unwrap();
    drop(fs.unmount().unwrap());
    disk_cleanup(&path);
}

#[test]
fn directory_lifecycle() {
    let path = disk_prep_path("dir-lifecycle");
    let fs = Filesystem::format(&path, NSECTORS).unwrap();
    let mut task = SingleTask::new();

    fs.mkdir(&task, "/d").unwrap();
    fs.mkdir(&task, "/d/e").unwrap();
    fs.chdir(&mut task, "/d").unwrap();

    let parent = as_dir(fs.open(&task, "..").unwrap());
    assert_eq!(parent.sector(), fs::mount::ROOT_DIR_SECTOR);
    fs.close(Handle::Dir(parent)).unwrap();

    let here = as_dir(fs.open(&task, ".").unwrap());
    fs.close(Handle::Dir(here)).unwrap();

    fs.remove(&task, "e").unwrap();
    fs.chdir(&mut task, "/").unwrap();
    fs.remove(&task, "/d").unwrap();

    assert!(fs.remove(&task, "/").is_err());

    drop(fs.unmount().unwrap());
    disk_cleanup(&path);
}

#[test]
fn name_collision_rejected() {
    let path = disk_prep_path("name-collision");
    let fs = Filesystem::format(&path, NSECTORS).unwrap();
    let task = SingleTask::new();

    fs.create(&task, "/x", 0, false).unwrap();
    assert!(matches!(
        fs.create(&task, "/x", 0, false),
        Err(FsError::Exists(_))
    ));
    assert!(matches!(fs.mkdir(&task, "/x"), Err(FsError::Exists(_))));

    drop(fs.unmount().unwrap());
    disk_cleanup(&path);
}

#[test]
fn deny_write_blocks_other_handles() {
    let path = disk_prep_path("deny-write");
    let fs = Filesystem::format(&path, NSECTORS).unwrap();
    let task = SingleTask::new();

    fs.create(&task, "/p", 0, false).unwrap();
    let h1 = as_file(fs.open(&task, "/p").unwrap());
    let h2 = as_file(fs.open(&task, "/p").unwrap());

    fs.deny_write(&h1);
    assert!(matches!(fs.write(&h2, b"nope"), Err(FsError::DenyWrite)));

    fs.allow_write(&h1);
    assert_eq!(fs.write(&h2, b"ok").unwrap(), 2);

    fs.close(Handle::File(h1)).unwrap();
    fs.close(Handle::File(h2)).unwrap();
    drop(fs.unmount().unwrap());
    disk_cleanup(&path);
}

#[test]
fn readdir_is_stable_and_skips_dot_entries() {
    let path = disk_prep_path("readdir-stable");
    let fs = Filesystem::format(&path, NSECTORS).unwrap();
    let task = SingleTask::new();

    fs.mkdir(&task, "/d").unwrap();
    fs.create(&task, "/d/a", 0, false).unwrap();
    fs.create(&task, "/d/b", 0, false).unwrap();
    fs.create(&task, "/d/c", 0, false).unwrap();

    let dir = as_dir(fs.open(&task, "/d").unwrap());
    let mut seen = Vec::new();
    while let Some(name) = fs.readdir(&dir).unwrap() {
        seen.push(name);
    }
    seen.sort();
    assert_eq!(seen, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert!(!seen.iter().any(|n| n == "." || n == ".."));

    fs.close(Handle::Dir(dir)).unwrap();
    drop(fs.unmount().unwrap());
    disk_cleanup(&path);
}
