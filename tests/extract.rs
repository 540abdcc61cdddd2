//! Extraction scenarios driven through real tar archives in temp dirs.

use std::io::Cursor;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use fetchtar::config::Config;
use fetchtar::error::FetchError;
use fetchtar::extract::extract_tar;
use tar::{Builder, EntryType, Header};

fn header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(size);
    header
}

fn add_dir(builder: &mut Builder<Vec<u8>>, path: &str) {
    let mut h = header(EntryType::Directory, 0o755, 0);
    builder.append_data(&mut h, path, std::io::empty()).unwrap();
}

fn add_file(builder: &mut Builder<Vec<u8>>, path: &str, contents: &[u8]) {
    let mut h = header(EntryType::Regular, 0o644, contents.len() as u64);
    builder.append_data(&mut h, path, contents).unwrap();
}

fn add_link(builder: &mut Builder<Vec<u8>>, entry_type: EntryType, path: &str, target: &str) {
    let mut h = header(entry_type, 0o644, 0);
    h.set_link_name(target).unwrap();
    builder.append_data(&mut h, path, std::io::empty()).unwrap();
}

async fn run_extract(archive: Vec<u8>, dir: &Path, config: Config) -> Result<(), FetchError> {
    let dir = dir.to_path_buf();
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        extract_tar(Cursor::new(archive), &dir, &config, handle)
    })
    .await
    .expect("extract task panicked")
}

#[tokio::test(flavor = "multi_thread")]
async fn extracts_files_dirs_and_links() {
    let mut builder = Builder::new(Vec::new());
    add_dir(&mut builder, "top/");
    add_dir(&mut builder, "top/nested/");
    for i in 0..20 {
        add_file(
            &mut builder,
            &format!("top/nested/file-{i}.bin"),
            format!("contents of file {i}").as_bytes(),
        );
    }
    // Hard link whose target was dispatched to the writer pool moments ago.
    add_link(&mut builder, EntryType::Link, "top/link.bin", "top/nested/file-7.bin");
    // Dangling symlink: allowed, the target never has to exist.
    add_link(&mut builder, EntryType::Symlink, "top/dangling", "no/such/file");
    let archive = builder.into_inner().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        write_workers: 4,
        ..Config::default()
    };
    run_extract(archive, tmp.path(), config).await.unwrap();

    for i in 0..20 {
        let path = tmp.path().join(format!("top/nested/file-{i}.bin"));
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, format!("contents of file {i}").as_bytes());
    }

    let target = tmp.path().join("top/nested/file-7.bin").metadata().unwrap();
    let link = tmp.path().join("top/link.bin").metadata().unwrap();
    assert_eq!(target.ino(), link.ino(), "hard link must share the inode");
    assert_eq!(link.nlink(), 2);

    let dangling = tmp.path().join("top/dangling");
    assert!(dangling.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(
        std::fs::read_link(&dangling).unwrap(),
        Path::new("no/such/file")
    );
    assert!(!dangling.exists(), "symlink target must stay dangling");
}

#[tokio::test(flavor = "multi_thread")]
async fn strip_components_drops_the_leading_directory() {
    let mut builder = Builder::new(Vec::new());
    add_dir(&mut builder, "release-v1/");
    add_file(&mut builder, "release-v1/bin/tool", b"#!/bin/sh\n");
    add_file(&mut builder, "release-v1/README", b"docs");
    let archive = builder.into_inner().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        strip_components: 1,
        ..Config::default()
    };
    run_extract(archive, tmp.path(), config).await.unwrap();

    // The stripped-to-empty directory entry is skipped entirely.
    assert!(!tmp.path().join("release-v1").exists());
    assert_eq!(std::fs::read(tmp.path().join("bin/tool")).unwrap(), b"#!/bin/sh\n");
    assert_eq!(std::fs::read(tmp.path().join("README")).unwrap(), b"docs");
}

#[tokio::test(flavor = "multi_thread")]
async fn file_modes_are_preserved() {
    let mut builder = Builder::new(Vec::new());
    let mut h = header(EntryType::Regular, 0o750, 4);
    builder.append_data(&mut h, "exec.sh", &b"data"[..]).unwrap();
    let archive = builder.into_inner().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    run_extract(archive, tmp.path(), Config::default()).await.unwrap();

    let mode = tmp.path().join("exec.sh").metadata().unwrap().mode();
    assert_eq!(mode & 0o7777, 0o750);
}

#[tokio::test(flavor = "multi_thread")]
async fn overwrite_replaces_existing_files() {
    let mut builder = Builder::new(Vec::new());
    add_file(&mut builder, "data.txt", b"fresh");
    let archive = builder.into_inner().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("data.txt"), b"stale").unwrap();

    let config = Config {
        overwrite: true,
        ..Config::default()
    };
    run_extract(archive, tmp.path(), config).await.unwrap();
    assert_eq!(std::fs::read(tmp.path().join("data.txt")).unwrap(), b"fresh");
}

#[tokio::test(flavor = "multi_thread")]
async fn node_entries_abort_unless_ignored() {
    let mut builder = Builder::new(Vec::new());
    add_file(&mut builder, "before", b"ok");
    let mut h = header(EntryType::Char, 0o644, 0);
    h.set_device_major(1).unwrap();
    h.set_device_minor(3).unwrap();
    builder.append_data(&mut h, "dev/null", std::io::empty()).unwrap();
    add_file(&mut builder, "after", b"also ok");
    let archive = builder.into_inner().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let err = run_extract(archive.clone(), tmp.path(), Config::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::UnsupportedEntry { .. }));

    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        ignore_node_files: true,
        ..Config::default()
    };
    run_extract(archive, tmp.path(), config).await.unwrap();
    assert_eq!(std::fs::read(tmp.path().join("before")).unwrap(), b"ok");
    assert_eq!(std::fs::read(tmp.path().join("after")).unwrap(), b"also ok");
    assert!(!tmp.path().join("dev/null").exists());
}
