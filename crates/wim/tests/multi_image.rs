//! Multi-image extraction, including the linked (hardlink/symlink)
//! modes.

#![cfg(unix)]

mod common;

use std::os::unix::fs::MetadataExt;

use common::*;
use wim::{ExtractOptions, extract_all_images};

fn two_image_archive() -> wim::Archive {
    let mut builder = ArchiveBuilder::new();
    let shared = builder.add_blob(b"shared payload");
    let only_second = builder.add_blob(b"second only");

    let mut first = ImageBuilder::new();
    let app = first.dir(first.root(), "app");
    first.file(app, "bin.dat", shared);

    let mut second = ImageBuilder::new();
    let app2 = second.dir(second.root(), "app");
    second.file(app2, "bin.dat", shared);
    second.file(app2, "extra.dat", only_second);

    builder.build(vec![("img1", first), ("img2", second)])
}

#[test_log::test]
fn test_extract_all_images_plain() {
    let mut archive = two_image_archive();
    let out = tempfile::tempdir().unwrap();

    let mut progress = ProgressLog::default();
    extract_all_images(
        &mut archive,
        out.path(),
        &ExtractOptions::default(),
        Some(&mut progress),
    )
    .unwrap();

    assert_eq!(
        std::fs::read(out.path().join("img1/app/bin.dat")).unwrap(),
        b"shared payload"
    );
    assert_eq!(
        std::fs::read(out.path().join("img2/app/extra.dat")).unwrap(),
        b"second only"
    );
    assert_eq!(progress.images_begun, 2);
    assert_eq!(progress.images_ended, 2);

    // Plain mode duplicates the shared file.
    let first = std::fs::metadata(out.path().join("img1/app/bin.dat")).unwrap();
    let second = std::fs::metadata(out.path().join("img2/app/bin.dat")).unwrap();
    assert_ne!(first.ino(), second.ino());
}

#[test_log::test]
fn test_extract_all_images_hardlink_mode() {
    let mut archive = two_image_archive();
    let out = tempfile::tempdir().unwrap();

    let options = ExtractOptions {
        hardlink: true,
        ..ExtractOptions::default()
    };
    extract_all_images(&mut archive, out.path(), &options, None).unwrap();

    let first = std::fs::metadata(out.path().join("img1/app/bin.dat")).unwrap();
    let second = std::fs::metadata(out.path().join("img2/app/bin.dat")).unwrap();
    assert_eq!(first.ino(), second.ino());
    // A file unique to the second image still extracts normally.
    assert_eq!(
        std::fs::read(out.path().join("img2/app/extra.dat")).unwrap(),
        b"second only"
    );
}

#[test_log::test]
fn test_extract_all_images_symlink_mode() {
    let mut archive = two_image_archive();
    let out = tempfile::tempdir().unwrap();

    let options = ExtractOptions {
        symlink: true,
        ..ExtractOptions::default()
    };
    extract_all_images(&mut archive, out.path(), &options, None).unwrap();

    let second = out.path().join("img2/app/bin.dat");
    let meta = std::fs::symlink_metadata(&second).unwrap();
    assert!(meta.file_type().is_symlink());

    let rel = std::fs::read_link(&second).unwrap();
    assert_eq!(
        rel,
        std::path::PathBuf::from("../../img1/app/bin.dat"),
        "link should climb to the common target directory"
    );
    // Following the link yields the shared contents.
    assert_eq!(std::fs::read(&second).unwrap(), b"shared payload");
}
