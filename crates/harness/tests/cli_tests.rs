//! End-to-end batch runs of the binary against the local backend

use std::io::Cursor;
use std::path::Path;
use std::process::Command;

const FIELDNAMES: &str =
    "record_id,s3_uri,height,width,channels,mean__r,mean__g,mean__b,brightness,label";

fn png(pixel: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(3, 2, image::Rgb(pixel));
    let mut bytes = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut bytes, image::ImageOutputFormat::Png)
        .unwrap();
    bytes.into_inner()
}

fn seed(root: &Path, key: &str, body: &[u8]) {
    let path = root.join("objects").join("in").join(key);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn harness(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_predict-harness"));
    cmd.env("HARNESS_BACKEND", "local")
        .env("HARNESS_LOCAL_ROOT", root)
        .env("HARNESS_OUTPUT", "object-file")
        .env("HARNESS_OUTPUT_BUCKET", "out")
        .env("HARNESS_FLUSH_RETRY_DELAY_MS", "0")
        .env("RUST_LOG", "warn");
    cmd
}

fn result_files(root: &Path) -> Vec<String> {
    let dir = root.join("objects").join("out").join("results");
    let mut files: Vec<String> = std::fs::read_dir(&dir)
        .map(|entries| {
            entries
                .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[test]
fn test_batch_with_one_broken_image_exits_partial() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed(root, "a.png", &png([250, 250, 250]));
    seed(root, "b.png", &png([10, 10, 10]));
    seed(root, "broken.png", b"not an image");
    seed(root, "d.png", &png([128, 128, 128]));

    let status = harness(root)
        .env("HARNESS_OUTPUT_FIELDNAMES", FIELDNAMES)
        .env("HARNESS_CHUNK_SIZE", "2")
        .env("HARNESS_FAIL_ON_PARTIAL", "true")
        .arg("s3://in/a.png,s3://in/b.png,s3://in/broken.png,s3://in/d.png")
        .status()
        .unwrap();

    assert_eq!(status.code(), Some(2));

    let files = result_files(root);
    assert_eq!(files.len(), 2);

    let rows: Vec<&str> = files
        .iter()
        .flat_map(|f| f.lines().skip(1))
        .collect();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().any(|r| r.contains("s3://in/a.png") && r.ends_with("bright")));
    assert!(rows.iter().any(|r| r.contains("s3://in/b.png") && r.ends_with("dark")));
    assert!(rows.iter().all(|r| !r.contains("broken")));
}

#[test]
fn test_partial_failure_exits_zero_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed(root, "a.png", &png([250, 250, 250]));

    let status = harness(root)
        .env("HARNESS_OUTPUT_FIELDNAMES", FIELDNAMES)
        .args(["s3://in/a.png", "s3://in/missing.png"])
        .status()
        .unwrap();

    assert_eq!(status.code(), Some(0));
    assert_eq!(result_files(root).len(), 1);
}

#[test]
fn test_missing_required_setting_exits_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed(root, "a.png", &png([250, 250, 250]));

    // No HARNESS_OUTPUT_FIELDNAMES for the object-file sink
    let status = harness(root).arg("s3://in/a.png").status().unwrap();

    assert_eq!(status.code(), Some(1));
    assert!(result_files(root).is_empty());
}

#[test]
fn test_header_mismatch_exits_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    seed(root, "a.png", &png([250, 250, 250]));

    let status = harness(root)
        .env("HARNESS_OUTPUT_FIELDNAMES", "record_id,label")
        .arg("s3://in/a.png")
        .status()
        .unwrap();

    assert_eq!(status.code(), Some(1));
    assert!(result_files(root).is_empty());
}
