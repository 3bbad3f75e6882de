mod common;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use std::io::Cursor;

use common::{direct_request, files_under, open_engine, test_config, url, ScriptedTransport};
use odm_media::dedup::DedupMode;
use odm_media::prelude::*;

fn gradient(width: u32, height: u32) -> DynamicImage {
    let buf = ImageBuffer::from_fn(width, height, |x, y| {
        let v = ((x * 255) / width) as u8;
        Rgb([v, v / 2, ((y * 255) / height) as u8])
    });
    DynamicImage::ImageRgb8(buf)
}

fn png(img: &DynamicImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn committed(outcome: TransactionOutcome) -> CompletedDownload {
    outcome.completed().cloned().expect("download commits")
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let body = common::segment_bytes("same", 3);
    let a = url("mirror-a/poster.jpg");
    let b = url("mirror-b/poster.jpg");
    transport.serve(&a, body.clone());
    transport.serve(&b, body.clone());
    let engine = open_engine(test_config(root.path()), transport.clone()).await;

    let first = committed(engine.submit(direct_request("c1", &a, ContentKind::Image)).await.unwrap());
    let second = committed(engine.submit(direct_request("c2", &b, ContentKind::Image)).await.unwrap());

    assert!(!first.was_duplicate);
    assert!(second.was_duplicate);
    assert_eq!(second.final_path, first.final_path);
    assert_eq!(second.content_fingerprint, first.content_fingerprint);
    assert_eq!(files_under(&root.path().join("library")), vec![first.final_path.clone()]);

    let sha = &first.content_fingerprint.sha256;
    let record = engine.fingerprints().get(sha).await.unwrap().unwrap();
    let references = engine.fingerprints().references(sha).await.unwrap();
    assert_eq!(record.ref_count, 2);
    assert_eq!(references.len() as u64, record.ref_count);
    assert!(references
        .iter()
        .any(|r| r.logical_path == root.path().join("library/c2/poster.jpg")));

    let txn = engine.log().get(&second.transaction_id).await.unwrap().unwrap();
    assert!(!txn.temp_dir.exists());
}

#[tokio::test]
async fn concurrent_duplicates_elect_one_canonical_file() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let body = common::segment_bytes("race", 5);
    let a = url("race-a/clip.mp4");
    let b = url("race-b/clip.mp4");
    transport.serve(&a, body.clone());
    transport.serve(&b, body.clone());
    let engine = open_engine(test_config(root.path()), transport.clone()).await;

    let (left, right) = tokio::join!(
        engine.submit(direct_request("c1", &a, ContentKind::Video)),
        engine.submit(direct_request("c2", &b, ContentKind::Video)),
    );
    let left = committed(left.unwrap());
    let right = committed(right.unwrap());

    assert_eq!(left.final_path, right.final_path);
    assert_eq!(
        [left.was_duplicate, right.was_duplicate].iter().filter(|d| **d).count(),
        1
    );
    assert_eq!(files_under(&root.path().join("library")).len(), 1);
    let record = engine
        .fingerprints()
        .get(&left.content_fingerprint.sha256)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.ref_count, 2);
}

async fn resized_pair(mode: DedupMode) -> (CompletedDownload, CompletedDownload, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let original = gradient(256, 128);
    let smaller = original.resize_exact(128, 64, image::imageops::FilterType::Triangle);
    let a = url("img/sunset.png");
    let b = url("img/sunset_1080x720.png");
    transport.serve(&a, png(&original));
    transport.serve(&b, png(&smaller));

    let mut config = test_config(root.path());
    config.dedup.mode = mode;
    let engine = open_engine(config, transport.clone()).await;

    let first = committed(engine.submit(direct_request("c1", &a, ContentKind::Image)).await.unwrap());
    let second = committed(engine.submit(direct_request("c2", &b, ContentKind::Image)).await.unwrap());
    assert_ne!(first.content_fingerprint.sha256, second.content_fingerprint.sha256);
    assert!(first.content_fingerprint.perceptual.is_some());
    (first, second, root)
}

#[tokio::test]
async fn strict_mode_keeps_visually_similar_images() {
    let (first, second, root) = resized_pair(DedupMode::Strict).await;
    assert!(!second.was_duplicate);
    assert_ne!(first.final_path, second.final_path);
    assert_eq!(files_under(&root.path().join("library")).len(), 2);
}

#[tokio::test]
async fn trusting_mode_folds_resized_variants() {
    let (first, second, root) = resized_pair(DedupMode::Trusting).await;
    assert!(second.was_duplicate);
    assert_eq!(second.final_path, first.final_path);
    assert_eq!(second.final_path, root.path().join("library/c1/sunset.png"));
    assert_eq!(files_under(&root.path().join("library")).len(), 1);
}

#[tokio::test]
async fn trusting_mode_keeps_different_pictures_apart() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let picture = gradient(128, 64);
    let a = url("img/sunset.png");
    let b = url("img/sunset_small.png");
    transport.serve(&a, png(&picture));
    transport.serve(&b, png(&picture.fliph()));

    let mut config = test_config(root.path());
    config.dedup.mode = DedupMode::Trusting;
    let engine = open_engine(config, transport.clone()).await;

    committed(engine.submit(direct_request("c1", &a, ContentKind::Image)).await.unwrap());
    let second = committed(engine.submit(direct_request("c2", &b, ContentKind::Image)).await.unwrap());
    assert!(!second.was_duplicate);
    assert_eq!(files_under(&root.path().join("library")).len(), 2);
}

#[tokio::test]
async fn racing_variants_elect_one_canonical_image() {
    let root = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let original = gradient(256, 128);
    let smaller = original.resize_exact(128, 64, image::imageops::FilterType::Triangle);
    let a = url("race/sunset.png");
    let b = url("race/sunset_1080x720.png");
    transport.serve(&a, png(&original));
    transport.serve(&b, png(&smaller));

    let mut config = test_config(root.path());
    config.dedup.mode = DedupMode::Trusting;
    let engine = open_engine(config, transport.clone()).await;

    let (left, right) = tokio::join!(
        engine.submit(direct_request("c1", &a, ContentKind::Image)),
        engine.submit(direct_request("c2", &b, ContentKind::Image)),
    );
    let left = committed(left.unwrap());
    let right = committed(right.unwrap());

    assert_eq!(left.final_path, right.final_path);
    assert_eq!(
        [left.was_duplicate, right.was_duplicate].iter().filter(|d| **d).count(),
        1
    );
    assert_eq!(files_under(&root.path().join("library")).len(), 1);
}
