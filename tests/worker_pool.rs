mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use common::{url, Reply, ScriptedTransport};
use odm_media::downloader::{SegmentDownloader, SegmentJob};
use odm_media::error::{FailureClass, FetchError, SegmentError};
use odm_media::limiter::BandwidthLimiter;
use odm_media::models::{ContentKind, SegmentSource};
use odm_media::retry::RetryPolicy;

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 100,
        multiplier: 2.0,
        max_delay_ms: 10_000,
        jitter_min: 0.0,
        jitter_max: 0.25,
        attempt_timeout_secs: 1,
        ..RetryPolicy::default()
    }
}

fn pool(transport: &Arc<ScriptedTransport>, policy: RetryPolicy, limit: usize) -> Arc<SegmentDownloader> {
    Arc::new(SegmentDownloader::new(
        transport.clone(),
        policy,
        limit,
        BandwidthLimiter::unlimited(),
    ))
}

fn failed(err: SegmentError) -> odm_media::error::SegmentFailed {
    match err {
        SegmentError::Failed(failed) => failed,
        other => panic!("expected a retry failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_between_attempts() {
    let transport = ScriptedTransport::new();
    let target = url("manifests/retry.m3u8");
    transport.script(
        &target,
        vec![
            Reply::Status(503),
            Reply::Status(503),
            Reply::Status(503),
            Reply::ok("#EXTM3U\n"),
        ],
    );
    let policy = policy(5);
    let downloader = pool(&transport, policy.clone(), 2);

    let body = downloader
        .fetch_bytes(&SegmentSource::whole(target.clone()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(&body[..], b"#EXTM3U\n");

    let seen = transport.requests_for(&target);
    assert_eq!(seen.len(), 4);
    assert!(seen.len() as u32 <= policy.max_attempts);

    let gaps: Vec<Duration> = seen.windows(2).map(|w| w[1].at - w[0].at).collect();
    for (n, gap) in gaps.iter().enumerate() {
        let attempt = n as u32 + 1;
        let floor = policy.nominal_delay(attempt);
        let ceiling = policy.delay_with_jitter(attempt, policy.jitter_max) + Duration::from_millis(2);
        assert!(
            *gap >= floor && *gap <= ceiling,
            "gap {gap:?} after attempt {attempt} outside [{floor:?}, {ceiling:?}]"
        );
    }
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]), "gaps shrank: {gaps:?}");
}

#[tokio::test(start_paused = true)]
async fn transient_failures_use_up_the_attempt_budget() {
    let transport = ScriptedTransport::new();
    let target = url("manifests/down.m3u8");
    transport.script(&target, vec![Reply::Status(503)]);
    let downloader = pool(&transport, policy(4), 2);

    let err = downloader
        .fetch_bytes(&SegmentSource::whole(target.clone()), &CancellationToken::new())
        .await
        .unwrap_err();
    let failed = failed(err);
    assert_eq!(failed.attempts, 4);
    assert_eq!(failed.class, FailureClass::Transient);
    assert_eq!(failed.last_error, FetchError::Status(503));
    assert_eq!(transport.count(&target), 4);
}

#[tokio::test(start_paused = true)]
async fn terminal_status_is_not_retried() {
    let transport = ScriptedTransport::new();
    let target = url("manifests/gone.m3u8");
    transport.script(&target, vec![Reply::Status(404)]);
    let downloader = pool(&transport, policy(5), 2);

    let failed = failed(
        downloader
            .fetch_bytes(&SegmentSource::whole(target.clone()), &CancellationToken::new())
            .await
            .unwrap_err(),
    );
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.class, FailureClass::Terminal);
    assert_eq!(transport.count(&target), 1);
}

#[tokio::test(start_paused = true)]
async fn second_length_mismatch_is_terminal() {
    let transport = ScriptedTransport::new();
    let target = url("manifests/short.m3u8");
    transport.script(&target, vec![Reply::short(vec![b'x'; 100], 200)]);
    let downloader = pool(&transport, policy(5), 2);

    let failed = failed(
        downloader
            .fetch_bytes(&SegmentSource::whole(target.clone()), &CancellationToken::new())
            .await
            .unwrap_err(),
    );
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.class, FailureClass::Terminal);
    assert_eq!(
        failed.last_error,
        FetchError::LengthMismatch {
            expected: 200,
            actual: 100
        }
    );
}

#[tokio::test(start_paused = true)]
async fn hung_attempts_time_out_and_retry() {
    let transport = ScriptedTransport::new();
    let target = url("manifests/hang.m3u8");
    transport.script(&target, vec![Reply::Hang, Reply::ok("#EXTM3U\n")]);
    let downloader = pool(&transport, policy(3), 2);

    let body = downloader
        .fetch_bytes(&SegmentSource::whole(target.clone()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(&body[..], b"#EXTM3U\n");
    let seen = transport.requests_for(&target);
    assert_eq!(seen.len(), 2);
    assert!(seen[1].at - seen[0].at >= Duration::from_secs(1));
}

#[tokio::test]
async fn cancellation_interrupts_an_attempt() {
    let transport = ScriptedTransport::new();
    let target = url("manifests/stuck.m3u8");
    transport.script(&target, vec![Reply::Hang]);
    let mut slow = policy(3);
    slow.attempt_timeout_secs = 60;
    let downloader = pool(&transport, slow, 1);

    let cancel = CancellationToken::new();
    let task = {
        let downloader = downloader.clone();
        let cancel = cancel.clone();
        let source = SegmentSource::whole(target.clone());
        tokio::spawn(async move { downloader.fetch_bytes(&source, &cancel).await })
    };
    common::wait_until("the request to start", || transport.count(&target) == 1).await;
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SegmentError::Cancelled)));
    assert_eq!(downloader.in_flight(), 0);
}

#[tokio::test]
async fn pool_never_exceeds_its_permit_count() {
    let transport = ScriptedTransport::new();
    let dir = tempfile::tempdir().unwrap();
    let downloader = pool(&transport, policy(2), 3);

    let mut jobs = JoinSet::new();
    for index in 0..12u32 {
        let segment = url(&format!("pool/seg{index}.ts"));
        transport.script(
            &segment,
            vec![Reply::delayed(vec![index as u8; 512], Duration::from_millis(30))],
        );
        let job = SegmentJob {
            index,
            source: SegmentSource::whole(segment),
            part_path: dir.path().join(format!("{index}.part")),
            final_path: dir.path().join(format!("{index}.bin")),
        };
        let downloader = downloader.clone();
        jobs.spawn(async move { downloader.fetch_segment(&job, &CancellationToken::new()).await });
    }
    while let Some(joined) = jobs.join_next().await {
        let fetched = joined.unwrap().unwrap();
        assert_eq!(fetched.bytes, 512);
        assert_eq!(fetched.attempts, 1);
    }

    assert_eq!(downloader.peak_in_flight(), 3);
    assert!(transport.peak_in_flight() <= 3);
    assert_eq!(downloader.in_flight(), 0);
    for index in 0..12 {
        assert!(dir.path().join(format!("{index}.bin")).exists());
        assert!(!dir.path().join(format!("{index}.part")).exists());
    }
}

#[tokio::test]
async fn direct_fetch_resumes_from_partial_file() {
    let transport = ScriptedTransport::new();
    let dir = tempfile::tempdir().unwrap();
    let file = url("files/clip.mp4");
    let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    transport.serve(&file, body.clone());

    let job = SegmentJob {
        index: 0,
        source: SegmentSource::whole(file.clone()),
        part_path: dir.path().join("seg.part"),
        final_path: dir.path().join("seg.bin"),
    };
    std::fs::write(&job.part_path, &body[..1200]).unwrap();

    let downloader = pool(&transport, policy(3), 1);
    let fetched = downloader
        .fetch_direct(&job, ContentKind::Video, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched.bytes, 5000);
    assert_eq!(std::fs::read(&job.final_path).unwrap(), body);
    let seen = transport.requests_for(&file);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].range.map(|r| r.offset), Some(1200));
}

#[tokio::test]
async fn direct_fetch_rejects_wrong_content_type() {
    let transport = ScriptedTransport::new();
    let dir = tempfile::tempdir().unwrap();
    let file = url("files/photo.jpg");
    transport.script(&file, vec![Reply::typed("<html></html>", "text/html; charset=utf-8")]);

    let job = SegmentJob {
        index: 0,
        source: SegmentSource::whole(file.clone()),
        part_path: dir.path().join("seg.part"),
        final_path: dir.path().join("seg.bin"),
    };
    let downloader = pool(&transport, policy(3), 1);
    let failed = failed(
        downloader
            .fetch_direct(&job, ContentKind::Image, &CancellationToken::new())
            .await
            .unwrap_err(),
    );
    assert_eq!(failed.class, FailureClass::Terminal);
    assert!(matches!(failed.last_error, FetchError::UnexpectedContentType(_)));
    assert!(!job.final_path.exists());
}
