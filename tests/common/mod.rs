//! Shared fixtures for the integration tests: a scripted in-memory transport
//! and builders for engines, manifests and requests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use bytes::Bytes;
use url::Url;

use odm_media::error::FetchError;
use odm_media::manager::DownloadEngine;
use odm_media::models::{ByteRange, ContentKind, DownloadRequest, SegmentSource, SourceFormat, SourceUrl};
use odm_media::prelude::{EngineConfig, Transport};
use odm_media::transport::TransportResponse;

pub const HOST: &str = "https://cdn.test/";

pub fn url(path: &str) -> Url {
    Url::parse(HOST).unwrap().join(path).unwrap()
}

/// One scripted answer to a GET.
#[derive(Debug, Clone)]
pub enum Reply {
    Body {
        bytes: Vec<u8>,
        content_type: Option<&'static str>,
        /// Overrides the advertised `Content-Length`.
        advertised: Option<u64>,
        delay: Duration,
    },
    Status(u16),
    /// Never answers; only cancellation or a timeout ends the request.
    Hang,
}

impl Reply {
    pub fn ok(bytes: impl Into<Vec<u8>>) -> Self {
        Reply::Body {
            bytes: bytes.into(),
            content_type: None,
            advertised: None,
            delay: Duration::ZERO,
        }
    }

    pub fn typed(bytes: impl Into<Vec<u8>>, content_type: &'static str) -> Self {
        Reply::Body {
            bytes: bytes.into(),
            content_type: Some(content_type),
            advertised: None,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(bytes: impl Into<Vec<u8>>, delay: Duration) -> Self {
        Reply::Body {
            bytes: bytes.into(),
            content_type: None,
            advertised: None,
            delay,
        }
    }

    /// A body that does not match its advertised length.
    pub fn short(bytes: impl Into<Vec<u8>>, advertised: u64) -> Self {
        Reply::Body {
            bytes: bytes.into(),
            content_type: None,
            advertised: Some(advertised),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub range: Option<ByteRange>,
    pub at: Instant,
}

/// In-memory remote. Each URL answers with its script in order; the last
/// reply repeats once the script is used up. Unknown URLs get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<Request>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct Active(Arc<AtomicUsize>);

impl Drop for Active {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &Url, replies: Vec<Reply>) {
        assert!(!replies.is_empty(), "a script needs at least one reply");
        self.scripts
            .lock()
            .unwrap()
            .insert(url.as_str().to_string(), replies.into());
    }

    pub fn serve(&self, url: &Url, bytes: impl Into<Vec<u8>>) {
        self.script(url, vec![Reply::ok(bytes)]);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, url: &Url) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.url == url.as_str())
            .collect()
    }

    pub fn count(&self, url: &Url) -> usize {
        self.requests_for(url).len()
    }

    /// Highest number of requests that were open at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => script.front().cloned().unwrap(),
            None => Reply::Status(404),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, source: &SegmentSource) -> Result<TransportResponse, FetchError> {
        self.requests.lock().unwrap().push(Request {
            url: source.url.as_str().to_string(),
            range: source.range,
            at: Instant::now(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = Active(self.in_flight.clone());

        match self.next_reply(source.url.as_str()) {
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Reply::Status(status) => Ok(TransportResponse {
                status,
                content_length: Some(0),
                content_type: None,
                body: futures_util::stream::empty::<Result<Bytes, FetchError>>().boxed(),
            }),
            Reply::Body {
                bytes,
                content_type,
                advertised,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let (status, bytes) = match source.range {
                    Some(range) => {
                        let start = (range.offset as usize).min(bytes.len());
                        let end = match range.length {
                            Some(len) => (start + len as usize).min(bytes.len()),
                            None => bytes.len(),
                        };
                        (206, bytes[start..end].to_vec())
                    }
                    None => (200, bytes),
                };
                let content_length = advertised.or(Some(bytes.len() as u64));
                let chunks: Vec<Result<Bytes, FetchError>> = bytes
                    .chunks(1024)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(TransportResponse {
                    status,
                    content_length,
                    content_type: content_type.map(str::to_string),
                    body: futures_util::stream::iter(chunks).boxed(),
                })
            }
        }
    }
}

/// Distinct, differently sized payload for segment `index`.
pub fn segment_bytes(stream: &str, index: usize) -> Vec<u8> {
    format!("{stream}:segment-{index:02}|")
        .repeat(200 + index * 37)
        .into_bytes()
}

/// A scripted HLS media playlist and its segments.
pub struct Stream {
    pub playlist: Url,
    pub segments: Vec<Url>,
    pub bodies: Vec<Vec<u8>>,
}

impl Stream {
    /// Publishes `count` segments under `/<name>/` on `transport`.
    pub fn publish(transport: &ScriptedTransport, name: &str, count: usize) -> Self {
        let playlist = url(&format!("{name}/index.m3u8"));
        let mut manifest = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n");
        let mut segments = Vec::with_capacity(count);
        let mut bodies = Vec::with_capacity(count);
        for index in 0..count {
            manifest.push_str(&format!("#EXTINF:6.0,\nseg{index}.ts\n"));
            let segment = url(&format!("{name}/seg{index}.ts"));
            let body = segment_bytes(name, index);
            transport.serve(&segment, body.clone());
            segments.push(segment);
            bodies.push(body);
        }
        manifest.push_str("#EXT-X-ENDLIST\n");
        transport.serve(&playlist, manifest);
        Self {
            playlist,
            segments,
            bodies,
        }
    }

    pub fn joined(&self) -> Vec<u8> {
        self.bodies.concat()
    }

    pub fn total_len(&self) -> u64 {
        self.bodies.iter().map(|b| b.len() as u64).sum()
    }
}

pub fn hls_request(content_id: &str, playlist: &Url) -> DownloadRequest {
    DownloadRequest {
        content_id: content_id.to_string(),
        sources: vec![SourceUrl {
            url: playlist.clone(),
            format: SourceFormat::HlsStream,
        }],
        content_kind: ContentKind::Video,
        expected_hash: None,
        expected_size: None,
        destination_template: "{content_id}/{name}.{ext}".to_string(),
    }
}

pub fn direct_request(content_id: &str, file: &Url, kind: ContentKind) -> DownloadRequest {
    DownloadRequest {
        content_id: content_id.to_string(),
        sources: vec![SourceUrl {
            url: file.clone(),
            format: SourceFormat::DirectFile,
        }],
        content_kind: kind,
        expected_hash: None,
        expected_size: None,
        destination_template: "{content_id}/{name}.{ext}".to_string(),
    }
}

/// Storage under `root` with short backoff so retries finish quickly.
pub fn test_config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::rooted_at(root);
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 40;
    config.retry.attempt_timeout_secs = 5;
    config.concurrency.max_segment_fetches = 3;
    config.transaction_timeout_secs = 30;
    config
}

pub async fn open_engine(config: EngineConfig, transport: Arc<ScriptedTransport>) -> Arc<DownloadEngine> {
    Arc::new(DownloadEngine::open(config, transport).await.unwrap())
}

/// Regular files below `dir`, sorted.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(next) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&next) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

/// Polls `check` every few milliseconds until it holds, failing after 10s.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until at least `segments` segments of `id` are confirmed in the log.
pub async fn wait_for_confirmed(engine: &DownloadEngine, id: &str, segments: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let txn = engine.log().get(id).await.unwrap().unwrap();
        if txn.completed.count() >= segments {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "only {} of {segments} segments confirmed",
            txn.completed.count()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
