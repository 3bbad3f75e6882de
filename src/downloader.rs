use futures_util::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{FailureClass, FetchError, SegmentError, SegmentFailed};
use crate::limiter::BandwidthLimiter;
use crate::models::{ByteRange, ContentKind, SegmentSource};
use crate::retry::RetryPolicy;
use crate::transport::{Transport, TransportResponse};

/// One segment to bring into temp storage.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub index: u32,
    pub source: SegmentSource,
    /// Written while the fetch is in progress.
    pub part_path: PathBuf,
    /// Where the segment lands once its length checks out.
    pub final_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedSegment {
    pub index: u32,
    pub bytes: u64,
    pub attempts: u32,
}

/// Why a single attempt failed.
enum AttemptError {
    Fetch(FetchError),
    Disk(std::io::Error),
}

impl From<FetchError> for AttemptError {
    fn from(err: FetchError) -> Self {
        AttemptError::Fetch(err)
    }
}

/// Bounded pool of fetch attempts shared by every transaction.
///
/// Each attempt holds one permit of the pool's semaphore while it runs, so
/// excess fetches queue instead of opening more connections. Permits are not
/// held across backoff sleeps.
pub struct SegmentDownloader {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    limiter: BandwidthLimiter,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SegmentDownloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        max_concurrent: usize,
        limiter: BandwidthLimiter,
    ) -> Self {
        Self {
            transport,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            limiter,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attempts currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous attempts seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Fetches a small resource (a manifest) into memory.
    pub async fn fetch_bytes(
        &self,
        source: &SegmentSource,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SegmentError> {
        let (bytes, attempts) = self
            .with_retry(None, cancel, |_| self.attempt_bytes(source))
            .await?;
        tracing::debug!(url = %source.url, bytes = bytes.len(), attempts, "fetched manifest");
        Ok(bytes)
    }

    /// Fetches one planned segment into `job.final_path`.
    pub async fn fetch_segment(
        &self,
        job: &SegmentJob,
        cancel: &CancellationToken,
    ) -> Result<FetchedSegment, SegmentError> {
        let (bytes, attempts) = self
            .with_retry(Some(job.index), cancel, |_| self.attempt_segment(job))
            .await?;
        tracing::debug!(segment = job.index, bytes, attempts, "segment confirmed");
        Ok(FetchedSegment {
            index: job.index,
            bytes,
            attempts,
        })
    }

    /// Streams a progressive file into `job.final_path`.
    ///
    /// Bytes already in `job.part_path` from an earlier attempt (or an earlier
    /// process) are kept and the transfer continues with an open-ended range.
    pub async fn fetch_direct(
        &self,
        job: &SegmentJob,
        kind: ContentKind,
        cancel: &CancellationToken,
    ) -> Result<FetchedSegment, SegmentError> {
        let (bytes, attempts) = self
            .with_retry(Some(job.index), cancel, |_| self.attempt_direct(job, kind))
            .await?;
        tracing::debug!(url = %job.source.url, bytes, attempts, "direct download confirmed");
        Ok(FetchedSegment {
            index: job.index,
            bytes,
            attempts,
        })
    }

    async fn with_retry<T, F, Fut>(
        &self,
        index: Option<u32>,
        cancel: &CancellationToken,
        mut attempt_once: F,
    ) -> Result<(T, u32), SegmentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let timeout = self.policy.attempt_timeout();
        let mut attempts = 0u32;
        let mut mismatches = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(SegmentError::Cancelled);
            }
            attempts += 1;

            let result = {
                let _permit = tokio::select! {
                    permit = self.permits.acquire() => permit.map_err(|_| SegmentError::Cancelled)?,
                    _ = cancel.cancelled() => return Err(SegmentError::Cancelled),
                };
                let _active = InFlight::enter(&self.in_flight, &self.peak_in_flight);
                tokio::select! {
                    outcome = tokio::time::timeout(timeout, attempt_once(attempts)) => {
                        outcome.unwrap_or(Err(AttemptError::Fetch(FetchError::Timeout(timeout))))
                    }
                    _ = cancel.cancelled() => return Err(SegmentError::Cancelled),
                }
            };

            let err = match result {
                Ok(value) => return Ok((value, attempts)),
                Err(AttemptError::Disk(source)) => return Err(SegmentError::Disk { index, source }),
                Err(AttemptError::Fetch(err)) => err,
            };

            let mut class = self.policy.classify(&err);
            if matches!(err, FetchError::LengthMismatch { .. }) {
                mismatches += 1;
                // One retry for a short or long body, then give up.
                if mismatches > 1 {
                    class = FailureClass::Terminal;
                }
            }
            if class == FailureClass::Terminal || attempts >= self.policy.max_attempts {
                tracing::warn!(
                    segment = ?index,
                    attempts,
                    class = ?class,
                    error = %err,
                    "fetch failed"
                );
                return Err(SegmentFailed {
                    index,
                    attempts,
                    class,
                    last_error: err,
                }
                .into());
            }

            let delay = self.policy.backoff(attempts);
            tracing::debug!(
                segment = ?index,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying fetch"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(SegmentError::Cancelled),
            }
        }
    }

    async fn attempt_bytes(&self, source: &SegmentSource) -> Result<Bytes, AttemptError> {
        let response = self.transport.get(source).await?;
        ensure_success(&response)?;
        let expected = source.planned_length().or(response.content_length);
        let mut body = response.body;
        let mut buf = Vec::with_capacity(expected.unwrap_or(0).min(16 * 1024 * 1024) as usize);
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            self.limiter.acquire(chunk.len() as u64).await;
            buf.extend_from_slice(&chunk);
        }
        check_length(expected, buf.len() as u64)?;
        Ok(Bytes::from(buf))
    }

    async fn attempt_segment(&self, job: &SegmentJob) -> Result<u64, AttemptError> {
        let response = self.transport.get(&job.source).await?;
        ensure_success(&response)?;
        let expected = job.source.planned_length().or(response.content_length);

        let mut file = File::create(&job.part_path).await.map_err(AttemptError::Disk)?;
        let written = self.stream_into(&mut file, response).await?;
        drop(file);

        check_length(expected, written)?;
        tokio::fs::rename(&job.part_path, &job.final_path)
            .await
            .map_err(AttemptError::Disk)?;
        Ok(written)
    }

    async fn attempt_direct(&self, job: &SegmentJob, kind: ContentKind) -> Result<u64, AttemptError> {
        let existing = match tokio::fs::metadata(&job.part_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(AttemptError::Disk(e)),
        };
        let source = if existing > 0 {
            SegmentSource {
                url: job.source.url.clone(),
                range: Some(ByteRange {
                    offset: existing,
                    length: None,
                }),
            }
        } else {
            job.source.clone()
        };

        let response = self.transport.get(&source).await?;
        if response.status == 416 && existing > 0 {
            // The partial file no longer lines up with the remote; start over.
            tokio::fs::remove_file(&job.part_path)
                .await
                .map_err(AttemptError::Disk)?;
            return Err(FetchError::Connection("range not satisfiable, restarting".into()).into());
        }
        ensure_success(&response)?;
        if let Some(content_type) = &response.content_type {
            if !kind.accepts_mime(content_type) {
                return Err(FetchError::UnexpectedContentType(content_type.clone()).into());
            }
        }

        let resumed = existing > 0 && response.is_partial();
        let base = if resumed { existing } else { 0 };
        let expected = response.content_length.map(|len| base + len);
        let mut file = if resumed {
            tracing::debug!(url = %job.source.url, offset = existing, "resuming direct download");
            OpenOptions::new()
                .append(true)
                .open(&job.part_path)
                .await
                .map_err(AttemptError::Disk)?
        } else {
            File::create(&job.part_path).await.map_err(AttemptError::Disk)?
        };
        let written = self.stream_into(&mut file, response).await?;
        drop(file);

        let total = base + written;
        check_length(expected, total)?;
        tokio::fs::rename(&job.part_path, &job.final_path)
            .await
            .map_err(AttemptError::Disk)?;
        Ok(total)
    }

    async fn stream_into(&self, file: &mut File, response: TransportResponse) -> Result<u64, AttemptError> {
        let mut body = response.body;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            self.limiter.acquire(chunk.len() as u64).await;
            file.write_all(&chunk).await.map_err(AttemptError::Disk)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(AttemptError::Disk)?;
        file.sync_all().await.map_err(AttemptError::Disk)?;
        Ok(written)
    }
}

fn ensure_success(response: &TransportResponse) -> Result<(), FetchError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(FetchError::Status(response.status))
    }
}

fn check_length(expected: Option<u64>, actual: u64) -> Result<(), FetchError> {
    match expected {
        Some(expected) if expected != actual => Err(FetchError::LengthMismatch { expected, actual }),
        _ => Ok(()),
    }
}
