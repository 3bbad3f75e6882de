//! Direct-first download strategy with one-way fallback to segmented fetch.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::FallbackPolicy;
use crate::downloader::{SegmentDownloader, SegmentJob};
use crate::error::{FailureClass, ManifestError, SegmentError, SegmentFailed, StateError};
use crate::models::{DownloadTransaction, SegmentPlan, SegmentSource, Tier};
use crate::playlist::{PlaylistResolver, ResolveError};
use crate::transaction_log::TransactionLog;

/// Why the fetch stage of a transaction stopped.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("{tier} tier failed: {failed}")]
    Segment { tier: Tier, failed: SegmentFailed },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("request has no source usable by the {0} tier")]
    NoSource(Tier),
    #[error("disk error on segment {index:?}: {source}")]
    Disk {
        index: Option<u32>,
        #[source]
        source: std::io::Error,
    },
    #[error("fetch cancelled")]
    Cancelled,
    #[error(transparent)]
    State(#[from] StateError),
}

impl StrategyError {
    fn from_segment(tier: Tier, err: SegmentError) -> Self {
        match err {
            SegmentError::Failed(failed) => StrategyError::Segment { tier, failed },
            SegmentError::Disk { index, source } => StrategyError::Disk { index, source },
            SegmentError::Cancelled => StrategyError::Cancelled,
        }
    }
}

impl From<ResolveError> for StrategyError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Manifest(e) => StrategyError::Manifest(e),
            ResolveError::Segment(e) => StrategyError::from_segment(Tier::Segmented, e),
        }
    }
}

/// Brings every segment of a transaction's plan into temp storage, choosing
/// between the direct and the segmented tier.
pub struct TierCoordinator {
    downloader: Arc<SegmentDownloader>,
    resolver: PlaylistResolver,
    log: TransactionLog,
    fallback: FallbackPolicy,
}

impl TierCoordinator {
    pub fn new(downloader: Arc<SegmentDownloader>, log: TransactionLog, fallback: FallbackPolicy) -> Self {
        Self {
            resolver: PlaylistResolver::new(downloader.clone()),
            downloader,
            log,
            fallback,
        }
    }

    /// Runs the fetch stage. A transaction that already has a tier keeps it.
    pub async fn fetch(
        &self,
        txn: &mut DownloadTransaction,
        cancel: &CancellationToken,
    ) -> Result<(), StrategyError> {
        let tier = match txn.tier {
            Some(tier) => tier,
            None => {
                let tier = if txn.request.direct_source().is_some() {
                    Tier::Direct
                } else {
                    Tier::Segmented
                };
                self.log.set_tier(txn, tier).await?;
                tracing::info!(txn = %txn.id, tier = %tier, "selected download tier");
                tier
            }
        };

        match tier {
            Tier::Segmented => self.fetch_segmented(txn, cancel).await,
            Tier::Direct => match self.fetch_direct(txn, cancel).await {
                Err(StrategyError::Segment { failed, .. }) if self.should_fall_back(txn, &failed) => {
                    tracing::info!(
                        txn = %txn.id,
                        error = %failed.last_error,
                        attempts = failed.attempts,
                        "direct download failed, falling back to segmented"
                    );
                    self.log.reset_progress(txn, false).await?;
                    self.log.set_tier(txn, Tier::Segmented).await?;
                    remove_dir_if_present(&txn.segments_dir())
                        .await
                        .map_err(|source| StrategyError::Disk { index: None, source })?;
                    self.fetch_segmented(txn, cancel).await
                }
                other => other,
            },
        }
    }

    fn should_fall_back(&self, txn: &DownloadTransaction, failed: &SegmentFailed) -> bool {
        txn.request.segmented_source().is_some()
            && self
                .fallback
                .allows(&failed.last_error, failed.class == FailureClass::Transient)
    }

    async fn fetch_direct(
        &self,
        txn: &mut DownloadTransaction,
        cancel: &CancellationToken,
    ) -> Result<(), StrategyError> {
        let source = txn
            .request
            .direct_source()
            .cloned()
            .ok_or(StrategyError::NoSource(Tier::Direct))?;
        if txn.plan.is_none() {
            self.log.set_plan(txn, SegmentPlan::single(source.url.clone())).await?;
        }
        self.drop_stale_confirmations(txn).await?;
        if txn.all_segments_confirmed() {
            return Ok(());
        }

        tokio::fs::create_dir_all(txn.segments_dir())
            .await
            .map_err(|source| StrategyError::Disk { index: None, source })?;
        let job = SegmentJob {
            index: 0,
            source: SegmentSource::whole(source.url),
            part_path: txn.segment_part_path(0),
            final_path: txn.segment_path(0),
        };
        match self
            .downloader
            .fetch_direct(&job, txn.request.content_kind, cancel)
            .await
        {
            Ok(fetched) => {
                self.log
                    .confirm_segment(txn, 0, fetched.bytes, fetched.attempts)
                    .await?;
                Ok(())
            }
            Err(SegmentError::Failed(failed)) => {
                self.log.record_attempts(txn, 0, failed.attempts).await?;
                Err(StrategyError::Segment {
                    tier: Tier::Direct,
                    failed,
                })
            }
            Err(other) => Err(StrategyError::from_segment(Tier::Direct, other)),
        }
    }

    async fn fetch_segmented(
        &self,
        txn: &mut DownloadTransaction,
        cancel: &CancellationToken,
    ) -> Result<(), StrategyError> {
        if txn.plan.is_none() {
            let source = txn
                .request
                .segmented_source()
                .cloned()
                .ok_or(StrategyError::NoSource(Tier::Segmented))?;
            let plan = self.resolver.resolve(&source, cancel).await?;
            if plan.is_empty() {
                return Err(ManifestError::NoUsableVariants.into());
            }
            self.log.set_plan(txn, plan).await?;
        }
        self.drop_stale_confirmations(txn).await?;

        let missing = txn.missing_segments();
        if missing.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(txn.segments_dir())
            .await
            .map_err(|source| StrategyError::Disk { index: None, source })?;
        tracing::info!(
            txn = %txn.id,
            missing = missing.len(),
            total = txn.plan.as_ref().map_or(0, |p| p.len()),
            "fetching segments"
        );

        // Cancels every outstanding fetch of this transaction when dropped,
        // including on an early return or when the caller stops polling.
        let siblings = cancel.child_token();
        let _stop_on_exit = siblings.clone().drop_guard();

        let mut fetches = JoinSet::new();
        for segment in missing {
            let job = SegmentJob {
                index: segment.index,
                part_path: txn.segment_part_path(segment.index),
                final_path: txn.segment_path(segment.index),
                source: segment.source,
            };
            let downloader = self.downloader.clone();
            let token = siblings.clone();
            fetches.spawn(async move {
                let result = downloader.fetch_segment(&job, &token).await;
                (job.index, result)
            });
        }

        let mut first_error: Option<StrategyError> = None;
        while let Some(joined) = fetches.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => continue,
            };
            match result {
                Ok(fetched) => {
                    self.log
                        .confirm_segment(txn, index, fetched.bytes, fetched.attempts)
                        .await?;
                }
                Err(SegmentError::Cancelled) => {
                    if first_error.is_none() && cancel.is_cancelled() {
                        first_error = Some(StrategyError::Cancelled);
                    }
                }
                Err(err) => {
                    if let SegmentError::Failed(failed) = &err {
                        self.log.record_attempts(txn, index, failed.attempts).await?;
                    }
                    if first_error.is_none() {
                        siblings.cancel();
                        first_error = Some(StrategyError::from_segment(Tier::Segmented, err));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unconfirms segments whose file is gone or no longer has the size that
    /// was recorded for it.
    async fn drop_stale_confirmations(&self, txn: &mut DownloadTransaction) -> Result<(), StrategyError> {
        let mut stale = Vec::new();
        for index in txn.completed.iter() {
            let expected = txn.segment_sizes.get(&index).copied();
            let actual = match tokio::fs::metadata(txn.segment_path(index)).await {
                Ok(meta) => Some(meta.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(source) => {
                    return Err(StrategyError::Disk {
                        index: Some(index),
                        source,
                    })
                }
            };
            if actual.is_none() || actual != expected {
                stale.push(index);
            }
        }
        if !stale.is_empty() {
            tracing::info!(txn = %txn.id, segments = ?stale, "re-fetching segments missing from temp storage");
            self.log.unconfirm_segments(txn, &stale).await?;
        }
        Ok(())
    }
}

async fn remove_dir_if_present(dir: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
