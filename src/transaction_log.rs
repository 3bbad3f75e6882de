//! Write-ahead log of download transactions.
//!
//! Every state change is persisted before the work it announces starts, so
//! after a crash the last row of a transaction names the step whose effect
//! is unknown. Recovery re-drives that step; each step is idempotent.

use chrono::Utc;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{FailureReport, StateError};
use crate::models::{
    CommitPlan, ContentFingerprint, DownloadRequest, DownloadTransaction, SegmentPlan, Tier,
    TransactionState,
};
use crate::state_manager::StateManager;

#[derive(Clone)]
pub struct TransactionLog {
    store: StateManager,
}

impl TransactionLog {
    pub fn new(store: StateManager) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateManager {
        &self.store
    }

    /// Creates and persists a new transaction in CREATED.
    pub async fn begin(
        &self,
        request: DownloadRequest,
        destination: PathBuf,
        temp_root: &Path,
    ) -> Result<DownloadTransaction, StateError> {
        let id = Uuid::new_v4().to_string();
        let txn = DownloadTransaction::new(id, request, destination, temp_root);
        self.store.save_transaction(&txn).await?;
        tracing::info!(
            txn = %txn.id,
            content_id = %txn.request.content_id,
            destination = %txn.destination.display(),
            "transaction created"
        );
        Ok(txn)
    }

    /// Moves `txn` to `next` and makes that durable.
    ///
    /// On a failed write the in-memory state is left where it was.
    pub async fn transition(
        &self,
        txn: &mut DownloadTransaction,
        next: TransactionState,
    ) -> Result<(), StateError> {
        let from = txn.state;
        if !from.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                id: txn.id.clone(),
                from,
                to: next,
            });
        }
        txn.state = next;
        if let Err(e) = self.save(txn).await {
            txn.state = from;
            return Err(e);
        }
        if from != next {
            tracing::info!(txn = %txn.id, from = %from, to = %next, "state transition");
        } else {
            tracing::debug!(txn = %txn.id, state = %next, "re-entering state");
        }
        Ok(())
    }

    pub async fn set_tier(&self, txn: &mut DownloadTransaction, tier: Tier) -> Result<(), StateError> {
        txn.tier = Some(tier);
        self.save(txn).await
    }

    pub async fn set_plan(&self, txn: &mut DownloadTransaction, plan: SegmentPlan) -> Result<(), StateError> {
        txn.plan = Some(plan);
        self.save(txn).await
    }

    /// Marks a segment as present in temp storage with its verified size.
    pub async fn confirm_segment(
        &self,
        txn: &mut DownloadTransaction,
        index: u32,
        bytes: u64,
        attempts: u32,
    ) -> Result<(), StateError> {
        txn.completed.insert(index);
        txn.segment_sizes.insert(index, bytes);
        txn.attempts.insert(index, attempts);
        self.save(txn).await
    }

    /// Forgets segments that are no longer usable on disk.
    pub async fn unconfirm_segments(
        &self,
        txn: &mut DownloadTransaction,
        indices: &[u32],
    ) -> Result<(), StateError> {
        if indices.is_empty() {
            return Ok(());
        }
        for index in indices {
            txn.completed.remove(*index);
            txn.segment_sizes.remove(index);
        }
        self.save(txn).await
    }

    /// Stores the attempt count of a segment that did not complete.
    pub async fn record_attempts(
        &self,
        txn: &mut DownloadTransaction,
        index: u32,
        attempts: u32,
    ) -> Result<(), StateError> {
        txn.attempts.insert(index, attempts);
        self.save(txn).await
    }

    /// Drops all fetch progress ahead of a full re-fetch.
    ///
    /// The plan is kept unless `keep_plan` is false, as when switching tiers.
    pub async fn reset_progress(
        &self,
        txn: &mut DownloadTransaction,
        keep_plan: bool,
    ) -> Result<(), StateError> {
        txn.completed.clear();
        txn.segment_sizes.clear();
        txn.fingerprint = None;
        txn.commit = None;
        if !keep_plan {
            txn.plan = None;
        }
        self.save(txn).await
    }

    pub async fn set_fingerprint(
        &self,
        txn: &mut DownloadTransaction,
        fingerprint: ContentFingerprint,
    ) -> Result<(), StateError> {
        txn.fingerprint = Some(fingerprint);
        self.save(txn).await
    }

    pub async fn set_commit_plan(
        &self,
        txn: &mut DownloadTransaction,
        plan: CommitPlan,
    ) -> Result<(), StateError> {
        txn.commit = Some(plan);
        self.save(txn).await
    }

    /// Bumps the integrity restart counter; returns the new value.
    pub async fn note_integrity_restart(&self, txn: &mut DownloadTransaction) -> Result<u32, StateError> {
        txn.integrity_restarts += 1;
        self.save(txn).await?;
        Ok(txn.integrity_restarts)
    }

    /// Moves `txn` to ABANDONED with `report` and purges its temp files.
    ///
    /// Destination files are never touched.
    pub async fn abandon(
        &self,
        txn: &mut DownloadTransaction,
        report: FailureReport,
    ) -> Result<(), StateError> {
        txn.failure = Some(report.clone());
        self.transition(txn, TransactionState::Abandoned).await?;
        tracing::warn!(
            txn = %txn.id,
            content_id = %report.content_id,
            tier = ?report.tier,
            segment = ?report.segment_index,
            class = %report.class,
            "transaction abandoned: {}",
            report.message
        );
        purge_temp_dir(&txn.temp_dir).await;
        Ok(())
    }

    /// Moves `txn` to COMMITTED and purges its temp files.
    pub async fn complete(&self, txn: &mut DownloadTransaction) -> Result<(), StateError> {
        self.transition(txn, TransactionState::Committed).await?;
        purge_temp_dir(&txn.temp_dir).await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DownloadTransaction>, StateError> {
        self.store.load_transaction(id).await
    }

    /// Transactions a recovery pass must re-drive.
    pub async fn unfinished(&self) -> Result<Vec<DownloadTransaction>, StateError> {
        self.store.load_unfinished().await
    }

    pub async fn finished(&self) -> Result<Vec<DownloadTransaction>, StateError> {
        self.store.load_finished().await
    }

    /// Deletes retained COMMITTED and ABANDONED rows.
    pub async fn prune_finished(&self) -> Result<usize, StateError> {
        let removed = self.store.delete_finished().await?;
        tracing::info!(removed, "pruned finished transactions");
        Ok(removed)
    }

    async fn save(&self, txn: &mut DownloadTransaction) -> Result<(), StateError> {
        txn.updated_at = Utc::now();
        self.store.save_transaction(txn).await
    }
}

/// Removes a transaction's scratch directory; a missing one is fine.
pub(crate) async fn purge_temp_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "purged temp files"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to purge temp files"),
    }
}
