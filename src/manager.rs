// src/manager.rs

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::assembler;
use crate::config::EngineConfig;
use crate::dedup::{DedupDecision, DedupEngine};
use crate::downloader::SegmentDownloader;
use crate::error::{AssemblyError, ErrorClass, IntegrityError, ManagerError, StateError};
use crate::fingerprints::{Claim, FingerprintStore};
use crate::integrity::sha256_sum;
use crate::limiter::BandwidthLimiter;
use crate::locks::KeyedLocks;
use crate::models::{
    CommitPlan, CompletedDownload, ContentFingerprint, DownloadRequest, DownloadTransaction,
    TransactionOutcome, TransactionState,
};
use crate::state_manager::StateManager;
use crate::strategy::{StrategyError, TierCoordinator};
use crate::transaction_log::{purge_temp_dir, TransactionLog};
use crate::transport::{HttpTransport, Transport};

/// A failed integrity check triggers this many full re-fetches.
const MAX_INTEGRITY_RESTARTS: u32 = 1;

enum Step {
    Continue,
    Done(TransactionOutcome),
}

/// Why the artifact could not be put at its final path.
enum PlaceError {
    Io(std::io::Error),
    /// Neither the artifact nor a finished move is on disk.
    Lost,
}

/// Drives download transactions through their state machine.
///
/// One engine owns the database, the worker pool and the dedup engine for a
/// process. Transactions are driven concurrently up to
/// `concurrency.max_transactions`.
pub struct DownloadEngine {
    config: EngineConfig,
    log: TransactionLog,
    dedup: DedupEngine,
    downloader: Arc<SegmentDownloader>,
    coordinator: TierCoordinator,
    transaction_permits: Semaphore,
    destination_locks: KeyedLocks<PathBuf>,
    active: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Removes a transaction from the active map when its driver stops, however
/// it stops.
struct Registration<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.id);
    }
}

impl DownloadEngine {
    /// Opens the engine on `config.storage`, creating directories and tables
    /// as needed.
    pub async fn open(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        config.validate()?;
        let storage = &config.storage;
        tokio::fs::create_dir_all(&storage.temp_root).await?;
        tokio::fs::create_dir_all(&storage.destination_root).await?;
        if let Some(parent) = storage.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = StateManager::new(&storage.database_path).await?;
        let log = TransactionLog::new(state.clone());
        let dedup = DedupEngine::new(config.dedup.clone(), FingerprintStore::new(&state))?;
        let downloader = Arc::new(SegmentDownloader::new(
            transport,
            config.retry.clone(),
            config.concurrency.max_segment_fetches,
            BandwidthLimiter::new(config.concurrency.max_bytes_per_sec),
        ));
        let coordinator = TierCoordinator::new(downloader.clone(), log.clone(), config.fallback.clone());

        tracing::info!(
            database = %storage.database_path.display(),
            max_segment_fetches = config.concurrency.max_segment_fetches,
            max_transactions = config.concurrency.max_transactions,
            dedup_mode = ?config.dedup.mode,
            "download engine ready"
        );
        Ok(Self {
            transaction_permits: Semaphore::new(config.concurrency.max_transactions),
            config,
            log,
            dedup,
            downloader,
            coordinator,
            destination_locks: KeyedLocks::new(),
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Opens the engine with the `reqwest` transport.
    pub async fn with_http(config: EngineConfig) -> Result<Self, ManagerError> {
        let transport = HttpTransport::new(&config.user_agent)?;
        Self::open(config, Arc::new(transport)).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn fingerprints(&self) -> &FingerprintStore {
        self.dedup.store()
    }

    pub fn downloader(&self) -> &SegmentDownloader {
        &self.downloader
    }

    /// Validates `request` and logs a new transaction for it without driving it.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadTransaction, ManagerError> {
        request.validate()?;
        let destination = request.resolve_destination(&self.config.storage.destination_root)?;
        let txn = self
            .log
            .begin(request, destination, &self.config.storage.temp_root)
            .await?;
        Ok(txn)
    }

    /// Logs and drives one request to its terminal outcome.
    pub async fn submit(&self, request: DownloadRequest) -> Result<TransactionOutcome, ManagerError> {
        let txn = self.enqueue(request).await?;
        self.drive(&txn.id).await
    }

    /// Drives a logged transaction from whatever state it was left in.
    pub async fn drive(&self, id: &str) -> Result<TransactionOutcome, ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }
        let _permit = self
            .transaction_permits
            .acquire()
            .await
            .map_err(|_| ManagerError::ShuttingDown)?;

        let cancel = self.shutdown.child_token();
        let _registration = self.register(id, cancel.clone())?;
        let mut txn = self
            .log
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::TransactionNotFound(id.to_string()))?;
        if txn.state.is_terminal() {
            return self.outcome_of(&txn);
        }

        let _destination = self.destination_locks.lock(&txn.destination).await;
        self.run(&mut txn, &cancel).await
    }

    /// Re-drives every unfinished transaction and sweeps temp directories
    /// that belong to none of them.
    ///
    /// Meant to run at startup, before new requests are accepted.
    pub async fn recover(&self) -> Result<Vec<TransactionOutcome>, ManagerError> {
        let unfinished = self.log.unfinished().await?;
        let known: HashSet<&str> = unfinished.iter().map(|t| t.id.as_str()).collect();
        self.sweep_orphans(&known).await?;
        tracing::info!(unfinished = unfinished.len(), "recovering transactions");

        let drives = unfinished.iter().map(|txn| async move {
            tracing::info!(txn = %txn.id, state = %txn.state, tier = ?txn.tier, "resuming transaction");
            (txn.id.as_str(), self.drive(&txn.id).await)
        });
        let mut outcomes = Vec::with_capacity(unfinished.len());
        for (id, result) in futures_util::future::join_all(drives).await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(txn = %id, error = %e, "recovery of transaction failed"),
            }
        }
        Ok(outcomes)
    }

    /// Cancels a transaction that has not started committing.
    ///
    /// A running transaction stops its outstanding fetches and is abandoned
    /// by its driver; an idle one is abandoned here.
    pub async fn cancel(&self, id: &str) -> Result<(), ManagerError> {
        let txn = self
            .log
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::TransactionNotFound(id.to_string()))?;
        if txn.state.is_terminal() || txn.state == TransactionState::Committing {
            return Err(ManagerError::NotCancellable {
                id: id.to_string(),
                state: txn.state,
            });
        }

        // Either signal the running driver or take the transaction over so no
        // driver can start while it is being abandoned.
        let _registration = loop {
            let running = {
                let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
                active.get(id).cloned()
            };
            if let Some(token) = running {
                tracing::info!(txn = %id, "cancelling running transaction");
                token.cancel();
                return Ok(());
            }
            let claimed = CancellationToken::new();
            claimed.cancel();
            match self.register(id, claimed) {
                Ok(registration) => break registration,
                Err(ManagerError::AlreadyActive(_)) => continue,
                Err(e) => return Err(e),
            }
        };
        let mut txn = self
            .log
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::TransactionNotFound(id.to_string()))?;
        if txn.state.is_terminal() || txn.state == TransactionState::Committing {
            return Err(ManagerError::NotCancellable {
                id: id.to_string(),
                state: txn.state,
            });
        }
        let report = txn.failure_report(ErrorClass::Cancelled, None, "cancelled by caller");
        self.log.abandon(&mut txn, report).await?;
        Ok(())
    }

    /// Stops accepting work and interrupts running transactions, which keep
    /// their last durable state for the next recovery pass.
    pub fn shutdown(&self) {
        tracing::info!("download engine shutting down");
        self.shutdown.cancel();
        self.transaction_permits.close();
    }

    /// Resolves once [`DownloadEngine::shutdown`] has been called.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    fn register(&self, id: &str, token: CancellationToken) -> Result<Registration<'_>, ManagerError> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.contains_key(id) {
            return Err(ManagerError::AlreadyActive(id.to_string()));
        }
        active.insert(id.to_string(), token);
        Ok(Registration {
            active: &self.active,
            id: id.to_string(),
        })
    }

    async fn run(
        &self,
        txn: &mut DownloadTransaction,
        cancel: &CancellationToken,
    ) -> Result<TransactionOutcome, ManagerError> {
        let ceiling = self.config.transaction_timeout();
        match tokio::time::timeout(ceiling, self.pre_commit(txn, cancel)).await {
            Ok(Ok(Step::Continue)) => {}
            Ok(Ok(Step::Done(outcome))) => return Ok(outcome),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return self
                    .abandon(
                        txn,
                        ErrorClass::Timeout,
                        None,
                        format!("exceeded the {}s transaction ceiling", ceiling.as_secs()),
                    )
                    .await;
            }
        }
        self.dedup_and_commit(txn, cancel).await
    }

    /// Everything up to a verified, fingerprinted artifact.
    async fn pre_commit(
        &self,
        txn: &mut DownloadTransaction,
        cancel: &CancellationToken,
    ) -> Result<Step, ManagerError> {
        loop {
            if cancel.is_cancelled() {
                return self.cancelled(txn).await.map(Step::Done);
            }
            match txn.state {
                TransactionState::Created => {
                    self.log.transition(txn, TransactionState::Fetching).await?;
                }
                TransactionState::Fetching => {
                    match self.coordinator.fetch(txn, cancel).await {
                        Ok(()) => self.log.transition(txn, TransactionState::Assembling).await?,
                        Err(e) => return self.fetch_failed(txn, e).await.map(Step::Done),
                    }
                }
                TransactionState::Assembling => {
                    if let Some(outcome) = self.assemble_and_verify(txn).await? {
                        return Ok(Step::Done(outcome));
                    }
                }
                TransactionState::Verifying => {
                    // The artifact of a crashed run cannot be trusted.
                    self.log.transition(txn, TransactionState::Assembling).await?;
                }
                TransactionState::DedupCheck | TransactionState::Committing => {
                    return Ok(Step::Continue);
                }
                TransactionState::Committed | TransactionState::Abandoned => {
                    return self.outcome_of(txn).map(Step::Done);
                }
            }
        }
    }

    /// ASSEMBLING and VERIFYING. Returns an outcome only when the transaction
    /// stops; otherwise `txn` has moved on to DEDUP_CHECK or back to FETCHING.
    async fn assemble_and_verify(
        &self,
        txn: &mut DownloadTransaction,
    ) -> Result<Option<TransactionOutcome>, ManagerError> {
        let artifact = match assembler::assemble(txn).await {
            Ok(artifact) => artifact,
            Err(AssemblyError::MissingSegment(index)) => {
                tracing::warn!(txn = %txn.id, segment = index, "segment missing at assembly, re-fetching");
                self.log.unconfirm_segments(txn, &[index]).await?;
                self.log.transition(txn, TransactionState::Fetching).await?;
                return Ok(None);
            }
            Err(AssemblyError::NoPlan) => {
                self.log.transition(txn, TransactionState::Fetching).await?;
                return Ok(None);
            }
            Err(AssemblyError::Io(e)) => return Ok(Some(self.suspend(txn, None, &e))),
        };

        self.log.transition(txn, TransactionState::Verifying).await?;
        match assembler::verify(&artifact, &txn.request) {
            Ok(()) => {}
            Err(IntegrityError::Io(e)) => return Ok(Some(self.suspend(txn, None, &e))),
            Err(mismatch) => return self.integrity_failed(txn, mismatch).await,
        }

        let fingerprint = match self
            .dedup
            .fingerprint(artifact.sha256, &artifact.path, txn.request.content_kind)
            .await
        {
            Ok(fingerprint) => fingerprint,
            Err(e) => return Ok(Some(self.suspend(txn, None, &e))),
        };
        self.log.set_fingerprint(txn, fingerprint).await?;
        self.log.transition(txn, TransactionState::DedupCheck).await?;
        Ok(None)
    }

    async fn integrity_failed(
        &self,
        txn: &mut DownloadTransaction,
        err: IntegrityError,
    ) -> Result<Option<TransactionOutcome>, ManagerError> {
        if txn.integrity_restarts >= MAX_INTEGRITY_RESTARTS {
            return self
                .abandon(txn, ErrorClass::Integrity, None, err.to_string())
                .await
                .map(Some);
        }
        tracing::warn!(txn = %txn.id, error = %err, "integrity check failed, re-fetching every segment");
        self.log.note_integrity_restart(txn).await?;
        // Files go first so no later crash can reuse them.
        if let Err(e) = remove_dir_if_present(&txn.segments_dir()).await {
            return Ok(Some(self.suspend(txn, None, &e)));
        }
        if let Err(e) = remove_file_if_present(&txn.artifact_path()).await {
            return Ok(Some(self.suspend(txn, None, &e)));
        }
        self.log.reset_progress(txn, true).await?;
        self.log.transition(txn, TransactionState::Fetching).await?;
        Ok(None)
    }

    /// DEDUP_CHECK and COMMITTING, serialized per content hash.
    async fn dedup_and_commit(
        &self,
        txn: &mut DownloadTransaction,
        cancel: &CancellationToken,
    ) -> Result<TransactionOutcome, ManagerError> {
        let fingerprint = match &txn.fingerprint {
            Some(fingerprint) => fingerprint.clone(),
            None => match self.refingerprint(txn).await? {
                Ok(fingerprint) => fingerprint,
                Err(outcome) => return Ok(outcome),
            },
        };
        let _hash_guard = self.dedup.lock(&fingerprint.sha256).await;
        let _variant_guard = self
            .dedup
            .lock_variant(&txn.destination, txn.request.content_kind)
            .await;

        if txn.state == TransactionState::DedupCheck {
            if cancel.is_cancelled() {
                return self.cancelled(txn).await;
            }
            self.log.transition(txn, TransactionState::DedupCheck).await?;
            let decision = self
                .dedup
                .check(&fingerprint, &txn.destination, txn.request.content_kind)
                .await?;
            let plan = match decision {
                DedupDecision::Duplicate { record, matched_by } => {
                    tracing::info!(
                        txn = %txn.id,
                        matched_by = ?matched_by,
                        canonical = %record.canonical_path.display(),
                        "duplicate content"
                    );
                    CommitPlan::Reference {
                        sha256: record.fingerprint.sha256,
                        canonical_path: record.canonical_path,
                    }
                }
                DedupDecision::Unique => {
                    let final_path = match self.free_destination(&txn.destination, &fingerprint.sha256).await {
                        Ok(path) => path,
                        Err(e) => return Ok(self.suspend(txn, None, &e)),
                    };
                    tracing::debug!(txn = %txn.id, final_path = %final_path.display(), "unique content");
                    CommitPlan::Canonical { final_path }
                }
            };
            self.log.set_commit_plan(txn, plan).await?;
            if cancel.is_cancelled() {
                return self.cancelled(txn).await;
            }
            self.log.transition(txn, TransactionState::Committing).await?;
        }

        self.commit(txn, &fingerprint).await
    }

    /// COMMITTING. Safe to replay any number of times.
    async fn commit(
        &self,
        txn: &mut DownloadTransaction,
        fingerprint: &ContentFingerprint,
    ) -> Result<TransactionOutcome, ManagerError> {
        let plan = txn.commit.clone().ok_or_else(|| StateError::CorruptRow {
            id: txn.id.clone(),
            reason: "committing without a commit plan".into(),
        })?;
        let artifact = txn.artifact_path();
        let kind = txn.request.content_kind;

        match plan {
            CommitPlan::Canonical { final_path } => {
                let claim = self
                    .dedup
                    .store()
                    .claim_canonical(fingerprint, &final_path, kind, &txn.id, &final_path)
                    .await?;
                match claim {
                    Claim::Claimed(_) => {
                        let placed = place_artifact(&artifact, &final_path, &fingerprint.sha256).await;
                        if placed.is_err() {
                            // The record must not outlive a file that never arrived.
                            self.dedup
                                .store()
                                .release_claim(&fingerprint.sha256, &txn.id, &final_path)
                                .await?;
                        }
                        match placed {
                            Ok(()) => {}
                            Err(PlaceError::Io(e)) => return Ok(self.suspend(txn, None, &e)),
                            Err(PlaceError::Lost) => {
                                return self
                                    .abandon(txn, ErrorClass::Integrity, None, "assembled artifact vanished before commit")
                                    .await;
                            }
                        }
                    }
                    Claim::Existing(record) => {
                        tracing::info!(
                            txn = %txn.id,
                            canonical = %record.canonical_path.display(),
                            "lost canonical race, referencing winner"
                        );
                        if let Err(e) = remove_file_if_present(&artifact).await {
                            return Ok(self.suspend(txn, None, &e));
                        }
                        let plan = CommitPlan::Reference {
                            sha256: record.fingerprint.sha256,
                            canonical_path: record.canonical_path,
                        };
                        self.log.set_commit_plan(txn, plan).await?;
                    }
                }
            }
            CommitPlan::Reference { sha256, canonical_path } => {
                self.dedup
                    .store()
                    .add_reference(&sha256, &txn.id, &txn.destination)
                    .await?;
                if let Err(e) = remove_file_if_present(&artifact).await {
                    return Ok(self.suspend(txn, None, &e));
                }
                tracing::debug!(txn = %txn.id, canonical = %canonical_path.display(), "reference recorded");
            }
        }

        self.log.complete(txn).await?;
        let outcome = self.outcome_of(txn)?;
        if let Some(done) = outcome.completed() {
            tracing::info!(
                txn = %txn.id,
                final_path = %done.final_path.display(),
                was_duplicate = done.was_duplicate,
                "download committed"
            );
        }
        Ok(outcome)
    }

    /// Rebuilds the fingerprint of a row that reached DEDUP_CHECK without one.
    async fn refingerprint(
        &self,
        txn: &mut DownloadTransaction,
    ) -> Result<Result<ContentFingerprint, TransactionOutcome>, ManagerError> {
        let artifact = txn.artifact_path();
        let sha256 = match sha256_sum(&artifact).await {
            Ok(sha256) => sha256,
            Err(IntegrityError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let outcome = self
                    .abandon(txn, ErrorClass::Integrity, None, "assembled artifact missing after restart")
                    .await?;
                return Ok(Err(outcome));
            }
            Err(e) => return Ok(Err(self.suspend(txn, None, &e))),
        };
        let fingerprint = match self
            .dedup
            .fingerprint(sha256, &artifact, txn.request.content_kind)
            .await
        {
            Ok(fingerprint) => fingerprint,
            Err(e) => return Ok(Err(self.suspend(txn, None, &e))),
        };
        self.log.set_fingerprint(txn, fingerprint.clone()).await?;
        Ok(Ok(fingerprint))
    }

    /// Picks the path a unique artifact is committed to. An existing file
    /// with other bytes is never replaced; the artifact goes next to it as
    /// `<stem>.<hash prefix>.<ext>` instead.
    async fn free_destination(&self, destination: &Path, sha256: &str) -> Result<PathBuf, IntegrityError> {
        let mut candidate = destination.to_path_buf();
        let mut attempt = 0u32;
        loop {
            match tokio::fs::metadata(&candidate).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
                Err(e) => return Err(e.into()),
                Ok(_) if sha256_sum(&candidate).await? == sha256 => return Ok(candidate),
                Ok(_) => {
                    tracing::info!(
                        occupied = %candidate.display(),
                        "destination holds different content, committing alongside"
                    );
                }
            }
            candidate = collision_path(destination, sha256, attempt);
            attempt += 1;
        }
    }

    async fn fetch_failed(
        &self,
        txn: &mut DownloadTransaction,
        err: StrategyError,
    ) -> Result<TransactionOutcome, ManagerError> {
        match err {
            StrategyError::Segment { failed, .. } => {
                let class = ErrorClass::from(&failed);
                self.abandon(txn, class, failed.index, failed.last_error.to_string())
                    .await
            }
            StrategyError::Manifest(e) => self.abandon(txn, ErrorClass::Manifest, None, e.to_string()).await,
            e @ StrategyError::NoSource(_) => {
                self.abandon(txn, ErrorClass::Manifest, None, e.to_string()).await
            }
            StrategyError::Disk { index, source } => Ok(self.suspend(txn, index, &source)),
            StrategyError::Cancelled => self.cancelled(txn).await,
            StrategyError::State(e) => Err(e.into()),
        }
    }

    /// A cancelled driver abandons the transaction, unless the whole engine
    /// is shutting down, in which case the row stays for recovery.
    async fn cancelled(&self, txn: &mut DownloadTransaction) -> Result<TransactionOutcome, ManagerError> {
        if self.shutdown.is_cancelled() {
            tracing::info!(txn = %txn.id, state = %txn.state, "interrupted by shutdown");
            return Err(ManagerError::ShuttingDown);
        }
        self.abandon(txn, ErrorClass::Cancelled, None, "cancelled by caller").await
    }

    async fn abandon(
        &self,
        txn: &mut DownloadTransaction,
        class: ErrorClass,
        segment_index: Option<u32>,
        message: impl Into<String>,
    ) -> Result<TransactionOutcome, ManagerError> {
        let report = txn.failure_report(class, segment_index, message);
        self.log.abandon(txn, report.clone()).await?;
        Ok(TransactionOutcome::Abandoned {
            transaction_id: txn.id.clone(),
            report,
        })
    }

    /// Stops on a disk error without touching the log, so the next recovery
    /// pass retries the same step.
    fn suspend(
        &self,
        txn: &DownloadTransaction,
        segment_index: Option<u32>,
        err: &dyn std::fmt::Display,
    ) -> TransactionOutcome {
        let report = txn.failure_report(ErrorClass::Disk, segment_index, err.to_string());
        tracing::error!(
            txn = %txn.id,
            state = %txn.state,
            segment = ?segment_index,
            error = %err,
            "transaction suspended on disk error"
        );
        TransactionOutcome::Suspended {
            transaction_id: txn.id.clone(),
            report,
        }
    }

    fn outcome_of(&self, txn: &DownloadTransaction) -> Result<TransactionOutcome, ManagerError> {
        match txn.state {
            TransactionState::Committed => {
                let done = completed_download(txn).ok_or_else(|| StateError::CorruptRow {
                    id: txn.id.clone(),
                    reason: "committed without fingerprint or commit plan".into(),
                })?;
                Ok(TransactionOutcome::Committed(done))
            }
            TransactionState::Abandoned => Ok(TransactionOutcome::Abandoned {
                transaction_id: txn.id.clone(),
                report: txn.failure.clone().unwrap_or_else(|| {
                    txn.failure_report(ErrorClass::Cancelled, None, "abandoned")
                }),
            }),
            state => Err(StateError::CorruptRow {
                id: txn.id.clone(),
                reason: format!("no outcome for a transaction in {state}"),
            }
            .into()),
        }
    }

    async fn sweep_orphans(&self, known: &HashSet<&str>) -> Result<(), ManagerError> {
        let mut entries = tokio::fs::read_dir(&self.config.storage.temp_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if known.contains(name) || !entry.file_type().await?.is_dir() {
                continue;
            }
            let busy = {
                let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
                active.contains_key(name)
            };
            if !busy {
                tracing::info!(dir = %entry.path().display(), "removing orphaned temp directory");
                purge_temp_dir(&entry.path()).await;
            }
        }
        Ok(())
    }
}

/// The record handed to the catalog, rebuilt from a COMMITTED row.
fn completed_download(txn: &DownloadTransaction) -> Option<CompletedDownload> {
    let fingerprint = txn.fingerprint.clone()?;
    let (final_path, was_duplicate) = match txn.commit.as_ref()? {
        CommitPlan::Canonical { final_path } => (final_path.clone(), false),
        CommitPlan::Reference { canonical_path, .. } => (canonical_path.clone(), true),
    };
    Some(CompletedDownload {
        transaction_id: txn.id.clone(),
        final_path,
        content_fingerprint: fingerprint,
        was_duplicate,
        content_kind: txn.request.content_kind,
    })
}

fn collision_path(destination: &Path, sha256: &str, attempt: u32) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "asset".to_string());
    let short = &sha256[..sha256.len().min(12)];
    let mut name = if attempt == 0 {
        format!("{stem}.{short}")
    } else {
        format!("{stem}.{short}-{attempt}")
    };
    if let Some(ext) = destination.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    destination.with_file_name(name)
}

/// Moves the artifact to `final_path`. A replay after a finished move, or a
/// destination already holding the same bytes, only drops the artifact.
async fn place_artifact(artifact: &Path, final_path: &Path, sha256: &str) -> Result<(), PlaceError> {
    let artifact_present = tokio::fs::try_exists(artifact).await.map_err(PlaceError::Io)?;
    let final_present = tokio::fs::try_exists(final_path).await.map_err(PlaceError::Io)?;

    if final_present {
        let existing = sha256_sum(final_path).await.map_err(|e| match e {
            IntegrityError::Io(e) => PlaceError::Io(e),
            other => PlaceError::Io(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
        })?;
        if existing == sha256 {
            if artifact_present {
                remove_file_if_present(artifact).await.map_err(PlaceError::Io)?;
            }
            return Ok(());
        }
        return Err(PlaceError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} appeared with different content", final_path.display()),
        )));
    }
    if !artifact_present {
        return Err(PlaceError::Lost);
    }

    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(PlaceError::Io)?;
    }
    if let Err(rename_err) = tokio::fs::rename(artifact, final_path).await {
        // Temp and library roots may sit on different filesystems.
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = final_path.with_file_name(format!(".{file_name}.odm-part"));
        tokio::fs::copy(artifact, &staging).await.map_err(PlaceError::Io)?;
        tokio::fs::File::open(&staging)
            .await
            .map_err(PlaceError::Io)?
            .sync_all()
            .await
            .map_err(PlaceError::Io)?;
        tokio::fs::rename(&staging, final_path).await.map_err(PlaceError::Io)?;
        remove_file_if_present(artifact).await.map_err(PlaceError::Io)?;
        tracing::debug!(error = %rename_err, "artifact copied instead of renamed");
    }
    Ok(())
}

async fn remove_file_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_names_keep_the_extension() {
        let dest = Path::new("/lib/c1/clip.mp4");
        let sha = "0123456789abcdef0123456789abcdef";
        assert_eq!(collision_path(dest, sha, 0), PathBuf::from("/lib/c1/clip.0123456789ab.mp4"));
        assert_eq!(collision_path(dest, sha, 2), PathBuf::from("/lib/c1/clip.0123456789ab-2.mp4"));
        assert_eq!(
            collision_path(Path::new("/lib/c1/README"), sha, 0),
            PathBuf::from("/lib/c1/README.0123456789ab")
        );
    }

    #[tokio::test]
    async fn placing_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("tmp/artifact.bin");
        let final_path = dir.path().join("lib/c1/out.bin");
        tokio::fs::create_dir_all(artifact.parent().unwrap()).await.unwrap();
        tokio::fs::write(&artifact, b"hello world").await.unwrap();
        let sha = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

        assert!(place_artifact(&artifact, &final_path, sha).await.is_ok());
        assert!(place_artifact(&artifact, &final_path, sha).await.is_ok());
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"hello world");
        assert!(!artifact.exists());

        tokio::fs::remove_file(&final_path).await.unwrap();
        assert!(matches!(
            place_artifact(&artifact, &final_path, sha).await,
            Err(PlaceError::Lost)
        ));
    }

    #[tokio::test]
    async fn placing_never_overwrites_other_content() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("artifact.bin");
        let final_path = dir.path().join("out.bin");
        tokio::fs::write(&artifact, b"new").await.unwrap();
        tokio::fs::write(&final_path, b"old").await.unwrap();

        let result = place_artifact(&artifact, &final_path, "not-the-hash").await;
        assert!(matches!(result, Err(PlaceError::Io(_))));
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"old");
        assert!(artifact.exists());
    }
}
