use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::ManagerError;
use crate::manager::DownloadEngine;
use crate::models::{CompletedDownload, DownloadRequest, TransactionOutcome};

/// Tally of one intake run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub committed: usize,
    pub duplicates: usize,
    pub abandoned: usize,
    pub suspended: usize,
    /// Requests refused before a transaction existed, or whose driver failed.
    pub rejected: usize,
}

impl QueueSummary {
    fn record(&mut self, outcome: &TransactionOutcome) {
        match outcome {
            TransactionOutcome::Committed(done) => {
                self.committed += 1;
                if done.was_duplicate {
                    self.duplicates += 1;
                }
            }
            TransactionOutcome::Abandoned { .. } => self.abandoned += 1,
            TransactionOutcome::Suspended { .. } => self.suspended += 1,
        }
    }
}

/// Feeds a stream of requests into the engine and forwards what commits.
pub struct RequestQueue {
    engine: Arc<DownloadEngine>,
}

impl RequestQueue {
    pub fn new(engine: Arc<DownloadEngine>) -> Self {
        Self { engine }
    }

    /// Recovers unfinished work, then drives every request received on
    /// `requests` until the channel closes (or the engine shuts down) and all
    /// drivers are done.
    ///
    /// At most `concurrency.max_transactions` requests are in progress at a
    /// time; the rest wait in the channel.
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<DownloadRequest>,
        completed: mpsc::Sender<CompletedDownload>,
    ) -> Result<QueueSummary, ManagerError> {
        let mut summary = QueueSummary::default();
        for outcome in self.engine.recover().await? {
            summary.record(&outcome);
            forward(&completed, outcome).await;
        }

        let limit = self.engine.config().concurrency.max_transactions;
        let mut running: JoinSet<(String, Result<TransactionOutcome, ManagerError>)> = JoinSet::new();

        loop {
            let request = tokio::select! {
                request = requests.recv() => request,
                _ = self.engine.stopped() => None,
            };
            let Some(request) = request else { break };
            while running.len() >= limit {
                if let Some(joined) = running.join_next().await {
                    self.settle(joined, &mut summary, &completed).await;
                }
            }
            let content_id = request.content_id.clone();
            let engine = self.engine.clone();
            running.spawn(async move { (content_id, engine.submit(request).await) });
        }
        while let Some(joined) = running.join_next().await {
            self.settle(joined, &mut summary, &completed).await;
        }

        tracing::info!(
            committed = summary.committed,
            duplicates = summary.duplicates,
            abandoned = summary.abandoned,
            suspended = summary.suspended,
            rejected = summary.rejected,
            "request stream drained"
        );
        Ok(summary)
    }

    async fn settle(
        &self,
        joined: Result<(String, Result<TransactionOutcome, ManagerError>), tokio::task::JoinError>,
        summary: &mut QueueSummary,
        completed: &mpsc::Sender<CompletedDownload>,
    ) {
        match joined {
            Ok((_, Ok(outcome))) => {
                summary.record(&outcome);
                forward(completed, outcome).await;
            }
            Ok((content_id, Err(e))) => {
                summary.rejected += 1;
                tracing::warn!(content_id = %content_id, error = %e, "request not processed");
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                summary.rejected += 1;
                tracing::warn!(error = %e, "request driver aborted");
            }
        }
    }
}

async fn forward(completed: &mpsc::Sender<CompletedDownload>, outcome: TransactionOutcome) {
    if let TransactionOutcome::Committed(done) = outcome {
        if completed.send(done).await.is_err() {
            tracing::debug!("completion receiver dropped");
        }
    }
}
