// src/main.rs

use anyhow::{bail, Context, Result};
use odm_media::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// `odm-media <config.toml>`
///
/// Reads one JSON `DownloadRequest` per line on stdin and prints one JSON
/// `CompletedDownload` per line on stdout. Logs go to stderr.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("odm_media=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next().map(PathBuf::from) else {
        bail!("usage: odm-media <config.toml>");
    };
    let config = EngineConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let capacity = config.concurrency.max_transactions * 4;

    let engine = Arc::new(DownloadEngine::with_http(config).await?);
    let queue = RequestQueue::new(engine.clone());

    let (request_tx, request_rx) = mpsc::channel::<DownloadRequest>(capacity);
    let (done_tx, mut done_rx) = mpsc::channel::<CompletedDownload>(capacity);

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DownloadRequest>(&line) {
                Ok(request) => {
                    if request_tx.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(line = line_no, error = %e, "skipping malformed request"),
            }
        }
        anyhow::Ok(())
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(done) = done_rx.recv().await {
            let mut line = serde_json::to_vec(&done)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let shutdown_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_engine.shutdown();
        }
    });

    let summary = queue.run(request_rx, done_tx).await?;
    reader.abort();
    writer.await??;

    tracing::info!(
        committed = summary.committed,
        duplicates = summary.duplicates,
        abandoned = summary.abandoned,
        suspended = summary.suspended,
        rejected = summary.rejected,
        "done"
    );
    Ok(())
}
