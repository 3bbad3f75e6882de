// src/assembler.rs

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::error::{AssemblyError, IntegrityError};
use crate::integrity::normalize_hash;
use crate::models::{DownloadRequest, DownloadTransaction};

/// The concatenated output of a transaction, still in temp storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    /// Lowercase hex SHA-256, computed while writing.
    pub sha256: String,
}

/// Concatenates the confirmed segments of `txn` in plan order into
/// `txn.artifact_path()`, replacing any earlier partial artifact.
///
/// A segment that is absent, or whose size differs from the one recorded when
/// it was confirmed, fails with `MissingSegment` so the caller can re-fetch it.
pub async fn assemble(txn: &DownloadTransaction) -> Result<AssembledArtifact, AssemblyError> {
    let plan = txn.plan.as_ref().ok_or(AssemblyError::NoPlan)?;
    let path = txn.artifact_path();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => tracing::debug!(txn = %txn.id, "discarded stale artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut out = BufWriter::new(File::create(&path).await?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;

    for segment in plan.segments() {
        let segment_path = txn.segment_path(segment.index);
        let mut input = match File::open(&segment_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AssemblyError::MissingSegment(segment.index));
            }
            Err(e) => return Err(e.into()),
        };
        let mut copied = 0u64;
        loop {
            let n = input.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            out.write_all(&buffer[..n]).await?;
            copied += n as u64;
        }
        if let Some(&recorded) = txn.segment_sizes.get(&segment.index) {
            if recorded != copied {
                return Err(AssemblyError::MissingSegment(segment.index));
            }
        }
        total += copied;
    }

    out.flush().await?;
    out.get_ref().sync_all().await?;

    let sha256 = format!("{:x}", hasher.finalize());
    tracing::debug!(
        txn = %txn.id,
        segments = plan.len(),
        bytes = total,
        sha256 = %sha256,
        "assembled artifact"
    );
    Ok(AssembledArtifact {
        path,
        bytes: total,
        sha256,
    })
}

/// Compares the artifact with the size and hash advertised by the source.
pub fn verify(artifact: &AssembledArtifact, request: &DownloadRequest) -> Result<(), IntegrityError> {
    if let Some(expected) = request.expected_size {
        if expected != artifact.bytes {
            return Err(IntegrityError::SizeMismatch {
                expected,
                actual: artifact.bytes,
            });
        }
    }
    if let Some(expected) = &request.expected_hash {
        let expected = normalize_hash(expected);
        if expected != artifact.sha256 {
            return Err(IntegrityError::HashMismatch {
                expected,
                actual: artifact.sha256.clone(),
            });
        }
    }
    Ok(())
}
