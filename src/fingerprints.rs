//! Fingerprint table and the logical references pointing into it.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;

use crate::error::StateError;
use crate::models::{ContentFingerprint, ContentKind, ContentReference, FingerprintRecord};
use crate::state_manager::StateManager;

const RECORD_COLUMNS: &str =
    "sha256, perceptual_hash, canonical_path, content_kind, ref_count, created_at";

/// Result of trying to make an artifact the canonical copy of its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// This transaction owns the canonical file.
    Claimed(FingerprintRecord),
    /// Another transaction got there first; a reference was recorded instead.
    Existing(FingerprintRecord),
}

impl Claim {
    pub fn record(&self) -> &FingerprintRecord {
        match self {
            Claim::Claimed(r) | Claim::Existing(r) => r,
        }
    }
}

#[derive(Clone)]
pub struct FingerprintStore {
    conn: Connection,
}

impl FingerprintStore {
    pub fn new(state: &StateManager) -> Self {
        Self {
            conn: state.connection().clone(),
        }
    }

    pub async fn get(&self, sha256: &str) -> Result<Option<FingerprintRecord>, StateError> {
        let sha256 = sha256.to_string();
        let record = self
            .conn
            .call(move |conn| Ok(select_record(conn, &sha256)?))
            .await?;
        Ok(record)
    }

    /// Records of `kind` that carry a perceptual hash.
    pub async fn perceptual_candidates(
        &self,
        kind: ContentKind,
    ) -> Result<Vec<FingerprintRecord>, StateError> {
        let records = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM fingerprints
                     WHERE perceptual_hash IS NOT NULL AND content_kind = ?1
                     ORDER BY created_at"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![kind.as_str()], record_row)?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }

    /// Logical records pointing at the canonical file of `sha256`.
    pub async fn references(&self, sha256: &str) -> Result<Vec<ContentReference>, StateError> {
        let sha256 = sha256.to_string();
        let refs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT transaction_id, sha256, logical_path, created_at
                     FROM content_refs WHERE sha256 = ?1 ORDER BY created_at, transaction_id",
                )?;
                let rows = stmt
                    .query_map(params![sha256], reference_row)?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        Ok(refs)
    }

    /// Atomically makes `canonical_path` the home of `fingerprint`, unless
    /// another transaction already claimed the hash.
    ///
    /// Either way a reference for `transaction_id` is recorded exactly once,
    /// so replaying a claim is harmless.
    pub async fn claim_canonical(
        &self,
        fingerprint: &ContentFingerprint,
        canonical_path: &Path,
        content_kind: ContentKind,
        transaction_id: &str,
        logical_path: &Path,
    ) -> Result<Claim, StateError> {
        let fingerprint = fingerprint.clone();
        let canonical = canonical_path.to_string_lossy().into_owned();
        let transaction_id = transaction_id.to_string();
        let logical = logical_path.to_string_lossy().into_owned();

        let claim = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now().to_rfc3339();
                let claim = match select_record(&tx, &fingerprint.sha256)? {
                    Some(existing) => {
                        insert_reference(&tx, &fingerprint.sha256, &transaction_id, &logical, &now)?;
                        let record = select_record(&tx, &fingerprint.sha256)?.unwrap_or(existing);
                        if record.canonical_path == Path::new(&canonical) {
                            Claim::Claimed(record)
                        } else {
                            Claim::Existing(record)
                        }
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO fingerprints (
                                sha256, perceptual_hash, canonical_path, content_kind,
                                ref_count, created_at
                            ) VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                            params![
                                fingerprint.sha256,
                                fingerprint.perceptual.map(|p| p as i64),
                                canonical,
                                content_kind.as_str(),
                                now
                            ],
                        )?;
                        insert_reference(&tx, &fingerprint.sha256, &transaction_id, &logical, &now)?;
                        match select_record(&tx, &fingerprint.sha256)? {
                            Some(record) => Claim::Claimed(record),
                            None => return Err(rusqlite::Error::QueryReturnedNoRows.into()),
                        }
                    }
                };
                tx.commit()?;
                Ok(claim)
            })
            .await?;
        Ok(claim)
    }

    /// Points `transaction_id` at the existing canonical file of `sha256`.
    ///
    /// Idempotent per transaction: the count only moves when a new reference
    /// row is written.
    pub async fn add_reference(
        &self,
        sha256: &str,
        transaction_id: &str,
        logical_path: &Path,
    ) -> Result<FingerprintRecord, StateError> {
        let sha = sha256.to_string();
        let transaction_id = transaction_id.to_string();
        let logical = logical_path.to_string_lossy().into_owned();
        let record = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if select_record(&tx, &sha)?.is_none() {
                    return Ok(None);
                }
                let now = Utc::now().to_rfc3339();
                insert_reference(&tx, &sha, &transaction_id, &logical, &now)?;
                let record = select_record(&tx, &sha)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;
        record.ok_or_else(|| StateError::NotFound(sha256.to_string()))
    }

    /// Undoes a claim whose file never reached `canonical_path`.
    ///
    /// Drops the reference of `transaction_id`, and the record itself once
    /// nothing else points at that path. Returns whether the record is gone.
    pub async fn release_claim(
        &self,
        sha256: &str,
        transaction_id: &str,
        canonical_path: &Path,
    ) -> Result<bool, StateError> {
        let sha = sha256.to_string();
        let transaction_id = transaction_id.to_string();
        let canonical = canonical_path.to_path_buf();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let dropped = tx.execute(
                    "DELETE FROM content_refs WHERE transaction_id = ?1 AND sha256 = ?2",
                    params![transaction_id, sha],
                )?;
                if dropped > 0 {
                    tx.execute(
                        "UPDATE fingerprints SET ref_count = MAX(ref_count - 1, 0) WHERE sha256 = ?1",
                        params![sha],
                    )?;
                }
                let removed = match select_record(&tx, &sha)? {
                    Some(record) if record.canonical_path == canonical && record.ref_count == 0 => {
                        tx.execute("DELETE FROM fingerprints WHERE sha256 = ?1", params![sha])?;
                        true
                    }
                    Some(_) => false,
                    None => true,
                };
                tx.commit()?;
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }
}

fn select_record(
    conn: &rusqlite::Connection,
    sha256: &str,
) -> rusqlite::Result<Option<FingerprintRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM fingerprints WHERE sha256 = ?1");
    conn.query_row(&sql, params![sha256], record_row).optional()
}

/// Adds the reference row if it is new and keeps `ref_count` in step.
fn insert_reference(
    conn: &rusqlite::Connection,
    sha256: &str,
    transaction_id: &str,
    logical_path: &str,
    now: &str,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO content_refs (transaction_id, sha256, logical_path, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![transaction_id, sha256, logical_path, now],
    )?;
    if inserted > 0 {
        conn.execute(
            "UPDATE fingerprints SET ref_count = ref_count + 1 WHERE sha256 = ?1",
            params![sha256],
        )?;
    }
    Ok(inserted > 0)
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_time(column: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FingerprintRecord> {
    let perceptual: Option<i64> = row.get(1)?;
    let canonical: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let ref_count: i64 = row.get(4)?;
    let created: String = row.get(5)?;
    Ok(FingerprintRecord {
        fingerprint: ContentFingerprint {
            sha256: row.get(0)?,
            perceptual: perceptual.map(|p| p as u64),
        },
        canonical_path: PathBuf::from(canonical),
        content_kind: kind.parse().map_err(|e| conversion_error(3, e))?,
        ref_count: ref_count.max(0) as u64,
        created_at: parse_time(5, &created)?,
    })
}

fn reference_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentReference> {
    let logical: String = row.get(2)?;
    let created: String = row.get(3)?;
    Ok(ContentReference {
        transaction_id: row.get(0)?,
        sha256: row.get(1)?,
        logical_path: PathBuf::from(logical),
        created_at: parse_time(3, &created)?,
    })
}
