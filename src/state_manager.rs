// src/state_manager.rs

use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

use crate::error::StateError;
use crate::models::{DownloadTransaction, SegmentBitmap, TransactionState};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS transactions (
        id                  TEXT PRIMARY KEY,
        content_id          TEXT NOT NULL,
        state               TEXT NOT NULL,
        tier                TEXT,
        temp_dir            TEXT NOT NULL,
        destination         TEXT NOT NULL,
        completed_bitmap    BLOB NOT NULL,
        attempts_json       TEXT NOT NULL,
        integrity_restarts  INTEGER NOT NULL DEFAULT 0,
        txn_json            TEXT NOT NULL,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS transactions_state ON transactions (state);

    CREATE TABLE IF NOT EXISTS fingerprints (
        sha256          TEXT PRIMARY KEY,
        perceptual_hash INTEGER,
        canonical_path  TEXT NOT NULL,
        content_kind    TEXT NOT NULL,
        ref_count       INTEGER NOT NULL,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS fingerprints_perceptual ON fingerprints (perceptual_hash);

    CREATE TABLE IF NOT EXISTS content_refs (
        transaction_id  TEXT PRIMARY KEY,
        sha256          TEXT NOT NULL REFERENCES fingerprints (sha256),
        logical_path    TEXT NOT NULL,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS content_refs_sha ON content_refs (sha256);
";

/// Row shape as read back from SQLite, decoded outside the connection thread.
struct RawTransaction {
    id: String,
    completed_bitmap: Vec<u8>,
    txn_json: String,
}

/// Persists download transactions, one row each, to an SQLite database.
///
/// The handle is cheap to clone; every clone talks to the same background
/// connection, which serializes writes.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (creating if needed) the database file and its tables.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database(true).await?;
        Ok(manager)
    }

    /// A throwaway database, used by tests.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database(false).await?;
        Ok(manager)
    }

    async fn setup_database(&self, wal: bool) -> Result<(), StateError> {
        self.conn
            .call(move |conn| {
                if wal {
                    let _mode: String =
                        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
                }
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Handle for components sharing this database (the fingerprint store).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Writes the full row for `txn`, replacing any earlier version.
    ///
    /// Returns once SQLite has committed the write.
    pub async fn save_transaction(&self, txn: &DownloadTransaction) -> Result<(), StateError> {
        let txn_json = serde_json::to_string(txn)?;
        let attempts_json = serde_json::to_string(&txn.attempts)?;
        let id = txn.id.clone();
        let content_id = txn.request.content_id.clone();
        let state = txn.state.as_str();
        let tier = txn.tier.map(|t| t.as_str());
        let temp_dir = txn.temp_dir.to_string_lossy().into_owned();
        let destination = txn.destination.to_string_lossy().into_owned();
        let bitmap = txn.completed.as_bytes().to_vec();
        let integrity_restarts = txn.integrity_restarts;
        let created_at = txn.created_at.to_rfc3339();
        let updated_at = txn.updated_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO transactions (
                        id, content_id, state, tier, temp_dir, destination,
                        completed_bitmap, attempts_json, integrity_restarts,
                        txn_json, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        id,
                        content_id,
                        state,
                        tier,
                        temp_dir,
                        destination,
                        bitmap,
                        attempts_json,
                        integrity_restarts,
                        txn_json,
                        created_at,
                        updated_at
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_transaction(&self, id: &str) -> Result<Option<DownloadTransaction>, StateError> {
        let id = id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT id, completed_bitmap, txn_json FROM transactions WHERE id = ?1",
                        params![id],
                        raw_row,
                    )
                    .optional()?;
                Ok(raw)
            })
            .await?;
        raw.map(decode).transpose()
    }

    /// Every transaction not yet COMMITTED or ABANDONED, oldest first.
    pub async fn load_unfinished(&self) -> Result<Vec<DownloadTransaction>, StateError> {
        self.load_where("state NOT IN (?1, ?2)").await
    }

    /// Every COMMITTED or ABANDONED transaction still retained.
    pub async fn load_finished(&self) -> Result<Vec<DownloadTransaction>, StateError> {
        self.load_where("state IN (?1, ?2)").await
    }

    async fn load_where(&self, filter: &'static str) -> Result<Vec<DownloadTransaction>, StateError> {
        let rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT id, completed_bitmap, txn_json FROM transactions
                     WHERE {filter} ORDER BY created_at, id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        params![
                            TransactionState::Committed.as_str(),
                            TransactionState::Abandoned.as_str()
                        ],
                        raw_row,
                    )?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode).collect()
    }

    /// Drops every finished row. Returns the number removed.
    pub async fn delete_finished(&self) -> Result<usize, StateError> {
        let removed = self
            .conn
            .call(|conn| {
                let n = conn.execute(
                    "DELETE FROM transactions WHERE state IN (?1, ?2)",
                    params![
                        TransactionState::Committed.as_str(),
                        TransactionState::Abandoned.as_str()
                    ],
                )?;
                Ok(n)
            })
            .await?;
        Ok(removed)
    }
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTransaction> {
    Ok(RawTransaction {
        id: row.get(0)?,
        completed_bitmap: row.get(1)?,
        txn_json: row.get(2)?,
    })
}

fn decode(raw: RawTransaction) -> Result<DownloadTransaction, StateError> {
    let mut txn: DownloadTransaction =
        serde_json::from_str(&raw.txn_json).map_err(|e| StateError::CorruptRow {
            id: raw.id.clone(),
            reason: e.to_string(),
        })?;
    if txn.id != raw.id {
        return Err(StateError::CorruptRow {
            reason: format!("body belongs to {}", txn.id),
            id: raw.id,
        });
    }
    txn.completed = SegmentBitmap::from_bytes(raw.completed_bitmap);
    Ok(txn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentKind, DownloadRequest, SourceFormat, SourceUrl, Tier};
    use std::path::PathBuf;
    use url::Url;

    fn transaction(id: &str) -> DownloadTransaction {
        let request = DownloadRequest {
            content_id: format!("content-{id}"),
            sources: vec![SourceUrl {
                url: Url::parse("https://cdn.example.com/v/master.m3u8").unwrap(),
                format: SourceFormat::HlsStream,
            }],
            content_kind: ContentKind::Video,
            expected_hash: None,
            expected_size: None,
            destination_template: "{content_id}/{name}.{ext}".into(),
        };
        DownloadTransaction::new(
            id.to_string(),
            request,
            PathBuf::from("/library/out.mp4"),
            Path::new("/tmp/odm"),
        )
    }

    #[tokio::test]
    async fn saves_and_reloads_bitmap_and_counters() {
        let store = StateManager::in_memory().await.unwrap();
        let mut txn = transaction("a");
        txn.state = TransactionState::Fetching;
        txn.tier = Some(Tier::Segmented);
        txn.completed.insert(0);
        txn.completed.insert(2);
        txn.attempts.insert(2, 3);
        store.save_transaction(&txn).await.unwrap();

        let loaded = store.load_transaction("a").await.unwrap().unwrap();
        assert_eq!(loaded.state, TransactionState::Fetching);
        assert_eq!(loaded.tier, Some(Tier::Segmented));
        assert_eq!(loaded.completed.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(loaded.attempts_for(2), 3);
        assert!(store.load_transaction("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unfinished_scan_skips_terminal_rows() {
        let store = StateManager::in_memory().await.unwrap();
        for (id, state) in [
            ("a", TransactionState::Fetching),
            ("b", TransactionState::Committed),
            ("c", TransactionState::Abandoned),
            ("d", TransactionState::Committing),
        ] {
            let mut txn = transaction(id);
            txn.state = state;
            store.save_transaction(&txn).await.unwrap();
        }

        let mut ids: Vec<_> = store
            .load_unfinished()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "d"]);

        assert_eq!(store.load_finished().await.unwrap().len(), 2);
        assert_eq!(store.delete_finished().await.unwrap(), 2);
        assert!(store.load_finished().await.unwrap().is_empty());
        assert_eq!(store.load_unfinished().await.unwrap().len(), 2);
    }
}
