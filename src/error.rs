// src/error.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::models::Tier;

/// Failure of a single network attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("unexpected content type {0}")]
    UnexpectedContentType(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else {
            FetchError::Connection(err.to_string())
        }
    }
}

/// How the retry policy treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Terminal,
}

/// A segment (or manifest) fetch that ran out of options.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("segment {index:?} failed after {attempts} attempt(s) ({class:?}): {last_error}")]
pub struct SegmentFailed {
    /// `None` for manifest fetches.
    pub index: Option<u32>,
    pub attempts: u32,
    pub class: FailureClass,
    pub last_error: FetchError,
}

/// Errors surfaced by the segment worker pool.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Failed(#[from] SegmentFailed),
    #[error("disk error on segment {index:?}: {source}")]
    Disk {
        index: Option<u32>,
        #[source]
        source: std::io::Error,
    },
    #[error("fetch cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is empty")]
    Empty,
    #[error("malformed manifest: {0}")]
    Malformed(String),
    #[error("manifest advertises no usable variants")]
    NoUsableVariants,
    #[error("encrypted streams are not supported (method {0})")]
    Encrypted(String),
    #[error("variant playlists nest deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("size mismatch: expected {expected} bytes, assembled {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("hash mismatch: expected {expected}, assembled {actual}")]
    HashMismatch { expected: String, actual: String },
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("segment {0} is missing from temp storage")]
    MissingSegment(u32),
    #[error("transaction has no segment plan")]
    NoPlan,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("corrupt row for transaction {id}: {reason}")]
    CorruptRow { id: String, reason: String },
    #[error("illegal transition {from} -> {to} for transaction {id}")]
    IllegalTransition {
        id: String,
        from: crate::models::TransactionState,
        to: crate::models::TransactionState,
    },
    #[error("transaction {0} not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request has no content id")]
    MissingContentId,
    #[error("request for {0} has no source urls")]
    NoSources(String),
    #[error("destination template renders to an unsafe path: {0}")]
    InvalidDestination(String),
    #[error("unknown content kind {0}")]
    UnknownContentKind(String),
    #[error("unknown tier {0}")]
    UnknownTier(String),
    #[error("unknown transaction state {0}")]
    UnknownState(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Coarse class of a transaction failure, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    TerminalNetwork,
    Manifest,
    Integrity,
    Disk,
    Timeout,
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::TransientNetwork => "transient network error",
            ErrorClass::TerminalNetwork => "terminal network error",
            ErrorClass::Manifest => "manifest error",
            ErrorClass::Integrity => "integrity error",
            ErrorClass::Disk => "disk error",
            ErrorClass::Timeout => "transaction timeout",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a caller learns about a failed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{content_id}: {class} (tier {tier:?}, segment {segment_index:?}): {message}")]
pub struct FailureReport {
    pub content_id: String,
    pub tier: Option<Tier>,
    pub segment_index: Option<u32>,
    pub class: ErrorClass,
    pub message: String,
}

impl From<&SegmentFailed> for ErrorClass {
    fn from(failed: &SegmentFailed) -> Self {
        match failed.class {
            FailureClass::Transient => ErrorClass::TransientNetwork,
            FailureClass::Terminal => ErrorClass::TerminalNetwork,
        }
    }
}

/// Infrastructure failures of the engine itself. Per-transaction failures are
/// reported through `TransactionOutcome` instead.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transaction {0} not found")]
    TransactionNotFound(String),
    #[error("transaction {0} is already being driven")]
    AlreadyActive(String),
    #[error("transaction {id} is {state} and can no longer be cancelled")]
    NotCancellable {
        id: String,
        state: crate::models::TransactionState,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine is shutting down")]
    ShuttingDown,
}
