//! Duplicate detection against the fingerprint store.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::OwnedMutexGuard;

use crate::error::{ConfigError, StateError};
use crate::fingerprints::FingerprintStore;
use crate::integrity::{hamming_distance, perceptual_hash};
use crate::locks::KeyedLocks;
use crate::models::{ContentFingerprint, ContentKind, FingerprintRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupMode {
    /// Exact SHA-256 matches only.
    #[default]
    Strict,
    /// Also treat near-identical images with variant file names as duplicates.
    Trusting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub mode: DedupMode,
    /// Largest Hamming distance between perceptual hashes still counted as
    /// the same image.
    pub perceptual_distance: u32,
    /// File name schemes of remote image variants. Each regex needs a named
    /// `stem` group; two names are variants of each other when one pattern
    /// matches both with the same stem.
    pub variant_patterns: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            mode: DedupMode::Strict,
            perceptual_distance: 6,
            variant_patterns: vec![
                r"(?i)^(?P<stem>.+?)(?:[._-](?:\d{2,5}x\d{2,5}|thumb|thumbnail|small|medium|large|orig|original|hd|sd|q\d{1,3})|@[1-4]x)*\.(?:jpe?g|png|webp|gif|avif)$".into(),
            ],
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.perceptual_distance > 64 {
            return Err(ConfigError::Invalid(
                "dedup.perceptual_distance cannot exceed 64".into(),
            ));
        }
        self.compile_patterns().map(|_| ())
    }

    fn compile_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.variant_patterns
            .iter()
            .map(|pattern| {
                let regex = Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!("dedup.variant_patterns: {e}"))
                })?;
                if !regex.capture_names().flatten().any(|n| n == "stem") {
                    return Err(ConfigError::Invalid(format!(
                        "dedup.variant_patterns: {pattern:?} has no `stem` group"
                    )));
                }
                Ok(regex)
            })
            .collect()
    }
}

/// Why a fingerprint was judged a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Hash,
    Perceptual { distance: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    Unique,
    Duplicate {
        record: FingerprintRecord,
        matched_by: MatchKind,
    },
}

pub struct DedupEngine {
    config: DedupConfig,
    patterns: Vec<Regex>,
    store: FingerprintStore,
    locks: KeyedLocks<String>,
}

impl DedupEngine {
    pub fn new(config: DedupConfig, store: FingerprintStore) -> Result<Self, ConfigError> {
        let patterns = config.compile_patterns()?;
        Ok(Self {
            config,
            patterns,
            store,
            locks: KeyedLocks::new(),
        })
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    /// Serializes lookup-then-claim for one strong hash.
    pub async fn lock(&self, sha256: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(&sha256.to_string()).await
    }

    /// Serializes lookup-then-claim for all variants of one image name.
    ///
    /// Only trusting mode matches across hashes, so only it takes this lock.
    /// Taken after [`DedupEngine::lock`], never before.
    pub async fn lock_variant(&self, destination: &Path, kind: ContentKind) -> Option<OwnedMutexGuard<()>> {
        let key = self.variant_key(destination, kind)?;
        Some(self.locks.lock(&key).await)
    }

    /// Lock key shared by every file name one pattern maps to the same stem.
    pub fn variant_key(&self, destination: &Path, kind: ContentKind) -> Option<String> {
        if self.config.mode != DedupMode::Trusting || kind != ContentKind::Image {
            return None;
        }
        let name = destination.file_name()?.to_str()?;
        self.patterns.iter().enumerate().find_map(|(n, pattern)| {
            let stem = pattern.captures(name)?.name("stem")?.as_str().to_ascii_lowercase();
            Some(format!("variant:{n}:{stem}"))
        })
    }

    /// Builds the fingerprint of an assembled artifact whose SHA-256 is
    /// already known. Images also get a perceptual hash.
    pub async fn fingerprint(
        &self,
        sha256: String,
        artifact: &Path,
        kind: ContentKind,
    ) -> std::io::Result<ContentFingerprint> {
        let perceptual = if kind == ContentKind::Image {
            let bytes = tokio::fs::read(artifact).await?;
            tokio::task::spawn_blocking(move || perceptual_hash(&bytes))
                .await
                .ok()
                .flatten()
        } else {
            None
        };
        Ok(ContentFingerprint { sha256, perceptual })
    }

    /// Looks `fingerprint` up according to the configured mode.
    ///
    /// Callers hold [`DedupEngine::lock`] for the hash until the commit that
    /// acts on the decision has finished.
    pub async fn check(
        &self,
        fingerprint: &ContentFingerprint,
        destination: &Path,
        kind: ContentKind,
    ) -> Result<DedupDecision, StateError> {
        if let Some(record) = self.store.get(&fingerprint.sha256).await? {
            return Ok(DedupDecision::Duplicate {
                record,
                matched_by: MatchKind::Hash,
            });
        }
        if self.config.mode == DedupMode::Strict || kind != ContentKind::Image {
            return Ok(DedupDecision::Unique);
        }
        let Some(ours) = fingerprint.perceptual else {
            return Ok(DedupDecision::Unique);
        };

        let mut best: Option<(u32, FingerprintRecord)> = None;
        for candidate in self.store.perceptual_candidates(kind).await? {
            let Some(theirs) = candidate.fingerprint.perceptual else {
                continue;
            };
            let distance = hamming_distance(ours, theirs);
            if distance > self.config.perceptual_distance
                || !self.same_variant(destination, &candidate.canonical_path)
            {
                continue;
            }
            if best.as_ref().map_or(true, |(d, _)| distance < *d) {
                best = Some((distance, candidate));
            }
        }
        Ok(match best {
            Some((distance, record)) => DedupDecision::Duplicate {
                record,
                matched_by: MatchKind::Perceptual { distance },
            },
            None => DedupDecision::Unique,
        })
    }

    /// Whether two file names are variants of one remote image.
    pub fn same_variant(&self, a: &Path, b: &Path) -> bool {
        let (Some(a), Some(b)) = (
            a.file_name().and_then(|n| n.to_str()),
            b.file_name().and_then(|n| n.to_str()),
        ) else {
            return false;
        };
        self.patterns.iter().any(|pattern| {
            let stem_a = pattern.captures(a).and_then(|c| c.name("stem")).map(|m| m.as_str());
            let stem_b = pattern.captures(b).and_then(|c| c.name("stem")).map(|m| m.as_str());
            matches!((stem_a, stem_b), (Some(x), Some(y)) if x.eq_ignore_ascii_case(y))
        })
    }
}
