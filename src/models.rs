// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::error::{ErrorClass, FailureReport, RequestError};

/// What the bytes of an asset are expected to be.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Image,
    Video,
    Audio,
    Other,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Image => "image",
            ContentKind::Video => "video",
            ContentKind::Audio => "audio",
            ContentKind::Other => "other",
        }
    }

    /// Whether a response `Content-Type` is plausible for this kind.
    ///
    /// Generic binary types are accepted for every kind; a missing header is
    /// handled by the caller.
    pub fn accepts_mime(&self, mime: &str) -> bool {
        let mime = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/octet-stream" || mime == "binary/octet-stream" {
            return true;
        }
        match self {
            ContentKind::Image => mime.starts_with("image/"),
            ContentKind::Video => mime.starts_with("video/") || mime == "application/mp4",
            ContentKind::Audio => mime.starts_with("audio/") || mime == "application/mp4",
            ContentKind::Other => true,
        }
    }
}

impl FromStr for ContentKind {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(ContentKind::Image),
            "video" => Ok(ContentKind::Video),
            "audio" => Ok(ContentKind::Audio),
            "other" => Ok(ContentKind::Other),
            _ => Err(RequestError::UnknownContentKind(s.to_string())),
        }
    }
}

/// How a single source URL delivers its bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// A progressive file fetched with one streamed request.
    DirectFile,
    /// An HLS (`.m3u8`) playlist.
    HlsStream,
    /// A DASH (`.mpd`) manifest.
    DashStream,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceUrl {
    pub url: Url,
    pub format: SourceFormat,
}

/// One logical asset handed to the engine by the API client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Remote content id; also the partition of the destination directory.
    pub content_id: String,
    pub sources: Vec<SourceUrl>,
    pub content_kind: ContentKind,
    /// Hex SHA-256 advertised by the source, if any.
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub expected_size: Option<u64>,
    /// e.g. `{content_id}/{name}.{ext}`
    pub destination_template: String,
}

impl DownloadRequest {
    /// First progressive source, if the platform advertised one.
    pub fn direct_source(&self) -> Option<&SourceUrl> {
        self.sources
            .iter()
            .find(|s| s.format == SourceFormat::DirectFile)
    }

    /// First manifest source, if any.
    pub fn segmented_source(&self) -> Option<&SourceUrl> {
        self.sources
            .iter()
            .find(|s| matches!(s.format, SourceFormat::HlsStream | SourceFormat::DashStream))
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.content_id.trim().is_empty() {
            return Err(RequestError::MissingContentId);
        }
        if self.sources.is_empty() {
            return Err(RequestError::NoSources(self.content_id.clone()));
        }
        Ok(())
    }

    /// Resolves the destination template under `root`.
    ///
    /// The content id partitions the tree, so the template must not escape
    /// `root` through absolute paths or `..` components.
    pub fn resolve_destination(&self, root: &Path) -> Result<PathBuf, RequestError> {
        let primary = self
            .direct_source()
            .or_else(|| self.sources.first())
            .ok_or_else(|| RequestError::NoSources(self.content_id.clone()))?;
        let file_name = primary
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("asset");
        let (name, url_ext) = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, ext),
            _ => (file_name, ""),
        };
        let ext = match primary.format {
            SourceFormat::DirectFile if !url_ext.is_empty() => url_ext,
            // Segmented streams are concatenated transport/fragmented MP4.
            SourceFormat::HlsStream => "ts",
            SourceFormat::DashStream => "mp4",
            SourceFormat::DirectFile => "bin",
        };

        let rendered = self
            .destination_template
            .replace("{content_id}", &self.content_id)
            .replace("{name}", name)
            .replace("{ext}", ext)
            .replace("{kind}", self.content_kind.as_str());

        let relative = Path::new(&rendered);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if rendered.is_empty() || escapes {
            return Err(RequestError::InvalidDestination(rendered));
        }
        Ok(root.join(relative))
    }
}

/// A byte window of a remote resource. An open `length` means "to the end".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        let last = self
            .length
            .filter(|len| *len > 0)
            .and_then(|len| self.offset.checked_add(len - 1));
        match last {
            Some(last) => format!("bytes={}-{}", self.offset, last),
            None => format!("bytes={}-", self.offset),
        }
    }
}

/// Where one segment's bytes come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentSource {
    pub url: Url,
    #[serde(default)]
    pub range: Option<ByteRange>,
}

impl SegmentSource {
    pub fn whole(url: Url) -> Self {
        Self { url, range: None }
    }

    /// The byte count a successful response must carry, when it is known
    /// from the plan itself.
    pub fn planned_length(&self) -> Option<u64> {
        self.range.and_then(|r| r.length)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedSegment {
    pub index: u32,
    pub source: SegmentSource,
    /// Seconds, when the manifest states one.
    pub duration: Option<f64>,
}

/// Ordered list of segments that make up one asset. Indices are `0..len`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentPlan {
    segments: Vec<PlannedSegment>,
}

impl SegmentPlan {
    /// Builds a plan from sources in playback order.
    pub fn from_sources(sources: impl IntoIterator<Item = (SegmentSource, Option<f64>)>) -> Self {
        let segments = sources
            .into_iter()
            .enumerate()
            .map(|(i, (source, duration))| PlannedSegment {
                index: i as u32,
                source,
                duration,
            })
            .collect();
        Self { segments }
    }

    /// The plan of a direct download: one segment covering the whole file.
    pub fn single(url: Url) -> Self {
        Self::from_sources([(SegmentSource::whole(url), None)])
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[PlannedSegment] {
        &self.segments
    }

    pub fn get(&self, index: u32) -> Option<&PlannedSegment> {
        self.segments.get(index as usize)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().filter_map(|s| s.duration).sum()
    }
}

/// Which download path a transaction is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Direct,
    Segmented,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Direct => "direct",
            Tier::Segmented => "segmented",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Tier::Direct),
            "segmented" => Ok(Tier::Segmented),
            _ => Err(RequestError::UnknownTier(s.to_string())),
        }
    }
}

/// Durable lifecycle of a download transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Created,
    Fetching,
    Assembling,
    Verifying,
    DedupCheck,
    Committing,
    Committed,
    Abandoned,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Created => "created",
            TransactionState::Fetching => "fetching",
            TransactionState::Assembling => "assembling",
            TransactionState::Verifying => "verifying",
            TransactionState::DedupCheck => "dedup_check",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Abandoned)
    }

    /// Legal edges of the state machine.
    ///
    /// Besides the forward chain this admits the recovery rewinds
    /// (re-assembly, full re-fetch after an integrity failure, re-fetch of a
    /// segment that vanished from temp storage) and re-logging the current
    /// state when a crashed step is re-driven.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next || next == Abandoned {
            return true;
        }
        matches!(
            (self, next),
            (Created, Fetching)
                | (Fetching, Assembling)
                | (Assembling, Verifying)
                | (Assembling, Fetching)
                | (Verifying, Assembling)
                | (Verifying, Fetching)
                | (Verifying, DedupCheck)
                | (DedupCheck, Committing)
                | (Committing, Committed)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use TransactionState::*;
        Ok(match s {
            "created" => Created,
            "fetching" => Fetching,
            "assembling" => Assembling,
            "verifying" => Verifying,
            "dedup_check" => DedupCheck,
            "committing" => Committing,
            "committed" => Committed,
            "abandoned" => Abandoned,
            _ => return Err(RequestError::UnknownState(s.to_string())),
        })
    }
}

/// Set of segment indices confirmed on disk, stored as a little-endian bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentBitmap {
    bits: Vec<u8>,
}

impl SegmentBitmap {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bits: bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn insert(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        if self.bits.len() <= byte {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (index % 8);
    }

    pub fn remove(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        if let Some(b) = self.bits.get_mut(byte) {
            *b &= !(1 << (index % 8));
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.bits
            .get((index / 8) as usize)
            .map(|b| b & (1 << (index % 8)) != 0)
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter().enumerate().flat_map(|(byte, bits)| {
            (0..8u32)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| byte as u32 * 8 + bit)
        })
    }
}

/// Digest of an assembled artifact, used as the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentFingerprint {
    /// Lowercase hex SHA-256 of the full byte stream.
    pub sha256: String,
    /// 64-bit difference hash, image content only.
    #[serde(default)]
    pub perceptual: Option<u64>,
}

/// The physical home of one fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FingerprintRecord {
    pub fingerprint: ContentFingerprint,
    pub canonical_path: PathBuf,
    pub content_kind: ContentKind,
    pub ref_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A logical download pointing at a canonical file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentReference {
    pub transaction_id: String,
    pub sha256: String,
    pub logical_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// What COMMITTING will do; persisted before the step runs so a replay
/// repeats the same decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommitPlan {
    /// Move the artifact to `final_path` and make it canonical.
    Canonical { final_path: PathBuf },
    /// Discard the artifact and reference an existing canonical file.
    Reference { sha256: String, canonical_path: PathBuf },
}

/// The unit of durable state, one row in the transaction table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTransaction {
    pub id: String,
    pub request: DownloadRequest,
    pub state: TransactionState,
    pub tier: Option<Tier>,
    /// Resolved logical destination.
    pub destination: PathBuf,
    pub temp_dir: PathBuf,
    pub plan: Option<SegmentPlan>,
    #[serde(skip)]
    pub completed: SegmentBitmap,
    pub segment_sizes: BTreeMap<u32, u64>,
    pub attempts: BTreeMap<u32, u32>,
    pub integrity_restarts: u32,
    pub fingerprint: Option<ContentFingerprint>,
    pub commit: Option<CommitPlan>,
    pub failure: Option<FailureReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadTransaction {
    pub fn new(id: String, request: DownloadRequest, destination: PathBuf, temp_root: &Path) -> Self {
        let now = Utc::now();
        let temp_dir = temp_root.join(&id);
        Self {
            id,
            request,
            state: TransactionState::Created,
            tier: None,
            destination,
            temp_dir,
            plan: None,
            completed: SegmentBitmap::default(),
            segment_sizes: BTreeMap::new(),
            attempts: BTreeMap::new(),
            integrity_restarts: 0,
            fingerprint: None,
            commit: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.temp_dir.join("segments")
    }

    /// Confirmed location of a fetched segment.
    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.segments_dir().join(format!("seg-{index:06}.bin"))
    }

    /// In-progress location of a segment; renamed into place once verified.
    pub fn segment_part_path(&self, index: u32) -> PathBuf {
        self.segments_dir().join(format!("seg-{index:06}.part"))
    }

    /// Assembled artifact, always distinct from the destination.
    pub fn artifact_path(&self) -> PathBuf {
        self.temp_dir.join("artifact.bin")
    }

    /// Segments of the plan not yet confirmed on disk.
    pub fn missing_segments(&self) -> Vec<PlannedSegment> {
        self.plan
            .as_ref()
            .map(|plan| {
                plan.segments()
                    .iter()
                    .filter(|s| !self.completed.contains(s.index))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_segments_confirmed(&self) -> bool {
        match &self.plan {
            Some(plan) => plan.segments().iter().all(|s| self.completed.contains(s.index)),
            None => false,
        }
    }

    pub fn attempts_for(&self, index: u32) -> u32 {
        self.attempts.get(&index).copied().unwrap_or(0)
    }

    /// Builds the user-facing failure description for this transaction.
    pub fn failure_report(
        &self,
        class: ErrorClass,
        segment_index: Option<u32>,
        message: impl Into<String>,
    ) -> FailureReport {
        FailureReport {
            content_id: self.request.content_id.clone(),
            tier: self.tier,
            segment_index,
            class,
            message: message.into(),
        }
    }
}

/// Emitted to the catalog-sync collaborator once a transaction is COMMITTED.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedDownload {
    pub transaction_id: String,
    pub final_path: PathBuf,
    pub content_fingerprint: ContentFingerprint,
    pub was_duplicate: bool,
    pub content_kind: ContentKind,
}

/// Terminal result of driving one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed(CompletedDownload),
    Abandoned {
        transaction_id: String,
        report: FailureReport,
    },
    /// A disk error stopped the transaction; its last logged state is intact
    /// and the next recovery pass re-drives it.
    Suspended {
        transaction_id: String,
        report: FailureReport,
    },
}

impl TransactionOutcome {
    pub fn transaction_id(&self) -> &str {
        match self {
            TransactionOutcome::Committed(done) => &done.transaction_id,
            TransactionOutcome::Abandoned { transaction_id, .. }
            | TransactionOutcome::Suspended { transaction_id, .. } => transaction_id,
        }
    }

    pub fn completed(&self) -> Option<&CompletedDownload> {
        match self {
            TransactionOutcome::Committed(done) => Some(done),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(template: &str, url: &str, format: SourceFormat) -> DownloadRequest {
        DownloadRequest {
            content_id: "c42".into(),
            sources: vec![SourceUrl {
                url: Url::parse(url).unwrap(),
                format,
            }],
            content_kind: ContentKind::Video,
            expected_hash: None,
            expected_size: None,
            destination_template: template.into(),
        }
    }

    #[test]
    fn range_headers_stay_within_u64() {
        let bounded = ByteRange { offset: 100, length: Some(50) };
        assert_eq!(bounded.header_value(), "bytes=100-149");
        let open = ByteRange { offset: 100, length: None };
        assert_eq!(open.header_value(), "bytes=100-");
        let at_end = ByteRange { offset: u64::MAX, length: Some(2) };
        assert_eq!(at_end.header_value(), format!("bytes={}-", u64::MAX));
    }

    #[test]
    fn bitmap_tracks_sparse_indices() {
        let mut bitmap = SegmentBitmap::default();
        bitmap.insert(0);
        bitmap.insert(9);
        bitmap.insert(17);
        assert!(bitmap.contains(9));
        assert!(!bitmap.contains(8));
        assert_eq!(bitmap.count(), 3);
        bitmap.remove(9);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 17]);

        let restored = SegmentBitmap::from_bytes(bitmap.as_bytes().to_vec());
        assert_eq!(restored, bitmap);
    }

    #[test]
    fn destination_template_uses_url_name() {
        let req = request(
            "{content_id}/{name}.{ext}",
            "https://cdn.example.com/media/clip.mp4?token=1",
            SourceFormat::DirectFile,
        );
        let dest = req.resolve_destination(Path::new("/library")).unwrap();
        assert_eq!(dest, PathBuf::from("/library/c42/clip.mp4"));
    }

    #[test]
    fn segmented_destination_gets_stream_extension() {
        let req = request(
            "{kind}/{content_id}/{name}.{ext}",
            "https://cdn.example.com/hls/master.m3u8",
            SourceFormat::HlsStream,
        );
        let dest = req.resolve_destination(Path::new("/lib")).unwrap();
        assert_eq!(dest, PathBuf::from("/lib/video/c42/master.ts"));
    }

    #[test]
    fn destination_template_cannot_escape_root() {
        let req = request(
            "../{name}.{ext}",
            "https://cdn.example.com/a.mp4",
            SourceFormat::DirectFile,
        );
        assert!(matches!(
            req.resolve_destination(Path::new("/lib")),
            Err(RequestError::InvalidDestination(_))
        ));
    }

    #[test]
    fn state_machine_rejects_skipping_verification() {
        use TransactionState::*;
        assert!(Created.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Abandoned));
        assert!(Verifying.can_transition_to(Assembling));
        assert!(!Assembling.can_transition_to(DedupCheck));
        assert!(!Fetching.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Abandoned));
    }

    #[test]
    fn mime_guard_rejects_html_for_video() {
        assert!(ContentKind::Video.accepts_mime("video/mp4"));
        assert!(ContentKind::Video.accepts_mime("application/octet-stream"));
        assert!(!ContentKind::Video.accepts_mime("text/html; charset=utf-8"));
        assert!(ContentKind::Image.accepts_mime("image/jpeg"));
    }
}
