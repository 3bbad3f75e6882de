//! Playlist resolution: manifest bytes in, ordered segment plan out.
//!
//! Parsing is pure; the resolver only adds the manifest fetches, which go
//! through the segment worker pool with the same retry semantics as media.

pub mod dash;
pub mod hls;
mod xml;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::downloader::SegmentDownloader;
use crate::error::{ManifestError, SegmentError};
use crate::models::{SegmentPlan, SegmentSource, SourceFormat, SourceUrl};

/// Master playlists point at a variant; media playlists yield the plan.
const MAX_VARIANT_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Plan(SegmentPlan),
    /// The manifest was a master list; fetch and resolve this variant.
    Variant(Url),
}

/// Parses one manifest document fetched from `source_url`.
pub fn resolve_manifest(
    bytes: &[u8],
    source_url: &Url,
    format: SourceFormat,
) -> Result<Resolution, ManifestError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ManifestError::Empty);
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ManifestError::Malformed(format!("manifest is not utf-8: {e}")))?;
    match format {
        SourceFormat::HlsStream => hls::parse(text, source_url),
        SourceFormat::DashStream => dash::parse(text, source_url).map(Resolution::Plan),
        SourceFormat::DirectFile => Ok(Resolution::Plan(SegmentPlan::single(source_url.clone()))),
    }
}

/// Errors from resolving a manifest over the network.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

#[derive(Clone)]
pub struct PlaylistResolver {
    downloader: Arc<SegmentDownloader>,
}

impl PlaylistResolver {
    pub fn new(downloader: Arc<SegmentDownloader>) -> Self {
        Self { downloader }
    }

    /// Fetches and parses `source`, following a master playlist to its best
    /// variant.
    pub async fn resolve(
        &self,
        source: &SourceUrl,
        cancel: &CancellationToken,
    ) -> Result<SegmentPlan, ResolveError> {
        if source.format == SourceFormat::DirectFile {
            return Ok(SegmentPlan::single(source.url.clone()));
        }
        let mut url = source.url.clone();
        for _ in 0..MAX_VARIANT_DEPTH {
            let bytes = self
                .downloader
                .fetch_bytes(&SegmentSource::whole(url.clone()), cancel)
                .await?;
            match resolve_manifest(&bytes, &url, source.format)? {
                Resolution::Plan(plan) => {
                    tracing::info!(
                        manifest = %source.url,
                        segments = plan.len(),
                        duration_secs = plan.total_duration(),
                        "resolved segment plan"
                    );
                    return Ok(plan);
                }
                Resolution::Variant(next) => {
                    tracing::debug!(from = %url, to = %next, "following variant playlist");
                    url = next;
                }
            }
        }
        Err(ManifestError::TooDeep(MAX_VARIANT_DEPTH).into())
    }
}
