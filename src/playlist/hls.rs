//! HLS master and media playlists.

use std::collections::HashMap;
use url::Url;

use super::Resolution;
use crate::error::ManifestError;
use crate::models::{ByteRange, SegmentPlan, SegmentSource};

/// One `#EXT-X-STREAM-INF` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: Url,
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
}

impl Variant {
    fn pixels(&self) -> u64 {
        self.resolution
            .map(|(w, h)| u64::from(w) * u64::from(h))
            .unwrap_or(0)
    }
}

pub fn parse(text: &str, base: &Url) -> Result<Resolution, ManifestError> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty());
    match lines.next() {
        None => return Err(ManifestError::Empty),
        Some(first) if first.trim_start_matches('\u{feff}') == "#EXTM3U" => {}
        Some(_) => return Err(ManifestError::Malformed("missing #EXTM3U header".into())),
    }

    if text.contains("#EXT-X-STREAM-INF") {
        let variants = parse_variants(text, base)?;
        let best = select_variant(&variants).ok_or(ManifestError::NoUsableVariants)?;
        tracing::debug!(
            variants = variants.len(),
            bandwidth = best.bandwidth,
            resolution = ?best.resolution,
            "selected HLS variant"
        );
        return Ok(Resolution::Variant(best.uri.clone()));
    }
    parse_media(text, base).map(Resolution::Plan)
}

/// Highest bandwidth wins; resolution breaks ties.
pub fn select_variant(variants: &[Variant]) -> Option<&Variant> {
    variants
        .iter()
        .max_by_key(|v| (v.bandwidth, v.pixels()))
}

fn parse_variants(text: &str, base: &Url) -> Result<Vec<Variant>, ManifestError> {
    let mut variants = Vec::new();
    let mut pending: Option<HashMap<String, String>> = None;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending = Some(parse_attributes(attrs));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        // A URI line belongs to the preceding STREAM-INF, if any.
        let Some(attrs) = pending.take() else {
            continue;
        };
        let uri = join(base, line)?;
        let bandwidth = attrs
            .get("BANDWIDTH")
            .or_else(|| attrs.get("AVERAGE-BANDWIDTH"))
            .and_then(|b| b.parse().ok())
            .unwrap_or(0);
        let resolution = attrs.get("RESOLUTION").and_then(|r| {
            let (w, h) = r.split_once(['x', 'X'])?;
            Some((w.parse().ok()?, h.parse().ok()?))
        });
        variants.push(Variant {
            uri,
            bandwidth,
            resolution,
        });
    }
    Ok(variants)
}

fn parse_media(text: &str, base: &Url) -> Result<SegmentPlan, ManifestError> {
    let mut sources: Vec<(SegmentSource, Option<f64>)> = Vec::new();
    let mut duration: Option<f64> = None;
    let mut byterange: Option<(u64, Option<u64>)> = None;
    let mut current_map: Option<SegmentSource> = None;
    // End offset of the last sub-range per resource, for implicit offsets.
    let mut range_ends: HashMap<Url, u64> = HashMap::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let value = rest.split(',').next().unwrap_or_default().trim();
            let secs = value
                .parse::<f64>()
                .map_err(|_| ManifestError::Malformed(format!("bad #EXTINF duration {value:?}")))?;
            duration = Some(secs);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            byterange = Some(parse_byterange(rest)?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attributes(rest);
            let method = attrs.get("METHOD").map(String::as_str).unwrap_or("NONE");
            if method != "NONE" {
                return Err(ManifestError::Encrypted(method.to_string()));
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(rest);
            let uri = attrs
                .get("URI")
                .ok_or_else(|| ManifestError::Malformed("#EXT-X-MAP without URI".into()))?;
            let url = join(base, uri)?;
            let range = match attrs.get("BYTERANGE") {
                Some(r) => {
                    let (length, offset) = parse_byterange(r)?;
                    let offset = offset.unwrap_or(0);
                    range_end(offset, length)?;
                    Some(ByteRange {
                        offset,
                        length: Some(length),
                    })
                }
                None => None,
            };
            let map = SegmentSource { url, range };
            // A new initialization section takes effect from here on.
            if current_map.as_ref() != Some(&map) {
                sources.push((map.clone(), None));
                current_map = Some(map);
            }
        } else if line.starts_with('#') {
            continue;
        } else {
            let url = join(base, line)?;
            let range = match byterange.take() {
                Some((length, offset)) => {
                    let offset = match offset {
                        Some(o) => o,
                        None => *range_ends.get(&url).ok_or_else(|| {
                            ManifestError::Malformed(format!(
                                "byte range without offset for first sub-range of {url}"
                            ))
                        })?,
                    };
                    range_ends.insert(url.clone(), range_end(offset, length)?);
                    Some(ByteRange {
                        offset,
                        length: Some(length),
                    })
                }
                None => None,
            };
            sources.push((SegmentSource { url, range }, duration.take()));
        }
    }

    let has_media = sources.iter().any(|(_, d)| d.is_some());
    if !has_media {
        return Err(ManifestError::Empty);
    }
    Ok(SegmentPlan::from_sources(sources))
}

/// First byte past a sub-range, rejecting ranges beyond `u64`.
fn range_end(offset: u64, length: u64) -> Result<u64, ManifestError> {
    offset
        .checked_add(length)
        .ok_or_else(|| ManifestError::Malformed(format!("byte range {length}@{offset} overflows")))
}

/// `<n>[@<o>]`
fn parse_byterange(value: &str) -> Result<(u64, Option<u64>), ManifestError> {
    let value = value.trim().trim_matches('"');
    let bad = || ManifestError::Malformed(format!("bad byte range {value:?}"));
    match value.split_once('@') {
        Some((len, off)) => Ok((
            len.parse().map_err(|_| bad())?,
            Some(off.parse().map_err(|_| bad())?),
        )),
        None => Ok((value.parse().map_err(|_| bad())?, None)),
    }
}

/// Attribute list of an HLS tag; quoted values may contain commas.
pub fn parse_attributes(list: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = list.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_string();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((v, r)) => (v.to_string(), r),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.split_once(',') {
                Some((v, r)) => (v.trim().to_string(), r),
                None => (after.trim().to_string(), ""),
            }
        };
        attrs.insert(key, value);
        rest = remaining.trim_start_matches(',').trim();
    }
    attrs
}

fn join(base: &Url, reference: &str) -> Result<Url, ManifestError> {
    base.join(reference)
        .map_err(|e| ManifestError::Malformed(format!("bad uri {reference:?}: {e}")))
}
