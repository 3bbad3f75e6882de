//! DASH MPD manifests.

use regex::{Captures, Regex};
use std::sync::OnceLock;
use url::Url;

use super::xml::{self, Element};
use crate::error::ManifestError;
use crate::models::{ByteRange, SegmentPlan, SegmentSource};

/// Upper bound on segments derived from a template and a duration.
const MAX_TEMPLATE_SEGMENTS: u64 = 200_000;

struct Candidate<'a> {
    rep: &'a Element,
    adaptation: &'a Element,
    period: &'a Element,
    base: Url,
    bandwidth: u64,
    pixels: u64,
}

pub fn parse(text: &str, manifest_url: &Url) -> Result<SegmentPlan, ManifestError> {
    let root = xml::parse(text)?;
    if root.name != "MPD" {
        return Err(ManifestError::Malformed(format!(
            "root element is <{}>, expected <MPD>",
            root.name
        )));
    }
    let presentation_secs = root
        .attr("mediaPresentationDuration")
        .map(parse_iso_duration)
        .transpose()?;

    let mpd_base = with_base_url(manifest_url.clone(), &root)?;
    // Multi-period presentations keep the first period only.
    let period = root
        .child("Period")
        .ok_or(ManifestError::NoUsableVariants)?;
    let period_secs = period
        .attr("duration")
        .map(parse_iso_duration)
        .transpose()?
        .or(presentation_secs);
    let period_base = with_base_url(mpd_base, period)?;

    let mut candidates = Vec::new();
    for adaptation in period.children_named("AdaptationSet") {
        let set_base = with_base_url(period_base.clone(), adaptation)?;
        for rep in adaptation.children_named("Representation") {
            if !is_video_or_unspecified(rep, adaptation) {
                continue;
            }
            let width: u64 = number_attr(rep, adaptation, "width").unwrap_or(0);
            let height: u64 = number_attr(rep, adaptation, "height").unwrap_or(0);
            candidates.push(Candidate {
                rep,
                adaptation,
                period,
                base: with_base_url(set_base.clone(), rep)?,
                bandwidth: number_attr(rep, adaptation, "bandwidth").unwrap_or(0),
                pixels: width.checked_mul(height).ok_or_else(|| {
                    ManifestError::Malformed(format!("representation size {width}x{height} overflows"))
                })?,
            });
        }
    }

    let best = candidates
        .iter()
        .max_by_key(|c| (c.bandwidth, c.pixels))
        .ok_or(ManifestError::NoUsableVariants)?;
    tracing::debug!(
        representations = candidates.len(),
        bandwidth = best.bandwidth,
        id = best.rep.attr("id").unwrap_or_default(),
        "selected DASH representation"
    );

    let plan = build_plan(best, period_secs)?;
    if plan.is_empty() {
        return Err(ManifestError::NoUsableVariants);
    }
    Ok(plan)
}

fn is_video_or_unspecified(rep: &Element, adaptation: &Element) -> bool {
    let kind = rep
        .attr("mimeType")
        .or_else(|| adaptation.attr("mimeType"))
        .or_else(|| adaptation.attr("contentType"))
        .unwrap_or("video");
    !(kind.starts_with("audio") || kind.starts_with("text") || kind.starts_with("application/ttml"))
}

fn number_attr(rep: &Element, adaptation: &Element, name: &str) -> Option<u64> {
    rep.attr(name)
        .or_else(|| adaptation.attr(name))
        .and_then(|v| v.parse().ok())
}

fn with_base_url(parent: Url, element: &Element) -> Result<Url, ManifestError> {
    match element.child("BaseURL") {
        Some(base) if !base.text.is_empty() => join(&parent, &base.text),
        _ => Ok(parent),
    }
}

/// Nearest definition of a segment-info element, Representation first.
fn inherited<'a>(c: &Candidate<'a>, name: &str) -> Option<&'a Element> {
    c.rep
        .child(name)
        .or_else(|| c.adaptation.child(name))
        .or_else(|| c.period.child(name))
}

fn build_plan(c: &Candidate<'_>, period_secs: Option<f64>) -> Result<SegmentPlan, ManifestError> {
    if let Some(list) = inherited(c, "SegmentList") {
        return segment_list(c, list);
    }
    if let Some(template) = inherited(c, "SegmentTemplate") {
        return segment_template(c, template, period_secs);
    }
    // SegmentBase or bare BaseURL: the representation is one file.
    Ok(SegmentPlan::from_sources([(
        SegmentSource::whole(c.base.clone()),
        period_secs,
    )]))
}

fn segment_list(c: &Candidate<'_>, list: &Element) -> Result<SegmentPlan, ManifestError> {
    let timescale = list
        .attr("timescale")
        .and_then(|t| t.parse::<f64>().ok())
        .unwrap_or(1.0);
    let seg_secs = list
        .attr("duration")
        .and_then(|d| d.parse::<f64>().ok())
        .map(|d| d / timescale);

    let mut sources = Vec::new();
    if let Some(init) = list.child("Initialization") {
        sources.push((initialization(c, init)?, None));
    }
    for seg in list.children_named("SegmentURL") {
        let url = match seg.attr("media") {
            Some(media) => join(&c.base, media)?,
            None => c.base.clone(),
        };
        let range = seg.attr("mediaRange").map(parse_range).transpose()?;
        sources.push((SegmentSource { url, range }, seg_secs));
    }
    Ok(SegmentPlan::from_sources(sources))
}

fn initialization(c: &Candidate<'_>, init: &Element) -> Result<SegmentSource, ManifestError> {
    let url = match init.attr("sourceURL") {
        Some(src) => join(&c.base, src)?,
        None => c.base.clone(),
    };
    let range = init.attr("range").map(parse_range).transpose()?;
    Ok(SegmentSource { url, range })
}

fn segment_template(
    c: &Candidate<'_>,
    template: &Element,
    period_secs: Option<f64>,
) -> Result<SegmentPlan, ManifestError> {
    let rep_id = c.rep.attr("id").unwrap_or_default();
    let media = template
        .attr("media")
        .ok_or_else(|| ManifestError::Malformed("SegmentTemplate without media".into()))?;
    let timescale: u64 = template
        .attr("timescale")
        .and_then(|t| t.parse().ok())
        .filter(|t| *t > 0)
        .unwrap_or(1);
    let start_number: u64 = template
        .attr("startNumber")
        .and_then(|n| n.parse().ok())
        .unwrap_or(1);

    let mut sources = Vec::new();
    if let Some(init) = template.attr("initialization") {
        let path = expand_template(init, rep_id, c.bandwidth, None, None);
        sources.push((SegmentSource::whole(join(&c.base, &path)?), None));
    }

    // (start time, duration) in timescale units, one per media segment.
    let mut timeline: Vec<(u64, u64)> = Vec::new();
    let overflow = || ManifestError::Malformed("segment times overflow".into());
    if let Some(tl) = template.child("SegmentTimeline") {
        let period_end = period_secs.map(|s| (s * timescale as f64).round() as u64);
        let mut next_start = 0u64;
        let entries: Vec<&Element> = tl.children_named("S").collect();
        for (pos, s) in entries.iter().enumerate() {
            let d: u64 = s
                .attr("d")
                .and_then(|d| d.parse().ok())
                .filter(|d| *d > 0)
                .ok_or_else(|| ManifestError::Malformed("SegmentTimeline S without d".into()))?;
            let t: u64 = s.attr("t").and_then(|t| t.parse().ok()).unwrap_or(next_start);
            let r: i64 = s.attr("r").and_then(|r| r.parse().ok()).unwrap_or(0);
            let repeats = if r >= 0 {
                r as u64
            } else {
                // Repeat until the next S or the end of the period.
                let end = entries
                    .get(pos + 1)
                    .and_then(|n| n.attr("t"))
                    .and_then(|t| t.parse::<u64>().ok())
                    .or(period_end)
                    .ok_or_else(|| {
                        ManifestError::Malformed("open-ended S repeat with no period end".into())
                    })?;
                end.saturating_sub(t).div_ceil(d).saturating_sub(1)
            };
            let count = repeats.checked_add(1).ok_or_else(overflow)?;
            if (timeline.len() as u64).saturating_add(count) > MAX_TEMPLATE_SEGMENTS {
                return Err(ManifestError::Malformed("segment timeline is too long".into()));
            }
            for k in 0..count {
                let start = k.checked_mul(d).and_then(|o| t.checked_add(o)).ok_or_else(overflow)?;
                timeline.push((start, d));
            }
            next_start = count.checked_mul(d).and_then(|span| t.checked_add(span)).ok_or_else(overflow)?;
        }
    } else {
        let d: u64 = template
            .attr("duration")
            .and_then(|d| d.parse().ok())
            .filter(|d| *d > 0)
            .ok_or_else(|| {
                ManifestError::Malformed("SegmentTemplate needs duration or SegmentTimeline".into())
            })?;
        let total = period_secs.ok_or_else(|| {
            ManifestError::Malformed("SegmentTemplate duration without presentation length".into())
        })?;
        let count = ((total * timescale as f64) / d as f64).ceil() as u64;
        if count > MAX_TEMPLATE_SEGMENTS {
            return Err(ManifestError::Malformed(format!("{count} template segments is too many")));
        }
        for i in 0..count {
            timeline.push((i.checked_mul(d).ok_or_else(overflow)?, d));
        }
    }

    for (i, (time, duration)) in timeline.into_iter().enumerate() {
        let number = start_number.checked_add(i as u64).ok_or_else(overflow)?;
        let path = expand_template(media, rep_id, c.bandwidth, Some(number), Some(time));
        sources.push((
            SegmentSource::whole(join(&c.base, &path)?),
            Some(duration as f64 / timescale as f64),
        ));
    }
    Ok(SegmentPlan::from_sources(sources))
}

fn identifier_regex() -> &'static Regex {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT.get_or_init(|| {
        Regex::new(r"\$(?:(RepresentationID|Number|Bandwidth|Time)(?:%0(\d+)d)?)?\$")
            .expect("static regex")
    })
}

/// Substitutes `$RepresentationID$`, `$Number$`, `$Bandwidth$`, `$Time$`
/// (with optional `%0Nd` width) and `$$`.
pub fn expand_template(
    template: &str,
    rep_id: &str,
    bandwidth: u64,
    number: Option<u64>,
    time: Option<u64>,
) -> String {
    identifier_regex()
        .replace_all(template, |caps: &Captures<'_>| {
            let Some(ident) = caps.get(1) else {
                return "$".to_string();
            };
            let width: usize = caps.get(2).and_then(|w| w.as_str().parse().ok()).unwrap_or(0);
            let value = match ident.as_str() {
                "RepresentationID" => return rep_id.to_string(),
                "Number" => number,
                "Bandwidth" => Some(bandwidth),
                "Time" => time,
                _ => None,
            };
            match value {
                Some(v) => format!("{v:0width$}"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// ISO 8601 durations of the `PnDTnHnMnS` form, in seconds.
pub fn parse_iso_duration(value: &str) -> Result<f64, ManifestError> {
    static ISO: OnceLock<Regex> = OnceLock::new();
    let re = ISO.get_or_init(|| {
        Regex::new(
            r"^P(?:(\d+(?:\.\d+)?)D)?(?:T(?:(\d+(?:\.\d+)?)H)?(?:(\d+(?:\.\d+)?)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
        )
        .expect("static regex")
    });
    let caps = re
        .captures(value.trim())
        .ok_or_else(|| ManifestError::Malformed(format!("bad duration {value:?}")))?;
    let part = |i: usize, scale: f64| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|v| v * scale)
            .unwrap_or(0.0)
    };
    Ok(part(1, 86_400.0) + part(2, 3_600.0) + part(3, 60.0) + part(4, 1.0))
}

/// `first-last`, inclusive.
fn parse_range(value: &str) -> Result<ByteRange, ManifestError> {
    let bad = || ManifestError::Malformed(format!("bad byte range {value:?}"));
    let (first, last) = value.trim().split_once('-').ok_or_else(bad)?;
    let first: u64 = first.parse().map_err(|_| bad())?;
    let last: u64 = last.parse().map_err(|_| bad())?;
    let length = last
        .checked_sub(first)
        .and_then(|span| span.checked_add(1))
        .ok_or_else(bad)?;
    Ok(ByteRange {
        offset: first,
        length: Some(length),
    })
}

fn join(base: &Url, reference: &str) -> Result<Url, ManifestError> {
    base.join(reference.trim())
        .map_err(|e| ManifestError::Malformed(format!("bad uri {reference:?}: {e}")))
}
