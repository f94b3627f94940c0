//! Citation markers in generated answers.
//!
//! A marker cites one or more passages by id: `[src:p3-f0]` or the grouped
//! form `[src:p3-f0,p4-m1]`. Before any text leaves the synthesizer, markers
//! are sanitized against the passages that were actually given to the
//! generator, and markers that sit next to each other are collapsed into one
//! group. Resolution maps each surviving marker to the pages it cites.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;

use crate::models::{Citation, Passage};

const MARKER_PREFIX: &str = "[src:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CitationError {
    #[error("citation marker {marker} references unknown passage '{passage_id}'")]
    Orphan { marker: String, passage_id: String },
}

/// A marker found in answer text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    /// Exact marker text, brackets included.
    pub text: String,
    /// Cited passage ids in marker order, without duplicates.
    pub ids: Vec<String>,
    /// Byte range of the marker in the scanned text.
    pub start: usize,
    pub end: usize,
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[src:\s*([A-Za-z0-9_.\-]+(?:\s*,\s*[A-Za-z0-9_.\-]+)*)\s*\]")
            .expect("citation marker pattern is valid")
    })
}

/// Format a marker for the given ids.
pub fn format_marker(ids: &[String]) -> String {
    format!("{}{}]", MARKER_PREFIX, ids.join(","))
}

/// All markers in `text`, in order of appearance.
pub fn extract_markers(text: &str) -> Vec<Marker> {
    marker_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let mut ids: Vec<String> = Vec::new();
            for id in caps.get(1)?.as_str().split(',').map(str::trim) {
                if !id.is_empty() && !ids.iter().any(|i| i == id) {
                    ids.push(id.to_string());
                }
            }
            Some(Marker {
                text: whole.as_str().to_string(),
                ids,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Merge runs of markers separated only by whitespace into one grouped
/// marker, e.g. `[src:a] [src:b]` becomes `[src:a,b]`.
pub fn collapse_adjacent(text: &str) -> String {
    let markers = extract_markers(text);
    if markers.len() < 2 {
        return normalize_single(text, &markers);
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut i = 0;
    while i < markers.len() {
        let first = &markers[i];
        let mut ids = first.ids.clone();
        let mut end = first.end;
        let mut j = i + 1;
        while j < markers.len() && text[end..markers[j].start].trim().is_empty() {
            for id in &markers[j].ids {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
            end = markers[j].end;
            j += 1;
        }
        out.push_str(&text[cursor..first.start]);
        out.push_str(&format_marker(&ids));
        cursor = end;
        i = j;
    }
    out.push_str(&text[cursor..]);
    out
}

fn normalize_single(text: &str, markers: &[Marker]) -> String {
    match markers.first() {
        Some(m) => format!("{}{}{}", &text[..m.start], format_marker(&m.ids), &text[m.end..]),
        None => text.to_string(),
    }
}

/// Remove ids not in `known` from every marker, drop markers left empty, and
/// collapse adjacent markers.
pub fn sanitize_markers(text: &str, known: &HashSet<&str>) -> String {
    let markers = extract_markers(text);
    if markers.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in &markers {
        let kept: Vec<String> = m
            .ids
            .iter()
            .filter(|id| known.contains(id.as_str()))
            .cloned()
            .collect();
        if kept.is_empty() {
            // Drop the marker along with the space that introduced it.
            let before = &text[cursor..m.start];
            out.push_str(before.strip_suffix(' ').unwrap_or(before));
        } else {
            out.push_str(&text[cursor..m.start]);
            out.push_str(&format_marker(&kept));
        }
        cursor = m.end;
    }
    out.push_str(&text[cursor..]);
    collapse_adjacent(&out)
}

/// Length of the prefix of streamed `text` that cannot change once more text
/// arrives. Held back are a trailing `[src:` marker still being written and
/// the trailing run of whitespace and complete markers before it: a marker
/// arriving next may merge into that run, or be dropped along with the space
/// in front of it.
pub fn stable_prefix_len(text: &str) -> usize {
    let mut end = open_marker_start(text);
    let markers = extract_markers(&text[..end]);
    let mut remaining = markers.as_slice();
    loop {
        end = text[..end].trim_end().len();
        match remaining.split_last() {
            Some((last, rest)) if last.end == end => {
                end = last.start;
                remaining = rest;
            }
            _ => return end,
        }
    }
}

/// Start of a trailing, unclosed `[src:` marker, or `text.len()`.
fn open_marker_start(text: &str) -> usize {
    let Some(open) = text.rfind('[') else {
        return text.len();
    };
    if text[open..].contains(']') {
        return text.len();
    }
    let tail = &text[open..];
    let could_be_marker = if tail.len() <= MARKER_PREFIX.len() {
        MARKER_PREFIX.starts_with(tail)
    } else {
        tail.starts_with(MARKER_PREFIX)
    };
    if could_be_marker {
        open
    } else {
        text.len()
    }
}

/// Resolve markers to citations against the passages the answer was built
/// from. Repeated markers yield one citation.
pub fn resolve(markers: &[Marker], passages: &[Passage]) -> Result<Vec<Citation>, CitationError> {
    let mut citations: Vec<Citation> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for marker in markers {
        if !seen.insert(marker.text.as_str()) {
            continue;
        }
        let mut pages: Vec<i64> = Vec::new();
        let mut texts: Vec<&str> = Vec::new();
        for id in &marker.ids {
            let passage = passages.iter().find(|p| &p.id == id).ok_or_else(|| {
                CitationError::Orphan {
                    marker: marker.text.clone(),
                    passage_id: id.clone(),
                }
            })?;
            if !pages.contains(&passage.source_page) {
                pages.push(passage.source_page);
            }
            texts.push(passage.text.as_str());
        }
        citations.push(Citation {
            marker: marker.text.clone(),
            passage_ids: marker.ids.clone(),
            pages,
            source_text: texts.join("\n\n"),
        });
    }

    Ok(citations)
}

/// Extract and resolve every marker in `text`.
pub fn resolve_text(text: &str, passages: &[Passage]) -> Result<Vec<Citation>, CitationError> {
    resolve(&extract_markers(text), passages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PassageClass;

    fn passage(id: &str, page: i64) -> Passage {
        Passage {
            id: id.to_string(),
            document_id: "h".to_string(),
            text: format!("text of {}", id),
            source_page: page,
            passage_class: PassageClass::Fine,
            position: 0,
            hash: String::new(),
        }
    }

    #[test]
    fn test_extract_single_and_grouped() {
        let m = extract_markers("Parties are A [src:p1-f0] and B [src: p2-f1 , p2-f1, p3-m0].");
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].ids, vec!["p1-f0"]);
        assert_eq!(m[1].ids, vec!["p2-f1", "p3-m0"]);
    }

    #[test]
    fn test_collapse_adjacent_markers() {
        assert_eq!(
            collapse_adjacent("Notice is 30 days [src:p4-f0] [src:p5-f2][src:p4-f0]."),
            "Notice is 30 days [src:p4-f0,p5-f2]."
        );
        assert_eq!(
            collapse_adjacent("A [src:a] then B [src:b]"),
            "A [src:a] then B [src:b]"
        );
    }

    #[test]
    fn test_sanitize_strips_unknown_ids() {
        let known: HashSet<&str> = ["p1-f0", "p2-f0"].into_iter().collect();
        assert_eq!(
            sanitize_markers("X [src:p1-f0,zz] and Y [src:nope].", &known),
            "X [src:p1-f0] and Y."
        );
        assert_eq!(
            sanitize_markers("X [src:p1-f0] [src:bogus] [src:p2-f0]", &known),
            "X [src:p1-f0,p2-f0]"
        );
    }

    #[test]
    fn test_resolve_grouped_pages_in_order() {
        let passages = vec![passage("a", 7), passage("b", 3), passage("c", 7)];
        let markers = extract_markers("[src:a,b,c] and again [src:a,b,c] then [src:b]");
        let citations = resolve(&markers, &passages).unwrap();
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].pages, vec![7, 3]);
        assert_eq!(citations[0].passage_ids, vec!["a", "b", "c"]);
        assert_eq!(citations[1].pages, vec![3]);
        assert!(citations[0].source_text.contains("text of b"));
    }

    #[test]
    fn test_resolve_orphan_is_error() {
        let err = resolve_text("See [src:missing].", &[passage("a", 1)]).unwrap_err();
        assert_eq!(
            err,
            CitationError::Orphan {
                marker: "[src:missing]".to_string(),
                passage_id: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_stable_prefix_holds_back_open_marker() {
        assert_eq!(stable_prefix_len("done [src:p1"), 4);
        assert_eq!(stable_prefix_len("done [s"), 4);
        assert_eq!(stable_prefix_len("done ["), 4);
        assert_eq!(stable_prefix_len("done [src:p1] ok"), 16);
        assert_eq!(stable_prefix_len("array [index"), 12);
    }

    #[test]
    fn test_stable_prefix_holds_back_trailing_markers() {
        assert_eq!(stable_prefix_len("Party A [src:p1-f0]"), 7);
        assert_eq!(stable_prefix_len("Party A [src:p1-f0] [src:p2-f0]  "), 7);
        assert_eq!(stable_prefix_len("Party A [src:p1-f0] [src:p2"), 7);
        assert_eq!(stable_prefix_len("Party A [src:p1-f0]."), 20);
        assert_eq!(stable_prefix_len("Party A "), 7);
        assert_eq!(stable_prefix_len("[src:a]"), 0);
    }

    #[test]
    fn test_sanitized_stable_prefix_survives_more_text() {
        let known: HashSet<&str> = ["p1-f0", "p2-f0"].into_iter().collect();
        let full = "Party A [src:p1-f0] [src:bogus] [src:p2-f0] ends.";
        let mut previous = String::new();
        for cut in (0..=full.len()).filter(|i| full.is_char_boundary(*i)) {
            let partial = &full[..cut];
            let text = sanitize_markers(&partial[..stable_prefix_len(partial)], &known);
            assert!(text.starts_with(&previous), "{:?} then {:?}", previous, text);
            previous = text;
        }
        assert_eq!(previous, "Party A [src:p1-f0,p2-f0] ends.");
    }
}
