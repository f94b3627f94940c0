//! Page-aware, multi-granularity passage chunker.
//!
//! Each page of a document is split three times, on paragraph boundaries
//! (`\n\n`), into **fine**, **medium**, and **large** passages. Fine passages
//! favour exact-term matches, large ones carry surrounding context. Every
//! passage keeps the page it came from so citations can point back to it.
//!
//! # Algorithm
//!
//! 1. Convert the class's token limit to characters (4 chars ≈ 1 token).
//! 2. Accumulate paragraphs until the next one would exceed the limit, then
//!    flush.
//! 3. Hard-split any single paragraph longer than the limit at the nearest
//!    newline or space.
//! 4. Drop a coarser passage whose text equals a finer passage on the same
//!    page (short pages would otherwise be indexed three times).
//!
//! # Example
//!
//! ```rust
//! use docqa_core::chunk::{chunk_pages, ChunkParams};
//!
//! let pages = vec!["Short page.".to_string()];
//! let passages = chunk_pages("doc-1", &pages, &ChunkParams::default());
//! assert_eq!(passages.len(), 1);
//! assert_eq!(passages[0].id, "p1-f0");
//! assert_eq!(passages[0].source_page, 1);
//! ```

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::models::{Passage, PassageClass};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Token limits per passage class.
#[derive(Debug, Clone)]
pub struct ChunkParams {
    pub fine_tokens: usize,
    pub medium_tokens: usize,
    pub large_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            fine_tokens: 120,
            medium_tokens: 350,
            large_tokens: 900,
        }
    }
}

/// Estimated model-input tokens for `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Chunk every page into passages of all three classes.
///
/// `pages[0]` is page 1. Blank pages produce no passages. Positions are
/// contiguous across the document in page order, then class (fine, medium,
/// large), then index within the class.
pub fn chunk_pages(document_id: &str, pages: &[String], params: &ChunkParams) -> Vec<Passage> {
    let mut passages = Vec::new();
    let mut position: i64 = 0;

    for (page_idx, page_text) in pages.iter().enumerate() {
        let page = page_idx as i64 + 1;
        if page_text.trim().is_empty() {
            continue;
        }

        let mut seen: HashSet<String> = HashSet::new();
        for (class, max_tokens) in [
            (PassageClass::Fine, params.fine_tokens),
            (PassageClass::Medium, params.medium_tokens),
            (PassageClass::Large, params.large_tokens),
        ] {
            let mut index = 0usize;
            for piece in split_text(page_text, max_tokens) {
                if !seen.insert(piece.clone()) {
                    continue;
                }
                passages.push(make_passage(document_id, page, class, index, position, piece));
                index += 1;
                position += 1;
            }
        }
    }

    passages
}

/// Split text on paragraph boundaries into pieces of at most `max_tokens`.
///
/// Empty or whitespace-only input yields no pieces.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
}

fn hard_split(text: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = text;
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        // A limit smaller than the first char would never advance.
        let split_at = if split_at == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            split_at
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

fn snap_to_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn make_passage(
    document_id: &str,
    page: i64,
    class: PassageClass,
    index: usize,
    position: i64,
    text: String,
) -> Passage {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Passage {
        id: format!("p{}-{}{}", page, class.tag(), index),
        document_id: document_id.to_string(),
        text,
        source_page: page,
        passage_class: class,
        position,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ChunkParams {
        ChunkParams {
            fine_tokens: 5,
            medium_tokens: 12,
            large_tokens: 40,
        }
    }

    #[test]
    fn test_blank_pages_produce_nothing() {
        let pages = vec![String::new(), "   ".to_string()];
        assert!(chunk_pages("d", &pages, &ChunkParams::default()).is_empty());
    }

    #[test]
    fn test_short_page_is_not_duplicated_across_classes() {
        let pages = vec!["One short paragraph.".to_string()];
        let passages = chunk_pages("d", &pages, &ChunkParams::default());
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].passage_class, PassageClass::Fine);
    }

    #[test]
    fn test_pages_are_recorded() {
        let pages = vec![
            "Alpha paragraph one.\n\nAlpha paragraph two.".to_string(),
            String::new(),
            "Gamma paragraph.".to_string(),
        ];
        let passages = chunk_pages("d", &pages, &small_params());
        assert!(passages.iter().any(|p| p.source_page == 1));
        assert!(passages.iter().all(|p| p.source_page != 2));
        let gamma: Vec<_> = passages.iter().filter(|p| p.source_page == 3).collect();
        assert_eq!(gamma.len(), 1);
        assert!(gamma[0].id.starts_with("p3-"));
    }

    #[test]
    fn test_positions_contiguous_and_ids_unique() {
        let page = (0..20)
            .map(|i| format!("Paragraph number {} talks about something.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let passages = chunk_pages("d", &[page.clone(), page], &small_params());
        let mut ids = HashSet::new();
        for (i, p) in passages.iter().enumerate() {
            assert_eq!(p.position, i as i64);
            assert!(ids.insert(p.id.clone()), "duplicate id {}", p.id);
        }
        for class in [PassageClass::Fine, PassageClass::Medium, PassageClass::Large] {
            assert!(passages.iter().any(|p| p.passage_class == class));
        }
    }

    #[test]
    fn test_split_respects_limit() {
        let text = "word ".repeat(200);
        for piece in split_text(&text, 10) {
            assert!(piece.len() <= 40, "piece too long: {}", piece.len());
        }
    }

    #[test]
    fn test_split_multibyte_does_not_panic() {
        let text = "é".repeat(100);
        let pieces = split_text(&text, 1);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_deterministic() {
        let pages = vec!["Alpha\n\nBeta\n\nGamma\n\nDelta".to_string()];
        let a = chunk_pages("d", &pages, &small_params());
        let b = chunk_pages("d", &pages, &small_params());
        assert_eq!(a, b);
    }
}
