//! Core data models shared by the backend and the client.
//!
//! Passages are created once at indexing time and are read-only afterwards.
//! Scored passages and stream events are produced fresh per query and never
//! persisted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Granularity of an indexed passage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassageClass {
    Fine,
    Medium,
    Large,
}

impl PassageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassageClass::Fine => "fine",
            PassageClass::Medium => "medium",
            PassageClass::Large => "large",
        }
    }

    /// Single-letter tag used inside passage ids (`p3-f0`).
    pub fn tag(&self) -> char {
        match self {
            PassageClass::Fine => 'f',
            PassageClass::Medium => 'm',
            PassageClass::Large => 'l',
        }
    }
}

impl fmt::Display for PassageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PassageClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fine" => Ok(PassageClass::Fine),
            "medium" => Ok(PassageClass::Medium),
            "large" => Ok(PassageClass::Large),
            other => anyhow::bail!("unknown passage class: {}", other),
        }
    }
}

/// A contiguous span of document text indexed as a retrieval unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Id unique within its document, e.g. `p3-m1`.
    pub id: String,
    /// Backend handle of the owning document.
    pub document_id: String,
    pub text: String,
    /// 1-based page the text was taken from.
    pub source_page: i64,
    pub passage_class: PassageClass,
    /// Document-order index across all passages of the document.
    pub position: i64,
    /// SHA-256 of `text`, used to detect stale embeddings.
    pub hash: String,
}

/// Per-ranker normalized scores for a passage. `None` means the ranker did
/// not return the passage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RankerScores {
    pub semantic: Option<f64>,
    pub lexical: Option<f64>,
    pub entity: Option<f64>,
}

/// A passage with its fused relevance score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f64,
    pub rankers: RankerScores,
}

/// Ranked passages for one query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub passages: Vec<ScoredPassage>,
    /// The `top_k` the result was capped at.
    pub top_k: usize,
    /// Entities the entity ranker searched for (empty if it did not run).
    pub entities: Vec<String>,
}

/// A resolved citation marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Marker text as it appears in the answer, e.g. `[src:p3-f0,p4-m1]`.
    pub marker: String,
    pub passage_ids: Vec<String>,
    /// Distinct pages in first-occurrence order.
    pub pages: Vec<i64>,
    /// Text of the cited passages, joined in marker order.
    pub source_text: String,
}

/// One event of a query's answer stream.
///
/// A stream is `ContentChunk* (Complete | Error)`: exactly one terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Full answer text produced so far (not a delta).
    ContentChunk { partial_text: String },
    Complete {
        final_text: String,
        citations: Vec<Citation>,
    },
    /// Generation failed or timed out; `partial_text` is what was delivered.
    Error {
        message: String,
        partial_text: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::ContentChunk { .. } => false,
            StreamEvent::Complete { .. } | StreamEvent::Error { .. } => true,
        }
    }

    /// Answer text carried by the event.
    pub fn text(&self) -> &str {
        match self {
            StreamEvent::ContentChunk { partial_text } => partial_text,
            StreamEvent::Complete { final_text, .. } => final_text,
            StreamEvent::Error { partial_text, .. } => partial_text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passage_class_round_trip_str() {
        for class in [PassageClass::Fine, PassageClass::Medium, PassageClass::Large] {
            assert_eq!(class.as_str().parse::<PassageClass>().unwrap(), class);
        }
        assert!("huge".parse::<PassageClass>().is_err());
    }

    #[test]
    fn test_terminal_events() {
        let chunk = StreamEvent::ContentChunk {
            partial_text: "a".into(),
        };
        let done = StreamEvent::Complete {
            final_text: "a".into(),
            citations: vec![],
        };
        assert!(!chunk.is_terminal());
        assert!(done.is_terminal());
        assert_eq!(done.text(), "a");
    }
}
