//! Query analysis: multi-part detection, adaptive `top_k`, and answer length.
//!
//! A query is multi-part when it carries an enumerated list (`1. … 2. …`,
//! `(a) … (b) …`) or asks two or more separate questions. Multi-part queries
//! are still retrieved **once**, over the union of their sub-questions, with a
//! larger `top_k` so every sub-question has candidates to draw from.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Retrieval depth parameters.
#[derive(Debug, Clone)]
pub struct TopKParams {
    /// `top_k` for single-part queries.
    pub base: usize,
    /// Extra candidates per detected sub-question.
    pub per_sub_question: usize,
    /// Upper bound for any query.
    pub max: usize,
}

impl Default for TopKParams {
    fn default() -> Self {
        Self {
            base: 25,
            per_sub_question: 20,
            max: 100,
        }
    }
}

/// Target answer length derived from query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// ~150–400 words.
    Focused,
    /// ~500–1500 words.
    MultiPart,
    /// Up to ~2000 words, for analyses spanning many provisions.
    Exhaustive,
}

impl Verbosity {
    /// Inclusive word range the answer should land in.
    pub fn word_range(&self) -> (usize, usize) {
        match self {
            Verbosity::Focused => (150, 400),
            Verbosity::MultiPart => (500, 1500),
            Verbosity::Exhaustive => (800, 2000),
        }
    }
}

/// Everything derived from the raw query text before retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub text: String,
    /// One entry for single-part queries.
    pub sub_questions: Vec<String>,
    pub verbosity: Verbosity,
    pub top_k: usize,
}

impl QueryPlan {
    pub fn is_multi_part(&self) -> bool {
        self.sub_questions.len() > 1
    }
}

const EXHAUSTIVE_CUES: &[&str] = &[
    "all provisions",
    "all clauses",
    "all sections",
    "every provision",
    "every clause",
    "each provision",
    "each clause",
    "list all",
    "exhaustive",
    "comprehensive",
    "in full detail",
];

/// Analyze a query into a [`QueryPlan`].
pub fn plan(text: &str, params: &TopKParams) -> QueryPlan {
    let text = text.trim().to_string();
    let sub_questions = segment(&text);
    let lowered = text.to_lowercase();
    let exhaustive = EXHAUSTIVE_CUES.iter().any(|cue| lowered.contains(cue));

    let verbosity = if exhaustive {
        Verbosity::Exhaustive
    } else if sub_questions.len() > 1 {
        Verbosity::MultiPart
    } else {
        Verbosity::Focused
    };

    let top_k = if exhaustive {
        params.max
    } else if sub_questions.len() > 1 {
        (params.base + params.per_sub_question * sub_questions.len()).min(params.max)
    } else {
        params.base.min(params.max)
    };

    QueryPlan {
        text,
        sub_questions,
        verbosity,
        top_k,
    }
}

fn list_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\s)(?:\d{1,2}[.)]|\(\d{1,2}\)|\([a-z]\)|[a-z]\))\s+")
            .expect("list marker pattern is valid")
    })
}

/// Split a query into sub-questions. Always returns at least one entry for
/// non-empty input.
pub fn segment(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let markers: Vec<_> = list_marker().find_iter(text).collect();
    if markers.len() >= 2 {
        let mut parts = Vec::new();
        for (i, m) in markers.iter().enumerate() {
            let end = markers.get(i + 1).map(|n| n.start()).unwrap_or(text.len());
            let part = text[m.end()..end].trim();
            if !part.is_empty() {
                parts.push(part.to_string());
            }
        }
        if parts.len() >= 2 {
            return parts;
        }
    }

    let questions: Vec<String> = text
        .split_inclusive('?')
        .map(|s| s.trim())
        .filter(|s| s.ends_with('?') && s.split_whitespace().count() >= 2)
        .map(|s| s.to_string())
        .collect();
    if questions.len() >= 2 {
        return questions;
    }

    vec![text.to_string()]
}
