//! Entity detection for the entity-targeted ranker.
//!
//! What counts as an entity is pluggable: the retrieval engine
//! only sees the [`EntityDetector`] trait. The default
//! [`CapitalizedPhraseDetector`] treats runs of capitalized words that do not
//! open a sentence, quoted phrases, and all-caps acronyms as entities.

use std::collections::HashSet;

/// Extracts proper-noun-like entities from a query.
pub trait EntityDetector: Send + Sync {
    /// Entities in first-occurrence order, without duplicates. An empty
    /// result disables the entity ranker for the query.
    fn detect(&self, query: &str) -> Vec<String>;
}

/// Detector that never finds entities.
pub struct NoEntities;

impl EntityDetector for NoEntities {
    fn detect(&self, _query: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Heuristic detector for capitalized phrases, quoted phrases and acronyms.
pub struct CapitalizedPhraseDetector {
    stopwords: HashSet<&'static str>,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "can", "did", "do", "does", "for", "how", "i", "if", "in", "is", "it",
    "list", "of", "on", "or", "please", "the", "this", "to", "under", "what", "when", "where",
    "which", "who", "whom", "whose", "why", "will", "with", "would", "summarize", "describe",
    "explain",
];

impl CapitalizedPhraseDetector {
    pub fn new() -> Self {
        Self {
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    fn is_stopword(&self, word: &str) -> bool {
        self.stopwords.contains(word.to_lowercase().as_str())
    }
}

impl Default for CapitalizedPhraseDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityDetector for CapitalizedPhraseDetector {
    fn detect(&self, query: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let push = |entity: String, found: &mut Vec<String>| {
            let lowered = entity.to_lowercase();
            if !found.iter().any(|e| e.to_lowercase() == lowered) {
                found.push(entity);
            }
        };

        for quoted in quoted_phrases(query) {
            push(quoted, &mut found);
        }

        let mut run: Vec<&str> = Vec::new();
        let mut sentence_start = true;
        for raw in query.split_whitespace() {
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '&' && c != '\'');
            let ends_sentence = raw.ends_with(['.', '?', '!', ':', ';']);
            let numbered = word.chars().all(|c| c.is_ascii_digit());

            let capitalized = word.chars().next().is_some_and(|c| c.is_uppercase());
            let acronym = word.len() >= 2
                && word.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                && word.chars().any(|c| c.is_ascii_uppercase());
            let candidate = !word.is_empty()
                && (acronym || (capitalized && !(sentence_start && run.is_empty())))
                && !self.is_stopword(word);

            if candidate {
                run.push(word);
            } else if !run.is_empty() {
                push(run.join(" "), &mut found);
                run.clear();
            }

            if ends_sentence && !run.is_empty() {
                push(run.join(" "), &mut found);
                run.clear();
            }
            // "1." list markers open a new sentence too.
            sentence_start = ends_sentence || numbered;
        }
        if !run.is_empty() {
            push(run.join(" "), &mut found);
        }

        found
    }
}

fn quoted_phrases(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = query;
    while let Some(start) = rest.find('"') {
        let after = &rest[start + 1..];
        match after.find('"') {
            Some(end) => {
                let phrase = after[..end].trim();
                if !phrase.is_empty() {
                    out.push(phrase.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(q: &str) -> Vec<String> {
        CapitalizedPhraseDetector::new().detect(q)
    }

    #[test]
    fn test_no_entities_in_plain_question() {
        assert!(detect("What is the termination notice period?").is_empty());
    }

    #[test]
    fn test_capitalized_run_mid_sentence() {
        assert_eq!(
            detect("What does Acme Holdings owe to the buyer?"),
            vec!["Acme Holdings".to_string()]
        );
    }

    #[test]
    fn test_sentence_initial_word_ignored() {
        assert!(detect("Termination rights of the buyer").is_empty());
        assert_eq!(detect("Does Globex pay?"), vec!["Globex".to_string()]);
    }

    #[test]
    fn test_acronym_and_quoted_phrase() {
        let found = detect("how is \"Effective Date\" defined for the NDA");
        assert_eq!(found, vec!["Effective Date".to_string(), "NDA".to_string()]);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let found = detect("is Initech liable, and does Initech indemnify?");
        assert_eq!(found, vec!["Initech".to_string()]);
    }

    #[test]
    fn test_numbered_list_marker_starts_sentence() {
        assert!(detect("1. Who are the parties? 2. What is the notice period?").is_empty());
    }

    #[test]
    fn test_no_entities_detector() {
        assert!(NoEntities.detect("Acme Corp").is_empty());
    }
}
