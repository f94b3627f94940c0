//! Token budget allocation for the generation context.
//!
//! Passages are admitted in fused-rank order until the next one would push
//! the running total past the budget. Allocation stops at that point rather
//! than skipping ahead to a smaller passage, so a larger budget always admits
//! a superset of what a smaller one admits.

use crate::chunk::estimate_tokens;
use crate::models::ScoredPassage;

/// Result of fitting ranked passages into a token budget.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    /// Admitted passages, still in rank order.
    pub passages: Vec<ScoredPassage>,
    /// Estimated tokens consumed by `passages`.
    pub used_tokens: usize,
    /// `true` when ranked passages were left out.
    pub truncated: bool,
}

/// Choose the longest rank-order prefix of `ranked` that fits `max_tokens`.
///
/// When even the top passage exceeds the budget, it is admitted alone so the
/// generator always has some context.
pub fn allocate(ranked: &[ScoredPassage], max_tokens: usize) -> Allocation {
    let mut out = Allocation::default();

    for (i, sp) in ranked.iter().enumerate() {
        let cost = estimate_tokens(&sp.passage.text);
        if out.used_tokens + cost > max_tokens {
            if i == 0 {
                out.passages.push(sp.clone());
                out.used_tokens = cost;
                out.truncated = ranked.len() > 1;
                return out;
            }
            out.truncated = true;
            return out;
        }
        out.used_tokens += cost;
        out.passages.push(sp.clone());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Passage, PassageClass, RankerScores};

    fn scored(id: &str, chars: usize, score: f64) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                id: id.to_string(),
                document_id: "h".to_string(),
                text: "x".repeat(chars),
                source_page: 1,
                passage_class: PassageClass::Medium,
                position: 0,
                hash: String::new(),
            },
            score,
            rankers: RankerScores::default(),
        }
    }

    fn ids(a: &Allocation) -> Vec<&str> {
        a.passages.iter().map(|s| s.passage.id.as_str()).collect()
    }

    #[test]
    fn test_prefix_within_budget() {
        // 40, 40, 400 tokens
        let ranked = vec![scored("a", 160, 0.9), scored("b", 160, 0.8), scored("c", 1600, 0.7)];
        let a = allocate(&ranked, 100);
        assert_eq!(ids(&a), vec!["a", "b"]);
        assert_eq!(a.used_tokens, 80);
        assert!(a.truncated);
    }

    #[test]
    fn test_stops_instead_of_skipping() {
        let ranked = vec![scored("a", 160, 0.9), scored("big", 4000, 0.8), scored("c", 4, 0.7)];
        let a = allocate(&ranked, 100);
        assert_eq!(ids(&a), vec!["a"]);
    }

    #[test]
    fn test_larger_budget_admits_superset() {
        let ranked: Vec<_> = (0..20)
            .map(|i| scored(&format!("p{}", i), 40 + (i * 37) % 300, 1.0 - i as f64 / 100.0))
            .collect();
        let mut previous: Vec<String> = Vec::new();
        for budget in (0..2000).step_by(25) {
            let current: Vec<String> = allocate(&ranked, budget)
                .passages
                .iter()
                .map(|s| s.passage.id.clone())
                .collect();
            assert!(current.starts_with(&previous), "budget {} dropped passages", budget);
            previous = current;
        }
    }

    #[test]
    fn test_oversized_top_passage_admitted_alone() {
        let ranked = vec![scored("huge", 8000, 0.9), scored("small", 8, 0.5)];
        let a = allocate(&ranked, 100);
        assert_eq!(ids(&a), vec!["huge"]);
        assert_eq!(a.used_tokens, 2000);
        assert!(a.truncated);
    }

    #[test]
    fn test_empty_input() {
        let a = allocate(&[], 500);
        assert!(a.passages.is_empty());
        assert!(!a.truncated);
    }
}
