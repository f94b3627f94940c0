//! Hybrid retrieval over a single indexed document.
//!
//! The engine runs entirely through the [`PassageStore`] trait. The caller
//! plans the query, embeds it, and picks the entity detector; this module
//! gathers candidates and fuses them.
//!
//! # Fusion Algorithm
//!
//! 1. Fetch `top_k` semantic candidates (cosine similarity).
//! 2. Fetch `top_k` lexical candidates (keyword overlap / BM25).
//! 3. If the detector finds entities in the query, fetch `top_k` entity
//!    candidates (passages containing those entities).
//! 4. Min-max normalize each ranker's scores to `[0, 1]` and multiply by that
//!    ranker's weight.
//! 5. Dedup by passage id; a passage seen by several rankers keeps the
//!    **maximum** weighted score. Scores are never summed, so overlap alone
//!    does not lift a passage.
//! 6. Sort by fused score (desc), then page (asc), then position (asc).
//! 7. Truncate to `top_k`.

use anyhow::Result;
use std::collections::HashMap;

use crate::entity::EntityDetector;
use crate::models::{RankerScores, RetrievalResult, ScoredPassage};
use crate::query::QueryPlan;
use crate::store::{PassageCandidate, PassageStore};

/// Tunable fusion weights. The fused score is
/// `max(w_semantic·s, w_lexical·l, w_entity·e)` over the rankers that
/// returned the passage.
#[derive(Debug, Clone)]
pub struct FusionParams {
    pub semantic_weight: f64,
    pub lexical_weight: f64,
    pub entity_weight: f64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            semantic_weight: 1.0,
            lexical_weight: 1.0,
            entity_weight: 1.0,
        }
    }
}

/// The independent candidate generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ranker {
    Semantic,
    Lexical,
    Entity,
}

/// Inputs for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    /// Backend handle of the document to search.
    pub handle: &'a str,
    pub plan: &'a QueryPlan,
    /// Query embedding; the semantic ranker is skipped when absent.
    pub query_vec: Option<&'a [f32]>,
}

/// Run all rankers once for the whole query and fuse their output.
pub async fn retrieve<S: PassageStore + ?Sized>(
    store: &S,
    detector: &dyn EntityDetector,
    req: &RetrievalRequest<'_>,
    params: &FusionParams,
) -> Result<RetrievalResult> {
    let top_k = req.plan.top_k;
    if req.plan.text.trim().is_empty() || top_k == 0 {
        return Ok(RetrievalResult {
            passages: Vec::new(),
            top_k,
            entities: Vec::new(),
        });
    }

    let semantic = match req.query_vec {
        Some(qv) => store.vector_search(req.handle, qv, top_k).await?,
        None => Vec::new(),
    };

    let terms = keyword_terms(&req.plan.text);
    let lexical = store.keyword_search(req.handle, &terms, top_k).await?;

    let entities = detector.detect(&req.plan.text);
    let entity = if entities.is_empty() {
        Vec::new()
    } else {
        store.phrase_search(req.handle, &entities, top_k).await?
    };

    let passages = fuse(
        &[
            (Ranker::Semantic, semantic),
            (Ranker::Lexical, lexical),
            (Ranker::Entity, entity),
        ],
        params,
        top_k,
    );

    Ok(RetrievalResult {
        passages,
        top_k,
        entities,
    })
}

/// Max-fuse ranked lists into one list of at most `top_k` passages.
pub fn fuse(
    lists: &[(Ranker, Vec<PassageCandidate>)],
    params: &FusionParams,
    top_k: usize,
) -> Vec<ScoredPassage> {
    let mut merged: HashMap<&str, ScoredPassage> = HashMap::new();

    for (ranker, candidates) in lists {
        let weight = match ranker {
            Ranker::Semantic => params.semantic_weight,
            Ranker::Lexical => params.lexical_weight,
            Ranker::Entity => params.entity_weight,
        };
        for (cand, norm) in normalize_scores(candidates) {
            let weighted = norm * weight;
            let entry = merged
                .entry(cand.passage.id.as_str())
                .or_insert_with(|| ScoredPassage {
                    passage: cand.passage.clone(),
                    score: f64::NEG_INFINITY,
                    rankers: RankerScores::default(),
                });
            let slot = match ranker {
                Ranker::Semantic => &mut entry.rankers.semantic,
                Ranker::Lexical => &mut entry.rankers.lexical,
                Ranker::Entity => &mut entry.rankers.entity,
            };
            *slot = Some(slot.map_or(norm, |prev: f64| prev.max(norm)));
            if weighted > entry.score {
                entry.score = weighted;
            }
        }
    }

    let mut fused: Vec<ScoredPassage> = merged.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.passage.source_page.cmp(&b.passage.source_page))
            .then(a.passage.position.cmp(&b.passage.position))
    });
    fused.truncate(top_k);
    fused
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[PassageCandidate]) -> Vec<(&PassageCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

const QUERY_STOPWORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "in", "is", "it", "its", "of", "on", "or", "that", "the", "their", "there", "this",
    "to", "under", "was", "what", "when", "where", "which", "who", "why", "will", "with",
];

/// Lowercased content terms of a query, deduplicated, in order.
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
    {
        let lowered = token.to_lowercase();
        if QUERY_STOPWORDS.contains(&lowered.as_str()) || terms.contains(&lowered) {
            continue;
        }
        terms.push(lowered);
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CapitalizedPhraseDetector, NoEntities};
    use crate::models::{Passage, PassageClass};
    use crate::query::{plan, TopKParams};
    use crate::store::memory::InMemoryStore;

    fn passage(id: &str, page: i64, position: i64, text: &str) -> Passage {
        Passage {
            id: id.to_string(),
            document_id: "h".to_string(),
            text: text.to_string(),
            source_page: page,
            passage_class: PassageClass::Fine,
            position,
            hash: String::new(),
        }
    }

    fn cand(id: &str, page: i64, position: i64, score: f64) -> PassageCandidate {
        PassageCandidate {
            passage: passage(id, page, position, ""),
            raw_score: score,
        }
    }

    #[test]
    fn test_normalize_range_and_equal() {
        let c = vec![cand("a", 1, 0, 10.0), cand("b", 1, 1, 5.0), cand("c", 1, 2, 0.0)];
        let n = normalize_scores(&c);
        assert!((n[0].1 - 1.0).abs() < 1e-9);
        assert!((n[1].1 - 0.5).abs() < 1e-9);
        assert!(n[2].1.abs() < 1e-9);

        let eq = vec![cand("a", 1, 0, 3.0), cand("b", 1, 1, 3.0)];
        assert!(normalize_scores(&eq).iter().all(|(_, s)| (*s - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_fusion_takes_max_not_sum() {
        // "b" is mid-ranked in both lists; "a" tops only one list.
        let semantic = vec![cand("a", 1, 0, 1.0), cand("b", 2, 1, 0.5), cand("c", 3, 2, 0.0)];
        let lexical = vec![cand("d", 4, 3, 10.0), cand("b", 2, 1, 5.0), cand("e", 5, 4, 0.0)];
        let fused = fuse(
            &[(Ranker::Semantic, semantic), (Ranker::Lexical, lexical)],
            &FusionParams::default(),
            10,
        );
        let b = fused.iter().find(|s| s.passage.id == "b").unwrap();
        assert!((b.score - 0.5).abs() < 1e-9);
        assert_eq!(b.rankers.semantic, Some(0.5));
        assert_eq!(b.rankers.lexical, Some(0.5));
        assert_eq!(fused.iter().filter(|s| s.passage.id == "b").count(), 1);
        assert!(fused[0].passage.id == "a" || fused[0].passage.id == "d");
    }

    #[test]
    fn test_ties_break_by_page_then_position() {
        let semantic = vec![cand("late", 9, 40, 1.0), cand("early", 2, 5, 1.0)];
        let lexical = vec![cand("mid", 2, 7, 3.0)];
        let fused = fuse(
            &[(Ranker::Semantic, semantic), (Ranker::Lexical, lexical)],
            &FusionParams::default(),
            10,
        );
        let order: Vec<&str> = fused.iter().map(|s| s.passage.id.as_str()).collect();
        assert_eq!(order, vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_weights_are_applied() {
        let semantic = vec![cand("s", 1, 0, 1.0)];
        let lexical = vec![cand("l", 2, 1, 1.0)];
        let params = FusionParams {
            semantic_weight: 0.5,
            lexical_weight: 1.0,
            entity_weight: 1.0,
        };
        let fused = fuse(
            &[(Ranker::Semantic, semantic), (Ranker::Lexical, lexical)],
            &params,
            10,
        );
        assert_eq!(fused[0].passage.id, "l");
        assert!((fused[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_fusion_caps_at_top_k() {
        let lexical: Vec<_> = (0..30).map(|i| cand(&format!("p{}", i), i, i, i as f64)).collect();
        let fused = fuse(&[(Ranker::Lexical, lexical)], &FusionParams::default(), 7);
        assert_eq!(fused.len(), 7);
        assert_eq!(fused[0].passage.id, "p29");
    }

    #[test]
    fn test_keyword_terms() {
        assert_eq!(
            keyword_terms("What is the Termination notice period? notice"),
            vec!["termination", "notice", "period"]
        );
    }

    async fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        let passages = vec![
            passage("p1-f0", 1, 0, "This agreement is made between Acme Corp and Globex Inc."),
            passage("p2-f0", 2, 1, "Either party may terminate with thirty days notice."),
            passage("p3-f0", 3, 2, "Payment is due within fifteen days of invoice."),
        ];
        store.replace_passages("h", &passages, None).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_entity_ranker_runs_only_with_entities() {
        let store = seeded_store().await;
        let p = plan("What does Globex owe?", &TopKParams::default());
        let req = RetrievalRequest {
            handle: "h",
            plan: &p,
            query_vec: None,
        };
        let with = retrieve(&store, &CapitalizedPhraseDetector::new(), &req, &FusionParams::default())
            .await
            .unwrap();
        assert_eq!(with.entities, vec!["Globex".to_string()]);
        assert_eq!(with.passages[0].passage.id, "p1-f0");
        assert!(with.passages[0].rankers.entity.is_some());

        let without = retrieve(&store, &NoEntities, &req, &FusionParams::default())
            .await
            .unwrap();
        assert!(without.entities.is_empty());
        assert!(without.passages.iter().all(|s| s.rankers.entity.is_none()));
    }

    #[tokio::test]
    async fn test_retrieve_lexical_match() {
        let store = seeded_store().await;
        let p = plan("When is payment due?", &TopKParams::default());
        let req = RetrievalRequest {
            handle: "h",
            plan: &p,
            query_vec: None,
        };
        let result = retrieve(&store, &NoEntities, &req, &FusionParams::default())
            .await
            .unwrap();
        assert_eq!(result.top_k, 25);
        assert_eq!(result.passages[0].passage.id, "p3-f0");
    }
}
