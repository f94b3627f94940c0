//! Query pipeline: plan → retrieve → allocate → synthesize.
//!
//! [`QueryEngine`] holds everything a query needs and no per-query state,
//! so one engine serves concurrent queries.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use docqa_core::budget::{allocate, Allocation};
use docqa_core::embedding::{embed_query, Embedder};
use docqa_core::entity::{CapitalizedPhraseDetector, EntityDetector, NoEntities};
use docqa_core::models::RetrievalResult;
use docqa_core::query::{plan, QueryPlan, TopKParams};
use docqa_core::search::{retrieve, FusionParams, RetrievalRequest};
use docqa_core::store::PassageStore;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::synth::{EventStream, Synthesizer};

pub fn create_detector(name: &str) -> Result<Arc<dyn EntityDetector>> {
    match name {
        "capitalized" => Ok(Arc::new(CapitalizedPhraseDetector::new())),
        "none" => Ok(Arc::new(NoEntities)),
        other => bail!("Unknown entity detector: {}", other),
    }
}

/// Everything computed for a query before generation starts.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub plan: QueryPlan,
    pub retrieval: RetrievalResult,
    pub allocation: Allocation,
}

pub struct QueryEngine {
    store: Arc<dyn PassageStore>,
    embedder: Option<Arc<dyn Embedder>>,
    detector: Arc<dyn EntityDetector>,
    top_k: TopKParams,
    fusion: FusionParams,
    max_context_tokens: usize,
    synthesizer: Synthesizer,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn PassageStore>,
        embedder: Option<Arc<dyn Embedder>>,
        detector: Arc<dyn EntityDetector>,
        synthesizer: Synthesizer,
    ) -> Self {
        Self {
            store,
            embedder,
            detector,
            top_k: TopKParams::default(),
            fusion: FusionParams::default(),
            max_context_tokens: 12_000,
            synthesizer,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn PassageStore>) -> Result<Self> {
        let synthesizer = Synthesizer::new(
            create_generator(&config.generation)?,
            config.generation.timeout(),
        );
        Ok(Self::new(
            store,
            create_embedder(&config.embedding)?,
            create_detector(&config.retrieval.entity_detector)?,
            synthesizer,
        )
        .with_retrieval(
            config.retrieval.top_k_params(),
            config.retrieval.fusion_params(),
            config.retrieval.max_context_tokens,
        ))
    }

    pub fn with_retrieval(
        mut self,
        top_k: TopKParams,
        fusion: FusionParams,
        max_context_tokens: usize,
    ) -> Self {
        self.top_k = top_k;
        self.fusion = fusion;
        self.max_context_tokens = max_context_tokens;
        self
    }

    pub fn store(&self) -> &Arc<dyn PassageStore> {
        &self.store
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    /// Plan the query, run one hybrid retrieval, and fit the result into
    /// the context budget.
    pub async fn prepare(&self, handle: &str, query: &str) -> Result<PreparedQuery> {
        let plan = plan(query, &self.top_k);
        if plan.text.is_empty() {
            bail!("query must not be empty");
        }

        // A failed query embedding drops the semantic ranker for this query only.
        let query_vec = match &self.embedder {
            Some(e) => match embed_query(e.as_ref(), &plan.text).await {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!(error = %err, "query embedding failed, continuing without semantic ranker");
                    None
                }
            },
            None => None,
        };

        let request = RetrievalRequest {
            handle,
            plan: &plan,
            query_vec: query_vec.as_deref(),
        };
        let retrieval = retrieve(
            self.store.as_ref(),
            self.detector.as_ref(),
            &request,
            &self.fusion,
        )
        .await?;
        let allocation = allocate(&retrieval.passages, self.max_context_tokens);

        debug!(
            handle,
            sub_questions = plan.sub_questions.len(),
            top_k = plan.top_k,
            retrieved = retrieval.passages.len(),
            selected = allocation.passages.len(),
            used_tokens = allocation.used_tokens,
            "query prepared"
        );

        Ok(PreparedQuery {
            plan,
            retrieval,
            allocation,
        })
    }

    /// Prepare the query and start streaming its answer.
    pub async fn answer(
        &self,
        handle: &str,
        query: &str,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let prepared = self.prepare(handle, query).await?;
        let passages = prepared
            .allocation
            .passages
            .into_iter()
            .map(|sp| sp.passage)
            .collect();
        Ok(self.synthesizer.synthesize(prepared.plan, passages, cancel))
    }
}
