//! Answer generators.
//!
//! A [`Generator`] turns a query plan and the budgeted passages into a
//! stream of raw text deltas that may contain `[src:ID]` markers. It knows
//! nothing about sanitizing markers, timeouts, or cancellation; the
//! synthesizer wraps it for that.
//!
//! Streams are backed by an mpsc channel fed from a spawned task. When the
//! receiving side is dropped the task returns, dropping the upstream HTTP
//! response with it.
//!
//! | Provider | Type |
//! |----------|------|
//! | `extractive` | [`ExtractiveGenerator`]: offline, deterministic |
//! | `openai` | [`OpenAIGenerator`]: OpenAI-compatible chat completions over SSE |

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use docqa_core::citation::format_marker;
use docqa_core::models::Passage;
use docqa_core::query::QueryPlan;
use docqa_core::search::keyword_terms;

use crate::config::GenerationConfig;

/// Raw text deltas from a generator.
pub type DeltaStream = ReceiverStream<Result<String>>;

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Start generating. `passages` are in rank order and are the only
    /// passages the answer may cite.
    async fn stream(&self, plan: &QueryPlan, passages: &[Passage]) -> Result<DeltaStream>;
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveGenerator::new())),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Prompt ============

/// System and user messages for an LLM answer.
pub fn build_prompt(plan: &QueryPlan, passages: &[Passage]) -> (String, String) {
    let (min_words, max_words) = plan.verbosity.word_range();
    let system = format!(
        "You answer questions about a single document using only the numbered excerpts provided. \
         Cite every claim with the id of its excerpt in the form [src:ID]; cite several at once as \
         [src:ID1,ID2]. Never cite an id that is not listed. If the excerpts do not contain the \
         answer, say so. Aim for {} to {} words.",
        min_words, max_words
    );

    let mut user = String::from("Excerpts:\n\n");
    for p in passages {
        user.push_str(&format!(
            "{} (page {})\n{}\n\n",
            format_marker(std::slice::from_ref(&p.id)),
            p.source_page,
            p.text.trim()
        ));
    }

    if plan.is_multi_part() {
        user.push_str("Answer every one of the following questions, each under its own heading:\n");
        for (i, q) in plan.sub_questions.iter().enumerate() {
            user.push_str(&format!("{}. {}\n", i + 1, q));
        }
    } else {
        user.push_str(&format!("Question: {}\n", plan.text));
    }
    (system, user)
}

// ============ Extractive ============

/// Assembles an answer from the passages themselves: one section per
/// sub-question, each quoting the passages that best match it.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveGenerator {
    /// Pause between deltas.
    delay: Option<Duration>,
    words_per_delta: usize,
}

const EXCERPT_WORDS: usize = 60;

impl ExtractiveGenerator {
    pub fn new() -> Self {
        Self {
            delay: None,
            words_per_delta: 8,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The full answer text, before it is split into deltas.
    pub fn compose(&self, plan: &QueryPlan, passages: &[Passage]) -> String {
        if passages.is_empty() {
            return "The document does not contain passages relevant to this question.".to_string();
        }

        let questions: Vec<&str> = if plan.sub_questions.is_empty() {
            vec![plan.text.as_str()]
        } else {
            plan.sub_questions.iter().map(String::as_str).collect()
        };

        let mut used: HashSet<&str> = HashSet::new();
        let mut sections = Vec::with_capacity(questions.len());
        for (i, q) in questions.iter().enumerate() {
            let picks = pick_passages(q, passages, &used);
            for p in &picks {
                used.insert(p.id.as_str());
            }
            let body: Vec<String> = picks
                .iter()
                .map(|p| {
                    format!(
                        "{} {}",
                        excerpt(&p.text, EXCERPT_WORDS),
                        format_marker(std::slice::from_ref(&p.id))
                    )
                })
                .collect();
            if questions.len() > 1 {
                sections.push(format!("{}. {}\n{}", i + 1, q, body.join(" ")));
            } else {
                sections.push(body.join(" "));
            }
        }
        sections.join("\n\n")
    }
}

/// Up to two passages sharing the most terms with `question`, preferring
/// ones not cited yet. Falls back to the best-ranked unused passage.
fn pick_passages<'a>(question: &str, passages: &'a [Passage], used: &HashSet<&str>) -> Vec<&'a Passage> {
    let terms = keyword_terms(question);
    let mut scored: Vec<(usize, usize, &Passage)> = passages
        .iter()
        .enumerate()
        .map(|(rank, p)| {
            let text = p.text.to_lowercase();
            let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
            (hits, rank, p)
        })
        .filter(|(hits, _, _)| *hits > 0)
        .collect();
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(used.contains(a.2.id.as_str()).cmp(&used.contains(b.2.id.as_str())))
            .then(a.1.cmp(&b.1))
    });

    let picks: Vec<&Passage> = scored.into_iter().take(2).map(|(_, _, p)| p).collect();
    if !picks.is_empty() {
        return picks;
    }
    passages
        .iter()
        .find(|p| !used.contains(p.id.as_str()))
        .or_else(|| passages.first())
        .into_iter()
        .collect()
}

fn excerpt(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        words.join(" ")
    } else {
        format!("{} …", words[..max_words].join(" "))
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn stream(&self, plan: &QueryPlan, passages: &[Passage]) -> Result<DeltaStream> {
        let answer = self.compose(plan, passages);
        let delay = self.delay;
        let words_per_delta = self.words_per_delta.max(1);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let tokens: Vec<&str> = answer.split_inclusive(' ').collect();
            for piece in tokens.chunks(words_per_delta) {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                if tx.send(Ok(piece.concat())).await.is_err() {
                    debug!("extractive stream receiver dropped");
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

// ============ OpenAI-compatible ============

/// Streams chat completions from an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAIGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()?,
            base_url: config.url.trim_end_matches('/').to_string(),
            model,
            api_key,
            temperature: config.temperature,
        })
    }
}

/// Content delta of one chat-completions SSE line, if any.
fn parse_completion_line(line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "skipping malformed completion frame");
            return None;
        }
    };
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Some(Err(anyhow!("generation failed: {}", message)));
    }
    json.pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(|c| Ok(c.to_string()))
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, plan: &QueryPlan, passages: &[Passage]) -> Result<DeltaStream> {
        let (system, user) = build_prompt(plan, passages);
        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        debug!(model = %self.model, passages = passages.len(), "sending streaming completion request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send completion request: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            bail!("Completion API error {}: {}", status, text);
        }

        let mut bytes = response.bytes_stream();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            loop {
                // A stalled upstream must not outlive the receiver.
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("completion receiver dropped while waiting on upstream");
                        return;
                    }
                    next = bytes.next() => next,
                };
                let Some(chunk) = next else {
                    return;
                };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow!("Stream error: {}", e))).await;
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    if let Some(delta) = parse_completion_line(&line) {
                        if tx.send(delta).await.is_err() {
                            // Receiver gone: dropping `bytes` closes the connection.
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docqa_core::models::PassageClass;
    use docqa_core::query::{plan, TopKParams};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn passage(id: &str, page: i64, text: &str) -> Passage {
        Passage {
            id: id.to_string(),
            document_id: "h".to_string(),
            text: text.to_string(),
            source_page: page,
            passage_class: PassageClass::Fine,
            position: page,
            hash: String::new(),
        }
    }

    #[test]
    fn test_prompt_enumerates_sub_questions() {
        let p = plan("1. Who pays? 2. When is it due?", &TopKParams::default());
        let (system, user) = build_prompt(&p, &[passage("p1-f0", 1, "Tenant pays.")]);
        assert!(system.contains("500 to 1500 words"));
        assert!(user.contains("[src:p1-f0] (page 1)"));
        assert!(user.contains("1. Who pays?"));
        assert!(user.contains("2. When is it due?"));
    }

    #[test]
    fn test_extractive_answers_each_sub_question() {
        let p = plan(
            "1. Who are the parties? 2. What is the termination notice period?",
            &TopKParams::default(),
        );
        let passages = vec![
            passage("p2-f0", 2, "Either party may terminate on sixty days termination notice."),
            passage("p1-f0", 1, "The parties to this agreement are Acme Corp and Globex Inc."),
        ];
        let answer = ExtractiveGenerator::new().compose(&p, &passages);
        assert!(answer.starts_with("1. Who are the parties?"));
        assert!(answer.contains("[src:p1-f0]"));
        assert!(answer.contains("[src:p2-f0]"));
        let first = answer.find("[src:p1-f0]").unwrap();
        let second = answer.find("[src:p2-f0]").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_extractive_stream_reassembles() {
        let p = plan("Who pays rent?", &TopKParams::default());
        let passages = vec![passage("p1-f0", 1, "The tenant pays rent monthly.")];
        let gen = ExtractiveGenerator::new();
        let mut stream = gen.stream(&p, &passages).await.unwrap();
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta.unwrap());
        }
        assert_eq!(text, gen.compose(&p, &passages));
    }

    struct FlagOnDrop(Arc<AtomicBool>);

    impl Drop for FlagOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_openai_stream_releases_stalled_upstream() {
        // Upstream sends one delta and then goes quiet without closing.
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let app = axum::Router::new().route(
            "/chat/completions",
            axum::routing::post(move || {
                let guard = FlagOnDrop(flag.clone());
                async move {
                    let first = futures::stream::once(async {
                        Ok::<_, Infallible>(
                            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n".to_string(),
                        )
                    });
                    let body = first
                        .chain(futures::stream::pending())
                        .map(move |chunk| {
                            let _ = &guard;
                            chunk
                        });
                    axum::body::Body::from_stream(body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let gen = OpenAIGenerator {
            client: reqwest::Client::new(),
            base_url: url,
            model: "test-model".to_string(),
            api_key: "test-key".to_string(),
            temperature: 0.0,
        };
        let p = plan("Who pays?", &TopKParams::default());
        let mut stream = gen
            .stream(&p, &[passage("p1-f0", 1, "Tenant pays.")])
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "Hello");
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !released.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("upstream response should be closed once the receiver is gone");
    }

    #[test]
    fn test_parse_completion_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(parse_completion_line(line).unwrap().unwrap(), "Hi");
        assert!(parse_completion_line("data: [DONE]").is_none());
        assert!(parse_completion_line(r#"data: {"choices":[{"delta":{}}]}"#).is_none());
        assert!(parse_completion_line("data: {broken").is_none());
        assert!(parse_completion_line(r#"data: {"error":{"message":"quota"}}"#)
            .unwrap()
            .is_err());
    }
}
