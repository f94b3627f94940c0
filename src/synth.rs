//! Streaming answer synthesis.
//!
//! Wraps a [`Generator`] and turns its raw deltas into the event stream
//! consumers see:
//!
//! ```text
//! ContentChunk* ─▶ Complete { final_text, citations }
//!               └▶ Error { message, partial_text }
//! ```
//!
//! Every `ContentChunk` carries the whole answer so far and extends the one
//! before it. Before text is emitted, trailing markers and the whitespace
//! around them are held back until ordinary text follows,
//! marker ids outside the selected passages are stripped, and adjacent
//! markers are grouped. A `Complete` therefore never carries an orphan
//! citation.
//!
//! The stream ends with exactly one terminal event, except after
//! cancellation (token fired or receiver dropped), when nothing more is
//! sent at all.

use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docqa_core::citation::{resolve_text, sanitize_markers, stable_prefix_len};
use docqa_core::models::{Passage, StreamEvent};
use docqa_core::query::QueryPlan;

use crate::error::StreamError;
use crate::generation::Generator;

pub type EventStream = ReceiverStream<StreamEvent>;

#[derive(Clone)]
pub struct Synthesizer {
    generator: Arc<dyn Generator>,
    timeout: Duration,
}

impl Synthesizer {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// Start answering `plan` from `passages` (rank order).
    pub fn synthesize(
        &self,
        plan: QueryPlan,
        passages: Vec<Passage>,
        cancel: CancellationToken,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(32);
        let generator = self.generator.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            run(generator, plan, passages, cancel, timeout, tx).await;
        });
        ReceiverStream::new(rx)
    }
}

/// Outcome of waiting on the generator.
enum Step<T> {
    Cancelled,
    TimedOut,
    Ready(T),
}

async fn wait<F: std::future::Future>(
    fut: F,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Step<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Step::Cancelled,
        r = tokio::time::timeout_at(deadline, fut) => match r {
            Ok(v) => Step::Ready(v),
            Err(_) => Step::TimedOut,
        },
    }
}

async fn run(
    generator: Arc<dyn Generator>,
    plan: QueryPlan,
    passages: Vec<Passage>,
    cancel: CancellationToken,
    timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    let deadline = Instant::now() + timeout;
    let known: HashSet<&str> = passages.iter().map(|p| p.id.as_str()).collect();
    let mut raw = String::new();
    let mut emitted = String::new();

    // Nothing is sent once cancellation has been requested.
    let send = |event: StreamEvent| {
        let tx = tx.clone();
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return false;
            }
            tx.send(event).await.is_ok()
        }
    };

    let mut deltas = match wait(generator.stream(&plan, &passages), &cancel, deadline).await {
        Step::Cancelled => return,
        Step::TimedOut => {
            let err = StreamError::StreamTimeout(timeout.as_secs());
            warn!(error = %err, "generator did not start in time");
            send(StreamEvent::Error {
                message: err.to_string(),
                partial_text: String::new(),
            })
            .await;
            return;
        }
        Step::Ready(Err(e)) => {
            let err = StreamError::Backend(e.to_string());
            warn!(error = %err, "generator failed to start");
            send(StreamEvent::Error {
                message: err.to_string(),
                partial_text: String::new(),
            })
            .await;
            return;
        }
        Step::Ready(Ok(s)) => s,
    };

    loop {
        match wait(deltas.next(), &cancel, deadline).await {
            Step::Cancelled => {
                debug!("answer stream cancelled");
                return;
            }
            Step::TimedOut => {
                let err = StreamError::StreamTimeout(timeout.as_secs());
                warn!(error = %err, partial_len = emitted.len(), "answer stream timed out");
                send(StreamEvent::Error {
                    message: err.to_string(),
                    partial_text: emitted,
                })
                .await;
                return;
            }
            Step::Ready(Some(Err(e))) => {
                let err = StreamError::Backend(e.to_string());
                warn!(error = %err, "generation failed mid-stream");
                send(StreamEvent::Error {
                    message: err.to_string(),
                    partial_text: emitted,
                })
                .await;
                return;
            }
            Step::Ready(Some(Ok(delta))) => {
                raw.push_str(&delta);
                let stable = &raw[..stable_prefix_len(&raw)];
                let text = sanitize_markers(stable, &known);
                if !text.is_empty() && text != emitted {
                    emitted = text;
                    if !send(StreamEvent::ContentChunk {
                        partial_text: emitted.clone(),
                    })
                    .await
                    {
                        debug!("answer stream receiver dropped");
                        return;
                    }
                }
            }
            Step::Ready(None) => break,
        }
    }

    // An unterminated marker at the very end is dropped, not emitted.
    let final_text = sanitize_markers(&raw[..stable_prefix_len(&raw)], &known)
        .trim_end()
        .to_string();
    let event = match resolve_text(&final_text, &passages) {
        Ok(citations) => {
            info!(
                generator = generator.name(),
                words = final_text.split_whitespace().count(),
                citations = citations.len(),
                "answer complete"
            );
            StreamEvent::Complete {
                final_text,
                citations,
            }
        }
        Err(e) => StreamEvent::Error {
            message: e.to_string(),
            partial_text: emitted,
        },
    };
    send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::DeltaStream;
    use anyhow::Result;
    use async_trait::async_trait;
    use docqa_core::models::PassageClass;
    use docqa_core::query::{plan, TopKParams};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Emits fixed deltas, optionally pausing before each.
    struct Scripted {
        deltas: Vec<String>,
        pause: Duration,
        dropped: Arc<AtomicBool>,
    }

    impl Scripted {
        fn new(deltas: &[&str]) -> Self {
            Self {
                deltas: deltas.iter().map(|s| s.to_string()).collect(),
                pause: Duration::ZERO,
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, _plan: &QueryPlan, _passages: &[Passage]) -> Result<DeltaStream> {
            let (tx, rx) = mpsc::channel(1);
            let deltas = self.deltas.clone();
            let pause = self.pause;
            let dropped = self.dropped.clone();
            tokio::spawn(async move {
                for d in deltas {
                    tokio::time::sleep(pause).await;
                    if tx.send(Ok(d)).await.is_err() {
                        dropped.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                tx.closed().await;
                dropped.store(true, Ordering::SeqCst);
            });
            Ok(ReceiverStream::new(rx))
        }
    }

    fn passages() -> Vec<Passage> {
        [("p1-f0", 1), ("p2-f0", 2)]
            .iter()
            .map(|(id, page)| Passage {
                id: id.to_string(),
                document_id: "h".to_string(),
                text: format!("text {}", id),
                source_page: *page,
                passage_class: PassageClass::Fine,
                position: *page,
                hash: String::new(),
            })
            .collect()
    }

    async fn collect(mut s: EventStream) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(e) = s.next().await {
            out.push(e);
        }
        out
    }

    fn synth(g: Scripted, timeout: Duration) -> Synthesizer {
        Synthesizer::new(Arc::new(g), timeout)
    }

    #[tokio::test]
    async fn test_chunks_are_cumulative_and_complete_once() {
        let g = Scripted::new(&["The parties ", "are A [sr", "c:p1-f0] and B [src:p9-x]", " [src:p2-f0]."]);
        let p = plan("Who are the parties?", &TopKParams::default());
        let events = collect(synth(g, Duration::from_secs(5)).synthesize(
            p,
            passages(),
            CancellationToken::new(),
        ))
        .await;

        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(events.last().unwrap().is_terminal());
        assert_chunks_only_grow(&events);

        // No chunk exposes a half-written marker.
        for e in &events {
            assert!(!e.text().ends_with("[sr"));
            assert!(!e.text().contains("p9-x"));
        }
        match events.last().unwrap() {
            StreamEvent::Complete {
                final_text,
                citations,
            } => {
                assert_eq!(final_text, "The parties are A [src:p1-f0] and B [src:p2-f0].");
                assert_eq!(citations.len(), 2);
                assert_eq!(citations[1].pages, vec![2]);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    fn assert_chunks_only_grow(events: &[StreamEvent]) {
        for pair in events.windows(2) {
            assert!(
                pair[1].text().starts_with(pair[0].text()),
                "{:?} rewrites {:?}",
                pair[1].text(),
                pair[0].text()
            );
        }
    }

    #[tokio::test]
    async fn test_marker_in_next_delta_does_not_rewrite_sent_text() {
        let g = Scripted::new(&["Party A [src:p1-f0]", " [src:p2-f0] ends."]);
        let p = plan("Who is party A?", &TopKParams::default());
        let events = collect(synth(g, Duration::from_secs(5)).synthesize(
            p,
            passages(),
            CancellationToken::new(),
        ))
        .await;

        assert_chunks_only_grow(&events);
        assert_eq!(events[0].text(), "Party A");
        assert_eq!(
            events.last().unwrap().text(),
            "Party A [src:p1-f0,p2-f0] ends."
        );
    }

    #[tokio::test]
    async fn test_dropped_marker_keeps_sent_text() {
        let g = Scripted::new(&["Payment is due ", "[src:zz] [src:p2-f0]", " within thirty days."]);
        let p = plan("When is payment due?", &TopKParams::default());
        let events = collect(synth(g, Duration::from_secs(5)).synthesize(
            p,
            passages(),
            CancellationToken::new(),
        ))
        .await;

        assert_chunks_only_grow(&events);
        assert_eq!(
            events.last().unwrap().text(),
            "Payment is due [src:p2-f0] within thirty days."
        );
    }

    #[tokio::test]
    async fn test_timeout_yields_error_with_partial_text() {
        let mut g = Scripted::new(&["first part ", "never arrives"]);
        g.pause = Duration::from_millis(200);
        let p = plan("q", &TopKParams::default());
        let events = collect(synth(g, Duration::from_millis(300)).synthesize(
            p,
            passages(),
            CancellationToken::new(),
        ))
        .await;
        match events.last().unwrap() {
            StreamEvent::Error {
                message,
                partial_text,
            } => {
                assert!(message.contains("timed out"));
                assert_eq!(partial_text, "first part");
            }
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_cancel_stops_events_and_releases_generator() {
        let deltas: Vec<String> = (0..200).map(|i| format!("w{} ", i)).collect();
        let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
        let mut g = Scripted::new(&refs);
        g.pause = Duration::from_millis(50);
        let dropped = g.dropped.clone();

        let cancel = CancellationToken::new();
        let mut stream = synth(g, Duration::from_secs(30)).synthesize(
            plan("q", &TopKParams::default()),
            passages(),
            cancel.clone(),
        );
        let first = stream.next().await.unwrap();
        assert!(!first.is_terminal());
        cancel.cancel();

        let rest = collect(stream).await;
        assert!(rest.is_empty(), "events after cancel: {:?}", rest);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("generator should observe the drop");
    }
}
