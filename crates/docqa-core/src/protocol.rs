//! Streaming wire protocol for `POST /query?stream=true`.
//!
//! Each event is one server-sent-events frame, `data: {json}\n\n`:
//!
//! | `type` | text field | extra |
//! |--------|-----------|-------|
//! | `content_chunk` (alias `chunk`) | `partial_response` (aliases `chunk`, `content`) | |
//! | `complete` (alias `end`) | `final_response` (alias `response`) | `citations` |
//! | `error` | `partial_response` | `message` |
//!
//! The encoder always writes the canonical names; the decoder accepts every
//! alias so older backends keep working.

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::models::{Citation, StreamEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no 'type' field")]
    MissingType,
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("'{kind}' frame is missing its text field")]
    MissingText { kind: String },
    #[error("invalid citations: {0}")]
    InvalidCitations(String),
}

/// Encode an event as a complete SSE frame, trailing blank line included.
pub fn encode_frame(event: &StreamEvent) -> String {
    let payload = match event {
        StreamEvent::ContentChunk { partial_text } => json!({
            "type": "content_chunk",
            "partial_response": partial_text,
        }),
        StreamEvent::Complete {
            final_text,
            citations,
        } => json!({
            "type": "complete",
            "final_response": final_text,
            "citations": citations,
        }),
        StreamEvent::Error {
            message,
            partial_text,
        } => json!({
            "type": "error",
            "message": message,
            "partial_response": partial_text,
        }),
    };
    format!("data: {}\n\n", payload)
}

fn text_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| obj.get(*n).and_then(Value::as_str))
        .map(str::to_string)
}

/// Parse one line of an SSE stream.
///
/// Returns `Ok(None)` for lines that carry no event: blanks, comments,
/// non-`data` fields, and the `[DONE]` sentinel.
pub fn parse_frame(line: &str) -> Result<Option<StreamEvent>, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_str(data).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| FrameError::InvalidJson("expected an object".to_string()))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;

    let event = match kind {
        "content_chunk" | "chunk" => StreamEvent::ContentChunk {
            partial_text: text_field(obj, &["partial_response", "chunk", "content"]).ok_or(
                FrameError::MissingText {
                    kind: kind.to_string(),
                },
            )?,
        },
        "complete" | "end" => {
            let final_text = text_field(obj, &["final_response", "response"]).ok_or(
                FrameError::MissingText {
                    kind: kind.to_string(),
                },
            )?;
            let citations: Vec<Citation> = match obj.get("citations") {
                None | Some(Value::Null) => Vec::new(),
                Some(v) => serde_json::from_value(v.clone())
                    .map_err(|e| FrameError::InvalidCitations(e.to_string()))?,
            };
            StreamEvent::Complete {
                final_text,
                citations,
            }
        }
        "error" => StreamEvent::Error {
            message: text_field(obj, &["message", "error"])
                .unwrap_or_else(|| "unknown backend error".to_string()),
            partial_text: text_field(obj, &["partial_response", "chunk", "content"])
                .unwrap_or_default(),
        },
        other => return Err(FrameError::UnknownType(other.to_string())),
    };
    Ok(Some(event))
}

/// Incremental line splitter for an SSE byte stream.
///
/// Network chunks can end mid-line or mid-character; bytes are buffered
/// until a full line is available.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every complete line's parse result.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, FrameError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_frame(&line) {
                Ok(Some(event)) => out.push(Ok(event)),
                Ok(None) => {}
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Parse whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Result<StreamEvent, FrameError>> {
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        parse_frame(&line).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uses_canonical_names() {
        let frame = encode_frame(&StreamEvent::ContentChunk {
            partial_text: "Hello".to_string(),
        });
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"content_chunk\""));
        assert!(frame.contains("\"partial_response\":\"Hello\""));
    }

    #[test]
    fn test_parse_accepts_aliases() {
        let chunk = parse_frame(r#"data: {"type":"chunk","content":"ab"}"#).unwrap();
        assert_eq!(
            chunk,
            Some(StreamEvent::ContentChunk {
                partial_text: "ab".to_string()
            })
        );
        let end = parse_frame(r#"data: {"type":"end","response":"done"}"#).unwrap();
        assert_eq!(
            end,
            Some(StreamEvent::Complete {
                final_text: "done".to_string(),
                citations: vec![]
            })
        );
    }

    #[test]
    fn test_parse_complete_with_citations() {
        let event = StreamEvent::Complete {
            final_text: "A [src:p1-f0]".to_string(),
            citations: vec![Citation {
                marker: "[src:p1-f0]".to_string(),
                passage_ids: vec!["p1-f0".to_string()],
                pages: vec![1],
                source_text: "A".to_string(),
            }],
        };
        let frame = encode_frame(&event);
        let line = frame.lines().next().unwrap();
        assert_eq!(parse_frame(line).unwrap(), Some(event));
    }

    #[test]
    fn test_non_event_lines() {
        assert_eq!(parse_frame("").unwrap(), None);
        assert_eq!(parse_frame(": keep-alive").unwrap(), None);
        assert_eq!(parse_frame("event: message").unwrap(), None);
        assert_eq!(parse_frame("data: [DONE]").unwrap(), None);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(parse_frame("data: {oops"), Err(FrameError::InvalidJson(_))));
        assert_eq!(parse_frame(r#"data: {"x":1}"#), Err(FrameError::MissingType));
        assert_eq!(
            parse_frame(r#"data: {"type":"ping"}"#),
            Err(FrameError::UnknownType("ping".to_string()))
        );
        assert!(matches!(
            parse_frame(r#"data: {"type":"chunk"}"#),
            Err(FrameError::MissingText { .. })
        ));
    }

    #[test]
    fn test_decoder_handles_split_frames() {
        let frame = encode_frame(&StreamEvent::ContentChunk {
            partial_text: "héllo".to_string(),
        });
        let bytes = frame.as_bytes();
        // Split inside the two-byte 'é'.
        let cut = frame.find('é').unwrap() + 1;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let events = decoder.push(&bytes[cut..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().text(), "héllo");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_reports_bad_frame_and_continues() {
        let mut decoder = FrameDecoder::new();
        let mut input = String::from("data: not json\n\n");
        input.push_str(&encode_frame(&StreamEvent::Error {
            message: "boom".to_string(),
            partial_text: "par".to_string(),
        }));
        let events = decoder.push(input.as_bytes());
        assert_eq!(events.len(), 2);
        assert!(events[0].is_err());
        assert!(events[1].as_ref().unwrap().is_terminal());
    }
}
