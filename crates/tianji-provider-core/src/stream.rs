//! Per-request stream chunk translation.

use tianji_protocol::openai::StreamChunk;
use tianji_protocol::sse::SseFrame;

use crate::provider::StreamAction;
use crate::{ProviderError, ProviderResult};

/// Stateful translator from one vendor's SSE frames to canonical chunks.
/// One instance per in-flight streaming request.
pub trait ChunkTransformer: Send {
    fn transform(&mut self, frame: &SseFrame) -> ProviderResult<StreamAction>;
}

/// Identity transformer for vendors that emit OpenAI chunk framing.
#[derive(Debug, Default)]
pub struct OpenAiChunkPassthrough {
    saw_finish: bool,
}

impl OpenAiChunkPassthrough {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkTransformer for OpenAiChunkPassthrough {
    fn transform(&mut self, frame: &SseFrame) -> ProviderResult<StreamAction> {
        if frame.is_done() {
            return Ok(StreamAction::Done);
        }
        let chunk: StreamChunk =
            serde_json::from_str(&frame.data).map_err(ProviderError::decode)?;
        let is_final = chunk.usage.is_some()
            || chunk
                .choices
                .iter()
                .any(|c| c.finish_reason.is_some());
        if is_final {
            self.saw_finish = true;
        }
        Ok(StreamAction::Chunk { chunk, is_final })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn passthrough_marks_finish_and_done() {
        let mut t = OpenAiChunkPassthrough::new();
        let mid = frame(
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#,
        );
        match t.transform(&mid).unwrap() {
            StreamAction::Chunk { is_final, .. } => assert!(!is_final),
            other => panic!("unexpected: {other:?}"),
        }

        let last = frame(
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        );
        match t.transform(&last).unwrap() {
            StreamAction::Chunk { is_final, .. } => assert!(is_final),
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(
            t.transform(&frame("[DONE]")).unwrap(),
            StreamAction::Done
        ));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let mut t = OpenAiChunkPassthrough::new();
        assert!(t.transform(&frame("{not json")).is_err());
    }
}
