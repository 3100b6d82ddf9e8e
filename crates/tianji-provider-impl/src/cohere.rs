//! Cohere v2 chat adapter.
//!
//! The request is close to the OpenAI shape; responses carry the assistant
//! message as a content-block list and usage under `billed_units`/`tokens`.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tianji_protocol::openai::{
    ChatCompletionRequest, Choice, ChunkChoice, Delta, ModelResponse, ResponseMessage,
    StreamChunk, Usage,
};
use tianji_protocol::sse::SseFrame;
use tianji_provider_core::provider::{StreamAction, UpstreamHttpRequest};
use tianji_provider_core::{
    ChunkTransformer, Deployment, Headers, Provider, ProviderError, ProviderResult,
    headers::set_bearer,
};

use crate::shared::{decode_json, gen_id, join_url, json_post, unix_now, whitelist};

const DEFAULT_BASE: &str = "https://api.cohere.com";

#[derive(Debug, Serialize)]
struct CohereChatRequest {
    model: String,
    messages: Vec<CohereMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CohereMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CohereChatResponse {
    id: String,
    finish_reason: Option<String>,
    message: CohereResponseMessage,
    #[serde(default)]
    usage: Option<CohereUsage>,
}

#[derive(Debug, Deserialize)]
struct CohereResponseMessage {
    #[serde(default)]
    content: Vec<CohereContentBlock>,
}

#[derive(Debug, Deserialize)]
struct CohereContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CohereUsage {
    #[serde(default)]
    tokens: Option<CohereTokenCounts>,
}

#[derive(Debug, Default, Deserialize)]
struct CohereTokenCounts {
    #[serde(default)]
    input_tokens: f64,
    #[serde(default)]
    output_tokens: f64,
}

fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "COMPLETE" | "STOP_SEQUENCE" => "stop",
            "MAX_TOKENS" => "length",
            "TOOL_CALL" => "tool_calls",
            other => return other.to_ascii_lowercase(),
        }
        .to_string()
    })
}

fn usage_from(usage: &CohereUsage) -> Usage {
    let tokens = usage.tokens.as_ref();
    let input = tokens.map(|t| t.input_tokens).unwrap_or(0.0) as u32;
    let output = tokens.map(|t| t.output_tokens).unwrap_or(0.0) as u32;
    Usage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
    }
}

pub struct CohereProvider;

#[async_trait]
impl Provider for CohereProvider {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn api_key_env(&self) -> &'static str {
        "COHERE_API_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        let base = deployment.api_base.as_deref().unwrap_or(DEFAULT_BASE);
        Ok(join_url(base, "v2/chat"))
    }

    fn setup_headers(&self, headers: &mut Headers, api_key: &str, _deployment: &Deployment) {
        set_bearer(headers, api_key);
    }

    fn supported_params(&self) -> &'static [&'static str] {
        &["k"]
    }

    async fn transform_request(
        &self,
        req: &ChatCompletionRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let mut messages = Vec::new();
        for msg in &req.messages {
            if msg.role == "tool" || msg.tool_calls.is_some() {
                return Err(ProviderError::InvalidRequest(
                    "tool messages are not supported for cohere".to_string(),
                ));
            }
            let content = msg
                .content
                .as_ref()
                .map(|c| c.flatten_text())
                .transpose()
                .map_err(|part| {
                    ProviderError::InvalidRequest(format!(
                        "content part type {part} is not supported for cohere"
                    ))
                })?
                .unwrap_or_default();
            messages.push(CohereMessage {
                role: msg.role.clone(),
                content,
            });
        }

        let wire_req = CohereChatRequest {
            model: deployment.provider_model.clone(),
            messages,
            stream: req.stream,
            temperature: req.temperature,
            p: req.top_p,
            max_tokens: req.max_completion_tokens.or(req.max_tokens),
            stop_sequences: req.stop.clone().map(|s| s.into_vec()),
            seed: req.seed,
        };
        let mut value = serde_json::to_value(&wire_req)
            .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;
        let extras = whitelist(req.extra.clone(), self.supported_params());
        if let Some(obj) = value.as_object_mut() {
            obj.extend(extras);
        }
        let body = serde_json::to_vec(&value)
            .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;

        let mut headers = Headers::new();
        self.setup_headers(&mut headers, api_key, deployment);
        Ok(json_post(
            self.chat_url(deployment)?,
            headers,
            Bytes::from(body),
            req.wants_stream(),
            deployment,
        ))
    }

    fn transform_response(
        &self,
        _status: u16,
        _headers: &Headers,
        body: Bytes,
    ) -> ProviderResult<ModelResponse> {
        let resp: CohereChatResponse = decode_json(&body)?;
        let text: String = resp
            .message
            .content
            .iter()
            .filter_map(|b| b.text.clone())
            .collect();
        Ok(ModelResponse {
            id: resp.id,
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: String::new(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(text),
                    tool_calls: None,
                },
                finish_reason: map_finish_reason(resp.finish_reason.as_deref()),
            }],
            usage: resp.usage.as_ref().map(usage_from),
            system_fingerprint: None,
        })
    }

    fn chunk_transformer(&self) -> Box<dyn ChunkTransformer> {
        Box::new(CohereChunkTransformer::new())
    }
}

/// Cohere v2 streams typed events: `message-start`, `content-delta`,
/// `message-end`. Everything else is bookkeeping and skipped.
pub struct CohereChunkTransformer {
    id: String,
    created: i64,
}

impl CohereChunkTransformer {
    pub fn new() -> Self {
        Self {
            id: gen_id("chatcmpl"),
            created: unix_now(),
        }
    }

    fn delta_chunk(&self, delta: Delta, finish_reason: Option<String>) -> StreamChunk {
        let mut chunk = StreamChunk::new(self.id.clone(), self.created, String::new());
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        chunk
    }
}

impl Default for CohereChunkTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkTransformer for CohereChunkTransformer {
    fn transform(&mut self, frame: &SseFrame) -> ProviderResult<StreamAction> {
        if frame.is_done() {
            return Ok(StreamAction::Done);
        }
        let event: JsonValue =
            serde_json::from_str(&frame.data).map_err(ProviderError::decode)?;
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message-start") => {
                if let Some(id) = event.get("id").and_then(|v| v.as_str()) {
                    self.id = id.to_string();
                }
                let delta = Delta {
                    role: Some("assistant".to_string()),
                    ..Delta::default()
                };
                Ok(StreamAction::Chunk {
                    chunk: self.delta_chunk(delta, None),
                    is_final: false,
                })
            }
            Some("content-delta") => {
                let text = event
                    .pointer("/delta/message/content/text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let delta = Delta {
                    content: Some(text),
                    ..Delta::default()
                };
                Ok(StreamAction::Chunk {
                    chunk: self.delta_chunk(delta, None),
                    is_final: false,
                })
            }
            Some("message-end") => {
                let finish = map_finish_reason(
                    event
                        .pointer("/delta/finish_reason")
                        .and_then(|v| v.as_str()),
                );
                let mut chunk = self.delta_chunk(Delta::default(), finish);
                let input = event
                    .pointer("/delta/usage/tokens/input_tokens")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0) as u32;
                let output = event
                    .pointer("/delta/usage/tokens/output_tokens")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0) as u32;
                if input > 0 || output > 0 {
                    chunk.usage = Some(Usage {
                        prompt_tokens: input,
                        completion_tokens: output,
                        total_tokens: input + output,
                    });
                }
                Ok(StreamAction::Chunk {
                    chunk,
                    is_final: true,
                })
            }
            _ => Ok(StreamAction::Skip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Deployment {
        Deployment {
            id: 1,
            model_name: "smart".to_string(),
            provider: "cohere".to_string(),
            provider_model: "command-r".to_string(),
            api_key: Some("key".to_string()),
            api_base: None,
            weight: 1,
            priority: 0,
            tpm_limit: None,
            rpm_limit: None,
            timeout_ms: None,
            extra_params: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn whitelisted_extras_reach_the_wire() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "smart",
            "messages": [{"role": "user", "content": "hi"}],
            "k": 5,
            "connectors": [{"id": "web"}],
        }))
        .unwrap();
        let out = CohereProvider
            .transform_request(&req, &deployment(), "key")
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(out.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["model"], "command-r");
        assert_eq!(body["k"], 5);
        assert!(body.get("connectors").is_none());
    }

    #[test]
    fn response_decodes_block_content_and_usage() {
        let body = serde_json::to_vec(&json!({
            "id": "ch_1",
            "finish_reason": "COMPLETE",
            "message": {"role": "assistant", "content": [{"type": "text", "text": "Hello"}]},
            "usage": {"tokens": {"input_tokens": 5.0, "output_tokens": 2.0}},
        }))
        .unwrap();
        let out = CohereProvider
            .transform_response(200, &Vec::new(), Bytes::from(body))
            .unwrap();
        assert_eq!(out.choices[0].message.content.as_deref(), Some("Hello"));
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(out.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn stream_events_map_to_chunks() {
        let mut t = CohereChunkTransformer::new();
        let frame = |data: &str| SseFrame {
            event: None,
            data: data.to_string(),
        };

        assert!(matches!(
            t.transform(&frame(r#"{"type":"message-start","id":"ch_1"}"#))
                .unwrap(),
            StreamAction::Chunk { is_final: false, .. }
        ));
        match t
            .transform(&frame(
                r#"{"type":"content-delta","delta":{"message":{"content":{"text":"Hi"}}}}"#,
            ))
            .unwrap()
        {
            StreamAction::Chunk { chunk, .. } => {
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match t
            .transform(&frame(
                r#"{"type":"message-end","delta":{"finish_reason":"COMPLETE","usage":{"tokens":{"input_tokens":4.0,"output_tokens":1.0}}}}"#,
            ))
            .unwrap()
        {
            StreamAction::Chunk { chunk, is_final } => {
                assert!(is_final);
                assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
                assert_eq!(chunk.usage.unwrap().total_tokens, 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
