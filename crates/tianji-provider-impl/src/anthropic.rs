//! Anthropic Messages API adapter.
//!
//! Translation notes: system prompts move to the top-level `system` field,
//! assistant tool calls become `tool_use` blocks, tool-role messages become
//! `tool_result` blocks, and the tagged event stream is folded back into
//! OpenAI chunk framing by `AnthropicChunkTransformer`.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;

use tianji_protocol::anthropic as wire;
use tianji_protocol::openai::{
    ChatCompletionRequest, ChatMessage, ChunkChoice, Delta, FunctionCall, FunctionCallDelta,
    MessageContent, ModelResponse, StreamChunk, ToolCall, ToolCallDelta, ToolChoice, Usage,
};
use tianji_protocol::openai::{Choice, ContentPart, ResponseMessage};
use tianji_protocol::sse::SseFrame;
use tianji_provider_core::provider::{StreamAction, UpstreamHttpRequest};
use tianji_provider_core::{
    ChunkTransformer, Deployment, Headers, Provider, ProviderError, ProviderResult, header_set,
};

use crate::shared::{decode_json, gen_id, join_url, json_post, unix_now, whitelist};

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider;

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn api_key_env(&self) -> &'static str {
        "ANTHROPIC_API_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        let base = deployment.api_base.as_deref().unwrap_or(DEFAULT_BASE);
        Ok(join_url(base, "v1/messages"))
    }

    fn native_base(&self, deployment: &Deployment) -> ProviderResult<String> {
        Ok(deployment
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string())
    }

    fn setup_headers(&self, headers: &mut Headers, api_key: &str, _deployment: &Deployment) {
        header_set(headers, "x-api-key", api_key);
        header_set(headers, "anthropic-version", API_VERSION);
    }

    fn supported_params(&self) -> &'static [&'static str] {
        &["top_k"]
    }

    async fn transform_request(
        &self,
        req: &ChatCompletionRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let wire_req = to_messages_request(req, &deployment.provider_model)?;
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
        let resp: wire::MessagesResponse = decode_json(&body)?;
        Ok(from_messages_response(resp))
    }

    fn chunk_transformer(&self) -> Box<dyn ChunkTransformer> {
        Box::new(AnthropicChunkTransformer::new())
    }
}

/// Build the vendor request from the canonical one.
pub(crate) fn to_messages_request(
    req: &ChatCompletionRequest,
    model: &str,
) -> ProviderResult<wire::MessagesRequest> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<wire::Message> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &msg.content {
                    let text = content
                        .flatten_text()
                        .map_err(|part| non_text_error(part))?;
                    system_parts.push(text);
                }
            }
            "tool" => {
                let content = msg
                    .content
                    .as_ref()
                    .map(|c| c.flatten_text())
                    .transpose()
                    .map_err(|part| non_text_error(part))?;
                let block = wire::ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: content.map(JsonValue::String),
                };
                messages.push(wire::Message {
                    role: "user".to_string(),
                    content: wire::MessageContent::Blocks(vec![block]),
                });
            }
            "assistant" => {
                let mut blocks: Vec<wire::ContentBlock> = Vec::new();
                if let Some(content) = &msg.content {
                    let text = content
                        .flatten_text()
                        .map_err(|part| non_text_error(part))?;
                    if !text.is_empty() {
                        blocks.push(wire::ContentBlock::Text { text });
                    }
                }
                for call in msg.tool_calls.iter().flatten() {
                    let input: JsonValue = serde_json::from_str(&call.function.arguments)
                        .map_err(|e| {
                            ProviderError::InvalidRequest(format!(
                                "tool call arguments are not valid JSON: {e}"
                            ))
                        })?;
                    blocks.push(wire::ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                messages.push(wire::Message {
                    role: "assistant".to_string(),
                    content: wire::MessageContent::Blocks(blocks),
                });
            }
            _ => {
                messages.push(wire::Message {
                    role: "user".to_string(),
                    content: user_content(msg)?,
                });
            }
        }
    }

    let (tools, tool_choice) = map_tools(req)?;

    Ok(wire::MessagesRequest {
        model: model.to_string(),
        max_tokens: req
            .max_completion_tokens
            .or(req.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop.clone().map(|s| s.into_vec()),
        stream: req.stream,
        tools,
        tool_choice,
        metadata: req.user.clone().map(|user_id| wire::Metadata {
            user_id: Some(user_id),
        }),
    })
}

fn non_text_error(part: &'static str) -> ProviderError {
    ProviderError::InvalidRequest(format!(
        "content part type {part} is not supported in this position for anthropic"
    ))
}

fn user_content(msg: &ChatMessage) -> ProviderResult<wire::MessageContent> {
    let Some(content) = &msg.content else {
        return Ok(wire::MessageContent::Text(String::new()));
    };
    match content {
        MessageContent::Text(s) => Ok(wire::MessageContent::Text(s.clone())),
        MessageContent::Parts(parts) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        blocks.push(wire::ContentBlock::Text { text: text.clone() })
                    }
                    ContentPart::ImageUrl { image_url } => {
                        blocks.push(image_block(&image_url.url)?)
                    }
                    ContentPart::InputAudio { .. } => {
                        return Err(non_text_error("input_audio"));
                    }
                }
            }
            Ok(wire::MessageContent::Blocks(blocks))
        }
    }
}

/// Anthropic takes inline images as base64; only `data:` URLs carry the
/// bytes with the request.
fn image_block(url: &str) -> ProviderResult<wire::ContentBlock> {
    let rest = url.strip_prefix("data:").ok_or_else(|| {
        ProviderError::InvalidRequest(
            "anthropic image content requires a data: URL with base64 payload".to_string(),
        )
    })?;
    let (meta, data) = rest.split_once(",").ok_or_else(|| {
        ProviderError::InvalidRequest("malformed data: URL in image content".to_string())
    })?;
    let media_type = meta.trim_end_matches(";base64");
    Ok(wire::ContentBlock::Image {
        source: wire::ImageSource {
            kind: "base64".to_string(),
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
    })
}

fn map_tools(
    req: &ChatCompletionRequest,
) -> ProviderResult<(Option<Vec<wire::ToolDef>>, Option<wire::ToolChoice>)> {
    let Some(tools) = &req.tools else {
        return Ok((None, None));
    };

    // "none" means the model must not call tools; the closest expression
    // here is to send no tools at all.
    if matches!(&req.tool_choice, Some(ToolChoice::Mode(mode)) if mode == "none") {
        return Ok((None, None));
    }

    let defs: Vec<wire::ToolDef> = tools
        .iter()
        .map(|t| wire::ToolDef {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            input_schema: t
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
        })
        .collect();

    let choice = match &req.tool_choice {
        None => None,
        Some(ToolChoice::Mode(mode)) => match mode.as_str() {
            "auto" => Some(wire::ToolChoice::Auto),
            "required" => Some(wire::ToolChoice::Any),
            other => {
                return Err(ProviderError::InvalidRequest(format!(
                    "unsupported tool_choice mode: {other}"
                )));
            }
        },
        Some(ToolChoice::Named(named)) => Some(wire::ToolChoice::Tool {
            name: named.function.name.clone(),
        }),
    };
    Ok((Some(defs), choice))
}

pub(crate) fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "end_turn" | "stop_sequence" => "stop",
            "max_tokens" => "length",
            "tool_use" => "tool_calls",
            other => other,
        }
        .to_string()
    })
}

pub(crate) fn from_messages_response(resp: wire::MessagesResponse) -> ModelResponse {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for block in &resp.content {
        match block {
            wire::ContentBlock::Text { text: t } => text.push_str(t),
            wire::ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    let usage = Usage {
        prompt_tokens: resp.usage.input_tokens,
        completion_tokens: resp.usage.output_tokens,
        total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
    };

    ModelResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: map_stop_reason(resp.stop_reason.as_deref()),
        }],
        usage: Some(usage),
        system_fingerprint: None,
    }
}

/// Folds the tagged Anthropic event stream into OpenAI chunk framing.
/// One instance per streaming request; carries the message id and model
/// learned from `message_start` across later frames.
pub struct AnthropicChunkTransformer {
    id: String,
    model: String,
    created: i64,
    input_tokens: u32,
    /// content block index -> openai tool call index
    tool_blocks: HashMap<u32, u32>,
    next_tool_index: u32,
}

impl AnthropicChunkTransformer {
    pub fn new() -> Self {
        Self {
            id: gen_id("chatcmpl"),
            model: String::new(),
            created: unix_now(),
            input_tokens: 0,
            tool_blocks: HashMap::new(),
            next_tool_index: 0,
        }
    }

    fn chunk(&self) -> StreamChunk {
        StreamChunk::new(self.id.clone(), self.created, self.model.clone())
    }

    fn delta_chunk(&self, delta: Delta, finish_reason: Option<String>) -> StreamChunk {
        let mut chunk = self.chunk();
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        });
        chunk
    }
}

impl Default for AnthropicChunkTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkTransformer for AnthropicChunkTransformer {
    fn transform(&mut self, frame: &SseFrame) -> ProviderResult<StreamAction> {
        if frame.is_done() {
            return Ok(StreamAction::Done);
        }
        let event: wire::StreamEvent =
            serde_json::from_str(&frame.data).map_err(ProviderError::decode)?;
        match event {
            wire::StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.input_tokens = message.usage.input_tokens;
                let delta = Delta {
                    role: Some("assistant".to_string()),
                    ..Delta::default()
                };
                Ok(StreamAction::Chunk {
                    chunk: self.delta_chunk(delta, None),
                    is_final: false,
                })
            }
            wire::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                wire::ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_blocks.insert(index, tool_index);
                    let delta = Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: tool_index,
                            id: Some(id),
                            kind: Some("function".to_string()),
                            function: Some(FunctionCallDelta {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..Delta::default()
                    };
                    Ok(StreamAction::Chunk {
                        chunk: self.delta_chunk(delta, None),
                        is_final: false,
                    })
                }
                _ => Ok(StreamAction::Skip),
            },
            wire::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                wire::BlockDelta::TextDelta { text } => {
                    let delta = Delta {
                        content: Some(text),
                        ..Delta::default()
                    };
                    Ok(StreamAction::Chunk {
                        chunk: self.delta_chunk(delta, None),
                        is_final: false,
                    })
                }
                wire::BlockDelta::InputJsonDelta { partial_json } => {
                    let Some(&tool_index) = self.tool_blocks.get(&index) else {
                        return Ok(StreamAction::Skip);
                    };
                    let delta = Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: tool_index,
                            id: None,
                            kind: None,
                            function: Some(FunctionCallDelta {
                                name: None,
                                arguments: Some(partial_json),
                            }),
                        }]),
                        ..Delta::default()
                    };
                    Ok(StreamAction::Chunk {
                        chunk: self.delta_chunk(delta, None),
                        is_final: false,
                    })
                }
            },
            wire::StreamEvent::ContentBlockStop { .. } => Ok(StreamAction::Skip),
            wire::StreamEvent::MessageDelta { delta, usage } => {
                let finish = map_stop_reason(delta.stop_reason.as_deref());
                let mut chunk = self.delta_chunk(Delta::default(), finish);
                if let Some(delta_usage) = usage {
                    let prompt = delta_usage.input_tokens.unwrap_or(self.input_tokens);
                    chunk.usage = Some(Usage {
                        prompt_tokens: prompt,
                        completion_tokens: delta_usage.output_tokens,
                        total_tokens: prompt + delta_usage.output_tokens,
                    });
                }
                Ok(StreamAction::Chunk {
                    chunk,
                    is_final: true,
                })
            }
            wire::StreamEvent::MessageStop => Ok(StreamAction::Done),
            wire::StreamEvent::Ping => Ok(StreamAction::Skip),
            wire::StreamEvent::Error { error } => Err(ProviderError::Other(format!(
                "upstream stream error: {error}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canonical(body: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_moves_to_top_level() {
        let req = canonical(json!({
            "model": "claude",
            "max_tokens": 100,
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        }));
        let wire_req = to_messages_request(&req, "claude-3-5-sonnet").unwrap();
        assert_eq!(wire_req.system.as_deref(), Some("be terse"));
        assert_eq!(wire_req.messages.len(), 1);
        assert_eq!(wire_req.max_tokens, 100);
    }

    #[test]
    fn max_tokens_defaults_when_absent() {
        let req = canonical(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let wire_req = to_messages_request(&req, "claude-3-5-sonnet").unwrap();
        assert_eq!(wire_req.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_round_trip_through_blocks() {
        let req = canonical(json!({
            "model": "claude",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [{
                    "id": "toolu_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"},
                }]},
                {"role": "tool", "tool_call_id": "toolu_1", "content": "rainy"},
            ],
            "tools": [{"type": "function", "function": {
                "name": "get_weather",
                "parameters": {"type": "object"},
            }}],
        }));
        let wire_req = to_messages_request(&req, "claude-3-5-sonnet").unwrap();
        assert_eq!(wire_req.messages.len(), 3);
        match &wire_req.messages[1].content {
            wire::MessageContent::Blocks(blocks) => {
                assert!(matches!(blocks[0], wire::ContentBlock::ToolUse { .. }));
            }
            other => panic!("unexpected content: {other:?}"),
        }
        assert_eq!(wire_req.tools.as_ref().unwrap()[0].name, "get_weather");
    }

    #[test]
    fn response_maps_stop_reason_and_usage() {
        let resp: wire::MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "Hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 8, "output_tokens": 3},
        }))
        .unwrap();
        let out = from_messages_response(resp);
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(out.choices[0].message.content.as_deref(), Some("Hello"));
        let usage = out.usage.unwrap();
        assert_eq!(usage.total_tokens, 11);
    }

    #[test]
    fn stream_folds_to_openai_chunks() {
        let mut t = AnthropicChunkTransformer::new();
        let frame = |data: &str| SseFrame {
            event: None,
            data: data.to_string(),
        };

        let start = t
            .transform(&frame(
                r#"{"type":"message_start","message":{"id":"msg_1","role":"assistant","model":"claude-3-5-sonnet","usage":{"input_tokens":7,"output_tokens":0}}}"#,
            ))
            .unwrap();
        match start {
            StreamAction::Chunk { chunk, is_final } => {
                assert!(!is_final);
                assert_eq!(chunk.id, "msg_1");
                assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(
            t.transform(&frame(r#"{"type":"ping"}"#)).unwrap(),
            StreamAction::Skip
        ));

        let text = t
            .transform(&frame(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            ))
            .unwrap();
        match text {
            StreamAction::Chunk { chunk, .. } => {
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let fin = t
            .transform(&frame(
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            ))
            .unwrap();
        match fin {
            StreamAction::Chunk { chunk, is_final } => {
                assert!(is_final);
                assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
                assert_eq!(chunk.usage.unwrap().total_tokens, 9);
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(
            t.transform(&frame(r#"{"type":"message_stop"}"#)).unwrap(),
            StreamAction::Done
        ));
    }

    #[test]
    fn image_requires_data_url() {
        assert!(image_block("https://example.com/x.png").is_err());
        let block = image_block("data:image/png;base64,AAAA").unwrap();
        match block {
            wire::ContentBlock::Image { source } => {
                assert_eq!(source.media_type, "image/png");
                assert_eq!(source.data, "AAAA");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
