//! Google Gemini (Generative Language API) adapter.
//!
//! Shares its body translation with the vertex-ai adapter; only auth and
//! URL construction differ between the two.

use async_trait::async_trait;
use bytes::Bytes;

use tianji_protocol::gemini as wire;
use tianji_protocol::openai::{
    ChatCompletionRequest, ChunkChoice, Delta, FunctionCall, FunctionCallDelta, MessageContent,
    ModelResponse, StreamChunk, ToolCall, ToolCallDelta, Usage,
};
use tianji_protocol::openai::{Choice, ResponseMessage};
use tianji_protocol::sse::SseFrame;
use tianji_provider_core::provider::{StreamAction, UpstreamHttpRequest};
use tianji_provider_core::{
    ChunkTransformer, Deployment, Headers, Provider, ProviderError, ProviderResult, header_set,
};

use crate::shared::{decode_json, gen_id, json_post, unix_now};

const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider;

impl GeminiProvider {
    fn url_for(&self, deployment: &Deployment, stream: bool) -> String {
        let base = deployment
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/');
        if stream {
            format!(
                "{base}/models/{}:streamGenerateContent?alt=sse",
                deployment.provider_model
            )
        } else {
            format!("{base}/models/{}:generateContent", deployment.provider_model)
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn api_key_env(&self) -> &'static str {
        "GEMINI_API_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        Ok(self.url_for(deployment, false))
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
        header_set(headers, "x-goog-api-key", api_key);
    }

    fn supported_params(&self) -> &'static [&'static str] {
        &[]
    }

    async fn transform_request(
        &self,
        req: &ChatCompletionRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let wire_req = to_generate_content_request(req)?;
        let body = serde_json::to_vec(&wire_req)
            .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;
        let mut headers = Headers::new();
        self.setup_headers(&mut headers, api_key, deployment);
        Ok(json_post(
            self.url_for(deployment, req.wants_stream()),
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
        let resp: wire::GenerateContentResponse = decode_json(&body)?;
        from_generate_content_response(resp)
    }

    fn chunk_transformer(&self) -> Box<dyn ChunkTransformer> {
        Box::new(GeminiChunkTransformer::new())
    }
}

/// Build the Gemini body from the canonical request. Used by both gemini
/// and vertex-ai.
pub(crate) fn to_generate_content_request(
    req: &ChatCompletionRequest,
) -> ProviderResult<wire::GenerateContentRequest> {
    let mut system_parts: Vec<wire::Part> = Vec::new();
    let mut contents: Vec<wire::Content> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &msg.content {
                    let text = content.flatten_text().map_err(non_text_error)?;
                    system_parts.push(wire::Part::text(text));
                }
            }
            "assistant" => {
                let mut parts: Vec<wire::Part> = Vec::new();
                if let Some(content) = &msg.content {
                    let text = content.flatten_text().map_err(non_text_error)?;
                    if !text.is_empty() {
                        parts.push(wire::Part::text(text));
                    }
                }
                for call in msg.tool_calls.iter().flatten() {
                    let args = serde_json::from_str(&call.function.arguments).map_err(|e| {
                        ProviderError::InvalidRequest(format!(
                            "tool call arguments are not valid JSON: {e}"
                        ))
                    })?;
                    parts.push(wire::Part {
                        function_call: Some(wire::FunctionCall {
                            name: call.function.name.clone(),
                            args,
                        }),
                        ..wire::Part::default()
                    });
                }
                contents.push(wire::Content {
                    role: Some("model".to_string()),
                    parts,
                });
            }
            "tool" => {
                // Gemini matches responses to calls by function name, which
                // OpenAI tool messages carry in `name`.
                let name = msg
                    .name
                    .clone()
                    .or_else(|| msg.tool_call_id.clone())
                    .unwrap_or_default();
                let text = msg
                    .content
                    .as_ref()
                    .map(|c| c.flatten_text())
                    .transpose()
                    .map_err(non_text_error)?
                    .unwrap_or_default();
                contents.push(wire::Content {
                    role: Some("user".to_string()),
                    parts: vec![wire::Part {
                        function_response: Some(wire::FunctionResponse {
                            name,
                            response: serde_json::json!({"result": text}),
                        }),
                        ..wire::Part::default()
                    }],
                });
            }
            _ => {
                contents.push(wire::Content {
                    role: Some("user".to_string()),
                    parts: user_parts(msg.content.as_ref())?,
                });
            }
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        vec![wire::Tool {
            function_declarations: tools
                .iter()
                .map(|t| wire::FunctionDeclaration {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                })
                .collect(),
        }]
    });

    Ok(wire::GenerateContentRequest {
        contents,
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(wire::Content {
                role: None,
                parts: system_parts,
            })
        },
        generation_config: Some(wire::GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
            stop_sequences: req.stop.clone().map(|s| s.into_vec()),
            candidate_count: req.n,
        }),
        tools,
    })
}

fn non_text_error(part: &'static str) -> ProviderError {
    ProviderError::InvalidRequest(format!(
        "content part type {part} is not supported for gemini"
    ))
}

fn user_parts(content: Option<&MessageContent>) -> ProviderResult<Vec<wire::Part>> {
    let Some(content) = content else {
        return Ok(vec![wire::Part::text("")]);
    };
    match content {
        MessageContent::Text(s) => Ok(vec![wire::Part::text(s.clone())]),
        MessageContent::Parts(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part {
                    tianji_protocol::openai::ContentPart::Text { text } => {
                        out.push(wire::Part::text(text.clone()))
                    }
                    tianji_protocol::openai::ContentPart::ImageUrl { image_url } => {
                        out.push(inline_image(&image_url.url)?)
                    }
                    tianji_protocol::openai::ContentPart::InputAudio { .. } => {
                        return Err(non_text_error("input_audio"));
                    }
                }
            }
            Ok(out)
        }
    }
}

fn inline_image(url: &str) -> ProviderResult<wire::Part> {
    let rest = url.strip_prefix("data:").ok_or_else(|| {
        ProviderError::InvalidRequest(
            "gemini image content requires a data: URL with base64 payload".to_string(),
        )
    })?;
    let (meta, data) = rest.split_once(',').ok_or_else(|| {
        ProviderError::InvalidRequest("malformed data: URL in image content".to_string())
    })?;
    Ok(wire::Part {
        inline_data: Some(wire::InlineData {
            mime_type: meta.trim_end_matches(";base64").to_string(),
            data: data.to_string(),
        }),
        ..wire::Part::default()
    })
}

pub(crate) fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "STOP" => "stop",
            "MAX_TOKENS" => "length",
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
            other => return other.to_ascii_lowercase(),
        }
        .to_string()
    })
}

fn usage_from_metadata(meta: &wire::UsageMetadata) -> Usage {
    Usage {
        prompt_tokens: meta.prompt_token_count,
        completion_tokens: meta.candidates_token_count,
        total_tokens: meta.total_token_count,
    }
}

pub(crate) fn from_generate_content_response(
    resp: wire::GenerateContentResponse,
) -> ProviderResult<ModelResponse> {
    let mut choices = Vec::new();
    for (i, candidate) in resp.candidates.iter().enumerate() {
        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        for part in &candidate.content.parts {
            if let Some(t) = &part.text {
                text.push_str(t);
            }
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall {
                    id: gen_id("call"),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                });
            }
        }
        choices.push(Choice {
            index: candidate.index.unwrap_or(i as u32),
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
            finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
        });
    }
    if choices.is_empty() {
        return Err(ProviderError::Decode(
            "gemini response carried no candidates".to_string(),
        ));
    }

    Ok(ModelResponse {
        id: gen_id("chatcmpl"),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model_version.unwrap_or_default(),
        choices,
        usage: resp.usage_metadata.as_ref().map(usage_from_metadata),
        system_fingerprint: None,
    })
}

/// Gemini streams whole `GenerateContentResponse` objects per SSE frame and
/// ends by closing the stream rather than a sentinel; the relay emits
/// `[DONE]` at EOF.
pub struct GeminiChunkTransformer {
    id: String,
    created: i64,
}

impl GeminiChunkTransformer {
    pub fn new() -> Self {
        Self {
            id: gen_id("chatcmpl"),
            created: unix_now(),
        }
    }
}

impl Default for GeminiChunkTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkTransformer for GeminiChunkTransformer {
    fn transform(&mut self, frame: &SseFrame) -> ProviderResult<StreamAction> {
        if frame.is_done() {
            return Ok(StreamAction::Done);
        }
        let resp: wire::GenerateContentResponse =
            serde_json::from_str(&frame.data).map_err(ProviderError::decode)?;

        let mut chunk = StreamChunk::new(
            self.id.clone(),
            self.created,
            resp.model_version.clone().unwrap_or_default(),
        );
        let mut is_final = false;
        for (i, candidate) in resp.candidates.iter().enumerate() {
            let text: String = candidate
                .content
                .parts
                .iter()
                .filter_map(|p| p.text.clone())
                .collect();
            let tool_calls: Vec<ToolCallDelta> = candidate
                .content
                .parts
                .iter()
                .filter_map(|p| p.function_call.as_ref())
                .enumerate()
                .map(|(tool_index, call)| ToolCallDelta {
                    index: tool_index as u32,
                    id: Some(gen_id("call")),
                    kind: Some("function".to_string()),
                    function: Some(FunctionCallDelta {
                        name: Some(call.name.clone()),
                        arguments: Some(call.args.to_string()),
                    }),
                })
                .collect();
            let finish = map_finish_reason(candidate.finish_reason.as_deref());
            if finish.is_some() {
                is_final = true;
            }
            chunk.choices.push(ChunkChoice {
                index: candidate.index.unwrap_or(i as u32),
                delta: Delta {
                    role: None,
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                },
                finish_reason: finish,
            });
        }
        if is_final {
            chunk.usage = resp.usage_metadata.as_ref().map(usage_from_metadata);
        }
        Ok(StreamAction::Chunk { chunk, is_final })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_and_system_map_to_gemini_shapes() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-pro",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
            ],
            "temperature": 0.1,
            "max_tokens": 64,
        }))
        .unwrap();
        let wire_req = to_generate_content_request(&req).unwrap();
        assert!(wire_req.system_instruction.is_some());
        assert_eq!(wire_req.contents.len(), 2);
        assert_eq!(wire_req.contents[1].role.as_deref(), Some("model"));
        let config = wire_req.generation_config.unwrap();
        assert_eq!(config.max_output_tokens, Some(64));
    }

    #[test]
    fn response_candidates_become_choices() {
        let resp: wire::GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello"}]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
        }))
        .unwrap();
        let out = from_generate_content_response(resp).unwrap();
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(out.choices[0].message.content.as_deref(), Some("Hello"));
        assert_eq!(out.usage.unwrap().total_tokens, 6);
    }

    #[test]
    fn stream_frames_carry_finish_and_usage() {
        let mut t = GeminiChunkTransformer::new();
        let frame = |data: &str| SseFrame {
            event: None,
            data: data.to_string(),
        };

        let mid = t
            .transform(&frame(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
            ))
            .unwrap();
        match mid {
            StreamAction::Chunk { chunk, is_final } => {
                assert!(!is_final);
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let last = t
            .transform(&frame(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#,
            ))
            .unwrap();
        match last {
            StreamAction::Chunk { chunk, is_final } => {
                assert!(is_final);
                assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
                assert_eq!(chunk.usage.unwrap().total_tokens, 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
