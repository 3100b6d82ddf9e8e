//! The provider capability set.
//!
//! A `Provider` turns a canonical chat completion into one vendor's wire
//! format and back. Adapters never perform IO: they build
//! `UpstreamHttpRequest` values and decode `UpstreamHttpResponse` bodies.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map as JsonMap, Value as JsonValue};

use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse};

use crate::config::Deployment;
use crate::headers::Headers;
use crate::stream::{ChunkTransformer, OpenAiChunkPassthrough};
use crate::{ProviderError, ProviderResult};

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        if method.eq_ignore_ascii_case("GET") {
            Some(HttpMethod::Get)
        } else if method.eq_ignore_ascii_case("POST") {
            Some(HttpMethod::Post)
        } else if method.eq_ignore_ascii_case("PUT") {
            Some(HttpMethod::Put)
        } else if method.eq_ignore_ascii_case("PATCH") {
            Some(HttpMethod::Patch)
        } else if method.eq_ignore_ascii_case("DELETE") {
            Some(HttpMethod::Delete)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    /// Round-trip deadline in milliseconds; the IO layer applies its
    /// default when absent.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response).
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// HTTP error response captured as bytes (non-2xx).
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

/// Outcome of feeding one upstream SSE frame to a chunk transformer.
#[derive(Debug)]
pub enum StreamAction {
    /// Emit a canonical chunk downstream. `is_final` marks the vendor's
    /// terminal content event (usage, finish reason).
    Chunk {
        chunk: tianji_protocol::openai::StreamChunk,
        is_final: bool,
    },
    /// Frame carries no downstream payload (pings, block bookkeeping).
    Skip,
    /// Vendor-native end of stream; emit `[DONE]` and stop reading.
    Done,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Environment variable consulted when a deployment carries no API key.
    fn api_key_env(&self) -> &'static str;

    /// Full upstream URL for a chat completion against this deployment.
    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String>;

    /// Base URL used by pass-through endpoints (native formats, files,
    /// batches). Providers without a pass-through surface may keep the
    /// default.
    fn native_base(&self, deployment: &Deployment) -> ProviderResult<String> {
        let _ = deployment;
        Err(ProviderError::Unsupported("native passthrough"))
    }

    /// Attach auth and vendor-specific headers.
    fn setup_headers(&self, headers: &mut Headers, api_key: &str, deployment: &Deployment);

    /// Parameters this vendor accepts under their canonical names.
    fn supported_params(&self) -> &'static [&'static str];

    /// Whitelist + rename pass over non-modeled parameters. Anything the
    /// provider does not claim is dropped, never proxied.
    fn map_params(&self, params: JsonMap<String, JsonValue>) -> JsonMap<String, JsonValue> {
        let allowed = self.supported_params();
        params
            .into_iter()
            .filter(|(k, _)| allowed.contains(&k.as_str()))
            .collect()
    }

    /// Encode the canonical request into this vendor's wire form.
    async fn transform_request(
        &self,
        req: &ChatCompletionRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> ProviderResult<UpstreamHttpRequest>;

    /// Decode a successful (2xx) vendor response into the canonical shape.
    fn transform_response(
        &self,
        status: u16,
        headers: &Headers,
        body: Bytes,
    ) -> ProviderResult<ModelResponse>;

    /// Per-request stream state machine. The default handles vendors that
    /// already speak OpenAI chunk framing.
    fn chunk_transformer(&self) -> Box<dyn ChunkTransformer> {
        Box::new(OpenAiChunkPassthrough::new())
    }
}
