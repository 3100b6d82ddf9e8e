//! Small helpers shared across adapters.

use bytes::Bytes;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use tianji_protocol::openai::ChatCompletionRequest;
use tianji_provider_core::provider::{HttpMethod, UpstreamHttpRequest};
use tianji_provider_core::{
    Deployment, Headers, Provider, ProviderError, ProviderResult,
    headers::{set_accept_event_stream, set_accept_json, set_content_type_json},
};

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Random id with a vendor-style prefix, e.g. `chatcmpl-8fK...`.
pub fn gen_id(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("{prefix}-{suffix}")
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Serialize the canonical request as an OpenAI-wire body: the provider's
/// model id substituted in, prompt fields cleared, and extra params run
/// through the adapter's whitelist.
pub fn openai_wire_body(
    provider: &dyn Provider,
    req: &ChatCompletionRequest,
    model: &str,
) -> ProviderResult<Bytes> {
    let mut out = req.clone();
    out.model = model.to_string();
    out.clear_prompt_fields();
    out.extra = provider.map_params(std::mem::take(&mut out.extra));
    let body = serde_json::to_vec(&out)
        .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;
    Ok(Bytes::from(body))
}

/// Assemble a POST with JSON body and stream-aware accept header.
pub fn json_post(
    url: String,
    headers: Headers,
    body: Bytes,
    is_stream: bool,
    deployment: &Deployment,
) -> UpstreamHttpRequest {
    let mut headers = headers;
    set_content_type_json(&mut headers);
    if is_stream {
        set_accept_event_stream(&mut headers);
    } else {
        set_accept_json(&mut headers);
    }
    UpstreamHttpRequest {
        method: HttpMethod::Post,
        url,
        headers,
        body: Some(body),
        is_stream,
        timeout_ms: deployment.timeout_ms,
    }
}

/// Decode a JSON body, reporting the serde error as a decode failure.
pub fn decode_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> ProviderResult<T> {
    serde_json::from_slice(body).map_err(ProviderError::decode)
}

pub fn require_param<'a>(
    deployment: &'a Deployment,
    key: &str,
) -> ProviderResult<&'a str> {
    deployment.param_str(key).ok_or_else(|| {
        ProviderError::InvalidConfig(format!(
            "deployment {} is missing required parameter {key}",
            deployment.model_name
        ))
    })
}

pub fn param_or_default<'a>(deployment: &'a Deployment, key: &str, default: &'a str) -> &'a str {
    deployment.param_str(key).unwrap_or(default)
}

/// Some adapters accept structured extras (json values) under whitelisted
/// names; this keeps only whitelisted keys regardless of value type.
pub fn whitelist(
    params: serde_json::Map<String, JsonValue>,
    allowed: &[&str],
) -> serde_json::Map<String, JsonValue> {
    params
        .into_iter()
        .filter(|(k, _)| allowed.contains(&k.as_str()))
        .collect()
}
