//! Pass-through dispatch for non-chat surfaces.
//!
//! Three flavors: OpenAI-shaped auxiliary endpoints (embeddings, images,
//! audio, moderations) that resolve through the deployment table and get a
//! model-name rewrite; vendor-native endpoints (Anthropic messages, Gemini
//! generateContent) relayed in their own wire format; and provider-agnostic
//! endpoints (files, batches, fine-tuning) forwarded to one provider's base.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::debug;

use tianji_common::GatewayError;
use tianji_provider_core::provider::{HttpMethod, UpstreamFailure, UpstreamHttpRequest};
use tianji_provider_core::{
    Deployment, Headers, header_get, header_set,
    headers::{set_accept_event_stream, set_content_type_json},
};

use crate::engine::resolve_api_key;
use crate::router::Outcome;
use crate::state::AppState;

/// A relayed upstream reply; the body may still be streaming.
pub struct PassthroughReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: tianji_provider_core::provider::UpstreamBody,
}

/// OpenAI-shaped auxiliary endpoint: resolve `model` from the JSON body,
/// rewrite it to the provider's model id, forward to the provider's base
/// URL at `path`, and relay the reply.
pub async fn openai_shaped(
    state: Arc<AppState>,
    path: &str,
    body: Bytes,
) -> Result<PassthroughReply, GatewayError> {
    let mut json: JsonValue = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::invalid_request(format!("request body is not JSON: {e}")))?;
    let model = json
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| GatewayError::invalid_request("request body has no model field"))?
        .to_string();

    let (deployment, provider) = pick_deployment(&state, &model)?;
    if let Some(obj) = json.as_object_mut() {
        obj.insert(
            "model".to_string(),
            JsonValue::String(deployment.provider_model.clone()),
        );
    }
    let body = serde_json::to_vec(&json)
        .map_err(|e| GatewayError::internal(format!("failed to re-encode body: {e}")))?;

    let base = provider.native_base(&deployment).map_err(GatewayError::from)?;
    let api_key = resolve_api_key(provider.as_ref(), &deployment)?;
    let mut headers = Headers::new();
    provider.setup_headers(&mut headers, &api_key, &deployment);
    set_content_type_json(&mut headers);

    let req = UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: format!("{base}{path}"),
        headers,
        body: Some(Bytes::from(body)),
        is_stream: false,
        timeout_ms: Some(
            deployment
                .timeout_ms
                .unwrap_or_else(|| state.auxiliary_timeout_ms()),
        ),
    };
    forward(state, deployment, req).await
}

/// Multipart or other opaque bodies: relayed untouched, with the caller's
/// content type preserved. The logical model arrives out of band (query
/// string or header) since the body is not parseable here.
pub async fn opaque_body(
    state: Arc<AppState>,
    model: &str,
    path: &str,
    content_type: Option<&str>,
    body: Bytes,
) -> Result<PassthroughReply, GatewayError> {
    let (deployment, provider) = pick_deployment(&state, model)?;
    let base = provider.native_base(&deployment).map_err(GatewayError::from)?;
    let api_key = resolve_api_key(provider.as_ref(), &deployment)?;
    let mut headers = Headers::new();
    provider.setup_headers(&mut headers, &api_key, &deployment);
    if let Some(ct) = content_type {
        header_set(&mut headers, "content-type", ct);
    }

    let req = UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: format!("{base}{path}"),
        headers,
        body: Some(body),
        is_stream: false,
        timeout_ms: Some(
            deployment
                .timeout_ms
                .unwrap_or_else(|| state.auxiliary_timeout_ms()),
        ),
    };
    forward(state, deployment, req).await
}

/// Vendor-native request (Anthropic messages, Gemini generateContent):
/// the body already speaks the provider's wire format. The logical model is
/// rewritten to the provider's model id and auth headers attached; the
/// reply, streaming or not, is relayed verbatim.
pub async fn native(
    state: Arc<AppState>,
    expected_provider: &str,
    model: &str,
    path: &str,
    body: Bytes,
    is_stream: bool,
) -> Result<PassthroughReply, GatewayError> {
    let (deployment, provider) = pick_deployment(&state, model)?;
    if deployment.provider != expected_provider {
        return Err(GatewayError::invalid_request(format!(
            "model {model} resolves to provider {}, not {expected_provider}",
            deployment.provider
        )));
    }

    let base = provider.native_base(&deployment).map_err(GatewayError::from)?;
    let api_key = resolve_api_key(provider.as_ref(), &deployment)?;
    let mut headers = Headers::new();
    provider.setup_headers(&mut headers, &api_key, &deployment);
    set_content_type_json(&mut headers);
    if is_stream {
        set_accept_event_stream(&mut headers);
    }

    // the path template carries `{model}` where the provider model id goes
    let path = path.replace("{model}", &deployment.provider_model);
    let body = rewrite_body_model(body, &deployment)?;

    let req = UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: format!("{base}{path}"),
        headers,
        body: Some(body),
        is_stream,
        timeout_ms: Some(
            deployment
                .timeout_ms
                .unwrap_or_else(|| state.completion_timeout_ms()),
        ),
    };
    forward(state, deployment, req).await
}

/// Provider-agnostic endpoints (`/v1/files`, `/v1/batches`,
/// `/v1/fine_tuning/...`): forwarded to the named provider's base URL with
/// its env credentials; no deployment table involved.
pub async fn provider_scoped(
    state: Arc<AppState>,
    provider_name: &str,
    method: HttpMethod,
    path_and_query: &str,
    content_type: Option<&str>,
    body: Bytes,
) -> Result<PassthroughReply, GatewayError> {
    let provider = state.registry.get(provider_name).ok_or_else(|| {
        GatewayError::invalid_request(format!("unknown provider {provider_name}"))
    })?;

    // synthesize a deployment-shaped view so the provider can build its base
    let deployment = Deployment {
        id: u64::MAX,
        model_name: String::new(),
        provider: provider_name.to_string(),
        provider_model: String::new(),
        api_key: None,
        api_base: None,
        weight: 1,
        priority: 0,
        tpm_limit: None,
        rpm_limit: None,
        timeout_ms: None,
        extra_params: serde_json::Map::new(),
    };
    let base = provider.native_base(&deployment).map_err(GatewayError::from)?;
    let api_key = resolve_api_key(provider.as_ref(), &deployment)?;
    let mut headers = Headers::new();
    provider.setup_headers(&mut headers, &api_key, &deployment);
    if let Some(ct) = content_type {
        header_set(&mut headers, "content-type", ct);
    }

    // some bases already end in /v1 (openai, mistral); avoid /v1/v1
    let path_and_query = match path_and_query.strip_prefix("/v1") {
        Some(rest) if base.ends_with("/v1") => rest,
        _ => path_and_query,
    };

    let req = UpstreamHttpRequest {
        method,
        url: format!("{base}{path_and_query}"),
        headers,
        body: (!body.is_empty()).then_some(body),
        is_stream: false,
        timeout_ms: Some(state.auxiliary_timeout_ms()),
    };

    debug!(provider = %provider_name, path = %path_and_query, "provider-scoped passthrough");
    match state.client.send(req).await {
        Ok(resp) => Ok(PassthroughReply {
            status: resp.status,
            content_type: header_get(&resp.headers, "content-type").map(str::to_string),
            body: resp.body,
        }),
        Err(failure) => Err(transport_error(failure)),
    }
}

fn pick_deployment(
    state: &AppState,
    model: &str,
) -> Result<(Arc<Deployment>, Arc<dyn tianji_provider_core::Provider>), GatewayError> {
    let group = state.table.find_deployments(model);
    if group.is_empty() {
        return Err(GatewayError::not_found(format!(
            "model group {model} is not configured"
        ))
        .with_code("model_not_found"));
    }
    let deployment = state
        .router
        .pick(group, &HashSet::new())
        .ok_or_else(|| GatewayError::internal("router produced no pick from a non-empty group"))?;
    let provider = state.registry.get(&deployment.provider).ok_or_else(|| {
        GatewayError::internal(format!("provider {} not registered", deployment.provider))
    })?;
    Ok((deployment, provider))
}

/// Rewrite a `model` field in a native JSON body when present (Anthropic
/// carries it in the body; Gemini carries it in the path).
fn rewrite_body_model(body: Bytes, deployment: &Deployment) -> Result<Bytes, GatewayError> {
    let Ok(mut json) = serde_json::from_slice::<JsonValue>(&body) else {
        return Ok(body);
    };
    let Some(obj) = json.as_object_mut() else {
        return Ok(body);
    };
    if obj.contains_key("model") {
        obj.insert(
            "model".to_string(),
            JsonValue::String(deployment.provider_model.clone()),
        );
        let out = serde_json::to_vec(&json)
            .map_err(|e| GatewayError::internal(format!("failed to re-encode body: {e}")))?;
        return Ok(Bytes::from(out));
    }
    Ok(body)
}

async fn forward(
    state: Arc<AppState>,
    deployment: Arc<Deployment>,
    req: UpstreamHttpRequest,
) -> Result<PassthroughReply, GatewayError> {
    match state.client.send(req).await {
        Ok(resp) => {
            if (200..300).contains(&resp.status) {
                state
                    .ratelimit
                    .parse_and_update(&deployment.ratelimit_key(), &resp.headers);
                state.router.report(deployment.id, Outcome::Success);
            } else if resp.status == 429 || resp.status >= 500 {
                state.router.report(deployment.id, Outcome::Transient);
            } else {
                state.router.report(deployment.id, Outcome::Fatal);
            }
            Ok(PassthroughReply {
                status: resp.status,
                content_type: header_get(&resp.headers, "content-type").map(str::to_string),
                body: resp.body,
            })
        }
        Err(failure) => {
            state.router.report(deployment.id, Outcome::Transient);
            Err(transport_error(failure))
        }
    }
}

fn transport_error(failure: UpstreamFailure) -> GatewayError {
    match failure {
        UpstreamFailure::Transport { kind, message } => {
            use tianji_provider_core::provider::UpstreamTransportErrorKind as K;
            let error_kind = match kind {
                K::Timeout | K::ReadTimeout => tianji_common::ErrorKind::Timeout,
                _ => tianji_common::ErrorKind::BadGateway,
            };
            GatewayError::new(error_kind, format!("upstream transport failure: {message}"))
        }
        UpstreamFailure::Http { status, .. } => GatewayError::new(
            tianji_common::ErrorKind::BadGateway,
            format!("upstream replied {status}"),
        ),
    }
}
