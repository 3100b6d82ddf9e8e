//! The dispatch pipeline: canonical request in, canonical response (or a
//! relayed stream) out.
//!
//! Retries stay within one logical model group. A deployment that fails a
//! transient way is excluded from the rest of this request's attempts and
//! cooled down for future ones; fatal upstream replies surface immediately.

pub mod stream;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use tianji_common::{ErrorKind, GatewayError};
use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse, Usage};
use tianji_provider_core::provider::{UpstreamBody, UpstreamFailure, UpstreamTransportErrorKind};
use tianji_provider_core::{Deployment, Headers, Provider, header_get};
use tianji_storage::SpendLogRow;

use crate::prompt::resolve_prompt;
use crate::router::Outcome;
use crate::state::AppState;

/// What a chat completion dispatch hands back to the HTTP layer.
#[derive(Debug)]
pub enum ChatOutcome {
    /// 200 with a canonical JSON body.
    Completion(ModelResponse),
    /// 200 `text/event-stream`; the receiver yields pre-encoded SSE frames.
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
    /// Upstream reply passed through verbatim (fatal 4xx, or 429/5xx after
    /// retries are exhausted).
    Upstream {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
}

enum AttemptFailure {
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    Http {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
}

pub async fn chat_completion(
    state: Arc<AppState>,
    mut req: ChatCompletionRequest,
) -> Result<ChatOutcome, GatewayError> {
    let started = Instant::now();
    if req.model.is_empty() {
        return Err(GatewayError::invalid_request("model must not be empty"));
    }

    if req.prompt_name.is_some() {
        resolve_prompt(state.storage.as_ref(), &mut req).await?;
    }

    let logical_model = req.model.clone();
    let deployments = state.table.find_deployments(&logical_model).to_vec();
    if deployments.is_empty() {
        return Err(GatewayError::not_found(format!(
            "model group {logical_model} is not configured"
        ))
        .with_code("model_not_found"));
    }

    let mut exclude: HashSet<u64> = HashSet::new();
    let max_attempts = state.router_settings.max_retries + 1;
    let mut last_failure: Option<AttemptFailure> = None;

    for attempt in 0..max_attempts {
        let Some(deployment) = state.router.pick(&deployments, &exclude) else {
            break;
        };
        let provider = state.registry.get(&deployment.provider).ok_or_else(|| {
            GatewayError::internal(format!(
                "provider {} is registered in config but not in the registry",
                deployment.provider
            ))
        })?;

        let api_key = resolve_api_key(provider.as_ref(), &deployment)?;

        let mut upstream_req = match provider
            .transform_request(&req, &deployment, &api_key)
            .await
        {
            Ok(r) => r,
            Err(err) => {
                // nothing was sent; the deployment is fine
                state.router.report(deployment.id, Outcome::Neutral);
                return Err(err.into());
            }
        };
        if upstream_req.timeout_ms.is_none() {
            upstream_req.timeout_ms = Some(state.completion_timeout_ms());
        }

        debug!(
            provider = %deployment.provider,
            model = %deployment.provider_model,
            attempt,
            stream = req.wants_stream(),
            "dispatching upstream request"
        );

        match state.client.send(upstream_req).await {
            Err(UpstreamFailure::Transport { kind, message }) => {
                warn!(
                    provider = %deployment.provider,
                    model = %deployment.provider_model,
                    ?kind,
                    "upstream transport failure: {message}"
                );
                state.router.report(deployment.id, Outcome::Transient);
                exclude.insert(deployment.id);
                last_failure = Some(AttemptFailure::Transport { kind, message });
            }
            Err(UpstreamFailure::Http {
                status,
                headers,
                body,
            }) => {
                // clients that pre-classify HTTP errors land here; treat the
                // same as a non-2xx response body
                match classify_http_failure(
                    &state, &deployment, status, &headers, body, &mut exclude,
                )? {
                    HttpClass::Surface(outcome) => return Ok(outcome),
                    HttpClass::Retryable(failure) => last_failure = Some(failure),
                }
            }
            Ok(resp) if (200..300).contains(&resp.status) => {
                state
                    .ratelimit
                    .parse_and_update(&deployment.ratelimit_key(), &resp.headers);

                if req.wants_stream() {
                    let rx = stream::spawn_relay(
                        stream::RelayContext {
                            state: state.clone(),
                            deployment: deployment.clone(),
                            logical_model: logical_model.clone(),
                            wants_usage: req.wants_stream_usage(),
                            started,
                        },
                        provider.chunk_transformer(),
                        resp.body,
                    );
                    return Ok(ChatOutcome::Stream(rx));
                }

                let body = collect_body(resp.body).await;
                let mut response = provider
                    .transform_response(resp.status, &resp.headers, body)
                    .map_err(|err| {
                        state.router.report(deployment.id, Outcome::Neutral);
                        GatewayError::from(err)
                    })?;
                response.model = logical_model.clone();
                state.router.report(deployment.id, Outcome::Success);
                record_spend(
                    &state,
                    &deployment,
                    &logical_model,
                    response.usage.clone(),
                    false,
                    200,
                    started,
                );
                return Ok(ChatOutcome::Completion(response));
            }
            Ok(resp) => {
                let status = resp.status;
                let headers = resp.headers;
                let body = collect_body(resp.body).await;
                match classify_http_failure(&state, &deployment, status, &headers, body, &mut exclude)? {
                    HttpClass::Surface(outcome) => return Ok(outcome),
                    HttpClass::Retryable(failure) => last_failure = Some(failure),
                }
            }
        }
    }

    match last_failure {
        Some(AttemptFailure::Http {
            status,
            content_type,
            body,
        }) => Ok(ChatOutcome::Upstream {
            status,
            content_type,
            body,
        }),
        Some(AttemptFailure::Transport { kind, message }) => {
            let error_kind = match kind {
                UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout => {
                    ErrorKind::Timeout
                }
                _ => ErrorKind::BadGateway,
            };
            Err(GatewayError::new(
                error_kind,
                format!("all deployments for {logical_model} failed: {message}"),
            ))
        }
        None => Err(GatewayError::new(
            ErrorKind::ServiceUnavailable,
            format!("no healthy deployments for {logical_model}"),
        )
        .with_code("no_healthy_deployments")),
    }
}

enum HttpClass {
    /// Surface this reply to the client now.
    Surface(ChatOutcome),
    /// The deployment was reported and excluded; another attempt may run.
    Retryable(AttemptFailure),
}

fn classify_http_failure(
    state: &AppState,
    deployment: &Deployment,
    status: u16,
    headers: &Headers,
    body: Bytes,
    exclude: &mut HashSet<u64>,
) -> Result<HttpClass, GatewayError> {
    let content_type = header_get(headers, "content-type").map(str::to_string);
    match status {
        429 => {
            let reset = parse_retry_after(headers);
            state
                .router
                .report(deployment.id, Outcome::RateLimited { reset });
            exclude.insert(deployment.id);
            Ok(HttpClass::Retryable(AttemptFailure::Http {
                status,
                content_type,
                body,
            }))
        }
        500.. => {
            state.router.report(deployment.id, Outcome::Transient);
            exclude.insert(deployment.id);
            Ok(HttpClass::Retryable(AttemptFailure::Http {
                status,
                content_type,
                body,
            }))
        }
        401 | 403 => {
            warn!(
                provider = %deployment.provider,
                model = %deployment.provider_model,
                status,
                "upstream rejected gateway credentials"
            );
            state.router.report(deployment.id, Outcome::Fatal);
            Err(GatewayError::internal(format!(
                "upstream authentication failed for provider {}",
                deployment.provider
            )))
        }
        _ => {
            // 400/404/413/422 and other client errors pass through verbatim.
            // This covers stream requests too: no event stream has been
            // opened toward the client at this point, so the reply is a
            // plain HTTP response. Failures after the relay starts surface
            // as terminal SSE frames instead.
            state.router.report(deployment.id, Outcome::Fatal);
            Ok(HttpClass::Surface(ChatOutcome::Upstream {
                status,
                content_type,
                body,
            }))
        }
    }
}

pub(crate) fn resolve_api_key(
    provider: &dyn Provider,
    deployment: &Deployment,
) -> Result<String, GatewayError> {
    if let Some(key) = &deployment.api_key {
        return Ok(key.clone());
    }
    if let Ok(key) = std::env::var(provider.api_key_env()) {
        return Ok(key);
    }
    Err(GatewayError::invalid_request(format!(
        "no API key configured for deployment {} (set {} or tianji_params.api_key)",
        deployment.model_name,
        provider.api_key_env()
    )))
}

/// `Retry-After` in integer seconds. The HTTP-date form is rare on LLM
/// APIs and is ignored.
pub(crate) fn parse_retry_after(headers: &Headers) -> Option<OffsetDateTime> {
    let secs: i64 = header_get(headers, "retry-after")?.trim().parse().ok()?;
    Some(OffsetDateTime::now_utc() + Duration::seconds(secs))
}

pub async fn collect_body(body: UpstreamBody) -> Bytes {
    match body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            Bytes::from(out)
        }
    }
}

/// Spend logging is fire-and-forget on its own task with its own deadline;
/// a slow or dead storage backend never affects the client response.
pub(crate) fn record_spend(
    state: &AppState,
    deployment: &Deployment,
    logical_model: &str,
    usage: Option<Usage>,
    stream: bool,
    status: i32,
    started: Instant,
) {
    let storage = state.storage.clone();
    let row = SpendLogRow {
        request_id: tianji_provider_impl::gen_id("req"),
        model_group: logical_model.to_string(),
        provider: deployment.provider.clone(),
        provider_model: deployment.provider_model.clone(),
        prompt_tokens: usage.as_ref().map(|u| u.prompt_tokens as i64).unwrap_or(0),
        completion_tokens: usage
            .as_ref()
            .map(|u| u.completion_tokens as i64)
            .unwrap_or(0),
        total_tokens: usage.as_ref().map(|u| u.total_tokens as i64).unwrap_or(0),
        stream,
        status,
        latency_ms: started.elapsed().as_millis() as i64,
        created_at: OffsetDateTime::now_utc(),
    };
    tokio::spawn(async move {
        let write = storage.insert_spend_log(row);
        match tokio::time::timeout(std::time::Duration::from_secs(5), write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("spend log write failed: {err}"),
            Err(_) => warn!("spend log write timed out"),
        }
    });
}
