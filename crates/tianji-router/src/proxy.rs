//! Proxy routes: the canonical chat surface plus pass-through endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use tianji_common::GatewayError;
use tianji_core::engine::{ChatOutcome, chat_completion};
use tianji_core::passthrough::{self, PassthroughReply};
use tianji_core::AppState;
use tianji_protocol::openai::ChatCompletionRequest;
use tianji_provider_core::{HttpMethod, UpstreamBody};

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        // OpenAI-shaped auxiliary endpoints
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/moderations", post(moderations))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        // Vendor-native pass-throughs
        .route("/anthropic/v1/messages", post(anthropic_messages))
        .route(
            "/gemini/v1beta/models/{*model_action}",
            post(gemini_generate),
        )
        // Provider-agnostic pass-throughs
        .route("/v1/files", any(provider_passthrough))
        .route("/v1/files/{*rest}", any(provider_passthrough))
        .route("/v1/batches", any(provider_passthrough))
        .route("/v1/batches/{*rest}", any(provider_passthrough))
        .route("/v1/fine_tuning/jobs", any(provider_passthrough))
        .route("/v1/fine_tuning/jobs/{*rest}", any(provider_passthrough))
        .with_state(state)
}

async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            return error_response(&GatewayError::invalid_request(format!(
                "malformed request body: {err}"
            )));
        }
    };

    match chat_completion(state, req).await {
        Ok(ChatOutcome::Completion(resp)) => (StatusCode::OK, Json(resp)).into_response(),
        Ok(ChatOutcome::Stream(rx)) => sse_response(rx),
        Ok(ChatOutcome::Upstream {
            status,
            content_type,
            body,
        }) => raw_response(status, content_type, body),
        Err(err) => error_response(&err),
    }
}

// ---- OpenAI-shaped auxiliary endpoints ----

async fn completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    openai_shaped(state, "/completions", body).await
}

async fn embeddings(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    openai_shaped(state, "/embeddings", body).await
}

async fn images_generations(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    openai_shaped(state, "/images/generations", body).await
}

async fn audio_speech(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    openai_shaped(state, "/audio/speech", body).await
}

async fn moderations(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    openai_shaped(state, "/moderations", body).await
}

async fn openai_shaped(state: Arc<AppState>, path: &str, body: Bytes) -> Response {
    match passthrough::openai_shaped(state, path, body).await {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(&err),
    }
}

/// Multipart body; the logical model rides in the query string or the
/// `x-tianji-model` header since the body is opaque here.
async fn audio_transcriptions(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model = query_param(uri.query(), "model").or_else(|| {
        headers
            .get("x-tianji-model")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let Some(model) = model else {
        return error_response(&GatewayError::invalid_request(
            "model must be passed as ?model= or x-tianji-model for multipart endpoints",
        ));
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    match passthrough::opaque_body(state, &model, "/audio/transcriptions", content_type, body)
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(&err),
    }
}

// ---- Vendor-native pass-throughs ----

async fn anthropic_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return error_response(&GatewayError::invalid_request("request body is not JSON"));
    };
    let Some(model) = json.get("model").and_then(|m| m.as_str()).map(str::to_string) else {
        return error_response(&GatewayError::invalid_request(
            "request body has no model field",
        ));
    };
    let is_stream = json
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    match passthrough::native(state, "anthropic", &model, "/v1/messages", body, is_stream).await {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(&err),
    }
}

async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    let raw = model_action.trim_start_matches('/');
    let Some((model, action)) = raw.split_once(':') else {
        return error_response(&GatewayError::invalid_request(
            "expected models/{model}:{action}",
        ));
    };

    let (path, is_stream) = match action {
        "generateContent" => ("/models/{model}:generateContent", false),
        "streamGenerateContent" => ("/models/{model}:streamGenerateContent?alt=sse", true),
        _ => {
            return error_response(
                &GatewayError::not_found(format!("unknown action {action}"))
                    .with_code("unknown_action"),
            );
        }
    };

    match passthrough::native(state, "gemini", model, path, body, is_stream).await {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(&err),
    }
}

// ---- Provider-agnostic pass-throughs ----

/// `/v1/files`, `/v1/batches`, `/v1/fine_tuning/jobs` and their subpaths.
/// The target provider comes from `?provider=`, defaulting to openai; the
/// rest of the query string is forwarded as-is.
async fn provider_passthrough(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(method) = HttpMethod::parse(method.as_str()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };

    let (provider, forwarded_query) = split_provider_query(uri.query());
    let path_and_query = match forwarded_query {
        Some(q) => format!("{}?{q}", uri.path()),
        None => uri.path().to_string(),
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    debug!(provider = %provider, path = %path_and_query, "provider passthrough");
    match passthrough::provider_scoped(state, &provider, method, &path_and_query, content_type, body)
        .await
    {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(&err),
    }
}

fn split_provider_query(query: Option<&str>) -> (String, Option<String>) {
    let Some(q) = query else {
        return ("openai".to_string(), None);
    };
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(q) else {
        return ("openai".to_string(), Some(q.to_string()));
    };
    let provider = pairs
        .iter()
        .find(|(k, _)| k == "provider")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "openai".to_string());
    let rest: Vec<(String, String)> = pairs.into_iter().filter(|(k, _)| k != "provider").collect();
    let forwarded = if rest.is_empty() {
        None
    } else {
        serde_urlencoded::to_string(&rest).ok()
    };
    (provider, forwarded)
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(query?).ok()?;
    pairs
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

// ---- Response assembly ----

pub(crate) fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.envelope())).into_response()
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    // reverse proxies buffer SSE unless told otherwise
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    resp
}

fn raw_response(status: u16, content_type: Option<String>, body: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type
        && let Ok(value) = HeaderValue::from_str(&ct)
    {
        builder = builder.header(header::CONTENT_TYPE, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn reply_response(reply: PassthroughReply) -> Response {
    match reply.body {
        UpstreamBody::Bytes(bytes) => raw_response(reply.status, reply.content_type, bytes),
        UpstreamBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            let mut builder = Response::builder().status(reply.status);
            if let Some(ct) = reply.content_type.as_deref()
                && let Ok(value) = HeaderValue::from_str(ct)
            {
                builder = builder.header(header::CONTENT_TYPE, value);
            }
            builder = builder
                .header(header::CACHE_CONTROL, "no-cache")
                .header("x-accel-buffering", "no");
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_query_splits_and_defaults() {
        let (provider, rest) = split_provider_query(Some("provider=anthropic&limit=10"));
        assert_eq!(provider, "anthropic");
        assert_eq!(rest.as_deref(), Some("limit=10"));

        let (provider, rest) = split_provider_query(None);
        assert_eq!(provider, "openai");
        assert_eq!(rest, None);

        let (provider, rest) = split_provider_query(Some("provider=openai"));
        assert_eq!(provider, "openai");
        assert_eq!(rest, None);
    }

    #[test]
    fn query_param_finds_model() {
        assert_eq!(
            query_param(Some("model=whisper-large&x=1"), "model").as_deref(),
            Some("whisper-large")
        );
        assert_eq!(query_param(Some("model="), "model"), None);
        assert_eq!(query_param(None, "model"), None);
    }
}
