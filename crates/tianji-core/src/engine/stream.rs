//! SSE relay between the upstream vendor stream and the client.
//!
//! The relay owns its own task and writes pre-encoded SSE frames into an
//! mpsc channel the HTTP layer turns into a response body. A failed send
//! means the client hung up; the upstream receiver is dropped, which
//! closes the upstream socket through the IO layer.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use tianji_common::GatewayError;
use tianji_protocol::openai::Usage;
use tianji_protocol::sse::{SseDecoder, encode_data_frame, encode_done_frame};
use tianji_provider_core::provider::{StreamAction, UpstreamBody};
use tianji_provider_core::{ChunkTransformer, Deployment};

use crate::router::Outcome;
use crate::state::AppState;

pub(crate) struct RelayContext {
    pub state: Arc<AppState>,
    pub deployment: Arc<Deployment>,
    pub logical_model: String,
    pub wants_usage: bool,
    pub started: Instant,
}

enum RelayEnd {
    Completed,
    ClientGone,
    UpstreamError,
}

pub(crate) fn spawn_relay(
    ctx: RelayContext,
    transformer: Box<dyn ChunkTransformer>,
    body: UpstreamBody,
) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(run_relay(ctx, transformer, body, tx));
    rx
}

async fn run_relay(
    ctx: RelayContext,
    mut transformer: Box<dyn ChunkTransformer>,
    body: UpstreamBody,
    tx: tokio::sync::mpsc::Sender<Bytes>,
) {
    let mut upstream = match body {
        UpstreamBody::Stream(rx) => rx,
        UpstreamBody::Bytes(bytes) => {
            // buffered SSE body (tests, small upstreams): run it through the
            // same path via a pre-filled channel
            let (btx, brx) = tokio::sync::mpsc::channel(1);
            let _ = btx.send(bytes).await;
            drop(btx);
            brx
        }
    };

    let mut decoder = SseDecoder::new();
    let mut usage: Option<Usage> = None;
    let mut end = RelayEnd::Completed;
    let mut done_sent = false;

    'outer: while let Some(bytes) = upstream.recv().await {
        for frame in decoder.feed(&bytes) {
            match transformer.transform(&frame) {
                Ok(StreamAction::Chunk { mut chunk, .. }) => {
                    chunk.model = ctx.logical_model.clone();
                    if chunk.usage.is_some() {
                        usage = chunk.usage.clone();
                        if !ctx.wants_usage {
                            chunk.usage = None;
                        }
                    }
                    let payload = match serde_json::to_string(&chunk) {
                        Ok(json) => encode_data_frame(&json),
                        Err(err) => {
                            warn!("failed to encode stream chunk: {err}");
                            continue;
                        }
                    };
                    if tx.send(payload).await.is_err() {
                        end = RelayEnd::ClientGone;
                        break 'outer;
                    }
                }
                Ok(StreamAction::Skip) => {}
                Ok(StreamAction::Done) => {
                    if tx.send(encode_done_frame()).await.is_err() {
                        end = RelayEnd::ClientGone;
                    }
                    done_sent = true;
                    break 'outer;
                }
                Err(err) => {
                    // one canonical error frame, then terminate; never retry
                    // mid-stream
                    let gateway_err = GatewayError::from(err);
                    warn!(
                        provider = %ctx.deployment.provider,
                        model = %ctx.deployment.provider_model,
                        "stream translation failed: {}",
                        gateway_err.message
                    );
                    if tx
                        .send(encode_data_frame(&gateway_err.envelope_json()))
                        .await
                        .is_ok()
                    {
                        let _ = tx.send(encode_done_frame()).await;
                    }
                    done_sent = true;
                    end = RelayEnd::UpstreamError;
                    break 'outer;
                }
            }
        }
    }

    // vendors without a [DONE] sentinel end by closing the stream
    if !done_sent && matches!(end, RelayEnd::Completed) {
        let _ = tx.send(encode_done_frame()).await;
    }

    match end {
        RelayEnd::Completed => {
            debug!(
                provider = %ctx.deployment.provider,
                model = %ctx.deployment.provider_model,
                "stream completed"
            );
            ctx.state.router.report(ctx.deployment.id, Outcome::Success);
            super::record_spend(
                &ctx.state,
                &ctx.deployment,
                &ctx.logical_model,
                usage,
                true,
                200,
                ctx.started,
            );
        }
        RelayEnd::ClientGone | RelayEnd::UpstreamError => {
            // neither credit nor penalize; and no spend row for a stream the
            // client never finished receiving
            ctx.state.router.report(ctx.deployment.id, Outcome::Neutral);
        }
    }
}
