//! Dispatch core: routing, rate-limit telemetry, prompt templates, the
//! upstream HTTP client, and the chat completion pipeline.

pub mod engine;
pub mod passthrough;
pub mod prompt;
pub mod ratelimit;
pub mod router;
pub mod state;
pub mod upstream_client;

pub use engine::{ChatOutcome, chat_completion};
pub use passthrough::PassthroughReply;
pub use ratelimit::{RateLimitState, RateLimitStore};
pub use router::{Outcome, Router};
pub use state::AppState;
pub use upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
