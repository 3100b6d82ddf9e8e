//! Provider abstractions for tianji.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. Adapters describe upstream requests as `UpstreamHttpRequest`
//! values; a higher layer performs IO.

pub mod config;
pub mod errors;
pub mod headers;
pub mod provider;
pub mod registry;
pub mod stream;

pub use config::{ConfigError, Deployment, GatewayConfig, ModelTable};
pub use errors::{ProviderError, ProviderResult};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use provider::{
    ByteStream, HttpMethod, Provider, StreamAction, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};
pub use registry::{ProviderRegistry, parse_model_name};
pub use stream::{ChunkTransformer, OpenAiChunkPassthrough};
