//! Wire types for tianji.
//!
//! `openai` holds the canonical (OpenAI-compatible) request/response shapes
//! used inside the gateway; `anthropic` and `gemini` model the vendor-native
//! formats the adapters translate to and from. No IO happens here.

pub mod anthropic;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod sse;
