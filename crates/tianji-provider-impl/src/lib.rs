//! Concrete provider adapters.
//!
//! Each module translates the canonical chat completion into one vendor's
//! wire format and back. `build_registry` wires up everything the gateway
//! ships with.

use std::sync::Arc;

use tianji_provider_core::ProviderRegistry;

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod cohere;
pub mod compat;
pub mod gemini;
pub mod mistral;
pub mod openai;
pub mod vertex;

mod shared;

pub use shared::{gen_id, unix_now};

pub fn build_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(openai::OpenAiProvider));
    registry.register(Arc::new(azure::AzureOpenAiProvider));
    registry.register(Arc::new(anthropic::AnthropicProvider));
    registry.register(Arc::new(gemini::GeminiProvider));
    registry.register(Arc::new(bedrock::BedrockProvider));
    registry.register(Arc::new(vertex::VertexAiProvider));
    registry.register(Arc::new(cohere::CohereProvider));
    registry.register(Arc::new(mistral::MistralProvider));
    registry.register(Arc::new(compat::OpenAiCompatibleProvider));
    registry
}

#[cfg(test)]
mod tests {
    use super::build_registry;

    #[test]
    fn registry_carries_all_adapters() {
        let registry = build_registry();
        let names = registry.names();
        for expected in [
            "anthropic",
            "azure-openai",
            "bedrock",
            "cohere",
            "gemini",
            "mistral",
            "openai",
            "openai-compatible",
            "vertex-ai",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
