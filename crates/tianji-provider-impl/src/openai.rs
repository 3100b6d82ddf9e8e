//! The canonical adapter. Requests and responses pass through with only the
//! model id substituted and unknown params whitelisted.

use async_trait::async_trait;
use bytes::Bytes;

use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse};
use tianji_provider_core::provider::UpstreamHttpRequest;
use tianji_provider_core::{Deployment, Headers, Provider, ProviderResult, headers::set_bearer};

use crate::shared::{decode_json, join_url, json_post, openai_wire_body};

const DEFAULT_BASE: &str = "https://api.openai.com/v1";

/// Params forwarded verbatim when present in `extra`. Everything else is
/// dropped, never proxied blind.
pub(crate) const OPENAI_EXTRA_PARAMS: &[&str] = &[
    "logit_bias",
    "logprobs",
    "top_logprobs",
    "parallel_tool_calls",
    "service_tier",
    "store",
    "reasoning_effort",
    "modalities",
    "audio",
    "prediction",
    "web_search_options",
];

pub struct OpenAiProvider;

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn api_key_env(&self) -> &'static str {
        "OPENAI_API_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        let base = deployment.api_base.as_deref().unwrap_or(DEFAULT_BASE);
        Ok(join_url(base, "chat/completions"))
    }

    fn native_base(&self, deployment: &Deployment) -> ProviderResult<String> {
        Ok(deployment
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string())
    }

    fn setup_headers(&self, headers: &mut Headers, api_key: &str, deployment: &Deployment) {
        set_bearer(headers, api_key);
        if let Some(org) = deployment.param_str("openai_organization") {
            tianji_provider_core::header_set(headers, "openai-organization", org);
        }
    }

    fn supported_params(&self) -> &'static [&'static str] {
        OPENAI_EXTRA_PARAMS
    }

    async fn transform_request(
        &self,
        req: &ChatCompletionRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let body = openai_wire_body(self, req, &deployment.provider_model)?;
        let mut headers = Headers::new();
        self.setup_headers(&mut headers, api_key, deployment);
        Ok(json_post(
            self.chat_url(deployment)?,
            headers,
            body,
            req.wants_stream(),
            deployment,
        ))
    }

    fn transform_response(
        &self,
        _status: u16,
        _headers: &Headers,
        body: Bytes,
    ) -> ProviderResult<ModelResponse> {
        decode_json(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Deployment {
        Deployment {
            id: 0,
            model_name: "gpt-4o".into(),
            provider: "openai".into(),
            provider_model: "gpt-4o-2024-08-06".into(),
            api_key: Some("sk-test".into()),
            api_base: None,
            weight: 1,
            priority: 0,
            tpm_limit: None,
            rpm_limit: None,
            timeout_ms: Some(30_000),
            extra_params: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn request_swaps_model_and_filters_extras() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"1": -100},
            "unknown_knob": true,
        }))
        .unwrap();

        let provider = OpenAiProvider;
        let upstream = provider
            .transform_request(&req, &deployment(), "sk-test")
            .await
            .unwrap();

        assert_eq!(upstream.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(upstream.timeout_ms, Some(30_000));
        let body: serde_json::Value =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert!(body.get("logit_bias").is_some());
        assert!(body.get("unknown_knob").is_none());

        let auth = tianji_provider_core::header_get(&upstream.headers, "authorization");
        assert_eq!(auth, Some("Bearer sk-test"));
    }

    #[tokio::test]
    async fn prompt_fields_never_reach_the_wire() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "prompt_name": "greeting",
            "prompt_version": 2,
        }))
        .unwrap();
        let upstream = OpenAiProvider
            .transform_request(&req, &deployment(), "sk-test")
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(upstream.body.as_ref().unwrap()).unwrap();
        assert!(body.get("prompt_name").is_none());
        assert!(body.get("prompt_version").is_none());
    }
}
