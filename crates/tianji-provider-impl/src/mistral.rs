//! Mistral. OpenAI-compatible wire format with a narrower parameter set.

use async_trait::async_trait;
use bytes::Bytes;

use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse};
use tianji_provider_core::provider::UpstreamHttpRequest;
use tianji_provider_core::{Deployment, Headers, Provider, ProviderResult, headers::set_bearer};

use crate::shared::{decode_json, join_url, json_post, openai_wire_body};

const DEFAULT_BASE: &str = "https://api.mistral.ai/v1";

pub struct MistralProvider;

#[async_trait]
impl Provider for MistralProvider {
    fn name(&self) -> &'static str {
        "mistral"
    }

    fn api_key_env(&self) -> &'static str {
        "MISTRAL_API_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        let base = deployment.api_base.as_deref().unwrap_or(DEFAULT_BASE);
        Ok(join_url(base, "chat/completions"))
    }

    fn setup_headers(&self, headers: &mut Headers, api_key: &str, _deployment: &Deployment) {
        set_bearer(headers, api_key);
    }

    fn supported_params(&self) -> &'static [&'static str] {
        &["safe_prompt", "random_seed"]
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
