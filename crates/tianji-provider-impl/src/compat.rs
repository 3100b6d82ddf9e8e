//! Generic adapter for any OpenAI-compatible server (vllm, ollama, local
//! proxies). `api_base` is mandatory; everything else passes through.

use async_trait::async_trait;
use bytes::Bytes;

use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse};
use tianji_provider_core::provider::UpstreamHttpRequest;
use tianji_provider_core::{
    Deployment, Headers, Provider, ProviderError, ProviderResult, headers::set_bearer,
};

use crate::openai::OPENAI_EXTRA_PARAMS;
use crate::shared::{decode_json, join_url, json_post, openai_wire_body};

pub struct OpenAiCompatibleProvider;

impl OpenAiCompatibleProvider {
    fn base<'a>(&self, deployment: &'a Deployment) -> ProviderResult<&'a str> {
        deployment.api_base.as_deref().ok_or_else(|| {
            ProviderError::InvalidConfig(format!(
                "openai-compatible deployment {} requires api_base",
                deployment.model_name
            ))
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    fn api_key_env(&self) -> &'static str {
        "OPENAI_COMPATIBLE_API_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        Ok(join_url(self.base(deployment)?, "chat/completions"))
    }

    fn native_base(&self, deployment: &Deployment) -> ProviderResult<String> {
        Ok(self.base(deployment)?.trim_end_matches('/').to_string())
    }

    fn setup_headers(&self, headers: &mut Headers, api_key: &str, _deployment: &Deployment) {
        if !api_key.is_empty() {
            set_bearer(headers, api_key);
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

    #[test]
    fn api_base_is_mandatory() {
        let deployment = Deployment {
            id: 0,
            model_name: "local".into(),
            provider: "openai-compatible".into(),
            provider_model: "llama3".into(),
            api_key: None,
            api_base: None,
            weight: 1,
            priority: 0,
            tpm_limit: None,
            rpm_limit: None,
            timeout_ms: None,
            extra_params: serde_json::Map::new(),
        };
        assert!(matches!(
            OpenAiCompatibleProvider.chat_url(&deployment),
            Err(ProviderError::InvalidConfig(_))
        ));
    }
}
