//! Azure OpenAI. Same wire format as OpenAI, but the URL embeds an Azure
//! deployment id, the API version rides in the query string, and auth uses
//! the `api-key` header instead of a bearer token.

use async_trait::async_trait;
use bytes::Bytes;

use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse};
use tianji_provider_core::provider::UpstreamHttpRequest;
use tianji_provider_core::{
    Deployment, Headers, Provider, ProviderError, ProviderResult, header_set,
};

use crate::openai::OPENAI_EXTRA_PARAMS;
use crate::shared::{decode_json, json_post, openai_wire_body, param_or_default};

const DEFAULT_API_VERSION: &str = "2024-06-01";

pub struct AzureOpenAiProvider;

impl AzureOpenAiProvider {
    fn base<'a>(&self, deployment: &'a Deployment) -> ProviderResult<&'a str> {
        deployment.api_base.as_deref().ok_or_else(|| {
            ProviderError::InvalidConfig(format!(
                "azure deployment {} requires api_base",
                deployment.model_name
            ))
        })
    }
}

#[async_trait]
impl Provider for AzureOpenAiProvider {
    fn name(&self) -> &'static str {
        "azure-openai"
    }

    fn api_key_env(&self) -> &'static str {
        "AZURE_OPENAI_API_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        let base = self.base(deployment)?;
        let azure_deployment =
            param_or_default(deployment, "azure_deployment", &deployment.provider_model);
        let api_version = param_or_default(deployment, "azure_api_version", DEFAULT_API_VERSION);
        Ok(format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            base.trim_end_matches('/'),
            azure_deployment,
            api_version
        ))
    }

    fn native_base(&self, deployment: &Deployment) -> ProviderResult<String> {
        Ok(self.base(deployment)?.trim_end_matches('/').to_string())
    }

    fn setup_headers(&self, headers: &mut Headers, api_key: &str, _deployment: &Deployment) {
        header_set(headers, "api-key", api_key);
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

    #[test]
    fn url_embeds_deployment_and_api_version() {
        let mut extra = serde_json::Map::new();
        extra.insert("azure_deployment".into(), json!("gpt4o-eu"));
        let deployment = Deployment {
            id: 0,
            model_name: "gpt-4o".into(),
            provider: "azure-openai".into(),
            provider_model: "gpt-4o".into(),
            api_key: None,
            api_base: Some("https://eu.openai.azure.com/".into()),
            weight: 1,
            priority: 0,
            tpm_limit: None,
            rpm_limit: None,
            timeout_ms: None,
            extra_params: extra,
        };
        let url = AzureOpenAiProvider.chat_url(&deployment).unwrap();
        assert_eq!(
            url,
            "https://eu.openai.azure.com/openai/deployments/gpt4o-eu/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn missing_api_base_is_a_config_error() {
        let deployment = Deployment {
            id: 0,
            model_name: "gpt-4o".into(),
            provider: "azure-openai".into(),
            provider_model: "gpt-4o".into(),
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
            AzureOpenAiProvider.chat_url(&deployment),
            Err(ProviderError::InvalidConfig(_))
        ));
    }
}
