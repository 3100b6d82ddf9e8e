//! Vertex AI adapter for Gemini models.
//!
//! Same body translation as the gemini adapter; the URL embeds project and
//! region and auth is an OAuth bearer token. Token refresh is out of scope
//! here, the resolved api key is expected to be a live access token.

use async_trait::async_trait;
use bytes::Bytes;

use tianji_protocol::gemini as wire;
use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse};
use tianji_provider_core::provider::UpstreamHttpRequest;
use tianji_provider_core::{
    ChunkTransformer, Deployment, Headers, Provider, ProviderError, ProviderResult,
    headers::set_bearer,
};

use crate::gemini::{GeminiChunkTransformer, from_generate_content_response, to_generate_content_request};
use crate::shared::{decode_json, json_post, param_or_default, require_param};

const DEFAULT_LOCATION: &str = "us-central1";

pub struct VertexAiProvider;

impl VertexAiProvider {
    fn url_for(&self, deployment: &Deployment, stream: bool) -> ProviderResult<String> {
        let project = require_param(deployment, "vertex_project")?;
        let location = param_or_default(deployment, "vertex_location", DEFAULT_LOCATION);
        let verb = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(format!(
            "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{}:{verb}",
            deployment.provider_model
        ))
    }
}

#[async_trait]
impl Provider for VertexAiProvider {
    fn name(&self) -> &'static str {
        "vertex-ai"
    }

    fn api_key_env(&self) -> &'static str {
        "VERTEX_AI_ACCESS_TOKEN"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        self.url_for(deployment, false)
    }

    fn setup_headers(&self, headers: &mut Headers, api_key: &str, _deployment: &Deployment) {
        set_bearer(headers, api_key);
    }

    fn supported_params(&self) -> &'static [&'static str] {
        &[]
    }

    async fn transform_request(
        &self,
        req: &ChatCompletionRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let wire_req = to_generate_content_request(req)?;
        let body = serde_json::to_vec(&wire_req)
            .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;
        let mut headers = Headers::new();
        self.setup_headers(&mut headers, api_key, deployment);
        Ok(json_post(
            self.url_for(deployment, req.wants_stream())?,
            headers,
            Bytes::from(body),
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
        let resp: wire::GenerateContentResponse = decode_json(&body)?;
        from_generate_content_response(resp)
    }

    fn chunk_transformer(&self) -> Box<dyn ChunkTransformer> {
        Box::new(GeminiChunkTransformer::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_embeds_project_and_location() {
        let mut extra = serde_json::Map::new();
        extra.insert("vertex_project".into(), json!("my-proj"));
        extra.insert("vertex_location".into(), json!("europe-west4"));
        let deployment = Deployment {
            id: 0,
            model_name: "gemini".into(),
            provider: "vertex-ai".into(),
            provider_model: "gemini-1.5-pro".into(),
            api_key: None,
            api_base: None,
            weight: 1,
            priority: 0,
            tpm_limit: None,
            rpm_limit: None,
            timeout_ms: None,
            extra_params: extra,
        };
        let url = VertexAiProvider.chat_url(&deployment).unwrap();
        assert_eq!(
            url,
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/my-proj/locations/europe-west4/publishers/google/models/gemini-1.5-pro:generateContent"
        );
    }

    #[test]
    fn missing_project_is_a_config_error() {
        let deployment = Deployment {
            id: 0,
            model_name: "gemini".into(),
            provider: "vertex-ai".into(),
            provider_model: "gemini-1.5-pro".into(),
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
            VertexAiProvider.chat_url(&deployment),
            Err(ProviderError::InvalidConfig(_))
        ));
    }
}
