//! AWS Bedrock adapter for Claude model ids.
//!
//! The body is the Anthropic Messages shape minus `model` and `stream`,
//! plus the `anthropic_version` pin Bedrock requires. Requests are signed
//! with SigV4; the secret key arrives through the normal key-resolution
//! chain (`AWS_SECRET_ACCESS_KEY` as the env fallback).

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::macros::format_description;

use tianji_protocol::anthropic as anthropic_wire;
use tianji_protocol::openai::{ChatCompletionRequest, ModelResponse};
use tianji_provider_core::provider::{HttpMethod, UpstreamHttpRequest};
use tianji_provider_core::{
    Deployment, Headers, Provider, ProviderError, ProviderResult,
};

use crate::anthropic::{from_messages_response, to_messages_request};
use crate::shared::decode_json;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_REGION: &str = "us-east-1";
const SERVICE: &str = "bedrock";

pub struct BedrockProvider;

impl BedrockProvider {
    fn region<'a>(&self, deployment: &'a Deployment) -> &'a str {
        deployment.param_str("aws_region_name").unwrap_or(DEFAULT_REGION)
    }

    fn host(&self, deployment: &Deployment) -> String {
        format!("bedrock-runtime.{}.amazonaws.com", self.region(deployment))
    }

    fn access_key(&self, deployment: &Deployment) -> ProviderResult<String> {
        deployment
            .param_str("aws_access_key_id")
            .map(str::to_string)
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| {
                ProviderError::InvalidConfig(
                    "bedrock requires aws_access_key_id in params or AWS_ACCESS_KEY_ID".to_string(),
                )
            })
    }

    fn session_token(&self, deployment: &Deployment) -> Option<String> {
        deployment
            .param_str("aws_session_token")
            .map(str::to_string)
            .or_else(|| std::env::var("AWS_SESSION_TOKEN").ok())
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn api_key_env(&self) -> &'static str {
        "AWS_SECRET_ACCESS_KEY"
    }

    fn chat_url(&self, deployment: &Deployment) -> ProviderResult<String> {
        Ok(format!(
            "https://{}/model/{}/invoke",
            self.host(deployment),
            deployment.provider_model
        ))
    }

    fn setup_headers(&self, _headers: &mut Headers, _api_key: &str, _deployment: &Deployment) {
        // All headers are produced during signing.
    }

    fn supported_params(&self) -> &'static [&'static str] {
        &["top_k"]
    }

    async fn transform_request(
        &self,
        req: &ChatCompletionRequest,
        deployment: &Deployment,
        api_key: &str,
    ) -> ProviderResult<UpstreamHttpRequest> {
        if req.wants_stream() {
            // Bedrock streams in the AWS binary event-stream framing, not
            // SSE; route streaming traffic to another deployment.
            return Err(ProviderError::Unsupported("bedrock streaming"));
        }

        let wire_req = to_messages_request(req, &deployment.provider_model)?;
        let mut value = serde_json::to_value(&wire_req)
            .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("model");
            obj.remove("stream");
            obj.insert(
                "anthropic_version".to_string(),
                serde_json::Value::String(ANTHROPIC_VERSION.to_string()),
            );
        }
        let body = serde_json::to_vec(&value)
            .map_err(|e| ProviderError::Other(format!("failed to encode request: {e}")))?;

        let path = format!("/model/{}/invoke", deployment.provider_model);
        let headers = sign_request(
            "POST",
            &self.host(deployment),
            &path,
            &body,
            &self.access_key(deployment)?,
            api_key,
            self.session_token(deployment).as_deref(),
            self.region(deployment),
            OffsetDateTime::now_utc(),
        )?;

        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("https://{}{}", self.host(deployment), path),
            headers,
            body: Some(Bytes::from(body)),
            is_stream: false,
            timeout_ms: deployment.timeout_ms,
        })
    }

    fn transform_response(
        &self,
        _status: u16,
        _headers: &Headers,
        body: Bytes,
    ) -> ProviderResult<ModelResponse> {
        let resp: anthropic_wire::MessagesResponse = decode_json(&body)?;
        Ok(from_messages_response(resp))
    }
}

fn sha256_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> ProviderResult<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| ProviderError::Other(format!("hmac key error: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// SigV4 over the canonical request. Returns the full header set to send,
/// including `authorization`.
#[allow(clippy::too_many_arguments)]
fn sign_request(
    method: &str,
    host: &str,
    path: &str,
    body: &[u8],
    access_key: &str,
    secret_key: &str,
    session_token: Option<&str>,
    region: &str,
    now: OffsetDateTime,
) -> ProviderResult<Headers> {
    let amz_date = now
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .map_err(|e| ProviderError::Other(format!("time format error: {e}")))?;
    let date_stamp = now
        .format(format_description!("[year][month][day]"))
        .map_err(|e| ProviderError::Other(format!("time format error: {e}")))?;

    let payload_hash = hex::encode(sha256_hash(body));

    let mut signed: BTreeMap<&str, String> = BTreeMap::new();
    signed.insert("content-type", "application/json".to_string());
    signed.insert("host", host.to_string());
    signed.insert("x-amz-content-sha256", payload_hash.clone());
    signed.insert("x-amz-date", amz_date.clone());
    if let Some(token) = session_token {
        signed.insert("x-amz-security-token", token.to_string());
    }

    let signed_headers: Vec<&str> = signed.keys().copied().collect();
    let signed_headers_str = signed_headers.join(";");
    let mut canonical_headers = String::new();
    for (name, value) in &signed {
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(value.trim());
        canonical_headers.push('\n');
    }

    let canonical_request = format!(
        "{method}\n{path}\n\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
    );

    let algorithm = "AWS4-HMAC-SHA256";
    let credential_scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{algorithm}\n{amz_date}\n{credential_scope}\n{}",
        hex::encode(sha256_hash(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    let authorization = format!(
        "{algorithm} Credential={access_key}/{credential_scope}, SignedHeaders={signed_headers_str}, Signature={signature}"
    );

    let mut headers: Headers = signed
        .into_iter()
        .filter(|(name, _)| *name != "host")
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    headers.push(("authorization".to_string(), authorization));
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn signature_is_deterministic_for_fixed_inputs() {
        let now = datetime!(2024-01-15 12:30:45 UTC);
        let a = sign_request(
            "POST",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/model/anthropic.claude-3-5-sonnet-20240620-v1:0/invoke",
            br#"{"messages":[]}"#,
            "AKIAEXAMPLE",
            "secret",
            None,
            "us-east-1",
            now,
        )
        .unwrap();
        let b = sign_request(
            "POST",
            "bedrock-runtime.us-east-1.amazonaws.com",
            "/model/anthropic.claude-3-5-sonnet-20240620-v1:0/invoke",
            br#"{"messages":[]}"#,
            "AKIAEXAMPLE",
            "secret",
            None,
            "us-east-1",
            now,
        )
        .unwrap();
        assert_eq!(a, b);

        let auth = tianji_provider_core::header_get(&a, "authorization").unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20240115/us-east-1/bedrock/aws4_request"));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date"));
        assert_eq!(
            tianji_provider_core::header_get(&a, "x-amz-date"),
            Some("20240115T123045Z")
        );
    }

    #[test]
    fn signature_changes_with_secret() {
        let now = datetime!(2024-01-15 12:30:45 UTC);
        let sign = |secret: &str| {
            sign_request(
                "POST",
                "bedrock-runtime.us-east-1.amazonaws.com",
                "/model/m/invoke",
                b"{}",
                "AKIAEXAMPLE",
                secret,
                None,
                "us-east-1",
                now,
            )
            .unwrap()
        };
        let a = sign("secret-a");
        let b = sign("secret-b");
        assert_ne!(
            tianji_provider_core::header_get(&a, "authorization"),
            tianji_provider_core::header_get(&b, "authorization"),
        );
    }

    #[tokio::test]
    async fn streaming_is_rejected() {
        let deployment = Deployment {
            id: 0,
            model_name: "claude".into(),
            provider: "bedrock".into(),
            provider_model: "anthropic.claude-3-5-sonnet-20240620-v1:0".into(),
            api_key: None,
            api_base: None,
            weight: 1,
            priority: 0,
            tpm_limit: None,
            rpm_limit: None,
            timeout_ms: None,
            extra_params: serde_json::Map::new(),
        };
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "claude",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .unwrap();
        let err = BedrockProvider
            .transform_request(&req, &deployment, "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }
}
