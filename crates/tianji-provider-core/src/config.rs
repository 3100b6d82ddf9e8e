//! Model config: the YAML file format and the in-memory deployment table.
//!
//! Loaded once at startup and read-only afterwards. Every logical model name
//! maps to one or more deployments; deployments sharing a name form a group
//! the router picks from.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use tianji_common::{GeneralSettings, RouterSettings};

use crate::registry::parse_model_name;

const ENV_PREFIX: &str = "os.environ/";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("model_list is empty")]
    EmptyModelList,
    #[error("model_list entry {index} ({model_name}): {message}")]
    InvalidEntry {
        index: usize,
        model_name: String,
        message: String,
    },
    #[error("model_list entry {index} ({model_name}): unknown provider {provider}")]
    UnknownProvider {
        index: usize,
        model_name: String,
        provider: String,
    },
}

/// One concrete upstream target for a logical model. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    /// Stable id used to key router health state.
    pub id: u64,
    /// Client-facing logical name.
    pub model_name: String,
    /// Registry key of the adapter.
    pub provider: String,
    /// Vendor-side model identifier.
    pub provider_model: String,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub weight: u32,
    /// Lower value wins.
    pub priority: i32,
    pub tpm_limit: Option<u64>,
    pub rpm_limit: Option<u64>,
    pub timeout_ms: Option<u64>,
    /// Provider-specific knobs (azure deployment id, vertex project, aws
    /// region and credentials, ...).
    pub extra_params: JsonMap<String, JsonValue>,
}

impl Deployment {
    /// Rate-limit store key for this deployment.
    pub fn ratelimit_key(&self) -> String {
        format!("{}/{}", self.provider, self.provider_model)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.extra_params.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelListEntry {
    pub model_name: String,
    pub tianji_params: TianjiParams,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TianjiParams {
    /// `provider/model`; a bare model name resolves to the `openai` adapter.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub model_list: Vec<ModelListEntry>,
    #[serde(default)]
    pub general_settings: GeneralSettings,
    #[serde(default)]
    pub router_settings: RouterSettings,
}

impl GatewayConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }
}

/// Logical model -> deployment group. Case-sensitive lookups.
#[derive(Debug, Default)]
pub struct ModelTable {
    groups: HashMap<String, Vec<Arc<Deployment>>>,
}

impl ModelTable {
    /// Build the table, resolving `os.environ/NAME` indirections and
    /// validating every entry against the set of registered providers.
    pub fn from_config(
        config: &GatewayConfig,
        registered: &[String],
    ) -> Result<Self, ConfigError> {
        if config.model_list.is_empty() {
            return Err(ConfigError::EmptyModelList);
        }

        let mut groups: HashMap<String, Vec<Arc<Deployment>>> = HashMap::new();
        for (index, entry) in config.model_list.iter().enumerate() {
            if entry.model_name.is_empty() {
                return Err(ConfigError::InvalidEntry {
                    index,
                    model_name: entry.model_name.clone(),
                    message: "model_name is empty".to_string(),
                });
            }
            let params = &entry.tianji_params;
            let (provider, provider_model) = parse_model_name(&params.model);
            let provider = if provider.is_empty() { "openai" } else { provider };
            if provider_model.is_empty() {
                return Err(ConfigError::InvalidEntry {
                    index,
                    model_name: entry.model_name.clone(),
                    message: "tianji_params.model has no model part".to_string(),
                });
            }
            if !registered.iter().any(|name| name == provider) {
                return Err(ConfigError::UnknownProvider {
                    index,
                    model_name: entry.model_name.clone(),
                    provider: provider.to_string(),
                });
            }

            let deployment = Deployment {
                id: index as u64,
                model_name: entry.model_name.clone(),
                provider: provider.to_string(),
                provider_model: provider_model.to_string(),
                api_key: params.api_key.as_deref().and_then(resolve_env_value),
                api_base: params.api_base.as_deref().and_then(resolve_env_value),
                weight: params.weight.unwrap_or(1).max(1),
                priority: params.priority.unwrap_or(0),
                tpm_limit: params.tpm_limit,
                rpm_limit: params.rpm_limit,
                timeout_ms: params.timeout_ms,
                extra_params: resolve_env_map(params.extra.clone()),
            };
            groups
                .entry(entry.model_name.clone())
                .or_default()
                .push(Arc::new(deployment));
        }

        Ok(Self { groups })
    }

    pub fn find_deployments(&self, logical_name: &str) -> &[Arc<Deployment>] {
        self.groups
            .get(logical_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find_exact(&self, name: &str) -> Option<Arc<Deployment>> {
        self.groups
            .get(name)
            .and_then(|group| group.first())
            .cloned()
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.groups.keys().cloned().collect();
        out.sort();
        out
    }
}

/// `os.environ/NAME` resolves through the process environment; an unset
/// variable yields `None` so key resolution can keep falling back.
fn resolve_env_value(value: &str) -> Option<String> {
    match value.strip_prefix(ENV_PREFIX) {
        Some(var) => std::env::var(var).ok(),
        None => Some(value.to_string()),
    }
}

fn resolve_env_map(map: JsonMap<String, JsonValue>) -> JsonMap<String, JsonValue> {
    map.into_iter()
        .map(|(k, v)| match v {
            JsonValue::String(s) => {
                let resolved = resolve_env_value(&s)
                    .map(JsonValue::String)
                    .unwrap_or(JsonValue::Null);
                (k, resolved)
            }
            other => (k, other),
        })
        .collect()
}
