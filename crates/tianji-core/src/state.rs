//! Process-wide shared state, assembled once at startup.

use std::sync::Arc;

use tianji_common::{GeneralSettings, RouterSettings};
use tianji_provider_core::{ModelTable, ProviderRegistry};
use tianji_storage::Storage;

use crate::ratelimit::RateLimitStore;
use crate::router::Router;
use crate::upstream_client::UpstreamClient;

pub struct AppState {
    pub registry: ProviderRegistry,
    pub table: ModelTable,
    pub router: Router,
    pub ratelimit: RateLimitStore,
    pub storage: Arc<dyn Storage>,
    pub client: Arc<dyn UpstreamClient>,
    pub general: GeneralSettings,
    pub router_settings: RouterSettings,
}

impl AppState {
    pub fn completion_timeout_ms(&self) -> u64 {
        self.general
            .completion_timeout_ms
            .unwrap_or(GeneralSettings::DEFAULT_COMPLETION_TIMEOUT_MS)
    }

    pub fn auxiliary_timeout_ms(&self) -> u64 {
        self.general
            .auxiliary_timeout_ms
            .unwrap_or(GeneralSettings::DEFAULT_AUXILIARY_TIMEOUT_MS)
    }
}
