use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

mod cli;

use tianji_common::GeneralSettings;
use tianji_core::{AppState, RateLimitStore, UpstreamClientConfig, WreqUpstreamClient};
use tianji_provider_core::{GatewayConfig, ModelTable};
use tianji_provider_impl::build_registry;
use tianji_router::app_router;
use tianji_storage::{MemoryStorage, Storage};

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("tianji failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = GatewayConfig::from_file(Path::new(&cli.config))
        .with_context(|| format!("loading config from {}", cli.config))?;

    let registry = build_registry();
    let table = ModelTable::from_config(&config, &registry.names())
        .context("building deployment table")?;
    info!(
        groups = table.group_names().len(),
        providers = registry.names().len(),
        "deployment table ready"
    );

    let storage = make_storage(&cli).await?;

    let client_config = UpstreamClientConfig {
        stream_idle_timeout: Duration::from_millis(
            config
                .general_settings
                .stream_idle_timeout_ms
                .unwrap_or(GeneralSettings::DEFAULT_STREAM_IDLE_TIMEOUT_MS),
        ),
        ..UpstreamClientConfig::default()
    };
    let client = WreqUpstreamClient::new(client_config).context("building upstream client")?;

    let state = Arc::new(AppState {
        registry,
        table,
        router: tianji_core::Router::new(),
        ratelimit: RateLimitStore::new(),
        storage,
        client: Arc::new(client),
        general: config.general_settings.clone(),
        router_settings: config.router_settings.clone(),
    });

    let app = app_router(state);
    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve loop")?;

    Ok(())
}

async fn make_storage(cli: &Cli) -> anyhow::Result<Arc<dyn Storage>> {
    #[cfg(feature = "storage-db")]
    if let Some(url) = cli.database_url.as_deref() {
        let db = tianji_storage::db::DbStorage::connect(url)
            .await
            .context("connecting to database")?;
        db.sync().await.context("syncing database schema")?;
        info!("database storage ready");
        return Ok(Arc::new(db));
    }

    #[cfg(not(feature = "storage-db"))]
    if cli.database_url.is_some() {
        anyhow::bail!("--database-url requires the storage-db feature");
    }

    info!("using in-memory storage");
    Ok(Arc::new(MemoryStorage::new()))
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tianji=info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
