use clap::Parser;

#[derive(Parser)]
#[command(name = "tianji", about = "multi-provider LLM gateway")]
pub(crate) struct Cli {
    /// Path to the model-list YAML config.
    #[arg(long, env = "TIANJI_CONFIG", default_value = "config.yaml")]
    pub(crate) config: String,
    #[arg(long, env = "TIANJI_HOST", default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, env = "TIANJI_PORT", default_value_t = 4000)]
    pub(crate) port: u16,
    /// sqlite/postgres url for spend logs and prompt templates; the
    /// in-memory store is used when absent.
    #[arg(long, env = "DATABASE_URL")]
    pub(crate) database_url: Option<String>,
}
