//! `fabricd` entrypoint: loads configuration, opens the database, wires
//! the runtime, registers tool sets, and runs until interrupted.

use anyhow::Context;
use clap::Parser;
use fabricd::config::RuntimeConfig;
use fabricd::runtime::Runtime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// `fabricd` runs the personal-assistant backend: event bus, work queue,
/// tool registry, memory engine, planner loop, scheduler and supervisor.
#[derive(Debug, Parser)]
#[command(name = "fabricd", version, about)]
struct Cli {
    /// Path to a TOML config file; overrides `RUNTIME_CONFIG_PATH`.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("RUNTIME_CONFIG_PATH", path);
    }

    let config = RuntimeConfig::load().context("failed to load configuration")?;
    let _log_guard = init_logging(&config)?;

    tracing::info!(db_path = %config.store.db_path.display(), "starting fabricd");

    let db = fabricd::db::open(&config.store.db_path).await.context("failed to open database")?;
    let runtime = Runtime::build(&config, db);
    register_default_tools(&runtime).await?;
    runtime.start(&config).await.context("failed to start runtime")?;

    tracing::info!("fabricd is running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    Ok(())
}

async fn register_default_tools(runtime: &Runtime) -> anyhow::Result<()> {
    runtime
        .tools
        .register(fabricd::tools::ToolSet::System(Box::new(PingTool)))
        .await
        .context("failed to register built-in tool set")?;
    Ok(())
}

struct PingTool;

#[async_trait::async_trait]
impl fabricd::tools::ToolSetCore for PingTool {
    fn id(&self) -> &str {
        "system.ping"
    }

    fn name(&self) -> &str {
        "System"
    }

    async fn list_tools(&self) -> Vec<fabricd::types::ToolDescriptor> {
        vec![fabricd::types::ToolDescriptor {
            name: "ping".to_owned(),
            description: "Replies pong; used to verify the tool pipeline is wired end to end.".to_owned(),
            short_description: "Health check tool".to_owned(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
            examples: vec![serde_json::json!({"args": {}})],
        }]
    }

    async fn call_tool(
        &self,
        _name: &str,
        _args: serde_json::Value,
        _ctx: &fabricd::types::ToolContext,
    ) -> anyhow::Result<fabricd::types::ToolResult> {
        Ok(fabricd::types::ToolResult::success(serde_json::json!({ "pong": true })))
    }

    async fn check_health(&self) -> fabricd::types::HealthStatus {
        fabricd::types::HealthStatus::ok(chrono::Utc::now())
    }
}

fn init_logging(config: &RuntimeConfig) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir).context("failed to create log directory")?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "fabricd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer();
    let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);

    Registry::default().with(filter).with(stdout_layer).with(file_layer).init();

    Ok(guard)
}
