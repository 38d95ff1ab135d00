use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use heimdall_gateway::gateway::http::{GatewayHttpState, serve};
use heimdall_gateway::gateway::otel::init_tracing;
use heimdall_gateway::gateway::scheduler::Job;
use heimdall_gateway::gateway::{Env, SqliteStore};
use heimdall_gateway::{GatewayConfig, Heimdall};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "heimdall-gateway")]
#[command(version, about = "LLM API gateway: admission, billing, governance and telemetry")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Config file (.toml, .json, or .yaml with gateway-config-yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Dotenv file consulted before the process environment
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
    /// OTLP/HTTP endpoint (needs gateway-otel)
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway and the background jobs
    Serve {
        /// Listen address override
        #[arg(long)]
        listen: Option<String>,
        /// Admin API token override
        #[arg(long)]
        admin_token: Option<String>,
    },
    /// Create or upgrade the SQLite schema and exit
    Migrate,
    /// Run one scheduler job once and print its report
    RunJob {
        /// cycle-reset, ttl-cleanup, baseline-refresh or anomaly-sweep
        name: String,
    },
}

fn load_config(common: &CommonArgs) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let env = match common.dotenv.as_ref() {
        Some(path) => Env::load_dotenv(path)?,
        None => Env::default(),
    };
    let mut config = match common.config.as_ref() {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env(&env);
    if common.json_logs {
        config.json_logs = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.common)?;
    let _tracing = init_tracing(
        "heimdall-gateway",
        cli.common.otel_endpoint.as_deref(),
        config.json_logs,
    )
    .map_err(|err| err.to_string())?;

    match cli.command {
        Command::Migrate => {
            let store = SqliteStore::new(&config.database_path);
            store.init().await?;
            tracing::info!(database = %config.database_path.display(), "schema ready");
        }
        Command::RunJob { name } => {
            let job = Job::parse(&name).ok_or_else(|| format!("unknown job: {name}"))?;
            let heimdall = Heimdall::builder(config).build().await?;
            let report = heimdall
                .scheduler()
                .run_job(job, &CancellationToken::new())
                .await?;
            heimdall.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve {
            listen,
            admin_token,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(token) = admin_token {
                config.admin_token = Some(token);
            }
            let listener = tokio::net::TcpListener::bind(&config.listen).await?;
            let heimdall = Arc::new(Heimdall::builder(config).build().await?);

            let shutdown = CancellationToken::new();
            let background = heimdall.start_background(shutdown.clone());
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received");
                }
                signal.cancel();
            });

            serve(GatewayHttpState::new(heimdall.clone()), listener, shutdown.clone()).await?;
            shutdown.cancel();
            for task in background {
                if let Err(err) = task.await {
                    tracing::warn!(error = %err, "background task ended abnormally");
                }
            }
            heimdall.shutdown().await;
        }
    }
    Ok(())
}
