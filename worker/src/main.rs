use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use common::Credentials;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use worker::config::{DEFAULT_RETRIES, WorkerConfig};

#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "Se conecta a un master y ejecuta las tareas que le asigna")]
struct Cli {
    #[arg(long, env = "GRID_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "GRID_PORT", default_value_t = 54320)]
    port: u16,

    #[arg(long, env = "GRID_USERNAME", default_value = "grid")]
    username: String,

    #[arg(long, env = "GRID_PASSWORD", default_value = "grid", hide_env_values = true)]
    password: String,

    /// Clave para correlacionar los canales (la genera el master al lanzarnos)
    #[arg(long, env = "GRID_KEY")]
    key: Option<u32>,

    #[arg(long, env = "GRID_SECRET")]
    secret: Option<u32>,

    /// Donde se guardan los archivos que manda el master
    #[arg(long, env = "GRID_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    #[arg(long, env = "GRID_IDLE_INTERVAL_SECS", default_value_t = 60)]
    idle_interval_secs: u64,

    #[arg(long, env = "GRID_RETRIES", default_value_t = DEFAULT_RETRIES)]
    retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::fs::create_dir_all(&cli.work_dir)
        .await
        .with_context(|| format!("no se pudo crear {}", cli.work_dir.display()))?;

    let mut config = WorkerConfig::new(
        cli.host.clone(),
        cli.port,
        Credentials::new(cli.username, cli.password),
    )
    .with_work_dir(cli.work_dir)
    .with_idle_interval(Duration::from_secs(cli.idle_interval_secs.max(1)))
    .with_retries(cli.retries);
    if let Some(key) = cli.key {
        config = config.with_key(key, cli.secret.unwrap_or(0));
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrumpido, avisando al master");
            on_signal.cancel();
        }
    });

    info!("worker contra {}:{}", cli.host, cli.port);
    worker::run(config, shutdown)
        .await
        .context("el worker terminó con error")?;
    Ok(())
}
