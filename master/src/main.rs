use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{Credentials, JobReport, PrimeCountJob, Requirement, TaskRequirements};
use master::config::{DEFAULT_MAX_TASK_HOLDERS, DEFAULT_PORT};
use master::{discovery, CommandLauncher, Listeners, MasterConfig, Roster, Scheduler, WorkerLauncher};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "master")]
#[command(about = "Reparte un job entre los workers que se conecten")]
struct Cli {
    #[arg(long, env = "GRID_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Puerto de datos; el de comandos es el siguiente
    #[arg(long, env = "GRID_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "GRID_USERNAME", default_value = "grid")]
    username: String,

    #[arg(long, env = "GRID_PASSWORD", default_value = "grid", hide_env_values = true)]
    password: String,

    /// Perfiles de las máquinas donde se pueden lanzar workers (JSON)
    #[arg(long, env = "GRID_ROSTER")]
    roster: Option<PathBuf>,

    /// Programa que arranca un worker remoto
    #[arg(long, env = "GRID_LAUNCHER")]
    launcher: Option<PathBuf>,

    #[arg(long, env = "GRID_MAX_TASK_HOLDERS", default_value_t = DEFAULT_MAX_TASK_HOLDERS)]
    max_task_holders: usize,

    /// Dónde escribir el reporte final
    #[arg(long, env = "GRID_RESULTS")]
    results: Option<PathBuf>,

    #[arg(
        long,
        env = "GRID_EXIT_ON_RESULTS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    exit_on_results: bool,

    #[command(subcommand)]
    job: JobCommand,
}

#[derive(Subcommand)]
enum JobCommand {
    /// Cuenta los primos en [1, limit]
    Primes {
        #[arg(long)]
        limit: u64,

        /// En cuántos tramos se parte el rango
        #[arg(long, default_value_t = 8)]
        tasks: usize,

        #[arg(long)]
        timeout_secs: Option<u64>,

        #[arg(long)]
        min_memory_mb: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("master=debug,common=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let roster = match &cli.roster {
        Some(path) => Roster::load(path).await?,
        None => Roster::empty(),
    };
    let launcher: Option<Arc<dyn WorkerLauncher>> = cli
        .launcher
        .as_ref()
        .map(|program| Arc::new(CommandLauncher::new(program)) as Arc<dyn WorkerLauncher>);

    let listeners = Listeners::bind(cli.host, cli.port).await?;
    let port = listeners.port()?;
    info!("master escuchando en {}:{} (comandos en {})", cli.host, port, port + 1);

    let config = MasterConfig {
        host: cli.host,
        port,
        credentials: Credentials::new(cli.username.clone(), cli.password.clone()),
        roster: cli.roster.clone(),
        launcher: cli.launcher.clone(),
        ..MasterConfig::default()
    }
    .with_max_task_holders(cli.max_task_holders);

    let shutdown = CancellationToken::new();
    let sched = Scheduler::start(config, roster, launcher, shutdown.clone());
    discovery::spawn(sched.clone(), listeners, shutdown.clone());

    let job = match cli.job {
        JobCommand::Primes {
            limit,
            tasks,
            timeout_secs,
            min_memory_mb,
        } => {
            let mut job = PrimeCountJob::new(limit, tasks);
            if let Some(secs) = timeout_secs {
                job = job.with_timeout(Duration::from_secs(secs));
            }
            if let Some(mb) = min_memory_mb {
                job = job.with_requirements(
                    TaskRequirements::none().with(Requirement::MinMemoryMb { mb }),
                );
            }
            job
        }
    };
    let job_id = sched.add_job(Box::new(job));

    let mut reports = sched.reports();
    let finished = async {
        loop {
            if reports.borrow().iter().any(|r| r.job_id == job_id) {
                return;
            }
            if reports.changed().await.is_err() {
                return;
            }
        }
    };

    if cli.exit_on_results {
        tokio::select! {
            _ = finished => info!("job terminado"),
            _ = tokio::signal::ctrl_c() => warn!("interrumpido, cerrando"),
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("no se pudo esperar Ctrl-C")?;
        info!("cerrando");
    }

    let done = sched.reports().borrow().clone();
    for report in &done {
        info!(
            job = %report.job_id,
            "{}: {:?} ({} completadas, {} fallidas) resultado {:?}",
            report.name,
            report.state,
            report.completed_tasks,
            report.failed_tasks,
            report.result
        );
    }
    if let Some(path) = &cli.results {
        write_reports(path, &done).await?;
    }

    sched.shutdown().await;
    Ok(())
}

async fn write_reports(path: &Path, reports: &[JobReport]) -> Result<()> {
    let json = serde_json::to_string_pretty(reports).context("no se pudo serializar el reporte")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("no se pudo escribir {}", path.display()))?;
    info!("reporte escrito en {}", path.display());
    Ok(())
}
