// worker/src/execution.rs

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::primes::count_primes;
use common::{RemoteDirectory, Task, Work};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cómo terminó una tarea en este worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    /// Se canceló con `force_quit`.
    Terminated,
    /// Falla interna de la tarea.
    Troubled(String),
}

/// Corre la carga de trabajo de la tarea hasta que termina o se cancela.
pub async fn execute(task: &Task, work_dir: &Path, cancel: CancellationToken) -> Outcome {
    if cancel.is_cancelled() {
        return Outcome::Terminated;
    }
    match &task.work {
        Work::CountPrimes { low, high } => count(*low, *high, cancel).await,
        Work::Sum { operands } => Outcome::Completed(json!(operands.iter().sum::<u64>())),
        Work::Exec {
            program,
            directory,
            args,
        } => exec(work_dir, program, *directory, args, cancel).await,
        Work::Sleep { millis, value } => {
            tokio::select! {
                _ = cancel.cancelled() => Outcome::Terminated,
                _ = tokio::time::sleep(Duration::from_millis(*millis)) => {
                    Outcome::Completed(value.clone())
                }
            }
        }
    }
}

async fn count(low: u64, high: u64, cancel: CancellationToken) -> Outcome {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let counting = tokio::task::spawn_blocking(move || count_primes(low, high, &flag));

    let watcher = {
        let stop = stop.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            stop.store(true, Ordering::Relaxed);
        })
    };

    let counted = counting.await;
    watcher.abort();

    match counted {
        Ok(Some(n)) => Outcome::Completed(json!(n)),
        Ok(None) => Outcome::Terminated,
        Err(e) => Outcome::Troubled(format!("el conteo falló: {}", e)),
    }
}

async fn exec(
    work_dir: &Path,
    program: &str,
    directory: RemoteDirectory,
    args: &[String],
    cancel: CancellationToken,
) -> Outcome {
    if program.is_empty() || program.contains('/') || program.contains('\\') || program.contains("..") {
        return Outcome::Troubled(format!("programa inválido: {}", program));
    }
    let path = directory.resolve(work_dir).join(program);

    let child = Command::new(&path)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => return Outcome::Troubled(format!("no se pudo ejecutar {}: {}", path.display(), e)),
    };

    // al soltar el futuro el proceso muere (kill_on_drop)
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("matando {}", path.display());
            return Outcome::Terminated;
        }
        output = child.wait_with_output() => output,
    };

    match output {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let value = serde_json::from_str(&stdout).unwrap_or(Value::String(stdout));
            Outcome::Completed(value)
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            warn!("{} terminó con {}: {}", program, out.status, stderr.trim());
            Outcome::Troubled(format!("{} terminó con {}", program, out.status))
        }
        Err(e) => Outcome::Troubled(format!("error esperando a {}: {}", program, e)),
    }
}
