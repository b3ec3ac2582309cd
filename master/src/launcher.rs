// master/src/launcher.rs

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use common::{lock, select_best};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;

/// Datos para arrancar un worker en una máquina del roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub hostname: String,
    pub master_port: u16,
    pub tunnel_port: u16,
    pub key: u32,
    pub secret: u32,
}

/// Cómo se lanza un worker remoto.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> anyhow::Result<()>;
}

/// Corre `program <hostname> <port> <tunnel_port> <key> <secret>`.
pub struct CommandLauncher {
    program: PathBuf,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, request: LaunchRequest) -> anyhow::Result<()> {
        let mut child = Command::new(&self.program)
            .arg(&request.hostname)
            .arg(request.master_port.to_string())
            .arg(request.tunnel_port.to_string())
            .arg(request.key.to_string())
            .arg(request.secret.to_string())
            .spawn()
            .with_context(|| format!("no se pudo ejecutar {}", self.program.display()))?;

        let hostname = request.hostname;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(host = %hostname, "lanzador terminó: {}", status),
                Err(e) => warn!(host = %hostname, "error esperando al lanzador: {}", e),
            }
        });
        Ok(())
    }
}

/// Workers a lanzar: 1.25 × (pendientes + reasignaciones) menos los listos.
pub fn clients_needed(remaining: usize, reassign: usize, ready: usize) -> usize {
    let wanted = ((remaining + reassign) as f64 * 1.25).ceil() as usize;
    wanted.saturating_sub(ready)
}

/// Lanza workers en los mejores perfiles libres del roster. Cada uno recibe
/// una clave y un secreto para que el master le asocie el perfil.
pub async fn search_clients(sched: &Scheduler) -> usize {
    let Some(launcher) = sched.launcher() else {
        return 0;
    };

    let (remaining, reassign) = sched.state.outstanding();
    let needed = clients_needed(remaining, reassign, sched.ready_ids().len());
    if needed == 0 {
        return 0;
    }

    let candidates = sched.roster().available();
    let best = select_best(&candidates, &Local::now(), needed);
    debug!("se buscan {} workers, hay {} candidatos", needed, candidates.len());

    let mut launched = 0;
    for profile in best {
        let (hostname, tunnel_port) = {
            let p = lock(&profile);
            (p.hostname.clone(), p.tunnel_port())
        };
        if !sched.roster().mark_in_use(&hostname) {
            continue;
        }

        let (key, secret) = sched.correlation().register_launch(profile.clone());
        let request = LaunchRequest {
            hostname: hostname.clone(),
            master_port: sched.config().port,
            tunnel_port,
            key,
            secret,
        };

        match launcher.launch(request).await {
            Ok(()) => {
                info!(host = %hostname, "worker lanzado");
                launched += 1;
            }
            Err(e) => {
                warn!(host = %hostname, "no se pudo lanzar el worker: {:#}", e);
                sched.correlation().cancel_launch(key);
                sched.roster().release(&hostname);
            }
        }
    }
    launched
}
