// worker/src/system.rs

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use common::task::{CAP_CPUS, CAP_HOSTNAME, CAP_MEMORY_MB, CAP_OS};
use common::Capabilities;
use serde_json::json;
use sysinfo::{CpuExt, System, SystemExt};

/// Uso de CPU por debajo del cual la máquina cuenta como ociosa.
pub const IDLE_CPU_USAGE: f32 = 5.0;

/// Lo que el worker reporta al autorizarse.
pub fn capabilities() -> Capabilities {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let mut caps = Capabilities::new();
    caps.insert(CAP_OS.into(), json!(std::env::consts::OS));
    caps.insert(CAP_CPUS.into(), json!(sys.cpus().len().max(1)));
    // total_memory viene en bytes
    caps.insert(CAP_MEMORY_MB.into(), json!(sys.total_memory() / (1024 * 1024)));
    caps.insert(CAP_HOSTNAME.into(), json!(hostname));
    caps
}

/// Mide el uso global de CPU entre dos llamadas consecutivas.
pub struct IdleSampler {
    sys: System,
}

impl IdleSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self { sys }
    }

    /// `true` si la CPU estuvo más de 95% ociosa desde la muestra anterior.
    pub fn sample(&mut self) -> bool {
        self.sys.refresh_cpu();
        self.sys.global_cpu_info().cpu_usage() < IDLE_CPU_USAGE
    }
}

impl Default for IdleSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Muestras pendientes de mandar al master.
#[derive(Debug, Default)]
pub struct IdleLog {
    idle: VecDeque<DateTime<Utc>>,
    busy: VecDeque<DateTime<Utc>>,
}

impl IdleLog {
    /// Devuelve `true` cuando la muestra es la primera pendiente.
    pub fn record(&mut self, at: DateTime<Utc>, idle: bool) -> bool {
        let first = self.is_empty();
        if idle {
            self.idle.push_back(at);
        } else {
            self.busy.push_back(at);
        }
        first
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.busy.is_empty()
    }

    pub fn len(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    /// Vacía el log: primero las ociosas y después las ocupadas.
    pub fn drain(&mut self) -> Vec<(DateTime<Utc>, bool)> {
        let idle = self.idle.drain(..).map(|at| (at, true));
        let busy = self.busy.drain(..).map(|at| (at, false));
        idle.chain(busy).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn only_the_first_pending_sample_announces() {
        let mut log = IdleLog::default();
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();

        assert!(log.record(t(10), true));
        assert!(!log.record(t(20), false));
        assert!(!log.record(t(30), true));
        assert_eq!(log.len(), 3);

        let drained = log.drain();
        assert_eq!(drained, vec![(t(10), true), (t(30), true), (t(20), false)]);
        assert!(log.is_empty());
        assert!(log.record(t(40), false));
    }

    #[test]
    fn capabilities_cover_the_basic_keys() {
        let caps = capabilities();
        for key in [CAP_OS, CAP_CPUS, CAP_MEMORY_MB, CAP_HOSTNAME] {
            assert!(caps.contains_key(key), "falta {}", key);
        }
        assert!(caps[CAP_CPUS].as_u64().unwrap() >= 1);
    }
}
