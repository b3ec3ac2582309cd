// common/src/profile.rs

use std::sync::{Arc, Mutex};

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::Capabilities;

pub const DEFAULT_TUNNEL_PORT: u16 = 54321;
pub const MIN_TUNNEL_PORT: u16 = 49152;

/// Tramos de media hora en un día.
pub const BUCKETS: usize = 48;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("el puerto del túnel debe estar entre {MIN_TUNNEL_PORT} y 65535 (recibido {0})")]
pub struct InvalidTunnelPort(pub u16);

/// Perfil de una máquina conocida: a dónde lanzar el worker y cómo le fue
/// históricamente (fallos y ociosidad por franja horaria).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub hostname: String,
    #[serde(default = "default_tunnel_port")]
    tunnel_port: u16,
    #[serde(default)]
    pub num_tasks: u32,
    #[serde(default)]
    pub num_failed_tasks: u32,
    #[serde(default = "empty_buckets")]
    idle: Vec<u32>,
    #[serde(default = "empty_buckets")]
    not_idle: Vec<u32>,
    #[serde(default)]
    pub specs: Capabilities,
}

pub type SharedProfile = Arc<Mutex<ClientProfile>>;

fn default_tunnel_port() -> u16 {
    DEFAULT_TUNNEL_PORT
}

fn empty_buckets() -> Vec<u32> {
    vec![0; BUCKETS]
}

fn bucket<T: Timelike>(time: &T) -> usize {
    let idx = time.hour() as usize * 2 + usize::from(time.minute() >= 30);
    idx.min(BUCKETS - 1)
}

impl ClientProfile {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            tunnel_port: DEFAULT_TUNNEL_PORT,
            num_tasks: 0,
            num_failed_tasks: 0,
            idle: empty_buckets(),
            not_idle: empty_buckets(),
            specs: Capabilities::new(),
        }
    }

    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_port
    }

    pub fn set_tunnel_port(&mut self, port: u16) -> Result<(), InvalidTunnelPort> {
        if port < MIN_TUNNEL_PORT {
            return Err(InvalidTunnelPort(port));
        }
        self.tunnel_port = port;
        Ok(())
    }

    pub fn record_task(&mut self, failed: bool) {
        self.num_tasks += 1;
        if failed {
            self.num_failed_tasks += 1;
        }
    }

    pub fn fail_percentage(&self) -> u32 {
        if self.num_tasks == 0 {
            return 0;
        }
        (self.num_failed_tasks as f64 * 100.0 / self.num_tasks as f64) as u32
    }

    pub fn record_idle<T: Timelike>(&mut self, time: &T, idle: bool) {
        // perfiles viejos pueden venir con menos tramos
        self.idle.resize(BUCKETS, 0);
        self.not_idle.resize(BUCKETS, 0);
        let idx = bucket(time);
        if idle {
            self.idle[idx] += 1;
        } else {
            self.not_idle[idx] += 1;
        }
    }

    /// 100 si no hay datos para esa franja.
    pub fn idle_percentage<T: Timelike>(&self, time: &T) -> u32 {
        let idx = bucket(time);
        let idle = self.idle.get(idx).copied().unwrap_or(0);
        let busy = self.not_idle.get(idx).copied().unwrap_or(0);
        let total = idle + busy;
        if total == 0 {
            return 100;
        }
        (idle as f64 * 100.0 / total as f64) as u32
    }
}

/// Los `n` mejores candidatos: menor % de fallos y, a igualdad, mayor % de
/// ociosidad en la franja de `at`.
pub fn select_best<T: Timelike>(candidates: &[SharedProfile], at: &T, n: usize) -> Vec<SharedProfile> {
    let mut scored: Vec<(u32, u32, usize)> = candidates
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let p = crate::lock(p);
            (p.fail_percentage(), p.idle_percentage(at), i)
        })
        .collect();

    scored.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

    scored
        .into_iter()
        .take(n)
        .map(|(_, _, i)| candidates[i].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn shared(p: ClientProfile) -> SharedProfile {
        Arc::new(Mutex::new(p))
    }

    #[test]
    fn fail_percentage_is_zero_without_tasks() {
        let mut p = ClientProfile::new("h1");
        assert_eq!(p.fail_percentage(), 0);
        p.record_task(false);
        p.record_task(true);
        p.record_task(false);
        p.record_task(false);
        assert_eq!(p.fail_percentage(), 25);
    }

    #[test]
    fn idle_percentage_uses_half_hour_buckets() {
        let mut p = ClientProfile::new("h1");
        assert_eq!(p.idle_percentage(&at(10, 5)), 100);

        p.record_idle(&at(10, 5), true);
        p.record_idle(&at(10, 20), false);
        p.record_idle(&at(10, 29), false);
        p.record_idle(&at(10, 45), true);

        assert_eq!(p.idle_percentage(&at(10, 0)), 33);
        assert_eq!(p.idle_percentage(&at(10, 30)), 100);
        assert_eq!(p.idle_percentage(&at(11, 0)), 100);
    }

    #[test]
    fn tunnel_port_must_be_private() {
        let mut p = ClientProfile::new("h1");
        assert_eq!(p.tunnel_port(), DEFAULT_TUNNEL_PORT);
        assert_eq!(p.set_tunnel_port(22), Err(InvalidTunnelPort(22)));
        assert_eq!(p.tunnel_port(), DEFAULT_TUNNEL_PORT);
        assert!(p.set_tunnel_port(60000).is_ok());
        assert_eq!(p.tunnel_port(), 60000);
    }

    #[test]
    fn best_candidates_prefer_reliable_then_idle() {
        let mut flaky = ClientProfile::new("flaky");
        flaky.record_task(true);

        let mut busy = ClientProfile::new("busy");
        busy.record_idle(&at(9, 0), false);

        let idle = ClientProfile::new("idle");

        let all = vec![shared(flaky), shared(busy), shared(idle)];
        let best = select_best(&all, &at(9, 10), 2);
        let names: Vec<String> = best
            .iter()
            .map(|p| p.lock().unwrap().hostname.clone())
            .collect();
        assert_eq!(names, vec!["idle".to_string(), "busy".to_string()]);
    }

    #[test]
    fn profiles_load_with_defaults() {
        let p: ClientProfile =
            serde_json::from_str(r#"{"hostname":"nodo7","specs":{"gpu":true}}"#).unwrap();
        assert_eq!(p.tunnel_port(), DEFAULT_TUNNEL_PORT);
        assert_eq!(p.idle_percentage(&at(3, 0)), 100);
        assert_eq!(p.specs.get("gpu"), Some(&serde_json::json!(true)));
    }
}
