// master/src/config.rs

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use common::transfer::ReplyWait;
use common::Credentials;

pub const DEFAULT_PORT: u16 = 54320;
pub const DEFAULT_MAX_TASK_HOLDERS: usize = 2;
pub const PENDING_KEY_TTL: Duration = Duration::from_secs(60);

/// Esperas del lado master de un recurso.
#[derive(Debug, Clone, Copy)]
pub struct ResourceTiming {
    /// Espera de credenciales tras `request_credentials`.
    pub credentials: ReplyWait,
    /// Cuánto esperar a que el worker abra el canal de comandos.
    pub command_channel: Duration,
    /// Respuestas del receptor durante la transferencia de archivos.
    pub transfer: ReplyWait,
}

impl Default for ResourceTiming {
    fn default() -> Self {
        Self {
            credentials: ReplyWait {
                interval: Duration::from_secs(2),
                attempts: 3,
            },
            command_channel: Duration::from_secs(10),
            transfer: ReplyWait::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: IpAddr,
    /// Puerto de datos; el de comandos es `port + 1`.
    pub port: u16,
    pub credentials: Credentials,
    pub roster: Option<PathBuf>,
    pub launcher: Option<PathBuf>,
    /// Máximo de recursos corriendo la misma tarea a la vez.
    pub max_task_holders: usize,
    pub pending_key_ttl: Duration,
    pub timing: ResourceTiming,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            credentials: Credentials::new("grid", "grid"),
            roster: None,
            launcher: None,
            max_task_holders: DEFAULT_MAX_TASK_HOLDERS,
            pending_key_ttl: PENDING_KEY_TTL,
            timing: ResourceTiming::default(),
        }
    }
}

impl MasterConfig {
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_max_task_holders(mut self, holders: usize) -> Self {
        self.max_task_holders = holders.max(1);
        self
    }

    pub fn with_timing(mut self, timing: ResourceTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_pending_key_ttl(mut self, ttl: Duration) -> Self {
        self.pending_key_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_task_holders, 2);
        assert_eq!(cfg.timing.credentials.attempts, 3);
        assert_eq!(cfg.timing.credentials.interval, Duration::from_secs(2));
    }

    #[test]
    fn holder_cap_never_drops_below_one() {
        let cfg = MasterConfig::default().with_max_task_holders(0);
        assert_eq!(cfg.max_task_holders, 1);
    }
}
