// worker/src/config.rs

use std::path::PathBuf;
use std::time::Duration;

use common::{random_key, ChannelConfig, Credentials};

pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Host del master; el canal de comandos va a `port + 1`.
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    /// Clave para correlacionar los dos canales. Si el master lanzó este
    /// worker, la clave y el secreto son los que él registró.
    pub key: u32,
    pub secret: u32,
    pub work_dir: PathBuf,
    pub idle_interval: Duration,
    pub channel: ChannelConfig,
    /// Reconexiones tras un fallo de autorización o de conexión.
    pub retries: u32,
}

impl WorkerConfig {
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            key: random_key(),
            secret: random_key(),
            work_dir: PathBuf::from("."),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            channel: ChannelConfig::default(),
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_key(mut self, key: u32, secret: u32) -> Self {
        if key != 0 {
            self.key = key;
        }
        self.secret = secret;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn command_port(&self) -> u16 {
        self.port.wrapping_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_key_keeps_the_random_one() {
        let cfg = WorkerConfig::new("localhost", 54320, Credentials::new("a", "b"));
        let random = cfg.key;
        assert_ne!(random, 0);

        let cfg = cfg.with_key(0, 9);
        assert_eq!(cfg.key, random);
        assert_eq!(cfg.secret, 9);

        let cfg = cfg.with_key(1234, 5);
        assert_eq!((cfg.key, cfg.secret), (1234, 5));
        assert_eq!(cfg.command_port(), 54321);
    }
}
