// master/src/correlation.rs

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use common::{lock, random_key, Channel, ChannelEvents, SharedProfile};
use tokio::sync::oneshot;
use tracing::debug;

/// Canal de comandos ya aceptado, con su receptor de eventos.
pub struct CommandLink {
    pub channel: Channel,
    pub events: ChannelEvents,
}

struct Launched {
    secret: u32,
    profile: SharedProfile,
    at: Instant,
}

struct Waiting {
    tx: oneshot::Sender<CommandLink>,
    at: Instant,
}

/// Tabla de correlación por clave aleatoria:
/// - workers lanzados por nosotros (clave -> secreto + perfil)
/// - recursos esperando su canal de comandos (clave -> oneshot)
///
/// Las entradas vencen a los `ttl` y se quitan al reclamarlas.
pub struct CorrelationTable {
    ttl: Duration,
    launched: Mutex<HashMap<u32, Launched>>,
    waiting: Mutex<HashMap<u32, Waiting>>,
}

impl CorrelationTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            launched: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    fn prune(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        lock(&self.launched).retain(|key, e| {
            let keep = now.duration_since(e.at) < ttl;
            if !keep {
                debug!(key, "clave de lanzamiento vencida");
            }
            keep
        });
        lock(&self.waiting).retain(|key, e| {
            let keep = now.duration_since(e.at) < ttl && !e.tx.is_closed();
            if !keep {
                debug!(key, "espera de canal de comandos vencida");
            }
            keep
        });
    }

    /// Registra un worker que vamos a lanzar. Devuelve (clave, secreto).
    pub fn register_launch(&self, profile: SharedProfile) -> (u32, u32) {
        self.prune();
        let mut launched = lock(&self.launched);
        let key = loop {
            let k = random_key();
            if !launched.contains_key(&k) && !lock(&self.waiting).contains_key(&k) {
                break k;
            }
        };
        let secret = random_key();
        launched.insert(
            key,
            Launched {
                secret,
                profile,
                at: Instant::now(),
            },
        );
        (key, secret)
    }

    /// Perfil del worker lanzado con esa clave, si el secreto coincide.
    pub fn claim_launch(&self, key: u32, secret: u32) -> Option<SharedProfile> {
        self.prune();
        let mut launched = lock(&self.launched);
        match launched.get(&key) {
            Some(e) if e.secret == secret => launched.remove(&key).map(|e| e.profile),
            _ => None,
        }
    }

    pub fn expect_command_channel(&self, key: u32) -> oneshot::Receiver<CommandLink> {
        self.prune();
        let (tx, rx) = oneshot::channel();
        lock(&self.waiting).insert(
            key,
            Waiting {
                tx,
                at: Instant::now(),
            },
        );
        rx
    }

    /// Entrega el canal al recurso que lo espera. Si nadie lo espera se
    /// devuelve el enlace para que quien llama lo cierre.
    pub fn deliver(&self, key: u32, link: CommandLink) -> Result<(), CommandLink> {
        self.prune();
        let entry = lock(&self.waiting).remove(&key);
        match entry {
            Some(w) => w.tx.send(link),
            None => Err(link),
        }
    }

    /// El lanzamiento no llegó a hacerse: la clave ya no sirve.
    pub fn cancel_launch(&self, key: u32) -> bool {
        lock(&self.launched).remove(&key).is_some()
    }

    pub fn forget(&self, key: u32) {
        lock(&self.waiting).remove(&key);
    }

    pub fn pending_launches(&self) -> usize {
        self.prune();
        lock(&self.launched).len()
    }

    pub fn pending_channels(&self) -> usize {
        self.prune();
        lock(&self.waiting).len()
    }
}
