// master/src/discovery.rs

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use common::{Channel, ChannelConfig, ChannelEvent, ChannelEvents, ChannelState, Message, Payload};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlation::CommandLink;
use crate::scheduler::Scheduler;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);
const EPHEMERAL_ATTEMPTS: usize = 20;

/// Los dos puertos del master: datos en `port` y comandos en `port + 1`.
pub struct Listeners {
    pub data: TcpListener,
    pub command: TcpListener,
}

impl Listeners {
    /// Con `port == 0` se busca un par libre de puertos consecutivos.
    pub async fn bind(host: IpAddr, port: u16) -> anyhow::Result<Self> {
        if port != 0 {
            let data = TcpListener::bind((host, port))
                .await
                .with_context(|| format!("no se pudo escuchar en {}:{}", host, port))?;
            let command = TcpListener::bind((host, port.wrapping_add(1)))
                .await
                .with_context(|| format!("no se pudo escuchar en {}:{}", host, port + 1))?;
            return Ok(Self { data, command });
        }

        for _ in 0..EPHEMERAL_ATTEMPTS {
            let data = TcpListener::bind((host, 0)).await?;
            let data_port = data.local_addr()?.port();
            if data_port == u16::MAX {
                continue;
            }
            if let Ok(command) = TcpListener::bind((host, data_port + 1)).await {
                return Ok(Self { data, command });
            }
        }
        anyhow::bail!("no hay dos puertos consecutivos libres en {}", host)
    }

    pub fn data_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.data.local_addr()?)
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.data_addr()?.port())
    }
}

/// Acepta conexiones en ambos puertos hasta `shutdown`.
pub fn spawn(sched: Scheduler, listeners: Listeners, shutdown: CancellationToken) {
    let Listeners { data, command } = listeners;
    tokio::spawn(data_loop(sched.clone(), data, shutdown.clone()));
    tokio::spawn(command_loop(sched, command, shutdown));
}

async fn data_loop(sched: Scheduler, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let (channel, events) = Channel::new(ChannelConfig::default());
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = channel.accept_from(&listener) => accepted,
        };

        match accepted {
            Ok(_) => {
                let handle = sched.add_resource(channel, events);
                info!(resource = handle.id(), peer = ?handle.peer(), "nueva conexión de datos");
            }
            Err(e) => {
                warn!("error aceptando conexión de datos: {}", e);
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("discovery de datos terminado");
}

async fn command_loop(sched: Scheduler, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let (channel, events) = Channel::new(ChannelConfig::default());
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = channel.accept_from(&listener) => accepted,
        };

        match accepted {
            Ok(_) => {
                tokio::spawn(correlate(sched.clone(), channel, events));
            }
            Err(e) => {
                warn!("error aceptando conexión de comandos: {}", e);
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("discovery de comandos terminado");
}

/// Lee la clave que manda el worker y le entrega el canal a su recurso.
async fn correlate(sched: Scheduler, channel: Channel, mut events: ChannelEvents) {
    let wait = sched.config().timing.command_channel;
    let key = timeout(wait, async {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message(Message::Payload(Payload::ClientKey { key, .. })) => {
                    return Some(key)
                }
                ChannelEvent::StateChanged(ChannelState::CommunicationError) => return None,
                _ => continue,
            }
        }
        None
    })
    .await;

    match key {
        Ok(Some(key)) => {
            let link = CommandLink { channel, events };
            match sched.correlation().deliver(key, link) {
                Ok(()) => debug!(key, "canal de comandos correlacionado"),
                Err(link) => {
                    warn!(key, "nadie espera un canal de comandos con esa clave");
                    link.channel.close().await;
                }
            }
        }
        _ => {
            warn!(peer = ?channel.peer(), "canal de comandos sin clave");
            channel.close().await;
        }
    }
}
