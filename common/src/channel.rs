// common/src/channel.rs

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};
use crate::lock;
use crate::protocol::Message;

pub const CONNECT_ATTEMPTS: u32 = 3;
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(2500);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Largo máximo de una línea. Un chunk de archivo en hex entra holgado.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    NotConnected,
    Connecting,
    WaitingForConnection,
    Connected,
    Disconnecting,
    CommunicationError,
    ErrorConnecting,
}

/// Lo que el canal le notifica a su dueño, en orden de llegada.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Message(Message),
    /// Línea que no se pudo decodificar como `Message`, o que superó
    /// `MAX_FRAME_LEN` y se descartó.
    Malformed(String),
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_attempts: u32,
    pub backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_attempts: CONNECT_ATTEMPTS,
            backoff: CONNECT_BACKOFF,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Conexión punto a punto orientada a mensajes sobre TCP.
///
/// Un mensaje es una línea JSON. Hay una sola tarea lectora por conexión,
/// que entrega los mensajes al dueño por el receptor devuelto en `new`.
/// Los envíos concurrentes se serializan con el lock del escritor.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    config: ChannelConfig,
    peer: Mutex<Option<SocketAddr>>,
    state: Mutex<ChannelState>,
    writer: tokio::sync::Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    stop: Mutex<CancellationToken>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> (Self, ChannelEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            peer: Mutex::new(None),
            state: Mutex::new(ChannelState::NotConnected),
            writer: tokio::sync::Mutex::new(None),
            stop: Mutex::new(CancellationToken::new()),
            events: tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Canal con destino fijo. En `accept_from` el destino restringe quién
    /// puede conectarse (por IP).
    pub fn to_peer(addr: SocketAddr, config: ChannelConfig) -> (Self, ChannelEvents) {
        let (channel, events) = Self::new(config);
        *lock(&channel.inner.peer) = Some(addr);
        (channel, events)
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.inner.state)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *lock(&self.inner.peer)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Conexión activa con reintentos (intentos fijos, backoff constante).
    pub async fn connect(&self) -> Result<ChannelState> {
        let addr = self.peer().ok_or(ChannelError::MissingPeer)?;
        let current = self.state();
        if !matches!(
            current,
            ChannelState::NotConnected | ChannelState::ErrorConnecting
        ) {
            return Err(ChannelError::InvalidState(current));
        }

        let attempts = self.inner.config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            self.inner.set_state(ChannelState::Connecting);

            match timeout(self.inner.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let stop = self.inner.fresh_stop();
                    self.inner.install(stream, stop).await;
                    return Ok(self.state());
                }
                Ok(Err(e)) => warn!(%addr, attempt, "no se pudo conectar: {}", e),
                Err(_) => warn!(%addr, attempt, "timeout conectando"),
            }

            if attempt < attempts {
                sleep(self.inner.config.backoff).await;
            }
        }

        self.inner.set_state(ChannelState::ErrorConnecting);
        Err(ChannelError::Connect { addr, attempts })
    }

    /// Espera a que un par se conecte al listener. Si el canal tiene destino
    /// fijo, las conexiones desde otra IP se descartan.
    pub async fn accept_from(&self, listener: &TcpListener) -> Result<ChannelState> {
        let current = self.state();
        if !matches!(
            current,
            ChannelState::NotConnected | ChannelState::ErrorConnecting
        ) {
            return Err(ChannelError::InvalidState(current));
        }

        let stop = self.inner.fresh_stop();
        let bound_ip = self.peer().map(|a| a.ip());
        self.inner.set_state(ChannelState::WaitingForConnection);

        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => {
                    self.inner.set_state(ChannelState::NotConnected);
                    return Err(ChannelError::Cancelled);
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    if let Some(ip) = bound_ip {
                        if ip != addr.ip() {
                            warn!(%addr, "conexión rechazada: se esperaba {}", ip);
                            continue;
                        }
                    }
                    *lock(&self.inner.peer) = Some(addr);
                    self.inner.install(stream, stop).await;
                    return Ok(self.state());
                }
                Err(e) => {
                    self.inner.set_state(ChannelState::ErrorConnecting);
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn send(&self, msg: impl Into<Message>) -> Result<()> {
        self.send_all(&[msg.into()]).await
    }

    /// Escribe varios mensajes seguidos sin que se intercale otro envío.
    pub async fn send_all(&self, msgs: &[Message]) -> Result<()> {
        let mut buf = String::new();
        for msg in msgs {
            buf.push_str(&serde_json::to_string(msg)?);
            buf.push('\n');
        }

        let state = self.state();
        if state != ChannelState::Connected {
            return Err(ChannelError::NotConnected(state));
        }

        let mut writer = self.inner.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(ChannelError::NotConnected(self.state()));
        };

        let written = match w.write_all(buf.as_bytes()).await {
            Ok(()) => w.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            writer.take();
            drop(writer);
            self.inner.fail(&e.to_string());
            return Err(e.into());
        }
        Ok(())
    }

    /// Idempotente. Corta la lectura, libera el socket y deja NOT_CONNECTED.
    pub async fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == ChannelState::NotConnected {
                return;
            }
            *state = ChannelState::Disconnecting;
            self.inner.emit(ChannelEvent::StateChanged(ChannelState::Disconnecting));
        }

        lock(&self.inner.stop).cancel();

        if let Some(mut w) = self.inner.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }

        self.inner.set_state(ChannelState::NotConnected);
    }
}

impl Inner {
    fn emit(&self, event: ChannelEvent) {
        // el dueño pudo haber soltado el receptor
        let _ = self.events.send(event);
    }

    fn set_state(&self, new: ChannelState) {
        let mut state = lock(&self.state);
        if *state == new {
            return;
        }
        debug!("canal: {:?} -> {:?}", *state, new);
        *state = new;
        self.emit(ChannelEvent::StateChanged(new));
    }

    fn fresh_stop(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.stop) = token.clone();
        token
    }

    /// Fallo de transporte: solo cuenta si estábamos conectados.
    fn fail(&self, reason: &str) -> bool {
        let mut state = lock(&self.state);
        if *state != ChannelState::Connected {
            return false;
        }
        warn!("error de comunicación: {}", reason);
        *state = ChannelState::CommunicationError;
        self.emit(ChannelEvent::StateChanged(ChannelState::CommunicationError));
        true
    }

    async fn install(self: &Arc<Self>, stream: TcpStream, stop: CancellationToken) {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        *self.writer.lock().await = Some(BufWriter::new(write));
        self.set_state(ChannelState::Connected);
        tokio::spawn(read_loop(self.clone(), read, stop));
    }
}

enum Frame {
    Line(String),
    Oversized,
}

type Decoded<T> = std::result::Result<Option<T>, LinesCodecError>;

/// Líneas acotadas: una línea demasiado larga se descarta hasta el próximo
/// salto y se informa como `Frame::Oversized` sin cortar la lectura.
struct FrameCodec(LinesCodec);

impl FrameCodec {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_FRAME_LEN))
    }

    fn frame(decoded: Decoded<String>) -> Decoded<Frame> {
        match decoded {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Decoded<Frame> {
        Self::frame(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Decoded<Frame> {
        Self::frame(self.0.decode_eof(buf))
    }
}

async fn read_loop(inner: Arc<Inner>, read: OwnedReadHalf, stop: CancellationToken) {
    let mut frames = FramedRead::new(read, FrameCodec::new());

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(Frame::Line(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(msg) => inner.emit(ChannelEvent::Message(msg)),
                    Err(e) => {
                        warn!("mensaje mal formado: {}", e);
                        inner.emit(ChannelEvent::Malformed(e.to_string()));
                    }
                }
            }
            Some(Ok(Frame::Oversized)) => {
                warn!("línea de más de {} bytes descartada", MAX_FRAME_LEN);
                inner.emit(ChannelEvent::Malformed(format!(
                    "línea de más de {} bytes",
                    MAX_FRAME_LEN
                )));
            }
            None => {
                if inner.fail("el otro extremo cerró la conexión") {
                    inner.writer.lock().await.take();
                }
                break;
            }
            Some(Err(e)) => {
                if inner.fail(&e.to_string()) {
                    inner.writer.lock().await.take();
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Payload};
    use tokio::io::AsyncWriteExt;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast() -> ChannelConfig {
        ChannelConfig::default()
            .with_backoff(Duration::from_millis(10))
            .with_connect_timeout(Duration::from_millis(500))
    }

    async fn next_message(events: &mut ChannelEvents) -> Message {
        loop {
            match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                ChannelEvent::Message(m) => return m,
                _ => continue,
            }
        }
    }

    async fn wait_state(events: &mut ChannelEvents, wanted: ChannelState) {
        loop {
            match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                ChannelEvent::StateChanged(s) if s == wanted => return,
                _ => continue,
            }
        }
    }

    async fn pair() -> (Channel, ChannelEvents, Channel, ChannelEvents) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server, server_rx) = Channel::new(fast());
        let accepting = server.clone();
        let accept = tokio::spawn(async move { accepting.accept_from(&listener).await });

        let (client, client_rx) = Channel::to_peer(addr, fast());
        client.connect().await.unwrap();
        accept.await.unwrap().unwrap();

        (server, server_rx, client, client_rx)
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (_server, mut server_rx, client, _client_rx) = pair().await;

        for i in 0..200u64 {
            client.send(Payload::ResourceId(i)).await.unwrap();
        }

        for i in 0..200u64 {
            assert_eq!(
                next_message(&mut server_rx).await,
                Message::Payload(Payload::ResourceId(i))
            );
        }
    }

    #[tokio::test]
    async fn concurrent_senders_do_not_interleave_lines() {
        let (_server, mut server_rx, client, _client_rx) = pair().await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = client.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    c.send_all(&[Command::StateChanged.into(), Payload::State(crate::ResourceState::Ready).into()])
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for _ in 0..200 {
            assert_eq!(
                next_message(&mut server_rx).await,
                Message::Command(Command::StateChanged)
            );
            assert!(matches!(
                next_message(&mut server_rx).await,
                Message::Payload(Payload::State(_))
            ));
        }
    }

    #[tokio::test]
    async fn send_requires_connected_state() {
        let (channel, _rx) = Channel::new(fast());
        let err = channel.send(Command::Ping).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::NotConnected(ChannelState::NotConnected)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_server, _server_rx, client, mut client_rx) = pair().await;

        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ChannelState::NotConnected);

        let mut seen = Vec::new();
        while let Ok(ev) = client_rx.try_recv() {
            if let ChannelEvent::StateChanged(s) = ev {
                seen.push(s);
            }
        }
        let closing: Vec<_> = seen
            .iter()
            .filter(|s| **s == ChannelState::Disconnecting)
            .collect();
        assert_eq!(closing.len(), 1);
        assert_eq!(seen.last(), Some(&ChannelState::NotConnected));
    }

    #[tokio::test]
    async fn peer_going_away_is_a_communication_error() {
        let (server, _server_rx, client, mut client_rx) = pair().await;

        server.close().await;
        wait_state(&mut client_rx, ChannelState::CommunicationError).await;
        assert_eq!(client.state(), ChannelState::CommunicationError);
        assert!(client.send(Command::Ping).await.is_err());
    }

    #[tokio::test]
    async fn connect_gives_up_after_three_attempts() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (channel, _rx) = Channel::to_peer(addr, fast());
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect { attempts: 3, .. }));
        assert_eq!(channel.state(), ChannelState::ErrorConnecting);
    }

    #[tokio::test]
    async fn close_cancels_a_pending_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (channel, mut rx) = Channel::new(fast());

        let waiting = channel.clone();
        let accept = tokio::spawn(async move { waiting.accept_from(&listener).await });
        wait_state(&mut rx, ChannelState::WaitingForConnection).await;

        channel.close().await;
        let res = timeout(WAIT, accept).await.unwrap().unwrap();
        assert!(matches!(res, Err(ChannelError::Cancelled)));
        assert_eq!(channel.state(), ChannelState::NotConnected);
    }

    #[tokio::test]
    async fn garbage_lines_are_reported_as_malformed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, mut server_rx) = Channel::new(fast());
        let accepting = server.clone();
        let accept = tokio::spawn(async move { accepting.accept_from(&listener).await });

        let mut raw = TcpStream::connect(addr).await.unwrap();
        accept.await.unwrap().unwrap();
        raw.write_all(b"{\"kind\":\"command\",\"body\":\"reboot\"}\n")
            .await
            .unwrap();
        raw.write_all(b"{\"kind\":\"command\",\"body\":\"ping\"}\n")
            .await
            .unwrap();

        let mut malformed = false;
        loop {
            match timeout(WAIT, server_rx.recv()).await.unwrap().unwrap() {
                ChannelEvent::Malformed(_) => malformed = true,
                ChannelEvent::Message(m) => {
                    assert_eq!(m, Message::Command(Command::Ping));
                    break;
                }
                ChannelEvent::StateChanged(_) => {}
            }
        }
        assert!(malformed);
        assert!(server.is_connected());
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_and_reading_goes_on() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, mut server_rx) = Channel::new(fast());
        let accepting = server.clone();
        let accept = tokio::spawn(async move { accepting.accept_from(&listener).await });

        let mut raw = TcpStream::connect(addr).await.unwrap();
        accept.await.unwrap().unwrap();
        let huge = vec![b'x'; MAX_FRAME_LEN + 10];
        raw.write_all(&huge).await.unwrap();
        raw.write_all(b"\n{\"kind\":\"command\",\"body\":\"ping\"}\n")
            .await
            .unwrap();

        let mut malformed = 0;
        loop {
            match timeout(WAIT, server_rx.recv()).await.unwrap().unwrap() {
                ChannelEvent::Malformed(_) => malformed += 1,
                ChannelEvent::Message(m) => {
                    assert_eq!(m, Message::Command(Command::Ping));
                    break;
                }
                ChannelEvent::StateChanged(_) => {}
            }
        }
        assert_eq!(malformed, 1);
        assert!(server.is_connected());
    }
}
