// worker/src/worker.rs

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use common::transfer::{FileHeader, FileReceiver, ReceiveStart};
use common::{
    lock, Channel, ChannelEvent, ChannelEvents, ChannelState, Command, Expect, Message, Payload,
    ResourceId, ResourceState, Task, TaskId,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::execution::{execute, Outcome};
use crate::system::{capabilities, IdleLog, IdleSampler};

/// Por qué terminó una sesión con el master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    AuthorizationFailed,
    ConnectionLost,
}

/// Este proceso visto como recurso: el handshake, las tareas y las
/// estadísticas de ociosidad, contra un único master.
#[derive(Clone)]
pub struct WorkerResource {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkerConfig,
    master: SocketAddr,
    data: Channel,
    events: Mutex<Option<ChannelEvents>>,
    command: Mutex<Option<Channel>>,
    core: Mutex<Core>,
    /// Un cambio de estado y su reporte salen juntos y en orden.
    reporting: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ResourceState>,
    idle: Mutex<IdleLog>,
    shutdown: CancellationToken,
    lost: CancellationToken,
}

struct Core {
    state: ResourceState,
    resource_id: Option<ResourceId>,
    running: Option<(TaskId, CancellationToken)>,
}

/// Estado de la lectura del canal de datos; solo lo toca `serve`.
struct Session {
    expect: Expect,
    receiver: Option<FileReceiver>,
    /// El archivo en curso ya se rechazó; el checksum se contesta con error.
    rejected: bool,
}

impl WorkerResource {
    /// Conecta el canal de datos. La autorización la conduce el master.
    pub async fn connect(config: WorkerConfig, shutdown: CancellationToken) -> Result<Self> {
        let target = format!("{}:{}", config.host, config.port);
        let master = tokio::net::lookup_host(target.as_str())
            .await?
            .next()
            .ok_or_else(|| WorkerError::Resolve(target.clone()))?;

        let (data, events) = Channel::to_peer(master, config.channel.clone());
        let (state_tx, _) = watch::channel(ResourceState::NotConnected);
        let inner = Arc::new(Inner {
            config,
            master,
            data,
            events: Mutex::new(Some(events)),
            command: Mutex::new(None),
            core: Mutex::new(Core {
                state: ResourceState::NotConnected,
                resource_id: None,
                running: None,
            }),
            reporting: tokio::sync::Mutex::new(()),
            state_tx,
            idle: Mutex::new(IdleLog::default()),
            shutdown: shutdown.child_token(),
            lost: CancellationToken::new(),
        });

        inner.set_state(ResourceState::Connecting);
        if let Err(e) = inner.data.connect().await {
            inner.set_state(ResourceState::ErrorConnecting);
            return Err(e.into());
        }
        info!("conectado al master en {}", master);
        inner.set_state(ResourceState::Authorizing);
        Ok(Self { inner })
    }

    pub fn state(&self) -> ResourceState {
        self.inner.core().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState> {
        self.inner.state_tx.subscribe()
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        self.inner.core().resource_id
    }

    pub fn running_task(&self) -> Option<TaskId> {
        self.inner.core().running.as_ref().map(|(id, _)| *id)
    }

    /// Corta la tarea en curso. Devuelve `false` si no había ninguna.
    pub fn force_quit(&self) -> bool {
        self.inner.force_quit()
    }

    /// Atiende al master hasta que la sesión termina. Solo la primera
    /// llamada hace algo.
    pub async fn serve(&self) -> SessionEnd {
        let Some(events) = lock(&self.inner.events).take() else {
            return SessionEnd::Shutdown;
        };
        let inner = self.inner.clone();
        let end = inner.clone().serve(events).await;
        inner.close(end).await;
        end
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    fn set_state(&self, new: ResourceState) {
        let mut core = self.core();
        if core.state == new {
            return;
        }
        debug!("{} -> {}", core.state, new);
        core.state = new;
        self.state_tx.send_replace(new);
    }

    fn state(&self) -> ResourceState {
        self.core().state
    }

    async fn report(&self, state: ResourceState) {
        let _turn = self.reporting.lock().await;
        self.report_locked(state).await;
    }

    /// Quien llama tiene el turno de `reporting`.
    async fn report_locked(&self, state: ResourceState) {
        self.set_state(state);
        let msgs = [Command::StateChanged.into(), Payload::State(state).into()];
        if let Err(e) = self.data.send_all(&msgs).await {
            debug!("no se pudo reportar {}: {}", state, e);
        }
    }

    async fn send(&self, msg: impl Into<Message>) {
        if let Err(e) = self.data.send(msg).await {
            debug!("no se pudo enviar: {}", e);
        }
    }

    fn force_quit(&self) -> bool {
        let core = self.core();
        match &core.running {
            Some((task, token)) => {
                info!(task = *task, "cancelando la tarea en curso");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /* --------- Canal de datos --------- */

    async fn serve(self: Arc<Self>, mut events: ChannelEvents) -> SessionEnd {
        let mut session = Session {
            expect: Expect::Command,
            receiver: None,
            rejected: false,
        };

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = self.lost.cancelled() => return SessionEnd::ConnectionLost,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return SessionEnd::ConnectionLost,
                },
            };

            let ended = match event {
                ChannelEvent::Message(msg) => self.on_message(&mut session, msg).await,
                ChannelEvent::Malformed(_) => {
                    self.send(Command::InvalidCommand).await;
                    None
                }
                ChannelEvent::StateChanged(ChannelState::CommunicationError) => {
                    warn!("se perdió la conexión con el master");
                    Some(SessionEnd::ConnectionLost)
                }
                ChannelEvent::StateChanged(_) => None,
            };
            if let Some(end) = ended {
                if let Some(receiver) = session.receiver.take() {
                    receiver.abort().await;
                }
                return end;
            }
        }
    }

    async fn on_message(self: &Arc<Self>, session: &mut Session, msg: Message) -> Option<SessionEnd> {
        match msg {
            Message::Command(Command::Ping) => self.send(Command::PingAck).await,
            Message::Command(Command::PingAck) => {}
            Message::Command(cmd) => {
                if let Expect::Payload(waiting) = session.expect {
                    warn!("se esperaba el payload de {:?} y llegó {:?}", waiting, cmd);
                    self.send(Command::InvalidCommand).await;
                    return None;
                }
                return self.on_command(session, cmd).await;
            }
            Message::Payload(Payload::Chunk(data)) if session.expect == Expect::Command => {
                self.on_chunk(session, &data).await;
            }
            Message::Payload(Payload::Checksum(sum)) if session.expect == Expect::Command => {
                self.on_checksum(session, &sum).await;
            }
            Message::Payload(payload) => {
                let Expect::Payload(cmd) = session.expect else {
                    warn!("payload fuera de fase en {}", self.state());
                    self.send(Command::InvalidCommand).await;
                    return None;
                };
                session.expect = Expect::Command;
                self.on_payload(session, cmd, payload).await;
            }
        }
        None
    }

    async fn on_command(self: &Arc<Self>, session: &mut Session, cmd: Command) -> Option<SessionEnd> {
        let state = self.state();
        match cmd {
            Command::RequestCredentials if state == ResourceState::Authorizing => {
                self.send_credentials().await;
            }
            Command::SendingResourceId | Command::Transfer | Command::SendingTask => {
                session.expect = Expect::Payload(cmd);
            }
            Command::AuthorizationSucceeded if state == ResourceState::Authorizing => {
                self.report(ResourceState::AuthorizationSuccess).await;
                if let Err(e) = self.open_command_channel().await {
                    warn!("no se pudo abrir el canal de comandos: {}", e);
                    return Some(SessionEnd::ConnectionLost);
                }
            }
            Command::AuthorizationFailed => {
                warn!("el master rechazó las credenciales");
                self.report(ResourceState::AuthorizationFailure).await;
                return Some(SessionEnd::AuthorizationFailed);
            }
            Command::CommandChannelEstablished
                if state == ResourceState::AwaitingCommandConnection =>
            {
                info!("recurso {:?} listo", self.core().resource_id);
                self.report(ResourceState::Ready).await;
                tokio::spawn(self.clone().sample_idle());
            }
            Command::CancelTask => {
                if !self.force_quit() {
                    debug!("cancel_task sin tarea en curso");
                }
            }
            Command::SendIdleStats if state == ResourceState::Ready => self.send_idle_stats().await,
            Command::InvalidCommand => warn!("el master rechazó un mensaje en {}", state),
            Command::Error => warn!("el master reportó un error en {}", state),
            other => {
                warn!("comando {:?} fuera de fase en {}", other, state);
                self.send(Command::InvalidCommand).await;
            }
        }
        None
    }

    async fn on_payload(self: &Arc<Self>, session: &mut Session, cmd: Command, payload: Payload) {
        match (cmd, payload) {
            (Command::SendingResourceId, Payload::ResourceId(id)) => {
                debug!("el master nos asignó el id {}", id);
                self.core().resource_id = Some(id);
            }
            (Command::Transfer, Payload::FileHeader(header)) => {
                self.begin_file(session, header).await;
            }
            (Command::SendingTask, Payload::Task(task)) => self.start_task(*task).await,
            (cmd, _) => {
                warn!("payload inválido para {:?}", cmd);
                self.send(Command::InvalidCommand).await;
            }
        }
    }

    async fn send_credentials(&self) {
        let caps = match tokio::task::spawn_blocking(capabilities).await {
            Ok(caps) => caps,
            Err(e) => {
                warn!("no se pudieron leer las capacidades: {}", e);
                Default::default()
            }
        };
        let msgs = [
            Command::ClientKey.into(),
            Payload::ClientKey {
                key: self.config.key,
                secret: self.config.secret,
            }
            .into(),
            Command::Credentials.into(),
            Payload::Credentials(self.config.credentials.clone()).into(),
            Command::Capabilities.into(),
            Payload::Capabilities(caps).into(),
        ];
        if let Err(e) = self.data.send_all(&msgs).await {
            warn!("no se pudieron mandar las credenciales: {}", e);
        }
    }

    /// Conecta a `port + 1` y se presenta con la clave.
    async fn open_command_channel(self: &Arc<Self>) -> Result<()> {
        self.report(ResourceState::AwaitingCommandConnection).await;

        let addr = SocketAddr::new(self.master.ip(), self.config.command_port());
        let (channel, events) = Channel::to_peer(addr, self.config.channel.clone());
        channel.connect().await?;
        channel
            .send(Payload::ClientKey {
                key: self.config.key,
                secret: self.config.secret,
            })
            .await?;

        *lock(&self.command) = Some(channel.clone());
        tokio::spawn(self.clone().drive_command(channel, events));
        Ok(())
    }

    /// Por el canal de comandos solo llegan pings.
    async fn drive_command(self: Arc<Self>, channel: Channel, mut events: ChannelEvents) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                ChannelEvent::Message(Message::Command(Command::Ping)) => {
                    let _ = channel.send(Command::PingAck).await;
                }
                ChannelEvent::Message(_) | ChannelEvent::Malformed(_) => {
                    let _ = channel.send(Command::InvalidCommand).await;
                }
                ChannelEvent::StateChanged(ChannelState::CommunicationError) => {
                    warn!("se perdió el canal de comandos");
                    self.lost.cancel();
                    break;
                }
                ChannelEvent::StateChanged(_) => {}
            }
        }
    }

    /* --------- Archivos --------- */

    async fn begin_file(&self, session: &mut Session, header: FileHeader) {
        if let Some(stale) = session.receiver.take() {
            stale.abort().await;
        }
        session.rejected = false;
        if self.state() == ResourceState::Ready {
            self.report(ResourceState::TaskAssigned).await;
        }

        let name = header.file_name.clone();
        match FileReceiver::begin(&self.config.work_dir, header).await {
            Ok(ReceiveStart::NotModified) => {
                debug!("{} sin cambios", name);
                self.send(Command::TransferNotModified).await;
            }
            Ok(ReceiveStart::Ready(receiver)) => {
                session.receiver = Some(receiver);
                self.send(Command::TransferAck).await;
            }
            Err(e) => {
                warn!("archivo {} rechazado: {}", name, e);
                self.send(Command::Error).await;
                self.file_rejected().await;
            }
        }
    }

    async fn on_chunk(&self, session: &mut Session, data: &[u8]) {
        let Some(receiver) = session.receiver.as_mut() else {
            if !session.rejected {
                self.send(Command::InvalidCommand).await;
            }
            return;
        };
        if let Err(e) = receiver.write_chunk(data).await {
            warn!("no se pudo escribir {}: {}", receiver.file_name(), e);
            if let Some(receiver) = session.receiver.take() {
                receiver.abort().await;
            }
            session.rejected = true;
        }
    }

    async fn on_checksum(&self, session: &mut Session, sum: &[u8]) {
        let accepted = match session.receiver.take() {
            Some(receiver) => {
                let name = receiver.file_name().to_string();
                match receiver.finish(sum).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!("no se pudo cerrar {}: {}", name, e);
                        false
                    }
                }
            }
            None if std::mem::take(&mut session.rejected) => false,
            None => {
                self.send(Command::InvalidCommand).await;
                return;
            }
        };

        if accepted {
            self.send(Command::TransferAck).await;
        } else {
            self.send(Command::Error).await;
            self.file_rejected().await;
        }
    }

    /// El master da la tarea por terminada en este recurso.
    async fn file_rejected(&self) {
        if self.state() == ResourceState::TaskAssigned {
            self.report(ResourceState::Ready).await;
        }
    }

    /* --------- Tareas --------- */

    async fn start_task(self: &Arc<Self>, task: Task) {
        if self.core().running.is_some() {
            warn!(task = task.id, "ya hay una tarea corriendo");
            self.send(Command::InvalidCommand).await;
            return;
        }
        if !matches!(
            self.state(),
            ResourceState::Ready | ResourceState::TaskAssigned
        ) {
            warn!(task = task.id, "tarea recibida en {}", self.state());
            self.send(Command::InvalidCommand).await;
            return;
        }

        info!(task = task.id, "tarea recibida: {:?}", task.work);
        let token = self.shutdown.child_token();
        self.core().running = Some((task.id, token.clone()));
        {
            let _turn = self.reporting.lock().await;
            if self.state() == ResourceState::Ready {
                self.report_locked(ResourceState::TaskAssigned).await;
            }
            self.report_locked(ResourceState::RunningTask).await;
        }
        tokio::spawn(self.clone().run_task(task, token));
    }

    async fn run_task(self: Arc<Self>, task: Task, token: CancellationToken) {
        let id = task.id;
        let work_dir = self.config.work_dir.clone();
        let cancel = token.clone();
        let ran = tokio::spawn(async move { execute(&task, &work_dir, cancel).await }).await;
        let outcome = ran.unwrap_or_else(|e| Outcome::Troubled(format!("la tarea entró en pánico: {}", e)));

        {
            let mut core = self.core();
            if core.running.as_ref().map(|(t, _)| *t) == Some(id) {
                core.running = None;
            }
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let _turn = self.reporting.lock().await;
        match outcome {
            Outcome::Completed(value) => {
                info!(task = id, "tarea completada");
                self.report_locked(ResourceState::FinishingTask).await;
                let msgs = [Command::SendingResults.into(), Payload::Result(value).into()];
                if let Err(e) = self.data.send_all(&msgs).await {
                    warn!(task = id, "no se pudo enviar el resultado: {}", e);
                    return;
                }
                self.report_locked(ResourceState::TaskCompleted).await;
            }
            Outcome::Terminated => {
                info!(task = id, "tarea cancelada");
                self.report_locked(ResourceState::TaskTerminated).await;
            }
            Outcome::Troubled(reason) => {
                warn!(task = id, "la tarea falló: {}", reason);
                self.report_locked(ResourceState::TaskEndedAbnormally).await;
            }
        }
        self.report_locked(ResourceState::Ready).await;
    }

    /* --------- Ociosidad --------- */

    async fn sample_idle(self: Arc<Self>) {
        let mut sampler = IdleSampler::new();
        let mut ticker = tokio::time::interval(self.config.idle_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.state() != ResourceState::Ready {
                continue;
            }

            let idle = sampler.sample();
            let first = lock(&self.idle).record(Utc::now(), idle);
            if first {
                let command = lock(&self.command).clone();
                if let Some(channel) = command {
                    if let Err(e) = channel.send(Command::IdleStatsAvailable).await {
                        debug!("no se pudo avisar de las estadísticas: {}", e);
                    }
                }
            }
        }
    }

    async fn send_idle_stats(&self) {
        let _turn = self.reporting.lock().await;
        self.report_locked(ResourceState::SendingIdleStats).await;

        let samples = lock(&self.idle).drain();
        debug!("enviando {} muestras de ociosidad", samples.len());
        for (at, idle) in samples {
            let cmd = if idle {
                Command::SendingIdleTime
            } else {
                Command::SendingNonidleTime
            };
            if let Err(e) = self.data.send_all(&[cmd.into(), Payload::Timestamp(at).into()]).await {
                warn!("no se pudieron enviar las estadísticas: {}", e);
                break;
            }
        }
        self.report_locked(ResourceState::Ready).await;
    }

    /* --------- Cierre --------- */

    async fn close(&self, end: SessionEnd) {
        let command = lock(&self.command).take();
        if end == SessionEnd::Shutdown {
            let notice = match &command {
                Some(channel) => channel.send(Command::GoingOffline).await,
                None => self.data.send(Command::GoingOffline).await,
            };
            if let Err(e) = notice {
                debug!("no se pudo avisar la salida: {}", e);
            }
        }

        self.shutdown.cancel();
        self.set_state(ResourceState::Disconnecting);
        if let Some(channel) = command {
            channel.close().await;
        }
        self.data.close().await;
        self.set_state(ResourceState::NotConnected);
        info!("sesión terminada: {:?}", end);
    }
}

/// Abre una sesión y la atiende hasta que termina.
pub async fn run_session(config: WorkerConfig, shutdown: CancellationToken) -> Result<SessionEnd> {
    let worker = WorkerResource::connect(config, shutdown).await?;
    Ok(worker.serve().await)
}

/// Reconecta tras un rechazo o una caída, hasta `config.retries` veces.
pub async fn run(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    let mut failures = 0;
    loop {
        let failure = match run_session(config.clone(), shutdown.clone()).await {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::AuthorizationFailed) => WorkerError::AuthorizationFailed,
            Ok(SessionEnd::ConnectionLost) => WorkerError::ConnectionLost,
            Err(e) => e,
        };
        if shutdown.is_cancelled() {
            return Ok(());
        }

        failures += 1;
        if failures > config.retries {
            return Err(failure);
        }
        warn!("{} (reintento {} de {})", failure, failures, config.retries);

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = sleep(config.channel.backoff) => {}
        }
    }
}
