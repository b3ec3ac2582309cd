// master/src/resource.rs

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use common::transfer::{self, TransferReply};
use common::{
    lock, Capabilities, Channel, ChannelEvent, ChannelEvents, ChannelState, Command, Credentials,
    Expect, Message, Payload, ResourceId, ResourceState, SharedProfile, Task, TaskId, TaskState,
    TransferError,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResourceTiming;
use crate::correlation::{CommandLink, CorrelationTable};

/// Lo que un recurso le avisa al scheduler, en orden.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    StateChanged {
        resource: ResourceId,
        state: ResourceState,
    },
    /// El recurso soltó su tarea (`task.state` es COMPLETED, TERMINATED o
    /// TROUBLED). Llega siempre antes del cambio de estado que lo provocó.
    TaskReleased { resource: ResourceId, task: Task },
    TaskTimedOut { resource: ResourceId, task: Task },
}

/// Dependencias compartidas por todos los recursos de un scheduler.
pub struct ResourceContext {
    pub credentials: Credentials,
    pub timing: ResourceTiming,
    pub correlation: Arc<CorrelationTable>,
    pub events: mpsc::UnboundedSender<ResourceEvent>,
}

/// Un worker conectado, visto desde el master.
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<Inner>,
}

struct Inner {
    id: ResourceId,
    data: Channel,
    command: Mutex<Option<Channel>>,
    ctx: Arc<ResourceContext>,
    core: Mutex<Core>,
    credentials_ready: Notify,
    state_tx: watch::Sender<ResourceState>,
    shutdown: CancellationToken,
}

struct Core {
    state: ResourceState,
    expect: Expect,
    task: Option<Task>,
    task_cancel: Option<CancellationToken>,
    /// Se pidió cancelar la tarea actual: su fin no cuenta como fallo.
    cancelling: bool,
    transfer_tx: Option<mpsc::UnboundedSender<TransferReply>>,
    avoid: HashSet<TaskId>,
    profile: Option<SharedProfile>,
    reported: Capabilities,
    key_pair: Option<(u32, u32)>,
    client_key: Option<u32>,
    provided: Option<Credentials>,
    has_idle_stats: bool,
}

enum Reaction {
    Nothing,
    Reply(Message),
    RequestIdleStats,
    Disconnect,
}

impl ResourceHandle {
    /// Toma un canal de datos ya conectado. Hay que llamar a
    /// `begin_authorization` para arrancar el handshake.
    pub fn new(
        id: ResourceId,
        data: Channel,
        events: ChannelEvents,
        ctx: Arc<ResourceContext>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ResourceState::NotConnected);
        let inner = Arc::new(Inner {
            id,
            data,
            command: Mutex::new(None),
            ctx,
            core: Mutex::new(Core {
                state: ResourceState::NotConnected,
                expect: Expect::Command,
                task: None,
                task_cancel: None,
                cancelling: false,
                transfer_tx: None,
                avoid: HashSet::new(),
                profile: None,
                reported: Capabilities::new(),
                key_pair: None,
                client_key: None,
                provided: None,
                has_idle_stats: false,
            }),
            credentials_ready: Notify::new(),
            state_tx,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(inner.clone().drive_data(events));
        Self { inner }
    }

    pub fn begin_authorization(&self) {
        tokio::spawn(self.inner.clone().authorize());
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.data.peer()
    }

    pub fn state(&self) -> ResourceState {
        self.inner.core().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ResourceState::Ready
    }

    /// Flujo de estados del recurso.
    pub fn subscribe(&self) -> watch::Receiver<ResourceState> {
        self.inner.state_tx.subscribe()
    }

    /// Capacidades reportadas por el worker, pisadas por las del perfil.
    pub fn capabilities(&self) -> Capabilities {
        let core = self.inner.core();
        let mut caps = core.reported.clone();
        if let Some(profile) = &core.profile {
            for (k, v) in &lock(profile).specs {
                caps.insert(k.clone(), v.clone());
            }
        }
        caps
    }

    pub fn avoids(&self, task: TaskId) -> bool {
        self.inner.core().avoid.contains(&task)
    }

    pub fn has_idle_stats(&self) -> bool {
        self.inner.core().has_idle_stats
    }

    pub fn profile(&self) -> Option<SharedProfile> {
        self.inner.core().profile.clone()
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.inner.core().task.as_ref().map(|t| t.id)
    }

    /// Solo desde READY. Devuelve `false` si el recurso ya no estaba listo;
    /// en ese caso la tarea sigue siendo de quien llama.
    pub fn assign_task(&self, mut task: Task) -> bool {
        let inner = &self.inner;
        let mut core = inner.core();
        if core.state != ResourceState::Ready || core.task.is_some() {
            return false;
        }

        task.state = TaskState::Running;
        let token = inner.shutdown.child_token();
        let replies = if task.files.is_empty() {
            core.transfer_tx = None;
            None
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            core.transfer_tx = Some(tx);
            Some(rx)
        };
        core.task = Some(task.clone());
        core.task_cancel = Some(token.clone());
        core.cancelling = false;
        inner.set_state(&mut core, ResourceState::TaskAssigned);
        drop(core);

        info!(resource = inner.id, task = task.id, "tarea asignada");
        let after = task.timeout();
        let id = task.id;
        tokio::spawn(inner.clone().deliver_task(task, replies, token.clone()));
        tokio::spawn(inner.clone().watch_timeout(id, after, token));
        true
    }

    /// Solo tiene efecto si el recurso está corriendo esa tarea.
    pub fn cancel_task(&self, task: TaskId) -> bool {
        let inner = &self.inner;
        {
            let mut core = inner.core();
            if core.state != ResourceState::RunningTask
                || core.task.as_ref().map(|t| t.id) != Some(task)
            {
                return false;
            }
            core.cancelling = true;
        }
        info!(resource = inner.id, task, "cancelando tarea");
        inner.spawn_send(Command::CancelTask.into());
        true
    }

    pub fn request_idle_stats(&self) -> bool {
        self.inner.request_idle_stats()
    }

    /// Idempotente. Libera la tarea en curso (como TROUBLED) y cierra ambos canales.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    fn emit(&self, event: ResourceEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn set_state(&self, core: &mut Core, new: ResourceState) {
        if core.state == new {
            return;
        }
        debug!(resource = self.id, "{} -> {}", core.state, new);
        core.state = new;
        self.state_tx.send_replace(new);
        self.emit(ResourceEvent::StateChanged {
            resource: self.id,
            state: new,
        });
    }

    fn transition(&self, from: ResourceState, to: ResourceState) -> bool {
        let mut core = self.core();
        if core.state != from {
            return false;
        }
        self.set_state(&mut core, to);
        true
    }

    fn release(&self, core: &mut Core, outcome: TaskState) {
        if let Some(token) = core.task_cancel.take() {
            token.cancel();
        }
        core.transfer_tx = None;

        let Some(mut task) = core.task.take() else {
            return;
        };
        task.state = outcome;

        let cancelled = std::mem::take(&mut core.cancelling);
        if !cancelled {
            let failed = outcome != TaskState::Completed;
            if failed {
                core.avoid.insert(task.id);
            }
            if let Some(profile) = &core.profile {
                lock(profile).record_task(failed);
            }
        }

        debug!(resource = self.id, task = task.id, "tarea liberada como {:?}", outcome);
        self.emit(ResourceEvent::TaskReleased {
            resource: self.id,
            task,
        });
    }

    fn spawn_send(&self, msg: Message) {
        let data = self.data.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = data.send(msg).await {
                warn!(resource = id, "no se pudo enviar: {}", e);
            }
        });
    }

    /* --------- Autorización --------- */

    async fn authorize(self: Arc<Self>) {
        if !self.transition(ResourceState::NotConnected, ResourceState::Authorizing) {
            return;
        }

        if let Err(e) = self.data.send(Command::RequestCredentials).await {
            warn!(resource = self.id, "no se pudieron pedir credenciales: {}", e);
            return;
        }

        if !self.wait_credentials().await {
            warn!(resource = self.id, "el worker no mandó credenciales a tiempo");
            self.transition(ResourceState::Authorizing, ResourceState::Troubled);
            return;
        }

        let (provided, key_pair) = {
            let mut core = self.core();
            (core.provided.take(), core.key_pair)
        };

        let key = match key_pair {
            Some((key, secret)) if provided.as_ref() == Some(&self.ctx.credentials) => {
                if let Some(profile) = self.ctx.correlation.claim_launch(key, secret) {
                    info!(
                        resource = self.id,
                        "worker lanzado para {}",
                        lock(&profile).hostname
                    );
                    self.core().profile = Some(profile);
                }
                key
            }
            _ => {
                warn!(resource = self.id, "credenciales inválidas");
                let _ = self.data.send(Command::AuthorizationFailed).await;
                self.transition(
                    ResourceState::Authorizing,
                    ResourceState::AuthorizationFailure,
                );
                return;
            }
        };

        self.core().client_key = Some(key);
        let waiting = self.ctx.correlation.expect_command_channel(key);

        let granted = [
            Command::SendingResourceId.into(),
            Payload::ResourceId(self.id).into(),
            Command::AuthorizationSucceeded.into(),
        ];
        if let Err(e) = self.data.send_all(&granted).await {
            warn!(resource = self.id, "no se pudo confirmar la autorización: {}", e);
            self.ctx.correlation.forget(key);
            return;
        }
        if !self.transition(
            ResourceState::Authorizing,
            ResourceState::AuthorizationSuccess,
        ) {
            self.ctx.correlation.forget(key);
            return;
        }

        let link = tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.ctx.correlation.forget(key);
                return;
            }
            link = timeout(self.ctx.timing.command_channel, waiting) => link,
        };

        match link {
            Ok(Ok(link)) => {
                self.install_command(link);
                match self.data.send(Command::CommandChannelEstablished).await {
                    Ok(()) => {
                        if self.transition(
                            ResourceState::AuthorizationSuccess,
                            ResourceState::Ready,
                        ) {
                            info!(resource = self.id, "recurso listo");
                        }
                    }
                    Err(e) => warn!(resource = self.id, "no se pudo confirmar el canal de comandos: {}", e),
                }
            }
            _ => {
                self.ctx.correlation.forget(key);
                warn!(resource = self.id, "el canal de comandos no llegó");
                self.transition(ResourceState::AuthorizationSuccess, ResourceState::Troubled);
            }
        }
    }

    /// Cuenta regresiva: `attempts` esperas de `interval`.
    async fn wait_credentials(&self) -> bool {
        let wait = self.ctx.timing.credentials;
        for _ in 0..wait.attempts.max(1) {
            if self.core().provided.is_some() {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.credentials_ready.notified() => {}
                _ = sleep(wait.interval) => debug!(resource = self.id, "esperando credenciales"),
            }
        }
        self.core().provided.is_some()
    }

    fn install_command(self: &Arc<Self>, link: CommandLink) {
        let CommandLink { channel, events } = link;
        *lock(&self.command) = Some(channel.clone());
        tokio::spawn(self.clone().drive_command(channel, events));
    }

    /* --------- Entrega de tareas --------- */

    async fn deliver_task(
        self: Arc<Self>,
        task: Task,
        mut replies: Option<mpsc::UnboundedReceiver<TransferReply>>,
        cancel: CancellationToken,
    ) {
        if let Some(replies) = replies.as_mut() {
            for file in &task.files {
                let sent = transfer::send_file(
                    &self.data,
                    file,
                    replies,
                    self.ctx.timing.transfer,
                    &cancel,
                )
                .await;
                match sent {
                    Ok(outcome) => debug!(
                        resource = self.id,
                        task = task.id,
                        "{}: {:?}",
                        file.remote_name,
                        outcome
                    ),
                    Err(TransferError::Cancelled) => return,
                    Err(e) => {
                        warn!(
                            resource = self.id,
                            task = task.id,
                            "falló la transferencia de {}: {}",
                            file.remote_name,
                            e
                        );
                        self.transfer_failed(task.id);
                        return;
                    }
                }
            }
            let mut core = self.core();
            if core.task.as_ref().map(|t| t.id) == Some(task.id) {
                core.transfer_tx = None;
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        let id = task.id;
        let msgs = [
            Command::SendingTask.into(),
            Payload::Task(Box::new(task)).into(),
        ];
        if let Err(e) = self.data.send_all(&msgs).await {
            warn!(resource = self.id, task = id, "no se pudo enviar la tarea: {}", e);
        }
    }

    /// Un archivo rechazado cuenta como tarea terminada en este recurso.
    fn transfer_failed(&self, task: TaskId) {
        if !self.data.is_connected() {
            // lo resuelve el error de comunicación
            return;
        }
        let mut core = self.core();
        if core.state != ResourceState::TaskAssigned
            || core.task.as_ref().map(|t| t.id) != Some(task)
        {
            return;
        }
        self.release(&mut core, TaskState::Terminated);
        self.set_state(&mut core, ResourceState::TaskTerminated);
        self.set_state(&mut core, ResourceState::Ready);
    }

    async fn watch_timeout(self: Arc<Self>, task: TaskId, after: Duration, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(after) => {}
        }

        let timed_out = {
            let core = self.core();
            match &core.task {
                Some(t) if t.id == task && core.state.holds_task() => t.clone(),
                _ => return,
            }
        };
        warn!(resource = self.id, task, "timeout de la tarea ({:?})", after);
        self.emit(ResourceEvent::TaskTimedOut {
            resource: self.id,
            task: timed_out,
        });
    }

    fn request_idle_stats(self: &Arc<Self>) -> bool {
        {
            let mut core = self.core();
            if core.state != ResourceState::Ready || !core.has_idle_stats {
                return false;
            }
            core.has_idle_stats = false;
            self.set_state(&mut core, ResourceState::SendingIdleStats);
        }
        self.spawn_send(Command::SendIdleStats.into());
        true
    }

    /* --------- Lectura de los canales --------- */

    async fn drive_data(self: Arc<Self>, mut events: ChannelEvents) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ChannelEvent::Message(msg) => {
                    let reaction = self.dispatch(msg);
                    self.react(reaction).await;
                }
                ChannelEvent::Malformed(_) => {
                    self.react(Reaction::Reply(Command::InvalidCommand.into()))
                        .await;
                }
                ChannelEvent::StateChanged(ChannelState::CommunicationError) => {
                    self.on_communication_error();
                }
                ChannelEvent::StateChanged(_) => {}
            }
        }
    }

    /// Por el canal de comandos solo viajan avisos del worker.
    async fn drive_command(self: Arc<Self>, channel: Channel, mut events: ChannelEvents) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let reaction = match event {
                ChannelEvent::Message(Message::Command(Command::Ping)) => {
                    let _ = channel.send(Command::PingAck).await;
                    continue;
                }
                ChannelEvent::Message(Message::Command(Command::IdleStatsAvailable)) => {
                    let mut core = self.core();
                    core.has_idle_stats = true;
                    if core.state == ResourceState::Ready {
                        Reaction::RequestIdleStats
                    } else {
                        Reaction::Nothing
                    }
                }
                ChannelEvent::Message(Message::Command(Command::GoingOffline)) => {
                    Reaction::Disconnect
                }
                ChannelEvent::Message(_) | ChannelEvent::Malformed(_) => {
                    warn!(resource = self.id, "mensaje inesperado en el canal de comandos");
                    let _ = channel.send(Command::InvalidCommand).await;
                    continue;
                }
                ChannelEvent::StateChanged(ChannelState::CommunicationError) => {
                    self.on_communication_error();
                    continue;
                }
                ChannelEvent::StateChanged(_) => continue,
            };
            self.react(reaction).await;
        }
    }

    async fn react(self: &Arc<Self>, reaction: Reaction) {
        match reaction {
            Reaction::Nothing => {}
            Reaction::Reply(msg) => {
                if let Err(e) = self.data.send(msg).await {
                    debug!(resource = self.id, "no se pudo responder: {}", e);
                }
            }
            Reaction::RequestIdleStats => {
                self.request_idle_stats();
            }
            Reaction::Disconnect => {
                info!(resource = self.id, "el worker se desconecta");
                self.disconnect().await;
            }
        }
    }

    fn dispatch(&self, msg: Message) -> Reaction {
        let mut core = self.core();
        match msg {
            Message::Command(Command::Ping) => Reaction::Reply(Command::PingAck.into()),
            Message::Command(Command::PingAck) => Reaction::Nothing,
            Message::Command(cmd) => {
                if let Expect::Payload(waiting) = core.expect {
                    warn!(
                        resource = self.id,
                        "se esperaba el payload de {:?} y llegó {:?}",
                        waiting,
                        cmd
                    );
                    return Reaction::Reply(Command::InvalidCommand.into());
                }
                self.on_command(&mut core, cmd)
            }
            Message::Payload(payload) => {
                let Expect::Payload(cmd) = core.expect else {
                    warn!(resource = self.id, "payload fuera de fase en {}", core.state);
                    return Reaction::Reply(Command::InvalidCommand.into());
                };
                core.expect = Expect::Command;
                self.on_payload(&mut core, cmd, payload)
            }
        }
    }

    fn on_command(&self, core: &mut Core, cmd: Command) -> Reaction {
        let state = core.state;
        match cmd {
            Command::ClientKey | Command::Credentials if state == ResourceState::Authorizing => {
                core.expect = Expect::Payload(cmd);
            }
            Command::Capabilities | Command::StateChanged => core.expect = Expect::Payload(cmd),
            Command::SendingResults if state == ResourceState::FinishingTask => {
                core.expect = Expect::Payload(cmd);
            }
            Command::SendingIdleTime | Command::SendingNonidleTime
                if state == ResourceState::SendingIdleStats =>
            {
                core.expect = Expect::Payload(cmd);
            }
            Command::TransferAck | Command::TransferNotModified | Command::Error
                if state == ResourceState::TaskAssigned && core.transfer_tx.is_some() =>
            {
                let reply = match cmd {
                    Command::TransferAck => TransferReply::Ack,
                    Command::TransferNotModified => TransferReply::NotModified,
                    _ => TransferReply::Rejected,
                };
                if let Some(tx) = &core.transfer_tx {
                    let _ = tx.send(reply);
                }
            }
            Command::IdleStatsAvailable => {
                core.has_idle_stats = true;
                if state == ResourceState::Ready {
                    return Reaction::RequestIdleStats;
                }
            }
            Command::GoingOffline => return Reaction::Disconnect,
            Command::InvalidCommand => {
                warn!(resource = self.id, "el worker rechazó un comando en {}", state)
            }
            Command::Error => warn!(resource = self.id, "el worker reportó un error en {}", state),
            other => {
                warn!(resource = self.id, "comando {:?} fuera de fase en {}", other, state);
                return Reaction::Reply(Command::InvalidCommand.into());
            }
        }
        Reaction::Nothing
    }

    fn on_payload(&self, core: &mut Core, cmd: Command, payload: Payload) -> Reaction {
        match (cmd, payload) {
            (Command::ClientKey, Payload::ClientKey { key, secret }) => {
                core.key_pair = Some((key, secret));
            }
            (Command::Credentials, Payload::Credentials(credentials)) => {
                core.provided = Some(credentials);
                self.credentials_ready.notify_one();
            }
            (Command::Capabilities, Payload::Capabilities(caps)) => core.reported = caps,
            (Command::StateChanged, Payload::State(state)) => self.on_worker_state(core, state),
            (Command::SendingResults, Payload::Result(value)) => {
                if let Some(task) = core.task.as_mut() {
                    info!(resource = self.id, task = task.id, "resultado recibido");
                    task.result = Some(value);
                }
                self.release(core, TaskState::Completed);
                self.set_state(core, ResourceState::TaskCompleted);
            }
            (Command::SendingIdleTime, Payload::Timestamp(at)) => {
                if let Some(profile) = &core.profile {
                    lock(profile).record_idle(&at.with_timezone(&Local), true);
                }
            }
            (Command::SendingNonidleTime, Payload::Timestamp(at)) => {
                if let Some(profile) = &core.profile {
                    lock(profile).record_idle(&at.with_timezone(&Local), false);
                }
            }
            (cmd, _) => {
                warn!(resource = self.id, "payload inválido para {:?}", cmd);
                return Reaction::Reply(Command::InvalidCommand.into());
            }
        }
        Reaction::Nothing
    }

    /// Refleja los estados que reporta el worker, solo si tienen sentido
    /// desde el estado actual.
    fn on_worker_state(&self, core: &mut Core, reported: ResourceState) {
        use ResourceState::*;
        if !reported.is_mirrored() {
            debug!(resource = self.id, "estado {} del worker", reported);
            return;
        }

        match (core.state, reported) {
            (TaskAssigned, RunningTask) | (RunningTask, FinishingTask) => {
                self.set_state(core, reported);
            }
            (current, TaskTerminated) if current.holds_task() => {
                self.release(core, TaskState::Terminated);
                self.set_state(core, TaskTerminated);
            }
            (current, TaskEndedAbnormally) | (current, TaskCompleted) if current.holds_task() => {
                // un TASK_COMPLETED sin resultado tampoco sirve
                self.release(core, TaskState::Troubled);
                self.set_state(core, TaskEndedAbnormally);
            }
            (current, Ready) if current.settles_to_ready() => self.set_state(core, Ready),
            (current, reported) if current == reported => {}
            (current, reported) => {
                debug!(resource = self.id, "estado {} ignorado en {}", reported, current);
            }
        }
    }

    fn on_communication_error(&self) {
        let mut core = self.core();
        if matches!(
            core.state,
            ResourceState::Disconnecting
                | ResourceState::NotConnected
                | ResourceState::Troubled
                | ResourceState::AuthorizationFailure
        ) {
            return;
        }
        warn!(resource = self.id, "se perdió la conexión en {}", core.state);
        self.release(&mut core, TaskState::Troubled);
        self.set_state(&mut core, ResourceState::Troubled);
    }

    async fn disconnect(&self) {
        {
            let mut core = self.core();
            if self.shutdown.is_cancelled() {
                return;
            }
            self.shutdown.cancel();
            self.release(&mut core, TaskState::Troubled);
            self.set_state(&mut core, ResourceState::Disconnecting);
            if let Some(key) = core.client_key.take() {
                self.ctx.correlation.forget(key);
            }
        }

        let command = lock(&self.command).take();
        if let Some(channel) = command {
            channel.close().await;
        }
        self.data.close().await;

        let mut core = self.core();
        self.set_state(&mut core, ResourceState::NotConnected);
    }
}
