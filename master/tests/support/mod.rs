#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use common::transfer::ReplyWait;
use common::{
    random_key, Capabilities, Channel, ChannelConfig, ChannelEvent, ChannelEvents, Command,
    Credentials, JobId, JobReport, Message, Payload, ResourceId, ResourceState, Task,
};
use master::{discovery, Listeners, MasterConfig, ResourceTiming, Roster, Scheduler};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use worker::{SessionEnd, WorkerConfig};

pub const WAIT: Duration = Duration::from_secs(10);
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn credentials() -> Credentials {
    Credentials::new("grid", "grid")
}

pub fn fast_channel() -> ChannelConfig {
    ChannelConfig::default()
        .with_backoff(Duration::from_millis(20))
        .with_connect_timeout(Duration::from_secs(2))
}

fn timing() -> ResourceTiming {
    ResourceTiming {
        credentials: ReplyWait {
            interval: Duration::from_millis(200),
            attempts: 5,
        },
        command_channel: Duration::from_secs(3),
        transfer: ReplyWait {
            interval: Duration::from_millis(500),
            attempts: 4,
        },
    }
}

/// Un master completo sobre loopback, con puertos efímeros.
pub struct Grid {
    pub sched: Scheduler,
    pub port: u16,
    pub shutdown: CancellationToken,
}

impl Grid {
    pub async fn start(max_task_holders: usize) -> Self {
        let listeners = Listeners::bind(LOCALHOST, 0).await.unwrap();
        let port = listeners.port().unwrap();
        let config = MasterConfig {
            host: LOCALHOST,
            port,
            ..MasterConfig::default()
        }
        .with_credentials(credentials())
        .with_timing(timing())
        .with_max_task_holders(max_task_holders);

        let shutdown = CancellationToken::new();
        let sched = Scheduler::start(config, Roster::empty(), None, shutdown.clone());
        discovery::spawn(sched.clone(), listeners, shutdown.clone());
        Self {
            sched,
            port,
            shutdown,
        }
    }

    pub fn worker_config(&self, password: &str, work_dir: &Path) -> WorkerConfig {
        WorkerConfig::new("127.0.0.1", self.port, Credentials::new("grid", password))
            .with_work_dir(work_dir)
            .with_idle_interval(Duration::from_secs(3600))
            .with_channel(fast_channel())
            .with_retries(0)
    }

    /// Un worker real, en su propia tarea.
    pub fn spawn_worker(&self, password: &str, work_dir: &Path) -> JoinHandle<worker::Result<SessionEnd>> {
        let config = self.worker_config(password, work_dir);
        let shutdown = self.shutdown.child_token();
        tokio::spawn(worker::run_session(config, shutdown))
    }

    pub async fn wait_ready(&self, count: usize) {
        let deadline = Instant::now() + WAIT;
        while self.sched.ready_ids().len() < count {
            assert!(Instant::now() < deadline, "no hay {} recursos listos", count);
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_report(&self, job: &JobId) -> JobReport {
        let mut reports = self.sched.reports();
        let found = timeout(WAIT, async {
            loop {
                let done = reports.borrow().iter().find(|r| r.job_id == *job).cloned();
                if let Some(report) = done {
                    return report;
                }
                reports.changed().await.unwrap();
            }
        })
        .await;
        found.expect("el job no terminó a tiempo")
    }

    pub async fn stop(self) {
        self.sched.shutdown().await;
    }
}

/// Espera a que algún recurso pase por `wanted`.
pub async fn wait_state(
    states: &mut broadcast::Receiver<(ResourceId, ResourceState)>,
    wanted: ResourceState,
) -> ResourceId {
    timeout(WAIT, async {
        loop {
            let (id, state) = states.recv().await.unwrap();
            if state == wanted {
                return id;
            }
        }
    })
    .await
    .expect("el estado no llegó a tiempo")
}

/// Worker guionado: cada paso del protocolo lo decide el test.
pub struct FakeWorker {
    pub id: ResourceId,
    pub data: Channel,
    pub rx: ChannelEvents,
    pub command: Channel,
}

impl FakeWorker {
    pub async fn join(port: u16, caps: Capabilities) -> Self {
        Self::join_as(port, caps, random_key(), 0).await
    }

    /// Entra con la clave y el secreto de un lanzamiento registrado.
    pub async fn join_as(port: u16, caps: Capabilities, key: u32, secret: u32) -> Self {
        let (data, mut rx) = Channel::to_peer(SocketAddr::new(LOCALHOST, port), fast_channel());
        data.connect().await.unwrap();
        assert_eq!(
            next_message(&mut rx).await,
            Message::Command(Command::RequestCredentials)
        );

        data.send_all(&[
            Command::ClientKey.into(),
            Payload::ClientKey { key, secret }.into(),
            Command::Credentials.into(),
            Payload::Credentials(credentials()).into(),
            Command::Capabilities.into(),
            Payload::Capabilities(caps).into(),
        ])
        .await
        .unwrap();

        assert_eq!(
            next_message(&mut rx).await,
            Message::Command(Command::SendingResourceId)
        );
        let Message::Payload(Payload::ResourceId(id)) = next_message(&mut rx).await else {
            panic!("se esperaba el id del recurso");
        };
        assert_eq!(
            next_message(&mut rx).await,
            Message::Command(Command::AuthorizationSucceeded)
        );

        let (command, _command_rx) =
            Channel::to_peer(SocketAddr::new(LOCALHOST, port + 1), fast_channel());
        command.connect().await.unwrap();
        command
            .send(Payload::ClientKey { key, secret })
            .await
            .unwrap();
        assert_eq!(
            next_message(&mut rx).await,
            Message::Command(Command::CommandChannelEstablished)
        );

        let worker = Self {
            id,
            data,
            rx,
            command,
        };
        worker.report(ResourceState::Ready).await;
        worker
    }

    pub async fn report(&self, state: ResourceState) {
        self.data
            .send_all(&[Command::StateChanged.into(), Payload::State(state).into()])
            .await
            .unwrap();
    }

    pub async fn next_message(&mut self) -> Message {
        next_message(&mut self.rx).await
    }

    /// Saltea mensajes hasta recibir una tarea y la empieza.
    pub async fn take_task(&mut self) -> Task {
        loop {
            if let Message::Payload(Payload::Task(task)) = self.next_message().await {
                self.report(ResourceState::RunningTask).await;
                return *task;
            }
        }
    }

    pub async fn expect_command(&mut self, wanted: Command) {
        loop {
            if self.next_message().await == Message::Command(wanted) {
                return;
            }
        }
    }

    pub async fn complete(&self, value: Value) {
        self.report(ResourceState::FinishingTask).await;
        self.data
            .send_all(&[Command::SendingResults.into(), Payload::Result(value).into()])
            .await
            .unwrap();
        self.report(ResourceState::TaskCompleted).await;
        self.report(ResourceState::Ready).await;
    }

    pub async fn terminated(&self) {
        self.report(ResourceState::TaskTerminated).await;
        self.report(ResourceState::Ready).await;
    }

    /// Espera la cabecera de un archivo y contesta `reply`.
    pub async fn answer_header(&mut self, reply: Command) {
        loop {
            if let Message::Payload(Payload::FileHeader(_)) = self.next_message().await {
                self.data.send(reply).await.unwrap();
                return;
            }
        }
    }

    /// Acepta la cabecera, recibe el archivo y lo rechaza después del
    /// checksum, como si no coincidiera.
    pub async fn fail_checksum(&mut self) {
        self.answer_header(Command::TransferAck).await;
        loop {
            if let Message::Payload(Payload::Checksum(_)) = self.next_message().await {
                self.data.send(Command::Error).await.unwrap();
                return;
            }
        }
    }

    /// `true` si entre lo recibido hasta ahora está `wanted`.
    pub fn saw_command(&mut self, wanted: Command) -> bool {
        let mut seen = false;
        while let Ok(event) = self.rx.try_recv() {
            if event == ChannelEvent::Message(Message::Command(wanted)) {
                seen = true;
            }
        }
        seen
    }

    /// `true` si hasta ahora no llegó ninguna tarea.
    pub fn got_no_task(&mut self) -> bool {
        while let Ok(event) = self.rx.try_recv() {
            if matches!(
                event,
                ChannelEvent::Message(Message::Command(Command::SendingTask))
                    | ChannelEvent::Message(Message::Payload(Payload::Task(_)))
            ) {
                return false;
            }
        }
        true
    }
}

pub async fn next_message(rx: &mut ChannelEvents) -> Message {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(ChannelEvent::Message(m)) => return m,
                Some(_) => continue,
                None => panic!("el canal se cerró"),
            }
        }
    })
    .await
    .expect("no llegó ningún mensaje")
}
