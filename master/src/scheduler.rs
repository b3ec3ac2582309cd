// master/src/scheduler.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{
    lock, Channel, ChannelEvents, Job, JobEvent, JobId, JobListener, JobReport, ResourceId,
    ResourceState, TaskId,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MasterConfig;
use crate::correlation::CorrelationTable;
use crate::delegation::{run_delegation_loop, DelegationOrder};
use crate::launcher::WorkerLauncher;
use crate::monitor::run_monitor;
use crate::resource::{ResourceContext, ResourceHandle};
use crate::roster::Roster;
use crate::state::SchedulerState;

const STATE_LOG_CAPACITY: usize = 1024;

/// Punto de entrada del master: recursos, jobs y el loop de delegación.
#[derive(Clone)]
pub struct Scheduler {
    pub state: SchedulerState,
    ctx: Arc<ResourceContext>,
    config: Arc<MasterConfig>,
    roster: Arc<Roster>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    orders: mpsc::UnboundedSender<DelegationOrder>,
    job_tx: mpsc::UnboundedSender<JobEvent>,
    reports: Arc<watch::Sender<Vec<JobReport>>>,
    states: broadcast::Sender<(ResourceId, ResourceState)>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Arranca el monitor y el loop de delegación. Ambos terminan con `shutdown`.
    pub fn start(
        config: MasterConfig,
        roster: Roster,
        launcher: Option<Arc<dyn WorkerLauncher>>,
        shutdown: CancellationToken,
    ) -> Self {
        let (resource_tx, resource_rx) = mpsc::unbounded_channel();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (orders, orders_rx) = mpsc::unbounded_channel();
        let (reports, _) = watch::channel(Vec::new());
        let (states, _) = broadcast::channel(STATE_LOG_CAPACITY);

        let ctx = Arc::new(ResourceContext {
            credentials: config.credentials.clone(),
            timing: config.timing,
            correlation: Arc::new(CorrelationTable::new(config.pending_key_ttl)),
            events: resource_tx,
        });

        let sched = Self {
            state: SchedulerState::new(config.max_task_holders),
            ctx,
            config: Arc::new(config),
            roster: Arc::new(roster),
            launcher,
            orders,
            job_tx,
            reports: Arc::new(reports),
            states,
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown: shutdown.clone(),
        };

        tokio::spawn(run_delegation_loop(
            sched.state.clone(),
            orders_rx,
            shutdown.clone(),
        ));
        tokio::spawn(run_monitor(sched.clone(), resource_rx, job_rx, shutdown));
        sched
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn launcher(&self) -> Option<Arc<dyn WorkerLauncher>> {
        self.launcher.clone()
    }

    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.ctx.correlation
    }

    /// Registra un canal de datos recién aceptado y arranca su autorización.
    pub fn add_resource(&self, data: Channel, events: ChannelEvents) -> ResourceHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ResourceHandle::new(id, data, events, self.ctx.clone());
        lock(&self.state.resources).insert(id, handle.clone());
        handle.begin_authorization();
        handle
    }

    /// El primer job queda activo; los siguientes esperan en orden.
    pub fn add_job(&self, mut job: Box<dyn Job>) -> JobId {
        job.set_listener(JobListener::new(self.job_tx.clone()));
        let id = job.id().clone();

        let mut current = lock(&self.state.job);
        if current.is_none() {
            info!(job = %id, "job {} activo", job.name());
            job.make_ready();
            *current = Some(job);
        } else {
            info!(job = %id, "job {} en espera", job.name());
            lock(&self.state.backlog).push_back(job);
        }
        id
    }

    /// Pide una pasada de delegación.
    pub fn trigger(&self) {
        let _ = self.orders.send(DelegationOrder::Pass);
    }

    pub(crate) fn order(&self, order: DelegationOrder) {
        let _ = self.orders.send(order);
    }

    pub fn resource(&self, id: ResourceId) -> Option<ResourceHandle> {
        self.state.resource(id)
    }

    pub fn resource_count(&self) -> usize {
        lock(&self.state.resources).len()
    }

    pub fn ready_ids(&self) -> Vec<ResourceId> {
        self.state.ready_ids()
    }

    pub fn holders(&self, task: TaskId) -> Vec<ResourceId> {
        self.state.holders(task)
    }

    /// Reportes de los jobs terminados, en orden.
    pub fn reports(&self) -> watch::Receiver<Vec<JobReport>> {
        self.reports.subscribe()
    }

    /// Todos los cambios de estado de todos los recursos.
    pub fn watch_states(&self) -> broadcast::Receiver<(ResourceId, ResourceState)> {
        self.states.subscribe()
    }

    pub(crate) fn publish_state(&self, resource: ResourceId, state: ResourceState) {
        let _ = self.states.send((resource, state));
    }

    /// Saca el recurso del scheduler y lo desconecta en segundo plano.
    pub(crate) fn remove_resource(&self, id: ResourceId) {
        let removed = lock(&self.state.resources).remove(&id);
        self.state.remove_ready(id);
        let Some(handle) = removed else {
            return;
        };
        info!(resource = id, "recurso fuera ({})", handle.state());
        if let Some(profile) = handle.profile() {
            let hostname = lock(&profile).hostname.clone();
            self.roster.release(&hostname);
        }
        tokio::spawn(async move { handle.disconnect().await });
    }

    /// Publica el reporte del job activo y activa el siguiente del backlog.
    pub(crate) fn finish_job(&self, job: &JobId) {
        let report = {
            let mut current = lock(&self.state.job);
            let is_active = current.as_ref().map_or(false, |active| active.id() == job);
            if is_active {
                current.take().map(|finished| finished.report())
            } else {
                None
            }
        };
        let Some(report) = report else {
            debug!(job = %job, "aviso de un job que no es el activo");
            return;
        };

        info!(
            job = %job,
            "job {} terminado: {} completadas, {} fallidas",
            report.name,
            report.completed_tasks,
            report.failed_tasks
        );
        lock(&self.state.reassign).retain(|t| t.job_id != *job);
        self.reports.send_modify(|all| all.push(report));
        self.activate_next();
    }

    fn activate_next(&self) {
        let mut current = lock(&self.state.job);
        if current.is_some() {
            return;
        }
        let Some(mut job) = lock(&self.state.backlog).pop_front() else {
            return;
        };
        info!(job = %job.id(), "job {} activo", job.name());
        job.make_ready();
        *current = Some(job);
    }

    /// Corta los loops y desconecta a todos los recursos.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<ResourceHandle> = lock(&self.state.resources)
            .drain()
            .map(|(_, h)| h)
            .collect();
        lock(&self.state.ready).clear();
        for handle in handles {
            handle.disconnect().await;
        }
    }
}
