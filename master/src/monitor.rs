// master/src/monitor.rs

use std::sync::atomic::Ordering;

use common::{JobEvent, JobState, ResourceState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::delegation::DelegationOrder;
use crate::failover::{self, Reclaimed};
use crate::launcher;
use crate::resource::ResourceEvent;
use crate::scheduler::Scheduler;

/// Loop principal del scheduler: reacciona a los avisos de los recursos y
/// de los jobs. Todo lo que cambia el estado compartido pasa por acá o por
/// la pasada de delegación.
pub async fn run_monitor(
    sched: Scheduler,
    mut resources: mpsc::UnboundedReceiver<ResourceEvent>,
    mut jobs: mpsc::UnboundedReceiver<JobEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = resources.recv() => on_resource_event(&sched, event),
            Some(event) = jobs.recv() => on_job_event(&sched, event),
            else => break,
        }
    }
    debug!("monitor terminado");
}

fn on_resource_event(sched: &Scheduler, event: ResourceEvent) {
    match event {
        ResourceEvent::StateChanged { resource, state } => {
            sched.publish_state(resource, state);
            match state {
                ResourceState::Ready => {
                    let Some(handle) = sched.resource(resource) else {
                        return;
                    };
                    // primero las estadísticas pendientes; volverá a READY después
                    if handle.has_idle_stats() && handle.request_idle_stats() {
                        return;
                    }
                    if sched.state.push_ready(resource) {
                        debug!(resource, "recurso en la cola de listos");
                    }
                    sched.trigger();
                }
                ResourceState::AuthorizationFailure
                | ResourceState::Troubled
                | ResourceState::NotConnected => sched.remove_resource(resource),
                _ => sched.state.remove_ready(resource),
            }
        }
        ResourceEvent::TaskReleased { resource, task } => {
            match failover::on_task_released(&sched.state, resource, task) {
                Reclaimed::Completed | Reclaimed::Returned => sched.trigger(),
                Reclaimed::Dropped | Reclaimed::Ignored => {}
            }
        }
        ResourceEvent::TaskTimedOut { resource, task } => {
            if failover::on_task_timed_out(&sched.state, resource, task) {
                sched.trigger();
            }
        }
    }
}

fn on_job_event(sched: &Scheduler, event: JobEvent) {
    match event {
        JobEvent::StateChanged {
            job,
            state: JobState::Ready,
        } => {
            info!(job = %job, "job listo, delegando");
            sched.trigger();
            if sched.launcher().is_some() {
                let sched = sched.clone();
                tokio::spawn(async move {
                    let launched = launcher::search_clients(&sched).await;
                    if launched > 0 {
                        info!("{} workers lanzados", launched);
                    }
                });
            }
        }
        JobEvent::StateChanged {
            job,
            state: JobState::Completed,
        } => sched.finish_job(&job),
        JobEvent::StateChanged { job, state } => debug!(job = %job, "job en {:?}", state),
        JobEvent::CancelTasks { job, tasks } => {
            info!(job = %job, "el job pide cancelar {} tareas", tasks.len());
            sched.state.stop.store(true, Ordering::SeqCst);
            sched.order(DelegationOrder::Cancel(Some(tasks)));
        }
        JobEvent::CancelAll { job } => {
            info!(job = %job, "el job pide cancelar todas sus tareas");
            sched.state.stop.store(true, Ordering::SeqCst);
            sched.order(DelegationOrder::Cancel(None));
        }
    }
}
