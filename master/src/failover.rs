// master/src/failover.rs

use common::{lock, ResourceId, Task, TaskState};
use tracing::{debug, info, warn};

use crate::state::SchedulerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimed {
    /// Primer resultado: se canceló al resto y el job lo recibió.
    Completed,
    /// Otros recursos siguen con la tarea; solo se quitó este.
    Dropped,
    /// Era el último titular: la tarea volvió al job.
    Returned,
    /// La fila ya no existía (duplicado tardío o tarea ya resuelta).
    Ignored,
}

/// Un recurso soltó una tarea:
/// - si la completó y es la primera vez, cancela al resto de los titulares,
///   borra la fila y entrega el resultado al job
/// - si falló, se quita de la fila; si era el último la tarea vuelve al job
pub fn on_task_released(state: &SchedulerState, resource: ResourceId, task: Task) -> Reclaimed {
    if task.state == TaskState::Completed {
        let Some(row) = lock(&state.assignments).remove(&task.id) else {
            debug!(resource, task = task.id, "resultado duplicado, se ignora");
            return Reclaimed::Ignored;
        };
        lock(&state.reassign).retain(|t| t.id != task.id);
        lock(&state.cancelled).remove(&task.id);

        for other in row.iter().copied().filter(|r| *r != resource) {
            match state.resource(other) {
                Some(handle) if handle.cancel_task(task.id) => {
                    info!(resource = other, task = task.id, "otro recurso ganó; cancelando")
                }
                _ => debug!(resource = other, task = task.id, "titular sin tarea en curso"),
            }
        }

        info!(resource, task = task.id, "tarea completada");
        store(state, task);
        return Reclaimed::Completed;
    }

    let last = {
        let mut assignments = lock(&state.assignments);
        let Some(row) = assignments.get_mut(&task.id) else {
            debug!(resource, task = task.id, "tarea ya resuelta, se ignora el fallo");
            return Reclaimed::Ignored;
        };
        row.remove(&resource);
        if row.is_empty() {
            assignments.remove(&task.id);
            true
        } else {
            false
        }
    };

    if !last {
        info!(resource, task = task.id, "falló un titular; la tarea sigue en otros recursos");
        return Reclaimed::Dropped;
    }

    lock(&state.reassign).retain(|t| t.id != task.id);
    let mut task = task;
    if lock(&state.cancelled).remove(&task.id) {
        // el job pidió cancelarla: no se reintenta
        task.state = TaskState::Problematic;
    } else {
        warn!(resource, task = task.id, "la tarea terminó como {:?}", task.state);
    }
    store(state, task);
    Reclaimed::Returned
}

/// Timeout de un titular: se encola una copia con el timeout aumentado,
/// si la tarea sigue viva, hay lugar para otro titular y no hay ya una copia.
pub fn on_task_timed_out(state: &SchedulerState, resource: ResourceId, mut task: Task) -> bool {
    let holders = state.holders(task.id).len();
    if holders == 0 {
        return false;
    }
    if holders >= state.max_task_holders {
        debug!(task = task.id, holders, "tope de titulares, no se reasigna");
        return false;
    }
    if state.is_queued_for_reassign(task.id) {
        return false;
    }

    task.increase_timeout();
    task.state = TaskState::Ready;
    task.result = None;
    warn!(
        resource,
        task = task.id,
        "reasignando tarea vencida (nuevo timeout {:?})",
        task.timeout()
    );
    lock(&state.reassign).push_back(task);
    true
}

fn store(state: &SchedulerState, task: Task) {
    let mut job = lock(&state.job);
    match job.as_mut() {
        Some(job) if *job.id() == task.job_id => job.store_task(task),
        _ => debug!(task = task.id, "la tarea es de un job que ya no está activo"),
    }
}
