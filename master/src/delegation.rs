// master/src/delegation.rs

use std::sync::atomic::Ordering;

use common::{lock, ResourceId, Task, TaskId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resource::ResourceHandle;
use crate::state::SchedulerState;

#[derive(Debug, Clone, PartialEq)]
pub enum DelegationOrder {
    Pass,
    /// Cancelar esas tareas en todos sus recursos (`None` = todas).
    Cancel(Option<Vec<TaskId>>),
}

/// Unidad de trabajo elegida para un recurso.
#[derive(Debug)]
enum Pick {
    Fresh(Task),
    Reassigned(Task),
}

impl Pick {
    fn task(&self) -> &Task {
        match self {
            Pick::Fresh(t) | Pick::Reassigned(t) => t,
        }
    }
}

/// Loop de delegación: una sola pasada a la vez. Los pedidos que se
/// acumulan mientras corre una pasada se juntan en la siguiente.
pub async fn run_delegation_loop(
    state: SchedulerState,
    mut orders: mpsc::UnboundedReceiver<DelegationOrder>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            order = orders.recv() => match order {
                Some(order) => order,
                None => break,
            },
        };

        let mut batch = vec![first];
        while let Ok(more) = orders.try_recv() {
            batch.push(more);
        }

        let mut pass = false;
        for order in batch {
            match order {
                DelegationOrder::Pass => pass = true,
                DelegationOrder::Cancel(tasks) => {
                    let sent = cancel(&state, tasks);
                    info!("cancelación enviada a {} recursos", sent);
                    state.stop.store(false, Ordering::SeqCst);
                }
            }
        }

        if pass {
            let assigned = delegate_once(&state);
            if assigned > 0 {
                debug!("pasada de delegación: {} asignaciones", assigned);
            }
        }
    }
    debug!("loop de delegación terminado");
}

/// Una pasada: empareja recursos listos con trabajo hasta que se acabe
/// alguno de los dos. Devuelve cuántas tareas se asignaron.
pub fn delegate_once(state: &SchedulerState) -> usize {
    let mut assigned = 0;
    // trabajo que ningún recurso listo acepta en esta pasada
    let mut parked: Vec<Pick> = Vec::new();

    loop {
        if state.stop.load(Ordering::SeqCst) {
            info!("pasada de delegación cortada");
            break;
        }
        if lock(&state.ready).is_empty() {
            break;
        }

        let Some(pick) = next_work(state) else {
            break;
        };
        let task_id = pick.task().id;

        let Some((rid, handle)) = take_ready(state, pick.task(), false) else {
            debug!(task = task_id, "ningún recurso listo cumple los requisitos");
            parked.push(pick);
            continue;
        };

        let (target, handle) = if handle.avoids(task_id) {
            match take_ready(state, pick.task(), true) {
                Some(other) => {
                    lock(&state.ready).push_back(rid);
                    other
                }
                None => {
                    queue_duplicate(state, pick.task());
                    (rid, handle)
                }
            }
        } else {
            (rid, handle)
        };

        // la fila va antes de asignar: la respuesta puede llegar enseguida
        lock(&state.assignments)
            .entry(task_id)
            .or_default()
            .insert(target);

        if handle.assign_task(pick.task().clone()) {
            assigned += 1;
        } else {
            debug!(resource = target, task = task_id, "el recurso dejó de estar listo");
            drop_holder(state, task_id, target);
            give_back(state, pick);
        }
    }

    // vuelven al frente en el orden en que salieron
    for pick in parked.into_iter().rev() {
        give_back(state, pick);
    }

    assigned
}

/// Prefiere las reasignaciones, salvo las que ya resolvió otro recurso.
fn next_work(state: &SchedulerState) -> Option<Pick> {
    loop {
        let Some(task) = lock(&state.reassign).pop_front() else {
            break;
        };
        if lock(&state.assignments).contains_key(&task.id) {
            return Some(Pick::Reassigned(task));
        }
        debug!(task = task.id, "reasignación descartada: la tarea ya terminó");
    }

    lock(&state.job)
        .as_mut()
        .and_then(|job| job.next_ready_task())
        .map(Pick::Fresh)
}

fn give_back(state: &SchedulerState, pick: Pick) {
    match pick {
        Pick::Fresh(task) => {
            if let Some(job) = lock(&state.job).as_mut() {
                job.return_task(task);
            }
        }
        Pick::Reassigned(task) => lock(&state.reassign).push_front(task),
    }
}

fn drop_holder(state: &SchedulerState, task: TaskId, resource: ResourceId) {
    let mut assignments = lock(&state.assignments);
    if let Some(row) = assignments.get_mut(&task) {
        row.remove(&resource);
        if row.is_empty() {
            assignments.remove(&task);
        }
    }
}

/// Saca de la cola el primer recurso listo que cumpla los requisitos de la
/// tarea y, con `skip_avoiding`, que no la evite. Las entradas viejas se
/// descartan al pasar.
fn take_ready(
    state: &SchedulerState,
    task: &Task,
    skip_avoiding: bool,
) -> Option<(ResourceId, ResourceHandle)> {
    for id in state.ready_ids() {
        let handle = match state.resource(id) {
            Some(handle) if handle.is_ready() => handle,
            _ => {
                state.remove_ready(id);
                continue;
            }
        };
        if (skip_avoiding && handle.avoids(task.id))
            || !task.requirements().is_met_by(&handle.capabilities())
        {
            continue;
        }
        let mut ready = lock(&state.ready);
        if let Some(pos) = ready.iter().position(|r| *r == id) {
            ready.remove(pos);
            return Some((id, handle));
        }
    }
    None
}

/// Todos los listos evitan la tarea: se asigna igual y se encola una copia
/// para que otro recurso la intente en paralelo.
fn queue_duplicate(state: &SchedulerState, task: &Task) {
    let holders = state.holders(task.id).len();
    if holders + 1 >= state.max_task_holders || state.is_queued_for_reassign(task.id) {
        return;
    }
    warn!(task = task.id, "todos los recursos listos evitan la tarea; se duplica");
    lock(&state.reassign).push_back(task.clone());
}

/// Manda `cancel_task` a cada recurso que tenga esas tareas. Las tareas
/// quedan marcadas para que su fin no vuelva a encolarlas.
pub fn cancel(state: &SchedulerState, tasks: Option<Vec<TaskId>>) -> usize {
    let rows: Vec<(TaskId, Vec<ResourceId>)> = {
        let assignments = lock(&state.assignments);
        match &tasks {
            Some(ids) => ids
                .iter()
                .filter_map(|id| {
                    assignments
                        .get(id)
                        .map(|row| (*id, row.iter().copied().collect()))
                })
                .collect(),
            None => assignments
                .iter()
                .map(|(id, row)| (*id, row.iter().copied().collect()))
                .collect(),
        }
    };

    {
        let ids: Vec<TaskId> = rows.iter().map(|(id, _)| *id).collect();
        lock(&state.reassign).retain(|t| !ids.contains(&t.id));
        lock(&state.cancelled).extend(ids);
    }

    let mut sent = 0;
    for (task, holders) in rows {
        for rid in holders {
            if let Some(handle) = state.resource(rid) {
                if handle.cancel_task(task) {
                    sent += 1;
                }
            }
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BatchJob, Job, Work};
    use serde_json::json;

    fn sleeper(v: i64) -> Task {
        Task::new("", Work::Sleep {
            millis: 1,
            value: json!(v),
        })
    }

    fn with_job(tasks: Vec<Task>) -> SchedulerState {
        let state = SchedulerState::new(2);
        let mut job = BatchJob::new("prueba", tasks);
        job.make_ready();
        *lock(&state.job) = Some(Box::new(job));
        state
    }

    #[test]
    fn reassignments_come_before_fresh_tasks() {
        let state = with_job(vec![sleeper(1)]);
        let mut late = sleeper(9);
        late.id = 999;
        lock(&state.assignments).entry(999).or_default().insert(4);
        lock(&state.reassign).push_back(late);

        assert!(matches!(next_work(&state), Some(Pick::Reassigned(t)) if t.id == 999));
        assert!(matches!(next_work(&state), Some(Pick::Fresh(_))));
        assert!(next_work(&state).is_none());
    }

    #[test]
    fn finished_reassignments_are_dropped() {
        let state = with_job(vec![]);
        lock(&state.reassign).push_back(sleeper(1));
        assert!(next_work(&state).is_none());
        assert!(lock(&state.reassign).is_empty());
    }

    #[test]
    fn unplaced_work_goes_back_to_the_front() {
        let state = with_job(vec![sleeper(1), sleeper(2)]);
        let first = next_work(&state).unwrap();
        let first_id = first.task().id;
        give_back(&state, first);
        assert_eq!(next_work(&state).unwrap().task().id, first_id);

        let mut late = sleeper(3);
        late.id = 77;
        lock(&state.assignments).entry(77).or_default().insert(1);
        give_back(&state, Pick::Reassigned(late));
        assert_eq!(lock(&state.reassign).front().map(|t| t.id), Some(77));
    }

    #[test]
    fn duplicates_respect_the_holder_cap() {
        let state = SchedulerState::new(2);
        let task = sleeper(1);

        // sin titulares: el que se asigna ahora más la copia llegan a 2
        queue_duplicate(&state, &task);
        assert!(state.is_queued_for_reassign(task.id));

        // ya hay una copia encolada
        queue_duplicate(&state, &task);
        assert_eq!(lock(&state.reassign).len(), 1);

        lock(&state.reassign).clear();
        lock(&state.assignments).entry(task.id).or_default().insert(1);
        queue_duplicate(&state, &task);
        assert!(!state.is_queued_for_reassign(task.id));
    }

    #[test]
    fn empty_pass_assigns_nothing() {
        let state = with_job(vec![sleeper(1)]);
        assert_eq!(delegate_once(&state), 0);
        assert_eq!(lock(&state.job).as_ref().unwrap().remaining_count(), 1);
    }

    #[test]
    fn refused_work_keeps_its_order_after_the_pass() {
        let state = with_job(vec![sleeper(1), sleeper(2)]);
        let mut late = sleeper(3);
        late.id = 77;
        lock(&state.assignments).entry(77).or_default().insert(5);
        lock(&state.reassign).push_back(late);
        // entrada vieja: el recurso ya no existe
        state.push_ready(42);

        assert_eq!(delegate_once(&state), 0);
        assert!(state.ready_ids().is_empty());
        assert!(matches!(next_work(&state), Some(Pick::Reassigned(t)) if t.id == 77));
        let Some(Pick::Fresh(first)) = next_work(&state) else {
            panic!("se esperaba una tarea nueva");
        };
        assert_eq!(first.work, sleeper(1).work);
        assert_eq!(lock(&state.job).as_ref().unwrap().remaining_count(), 2);
    }

    #[test]
    fn cancel_marks_rows_and_drops_reassignments() {
        let state = SchedulerState::new(2);
        let task = sleeper(1);
        lock(&state.assignments).entry(task.id).or_default().insert(3);
        lock(&state.reassign).push_back(task.clone());

        // el recurso 3 ya no existe: no hay a quién mandarle nada
        assert_eq!(cancel(&state, None), 0);
        assert!(lock(&state.reassign).is_empty());
        assert!(lock(&state.cancelled).contains(&task.id));
    }
}
