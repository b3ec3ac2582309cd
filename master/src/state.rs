// master/src/state.rs

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use common::{lock, Job, ResourceId, Task, TaskId};

use crate::resource::ResourceHandle;

/// Estado compartido del scheduler. Cada estructura tiene su propio lock,
/// que se toma solo durante la mutación y nunca a través de un `.await`.
#[derive(Clone)]
pub struct SchedulerState {
    pub resources: Arc<Mutex<HashMap<ResourceId, ResourceHandle>>>,
    // recursos en READY, en orden de llegada
    pub ready: Arc<Mutex<VecDeque<ResourceId>>>,
    // tareas vencidas que esperan otro recurso
    pub reassign: Arc<Mutex<VecDeque<Task>>>,
    // tarea -> recursos que la están corriendo
    pub assignments: Arc<Mutex<HashMap<TaskId, BTreeSet<ResourceId>>>>,
    // tareas cuyo cancelamiento pidió el job
    pub cancelled: Arc<Mutex<HashSet<TaskId>>>,
    pub job: Arc<Mutex<Option<Box<dyn Job>>>>,
    pub backlog: Arc<Mutex<VecDeque<Box<dyn Job>>>>,
    /// Pide cortar la pasada de delegación en curso.
    pub stop: Arc<AtomicBool>,
    pub max_task_holders: usize,
}

impl SchedulerState {
    pub fn new(max_task_holders: usize) -> Self {
        Self {
            resources: Arc::new(Mutex::new(HashMap::new())),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            reassign: Arc::new(Mutex::new(VecDeque::new())),
            assignments: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            job: Arc::new(Mutex::new(None)),
            backlog: Arc::new(Mutex::new(VecDeque::new())),
            stop: Arc::new(AtomicBool::new(false)),
            max_task_holders: max_task_holders.max(1),
        }
    }

    pub fn resource(&self, id: ResourceId) -> Option<ResourceHandle> {
        lock(&self.resources).get(&id).cloned()
    }

    /// Encola al final si no estaba.
    pub fn push_ready(&self, id: ResourceId) -> bool {
        let mut ready = lock(&self.ready);
        if ready.contains(&id) {
            return false;
        }
        ready.push_back(id);
        true
    }

    pub fn remove_ready(&self, id: ResourceId) {
        lock(&self.ready).retain(|r| *r != id);
    }

    pub fn ready_ids(&self) -> Vec<ResourceId> {
        lock(&self.ready).iter().copied().collect()
    }

    pub fn holders(&self, task: TaskId) -> Vec<ResourceId> {
        lock(&self.assignments)
            .get(&task)
            .map(|row| row.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_queued_for_reassign(&self, task: TaskId) -> bool {
        lock(&self.reassign).iter().any(|t| t.id == task)
    }

    /// Pendientes del job activo más las reasignaciones.
    pub fn outstanding(&self) -> (usize, usize) {
        let remaining = lock(&self.job)
            .as_ref()
            .map(|job| job.remaining_count())
            .unwrap_or(0);
        let reassign = lock(&self.reassign).len();
        (remaining, reassign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queue_keeps_each_resource_once() {
        let state = SchedulerState::new(2);
        assert!(state.push_ready(1));
        assert!(state.push_ready(2));
        assert!(!state.push_ready(1));
        assert_eq!(state.ready_ids(), vec![1, 2]);

        state.remove_ready(1);
        assert_eq!(state.ready_ids(), vec![2]);
    }

    #[test]
    fn holder_cap_is_at_least_one() {
        assert_eq!(SchedulerState::new(0).max_task_holders, 1);
    }
}
