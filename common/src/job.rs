use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::results::JobReport;
use crate::task::{Task, TaskId, TaskState};

pub type JobId = String;

/// Intentos fallidos antes de marcar una tarea como PROBLEMATIC.
pub const MAX_TASK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Ready,
    Running,
    Completed,
}

/// Notificaciones de un job hacia el scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StateChanged { job: JobId, state: JobState },
    CancelTasks { job: JobId, tasks: Vec<TaskId> },
    CancelAll { job: JobId },
}

/// Suscripción del scheduler. Si nadie escucha, los eventos se descartan.
#[derive(Debug, Clone, Default)]
pub struct JobListener(Option<mpsc::UnboundedSender<JobEvent>>);

impl JobListener {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn notify(&self, event: JobEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Contrato de un job: cómo se parte, cómo acumula resultados y cuándo termina.
/// El scheduler lo usa siempre detrás de un lock.
pub trait Job: Send {
    fn id(&self) -> &JobId;
    fn name(&self) -> &str;

    /// Parte el job en tareas y pasa a READY.
    fn make_ready(&mut self);
    fn next_ready_task(&mut self) -> Option<Task>;
    fn has_next_task(&self) -> bool;

    /// Devuelve una tarea según su estado (completada, fallida o para reencolar).
    fn store_task(&mut self, task: Task);

    /// Tarea sacada con `next_ready_task` que no se llegó a asignar.
    fn return_task(&mut self, task: Task);

    fn initial_count(&self) -> usize;
    fn remaining_count(&self) -> usize;
    fn completed_count(&self) -> usize;
    fn failed_count(&self) -> usize;
    fn final_result(&self) -> Option<Value>;
    fn state(&self) -> JobState;
    fn set_listener(&mut self, listener: JobListener);

    /// Pide cancelar tareas concretas (o todas) de las que están en vuelo.
    fn cancel_tasks(&self, tasks: Option<Vec<TaskId>>);

    fn report(&self) -> JobReport {
        JobReport::from_job(self)
    }
}

/* --------- Contabilidad compartida por los jobs --------- */

#[derive(Debug)]
pub enum Stored {
    Completed(Task),
    Requeued,
    /// Se agotaron los intentos. El job recibe la tarea para rescatar lo
    /// que lleve adentro.
    Problematic(Task),
    /// La tarea ya no estaba en vuelo (duplicado tardío).
    Ignored,
}

/// Cola de pendientes, tareas en vuelo e intentos. Controla la transición
/// de estado del job y avisa al listener.
#[derive(Debug)]
pub struct TaskPool {
    job: JobId,
    state: JobState,
    pending: VecDeque<Task>,
    in_flight: HashSet<TaskId>,
    attempts: HashMap<TaskId, u32>,
    failed: Vec<Task>,
    completed: usize,
    created: usize,
    max_attempts: u32,
    listener: JobListener,
}

impl TaskPool {
    pub fn new(job: JobId) -> Self {
        Self {
            job,
            state: JobState::New,
            pending: VecDeque::new(),
            in_flight: HashSet::new(),
            attempts: HashMap::new(),
            failed: Vec::new(),
            completed: 0,
            created: 0,
            max_attempts: MAX_TASK_ATTEMPTS,
            listener: JobListener::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn set_listener(&mut self, listener: JobListener) {
        self.listener = listener;
    }

    pub fn listener(&self) -> &JobListener {
        &self.listener
    }

    pub fn set_state(&mut self, state: JobState) {
        if self.state == state {
            return;
        }
        debug!(job = %self.job, "job {:?} -> {:?}", self.state, state);
        self.state = state;
        self.listener.notify(JobEvent::StateChanged {
            job: self.job.clone(),
            state,
        });
    }

    pub fn push(&mut self, mut task: Task) {
        task.state = TaskState::Ready;
        self.created += 1;
        self.pending.push_back(task);
    }

    pub fn next(&mut self) -> Option<Task> {
        if !matches!(self.state, JobState::Ready | JobState::Running) {
            return None;
        }
        let task = self.pending.pop_front()?;
        self.in_flight.insert(task.id);
        self.set_state(JobState::Running);
        Some(task)
    }

    pub fn has_next(&self) -> bool {
        matches!(self.state, JobState::Ready | JobState::Running) && !self.pending.is_empty()
    }

    pub fn give_back(&mut self, task: Task) {
        if self.in_flight.remove(&task.id) {
            self.pending.push_front(task);
        }
    }

    pub fn store(&mut self, mut task: Task) -> Stored {
        if !self.in_flight.remove(&task.id) {
            debug!(job = %self.job, task = task.id, "tarea ya resuelta, se ignora");
            return Stored::Ignored;
        }

        match task.state {
            TaskState::Completed => {
                self.completed += 1;
                Stored::Completed(task)
            }
            TaskState::Terminated | TaskState::Troubled | TaskState::Problematic => {
                let attempts = self.attempts.entry(task.id).or_insert(0);
                *attempts += 1;
                task.attempt = *attempts;

                if task.state == TaskState::Problematic || *attempts >= self.max_attempts {
                    warn!(
                        job = %self.job,
                        task = task.id,
                        "tarea superó el máximo de intentos ({}), queda PROBLEMATIC",
                        self.max_attempts
                    );
                    task.state = TaskState::Problematic;
                    self.failed.push(task.clone());
                    Stored::Problematic(task)
                } else {
                    info!(
                        job = %self.job,
                        task = task.id,
                        "reencolando tarea (attempt={})",
                        task.attempt
                    );
                    task.state = TaskState::Ready;
                    self.pending.push_back(task);
                    Stored::Requeued
                }
            }
            TaskState::Ready | TaskState::Running => {
                task.state = TaskState::Ready;
                self.pending.push_back(task);
                Stored::Requeued
            }
        }
    }

    /// Nada pendiente ni en vuelo.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.in_flight.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> &[Task] {
        &self.failed
    }

    pub fn created(&self) -> usize {
        self.created
    }

    pub fn request_cancel(&self, tasks: Option<Vec<TaskId>>) {
        let event = match tasks {
            Some(tasks) => JobEvent::CancelTasks {
                job: self.job.clone(),
                tasks,
            },
            None => JobEvent::CancelAll {
                job: self.job.clone(),
            },
        };
        self.listener.notify(event);
    }
}

/* --------- Job de lista fija --------- */

/// Job con una lista fija de tareas. El resultado final es el arreglo de
/// resultados ordenado por id de tarea.
pub struct BatchJob {
    name: String,
    template: Vec<Task>,
    pool: TaskPool,
    results: BTreeMap<TaskId, Value>,
}

impl BatchJob {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let template = tasks
            .into_iter()
            .map(|mut t| {
                t.job_id = id.clone();
                t
            })
            .collect();
        Self {
            name: name.into(),
            template,
            pool: TaskPool::new(id),
            results: BTreeMap::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.pool = self.pool.with_max_attempts(max_attempts);
        self
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.template.iter().map(|t| t.id).collect()
    }

    pub fn results(&self) -> &BTreeMap<TaskId, Value> {
        &self.results
    }

    fn check_done(&mut self) {
        if self.pool.state() != JobState::New && self.pool.is_drained() {
            info!(job = %self.pool.job_id(), "job {} completo", self.name);
            self.pool.set_state(JobState::Completed);
        }
    }
}

impl Job for BatchJob {
    fn id(&self) -> &JobId {
        self.pool.job_id()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn make_ready(&mut self) {
        if self.pool.state() != JobState::New {
            return;
        }
        for task in &self.template {
            self.pool.push(task.clone());
        }
        self.pool.set_state(JobState::Ready);
        self.check_done();
    }

    fn next_ready_task(&mut self) -> Option<Task> {
        self.pool.next()
    }

    fn has_next_task(&self) -> bool {
        self.pool.has_next()
    }

    fn store_task(&mut self, task: Task) {
        if let Stored::Completed(task) = self.pool.store(task) {
            self.results
                .insert(task.id, task.result.unwrap_or(Value::Null));
        }
        self.check_done();
    }

    fn return_task(&mut self, task: Task) {
        self.pool.give_back(task);
    }

    fn initial_count(&self) -> usize {
        self.template.len()
    }

    fn remaining_count(&self) -> usize {
        self.pool.pending_len() + self.pool.in_flight_len()
    }

    fn completed_count(&self) -> usize {
        self.pool.completed()
    }

    fn failed_count(&self) -> usize {
        self.pool.failed().len()
    }

    fn final_result(&self) -> Option<Value> {
        if self.pool.state() != JobState::Completed {
            return None;
        }
        Some(Value::Array(self.results.values().cloned().collect()))
    }

    fn state(&self) -> JobState {
        self.pool.state()
    }

    fn set_listener(&mut self, listener: JobListener) {
        self.pool.set_listener(listener);
    }

    fn cancel_tasks(&self, tasks: Option<Vec<TaskId>>) {
        self.pool.request_cancel(tasks);
    }
}
