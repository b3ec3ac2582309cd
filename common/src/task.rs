use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::job::JobId;
use crate::transfer::{FileTransfer, RemoteDirectory};

pub type TaskId = u64;

/// Mapa de capacidades de un recurso ("os", "cpus", "memory_mb", ...).
pub type Capabilities = BTreeMap<String, Value>;

pub const CAP_OS: &str = "os";
pub const CAP_CPUS: &str = "cpus";
pub const CAP_MEMORY_MB: &str = "memory_mb";
pub const CAP_HOSTNAME: &str = "hostname";

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Running,
    Completed,
    Terminated,
    Troubled,
    /// Lo asigna el job: no se reintenta más.
    Problematic,
}

/* --------- Requisitos de una tarea --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirement {
    MinMemoryMb { mb: u64 },
    MinCpus { count: u64 },
    Os { name: String },
    /// Atributo presente en el perfil (y con ese valor, si se indica).
    Attribute {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

impl Requirement {
    pub fn is_met_by(&self, caps: &Capabilities) -> bool {
        match self {
            Requirement::MinMemoryMb { mb } => caps
                .get(CAP_MEMORY_MB)
                .and_then(Value::as_u64)
                .map_or(false, |have| have >= *mb),
            Requirement::MinCpus { count } => caps
                .get(CAP_CPUS)
                .and_then(Value::as_u64)
                .map_or(false, |have| have >= *count),
            Requirement::Os { name } => caps
                .get(CAP_OS)
                .and_then(Value::as_str)
                .map_or(false, |os| os.eq_ignore_ascii_case(name)),
            Requirement::Attribute { key, value } => match (caps.get(key), value) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(have), Some(want)) => have == want,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(default)]
    pub all: Vec<Requirement>,
}

impl TaskRequirements {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, requirement: Requirement) -> Self {
        self.all.push(requirement);
        self
    }

    pub fn is_met_by(&self, caps: &Capabilities) -> bool {
        self.all.iter().all(|r| r.is_met_by(caps))
    }
}

/* --------- Carga de trabajo --------- */

/// Lo que el worker ejecuta. El scheduler no mira dentro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Work {
    /// Cuenta primos en [low, high].
    CountPrimes { low: u64, high: u64 },
    /// Tarea de combinación: suma de resultados parciales.
    Sum { operands: Vec<u64> },
    /// Ejecuta un archivo transferido; el stdout es el resultado.
    Exec {
        program: String,
        directory: RemoteDirectory,
        #[serde(default)]
        args: Vec<String>,
    },
    Sleep { millis: u64, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub work: Work,
    pub state: TaskState,
    #[serde(default)]
    pub requirements: TaskRequirements,
    pub timeout_ms: u64,
    /// Archivos a empujar al worker antes de mandar la tarea, en orden.
    #[serde(default)]
    pub files: Vec<FileTransfer>,
    #[serde(default)]
    pub result: Option<Value>,
    pub attempt: u32,
}

impl Task {
    pub fn new(job_id: impl Into<JobId>, work: Work) -> Self {
        Self {
            id: next_task_id(),
            job_id: job_id.into(),
            work,
            state: TaskState::Ready,
            requirements: TaskRequirements::none(),
            timeout_ms: DEFAULT_TASK_TIMEOUT.as_millis() as u64,
            files: Vec::new(),
            result: None,
            attempt: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_file(mut self, file: FileTransfer) -> Self {
        self.files.push(file);
        self
    }

    pub fn requirements(&self) -> &TaskRequirements {
        &self.requirements
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Duplica el timeout; se usa al reasignar por timeout.
    pub fn increase_timeout(&mut self) {
        self.timeout_ms = self.timeout_ms.saturating_mul(2);
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }
}
