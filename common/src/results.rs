use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, JobId, JobState};

/// Resumen de un job, publicado por el scheduler y volcado a disco por el master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub name: String,
    pub state: JobState,

    /// -------- Métricas del job --------
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub remaining_tasks: usize,
    pub reported_at: DateTime<Utc>,

    pub result: Option<Value>,
}

impl JobReport {
    pub fn from_job<J: Job + ?Sized>(job: &J) -> Self {
        Self {
            job_id: job.id().clone(),
            name: job.name().to_string(),
            state: job.state(),
            total_tasks: job.initial_count(),
            completed_tasks: job.completed_count(),
            failed_tasks: job.failed_count(),
            remaining_tasks: job.remaining_count(),
            reported_at: Utc::now(),
            result: job.final_result(),
        }
    }
}
