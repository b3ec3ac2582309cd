use std::sync::{Mutex, MutexGuard};

pub mod channel;
pub mod error;
pub mod job;
pub mod primes;
pub mod profile;
pub mod protocol;
pub mod results;
pub mod states;
pub mod task;
pub mod transfer;

pub use channel::{Channel, ChannelConfig, ChannelEvent, ChannelEvents, ChannelState};
pub use error::{ChannelError, TransferError};
pub use job::{BatchJob, Job, JobEvent, JobId, JobListener, JobState, TaskPool, MAX_TASK_ATTEMPTS};
pub use primes::PrimeCountJob;
pub use profile::{select_best, ClientProfile, SharedProfile};
pub use protocol::{random_key, Command, Credentials, Expect, Message, Payload, ResourceId};
pub use results::JobReport;
pub use states::ResourceState;
pub use task::{Capabilities, Requirement, Task, TaskId, TaskRequirements, TaskState, Work};
pub use transfer::{FileTransfer, RemoteDirectory};

/// Lock que no se cae si otro hilo entró en pánico con el mutex tomado.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
