pub mod config;
pub mod error;
pub mod execution;
pub mod system;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use execution::Outcome;
pub use worker::{run, run_session, SessionEnd, WorkerResource};
