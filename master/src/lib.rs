pub mod config;
pub mod correlation;
pub mod delegation;
pub mod discovery;
pub mod failover;
pub mod launcher;
pub mod monitor;
pub mod resource;
pub mod roster;
pub mod scheduler;
pub mod state;

pub use config::{MasterConfig, ResourceTiming};
pub use discovery::Listeners;
pub use launcher::{CommandLauncher, LaunchRequest, WorkerLauncher};
pub use resource::{ResourceEvent, ResourceHandle};
pub use roster::Roster;
pub use scheduler::Scheduler;
