// common/src/states.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Estado de un recurso (worker). Lo comparten el lado master y el lado worker:
/// el worker reporta sus cambios con `state_changed` y el master refleja
/// algunos de ellos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    NotConnected,
    Connecting,
    ErrorConnecting,
    WaitingForConnection,
    Authorizing,
    AuthorizationFailure,
    AuthorizationSuccess,
    AwaitingCommandConnection,
    Ready,
    TaskAssigned,
    RunningTask,
    FinishingTask,
    TaskCompleted,
    TaskTerminated,
    TaskEndedAbnormally,
    SendingIdleStats,
    Troubled,
    Disconnecting,
}

impl ResourceState {
    /// Estados reportados por el worker que el master copia tal cual.
    pub fn is_mirrored(self) -> bool {
        matches!(
            self,
            ResourceState::RunningTask
                | ResourceState::FinishingTask
                | ResourceState::TaskCompleted
                | ResourceState::TaskTerminated
                | ResourceState::TaskEndedAbnormally
                | ResourceState::Ready
        )
    }

    /// Estados desde los que un READY del worker es válido.
    pub fn settles_to_ready(self) -> bool {
        matches!(
            self,
            ResourceState::TaskCompleted
                | ResourceState::TaskTerminated
                | ResourceState::TaskEndedAbnormally
                | ResourceState::SendingIdleStats
        )
    }

    pub fn holds_task(self) -> bool {
        matches!(
            self,
            ResourceState::TaskAssigned | ResourceState::RunningTask | ResourceState::FinishingTask
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::NotConnected => "NOT_CONNECTED",
            ResourceState::Connecting => "CONNECTING",
            ResourceState::ErrorConnecting => "ERROR_CONNECTING",
            ResourceState::WaitingForConnection => "WAITING_FOR_CONNECTION",
            ResourceState::Authorizing => "AUTHORIZING",
            ResourceState::AuthorizationFailure => "AUTHORIZATION_FAILURE",
            ResourceState::AuthorizationSuccess => "AUTHORIZATION_SUCCESS",
            ResourceState::AwaitingCommandConnection => "AWAITING_COMMAND_CONNECTION",
            ResourceState::Ready => "READY",
            ResourceState::TaskAssigned => "TASK_ASSIGNED",
            ResourceState::RunningTask => "RUNNING_TASK",
            ResourceState::FinishingTask => "FINISHING_TASK",
            ResourceState::TaskCompleted => "TASK_COMPLETED",
            ResourceState::TaskTerminated => "TASK_TERMINATED",
            ResourceState::TaskEndedAbnormally => "TASK_ENDED_ABNORMALLY",
            ResourceState::SendingIdleStats => "SENDING_IDLE_STATS",
            ResourceState::Troubled => "TROUBLED",
            ResourceState::Disconnecting => "DISCONNECTING",
        };
        write!(f, "{}", s)
    }
}
