use thiserror::Error;

use common::{ChannelError, TransferError};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("no se pudo resolver {0}")]
    Resolve(String),

    #[error("el master rechazó las credenciales")]
    AuthorizationFailed,

    #[error("se perdió la conexión con el master")]
    ConnectionLost,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
