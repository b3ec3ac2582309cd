use std::net::SocketAddr;

use thiserror::Error;

use crate::channel::ChannelState;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("canal no conectado (estado {0:?})")]
    NotConnected(ChannelState),

    #[error("no se pudo conectar a {addr} tras {attempts} intentos")]
    Connect { addr: SocketAddr, attempts: u32 },

    #[error("el canal no tiene dirección de destino")]
    MissingPeer,

    #[error("operación inválida en estado {0:?}")]
    InvalidState(ChannelState),

    #[error("espera cancelada")]
    Cancelled,

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("nombre de archivo inválido: {0}")]
    InvalidName(String),

    #[error("el receptor no respondió a tiempo")]
    NoReply,

    #[error("el receptor rechazó el archivo {0} (checksum)")]
    Rejected(String),

    #[error("transferencia cancelada")]
    Cancelled,

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
