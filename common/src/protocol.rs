// common/src/protocol.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::states::ResourceState;
use crate::task::{Capabilities, Task};
use crate::transfer::FileHeader;

pub type ResourceId = u64;

/* --------- Vocabulario del protocolo --------- */

/// Un mensaje es un comando o un payload; se alternan según la fase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Message {
    Command(Command),
    Payload(Payload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    RequestCredentials,
    ClientKey,
    Credentials,
    Capabilities,
    SendingResourceId,
    AuthorizationSucceeded,
    AuthorizationFailed,
    CommandChannelEstablished,
    StateChanged,
    Ping,
    PingAck,
    InvalidCommand,
    SendingTask,
    Transfer,
    TransferAck,
    TransferNotModified,
    CancelTask,
    IdleStatsAvailable,
    SendIdleStats,
    SendingIdleTime,
    SendingNonidleTime,
    SendingResults,
    Error,
    GoingOffline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    State(ResourceState),
    ResourceId(ResourceId),
    ClientKey { key: u32, secret: u32 },
    Credentials(Credentials),
    Capabilities(Capabilities),
    Task(Box<Task>),
    Result(Value),
    FileHeader(FileHeader),
    Chunk(#[serde(with = "hex_bytes")] Vec<u8>),
    Checksum(#[serde(with = "hex_bytes")] Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl From<Command> for Message {
    fn from(c: Command) -> Self {
        Message::Command(c)
    }
}

impl From<Payload> for Message {
    fn from(p: Payload) -> Self {
        Message::Payload(p)
    }
}

/// Qué espera el dueño de un canal a continuación.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Command,
    /// Payload que corresponde a este comando.
    Payload(Command),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Clave aleatoria no nula para correlacionar el canal de comandos.
pub fn random_key() -> u32 {
    loop {
        let key: u32 = rand::random();
        if key != 0 {
            return key;
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_snake_case_tags() {
        let line = serde_json::to_string(&Message::Command(Command::RequestCredentials)).unwrap();
        assert_eq!(line, r#"{"kind":"command","body":"request_credentials"}"#);

        let line =
            serde_json::to_string(&Message::Payload(Payload::State(ResourceState::Ready))).unwrap();
        assert_eq!(
            line,
            r#"{"kind":"payload","body":{"type":"state","value":"READY"}}"#
        );
    }

    #[test]
    fn chunks_travel_as_hex() {
        let msg = Message::Payload(Payload::Chunk(vec![0xde, 0xad, 0xbe, 0xef]));
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"deadbeef\""));
        let back: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let err = serde_json::from_str::<Message>(r#"{"kind":"command","body":"reboot"}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<Message>(r#"{"kind":"blob","body":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("ana", "secreto");
        let dbg = format!("{:?}", creds);
        assert!(dbg.contains("ana"));
        assert!(!dbg.contains("secreto"));
    }

    #[test]
    fn random_key_is_never_zero() {
        for _ in 0..1000 {
            assert_ne!(random_key(), 0);
        }
    }
}
