// common/src/transfer.rs

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::TransferError;
use crate::protocol::{Command, Payload};

pub const CHUNK_SIZE: usize = 4096;

/// Categoría de directorio destino en el worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteDirectory {
    Current,
    Data,
    Executables,
    Misc,
}

impl RemoteDirectory {
    pub fn relative(self) -> &'static str {
        match self {
            RemoteDirectory::Current => "",
            RemoteDirectory::Data => "data",
            RemoteDirectory::Executables => "executables",
            RemoteDirectory::Misc => "misc",
        }
    }

    pub fn resolve(self, base: &Path) -> PathBuf {
        match self {
            RemoteDirectory::Current => base.to_path_buf(),
            other => base.join(other.relative()),
        }
    }
}

/// Archivo que una tarea necesita en el worker antes de ejecutarse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Ruta en el master.
    pub local_path: PathBuf,
    pub remote_name: String,
    pub directory: RemoteDirectory,
    #[serde(default)]
    pub executable: bool,
}

impl FileTransfer {
    pub fn new(local_path: impl Into<PathBuf>, directory: RemoteDirectory) -> Self {
        let local_path = local_path.into();
        let remote_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            local_path,
            remote_name,
            directory,
            executable: false,
        }
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }
}

/// Metadatos que viajan antes del contenido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    pub file_name: String,
    pub directory: RemoteDirectory,
    pub size: u64,
    /// Milisegundos desde epoch.
    pub modified_ms: i64,
    pub executable: bool,
}

/// Respuestas del receptor que le interesan al emisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReply {
    Ack,
    NotModified,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    NotModified,
    Delivered { bytes: u64 },
}

/// Espera acotada: `attempts` intervalos de `interval`.
#[derive(Debug, Clone, Copy)]
pub struct ReplyWait {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for ReplyWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            attempts: 3,
        }
    }
}

pub fn modified_ms(meta: &Metadata) -> Option<i64> {
    let since = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    Some(since.as_millis() as i64)
}

pub async fn header_for(file: &FileTransfer) -> Result<FileHeader, TransferError> {
    let meta = tokio::fs::metadata(&file.local_path).await?;
    Ok(FileHeader {
        file_name: file.remote_name.clone(),
        directory: file.directory,
        size: meta.len(),
        modified_ms: modified_ms(&meta).unwrap_or(0),
        executable: file.executable,
    })
}

/* --------- Lado emisor --------- */

/// Empuja un archivo por el canal. Las respuestas del receptor llegan por
/// `replies`, que alimenta quien lee el canal.
pub async fn send_file(
    channel: &Channel,
    file: &FileTransfer,
    replies: &mut mpsc::UnboundedReceiver<TransferReply>,
    wait: ReplyWait,
    cancel: &CancellationToken,
) -> Result<TransferOutcome, TransferError> {
    let header = header_for(file).await?;
    let mut source = tokio::fs::File::open(&file.local_path).await?;

    channel
        .send_all(&[
            Command::Transfer.into(),
            Payload::FileHeader(header.clone()).into(),
        ])
        .await?;

    match await_reply(replies, wait, cancel).await? {
        TransferReply::NotModified => {
            debug!("{} sin cambios, no se envía", header.file_name);
            return Ok(TransferOutcome::NotModified);
        }
        TransferReply::Rejected => return Err(TransferError::Rejected(header.file_name)),
        TransferReply::Ack => {}
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        channel.send(Payload::Chunk(buf[..n].to_vec())).await?;
        sent += n as u64;
    }

    channel
        .send(Payload::Checksum(hasher.finalize().to_vec()))
        .await?;

    match await_reply(replies, wait, cancel).await? {
        TransferReply::Ack => Ok(TransferOutcome::Delivered { bytes: sent }),
        _ => Err(TransferError::Rejected(header.file_name)),
    }
}

async fn await_reply(
    replies: &mut mpsc::UnboundedReceiver<TransferReply>,
    wait: ReplyWait,
    cancel: &CancellationToken,
) -> Result<TransferReply, TransferError> {
    let mut attempts = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            reply = replies.recv() => return reply.ok_or(TransferError::Cancelled),
            _ = sleep(wait.interval) => {
                attempts += 1;
                if attempts >= wait.attempts {
                    return Err(TransferError::NoReply);
                }
            }
        }
    }
}

/* --------- Lado receptor --------- */

pub enum ReceiveStart {
    NotModified,
    Ready(FileReceiver),
}

/// Escribe en `<nombre>.part` y solo renombra si el checksum coincide.
pub struct FileReceiver {
    header: FileHeader,
    target: PathBuf,
    partial: PathBuf,
    file: tokio::fs::File,
    hasher: Sha256,
    received: u64,
}

fn validate_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(TransferError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl FileReceiver {
    pub async fn begin(base: &Path, header: FileHeader) -> Result<ReceiveStart, TransferError> {
        validate_name(&header.file_name)?;

        let dir = header.directory.resolve(base);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(&header.file_name);

        if let Ok(meta) = tokio::fs::metadata(&target).await {
            if modified_ms(&meta) == Some(header.modified_ms) {
                return Ok(ReceiveStart::NotModified);
            }
        }

        let partial = dir.join(format!("{}.part", header.file_name));
        let file = tokio::fs::File::create(&partial).await?;

        Ok(ReceiveStart::Ready(FileReceiver {
            header,
            target,
            partial,
            file,
            hasher: Sha256::new(),
            received: 0,
        }))
    }

    pub fn file_name(&self) -> &str {
        &self.header.file_name
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.hasher.update(data);
        self.file.write_all(data).await?;
        self.received += data.len() as u64;
        Ok(())
    }

    /// Verifica el checksum. `Ok(false)` si no coincide (el parcial se borra).
    pub async fn finish(self, checksum: &[u8]) -> Result<bool, TransferError> {
        let FileReceiver {
            header,
            target,
            partial,
            mut file,
            hasher,
            received,
        } = self;

        file.flush().await?;
        let digest = hasher.finalize();

        if received != header.size || digest.as_slice() != checksum {
            warn!(
                "checksum inválido para {} ({} de {} bytes)",
                header.file_name, received, header.size
            );
            drop(file);
            let _ = tokio::fs::remove_file(&partial).await;
            return Ok(false);
        }

        let std_file = file.into_std().await;
        let mtime = UNIX_EPOCH + Duration::from_millis(header.modified_ms.max(0) as u64);
        std_file.set_modified(mtime)?;
        std_file.sync_all()?;
        drop(std_file);

        #[cfg(unix)]
        if header.executable {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&partial, std::fs::Permissions::from_mode(0o755)).await?;
        }

        tokio::fs::rename(&partial, &target).await?;
        debug!("archivo {} aceptado ({} bytes)", target.display(), received);
        Ok(true)
    }

    pub async fn abort(self) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.partial).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelEvent, ChannelEvents};
    use crate::protocol::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn header(name: &str, data: &[u8], modified_ms: i64) -> FileHeader {
        FileHeader {
            file_name: name.to_string(),
            directory: RemoteDirectory::Data,
            size: data.len() as u64,
            modified_ms,
            executable: false,
        }
    }

    fn sha(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    async fn ready(base: &Path, header: FileHeader) -> FileReceiver {
        match FileReceiver::begin(base, header).await.unwrap() {
            ReceiveStart::Ready(r) => r,
            ReceiveStart::NotModified => panic!("se esperaba Ready"),
        }
    }

    #[tokio::test]
    async fn accepted_file_keeps_source_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; CHUNK_SIZE * 2 + 100];
        let mut h = header("input.bin", &data, 1_600_000_000_123);
        h.executable = true;

        let mut rx = ready(dir.path(), h).await;
        for chunk in data.chunks(CHUNK_SIZE) {
            rx.write_chunk(chunk).await.unwrap();
        }
        assert!(rx.finish(&sha(&data)).await.unwrap());

        let target = dir.path().join("data").join("input.bin");
        assert_eq!(std::fs::read(&target).unwrap(), data);
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(modified_ms(&meta), Some(1_600_000_000_123));
        assert!(!dir.path().join("data").join("input.bin.part").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn same_mtime_is_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hola mundo".to_vec();

        let mut rx = ready(dir.path(), header("a.txt", &data, 1_500_000_000_000)).await;
        rx.write_chunk(&data).await.unwrap();
        assert!(rx.finish(&sha(&data)).await.unwrap());

        let again = FileReceiver::begin(dir.path(), header("a.txt", &data, 1_500_000_000_000))
            .await
            .unwrap();
        assert!(matches!(again, ReceiveStart::NotModified));

        let newer = FileReceiver::begin(dir.path(), header("a.txt", &data, 1_500_000_000_001))
            .await
            .unwrap();
        assert!(matches!(newer, ReceiveStart::Ready(_)));
    }

    #[tokio::test]
    async fn one_corrupted_byte_rejects_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut rx = ready(dir.path(), header("c.bin", &data, 42)).await;

        let mut corrupted = data.clone();
        corrupted[5_000] ^= 0xff;
        for chunk in corrupted.chunks(CHUNK_SIZE) {
            rx.write_chunk(chunk).await.unwrap();
        }

        assert!(!rx.finish(&sha(&data)).await.unwrap());
        assert!(!dir.path().join("data").join("c.bin").exists());
        assert!(!dir.path().join("data").join("c.bin.part").exists());
    }

    #[tokio::test]
    async fn names_with_separators_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../evil", "a/b", "a\\b", ""] {
            let res = FileReceiver::begin(dir.path(), header(name, b"x", 1)).await;
            assert!(matches!(res, Err(TransferError::InvalidName(_))));
        }
    }

    /// Receptor mínimo sobre un canal real; cuenta los chunks que recibe.
    async fn serve_receiver(
        server: Channel,
        mut events: ChannelEvents,
        base: PathBuf,
        chunks: Arc<AtomicUsize>,
    ) {
        let mut current: Option<FileReceiver> = None;
        while let Some(ev) = events.recv().await {
            let ChannelEvent::Message(msg) = ev else {
                continue;
            };
            match msg {
                Message::Payload(Payload::FileHeader(h)) => {
                    match FileReceiver::begin(&base, h).await.unwrap() {
                        ReceiveStart::NotModified => {
                            server.send(Command::TransferNotModified).await.unwrap()
                        }
                        ReceiveStart::Ready(r) => {
                            current = Some(r);
                            server.send(Command::TransferAck).await.unwrap();
                        }
                    }
                }
                Message::Payload(Payload::Chunk(data)) => {
                    chunks.fetch_add(1, Ordering::SeqCst);
                    if let Some(r) = current.as_mut() {
                        r.write_chunk(&data).await.unwrap();
                    }
                }
                Message::Payload(Payload::Checksum(sum)) => {
                    if let Some(r) = current.take() {
                        let ok = r.finish(&sum).await.unwrap();
                        let reply = if ok { Command::TransferAck } else { Command::Error };
                        server.send(reply).await.unwrap();
                    }
                }
                _ => {}
            }
        }
    }

    fn pump_replies(mut events: ChannelEvents) -> mpsc::UnboundedReceiver<TransferReply> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                let reply = match ev {
                    ChannelEvent::Message(Message::Command(Command::TransferAck)) => {
                        TransferReply::Ack
                    }
                    ChannelEvent::Message(Message::Command(Command::TransferNotModified)) => {
                        TransferReply::NotModified
                    }
                    ChannelEvent::Message(Message::Command(Command::Error)) => {
                        TransferReply::Rejected
                    }
                    _ => continue,
                };
                let _ = tx.send(reply);
            }
        });
        rx
    }

    #[tokio::test]
    async fn unchanged_file_streams_zero_bytes() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("tool.sh");
        std::fs::write(&src, vec![b'x'; CHUNK_SIZE * 3]).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, server_rx) = Channel::new(ChannelConfig::default());
        let accepting = server.clone();
        let accept = tokio::spawn(async move { accepting.accept_from(&listener).await });
        let (client, client_rx) = Channel::to_peer(addr, ChannelConfig::default());
        client.connect().await.unwrap();
        accept.await.unwrap().unwrap();

        let chunks = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_receiver(
            server,
            server_rx,
            dst_dir.path().to_path_buf(),
            chunks.clone(),
        ));
        let mut replies = pump_replies(client_rx);

        let file = FileTransfer::new(&src, RemoteDirectory::Executables).executable();
        let cancel = CancellationToken::new();
        let wait = ReplyWait::default();

        let first = send_file(&client, &file, &mut replies, wait, &cancel)
            .await
            .unwrap();
        assert_eq!(
            first,
            TransferOutcome::Delivered {
                bytes: (CHUNK_SIZE * 3) as u64
            }
        );
        assert_eq!(chunks.load(Ordering::SeqCst), 3);

        let second = send_file(&client, &file, &mut replies, wait, &cancel)
            .await
            .unwrap();
        assert_eq!(second, TransferOutcome::NotModified);
        assert_eq!(chunks.load(Ordering::SeqCst), 3);

        let copied = dst_dir.path().join("executables").join("tool.sh");
        assert_eq!(std::fs::read(copied).unwrap().len(), CHUNK_SIZE * 3);
    }
}
