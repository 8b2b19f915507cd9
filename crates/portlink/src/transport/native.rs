//! Native message port: a helper process spoken to over its stdio.
//!
//! Every connect spawns a fresh child. Frames are native-messaging frames in
//! both directions; the helper may send at most 1 MiB per message, and a
//! larger frame closes the channel. A frame whose body is not JSON is dropped.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::TransportError;
use crate::bridge::channel::{Channel, ChannelFactory};
use crate::bridge::codec::{CLIENT_MESSAGE_LIMIT, HOST_MESSAGE_LIMIT, JsonCodec};

/// Extension point for how a native host process is started.
pub trait NativeHostSpawner: Send + Sync {
    fn spawn(&self, peer: &str) -> Result<Child, TransportError>;
}

/// Spawns `program args..` with piped stdin/stdout and inherited stderr.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl NativeHostSpawner for CommandSpawner {
    fn spawn(&self, peer: &str) -> Result<Child, TransportError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                peer: peer.to_string(),
                source,
            })
    }
}

/// Opens a channel by spawning a native host.
pub struct NativePortFactory {
    spawner: Arc<dyn NativeHostSpawner>,
}

impl NativePortFactory {
    pub fn new(spawner: Arc<dyn NativeHostSpawner>) -> Self {
        Self { spawner }
    }

    pub fn command(spawner: CommandSpawner) -> Self {
        Self::new(Arc::new(spawner))
    }
}

#[async_trait]
impl ChannelFactory for NativePortFactory {
    async fn open(&self, peer: &str) -> Result<Channel, TransportError> {
        let mut child = self.spawner.spawn(peer)?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::MissingStdio {
            peer: peer.to_string(),
            stream: "stdin",
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::MissingStdio {
            peer: peer.to_string(),
            stream: "stdout",
        })?;

        tracing::info!(%peer, pid = ?child.id(), "Spawned native host");
        let channel = native_channel(peer, stdout, stdin);
        tokio::spawn(supervise(peer.to_string(), child, channel.shutdown_token()));
        Ok(channel)
    }
}

/// Reap the child when it exits on its own, kill it when the channel closes.
async fn supervise(peer: String, mut child: Child, shutdown: CancellationToken) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => tracing::info!(%peer, %status, "Native host exited"),
            Err(e) => tracing::warn!(%peer, error = %e, "Failed to wait for native host"),
        },
        _ = shutdown.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::debug!(%peer, error = %e, "Native host already gone");
            }
            tracing::debug!(%peer, "Native host stopped");
        }
    }
}

/// Extension side of a native port: reads host-sized frames, writes
/// client-sized frames.
pub fn native_channel<R, W>(peer: &str, reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pump(peer, reader, writer, HOST_MESSAGE_LIMIT, CLIENT_MESSAGE_LIMIT)
}

/// Host side of a native port: the mirror image of [`native_channel`].
pub fn host_channel<R, W>(peer: &str, reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pump(peer, reader, writer, CLIENT_MESSAGE_LIMIT, HOST_MESSAGE_LIMIT)
}

/// Host side over this process's own stdin/stdout.
pub fn host_stdio_channel(peer: &str) -> Channel {
    host_channel(peer, tokio::io::stdin(), tokio::io::stdout())
}

fn pump<R, W>(peer: &str, reader: R, writer: W, read_limit: usize, write_limit: usize) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound) = mpsc::unbounded_channel::<Value>();
    let (inbound, inbound_rx) = mpsc::unbounded_channel::<Value>();
    let channel = Channel::new(peer, outbound_tx, inbound_rx);

    let shutdown = channel.shutdown_token();
    let mut frames_out = FramedWrite::new(writer, JsonCodec::<Value>::with_max_frame_length(write_limit));
    let writer_peer = peer.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = frames_out.send(message).await {
                        tracing::warn!(peer = %writer_peer, error = %e, "Failed to write frame, closing channel");
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        if let Err(e) = frames_out.close().await {
            tracing::debug!(peer = %writer_peer, error = %e, "Failed to close writer");
        }
        shutdown.cancel();
    });

    let shutdown = channel.shutdown_token();
    let mut frames_in = FramedRead::new(reader, JsonCodec::<Value>::with_max_frame_length(read_limit));
    let reader_peer = peer.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = frames_in.next() => match frame {
                    Some(Ok(Ok(value))) => {
                        if inbound.send(value).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Err(e))) => {
                        tracing::warn!(peer = %reader_peer, error = %e, "Dropping frame that is not valid JSON");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(peer = %reader_peer, error = %e, "Failed to read frame, closing channel");
                        break;
                    }
                    None => {
                        tracing::debug!(peer = %reader_peer, "Stream closed");
                        break;
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }
        shutdown.cancel();
    });

    channel
}
