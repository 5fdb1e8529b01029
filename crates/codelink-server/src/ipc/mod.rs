//! IPC server over a Unix domain socket.
//!
//! Clients connect, receive a server init message, and answer with a
//! [`ClientInitMessage`] choosing their connection mode. Every message in
//! both directions is one line of JSON.
//!
//! - **Command**: request/response execution of commands ([`command`]).
//! - **Intercept**: the client becomes a pipeline interceptor ([`intercept`]).
//! - **Subscribe**: the client receives model updates and messages
//!   ([`subscribe`]).
//! - **CodeStream**: raw G-code text in, reply text out ([`stream`]).

pub mod command;
pub mod intercept;
pub mod stream;
pub mod subscribe;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use codelink_core::pipeline::{InterceptionMode, Processor};
use codelink_core::transfer::interface::SpiCommander;
use codelink_core::{CancellationToken, CodeChannel, Error, Result};

use intercept::InterceptorRegistry;

/// IPC protocol version, bumped on incompatible changes.
pub const IPC_VERSION: u8 = 1;

/// First message on every connection, server to client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInitMessage {
    pub version: u8,
    pub id: u64,
}

/// The client's answer: which mode this connection operates in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "mode")]
pub enum ClientInitMessage {
    /// Request/response command execution.
    Command,
    /// Intercept codes at one pipeline stage.
    Intercept { interception_mode: InterceptionMode },
    /// Receive model updates and broadcast messages.
    Subscribe,
    /// Stream raw G-code text on one channel.
    CodeStream {
        #[serde(default = "default_stream_channel")]
        channel: CodeChannel,
    },
}

fn default_stream_channel() -> CodeChannel {
    CodeChannel::Usb
}

/// Generic acknowledgement envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct IpcResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            result: None,
            error: None,
        }
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Shared handles every connection mode works against.
#[derive(Clone)]
pub struct IpcState {
    pub processor: Processor,
    pub commander: SpiCommander,
    pub interceptors: InterceptorRegistry,
}

/// One connected client: line-based JSON in both directions.
pub struct ClientConnection {
    pub id: u64,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl ClientConnection {
    fn new(id: u64, stream: UnixStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            id,
            reader: BufReader::new(read),
            writer,
            line: String::new(),
        }
    }

    /// Read the next line and deserialize it. `Ok(None)` means EOF.
    pub async fn receive<T: serde::de::DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(self.line.trim())
                .map(Some)
                .map_err(|err| Error::Codec {
                    message: format!("invalid request: {err}"),
                });
        }
    }

    /// Read the next raw text line. `Ok(None)` means EOF.
    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        self.line.clear();
        let n = self.reader.read_line(&mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Serialize and send one message followed by a newline.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut encoded = serde_json::to_vec(message).map_err(|err| Error::Codec {
            message: format!("response serialization failed: {err}"),
        })?;
        encoded.push(b'\n');
        self.writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Send one raw text line.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }
}

/// The accept loop plus socket lifecycle.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    state: IpcState,
    next_id: AtomicU64,
}

impl IpcServer {
    /// Bind the Unix socket, replacing a stale file from an unclean exit.
    pub fn bind(socket_path: &Path, state: IpcState) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "IPC socket bound");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            state,
            next_id: AtomicU64::new(1),
        })
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("IPC server shutting down");
                    let _ = std::fs::remove_file(&self.socket_path);
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                            let state = self.state.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                let conn = ClientConnection::new(id, stream);
                                if let Err(err) = handle_client(conn, state, shutdown).await {
                                    debug!(id, error = %err, "client connection ended");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            }
        }
    }
}

async fn handle_client(
    mut conn: ClientConnection,
    state: IpcState,
    shutdown: CancellationToken,
) -> Result<()> {
    conn.send(&ServerInitMessage {
        version: IPC_VERSION,
        id: conn.id,
    })
    .await?;

    let init: ClientInitMessage = match conn.receive().await {
        Ok(Some(init)) => init,
        Ok(None) => return Ok(()),
        Err(err) => {
            conn.send(&IpcResponse::err(err.to_string())).await?;
            return Err(err);
        }
    };
    conn.send(&IpcResponse::ok()).await?;
    debug!(id = conn.id, ?init, "client connected");

    match init {
        ClientInitMessage::Command => command::process(conn, state).await,
        ClientInitMessage::Intercept { interception_mode } => {
            intercept::process(conn, state, interception_mode, shutdown).await
        }
        ClientInitMessage::Subscribe => subscribe::process(conn, state, shutdown).await,
        ClientInitMessage::CodeStream { channel } => stream::process(conn, state, channel).await,
    }
}
