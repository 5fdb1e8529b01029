//! Intercept-mode connection processor and the interceptor registry.
//!
//! The registry is installed into the processor at startup and fans each
//! code out to the connected interceptor clients of the matching stage,
//! one at a time. A client answers every code with either an ignore or a
//! resolve instruction; a disconnected client is pruned on the next code.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use codelink_core::pipeline::{InterceptionMode, Interceptor};
use codelink_core::{CancellationToken, Code, CodeChannel, Message, MessageType, Result};

use super::{ClientConnection, IpcResponse, IpcState};

/// Serializable view of a code offered to an interceptor client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSnapshot {
    pub channel: CodeChannel,
    pub code: String,
}

/// The client's instruction for one intercepted code.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "command")]
pub enum InterceptInstruction {
    /// Let the code continue through the pipeline.
    Ignore,
    /// Resolve the code with the given reply; it skips to Executed.
    Resolve {
        #[serde(default, rename = "type")]
        message_type: MessageType,
        #[serde(default)]
        content: String,
    },
}

/// Verdict delivered back to the pipeline.
enum Verdict {
    Ignore,
    Resolve(Message),
}

struct InterceptRequest {
    snapshot: CodeSnapshot,
    verdict: oneshot::Sender<Verdict>,
}

struct Entry {
    mode: InterceptionMode,
    tx: mpsc::Sender<InterceptRequest>,
}

/// Fan-out point between the pipeline and interceptor connections.
#[derive(Clone, Default)]
pub struct InterceptorRegistry {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, mode: InterceptionMode) -> mpsc::Receiver<InterceptRequest> {
        // Capacity 1: an interceptor handles one code at a time.
        let (tx, rx) = mpsc::channel(1);
        self.entries.lock().await.push(Entry { mode, tx });
        rx
    }

    async fn senders_for(&self, mode: InterceptionMode) -> Vec<mpsc::Sender<InterceptRequest>> {
        let mut entries = self.entries.lock().await;
        entries.retain(|entry| !entry.tx.is_closed());
        entries
            .iter()
            .filter(|entry| entry.mode == mode)
            .map(|entry| entry.tx.clone())
            .collect()
    }
}

#[async_trait]
impl Interceptor for InterceptorRegistry {
    async fn intercept(&self, code: &mut Code, mode: InterceptionMode) -> Result<bool> {
        for tx in self.senders_for(mode).await {
            let (verdict_tx, verdict_rx) = oneshot::channel();
            let request = InterceptRequest {
                snapshot: CodeSnapshot {
                    channel: code.channel,
                    code: code.to_string(),
                },
                verdict: verdict_tx,
            };
            if tx.send(request).await.is_err() {
                // Client went away between the snapshot and now.
                continue;
            }
            match verdict_rx.await {
                Ok(Verdict::Resolve(message)) => {
                    code.reply.append(&message);
                    return Ok(true);
                }
                Ok(Verdict::Ignore) => {}
                // A dropped verdict means the client disconnected mid-code;
                // treat it as ignored so the pipeline keeps moving.
                Err(_) => {}
            }
        }
        Ok(false)
    }
}

pub async fn process(
    mut conn: ClientConnection,
    state: IpcState,
    mode: InterceptionMode,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut requests = state.interceptors.register(mode).await;
    debug!(id = conn.id, ?mode, "interceptor attached");

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            request = requests.recv() => match request {
                Some(request) => request,
                None => return Ok(()),
            },
        };

        conn.send(&request.snapshot).await?;
        let verdict = match conn.receive::<InterceptInstruction>().await {
            Ok(Some(InterceptInstruction::Ignore)) => Verdict::Ignore,
            Ok(Some(InterceptInstruction::Resolve {
                message_type,
                content,
            })) => Verdict::Resolve(Message::new(message_type, content)),
            Ok(None) => {
                // EOF: the dropped verdict sender unblocks the pipeline.
                debug!(id = conn.id, "interceptor disconnected");
                return Ok(());
            }
            Err(err) => {
                warn!(id = conn.id, error = %err, "bad intercept instruction, ignoring code");
                conn.send(&IpcResponse::err(err.to_string())).await?;
                let _ = request.verdict.send(Verdict::Ignore);
                continue;
            }
        };
        let _ = request.verdict.send(verdict);
        conn.send(&IpcResponse::ok()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelink_core::{CodeType, Result as CoreResult};

    fn g28() -> Code {
        Code::new(CodeChannel::File, CodeType::GCode, Some(28))
    }

    #[tokio::test]
    async fn empty_registry_passes_codes_through() {
        let registry = InterceptorRegistry::new();
        let mut code = g28();
        let resolved = registry
            .intercept(&mut code, InterceptionMode::Pre)
            .await
            .unwrap();
        assert!(!resolved);
    }

    #[tokio::test]
    async fn resolve_verdict_settles_the_code() -> CoreResult<()> {
        let registry = InterceptorRegistry::new();
        let mut requests = registry.register(InterceptionMode::Pre).await;

        let answering = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert_eq!(request.snapshot.code, "G28");
            let _ = request
                .verdict
                .send(Verdict::Resolve(Message::success("homed by proxy")));
        });

        let mut code = g28();
        let resolved = registry.intercept(&mut code, InterceptionMode::Pre).await?;
        assert!(resolved);
        assert_eq!(code.reply.content, "homed by proxy");
        answering.await.unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn dropped_client_is_treated_as_ignore() {
        let registry = InterceptorRegistry::new();
        let requests = registry.register(InterceptionMode::Post).await;
        drop(requests);

        let mut code = g28();
        let resolved = registry
            .intercept(&mut code, InterceptionMode::Post)
            .await
            .unwrap();
        assert!(!resolved);
    }

    #[tokio::test]
    async fn modes_are_independent() {
        let registry = InterceptorRegistry::new();
        let mut requests = registry.register(InterceptionMode::Executed).await;

        // A Pre interception must not consult the Executed client.
        let mut code = g28();
        let resolved = registry
            .intercept(&mut code, InterceptionMode::Pre)
            .await
            .unwrap();
        assert!(!resolved);
        assert!(requests.try_recv().is_err());
    }

    #[test]
    fn instruction_deserializes() {
        let instruction: InterceptInstruction =
            serde_json::from_str(r#"{"command":"ignore"}"#).unwrap();
        assert!(matches!(instruction, InterceptInstruction::Ignore));

        let instruction: InterceptInstruction = serde_json::from_str(
            r#"{"command":"resolve","type":"error","content":"not while printing"}"#,
        )
        .unwrap();
        match instruction {
            InterceptInstruction::Resolve {
                message_type,
                content,
            } => {
                assert_eq!(message_type, MessageType::Error);
                assert_eq!(content, "not while printing");
            }
            other => panic!("unexpected instruction {other:?}"),
        }
    }
}
