//! Subscribe-mode connection processor.
//!
//! Sends one snapshot of the machine state on connect, then a push for
//! every status change and broadcast message. The connection is one-way;
//! the client only reads.

use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use codelink_core::{CancellationToken, Message, Result};

use super::{ClientConnection, IpcState};

/// One push to a subscriber: either a model snapshot or a message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
enum SubscriptionPush {
    Model { model: serde_json::Value },
    Message { message: Message },
}

async fn snapshot(state: &IpcState) -> serde_json::Value {
    let model = state.processor.model().read().await;
    json!({
        "status": model.status,
        "job": &model.job,
        "modules": &model.modules,
    })
}

pub async fn process(
    mut conn: ClientConnection,
    state: IpcState,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut messages = state.processor.model().subscribe();
    conn.send(&SubscriptionPush::Model {
        model: snapshot(&state).await,
    })
    .await?;
    debug!(id = conn.id, "subscriber attached");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            received = messages.recv() => match received {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    // Catch the client up with a fresh snapshot instead of
                    // replaying what it missed.
                    warn!(id = conn.id, skipped, "subscriber lagged, resending snapshot");
                    conn.send(&SubscriptionPush::Model {
                        model: snapshot(&state).await,
                    })
                    .await?;
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        };
        conn.send(&SubscriptionPush::Message { message }).await?;
    }
}
