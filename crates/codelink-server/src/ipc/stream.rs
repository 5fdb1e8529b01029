//! Code-stream connection processor.
//!
//! Raw text in both directions: the client writes G-code lines, the server
//! answers with the reply text, exactly like talking to the firmware over a
//! serial console. Parse failures come back as error lines instead of
//! closing the connection.

use tracing::debug;

use codelink_core::{CodeChannel, Result};

use super::command::run_simple_code;
use super::{ClientConnection, IpcState};

pub async fn process(mut conn: ClientConnection, state: IpcState, channel: CodeChannel) -> Result<()> {
    debug!(id = conn.id, ?channel, "code stream attached");
    while let Some(line) = conn.receive_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match run_simple_code(&state, channel, &line).await {
            Ok(reply) => {
                let text = reply.to_string();
                if text.is_empty() {
                    conn.send_line("ok").await?;
                } else {
                    conn.send_line(&text).await?;
                }
            }
            Err(err) => {
                conn.send_line(&format!("Error: {err}")).await?;
                // Serial consoles wait for the ok marker even after a bad line.
                if state.processor.settings().emulates_marlin(channel) {
                    conn.send_line("ok").await?;
                }
            }
        }
    }
    Ok(())
}
