//! Command-mode connection processor.
//!
//! Reads one JSON command per line, executes it, and answers with an
//! [`IpcResponse`]. Unknown or malformed commands get an error response
//! instead of dropping the connection.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use codelink_core::{parse_line, CodeChannel, CodeOutcome, Message, Result};

use crate::handler::mark_prioritized;

use super::{ClientConnection, IpcResponse, IpcState};

/// Commands a client may issue in command mode.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "command")]
pub enum CommandRequest {
    /// Parse and execute a line of G-code, returning the accumulated reply.
    SimpleCode {
        code: String,
        #[serde(default = "default_code_channel")]
        channel: CodeChannel,
    },
    /// Wait until a channel's pipeline has fully drained.
    Flush { channel: CodeChannel },
    /// Fetch one object model module as JSON.
    GetMachineModel {
        #[serde(default)]
        module: u8,
    },
    /// Stop everything and cut power to the heaters.
    EmergencyStop,
    /// Reboot the firmware.
    Reset,
    /// Pipeline and transfer diagnostics, M122-style.
    Diagnostics,
}

fn default_code_channel() -> CodeChannel {
    CodeChannel::DEFAULT
}

pub async fn process(mut conn: ClientConnection, state: IpcState) -> Result<()> {
    loop {
        let request: CommandRequest = match conn.receive().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => {
                conn.send(&IpcResponse::err(err.to_string())).await?;
                continue;
            }
        };
        debug!(id = conn.id, ?request, "executing command");
        let response = match execute(&state, request).await {
            Ok(result) => IpcResponse::with_result(result),
            Err(err) => IpcResponse::err(err.to_string()),
        };
        conn.send(&response).await?;
    }
}

async fn execute(state: &IpcState, request: CommandRequest) -> Result<serde_json::Value> {
    match request {
        CommandRequest::SimpleCode { code, channel } => {
            let reply = run_simple_code(state, channel, &code).await?;
            Ok(json!(reply.to_string()))
        }
        CommandRequest::Flush { channel } => {
            state.processor.flush(channel).await;
            Ok(serde_json::Value::Null)
        }
        CommandRequest::GetMachineModel { module } => {
            let fragment = state.commander.object_model(module).await?;
            serde_json::from_str(&fragment).map_err(|err| codelink_core::Error::Codec {
                message: format!("firmware sent invalid module JSON: {err}"),
            })
        }
        CommandRequest::EmergencyStop => {
            state.commander.emergency_stop()?;
            Ok(serde_json::Value::Null)
        }
        CommandRequest::Reset => {
            state.commander.reset()?;
            Ok(serde_json::Value::Null)
        }
        CommandRequest::Diagnostics => {
            let report = state.commander.diagnostics().await?;
            Ok(json!(report))
        }
    }
}

/// Parse a text line into codes and run them in order.
///
/// Replies accumulate into one message; a cancelled code cuts the line
/// short since anything after it would run out of order.
pub async fn run_simple_code(
    state: &IpcState,
    channel: CodeChannel,
    line: &str,
) -> Result<Message> {
    let mut reply = Message::default();
    for mut code in parse_line(channel, line)? {
        mark_prioritized(&mut code);
        let handle = state.processor.start_code(code).await?;
        match handle.wait().await {
            CodeOutcome::Resolved(message) => reply.append(&message),
            CodeOutcome::Cancelled => {
                reply.append(&Message::warning("code was cancelled"));
                break;
            }
            CodeOutcome::Failed(error) => {
                reply.append(&Message::error(error));
                break;
            }
        }
    }
    Ok(reply)
}
