//! Daemon-side handling of control codes.
//!
//! Codes the firmware never sees: M112 (emergency stop), M122 (diagnostics)
//! and M999 (firmware reset) are resolved here at the ProcessInternally
//! stage. Everything else passes through to the firmware.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::warn;

use codelink_core::pipeline::CodeHandler;
use codelink_core::transfer::interface::SpiCommander;
use codelink_core::{Code, CodeFlags, CodeType, Message, Result};

/// M-code majors that bypass queue ordering on their way out.
const PRIORITIZED_MCODES: [i32; 3] = [112, 122, 999];

/// Mark codes that must overtake queued work.
pub fn mark_prioritized(code: &mut Code) {
    if code.code_type == CodeType::MCode
        && code.major.is_some_and(|major| PRIORITIZED_MCODES.contains(&major))
    {
        code.flags |= CodeFlags::PRIORITIZED;
    }
}

/// Control-code handler backed by the SPI commander.
///
/// The commander only exists once the SPI interface is built, which in turn
/// needs the processor this handler is part of; the slot breaks that cycle.
pub struct ControlCodeHandler {
    commander: Arc<OnceLock<SpiCommander>>,
}

impl ControlCodeHandler {
    pub fn new() -> Self {
        Self {
            commander: Arc::new(OnceLock::new()),
        }
    }

    /// The slot to fill with the commander once the SPI interface exists.
    pub fn commander_slot(&self) -> Arc<OnceLock<SpiCommander>> {
        Arc::clone(&self.commander)
    }
}

impl Default for ControlCodeHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeHandler for ControlCodeHandler {
    async fn process(&self, code: &mut Code) -> Result<Option<Message>> {
        if code.code_type != CodeType::MCode {
            return Ok(None);
        }
        let Some(commander) = self.commander.get() else {
            return Ok(None);
        };
        match code.major {
            Some(112) => {
                commander.emergency_stop()?;
                Ok(Some(Message::default()))
            }
            Some(122) if code.parameters.is_empty() => {
                let report = commander.diagnostics().await?;
                Ok(Some(Message::success(report)))
            }
            Some(999) if code.parameters.is_empty() => {
                commander.reset()?;
                Ok(Some(Message::default()))
            }
            _ => Ok(None),
        }
    }
}

/// Log-and-continue wrapper for handler setup failures.
pub fn install_commander(slot: &OnceLock<SpiCommander>, commander: SpiCommander) {
    if slot.set(commander).is_err() {
        warn!("SPI commander installed twice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelink_core::CodeChannel;

    fn mcode(major: i32) -> Code {
        Code::new(CodeChannel::Usb, CodeType::MCode, Some(major))
    }

    #[test]
    fn control_codes_are_prioritized() {
        for major in PRIORITIZED_MCODES {
            let mut code = mcode(major);
            mark_prioritized(&mut code);
            assert!(code.is_prioritized(), "M{major} should be prioritized");
        }
    }

    #[test]
    fn ordinary_codes_are_not_prioritized() {
        let mut code = mcode(104);
        mark_prioritized(&mut code);
        assert!(!code.is_prioritized());

        let mut code = Code::new(CodeChannel::Usb, CodeType::GCode, Some(112));
        mark_prioritized(&mut code);
        assert!(!code.is_prioritized());
    }

    #[tokio::test]
    async fn codes_pass_through_before_the_commander_exists() {
        let handler = ControlCodeHandler::new();
        let mut code = mcode(112);
        assert!(handler.process(&mut code).await.unwrap().is_none());
    }
}
