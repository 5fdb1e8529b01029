//! Multi-stage code execution pipeline.
//!
//! Every code passes through a fixed stage sequence per channel:
//! Start, Pre, ProcessInternally, Post, Firmware, Executed. The first four
//! stages keep a stack of queue states so macro invocations get their own
//! private queue; Firmware is drained by the SPI interface and Executed
//! finalizes the code's outcome.

mod channel;
mod processor;
mod state;

pub use channel::ChannelPipeline;
pub use processor::{FirmwareQueue, MacroInvocation, Processor};
pub use state::{CodeReceiver, PipelineState, StateActivity};

use async_trait::async_trait;

use crate::code::Code;
use crate::error::Result;
use crate::message::Message;

/// Processing phases a code passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Start,
    Pre,
    ProcessInternally,
    Post,
    Firmware,
    Executed,
}

impl PipelineStage {
    /// All stages in processing order.
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Start,
        PipelineStage::Pre,
        PipelineStage::ProcessInternally,
        PipelineStage::Post,
        PipelineStage::Firmware,
        PipelineStage::Executed,
    ];

    /// Stages that keep a stack of states for macro nesting.
    pub const STACKED: [PipelineStage; 4] = [
        PipelineStage::Start,
        PipelineStage::Pre,
        PipelineStage::ProcessInternally,
        PipelineStage::Post,
    ];

    /// The stage a code moves to when the current one lets it pass.
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Start => Some(PipelineStage::Pre),
            PipelineStage::Pre => Some(PipelineStage::ProcessInternally),
            PipelineStage::ProcessInternally => Some(PipelineStage::Post),
            PipelineStage::Post => Some(PipelineStage::Firmware),
            PipelineStage::Firmware => Some(PipelineStage::Executed),
            PipelineStage::Executed => None,
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Start => "Start",
            PipelineStage::Pre => "Pre",
            PipelineStage::ProcessInternally => "ProcessInternally",
            PipelineStage::Post => "Post",
            PipelineStage::Firmware => "Firmware",
            PipelineStage::Executed => "Executed",
        };
        f.write_str(name)
    }
}

/// Where in the pipeline an interceptor is being consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterceptionMode {
    /// Before internal processing.
    Pre,
    /// After internal processing, before firmware dispatch.
    Post,
    /// After the code finished, before its outcome is settled.
    Executed,
}

/// External hook that may resolve a code instead of letting it pass.
///
/// Returning `Ok(true)` means the interceptor resolved the code: its reply
/// is taken as final and it jumps straight to the Executed stage.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, code: &mut Code, mode: InterceptionMode) -> Result<bool>;
}

/// Local G/M/T-code handling consulted at the ProcessInternally stage.
///
/// `Ok(Some(message))` resolves the code locally with that reply;
/// `Ok(None)` lets it continue towards the firmware.
#[async_trait]
pub trait CodeHandler: Send + Sync {
    async fn process(&self, code: &mut Code) -> Result<Option<Message>>;
}

/// Interceptor that lets every code pass.
pub struct NoInterception;

#[async_trait]
impl Interceptor for NoInterception {
    async fn intercept(&self, _code: &mut Code, _mode: InterceptionMode) -> Result<bool> {
        Ok(false)
    }
}

/// Handler that forwards every code to the firmware.
pub struct NoLocalHandling;

#[async_trait]
impl CodeHandler for NoLocalHandling {
    async fn process(&self, _code: &mut Code) -> Result<Option<Message>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order() {
        let mut stage = PipelineStage::Start;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, PipelineStage::ALL);
    }

    #[test]
    fn stacked_stages_stop_before_firmware() {
        assert!(!PipelineStage::STACKED.contains(&PipelineStage::Firmware));
        assert!(!PipelineStage::STACKED.contains(&PipelineStage::Executed));
    }
}
