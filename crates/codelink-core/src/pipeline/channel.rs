//! Per-channel stage bookkeeping.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::channel::CodeChannel;
use crate::code::{Code, CodeOutcome};
use crate::config::Settings;
use crate::error::{Error, Result};

use super::state::{CodeReceiver, PipelineState, StateActivity};
use super::PipelineStage;

/// Receivers produced at construction, consumed when drainers are spawned.
pub(crate) struct ChannelSeeds {
    /// Bottom state receiver per stacked stage, in stage order.
    pub stacked: Vec<(PipelineStage, CodeReceiver, Arc<StateActivity>)>,
    pub executed: (CodeReceiver, Arc<StateActivity>),
    pub firmware: (CodeReceiver, Arc<StateActivity>),
    pub firmware_priority: (CodeReceiver, Arc<StateActivity>),
}

/// All stage state of one channel.
///
/// The first four stages hold a stack of [`PipelineState`]; the bottom
/// element is the channel itself and is never popped. Firmware and Executed
/// are flat: the firmware queue is drained by the SPI interface and the
/// executed queue finalizes codes, neither nests.
pub struct ChannelPipeline {
    channel: CodeChannel,
    stacks: [Mutex<Vec<PipelineState>>; 4],
    firmware: PipelineState,
    firmware_priority: PipelineState,
    executed: PipelineState,
}

impl ChannelPipeline {
    pub(crate) fn new(channel: CodeChannel, settings: &Settings) -> (Self, ChannelSeeds) {
        let mut stacks = Vec::new();
        let mut stacked_seeds = Vec::new();
        for stage in PipelineStage::STACKED {
            let (state, rx) = PipelineState::bounded(None, settings.max_codes_per_input);
            stacked_seeds.push((stage, rx, Arc::clone(state.activity())));
            stacks.push(Mutex::new(vec![state]));
        }
        let stacks: [Mutex<Vec<PipelineState>>; 4] = match stacks.try_into() {
            Ok(stacks) => stacks,
            Err(_) => unreachable!("one stack per stacked stage"),
        };

        let (firmware, firmware_rx) = PipelineState::bounded(None, settings.max_buffered_codes);
        let (firmware_priority, priority_rx) = PipelineState::unbounded(None);
        let (executed, executed_rx) = PipelineState::unbounded(None);
        let seeds = ChannelSeeds {
            stacked: stacked_seeds,
            executed: (executed_rx, Arc::clone(executed.activity())),
            firmware: (firmware_rx, Arc::clone(firmware.activity())),
            firmware_priority: (priority_rx, Arc::clone(firmware_priority.activity())),
        };

        (
            Self {
                channel,
                stacks,
                firmware,
                firmware_priority,
                executed,
            },
            seeds,
        )
    }

    pub fn channel(&self) -> CodeChannel {
        self.channel
    }

    fn stack_index(stage: PipelineStage) -> usize {
        match stage {
            PipelineStage::Start => 0,
            PipelineStage::Pre => 1,
            PipelineStage::ProcessInternally => 2,
            PipelineStage::Post => 3,
            PipelineStage::Firmware | PipelineStage::Executed => {
                unreachable!("{stage} does not stack")
            }
        }
    }

    /// Pick the state a code belongs to and enqueue it there.
    ///
    /// Within stacked stages the code goes to the state whose macro matches
    /// its own, so macro codes stay in the macro's private queue. A code
    /// whose macro has no state any more is a dispatch bug: it is cancelled,
    /// never silently dropped.
    pub(crate) async fn write_code(&self, stage: PipelineStage, mut code: Code) -> Result<()> {
        let state = match stage {
            PipelineStage::Firmware => {
                if code.is_prioritized() {
                    self.firmware_priority.clone()
                } else {
                    self.firmware.clone()
                }
            }
            PipelineStage::Executed => self.executed.clone(),
            stacked => {
                let found = {
                    let stack = self.stacks[Self::stack_index(stacked)]
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    stack
                        .iter()
                        .rev()
                        .find(|state| state.macro_id() == code.macro_id)
                        .cloned()
                };
                match found {
                    Some(state) => state,
                    None => {
                        error!(
                            channel = %self.channel,
                            %stage,
                            code = %code,
                            macro_id = ?code.macro_id,
                            "no pipeline state matches this code's macro, cancelling"
                        );
                        let _ = code.settle(CodeOutcome::Cancelled);
                        return Err(Error::InvalidState {
                            expected: format!("pipeline state for macro {:?}", code.macro_id),
                            actual: "popped or never pushed".into(),
                        });
                    }
                }
            }
        };
        state.send(code).await
    }

    /// Push a macro state on top of one stacked stage.
    pub(crate) fn push_state(&self, stage: PipelineStage, state: PipelineState) {
        self.stacks[Self::stack_index(stage)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(state);
    }

    /// Pop the top state of one stacked stage.
    ///
    /// Panics on underrun: the bottom state is the channel itself and macro
    /// push/pop pairing is balanced by construction.
    pub(crate) fn pop_state(&self, stage: PipelineStage) -> PipelineState {
        let mut stack = self.stacks[Self::stack_index(stage)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if stack.len() <= 1 {
            panic!("pipeline stack underrun on {}/{stage}", self.channel);
        }
        stack.pop().unwrap_or_else(|| unreachable!())
    }

    /// Current nesting depth of a stacked stage (1 = no macro active).
    pub fn stack_depth(&self, stage: PipelineStage) -> usize {
        self.stacks[Self::stack_index(stage)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Wait until every stage has drained the given macro context.
    ///
    /// Stages are awaited in processing order so a code observed idle in an
    /// early stage has either finished or moved to a later one.
    pub async fn wait_for_idle(&self, macro_id: Option<u64>) {
        for stage in PipelineStage::STACKED {
            let activity = {
                let stack = self.stacks[Self::stack_index(stage)]
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                stack
                    .iter()
                    .rev()
                    .find(|state| state.macro_id() == macro_id)
                    .map(|state| Arc::clone(state.activity()))
            };
            if let Some(activity) = activity {
                activity.wait_for_idle().await;
            }
        }
        self.firmware_priority.activity().wait_for_idle().await;
        self.firmware.activity().wait_for_idle().await;
        self.executed.activity().wait_for_idle().await;
    }

    /// Human-readable stage trace for fault reports; idle stages collapse.
    pub fn diagnostics(&self) -> String {
        let mut lines = String::new();
        for stage in PipelineStage::STACKED {
            let stack = self.stacks[Self::stack_index(stage)]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (level, state) in stack.iter().enumerate() {
                if !state.activity().is_busy() {
                    continue;
                }
                let owner = match state.macro_id() {
                    Some(id) => format!("macro {id}"),
                    None => "channel".into(),
                };
                let _ = writeln!(
                    lines,
                    "  {stage}[{level}] ({owner}): {} pending",
                    state.activity().pending()
                );
            }
        }
        for (name, state) in [
            ("Firmware", &self.firmware),
            ("Firmware (priority)", &self.firmware_priority),
            ("Executed", &self.executed),
        ] {
            if state.activity().is_busy() {
                let _ = writeln!(lines, "  {name}: {} pending", state.activity().pending());
            }
        }

        if lines.is_empty() {
            format!("Channel {} is idle\n", self.channel)
        } else {
            format!("Channel {}:\n{lines}", self.channel)
        }
    }
}
