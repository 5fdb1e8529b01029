//! The code processor: owns all channel pipelines and their drainer tasks.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cancellation::TokenSource;
use crate::channel::{ChannelMap, CodeChannel};
use crate::code::{Code, CodeFlags, CodeHandle, CodeOutcome, CodeType};
use crate::config::Settings;
use crate::error::Result;
use crate::model::ModelProvider;

use super::channel::{ChannelPipeline, ChannelSeeds};
use super::state::{CodeReceiver, PipelineState, StateActivity};
use super::{CodeHandler, InterceptionMode, Interceptor, PipelineStage};

/// Consuming side of one channel's Firmware stage.
///
/// Handed to the SPI interface at construction; prioritized codes are
/// always delivered ahead of queued ones.
pub struct FirmwareQueue {
    channel: CodeChannel,
    normal: CodeReceiver,
    normal_activity: Arc<StateActivity>,
    priority: CodeReceiver,
    priority_activity: Arc<StateActivity>,
}

impl FirmwareQueue {
    pub fn channel(&self) -> CodeChannel {
        self.channel
    }

    /// Receive the next code bound for the firmware.
    pub async fn recv(&mut self) -> Option<Code> {
        tokio::select! {
            biased;
            code = self.priority.recv() => match code {
                Some(code) => {
                    self.priority_activity.dequeued();
                    Some(code)
                }
                // Priority sender gone means the pipeline is shutting down;
                // drain what the normal queue still buffers.
                None => {
                    let code = self.normal.recv().await;
                    if code.is_some() {
                        self.normal_activity.dequeued();
                    }
                    code
                }
            },
            code = self.normal.recv() => {
                if code.is_some() {
                    self.normal_activity.dequeued();
                }
                code
            }
        }
    }

    /// Non-blocking receive, priority queue first.
    pub fn try_recv(&mut self) -> Option<Code> {
        if let Some(code) = self.priority.try_recv() {
            self.priority_activity.dequeued();
            return Some(code);
        }
        let code = self.normal.try_recv();
        if code.is_some() {
            self.normal_activity.dequeued();
        }
        code
    }
}

/// A running macro context across all stacked stages of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroInvocation {
    pub id: u64,
    pub channel: CodeChannel,
    pub filename: String,
}

struct Inner {
    settings: Settings,
    model: ModelProvider,
    interceptor: Box<dyn Interceptor>,
    handler: Box<dyn CodeHandler>,
    channels: ChannelMap<ChannelPipeline>,
    tokens: ChannelMap<TokenSource>,
    next_macro_id: AtomicU64,
}

/// Entry point for code execution.
///
/// Cheap to clone. Construction spawns one drainer task per queue state
/// (none for the Firmware stage, whose queues are returned to the caller
/// for the SPI interface to consume).
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

impl Processor {
    pub fn new(
        settings: Settings,
        model: ModelProvider,
        interceptor: Box<dyn Interceptor>,
        handler: Box<dyn CodeHandler>,
    ) -> (Self, ChannelMap<FirmwareQueue>) {
        let mut seeds: Vec<ChannelSeeds> = Vec::new();
        let channels = ChannelMap::new(|channel| {
            let (pipeline, seed) = ChannelPipeline::new(channel, &settings);
            seeds.push(seed);
            pipeline
        });

        let inner = Arc::new(Inner {
            settings,
            model,
            interceptor,
            handler,
            channels,
            tokens: ChannelMap::new(|_| TokenSource::new()),
            next_macro_id: AtomicU64::new(1),
        });

        let mut seeds = seeds.into_iter();
        let firmware_queues = ChannelMap::new(|channel| {
            let seed = match seeds.next() {
                Some(seed) => seed,
                None => unreachable!("one seed per channel"),
            };
            for (stage, rx, activity) in seed.stacked {
                spawn_drainer(Arc::clone(&inner), channel, stage, rx, activity);
            }
            let (rx, activity) = seed.executed;
            spawn_drainer(
                Arc::clone(&inner),
                channel,
                PipelineStage::Executed,
                rx,
                activity,
            );
            FirmwareQueue {
                channel,
                normal: seed.firmware.0,
                normal_activity: seed.firmware.1,
                priority: seed.firmware_priority.0,
                priority_activity: seed.firmware_priority.1,
            }
        });

        (Self { inner }, firmware_queues)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn model(&self) -> &ModelProvider {
        &self.inner.model
    }

    /// Submit a code to its channel's pipeline.
    ///
    /// The code is bound to the channel's current cancellation token and a
    /// handle for awaiting its outcome is returned. Prioritized codes skip
    /// the stage queues and run inline on a dedicated task.
    pub async fn start_code(&self, code: Code) -> Result<CodeHandle> {
        let channel = code.channel;
        let mut code = code.with_token(self.inner.tokens[channel].current());
        let handle = code.take_handle();
        if code.is_prioritized() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.advance(PipelineStage::Start, code).await;
            });
        } else {
            self.inner.channels[code.channel]
                .write_code(PipelineStage::Start, code)
                .await?;
        }
        Ok(handle)
    }

    /// Hand a firmware-completed code to the Executed stage.
    pub async fn code_completed(&self, code: Code) {
        // Executed queues are unbounded, this never blocks for long.
        let _ = self.inner.channels[code.channel]
            .write_code(PipelineStage::Executed, code)
            .await;
    }

    /// Open a macro context: every stacked stage gets a private queue.
    pub fn push_macro(&self, channel: CodeChannel, filename: &str) -> MacroInvocation {
        let id = self.inner.next_macro_id.fetch_add(1, Ordering::Relaxed);
        for stage in PipelineStage::STACKED {
            let (state, rx) =
                PipelineState::bounded(Some(id), self.inner.settings.max_codes_per_input);
            let activity = Arc::clone(state.activity());
            self.inner.channels[channel].push_state(stage, state);
            spawn_drainer(Arc::clone(&self.inner), channel, stage, rx, activity);
        }
        info!(%channel, id, filename, "macro context pushed");
        MacroInvocation {
            id,
            channel,
            filename: filename.to_string(),
        }
    }

    /// Close a macro context after its codes have drained.
    pub async fn pop_macro(&self, invocation: &MacroInvocation) {
        self.inner.channels[invocation.channel]
            .wait_for_idle(Some(invocation.id))
            .await;
        for stage in PipelineStage::STACKED {
            let popped = self.inner.channels[invocation.channel].pop_state(stage);
            if popped.macro_id() != Some(invocation.id) {
                // Pairing is balanced by construction; anything else is a bug.
                panic!(
                    "macro pop mismatch on {}/{stage}: expected {:?}, found {:?}",
                    invocation.channel,
                    invocation.id,
                    popped.macro_id()
                );
            }
        }
        info!(channel = %invocation.channel, id = invocation.id, "macro context popped");
    }

    /// Invalidate a channel: every code holding its current token cancels.
    pub fn cancel_channel(&self, channel: CodeChannel) {
        info!(%channel, "invalidating channel");
        self.inner.tokens[channel].invalidate();
    }

    /// Invalidate every channel, e.g. on connection teardown.
    pub fn cancel_all(&self) {
        for (channel, source) in self.inner.tokens.iter() {
            debug!(%channel, "invalidating channel");
            source.invalidate();
        }
    }

    /// Wait until a channel has no pending or executing codes.
    pub async fn flush(&self, channel: CodeChannel) {
        self.inner.channels[channel].wait_for_idle(None).await;
    }

    /// Nesting depth of a channel's stacked stages (1 = no macro).
    pub fn stack_depth(&self, channel: CodeChannel) -> usize {
        self.inner.channels[channel].stack_depth(PipelineStage::Start)
    }

    /// Per-channel pipeline trace for fault reports.
    pub fn diagnostics(&self) -> String {
        let mut out = String::from("=== Code pipelines ===\n");
        for (_, pipeline) in self.inner.channels.iter() {
            let _ = write!(out, "{}", pipeline.diagnostics());
        }
        out
    }
}

fn spawn_drainer(
    inner: Arc<Inner>,
    channel: CodeChannel,
    stage: PipelineStage,
    mut rx: CodeReceiver,
    activity: Arc<StateActivity>,
) {
    tokio::spawn(async move {
        while let Some(code) = rx.recv().await {
            activity.begin();
            inner.advance(stage, code).await;
            activity.end();
        }
        debug!(%channel, %stage, "pipeline state drained and closed");
    });
}

impl Inner {
    /// Move a code through the pipeline, starting at `stage`.
    ///
    /// Queued codes take one step and are re-enqueued at the next stage so
    /// every stage keeps FIFO discipline; prioritized codes run all stages
    /// inline. Stage errors settle the code as Failed and never propagate,
    /// so one bad code cannot stall its siblings.
    async fn advance(&self, mut stage: PipelineStage, mut code: Code) {
        loop {
            let next = match self.step(stage, &mut code).await {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(err) => {
                    error!(
                        channel = %code.channel,
                        %stage,
                        code = %code,
                        error = %err,
                        "stage processing failed"
                    );
                    if let Err(settle_err) = code.settle(CodeOutcome::Failed(err.to_string())) {
                        warn!(error = %settle_err, "failed code could not be settled");
                    }
                    return;
                }
            };

            // Comments never reach the firmware.
            let next = if next == PipelineStage::Firmware && code.code_type == CodeType::Comment {
                PipelineStage::Executed
            } else {
                next
            };

            if next == PipelineStage::Firmware {
                let _ = self.channels[code.channel].write_code(next, code).await;
                return;
            }
            if code.is_prioritized() {
                stage = next;
                continue;
            }
            // This await is the backpressure point for the next stage.
            let _ = self.channels[code.channel].write_code(next, code).await;
            return;
        }
    }

    /// Run one stage. `Ok(Some(stage))` forwards, `Ok(None)` means done.
    async fn step(&self, stage: PipelineStage, code: &mut Code) -> Result<Option<PipelineStage>> {
        if code.is_cancelled() && stage != PipelineStage::Executed {
            return Ok(Some(PipelineStage::Executed));
        }
        match stage {
            PipelineStage::Start => Ok(Some(PipelineStage::Pre)),
            PipelineStage::Pre => {
                self.intercept_step(
                    code,
                    InterceptionMode::Pre,
                    CodeFlags::PRE_PROCESSED,
                    PipelineStage::ProcessInternally,
                )
                .await
            }
            PipelineStage::ProcessInternally => self.internal_step(code).await,
            PipelineStage::Post => {
                self.intercept_step(
                    code,
                    InterceptionMode::Post,
                    CodeFlags::POST_PROCESSED,
                    PipelineStage::Firmware,
                )
                .await
            }
            PipelineStage::Firmware => {
                unreachable!("firmware stage is drained by the SPI interface")
            }
            PipelineStage::Executed => {
                self.finish(code).await;
                Ok(None)
            }
        }
    }

    async fn intercept_step(
        &self,
        code: &mut Code,
        mode: InterceptionMode,
        seen: CodeFlags,
        pass: PipelineStage,
    ) -> Result<Option<PipelineStage>> {
        // The "seen" flag is idempotency protection against re-entry.
        if code.flags.contains(seen) {
            return Ok(Some(pass));
        }
        let resolved = self.interceptor.intercept(code, mode).await?;
        code.flags |= seen;
        if resolved {
            debug!(channel = %code.channel, code = %code, ?mode, "code resolved by interceptor");
            Ok(Some(PipelineStage::Executed))
        } else {
            Ok(Some(pass))
        }
    }

    async fn internal_step(&self, code: &mut Code) -> Result<Option<PipelineStage>> {
        if code.flags.contains(CodeFlags::INTERNALLY_PROCESSED) {
            return Ok(Some(PipelineStage::Post));
        }
        match self.handler.process(code).await? {
            Some(message) => {
                code.reply.append(&message);
                debug!(channel = %code.channel, code = %code, "code handled internally");
                Ok(Some(PipelineStage::Executed))
            }
            None => {
                code.flags |= CodeFlags::INTERNALLY_PROCESSED;
                Ok(Some(PipelineStage::Post))
            }
        }
    }

    /// Finalize a code: last interception pass, emulation fixups, settling.
    async fn finish(&self, code: &mut Code) {
        let cancelled = code.is_cancelled();
        if !cancelled {
            if let Err(err) = self
                .interceptor
                .intercept(code, InterceptionMode::Executed)
                .await
            {
                warn!(code = %code, error = %err, "executed-stage interception failed");
            }

            // Naive Marlin terminals hang without a trailing "ok".
            if self.settings.emulates_marlin(code.channel)
                && !code.is_from_macro()
                && code.code_type != CodeType::Comment
            {
                if code.reply.content.is_empty() {
                    code.reply.content.push_str("ok");
                } else if !code.reply.content.ends_with("ok") {
                    code.reply.content.push_str("\nok");
                }
            }
        }

        let outcome = if cancelled {
            CodeOutcome::Cancelled
        } else {
            CodeOutcome::Resolved(code.reply.clone())
        };

        // Results nobody awaits go to the generic message stream instead.
        if !cancelled && !code.has_awaiter() && !code.reply.is_empty() {
            self.model.publish(code.reply.clone());
        }

        debug!(channel = %code.channel, code = %code, cancelled, "code executed");
        if let Err(err) = code.settle(outcome) {
            warn!(error = %err, "executed code could not be settled");
        }
    }
}
