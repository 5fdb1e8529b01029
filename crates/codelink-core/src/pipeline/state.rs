//! Per-stage queue states.
//!
//! A [`PipelineState`] is one FIFO of pending codes plus the bookkeeping
//! needed to tell whether the state is busy. Stages keep these on a stack;
//! the bottom state belongs to the channel itself and every macro nesting
//! level pushes another one on top.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::code::Code;
use crate::error::{Error, Result};

/// Occupancy tracking shared between a queue's writers and its drainer.
#[derive(Debug, Default)]
pub struct StateActivity {
    /// Codes enqueued but not yet picked up.
    pending: AtomicUsize,
    /// A code is currently being processed.
    executing: AtomicBool,
    idle: Notify,
}

impl StateActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn enqueued(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a dequeued code as executing.
    pub fn begin(&self) {
        self.executing.store(true, Ordering::Release);
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Dequeue without an execution phase (used by the firmware queue,
    /// where in-flight tracking happens in the SPI interface).
    pub fn dequeued(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        if self.pending.load(Ordering::Acquire) == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Mark the current code as done; wakes idle waiters when drained.
    pub fn end(&self) {
        self.executing.store(false, Ordering::Release);
        if self.pending.load(Ordering::Acquire) == 0 {
            self.idle.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0 || self.executing.load(Ordering::Acquire)
    }

    /// Wait until the queue is empty and nothing is executing.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }
}

/// Sending half of a state's queue.
#[derive(Debug, Clone)]
pub(crate) enum CodeSender {
    Bounded(mpsc::Sender<Code>),
    Unbounded(mpsc::UnboundedSender<Code>),
}

/// Receiving half, owned by the drainer (or the SPI interface).
#[derive(Debug)]
pub enum CodeReceiver {
    Bounded(mpsc::Receiver<Code>),
    Unbounded(mpsc::UnboundedReceiver<Code>),
}

impl CodeReceiver {
    /// Receive the next code; `None` once the state was popped and drained.
    pub async fn recv(&mut self) -> Option<Code> {
        match self {
            CodeReceiver::Bounded(rx) => rx.recv().await,
            CodeReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<Code> {
        match self {
            CodeReceiver::Bounded(rx) => rx.try_recv().ok(),
            CodeReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// One queue of pending codes within a stage's stack.
///
/// Clones share the same queue and occupancy tracking.
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Macro invocation this state belongs to; `None` for the channel itself.
    macro_id: Option<u64>,
    sender: CodeSender,
    activity: Arc<StateActivity>,
}

impl PipelineState {
    /// Create a bounded state and its receiver.
    pub fn bounded(macro_id: Option<u64>, capacity: usize) -> (Self, CodeReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                macro_id,
                sender: CodeSender::Bounded(tx),
                activity: StateActivity::new(),
            },
            CodeReceiver::Bounded(rx),
        )
    }

    /// Create an unbounded state and its receiver.
    pub fn unbounded(macro_id: Option<u64>) -> (Self, CodeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                macro_id,
                sender: CodeSender::Unbounded(tx),
                activity: StateActivity::new(),
            },
            CodeReceiver::Unbounded(rx),
        )
    }

    pub fn macro_id(&self) -> Option<u64> {
        self.macro_id
    }

    pub fn activity(&self) -> &Arc<StateActivity> {
        &self.activity
    }

    /// Enqueue a code, awaiting backpressure on bounded states.
    pub async fn send(&self, code: Code) -> Result<()> {
        let channel = code.channel;
        self.activity.enqueued();
        let result = match &self.sender {
            CodeSender::Bounded(tx) => tx.send(code).await.map_err(|_| ()),
            CodeSender::Unbounded(tx) => tx.send(code).map_err(|_| ()),
        };
        if result.is_err() {
            // Nothing will dequeue it; undo the occupancy count.
            self.activity.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ChannelClosed(channel));
        }
        Ok(())
    }
}
