//! Shared machine model snapshot.
//!
//! A deliberately small typed view of the machine: status, job state, and
//! the raw per-module JSON fragments the firmware reports. Everything lives
//! behind one async reader/writer lock; writers hold it only for single
//! mutations and never across calls into interceptors.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::file_info::{PrintFileInfo, PrintStoppedReason};
use crate::message::Message;
use crate::protocol::reader::PrintPauseReason;

/// Overall machine status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineStatus {
    /// Daemon is up but the firmware link is not established yet.
    Starting,
    Idle,
    Busy,
    /// A print job is running.
    Processing,
    Pausing,
    Paused,
    Resuming,
    /// Emergency stop was triggered.
    Halted,
    Off,
}

/// State of the current (or last) print job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub file: Option<PrintFileInfo>,
    /// File position at which the job was paused, if it is paused.
    pub pause_position: Option<u32>,
    pub pause_reason: Option<PrintPauseReason>,
    pub last_stop_reason: Option<PrintStoppedReason>,
}

/// The mutable model tree.
#[derive(Debug)]
pub struct Model {
    pub status: MachineStatus,
    pub job: JobState,
    /// Raw JSON fragments keyed by firmware module number.
    pub modules: HashMap<u8, serde_json::Value>,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            status: MachineStatus::Starting,
            job: JobState::default(),
            modules: HashMap::new(),
        }
    }
}

/// Handle to the shared model plus the message fan-out.
///
/// Cheap to clone; all clones see the same model.
#[derive(Clone)]
pub struct ModelProvider {
    inner: Arc<RwLock<Model>>,
    messages: broadcast::Sender<Message>,
}

impl ModelProvider {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(RwLock::new(Model::default())),
            messages,
        }
    }

    /// Acquire the model for reading. Many readers may hold it at once.
    pub async fn read(&self) -> RwLockReadGuard<'_, Model> {
        self.inner.read().await
    }

    /// Acquire the model for writing. Exclusive; keep the scope small.
    pub async fn write(&self) -> RwLockWriteGuard<'_, Model> {
        self.inner.write().await
    }

    pub async fn status(&self) -> MachineStatus {
        self.inner.read().await.status
    }

    pub async fn set_status(&self, status: MachineStatus) {
        let mut model = self.inner.write().await;
        if model.status != status {
            debug!(?status, "machine status changed");
            model.status = status;
        }
    }

    /// Replace one module's JSON fragment with fresh firmware data.
    pub async fn update_module(&self, module: u8, json: serde_json::Value) {
        self.inner.write().await.modules.insert(module, json);
    }

    pub async fn print_started(&self, info: PrintFileInfo) {
        let mut model = self.inner.write().await;
        model.job = JobState {
            file: Some(info),
            ..JobState::default()
        };
        model.status = MachineStatus::Processing;
    }

    pub async fn print_paused(&self, position: u32, reason: PrintPauseReason) {
        let mut model = self.inner.write().await;
        model.job.pause_position = Some(position);
        model.job.pause_reason = Some(reason);
        model.status = MachineStatus::Paused;
    }

    pub async fn print_stopped(&self, reason: PrintStoppedReason) {
        let mut model = self.inner.write().await;
        model.job.pause_position = None;
        model.job.pause_reason = None;
        model.job.last_stop_reason = Some(reason);
        model.status = MachineStatus::Idle;
    }

    /// Fan a generic message out to every subscriber.
    pub fn publish(&self, message: Message) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.messages.send(message);
    }

    /// Subscribe to the generic message stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }
}

impl Default for ModelProvider {
    fn default() -> Self {
        Self::new()
    }
}
