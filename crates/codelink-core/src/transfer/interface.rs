//! SPI interface: the long-lived task bridging the pipeline and the engine.
//!
//! Consumes the Firmware-stage queues, turns codes and control commands
//! into outgoing packets, decodes everything the firmware sends back, and
//! keeps the machine model in sync. Other components talk to it through a
//! [`SpiCommander`] and listen on the event stream.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationToken;
use crate::channel::{ChannelMap, CodeChannel};
use crate::code::{Code, ParameterValue};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::file_info::{PrintFileInfo, PrintStoppedReason};
use crate::heightmap::Heightmap;
use crate::message::{Message, MessageTypeFlags};
use crate::model::MachineStatus;
use crate::pipeline::{FirmwareQueue, MacroInvocation, Processor};
use crate::protocol::reader::{self, PrintPauseReason};
use crate::protocol::{writer, FirmwareRequest, HostRequest};

use super::engine::{ReceivedPacket, TransferEngine};
use super::transport::SpiTransport;

/// Commands other components may send to the SPI loop.
enum ControlRequest {
    EmergencyStop,
    Reset,
    GetObjectModel {
        module: u8,
        respond: oneshot::Sender<String>,
    },
    SetObjectModel {
        field: String,
        value: ParameterValue,
    },
    PrintStarted(Box<PrintFileInfo>),
    PrintStopped(PrintStoppedReason),
    GetHeightmap {
        respond: oneshot::Sender<Heightmap>,
    },
    SetHeightmap(Heightmap),
    LockMovement {
        channel: CodeChannel,
        respond: oneshot::Sender<()>,
    },
    Unlock(CodeChannel),
    MacroCompleted {
        channel: CodeChannel,
        error: bool,
    },
    Diagnostics {
        respond: oneshot::Sender<String>,
    },
}

/// Notifications the SPI loop emits for the daemon to act on.
#[derive(Debug)]
pub enum SpiEvent {
    /// The firmware link is up.
    Connected,
    /// The firmware restarted; all in-flight state was dropped.
    FirmwareReset,
    /// The firmware asked for a macro file to be run on a channel.
    MacroRequested {
        invocation: MacroInvocation,
        report_missing: bool,
    },
    /// The firmware asked to close all files on a channel.
    FileAborted(CodeChannel),
    /// The firmware paused the print.
    PrintPaused {
        file_position: u32,
        reason: PrintPauseReason,
    },
    /// The firmware pushed or popped its own G-code state.
    StackChanged { channel: CodeChannel, depth: u8 },
}

/// Cloneable handle for sending control commands to the SPI loop.
#[derive(Clone)]
pub struct SpiCommander {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl SpiCommander {
    fn send(&self, request: ControlRequest) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| Error::ConnectionClosed)
    }

    pub fn emergency_stop(&self) -> Result<()> {
        self.send(ControlRequest::EmergencyStop)
    }

    pub fn reset(&self) -> Result<()> {
        self.send(ControlRequest::Reset)
    }

    /// Fetch one object model module as raw JSON.
    pub async fn object_model(&self, module: u8) -> Result<String> {
        let (respond, rx) = oneshot::channel();
        self.send(ControlRequest::GetObjectModel { module, respond })?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    pub fn set_object_model(&self, field: impl Into<String>, value: ParameterValue) -> Result<()> {
        self.send(ControlRequest::SetObjectModel {
            field: field.into(),
            value,
        })
    }

    pub fn print_started(&self, info: PrintFileInfo) -> Result<()> {
        self.send(ControlRequest::PrintStarted(Box::new(info)))
    }

    pub fn print_stopped(&self, reason: PrintStoppedReason) -> Result<()> {
        self.send(ControlRequest::PrintStopped(reason))
    }

    pub async fn heightmap(&self) -> Result<Heightmap> {
        let (respond, rx) = oneshot::channel();
        self.send(ControlRequest::GetHeightmap { respond })?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    pub fn set_heightmap(&self, map: Heightmap) -> Result<()> {
        self.send(ControlRequest::SetHeightmap(map))
    }

    /// Lock movement and wait for standstill on behalf of a channel.
    pub async fn lock_movement(&self, channel: CodeChannel) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.send(ControlRequest::LockMovement { channel, respond })?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    pub fn unlock(&self, channel: CodeChannel) -> Result<()> {
        self.send(ControlRequest::Unlock(channel))
    }

    /// Report that a firmware-requested macro has finished.
    pub fn macro_completed(&self, channel: CodeChannel, error: bool) -> Result<()> {
        self.send(ControlRequest::MacroCompleted { channel, error })
    }

    /// Full diagnostics text (pipelines plus transfer statistics).
    pub async fn diagnostics(&self) -> Result<String> {
        let (respond, rx) = oneshot::channel();
        self.send(ControlRequest::Diagnostics { respond })?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }
}

pub struct SpiInterface<T> {
    engine: TransferEngine<T>,
    processor: Processor,
    queues: ChannelMap<FirmwareQueue>,
    settings: Settings,
    /// Codes sent to the firmware, awaiting their reply, FIFO per channel.
    pending: ChannelMap<VecDeque<Code>>,
    /// A code that did not fit the current cycle; goes out first next cycle.
    deferred: ChannelMap<Option<Code>>,
    /// Firmware-requested macro contexts per channel, innermost last.
    macros: ChannelMap<Vec<MacroInvocation>>,
    lock_waiters: ChannelMap<VecDeque<oneshot::Sender<()>>>,
    model_waiters: VecDeque<(u8, oneshot::Sender<String>)>,
    heightmap_waiters: VecDeque<oneshot::Sender<Heightmap>>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    events: mpsc::UnboundedSender<SpiEvent>,
}

impl<T: SpiTransport> SpiInterface<T> {
    pub fn new(
        transport: T,
        processor: Processor,
        queues: ChannelMap<FirmwareQueue>,
        settings: Settings,
    ) -> (Self, SpiCommander, mpsc::UnboundedReceiver<SpiEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = TransferEngine::with_settings(transport, &settings);
        (
            Self {
                engine,
                processor,
                queues,
                settings,
                pending: ChannelMap::new(|_| VecDeque::new()),
                deferred: ChannelMap::new(|_| None),
                macros: ChannelMap::new(|_| Vec::new()),
                lock_waiters: ChannelMap::new(|_| VecDeque::new()),
                model_waiters: VecDeque::new(),
                heightmap_waiters: VecDeque::new(),
                control_rx,
                events,
            },
            SpiCommander { tx: control_tx },
            events_rx,
        )
    }

    /// Drive the SPI link until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!("SPI interface starting");
        loop {
            if shutdown.is_cancelled() {
                info!("SPI interface shutting down");
                self.drop_connection_state().await;
                return Ok(());
            }

            if !self.engine.is_connected() {
                match self.engine.connect().await {
                    Ok(packets) => {
                        info!("connected to firmware");
                        self.processor.model().set_status(MachineStatus::Idle).await;
                        let _ = self.events.send(SpiEvent::Connected);
                        // Ask for a fresh model snapshot right away.
                        let _ = self.engine.write_packet(HostRequest::GetObjectModel, |buf| {
                            Ok(writer::write_get_object_model(buf, 0))
                        });
                        self.handle_packets(packets).await;
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        debug!(error = %err, "firmware not reachable yet");
                        tokio::time::sleep(self.settings.spi_connect_retry_delay()).await;
                    }
                }
                continue;
            }

            self.queue_control_requests().await;
            self.queue_codes().await;

            match self.engine.perform_transfer().await {
                Ok(packets) => {
                    if self.engine.check_reset() {
                        warn!("firmware restarted, renegotiating");
                        self.engine.reset_connection();
                        self.drop_connection_state().await;
                        let _ = self.events.send(SpiEvent::FirmwareReset);
                        continue;
                    }
                    self.handle_packets(packets).await;
                }
                Err(err @ (Error::BadFormat(_) | Error::BadProtocolVersion(_))) => {
                    // The peer speaks a different protocol; retrying is futile.
                    error!(error = %err, "incompatible firmware");
                    return Err(err);
                }
                Err(err) => {
                    warn!(error = %err, "transfer failed");
                    if !self.engine.is_connected() {
                        self.drop_connection_state().await;
                        tokio::time::sleep(self.settings.spi_connect_retry_delay()).await;
                    }
                }
            }
        }
    }

    /// Move queued control commands into the transmit buffer.
    async fn queue_control_requests(&mut self) {
        while let Ok(request) = self.control_rx.try_recv() {
            if let Err(err) = self.queue_control_request(request).await {
                warn!(error = %err, "control request could not be queued");
            }
        }
    }

    async fn queue_control_request(&mut self, request: ControlRequest) -> Result<()> {
        match request {
            ControlRequest::EmergencyStop => {
                warn!("emergency stop");
                self.engine.write_empty_packet(HostRequest::EmergencyStop)?;
                self.processor
                    .model()
                    .set_status(MachineStatus::Halted)
                    .await;
                self.cancel_everything().await;
            }
            ControlRequest::Reset => {
                info!("firmware reset requested");
                self.engine.write_empty_packet(HostRequest::Reset)?;
            }
            ControlRequest::GetObjectModel { module, respond } => {
                self.engine.write_packet(HostRequest::GetObjectModel, |buf| {
                    Ok(writer::write_get_object_model(buf, module))
                })?;
                self.model_waiters.push_back((module, respond));
            }
            ControlRequest::SetObjectModel { field, value } => {
                self.engine.write_packet(HostRequest::SetObjectModel, |buf| {
                    writer::write_set_object_model(buf, &field, &value)
                })?;
            }
            ControlRequest::PrintStarted(info) => {
                self.engine.write_packet(HostRequest::PrintStarted, |buf| {
                    writer::write_print_started(buf, &info)
                })?;
                self.processor.model().print_started(*info).await;
            }
            ControlRequest::PrintStopped(reason) => {
                self.engine.write_packet(HostRequest::PrintStopped, |buf| {
                    Ok(writer::write_print_stopped(buf, reason))
                })?;
                self.processor.model().print_stopped(reason).await;
            }
            ControlRequest::GetHeightmap { respond } => {
                self.engine.write_empty_packet(HostRequest::GetHeightmap)?;
                self.heightmap_waiters.push_back(respond);
            }
            ControlRequest::SetHeightmap(map) => {
                self.engine.write_packet(HostRequest::SetHeightmap, |buf| {
                    writer::write_heightmap(buf, &map)
                })?;
            }
            ControlRequest::LockMovement { channel, respond } => {
                self.engine
                    .write_packet(HostRequest::LockMovementAndWaitForStandstill, |buf| {
                        Ok(writer::write_lock_unlock(buf, channel))
                    })?;
                self.lock_waiters[channel].push_back(respond);
            }
            ControlRequest::Unlock(channel) => {
                self.engine.write_packet(HostRequest::Unlock, |buf| {
                    Ok(writer::write_lock_unlock(buf, channel))
                })?;
            }
            ControlRequest::MacroCompleted { channel, error } => {
                if let Some(invocation) = self.macros[channel].pop() {
                    self.processor.pop_macro(&invocation).await;
                }
                self.engine.write_packet(HostRequest::MacroCompleted, |buf| {
                    Ok(writer::write_macro_completed(buf, channel, error))
                })?;
            }
            ControlRequest::Diagnostics { respond } => {
                let mut report = self.processor.diagnostics();
                report.push_str(&format!(
                    "Full transfers per second: {:.2}\n",
                    self.engine.transfers_per_second()
                ));
                let _ = respond.send(report);
            }
        }
        Ok(())
    }

    /// Pull ready codes from the Firmware-stage queues into the buffer.
    async fn queue_codes(&mut self) {
        for channel in CodeChannel::ALL {
            if let Some(code) = self.deferred[channel].take() {
                if !self.try_send_code(code).await {
                    continue;
                }
            }
            loop {
                let Some(code) = self.queues[channel].try_recv() else {
                    break;
                };
                if !self.try_send_code(code).await {
                    break;
                }
            }
        }
    }

    /// Encode one code; returns false when the cycle is full.
    async fn try_send_code(&mut self, mut code: Code) -> bool {
        let channel = code.channel;
        if code.is_cancelled() {
            self.processor.code_completed(code).await;
            return true;
        }
        match self
            .engine
            .write_packet(HostRequest::Code, |buf| writer::write_code(buf, &code))
        {
            Ok(id) => {
                debug!(%channel, packet = id, code = %code, "code sent to firmware");
                self.pending[channel].push_back(code);
                true
            }
            Err(Error::PacketTooLong { .. }) => {
                self.deferred[channel] = Some(code);
                false
            }
            Err(err) => {
                error!(%channel, code = %code, error = %err, "code could not be encoded");
                code.reply.append(&Message::error(err.to_string()));
                self.processor.code_completed(code).await;
                true
            }
        }
    }

    /// Process everything a cycle delivered. A packet the interface cannot
    /// decode is logged and dropped; the link itself stays up.
    async fn handle_packets(&mut self, packets: Vec<ReceivedPacket>) {
        for packet in packets {
            if let Err(err) = self.handle_packet(packet).await {
                warn!(error = %err, "discarding undecodable firmware packet");
            }
        }
    }

    async fn handle_packet(&mut self, packet: ReceivedPacket) -> Result<()> {
        let request = FirmwareRequest::try_from(packet.header.request)?;
        let data = packet.data.as_slice();
        let length = packet.header.length;
        match request {
            FirmwareRequest::ResendPacket => {
                self.engine.resend_packet(packet.header.resend_packet_id)?;
            }
            FirmwareRequest::ObjectModel => {
                let (_, module, json) = reader::read_object_model(data, length)?;
                match serde_json::from_str(&json) {
                    Ok(value) => self.processor.model().update_module(module, value).await,
                    Err(err) => warn!(module, error = %err, "unparseable model fragment"),
                }
                if let Some(pos) = self.model_waiters.iter().position(|(m, _)| *m == module) {
                    if let Some((_, respond)) = self.model_waiters.remove(pos) {
                        let _ = respond.send(json);
                    }
                }
            }
            FirmwareRequest::CodeReply => {
                let (_, reply) = reader::read_code_reply(data, length)?;
                self.handle_code_reply(reply).await;
            }
            FirmwareRequest::MacroRequest => {
                let (_, request) = reader::read_macro_request(data, length)?;
                info!(
                    channel = %request.channel,
                    filename = request.filename,
                    "firmware requested macro"
                );
                let invocation = self
                    .processor
                    .push_macro(request.channel, &request.filename);
                self.macros[request.channel].push(invocation.clone());
                let _ = self.events.send(SpiEvent::MacroRequested {
                    invocation,
                    report_missing: request.report_missing,
                });
            }
            FirmwareRequest::AbortFile => {
                let (_, channel) = reader::read_abort_file(data)?;
                warn!(%channel, "firmware aborted file");
                self.processor.cancel_channel(channel);
                let _ = self.events.send(SpiEvent::FileAborted(channel));
            }
            FirmwareRequest::StackEvent => {
                let (_, event) = reader::read_stack_event(data)?;
                debug!(
                    channel = %event.channel,
                    depth = event.depth,
                    feedrate = event.feedrate,
                    "firmware stack changed"
                );
                let _ = self.events.send(SpiEvent::StackChanged {
                    channel: event.channel,
                    depth: event.depth,
                });
            }
            FirmwareRequest::PrintPaused => {
                let (_, file_position, reason) = reader::read_print_paused(data)?;
                info!(file_position, ?reason, "print paused by firmware");
                // Codes queued from the file are stale once the pause lands.
                self.processor.cancel_channel(CodeChannel::File);
                self.processor.model().print_paused(file_position, reason).await;
                let _ = self.events.send(SpiEvent::PrintPaused {
                    file_position,
                    reason,
                });
            }
            FirmwareRequest::Heightmap => {
                let (_, map) = reader::read_heightmap(data)?;
                if let Some(respond) = self.heightmap_waiters.pop_front() {
                    let _ = respond.send(map);
                } else {
                    debug!("unsolicited heightmap ignored");
                }
            }
            FirmwareRequest::Locked => {
                let (_, channel) = reader::read_resource_locked(data)?;
                if let Some(respond) = self.lock_waiters[channel].pop_front() {
                    let _ = respond.send(());
                } else {
                    warn!(%channel, "unexpected lock confirmation");
                }
            }
        }
        Ok(())
    }

    /// Route a firmware reply to the pending codes of its target channels.
    async fn handle_code_reply(&mut self, reply: reader::CodeReply) {
        let push = reply.flags.contains(MessageTypeFlags::PUSH);
        let message = Message::new(reply.flags.message_type(), reply.content);
        let mut delivered = false;
        for channel in CodeChannel::ALL {
            if !reply.flags.targets(channel) {
                continue;
            }
            if let Some(front) = self.pending[channel].front_mut() {
                front.reply.append(&message);
                if !push {
                    if let Some(code) = self.pending[channel].pop_front() {
                        self.processor.code_completed(code).await;
                    }
                }
                delivered = true;
            }
        }
        if !delivered && !message.is_empty() {
            // Replies with no waiting code go to the generic output stream.
            self.processor.model().publish(message);
        }
    }

    /// Cancel all channels and fail everything waiting on the link.
    async fn cancel_everything(&mut self) {
        self.processor.cancel_all();
        for channel in CodeChannel::ALL {
            if let Some(code) = self.deferred[channel].take() {
                self.processor.code_completed(code).await;
            }
            while let Some(code) = self.pending[channel].pop_front() {
                self.processor.code_completed(code).await;
            }
            self.lock_waiters[channel].clear();
            self.macros[channel].clear();
        }
        self.model_waiters.clear();
        self.heightmap_waiters.clear();
    }

    async fn drop_connection_state(&mut self) {
        self.cancel_everything().await;
        self.processor
            .model()
            .set_status(MachineStatus::Starting)
            .await;
    }
}
