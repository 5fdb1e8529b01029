//! In-process simulated firmware.
//!
//! Implements [`SpiTransport`] with a phase-aware state machine that mirrors
//! the firmware side of a transfer cycle: header exchange, response, data
//! exchange, response. Every code it receives is acknowledged with an "ok"
//! reply on its source channel, so the daemon can run on machines without
//! an SPI-attached board.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};

use codelink_core::channel::CodeChannel;
use codelink_core::constants::{BUFFER_SIZE, PACKET_HEADER_SIZE, SIM_POLL_INTERVAL};
use codelink_core::heightmap::Heightmap;
use codelink_core::message::MessageTypeFlags;
use codelink_core::protocol::{
    padded, writer, FirmwareRequest, HostRequest, PacketHeader, TransferHeader, TransferResponse,
};
use codelink_core::{Result, SpiTransport};

/// Where the simulated firmware stands within the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimPhase {
    Header,
    HeaderResponse,
    Data,
    DataResponse,
}

/// A firmware packet queued for delivery in an upcoming cycle.
struct OutPacket {
    request: FirmwareRequest,
    payload: Vec<u8>,
}

/// One prepared cycle: the finalized header plus its data section.
struct Cycle {
    header: [u8; 16],
    data: Vec<u8>,
}

struct SimState {
    phase: SimPhase,
    sequence: u16,
    host_header: Option<TransferHeader>,
    cycle: Option<Cycle>,
    pending: VecDeque<OutPacket>,
    heightmap: Heightmap,
    status: &'static str,
    /// Host packets seen, by request id. Diagnostics for tests.
    codes_received: u64,
}

impl SimState {
    /// Build the cycle header and data section from the pending queue.
    fn prepare_cycle(&mut self) -> &Cycle {
        if self.cycle.is_none() {
            let mut data = Vec::new();
            let mut id: u16 = 0;
            while let Some(packet) = self.pending.front() {
                let needed = PACKET_HEADER_SIZE + padded(packet.payload.len());
                if data.len() + needed > BUFFER_SIZE {
                    break;
                }
                let packet = match self.pending.pop_front() {
                    Some(packet) => packet,
                    None => break,
                };
                let header = PacketHeader {
                    request: packet.request as u16,
                    id,
                    length: packet.payload.len() as u16,
                    resend_packet_id: 0,
                };
                id += 1;
                data.extend_from_slice(&header.encode());
                data.extend_from_slice(&packet.payload);
                data.resize(padded(data.len()), 0);
            }

            self.sequence = self.sequence.wrapping_add(1);
            let mut header = TransferHeader::new(id as u8, self.sequence, data.len() as u16);
            header.finalize(&data);
            self.cycle = Some(Cycle {
                header: header.encode(),
                data,
            });
        }
        match self.cycle.as_ref() {
            Some(cycle) => cycle,
            None => unreachable!("cycle prepared above"),
        }
    }

    fn queue(&mut self, request: FirmwareRequest, payload: Vec<u8>) {
        self.pending.push_back(OutPacket { request, payload });
    }

    fn queue_code_reply(&mut self, channel: CodeChannel, content: &str) {
        let mut payload = Vec::with_capacity(4 + content.len() + 1);
        payload.put_u32_le(MessageTypeFlags::for_channel(channel).bits());
        payload.extend_from_slice(content.as_bytes());
        if !content.is_empty() {
            payload.push(0);
        }
        self.queue(FirmwareRequest::CodeReply, payload);
    }

    fn queue_object_model(&mut self, module: u8) {
        let json = format!(r#"{{"status":"{}"}}"#, self.status);
        let mut payload = Vec::with_capacity(4 + json.len() + 1);
        payload.push(module);
        payload.extend_from_slice(&[0; 3]);
        payload.extend_from_slice(json.as_bytes());
        payload.push(0);
        self.queue(FirmwareRequest::ObjectModel, payload);
    }

    /// React to one host packet, queueing replies for the next cycle.
    fn handle_host_packet(&mut self, header: PacketHeader, payload: &[u8]) {
        let request = match HostRequest::try_from(header.request) {
            Ok(request) => request,
            Err(_) => {
                warn!(request = header.request, "simulator ignoring unknown host request");
                return;
            }
        };
        trace!(?request, id = header.id, "simulator received packet");
        match request {
            HostRequest::EmergencyStop => {
                self.status = "halted";
                self.pending.clear();
            }
            HostRequest::Reset => {
                // A reboot starts a fresh sequence; the host notices the
                // regression and renegotiates.
                self.sequence = 0;
                self.pending.clear();
                self.status = "idle";
            }
            HostRequest::Code => {
                self.codes_received += 1;
                match payload.first().copied().map(CodeChannel::from_wire) {
                    Some(Ok(channel)) => self.queue_code_reply(channel, "ok"),
                    _ => warn!("simulator received code packet without a channel"),
                }
            }
            HostRequest::GetObjectModel => {
                let module = payload.first().copied().unwrap_or(0);
                self.queue_object_model(module);
            }
            HostRequest::GetHeightmap => {
                let mut buf = BytesMut::new();
                match writer::write_heightmap(&mut buf, &self.heightmap) {
                    Ok(_) => self.queue(FirmwareRequest::Heightmap, buf.to_vec()),
                    Err(err) => warn!(error = %err, "simulator heightmap encode failed"),
                }
            }
            HostRequest::SetHeightmap => {
                // Stored verbatim on the firmware; the simulator keeps the
                // geometry it already has.
            }
            HostRequest::LockMovementAndWaitForStandstill => {
                if let Some(Ok(channel)) = payload.first().copied().map(CodeChannel::from_wire) {
                    self.queue(FirmwareRequest::Locked, vec![channel as u8, 0, 0, 0]);
                }
            }
            HostRequest::Unlock
            | HostRequest::SetObjectModel
            | HostRequest::PrintStarted
            | HostRequest::PrintStopped
            | HostRequest::MacroCompleted => {}
        }
    }

    fn handle_host_data(&mut self, data: &[u8]) {
        let mut offset = 0;
        while offset + PACKET_HEADER_SIZE <= data.len() {
            let Ok(header) = PacketHeader::decode(&data[offset..]) else {
                break;
            };
            let start = offset + PACKET_HEADER_SIZE;
            let end = start + header.length as usize;
            if end > data.len() {
                break;
            }
            let payload = data[start..end].to_vec();
            self.handle_host_packet(header, &payload);
            offset = start + padded(header.length as usize);
        }
    }
}

/// Simulated firmware endpoint; clones share one board.
#[derive(Clone)]
pub struct SimulatedFirmware {
    shared: Arc<Mutex<SimState>>,
}

impl Default for SimulatedFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFirmware {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SimState {
                phase: SimPhase::Header,
                sequence: 0,
                host_header: None,
                cycle: None,
                pending: VecDeque::new(),
                heightmap: Heightmap::default(),
                status: "idle",
                codes_received: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the host to run a macro file, as a real firmware would for
    /// config.g or pause.g.
    pub fn request_macro(&self, channel: CodeChannel, filename: &str, report_missing: bool) {
        let mut payload = Vec::with_capacity(4 + filename.len() + 1);
        payload.push(channel as u8);
        payload.push(report_missing as u8);
        payload.extend_from_slice(&[0; 2]);
        payload.extend_from_slice(filename.as_bytes());
        payload.push(0);
        self.lock().queue(FirmwareRequest::MacroRequest, payload);
    }

    /// Pause the running print at the given file position.
    pub fn pause_print(&self, file_position: u32) {
        let mut payload = Vec::with_capacity(8);
        payload.put_u32_le(file_position);
        payload.extend_from_slice(&[0; 4]); // reason: user
        self.lock().queue(FirmwareRequest::PrintPaused, payload);
    }

    /// Reboot the simulated board: the sequence counter restarts.
    pub fn reboot(&self) {
        let mut state = self.lock();
        state.sequence = 0;
        state.pending.clear();
        state.phase = SimPhase::Header;
        state.cycle = None;
        state.status = "idle";
    }

    /// Machine status string the simulator reports in its object model.
    pub fn status(&self) -> &'static str {
        self.lock().status
    }

    /// Total code packets received from the host so far.
    pub fn codes_received(&self) -> u64 {
        self.lock().codes_received
    }
}

#[async_trait]
impl SpiTransport for SimulatedFirmware {
    async fn wait_for_transfer(&mut self) -> Result<()> {
        // Only throttle between cycles, never mid-cycle.
        let at_header = self.lock().phase == SimPhase::Header;
        if at_header {
            tokio::time::sleep(SIM_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let mut state = self.lock();
        match state.phase {
            SimPhase::Header => {
                match TransferHeader::decode(tx) {
                    Ok(header) => state.host_header = Some(header),
                    Err(err) => {
                        warn!(error = %err, "simulator received a bad host header");
                        state.host_header = None;
                    }
                }
                let header = state.prepare_cycle().header;
                rx[..header.len()].copy_from_slice(&header);
                state.phase = SimPhase::HeaderResponse;
            }
            SimPhase::HeaderResponse => {
                let host_response = response_word(tx);
                rx[..4].copy_from_slice(&(TransferResponse::Success as u32).to_le_bytes());
                if host_response != Some(TransferResponse::Success) {
                    debug!(?host_response, "host rejected the header, replaying cycle");
                    state.phase = SimPhase::Header;
                    return Ok(());
                }
                let host_data = state
                    .host_header
                    .map(|h| h.data_length as usize)
                    .unwrap_or(0);
                let own_data = state.cycle.as_ref().map(|c| c.data.len()).unwrap_or(0);
                if host_data > 0 || own_data > 0 {
                    state.phase = SimPhase::Data;
                } else {
                    // Nothing to exchange; the cycle is complete.
                    state.cycle = None;
                    state.phase = SimPhase::Header;
                }
            }
            SimPhase::Data => {
                let host_len = state
                    .host_header
                    .map(|h| h.data_length as usize)
                    .unwrap_or(0)
                    .min(tx.len());
                let host_data = tx[..host_len].to_vec();
                state.handle_host_data(&host_data);

                rx.fill(0);
                if let Some(cycle) = state.cycle.as_ref() {
                    let n = cycle.data.len().min(rx.len());
                    rx[..n].copy_from_slice(&cycle.data[..n]);
                }
                state.phase = SimPhase::DataResponse;
            }
            SimPhase::DataResponse => {
                let host_response = response_word(tx);
                rx[..4].copy_from_slice(&(TransferResponse::Success as u32).to_le_bytes());
                if host_response == Some(TransferResponse::Success) {
                    state.cycle = None;
                    state.phase = SimPhase::Header;
                } else {
                    debug!(?host_response, "host rejected the data section, replaying");
                    state.phase = SimPhase::Data;
                }
            }
        }
        Ok(())
    }

    async fn write(&mut self, tx: &[u8]) -> Result<()> {
        // The host abandons broken cycles with a bare response code.
        if response_word(tx) == Some(TransferResponse::BadResponse) {
            debug!("host abandoned the transfer cycle");
        }
        let mut state = self.lock();
        state.phase = SimPhase::Header;
        state.cycle = None;
        Ok(())
    }
}

fn response_word(tx: &[u8]) -> Option<TransferResponse> {
    if tx.len() < 4 {
        return None;
    }
    let word = u32::from_le_bytes([tx[0], tx[1], tx[2], tx[3]]);
    TransferResponse::from_wire(word)
}
