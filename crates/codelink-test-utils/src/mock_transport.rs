//! Scripted SPI transport for tests.
//!
//! The mock plays back a per-exchange script: every `transfer` call pops
//! the next receive image, while everything the host sends is captured for
//! later assertions. Helpers script whole firmware cycles, including
//! injected faults.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BufMut;

use codelink_core::constants::PACKET_HEADER_SIZE;
use codelink_core::protocol::{
    padded, FirmwareRequest, PacketHeader, TransferHeader, TransferResponse,
};
use codelink_core::Result;
use codelink_core::SpiTransport;

/// One packet the scripted firmware hands to the host.
#[derive(Debug, Clone)]
pub struct FirmwarePacket {
    pub request: FirmwareRequest,
    pub payload: Vec<u8>,
}

impl FirmwarePacket {
    pub fn new(request: FirmwareRequest, payload: Vec<u8>) -> Self {
        Self { request, payload }
    }
}

/// Encode firmware packets the way they appear in a data section.
pub fn encode_data_section(packets: &[FirmwarePacket]) -> Vec<u8> {
    let mut data = Vec::new();
    for (i, packet) in packets.iter().enumerate() {
        let header = PacketHeader {
            request: packet.request as u16,
            id: i as u16,
            length: packet.payload.len() as u16,
            resend_packet_id: 0,
        };
        data.extend_from_slice(&header.encode());
        data.extend_from_slice(&packet.payload);
        data.resize(padded(data.len()), 0);
    }
    data
}

/// Build a resend request packet for one host packet id.
pub fn resend_request(resend_packet_id: u16) -> Vec<u8> {
    let header = PacketHeader {
        request: FirmwareRequest::ResendPacket as u16,
        id: 0,
        length: 0,
        resend_packet_id,
    };
    header.encode().to_vec()
}

#[derive(Default)]
struct Shared {
    script: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

/// Scripted transport; clones share the script and the capture log.
#[derive(Clone, Default)]
pub struct MockSpiTransport {
    shared: Arc<Mutex<Shared>>,
    sequence: Arc<Mutex<u16>>,
}

impl MockSpiTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("mock transport poisoned")
    }

    /// Push one raw receive image for the next exchange.
    pub fn push(&self, rx: Vec<u8>) {
        self.lock().script.push_back(rx);
    }

    pub fn push_response(&self, response: TransferResponse) {
        self.push((response as u32).to_le_bytes().to_vec());
    }

    fn next_sequence(&self) -> u16 {
        let mut seq = self.sequence.lock().expect("mock transport poisoned");
        *seq += 1;
        *seq
    }

    /// Rewind the scripted firmware's sequence counter, as a reboot would.
    pub fn reset_sequence(&self) {
        *self.sequence.lock().expect("mock transport poisoned") = 0;
    }

    /// Script one clean cycle with a data phase, delivering `packets`.
    ///
    /// The engine only runs a data phase when either side has payload; use
    /// this when the firmware sends packets or the host is known to.
    pub fn script_cycle(&self, packets: &[FirmwarePacket]) {
        let data = encode_data_section(packets);
        let mut header = TransferHeader::new(
            packets.len() as u8,
            self.next_sequence(),
            data.len() as u16,
        );
        header.finalize(&data);
        self.push(header.encode().to_vec());
        self.push_response(TransferResponse::Success);
        self.push(data);
        self.push_response(TransferResponse::Success);
    }

    /// Script one clean cycle delivering an arbitrary data section, even one
    /// the host should not be able to decode.
    pub fn script_raw_cycle(&self, data: Vec<u8>) {
        let mut header = TransferHeader::new(1, self.next_sequence(), data.len() as u16);
        header.finalize(&data);
        self.push(header.encode().to_vec());
        self.push_response(TransferResponse::Success);
        self.push(data);
        self.push_response(TransferResponse::Success);
    }

    /// Script one clean cycle where neither side has payload.
    pub fn script_empty_cycle(&self) {
        let mut header = TransferHeader::new(0, self.next_sequence(), 0);
        header.finalize(&[]);
        self.push(header.encode().to_vec());
        self.push_response(TransferResponse::Success);
    }

    /// Script an exchange whose header arrives corrupted.
    pub fn script_bad_header(&self) {
        let mut header = TransferHeader::new(0, self.next_sequence(), 0);
        header.finalize(&[]);
        header.sequence_number ^= 0x5a5a;
        self.push(header.encode().to_vec());
        self.push_response(TransferResponse::Success);
    }

    /// Script an exchange that never answers (forces the engine timeout).
    pub fn script_silence(&self) {
        self.push(Vec::new());
    }

    /// Everything the host transmitted so far, in exchange order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Decode the host packets of the most recent data-phase frame.
    pub fn last_host_packets(&self) -> Vec<(PacketHeader, Vec<u8>)> {
        let sent = self.lock().sent.clone();
        let frame = sent
            .iter()
            .rev()
            .find(|frame| frame.len() > PACKET_HEADER_SIZE)
            .cloned()
            .unwrap_or_default();
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset + PACKET_HEADER_SIZE <= frame.len() {
            let Ok(header) = PacketHeader::decode(&frame[offset..]) else {
                break;
            };
            let start = offset + PACKET_HEADER_SIZE;
            let end = (start + header.length as usize).min(frame.len());
            packets.push((header, frame[start..end].to_vec()));
            offset = start + padded(header.length as usize);
        }
        packets
    }

    pub fn remaining_script_len(&self) -> usize {
        self.lock().script.len()
    }
}

#[async_trait]
impl SpiTransport for MockSpiTransport {
    async fn wait_for_transfer(&mut self) -> Result<()> {
        // A fully drained script behaves like a silent firmware: the next
        // transfer reads zeroes and the engine treats it as unavailable.
        Ok(())
    }

    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let mut shared = self.lock();
        shared.sent.push(tx.to_vec());
        let image = shared.script.pop_front().unwrap_or_default();
        let n = image.len().min(rx.len());
        rx[..n].copy_from_slice(&image[..n]);
        for byte in rx[n..].iter_mut() {
            *byte = 0;
        }
        Ok(())
    }

    async fn write(&mut self, tx: &[u8]) -> Result<()> {
        self.lock().sent.push(tx.to_vec());
        Ok(())
    }
}

/// Convenience: a code-reply payload targeting one channel.
pub fn code_reply_payload(channel: codelink_core::CodeChannel, content: &str) -> Vec<u8> {
    use codelink_core::message::MessageTypeFlags;

    let mut payload = Vec::new();
    payload.put_u32_le(MessageTypeFlags::for_channel(channel).bits());
    payload.extend_from_slice(content.as_bytes());
    if !content.is_empty() {
        payload.push(0);
    }
    payload
}
