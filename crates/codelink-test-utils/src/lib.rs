//! Shared test helpers: scripted SPI transport, recording pipeline hooks,
//! and code builders.

pub mod mock_transport;

pub use mock_transport::{
    code_reply_payload, encode_data_section, resend_request, FirmwarePacket, MockSpiTransport,
};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use codelink_core::pipeline::{CodeHandler, InterceptionMode, Interceptor};
use codelink_core::{Code, CodeChannel, CodeType, Message, ParameterValue, Result};

/// Interceptor that records every code it sees and resolves by predicate.
#[derive(Clone, Default)]
pub struct RecordingInterceptor {
    seen: Arc<Mutex<Vec<(InterceptionMode, String)>>>,
    /// M-code majors to resolve at the Pre stage.
    resolve_pre: Arc<Mutex<Vec<i32>>>,
}

impl RecordingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the given M-code major at the Pre stage from now on.
    pub fn resolve_m_code(&self, major: i32) {
        self.resolve_pre.lock().expect("poisoned").push(major);
    }

    /// Everything intercepted so far, as `(mode, code text)` pairs.
    pub fn seen(&self) -> Vec<(InterceptionMode, String)> {
        self.seen.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl Interceptor for RecordingInterceptor {
    async fn intercept(&self, code: &mut Code, mode: InterceptionMode) -> Result<bool> {
        self.seen
            .lock()
            .expect("poisoned")
            .push((mode, code.to_string()));
        if mode == InterceptionMode::Pre
            && code.code_type == CodeType::MCode
            && code
                .major
                .is_some_and(|major| self.resolve_pre.lock().expect("poisoned").contains(&major))
        {
            code.reply = Message::success("resolved by test interceptor");
            return Ok(true);
        }
        Ok(false)
    }
}

/// Handler that records codes and answers the majors it was told to.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<String>>>,
    answers: Arc<Mutex<Vec<(i32, String)>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the given M-code major locally with `reply`.
    pub fn answer(&self, major: i32, reply: &str) {
        self.answers
            .lock()
            .expect("poisoned")
            .push((major, reply.to_string()));
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl CodeHandler for RecordingHandler {
    async fn process(&self, code: &mut Code) -> Result<Option<Message>> {
        self.seen.lock().expect("poisoned").push(code.to_string());
        if code.code_type == CodeType::MCode {
            if let Some(major) = code.major {
                let answers = self.answers.lock().expect("poisoned");
                if let Some((_, reply)) = answers.iter().find(|(m, _)| *m == major) {
                    return Ok(Some(Message::success(reply.clone())));
                }
            }
        }
        Ok(None)
    }
}

/// Shorthand for a plain G-code on a channel.
pub fn gcode(channel: CodeChannel, major: i32) -> Code {
    Code::new(channel, CodeType::GCode, Some(major))
}

/// Shorthand for a plain M-code on a channel.
pub fn mcode(channel: CodeChannel, major: i32) -> Code {
    Code::new(channel, CodeType::MCode, Some(major))
}

/// A G1 move with a couple of axis parameters, handy as filler traffic.
pub fn move_code(channel: CodeChannel, x: f32, y: f32) -> Code {
    Code::new(channel, CodeType::GCode, Some(1))
        .with_parameter('X', ParameterValue::Float(x))
        .with_parameter('Y', ParameterValue::Float(y))
}
