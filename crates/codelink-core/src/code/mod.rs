//! Code commands and their lifecycle.
//!
//! A [`Code`] is a parsed G/M/T-code bound to a channel. It travels through
//! the pipeline stages by ownership and is settled exactly once with a
//! [`CodeOutcome`] when the Executed stage is done with it.

mod parameter;
mod parser;

pub use parameter::{CodeParameter, ParameterValue};
pub use parser::parse_line;

use bitflags::bitflags;
use tokio::sync::oneshot;

use crate::cancellation::CancellationToken;
use crate::channel::CodeChannel;
use crate::error::{Error, Result};
use crate::message::Message;

bitflags! {
    /// Classification bits of a code command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CodeFlags: u16 {
        /// Completes as soon as the firmware buffers it.
        const ASYNCHRONOUS = 1 << 0;
        /// Already seen by the pre-side interceptors.
        const PRE_PROCESSED = 1 << 1;
        /// Already seen by the post-side interceptors.
        const POST_PROCESSED = 1 << 2;
        /// Already offered to the internal code handler.
        const INTERNALLY_PROCESSED = 1 << 3;
        /// Originates from a macro file.
        const FROM_MACRO = 1 << 4;
        /// Originates from a macro the firmware itself requested.
        const NESTED_MACRO = 1 << 5;
        /// Absolute positioning enforced via a G53 prefix.
        const ENFORCE_ABSOLUTE_POSITION = 1 << 6;
        /// Overtakes queued codes and goes out as fast as possible.
        const PRIORITIZED = 1 << 7;
        /// Following codes must wait until this one has finished.
        const UNBUFFERED = 1 << 8;
        /// Last code on its input line.
        const IS_LAST_CODE = 1 << 9;
    }
}

/// Kind of a code command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeType {
    GCode,
    MCode,
    TCode,
    /// A standalone comment; never reaches the firmware.
    Comment,
}

impl CodeType {
    /// Wire letter byte.
    pub fn letter(self) -> u8 {
        match self {
            CodeType::GCode => b'G',
            CodeType::MCode => b'M',
            CodeType::TCode => b'T',
            CodeType::Comment => 0,
        }
    }
}

/// Final disposition of a code command.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeOutcome {
    /// The code ran to completion; the message is its (possibly empty) reply.
    Resolved(Message),
    /// The code was invalidated before it could complete.
    Cancelled,
    /// An internal error stopped the code.
    Failed(String),
}

/// Awaitable side of a code's completion.
#[derive(Debug)]
pub struct CodeHandle {
    rx: oneshot::Receiver<CodeOutcome>,
}

impl CodeHandle {
    /// Wait for the code to settle. A dropped code counts as cancelled.
    pub async fn wait(self) -> CodeOutcome {
        self.rx.await.unwrap_or(CodeOutcome::Cancelled)
    }
}

/// A parsed G/M/T-code travelling through the pipeline.
#[derive(Debug)]
pub struct Code {
    pub channel: CodeChannel,
    pub code_type: CodeType,
    pub major: Option<i32>,
    pub minor: Option<i32>,
    pub flags: CodeFlags,
    pub file_position: Option<u32>,
    pub parameters: Vec<CodeParameter>,
    pub comment: Option<String>,
    /// Id of the macro invocation this code belongs to, if any.
    pub macro_id: Option<u64>,
    /// Reply text accumulated while the code executes.
    pub reply: Message,
    token: CancellationToken,
    completion: Option<oneshot::Sender<CodeOutcome>>,
    settled: bool,
}

impl Code {
    pub fn new(channel: CodeChannel, code_type: CodeType, major: Option<i32>) -> Self {
        Self {
            channel,
            code_type,
            major,
            minor: None,
            flags: CodeFlags::default(),
            file_position: None,
            parameters: Vec::new(),
            comment: None,
            macro_id: None,
            reply: Message::default(),
            token: CancellationToken::new(),
            completion: None,
            settled: false,
        }
    }

    /// Bind this code to its channel's cancellation token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_flags(mut self, flags: CodeFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_parameter(mut self, letter: char, value: ParameterValue) -> Self {
        self.parameters.push(CodeParameter::new(letter, value));
        self
    }

    /// Associate this code with a macro invocation.
    pub fn with_macro(mut self, macro_id: u64) -> Self {
        self.macro_id = Some(macro_id);
        self.flags |= CodeFlags::FROM_MACRO;
        self
    }

    /// Create the handle a caller can await. May be taken at most once.
    pub fn take_handle(&mut self) -> CodeHandle {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        CodeHandle { rx }
    }

    /// Cancellation token this code observes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Find a parameter by letter.
    pub fn parameter(&self, letter: char) -> Option<&ParameterValue> {
        self.parameters
            .iter()
            .find(|p| p.letter.eq_ignore_ascii_case(&letter))
            .map(|p| &p.value)
    }

    /// Settle the code with its final outcome.
    ///
    /// Settling is single-assignment; a second attempt is a caller bug.
    pub fn settle(&mut self, outcome: CodeOutcome) -> Result<()> {
        if self.settled {
            return Err(Error::InvalidState {
                expected: "unsettled code".into(),
                actual: format!("{self} settled twice"),
            });
        }
        self.settled = true;
        if let Some(tx) = self.completion.take() {
            // The handle may have been dropped; that is fine.
            let _ = tx.send(outcome);
        }
        Ok(())
    }

    /// True once the code has been settled.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// True while a caller holds a handle waiting for the outcome.
    pub fn has_awaiter(&self) -> bool {
        self.completion.is_some()
    }

    /// True for codes that skip regular queue ordering.
    pub fn is_prioritized(&self) -> bool {
        self.flags.contains(CodeFlags::PRIORITIZED)
    }

    pub fn is_from_macro(&self) -> bool {
        self.flags.contains(CodeFlags::FROM_MACRO)
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code_type {
            CodeType::Comment => {
                return write!(f, ";{}", self.comment.as_deref().unwrap_or(""));
            }
            CodeType::GCode => write!(f, "G")?,
            CodeType::MCode => write!(f, "M")?,
            CodeType::TCode => write!(f, "T")?,
        }
        if let Some(major) = self.major {
            write!(f, "{major}")?;
            if let Some(minor) = self.minor {
                write!(f, ".{minor}")?;
            }
        }
        for param in &self.parameters {
            write!(f, " {param}")?;
        }
        Ok(())
    }
}
