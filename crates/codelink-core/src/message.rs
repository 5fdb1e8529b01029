//! Reply messages and their wire-level type flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::channel::CodeChannel;
use crate::constants::MAX_MESSAGE_LENGTH;

/// Severity of a generic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Informational message without a prefix.
    #[default]
    Success,
    /// Something went wrong but execution continued.
    Warning,
    /// Something went wrong and execution stopped.
    Error,
}

/// A generic message, either a code reply or an out-of-band notification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Severity of this message.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Message text (without a severity prefix).
    pub content: String,
}

impl Message {
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            message_type,
            content: content.into(),
        }
    }

    pub fn success(content: impl Into<String>) -> Self {
        Self::new(MessageType::Success, content)
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self::new(MessageType::Warning, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageType::Error, content)
    }

    /// Append another chunk to this message, joining with a newline if both
    /// sides are non-empty. Severity is raised, never lowered. Content past
    /// [`MAX_MESSAGE_LENGTH`] is dropped so a chatty peer cannot grow a
    /// reply without bound.
    pub fn append(&mut self, other: &Message) {
        if severity(other.message_type) > severity(self.message_type) {
            self.message_type = other.message_type;
        }
        if !other.content.is_empty() && self.content.len() < MAX_MESSAGE_LENGTH {
            if !self.content.is_empty() && !self.content.ends_with('\n') {
                self.content.push('\n');
            }
            self.content.push_str(&other.content);
            if self.content.len() > MAX_MESSAGE_LENGTH {
                let mut cut = MAX_MESSAGE_LENGTH;
                while !self.content.is_char_boundary(cut) {
                    cut -= 1;
                }
                self.content.truncate(cut);
            }
        }
    }

    /// True if there is no text to deliver.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

fn severity(message_type: MessageType) -> u8 {
    match message_type {
        MessageType::Success => 0,
        MessageType::Warning => 1,
        MessageType::Error => 2,
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message_type {
            MessageType::Success => write!(f, "{}", self.content),
            MessageType::Warning => write!(f, "Warning: {}", self.content),
            MessageType::Error => write!(f, "Error: {}", self.content),
        }
    }
}

bitflags! {
    /// Destination and severity bits attached to firmware code replies.
    ///
    /// The low bits select target channels and line up with
    /// [`CodeChannel`] wire indices.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageTypeFlags: u32 {
        const HTTP = 1 << 0;
        const TELNET = 1 << 1;
        const FILE = 1 << 2;
        const USB = 1 << 3;
        const AUX = 1 << 4;
        const TRIGGER = 1 << 5;
        const QUEUE = 1 << 6;
        const LCD = 1 << 7;
        const SPI = 1 << 8;
        const AUTO_PAUSE = 1 << 9;

        /// The reply reports an error.
        const ERROR = 0x0100_0000;
        /// The reply reports a warning.
        const WARNING = 0x0200_0000;
        /// The reply should also go to the log.
        const LOG = 0x0400_0000;
        /// More content follows in a later reply; do not complete the code yet.
        const PUSH = 0x2000_0000;

        const ALL_CHANNELS = 0x3ff;
    }
}

impl MessageTypeFlags {
    /// Destination bit for a single channel.
    pub fn for_channel(channel: CodeChannel) -> MessageTypeFlags {
        MessageTypeFlags::from_bits_truncate(1 << channel.index())
    }

    /// True if the reply targets the given channel.
    pub fn targets(self, channel: CodeChannel) -> bool {
        self.contains(Self::for_channel(channel))
    }

    /// Severity carried by these flags.
    pub fn message_type(self) -> MessageType {
        if self.contains(MessageTypeFlags::ERROR) {
            MessageType::Error
        } else if self.contains(MessageTypeFlags::WARNING) {
            MessageType::Warning
        } else {
            MessageType::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes() {
        assert_eq!(Message::success("done").to_string(), "done");
        assert_eq!(Message::warning("hot").to_string(), "Warning: hot");
        assert_eq!(Message::error("bad").to_string(), "Error: bad");
    }

    #[test]
    fn append_joins_with_newline() {
        let mut msg = Message::success("line 1");
        msg.append(&Message::success("line 2"));
        assert_eq!(msg.content, "line 1\nline 2");
    }

    #[test]
    fn append_raises_severity() {
        let mut msg = Message::success("ok so far");
        msg.append(&Message::error("boom"));
        assert_eq!(msg.message_type, MessageType::Error);

        // never lowered
        msg.append(&Message::success("more"));
        assert_eq!(msg.message_type, MessageType::Error);
    }

    #[test]
    fn append_caps_total_length() {
        let mut msg = Message::success("x".repeat(MAX_MESSAGE_LENGTH - 10));
        msg.append(&Message::success("y".repeat(100)));
        assert_eq!(msg.content.len(), MAX_MESSAGE_LENGTH);

        // Once full, further appends are dropped entirely.
        msg.append(&Message::success("more"));
        assert_eq!(msg.content.len(), MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn append_empty_keeps_content() {
        let mut msg = Message::success("text");
        msg.append(&Message::success(""));
        assert_eq!(msg.content, "text");
    }

    #[test]
    fn channel_bits_match_wire_indices() {
        for channel in CodeChannel::ALL {
            let flags = MessageTypeFlags::for_channel(channel);
            assert_eq!(flags.bits(), 1 << channel.index());
            assert!(flags.targets(channel));
        }
    }

    #[test]
    fn severity_from_flags() {
        assert_eq!(
            (MessageTypeFlags::USB | MessageTypeFlags::ERROR).message_type(),
            MessageType::Error
        );
        assert_eq!(
            (MessageTypeFlags::USB | MessageTypeFlags::WARNING).message_type(),
            MessageType::Warning
        );
        assert_eq!(MessageTypeFlags::USB.message_type(), MessageType::Success);
    }

    #[test]
    fn all_channels_mask() {
        let mut mask = MessageTypeFlags::empty();
        for channel in CodeChannel::ALL {
            mask |= MessageTypeFlags::for_channel(channel);
        }
        assert_eq!(mask, MessageTypeFlags::ALL_CHANNELS);
    }
}
