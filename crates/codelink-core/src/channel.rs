//! Code channels and per-channel storage.
//!
//! Every G/M/T-code travels on exactly one channel. Channels are fixed at
//! compile time and double as indices into per-channel state arrays, so
//! lookups never allocate or hash.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of code channels.
pub const CHANNEL_COUNT: usize = 10;

/// Source of a code command, also its wire identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodeChannel {
    /// Codes from the HTTP front-end.
    Http = 0,
    /// Codes from Telnet sessions.
    Telnet = 1,
    /// Codes read from a job file.
    File = 2,
    /// Codes from the USB serial console.
    Usb = 3,
    /// Codes from the auxiliary UART (e.g. PanelDue).
    Aux = 4,
    /// Codes fired by triggers.
    Trigger = 5,
    /// Codes from the internal code queue.
    Queue = 6,
    /// Codes from an attached LCD controller.
    Lcd = 7,
    /// Codes generated by the firmware itself.
    Spi = 8,
    /// Codes run in response to an automatic pause.
    AutoPause = 9,
}

impl CodeChannel {
    /// All channels in wire order.
    pub const ALL: [CodeChannel; CHANNEL_COUNT] = [
        CodeChannel::Http,
        CodeChannel::Telnet,
        CodeChannel::File,
        CodeChannel::Usb,
        CodeChannel::Aux,
        CodeChannel::Trigger,
        CodeChannel::Queue,
        CodeChannel::Lcd,
        CodeChannel::Spi,
        CodeChannel::AutoPause,
    ];

    /// Fallback channel for firmware requests carrying an unknown id.
    pub const DEFAULT: CodeChannel = CodeChannel::Spi;

    /// Index into per-channel arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decode a channel from its wire byte.
    pub fn from_wire(value: u8) -> Result<CodeChannel> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::Protocol {
                message: format!("unknown code channel {value}"),
            })
    }
}

impl std::fmt::Display for CodeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodeChannel::Http => "HTTP",
            CodeChannel::Telnet => "Telnet",
            CodeChannel::File => "File",
            CodeChannel::Usb => "USB",
            CodeChannel::Aux => "Aux",
            CodeChannel::Trigger => "Trigger",
            CodeChannel::Queue => "Queue",
            CodeChannel::Lcd => "LCD",
            CodeChannel::Spi => "SPI",
            CodeChannel::AutoPause => "AutoPause",
        };
        f.write_str(name)
    }
}

/// Fixed-size map from [`CodeChannel`] to `T`.
#[derive(Debug)]
pub struct ChannelMap<T> {
    items: [T; CHANNEL_COUNT],
}

impl<T> ChannelMap<T> {
    /// Build a map by invoking `init` once per channel, in wire order.
    pub fn new(mut init: impl FnMut(CodeChannel) -> T) -> Self {
        Self {
            items: CodeChannel::ALL.map(&mut init),
        }
    }

    /// Iterate over `(channel, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (CodeChannel, &T)> {
        CodeChannel::ALL.iter().copied().zip(self.items.iter())
    }
}

impl<T> std::ops::Index<CodeChannel> for ChannelMap<T> {
    type Output = T;

    fn index(&self, channel: CodeChannel) -> &T {
        &self.items[channel.index()]
    }
}

impl<T> std::ops::IndexMut<CodeChannel> for ChannelMap<T> {
    fn index_mut(&mut self, channel: CodeChannel) -> &mut T {
        &mut self.items[channel.index()]
    }
}
