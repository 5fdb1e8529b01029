//! codelink-core: SPI transfer protocol engine and code execution pipeline.
//!
//! This crate provides:
//! - Fixed-layout wire codec for the firmware SPI link
//! - Transfer engine with checksum validation, resend and reset handling
//! - Per-channel multi-stage code pipeline with macro nesting
//! - Code command lifecycle (parse, cancel, settle)
//! - Shared machine model snapshot behind an async RwLock
//! - Configuration, logging and error types

pub mod cancellation;
pub mod channel;
pub mod code;
pub mod config;
pub mod constants;
pub mod error;
pub mod file_info;
pub mod heightmap;
pub mod logging;
pub mod message;
pub mod model;
pub mod pipeline;
pub mod protocol;
pub mod transfer;

pub use cancellation::{CancellationToken, TokenSource};
pub use channel::{ChannelMap, CodeChannel};
pub use code::{parse_line, Code, CodeFlags, CodeHandle, CodeOutcome, CodeType, ParameterValue};
pub use config::Settings;
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use message::{Message, MessageType};
pub use model::{MachineStatus, ModelProvider};
pub use pipeline::{
    CodeHandler, InterceptionMode, Interceptor, PipelineStage, Processor,
};
pub use transfer::{SpiInterface, SpiTransport, TransferEngine};
pub use transfer::interface::{SpiCommander, SpiEvent};
