//! codelink server library.
//!
//! Wires the code pipeline from codelink-core to an SPI firmware link and
//! exposes the daemon's Unix-socket IPC interface.

pub mod cli;
pub mod handler;
pub mod ipc;
pub mod sim;

pub use cli::Cli;
pub use handler::ControlCodeHandler;
pub use ipc::intercept::InterceptorRegistry;
pub use ipc::{IpcServer, IpcState};
pub use sim::SimulatedFirmware;
