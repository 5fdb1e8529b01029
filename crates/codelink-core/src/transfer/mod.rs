//! Binary data transfers between the host and the firmware.

pub mod engine;
pub mod interface;
pub mod transport;

pub use engine::{ReceivedPacket, TransferEngine};
pub use interface::SpiInterface;
pub use transport::SpiTransport;
