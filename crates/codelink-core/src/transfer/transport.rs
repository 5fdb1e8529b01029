//! SPI transport abstraction.
//!
//! The engine talks to the firmware through this trait so tests and the
//! simulated firmware can stand in for the real bus.

use async_trait::async_trait;

use crate::error::Result;

/// A full-duplex SPI link plus the transfer-ready handshake line.
#[async_trait]
pub trait SpiTransport: Send {
    /// Wait until the firmware signals it is ready for the next exchange.
    ///
    /// Implementations should return [`crate::Error::Timeout`] when the
    /// firmware stays silent; the engine maps that into its retry budget.
    async fn wait_for_transfer(&mut self) -> Result<()>;

    /// Perform one full-duplex exchange. `tx` and `rx` have equal lengths.
    async fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()>;

    /// Write without reading back, used to abandon a broken cycle.
    async fn write(&mut self, tx: &[u8]) -> Result<()>;
}
