//! Packet request types, one enum per transfer direction.

use crate::error::{Error, Result};

/// Requests sent from the host to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HostRequest {
    EmergencyStop = 0,
    Reset = 1,
    Code = 2,
    GetObjectModel = 3,
    SetObjectModel = 4,
    PrintStarted = 5,
    PrintStopped = 6,
    MacroCompleted = 7,
    GetHeightmap = 8,
    SetHeightmap = 9,
    LockMovementAndWaitForStandstill = 10,
    Unlock = 11,
}

/// Requests sent from the firmware to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FirmwareRequest {
    /// A previous host packet arrived corrupted and must be retransmitted.
    ResendPacket = 0,
    ObjectModel = 1,
    CodeReply = 2,
    MacroRequest = 3,
    AbortFile = 4,
    StackEvent = 5,
    PrintPaused = 6,
    Heightmap = 7,
    Locked = 8,
}

impl TryFrom<u16> for HostRequest {
    type Error = Error;

    fn try_from(value: u16) -> Result<HostRequest> {
        Ok(match value {
            0 => HostRequest::EmergencyStop,
            1 => HostRequest::Reset,
            2 => HostRequest::Code,
            3 => HostRequest::GetObjectModel,
            4 => HostRequest::SetObjectModel,
            5 => HostRequest::PrintStarted,
            6 => HostRequest::PrintStopped,
            7 => HostRequest::MacroCompleted,
            8 => HostRequest::GetHeightmap,
            9 => HostRequest::SetHeightmap,
            10 => HostRequest::LockMovementAndWaitForStandstill,
            11 => HostRequest::Unlock,
            other => {
                return Err(Error::Protocol {
                    message: format!("unknown host request {other}"),
                })
            }
        })
    }
}

impl TryFrom<u16> for FirmwareRequest {
    type Error = Error;

    fn try_from(value: u16) -> Result<FirmwareRequest> {
        Ok(match value {
            0 => FirmwareRequest::ResendPacket,
            1 => FirmwareRequest::ObjectModel,
            2 => FirmwareRequest::CodeReply,
            3 => FirmwareRequest::MacroRequest,
            4 => FirmwareRequest::AbortFile,
            5 => FirmwareRequest::StackEvent,
            6 => FirmwareRequest::PrintPaused,
            7 => FirmwareRequest::Heightmap,
            8 => FirmwareRequest::Locked,
            other => {
                return Err(Error::Protocol {
                    message: format!("unknown firmware request {other}"),
                })
            }
        })
    }
}
