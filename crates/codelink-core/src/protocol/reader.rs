//! Decoders for firmware-to-host packet payloads.
//!
//! Each function takes the payload slice of one packet plus the declared
//! packet length and returns the number of bytes consumed, already rounded
//! up to the 4-byte packet alignment so the caller can step to the next
//! packet directly.

use bitflags::bitflags;
use bytes::Buf;

use crate::channel::CodeChannel;
use crate::error::{Error, Result};
use crate::heightmap::Heightmap;
use crate::message::MessageTypeFlags;

use super::padded;

/// A firmware code reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeReply {
    pub flags: MessageTypeFlags,
    pub content: String,
}

/// A firmware request to start a macro file.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroRequest {
    pub channel: CodeChannel,
    /// Whether a missing macro file should be reported as an error.
    pub report_missing: bool,
    pub filename: String,
}

bitflags! {
    /// Mode bits reported alongside a stack event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StackEventFlags: u16 {
        const DRIVES_RELATIVE = 1 << 0;
        const VOLUMETRIC_EXTRUSION = 1 << 1;
        const AXES_RELATIVE = 1 << 2;
        const USING_INCHES = 1 << 3;
    }
}

/// Notification that the firmware pushed or popped its G-code state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackEvent {
    pub channel: CodeChannel,
    /// New stack depth after the event.
    pub depth: u8,
    pub flags: StackEventFlags,
    pub feedrate: f32,
}

/// Why the firmware paused the print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrintPauseReason {
    User,
    Gcode,
    FilamentChange,
    Trigger,
    HeaterFault,
    FilamentError,
    Stall,
    LowVoltage,
}

impl PrintPauseReason {
    fn from_wire(value: u8) -> Result<PrintPauseReason> {
        Ok(match value {
            0 => PrintPauseReason::User,
            1 => PrintPauseReason::Gcode,
            2 => PrintPauseReason::FilamentChange,
            3 => PrintPauseReason::Trigger,
            4 => PrintPauseReason::HeaterFault,
            5 => PrintPauseReason::FilamentError,
            6 => PrintPauseReason::Stall,
            7 => PrintPauseReason::LowVoltage,
            other => {
                return Err(Error::Protocol {
                    message: format!("unknown pause reason {other}"),
                })
            }
        })
    }
}

fn check_length(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(Error::Codec {
            message: format!("payload truncated: need {needed}, have {}", data.len()),
        });
    }
    Ok(())
}

fn read_string(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|_| Error::Codec {
        message: "invalid UTF-8 in wire string".into(),
    })
}

/// Object model fragment: module number plus JSON text.
///
/// The payload carries a single trailing NUL that is not part of the text.
pub fn read_object_model(data: &[u8], packet_length: u16) -> Result<(usize, u8, String)> {
    let packet_length = packet_length as usize;
    if packet_length < 5 {
        return Err(Error::Codec {
            message: format!("object model packet too short ({packet_length} bytes)"),
        });
    }
    check_length(data, packet_length)?;

    let module = data[0];
    let json = read_string(&data[4..packet_length - 1])?;
    Ok((padded(packet_length), module, json))
}

/// Code reply: message type flags plus UTF-8 content.
///
/// A four-byte packet is a valid empty reply.
pub fn read_code_reply(data: &[u8], packet_length: u16) -> Result<(usize, CodeReply)> {
    let packet_length = packet_length as usize;
    if packet_length < 4 {
        return Err(Error::Codec {
            message: format!("code reply packet too short ({packet_length} bytes)"),
        });
    }
    check_length(data, packet_length)?;

    let flags = MessageTypeFlags::from_bits_truncate((&data[..4]).get_u32_le());
    let content = if packet_length == 4 {
        String::new()
    } else {
        read_string(&data[4..packet_length - 1])?
    };
    Ok((padded(packet_length), CodeReply { flags, content }))
}

/// Macro execution request: channel, report-missing flag, filename.
pub fn read_macro_request(data: &[u8], packet_length: u16) -> Result<(usize, MacroRequest)> {
    let packet_length = packet_length as usize;
    if packet_length < 5 {
        return Err(Error::Codec {
            message: format!("macro request packet too short ({packet_length} bytes)"),
        });
    }
    check_length(data, packet_length)?;

    let channel = CodeChannel::from_wire(data[0])?;
    let report_missing = data[1] != 0;
    let filename = read_string(&data[4..packet_length - 1])?;
    Ok((
        padded(packet_length),
        MacroRequest {
            channel,
            report_missing,
            filename,
        },
    ))
}

/// Request to close all files on a channel.
pub fn read_abort_file(data: &[u8]) -> Result<(usize, CodeChannel)> {
    check_length(data, 4)?;
    Ok((4, CodeChannel::from_wire(data[0])?))
}

/// Firmware G-code state push/pop notification.
pub fn read_stack_event(data: &[u8]) -> Result<(usize, StackEvent)> {
    check_length(data, 8)?;
    let mut cursor = data;
    let channel = CodeChannel::from_wire(cursor.get_u8())?;
    let depth = cursor.get_u8();
    let flags = StackEventFlags::from_bits_truncate(cursor.get_u16_le());
    let feedrate = cursor.get_f32_le();
    Ok((
        8,
        StackEvent {
            channel,
            depth,
            flags,
            feedrate,
        },
    ))
}

/// Print paused notification.
pub fn read_print_paused(data: &[u8]) -> Result<(usize, u32, PrintPauseReason)> {
    check_length(data, 8)?;
    let mut cursor = data;
    let file_position = cursor.get_u32_le();
    let reason = PrintPauseReason::from_wire(cursor.get_u8())?;
    Ok((8, file_position, reason))
}

/// Heightmap transfer: grid geometry followed by z-coordinates.
pub fn read_heightmap(data: &[u8]) -> Result<(usize, Heightmap)> {
    check_length(data, 28)?;
    let mut cursor = data;
    let x_min = cursor.get_f32_le();
    let x_max = cursor.get_f32_le();
    let x_spacing = cursor.get_f32_le();
    let y_min = cursor.get_f32_le();
    let y_max = cursor.get_f32_le();
    let y_spacing = cursor.get_f32_le();
    let num_x = cursor.get_u16_le();
    let num_y = cursor.get_u16_le();

    let point_count = num_x as usize * num_y as usize;
    let total = 28 + point_count * 4;
    check_length(data, total)?;
    let mut points = Vec::with_capacity(point_count);
    for _ in 0..point_count {
        points.push(cursor.get_f32_le());
    }

    Ok((
        padded(total),
        Heightmap {
            x_min,
            x_max,
            x_spacing,
            y_min,
            y_max,
            y_spacing,
            num_x,
            num_y,
            points,
        },
    ))
}

/// Movement lock acquired notification.
pub fn read_resource_locked(data: &[u8]) -> Result<(usize, CodeChannel)> {
    check_length(data, 4)?;
    Ok((4, CodeChannel::from_wire(data[0])?))
}
