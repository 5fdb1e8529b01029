//! Encoders for host-to-firmware packet payloads.
//!
//! Each function appends one payload to the buffer and returns a [`Written`]
//! with the declared packet length (what goes into the packet header) and
//! the total bytes appended including alignment padding.

use bytes::{BufMut, BytesMut};

use crate::code::{Code, CodeFlags, CodeType, ParameterValue};
use crate::constants::MAX_WIRE_STRING_LENGTH;
use crate::error::{Error, Result};
use crate::file_info::{PrintFileInfo, PrintStoppedReason};
use crate::heightmap::Heightmap;

use super::padded;

// Wire flag bits of the binary code header.
const CODE_HAS_MAJOR: u8 = 1 << 0;
const CODE_HAS_MINOR: u8 = 1 << 1;
const CODE_HAS_FILE_POSITION: u8 = 1 << 2;
const CODE_ENFORCE_ABSOLUTE: u8 = 1 << 3;
const CODE_FROM_MACRO: u8 = 1 << 4;

/// Byte counts of one encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    /// Declared packet length, excluding alignment padding.
    pub length: usize,
    /// Bytes appended to the buffer, including alignment padding.
    pub total: usize,
}

fn pad_to_alignment(buf: &mut BytesMut, length: usize) -> Written {
    let total = padded(length);
    buf.put_bytes(0, total - length);
    Written { length, total }
}

fn check_wire_string(value: &str) -> Result<()> {
    if value.len() > MAX_WIRE_STRING_LENGTH {
        return Err(Error::StringTooLong {
            length: value.len(),
            max: MAX_WIRE_STRING_LENGTH,
        });
    }
    Ok(())
}

/// Encode a G/M/T-code.
///
/// Layout: 16-byte code header, one 8-byte slot per parameter, then the
/// out-of-line array/string payloads in parameter order. String payloads
/// reserve one zero byte after the text; the declared length field excludes
/// it and receivers must rely on the length, not the terminator.
pub fn write_code(buf: &mut BytesMut, code: &Code) -> Result<Written> {
    if code.code_type == CodeType::Comment {
        return Err(Error::Codec {
            message: "comments are not sent to the firmware".into(),
        });
    }

    let start = buf.len();

    let mut flags = 0u8;
    if code.major.is_some() {
        flags |= CODE_HAS_MAJOR;
    }
    if code.minor.is_some() {
        flags |= CODE_HAS_MINOR;
    }
    if code.file_position.is_some() {
        flags |= CODE_HAS_FILE_POSITION;
    }
    if code.flags.contains(CodeFlags::ENFORCE_ABSOLUTE_POSITION) {
        flags |= CODE_ENFORCE_ABSOLUTE;
    }
    if code.flags.contains(CodeFlags::FROM_MACRO) {
        flags |= CODE_FROM_MACRO;
    }

    buf.put_u8(code.channel as u8);
    buf.put_u8(flags);
    buf.put_u8(code.parameters.len() as u8);
    buf.put_u8(code.code_type.letter());
    buf.put_i32_le(code.major.unwrap_or(-1));
    buf.put_i32_le(code.minor.unwrap_or(-1));
    buf.put_u32_le(code.file_position.unwrap_or(0));

    // Fixed-size parameter slots; out-of-line payloads follow afterwards.
    for param in &code.parameters {
        buf.put_u8(param.wire_letter()?);
        buf.put_u8(param.value.wire_type());
        buf.put_u16_le(0);
        match &param.value {
            ParameterValue::Int(value) => buf.put_i32_le(*value),
            ParameterValue::UInt(value) => buf.put_u32_le(*value),
            ParameterValue::Float(value) => buf.put_f32_le(*value),
            ParameterValue::IntArray(values) => buf.put_u32_le(values.len() as u32),
            ParameterValue::UIntArray(values) => buf.put_u32_le(values.len() as u32),
            ParameterValue::FloatArray(values) => buf.put_u32_le(values.len() as u32),
            ParameterValue::String(value) | ParameterValue::Expression(value) => {
                check_wire_string(value)?;
                buf.put_u32_le(value.len() as u32);
            }
        }
    }

    for param in &code.parameters {
        match &param.value {
            ParameterValue::IntArray(values) => {
                for value in values {
                    buf.put_i32_le(*value);
                }
            }
            ParameterValue::UIntArray(values) => {
                for value in values {
                    buf.put_u32_le(*value);
                }
            }
            ParameterValue::FloatArray(values) => {
                for value in values {
                    buf.put_f32_le(*value);
                }
            }
            ParameterValue::String(value) | ParameterValue::Expression(value) => {
                buf.put_slice(value.as_bytes());
                buf.put_u8(0);
            }
            _ => {}
        }
    }

    Ok(pad_to_alignment(buf, buf.len() - start))
}

/// Request an object model fragment.
pub fn write_get_object_model(buf: &mut BytesMut, module: u8) -> Written {
    buf.put_u8(module);
    buf.put_bytes(0, 3);
    Written {
        length: 4,
        total: 4,
    }
}

/// Update a single object model field.
pub fn write_set_object_model(
    buf: &mut BytesMut,
    field: &str,
    value: &ParameterValue,
) -> Result<Written> {
    check_wire_string(field)?;

    let start = buf.len();
    buf.put_u8(value.wire_type());
    buf.put_u8(field.len() as u8);
    buf.put_u16_le(0);
    match value {
        ParameterValue::Int(v) => buf.put_i32_le(*v),
        ParameterValue::UInt(v) => buf.put_u32_le(*v),
        ParameterValue::Float(v) => buf.put_f32_le(*v),
        ParameterValue::IntArray(v) => buf.put_u32_le(v.len() as u32),
        ParameterValue::UIntArray(v) => buf.put_u32_le(v.len() as u32),
        ParameterValue::FloatArray(v) => buf.put_u32_le(v.len() as u32),
        ParameterValue::String(v) | ParameterValue::Expression(v) => {
            check_wire_string(v)?;
            buf.put_u32_le(v.len() as u32);
        }
    }
    buf.put_slice(field.as_bytes());
    match value {
        ParameterValue::IntArray(values) => {
            for v in values {
                buf.put_i32_le(*v);
            }
        }
        ParameterValue::UIntArray(values) => {
            for v in values {
                buf.put_u32_le(*v);
            }
        }
        ParameterValue::FloatArray(values) => {
            for v in values {
                buf.put_f32_le(*v);
            }
        }
        ParameterValue::String(v) | ParameterValue::Expression(v) => {
            buf.put_slice(v.as_bytes());
            buf.put_u8(0);
        }
        _ => {}
    }

    Ok(pad_to_alignment(buf, buf.len() - start))
}

/// Announce the start of a print job.
pub fn write_print_started(buf: &mut BytesMut, info: &PrintFileInfo) -> Result<Written> {
    check_wire_string(&info.filename)?;
    check_wire_string(&info.generated_by)?;

    let start = buf.len();
    buf.put_u8(info.filename.len() as u8);
    buf.put_u8(info.generated_by.len() as u8);
    buf.put_u16_le(info.filament_usage.len() as u16);
    buf.put_u32_le(info.file_size);
    buf.put_u64_le(info.last_modified);
    buf.put_f32_le(info.first_layer_height);
    buf.put_f32_le(info.layer_height);
    buf.put_f32_le(info.object_height);
    buf.put_u32_le(info.print_time);
    buf.put_u32_le(info.simulated_time);
    for usage in &info.filament_usage {
        buf.put_f32_le(*usage);
    }
    buf.put_slice(info.filename.as_bytes());
    buf.put_slice(info.generated_by.as_bytes());

    Ok(pad_to_alignment(buf, buf.len() - start))
}

/// Announce the end of a print job.
pub fn write_print_stopped(buf: &mut BytesMut, reason: PrintStoppedReason) -> Written {
    buf.put_u8(reason as u8);
    buf.put_bytes(0, 3);
    Written {
        length: 4,
        total: 4,
    }
}

/// Report that a firmware-requested macro has finished.
pub fn write_macro_completed(buf: &mut BytesMut, channel: crate::channel::CodeChannel, error: bool) -> Written {
    buf.put_u8(channel as u8);
    buf.put_u8(error as u8);
    buf.put_u16_le(0);
    Written {
        length: 4,
        total: 4,
    }
}

/// Send a heightmap to the firmware.
pub fn write_heightmap(buf: &mut BytesMut, map: &Heightmap) -> Result<Written> {
    map.validate()?;

    let start = buf.len();
    buf.put_f32_le(map.x_min);
    buf.put_f32_le(map.x_max);
    buf.put_f32_le(map.x_spacing);
    buf.put_f32_le(map.y_min);
    buf.put_f32_le(map.y_max);
    buf.put_f32_le(map.y_spacing);
    buf.put_u16_le(map.num_x);
    buf.put_u16_le(map.num_y);
    for point in &map.points {
        buf.put_f32_le(*point);
    }

    Ok(pad_to_alignment(buf, buf.len() - start))
}

/// Channel payload for lock and unlock requests.
pub fn write_lock_unlock(buf: &mut BytesMut, channel: crate::channel::CodeChannel) -> Written {
    buf.put_u8(channel as u8);
    buf.put_bytes(0, 3);
    Written {
        length: 4,
        total: 4,
    }
}
