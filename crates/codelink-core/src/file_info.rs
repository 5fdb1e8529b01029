//! Parsed job file information shared with the firmware.

use serde::{Deserialize, Serialize};

/// Metadata of a print job file, sent ahead of the first file code.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrintFileInfo {
    pub filename: String,
    /// Name of the slicer that produced the file, if known.
    pub generated_by: String,
    pub file_size: u32,
    /// Seconds since the Unix epoch, 0 if unknown.
    pub last_modified: u64,
    pub first_layer_height: f32,
    pub layer_height: f32,
    pub object_height: f32,
    /// Estimated print time in seconds.
    pub print_time: u32,
    /// Simulated print time in seconds, 0 if the file was never simulated.
    pub simulated_time: u32,
    /// Filament usage per extruder in millimetres.
    pub filament_usage: Vec<f32>,
}

/// Why a print job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum PrintStoppedReason {
    NormalCompletion = 0,
    UserCancelled = 1,
    Abort = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_reason_wire_values() {
        assert_eq!(PrintStoppedReason::NormalCompletion as u8, 0);
        assert_eq!(PrintStoppedReason::UserCancelled as u8, 1);
        assert_eq!(PrintStoppedReason::Abort as u8, 2);
    }

    #[test]
    fn default_info_is_empty() {
        let info = PrintFileInfo::default();
        assert!(info.filename.is_empty());
        assert!(info.filament_usage.is_empty());
    }
}
