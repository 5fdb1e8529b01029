//! Bed heightmap exchanged with the firmware.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Probed grid geometry plus z-coordinates, row-major with x varying fastest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heightmap {
    pub x_min: f32,
    pub x_max: f32,
    pub x_spacing: f32,
    pub y_min: f32,
    pub y_max: f32,
    pub y_spacing: f32,
    pub num_x: u16,
    pub num_y: u16,
    pub points: Vec<f32>,
}

impl Heightmap {
    /// Number of grid points the geometry declares.
    pub fn point_count(&self) -> usize {
        self.num_x as usize * self.num_y as usize
    }

    /// Check that the point vector matches the declared grid.
    pub fn validate(&self) -> Result<()> {
        if self.points.len() != self.point_count() {
            return Err(Error::InvalidState {
                expected: format!("{} heightmap points", self.point_count()),
                actual: format!("{}", self.points.len()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_count_from_grid() {
        let map = Heightmap {
            num_x: 4,
            num_y: 3,
            points: vec![0.0; 12],
            ..Default::default()
        };
        assert_eq!(map.point_count(), 12);
        map.validate().unwrap();
    }

    #[test]
    fn mismatched_points_rejected() {
        let map = Heightmap {
            num_x: 2,
            num_y: 2,
            points: vec![0.0; 3],
            ..Default::default()
        };
        assert!(map.validate().is_err());
    }
}
