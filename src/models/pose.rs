//! Camera pose decoded from the grid embedded in a screenshot.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Rotation {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// `extracted_ok == false` means no grid could be read; the numeric fields are
/// zero in that case and must not be reported upstream. `rotation` is `None`
/// for grids that only carry a position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PoseMetadata {
    pub position: Position,
    pub rotation: Option<Rotation>,
    pub extracted_ok: bool,
    pub world_code: Option<u32>,
}

impl PoseMetadata {
    pub fn missing() -> Self {
        Self::default()
    }
}
