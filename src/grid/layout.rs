//! Geometry of the camera dot grid.
//!
//! The grid sits in the bottom-left corner of the frame. Anchor dots are
//! located by ratios of the image size so the same layout works at any
//! capture resolution.

/// Marker + sign + 32 integer bits + 32 fractional bits.
pub const COLUMNS: usize = 66;
/// World code, position x/y/z, rotation x/y/z.
pub const FULL_ROWS: usize = 7;
/// Position z/y/x, written by older camera prefabs.
pub const LEGACY_ROWS: usize = 3;

pub const MARKER_COLUMN: usize = 0;
pub const SIGN_COLUMN: usize = 1;
pub const INTEGER_COLUMNS: std::ops::Range<usize> = 2..34;
pub const FRACTION_COLUMNS: std::ops::Range<usize> = 34..66;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    Rotate180,
    FlipHorizontal,
    FlipVertical,
}

impl Transform {
    /// Order in which orientations are tried.
    pub const ALL: [Transform; 4] = [
        Transform::Identity,
        Transform::Rotate180,
        Transform::FlipHorizontal,
        Transform::FlipVertical,
    ];

    pub fn apply(self, (x, y): (i64, i64), width: u32, height: u32) -> (i64, i64) {
        let max_x = i64::from(width) - 1;
        let max_y = i64::from(height) - 1;
        match self {
            Transform::Identity => (x, y),
            Transform::Rotate180 => (max_x - x, max_y - y),
            Transform::FlipHorizontal => (max_x - x, y),
            Transform::FlipVertical => (x, max_y - y),
        }
    }
}

/// How many rows the grid carries. Both modes share the same anchors, so the
/// row spacing differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridMode {
    Full,
    Legacy,
}

impl GridMode {
    /// Full first: legacy rows land on rows 0, 3 and 6 of a full grid and
    /// would decode from it.
    pub const ALL: [GridMode; 2] = [GridMode::Full, GridMode::Legacy];

    pub fn rows(self) -> usize {
        match self {
            GridMode::Full => FULL_ROWS,
            GridMode::Legacy => LEGACY_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridLayout {
    /// Bottom-left anchor as (x, y) fractions of width/height.
    pub bottom_left: (f64, f64),
    /// Top-right anchor as (x, y) fractions of width/height.
    pub top_right: (f64, f64),
    /// Decimal digits carried by the fractional bits.
    pub precision: u32,
}

impl Default for GridLayout {
    fn default() -> Self {
        // Measured on 2560x1440 captures: (1, 1438) and (236, 1416).
        Self {
            bottom_left: (1.0 / 2560.0, 1438.0 / 1440.0),
            top_right: (236.0 / 2560.0, 1416.0 / 1440.0),
            precision: 8,
        }
    }
}

impl GridLayout {
    pub fn anchors(&self, width: u32, height: u32) -> ((i64, i64), (i64, i64)) {
        let scale = |ratio: f64, size: u32| (f64::from(size) * ratio).round() as i64;
        (
            (
                scale(self.bottom_left.0, width),
                scale(self.bottom_left.1, height),
            ),
            (scale(self.top_right.0, width), scale(self.top_right.1, height)),
        )
    }

    /// Pixel position of every dot, row-major, after applying `transform` to
    /// the anchors.
    pub fn dot_positions(
        &self,
        width: u32,
        height: u32,
        mode: GridMode,
        transform: Transform,
    ) -> Vec<(i64, i64)> {
        let rows = mode.rows();
        let (bottom_left, top_right) = self.anchors(width, height);
        let (bl_x, bl_y) = transform.apply(bottom_left, width, height);
        let (tr_x, tr_y) = transform.apply(top_right, width, height);

        let spacing_x = (tr_x - bl_x) as f64 / (COLUMNS - 1) as f64;
        let spacing_y = (tr_y - bl_y) as f64 / (rows - 1) as f64;

        let mut positions = Vec::with_capacity(rows * COLUMNS);
        for row in 0..rows {
            for col in 0..COLUMNS {
                let x = bl_x as f64 + col as f64 * spacing_x;
                let y = bl_y as f64 + row as f64 * spacing_y;
                positions.push((x.round() as i64, y.round() as i64));
            }
        }
        positions
    }

    pub fn fraction_scale(&self) -> f64 {
        10f64.powi(self.precision as i32)
    }
}
