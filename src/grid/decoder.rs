//! Default pose decoding strategy: the dot grid written by the in-game camera.
//!
//! Each row encodes one signed fixed-point number. Column 0 must be a mid-gray
//! marker, column 1 is the sign (set = positive), then 32 integer bits and 32
//! fractional bits, most significant first. A dot counts as set when its mean
//! RGB brightness is above 127.
//!
//! The seven-row grid carries a world code, position and rotation. Older
//! camera prefabs write three rows holding position z, y and x only.

use image::{DynamicImage, GenericImageView, Pixel, Rgb};

use super::layout::{
    GridLayout, GridMode, Transform, COLUMNS, FRACTION_COLUMNS, INTEGER_COLUMNS, MARKER_COLUMN,
    SIGN_COLUMN,
};
use super::{DecodedGrid, PoseDecoder};
use crate::models::{Position, Rotation};

const MARKER_RANGE: std::ops::RangeInclusive<u8> = 118..=138;

#[derive(Debug, Clone, Default)]
pub struct CameraGridDecoder {
    layout: GridLayout,
}

impl CameraGridDecoder {
    pub fn new(layout: GridLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    fn decode_with(
        &self,
        image: &DynamicImage,
        mode: GridMode,
        transform: Transform,
    ) -> Option<DecodedGrid> {
        let (width, height) = image.dimensions();
        let dots = self.layout.dot_positions(width, height, mode, transform);
        // Luma pixels cannot show the marker's colour, only its brightness.
        let check_marker = image.color().has_color();

        let values = dots
            .chunks(COLUMNS)
            .map(|row| self.decode_row(image, row, check_marker))
            .collect::<Option<Vec<f64>>>()?;

        Some(match mode {
            GridMode::Full => DecodedGrid {
                world_code: Some(values[0].trunc().abs() as u32),
                position: Position {
                    x: values[1],
                    y: values[2],
                    z: values[3],
                },
                rotation: Some(Rotation {
                    pitch: values[4],
                    yaw: values[5],
                    roll: values[6],
                }),
            },
            GridMode::Legacy => DecodedGrid {
                world_code: None,
                position: Position {
                    x: values[2],
                    y: values[1],
                    z: values[0],
                },
                rotation: None,
            },
        })
    }

    fn decode_row(
        &self,
        image: &DynamicImage,
        row: &[(i64, i64)],
        check_marker: bool,
    ) -> Option<f64> {
        let marker = pixel_at(image, row[MARKER_COLUMN])?;
        if check_marker && !marker.0.iter().all(|channel| MARKER_RANGE.contains(channel)) {
            return None;
        }

        let sign = if is_set(image, row[SIGN_COLUMN]) { 1.0 } else { -1.0 };
        let integer = read_bits(image, &row[INTEGER_COLUMNS]);
        let fraction = read_bits(image, &row[FRACTION_COLUMNS]);

        Some(sign * (integer as f64 + fraction as f64 / self.layout.fraction_scale()))
    }
}

impl PoseDecoder for CameraGridDecoder {
    fn name(&self) -> &'static str {
        "camera-grid"
    }

    fn decode(&self, image: &DynamicImage) -> Option<DecodedGrid> {
        GridMode::ALL.iter().find_map(|mode| {
            Transform::ALL
                .iter()
                .find_map(|transform| self.decode_with(image, *mode, *transform))
        })
    }
}

fn pixel_at(image: &DynamicImage, (x, y): (i64, i64)) -> Option<Rgb<u8>> {
    let x = u32::try_from(x).ok()?;
    let y = u32::try_from(y).ok()?;
    if !image.in_bounds(x, y) {
        return None;
    }
    Some(image.get_pixel(x, y).to_rgb())
}

fn is_set(image: &DynamicImage, position: (i64, i64)) -> bool {
    pixel_at(image, position)
        .map(|Rgb([r, g, b])| u32::from(r) + u32::from(g) + u32::from(b) > 3 * 127)
        .unwrap_or(false)
}

fn read_bits(image: &DynamicImage, dots: &[(i64, i64)]) -> u64 {
    dots.iter()
        .fold(0u64, |acc, dot| (acc << 1) | u64::from(is_set(image, *dot)))
}
