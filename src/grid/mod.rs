//! Best-effort extraction of camera pose data embedded in screenshots.
//!
//! Extraction never fails: anything that cannot be decoded yields
//! `PoseMetadata { extracted_ok: false, .. }` with zeroed fields. The byte
//! layout belongs to the producing application, so decoding is a pluggable
//! `PoseDecoder`; `CameraGridDecoder` is the default.

mod decoder;
pub mod layout;

use std::sync::Arc;

use image::DynamicImage;

use crate::models::{PoseMetadata, Position, Rotation};

pub use decoder::CameraGridDecoder;
pub use layout::{GridLayout, GridMode, Transform};

#[cfg(test)]
pub(crate) use decoder::tests::paint_grid;

/// One decoded record. Legacy grids carry neither a world code nor rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedGrid {
    pub world_code: Option<u32>,
    pub position: Position,
    pub rotation: Option<Rotation>,
}

/// A decoding strategy for the embedded record. Must be pure.
pub trait PoseDecoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(&self, image: &DynamicImage) -> Option<DecodedGrid>;
}

#[derive(Clone)]
pub struct GridMetadataExtractor {
    decoder: Arc<dyn PoseDecoder>,
}

impl Default for GridMetadataExtractor {
    fn default() -> Self {
        Self::new(Arc::new(CameraGridDecoder::default()))
    }
}

impl GridMetadataExtractor {
    pub fn new(decoder: Arc<dyn PoseDecoder>) -> Self {
        Self { decoder }
    }

    pub fn decoder_name(&self) -> &'static str {
        self.decoder.name()
    }

    pub fn extract(&self, bytes: &[u8]) -> PoseMetadata {
        match image::load_from_memory(bytes) {
            Ok(image) => self.extract_image(&image),
            Err(_) => PoseMetadata::missing(),
        }
    }

    pub fn extract_image(&self, image: &DynamicImage) -> PoseMetadata {
        match self.decoder.decode(image) {
            Some(grid) => PoseMetadata {
                position: grid.position,
                rotation: grid.rotation,
                extracted_ok: true,
                world_code: grid.world_code,
            },
            None => PoseMetadata::missing(),
        }
    }
}
