/// This module only defines the dataset logic for indexing, pairing and
/// decoding the two image domains. Feature extraction and the training loop
/// live outside of this crate and only see `UnalignedItem`s.
use std::path::PathBuf;

use anyhow::Result;
use thiserror::Error;

pub mod data;
pub mod image_folder;
pub mod transforms;
pub mod unaligned;

pub use data::{FileDecoder, Image, ImageDecoder, PixelBuffer};
pub use image_folder::{make_dataset, ImageFolder, Sample, ScanMode, IMG_EXTENSIONS};

/// Fatal conditions raised while building a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{} is not a valid directory", .0.display())]
    InvalidRoot(PathBuf),
    #[error("Found 0 images in: {}\nSupported image extensions are: {}", .0.display(), IMG_EXTENSIONS.join(","))]
    NoImages(PathBuf),
    #[error("domain {0} has no samples, cannot pair it")]
    EmptyDomain(char),
    #[error("no dataset profile named {0:?}")]
    UnknownProfile(String),
}

/// Random access over a fixed collection. `get` takes `&mut self` since a
/// dataset may own the random state used to draw augmentations or pairings.
pub trait Dataset {
    type DataPoint;
    fn len(&self) -> usize;
    fn get(&mut self, index: usize) -> Result<Self::DataPoint>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Transform<In, Out> {
    fn transform(&mut self, x: In) -> Out;
}
