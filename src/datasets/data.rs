/////////////////////////////////////////////////////////////////////////////////////////
/// The data types that the decoders output and the transforms input.

use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use ndarray::prelude::*;

/// What an `ImageDecoder` hands back, still in pixel space.
pub type PixelBuffer = DynamicImage;

/// Turns a file on disk into pixels. Injected into the datasets so tests and
/// callers with their own storage can skip the filesystem.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<PixelBuffer>;
}

/// Decodes with the `image` crate, guessing the format from the file content.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileDecoder;

impl ImageDecoder for FileDecoder {
    fn decode(&self, path: &Path) -> Result<PixelBuffer> {
        let reader = image::io::Reader::open(path)
            .with_context(|| format!("Failed to open image {}", path.display()))?
            .with_guessed_format()
            .with_context(|| format!("Failed to read image header {}", path.display()))?;
        reader.decode().with_context(|| format!("Failed to decode image {}", path.display()))
    }
}

/// Expect images to be laid out CHW, values in [0, 1] unless normalized.
#[derive(Clone, Debug)]
pub struct Image {
    pub image: Array3<f32>,
}

impl Image {
    /// [height, width]
    pub fn size(&self) -> [usize; 2] {
        let shape = self.image.dim();
        [shape.1, shape.2]
    }

    pub fn channels(&self) -> usize {
        self.image.dim().0
    }

    /// Converts to 3 channel RGB scaled to [0, 1].
    pub fn from_rgb(im: &DynamicImage) -> Image {
        let im = im.to_rgb8();
        let (w, h) = (im.width() as usize, im.height() as usize);
        let hwc = Array::from_shape_vec((h, w, 3), im.into_raw())
            .expect("rgb8 buffer length is width * height * 3");
        let chw = hwc.permuted_axes([2, 0, 1]).mapv(|x| x as f32 / 255.0);
        Self { image: chw.as_standard_layout().into_owned() }
    }

    /// Converts to a single luma channel scaled to [0, 1].
    pub fn from_luma(im: &DynamicImage) -> Image {
        let im = im.to_luma8();
        let (w, h) = (im.width() as usize, im.height() as usize);
        let hw = Array::from_shape_vec((h, w), im.into_raw())
            .expect("luma8 buffer length is width * height");
        Self { image: hw.insert_axis(Axis(0)).mapv(|x| x as f32 / 255.0) }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn rgb_is_chw() {
        let mut im = RgbImage::new(3, 2);
        im.put_pixel(2, 1, Rgb([255, 0, 51]));
        let x = Image::from_rgb(&DynamicImage::ImageRgb8(im));
        assert_eq!(x.image.dim(), (3, 2, 3));
        assert_eq!(x.size(), [2, 3]);
        assert_eq!(x.image[[0, 1, 2]], 1.0);
        assert_eq!(x.image[[1, 1, 2]], 0.0);
        assert!((x.image[[2, 1, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn luma_has_one_channel() {
        let mut im = GrayImage::new(4, 4);
        im.put_pixel(0, 3, Luma([255]));
        let x = Image::from_luma(&DynamicImage::ImageLuma8(im));
        assert_eq!(x.channels(), 1);
        assert_eq!(x.image[[0, 3, 0]], 1.0);
        assert_eq!(x.image.sum(), 1.0);
    }

    #[test]
    fn file_decoder_reports_missing_file() {
        let err = FileDecoder.decode(Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(format!("{err:#}").contains("here.png"));
    }
}
