use image::imageops::FilterType;
use image::GenericImageView;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::data::{Image, PixelBuffer};
use super::Transform;
use crate::configs::{DatasetOptions, Preprocess};

/// Per channel `(x - mean) / std`, the default maps [0, 1] onto [-1, 1].
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Normalize {
    pub mean: f32,
    pub std: f32,
}

impl Default for Normalize {
    fn default() -> Self {
        Normalize { mean: 0.5, std: 0.5 }
    }
}

impl Transform<Image, Image> for Normalize {
    fn transform(&mut self, mut data: Image) -> Image {
        let (mean, std) = (self.mean, self.std);
        data.image.mapv_inplace(|x| (x - mean) / std);
        data
    }
}

/// The geometric part of the options, with the finetuning switch applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    pub preprocess: Preprocess,
    pub load_size: u32,
    pub crop_size: u32,
    pub no_flip: bool,
}

impl TransformOptions {
    /// Once finetuning, images are loaded at `crop_size` so the resize-crop
    /// augmentation goes away.
    pub fn new(opts: &DatasetOptions, is_finetuning: bool) -> Self {
        Self {
            preprocess: opts.preprocess,
            load_size: if is_finetuning { opts.crop_size } else { opts.load_size },
            crop_size: opts.crop_size,
            no_flip: opts.no_flip,
        }
    }
}

/// Random draws shared by an image and its mask so both stay aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    pub crop_pos: (u32, u32),
    pub flip: bool,
}

/// `size` is the (width, height) of the decoded image.
pub fn get_params<R: Rng>(opts: &TransformOptions, size: (u32, u32), rng: &mut R) -> TransformParams {
    let (w, h) = match opts.preprocess {
        Preprocess::ResizeAndCrop => (opts.load_size, opts.load_size),
        _ => size,
    };
    let x = rng.gen_range(0..=w.saturating_sub(opts.crop_size));
    let y = rng.gen_range(0..=h.saturating_sub(opts.crop_size));
    let flip = rng.gen_bool(0.5);
    TransformParams { crop_pos: (x, y), flip }
}

fn crop(img: PixelBuffer, pos: (u32, u32), size: u32) -> PixelBuffer {
    let (w, h) = img.dimensions();
    if w > size || h > size {
        img.crop_imm(pos.0, pos.1, size.min(w), size.min(h))
    } else {
        img
    }
}

fn apply(opts: &TransformOptions, params: &TransformParams, img: &PixelBuffer, filter: FilterType) -> PixelBuffer {
    let img = match opts.preprocess {
        Preprocess::ResizeAndCrop => {
            let resized = img.resize_exact(opts.load_size, opts.load_size, filter);
            crop(resized, params.crop_pos, opts.crop_size)
        }
        Preprocess::Crop => crop(img.clone(), params.crop_pos, opts.crop_size),
        Preprocess::Resize => img.resize_exact(opts.crop_size, opts.crop_size, filter),
        Preprocess::None => img.clone(),
    };
    if params.flip && !opts.no_flip { img.fliph() } else { img }
}

/// RGB image → CHW array normalized to [-1, 1].
pub fn transform_image(opts: &TransformOptions, params: &TransformParams, img: &PixelBuffer) -> Image {
    let pixels = apply(opts, params, img, FilterType::CatmullRom);
    Normalize::default().transform(Image::from_rgb(&pixels))
}

/// Mask → single channel CHW array in [0, 1]. Nearest neighbour keeps
/// label values intact.
pub fn transform_mask(opts: &TransformOptions, params: &TransformParams, mask: &PixelBuffer) -> Image {
    let pixels = apply(opts, params, mask, FilterType::Nearest);
    Image::from_luma(&pixels)
}


#[cfg(test)]
mod test {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
    use rand::{rngs::StdRng, SeedableRng};

    fn opts(preprocess: Preprocess, load_size: u32, crop_size: u32) -> TransformOptions {
        TransformOptions { preprocess, load_size, crop_size, no_flip: false }
    }

    #[test]
    fn finetuning_loads_at_crop_size() {
        let base = DatasetOptions { load_size: 286, crop_size: 256, ..Default::default() };
        assert_eq!(TransformOptions::new(&base, false).load_size, 286);
        assert_eq!(TransformOptions::new(&base, true).load_size, 256);
    }

    #[test]
    fn resize_and_crop_size() {
        let o = opts(Preprocess::ResizeAndCrop, 12, 8);
        let mut rng = StdRng::seed_from_u64(3);
        let img = DynamicImage::ImageRgb8(RgbImage::new(30, 17));
        for _ in 0..10 {
            let p = get_params(&o, (30, 17), &mut rng);
            assert!(p.crop_pos.0 <= 4 && p.crop_pos.1 <= 4);
            let out = transform_image(&o, &p, &img);
            assert_eq!(out.image.dim(), (3, 8, 8));
            assert!(out.image.iter().all(|&x| x == -1.0));
        }
    }

    #[test]
    fn load_equal_crop_never_offsets() {
        let o = opts(Preprocess::ResizeAndCrop, 8, 8);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            assert_eq!(get_params(&o, (64, 64), &mut rng).crop_pos, (0, 0));
        }
    }

    #[test]
    fn mask_follows_image_flip() {
        let mut img = RgbImage::new(4, 4);
        let mut mask = GrayImage::new(4, 4);
        for y in 0..4 {
            img.put_pixel(0, y, Rgb([255, 255, 255]));
            mask.put_pixel(0, y, Luma([255]));
        }
        let o = opts(Preprocess::None, 4, 4);
        let p = TransformParams { crop_pos: (0, 0), flip: true };
        let a = transform_image(&o, &p, &DynamicImage::ImageRgb8(img));
        let m = transform_mask(&o, &p, &DynamicImage::ImageLuma8(mask));
        assert_eq!(a.image[[0, 0, 3]], 1.0);
        assert_eq!(a.image[[0, 0, 0]], -1.0);
        assert_eq!(m.image[[0, 0, 3]], 1.0);
        assert_eq!(m.image[[0, 0, 0]], 0.0);

        let no_flip = TransformOptions { no_flip: true, ..o };
        let m = transform_mask(&no_flip, &p, &DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([0]))));
        assert_eq!(m.image.sum(), 0.0);
    }

    #[test]
    fn crop_smaller_than_image_only() {
        let o = opts(Preprocess::Crop, 0, 8);
        let p = TransformParams { crop_pos: (0, 0), flip: false };
        let small = DynamicImage::ImageRgb8(RgbImage::new(5, 6));
        assert_eq!(transform_image(&o, &p, &small).size(), [6, 5]);
        let tall = DynamicImage::ImageRgb8(RgbImage::new(5, 20));
        assert_eq!(transform_image(&o, &p, &tall).size(), [8, 5]);
    }
}
