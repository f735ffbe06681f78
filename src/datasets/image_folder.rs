use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use itertools::Itertools;
use tracing::debug;

use super::data::{FileDecoder, Image, ImageDecoder};
use super::{Dataset, DatasetError, Transform};

pub const IMG_EXTENSIONS: [&str; 14] = [
    ".jpg", ".JPG", ".jpeg", ".JPEG",
    ".png", ".PNG", ".ppm", ".PPM", ".bmp", ".BMP",
    ".tif", ".TIF", ".tiff", ".TIFF",
];

/// markers carried by image names but not by the matching mask names
const ON_MARKER: &str = ".d-on";
const OFF_MARKER: &str = ".d-off";

pub fn is_image_file(file_name: &str) -> bool {
    IMG_EXTENSIONS.iter().any(|ext| file_name.ends_with(ext))
}

/// The mask file name for an image file name: every `.d-on` is removed, or
/// failing that every `.d-off`.
pub fn mask_file_name(file_name: &str) -> String {
    if file_name.contains(ON_MARKER) {
        file_name.replace(ON_MARKER, "")
    } else {
        file_name.replace(OFF_MARKER, "")
    }
}

/// One image of a domain, and its mask if one was found for it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sample {
    pub image: PathBuf,
    pub mask: Option<PathBuf>,
}

impl Sample {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self { image: image.into(), mask: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// `root` itself is walked, and must hold at least one image
    Ordinary,
    /// every subdirectory of `root` is an instance, walked on its own and
    /// matched against `mask_root/<instance>/`
    PerInstance,
}

/// Walks `dir` depth first in file name order, following symlinks, and
/// collects every image file.
fn walk_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = dir.read_dir()
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list directory {}", dir.display()))?;

    for path in entries.into_iter().sorted() {
        // fs::metadata follows links, a dangling one is neither file nor dir
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "skipping dangling entry");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        };
        if meta.is_dir() {
            walk_images(&path, out)?;
        } else if meta.is_file() {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            if is_image_file(&name) {
                out.push(path);
            }
        }
    }
    Ok(())
}

fn is_dir_or_link(path: &Path) -> bool {
    path.is_dir() || path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false)
}

/// Builds the sorted sample list of one domain, truncated to `max_size`.
///
/// In `Ordinary` mode an invalid root or an empty result is an error. In
/// `PerInstance` mode neither is checked up front, and a sample only gets a
/// mask when `mask_root` is set and the mask file exists.
pub fn make_dataset(root: &Path, max_size: Option<usize>, mode: ScanMode, mask_root: Option<&Path>) -> Result<Vec<Sample>> {
    let mut samples = Vec::<Sample>::new();

    match mode {
        ScanMode::Ordinary => {
            if !is_dir_or_link(root) {
                return Err(DatasetError::InvalidRoot(root.to_path_buf()).into());
            }
            let mut paths = Vec::new();
            walk_images(root, &mut paths)?;
            samples.extend(paths.into_iter().map(Sample::new));
            if samples.is_empty() {
                return Err(DatasetError::NoImages(root.to_path_buf()).into());
            }
        }
        ScanMode::PerInstance => {
            let instances = root.read_dir()
                .with_context(|| format!("Failed to read instance root {}", root.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_dir())
                .sorted();

            for instance_dir in instances {
                let mut paths = Vec::new();
                walk_images(&instance_dir, &mut paths)?;
                let instance = instance_dir.file_name().unwrap_or_default();
                let mask_dir = mask_root.map(|m| m.join(instance));

                for image in paths {
                    let name = image.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                    let mask = mask_dir.as_ref()
                        .map(|dir| dir.join(mask_file_name(&name)))
                        .filter(|m| m.is_file());
                    samples.push(Sample { image, mask });
                }
            }
        }
    }

    samples.sort();
    let found = samples.len();
    if let Some(max_size) = max_size {
        samples.truncate(max_size);
    }
    debug!(root = %root.display(), ?mode, found, kept = samples.len(), "scanned image folder");
    Ok(samples)
}


/// A plain folder of images, all from one domain.
pub struct ImageFolder<D: ImageDecoder = FileDecoder> {
    root: PathBuf,
    samples: Vec<Sample>,
    decoder: D,
    transform: Option<Box<dyn Transform<Image, Image> + Send>>,
    return_paths: bool,
}

impl ImageFolder<FileDecoder> {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::with_decoder(root, FileDecoder)
    }
}

impl<D: ImageDecoder> ImageFolder<D> {
    pub fn with_decoder<P: AsRef<Path>>(root: P, decoder: D) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let samples = make_dataset(&root, None, ScanMode::Ordinary, None)?;
        Ok(Self { root, samples, decoder, transform: None, return_paths: false })
    }

    pub fn transform(mut self, transform: impl Transform<Image, Image> + Send + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn return_paths(mut self, yes: bool) -> Self {
        self.return_paths = yes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl<D: ImageDecoder> Dataset for ImageFolder<D> {
    type DataPoint = (Image, Option<PathBuf>);

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&mut self, index: usize) -> Result<Self::DataPoint> {
        let sample = self.samples.get(index)
            .with_context(|| format!("index {index} out of range for {} images", self.samples.len()))?;
        let pixels = self.decoder.decode(&sample.image)?;
        let mut img = Image::from_rgb(&pixels);
        if let Some(t) = self.transform.as_mut() {
            img = t.transform(img);
        }
        let path = if self.return_paths { Some(sample.image.clone()) } else { None };
        Ok((img, path))
    }
}
