use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

use super::data::{FileDecoder, Image, ImageDecoder};
use super::image_folder::{make_dataset, Sample, ScanMode};
use super::transforms::{get_params, transform_image, transform_mask, TransformOptions};
use super::{Dataset, DatasetError};
use crate::configs::{DatasetOptions, DomainDirs, ProfileRegistry};

/// One training example: an A image, an unrelated B image, where they came
/// from, and the transformed A mask when the A sample has one.
#[derive(Clone, Debug)]
pub struct UnalignedItem {
    pub a: Image,
    pub b: Image,
    pub a_path: Sample,
    pub b_path: Sample,
    pub a_mask: Option<Image>,
}

/// Two domains with no correspondence between their images. Domain A is
/// walked in order, the B partner of each A image is drawn at random unless
/// `serial_batches` is set. Domain sizes need not match; the dataset is as
/// long as the larger of the two.
///
/// The random state is owned by the dataset and seeded from the options, so
/// every data loading worker should hold its own instance with its own seed.
pub struct UnalignedDataset<D: ImageDecoder = FileDecoder> {
    opts: DatasetOptions,
    a_samples: Vec<Sample>,
    b_samples: Vec<Sample>,
    decoder: D,
    rng: StdRng,
    current_epoch: usize,
}

impl UnalignedDataset<FileDecoder> {
    pub fn new(opts: DatasetOptions, registry: &ProfileRegistry) -> Result<Self> {
        Self::with_decoder(opts, registry, FileDecoder)
    }
}

impl<D: ImageDecoder> UnalignedDataset<D> {
    pub fn with_decoder(opts: DatasetOptions, registry: &ProfileRegistry, decoder: D) -> Result<Self> {
        let dirs = opts.domain_dirs(registry)?;
        let (a_samples, b_samples) = Self::scan(&opts, &dirs)?;
        info!(
            dir_a = %dirs.dir_a.display(),
            dir_b = %dirs.dir_b.display(),
            a_size = a_samples.len(),
            b_size = b_samples.len(),
            masked = a_samples.iter().filter(|s| s.mask.is_some()).count(),
            "built unaligned dataset"
        );
        Self::from_samples(opts, a_samples, b_samples, decoder)
    }

    fn scan(opts: &DatasetOptions, dirs: &DomainDirs) -> Result<(Vec<Sample>, Vec<Sample>)> {
        let mode = if dirs.per_instance { ScanMode::PerInstance } else { ScanMode::Ordinary };
        let a = make_dataset(&dirs.dir_a, opts.max_dataset_size, mode, dirs.mask_a.as_deref())?;
        let b = make_dataset(&dirs.dir_b, opts.max_dataset_size, mode, None)?;
        Ok((a, b))
    }

    /// Builds from already indexed domains. Both must be non empty.
    pub fn from_samples(opts: DatasetOptions, a_samples: Vec<Sample>, b_samples: Vec<Sample>, decoder: D) -> Result<Self> {
        if a_samples.is_empty() {
            return Err(DatasetError::EmptyDomain('A').into());
        }
        if b_samples.is_empty() {
            return Err(DatasetError::EmptyDomain('B').into());
        }
        let rng = StdRng::seed_from_u64(opts.seed);
        Ok(Self { opts, a_samples, b_samples, decoder, rng, current_epoch: 0 })
    }

    pub fn a_size(&self) -> usize {
        self.a_samples.len()
    }

    pub fn b_size(&self) -> usize {
        self.b_samples.len()
    }

    pub fn a_samples(&self) -> &[Sample] {
        &self.a_samples
    }

    pub fn b_samples(&self) -> &[Sample] {
        &self.b_samples
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.opts
    }

    /// Set by the training loop at the start of every epoch.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.current_epoch = epoch;
    }

    pub fn is_finetuning(&self) -> bool {
        self.opts.is_finetuning(self.current_epoch)
    }

    /// The (A, B) sample indices for `index`. A is always `index mod |A|`,
    /// B is `index mod |B|` for serial runs and a uniform draw otherwise.
    pub fn pair_indices(&mut self, index: usize) -> (usize, usize) {
        let index_a = index % self.a_samples.len();
        let index_b = if self.opts.serial_batches {
            index % self.b_samples.len()
        } else {
            self.rng.gen_range(0..self.b_samples.len())
        };
        (index_a, index_b)
    }

    pub fn get_pair(&mut self, index: usize) -> Result<UnalignedItem> {
        let (index_a, index_b) = self.pair_indices(index);
        let a_path = self.a_samples[index_a].clone();
        let b_path = self.b_samples[index_b].clone();

        let a_img = self.decoder.decode(&a_path.image)?;
        let b_img = self.decoder.decode(&b_path.image)?;
        let a_mask = a_path.mask.as_ref().map(|m| self.decoder.decode(m)).transpose()?;

        let topts = TransformOptions::new(&self.opts, self.is_finetuning());
        // serial runs draw augmentations from (seed, index) so a repeated
        // index gives back the same tensors
        let mut index_rng;
        let rng = if self.opts.serial_batches {
            index_rng = StdRng::seed_from_u64(self.opts.seed ^ index as u64);
            &mut index_rng
        } else {
            &mut self.rng
        };
        let a_params = get_params(&topts, (a_img.width(), a_img.height()), &mut *rng);
        let b_params = get_params(&topts, (b_img.width(), b_img.height()), &mut *rng);

        let a = transform_image(&topts, &a_params, &a_img);
        let a_mask = a_mask.map(|m| transform_mask(&topts, &a_params, &m));
        let b = transform_image(&topts, &b_params, &b_img);

        Ok(UnalignedItem { a, b, a_path, b_path, a_mask })
    }
}

impl<D: ImageDecoder> Dataset for UnalignedDataset<D> {
    type DataPoint = UnalignedItem;

    fn len(&self) -> usize {
        self.a_samples.len().max(self.b_samples.len())
    }

    fn get(&mut self, index: usize) -> Result<Self::DataPoint> {
        self.get_pair(index)
    }
}
