use std::env;

use anyhow::{Context, Result};
use ndarray::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nce_lib::datasets::Dataset;
use nce_lib::nn::{l2_normalize_rows, randn_seeded};
use nce_lib::{load_config_file, PatchNceLoss, ProfileRegistry, RunConfig, UnalignedDataset, UnalignedItem};

const DEFAULT_CONFIG_PATH: &str = "assets/configs/run.ron";
const PATCHES_PER_IMAGE: usize = 16;
const FEATURE_DIM: usize = 32;

/// Samples the A mask at evenly spaced pixels, one value per patch. Items
/// without a mask get all zeros, i.e. unit weights.
fn patch_mask(item: &UnalignedItem, patches: usize) -> Array1<f32> {
    match &item.a_mask {
        Some(mask) => {
            let flat: Vec<f32> = mask.image.iter().copied().collect();
            let stride = (flat.len() / patches).max(1);
            Array1::from_iter((0..patches).map(|i| flat.get(i * stride).copied().unwrap_or(0.0)))
        }
        None => Array1::zeros(patches),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config: RunConfig = load_config_file(&config_path)?;
    let registry = match &config.profiles {
        Some(path) => ProfileRegistry::from_file(path)?,
        None => ProfileRegistry::default(),
    };

    let mut dataset = UnalignedDataset::new(config.dataset.clone(), &registry)
        .context("Failed to build the unaligned dataset")?;
    dataset.set_epoch(config.current_epoch);
    info!(len = dataset.len(), finetuning = dataset.is_finetuning(), "dataset ready");

    let batch_size = config.nce.batch_size.max(1);
    let mut masks = Vec::with_capacity(batch_size);
    for i in 0..batch_size.min(dataset.len()) {
        let item = dataset.get(i)?;
        info!(
            a = %item.a_path.image.display(),
            b = %item.b_path.image.display(),
            mask = item.a_mask.is_some(),
            "pair {i}"
        );
        masks.push(patch_mask(&item, PATCHES_PER_IMAGE));
    }
    if masks.len() < batch_size {
        warn!(have = masks.len(), batch_size, "dataset smaller than one batch, padding with unmasked images");
        masks.resize(batch_size, Array1::zeros(PATCHES_PER_IMAGE));
    }

    // stand-in features, the feature network lives outside this crate
    let n = batch_size * PATCHES_PER_IMAGE;
    let feat_q = l2_normalize_rows(&randn_seeded::<f32, _, _>((n, FEATURE_DIM), config.dataset.seed).view());
    let noise = randn_seeded::<f32, _, _>((n, FEATURE_DIM), config.dataset.seed + 1) * 0.1;
    let feat_k = l2_normalize_rows(&(&feat_q + &noise).view());
    let views: Vec<_> = masks.iter().map(|m| m.view()).collect();
    let mask = ndarray::concatenate(Axis(0), &views)?;

    let nce = PatchNceLoss::new(&config.nce);
    let (loss, ctx) = nce.forward(&feat_q.view(), &feat_k.view(), Some(&mask.view()))?;
    let grad = nce.backward(&ctx, &Array1::from_elem(n, 1.0 / n as f32).view());
    info!(
        loss = loss.mean().unwrap_or(0.0),
        grad_norm = grad.iter().map(|x| x * x).sum::<f32>().sqrt(),
        "patch nce on random features"
    );
    Ok(())
}
