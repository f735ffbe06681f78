use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use ron;

pub mod configs;
pub mod datasets;
pub mod nn;

pub use configs::{DatasetOptions, DatasetProfile, NceOptions, Phase, ProfileRegistry, RunConfig};
pub use datasets::unaligned::{UnalignedDataset, UnalignedItem};
pub use nn::patchnce::{NceError, PatchNceLoss};


/// Every serde type round-trips through ron, so option structs, profiles and
/// run configs can be stored as plain text files.
pub trait Config: Send + Sync {
    fn config(&self) -> Result<String>;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> Result<String> {
        let pretty = ron::ser::PrettyConfig::default();
        ron::ser::to_string_pretty(self, pretty).context("Failed to serialize config")
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load context {}", config))?;
        Ok(())
    }
}

/// Reads a ron file straight into `T`.
pub fn load_config_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    ron::from_str(&text).with_context(|| format!("Failed to parse config file {}", path.display()))
}


#[test]
fn config_roundtrip_test() {
    let mut opts = NceOptions::default();
    opts.nce_t = 0.2;
    opts.batch_size = 3;
    let serialized = opts.config().unwrap();

    let mut loaded = NceOptions::default();
    loaded.load_config(&serialized).unwrap();
    assert_eq!(loaded.batch_size, 3);
    assert!((loaded.nce_t - 0.2).abs() < 1e-12);
}

#[test]
fn load_config_rejects_garbage() {
    let mut opts = NceOptions::default();
    assert!(opts.load_config("(nce_t: \"warm\")").is_err());
}
