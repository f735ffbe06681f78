use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::datasets::DatasetError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Train,
    Test,
}

/// How an image is brought to `crop_size` before being fed to the network.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Preprocess {
    /// resize to `load_size` square, then random crop of `crop_size`
    ResizeAndCrop,
    /// random crop of `crop_size` at the native resolution
    Crop,
    /// resize straight to `crop_size` square
    Resize,
    None,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DatasetOptions {
    pub dataroot: PathBuf,
    pub phase: Phase,
    pub is_train: bool,
    pub max_dataset_size: Option<usize>,
    /// take B in index order instead of drawing it at random
    pub serial_batches: bool,
    pub load_size: u32,
    pub crop_size: u32,
    pub preprocess: Preprocess,
    pub no_flip: bool,
    /// epochs at the initial learning rate, past this the run is finetuning
    pub n_epochs: usize,
    pub seed: u64,
    /// name of an entry in the profile registry, overrides `dataroot`
    pub profile: Option<String>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            dataroot: PathBuf::from("./datasets"),
            phase: Phase::Train,
            is_train: true,
            max_dataset_size: None,
            serial_batches: false,
            load_size: 286,
            crop_size: 256,
            preprocess: Preprocess::ResizeAndCrop,
            no_flip: false,
            n_epochs: 200,
            seed: 0,
            profile: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NceOptions {
    pub nce_t: f64,
    pub nce_includes_all_negatives_from_minibatch: bool,
    pub batch_size: usize,
}

impl Default for NceOptions {
    fn default() -> Self {
        Self { nce_t: 0.07, nce_includes_all_negatives_from_minibatch: false, batch_size: 1 }
    }
}

/// A fixed deployment layout that does not follow `dataroot/<phase>{A,B}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DatasetProfile {
    pub dir_a: PathBuf,
    pub dir_b: PathBuf,
    #[serde(default)]
    pub mask_a: Option<PathBuf>,
    /// scan every immediate subdirectory as its own instance
    #[serde(default)]
    pub per_instance: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ProfileRegistry {
    pub profiles: HashMap<String, DatasetProfile>,
}

impl ProfileRegistry {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        crate::load_config_file(path)
    }

    pub fn insert(&mut self, name: impl Into<String>, profile: DatasetProfile) {
        self.profiles.insert(name.into(), profile);
    }

    pub fn get(&self, name: &str) -> Result<&DatasetProfile, DatasetError> {
        self.profiles.get(name).ok_or_else(|| DatasetError::UnknownProfile(name.to_string()))
    }
}

/// The directories one run of the unaligned dataset reads from.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainDirs {
    pub dir_a: PathBuf,
    pub dir_b: PathBuf,
    pub mask_a: Option<PathBuf>,
    pub per_instance: bool,
}

impl DatasetOptions {
    pub fn is_finetuning(&self, current_epoch: usize) -> bool {
        self.is_train && current_epoch > self.n_epochs
    }

    /// Resolves where domain A and B live: a named profile if one is set,
    /// otherwise `dataroot/<phase>A` and `dataroot/<phase>B`, falling back to
    /// `valA`/`valB` for a test run without test folders.
    pub fn domain_dirs(&self, registry: &ProfileRegistry) -> Result<DomainDirs, DatasetError> {
        if let Some(name) = &self.profile {
            let profile = registry.get(name)?;
            return Ok(DomainDirs {
                dir_a: profile.dir_a.clone(),
                dir_b: profile.dir_b.clone(),
                mask_a: profile.mask_a.clone(),
                per_instance: profile.per_instance,
            });
        }

        let mut dir_a = self.dataroot.join(format!("{}A", self.phase));
        let mut dir_b = self.dataroot.join(format!("{}B", self.phase));
        if self.phase == Phase::Test && !dir_a.exists() && self.dataroot.join("valA").exists() {
            dir_a = self.dataroot.join("valA");
            dir_b = self.dataroot.join("valB");
        }
        Ok(DomainDirs { dir_a, dir_b, mask_a: None, per_instance: false })
    }
}

/// Everything the driver binary needs in one file.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct RunConfig {
    pub dataset: DatasetOptions,
    pub nce: NceOptions,
    pub profiles: Option<PathBuf>,
    pub current_epoch: usize,
}


#[cfg(test)]
mod test {
    use std::fs;
    use std::str::FromStr;

    use super::*;
    use crate::Config;

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Train.to_string(), "train");
        assert_eq!(Phase::from_str("test").unwrap(), Phase::Test);
        assert_eq!(Preprocess::ResizeAndCrop.to_string(), "resize_and_crop");
    }

    #[test]
    fn finetuning_threshold() {
        let opts = DatasetOptions { n_epochs: 5, ..Default::default() };
        assert!(!opts.is_finetuning(5));
        assert!(opts.is_finetuning(6));
        let test_opts = DatasetOptions { is_train: false, ..opts };
        assert!(!test_opts.is_finetuning(100));
    }

    #[test]
    fn default_dirs_follow_phase() {
        let opts = DatasetOptions { dataroot: "/data/horse2zebra".into(), ..Default::default() };
        let dirs = opts.domain_dirs(&ProfileRegistry::default()).unwrap();
        assert_eq!(dirs.dir_a, PathBuf::from("/data/horse2zebra/trainA"));
        assert_eq!(dirs.dir_b, PathBuf::from("/data/horse2zebra/trainB"));
        assert!(!dirs.per_instance);
    }

    #[test]
    fn test_phase_falls_back_to_val() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("valA")).unwrap();
        fs::create_dir_all(root.path().join("valB")).unwrap();
        let opts = DatasetOptions {
            dataroot: root.path().to_path_buf(),
            phase: Phase::Test,
            ..Default::default()
        };
        let dirs = opts.domain_dirs(&ProfileRegistry::default()).unwrap();
        assert_eq!(dirs.dir_a, root.path().join("valA"));
        assert_eq!(dirs.dir_b, root.path().join("valB"));

        fs::create_dir_all(root.path().join("testA")).unwrap();
        let dirs = opts.domain_dirs(&ProfileRegistry::default()).unwrap();
        assert_eq!(dirs.dir_a, root.path().join("testA"));
    }

    #[test]
    fn profile_overrides_dataroot() {
        let mut registry = ProfileRegistry::default();
        registry.insert("sides", DatasetProfile {
            dir_a: "/nas/black/image".into(),
            dir_b: "/nas/white/image".into(),
            mask_a: Some("/nas/black/mask".into()),
            per_instance: true,
        });
        let opts = DatasetOptions { profile: Some("sides".into()), ..Default::default() };
        let dirs = opts.domain_dirs(&registry).unwrap();
        assert_eq!(dirs.mask_a, Some(PathBuf::from("/nas/black/mask")));
        assert!(dirs.per_instance);

        let missing = DatasetOptions { profile: Some("nope".into()), ..Default::default() };
        assert!(matches!(missing.domain_dirs(&registry), Err(DatasetError::UnknownProfile(_))));
    }

    #[test]
    fn registry_from_ron() {
        let text = r#"(profiles: {"sides": (dir_a: "/a", dir_b: "/b", per_instance: true)})"#;
        let mut registry = ProfileRegistry::default();
        registry.load_config(text).unwrap();
        let profile = registry.get("sides").unwrap();
        assert_eq!(profile.mask_a, None);
        assert!(profile.per_instance);
    }

    #[test]
    fn partial_options_use_defaults() {
        let mut opts = DatasetOptions::default();
        opts.load_config("(serial_batches: true, max_dataset_size: Some(10))").unwrap();
        assert!(opts.serial_batches);
        assert_eq!(opts.max_dataset_size, Some(10));
        assert_eq!(opts.crop_size, 256);
    }
}
