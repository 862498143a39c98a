//! Dataset configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{DataError, Result};

/// One index file or a list of them, as accepted by `index_file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexFiles {
    Single(PathBuf),
    Many(Vec<PathBuf>),
}

impl IndexFiles {
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            IndexFiles::Single(path) => vec![path.clone()],
            IndexFiles::Many(paths) => paths.clone(),
        }
    }
}

impl From<PathBuf> for IndexFiles {
    fn from(path: PathBuf) -> Self {
        IndexFiles::Single(path)
    }
}

impl From<Vec<PathBuf>> for IndexFiles {
    fn from(paths: Vec<PathBuf>) -> Self {
        IndexFiles::Many(paths)
    }
}

/// Options recognised by the IP-Adapter dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Square resolution of the fixed-resolution path. Not supported, kept so
    /// existing configs still parse.
    #[serde(default = "default_resolution")]
    pub resolution: u32,

    #[serde(default)]
    pub random_flip: bool,

    /// Take captions from `text_zh` when true, `text_en` otherwise
    #[serde(default = "default_true", alias = "enable_CN")]
    pub enable_cn: bool,

    pub index_file: IndexFiles,

    /// Multi-resolution bucketing; the only supported resize mode
    #[serde(default)]
    pub multireso: bool,

    #[serde(default = "default_one")]
    pub batch_size: usize,

    #[serde(default = "default_one")]
    pub world_size: usize,

    #[serde(default = "default_drop_rate")]
    pub i_drop_rate: f64,

    #[serde(default = "default_drop_rate")]
    pub t_drop_rate: f64,

    #[serde(default = "default_drop_rate")]
    pub ti_drop_rate: f64,

    /// Clamp original-size conditioning up to 1024 per side
    #[serde(default)]
    pub random_shrink_size_cond: bool,

    /// Replace original-size conditioning with its area-preserving square
    #[serde(default)]
    pub merge_src_cond: bool,

    /// Seed for per-sample randomness; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,

    /// Side of the square CLIP input
    #[serde(default = "default_clip_size")]
    pub clip_image_size: u32,

    /// Bucket resolutions (width, height) for manifest indices
    #[serde(default)]
    pub buckets: Option<Vec<(u32, u32)>>,
}

fn default_resolution() -> u32 {
    512
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_drop_rate() -> f64 {
    0.05
}

fn default_clip_size() -> u32 {
    224
}

impl DatasetConfig {
    /// Config with the default options for the given index file(s).
    pub fn new(index_file: impl Into<IndexFiles>) -> Self {
        Self {
            resolution: default_resolution(),
            random_flip: false,
            enable_cn: true,
            index_file: index_file.into(),
            multireso: false,
            batch_size: 1,
            world_size: 1,
            i_drop_rate: default_drop_rate(),
            t_drop_rate: default_drop_rate(),
            ti_drop_rate: default_drop_rate(),
            random_shrink_size_cond: false,
            merge_src_cond: false,
            seed: None,
            clip_image_size: default_clip_size(),
            buckets: None,
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: DatasetConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Attribute holding the localized free-text caption
    pub fn caption_key(&self) -> &'static str {
        if self.enable_cn {
            "text_zh"
        } else {
            "text_en"
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution == 0 {
            return Err(DataError::Config("resolution must be a positive integer".into()));
        }
        if self.batch_size == 0 || self.world_size == 0 {
            return Err(DataError::Config(format!(
                "batch_size and world_size must be positive, got {} and {}",
                self.batch_size, self.world_size
            )));
        }
        if self.index_file.paths().is_empty() {
            return Err(DataError::Config("index_file must name at least one file".into()));
        }
        if self.clip_image_size == 0 {
            return Err(DataError::Config("clip_image_size must be positive".into()));
        }
        for (name, rate) in [
            ("i_drop_rate", self.i_drop_rate),
            ("t_drop_rate", self.t_drop_rate),
            ("ti_drop_rate", self.ti_drop_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(DataError::Config(format!("{} must lie in [0, 1], got {}", name, rate)));
            }
        }
        let total = self.i_drop_rate + self.t_drop_rate + self.ti_drop_rate;
        if total > 1.0 + 1e-9 {
            return Err(DataError::Config(format!(
                "drop rates must sum to at most 1, got {}",
                total
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_defaults_and_alias() {
        let yaml = "index_file: data/index.json\nmultireso: true\nenable_CN: false\n";
        let config: DatasetConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.index_file, IndexFiles::Single(PathBuf::from("data/index.json")));
        assert!(config.multireso);
        assert!(!config.enable_cn);
        assert_eq!(config.caption_key(), "text_en");
        assert_eq!(config.resolution, 512);
        assert_eq!(config.i_drop_rate, 0.05);
        assert_eq!(config.clip_image_size, 224);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_index_file_list() {
        let yaml = "index_file:\n  - a.json\n  - b.json\n";
        let config: DatasetConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.index_file.paths().len(), 2);
    }

    #[test]
    fn test_drop_rates_over_one_rejected() {
        let mut config = DatasetConfig::new(PathBuf::from("index.json"));
        config.i_drop_rate = 0.5;
        config.t_drop_rate = 0.4;
        config.ti_drop_rate = 0.2;
        assert!(matches!(config.validate(), Err(DataError::Config(_))));

        config.ti_drop_rate = 0.1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = DatasetConfig::new(PathBuf::from("index.json"));
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
