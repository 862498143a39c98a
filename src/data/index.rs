//! Index adapter seam
//!
//! The dataset never reads archives itself. It talks to an [`IndexAdapter`],
//! which owns item ordering, bucket assignment and the resize/crop used for
//! bucketed training.

use image::imageops::FilterType;
use image::DynamicImage;
use log::info;
use rand::RngCore;
use serde_json::Value;
use std::path::PathBuf;

use super::config::DatasetConfig;
use super::error::{DataError, Result};

/// Placement of the crop window inside the resized image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropType {
    Random,
    Center,
}

/// Uniform read/shuffle access over one or more indexed archives.
///
/// Implementations must not be shuffled while `get_item` calls on the same
/// index are in flight; the dataset only shuffles through `&mut self`.
pub trait IndexAdapter: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reorder items for a new epoch. Deterministic for a given seed.
    fn shuffle(&mut self, seed: u64, fast: bool);

    fn get_image(&self, index: usize, key: &str) -> Result<DynamicImage>;

    fn get_attribute(&self, index: usize, key: &str) -> Result<Value>;

    /// Bucket (width, height) assigned to `index`
    fn get_target_size(&self, index: usize) -> Result<(u32, u32)>;

    /// Resize `image` to cover `target_size`, crop to it, and return the crop
    /// together with its top-left (x, y) offset in the resized image.
    fn resize_and_crop(
        &self,
        image: &DynamicImage,
        target_size: (u32, u32),
        resample: FilterType,
        crop: CropType,
        rng: &mut dyn RngCore,
    ) -> Result<(DynamicImage, (u32, u32))>;
}

/// Which kind of index a configuration asks for
#[derive(Debug, Clone, PartialEq)]
pub enum IndexSelection {
    /// Multi-resolution bucketed index over exactly one file
    Bucketed {
        path: PathBuf,
        batch_size: usize,
        world_size: usize,
    },
    /// Plain index over one file
    Single(PathBuf),
    /// Concatenation of several plain indices
    Multi(Vec<PathBuf>),
}

impl IndexSelection {
    pub fn resolve(config: &DatasetConfig) -> Result<Self> {
        let mut files = config.index_file.paths();
        if files.is_empty() {
            return Err(DataError::Config("no index file given".into()));
        }

        if config.multireso {
            if files.len() > 1 {
                return Err(DataError::Config(format!(
                    "When enabling multireso, index_file should be a single file, but got {:?}",
                    files
                )));
            }
            return Ok(IndexSelection::Bucketed {
                path: files.remove(0),
                batch_size: config.batch_size,
                world_size: config.world_size,
            });
        }

        if files.len() == 1 {
            Ok(IndexSelection::Single(files.remove(0)))
        } else {
            Ok(IndexSelection::Multi(files))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IndexSelection::Bucketed { .. } => "MultiResolutionBucketIndex",
            IndexSelection::Single(_) => "SingleIndex",
            IndexSelection::Multi(_) => "MultiIndex",
        }
    }

    pub fn is_bucketed(&self) -> bool {
        matches!(self, IndexSelection::Bucketed { .. })
    }
}

/// Opens the index described by an [`IndexSelection`].
pub trait IndexOpener {
    fn open(&self, selection: &IndexSelection) -> Result<Box<dyn IndexAdapter>>;
}

/// Resolve the configured index files and open them.
pub fn load_index(
    config: &DatasetConfig,
    opener: &dyn IndexOpener,
) -> Result<Box<dyn IndexAdapter>> {
    let selection = IndexSelection::resolve(config)?;
    let index = opener.open(&selection)?;
    info!(
        "    dataset | Using {}: {}",
        selection.kind(),
        format_count(index.len())
    );
    Ok(index)
}

/// Thousands-separated count for log lines
pub(crate) fn format_count(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Read a string attribute, failing on any other JSON type.
pub fn attr_string(index: &dyn IndexAdapter, position: usize, key: &str) -> Result<String> {
    match index.get_attribute(position, key)? {
        Value::String(s) => Ok(s),
        other => Err(DataError::attribute(
            position,
            key,
            format!("expected a string, got {}", other),
        )),
    }
}
