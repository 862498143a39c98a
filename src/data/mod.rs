//! Bucketed data pipeline for IP-Adapter / ControlNet training
//!
//! - Multi-resolution buckets with random crops and SDXL size conditioning
//! - Stochastic caption selection (empty, placeholder, tags, free text)
//! - Classifier-free-guidance dropout of the image and text conditioning

pub mod batch;
pub mod caption;
pub mod config;
pub mod dataset;
pub mod dropout;
pub mod error;
pub mod geometry;
pub mod index;
pub mod manifest_index;
pub mod preprocess;
pub mod tagger;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch::{BatchIter, TrainingBatch};
pub use caption::{CaptionPolicy, CaptionStats, TagCaptioner, PLACEHOLDER_CAPTION};
pub use config::{DatasetConfig, IndexFiles};
pub use dataset::{IpAdapterDataset, SizeConditioning, TrainingExample};
pub use dropout::{DropDecision, DropoutRates, ImageConditioning};
pub use error::{DataError, Result};
pub use geometry::{GeometryResolver, ResizeMode, SizeCondPolicy};
pub use index::{CropType, IndexAdapter, IndexOpener, IndexSelection};
pub use manifest_index::{ManifestIndex, ManifestOpener};
pub use preprocess::{ClipImageProcessor, ImageProcessor};
pub use tagger::DanbooruTagCaptioner;
