//! Error type for the data pipeline

/// Errors raised while loading the index or assembling a training example.
///
/// `ImageFetch` and `CaptionAugment` are recoverable: the dataset converts
/// them into a placeholder image or a fallback caption and never returns them
/// from `get_item`.
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),
    #[error("failed to fetch image {key} for index {index}: {reason}")]
    ImageFetch {
        index: usize,
        key: String,
        reason: String,
    },
    #[error("failed to fetch attribute {key} for index {index}: {reason}")]
    Attribute {
        index: usize,
        key: String,
        reason: String,
    },
    #[error("caption augmentation failed: {0}")]
    CaptionAugment(String),
    #[error("image preprocessing failed: {0}")]
    Preprocess(String),
    #[error("index {index} out of range for dataset of length {len}")]
    OutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl DataError {
    pub fn attribute(index: usize, key: &str, reason: impl Into<String>) -> Self {
        DataError::Attribute {
            index,
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn image_fetch(index: usize, key: &str, reason: impl Into<String>) -> Self {
        DataError::ImageFetch {
            index,
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the dataset swallows this error and substitutes a fallback.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DataError::ImageFetch { .. } | DataError::CaptionAugment(_))
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
