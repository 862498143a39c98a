//! Caption policy
//!
//! Picks which caption variant a sample is trained with: unconditioned,
//! placeholder, augmented tags, raw tags or the localized free text. The
//! random draws are expressed as ordered rule tables so the exact draw
//! sequence can be tested without an index.

use log::warn;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;

use super::error::{DataError, Result};
use super::index::{attr_string, IndexAdapter};

pub const PLACEHOLDER_CAPTION: &str = "Generate a random image";

/// Separator between alternative captions in the free-text columns
pub const CAPTION_SEPARATOR: &str = "|||";

/// Metadata field whose presence marks a sample as tag-captioned
pub const QUALITY_TAG_MARKER: &str = "danbooru_quality_tags";

pub const META_INFO_KEY: &str = "meta_info";
pub const TAGS_KEY: &str = "tags";

/// Probability of trying tag augmentation on tag-captioned samples
pub const AUGMENT_PROBABILITY: f64 = 0.85;

/// What the policy decided to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionChoice {
    Empty,
    Placeholder,
    /// Tag caption synthesised by the [`TagCaptioner`]
    Augmented,
    /// Localized free text, with or without separator stripping
    FreeText { strip: bool },
}

/// Each rule consumes one uniform draw and fires when it falls below the threshold.
pub type CaptionRule = (f64, CaptionChoice);

/// Rules evaluated before metadata is fetched
pub const PRE_META_RULES: &[CaptionRule] = &[
    (0.30, CaptionChoice::Empty),
    (0.001, CaptionChoice::Placeholder),
];

/// Rules evaluated when the metadata has at most one field
pub const SPARSE_META_RULES: &[CaptionRule] = &[
    (0.001, CaptionChoice::Empty),
    (0.001, CaptionChoice::Placeholder),
];

/// Walk `rules` top to bottom, one fresh draw per rule, stopping at the first hit.
pub fn first_hit<R: Rng + ?Sized>(rules: &[CaptionRule], rng: &mut R) -> Option<CaptionChoice> {
    for &(threshold, choice) in rules {
        if rng.gen::<f64>() < threshold {
            return Some(choice);
        }
    }
    None
}

/// Decide the caption variant from the metadata shape alone.
///
/// `meta` is only consulted when the pre-metadata rules do not fire, so the
/// draw sequence is: two pre-metadata draws, then either one augmentation draw
/// (rich metadata with the quality marker), none (rich metadata without it) or
/// two sparse-metadata draws.
pub fn decide<R: Rng + ?Sized>(
    rng: &mut R,
    meta: impl FnOnce() -> Result<Value>,
) -> Result<CaptionChoice> {
    if let Some(choice) = first_hit(PRE_META_RULES, rng) {
        return Ok(choice);
    }

    let meta = meta()?;
    if meta_field_count(&meta) > 1 {
        if has_quality_marker(&meta) && rng.gen::<f64>() < AUGMENT_PROBABILITY {
            return Ok(CaptionChoice::Augmented);
        }
        return Ok(CaptionChoice::FreeText { strip: true });
    }

    Ok(first_hit(SPARSE_META_RULES, rng).unwrap_or(CaptionChoice::FreeText { strip: false }))
}

fn meta_field_count(meta: &Value) -> usize {
    match meta {
        Value::Object(map) => map.len(),
        Value::Array(items) => items.len(),
        Value::String(s) => s.chars().count(),
        Value::Null => 0,
        _ => 1,
    }
}

fn has_quality_marker(meta: &Value) -> bool {
    match meta {
        Value::Object(map) => map.contains_key(QUALITY_TAG_MARKER),
        Value::Array(items) => items.iter().any(|v| v.as_str() == Some(QUALITY_TAG_MARKER)),
        Value::String(s) => s.contains(QUALITY_TAG_MARKER),
        _ => false,
    }
}

pub fn strip_separators(caption: &str) -> String {
    caption.replace(CAPTION_SEPARATOR, "")
}

/// Tag counters shared by every sample of a dataset instance.
///
/// Not synchronised: the dataset mutates it through `&mut self`, so there is
/// one writer at a time. Parallel loaders should keep one copy per worker and
/// [`merge`](CaptionStats::merge) them after the epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptionStats {
    pub epoch_artist: HashMap<String, usize>,
    pub epoch_character: HashMap<String, usize>,
}

impl CaptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_artist(&mut self, artist: &str) {
        *self.epoch_artist.entry(artist.to_string()).or_insert(0) += 1;
    }

    pub fn record_character(&mut self, character: &str) {
        *self.epoch_character.entry(character.to_string()).or_insert(0) += 1;
    }

    pub fn artist_count(&self, artist: &str) -> usize {
        self.epoch_artist.get(artist).copied().unwrap_or(0)
    }

    pub fn character_count(&self, character: &str) -> usize {
        self.epoch_character.get(character).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &CaptionStats) {
        for (artist, count) in &other.epoch_artist {
            *self.epoch_artist.entry(artist.clone()).or_insert(0) += count;
        }
        for (character, count) in &other.epoch_character {
            *self.epoch_character.entry(character.clone()).or_insert(0) += count;
        }
    }

    pub fn reset_epoch(&mut self) {
        self.epoch_artist.clear();
        self.epoch_character.clear();
    }
}

/// Synthesises a tag caption from sample metadata. May fail.
pub trait TagCaptioner: Send {
    fn synthesize(&self, meta: &Value, stats: &mut CaptionStats) -> Result<String>;
}

/// Chooses and fetches the caption for a sample
#[derive(Debug, Clone)]
pub struct CaptionPolicy {
    caption_key: &'static str,
}

impl CaptionPolicy {
    pub fn new(caption_key: &'static str) -> Self {
        Self { caption_key }
    }

    pub fn caption_key(&self) -> &'static str {
        self.caption_key
    }

    /// Caption for `position`.
    ///
    /// Every internal failure falls back to the localized free text with
    /// separators stripped. Only a failure of that fallback fetch is returned.
    pub fn get_caption<R: Rng + ?Sized>(
        &self,
        index: &dyn IndexAdapter,
        position: usize,
        captioner: &dyn TagCaptioner,
        stats: &mut CaptionStats,
        rng: &mut R,
    ) -> Result<String> {
        match self.try_caption(index, position, captioner, stats, rng) {
            Ok(caption) => Ok(caption),
            Err(err) => {
                warn!("    dataset | get_caption | falling back to {}: {}", self.caption_key, err);
                Ok(strip_separators(&attr_string(index, position, self.caption_key)?))
            }
        }
    }

    fn try_caption<R: Rng + ?Sized>(
        &self,
        index: &dyn IndexAdapter,
        position: usize,
        captioner: &dyn TagCaptioner,
        stats: &mut CaptionStats,
        rng: &mut R,
    ) -> Result<String> {
        let mut meta = None;
        let choice = decide(rng, || {
            let value = index.get_attribute(position, META_INFO_KEY)?;
            meta = Some(value.clone());
            Ok(value)
        })?;

        match choice {
            CaptionChoice::Empty => Ok(String::new()),
            CaptionChoice::Placeholder => Ok(PLACEHOLDER_CAPTION.to_string()),
            CaptionChoice::Augmented => {
                let meta = meta.unwrap_or(Value::Null);
                match captioner.synthesize(&meta, stats) {
                    Ok(caption) => Ok(caption),
                    Err(err) => {
                        warn!("    dataset | Error retrieving tags for {}: {}", position, err);
                        attr_string(index, position, TAGS_KEY)
                    }
                }
            }
            CaptionChoice::FreeText { strip } => {
                let text = attr_string(index, position, self.caption_key)?;
                Ok(if strip { strip_separators(&text) } else { text })
            }
        }
    }
}

/// Error for a metadata value the captioner cannot use
pub(crate) fn augment_error(reason: impl Into<String>) -> DataError {
    DataError::CaptionAugment(reason.into())
}
