//! Tag-caption synthesis from booru-style metadata

use serde_json::Value;

use super::caption::{augment_error, CaptionStats, TagCaptioner, QUALITY_TAG_MARKER};
use super::error::Result;

/// Builds "character, copyright, artist, general, quality" captions from
/// metadata fields and counts artists and characters per epoch.
#[derive(Debug, Clone)]
pub struct DanbooruTagCaptioner {
    /// Prefix artist tags, e.g. "by "
    pub artist_prefix: String,
    pub separator: String,
}

impl Default for DanbooruTagCaptioner {
    fn default() -> Self {
        Self {
            artist_prefix: "by ".to_string(),
            separator: ", ".to_string(),
        }
    }
}

/// Tags from a comma-separated string or a string array
fn tag_list(meta: &Value, key: &str) -> Vec<String> {
    let tags: Vec<String> = match meta.get(key) {
        Some(Value::String(s)) => s.split(',').map(|t| t.trim().to_string()).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|t| t.trim().to_string())
            .collect(),
        _ => Vec::new(),
    };
    tags.into_iter().filter(|t| !t.is_empty()).collect()
}

impl TagCaptioner for DanbooruTagCaptioner {
    fn synthesize(&self, meta: &Value, stats: &mut CaptionStats) -> Result<String> {
        if !meta.is_object() {
            return Err(augment_error("meta_info is not an object"));
        }

        let characters = tag_list(meta, "character");
        let copyrights = tag_list(meta, "copyright");
        let artists = tag_list(meta, "artist");
        let general = tag_list(meta, "general");
        let quality = tag_list(meta, QUALITY_TAG_MARKER);

        let mut parts = Vec::new();
        parts.extend(characters.iter().cloned());
        parts.extend(copyrights);
        parts.extend(artists.iter().map(|a| format!("{}{}", self.artist_prefix, a)));
        parts.extend(general);
        parts.extend(quality);

        if parts.is_empty() {
            return Err(augment_error("no usable tag fields in meta_info"));
        }

        for artist in &artists {
            stats.record_artist(artist);
        }
        for character in &characters {
            stats.record_character(character);
        }

        Ok(parts.join(&self.separator))
    }
}
