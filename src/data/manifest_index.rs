//! JSON-manifest index with multi-resolution buckets
//!
//! A manifest is a JSON array of records:
//!
//! ```json
//! [{ "image": "imgs/0001.png", "width": 832, "height": 1216,
//!    "text_en": "a cat", "meta_info": { ... } }]
//! ```
//!
//! `image` is resolved relative to the manifest; every other key except
//! `width`/`height` is exposed through `get_attribute`. Missing sizes are read
//! from the image header.

use image::imageops::FilterType;
use image::DynamicImage;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{DataError, Result};
use super::geometry::cover_resize_and_crop;
use super::index::{CropType, IndexAdapter, IndexOpener, IndexSelection};

/// SDXL training buckets as (width, height)
pub const SDXL_BUCKETS: &[(u32, u32)] = &[
    (1024, 1024),
    (1152, 896),
    (896, 1152),
    (1216, 832),
    (832, 1216),
    (1344, 768),
    (768, 1344),
    (1536, 640),
    (640, 1536),
];

#[derive(Debug, Deserialize)]
struct ManifestRecord {
    image: PathBuf,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(flatten)]
    attributes: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct ManifestEntry {
    image_path: PathBuf,
    base_dir: PathBuf,
    bucket: (u32, u32),
    attributes: Map<String, Value>,
}

/// Best bucket for an image: closest aspect ratio first, then closest area.
pub fn find_best_bucket(width: u32, height: u32, buckets: &[(u32, u32)]) -> (u32, u32) {
    let aspect_ratio = width as f64 / height.max(1) as f64;
    let area = width as i64 * height as i64;

    buckets
        .iter()
        .min_by_key(|&&(w, h)| {
            let bucket_ratio = w as f64 / h as f64;
            let ratio_diff = (aspect_ratio - bucket_ratio).abs();
            let area_diff = (area - w as i64 * h as i64).abs();
            ((ratio_diff * 1000.0) as i64, area_diff)
        })
        .copied()
        .unwrap_or((1024, 1024))
}

pub struct ManifestIndex {
    entries: Vec<ManifestEntry>,
    /// Logical position -> entry
    order: Vec<usize>,
    /// `batch_size * world_size` when bucketed
    group_size: Option<usize>,
}

impl ManifestIndex {
    /// Plain index: every entry, manifest order.
    pub fn open(path: &Path, buckets: &[(u32, u32)]) -> Result<Self> {
        let entries = Self::read_entries(path, buckets)?;
        let order = (0..entries.len()).collect();
        Ok(Self { entries, order, group_size: None })
    }

    /// Concatenation of several manifests.
    pub fn open_many(paths: &[PathBuf], buckets: &[(u32, u32)]) -> Result<Self> {
        let mut entries = Vec::new();
        for path in paths {
            entries.extend(Self::read_entries(path, buckets)?);
        }
        let order = (0..entries.len()).collect();
        Ok(Self { entries, order, group_size: None })
    }

    /// Bucketed index: positions come in runs of `batch_size * world_size`
    /// that share one bucket. Remainders that cannot fill a run are dropped.
    pub fn open_bucketed(
        path: &Path,
        buckets: &[(u32, u32)],
        batch_size: usize,
        world_size: usize,
    ) -> Result<Self> {
        let group_size = batch_size * world_size;
        if group_size == 0 {
            return Err(DataError::Config("batch_size * world_size must be positive".into()));
        }
        let entries = Self::read_entries(path, buckets)?;
        let mut index = Self {
            entries,
            order: Vec::new(),
            group_size: Some(group_size),
        };
        index.order = index.grouped_order(None);
        Ok(index)
    }

    fn read_entries(path: &Path, buckets: &[(u32, u32)]) -> Result<Vec<ManifestEntry>> {
        if buckets.is_empty() {
            return Err(DataError::Config("bucket list is empty".into()));
        }
        let text = fs::read_to_string(path)?;
        let records: Vec<ManifestRecord> = serde_json::from_str(&text)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let image_path = base_dir.join(&record.image);
            let (width, height) = match (record.width, record.height) {
                (Some(w), Some(h)) => (w, h),
                _ => image::image_dimensions(&image_path)?,
            };
            entries.push(ManifestEntry {
                image_path,
                base_dir: base_dir.clone(),
                bucket: find_best_bucket(width, height, buckets),
                attributes: record.attributes,
            });
        }

        info!("Loaded manifest {} with {} records", path.display(), entries.len());
        Ok(entries)
    }

    /// Group entries by bucket, cut into full runs, optionally shuffling.
    fn grouped_order(&self, shuffle: Option<(&mut StdRng, bool)>) -> Vec<usize> {
        let group_size = self.group_size.unwrap_or(1);
        let mut by_bucket: BTreeMap<(u32, u32), Vec<usize>> = BTreeMap::new();
        for (i, entry) in self.entries.iter().enumerate() {
            by_bucket.entry(entry.bucket).or_default().push(i);
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut rng = shuffle;
        for (bucket, mut members) in by_bucket {
            if let Some((rng, fast)) = rng.as_mut() {
                if !*fast {
                    members.shuffle(&mut **rng);
                }
            }
            let dropped = members.len() % group_size;
            if dropped > 0 {
                debug!("Bucket {}x{} drops {} trailing items", bucket.0, bucket.1, dropped);
            }
            groups.extend(members.chunks_exact(group_size).map(<[usize]>::to_vec));
        }

        if let Some((rng, _)) = rng {
            groups.shuffle(rng);
        }
        groups.into_iter().flatten().collect()
    }

    fn entry(&self, index: usize) -> Result<&ManifestEntry> {
        self.order
            .get(index)
            .map(|&i| &self.entries[i])
            .ok_or(DataError::OutOfRange { index, len: self.order.len() })
    }

    /// Bucket -> number of positions in the current order
    pub fn bucket_histogram(&self) -> BTreeMap<(u32, u32), usize> {
        let mut histogram = BTreeMap::new();
        for &i in &self.order {
            *histogram.entry(self.entries[i].bucket).or_insert(0) += 1;
        }
        histogram
    }

    pub fn is_bucketed(&self) -> bool {
        self.group_size.is_some()
    }
}

impl IndexAdapter for ManifestIndex {
    fn len(&self) -> usize {
        self.order.len()
    }

    /// `fast` keeps each bucket's internal order and only permutes whole runs.
    /// The new order depends only on `seed`, never on earlier shuffles.
    fn shuffle(&mut self, seed: u64, fast: bool) {
        let mut rng = StdRng::seed_from_u64(seed);
        if self.group_size.is_some() {
            self.order = self.grouped_order(Some((&mut rng, fast)));
        } else {
            self.order = (0..self.entries.len()).collect();
            self.order.shuffle(&mut rng);
        }
    }

    fn get_image(&self, index: usize, key: &str) -> Result<DynamicImage> {
        let entry = self.entry(index)?;
        let path = if key == "image" {
            entry.image_path.clone()
        } else {
            match entry.attributes.get(key) {
                Some(Value::String(relative)) => entry.base_dir.join(relative),
                _ => return Err(DataError::image_fetch(index, key, "no image path under this key")),
            }
        };
        image::open(&path)
            .map_err(|e| DataError::image_fetch(index, key, format!("{}: {}", path.display(), e)))
    }

    fn get_attribute(&self, index: usize, key: &str) -> Result<Value> {
        self.entry(index)?
            .attributes
            .get(key)
            .cloned()
            .ok_or_else(|| DataError::attribute(index, key, "missing"))
    }

    fn get_target_size(&self, index: usize) -> Result<(u32, u32)> {
        Ok(self.entry(index)?.bucket)
    }

    fn resize_and_crop(
        &self,
        image: &DynamicImage,
        target_size: (u32, u32),
        resample: FilterType,
        crop: CropType,
        rng: &mut dyn RngCore,
    ) -> Result<(DynamicImage, (u32, u32))> {
        cover_resize_and_crop(image, target_size, resample, crop, rng)
    }
}

/// Opens [`ManifestIndex`]es for every kind of [`IndexSelection`].
#[derive(Debug, Clone)]
pub struct ManifestOpener {
    pub buckets: Vec<(u32, u32)>,
}

impl Default for ManifestOpener {
    fn default() -> Self {
        Self { buckets: SDXL_BUCKETS.to_vec() }
    }
}

impl IndexOpener for ManifestOpener {
    fn open(&self, selection: &IndexSelection) -> Result<Box<dyn IndexAdapter>> {
        let index = match selection {
            IndexSelection::Bucketed { path, batch_size, world_size } => {
                ManifestIndex::open_bucketed(path, &self.buckets, *batch_size, *world_size)?
            }
            IndexSelection::Single(path) => ManifestIndex::open(path, &self.buckets)?,
            IndexSelection::Multi(paths) => ManifestIndex::open_many(paths, &self.buckets)?,
        };
        Ok(Box::new(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_manifest(dir: &Path, records: Value) -> PathBuf {
        let path = dir.join("index.json");
        fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();
        path
    }

    fn sized_records(sizes: &[(u32, u32)]) -> Value {
        Value::Array(
            sizes
                .iter()
                .enumerate()
                .map(|(i, (w, h))| {
                    json!({ "image": format!("{}.png", i), "width": w, "height": h, "id": i })
                })
                .collect(),
        )
    }

    #[test]
    fn test_find_best_bucket() {
        assert_eq!(find_best_bucket(800, 800, SDXL_BUCKETS), (1024, 1024));
        assert_eq!(find_best_bucket(1600, 900, SDXL_BUCKETS), (1344, 768));
        assert_eq!(find_best_bucket(600, 1400, SDXL_BUCKETS), (640, 1536));
    }

    #[test]
    fn test_bucketed_runs_share_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = [
            (1000, 1000), (900, 1200), (1000, 1000), (900, 1200),
            (1000, 1000), (900, 1200), (1000, 1000), (1600, 900),
        ];
        let path = write_manifest(dir.path(), sized_records(&sizes));
        let mut index = ManifestIndex::open_bucketed(&path, SDXL_BUCKETS, 2, 1).unwrap();

        // 4 square -> 2 runs, 3 portrait -> 1 run, 1 landscape dropped
        assert_eq!(index.len(), 6);
        for seed in 0..5 {
            index.shuffle(seed, seed % 2 == 0);
            for run in 0..index.len() / 2 {
                let a = index.get_target_size(run * 2).unwrap();
                let b = index.get_target_size(run * 2 + 1).unwrap();
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = vec![(1024, 1024); 12];
        let path = write_manifest(dir.path(), sized_records(&sizes));

        let mut a = ManifestIndex::open(&path, SDXL_BUCKETS).unwrap();
        let mut b = ManifestIndex::open(&path, SDXL_BUCKETS).unwrap();
        a.shuffle(42, false);
        b.shuffle(42, false);
        let ids = |index: &ManifestIndex| -> Vec<Value> {
            (0..index.len()).map(|i| index.get_attribute(i, "id").unwrap()).collect()
        };
        assert_eq!(ids(&a), ids(&b));

        // a prior shuffle must not leak into the next one
        a.shuffle(7, false);
        a.shuffle(42, false);
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_attributes_and_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            json!([{ "image": "missing.png", "width": 64, "height": 64, "text_en": "a dog" }]),
        );
        let index = ManifestIndex::open(&path, SDXL_BUCKETS).unwrap();

        assert_eq!(index.get_attribute(0, "text_en").unwrap(), json!("a dog"));
        assert!(matches!(index.get_attribute(0, "text_zh"), Err(DataError::Attribute { .. })));
        assert!(matches!(index.get_attribute(0, "width"), Err(DataError::Attribute { .. })));
        assert!(matches!(index.get_image(0, "image"), Err(DataError::ImageFetch { .. })));
        assert!(matches!(index.get_target_size(5), Err(DataError::OutOfRange { .. })));
    }

    #[test]
    fn test_reads_size_from_image_header() {
        let dir = tempfile::tempdir().unwrap();
        crate::data::test_support::solid(96, 64, 200)
            .save(dir.path().join("a.png"))
            .unwrap();
        let path = write_manifest(dir.path(), json!([{ "image": "a.png" }]));

        let index = ManifestIndex::open(&path, &[(96, 64), (64, 96)]).unwrap();
        assert_eq!(index.get_target_size(0).unwrap(), (96, 64));
        assert_eq!(index.get_image(0, "image").unwrap().width(), 96);
    }
}
