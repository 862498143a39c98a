//! Walk the bucketed IP-Adapter dataset described by a training config
//!
//! Usage: cargo run --bin preview_dataset -- /path/to/config.yaml --count 16 --save-dir out/

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use log::info;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use eridiffusion_ipa::data::{BatchIter, IpAdapterDataset, ManifestOpener};
use eridiffusion_ipa::trainers::image_utils::save_image;

#[derive(Parser, Debug)]
#[command(author, version, about = "Preview the bucketed IP-Adapter dataset")]
struct Args {
    /// Path to the training configuration YAML file
    config: PathBuf,

    /// Number of examples to assemble
    #[arg(long, default_value_t = 16)]
    count: usize,

    /// Shuffle seed, defaults to the config's shuffle_seed
    #[arg(long)]
    seed: Option<u64>,

    /// Shuffle only whole bucket runs
    #[arg(long)]
    fast_shuffle: bool,

    /// Write the cropped pixels of every example here
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Also collate batches of the configured batch size
    #[arg(long)]
    batches: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    eridiffusion_ipa::logging::init_logger();

    let config = eridiffusion_ipa::load_config(&args.config)?;
    info!("Job: {}", config.job);

    let device = Device::Cpu;
    let opener = match &config.dataset.buckets {
        Some(buckets) => ManifestOpener { buckets: buckets.clone() },
        None => ManifestOpener::default(),
    };
    let mut dataset = IpAdapterDataset::from_config(config.dataset.clone(), &opener, device.clone())
        .context("Failed to build dataset")?;
    dataset.shuffle(args.seed.unwrap_or(config.train.shuffle_seed), args.fast_shuffle);

    if let Some(dir) = &args.save_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let count = args.count.min(dataset.len());

    #[cfg(feature = "progress-bar")]
    let progress = indicatif::ProgressBar::new(count as u64);

    let mut buckets: BTreeMap<(u32, u32), usize> = BTreeMap::new();
    let (mut empty_prompts, mut dropped_images, mut dropped_captions) = (0usize, 0usize, 0usize);
    for i in 0..count {
        let example = dataset.get_item(i)?;
        *buckets.entry(example.target_size).or_insert(0) += 1;
        if example.prompt.is_empty() {
            empty_prompts += 1;
        }
        if example.drop_image_embed {
            dropped_images += 1;
        }
        if example.drop_caption {
            dropped_captions += 1;
        }

        if let Some(dir) = &args.save_dir {
            save_image(&example.pixels, dir.join(format!("{:05}.png", i)))?;
            fs::write(dir.join(format!("{:05}.txt", i)), &example.prompt)?;
        }

        #[cfg(feature = "progress-bar")]
        progress.inc(1);
    }

    #[cfg(feature = "progress-bar")]
    progress.finish_and_clear();

    info!("Assembled {} of {} examples", count, dataset.len());
    for ((h, w), n) in &buckets {
        info!("  bucket {}x{} (h x w): {}", h, w, n);
    }
    info!(
        "  empty prompts: {}, dropped captions: {}, dropped image embeds: {}",
        empty_prompts, dropped_captions, dropped_images
    );

    let stats = dataset.stats();
    info!(
        "  tag stats: {} artists, {} characters",
        stats.epoch_artist.len(),
        stats.epoch_character.len()
    );

    if args.batches {
        let batch_size = config.dataset.batch_size;
        let num_batches = count / batch_size.max(1);
        let batches = BatchIter::new(&mut dataset, batch_size, device).take(num_batches);
        for (i, batch) in batches.enumerate() {
            let batch = batch?;
            info!(
                "  batch {}: pixels {:?}, time_ids {:?}",
                i,
                batch.pixels.dims(),
                batch.time_ids.dims()
            );
        }
    }

    Ok(())
}
