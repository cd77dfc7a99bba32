//! # Captioning driver
//!
//! Trains the S2VT captioner on video/caption records and writes greedy
//! captions for the test videos as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use seqcraft_core::nn::perplexity;
use seqcraft_core::{
    CaptionBatch, CaptionConfig, CaptionEntry, CaptionRecord, FileQueue, Prefetcher, RecordReader,
    S2vt, SeqOptimizer, VideoRecord, Vocabulary, write_captions_json,
};
use tracing::{debug, info, warn};

use crate::read_file_list;

/// Training perplexities (one per logged epoch) and the written captions.
#[derive(Debug, Clone, Default)]
pub struct CaptionReport {
    pub train_perplexity: Vec<(usize, f64)>,
    pub captions: Vec<CaptionEntry>,
}

fn list_dir(list: &Path) -> &Path {
    list.parent().unwrap_or_else(|| Path::new("."))
}

fn caption_batches(
    mut queue: FileQueue,
    config: &CaptionConfig,
    device: &Device,
) -> Prefetcher<CaptionBatch> {
    let (frames, dim) = (config.frames, config.video_dim);
    let (batch_size, max_len) = (config.batch_size, config.max_caption_length);
    let device = device.clone();
    Prefetcher::spawn(config.prefetch, move || {
        let records = queue.take_records(batch_size, |bytes| {
            CaptionRecord::decode(bytes, frames, dim)
        })?;
        CaptionBatch::from_records(&records, frames, dim, max_len, &device)
    })
}

/// Read the first `count` video records from `files`, in list order, without wrapping.
pub fn read_test_videos(
    files: &[PathBuf],
    count: usize,
    config: &CaptionConfig,
) -> Result<Vec<VideoRecord>> {
    let mut videos = Vec::with_capacity(count);
    for path in files {
        if videos.len() == count {
            break;
        }
        let reader = RecordReader::open(path)
            .with_context(|| format!("failed to open test records {}", path.display()))?;
        for payload in reader.take(count - videos.len()) {
            videos.push(VideoRecord::decode(&payload?, config.frames, config.video_dim)?);
        }
    }
    if videos.len() < count {
        bail!(
            "test lists hold {} video records but {count} test videos are requested",
            videos.len()
        );
    }
    Ok(videos)
}

/// Greedy captions for `videos`, decoded `batch_size` at a time.
pub fn caption_videos(
    model: &S2vt,
    vocab: &Vocabulary,
    videos: &[VideoRecord],
    config: &CaptionConfig,
    device: &Device,
) -> Result<Vec<String>> {
    let (frames, dim) = (config.frames, config.video_dim);
    let mut captions = Vec::with_capacity(videos.len());
    for chunk in videos.chunks(config.batch_size) {
        let flat: Vec<f32> = chunk.iter().flat_map(|v| v.video.iter().copied()).collect();
        let video = Tensor::from_vec(flat, (chunk.len(), frames, dim), device)?;
        for ids in model.greedy_decode(&video)? {
            captions.push(vocab.decode_caption(&ids).join(" "));
        }
        debug!(done = captions.len(), count = videos.len(), "captioned videos");
    }
    Ok(captions)
}

fn read_ids(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read video ids {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Train, caption the test videos and write the JSON output.
pub fn run(config: &CaptionConfig) -> Result<CaptionReport> {
    config.validate()?;
    let device = Device::Cpu;
    let vocab = Vocabulary::from_json_file(&config.vocab_path)
        .with_context(|| format!("failed to load vocabulary {}", config.vocab_path.display()))?;
    let train_files = read_file_list(&config.train_list, list_dir(&config.train_list))?;
    info!(
        vocab = vocab.len(),
        train_files = train_files.len(),
        "loaded caption data"
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = S2vt::new(config, vocab.len(), vb.pp("model"))?;
    let vars = varmap.all_vars();
    let mut optimizer = SeqOptimizer::new(config.optimizer, vars.clone(), config.learning_rate)?;
    let mut batches = caption_batches(FileQueue::shuffled(train_files, config.seed)?, config, &device);

    let mut report = CaptionReport::default();
    for epoch in 1..=config.max_epoch {
        let batch = batches.next()?;
        let loss = model.loss(&batch, true)?;
        let cost = f64::from(loss.to_scalar::<f32>()?);
        let norm = optimizer.minimize(&loss, &vars, config.max_grad_norm)?;
        if epoch % config.info_epoch == 0 {
            let ppl = perplexity(cost);
            info!(epoch, perplexity = ppl, norm, "train");
            report.train_perplexity.push((epoch, ppl));
        }
        let lr = optimizer.learning_rate();
        optimizer.set_learning_rate(lr * config.lr_decay);
    }
    drop(batches);

    if let Some(path) = &config.save_path {
        varmap
            .save(path)
            .with_context(|| format!("failed to save variables to {}", path.display()))?;
        info!(path = %path.display(), "saved variables");
    }

    let ids = read_ids(&config.test_id_path)?;
    let count = config.testing_video_num;
    if ids.len() < count {
        bail!(
            "{} lists {} ids but {count} test videos are requested",
            config.test_id_path.display(),
            ids.len()
        );
    }
    if ids.len() > count {
        warn!(ids = ids.len(), count, "extra video ids are ignored");
    }
    let test_files = read_file_list(&config.test_list, list_dir(&config.test_list))?;
    let videos = read_test_videos(&test_files, count, config)?;
    let captions = caption_videos(&model, &vocab, &videos, config, &device)?;

    report.captions = captions
        .into_iter()
        .zip(ids)
        .map(|(caption, id)| CaptionEntry { caption, id })
        .collect();
    write_captions_json(&config.output, &report.captions)?;
    Ok(report)
}
