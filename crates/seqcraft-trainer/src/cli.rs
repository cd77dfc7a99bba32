//! Command-line arguments for the training binaries.
//!
//! Settings are layered: built-in defaults, then an optional JSON file given
//! with `--config`, then individual flags.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use seqcraft_core::{CaptionConfig, CellKind, LmConfig, OptimizerKind, WordvecSource};

fn parse_probability(s: &str) -> std::result::Result<f64, String> {
    let value: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is not in [0, 1]"))
    }
}

fn cell_kind(index: u8) -> Result<CellKind> {
    CellKind::from_index(index).ok_or_else(|| anyhow!("unknown rnn type {index}"))
}

fn optimizer_kind(index: u8) -> Result<OptimizerKind> {
    OptimizerKind::from_index(index).ok_or_else(|| anyhow!("unknown optimizer {index}"))
}

/// Train the sentence language model and answer completion questions.
#[derive(Debug, Parser)]
#[command(name = "train-lm")]
#[command(about = "Train a recurrent language model and answer multiple-choice questions")]
#[command(version)]
pub struct LmArgs {
    /// JSON file with hyperparameter overrides
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Word vectors: 0 debug, 1-4 glove.6B 50d/100d/200d/300d, 5 glove.42B, 6 glove.840B
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(0..=6))]
    pub wordvec_src: Option<u8>,

    /// Directory with wordvec.npy, vocab.txt and file_list.txt
    #[arg(short = 'd', long)]
    pub data_dir: Option<PathBuf>,

    /// Cell: 0 basic RNN, 1 basic LSTM, 2 full LSTM, 3 GRU
    #[arg(short = 't', long, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub rnn_type: Option<u8>,

    #[arg(long)]
    pub hidden_size: Option<usize>,

    /// Number of stacked recurrent layers
    #[arg(short = 'l', long)]
    pub layers: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub lr_decay: Option<f64>,

    #[arg(long)]
    pub init_scale: Option<f64>,

    #[arg(long)]
    pub max_grad_norm: Option<f64>,

    #[arg(short = 'e', long)]
    pub max_epoch: Option<usize>,

    /// Dropout keep probability
    #[arg(short = 'k', long, value_parser = parse_probability)]
    pub keep_prob: Option<f64>,

    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Leading files of file_list.txt used for training
    #[arg(long)]
    pub train_num: Option<usize>,

    /// Training steps per epoch
    #[arg(long)]
    pub epoch_size: Option<usize>,

    /// Optimizer: 0 SGD, 1 Adadelta, 2 Adagrad, 3 momentum, 4 Adam, 5 RMSProp
    #[arg(short = 'o', long, value_parser = clap::value_parser!(u8).range(0..=5))]
    pub optimizer: Option<u8>,

    /// Number of questions in the test records
    #[arg(long)]
    pub questions: Option<usize>,

    #[arg(long)]
    pub test_file: Option<PathBuf>,

    /// Answers CSV
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Save trained variables (safetensors)
    #[arg(long)]
    pub save_path: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl LmArgs {
    pub fn into_config(self) -> Result<LmConfig> {
        let mut config = match &self.config {
            Some(path) => LmConfig::load_json(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => LmConfig::default(),
        };
        if let Some(src) = self.wordvec_src {
            config.wordvec_src = WordvecSource::from_index(src)
                .ok_or_else(|| anyhow!("unknown word vector source {src}"))?;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = Some(dir);
        }
        if let Some(t) = self.rnn_type {
            config.cell = cell_kind(t)?;
        }
        if let Some(o) = self.optimizer {
            config.optimizer = optimizer_kind(o)?;
        }
        config.hidden_size = self.hidden_size.unwrap_or(config.hidden_size);
        config.num_layers = self.layers.unwrap_or(config.num_layers);
        config.learning_rate = self.learning_rate.unwrap_or(config.learning_rate);
        config.lr_decay = self.lr_decay.unwrap_or(config.lr_decay);
        config.init_scale = self.init_scale.unwrap_or(config.init_scale);
        config.max_grad_norm = self.max_grad_norm.unwrap_or(config.max_grad_norm);
        config.max_epoch = self.max_epoch.unwrap_or(config.max_epoch);
        config.keep_prob = self.keep_prob.unwrap_or(config.keep_prob);
        config.batch_size = self.batch_size.unwrap_or(config.batch_size);
        config.train_num = self.train_num.unwrap_or(config.train_num);
        config.epoch_size = self.epoch_size.unwrap_or(config.epoch_size);
        config.questions = self.questions.unwrap_or(config.questions);
        config.seed = self.seed.unwrap_or(config.seed);
        if let Some(test_file) = self.test_file {
            config.test_file = test_file;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if self.save_path.is_some() {
            config.save_path = self.save_path;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Train the S2VT captioner and caption the test videos.
#[derive(Debug, Parser)]
#[command(name = "train-s2vt")]
#[command(about = "Train an S2VT video captioner and caption test videos")]
#[command(version)]
pub struct CaptionArgs {
    /// JSON file with hyperparameter overrides
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Cell: 0 basic RNN, 1 basic LSTM, 2 full LSTM, 3 GRU
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub cell_type: Option<u8>,

    #[arg(long)]
    pub video_dim: Option<usize>,

    #[arg(long)]
    pub frames: Option<usize>,

    #[arg(long)]
    pub max_caption_length: Option<usize>,

    #[arg(long)]
    pub embed_size: Option<usize>,

    #[arg(long)]
    pub hidden_size: Option<usize>,

    /// Layers in each recurrent stack
    #[arg(long)]
    pub layer_number: Option<usize>,

    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    pub learning_rate_decay_factor: Option<f64>,

    #[arg(long)]
    pub init_scale: Option<f64>,

    #[arg(long)]
    pub max_grad_norm: Option<f64>,

    /// Dropout keep probability
    #[arg(short = 'k', long, value_parser = parse_probability)]
    pub keep_prob: Option<f64>,

    #[arg(short = 'e', long)]
    pub max_epoch: Option<usize>,

    /// Log training perplexity every N epochs
    #[arg(long)]
    pub info_epoch: Option<usize>,

    #[arg(long)]
    pub testing_video_num: Option<usize>,

    /// Optimizer: 0 SGD, 1 Adadelta, 2 Adagrad, 3 momentum, 4 Adam, 5 RMSProp
    #[arg(short = 'o', long, value_parser = clap::value_parser!(u8).range(0..=5))]
    pub optimizer: Option<u8>,

    #[arg(long)]
    pub train_list: Option<PathBuf>,

    #[arg(long)]
    pub test_list: Option<PathBuf>,

    /// Caption vocabulary JSON (word to id)
    #[arg(long)]
    pub vocab: Option<PathBuf>,

    /// One video id per line, in test record order
    #[arg(long)]
    pub test_ids: Option<PathBuf>,

    /// Captions JSON
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub save_path: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl CaptionArgs {
    pub fn into_config(self) -> Result<CaptionConfig> {
        let mut config = match &self.config {
            Some(path) => CaptionConfig::load_json(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => CaptionConfig::default(),
        };
        if let Some(t) = self.cell_type {
            config.cell = cell_kind(t)?;
        }
        if let Some(o) = self.optimizer {
            config.optimizer = optimizer_kind(o)?;
        }
        config.video_dim = self.video_dim.unwrap_or(config.video_dim);
        config.frames = self.frames.unwrap_or(config.frames);
        config.max_caption_length = self.max_caption_length.unwrap_or(config.max_caption_length);
        config.embed_size = self.embed_size.unwrap_or(config.embed_size);
        config.hidden_size = self.hidden_size.unwrap_or(config.hidden_size);
        config.num_layers = self.layer_number.unwrap_or(config.num_layers);
        config.batch_size = self.batch_size.unwrap_or(config.batch_size);
        config.learning_rate = self.learning_rate.unwrap_or(config.learning_rate);
        config.lr_decay = self.learning_rate_decay_factor.unwrap_or(config.lr_decay);
        config.init_scale = self.init_scale.unwrap_or(config.init_scale);
        config.max_grad_norm = self.max_grad_norm.unwrap_or(config.max_grad_norm);
        config.keep_prob = self.keep_prob.unwrap_or(config.keep_prob);
        config.max_epoch = self.max_epoch.unwrap_or(config.max_epoch);
        config.info_epoch = self.info_epoch.unwrap_or(config.info_epoch);
        config.testing_video_num = self.testing_video_num.unwrap_or(config.testing_video_num);
        config.seed = self.seed.unwrap_or(config.seed);
        if let Some(p) = self.train_list {
            config.train_list = p;
        }
        if let Some(p) = self.test_list {
            config.test_list = p;
        }
        if let Some(p) = self.vocab {
            config.vocab_path = p;
        }
        if let Some(p) = self.test_ids {
            config.test_id_path = p;
        }
        if let Some(p) = self.output {
            config.output = p;
        }
        if self.save_path.is_some() {
            config.save_path = self.save_path;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lm_flags_override_defaults() {
        let args = LmArgs::try_parse_from([
            "train-lm", "-w", "0", "-t", "3", "-k", "0.8", "-o", "5", "--hidden-size", "64",
        ])
        .unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.wordvec_src, WordvecSource::Debug);
        assert_eq!(config.cell, CellKind::Gru);
        assert_eq!(config.optimizer, OptimizerKind::RmsProp);
        assert_eq!(config.hidden_size, 64);
        assert_eq!(config.keep_prob, 0.8);
        assert_eq!(config.num_layers, 4);
    }

    #[test]
    fn test_flag_ranges_are_checked() {
        assert!(LmArgs::try_parse_from(["train-lm", "-k", "1.5"]).is_err());
        assert!(LmArgs::try_parse_from(["train-lm", "-w", "7"]).is_err());
        assert!(LmArgs::try_parse_from(["train-lm", "-o", "6"]).is_err());
        assert!(CaptionArgs::try_parse_from(["train-s2vt", "--cell-type", "4"]).is_err());
        // In range for the flag but rejected by validation.
        let args = LmArgs::try_parse_from(["train-lm", "-k", "0"]).unwrap();
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_config_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s2vt.json");
        std::fs::write(&path, r#"{"hidden_size": 12, "frames": 4, "batch_size": 3}"#).unwrap();
        let args = CaptionArgs::try_parse_from([
            "train-s2vt",
            "--config",
            path.to_str().unwrap(),
            "--batch-size",
            "7",
        ])
        .unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.hidden_size, 12);
        assert_eq!(config.frames, 4);
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.video_dim, 4096);
    }
}
