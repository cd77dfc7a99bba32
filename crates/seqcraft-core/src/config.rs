//! # Hyperparameters
//!
//! Configuration records for the sentence language model and the video
//! captioner. Defaults match the settings the models were tuned with; every
//! field can be overridden from a JSON file or through `with_*` setters.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqcraftError};
use crate::nn::{CellKind, OptimizerKind};

/// Number of candidate sentences per multiple-choice question.
pub const CANDIDATES_PER_QUESTION: usize = 5;

/// Which pre-trained word vectors the training data was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordvecSource {
    Debug,
    #[serde(rename = "glove_6b_50d")]
    Glove6B50d,
    #[serde(rename = "glove_6b_100d")]
    Glove6B100d,
    #[serde(rename = "glove_6b_200d")]
    Glove6B200d,
    #[serde(rename = "glove_6b_300d")]
    Glove6B300d,
    #[serde(rename = "glove_42b")]
    Glove42B,
    #[serde(rename = "glove_840b")]
    Glove840B,
}

impl WordvecSource {
    const DIMS: [usize; 7] = [50, 50, 100, 200, 300, 300, 300];

    /// Map the numeric selector used on the command line (0..=6).
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Debug),
            1 => Some(Self::Glove6B50d),
            2 => Some(Self::Glove6B100d),
            3 => Some(Self::Glove6B200d),
            4 => Some(Self::Glove6B300d),
            5 => Some(Self::Glove42B),
            6 => Some(Self::Glove840B),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Width of one word vector.
    pub fn embed_dim(self) -> usize {
        Self::DIMS[self.index()]
    }

    /// Directory the converter writes this source's training data to.
    pub fn default_data_dir(self) -> PathBuf {
        PathBuf::from(format!("./Training_Data{}/", self.index()))
    }
}

fn check(ok: bool, message: impl Into<String>) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(SeqcraftError::InvalidConfig(message.into()))
    }
}

fn check_keep_prob(keep_prob: f64) -> Result<()> {
    check(
        keep_prob > 0.0 && keep_prob <= 1.0,
        format!("keep probability must be in (0, 1], got {keep_prob}"),
    )
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Settings for training the sentence language model and answering questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmConfig {
    pub wordvec_src: WordvecSource,
    /// Overrides the source's default data directory.
    pub data_dir: Option<PathBuf>,
    pub cell: CellKind,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub learning_rate: f64,
    /// Multiplied into the learning rate after every epoch.
    pub lr_decay: f64,
    pub init_scale: f64,
    pub max_grad_norm: f64,
    pub max_epoch: usize,
    pub keep_prob: f64,
    pub batch_size: usize,
    /// Leading entries of the file list used for training; the rest validate.
    pub train_num: usize,
    /// Training steps per epoch.
    pub epoch_size: usize,
    pub optimizer: OptimizerKind,
    pub questions: usize,
    /// Test record file, relative to the data directory.
    pub test_file: PathBuf,
    pub output: PathBuf,
    /// Where to write trained variables as safetensors.
    pub save_path: Option<PathBuf>,
    pub seed: u64,
    /// Batches decoded ahead of the training loop.
    pub prefetch: usize,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            wordvec_src: WordvecSource::Glove6B100d,
            data_dir: None,
            cell: CellKind::BasicLstm,
            hidden_size: 256,
            num_layers: 4,
            learning_rate: 0.001,
            lr_decay: 1.0,
            init_scale: 0.001,
            max_grad_norm: 25.0,
            max_epoch: 2,
            keep_prob: 0.3,
            batch_size: 300,
            train_num: 522,
            epoch_size: 100,
            optimizer: OptimizerKind::Adam,
            questions: 1040,
            test_file: PathBuf::from("testing_data.tfr"),
            output: PathBuf::from("submission/basic_lstm2.csv"),
            save_path: None,
            seed: 0,
            prefetch: 4,
        }
    }
}

impl LmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from a JSON object; missing keys keep their defaults.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_wordvec_src(mut self, source: WordvecSource) -> Self {
        self.wordvec_src = source;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_cell(mut self, cell: CellKind) -> Self {
        self.cell = cell;
        self
    }

    pub fn with_hidden_size(mut self, hidden: usize) -> Self {
        self.hidden_size = hidden;
        self
    }

    pub fn with_num_layers(mut self, layers: usize) -> Self {
        self.num_layers = layers;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_keep_prob(mut self, keep_prob: f64) -> Self {
        self.keep_prob = keep_prob;
        self
    }

    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch_size = batch;
        self
    }

    pub fn with_epochs(mut self, max_epoch: usize, epoch_size: usize) -> Self {
        self.max_epoch = max_epoch;
        self.epoch_size = epoch_size;
        self
    }

    pub fn with_train_num(mut self, train_num: usize) -> Self {
        self.train_num = train_num;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_questions(mut self, questions: usize) -> Self {
        self.questions = questions;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.wordvec_src.default_data_dir())
    }

    pub fn embed_dim(&self) -> usize {
        self.wordvec_src.embed_dim()
    }

    pub fn validate(&self) -> Result<()> {
        check_keep_prob(self.keep_prob)?;
        check(self.hidden_size > 0, "hidden size must be positive")?;
        check(self.num_layers > 0, "at least one layer is required")?;
        check(self.batch_size > 0, "batch size must be positive")?;
        check(self.epoch_size > 0, "epoch size must be positive")?;
        check(self.learning_rate > 0.0, "learning rate must be positive")?;
        check(self.lr_decay > 0.0, "learning rate decay must be positive")?;
        check(self.init_scale >= 0.0, "init scale must not be negative")?;
        check(self.max_grad_norm > 0.0, "max gradient norm must be positive")?;
        Ok(())
    }
}

/// Settings for the S2VT video captioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub cell: CellKind,
    pub video_dim: usize,
    pub frames: usize,
    /// Caption slots including `<BOS>` and `<EOS>`.
    pub max_caption_length: usize,
    pub embed_size: usize,
    pub hidden_size: usize,
    /// Layers in each of the two recurrent stacks.
    pub num_layers: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub lr_decay: f64,
    pub init_scale: f64,
    pub max_grad_norm: f64,
    pub keep_prob: f64,
    /// Training batches; one batch per epoch.
    pub max_epoch: usize,
    /// Log perplexity every this many epochs.
    pub info_epoch: usize,
    pub testing_video_num: usize,
    pub optimizer: OptimizerKind,
    pub train_list: PathBuf,
    pub test_list: PathBuf,
    pub vocab_path: PathBuf,
    pub test_id_path: PathBuf,
    pub output: PathBuf,
    pub save_path: Option<PathBuf>,
    pub seed: u64,
    pub prefetch: usize,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            cell: CellKind::BasicLstm,
            video_dim: 4096,
            frames: 80,
            max_caption_length: 20,
            embed_size: 500,
            hidden_size: 1000,
            num_layers: 1,
            batch_size: 145,
            learning_rate: 1e-7,
            lr_decay: 1.0,
            init_scale: 0.005,
            max_grad_norm: 10.0,
            keep_prob: 0.5,
            max_epoch: 10000,
            info_epoch: 1,
            testing_video_num: 50,
            optimizer: OptimizerKind::Adam,
            train_list: PathBuf::from(
                "MLDS_hw2_data/training_data/Training_Data_TFR/training_list.txt",
            ),
            test_list: PathBuf::from("MLDS_hw2_data/testing_data/Testing_Data_TFR/testing_list.txt"),
            vocab_path: PathBuf::from("MLDS_hw2_data/training_data/jason_vocab.json"),
            test_id_path: PathBuf::from("MLDS_hw2_data/testing_id.txt"),
            output: PathBuf::from("output.json"),
            save_path: None,
            seed: 0,
            prefetch: 2,
        }
    }
}

impl CaptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_cell(mut self, cell: CellKind) -> Self {
        self.cell = cell;
        self
    }

    /// Set the per-frame feature width and the number of frames.
    pub fn with_video(mut self, video_dim: usize, frames: usize) -> Self {
        self.video_dim = video_dim;
        self.frames = frames;
        self
    }

    pub fn with_max_caption_length(mut self, len: usize) -> Self {
        self.max_caption_length = len;
        self
    }

    pub fn with_sizes(mut self, embed: usize, hidden: usize) -> Self {
        self.embed_size = embed;
        self.hidden_size = hidden;
        self
    }

    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch_size = batch;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_keep_prob(mut self, keep_prob: f64) -> Self {
        self.keep_prob = keep_prob;
        self
    }

    pub fn with_max_epoch(mut self, max_epoch: usize) -> Self {
        self.max_epoch = max_epoch;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    /// Decoder steps per caption (`max_caption_length - 1`).
    pub fn decode_steps(&self) -> usize {
        self.max_caption_length.saturating_sub(1)
    }

    pub fn validate(&self) -> Result<()> {
        check_keep_prob(self.keep_prob)?;
        check(self.video_dim > 0, "video feature width must be positive")?;
        check(self.frames > 0, "frame count must be positive")?;
        check(
            self.max_caption_length >= 2,
            "max caption length must leave room for <BOS> and <EOS>",
        )?;
        check(self.embed_size > 0, "embedding size must be positive")?;
        check(self.hidden_size > 0, "hidden size must be positive")?;
        check(self.num_layers > 0, "at least one layer is required")?;
        check(self.batch_size > 0, "batch size must be positive")?;
        check(self.info_epoch > 0, "info epoch must be positive")?;
        check(self.learning_rate > 0.0, "learning rate must be positive")?;
        check(self.lr_decay > 0.0, "learning rate decay must be positive")?;
        check(self.max_grad_norm > 0.0, "max gradient norm must be positive")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wordvec_sources() {
        assert_eq!(WordvecSource::from_index(0).unwrap().embed_dim(), 50);
        assert_eq!(WordvecSource::from_index(3).unwrap().embed_dim(), 200);
        assert_eq!(WordvecSource::Glove840B.embed_dim(), 300);
        assert!(WordvecSource::from_index(7).is_none());
        assert_eq!(
            WordvecSource::Glove6B100d.default_data_dir(),
            PathBuf::from("./Training_Data2/")
        );
    }

    #[test]
    fn test_lm_defaults() {
        let config = LmConfig::default();
        assert_eq!(config.hidden_size, 256);
        assert_eq!(config.num_layers, 4);
        assert_eq!(config.embed_dim(), 100);
        assert_eq!(config.data_dir(), PathBuf::from("./Training_Data2/"));
        assert_eq!(config.optimizer, OptimizerKind::Adam);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.clone().with_data_dir("/tmp/x").data_dir(),
            PathBuf::from("/tmp/x")
        );
    }

    #[test]
    fn test_keep_prob_range() {
        assert!(LmConfig::new().with_keep_prob(1.0).validate().is_ok());
        assert!(LmConfig::new().with_keep_prob(0.0).validate().is_err());
        assert!(LmConfig::new().with_keep_prob(1.5).validate().is_err());
        assert!(CaptionConfig::new().with_keep_prob(-0.1).validate().is_err());
    }

    #[test]
    fn test_caption_validation() {
        let config = CaptionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decode_steps(), 19);
        assert!(config.with_max_caption_length(1).validate().is_err());
        assert!(CaptionConfig::new().with_video(0, 80).validate().is_err());
    }

    #[test]
    fn test_json_overrides_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lm.json");
        fs::write(
            &path,
            r#"{"hidden_size": 32, "cell": "gru", "optimizer": "rms_prop", "wordvec_src": "glove_42b"}"#,
        )
        .unwrap();
        let config = LmConfig::load_json(&path).unwrap();
        assert_eq!(config.hidden_size, 32);
        assert_eq!(config.cell, CellKind::Gru);
        assert_eq!(config.optimizer, OptimizerKind::RmsProp);
        assert_eq!(config.wordvec_src, WordvecSource::Glove42B);
        assert_eq!(config.batch_size, 300);

        fs::write(&path, r#"{"keep_prob": 2.0}"#).unwrap();
        assert!(matches!(
            LmConfig::load_json(&path),
            Err(SeqcraftError::InvalidConfig(_))
        ));
    }
}
