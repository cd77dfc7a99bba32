//! # Language-model driver
//!
//! Loads the word vectors, vocabulary and record files from a data directory,
//! trains the sentence model, reports training and validation perplexity, and
//! answers the multiple-choice questions of the test records.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use seqcraft_core::nn::perplexity;
use seqcraft_core::record::RecordReader;
use seqcraft_core::{
    CANDIDATES_PER_QUESTION, EmbeddingMatrix, FileQueue, LmConfig, Prefetcher, SentenceBatch,
    SentenceLm, SentenceRecord, SeqOptimizer, Vocabulary, write_answers_csv,
};
use tracing::{debug, info, warn};

use crate::read_file_list;

/// Everything loaded from the data directory.
pub struct LmData {
    pub vocab: Vocabulary,
    pub embedding: EmbeddingMatrix,
    pub train_files: Vec<PathBuf>,
    pub valid_files: Vec<PathBuf>,
    pub test_file: PathBuf,
}

impl LmData {
    /// Load `wordvec.npy`, `vocab.txt` and `file_list.txt` from the configured directory.
    pub fn load(config: &LmConfig, device: &Device) -> Result<Self> {
        let dir = config.data_dir();
        let embedding = EmbeddingMatrix::load_npy(dir.join("wordvec.npy"), device)
            .with_context(|| format!("failed to load word vectors from {}", dir.display()))?;
        let vocab = Vocabulary::from_file(dir.join("vocab.txt"))
            .with_context(|| format!("failed to load vocabulary from {}", dir.display()))?;
        embedding.check_vocab(&vocab)?;

        let mut files = read_file_list(&dir.join("file_list.txt"), &dir)?;
        let split = config.train_num.min(files.len());
        let valid_files = files.split_off(split);
        if files.is_empty() {
            bail!("file list in {} has no training files", dir.display());
        }
        info!(
            vocab = vocab.len(),
            train_files = files.len(),
            valid_files = valid_files.len(),
            "loaded training data"
        );

        Ok(Self {
            vocab,
            embedding,
            train_files: files,
            valid_files,
            test_file: dir.join(&config.test_file),
        })
    }
}

/// Per-epoch perplexities and the chosen answers.
#[derive(Debug, Clone, Default)]
pub struct LmReport {
    pub train_perplexity: Vec<f64>,
    pub valid_perplexity: Vec<f64>,
    pub answers: Vec<usize>,
}

fn sentence_batches(
    mut queue: FileQueue,
    batch_size: usize,
    prefetch: usize,
    device: &Device,
) -> Prefetcher<SentenceBatch> {
    let device = device.clone();
    Prefetcher::spawn(prefetch, move || {
        let records = queue.take_records(batch_size, SentenceRecord::decode)?;
        SentenceBatch::from_records(&records, &device)
    })
}

/// Run `steps` batches; with an optimizer the model is updated after each.
fn run_epoch(
    model: &SentenceLm,
    batches: &mut Prefetcher<SentenceBatch>,
    steps: usize,
    mut optimizer: Option<(&mut SeqOptimizer, &VarMap, f64)>,
) -> Result<f64> {
    let mut total = 0.0;
    for step in 0..steps {
        let batch = batches.next()?;
        let train = optimizer.is_some();
        let loss = model.loss(&batch, train)?;
        let cost = f64::from(loss.to_scalar::<f32>()?);
        if let Some((opt, varmap, max_norm)) = optimizer.as_mut() {
            let norm = opt.minimize(&loss, &varmap.all_vars(), *max_norm)?;
            debug!(step, cost, norm, "train step");
        }
        total += cost;
    }
    Ok(perplexity(total / steps.max(1) as f64))
}

/// Pick the most likely of the five candidates for each question.
pub fn answer_questions(
    model: &SentenceLm,
    test_file: &Path,
    questions: usize,
    device: &Device,
) -> Result<Vec<usize>> {
    let mut reader = RecordReader::open(test_file)
        .with_context(|| format!("failed to open test records {}", test_file.display()))?;
    let mut answers = Vec::with_capacity(questions);
    for question in 0..questions {
        let mut candidates = Vec::with_capacity(CANDIDATES_PER_QUESTION);
        for _ in 0..CANDIDATES_PER_QUESTION {
            let Some(bytes) = reader.read_record()? else {
                bail!(
                    "{} ended inside question {} of {questions}",
                    test_file.display(),
                    question + 1
                );
            };
            candidates.push(SentenceRecord::decode(&bytes)?);
        }
        let batch = SentenceBatch::from_records(&candidates, device)?;
        answers.push(model.best_candidate(&batch)?);
    }
    Ok(answers)
}

/// Train, validate, answer and write the CSV.
pub fn run(config: &LmConfig) -> Result<LmReport> {
    config.validate()?;
    let device = Device::Cpu;
    let data = LmData::load(config, &device)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SentenceLm::new(config, &data.embedding, vb.pp("model"))?;
    let mut optimizer = SeqOptimizer::new(config.optimizer, varmap.all_vars(), config.learning_rate)?;

    let mut train_batches = sentence_batches(
        FileQueue::shuffled(data.train_files.clone(), config.seed)?,
        config.batch_size,
        config.prefetch,
        &device,
    );
    let mut valid_batches = if data.valid_files.is_empty() {
        None
    } else {
        Some(sentence_batches(
            FileQueue::new(data.valid_files.clone())?,
            config.batch_size,
            config.prefetch,
            &device,
        ))
    };

    let mut report = LmReport::default();
    for epoch in 1..=config.max_epoch {
        let lr = optimizer.learning_rate();
        let train_ppl = run_epoch(
            &model,
            &mut train_batches,
            config.epoch_size,
            Some((&mut optimizer, &varmap, config.max_grad_norm)),
        )?;
        info!(epoch, lr, perplexity = train_ppl, "train");
        report.train_perplexity.push(train_ppl);

        if let Some(batches) = valid_batches.as_mut() {
            let valid_ppl = run_epoch(&model, batches, config.epoch_size, None)?;
            info!(epoch, perplexity = valid_ppl, "valid");
            report.valid_perplexity.push(valid_ppl);
        }
        optimizer.set_learning_rate(lr * config.lr_decay);
    }

    if let Some(path) = &config.save_path {
        varmap
            .save(path)
            .with_context(|| format!("failed to save variables to {}", path.display()))?;
        info!(path = %path.display(), "saved variables");
    }

    if config.questions == 0 {
        warn!("no questions to answer");
    } else {
        report.answers = answer_questions(&model, &data.test_file, config.questions, &device)?;
        write_answers_csv(&config.output, &report.answers)?;
    }
    Ok(report)
}
