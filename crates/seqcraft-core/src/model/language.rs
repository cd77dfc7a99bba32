//! # Sentence language model
//!
//! A multi-layer recurrent network over frozen pre-trained word vectors that
//! predicts the next word of a sentence. Candidate completions of a question
//! are ranked by the log-likelihood the model assigns to them.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::{debug, warn};

use crate::config::LmConfig;
use crate::data::{EmbeddingMatrix, SentenceBatch};
use crate::error::Result;
use crate::model::{embed, maybe_dropout, project_steps, steps_of, uniform};
use crate::nn::{StackedCell, sequence_log_likelihood, sequence_loss, unroll};

pub struct SentenceLm {
    /// Pre-trained vectors; a plain tensor, so never updated by an optimizer.
    embedding: Tensor,
    rnn: StackedCell,
    softmax_w: Tensor,
    softmax_b: Tensor,
    keep_prob: f64,
}

impl SentenceLm {
    /// Build the model; trainable variables are created through `vb`.
    ///
    /// # Arguments
    /// * `config` - Cell kind, sizes, dropout and init scale
    /// * `embedding` - Word vectors; its row count sets the vocabulary size
    /// * `vb` - Variable builder backed by the training `VarMap`
    pub fn new(config: &LmConfig, embedding: &EmbeddingMatrix, vb: VarBuilder) -> Result<Self> {
        if embedding.dim() != config.embed_dim() {
            warn!(
                expected = config.embed_dim(),
                actual = embedding.dim(),
                "embedding width differs from the configured word vectors"
            );
        }
        let vocab = embedding.rows();
        let hidden = config.hidden_size;
        let rnn = StackedCell::new(
            config.cell,
            embedding.dim(),
            hidden,
            config.num_layers,
            config.init_scale,
            vb.pp("rnn"),
        )?
        .with_keep_prob(config.keep_prob);
        let softmax_w = vb.get_with_hints((hidden, vocab), "softmax_w", uniform(config.init_scale))?;
        let softmax_b = vb.get_with_hints(vocab, "softmax_b", uniform(config.init_scale))?;
        debug!(vocab, hidden, layers = config.num_layers, "built sentence model");

        Ok(Self {
            embedding: embedding.weights().to_device(softmax_w.device())?,
            rnn,
            softmax_w,
            softmax_b,
            keep_prob: config.keep_prob,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.softmax_b.dims()[0]
    }

    /// `[batch, steps, vocab]` next-word logits for a batch.
    pub fn forward(&self, batch: &SentenceBatch, train: bool) -> Result<Tensor> {
        let inputs = embed(&self.embedding, &batch.inputs)?;
        let inputs = maybe_dropout(&inputs, self.keep_prob, train)?;
        let initial = self.rnn.zero_state(batch.batch_size())?;
        let (outputs, _) = unroll(&self.rnn, &steps_of(&inputs)?, &batch.lengths, initial, train)?;
        project_steps(&outputs, &self.softmax_w, &self.softmax_b)
    }

    /// Mean cross-entropy over the batch's valid positions.
    pub fn loss(&self, batch: &SentenceBatch, train: bool) -> Result<Tensor> {
        let logits = self.forward(batch, train)?;
        sequence_loss(&logits, &batch.targets, &batch.mask)
    }

    /// Log-likelihood of each row of `batch`, without dropout.
    pub fn score_candidates(&self, batch: &SentenceBatch) -> Result<Vec<f32>> {
        let logits = self.forward(batch, false)?;
        let scores = sequence_log_likelihood(&logits, &batch.targets, &batch.mask)?;
        Ok(scores.to_vec1::<f32>()?)
    }

    /// Index of the most likely candidate; ties go to the earliest one.
    pub fn best_candidate(&self, batch: &SentenceBatch) -> Result<usize> {
        let scores = self.score_candidates(batch)?;
        Ok(argmax(&scores))
    }
}

pub(crate) fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    best
}
