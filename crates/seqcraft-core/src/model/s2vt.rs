//! # S2VT video captioner
//!
//! Sequence to sequence video-to-text: a first recurrent stack reads the
//! projected frame features and then idles on zero input while the second
//! stack, fed the first stack's outputs alongside word embeddings, emits the
//! caption.
//!
//! ```text
//! step:      f_0 .. f_{F-1}   | w_0 (<BOS>) .. w_{S-1}
//! stack 1:   proj(frame)      | 0
//! stack 2:   [0, out_1]       | [embed(w_t), out_1]  -> logits
//! ```

use candle_core::{D, DType, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::CaptionConfig;
use crate::data::{BOS, CaptionBatch, EOS};
use crate::error::{Result, SeqcraftError};
use crate::model::{embed, maybe_dropout, project_steps, steps_of, uniform};
use crate::nn::{StackedCell, StackedState, sequence_loss};

pub struct S2vt {
    word_embedding: Tensor,
    video_w: Tensor,
    video_b: Tensor,
    encoder: StackedCell,
    decoder: StackedCell,
    out_w: Tensor,
    out_b: Tensor,
    frames: usize,
    embed_size: usize,
    decode_steps: usize,
    keep_prob: f64,
}

impl S2vt {
    pub fn new(config: &CaptionConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        if vocab_size <= EOS as usize {
            return Err(SeqcraftError::InvalidVocabulary(format!(
                "caption vocabulary has {vocab_size} words, fewer than the special tokens"
            )));
        }
        let init = uniform(config.init_scale);
        let (embed_size, hidden) = (config.embed_size, config.hidden_size);
        let word_embedding = vb.get_with_hints((vocab_size, embed_size), "word_embedding", init)?;
        let video_w = vb.get_with_hints((config.video_dim, embed_size), "video_w", init)?;
        let video_b = vb.get_with_hints(embed_size, "video_b", init)?;
        let encoder = StackedCell::new(
            config.cell,
            embed_size,
            hidden,
            config.num_layers,
            config.init_scale,
            vb.pp("encoder"),
        )?
        .with_keep_prob(config.keep_prob);
        let decoder = StackedCell::new(
            config.cell,
            embed_size + hidden,
            hidden,
            config.num_layers,
            config.init_scale,
            vb.pp("decoder"),
        )?
        .with_keep_prob(config.keep_prob);
        let out_w = vb.get_with_hints((hidden, vocab_size), "out_w", init)?;
        let out_b = vb.get_with_hints(vocab_size, "out_b", init)?;
        debug!(vocab_size, embed_size, hidden, "built captioner");

        Ok(Self {
            word_embedding,
            video_w,
            video_b,
            encoder,
            decoder,
            out_w,
            out_b,
            frames: config.frames,
            embed_size,
            decode_steps: config.decode_steps(),
            keep_prob: config.keep_prob,
        })
    }

    /// Run both stacks over the video frames; returns their states.
    fn encode(&self, video: &Tensor, train: bool) -> Result<(StackedState, StackedState)> {
        let (batch, frames, dim) = video.dims3()?;
        if frames != self.frames || dim != self.video_w.dim(0)? {
            return Err(SeqcraftError::Shape(format!(
                "video batch {:?} does not match {} frames of width {}",
                video.dims(),
                self.frames,
                self.video_w.dim(0)?
            )));
        }
        let video = maybe_dropout(video, self.keep_prob, train)?;
        let projected = video
            .reshape((batch * frames, dim))?
            .matmul(&self.video_w)?
            .broadcast_add(&self.video_b)?
            .reshape((batch, frames, self.embed_size))?;

        let pad = self.zero_words(batch, video.dtype())?;
        let mut s1 = self.encoder.zero_state(batch)?;
        let mut s2 = self.decoder.zero_state(batch)?;
        for frame in steps_of(&projected)? {
            let (out1, next1) = self.encoder.step(&frame, &s1, train)?;
            let (_, next2) = self.decoder.step(&Tensor::cat(&[&pad, &out1], 1)?, &s2, train)?;
            s1 = next1;
            s2 = next2;
        }
        Ok((s1, s2))
    }

    fn zero_words(&self, batch: usize, dtype: DType) -> Result<Tensor> {
        Ok(Tensor::zeros(
            (batch, self.embed_size),
            dtype,
            self.word_embedding.device(),
        )?)
    }

    /// One decoding step given the previous word embeddings `[batch, embed]`.
    fn decode_step(
        &self,
        words: &Tensor,
        s1: &StackedState,
        s2: &StackedState,
        train: bool,
    ) -> Result<(Tensor, StackedState, StackedState)> {
        let pad = self.zero_words(words.dim(0)?, words.dtype())?;
        let (out1, next1) = self.encoder.step(&pad, s1, train)?;
        let (out2, next2) = self.decoder.step(&Tensor::cat(&[words, &out1], 1)?, s2, train)?;
        Ok((out2, next1, next2))
    }

    /// `[batch, steps, vocab]` logits with teacher forcing.
    pub fn forward(&self, batch: &CaptionBatch, train: bool) -> Result<Tensor> {
        let (mut s1, mut s2) = self.encode(&batch.video, train)?;
        let words = embed(&self.word_embedding, &batch.inputs)?;
        let mut outputs = Vec::with_capacity(words.dim(1)?);
        for word in steps_of(&words)? {
            let (out, next1, next2) = self.decode_step(&word, &s1, &s2, train)?;
            outputs.push(out);
            s1 = next1;
            s2 = next2;
        }
        project_steps(&outputs, &self.out_w, &self.out_b)
    }

    /// Masked cross-entropy over the caption positions only.
    pub fn loss(&self, batch: &CaptionBatch, train: bool) -> Result<Tensor> {
        let logits = self.forward(batch, train)?;
        sequence_loss(&logits, &batch.targets, &batch.mask)
    }

    /// Greedy captions for `[batch, frames, dim]` videos.
    ///
    /// Each row starts from `<BOS>` and feeds back its most likely word until
    /// it emits `<EOS>` or runs out of steps. The returned ids exclude `<BOS>`
    /// and `<EOS>`.
    pub fn greedy_decode(&self, video: &Tensor) -> Result<Vec<Vec<u32>>> {
        let batch = video.dim(0)?;
        let (mut s1, mut s2) = self.encode(video, false)?;
        let mut previous = Tensor::full(BOS, batch, video.device())?;
        let mut captions = vec![Vec::new(); batch];
        let mut finished = vec![false; batch];

        for _ in 0..self.decode_steps {
            let words = self.word_embedding.index_select(&previous, 0)?;
            let (out, next1, next2) = self.decode_step(&words, &s1, &s2, false)?;
            s1 = next1;
            s2 = next2;
            let logits = out.matmul(&self.out_w)?.broadcast_add(&self.out_b)?;
            let picked = logits.argmax(D::Minus1)?;
            for (row, &id) in picked.to_vec1::<u32>()?.iter().enumerate() {
                if finished[row] {
                    continue;
                }
                if id == EOS {
                    finished[row] = true;
                } else {
                    captions[row].push(id);
                }
            }
            if finished.iter().all(|&f| f) {
                break;
            }
            previous = picked;
        }
        Ok(captions)
    }
}
