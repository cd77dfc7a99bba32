//! Pre-trained word embedding matrices stored as `.npy`.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::data::vocab::Vocabulary;
use crate::error::{Result, SeqcraftError};

/// A `vocab_size x embed_dim` f32 matrix; row `i` embeds word id `i`.
#[derive(Debug, Clone)]
pub struct EmbeddingMatrix {
    weights: Tensor,
}

impl EmbeddingMatrix {
    /// Wrap an existing 2-D tensor.
    pub fn new(weights: Tensor) -> Result<Self> {
        if weights.rank() != 2 {
            return Err(SeqcraftError::Shape(format!(
                "embedding matrix must be 2-D, got shape {:?}",
                weights.dims()
            )));
        }
        Ok(Self {
            weights: weights.to_dtype(DType::F32)?,
        })
    }

    /// Load from a NumPy `.npy` file (f32 or f64) onto `device`.
    pub fn load_npy<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let weights = Tensor::read_npy(path)?.to_device(device)?;
        let matrix = Self::new(weights)?;
        debug!(
            path = %path.display(),
            rows = matrix.rows(),
            dim = matrix.dim(),
            "loaded embedding matrix"
        );
        Ok(matrix)
    }

    /// Write as `.npy`.
    pub fn save_npy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.weights.write_npy(path)?;
        Ok(())
    }

    /// Fail unless there is exactly one row per vocabulary word.
    pub fn check_vocab(&self, vocab: &Vocabulary) -> Result<()> {
        if self.rows() != vocab.len() {
            return Err(SeqcraftError::VocabMismatch {
                vocab: vocab.len(),
                rows: self.rows(),
            });
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.weights.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.weights.dims()[1]
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }
}
