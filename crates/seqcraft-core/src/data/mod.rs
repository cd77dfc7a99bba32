pub mod batch;
pub mod embedding;
pub mod vocab;

pub use batch::{CaptionBatch, FileQueue, Prefetcher, SentenceBatch, pad_batch, sequence_mask};
pub use embedding::EmbeddingMatrix;
pub use vocab::{BOS, EOS, PAD, SPECIAL_TOKENS, UNK, Vocabulary};
