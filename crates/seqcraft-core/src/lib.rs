//! # Seqcraft Core
//!
//! Building blocks for training recurrent sequence models: TFRecord files of
//! `tf.train.Example` records, vocabularies and pre-trained embeddings,
//! padded batches, recurrent cells with optimizers, and the sentence language
//! model and S2VT captioner built from them.
//!
//! ## Quick Start
//!
//! ```rust
//! use seqcraft_core::record::{RecordReader, RecordWriter, SentenceRecord};
//!
//! let path = std::env::temp_dir().join("seqcraft_core_doc.tfr");
//! let mut writer = RecordWriter::create(&path).unwrap();
//! writer.write(&SentenceRecord::new(vec![4, 8, 15]).encode()).unwrap();
//! writer.flush().unwrap();
//!
//! let mut reader = RecordReader::open(&path).unwrap();
//! let bytes = reader.read_record().unwrap().unwrap();
//! assert_eq!(SentenceRecord::decode(&bytes).unwrap().content, vec![4, 8, 15]);
//! ```
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod nn;
pub mod output;
pub mod record;

// Re-export primary API
pub use config::{CANDIDATES_PER_QUESTION, CaptionConfig, LmConfig, WordvecSource};
pub use data::{CaptionBatch, EmbeddingMatrix, FileQueue, Prefetcher, SentenceBatch, Vocabulary};
pub use error::{Result, SeqcraftError};
pub use model::{S2vt, SentenceLm};
pub use nn::{CellKind, OptimizerKind, SeqOptimizer, StackedCell};
pub use output::{CaptionEntry, choice_letter, write_answers_csv, write_captions_json};
pub use record::{CaptionRecord, Example, Feature, RecordReader, RecordWriter, SentenceRecord, VideoRecord};
