//! # Seqcraft
//!
//! Recurrent language models and S2VT video captioning on candle.
//!
//! This crate re-exports the building blocks from `seqcraft-core` and the
//! training drivers from `seqcraft-trainer`.

pub use seqcraft_core::*;

pub mod trainer {
    pub use seqcraft_trainer::{CaptionArgs, LmArgs, caption, cli, lm, read_file_list};
}
