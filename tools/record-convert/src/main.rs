//! Record Conversion Tool
//!
//! Turns raw training corpora into the record files the trainers read:
//! tokenized text files, multiple-choice question sheets, and labelled or
//! unlabelled video features.

mod convert;
mod tokenize;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use seqcraft_core::Vocabulary;
use tracing::info;

use crate::tokenize::WordTokenizer;

/// CLI arguments
#[derive(Parser)]
#[command(name = "record-convert")]
#[command(about = "Convert corpora and video features into record files")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert whitespace-tokenized text files, one sentence record per line
    Sentences {
        /// File listing the text files to convert, one per line
        #[arg(short = 'i', long, default_value = "training_list")]
        file_list: PathBuf,

        /// Directory for the record files and their file_list.txt
        #[arg(short, long, default_value = "Training_Data_tfr")]
        output_dir: PathBuf,

        /// Vocabulary file; line number is the word id
        #[arg(short, long)]
        vocab: PathBuf,
    },
    /// Expand a question sheet (id,question,a),b),c),d),e)) into candidate sentences
    Questions {
        /// Question CSV
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Vocabulary file; line number is the word id
        #[arg(short, long)]
        vocab: PathBuf,

        #[arg(short, long, default_value = "testing_data.tfr")]
        output: PathBuf,
    },
    /// Convert labelled video features into caption records and a caption vocabulary
    Captions {
        /// Label JSON: [{"id": ..., "caption": [...]}]
        #[arg(short, long)]
        labels: PathBuf,

        /// Directory holding <id>.npy feature matrices
        #[arg(short, long)]
        features: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Where to write the word-to-id vocabulary JSON
        #[arg(long)]
        vocab_out: PathBuf,

        /// Caption slots including <BOS> and <EOS>
        #[arg(long, default_value_t = 20, value_parser = parse_caption_length)]
        max_caption_length: usize,

        /// Words seen fewer times map to <UNK>
        #[arg(long, default_value_t = 3)]
        min_count: usize,
    },
    /// Convert video features, in id-list order, into video records
    Videos {
        /// File with one video id per line
        #[arg(short, long)]
        ids: PathBuf,

        /// Directory holding <id>.npy feature matrices
        #[arg(short, long)]
        features: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
}

fn parse_caption_length(s: &str) -> std::result::Result<usize, String> {
    let len: usize = s.parse().map_err(|e| format!("{e}"))?;
    if len < convert::MIN_CAPTION_LENGTH {
        return Err(format!(
            "must be at least {} to hold <BOS> and <EOS>",
            convert::MIN_CAPTION_LENGTH
        ));
    }
    Ok(len)
}

fn load_vocab(path: &Path) -> Result<Vocabulary> {
    Vocabulary::from_file(path).with_context(|| format!("failed to load vocabulary {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sentences {
            file_list,
            output_dir,
            vocab,
        } => {
            let vocab = load_vocab(&vocab)?;
            let records = convert::convert_sentences(&file_list, &vocab, &output_dir)?;
            info!(records, output = %output_dir.display(), "sentences converted");
        }
        Commands::Questions {
            input,
            vocab,
            output,
        } => {
            let vocab = load_vocab(&vocab)?;
            let tokenizer = WordTokenizer::new()?;
            convert::convert_questions(&input, &vocab, &tokenizer, &output)?;
        }
        Commands::Captions {
            labels,
            features,
            output,
            vocab_out,
            max_caption_length,
            min_count,
        } => {
            let tokenizer = WordTokenizer::new()?;
            let summary = convert::convert_captions(
                &labels,
                &features,
                &tokenizer,
                max_caption_length,
                min_count,
                &output,
                &vocab_out,
            )?;
            info!(
                videos = summary.videos,
                records = summary.records,
                vocab = summary.vocab_size,
                frames = summary.frames,
                dim = summary.dim,
                "captions converted"
            );
        }
        Commands::Videos {
            ids,
            features,
            output,
        } => {
            convert::convert_videos(&ids, &features, &output)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_length_flag_needs_room_for_markers() {
        let parse = |len: &str| {
            Cli::try_parse_from([
                "record-convert",
                "captions",
                "-l",
                "labels.json",
                "-f",
                "feat",
                "-o",
                "train.tfr",
                "--vocab-out",
                "vocab.json",
                "--max-caption-length",
                len,
            ])
        };
        assert!(parse("1").is_err());
        assert!(parse("0").is_err());
        match parse("2").unwrap().command {
            Commands::Captions {
                max_caption_length, ..
            } => assert_eq!(max_caption_length, 2),
            _ => panic!("expected captions subcommand"),
        }
    }
}
