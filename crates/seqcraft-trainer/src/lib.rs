//! # Seqcraft Trainer
//!
//! Training drivers for the seqcraft models. `train-lm` trains the sentence
//! language model and answers completion questions; `train-s2vt` trains the
//! video captioner and captions the test videos.

pub mod caption;
pub mod cli;
pub mod lm;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub use cli::{CaptionArgs, LmArgs};

/// Read a newline-separated list of record files; relative entries resolve against `base`.
pub fn read_file_list(list: &Path, base: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(list)
        .with_context(|| format!("failed to read file list {}", list.display()))?;
    let files: Vec<PathBuf> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            let path = Path::new(l);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
        .collect();
    if files.is_empty() {
        bail!("file list {} is empty", list.display());
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_list_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        fs::write(&list, "a.tfr\n\n/abs/b.tfr\n  c.tfr  \n").unwrap();
        let files = read_file_list(&list, dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("a.tfr"),
                PathBuf::from("/abs/b.tfr"),
                dir.path().join("c.tfr"),
            ]
        );
    }

    #[test]
    fn test_empty_file_list() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        fs::write(&list, "\n").unwrap();
        assert!(read_file_list(&list, dir.path()).is_err());
        assert!(read_file_list(&dir.path().join("missing"), dir.path()).is_err());
    }
}
