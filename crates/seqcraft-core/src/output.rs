//! Prediction files: multiple-choice answers as CSV and captions as JSON.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SeqcraftError};

/// Letter for a zero-based choice index (`0 -> 'a'`).
pub fn choice_letter(index: usize) -> Result<char> {
    u8::try_from(index)
        .ok()
        .filter(|&i| i < 26)
        .map(|i| char::from(b'a' + i))
        .ok_or_else(|| SeqcraftError::InvalidConfig(format!("choice index {index} has no letter")))
}

#[derive(Debug, Serialize)]
struct AnswerRow {
    id: usize,
    answer: char,
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write `id,answer` rows with ids counted from 1.
pub fn write_answers_csv<P: AsRef<Path>>(path: P, answers: &[usize]) -> Result<()> {
    let path = path.as_ref();
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for (i, &choice) in answers.iter().enumerate() {
        writer.serialize(AnswerRow {
            id: i + 1,
            answer: choice_letter(choice)?,
        })?;
    }
    writer.flush()?;
    info!(path = %path.display(), answers = answers.len(), "wrote answers");
    Ok(())
}

/// One generated caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionEntry {
    pub caption: String,
    pub id: String,
}

/// Write captions as a JSON list of `{"caption", "id"}` objects.
pub fn write_captions_json<P: AsRef<Path>>(path: P, captions: &[CaptionEntry]) -> Result<()> {
    let path = path.as_ref();
    create_parent(path)?;
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, captions)?;
    info!(path = %path.display(), captions = captions.len(), "wrote captions");
    Ok(())
}
