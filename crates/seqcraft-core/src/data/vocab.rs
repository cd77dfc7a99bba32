//! Word vocabularies.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, SeqcraftError};

/// Padding id in caption vocabularies.
pub const PAD: u32 = 0;
/// Begin-of-sentence id in caption vocabularies.
pub const BOS: u32 = 1;
/// End-of-sentence id in caption vocabularies.
pub const EOS: u32 = 2;
/// Unknown-word id in caption vocabularies.
pub const UNK: u32 = 3;

/// Special tokens reserved at the front of a caption vocabulary.
pub const SPECIAL_TOKENS: [&str; 4] = ["<PAD>", "<BOS>", "<EOS>", "<UNK>"];

/// Ordered word list; a word's id is its position.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Build from words in id order. Later duplicates keep the first id.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(words.len());
        for (id, word) in words.iter().enumerate() {
            index.entry(word.clone()).or_insert(id as u32);
        }
        Self { words, index }
    }

    /// Load a newline-delimited vocabulary; line number is the id.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::from_words(content.lines()))
    }

    /// Load a JSON object mapping word to id. Ids must cover `0..n` exactly.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let map: HashMap<String, u32> = serde_json::from_str(&content)?;
        Self::from_id_map(map)
    }

    /// Build from a word to id map. Ids must be dense.
    pub fn from_id_map(map: HashMap<String, u32>) -> Result<Self> {
        let mut words = vec![None; map.len()];
        for (word, id) in map {
            let slot = words.get_mut(id as usize).ok_or_else(|| {
                SeqcraftError::InvalidVocabulary(format!("id {id} for {word:?} is out of range"))
            })?;
            if slot.is_some() {
                return Err(SeqcraftError::InvalidVocabulary(format!(
                    "id {id} assigned twice"
                )));
            }
            *slot = Some(word);
        }
        let words: Vec<String> = words.into_iter().flatten().collect();
        Ok(Self::from_words(words))
    }

    /// Write as JSON object `{word: id}`.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(&self.index)?)?;
        Ok(())
    }

    pub fn id(&self, word: &str) -> Option<u32> {
        self.index.get(word).copied()
    }

    pub fn id_or(&self, word: &str, fallback: u32) -> u32 {
        self.id(word).unwrap_or(fallback)
    }

    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Split on whitespace and look up each word; unknown words become id 0.
    pub fn encode_line(&self, line: &str) -> Vec<i64> {
        line.split_whitespace()
            .map(|w| i64::from(self.id_or(w, 0)))
            .collect()
    }

    /// Words for `ids`, stopping at the first `EOS` and skipping `PAD`/`BOS`.
    pub fn decode_caption(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .take_while(|&&id| id != EOS)
            .filter(|&&id| id != PAD && id != BOS)
            .map(|&id| self.word(id).unwrap_or(SPECIAL_TOKENS[UNK as usize]).to_string())
            .collect()
    }
}
