//! Word tokenization for captions and question sentences.

use anyhow::Result;
use regex::Regex;

/// Lowercasing word tokenizer with pre-compiled patterns.
pub struct WordTokenizer {
    re_word: Regex,
    re_blank: Regex,
}

impl WordTokenizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            re_word: Regex::new(r"[a-z0-9]+(?:'[a-z]+)?")?,
            re_blank: Regex::new(r"_{2,}")?,
        })
    }

    /// Lowercase `text` and return its word tokens; punctuation is dropped.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.re_word
            .find_iter(&lower)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Replace the first blank (a run of underscores) in `question` with `option`.
    pub fn fill_blank(&self, question: &str, option: &str) -> Option<String> {
        self.re_blank
            .find(question)
            .map(|m| format!("{}{}{}", &question[..m.start()], option, &question[m.end()..]))
    }
}
