use thiserror::Error;

/// Errors that can occur while loading data, building models or writing outputs.
#[derive(Debug, Error)]
pub enum SeqcraftError {
    /// A record ended before its declared length.
    #[error("truncated record in {path}")]
    TruncatedRecord {
        /// File the record was read from.
        path: String,
    },

    /// A record's length or payload checksum did not match.
    #[error("corrupt record in {path}: {what} checksum mismatch")]
    CorruptRecord {
        /// File the record was read from.
        path: String,
        /// Either "length" or "payload".
        what: &'static str,
    },

    /// The protobuf payload of an `Example` could not be decoded.
    #[error("malformed example: {0}")]
    MalformedExample(String),

    /// A required feature key is absent or has the wrong list type.
    #[error("missing or mistyped feature {key:?}")]
    MissingFeature {
        /// Feature key that was looked up.
        key: String,
    },

    /// Vocabulary and embedding matrix disagree on the number of words.
    #[error("vocabulary has {vocab} words but embedding matrix has {rows} rows")]
    VocabMismatch {
        /// Number of vocabulary entries.
        vocab: usize,
        /// Number of embedding rows.
        rows: usize,
    },

    /// A vocabulary file is malformed.
    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    /// A tensor did not have the expected shape.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A hyperparameter failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A batch could not be assembled.
    #[error("empty batch: {0}")]
    EmptyBatch(String),

    /// Candle tensor error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error.
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type alias for seqcraft operations.
pub type Result<T> = std::result::Result<T, SeqcraftError>;
