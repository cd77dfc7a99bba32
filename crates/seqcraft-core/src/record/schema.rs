//! Typed record schemas stored as `Example` features.

use crate::error::{Result, SeqcraftError};
use crate::record::example::{Example, Feature};

/// A tokenized sentence: `content` ids and their count under `len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceRecord {
    pub content: Vec<i64>,
    pub len: i64,
}

impl SentenceRecord {
    pub fn new(content: Vec<i64>) -> Self {
        let len = content.len() as i64;
        Self { content, len }
    }

    pub fn to_example(&self) -> Example {
        let mut example = Example::new();
        example
            .insert("content", Feature::Int64(self.content.clone()))
            .insert("len", Feature::Int64(vec![self.len]));
        example
    }

    pub fn from_example(example: &Example) -> Result<Self> {
        let content = example.int64_list("content")?.to_vec();
        let len = first(example.int64_list("len")?, "len")?;
        Ok(Self { content, len })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_example().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_example(&Example::decode(bytes)?)
    }
}

/// A training clip: flattened `frames x dim` video features plus one caption.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionRecord {
    pub video: Vec<f32>,
    pub caption: Vec<i64>,
    pub caption_length: i64,
}

impl CaptionRecord {
    pub fn new(video: Vec<f32>, caption: Vec<i64>) -> Self {
        let caption_length = caption.len() as i64;
        Self {
            video,
            caption,
            caption_length,
        }
    }

    pub fn to_example(&self) -> Example {
        let mut example = Example::new();
        example
            .insert("video", Feature::Float(self.video.clone()))
            .insert("caption", Feature::Int64(self.caption.clone()))
            .insert("caption_length", Feature::Int64(vec![self.caption_length]));
        example
    }

    pub fn from_example(example: &Example) -> Result<Self> {
        Ok(Self {
            video: example.float_list("video")?.to_vec(),
            caption: example.int64_list("caption")?.to_vec(),
            caption_length: first(example.int64_list("caption_length")?, "caption_length")?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_example().encode()
    }

    /// Decode and check the video against `frames x dim`.
    pub fn decode(bytes: &[u8], frames: usize, dim: usize) -> Result<Self> {
        let record = Self::from_example(&Example::decode(bytes)?)?;
        check_video_len(&record.video, frames, dim)?;
        Ok(record)
    }
}

/// A test clip: video features only.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRecord {
    pub video: Vec<f32>,
}

impl VideoRecord {
    pub fn to_example(&self) -> Example {
        let mut example = Example::new();
        example.insert("video", Feature::Float(self.video.clone()));
        example
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_example().encode()
    }

    pub fn decode(bytes: &[u8], frames: usize, dim: usize) -> Result<Self> {
        let example = Example::decode(bytes)?;
        let video = example.float_list("video")?.to_vec();
        check_video_len(&video, frames, dim)?;
        Ok(Self { video })
    }
}

fn first(values: &[i64], key: &str) -> Result<i64> {
    values
        .first()
        .copied()
        .ok_or_else(|| SeqcraftError::MissingFeature { key: key.into() })
}

fn check_video_len(video: &[f32], frames: usize, dim: usize) -> Result<()> {
    if video.len() != frames * dim {
        return Err(SeqcraftError::Shape(format!(
            "video has {} values, expected {frames} frames x {dim}",
            video.len()
        )));
    }
    Ok(())
}
