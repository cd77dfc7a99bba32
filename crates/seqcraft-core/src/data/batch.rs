//! # Batching
//!
//! Endless file queues over record files, dynamic padding into tensors, and a
//! background prefetcher that keeps a bounded number of batches ready.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use crate::error::{Result, SeqcraftError};
use crate::record::{CaptionRecord, RecordReader, SentenceRecord};

/// Cycles over a list of record files forever, one record at a time.
///
/// With shuffling enabled the file order is reshuffled at the start of
/// every pass.
pub struct FileQueue {
    files: Vec<PathBuf>,
    order: Vec<usize>,
    cursor: usize,
    reader: Option<RecordReader>,
    rng: Option<oorandom::Rand32>,
    yielded_this_pass: bool,
}

impl FileQueue {
    /// Queue over `files` in the given order.
    pub fn new(files: Vec<PathBuf>) -> Result<Self> {
        if files.is_empty() {
            return Err(SeqcraftError::EmptyBatch("file queue has no files".into()));
        }
        let order = (0..files.len()).collect();
        Ok(Self {
            files,
            order,
            cursor: 0,
            reader: None,
            rng: None,
            yielded_this_pass: false,
        })
    }

    /// Queue that shuffles the file order each pass using `seed`.
    pub fn shuffled(files: Vec<PathBuf>, seed: u64) -> Result<Self> {
        let mut queue = Self::new(files)?;
        queue.rng = Some(oorandom::Rand32::new(seed));
        queue.reshuffle();
        Ok(queue)
    }

    fn reshuffle(&mut self) {
        if let Some(rng) = self.rng.as_mut() {
            for i in (1..self.order.len()).rev() {
                let j = rng.rand_range(0..(i as u32 + 1)) as usize;
                self.order.swap(i, j);
            }
        }
    }

    /// Next raw record payload, wrapping around at the end of the list.
    pub fn next_record(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(reader) = self.reader.as_mut() {
                if let Some(payload) = reader.read_record()? {
                    self.yielded_this_pass = true;
                    return Ok(payload);
                }
                self.reader = None;
                self.cursor += 1;
            }

            if self.cursor >= self.order.len() {
                if !self.yielded_this_pass {
                    return Err(SeqcraftError::EmptyBatch(
                        "no records in any queued file".into(),
                    ));
                }
                self.cursor = 0;
                self.yielded_this_pass = false;
                self.reshuffle();
                debug!("file queue wrapped around");
            }

            let path = &self.files[self.order[self.cursor]];
            self.reader = Some(RecordReader::open(path)?);
        }
    }

    /// Next `n` records decoded with `decode`.
    pub fn take_records<T>(
        &mut self,
        n: usize,
        mut decode: impl FnMut(&[u8]) -> Result<T>,
    ) -> Result<Vec<T>> {
        (0..n).map(|_| decode(&self.next_record()?)).collect()
    }
}

/// Pad sequences with zeros to the longest one; returns row-major data and width.
pub fn pad_batch(seqs: &[&[u32]]) -> (Vec<u32>, usize) {
    let width = seqs.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut data = vec![0u32; seqs.len() * width];
    for (row, seq) in seqs.iter().enumerate() {
        data[row * width..row * width + seq.len()].copy_from_slice(seq);
    }
    (data, width)
}

/// `[batch, max_len]` float mask with ones for positions `< length`.
pub fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; lengths.len() * max_len];
    for (row, &len) in lengths.iter().enumerate() {
        for v in &mut data[row * max_len..row * max_len + len.min(max_len)] {
            *v = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (lengths.len(), max_len), device)?)
}

fn to_ids(values: &[i64]) -> Result<Vec<u32>> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v)
                .map_err(|_| SeqcraftError::Shape(format!("token id {v} is not a valid u32 id")))
        })
        .collect()
}

/// Next-token prediction batch: `inputs = seq[:-1]`, `targets = seq[1:]`.
#[derive(Debug, Clone)]
pub struct SentenceBatch {
    /// `[batch, steps]` u32 input ids.
    pub inputs: Tensor,
    /// `[batch, steps]` u32 target ids.
    pub targets: Tensor,
    /// `[batch, steps]` f32 validity mask.
    pub mask: Tensor,
    /// Valid steps per row (`len - 1`).
    pub lengths: Vec<usize>,
}

impl SentenceBatch {
    pub fn from_records(records: &[SentenceRecord], device: &Device) -> Result<Self> {
        if records.is_empty() {
            return Err(SeqcraftError::EmptyBatch("no sentence records".into()));
        }
        let mut seqs = Vec::with_capacity(records.len());
        for record in records {
            let len = (record.len.max(0) as usize).min(record.content.len());
            seqs.push(to_ids(&record.content[..len])?);
        }
        let views: Vec<&[u32]> = seqs.iter().map(Vec::as_slice).collect();
        let (padded, width) = pad_batch(&views);
        if width < 2 {
            return Err(SeqcraftError::EmptyBatch(
                "every sentence in the batch is shorter than two tokens".into(),
            ));
        }

        let batch = records.len();
        let steps = width - 1;
        let full = Tensor::from_vec(padded, (batch, width), device)?;
        let inputs = full.narrow(1, 0, steps)?;
        let targets = full.narrow(1, 1, steps)?;
        let lengths: Vec<usize> = seqs.iter().map(|s| s.len().saturating_sub(1)).collect();
        let mask = sequence_mask(&lengths, steps, device)?;

        Ok(Self {
            inputs,
            targets,
            mask,
            lengths,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn steps(&self) -> usize {
        self.inputs.dims()[1]
    }
}

/// Video/caption batch for the captioner, captions padded to a fixed length.
#[derive(Debug, Clone)]
pub struct CaptionBatch {
    /// `[batch, frames, dim]` video features.
    pub video: Tensor,
    /// `[batch, max_caption_length - 1]` decoder inputs (starting with BOS).
    pub inputs: Tensor,
    /// `[batch, max_caption_length - 1]` decoder targets (ending with EOS).
    pub targets: Tensor,
    /// `[batch, max_caption_length - 1]` validity mask.
    pub mask: Tensor,
}

impl CaptionBatch {
    pub fn from_records(
        records: &[CaptionRecord],
        frames: usize,
        dim: usize,
        max_caption_length: usize,
        device: &Device,
    ) -> Result<Self> {
        if records.is_empty() {
            return Err(SeqcraftError::EmptyBatch("no caption records".into()));
        }
        if max_caption_length < 2 {
            return Err(SeqcraftError::InvalidConfig(
                "max caption length must be at least 2".into(),
            ));
        }
        let batch = records.len();
        let steps = max_caption_length - 1;

        let mut video = Vec::with_capacity(batch * frames * dim);
        let mut captions = vec![0u32; batch * max_caption_length];
        let mut lengths = Vec::with_capacity(batch);
        for (row, record) in records.iter().enumerate() {
            if record.video.len() != frames * dim {
                return Err(SeqcraftError::Shape(format!(
                    "video has {} values, expected {frames} x {dim}",
                    record.video.len()
                )));
            }
            video.extend_from_slice(&record.video);

            let len = (record.caption_length.max(0) as usize)
                .min(record.caption.len())
                .min(max_caption_length);
            if len < record.caption.len().min(max_caption_length) {
                warn!(row, len, "caption longer than its declared length");
            }
            let ids = to_ids(&record.caption[..len])?;
            captions[row * max_caption_length..row * max_caption_length + len]
                .copy_from_slice(&ids);
            lengths.push(len.saturating_sub(1));
        }

        let video = Tensor::from_vec(video, (batch, frames, dim), device)?;
        let full = Tensor::from_vec(captions, (batch, max_caption_length), device)?;
        Ok(Self {
            video,
            inputs: full.narrow(1, 0, steps)?,
            targets: full.narrow(1, 1, steps)?,
            mask: sequence_mask(&lengths, steps, device)?,
        })
    }
}

/// Produces items on a background thread into a bounded channel.
///
/// The producer stops after its first error, which is handed to the consumer.
/// Dropping the prefetcher disconnects the channel and joins the thread.
pub struct Prefetcher<T: Send + 'static> {
    receiver: Option<Receiver<Result<T>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Prefetcher<T> {
    pub fn spawn<F>(capacity: usize, mut produce: F) -> Self
    where
        F: FnMut() -> Result<T> + Send + 'static,
    {
        let (sender, receiver): (SyncSender<Result<T>>, _) = sync_channel(capacity.max(1));
        let handle = std::thread::spawn(move || {
            loop {
                let item = produce();
                let failed = item.is_err();
                if sender.send(item).is_err() || failed {
                    break;
                }
            }
        });
        Self {
            receiver: Some(receiver),
            handle: Some(handle),
        }
    }

    /// Block until the next item is ready.
    pub fn next(&mut self) -> Result<T> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| SeqcraftError::EmptyBatch("prefetcher closed".into()))?;
        receiver
            .recv()
            .map_err(|_| SeqcraftError::EmptyBatch("prefetch thread exited".into()))?
    }
}

impl<T: Send + 'static> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordWriter;

    fn write_sentences(path: &std::path::Path, sentences: &[&[i64]]) {
        let mut writer = RecordWriter::create(path).unwrap();
        for s in sentences {
            writer.write(&SentenceRecord::new(s.to_vec()).encode()).unwrap();
        }
    }

    #[test]
    fn test_pad_batch() {
        let a = [1u32, 2, 3];
        let b = [4u32];
        let (data, width) = pad_batch(&[&a, &b]);
        assert_eq!(width, 3);
        assert_eq!(data, vec![1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_sequence_mask() {
        let device = Device::Cpu;
        let mask = sequence_mask(&[2, 0, 5], 3, &device).unwrap();
        assert_eq!(
            mask.to_vec2::<f32>().unwrap(),
            vec![vec![1., 1., 0.], vec![0., 0., 0.], vec![1., 1., 1.]]
        );
    }

    #[test]
    fn test_sentence_batch_shifts_targets() {
        let device = Device::Cpu;
        let records = vec![
            SentenceRecord::new(vec![5, 6, 7, 8]),
            SentenceRecord::new(vec![9, 10]),
        ];
        let batch = SentenceBatch::from_records(&records, &device).unwrap();
        assert_eq!(batch.steps(), 3);
        assert_eq!(batch.lengths, vec![3, 1]);
        assert_eq!(
            batch.inputs.to_vec2::<u32>().unwrap(),
            vec![vec![5, 6, 7], vec![9, 10, 0]]
        );
        assert_eq!(
            batch.targets.to_vec2::<u32>().unwrap(),
            vec![vec![6, 7, 8], vec![10, 0, 0]]
        );
        assert_eq!(
            batch.mask.to_vec2::<f32>().unwrap(),
            vec![vec![1., 1., 1.], vec![1., 0., 0.]]
        );
    }

    #[test]
    fn test_sentence_batch_rejects_single_tokens() {
        let device = Device::Cpu;
        let records = vec![SentenceRecord::new(vec![1])];
        assert!(SentenceBatch::from_records(&records, &device).is_err());
    }

    #[test]
    fn test_caption_batch_pads_to_max_length() {
        let device = Device::Cpu;
        let records = vec![CaptionRecord::new(vec![0.5; 4], vec![1, 7, 2])];
        let batch = CaptionBatch::from_records(&records, 2, 2, 5, &device).unwrap();
        assert_eq!(batch.video.dims(), &[1, 2, 2]);
        assert_eq!(batch.inputs.to_vec2::<u32>().unwrap(), vec![vec![1, 7, 2, 0]]);
        assert_eq!(batch.targets.to_vec2::<u32>().unwrap(), vec![vec![7, 2, 0, 0]]);
        assert_eq!(
            batch.mask.to_vec2::<f32>().unwrap(),
            vec![vec![1., 1., 0., 0.]]
        );
    }

    #[test]
    fn test_file_queue_wraps_around() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tfr");
        let b = dir.path().join("b.tfr");
        write_sentences(&a, &[&[1, 2], &[3, 4]]);
        write_sentences(&b, &[&[5, 6]]);

        let mut queue = FileQueue::new(vec![a, b]).unwrap();
        let firsts: Vec<i64> = queue
            .take_records(5, SentenceRecord::decode)
            .unwrap()
            .into_iter()
            .map(|r| r.content[0])
            .collect();
        assert_eq!(firsts, vec![1, 3, 5, 1, 3]);
    }

    #[test]
    fn test_file_queue_skips_empty_files_and_detects_all_empty() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.tfr");
        let full = dir.path().join("full.tfr");
        write_sentences(&empty, &[]);
        write_sentences(&full, &[&[1, 2]]);

        let mut queue = FileQueue::new(vec![empty.clone(), full]).unwrap();
        assert_eq!(SentenceRecord::decode(&queue.next_record().unwrap()).unwrap().content, vec![1, 2]);
        assert!(queue.next_record().is_ok());

        let mut only_empty = FileQueue::new(vec![empty]).unwrap();
        assert!(matches!(
            only_empty.next_record(),
            Err(SeqcraftError::EmptyBatch(_))
        ));
    }

    #[test]
    fn test_shuffled_queue_visits_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..4)
            .map(|i| {
                let path = dir.path().join(format!("{i}.tfr"));
                write_sentences(&path, &[&[i, i]]);
                path
            })
            .collect();
        let mut queue = FileQueue::shuffled(files, 7).unwrap();
        let mut seen: Vec<i64> = queue
            .take_records(4, SentenceRecord::decode)
            .unwrap()
            .into_iter()
            .map(|r| r.content[0])
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_prefetcher_delivers_in_order_and_stops_on_error() {
        let mut n = 0;
        let mut prefetcher = Prefetcher::spawn(2, move || {
            n += 1;
            if n > 3 {
                Err(SeqcraftError::EmptyBatch("done".into()))
            } else {
                Ok(n)
            }
        });
        assert_eq!(prefetcher.next().unwrap(), 1);
        assert_eq!(prefetcher.next().unwrap(), 2);
        assert_eq!(prefetcher.next().unwrap(), 3);
        assert!(prefetcher.next().is_err());
        assert!(prefetcher.next().is_err());
    }
}
