//! Conversions from raw corpora into record files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use candle_core::{DType, Tensor};
use serde::Deserialize;
use seqcraft_core::data::{BOS, EOS, SPECIAL_TOKENS, UNK};
use seqcraft_core::{CaptionRecord, RecordWriter, SentenceRecord, VideoRecord, Vocabulary};
use tracing::{debug, info, warn};

use crate::tokenize::WordTokenizer;

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

fn resolve(base: &Path, entry: &str) -> PathBuf {
    let path = Path::new(entry);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Convert every text file named in `file_list` into a sentence record file.
///
/// Each line becomes one record; words missing from `vocab` map to id 0.
/// Outputs are named after the input without its extension, and their names
/// are listed in `out_dir/file_list.txt`.
pub fn convert_sentences(file_list: &Path, vocab: &Vocabulary, out_dir: &Path) -> Result<usize> {
    let base = file_list.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(out_dir)?;
    let mut names = Vec::new();
    let mut total = 0;
    for entry in read_lines(file_list)? {
        let input = resolve(base, &entry);
        let Some(stem) = input.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            bail!("cannot name output for {}", input.display());
        };
        let bytes = fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
        let text = String::from_utf8_lossy(&bytes);

        let mut writer = RecordWriter::create(out_dir.join(&stem))?;
        for line in text.lines() {
            writer.write(&SentenceRecord::new(vocab.encode_line(line)).encode())?;
        }
        writer.flush()?;
        info!(input = %input.display(), records = writer.written(), "converted file");
        total += writer.written();
        names.push(stem);
    }
    let mut listing = names.join("\n");
    listing.push('\n');
    fs::write(out_dir.join("file_list.txt"), listing)?;
    Ok(total)
}

#[derive(Debug, Deserialize)]
struct QuestionRow {
    id: String,
    question: String,
    #[serde(rename = "a)")]
    a: String,
    #[serde(rename = "b)")]
    b: String,
    #[serde(rename = "c)")]
    c: String,
    #[serde(rename = "d)")]
    d: String,
    #[serde(rename = "e)")]
    e: String,
}

/// Expand each multiple-choice question into its five filled-in sentences.
///
/// Candidates are written in option order, five records per question.
pub fn convert_questions(
    questions_csv: &Path,
    vocab: &Vocabulary,
    tokenizer: &WordTokenizer,
    out_path: &Path,
) -> Result<usize> {
    let mut reader = csv::Reader::from_path(questions_csv)
        .with_context(|| format!("failed to open {}", questions_csv.display()))?;
    let mut writer = RecordWriter::create(out_path)?;
    let mut questions = 0;
    for row in reader.deserialize() {
        let row: QuestionRow = row?;
        for option in [&row.a, &row.b, &row.c, &row.d, &row.e] {
            let sentence = match tokenizer.fill_blank(&row.question, option) {
                Some(s) => s,
                None => {
                    warn!(id = %row.id, "question has no blank; appending the option");
                    format!("{} {}", row.question, option)
                }
            };
            let ids: Vec<i64> = tokenizer
                .tokenize(&sentence)
                .iter()
                .map(|w| i64::from(vocab.id_or(w, 0)))
                .collect();
            writer.write(&SentenceRecord::new(ids).encode())?;
        }
        questions += 1;
    }
    writer.flush()?;
    info!(questions, path = %out_path.display(), "converted questions");
    Ok(questions)
}

#[derive(Debug, Deserialize)]
struct CaptionLabel {
    id: String,
    caption: Vec<String>,
}

/// Load `<feat_dir>/<id>.npy` as a flat f32 vector with its `(frames, dim)` shape.
fn load_features(feat_dir: &Path, id: &str) -> Result<(Vec<f32>, (usize, usize))> {
    let path = feat_dir.join(format!("{id}.npy"));
    let features = Tensor::read_npy(&path)
        .with_context(|| format!("failed to read features {}", path.display()))?
        .to_dtype(DType::F32)?;
    let shape = features.dims2()?;
    Ok((features.flatten_all()?.to_vec1::<f32>()?, shape))
}

fn check_shape(expected: &mut Option<(usize, usize)>, shape: (usize, usize), id: &str) -> Result<()> {
    match *expected {
        Some(e) if e != shape => bail!("features of {id} are {shape:?}, expected {e:?}"),
        Some(_) => Ok(()),
        None => {
            *expected = Some(shape);
            Ok(())
        }
    }
}

/// Caption vocabulary: special tokens, then words seen at least `min_count`
/// times, most frequent first.
pub fn build_caption_vocab<'a>(
    captions: impl IntoIterator<Item = &'a [String]>,
    min_count: usize,
) -> Vocabulary {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for caption in captions {
        for word in caption {
            *counts.entry(word.as_str()).or_default() += 1;
        }
    }
    let mut words: Vec<(&str, usize)> = counts
        .into_iter()
        .filter(|&(w, c)| c >= min_count && !SPECIAL_TOKENS.contains(&w))
        .collect();
    words.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    Vocabulary::from_words(
        SPECIAL_TOKENS
            .iter()
            .map(|s| s.to_string())
            .chain(words.into_iter().map(|(w, _)| w.to_string())),
    )
}

/// Room for `<BOS>` and `<EOS>`.
pub const MIN_CAPTION_LENGTH: usize = 2;

/// `<BOS> words.. <EOS>` ids, keeping at most `max_len` ids in total.
pub fn caption_ids(words: &[String], vocab: &Vocabulary, max_len: usize) -> Vec<i64> {
    let body = max_len.saturating_sub(2);
    std::iter::once(BOS)
        .chain(words.iter().take(body).map(|w| vocab.id_or(w, UNK)))
        .chain(std::iter::once(EOS))
        .map(i64::from)
        .collect()
}

/// Summary of a caption conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionSummary {
    pub videos: usize,
    pub records: usize,
    pub vocab_size: usize,
    pub frames: usize,
    pub dim: usize,
}

/// Convert labelled videos into caption records and write the caption vocabulary.
pub fn convert_captions(
    labels_json: &Path,
    feat_dir: &Path,
    tokenizer: &WordTokenizer,
    max_caption_length: usize,
    min_count: usize,
    out_path: &Path,
    vocab_out: &Path,
) -> Result<CaptionSummary> {
    if max_caption_length < MIN_CAPTION_LENGTH {
        bail!(
            "max caption length must be at least {MIN_CAPTION_LENGTH}, got {max_caption_length}"
        );
    }
    let text = fs::read_to_string(labels_json)
        .with_context(|| format!("failed to read labels {}", labels_json.display()))?;
    let labels: Vec<CaptionLabel> = serde_json::from_str(&text)?;
    let tokenized: Vec<Vec<Vec<String>>> = labels
        .iter()
        .map(|l| l.caption.iter().map(|c| tokenizer.tokenize(c)).collect())
        .collect();
    let vocab = build_caption_vocab(tokenized.iter().flatten().map(Vec::as_slice), min_count);
    vocab.save_json(vocab_out)?;
    info!(words = vocab.len(), path = %vocab_out.display(), "wrote caption vocabulary");

    let mut writer = RecordWriter::create(out_path)?;
    let mut shape = None;
    for (label, captions) in labels.iter().zip(&tokenized) {
        let (video, s) = load_features(feat_dir, &label.id)?;
        check_shape(&mut shape, s, &label.id)?;
        for words in captions {
            let ids = caption_ids(words, &vocab, max_caption_length);
            writer.write(&CaptionRecord::new(video.clone(), ids).encode())?;
        }
        debug!(id = %label.id, captions = captions.len(), "converted video");
    }
    writer.flush()?;
    let (frames, dim) = shape.unwrap_or_default();
    Ok(CaptionSummary {
        videos: labels.len(),
        records: writer.written(),
        vocab_size: vocab.len(),
        frames,
        dim,
    })
}

/// Convert the videos named in `id_list`, in order, into video records.
pub fn convert_videos(id_list: &Path, feat_dir: &Path, out_path: &Path) -> Result<usize> {
    let mut writer = RecordWriter::create(out_path)?;
    let mut shape = None;
    for id in read_lines(id_list)? {
        let (video, s) = load_features(feat_dir, &id)?;
        check_shape(&mut shape, s, &id)?;
        writer.write(&VideoRecord { video }.encode())?;
    }
    writer.flush()?;
    info!(videos = writer.written(), path = %out_path.display(), "converted videos");
    Ok(writer.written())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use seqcraft_core::RecordReader;

    fn read_all(path: &Path) -> Vec<Vec<u8>> {
        RecordReader::open(path)
            .unwrap()
            .collect::<seqcraft_core::Result<Vec<_>>>()
            .unwrap()
    }

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_owned).collect()
    }

    #[test]
    fn test_sentences_use_zero_for_unknown_words() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = Vocabulary::from_words(["<unk>", "the", "cat", "sat"]);
        fs::write(dir.path().join("book1.txt"), "the cat sat\nthe dog sat\n").unwrap();
        fs::write(dir.path().join("list.txt"), "book1.txt\n").unwrap();
        let out = dir.path().join("out");

        let n = convert_sentences(&dir.path().join("list.txt"), &vocab, &out).unwrap();
        assert_eq!(n, 2);
        let records: Vec<SentenceRecord> = read_all(&out.join("book1"))
            .iter()
            .map(|b| SentenceRecord::decode(b).unwrap())
            .collect();
        assert_eq!(records[0].content, vec![1, 2, 3]);
        assert_eq!(records[1].content, vec![1, 0, 3]);
        assert_eq!(records[1].len, 3);
        assert_eq!(fs::read_to_string(out.join("file_list.txt")).unwrap(), "book1\n");
    }

    #[test]
    fn test_questions_expand_to_five_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("testing_data.csv");
        fs::write(
            &csv_path,
            "id,question,a),b),c),d),e)\n1,The cat _____ down.,sat,ran,is,dog,the\n",
        )
        .unwrap();
        let vocab = Vocabulary::from_words(["<unk>", "the", "cat", "sat", "down", "ran"]);
        let out = dir.path().join("testing_data.tfr");

        let tokenizer = WordTokenizer::new().unwrap();
        assert_eq!(convert_questions(&csv_path, &vocab, &tokenizer, &out).unwrap(), 1);
        let records: Vec<SentenceRecord> = read_all(&out)
            .iter()
            .map(|b| SentenceRecord::decode(b).unwrap())
            .collect();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].content, vec![1, 2, 3, 4]);
        assert_eq!(records[1].content, vec![1, 2, 5, 4]);
        assert_eq!(records[2].content, vec![1, 2, 0, 4]);
    }

    #[test]
    fn test_caption_vocab_orders_by_frequency() {
        let captions = [words("a man runs"), words("a dog runs"), words("a cat")];
        let vocab = build_caption_vocab(captions.iter().map(Vec::as_slice), 2);
        assert_eq!(vocab.len(), 6);
        assert_eq!(vocab.id("<PAD>"), Some(0));
        assert_eq!(vocab.id("<UNK>"), Some(3));
        assert_eq!(vocab.id("a"), Some(4));
        assert_eq!(vocab.id("runs"), Some(5));
        assert_eq!(vocab.id("dog"), None);
    }

    #[test]
    fn test_caption_ids_are_wrapped_and_truncated() {
        let vocab = Vocabulary::from_words(["<PAD>", "<BOS>", "<EOS>", "<UNK>", "a", "man"]);
        assert_eq!(caption_ids(&words("a man"), &vocab, 10), vec![1, 4, 5, 2]);
        assert_eq!(caption_ids(&words("a tall man"), &vocab, 4), vec![1, 4, 3, 2]);
    }

    #[test]
    fn test_captions_and_videos() {
        let dir = tempfile::tempdir().unwrap();
        let feats = dir.path().join("feat");
        fs::create_dir_all(&feats).unwrap();
        for (i, id) in ["vid1", "vid2"].iter().enumerate() {
            Tensor::full(i as f32, (2, 3), &Device::Cpu)
                .unwrap()
                .write_npy(feats.join(format!("{id}.npy")))
                .unwrap();
        }
        let labels = dir.path().join("labels.json");
        fs::write(
            &labels,
            r#"[{"id": "vid1", "caption": ["A man walks.", "A man runs."]},
                {"id": "vid2", "caption": ["A dog runs."]}]"#,
        )
        .unwrap();

        let tokenizer = WordTokenizer::new().unwrap();
        let out = dir.path().join("train.tfr");
        let vocab_path = dir.path().join("vocab.json");
        let summary =
            convert_captions(&labels, &feats, &tokenizer, 20, 1, &out, &vocab_path).unwrap();
        assert_eq!(summary.videos, 2);
        assert_eq!(summary.records, 3);
        assert_eq!((summary.frames, summary.dim), (2, 3));

        let vocab = Vocabulary::from_json_file(&vocab_path).unwrap();
        assert_eq!(vocab.len(), summary.vocab_size);
        let first = CaptionRecord::decode(&read_all(&out)[0], 2, 3).unwrap();
        let decoded: Vec<u32> = first.caption.iter().map(|&id| id as u32).collect();
        assert_eq!(vocab.decode_caption(&decoded[1..]), words("a man walks"));

        let ids = dir.path().join("ids.txt");
        fs::write(&ids, "vid2\nvid1\n").unwrap();
        let videos = dir.path().join("test.tfr");
        assert_eq!(convert_videos(&ids, &feats, &videos).unwrap(), 2);
        let first = VideoRecord::decode(&read_all(&videos)[0], 2, 3).unwrap();
        assert_eq!(first.video, vec![1.0; 6]);
    }

    #[test]
    fn test_captions_reject_length_without_room_for_markers() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("labels.json");
        fs::write(&labels, "[]").unwrap();
        let tokenizer = WordTokenizer::new().unwrap();
        let out = dir.path().join("train.tfr");
        let err = convert_captions(
            &labels,
            dir.path(),
            &tokenizer,
            1,
            1,
            &out,
            &dir.path().join("vocab.json"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least 2"));
        assert!(!out.exists());
    }

    #[test]
    fn test_mismatched_feature_shapes() {
        let dir = tempfile::tempdir().unwrap();
        Tensor::zeros((2, 3), DType::F32, &Device::Cpu)
            .unwrap()
            .write_npy(dir.path().join("a.npy"))
            .unwrap();
        Tensor::zeros((3, 3), DType::F32, &Device::Cpu)
            .unwrap()
            .write_npy(dir.path().join("b.npy"))
            .unwrap();
        let ids = dir.path().join("ids.txt");
        fs::write(&ids, "a\nb\n").unwrap();
        assert!(convert_videos(&ids, dir.path(), &dir.path().join("out.tfr")).is_err());
    }
}
