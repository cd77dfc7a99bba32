//! # TFRecord framing
//!
//! Length-prefixed, checksummed record files. Each record is laid out as
//! `u64 length | u32 masked crc(length) | payload | u32 masked crc(payload)`,
//! all little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SeqcraftError};

const MASK_DELTA: u32 = 0xa282_ead8;

/// Masked CRC-32C as used by TFRecord files.
pub fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Appends framed records to a file.
pub struct RecordWriter {
    inner: BufWriter<File>,
    written: usize,
}

impl RecordWriter {
    /// Create (or truncate) a record file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: BufWriter::new(file),
            written: 0,
        })
    }

    /// Write one framed record.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        let len = (payload.len() as u64).to_le_bytes();
        self.inner.write_all(&len)?;
        self.inner.write_all(&masked_crc(&len).to_le_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.write_all(&masked_crc(payload).to_le_bytes())?;
        self.written += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush buffered bytes to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        let _ = self.inner.flush();
    }
}

/// Sequential reader over the records of one file.
pub struct RecordReader<R = BufReader<File>> {
    inner: R,
    path: PathBuf,
    done: bool,
}

impl RecordReader {
    /// Open a record file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            inner: BufReader::new(file),
            path,
            done: false,
        })
    }
}

impl<R: Read> RecordReader<R> {
    /// Wrap an arbitrary reader; `label` is used in error messages.
    pub fn from_reader(inner: R, label: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: label.into(),
            done: false,
        }
    }

    fn truncated(&self) -> SeqcraftError {
        SeqcraftError::TruncatedRecord {
            path: self.path.display().to_string(),
        }
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 12];
        let filled = read_full(&mut self.inner, &mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(self.truncated());
        }

        let (len_bytes, crc_bytes) = header.split_at(8);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if masked_crc(len_bytes) != expected {
            return Err(SeqcraftError::CorruptRecord {
                path: self.path.display().to_string(),
                what: "length",
            });
        }
        let mut len_arr = [0u8; 8];
        len_arr.copy_from_slice(len_bytes);
        let len = u64::from_le_bytes(len_arr) as usize;

        let mut payload = vec![0u8; len];
        if read_full(&mut self.inner, &mut payload)? < len {
            return Err(self.truncated());
        }
        let mut footer = [0u8; 4];
        if read_full(&mut self.inner, &mut footer)? < footer.len() {
            return Err(self.truncated());
        }
        if masked_crc(&payload) != u32::from_le_bytes(footer) {
            return Err(SeqcraftError::CorruptRecord {
                path: self.path.display().to_string(),
                what: "payload",
            });
        }
        Ok(Some(payload))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the reader allows; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(payloads: &[&[u8]]) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.tfr");
        let mut writer = RecordWriter::create(&path).unwrap();
        for p in payloads {
            writer.write(p).unwrap();
        }
        writer.flush().unwrap();
        std::fs::read(&path).unwrap()
    }

    #[test]
    fn test_masked_crc_known_value() {
        // crc32c("123456789") = 0xe3069283
        let crc = 0xe306_9283u32;
        let masked = ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA);
        assert_eq!(masked_crc(b"123456789"), masked);
    }

    #[test]
    fn test_reads_back_records_in_order() {
        let bytes = frame(&[b"first", b"", b"third record"]);
        assert_eq!(bytes.len(), 3 * 16 + 5 + 12);

        let records: Vec<Vec<u8>> = RecordReader::from_reader(Cursor::new(bytes), "mem")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records, vec![b"first".to_vec(), vec![], b"third record".to_vec()]);
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = frame(&[b"payload"]);
        bytes.truncate(bytes.len() - 6);
        let mut reader = RecordReader::from_reader(Cursor::new(bytes), "mem");
        assert!(matches!(
            reader.read_record(),
            Err(SeqcraftError::TruncatedRecord { .. })
        ));
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let mut bytes = frame(&[b"payload"]);
        bytes[13] ^= 0xff;
        let mut reader = RecordReader::from_reader(Cursor::new(bytes), "mem");
        assert!(matches!(
            reader.read_record(),
            Err(SeqcraftError::CorruptRecord { what: "payload", .. })
        ));
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut bytes = frame(&[b"a", b"b"]);
        bytes[0] ^= 0x01;
        let mut reader = RecordReader::from_reader(Cursor::new(bytes), "mem");
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}
