//! # Example codec
//!
//! Minimal protobuf wire codec for `tf.train.Example` messages:
//!
//! ```text
//! Example  { Features features = 1; }
//! Features { map<string, Feature> feature = 1; }
//! Feature  { oneof { BytesList = 1; FloatList = 2; Int64List = 3; } }
//! ```
//!
//! Numeric lists are written packed and read in either packed or unpacked form.

use std::collections::BTreeMap;

use crate::error::{Result, SeqcraftError};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// One typed feature list.
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    /// Raw byte strings.
    Bytes(Vec<Vec<u8>>),
    /// 32-bit floats.
    Float(Vec<f32>),
    /// 64-bit signed integers.
    Int64(Vec<i64>),
}

/// A feature map keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Example {
    features: BTreeMap<String, Feature>,
}

impl Example {
    /// Create an empty example.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a feature.
    pub fn insert(&mut self, key: impl Into<String>, feature: Feature) -> &mut Self {
        self.features.insert(key.into(), feature);
        self
    }

    /// Look up a feature by key.
    pub fn get(&self, key: &str) -> Option<&Feature> {
        self.features.get(key)
    }

    /// Iterate features in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Feature)> {
        self.features.iter()
    }

    /// Integer list under `key`.
    pub fn int64_list(&self, key: &str) -> Result<&[i64]> {
        match self.features.get(key) {
            Some(Feature::Int64(values)) => Ok(values),
            _ => Err(SeqcraftError::MissingFeature { key: key.into() }),
        }
    }

    /// Float list under `key`.
    pub fn float_list(&self, key: &str) -> Result<&[f32]> {
        match self.features.get(key) {
            Some(Feature::Float(values)) => Ok(values),
            _ => Err(SeqcraftError::MissingFeature { key: key.into() }),
        }
    }

    /// Serialize to protobuf bytes. Keys are emitted in sorted order.
    pub fn encode(&self) -> Vec<u8> {
        let mut features = Vec::new();
        for (key, feature) in &self.features {
            let mut entry = Vec::new();
            put_len_field(&mut entry, 1, key.as_bytes());
            put_len_field(&mut entry, 2, &encode_feature(feature));
            put_len_field(&mut features, 1, &entry);
        }
        let mut out = Vec::with_capacity(features.len() + 8);
        put_len_field(&mut out, 1, &features);
        out
    }

    /// Parse protobuf bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut example = Example::new();
        let mut cursor = Cursor::new(bytes);
        while let Some((field, wire)) = cursor.tag()? {
            if field == 1 && wire == WIRE_LEN {
                let features = cursor.len_delimited()?;
                decode_features(features, &mut example)?;
            } else {
                cursor.skip(wire)?;
            }
        }
        Ok(example)
    }
}

fn encode_feature(feature: &Feature) -> Vec<u8> {
    let mut list = Vec::new();
    let field = match feature {
        Feature::Bytes(values) => {
            for v in values {
                put_len_field(&mut list, 1, v);
            }
            1
        }
        Feature::Float(values) => {
            let mut packed = Vec::with_capacity(values.len() * 4);
            for v in values {
                packed.extend_from_slice(&v.to_le_bytes());
            }
            put_len_field(&mut list, 1, &packed);
            2
        }
        Feature::Int64(values) => {
            let mut packed = Vec::new();
            for v in values {
                put_varint(&mut packed, *v as u64);
            }
            put_len_field(&mut list, 1, &packed);
            3
        }
    };
    let mut out = Vec::with_capacity(list.len() + 4);
    put_len_field(&mut out, field, &list);
    out
}

fn decode_features(bytes: &[u8], example: &mut Example) -> Result<()> {
    let mut cursor = Cursor::new(bytes);
    while let Some((field, wire)) = cursor.tag()? {
        if field != 1 || wire != WIRE_LEN {
            cursor.skip(wire)?;
            continue;
        }
        let entry = cursor.len_delimited()?;
        let mut entry_cursor = Cursor::new(entry);
        let mut key = String::new();
        let mut value = None;
        while let Some((field, wire)) = entry_cursor.tag()? {
            match (field, wire) {
                (1, WIRE_LEN) => {
                    key = String::from_utf8(entry_cursor.len_delimited()?.to_vec())
                        .map_err(|e| SeqcraftError::MalformedExample(e.to_string()))?;
                }
                (2, WIRE_LEN) => value = Some(decode_feature(entry_cursor.len_delimited()?)?),
                _ => entry_cursor.skip(wire)?,
            }
        }
        // A feature with no oneof set decodes as an empty byte list.
        example
            .features
            .insert(key, value.unwrap_or(Feature::Bytes(Vec::new())));
    }
    Ok(())
}

fn decode_feature(bytes: &[u8]) -> Result<Feature> {
    let mut cursor = Cursor::new(bytes);
    let mut feature = Feature::Bytes(Vec::new());
    while let Some((field, wire)) = cursor.tag()? {
        if wire != WIRE_LEN {
            cursor.skip(wire)?;
            continue;
        }
        let list = cursor.len_delimited()?;
        feature = match field {
            1 => Feature::Bytes(decode_bytes_list(list)?),
            2 => Feature::Float(decode_float_list(list)?),
            3 => Feature::Int64(decode_int64_list(list)?),
            _ => feature,
        };
    }
    Ok(feature)
}

fn decode_bytes_list(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut cursor = Cursor::new(bytes);
    let mut values = Vec::new();
    while let Some((field, wire)) = cursor.tag()? {
        if field == 1 && wire == WIRE_LEN {
            values.push(cursor.len_delimited()?.to_vec());
        } else {
            cursor.skip(wire)?;
        }
    }
    Ok(values)
}

fn decode_float_list(bytes: &[u8]) -> Result<Vec<f32>> {
    let mut cursor = Cursor::new(bytes);
    let mut values = Vec::new();
    while let Some((field, wire)) = cursor.tag()? {
        match (field, wire) {
            (1, WIRE_LEN) => {
                let packed = cursor.len_delimited()?;
                if packed.len() % 4 != 0 {
                    return Err(SeqcraftError::MalformedExample(
                        "packed float list length not a multiple of 4".into(),
                    ));
                }
                values.extend(
                    packed
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }
            (1, WIRE_FIXED32) => values.push(f32::from_le_bytes(cursor.fixed32()?)),
            _ => cursor.skip(wire)?,
        }
    }
    Ok(values)
}

fn decode_int64_list(bytes: &[u8]) -> Result<Vec<i64>> {
    let mut cursor = Cursor::new(bytes);
    let mut values = Vec::new();
    while let Some((field, wire)) = cursor.tag()? {
        match (field, wire) {
            (1, WIRE_LEN) => {
                let mut packed = Cursor::new(cursor.len_delimited()?);
                while !packed.is_empty() {
                    values.push(packed.varint()? as i64);
                }
            }
            (1, WIRE_VARINT) => values.push(cursor.varint()? as i64),
            _ => cursor.skip(wire)?,
        }
    }
    Ok(values)
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn put_len_field(out: &mut Vec<u8>, field: u32, payload: &[u8]) {
    put_varint(out, ((field as u64) << 3) | WIRE_LEN as u64);
    put_varint(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn malformed(msg: &str) -> SeqcraftError {
        SeqcraftError::MalformedExample(msg.to_string())
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| Self::malformed("varint runs past end of buffer"))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Self::malformed("varint longer than 10 bytes"))
    }

    fn tag(&mut self) -> Result<Option<(u32, u8)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let tag = self.varint()?;
        Ok(Some(((tag >> 3) as u32, (tag & 0x7) as u8)))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Self::malformed("field runs past end of buffer"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn len_delimited(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()? as usize;
        self.take(len)
    }

    fn fixed32(&mut self) -> Result<[u8; 4]> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    fn skip(&mut self, wire: u8) -> Result<()> {
        match wire {
            WIRE_VARINT => {
                self.varint()?;
            }
            WIRE_FIXED64 => {
                self.take(8)?;
            }
            WIRE_LEN => {
                self.len_delimited()?;
            }
            WIRE_FIXED32 => {
                self.take(4)?;
            }
            other => {
                return Err(SeqcraftError::MalformedExample(format!(
                    "unsupported wire type {other}"
                )));
            }
        }
        Ok(())
    }
}
