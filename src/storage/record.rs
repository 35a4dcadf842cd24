// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Batch format of the records inside one log entry:
//!
//! ```text
//! | varint length | position: i64 | key: i64 | value ... | varint length | ...
//! ```
//!
//! `length` counts position, key and value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::{AppError, AppResult};

const RECORD_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecord {
    pub position: i64,
    pub key: i64,
    pub value: Bytes,
}

impl LoggedRecord {
    /// Bytes a record with a value of `value_len` bytes takes inside a batch.
    pub fn framed_size(value_len: usize) -> usize {
        let length = (RECORD_HEADER_SIZE + value_len) as u64;
        length.required_space() + RECORD_HEADER_SIZE + value_len
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        let length = (RECORD_HEADER_SIZE + self.value.len()) as u64;
        buf.put_slice(&length.encode_var_vec());
        buf.put_i64(self.position);
        buf.put_i64(self.key);
        buf.put_slice(&self.value);
    }
}

/// Encodes `(key, value)` pairs as consecutive records starting at `first_position`.
pub fn encode_batch(first_position: i64, records: &[(i64, Bytes)]) -> Bytes {
    let size = records
        .iter()
        .map(|(_, value)| LoggedRecord::framed_size(value.len()))
        .sum();
    let mut buf = BytesMut::with_capacity(size);
    for (offset, (key, value)) in records.iter().enumerate() {
        LoggedRecord {
            position: first_position + offset as i64,
            key: *key,
            value: value.clone(),
        }
        .write_to(&mut buf);
    }
    buf.freeze()
}

/// Iterates the records of a batch. Stops after the first malformed record.
#[derive(Debug)]
pub struct RecordIter {
    data: Bytes,
    failed: bool,
}

impl RecordIter {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            failed: false,
        }
    }

    fn decode_next(&mut self) -> AppResult<LoggedRecord> {
        let (length, varint_size) = u64::decode_var(&self.data)
            .ok_or_else(|| AppError::CorruptEntry("truncated record length".to_string()))?;
        let length = length as usize;
        if length < RECORD_HEADER_SIZE || self.data.len() < varint_size + length {
            return Err(AppError::CorruptEntry(format!(
                "record length {} does not fit the {} remaining bytes",
                length,
                self.data.len() - varint_size
            )));
        }
        self.data.advance(varint_size);
        let mut record = self.data.split_to(length);
        let position = record.get_i64();
        let key = record.get_i64();
        Ok(LoggedRecord {
            position,
            key,
            value: record,
        })
    }
}

impl Iterator for RecordIter {
    type Item = AppResult<LoggedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        let result = self.decode_next();
        self.failed = result.is_err();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_assigns_consecutive_positions() -> AppResult<()> {
        let records = vec![
            (7, Bytes::from_static(b"created")),
            (7, Bytes::new()),
            (9, Bytes::from(vec![1u8; 300])),
        ];
        let batch = encode_batch(42, &records);
        let expected_size: usize = records
            .iter()
            .map(|(_, v)| LoggedRecord::framed_size(v.len()))
            .sum();
        assert_eq!(batch.len(), expected_size);

        let decoded = RecordIter::new(batch).collect::<AppResult<Vec<_>>>()?;
        assert_eq!(
            decoded.iter().map(|r| r.position).collect::<Vec<_>>(),
            vec![42, 43, 44]
        );
        assert_eq!(decoded[0].value, Bytes::from_static(b"created"));
        assert_eq!(decoded[2].key, 9);
        assert_eq!(decoded[2].value.len(), 300);
        Ok(())
    }

    #[test]
    fn test_truncated_batch_yields_error_once() {
        let batch = encode_batch(1, &[(1, Bytes::from_static(b"abc"))]);
        let mut iter = RecordIter::new(batch.slice(..batch.len() - 1));
        assert!(matches!(iter.next(), Some(Err(AppError::CorruptEntry(_)))));
        assert!(iter.next().is_none());
    }
}
