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

//! Entries stored in the replicated journal and their on-disk framing.
//!
//! Frame layout, big endian:
//!
//! ```text
//! | body length: u32 | crc32c(body): u32 | index: u64 | term: u64 | kind: u8 | kind body ... |
//! ```
//!
//! Application entries carry `lowest_position: i64`, `highest_position: i64` and the
//! opaque payload, configuration entries a `u32` member count followed by the members.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

pub type MemberId = u32;

/// length + crc
pub const FRAME_HEADER_SIZE: usize = 8;
/// index + term + kind
const BODY_HEADER_SIZE: usize = 17;
const APPLICATION_HEADER_SIZE: usize = 16;

const KIND_INITIAL: u8 = 0;
const KIND_CONFIGURATION: u8 = 1;
const KIND_APPLICATION: u8 = 2;

/// A batch of application records covering the inclusive position range
/// `[lowest_position, highest_position]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationEntry {
    pub lowest_position: i64,
    pub highest_position: i64,
    pub data: Bytes,
}

impl ApplicationEntry {
    pub fn new(lowest_position: i64, highest_position: i64, data: Bytes) -> Self {
        Self {
            lowest_position,
            highest_position,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationEntry {
    pub members: Vec<MemberId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftEntry {
    /// Written by every new leader at the start of its term.
    Initial,
    Configuration(ConfigurationEntry),
    Application(ApplicationEntry),
}

impl RaftEntry {
    fn kind(&self) -> u8 {
        match self {
            RaftEntry::Initial => KIND_INITIAL,
            RaftEntry::Configuration(_) => KIND_CONFIGURATION,
            RaftEntry::Application(_) => KIND_APPLICATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEntry {
    index: u64,
    term: u64,
    entry: RaftEntry,
}

impl IndexedEntry {
    pub fn new(index: u64, term: u64, entry: RaftEntry) -> Self {
        Self { index, term, entry }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn entry(&self) -> &RaftEntry {
        &self.entry
    }

    pub fn is_application_entry(&self) -> bool {
        matches!(self.entry, RaftEntry::Application(_))
    }

    pub fn application_entry(&self) -> Option<&ApplicationEntry> {
        match &self.entry {
            RaftEntry::Application(entry) => Some(entry),
            _ => None,
        }
    }

    /// Highest application position in this entry, `-1` for replication-internal
    /// entries.
    pub fn highest_position(&self) -> i64 {
        self.application_entry()
            .map_or(-1, |entry| entry.highest_position)
    }

    pub fn frame_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_size()
    }

    fn body_size(&self) -> usize {
        BODY_HEADER_SIZE
            + match &self.entry {
                RaftEntry::Initial => 0,
                RaftEntry::Configuration(config) => 4 + 4 * config.members.len(),
                RaftEntry::Application(app) => APPLICATION_HEADER_SIZE + app.data.len(),
            }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.body_size());
        body.put_u64(self.index);
        body.put_u64(self.term);
        body.put_u8(self.entry.kind());
        match &self.entry {
            RaftEntry::Initial => {}
            RaftEntry::Configuration(config) => {
                body.put_u32(config.members.len() as u32);
                for member in &config.members {
                    body.put_u32(*member);
                }
            }
            RaftEntry::Application(app) => {
                body.put_i64(app.lowest_position);
                body.put_i64(app.highest_position);
                body.put_slice(&app.data);
            }
        }

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_u32(crc32c::crc32c(&body));
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Decodes the frame at the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` ends before the frame does, which is what a torn
    /// write at the tail of a segment looks like, and the decoded entry together with
    /// the number of consumed bytes otherwise.
    ///
    /// # Errors
    ///
    /// `CorruptEntry` when the checksum does not match or the body is malformed.
    pub fn decode(buf: &[u8]) -> AppResult<Option<(IndexedEntry, usize)>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let body_len = header.get_u32() as usize;
        let expected_crc = header.get_u32();
        if buf.len() < FRAME_HEADER_SIZE + body_len {
            return Ok(None);
        }
        if body_len < BODY_HEADER_SIZE {
            return Err(AppError::CorruptEntry(format!(
                "body length {} is less than the entry header {}",
                body_len, BODY_HEADER_SIZE
            )));
        }

        let body = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + body_len];
        let computed_crc = crc32c::crc32c(body);
        if computed_crc != expected_crc {
            return Err(AppError::CorruptEntry(format!(
                "CRC mismatch: expected {}, but found {}",
                expected_crc, computed_crc
            )));
        }

        let mut cursor = body;
        let index = cursor.get_u64();
        let term = cursor.get_u64();
        let kind = cursor.get_u8();
        let entry = match kind {
            KIND_INITIAL => RaftEntry::Initial,
            KIND_CONFIGURATION => {
                if cursor.remaining() < 4 {
                    return Err(AppError::CorruptEntry(
                        "configuration entry without member count".to_string(),
                    ));
                }
                let count = cursor.get_u32() as usize;
                if cursor.remaining() != count * 4 {
                    return Err(AppError::CorruptEntry(format!(
                        "configuration entry expects {} members but has {} bytes",
                        count,
                        cursor.remaining()
                    )));
                }
                let members = (0..count).map(|_| cursor.get_u32()).collect();
                RaftEntry::Configuration(ConfigurationEntry { members })
            }
            KIND_APPLICATION => {
                if cursor.remaining() < APPLICATION_HEADER_SIZE {
                    return Err(AppError::CorruptEntry(
                        "application entry without position bounds".to_string(),
                    ));
                }
                let lowest_position = cursor.get_i64();
                let highest_position = cursor.get_i64();
                let data = Bytes::copy_from_slice(cursor);
                RaftEntry::Application(ApplicationEntry {
                    lowest_position,
                    highest_position,
                    data,
                })
            }
            other => {
                return Err(AppError::CorruptEntry(format!(
                    "unknown entry kind {}",
                    other
                )))
            }
        };

        Ok(Some((
            IndexedEntry::new(index, term, entry),
            FRAME_HEADER_SIZE + body_len,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_entry(index: u64, lowest: i64, highest: i64) -> IndexedEntry {
        IndexedEntry::new(
            index,
            1,
            RaftEntry::Application(ApplicationEntry::new(
                lowest,
                highest,
                Bytes::from_static(b"payload"),
            )),
        )
    }

    #[test]
    fn test_decode_frames_back_to_back() -> AppResult<()> {
        let entries = vec![
            IndexedEntry::new(1, 1, RaftEntry::Initial),
            IndexedEntry::new(
                2,
                1,
                RaftEntry::Configuration(ConfigurationEntry {
                    members: vec![0, 1, 2],
                }),
            ),
            app_entry(3, 1, 5),
        ];
        let mut buf = BytesMut::new();
        for entry in &entries {
            let encoded = entry.encode();
            assert_eq!(encoded.len(), entry.frame_size());
            buf.put_slice(&encoded);
        }

        let mut offset = 0;
        let mut decoded = vec![];
        while let Some((entry, size)) = IndexedEntry::decode(&buf[offset..])? {
            decoded.push(entry);
            offset += size;
        }
        assert_eq!(offset, buf.len());
        assert_eq!(decoded, entries);
        Ok(())
    }

    #[test]
    fn test_torn_frame_is_incomplete() -> AppResult<()> {
        let encoded = app_entry(1, 1, 1).encode();
        assert!(IndexedEntry::decode(&encoded[..encoded.len() - 1])?.is_none());
        assert!(IndexedEntry::decode(&encoded[..3])?.is_none());
        Ok(())
    }

    #[test]
    fn test_crc_mismatch_is_corrupt() {
        let mut encoded = BytesMut::from(&app_entry(1, 1, 1).encode()[..]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let result = IndexedEntry::decode(&encoded);
        assert!(matches!(result, Err(AppError::CorruptEntry(_))));
    }

    #[test]
    fn test_highest_position_of_non_application_entry() {
        assert_eq!(IndexedEntry::new(1, 1, RaftEntry::Initial).highest_position(), -1);
        assert_eq!(app_entry(2, 3, 7).highest_position(), 7);
    }
}
