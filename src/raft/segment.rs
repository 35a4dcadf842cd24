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

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{AppError, AppResult};

use super::IndexedEntry;

/// Append-only file holding the frames of one journal.
///
/// The file offset of every frame is kept so the tail can be cut at an entry
/// boundary.
#[derive(Debug)]
pub struct SegmentFile {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    offsets: Vec<u64>,
}

impl SegmentFile {
    /// Opens or creates the segment at `path` and loads every intact entry.
    ///
    /// A frame that is cut short, fails its checksum or breaks the index sequence ends
    /// the readable part of the segment; everything from that frame on is truncated.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<(SegmentFile, Vec<IndexedEntry>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::DetailedIoError(format!(
                    "failed to create journal directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        let content = std::fs::read(&path)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut offset = 0usize;
        while offset < content.len() {
            match IndexedEntry::decode(&content[offset..]) {
                Ok(Some((entry, size))) => {
                    let expected = entries
                        .last()
                        .map_or(entry.index(), |prev: &IndexedEntry| prev.index() + 1);
                    if entry.index() != expected {
                        warn!(
                            "segment {} has index {} after {}, dropping the tail",
                            path.display(),
                            entry.index(),
                            expected - 1
                        );
                        break;
                    }
                    offsets.push(offset as u64);
                    entries.push(entry);
                    offset += size;
                }
                Ok(None) => {
                    warn!(
                        "segment {} ends with a partial frame at {}, dropping it",
                        path.display(),
                        offset
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        "segment {} is corrupt at {}: {}, dropping the tail",
                        path.display(),
                        offset,
                        e
                    );
                    break;
                }
            }
        }

        let size = offset as u64;
        if size < content.len() as u64 {
            file.set_len(size)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(size))?;
        debug!(
            "opened segment {} with {} entries, {} bytes",
            path.display(),
            entries.len(),
            size
        );

        Ok((
            SegmentFile {
                path,
                writer: BufWriter::new(file),
                size,
                offsets,
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn append(&mut self, frame: &[u8]) -> AppResult<()> {
        self.writer.write_all(frame)?;
        self.offsets.push(self.size);
        self.size += frame.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Keeps the first `count` entries and drops the rest.
    pub fn truncate(&mut self, count: usize) -> AppResult<()> {
        if count >= self.offsets.len() {
            return Ok(());
        }
        self.writer.flush()?;
        let new_size = self.offsets[count];
        let file = self.writer.get_mut();
        file.set_len(new_size)?;
        file.seek(SeekFrom::Start(new_size))?;
        file.sync_all()?;
        self.offsets.truncate(count);
        self.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{ApplicationEntry, RaftEntry};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn entry(index: u64) -> IndexedEntry {
        IndexedEntry::new(
            index,
            1,
            RaftEntry::Application(ApplicationEntry::new(
                index as i64,
                index as i64,
                Bytes::from(format!("record-{}", index)),
            )),
        )
    }

    #[test]
    fn test_reopen_loads_flushed_entries() -> AppResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("journal.log");
        {
            let (mut segment, loaded) = SegmentFile::open(&path)?;
            assert!(loaded.is_empty());
            for index in 1..=3 {
                segment.append(&entry(index).encode())?;
            }
            segment.flush()?;
        }

        let (segment, loaded) = SegmentFile::open(&path)?;
        assert_eq!(loaded, vec![entry(1), entry(2), entry(3)]);
        assert_eq!(segment.size(), std::fs::metadata(&path)?.len());
        Ok(())
    }

    #[test]
    fn test_partial_tail_is_truncated() -> AppResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("journal.log");
        let intact = entry(1).encode();
        let torn = entry(2).encode();
        let mut content = intact.to_vec();
        content.extend_from_slice(&torn[..torn.len() / 2]);
        std::fs::write(&path, &content)?;

        let (mut segment, loaded) = SegmentFile::open(&path)?;
        assert_eq!(loaded, vec![entry(1)]);
        assert_eq!(std::fs::metadata(&path)?.len(), intact.len() as u64);

        // appending continues right after the last intact frame
        segment.append(&entry(2).encode())?;
        segment.flush()?;
        drop(segment);
        let (_, loaded) = SegmentFile::open(&path)?;
        assert_eq!(loaded, vec![entry(1), entry(2)]);
        Ok(())
    }

    #[test]
    fn test_truncate_keeps_prefix() -> AppResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("journal.log");
        let (mut segment, _) = SegmentFile::open(&path)?;
        for index in 1..=5 {
            segment.append(&entry(index).encode())?;
        }
        segment.truncate(2)?;
        segment.append(&entry(3).encode())?;
        segment.flush()?;
        drop(segment);

        let (_, loaded) = SegmentFile::open(&path)?;
        assert_eq!(loaded, vec![entry(1), entry(2), entry(3)]);
        Ok(())
    }
}
