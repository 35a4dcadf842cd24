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

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{trace, warn};

use crate::AppError::InvalidValue;
use crate::AppResult;

const TERM_KEY: &str = "term";
const COMMIT_INDEX_KEY: &str = "commit_index";

/// Term and commit index of a member, as last stored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RaftMeta {
    pub term: u64,
    pub commit_index: u64,
}

/// Versioned key/value text file:
///
/// ```text
/// 1
/// term 3
/// commit_index 42
/// ```
#[derive(Debug)]
pub struct MetaStore {
    file_name: PathBuf,
    version: i8,
}

impl MetaStore {
    pub const META_FILE_VERSION_1: i8 = 1;

    pub fn new(file_name: impl AsRef<Path>) -> Self {
        Self {
            file_name: file_name.as_ref().to_path_buf(),
            version: Self::META_FILE_VERSION_1,
        }
    }

    pub async fn store(&self, meta: RaftMeta) -> AppResult<()> {
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.file_name)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        buf_writer
            .write_all(format!("{} {}\n", TERM_KEY, meta.term).as_bytes())
            .await?;
        buf_writer
            .write_all(format!("{} {}\n", COMMIT_INDEX_KEY, meta.commit_index).as_bytes())
            .await?;
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        trace!("stored raft meta {:?} to {}", meta, self.file_name.display());
        Ok(())
    }

    pub async fn load(&self) -> AppResult<RaftMeta> {
        let error = |line: &str| InvalidValue(format!("meta line: {}", line.trim()));
        let open_file = OpenOptions::new().read(true).open(&self.file_name).await;
        let Ok(open_file) = open_file else {
            warn!(
                "raft meta file {} cannot be found, starting from term 0",
                self.file_name.display()
            );
            return Ok(RaftMeta::default());
        };

        let mut reader = BufReader::new(open_file);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let version = line.trim().parse::<i8>()?;
        if version != self.version {
            return Err(InvalidValue(format!(
                "meta file version {}, expected {}",
                version, self.version
            )));
        }

        let mut meta = RaftMeta::default();
        line.clear();
        while reader.read_line(&mut line).await? > 0 {
            let mut parts = line.split_whitespace();
            let key = parts.next().ok_or_else(|| error(&line))?;
            let value: u64 = parts.next().ok_or_else(|| error(&line))?.parse()?;
            if parts.next().is_some() {
                return Err(error(&line));
            }
            match key {
                TERM_KEY => meta.term = value,
                COMMIT_INDEX_KEY => meta.commit_index = value,
                _ => return Err(error(&line)),
            }
            line.clear();
        }
        Ok(meta)
    }
}
