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

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<BrokerConfig> = OnceCell::new();
pub fn global_config() -> &'static BrokerConfig {
    GLOBAL_CONFIG.get_or_init(BrokerConfig::default)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub node_id: i32,
    pub data_dir: String,
    pub partition_count: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_dir: "data".to_string(),
            partition_count: 1,
        }
    }
}

/// Settings of the replication group backing one partition.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RaftConfig {
    /// Number of members in the local group, the leader included.
    pub replication_factor: usize,
    /// File name of the journal segment inside the partition directory.
    pub segment_file_name: String,
    /// File name of the term/commit-index checkpoint.
    pub meta_file_name: String,
    /// fsync after every write instead of only before commit.
    pub flush_on_write: bool,
    pub command_channel_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            segment_file_name: "journal.log".to_string(),
            meta_file_name: ".raft_meta".to_string(),
            flush_on_write: false,
            command_channel_capacity: 1024,
        }
    }
}

impl RaftConfig {
    pub fn quorum(&self) -> usize {
        self.replication_factor / 2 + 1
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Upper bound for the payload of one appended batch.
    pub max_batch_size: usize,
    /// Minimum delay between two due date probes.
    pub timer_resolution_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4 * 1024 * 1024,
            timer_resolution_ms: 100,
        }
    }
}

impl ProcessingConfig {
    pub fn timer_resolution(&self) -> Duration {
        Duration::from_millis(self.timer_resolution_ms)
    }
}

/// Demo workload of the broker binary.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimersConfig {
    pub interval_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub raft: RaftConfig,
    pub processing: ProcessingConfig,
    pub timers: TimersConfig,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("STREAMLOG").separator("__"))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.validate()?;

        Ok(broker_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.raft.replication_factor == 0 {
            return Err(AppError::InvalidValue(
                "raft.replication_factor must be at least 1".to_string(),
            ));
        }
        if self.general.partition_count == 0 {
            return Err(AppError::InvalidValue(
                "general.partition_count must be at least 1".to_string(),
            ));
        }
        if self.processing.max_batch_size == 0 {
            return Err(AppError::InvalidValue(
                "processing.max_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
