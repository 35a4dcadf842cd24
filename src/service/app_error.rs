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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("parse int error: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    /// replication errors
    #[error("not leader: {0}")]
    NotLeader(String),

    #[error("unexpected position: {0}")]
    UnexpectedPosition(String),

    #[error("corrupt entry: {0}")]
    CorruptEntry(String),

    #[error("closed: {0}")]
    Closed(String),
}

impl AppError {
    /// Rejections a caller may retry once leadership or positions settle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::NotLeader(_) | AppError::ChannelSendError(_))
    }
}
