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

use crate::utils::PoolError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// framing errors
    #[error("frame length {0} outside of 1..=65535")]
    InvalidFrameLength(usize),

    #[error("handler id {0} does not fit the header layout")]
    HandlerIdOutOfRange(u32),

    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// resource errors
    #[error("buffer arena exhausted after {0} windows")]
    ArenaExhausted(usize),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// connection errors
    #[error("session {0} not found")]
    SessionNotFound(u64),

    #[error("not connected")]
    NotConnected,

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
}
