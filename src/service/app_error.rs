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

use crate::task::TaskId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// task scoped errors, absorbed by the task manager
    #[error("state directory lock for task {0} is held by another owner")]
    LockUnavailable(TaskId),

    #[error("producer fenced: {0}")]
    ProducerFenced(String),

    /// contract violations
    #[error("illegal state transition: {0}")]
    IllegalStateTransition(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state store: {0}")]
    InvalidStateStore(String),

    /// worker scoped errors
    #[error("worker {0} panicked")]
    WorkerPanicked(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("parse int error: {0}")]
    ParseError(#[from] std::num::ParseIntError),

    #[error("tracing setup error: {0}")]
    TracingError(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl AppError {
    /// Fencing means another producer with the same transactional id took over.
    pub fn is_fenced(&self) -> bool {
        matches!(self, AppError::ProducerFenced(_))
    }

    /// Errors the task manager swallows instead of unwinding the worker.
    pub fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            AppError::ProducerFenced(_) | AppError::LockUnavailable(_)
        )
    }
}
