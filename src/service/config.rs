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

pub static GLOBAL_CONFIG: OnceCell<StreamsConfig> = OnceCell::new();

const DEFAULT_COMMIT_INTERVAL_MS: u64 = 30_000;
const EOS_DEFAULT_COMMIT_INTERVAL_MS: u64 = 100;

/// Delivery guarantee, selected once per worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingGuarantee {
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub application_id: String,
    pub state_dir: String,
    /// commit interval; `None` picks the default for the processing guarantee
    pub commit_interval_ms: Option<u64>,
    pub poll_ms: u64,
    pub processing_guarantee: ProcessingGuarantee,
    /// 0 means one worker per cpu
    pub num_stream_threads: usize,
    /// number of entries the write-back cache holds per store before evicting
    pub cache_max_entries: usize,
    pub buffered_records_per_partition: usize,
    pub state_stores: Vec<String>,
    pub source_topics: Vec<String>,
    pub sink_topic: Option<String>,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            application_id: "stonestream".to_string(),
            state_dir: "/tmp/stonestream".to_string(),
            commit_interval_ms: None,
            poll_ms: 100,
            processing_guarantee: ProcessingGuarantee::AtLeastOnce,
            num_stream_threads: 1,
            cache_max_entries: 1024,
            buffered_records_per_partition: 1000,
            state_stores: Vec::new(),
            source_topics: Vec::new(),
            sink_topic: None,
        }
    }
}

impl StreamsConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<StreamsConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::InvalidArgument(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("STONESTREAM"))
            .build()?;

        let streams_config: StreamsConfig = config.try_deserialize()?;
        streams_config.validate()?;
        Ok(streams_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.application_id.is_empty() {
            return Err(AppError::InvalidArgument(
                "application_id must not be empty".to_string(),
            ));
        }
        if self.commit_interval_ms == Some(0) {
            return Err(AppError::InvalidArgument(
                "commit_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_exactly_once(&self) -> bool {
        self.processing_guarantee == ProcessingGuarantee::ExactlyOnce
    }

    pub fn commit_interval_ms(&self) -> u64 {
        self.commit_interval_ms.unwrap_or(match self.processing_guarantee {
            ProcessingGuarantee::AtLeastOnce => DEFAULT_COMMIT_INTERVAL_MS,
            ProcessingGuarantee::ExactlyOnce => EOS_DEFAULT_COMMIT_INTERVAL_MS,
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    /// Changelog topic backing one store of one task group. Tasks of
    /// different groups sharing a store name never share a changelog.
    pub fn changelog_topic(&self, store_name: &str, group_id: i32) -> String {
        format!("{}-{}-{}-changelog", self.application_id, store_name, group_id)
    }
}
