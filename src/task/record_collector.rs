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

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::client::{Producer, RecordMetadata};
use crate::message::{ProducerRecord, TopicPartition};
use crate::state::CacheFlushListener;
use crate::AppResult;

use super::TaskId;

/// Sends the output of one task and remembers the last offset written per
/// partition.
#[derive(Debug)]
pub struct RecordCollector {
    task_id: TaskId,
    producer: Arc<dyn Producer>,
    offsets: Mutex<HashMap<TopicPartition, i64>>,
}

impl RecordCollector {
    pub fn new(task_id: TaskId, producer: Arc<dyn Producer>) -> Self {
        Self {
            task_id,
            producer,
            offsets: Mutex::new(HashMap::new()),
        }
    }

    pub fn send(&self, record: ProducerRecord) -> AppResult<RecordMetadata> {
        let metadata = self.producer.send(record)?;
        trace!(
            "task {} wrote {}-{} at {}",
            self.task_id,
            metadata.topic,
            metadata.partition,
            metadata.offset
        );
        self.offsets.lock().insert(
            TopicPartition::new(metadata.topic.clone(), metadata.partition),
            metadata.offset,
        );
        Ok(metadata)
    }

    pub fn flush(&self) -> AppResult<()> {
        self.producer.flush()
    }

    pub fn offsets(&self) -> HashMap<TopicPartition, i64> {
        self.offsets.lock().clone()
    }

    pub fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }
}

/// Writes entries leaving a store cache to the store's changelog partition.
#[derive(Debug)]
pub struct ChangelogForwarder {
    collector: Arc<RecordCollector>,
    changelog: TopicPartition,
}

impl ChangelogForwarder {
    pub fn new(collector: Arc<RecordCollector>, changelog: TopicPartition) -> Self {
        Self {
            collector,
            changelog,
        }
    }
}

impl CacheFlushListener for ChangelogForwarder {
    fn apply(&self, key: &Bytes, new_value: Option<&Bytes>, _old_value: Option<&Bytes>) -> AppResult<()> {
        self.collector.send(ProducerRecord::new(
            self.changelog.topic.clone(),
            Some(self.changelog.partition),
            Some(key.clone()),
            new_value.cloned(),
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockProducer, MockRestoreConsumer};
    use crate::client::{ProducerConfig, RestoreConsumer};

    #[test]
    fn forwarder_writes_changelog_and_tracks_offsets() {
        let changelog_log = Arc::new(MockRestoreConsumer::new());
        let producer = Arc::new(MockProducer::new(
            ProducerConfig {
                client_id: "c".to_string(),
                transactional_id: None,
            },
            Some(changelog_log.clone()),
        ));
        let collector = Arc::new(RecordCollector::new(TaskId::new(0, 2), producer.clone()));
        let changelog = TopicPartition::new("app-counts-0-changelog", 2);
        let forwarder = ChangelogForwarder::new(collector.clone(), changelog.clone());

        forwarder.apply(&Bytes::from("k"), Some(&Bytes::from("1")), None).unwrap();
        forwarder.apply(&Bytes::from("k"), None, Some(&Bytes::from("1"))).unwrap();

        assert_eq!(collector.offsets().get(&changelog), Some(&1));
        let records = changelog_log.read_changelog(&changelog, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, None);
        assert_eq!(producer.history().len(), 2);
    }
}
