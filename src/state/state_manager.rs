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

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};

use crate::client::RestoreConsumer;
use crate::message::TopicPartition;
use crate::service::StreamsConfig;
use crate::task::TaskId;
use crate::{AppError, AppResult};

use super::{
    CacheFlushListener, CachingKeyValueStore, CheckpointFile, InMemoryKeyValueStore,
    KeyValueStore,
};

/// Owns the stores of one task inside its locked directory.
///
/// On open every store is rebuilt: the snapshot is trusted only when a
/// checkpoint exists, and the changelog is replayed from the checkpointed
/// position (or from the start). A checkpoint is written on clean close and,
/// without transactions, on every commit. With transactions the checkpoint is
/// removed right after loading, so a crash or a dirty close forces a full
/// replay of committed changelog data.
#[derive(Debug)]
pub struct ProcessorStateManager {
    task_id: TaskId,
    task_dir: PathBuf,
    stores: BTreeMap<String, CachingKeyValueStore>,
    changelogs: BTreeMap<String, TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    checkpoint: CheckpointFile,
    eos: bool,
    open: bool,
}

impl ProcessorStateManager {
    pub fn open<F>(
        task_id: TaskId,
        task_dir: PathBuf,
        config: &StreamsConfig,
        restore_consumer: &dyn RestoreConsumer,
        listener_for: F,
    ) -> AppResult<Self>
    where
        F: Fn(&TopicPartition) -> Option<Box<dyn CacheFlushListener>>,
    {
        let eos = config.is_exactly_once();
        let checkpoint = CheckpointFile::in_dir(&task_dir);
        let checkpointed = checkpoint.read()?;
        let load = checkpointed.is_some();
        if eos && load {
            checkpoint.delete()?;
        }
        let checkpointed = checkpointed.unwrap_or_default();

        let mut stores = BTreeMap::new();
        let mut changelogs = BTreeMap::new();
        let mut positions = HashMap::new();
        for name in &config.state_stores {
            let changelog = TopicPartition::new(
                config.changelog_topic(name, task_id.group_id),
                task_id.partition,
            );
            let mut inner = InMemoryKeyValueStore::open(name.clone(), &task_dir, load)?;
            let from = checkpointed.get(&changelog).copied().unwrap_or(0);
            let next = Self::restore(&mut inner, restore_consumer, &changelog, from)?;
            debug!(
                "task {} restored store {} from {} up to {}",
                task_id, name, from, next
            );

            let store = CachingKeyValueStore::new(
                Box::new(inner),
                config.cache_max_entries,
                listener_for(&changelog),
            );
            positions.insert(changelog.clone(), next);
            changelogs.insert(name.clone(), changelog);
            stores.insert(name.clone(), store);
        }

        Ok(Self {
            task_id,
            task_dir,
            stores,
            changelogs,
            positions,
            checkpoint,
            eos,
            open: true,
        })
    }

    /// Replays changelog records at or after `from` into `store` and returns
    /// the position after the last applied record.
    fn restore(
        store: &mut dyn KeyValueStore,
        restore_consumer: &dyn RestoreConsumer,
        changelog: &TopicPartition,
        from: i64,
    ) -> AppResult<i64> {
        let mut next = from;
        for record in restore_consumer.read_changelog(changelog, from)? {
            next = next.max(record.offset + 1);
            let Some(key) = record.key else {
                continue;
            };
            match record.value {
                Some(value) => store.put(key, value)?,
                None => {
                    store.delete(&key)?;
                }
            }
        }
        Ok(next)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    pub fn store(&mut self, name: &str) -> AppResult<&mut dyn KeyValueStore> {
        match self.stores.get_mut(name) {
            Some(store) => Ok(store),
            None => Err(AppError::InvalidStateStore(format!(
                "task {} has no store named {}",
                self.task_id, name
            ))),
        }
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn changelog_partitions(&self) -> Vec<TopicPartition> {
        self.changelogs.values().cloned().collect()
    }

    /// Next changelog offset per changelog partition not yet in the stores.
    pub fn positions(&self) -> &HashMap<TopicPartition, i64> {
        &self.positions
    }

    /// Applies changelog records written since the last call. Used by
    /// standby tasks to follow their active counterpart.
    pub fn update_standby(&mut self, restore_consumer: &dyn RestoreConsumer) -> AppResult<usize> {
        let mut applied = 0;
        for (name, changelog) in &self.changelogs {
            let Some(store) = self.stores.get_mut(name) else {
                continue;
            };
            let from = self.positions.get(changelog).copied().unwrap_or(0);
            let next = Self::restore(store, restore_consumer, changelog, from)?;
            if next > from {
                trace!("standby {} applied {} records to {}", self.task_id, next - from, name);
                applied += (next - from) as usize;
                self.positions.insert(changelog.clone(), next);
            }
        }
        Ok(applied)
    }

    pub fn flush(&mut self) -> AppResult<()> {
        for store in self.stores.values_mut() {
            store.flush()?;
        }
        Ok(())
    }

    /// Advances positions past the changelog offsets this task wrote and
    /// persists them.
    pub fn checkpoint(&mut self, written: &HashMap<TopicPartition, i64>) -> AppResult<()> {
        for changelog in self.changelogs.values() {
            if let Some(offset) = written.get(changelog) {
                let position = self.positions.entry(changelog.clone()).or_insert(0);
                *position = (*position).max(offset + 1);
            }
        }
        self.checkpoint.write(&self.positions)
    }

    /// Commit time hook: flush, and checkpoint unless transactions are on.
    pub fn commit(&mut self, written: &HashMap<TopicPartition, i64>) -> AppResult<()> {
        self.flush()?;
        if !self.eos {
            self.checkpoint(written)?;
        }
        Ok(())
    }

    /// A clean close flushes the stores and writes the checkpoint. A dirty
    /// close drops cached writes and leaves no checkpoint behind.
    pub fn close(&mut self, clean: bool, written: &HashMap<TopicPartition, i64>) -> AppResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if !clean {
            self.stores.clear();
            info!("task {} state discarded", self.task_id);
            return Ok(());
        }

        let mut result = self.flush().and_then(|_| self.checkpoint(written));
        for (_, mut store) in std::mem::take(&mut self.stores) {
            let closed = store.close();
            if result.is_ok() {
                result = closed;
            }
        }
        debug!("task {} state closed cleanly", self.task_id);
        result
    }
}
