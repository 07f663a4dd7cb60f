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

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::client::{Consumer, Producer, RestoreConsumer};
use crate::message::{ConsumerRecord, TopicPartition};
use crate::service::StreamsConfig;
use crate::state::{CacheFlushListener, ProcessorStateManager};
use crate::{AppError, AppResult};

use super::{
    transition, ChangelogForwarder, ProcessorContext, RecordCollector, RecordProcessor, TaskId,
    TaskState,
};

/// A task that consumes its input partitions, runs the processor and writes
/// output and changelog records through its record collector.
#[derive(Debug)]
pub struct StreamTask {
    id: TaskId,
    application_id: String,
    partitions: HashSet<TopicPartition>,
    state: TaskState,
    eos: bool,
    state_manager: ProcessorStateManager,
    collector: Arc<RecordCollector>,
    consumer: Arc<dyn Consumer>,
    processor: Box<dyn RecordProcessor>,
    buffer: VecDeque<ConsumerRecord>,
    max_buffered: usize,
    paused: HashSet<TopicPartition>,
    /// last processed offset per input partition
    consumed_offsets: HashMap<TopicPartition, i64>,
    commit_needed: bool,
}

impl StreamTask {
    /// Builds the task and restores its stores. The caller holds the task
    /// directory lock; `producer` is either the shared producer or a
    /// transactional one with a transaction already begun.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        partitions: HashSet<TopicPartition>,
        task_dir: PathBuf,
        config: &StreamsConfig,
        consumer: Arc<dyn Consumer>,
        producer: Arc<dyn Producer>,
        restore_consumer: &dyn RestoreConsumer,
        processor: Box<dyn RecordProcessor>,
    ) -> AppResult<Self> {
        let mut state = TaskState::Created;
        let collector = Arc::new(RecordCollector::new(id, producer));
        transition(id, &mut state, TaskState::Restoring)?;
        let state_manager = ProcessorStateManager::open(
            id,
            task_dir,
            config,
            restore_consumer,
            |changelog| -> Option<Box<dyn CacheFlushListener>> {
                Some(Box::new(ChangelogForwarder::new(
                    collector.clone(),
                    changelog.clone(),
                )))
            },
        )?;

        let mut task = Self {
            id,
            application_id: config.application_id.clone(),
            partitions,
            state,
            eos: config.is_exactly_once(),
            state_manager,
            collector,
            consumer,
            processor,
            buffer: VecDeque::new(),
            max_buffered: config.buffered_records_per_partition.max(1),
            paused: HashSet::new(),
            consumed_offsets: HashMap::new(),
            commit_needed: false,
        };
        let mut context = ProcessorContext::new(id, &mut task.state_manager, &task.collector);
        task.processor.init(&mut context)?;
        transition(id, &mut task.state, TaskState::Running)?;
        info!("created active task {} for {:?}", id, task.partitions);
        Ok(task)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn partitions(&self) -> &HashSet<TopicPartition> {
        &self.partitions
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn producer(&self) -> &Arc<dyn Producer> {
        self.collector.producer()
    }

    pub fn state_manager(&self) -> &ProcessorStateManager {
        &self.state_manager
    }

    pub fn state_manager_mut(&mut self) -> &mut ProcessorStateManager {
        &mut self.state_manager
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn commit_needed(&self) -> bool {
        self.commit_needed
    }

    pub fn consumed_offsets(&self) -> &HashMap<TopicPartition, i64> {
        &self.consumed_offsets
    }

    /// Buffers records of this task's partitions and pauses partitions whose
    /// backlog reached the configured bound.
    pub fn add_records(&mut self, records: Vec<ConsumerRecord>) -> AppResult<()> {
        for record in records {
            self.buffer.push_back(record);
        }
        let full: Vec<TopicPartition> = self
            .partitions
            .iter()
            .filter(|tp| !self.paused.contains(*tp) && self.buffered_for(tp) >= self.max_buffered)
            .cloned()
            .collect();
        if !full.is_empty() {
            debug!("task {} pausing {:?}", self.id, full);
            self.consumer.pause(&full)?;
            self.paused.extend(full);
        }
        Ok(())
    }

    fn buffered_for(&self, partition: &TopicPartition) -> usize {
        self.buffer
            .iter()
            .filter(|r| r.topic == partition.topic && r.partition == partition.partition)
            .count()
    }

    /// Processes the next buffered record. Returns whether there was one.
    pub fn process(&mut self) -> AppResult<bool> {
        if self.state != TaskState::Running {
            return Ok(false);
        }
        let Some(record) = self.buffer.pop_front() else {
            return Ok(false);
        };
        let partition = record.topic_partition();
        trace!("task {} processing {} at {}", self.id, partition, record.offset);

        let mut context = ProcessorContext::new(self.id, &mut self.state_manager, &self.collector);
        self.processor.process(&mut context, &record)?;
        self.consumed_offsets.insert(partition.clone(), record.offset);
        self.commit_needed = true;

        if self.paused.contains(&partition) && self.buffered_for(&partition) < self.max_buffered {
            self.consumer.resume(std::slice::from_ref(&partition))?;
            self.paused.remove(&partition);
        }
        Ok(true)
    }

    pub fn punctuate(&mut self, now_ms: u64) -> AppResult<()> {
        if self.state != TaskState::Running {
            return Ok(());
        }
        let mut context = ProcessorContext::new(self.id, &mut self.state_manager, &self.collector);
        self.processor.punctuate(&mut context, now_ms)
    }

    pub fn flush(&mut self) -> AppResult<()> {
        self.state_manager.flush()?;
        self.collector.flush()
    }

    pub fn commit(&mut self) -> AppResult<()> {
        if self.state != TaskState::Running {
            return Err(AppError::IllegalStateTransition(format!(
                "commit of task {} in state {}",
                self.id, self.state
            )));
        }
        self.commit_offsets(true)
    }

    /// Flushes stores and output, then commits consumed positions: through
    /// the transaction with exactly-once, on the consumer otherwise.
    fn commit_offsets(&mut self, start_new_transaction: bool) -> AppResult<()> {
        let written = self.collector.offsets();
        self.state_manager.commit(&written)?;
        self.collector.flush()?;

        let offsets: HashMap<TopicPartition, i64> = self
            .consumed_offsets
            .iter()
            .map(|(tp, offset)| (tp.clone(), offset + 1))
            .collect();
        let producer = self.collector.producer();
        if self.eos {
            if !offsets.is_empty() {
                producer.send_offsets_to_transaction(&offsets, &self.application_id)?;
            }
            producer.commit_transaction()?;
            if start_new_transaction {
                producer.begin_transaction()?;
            }
        } else if !offsets.is_empty() {
            self.consumer.commit_sync(&offsets)?;
        }
        self.commit_needed = false;
        debug!("task {} committed {:?}", self.id, offsets);
        Ok(())
    }

    /// Commits and parks the task. The directory lock stays with the caller,
    /// the buffered records are dropped since the consumer will hand them
    /// out again to whoever owns the partitions next.
    pub fn suspend(&mut self) -> AppResult<()> {
        if self.state != TaskState::Running {
            return Err(AppError::IllegalStateTransition(format!(
                "suspend of task {} in state {}",
                self.id, self.state
            )));
        }
        self.commit_offsets(false)?;
        self.buffer.clear();
        self.resume_paused();
        transition(self.id, &mut self.state, TaskState::Suspended)
    }

    pub fn resume(&mut self) -> AppResult<()> {
        if self.state != TaskState::Suspended {
            return Err(AppError::IllegalStateTransition(format!(
                "resume of task {} in state {}",
                self.id, self.state
            )));
        }
        if self.eos {
            self.collector.producer().begin_transaction()?;
        }
        transition(self.id, &mut self.state, TaskState::Running)?;
        debug!("resumed task {}", self.id);
        Ok(())
    }

    fn resume_paused(&mut self) {
        if self.paused.is_empty() {
            return;
        }
        let paused: Vec<TopicPartition> = self.paused.drain().collect();
        if let Err(e) = self.consumer.resume(&paused) {
            warn!("task {} failed to resume {:?}: {}", self.id, paused, e);
        }
    }

    /// A clean close commits a running task first; if that fails the close
    /// continues dirty and the commit error is returned. A dirty close aborts
    /// the open transaction and drops cached state without a checkpoint.
    pub fn close(&mut self, clean: bool) -> AppResult<()> {
        let was_running = self.state == TaskState::Running;
        transition(self.id, &mut self.state, TaskState::Closing)?;

        let mut result = Ok(());
        if clean && was_running {
            result = self.commit_offsets(false);
        }
        let clean = clean && result.is_ok();

        let producer = self.collector.producer().clone();
        if self.eos && !clean {
            if let Err(e) = producer.abort_transaction() {
                debug!("task {} abort failed: {}", self.id, e);
            }
        }
        let written = self.collector.offsets();
        let closed = self.state_manager.close(clean, &written);
        if result.is_ok() {
            result = closed;
        }
        self.processor.close();
        self.buffer.clear();
        self.resume_paused();
        if self.eos {
            if let Err(e) = producer.close() {
                warn!("task {} failed to close its producer: {}", self.id, e);
            }
        }
        transition(self.id, &mut self.state, TaskState::Closed)?;
        info!("closed active task {} (clean: {})", self.id, clean);
        result
    }
}
