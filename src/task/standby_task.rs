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

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::client::RestoreConsumer;
use crate::message::TopicPartition;
use crate::service::StreamsConfig;
use crate::state::ProcessorStateManager;
use crate::{AppError, AppResult};

use super::{transition, TaskId, TaskState};

/// Keeps a warm replica of an active task's stores by following the
/// changelogs. Never gets a producer.
#[derive(Debug)]
pub struct StandbyTask {
    id: TaskId,
    partitions: HashSet<TopicPartition>,
    state: TaskState,
    state_manager: ProcessorStateManager,
    restore_consumer: Arc<dyn RestoreConsumer>,
}

impl StandbyTask {
    pub fn new(
        id: TaskId,
        partitions: HashSet<TopicPartition>,
        task_dir: PathBuf,
        config: &StreamsConfig,
        restore_consumer: Arc<dyn RestoreConsumer>,
    ) -> AppResult<Self> {
        let mut state = TaskState::Created;
        transition(id, &mut state, TaskState::Restoring)?;
        let state_manager =
            ProcessorStateManager::open(id, task_dir, config, restore_consumer.as_ref(), |_| None)?;
        transition(id, &mut state, TaskState::Running)?;
        info!("created standby task {} for {:?}", id, partitions);
        Ok(Self {
            id,
            partitions,
            state,
            state_manager,
            restore_consumer,
        })
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

    pub fn state_manager(&self) -> &ProcessorStateManager {
        &self.state_manager
    }

    pub fn state_manager_mut(&mut self) -> &mut ProcessorStateManager {
        &mut self.state_manager
    }

    /// Applies changelog records that appeared since the last update.
    pub fn update(&mut self) -> AppResult<usize> {
        if self.state != TaskState::Running {
            return Ok(0);
        }
        self.state_manager
            .update_standby(self.restore_consumer.as_ref())
    }

    pub fn flush(&mut self) -> AppResult<()> {
        self.state_manager.flush()
    }

    /// Flushes the replica and checkpoints how far it got.
    pub fn commit(&mut self) -> AppResult<()> {
        self.state_manager.flush()?;
        self.state_manager.checkpoint(&HashMap::new())
    }

    pub fn suspend(&mut self) -> AppResult<()> {
        if self.state != TaskState::Running {
            return Err(AppError::IllegalStateTransition(format!(
                "suspend of standby task {} in state {}",
                self.id, self.state
            )));
        }
        self.commit()?;
        transition(self.id, &mut self.state, TaskState::Suspended)
    }

    pub fn resume(&mut self) -> AppResult<()> {
        transition(self.id, &mut self.state, TaskState::Running)
    }

    pub fn close(&mut self, clean: bool) -> AppResult<()> {
        transition(self.id, &mut self.state, TaskState::Closing)?;
        let result = self.state_manager.close(clean, &HashMap::new());
        transition(self.id, &mut self.state, TaskState::Closed)?;
        info!("closed standby task {} (clean: {})", self.id, clean);
        result
    }
}
