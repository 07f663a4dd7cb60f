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

//! Owner of a worker's tasks.
//!
//! The task manager is the only place tasks live. A task id is in at most one
//! of the active, standby and suspended maps, and every task in any of them
//! holds its state directory lock under the worker's client id. Task scoped
//! failures are absorbed here: a taken lock skips the task until the next
//! rebalance, a fenced producer removes the task (the zombie policy).

mod actions;
mod assign;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::client::{Consumer, RestoreConsumer};
use crate::metrics::ThreadMetrics;
use crate::service::StreamsConfig;
use crate::state::StateDirectory;
use crate::task::{
    ProcessorSupplier, ProducerRegistry, StandbyTask, StreamTask, Task, TaskId, TaskPartitions,
};
use crate::utils::Clock;

#[derive(Debug)]
pub struct TaskManager {
    client_id: String,
    config: StreamsConfig,
    state_directory: Arc<StateDirectory>,
    producers: ProducerRegistry,
    processor_supplier: Arc<dyn ProcessorSupplier>,
    restore_consumer: Arc<dyn RestoreConsumer>,
    consumer: Option<Arc<dyn Consumer>>,
    metrics: ThreadMetrics,
    clock: Arc<dyn Clock>,

    active_tasks: BTreeMap<TaskId, StreamTask>,
    standby_tasks: BTreeMap<TaskId, StandbyTask>,
    suspended_tasks: BTreeMap<TaskId, Task>,
    prev_active_tasks: BTreeSet<TaskId>,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: impl Into<String>,
        config: StreamsConfig,
        state_directory: Arc<StateDirectory>,
        producers: ProducerRegistry,
        processor_supplier: Arc<dyn ProcessorSupplier>,
        restore_consumer: Arc<dyn RestoreConsumer>,
        metrics: ThreadMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            config,
            state_directory,
            producers,
            processor_supplier,
            restore_consumer,
            consumer: None,
            metrics,
            clock,
            active_tasks: BTreeMap::new(),
            standby_tasks: BTreeMap::new(),
            suspended_tasks: BTreeMap::new(),
            prev_active_tasks: BTreeSet::new(),
        }
    }

    pub fn set_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumer = Some(consumer);
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Running active tasks and the partitions each one owns.
    pub fn tasks(&self) -> TaskPartitions {
        self.active_tasks
            .iter()
            .map(|(id, task)| (*id, task.partitions().clone()))
            .collect()
    }

    pub fn standby_tasks(&self) -> TaskPartitions {
        self.standby_tasks
            .iter()
            .map(|(id, task)| (*id, task.partitions().clone()))
            .collect()
    }

    pub fn suspended_tasks(&self) -> &BTreeMap<TaskId, Task> {
        &self.suspended_tasks
    }

    /// Active task ids as they were right before the last revoke.
    pub fn prev_active_tasks(&self) -> &BTreeSet<TaskId> {
        &self.prev_active_tasks
    }

    pub fn active_task(&self, id: TaskId) -> Option<&StreamTask> {
        self.active_tasks.get(&id)
    }

    pub fn active_task_mut(&mut self, id: TaskId) -> Option<&mut StreamTask> {
        self.active_tasks.get_mut(&id)
    }

    pub fn standby_task(&self, id: TaskId) -> Option<&StandbyTask> {
        self.standby_tasks.get(&id)
    }

    pub fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }
}
