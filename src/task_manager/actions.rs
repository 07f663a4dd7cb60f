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

use tracing::{debug, error, warn};

use crate::message::{ConsumerRecord, TopicPartition};
use crate::task::{StandbyTask, StreamTask, Task, TaskAction, TaskId};
use crate::worker::TaskActions;
use crate::{AppError, AppResult, ProcessingGuarantee};

use super::TaskManager;

impl TaskManager {
    /// Applies `action` to every active task. A failing task does not stop
    /// the batch: a fenced one is dropped as a zombie, any other error is
    /// returned after all tasks were attempted. Returns how many tasks
    /// completed the action.
    pub fn perform_on_active_tasks(&mut self, action: TaskAction) -> AppResult<usize> {
        let ids: Vec<TaskId> = self.active_tasks.keys().copied().collect();
        let mut performed = 0;
        let mut first_error = None;
        for id in ids {
            let result = match action {
                TaskAction::Commit => self
                    .active_tasks
                    .get_mut(&id)
                    .map_or(Ok(()), StreamTask::commit),
                TaskAction::Flush => self
                    .active_tasks
                    .get_mut(&id)
                    .map_or(Ok(()), StreamTask::flush),
                TaskAction::Close => match self.active_tasks.remove(&id) {
                    Some(task) => self.close_task(Task::Active(task), true),
                    None => continue,
                },
            };
            match result {
                Ok(()) => performed += 1,
                Err(e) if e.is_fenced() => match self.active_tasks.remove(&id) {
                    Some(task) => self.handle_fenced(Task::Active(task), &e),
                    None => warn!("{} task {} fenced while closing: {}", self.client_id, id, e),
                },
                Err(e) => {
                    error!(
                        "{} failed to {} task {}: {}",
                        self.client_id,
                        action.name(),
                        id,
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(performed), Err)
    }

    pub fn perform_on_standby_tasks(&mut self, action: TaskAction) -> AppResult<usize> {
        let ids: Vec<TaskId> = self.standby_tasks.keys().copied().collect();
        let mut performed = 0;
        let mut first_error = None;
        for id in ids {
            let result = match action {
                TaskAction::Commit => self
                    .standby_tasks
                    .get_mut(&id)
                    .map_or(Ok(()), StandbyTask::commit),
                TaskAction::Flush => self
                    .standby_tasks
                    .get_mut(&id)
                    .map_or(Ok(()), StandbyTask::flush),
                TaskAction::Close => match self.standby_tasks.remove(&id) {
                    Some(task) => self.close_task(Task::Standby(task), true),
                    None => continue,
                },
            };
            match result {
                Ok(()) => performed += 1,
                Err(e) => {
                    error!(
                        "{} failed to {} standby task {}: {}",
                        self.client_id,
                        action.name(),
                        id,
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(performed), Err)
    }

    /// Routes polled records to the active task owning their partition.
    /// Returns the number of records nobody owns, which are skipped.
    pub fn add_records(&mut self, records: Vec<ConsumerRecord>) -> AppResult<usize> {
        let owners: HashMap<TopicPartition, TaskId> = self
            .active_tasks
            .iter()
            .flat_map(|(id, task)| task.partitions().iter().map(move |tp| (tp.clone(), *id)))
            .collect();

        let mut by_task: BTreeMap<TaskId, Vec<ConsumerRecord>> = BTreeMap::new();
        let mut skipped = 0;
        for record in records {
            match owners.get(&record.topic_partition()) {
                Some(id) => by_task.entry(*id).or_default().push(record),
                None => skipped += 1,
            }
        }
        for (id, records) in by_task {
            if let Some(task) = self.active_tasks.get_mut(&id) {
                task.add_records(records)?;
            }
        }
        if skipped > 0 {
            debug!("{} skipped {} records of unowned partitions", self.client_id, skipped);
            self.metrics.skipped_records(skipped, self.clock.milliseconds());
        }
        Ok(skipped)
    }

    /// Processes at most one buffered record per active task.
    pub fn process(&mut self) -> AppResult<usize> {
        let ids: Vec<TaskId> = self.active_tasks.keys().copied().collect();
        let mut processed = 0;
        for id in ids {
            let Some(task) = self.active_tasks.get_mut(&id) else {
                continue;
            };
            match task.process() {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) if e.is_fenced() => {
                    if let Some(task) = self.active_tasks.remove(&id) {
                        self.handle_fenced(Task::Active(task), &e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(processed)
    }

    pub fn punctuate(&mut self, now_ms: u64) -> AppResult<usize> {
        let ids: Vec<TaskId> = self.active_tasks.keys().copied().collect();
        let mut punctuated = 0;
        for id in ids {
            let Some(task) = self.active_tasks.get_mut(&id) else {
                continue;
            };
            match task.punctuate(now_ms) {
                Ok(()) => punctuated += 1,
                Err(e) if e.is_fenced() => {
                    if let Some(task) = self.active_tasks.remove(&id) {
                        self.handle_fenced(Task::Active(task), &e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(punctuated)
    }

    /// Lets every standby task catch up with its changelogs.
    pub fn update_standby_tasks(&mut self) -> AppResult<usize> {
        let mut applied = 0;
        for task in self.standby_tasks.values_mut() {
            applied += task.update()?;
        }
        Ok(applied)
    }

    /// Closes the shared producer. Only valid without exactly-once.
    pub fn close_producer(&mut self) -> AppResult<()> {
        self.producers.close_shared()
    }

    /// Closes every task, releasing its lock, and then the shared producer.
    /// Task scoped failures are logged; the first other error is returned.
    pub fn shutdown(&mut self, clean: bool) -> AppResult<()> {
        let mut first_error: Option<AppError> = None;
        let mut tasks: Vec<Task> = Vec::new();
        tasks.extend(std::mem::take(&mut self.active_tasks).into_values().map(Task::Active));
        tasks.extend(std::mem::take(&mut self.standby_tasks).into_values().map(Task::Standby));
        tasks.extend(std::mem::take(&mut self.suspended_tasks).into_values());

        for task in tasks {
            let id = task.id();
            if let Err(e) = self.close_task(task, clean) {
                if e.is_task_scoped() {
                    warn!("{} task {} closed dirty: {}", self.client_id, id, e);
                } else {
                    error!("{} failed to close task {}: {}", self.client_id, id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if self.producers.guarantee() == ProcessingGuarantee::AtLeastOnce {
            if let Err(e) = self.close_producer() {
                error!("{} failed to close the shared producer: {}", self.client_id, e);
                first_error.get_or_insert(e);
            }
        }
        self.prev_active_tasks.clear();
        first_error.map_or(Ok(()), Err)
    }
}

impl TaskActions for TaskManager {
    fn perform_on_active_tasks(&mut self, action: TaskAction) -> AppResult<usize> {
        TaskManager::perform_on_active_tasks(self, action)
    }

    fn perform_on_standby_tasks(&mut self, action: TaskAction) -> AppResult<usize> {
        TaskManager::perform_on_standby_tasks(self, action)
    }
}
