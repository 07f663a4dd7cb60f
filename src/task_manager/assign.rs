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

use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use crate::message::TopicPartition;
use crate::task::{Assignment, StandbyTask, StreamTask, Task, TaskId, TaskPartitions};
use crate::{AppError, AppResult, ProcessingGuarantee};

use super::TaskManager;

impl TaskManager {
    /// Applies a new assignment: tasks that are not re-assigned with the same
    /// kind and partitions are closed first so their locks are free, then
    /// active and standby tasks are resumed or created.
    pub fn create_tasks(&mut self, assignment: &Assignment) -> AppResult<()> {
        assignment.validate()?;
        self.close_unassigned_tasks(assignment);
        self.add_active_tasks(&assignment.active)?;
        self.add_standby_tasks(&assignment.standby)?;
        info!(
            "{} assigned active {:?} standby {:?}",
            self.client_id,
            self.active_tasks.keys().collect::<Vec<_>>(),
            self.standby_tasks.keys().collect::<Vec<_>>()
        );
        Ok(())
    }

    fn close_unassigned_tasks(&mut self, assignment: &Assignment) {
        let stale_suspended: Vec<TaskId> = self
            .suspended_tasks
            .iter()
            .filter(|(id, task)| {
                let assigned = if task.is_active() {
                    assignment.active.get(*id)
                } else {
                    assignment.standby.get(*id)
                };
                assigned != Some(task.partitions())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale_suspended {
            if let Some(task) = self.suspended_tasks.remove(&id) {
                debug!("{} closing suspended task {} that moved away", self.client_id, id);
                if let Err(e) = self.close_task(task, true) {
                    warn!("{} failed to close suspended task {}: {}", self.client_id, id, e);
                }
            }
        }

        let stale_active: Vec<TaskId> = self
            .active_tasks
            .iter()
            .filter(|(id, task)| assignment.active.get(*id) != Some(task.partitions()))
            .map(|(id, _)| *id)
            .collect();
        for id in stale_active {
            if let Some(task) = self.active_tasks.remove(&id) {
                if let Err(e) = self.close_task(Task::Active(task), true) {
                    warn!("{} failed to close active task {}: {}", self.client_id, id, e);
                }
            }
        }

        let stale_standby: Vec<TaskId> = self
            .standby_tasks
            .iter()
            .filter(|(id, task)| assignment.standby.get(*id) != Some(task.partitions()))
            .map(|(id, _)| *id)
            .collect();
        for id in stale_standby {
            if let Some(task) = self.standby_tasks.remove(&id) {
                if let Err(e) = self.close_task(Task::Standby(task), true) {
                    warn!("{} failed to close standby task {}: {}", self.client_id, id, e);
                }
            }
        }
    }

    fn add_active_tasks(&mut self, active: &TaskPartitions) -> AppResult<()> {
        for (id, partitions) in active {
            if self.active_tasks.contains_key(id) {
                continue;
            }
            match self.suspended_tasks.remove(id) {
                Some(Task::Active(mut task)) => {
                    match task.resume() {
                        Ok(()) => {
                            debug!("{} resumed active task {}", self.client_id, id);
                            self.active_tasks.insert(*id, task);
                        }
                        Err(e) if e.is_fenced() => self.handle_fenced(Task::Active(task), &e),
                        Err(e) => {
                            if let Err(close_err) = self.close_task(Task::Active(task), false) {
                                warn!(
                                    "{} failed to close task {} after resume error: {}",
                                    self.client_id, id, close_err
                                );
                            }
                            return Err(e);
                        }
                    }
                    continue;
                }
                // kind flips were closed before; keep the maps consistent anyway
                Some(other) => {
                    if let Err(e) = self.close_task(other, true) {
                        warn!("{} failed to close task {}: {}", self.client_id, id, e);
                    }
                }
                None => {}
            }

            match self.create_active_task(*id, partitions.clone()) {
                Ok(task) => {
                    self.active_tasks.insert(*id, task);
                    self.metrics.task_created(self.clock.milliseconds());
                }
                Err(AppError::LockUnavailable(_)) => {
                    warn!(
                        "{} could not lock task {}, retrying at the next rebalance",
                        self.client_id, id
                    );
                }
                Err(e) if e.is_fenced() => {
                    warn!("{} producer of new task {} was fenced: {}", self.client_id, id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn add_standby_tasks(&mut self, standby: &TaskPartitions) -> AppResult<()> {
        for (id, partitions) in standby {
            if self.standby_tasks.contains_key(id) {
                continue;
            }
            match self.suspended_tasks.remove(id) {
                Some(Task::Standby(mut task)) => {
                    if let Err(e) = task.resume() {
                        if let Err(close_err) = self.close_task(Task::Standby(task), false) {
                            warn!(
                                "{} failed to close standby task {} after resume error: {}",
                                self.client_id, id, close_err
                            );
                        }
                        return Err(e);
                    }
                    self.standby_tasks.insert(*id, task);
                    continue;
                }
                Some(other) => {
                    if let Err(e) = self.close_task(other, true) {
                        warn!("{} failed to close task {}: {}", self.client_id, id, e);
                    }
                }
                None => {}
            }

            match self.create_standby_task(*id, partitions.clone()) {
                Ok(task) => {
                    self.standby_tasks.insert(*id, task);
                    self.metrics.task_created(self.clock.milliseconds());
                }
                Err(AppError::LockUnavailable(_)) => {
                    warn!(
                        "{} could not lock standby task {}, retrying at the next rebalance",
                        self.client_id, id
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn create_active_task(
        &self,
        id: TaskId,
        partitions: HashSet<TopicPartition>,
    ) -> AppResult<StreamTask> {
        let consumer = self.consumer.clone().ok_or_else(|| {
            AppError::IllegalStateTransition(format!(
                "{} has no consumer to create task {}",
                self.client_id, id
            ))
        })?;
        self.state_directory.lock(id, &self.client_id)?;

        let task = self.producers.producer_for(id).and_then(|producer| {
            let task_dir = self.state_directory.directory_for_task(id)?;
            let processor = self.processor_supplier.get(id);
            StreamTask::new(
                id,
                partitions,
                task_dir,
                &self.config,
                consumer,
                producer.clone(),
                self.restore_consumer.as_ref(),
                processor,
            )
            .inspect_err(|_| {
                if self.producers.guarantee() == ProcessingGuarantee::ExactlyOnce {
                    if let Err(e) = producer.close() {
                        warn!("{} failed to close producer of task {}: {}", self.client_id, id, e);
                    }
                }
            })
        });
        if task.is_err() {
            self.release_lock(id);
        }
        task
    }

    fn create_standby_task(
        &self,
        id: TaskId,
        partitions: HashSet<TopicPartition>,
    ) -> AppResult<StandbyTask> {
        self.state_directory.lock(id, &self.client_id)?;
        let task = self.state_directory.directory_for_task(id).and_then(|task_dir| {
            StandbyTask::new(
                id,
                partitions,
                task_dir,
                &self.config,
                self.restore_consumer.clone(),
            )
        });
        if task.is_err() {
            self.release_lock(id);
        }
        task
    }

    /// Suspends every task after a revoke, keeping their locks. Fenced tasks
    /// are dropped as zombies; other failures close the task dirty and the
    /// first one is returned once every task was handled.
    pub fn suspend_tasks(&mut self) -> AppResult<()> {
        self.prev_active_tasks = self.active_tasks.keys().copied().collect();
        let mut first_error = None;

        for (id, mut task) in std::mem::take(&mut self.active_tasks) {
            match task.suspend() {
                Ok(()) => {
                    self.suspended_tasks.insert(id, Task::Active(task));
                }
                Err(e) if e.is_fenced() => self.handle_fenced(Task::Active(task), &e),
                Err(e) => {
                    error!("{} failed to suspend task {}: {}", self.client_id, id, e);
                    if let Err(close_err) = self.close_task(Task::Active(task), false) {
                        warn!("{} failed to close task {}: {}", self.client_id, id, close_err);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        for (id, mut task) in std::mem::take(&mut self.standby_tasks) {
            match task.suspend() {
                Ok(()) => {
                    self.suspended_tasks.insert(id, Task::Standby(task));
                }
                Err(e) => {
                    error!("{} failed to suspend standby task {}: {}", self.client_id, id, e);
                    if let Err(close_err) = self.close_task(Task::Standby(task), false) {
                        warn!(
                            "{} failed to close standby task {}: {}",
                            self.client_id, id, close_err
                        );
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!(
            "{} suspended {:?}",
            self.client_id,
            self.suspended_tasks.keys().collect::<Vec<_>>()
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Closes a task that is already out of every map and releases its lock.
    pub(super) fn close_task(&self, mut task: Task, clean: bool) -> AppResult<()> {
        let id = task.id();
        let result = task.close(clean);
        self.release_lock(id);
        self.metrics.task_closed(self.clock.milliseconds());
        result
    }

    /// Zombie policy: the task lost its transactional id to a newer owner.
    pub(super) fn handle_fenced(&self, task: Task, cause: &AppError) {
        warn!(
            "{} task {} was fenced, closing it as a zombie: {}",
            self.client_id,
            task.id(),
            cause
        );
        if let Err(e) = self.close_task(task, false) {
            debug!("{} dirty close of zombie task failed: {}", self.client_id, e);
        }
    }

    pub(super) fn release_lock(&self, id: TaskId) {
        if let Err(e) = self.state_directory.unlock(id, &self.client_id) {
            warn!("{} failed to release lock of task {}: {}", self.client_id, id, e);
        }
    }
}
