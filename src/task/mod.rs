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

pub use assignment::{Assignment, AssignmentProvider, StaticAssignor, TaskPartitions};
pub use processor::{
    KeyCountProcessor, KeyCountSupplier, ProcessorContext, ProcessorSupplier, RecordProcessor,
};
pub use producer_registry::ProducerRegistry;
pub use record_collector::{ChangelogForwarder, RecordCollector};
pub use standby_task::StandbyTask;
pub use stream_task::StreamTask;
pub use task_id::TaskId;

mod assignment;
mod processor;
mod producer_registry;
mod record_collector;
mod standby_task;
mod stream_task;
mod task_id;

use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use tracing::debug;

use crate::message::TopicPartition;
use crate::{AppError, AppResult};

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// constructed, lock held, state not yet restored
    Created,
    /// replaying changelogs into the local stores
    Restoring,
    /// processing (active) or following the changelog (standby)
    Running,
    /// flushed and committed after a revoke, lock still held
    Suspended,
    Closing,
    /// lock released, removed from every task map
    Closed,
}

impl TaskState {
    pub const fn can_transition_to(current: TaskState, target: TaskState) -> bool {
        matches!(
            (current, target),
            (TaskState::Created, TaskState::Restoring)
                | (TaskState::Restoring, TaskState::Running)
                | (TaskState::Running, TaskState::Suspended)
                | (TaskState::Suspended, TaskState::Running)
                | (TaskState::Created, TaskState::Closing)
                | (TaskState::Restoring, TaskState::Closing)
                | (TaskState::Running, TaskState::Closing)
                | (TaskState::Suspended, TaskState::Closing)
                | (TaskState::Closing, TaskState::Closed)
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Created => "CREATED",
            TaskState::Restoring => "RESTORING",
            TaskState::Running => "RUNNING",
            TaskState::Suspended => "SUSPENDED",
            TaskState::Closing => "CLOSING",
            TaskState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

pub(crate) fn transition(task_id: TaskId, state: &mut TaskState, target: TaskState) -> AppResult<()> {
    if !TaskState::can_transition_to(*state, target) {
        return Err(AppError::IllegalStateTransition(format!(
            "task {} cannot go from {} to {}",
            task_id, state, target
        )));
    }
    debug!("task {} transition: {} -> {}", task_id, state, target);
    *state = target;
    Ok(())
}

/// Batch operations the task manager applies to every task of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskAction {
    Commit,
    Flush,
    Close,
}

impl TaskAction {
    pub fn name(&self) -> &'static str {
        match self {
            TaskAction::Commit => "commit",
            TaskAction::Flush => "flush",
            TaskAction::Close => "close",
        }
    }
}

/// One unit of partition-parallel work owned by a task manager.
#[derive(Debug)]
pub enum Task {
    Active(StreamTask),
    Standby(StandbyTask),
}

impl Task {
    pub fn id(&self) -> TaskId {
        match self {
            Task::Active(task) => task.id(),
            Task::Standby(task) => task.id(),
        }
    }

    pub fn partitions(&self) -> &HashSet<TopicPartition> {
        match self {
            Task::Active(task) => task.partitions(),
            Task::Standby(task) => task.partitions(),
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            Task::Active(task) => task.state(),
            Task::Standby(task) => task.state(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Task::Active(_))
    }

    pub fn close(&mut self, clean: bool) -> AppResult<()> {
        match self {
            Task::Active(task) => task.close(clean),
            Task::Standby(task) => task.close(clean),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_transitions() {
        use TaskState::*;
        assert!(TaskState::can_transition_to(Created, Restoring));
        assert!(TaskState::can_transition_to(Running, Suspended));
        assert!(TaskState::can_transition_to(Suspended, Running));
        assert!(TaskState::can_transition_to(Suspended, Closing));
        assert!(!TaskState::can_transition_to(Created, Running));
        assert!(!TaskState::can_transition_to(Closed, Running));
        assert!(!TaskState::can_transition_to(Closing, Running));
        assert!(!TaskState::can_transition_to(Suspended, Suspended));
    }

    #[test]
    fn rejected_transition_keeps_state() {
        let mut state = TaskState::Suspended;
        let err = transition(TaskId::new(0, 0), &mut state, TaskState::Restoring).unwrap_err();
        assert!(matches!(err, AppError::IllegalStateTransition(_)));
        assert_eq!(state, TaskState::Suspended);
    }
}
