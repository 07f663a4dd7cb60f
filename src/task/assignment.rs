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

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;

use parking_lot::RwLock;

use crate::message::TopicPartition;
use crate::{AppError, AppResult};

use super::TaskId;

pub type TaskPartitions = BTreeMap<TaskId, HashSet<TopicPartition>>;

/// The tasks one worker owns after a rebalance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub active: TaskPartitions,
    pub standby: TaskPartitions,
}

impl Assignment {
    pub fn new(active: TaskPartitions, standby: TaskPartitions) -> Self {
        Self { active, standby }
    }

    pub fn active_only(active: TaskPartitions) -> Self {
        Self::new(active, TaskPartitions::new())
    }

    /// Checks that no task id is both active and standby and that partition
    /// sets inside one mapping do not overlap.
    pub fn validate(&self) -> AppResult<()> {
        if let Some(id) = self.active.keys().find(|id| self.standby.contains_key(id)) {
            return Err(AppError::InvalidArgument(format!(
                "task {} assigned as both active and standby",
                id
            )));
        }
        Self::check_disjoint(&self.active, "active")?;
        Self::check_disjoint(&self.standby, "standby")
    }

    fn check_disjoint(tasks: &TaskPartitions, kind: &str) -> AppResult<()> {
        let mut seen = HashSet::new();
        for (id, partitions) in tasks {
            for partition in partitions {
                if !seen.insert(partition) {
                    return Err(AppError::InvalidArgument(format!(
                        "{} partition {} assigned to more than one task (last {})",
                        kind, partition, id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.standby.is_empty()
    }

    /// Grouping used when no assignor is configured: one active task per
    /// partition number, owning that partition of every assigned topic.
    pub fn group_by_partition(partitions: &HashSet<TopicPartition>) -> Self {
        let mut active = TaskPartitions::new();
        for tp in partitions {
            active
                .entry(TaskId::new(0, tp.partition))
                .or_default()
                .insert(tp.clone());
        }
        Self::active_only(active)
    }
}

/// Source of the current assignment, implemented by the external partition
/// assignor of the group protocol.
pub trait AssignmentProvider: Send + Sync + Debug {
    fn active_tasks(&self) -> TaskPartitions;
    fn standby_tasks(&self) -> TaskPartitions;

    fn assignment(&self) -> Assignment {
        Assignment::new(self.active_tasks(), self.standby_tasks())
    }
}

/// Assignor whose answer is set by hand; shared between a test (or the demo
/// cluster) and the worker that reads it.
#[derive(Debug, Default)]
pub struct StaticAssignor {
    assignment: RwLock<Assignment>,
}

impl StaticAssignor {
    pub fn new(assignment: Assignment) -> Self {
        Self {
            assignment: RwLock::new(assignment),
        }
    }

    pub fn set(&self, assignment: Assignment) {
        *self.assignment.write() = assignment;
    }
}

impl AssignmentProvider for StaticAssignor {
    fn active_tasks(&self) -> TaskPartitions {
        self.assignment.read().active.clone()
    }

    fn standby_tasks(&self) -> TaskPartitions {
        self.assignment.read().standby.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(topic: &str, ids: &[i32]) -> HashSet<TopicPartition> {
        ids.iter().map(|p| TopicPartition::new(topic, *p)).collect()
    }

    #[test]
    fn valid_assignment() {
        let mut active = TaskPartitions::new();
        active.insert(TaskId::new(0, 1), partitions("t1", &[1]));
        active.insert(TaskId::new(1, 1), partitions("t2", &[1]));
        let mut standby = TaskPartitions::new();
        standby.insert(TaskId::new(0, 2), partitions("t1", &[2]));
        assert!(Assignment::new(active, standby).validate().is_ok());
    }

    #[test]
    fn reject_task_both_active_and_standby() {
        let mut active = TaskPartitions::new();
        active.insert(TaskId::new(0, 1), partitions("t1", &[1]));
        let standby = active.clone();
        assert!(matches!(
            Assignment::new(active, standby).validate(),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reject_overlapping_partitions() {
        let mut active = TaskPartitions::new();
        active.insert(TaskId::new(0, 1), partitions("t1", &[1, 2]));
        active.insert(TaskId::new(0, 2), partitions("t1", &[2]));
        assert!(Assignment::active_only(active).validate().is_err());
    }

    #[test]
    fn group_by_partition_number() {
        let mut assigned = partitions("t1", &[0, 1]);
        assigned.extend(partitions("t2", &[1]));
        let assignment = Assignment::group_by_partition(&assigned);
        assert!(assignment.standby.is_empty());
        assert_eq!(assignment.active.len(), 2);
        assert_eq!(assignment.active[&TaskId::new(0, 0)], partitions("t1", &[0]));
        let mut both = partitions("t1", &[1]);
        both.extend(partitions("t2", &[1]));
        assert_eq!(assignment.active[&TaskId::new(0, 1)], both);
        assert!(assignment.validate().is_ok());
    }

    #[test]
    fn static_assignor_reflects_updates() {
        let assignor = StaticAssignor::default();
        assert!(assignor.assignment().is_empty());
        let mut active = TaskPartitions::new();
        active.insert(TaskId::new(0, 0), partitions("t1", &[0]));
        assignor.set(Assignment::active_only(active.clone()));
        assert_eq!(assignor.active_tasks(), active);
        assert!(assignor.standby_tasks().is_empty());
    }
}
