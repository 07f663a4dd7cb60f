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

use tracing::{debug, info};

use crate::message::TopicPartition;
use crate::task::Assignment;
use crate::AppResult;

use super::{Worker, WorkerState};

/// Callbacks the group protocol invokes around a rebalance, always on the
/// worker's own thread and always revoke first.
pub trait ConsumerRebalanceListener {
    /// `None` is treated as an empty set.
    fn on_partitions_revoked(&mut self, revoked: Option<&HashSet<TopicPartition>>)
        -> AppResult<()>;
    fn on_partitions_assigned(&mut self, assigned: &HashSet<TopicPartition>) -> AppResult<()>;
}

/// Suspends tasks on revoke and applies the assignor's decision on assign.
#[derive(Debug)]
pub struct RebalanceListener<'a> {
    worker: &'a mut Worker,
}

impl<'a> RebalanceListener<'a> {
    pub fn new(worker: &'a mut Worker) -> Self {
        Self { worker }
    }

    fn current_assignment(&self, assigned: &HashSet<TopicPartition>) -> Assignment {
        match &self.worker.assignment_provider {
            Some(provider) => provider.assignment(),
            None => Assignment::group_by_partition(assigned),
        }
    }
}

impl ConsumerRebalanceListener for RebalanceListener<'_> {
    fn on_partitions_revoked(
        &mut self,
        revoked: Option<&HashSet<TopicPartition>>,
    ) -> AppResult<()> {
        let revoked = revoked.cloned().unwrap_or_default();
        let start = self.worker.clock.milliseconds();
        info!(
            "{} partitions revoked {:?}, current state {}",
            self.worker.client_id,
            revoked,
            self.worker.state()
        );

        if !self.worker.state.set_state(WorkerState::PartitionsRevoked) {
            debug!(
                "{} ignoring revoke in state {}",
                self.worker.client_id,
                self.worker.state()
            );
            return Ok(());
        }
        let result = self.worker.task_manager.suspend_tasks();

        info!(
            "{} partition revocation took {} ms, suspended {:?}",
            self.worker.client_id,
            self.worker.clock.milliseconds().saturating_sub(start),
            self.worker.task_manager.suspended_tasks().keys().collect::<Vec<_>>()
        );
        result
    }

    fn on_partitions_assigned(&mut self, assigned: &HashSet<TopicPartition>) -> AppResult<()> {
        let start = self.worker.clock.milliseconds();
        info!(
            "{} partitions assigned {:?}, current state {}",
            self.worker.client_id,
            assigned,
            self.worker.state()
        );

        if !self.worker.state.set_state(WorkerState::AssigningPartitions) {
            debug!(
                "{} ignoring assignment in state {}",
                self.worker.client_id,
                self.worker.state()
            );
            return Ok(());
        }
        let assignment = self.current_assignment(assigned);
        self.worker.task_manager.create_tasks(&assignment)?;
        self.worker.state.set_state(WorkerState::Running);

        info!(
            "{} partition assignment took {} ms, active {:?} standby {:?}",
            self.worker.client_id,
            self.worker.clock.milliseconds().saturating_sub(start),
            self.worker.task_manager.tasks().keys().collect::<Vec<_>>(),
            self.worker.task_manager.standby_tasks().keys().collect::<Vec<_>>()
        );
        Ok(())
    }
}
