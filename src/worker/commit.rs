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

use std::sync::Arc;

use tracing::{debug, trace};

use crate::metrics::ThreadMetrics;
use crate::task::TaskAction;
use crate::utils::Clock;
use crate::AppResult;

use super::TaskActions;

/// Periodic commit of every owned task.
#[derive(Debug)]
pub struct CommitScheduler {
    commit_interval_ms: u64,
    last_commit_ms: u64,
    clock: Arc<dyn Clock>,
    metrics: ThreadMetrics,
}

impl CommitScheduler {
    pub fn new(commit_interval_ms: u64, clock: Arc<dyn Clock>, metrics: ThreadMetrics) -> Self {
        let last_commit_ms = clock.milliseconds();
        Self {
            commit_interval_ms,
            last_commit_ms,
            clock,
            metrics,
        }
    }

    pub fn commit_interval_ms(&self) -> u64 {
        self.commit_interval_ms
    }

    pub fn last_commit_ms(&self) -> u64 {
        self.last_commit_ms
    }

    /// Commits active then standby tasks once `now_ms` is at least one
    /// interval past the previous commit. Returns whether a batch ran.
    ///
    /// Both batches run even when the first fails; the first error is
    /// returned afterwards and the interval restarts either way.
    pub fn maybe_commit<T: TaskActions>(&mut self, tasks: &mut T, now_ms: u64) -> AppResult<bool> {
        if now_ms.saturating_sub(self.last_commit_ms) < self.commit_interval_ms {
            trace!(
                "commit skipped, {} ms since last commit",
                now_ms.saturating_sub(self.last_commit_ms)
            );
            return Ok(false);
        }

        let start = self.clock.milliseconds();
        let active = tasks.perform_on_active_tasks(TaskAction::Commit);
        let standby = tasks.perform_on_standby_tasks(TaskAction::Commit);
        let end = self.clock.milliseconds();

        self.metrics
            .record_commit(end.saturating_sub(start) as f64, end);
        self.last_commit_ms = now_ms;

        let active = active?;
        let standby = standby?;
        debug!(
            "committed {} active and {} standby tasks in {} ms",
            active,
            standby,
            end.saturating_sub(start)
        );
        Ok(true)
    }
}
