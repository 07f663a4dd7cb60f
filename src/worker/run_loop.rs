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

use tracing::{error, info, trace, warn};

use crate::client::PollEvent;
use crate::AppResult;

use super::{ConsumerRebalanceListener, Worker, WorkerState};

impl Worker {
    /// Runs the loop until `close` is called or a fatal error occurs, then
    /// releases every task and client. The worker ends DEAD either way.
    pub fn run(&mut self) -> AppResult<()> {
        info!("{} starting", self.client_id);
        let result = match self.initialize() {
            Ok(true) => self.run_loop(),
            Ok(false) => {
                info!(
                    "{} not started, state is {}",
                    self.client_id,
                    self.state.state()
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!("{} stopped after fatal error: {}", self.client_id, e);
        }
        self.shutdown(result.is_ok());
        result
    }

    /// Moves a created worker to RUNNING and subscribes its consumer.
    /// Returns false if the worker was closed before it started.
    pub fn initialize(&mut self) -> AppResult<bool> {
        if !self.state.set_state(WorkerState::Running) {
            return Ok(false);
        }
        self.consumer.subscribe(&self.config.source_topics)?;
        Ok(true)
    }

    fn run_loop(&mut self) -> AppResult<()> {
        while self.is_running() {
            self.run_once()?;
        }
        Ok(())
    }

    /// One iteration of the loop.
    pub fn run_once(&mut self) -> AppResult<()> {
        let poll_start = self.clock.milliseconds();
        let events = self.consumer.poll(self.config.poll_timeout())?;
        let now = self.clock.milliseconds();
        self.metrics
            .record_poll(now.saturating_sub(poll_start) as f64, now);

        for event in events {
            match event {
                PollEvent::Revoked(partitions) => self
                    .rebalance_listener()
                    .on_partitions_revoked(Some(&partitions))?,
                PollEvent::Assigned(partitions) => self
                    .rebalance_listener()
                    .on_partitions_assigned(&partitions)?,
                PollEvent::Records(records) => {
                    trace!("{} polled {} records", self.client_id, records.len());
                    self.task_manager.add_records(records)?;
                }
            }
        }
        if !self.is_running() {
            return Ok(());
        }

        let process_start = self.clock.milliseconds();
        let mut processed = 0;
        loop {
            let count = self.task_manager.process()?;
            if count == 0 {
                break;
            }
            processed += count;
        }
        if processed > 0 {
            let now = self.clock.milliseconds();
            self.metrics
                .record_process(now.saturating_sub(process_start) as f64, now);
        }

        let punctuate_start = self.clock.milliseconds();
        if self.task_manager.punctuate(punctuate_start)? > 0 {
            let now = self.clock.milliseconds();
            self.metrics
                .record_punctuate(now.saturating_sub(punctuate_start) as f64, now);
        }

        let now = self.clock.milliseconds();
        self.commit_scheduler
            .maybe_commit(&mut self.task_manager, now)?;
        self.task_manager.update_standby_tasks()?;

        self.state.apply_requested_shutdown();
        Ok(())
    }

    /// Closes every task, the shared producer and the consumer, then moves
    /// to DEAD. Runs once at the end of `run`.
    pub fn shutdown(&mut self, clean: bool) {
        if self.state.state() == WorkerState::Dead {
            return;
        }
        info!("{} shutting down, clean: {}", self.client_id, clean);
        // no-op when close already moved the state
        self.state.set_state(WorkerState::PendingShutdown);

        if let Err(e) = self.task_manager.shutdown(clean) {
            error!("{} failed to close tasks: {}", self.client_id, e);
        }
        if let Err(e) = self.consumer.close() {
            warn!("{} failed to close consumer: {}", self.client_id, e);
        }
        self.metrics.remove_all();

        self.state.set_state(WorkerState::Dead);
        info!("{} shutdown complete", self.client_id);
    }
}
