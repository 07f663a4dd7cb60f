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

//! A worker owns one consumer and the tasks of its partitions, and drives
//! them from a single loop: poll, rebalance, process, punctuate, commit.
//!
//! Only `close` and the state accessors may be called from other threads,
//! everything else belongs to the loop.

mod commit;
mod handle;
mod rebalance;
mod run_loop;
mod state;

use std::sync::Arc;

pub use commit::CommitScheduler;
pub use handle::WorkerHandle;
pub use rebalance::{ConsumerRebalanceListener, RebalanceListener};
pub use state::{StateHistory, StateListener, WorkerState, WorkerStateMachine};

use crate::client::{ClientSupplier, Consumer};
use crate::metrics::{SensorRecorder, ThreadMetrics};
use crate::service::StreamsConfig;
use crate::state::StateDirectory;
use crate::task::{AssignmentProvider, ProcessorSupplier, ProducerRegistry, TaskAction};
use crate::task_manager::TaskManager;
use crate::utils::Clock;
use crate::AppResult;

/// Batch actions the commit scheduler needs from whoever owns the tasks.
pub trait TaskActions {
    fn perform_on_active_tasks(&mut self, action: TaskAction) -> AppResult<usize>;
    fn perform_on_standby_tasks(&mut self, action: TaskAction) -> AppResult<usize>;
}

#[derive(Debug)]
pub struct Worker {
    client_id: String,
    config: StreamsConfig,
    state: Arc<WorkerStateMachine>,
    consumer: Arc<dyn Consumer>,
    task_manager: TaskManager,
    assignment_provider: Option<Arc<dyn AssignmentProvider>>,
    commit_scheduler: CommitScheduler,
    metrics: ThreadMetrics,
    clock: Arc<dyn Clock>,
}

impl Worker {
    /// Builds a worker and its clients. Under at-least-once the shared
    /// producer is created here; exactly-once producers come per task.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        client_id: impl Into<String>,
        config: StreamsConfig,
        client_supplier: Arc<dyn ClientSupplier>,
        processor_supplier: Arc<dyn ProcessorSupplier>,
        state_directory: Arc<StateDirectory>,
        recorder: Arc<dyn SensorRecorder>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Worker> {
        let client_id = client_id.into();
        config.validate()?;

        let consumer = client_supplier.get_consumer(&client_id);
        let restore_consumer =
            client_supplier.get_restore_consumer(&format!("{}-restore-consumer", client_id));
        let producers = ProducerRegistry::new(
            config.processing_guarantee,
            config.application_id.clone(),
            client_id.clone(),
            client_supplier,
        );
        let metrics = ThreadMetrics::new(client_id.clone(), recorder);

        let mut task_manager = TaskManager::new(
            client_id.clone(),
            config.clone(),
            state_directory,
            producers,
            processor_supplier,
            restore_consumer,
            metrics.clone(),
            clock.clone(),
        );
        task_manager.set_consumer(consumer.clone());

        let commit_scheduler =
            CommitScheduler::new(config.commit_interval_ms(), clock.clone(), metrics.clone());

        Ok(Worker {
            state: Arc::new(WorkerStateMachine::new(client_id.clone())),
            client_id,
            config,
            consumer,
            task_manager,
            assignment_provider: None,
            commit_scheduler,
            metrics,
            clock,
        })
    }

    pub fn set_assignment_provider(&mut self, provider: Arc<dyn AssignmentProvider>) {
        self.assignment_provider = Some(provider);
    }

    pub fn set_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.state.set_listener(listener);
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.state.state()
    }

    /// Handle for observing or closing the worker from other threads.
    pub fn state_machine(&self) -> Arc<WorkerStateMachine> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.state().is_running() && !self.state.is_shutdown_requested()
    }

    /// Asks the loop to stop. Idempotent and never blocks.
    pub fn close(&self) {
        self.state.request_close();
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.consumer
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn task_manager_mut(&mut self) -> &mut TaskManager {
        &mut self.task_manager
    }

    pub fn commit_scheduler(&self) -> &CommitScheduler {
        &self.commit_scheduler
    }

    /// Rebalance callbacks bound to this worker, for the consumer to invoke.
    pub fn rebalance_listener(&mut self) -> RebalanceListener<'_> {
        RebalanceListener::new(self)
    }
}
