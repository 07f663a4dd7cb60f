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
use std::thread::JoinHandle;

use tracing::info;

use crate::{AppError, AppResult};

use super::{Worker, WorkerState, WorkerStateMachine};

impl Worker {
    /// Moves the worker onto its own OS thread named after its client id.
    pub fn start(mut self) -> AppResult<WorkerHandle> {
        let client_id = self.client_id.clone();
        let state = self.state.clone();
        let thread = std::thread::Builder::new()
            .name(client_id.clone())
            .spawn(move || self.run())?;
        info!("{} started", client_id);
        Ok(WorkerHandle {
            client_id,
            state,
            thread: Some(thread),
        })
    }
}

/// Owner side of a started worker.
#[derive(Debug)]
pub struct WorkerHandle {
    client_id: String,
    state: Arc<WorkerStateMachine>,
    thread: Option<JoinHandle<AppResult<()>>>,
}

impl WorkerHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> WorkerState {
        self.state.state()
    }

    pub fn state_machine(&self) -> &Arc<WorkerStateMachine> {
        &self.state
    }

    /// Requests shutdown without waiting for it. Safe to call repeatedly.
    pub fn close(&self) {
        self.state.request_close();
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Waits for the loop to exit and returns its result. Joining twice
    /// returns `Ok`.
    pub fn join(&mut self) -> AppResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| AppError::WorkerPanicked(self.client_id.clone()))?,
            None => Ok(()),
        }
    }
}
