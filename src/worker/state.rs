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

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// constructed, loop not started
    ///
    /// transition: start => Running
    ///             close => PendingShutdown
    Created,
    /// polling and processing
    ///
    /// transition: partitions revoked => PartitionsRevoked
    ///             close => PendingShutdown
    Running,
    /// tasks suspended, waiting for the new assignment
    ///
    /// transition: assignment received => AssigningPartitions
    ///             close => PendingShutdown
    PartitionsRevoked,
    /// tasks being resumed, closed and created
    ///
    /// transition: assignment applied => Running
    ///             close => PendingShutdown
    AssigningPartitions,
    /// close requested, loop releasing tasks and producers
    ///
    /// transition: loop exited => Dead
    PendingShutdown,
    /// final
    Dead,
}

impl WorkerState {
    pub const fn can_transition_to(current: WorkerState, target: WorkerState) -> bool {
        matches!(
            (current, target),
            (WorkerState::Created, WorkerState::Running)
                | (WorkerState::Created, WorkerState::PendingShutdown)
                | (WorkerState::Running, WorkerState::PartitionsRevoked)
                | (WorkerState::Running, WorkerState::PendingShutdown)
                | (WorkerState::PartitionsRevoked, WorkerState::AssigningPartitions)
                | (WorkerState::PartitionsRevoked, WorkerState::PendingShutdown)
                | (WorkerState::AssigningPartitions, WorkerState::Running)
                | (WorkerState::AssigningPartitions, WorkerState::PendingShutdown)
                | (WorkerState::PendingShutdown, WorkerState::Dead)
        )
    }

    /// Whether the loop should keep going.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            WorkerState::Running | WorkerState::PartitionsRevoked | WorkerState::AssigningPartitions
        )
    }
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Created => "CREATED",
            WorkerState::Running => "RUNNING",
            WorkerState::PartitionsRevoked => "PARTITIONS_REVOKED",
            WorkerState::AssigningPartitions => "ASSIGNING_PARTITIONS",
            WorkerState::PendingShutdown => "PENDING_SHUTDOWN",
            WorkerState::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// Observer of worker state changes, called once per transition.
pub trait StateListener: Send + Sync + Debug {
    fn on_change(&self, client_id: &str, new_state: WorkerState, old_state: WorkerState);
}

/// State of one worker, shared between its loop and whoever may close it.
///
/// Transitions and listener calls happen under one mutex, so listeners see
/// a contiguous history. `request_close` never waits for that mutex: it
/// records the request and performs the transition only when the mutex is
/// free, otherwise the next transition of the loop picks the request up.
pub struct WorkerStateMachine {
    client_id: String,
    state: AtomicCell<WorkerState>,
    shutdown_requested: AtomicCell<bool>,
    transition_lock: Mutex<()>,
    listener: RwLock<Option<Arc<dyn StateListener>>>,
}

impl WorkerStateMachine {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state: AtomicCell::new(WorkerState::Created),
            shutdown_requested: AtomicCell::new(false),
            transition_lock: Mutex::new(()),
            listener: RwLock::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    pub fn set_listener(&self, listener: Arc<dyn StateListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load()
    }

    /// Moves to `target` if the transition is legal. Returns false, without
    /// notifying anyone, when it is not.
    pub fn set_state(&self, target: WorkerState) -> bool {
        let _guard = self.transition_lock.lock();
        let changed = self.transition_locked(target);
        if changed && target != WorkerState::PendingShutdown {
            self.apply_requested_shutdown_locked();
        }
        changed
    }

    /// Requests shutdown. Idempotent and non-blocking; returns whether this
    /// call was the first request.
    pub fn request_close(&self) -> bool {
        if self.shutdown_requested.swap(true) {
            return false;
        }
        info!("{} shutdown requested", self.client_id);
        if let Some(_guard) = self.transition_lock.try_lock() {
            self.apply_requested_shutdown_locked();
        }
        true
    }

    /// Applies a pending close request that found the mutex busy.
    pub fn apply_requested_shutdown(&self) {
        if !self.is_shutdown_requested() {
            return;
        }
        let _guard = self.transition_lock.lock();
        self.apply_requested_shutdown_locked();
    }

    fn apply_requested_shutdown_locked(&self) {
        if self.shutdown_requested.load()
            && WorkerState::can_transition_to(self.state.load(), WorkerState::PendingShutdown)
        {
            self.transition_locked(WorkerState::PendingShutdown);
        }
    }

    fn transition_locked(&self, target: WorkerState) -> bool {
        let old = self.state.load();
        if !WorkerState::can_transition_to(old, target) {
            debug!(
                "{} rejected state transition: {} -> {}",
                self.client_id, old, target
            );
            return false;
        }
        self.state.store(target);
        info!("{} state transition: {} -> {}", self.client_id, old, target);
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_change(&self.client_id, target, old);
        }
        true
    }
}

impl Debug for WorkerStateMachine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerStateMachine")
            .field("client_id", &self.client_id)
            .field("state", &self.state.load())
            .field("shutdown_requested", &self.shutdown_requested.load())
            .finish()
    }
}

/// Listener that keeps every transition, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct StateHistory {
    transitions: Mutex<Vec<(WorkerState, WorkerState)>>,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(new_state, old_state)` pairs in order.
    pub fn transitions(&self) -> Vec<(WorkerState, WorkerState)> {
        self.transitions.lock().clone()
    }

    /// Whether every old state equals the new state of the call before.
    pub fn is_contiguous(&self) -> bool {
        self.transitions
            .lock()
            .windows(2)
            .all(|pair| pair[1].1 == pair[0].0)
    }
}

impl StateListener for StateHistory {
    fn on_change(&self, _client_id: &str, new_state: WorkerState, old_state: WorkerState) {
        self.transitions.lock().push((new_state, old_state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    fn machine() -> (WorkerStateMachine, Arc<StateHistory>) {
        let machine = WorkerStateMachine::new("worker-1");
        let history = Arc::new(StateHistory::new());
        machine.set_listener(history.clone());
        (machine, history)
    }

    #[test]
    fn full_lifecycle_is_contiguous() {
        let (machine, history) = machine();
        for target in [Running, PartitionsRevoked, AssigningPartitions, Running] {
            assert!(machine.set_state(target));
        }
        assert!(machine.request_close());
        assert!(machine.set_state(Dead));

        assert_eq!(
            history.transitions(),
            vec![
                (Running, Created),
                (PartitionsRevoked, Running),
                (AssigningPartitions, PartitionsRevoked),
                (Running, AssigningPartitions),
                (PendingShutdown, Running),
                (Dead, PendingShutdown),
            ]
        );
        assert!(history.is_contiguous());
    }

    #[test]
    fn invalid_transition_is_rejected_silently() {
        let (machine, history) = machine();
        assert!(!machine.set_state(AssigningPartitions));
        assert!(!machine.set_state(Dead));
        assert_eq!(machine.state(), Created);
        assert!(history.transitions().is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let (machine, history) = machine();
        machine.set_state(Running);
        assert!(machine.request_close());
        assert!(!machine.request_close());
        machine.set_state(Dead);
        assert!(!machine.request_close());
        assert_eq!(machine.state(), Dead);
        assert_eq!(history.transitions().len(), 3);
    }

    #[test]
    fn close_of_created_worker() {
        let (machine, _) = machine();
        machine.request_close();
        assert_eq!(machine.state(), PendingShutdown);
        assert!(!machine.set_state(Running));
    }

    #[test]
    fn contended_close_is_applied_by_next_transition() {
        let (machine, history) = machine();
        machine.set_state(Running);
        {
            let _busy = machine.transition_lock.lock();
            assert!(machine.request_close());
            assert_eq!(machine.state(), Running);
        }
        assert!(machine.set_state(PartitionsRevoked));
        assert_eq!(machine.state(), PendingShutdown);
        assert!(history.is_contiguous());
        assert!(!machine.set_state(AssigningPartitions));
    }

    #[test]
    fn close_from_another_thread_while_listener_runs() {
        #[derive(Debug)]
        struct ClosingListener(Arc<WorkerStateMachine>);
        impl StateListener for ClosingListener {
            fn on_change(&self, _: &str, new_state: WorkerState, _: WorkerState) {
                if new_state == PartitionsRevoked {
                    // runs under the transition mutex and must not block
                    self.0.request_close();
                }
            }
        }

        let machine = Arc::new(WorkerStateMachine::new("worker-1"));
        machine.set_listener(Arc::new(ClosingListener(machine.clone())));
        machine.set_state(Running);
        assert!(machine.set_state(PartitionsRevoked));
        assert_eq!(machine.state(), PendingShutdown);
    }
}
