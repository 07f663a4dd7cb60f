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

use std::fmt::Debug;

use crossbeam::atomic::AtomicCell;

/// Millisecond time source injected into workers and the commit scheduler.
pub trait Clock: Send + Sync + Debug {
    fn milliseconds(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn milliseconds(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct MockClock {
    now_ms: AtomicCell<u64>,
}

impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicCell::new(start_ms),
        }
    }

    pub fn sleep(&self, ms: u64) {
        self.now_ms.fetch_add(ms);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms);
    }
}

impl Clock for MockClock {
    fn milliseconds(&self) -> u64 {
        self.now_ms.load()
    }
}
