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

//! Narrow interfaces to the wire level clients and the group protocol.
//!
//! The worker never talks to a broker directly. It receives rebalance
//! notifications and records through [`Consumer::poll`], writes through
//! [`Producer`], and replays changelogs through [`RestoreConsumer`]. The
//! [`mock`] module provides in-memory implementations used by the tests and
//! by the demo binary.

pub mod mock;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::message::{ConsumerRecord, ProducerRecord, TopicPartition};
use crate::AppResult;

/// One thing that happened during a poll. Rebalance notifications are
/// delivered on the polling thread, in order, before any record of the new
/// generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Revoked(HashSet<TopicPartition>),
    Assigned(HashSet<TopicPartition>),
    Records(Vec<ConsumerRecord>),
}

pub trait Consumer: Send + Sync + Debug {
    fn subscribe(&self, topics: &[String]) -> AppResult<()>;
    fn poll(&self, timeout: Duration) -> AppResult<Vec<PollEvent>>;
    /// Offsets are the position of the next record to consume.
    fn commit_sync(&self, offsets: &HashMap<TopicPartition, i64>) -> AppResult<()>;
    /// Stops returning records of `partitions` until they are resumed.
    fn pause(&self, partitions: &[TopicPartition]) -> AppResult<()>;
    fn resume(&self, partitions: &[TopicPartition]) -> AppResult<()>;
    fn close(&self) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

pub trait Producer: Send + Sync + Debug {
    fn init_transactions(&self) -> AppResult<()>;
    fn begin_transaction(&self) -> AppResult<()>;
    fn send(&self, record: ProducerRecord) -> AppResult<RecordMetadata>;
    fn send_offsets_to_transaction(
        &self,
        offsets: &HashMap<TopicPartition, i64>,
        group_id: &str,
    ) -> AppResult<()>;
    fn commit_transaction(&self) -> AppResult<()>;
    fn abort_transaction(&self) -> AppResult<()>;
    fn flush(&self) -> AppResult<()>;
    fn close(&self) -> AppResult<()>;
}

/// Reads changelog partitions to rebuild local state.
pub trait RestoreConsumer: Send + Sync + Debug {
    /// Returns every record of `partition` at or after `from_offset`.
    fn read_changelog(
        &self,
        partition: &TopicPartition,
        from_offset: i64,
    ) -> AppResult<Vec<ConsumerRecord>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub client_id: String,
    /// set only for per-task producers in exactly-once mode
    pub transactional_id: Option<String>,
}

/// Factory for every client a worker needs.
pub trait ClientSupplier: Send + Sync + Debug {
    fn get_producer(&self, config: &ProducerConfig) -> Arc<dyn Producer>;
    fn get_consumer(&self, client_id: &str) -> Arc<dyn Consumer>;
    fn get_restore_consumer(&self, client_id: &str) -> Arc<dyn RestoreConsumer>;
}

/// Identity comparison of two client handles regardless of the trait object
/// they are viewed through.
pub fn same_client<A: ?Sized, B: ?Sized>(a: &Arc<A>, b: &Arc<B>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
