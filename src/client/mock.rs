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

//! In-memory clients.
//!
//! `MockRestoreConsumer` doubles as the changelog log of an in-memory
//! cluster: producers built by [`MockClientSupplier`] append every visible
//! write (immediately without transactions, at commit with transactions) to
//! it, so state written by one worker can be restored by another.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::message::{ConsumerRecord, ProducerRecord, TopicPartition};
use crate::{AppError, AppResult};

use super::{
    ClientSupplier, Consumer, PollEvent, Producer, ProducerConfig, RecordMetadata,
    RestoreConsumer,
};

static NEXT_PRODUCER_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Default)]
struct MockConsumerState {
    subscription: Vec<String>,
    pending: VecDeque<PollEvent>,
    paused: HashSet<TopicPartition>,
    held: Vec<ConsumerRecord>,
    committed: HashMap<TopicPartition, i64>,
    commit_count: usize,
    poll_count: usize,
    closed: bool,
}

/// Consumer whose rebalances and records are scripted by the test.
#[derive(Debug, Default)]
pub struct MockConsumer {
    state: Mutex<MockConsumerState>,
    wakeup: Condvar,
}

impl MockConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: PollEvent) {
        self.state.lock().pending.push_back(event);
        self.wakeup.notify_all();
    }

    /// Queues a full rebalance: the revoke callback, then the assign callback.
    pub fn schedule_rebalance(
        &self,
        revoked: HashSet<TopicPartition>,
        assigned: HashSet<TopicPartition>,
    ) {
        let mut state = self.state.lock();
        state.pending.push_back(PollEvent::Revoked(revoked));
        state.pending.push_back(PollEvent::Assigned(assigned));
        drop(state);
        self.wakeup.notify_all();
    }

    pub fn add_record(&self, record: ConsumerRecord) {
        self.push(PollEvent::Records(vec![record]));
    }

    pub fn add_records(&self, records: Vec<ConsumerRecord>) {
        self.push(PollEvent::Records(records));
    }

    pub fn subscription(&self) -> Vec<String> {
        self.state.lock().subscription.clone()
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.state.lock().committed.get(partition).copied()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commit_count
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().poll_count
    }

    pub fn closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn paused(&self) -> HashSet<TopicPartition> {
        self.state.lock().paused.clone()
    }
}

impl Consumer for MockConsumer {
    fn subscribe(&self, topics: &[String]) -> AppResult<()> {
        self.state.lock().subscription = topics.to_vec();
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> AppResult<Vec<PollEvent>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AppError::IllegalStateTransition(
                "poll on closed consumer".to_string(),
            ));
        }
        state.poll_count += 1;
        if state.pending.is_empty() && !timeout.is_zero() {
            self.wakeup.wait_for(&mut state, timeout);
        }

        let MockConsumerState {
            pending,
            paused,
            held,
            ..
        } = &mut *state;
        let mut events = Vec::with_capacity(pending.len() + 1);
        let (released, still_held): (Vec<_>, Vec<_>) = held
            .drain(..)
            .partition(|r| !paused.contains(&r.topic_partition()));
        *held = still_held;
        if !released.is_empty() {
            events.push(PollEvent::Records(released));
        }
        for event in pending.drain(..) {
            match event {
                PollEvent::Records(records) => {
                    let (deliver, hold): (Vec<_>, Vec<_>) = records
                        .into_iter()
                        .partition(|r| !paused.contains(&r.topic_partition()));
                    held.extend(hold);
                    if !deliver.is_empty() {
                        events.push(PollEvent::Records(deliver));
                    }
                }
                other => events.push(other),
            }
        }
        Ok(events)
    }

    fn commit_sync(&self, offsets: &HashMap<TopicPartition, i64>) -> AppResult<()> {
        let mut state = self.state.lock();
        state.commit_count += 1;
        for (partition, offset) in offsets {
            state.committed.insert(partition.clone(), *offset);
        }
        Ok(())
    }

    fn pause(&self, partitions: &[TopicPartition]) -> AppResult<()> {
        self.state.lock().paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> AppResult<()> {
        let mut state = self.state.lock();
        for partition in partitions {
            state.paused.remove(partition);
        }
        Ok(())
    }

    fn close(&self) -> AppResult<()> {
        self.state.lock().closed = true;
        self.wakeup.notify_all();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockProducerState {
    history: Vec<ProducerRecord>,
    uncommitted: Vec<ProducerRecord>,
    sent_offsets: Vec<HashMap<TopicPartition, i64>>,
    next_offsets: HashMap<TopicPartition, i64>,
    transaction_initialized: bool,
    transaction_in_flight: bool,
    transaction_committed: bool,
    transaction_aborted: bool,
    commit_count: u64,
    flush_count: u64,
    fenced: bool,
    closed: bool,
}

/// Producer that keeps everything it was asked to do.
#[derive(Debug)]
pub struct MockProducer {
    id: usize,
    config: ProducerConfig,
    changelog: Option<Arc<MockRestoreConsumer>>,
    state: Mutex<MockProducerState>,
}

impl MockProducer {
    pub fn new(config: ProducerConfig, changelog: Option<Arc<MockRestoreConsumer>>) -> Self {
        Self {
            id: NEXT_PRODUCER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            changelog,
            state: Mutex::new(MockProducerState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    fn is_transactional(&self) -> bool {
        self.config.transactional_id.is_some()
    }

    /// Simulates another producer with the same transactional id taking over.
    pub fn fence_producer(&self) {
        self.state.lock().fenced = true;
    }

    pub fn history(&self) -> Vec<ProducerRecord> {
        self.state.lock().history.clone()
    }

    pub fn commit_count(&self) -> u64 {
        self.state.lock().commit_count
    }

    pub fn flush_count(&self) -> u64 {
        self.state.lock().flush_count
    }

    pub fn transaction_in_flight(&self) -> bool {
        self.state.lock().transaction_in_flight
    }

    pub fn transaction_committed(&self) -> bool {
        self.state.lock().transaction_committed
    }

    pub fn transaction_aborted(&self) -> bool {
        self.state.lock().transaction_aborted
    }

    pub fn sent_offsets(&self) -> Vec<HashMap<TopicPartition, i64>> {
        self.state.lock().sent_offsets.clone()
    }

    pub fn closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(&self, state: &MockProducerState) -> AppResult<()> {
        if state.closed {
            return Err(AppError::IllegalStateTransition(format!(
                "producer {} is closed",
                self.id
            )));
        }
        if state.fenced {
            return Err(AppError::ProducerFenced(format!(
                "transactional id {:?} was taken over by a newer producer",
                self.config.transactional_id
            )));
        }
        Ok(())
    }

    fn check_transactional(&self, operation: &str) -> AppResult<()> {
        if !self.is_transactional() {
            return Err(AppError::IllegalStateTransition(format!(
                "{} on a producer without transactional id",
                operation
            )));
        }
        Ok(())
    }

    fn publish(&self, records: &[ProducerRecord]) {
        if let Some(changelog) = &self.changelog {
            for record in records {
                if let Some(partition) = record.partition {
                    changelog.append(
                        TopicPartition::new(record.topic.clone(), partition),
                        record.key.clone(),
                        record.value.clone(),
                    );
                }
            }
        }
    }
}

impl Producer for MockProducer {
    fn init_transactions(&self) -> AppResult<()> {
        self.check_transactional("init_transactions")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;
        state.transaction_initialized = true;
        Ok(())
    }

    fn begin_transaction(&self) -> AppResult<()> {
        self.check_transactional("begin_transaction")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if !state.transaction_initialized || state.transaction_in_flight {
            return Err(AppError::IllegalStateTransition(
                "begin_transaction requires an initialized producer without open transaction"
                    .to_string(),
            ));
        }
        state.transaction_in_flight = true;
        state.transaction_committed = false;
        state.transaction_aborted = false;
        Ok(())
    }

    fn send(&self, record: ProducerRecord) -> AppResult<RecordMetadata> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if self.is_transactional() && !state.transaction_in_flight {
            return Err(AppError::IllegalStateTransition(
                "send outside of a transaction".to_string(),
            ));
        }
        let partition = record.partition.unwrap_or(0);
        let tp = TopicPartition::new(record.topic.clone(), partition);
        let base = match (&self.changelog, record.partition) {
            (Some(changelog), Some(_)) => changelog.end_offset(&tp),
            _ => 0,
        };
        let pending = state
            .uncommitted
            .iter()
            .filter(|r| r.topic == record.topic && r.partition == record.partition)
            .count() as i64;
        let local = state.next_offsets.entry(tp.clone()).or_insert(0);
        let offset = if self.changelog.is_some() && record.partition.is_some() {
            base + pending
        } else {
            *local
        };
        *local += 1;

        state.history.push(record.clone());
        if self.is_transactional() {
            state.uncommitted.push(record);
        } else {
            drop(state);
            self.publish(std::slice::from_ref(&record));
        }
        trace!("mock producer {} sent to {} at {}", self.id, tp, offset);
        Ok(RecordMetadata {
            topic: tp.topic,
            partition,
            offset,
        })
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &HashMap<TopicPartition, i64>,
        _group_id: &str,
    ) -> AppResult<()> {
        self.check_transactional("send_offsets_to_transaction")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;
        state.sent_offsets.push(offsets.clone());
        Ok(())
    }

    fn commit_transaction(&self) -> AppResult<()> {
        self.check_transactional("commit_transaction")?;
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if !state.transaction_in_flight {
            return Err(AppError::IllegalStateTransition(
                "commit_transaction without open transaction".to_string(),
            ));
        }
        state.transaction_in_flight = false;
        state.transaction_committed = true;
        state.commit_count += 1;
        let committed: Vec<ProducerRecord> = state.uncommitted.drain(..).collect();
        drop(state);
        self.publish(&committed);
        Ok(())
    }

    fn abort_transaction(&self) -> AppResult<()> {
        self.check_transactional("abort_transaction")?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(AppError::IllegalStateTransition(
                "abort_transaction on closed producer".to_string(),
            ));
        }
        state.uncommitted.clear();
        state.transaction_in_flight = false;
        state.transaction_aborted = true;
        Ok(())
    }

    fn flush(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        state.flush_count += 1;
        Ok(())
    }

    fn close(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.uncommitted.clear();
        state.transaction_in_flight = false;
        state.closed = true;
        Ok(())
    }
}

/// Changelog log of the in-memory cluster.
#[derive(Debug, Default)]
pub struct MockRestoreConsumer {
    logs: Mutex<HashMap<TopicPartition, Vec<ConsumerRecord>>>,
}

impl MockRestoreConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, partition: TopicPartition, key: Option<Bytes>, value: Option<Bytes>) -> i64 {
        let mut logs = self.logs.lock();
        let log = logs.entry(partition.clone()).or_default();
        let offset = log.len() as i64;
        log.push(ConsumerRecord::new(
            partition.topic,
            partition.partition,
            offset,
            key,
            value,
        ));
        offset
    }

    pub fn end_offset(&self, partition: &TopicPartition) -> i64 {
        self.logs
            .lock()
            .get(partition)
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }
}

impl RestoreConsumer for MockRestoreConsumer {
    fn read_changelog(
        &self,
        partition: &TopicPartition,
        from_offset: i64,
    ) -> AppResult<Vec<ConsumerRecord>> {
        let logs = self.logs.lock();
        Ok(logs
            .get(partition)
            .map(|log| {
                log.iter()
                    .filter(|r| r.offset >= from_offset)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Hands out in-memory clients and remembers every one of them.
#[derive(Debug, Default)]
pub struct MockClientSupplier {
    producers: Mutex<Vec<Arc<MockProducer>>>,
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
    restore_consumer: Arc<MockRestoreConsumer>,
}

impl MockClientSupplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producers(&self) -> Vec<Arc<MockProducer>> {
        self.producers.lock().clone()
    }

    pub fn consumers(&self) -> Vec<Arc<MockConsumer>> {
        self.consumers.lock().clone()
    }

    /// Consumer handed to the n-th worker.
    pub fn consumer(&self, index: usize) -> Option<Arc<MockConsumer>> {
        self.consumers.lock().get(index).cloned()
    }

    pub fn restore_consumer(&self) -> Arc<MockRestoreConsumer> {
        self.restore_consumer.clone()
    }
}

impl ClientSupplier for MockClientSupplier {
    fn get_producer(&self, config: &ProducerConfig) -> Arc<dyn Producer> {
        let producer = Arc::new(MockProducer::new(
            config.clone(),
            Some(self.restore_consumer.clone()),
        ));
        self.producers.lock().push(producer.clone());
        producer
    }

    fn get_consumer(&self, _client_id: &str) -> Arc<dyn Consumer> {
        let consumer = Arc::new(MockConsumer::new());
        self.consumers.lock().push(consumer.clone());
        consumer
    }

    fn get_restore_consumer(&self, _client_id: &str) -> Arc<dyn RestoreConsumer> {
        self.restore_consumer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eos_producer(changelog: Option<Arc<MockRestoreConsumer>>) -> MockProducer {
        MockProducer::new(
            ProducerConfig {
                client_id: "c".to_string(),
                transactional_id: Some("app-0_0".to_string()),
            },
            changelog,
        )
    }

    #[test]
    fn transactional_records_visible_after_commit() {
        let changelog = Arc::new(MockRestoreConsumer::new());
        let producer = eos_producer(Some(changelog.clone()));
        producer.init_transactions().unwrap();
        producer.begin_transaction().unwrap();
        let meta = producer
            .send(ProducerRecord::new("log", Some(0), None, Some(Bytes::from("a"))))
            .unwrap();
        assert_eq!(meta.offset, 0);
        let tp = TopicPartition::new("log", 0);
        assert!(changelog.read_changelog(&tp, 0).unwrap().is_empty());

        producer.commit_transaction().unwrap();
        assert_eq!(producer.commit_count(), 1);
        assert_eq!(changelog.read_changelog(&tp, 0).unwrap().len(), 1);
    }

    #[test]
    fn fenced_producer_rejects_commit_and_keeps_count() {
        let producer = eos_producer(None);
        producer.init_transactions().unwrap();
        producer.begin_transaction().unwrap();
        producer.commit_transaction().unwrap();
        producer.begin_transaction().unwrap();
        producer.fence_producer();

        let err = producer.commit_transaction().unwrap_err();
        assert!(err.is_fenced());
        assert_eq!(producer.commit_count(), 1);
        assert!(producer.begin_transaction().is_err());
    }

    #[test]
    fn send_outside_transaction_is_rejected() {
        let producer = eos_producer(None);
        producer.init_transactions().unwrap();
        let err = producer
            .send(ProducerRecord::new("out", None, None, None))
            .unwrap_err();
        assert!(matches!(err, AppError::IllegalStateTransition(_)));
    }

    #[test]
    fn consumer_delivers_scripted_events_in_order() {
        let consumer = MockConsumer::new();
        let tp = TopicPartition::new("t", 0);
        consumer.schedule_rebalance(HashSet::new(), HashSet::from([tp.clone()]));
        consumer.add_record(ConsumerRecord::new("t", 0, 0, None, None));

        let events = consumer.poll(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], PollEvent::Revoked(HashSet::new()));
        assert_eq!(events[1], PollEvent::Assigned(HashSet::from([tp])));
        assert!(matches!(events[2], PollEvent::Records(_)));
        assert!(consumer.poll(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn paused_partitions_are_held_back() {
        let consumer = MockConsumer::new();
        let tp = TopicPartition::new("t", 0);
        consumer.pause(&[tp.clone()]).unwrap();
        consumer.add_record(ConsumerRecord::new("t", 0, 0, None, None));
        consumer.add_record(ConsumerRecord::new("t", 1, 0, None, None));

        let events = consumer.poll(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 1);

        consumer.resume(&[tp]).unwrap();
        let events = consumer.poll(Duration::ZERO).unwrap();
        match &events[..] {
            [PollEvent::Records(records)] => assert_eq!(records[0].partition, 0),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn supplier_remembers_clients() {
        let supplier = MockClientSupplier::new();
        let config = ProducerConfig {
            client_id: "c".to_string(),
            transactional_id: None,
        };
        let a = supplier.get_producer(&config);
        let b = supplier.get_producer(&config);
        assert_eq!(supplier.producers().len(), 2);
        assert!(crate::client::same_client(&a, &supplier.producers()[0]));
        assert!(!crate::client::same_client(&a, &b));
    }
}
