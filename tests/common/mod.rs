#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use stonestream::client::mock::{MockClientSupplier, MockConsumer, MockProducer};
use stonestream::metrics::Metrics;
use stonestream::state::KeyValueStore;
use stonestream::task::{KeyCountProcessor, KeyCountSupplier, ProcessorSupplier, TaskPartitions};
use stonestream::utils::MockClock;
use stonestream::{
    Assignment, ConsumerRecord, ProcessingGuarantee, StateDirectory, StaticAssignor,
    StreamsConfig, TaskId, TopicPartition, Worker,
};
use stonestream::worker::ConsumerRebalanceListener;
use tempfile::TempDir;

pub const INPUT: &str = "input";
pub const OUTPUT: &str = "output";
pub const STORE: &str = "counts";

/// Workers of one application sharing a state directory and the in-memory
/// clients.
pub struct Cluster {
    pub dir: TempDir,
    pub config: StreamsConfig,
    pub supplier: Arc<MockClientSupplier>,
    pub clock: Arc<MockClock>,
    pub metrics: Arc<Metrics>,
    pub state_directory: Arc<StateDirectory>,
}

pub struct TestWorker {
    pub worker: Worker,
    pub consumer: Arc<MockConsumer>,
    pub assignor: Arc<StaticAssignor>,
}

impl Cluster {
    pub fn new(guarantee: ProcessingGuarantee) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = StreamsConfig {
            application_id: "app".to_string(),
            state_dir: dir.path().to_string_lossy().to_string(),
            commit_interval_ms: Some(1000),
            poll_ms: 0,
            processing_guarantee: guarantee,
            num_stream_threads: 1,
            cache_max_entries: 100,
            buffered_records_per_partition: 1000,
            state_stores: vec![STORE.to_string()],
            source_topics: vec![INPUT.to_string()],
            sink_topic: Some(OUTPUT.to_string()),
        };
        let state_directory =
            Arc::new(StateDirectory::new(dir.path(), &config.application_id).unwrap());
        Self {
            dir,
            config,
            supplier: Arc::new(MockClientSupplier::new()),
            clock: Arc::new(MockClock::new(0)),
            metrics: Arc::new(Metrics::new()),
            state_directory,
        }
    }

    pub fn worker(&self, client_id: &str) -> TestWorker {
        self.worker_with_config(client_id, self.config.clone())
    }

    pub fn worker_with_config(&self, client_id: &str, config: StreamsConfig) -> TestWorker {
        self.worker_with_processor(
            client_id,
            config,
            Arc::new(KeyCountSupplier::new(STORE, Some(OUTPUT.to_string()))),
        )
    }

    pub fn worker_with_processor(
        &self,
        client_id: &str,
        config: StreamsConfig,
        processor_supplier: Arc<dyn ProcessorSupplier>,
    ) -> TestWorker {
        let mut worker = Worker::create(
            client_id,
            config,
            self.supplier.clone(),
            processor_supplier,
            self.state_directory.clone(),
            self.metrics.clone(),
            self.clock.clone(),
        )
        .unwrap();
        let consumer = self.supplier.consumers().pop().unwrap();
        let assignor = Arc::new(StaticAssignor::default());
        worker.set_assignment_provider(assignor.clone());
        TestWorker {
            worker,
            consumer,
            assignor,
        }
    }

    /// Producer created for `task` under exactly-once.
    pub fn task_producer(&self, task: TaskId) -> Option<Arc<MockProducer>> {
        let transactional_id = format!("{}-{}", self.config.application_id, task);
        self.supplier
            .producers()
            .into_iter()
            .rev()
            .find(|p| p.config().transactional_id.as_deref() == Some(transactional_id.as_str()))
    }

    pub fn sensor_count(&self, client_id: &str, sensor: &str) -> u64 {
        self.metrics
            .count(&format!("thread.{}.{}", client_id, sensor))
    }
}

impl TestWorker {
    /// Runs a full revoke then assign cycle with `assignment` as the
    /// assignor's answer.
    pub fn rebalance(&mut self, revoked: &HashSet<TopicPartition>, assignment: Assignment) {
        let assigned: HashSet<TopicPartition> = assignment
            .active
            .values()
            .chain(assignment.standby.values())
            .flatten()
            .cloned()
            .collect();
        self.assignor.set(assignment);
        let mut listener = self.worker.rebalance_listener();
        listener.on_partitions_revoked(Some(revoked)).unwrap();
        listener.on_partitions_assigned(&assigned).unwrap();
    }

    pub fn owned_partitions(&self) -> HashSet<TopicPartition> {
        self.worker
            .task_manager()
            .tasks()
            .into_values()
            .flatten()
            .collect()
    }

    /// Current count of `key` in the store of active task `task`.
    pub fn count(&mut self, task: TaskId, key: &str) -> u64 {
        let task = self
            .worker
            .task_manager_mut()
            .active_task_mut(task)
            .expect("task is active");
        task.state_manager_mut()
            .store(STORE)
            .unwrap()
            .get(key.as_bytes())
            .unwrap()
            .map(|v| KeyCountProcessor::decode_count(&v))
            .unwrap_or(0)
    }
}

pub fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(INPUT, partition)
}

pub fn partitions(ids: &[i32]) -> HashSet<TopicPartition> {
    ids.iter().map(|p| tp(*p)).collect()
}

pub fn task(partition: i32) -> TaskId {
    TaskId::new(0, partition)
}

/// One active task per listed partition.
pub fn active(ids: &[i32]) -> Assignment {
    let tasks: TaskPartitions = ids
        .iter()
        .map(|p| (task(*p), partitions(&[*p])))
        .collect();
    Assignment::active_only(tasks)
}

pub fn record(partition: i32, offset: i64, key: &str) -> ConsumerRecord {
    record_on(INPUT, partition, offset, key)
}

pub fn record_on(topic: &str, partition: i32, offset: i64, key: &str) -> ConsumerRecord {
    ConsumerRecord::new(
        topic,
        partition,
        offset,
        Some(Bytes::copy_from_slice(key.as_bytes())),
        Some(Bytes::from_static(b"v")),
    )
}
