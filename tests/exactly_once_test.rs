mod common;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use common::{active, partitions, record, task, Cluster, OUTPUT};
use rstest::rstest;
use stonestream::client::same_client;
use stonestream::task::{ProcessorContext, ProcessorSupplier, RecordProcessor};
use stonestream::worker::{ConsumerRebalanceListener, WorkerState};
use stonestream::{AppResult, ConsumerRecord, ProcessingGuarantee, TaskId};

#[rstest]
#[case::at_least_once(ProcessingGuarantee::AtLeastOnce, 1)]
#[case::exactly_once(ProcessingGuarantee::ExactlyOnce, 3)]
fn producers_follow_processing_guarantee(
    #[case] guarantee: ProcessingGuarantee,
    #[case] expected_producers: usize,
) {
    let cluster = Cluster::new(guarantee);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0, 1, 2]));

    let producers = cluster.supplier.producers();
    assert_eq!(producers.len(), expected_producers);

    let manager = w1.worker.task_manager();
    let task_producers: Vec<_> = [0, 1, 2]
        .iter()
        .map(|p| manager.active_task(task(*p)).unwrap().producer().clone())
        .collect();
    match guarantee {
        ProcessingGuarantee::AtLeastOnce => {
            assert!(task_producers
                .iter()
                .all(|p| same_client(p, &task_producers[0])));
            assert!(same_client(&task_producers[0], &producers[0]));
            assert!(producers[0].config().transactional_id.is_none());
        }
        ProcessingGuarantee::ExactlyOnce => {
            for (i, p) in [0, 1, 2].iter().enumerate() {
                let expected = cluster.task_producer(task(*p)).unwrap();
                assert!(same_client(&task_producers[i], &expected));
                assert!(expected.transaction_in_flight());
            }
            assert!(!same_client(&task_producers[0], &task_producers[1]));
            assert!(manager.producers().shared_producer().is_none());
        }
    }

    w1.worker.close();
    w1.worker.shutdown(true);
    assert!(cluster.supplier.producers().iter().all(|p| p.closed()));
}

#[test]
fn exactly_once_commit_goes_through_the_transaction() {
    let cluster = Cluster::new(ProcessingGuarantee::ExactlyOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0]));

    w1.consumer.add_records(vec![record(0, 0, "a"), record(0, 1, "b")]);
    w1.worker.run_once().unwrap();
    cluster.clock.set(1000);
    w1.worker.run_once().unwrap();

    let producer = cluster.task_producer(task(0)).unwrap();
    assert_eq!(producer.commit_count(), 1);
    assert!(producer.transaction_in_flight());
    let sent = producer.sent_offsets();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].get(&common::tp(0)), Some(&2));
    // offsets never go through the consumer with transactions
    assert_eq!(w1.consumer.commit_count(), 0);
}

#[test]
fn fenced_producer_at_commit_removes_only_that_task() {
    let cluster = Cluster::new(ProcessingGuarantee::ExactlyOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0, 1]));

    w1.consumer.add_record(record(0, 0, "a"));
    w1.worker.run_once().unwrap();

    let zombie = cluster.task_producer(task(0)).unwrap();
    zombie.fence_producer();
    cluster.clock.set(1000);
    w1.worker.run_once().unwrap();

    assert_eq!(w1.worker.state(), WorkerState::Running);
    assert_eq!(w1.owned_partitions(), partitions(&[1]));
    assert_eq!(zombie.commit_count(), 0);
    assert!(zombie.closed());
    assert!(!cluster.state_directory.is_locked(task(0)));
    assert_eq!(
        cluster.task_producer(task(1)).unwrap().commit_count(),
        1
    );
    assert_eq!(cluster.sensor_count("w1", "task-closed"), 1);
}

#[test]
fn fenced_producer_at_resume_is_dropped() {
    let cluster = Cluster::new(ProcessingGuarantee::ExactlyOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0]));

    {
        let mut listener = w1.worker.rebalance_listener();
        listener
            .on_partitions_revoked(Some(&partitions(&[0])))
            .unwrap();
    }
    let zombie = cluster.task_producer(task(0)).unwrap();
    assert_eq!(zombie.commit_count(), 1);
    zombie.fence_producer();

    w1.assignor.set(active(&[0]));
    {
        let mut listener = w1.worker.rebalance_listener();
        listener
            .on_partitions_assigned(&partitions(&[0]))
            .unwrap();
    }

    assert_eq!(w1.worker.state(), WorkerState::Running);
    assert!(w1.worker.task_manager().tasks().is_empty());
    assert!(w1.worker.task_manager().suspended_tasks().is_empty());
    assert_eq!(zombie.commit_count(), 1);
    assert!(!cluster.state_directory.is_locked(task(0)));
}

#[test]
fn exactly_once_state_survives_clean_handoff() {
    let cluster = Cluster::new(ProcessingGuarantee::ExactlyOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0]));
    w1.consumer
        .add_records(vec![record(0, 0, "k"), record(0, 1, "k")]);
    w1.worker.run_once().unwrap();
    w1.rebalance(&partitions(&[0]), active(&[]));

    let mut w2 = cluster.worker("w2");
    w2.worker.initialize().unwrap();
    w2.rebalance(&HashSet::new(), active(&[0]));
    assert_eq!(w2.count(task(0), "k"), 2);
}

#[test]
fn fenced_producer_at_revoke_drops_the_zombie() {
    let cluster = Cluster::new(ProcessingGuarantee::ExactlyOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0, 1, 2]));

    let zombie = cluster.task_producer(task(0)).unwrap();
    zombie.fence_producer();
    {
        let mut listener = w1.worker.rebalance_listener();
        listener
            .on_partitions_revoked(Some(&partitions(&[0, 1, 2])))
            .unwrap();
    }

    assert_eq!(w1.worker.state(), WorkerState::PartitionsRevoked);
    let manager = w1.worker.task_manager();
    assert_eq!(
        manager.suspended_tasks().keys().copied().collect::<Vec<_>>(),
        vec![task(1), task(2)]
    );
    assert_eq!(
        manager.prev_active_tasks(),
        &BTreeSet::from([task(0), task(1), task(2)])
    );
    assert!(zombie.closed());
    assert_eq!(zombie.commit_count(), 0);
    assert!(!cluster.state_directory.is_locked(task(0)));
    assert_eq!(cluster.state_directory.lock_owner(task(1)).as_deref(), Some("w1"));
    assert_eq!(cluster.task_producer(task(1)).unwrap().commit_count(), 1);
    assert_eq!(cluster.sensor_count("w1", "task-closed"), 1);
}

#[test]
fn fenced_producer_while_processing_removes_only_that_task() {
    let cluster = Cluster::new(ProcessingGuarantee::ExactlyOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0, 1]));

    let zombie = cluster.task_producer(task(0)).unwrap();
    zombie.fence_producer();
    w1.consumer
        .add_records(vec![record(0, 0, "a"), record(1, 0, "b")]);
    w1.worker.run_once().unwrap();

    assert_eq!(w1.worker.state(), WorkerState::Running);
    assert_eq!(w1.owned_partitions(), partitions(&[1]));
    assert!(zombie.closed());
    assert!(zombie.history().is_empty());
    assert!(!cluster.state_directory.is_locked(task(0)));
    assert_eq!(w1.count(task(1), "b"), 1);
    assert_eq!(cluster.sensor_count("w1", "task-closed"), 1);
}

/// Emits one record per punctuation.
#[derive(Debug)]
struct Heartbeat;

impl RecordProcessor for Heartbeat {
    fn process(&mut self, _context: &mut ProcessorContext<'_>, _record: &ConsumerRecord) -> AppResult<()> {
        Ok(())
    }

    fn punctuate(&mut self, context: &mut ProcessorContext<'_>, _now_ms: u64) -> AppResult<()> {
        context.forward(OUTPUT, None, Some(bytes::Bytes::from_static(b"tick")))
    }
}

#[derive(Debug)]
struct HeartbeatSupplier;

impl ProcessorSupplier for HeartbeatSupplier {
    fn get(&self, _task_id: TaskId) -> Box<dyn RecordProcessor> {
        Box::new(Heartbeat)
    }
}

#[test]
fn fenced_producer_while_punctuating_removes_only_that_task() {
    let cluster = Cluster::new(ProcessingGuarantee::ExactlyOnce);
    let mut w1 =
        cluster.worker_with_processor("w1", cluster.config.clone(), Arc::new(HeartbeatSupplier));
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0, 1]));

    let zombie = cluster.task_producer(task(0)).unwrap();
    zombie.fence_producer();
    w1.worker.run_once().unwrap();

    assert_eq!(w1.worker.state(), WorkerState::Running);
    assert_eq!(w1.owned_partitions(), partitions(&[1]));
    assert!(zombie.closed());
    assert!(!cluster.state_directory.is_locked(task(0)));
    assert_eq!(cluster.task_producer(task(1)).unwrap().history().len(), 1);
}
