mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{active, partitions, record, task, tp, Cluster};
use stonestream::worker::{StateHistory, WorkerState};
use stonestream::{AppError, ProcessingGuarantee, StreamsConfig};

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn started_worker_rebalances_and_shuts_down() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let config = StreamsConfig {
        poll_ms: 10,
        ..cluster.config.clone()
    };
    let w1 = cluster.worker_with_config("w1", config);
    let history = Arc::new(StateHistory::new());
    w1.worker.set_state_listener(history.clone());
    w1.assignor.set(active(&[0]));
    w1.consumer.schedule_rebalance(HashSet::new(), partitions(&[0]));
    w1.consumer.add_record(record(0, 0, "a"));
    let consumer = w1.consumer.clone();

    let mut handle = w1.worker.start().unwrap();
    // a second poll means the iteration that assigned and processed is done
    assert!(wait_for(Duration::from_secs(5), || {
        history
            .transitions()
            .contains(&(WorkerState::Running, WorkerState::AssigningPartitions))
            && consumer.poll_count() >= 2
    }));
    assert!(handle.is_alive());
    assert_eq!(cluster.state_directory.lock_owner(task(0)).as_deref(), Some("w1"));

    handle.close();
    handle.join().unwrap();

    assert_eq!(handle.state(), WorkerState::Dead);
    assert!(!handle.is_alive());
    assert!(consumer.closed());
    assert_eq!(consumer.subscription(), vec![common::INPUT.to_string()]);
    assert!(!cluster.state_directory.is_locked(task(0)));
    assert!(history.is_contiguous());
    assert_eq!(
        history.transitions().last(),
        Some(&(WorkerState::Dead, WorkerState::PendingShutdown))
    );
    // clean shutdown commits what was processed
    assert_eq!(consumer.committed(&tp(0)), Some(1));
}

#[test]
fn close_is_idempotent_on_dead_worker() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let config = StreamsConfig {
        poll_ms: 10,
        ..cluster.config.clone()
    };
    let w1 = cluster.worker_with_config("w1", config);
    let mut handle = w1.worker.start().unwrap();

    handle.close();
    handle.join().unwrap();
    assert_eq!(handle.state(), WorkerState::Dead);

    handle.close();
    handle.close();
    assert_eq!(handle.state(), WorkerState::Dead);
    assert!(handle.join().is_ok());
}

#[test]
fn closed_before_start_never_runs() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.close();
    assert_eq!(w1.worker.state(), WorkerState::PendingShutdown);

    w1.worker.run().unwrap();
    assert_eq!(w1.worker.state(), WorkerState::Dead);
    assert!(w1.consumer.subscription().is_empty());
    assert_eq!(w1.consumer.poll_count(), 0);
    assert!(w1.consumer.closed());
}

#[test]
fn fatal_error_ends_dead() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let mut w1 = cluster.worker("w1");
    let history = Arc::new(StateHistory::new());
    w1.worker.set_state_listener(history.clone());
    // a consumer closed under the worker's feet fails the next poll
    stonestream::client::Consumer::close(w1.consumer.as_ref()).unwrap();

    let result = w1.worker.run();
    assert!(matches!(result, Err(AppError::IllegalStateTransition(_))));
    assert_eq!(w1.worker.state(), WorkerState::Dead);
    assert_eq!(
        history.transitions(),
        vec![
            (WorkerState::Running, WorkerState::Created),
            (WorkerState::PendingShutdown, WorkerState::Running),
            (WorkerState::Dead, WorkerState::PendingShutdown),
        ]
    );
}

#[test]
fn commit_waits_for_full_interval() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0]));

    w1.consumer.add_record(record(0, 41, "a"));
    cluster.clock.set(999);
    w1.worker.run_once().unwrap();
    assert_eq!(w1.consumer.commit_count(), 0);
    assert_eq!(cluster.sensor_count("w1", "commit-latency"), 0);

    cluster.clock.set(1000);
    w1.worker.run_once().unwrap();
    assert_eq!(w1.consumer.commit_count(), 1);
    assert_eq!(w1.consumer.committed(&tp(0)), Some(42));
    assert_eq!(cluster.sensor_count("w1", "commit-latency"), 1);
    assert_eq!(w1.worker.commit_scheduler().last_commit_ms(), 1000);
}

#[test]
fn records_of_unowned_partitions_are_skipped() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let mut w1 = cluster.worker("w1");
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0]));

    w1.consumer
        .add_records(vec![record(0, 0, "a"), record(5, 0, "b"), record(6, 0, "c")]);
    w1.worker.run_once().unwrap();

    assert_eq!(w1.count(task(0), "a"), 1);
    assert_eq!(cluster.sensor_count("w1", "skipped-records"), 2);
    assert_eq!(cluster.sensor_count("w1", "process-latency"), 1);
}

#[test]
fn full_partition_buffer_pauses_the_partition() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let config = StreamsConfig {
        buffered_records_per_partition: 2,
        ..cluster.config.clone()
    };
    let mut w1 = cluster.worker_with_config("w1", config);
    w1.worker.initialize().unwrap();
    w1.rebalance(&HashSet::new(), active(&[0]));

    w1.consumer
        .add_records(vec![record(0, 0, "a"), record(0, 1, "a"), record(0, 2, "a")]);
    w1.worker.run_once().unwrap();

    // paused while buffered, resumed once drained
    assert!(w1.consumer.paused().is_empty());
    assert_eq!(w1.count(task(0), "a"), 3);
}

#[test]
fn worker_metrics_are_registered_and_removed() {
    let cluster = Cluster::new(ProcessingGuarantee::AtLeastOnce);
    let mut w1 = cluster.worker("w1");

    let tags = [("client-id", "w1")];
    for name in [
        "commit-latency-avg",
        "commit-latency-max",
        "commit-rate",
        "poll-latency-avg",
        "poll-latency-max",
        "poll-rate",
        "process-latency-avg",
        "process-latency-max",
        "process-rate",
        "punctuate-latency-avg",
        "punctuate-latency-max",
        "punctuate-rate",
        "task-created-rate",
        "task-closed-rate",
        "skipped-records-rate",
    ] {
        assert!(
            cluster.metrics.find(name, "stream-metrics", &tags).is_some(),
            "missing {}",
            name
        );
    }

    w1.worker.initialize().unwrap();
    w1.worker.run_once().unwrap();
    assert_eq!(cluster.sensor_count("w1", "poll-latency"), 1);

    w1.worker.close();
    w1.worker.shutdown(true);
    assert!(cluster.metrics.find("poll-rate", "stream-metrics", &tags).is_none());
}
