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

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{MetricName, SensorRecorder, Stat, CLIENT_ID_TAG, METRICS_GROUP};

pub const COMMIT_LATENCY: &str = "commit-latency";
pub const POLL_LATENCY: &str = "poll-latency";
pub const PROCESS_LATENCY: &str = "process-latency";
pub const PUNCTUATE_LATENCY: &str = "punctuate-latency";
pub const TASK_CREATED: &str = "task-created";
pub const TASK_CLOSED: &str = "task-closed";
pub const SKIPPED_RECORDS: &str = "skipped-records";

/// latency sensor, operation name used for its rate metric
const LATENCY_SENSORS: [(&str, &str); 4] = [
    (COMMIT_LATENCY, "commit"),
    (POLL_LATENCY, "poll"),
    (PROCESS_LATENCY, "process"),
    (PUNCTUATE_LATENCY, "punctuate"),
];
const COUNT_SENSORS: [&str; 3] = [TASK_CREATED, TASK_CLOSED, SKIPPED_RECORDS];

/// The sensors of one worker.
#[derive(Debug, Clone)]
pub struct ThreadMetrics {
    client_id: String,
    recorder: Arc<dyn SensorRecorder>,
}

impl ThreadMetrics {
    pub fn new(client_id: impl Into<String>, recorder: Arc<dyn SensorRecorder>) -> Self {
        let metrics = Self {
            client_id: client_id.into(),
            recorder,
        };
        metrics.register();
        metrics
    }

    pub fn sensor_name(client_id: &str, sensor: &str) -> String {
        format!("thread.{}.{}", client_id, sensor)
    }

    fn metric(&self, name: String, description: String) -> MetricName {
        let mut tags = BTreeMap::new();
        tags.insert(CLIENT_ID_TAG.to_string(), self.client_id.clone());
        MetricName::new(name, METRICS_GROUP, description, tags)
    }

    fn register(&self) {
        for (sensor, operation) in LATENCY_SENSORS {
            let metrics = [
                (
                    self.metric(
                        format!("{}-avg", sensor),
                        format!("The average {} time in ms", operation),
                    ),
                    Stat::Avg,
                ),
                (
                    self.metric(
                        format!("{}-max", sensor),
                        format!("The maximum {} time in ms", operation),
                    ),
                    Stat::Max,
                ),
                (
                    self.metric(
                        format!("{}-rate", operation),
                        format!("The average per-second number of {} calls", operation),
                    ),
                    Stat::Rate,
                ),
            ];
            self.recorder
                .add_sensor(&Self::sensor_name(&self.client_id, sensor), &metrics);
        }
        for sensor in COUNT_SENSORS {
            let metrics = [(
                self.metric(
                    format!("{}-rate", sensor),
                    format!("The average per-second number of {} events", sensor),
                ),
                Stat::Rate,
            )];
            self.recorder
                .add_sensor(&Self::sensor_name(&self.client_id, sensor), &metrics);
        }
    }

    fn record(&self, sensor: &str, value: f64, now_ms: u64) {
        self.recorder
            .record(&Self::sensor_name(&self.client_id, sensor), value, now_ms);
    }

    pub fn record_commit(&self, latency_ms: f64, now_ms: u64) {
        self.record(COMMIT_LATENCY, latency_ms, now_ms);
    }

    pub fn record_poll(&self, latency_ms: f64, now_ms: u64) {
        self.record(POLL_LATENCY, latency_ms, now_ms);
    }

    pub fn record_process(&self, latency_ms: f64, now_ms: u64) {
        self.record(PROCESS_LATENCY, latency_ms, now_ms);
    }

    pub fn record_punctuate(&self, latency_ms: f64, now_ms: u64) {
        self.record(PUNCTUATE_LATENCY, latency_ms, now_ms);
    }

    pub fn task_created(&self, now_ms: u64) {
        self.record(TASK_CREATED, 1.0, now_ms);
    }

    pub fn task_closed(&self, now_ms: u64) {
        self.record(TASK_CLOSED, 1.0, now_ms);
    }

    pub fn skipped_records(&self, count: usize, now_ms: u64) {
        for _ in 0..count {
            self.record(SKIPPED_RECORDS, 1.0, now_ms);
        }
    }

    /// Unregisters every sensor of this worker.
    pub fn remove_all(&self) {
        for (sensor, _) in LATENCY_SENSORS {
            self.recorder
                .remove_sensor(&Self::sensor_name(&self.client_id, sensor));
        }
        for sensor in COUNT_SENSORS {
            self.recorder
                .remove_sensor(&Self::sensor_name(&self.client_id, sensor));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn sensors_and_metric_names() {
        let registry = Arc::new(Metrics::new());
        let metrics = ThreadMetrics::new("worker-1", registry.clone());

        let sensors = registry.sensor_names();
        for sensor in [
            COMMIT_LATENCY,
            POLL_LATENCY,
            PROCESS_LATENCY,
            PUNCTUATE_LATENCY,
            TASK_CREATED,
            TASK_CLOSED,
            SKIPPED_RECORDS,
        ] {
            assert!(sensors.contains(&format!("thread.worker-1.{}", sensor)));
        }

        let tags = [("client-id", "worker-1")];
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
                registry.find(name, "stream-metrics", &tags).is_some(),
                "missing {}",
                name
            );
        }

        metrics.record_commit(5.0, 0);
        metrics.record_commit(15.0, 10);
        let avg = registry
            .find("commit-latency-avg", "stream-metrics", &tags)
            .unwrap();
        assert_eq!(registry.value(&avg), Some(10.0));

        metrics.skipped_records(3, 0);
        assert_eq!(registry.count("thread.worker-1.skipped-records"), 3);

        metrics.remove_all();
        assert!(registry.sensor_names().is_empty());
    }
}
