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

use std::fmt::{Debug, Formatter};

use dashmap::DashMap;
use opentelemetry::metrics::{Histogram, Meter};
use opentelemetry::{global, KeyValue};

use super::{MetricName, SensorRecorder};

/// Forwards every sensor to an opentelemetry histogram named after the
/// sensor; avg, max and rate are left to the exporter's aggregation.
pub struct OtelSensorRecorder {
    meter: Meter,
    histograms: DashMap<String, (Histogram<f64>, Vec<KeyValue>)>,
}

impl OtelSensorRecorder {
    pub fn new(meter_name: &'static str) -> Self {
        Self::with_meter(global::meter(meter_name))
    }

    pub fn with_meter(meter: Meter) -> Self {
        Self {
            meter,
            histograms: DashMap::new(),
        }
    }
}

impl Debug for OtelSensorRecorder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let sensors: Vec<String> = self.histograms.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("OtelSensorRecorder")
            .field("sensors", &sensors)
            .finish()
    }
}

impl SensorRecorder for OtelSensorRecorder {
    fn add_sensor(&self, sensor: &str, metrics: &[(MetricName, super::Stat)]) {
        let attributes: Vec<KeyValue> = metrics
            .first()
            .map(|(name, _)| {
                name.tags
                    .iter()
                    .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let description = metrics
            .first()
            .map(|(name, _)| name.description.clone())
            .unwrap_or_default();
        let histogram = self
            .meter
            .f64_histogram(sensor.to_string())
            .with_description(description)
            .init();
        self.histograms
            .insert(sensor.to_string(), (histogram, attributes));
    }

    fn record(&self, sensor: &str, value: f64, _now_ms: u64) {
        if let Some(entry) = self.histograms.get(sensor) {
            let (histogram, attributes) = entry.value();
            histogram.record(value, attributes);
        }
    }

    fn remove_sensor(&self, sensor: &str) {
        self.histograms.remove(sensor);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::metrics::Stat;

    #[test]
    fn records_through_noop_meter() {
        let recorder = OtelSensorRecorder::new("stonestream-test");
        let mut tags = BTreeMap::new();
        tags.insert("client-id".to_string(), "w".to_string());
        recorder.add_sensor(
            "thread.w.commit-latency",
            &[(
                MetricName::new("commit-latency-avg", "stream-metrics", "", tags),
                Stat::Avg,
            )],
        );
        recorder.record("thread.w.commit-latency", 3.0, 0);
        recorder.remove_sensor("thread.w.commit-latency");
        recorder.record("thread.w.commit-latency", 3.0, 0);
    }
}
