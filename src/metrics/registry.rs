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

use dashmap::DashMap;

use super::{MetricName, SensorRecorder, Stat};

#[derive(Debug, Clone, Default)]
struct SampledStat {
    count: u64,
    sum: f64,
    max: f64,
    first_ms: Option<u64>,
    last_ms: u64,
}

impl SampledStat {
    fn record(&mut self, value: f64, now_ms: u64) {
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.sum += value;
        self.first_ms.get_or_insert(now_ms);
        self.last_ms = now_ms;
    }

    fn measure(&self, stat: Stat) -> f64 {
        match stat {
            Stat::Avg if self.count == 0 => 0.0,
            Stat::Avg => self.sum / self.count as f64,
            Stat::Max => self.max,
            Stat::Rate => {
                let elapsed_ms = self
                    .first_ms
                    .map(|first| self.last_ms.saturating_sub(first))
                    .unwrap_or(0)
                    .max(1000);
                self.count as f64 * 1000.0 / elapsed_ms as f64
            }
        }
    }
}

/// In-process metrics registry, queryable by metric name.
#[derive(Debug, Default)]
pub struct Metrics {
    sensors: DashMap<String, SampledStat>,
    metrics: DashMap<MetricName, (String, Stat)>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sensors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn metric_names(&self) -> Vec<MetricName> {
        let mut names: Vec<MetricName> = self.metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Looks a metric up by name and tags, ignoring the description.
    pub fn find(&self, name: &str, group: &str, tags: &[(&str, &str)]) -> Option<MetricName> {
        self.metrics
            .iter()
            .find(|e| {
                let key = e.key();
                key.name == name
                    && key.group == group
                    && key.tags.len() == tags.len()
                    && tags
                        .iter()
                        .all(|(k, v)| key.tags.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|e| e.key().clone())
    }

    pub fn value(&self, metric: &MetricName) -> Option<f64> {
        let (sensor, stat) = self.metrics.get(metric)?.value().clone();
        let stats = self.sensors.get(&sensor)?;
        Some(stats.measure(stat))
    }

    /// Number of recordings of a sensor.
    pub fn count(&self, sensor: &str) -> u64 {
        self.sensors.get(sensor).map(|s| s.count).unwrap_or(0)
    }
}

impl SensorRecorder for Metrics {
    fn add_sensor(&self, sensor: &str, metrics: &[(MetricName, Stat)]) {
        self.sensors.entry(sensor.to_string()).or_default();
        for (name, stat) in metrics {
            self.metrics
                .insert(name.clone(), (sensor.to_string(), *stat));
        }
    }

    fn record(&self, sensor: &str, value: f64, now_ms: u64) {
        if let Some(mut stats) = self.sensors.get_mut(sensor) {
            stats.record(value, now_ms);
        }
    }

    fn remove_sensor(&self, sensor: &str) {
        self.sensors.remove(sensor);
        self.metrics.retain(|_, (owner, _)| owner != sensor);
    }
}
