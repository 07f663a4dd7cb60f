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

//! Worker sensors and the sinks they record into.
//!
//! A sensor is registered as `thread.<client-id>.<sensor>` and owns a few
//! derived metrics in the `stream-metrics` group, all tagged with the
//! client id.

pub use otel::OtelSensorRecorder;
pub use registry::Metrics;
pub use thread_metrics::ThreadMetrics;

mod otel;
mod registry;
mod thread_metrics;

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

pub const METRICS_GROUP: &str = "stream-metrics";
pub const CLIENT_ID_TAG: &str = "client-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stat {
    Avg,
    Max,
    /// occurrences per second
    Rate,
}

/// Identity of one derived metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName {
    pub name: String,
    pub group: String,
    pub description: String,
    pub tags: BTreeMap<String, String>,
}

impl MetricName {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        description: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            description: description.into(),
            tags,
        }
    }
}

impl Display for MetricName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.group, self.name)?;
        for (k, v) in &self.tags {
            write!(f, ",{}={}", k, v)?;
        }
        Ok(())
    }
}

/// Sink for sensor readings.
pub trait SensorRecorder: Send + Sync + Debug {
    /// Declares `sensor` with the metrics derived from it.
    fn add_sensor(&self, sensor: &str, metrics: &[(MetricName, Stat)]);
    fn record(&self, sensor: &str, value: f64, now_ms: u64);
    fn remove_sensor(&self, sensor: &str);
}
