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

use bytes::Bytes;

use crate::message::{ConsumerRecord, ProducerRecord};
use crate::state::{KeyValueStore, ProcessorStateManager};
use crate::AppResult;

use super::{RecordCollector, TaskId};

/// What a processor can reach while it handles a record.
pub struct ProcessorContext<'a> {
    task_id: TaskId,
    state_manager: &'a mut ProcessorStateManager,
    collector: &'a RecordCollector,
}

impl<'a> ProcessorContext<'a> {
    pub fn new(
        task_id: TaskId,
        state_manager: &'a mut ProcessorStateManager,
        collector: &'a RecordCollector,
    ) -> Self {
        Self {
            task_id,
            state_manager,
            collector,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn store(&mut self, name: &str) -> AppResult<&mut dyn KeyValueStore> {
        self.state_manager.store(name)
    }

    /// Sends a record downstream through the task's producer.
    pub fn forward(&mut self, topic: &str, key: Option<Bytes>, value: Option<Bytes>) -> AppResult<()> {
        self.collector
            .send(ProducerRecord::new(topic, None, key, value))?;
        Ok(())
    }
}

/// The per task processing logic of a topology.
pub trait RecordProcessor: Send + Debug {
    fn init(&mut self, _context: &mut ProcessorContext<'_>) -> AppResult<()> {
        Ok(())
    }

    fn process(&mut self, context: &mut ProcessorContext<'_>, record: &ConsumerRecord)
        -> AppResult<()>;

    fn punctuate(&mut self, _context: &mut ProcessorContext<'_>, _now_ms: u64) -> AppResult<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Builds one processor per active task.
pub trait ProcessorSupplier: Send + Sync + Debug {
    fn get(&self, task_id: TaskId) -> Box<dyn RecordProcessor>;
}

/// Counts records per key into a store and optionally forwards the new
/// count as a big endian u64.
#[derive(Debug)]
pub struct KeyCountProcessor {
    store_name: String,
    sink_topic: Option<String>,
    punctuations: u64,
}

impl KeyCountProcessor {
    pub fn new(store_name: impl Into<String>, sink_topic: Option<String>) -> Self {
        Self {
            store_name: store_name.into(),
            sink_topic,
            punctuations: 0,
        }
    }

    pub fn punctuations(&self) -> u64 {
        self.punctuations
    }

    pub fn decode_count(value: &[u8]) -> u64 {
        value
            .try_into()
            .map(u64::from_be_bytes)
            .unwrap_or_default()
    }
}

impl RecordProcessor for KeyCountProcessor {
    fn process(&mut self, context: &mut ProcessorContext<'_>, record: &ConsumerRecord) -> AppResult<()> {
        let Some(key) = record.key.clone().filter(|k| !k.is_empty()) else {
            return Ok(());
        };
        let store = context.store(&self.store_name)?;
        let count = store
            .get(&key)?
            .map(|v| Self::decode_count(&v))
            .unwrap_or(0)
            + 1;
        let encoded = Bytes::copy_from_slice(&count.to_be_bytes());
        store.put(key.clone(), encoded.clone())?;
        if let Some(sink) = &self.sink_topic {
            context.forward(sink, Some(key), Some(encoded))?;
        }
        Ok(())
    }

    fn punctuate(&mut self, _context: &mut ProcessorContext<'_>, _now_ms: u64) -> AppResult<()> {
        self.punctuations += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct KeyCountSupplier {
    pub store_name: String,
    pub sink_topic: Option<String>,
}

impl KeyCountSupplier {
    pub fn new(store_name: impl Into<String>, sink_topic: Option<String>) -> Self {
        Self {
            store_name: store_name.into(),
            sink_topic,
        }
    }
}

impl ProcessorSupplier for KeyCountSupplier {
    fn get(&self, _task_id: TaskId) -> Box<dyn RecordProcessor> {
        Box::new(KeyCountProcessor::new(
            self.store_name.clone(),
            self.sink_topic.clone(),
        ))
    }
}
