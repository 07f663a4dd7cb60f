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

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::trace;

use crate::{AppError, AppResult};

use super::{validate_key, CacheFlushListener, KeyValueStore};

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` is a pending delete
    value: Option<Bytes>,
    dirty: bool,
    seq: u64,
}

/// Write-back cache in front of another store.
///
/// Writes stay in the cache until `flush` or until the entry is evicted as the
/// least recently used one. Only then they reach the underlying store and the
/// flush listener, which sees the value the underlying store held before.
#[derive(Debug)]
pub struct CachingKeyValueStore {
    inner: Box<dyn KeyValueStore>,
    max_entries: usize,
    entries: HashMap<Bytes, CacheEntry>,
    lru: BTreeMap<u64, Bytes>,
    next_seq: u64,
    listener: Option<Box<dyn CacheFlushListener>>,
    open: bool,
}

impl CachingKeyValueStore {
    pub fn new(
        inner: Box<dyn KeyValueStore>,
        max_entries: usize,
        listener: Option<Box<dyn CacheFlushListener>>,
    ) -> Self {
        Self {
            inner,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_seq: 0,
            listener,
            open: true,
        }
    }

    pub fn set_flush_listener(&mut self, listener: Option<Box<dyn CacheFlushListener>>) {
        self.listener = listener;
    }

    pub fn cached_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn dirty_entries(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    fn check_open(&self) -> AppResult<()> {
        if !self.open {
            return Err(AppError::InvalidStateStore(format!(
                "store {} is closed",
                self.inner.name()
            )));
        }
        Ok(())
    }

    fn touch(&mut self, key: Bytes, value: Option<Bytes>, dirty: bool) -> AppResult<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let dirty = match self.entries.get(&key) {
            Some(old) => {
                self.lru.remove(&old.seq);
                dirty || old.dirty
            }
            None => dirty,
        };
        self.lru.insert(seq, key.clone());
        self.entries.insert(key, CacheEntry { value, dirty, seq });
        self.maybe_evict()
    }

    fn maybe_evict(&mut self) -> AppResult<()> {
        while self.entries.len() > self.max_entries {
            let Some((_, key)) = self.lru.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                if entry.dirty {
                    trace!("evicting dirty key from {}", self.inner.name());
                    self.write_through(&key, entry.value)?;
                }
            }
        }
        Ok(())
    }

    fn write_through(&mut self, key: &Bytes, value: Option<Bytes>) -> AppResult<()> {
        let old_value = self.inner.get(key)?;
        match &value {
            Some(v) => self.inner.put(key.clone(), v.clone())?,
            None => {
                self.inner.delete(key)?;
            }
        }
        if let Some(listener) = &self.listener {
            listener.apply(key, value.as_ref(), old_value.as_ref())?;
        }
        Ok(())
    }

    /// Cache content overlaid on `base`, both in key order.
    fn overlay(
        &self,
        base: Vec<(Bytes, Bytes)>,
        include: impl Fn(&Bytes) -> bool,
    ) -> Vec<(Bytes, Bytes)> {
        let mut merged: BTreeMap<Bytes, Bytes> = base.into_iter().collect();
        for (key, entry) in self.entries.iter().filter(|(k, _)| include(k)) {
            match &entry.value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

impl KeyValueStore for CachingKeyValueStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn get(&mut self, key: &[u8]) -> AppResult<Option<Bytes>> {
        self.check_open()?;
        validate_key(self.inner.name(), key)?;
        if let Some(entry) = self.entries.get(key) {
            let value = entry.value.clone();
            self.touch(Bytes::copy_from_slice(key), value.clone(), false)?;
            return Ok(value);
        }
        let value = self.inner.get(key)?;
        if let Some(v) = &value {
            self.touch(Bytes::copy_from_slice(key), Some(v.clone()), false)?;
        }
        Ok(value)
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> AppResult<()> {
        self.check_open()?;
        validate_key(self.inner.name(), &key)?;
        self.touch(key, Some(value), true)
    }

    fn put_if_absent(&mut self, key: Bytes, value: Bytes) -> AppResult<Option<Bytes>> {
        let existing = self.get(&key)?;
        if existing.is_none() {
            self.put(key, value)?;
        }
        Ok(existing)
    }

    fn put_all(&mut self, entries: Vec<(Bytes, Bytes)>) -> AppResult<()> {
        self.check_open()?;
        for (key, _) in &entries {
            validate_key(self.inner.name(), key)?;
        }
        for (key, value) in entries {
            self.touch(key, Some(value), true)?;
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> AppResult<Option<Bytes>> {
        let old = self.get(key)?;
        self.touch(Bytes::copy_from_slice(key), None, true)?;
        Ok(old)
    }

    fn range(&mut self, from: &[u8], to: &[u8]) -> AppResult<Vec<(Bytes, Bytes)>> {
        self.check_open()?;
        let base = self.inner.range(from, to)?;
        Ok(self.overlay(base, |k| k.as_ref() >= from && k.as_ref() <= to))
    }

    fn all(&mut self) -> AppResult<Vec<(Bytes, Bytes)>> {
        self.check_open()?;
        let base = self.inner.all()?;
        Ok(self.overlay(base, |_| true))
    }

    fn approximate_num_entries(&mut self) -> AppResult<u64> {
        Ok(self.all()?.len() as u64)
    }

    /// Writes every dirty entry in least recently used order, then flushes the
    /// underlying store.
    fn flush(&mut self) -> AppResult<()> {
        self.check_open()?;
        let dirty: Vec<(u64, Bytes)> = self
            .lru
            .iter()
            .filter(|(_, key)| self.entries.get(*key).is_some_and(|e| e.dirty))
            .map(|(seq, key)| (*seq, key.clone()))
            .collect();
        for (_, key) in dirty {
            let value = match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.dirty = false;
                    entry.value.clone()
                }
                None => continue,
            };
            self.write_through(&key, value.clone())?;
            if value.is_none() {
                if let Some(entry) = self.entries.remove(&key) {
                    self.lru.remove(&entry.seq);
                }
            }
        }
        self.inner.flush()
    }

    fn close(&mut self) -> AppResult<()> {
        if !self.open {
            return Ok(());
        }
        let flushed = self.flush();
        self.open = false;
        self.entries.clear();
        self.lru.clear();
        self.inner.close()?;
        flushed
    }
}
