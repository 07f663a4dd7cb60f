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
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::trace;

use crate::{AppError, AppResult};

use super::{validate_key, KeyValueStore};

/// Ordered in-memory store. When opened with a snapshot path, `flush`
/// persists the whole map there as json and `open` loads it back.
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    name: String,
    store: BTreeMap<Bytes, Bytes>,
    snapshot: Option<PathBuf>,
    open: bool,
}

impl InMemoryKeyValueStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: BTreeMap::new(),
            snapshot: None,
            open: true,
        }
    }

    /// Opens the store backed by `<dir>/<name>.snapshot`, loading the last
    /// flushed content if `load` is set.
    pub fn open(name: impl Into<String>, dir: &Path, load: bool) -> AppResult<Self> {
        let name = name.into();
        let path = Self::snapshot_path(dir, &name);
        let mut store = BTreeMap::new();
        if load {
            match OpenOptions::new().read(true).open(&path) {
                Ok(mut file) => {
                    let mut contents = String::new();
                    file.read_to_string(&mut contents)?;
                    if !contents.is_empty() {
                        let entries: Vec<(Bytes, Bytes)> = serde_json::from_str(&contents)?;
                        store.extend(entries);
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else if path.exists() {
            fs::remove_file(&path)?;
        }
        trace!("opened store {} with {} entries", name, store.len());
        Ok(Self {
            name,
            store,
            snapshot: Some(path),
            open: true,
        })
    }

    pub fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.snapshot", name))
    }

    fn check_open(&self) -> AppResult<()> {
        if !self.open {
            return Err(AppError::InvalidStateStore(format!(
                "store {} is closed",
                self.name
            )));
        }
        Ok(())
    }

    fn save(&self, path: &Path) -> AppResult<()> {
        let entries: Vec<(&Bytes, &Bytes)> = self.store.iter().collect();
        let contents = serde_json::to_string(&entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn get(&mut self, key: &[u8]) -> AppResult<Option<Bytes>> {
        self.check_open()?;
        validate_key(&self.name, key)?;
        Ok(self.store.get(key).cloned())
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> AppResult<()> {
        self.check_open()?;
        validate_key(&self.name, &key)?;
        self.store.insert(key, value);
        Ok(())
    }

    fn put_if_absent(&mut self, key: Bytes, value: Bytes) -> AppResult<Option<Bytes>> {
        self.check_open()?;
        validate_key(&self.name, &key)?;
        if let Some(existing) = self.store.get(&key) {
            return Ok(Some(existing.clone()));
        }
        self.store.insert(key, value);
        Ok(None)
    }

    fn put_all(&mut self, entries: Vec<(Bytes, Bytes)>) -> AppResult<()> {
        self.check_open()?;
        for (key, _) in &entries {
            validate_key(&self.name, key)?;
        }
        self.store.extend(entries);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> AppResult<Option<Bytes>> {
        self.check_open()?;
        validate_key(&self.name, key)?;
        Ok(self.store.remove(key))
    }

    fn range(&mut self, from: &[u8], to: &[u8]) -> AppResult<Vec<(Bytes, Bytes)>> {
        self.check_open()?;
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .range::<[u8], _>((Bound::Included(from), Bound::Included(to)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn all(&mut self) -> AppResult<Vec<(Bytes, Bytes)>> {
        self.check_open()?;
        Ok(self
            .store
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn approximate_num_entries(&mut self) -> AppResult<u64> {
        self.check_open()?;
        Ok(self.store.len() as u64)
    }

    fn flush(&mut self) -> AppResult<()> {
        self.check_open()?;
        if let Some(path) = &self.snapshot {
            self.save(path)?;
        }
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.open = false;
        Ok(())
    }
}
