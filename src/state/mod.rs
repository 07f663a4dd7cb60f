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

//! Local task state.
//!
//! Every task owns a directory below the [`StateDirectory`], guarded by an
//! exclusive lock keyed by its task id. Inside it the
//! [`ProcessorStateManager`] keeps the task's key-value stores and a
//! `.checkpoint` file recording how far each changelog was applied.

pub use caching_store::CachingKeyValueStore;
pub use checkpoint::CheckpointFile;
pub use kv_store::InMemoryKeyValueStore;
pub use state_directory::StateDirectory;
pub use state_manager::ProcessorStateManager;

mod caching_store;
mod checkpoint;
mod kv_store;
mod state_directory;
mod state_manager;

use std::fmt::Debug;

use bytes::Bytes;

use crate::AppResult;

/// A sorted byte key-value store. Keys must not be empty.
pub trait KeyValueStore: Send + Debug {
    fn name(&self) -> &str;
    fn is_open(&self) -> bool;

    fn get(&mut self, key: &[u8]) -> AppResult<Option<Bytes>>;
    fn put(&mut self, key: Bytes, value: Bytes) -> AppResult<()>;
    /// Stores `value` only when `key` is missing; returns the existing value.
    fn put_if_absent(&mut self, key: Bytes, value: Bytes) -> AppResult<Option<Bytes>>;
    fn put_all(&mut self, entries: Vec<(Bytes, Bytes)>) -> AppResult<()>;
    /// Removes `key`, returning the value it had.
    fn delete(&mut self, key: &[u8]) -> AppResult<Option<Bytes>>;
    /// Entries with `from <= key <= to`, in key order.
    fn range(&mut self, from: &[u8], to: &[u8]) -> AppResult<Vec<(Bytes, Bytes)>>;
    fn all(&mut self) -> AppResult<Vec<(Bytes, Bytes)>>;
    fn approximate_num_entries(&mut self) -> AppResult<u64>;

    fn flush(&mut self) -> AppResult<()>;
    fn close(&mut self) -> AppResult<()>;
}

/// Receives dirty entries as they leave a write-back cache. `new_value` of
/// `None` is a delete.
pub trait CacheFlushListener: Send + Debug {
    fn apply(&self, key: &Bytes, new_value: Option<&Bytes>, old_value: Option<&Bytes>)
        -> AppResult<()>;
}

pub(crate) fn validate_key(store: &str, key: &[u8]) -> AppResult<()> {
    if key.is_empty() {
        return Err(crate::AppError::InvalidArgument(format!(
            "empty key for store {}",
            store
        )));
    }
    Ok(())
}
