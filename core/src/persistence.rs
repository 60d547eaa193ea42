// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Durable snapshot persistence for component state.
//!
//! Each durable store (ledger journal, replay cache, reconciliation queue)
//! snapshots its full state into an append log and reloads the latest
//! snapshot at startup.

use atomic_store::{
    load_store::BincodeLoadStore, AppendLog, AtomicStore, AtomicStoreLoader, PersistenceError,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

pub struct SnapshotPersistence<T: Serialize + DeserializeOwned + Clone> {
    atomic_store: AtomicStore,
    state_snapshot: AppendLog<BincodeLoadStore<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> SnapshotPersistence<T> {
    pub fn new(store_path: &Path, key_tag: &str) -> Result<Self, PersistenceError> {
        let mut store_path = PathBuf::from(store_path);
        store_path.push(key_tag);
        let mut loader = AtomicStoreLoader::create(&store_path, key_tag)?;
        let snapshot_tag = format!("{}_state", key_tag);
        let state_snapshot =
            AppendLog::create(&mut loader, Default::default(), &snapshot_tag, 1024)?;
        let atomic_store = AtomicStore::open(loader)?;
        Ok(Self {
            atomic_store,
            state_snapshot,
        })
    }

    pub fn load(store_path: &Path, key_tag: &str) -> Result<Self, PersistenceError> {
        let mut store_path = PathBuf::from(store_path);
        store_path.push(key_tag);
        let mut loader = AtomicStoreLoader::load(&store_path, key_tag)?;
        let snapshot_tag = format!("{}_state", key_tag);
        let state_snapshot = AppendLog::load(&mut loader, Default::default(), &snapshot_tag, 1024)?;
        let atomic_store = AtomicStore::open(loader)?;
        Ok(Self {
            atomic_store,
            state_snapshot,
        })
    }

    /// Open an existing store, falling back to a fresh one on first run.
    pub fn open(store_path: &Path, key_tag: &str) -> Result<Self, PersistenceError> {
        match Self::load(store_path, key_tag) {
            Ok(store) => Ok(store),
            Err(_) => Self::new(store_path, key_tag),
        }
    }

    pub fn store_latest_state(&mut self, state: &T) -> Result<(), PersistenceError> {
        self.state_snapshot.store_resource(state)?;
        self.state_snapshot.commit_version()?;
        self.atomic_store.commit_version()?;
        Ok(())
    }

    pub fn load_latest_state(&self) -> Result<T, PersistenceError> {
        self.state_snapshot.load_latest()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;
    use tempdir::TempDir;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u64,
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new("tollgate-persistence").unwrap();
        let mut store: SnapshotPersistence<Counter> =
            SnapshotPersistence::new(dir.path(), "counter").unwrap();
        store.store_latest_state(&Counter { count: 1 }).unwrap();
        store.store_latest_state(&Counter { count: 7 }).unwrap();
        drop(store);

        let store: SnapshotPersistence<Counter> =
            SnapshotPersistence::load(dir.path(), "counter").unwrap();
        assert_eq!(store.load_latest_state().unwrap(), Counter { count: 7 });
    }

    #[test]
    fn test_open_creates_then_loads() {
        let dir = TempDir::new("tollgate-persistence").unwrap();
        {
            let mut store: SnapshotPersistence<Counter> =
                SnapshotPersistence::open(dir.path(), "counter").unwrap();
            store.store_latest_state(&Counter { count: 3 }).unwrap();
        }
        let store: SnapshotPersistence<Counter> =
            SnapshotPersistence::open(dir.path(), "counter").unwrap();
        assert_eq!(store.load_latest_state().unwrap().count, 3);
    }
}
