//! Pending registry: the crash-safe store of setups awaiting their terminal
//! outcome.
//!
//! One JSON object file mapping `trade_id -> SetupEvent`. Two components
//! mutate it (the spine on publish, the reconciler on scan), so every writer
//! follows the same discipline: acquire the cooperative lock, read the latest
//! on-disk state fresh, mutate, atomically replace. In-memory copies are
//! never trusted across the lock boundary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::storage::{atomic_write_json, read_json, FileLock, StoreError};

use super::types::{now_ms, SetupEvent};

pub type PendingMap = BTreeMap<String, SetupEvent>;

pub struct PendingRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    max_entries: usize,
    max_age_ms: i64,
}

impl PendingRegistry {
    pub fn new(
        path: PathBuf,
        lock_timeout: Duration,
        max_entries: usize,
        max_age_days: u64,
    ) -> Self {
        let lock_path = {
            let mut os = path.as_os_str().to_owned();
            os.push(".lock");
            PathBuf::from(os)
        };
        Self {
            path,
            lock_path,
            lock_timeout,
            max_entries,
            max_age_ms: max_age_days as i64 * 86_400_000,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Lockless read for hint lookups. Mutators must use [`Self::mutate`].
    pub fn load(&self) -> PendingMap {
        match read_json::<PendingMap>(&self.path) {
            Ok(Some(map)) => map,
            Ok(None) => PendingMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), "pending registry unreadable: {e}");
                PendingMap::new()
            }
        }
    }

    /// Run one read-mutate-replace cycle under the cooperative lock.
    ///
    /// The closure returns whether it changed the map; the file is rewritten
    /// (atomically, pruned to bounds) only on change. The lock is bounded and
    /// fails open: the mutation proceeds even when contention wins, which
    /// the at-least-once contract absorbs.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut PendingMap) -> (bool, R),
    ) -> Result<R, StoreError> {
        let lock = FileLock::acquire(&self.lock_path, self.lock_timeout);
        if !lock.held() {
            warn!(path = %self.path.display(), "mutating pending registry without lock");
        }

        let mut map = match read_json::<PendingMap>(&self.path) {
            Ok(Some(m)) => m,
            Ok(None) => PendingMap::new(),
            Err(e @ StoreError::Schema(_)) => {
                // A corrupt registry must not wedge the pipeline; start over
                // and let the reconciler's integrity pass mop up.
                warn!(path = %self.path.display(), "pending registry corrupt, resetting: {e}");
                PendingMap::new()
            }
            Err(e) => return Err(e),
        };

        let (changed, out) = f(&mut map);
        if changed {
            self.prune(&mut map);
            atomic_write_json(&self.path, &map)?;
        }
        Ok(out)
    }

    /// Upsert a setup by trade id; a later publish overwrites the prior entry
    /// (last-write-wins).
    pub fn upsert(&self, setup: &SetupEvent) -> Result<(), StoreError> {
        let setup = setup.clone();
        self.mutate(move |map| {
            map.insert(setup.trade_id.clone(), setup);
            (true, ())
        })
    }

    /// Remove and return the entry for `trade_id`, if present.
    pub fn take(&self, trade_id: &str) -> Result<Option<SetupEvent>, StoreError> {
        self.mutate(|map| {
            let hit = map.remove(trade_id);
            (hit.is_some(), hit)
        })
    }

    /// Drop entries beyond the age/size bounds, newest kept.
    fn prune(&self, map: &mut PendingMap) {
        let now = now_ms();
        map.retain(|_, setup| setup.ts_ms == 0 || now - setup.ts_ms <= self.max_age_ms);

        if map.len() > self.max_entries {
            let mut by_age: Vec<(String, i64)> =
                map.iter().map(|(k, v)| (k.clone(), v.ts_ms)).collect();
            by_age.sort_by_key(|(_, ts)| std::cmp::Reverse(*ts));
            for (key, _) in by_age.into_iter().skip(self.max_entries) {
                map.remove(&key);
            }
        }
    }
}
