//! Per-resource serialization for calendar writes.
//!
//! Every write that depends on a prior overlap check holds the keys of each
//! (driver, date) and (vehicle, date) it reads or writes. Writes on unrelated
//! keys run concurrently. Keys are always acquired in their `Ord` order, so
//! two writers needing overlapping key sets cannot deadlock.

use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::{DriverId, Schedule, ScheduleCandidate, VehicleId};

/// Slots beyond this count are pruned of idle entries on the next acquire.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Driver(DriverId, NaiveDate),
    Vehicle(VehicleId, NaiveDate),
}

impl LockKey {
    pub fn for_candidate(candidate: &ScheduleCandidate) -> [LockKey; 2] {
        [
            LockKey::Driver(candidate.driver_id, candidate.service_date),
            LockKey::Vehicle(candidate.vehicle_id.clone(), candidate.service_date),
        ]
    }

    pub fn for_schedule(schedule: &Schedule) -> [LockKey; 2] {
        [
            LockKey::Driver(schedule.driver_id, schedule.service_date),
            LockKey::Vehicle(schedule.vehicle_id.clone(), schedule.service_date),
        ]
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Driver(id, date) => write!(f, "driver:{}@{}", id, date),
            LockKey::Vehicle(id, date) => write!(f, "vehicle:{}@{}", id, date),
        }
    }
}

/// Held keys. Dropping the guard releases all of them.
pub struct KeyGuard {
    keys: Vec<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    pub fn covers(&self, key: &LockKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("keys", &self.keys).finish()
    }
}

#[derive(Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key in `keys` (duplicates are fine).
    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> KeyGuard {
        let ordered: BTreeSet<LockKey> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in &ordered {
            let slot = self.slot(key);
            guards.push(slot.lock_owned().await);
        }
        let keys: Vec<LockKey> = ordered.into_iter().collect();
        log::trace!("Acquired {} calendar key(s)", keys.len());
        KeyGuard {
            keys,
            _guards: guards,
        }
    }

    fn slot(&self, key: &LockKey) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        if slots.len() > PRUNE_THRESHOLD {
            // Only the map holds an idle slot.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}
