use std::fmt::Debug;

use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use moka::sync::Cache;
use tracing::debug;
use tracing::warn;

use crate::types::Entity;

// What is actually stored under a key. Absence of a key is the third state.
#[derive(Clone, Debug)]
enum Slot {
    Pending,
    Present(Entity),
}

/// State of a key as seen by a lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheState {
    /// Never requested, or a previous request didn't bring it in.
    Absent,
    /// A fetch for the key is in flight; don't request it again.
    Pending,
    Present(Entity),
}

impl CacheState {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn into_value(self) -> Option<Entity> {
        match self {
            Self::Present(v) => Some(v),
            _ => None,
        }
    }
}

/// What [`EntityCache::add`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Absent → Pending.
    Primed,
    /// Absent → Present.
    Inserted,
    /// Pending → Present, the regular "fetch completed" transition.
    Resolved,
    /// Pending stays pending.
    Unchanged,
    /// The key is already resolved; the new value was dropped.
    Rejected,
    /// Present → Present, only possible with [`EntityCache::overwrite`].
    Replaced,
}

/// Tri-state, session-long entity cache.
///
/// Transitions are monotonic: Absent → Pending → Present. A present value is never replaced by [`add`](Self::add);
/// the only way back from Pending to Absent is [`release`](Self::release), used when a fetch failed to deliver the
/// key. Entries are never evicted.
pub struct EntityCache {
    name:  String,
    slots: Cache<String, Slot>,
}

impl EntityCache {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            slots: Cache::builder().name(&name).build(),
            name,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> CacheState {
        match self.slots.get(key) {
            None => CacheState::Absent,
            Some(Slot::Pending) => CacheState::Pending,
            Some(Slot::Present(v)) => CacheState::Present(v),
        }
    }

    /// Record a value for the key; `None` marks the key as pending.
    pub fn add(&self, key: &str, value: Option<Entity>) -> AddOutcome {
        self.store(key, value, false)
    }

    /// Like [`add`](Self::add), but a present value gets replaced.
    pub fn overwrite(&self, key: &str, value: Entity) -> AddOutcome {
        self.store(key, Some(value), true)
    }

    #[inline]
    pub fn mark_pending(&self, key: &str) -> AddOutcome {
        self.add(key, None)
    }

    /// Pending → Absent. Returns `true` if the key was pending. Present and absent keys are left alone.
    pub fn release(&self, key: &str) -> bool {
        let result = self.slots.entry_by_ref(key).and_compute_with(|entry| match entry {
            Some(entry) if matches!(entry.value(), Slot::Pending) => Op::Remove,
            _ => Op::Nop,
        });
        matches!(result, CompResult::Removed(_))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> u64 {
        self.slots.run_pending_tasks();
        self.slots.entry_count()
    }

    fn store(&self, key: &str, value: Option<Entity>, allow_overwrite: bool) -> AddOutcome {
        let mut outcome = AddOutcome::Unchanged;
        self.slots.entry_by_ref(key).and_compute_with(|entry| {
            let (op, o) = match (entry.map(|e| e.into_value()), value) {
                (None, None) => (Op::Put(Slot::Pending), AddOutcome::Primed),
                (None, Some(v)) => (Op::Put(Slot::Present(v)), AddOutcome::Inserted),
                (Some(Slot::Pending), Some(v)) => (Op::Put(Slot::Present(v)), AddOutcome::Resolved),
                (Some(Slot::Pending), None) => (Op::Nop, AddOutcome::Unchanged),
                (Some(Slot::Present(_)), Some(v)) if allow_overwrite => {
                    (Op::Put(Slot::Present(v)), AddOutcome::Replaced)
                }
                (Some(Slot::Present(_)), _) => (Op::Nop, AddOutcome::Rejected),
            };
            outcome = o;
            op
        });

        match outcome {
            AddOutcome::Rejected => warn!(cache = %self.name, key, "entry is already resolved, keeping the first value"),
            AddOutcome::Replaced => debug!(cache = %self.name, key, "entry overwritten"),
            _ => (),
        }

        outcome
    }
}

impl Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("name", &self.name)
            .field("entries", &self.slots.entry_count())
            .finish()
    }
}
