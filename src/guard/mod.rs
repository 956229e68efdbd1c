//! Process-wide guard registry and the common guard trait.
//!
//! Guards outlive all events and the runtime itself; they are created
//! once (by name, at flow-load time) and looked up by id thereafter. The
//! registry assigns each guard a *magic number* -- its position in the
//! global total order -- the instant it is first created, so two flows
//! built against the same guard names always agree on acquisition order.

pub mod exclusive;
pub mod pool;
pub mod rwlock;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::event::Event;

/// Handle to a guard instance. Stable for the lifetime of the process
/// once assigned; never reused even if the underlying flow reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuardId(u64);

/// Which of the three flavors a guard instance implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    Exclusive,
    ReadWrite,
    Pool,
}

/// Common surface every guard flavor implements, so [`crate::atomics_holder::AtomicsHolder`]
/// can drive acquisition generically across mixed guard sets.
pub trait Guard: Send + Sync {
    /// Try to acquire in `mode`; on success the caller holds the guard and
    /// this returns `true`. On failure `ev` has been appended to the
    /// waiter chain and the caller must park -- `ev` will be resumed by a
    /// future `release`.
    fn acquire_or_wait(&self, ev: Arc<Event>, mode: crate::flow::AccessMode) -> bool;

    /// Release the guard on behalf of `by`, returning the events (if any)
    /// that became runnable as a result, in the order they should be
    /// pushed back onto the releasing worker's deque.
    fn release(&self, by: &Arc<Event>) -> Vec<Arc<Event>>;

    fn kind(&self) -> GuardKind;

    /// A short state name (`empty`, `held3`, `resources2`, `waiting1`, ...)
    /// for operator-facing dumps, in the spirit of `original_source`'s
    /// `log_snapshot_waiters()`/`PoolEventList::dump()`. Racy by design --
    /// diagnostics only, never used to drive acquisition decisions.
    fn describe(&self) -> String;
}

/// Process-wide registry mapping guard names to instances and magic
/// numbers. Backed by `dashmap` for lock-free-ish concurrent lookup from
/// any worker during dispatch.
pub struct GuardTable {
    by_name: DashMap<String, GuardId>,
    instances: DashMap<GuardId, Arc<dyn Guard>>,
    names: DashMap<GuardId, String>,
    magic_numbers: DashMap<GuardId, u64>,
    next_id: AtomicU64,
    next_magic: AtomicU64,
}

impl Default for GuardTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardTable {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            instances: DashMap::new(),
            names: DashMap::new(),
            magic_numbers: DashMap::new(),
            next_id: AtomicU64::new(0),
            next_magic: AtomicU64::new(0),
        }
    }

    /// Look up a guard by name, creating it (with a freshly assigned
    /// magic number) the first time it is referenced.
    pub fn get_or_create(&self, name: &str, kind: GuardKind) -> GuardId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = GuardId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let magic = self.next_magic.fetch_add(1, Ordering::Relaxed);
        let instance: Arc<dyn Guard> = match kind {
            GuardKind::Exclusive => Arc::new(exclusive::ExclusiveGuard::new()),
            GuardKind::ReadWrite => Arc::new(rwlock::ReadWriteGuard::new()),
            GuardKind::Pool => Arc::new(pool::PoolGuard::new(id, Vec::<()>::new().into_iter())),
        };
        self.instances.insert(id, instance);
        self.names.insert(id, name.to_string());
        self.magic_numbers.insert(id, magic);
        // Another thread may have won the race to insert this name; if so,
        // drop our id and return theirs (the dashmap entry is the source
        // of truth, the loser's instance above is simply never looked up
        // again and gets dropped when this Arc goes out of scope).
        *self.by_name.entry(name.to_string()).or_insert(id)
    }

    /// Register a pool guard preloaded with `resources`.
    pub fn create_pool<T: Send + Sync + 'static>(
        &self,
        name: &str,
        resources: impl IntoIterator<Item = T>,
    ) -> GuardId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = GuardId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let magic = self.next_magic.fetch_add(1, Ordering::Relaxed);
        let instance: Arc<dyn Guard> = Arc::new(pool::PoolGuard::new(id, resources.into_iter()));
        self.instances.insert(id, instance);
        self.names.insert(id, name.to_string());
        self.magic_numbers.insert(id, magic);
        *self.by_name.entry(name.to_string()).or_insert(id)
    }

    pub fn get(&self, id: GuardId) -> Option<Arc<dyn Guard>> {
        self.instances.get(&id).map(|g| g.clone())
    }

    pub fn name_of(&self, id: GuardId) -> Option<String> {
        self.names.get(&id).map(|n| n.clone())
    }

    pub fn magic_number(&self, id: GuardId) -> u64 {
        *self.magic_numbers.get(&id).expect("guard id not registered")
    }

    /// Name + state-name pairs for every registered guard, for an
    /// operator-facing dump of the whole table (spec's `diagnostics`
    /// feature; see `original_source`'s `log_snapshot_waiters`).
    #[cfg(feature = "diagnostics")]
    pub fn describe_all(&self) -> Vec<(String, String)> {
        self.instances
            .iter()
            .map(|entry| {
                let name = self.name_of(*entry.key()).unwrap_or_default();
                (name, entry.value().describe())
            })
            .collect()
    }
}
