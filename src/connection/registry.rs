//! Process-wide registry of shared physical connections.
//!
//! Every [`SharedConnection`](super::SharedConnection) built over the same
//! broker URL set through the same registry resolves to one [`SharedSlot`]:
//! one physical connection, a reference count of attached owners, and the
//! owners' callback tables keyed by owner id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use super::callbacks::{CallbackKind, CallbackSet, Registered};
use crate::broker_url::UrlCursor;
use crate::{lock_ignore_poison, BrokerUrl, ConnectionPtr};

/// Sorted broker URLs.
pub(crate) type ShareKey = Vec<String>;

pub(crate) struct SlotState {
    /// Physical connection, possibly closed after a loss.
    pub(crate) conn: Option<ConnectionPtr>,
    /// Owners attached to `conn`.
    pub(crate) refs: usize,
    /// Live owner handles, attached or not.
    pub(crate) objs: usize,
    pub(crate) cursor: UrlCursor,
}

pub(crate) struct SharedSlot {
    // ---
    pub(crate) key: ShareKey,
    state: Mutex<SlotState>,
    /// Serializes connects so one key never opens two physical connections.
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    owners: Mutex<HashMap<u64, CallbackSet>>,
    next_owner: AtomicU64,
}

impl SharedSlot {
    fn new(key: ShareKey, urls: Vec<BrokerUrl>) -> Self {
        Self {
            key,
            state: Mutex::new(SlotState {
                conn: None,
                refs: 0,
                objs: 0,
                cursor: UrlCursor::new(urls),
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            owners: Mutex::new(HashMap::new()),
            next_owner: AtomicU64::new(1),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SlotState> {
        lock_ignore_poison(&self.state)
    }

    pub(crate) fn owners(&self) -> MutexGuard<'_, HashMap<u64, CallbackSet>> {
        lock_ignore_poison(&self.owners)
    }

    /// The physical connection if it is still usable.
    pub(crate) fn live_conn(&self) -> Option<ConnectionPtr> {
        self.state().conn.clone().filter(|c| !c.is_closed())
    }

    pub(crate) fn callbacks(&self, owner: u64, kind: CallbackKind) -> Vec<Registered> {
        self.owners()
            .get(&owner)
            .map(|set| set.snapshot(kind))
            .unwrap_or_default()
    }
}

/// Registry of shared connections, keyed by broker URL set.
///
/// [`ConnectionRegistry::global`] is the process-wide instance; tests that
/// must not share connections build their own with [`ConnectionRegistry::new`].
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    slots: Arc<Mutex<HashMap<ShareKey, Arc<SharedSlot>>>>,
}

static GLOBAL_REGISTRY: OnceLock<ConnectionRegistry> = OnceLock::new();

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Self {
        GLOBAL_REGISTRY.get_or_init(ConnectionRegistry::new).clone()
    }

    /// Number of URL sets with live owners.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new owner for `urls` and return its slot and owner id.
    pub(crate) fn acquire(&self, urls: Vec<BrokerUrl>) -> (Arc<SharedSlot>, u64) {
        // ---
        let mut key: ShareKey = urls.iter().map(|u| u.as_str().to_string()).collect();
        key.sort();

        let slot = {
            let mut slots = lock_ignore_poison(&self.slots);
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SharedSlot::new(key, urls)))
                .clone();
            slot.state().objs += 1;
            slot
        };

        let owner = slot.next_owner.fetch_add(1, Ordering::Relaxed);
        slot.owners().insert(owner, CallbackSet::default());
        (slot, owner)
    }

    /// Drop an owner; the key is forgotten once its last owner is gone.
    pub(crate) fn release(&self, slot: &Arc<SharedSlot>, owner: u64) {
        // ---
        slot.owners().remove(&owner);

        let mut slots = lock_ignore_poison(&self.slots);
        let remaining = {
            let mut state = slot.state();
            state.objs = state.objs.saturating_sub(1);
            state.objs
        };
        if remaining == 0 {
            if let Some(current) = slots.get(&slot.key) {
                if Arc::ptr_eq(current, slot) {
                    slots.remove(&slot.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_same_url_set_shares_slot() {
        // ---
        let registry = ConnectionRegistry::new();
        let a = BrokerUrl::parse_all(&["amqp://a", "amqp://b"]).unwrap();
        let b = BrokerUrl::parse_all(&["amqp://b", "amqp://a"]).unwrap();
        let c = BrokerUrl::parse_all(&["amqp://c"]).unwrap();

        let (slot_a, owner_a) = registry.acquire(a);
        let (slot_b, owner_b) = registry.acquire(b);
        let (slot_c, owner_c) = registry.acquire(c);

        assert!(Arc::ptr_eq(&slot_a, &slot_b));
        assert!(!Arc::ptr_eq(&slot_a, &slot_c));
        assert_ne!(owner_a, owner_b);
        assert_eq!(registry.len(), 2);

        registry.release(&slot_a, owner_a);
        assert_eq!(registry.len(), 2);
        registry.release(&slot_b, owner_b);
        registry.release(&slot_c, owner_c);
        assert!(registry.is_empty());
    }
}
