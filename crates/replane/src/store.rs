//! In-memory config store and its subscription bus.
//!
//! The store is mutated only by the replication driver and the client
//! lifecycle. Callbacks run synchronously on the task applying the event,
//! after the lock is released, so a `get` from inside a callback observes
//! the already-updated store.

use crate::model::Config;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

/// Notification delivered to subscribers when a config changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigUpdate {
    pub name: String,
    /// The new base value of the record.
    pub value: Value,
}

pub(crate) type Callback = Arc<dyn Fn(&ConfigUpdate) + Send + Sync + 'static>;

#[derive(Default)]
pub(crate) struct Store {
    inner: Mutex<Inner>,
}

// Subscriber maps are keyed by a monotone id: iteration order is
// registration order, and removal by id is cheap and idempotent.
#[derive(Default)]
struct Inner {
    configs: BTreeMap<String, Config>,
    global: BTreeMap<u64, Callback>,
    by_key: BTreeMap<String, BTreeMap<u64, Callback>>,
    next_subscriber: u64,
}

impl Inner {
    // Global subscribers first, then the per-key set for this name.
    fn subscribers_for(&self, name: &str) -> Vec<Callback> {
        let mut out: Vec<Callback> = self.global.values().cloned().collect();
        if let Some(keyed) = self.by_key.get(name) {
            out.extend(keyed.values().cloned());
        }
        out
    }
}

impl Store {
    /// Install seed records (fallbacks or a snapshot) without notifying:
    /// seeding happens before any subscriber can exist.
    pub(crate) fn seed(&self, configs: impl IntoIterator<Item = Config>) {
        let mut inner = self.inner.lock().unwrap();
        for config in configs {
            inner.configs.insert(config.name.clone(), config);
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Config> {
        self.inner.lock().unwrap().configs.get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().configs.contains_key(name)
    }

    pub(crate) fn configs(&self) -> Vec<Config> {
        self.inner.lock().unwrap().configs.values().cloned().collect()
    }

    /// Replace the whole store atomically. Notifications go out for each
    /// record that differs from (or did not exist in) the previous contents,
    /// so re-asserting known state is silent.
    pub(crate) fn apply_init(&self, configs: Vec<Config>) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            let previous = std::mem::take(&mut inner.configs);
            let mut pending = Vec::new();
            for config in configs {
                let changed = previous.get(&config.name) != Some(&config);
                let update = ConfigUpdate {
                    name: config.name.clone(),
                    value: config.value.clone(),
                };
                inner.configs.insert(config.name.clone(), config);
                if changed {
                    pending.push((inner.subscribers_for(&update.name), update));
                }
            }
            pending
        };
        for (subscribers, update) in &pending {
            notify(subscribers, update);
        }
    }

    /// Upsert one record, fully replacing value and overrides, and notify.
    pub(crate) fn apply_change(&self, config: Config) {
        let (subscribers, update) = {
            let mut inner = self.inner.lock().unwrap();
            let update = ConfigUpdate {
                name: config.name.clone(),
                value: config.value.clone(),
            };
            inner.configs.insert(config.name.clone(), config);
            (inner.subscribers_for(&update.name), update)
        };
        notify(&subscribers, &update);
    }

    pub(crate) fn subscribe(self: &Arc<Self>, key: Option<String>, callback: Callback) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        match &key {
            None => {
                inner.global.insert(id, callback);
            }
            Some(name) => {
                inner.by_key.entry(name.clone()).or_default().insert(id, callback);
            }
        }
        Subscription {
            store: Arc::downgrade(self),
            key,
            id,
        }
    }

    pub(crate) fn clear_subscribers(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.global.clear();
        inner.by_key.clear();
    }
}

fn notify(subscribers: &[Callback], update: &ConfigUpdate) {
    for callback in subscribers {
        let call = std::panic::AssertUnwindSafe(|| callback(update));
        if let Err(panic) = std::panic::catch_unwind(call) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(name = %update.name, %reason, "subscriber callback panicked");
        }
    }
}

/// Registration handle returned by the subscribe operations. Dropping the
/// handle does not unsubscribe; call [`Subscription::unsubscribe`], which is
/// idempotent.
pub struct Subscription {
    store: Weak<Store>,
    key: Option<String>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let mut inner = store.inner.lock().unwrap();
        match &self.key {
            None => {
                inner.global.remove(&self.id);
            }
            Some(name) => {
                if let Some(keyed) = inner.by_key.get_mut(name) {
                    keyed.remove(&self.id);
                    if keyed.is_empty() {
                        inner.by_key.remove(name);
                    }
                }
            }
        }
    }
}
