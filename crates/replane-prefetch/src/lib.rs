//! Server-side snapshot production for render-time prefetch.
//!
//! A request handler that embeds configuration in its rendered output needs
//! a one-shot [`Snapshot`], but opening a replication stream per request
//! would hammer the service. [`SnapshotCache`] keeps one live client per
//! `(base_url, sdk_key)` pair behind a sliding TTL, and coalesces concurrent
//! first requests onto a single connection. It is an explicit value: create
//! one at process startup and share it, so tests can run isolated caches.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use replane::{Client, ClientOptions, Snapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

type Key = (String, String);
type Pending = Shared<BoxFuture<'static, Result<Client, Arc<replane::Error>>>>;

enum Entry {
    /// A connection attempt other callers can await.
    Pending { generation: u64, future: Pending },
    Ready(CachedClient),
}

struct CachedClient {
    client: Client,
    expires_at: Instant,
}

pub struct SnapshotCache {
    keep_alive: Duration,
    generation: AtomicU64,
    entries: Arc<Mutex<HashMap<Key, Entry>>>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_ALIVE)
    }
}

impl SnapshotCache {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive,
            generation: AtomicU64::new(0),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Produce a snapshot for the given connection, reusing (and touching)
    /// the cached client when one exists. `None` builds an offline snapshot
    /// from defaults without touching the cache.
    ///
    /// Failed initializations are never cached: the next caller retries.
    pub async fn snapshot(
        &self,
        connection: Option<ClientOptions>,
    ) -> Result<Snapshot, Arc<replane::Error>> {
        let Some(options) = connection else {
            return Ok(Client::in_memory(Vec::new(), Default::default()).snapshot());
        };
        let key = (options.base_url.clone(), options.sdk_key.clone());

        let (generation, future) = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(Entry::Ready(cached)) = entries.get_mut(&key) {
                cached.expires_at = Instant::now() + self.keep_alive;
                return Ok(cached.client.snapshot());
            }
            if let Some(Entry::Pending { generation, future }) = entries.get(&key) {
                (*generation, future.clone())
            } else {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let future = async move { Client::connect(options).await.map_err(Arc::new) }
                    .boxed()
                    .shared();
                entries.insert(
                    key.clone(),
                    Entry::Pending {
                        generation,
                        future: future.clone(),
                    },
                );
                (generation, future)
            }
        };

        match future.await {
            Ok(client) => Ok(self.publish(key, generation, client)),
            Err(err) => {
                let mut entries = self.entries.lock().unwrap();
                let ours = matches!(
                    entries.get(&key),
                    Some(Entry::Pending { generation: g, .. }) if *g == generation
                );
                if ours {
                    entries.remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Close every cached client and empty the cache. Safe to call
    /// repeatedly or when empty.
    pub fn clear(&self) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            if let Entry::Ready(cached) = entry {
                cached.client.close();
            }
        }
    }

    // Convert our pending entry into a ready one. Whichever waiter gets here
    // first wins; the rest touch the published entry. If the cache was
    // cleared (or superseded) while connecting, the fresh client is closed
    // after its snapshot is taken so it does not leak a stream.
    fn publish(&self, key: Key, generation: u64, client: Client) -> Snapshot {
        let mut entries = self.entries.lock().unwrap();
        let ours = matches!(
            entries.get(&key),
            Some(Entry::Pending { generation: g, .. }) if *g == generation
        );
        if ours {
            let snapshot = client.snapshot();
            entries.insert(
                key.clone(),
                Entry::Ready(CachedClient {
                    client,
                    expires_at: Instant::now() + self.keep_alive,
                }),
            );
            drop(entries);
            self.spawn_expiry(key);
            return snapshot;
        }
        if let Some(Entry::Ready(cached)) = entries.get_mut(&key) {
            cached.expires_at = Instant::now() + self.keep_alive;
            return cached.client.snapshot();
        }
        drop(entries);
        let snapshot = client.snapshot();
        client.close();
        snapshot
    }

    // One sliding-expiry task per ready entry. Touching the entry pushes
    // `expires_at` forward; the task re-arms until the deadline truly
    // passes, then closes the client and evicts.
    fn spawn_expiry(&self, key: Key) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let entries = entries.lock().unwrap();
                    match entries.get(&key) {
                        Some(Entry::Ready(cached)) => cached.expires_at,
                        _ => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let expired = {
                    let mut entries = entries.lock().unwrap();
                    match entries.get(&key) {
                        Some(Entry::Ready(cached)) if cached.expires_at <= Instant::now() => {
                            match entries.remove(&key) {
                                Some(Entry::Ready(cached)) => Some(cached.client),
                                _ => None,
                            }
                        }
                        Some(Entry::Ready(_)) => None, // touched; re-arm
                        _ => return,
                    }
                };
                if let Some(client) = expired {
                    tracing::debug!(base_url = %key.0, "prefetch client expired");
                    client.close();
                    return;
                }
            }
        });
    }
}

impl Drop for SnapshotCache {
    fn drop(&mut self) {
        self.clear();
    }
}
