use crate::entry::Entry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Unpersisted entries and the keys they are stored under.
#[derive(Debug, Clone, Default)]
pub struct Pending {
    pub keys: Vec<Uuid>,
    pub entries: Vec<Entry>,
}

impl Pending {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    persisted: bool,
}

/// Live request events for the current window.
///
/// Every operation holds the lock for a single map operation or scan and
/// never awaits anything else while holding it. Staleness is only removed by
/// [`EventStore::evict_older_than`]; reads never filter by time.
#[derive(Debug, Default)]
pub struct EventStore {
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request from `client` at the current time and returns the
    /// size observed right after the insert.
    pub async fn insert(&self, client: impl Into<String>) -> usize {
        self.insert_at(client, Utc::now()).await
    }

    pub async fn insert_at(&self, client: impl Into<String>, at: DateTime<Utc>) -> usize {
        let slot = Slot {
            entry: Entry::new(client, at),
            persisted: false,
        };
        let mut slots = self.slots.lock().await;
        slots.insert(Uuid::new_v4(), slot);
        slots.len()
    }

    /// Removes every entry strictly older than `cutoff`.
    pub async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| slot.entry.timestamp >= cutoff);
        before - slots.len()
    }

    pub async fn size(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Bulk insert of recovered entries. They are already durable, so a later
    /// flush skips them.
    pub async fn load(&self, entries: Vec<Entry>) {
        let mut slots = self.slots.lock().await;
        slots.reserve(entries.len());
        for entry in entries {
            slots.insert(
                Uuid::new_v4(),
                Slot {
                    entry,
                    persisted: true,
                },
            );
        }
    }

    pub async fn snapshot(&self) -> Vec<Entry> {
        let slots = self.slots.lock().await;
        slots.values().map(|slot| slot.entry.clone()).collect()
    }

    /// Entries recorded during this run that the durable log has not seen.
    pub async fn pending(&self) -> Pending {
        let slots = self.slots.lock().await;
        let mut pending = Pending::default();
        for (key, slot) in slots.iter().filter(|(_, slot)| !slot.persisted) {
            pending.keys.push(*key);
            pending.entries.push(slot.entry.clone());
        }
        pending
    }

    /// Marks the given keys persisted. Entries inserted after the matching
    /// [`EventStore::pending`] call stay pending.
    pub async fn mark_persisted(&self, keys: &[Uuid]) {
        let mut slots = self.slots.lock().await;
        for key in keys {
            if let Some(slot) = slots.get_mut(key) {
                slot.persisted = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn burst_counts_strictly_increase() {
        let store = EventStore::new();
        for expected in 1..=25 {
            assert_eq!(store.insert("10.0.0.7").await, expected);
            assert_eq!(store.size().await, expected);
        }
    }

    #[tokio::test]
    async fn eviction_keeps_only_recent_entries() {
        let store = EventStore::new();
        let now = Utc::now();
        store
            .load(vec![
                Entry::new("a", now - Duration::seconds(70)),
                Entry::new("b", now - Duration::seconds(65)),
                Entry::new("c", now - Duration::seconds(10)),
            ])
            .await;

        let removed = store.evict_older_than(now - Duration::seconds(60)).await;
        assert_eq!(removed, 2);
        assert_eq!(store.size().await, 1);
        assert_eq!(store.snapshot().await[0].client, "c");
    }

    #[tokio::test]
    async fn cutoff_is_exclusive() {
        let store = EventStore::new();
        let cutoff = Utc::now();
        store.insert_at("edge", cutoff).await;
        assert_eq!(store.evict_older_than(cutoff).await, 0);
        assert_eq!(store.size().await, 1);
    }

    #[tokio::test]
    async fn recovered_entries_behave_like_live_ones() {
        let now = Utc::now();
        let at = now - Duration::seconds(30);

        let live = EventStore::new();
        live.insert_at("10.0.0.1", at).await;
        let recovered = EventStore::new();
        recovered.load(vec![Entry::new("10.0.0.1", at)]).await;

        for cutoff in [now - Duration::seconds(60), now - Duration::seconds(20)] {
            assert_eq!(
                live.evict_older_than(cutoff).await,
                recovered.evict_older_than(cutoff).await
            );
            assert_eq!(live.size().await, recovered.size().await);
        }
    }

    #[tokio::test]
    async fn snapshot_reloads_to_same_size() {
        let store = EventStore::new();
        for i in 0..40 {
            store.insert(format!("10.0.0.{i}")).await;
        }
        let snapshot = store.snapshot().await;

        let fresh = EventStore::new();
        fresh.load(snapshot).await;
        assert_eq!(fresh.size().await, store.size().await);
    }

    #[tokio::test]
    async fn same_client_same_instant_counts_twice() {
        let store = EventStore::new();
        let at = Utc::now();
        store.insert_at("10.0.0.1", at).await;
        assert_eq!(store.insert_at("10.0.0.1", at).await, 2);
    }

    #[tokio::test]
    async fn pending_excludes_recovered_and_flushed() {
        let store = EventStore::new();
        store.load(vec![Entry::now("old")]).await;
        store.insert("new").await;

        let pending = store.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.entries[0].client, "new");

        store.mark_persisted(&pending.keys).await;
        assert!(store.pending().await.is_empty());
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn insert_during_flush_stays_pending() {
        let store = EventStore::new();
        store.insert("first").await;
        let taken = store.pending().await;

        store.insert("late").await;
        store.mark_persisted(&taken.keys).await;

        let left = store.pending().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left.entries[0].client, "late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_are_not_lost() {
        let store = Arc::new(EventStore::new());
        let mut tasks = Vec::new();
        for task in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..250 {
                    store.insert(format!("10.{task}.0.{i}")).await;
                }
            }));
        }
        let sweeper = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    store
                        .evict_older_than(Utc::now() - Duration::seconds(60))
                        .await;
                    tokio::task::yield_now().await;
                }
            })
        };
        for task in tasks {
            task.await.unwrap();
        }
        sweeper.await.unwrap();

        assert_eq!(store.snapshot().await.len(), 16 * 250);
    }
}
