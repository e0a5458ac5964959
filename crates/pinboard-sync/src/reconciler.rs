use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use pinboard_types::events::{ChangeEvent, ChangeKind, Entity};

/// Key of a reconciled entry: either the store's id, or a provisional id for
/// a local write the store has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey<K> {
    Stored(K),
    Provisional(Uuid),
}

/// Merges change events and local optimistic writes into one ordered
/// collection.
///
/// Entries keep insertion order. Authoritative entries converge to the store;
/// provisional ones stay until they are reconciled or rolled back.
pub struct Reconciler<T: Entity> {
    entries: Vec<(EntryKey<T::Key>, T)>,
    index: HashMap<EntryKey<T::Key>, usize>,
}

impl<T: Entity> Reconciler<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Replace every authoritative entry. Pending provisional entries are
    /// kept after the snapshot since the store does not know them yet.
    pub fn load_snapshot(&mut self, rows: Vec<T>) {
        let pending: Vec<(EntryKey<T::Key>, T)> = self
            .entries
            .drain(..)
            .filter(|(key, _)| matches!(key, EntryKey::Provisional(_)))
            .collect();
        self.index.clear();

        for row in rows {
            self.upsert(EntryKey::Stored(row.key()), row);
        }
        for (key, value) in pending {
            self.upsert(key, value);
        }
        debug!("{} snapshot loaded: {} entries", T::TABLE, self.entries.len());
    }

    /// Merge one change event. Returns whether the collection changed shape
    /// or content.
    pub fn apply_event(&mut self, event: ChangeEvent) -> bool {
        if event.table != T::TABLE {
            warn!("{} event delivered to {} collection, ignored", event.table, T::TABLE);
            return false;
        }

        match event.kind {
            ChangeKind::Insert => match event.new_row.and_then(T::from_row) {
                Some(value) => {
                    self.upsert(EntryKey::Stored(value.key()), value);
                    true
                }
                None => false,
            },
            ChangeKind::Update => match event.new_row.and_then(T::from_row) {
                Some(value) => {
                    let key = EntryKey::Stored(value.key());
                    match self.index.get(&key) {
                        Some(&pos) => {
                            self.entries[pos].1 = value;
                            true
                        }
                        None => false,
                    }
                }
                None => false,
            },
            ChangeKind::Delete => match event.old_row.and_then(T::from_row) {
                Some(value) => self.remove(&EntryKey::Stored(value.key())).is_some(),
                None => false,
            },
        }
    }

    /// Show a local write immediately, before the store has it.
    pub fn apply_optimistic(&mut self, temp_id: Uuid, value: T) {
        self.upsert(EntryKey::Provisional(temp_id), value);
    }

    /// Swap the provisional entry for the acknowledged one. If the feed
    /// already delivered `final_id`, that entry is overwritten and the
    /// provisional one dropped, so exactly one entry remains.
    pub fn reconcile_optimistic(&mut self, temp_id: Uuid, final_id: T::Key, final_value: T) {
        let provisional = EntryKey::Provisional(temp_id);
        let stored = EntryKey::Stored(final_id);

        if self.index.contains_key(&stored) {
            self.remove(&provisional);
            self.upsert(stored, final_value);
            return;
        }

        match self.index.remove(&provisional) {
            Some(pos) => {
                self.entries[pos] = (stored.clone(), final_value);
                self.index.insert(stored, pos);
            }
            None => self.upsert(stored, final_value),
        }
    }

    /// Drop a provisional entry after its write failed.
    pub fn rollback_optimistic(&mut self, temp_id: Uuid) -> Option<T> {
        self.remove(&EntryKey::Provisional(temp_id))
    }

    /// Evict the oldest authoritative entries beyond `limit`. Provisional
    /// entries are never evicted. Returns how many were dropped.
    pub fn retain_latest(&mut self, limit: usize) -> usize {
        let mut excess = self.confirmed().count().saturating_sub(limit);
        if excess == 0 {
            return 0;
        }
        let evicted = excess;
        self.entries.retain(|(key, _)| {
            if excess > 0 && matches!(key, EntryKey::Stored(_)) {
                excess -= 1;
                false
            } else {
                true
            }
        });
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (key, _))| (key.clone(), i))
            .collect();
        evicted
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.index
            .get(&EntryKey::Stored(key.clone()))
            .map(|&pos| &self.entries[pos].1)
    }

    /// All entries, authoritative and provisional, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Authoritative entries only.
    pub fn confirmed(&self) -> impl Iterator<Item = &T> {
        self.entries
            .iter()
            .filter(|(k, _)| matches!(k, EntryKey::Stored(_)))
            .map(|(_, v)| v)
    }

    /// Provisional ids still awaiting reconcile or rollback.
    pub fn pending(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter_map(|(k, _)| match k {
                EntryKey::Provisional(id) => Some(*id),
                EntryKey::Stored(_) => None,
            })
            .collect()
    }

    pub fn is_pending(&self, temp_id: Uuid) -> bool {
        self.index.contains_key(&EntryKey::Provisional(temp_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn upsert(&mut self, key: EntryKey<T::Key>, value: T) {
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    fn remove(&mut self, key: &EntryKey<T::Key>) -> Option<T> {
        let pos = self.index.remove(key)?;
        let (_, value) = self.entries.remove(pos);
        for (i, (k, _)) in self.entries.iter().enumerate().skip(pos) {
            self.index.insert(k.clone(), i);
        }
        Some(value)
    }
}

impl<T: Entity> Default for Reconciler<T> {
    fn default() -> Self {
        Self::new()
    }
}
