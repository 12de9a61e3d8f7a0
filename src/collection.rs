//! Ordered, deduplicated record collections and the fold rule.
//!
//! The fold is order-insensitive with respect to the race between the
//! initial bulk fetch and the first incremental events: for any
//! interleaving, a collection holds exactly one element per identifier,
//! matching the last non-delete event seen for it.

use indexmap::IndexMap;

use crate::models::FeedRecord;

/// Display ordering of a synchronized collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOrder {
    /// Conversations: insertion/update time, newest first.
    NewestFirst,
    /// Messages: creation timestamp, ascending.
    CreatedAscending,
}

/// One mutation to fold into a collection, already decoded to the
/// record type.
#[derive(Debug, Clone)]
pub enum FoldEvent<R> {
    Insert(R),
    Update(R),
    Delete { id: String },
}

/// An ordered, deduplicated sequence of records.
#[derive(Debug, Clone)]
pub struct SyncedCollection<R: FeedRecord> {
    records: IndexMap<String, R>,
    order: CollectionOrder,
}

impl<R: FeedRecord> SyncedCollection<R> {
    pub fn new(order: CollectionOrder) -> Self {
        Self {
            records: IndexMap::new(),
            order,
        }
    }

    /// Replace the collection wholesale with a bulk-fetched set.
    /// Server-provided order is preserved as-is; a duplicate id in the
    /// input keeps the last occurrence.
    pub fn replace_all(&mut self, records: Vec<R>) {
        self.records.clear();
        for record in records {
            self.records.insert(record.record_id().to_string(), record);
        }
    }

    /// Fold one incoming mutation event. Idempotent for redelivered
    /// inserts and already-deleted ids.
    pub fn fold(&mut self, event: FoldEvent<R>) {
        match event {
            FoldEvent::Insert(record) => {
                // Change feeds may redeliver; an existing id wins.
                if self.records.contains_key(record.record_id()) {
                    log::debug!(
                        "[SyncedCollection] Duplicate insert for {}, ignoring",
                        record.record_id()
                    );
                    return;
                }
                self.insert_ordered(record);
            }
            FoldEvent::Update(record) => {
                let id = record.record_id().to_string();
                if self.records.contains_key(&id) {
                    // In-place replace keeps the element's position.
                    self.records.insert(id, record);
                } else {
                    self.insert_ordered(record);
                }
            }
            FoldEvent::Delete { id } => {
                if self.records.shift_remove(&id).is_none() {
                    log::debug!("[SyncedCollection] Delete for absent {id}, ignoring");
                }
            }
        }
    }

    fn insert_ordered(&mut self, record: R) {
        let id = record.record_id().to_string();
        match self.order {
            CollectionOrder::NewestFirst => {
                self.records.shift_insert(0, id, record);
            }
            CollectionOrder::CreatedAscending => {
                let index = self
                    .records
                    .values()
                    .position(|existing| existing.created_at() > record.created_at())
                    .unwrap_or(self.records.len());
                self.records.shift_insert(index, id, record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.records.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }

    /// Snapshot of the records in display order.
    pub fn to_vec(&self) -> Vec<R> {
        self.records.values().cloned().collect()
    }
}
