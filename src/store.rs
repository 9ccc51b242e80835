//! Atomic document store
//!
//! A DashMap-backed arena keyed by document id. Every mutation is a single
//! conditional update executed under the entry's shard lock, so two tasks
//! racing on the same document see a consistent before/after and at most
//! one of them wins a conditional transition.
//!
//! Closures passed to [`DocumentStore::update_if`] must not touch the same
//! store; they run while the shard lock is held.

use crate::errors::StoreError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// A record that can live in a [`DocumentStore`]
pub trait Document: Clone + Send + Sync + 'static {
    fn doc_id(&self) -> &str;
}

pub struct DocumentStore<T: Document> {
    collection: &'static str,
    docs: DashMap<String, T>,
}

impl<T: Document> DocumentStore<T> {
    pub fn new(collection: &'static str) -> Self {
        Self {
            collection,
            docs: DashMap::new(),
        }
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    /// Insert a document whose id must not exist yet
    pub fn insert_new(&self, doc: T) -> Result<(), StoreError> {
        match self.docs.entry(doc.doc_id().to_string()) {
            Entry::Occupied(e) => Err(StoreError::Duplicate(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(doc);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.docs.get(id).map(|d| d.value().clone())
    }

    /// Apply `mutate` only if `predicate` holds for the current document.
    /// Returns the updated document.
    pub fn update_if<P, M>(&self, id: &str, predicate: P, mutate: M) -> Result<T, StoreError>
    where
        P: FnOnce(&T) -> bool,
        M: FnOnce(&mut T),
    {
        let mut doc = self
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !predicate(doc.value()) {
            return Err(StoreError::ConditionFailed(id.to_string()));
        }

        mutate(doc.value_mut());
        Ok(doc.value().clone())
    }

    /// Snapshot of every document matching `predicate`
    pub fn find<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.docs
            .iter()
            .filter(|d| predicate(d.value()))
            .map(|d| d.value().clone())
            .collect()
    }

    /// First document matching `predicate`, in no particular order
    pub fn find_one<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        self.docs
            .iter()
            .find(|d| predicate(d.value()))
            .map(|d| d.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.docs.remove(id).map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}
