use crate::models::Record;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Collection<R: Record> {
    entries: HashMap<String, R>,
}

impl<R: Record> Default for Collection<R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<R: Record> Collection<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&R> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn upsert(&mut self, record: R) -> Option<R> {
        self.entries.insert(record.key().to_string(), record)
    }

    pub fn remove(&mut self, key: &str) -> Option<R> {
        self.entries.remove(key)
    }

    /// Replaces the entry under `old_key` with `record` under its own key.
    ///
    /// When `record`'s key is already present the existing entry is kept:
    /// it arrived through the change feed and is at least as fresh.
    pub fn rekey(&mut self, old_key: &str, record: R) {
        self.entries.remove(old_key);
        if !self.entries.contains_key(record.key()) {
            self.upsert(record);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn snapshot(&self) -> Vec<R> {
        let mut records = self.entries.values().cloned().collect::<Vec<_>>();
        records.sort_by(|a, b| {
            b.updated_at()
                .cmp(&a.updated_at())
                .then_with(|| a.key().cmp(b.key()))
        });
        records
    }
}

impl<R: Record> FromIterator<R> for Collection<R> {
    fn from_iter<T: IntoIterator<Item = R>>(iter: T) -> Self {
        let mut collection = Self::new();
        for record in iter {
            collection.upsert(record);
        }
        collection
    }
}
