//! A named key-ordered collection.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

/// Pluggable key comparator. The views engine supplies a JSON-collating
/// comparator for vindex collections; everything else uses byte order.
pub type KeyCompare = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// The default byte-lexicographic comparator.
pub fn byte_compare() -> KeyCompare {
    Arc::new(|a, b| a.cmp(b))
}

/// A key-ordered collection of byte entries.
///
/// Stored as a sorted vector; lookups are binary searches under the
/// comparator. Collections loaded from disk start under byte order and
/// are re-sorted when a custom comparator is attached.
pub struct Collection {
    cmp: KeyCompare,
    custom: bool,
    entries: Vec<(Bytes, Bytes)>,
}

impl Collection {
    /// Creates an empty collection under byte order.
    pub fn new() -> Self {
        Collection { cmp: byte_compare(), custom: false, entries: Vec::new() }
    }

    /// Creates an empty collection under the given comparator.
    pub fn with_compare(cmp: KeyCompare) -> Self {
        Collection { cmp, custom: true, entries: Vec::new() }
    }

    /// Attaches a custom comparator, re-sorting existing entries once.
    /// A second attach is a no-op; comparators for a given collection
    /// name must agree across the process.
    pub(crate) fn attach_compare(&mut self, cmp: KeyCompare) {
        if self.custom {
            return;
        }
        self.cmp = cmp;
        self.custom = true;
        let cmp = self.cmp.clone();
        self.entries.sort_by(|a, b| cmp(&a.0, &b.0));
    }

    fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| (self.cmp)(k, key))
    }

    /// Looks up a key.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.find(key).ok().map(|i| self.entries[i].1.clone())
    }

    /// Inserts or replaces an entry, returning the previous value.
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Option<Bytes> {
        let key = key.into();
        let value = value.into();
        match self.find(&key) {
            Ok(i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            Err(i) => {
                self.entries.insert(i, (key, value));
                None
            }
        }
    }

    /// Removes an entry, returning its value.
    pub fn delete(&mut self, key: &[u8]) -> Option<Bytes> {
        self.find(key).ok().map(|i| self.entries.remove(i).1)
    }

    /// The lowest entry under the comparator.
    pub fn min_item(&self) -> Option<(Bytes, Bytes)> {
        self.entries.first().cloned()
    }

    /// The highest entry under the comparator.
    pub fn max_item(&self) -> Option<(Bytes, Bytes)> {
        self.entries.last().cloned()
    }

    /// Visits entries in ascending order starting at `from` (inclusive).
    /// The visitor returns `false` to stop early.
    pub fn visit_ascend(&self, from: &[u8], mut visitor: impl FnMut(&Bytes, &Bytes) -> bool) {
        let start = match self.find(from) {
            Ok(i) | Err(i) => i,
        };
        for (k, v) in &self.entries[start..] {
            if !visitor(k, v) {
                return;
            }
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the collection has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates all entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.entries.iter()
    }

    /// Replaces the contents wholesale (store-file load path).
    pub(crate) fn load_entries(&mut self, mut entries: Vec<(Bytes, Bytes)>) {
        let cmp = self.cmp.clone();
        entries.sort_by(|a, b| cmp(&a.0, &b.0));
        self.entries = entries;
    }
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn coll(entries: &[(&str, &str)]) -> Collection {
        let mut c = Collection::new();
        for (k, v) in entries {
            c.set(Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes()));
        }
        c
    }

    #[test]
    fn set_get_delete() {
        let mut c = coll(&[("b", "2"), ("a", "1")]);
        assert_eq!(c.get(b"a").unwrap(), "1");
        assert_eq!(c.get(b"b").unwrap(), "2");
        assert!(c.get(b"c").is_none());

        let old = c.set(Bytes::from_static(b"a"), Bytes::from_static(b"9"));
        assert_eq!(old.unwrap(), "1");
        assert_eq!(c.get(b"a").unwrap(), "9");

        assert_eq!(c.delete(b"a").unwrap(), "9");
        assert!(c.get(b"a").is_none());
        assert!(c.delete(b"a").is_none());
    }

    #[test]
    fn min_max_follow_order() {
        let c = coll(&[("m", ""), ("a", ""), ("z", "")]);
        assert_eq!(c.min_item().unwrap().0, "a");
        assert_eq!(c.max_item().unwrap().0, "z");
    }

    #[test]
    fn visit_ascend_from_seek_key() {
        let c = coll(&[("a", ""), ("c", ""), ("e", "")]);
        let mut seen = Vec::new();
        c.visit_ascend(b"b", |k, _| {
            seen.push(k.clone());
            true
        });
        assert_eq!(seen, vec![Bytes::from_static(b"c"), Bytes::from_static(b"e")]);
    }

    #[test]
    fn visit_ascend_early_stop() {
        let c = coll(&[("a", ""), ("b", ""), ("c", "")]);
        let mut seen = 0;
        c.visit_ascend(b"", |_, _| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn custom_comparator_orders_entries() {
        // Reverse byte order.
        let rev: KeyCompare = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));
        let mut c = Collection::with_compare(rev);
        c.set(Bytes::from_static(b"a"), Bytes::new());
        c.set(Bytes::from_static(b"z"), Bytes::new());
        assert_eq!(c.min_item().unwrap().0, "z");
        assert_eq!(c.max_item().unwrap().0, "a");
    }

    #[test]
    fn attach_comparator_resorts_once() {
        let mut c = coll(&[("a", ""), ("z", "")]);
        let rev: KeyCompare = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));
        c.attach_compare(rev.clone());
        assert_eq!(c.min_item().unwrap().0, "z");
        // Second attach keeps the first comparator.
        c.attach_compare(byte_compare());
        assert_eq!(c.min_item().unwrap().0, "z");
    }
}
