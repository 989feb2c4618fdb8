//! Ordered index over key-range items.
//!
//! Items are kept sorted by `(start_key, id)`. Point and overlap queries
//! binary-search to the end of the candidate window (every item starting
//! before the query's upper bound) and keep the ones whose end lies past the
//! query's lower bound. The index itself is not synchronized: each manager
//! guards its indexes with one lock, builds replacements with
//! [`RangeIndex::build`] outside that lock and swaps them in with
//! [`RangeIndex::replace_all`].

use std::cmp::Ordering;

use crate::types::{end_after, ranges_intersect};

/// An entity addressable by id and covering a key range.
pub trait RangeItem {
    /// Identifier type; several items may share one id when an entity spans
    /// multiple disjoint ranges.
    type Id: Ord + Clone;

    /// Identifier of the owning entity.
    fn id(&self) -> &Self::Id;

    /// Inclusive start key.
    fn start_key(&self) -> &[u8];

    /// Exclusive end key; empty means unbounded.
    fn end_key(&self) -> &[u8];
}

/// Sorted key-range index.
#[derive(Clone, Debug)]
pub struct RangeIndex<T> {
    items: Vec<T>,
}

impl<T: RangeItem> Default for RangeIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn order<T: RangeItem>(a: &T, b: &T) -> Ordering {
    a.start_key()
        .cmp(b.start_key())
        .then_with(|| a.id().cmp(b.id()))
}

impl<T: RangeItem> RangeIndex<T> {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Builds an index from unsorted items.
    pub fn build(mut items: Vec<T>) -> Self {
        items.sort_by(order);
        Self { items }
    }

    /// Number of indexed items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the index holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates items in `(start_key, id)` order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Adds an item without touching other items that share its id.
    pub fn insert(&mut self, item: T) {
        let pos = self
            .items
            .partition_point(|x| order(x, &item) == Ordering::Less);
        self.items.insert(pos, item);
    }

    /// Replaces every item sharing the new item's id. Returns the replaced items.
    pub fn upsert(&mut self, item: T) -> Vec<T> {
        let removed = self.delete(item.id());
        self.insert(item);
        removed
    }

    /// Removes every item with the given id. Returns the removed items.
    pub fn delete(&mut self, id: &T::Id) -> Vec<T> {
        let (removed, kept): (Vec<T>, Vec<T>) =
            std::mem::take(&mut self.items)
                .into_iter()
                .partition(|x| x.id() == id);
        self.items = kept;
        removed
    }

    /// Items whose range contains `key`.
    pub fn point_query(&self, key: &[u8]) -> Vec<&T> {
        let limit = self.items.partition_point(|x| x.start_key() <= key);
        self.items[..limit]
            .iter()
            .filter(|x| end_after(x.end_key(), key))
            .collect()
    }

    /// Items whose range intersects `[start, end)`; an empty `end` is unbounded.
    pub fn overlap_query(&self, start: &[u8], end: &[u8]) -> Vec<&T> {
        if !end.is_empty() && start >= end {
            return Vec::new();
        }
        let limit = if end.is_empty() {
            self.items.len()
        } else {
            self.items.partition_point(|x| x.start_key() < end)
        };
        self.items[..limit]
            .iter()
            .filter(|x| ranges_intersect(x.start_key(), x.end_key(), start, end))
            .collect()
    }

    /// Swaps in a prebuilt index and returns the previous items.
    pub fn replace_all(&mut self, next: RangeIndex<T>) -> Vec<T> {
        std::mem::replace(&mut self.items, next.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Span {
        id: String,
        start: Vec<u8>,
        end: Vec<u8>,
    }

    fn span(id: &str, start: &str, end: &str) -> Span {
        Span {
            id: id.to_string(),
            start: start.as_bytes().to_vec(),
            end: end.as_bytes().to_vec(),
        }
    }

    impl RangeItem for Span {
        type Id = String;

        fn id(&self) -> &String {
            &self.id
        }

        fn start_key(&self) -> &[u8] {
            &self.start
        }

        fn end_key(&self) -> &[u8] {
            &self.end
        }
    }

    fn ids(items: Vec<&Span>) -> Vec<&str> {
        items.into_iter().map(|s| s.id.as_str()).collect()
    }

    fn sample() -> RangeIndex<Span> {
        RangeIndex::build(vec![
            span("tail", "m", ""),
            span("head", "", "c"),
            span("mid", "b", "n"),
            span("narrow", "d", "e"),
        ])
    }

    #[test]
    fn test_build_sorts_by_start() {
        let index = sample();
        let order: Vec<&str> = index.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["head", "mid", "narrow", "tail"]);
    }

    #[test]
    fn test_point_query() {
        let index = sample();
        assert_eq!(ids(index.point_query(b"")), vec!["head"]);
        assert_eq!(ids(index.point_query(b"bz")), vec!["head", "mid"]);
        assert_eq!(ids(index.point_query(b"c")), vec!["mid"]);
        assert_eq!(ids(index.point_query(b"m")), vec!["mid", "tail"]);
        assert_eq!(ids(index.point_query(b"zzz")), vec!["tail"]);
    }

    #[test]
    fn test_overlap_query() {
        let index = sample();
        assert_eq!(
            ids(index.overlap_query(b"c", b"d")),
            vec!["mid"]
        );
        assert_eq!(
            ids(index.overlap_query(b"c", b"")),
            vec!["mid", "narrow", "tail"]
        );
        assert_eq!(
            ids(index.overlap_query(b"", b"")),
            vec!["head", "mid", "narrow", "tail"]
        );
        assert!(index.overlap_query(b"x", b"x").is_empty());
    }

    #[test]
    fn test_upsert_replaces_same_id() {
        let mut index = sample();
        let replaced = index.upsert(span("mid", "x", "y"));
        assert_eq!(replaced, vec![span("mid", "b", "n")]);
        assert_eq!(index.len(), 4);
        assert_eq!(ids(index.point_query(b"x")), vec!["tail", "mid"]);
        assert!(ids(index.point_query(b"c")).is_empty());
    }

    #[test]
    fn test_insert_keeps_multiple_ranges_per_id() {
        let mut index = RangeIndex::new();
        index.insert(span("r", "a", "b"));
        index.insert(span("r", "x", "y"));
        assert_eq!(index.len(), 2);
        assert_eq!(index.delete(&"r".to_string()).len(), 2);
        assert!(index.is_empty());
    }

    #[test]
    fn test_replace_all_returns_previous() {
        let mut index = sample();
        let next = RangeIndex::build(vec![span("only", "", "")]);
        let previous = index.replace_all(next);
        assert_eq!(previous.len(), 4);
        assert_eq!(ids(index.point_query(b"q")), vec!["only"]);
    }
}
