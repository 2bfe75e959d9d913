//! Ordered arena of attached connections.
//!
//! Entries live in a [`Slab`] and are threaded into a doubly-linked list by
//! index, so append, removal by handle, and in-order iteration are all O(1)
//! per element without any pointer graph.

use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token identifying one entry of one [`ConnectionSet`].
///
/// Handles are never reused: a slot's generation changes every time it is
/// filled, and the owning set's id is embedded, so a stale or foreign handle
/// can never remove the wrong entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    set: u64,
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An insertion-ordered collection with O(1) removal by handle.
#[derive(Debug)]
pub struct ConnectionSet<T> {
    id: u64,
    nodes: Slab<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    generation: u64,
}

impl<T> ConnectionSet<T> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Slab::new(),
            head: None,
            tail: None,
            generation: 0,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append an entry, returning its handle.
    pub fn push_back(&mut self, value: T) -> ConnectionHandle {
        self.generation += 1;
        let generation = self.generation;
        let index = self.nodes.insert(Node {
            value,
            generation,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);

        ConnectionHandle {
            set: self.id,
            index,
            generation,
        }
    }

    fn resolve(&self, handle: ConnectionHandle) -> Option<usize> {
        if handle.set != self.id {
            return None;
        }
        match self.nodes.get(handle.index) {
            Some(node) if node.generation == handle.generation => Some(handle.index),
            _ => None,
        }
    }

    /// Remove the entry for `handle`.
    ///
    /// Returns `None` if the handle was already removed or belongs to
    /// another set.
    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<T> {
        let index = self.resolve(handle)?;
        let node = self.nodes.remove(index);

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }

        Some(node.value)
    }

    /// Iterate entries in insertion order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            nodes: &self.nodes,
            cursor: self.head,
            remaining: self.nodes.len(),
        }
    }
}

impl<T> Default for ConnectionSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Insertion-order iterator over a [`ConnectionSet`].
pub struct Iter<'a, T> {
    nodes: &'a Slab<Node<T>>,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = &self.nodes[index];
        self.cursor = node.next;
        self.remaining -= 1;
        Some(&node.value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a ConnectionSet<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
