// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-bucketed intrusive lists.
//!
//! Nodes are named by their index in some arena (in the kernel, the object
//! table) and the links live inside the nodes themselves, so a list is just a
//! handful of head/tail indices. This means the list doesn't own or borrow
//! its members: every operation takes the arena as an explicit parameter.
//!
//! Bucket 0 is the most important. Within a bucket, order is FIFO.

/// Per-node linkage. Lives inside whatever the arena stores.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Link {
    next: Option<u32>,
    prev: Option<u32>,
    bucket: usize,
    linked: bool,
}

impl Link {
    pub const UNLINKED: Self = Self {
        next: None,
        prev: None,
        bucket: 0,
        linked: false,
    };

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Bucket the node was inserted at, if linked.
    pub fn bucket(&self) -> Option<usize> {
        self.linked.then_some(self.bucket)
    }
}

/// Access to the links of an arena's nodes.
///
/// Implementations may panic if `node` names something that can't be linked;
/// lists only ever pass indices that were previously inserted, or that the
/// caller passed in.
pub trait Links {
    fn link(&self, node: u32) -> &Link;
    fn link_mut(&mut self, node: u32) -> &mut Link;
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Bucket {
    head: Option<u32>,
    tail: Option<u32>,
}

/// A list of nodes ordered by bucket, then by insertion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PriorityList<const N: usize> {
    buckets: [Bucket; N],
}

impl<const N: usize> Default for PriorityList<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PriorityList<N> {
    pub const fn new() -> Self {
        Self {
            buckets: [Bucket {
                head: None,
                tail: None,
            }; N],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.head.is_none())
    }

    /// Appends `node` to the end of `bucket`.
    ///
    /// # Panics
    ///
    /// If `node` is already on a list, or `bucket` is out of range.
    pub fn insert(
        &mut self,
        arena: &mut (impl Links + ?Sized),
        node: u32,
        bucket: usize,
    ) {
        assert!(bucket < N, "bucket {bucket} out of range");
        assert!(
            !arena.link(node).linked,
            "node {node} inserted while already linked"
        );

        let b = &mut self.buckets[bucket];
        let old_tail = b.tail;
        *arena.link_mut(node) = Link {
            next: None,
            prev: old_tail,
            bucket,
            linked: true,
        };
        match old_tail {
            Some(t) => arena.link_mut(t).next = Some(node),
            None => b.head = Some(node),
        }
        b.tail = Some(node);
    }

    /// Unlinks `node` from this list.
    ///
    /// # Panics
    ///
    /// If `node` isn't linked.
    pub fn remove(&mut self, arena: &mut (impl Links + ?Sized), node: u32) {
        let link = *arena.link(node);
        assert!(link.linked, "node {node} removed while unlinked");

        let b = &mut self.buckets[link.bucket];
        match link.prev {
            Some(p) => arena.link_mut(p).next = link.next,
            None => b.head = link.next,
        }
        match link.next {
            Some(n) => arena.link_mut(n).prev = link.prev,
            None => b.tail = link.prev,
        }
        *arena.link_mut(node) = Link::UNLINKED;
    }

    /// Returns the first node of the most important non-empty bucket.
    pub fn peek(&self) -> Option<u32> {
        self.buckets.iter().find_map(|b| b.head)
    }

    /// Removes and returns the first node of the most important non-empty
    /// bucket.
    pub fn take(&mut self, arena: &mut (impl Links + ?Sized)) -> Option<u32> {
        let node = self.peek()?;
        self.remove(arena, node);
        Some(node)
    }
}
