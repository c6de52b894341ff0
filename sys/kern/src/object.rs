// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The object table and the kinds of object that live in it.
//!
//! Every kernel object occupies one entry of a fixed-size table supplied at
//! boot. Entries are never allocated or freed: an entry changes kind only by
//! being rewritten in place (Memory `become`, or `split`/`make_child` into a
//! donated Slot), and always under a generation bump so that keys to the old
//! occupant stop working.
//!
//! Contexts and Interrupts can wait on lists (the run queue and the Gates'
//! sender and receiver lists). Those lists are threaded through the entries by
//! table index; see `kerncore::plist`.

use abi::{ObjectKind, Priority};
use kerncore::{Link, Links};

use crate::context::Context;
use crate::gate::Gate;
use crate::interrupt::{Interrupt, Line};
use crate::key::{Generation, TableIndex};
use crate::memory::Memory;
use crate::reply_gate::ReplyGate;

/// Object kinds and their state.
#[derive(Debug)]
pub enum Object {
    /// Refuses everything. Stale keys land here.
    Null,
    /// The table itself, which can mint and revoke keys.
    ObjectTable,
    /// An empty entry, waiting to be donated.
    Slot,
    Memory(Memory),
    Context(Context),
    Gate(Gate),
    ReplyGate(ReplyGate),
    Interrupt(Interrupt),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Null => ObjectKind::Null,
            Self::ObjectTable => ObjectKind::ObjectTable,
            Self::Slot => ObjectKind::Slot,
            Self::Memory(_) => ObjectKind::Memory,
            Self::Context(_) => ObjectKind::Context,
            Self::Gate(_) => ObjectKind::Gate,
            Self::ReplyGate(_) => ObjectKind::ReplyGate,
            Self::Interrupt(i) => match i.line {
                Line::Irq(_) => ObjectKind::Interrupt,
                Line::SysTick => ObjectKind::SysTick,
            },
        }
    }
}

/// One object table entry.
#[derive(Debug)]
pub struct Entry {
    pub generation: Generation,
    pub object: Object,
}

impl Entry {
    /// An unused entry, suitable for initializing a static table.
    pub const EMPTY: Self = Self {
        generation: Generation::ZERO,
        object: Object::Null,
    };

    pub fn new(object: Object) -> Self {
        Self {
            generation: Generation::ZERO,
            object,
        }
    }
}

/// Identifies one of the kernel's priority lists.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Queue {
    /// The scheduler's run queue.
    Runnable,
    /// Senders blocked on the Gate at this index.
    Senders(TableIndex),
    /// Receivers blocked on the Gate at this index.
    Receivers(TableIndex),
}

/// List membership of a queueable object: the link itself, and which list
/// it's on so that it can be removed without searching.
#[derive(Copy, Clone, Debug, Default)]
pub struct QueueLink {
    pub link: Link,
    pub queue: Option<Queue>,
}

impl QueueLink {
    pub const UNLINKED: Self = Self {
        link: Link::UNLINKED,
        queue: None,
    };
}

impl Entry {
    /// List membership, for the kinds that can wait on lists.
    pub fn queue_link(&self) -> Option<&QueueLink> {
        match &self.object {
            Object::Context(c) => Some(&c.queue_link),
            Object::Interrupt(i) => Some(&i.queue_link),
            _ => None,
        }
    }

    pub fn queue_link_mut(&mut self) -> Option<&mut QueueLink> {
        match &mut self.object {
            Object::Context(c) => Some(&mut c.queue_link),
            Object::Interrupt(i) => Some(&mut i.queue_link),
            _ => None,
        }
    }

    /// Priority used when this entry waits on a list.
    pub fn queue_priority(&self) -> Option<Priority> {
        match &self.object {
            Object::Context(c) => Some(c.priority),
            Object::Interrupt(i) => Some(i.priority),
            _ => None,
        }
    }
}

/// The object table viewed as a list arena. (A local wrapper, because the
/// orphan rule forbids implementing `kerncore::Links` on `[Entry]` directly.)
pub(crate) struct EntryArena<'a>(pub(crate) &'a mut [Entry]);

impl Links for EntryArena<'_> {
    fn link(&self, node: u32) -> &Link {
        match self.0[node as usize].queue_link() {
            Some(q) => &q.link,
            None => panic!("entry {node} can't be queued"),
        }
    }

    fn link_mut(&mut self, node: u32) -> &mut Link {
        match self.0[node as usize].queue_link_mut() {
            Some(q) => &mut q.link,
            None => panic!("entry {node} can't be queued"),
        }
    }
}
