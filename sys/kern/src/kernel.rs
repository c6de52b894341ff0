// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel state and the delivery contract shared by all objects.
//!
//! All mutable kernel state lives in a `Kernel`, which is passed explicitly to
//! everything that needs it. Objects refer to one another by table index,
//! never by reference, so an operation on one object can freely touch others.
//!
//! Two entry points carry every interaction between a party and an object:
//!
//! - `deliver_from(index, brand, sender)` hands the object a message from a
//!   sender, which the object may accept (and possibly reply to), refuse, or
//!   ask to block.
//! - `deliver_to(key, context)` asks the object for a message on behalf of a
//!   receiving Context.
//!
//! The per-kind halves of these live in the kinds' modules.

use abi::{Brand, Exception, Message, N_MESSAGE_KEYS, N_PRIORITIES, MAX_IRQS};
use kerncore::mpu::Region;
use kerncore::PriorityList;

use crate::context::Context;
use crate::err::Failure;
use crate::interrupt::Interrupt;
use crate::key::{Key, TableIndex};
use crate::memory::Memory;
use crate::object::{Entry, EntryArena, Object, Queue};
use crate::sched::Scheduler;
use crate::sender::{ReplySender, Sender};

/// The keys exchanged with a message, in message key order.
pub type Keys = [Key; N_MESSAGE_KEYS];

/// Signature shared by the protocol handlers of kernel-implemented objects.
///
/// Handlers run after the message has been accepted, and return the reply
/// (or the failure to reply with). They never see the sender.
pub type Handler<'a> = fn(
    &mut Kernel<'a>,
    TableIndex,
    Brand,
    &Message,
    &Keys,
) -> Result<ReplySender, Failure>;

pub struct Kernel<'a> {
    pub(crate) objects: &'a mut [Entry],
    pub(crate) sched: Scheduler,
    /// Interrupt object routed to each IRQ line.
    pub(crate) irqs: [Option<TableIndex>; MAX_IRQS],
    pub(crate) sys_tick: Option<TableIndex>,
}

impl<'a> Kernel<'a> {
    /// Wraps an object table. The caller is responsible for populating it;
    /// see `startup::boot`.
    pub fn new(objects: &'a mut [Entry]) -> Self {
        Self {
            objects,
            sched: Scheduler::new(),
            irqs: [None; MAX_IRQS],
            sys_tick: None,
        }
    }

    pub fn objects(&self) -> &[Entry] {
        self.objects
    }

    pub fn object(&self, index: TableIndex) -> &Object {
        &self.objects[index as usize].object
    }

    pub(crate) fn object_mut(&mut self, index: TableIndex) -> &mut Object {
        &mut self.objects[index as usize].object
    }

    pub fn table_len(&self) -> u32 {
        self.objects.len() as u32
    }

    /// Follows a key to its object. Keys that are stale (or otherwise don't
    /// match a live entry) resolve to the Null object with a zero brand.
    pub fn resolve(&self, key: Key) -> (TableIndex, Brand) {
        match self.objects.get(key.index as usize) {
            Some(e) if e.generation == key.generation => (key.index, key.brand),
            _ => (abi::well_known::NULL, 0),
        }
    }

    /// Asks the object at `index` for a key bearing `brand`. Returns `None` if
    /// the object refuses the brand.
    pub fn make_key(&self, index: TableIndex, brand: Brand) -> Option<Key> {
        let entry = &self.objects[index as usize];
        let brand = match &entry.object {
            Object::Memory(m) => {
                if !m.admits(brand) {
                    return None;
                }
                brand
            }
            // Reply keys always carry the brand the gate will accept next.
            Object::ReplyGate(r) => r.expected_brand,
            _ => brand,
        };
        Some(Key {
            index,
            generation: entry.generation,
            brand,
        })
    }

    /// Invalidates all keys to the object at `index`.
    pub fn bump_generation(&mut self, index: TableIndex) {
        let e = &mut self.objects[index as usize];
        e.generation = e.generation.next();
    }

    /// MPU region for a key, or `None` if the key doesn't designate memory.
    pub fn region_for_key(&self, key: Key) -> Option<Region> {
        let (index, brand) = self.resolve(key);
        match self.object(index) {
            Object::Memory(_) => Some(Memory::region_for_brand(brand)),
            _ => None,
        }
    }

    pub fn context(&self, index: TableIndex) -> &Context {
        match self.object(index) {
            Object::Context(c) => c,
            other => panic!("entry {index} is {:?}, not a context", other.kind()),
        }
    }

    pub fn context_mut(&mut self, index: TableIndex) -> &mut Context {
        match self.object_mut(index) {
            Object::Context(c) => c,
            _ => panic!("entry {index} is not a context"),
        }
    }

    pub fn interrupt(&self, index: TableIndex) -> &Interrupt {
        match self.object(index) {
            Object::Interrupt(i) => i,
            _ => panic!("entry {index} is not an interrupt"),
        }
    }

    pub(crate) fn interrupt_mut(&mut self, index: TableIndex) -> &mut Interrupt {
        match self.object_mut(index) {
            Object::Interrupt(i) => i,
            _ => panic!("entry {index} is not an interrupt"),
        }
    }

    /// Delivers a message from `sender` to whatever `target` designates.
    pub fn deliver(&mut self, target: Key, sender: Sender) {
        let (index, brand) = self.resolve(target);
        self.deliver_from(index, brand, sender);
    }

    /// Delivers a message from `sender` to the object at `index`.
    pub fn deliver_from(
        &mut self,
        index: TableIndex,
        brand: Brand,
        sender: Sender,
    ) {
        let handler: Handler<'a> = match self.object(index) {
            Object::Null | Object::Slot => {
                self.fail_send(sender, Exception::BadOperation.into());
                return;
            }
            Object::Gate(_) => {
                self.gate_deliver_from(index, brand, sender);
                return;
            }
            Object::ReplyGate(_) => {
                self.reply_gate_deliver_from(index, brand, sender);
                return;
            }
            Object::ObjectTable => Self::object_table_call,
            Object::Memory(_) => Self::memory_call,
            Object::Context(_) => Self::context_call,
            Object::Interrupt(_) => Self::interrupt_call,
        };

        // Kernel-implemented objects never make the sender wait.
        let (message, keys) = self.accept_delivery(sender);
        let reply = handler(self, index, brand, &message, &keys)
            .unwrap_or_else(ReplySender::failure);
        self.send_reply(keys[0], reply);
    }

    /// Asks whatever `source` designates for a message on behalf of the
    /// Context `receiver`.
    pub fn deliver_to(&mut self, source: Key, receiver: TableIndex) {
        let (index, _) = self.resolve(source);
        match self.object(index) {
            Object::Gate(_) => self.gate_deliver_to(index, receiver),
            Object::ReplyGate(_) => {
                self.reply_gate_deliver_to(index, receiver)
            }
            _ => {
                self.fail_receive(receiver, Exception::BadOperation.into())
            }
        }
    }

    /// Sends a kernel-generated reply through `reply_key`. A Null reply key
    /// means nobody is listening, and the reply is dropped.
    pub fn send_reply(&mut self, reply_key: Key, reply: ReplySender) {
        let (index, brand) = self.resolve(reply_key);
        if index == abi::well_known::NULL {
            return;
        }
        self.deliver_from(index, brand, Sender::Reply(reply));
    }

    /// Runs `body` with the list named by `queue` and the object table.
    ///
    /// Gate lists live inside the gate's entry, so they're copied out while
    /// `body` runs (which needs the whole table) and written back after.
    fn with_queue<R>(
        &mut self,
        queue: Queue,
        body: impl FnOnce(&mut PriorityList<N_PRIORITIES>, &mut [Entry]) -> R,
    ) -> R {
        match queue {
            Queue::Runnable => body(&mut self.sched.runnable, &mut *self.objects),
            Queue::Senders(g) | Queue::Receivers(g) => {
                let gate = match self.object(g) {
                    Object::Gate(gate) => gate,
                    _ => panic!("queue {queue:?} names a non-gate"),
                };
                let mut list = *gate.list(queue);
                let r = body(&mut list, &mut *self.objects);
                if let Object::Gate(gate) = self.object_mut(g) {
                    *gate.list_mut(queue) = list;
                }
                r
            }
        }
    }

    /// Appends `node` to `queue` at its priority.
    pub(crate) fn enqueue(&mut self, node: TableIndex, queue: Queue) {
        let entry = &self.objects[node as usize];
        let Some(priority) = entry.queue_priority() else {
            panic!("entry {node} can't be queued");
        };
        self.with_queue(queue, |list, arena| {
            list.insert(&mut EntryArena(arena), node, priority.index())
        });
        if let Some(q) = self.objects[node as usize].queue_link_mut() {
            q.queue = Some(queue);
        }
    }

    /// Removes `node` from whatever list it's on, if any.
    pub(crate) fn dequeue(&mut self, node: TableIndex) {
        let Some(queue) =
            self.objects[node as usize].queue_link().and_then(|q| q.queue)
        else {
            return;
        };
        self.with_queue(queue, |list, arena| list.remove(&mut EntryArena(arena), node));
        if let Some(q) = self.objects[node as usize].queue_link_mut() {
            q.queue = None;
        }
    }

    /// Removes and returns the first node of `queue`.
    pub(crate) fn take_first(&mut self, queue: Queue) -> Option<TableIndex> {
        let node = self.with_queue(queue, |list, arena| list.take(&mut EntryArena(arena)))?;
        if let Some(q) = self.objects[node as usize].queue_link_mut() {
            q.queue = None;
        }
        Some(node)
    }

    /// Checks whether `node` is on any list.
    pub fn is_queued(&self, node: TableIndex) -> bool {
        self.objects[node as usize]
            .queue_link()
            .is_some_and(|q| q.queue.is_some())
    }
}
