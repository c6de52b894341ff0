// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Senders: the parties that deliver messages to objects.
//!
//! A message can come from three places. A Context performing a send (or
//! call) can block until the message is taken. An Interrupt that fired can
//! also wait on a Gate, but never blocks anything while it does. And a
//! kernel object replying to a call produces a `ReplySender`, which holds its
//! message by value and can never wait at all.
//!
//! Every delivery follows the same contract. The object first reads the
//! message (`sender_message`), then either completes the send
//! (`complete_send`), refuses it (`fail_send`), or asks the sender to wait
//! (`block_in_send`). A sender that waited is later released with
//! `complete_blocked_send`.

use abi::{Brand, Message, N_MESSAGE_KEYS};

use crate::context::{ArchState, State};
use crate::err::Failure;
use crate::key::{Key, TableIndex};
use crate::kernel::{Kernel, Keys};
use crate::object::{Object, Queue};

#[derive(Copy, Clone, Debug)]
pub enum Sender {
    Context(TableIndex),
    Interrupt(TableIndex),
    Reply(ReplySender),
}

/// A message produced by the kernel on behalf of an object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReplySender {
    pub message: Message,
    pub keys: Keys,
}

impl Default for ReplySender {
    fn default() -> Self {
        Self::new(Message::default())
    }
}

impl ReplySender {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            keys: [Key::NULL; N_MESSAGE_KEYS],
        }
    }

    /// A successful reply carrying `data`.
    pub fn data(data: [u32; abi::N_MESSAGE_DATA]) -> Self {
        Self::new(Message::reply(data))
    }

    pub fn failure(f: Failure) -> Self {
        Self::new(f.message())
    }

    pub fn with_key(mut self, index: usize, key: Key) -> Self {
        self.keys[index] = key;
        self
    }
}

impl Kernel<'_> {
    /// Reads the message `sender` is offering, without consuming it.
    pub fn sender_message(&self, sender: &Sender) -> (Message, Keys) {
        match sender {
            Sender::Context(i) => {
                let ctx = self.context(*i);
                let message = ctx.save.message();
                let mut keys = [Key::NULL; N_MESSAGE_KEYS];
                if message.desc.is_call() {
                    keys[0] = self.reply_key(*i);
                }
                keys[1..].copy_from_slice(&ctx.keys[1..N_MESSAGE_KEYS]);
                (message, keys)
            }
            Sender::Interrupt(i) => {
                let line = self.interrupt(*i).line.number();
                let message = Message::new(
                    abi::Descriptor::zero()
                        .with_selector(abi::selector::interrupt::TRIGGERED),
                    [line, 0, 0, 0],
                );
                // The "reply key" lets the receiver re-enable the interrupt.
                let mut keys = [Key::NULL; N_MESSAGE_KEYS];
                keys[0] = self.make_key(*i, 0).unwrap_or(Key::NULL);
                (message, keys)
            }
            Sender::Reply(r) => (r.message, r.keys),
        }
    }

    /// Finishes a successful send. A Context that asked to receive after
    /// sending moves on to its receive phase.
    pub fn complete_send(&mut self, sender: Sender) {
        let Sender::Context(i) = sender else {
            return;
        };
        let ctx = self.context(i);
        let desc = ctx.save.descriptor();
        if desc.receive_enabled() {
            let source = if desc.is_call() {
                self.reply_key(i)
            } else {
                ctx.keys[desc.source()]
            };
            self.deliver_to(source, i);
        }
    }

    /// Reads the message from `sender` and completes the send.
    pub fn accept_delivery(&mut self, sender: Sender) -> (Message, Keys) {
        let r = self.sender_message(&sender);
        self.complete_send(sender);
        r
    }

    /// Refuses a send.
    pub fn fail_send(&mut self, sender: Sender, f: Failure) {
        match sender {
            Sender::Context(i) => {
                let ctx = self.context(i);
                if ctx.save.descriptor().is_call() {
                    // A reply key may have been handed out during the send
                    // phase. It must not be usable now that the call is off.
                    let rg = ctx.reply_gate;
                    self.bump_generation(rg);
                }
                self.put_failure(i, f);
            }
            Sender::Interrupt(i) => {
                klog!(
                    "line {}: delivery refused ({:?})",
                    self.interrupt(i).line.number(),
                    f.exception
                );
            }
            Sender::Reply(_) => (),
        }
    }

    /// Asks `sender` to wait on the sender list of `gate`.
    pub fn block_in_send(&mut self, sender: Sender, brand: Brand, gate: TableIndex) {
        match sender {
            Sender::Context(i) => {
                if !self.context(i).save.descriptor().block() {
                    self.fail_send(sender, abi::Exception::WouldBlock.into());
                    return;
                }
                self.dequeue(i);
                let ctx = self.context_mut(i);
                ctx.saved_brand = brand;
                ctx.state = State::Sending;
                self.enqueue(i, Queue::Senders(gate));
                self.pend_switch();
            }
            Sender::Interrupt(i) => {
                self.interrupt_mut(i).saved_brand = brand;
                self.enqueue(i, Queue::Senders(gate));
            }
            // Replies never wait; if nobody is listening they're lost.
            Sender::Reply(_) => (),
        }
    }

    /// The sender at `node`, which must be blocked on a sender list.
    pub(crate) fn blocked_sender(&self, node: TableIndex) -> (Sender, Brand) {
        match self.object(node) {
            Object::Context(c) => (Sender::Context(node), c.saved_brand),
            Object::Interrupt(i) => (Sender::Interrupt(node), i.saved_brand),
            _ => panic!("entry {node} can't be a blocked sender"),
        }
    }

    /// Releases a sender whose message was taken while it was blocked. The
    /// sender must already be off its list.
    pub fn complete_blocked_send(&mut self, node: TableIndex) {
        let (sender, _) = self.blocked_sender(node);
        if let Sender::Context(i) = sender {
            self.wake(i);
            self.complete_send(sender);
        }
    }

    /// Aborts the send of a blocked Context.
    pub(crate) fn fail_blocked_send(&mut self, ctx: TableIndex, f: Failure) {
        self.wake(ctx);
        self.fail_send(Sender::Context(ctx), f);
    }

    /// A key to the ReplyGate bound to Context `ctx`, good for one reply.
    pub fn reply_key(&self, ctx: TableIndex) -> Key {
        let rg = self.context(ctx).reply_gate;
        match self.object(rg) {
            Object::ReplyGate(_) => self.make_key(rg, 0).unwrap_or(Key::NULL),
            _ => Key::NULL,
        }
    }
}
