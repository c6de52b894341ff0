// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reply gates.
//!
//! Each Context is bound to one ReplyGate, through which it receives replies
//! to its calls. Keys to a ReplyGate are single-use: every key carries the
//! brand the gate expects next, and every accepted delivery advances that
//! brand, so a reply key that has been used once (or a copy of it) is refused
//! afterwards. Senders are never made to wait here.

use abi::{Brand, Exception};

use crate::context::State;
use crate::key::TableIndex;
use crate::kernel::Kernel;
use crate::object::Object;
use crate::sender::Sender;

#[derive(Copy, Clone, Debug, Default)]
pub struct ReplyGate {
    /// The Context that receives from this gate, once bound.
    pub owner: Option<TableIndex>,
    pub expected_brand: Brand,
}

impl ReplyGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Kernel<'_> {
    fn reply_gate(&self, index: TableIndex) -> &ReplyGate {
        match self.object(index) {
            Object::ReplyGate(r) => r,
            _ => panic!("entry {index} is not a reply gate"),
        }
    }

    fn reply_gate_mut(&mut self, index: TableIndex) -> &mut ReplyGate {
        match self.object_mut(index) {
            Object::ReplyGate(r) => r,
            _ => panic!("entry {index} is not a reply gate"),
        }
    }

    /// Binds an unbound ReplyGate to `owner`. Returns `false` (changing
    /// nothing) if `index` isn't an unbound ReplyGate.
    pub fn bind_reply_gate(&mut self, index: TableIndex, owner: TableIndex) -> bool {
        match self.object_mut(index) {
            Object::ReplyGate(r) if r.owner.is_none() => {
                r.owner = Some(owner);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn reply_gate_deliver_from(
        &mut self,
        index: TableIndex,
        brand: Brand,
        sender: Sender,
    ) {
        let rg = *self.reply_gate(index);
        let Some(owner) = rg.owner.filter(|_| brand == rg.expected_brand) else {
            self.fail_send(sender, Exception::BadOperation.into());
            return;
        };

        // Spend the key.
        let next = rg.expected_brand.wrapping_add(1);
        self.reply_gate_mut(index).expected_brand = next;
        if next == 0 {
            self.bump_generation(index);
        }

        if self.context(owner).state == State::AwaitingReply {
            let (message, keys) = self.sender_message(&sender);
            self.complete_blocked_receive(owner, brand, &message, keys);
            self.complete_send(sender);
        } else {
            // The owner gave up waiting (it was interrupted); the reply has
            // nowhere to go.
            self.accept_delivery(sender);
        }
    }

    pub(crate) fn reply_gate_deliver_to(&mut self, index: TableIndex, receiver: TableIndex) {
        if self.reply_gate(index).owner == Some(receiver) {
            self.block_in_reply(receiver);
        } else {
            self.fail_receive(receiver, Exception::BadOperation.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use abi::{Descriptor, Exception, Message, ObjectDesc};

    use super::*;
    use crate::sender::ReplySender;
    use crate::testutil::{self, Fixture};

    #[test]
    fn reply_keys_work_exactly_once() {
        let mut f = Fixture::boot(&[
            ObjectDesc::gate(),
            ObjectDesc::reply_gate(),
            ObjectDesc::context(Fixture::EXTRA + 1, 2),
        ]);
        let first = f.first;
        let server = Fixture::EXTRA + 2;
        let gate = f.mint(Fixture::EXTRA, 0);
        f.set_key(first, 8, gate);
        f.set_key(server, 8, gate);
        f.kernel.make_runnable(server);

        // The call waits on the gate until the server picks it up.
        f.syscall(Descriptor::call(3, 8), [0; 4]);
        assert_eq!(f.kernel.current(), server);
        f.syscall(
            Descriptor::zero()
                .with_receive_enabled(true)
                .with_block(true)
                .with_source(8),
            [0; 4],
        );
        assert_eq!(f.kernel.context(first).state, State::AwaitingReply);

        let reply = f.key(server, 0);
        let answer = ReplySender::new(Message::reply([11, 22, 33, 44]));
        f.kernel.send_reply(reply, answer);
        testutil::assert_runnable(&f.kernel, first);
        assert_eq!(f.message(first).data, [11, 22, 33, 44]);

        // A second use of the same key is refused.
        f.set_message(
            server,
            Descriptor::zero().with_send_enabled(true).with_target(0),
            [0; 4],
        );
        f.kernel.deliver(reply, Sender::Context(server));
        assert_eq!(
            f.message(server).exception(),
            Some(Exception::BadOperation),
            "spent reply key should be refused"
        );
        assert_eq!(f.message(first).data, [11, 22, 33, 44]);
    }

    #[test]
    fn receiving_from_someone_elses_reply_gate_fails() {
        let mut f = Fixture::boot(&[]);
        let first = f.first;
        let idle_rg = f.kernel.context(f.idle).reply_gate;
        let k = f.mint(idle_rg, 0);
        f.set_key(first, 8, k);
        f.syscall(
            Descriptor::zero()
                .with_receive_enabled(true)
                .with_block(true)
                .with_source(8),
            [0; 4],
        );
        assert_eq!(f.message(first).exception(), Some(Exception::BadOperation));
    }

    #[test]
    fn unbound_reply_gates_refuse_delivery() {
        let mut f = Fixture::boot(&[ObjectDesc::reply_gate()]);
        let k = f.mint(Fixture::EXTRA, 0);
        f.set_message(
            f.first,
            Descriptor::zero().with_send_enabled(true).with_target(8),
            [0; 4],
        );
        f.kernel.deliver(k, Sender::Context(f.first));
        assert_eq!(
            f.message(f.first).exception(),
            Some(Exception::BadOperation)
        );
    }

    #[test]
    fn late_replies_are_discarded() {
        let mut f = Fixture::boot(&[]);
        let first = f.first;
        let reply = f.kernel.reply_key(first);
        f.kernel.send_reply(reply, ReplySender::data([1, 0, 0, 0]));
        assert_ne!(
            f.message(first).data[0],
            1,
            "owner wasn't waiting, so nothing should land"
        );
        assert_ne!(
            f.kernel.reply_key(first),
            reply,
            "the key is spent all the same"
        );
    }

    #[test]
    fn brand_wrap_bumps_generation() {
        let mut f = Fixture::boot(&[]);
        let first = f.first;
        let rg = abi::well_known::FIRST_REPLY_GATE;
        f.kernel.reply_gate_mut(rg).expected_brand = u64::MAX;
        let old = f.kernel.reply_key(first);
        let before = f.kernel.objects()[rg as usize].generation;
        f.kernel.send_reply(old, ReplySender::default());
        assert_eq!(f.kernel.reply_gate(rg).expected_brand, 0);
        assert_eq!(
            f.kernel.objects()[rg as usize].generation,
            before.next()
        );
    }
}
