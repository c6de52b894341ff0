// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gates: rendezvous points between senders and receivers.
//!
//! A Gate has no protocol of its own. Messages sent to it are handed to the
//! most important waiting receiver; if nobody is waiting, the sender waits
//! instead. Receivers are treated symmetrically. The brand of the key a
//! message was sent through is passed to the receiver, which lets a server
//! hand out differently-branded keys to tell its clients apart.

use abi::{Brand, N_PRIORITIES};
use kerncore::PriorityList;

use crate::key::TableIndex;
use crate::kernel::Kernel;
use crate::object::Queue;
use crate::sender::Sender;

#[derive(Copy, Clone, Debug, Default)]
pub struct Gate {
    senders: PriorityList<N_PRIORITIES>,
    receivers: PriorityList<N_PRIORITIES>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn list(&self, q: Queue) -> &PriorityList<N_PRIORITIES> {
        match q {
            Queue::Senders(_) => &self.senders,
            Queue::Receivers(_) => &self.receivers,
            Queue::Runnable => panic!("run queue isn't a gate list"),
        }
    }

    pub(crate) fn list_mut(
        &mut self,
        q: Queue,
    ) -> &mut PriorityList<N_PRIORITIES> {
        match q {
            Queue::Senders(_) => &mut self.senders,
            Queue::Receivers(_) => &mut self.receivers,
            Queue::Runnable => panic!("run queue isn't a gate list"),
        }
    }
}

impl Kernel<'_> {
    pub(crate) fn gate_deliver_from(
        &mut self,
        gate: TableIndex,
        brand: Brand,
        sender: Sender,
    ) {
        match self.take_first(Queue::Receivers(gate)) {
            Some(receiver) => {
                let (message, keys) = self.sender_message(&sender);
                self.complete_blocked_receive(receiver, brand, &message, keys);
                self.complete_send(sender);
            }
            None => self.block_in_send(sender, brand, gate),
        }
    }

    pub(crate) fn gate_deliver_to(&mut self, gate: TableIndex, receiver: TableIndex) {
        match self.take_first(Queue::Senders(gate)) {
            Some(node) => {
                let (sender, brand) = self.blocked_sender(node);
                let (message, keys) = self.sender_message(&sender);
                self.complete_receive(receiver, brand, &message, keys);
                self.complete_blocked_send(node);
            }
            None => self.block_in_receive(receiver, gate),
        }
    }
}
