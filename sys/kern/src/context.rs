// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of contexts.
//!
//! A Context is an unprivileged thread of execution: saved registers, sixteen
//! key registers, six memory region registers (each holding a memory key), a
//! priority, and the ReplyGate through which it receives replies to its calls.
//!
//! Messages travel in the callee-saved registers, which the kernel saves on
//! entry anyway:
//!
//! | Register | Send            | Receive         |
//! |----------|-----------------|-----------------|
//! | r4       | descriptor      | descriptor      |
//! | r5-r8    | data words 0-3  | data words 0-3  |
//! | r9/r10   | -               | brand low/high  |
//!
//! and the exchanged keys are key registers 0-3.

use abi::{
    selector, Brand, Descriptor, Exception, Message, Priority, N_MESSAGE_KEYS,
    N_PRIORITIES, N_TASK_KEYS, N_TASK_REGIONS,
};
use kerncore::mpu::Region;

use crate::arch;
use crate::err::{Failure, Fault};
use crate::key::{Key, TableIndex};
use crate::kernel::{Kernel, Keys};
use crate::object::{Queue, QueueLink};
use crate::sender::ReplySender;

/// Architecture-specific saved state, as seen by the portable kernel.
pub trait ArchState: Default {
    fn stack_pointer(&self) -> u32;
    fn set_stack_pointer(&mut self, sp: u32);

    /// Registers r4 through r11.
    fn callee_saved(&self) -> &[u32; 8];
    fn callee_saved_mut(&mut self) -> &mut [u32; 8];

    /// Reads the message descriptor.
    fn descriptor(&self) -> Descriptor {
        Descriptor(self.callee_saved()[0])
    }

    /// Reads the outgoing message, descriptor included.
    fn message(&self) -> Message {
        let r = self.callee_saved();
        Message::new(Descriptor(r[0]), [r[1], r[2], r[3], r[4]])
    }

    /// Writes an incoming message and its brand. Only the selector and error
    /// bit of the descriptor survive.
    fn put_message(&mut self, brand: Brand, m: &Message) {
        let r = self.callee_saved_mut();
        r[0] = m.desc.sanitized().bits();
        r[1..5].copy_from_slice(&m.data);
        r[5] = brand as u32;
        r[6] = (brand >> 32) as u32;
    }
}

/// Scheduling state of a context.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum State {
    /// Not running and not waiting; only `make_runnable` gets it going.
    #[default]
    Stopped,
    /// On the run queue.
    Runnable,
    /// Waiting on a Gate's sender list.
    Sending,
    /// Waiting on a Gate's receiver list.
    Receiving,
    /// Receiving from its own ReplyGate, which has no list.
    AwaitingReply,
}

#[derive(Debug)]
pub struct Context {
    pub save: arch::SavedState,
    pub keys: [Key; N_TASK_KEYS],
    /// Memory keys loaded into the MPU while this context runs.
    pub regions: [Key; N_TASK_REGIONS],
    pub priority: Priority,
    pub state: State,
    /// Object table index of the bound ReplyGate.
    pub reply_gate: TableIndex,
    /// Brand of the key a blocked send was made through.
    pub saved_brand: Brand,
    pub queue_link: QueueLink,
}

impl Context {
    pub fn new(reply_gate: TableIndex, priority: Priority) -> Self {
        Self {
            save: arch::SavedState::default(),
            keys: [Key::NULL; N_TASK_KEYS],
            regions: [Key::NULL; N_TASK_REGIONS],
            priority,
            state: State::Stopped,
            reply_gate,
            saved_brand: 0,
            queue_link: QueueLink::UNLINKED,
        }
    }

    /// Index of a register within the exception frame the hardware stacks
    /// at the process stack pointer, for the registers that live there.
    fn stacked_slot(register: u32) -> Option<u32> {
        match register {
            0..=3 => Some(register),
            12 => Some(4),
            14 => Some(5), // lr
            15 => Some(6), // pc
            16 => Some(7), // xPSR
            _ => None,
        }
    }
}

/// Where a register number lives.
enum RegisterLocation {
    Stacked(u32),
    Saved(usize),
    StackPointer,
}

fn locate_register(register: u32) -> Result<RegisterLocation, Failure> {
    if let Some(slot) = Context::stacked_slot(register) {
        return Ok(RegisterLocation::Stacked(slot));
    }
    match register {
        4..=11 => Ok(RegisterLocation::Saved(register as usize - 4)),
        13 => Ok(RegisterLocation::StackPointer),
        _ => Err(Failure::new(Exception::IndexOutOfRange, register)),
    }
}

impl Kernel<'_> {
    /// Writes a message into a context's registers and key registers 0-3.
    pub fn complete_receive(
        &mut self,
        ctx: TableIndex,
        brand: Brand,
        message: &Message,
        keys: Keys,
    ) {
        let c = self.context_mut(ctx);
        c.save.put_message(brand, message);
        c.keys[..N_MESSAGE_KEYS].copy_from_slice(&keys);
    }

    /// Writes a failure into a context's registers and clears the exchanged
    /// key registers, so it can't mistake old keys for received ones.
    pub(crate) fn put_failure(&mut self, ctx: TableIndex, f: Failure) {
        self.complete_receive(
            ctx,
            0,
            &f.message(),
            [Key::NULL; N_MESSAGE_KEYS],
        );
    }

    pub fn fail_receive(&mut self, ctx: TableIndex, f: Failure) {
        self.put_failure(ctx, f);
    }

    /// Parks a receiving context on the receiver list of `gate`, or refuses
    /// if it didn't ask to block.
    pub fn block_in_receive(&mut self, ctx: TableIndex, gate: TableIndex) {
        if !self.context(ctx).save.descriptor().block() {
            self.fail_receive(ctx, Exception::WouldBlock.into());
            return;
        }
        self.dequeue(ctx);
        self.context_mut(ctx).state = State::Receiving;
        self.enqueue(ctx, Queue::Receivers(gate));
        self.pend_switch();
    }

    /// Parks a context until its ReplyGate receives a reply.
    pub fn block_in_reply(&mut self, ctx: TableIndex) {
        self.dequeue(ctx);
        self.context_mut(ctx).state = State::AwaitingReply;
        self.pend_switch();
    }

    /// Moves a context from wherever it is to the run queue.
    pub(crate) fn wake(&mut self, ctx: TableIndex) {
        self.dequeue(ctx);
        self.context_mut(ctx).state = State::Runnable;
        self.enqueue(ctx, Queue::Runnable);
        self.pend_switch();
    }

    /// Hands a message to a context that was blocked receiving, and makes it
    /// runnable.
    pub fn complete_blocked_receive(
        &mut self,
        ctx: TableIndex,
        brand: Brand,
        message: &Message,
        keys: Keys,
    ) {
        self.wake(ctx);
        self.complete_receive(ctx, brand, message, keys);
    }

    pub fn fail_blocked_receive(&mut self, ctx: TableIndex, f: Failure) {
        self.wake(ctx);
        self.fail_receive(ctx, f);
    }

    /// Starts a stopped context, or interrupts a blocked one: a pending send
    /// or receive is abandoned with `would_block`.
    pub fn make_runnable(&mut self, ctx: TableIndex) {
        match self.context(ctx).state {
            State::Sending => {
                self.fail_blocked_send(ctx, Exception::WouldBlock.into())
            }
            State::Receiving | State::AwaitingReply => {
                self.fail_blocked_receive(ctx, Exception::WouldBlock.into())
            }
            State::Stopped => self.wake(ctx),
            State::Runnable => (),
        }
    }

    /// Takes a context off whatever list it's on and stops it.
    pub fn stop(&mut self, ctx: TableIndex) {
        self.dequeue(ctx);
        self.context_mut(ctx).state = State::Stopped;
        self.pend_switch();
    }

    /// Handles a fault taken by the current context: it is stopped, and
    /// something else gets to run. Whoever holds a key to it can inspect the
    /// damage and restart it.
    pub fn fault_current(&mut self) {
        let ctx = self.current();
        klog!("context {} faulted; stopping it", ctx);
        self.stop(ctx);
        self.do_deferred_switch();
    }

    /// Decodes a context's region registers into MPU regions.
    pub fn regions_for(&self, ctx: TableIndex) -> [Option<Region>; N_TASK_REGIONS] {
        let keys = self.context(ctx).regions;
        keys.map(|k| self.region_for_key(k))
    }

    /// Changes a context's priority, moving it within its list if it's on
    /// one.
    fn set_priority(&mut self, ctx: TableIndex, priority: Priority) {
        let queue = self.context(ctx).queue_link.queue;
        self.dequeue(ctx);
        self.context_mut(ctx).priority = priority;
        if let Some(q) = queue {
            self.enqueue(ctx, q);
        }
        self.pend_switch();
    }

    /// Accesses a word of the frame stacked at `ctx`'s stack pointer, using
    /// `ctx`'s memory map and unprivileged access.
    fn with_stacked<R>(
        &mut self,
        ctx: TableIndex,
        slot: u32,
        body: impl FnOnce(u32) -> Result<R, Fault>,
    ) -> Result<R, Failure> {
        let addr = self
            .context(ctx)
            .save
            .stack_pointer()
            .wrapping_add(slot * 4);
        arch::apply_memory_protection(&self.regions_for(ctx));
        let r = body(addr);
        self.reload_mpu();
        Ok(r?)
    }

    fn read_register(&mut self, ctx: TableIndex, register: u32) -> Result<u32, Failure> {
        match locate_register(register)? {
            RegisterLocation::Stacked(slot) => {
                self.with_stacked(ctx, slot, arch::uload)
            }
            RegisterLocation::Saved(i) => {
                Ok(self.context(ctx).save.callee_saved()[i])
            }
            RegisterLocation::StackPointer => {
                Ok(self.context(ctx).save.stack_pointer())
            }
        }
    }

    fn write_register(
        &mut self,
        ctx: TableIndex,
        register: u32,
        value: u32,
    ) -> Result<(), Failure> {
        match locate_register(register)? {
            RegisterLocation::Stacked(slot) => {
                self.with_stacked(ctx, slot, |addr| arch::ustore(addr, value))
            }
            RegisterLocation::Saved(i) => {
                self.context_mut(ctx).save.callee_saved_mut()[i] = value;
                Ok(())
            }
            RegisterLocation::StackPointer => {
                self.context_mut(ctx).save.set_stack_pointer(value);
                Ok(())
            }
        }
    }

    /// Protocol of Context objects.
    pub(crate) fn context_call(
        &mut self,
        index: TableIndex,
        _brand: Brand,
        m: &Message,
        keys: &Keys,
    ) -> Result<ReplySender, Failure> {
        use selector::context::*;

        let d = m.data;
        let reply = ReplySender::default();
        match m.desc.selector() {
            READ_REGISTER => {
                let v = self.read_register(index, d[0])?;
                Ok(ReplySender::data([v, 0, 0, 0]))
            }
            WRITE_REGISTER => {
                self.write_register(index, d[0], d[1])?;
                Ok(reply)
            }
            READ_KEY_REGISTER => {
                let k = *self
                    .context(index)
                    .keys
                    .get(d[0] as usize)
                    .ok_or(Failure::new(Exception::IndexOutOfRange, d[0]))?;
                Ok(reply.with_key(1, k))
            }
            WRITE_KEY_REGISTER => {
                let slot = self
                    .context_mut(index)
                    .keys
                    .get_mut(d[0] as usize)
                    .ok_or(Failure::new(Exception::IndexOutOfRange, d[0]))?;
                *slot = keys[1];
                Ok(reply)
            }
            READ_REGION_REGISTER => {
                let k = *self
                    .context(index)
                    .regions
                    .get(d[0] as usize)
                    .ok_or(Failure::new(Exception::IndexOutOfRange, d[0]))?;
                Ok(reply.with_key(1, k))
            }
            WRITE_REGION_REGISTER => {
                let slot = self
                    .context_mut(index)
                    .regions
                    .get_mut(d[0] as usize)
                    .ok_or(Failure::new(Exception::IndexOutOfRange, d[0]))?;
                *slot = keys[1];
                if index == self.current() {
                    self.reload_mpu();
                }
                Ok(reply)
            }
            MAKE_RUNNABLE => {
                self.make_runnable(index);
                Ok(reply)
            }
            GET_PRIORITY => {
                let p = self.context(index).priority;
                Ok(ReplySender::data([u32::from(p.0), 0, 0, 0]))
            }
            SET_PRIORITY => {
                let p = Priority::from_word(d[0]).ok_or(Failure::new(
                    Exception::BadArgument,
                    N_PRIORITIES as u32,
                ))?;
                self.set_priority(index, p);
                Ok(reply)
            }
            READ_LOW_REGISTERS | READ_HIGH_REGISTERS => {
                let base = if m.desc.selector() == READ_LOW_REGISTERS {
                    0
                } else {
                    4
                };
                let r = self.context(index).save.callee_saved();
                let mut out = [0; 4];
                out.copy_from_slice(&r[base..base + 4]);
                Ok(ReplySender::data(out))
            }
            WRITE_LOW_REGISTERS | WRITE_HIGH_REGISTERS => {
                let base = if m.desc.selector() == WRITE_LOW_REGISTERS {
                    0
                } else {
                    4
                };
                self.context_mut(index).save.callee_saved_mut()[base..base + 4]
                    .copy_from_slice(&d);
                Ok(reply)
            }
            other => Err(Failure::new(Exception::BadOperation, u32::from(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use abi::{selector::context as sel, Descriptor, ObjectDesc};

    use super::*;
    use crate::testutil::{self, Fixture};

    /// Puts a key to the idle context in the first context's key register 5.
    fn with_idle_key(f: &mut Fixture) -> TableIndex {
        let idle = f.idle;
        let k = f.mint(idle, 0);
        f.set_key(f.first, 5, k);
        idle
    }

    #[test]
    fn saved_registers_round_trip_through_the_protocol() {
        let mut f = Fixture::boot(&[]);
        let idle = with_idle_key(&mut f);

        let r = f.call(5, sel::WRITE_REGISTER, [7, 0xDEAD_BEEF, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(f.kernel.context(idle).save.callee_saved()[3], 0xDEAD_BEEF);

        let r = f.call(5, sel::READ_REGISTER, [7, 0, 0, 0]);
        assert_eq!(r.data[0], 0xDEAD_BEEF);

        let r = f.call(5, sel::READ_HIGH_REGISTERS, [0; 4]);
        assert_eq!(r.data, [0, 0, 0, 0], "r8-r11 untouched");
        let r = f.call(5, sel::READ_LOW_REGISTERS, [0; 4]);
        assert_eq!(r.data[3], 0xDEAD_BEEF, "r7 is the last low register");
    }

    #[test]
    fn stacked_registers_use_the_targets_memory_map() {
        let mut f = Fixture::boot(&[]);
        let first = f.first;
        let k = f.mint(first, 0);
        f.set_key(first, 5, k);

        // The first context's boot frame has its PC in slot 6.
        let r = f.call(5, sel::READ_REGISTER, [15, 0, 0, 0]);
        assert_eq!(r.exception(), None, "{r:?}");
        assert_eq!(r.data[0], Fixture::ENTRY & !1);
        let r = f.call(5, sel::READ_REGISTER, [16, 0, 0, 0]);
        assert_eq!(r.data[0], 1 << 24, "thumb bit set in boot xPSR");
    }

    #[test]
    fn stacked_access_outside_the_map_faults() {
        let mut f = Fixture::boot(&[]);
        let idle = with_idle_key(&mut f);
        // The idle context has no regions at all.
        f.kernel.context_mut(idle).save.set_stack_pointer(Fixture::RAM_BASE);
        let r = f.call(5, sel::READ_REGISTER, [0, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::Fault));
        assert_eq!(
            crate::arch::loaded_regions(),
            f.kernel.regions_for(f.first),
            "caller's memory map should be restored"
        );
    }

    #[test]
    fn bad_register_numbers_are_out_of_range() {
        let mut f = Fixture::boot(&[]);
        with_idle_key(&mut f);
        for reg in [17, 100] {
            let r = f.call(5, sel::READ_REGISTER, [reg, 0, 0, 0]);
            assert_eq!(r.exception(), Some(Exception::IndexOutOfRange));
            assert_eq!(r.data[2], reg);
        }
        let r = f.call(5, sel::READ_KEY_REGISTER, [16, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::IndexOutOfRange));
        let r = f.call(5, sel::WRITE_REGION_REGISTER, [6, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::IndexOutOfRange));
    }

    #[test]
    fn key_registers_can_be_read_and_written() {
        let mut f = Fixture::boot(&[]);
        let idle = with_idle_key(&mut f);
        let table = f.mint(abi::well_known::OBJECT_TABLE, 99);
        f.set_key(f.first, 1, table);

        let r = f.call(5, sel::WRITE_KEY_REGISTER, [9, 0, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(f.kernel.context(idle).keys[9], table);

        f.set_key(f.first, 1, Key::NULL);
        let r = f.call(5, sel::READ_KEY_REGISTER, [9, 0, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(f.key(f.first, 1), table, "key arrives in key register 1");
    }

    #[test]
    fn writing_the_current_region_registers_reloads_the_mpu() {
        let mut f = Fixture::boot(&[]);
        let first = f.first;
        let k = f.mint(first, 0);
        f.set_key(first, 5, k);
        let ram = f.key(first, 6);
        assert_ne!(ram, Key::NULL, "fixture leaves a RAM key in register 6");
        f.set_key(first, 1, ram);

        let r = f.call(5, sel::WRITE_REGION_REGISTER, [5, 0, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(
            crate::arch::loaded_regions()[5],
            f.kernel.region_for_key(ram)
        );
    }

    #[test]
    fn priorities_are_validated_and_requeue() {
        let mut f = Fixture::boot(&[]);
        let idle = with_idle_key(&mut f);

        let r = f.call(5, sel::GET_PRIORITY, [0; 4]);
        assert_eq!(r.data[0], Fixture::IDLE_PRIORITY.into());

        let r = f.call(5, sel::SET_PRIORITY, [N_PRIORITIES as u32, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadArgument));

        let r = f.call(5, sel::SET_PRIORITY, [0, 0, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(f.kernel.context(idle).priority, Priority(0));
        assert_eq!(
            f.kernel.current(),
            idle,
            "idle context now outranks the caller and should be picked"
        );
    }

    #[test]
    fn make_runnable_interrupts_a_blocked_receive() {
        let mut f = Fixture::boot(&[ObjectDesc::gate()]);
        let first = f.first;
        let gate = f.mint(Fixture::EXTRA, 0);
        f.set_key(first, 8, gate);

        // Receive from an empty gate: blocks.
        f.syscall(
            Descriptor::zero()
                .with_receive_enabled(true)
                .with_block(true)
                .with_source(8),
            [0; 4],
        );
        assert_eq!(f.kernel.context(first).state, State::Receiving);
        assert_eq!(f.kernel.current(), f.idle);

        f.kernel.make_runnable(first);
        testutil::assert_runnable(&f.kernel, first);
        assert_eq!(f.message(first).exception(), Some(Exception::WouldBlock));
    }

    #[test]
    fn faulting_context_is_stopped() {
        let mut f = Fixture::boot(&[]);
        let first = f.first;
        f.kernel.fault_current();
        assert_eq!(f.kernel.context(first).state, State::Stopped);
        assert!(!f.kernel.is_queued(first));
        assert_eq!(f.kernel.current(), f.idle);

        f.kernel.make_runnable(first);
        f.kernel.do_deferred_switch();
        assert_eq!(f.kernel.current(), first, "restart brings it back");
    }

    #[test]
    fn unknown_selectors_are_bad_operations() {
        let mut f = Fixture::boot(&[]);
        with_idle_key(&mut f);
        let r = f.call(5, 13, [0; 4]);
        assert_eq!(r.exception(), Some(Exception::BadOperation));
        assert_eq!(r.data[2], 13);
    }
}
