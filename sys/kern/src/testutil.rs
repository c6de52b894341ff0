// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixture: boots a kernel on the simulated machine.
//!
//! Every fixture has the same well-known layout in front of the objects a
//! test asks for:
//!
//! | Index | Object |
//! |-------|--------|
//! | 0-3   | well-known (Null, ObjectTable, first Context, its ReplyGate) |
//! | 4     | 4 KiB of RAM at `RAM_BASE`, granted to the first Context |
//! | 5     | ReplyGate of the idle Context |
//! | 6     | idle Context, runnable at `IDLE_PRIORITY` |
//! | 7..   | the test's objects, starting at `EXTRA` |
//!
//! The first Context runs at priority 1 with its stack at the top of the RAM
//! object, holds the Object Table key in key register 4, and a key to the
//! whole RAM object in key register 6.

use abi::{
    well_known, AppHeader, Brand, Descriptor, MemoryAttributes, Message,
    ObjectDesc, RegionGrant, CURRENT_APP_MAGIC, INITIAL_GRANTS,
};
use kerncore::mpu::{Rasr, Region};
use kerncore::P2Range;

use crate::arch;
use crate::context::{ArchState, State};
use crate::key::{Key, TableIndex};
use crate::kernel::Kernel;
use crate::object::{Entry, Queue};
use crate::startup;

pub struct Fixture {
    pub kernel: Kernel<'static>,
    pub first: TableIndex,
    pub idle: TableIndex,
}

impl Fixture {
    pub const RAM_BASE: u32 = 0x2000_0000;
    const RAM: TableIndex = 4;
    const RAM_L2_HALF: u32 = 11;
    pub const ENTRY: u32 = 0x0800_0101;
    pub const IDLE_PRIORITY: u8 = 7;
    const IDLE_REPLY_GATE: TableIndex = 5;
    const IDLE: TableIndex = 6;
    /// Index of the first object passed to `boot`.
    pub const EXTRA: TableIndex = 7;

    /// Brand of the first Context's RAM grant: read/write at both privilege
    /// levels, no execution.
    pub fn ram_brand() -> Brand {
        let mut rasr = Rasr::from_bits(0);
        rasr.set_ap(0b011);
        rasr.set_xn(true);
        let range = P2Range::of(Self::RAM_BASE, Self::RAM_L2_HALF);
        range.map_or(0, |r| Region::for_range(r, rasr).brand())
    }

    pub fn boot(extra: &[ObjectDesc]) -> Self {
        arch::reset();

        let mut descs = vec![
            ObjectDesc::memory(
                Self::RAM_BASE,
                Self::RAM_L2_HALF,
                MemoryAttributes::empty(),
            ),
            ObjectDesc::reply_gate(),
            ObjectDesc::context(Self::IDLE_REPLY_GATE, Self::IDLE_PRIORITY),
        ];
        descs.extend_from_slice(extra);

        let mut grants = [RegionGrant::NONE; INITIAL_GRANTS];
        let brand = Self::ram_brand();
        grants[0] = RegionGrant {
            memory_index: Self::RAM,
            brand_lo: brand as u32,
            brand_hi: (brand >> 32) as u32,
        };
        let count = well_known::COUNT + descs.len() as u32;
        let header = AppHeader {
            magic: CURRENT_APP_MAGIC,
            object_count: count,
            initial_stack: Self::RAM_BASE + 0x1000,
            initial_pc: Self::ENTRY,
            initial_priority: 1,
            initial_grants: grants,
        };

        let objects: Vec<Entry> = (0..count).map(|_| Entry::EMPTY).collect();
        let objects = Vec::leak(objects);
        let mut kernel = startup::boot(objects, &header, descs);

        kernel.make_runnable(Self::IDLE);
        kernel.do_deferred_switch();

        let mut f = Self {
            kernel,
            first: well_known::FIRST_CONTEXT,
            idle: Self::IDLE,
        };
        let ram = f.mint(Self::RAM, brand);
        f.set_key(f.first, 6, ram);
        f
    }

    pub fn mint(&self, index: TableIndex, brand: Brand) -> Key {
        self.kernel.make_key(index, brand).unwrap()
    }

    pub fn set_key(&mut self, ctx: TableIndex, reg: usize, key: Key) {
        self.kernel.context_mut(ctx).keys[reg] = key;
    }

    pub fn key(&self, ctx: TableIndex, reg: usize) -> Key {
        self.kernel.context(ctx).keys[reg]
    }

    /// Loads a message into a context's registers as its own code would,
    /// without the sanitizing the kernel does on delivery.
    pub fn set_message(&mut self, ctx: TableIndex, desc: Descriptor, data: [u32; 4]) {
        let r = self.kernel.context_mut(ctx).save.callee_saved_mut();
        r[0] = desc.bits();
        r[1..5].copy_from_slice(&data);
    }

    pub fn message(&self, ctx: TableIndex) -> Message {
        self.kernel.context(ctx).save.message()
    }

    /// Brand delivered with the last message `ctx` received.
    pub fn brand(&self, ctx: TableIndex) -> Brand {
        let r = self.kernel.context(ctx).save.callee_saved();
        Brand::from(r[6]) << 32 | Brand::from(r[5])
    }

    /// Makes the current context trap with the given message.
    pub fn syscall(&mut self, desc: Descriptor, data: [u32; 4]) {
        let current = self.kernel.current();
        self.set_message(current, desc, data);
        self.kernel.syscall();
    }

    /// Has the current context call through key register `target` and
    /// returns what it received.
    pub fn call(&mut self, target: usize, selector: u16, data: [u32; 4]) -> Message {
        let caller = self.kernel.current();
        self.syscall(Descriptor::call(selector, target), data);
        self.message(caller)
    }
}

/// Checks that `ctx` is runnable and actually on the run queue.
pub fn assert_runnable(kernel: &Kernel<'_>, ctx: TableIndex) {
    let c = kernel.context(ctx);
    assert_eq!(c.state, State::Runnable, "context {ctx} state");
    assert_eq!(
        c.queue_link.queue,
        Some(Queue::Runnable),
        "context {ctx} should be on the run queue"
    );
}
