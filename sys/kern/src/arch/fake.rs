// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated machine for running the kernel on a development host.
//!
//! This models just enough of an ARMv7-M part for the portable kernel code to
//! run unmodified under `cargo test`: a sparse physical memory, the MPU
//! (checked with the same rules the hardware applies), NVIC enable/pending
//! bits, the SysTick register bank, and the PendSV flag. All of it is
//! thread-local, so each test gets its own machine.
//!
//! Tests can also mark addresses as raising a bus error on write, which is
//! how a store to an absent or misbehaving device shows up on hardware: the
//! MPU lets it through and the fault arrives afterwards.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use abi::{MAX_IRQS, N_TASK_REGIONS};
use byteorder::{ByteOrder, LittleEndian};
use kerncore::mpu::{self, Region};

use crate::err::Fault;

macro_rules! klog {
    ($s:expr) => {
        println!($s)
    };
    ($s:expr, $($tt:tt)*) => {
        println!($s, $($tt)*)
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

const PAGE_SIZE: u32 = 4096;

#[derive(Default)]
struct Machine {
    pages: BTreeMap<u32, Box<[u8; PAGE_SIZE as usize]>>,
    regions: [Option<Region>; N_TASK_REGIONS],
    irq_enabled: u128,
    irq_pending: u128,
    sys_tick: [u32; 4],
    sys_tick_pending: bool,
    bus_errors: BTreeSet<u32>,
    pendsv: bool,
    current: usize,
}

impl Machine {
    fn read(&self, addr: u32) -> u32 {
        let page = addr & !(PAGE_SIZE - 1);
        let offset = (addr - page) as usize;
        match self.pages.get(&page) {
            Some(p) => LittleEndian::read_u32(&p[offset..offset + 4]),
            None => 0,
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        let page = addr & !(PAGE_SIZE - 1);
        let offset = (addr - page) as usize;
        let p = self
            .pages
            .entry(page)
            .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
        LittleEndian::write_u32(&mut p[offset..offset + 4], value);
    }
}

thread_local! {
    static MACHINE: RefCell<Machine> = RefCell::new(Machine::default());
}

fn with_machine<R>(body: impl FnOnce(&mut Machine) -> R) -> R {
    MACHINE.with(|m| body(&mut m.borrow_mut()))
}

/// Saved state of a context between kernel entries.
#[derive(Debug, Default)]
pub struct SavedState {
    regs: [u32; 8],
    psp: u32,
}

impl crate::context::ArchState for SavedState {
    fn stack_pointer(&self) -> u32 {
        self.psp
    }

    fn set_stack_pointer(&mut self, sp: u32) {
        self.psp = sp;
    }

    fn callee_saved(&self) -> &[u32; 8] {
        &self.regs
    }

    fn callee_saved_mut(&mut self) -> &mut [u32; 8] {
        &mut self.regs
    }
}

pub fn apply_memory_protection(regions: &[Option<Region>; N_TASK_REGIONS]) {
    with_machine(|m| m.regions = *regions);
}

pub fn set_current_context(save: &mut SavedState) {
    let p = save as *mut SavedState as usize;
    with_machine(|m| m.current = p);
}

fn checked_access(addr: u32, write: bool, privileged: bool) -> Result<(), Fault> {
    if addr & 3 != 0 {
        return Err(Fault);
    }
    with_machine(|m| {
        if mpu::check_access(&m.regions, addr, write, privileged) {
            Ok(())
        } else {
            Err(Fault)
        }
    })
}

pub fn uload(addr: u32) -> Result<u32, Fault> {
    checked_access(addr, false, false)?;
    Ok(with_machine(|m| m.read(addr)))
}

fn bus_write(addr: u32, value: u32) -> Result<(), Fault> {
    with_machine(|m| {
        if m.bus_errors.contains(&addr) {
            return Err(Fault);
        }
        m.write(addr, value);
        Ok(())
    })
}

pub fn ustore(addr: u32, value: u32) -> Result<(), Fault> {
    checked_access(addr, true, false)?;
    bus_write(addr, value)
}

pub fn read_word(addr: u32) -> Result<u32, Fault> {
    checked_access(addr, false, true)?;
    Ok(with_machine(|m| m.read(addr)))
}

pub fn write_word(addr: u32, value: u32) -> Result<(), Fault> {
    checked_access(addr, true, true)?;
    bus_write(addr, value)
}

pub fn enable_irq(n: u32, also_clear_pending: bool) {
    uassert!((n as usize) < MAX_IRQS);
    with_machine(|m| {
        if also_clear_pending {
            m.irq_pending &= !(1u128 << n);
        }
        m.irq_enabled |= 1u128 << n;
    });
}

pub fn disable_irq(n: u32) {
    uassert!((n as usize) < MAX_IRQS);
    with_machine(|m| m.irq_enabled &= !(1u128 << n));
}

const TICKINT: u32 = 1 << 1;

pub fn disable_sys_tick() {
    with_machine(|m| m.sys_tick[0] &= !TICKINT);
}

pub fn enable_sys_tick(also_clear_pending: bool) {
    with_machine(|m| {
        if also_clear_pending {
            m.sys_tick_pending = false;
        }
        m.sys_tick[0] |= TICKINT;
    });
}

pub fn read_sys_tick(n: u32) -> Option<u32> {
    with_machine(|m| m.sys_tick.get(n as usize).copied())
}

pub fn write_sys_tick(n: u32, value: u32) -> bool {
    with_machine(|m| match n {
        // CALIB is read-only.
        3 => true,
        0..=2 => {
            m.sys_tick[n as usize] = value;
            true
        }
        _ => false,
    })
}

pub fn pend_context_switch_from_isr() {
    with_machine(|m| m.pendsv = true);
}

// Inspection and stimulus hooks for tests.

/// Writes a word without any protection checks.
pub fn poke_phys(addr: u32, value: u32) {
    with_machine(|m| m.write(addr, value));
}

/// Reads a word without any protection checks.
pub fn peek_phys(addr: u32) -> u32 {
    with_machine(|m| m.read(addr))
}

pub fn loaded_regions() -> [Option<Region>; N_TASK_REGIONS] {
    with_machine(|m| m.regions)
}

pub fn irq_enabled(n: u32) -> bool {
    with_machine(|m| m.irq_enabled & (1u128 << n) != 0)
}

pub fn irq_pending(n: u32) -> bool {
    with_machine(|m| m.irq_pending & (1u128 << n) != 0)
}

pub fn set_irq_pending(n: u32) {
    with_machine(|m| m.irq_pending |= 1u128 << n);
}

pub fn sys_tick_interrupt_enabled() -> bool {
    with_machine(|m| m.sys_tick[0] & TICKINT != 0)
}

pub fn sys_tick_pending() -> bool {
    with_machine(|m| m.sys_tick_pending)
}

pub fn set_sys_tick_pending() {
    with_machine(|m| m.sys_tick_pending = true);
}

/// Sets the read-only SysTick calibration value.
pub fn set_sys_tick_calibration(value: u32) {
    with_machine(|m| m.sys_tick[3] = value);
}

/// Makes writes to `addr` fail with a bus error once they've passed the MPU.
pub fn inject_bus_error(addr: u32) {
    with_machine(|m| m.bus_errors.insert(addr));
}

/// Reads and clears the simulated PendSV request.
pub fn take_pendsv() -> bool {
    with_machine(|m| core::mem::take(&mut m.pendsv))
}

/// Address of the saved state most recently passed to
/// `set_current_context`.
pub fn current_context_ptr() -> usize {
    with_machine(|m| m.current)
}

/// Puts the simulated machine back in its power-on state.
pub fn reset() {
    with_machine(|m| *m = Machine::default());
}
