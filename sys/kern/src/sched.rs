// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling.
//!
//! The scheduler is strict-priority with FIFO order inside each priority: the
//! Context at the head of the most important non-empty bucket of the run queue
//! is the one that runs. Operations that change who should run don't switch
//! directly; they call `pend_switch`, and the switch is applied once at the end
//! of the kernel entry by `do_deferred_switch` (or, from interrupt context, by
//! PendSV).
//!
//! Blocked Contexts are not on the run queue, so an application must provide a
//! Context that never blocks (an idle loop) at the least important priority.

use abi::N_PRIORITIES;
use kerncore::PriorityList;

use crate::arch;
use crate::key::TableIndex;
use crate::kernel::Kernel;

#[derive(Debug)]
pub struct Scheduler {
    pub(crate) runnable: PriorityList<N_PRIORITIES>,
    pub(crate) current: TableIndex,
    pub(crate) switch_pending: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            runnable: PriorityList::new(),
            current: abi::well_known::FIRST_CONTEXT,
            switch_pending: false,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel<'_> {
    /// Index of the Context that is executing (or was, when the kernel was
    /// entered).
    pub fn current(&self) -> TableIndex {
        self.sched.current
    }

    pub fn switch_pending(&self) -> bool {
        self.sched.switch_pending
    }

    /// Notes that the run queue changed in a way that may require a switch.
    pub fn pend_switch(&mut self) {
        self.sched.switch_pending = true;
    }

    /// If a switch is pending, selects the head of the run queue as the
    /// current Context, loads its memory map and tells the architecture code
    /// to resume it.
    pub fn do_deferred_switch(&mut self) {
        if !core::mem::take(&mut self.sched.switch_pending) {
            return;
        }

        let Some(next) = self.sched.runnable.peek() else {
            panic!("no runnable context");
        };
        self.sched.current = next;
        self.reload_mpu();
        arch::set_current_context(&mut self.context_mut(next).save);
    }

    /// Variant of `do_deferred_switch` for interrupt handlers, which can't
    /// switch on their own: requests PendSV instead.
    pub fn do_deferred_switch_from_irq(&mut self) {
        if self.sched.switch_pending {
            arch::pend_context_switch_from_isr();
        }
    }

    /// Loads the current Context's memory regions into the MPU.
    pub fn reload_mpu(&self) {
        let regions = self.regions_for(self.sched.current);
        arch::apply_memory_protection(&regions);
    }
}
