// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt objects.
//!
//! An Interrupt turns a hardware IRQ into a message. When the IRQ fires, the
//! kernel masks it and delivers `{selector 1, irq}` to the Interrupt's target
//! key, passing a key to the Interrupt itself in place of a reply key. The
//! receiver re-enables the IRQ through that key once it has dealt with the
//! cause.
//!
//! Delivery never blocks anyone: if the target is a Gate with no receiver, the
//! Interrupt waits on the Gate's sender list. A trigger that arrives while the
//! Interrupt is still waiting is dropped.
//!
//! The SysTick timer is an Interrupt whose line is the SysTick exception
//! rather than an NVIC input. "Masking" it clears TICKINT, and its key can
//! also read and write the timer's registers.

use abi::{selector, Brand, Exception, Message, Priority};

use crate::arch;
use crate::err::Failure;
use crate::key::{Key, TableIndex};
use crate::kernel::{Kernel, Keys};
use crate::object::QueueLink;
use crate::sender::{ReplySender, Sender};

/// Where an Interrupt's triggers come from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Line {
    /// An external IRQ, through the NVIC.
    Irq(u32),
    SysTick,
}

impl Line {
    /// Number reported in trigger messages.
    pub fn number(self) -> u32 {
        match self {
            Self::Irq(n) => n,
            Self::SysTick => abi::SYS_TICK_LINE,
        }
    }

    fn mask(self) {
        match self {
            Self::Irq(n) => arch::disable_irq(n),
            Self::SysTick => arch::disable_sys_tick(),
        }
    }

    fn unmask(self, also_clear_pending: bool) {
        match self {
            Self::Irq(n) => arch::enable_irq(n, also_clear_pending),
            Self::SysTick => arch::enable_sys_tick(also_clear_pending),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Interrupt {
    pub line: Line,
    pub target: Key,
    pub priority: Priority,
    pub saved_brand: Brand,
    pub queue_link: QueueLink,
}

impl Interrupt {
    pub fn new(line: Line, priority: Priority) -> Self {
        Self {
            line,
            target: Key::NULL,
            priority,
            saved_brand: 0,
            queue_link: QueueLink::UNLINKED,
        }
    }
}

impl Kernel<'_> {
    /// Routes `line` to the Interrupt at `index`. Returns `false` if the line
    /// is out of range or already routed.
    pub fn route(&mut self, line: Line, index: TableIndex) -> bool {
        let slot = match line {
            Line::Irq(n) => self.irqs.get_mut(n as usize),
            Line::SysTick => Some(&mut self.sys_tick),
        };
        match slot {
            Some(slot @ None) => {
                *slot = Some(index);
                true
            }
            _ => false,
        }
    }

    /// Handles a hardware IRQ.
    ///
    /// # Panics
    ///
    /// If no Interrupt is routed to `irq`. The IRQ couldn't have been
    /// enabled without one.
    pub fn trigger(&mut self, irq: u32) {
        let Some(index) = self.irqs.get(irq as usize).copied().flatten() else {
            panic!("unexpected IRQ {irq}");
        };
        self.fire(index);
    }

    /// Handles the SysTick exception.
    ///
    /// # Panics
    ///
    /// If the application has no SysTick object.
    pub fn trigger_sys_tick(&mut self) {
        let Some(index) = self.sys_tick else {
            panic!("unexpected SysTick");
        };
        self.fire(index);
    }

    fn fire(&mut self, index: TableIndex) {
        let line = self.interrupt(index).line;
        line.mask();
        if self.is_queued(index) {
            klog!("line {}: previous trigger still queued, dropped", line.number());
            return;
        }

        let target = self.interrupt(index).target;
        self.deliver(target, Sender::Interrupt(index));
        self.do_deferred_switch_from_irq();
    }

    /// Protocol of Interrupt objects, SysTick included.
    pub(crate) fn interrupt_call(
        &mut self,
        index: TableIndex,
        _brand: Brand,
        m: &Message,
        keys: &Keys,
    ) -> Result<ReplySender, Failure> {
        let line = self.interrupt(index).line;
        match (m.desc.selector(), line) {
            (selector::interrupt::SET_TARGET, _) => {
                self.interrupt_mut(index).target = keys[1];
                Ok(ReplySender::default())
            }
            (selector::interrupt::ENABLE, _) => {
                line.unmask(m.data[0] != 0);
                Ok(ReplySender::default())
            }
            (selector::sys_tick::READ_REGISTER, Line::SysTick) => {
                let Some(value) = arch::read_sys_tick(m.data[0]) else {
                    return Err(Failure::new(Exception::IndexOutOfRange, m.data[0]));
                };
                Ok(ReplySender::data([value, 0, 0, 0]))
            }
            (selector::sys_tick::WRITE_REGISTER, Line::SysTick) => {
                if !arch::write_sys_tick(m.data[0], m.data[1]) {
                    return Err(Failure::new(Exception::IndexOutOfRange, m.data[0]));
                }
                Ok(ReplySender::default())
            }
            (other, _) => Err(Failure::new(Exception::BadOperation, u32::from(other))),
        }
    }
}
