// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability microkernel.
//!
//! This is the privileged part of the system. It multiplexes the CPU among
//! unprivileged Contexts, and mediates everything they do through keys:
//! unforgeable references to kernel objects held in each Context's key
//! registers. There is no ambient authority. A Context can only send messages
//! through keys it holds, and can only touch memory its region registers hold
//! keys to.
//!
//! Code outside the `arch` module is portable and runs on the host under
//! `cargo test`, against a simulated machine.
//!
//! # Design principles
//!
//! 1. Static configuration. The object table is sized and populated at boot
//!    from a description the application provides; the only way to make new
//!    objects later is to retype Memory that already exists.
//! 2. Synchronous IPC. Messages are copied directly from sender to receiver
//!    at rendezvous; the kernel never buffers them.
//! 3. A strong preference for safe code where reasonable.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod context;
pub mod err;
pub mod fail;
pub mod gate;
pub mod interrupt;
pub mod kernel;
pub mod key;
pub mod memory;
pub mod object;
pub mod object_table;
pub mod reply_gate;
pub mod sched;
pub mod sender;
pub mod startup;
pub mod syscalls;

#[cfg(test)]
mod testutil;

// Objects that Memory can become must fit in the smallest Memory that can
// become them.
static_assertions::const_assert!(
    core::mem::size_of::<context::Context>() <= abi::CONTEXT_SIZE
);
static_assertions::const_assert!(
    core::mem::size_of::<gate::Gate>() <= abi::GATE_SIZE
);
static_assertions::const_assert!(
    core::mem::size_of::<reply_gate::ReplyGate>() <= abi::REPLY_GATE_SIZE
);
static_assertions::const_assert!(
    core::mem::size_of::<interrupt::Interrupt>() <= abi::INTERRUPT_SIZE
);
