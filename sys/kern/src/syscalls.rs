// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! The architecture's supervisor-call entry sequence stores the caller's
//! callee-saved registers (which hold the message: descriptor in r4, data in
//! r5-r8) into its `SavedState`, then calls `syscall_entry`. Everything the
//! caller asked for is encoded in the descriptor, including the syscall
//! number in its top four bits.
//!
//! There are two syscalls:
//!
//! - IPC (0) sends through the key register named by the descriptor's target
//!   field, then, if asked, receives from the one named by its source field.
//!   Either phase may be absent. A call (receive from key register 0) receives
//!   the reply through the caller's ReplyGate.
//! - Copy Key (1) copies a key register.
//!
//! Anything else gets a `bad_syscall` failure.

use abi::{Exception, Sysnum};

use crate::context::ArchState;
use crate::err::Failure;
use crate::kernel::Kernel;
use crate::sender::Sender;

impl Kernel<'_> {
    /// Performs the syscall described by the current Context's saved
    /// registers, then switches Contexts if the syscall made that necessary.
    pub fn syscall(&mut self) {
        let caller = self.current();
        let desc = self.context(caller).save.descriptor();

        match Sysnum::try_from(desc.sysnum()) {
            Ok(Sysnum::Ipc) => {
                if desc.send_enabled() {
                    let target = self.context(caller).keys[desc.target()];
                    self.deliver(target, Sender::Context(caller));
                } else if desc.receive_enabled() {
                    let source = self.context(caller).keys[desc.source()];
                    self.deliver_to(source, caller);
                } else {
                    // Nothing to do; the registers are returned as they were.
                }
            }
            Ok(Sysnum::CopyKey) => {
                let keys = &mut self.context_mut(caller).keys;
                keys[desc.target()] = keys[desc.source()];
            }
            Err(()) => {
                // Unlike refused IPC, this leaves the key registers alone.
                let f = Failure::new(Exception::BadSyscall, desc.sysnum());
                self.context_mut(caller).save.put_message(0, &f.message());
            }
        }

        self.do_deferred_switch();
    }
}

/// Entry point accessed by arch-specific syscall entry sequence.
///
/// Before calling this, the current Context's callee-saved registers must be
/// stored into its `SavedState`.
#[cfg(target_arch = "arm")]
#[no_mangle]
pub extern "C" fn syscall_entry() {
    crate::startup::with_kernel(|k| k.syscall());
}
