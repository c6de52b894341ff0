// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! Exactly one of the nested modules below is built, and its contents are
//! re-exported here, so the rest of the kernel names `arch::whatever` without
//! caring which machine it's on.
//!
//! Each of them provides:
//!
//! - the `klog!` and `uassert!` macros,
//! - `SavedState`, implementing `context::ArchState`,
//! - `apply_memory_protection`, `set_current_context`,
//! - `uload`/`ustore` (unprivileged word access through the MPU) and
//!   `read_word`/`write_word` (privileged word access), all of which turn
//!   access faults into `err::Fault`,
//! - `enable_irq`, `disable_irq` and `pend_context_switch_from_isr`,
//! - `enable_sys_tick`, `disable_sys_tick`, `read_sys_tick` and
//!   `write_sys_tick`.
//!
//! `arm_m` adds the exception handlers and the `init`/`start_first_context`
//! pair used by `startup::start_kernel`. Everywhere else we build `fake`, a
//! simulation of the parts of the machine the kernel touches, so the portable
//! code can be tested on the host.

cfg_if::cfg_if! {
    if #[cfg(not(any(target_pointer_width = "32", target_pointer_width = "64")))] {
        compile_error!("unsupported pointer width");
    } else if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
