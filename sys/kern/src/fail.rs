// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-mortem record of a kernel panic, left where a debugger can find it.
//!
//! Two symbols make up the interface:
//!
//! - `KERNEL_HAS_FAILED` (`bool`) is false from reset until the kernel dies,
//!   whether from an explicit `die`, a `panic!`, or a failed `uassert!`.
//! - `KERNEL_EPITAPH` (`[u8; 128]`) holds the panic message as UTF-8,
//!   truncated to fit and padded with NULs. It isn't written when the `nano`
//!   feature is on, to keep formatting code out of flash.
//!
//! On the host, panics are left to the standard library so that tests can
//! observe them.

use core::fmt::{Display, Write};
use core::sync::atomic::{compiler_fence, Ordering};

#[used]
#[no_mangle]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
#[no_mangle]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Writer that fills a byte buffer and silently drops whatever doesn't fit.
struct Epitaph<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for Epitaph<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Sets `KERNEL_HAS_FAILED`, returning whether this is the first failure.
fn mark_failed() -> bool {
    // Safety: the kernel is single-core and not reentrant, and a second
    // failure while the first is being recorded only reads back `true`.
    let previous = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    !previous
}

/// Records `msg` for the debugger and stops the kernel.
pub fn die(msg: impl Display) -> ! {
    // A failure while recording a failure must not recurse.
    if mark_failed() && !cfg!(feature = "nano") {
        // Safety: only the first failure gets here.
        let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) };
        let mut epitaph = Epitaph { buf, len: 0 };
        write!(epitaph, "{msg}").ok();
    }
    loop {
        compiler_fence(Ordering::SeqCst);
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epitaph_is_truncated_to_fit() {
        let mut buf = [0u8; 8];
        let mut w = Epitaph { buf: &mut buf, len: 0 };
        write!(w, "kernel {}", "fault 4").unwrap();
        write!(w, "more").unwrap();
        assert_eq!(w.len, 8);
        assert_eq!(&buf, b"kernel f", "writes past the end are dropped");
    }
}
