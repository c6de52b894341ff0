// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M with the single-precision FPU
//! (`thumbv7em-none-eabihf`).
//!
//! # Notes on ARM-M interrupts
//!
//! This implementation uses several different interrupt service routines:
//!
//! - `SVCall` implements the `SVC` instruction used to make syscalls.
//! - `PendSV` handles deferred context switches from interrupts.
//! - `DefaultHandler` takes every vendor IRQ, and the SysTick exception, and
//!   hands it to the Interrupt object routed to it.
//! - `MemoryManagement`, `BusFault` and `UsageFault` stop the faulting
//!   context, or panic if the kernel itself faulted.
//!
//! On any interrupt, the processor stacks a small subset of machine state and
//! then calls our ISR, which follows the normal (C) calling convention. That's
//! fine as long as we return to the code that was interrupted. It isn't fine
//! when the kernel switches Contexts, and it isn't fine for syscalls, whose
//! messages live in r4-r11: registers the ISR would save somewhere opaque.
//!
//! So around `SVCall` we do a full save/restore sequence: all user state goes
//! into the current Context's `SavedState` on the way in, and comes back out
//! on the way out, possibly from a different Context.
//!
//! That's relatively costly, so hardware IRQs don't do it. If delivering an
//! IRQ's message made a switch necessary, the handler sets `PendSV` pending.
//! `PendSV` runs when the IRQ handler exits, does the full save/restore, and
//! performs the switch in between.

use core::arch::{self, global_asm};
use core::sync::atomic::{compiler_fence, AtomicBool, AtomicPtr, Ordering};

use abi::N_TASK_REGIONS;
use kerncore::mpu::Region;

use crate::err::Fault;
use crate::startup::with_kernel;

cfg_if::cfg_if! {
    if #[cfg(feature = "klog-semihosting")] {
        macro_rules! klog {
            ($($tt:tt)*) => {{
                let _ = cortex_m_semihosting::hprintln!($($tt)*);
            }};
        }
    } else if #[cfg(feature = "klog-itm")] {
        macro_rules! klog {
            ($($tt:tt)*) => {{
                cortex_m::iprintln!($crate::arch::klog_port(), $($tt)*);
            }};
        }
    } else {
        macro_rules! klog {
            ($($tt:tt)*) => {{
                let _ = format_args!($($tt)*);
            }};
        }
    }
}

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// ITM stimulus port 0, where kernel log output goes.
#[cfg(feature = "klog-itm")]
pub fn klog_port() -> &'static mut cortex_m::peripheral::itm::Stim {
    // Safety: kernel code never preempts other kernel code, so there is only
    // ever one of these references live at a time.
    unsafe {
        let itm = cortex_m::peripheral::ITM::PTR
            as *mut cortex_m::peripheral::itm::RegisterBlock;
        &mut (*itm).stim[0]
    }
}

/// On ARMvx-M we have to use a global to record the current Context's saved
/// state, since we don't have a scratch register.
#[no_mangle]
static CURRENT_CONTEXT_PTR: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

/// ARMvx-M volatile registers that must be saved across context switches.
///
/// The entry sequences below store into this with a single `stm`/`vstm`
/// pair, so the field order is load-bearing.
#[repr(C)]
#[derive(Debug)]
pub struct SavedState {
    /// r4 through r11.
    regs: [u32; 8],
    psp: u32,
    // These two are only touched by the entry sequences.
    #[allow(dead_code)]
    exc_return: u32,
    /// s16 through s31.
    #[allow(dead_code)]
    fpregs: [u32; 16],
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            regs: [0; 8],
            psp: 0,
            exc_return: EXC_RETURN_CONST,
            fpregs: [0; 16],
        }
    }
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

/// EXC_RETURN used to enter a Context for the first time: Thread mode, on the
/// process stack, with a basic (non-FPU) exception frame. After that, each
/// Context's EXC_RETURN is whatever the hardware gave us on its last entry.
const EXC_RETURN_CONST: u32 = 0xFFFF_FFFD;

/// Number of regions the ARMv7-M MPU implements. Context region registers
/// use the low `N_TASK_REGIONS` of them; the rest stay disabled.
const MPU_REGIONS: u32 = 8;

/// Loads a Context's regions into the MPU.
///
/// Regions are numbered by region register, so a later register overrides an
/// earlier one where they overlap. Empty registers disable their region.
pub fn apply_memory_protection(regions: &[Option<Region>; N_TASK_REGIONS]) {
    // We are manufacturing authority to interact with the MPU here, because we
    // can't thread a cortex-specific peripheral through an
    // architecture-independent API.
    let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };

    // Turn off the MPU.
    //
    // Safety: this has no actual memory safety implications, except for
    // potentially exposing the kernel to a NULL dereference that succeeds.
    unsafe {
        mpu.ctrl.write(0);
    }

    for i in 0..MPU_REGIONS {
        let (rbar, rasr) = match regions.get(i as usize).copied().flatten() {
            Some(r) => (r.rbar.bits(), r.rasr.bits()),
            None => (0, 0),
        };
        // Safety: we're messing with memory protection, so from the API's
        // point of view this is very unsafe. But these images were checked
        // when their keys were minted, and they only affect unprivileged
        // code; the kernel runs on the default map.
        unsafe {
            mpu.rnr.write(i);
            mpu.rbar.write(rbar);
            mpu.rasr.write(rasr);
        }
    }

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;
    // Safety: same as above, has no safety implications really.
    unsafe {
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }
}

// Word accesses made on a Context's behalf. Each probe is a leaf routine whose
// first instruction is the access itself: `ldrt`/`strt` for the unprivileged
// flavors, so the MPU applies the current Context's permissions, and plain
// `ldr`/`str` for the privileged ones. Stores are followed by a `dsb`, so a
// bus error on a buffered write is raised before the routine returns.
//
// A fault with its PC anywhere between `probe_start` and `probe_end` resumes
// at `probe_fault`, which returns 1. That covers imprecise bus faults, which
// are reported some way past the store that caused them.
global_asm! {"
    .section .text.probe
    .globl probe_start
    probe_start:

    .globl probe_ldrt
    .type probe_ldrt,function
    probe_ldrt:
        ldrt r2, [r0]
        str r2, [r1]
        movs r0, #0
        bx lr

    .globl probe_strt
    .type probe_strt,function
    probe_strt:
        strt r1, [r0]
        dsb
        movs r0, #0
        bx lr

    .globl probe_ldr
    .type probe_ldr,function
    probe_ldr:
        ldr r2, [r0]
        str r2, [r1]
        movs r0, #0
        bx lr

    .globl probe_str
    .type probe_str,function
    probe_str:
        str r1, [r0]
        dsb
        movs r0, #0
        bx lr

    .globl probe_fault
    .type probe_fault,function
    probe_fault:
        movs r0, #1
        bx lr

    .globl probe_end
    probe_end:
    ",
}

extern "C" {
    fn probe_ldrt(addr: u32, out: *mut u32) -> u32;
    fn probe_strt(addr: u32, value: u32) -> u32;
    fn probe_ldr(addr: u32, out: *mut u32) -> u32;
    fn probe_str(addr: u32, value: u32) -> u32;
    fn probe_fault() -> u32;
    static probe_start: u8;
    static probe_end: u8;
}

/// Set while a probe routine runs.
static PROBING: AtomicBool = AtomicBool::new(false);
/// Set by the fault handler when an imprecise bus fault lands while
/// `PROBING` is set but outside the probe routines.
static PROBE_FAULTED: AtomicBool = AtomicBool::new(false);

/// Runs a probe routine, folding in any imprecise fault it caused.
fn probing(body: impl FnOnce() -> u32) -> Result<(), Fault> {
    PROBE_FAULTED.store(false, Ordering::Relaxed);
    PROBING.store(true, Ordering::Relaxed);
    compiler_fence(Ordering::SeqCst);
    let r = body();
    compiler_fence(Ordering::SeqCst);
    PROBING.store(false, Ordering::Relaxed);
    match (r, PROBE_FAULTED.swap(false, Ordering::Relaxed)) {
        (0, false) => Ok(()),
        _ => Err(Fault),
    }
}

fn load_with(
    probe: unsafe extern "C" fn(u32, *mut u32) -> u32,
    addr: u32,
) -> Result<u32, Fault> {
    if addr & 3 != 0 {
        return Err(Fault);
    }
    let mut value = 0;
    // Safety: a faulting access comes back as 1 rather than taking the
    // kernel down, and the routine only writes through `out`.
    probing(|| unsafe { probe(addr, &mut value) })?;
    Ok(value)
}

fn store_with(
    probe: unsafe extern "C" fn(u32, u32) -> u32,
    addr: u32,
    value: u32,
) -> Result<(), Fault> {
    if addr & 3 != 0 {
        return Err(Fault);
    }
    // Safety: as for `load_with`. Kernel memory is never reachable through a
    // Memory object.
    probing(|| unsafe { probe(addr, value) })
}

/// Loads a word with the current Context's permissions.
pub fn uload(addr: u32) -> Result<u32, Fault> {
    load_with(probe_ldrt, addr)
}

/// Stores a word with the current Context's permissions.
pub fn ustore(addr: u32, value: u32) -> Result<(), Fault> {
    store_with(probe_strt, addr, value)
}

/// Loads a word with kernel permissions, still subject to any loaded region
/// covering the address.
pub fn read_word(addr: u32) -> Result<u32, Fault> {
    load_with(probe_ldr, addr)
}

/// Stores a word with kernel permissions, still subject to any loaded region
/// covering the address.
pub fn write_word(addr: u32, value: u32) -> Result<(), Fault> {
    store_with(probe_str, addr, value)
}

/// If `pc` lies inside the probe routines, returns where to resume.
fn probe_recovery(pc: u32) -> Option<u32> {
    // Safety: only the addresses of the labels are taken.
    let (start, end) = unsafe {
        (
            core::ptr::addr_of!(probe_start) as u32 & !1,
            core::ptr::addr_of!(probe_end) as u32 & !1,
        )
    };
    (start..end)
        .contains(&pc)
        .then_some(probe_fault as usize as u32 & !1)
}

/// Records `save` as the state to restore on the way out of the kernel.
pub fn set_current_context(save: &mut SavedState) {
    CURRENT_CONTEXT_PTR.store(save, Ordering::Relaxed);
}

/// Sets up fault handling and exception priorities. Call this before
/// `startup::boot`, so that faults during boot are reported.
pub fn init() {
    // Enable faults and set fault/exception priorities. The kernel entry
    // points (SVCall, PendSV, interrupt handlers) share the lowest priority,
    // so the kernel is never preempted by itself. Fault handlers sit above
    // them so that we can detect faults in the kernel.
    //
    // Safety: we're purely lowering priorities from their defaults, so this
    // can't cause any surprise preemption. But these operations are `unsafe`
    // in the `cortex_m` crate.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Distinguish MEMFAULT, BUSFAULT and USGFAULT from HardFault.
        scb.shcsr.modify(|x| x | 0b111 << 16);

        // Usage, Bus, MemManage at 0 (highest configurable).
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall and PendSV at 0xFF (lowest configurable).
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);

        // Trap on divide by zero rather than quietly returning 0.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        // The interrupt count is in blocks of 32, minus 1.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let irq_count = ((icb.ictr.read() as usize & 0xF) + 1) * 32;
        for ipr in nvic.ipr.iter().take(irq_count) {
            ipr.write(0xFFu8);
        }
    }
}

/// Drops into the first Context.
pub fn start_first_context(save: &SavedState) -> ! {
    CURRENT_CONTEXT_PTR.store(save as *const _ as *mut _, Ordering::Relaxed);

    // Safety: this is setting the Process (Context) stack pointer, which has
    // no effect _assuming_ this code is running on the Main (kernel) stack.
    unsafe {
        cortex_m::register::psp::write(save.psp);
    }

    // Our goal here is to flip into Handler mode so that we can switch Thread
    // mode to unprivileged and running off the Process Stack Pointer. The
    // easiest way to do this on ARM-M is by entering Handler mode by a trap.
    // The SVCall entry sequence detects a trap from the main stack and does
    // kernel startup rather than processing it as a syscall.
    unsafe {
        arch::asm!("
            @ Restore callee-save registers.
            ldm {save}, {{r4-r11}}
            @ Trap into the kernel.
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            save = in(reg) &save.regs,
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call (SVC)
// instruction. (Name is dictated by the `cortex_m` crate.)
//
// First, we inspect LR, which on exception entry contains bits describing the
// _previous_ (interrupted) processor state. We can use this to detect if the
// SVC came from the Main (interrupt) stack. This only happens once, during
// startup, so we vector to a different routine in this case.
//
// We then store the calling Context's registers into its SavedState, call
// `syscall_entry`, and restore from whichever SavedState is current after
// that.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the kernel startup routine?
        cmp r0, #0x8
        @ If so, this is startup; jump ahead.
        beq 1f

        @ store volatile state.
        @ first, get a pointer to the current saved state.
        movw r0, #:lower16:CURRENT_CONTEXT_PTR
        movt r0, #:upper16:CURRENT_CONTEXT_PTR
        ldr r1, [r0]
        movs r2, r1
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r2!, {{r4-r12, lr}}
        vstm r2, {{s16-s31}}

        @ the descriptor is in the saved r4; the Rust side reads it there.
        bl syscall_entry

        @ we're returning back to *some* context, maybe not the same one.
        movw r0, #:lower16:CURRENT_CONTEXT_PTR
        movt r0, #:upper16:CURRENT_CONTEXT_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr

    1:  @ starting up the first context.
        movs r0, #1         @ get bitmask to...
        msr CONTROL, r0     @ ...shed privs from thread mode.
                            @ note: no barrier here because exc return
                            @ serves as barrier

        mov lr, {exc_return}    @ materialize EXC_RETURN value to
                                @ return into thread mode, PSP

        bx lr                   @ branch into user mode
    ",
    exc_return = const EXC_RETURN_CONST,
}

/// Requests a context switch once the current ISR (and any chained ISRs)
/// returns.
pub fn pend_context_switch_from_isr() {
    cortex_m::peripheral::SCB::set_pendsv();
}

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ store volatile state.
        @ first, get a pointer to the current saved state.
        movw r0, #:lower16:CURRENT_CONTEXT_PTR
        movt r0, #:upper16:CURRENT_CONTEXT_PTR
        ldr r1, [r0]
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r1!, {{r4-r12, lr}}
        vstm r1, {{s16-s31}}

        bl pendsv_entry

        @ we're returning back to *some* context, maybe not the same one.
        movw r0, #:lower16:CURRENT_CONTEXT_PTR
        movt r0, #:upper16:CURRENT_CONTEXT_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr
    ",
}

/// The Rust side of the PendSV handler, after all volatile registers have been
/// saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    // irq before kernel started?
    uassert!(!CURRENT_CONTEXT_PTR.load(Ordering::Relaxed).is_null());
    with_kernel(|k| k.do_deferred_switch());
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn DefaultHandler() {
    // We can cheaply get the identity of the interrupt that called us from the
    // bottom 9 bits of IPSR.
    //
    // Safety: we're just reading the PSR.
    let exception_num = unsafe {
        let mut ipsr: u32;
        arch::asm!(
            "mrs {}, IPSR",
            out(reg) ipsr,
            options(pure, nomem, preserves_flags, nostack),
        );
        ipsr & 0x1FF
    };

    // The first 16 exceptions are architecturally defined; vendor hardware
    // interrupts start at 16.
    match exception_num {
        2 => panic!("NMI"),
        12 => panic!("DebugMon"),
        15 => with_kernel(|k| k.trigger_sys_tick()),
        x if x >= 16 => {
            let irq = exception_num - 16;
            with_kernel(|k| k.trigger(irq));
        }
        _ => panic!("unknown exception {exception_num}"),
    }
}

pub fn disable_irq(n: u32) {
    // Disable the interrupt by poking the Interrupt Clear Enable Register.
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    let reg_num = (n / 32) as usize;
    let bit_mask = 1 << (n % 32);
    let Some(icer) = nvic.icer.get(reg_num) else {
        panic!("no IRQ {n}");
    };
    unsafe {
        icer.write(bit_mask);
    }
}

pub fn enable_irq(n: u32, also_clear_pending: bool) {
    // Enable the interrupt by poking the Interrupt Set Enable Register.
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    let reg_num = (n / 32) as usize;
    let bit_mask = 1 << (n % 32);
    let (Some(iser), Some(icpr)) =
        (nvic.iser.get(reg_num), nvic.icpr.get(reg_num))
    else {
        panic!("no IRQ {n}");
    };
    if also_clear_pending {
        // Do this _before_ enabling.
        unsafe {
            icpr.write(bit_mask);
        }
    }
    unsafe {
        iser.write(bit_mask);
    }
}

/// Stops SysTick from raising its exception. The counter keeps running.
pub fn disable_sys_tick() {
    const TICKINT: u32 = 1 << 1;
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    unsafe {
        syst.csr.modify(|x| x & !TICKINT);
    }
}

pub fn enable_sys_tick(also_clear_pending: bool) {
    const TICKINT: u32 = 1 << 1;
    const PENDSTCLR: u32 = 1 << 25;
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    if also_clear_pending {
        let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
        unsafe {
            scb.icsr.write(PENDSTCLR);
        }
    }
    unsafe {
        syst.csr.modify(|x| x | TICKINT);
    }
}

/// Reads SysTick register `n`: CSR, RVR, CVR or CALIB.
pub fn read_sys_tick(n: u32) -> Option<u32> {
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    match n {
        0 => Some(syst.csr.read()),
        1 => Some(syst.rvr.read()),
        2 => Some(syst.cvr.read()),
        3 => Some(syst.calib.read()),
        _ => None,
    }
}

/// Writes SysTick register `n`. CALIB is read-only, so writes to it are
/// accepted and have no effect.
pub fn write_sys_tick(n: u32, value: u32) -> bool {
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    // Safety: SysTick belongs to whoever holds the SysTick object's key.
    unsafe {
        match n {
            0 => syst.csr.write(value),
            1 => syst.rvr.write(value),
            2 => syst.cvr.write(value),
            3 => (),
            _ => return false,
        }
    }
    true
}

#[repr(u8)]
#[allow(dead_code)]
enum FaultType {
    MemoryManagement = 4,
    BusFault = 5,
    UsageFault = 6,
}

global_asm! {"
    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    configurable_fault:
        @ Faults taken on the main stack are the kernel's own, whether in a
        @ handler or during boot; they leave the saved state alone.
        tst lr, #0x4
        beq 2f

        @ Read the current saved state pointer.
        movw r0, #:lower16:CURRENT_CONTEXT_PTR
        movt r0, #:upper16:CURRENT_CONTEXT_PTR
        ldr r0, [r0]
        mrs r12, PSP

        @ Save the remaining registers, the PSP (in r12) and exc_return (in
        @ LR) into the current saved state. The floating point registers are
        @ left alone: touching them may trigger a lazy save onto a stack that
        @ is the reason we're here.
        mov r2, r0
        stm r2!, {{r4-r12, lr}}

        @ Pull our fault number out of IPSR. Only the bottom 4 bits matter for
        @ exceptions numbered below 16.
        mrs r1, IPSR
        and r1, r1, #0xf
        bl handle_fault

        @ The current context has changed; reload it.
        movw r0, #:lower16:CURRENT_CONTEXT_PTR
        movt r0, #:upper16:CURRENT_CONTEXT_PTR
        ldr r0, [r0]

        @ Restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr

    2:  @ Pass the exception frame on the main stack, so the stacked PC can
        @ be redirected, and the fault number.
        mov r0, sp
        mrs r1, IPSR
        and r1, r1, #0xf
        push {{r4, lr}}
        bl handle_kernel_fault
        pop {{r4, lr}}
        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault
    ",
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
    }
}

/// Rust entry point for a fault taken by the kernel itself.
///
/// A fault inside the probe routines resumes at the probe's failure return,
/// as does an imprecise bus fault while a probe is in flight. Anything else
/// is a kernel bug.
///
/// # Safety
///
/// `frame` must point at the exception frame the hardware stacked for this
/// fault.
#[no_mangle]
unsafe extern "C" fn handle_kernel_fault(frame: *mut u32, fault_type: FaultType) {
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    // Safety: word 6 of the basic frame is the return address, and the
    // extended frame starts with the basic one.
    let pc = unsafe { frame.add(6) };
    if let Some(resume) = probe_recovery(unsafe { pc.read() }) {
        // Write-one-to-clear.
        unsafe {
            scb.cfsr.write(cfsr.bits());
            pc.write(resume);
        }
        return;
    }
    if cfsr.contains(Cfsr::IMPRECISERR) && PROBING.load(Ordering::Relaxed) {
        // The store already retired; let the probe finish and report it.
        unsafe {
            scb.cfsr.write(cfsr.bits());
        }
        PROBE_FAULTED.store(true, Ordering::Relaxed);
        return;
    }

    panic!(
        "Kernel fault {}: \
        CFSR={:#010x}, MMFAR={:#010x}, BFAR={:#010x}",
        (fault_type as u8) as u32,
        cfsr.bits(),
        scb.mmfar.read(),
        scb.bfar.read(),
    );
}

/// Rust entry point for a fault taken by a Context.
///
/// # Safety
///
/// Call this on the way into the kernel from the fault entry sequence, with
/// `save` pointing at the current Context's saved state.
#[no_mangle]
unsafe extern "C" fn handle_fault(save: *const SavedState, _fault_type: FaultType) {
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    // Safety: the entry sequence just stored through this pointer.
    let psp = unsafe { (*save).psp };

    // A fault taken while stacking for another exception (an SVC with no
    // stack left, say) leaves that exception pending. Clear the pended bits
    // for architectural exceptions in SHCSR bits 15:12 so it doesn't appear
    // to come from the next Context.
    //
    // Safety: SVC is lower priority than this handler, so this can't race.
    unsafe {
        scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
    }

    if cfsr.intersects(Cfsr::MSTKERR | Cfsr::STKERR) {
        // The stack is unusable; don't let a lazy FP save land on it.
        const LSPACT: u32 = 1 << 0;
        unsafe {
            let fpu = &*cortex_m::peripheral::FPU::PTR;
            fpu.fpccr.modify(|x| x & !LSPACT);
        }
        klog!("stack fault, psp={:#010x}", psp);
    } else if cfsr.contains(Cfsr::MMARVALID) {
        klog!("memory fault at {:#010x}", scb.mmfar.read());
    } else if cfsr.contains(Cfsr::BFARVALID) {
        klog!("bus fault at {:#010x}", scb.bfar.read());
    } else {
        klog!("fault: CFSR={:#010x}", cfsr.bits());
    }

    // Write-one-to-clear.
    unsafe {
        scb.cfsr.write(cfsr.bits());
    }

    with_kernel(|k| k.fault_current());

    // The faulting Context was stopped, so something else must be current.
    uassert!(!core::ptr::eq(CURRENT_CONTEXT_PTR.load(Ordering::Relaxed), save));
}
