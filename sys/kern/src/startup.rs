// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The application describes its initial objects in a boot image: an
//! `AppHeader` followed by one `ObjectDesc` per object table entry past the
//! well-known ones. `boot` turns that into a populated object table with the
//! first Context ready to run. Nothing in the image is trusted to be
//! well-formed, but since nothing can run without it, malformed images panic
//! rather than being reported.

use core::mem::size_of;

use abi::{
    well_known, AppHeader, MemoryAttributes, ObjectDesc, ObjectKind, Priority,
    CURRENT_APP_MAGIC,
};
use kerncore::P2Range;
use zerocopy::FromBytes;

use crate::arch;
use crate::context::{ArchState, Context};
use crate::gate::Gate;
use crate::interrupt::{Interrupt, Line};
use crate::kernel::Kernel;
use crate::memory::Memory;
use crate::object::{Entry, Object};
use crate::reply_gate::ReplyGate;

/// Initial program status register value: just the Thumb bit.
const INITIAL_PSR: u32 = 1 << 24;

/// Size of the exception frame the hardware stacks on entry: r0-r3, r12, lr,
/// pc, xpsr.
const FRAME_WORDS: u32 = 8;

/// Splits a boot image into its header and object records. Returns `None` if
/// the image is too short or doesn't start with the expected magic number.
pub fn parse_app(
    image: &[u8],
) -> Option<(AppHeader, impl Iterator<Item = ObjectDesc> + '_)> {
    let (header, rest) = AppHeader::read_from_prefix(image).ok()?;
    if header.magic != CURRENT_APP_MAGIC {
        return None;
    }
    let count = header.object_count.checked_sub(well_known::COUNT)? as usize;
    let records = rest.get(..count * size_of::<ObjectDesc>())?;
    let descs = records
        .chunks_exact(size_of::<ObjectDesc>())
        .filter_map(|c| ObjectDesc::read_from_bytes(c).ok());
    Some((header, descs))
}

fn object_from_desc(desc: &ObjectDesc, count: u32) -> Object {
    let [a0, a1, a2] = desc.args;
    match ObjectKind::try_from(desc.kind) {
        Ok(ObjectKind::Slot) => Object::Slot,
        Ok(ObjectKind::Memory) => {
            let Some(range) = P2Range::of(a0, a1) else {
                panic!("bad memory range {a0:#x}/{a1}");
            };
            let Some(attributes) = MemoryAttributes::from_bits(a2) else {
                panic!("bad memory attributes {a2:#x}");
            };
            Object::Memory(Memory::new(range, attributes))
        }
        Ok(ObjectKind::Context) => {
            if a0 >= count {
                panic!("reply gate index {a0} out of range");
            }
            let Some(priority) = Priority::from_word(a1) else {
                panic!("bad context priority {a1}");
            };
            Object::Context(Context::new(a0, priority))
        }
        Ok(ObjectKind::Gate) => Object::Gate(Gate::new()),
        Ok(ObjectKind::ReplyGate) => Object::ReplyGate(ReplyGate::new()),
        Ok(ObjectKind::Interrupt) => {
            let Some(priority) = Priority::from_word(a1) else {
                panic!("bad interrupt priority {a1}");
            };
            Object::Interrupt(Interrupt::new(Line::Irq(a0), priority))
        }
        Ok(ObjectKind::SysTick) => {
            let Some(priority) = Priority::from_word(a1) else {
                panic!("bad sys_tick priority {a1}");
            };
            Object::Interrupt(Interrupt::new(Line::SysTick, priority))
        }
        _ => panic!("bad object kind {}", desc.kind),
    }
}

/// Builds the initial object table in `objects` and starts the first
/// Context.
///
/// On return, the first Context is current and its memory map is loaded; the
/// architecture code only has to enter it.
///
/// # Panics
///
/// If the boot records are malformed: a wrong record count, a bad kind,
/// range, priority or reply gate binding, an IRQ or SysTick routed twice, a
/// grant its Memory object refuses, or an initial stack the grants don't
/// cover.
pub fn boot<'a>(
    objects: &'a mut [Entry],
    header: &AppHeader,
    descs: impl IntoIterator<Item = ObjectDesc>,
) -> Kernel<'a> {
    let count = header.object_count;
    if count < well_known::COUNT || count as usize > objects.len() {
        panic!("object count {count} doesn't fit the table");
    }
    let (objects, _) = objects.split_at_mut(count as usize);

    let Some(first_priority) = Priority::from_word(header.initial_priority)
    else {
        panic!("bad initial priority {}", header.initial_priority);
    };

    objects[well_known::NULL as usize] = Entry::new(Object::Null);
    objects[well_known::OBJECT_TABLE as usize] = Entry::new(Object::ObjectTable);
    objects[well_known::FIRST_CONTEXT as usize] = Entry::new(Object::Context(
        Context::new(well_known::FIRST_REPLY_GATE, first_priority),
    ));
    objects[well_known::FIRST_REPLY_GATE as usize] =
        Entry::new(Object::ReplyGate(ReplyGate::new()));

    let mut next = well_known::COUNT;
    for desc in descs {
        if next == count {
            panic!("more object records than table entries");
        }
        objects[next as usize] = Entry::new(object_from_desc(&desc, count));
        next += 1;
    }
    if next != count {
        panic!("{} object records missing", count - next);
    }

    let mut kernel = Kernel::new(objects);

    for i in 0..count {
        match *kernel.object(i) {
            Object::Context(ref c) => {
                let rg = c.reply_gate;
                if !kernel.bind_reply_gate(rg, i) {
                    panic!("context {i}: entry {rg} is not a free reply gate");
                }
            }
            Object::Interrupt(ref int) => {
                let line = int.line;
                if !kernel.route(line, i) {
                    panic!("interrupt {i}: {line:?} unusable");
                }
            }
            _ => (),
        }
    }
    klog!("boot: {} objects", count);

    prepare_first_context(&mut kernel, header);

    kernel.pend_switch();
    kernel.do_deferred_switch();
    klog!("boot: starting context {}", kernel.current());
    kernel
}

fn prepare_first_context(kernel: &mut Kernel<'_>, header: &AppHeader) {
    let first = well_known::FIRST_CONTEXT;

    for (i, grant) in header.initial_grants.iter().enumerate() {
        if grant.memory_index == 0 {
            continue;
        }
        let index = grant.memory_index;
        let key = (index < kernel.table_len())
            .then(|| kernel.make_key(index, grant.brand()))
            .flatten()
            .filter(|_| matches!(kernel.object(index), Object::Memory(_)));
        let Some(key) = key else {
            panic!("grant {i}: refused by entry {index}");
        };
        kernel.context_mut(first).regions[i] = key;
    }

    // The initial frame is written with unprivileged stores, which checks
    // that the grants actually cover the stack.
    arch::apply_memory_protection(&kernel.regions_for(first));
    let frame = header.initial_stack.wrapping_sub(FRAME_WORDS * 4);
    let written = arch::ustore(frame.wrapping_add(7 * 4), INITIAL_PSR)
        .and_then(|()| {
            arch::ustore(frame.wrapping_add(6 * 4), header.initial_pc & !1)
        });
    if written.is_err() {
        panic!("initial stack {:#x} not granted", header.initial_stack);
    }
    kernel.context_mut(first).save.set_stack_pointer(frame);

    let Some(table) = kernel.make_key(well_known::OBJECT_TABLE, 0) else {
        panic!("object table refused a key");
    };
    kernel.context_mut(first).keys[well_known::FIRST_CONTEXT_TABLE_KEY] = table;

    kernel.make_runnable(first);
}

#[cfg(target_arch = "arm")]
mod running {
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// The kernel, once booted.
    static mut KERNEL: Option<Kernel<'static>> = None;

    /// Tracks when a mutable reference to the kernel is floating around in
    /// kernel code, to prevent production of a second one. This forms a sort
    /// of ad-hoc Mutex around `KERNEL`.
    ///
    /// Notice that this begins life initialized to `true`. This prevents use
    /// of `with_kernel` before the kernel is properly started. We set it to
    /// `false` late in `start_kernel`.
    static KERNEL_IN_USE: AtomicBool = AtomicBool::new(true);

    /// The main kernel entry point.
    ///
    /// The board's `main`-equivalent does basic hardware setup and then calls
    /// this with the application's boot image and the storage for its object
    /// table.
    ///
    /// # Safety
    ///
    /// This must be called from the main (interrupt) stack in privileged mode,
    /// once per boot, on a single core.
    pub unsafe fn start_kernel(
        image: &'static [u8],
        objects: &'static mut [Entry],
    ) -> ! {
        arch::init();
        let Some((header, descs)) = parse_app(image) else {
            panic!("no valid boot image");
        };
        let kernel = boot(objects, &header, descs);

        // Safety: KERNEL_IN_USE is still true, so nothing else can be looking
        // at KERNEL.
        let kernel = unsafe {
            let slot = &mut *core::ptr::addr_of_mut!(KERNEL);
            slot.insert(kernel)
        };
        let current = kernel.current();
        let save = &kernel.context(current).save as *const arch::SavedState;
        KERNEL_IN_USE.store(false, Ordering::Release);

        // Safety: the object table is 'static and entries never move, so the
        // saved state stays put while the first context runs.
        arch::start_first_context(unsafe { &*save })
    }

    /// Runs `body` with a reference to the kernel.
    ///
    /// To preserve uniqueness of the `&mut` reference passed into `body`, this
    /// function will detect any attempts to call it recursively and panic.
    pub(crate) fn with_kernel<R>(
        body: impl FnOnce(&mut Kernel<'static>) -> R,
    ) -> R {
        if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
            panic!(); // recursive use of with_kernel
        }
        // Safety: we have observed `KERNEL_IN_USE` being false, which means
        // the kernel is initialized (note that at reset it starts out true)
        // and that we're not already within a call to with_kernel.
        let kernel = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) };
        let Some(kernel) = kernel.as_mut() else {
            panic!();
        };

        let r = body(kernel);

        KERNEL_IN_USE.store(false, Ordering::Release);

        r
    }
}

#[cfg(target_arch = "arm")]
pub use running::start_kernel;
#[cfg(target_arch = "arm")]
pub(crate) use running::with_kernel;
