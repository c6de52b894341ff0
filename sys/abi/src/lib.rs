// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.
//!
//! Everything in here is part of the contract between unprivileged code and
//! the kernel: the layout of message descriptors and messages, the exception
//! identifiers carried by failure messages, per-object selector numbers, the
//! compile-time configuration both sides must agree on, and the boot records
//! the kernel reads out of flash to build the initial object table.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Opaque 64-bit value carried by a key and interpreted only by the object
/// the key designates.
pub type Brand = u64;

/// Number of key registers in each context.
pub const N_TASK_KEYS: usize = 16;
/// Number of keys transferred with each message. These are always key
/// registers `0..N_MESSAGE_KEYS` of the participating contexts.
pub const N_MESSAGE_KEYS: usize = 4;
/// Number of data words in each message, not counting the descriptor.
pub const N_MESSAGE_DATA: usize = 4;
/// Number of memory region registers in each context. Needs to be less than
/// or equal to the number of regions in the MPU.
pub const N_TASK_REGIONS: usize = 6;
/// Number of distinct scheduling priorities.
pub const N_PRIORITIES: usize = 8;
/// Number of external interrupt lines the kernel can route.
pub const MAX_IRQS: usize = 128;
/// Line number carried in the trigger messages of the SysTick object, in
/// place of an IRQ number.
pub const SYS_TICK_LINE: u32 = u32::MAX;
/// Number of memory grants given to the first context at boot.
pub const INITIAL_GRANTS: usize = 4;

/// Object table indices of the objects every kernel creates at boot.
pub mod well_known {
    pub const NULL: u32 = 0;
    pub const OBJECT_TABLE: u32 = 1;
    pub const FIRST_CONTEXT: u32 = 2;
    pub const FIRST_REPLY_GATE: u32 = 3;

    /// Number of well-known objects; app-described objects start here.
    pub const COUNT: u32 = 4;

    /// Key register in which the first context finds its Object Table key.
    pub const FIRST_CONTEXT_TABLE_KEY: usize = 4;
}

/// Sizes of kernel object bodies, in bytes. A Memory object must be at least
/// `1 << allocsize(size)` bytes to `become` the corresponding kind.
pub const CONTEXT_SIZE: usize = 1024;
pub const GATE_SIZE: usize = N_PRIORITIES * 32;
pub const REPLY_GATE_SIZE: usize = 32;
pub const INTERRUPT_SIZE: usize = 128;

/// Computes `ceil(log2(x))`, treating 0 and 1 as 0.
pub const fn log2ceil(x: usize) -> u32 {
    if x <= 1 {
        0
    } else {
        usize::BITS - (x - 1).leading_zeros()
    }
}

/// Log2 of the smallest memory size that can hold an object of `x` bytes.
/// Never below 5, the smallest describable region.
pub const fn allocsize(x: usize) -> u32 {
    let l = log2ceil(x);
    if l < 5 {
        5
    } else {
        l
    }
}

/// Selector numbers, as they appear in the low 16 bits of a descriptor.
pub mod selector {
    pub type Selector = u16;

    pub mod context {
        use super::Selector;

        pub const READ_REGISTER: Selector = 0;
        pub const WRITE_REGISTER: Selector = 1;
        pub const READ_KEY_REGISTER: Selector = 2;
        pub const WRITE_KEY_REGISTER: Selector = 3;
        pub const READ_REGION_REGISTER: Selector = 4;
        pub const WRITE_REGION_REGISTER: Selector = 5;
        pub const MAKE_RUNNABLE: Selector = 6;
        pub const GET_PRIORITY: Selector = 7;
        pub const SET_PRIORITY: Selector = 8;
        pub const READ_LOW_REGISTERS: Selector = 9;
        pub const READ_HIGH_REGISTERS: Selector = 10;
        pub const WRITE_LOW_REGISTERS: Selector = 11;
        pub const WRITE_HIGH_REGISTERS: Selector = 12;
    }

    pub mod interrupt {
        use super::Selector;

        /// Selector used by the messages an Interrupt sends when it fires.
        pub const TRIGGERED: Selector = 1;

        pub const SET_TARGET: Selector = 1;
        pub const ENABLE: Selector = 2;
    }

    /// The SysTick timer speaks the Interrupt protocol, plus raw access to
    /// its four registers (CSR, RVR, CVR, CALIB, numbered in that order).
    pub mod sys_tick {
        use super::Selector;

        pub use super::interrupt::{ENABLE, SET_TARGET, TRIGGERED};

        pub const READ_REGISTER: Selector = 3;
        pub const WRITE_REGISTER: Selector = 4;
    }

    pub mod memory {
        use super::Selector;

        pub const INSPECT: Selector = 0;
        pub const CHANGE: Selector = 1;
        pub const SPLIT: Selector = 2;
        pub const BECOME: Selector = 3;
        pub const PEEK: Selector = 4;
        pub const POKE: Selector = 5;
        pub const MAKE_CHILD: Selector = 6;
    }

    pub mod object_table {
        use super::Selector;

        pub const MINT_KEY: Selector = 0;
        pub const READ_KEY: Selector = 1;
        pub const GET_KIND: Selector = 2;
        pub const INVALIDATE: Selector = 3;
    }
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Ipc = 0,
    CopyKey = 1,
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Ipc),
            1 => Ok(Self::CopyKey),
            _ => Err(()),
        }
    }
}

/// Message descriptor, the first word of every message.
///
/// | Bits  | Field             |
/// |-------|-------------------|
/// | 0-15  | selector          |
/// | 16    | error             |
/// | 17    | send enabled      |
/// | 18    | receive enabled   |
/// | 19    | block             |
/// | 20-23 | target key index  |
/// | 24-27 | source key index  |
/// | 28-31 | syscall number    |
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Descriptor(pub u32);

impl Descriptor {
    const ERROR: u32 = 1 << 16;
    const SEND: u32 = 1 << 17;
    const RECEIVE: u32 = 1 << 18;
    const BLOCK: u32 = 1 << 19;

    pub const fn zero() -> Self {
        Self(0)
    }

    /// Descriptor for a blocking call: send to key register `target`, then
    /// receive the reply through key register 0.
    pub const fn call(selector: selector::Selector, target: usize) -> Self {
        Self::zero()
            .with_selector(selector)
            .with_send_enabled(true)
            .with_target(target)
            .with_receive_enabled(true)
            .with_source(0)
            .with_block(true)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    const fn with_flag(self, flag: u32, on: bool) -> Self {
        if on {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }

    pub const fn selector(self) -> selector::Selector {
        self.0 as u16
    }

    pub const fn with_selector(self, s: selector::Selector) -> Self {
        Self((self.0 & !0xFFFF) | s as u32)
    }

    pub const fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub const fn with_error(self, e: bool) -> Self {
        self.with_flag(Self::ERROR, e)
    }

    pub const fn send_enabled(self) -> bool {
        self.0 & Self::SEND != 0
    }

    pub const fn with_send_enabled(self, e: bool) -> Self {
        self.with_flag(Self::SEND, e)
    }

    pub const fn receive_enabled(self) -> bool {
        self.0 & Self::RECEIVE != 0
    }

    pub const fn with_receive_enabled(self, e: bool) -> Self {
        self.with_flag(Self::RECEIVE, e)
    }

    pub const fn block(self) -> bool {
        self.0 & Self::BLOCK != 0
    }

    pub const fn with_block(self, e: bool) -> Self {
        self.with_flag(Self::BLOCK, e)
    }

    pub const fn target(self) -> usize {
        ((self.0 >> 20) & 0xF) as usize
    }

    pub const fn with_target(self, t: usize) -> Self {
        Self((self.0 & !(0xF << 20)) | ((t as u32 & 0xF) << 20))
    }

    pub const fn source(self) -> usize {
        ((self.0 >> 24) & 0xF) as usize
    }

    pub const fn with_source(self, s: usize) -> Self {
        Self((self.0 & !(0xF << 24)) | ((s as u32 & 0xF) << 24))
    }

    pub const fn sysnum(self) -> u32 {
        self.0 >> 28
    }

    pub const fn with_sysnum(self, n: u32) -> Self {
        Self((self.0 & !(0xF << 28)) | ((n & 0xF) << 28))
    }

    /// Strips everything but the selector and error bit. This is what a
    /// receiver gets to see of the sender's descriptor.
    pub const fn sanitized(self) -> Self {
        Self::zero()
            .with_selector(self.selector())
            .with_error(self.error())
    }

    /// Checks whether this descriptor describes a call, i.e. whether the
    /// receive phase expects a reply through key register 0.
    pub const fn is_call(self) -> bool {
        self.receive_enabled() && self.source() == 0
    }
}

/// A message: descriptor plus data words. Keys travel beside it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub desc: Descriptor,
    pub data: [u32; N_MESSAGE_DATA],
}

impl Message {
    /// Size of a message on the wire: one descriptor word plus the data
    /// words, all little-endian.
    pub const WIRE_SIZE: usize = 4 * (1 + N_MESSAGE_DATA);

    pub const fn new(desc: Descriptor, data: [u32; N_MESSAGE_DATA]) -> Self {
        Self { desc, data }
    }

    /// A successful reply carrying `data`.
    pub const fn reply(data: [u32; N_MESSAGE_DATA]) -> Self {
        Self::new(Descriptor::zero(), data)
    }

    /// A failure message: the error bit set, the exception identifier split
    /// across data words 0 (low half) and 1 (high half), and `param` in data
    /// word 2.
    pub const fn failure(e: Exception, param: u32) -> Self {
        let id = e.id();
        Self::new(
            Descriptor::zero().with_error(true),
            [id as u32, (id >> 32) as u32, param, 0],
        )
    }

    /// Extracts the exception carried by a failure message. Returns `None`
    /// for successful messages, and for failures carrying identifiers the
    /// kernel doesn't define.
    pub fn exception(&self) -> Option<Exception> {
        if !self.desc.error() {
            return None;
        }
        Exception::from_id(u64::from(self.data[0]) | u64::from(self.data[1]) << 32)
    }

    /// Writes the wire form of this message into `out`, returning the number
    /// of bytes used. The kernel moves messages in registers; this form is
    /// for application code that forwards them over byte transports.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, ssmarshal::Error> {
        ssmarshal::serialize(out, self)
    }

    /// Parses a message from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ssmarshal::Error> {
        ssmarshal::deserialize(bytes).map(|(m, _)| m)
    }
}

/// Exceptions the kernel reports in failure messages.
///
/// These are 64-bit identifiers rather than dense error numbers, so that
/// applications can mint their own without colliding with the kernel's.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum Exception {
    /// The operation isn't valid for this key: a revoked key, an object that
    /// isn't a source of messages, or an unrecognized selector.
    BadOperation = 0xfbfe_e621_4559_3586,
    /// The operation would have had to block, and blocking wasn't requested
    /// or was interrupted.
    WouldBlock = 0x1dfc_663b_c104_def5,
    /// The kernel tried to access memory on the caller's behalf and the
    /// access was refused.
    Fault = 0x07b8_19f8_5884_ac2e,
    IndexOutOfRange = 0x0aa9_0fb0_c175_1680,
    BadSyscall = 0xabec_e95f_618e_09ea,
    /// The target object refused the brand.
    BadBrand = 0x71de_cab8_530c_e0eb,
    BadArgument = 0x05d8_7acc_c034_ac82,
    /// A key designated an object of the wrong kind.
    BadKind = 0x50f8_4d57_3f54_c082,
}

impl Exception {
    pub const fn id(self) -> u64 {
        self as u64
    }

    pub fn from_id(id: u64) -> Option<Self> {
        [
            Self::BadOperation,
            Self::WouldBlock,
            Self::Fault,
            Self::IndexOutOfRange,
            Self::BadSyscall,
            Self::BadBrand,
            Self::BadArgument,
            Self::BadKind,
        ]
        .into_iter()
        .find(|e| e.id() == id)
    }
}

/// Object kinds, as reported by the Object Table's `get_kind` and used to
/// tag boot records.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ObjectKind {
    Null = 0,
    ObjectTable = 1,
    Slot = 2,
    Memory = 3,
    Context = 4,
    Gate = 5,
    Interrupt = 6,
    ReplyGate = 7,
    SysTick = 8,
}

impl core::convert::TryFrom<u32> for ObjectKind {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Null),
            1 => Ok(Self::ObjectTable),
            2 => Ok(Self::Slot),
            3 => Ok(Self::Memory),
            4 => Ok(Self::Context),
            5 => Ok(Self::Gate),
            6 => Ok(Self::Interrupt),
            7 => Ok(Self::ReplyGate),
            8 => Ok(Self::SysTick),
            _ => Err(()),
        }
    }
}

/// Kinds a Memory object can `become`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum BecomeKind {
    Context = 0,
    Gate = 1,
    ReplyGate = 2,
    Interrupt = 3,
}

impl BecomeKind {
    /// Log2 of the smallest Memory object that can become this kind.
    pub const fn l2_size(self) -> u32 {
        match self {
            Self::Context => allocsize(CONTEXT_SIZE),
            Self::Gate => allocsize(GATE_SIZE),
            Self::ReplyGate => allocsize(REPLY_GATE_SIZE),
            Self::Interrupt => allocsize(INTERRUPT_SIZE),
        }
    }
}

impl core::convert::TryFrom<u32> for BecomeKind {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Context),
            1 => Ok(Self::Gate),
            2 => Ok(Self::ReplyGate),
            3 => Ok(Self::Interrupt),
            _ => Err(()),
        }
    }
}

/// Indicates priority of a context.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater /
/// less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Validates a priority received from unprivileged code.
    pub fn from_word(x: u32) -> Option<Self> {
        if (x as usize) < N_PRIORITIES {
            Some(Self(x as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

bitflags::bitflags! {
    /// Restrictions attached to a Memory object at boot. These bound every
    /// key that can be minted for the object.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct MemoryAttributes: u32 {
        /// Keys must carry the execute-never bit.
        const NO_EXECUTE = 1 << 0;
        /// Keys may not grant unprivileged writes.
        const UNPRIV_READ_ONLY = 1 << 1;
        /// Keys may not grant writes at all.
        const READ_ONLY = 1 << 2;
        /// The range holds device registers; it can't be retyped.
        const DEVICE = 1 << 3;
    }
}

/// Magic number that appears at the start of the application header to
/// reassure the kernel that it is not reading uninitialized Flash.
pub const CURRENT_APP_MAGIC: u32 = 0x4B45_5953;

/// Application header, read by the kernel at boot.
///
/// One copy of this appears in Flash next to the kernel, followed directly by
/// `object_count - well_known::COUNT` `ObjectDesc` records.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct AppHeader {
    /// Should have the value `CURRENT_APP_MAGIC`.
    pub magic: u32,
    /// Total number of object table entries, including the well-known ones.
    pub object_count: u32,
    /// Initial stack pointer of the first context. Must lie inside one of the
    /// grants below.
    pub initial_stack: u32,
    /// Entry point of the first context.
    pub initial_pc: u32,
    /// Priority of the first context.
    pub initial_priority: u32,
    /// Memory region grants for the first context. Entries with
    /// `memory_index == 0` are ignored.
    pub initial_grants: [RegionGrant; INITIAL_GRANTS],
}

/// A memory grant: a key minted against a Memory object at boot and loaded
/// into one of the first context's region registers.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RegionGrant {
    pub memory_index: u32,
    /// RBAR image.
    pub brand_lo: u32,
    /// RASR image.
    pub brand_hi: u32,
}

impl RegionGrant {
    pub const NONE: Self = Self {
        memory_index: 0,
        brand_lo: 0,
        brand_hi: 0,
    };

    pub const fn brand(&self) -> Brand {
        (self.brand_hi as u64) << 32 | self.brand_lo as u64
    }
}

/// One object described by the application's boot image.
///
/// `kind` is an `ObjectKind` code; the meaning of `args` depends on it:
///
/// - Slot, Gate, ReplyGate: unused.
/// - Memory: base address, log2 of half the size, `MemoryAttributes` bits.
/// - Context: object index of its ReplyGate, priority.
/// - Interrupt: IRQ number, priority.
/// - SysTick: unused, priority. At most one may appear.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ObjectDesc {
    pub kind: u32,
    pub args: [u32; 3],
}

impl ObjectDesc {
    const fn of(kind: ObjectKind, args: [u32; 3]) -> Self {
        Self {
            kind: kind as u32,
            args,
        }
    }

    pub const fn slot() -> Self {
        Self::of(ObjectKind::Slot, [0; 3])
    }

    pub const fn memory(
        base: u32,
        l2_half_size: u32,
        attributes: MemoryAttributes,
    ) -> Self {
        Self::of(ObjectKind::Memory, [base, l2_half_size, attributes.bits()])
    }

    pub const fn context(reply_gate: u32, priority: u8) -> Self {
        Self::of(ObjectKind::Context, [reply_gate, priority as u32, 0])
    }

    pub const fn gate() -> Self {
        Self::of(ObjectKind::Gate, [0; 3])
    }

    pub const fn reply_gate() -> Self {
        Self::of(ObjectKind::ReplyGate, [0; 3])
    }

    pub const fn interrupt(irq: u32, priority: u8) -> Self {
        Self::of(ObjectKind::Interrupt, [irq, priority as u32, 0])
    }

    pub const fn sys_tick(priority: u8) -> Self {
        Self::of(ObjectKind::SysTick, [0, priority as u32, 0])
    }
}
