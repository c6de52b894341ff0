// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory objects: authority over a power-of-two range of physical address
//! space.
//!
//! A Memory object owns a `P2Range`. Keys to it carry a complete MPU region
//! (RBAR image in the low word of the brand, RASR image in the high word),
//! which is what gets loaded into the MPU when the key sits in a Context's
//! region register. The object decides which brands it is willing to mint,
//! so the window and permissions of a key can only ever be a subset of what
//! the object allows.
//!
//! Memory can be divided (`split`, `make_child`) and retyped into other kernel
//! objects (`become`).

use abi::{
    selector, BecomeKind, Brand, Exception, MemoryAttributes, Message, Priority,
    MAX_IRQS, N_PRIORITIES,
};
use kerncore::mpu::{
    self, Access, Rasr, Region, MIN_L2_SIZE_FOR_SRD, RASR_ATTRIBUTES,
    RASR_RESERVED, RBAR_REGION_SELECT,
};
use kerncore::P2Range;

use crate::arch;
use crate::context::Context;
use crate::err::Failure;
use crate::gate::Gate;
use crate::interrupt::{Interrupt, Line};
use crate::key::{Key, TableIndex};
use crate::kernel::{Kernel, Keys};
use crate::object::{Entry, Object};
use crate::reply_gate::ReplyGate;
use crate::sender::ReplySender;

/// Smallest size field a region can have (32 bytes).
const MIN_RASR_SIZE: u8 = P2Range::MIN_L2_HALF_SIZE as u8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Memory {
    pub range: P2Range,
    pub attributes: MemoryAttributes,
    /// Memory object this one was carved from by `make_child`, if any.
    pub parent: Option<TableIndex>,
    /// Number of objects carved from this one by `make_child`.
    pub children: u32,
}

impl Memory {
    pub fn new(range: P2Range, attributes: MemoryAttributes) -> Self {
        Self {
            range,
            attributes,
            parent: None,
            children: 0,
        }
    }

    /// Checks whether a key to this object may carry `brand`.
    pub fn admits(&self, brand: Brand) -> bool {
        let region = Region::from_brand(brand);
        let Region { rbar, rasr } = region;
        if rasr.bits() & RASR_RESERVED != 0
            || rbar.bits() & RBAR_REGION_SELECT != 0
            || rasr.size() < MIN_RASR_SIZE
        {
            return false;
        }
        let Some(window) = region.window() else {
            return false;
        };
        if !self.range.contains(window) {
            return false;
        }
        let Some(access) = mpu::decode_ap(rasr.ap()) else {
            return false;
        };
        if access.privileged == Access::None {
            return false;
        }
        let attrs = self.attributes;
        if attrs.contains(MemoryAttributes::READ_ONLY)
            && (access.privileged == Access::Write
                || access.unprivileged == Access::Write)
        {
            return false;
        }
        if attrs.contains(MemoryAttributes::UNPRIV_READ_ONLY)
            && access.unprivileged == Access::Write
        {
            return false;
        }
        if attrs.contains(MemoryAttributes::NO_EXECUTE) && !rasr.xn() {
            return false;
        }
        if rasr.srd() != 0 && window.l2_size() < MIN_L2_SIZE_FOR_SRD {
            return false;
        }
        true
    }

    /// The MPU region described by a brand this object admitted.
    pub fn region_for_brand(brand: Brand) -> Region {
        let mut r = Region::from_brand(brand);
        r.rasr.set_enable(true);
        r
    }
}

/// Window and region of a key, for operations that need the key to cover
/// the whole object.
fn require_whole(m: &Memory, brand: Brand) -> Result<Region, Failure> {
    let region = Memory::region_for_brand(brand);
    if region.rasr.srd() != 0 {
        return Err(Exception::BadOperation.into());
    }
    if region.window() != Some(m.range) {
        return Err(Exception::BadBrand.into());
    }
    Ok(region)
}

impl Kernel<'_> {
    fn memory(&self, index: TableIndex) -> &Memory {
        match self.object(index) {
            Object::Memory(m) => m,
            _ => panic!("entry {index} is not memory"),
        }
    }

    fn memory_mut(&mut self, index: TableIndex) -> &mut Memory {
        match self.object_mut(index) {
            Object::Memory(m) => m,
            _ => panic!("entry {index} is not memory"),
        }
    }

    /// Resolves a donated key, which must designate a Slot.
    fn donated_slot(&self, key: Key) -> Result<TableIndex, Failure> {
        let (index, _) = self.resolve(key);
        match self.object(index) {
            Object::Slot => Ok(index),
            _ => Err(Exception::BadKind.into()),
        }
    }

    /// Rewrites a donated Slot as a Memory object, revoking keys to the
    /// Slot.
    fn fill_slot(&mut self, slot: TableIndex, memory: Memory) {
        self.bump_generation(slot);
        self.objects[slot as usize].object = Object::Memory(memory);
        if let Some(p) = memory.parent {
            self.memory_mut(p).children += 1;
        }
    }

    /// Protocol of Memory objects.
    pub(crate) fn memory_call(
        &mut self,
        index: TableIndex,
        brand: Brand,
        m: &Message,
        keys: &Keys,
    ) -> Result<ReplySender, Failure> {
        use selector::memory::*;

        match m.desc.selector() {
            INSPECT => {
                let r = Memory::region_for_brand(brand);
                Ok(ReplySender::data([r.rbar.bits(), r.rasr.bits(), 0, 0]))
            }
            CHANGE => self.memory_change(index, brand, m.data[0]),
            SPLIT => self.memory_split(index, brand, keys),
            BECOME => self.memory_become(index, brand, m, keys),
            PEEK => {
                let addr = self.memory_word(brand, m.data[0], false)?;
                let v = arch::read_word(addr)?;
                Ok(ReplySender::data([v, 0, 0, 0]))
            }
            POKE => {
                let addr = self.memory_word(brand, m.data[0], true)?;
                arch::write_word(addr, m.data[1])?;
                Ok(ReplySender::default())
            }
            MAKE_CHILD => {
                self.memory_make_child(index, brand, m.data[0], m.data[1], keys)
            }
            other => Err(Failure::new(Exception::BadOperation, u32::from(other))),
        }
    }

    /// Produces a key with narrowed attributes.
    fn memory_change(
        &mut self,
        index: TableIndex,
        brand: Brand,
        requested: u32,
    ) -> Result<ReplySender, Failure> {
        let region = Memory::region_for_brand(brand);
        let current = region.rasr;
        let mut rasr = Rasr::from_bits(requested & RASR_ATTRIBUTES);
        rasr.set_size(current.size());
        rasr.set_enable(true);

        let l2_size = u32::from(current.size()) + 1;
        if mpu::ap_is_unpredictable(rasr.ap())
            || mpu::ap_is_stronger(rasr.ap(), current.ap())
            || current.srd() & !rasr.srd() != 0
            || (rasr.srd() != 0 && l2_size < MIN_L2_SIZE_FOR_SRD)
            || (current.xn() && !rasr.xn())
        {
            return Err(Exception::BadArgument.into());
        }

        let key = self
            .make_key(index, Region { rasr, ..region }.brand())
            .ok_or(Failure::from(Exception::BadArgument))?;
        Ok(ReplySender::default().with_key(1, key))
    }

    /// Divides this object in two, using a donated Slot for the top half.
    fn memory_split(
        &mut self,
        index: TableIndex,
        brand: Brand,
        keys: &Keys,
    ) -> Result<ReplySender, Failure> {
        let mem = *self.memory(index);
        let region = require_whole(&mem, brand)?;
        if mem.children != 0 {
            return Err(Exception::BadOperation.into());
        }
        let (Some(bottom), Some(top)) = (mem.range.bottom(), mem.range.top())
        else {
            return Err(Exception::BadOperation.into());
        };
        let slot = self.donated_slot(keys[1])?;

        // Commit point.
        self.bump_generation(index);
        self.memory_mut(index).range = bottom;
        self.fill_slot(
            slot,
            Memory {
                range: top,
                children: 0,
                ..mem
            },
        );

        let bottom_key = self
            .make_key(index, Region::for_range(bottom, region.rasr).brand())
            .unwrap_or(Key::NULL);
        let top_key = self
            .make_key(slot, Region::for_range(top, region.rasr).brand())
            .unwrap_or(Key::NULL);

        self.reload_mpu();
        Ok(ReplySender::default()
            .with_key(1, bottom_key)
            .with_key(2, top_key))
    }

    /// Retypes this object in place.
    fn memory_become(
        &mut self,
        index: TableIndex,
        brand: Brand,
        m: &Message,
        keys: &Keys,
    ) -> Result<ReplySender, Failure> {
        let mem = *self.memory(index);
        require_whole(&mem, brand)?;
        let kind = BecomeKind::try_from(m.data[0])
            .map_err(|_| Failure::new(Exception::BadArgument, m.data[0]))?;

        let required = kind.l2_size();
        if mem.range.l2_size() < required {
            return Err(Failure::new(Exception::BadOperation, required));
        }
        if mem.children != 0 || mem.attributes.contains(MemoryAttributes::DEVICE)
        {
            return Err(Exception::BadOperation.into());
        }

        let object = match kind {
            BecomeKind::Context => {
                let (rg, _) = self.resolve(keys[1]);
                match self.object(rg) {
                    Object::ReplyGate(r) if r.owner.is_none() => (),
                    _ => return Err(Exception::BadKind.into()),
                }
                // Commit point.
                self.bind_reply_gate(rg, index);
                Object::Context(Context::new(
                    rg,
                    Priority(N_PRIORITIES as u8 - 1),
                ))
            }
            BecomeKind::Gate => Object::Gate(Gate::new()),
            BecomeKind::ReplyGate => Object::ReplyGate(ReplyGate::new()),
            BecomeKind::Interrupt => {
                let irq = m.data[1];
                let priority = Priority::from_word(m.data[2]);
                let Some(priority) =
                    priority.filter(|_| (irq as usize) < MAX_IRQS)
                else {
                    return Err(Exception::BadArgument.into());
                };
                // Commit point.
                if !self.route(Line::Irq(irq), index) {
                    return Err(Failure::new(Exception::BadOperation, irq));
                }
                Object::Interrupt(Interrupt::new(Line::Irq(irq), priority))
            }
        };

        let generation = self.objects[index as usize].generation.next();
        self.objects[index as usize] = Entry { generation, object };
        let key = self.make_key(index, 0).unwrap_or(Key::NULL);

        self.reload_mpu();
        Ok(ReplySender::default().with_key(1, key))
    }

    /// Translates a word offset in a key's window into an address the key
    /// permits the kernel to access.
    fn memory_word(
        &self,
        brand: Brand,
        offset: u32,
        write: bool,
    ) -> Result<u32, Failure> {
        let region = Memory::region_for_brand(brand);
        let window = region.window().ok_or(Failure::from(Exception::BadArgument))?;
        let byte_offset = u64::from(offset) * 4;
        if byte_offset >= window.end() - u64::from(window.base()) {
            return Err(Failure::new(Exception::BadArgument, offset));
        }
        let addr = window.base() + byte_offset as u32;
        if region.permits(addr, write, true) != Some(true) {
            return Err(Failure::new(Exception::Fault, addr));
        }
        Ok(addr)
    }

    /// Carves a naturally aligned piece out of this object's range into a
    /// donated Slot.
    fn memory_make_child(
        &mut self,
        index: TableIndex,
        brand: Brand,
        base: u32,
        size: u32,
        keys: &Keys,
    ) -> Result<ReplySender, Failure> {
        let region = Memory::region_for_brand(brand);
        let child = (size.is_power_of_two() && size >= 32)
            .then(|| P2Range::of(base, size.trailing_zeros() - 1))
            .flatten()
            .filter(|c| region.window().is_some_and(|w| w.contains(*c)))
            .ok_or(Failure::from(Exception::BadArgument))?;
        if region.rasr.srd() != 0 {
            return Err(Exception::BadOperation.into());
        }
        let slot = self.donated_slot(keys[1])?;

        // Commit point.
        let mem = *self.memory(index);
        self.fill_slot(
            slot,
            Memory {
                range: child,
                attributes: mem.attributes,
                parent: Some(index),
                children: 0,
            },
        );

        let key = self
            .make_key(slot, Region::for_range(child, region.rasr).brand())
            .unwrap_or(Key::NULL);
        Ok(ReplySender::default().with_key(1, key))
    }
}

#[cfg(test)]
mod tests {
    use abi::{selector::memory as sel, ObjectDesc, ObjectKind};
    use kerncore::mpu::Rbar;
    use proptest::prelude::*;

    use super::*;
    use crate::testutil::Fixture;

    const AP_RW_RW: u8 = 0b011;
    const AP_RW_RO: u8 = 0b010;
    const AP_RO_RO: u8 = 0b110;

    fn brand(base: u32, l2_half: u32, ap: u8, xn: bool, srd: u8) -> Brand {
        let mut rasr = Rasr::from_bits(0);
        rasr.set_ap(ap);
        rasr.set_xn(xn);
        rasr.set_srd(srd);
        Region::for_range(P2Range::of(base, l2_half).unwrap(), rasr).brand()
    }

    fn mem(attrs: MemoryAttributes) -> Memory {
        Memory::new(P2Range::of(0x2000_0000, 11).unwrap(), attrs)
    }

    #[test]
    fn admits_windows_inside_the_range() {
        let m = mem(MemoryAttributes::empty());
        assert!(m.admits(brand(0x2000_0000, 11, AP_RW_RW, false, 0)));
        assert!(m.admits(brand(0x2000_0800, 10, AP_RW_RW, false, 0)));
        assert!(!m.admits(brand(0x2000_0000, 12, AP_RW_RW, false, 0)));
        assert!(!m.admits(brand(0x2000_1000, 10, AP_RW_RW, false, 0)));
    }

    #[test]
    fn refuses_malformed_brands() {
        let m = mem(MemoryAttributes::empty());
        let good = brand(0x2000_0000, 11, AP_RW_RW, false, 0);
        assert!(!m.admits(good | 1 << 4), "RBAR valid bit");
        assert!(!m.admits(good | 3), "RBAR region number");
        assert!(!m.admits(good | 1 << (32 + 31)), "reserved RASR bit");
        // Size field below 32 bytes.
        let mut r = Region::from_brand(good);
        r.rasr.set_size(3);
        assert!(!m.admits(r.brand()));
        // Base not aligned to the window size.
        let mut r = Region::from_brand(brand(0x2000_0000, 9, AP_RW_RW, false, 0));
        r.rbar = Rbar::from_bits(0x2000_0200);
        assert!(!m.admits(r.brand()));
        // No privileged access, or an unpredictable AP.
        assert!(!m.admits(brand(0x2000_0000, 11, 0b000, false, 0)));
        assert!(!m.admits(brand(0x2000_0000, 11, 0b100, false, 0)));
        // Sub-regions on a region too small to have them.
        assert!(!m.admits(brand(0x2000_0000, 6, AP_RW_RW, false, 1)));
        assert!(m.admits(brand(0x2000_0000, 7, AP_RW_RW, false, 1)));
    }

    #[test]
    fn attributes_bound_the_keys() {
        let ro = mem(MemoryAttributes::READ_ONLY);
        assert!(!ro.admits(brand(0x2000_0000, 11, AP_RW_RO, true, 0)));
        assert!(ro.admits(brand(0x2000_0000, 11, AP_RO_RO, true, 0)));

        let uro = mem(MemoryAttributes::UNPRIV_READ_ONLY);
        assert!(uro.admits(brand(0x2000_0000, 11, AP_RW_RO, false, 0)));
        assert!(!uro.admits(brand(0x2000_0000, 11, AP_RW_RW, false, 0)));

        let nx = mem(MemoryAttributes::NO_EXECUTE);
        assert!(!nx.admits(brand(0x2000_0000, 11, AP_RW_RW, false, 0)));
        assert!(nx.admits(brand(0x2000_0000, 11, AP_RW_RW, true, 0)));
    }

    /// Boots with a 1 KiB Memory object and two Slots, leaving a full-range
    /// key to the memory in the first context's key register 8.
    fn setup(attrs: MemoryAttributes) -> (Fixture, TableIndex) {
        let mut f = Fixture::boot(&[
            ObjectDesc::memory(0x2000_8000, 9, attrs),
            ObjectDesc::slot(),
            ObjectDesc::slot(),
        ]);
        let m = Fixture::EXTRA;
        let k = f.mint(m, brand(0x2000_8000, 9, AP_RW_RW, true, 0));
        f.set_key(f.first, 8, k);
        (f, m)
    }

    fn donate(f: &mut Fixture, slot: TableIndex) {
        let k = f.mint(slot, 0);
        f.set_key(f.first, 1, k);
    }

    #[test]
    fn inspect_reports_the_register_images() {
        let (mut f, _) = setup(MemoryAttributes::empty());
        let r = f.call(8, sel::INSPECT, [0; 4]);
        let expected = Region::from_brand(brand(0x2000_8000, 9, AP_RW_RW, true, 0));
        assert_eq!(r.data[0], expected.rbar.bits());
        assert_eq!(r.data[1], expected.rasr.bits());
    }

    #[test]
    fn split_makes_two_halves_and_revokes_old_keys() {
        let (mut f, m) = setup(MemoryAttributes::empty());
        let old = f.key(f.first, 8);
        let slot = Fixture::EXTRA + 1;
        let slot_key = f.mint(slot, 0);
        f.set_key(f.first, 1, slot_key);
        let gen_before = f.kernel.objects()[m as usize].generation;
        let slot_gen_before = f.kernel.objects()[slot as usize].generation;

        let r = f.call(8, sel::SPLIT, [0; 4]);
        assert_eq!(r.exception(), None, "{r:?}");

        assert_eq!(f.kernel.objects()[m as usize].generation, gen_before.next());
        assert_eq!(
            f.kernel.objects()[slot as usize].generation,
            slot_gen_before.next()
        );
        assert_eq!(f.kernel.resolve(old).0, 0, "old memory key is stale");
        assert_eq!(f.kernel.resolve(slot_key).0, 0, "slot key is stale");

        let bottom = f.key(f.first, 1);
        let top = f.key(f.first, 2);
        assert_eq!(f.kernel.resolve(bottom).0, m);
        assert_eq!(f.kernel.resolve(top).0, slot);
        assert_eq!(
            f.kernel.region_for_key(bottom).and_then(|r| r.window()),
            P2Range::of(0x2000_8000, 8)
        );
        assert_eq!(
            f.kernel.region_for_key(top).and_then(|r| r.window()),
            P2Range::of(0x2000_8200, 8)
        );
        let top_rasr = f.kernel.region_for_key(top).unwrap().rasr;
        assert!(top_rasr.xn(), "halves keep the caller's attributes");
    }

    #[test]
    fn split_refusals() {
        let (mut f, m) = setup(MemoryAttributes::empty());

        // Donation of the wrong kind.
        let k = f.mint(abi::well_known::OBJECT_TABLE, 0);
        f.set_key(f.first, 1, k);
        let r = f.call(8, sel::SPLIT, [0; 4]);
        assert_eq!(r.exception(), Some(Exception::BadKind));

        // A key that covers only part of the object.
        donate(&mut f, Fixture::EXTRA + 1);
        let part = f.mint(m, brand(0x2000_8000, 8, AP_RW_RW, true, 0));
        f.set_key(f.first, 9, part);
        let r = f.call(9, sel::SPLIT, [0; 4]);
        assert_eq!(r.exception(), Some(Exception::BadBrand));

        // Sub-regions disabled.
        let srd = f.mint(m, brand(0x2000_8000, 9, AP_RW_RW, true, 0x80));
        f.set_key(f.first, 9, srd);
        let r = f.call(9, sel::SPLIT, [0; 4]);
        assert_eq!(r.exception(), Some(Exception::BadOperation));

        assert_eq!(
            f.kernel.object(Fixture::EXTRA + 1).kind(),
            ObjectKind::Slot,
            "refusals leave the donation alone"
        );
    }

    #[test]
    fn split_stops_at_the_minimum_size() {
        let mut f = Fixture::boot(&[
            ObjectDesc::memory(0x2000_8000, 4, MemoryAttributes::empty()),
            ObjectDesc::slot(),
        ]);
        let k = f.mint(Fixture::EXTRA, brand(0x2000_8000, 4, AP_RW_RW, true, 0));
        f.set_key(f.first, 8, k);
        donate(&mut f, Fixture::EXTRA + 1);
        let r = f.call(8, sel::SPLIT, [0; 4]);
        assert_eq!(r.exception(), Some(Exception::BadOperation));
    }

    #[test]
    fn change_only_narrows() {
        let (mut f, _) = setup(MemoryAttributes::empty());
        let current = Region::from_brand(brand(0x2000_8000, 9, AP_RW_RW, true, 0));

        let mut ro = current.rasr;
        ro.set_ap(AP_RW_RO);
        let r = f.call(8, sel::CHANGE, [ro.bits(), 0, 0, 0]);
        assert_eq!(r.exception(), None);
        let narrowed = f.key(f.first, 1);
        assert_eq!(
            f.kernel.region_for_key(narrowed).unwrap().rasr.ap(),
            AP_RW_RO
        );

        // From the narrowed key, going back up is refused.
        f.set_key(f.first, 9, narrowed);
        let r = f.call(9, sel::CHANGE, [current.rasr.bits(), 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadArgument));

        // So is dropping execute-never, or an unpredictable AP.
        let mut x = current.rasr;
        x.set_xn(false);
        let r = f.call(8, sel::CHANGE, [x.bits(), 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadArgument));
        let mut bad = current.rasr;
        bad.set_ap(0b100);
        let r = f.call(8, sel::CHANGE, [bad.bits(), 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadArgument));

        // Disabled sub-regions stay disabled.
        let mut srd = current.rasr;
        srd.set_srd(0x0F);
        let r = f.call(8, sel::CHANGE, [srd.bits(), 0, 0, 0]);
        assert_eq!(r.exception(), None);
        let k = f.key(f.first, 1);
        f.set_key(f.first, 9, k);
        srd.set_srd(0x07);
        let r = f.call(9, sel::CHANGE, [srd.bits(), 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadArgument));
    }

    fn any_ap() -> impl Strategy<Value = u8> {
        0u8..8
    }

    proptest! {
        #[test]
        fn change_never_grants_more_access(from in any_ap(), to in any_ap()) {
            let m = mem(MemoryAttributes::empty());
            let start = brand(0x2000_0000, 11, from, false, 0);
            prop_assume!(m.admits(start));

            let mut f = Fixture::boot(&[
                ObjectDesc::memory(0x2000_0000, 11, MemoryAttributes::empty()),
            ]);
            let k = f.mint(Fixture::EXTRA, start);
            f.set_key(f.first, 8, k);
            let mut rasr = Region::from_brand(start).rasr;
            rasr.set_ap(to);
            let r = f.call(8, sel::CHANGE, [rasr.bits(), 0, 0, 0]);

            if r.exception().is_none() {
                let got = f.kernel.region_for_key(f.key(f.first, 1)).unwrap();
                let before = mpu::decode_ap(from).unwrap();
                let after = mpu::decode_ap(got.rasr.ap()).unwrap();
                prop_assert!(after.privileged <= before.privileged);
                prop_assert!(after.unprivileged <= before.unprivileged);
            } else {
                prop_assert!(
                    mpu::ap_is_unpredictable(to)
                        || mpu::ap_is_stronger(to, from)
                        || mpu::decode_ap(to).is_some_and(|a| a.privileged == Access::None)
                );
            }
        }
    }

    #[test]
    fn become_gate_from_undersized_memory_fails_cleanly() {
        let mut f = Fixture::boot(&[ObjectDesc::memory(
            0x2000_8000,
            5,
            MemoryAttributes::empty(),
        )]);
        let m = Fixture::EXTRA;
        let k = f.mint(m, brand(0x2000_8000, 5, AP_RW_RW, true, 0));
        f.set_key(f.first, 8, k);
        let gen_before = f.kernel.objects()[m as usize].generation;

        let r = f.call(8, sel::BECOME, [BecomeKind::Gate as u32, 0, 0, 0]);

        assert_eq!(r.exception(), Some(Exception::BadOperation));
        assert_eq!(r.data[2], BecomeKind::Gate.l2_size());
        assert_eq!(f.kernel.object(m).kind(), ObjectKind::Memory);
        assert_eq!(f.kernel.objects()[m as usize].generation, gen_before);
        assert_eq!(f.kernel.resolve(k).0, m, "key still works");
    }

    #[test]
    fn become_gate_yields_a_working_gate() {
        let (mut f, m) = setup(MemoryAttributes::empty());
        let old = f.key(f.first, 8);
        let r = f.call(8, sel::BECOME, [BecomeKind::Gate as u32, 0, 0, 0]);
        assert_eq!(r.exception(), None, "{r:?}");
        assert_eq!(f.kernel.object(m).kind(), ObjectKind::Gate);
        assert_eq!(f.kernel.resolve(old).0, 0, "memory keys are revoked");
        let gate = f.key(f.first, 1);
        assert_eq!(f.kernel.resolve(gate).0, m);
    }

    #[test]
    fn become_returns_one_key_and_bumps_the_generation_once() {
        let (mut f, m) = setup(MemoryAttributes::empty());
        let first = f.first;
        let old = f.key(first, 8);
        // Stale junk in the outgoing key registers must not come back.
        f.set_key(first, 0, old);
        f.set_key(first, 2, old);
        f.set_key(first, 3, old);
        let gen_before = f.kernel.objects()[m as usize].generation;

        let r = f.call(8, sel::BECOME, [BecomeKind::Gate as u32, 0, 0, 0]);

        assert_eq!(r.exception(), None, "{r:?}");
        assert_eq!(
            f.kernel.objects()[m as usize].generation,
            gen_before.next(),
            "exactly one generation step"
        );
        assert_eq!(f.kernel.resolve(f.key(first, 1)).0, m, "new key in 1");
        for reg in [0, 2, 3] {
            assert_eq!(f.key(first, reg), Key::NULL, "key register {reg}");
        }
    }

    #[test]
    fn refused_become_leaves_the_memory_untouched() {
        let mut f = Fixture::boot(&[ObjectDesc::memory(
            0x2000_8000,
            9,
            MemoryAttributes::empty(),
        )]);
        let m = Fixture::EXTRA;
        let k = f.mint(m, brand(0x2000_8000, 9, AP_RW_RW, true, 0));
        f.set_key(f.first, 8, k);
        let gate = f.mint(abi::well_known::OBJECT_TABLE, 0);
        f.set_key(f.first, 1, gate);
        let gen_before = f.kernel.objects()[m as usize].generation;
        let before = *f.kernel.memory(m);

        let r = f.call(8, sel::BECOME, [BecomeKind::Context as u32, 0, 0, 0]);

        assert_eq!(r.exception(), Some(Exception::BadKind));
        assert_eq!(f.kernel.objects()[m as usize].generation, gen_before);
        assert_eq!(*f.kernel.memory(m), before);
        assert_eq!(f.kernel.resolve(k), (m, k.brand), "old key still resolves");
        let r = f.call(8, sel::INSPECT, [0; 4]);
        assert_eq!(r.exception(), None, "and still works");
    }

    #[test]
    fn become_context_binds_the_reply_gate() {
        let mut f = Fixture::boot(&[
            ObjectDesc::memory(0x2000_8000, 9, MemoryAttributes::empty()),
            ObjectDesc::reply_gate(),
        ]);
        let m = Fixture::EXTRA;
        let rg = Fixture::EXTRA + 1;
        let k = f.mint(m, brand(0x2000_8000, 9, AP_RW_RW, true, 0));
        f.set_key(f.first, 8, k);

        // Not a reply gate: refused, nothing changes.
        let table = f.mint(abi::well_known::OBJECT_TABLE, 0);
        f.set_key(f.first, 1, table);
        let r = f.call(8, sel::BECOME, [BecomeKind::Context as u32, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadKind));
        assert_eq!(f.kernel.object(m).kind(), ObjectKind::Memory);

        let rgk = f.mint(rg, 0);
        f.set_key(f.first, 1, rgk);
        let r = f.call(8, sel::BECOME, [BecomeKind::Context as u32, 0, 0, 0]);
        assert_eq!(r.exception(), None, "{r:?}");
        let ctx = f.kernel.context(m);
        assert_eq!(ctx.reply_gate, rg);
        assert_eq!(ctx.priority, Priority(N_PRIORITIES as u8 - 1));
        assert!(matches!(
            f.kernel.object(rg),
            Object::ReplyGate(ReplyGate { owner: Some(o), .. }) if *o == m
        ));
    }

    #[test]
    fn become_refusals() {
        let (mut f, m) = setup(MemoryAttributes::DEVICE);
        let r = f.call(8, sel::BECOME, [7, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadArgument));
        let r = f.call(8, sel::BECOME, [BecomeKind::Gate as u32, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadOperation), "device");
        assert_eq!(f.kernel.object(m).kind(), ObjectKind::Memory);

        let (mut f, _) = setup(MemoryAttributes::empty());
        let r = f.call(
            8,
            sel::BECOME,
            [BecomeKind::Interrupt as u32, MAX_IRQS as u32, 0, 0],
        );
        assert_eq!(r.exception(), Some(Exception::BadArgument));
        let r = f.call(
            8,
            sel::BECOME,
            [BecomeKind::Interrupt as u32, 4, N_PRIORITIES as u32, 0],
        );
        assert_eq!(r.exception(), Some(Exception::BadArgument));
    }

    #[test]
    fn become_interrupt_routes_the_irq() {
        let (mut f, m) = setup(MemoryAttributes::empty());
        let r = f.call(8, sel::BECOME, [BecomeKind::Interrupt as u32, 4, 2, 0]);
        assert_eq!(r.exception(), None, "{r:?}");
        assert_eq!(f.kernel.interrupt(m).line, Line::Irq(4));
        assert_eq!(f.kernel.irqs[4], Some(m));
    }

    #[test]
    fn peek_and_poke_go_through_the_key() {
        let (mut f, _) = setup(MemoryAttributes::empty());
        arch::poke_phys(0x2000_8010, 0x1234_5678);

        let r = f.call(8, sel::PEEK, [4, 0, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(r.data[0], 0x1234_5678);

        let r = f.call(8, sel::POKE, [5, 0xCAFE_F00D, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(arch::peek_phys(0x2000_8014), 0xCAFE_F00D);

        // Past the end of the window.
        let r = f.call(8, sel::PEEK, [256, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadArgument));
    }

    #[test]
    fn peek_of_a_256_byte_region_returns_the_word_and_no_keys() {
        let mut f = Fixture::boot(&[ObjectDesc::memory(
            0x2000_8000,
            7,
            MemoryAttributes::empty(),
        )]);
        let first = f.first;
        let k = f.mint(Fixture::EXTRA, brand(0x2000_8000, 7, AP_RW_RW, true, 0));
        f.set_key(first, 8, k);
        for reg in 0..4 {
            f.set_key(first, reg, k);
        }
        arch::poke_phys(0x2000_8000, 0x600D_CAFE);

        let r = f.call(8, sel::PEEK, [0, 0, 0, 0]);

        assert_eq!(r.exception(), None);
        assert_eq!(r.data[0], 0x600D_CAFE);
        for reg in 0..4 {
            assert_eq!(f.key(first, reg), Key::NULL, "key register {reg}");
        }
    }

    #[test]
    fn bus_error_on_poke_is_reported_to_the_caller() {
        let (mut f, _) = setup(MemoryAttributes::empty());
        arch::inject_bus_error(0x2000_8008);

        let r = f.call(8, sel::POKE, [2, 0xBAD, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::Fault));
        assert_eq!(arch::peek_phys(0x2000_8008), 0);

        // The kernel carries on; neighbouring words still work.
        let r = f.call(8, sel::POKE, [3, 0x600D, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(arch::peek_phys(0x2000_800C), 0x600D);
    }

    #[test]
    fn poke_through_a_read_only_key_faults() {
        let (mut f, m) = setup(MemoryAttributes::empty());
        let ro = f.mint(m, brand(0x2000_8000, 9, AP_RO_RO, true, 0));
        f.set_key(f.first, 9, ro);
        let r = f.call(9, sel::POKE, [0, 1, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::Fault));
        assert_eq!(arch::peek_phys(0x2000_8000), 0);
        let r = f.call(9, sel::PEEK, [0, 0, 0, 0]);
        assert_eq!(r.exception(), None);
    }

    #[test]
    fn make_child_carves_a_subrange() {
        let (mut f, m) = setup(MemoryAttributes::empty());
        let slot = Fixture::EXTRA + 1;
        donate(&mut f, slot);

        let r = f.call(8, sel::MAKE_CHILD, [0x2000_8100, 0x40, 0, 0]);
        assert_eq!(r.exception(), None, "{r:?}");
        let child = f.key(f.first, 1);
        assert_eq!(f.kernel.resolve(child).0, slot);
        assert_eq!(
            f.kernel.region_for_key(child).and_then(|r| r.window()),
            P2Range::of(0x2000_8100, 5)
        );
        assert_eq!(f.kernel.memory(m).children, 1);
        assert_eq!(f.kernel.memory(slot).parent, Some(m));

        // With a child outstanding, the parent can't be split or retyped.
        donate(&mut f, Fixture::EXTRA + 2);
        let r = f.call(8, sel::SPLIT, [0; 4]);
        assert_eq!(r.exception(), Some(Exception::BadOperation));
        let r = f.call(8, sel::BECOME, [BecomeKind::Gate as u32, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadOperation));
    }

    #[test]
    fn make_child_validates_the_range() {
        let (mut f, _) = setup(MemoryAttributes::empty());
        donate(&mut f, Fixture::EXTRA + 1);
        for (base, size) in [
            (0x2000_8000, 0x30),   // not a power of two
            (0x2000_8000, 0x10),   // too small
            (0x2000_8020, 0x40),   // misaligned
            (0x2000_8000, 0x800),  // larger than the window
            (0x2000_9000, 0x40),   // outside the window
        ] {
            let r = f.call(8, sel::MAKE_CHILD, [base, size, 0, 0]);
            assert_eq!(
                r.exception(),
                Some(Exception::BadArgument),
                "base {base:#x} size {size:#x}"
            );
        }
    }
}
