// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M MPU register images and the access rules they encode.
//!
//! Memory keys carry a complete `RBAR`/`RASR` pair as their brand, so most of
//! the kernel's memory policy boils down to taking these images apart and
//! comparing fields. That lives here, where it can be tested on the host.

use crate::P2Range;

bitfield::bitfield! {
    /// Region Attribute and Size Register image.
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct Rasr(u32);
    impl Debug;
    pub xn, set_xn: 28;
    pub u8, ap, set_ap: 26, 24;
    pub u8, tex, set_tex: 21, 19;
    pub s, set_s: 18;
    pub c, set_c: 17;
    pub b, set_b: 16;
    pub u8, srd, set_srd: 15, 8;
    pub u8, size, set_size: 5, 1;
    pub enable, set_enable: 0;
}

bitfield::bitfield! {
    /// Region Base Address Register image.
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct Rbar(u32);
    impl Debug;
    pub addr_27, set_addr_27: 31, 5;
    pub valid, set_valid: 4;
    pub u8, region, set_region: 3, 0;
}

impl Rasr {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

impl Rbar {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

/// Bits of the RASR that are reserved by the architecture.
pub const RASR_RESERVED: u32 = 0xE8C0_00C0;

/// Bits of the RASR that a holder may choose: everything but the size, the
/// enable bit and the reserved bits.
pub const RASR_ATTRIBUTES: u32 = 0x173F_FF00;

/// Bits of the RBAR that select a region number rather than an address.
pub const RBAR_REGION_SELECT: u32 = 0x1F;

/// Smallest region size for which sub-regions may be disabled.
pub const MIN_L2_SIZE_FOR_SRD: u32 = 8;

/// An MPU region: the pair of register images loaded for one region number.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    pub rbar: Rbar,
    pub rasr: Rasr,
}

impl Region {
    /// Splits a 64-bit memory brand into its register images: RBAR in the low
    /// word, RASR in the high word.
    pub const fn from_brand(brand: u64) -> Self {
        Self {
            rbar: Rbar(brand as u32),
            rasr: Rasr((brand >> 32) as u32),
        }
    }

    pub fn brand(&self) -> u64 {
        u64::from(self.rasr.0) << 32 | u64::from(self.rbar.0)
    }

    /// Builds a region covering `range` with the attribute bits of `rasr`.
    pub fn for_range(range: P2Range, rasr: Rasr) -> Self {
        let mut rbar = Rbar(0);
        rbar.set_addr_27(range.base() >> 5);
        let mut rasr = Rasr(rasr.0 & RASR_ATTRIBUTES);
        rasr.set_size(range.l2_half_size() as u8);
        rasr.set_enable(true);
        Self { rbar, rasr }
    }

    /// Address window described by the images, or `None` if the size field is
    /// too small to describe or the base isn't aligned to it.
    pub fn window(&self) -> Option<P2Range> {
        P2Range::of(self.rbar.addr_27() << 5, u32::from(self.rasr.size()))
    }

    /// Decides whether this region permits an access to `addr`.
    ///
    /// Returns `None` if the region doesn't apply to the address at all:
    /// it's disabled, the address is outside the window, or it falls in a
    /// disabled sub-region. Otherwise returns whether the access permissions
    /// allow it.
    pub fn permits(&self, addr: u32, write: bool, privileged: bool) -> Option<bool> {
        if !self.rasr.enable() {
            return None;
        }
        let window = self.window()?;
        if !window.contains_addr(addr) {
            return None;
        }
        if window.l2_size() >= MIN_L2_SIZE_FOR_SRD {
            let sub = (addr - window.base()) >> (window.l2_size() - 3);
            if self.rasr.srd() & (1 << sub) != 0 {
                return None;
            }
        }
        let Some(ap) = decode_ap(self.rasr.ap()) else {
            return Some(false);
        };
        let level = if privileged { ap.privileged } else { ap.unprivileged };
        Some(if write {
            level == Access::Write
        } else {
            level != Access::None
        })
    }
}

/// Checks a single-word access against a set of loaded regions the way the
/// MPU does: the highest-numbered region that applies decides. With no
/// applicable region, privileged accesses fall through to the default memory
/// map and unprivileged ones fault.
pub fn check_access(
    regions: &[Option<Region>],
    addr: u32,
    write: bool,
    privileged: bool,
) -> bool {
    regions
        .iter()
        .rev()
        .flatten()
        .find_map(|r| r.permits(addr, write, privileged))
        .unwrap_or(privileged)
}

/// Level of access granted to one privilege level.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Access {
    None,
    Read,
    Write,
}

/// Decoded AP field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SplitAccess {
    pub privileged: Access,
    pub unprivileged: Access,
}

/// Checks whether an AP encoding is architecturally unpredictable (ARMv7-M
/// ARM table B3-15).
pub fn ap_is_unpredictable(ap: u8) -> bool {
    ap > 0b111 || ap == 0b100
}

/// Decodes an AP field, returning `None` for unpredictable encodings.
pub fn decode_ap(ap: u8) -> Option<SplitAccess> {
    let (privileged, unprivileged) = match ap {
        0b000 => (Access::None, Access::None),
        0b001 => (Access::Write, Access::None),
        0b010 => (Access::Write, Access::Read),
        0b011 => (Access::Write, Access::Write),
        0b101 => (Access::Read, Access::None),
        0b110 | 0b111 => (Access::Read, Access::Read),
        _ => return None,
    };
    Some(SplitAccess {
        privileged,
        unprivileged,
    })
}

/// Checks whether `a` grants more access than `b` at either privilege level.
/// Unpredictable encodings are treated as stronger than anything.
pub fn ap_is_stronger(a: u8, b: u8) -> bool {
    match (decode_ap(a), decode_ap(b)) {
        (Some(da), Some(db)) => {
            da.privileged > db.privileged || da.unprivileged > db.unprivileged
        }
        _ => true,
    }
}
