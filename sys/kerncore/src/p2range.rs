// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Naturally aligned power-of-two address ranges.

/// A naturally-aligned, power-of-two-sized range of the 32-bit address space.
///
/// The smallest range is 32 bytes, matching the smallest region the MPU can
/// describe. Base and size are packed into a single word: because the base is
/// aligned to at least 32 bytes, its bottom five bits are free to hold the
/// log2 of *half* the size. (Half, so that the full 4 GiB range fits.)
///
/// # Invariants
///
/// `base() % (2 * half_size()) == 0`, and `l2_half_size()` is in `4..=31`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct P2Range(u32);

impl P2Range {
    const L2_SIZE_MASK: u32 = 0x1F;

    /// Smallest permitted log2 half-size.
    pub const MIN_L2_HALF_SIZE: u32 = 4;

    /// Range covering the entire address space.
    pub const fn all() -> Self {
        Self(31)
    }

    /// Creates a range from a base address and log2 of half its size,
    /// returning `None` if the half-size is out of bounds or the base isn't
    /// aligned to the full size.
    pub const fn of(base: u32, l2_half_size: u32) -> Option<Self> {
        if l2_half_size < Self::MIN_L2_HALF_SIZE || l2_half_size > 31 {
            return None;
        }
        let size_mask = (2u64 << l2_half_size) - 1;
        if base as u64 & size_mask != 0 {
            return None;
        }
        Some(Self(base | l2_half_size))
    }

    pub const fn base(self) -> u32 {
        self.0 & !Self::L2_SIZE_MASK
    }

    pub const fn l2_half_size(self) -> u32 {
        self.0 & Self::L2_SIZE_MASK
    }

    pub const fn l2_size(self) -> u32 {
        self.l2_half_size() + 1
    }

    /// Size of half of the range. Unlike the full size, this always fits in a
    /// word.
    pub const fn half_size(self) -> u32 {
        1 << self.l2_half_size()
    }

    /// Address one past the end of the range, which may be `1 << 32`.
    pub const fn end(self) -> u64 {
        self.base() as u64 + (2u64 << self.l2_half_size())
    }

    pub const fn is_smallest(self) -> bool {
        self.l2_half_size() == Self::MIN_L2_HALF_SIZE
    }

    /// The lower half of this range, or `None` at minimum size.
    pub const fn bottom(self) -> Option<Self> {
        if self.is_smallest() {
            None
        } else {
            Some(Self(self.base() | (self.l2_half_size() - 1)))
        }
    }

    /// The upper half of this range, or `None` at minimum size.
    pub const fn top(self) -> Option<Self> {
        if self.is_smallest() {
            None
        } else {
            Some(Self(
                (self.base() + self.half_size()) | (self.l2_half_size() - 1),
            ))
        }
    }

    /// Checks whether `other` lies entirely within `self`.
    pub const fn contains(self, other: Self) -> bool {
        other.base() >= self.base() && other.end() <= self.end()
    }

    pub const fn contains_addr(self, addr: u32) -> bool {
        addr >= self.base() && (addr as u64) < self.end()
    }

    /// The packed encoding.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for P2Range {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "P2Range({:#010x}, 2^{})", self.base(), self.l2_size())
    }
}
