// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keys: unforgeable references to kernel objects.
//!
//! A key names an object table entry by index, and records the generation of
//! that entry at the time the key was made. Bumping the entry's generation
//! thus revokes every copy of the key at once, without the kernel having to
//! find them: a key whose generation doesn't match designates the Null object
//! instead.

use abi::Brand;

/// Index of an entry in the object table.
pub type TableIndex = u32;

/// Revocation counter of an object table entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Generation(u32);

impl Generation {
    pub const ZERO: Self = Self(0);

    /// Produces the following generation, wrapping around.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Produces the following generation, or `None` if the counter would
    /// wrap back to a value that old keys may still carry.
    pub fn checked_next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl From<u32> for Generation {
    fn from(x: u32) -> Self {
        Self(x)
    }
}

/// A capability. Keys are plain values; holding one is what grants access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Key {
    pub index: TableIndex,
    pub generation: Generation,
    /// Interpreted only by the designated object.
    pub brand: Brand,
}

impl Key {
    /// Key to the Null object, which is always valid.
    pub const NULL: Self = Self {
        index: abi::well_known::NULL,
        generation: Generation::ZERO,
        brand: 0,
    };
}

impl Default for Key {
    fn default() -> Self {
        Self::NULL
    }
}
