// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-neutral pieces of the kernel, factored out so they can be
//! tested on the host without dragging in the rest of the kernel.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

pub mod mpu;
pub mod p2range;
pub mod plist;

pub use p2range::P2Range;
pub use plist::{Link, Links, PriorityList};
