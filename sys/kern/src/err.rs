// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate that
//! concern using `Result`. Object protocol handlers return
//! `Result<ReplySender, Failure>`; the dispatcher turns a `Failure` into a
//! failure message at a single point, so handlers can use `?` freely.

use abi::{Exception, Message};

/// An operation refused on behalf of unprivileged code. This is reported to
/// the requester as a failure message; it never affects the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Failure {
    pub exception: Exception,
    /// Exception-specific detail, carried in data word 2 of the message.
    pub param: u32,
}

impl Failure {
    pub fn new(exception: Exception, param: u32) -> Self {
        Self { exception, param }
    }

    pub fn message(&self) -> Message {
        Message::failure(self.exception, self.param)
    }
}

impl From<Exception> for Failure {
    fn from(exception: Exception) -> Self {
        Self::new(exception, 0)
    }
}

/// An access made on behalf of unprivileged code was refused by the memory
/// protection unit (or, in the privileged case, by the bus).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fault;

/// Convenience conversion, since faults are always reported the same way.
impl From<Fault> for Failure {
    fn from(_: Fault) -> Self {
        Exception::Fault.into()
    }
}
