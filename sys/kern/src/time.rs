// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation, measured in ticks since the
/// scheduler started. 64 bits so it never wraps in practice.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Timestamp(0);

    /// Moves this timestamp forward by one tick.
    pub fn advance(&mut self) {
        self.0 += 1;
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

impl core::ops::Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, ticks: u64) -> Timestamp {
        Timestamp(self.0 + ticks)
    }
}
