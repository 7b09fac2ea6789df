// Copyright (c) 2023 - 2026 CoralDB Software, Inc., CoralDB GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A count/memory pair charged against the reader semaphore.
///
/// Both components are signed: the semaphore tolerates over-commit, so the
/// available pool can go negative up to the kill limit. Arithmetic is
/// component-wise and saturating; overflowing either component is a
/// programming error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderResources {
    pub count: i32,
    pub memory: i64,
}

impl ReaderResources {
    pub const fn new(count: i32, memory: i64) -> Self {
        Self { count, memory }
    }

    pub const fn with_memory(memory: i64) -> Self {
        Self { count: 0, memory }
    }

    /// True when any component is non-zero.
    pub fn non_zero(&self) -> bool {
        self.count != 0 || self.memory != 0
    }

    /// Component-wise `self >= other`.
    pub fn covers(&self, other: &ReaderResources) -> bool {
        self.count >= other.count && self.memory >= other.memory
    }
}

impl Add for ReaderResources {
    type Output = ReaderResources;

    fn add(self, rhs: ReaderResources) -> ReaderResources {
        ReaderResources {
            count: self.count.saturating_add(rhs.count),
            memory: self.memory.saturating_add(rhs.memory),
        }
    }
}

impl Sub for ReaderResources {
    type Output = ReaderResources;

    fn sub(self, rhs: ReaderResources) -> ReaderResources {
        ReaderResources {
            count: self.count.saturating_sub(rhs.count),
            memory: self.memory.saturating_sub(rhs.memory),
        }
    }
}

impl AddAssign for ReaderResources {
    fn add_assign(&mut self, rhs: ReaderResources) {
        *self = *self + rhs;
    }
}

impl SubAssign for ReaderResources {
    fn sub_assign(&mut self, rhs: ReaderResources) {
        *self = *self - rhs;
    }
}

impl fmt::Display for ReaderResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.count, self.memory)
    }
}
