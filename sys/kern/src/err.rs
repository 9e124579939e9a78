// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Recoverable conditions are reported to the caller by value; the kernel
//! contains no unwinding mechanism. Unrecoverable conditions (a scheduler
//! with nothing to run, a violated precondition) go through `panic!` and
//! halt the system where a debugger can find them — see `fail`.

/// Errors returned by the task-manipulation entry points.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskError {
    /// A parameter was out of range: a priority past the last level, a
    /// stack too small to hold the initial frame, a task id that was never
    /// issued, or a task table with no free slots.
    InvalidArgument,
    /// The operation does not apply to the task's current state, e.g.
    /// adding a task that is not stopped, or unsuspending one that is not
    /// suspended.
    WrongState,
}
