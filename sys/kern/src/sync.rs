// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutual-exclusion resources with priority-ordered waiters.
//!
//! A [`Resource`] is the kernel's one blocking primitive: a non-recursive
//! mutex that tracks its owning task and queues contenders in priority
//! order, most important first (FIFO among equals). Release does not hand
//! ownership over directly — it frees the resource and revives the head
//! waiter at the front of its ready queue, and the waiter re-runs its
//! acquire attempt when scheduled. There is **no priority inheritance**:
//! an important task blocked on a resource held at low priority waits as
//! long as the low-priority holder takes.
//!
//! `acquire` and `release` are task-context only; they assume a current
//! task and `acquire` can deschedule the caller. Interrupt handlers that
//! need to move data should use the FIFO or mailbox queues instead.

use core::cell::UnsafeCell;

use crate::kernel::{with_kernel, Kernel, NextTask};
use crate::task::{TaskId, TaskState, TaskTable};

/// Ownership and waiter state of one resource.
#[derive(Debug)]
pub(crate) struct ResourceState {
    /// The task holding the resource; `None` when free.
    owner: Option<TaskId>,
    /// Head of the priority-ordered waiter queue, threaded through the
    /// waiting tasks' `link` fields.
    wait_head: Option<TaskId>,
}

impl ResourceState {
    pub(crate) const fn new() -> Self {
        Self {
            owner: None,
            wait_head: None,
        }
    }
}

impl Kernel {
    /// One attempt of the acquire loop. Returns `true` once the current
    /// task owns `res`; otherwise the task has been marked `Waiting` and
    /// queued, and the caller must yield and retry after it resumes.
    pub(crate) fn acquire_attempt(&mut self, res: &mut ResourceState) -> bool {
        let cur = self.current_id();
        match res.owner {
            None => {
                res.owner = Some(cur);
                true
            }
            Some(owner) if owner == cur => {
                // Trivial re-entry: the owner asking again just proceeds.
                // There is no recursion count; the first release frees it.
                true
            }
            Some(_) => {
                self.tasks.task_mut(cur).state = TaskState::Waiting;
                insert_waiter(&mut self.tasks, &mut res.wait_head, cur);
                false
            }
        }
    }

    /// Releases `res` if the current task owns it; a non-owner's release
    /// is a silent no-op. Revives the head waiter, if any, at the head of
    /// its ready queue, and reports whether the caller should yield to it.
    pub(crate) fn release_resource(
        &mut self,
        res: &mut ResourceState,
    ) -> NextTask {
        let cur = self.current_id();
        if res.owner != Some(cur) {
            return NextTask::Same;
        }
        res.owner = None;

        if let Some(first) = res.wait_head {
            res.wait_head = self.tasks.task(first).link;
            let t = self.tasks.task_mut(first);
            t.link = None;
            t.state = TaskState::Ready;
            crate::sched::ready_push_head(&mut self.tasks, &mut self.sched, first);

            let revived = self.tasks.task(first).priority;
            if revived.is_more_important_than(self.tasks.task(cur).priority) {
                return NextTask::Other;
            }
        }
        NextTask::Same
    }
}

/// Inserts `id` into a waiter queue at the unique position that keeps the
/// queue sorted by increasing priority number. A waiter tying an
/// incumbent's priority goes after it.
fn insert_waiter(
    tasks: &mut TaskTable,
    head: &mut Option<TaskId>,
    id: TaskId,
) {
    let prio = tasks.task(id).priority;

    match *head {
        None => {
            tasks.task_mut(id).link = None;
            *head = Some(id);
        }
        Some(h) if prio.is_more_important_than(tasks.task(h).priority) => {
            tasks.task_mut(id).link = Some(h);
            *head = Some(id);
        }
        Some(h) => {
            let mut cursor = h;
            loop {
                let next = tasks.task(cursor).link;
                match next {
                    Some(n)
                        if !prio
                            .is_more_important_than(tasks.task(n).priority) =>
                    {
                        cursor = n;
                    }
                    _ => {
                        tasks.task_mut(id).link = next;
                        tasks.task_mut(cursor).link = Some(id);
                        break;
                    }
                }
            }
        }
    }
}

/// A mutual-exclusion resource, suitable for a `static`.
///
/// ```ignore
/// static SPI_BUS: Resource = Resource::new();
///
/// SPI_BUS.acquire();
/// // ... exclusive section ...
/// SPI_BUS.release();
/// ```
pub struct Resource {
    state: UnsafeCell<ResourceState>,
}

// Safety: the state cell is only touched inside `with_kernel`, which masks
// interrupts on our single core; accesses cannot overlap.
unsafe impl Sync for Resource {}

impl Resource {
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(ResourceState::new()),
        }
    }

    /// Blocks until the current task owns the resource. Acquiring a
    /// resource the task already owns returns immediately. Task context
    /// only.
    pub fn acquire(&self) {
        loop {
            let owned = with_kernel(|k| {
                // Safety: inside with_kernel; see the Sync rationale.
                let state = unsafe { &mut *self.state.get() };
                let owned = k.acquire_attempt(state);
                if !owned {
                    crate::arch::pend_context_switch();
                }
                owned
            });
            if owned {
                return;
            }
            // We were revived by a release; contend again. Another task
            // may have slipped in, in which case we go back to waiting.
        }
    }

    /// Releases the resource. Only the owner's release has any effect.
    /// Task context only.
    pub fn release(&self) {
        with_kernel(|k| {
            // Safety: inside with_kernel; see the Sync rationale.
            let state = unsafe { &mut *self.state.get() };
            if k.release_resource(state) == NextTask::Other {
                crate::arch::pend_context_switch();
            }
        });
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::{leaked_stack, nop_entry};
    use crate::task::{Priority, IDLE_PRIORITY};

    fn spawn(k: &mut Kernel, name: &'static str, prio: u8) -> TaskId {
        let id = k
            .init_task(name, leaked_stack(128), Priority(prio), nop_entry, 0)
            .unwrap();
        k.add_task(id).unwrap();
        id
    }

    fn waiter_names(k: &Kernel, res: &ResourceState) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut cursor = res.wait_head;
        while let Some(id) = cursor {
            out.push(k.tasks.task(id).name());
            cursor = k.tasks.task(id).link;
        }
        out
    }

    /// Makes `id` the running task: revives it if suspended, then parks
    /// more important tasks (idle excepted; idle just yields through).
    fn run_task(k: &mut Kernel, id: TaskId) {
        if k.tasks.task(id).state() == TaskState::Suspended {
            let _ = k.unsuspend(id).unwrap();
        }
        loop {
            let cur = k.current_id();
            if cur == id {
                return;
            }
            if k.tasks.task(cur).priority() == IDLE_PRIORITY {
                k.on_reschedule();
            } else {
                k.suspend_current();
                k.on_reschedule();
            }
        }
    }

    #[test]
    fn waiters_queue_in_priority_order_fifo_within_level() {
        let mut k = Kernel::new();
        spawn(&mut k, "idle", IDLE_PRIORITY.0);
        let owner = spawn(&mut k, "owner", 14);
        let mid = spawn(&mut k, "mid", 6);
        let late_high = spawn(&mut k, "late_high", 2);
        let tie_a = spawn(&mut k, "tie_a", 6);
        let low = spawn(&mut k, "low", 9);

        k.start_first();
        let mut res = ResourceState::new();

        run_task(&mut k, owner);
        assert!(k.acquire_attempt(&mut res));

        // Contenders pile in, in an order unrelated to priority.
        for id in [mid, low, tie_a, late_high] {
            run_task(&mut k, id);
            assert!(!k.acquire_attempt(&mut res));
            k.on_reschedule();
        }

        assert_eq!(
            waiter_names(&k, &res),
            ["late_high", "mid", "tie_a", "low"]
        );
    }

    #[test]
    fn release_hands_to_waiters_most_important_first() {
        // Scenario: owner at 8 holds R; P1 (prio 6) tries first, then P2
        // (prio 4). Releases must serve P2, then P1.
        let mut k = Kernel::new();
        spawn(&mut k, "idle", IDLE_PRIORITY.0);
        let owner = spawn(&mut k, "owner", 8);
        let p1 = spawn(&mut k, "p1", 6);
        let p2 = spawn(&mut k, "p2", 4);

        k.start_first();
        let mut res = ResourceState::new();

        run_task(&mut k, owner);
        assert!(k.acquire_attempt(&mut res));

        // P1 attempts first, then P2; both block.
        run_task(&mut k, p1);
        assert!(!k.acquire_attempt(&mut res));
        k.on_reschedule();
        run_task(&mut k, p2);
        assert!(!k.acquire_attempt(&mut res));
        k.on_reschedule();

        // Owner releases: P2 (more important) is revived, preempts owner,
        // and wins the retry.
        run_task(&mut k, owner);
        assert_eq!(k.release_resource(&mut res), NextTask::Other);
        k.on_reschedule();
        assert_eq!(k.current, Some(p2));
        assert!(k.acquire_attempt(&mut res));

        // P2's release revives P1 but does not preempt — P1 is *less*
        // important. P1 wins the resource when it next runs.
        assert_eq!(k.release_resource(&mut res), NextTask::Same);
        assert_eq!(k.tasks.task(p1).state(), TaskState::Ready);
        k.retire_current();
        k.on_reschedule();
        assert_eq!(k.current, Some(p1));
        assert!(k.acquire_attempt(&mut res));
        assert!(waiter_names(&k, &res).is_empty());
    }

    #[test]
    fn reacquiring_an_owned_resource_is_trivial() {
        let mut k = Kernel::new();
        spawn(&mut k, "idle", IDLE_PRIORITY.0);
        let t = spawn(&mut k, "t", 5);
        k.start_first();
        run_task(&mut k, t);

        let mut res = ResourceState::new();
        assert!(k.acquire_attempt(&mut res));
        assert!(k.acquire_attempt(&mut res));
        assert_eq!(k.tasks.task(t).state(), TaskState::Running);
    }

    #[test]
    fn only_the_owner_can_release() {
        let mut k = Kernel::new();
        spawn(&mut k, "idle", IDLE_PRIORITY.0);
        let owner = spawn(&mut k, "owner", 8);
        let thief = spawn(&mut k, "thief", 5);

        k.start_first();
        run_task(&mut k, owner);
        let mut res = ResourceState::new();
        assert!(k.acquire_attempt(&mut res));
        let _ = k.unsuspend(thief);

        // A non-owner's release changes nothing, silently.
        run_task(&mut k, thief);
        assert_eq!(k.release_resource(&mut res), NextTask::Same);
        assert_eq!(res.owner, Some(owner));

        // The owner's release, with nobody waiting, just frees it.
        run_task(&mut k, owner);
        assert_eq!(k.release_resource(&mut res), NextTask::Same);
        assert_eq!(res.owner, None);
    }

    #[test]
    fn releasing_a_free_resource_is_inert() {
        let mut k = Kernel::new();
        spawn(&mut k, "idle", IDLE_PRIORITY.0);
        let t = spawn(&mut k, "t", 5);
        k.start_first();
        run_task(&mut k, t);

        let mut res = ResourceState::new();
        assert_eq!(k.release_resource(&mut res), NextTask::Same);
        assert_eq!(res.owner, None);
    }

    #[test]
    fn released_waiter_enters_ready_queue_at_the_head() {
        // A revived waiter must run before equal-priority peers already
        // rotating at its level.
        let mut k = Kernel::new();
        spawn(&mut k, "idle", IDLE_PRIORITY.0);
        let owner = spawn(&mut k, "owner", 3);
        let waiter = spawn(&mut k, "waiter", 5);
        let peer = spawn(&mut k, "peer", 5);

        k.start_first();
        assert_eq!(k.current, Some(owner));
        let mut res = ResourceState::new();
        assert!(k.acquire_attempt(&mut res));
        k.sleep_current(3);
        k.on_reschedule();

        // The waiter blocks on the resource; the peer keeps the level
        // busy until the owner's deadline.
        assert_eq!(k.current, Some(waiter));
        assert!(!k.acquire_attempt(&mut res));
        k.on_reschedule();
        assert_eq!(k.current, Some(peer));
        k.on_tick();
        k.on_tick();
        k.on_tick();
        assert_eq!(k.current, Some(owner));

        // Release puts the waiter at the head of level 5, in front of the
        // peer that has been rotating there all along.
        assert_eq!(k.release_resource(&mut res), NextTask::Same);
        k.retire_current();
        k.on_reschedule();
        assert_eq!(k.current, Some(waiter));
    }
}
