// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler core: ready queues, the sleep queue, and pick-next-task.
//!
//! Policy is strict priority preemption with FIFO round-robin inside a
//! priority level: the task that runs is always the head of the non-empty
//! ready queue with the smallest priority number. Nothing here mitigates
//! priority inversion; a high-priority task blocked on a resource held at
//! low priority waits as long as it takes.
//!
//! Two details are easy to miss:
//!
//! - Tasks that just woke from sleep or were just handed a resource enter
//!   their ready queue at the *head*, ahead of peers waiting in
//!   round-robin, which keeps the latency of timed and unblocked work
//!   reasonable. Time-slice rotation and plain adds use the tail.
//! - `hint_priority` is a lower bound on the numeric level of the most
//!   important ready task. It may be stale in the conservative direction
//!   (too low, causing a short scan over empty levels) but never in the
//!   unsafe direction; every insertion lowers it as needed and every scan
//!   re-raises it.

use crate::task::{TaskId, TaskState, TaskTable, NUM_PRIORITIES};
use crate::time::Timestamp;

/// One FIFO of ready tasks at a single priority level, threaded through
/// the member tasks' `link` fields.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Queue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
}

impl Queue {
    const EMPTY: Queue = Queue {
        head: None,
        tail: None,
    };
}

/// Scheduler state: one ready queue per priority level, the deadline-
/// ordered sleep queue, and the scan hint.
#[derive(Debug)]
pub(crate) struct Scheduler {
    ready: [Queue; NUM_PRIORITIES],
    sleep_head: Option<TaskId>,
    hint_priority: u8,
}

impl Scheduler {
    pub(crate) const fn new() -> Self {
        Self {
            ready: [Queue::EMPTY; NUM_PRIORITIES],
            sleep_head: None,
            hint_priority: 0,
        }
    }
}

fn lower_hint(sched: &mut Scheduler, prio: u8) {
    if prio < sched.hint_priority {
        sched.hint_priority = prio;
    }
}

/// Links `id` at the head of the ready queue for its priority. Used for
/// tasks that just woke from sleep or were just handed a resource.
pub(crate) fn ready_push_head(
    tasks: &mut TaskTable,
    sched: &mut Scheduler,
    id: TaskId,
) {
    let prio = tasks.task(id).priority.0;
    lower_hint(sched, prio);

    let q = &mut sched.ready[usize::from(prio)];
    tasks.task_mut(id).link = q.head;
    if q.head.is_none() {
        q.tail = Some(id);
    }
    q.head = Some(id);
}

/// Links `id` at the tail of the ready queue for its priority. Used for
/// time-slice rotation and ordinary adds.
pub(crate) fn ready_push_tail(
    tasks: &mut TaskTable,
    sched: &mut Scheduler,
    id: TaskId,
) {
    let prio = tasks.task(id).priority.0;
    lower_hint(sched, prio);

    tasks.task_mut(id).link = None;
    let q = &mut sched.ready[usize::from(prio)];
    match q.tail {
        None => {
            q.head = Some(id);
            q.tail = Some(id);
        }
        Some(tail) => {
            tasks.task_mut(tail).link = Some(id);
            q.tail = Some(id);
        }
    }
}

/// Unlinks and returns the most important ready task, scanning from the
/// hint level toward the idle level.
///
/// In a correctly configured system the idle task is always ready, so the
/// scan cannot come up dry; if it does, kernel state is corrupt and we
/// halt.
pub(crate) fn take_highest_ready(
    tasks: &mut TaskTable,
    sched: &mut Scheduler,
) -> TaskId {
    for prio in usize::from(sched.hint_priority)..NUM_PRIORITIES {
        sched.hint_priority = prio as u8;
        if let Some(id) = sched.ready[prio].head {
            let next = tasks.task(id).link;
            sched.ready[prio].head = next;
            if next.is_none() {
                sched.ready[prio].tail = None;
            }
            tasks.task_mut(id).link = None;
            return id;
        }
    }
    panic!("no runnable task");
}

/// Inserts `id` into the sleep queue, keeping it non-decreasing by wakeup
/// deadline. A task tying an incumbent's deadline goes after it, so
/// equal-deadline sleepers wake in the order they went to sleep.
pub(crate) fn sleep_insert(
    tasks: &mut TaskTable,
    sched: &mut Scheduler,
    id: TaskId,
) {
    let deadline = tasks.task(id).wakeup_tick;

    match sched.sleep_head {
        None => {
            tasks.task_mut(id).link = None;
            sched.sleep_head = Some(id);
        }
        Some(head) if tasks.task(head).wakeup_tick > deadline => {
            tasks.task_mut(id).link = Some(head);
            sched.sleep_head = Some(id);
        }
        Some(head) => {
            let mut cursor = head;
            loop {
                let next = tasks.task(cursor).link;
                match next {
                    Some(n) if tasks.task(n).wakeup_tick <= deadline => {
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

/// Moves every sleeper whose deadline has arrived to the head of its ready
/// queue. Sleepers wake in deadline order because the queue is kept
/// sorted.
pub(crate) fn wake_expired(
    tasks: &mut TaskTable,
    sched: &mut Scheduler,
    now: Timestamp,
) {
    while let Some(head) = sched.sleep_head {
        if tasks.task(head).wakeup_tick > now {
            return;
        }
        sched.sleep_head = tasks.task(head).link;
        let t = tasks.task_mut(head);
        t.link = None;
        t.state = TaskState::Ready;
        ready_push_head(tasks, sched, head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::{leaked_stack, nop_entry};
    use crate::kernel::Kernel;
    use crate::task::Priority;

    fn spawn(k: &mut Kernel, name: &'static str, prio: u8) -> TaskId {
        let id = k
            .init_task(name, leaked_stack(128), Priority(prio), nop_entry, 0)
            .unwrap();
        k.add_task(id).unwrap();
        id
    }

    #[test]
    fn fifo_within_a_priority_level() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 5);
        let c = spawn(&mut k, "c", 5);

        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), a);
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), b);
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), c);
    }

    #[test]
    fn head_insertion_jumps_the_round_robin() {
        let mut k = Kernel::new();
        let a = spawn(&mut k, "a", 5);
        let b = spawn(&mut k, "b", 5);

        let woken = k
            .init_task("w", leaked_stack(128), Priority(5), nop_entry, 0)
            .unwrap();
        k.add_task(woken).unwrap();
        // Pull it back out and reinsert at the head, as a sleep wakeup
        // would.
        let got = take_highest_ready(&mut k.tasks, &mut k.sched);
        assert_eq!(got, a);
        ready_push_tail(&mut k.tasks, &mut k.sched, a);
        let got = take_highest_ready(&mut k.tasks, &mut k.sched);
        assert_eq!(got, b);
        ready_push_head(&mut k.tasks, &mut k.sched, b);

        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), b);
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), woken);
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), a);
    }

    #[test]
    fn smaller_priority_number_always_wins() {
        let mut k = Kernel::new();
        let _low = spawn(&mut k, "low", 9);
        let high = spawn(&mut k, "high", 2);
        let _mid = spawn(&mut k, "mid", 6);

        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), high);
    }

    #[test]
    fn idle_is_picked_only_when_alone() {
        let mut k = Kernel::new();
        let idle = spawn(&mut k, "idle", 15);
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), idle);
        ready_push_tail(&mut k.tasks, &mut k.sched, idle);

        let worker = spawn(&mut k, "worker", 7);
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), worker);
    }

    #[test]
    #[should_panic(expected = "no runnable task")]
    fn empty_ready_queues_are_fatal() {
        let mut k = Kernel::new();
        let _ = take_highest_ready(&mut k.tasks, &mut k.sched);
    }

    #[test]
    fn hint_is_conservative_after_highpri_task_leaves() {
        let mut k = Kernel::new();
        let high = spawn(&mut k, "high", 1);
        let low = spawn(&mut k, "low", 12);

        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), high);
        // The hint now sits at 1 with level 1 empty; the next take must
        // still find the low task.
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), low);
        // And a head insert at a more important level must pull the hint
        // back down.
        ready_push_head(&mut k.tasks, &mut k.sched, high);
        ready_push_tail(&mut k.tasks, &mut k.sched, low);
        assert_eq!(take_highest_ready(&mut k.tasks, &mut k.sched), high);
    }

    fn sleep_until(k: &mut Kernel, id: TaskId, deadline: u64) {
        let t = k.tasks.task_mut(id);
        t.wakeup_tick = Timestamp::from(deadline);
        t.state = TaskState::Sleeping;
        sleep_insert(&mut k.tasks, &mut k.sched, id);
    }

    fn sleep_queue_deadlines(k: &Kernel) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cursor = k.sched.sleep_head;
        while let Some(id) = cursor {
            out.push(k.tasks.task(id).wakeup_tick.into());
            cursor = k.tasks.task(id).link;
        }
        out
    }

    #[test]
    fn sleep_queue_stays_sorted_for_any_insertion_order() {
        let mut k = Kernel::new();
        let deadlines = [9u64, 3, 14, 3, 7, 1, 9];
        let ids: Vec<TaskId> = deadlines
            .iter()
            .map(|_| {
                k.init_task(
                    "s",
                    leaked_stack(128),
                    Priority(4),
                    nop_entry,
                    0,
                )
                .unwrap()
            })
            .collect();
        for (&id, &d) in ids.iter().zip(&deadlines) {
            sleep_until(&mut k, id, d);
        }

        let q = sleep_queue_deadlines(&k);
        let mut sorted = deadlines.to_vec();
        sorted.sort_unstable();
        assert_eq!(q, sorted);
    }

    #[test]
    fn equal_deadlines_wake_in_sleep_order() {
        let mut k = Kernel::new();
        let first = k
            .init_task("first", leaked_stack(128), Priority(4), nop_entry, 0)
            .unwrap();
        let second = k
            .init_task("second", leaked_stack(128), Priority(4), nop_entry, 0)
            .unwrap();
        sleep_until(&mut k, first, 5);
        sleep_until(&mut k, second, 5);

        // Ties sit in the sleep queue in the order the tasks went to
        // sleep. Waking pushes each to the ready-queue *head*, so a batch
        // woken by one tick lands in reverse of that order.
        wake_expired(&mut k.tasks, &mut k.sched, Timestamp::from(5));
        let a = take_highest_ready(&mut k.tasks, &mut k.sched);
        let b = take_highest_ready(&mut k.tasks, &mut k.sched);
        assert_eq!((a, b), (second, first));
    }

    #[test]
    fn wake_expired_moves_exactly_the_due_tasks() {
        let mut k = Kernel::new();
        let ids: Vec<TaskId> = (0..4)
            .map(|_| {
                k.init_task(
                    "s",
                    leaked_stack(128),
                    Priority(4),
                    nop_entry,
                    0,
                )
                .unwrap()
            })
            .collect();
        for (i, &id) in ids.iter().enumerate() {
            sleep_until(&mut k, id, (i as u64 + 1) * 2); // 2, 4, 6, 8
        }

        wake_expired(&mut k.tasks, &mut k.sched, Timestamp::from(5));
        assert_eq!(sleep_queue_deadlines(&k), [6, 8]);
        assert_eq!(k.tasks.task(ids[0]).state, TaskState::Ready);
        assert_eq!(k.tasks.task(ids[1]).state, TaskState::Ready);
        assert_eq!(k.tasks.task(ids[2]).state, TaskState::Sleeping);

        // Advancing past everything drains the queue.
        wake_expired(&mut k.tasks, &mut k.sched, Timestamp::from(100));
        assert!(sleep_queue_deadlines(&k).is_empty());
    }
}
