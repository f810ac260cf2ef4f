//! # Preemptive Priority Scheduler
//!
//! A fixed set of priority levels, each an intrusive doubly-linked ready
//! queue threaded through the [`Task`] itself — the same avoid-a-second-
//! allocator trick the allocators in this workspace use for their free
//! lists, applied here to queue membership instead. [`Scheduler::pick_next`]
//! always takes the head of the highest non-empty queue, so within a
//! priority level tasks run round-robin and across levels higher priority
//! always preempts lower.
//!
//! The scheduler itself holds no locks; callers are expected to guard it
//! with [`kernel_sync::SpinMutex`] (see [`SchedulerLock`]) and to run the
//! actual stack swap through [`kernel_context::switch_to`] once they have
//! decided, under that lock, which task runs next.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

use core::ptr::NonNull;
use kernel_context::Context;

pub const NUM_PRIORITIES: usize = 8;
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// A [`Scheduler`] behind the workspace's spinlock, the form every caller
/// outside unit tests actually holds.
pub type SchedulerLock = kernel_sync::SpinMutex<Scheduler>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("priority level {0} is out of range (0..{NUM_PRIORITIES})")]
    InvalidPriority(u8),
}

/// Priority level; `0` is lowest, `NUM_PRIORITIES - 1` highest.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Priority(u8);

impl Priority {
    /// # Errors
    /// [`SchedulerError::InvalidPriority`] if `level >= NUM_PRIORITIES`.
    pub fn new(level: u8) -> Result<Self, SchedulerError> {
        if usize::from(level) >= NUM_PRIORITIES {
            return Err(SchedulerError::InvalidPriority(level));
        }
        Ok(Self(level))
    }

    #[must_use]
    pub const fn level(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn lowest() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn highest() -> Self {
        Self((NUM_PRIORITIES - 1) as u8)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
}

/// Why a [`Task`] is currently [`TaskState::Blocked`]. Cleared on
/// [`Scheduler::unblock`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockReason {
    /// Waiting for room in, or a message on, an IPC conduit.
    Conduit,
    /// Waiting for a wakeup deadline (`TaskState::Sleeping` uses this too).
    Timer,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub u32);

/// Bitmask of logical CPUs a [`Task`] is allowed to run on. [`CpuMask::ALL`]
/// (the default) imposes no restriction; [`Scheduler::pick_next`] skips any
/// task whose mask excludes the requesting CPU.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const ALL: Self = Self(u64::MAX);

    #[must_use]
    pub const fn single(cpu: u32) -> Self {
        Self(1u64 << (cpu & 63))
    }

    #[must_use]
    pub const fn allows(self, cpu: u32) -> bool {
        self.0 & (1u64 << (cpu & 63)) != 0
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// A schedulable unit of execution. Owns its saved register context and its
/// own ready-queue link pointers; everything else (address space, open
/// conduits) lives one layer up, in whatever struct embeds a `Task`.
pub struct Task {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub priority: Priority,
    pub state: TaskState,
    pub block_reason: Option<BlockReason>,
    pub affinity: CpuMask,
    pub time_slice: u32,
    pub context: Context,
    ready_prev: Option<NonNull<Task>>,
    ready_next: Option<NonNull<Task>>,
}

impl Task {
    #[must_use]
    pub const fn new(id: TaskId, priority: Priority, context: Context) -> Self {
        Self {
            id,
            parent: None,
            priority,
            state: TaskState::Ready,
            block_reason: None,
            affinity: CpuMask::ALL,
            time_slice: DEFAULT_TIME_SLICE,
            context,
            ready_prev: None,
            ready_next: None,
        }
    }

    #[must_use]
    pub const fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub const fn with_affinity(mut self, affinity: CpuMask) -> Self {
        self.affinity = affinity;
        self
    }
}

#[derive(Default)]
struct ReadyQueue {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
    len: usize,
}

impl ReadyQueue {
    unsafe fn push_back(&mut self, mut task: NonNull<Task>) {
        unsafe {
            task.as_mut().ready_prev = self.tail;
            task.as_mut().ready_next = None;
        }
        match self.tail {
            Some(mut t) => unsafe { t.as_mut().ready_next = Some(task) },
            None => self.head = Some(task),
        }
        self.tail = Some(task);
        self.len += 1;
    }

    unsafe fn pop_front(&mut self) -> Option<NonNull<Task>> {
        let mut head = self.head?;
        let next = unsafe { head.as_ref().ready_next };
        self.head = next;
        match next {
            Some(mut n) => unsafe { n.as_mut().ready_prev = None },
            None => self.tail = None,
        }
        unsafe {
            head.as_mut().ready_prev = None;
            head.as_mut().ready_next = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Unlink `task` from wherever it sits in the queue. No-op if `task`
    /// is not actually linked into this queue.
    unsafe fn remove(&mut self, mut task: NonNull<Task>) {
        let (prev, next) = unsafe { (task.as_ref().ready_prev, task.as_ref().ready_next) };
        match prev {
            Some(mut p) => unsafe { p.as_mut().ready_next = next },
            None if self.head == Some(task) => self.head = next,
            None => return,
        }
        match next {
            Some(mut n) => unsafe { n.as_mut().ready_prev = prev },
            None if self.tail == Some(task) => self.tail = prev,
            None => {}
        }
        unsafe {
            task.as_mut().ready_prev = None;
            task.as_mut().ready_next = None;
        }
        self.len -= 1;
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    const fn len(&self) -> usize {
        self.len
    }
}

/// Multi-priority ready-queue scheduler. One [`ReadyQueue`] per priority
/// level plus the task currently running and a fallback idle task to hand
/// out when every queue is empty.
pub struct Scheduler {
    queues: [ReadyQueue; NUM_PRIORITIES],
    current: Option<NonNull<Task>>,
    idle: NonNull<Task>,
}

unsafe impl Send for Scheduler {}

impl Scheduler {
    #[must_use]
    pub fn new(idle: NonNull<Task>) -> Self {
        Self {
            queues: core::array::from_fn(|_| ReadyQueue::default()),
            current: None,
            idle,
        }
    }

    /// Mark `task` ready and enqueue it at the back of its priority level.
    pub fn enqueue(&mut self, mut task: NonNull<Task>) {
        unsafe {
            task.as_mut().state = TaskState::Ready;
            let level = task.as_ref().priority.level() as usize;
            self.queues[level].push_back(task);
        }
    }

    /// Take `task` out of its ready queue without changing its state,
    /// for callers transitioning it to `Blocked`/`Sleeping`/`Zombie`
    /// themselves.
    pub fn dequeue(&mut self, task: NonNull<Task>) {
        let level = unsafe { task.as_ref().priority.level() } as usize;
        unsafe { self.queues[level].remove(task) };
    }

    /// Pick the next task to run on `cpu`: the head of the highest
    /// non-empty priority queue whose affinity allows `cpu`, or the idle
    /// task if no queue has one. A task whose affinity excludes `cpu` is
    /// re-enqueued at the tail of its level and scanning continues, so a
    /// CPU-pinned task left at the head of an otherwise-runnable queue
    /// can't starve the rest of that level. Does not perform the actual
    /// context switch.
    pub fn pick_next(&mut self, cpu: u32) -> NonNull<Task> {
        for level in (0..NUM_PRIORITIES).rev() {
            let mut scanned = 0;
            let candidates = self.queues[level].len();
            while scanned < candidates {
                let Some(task) = (unsafe { self.queues[level].pop_front() }) else {
                    break;
                };
                scanned += 1;
                if unsafe { task.as_ref().affinity.allows(cpu) } {
                    return task;
                }
                unsafe { self.queues[level].push_back(task) };
            }
        }
        self.idle
    }

    #[must_use]
    pub const fn current(&self) -> Option<NonNull<Task>> {
        self.current
    }

    /// The fallback task handed out when every ready queue is empty (or
    /// has nothing matching the requesting CPU's affinity).
    #[must_use]
    pub const fn idle(&self) -> NonNull<Task> {
        self.idle
    }

    /// Take `task` out of its ready queue (if queued) and mark it
    /// [`TaskState::Blocked`] with `reason`. The caller is responsible for
    /// picking and switching to a different task afterward.
    pub fn block(&mut self, mut task: NonNull<Task>, reason: BlockReason) {
        self.dequeue(task);
        unsafe {
            task.as_mut().state = TaskState::Blocked;
            task.as_mut().block_reason = Some(reason);
        }
    }

    /// Clear a [`TaskState::Blocked`] task's block reason and re-enqueue it
    /// as ready. No-op if `task` isn't currently blocked.
    pub fn unblock(&mut self, mut task: NonNull<Task>) {
        if unsafe { task.as_ref().state } != TaskState::Blocked {
            return;
        }
        unsafe { task.as_mut().block_reason = None };
        self.enqueue(task);
    }

    pub fn set_current(&mut self, task: NonNull<Task>) {
        unsafe { (*task.as_ptr()).state = TaskState::Running };
        self.current = Some(task);
    }

    /// Decrement the current task's time slice; returns `true` once it
    /// hits zero, signalling the caller should preempt: re-enqueue the
    /// current task, [`pick_next`](Self::pick_next), and switch.
    pub fn tick(&mut self) -> bool {
        let Some(mut current) = self.current else {
            return false;
        };
        unsafe {
            let slice = &mut current.as_mut().time_slice;
            *slice = slice.saturating_sub(1);
            if *slice == 0 {
                *slice = DEFAULT_TIME_SLICE;
                return true;
            }
        }
        false
    }

    /// Switch the CPU from `prev` to `next`, recording `next` as current.
    /// Returns only after some other CPU switches back into `prev`.
    ///
    /// # Safety
    /// `prev` must be the task whose context was saved by the last switch
    /// into the caller, and `next` must be a task this scheduler still
    /// considers live (enqueued, idle, or about to run for the first time
    /// via [`kernel_context::Context::new_stack`]).
    pub unsafe fn switch(&mut self, mut prev: NonNull<Task>, next: NonNull<Task>) {
        self.set_current(next);
        unsafe {
            kernel_context::switch_to(
                &raw mut (*prev.as_mut()).context,
                &raw const (*next.as_ptr()).context,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_task(id: u32, priority: u8) -> NonNull<Task> {
        let task = Task::new(
            TaskId(id),
            Priority::new(priority).unwrap(),
            Context::empty(),
        );
        NonNull::from(Box::leak(Box::new(task)))
    }

    #[test]
    fn picks_highest_priority_first() {
        let idle = leak_task(0, 0);
        let mut sched = Scheduler::new(idle);
        let low = leak_task(1, 1);
        let high = leak_task(2, 5);
        sched.enqueue(low);
        sched.enqueue(high);

        let next = sched.pick_next(0);
        assert_eq!(unsafe { next.as_ref().id }, TaskId(2));
    }

    #[test]
    fn round_robins_within_a_priority_level() {
        let idle = leak_task(0, 0);
        let mut sched = Scheduler::new(idle);
        let a = leak_task(1, 3);
        let b = leak_task(2, 3);
        sched.enqueue(a);
        sched.enqueue(b);

        assert_eq!(unsafe { sched.pick_next(0).as_ref().id }, TaskId(1));
        assert_eq!(unsafe { sched.pick_next(0).as_ref().id }, TaskId(2));
    }

    #[test]
    fn falls_back_to_idle_when_all_queues_empty() {
        let idle = leak_task(0, 0);
        let mut sched = Scheduler::new(idle);
        assert_eq!(sched.pick_next(0), idle);
    }

    #[test]
    fn tick_signals_preemption_after_time_slice() {
        let idle = leak_task(0, 0);
        let mut sched = Scheduler::new(idle);
        let task = leak_task(1, 2);
        sched.set_current(task);

        let mut preempted = false;
        for _ in 0..DEFAULT_TIME_SLICE {
            preempted = sched.tick();
        }
        assert!(preempted);
    }

    #[test]
    fn dequeue_removes_a_sleeping_task_before_it_is_picked() {
        let idle = leak_task(0, 0);
        let mut sched = Scheduler::new(idle);
        let task = leak_task(1, 4);
        sched.enqueue(task);
        sched.dequeue(task);
        assert_eq!(sched.pick_next(0), idle);
    }

    #[test]
    fn pick_next_skips_a_task_pinned_to_another_cpu() {
        let idle = leak_task(0, 0);
        let mut sched = Scheduler::new(idle);
        let mut pinned = leak_task(1, 3);
        unsafe { pinned.as_mut().affinity = CpuMask::single(1) };
        let runnable = leak_task(2, 3);
        sched.enqueue(pinned);
        sched.enqueue(runnable);

        assert_eq!(unsafe { sched.pick_next(0).as_ref().id }, TaskId(2));
        // the pinned task is still queued, just skipped, not dropped
        assert_eq!(unsafe { sched.pick_next(1).as_ref().id }, TaskId(1));
    }

    #[test]
    fn block_removes_from_ready_queue_and_unblock_restores_it() {
        let idle = leak_task(0, 0);
        let mut sched = Scheduler::new(idle);
        let task = leak_task(1, 3);
        sched.enqueue(task);

        sched.block(task, BlockReason::Conduit);
        assert_eq!(unsafe { task.as_ref().state }, TaskState::Blocked);
        assert_eq!(unsafe { task.as_ref().block_reason }, Some(BlockReason::Conduit));
        assert_eq!(sched.pick_next(0), idle);

        sched.unblock(task);
        assert_eq!(unsafe { task.as_ref().state }, TaskState::Ready);
        assert_eq!(unsafe { task.as_ref().block_reason }, None);
        assert_eq!(unsafe { sched.pick_next(0).as_ref().id }, TaskId(1));
    }
}
