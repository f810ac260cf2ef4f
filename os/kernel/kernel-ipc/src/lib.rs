//! # Message-Passing Conduits
//!
//! A [`Conduit`] is a fixed-capacity byte ring plus two bounded wait queues —
//! one for tasks blocked on a full buffer, one for tasks blocked on an empty
//! one. Every write is framed by a [`MessageHeader`] (sender id, payload
//! length, timestamp, flags) so `recv` always hands back exactly one
//! sender's write, never a partial or merged one, and the reader can see
//! who sent it and when without a side channel.
//!
//! The ring buffer's bookkeeping (`head`/`tail`/`len` over a fixed byte
//! range, wrapping on overflow) is the same discipline the allocators in
//! this workspace use for address-range bookkeeping, just applied to a
//! stream of bytes instead of a stream of memory blocks. Wait queues are
//! bounded arrays rather than intrusive lists: blocking on a conduit never
//! needs its own allocation, and a full wait queue is a real, reportable
//! condition (too many tasks already waiting) rather than an allocation
//! failure.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

use core::ptr::NonNull;
use kernel_sched::Task;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConduitError {
    #[error("message of {0} bytes does not fit in the conduit's buffer")]
    MessageTooLarge(usize),
    #[error("conduit buffer is full")]
    WouldBlockFull,
    #[error("conduit buffer is empty")]
    WouldBlockEmpty,
    #[error("output buffer of {0} bytes is too small for the pending message")]
    RecvBufferTooSmall(usize),
    #[error("conduit has been closed")]
    Closed,
    #[error("wait queue already has the maximum number of blocked tasks")]
    WaitQueueFull,
}

/// Fixed-capacity byte ring. `CAP` must be large enough to hold the longest
/// framed message this conduit will carry (header included).
struct RingBuffer<const CAP: usize> {
    buf: [u8; CAP],
    head: usize,
    len: usize,
}

impl<const CAP: usize> RingBuffer<CAP> {
    const fn new() -> Self {
        Self {
            buf: [0; CAP],
            head: 0,
            len: 0,
        }
    }

    const fn free(&self) -> usize {
        CAP - self.len
    }

    fn push(&mut self, data: &[u8]) -> Result<(), ConduitError> {
        if data.len() > self.free() {
            return Err(ConduitError::WouldBlockFull);
        }
        let mut pos = (self.head + self.len) % CAP;
        for &byte in data {
            self.buf[pos] = byte;
            pos = (pos + 1) % CAP;
        }
        self.len += data.len();
        Ok(())
    }

    fn pop(&mut self, out: &mut [u8]) -> Result<(), ConduitError> {
        if out.len() > self.len {
            return Err(ConduitError::WouldBlockEmpty);
        }
        let mut pos = self.head;
        for slot in out.iter_mut() {
            *slot = self.buf[pos];
            pos = (pos + 1) % CAP;
        }
        self.head = pos;
        self.len -= out.len();
        Ok(())
    }

    const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bounded wait queue; holds pointers to tasks a [`Conduit`] has parked.
/// Waking a task is the caller's job: [`pop_one`](Self::pop_one)/
/// [`drain`](Self::drain) only hand back the pointer, since only the
/// scheduler knows how to make a task runnable again.
pub struct WaitQueue<const CAP: usize> {
    slots: [Option<NonNull<Task>>; CAP],
    count: usize,
}

impl<const CAP: usize> WaitQueue<CAP> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; CAP],
            count: 0,
        }
    }

    /// # Errors
    /// [`ConduitError::WaitQueueFull`] if `CAP` tasks are already parked.
    pub fn push(&mut self, task: NonNull<Task>) -> Result<(), ConduitError> {
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(task);
                self.count += 1;
                return Ok(());
            }
        }
        Err(ConduitError::WaitQueueFull)
    }

    /// Take the oldest parked task, if any.
    pub fn pop_one(&mut self) -> Option<NonNull<Task>> {
        for slot in &mut self.slots {
            if let Some(task) = slot.take() {
                self.count -= 1;
                return Some(task);
            }
        }
        None
    }

    /// Wake every parked task (a broadcast), invoking `f` once per task in
    /// the order they were parked.
    pub fn drain(&mut self, mut f: impl FnMut(NonNull<Task>)) {
        for slot in &mut self.slots {
            if let Some(task) = slot.take() {
                f(task);
            }
        }
        self.count = 0;
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<const CAP: usize> Default for WaitQueue<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-message framing header: who sent it, how long the payload is, when
/// it was enqueued (a caller-supplied monotonic tick, since this crate has
/// no clock of its own), and sender-chosen flags this crate never
/// interprets itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub sender: u32,
    pub len: u32,
    pub timestamp: u64,
    pub flags: u32,
}

const HEADER_LEN: usize = size_of::<u32>() * 3 + size_of::<u64>();

impl MessageHeader {
    fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.sender.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    fn decode(buf: [u8; HEADER_LEN]) -> Self {
        Self {
            sender: u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")),
            len: u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice")),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
            flags: u32::from_le_bytes(buf[16..20].try_into().expect("4-byte slice")),
        }
    }
}

/// A bounded, length-framed message channel. `CAP` is the ring's byte
/// capacity (including headers); `WAITERS` bounds how many tasks may be
/// parked on each side at once. No single message's payload may exceed
/// `CAP / 4`, so one oversized write can never monopolize the whole ring
/// against every other sender sharing it.
pub struct Conduit<const CAP: usize, const WAITERS: usize> {
    ring: RingBuffer<CAP>,
    pending_messages: usize,
    send_waiters: WaitQueue<WAITERS>,
    recv_waiters: WaitQueue<WAITERS>,
    closed: bool,
}

impl<const CAP: usize, const WAITERS: usize> Default for Conduit<CAP, WAITERS> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Conduit`] behind the workspace's spinlock, the form a conduit
/// actually takes once it is reachable from more than one task.
pub type ConduitLock<const CAP: usize, const WAITERS: usize> =
    kernel_sync::SpinMutex<Conduit<CAP, WAITERS>>;

impl<const CAP: usize, const WAITERS: usize> Conduit<CAP, WAITERS> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: RingBuffer::new(),
            pending_messages: 0,
            send_waiters: WaitQueue::new(),
            recv_waiters: WaitQueue::new(),
            closed: false,
        }
    }

    /// Non-blocking send of one framed message from `sender`, stamped with
    /// `timestamp`. On success, returns a task to wake (the oldest receiver
    /// parked on an empty buffer), if any.
    ///
    /// # Errors
    /// [`ConduitError::Closed`], [`ConduitError::MessageTooLarge`] if the
    /// payload exceeds `CAP / 4` (the per-message cap that keeps one big
    /// write from starving every other sender on the same conduit), or
    /// [`ConduitError::WouldBlockFull`] if there is currently not enough
    /// room (the caller should park on `send_waiters` and retry once
    /// woken).
    pub fn try_send(
        &mut self,
        sender: u32,
        message: &[u8],
        timestamp: u64,
        flags: u32,
    ) -> Result<Option<NonNull<Task>>, ConduitError> {
        if self.closed {
            return Err(ConduitError::Closed);
        }
        if message.len() > CAP / 4 {
            return Err(ConduitError::MessageTooLarge(message.len()));
        }
        let header = MessageHeader { sender, len: message.len() as u32, timestamp, flags }.encode();
        if header.len() + message.len() > self.ring.free() {
            return Err(ConduitError::WouldBlockFull);
        }
        self.ring.push(&header)?;
        self.ring.push(message)?;
        self.pending_messages += 1;
        Ok(self.recv_waiters.pop_one())
    }

    /// Non-blocking receive of one framed message into `out`. Returns the
    /// sender's header (sender id, payload length, original timestamp and
    /// flags) and a task to wake (the oldest sender parked on a full
    /// buffer), if any.
    ///
    /// # Errors
    /// [`ConduitError::WouldBlockEmpty`] if no message is pending,
    /// [`ConduitError::RecvBufferTooSmall`] if `out` cannot hold the
    /// pending message (the message stays queued).
    pub fn try_recv(
        &mut self,
        out: &mut [u8],
    ) -> Result<(MessageHeader, Option<NonNull<Task>>), ConduitError> {
        if self.ring.is_empty() || self.pending_messages == 0 {
            return Err(ConduitError::WouldBlockEmpty);
        }
        let mut header_bytes = [0u8; HEADER_LEN];
        self.peek_header(&mut header_bytes);
        let header = MessageHeader::decode(header_bytes);
        let msg_len = header.len as usize;
        if msg_len > out.len() {
            return Err(ConduitError::RecvBufferTooSmall(msg_len));
        }
        self.ring.pop(&mut header_bytes)?;
        self.ring.pop(&mut out[..msg_len])?;
        self.pending_messages -= 1;
        Ok((header, self.send_waiters.pop_one()))
    }

    /// Copy the next message's payload into `out` without consuming it.
    /// Returns `0` if no complete message is queued.
    ///
    /// # Errors
    /// [`ConduitError::MessageTooLarge`] if `out` cannot hold the pending
    /// message; the message stays queued either way.
    pub fn peek(&self, out: &mut [u8]) -> Result<usize, ConduitError> {
        if self.pending_messages == 0 {
            return Ok(0);
        }
        let mut header_bytes = [0u8; HEADER_LEN];
        self.peek_header(&mut header_bytes);
        let msg_len = MessageHeader::decode(header_bytes).len as usize;
        if msg_len > out.len() {
            return Err(ConduitError::MessageTooLarge(msg_len));
        }
        let mut pos = (self.ring.head + HEADER_LEN) % CAP;
        for slot in &mut out[..msg_len] {
            *slot = self.ring.buf[pos];
            pos = (pos + 1) % CAP;
        }
        Ok(msg_len)
    }

    fn peek_header(&self, out: &mut [u8; HEADER_LEN]) {
        let mut pos = self.ring.head;
        for slot in out.iter_mut() {
            *slot = self.ring.buf[pos];
            pos = (pos + 1) % CAP;
        }
    }

    /// Park `task` until a message arrives.
    ///
    /// # Errors
    /// [`ConduitError::WaitQueueFull`] if `WAITERS` receivers are already
    /// parked.
    pub fn park_receiver(&mut self, task: NonNull<Task>) -> Result<(), ConduitError> {
        self.recv_waiters.push(task)
    }

    /// Park `task` until there is room to send.
    ///
    /// # Errors
    /// [`ConduitError::WaitQueueFull`] if `WAITERS` senders are already
    /// parked.
    pub fn park_sender(&mut self, task: NonNull<Task>) -> Result<(), ConduitError> {
        self.send_waiters.push(task)
    }

    /// Close the conduit and wake every parked task on both sides (a
    /// broadcast), so blocked reads/writes can unwind with
    /// [`ConduitError::Closed`] instead of hanging forever.
    pub fn close(&mut self, mut wake: impl FnMut(NonNull<Task>)) {
        self.closed = true;
        self.recv_waiters.drain(&mut wake);
        self.send_waiters.drain(&mut wake);
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub const fn has_pending_message(&self) -> bool {
        self.pending_messages > 0
    }
}

/// Readiness a conduit can report to [`select`]/[`select_pass`].
pub trait SelectReady {
    fn is_readable(&self) -> bool;
    fn is_writable(&self) -> bool;
}

impl<const CAP: usize, const WAITERS: usize> SelectReady for Conduit<CAP, WAITERS> {
    fn is_readable(&self) -> bool {
        self.has_pending_message() || self.is_closed()
    }

    fn is_writable(&self) -> bool {
        self.is_closed() || self.ring.free() * 2 >= CAP
    }
}

/// Return the index of the first conduit in `conduits` that is ready to be
/// read without blocking (has a pending message, or has been closed).
#[must_use]
pub fn select(conduits: &[&dyn SelectReady]) -> Option<usize> {
    conduits.iter().position(|c| c.is_readable())
}

/// Which readiness a [`select_pass`] entry is asking about.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SelectOp {
    ReadRequested,
    WriteRequested,
}

/// One polling pass over `conduits`/`ops` (parallel slices): marks each
/// entry's readiness into `ready` and returns how many were ready. A
/// conduit is read-ready once a complete message is queued (or it has been
/// closed); write-ready once its ring has at least half its capacity free
/// (or it has been closed).
///
/// This crate has no clock, so the blocking `select(timeout)` described for
/// conduits is built one layer up: the caller loops on `select_pass`,
/// yielding the CPU between passes, until either a pass reports a nonzero
/// count or its own timeout elapses.
pub fn select_pass(conduits: &[&dyn SelectReady], ops: &[SelectOp], ready: &mut [bool]) -> usize {
    let mut count = 0;
    for ((conduit, op), slot) in conduits.iter().zip(ops).zip(ready.iter_mut()) {
        *slot = match op {
            SelectOp::ReadRequested => conduit.is_readable(),
            SelectOp::WriteRequested => conduit.is_writable(),
        };
        if *slot {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_context::Context;
    use kernel_sched::{Priority, TaskId};

    fn leak_task(id: u32) -> NonNull<Task> {
        let task = Task::new(TaskId(id), Priority::new(1).unwrap(), Context::empty());
        NonNull::from(Box::leak(Box::new(task)))
    }

    #[test]
    fn send_then_recv_round_trips_one_message() {
        let mut conduit: Conduit<64, 4> = Conduit::new();
        assert!(conduit.try_send(1, b"hello", 42, 0).unwrap().is_none());

        let mut out = [0u8; 16];
        let (header, woken) = conduit.try_recv(&mut out).unwrap();
        assert_eq!(&out[..header.len as usize], b"hello");
        assert_eq!(header.sender, 1);
        assert_eq!(header.timestamp, 42);
        assert!(woken.is_none());
    }

    #[test]
    fn recv_on_empty_conduit_would_block() {
        let mut conduit: Conduit<64, 4> = Conduit::new();
        let mut out = [0u8; 16];
        assert_eq!(conduit.try_recv(&mut out), Err(ConduitError::WouldBlockEmpty));
    }

    #[test]
    fn send_over_one_quarter_capacity_is_too_large() {
        let mut conduit: Conduit<64, 4> = Conduit::new();
        // CAP / 4 == 16, so a 17-byte payload can never fit even empty.
        let payload = [0u8; 17];
        assert_eq!(
            conduit.try_send(1, &payload, 0, 0),
            Err(ConduitError::MessageTooLarge(17))
        );
    }

    #[test]
    fn full_buffer_wakes_a_parked_sender_on_recv() {
        let mut conduit: Conduit<48, 2> = Conduit::new();
        // One 12-byte message plus its header leaves no room for a second.
        conduit.try_send(1, &[0u8; 12], 0, 0).unwrap();
        assert_eq!(conduit.try_send(1, &[0u8; 12], 0, 0), Err(ConduitError::WouldBlockFull));

        let sender = leak_task(7);
        conduit.park_sender(sender).unwrap();

        let mut out = [0u8; 16];
        let (_, woken) = conduit.try_recv(&mut out).unwrap();
        assert_eq!(woken, Some(sender));
    }

    #[test]
    fn peek_leaves_the_message_queued_for_a_later_recv() {
        let mut conduit: Conduit<64, 4> = Conduit::new();
        conduit.try_send(1, b"hello", 0, 0).unwrap();

        let mut out = [0u8; 16];
        let peeked = conduit.peek(&mut out).unwrap();
        assert_eq!(&out[..peeked], b"hello");

        let (header, _) = conduit.try_recv(&mut out).unwrap();
        assert_eq!(&out[..header.len as usize], b"hello");
    }

    #[test]
    fn peek_on_empty_conduit_returns_zero() {
        let conduit: Conduit<64, 4> = Conduit::new();
        let mut out = [0u8; 16];
        assert_eq!(conduit.peek(&mut out), Ok(0));
    }

    #[test]
    fn peek_into_undersized_buffer_errors_without_consuming() {
        let mut conduit: Conduit<64, 4> = Conduit::new();
        conduit.try_send(1, b"hello", 0, 0).unwrap();

        let mut out = [0u8; 2];
        assert_eq!(conduit.peek(&mut out), Err(ConduitError::MessageTooLarge(5)));
        assert!(conduit.has_pending_message());
    }

    #[test]
    fn closing_wakes_every_parked_task() {
        let mut conduit: Conduit<64, 4> = Conduit::new();
        let a = leak_task(1);
        let b = leak_task(2);
        conduit.park_receiver(a).unwrap();
        conduit.park_sender(b).unwrap();

        let mut woken = Vec::new();
        conduit.close(|t| woken.push(t));
        assert_eq!(woken.len(), 2);
        assert!(conduit.is_closed());
    }

    #[test]
    fn select_finds_first_ready_conduit() {
        let mut a: Conduit<64, 2> = Conduit::new();
        let mut b: Conduit<64, 2> = Conduit::new();
        b.try_send(1, b"ping", 0, 0).unwrap();

        let a_ref: &dyn SelectReady = &a;
        let b_ref: &dyn SelectReady = &b;
        assert_eq!(select(&[a_ref, b_ref]), Some(1));

        a.try_send(1, b"pong", 0, 0).unwrap();
        let a_ref: &dyn SelectReady = &a;
        assert_eq!(select(&[a_ref, b_ref]), Some(0));
    }

    #[test]
    fn select_pass_reports_read_and_write_readiness_independently() {
        let mut a: Conduit<64, 2> = Conduit::new();
        let mut b: Conduit<64, 2> = Conduit::new();
        b.try_send(1, b"ping", 0, 0).unwrap();

        let a_ref: &dyn SelectReady = &a;
        let b_ref: &dyn SelectReady = &b;
        let ops = [SelectOp::ReadRequested, SelectOp::ReadRequested];
        let mut ready = [false, false];
        let count = select_pass(&[a_ref, b_ref], &ops, &mut ready);
        assert_eq!(count, 1);
        assert_eq!(ready, [false, true]);

        a.try_send(1, &[0u8; 16], 0, 0).unwrap();
        let a_ref: &dyn SelectReady = &a;
        let ops = [SelectOp::WriteRequested];
        let mut ready = [false];
        let count = select_pass(&[a_ref], &ops, &mut ready);
        assert_eq!(count, 0);
        assert!(!ready[0]);
    }

    #[test]
    fn ring_wraps_cleanly_after_repeated_send_recv_cycles() {
        let mut conduit: Conduit<256, 4> = Conduit::new();
        let payload = [0u8; 20];
        for _ in 0..4 {
            conduit.try_send(1, &payload, 0, 0).unwrap();
        }
        let mut out = [0u8; 20];
        for _ in 0..4 {
            let (header, _) = conduit.try_recv(&mut out).unwrap();
            assert_eq!(header.len, 20);
        }
        assert!(!conduit.has_pending_message());
        assert_eq!(conduit.ring.len, 0);
    }

    #[test]
    fn send_into_a_parked_receiver_hands_back_the_waiting_task() {
        let mut conduit: Conduit<64, 4> = Conduit::new();
        let receiver = leak_task(3);
        conduit.park_receiver(receiver).unwrap();

        let woken = conduit.try_send(1, b"wakeup", 0, 0).unwrap();
        assert_eq!(woken, Some(receiver));
    }
}
