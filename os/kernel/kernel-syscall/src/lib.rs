//! # System Call Dispatch
//!
//! The opcode table, trap frame layout, and decode/dispatch logic for the
//! kernel's `int 0x80` syscall gate. This crate is deliberately a leaf: it
//! knows nothing about address spaces, the scheduler, or conduits. Instead
//! it defines [`SyscallHandlers`], a trait the `kernel` binary implements by
//! wiring each opcode to the real subsystem — the same seam
//! [`kernel-vmem`](../kernel_vmem/index.html)'s `FrameAlloc` and
//! [`kernel-slab`](../kernel_slab/index.html)'s `SlabBackend` use to keep
//! one crate from depending on another crate's concrete types.
//!
//! The actual `int 0x80` gate (the naked entry stub that saves registers
//! into a [`TrapFrame`] and calls [`dispatch`]) is installed by the `kernel`
//! binary alongside the rest of its IDT, since it needs a live
//! `&mut dyn SyscallHandlers` to call into — something only the binary,
//! which owns the kernel's global state, can provide.

#![cfg_attr(not(test), no_std)]

/// Syscall opcode, passed to the gate in `rax`.
#[repr(u64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sysno {
    /// `mem_alloc_frame() -> frame_addr`
    MemAllocFrame = 1,
    /// `mem_free_frame(frame_addr)`
    MemFreeFrame = 2,
    /// `mem_map(addr_hint, len, prot) -> addr`
    MemMap = 3,
    /// `mem_unmap(addr, len)`
    MemUnmap = 4,
    /// `mem_protect(addr, len, prot)`
    MemProtect = 5,
    /// `conduit_create(name_ptr, name_len, capacity) -> handle`
    ConduitCreate = 6,
    /// `conduit_open(name_ptr, name_len) -> handle`
    ConduitOpen = 7,
    /// `conduit_send(handle, ptr, len, flags)`
    ConduitSend = 8,
    /// `conduit_recv(handle, ptr, len, flags) -> bytes_read`
    ConduitRecv = 9,
    /// `conduit_close(handle)`
    ConduitClose = 10,
    /// `task_spawn(entry, priority) -> task_id`
    TaskSpawn = 11,
    /// `task_exit(code) -> !`
    TaskExit = 12,
    /// `task_yield()`
    TaskYield = 13,
    /// `task_sleep(microseconds)`
    TaskSleep = 14,
    /// `query_time() -> monotonic_ticks`
    QueryTime = 15,
    /// `capability_request(kind) -> capability_id`
    CapabilityRequest = 16,
    /// `capability_drop(capability_id)`
    CapabilityDrop = 17,
    /// `debug_write(byte)`, a thin hook onto the kernel's QEMU debug sink.
    DebugWrite = 18,
}

impl Sysno {
    #[must_use]
    pub const fn from_raw(value: u64) -> Option<Self> {
        Some(match value {
            1 => Self::MemAllocFrame,
            2 => Self::MemFreeFrame,
            3 => Self::MemMap,
            4 => Self::MemUnmap,
            5 => Self::MemProtect,
            6 => Self::ConduitCreate,
            7 => Self::ConduitOpen,
            8 => Self::ConduitSend,
            9 => Self::ConduitRecv,
            10 => Self::ConduitClose,
            11 => Self::TaskSpawn,
            12 => Self::TaskExit,
            13 => Self::TaskYield,
            14 => Self::TaskSleep,
            15 => Self::QueryTime,
            16 => Self::CapabilityRequest,
            17 => Self::CapabilityDrop,
            18 => Self::DebugWrite,
            _ => return None,
        })
    }
}

/// Failure a handler can report. Encoded into the top of the `u64` return
/// range (see [`ErrorCode::into_retval`]) rather than as a negative number,
/// since this ABI has no signed return convention.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ErrorCode {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not implemented")]
    NotImplemented,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no resources available")]
    NoResources,
    #[error("already exists")]
    AlreadyExists,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("message too large")]
    MessageTooLarge,
    #[error("operation would block")]
    WouldBlock,
    #[error("no such conduit handle")]
    NotFound,
}

/// First return value guaranteed not to be an encoded error: callers that
/// hand back addresses or byte counts must stay below this.
pub const ERROR_BASE: u64 = u64::MAX - 16;

/// `conduit_send`/`conduit_recv` flags bit: skip the retry-and-park path
/// and report [`ErrorCode::WouldBlock`] immediately instead.
pub const CONDUIT_FLAG_NON_BLOCKING: u64 = 1 << 0;

impl ErrorCode {
    #[must_use]
    const fn code(self) -> u64 {
        match self {
            Self::InvalidArgument => 0,
            Self::PermissionDenied => 1,
            Self::NotImplemented => 2,
            Self::OutOfMemory => 3,
            Self::NoResources => 4,
            Self::AlreadyExists => 5,
            Self::BrokenPipe => 6,
            Self::MessageTooLarge => 7,
            Self::WouldBlock => 8,
            Self::NotFound => 9,
        }
    }

    #[must_use]
    pub const fn into_retval(self) -> u64 {
        ERROR_BASE + self.code()
    }

    #[must_use]
    pub const fn from_retval(value: u64) -> Option<Self> {
        if value < ERROR_BASE {
            return None;
        }
        Some(match value - ERROR_BASE {
            0 => Self::InvalidArgument,
            1 => Self::PermissionDenied,
            2 => Self::NotImplemented,
            3 => Self::OutOfMemory,
            4 => Self::NoResources,
            5 => Self::AlreadyExists,
            6 => Self::BrokenPipe,
            7 => Self::MessageTooLarge,
            8 => Self::WouldBlock,
            _ => Self::NotFound,
        })
    }
}

/// Saved interrupt frame for the `int 0x80` syscall gate, laid out the way
/// the CPU and the entry stub push it: hardware-pushed fields first
/// (`rip`/`cs`/`rflags`/`rsp`/`ss`), then the general-purpose registers the
/// stub saves before calling into Rust.
#[derive(Debug)]
#[repr(C)]
pub struct TrapFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl TrapFrame {
    #[must_use]
    pub const fn sysno_raw(&self) -> u64 {
        self.rax
    }

    #[must_use]
    pub const fn arg0(&self) -> u64 {
        self.rdi
    }

    #[must_use]
    pub const fn arg1(&self) -> u64 {
        self.rsi
    }

    #[must_use]
    pub const fn arg2(&self) -> u64 {
        self.rdx
    }

    #[must_use]
    pub const fn arg3(&self) -> u64 {
        self.r10
    }

    pub const fn set_retval(&mut self, value: u64) {
        self.rax = value;
    }
}

/// One method per opcode group; implemented by whatever owns the live
/// address-space domain, scheduler, and conduit table.
pub trait SyscallHandlers {
    fn mem_alloc_frame(&mut self) -> Result<u64, ErrorCode>;
    fn mem_free_frame(&mut self, frame_addr: u64) -> Result<u64, ErrorCode>;
    fn mem_map(&mut self, addr_hint: u64, len: u64, prot: u64) -> Result<u64, ErrorCode>;
    fn mem_unmap(&mut self, addr: u64, len: u64) -> Result<u64, ErrorCode>;
    fn mem_protect(&mut self, addr: u64, len: u64, prot: u64) -> Result<u64, ErrorCode>;
    fn conduit_create(&mut self, name_ptr: u64, name_len: u64, capacity: u64) -> Result<u64, ErrorCode>;
    fn conduit_open(&mut self, name_ptr: u64, name_len: u64) -> Result<u64, ErrorCode>;
    fn conduit_send(&mut self, handle: u64, ptr: u64, len: u64, flags: u64) -> Result<u64, ErrorCode>;
    fn conduit_recv(&mut self, handle: u64, ptr: u64, len: u64, flags: u64) -> Result<u64, ErrorCode>;
    fn conduit_close(&mut self, handle: u64) -> Result<u64, ErrorCode>;
    fn task_spawn(&mut self, entry: u64, priority: u64) -> Result<u64, ErrorCode>;
    fn task_exit(&mut self, code: u64) -> Result<u64, ErrorCode>;
    fn task_yield(&mut self) -> Result<u64, ErrorCode>;
    fn task_sleep(&mut self, microseconds: u64) -> Result<u64, ErrorCode>;
    fn query_time(&mut self) -> Result<u64, ErrorCode>;
    fn capability_request(&mut self, kind: u64) -> Result<u64, ErrorCode>;
    fn capability_drop(&mut self, capability_id: u64) -> Result<u64, ErrorCode>;
    fn debug_write(&mut self, byte: u64) -> Result<u64, ErrorCode>;
}

/// Decode `tf`'s opcode and arguments, call the matching `handlers` method,
/// and write the result (or an encoded [`ErrorCode`]) back into `tf.rax`.
pub fn dispatch(tf: &mut TrapFrame, handlers: &mut impl SyscallHandlers) {
    let Some(sysno) = Sysno::from_raw(tf.sysno_raw()) else {
        tf.set_retval(ErrorCode::NotImplemented.into_retval());
        return;
    };
    let result = match sysno {
        Sysno::MemAllocFrame => handlers.mem_alloc_frame(),
        Sysno::MemFreeFrame => handlers.mem_free_frame(tf.arg0()),
        Sysno::MemMap => handlers.mem_map(tf.arg0(), tf.arg1(), tf.arg2()),
        Sysno::MemUnmap => handlers.mem_unmap(tf.arg0(), tf.arg1()),
        Sysno::MemProtect => handlers.mem_protect(tf.arg0(), tf.arg1(), tf.arg2()),
        Sysno::ConduitCreate => handlers.conduit_create(tf.arg0(), tf.arg1(), tf.arg2()),
        Sysno::ConduitOpen => handlers.conduit_open(tf.arg0(), tf.arg1()),
        Sysno::ConduitSend => handlers.conduit_send(tf.arg0(), tf.arg1(), tf.arg2(), tf.arg3()),
        Sysno::ConduitRecv => handlers.conduit_recv(tf.arg0(), tf.arg1(), tf.arg2(), tf.arg3()),
        Sysno::ConduitClose => handlers.conduit_close(tf.arg0()),
        Sysno::TaskSpawn => handlers.task_spawn(tf.arg0(), tf.arg1()),
        Sysno::TaskExit => handlers.task_exit(tf.arg0()),
        Sysno::TaskYield => handlers.task_yield(),
        Sysno::TaskSleep => handlers.task_sleep(tf.arg0()),
        Sysno::QueryTime => handlers.query_time(),
        Sysno::CapabilityRequest => handlers.capability_request(tf.arg0()),
        Sysno::CapabilityDrop => handlers.capability_drop(tf.arg0()),
        Sysno::DebugWrite => handlers.debug_write(tf.arg0()),
    };
    tf.set_retval(match result {
        Ok(v) => v,
        Err(e) => e.into_retval(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHandlers {
        last_debug_byte: Option<u64>,
        last_send_flags: Option<u64>,
    }

    impl SyscallHandlers for FakeHandlers {
        fn mem_alloc_frame(&mut self) -> Result<u64, ErrorCode> {
            Ok(0x1000)
        }

        fn mem_free_frame(&mut self, _frame_addr: u64) -> Result<u64, ErrorCode> {
            Ok(0)
        }

        fn mem_map(&mut self, _addr_hint: u64, len: u64, _prot: u64) -> Result<u64, ErrorCode> {
            if len == 0 {
                return Err(ErrorCode::InvalidArgument);
            }
            Ok(0x4000_0000)
        }

        fn mem_unmap(&mut self, _addr: u64, _len: u64) -> Result<u64, ErrorCode> {
            Ok(0)
        }

        fn mem_protect(&mut self, _addr: u64, _len: u64, _prot: u64) -> Result<u64, ErrorCode> {
            Ok(0)
        }

        fn conduit_create(&mut self, _name_ptr: u64, _name_len: u64, _capacity: u64) -> Result<u64, ErrorCode> {
            Ok(1)
        }

        fn conduit_open(&mut self, _name_ptr: u64, _name_len: u64) -> Result<u64, ErrorCode> {
            Err(ErrorCode::NotFound)
        }

        fn conduit_send(&mut self, handle: u64, _ptr: u64, _len: u64, flags: u64) -> Result<u64, ErrorCode> {
            if handle == 0 {
                return Err(ErrorCode::NotFound);
            }
            self.last_send_flags = Some(flags);
            Ok(4)
        }

        fn conduit_recv(&mut self, _handle: u64, _ptr: u64, _len: u64, _flags: u64) -> Result<u64, ErrorCode> {
            Err(ErrorCode::WouldBlock)
        }

        fn conduit_close(&mut self, _handle: u64) -> Result<u64, ErrorCode> {
            Ok(0)
        }

        fn task_spawn(&mut self, _entry: u64, _priority: u64) -> Result<u64, ErrorCode> {
            Ok(2)
        }

        fn task_yield(&mut self) -> Result<u64, ErrorCode> {
            Ok(0)
        }

        fn task_exit(&mut self, _code: u64) -> Result<u64, ErrorCode> {
            Ok(0)
        }

        fn task_sleep(&mut self, _microseconds: u64) -> Result<u64, ErrorCode> {
            Err(ErrorCode::PermissionDenied)
        }

        fn query_time(&mut self) -> Result<u64, ErrorCode> {
            Ok(0)
        }

        fn capability_request(&mut self, _kind: u64) -> Result<u64, ErrorCode> {
            Err(ErrorCode::PermissionDenied)
        }

        fn capability_drop(&mut self, _capability_id: u64) -> Result<u64, ErrorCode> {
            Err(ErrorCode::PermissionDenied)
        }

        fn debug_write(&mut self, byte: u64) -> Result<u64, ErrorCode> {
            self.last_debug_byte = Some(byte);
            Ok(0)
        }
    }

    fn empty_frame(rax: u64, rdi: u64, rsi: u64, rdx: u64) -> TrapFrame {
        TrapFrame {
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
            rax,
            rbx: 0,
            rcx: 0,
            rdx,
            rsi,
            rdi,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    #[test]
    fn unknown_opcode_returns_not_implemented() {
        let mut handlers = FakeHandlers { last_debug_byte: None, last_send_flags: None };
        let mut tf = empty_frame(0xFFFF, 0, 0, 0);
        dispatch(&mut tf, &mut handlers);
        assert_eq!(tf.rax, ErrorCode::NotImplemented.into_retval());
    }

    #[test]
    fn mem_map_success_returns_address() {
        let mut handlers = FakeHandlers { last_debug_byte: None, last_send_flags: None };
        let mut tf = empty_frame(Sysno::MemMap as u64, 0, 4096, 0);
        dispatch(&mut tf, &mut handlers);
        assert_eq!(tf.rax, 0x4000_0000);
    }

    #[test]
    fn mem_map_failure_encodes_error_above_error_base() {
        let mut handlers = FakeHandlers { last_debug_byte: None, last_send_flags: None };
        let mut tf = empty_frame(Sysno::MemMap as u64, 0, 0, 0);
        dispatch(&mut tf, &mut handlers);
        assert_eq!(
            ErrorCode::from_retval(tf.rax),
            Some(ErrorCode::InvalidArgument)
        );
    }

    #[test]
    fn debug_write_reaches_handler_with_low_byte() {
        let mut handlers = FakeHandlers { last_debug_byte: None, last_send_flags: None };
        let mut tf = empty_frame(Sysno::DebugWrite as u64, 0x41, 0, 0);
        dispatch(&mut tf, &mut handlers);
        assert_eq!(handlers.last_debug_byte, Some(0x41));
        assert_eq!(tf.rax, 0);
    }

    #[test]
    fn conduit_recv_would_block_round_trips_through_retval() {
        let mut handlers = FakeHandlers { last_debug_byte: None, last_send_flags: None };
        let mut tf = empty_frame(Sysno::ConduitRecv as u64, 1, 0, 0);
        dispatch(&mut tf, &mut handlers);
        assert_eq!(ErrorCode::from_retval(tf.rax), Some(ErrorCode::WouldBlock));
    }

    #[test]
    fn conduit_send_flags_arrive_through_r10() {
        let mut handlers = FakeHandlers { last_debug_byte: None, last_send_flags: None };
        let mut tf = empty_frame(Sysno::ConduitSend as u64, 1, 0, 0);
        tf.r10 = CONDUIT_FLAG_NON_BLOCKING;
        dispatch(&mut tf, &mut handlers);
        assert_eq!(handlers.last_send_flags, Some(CONDUIT_FLAG_NON_BLOCKING));
    }

    #[test]
    fn conduit_open_not_found_round_trips_through_retval() {
        let mut handlers = FakeHandlers { last_debug_byte: None, last_send_flags: None };
        let mut tf = empty_frame(Sysno::ConduitOpen as u64, 0, 0, 0);
        dispatch(&mut tf, &mut handlers);
        assert_eq!(ErrorCode::from_retval(tf.rax), Some(ErrorCode::NotFound));
    }

    #[test]
    fn error_code_retval_round_trips_for_every_variant() {
        let variants = [
            ErrorCode::InvalidArgument,
            ErrorCode::PermissionDenied,
            ErrorCode::NotImplemented,
            ErrorCode::OutOfMemory,
            ErrorCode::NoResources,
            ErrorCode::AlreadyExists,
            ErrorCode::BrokenPipe,
            ErrorCode::MessageTooLarge,
            ErrorCode::WouldBlock,
            ErrorCode::NotFound,
        ];
        for e in variants {
            assert_eq!(ErrorCode::from_retval(e.into_retval()), Some(e));
        }
    }
}
