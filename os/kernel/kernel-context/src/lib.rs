//! # Execution Contexts and Per-CPU State
//!
//! A minimal callee-saved [`Context`] plus the low-level [`switch_to`] routine
//! that swaps stacks between two of them, and a [`PerCpuBlock`] that each CPU
//! points at through `IA32_GS_BASE` so scheduler code can always find "this
//! CPU's" state without a table lookup.
//!
//! The per-CPU pointer is installed the same way the register crate's other
//! model-specific registers are read and written: a small `#[inline(always)]`
//! wrapper around `RDMSR`/`WRMSR`, documented with the privilege and
//! canonical-address requirements the instruction itself imposes.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

use core::ptr::NonNull;
use kernel_registers::cr3::Cr3;
use kernel_registers::msr::Ia32KernelGsBaseMsr;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Read CR3 as it stands right now, for stamping into a freshly built
/// [`Context`]. Every task in this kernel currently runs in the address
/// space active at boot, so "whatever CR3 holds when the task is created"
/// is already the right root; a task given its own page tables later would
/// set `Context.cr3` directly instead of going through this helper.
///
/// `MOV` to/from CR3 is a CPL0-only instruction; under `cargo test` this
/// runs as an ordinary ring-3 host process, so the read is skipped there
/// and reports `0` instead of faulting.
#[must_use]
pub fn current_page_table_root() -> u64 {
    #[cfg(test)]
    {
        0
    }
    #[cfg(not(test))]
    {
        unsafe { Cr3::load_unsafe() }.into_bits()
    }
}

/// Opaque identifier for a logical CPU, assigned during boot enumeration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(pub u32);

/// Saved callee-saved registers for one suspended stack. `rip` is implicit:
/// it is whatever `ret` finds on top of the saved stack, pushed by the
/// caller of [`switch_to`] before the switch.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Context {
    pub rsp: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Page-table root (CR3) active while this context runs. `switch_to`
    /// reloads CR3 from here on every switch, skipping the write when it
    /// already matches the live register so a run of same-address-space
    /// tasks doesn't pay for a redundant (non-global) TLB flush.
    pub cr3: u64,
}

impl Context {
    /// An all-zero context, used for slots that have never been switched to.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            rsp: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            cr3: 0,
        }
    }

    /// Build a context for a brand-new stack that, on first switch-in, will
    /// `ret` into `entry` with `entry`'s usual calling convention already
    /// satisfied (no arguments on the ABI registers — callers pass state
    /// through a per-task block the entry point reads itself).
    ///
    /// `stack_top` must point one past the end of a stack the caller owns
    /// for as long as this context is scheduled.
    #[must_use]
    pub fn new_stack(stack_top: NonNull<u8>, entry: extern "C" fn() -> !) -> Self {
        // Reserve one `u64` below the top for the return address `switch_to`'s
        // `ret` will pop; the stack then looks exactly like one that just
        // called into `entry` and is about to run it.
        let top = stack_top.as_ptr() as u64 & !0xF;
        let rsp = top - 8;
        unsafe {
            (rsp as *mut u64).write(entry as usize as u64);
        }
        Self {
            rsp,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            cr3: current_page_table_root(),
        }
    }
}

/// Switch from `prev` to `next`: save the current callee-saved registers and
/// stack pointer into `prev`, swap the page-table root (CR3) to `next`'s, and
/// load `next`'s registers before returning into whatever `next.rsp` points
/// at. The CR3 write is skipped when it already matches `next`'s, since
/// loading CR3 with itself still flushes every non-global TLB entry.
///
/// # Safety
/// - `prev` and `next` must be distinct, live [`Context`] values.
/// - `next` must have been produced by a previous `switch_to` (its saved
///   `rsp` pointing at a stack laid out by this same routine) or by
///   [`Context::new_stack`].
/// - `next.cr3` must hold a PML4 physical root that is currently mapped and
///   valid to load.
/// - The caller must not hold any non-`'static` borrows across the switch;
///   execution resumes in a different stack's control flow.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to(prev: *mut Context, next: *const Context) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi + 0]",
        "mov rax, [rsi + 56]",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Per-CPU block every core's `IA32_GS_BASE` points at once
/// [`install_per_cpu`] has run on that core. Scheduler state (ready queues,
/// the currently running task) hangs off this; `kernel-context` itself only
/// owns the identity and the idle context.
#[repr(C)]
pub struct PerCpuBlock {
    pub id: CpuId,
    /// Context to resume when this CPU has nothing else runnable.
    pub idle_context: Context,
    /// Nesting depth of preemption-disable sections on this CPU.
    pub preempt_disable_count: u32,
}

impl PerCpuBlock {
    #[must_use]
    pub const fn new(id: CpuId) -> Self {
        Self {
            id,
            idle_context: Context::empty(),
            preempt_disable_count: 0,
        }
    }
}

/// Point this CPU's `IA32_KERNEL_GS_BASE` at `block` for the remaining
/// lifetime of the kernel on this core. This is the MSR `swapgs` exchanges
/// into `IA32_GS_BASE` on kernel entry, so once interrupt/syscall entry runs
/// `swapgs`, `gs:`-relative accesses reach this block without a table
/// lookup; until then, reading it back directly via RDMSR is just as valid.
///
/// # Safety
/// - Must run once per CPU, at CPL0, before any code calls
///   [`current_per_cpu`] on that core.
/// - `block` must outlive the core (callers pass a `'static` allocation,
///   typically one array slot per CPU set up during boot).
pub unsafe fn install_per_cpu(block: NonNull<PerCpuBlock>) {
    unsafe {
        Ia32KernelGsBaseMsr::new()
            .with_kernel_gs_base(block)
            .store_unsafe();
    }
}

/// Read back the pointer installed by [`install_per_cpu`] on this CPU.
///
/// # Safety
/// [`install_per_cpu`] must already have run on this core.
#[must_use]
pub unsafe fn current_per_cpu() -> NonNull<PerCpuBlock> {
    let msr = unsafe { Ia32KernelGsBaseMsr::load_unsafe() };
    NonNull::new(msr.ptr() as *mut PerCpuBlock).expect("per-CPU block not installed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_is_all_zero() {
        let ctx = Context::empty();
        assert_eq!(ctx.rsp, 0);
        assert_eq!(ctx.rbx, 0);
    }

    #[test]
    fn new_stack_writes_entry_point_below_top() {
        let mut stack = [0u8; 256];
        let top = unsafe { NonNull::new_unchecked(stack.as_mut_ptr().add(256)) };
        extern "C" fn dummy_entry() -> ! {
            loop {}
        }
        let ctx = Context::new_stack(top, dummy_entry);
        let written = unsafe { (ctx.rsp as *const u64).read() };
        assert_eq!(written, dummy_entry as usize as u64);
        assert_eq!(ctx.rsp % 8, 0);
    }

    #[test]
    fn per_cpu_block_starts_with_zeroed_idle_context() {
        let block = PerCpuBlock::new(CpuId(3));
        assert_eq!(block.id, CpuId(3));
        assert_eq!(block.preempt_disable_count, 0);
        assert_eq!(block.idle_context.rsp, 0);
    }
}
