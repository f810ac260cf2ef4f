//! # Kernel Entry Point
//!
//! Brings every subsystem crate in this workspace up from a cold boot
//! hand-off: installs the heap, the physical frame allocator, one demo
//! virtual-memory domain, per-CPU state, the scheduler, a conduit, and a
//! syscall dispatch table, then settles into the idle loop.

#![no_std]
#![no_main]
#![allow(unsafe_code)]

extern crate alloc;

use alloc::vec;
use core::alloc::{GlobalAlloc, Layout};
use core::hint::spin_loop;
use core::ptr::NonNull;

use kernel_info::boot::{KernelBootInfo, MemoryRangeKind};
use kernel_info::memory::{CONDUIT_DEFAULT_CAPACITY, CONDUIT_DEFAULT_WAITERS, HHDM_BASE, KERNEL_BASE, PHYS_LOAD};
use kernel_vmem::domain::RefCountedFrameAlloc;
use kernel_vmem::{Domain, FrameAlloc, PhysAddr, PhysMapper, Protection, RegionKind, VirtAddr};

#[cfg(feature = "qemu")]
use kernel_qemu::qemu_trace;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    #[cfg(feature = "qemu")]
    qemu_trace!("panic: {info}\n");
    #[cfg(not(feature = "qemu"))]
    let _ = info;
    loop {
        spin_loop();
    }
}

/// Boot stack size, used only until [`kernel_entry`] hands off to the
/// stack the rest of boot runs on.
const BOOT_STACK_SIZE: usize = 64 * 1024;

#[repr(align(16))]
struct Aligned<const N: usize>([u8; N]);

#[repr(align(4096))]
struct Align4K<const N: usize>([u8; N]);

#[unsafe(link_section = ".bss.boot")]
#[unsafe(no_mangle)]
static mut BOOT_STACK: Aligned<BOOT_STACK_SIZE> = Aligned([0; BOOT_STACK_SIZE]);

/// The kernel entry point.
///
/// # UEFI Interaction
/// The UEFI loader jumps here after `ExitBootServices`.
///
/// # ABI
/// `win64` since the reference loader is a UEFI (PE/COFF) application and
/// passes `boot_info` in `RCX` rather than `RDI`.
///
/// # Naked function & stack
/// Naked so we control the stack switch ourselves; a normal `extern "win64"
/// fn` prologue would try to unwind through a stack we're about to discard,
/// which is UB.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "win64" fn _start_kernel(_boot_info: *const KernelBootInfo) {
    core::arch::naked_asm!(
        "cli",

        // These OUTs need no memory; if you see them, the trampoline page is
        // still mapped in the new CR3.
        "mov    dx, 0x402",
        "mov    al, 'C'",
        "out    dx, al",

        // Save RCX (boot_info per win64) before we clobber it.
        "mov r12, rcx",

        // Build our own kernel stack and a valid call frame for kernel_entry.
        "lea rax, [rip + {stack_sym}]",
        "add rax, {stack_size}",
        "and rax, -16",
        "sub rax, 32", // shadow space
        "mov rsp, rax",
        "push 0", // dummy return address, keeps rsp % 16 == 8 at entry
        "xor rbp, rbp",

        // Hand boot_info to kernel_entry in the SysV/C arg register.
        "mov rdi, r12",

        "mov    dx, 0x402",
        "mov    al, 'D'",
        "out    dx, al",

        "jmp {rust_entry}",
        stack_sym = sym BOOT_STACK,
        stack_size = const BOOT_STACK_SIZE,
        rust_entry = sym kernel_entry,
    );
}

#[cfg(feature = "qemu")]
fn init_logging() {
    let _ = kernel_qemu::logger::QemuLogger::new(log::LevelFilter::Trace).init();
}

#[cfg(not(feature = "qemu"))]
fn init_logging() {}

/// Kernel entry running on the stack [`_start_kernel`] built.
#[unsafe(no_mangle)]
extern "C" fn kernel_entry(boot_info: *const KernelBootInfo) -> ! {
    init_logging();
    log::info!("kernel reporting in");
    let bi = unsafe { &*boot_info };
    kernel_main(bi)
}

fn trace_boot_info(bi: &KernelBootInfo) {
    log::info!(
        "boot info: valid={} mode={:?} mmap_len={} rsdp={:#x} cpu_count={} boot_stack_top={:#x}",
        bi.is_valid(),
        bi.mode,
        bi.mmap.len,
        bi.rsdp_addr,
        bi.cpu_count,
        bi.boot_stack_top,
    );
}

/// Converts the virtual address of a `.bss`/`.data` static inside the
/// kernel image to its load-time physical address, using the same linear
/// relationship the linker script sets up between `KERNEL_BASE` and
/// `PHYS_LOAD`. Only valid for addresses inside this kernel's own image.
fn image_phys_addr(va: u64) -> u64 {
    PHYS_LOAD + (va - KERNEL_BASE)
}

struct KernelPhysMapper;

impl PhysMapper for KernelPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        let va = (HHDM_BASE + pa.as_u64()) as *mut T;
        unsafe { &mut *va }
    }
}

// --- Heap -------------------------------------------------------------

const HEAP_MIN_BLOCK: usize = 64;
const HEAP_ORDERS: usize = 14; // 64 B * 2^13 = 512 KiB largest block
const HEAP_BYTES: usize = 2 * 1024 * 1024;

static mut HEAP_REGION: Align4K<HEAP_BYTES> = Align4K([0; HEAP_BYTES]);

struct KernelHeap {
    inner: kernel_sync::Mutex<Option<kernel_buddy::BuddyAllocator<HEAP_ORDERS>>, kernel_sync::RawSpin>,
}

impl KernelHeap {
    const fn uninit() -> Self {
        Self {
            inner: kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), None),
        }
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(layout.align()).max(1);
        let mut guard = self.inner.lock();
        let Some(backend) = guard.as_mut() else {
            return core::ptr::null_mut();
        };
        match backend.alloc(size) {
            Ok(addr) => addr as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = layout.size().max(layout.align()).max(1);
        if let Some(backend) = self.inner.lock().as_mut() {
            backend.dealloc(ptr as usize, size);
        }
    }
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap::uninit();

fn init_heap() {
    let va = (&raw const HEAP_REGION) as usize;
    let mut backend = kernel_buddy::BuddyAllocator::<HEAP_ORDERS>::new(HEAP_MIN_BLOCK)
        .expect("HEAP_MIN_BLOCK is a power of two");
    unsafe { backend.add_region(va, HEAP_BYTES) };
    *HEAP.inner.lock() = Some(backend);
    log::info!("heap online: {HEAP_BYTES} bytes, min block {HEAP_MIN_BLOCK}");
}

// --- Task object cache --------------------------------------------------
//
// Task control blocks come out of their own slab cache rather than the
// general heap, so ready-queue bookkeeping never competes with ordinary
// kernel allocations for the same buddy pool.

const TASK_MIN_BLOCK: usize = 64;
const TASK_ORDERS: usize = 8; // 64 B * 2^7 = 8 KiB largest block
const TASK_REGION_BYTES: usize = 256 * 1024;
const TASK_SLAB_BYTES: usize = 4096;

static mut TASK_REGION: Align4K<TASK_REGION_BYTES> = Align4K([0; TASK_REGION_BYTES]);

type TaskCache = kernel_slab::SlabCache<kernel_buddy::BuddyAllocator<TASK_ORDERS>>;

static TASK_CACHE: kernel_sync::Mutex<Option<TaskCache>, kernel_sync::RawSpin> =
    kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), None);

fn init_task_cache() {
    let va = (&raw const TASK_REGION) as usize;
    let mut backend = kernel_buddy::BuddyAllocator::<TASK_ORDERS>::new(TASK_MIN_BLOCK)
        .expect("TASK_MIN_BLOCK is a power of two");
    unsafe { backend.add_region(va, TASK_REGION_BYTES) };
    let cache = TaskCache::new(core::mem::size_of::<kernel_sched::Task>(), TASK_SLAB_BYTES, backend)
        .expect("a Task fits in one slab");
    *TASK_CACHE.lock() = Some(cache);
}

fn alloc_task(id: kernel_sched::TaskId, priority: kernel_sched::Priority, context: kernel_context::Context) -> NonNull<kernel_sched::Task> {
    let mut guard = TASK_CACHE.lock();
    let cache = guard.as_mut().expect("task cache initialized before first task");
    let object = cache.alloc().expect("out of task slots").cast::<kernel_sched::Task>();
    unsafe {
        object.as_ptr().write(kernel_sched::Task::new(id, priority, context));
    }
    object
}

// --- Physical frame allocator -------------------------------------------
//
// The primary path walks the loader-supplied, boot-mode-agnostic memory map
// (`KernelBootInfo::mmap`, one typed `MemoryRange` array regardless of
// BIOS/UEFI/multiboot2 origin) and sizes the bitmap/refcount tables from it
// on the heap. If the boot info fails its magic/version check, or reports
// no ranges at all (a loader that hasn't been updated yet, or a bare
// `qemu -kernel` smoke boot with no real handoff), the kernel falls back to
// one static, build-time-sized in-image pool so boot still completes.

unsafe extern "C" {
    static __kernel_phys_start: u8;
    static __kernel_phys_end: u8;
}

/// Physical span occupied by this kernel's own image (text/rodata/data/bss),
/// as fixed up by the linker script's absolute symbols.
fn kernel_image_phys_range() -> (u64, u64) {
    let start = (&raw const __kernel_phys_start) as u64;
    let end = (&raw const __kernel_phys_end) as u64;
    (start, end)
}

/// Upper bound on how much physical address space the boot-time allocator
/// will track, regardless of what the memory map reports. Keeps a garbled
/// or hostile map from demanding an unreasonable bitmap/refcount table.
const MAX_TRACKED_PHYS_BYTES: u64 = 16 * 1024 * 1024 * 1024;

fn init_pmm_from_mmap(bi: &KernelBootInfo) -> Option<kernel_pmm::PhysicalFrameAllocator<'static>> {
    if !bi.is_valid() {
        log::warn!("boot info failed magic/version check, falling back to the static frame pool");
        return None;
    }
    let ranges = unsafe { bi.mmap.ranges() };
    if ranges.is_empty() {
        log::warn!("boot info carried an empty memory map, falling back to the static frame pool");
        return None;
    }

    let highest_end = ranges
        .iter()
        .map(|r| r.base + r.len)
        .max()
        .unwrap_or(0)
        .min(MAX_TRACKED_PHYS_BYTES);
    let frame_count = (kernel_vmem::align_up(highest_end, 4096) / 4096) as usize;
    if frame_count == 0 {
        return None;
    }

    let bitmap: &'static mut [u64] = vec![0u64; frame_count.div_ceil(64)].leak();
    let refcounts: &'static mut [u16] = vec![0u16; frame_count].leak();
    let mut pmm = kernel_pmm::PhysicalFrameAllocator::new(PhysAddr::from_u64(0), frame_count, bitmap, refcounts);

    for range in ranges {
        if matches!(range.kind, MemoryRangeKind::Usable) {
            pmm.free_range(PhysAddr::from_u64(range.base), range.len);
        }
    }

    let (img_start, img_end) = kernel_image_phys_range();
    pmm.reserve_range(PhysAddr::from_u64(img_start), img_end - img_start);

    log::info!(
        "physical frame allocator online from boot memory map: {} frames, {} free",
        pmm.total_frames(),
        pmm.free_frames(),
    );
    Some(pmm)
}

const PMM_POOL_BYTES: usize = 4 * 1024 * 1024;
const PMM_FRAME_COUNT: usize = PMM_POOL_BYTES / 4096;
const PMM_BITMAP_WORDS: usize = PMM_FRAME_COUNT.div_ceil(64);

static mut PMM_POOL: Align4K<PMM_POOL_BYTES> = Align4K([0; PMM_POOL_BYTES]);
static mut PMM_BITMAP: [u64; PMM_BITMAP_WORDS] = [0; PMM_BITMAP_WORDS];
static mut PMM_REFCOUNTS: [u16; PMM_FRAME_COUNT] = [0; PMM_FRAME_COUNT];

fn init_pmm_fallback() -> kernel_pmm::PhysicalFrameAllocator<'static> {
    let va = (&raw const PMM_POOL) as u64;
    let pa = image_phys_addr(va);
    let bitmap = unsafe { core::slice::from_raw_parts_mut((&raw mut PMM_BITMAP).cast::<u64>(), PMM_BITMAP_WORDS) };
    let refcounts = unsafe { core::slice::from_raw_parts_mut((&raw mut PMM_REFCOUNTS).cast::<u16>(), PMM_FRAME_COUNT) };

    let mut pmm = kernel_pmm::PhysicalFrameAllocator::new(PhysAddr::from_u64(pa), PMM_FRAME_COUNT, bitmap, refcounts);
    pmm.free_range(PhysAddr::from_u64(pa), PMM_POOL_BYTES as u64);
    log::info!("physical frame pool online (static fallback): {} frames at {pa:#x}", pmm.total_frames());
    pmm
}

// --- Per-CPU state & scheduler -------------------------------------------

static mut CPU0_BLOCK: kernel_context::PerCpuBlock = kernel_context::PerCpuBlock::new(kernel_context::CpuId(0));

const IDLE_STACK_BYTES: usize = 16 * 1024;
static mut IDLE_STACK: Aligned<IDLE_STACK_BYTES> = Aligned([0; IDLE_STACK_BYTES]);

const DEMO_STACK_BYTES: usize = 16 * 1024;
static mut DEMO_STACK: Aligned<DEMO_STACK_BYTES> = Aligned([0; DEMO_STACK_BYTES]);

extern "C" fn idle_task_entry() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
        #[cfg(not(target_arch = "x86_64"))]
        spin_loop();
    }
}

extern "C" fn demo_task_entry() -> ! {
    log::info!("demo task running on its own stack");
    loop {
        on_timer_tick();
        spin_loop();
    }
}

static SCHEDULER: kernel_sync::Mutex<Option<kernel_sched::Scheduler>, kernel_sync::RawSpin> =
    kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), None);

/// CPU this single-core boot demo always schedules for. A multi-core build
/// would read this from the current [`kernel_context::PerCpuBlock`] instead.
const BOOT_CPU: u32 = 0;

/// Re-enqueue the current task (unless it's the idle task, which never sits
/// in a ready queue), pick the next runnable one for [`BOOT_CPU`], and
/// switch to it if it differs from current. This is the one place voluntary
/// yields (`task_yield`) and tick-driven preemption ([`on_timer_tick`]) both
/// funnel through.
fn reschedule() {
    let mut guard = SCHEDULER.lock();
    let Some(scheduler) = guard.as_mut() else {
        return;
    };
    let Some(current) = scheduler.current() else {
        return;
    };
    if current != scheduler.idle() {
        scheduler.enqueue(current);
    }
    let next = scheduler.pick_next(BOOT_CPU);
    if next == current {
        scheduler.set_current(next);
        return;
    }
    unsafe { scheduler.switch(current, next) };
}

/// Hook for a future timer interrupt handler: advance the current task's
/// time slice and, once it expires, preempt exactly the way a voluntary
/// yield does. No PIT/APIC driver exists yet to call this off real
/// hardware; `demo_task_entry` calls it directly to exercise the same path.
fn on_timer_tick() {
    let expired = {
        let mut guard = SCHEDULER.lock();
        guard.as_mut().is_some_and(kernel_sched::Scheduler::tick)
    };
    if expired {
        reschedule();
    }
}

fn current_task_id() -> u32 {
    SCHEDULER
        .lock()
        .as_ref()
        .and_then(kernel_sched::Scheduler::current)
        .map_or(0, |task| unsafe { task.as_ref().id.0 })
}

fn now_ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

/// Park the current task on `park` (the conduit's writer or reader wait
/// queue) and switch away. The caller retries its `try_send`/`try_recv`
/// exactly once after this returns, which happens only once something else
/// calls [`kernel_sched::Scheduler::unblock`] on this task and it gets
/// picked again.
///
/// No-op if there is no current task to block, or if the wait queue is
/// already full — either way the caller's retry will simply see the same
/// `WouldBlock*` error again.
fn block_current_on(park: impl FnOnce(NonNull<kernel_sched::Task>) -> Result<(), kernel_ipc::ConduitError>) {
    let mut guard = SCHEDULER.lock();
    let Some(scheduler) = guard.as_mut() else {
        return;
    };
    let Some(current) = scheduler.current() else {
        return;
    };
    if park(current).is_err() {
        return;
    }
    scheduler.block(current, kernel_sched::BlockReason::Conduit);
    let next = scheduler.pick_next(BOOT_CPU);
    unsafe { scheduler.switch(current, next) };
}

// --- Spawn pool -----------------------------------------------------------
//
// `task_spawn` hands out tasks running one of this build's own compiled-in
// entry functions, each backed by one of a handful of pre-reserved stacks —
// there is no userland loader yet to hand it an arbitrary entry point or
// back it with a freshly mapped stack.

const SPAWN_STACK_BYTES: usize = 16 * 1024;
static mut SPAWN_STACK_0: Aligned<SPAWN_STACK_BYTES> = Aligned([0; SPAWN_STACK_BYTES]);
static mut SPAWN_STACK_1: Aligned<SPAWN_STACK_BYTES> = Aligned([0; SPAWN_STACK_BYTES]);
static mut SPAWN_STACK_2: Aligned<SPAWN_STACK_BYTES> = Aligned([0; SPAWN_STACK_BYTES]);
static mut SPAWN_STACK_3: Aligned<SPAWN_STACK_BYTES> = Aligned([0; SPAWN_STACK_BYTES]);

static SPAWN_STACK_NEXT: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
static NEXT_SPAWNED_TASK_ID: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(2);

fn next_spawned_task_id() -> Option<kernel_sched::TaskId> {
    let id = NEXT_SPAWNED_TASK_ID.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    Some(kernel_sched::TaskId(id))
}

fn alloc_spawned_stack() -> Option<NonNull<u8>> {
    let slot = SPAWN_STACK_NEXT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    let top = match slot {
        0 => unsafe { (&raw mut SPAWN_STACK_0).cast::<u8>().add(SPAWN_STACK_BYTES) },
        1 => unsafe { (&raw mut SPAWN_STACK_1).cast::<u8>().add(SPAWN_STACK_BYTES) },
        2 => unsafe { (&raw mut SPAWN_STACK_2).cast::<u8>().add(SPAWN_STACK_BYTES) },
        3 => unsafe { (&raw mut SPAWN_STACK_3).cast::<u8>().add(SPAWN_STACK_BYTES) },
        _ => return None,
    };
    NonNull::new(top)
}

fn boot_scheduler() {
    let idle_top = unsafe { NonNull::new_unchecked((&raw mut IDLE_STACK).cast::<u8>().add(IDLE_STACK_BYTES)) };
    let idle_ctx = kernel_context::Context::new_stack(idle_top, idle_task_entry);
    let idle = alloc_task(kernel_sched::TaskId(0), kernel_sched::Priority::lowest(), idle_ctx);

    let mut scheduler = kernel_sched::Scheduler::new(idle);

    let demo_top = unsafe { NonNull::new_unchecked((&raw mut DEMO_STACK).cast::<u8>().add(DEMO_STACK_BYTES)) };
    let demo_ctx = kernel_context::Context::new_stack(demo_top, demo_task_entry);
    let demo = alloc_task(
        kernel_sched::TaskId(1),
        kernel_sched::Priority::new(3).expect("3 is a valid priority level"),
        demo_ctx,
    );
    scheduler.enqueue(demo);

    let picked = scheduler.pick_next(BOOT_CPU);
    log::info!("scheduler picked task {:?} to run first", unsafe { picked.as_ref().id });
    scheduler.set_current(picked);

    *SCHEDULER.lock() = Some(scheduler);
}

// --- Conduits & the name registry ----------------------------------------
//
// Every conduit slot is statically allocated (no conduit-sized heap
// allocation exists yet), so "creating" one really means claiming an unused
// slot out of a small fixed pool and stamping a name on it in the registry.
// The registry's own lock is always taken before a conduit instance's lock,
// matching the rest of this crate's conduit-registry-then-conduit ordering.

type ConduitSlotLock = kernel_ipc::ConduitLock<CONDUIT_DEFAULT_CAPACITY, CONDUIT_DEFAULT_WAITERS>;

const CONDUIT_SLOTS: usize = 4;
const CONDUIT_NAME_MAX: usize = 16;
const BOOT_DEMO_CONDUIT_HANDLE: u64 = 0;

static CONDUIT_0: ConduitSlotLock = kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), kernel_ipc::Conduit::new());
static CONDUIT_1: ConduitSlotLock = kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), kernel_ipc::Conduit::new());
static CONDUIT_2: ConduitSlotLock = kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), kernel_ipc::Conduit::new());
static CONDUIT_3: ConduitSlotLock = kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), kernel_ipc::Conduit::new());

fn conduit_slot(handle: u64) -> Option<&'static ConduitSlotLock> {
    match handle {
        0 => Some(&CONDUIT_0),
        1 => Some(&CONDUIT_1),
        2 => Some(&CONDUIT_2),
        3 => Some(&CONDUIT_3),
        _ => None,
    }
}

#[derive(Clone, Copy)]
struct ConduitRegistryEntry {
    name: [u8; CONDUIT_NAME_MAX],
    name_len: u8,
    refcount: u32,
}

impl ConduitRegistryEntry {
    const fn empty() -> Self {
        Self { name: [0; CONDUIT_NAME_MAX], name_len: 0, refcount: 0 }
    }

    fn matches(&self, name: &[u8]) -> bool {
        self.refcount > 0 && self.name_len as usize == name.len() && &self.name[..name.len()] == name
    }
}

static CONDUIT_REGISTRY: kernel_sync::Mutex<[ConduitRegistryEntry; CONDUIT_SLOTS], kernel_sync::RawSpin> =
    kernel_sync::Mutex::from_raw(kernel_sync::RawSpin::new(), [ConduitRegistryEntry::empty(); CONDUIT_SLOTS]);

fn register_boot_demo_conduit() {
    let mut registry = CONDUIT_REGISTRY.lock();
    let entry = &mut registry[BOOT_DEMO_CONDUIT_HANDLE as usize];
    let name = b"boot.demo";
    entry.name[..name.len()].copy_from_slice(name);
    entry.name_len = name.len() as u8;
    entry.refcount = 1;
}

fn demo_conduit_roundtrip() {
    let mut guard = CONDUIT_0.lock();
    guard
        .try_send(current_task_id(), b"hello from boot", now_ticks(), 0)
        .expect("demo send fits in a fresh conduit");
    let mut buf = [0u8; 32];
    let (header, _woken) = guard.try_recv(&mut buf).expect("demo message is waiting");
    log::info!(
        "conduit round-trip from sender {}: {:?}",
        header.sender,
        core::str::from_utf8(&buf[..header.len as usize]).unwrap_or("<binary>"),
    );
}

fn register_demo_broadcast_targets() {
    let mut registry = CONDUIT_REGISTRY.lock();
    for (handle, name) in [(1usize, &b"srv.log"[..]), (2usize, &b"srv.metrics"[..])] {
        let entry = &mut registry[handle];
        entry.name[..name.len()].copy_from_slice(name);
        entry.name_len = name.len() as u8;
        entry.refcount = 1;
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || (needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle))
}

/// For every Open conduit whose name contains `pattern`, attempt a
/// non-blocking send of `bytes`; returns how many accepted it.
fn conduit_broadcast(pattern: &[u8], bytes: &[u8]) -> u32 {
    let registry = CONDUIT_REGISTRY.lock();
    let mut delivered = 0u32;
    for (handle, entry) in registry.iter().enumerate() {
        if entry.refcount == 0 || !contains_subslice(&entry.name[..entry.name_len as usize], pattern) {
            continue;
        }
        if let Some(conduit) = conduit_slot(handle as u64) {
            if conduit.lock().try_send(current_task_id(), bytes, now_ticks(), 0).is_ok() {
                delivered += 1;
            }
        }
    }
    delivered
}

fn demo_conduit_broadcast() {
    register_demo_broadcast_targets();
    let delivered = conduit_broadcast(b"srv.", b"tick");
    log::info!("conduit broadcast to \"srv.\" delivered to {delivered} conduits");
}

// --- Syscall dispatch ------------------------------------------------------

struct Kernel<'a, 'm, M: PhysMapper> {
    domain: &'a mut Domain<'m, M>,
    frames: &'a mut kernel_pmm::PhysicalFrameAllocator<'static>,
}

impl<'a, 'm, M: PhysMapper> kernel_syscall::SyscallHandlers for Kernel<'a, 'm, M> {
    fn mem_alloc_frame(&mut self) -> Result<u64, kernel_syscall::ErrorCode> {
        self.frames
            .alloc_4k()
            .map(|pa| pa.as_u64())
            .ok_or(kernel_syscall::ErrorCode::OutOfMemory)
    }

    fn mem_free_frame(&mut self, frame_addr: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        self.frames.free_4k(PhysAddr::from_u64(frame_addr));
        Ok(0)
    }

    fn mem_map(&mut self, addr_hint: u64, len: u64, prot: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        if len == 0 {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        }
        let mut protection = Protection::READ;
        if prot & 0b010 != 0 {
            protection |= Protection::WRITE;
        }
        if prot & 0b100 != 0 {
            protection |= Protection::EXECUTE;
        }
        self.domain
            .create_region(VirtAddr::from_u64(addr_hint), len, protection, RegionKind::Anonymous, false)
            .map(|()| addr_hint)
            .map_err(|_| kernel_syscall::ErrorCode::InvalidArgument)
    }

    fn mem_unmap(&mut self, addr: u64, _len: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        self.domain
            .destroy_region(VirtAddr::from_u64(addr), self.frames)
            .map(|()| 0)
            .map_err(|_| kernel_syscall::ErrorCode::NotFound)
    }

    fn mem_protect(&mut self, _addr: u64, _len: u64, _prot: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        // Regions don't support changing protection in place yet; a caller
        // has to unmap and remap to get a different protection today.
        Err(kernel_syscall::ErrorCode::PermissionDenied)
    }

    fn conduit_create(&mut self, name_ptr: u64, name_len: u64, capacity: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        if name_ptr == 0 || name_len as usize > CONDUIT_NAME_MAX {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        }
        if capacity > CONDUIT_DEFAULT_CAPACITY as u64 {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        }
        let name = unsafe { core::slice::from_raw_parts(name_ptr as *const u8, name_len as usize) };

        let mut registry = CONDUIT_REGISTRY.lock();
        if registry.iter().any(|e| e.matches(name)) {
            return Err(kernel_syscall::ErrorCode::AlreadyExists);
        }
        let Some((handle, entry)) = registry.iter_mut().enumerate().find(|(_, e)| e.refcount == 0) else {
            return Err(kernel_syscall::ErrorCode::NoResources);
        };
        entry.name[..name.len()].copy_from_slice(name);
        entry.name_len = name.len() as u8;
        entry.refcount = 1;
        Ok(handle as u64)
    }

    fn conduit_open(&mut self, name_ptr: u64, name_len: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        if name_ptr == 0 || name_len as usize > CONDUIT_NAME_MAX {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        }
        let name = unsafe { core::slice::from_raw_parts(name_ptr as *const u8, name_len as usize) };

        let mut registry = CONDUIT_REGISTRY.lock();
        let Some((handle, entry)) = registry.iter_mut().enumerate().find(|(_, e)| e.matches(name)) else {
            return Err(kernel_syscall::ErrorCode::NotFound);
        };
        entry.refcount += 1;
        Ok(handle as u64)
    }

    fn conduit_send(&mut self, handle: u64, ptr: u64, len: u64, flags: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        let Some(conduit) = conduit_slot(handle) else {
            return Err(kernel_syscall::ErrorCode::NotFound);
        };
        if ptr == 0 || len == 0 {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        }
        let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) };
        let sender = current_task_id();
        let non_blocking = flags & kernel_syscall::CONDUIT_FLAG_NON_BLOCKING != 0;

        match conduit.lock().try_send(sender, bytes, now_ticks(), flags as u32) {
            Ok(_woken) => return Ok(len),
            Err(kernel_ipc::ConduitError::Closed) => return Err(kernel_syscall::ErrorCode::BrokenPipe),
            Err(kernel_ipc::ConduitError::MessageTooLarge(_)) => return Err(kernel_syscall::ErrorCode::MessageTooLarge),
            Err(kernel_ipc::ConduitError::WouldBlockFull) if non_blocking => {
                return Err(kernel_syscall::ErrorCode::WouldBlock);
            }
            Err(_) => {}
        }

        // Blocking path: park on the conduit's writer wait queue, switch
        // away, and on wake retry exactly once.
        block_current_on(|task| conduit.lock().park_sender(task));
        match conduit.lock().try_send(sender, bytes, now_ticks(), flags as u32) {
            Ok(_woken) => Ok(len),
            Err(kernel_ipc::ConduitError::Closed) => Err(kernel_syscall::ErrorCode::BrokenPipe),
            Err(kernel_ipc::ConduitError::MessageTooLarge(_)) => Err(kernel_syscall::ErrorCode::MessageTooLarge),
            Err(_) => Err(kernel_syscall::ErrorCode::WouldBlock),
        }
    }

    fn conduit_recv(&mut self, handle: u64, ptr: u64, len: u64, flags: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        let Some(conduit) = conduit_slot(handle) else {
            return Err(kernel_syscall::ErrorCode::NotFound);
        };
        if ptr == 0 {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        }
        let out = unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) };
        let non_blocking = flags & kernel_syscall::CONDUIT_FLAG_NON_BLOCKING != 0;

        match conduit.lock().try_recv(out) {
            Ok((header, _woken)) => return Ok(u64::from(header.len)),
            Err(kernel_ipc::ConduitError::Closed) => return Err(kernel_syscall::ErrorCode::BrokenPipe),
            Err(kernel_ipc::ConduitError::RecvBufferTooSmall(_)) => return Err(kernel_syscall::ErrorCode::MessageTooLarge),
            Err(kernel_ipc::ConduitError::WouldBlockEmpty) if non_blocking => {
                return Err(kernel_syscall::ErrorCode::WouldBlock);
            }
            Err(_) => {}
        }

        // Blocking path: park on the conduit's reader wait queue, switch
        // away, and on wake retry exactly once.
        block_current_on(|task| conduit.lock().park_receiver(task));
        match conduit.lock().try_recv(out) {
            Ok((header, _woken)) => Ok(u64::from(header.len)),
            Err(kernel_ipc::ConduitError::Closed) => Err(kernel_syscall::ErrorCode::BrokenPipe),
            Err(kernel_ipc::ConduitError::RecvBufferTooSmall(_)) => Err(kernel_syscall::ErrorCode::MessageTooLarge),
            Err(_) => Err(kernel_syscall::ErrorCode::WouldBlock),
        }
    }

    fn conduit_close(&mut self, handle: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        let Some(conduit) = conduit_slot(handle) else {
            return Err(kernel_syscall::ErrorCode::NotFound);
        };
        let mut registry = CONDUIT_REGISTRY.lock();
        let entry = &mut registry[handle as usize];
        if entry.refcount == 0 {
            return Err(kernel_syscall::ErrorCode::NotFound);
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entry.name_len = 0;
            conduit.lock().close(|_task| {});
        }
        Ok(0)
    }

    fn task_spawn(&mut self, entry: u64, priority: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        // The only entry points this boot build knows how to reach are its
        // own compiled-in task functions; callers pick one through `entry`
        // rather than supplying an arbitrary userland address, since there
        // is no userland loader here yet.
        let entry_fn = match entry {
            0 => idle_task_entry,
            1 => demo_task_entry,
            _ => return Err(kernel_syscall::ErrorCode::InvalidArgument),
        };
        let Ok(priority) = u8::try_from(priority) else {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        };
        let Ok(priority) = kernel_sched::Priority::new(priority) else {
            return Err(kernel_syscall::ErrorCode::InvalidArgument);
        };
        let Some(task_id) = next_spawned_task_id() else {
            return Err(kernel_syscall::ErrorCode::NoResources);
        };
        let Some(stack_top) = alloc_spawned_stack() else {
            return Err(kernel_syscall::ErrorCode::NoResources);
        };
        let context = kernel_context::Context::new_stack(stack_top, entry_fn);
        let task = alloc_task(task_id, priority, context);
        if let Some(scheduler) = SCHEDULER.lock().as_mut() {
            scheduler.enqueue(task);
        }
        Ok(task_id.0 as u64)
    }

    fn task_exit(&mut self, _code: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        // No task teardown path exists yet (every task this build creates
        // lives for the whole boot demo), so this is a reported no-op.
        Err(kernel_syscall::ErrorCode::PermissionDenied)
    }

    fn task_yield(&mut self) -> Result<u64, kernel_syscall::ErrorCode> {
        reschedule();
        Ok(0)
    }

    fn task_sleep(&mut self, _microseconds: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        // No timer/alarm subsystem exists yet to wake a sleeper back up, so
        // sleeping is reported as unsupported rather than blocking forever.
        Err(kernel_syscall::ErrorCode::PermissionDenied)
    }

    fn query_time(&mut self) -> Result<u64, kernel_syscall::ErrorCode> {
        #[cfg(target_arch = "x86_64")]
        {
            Ok(unsafe { core::arch::x86_64::_rdtsc() })
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Ok(0)
        }
    }

    fn capability_request(&mut self, _kind: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        // No capability table exists yet; every request is denied rather
        // than handing out a capability id nothing checks.
        Err(kernel_syscall::ErrorCode::PermissionDenied)
    }

    fn capability_drop(&mut self, _capability_id: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        Err(kernel_syscall::ErrorCode::PermissionDenied)
    }

    fn debug_write(&mut self, byte: u64) -> Result<u64, kernel_syscall::ErrorCode> {
        #[cfg(feature = "qemu")]
        kernel_qemu::qemu_fmt::dbg_putc(byte as u8);
        #[cfg(not(feature = "qemu"))]
        let _ = byte;
        Ok(0)
    }
}

fn blank_frame(sysno: kernel_syscall::Sysno, rdi: u64, rsi: u64, rdx: u64) -> kernel_syscall::TrapFrame {
    kernel_syscall::TrapFrame {
        rip: 0,
        cs: 0,
        rflags: 0,
        rsp: 0,
        ss: 0,
        rax: sysno as u64,
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

fn kernel_main(bi: &KernelBootInfo) -> ! {
    trace_boot_info(bi);

    init_heap();
    init_task_cache();

    let mut pmm = init_pmm_from_mmap(bi).unwrap_or_else(init_pmm_fallback);
    let mapper = KernelPhysMapper;

    // One scratch domain demonstrates region reservation and demand-paged
    // fault handling. Its PML4 is freshly allocated and never installed
    // over CR3: `Domain::new` has no way to adopt the loader's currently
    // active address space, and swapping CR3 onto a tree that doesn't yet
    // mirror the kernel's own upper-half mappings would fault the moment
    // this function's own code or stack needed to be fetched again.
    let mut domain = Domain::new(&mapper, &mut pmm).expect("create demo domain");
    domain
        .create_region(VirtAddr::from_u64(0x1000_0000), 4096, Protection::READ | Protection::WRITE, RegionKind::Anonymous, false)
        .expect("reserve demo region");
    match domain.handle_fault(VirtAddr::from_u64(0x1000_0000), true, &mut pmm) {
        Ok(outcome) => log::info!("demo region fault resolved: {outcome:?}"),
        Err(err) => log::error!("demo region fault failed: {err}"),
    }

    unsafe { kernel_context::install_per_cpu(NonNull::new_unchecked(&raw mut CPU0_BLOCK)) };
    boot_scheduler();
    register_boot_demo_conduit();
    demo_conduit_roundtrip();
    demo_conduit_broadcast();

    {
        let mut handlers = Kernel { domain: &mut domain, frames: &mut pmm };

        let mut tf = blank_frame(kernel_syscall::Sysno::DebugWrite, u64::from(b'K'), 0, 0);
        kernel_syscall::dispatch(&mut tf, &mut handlers);
        log::info!("debug_write syscall returned {:#x}", tf.rax);

        let mut tf = blank_frame(kernel_syscall::Sysno::MemMap, 0x2000_0000, 4096, 0b011);
        kernel_syscall::dispatch(&mut tf, &mut handlers);
        log::info!("mem_map syscall returned {:#x}", tf.rax);

        let mut tf = blank_frame(kernel_syscall::Sysno::QueryTime, 0, 0, 0);
        kernel_syscall::dispatch(&mut tf, &mut handlers);
        log::info!("query_time syscall returned {:#x}", tf.rax);
    }

    // Hand off to the task the scheduler already chose as current, once,
    // with nothing to return to: the boot stack this function has been
    // running on belongs to no Task and is discarded the moment the switch
    // lands, so the lock must come off before the switch rather than be
    // held across it like `reschedule`/`block_current_on` do.
    let next = {
        let guard = SCHEDULER.lock();
        guard.as_ref().and_then(kernel_sched::Scheduler::current)
    };
    if let Some(next) = next {
        let mut boot_context = kernel_context::Context::empty();
        unsafe {
            kernel_context::switch_to(&mut boot_context, &raw const (*next.as_ptr()).context);
        }
    }

    log::info!("entering idle loop");
    loop {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
        #[cfg(not(target_arch = "x86_64"))]
        spin_loop();
    }
}
