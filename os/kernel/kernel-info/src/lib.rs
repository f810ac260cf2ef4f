//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the core data structures, memory layout constants, and
//! boot interface contracts that govern the kernel's initialization and
//! runtime operation. It serves as the authoritative source for system-wide
//! configuration and provides stable ABI definitions for communication
//! between the loader and the kernel.
//!
//! ## Architecture
//!
//! The crate is organized into two primary modules:
//!
//! ### Boot Information ([`boot`])
//! Defines the loader-to-kernel handoff interface: the kernel entry point's
//! calling convention, the physical memory map, the ACPI root pointer, and
//! how many CPUs were discovered before hand-off.
//!
//! ### Memory Layout ([`memory`])
//! Establishes the kernel's virtual memory architecture (higher-half
//! layout, HHDM base, kernel stack size) plus the tunables the scheduler
//! and conduit subsystems are built against (CPU count ceiling, tick rate,
//! default conduit sizing) so every subsystem reads the same numbers.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Boot Protocol
//!
//! ```rust
//! # use kernel_info::boot::KernelBootInfo;
//! pub type KernelEntryFn = extern "win64" fn(*const KernelBootInfo) -> !;
//! ```
//!
//! * **Calling Convention**: Windows x64 ABI, since the reference loader is
//!   UEFI-based — a non-UEFI loader thunks into the same signature.
//! * **Parameter**: Single pointer to boot information.
//! * **No Return**: the kernel assumes control permanently.
//!
//! ### Build Script Integration
//! ```rust
//! // In build.rs
//! use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};
//!
//! println!("cargo:rustc-link-arg=--defsym=KERNEL_BASE={:#x}", KERNEL_BASE);
//! println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={:#x}", PHYS_LOAD);
//! ```
//!
//! ### Loader Integration
//! ```rust,ignore
//! use kernel_info::boot::{BootMode, BOOT_INFO_MAGIC, BOOT_INFO_VERSION};
//! use kernel_info::boot::{KernelBootInfo, KernelEntryFn, MemoryMapInfo};
//!
//! let boot_info = KernelBootInfo {
//!     magic: BOOT_INFO_MAGIC,
//!     version: BOOT_INFO_VERSION,
//!     mode: BootMode::Direct,
//!     mmap: MemoryMapInfo { ranges_ptr: core::ptr::null(), len: 0 },
//!     rsdp_addr: 0,
//!     cpu_count: 1,
//!     boot_stack_top: 0,
//! };
//!
//! let kernel_entry: KernelEntryFn = /* kernel entry point */;
//! kernel_entry(&boot_info); // Transfer control to kernel
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
