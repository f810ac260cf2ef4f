//! # Page Table (single, uniform representation for PML4/PDPT/PD/PT)
//!
//! All four x86-64 paging levels share the same 512-entry, 8-byte-entry
//! layout, so a single [`PageTable`]/[`PageTableEntry`] pair stands in for
//! all of them. The level only changes how the caller interprets
//! [`Flags::PS`](crate::Flags::PS) and the walk order.

use crate::addresses::PhysAddr;
use crate::Flags;

/// One 4 KiB, 512-entry page table (any level).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Zero out every entry (all-not-present).
    pub fn zero(&mut self) {
        for e in &mut self.entries {
            *e = PageTableEntry(0);
        }
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub fn set_zero(&mut self, index: usize) {
        self.entries[index] = PageTableEntry(0);
    }

    #[inline]
    #[must_use]
    pub const fn len() -> usize {
        512
    }
}

/// A single page-table entry (PML4E/PDPTE/PDE/PTE). Interpretation of the
/// `PS` bit depends on the level the entry lives at.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PageTableEntry(u64);

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(addr: PhysAddr, flags: Flags) -> Self {
        Self((addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    #[inline]
    #[must_use]
    pub const fn present(self) -> bool {
        self.0 & Flags::PRESENT.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        self.0 & Flags::WRITABLE.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn user(self) -> bool {
        self.0 & Flags::USER.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn ps(self) -> bool {
        self.0 & Flags::PS.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn global(self) -> bool {
        self.0 & Flags::GLOBAL.bits() != 0
    }

    #[inline]
    #[must_use]
    pub const fn nx(self) -> bool {
        self.0 & Flags::NX.bits() != 0
    }

    /// The physical address this entry refers to (frame or next table), with
    /// low/high flag bits masked away.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> Flags {
        Flags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "PageTableEntry {{ addr: {:#x}, present: {}, writable: {}, user: {}, ps: {} }}",
            self.addr(),
            self.present(),
            self.writable(),
            self.user(),
            self.ps()
        )
    }
}
