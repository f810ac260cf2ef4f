//! # Address Space (x86-64, PML4-rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual
//! address space (a tree rooted at a PML4 frame).
//!
//! ## Design
//!
//! - Non-leaf entries are created with caller-provided flags (typically
//!   present + writable, US as needed). Leaf flags come from the mapping
//!   call; we never silently add US/GLOBAL/NX.
//! - Keeps `unsafe` confined to mapping a physical frame to a typed table
//!   through the [`PhysMapper`].
//!
//! ## Safety
//!
//! Mutating an existing leaf in place (`set_flags_4k`, `unmap_one`) flushes
//! the affected page itself via `invlpg` before returning, so the CPU never
//! sees a stale translation for it. A freshly created mapping (`map_one`)
//! needs none: there was no prior translation to go stale. Switching the
//! whole address space (`activate`) still flushes everything non-global, by
//! construction of the CR3 reload.

use crate::addresses::{PhysAddr, VirtAddr};
use crate::page_table::{PageTable, PageTableEntry};
use crate::{get_table, read_cr3_phys, tlb_flush, Flags, FrameAlloc, PageSize, PhysMapper};
use log::trace;

/// Handle to a single, concrete address space (a PML4 tree).
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysAddr,
    mapper: &'m M,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressSpaceError {
    #[error("out of memory while allocating a page-table frame")]
    OutOfMemory,
    #[error("address {0:?} is not aligned for the requested page size")]
    Unaligned(VirtAddr),
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate a fresh PML4 frame and build an empty address space.
    ///
    /// # Errors
    /// Returns [`AddressSpaceError::OutOfMemory`] if the allocator is
    /// exhausted.
    pub fn new(mapper: &'m M, alloc: &mut impl FrameAlloc) -> Result<Self, AddressSpaceError> {
        let root = alloc.alloc_4k().ok_or(AddressSpaceError::OutOfMemory)?;
        unsafe { get_table(mapper, root).zero() };
        Ok(Self { root, mapper })
    }

    /// Wrap an already-allocated, zeroed PML4 frame.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: PhysAddr) -> Self {
        Self { root, mapper }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// Must run at CPL0 with paging enabled; assumes CR3 points at a valid
    /// PML4 frame.
    #[inline]
    #[must_use]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        let root = unsafe { read_cr3_phys() };
        Self { root, mapper }
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// Caller must ensure the code currently executing remains mapped after
    /// the switch (kernel half must be identical, or execution will fault).
    #[inline]
    pub unsafe fn activate(&self) {
        let cr3 = self.root.as_u64();
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = cr3;
    }

    /// Physical frame of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Translate a virtual address to a physical address if mapped. Handles
    /// 1 GiB and 2 MiB leaves by adding the in-page offset.
    #[must_use]
    pub fn query(&self, va: VirtAddr) -> Option<(PhysAddr, Flags)> {
        match self.walk(va) {
            WalkResult::Leaf1G { entry, .. } => {
                let off = va.as_u64() & (PageSize::Size1G.bytes() - 1);
                Some((PhysAddr::from_u64(entry.addr() + off), entry.flags()))
            }
            WalkResult::Leaf2M { entry, .. } => {
                let off = va.as_u64() & (PageSize::Size2M.bytes() - 1);
                Some((PhysAddr::from_u64(entry.addr() + off), entry.flags()))
            }
            WalkResult::L1 { entry, .. } if entry.present() => {
                let off = va.as_u64() & 0xfff;
                Some((PhysAddr::from_u64(entry.addr() + off), entry.flags()))
            }
            WalkResult::L1 { .. } | WalkResult::Missing => None,
        }
    }

    /// Overwrite the leaf entry at `va` in place (used to toggle flags such
    /// as write-protect for copy-on-write, without changing the mapped
    /// frame). Only supports 4 KiB leaves.
    ///
    /// # Errors
    /// Returns an error if no 4 KiB leaf exists at `va`.
    pub fn set_flags_4k(&self, va: VirtAddr, flags: Flags) -> Result<(), AddressSpaceError> {
        match self.walk(va) {
            WalkResult::L1 { pt, index, entry } if entry.present() => {
                let addr = PhysAddr::from_u64(entry.addr());
                pt.set(index, PageTableEntry::new(addr, flags));
                unsafe { tlb_flush(va) };
                Ok(())
            }
            _ => Err(AddressSpaceError::Unaligned(va)),
        }
    }

    /// Map **one** page at `va -> pa` with size `size` and `leaf_flags`.
    /// Intermediate tables are created on demand with `nonleaf_flags`.
    ///
    /// # Errors
    /// Propagates allocator exhaustion or misalignment.
    pub fn map_one(
        &self,
        alloc: &mut impl FrameAlloc,
        va: VirtAddr,
        pa: PhysAddr,
        size: PageSize,
        nonleaf_flags: Flags,
        leaf_flags: Flags,
    ) -> Result<(), AddressSpaceError> {
        if !va.is_aligned(size.bytes()) || !pa.is_aligned(size.bytes()) {
            return Err(AddressSpaceError::Unaligned(va));
        }

        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let pdpt_pa = self.ensure_next(pml4, va.pml4_index(), alloc, nonleaf_flags)?;
        let pdpt = unsafe { get_table(self.mapper, pdpt_pa) };

        if matches!(size, PageSize::Size1G) {
            pdpt.set(
                va.pdpt_index(),
                PageTableEntry::new(pa, leaf_flags | Flags::PRESENT | Flags::PS),
            );
            trace!("mapped 1G page at {va:?} -> {pa:?}");
            return Ok(());
        }

        let pd_pa = self.ensure_next(pdpt, va.pdpt_index(), alloc, nonleaf_flags)?;
        let pd = unsafe { get_table(self.mapper, pd_pa) };

        if matches!(size, PageSize::Size2M) {
            pd.set(
                va.pd_index(),
                PageTableEntry::new(pa, leaf_flags | Flags::PRESENT | Flags::PS),
            );
            trace!("mapped 2M page at {va:?} -> {pa:?}");
            return Ok(());
        }

        let pt_pa = self.ensure_next(pd, va.pd_index(), alloc, nonleaf_flags)?;
        let pt = unsafe { get_table(self.mapper, pt_pa) };
        pt.set(
            va.pt_index(),
            PageTableEntry::new(pa, leaf_flags | Flags::PRESENT),
        );
        trace!("mapped 4K page at {va:?} -> {pa:?}");
        Ok(())
    }

    /// Unmap a single 4 KiB page at `va`.
    ///
    /// # Errors
    /// Returns an error if no 4 KiB leaf is mapped at `va` (including when a
    /// huge-page leaf covers it instead).
    pub fn unmap_one(&self, va: VirtAddr) -> Result<PhysAddr, AddressSpaceError> {
        match self.walk(va) {
            WalkResult::L1 { pt, index, entry } if entry.present() => {
                pt.set_zero(index);
                unsafe { tlb_flush(va) };
                Ok(PhysAddr::from_u64(entry.addr()))
            }
            _ => Err(AddressSpaceError::Unaligned(va)),
        }
    }

    /// Resolve or allocate the next-level table referenced by `parent[index]`.
    fn ensure_next(
        &self,
        parent: &mut PageTable,
        index: usize,
        alloc: &mut impl FrameAlloc,
        nonleaf_flags: Flags,
    ) -> Result<PhysAddr, AddressSpaceError> {
        let entry = parent.entry(index);
        if entry.present() {
            if entry.ps() {
                return Err(AddressSpaceError::Unaligned(VirtAddr::from_u64(0)));
            }
            return Ok(PhysAddr::from_u64(entry.addr()));
        }

        let frame = alloc.alloc_4k().ok_or(AddressSpaceError::OutOfMemory)?;
        unsafe { get_table(self.mapper, frame).zero() };
        parent.set(
            index,
            PageTableEntry::new(frame, nonleaf_flags | Flags::PRESENT),
        );
        Ok(frame)
    }

    /// Internal walker: resolves `va` to the point it terminates.
    fn walk(&self, va: VirtAddr) -> WalkResult<'_> {
        let pml4 = unsafe { get_table(self.mapper, self.root) };
        let e4 = pml4.entry(va.pml4_index());
        if !e4.present() {
            return WalkResult::Missing;
        }

        let pdpt = unsafe { get_table(self.mapper, PhysAddr::from_u64(e4.addr())) };
        let e3 = pdpt.entry(va.pdpt_index());
        if !e3.present() {
            return WalkResult::Missing;
        }
        if e3.ps() {
            return WalkResult::Leaf1G { pdpt, entry: e3 };
        }

        let pd = unsafe { get_table(self.mapper, PhysAddr::from_u64(e3.addr())) };
        let e2 = pd.entry(va.pd_index());
        if !e2.present() {
            return WalkResult::Missing;
        }
        if e2.ps() {
            return WalkResult::Leaf2M { pd, entry: e2 };
        }

        let pt = unsafe { get_table(self.mapper, PhysAddr::from_u64(e2.addr())) };
        let index = va.pt_index();
        let entry = pt.entry(index);
        WalkResult::L1 { pt, index, entry }
    }

    /// Copy kernel upper-half PML4 entries (slots 256..=511) from `src` into
    /// `self`, aliasing the same kernel page-table subtrees.
    pub fn clone_upper_half_from(&mut self, src: &Self) {
        let dst = unsafe { get_table(self.mapper, self.root) };
        let source = unsafe { get_table(self.mapper, src.root) };
        for i in 256..PageTable::len() {
            let e = source.entry(i);
            if e.present() {
                dst.set(i, e);
            }
        }
    }
}

/// Result of a table walk.
enum WalkResult<'a> {
    Leaf1G {
        #[allow(dead_code)]
        pdpt: &'a mut PageTable,
        entry: PageTableEntry,
    },
    Leaf2M {
        #[allow(dead_code)]
        pd: &'a mut PageTable,
        entry: PageTableEntry,
    },
    L1 {
        pt: &'a mut PageTable,
        index: usize,
        entry: PageTableEntry,
    },
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysAddr> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysAddr::from_u64(p))
        }

        fn free_4k(&mut self, _frame: PhysAddr) {}
    }

    #[repr(align(4096))]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(Aligned4K([0u8; 4096]));
            }
            Self { frames: v }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            debug_assert_eq!(pa.as_u64() & 0xfff, 0);
            unsafe { &mut *(core::ptr::addr_of!(self.frames[idx]) as *mut T) }
        }
    }

    #[test]
    fn map_one_4k_then_query() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtAddr::from_u64(0xffff_8000_0000_0000);
        let pa = PhysAddr::from_u64(0x0030_0000);
        aspace
            .map_one(
                &mut alloc,
                va,
                pa,
                PageSize::Size4K,
                Flags::WRITABLE,
                Flags::WRITABLE | Flags::GLOBAL | Flags::NX,
            )
            .unwrap();

        let (resolved, flags) = aspace.query(va).unwrap();
        assert_eq!(resolved, pa);
        assert!(flags.contains(Flags::WRITABLE | Flags::NX));
    }

    #[test]
    fn map_one_2m_sets_ps_and_offset_adds() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtAddr::from_u64(0xffff_8000_2000_0000);
        let pa = PhysAddr::from_u64(0x0400_0000);
        aspace
            .map_one(
                &mut alloc,
                va,
                pa,
                PageSize::Size2M,
                Flags::WRITABLE,
                Flags::WRITABLE,
            )
            .unwrap();

        let queried = VirtAddr::from_u64(va.as_u64() + 0x1234);
        let (resolved, _) = aspace.query(queried).unwrap();
        assert_eq!(resolved.as_u64(), pa.as_u64() + 0x1234);
    }

    #[test]
    fn unmap_then_query_is_none() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtAddr::from_u64(0xffff_8000_0000_1000);
        let pa = PhysAddr::from_u64(0x0031_0000);
        aspace
            .map_one(
                &mut alloc,
                va,
                pa,
                PageSize::Size4K,
                Flags::WRITABLE,
                Flags::WRITABLE,
            )
            .unwrap();
        assert!(aspace.query(va).is_some());
        aspace.unmap_one(va).unwrap();
        assert!(aspace.query(va).is_none());
    }

    #[test]
    fn map_one_rejects_misaligned_physical_address() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(0, 64 << 12);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtAddr::from_u64(0xffff_8000_0020_0000);
        let pa = PhysAddr::from_u64(0x0030_0001);
        let err = aspace
            .map_one(
                &mut alloc,
                va,
                pa,
                PageSize::Size2M,
                Flags::WRITABLE,
                Flags::WRITABLE,
            )
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::Unaligned(va));
    }
}
