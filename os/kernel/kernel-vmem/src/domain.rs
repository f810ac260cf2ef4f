//! # Address-Space Domains
//!
//! A [`Domain`] is the kernel's unit of virtual-memory ownership: a named
//! collection of [`Region`]s layered on top of an [`AddressSpace`], with
//! copy-on-write fork and demand-paged fault handling.
//!
//! Regions never overlap. Each tracks its own protection flags and backing
//! kind; the domain itself only maps pages lazily (on first fault) except
//! where a region is created pre-populated.

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::addresses::{PhysAddr, VirtAddr};
use crate::{align_down, align_up, Flags, FrameAlloc, PageSize, PhysMapper};
use alloc::vec::Vec;

/// Frame allocator extended with the reference counting copy-on-write needs
/// to know whether a shared physical frame can be freed or must be
/// decremented instead.
pub trait RefCountedFrameAlloc: FrameAlloc {
    /// Increment the share count of an already-allocated frame.
    fn inc_ref(&mut self, frame: PhysAddr);

    /// Decrement the share count; returns the count after decrementing.
    fn dec_ref(&mut self, frame: PhysAddr) -> u32;

    /// Current share count (1 for an exclusively-owned frame).
    fn ref_count(&self, frame: PhysAddr) -> u32;
}

bitflags::bitflags! {
    /// User-facing protection requested for a region, independent of the
    /// paging-level [`Flags`] used to realize it.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Protection: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER    = 1 << 3;
    }
}

impl Protection {
    fn to_leaf_flags(self) -> Flags {
        let mut f = Flags::PRESENT;
        if self.contains(Self::WRITE) {
            f |= Flags::WRITABLE;
        }
        if self.contains(Self::USER) {
            f |= Flags::USER;
        }
        if !self.contains(Self::EXECUTE) {
            f |= Flags::NX;
        }
        f
    }
}

/// What backs a region's pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Anonymous, zero-filled-on-demand memory (heap, stack, bss).
    Anonymous,
    /// Pages shared verbatim with another domain (no COW — writes by either
    /// side are visible to both).
    Shared,
}

/// A contiguous, page-aligned range of virtual memory within a [`Domain`].
#[derive(Clone, Debug)]
pub struct Region {
    pub base: VirtAddr,
    pub len: u64,
    pub protection: Protection,
    pub kind: RegionKind,
    pub huge_pages: bool,
}

impl Region {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.len
    }

    fn contains(&self, va: VirtAddr) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end()
    }

    fn overlaps(&self, base: u64, len: u64) -> bool {
        base < self.end() && base + len > self.base.as_u64()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("region [{0:#x}, {1:#x}) overlaps an existing region")]
    Overlap(u64, u64),
    #[error("address {0:?} is not covered by any region")]
    NoRegion(VirtAddr),
    #[error(transparent)]
    AddressSpace(#[from] AddressSpaceError),
    #[error("out of physical memory")]
    OutOfMemory,
}

/// Outcome of handling a page fault within a domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// A copy-on-write page was duplicated; execution may resume.
    CowResolved,
    /// A page was demand-allocated and zeroed; execution may resume.
    DemandFilled,
    /// The fault address has no covering region, or violates the region's
    /// protection (e.g. write to a read-only mapping that isn't COW).
    Invalid,
}

/// A virtual-memory domain: an address space plus the regions within it.
pub struct Domain<'m, M: PhysMapper> {
    aspace: AddressSpace<'m, M>,
    mapper: &'m M,
    regions: Vec<Region>,
}

impl<'m, M: PhysMapper> Domain<'m, M> {
    /// Create a new, empty domain with a freshly allocated root page table.
    ///
    /// # Errors
    /// Propagates allocator exhaustion from [`AddressSpace::new`].
    pub fn new(mapper: &'m M, alloc: &mut impl RefCountedFrameAlloc) -> Result<Self, DomainError> {
        let aspace = AddressSpace::new(mapper, alloc)?;
        Ok(Self {
            aspace,
            mapper,
            regions: Vec::new(),
        })
    }

    #[must_use]
    pub fn root(&self) -> PhysAddr {
        self.aspace.root()
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Reserve `[base, base+len)` for `kind`/`protection`. Pages are not
    /// backed until first touched (or immediately, for huge-page regions
    /// that must be contiguous).
    ///
    /// # Errors
    /// Returns [`DomainError::Overlap`] if the range intersects an existing
    /// region.
    pub fn create_region(
        &mut self,
        base: VirtAddr,
        len: u64,
        protection: Protection,
        kind: RegionKind,
        huge_pages: bool,
    ) -> Result<(), DomainError> {
        let base_aligned = align_down(base.as_u64(), 4096);
        let len_aligned = align_up(len, 4096);
        if self.regions.iter().any(|r| r.overlaps(base_aligned, len_aligned)) {
            return Err(DomainError::Overlap(base_aligned, base_aligned + len_aligned));
        }
        self.regions.push(Region {
            base: VirtAddr::from_u64(base_aligned),
            len: len_aligned,
            protection,
            kind,
            huge_pages,
        });
        Ok(())
    }

    /// Remove the region covering `base` and unmap + free all of its
    /// present pages.
    ///
    /// # Errors
    /// Returns [`DomainError::NoRegion`] if no region starts at `base`.
    pub fn destroy_region(
        &mut self,
        base: VirtAddr,
        alloc: &mut impl RefCountedFrameAlloc,
    ) -> Result<(), DomainError> {
        let idx = self
            .regions
            .iter()
            .position(|r| r.base.as_u64() == base.as_u64())
            .ok_or(DomainError::NoRegion(base))?;
        let region = self.regions.remove(idx);
        self.unmap_region_pages(&region, alloc);
        Ok(())
    }

    fn unmap_region_pages(&self, region: &Region, alloc: &mut impl RefCountedFrameAlloc) {
        let mut off = 0u64;
        while off < region.len {
            let va = VirtAddr::from_u64(region.base.as_u64() + off);
            if let Ok(frame) = self.aspace.unmap_one(va) {
                if alloc.dec_ref(frame) == 0 {
                    alloc.free_4k(frame);
                }
            }
            off += PageSize::Size4K.bytes();
        }
    }

    /// Tear down the entire domain: unmap and free every region's pages.
    /// The PML4 frame itself is returned to `alloc`.
    pub fn destroy(mut self, alloc: &mut impl RefCountedFrameAlloc) {
        let regions = core::mem::take(&mut self.regions);
        for region in &regions {
            self.unmap_region_pages(region, alloc);
        }
        alloc.free_4k(self.aspace.root());
    }

    fn region_for(&self, va: VirtAddr) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(va))
    }

    /// Handle a page fault at `va`. `is_write` distinguishes a write fault
    /// (potential COW resolution) from a read/demand fault.
    ///
    /// # Errors
    /// Propagates allocator exhaustion and address-space mapping failures.
    pub fn handle_fault(
        &mut self,
        va: VirtAddr,
        is_write: bool,
        alloc: &mut impl RefCountedFrameAlloc,
    ) -> Result<FaultOutcome, DomainError> {
        let region = self.region_for(va).cloned().ok_or(DomainError::NoRegion(va))?;
        let page_va = VirtAddr::from_u64(align_down(va.as_u64(), 4096));

        if let Some((frame, flags)) = self.aspace.query(page_va) {
            if flags.contains(Flags::COW) && is_write {
                return self.resolve_cow(&region, page_va, frame, alloc).map(|()| FaultOutcome::CowResolved);
            }
            if !region.protection.contains(Protection::WRITE) && is_write {
                return Ok(FaultOutcome::Invalid);
            }
            return Ok(FaultOutcome::Invalid);
        }

        if !matches!(region.kind, RegionKind::Anonymous) {
            return Ok(FaultOutcome::Invalid);
        }

        let frame = alloc.alloc_4k().ok_or(DomainError::OutOfMemory)?;
        unsafe {
            let bytes: &mut [u8; 4096] = self.mapper.phys_to_mut(frame);
            bytes.fill(0);
        }
        self.aspace.map_one(
            alloc,
            page_va,
            frame,
            PageSize::Size4K,
            Flags::WRITABLE,
            region.protection.to_leaf_flags(),
        )?;
        Ok(FaultOutcome::DemandFilled)
    }

    /// Resolves a COW fault by either dropping the COW bit in place or
    /// splitting off a private copy. Both paths go through
    /// `set_flags_4k`/`unmap_one`, which already flush the rewritten page's
    /// TLB entry, so the stale-translation case this fault handler exists
    /// to fix can't outlive it.
    fn resolve_cow(
        &self,
        region: &Region,
        page_va: VirtAddr,
        frame: PhysAddr,
        alloc: &mut impl RefCountedFrameAlloc,
    ) -> Result<(), DomainError> {
        if alloc.ref_count(frame) <= 1 {
            // Sole owner: just drop the COW bit and make it writable.
            self.aspace.set_flags_4k(page_va, region.protection.to_leaf_flags())?;
            return Ok(());
        }

        let new_frame = alloc.alloc_4k().ok_or(DomainError::OutOfMemory)?;
        unsafe {
            let src: &[u8; 4096] = self.mapper.phys_to_mut(frame);
            let dst: &mut [u8; 4096] = self.mapper.phys_to_mut(new_frame);
            *dst = *src;
        }
        alloc.dec_ref(frame);
        self.aspace.unmap_one(page_va)?;
        self.aspace.map_one(
            alloc,
            page_va,
            new_frame,
            PageSize::Size4K,
            Flags::WRITABLE,
            region.protection.to_leaf_flags(),
        )?;
        Ok(())
    }

    /// Fork this domain's address space for a child, marking every private
    /// anonymous page copy-on-write in both parent and child and bumping its
    /// reference count.
    ///
    /// # Errors
    /// Propagates allocator exhaustion from building the child's tables.
    pub fn fork(&mut self, alloc: &mut impl RefCountedFrameAlloc) -> Result<Self, DomainError> {
        let mut child = Domain::new(self.mapper, alloc)?;
        child.regions = self.regions.clone();

        for region in &self.regions {
            let cow = matches!(region.kind, RegionKind::Anonymous);
            let mut off = 0u64;
            while off < region.len {
                let va = VirtAddr::from_u64(region.base.as_u64() + off);
                if let Some((frame, flags)) = self.aspace.query(va) {
                    let new_flags = if cow {
                        (flags & !Flags::WRITABLE) | Flags::COW
                    } else {
                        flags
                    };
                    if cow {
                        self.aspace.set_flags_4k(va, new_flags)?;
                    }
                    alloc.inc_ref(frame);
                    child.aspace.map_one(
                        alloc,
                        va,
                        frame,
                        PageSize::Size4K,
                        Flags::WRITABLE,
                        new_flags,
                    )?;
                }
                off += PageSize::Size4K.bytes();
            }
        }
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct TestPhys {
        frames: Vec<Box<[u8; 4096]>>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| Box::new([0u8; 4096])).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            unsafe { &mut *(self.frames[idx].as_ptr() as *mut T) }
        }
    }

    struct TestAlloc {
        next: u64,
        end: u64,
        refs: Mutex<HashMap<u64, u32>>,
    }

    impl TestAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: start,
                end,
                refs: Mutex::new(HashMap::new()),
            }
        }
    }

    impl FrameAlloc for TestAlloc {
        fn alloc_4k(&mut self) -> Option<PhysAddr> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            self.refs.lock().unwrap().insert(p, 1);
            Some(PhysAddr::from_u64(p))
        }

        fn free_4k(&mut self, frame: PhysAddr) {
            self.refs.lock().unwrap().remove(&frame.as_u64());
        }
    }

    impl RefCountedFrameAlloc for TestAlloc {
        fn inc_ref(&mut self, frame: PhysAddr) {
            *self.refs.lock().unwrap().entry(frame.as_u64()).or_insert(1) += 1;
        }

        fn dec_ref(&mut self, frame: PhysAddr) -> u32 {
            let mut refs = self.refs.lock().unwrap();
            let count = refs.entry(frame.as_u64()).or_insert(1);
            *count -= 1;
            *count
        }

        fn ref_count(&self, frame: PhysAddr) -> u32 {
            *self.refs.lock().unwrap().get(&frame.as_u64()).unwrap_or(&0)
        }
    }

    #[test]
    fn demand_fault_fills_zeroed_page() {
        let phys = TestPhys::with_frames(128);
        let mut alloc = TestAlloc::new(0, 128 << 12);
        let mut domain = Domain::new(&phys, &mut alloc).unwrap();
        domain
            .create_region(
                VirtAddr::from_u64(0x1000_0000),
                4096,
                Protection::READ | Protection::WRITE,
                RegionKind::Anonymous,
                false,
            )
            .unwrap();

        let outcome = domain
            .handle_fault(VirtAddr::from_u64(0x1000_0000), true, &mut alloc)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::DemandFilled);
        assert!(domain.query_has_mapping(VirtAddr::from_u64(0x1000_0000)));
    }

    #[test]
    fn fault_outside_region_is_invalid() {
        let phys = TestPhys::with_frames(128);
        let mut alloc = TestAlloc::new(0, 128 << 12);
        let mut domain = Domain::new(&phys, &mut alloc).unwrap();
        let err = domain
            .handle_fault(VirtAddr::from_u64(0x5000_0000), true, &mut alloc)
            .unwrap_err();
        assert_eq!(err, DomainError::NoRegion(VirtAddr::from_u64(0x5000_0000)));
    }

    #[test]
    fn fork_shares_frame_then_cow_splits_on_write() {
        let phys = TestPhys::with_frames(128);
        let mut alloc = TestAlloc::new(0, 128 << 12);
        let mut parent = Domain::new(&phys, &mut alloc).unwrap();
        parent
            .create_region(
                VirtAddr::from_u64(0x2000_0000),
                4096,
                Protection::READ | Protection::WRITE,
                RegionKind::Anonymous,
                false,
            )
            .unwrap();
        parent
            .handle_fault(VirtAddr::from_u64(0x2000_0000), true, &mut alloc)
            .unwrap();

        let mut child = parent.fork(&mut alloc).unwrap();

        let (parent_frame, parent_flags) = parent.aspace.query(VirtAddr::from_u64(0x2000_0000)).unwrap();
        assert!(parent_flags.contains(Flags::COW));
        assert_eq!(alloc.ref_count(parent_frame), 2);

        let outcome = child
            .handle_fault(VirtAddr::from_u64(0x2000_0000), true, &mut alloc)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::CowResolved);
        let (child_frame, child_flags) = child.aspace.query(VirtAddr::from_u64(0x2000_0000)).unwrap();
        assert_ne!(child_frame, parent_frame);
        assert!(!child_flags.contains(Flags::COW));
        assert_eq!(alloc.ref_count(parent_frame), 1);
    }

    impl<'m, M: PhysMapper> Domain<'m, M> {
        fn query_has_mapping(&self, va: VirtAddr) -> bool {
            self.aspace.query(va).is_some()
        }
    }
}
