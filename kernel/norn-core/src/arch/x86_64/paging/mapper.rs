//! Page table mapper: walks and builds x86-64 4-level page tables.
//!
//! All physical addresses are dereferenced through a translation offset
//! (`virt = phys + dm_offset`), which is the direct-map base in the kernel
//! and an arbitrary buffer offset in host tests. Physical addresses are
//! used for all comparisons and link values; virtual addresses only for
//! loads and stores.

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86_64::structures::paging::{PageTable, PageTableEntry, PageTableFlags};

/// Size of a 4 KiB page.
const PAGE_SIZE_4K: u64 = 4096;
/// Size of a 2 MiB page.
const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;
/// Size of a 1 GiB page.
const PAGE_SIZE_1G: u64 = 1024 * 1024 * 1024;

/// Paging operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// Address is misaligned or not canonical.
    InvalidAddress,
    /// No mapping exists at the given address.
    NotMapped,
    /// A mapping already exists at the given address.
    AlreadyMapped,
}

impl core::fmt::Display for PagingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::NotMapped => write!(f, "not mapped"),
            Self::AlreadyMapped => write!(f, "already mapped"),
        }
    }
}

/// High-level mapping attribute, mapped onto the `WRITABLE` and
/// `NO_EXECUTE` entry bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Readable only.
    ReadOnly,
    /// Readable and writable.
    ReadWrite,
    /// Readable and executable.
    Executable,
    /// Readable, writable, and executable.
    ReadWriteExecutable,
}

impl Attribute {
    /// Converts the attribute (plus the user/kernel flag) to leaf entry flags.
    pub fn leaf_flags(self, user: bool) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        match self {
            Self::ReadOnly => flags |= PageTableFlags::NO_EXECUTE,
            Self::ReadWrite => flags |= PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
            Self::Executable => {}
            Self::ReadWriteExecutable => flags |= PageTableFlags::WRITABLE,
        }
        if user {
            flags |= PageTableFlags::USER;
        }
        flags
    }
}

/// Utility for walking and building page tables through a direct-map offset.
pub struct PageTableMapper {
    dm_offset: u64,
}

impl PageTableMapper {
    /// Creates a new mapper with the given physical-to-virtual offset.
    pub const fn new(dm_offset: u64) -> Self {
        Self { dm_offset }
    }

    /// Converts a physical address to its accessible virtual address.
    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        self.dm_offset.wrapping_add(phys.as_u64()) as *mut u8
    }

    /// Returns a mutable reference to the [`PageTable`] at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must point to a valid, 4 KiB-aligned table reachable through
    /// the translation offset.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Caller contract.
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Allocates and zeroes a new page table, returning its physical address.
    ///
    /// # Safety
    ///
    /// `alloc` must return 4 KiB-aligned frames reachable through the
    /// translation offset.
    unsafe fn alloc_table(&self, alloc: &mut dyn FnMut() -> PhysAddr) -> PhysAddr {
        let frame = alloc();
        // SAFETY: The frame was just allocated; zeroing prevents stale data
        // from being misinterpreted as present entries.
        unsafe {
            core::ptr::write_bytes(self.phys_to_virt(frame), 0, PAGE_SIZE_4K as usize);
        }
        frame
    }

    /// Intermediate entry flags: always writable/present, with `USER` when
    /// the leaf is user-accessible so ring 3 can traverse the walk.
    fn intermediate_flags(user: bool) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            flags |= PageTableFlags::USER;
        }
        flags
    }

    /// Ensures `table[index]` points at a next-level table, allocating one
    /// if absent. Fails with `AlreadyMapped` if the slot holds a huge page.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a valid table; `alloc` per [`Self::alloc_table`].
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        user: bool,
        alloc: &mut dyn FnMut() -> PhysAddr,
    ) -> Result<PhysAddr, PagingError> {
        // SAFETY: Caller contract.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            if entry.is_huge() {
                return Err(PagingError::AlreadyMapped);
            }
            // OR in USER for mixed kernel/user subtrees.
            let combined = entry.flags() | Self::intermediate_flags(user);
            if combined != entry.flags() {
                table.entries[index] = entry.with_flags(combined);
            }
            Ok(entry.address())
        } else {
            // SAFETY: Caller contract.
            let new_table = unsafe { self.alloc_table(alloc) };
            table.entries[index] =
                PageTableEntry::new(new_table, Self::intermediate_flags(user));
            Ok(new_table)
        }
    }

    /// Maps a single 4 KiB page.
    ///
    /// # Safety
    ///
    /// - `root` must point to a valid L4 table reachable through the offset.
    /// - `alloc` must return valid, unused 4 KiB frames.
    pub unsafe fn map_4k(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        attr: Attribute,
        user: bool,
        alloc: &mut dyn FnMut() -> PhysAddr,
    ) -> Result<(), PagingError> {
        if !virt.is_aligned(PAGE_SIZE_4K) || !phys.is_aligned(PAGE_SIZE_4K) {
            return Err(PagingError::InvalidAddress);
        }

        // SAFETY: Caller contract.
        let l3 = unsafe { self.ensure_table(root, virt.l4_index(), user, alloc)? };
        // SAFETY: ensure_table returned a valid next-level table.
        let l2 = unsafe { self.ensure_table(l3, virt.l3_index(), user, alloc)? };
        // SAFETY: Same as above.
        let l1 = unsafe { self.ensure_table(l2, virt.l2_index(), user, alloc)? };

        // SAFETY: l1 is a valid page table.
        let pt = unsafe { self.table_at(l1) };
        let idx = virt.l1_index();
        if pt.entries[idx].is_present() {
            return Err(PagingError::AlreadyMapped);
        }
        pt.entries[idx] = PageTableEntry::new(phys, attr.leaf_flags(user));
        Ok(())
    }

    /// Maps a 1 GiB page directly in the L3 table. Used only for the direct
    /// map window.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::map_4k`]; `virt` and `phys` must be 1 GiB
    /// aligned.
    pub unsafe fn map_1gib(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        attr: Attribute,
        alloc: &mut dyn FnMut() -> PhysAddr,
    ) -> Result<(), PagingError> {
        if !virt.is_aligned(PAGE_SIZE_1G) || !phys.is_aligned(PAGE_SIZE_1G) {
            return Err(PagingError::InvalidAddress);
        }

        // SAFETY: Caller contract.
        let l3 = unsafe { self.ensure_table(root, virt.l4_index(), false, alloc)? };
        // SAFETY: ensure_table returned a valid table.
        let pdpt = unsafe { self.table_at(l3) };
        let idx = virt.l3_index();
        if pdpt.entries[idx].is_present() {
            return Err(PagingError::AlreadyMapped);
        }
        pdpt.entries[idx] =
            PageTableEntry::new(phys, attr.leaf_flags(false) | PageTableFlags::PAGE_SIZE);
        Ok(())
    }

    /// Unmaps a 4 KiB page, returning the frame that was mapped.
    ///
    /// A huge-page mapping covering `virt` is reported as `NotMapped`: the
    /// address is not mapped *as a 4 KiB page* and huge leaves are never
    /// produced by [`Self::map_4k`].
    ///
    /// # Safety
    ///
    /// `root` must point to a valid L4 table. The caller must flush the TLB
    /// for `virt` afterwards.
    pub unsafe fn unmap_4k(&self, root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, PagingError> {
        if !virt.is_aligned(PAGE_SIZE_4K) {
            return Err(PagingError::InvalidAddress);
        }
        // SAFETY: Caller contract.
        let pt = unsafe { self.walk_to_l1(root, virt)? };
        let idx = virt.l1_index();
        let entry = pt.entries[idx];
        if !entry.is_present() {
            return Err(PagingError::NotMapped);
        }
        pt.entries[idx] = PageTableEntry::empty();
        Ok(entry.address())
    }

    /// Replaces the attribute bits of an existing 4 KiB mapping.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid L4 table. The caller must flush the TLB
    /// for `virt` afterwards.
    pub unsafe fn set_attribute_4k(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        attr: Attribute,
        user: bool,
    ) -> Result<(), PagingError> {
        if !virt.is_aligned(PAGE_SIZE_4K) {
            return Err(PagingError::InvalidAddress);
        }
        // SAFETY: Caller contract.
        let pt = unsafe { self.walk_to_l1(root, virt)? };
        let idx = virt.l1_index();
        let entry = pt.entries[idx];
        if !entry.is_present() {
            return Err(PagingError::NotMapped);
        }
        pt.entries[idx] = entry.with_flags(attr.leaf_flags(user));
        Ok(())
    }

    /// Walks to the L1 table covering `virt`, failing on absent or huge
    /// intermediate entries.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid L4 table.
    unsafe fn walk_to_l1(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
    ) -> Result<&mut PageTable, PagingError> {
        // SAFETY: Caller contract.
        let l4 = unsafe { self.table_at(root) };
        let l4e = l4.entries[virt.l4_index()];
        if !l4e.is_present() {
            return Err(PagingError::NotMapped);
        }

        // SAFETY: A present non-huge entry references a valid table.
        let l3 = unsafe { self.table_at(l4e.address()) };
        let l3e = l3.entries[virt.l3_index()];
        if !l3e.is_present() || l3e.is_huge() {
            return Err(PagingError::NotMapped);
        }

        // SAFETY: Same as above.
        let l2 = unsafe { self.table_at(l3e.address()) };
        let l2e = l2.entries[virt.l2_index()];
        if !l2e.is_present() || l2e.is_huge() {
            return Err(PagingError::NotMapped);
        }

        // SAFETY: Same as above.
        Ok(unsafe { self.table_at(l2e.address()) })
    }

    /// Translates a virtual address, honoring 1 GiB and 2 MiB leaves.
    ///
    /// Returns `None` on any non-present entry.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid L4 table.
    pub unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Caller contract.
        let l4 = unsafe { self.table_at(root) };
        let l4e = l4.entries[virt.l4_index()];
        if !l4e.is_present() {
            return None;
        }

        // SAFETY: Present entries reference valid tables.
        let l3 = unsafe { self.table_at(l4e.address()) };
        let l3e = l3.entries[virt.l3_index()];
        if !l3e.is_present() {
            return None;
        }
        if l3e.is_huge() {
            return Some(PhysAddr::new(
                l3e.address().as_u64() | (virt.as_u64() & (PAGE_SIZE_1G - 1)),
            ));
        }

        // SAFETY: Same as above.
        let l2 = unsafe { self.table_at(l3e.address()) };
        let l2e = l2.entries[virt.l2_index()];
        if !l2e.is_present() {
            return None;
        }
        if l2e.is_huge() {
            return Some(PhysAddr::new(
                l2e.address().as_u64() | (virt.as_u64() & (PAGE_SIZE_2M - 1)),
            ));
        }

        // SAFETY: Same as above.
        let l1 = unsafe { self.table_at(l2e.address()) };
        let l1e = l1.entries[virt.l1_index()];
        if !l1e.is_present() {
            return None;
        }
        Some(PhysAddr::new(
            l1e.address().as_u64() | virt.page_offset(),
        ))
    }

    /// Deep-clones the table at `table_phys` (level 4 = L4 .. level 1 = L1).
    ///
    /// Present entries referencing lower tables are cloned node-by-node;
    /// leaf entries (L1, or huge L3/L2) are copied verbatim except that the
    /// `USER` bit is forced off everywhere, so firmware-owned mappings
    /// cannot leak into ring 3.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a valid table of the stated level; `alloc` per
    /// [`Self::alloc_table`].
    pub unsafe fn clone_table(
        &self,
        level: usize,
        table_phys: PhysAddr,
        alloc: &mut dyn FnMut() -> PhysAddr,
    ) -> PhysAddr {
        debug_assert!((1..=4).contains(&level));
        // SAFETY: Caller contract.
        let new_phys = unsafe { self.alloc_table(alloc) };
        // SAFETY: Both tables are valid and distinct.
        let (src, dst) = unsafe { (self.table_at(table_phys), self.table_at(new_phys)) };

        for (i, entry) in src.entries.iter().enumerate() {
            if !entry.is_present() {
                continue;
            }
            let stripped = entry.flags().difference(PageTableFlags::USER);
            if level == 1 || entry.is_huge() {
                dst.entries[i] = entry.with_flags(stripped);
            } else {
                // SAFETY: A present non-huge entry above L1 references a
                // valid lower table.
                let child = unsafe { self.clone_table(level - 1, entry.address(), alloc) };
                dst.entries[i] = PageTableEntry::new(child, stripped);
            }
        }
        new_phys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Leaks a zeroed, page-aligned table and returns its address as a
    /// synthetic physical address (the test mapper uses offset 0).
    fn alloc_table() -> PhysAddr {
        let table: &'static mut PageTable =
            Box::leak(Box::new(PageTable {
                entries: [PageTableEntry::empty(); 512],
            }));
        PhysAddr::new(table as *mut PageTable as u64)
    }

    fn mapper() -> PageTableMapper {
        PageTableMapper::new(0)
    }

    #[test]
    fn map_then_translate() {
        let m = mapper();
        let root = alloc_table();
        let frame = alloc_table(); // any aligned page works as a target
        let virt = VirtAddr::new(0x40_0000_1000);

        unsafe {
            m.map_4k(root, virt, frame, Attribute::ReadWrite, false, &mut alloc_table)
                .unwrap();
            assert_eq!(m.translate(root, virt), Some(frame));
            // Intra-page offsets are preserved.
            assert_eq!(
                m.translate(root, virt + 0x123),
                Some(frame + 0x123)
            );
        }
    }

    #[test]
    fn double_map_fails_without_side_effect() {
        let m = mapper();
        let root = alloc_table();
        let frame_a = alloc_table();
        let frame_b = alloc_table();
        let virt = VirtAddr::new(0x1000);

        unsafe {
            m.map_4k(root, virt, frame_a, Attribute::ReadOnly, false, &mut alloc_table)
                .unwrap();
            assert_eq!(
                m.map_4k(root, virt, frame_b, Attribute::ReadOnly, false, &mut alloc_table),
                Err(PagingError::AlreadyMapped)
            );
            // The original mapping is untouched.
            assert_eq!(m.translate(root, virt), Some(frame_a));
        }
    }

    #[test]
    fn unaligned_is_invalid() {
        let m = mapper();
        let root = alloc_table();
        let frame = alloc_table();
        unsafe {
            assert_eq!(
                m.map_4k(
                    root,
                    VirtAddr::new(0x1234),
                    frame,
                    Attribute::ReadWrite,
                    false,
                    &mut alloc_table
                ),
                Err(PagingError::InvalidAddress)
            );
            assert_eq!(
                m.map_4k(
                    root,
                    VirtAddr::new(0x1000),
                    PhysAddr::new(frame.as_u64() + 4),
                    Attribute::ReadWrite,
                    false,
                    &mut alloc_table
                ),
                Err(PagingError::InvalidAddress)
            );
        }
    }

    #[test]
    fn unmap_returns_frame() {
        let m = mapper();
        let root = alloc_table();
        let frame = alloc_table();
        let virt = VirtAddr::new(0x7000);

        unsafe {
            m.map_4k(root, virt, frame, Attribute::ReadWrite, false, &mut alloc_table)
                .unwrap();
            assert_eq!(m.unmap_4k(root, virt), Ok(frame));
            assert_eq!(m.translate(root, virt), None);
            assert_eq!(m.unmap_4k(root, virt), Err(PagingError::NotMapped));
        }
    }

    #[test]
    fn set_attribute_rewrites_leaf_bits() {
        let m = mapper();
        let root = alloc_table();
        let frame = alloc_table();
        let virt = VirtAddr::new(0x9000);

        unsafe {
            m.map_4k(root, virt, frame, Attribute::ReadWrite, false, &mut alloc_table)
                .unwrap();
            m.set_attribute_4k(root, virt, Attribute::ReadOnly, false)
                .unwrap();

            // Walk manually to inspect the leaf.
            let l4 = m.table_at(root);
            let l3 = m.table_at(l4.entries[virt.l4_index()].address());
            let l2 = m.table_at(l3.entries[virt.l3_index()].address());
            let l1 = m.table_at(l2.entries[virt.l2_index()].address());
            let leaf = l1.entries[virt.l1_index()];
            assert!(!leaf.flags().contains(PageTableFlags::WRITABLE));
            assert!(leaf.flags().contains(PageTableFlags::NO_EXECUTE));
            assert_eq!(leaf.address(), frame);
        }
    }

    #[test]
    fn set_attribute_unmapped_is_not_mapped() {
        let m = mapper();
        let root = alloc_table();
        unsafe {
            assert_eq!(
                m.set_attribute_4k(root, VirtAddr::new(0x5000), Attribute::ReadOnly, false),
                Err(PagingError::NotMapped)
            );
        }
    }

    #[test]
    fn translate_1gib_leaf() {
        let m = mapper();
        let root = alloc_table();
        // 1 GiB-aligned synthetic frame: only the entry bits matter for
        // translate, no memory behind it is touched.
        let frame = PhysAddr::new(0x4000_0000);
        let virt = VirtAddr::new(0x80_0000_0000);

        unsafe {
            m.map_1gib(root, virt, frame, Attribute::ReadWrite, &mut alloc_table)
                .unwrap();
            assert_eq!(
                m.translate(root, virt + 0x1234_5678),
                Some(frame + 0x1234_5678)
            );
        }
    }

    #[test]
    fn map_4k_under_1gib_leaf_is_already_mapped() {
        let m = mapper();
        let root = alloc_table();
        let frame = alloc_table();
        let giga = VirtAddr::new(0x80_0000_0000);

        unsafe {
            m.map_1gib(root, giga, PhysAddr::new(0x4000_0000), Attribute::ReadWrite, &mut alloc_table)
                .unwrap();
            assert_eq!(
                m.map_4k(root, giga, frame, Attribute::ReadWrite, false, &mut alloc_table),
                Err(PagingError::AlreadyMapped)
            );
        }
    }

    #[test]
    fn user_flag_propagates_to_intermediates() {
        let m = mapper();
        let root = alloc_table();
        let frame = alloc_table();
        let virt = VirtAddr::new(0x2000);

        unsafe {
            m.map_4k(root, virt, frame, Attribute::ReadWrite, true, &mut alloc_table)
                .unwrap();
            let l4 = m.table_at(root);
            let l4e = l4.entries[virt.l4_index()];
            assert!(l4e.flags().contains(PageTableFlags::USER));
            let l3 = m.table_at(l4e.address());
            assert!(
                l3.entries[virt.l3_index()]
                    .flags()
                    .contains(PageTableFlags::USER)
            );
        }
    }

    #[test]
    fn clone_strips_user_bit() {
        let m = mapper();
        let root = alloc_table();
        let frame = alloc_table();
        let virt = VirtAddr::new(0x3000);

        unsafe {
            m.map_4k(root, virt, frame, Attribute::ReadWrite, true, &mut alloc_table)
                .unwrap();
            let clone = m.clone_table(4, root, &mut alloc_table);
            assert_ne!(clone, root);

            // The clone still translates, but nothing in it is user-visible.
            assert_eq!(m.translate(clone, virt), Some(frame));
            let l4 = m.table_at(clone);
            let l4e = l4.entries[virt.l4_index()];
            assert!(!l4e.flags().contains(PageTableFlags::USER));
            let l3 = m.table_at(l4e.address());
            let l3e = l3.entries[virt.l3_index()];
            assert!(!l3e.flags().contains(PageTableFlags::USER));
            // Cloned nodes are fresh allocations.
            assert_ne!(l4e.address(), m.table_at(root).entries[virt.l4_index()].address());
        }
    }
}
