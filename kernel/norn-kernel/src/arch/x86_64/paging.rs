//! Paging: boot-time reconstruction and the kernel page-table API.
//!
//! Reconstruction runs exactly once on the BSP while the firmware identity
//! map is still live: it builds a fresh L4, installs 1 GiB direct-map
//! pages over all RAM, deep-clones the firmware-installed upper subtrees
//! (so loader-owned table memory can be released), enables PCID when the
//! CPU has it, and switches CR3. Everything afterwards goes through the
//! direct map.

use norn_core::addr::PhysAddr;
use norn_core::arch::x86_64::structures::paging::PageTable;

pub use norn_core::arch::x86_64::paging::{Attribute, PagingError};

/// PCID the kernel address space runs under (0 is left to firmware
/// context).
pub const KERNEL_PCID: u16 = 1;

/// 4 KiB page size.
const PAGE_SIZE: u64 = 4096;

/// Copies the kernel (high) half of `src` into `dst` and zeroes the user
/// half. Entries are copied verbatim: the kernel half is shared across
/// every address space, not cloned.
pub fn copy_high_half(dm_offset: u64, src: PhysAddr, dst: PhysAddr) {
    // SAFETY: Both addresses reference valid L4 tables reachable through
    // `dm_offset`; the caller owns `dst` exclusively.
    unsafe {
        let src = &*(dm_offset.wrapping_add(src.as_u64()) as *const PageTable);
        let dst = &mut *(dm_offset.wrapping_add(dst.as_u64()) as *mut PageTable);
        for i in 0..256 {
            dst.entries[i] = norn_core::arch::x86_64::structures::paging::PageTableEntry::empty();
        }
        dst.entries[256..].copy_from_slice(&src.entries[256..]);
    }
}

// ---------------------------------------------------------------------------
// Kernel runtime
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod runtime {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    use norn_core::addr::VirtAddr;
    use norn_core::arch::x86_64::instructions::tlb;
    use norn_core::arch::x86_64::paging::PageTableMapper;
    use norn_core::arch::x86_64::structures::paging::PageTableFlags;
    use norn_core::arch::x86_64::{cpuid, registers};
    use norn_mm::Zone;

    use crate::mm::{self, DIRECT_MAP_BASE, GIB, phys_to_virt, virt_to_phys};

    /// Physical address of the kernel L4 table, set by [`reconstruct`].
    static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

    /// Returns the kernel's L4 physical address.
    pub fn kernel_root() -> PhysAddr {
        PhysAddr::new(KERNEL_ROOT.load(Ordering::Acquire))
    }

    /// Returns the CR3 value for the kernel address space (root + PCID
    /// when enabled).
    pub fn kernel_cr3() -> u64 {
        if cpuid::has_pcid() {
            registers::cr3_value(kernel_root(), KERNEL_PCID)
        } else {
            kernel_root().as_u64()
        }
    }

    /// Rebuilds paging from scratch and switches onto the new tables.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, on the BSP, while the firmware
    /// identity map is live and before any other CPU runs.
    pub unsafe fn reconstruct() {
        let root = mm::bootstrap_alloc_table();
        // The identity map is live: physical addresses are dereferencable
        // as-is, so the walker runs with offset 0.
        let mapper = PageTableMapper::new(0);
        let mut alloc = || mm::bootstrap_alloc_table();

        // Direct map: 1 GiB leaves covering [0, max_ram). The window must
        // stay inside one L4 slot (512 GiB) so the subtree clone below can
        // treat every higher index as kernel image territory.
        let dm_gib = mm::direct_map_gib();
        debug_assert!(dm_gib <= 512, "direct map exceeds one L4 slot");
        for gib in 0..dm_gib {
            let virt = VirtAddr::new(DIRECT_MAP_BASE + gib * GIB);
            let phys = PhysAddr::new(gib * GIB);
            // SAFETY: root is a fresh zeroed L4; inputs are 1 GiB aligned.
            unsafe { mapper.map_1gib(root, virt, phys, Attribute::ReadWrite, &mut alloc) }
                .expect("direct map entry collision");
        }

        // Deep-clone the loader-installed kernel subtrees above the direct
        // map window, forcing user access off everywhere.
        let current_root = registers::cr3_root(registers::read_cr3());
        // SAFETY: CR3 references the loader's live L4.
        let current_l4 = unsafe { &*(current_root.as_u64() as *const PageTable) };
        let dm_top_index = VirtAddr::new(DIRECT_MAP_BASE).l4_index();
        // SAFETY: root is valid; entries above the window reference valid
        // loader-built subtrees.
        let new_l4 = unsafe { &mut *(root.as_u64() as *mut PageTable) };
        for index in (dm_top_index + 1)..512 {
            let entry = current_l4.entries[index];
            if !entry.is_present() {
                continue;
            }
            // SAFETY: Present L4 entries reference valid L3 tables.
            let clone = unsafe { mapper.clone_table(3, entry.address(), &mut alloc) };
            let flags = entry.flags().difference(PageTableFlags::USER);
            new_l4.entries[index] =
                norn_core::arch::x86_64::structures::paging::PageTableEntry::new(clone, flags);
        }

        KERNEL_ROOT.store(root.as_u64(), Ordering::Release);

        // PCID if the CPU reports it, then switch.
        if cpuid::has_pcid() {
            // SAFETY: PCIDE is supported; CR3 loads below carry a PCID.
            unsafe {
                registers::write_cr4(
                    registers::read_cr4() | registers::Cr4Flags::PCIDE.bits(),
                );
            }
        }
        // SAFETY: The new root maps the kernel image (cloned subtrees) and
        // all RAM (direct map); the currently executing code stays mapped.
        unsafe { registers::write_cr3(kernel_cr3()) };

        norn_core::kinfo!(
            "paging: reconstructed ({} GiB direct map, pcid={})",
            dm_gib,
            cpuid::has_pcid()
        );
    }

    /// Allocates one page-table frame from the buddy allocator.
    ///
    /// # Panics
    ///
    /// Panics on exhaustion: a failed table allocation mid-walk would
    /// leave the address space half-built.
    fn table_alloc() -> PhysAddr {
        mm::alloc_pages(1, Zone::Normal).expect("out of memory for page tables")
    }

    /// Creates a fresh address-space root: user half empty, kernel half
    /// shared with the current root. Returns its direct-map address.
    pub fn create_root() -> VirtAddr {
        let root = table_alloc();
        let current = registers::cr3_root(registers::read_cr3());
        copy_high_half(DIRECT_MAP_BASE, current, root);
        phys_to_virt(root)
    }

    fn mapper() -> PageTableMapper {
        PageTableMapper::new(DIRECT_MAP_BASE)
    }

    /// Validates one virtual address argument.
    fn virt_arg(vaddr: u64) -> Result<VirtAddr, PagingError> {
        let virt = VirtAddr::try_new(vaddr).ok_or(PagingError::InvalidAddress)?;
        if !virt.is_aligned(PAGE_SIZE) {
            return Err(PagingError::InvalidAddress);
        }
        Ok(virt)
    }

    /// Maps `[vaddr, vaddr + size)` to `[paddr, ...)` with 4 KiB leaves.
    ///
    /// # Safety
    ///
    /// `root` must be an address-space root from [`create_root`] (or the
    /// kernel root); the range must not be in active use by another CPU.
    pub unsafe fn map(
        root: VirtAddr,
        vaddr: u64,
        paddr: u64,
        size: u64,
        attr: Attribute,
        user: bool,
    ) -> Result<(), PagingError> {
        let virt = virt_arg(vaddr)?;
        if paddr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(PagingError::InvalidAddress);
        }
        let root = virt_to_phys(root);
        let m = mapper();
        let mut alloc = table_alloc;
        for page in 0..size / PAGE_SIZE {
            // SAFETY: Caller contract.
            unsafe {
                m.map_4k(
                    root,
                    virt + page * PAGE_SIZE,
                    PhysAddr::new(paddr + page * PAGE_SIZE),
                    attr,
                    user,
                    &mut alloc,
                )?;
            }
        }
        Ok(())
    }

    /// Unmaps `[vaddr, vaddr + size)`.
    ///
    /// # Safety
    ///
    /// Same contract as [`map`]; the pages must no longer be referenced.
    pub unsafe fn unmap(root: VirtAddr, vaddr: u64, size: u64) -> Result<(), PagingError> {
        let virt = virt_arg(vaddr)?;
        if size % PAGE_SIZE != 0 {
            return Err(PagingError::InvalidAddress);
        }
        let root = virt_to_phys(root);
        let m = mapper();
        for page in 0..size / PAGE_SIZE {
            let addr = virt + page * PAGE_SIZE;
            // SAFETY: Caller contract.
            unsafe { m.unmap_4k(root, addr)? };
            tlb::flush(addr);
        }
        Ok(())
    }

    /// Rewrites the attributes of `[vaddr, vaddr + size)`.
    ///
    /// # Safety
    ///
    /// Same contract as [`map`].
    pub unsafe fn change_attribute(
        root: VirtAddr,
        vaddr: u64,
        size: u64,
        attr: Attribute,
        user: bool,
    ) -> Result<(), PagingError> {
        let virt = virt_arg(vaddr)?;
        if size % PAGE_SIZE != 0 {
            return Err(PagingError::InvalidAddress);
        }
        let root = virt_to_phys(root);
        let m = mapper();
        for page in 0..size / PAGE_SIZE {
            let addr = virt + page * PAGE_SIZE;
            // SAFETY: Caller contract.
            unsafe { m.set_attribute_4k(root, addr, attr, user)? };
            tlb::flush(addr);
        }
        Ok(())
    }

    /// Translates a virtual address under `root`, honoring huge leaves.
    pub fn translate(root: VirtAddr, vaddr: u64) -> Option<PhysAddr> {
        let virt = VirtAddr::try_new(vaddr)?;
        // SAFETY: root came from create_root/kernel_root and is live.
        unsafe { mapper().translate(virt_to_phys(root), virt) }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use runtime::{
    change_attribute, create_root, kernel_cr3, kernel_root, map, reconstruct, translate, unmap,
};
