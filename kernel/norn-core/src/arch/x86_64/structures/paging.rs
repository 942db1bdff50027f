//! x86-64 page table structures.
//!
//! Provides types for manipulating 4-level page tables (L4 -> L3 -> L2 -> L1).

use crate::addr::PhysAddr;

/// Physical address mask: bits 12..46 of a page table entry (35 bits of
/// frame number).
pub const ADDR_MASK: u64 = 0x0000_7FFF_FFFF_F000;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY         = 1 << 6;
        /// PS bit: 2 MiB page in L2, 1 GiB page in L3. Never legal in L4.
        const PAGE_SIZE     = 1 << 7;
        /// Global page (survives CR3 reloads when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Page fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// 1 = protection violation, 0 = not-present page.
        const PRESENT           = 1 << 0;
        /// 1 = write access caused the fault.
        const WRITE             = 1 << 1;
        /// 1 = fault occurred in user mode.
        const USER              = 1 << 2;
        /// 1 = a reserved bit was set in a page table entry.
        const RESERVED_WRITE    = 1 << 3;
        /// 1 = fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// A single page table entry (64 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys` with the given `flags`.
    pub const fn new(phys: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns the raw 64-bit value.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns `true` if this entry maps a huge page (PS bit).
    pub const fn is_huge(self) -> bool {
        self.0 & (1 << 7) != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Returns a copy with `flags` replacing the current flag bits.
    pub const fn with_flags(self, flags: PageTableFlags) -> Self {
        Self::new(self.address(), flags)
    }
}

/// A 4 KiB-aligned page table containing 512 entries.
///
/// The same layout serves all four levels.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries of this table.
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Zero-initializes all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.address().as_u64(), 0);
    }

    #[test]
    fn entry_address_masked() {
        let entry = PageTableEntry::new(PhysAddr::new(0x0000_1234_5000), PageTableFlags::PRESENT);
        assert_eq!(entry.address().as_u64(), 0x0000_1234_5000);
        assert!(entry.is_present());
    }

    #[test]
    fn flags_do_not_leak_address() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x0000_7FFF_FFFF_F000),
            PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE,
        );
        assert_eq!(entry.flags().bits() & ADDR_MASK, 0);
        assert_eq!(entry.address().as_u64(), 0x0000_7FFF_FFFF_F000);
    }

    #[test]
    fn addr_mask_is_35_bits_of_frame() {
        for bit in 0..64 {
            let expected = (12..47).contains(&bit);
            assert_eq!((ADDR_MASK >> bit) & 1 == 1, expected, "bit {bit}");
        }
    }

    #[test]
    fn huge_bit() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x20_0000),
            PageTableFlags::PRESENT | PageTableFlags::PAGE_SIZE,
        );
        assert!(entry.is_huge());
    }

    #[test]
    fn with_flags_preserves_address() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x3000),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        let ro = entry.with_flags(PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE);
        assert_eq!(ro.address().as_u64(), 0x3000);
        assert!(!ro.flags().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn table_is_page_sized() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
