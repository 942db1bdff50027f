//! Global Descriptor Table and Task State Segment structures.
//!
//! Norn uses one fixed GDT layout on every CPU (the SYSCALL/SYSRET MSRs
//! bake the selector arithmetic in, so the order is load-bearing):
//!
//! | index | selector | descriptor |
//! |-------|----------|------------|
//! | 0 | 0x00 | null |
//! | 1 | 0x08 | kernel 32-bit code (trampoline protected mode) |
//! | 2 | 0x10 | kernel 64-bit code |
//! | 3 | 0x18 | kernel data |
//! | 4 | 0x20 | user 32-bit code (SYSRET base) |
//! | 5 | 0x28 | user data |
//! | 6 | 0x30 | user 64-bit code |
//! | 8 | 0x40 | TSS (two slots) |

use core::mem::size_of;

/// Shift to convert a GDT index to a selector value (skip TI and RPL bits).
const SELECTOR_INDEX_SHIFT: u16 = 3;
/// Mask for the 2-bit requested privilege level field.
const RPL_MASK: u16 = 0b11;

/// A segment selector value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl SegmentSelector {
    /// Creates a new segment selector from a GDT index and an RPL.
    #[inline]
    pub const fn new(index: u16, rpl: u16) -> Self {
        Self((index << SELECTOR_INDEX_SHIFT) | (rpl & RPL_MASK))
    }

    /// Returns the raw u16 value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the GDT index.
    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> SELECTOR_INDEX_SHIFT
    }

    /// Returns the requested privilege level.
    #[inline]
    pub const fn rpl(self) -> u16 {
        self.0 & RPL_MASK
    }
}

/// Fixed GDT slot assignments.
pub mod index {
    /// Null descriptor.
    pub const NULL: usize = 0;
    /// Kernel 32-bit code segment (used by the AP trampoline).
    pub const KERNEL_CS32: usize = 1;
    /// Kernel 64-bit code segment.
    pub const KERNEL_CS: usize = 2;
    /// Kernel data segment.
    pub const KERNEL_DS: usize = 3;
    /// User 32-bit code segment (SYSRET selector base).
    pub const USER_CS32: usize = 4;
    /// User data segment.
    pub const USER_DS: usize = 5;
    /// User 64-bit code segment.
    pub const USER_CS: usize = 6;
    /// TSS descriptor (occupies two slots).
    pub const KERNEL_TSS: usize = 8;
}

/// Selectors derived from the fixed layout.
pub mod selector {
    use super::{SegmentSelector, index};

    /// Kernel 32-bit code selector.
    pub const KERNEL_CS32: SegmentSelector = SegmentSelector::new(index::KERNEL_CS32 as u16, 0);
    /// Kernel 64-bit code selector.
    pub const KERNEL_CS: SegmentSelector = SegmentSelector::new(index::KERNEL_CS as u16, 0);
    /// Kernel data selector.
    pub const KERNEL_DS: SegmentSelector = SegmentSelector::new(index::KERNEL_DS as u16, 0);
    /// User 32-bit code selector (RPL 3).
    pub const USER_CS32: SegmentSelector = SegmentSelector::new(index::USER_CS32 as u16, 3);
    /// User data selector (RPL 3).
    pub const USER_DS: SegmentSelector = SegmentSelector::new(index::USER_DS as u16, 3);
    /// User 64-bit code selector (RPL 3).
    pub const USER_CS: SegmentSelector = SegmentSelector::new(index::USER_CS as u16, 3);
    /// TSS selector.
    pub const KERNEL_TSS: SegmentSelector = SegmentSelector::new(index::KERNEL_TSS as u16, 0);
}

/// A GDT descriptor value.
#[derive(Debug, Clone, Copy)]
pub enum Descriptor {
    /// A 64-bit code/data segment or null descriptor.
    UserSegment(u64),
    /// A 128-bit system segment (TSS): low and high halves.
    SystemSegment(u64, u64),
}

impl Descriptor {
    /// Creates a null descriptor.
    #[inline]
    pub const fn null() -> Self {
        Self::UserSegment(0)
    }

    /// Kernel 32-bit code segment: D=1, P=1, DPL=0, execute/read, 4 GiB limit.
    #[inline]
    pub const fn kernel_code32_segment() -> Self {
        Self::UserSegment(0x00CF_9A00_0000_FFFF)
    }

    /// Kernel 64-bit code segment: L=1, D=0, P=1, DPL=0, execute/read.
    #[inline]
    pub const fn kernel_code_segment() -> Self {
        Self::UserSegment(0x00AF_9A00_0000_FFFF)
    }

    /// Kernel data segment: P=1, DPL=0, read/write.
    #[inline]
    pub const fn kernel_data_segment() -> Self {
        Self::UserSegment(0x00CF_9200_0000_FFFF)
    }

    /// User 32-bit code segment: D=1, P=1, DPL=3, execute/read.
    #[inline]
    pub const fn user_code32_segment() -> Self {
        Self::UserSegment(0x00CF_FA00_0000_FFFF)
    }

    /// User data segment: P=1, DPL=3, read/write.
    #[inline]
    pub const fn user_data_segment() -> Self {
        Self::UserSegment(0x00CF_F200_0000_FFFF)
    }

    /// User 64-bit code segment: L=1, D=0, P=1, DPL=3, execute/read.
    #[inline]
    pub const fn user_code_segment() -> Self {
        Self::UserSegment(0x00AF_FA00_0000_FFFF)
    }

    /// Returns the raw bits of a code/data descriptor.
    ///
    /// # Panics
    ///
    /// Panics if called on a system segment.
    const fn user_bits(self) -> u64 {
        match self {
            Self::UserSegment(bits) => bits,
            Self::SystemSegment(..) => panic!("system segment in code/data slot"),
        }
    }

    /// TSS type: 64-bit TSS (available).
    const TSS_TYPE_AVAILABLE_64: u64 = 0x9;
    /// Bit position of the Present flag in a segment descriptor.
    const PRESENT_BIT: u64 = 47;

    /// Creates a 128-bit TSS system segment descriptor for the TSS at `tss_addr`.
    ///
    /// Takes a raw address rather than a reference because per-CPU TSSs live
    /// in pages the type system does not own.
    pub const fn tss_segment(tss_addr: u64) -> Self {
        let limit = (size_of::<TaskStateSegment>() - 1) as u64;

        // Low 64 bits:
        //  bits  0..15: limit[0..15]
        //  bits 16..39: base[0..23]
        //  bits 40..43: type (0x9 = 64-bit TSS available)
        //  bit      44: 0 (system segment)
        //  bits 45..46: DPL (0)
        //  bit      47: present
        //  bits 48..51: limit[16..19]
        //  bits 56..63: base[24..31]
        let low = (limit & 0xFFFF)
            | ((tss_addr & 0xFF_FFFF) << 16)
            | (Self::TSS_TYPE_AVAILABLE_64 << 40)
            | (1 << Self::PRESENT_BIT)
            | ((limit & 0xF_0000) << 32)
            | ((tss_addr & 0xFF00_0000) << 32);

        // High 64 bits: base[32..63].
        let high = (tss_addr >> 32) & 0xFFFF_FFFF;

        Self::SystemSegment(low, high)
    }
}

/// Pointer operand for `lgdt` / `lidt`.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    /// Size of the table minus one.
    pub limit: u16,
    /// Linear base address of the table.
    pub base: u64,
}

/// Number of 64-bit slots in a Norn GDT (fixed layout plus spare).
pub const GDT_SLOTS: usize = 16;

/// A Global Descriptor Table with the fixed Norn layout.
#[repr(C, align(16))]
pub struct GlobalDescriptorTable {
    table: [u64; GDT_SLOTS],
}

impl GlobalDescriptorTable {
    /// Creates a GDT populated with the fixed Norn segment layout and no TSS.
    pub const fn new() -> Self {
        let mut table = [0u64; GDT_SLOTS];
        table[index::KERNEL_CS32] = Descriptor::kernel_code32_segment().user_bits();
        table[index::KERNEL_CS] = Descriptor::kernel_code_segment().user_bits();
        table[index::KERNEL_DS] = Descriptor::kernel_data_segment().user_bits();
        table[index::USER_CS32] = Descriptor::user_code32_segment().user_bits();
        table[index::USER_DS] = Descriptor::user_data_segment().user_bits();
        table[index::USER_CS] = Descriptor::user_code_segment().user_bits();
        Self { table }
    }

    /// Installs the TSS descriptor in the fixed TSS slots.
    pub fn set_tss(&mut self, tss_addr: u64) {
        match Descriptor::tss_segment(tss_addr) {
            Descriptor::SystemSegment(low, high) => {
                self.table[index::KERNEL_TSS] = low;
                self.table[index::KERNEL_TSS + 1] = high;
            }
            Descriptor::UserSegment(_) => unreachable!(),
        }
    }

    /// Returns the raw descriptor at `idx` (for tests and diagnostics).
    pub fn raw(&self, idx: usize) -> u64 {
        self.table[idx]
    }

    /// Loads this GDT into the CPU via `lgdt`.
    ///
    /// # Safety
    ///
    /// - The GDT must live for as long as it is loaded.
    /// - Segment registers must be reloaded after this call.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[inline]
    pub unsafe fn load(&self) {
        let ptr = DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self.table.as_ptr() as u64,
        };
        // SAFETY: Caller contract.
        unsafe {
            core::arch::asm!(
                "lgdt [{}]",
                in(reg) &ptr,
                options(readonly, nostack, preserves_flags),
            );
        }
    }
}

impl Default for GlobalDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Task State Segment for x86-64 (104 bytes).
///
/// Contains the privilege stack table (RSP0..2) and the interrupt stack
/// table (IST1..7) used by the CPU during stack switches.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    _reserved_0: u32,
    /// Privilege stack table: RSP loaded on transition to rings 0-2.
    pub privilege_stack_table: [u64; 3],
    _reserved_1: u64,
    /// Interrupt stack table (IST1-IST7).
    pub interrupt_stack_table: [u64; 7],
    _reserved_2: u64,
    _reserved_3: u16,
    /// Offset from the TSS base to the I/O permission bitmap.
    pub iomap_base: u16,
}

impl TaskStateSegment {
    /// Creates a zeroed TSS with the I/O map disabled (offset = size).
    pub const fn new() -> Self {
        Self {
            _reserved_0: 0,
            privilege_stack_table: [0; 3],
            _reserved_1: 0,
            interrupt_stack_table: [0; 7],
            _reserved_2: 0,
            _reserved_3: 0,
            iomap_base: size_of::<Self>() as u16,
        }
    }
}

impl Default for TaskStateSegment {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offset of RSP0 within the TSS (used by asm and the context switch).
pub const TSS_RSP0_OFFSET: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tss_is_104_bytes() {
        assert_eq!(size_of::<TaskStateSegment>(), 104);
    }

    #[test]
    fn tss_rsp0_offset() {
        let tss = TaskStateSegment::new();
        let base = &tss as *const _ as usize;
        let rsp0 = core::ptr::addr_of!(tss.privilege_stack_table) as usize;
        assert_eq!(rsp0 - base, TSS_RSP0_OFFSET);
    }

    #[test]
    fn fixed_selectors() {
        assert_eq!(selector::KERNEL_CS32.as_u16(), 0x08);
        assert_eq!(selector::KERNEL_CS.as_u16(), 0x10);
        assert_eq!(selector::KERNEL_DS.as_u16(), 0x18);
        assert_eq!(selector::USER_CS32.as_u16(), 0x23);
        assert_eq!(selector::USER_DS.as_u16(), 0x2B);
        assert_eq!(selector::USER_CS.as_u16(), 0x33);
        assert_eq!(selector::KERNEL_TSS.as_u16(), 0x40);
    }

    #[test]
    fn sysret_selector_arithmetic() {
        // SYSRET loads SS = STAR[63:48] + 8 and CS = STAR[63:48] + 16; the
        // fixed layout must place user_ds and user_cs accordingly.
        let base = selector::USER_CS32.as_u16();
        assert_eq!(base + 8, selector::USER_DS.as_u16());
        assert_eq!(base + 16, selector::USER_CS.as_u16());
    }

    #[test]
    fn syscall_selector_arithmetic() {
        // SYSCALL loads CS = STAR[47:32] and SS = STAR[47:32] + 8.
        assert_eq!(
            selector::KERNEL_CS.as_u16() + 8,
            selector::KERNEL_DS.as_u16()
        );
    }

    #[test]
    fn gdt_layout_populated() {
        let mut gdt = GlobalDescriptorTable::new();
        assert_eq!(gdt.raw(index::NULL), 0);
        assert_eq!(gdt.raw(index::KERNEL_CS), 0x00AF_9A00_0000_FFFF);
        assert_eq!(gdt.raw(index::KERNEL_DS), 0x00CF_9200_0000_FFFF);
        assert_eq!(gdt.raw(index::USER_CS), 0x00AF_FA00_0000_FFFF);
        // Slot 7 left empty so the TSS lands at index 8.
        assert_eq!(gdt.raw(7), 0);

        gdt.set_tss(0x1234_5678_9ABC_DEF0);
        let low = gdt.raw(index::KERNEL_TSS);
        let high = gdt.raw(index::KERNEL_TSS + 1);
        // Present bit, type 0x9, limit 103.
        assert_eq!(low & 0xFFFF, 103);
        assert_eq!((low >> 40) & 0xF, 0x9);
        assert_eq!((low >> 47) & 1, 1);
        // Base reassembled from the descriptor halves.
        let base = ((low >> 16) & 0xFF_FFFF) | ((low >> 32) & 0xFF00_0000) | (high << 32);
        assert_eq!(base, 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn descriptor_table_pointer_is_packed() {
        assert_eq!(size_of::<DescriptorTablePointer>(), 10);
    }
}
