//! Control register, RFLAGS, and MSR access.
//!
//! Bit layouts and value-composition helpers are plain data (host-testable);
//! the read/write functions execute privileged instructions and are gated to
//! the bare-metal target.

use crate::addr::PhysAddr;

use bitflags::bitflags;

bitflags! {
    /// EFER (Extended Feature Enable Register) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EferFlags: u64 {
        /// System Call Extensions (SYSCALL/SYSRET).
        const SYSTEM_CALL_ENABLE = 1 << 0;
        /// Long Mode Enable.
        const LONG_MODE_ENABLE = 1 << 8;
        /// Long Mode Active (read-only).
        const LONG_MODE_ACTIVE = 1 << 10;
        /// No-Execute Enable.
        const NO_EXECUTE_ENABLE = 1 << 11;
    }
}

bitflags! {
    /// CR4 flags used by Norn.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        /// Physical Address Extension (always set in long mode).
        const PAE = 1 << 5;
        /// Page Global Enable.
        const PGE = 1 << 7;
        /// Process-Context Identifiers enable.
        const PCIDE = 1 << 17;
    }
}

/// MSR addresses.
pub mod msr {
    /// Extended Feature Enable Register.
    pub const IA32_EFER: u32 = 0xC000_0080;
    /// SYSCALL target CS/SS selectors.
    pub const IA32_STAR: u32 = 0xC000_0081;
    /// SYSCALL 64-bit entry point.
    pub const IA32_LSTAR: u32 = 0xC000_0082;
    /// SYSCALL RFLAGS mask.
    pub const IA32_FMASK: u32 = 0xC000_0084;
    /// GS segment base.
    pub const IA32_GS_BASE: u32 = 0xC000_0101;
    /// Kernel GS base (target of `swapgs`).
    pub const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;
    /// Local APIC base address and enable bits.
    pub const IA32_APIC_BASE: u32 = 0x1B;
}

/// Number of low CR3 bits carrying the PCID when CR4.PCIDE is set.
pub const CR3_PCID_BITS: u64 = 12;

/// Mask of the PCID field in CR3.
pub const CR3_PCID_MASK: u64 = (1 << CR3_PCID_BITS) - 1;

/// Composes a CR3 value from a page-table root and a PCID.
///
/// The root must be 4 KiB aligned; its low 12 bits carry the PCID when
/// CR4.PCIDE is enabled.
#[inline]
pub const fn cr3_value(root: PhysAddr, pcid: u16) -> u64 {
    root.as_u64() | (pcid as u64 & CR3_PCID_MASK)
}

/// Extracts the page-table root from a CR3 value (drops PCID and the
/// no-flush bit 63).
#[inline]
pub const fn cr3_root(cr3: u64) -> PhysAddr {
    PhysAddr::new(cr3 & !CR3_PCID_MASK & !(1 << 63))
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod access {
    /// Reads an MSR.
    ///
    /// # Safety
    ///
    /// `msr` must be a valid MSR address on this CPU.
    #[inline]
    pub unsafe fn read_msr(msr: u32) -> u64 {
        let (lo, hi): (u32, u32);
        // SAFETY: Caller contract.
        unsafe {
            core::arch::asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi,
                options(nomem, nostack, preserves_flags));
        }
        ((hi as u64) << 32) | lo as u64
    }

    /// Writes an MSR.
    ///
    /// # Safety
    ///
    /// `msr` must be a valid MSR address and `value` a legal value for it.
    #[inline]
    pub unsafe fn write_msr(msr: u32, value: u64) {
        let lo = value as u32;
        let hi = (value >> 32) as u32;
        // SAFETY: Caller contract.
        unsafe {
            core::arch::asm!("wrmsr", in("ecx") msr, in("eax") lo, in("edx") hi,
                options(nomem, nostack, preserves_flags));
        }
    }

    /// Reads CR0.
    #[inline]
    pub fn read_cr0() -> u64 {
        let value: u64;
        // SAFETY: Reading CR0 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) value,
                options(nomem, nostack, preserves_flags));
        }
        value
    }

    /// Reads CR2 (page-fault linear address).
    #[inline]
    pub fn read_cr2() -> u64 {
        let value: u64;
        // SAFETY: Reading CR2 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) value,
                options(nomem, nostack, preserves_flags));
        }
        value
    }

    /// Reads CR3.
    #[inline]
    pub fn read_cr3() -> u64 {
        let value: u64;
        // SAFETY: Reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) value,
                options(nomem, nostack, preserves_flags));
        }
        value
    }

    /// Writes CR3, switching the active address space.
    ///
    /// # Safety
    ///
    /// `value` must reference a valid L4 table that maps the currently
    /// executing code and stack.
    #[inline]
    pub unsafe fn write_cr3(value: u64) {
        // SAFETY: Caller contract.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) value,
                options(nostack, preserves_flags));
        }
    }

    /// Reads CR4.
    #[inline]
    pub fn read_cr4() -> u64 {
        let value: u64;
        // SAFETY: Reading CR4 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) value,
                options(nomem, nostack, preserves_flags));
        }
        value
    }

    /// Writes CR4.
    ///
    /// # Safety
    ///
    /// The caller must only set feature bits the CPU supports.
    #[inline]
    pub unsafe fn write_cr4(value: u64) {
        // SAFETY: Caller contract.
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) value,
                options(nostack, preserves_flags));
        }
    }

    /// Reads RFLAGS.
    #[inline]
    pub fn read_rflags() -> u64 {
        let value: u64;
        // SAFETY: pushfq/pop only reads RFLAGS.
        unsafe {
            core::arch::asm!("pushfq", "pop {}", out(reg) value, options(nomem));
        }
        value
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use access::{
    read_cr0, read_cr2, read_cr3, read_cr4, read_msr, read_rflags, write_cr3, write_cr4,
    write_msr,
};
