//! CPUID feature queries.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

use core::arch::x86_64::__cpuid_count;

/// Result of a `cpuid` invocation.
#[derive(Debug, Clone, Copy)]
pub struct CpuidResult {
    /// EAX output.
    pub eax: u32,
    /// EBX output.
    pub ebx: u32,
    /// ECX output.
    pub ecx: u32,
    /// EDX output.
    pub edx: u32,
}

/// Executes `cpuid` for the given leaf (sub-leaf 0).
pub fn cpuid(leaf: u32) -> CpuidResult {
    // SAFETY: cpuid is unprivileged and has no side effects; all x86-64
    // CPUs support it.
    let r = unsafe { __cpuid_count(leaf, 0) };
    CpuidResult {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// Returns `true` if the CPU supports PCID (CPUID.1:ECX[17]).
pub fn has_pcid() -> bool {
    cpuid(1).ecx & (1 << 17) != 0
}

/// Returns `true` if the CPU supports SYSCALL/SYSRET in long mode
/// (CPUID.8000_0001:EDX[11]).
pub fn has_syscall() -> bool {
    cpuid(0x8000_0001).edx & (1 << 11) != 0
}

/// Returns the initial LAPIC ID of the executing CPU (CPUID.1:EBX[31:24]).
pub fn lapic_id() -> u8 {
    (cpuid(1).ebx >> 24) as u8
}
