//! Register frames shared between the assembly stubs and Rust.
//!
//! The field order of each struct is load-bearing: it mirrors the exact
//! push sequence of the corresponding stub, so ascending field order equals
//! ascending stack addresses. Layout is pinned by tests.

/// The register frame built by the ISR stubs and consumed by the interrupt
/// dispatcher.
///
/// The stub pushes (in order) R15..RDI after the vector/error words, so RDI
/// sits at the lowest address. `spec1` holds the vector number; `spec2`
/// holds the hardware error code for exceptions that push one and a dummy
/// zero otherwise. The trailing five words are pushed by the CPU itself.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuContext {
    /// RDI (first C argument of the interrupted code).
    pub rdi: u64,
    /// RSI.
    pub rsi: u64,
    /// RDX.
    pub rdx: u64,
    /// RCX.
    pub rcx: u64,
    /// RAX.
    pub rax: u64,
    /// RBX.
    pub rbx: u64,
    /// RBP.
    pub rbp: u64,
    /// R8.
    pub r8: u64,
    /// R9.
    pub r9: u64,
    /// R10.
    pub r10: u64,
    /// R11.
    pub r11: u64,
    /// R12.
    pub r12: u64,
    /// R13.
    pub r13: u64,
    /// R14.
    pub r14: u64,
    /// R15.
    pub r15: u64,
    /// Discriminated word 1: interrupt vector.
    pub spec1: u64,
    /// Discriminated word 2: hardware error code or dummy zero.
    pub spec2: u64,
    /// Interrupted RIP (hardware-pushed).
    pub rip: u64,
    /// Interrupted CS (hardware-pushed).
    pub cs: u64,
    /// Interrupted RFLAGS (hardware-pushed).
    pub rflags: u64,
    /// Interrupted RSP (hardware-pushed).
    pub rsp: u64,
    /// Interrupted SS (hardware-pushed).
    pub ss: u64,
}

impl CpuContext {
    /// Returns the interrupt vector.
    pub const fn vector(&self) -> u8 {
        self.spec1 as u8
    }

    /// Returns the hardware error code (meaningful only for vectors that
    /// push one; a dummy zero otherwise).
    pub const fn error_code(&self) -> u64 {
        self.spec2
    }

    /// Returns `true` if the interrupt arrived from ring 3.
    pub const fn from_user(&self) -> bool {
        self.cs & 0x3 == 3
    }
}

/// The callee-saved frame consumed by `switch_to`.
///
/// `switch_to` pushes RBP, RBX, R12, R13, R14, R15 (R15 lands lowest) and
/// later pops them back before a `ret` that consumes `rip`. A newly created
/// thread gets one of these crafted at the top of its kernel stack with
/// `rip` pointing at its entry function.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SwitchFrame {
    /// R15.
    pub r15: u64,
    /// R14.
    pub r14: u64,
    /// R13.
    pub r13: u64,
    /// R12.
    pub r12: u64,
    /// RBX.
    pub rbx: u64,
    /// RBP.
    pub rbp: u64,
    /// Address the final `ret` will jump to.
    pub rip: u64,
}

/// Number of scratch words reserved below the syscall register area.
pub const SYSCALL_SCRATCH_WORDS: usize = 6;

/// The frame built on the kernel stack by the SYSCALL entry trampoline.
///
/// Pushed top-down as SS, user RSP, RFLAGS (from R11), CS, RIP (from RCX),
/// orig RAX, RDI, RSI, RDX, RCX, RAX (= -1 placeholder for the return
/// value), R8, R9, R10, R11, followed by six scratch words for
/// callee-saved spills.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SyscallFrame {
    /// Callee-saved spill space (lowest addresses).
    pub scratch: [u64; SYSCALL_SCRATCH_WORDS],
    /// R11 (user RFLAGS copy).
    pub r11: u64,
    /// R10 (syscall argument 4).
    pub r10: u64,
    /// R9 (syscall argument 6).
    pub r9: u64,
    /// R8 (syscall argument 5).
    pub r8: u64,
    /// RAX: pre-set to -1; overwritten with the dispatch return value.
    pub rax: u64,
    /// RCX (user RIP copy).
    pub rcx: u64,
    /// RDX (syscall argument 3).
    pub rdx: u64,
    /// RSI (syscall argument 2).
    pub rsi: u64,
    /// RDI (syscall argument 1).
    pub rdi: u64,
    /// The syscall number as received in RAX.
    pub orig_rax: u64,
    /// User RIP.
    pub rip: u64,
    /// User CS.
    pub cs: u64,
    /// User RFLAGS.
    pub rflags: u64,
    /// User RSP.
    pub rsp: u64,
    /// User SS.
    pub ss: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn cpu_context_size_is_16_aligned() {
        assert_eq!(size_of::<CpuContext>(), 22 * 8);
        assert_eq!(size_of::<CpuContext>() % 16, 0);
    }

    #[test]
    fn cpu_context_field_offsets() {
        // The stub computes these offsets implicitly through its push
        // sequence; pin the ones the dispatcher reads.
        assert_eq!(offset_of!(CpuContext, rdi), 0);
        assert_eq!(offset_of!(CpuContext, r15), 14 * 8);
        assert_eq!(offset_of!(CpuContext, spec1), 15 * 8);
        assert_eq!(offset_of!(CpuContext, spec2), 16 * 8);
        assert_eq!(offset_of!(CpuContext, rip), 17 * 8);
        assert_eq!(offset_of!(CpuContext, ss), 21 * 8);
    }

    #[test]
    fn vector_and_error_code() {
        let mut ctx: CpuContext = unsafe { core::mem::zeroed() };
        ctx.spec1 = 14;
        ctx.spec2 = 0x2;
        ctx.cs = 0x33;
        assert_eq!(ctx.vector(), 14);
        assert_eq!(ctx.error_code(), 2);
        assert!(ctx.from_user());
        ctx.cs = 0x10;
        assert!(!ctx.from_user());
    }

    #[test]
    fn switch_frame_layout() {
        assert_eq!(size_of::<SwitchFrame>(), 7 * 8);
        assert_eq!(offset_of!(SwitchFrame, r15), 0);
        assert_eq!(offset_of!(SwitchFrame, rbp), 5 * 8);
        assert_eq!(offset_of!(SwitchFrame, rip), 6 * 8);
    }

    #[test]
    fn syscall_frame_layout() {
        assert_eq!(size_of::<SyscallFrame>(), 21 * 8);
        assert_eq!(offset_of!(SyscallFrame, scratch), 0);
        assert_eq!(offset_of!(SyscallFrame, r11), 6 * 8);
        assert_eq!(offset_of!(SyscallFrame, rax), 10 * 8);
        assert_eq!(offset_of!(SyscallFrame, orig_rax), 15 * 8);
        assert_eq!(offset_of!(SyscallFrame, rip), 16 * 8);
        assert_eq!(offset_of!(SyscallFrame, ss), 20 * 8);
    }
}
