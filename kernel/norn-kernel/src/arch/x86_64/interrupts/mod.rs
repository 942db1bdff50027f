//! Interrupt dispatch.
//!
//! Every vector funnels through a vector-specific naked stub into
//! [`isr_dispatch`], which consults a 256-entry handler table. Unhandled
//! vectors hit the default handler: it dumps the architectural state and
//! halts the CPU forever.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod stubs;

use core::sync::atomic::{AtomicPtr, Ordering};

use norn_core::arch::x86_64::structures::context::CpuContext;
use norn_core::arch::x86_64::structures::idt::NUM_VECTORS;

/// Returns `true` for the exception vectors whose hardware pushes an error
/// code (#DF, #TS, #NP, #SS, #GP, #PF, #AC). All other stubs push a dummy
/// zero to keep the frame layout uniform.
pub const fn has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17)
}

/// A registered interrupt handler.
pub type InterruptHandler = fn(&mut CpuContext);

/// Interrupt registration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptError {
    /// The vector already has a non-default handler.
    AlreadyRegistered,
}

impl core::fmt::Display for InterruptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyRegistered => write!(f, "handler already registered"),
        }
    }
}

/// Handler table: null = default handler.
static HANDLERS: [AtomicPtr<()>; NUM_VECTORS] = {
    const INIT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    [INIT; NUM_VECTORS]
};

/// Registers `handler` for `vector`.
///
/// Fails with [`InterruptError::AlreadyRegistered`] if the slot no longer
/// holds the default handler.
pub fn set_handler(vector: u8, handler: InterruptHandler) -> Result<(), InterruptError> {
    HANDLERS[vector as usize]
        .compare_exchange(
            core::ptr::null_mut(),
            handler as *mut (),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|_| InterruptError::AlreadyRegistered)
}

/// Dispatches one interrupt frame to its handler.
pub fn dispatch(ctx: &mut CpuContext) {
    let vector = ctx.vector();
    let handler = HANDLERS[vector as usize].load(Ordering::Acquire);
    if handler.is_null() {
        default_handler(ctx);
    } else {
        // SAFETY: Only valid `InterruptHandler` pointers are stored.
        let handler: InterruptHandler = unsafe { core::mem::transmute(handler) };
        handler(ctx);
    }

    // Hardware IRQs (remapped at 32+) need an EOI; exceptions do not.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if vector >= 32 {
        super::apic::eoi();
    }
}

/// The C-level entry called by the common ISR tail with RDI = frame.
///
/// # Safety
///
/// Only the ISR stubs call this, with `ctx` pointing at the frame they
/// built on the interrupt stack.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[unsafe(no_mangle)]
unsafe extern "C" fn isr_dispatch(ctx: *mut CpuContext) {
    // SAFETY: Stub contract.
    dispatch(unsafe { &mut *ctx });
}

/// Default handler: dump the architectural state and halt forever.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn default_handler(ctx: &mut CpuContext) -> ! {
    use norn_core::arch::x86_64::registers::{read_cr0, read_cr2, read_cr3, read_cr4};
    use norn_core::{kfatal, kprintln};

    kfatal!(
        "unhandled interrupt: vector {} (error code {:#x})",
        ctx.vector(),
        ctx.error_code()
    );
    kprintln!(
        "RAX={:#018x} RBX={:#018x} RCX={:#018x} RDX={:#018x}",
        ctx.rax,
        ctx.rbx,
        ctx.rcx,
        ctx.rdx
    );
    kprintln!(
        "RSI={:#018x} RDI={:#018x} RBP={:#018x} R8 ={:#018x}",
        ctx.rsi,
        ctx.rdi,
        ctx.rbp,
        ctx.r8
    );
    kprintln!(
        "R9 ={:#018x} R10={:#018x} R11={:#018x} R12={:#018x}",
        ctx.r9,
        ctx.r10,
        ctx.r11,
        ctx.r12
    );
    kprintln!(
        "R13={:#018x} R14={:#018x} R15={:#018x}",
        ctx.r13,
        ctx.r14,
        ctx.r15
    );
    kprintln!(
        "RIP={:#018x} RFLAGS={:#018x} CS={:#06x}",
        ctx.rip,
        ctx.rflags,
        ctx.cs
    );
    kprintln!(
        "CR0={:#018x} CR2={:#018x} CR3={:#018x} CR4={:#018x}",
        read_cr0(),
        read_cr2(),
        read_cr3(),
        read_cr4()
    );
    if ctx.from_user() {
        kprintln!("SS={:#06x} RSP={:#018x} (from ring 3)", ctx.ss, ctx.rsp);
    }
    crate::halt_forever()
}

/// Host stand-in for the default handler.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn default_handler(ctx: &mut CpuContext) {
    panic!(
        "unhandled interrupt: vector {} (error code {:#x})",
        ctx.vector(),
        ctx.error_code()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    fn frame(vector: u8, error_code: u64) -> CpuContext {
        let mut ctx: CpuContext = unsafe { core::mem::zeroed() };
        ctx.spec1 = vector as u64;
        ctx.spec2 = error_code;
        ctx.cs = 0x10;
        ctx
    }

    #[test]
    fn error_code_vector_set() {
        for vector in [8u8, 10, 11, 12, 13, 14, 17] {
            assert!(has_error_code(vector), "vector {vector}");
        }
        for vector in [0u8, 3, 9, 15, 16, 18, 32, 255] {
            assert!(!has_error_code(vector), "vector {vector}");
        }
    }

    #[test]
    fn registered_handler_receives_frame() {
        static SEEN: AtomicU64 = AtomicU64::new(0);
        fn handler(ctx: &mut CpuContext) {
            SEEN.store(ctx.spec1 << 32 | ctx.spec2, Ordering::SeqCst);
        }

        set_handler(40, handler).unwrap();
        let mut ctx = frame(40, 0);
        dispatch(&mut ctx);
        assert_eq!(SEEN.load(Ordering::SeqCst), 40u64 << 32);
    }

    #[test]
    fn double_registration_fails() {
        fn a(_: &mut CpuContext) {}
        fn b(_: &mut CpuContext) {}
        set_handler(41, a).unwrap();
        assert_eq!(set_handler(41, b), Err(InterruptError::AlreadyRegistered));
        assert_eq!(set_handler(41, a), Err(InterruptError::AlreadyRegistered));
    }

    #[test]
    fn exception_frame_carries_error_code() {
        static CODE: AtomicU64 = AtomicU64::new(0);
        fn handler(ctx: &mut CpuContext) {
            CODE.store(ctx.error_code(), Ordering::SeqCst);
        }
        set_handler(14, handler).unwrap();
        let mut ctx = frame(14, 0b10);
        dispatch(&mut ctx);
        assert_eq!(CODE.load(Ordering::SeqCst), 0b10);
    }

    #[test]
    #[should_panic(expected = "unhandled interrupt: vector 99")]
    fn unhandled_vector_hits_default() {
        let mut ctx = frame(99, 0);
        dispatch(&mut ctx);
    }
}
