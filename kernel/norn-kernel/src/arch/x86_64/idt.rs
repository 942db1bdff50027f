//! IDT setup: all 256 gates point at the vector-specific ISR stubs.

use norn_core::arch::x86_64::structures::idt::{EntryOptions, InterruptDescriptorTable};
use norn_core::sync::LazyLock;

use super::gdt::FAULT_IST_INDEX;
use super::interrupts::stubs::STUBS;

/// Double fault vector.
const VECTOR_DF: usize = 8;
/// Page fault vector.
const VECTOR_PF: usize = 14;

/// The static IDT, shared by every CPU.
///
/// DPL stays 0 on all gates: hardware interrupts ignore DPL, and ring-3
/// software `int n` is disallowed unless a handler explicitly raises it.
/// #DF and #PF run on IST1 so they always get a valid stack.
static IDT: LazyLock<InterruptDescriptorTable> = LazyLock::new(|| {
    let mut idt = InterruptDescriptorTable::new();
    for (vector, stub) in STUBS.iter().enumerate() {
        let mut options = EntryOptions::new();
        if vector == VECTOR_DF || vector == VECTOR_PF {
            options = options.with_ist(FAULT_IST_INDEX);
        }
        idt.entries[vector].set_stub_addr(*stub as u64, options);
    }
    idt
});

/// Loads the IDT on the executing CPU.
///
/// # Safety
///
/// The GDT must already be loaded (the gates reference the kernel code
/// selector).
pub unsafe fn init() {
    // SAFETY: The IDT is a fully built static; caller contract covers CS.
    unsafe { (*IDT).load() };
    norn_core::kdebug!("idt: 256 gates loaded");
}
