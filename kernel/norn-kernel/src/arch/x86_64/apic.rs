//! Local APIC access.
//!
//! The LAPIC register block is memory-mapped per CPU at the physical base
//! the MADT reports; the kernel reaches it through the direct map. ICR
//! word composition is pure and host-tested; everything touching the MMIO
//! block is gated.

/// Register offsets within the LAPIC MMIO block.
pub mod reg {
    /// Local APIC ID.
    pub const ID: usize = 0x20;
    /// End of interrupt.
    pub const EOI: usize = 0xB0;
    /// Spurious interrupt vector (and software-enable bit).
    pub const SVR: usize = 0xF0;
    /// Error status.
    pub const ESR: usize = 0x280;
    /// Interrupt command, low word (dispatch on write).
    pub const ICR_LOW: usize = 0x300;
    /// Interrupt command, high word (destination).
    pub const ICR_HIGH: usize = 0x310;
}

/// ICR delivery-status bit: set while the previous IPI is in flight.
pub const ICR_DELIVERY_STATUS: u32 = 1 << 12;

/// Delivery mode field values (ICR bits 10:8).
const DELIVERY_INIT: u32 = 0b101 << 8;
const DELIVERY_STARTUP: u32 = 0b110 << 8;

/// Level bit (1 = assert).
const LEVEL_ASSERT: u32 = 1 << 14;
/// Trigger mode bit (1 = level).
const TRIGGER_LEVEL: u32 = 1 << 15;

/// ICR low word for an INIT assert: INIT delivery, physical destination,
/// level-triggered assert, no shorthand, vector 0.
pub const fn icr_init_assert() -> u32 {
    DELIVERY_INIT | LEVEL_ASSERT | TRIGGER_LEVEL
}

/// ICR low word for the INIT deassert that follows.
pub const fn icr_init_deassert() -> u32 {
    DELIVERY_INIT | TRIGGER_LEVEL
}

/// ICR low word for a SIPI carrying the trampoline page number.
pub const fn icr_sipi(vector: u8) -> u32 {
    vector as u32 | DELIVERY_STARTUP | LEVEL_ASSERT
}

/// ICR high word addressing a physical APIC id.
pub const fn icr_dest(apic_id: u8) -> u32 {
    (apic_id as u32) << 24
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod runtime {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use norn_core::addr::PhysAddr;

    use crate::mm::phys_to_virt;

    /// SVR software-enable bit.
    const SVR_ENABLE: u32 = 1 << 8;
    /// Spurious interrupt vector.
    const SPURIOUS_VECTOR: u32 = 0xFF;

    /// Direct-map virtual address of the LAPIC block.
    static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

    fn base() -> u64 {
        let base = LAPIC_BASE.load(Ordering::Acquire);
        debug_assert!(base != 0, "LAPIC used before init");
        base
    }

    fn read(reg: usize) -> u32 {
        // SAFETY: The MADT reported this MMIO block; reads are 32-bit
        // aligned within it.
        unsafe { core::ptr::read_volatile((base() + reg as u64) as *const u32) }
    }

    fn write(reg: usize, value: u32) {
        // SAFETY: Same as `read`; the caller sequences command writes.
        unsafe { core::ptr::write_volatile((base() + reg as u64) as *mut u32, value) }
    }

    /// Records the LAPIC base and software-enables the APIC of the
    /// executing CPU.
    ///
    /// # Safety
    ///
    /// `lapic_phys` must be the MADT-reported LAPIC base, covered by the
    /// direct map.
    pub unsafe fn init(lapic_phys: PhysAddr) {
        LAPIC_BASE.store(phys_to_virt(lapic_phys).as_u64(), Ordering::Release);
        enable_current();
        norn_core::kinfo!("apic: lapic id {} online", id());
    }

    /// Software-enables the executing CPU's LAPIC (APs call this during
    /// bring-up; the base is already published).
    pub fn enable_current() {
        write(reg::SVR, SVR_ENABLE | SPURIOUS_VECTOR);
    }

    /// This CPU's LAPIC id.
    pub fn id() -> u8 {
        (read(reg::ID) >> 24) as u8
    }

    /// Signals end-of-interrupt for the in-service vector.
    pub fn eoi() {
        write(reg::EOI, 0);
    }

    /// Clears the error status register (write, then read-back discard).
    pub fn clear_esr() {
        write(reg::ESR, 0);
        let _ = read(reg::ESR);
    }

    /// Sends one IPI: destination first, then the command word (the write
    /// to ICR_LOW dispatches it).
    ///
    /// # Safety
    ///
    /// `icr_low` must be a well-formed command; INIT/SIPI sequencing rules
    /// are the caller's responsibility.
    pub unsafe fn send_ipi(dest_apic: u8, icr_low: u32) {
        write(reg::ICR_HIGH, icr_dest(dest_apic));
        write(reg::ICR_LOW, icr_low);
    }

    /// Spins until the LAPIC reports the previous IPI delivered.
    pub fn wait_delivery_idle() {
        while read(reg::ICR_LOW) & ICR_DELIVERY_STATUS != 0 {
            core::hint::spin_loop();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use runtime::{clear_esr, enable_current, eoi, id, init, send_ipi, wait_delivery_idle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_words() {
        // INIT assert: delivery 101, physical, level trigger, asserted.
        assert_eq!(icr_init_assert(), 0b101 << 8 | 1 << 14 | 1 << 15);
        // Deassert differs only in the level bit.
        assert_eq!(icr_init_assert() & !(1 << 14), icr_init_deassert());
        // Vector field must be zero for INIT.
        assert_eq!(icr_init_assert() & 0xFF, 0);
    }

    #[test]
    fn sipi_word_carries_page_number() {
        let sipi = icr_sipi(0x08);
        assert_eq!(sipi & 0xFF, 0x08);
        // STARTUP delivery mode, edge-triggered.
        assert_eq!((sipi >> 8) & 0b111, 0b110);
        assert_eq!(sipi & (1 << 15), 0);
    }

    #[test]
    fn destination_is_high_byte() {
        assert_eq!(icr_dest(3), 3 << 24);
        assert_eq!(icr_dest(0xFF), 0xFF00_0000);
    }
}
