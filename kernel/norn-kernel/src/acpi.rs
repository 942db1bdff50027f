//! ACPI table discovery: RSDP, XSDT, MADT (CPU inventory + LAPIC base),
//! and the FADT PM timer used for bring-up delays.
//!
//! Parsing operates on byte slices so it is host-testable; the kernel glue
//! that reaches the tables through the direct map is gated.

use norn_core::addr::PhysAddr;
use planck_noalloc::vec::ArrayVec;

use crate::percpu::MAX_CPUS;

/// ACPI parsing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// Bad RSDP signature or checksum.
    BadRsdp,
    /// The RSDP predates ACPI 2.0 (no XSDT).
    TooOld,
    /// A table was truncated or its signature did not match.
    BadTable,
    /// No MADT present.
    NoMadt,
}

/// One CPU reported by the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MadtCpu {
    /// ACPI processor UID.
    pub processor_uid: u8,
    /// Local APIC id.
    pub apic_id: u8,
    /// Whether the CPU is enabled (MADT flags bit 0).
    pub enabled: bool,
}

/// Aggregated ACPI facts the kernel needs.
pub struct AcpiInfo {
    /// Local APIC MMIO base.
    pub lapic_addr: PhysAddr,
    /// CPUs in firmware order (the BSP is included).
    pub cpus: ArrayVec<MadtCpu, MAX_CPUS>,
    /// PM timer port, if the FADT advertises one.
    pub pm_timer_port: Option<u16>,
}

/// PM timer frequency in Hz (ACPI fixed).
pub const PM_TIMER_HZ: u64 = 3_579_545;

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(
        bytes.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(
        bytes.get(offset..offset + 8)?.try_into().ok()?,
    ))
}

/// Validates an ACPI 2.0 RSDP and returns the XSDT physical address.
///
/// Checks the `"RSD PTR "` signature, the version-1 checksum over the
/// first 20 bytes, and requires revision ≥ 2.
pub fn parse_rsdp(bytes: &[u8]) -> Result<u64, AcpiError> {
    if bytes.len() < 36 || &bytes[0..8] != b"RSD PTR " {
        return Err(AcpiError::BadRsdp);
    }
    let sum = bytes[..20].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(AcpiError::BadRsdp);
    }
    if bytes[15] < 2 {
        return Err(AcpiError::TooOld);
    }
    read_u64(bytes, 24).ok_or(AcpiError::BadRsdp)
}

/// Returns `(signature, length)` of an SDT header.
pub fn sdt_header(bytes: &[u8]) -> Result<([u8; 4], usize), AcpiError> {
    if bytes.len() < 36 {
        return Err(AcpiError::BadTable);
    }
    let sig: [u8; 4] = bytes[0..4].try_into().map_err(|_| AcpiError::BadTable)?;
    let length = read_u32(bytes, 4).ok_or(AcpiError::BadTable)? as usize;
    if length < 36 {
        return Err(AcpiError::BadTable);
    }
    Ok((sig, length))
}

/// Iterates the XSDT's 64-bit table pointers.
pub fn xsdt_entries(xsdt: &[u8]) -> Result<impl Iterator<Item = u64> + '_, AcpiError> {
    let (sig, length) = sdt_header(xsdt)?;
    if &sig != b"XSDT" || length > xsdt.len() {
        return Err(AcpiError::BadTable);
    }
    Ok((36..length)
        .step_by(8)
        .filter_map(move |offset| read_u64(xsdt, offset)))
}

/// Parses a MADT: returns the LAPIC base and the CPU list.
pub fn parse_madt(madt: &[u8]) -> Result<(u64, ArrayVec<MadtCpu, MAX_CPUS>), AcpiError> {
    let (sig, length) = sdt_header(madt)?;
    if &sig != b"APIC" || length > madt.len() {
        return Err(AcpiError::BadTable);
    }

    let lapic_addr = read_u32(madt, 36).ok_or(AcpiError::BadTable)? as u64;
    let mut cpus = ArrayVec::new();

    // Interrupt controller structures start at offset 44: (type, len) pairs.
    let mut offset = 44;
    while offset + 2 <= length {
        let entry_type = madt[offset];
        let entry_len = madt[offset + 1] as usize;
        if entry_len < 2 || offset + entry_len > length {
            return Err(AcpiError::BadTable);
        }
        // Type 0: processor local APIC.
        if entry_type == 0 && entry_len >= 8 && !cpus.is_full() {
            let flags = read_u32(madt, offset + 4).ok_or(AcpiError::BadTable)?;
            cpus.push(MadtCpu {
                processor_uid: madt[offset + 2],
                apic_id: madt[offset + 3],
                enabled: flags & 1 != 0,
            });
        }
        offset += entry_len;
    }

    Ok((lapic_addr, cpus))
}

/// Extracts the PM timer port from a FADT (`PM_TMR_BLK`, offset 76).
pub fn parse_fadt_pm_timer(fadt: &[u8]) -> Result<Option<u16>, AcpiError> {
    let (sig, _) = sdt_header(fadt)?;
    if &sig != b"FACP" {
        return Err(AcpiError::BadTable);
    }
    Ok(match read_u32(fadt, 76) {
        Some(0) | None => None,
        Some(port) => Some(port as u16),
    })
}

// ---------------------------------------------------------------------------
// Kernel glue (direct-map access + PM timer delays)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod runtime {
    use super::*;
    use crate::mm::phys_to_virt;
    use norn_core::arch::x86_64::instructions::port::inl;
    use norn_core::sync::SpinLock;

    /// The PM timer port, published for [`busy_wait_us`].
    static PM_TIMER_PORT: SpinLock<Option<u16>> = SpinLock::new(None);

    /// Reads the table at `phys` as a byte slice via the direct map.
    ///
    /// # Safety
    ///
    /// `phys` must point at a valid SDT covered by the direct map.
    unsafe fn table_slice(phys: PhysAddr) -> Result<&'static [u8], AcpiError> {
        let base = phys_to_virt(phys).as_ptr::<u8>();
        // SAFETY: The header is 36 bytes; read it first to learn the length.
        let header = unsafe { core::slice::from_raw_parts(base, 36) };
        let (_, length) = sdt_header(header)?;
        // SAFETY: Firmware guarantees `length` bytes of table.
        Ok(unsafe { core::slice::from_raw_parts(base, length) })
    }

    /// Walks the ACPI tables from the RSDP.
    pub fn init(rsdp: PhysAddr) -> Result<AcpiInfo, AcpiError> {
        // SAFETY: The loader handed us the RSDP address; the direct map
        // covers firmware tables.
        let rsdp_bytes =
            unsafe { core::slice::from_raw_parts(phys_to_virt(rsdp).as_ptr::<u8>(), 36) };
        let xsdt_phys = parse_rsdp(rsdp_bytes)?;
        // SAFETY: The RSDP points at the XSDT.
        let xsdt = unsafe { table_slice(PhysAddr::new(xsdt_phys))? };

        let mut madt_info = None;
        let mut pm_timer_port = None;
        for entry in xsdt_entries(xsdt)? {
            // SAFETY: XSDT entries are physical table addresses.
            let table = match unsafe { table_slice(PhysAddr::new(entry)) } {
                Ok(table) => table,
                Err(_) => continue,
            };
            match &table[0..4] {
                b"APIC" => madt_info = Some(parse_madt(table)?),
                b"FACP" => pm_timer_port = parse_fadt_pm_timer(table)?,
                _ => {}
            }
        }

        let (lapic_addr, cpus) = madt_info.ok_or(AcpiError::NoMadt)?;
        *PM_TIMER_PORT.lock() = pm_timer_port;
        norn_core::kinfo!(
            "acpi: lapic at {:#x}, {} cpus, pm timer {:?}",
            lapic_addr,
            cpus.len(),
            pm_timer_port
        );
        Ok(AcpiInfo {
            lapic_addr: PhysAddr::new(lapic_addr),
            cpus,
            pm_timer_port,
        })
    }

    /// Busy-waits approximately `us` microseconds on the ACPI PM timer.
    ///
    /// The counter is 24-bit at 3.579545 MHz; wraps are handled. Falls
    /// back to a calibrated-by-nothing spin loop if no PM timer exists.
    pub fn busy_wait_us(us: u64) {
        let Some(port) = *PM_TIMER_PORT.lock() else {
            // Rough fallback: ~1000 spins per microsecond.
            for _ in 0..us * 1000 {
                core::hint::spin_loop();
            }
            return;
        };
        let ticks = us * PM_TIMER_HZ / 1_000_000;
        // SAFETY: The FADT advertised this port as the PM timer.
        let start = unsafe { inl(port) } & 0xFF_FFFF;
        let mut elapsed = 0u64;
        let mut last = start;
        while elapsed < ticks {
            // SAFETY: Same port as above.
            let now = unsafe { inl(port) } & 0xFF_FFFF;
            elapsed += u64::from(now.wrapping_sub(last) & 0xFF_FFFF);
            last = now;
            core::hint::spin_loop();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use runtime::{busy_wait_us, init};
