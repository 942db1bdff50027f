//! Multiprocessor bring-up.
//!
//! Each enabled AP from the MADT is taken from real mode to long mode via
//! the INIT / SIPI / SIPI sequence and the patched trampoline page. APs
//! come up strictly one at a time under a boot lock the BSP holds and the
//! AP releases once it has left the shared temporary stack.

/// Computes the SIPI vector for a trampoline page.
pub const fn sipi_vector(tramp_phys: u64) -> u8 {
    (tramp_phys >> 12) as u8
}

/// Whether a physical page can be named by a SIPI vector (4 KiB aligned,
/// below 1 MiB).
pub const fn is_sipi_addressable(phys: u64) -> bool {
    phys & !0xFF000 == 0
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod runtime {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    use norn_core::addr::PhysAddr;
    use norn_core::{kdebug, kinfo, kwarn};
    use norn_mm::{PAGE_SIZE, Zone};

    use crate::acpi::{self, AcpiInfo};
    use crate::arch::x86_64::{apic, gdt, idt, paging, syscall, trampoline};
    use crate::mm;
    use crate::percpu::{self, PerCpu};

    /// AP kernel stack: 10 pages.
    ///
    /// TODO: carve an eleventh page as an unmapped guard below the stack.
    const AP_STACK_PAGES: usize = 10;

    /// Spins allowed while waiting for one AP to release the boot lock.
    const BOOT_SPIN_LIMIT: u64 = 100_000_000;

    /// Boot lock: true while an AP owns the trampoline and temp stack.
    /// Held by the BSP before the SIPI, released by the AP.
    static BOOT_LOCK: AtomicBool = AtomicBool::new(false);

    /// Boots every enabled AP listed in the MADT.
    pub fn boot_aps(acpi_info: &AcpiInfo) {
        let bsp_id = apic::id();
        let ap_count = acpi_info
            .cpus
            .iter()
            .filter(|cpu| cpu.enabled && cpu.apic_id != bsp_id)
            .count();
        if ap_count == 0 {
            kinfo!("smp: single-processor system");
            return;
        }

        // The DMA free lists are sorted, so the first allocation is the
        // lowest free page; if even that is above 1 MiB the machine has no
        // SIPI-addressable RAM left and bring-up is skipped.
        let tramp_phys = match mm::alloc_pages(1, Zone::Dma) {
            Ok(frame) if is_sipi_addressable(frame.as_u64()) => frame,
            Ok(frame) => {
                let _ = mm::free_pages(frame, 1);
                kwarn!("smp: no SIPI-addressable page, skipping AP bring-up");
                return;
            }
            Err(e) => {
                kwarn!("smp: no DMA page for the trampoline ({}), skipping", e);
                return;
            }
        };

        if let Err(e) = install_trampoline(tramp_phys) {
            kwarn!("smp: trampoline setup failed ({:?}), skipping", e);
            return;
        }
        kdebug!(
            "smp: trampoline at {:#x} (vector {:#x})",
            tramp_phys.as_u64(),
            sipi_vector(tramp_phys.as_u64())
        );

        let mut online = 0;
        for cpu in acpi_info.cpus.iter() {
            if !cpu.enabled || cpu.apic_id == bsp_id {
                continue;
            }
            if start_ap(cpu.apic_id, tramp_phys) {
                online += 1;
            } else {
                kwarn!("smp: cpu (apic {}) did not come up", cpu.apic_id);
            }
        }
        kinfo!("smp: {} AP(s) online, {} total", online, online + 1);
    }

    /// Copies the trampoline blob to `tramp_phys`, patches it, and
    /// identity-maps the page so the AP's paging enable does not break its
    /// own fetch stream.
    fn install_trampoline(tramp_phys: PhysAddr) -> Result<(), trampoline::PatchError> {
        let blob = trampoline::blob();
        assert!(blob.len() <= PAGE_SIZE - 64, "trampoline blob too large");

        let dst = mm::phys_to_virt(tramp_phys).as_mut_ptr::<u8>();
        // SAFETY: The page was just allocated and the direct map covers it.
        let dst = unsafe { core::slice::from_raw_parts_mut(dst, PAGE_SIZE) };
        dst[..blob.len()].copy_from_slice(blob);

        let base = tramp_phys.as_u64() as u32;
        let root = paging::kernel_root().as_u64();
        assert!(root < u64::from(u32::MAX), "kernel root above 4 GiB");

        // SAFETY: ap_tramp_* are linker symbols of the assembled blob.
        let pm_off = trampoline::label_offset(unsafe { &trampoline::ap_tramp_pm_entry }) as u32;
        // SAFETY: Same as above.
        let lm_off = trampoline::label_offset(unsafe { &trampoline::ap_tramp_lm_entry }) as u32;
        // SAFETY: Same as above.
        let gdt_off = trampoline::label_offset(unsafe { &trampoline::ap_tramp_gdt }) as u32;

        trampoline::patch_all(
            &mut dst[..blob.len()],
            trampoline::Relocations {
                pm_entry: base + pm_off,
                stack_top: base + PAGE_SIZE as u32 - 16,
                lm_entry: base + lm_off,
                // The AP loads CR3 before PCIDE is set, so the PCID bits
                // must be clear.
                cr3: root as u32,
                entry64: ap_entry64 as usize as u64,
                gdt_base: base + gdt_off,
            },
        )?;

        // Identity-map the page (executable) in the kernel tables.
        let kernel_root = mm::phys_to_virt(paging::kernel_root());
        // SAFETY: The page belongs to the trampoline; nothing else maps it.
        match unsafe {
            paging::map(
                kernel_root,
                tramp_phys.as_u64(),
                tramp_phys.as_u64(),
                PAGE_SIZE as u64,
                paging::Attribute::ReadWriteExecutable,
                false,
            )
        } {
            Ok(()) | Err(paging::PagingError::AlreadyMapped) => Ok(()),
            Err(e) => panic!("smp: trampoline identity map failed: {}", e),
        }
    }

    /// Runs the INIT / SIPI / SIPI sequence for one AP and waits for it to
    /// release the boot lock.
    fn start_ap(apic_id: u8, tramp_phys: PhysAddr) -> bool {
        BOOT_LOCK.store(true, Ordering::Release);

        apic::clear_esr();

        // INIT assert, then deassert, polling delivery in between.
        // SAFETY: The ICR words are the architectural INIT sequence.
        unsafe {
            apic::send_ipi(apic_id, apic::icr_init_assert());
            apic::wait_delivery_idle();
            apic::send_ipi(apic_id, apic::icr_init_deassert());
            apic::wait_delivery_idle();
        }
        acpi::busy_wait_us(10_000);

        // SIPI twice, 200 us apart (Intel MP spec).
        let vector = sipi_vector(tramp_phys.as_u64());
        for _ in 0..2 {
            // SAFETY: STARTUP IPI with the trampoline page vector.
            unsafe { apic::send_ipi(apic_id, apic::icr_sipi(vector)) };
            acpi::busy_wait_us(200);
            apic::wait_delivery_idle();
        }

        // The AP releases the lock once it is off the shared stack.
        let mut spins = 0u64;
        while BOOT_LOCK.load(Ordering::Acquire) {
            core::hint::spin_loop();
            spins += 1;
            if spins >= BOOT_SPIN_LIMIT {
                return false;
            }
        }
        true
    }

    /// Long-mode entry for APs, reached from the trampoline's final jump:
    /// temporary stack, BSP's CR3 (no PCID), temporary GDT, interrupts
    /// masked.
    extern "C" fn ap_entry64() -> ! {
        // A private kernel stack, before anything else: the temp stack is
        // shared with the next AP to boot.
        let stack = mm::alloc_pages(AP_STACK_PAGES, Zone::Normal)
            .expect("smp: no memory for AP stack");
        let stack_top =
            mm::phys_to_virt(stack).as_u64() + (AP_STACK_PAGES * PAGE_SIZE) as u64;

        // SAFETY: Switching to the fresh stack and never returning; the
        // stack top rides in RDI as ap_main's argument.
        unsafe {
            core::arch::asm!(
                "mov rsp, {stack}",
                "mov rdi, {stack}",
                "jmp {main}",
                stack = in(reg) stack_top,
                main = sym ap_main,
                options(noreturn),
            );
        }
    }

    /// AP main: off the shared stack, finish CPU-local bring-up.
    extern "C" fn ap_main(stack_top: u64) -> ! {
        BOOT_LOCK.store(false, Ordering::Release);

        apic::enable_current();

        // SAFETY: Heap is online; this runs once on this AP.
        let tss = unsafe { gdt::init_ap() };
        // SAFETY: GDT is loaded; the IDT static is shared and immutable.
        unsafe { idt::init() };

        let percpu: &'static mut PerCpu = alloc::boxed::Box::leak(alloc::boxed::Box::new(
            PerCpu::new(),
        ));
        let percpu_addr = percpu as *mut PerCpu;
        percpu.self_ptr = percpu_addr as u64;
        percpu.kernel_rsp = stack_top;
        percpu.cpu_id = percpu::cpu_count();
        percpu.lapic_id = u32::from(apic::id());
        percpu.tss = tss as u64;
        // SAFETY: percpu is leaked and fully initialized.
        unsafe { percpu::install(percpu_addr) };

        // SAFETY: GDT and percpu GS bases are set.
        unsafe { syscall::init().expect("smp: AP lacks SYSCALL") };

        percpu::add_online_cpu();
        kinfo!("smp: cpu online (apic {})", apic::id());

        // Placeholder for the AP scheduler loop.
        loop {
            norn_core::arch::x86_64::instructions::hlt();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use runtime::boot_aps;
