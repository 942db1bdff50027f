//! Boot handoff record and kernel entry.
//!
//! The UEFI-side loader hands the kernel one [`HandoffRecord`]: the raw
//! UEFI memory map, the ACPI RSDP, the per-CPU image base, the initramfs
//! location, and the command line. The layouts here are byte-exact views
//! of what the loader wrote; [`kernel_entry`] is the symbol it jumps to.

use norn_core::addr::PhysAddr;
use norn_mm::PhysMemoryRegion;
use planck_noalloc::vec::ArrayVec;

/// Handoff magic: must be the first field the kernel checks.
pub const NORN_HANDOFF_MAGIC: u64 = 0x6E6F_726E_B007_CAFE;

/// Maximum memory-map descriptors the kernel snapshots.
pub const MAX_MEMORY_REGIONS: usize = 256;

/// UEFI memory descriptor types the kernel distinguishes.
///
/// Values follow the UEFI specification; `NornReserved` is a kernel-private
/// extension in the OS-loader range marking the descriptors that hold the
/// kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryType {
    /// `EfiReservedMemoryType`.
    Reserved = 0,
    /// `EfiLoaderCode`.
    LoaderCode = 1,
    /// `EfiLoaderData`.
    LoaderData = 2,
    /// `EfiBootServicesCode`.
    BootServicesCode = 3,
    /// `EfiBootServicesData`.
    BootServicesData = 4,
    /// `EfiRuntimeServicesCode`.
    RuntimeServicesCode = 5,
    /// `EfiRuntimeServicesData`.
    RuntimeServicesData = 6,
    /// `EfiConventionalMemory`.
    ConventionalMemory = 7,
    /// `EfiUnusableMemory`.
    Unusable = 8,
    /// `EfiACPIReclaimMemory`.
    AcpiReclaim = 9,
    /// `EfiACPIMemoryNVS`.
    AcpiNvs = 10,
    /// `EfiMemoryMappedIO`.
    Mmio = 11,
    /// `EfiMemoryMappedIOPortSpace`.
    MmioPortSpace = 12,
    /// `EfiPalCode`.
    PalCode = 13,
    /// `EfiPersistentMemory`.
    PersistentMemory = 14,
    /// Kernel image pages, reserved by the Norn loader.
    NornReserved = 0x8000_0000,
    /// Anything the kernel does not recognize.
    Unknown = 0xFFFF_FFFF,
}

impl MemoryType {
    /// Decodes a raw UEFI type value.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Reserved,
            1 => Self::LoaderCode,
            2 => Self::LoaderData,
            3 => Self::BootServicesCode,
            4 => Self::BootServicesData,
            5 => Self::RuntimeServicesCode,
            6 => Self::RuntimeServicesData,
            7 => Self::ConventionalMemory,
            8 => Self::Unusable,
            9 => Self::AcpiReclaim,
            10 => Self::AcpiNvs,
            11 => Self::Mmio,
            12 => Self::MmioPortSpace,
            13 => Self::PalCode,
            14 => Self::PersistentMemory,
            0x8000_0000 => Self::NornReserved,
            _ => Self::Unknown,
        }
    }

    /// Whether the allocators may hand out frames of this type once boot
    /// services have been exited.
    pub const fn is_usable(self) -> bool {
        matches!(
            self,
            Self::ConventionalMemory
                | Self::BootServicesCode
                | Self::BootServicesData
                | Self::LoaderCode
        )
    }
}

/// One UEFI memory descriptor (the prefix the kernel consumes; the real
/// descriptor may be larger, which is why walks use `descriptor_size`).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryDescriptor {
    /// Raw UEFI memory type.
    pub memory_type: u32,
    _pad: u32,
    /// Physical start of the region.
    pub physical_start: u64,
    /// Virtual start (unused; the loader leaves the identity map).
    pub virtual_start: u64,
    /// Number of 4 KiB pages.
    pub number_of_pages: u64,
    /// UEFI attribute bits.
    pub attribute: u64,
}

/// The raw UEFI memory map block in the handoff record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryMap {
    /// Size of the buffer backing the map.
    pub buffer_size: u64,
    /// Pointer to the first descriptor.
    pub descriptors: *const u8,
    /// Bytes of the buffer actually used.
    pub map_size: u64,
    /// UEFI map key (needed only by the loader for ExitBootServices).
    pub map_key: u64,
    /// Stride between descriptors (≥ `size_of::<MemoryDescriptor>()`).
    pub descriptor_size: u64,
    /// Descriptor layout version.
    pub descriptor_version: u64,
}

/// The initramfs location in the handoff record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InitramfsInfo {
    /// Archive size in bytes.
    pub size: u64,
    /// Physical address of the archive.
    pub addr: u64,
}

/// The boot handoff record, written by the UEFI loader.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HandoffRecord {
    /// Must equal [`NORN_HANDOFF_MAGIC`].
    pub magic: u64,
    /// The raw UEFI memory map.
    pub memory_map: MemoryMap,
    /// ACPI 2.0 RSDP physical address.
    pub rsdp: u64,
    /// Virtual base the per-CPU image segments were loaded at.
    pub percpu_base: u64,
    /// Initramfs location.
    pub initramfs: InitramfsInfo,
    /// NUL-terminated command line.
    pub cmdline: [u8; 256],
}

impl HandoffRecord {
    /// Returns the command line as a string slice (up to the first NUL).
    pub fn cmdline_str(&self) -> &str {
        let len = self
            .cmdline
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.cmdline.len());
        core::str::from_utf8(&self.cmdline[..len]).unwrap_or("")
    }
}

/// Walks a raw UEFI memory map buffer, decoding each descriptor.
///
/// The walk honors `descriptor_size` rather than `size_of::<MemoryDescriptor>()`:
/// firmware frequently appends vendor fields to descriptors.
pub fn walk_memory_map(
    buffer: &[u8],
    descriptor_size: usize,
    mut f: impl FnMut(MemoryType, PhysAddr, u64),
) {
    assert!(descriptor_size >= core::mem::size_of::<MemoryDescriptor>());
    let mut offset = 0;
    while offset + descriptor_size <= buffer.len() {
        // SAFETY: The range check above keeps the read inside `buffer`;
        // MemoryDescriptor is a plain-old-data prefix of the descriptor.
        let desc = unsafe {
            core::ptr::read_unaligned(buffer.as_ptr().add(offset) as *const MemoryDescriptor)
        };
        f(
            MemoryType::from_raw(desc.memory_type),
            PhysAddr::new(desc.physical_start),
            desc.number_of_pages,
        );
        offset += descriptor_size;
    }
}

/// Snapshots the UEFI map into allocator-facing regions.
pub fn snapshot_regions(
    buffer: &[u8],
    descriptor_size: usize,
) -> ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS> {
    let mut regions = ArrayVec::new();
    walk_memory_map(buffer, descriptor_size, |mtype, start, pages| {
        if regions.is_full() {
            return;
        }
        regions.push(PhysMemoryRegion {
            start,
            size: pages * norn_mm::PAGE_SIZE as u64,
            usable: mtype.is_usable(),
        });
    });
    regions
}

/// Highest usable RAM address in the map, for sizing the direct map.
pub fn max_ram(regions: &[PhysMemoryRegion]) -> u64 {
    regions
        .iter()
        .filter(|r| r.usable)
        .map(|r| r.start.as_u64() + r.size)
        .max()
        .unwrap_or(0)
}

/// Populates the physical resource map from the UEFI map and the handoff
/// record.
pub fn build_resource_map(
    buffer: &[u8],
    descriptor_size: usize,
) -> norn_mm::resource::ResourceMap {
    use norn_mm::resource::{ResourceKind, ResourceMap};

    let mut map = ResourceMap::new();
    walk_memory_map(buffer, descriptor_size, |mtype, start, pages| {
        let kind = match mtype {
            MemoryType::ConventionalMemory
            | MemoryType::BootServicesCode
            | MemoryType::BootServicesData
            | MemoryType::LoaderCode
            | MemoryType::LoaderData => ResourceKind::SystemRam,
            MemoryType::NornReserved => ResourceKind::NornImage,
            MemoryType::AcpiReclaim | MemoryType::AcpiNvs => ResourceKind::AcpiTables,
            MemoryType::Mmio | MemoryType::MmioPortSpace => ResourceKind::Pci,
            MemoryType::Reserved | MemoryType::Unusable => ResourceKind::Reserved,
            _ => ResourceKind::Unknown,
        };
        let _ = map.insert(start, pages * norn_mm::PAGE_SIZE as u64, kind);
    });
    map
}

// ---------------------------------------------------------------------------
// Kernel entry (bare-metal only)
// ---------------------------------------------------------------------------

/// The symbol the UEFI loader jumps to, with interrupts masked and the
/// identity map still live.
///
/// # Safety
///
/// `handoff` must point to a valid [`HandoffRecord`] in memory that stays
/// mapped for the kernel's lifetime.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kernel_entry(handoff: *const HandoffRecord) -> ! {
    // SAFETY: Loader contract.
    let handoff = unsafe { &*handoff };
    kernel_init(handoff)
}

/// Brings the kernel up from the handoff record to the init task.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn kernel_init(handoff: &'static HandoffRecord) -> ! {
    use crate::{halt_forever, kinfo};

    crate::log::init_early_serial();
    assert_eq!(handoff.magic, NORN_HANDOFF_MAGIC, "bad handoff magic");

    let cfg = crate::config::BootConfig::parse(handoff.cmdline_str());
    norn_core::log::set_max_level(cfg.log_level);
    kinfo!("norn: booting (cmdline: {:?})", handoff.cmdline_str());
    norn_core::kdebug!(
        "norn: rsdp={:#x} percpu_base={:#x} initramfs={:#x}+{:#x}",
        handoff.rsdp,
        handoff.percpu_base,
        handoff.initramfs.addr,
        handoff.initramfs.size
    );

    // SAFETY: The loader guarantees the memory-map buffer is valid.
    let map_buffer = unsafe {
        core::slice::from_raw_parts(
            handoff.memory_map.descriptors,
            handoff.memory_map.map_size as usize,
        )
    };
    let descriptor_size = handoff.memory_map.descriptor_size as usize;
    let regions = snapshot_regions(map_buffer, descriptor_size);
    crate::mm::set_memory_map(regions.as_slice());

    // Frames for paging reconstruction come from the bootstrap allocator,
    // which runs on the identity map (offset 0).
    crate::mm::init_bootstrap();

    // SAFETY: Called exactly once, on the identity map, before any other
    // CPU is running.
    unsafe { crate::arch::x86_64::paging::reconstruct() };

    // The bootstrap allocator retires; the buddy allocator takes over and
    // the heap comes up on top of it.
    crate::mm::switch_to_buddy();

    let resources = build_resource_map(map_buffer, descriptor_size);
    resources.walk(|depth, r| {
        kinfo!(
            "{:indent$}{:#012x}-{:#012x} : {}",
            "",
            r.start.as_u64(),
            r.end(),
            r.kind.name(),
            indent = depth * 2
        );
    });

    // CPU state: descriptor tables, interrupt routing, percpu, syscalls.
    // SAFETY: Single-threaded boot path, called once per CPU.
    unsafe {
        let tss = crate::arch::x86_64::gdt::init_bsp();
        crate::arch::x86_64::idt::init();
        crate::percpu::init_bsp(tss as u64);
        crate::arch::x86_64::syscall::init().expect("SYSCALL not supported");
    }

    // ACPI: LAPIC address, CPU inventory, PM timer.
    let acpi = crate::acpi::init(PhysAddr::new(handoff.rsdp)).expect("ACPI tables unreadable");

    // SAFETY: ACPI reported the LAPIC base; the direct map covers it.
    unsafe { crate::arch::x86_64::apic::init(acpi.lapic_addr) };

    if cfg.smp {
        crate::arch::x86_64::smp::boot_aps(&acpi);
    } else {
        kinfo!("smp: disabled on the command line");
    }

    // Filesystems: ramfs root populated from the initramfs, devfs at /dev.
    crate::syscall::vfs_init();
    if handoff.initramfs.size > 0 {
        // SAFETY: The loader placed the archive at this physical range.
        let initrd = unsafe {
            core::slice::from_raw_parts(
                crate::mm::phys_to_virt(PhysAddr::new(handoff.initramfs.addr)).as_ptr(),
                handoff.initramfs.size as usize,
            )
        };
        let files = crate::syscall::populate_root(initrd).expect("initramfs unpack failed");
        kinfo!("initramfs: {} files", files);
    }

    // Hand control to the init task; its syscalls come back through
    // dispatch_syscall.
    crate::task::spawn_init(&cfg.init_path);

    kinfo!("norn: init task exited, halting");
    halt_forever()
}
