//! Kernel memory management facade.
//!
//! Owns the two process-wide frame allocators and the direct-map window.
//! The bootstrap allocator serves the window between handoff and paging
//! reconstruction; the buddy allocator serves the rest of the kernel's
//! lifetime. Allocating through the wrong phase fails fast.

pub mod heap;

use core::sync::atomic::{AtomicU8, Ordering};

use norn_core::addr::{PhysAddr, VirtAddr};
use norn_core::sync::SpinLock;
use norn_mm::bootmem::{BOOTSTRAP_CAP, BootstrapAllocator};
use norn_mm::buddy::BuddyAllocator;
use norn_mm::{MemError, PAGE_SIZE, PhysMemoryRegion, Zone};
use planck_noalloc::vec::ArrayVec;

use crate::boot::MAX_MEMORY_REGIONS;

/// Base of the direct map: all RAM is visible at `phys + DIRECT_MAP_BASE`.
/// 1 GiB aligned, high half.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8880_0000_0000;

/// One gibibyte.
pub const GIB: u64 = 1 << 30;

/// Translates a physical RAM address to its direct-map virtual address.
#[inline]
pub const fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + DIRECT_MAP_BASE)
}

/// Translates a direct-map virtual address back to its physical address.
///
/// Valid only for addresses inside the direct-map window.
#[inline]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    debug_assert!(virt.as_u64() >= DIRECT_MAP_BASE);
    PhysAddr::new(virt.as_u64() - DIRECT_MAP_BASE)
}

/// Allocator lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    /// Before any allocator exists.
    Early = 0,
    /// Bootstrap allocator live, identity map still active.
    Bootstrap = 1,
    /// Buddy allocator live on the direct map.
    Paged = 2,
}

static PHASE: AtomicU8 = AtomicU8::new(Phase::Early as u8);

fn phase() -> Phase {
    match PHASE.load(Ordering::Acquire) {
        0 => Phase::Early,
        1 => Phase::Bootstrap,
        _ => Phase::Paged,
    }
}

/// Snapshot of the boot memory map, kept for buddy seeding and the
/// direct-map sizing.
static MEMORY_MAP: SpinLock<ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS>> =
    SpinLock::new(ArrayVec::new());

/// The bootstrap frame allocator (pre-paging).
static BOOTSTRAP: BootstrapAllocator = BootstrapAllocator::new();

/// The buddy frame allocator (post-paging).
static BUDDY: BuddyAllocator = BuddyAllocator::new(DIRECT_MAP_BASE);

/// Stores the boot memory map snapshot.
pub fn set_memory_map(regions: &[PhysMemoryRegion]) {
    let mut map = MEMORY_MAP.lock();
    map.clear();
    for &region in regions {
        map.push(region);
    }
}

/// Runs `f` against the stored memory map.
pub fn with_memory_map<R>(f: impl FnOnce(&[PhysMemoryRegion]) -> R) -> R {
    let map = MEMORY_MAP.lock();
    f(map.as_slice())
}

/// Number of 1 GiB slots the direct map must cover.
pub fn direct_map_gib() -> u64 {
    with_memory_map(|map| crate::boot::max_ram(map).div_ceil(GIB))
}

/// Brings up the bootstrap allocator on the identity map.
pub fn init_bootstrap() {
    assert_eq!(phase(), Phase::Early, "bootstrap allocator double init");
    with_memory_map(|map| {
        // SAFETY: The identity map is live, so offset 0 translates the
        // chosen region; the map came straight from firmware.
        unsafe { BOOTSTRAP.init(map, BOOTSTRAP_CAP, 0) }.expect("no region for bootstrap pool")
    });
    PHASE.store(Phase::Bootstrap as u8, Ordering::Release);
}

/// Allocates one zeroed frame from the bootstrap allocator. Used by paging
/// reconstruction for fresh tables.
///
/// # Panics
///
/// Panics on exhaustion: without page tables the kernel cannot continue.
pub fn bootstrap_alloc_table() -> PhysAddr {
    assert_eq!(phase(), Phase::Bootstrap, "bootstrap alloc outside its phase");
    let frame = BOOTSTRAP
        .alloc_pages(1, Zone::Normal)
        .expect("bootstrap pool exhausted during paging reconstruction");
    // SAFETY: Identity map is live during the bootstrap phase.
    unsafe { core::ptr::write_bytes(frame.as_u64() as *mut u8, 0, PAGE_SIZE) };
    frame
}

/// Retires the bootstrap allocator and seeds the buddy allocator from the
/// residual memory map. Called once, right after paging reconstruction.
pub fn switch_to_buddy() {
    assert_eq!(phase(), Phase::Bootstrap, "buddy takeover out of order");
    let (used_start, used_frames) = BOOTSTRAP.used_region();
    BOOTSTRAP.retire();
    with_memory_map(|map| {
        // SAFETY: The direct map is installed and covers every usable
        // region; the bootstrap prefix is carved out.
        unsafe { BUDDY.seed(map, used_start, used_frames) };
    });
    PHASE.store(Phase::Paged as u8, Ordering::Release);

    let (dma_total, _) = BUDDY.zone_counts(Zone::Dma);
    let (normal_total, _) = BUDDY.zone_counts(Zone::Normal);
    norn_core::kinfo!(
        "mm: buddy online ({} DMA + {} normal pages, bootstrap kept {} frames)",
        dma_total,
        normal_total,
        used_frames
    );
}

/// Allocates `n` contiguous pages from the live allocator.
pub fn alloc_pages(n: usize, zone: Zone) -> Result<PhysAddr, MemError> {
    match phase() {
        Phase::Early => panic!("page allocation before mm init"),
        Phase::Bootstrap => BOOTSTRAP.alloc_pages(n, zone),
        Phase::Paged => BUDDY.alloc_pages(n, zone),
    }
}

/// Frees `n` contiguous pages. Only valid once the buddy allocator owns
/// the map.
pub fn free_pages(phys: PhysAddr, n: usize) -> Result<(), MemError> {
    match phase() {
        Phase::Paged => BUDDY.free_pages(phys, n),
        _ => Err(MemError::InvalidRegion),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_base_is_1gib_aligned_and_canonical() {
        assert_eq!(DIRECT_MAP_BASE % GIB, 0);
        assert!(norn_core::addr::is_canonical(DIRECT_MAP_BASE));
    }

    #[test]
    fn phys_virt_roundtrip() {
        let phys = PhysAddr::new(0x12_3456_7000);
        let virt = phys_to_virt(phys);
        assert_eq!(virt.as_u64(), 0xFFFF_8880_0000_0000 + 0x12_3456_7000);
        assert_eq!(virt_to_phys(virt), phys);
    }
}
