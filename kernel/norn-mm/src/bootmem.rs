//! Bootstrap frame allocator.
//!
//! Serves 4 KiB frames between firmware handoff and paging reconstruction,
//! when no direct map exists yet and the heap is far away. Both its frame
//! metadata array and the pool it describes are carved from the first
//! sufficiently large UEFI-usable region. Frames are handed out first-fit
//! and never freed; once paging is reconstructed the allocator publishes
//! its used prefix (for the buddy allocator to carve out) and goes dormant.

use norn_core::addr::PhysAddr;
use norn_core::sync::IrqSpinLock;

use crate::{MemError, PAGE_SIZE, PhysMemoryRegion, Zone};

/// Capacity of the bootstrap pool: 50 MiB of 4 KiB frames.
pub const BOOTSTRAP_CAP: usize = 50 * 1024 * 1024 / PAGE_SIZE;

/// Per-frame metadata.
#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Physical address of the frame.
    phys: PhysAddr,
    /// Whether the frame has been handed out (or holds metadata).
    in_use: bool,
}

/// Number of frames needed to hold the metadata array for `cap` frames.
const fn metadata_frames(cap: usize) -> usize {
    (core::mem::size_of::<Frame>() * cap).div_ceil(PAGE_SIZE)
}

struct Inner {
    /// Frame metadata, living inside the pool's leading frames.
    frames: Option<&'static mut [Frame]>,
    /// Set once paging reconstruction retires this allocator.
    retired: bool,
}

// SAFETY: The metadata slice is only touched under the lock.
unsafe impl Send for Inner {}

/// The bootstrap frame allocator. A process-wide singleton in the kernel;
/// constructible standalone for host tests.
pub struct BootstrapAllocator {
    inner: IrqSpinLock<Inner>,
}

impl BootstrapAllocator {
    /// Creates an uninitialized allocator.
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(Inner {
                frames: None,
                retired: false,
            }),
        }
    }

    /// Initializes the allocator from the boot memory map.
    ///
    /// Picks the first usable region with at least `capacity` pages, places
    /// the metadata array in its leading frames (marked in-use, never
    /// freed), and describes the first `capacity` frames of the region.
    ///
    /// # Safety
    ///
    /// - `offset` must translate every physical address in the chosen
    ///   region to a readable/writable virtual address (0 under the UEFI
    ///   identity map).
    /// - `regions` must accurately describe physical memory.
    /// - Must be called exactly once, before any allocation.
    pub unsafe fn init(
        &self,
        regions: &[PhysMemoryRegion],
        capacity: usize,
        offset: u64,
    ) -> Result<(), MemError> {
        let meta_frames = metadata_frames(capacity);
        let need_bytes = ((meta_frames + capacity) * PAGE_SIZE) as u64;

        let region = regions
            .iter()
            .find(|r| r.usable && r.size >= need_bytes)
            .ok_or(MemError::OutOfMemory)?;

        // SAFETY: The region is usable RAM and `offset` translates it.
        let frames = unsafe {
            let ptr = offset.wrapping_add(region.start.as_u64()) as *mut Frame;
            core::slice::from_raw_parts_mut(ptr, capacity)
        };

        for (i, frame) in frames.iter_mut().enumerate() {
            *frame = Frame {
                phys: region.start + (i * PAGE_SIZE) as u64,
                // The leading frames hold this metadata array itself.
                in_use: i < meta_frames,
            };
        }

        let mut inner = self.inner.lock();
        assert!(inner.frames.is_none(), "bootstrap allocator already initialized");
        inner.frames = Some(frames);
        Ok(())
    }

    /// Allocates `n` contiguous 4 KiB frames.
    ///
    /// The `zone` is accepted for interface parity with the buddy allocator
    /// but ignored: any usable frame may be returned this early in boot.
    ///
    /// # Panics
    ///
    /// Panics if called before [`init`](Self::init) or after
    /// [`retire`](Self::retire): allocating on the wrong phase would
    /// silently corrupt memory.
    pub fn alloc_pages(&self, n: usize, _zone: Zone) -> Result<PhysAddr, MemError> {
        if n == 0 {
            return Err(MemError::InvalidRegion);
        }
        let mut inner = self.inner.lock();
        assert!(!inner.retired, "bootstrap allocator used after retirement");
        let frames = inner
            .frames
            .as_deref_mut()
            .expect("bootstrap allocator not initialized");

        // Linear first-fit scan for a run of `n` free frames.
        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..frames.len() {
            if frames[i].in_use {
                run_len = 0;
                run_start = i + 1;
            } else {
                run_len += 1;
                if run_len == n {
                    for frame in &mut frames[run_start..run_start + n] {
                        frame.in_use = true;
                    }
                    return Ok(frames[run_start].phys);
                }
            }
        }
        Err(MemError::OutOfMemory)
    }

    /// The bootstrap allocator never takes frames back.
    pub fn free_pages(&self, _phys: PhysAddr, _n: usize) -> Result<(), MemError> {
        Err(MemError::InvalidRegion)
    }

    /// Returns the contiguous in-use prefix as `(start, frame_count)`.
    ///
    /// Because allocation is first-fit and nothing is ever freed, all
    /// in-use frames form a prefix of the pool; the buddy allocator uses
    /// this to exclude them while seeding.
    pub fn used_region(&self) -> (PhysAddr, usize) {
        let inner = self.inner.lock();
        let frames = inner
            .frames
            .as_deref()
            .expect("bootstrap allocator not initialized");
        let used = frames.iter().take_while(|f| f.in_use).count();
        debug_assert!(
            frames[used..].iter().all(|f| !f.in_use),
            "in-use frames are not a contiguous prefix"
        );
        (frames[0].phys, used)
    }

    /// Marks the allocator dormant. Called once paging reconstruction has
    /// switched the kernel onto the new tables; any later allocation is a
    /// bug and panics.
    pub fn retire(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.frames.is_some(), "bootstrap allocator not initialized");
        inner.retired = true;
    }
}

impl Default for BootstrapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    /// A page-aligned host buffer posing as a physical region.
    struct TestPool {
        ptr: *mut u8,
        layout: Layout,
        phys_base: u64,
        pages: usize,
    }

    impl TestPool {
        fn new(pages: usize, phys_base: u64) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self {
                ptr,
                layout,
                phys_base,
                pages,
            }
        }

        fn offset(&self) -> u64 {
            (self.ptr as u64).wrapping_sub(self.phys_base)
        }

        fn region(&self) -> PhysMemoryRegion {
            PhysMemoryRegion {
                start: PhysAddr::new(self.phys_base),
                size: (self.pages * PAGE_SIZE) as u64,
                usable: true,
            }
        }
    }

    impl Drop for TestPool {
        fn drop(&mut self) {
            // SAFETY: Allocated with the same layout in `new`.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    const TEST_CAP: usize = 64;
    /// Pool pages: metadata frames + capacity, per the region size rule.
    const TEST_POOL_PAGES: usize = TEST_CAP + 1;

    fn setup(pool: &TestPool) -> BootstrapAllocator {
        let alloc = BootstrapAllocator::new();
        // SAFETY: The pool buffer backs the whole synthetic region.
        unsafe {
            alloc
                .init(&[pool.region()], TEST_CAP, pool.offset())
                .unwrap();
        }
        alloc
    }

    #[test]
    fn metadata_occupies_prefix() {
        let pool = TestPool::new(TEST_POOL_PAGES, 0x10_0000);
        let alloc = setup(&pool);
        let (start, used) = alloc.used_region();
        assert_eq!(start.as_u64(), 0x10_0000);
        assert_eq!(used, metadata_frames(TEST_CAP));
    }

    #[test]
    fn allocations_are_contiguous_and_disjoint() {
        let pool = TestPool::new(TEST_POOL_PAGES, 0x10_0000);
        let alloc = setup(&pool);
        let meta = metadata_frames(TEST_CAP);

        let a = alloc.alloc_pages(3, Zone::Normal).unwrap();
        let b = alloc.alloc_pages(2, Zone::Normal).unwrap();
        assert_eq!(a.as_u64(), 0x10_0000 + (meta * PAGE_SIZE) as u64);
        assert_eq!(b.as_u64(), a.as_u64() + 3 * PAGE_SIZE as u64);
        assert!(a.is_aligned(PAGE_SIZE as u64));
    }

    #[test]
    fn used_prefix_is_monotone() {
        let pool = TestPool::new(TEST_POOL_PAGES, 0x10_0000);
        let alloc = setup(&pool);
        let (_, before) = alloc.used_region();
        alloc.alloc_pages(1, Zone::Dma).unwrap();
        let (_, mid) = alloc.used_region();
        alloc.alloc_pages(5, Zone::Normal).unwrap();
        let (_, after) = alloc.used_region();
        assert!(before < mid && mid < after);
        assert_eq!(after, before + 6);
    }

    #[test]
    fn exhaustion_reports_oom() {
        let pool = TestPool::new(TEST_POOL_PAGES, 0x10_0000);
        let alloc = setup(&pool);
        let available = TEST_CAP - metadata_frames(TEST_CAP);
        assert!(alloc.alloc_pages(available, Zone::Normal).is_ok());
        assert_eq!(
            alloc.alloc_pages(1, Zone::Normal),
            Err(MemError::OutOfMemory)
        );
    }

    #[test]
    fn free_is_rejected() {
        let pool = TestPool::new(TEST_POOL_PAGES, 0x10_0000);
        let alloc = setup(&pool);
        let a = alloc.alloc_pages(1, Zone::Normal).unwrap();
        assert_eq!(alloc.free_pages(a, 1), Err(MemError::InvalidRegion));
    }

    #[test]
    fn skips_too_small_regions() {
        let big = TestPool::new(TEST_POOL_PAGES, 0x40_0000);
        let alloc = BootstrapAllocator::new();
        let regions = [
            // Too small to hold metadata + pool; never dereferenced.
            PhysMemoryRegion {
                start: PhysAddr::new(0x1000),
                size: (4 * PAGE_SIZE) as u64,
                usable: true,
            },
            // Usable but not RAM.
            PhysMemoryRegion {
                start: PhysAddr::new(0x2000_0000),
                size: (big.pages * PAGE_SIZE) as u64,
                usable: false,
            },
            big.region(),
        ];
        // SAFETY: Only the final (sufficiently large, usable) region is
        // selected and dereferenced, and big's offset translates it.
        unsafe {
            alloc.init(&regions, TEST_CAP, big.offset()).unwrap();
        }
        let (start, _) = alloc.used_region();
        assert_eq!(start.as_u64(), big.phys_base);
    }

    #[test]
    #[should_panic(expected = "after retirement")]
    fn alloc_after_retire_panics() {
        let pool = TestPool::new(TEST_POOL_PAGES, 0x10_0000);
        let alloc = setup(&pool);
        alloc.retire();
        let _ = alloc.alloc_pages(1, Zone::Normal);
    }
}
