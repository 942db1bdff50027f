//! Kernel heap: the global allocator behind `alloc::` collections.
//!
//! Small allocations come from power-of-two size classes (32..4096 bytes),
//! each an intrusive free list carved out of buddy pages. Larger
//! allocations go straight to the buddy allocator, sized in whole pages.
//! Class pages are never returned to the buddy allocator.

use core::alloc::{GlobalAlloc, Layout};

use norn_core::sync::IrqSpinLock;
use norn_mm::{PAGE_SIZE, Zone};

use super::{alloc_pages, free_pages, phys_to_virt};

/// Number of size classes.
const NUM_CLASSES: usize = 8;

/// Block sizes per class.
const CLASS_SIZES: [usize; NUM_CLASSES] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Returns the class index for a layout, or `None` if it needs whole pages.
fn class_for(layout: Layout) -> Option<usize> {
    let needed = layout.size().max(layout.align());
    CLASS_SIZES.iter().position(|&size| size >= needed)
}

/// Intrusive free-list node inside a free heap block.
#[repr(C)]
struct FreeHeapBlock {
    next: *mut FreeHeapBlock,
}

struct SizeClass {
    block_size: usize,
    free_head: *mut FreeHeapBlock,
}

// SAFETY: Class state is only touched under the heap lock.
unsafe impl Send for SizeClass {}

impl SizeClass {
    const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free_head: core::ptr::null_mut(),
        }
    }

    /// Pops a block, carving a fresh buddy page when the list is empty.
    fn alloc(&mut self) -> *mut u8 {
        if self.free_head.is_null() && !self.grow() {
            return core::ptr::null_mut();
        }
        let block = self.free_head;
        // SAFETY: free_head is non-null and points at a node this class wrote.
        self.free_head = unsafe { (*block).next };
        block as *mut u8
    }

    /// Pushes a block back onto the list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc` on this class.
    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        let block = ptr as *mut FreeHeapBlock;
        // SAFETY: Caller contract; the block is unreferenced now.
        unsafe { (*block).next = self.free_head };
        self.free_head = block;
    }

    /// Carves one buddy page into blocks of this class.
    fn grow(&mut self) -> bool {
        let Ok(frame) = alloc_pages(1, Zone::Normal) else {
            return false;
        };
        let page = phys_to_virt(frame).as_mut_ptr::<u8>();
        let blocks = PAGE_SIZE / self.block_size;
        for i in (0..blocks).rev() {
            // SAFETY: The page was just allocated and is covered by the
            // direct map; each block slot is within it.
            unsafe {
                let block = page.add(i * self.block_size) as *mut FreeHeapBlock;
                (*block).next = self.free_head;
                self.free_head = block;
            }
        }
        true
    }
}

/// The kernel heap.
pub struct KernelHeap {
    classes: [IrqSpinLock<SizeClass>; NUM_CLASSES],
}

impl KernelHeap {
    const fn new() -> Self {
        Self {
            classes: [
                IrqSpinLock::new(SizeClass::new(32)),
                IrqSpinLock::new(SizeClass::new(64)),
                IrqSpinLock::new(SizeClass::new(128)),
                IrqSpinLock::new(SizeClass::new(256)),
                IrqSpinLock::new(SizeClass::new(512)),
                IrqSpinLock::new(SizeClass::new(1024)),
                IrqSpinLock::new(SizeClass::new(2048)),
                IrqSpinLock::new(SizeClass::new(4096)),
            ],
        }
    }

    fn pages_for(layout: Layout) -> usize {
        layout.size().max(layout.align()).div_ceil(PAGE_SIZE)
    }
}

// SAFETY: Size classes are individually locked; multi-page allocations go
// to the (locked) buddy allocator. Blocks are aligned to their class size,
// which satisfies any layout routed into that class.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match class_for(layout) {
            Some(class) => self.classes[class].lock().alloc(),
            None => match alloc_pages(Self::pages_for(layout), Zone::Normal) {
                Ok(frame) => phys_to_virt(frame).as_mut_ptr(),
                Err(_) => core::ptr::null_mut(),
            },
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match class_for(layout) {
            // SAFETY: `ptr` came from this class's alloc (same layout).
            Some(class) => unsafe { self.classes[class].lock().dealloc(ptr) },
            None => {
                let phys = super::virt_to_phys(norn_core::addr::VirtAddr::new(ptr as u64));
                let _ = free_pages(phys, Self::pages_for(layout));
            }
        }
    }
}

/// The global kernel heap instance.
#[cfg_attr(all(target_arch = "x86_64", target_os = "none"), global_allocator)]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::new();

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn class_selection() {
        assert_eq!(class_for(layout(1, 1)), Some(0));
        assert_eq!(class_for(layout(32, 8)), Some(0));
        assert_eq!(class_for(layout(33, 8)), Some(1));
        assert_eq!(class_for(layout(4096, 8)), Some(7));
        assert_eq!(class_for(layout(4097, 8)), None);
    }

    #[test]
    fn alignment_drives_class_up() {
        // A 16-byte object with 256-byte alignment must land in the
        // 256-byte class, whose blocks are 256-aligned by construction.
        assert_eq!(class_for(layout(16, 256)), Some(3));
    }

    #[test]
    fn page_counts_for_large_layouts() {
        assert_eq!(KernelHeap::pages_for(layout(4097, 8)), 2);
        assert_eq!(KernelHeap::pages_for(layout(3 * 4096, 4096)), 3);
        assert_eq!(KernelHeap::pages_for(layout(8192, 8192)), 2);
    }
}
