//! Tasks and the cooperative context switch.
//!
//! A [`Thread`] owns a kernel stack and the saved callee-saved register
//! frame at its top. `switch_to` saves the six callee-saved registers,
//! swaps stacks, restores the six, and tail-jumps into
//! `switch_to_internal`, whose `ret` lands wherever the stack says: for a
//! running thread that is the instruction after its own `switch_to` call,
//! for a fresh thread it is the entry point planted by
//! [`build_initial_frame`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use norn_core::arch::x86_64::structures::context::{CpuContext, SwitchFrame};
use norn_core::arch::x86_64::structures::gdt::TaskStateSegment;
use norn_core::sync::SpinLock;
use norn_fs::dentry::DentryId;
use norn_fs::file::FileDescriptorTable;

use crate::percpu::{CpuLocal, MAX_CPUS};

/// Kernel stack size per thread (16 pages).
pub const KERNEL_STACK_SIZE: usize = 16 * 4096;

/// Memory-management state of a thread.
#[derive(Debug)]
#[repr(C)]
pub struct ThreadMm {
    /// Virtual (direct-map) address of the thread's L4 table; 0 keeps the
    /// current address space.
    pub page_table_root: u64,
}

/// Architecture-specific thread state.
#[derive(Debug)]
#[repr(C)]
pub struct ArchContext {
    /// The owning CPU's TSS, refreshed with this thread's RSP0 on switch.
    pub tss: *mut TaskStateSegment,
}

/// Filesystem state of a thread.
pub struct FsContext {
    /// Current working directory.
    pub cwd: DentryId,
    /// Open file descriptors.
    pub fds: FileDescriptorTable,
}

/// A kernel thread (and, for init, the kernel face of a user task).
///
/// The leading fields are read from `switch_to` assembly, so the struct is
/// `#[repr(C)]` with their offsets pinned by tests.
#[repr(C)]
pub struct Thread {
    /// Saved kernel stack pointer (offset 0; written/read by `switch_to`).
    pub kernel_stack_ptr: u64,
    /// Memory management state (offset 8).
    pub mm: ThreadMm,
    /// Architecture state (offset 16).
    pub arch: ArchContext,
    /// Thread id.
    pub tid: u32,
    /// The kernel stack backing store; lives as long as the thread.
    kernel_stack: Box<[u8]>,
    /// Filesystem state.
    pub fs: SpinLock<FsContext>,
}

// SAFETY: The raw TSS pointer is only dereferenced by the CPU that owns
// the thread during a switch, with interrupts disabled; everything else is
// Send data behind locks.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Creates a thread whose first `switch_to` lands in `entry`.
    ///
    /// `page_table_root` is the direct-map address of its L4 (0 = keep the
    /// switching CPU's); `tss` is the owning CPU's TSS; `cwd` seeds the
    /// filesystem context.
    pub fn new(tid: u32, entry: u64, page_table_root: u64, tss: *mut TaskStateSegment, cwd: DentryId) -> Self {
        let mut kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        // The backing store has no alignment guarantee; the usable stack
        // ends at the last 16-byte boundary inside it.
        let base = kernel_stack.as_ptr() as usize;
        let usable = ((base + KERNEL_STACK_SIZE) & !15) - base;
        let frame_offset = build_initial_frame(&mut kernel_stack[..usable], entry);
        let kernel_stack_ptr = kernel_stack.as_ptr() as u64 + frame_offset as u64;
        Self {
            kernel_stack_ptr,
            mm: ThreadMm { page_table_root },
            arch: ArchContext { tss },
            tid,
            kernel_stack,
            fs: SpinLock::new(FsContext {
                cwd,
                fds: FileDescriptorTable::new(),
            }),
        }
    }

    /// Top of this thread's kernel stack (the RSP0 value for ring-3
    /// entries), 16-byte aligned.
    pub fn kernel_stack_top(&self) -> u64 {
        (self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64) & !15
    }
}

/// Builds an orphan thread's initial stack image and returns the byte
/// offset of the crafted frame (the initial `kernel_stack_ptr`).
///
/// Layout, top down: a zero-filled [`CpuContext`], then a [`SwitchFrame`]
/// whose `rip` is the entry point. When the thread is first scheduled, the
/// six pops and the `ret` land at `entry` with RSP pointing at the zeroed
/// context.
pub fn build_initial_frame(stack: &mut [u8], entry: u64) -> usize {
    let ctx_size = core::mem::size_of::<CpuContext>();
    let frame_size = core::mem::size_of::<SwitchFrame>();
    assert!(stack.len() >= ctx_size + frame_size);

    let ctx_offset = stack.len() - ctx_size;
    stack[ctx_offset..].fill(0);

    let frame = SwitchFrame {
        rip: entry,
        ..SwitchFrame::default()
    };
    let frame_offset = ctx_offset - frame_size;
    // SAFETY: SwitchFrame is plain-old-data; the range is in bounds.
    let bytes = unsafe {
        core::slice::from_raw_parts(&frame as *const SwitchFrame as *const u8, frame_size)
    };
    stack[frame_offset..ctx_offset].copy_from_slice(bytes);
    frame_offset
}

// ---------------------------------------------------------------------------
// Current-thread tracking
// ---------------------------------------------------------------------------

/// Per-CPU current thread.
static CURRENT_THREAD: CpuLocal<SpinLock<Option<Arc<Thread>>>> =
    CpuLocal::new([const { SpinLock::new(None) }; MAX_CPUS]);

/// Installs the current CPU's thread.
pub fn set_current(thread: Arc<Thread>) {
    *CURRENT_THREAD.get().lock() = Some(thread);
}

/// Runs `f` against the current thread.
///
/// # Panics
///
/// Panics if no thread is installed (nothing can be syscalling yet).
pub fn with_current<R>(f: impl FnOnce(&Arc<Thread>) -> R) -> R {
    let guard = CURRENT_THREAD.get().lock();
    f(guard.as_ref().expect("no current thread"))
}

// ---------------------------------------------------------------------------
// The switch itself
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod switch {
    use super::Thread;

    /// Cooperative context switch.
    ///
    /// Pushes RBP, RBX, R12..R15, parks RSP in `prev.kernel_stack_ptr`,
    /// adopts `next.kernel_stack_ptr`, pops the six registers, and jumps
    /// (not calls) into [`switch_to_internal`]; its `ret` consumes the
    /// return address on `next`'s stack.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live [`Thread`]s; must be called with
    /// interrupts disabled; `next`'s stack must hold either a crafted
    /// initial frame or a frame saved by a previous `switch_to`.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_to(prev: *mut Thread, next: *mut Thread) {
        core::arch::naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "mov rsp, [rsi]",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "jmp {internal}",
            internal = sym switch_to_internal,
        );
    }

    /// First entry into a thread: nothing to save, `prev` is `next`.
    ///
    /// # Safety
    ///
    /// Same contract as [`switch_to`]; does not return to the caller.
    #[unsafe(naked)]
    pub unsafe extern "C" fn initial_switch_to(next: *mut Thread) {
        core::arch::naked_asm!(
            "mov rsi, rdi",
            "mov rsp, [rsi]",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "jmp {internal}",
            internal = sym switch_to_internal,
        );
    }

    /// Tail of every switch: refresh the TSS RSP0 (the thread's TSS
    /// pointer is the per-CPU TSS, so one store updates both views) and
    /// the address space, then `ret` into `next`'s saved RIP.
    extern "C" fn switch_to_internal(_prev: *mut Thread, next: *mut Thread) {
        use norn_core::arch::x86_64::registers;

        // SAFETY: `next` is live (switch_to contract) and interrupts are
        // disabled across the whole tail.
        unsafe {
            let next = &*next;
            if !next.arch.tss.is_null() {
                (*next.arch.tss).privilege_stack_table[0] = next.kernel_stack_top();
            }
            if next.mm.page_table_root != 0 {
                let root = crate::mm::virt_to_phys(norn_core::addr::VirtAddr::new(
                    next.mm.page_table_root,
                ));
                let cr3 = if norn_core::arch::x86_64::cpuid::has_pcid() {
                    registers::cr3_value(root, crate::arch::x86_64::paging::KERNEL_PCID)
                } else {
                    root.as_u64()
                };
                registers::write_cr3(cr3);
            }
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use switch::{initial_switch_to, switch_to};

// ---------------------------------------------------------------------------
// Init task
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod init {
    use super::*;
    use norn_core::arch::x86_64::structures::gdt::selector;
    use norn_core::{kerr, kinfo};
    use norn_fs::InodeType;

    use crate::arch::x86_64::paging::{self, Attribute};
    use crate::syscall;

    /// Where the flat init image is mapped.
    const USER_CODE_BASE: u64 = 0x40_0000;
    /// Top of the init stack mapping.
    const USER_STACK_TOP: u64 = 0x7FFF_FFF0_0000;
    /// Init stack size.
    const USER_STACK_SIZE: u64 = 16 * 4096;

    /// Path storage handed from `spawn_init` to the entry trampoline (the
    /// crafted frame carries no arguments).
    static INIT_PATH: SpinLock<Option<alloc::string::String>> = SpinLock::new(None);

    /// Creates the init task and switches into it. Returns when init
    /// exits.
    pub fn spawn_init(path: &crate::config::InitPath) {
        *INIT_PATH.lock() = Some(alloc::string::String::from(path.as_str()));

        let root_dentry = syscall::root_dentry();
        let tss = crate::percpu::current_cpu().tss as *mut TaskStateSegment;
        let thread = Arc::new(Thread::new(
            1,
            init_task_entry as usize as u64,
            paging::create_root().as_u64(),
            tss,
            root_dentry,
        ));
        syscall::install_stdio(&thread);
        set_current(thread.clone());

        kinfo!("task: entering init ({})", path.as_str());
        let ptr = Arc::as_ptr(&thread) as *mut Thread;
        // SAFETY: The thread is fully built with a crafted frame; IRQs are
        // still masked on the boot path.
        unsafe { initial_switch_to(ptr) };
    }

    /// Kernel-side entry of the init task, reached through the crafted
    /// frame's `ret`. Loads the flat init image from the VFS and drops to
    /// ring 3.
    extern "C" fn init_task_entry() -> ! {
        let path = INIT_PATH.lock().take().unwrap_or_default();
        match load_and_enter(&path) {
            Ok(never) => match never {},
            Err(e) => {
                kerr!("task: init load failed: {}", e);
                crate::halt_forever()
            }
        }
    }

    fn load_and_enter(path: &str) -> Result<core::convert::Infallible, norn_fs::FsError> {
        use norn_fs::FsError;

        let inode = syscall::resolve_for_kernel(path)?;
        if inode.inode_type() != InodeType::File {
            return Err(FsError::IsDirectory);
        }
        let size = inode.size();
        if size == 0 {
            return Err(FsError::InvalidArgument);
        }

        let root = super::with_current(|t| t.mm.page_table_root);
        let root = norn_core::addr::VirtAddr::new(root);
        let code_pages = size.div_ceil(norn_mm::PAGE_SIZE) as u64;

        // Map and fill the code pages.
        for page in 0..code_pages {
            let frame = crate::mm::alloc_pages(1, norn_mm::Zone::Normal)
                .map_err(|_| FsError::OutOfMemory)?;
            let dst = crate::mm::phys_to_virt(frame).as_mut_ptr::<u8>();
            // SAFETY: Fresh frame behind the direct map.
            let dst = unsafe { core::slice::from_raw_parts_mut(dst, norn_mm::PAGE_SIZE) };
            dst.fill(0);
            let offset = (page as usize) * norn_mm::PAGE_SIZE;
            let len = norn_mm::PAGE_SIZE.min(size - offset);
            inode.read(offset, &mut dst[..len])?;
            // SAFETY: The user range is unused in this fresh address space.
            unsafe {
                paging::map(
                    root,
                    USER_CODE_BASE + page * norn_mm::PAGE_SIZE as u64,
                    frame.as_u64(),
                    norn_mm::PAGE_SIZE as u64,
                    Attribute::Executable,
                    true,
                )
            }
            .map_err(|_| FsError::InvalidArgument)?;
        }

        // Map the stack.
        for page in 0..USER_STACK_SIZE / norn_mm::PAGE_SIZE as u64 {
            let frame = crate::mm::alloc_pages(1, norn_mm::Zone::Normal)
                .map_err(|_| FsError::OutOfMemory)?;
            // SAFETY: Same as above.
            unsafe {
                paging::map(
                    root,
                    USER_STACK_TOP - USER_STACK_SIZE + page * norn_mm::PAGE_SIZE as u64,
                    frame.as_u64(),
                    norn_mm::PAGE_SIZE as u64,
                    Attribute::ReadWrite,
                    true,
                )
            }
            .map_err(|_| FsError::InvalidArgument)?;
        }

        kinfo!("task: init mapped ({} code pages)", code_pages);
        // SAFETY: Entry and stack were just mapped user-accessible in the
        // current address space.
        unsafe { enter_user(USER_CODE_BASE, USER_STACK_TOP - 16) }
    }

    /// Drops to ring 3 via `iretq`.
    ///
    /// # Safety
    ///
    /// `entry` and `stack` must be mapped user-accessible in the current
    /// address space.
    unsafe fn enter_user(entry: u64, stack: u64) -> ! {
        // SAFETY: Caller contract; the frame uses the fixed user selectors
        // and an RFLAGS with IF set (ring 3 runs with interrupts on).
        unsafe {
            core::arch::asm!(
                "push {ss}",
                "push {stack}",
                "push {rflags}",
                "push {cs}",
                "push {entry}",
                "swapgs",
                "iretq",
                ss = const selector::USER_DS.as_u16() as u64,
                cs = const selector::USER_CS.as_u16() as u64,
                rflags = const 0x202u64,
                stack = in(reg) stack,
                entry = in(reg) entry,
                options(noreturn),
            );
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use init::spawn_init;

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn asm_visible_offsets() {
        assert_eq!(offset_of!(Thread, kernel_stack_ptr), 0);
        assert_eq!(offset_of!(Thread, mm), 8);
        assert_eq!(offset_of!(Thread, arch), 16);
    }

    #[test]
    fn initial_frame_layout() {
        let mut stack = vec![0xAAu8; 4096];
        let entry = 0xFFFF_FFFF_8123_4560u64;
        let frame_offset = build_initial_frame(&mut stack, entry);

        let ctx_size = core::mem::size_of::<CpuContext>();
        let frame_size = core::mem::size_of::<SwitchFrame>();
        assert_eq!(frame_offset, 4096 - ctx_size - frame_size);

        // The context region is fully zeroed.
        assert!(stack[4096 - ctx_size..].iter().all(|&b| b == 0));

        // The six callee-saved slots are zero; rip is the entry.
        let frame_bytes = &stack[frame_offset..frame_offset + frame_size];
        assert!(frame_bytes[..6 * 8].iter().all(|&b| b == 0));
        assert_eq!(
            u64::from_le_bytes(frame_bytes[6 * 8..].try_into().unwrap()),
            entry
        );
    }

    #[test]
    fn thread_points_at_its_frame() {
        let thread = Thread::new(7, 0x1234, 0, core::ptr::null_mut(), 0);
        let base = thread.kernel_stack.as_ptr() as usize;
        let usable = ((base + KERNEL_STACK_SIZE) & !15) - base;
        let expected = base + usable
            - core::mem::size_of::<CpuContext>()
            - core::mem::size_of::<SwitchFrame>();
        assert_eq!(thread.kernel_stack_ptr, expected as u64);
        // The crafted frame and the stack top are both 16-byte aligned.
        assert_eq!(thread.kernel_stack_top() % 16, 0);
        assert_eq!(thread.kernel_stack_ptr % 8, 0);
        assert_eq!(thread.tid, 7);
    }

    // Current-thread installation is exercised end-to-end by the syscall
    // scenario test; a dedicated test here would race it for the shared
    // CPU-0 slot.
}
