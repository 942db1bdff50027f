//! Per-CPU state.
//!
//! Each CPU's `GS` base points at its own [`PerCpu`] instance; `GS:[0]`
//! holds a self-pointer so `current_cpu()` needs no global lookup. The
//! first three fields are read from naked assembly (syscall entry), so
//! the struct is `#[repr(C)]` with pinned offsets.

use core::sync::atomic::{AtomicU32, Ordering};

/// Maximum supported CPUs.
pub const MAX_CPUS: usize = 32;

/// Per-CPU data.
///
/// Assembly-visible offsets:
/// - `GS:[0]`  : `self_ptr`
/// - `GS:[8]`  : `kernel_rsp` (stack the syscall entry switches to)
/// - `GS:[16]` : `user_rsp` (caller RSP stash during a syscall)
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer for the `GS:[0]` access pattern.
    pub self_ptr: u64,
    /// Kernel stack top loaded by the syscall entry.
    pub kernel_rsp: u64,
    /// User RSP saved by the syscall entry.
    pub user_rsp: u64,
    /// Logical CPU id (0 = BSP).
    pub cpu_id: u32,
    /// Local APIC id.
    pub lapic_id: u32,
    /// This CPU's TSS (inside its GDT page).
    pub tss: u64,
}

impl PerCpu {
    /// Creates an empty instance.
    pub const fn new() -> Self {
        Self {
            self_ptr: 0,
            kernel_rsp: 0,
            user_rsp: 0,
            cpu_id: 0,
            lapic_id: 0,
            tss: 0,
        }
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of CPUs online.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Returns the number of online CPUs.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Records a newly online CPU.
pub fn add_online_cpu() {
    CPU_COUNT.fetch_add(1, Ordering::Release);
}

/// CPU-local storage: one `T` per possible CPU, indexed by the running
/// CPU's id.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Wraps a per-CPU array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns the current CPU's instance.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn get(&self) -> &T {
        &self.data[current_cpu().cpu_id as usize]
    }

    /// Host fallback: always CPU 0's instance.
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    pub fn get(&self) -> &T {
        &self.data[0]
    }

    /// Returns a specific CPU's instance.
    pub fn get_for(&self, cpu_id: u32) -> &T {
        &self.data[cpu_id as usize]
    }
}

// SAFETY: Each CPU only touches its own slot.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod runtime {
    use super::PerCpu;
    use norn_core::arch::x86_64::registers::{msr, write_msr};

    /// Early syscall stack size (before tasks carry their own RSP0).
    const SYSCALL_STACK_SIZE: usize = 16384;

    #[repr(align(16))]
    struct AlignedStack([u8; SYSCALL_STACK_SIZE]);

    /// BSP syscall entry stack.
    ///
    /// TODO: switch the entry path to the running task's RSP0 instead of
    /// this shared per-CPU stack.
    static mut BSP_SYSCALL_STACK: AlignedStack = AlignedStack([0; SYSCALL_STACK_SIZE]);

    /// BSP per-CPU data; AP instances are heap-allocated and leaked.
    static mut BSP_PERCPU: PerCpu = PerCpu::new();

    /// Returns the current CPU's [`PerCpu`] via the `GS:[0]` self-pointer.
    pub fn current_cpu() -> &'static PerCpu {
        let ptr: u64;
        // SAFETY: GS:[0] was set to the self-pointer during CPU init.
        unsafe {
            core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
            &*(ptr as *const PerCpu)
        }
    }

    /// Initializes the BSP's GS bases, self-pointer, and syscall stack.
    ///
    /// # Safety
    ///
    /// Must run once on the BSP, after the GDT is loaded and before any
    /// syscall or `CpuLocal` access. `tss` must be the BSP's TSS.
    pub unsafe fn init_bsp(tss: u64) {
        // SAFETY: BSP statics; single-threaded boot path.
        unsafe {
            let percpu = core::ptr::addr_of_mut!(BSP_PERCPU);
            (*percpu).self_ptr = percpu as u64;
            (*percpu).kernel_rsp =
                core::ptr::addr_of!(BSP_SYSCALL_STACK) as u64 + SYSCALL_STACK_SIZE as u64;
            (*percpu).cpu_id = 0;
            (*percpu).lapic_id = norn_core::arch::x86_64::cpuid::lapic_id() as u32;
            (*percpu).tss = tss;
            write_msr(msr::IA32_GS_BASE, percpu as u64);
            write_msr(msr::IA32_KERNEL_GS_BASE, percpu as u64);
        }
    }

    /// Installs a heap-allocated [`PerCpu`] on the executing AP.
    ///
    /// # Safety
    ///
    /// `percpu` must point to a leaked, fully initialized instance with
    /// `self_ptr` already set; must run on the AP it describes.
    pub unsafe fn install(percpu: *mut PerCpu) {
        // SAFETY: Caller contract.
        unsafe {
            write_msr(msr::IA32_GS_BASE, percpu as u64);
            write_msr(msr::IA32_KERNEL_GS_BASE, percpu as u64);
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use runtime::{current_cpu, init_bsp, install};
