//! GDT and TSS setup.
//!
//! The BSP uses statically allocated tables and interrupt stacks; each AP
//! gets its own GDT page, TSS, and stacks from the heap during bring-up.
//! All CPUs share the fixed segment layout from `norn-core` (the SYSCALL
//! MSRs depend on it). RSP0 and IST1..IST3 point at dedicated 8 KiB
//! per-CPU stacks.
//!
//! TODO: back each per-CPU stack with a guard page once the VMM grows
//! dedicated stack mappings.

use alloc::boxed::Box;

use norn_core::arch::x86_64::structures::gdt::{
    GlobalDescriptorTable, TaskStateSegment, selector,
};

/// Size of each per-CPU interrupt/kernel stack.
pub const CPU_STACK_SIZE: usize = 8192;

/// IST slot used for #DF and #PF (1-indexed, as the IDT encodes it).
pub const FAULT_IST_INDEX: u8 = 1;

/// A 16-byte-aligned stack backing store.
#[repr(align(16))]
struct AlignedStack([u8; CPU_STACK_SIZE]);

impl AlignedStack {
    const fn new() -> Self {
        Self([0; CPU_STACK_SIZE])
    }

    fn top(&self) -> u64 {
        self.0.as_ptr() as u64 + CPU_STACK_SIZE as u64
    }
}

/// One CPU's descriptor page: GDT plus its private TSS.
#[repr(C, align(4096))]
struct CpuDescriptors {
    gdt: GlobalDescriptorTable,
    tss: TaskStateSegment,
}

/// BSP descriptor page (static; APs allocate theirs).
static mut BSP_DESCRIPTORS: CpuDescriptors = CpuDescriptors {
    gdt: GlobalDescriptorTable::new(),
    tss: TaskStateSegment::new(),
};

/// BSP ring-0 entry stack (TSS.RSP0 until the first task installs its own).
static BSP_RSP0_STACK: AlignedStack = AlignedStack::new();
/// BSP IST1 stack (#DF / #PF).
static BSP_IST1_STACK: AlignedStack = AlignedStack::new();
/// BSP IST2 stack.
static BSP_IST2_STACK: AlignedStack = AlignedStack::new();
/// BSP IST3 stack.
static BSP_IST3_STACK: AlignedStack = AlignedStack::new();

/// Wires a TSS to its stacks.
fn fill_tss(tss: &mut TaskStateSegment, rsp0: u64, ist1: u64, ist2: u64, ist3: u64) {
    tss.privilege_stack_table[0] = rsp0;
    tss.interrupt_stack_table[0] = ist1;
    tss.interrupt_stack_table[1] = ist2;
    tss.interrupt_stack_table[2] = ist3;
}

/// Loads `descriptors` on the executing CPU: `lgdt`, segment reload, `ltr`.
///
/// # Safety
///
/// `descriptors` must outlive the CPU's use of it, with the TSS slots
/// already populated.
unsafe fn load(descriptors: &'static CpuDescriptors) {
    // SAFETY: The GDT is fully built and 'static.
    unsafe {
        descriptors.gdt.load();

        // Reload CS with a far return, then the data segments.
        core::arch::asm!(
            "push {cs}",
            "lea {tmp}, [rip + 55f]",
            "push {tmp}",
            "retfq",
            "55:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov ss, {ds:x}",
            "xor eax, eax",
            "mov fs, ax",
            "mov gs, ax",
            cs = const selector::KERNEL_CS.as_u16() as u64,
            ds = in(reg) selector::KERNEL_DS.as_u16(),
            tmp = lateout(reg) _,
            out("rax") _,
        );

        // Load the task register.
        core::arch::asm!(
            "ltr {0:x}",
            in(reg) selector::KERNEL_TSS.as_u16(),
            options(nostack, preserves_flags),
        );
    }
}

/// Initializes the BSP's GDT and TSS and returns the TSS address (stored
/// into percpu for context switching).
///
/// # Safety
///
/// Must be called exactly once, on the BSP, before interrupts are enabled.
pub unsafe fn init_bsp() -> *mut TaskStateSegment {
    // SAFETY: Single-threaded boot path; BSP_DESCRIPTORS is only touched here.
    unsafe {
        let descriptors = core::ptr::addr_of_mut!(BSP_DESCRIPTORS);
        fill_tss(
            &mut (*descriptors).tss,
            BSP_RSP0_STACK.top(),
            BSP_IST1_STACK.top(),
            BSP_IST2_STACK.top(),
            BSP_IST3_STACK.top(),
        );
        let tss_addr = core::ptr::addr_of_mut!((*descriptors).tss);
        (*descriptors).gdt.set_tss(tss_addr as u64);
        load(&*descriptors);
        norn_core::kdebug!("gdt: BSP descriptors loaded");
        tss_addr
    }
}

/// Builds and loads a fresh GDT/TSS page for the executing AP, returning
/// the TSS address. The page and stacks are leaked: they live as long as
/// the CPU.
///
/// # Safety
///
/// Must be called exactly once per AP, on that AP, with the heap online.
pub unsafe fn init_ap() -> *mut TaskStateSegment {
    let rsp0 = Box::leak(Box::new(AlignedStack::new())).top();
    let ist1 = Box::leak(Box::new(AlignedStack::new())).top();
    let ist2 = Box::leak(Box::new(AlignedStack::new())).top();
    let ist3 = Box::leak(Box::new(AlignedStack::new())).top();

    let descriptors: &'static mut CpuDescriptors = Box::leak(Box::new(CpuDescriptors {
        gdt: GlobalDescriptorTable::new(),
        tss: TaskStateSegment::new(),
    }));
    fill_tss(&mut descriptors.tss, rsp0, ist1, ist2, ist3);
    let tss_addr = core::ptr::addr_of_mut!(descriptors.tss);
    descriptors.gdt.set_tss(tss_addr as u64);

    // SAFETY: The page is leaked ('static) and fully initialized.
    unsafe { load(descriptors) };
    tss_addr
}
