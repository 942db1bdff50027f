//! AP boot trampoline.
//!
//! The 16-bit blob each AP executes after SIPI: real mode -> protected
//! mode -> long mode -> `ap_entry64`. The blob is assembled with sentinel
//! values at every address that depends on runtime state; the BSP copies
//! it to a SIPI-addressable page and rewrites the sentinels byte-by-byte
//! (the patch points sit in packed code, so wide stores could fault).
//!
//! The embedded temporary GDT uses the same selector layout as the kernel
//! GDT (0x08 = 32-bit code, 0x10 = 64-bit code, 0x18 = data), so the far
//! jumps and segment loads read the same in both worlds.

/// Sentinel for the protected-mode far-jump target.
pub const SENTINEL_PM_ENTRY: u32 = 0xDEAD_0001;
/// Sentinel for the 32-bit stack pointer.
pub const SENTINEL_STACK_TOP: u32 = 0xDEAD_0002;
/// Sentinel for the long-mode far-jump target.
pub const SENTINEL_LM_ENTRY: u32 = 0xDEAD_0003;
/// Sentinel for CR3 (kernel root, PCID bits cleared).
pub const SENTINEL_CR3: u32 = 0xDEAD_0004;
/// Sentinel for the 64-bit kernel entry address.
pub const SENTINEL_ENTRY64: u64 = 0xDEAD_BEEF_0000_0005;
/// Sentinel for GDTR.base (physical address of the embedded GDT).
pub const SENTINEL_GDT_BASE: u32 = 0xDEAD_0006;

/// Trampoline patching errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// The sentinel was not found in the blob.
    MissingSentinel,
}

/// Locates `sentinel` in `blob` and overwrites it with `value`,
/// byte-granular.
pub fn patch_u32(blob: &mut [u8], sentinel: u32, value: u32) -> Result<(), PatchError> {
    let needle = sentinel.to_le_bytes();
    let at = blob
        .windows(4)
        .position(|w| w == needle)
        .ok_or(PatchError::MissingSentinel)?;
    for (i, byte) in value.to_le_bytes().iter().enumerate() {
        blob[at + i] = *byte;
    }
    Ok(())
}

/// Locates a 64-bit `sentinel` in `blob` and overwrites it with `value`.
pub fn patch_u64(blob: &mut [u8], sentinel: u64, value: u64) -> Result<(), PatchError> {
    let needle = sentinel.to_le_bytes();
    let at = blob
        .windows(8)
        .position(|w| w == needle)
        .ok_or(PatchError::MissingSentinel)?;
    for (i, byte) in value.to_le_bytes().iter().enumerate() {
        blob[at + i] = *byte;
    }
    Ok(())
}

/// Everything the BSP must rewrite before issuing a SIPI.
#[derive(Debug, Clone, Copy)]
pub struct Relocations {
    /// Physical address of the 32-bit entry inside the copied blob.
    pub pm_entry: u32,
    /// Temporary stack top for the 32-bit code (top minus 16).
    pub stack_top: u32,
    /// Physical address of the 64-bit entry inside the copied blob.
    pub lm_entry: u32,
    /// CR3 value (kernel root with the PCID bits cleared).
    pub cr3: u32,
    /// Absolute address of the kernel's long-mode entry function.
    pub entry64: u64,
    /// Physical address of the embedded temporary GDT.
    pub gdt_base: u32,
}

/// Applies all six patches to a copied trampoline blob.
pub fn patch_all(blob: &mut [u8], relocs: Relocations) -> Result<(), PatchError> {
    patch_u32(blob, SENTINEL_PM_ENTRY, relocs.pm_entry)?;
    patch_u32(blob, SENTINEL_STACK_TOP, relocs.stack_top)?;
    patch_u32(blob, SENTINEL_LM_ENTRY, relocs.lm_entry)?;
    patch_u32(blob, SENTINEL_CR3, relocs.cr3)?;
    patch_u64(blob, SENTINEL_ENTRY64, relocs.entry64)?;
    patch_u32(blob, SENTINEL_GDT_BASE, relocs.gdt_base)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// The blob itself
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    r#"
.section .ap_trampoline, "ax"
.balign 4096
.global ap_tramp_start
.global ap_tramp_pm_entry
.global ap_tramp_lm_entry
.global ap_tramp_gdt
.global ap_tramp_end

.code16
ap_tramp_start:
    cli
    cld
    // The GDTR contents are patched; the operand address is CS-relative
    // (SIPI loads CS with the page's segment, IP 0).
    lgdtl cs:[ap_tramp_gdtr - ap_tramp_start]

    // Protected mode on.
    mov eax, cr0
    or eax, 1
    mov cr0, eax

    // Far jump (ptr16:32) to the 32-bit entry; target patched.
    .byte 0x66, 0xEA
    .long 0xDEAD0001
    .word 0x08

.code32
ap_tramp_pm_entry:
    mov ax, 0x18
    mov ds, ax
    mov es, ax
    mov ss, ax
    // Temporary stack; patched to the shared AP boot stack top - 16.
    mov esp, 0xDEAD0002

    // PAE on.
    mov eax, cr4
    or eax, (1 << 5)
    mov cr4, eax

    // Kernel root (PCID bits cleared); patched.
    mov eax, 0xDEAD0004
    mov cr3, eax

    // Long mode enable.
    mov ecx, 0xC0000080
    rdmsr
    or eax, (1 << 8)
    wrmsr

    // Paging + protection on: the next fetch is translated, which works
    // because the BSP identity-mapped this page.
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax

    // Far jump (ptr16:32) to the 64-bit entry; target patched.
    .byte 0xEA
    .long 0xDEAD0003
    .word 0x10

.code64
ap_tramp_lm_entry:
    mov ax, 0x18
    mov ds, ax
    mov es, ax
    mov ss, ax
    xor eax, eax
    mov fs, ax
    mov gs, ax

    // Absolute jump into the kernel; patched.
    movabs rax, 0xDEADBEEF00000005
    jmp rax

.balign 8
ap_tramp_gdtr:
    .word ap_tramp_gdt_end - ap_tramp_gdt - 1
    .long 0xDEAD0006

ap_tramp_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF    // 0x08: 32-bit code
    .quad 0x00AF9A000000FFFF    // 0x10: 64-bit code
    .quad 0x00CF92000000FFFF    // 0x18: data
ap_tramp_gdt_end:

ap_tramp_end:
"#
);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[allow(non_upper_case_globals)]
unsafe extern "C" {
    /// First byte of the trampoline blob.
    pub static ap_tramp_start: u8;
    /// 32-bit entry label.
    pub static ap_tramp_pm_entry: u8;
    /// 64-bit entry label.
    pub static ap_tramp_lm_entry: u8;
    /// Embedded temporary GDT.
    pub static ap_tramp_gdt: u8;
    /// One past the last byte of the blob.
    pub static ap_tramp_end: u8;
}

/// Byte offset of a trampoline label from the blob start.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn label_offset(label: &'static u8) -> usize {
    // SAFETY: Both symbols live in the same object; the subtraction is a
    // link-time constant.
    unsafe {
        (label as *const u8 as usize) - (core::ptr::addr_of!(ap_tramp_start) as usize)
    }
}

/// The trampoline blob as a byte slice (for copying to low memory).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn blob() -> &'static [u8] {
    // SAFETY: start/end delimit the assembled blob.
    unsafe {
        let start = core::ptr::addr_of!(ap_tramp_start);
        let end = core::ptr::addr_of!(ap_tramp_end);
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}
