//! Vector-parameterized ISR stubs.
//!
//! Each of the 256 vectors gets a tiny naked stub that normalizes the
//! stack into a [`CpuContext`]: a dummy zero where hardware pushed no
//! error code, then the vector number, then a jump to the shared tail.
//! The tail saves the 15 general-purpose registers and XMM0..7, hands the
//! frame to `isr_dispatch`, and unwinds with `iretq`.
//!
//! The stubs run with interrupts masked until `iretq` restores the
//! caller's flags; registered handlers must not re-enable them.
//!
//! [`CpuContext`]: norn_core::arch::x86_64::structures::context::CpuContext

/// An ISR stub entry point.
pub type IsrStub = unsafe extern "C" fn();

/// Shared stub tail.
///
/// On entry the stack holds, top-down: vector, error code, then the
/// hardware frame. Pushing R15..RDI completes the `CpuContext` with RDI at
/// the stack pointer. The original RSP is parked in RBX (itself already
/// saved in the frame) across the aligned call; XMM0..7 are preserved
/// around the dispatcher as a conservative stance.
///
/// TODO: stop saving XMM state here once the kernel is built without SSE
/// codegen.
#[unsafe(naked)]
unsafe extern "C" fn isr_common() {
    core::arch::naked_asm!(
        // Complete the CpuContext: 15 GPRs, RDI lands lowest.
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rbx",
        "push rax",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",

        // Frame pointer for the dispatcher.
        "mov rdi, rsp",

        // Park RSP, align to 16, and save XMM0..7 below the frame.
        "mov rbx, rsp",
        "sub rsp, 136",
        "and rsp, -16",
        "movdqu [rsp + 0], xmm0",
        "movdqu [rsp + 16], xmm1",
        "movdqu [rsp + 32], xmm2",
        "movdqu [rsp + 48], xmm3",
        "movdqu [rsp + 64], xmm4",
        "movdqu [rsp + 80], xmm5",
        "movdqu [rsp + 96], xmm6",
        "movdqu [rsp + 112], xmm7",

        "call {dispatch}",

        "movdqu xmm0, [rsp + 0]",
        "movdqu xmm1, [rsp + 16]",
        "movdqu xmm2, [rsp + 32]",
        "movdqu xmm3, [rsp + 48]",
        "movdqu xmm4, [rsp + 64]",
        "movdqu xmm5, [rsp + 80]",
        "movdqu xmm6, [rsp + 96]",
        "movdqu xmm7, [rsp + 112]",
        "mov rsp, rbx",

        // Unwind the GPRs, discard the two spec words, return.
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "pop rbx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "add rsp, 16",
        "iretq",

        dispatch = sym super::isr_dispatch,
    );
}

/// Stub for a vector whose hardware pushes no error code: supply the
/// dummy zero itself.
macro_rules! isr_stub {
    ($vector:expr) => {{
        #[unsafe(naked)]
        unsafe extern "C" fn stub() {
            core::arch::naked_asm!(
                "cli",
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            );
        }
        stub as IsrStub
    }};
}

/// Stub for an exception whose hardware already pushed an error code.
macro_rules! isr_stub_err {
    ($vector:expr) => {{
        #[unsafe(naked)]
        unsafe extern "C" fn stub() {
            core::arch::naked_asm!(
                "cli",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            );
        }
        stub as IsrStub
    }};
}

/// All 256 stub entry points, indexed by vector.
///
/// Vectors 8, 10-14, and 17 use the error-code variant; everything else
/// pushes the dummy zero.
pub static STUBS: [IsrStub; 256] = [
    // Vectors 0-15 (CPU exceptions)
    isr_stub!(0),
    isr_stub!(1),
    isr_stub!(2),
    isr_stub!(3),
    isr_stub!(4),
    isr_stub!(5),
    isr_stub!(6),
    isr_stub!(7),
    isr_stub_err!(8),
    isr_stub!(9),
    isr_stub_err!(10),
    isr_stub_err!(11),
    isr_stub_err!(12),
    isr_stub_err!(13),
    isr_stub_err!(14),
    isr_stub!(15),
    // Vectors 16-31 (CPU exceptions)
    isr_stub!(16),
    isr_stub_err!(17),
    isr_stub!(18),
    isr_stub!(19),
    isr_stub!(20),
    isr_stub!(21),
    isr_stub!(22),
    isr_stub!(23),
    isr_stub!(24),
    isr_stub!(25),
    isr_stub!(26),
    isr_stub!(27),
    isr_stub!(28),
    isr_stub!(29),
    isr_stub!(30),
    isr_stub!(31),
    // Vectors 32-47 (ISA IRQs)
    isr_stub!(32),
    isr_stub!(33),
    isr_stub!(34),
    isr_stub!(35),
    isr_stub!(36),
    isr_stub!(37),
    isr_stub!(38),
    isr_stub!(39),
    isr_stub!(40),
    isr_stub!(41),
    isr_stub!(42),
    isr_stub!(43),
    isr_stub!(44),
    isr_stub!(45),
    isr_stub!(46),
    isr_stub!(47),
    // Vectors 48-63
    isr_stub!(48),
    isr_stub!(49),
    isr_stub!(50),
    isr_stub!(51),
    isr_stub!(52),
    isr_stub!(53),
    isr_stub!(54),
    isr_stub!(55),
    isr_stub!(56),
    isr_stub!(57),
    isr_stub!(58),
    isr_stub!(59),
    isr_stub!(60),
    isr_stub!(61),
    isr_stub!(62),
    isr_stub!(63),
    // Vectors 64-79
    isr_stub!(64),
    isr_stub!(65),
    isr_stub!(66),
    isr_stub!(67),
    isr_stub!(68),
    isr_stub!(69),
    isr_stub!(70),
    isr_stub!(71),
    isr_stub!(72),
    isr_stub!(73),
    isr_stub!(74),
    isr_stub!(75),
    isr_stub!(76),
    isr_stub!(77),
    isr_stub!(78),
    isr_stub!(79),
    // Vectors 80-95
    isr_stub!(80),
    isr_stub!(81),
    isr_stub!(82),
    isr_stub!(83),
    isr_stub!(84),
    isr_stub!(85),
    isr_stub!(86),
    isr_stub!(87),
    isr_stub!(88),
    isr_stub!(89),
    isr_stub!(90),
    isr_stub!(91),
    isr_stub!(92),
    isr_stub!(93),
    isr_stub!(94),
    isr_stub!(95),
    // Vectors 96-111
    isr_stub!(96),
    isr_stub!(97),
    isr_stub!(98),
    isr_stub!(99),
    isr_stub!(100),
    isr_stub!(101),
    isr_stub!(102),
    isr_stub!(103),
    isr_stub!(104),
    isr_stub!(105),
    isr_stub!(106),
    isr_stub!(107),
    isr_stub!(108),
    isr_stub!(109),
    isr_stub!(110),
    isr_stub!(111),
    // Vectors 112-127
    isr_stub!(112),
    isr_stub!(113),
    isr_stub!(114),
    isr_stub!(115),
    isr_stub!(116),
    isr_stub!(117),
    isr_stub!(118),
    isr_stub!(119),
    isr_stub!(120),
    isr_stub!(121),
    isr_stub!(122),
    isr_stub!(123),
    isr_stub!(124),
    isr_stub!(125),
    isr_stub!(126),
    isr_stub!(127),
    // Vectors 128-143
    isr_stub!(128),
    isr_stub!(129),
    isr_stub!(130),
    isr_stub!(131),
    isr_stub!(132),
    isr_stub!(133),
    isr_stub!(134),
    isr_stub!(135),
    isr_stub!(136),
    isr_stub!(137),
    isr_stub!(138),
    isr_stub!(139),
    isr_stub!(140),
    isr_stub!(141),
    isr_stub!(142),
    isr_stub!(143),
    // Vectors 144-159
    isr_stub!(144),
    isr_stub!(145),
    isr_stub!(146),
    isr_stub!(147),
    isr_stub!(148),
    isr_stub!(149),
    isr_stub!(150),
    isr_stub!(151),
    isr_stub!(152),
    isr_stub!(153),
    isr_stub!(154),
    isr_stub!(155),
    isr_stub!(156),
    isr_stub!(157),
    isr_stub!(158),
    isr_stub!(159),
    // Vectors 160-175
    isr_stub!(160),
    isr_stub!(161),
    isr_stub!(162),
    isr_stub!(163),
    isr_stub!(164),
    isr_stub!(165),
    isr_stub!(166),
    isr_stub!(167),
    isr_stub!(168),
    isr_stub!(169),
    isr_stub!(170),
    isr_stub!(171),
    isr_stub!(172),
    isr_stub!(173),
    isr_stub!(174),
    isr_stub!(175),
    // Vectors 176-191
    isr_stub!(176),
    isr_stub!(177),
    isr_stub!(178),
    isr_stub!(179),
    isr_stub!(180),
    isr_stub!(181),
    isr_stub!(182),
    isr_stub!(183),
    isr_stub!(184),
    isr_stub!(185),
    isr_stub!(186),
    isr_stub!(187),
    isr_stub!(188),
    isr_stub!(189),
    isr_stub!(190),
    isr_stub!(191),
    // Vectors 192-207
    isr_stub!(192),
    isr_stub!(193),
    isr_stub!(194),
    isr_stub!(195),
    isr_stub!(196),
    isr_stub!(197),
    isr_stub!(198),
    isr_stub!(199),
    isr_stub!(200),
    isr_stub!(201),
    isr_stub!(202),
    isr_stub!(203),
    isr_stub!(204),
    isr_stub!(205),
    isr_stub!(206),
    isr_stub!(207),
    // Vectors 208-223
    isr_stub!(208),
    isr_stub!(209),
    isr_stub!(210),
    isr_stub!(211),
    isr_stub!(212),
    isr_stub!(213),
    isr_stub!(214),
    isr_stub!(215),
    isr_stub!(216),
    isr_stub!(217),
    isr_stub!(218),
    isr_stub!(219),
    isr_stub!(220),
    isr_stub!(221),
    isr_stub!(222),
    isr_stub!(223),
    // Vectors 224-239
    isr_stub!(224),
    isr_stub!(225),
    isr_stub!(226),
    isr_stub!(227),
    isr_stub!(228),
    isr_stub!(229),
    isr_stub!(230),
    isr_stub!(231),
    isr_stub!(232),
    isr_stub!(233),
    isr_stub!(234),
    isr_stub!(235),
    isr_stub!(236),
    isr_stub!(237),
    isr_stub!(238),
    isr_stub!(239),
    // Vectors 240-255 (IPIs, timer, spurious)
    isr_stub!(240),
    isr_stub!(241),
    isr_stub!(242),
    isr_stub!(243),
    isr_stub!(244),
    isr_stub!(245),
    isr_stub!(246),
    isr_stub!(247),
    isr_stub!(248),
    isr_stub!(249),
    isr_stub!(250),
    isr_stub!(251),
    isr_stub!(252),
    isr_stub!(253),
    isr_stub!(254),
    isr_stub!(255),
];
