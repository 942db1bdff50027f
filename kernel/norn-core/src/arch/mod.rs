//! Architecture-specific foundations.
//!
//! The structure definitions (descriptor tables, page tables, register
//! frames) are plain data and compile everywhere so they can be unit-tested
//! on the host; code that executes privileged instructions is gated to
//! `target_os = "none"` inside the module.

pub mod x86_64;
