//! Architecture-specific kernel code.

pub mod x86_64;
