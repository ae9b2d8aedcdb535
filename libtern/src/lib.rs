//! The RISC-V target backend of a static ELF linker, covering the CHERI and
//! CHERIoT extensions.
//!
//! The backend owns everything that is specific to the RISC-V instruction set:
//! validating and merging per-object machine flags, classifying and applying
//! relocations, synthesising PLT and GOT entries, the compartment
//! import/export record format, and iterative linker relaxation. File I/O,
//! symbol resolution and output layout belong to the embedding linker; this
//! crate consumes their results through [`context::LinkContext`].

pub mod arch;
pub mod compartment;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod relaxation;
pub mod relocation;
pub mod riscv;
pub mod section;
pub mod symbol;
