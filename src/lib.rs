//! Core IR, traits, and errors for the Nuclide Annotate linear scanner.
//!
//! The scanner decodes x86 machine code linearly from a starting address,
//! commits every decoded instruction into an analysis database, and stops on
//! the first instruction that diverts control flow. The database and the
//! instruction decoder are reached through the [`database::Database`] and
//! [`Decoder`] traits, so the same loop drives an in-memory image or a host
//! environment.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use nuclide_annotate::{
//!     decoder::CapstoneDecoder,
//!     loader::GoblinLoader,
//!     scan::{LinearScan, ScanConfig},
//! };
//!
//! // Read binary file and map it into an in-memory database
//! let binary_data = fs::read("path/to/binary").unwrap();
//! let mut db = GoblinLoader::new().load(&binary_data).unwrap();
//!
//! // Scan from the database focus (the entry point) until control flow diverts
//! let decoder = CapstoneDecoder::new();
//! let config = ScanConfig::default();
//! let report = LinearScan::begin(&mut db, &decoder, &config).unwrap().run();
//!
//! println!("{}", report.status_line());
//! ```

pub mod classify;
pub mod database;
pub mod decoder;
pub mod format;
pub mod loader;
pub mod materialize;
pub mod plugin;
pub mod scan;
#[cfg(test)]
mod testing;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

pub use decoder::DecodeMode;

/// Maximum x86 instruction length in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Coarse control-flow category reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Conditional jump (`jcc`, `loop`, `jrcxz`)
    ConditionalBranch,
    /// Unconditional jump
    UnconditionalBranch,
    /// Call
    Call,
    /// Return
    Return,
    /// Software interrupt (`int`, `int3`, `into`)
    Interrupt,
    /// Everything that falls through
    Other,
}

/// Fine-grained instruction class, only tracked where the category is too coarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionClass {
    Syscall,
    Sysret,
    Iret,
    Iretd,
    Iretq,
    Other,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::ConditionalBranch => write!(f, "cond-branch"),
            Category::UnconditionalBranch => write!(f, "uncond-branch"),
            Category::Call => write!(f, "call"),
            Category::Return => write!(f, "return"),
            Category::Interrupt => write!(f, "interrupt"),
            Category::Other => write!(f, "other"),
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Size of the instruction in bytes
    pub size: u8,
    /// Control-flow category
    pub category: Category,
    /// Instruction class
    pub class: InstructionClass,
    /// Mode the bytes were decoded under
    pub mode: DecodeMode,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl DecodedInstruction {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Returns true if executing this instruction departs from straight-line flow.
    pub fn diverts(&self) -> bool {
        classify::diverts(self.category, self.class)
    }
}

/// Decoder trait: decodes and renders x86 instructions.
pub trait Decoder: Send + Sync {
    /// Prepare any decoder-wide tables. Safe to call before every scan.
    fn initialize(&self) -> Result<(), decoder::DecoderError> {
        Ok(())
    }

    /// Decode a single instruction from `window`, whose first byte lives at `at`.
    ///
    /// # Arguments
    /// * `window` - The bytes read at `at` (may be shorter than a full window)
    /// * `at` - Address of the first byte
    /// * `mode` - Decode mode for the whole scan
    ///
    /// # Returns
    /// The decoded instruction, or a `DecoderError` if the bytes are rejected
    fn decode(
        &self,
        window: &[u8],
        at: Address,
        mode: DecodeMode,
    ) -> Result<DecodedInstruction, decoder::DecoderError>;

    /// Render `insn` as Intel-syntax text, with relative targets resolved against `at`.
    fn format(
        &self,
        insn: &DecodedInstruction,
        at: Address,
        max_len: usize,
    ) -> Result<String, decoder::DecoderError>;
}

/// Architectures a database can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// MIPS 32-bit
    Mips32,
    /// RISC-V 32-bit
    RiscV32,
    /// RISC-V 64-bit
    RiscV64,
    /// Unknown architecture
    Unknown,
}

impl Architecture {
    /// True for the x86 family, the only one the scanner can decode.
    pub fn is_x86(&self) -> bool {
        matches!(self, Architecture::X86_32 | Architecture::X86_64)
    }

    /// Native bitness, if the architecture has a fixed one.
    pub fn is_64bit(&self) -> Option<bool> {
        match self {
            Architecture::X86_64 | Architecture::AArch64 | Architecture::RiscV64 => Some(true),
            Architecture::Unknown => None,
            _ => Some(false),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Mips32 => write!(f, "MIPS32"),
            Architecture::RiscV32 => write!(f, "RISC-V 32"),
            Architecture::RiscV64 => write!(f, "RISC-V 64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Error type for loading and scanning
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    ParsingError(String),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
