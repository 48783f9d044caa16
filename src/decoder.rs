//! Capstone-based x86 decoder adapter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use capstone::arch::x86::{ArchMode as X86Mode, ArchSyntax, X86Insn};
use capstone::prelude::*;
use capstone::{Capstone, InsnGroupId, InsnGroupType};

use crate::database::Database;
use crate::scan::ScanError;
use crate::{Address, Category, DecodedInstruction, Decoder, InstructionClass, MAX_INSTRUCTION_SIZE};

/// Errors that can occur during decoding
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// The bytes do not form an instruction in the active mode
    #[error("invalid encoding at 0x{0:x}")]
    InvalidEncoding(Address),

    /// The decoder reported a length outside 1..=15
    #[error("bad instruction length {length} at 0x{address:x}")]
    BadLength { address: Address, length: usize },

    /// Rendering the instruction text failed
    #[error("cannot format instruction at 0x{address:x}: {reason}")]
    Format { address: Address, reason: String },
}

/// Machine mode used for a whole scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeMode {
    /// 64-bit long mode, 64-bit stack addressing
    Long64,
    /// 32-bit legacy mode, 32-bit stack addressing
    Legacy32,
}

impl DecodeMode {
    const ALL: [DecodeMode; 2] = [DecodeMode::Long64, DecodeMode::Legacy32];

    /// Pick the mode matching the target bitness.
    pub fn from_bitness(is_64bit: bool) -> Self {
        if is_64bit {
            DecodeMode::Long64
        } else {
            DecodeMode::Legacy32
        }
    }

    fn capstone_mode(&self) -> X86Mode {
        match self {
            DecodeMode::Long64 => X86Mode::Mode64,
            DecodeMode::Legacy32 => X86Mode::Mode32,
        }
    }
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeMode::Long64 => write!(f, "long64"),
            DecodeMode::Legacy32 => write!(f, "legacy32"),
        }
    }
}

thread_local! {
    // One Capstone handle per mode; handles are not Send, so each thread owns its own.
    static CS_POOL: RefCell<HashMap<DecodeMode, Rc<Capstone>>> =
        RefCell::new(HashMap::new());
}

/// Build an x86 decoder with instruction detail and Intel syntax.
fn build_x86(mode: DecodeMode) -> Result<Capstone, DecoderError> {
    Ok(Capstone::new()
        .x86()
        .mode(mode.capstone_mode())
        .syntax(ArchSyntax::Intel)
        .detail(true)
        .build()?)
}

fn pooled(mode: DecodeMode) -> Result<Rc<Capstone>, DecoderError> {
    CS_POOL.with(|cell| {
        let mut map = cell.borrow_mut();
        if let Some(cs) = map.get(&mode) {
            return Ok(Rc::clone(cs));
        }
        let cs = Rc::new(build_x86(mode)?);
        map.insert(mode, Rc::clone(&cs));
        Ok(cs)
    })
}

/// Make sure the decoder tables for every mode are ready on this thread.
///
/// Idempotent: later calls find the pool already populated and return immediately.
pub fn initialize() -> Result<(), DecoderError> {
    for mode in DecodeMode::ALL {
        pooled(mode)?;
    }
    Ok(())
}

/// Capstone x86 decoder. Stateless; handles come from a per-thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapstoneDecoder;

impl CapstoneDecoder {
    pub fn new() -> Self {
        CapstoneDecoder
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::x86")
    }
}

fn has_group(groups: &[InsnGroupId], group: u8) -> bool {
    groups.iter().any(|g| g.0 == group)
}

// Capstone leaves these out of the jump group.
const COUNTER_BRANCHES: [X86Insn; 6] = [
    X86Insn::X86_INS_LOOP,
    X86Insn::X86_INS_LOOPE,
    X86Insn::X86_INS_LOOPNE,
    X86Insn::X86_INS_JCXZ,
    X86Insn::X86_INS_JECXZ,
    X86Insn::X86_INS_JRCXZ,
];

const RETURNS: [X86Insn; 3] = [X86Insn::X86_INS_RET, X86Insn::X86_INS_RETF, X86Insn::X86_INS_RETFQ];

const INTERRUPTS: [X86Insn; 3] = [X86Insn::X86_INS_INT, X86Insn::X86_INS_INT3, X86Insn::X86_INS_INTO];

fn is_any(id: u32, insns: &[X86Insn]) -> bool {
    insns.iter().any(|&insn| insn as u32 == id)
}

fn category_of(id: u32, groups: &[InsnGroupId]) -> Category {
    if has_group(groups, InsnGroupType::CS_GRP_CALL as u8) {
        Category::Call
    } else if is_any(id, &RETURNS)
        || has_group(groups, InsnGroupType::CS_GRP_RET as u8)
        || has_group(groups, InsnGroupType::CS_GRP_IRET as u8)
    {
        Category::Return
    } else if is_any(id, &INTERRUPTS) || has_group(groups, InsnGroupType::CS_GRP_INT as u8) {
        Category::Interrupt
    } else if is_any(id, &COUNTER_BRANCHES) {
        Category::ConditionalBranch
    } else if has_group(groups, InsnGroupType::CS_GRP_JUMP as u8) {
        if id == X86Insn::X86_INS_JMP as u32 || id == X86Insn::X86_INS_LJMP as u32 {
            Category::UnconditionalBranch
        } else {
            Category::ConditionalBranch
        }
    } else {
        Category::Other
    }
}

fn class_of(id: u32) -> InstructionClass {
    match id {
        x if x == X86Insn::X86_INS_SYSCALL as u32 => InstructionClass::Syscall,
        x if x == X86Insn::X86_INS_SYSRET as u32 => InstructionClass::Sysret,
        x if x == X86Insn::X86_INS_IRET as u32 => InstructionClass::Iret,
        x if x == X86Insn::X86_INS_IRETD as u32 => InstructionClass::Iretd,
        x if x == X86Insn::X86_INS_IRETQ as u32 => InstructionClass::Iretq,
        _ => InstructionClass::Other,
    }
}

impl Decoder for CapstoneDecoder {
    fn initialize(&self) -> Result<(), DecoderError> {
        initialize()
    }

    fn decode(
        &self,
        window: &[u8],
        at: Address,
        mode: DecodeMode,
    ) -> Result<DecodedInstruction, DecoderError> {
        if window.is_empty() {
            return Err(DecoderError::InvalidEncoding(at));
        }

        let cs = pooled(mode)?;
        let insns = cs.disasm_count(window, at, 1)?;
        let i = insns.iter().next().ok_or(DecoderError::InvalidEncoding(at))?;

        let size = i.bytes().len();
        if size == 0 || size > MAX_INSTRUCTION_SIZE {
            return Err(DecoderError::BadLength { address: at, length: size });
        }

        let detail = cs.insn_detail(&i)?;
        let id = i.id().0;

        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        bytes[..size].copy_from_slice(i.bytes());

        Ok(DecodedInstruction {
            size: size as u8,
            category: category_of(id, detail.groups()),
            class: class_of(id),
            mode,
            bytes,
        })
    }

    fn format(
        &self,
        insn: &DecodedInstruction,
        at: Address,
        max_len: usize,
    ) -> Result<String, DecoderError> {
        let format_err = |reason: String| DecoderError::Format { address: at, reason };

        let cs = pooled(insn.mode)?;
        let insns = cs
            .disasm_count(insn.bytes(), at, 1)
            .map_err(|e| format_err(e.to_string()))?;
        let i = insns
            .iter()
            .next()
            .ok_or_else(|| format_err("bytes no longer decode".to_string()))?;
        let mnemonic = i
            .mnemonic()
            .ok_or_else(|| format_err("missing mnemonic".to_string()))?;

        let text = match i.op_str() {
            Some(ops) if !ops.is_empty() => format!("{} {}", mnemonic, ops),
            _ => mnemonic.to_string(),
        };

        if text.len() > max_len {
            return Err(format_err(format!(
                "{} bytes of text exceed the {}-byte buffer",
                text.len(),
                max_len
            )));
        }
        Ok(text)
    }
}

/// Read a fresh window at `address` and decode one instruction from it.
pub fn decode_at<D, C>(
    db: &D,
    decoder: &C,
    address: Address,
    mode: DecodeMode,
    window_size: usize,
) -> Result<DecodedInstruction, ScanError>
where
    D: Database + ?Sized,
    C: Decoder + ?Sized,
{
    let mut window = vec![0u8; window_size];
    let got = db.read_bytes(address, &mut window);
    if got == 0 {
        return Err(ScanError::ReadFailure(address));
    }
    window.truncate(got);

    decoder
        .decode(&window, address, mode)
        .map_err(|source| ScanError::DecodeFailure { address, source })
}
