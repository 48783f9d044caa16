//! Test doubles shared by the unit tests.

use crate::database::{Database, DatabaseError, ImageDatabase, Region};
use crate::decoder::{DecodeMode, DecoderError};
use crate::{Address, Architecture, Category, DecodedInstruction, Decoder, InstructionClass, MAX_INSTRUCTION_SIZE};

/// A 64-bit x86 database with one executable region.
pub fn code_db(start: Address, bytes: Vec<u8>) -> ImageDatabase {
    let mut db = ImageDatabase::new(Architecture::X86_64, true);
    db.add_region(Region::new(".text", start, bytes, true)).unwrap();
    db
}

/// Decoder keyed on the first byte of the window:
///
/// | byte   | length | category | format     |
/// |--------|--------|----------|------------|
/// | `0x90` | 1      | other    | `nop`      |
/// | `0xc3` | 1      | return   | `ret`      |
/// | `0xe8` | 5      | call     | `call`     |
/// | `0xf1` | 3      | other    | fails      |
/// | other  | rejected                       |
#[derive(Debug)]
pub struct ScriptedDecoder;

impl Decoder for ScriptedDecoder {
    fn decode(
        &self,
        window: &[u8],
        at: Address,
        mode: DecodeMode,
    ) -> Result<DecodedInstruction, DecoderError> {
        let (size, category) = match window.first() {
            Some(0x90) => (1, Category::Other),
            Some(0xc3) => (1, Category::Return),
            Some(0xe8) => (5, Category::Call),
            Some(0xf1) => (3, Category::Other),
            _ => return Err(DecoderError::InvalidEncoding(at)),
        };
        if window.len() < size {
            return Err(DecoderError::InvalidEncoding(at));
        }
        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        bytes[..size].copy_from_slice(&window[..size]);
        Ok(DecodedInstruction {
            size: size as u8,
            category,
            class: InstructionClass::Other,
            mode,
            bytes,
        })
    }

    fn format(
        &self,
        insn: &DecodedInstruction,
        at: Address,
        _max_len: usize,
    ) -> Result<String, DecoderError> {
        match insn.bytes[0] {
            0x90 => Ok("nop".to_string()),
            0xc3 => Ok("ret".to_string()),
            0xe8 => Ok("call".to_string()),
            _ => Err(DecoderError::Format {
                address: at,
                reason: "scripted failure".to_string(),
            }),
        }
    }
}

/// Flat memory at address 0 with no region information. Instruction creation
/// always fails, and deletes fail when `fail_deletes` is set.
pub struct UnmappedRegionsDb {
    pub bytes: Vec<u8>,
    pub fail_deletes: bool,
    pub comments: Vec<(Address, String)>,
}

impl UnmappedRegionsDb {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            fail_deletes: false,
            comments: Vec::new(),
        }
    }
}

impl Database for UnmappedRegionsDb {
    fn is_mapped(&self, address: Address) -> bool {
        (address as usize) < self.bytes.len()
    }

    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> usize {
        let offset = address as usize;
        if offset >= self.bytes.len() {
            return 0;
        }
        let n = buf.len().min(self.bytes.len() - offset);
        buf[..n].copy_from_slice(&self.bytes[offset..offset + n]);
        n
    }

    fn region_end(&self, _address: Address) -> Option<Address> {
        None
    }

    fn focus_address(&self) -> Address {
        0
    }

    fn is_64bit(&self) -> bool {
        true
    }

    fn architecture(&self) -> Architecture {
        Architecture::X86_64
    }

    fn delete_items(&mut self, address: Address, length: usize) -> Result<(), DatabaseError> {
        if self.fail_deletes {
            return Err(DatabaseError::Unmapped { address, length });
        }
        Ok(())
    }

    fn create_instruction(&mut self, _address: Address) -> bool {
        false
    }

    fn force_display_text(&mut self, _address: Address, _text: &str) {}

    fn attach_comment(&mut self, address: Address, text: &str, _repeatable: bool) {
        self.comments.retain(|(a, _)| *a != address);
        self.comments.push((address, text.to_string()));
    }
}
