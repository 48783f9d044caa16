//! Commit a decoded instruction into the database.

use std::fmt;

use crate::database::{Database, DatabaseError};
use crate::Address;

/// How an instruction ended up in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// Created as an instruction item displaying the rendered text
    Real,
    /// Item creation failed; the text was attached as a comment instead
    Annotated,
}

impl fmt::Display for Materialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Materialized::Real => write!(f, "real"),
            Materialized::Annotated => write!(f, "annotated"),
        }
    }
}

/// Replace whatever occupies `[address, address + length)` with one instruction
/// showing `text`, or fall back to a regular comment carrying `text`.
///
/// Only the initial removal can fail; creation failure selects the fallback.
pub fn materialize<D>(
    db: &mut D,
    address: Address,
    length: usize,
    text: &str,
) -> Result<Materialized, DatabaseError>
where
    D: Database + ?Sized,
{
    db.delete_items(address, length)?;

    if db.create_instruction(address) {
        db.force_display_text(address, text);
        Ok(Materialized::Real)
    } else {
        log::debug!("0x{:x}: cannot create instruction, annotating '{}'", address, text);
        db.attach_comment(address, text, false);
        Ok(Materialized::Annotated)
    }
}
