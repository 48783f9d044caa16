//! Flow-diversion classification.

use crate::{Category, InstructionClass};

/// Returns true if an instruction with this category/class may transfer control
/// to a non-sequential address.
///
/// The category covers branches, calls, returns and interrupts. The instruction
/// class catches the system transitions the category does not single out
/// (`syscall`, `sysret`, and the `iret` family).
pub fn diverts(category: Category, class: InstructionClass) -> bool {
    match category {
        Category::ConditionalBranch
        | Category::UnconditionalBranch
        | Category::Call
        | Category::Return
        | Category::Interrupt => true,
        Category::Other => matches!(
            class,
            InstructionClass::Syscall
                | InstructionClass::Sysret
                | InstructionClass::Iret
                | InstructionClass::Iretd
                | InstructionClass::Iretq
        ),
    }
}
