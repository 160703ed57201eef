//! Symbolic instruction assembler
//!
//! Builds an ordered instruction sequence where branches may name a
//! label instead of carrying a literal offset, then resolves every
//! label to a signed relative offset in a single linear pass.
//!
//! Positions and offsets are counted in 8-byte instruction slots, the
//! unit the engine's program counter advances in; a wide (two-slot)
//! load therefore shifts every later position by two. The engine
//! increments the program counter before applying a branch offset, so
//! `offset = target - branch - branch_slots`.
//!
//! The resolved [`Program`] is a distinct type that can only hold
//! encoded instructions, so an unpatched symbolic reference cannot
//! survive past [`Assembler::resolve`].

use std::collections::HashMap;

use thiserror::Error;

use crate::insn::{Insn, RawInsn};

/// Errors raised while resolving an instruction sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("branch at slot {position} references undefined label {label:?}")]
    UnresolvedLabel { label: String, position: usize },

    #[error("label {label:?} is defined more than once")]
    DuplicateLabel { label: String },

    #[error("branch at slot {position} to {label:?} needs offset {offset}, beyond the 16-bit range")]
    OffsetOutOfRange {
        label: String,
        position: usize,
        offset: i64,
    },
}

/// Instruction sequence builder.
///
/// Purely accumulates state; dropping a partially built sequence has
/// no effect on anything else.
#[derive(Debug, Default)]
pub struct Assembler {
    insns: Vec<Insn>,
    labels: HashMap<String, usize>,
    duplicate: Option<String>,
    slot: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction, returning the slot position it was
    /// placed at.
    pub fn emit(&mut self, insn: Insn) -> usize {
        let position = self.slot;
        self.slot += insn.slots();
        self.insns.push(insn);
        position
    }

    /// Bind `name` to the current position, i.e. to the next emitted
    /// instruction. Binding the same name twice is reported by
    /// [`resolve`](Self::resolve).
    pub fn label(&mut self, name: &str) {
        if self.labels.insert(name.to_owned(), self.slot).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name.to_owned());
        }
    }

    /// Slot position the next instruction will occupy.
    pub fn position(&self) -> usize {
        self.slot
    }

    /// Resolve all symbolic branch targets and encode the sequence.
    pub fn resolve(self) -> Result<Program, AssemblyError> {
        if let Some(label) = self.duplicate {
            return Err(AssemblyError::DuplicateLabel { label });
        }

        let mut raw = Vec::with_capacity(self.slot);
        let mut position = 0usize;

        for insn in &self.insns {
            let offset = match insn.label() {
                Some(name) => {
                    let target = *self.labels.get(name).ok_or_else(|| {
                        AssemblyError::UnresolvedLabel {
                            label: name.to_owned(),
                            position,
                        }
                    })?;
                    let offset = target as i64 - position as i64 - insn.slots() as i64;
                    i16::try_from(offset).map_err(|_| AssemblyError::OffsetOutOfRange {
                        label: name.to_owned(),
                        position,
                        offset,
                    })?
                }
                None => literal_offset(insn),
            };

            let encoded = insn.encode(offset);
            raw.extend_from_slice(&encoded.slots[..encoded.len]);
            position += insn.slots();
        }

        Ok(Program { insns: raw })
    }
}

/// Offset already present on a branch with a literal target; zero for
/// everything else.
fn literal_offset(insn: &Insn) -> i16 {
    use crate::insn::Target;
    match insn {
        Insn::Jump {
            target: Target::Offset(off),
        }
        | Insn::Branch {
            target: Target::Offset(off),
            ..
        } => *off,
        _ => 0,
    }
}

/// A fully resolved, encoded instruction sequence ready to hand to the
/// kernel engine. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    insns: Vec<RawInsn>,
}

impl Program {
    /// Encoded instructions, one entry per slot.
    pub fn insns(&self) -> &[RawInsn] {
        &self.insns
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Little-endian wire image of the whole sequence.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.insns.len() * RawInsn::SIZE);
        for insn in &self.insns {
            out.extend_from_slice(&insn.to_bytes());
        }
        out
    }
}
