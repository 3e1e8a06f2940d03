//! Operand classification for raw code words.
//!
//! Every word that follows an opcode is one of three things: a literal in
//! `0..=32767`, a reference to `r0..=r7` (`32768..=32775`), or garbage.

use crate::{MAX_LITERAL, NUM_REGS, REGISTER_BASE};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Literal(u16),
    Register(usize),
    Invalid(u16),
}

impl Operand {
    pub fn decode(word: u16) -> Self {
        if word <= MAX_LITERAL {
            Operand::Literal(word)
        } else if word < REGISTER_BASE + NUM_REGS as u16 {
            Operand::Register((word - REGISTER_BASE) as usize)
        } else {
            Operand::Invalid(word)
        }
    }

    /// Value of the operand against the given register file, `None` for invalid words.
    pub fn value(self, regs: &[u16; NUM_REGS]) -> Option<u16> {
        match self {
            Operand::Literal(value) => Some(value),
            Operand::Register(index) => Some(regs[index]),
            Operand::Invalid(_) => None,
        }
    }

    pub fn register(self) -> Option<usize> {
        match self {
            Operand::Register(index) => Some(index),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(value) => write!(f, "{value}"),
            Operand::Register(index) => write!(f, "r{index}"),
            Operand::Invalid(word) => write!(f, "invalid#{word}"),
        }
    }
}

/// Resolve a source word to its value.
pub fn resolve(regs: &[u16; NUM_REGS], word: u16) -> Option<u16> {
    Operand::decode(word).value(regs)
}

/// Store `value` through a destination word; `None` unless the word names a register.
pub fn write_register(regs: &mut [u16; NUM_REGS], word: u16, value: u16) -> Option<()> {
    let index = Operand::decode(word).register()?;
    regs[index] = value;
    Some(())
}
