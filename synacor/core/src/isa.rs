//! Opcode table.
//!
//! The table is dense (indexed directly by opcode number) so the dispatcher, the
//! disassembler and any out-of-tree renderer share one source of truth for arity and
//! mnemonic.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Halt = 0,
    Set = 1,
    Push = 2,
    Pop = 3,
    Eq = 4,
    Gt = 5,
    Jmp = 6,
    Jt = 7,
    Jf = 8,
    Add = 9,
    Mult = 10,
    Mod = 11,
    And = 12,
    Or = 13,
    Not = 14,
    Rmem = 15,
    Wmem = 16,
    Call = 17,
    Ret = 18,
    Out = 19,
    In = 20,
    Nop = 21,
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub opcode: Opcode,
    pub arity: u8,
    /// Architectural name.
    pub name: &'static str,
    /// Spelling used in disassembly and trace output.
    pub mnemonic: &'static str,
}

const fn info(
    opcode: Opcode,
    arity: u8,
    name: &'static str,
    mnemonic: &'static str,
) -> OpcodeInfo {
    OpcodeInfo {
        opcode,
        arity,
        name,
        mnemonic,
    }
}

pub const OPCODES: [OpcodeInfo; 22] = [
    info(Opcode::Halt, 0, "halt", "halt"),
    info(Opcode::Set, 2, "set", "mov"),
    info(Opcode::Push, 1, "push", "push"),
    info(Opcode::Pop, 1, "pop", "pop"),
    info(Opcode::Eq, 3, "eq", "eq"),
    info(Opcode::Gt, 3, "gt", "gt"),
    info(Opcode::Jmp, 1, "jmp", "jmp"),
    info(Opcode::Jt, 2, "jt", "jt"),
    info(Opcode::Jf, 2, "jf", "jf"),
    info(Opcode::Add, 3, "add", "add"),
    info(Opcode::Mult, 3, "mult", "mult"),
    info(Opcode::Mod, 3, "mod", "mod"),
    info(Opcode::And, 3, "and", "and"),
    info(Opcode::Or, 3, "or", "or"),
    info(Opcode::Not, 2, "not", "not"),
    info(Opcode::Rmem, 2, "rmem", "rmem"),
    info(Opcode::Wmem, 2, "wmem", "wmem"),
    info(Opcode::Call, 1, "call", "call"),
    info(Opcode::Ret, 0, "ret", "ret"),
    info(Opcode::Out, 1, "out", "out"),
    info(Opcode::In, 1, "in", "in"),
    info(Opcode::Nop, 0, "nop", "nop"),
];

/// Longest encoded instruction, in words.
pub const MAX_INSTR_WORDS: usize = 4;

impl Opcode {
    /// Decode an opcode word; `None` is the illegal-instruction case.
    pub fn from_word(word: u16) -> Option<Self> {
        OPCODES.get(word as usize).map(|entry| entry.opcode)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn info(self) -> &'static OpcodeInfo {
        &OPCODES[self as usize]
    }

    pub fn arity(self) -> usize {
        self.info().arity as usize
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    /// Encoded length including the opcode word.
    pub fn encoded_len(self) -> usize {
        1 + self.arity()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Iterate over every opcode in numeric order.
pub fn all_opcodes() -> impl Iterator<Item = &'static OpcodeInfo> {
    OPCODES.iter()
}
