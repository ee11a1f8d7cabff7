// The decoded instruction value (spec.md §3, §4.B): a mnemonic tag, a
// segment-prefix override, zero to two parameters, and enough bookkeeping
// (byte length, source offset) to support disassembly and length-invariant
// tests. The decoder builds these; `engine` matches on the mnemonic.

use crate::fields::{Condition, Parameter};
use std::fmt;

/// Set by prefix bytes `26/2E/36/3E`, consumed by the next instruction's
/// memory operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentPrefix {
    None,
    CS,
    DS,
    ES,
    SS,
}

/// Set by prefix bytes `F2/F3`, consumed by the next string instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RepeatMode {
    None,
    Repeat,
    RepeatZero,
    RepeatNonZero,
}

/// The closed mnemonic set (spec.md §4.E), plus the additional opcode
/// encodings documented in SPEC_FULL.md §E (segment push/pop, direct-address
/// MOV, indirect near `CALL`/`JMP`) which are extra encodings of mnemonics
/// already in this list, not new entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mnemonic {
    Mov,
    Xchg,
    Lea,
    Lds,
    Les,
    Push,
    Pop,
    Pushf,
    Popf,

    Add,
    Adc,
    Sub,
    Sbb,
    Inc,
    Dec,
    Cmp,
    Mul,
    Imul,
    Div,
    Idiv,
    Cbw,
    Cwd,
    Daa,

    And,
    Or,
    Xor,
    Test,
    Not,
    Neg,
    Rol,
    Ror,
    Shl,
    Shr,

    Jmp,
    Call,
    Ret,
    Jcc(Condition),
    Loop,
    Loopz,
    Loopnz,
    Int,
    Iret,
    Hlt,
    Nop,

    Movsb,
    Movsw,
    Cmpsb,
    Cmpsw,
    Scasb,
    Scasw,
    Lodsb,
    Lodsw,
    Stosb,
    Stosw,

    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One fully decoded instruction: ready for `engine::step` to dispatch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub segment_override: SegmentPrefix,
    pub repeat: RepeatMode,
    pub params: Vec<Parameter>,
    /// Total bytes consumed, prefixes included, from `offset` onward.
    pub length: u16,
    /// `IP` of the first prefix byte (or the opcode, if there is none).
    pub offset: u16,
}

impl Instruction {
    pub fn first(&self) -> Option<Parameter> {
        self.params.first().copied()
    }

    pub fn second(&self) -> Option<Parameter> {
        self.params.get(1).copied()
    }
}
