// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use enum_tags::enum_tags;
use static_assertions::const_assert;

use crate::{
    arch::{Word, MAX_OPERANDS},
    coding::CodeAsWord,
    value::DataType,
};

/// Smallest sized integer type that can fit an op code.
pub type RawOpCode = u8;

/// Bits for opcode.
pub const OPCODE_BITS: usize = 7;
const_assert!(OPCODE_BITS <= RawOpCode::BITS as usize);

/// A VM operation. Operand counts and fixed operand types live in
/// [`Opcode::template`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[enum_tags(public, repr(RawOpCode))]
pub enum Opcode {
    Nop,
    /// Stops fetching for good.
    Halt,

    // stack
    Push,
    Pop,
    Dup,
    /// `swz a, idx -> o` sets lane `l` of `o` to lane `idx[l]` of `a`.
    Swz,

    // memory
    Ld,
    St,
    /// Frame-relative load: the address is `fp + offset`.
    Ldf,
    Stf,
    /// Stack-relative load: the address is `sp + offset`.
    Lds,
    Sts,

    // registers
    Getfp,
    Setfp,
    Addfp,
    Getsp,
    Setsp,
    Addsp,

    // unary
    Not,
    Neg,
    Abs,
    Sign,

    // binary
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Min,
    Max,

    // reductions fold every lane into one
    Rsum,
    Rprod,
    Rmin,
    Rmax,
    Rall,
    Rany,

    // conversions
    Tof,
    Toi,
    Tou,

    // floating point
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Floor,
    Ceil,
    Round,

    // control flow
    Jump,
    Jz,
    Jnz,
    Jneg,
    Jpos,
    Jeq,
    Jne,
    Jlt,
    Jle,
    Jgt,
    Jge,
    Switch,
    Call,
    Adjf,
    Ret,

    // host interaction
    Rand,
    Sleep,
    Devmap,
    Debug,
    Dbgstr,

    /// Every tag that names no operation decodes to this.
    Invalid = 127,
}

impl CodeAsWord for Opcode {
    fn encode_as_word(&self) -> Word {
        self.tag() as Word
    }

    fn decode_from_word(encoded: Word) -> Self {
        Self::from_tag(encoded as RawOpCode).unwrap_or(Self::Invalid)
    }
}

/// Type and width an opcode forces on one operand slot. `None` means the
/// instruction's own type or width applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub ty: Option<DataType>,
    pub width: Option<u8>,
}

impl Slot {
    pub const FREE: Slot = Slot {
        ty: None,
        width: None,
    };

    /// A single address.
    pub const ADDRESS: Slot = Slot::scalar(DataType::P24);

    /// A single signed byte offset.
    pub const OFFSET: Slot = Slot::scalar(DataType::I32);

    /// One lane of the instruction's type.
    pub const LANE: Slot = Slot {
        ty: None,
        width: Some(1),
    };

    pub const fn scalar(ty: DataType) -> Slot {
        Slot {
            ty: Some(ty),
            width: Some(1),
        }
    }

    pub const fn typed(ty: DataType) -> Slot {
        Slot {
            ty: Some(ty),
            width: None,
        }
    }
}

/// How many operands an opcode reads and writes, inputs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Template {
    pub inputs: u8,
    pub outputs: u8,
    pub slots: [Slot; MAX_OPERANDS],
}

impl Template {
    const fn new(inputs: u8, outputs: u8, slots: [Slot; MAX_OPERANDS]) -> Self {
        Self {
            inputs,
            outputs,
            slots,
        }
    }

    pub const fn operands(&self) -> usize {
        (self.inputs + self.outputs) as usize
    }

    pub const fn is_output(&self, slot: usize) -> bool {
        slot >= self.inputs as usize
    }
}

const F: Slot = Slot::FREE;
const A: Slot = Slot::ADDRESS;
const O: Slot = Slot::OFFSET;

impl Opcode {
    pub const fn template(&self) -> Template {
        match self {
            Self::Nop | Self::Halt | Self::Ret | Self::Invalid => {
                Template::new(0, 0, [F, F, F])
            }
            Self::Push
            | Self::Not
            | Self::Neg
            | Self::Abs
            | Self::Sign
            | Self::Sqrt
            | Self::Exp
            | Self::Ln
            | Self::Sin
            | Self::Cos
            | Self::Tan
            | Self::Asin
            | Self::Acos
            | Self::Atan
            | Self::Floor
            | Self::Ceil
            | Self::Round => Template::new(1, 1, [F, F, F]),
            Self::Pop | Self::Debug => Template::new(1, 0, [F, F, F]),
            Self::Dup => Template::new(1, 2, [F, F, F]),
            Self::Swz => {
                Template::new(2, 1, [F, Slot::typed(DataType::U8), F])
            }
            Self::Ld => Template::new(1, 1, [A, F, F]),
            Self::St => Template::new(2, 0, [F, A, F]),
            Self::Ldf | Self::Lds => Template::new(1, 1, [O, F, F]),
            Self::Stf | Self::Sts => Template::new(2, 0, [F, O, F]),
            Self::Getfp | Self::Getsp => Template::new(0, 1, [A, F, F]),
            Self::Setfp | Self::Setsp | Self::Jump | Self::Call => {
                Template::new(1, 0, [A, F, F])
            }
            Self::Addfp | Self::Addsp | Self::Adjf => {
                Template::new(1, 0, [O, F, F])
            }
            Self::And
            | Self::Or
            | Self::Xor
            | Self::Shl
            | Self::Shr
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::Pow
            | Self::Min
            | Self::Max
            | Self::Atan2 => Template::new(2, 1, [F, F, F]),
            Self::Rsum
            | Self::Rprod
            | Self::Rmin
            | Self::Rmax
            | Self::Rall
            | Self::Rany => Template::new(1, 1, [F, Slot::LANE, F]),
            Self::Tof => {
                Template::new(1, 1, [F, Slot::typed(DataType::F64), F])
            }
            Self::Toi => {
                Template::new(1, 1, [F, Slot::typed(DataType::I64), F])
            }
            Self::Tou => {
                Template::new(1, 1, [F, Slot::typed(DataType::U64), F])
            }
            Self::Jz | Self::Jnz | Self::Jneg | Self::Jpos => {
                Template::new(2, 0, [F, A, F])
            }
            Self::Jeq
            | Self::Jne
            | Self::Jlt
            | Self::Jle
            | Self::Jgt
            | Self::Jge => Template::new(3, 0, [F, F, A]),
            Self::Switch => {
                Template::new(2, 0, [Slot::scalar(DataType::U32), A, F])
            }
            Self::Rand => Template::new(0, 1, [F, F, F]),
            Self::Sleep => {
                Template::new(1, 0, [Slot::scalar(DataType::U32), F, F])
            }
            Self::Devmap => {
                Template::new(3, 0, [Slot::scalar(DataType::U32), A, A])
            }
            Self::Dbgstr => {
                Template::new(1, 0, [Slot::scalar(DataType::U8), F, F])
            }
        }
    }

    /// Parses a mnemonic. [`Opcode::Invalid`] has none.
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_mnemonic(name).filter(|op| *op != Self::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_fits_the_operand_limit() {
        for op in Opcode::ALL {
            assert!(op.template().operands() <= MAX_OPERANDS, "{op:?}");
        }
    }

    #[test]
    fn tags_fit_in_opcode_bits() {
        for op in Opcode::ALL {
            assert!((op.tag() as usize) < (1 << OPCODE_BITS), "{op:?}");
        }
    }

    #[test]
    fn unknown_tags_decode_as_invalid() {
        assert_eq!(Opcode::Invalid, Opcode::decode_from_word(120));
        assert_eq!(Opcode::Nop, Opcode::decode_from_word(0));
        assert_eq!(
            Opcode::Add,
            Opcode::decode_from_word(Opcode::ADD_TAG as Word)
        );
    }

    #[test]
    fn parses_mnemonics() {
        assert_eq!(Some(Opcode::Add), Opcode::parse("add"));
        assert_eq!(Some(Opcode::Dbgstr), Opcode::parse("dbgstr"));
        assert_eq!(None, Opcode::parse("invalid"));
        assert_eq!(None, Opcode::parse("ADD"));
    }

    #[test]
    fn branch_targets_are_addresses() {
        assert_eq!(Slot::ADDRESS, Opcode::Jump.template().slots[0]);
        assert_eq!(Slot::ADDRESS, Opcode::Jlt.template().slots[2]);
        assert!(Opcode::Dup.template().is_output(2));
    }
}
