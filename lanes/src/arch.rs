// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use static_assertions::const_assert;

/// One machine word: every instruction is encoded in exactly one.
pub type Word = u64;

/// A (masked) byte address in the VM's address space.
pub type Address = u32;

/// Number of bytes in an encoded [`Word`].
pub const WORD_BYTES: usize = 8;
const_assert!(WORD_BYTES * 8 == Word::BITS as usize);

pub const ADDRESS_BITS: usize = 24;
const_assert!(ADDRESS_BITS <= Address::BITS as usize);

/// Size of the address space in bytes.
pub const ADDRESS_SPACE: usize = 1 << ADDRESS_BITS;

pub const ADDRESS_MASK: Address = (ADDRESS_SPACE - 1) as Address;

/// Number of bytes an address occupies in memory (the `p24` type).
pub const ADDRESS_BYTES: usize = 3;
const_assert!(ADDRESS_BYTES * 8 == ADDRESS_BITS);

/// Every lane-vector operand carries between 1 and `MAX_WIDTH` values.
pub const MAX_WIDTH: usize = 8;

/// Most operands an instruction can name.
pub const MAX_OPERANDS: usize = 3;

/// Wraps `address` into the address space.
pub const fn mask(address: u64) -> Address {
    (address as Address) & ADDRESS_MASK
}

/// `base + offset`, wrapped into the address space.
pub const fn offset(base: Address, offset: i64) -> Address {
    mask((base as u64).wrapping_add(offset as u64))
}
