// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Untagged value cells and the data types that give them meaning.
//!
//! A [`Value`] never knows what it holds. The [`DataType`] of the operand it
//! belongs to decides its width in memory and its [`Mode`], and the mode
//! decides how arithmetic treats its bits.

use core::cmp::Ordering;

use enum_tags::enum_tags;
use num_traits::{AsPrimitive, PrimInt, WrappingMul};
use rand_core::RngCore;

use crate::{
    arch::{Word, ADDRESS_BYTES, MAX_WIDTH},
    coding::CodeAsWord,
};

/// Bits used for a data type tag inside an instruction.
pub const DATA_TYPE_BITS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[enum_tags(public, repr(u8))]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// A packed 3-byte address.
    P24,
    /// Any tag without a meaning. The VM skips instructions that use it.
    Unsupported = 15,
}

impl DataType {
    /// Parses a type name such as `u64` or `p24`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_mnemonic(name).filter(|ty| *ty != Self::Unsupported)
    }

    /// Bytes one lane of this type occupies in memory.
    pub const fn size(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
            Self::P24 => ADDRESS_BYTES,
            Self::Unsupported => 0,
        }
    }

    pub const fn mode(&self) -> Mode {
        match self {
            Self::I8 | Self::I16 | Self::I32 | Self::I64 => Mode::Signed,
            Self::F32 | Self::F64 => Mode::Float,
            _ => Mode::Unsigned,
        }
    }

    pub const fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }

    /// Reads one lane from the first [`Self::size`] bytes of `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> Value {
        let size = self.size();
        let mut raw = [0; 8];
        raw[..size].copy_from_slice(&bytes[..size]);
        let bits = u64::from_le_bytes(raw);
        match self {
            Self::F32 => Value::from_f64(f32::from_bits(bits as u32) as f64),
            Self::F64 => Value::from_f64(f64::from_bits(bits)),
            Self::I8 | Self::I16 | Self::I32 => {
                Value::from_u64(sign_extend_to(bits, size * 8))
            }
            _ => Value::from_u64(bits),
        }
    }

    /// Writes one lane into the first [`Self::size`] bytes of `bytes`,
    /// truncating integers to the type's width.
    pub fn encode(&self, value: Value, bytes: &mut [u8]) {
        let size = self.size();
        let raw = match self {
            Self::F32 => {
                ((value.as_f64() as f32).to_bits() as u64).to_le_bytes()
            }
            _ => value.to_le_bytes(),
        };
        bytes[..size].copy_from_slice(&raw[..size]);
    }
}

impl CodeAsWord for DataType {
    fn encode_as_word(&self) -> Word {
        self.tag() as Word
    }

    fn decode_from_word(encoded: Word) -> Self {
        Self::from_tag(encoded as u8).unwrap_or(Self::Unsupported)
    }
}

/// One 8-byte storage cell, interpreted by whoever holds it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Value([u8; 8]);

impl Value {
    pub const ZERO: Value = Value([0; 8]);

    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_le_bytes())
    }

    pub const fn from_i64(value: i64) -> Self {
        Self(value.to_le_bytes())
    }

    pub fn from_f64(value: f64) -> Self {
        Self(value.to_le_bytes())
    }

    pub const fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    pub const fn as_i64(&self) -> i64 {
        i64::from_le_bytes(self.0)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_le_bytes(self.0)
    }

    pub const fn to_le_bytes(&self) -> [u8; 8] {
        self.0
    }
}

/// How a [`Value`]'s bits are read. This is the closed set of arithmetic
/// strategies the interpreter dispatches over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Unsigned,
    Signed,
    Float,
}

impl Mode {
    /// Reinterprets `value` from `from` to `self`, converting between integer
    /// and float representations. Integer modes share bits.
    pub fn convert(&self, value: Value, from: Mode) -> Value {
        match (from, *self) {
            (Mode::Float, Mode::Float) => value,
            (Mode::Float, Mode::Signed) => {
                Value::from_i64(value.as_f64() as i64)
            }
            (Mode::Float, Mode::Unsigned) => {
                Value::from_u64(value.as_f64() as u64)
            }
            (Mode::Signed, Mode::Float) => {
                Value::from_f64(value.as_i64() as f64)
            }
            (Mode::Unsigned, Mode::Float) => {
                Value::from_f64(value.as_u64() as f64)
            }
            _ => value,
        }
    }

    pub fn to_f64(&self, value: Value) -> f64 {
        Mode::Float.convert(value, *self).as_f64()
    }

    pub fn from_f64(&self, value: f64) -> Value {
        self.convert(Value::from_f64(value), Mode::Float)
    }

    pub fn from_i64(&self, value: i64) -> Value {
        self.convert(Value::from_i64(value), Mode::Signed)
    }

    /// Applies an integer operation; floats go through `i64` and back.
    fn bits(
        &self,
        a: Value,
        b: Value,
        op: impl FnOnce(u64, u64) -> u64,
    ) -> Value {
        match self {
            Mode::Float => {
                let a = a.as_f64() as i64 as u64;
                let b = b.as_f64() as i64 as u64;
                Value::from_f64(op(a, b) as i64 as f64)
            }
            _ => Value::from_u64(op(a.as_u64(), b.as_u64())),
        }
    }

    pub fn and(&self, a: Value, b: Value) -> Value {
        self.bits(a, b, |a, b| a & b)
    }

    pub fn or(&self, a: Value, b: Value) -> Value {
        self.bits(a, b, |a, b| a | b)
    }

    pub fn xor(&self, a: Value, b: Value) -> Value {
        self.bits(a, b, |a, b| a ^ b)
    }

    pub fn not(&self, a: Value) -> Value {
        self.bits(a, Value::ZERO, |a, _| !a)
    }

    /// Shifts use the low 6 bits of the amount.
    pub fn shl(&self, a: Value, b: Value) -> Value {
        self.bits(a, b, |a, b| a.wrapping_shl(b as u32))
    }

    /// Logical for unsigned values, arithmetic otherwise.
    pub fn shr(&self, a: Value, b: Value) -> Value {
        match self {
            Mode::Unsigned => self.bits(a, b, |a, b| a.wrapping_shr(b as u32)),
            _ => self.bits(a, b, |a, b| {
                (a as i64).wrapping_shr(b as u32) as u64
            }),
        }
    }

    pub fn add(&self, a: Value, b: Value) -> Value {
        match self {
            Mode::Float => Value::from_f64(a.as_f64() + b.as_f64()),
            _ => Value::from_u64(a.as_u64().wrapping_add(b.as_u64())),
        }
    }

    pub fn sub(&self, a: Value, b: Value) -> Value {
        match self {
            Mode::Float => Value::from_f64(a.as_f64() - b.as_f64()),
            _ => Value::from_u64(a.as_u64().wrapping_sub(b.as_u64())),
        }
    }

    pub fn mul(&self, a: Value, b: Value) -> Value {
        match self {
            Mode::Float => Value::from_f64(a.as_f64() * b.as_f64()),
            _ => Value::from_u64(a.as_u64().wrapping_mul(b.as_u64())),
        }
    }

    /// Integer division by zero yields zero.
    pub fn div(&self, a: Value, b: Value) -> Value {
        match self {
            Mode::Unsigned => Value::from_u64(
                a.as_u64().checked_div(b.as_u64()).unwrap_or(0),
            ),
            Mode::Signed => {
                if b.as_i64() == 0 {
                    Value::ZERO
                } else {
                    Value::from_i64(a.as_i64().wrapping_div(b.as_i64()))
                }
            }
            Mode::Float => Value::from_f64(a.as_f64() / b.as_f64()),
        }
    }

    /// Floored modulus: a nonzero signed or float result takes the sign of
    /// the divisor. Integer modulus by zero yields zero.
    pub fn rem(&self, a: Value, b: Value) -> Value {
        match self {
            Mode::Unsigned => Value::from_u64(
                a.as_u64().checked_rem(b.as_u64()).unwrap_or(0),
            ),
            Mode::Signed => {
                let (a, b) = (a.as_i64(), b.as_i64());
                if b == 0 {
                    return Value::ZERO;
                }
                let mut r = a.wrapping_rem(b);
                if r != 0 && (r < 0) != (b < 0) {
                    r = r.wrapping_add(b);
                }
                Value::from_i64(r)
            }
            Mode::Float => {
                let (a, b) = (a.as_f64(), b.as_f64());
                let mut r = a % b;
                if r != 0.0 && (r < 0.0) != (b < 0.0) {
                    r += b;
                }
                Value::from_f64(r)
            }
        }
    }

    /// Integer powers are computed by squaring; a negative exponent runs
    /// zero iterations and so yields 1.
    pub fn pow(&self, a: Value, b: Value) -> Value {
        match self {
            Mode::Unsigned => {
                Value::from_u64(pow_by_squaring(a.as_u64(), b.as_i64()))
            }
            Mode::Signed => {
                Value::from_i64(pow_by_squaring(a.as_i64(), b.as_i64()))
            }
            Mode::Float => Value::from_f64(a.as_f64().powf(b.as_f64())),
        }
    }

    pub fn neg(&self, a: Value) -> Value {
        match self {
            Mode::Float => Value::from_f64(-a.as_f64()),
            _ => Value::from_u64(a.as_u64().wrapping_neg()),
        }
    }

    pub fn abs(&self, a: Value) -> Value {
        match self {
            Mode::Unsigned => a,
            Mode::Signed => Value::from_i64(a.as_i64().wrapping_abs()),
            Mode::Float => Value::from_f64(a.as_f64().abs()),
        }
    }

    /// -1, 0 or 1 in this mode.
    pub fn sign(&self, a: Value) -> Value {
        match self.compare(a, Value::ZERO) {
            Some(Ordering::Less) => self.from_i64(-1),
            Some(Ordering::Greater) => self.from_i64(1),
            _ => Value::ZERO,
        }
    }

    pub fn min(&self, a: Value, b: Value) -> Value {
        match self.compare(a, b) {
            Some(Ordering::Greater) => b,
            _ => a,
        }
    }

    pub fn max(&self, a: Value, b: Value) -> Value {
        match self.compare(a, b) {
            Some(Ordering::Less) => b,
            _ => a,
        }
    }

    /// `None` only when a float operand is NaN.
    pub fn compare(&self, a: Value, b: Value) -> Option<Ordering> {
        match self {
            Mode::Unsigned => Some(a.as_u64().cmp(&b.as_u64())),
            Mode::Signed => Some(a.as_i64().cmp(&b.as_i64())),
            Mode::Float => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }

    /// A uniformly random value: any bit pattern for integers, `[0, 1)` for
    /// floats.
    pub fn random(&self, rng: &mut dyn RngCore) -> Value {
        let bits = rng.next_u64();
        match self {
            Mode::Float => {
                Value::from_f64((bits >> 11) as f64 / (1u64 << 53) as f64)
            }
            _ => Value::from_u64(bits),
        }
    }

    pub fn format(&self, value: Value) -> String {
        match self {
            Mode::Unsigned => value.as_u64().to_string(),
            Mode::Signed => value.as_i64().to_string(),
            Mode::Float => value.as_f64().to_string(),
        }
    }
}

/// Up to [`MAX_WIDTH`] values sharing one data type: the unit every opcode
/// computes on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValArray {
    pub values: [Value; MAX_WIDTH],
    pub ty: DataType,
    pub width: u8,
}

impl Default for ValArray {
    fn default() -> Self {
        Self {
            values: [Value::ZERO; MAX_WIDTH],
            ty: DataType::U8,
            width: 1,
        }
    }
}

impl ValArray {
    pub fn new(ty: DataType, width: u8) -> Self {
        Self {
            values: [Value::ZERO; MAX_WIDTH],
            ty,
            width,
        }
    }

    /// Clears the lanes and retypes the array in place.
    pub fn reset(&mut self, ty: DataType, width: u8) {
        self.values = [Value::ZERO; MAX_WIDTH];
        self.ty = ty;
        self.width = width;
    }

    pub fn mode(&self) -> Mode {
        self.ty.mode()
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }

    /// Lane `index`, broadcasting narrower arrays.
    pub fn lane(&self, index: usize) -> Value {
        self.values[index % self.width().max(1)]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    /// Bytes this array occupies in memory.
    pub fn byte_len(&self) -> usize {
        self.ty.size() * self.width()
    }

    pub fn lanes(&self) -> &[Value] {
        &self.values[..self.width()]
    }

    /// Decodes every lane from consecutive memory.
    pub fn decode(&mut self, bytes: &[u8]) {
        let size = self.ty.size();
        for lane in 0..self.width() {
            self.values[lane] = self.ty.decode(&bytes[lane * size..]);
        }
    }

    /// Encodes every lane into consecutive memory.
    pub fn encode(&self, bytes: &mut [u8]) {
        let size = self.ty.size();
        for lane in 0..self.width() {
            self.ty.encode(self.values[lane], &mut bytes[lane * size..]);
        }
    }

    pub fn format(&self) -> String {
        let mode = self.mode();
        let lanes = self
            .lanes()
            .iter()
            .map(|value| mode.format(*value))
            .collect::<Vec<_>>();
        if lanes.len() == 1 {
            lanes[0].clone()
        } else {
            format!("[{}]", lanes.join(", "))
        }
    }
}

fn pow_by_squaring<T: PrimInt + WrappingMul>(base: T, exponent: i64) -> T {
    let mut result = T::one();
    let mut base = base;
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result.wrapping_mul(&base);
        }
        base = base.wrapping_mul(&base);
        exponent >>= 1;
    }
    result
}

/// Sign-extends the low `bits` bits of `value`.
pub fn sign_extend_to<
    In: num_traits::Unsigned + PrimInt + AsPrimitive<Out>,
    Out: 'static + num_traits::Unsigned + PrimInt + num_traits::WrappingShl,
>(
    value: In,
    bits: usize,
) -> Out {
    let sign_bit = In::one() << (bits - 1);
    if value & sign_bit != In::zero() {
        let extension = Out::max_value().wrapping_shl(bits as u32);
        value.as_() | extension
    } else {
        value.as_()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decodes_narrow_signed_types_with_sign_extension() {
        assert_eq!(-2, DataType::I8.decode(&[0xfe]).as_i64());
        assert_eq!(-2, DataType::I16.decode(&[0xfe, 0xff]).as_i64());
        assert_eq!(0xfe, DataType::U8.decode(&[0xfe]).as_u64());
        assert_eq!(0x030201, DataType::P24.decode(&[1, 2, 3, 4]).as_u64());
    }

    #[test]
    fn encode_truncates_to_type_width() {
        let mut bytes = [0xaa; 4];
        DataType::U16.encode(Value::from_u64(0x12345), &mut bytes);
        assert_eq!([0x45, 0x23, 0xaa, 0xaa], bytes);
    }

    #[test]
    fn floats_round_trip_through_f32() {
        let mut bytes = [0; 4];
        DataType::F32.encode(Value::from_f64(1.5), &mut bytes);
        assert_eq!(1.5, DataType::F32.decode(&bytes).as_f64());
    }

    #[test]
    fn parses_type_names() {
        assert_eq!(Some(DataType::U64), DataType::parse("u64"));
        assert_eq!(Some(DataType::P24), DataType::parse("p24"));
        assert_eq!(None, DataType::parse("unsupported"));
        assert_eq!(None, DataType::parse("u128"));
    }

    #[test]
    fn unknown_tags_decode_as_unsupported() {
        assert_eq!(DataType::Unsupported, DataType::decode_from_word(11));
        assert_eq!(DataType::F64, DataType::decode_from_word(9));
    }

    #[test]
    fn modulus_is_floored_for_signed_and_float() {
        let m = Mode::Signed;
        assert_eq!(2, m.rem(m.from_i64(-7), m.from_i64(3)).as_i64());
        assert_eq!(-2, m.rem(m.from_i64(7), m.from_i64(-3)).as_i64());
        assert_eq!(0, m.rem(m.from_i64(7), Value::ZERO).as_i64());

        let f = Mode::Float;
        let r = f.rem(Value::from_f64(-7.0), Value::from_f64(3.0));
        assert_eq!(2.0, r.as_f64());
    }

    #[test]
    fn negative_integer_exponent_yields_one() {
        let m = Mode::Signed;
        assert_eq!(1, m.pow(m.from_i64(5), m.from_i64(-2)).as_i64());
        assert_eq!(-8, m.pow(m.from_i64(-2), m.from_i64(3)).as_i64());
        assert_eq!(
            1024,
            Mode::Unsigned
                .pow(Value::from_u64(2), Value::from_u64(10))
                .as_u64()
        );
    }

    #[test]
    fn integer_division_by_zero_is_zero() {
        assert_eq!(
            Value::ZERO,
            Mode::Unsigned.div(Value::from_u64(3), Value::ZERO)
        );
        assert_eq!(
            Value::ZERO,
            Mode::Signed.div(Value::from_i64(-3), Value::ZERO)
        );
    }

    #[test]
    fn sign_and_shift_follow_mode() {
        let s = Mode::Signed;
        assert_eq!(-1, s.sign(s.from_i64(-9)).as_i64());
        assert_eq!(-1.0, Mode::Float.sign(Value::from_f64(-0.5)).as_f64());
        assert_eq!(-4, s.shr(s.from_i64(-8), s.from_i64(1)).as_i64());
        assert_eq!(
            u64::MAX >> 1,
            Mode::Unsigned
                .shr(Value::from_u64(u64::MAX), Value::from_u64(1))
                .as_u64()
        );
    }

    #[test]
    fn narrow_arrays_broadcast() {
        let mut array = ValArray::new(DataType::U8, 1);
        array.set(0, Value::from_u64(7));
        assert_eq!(7, array.lane(5).as_u64());
        assert_eq!("7", array.format());
    }

    proptest! {
        #[test]
        fn integer_types_round_trip_in_range(value in any::<i32>()) {
            let mut bytes = [0; 4];
            DataType::I32.encode(Value::from_i64(value as i64), &mut bytes);
            prop_assert_eq!(
                value as i64,
                DataType::I32.decode(&bytes).as_i64()
            );
        }

        #[test]
        fn signed_to_float_and_back_is_exact_for_small_values(
            value in -(1i64 << 52)..(1i64 << 52)
        ) {
            let float =
                Mode::Float.convert(Value::from_i64(value), Mode::Signed);
            let back = Mode::Signed.convert(float, Mode::Float);
            prop_assert_eq!(value, back.as_i64());
        }
    }
}
