// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use crate::arch::Word;

/// Iteratively constructs a bitset of a given type from bit fields, least
/// significant field first.
#[macro_export]
macro_rules! encode {
    (
        $T:ty;
        $([..$($width:literal)?$($width2:ident)?..] = $int:expr),*
        $(,[..*] = $final:expr)?
    ) => {
        {
            use $crate::coding::CodeAsWord as _;
            let mut offset = 0;
            let mut result: $T = 0;
            $(
                let encoded_int: $T = $int.encode_as_word();
                let mask: $T = (((1 as $T) << $($width)* $($width2)*) - 1) as $T;
                result |= ((encoded_int & mask) << offset);
                offset += $($width)* $($width2)*;
            )*
            $(
                let encoded_final: $T = $final.encode_as_word();
                result |= (encoded_final << offset);
            )*
            let _ = offset;
            result
        }
    };
}

/// Types that occupy a bit field of an instruction [`Word`].
pub trait CodeAsWord {
    /// Encodes `self` into a `Word`. Higher bits are chopped off by
    /// [`encode!`] when the field is narrower than the value.
    fn encode_as_word(&self) -> Word;

    /// Decodes `Self` from the least significant bits of `encoded`. Must be
    /// total: every bit pattern decodes to something.
    fn decode_from_word(encoded: Word) -> Self;
}

impl CodeAsWord for u8 {
    fn encode_as_word(&self) -> Word {
        *self as Word
    }

    fn decode_from_word(encoded: Word) -> Self {
        encoded as u8
    }
}

impl CodeAsWord for Word {
    fn encode_as_word(&self) -> Word {
        *self
    }

    fn decode_from_word(encoded: Word) -> Self {
        encoded
    }
}

/// Deconstructs a bitset of a given type into bitfields of given types,
/// least significant field first.
#[macro_export]
macro_rules! decode {
    (
        $encoded:expr; $TEnc:ty;
        @($($out:ident: $T:ty =
            [..$($width:literal)?$($width2:ident)?..]),*)
        => $block:expr
    ) => {{
        use $crate::coding::CodeAsWord as _;
        let mut __offset = 0;
        $(
            ::paste::paste! {
                let [<__width_ $out>] = $($width)*$($width2)* as $TEnc;
                let mask = (1 as $TEnc)
                    .checked_shl([<__width_ $out>] as u32)
                    .unwrap_or(0)
                    .wrapping_sub(1);
                let $out = <$T>::decode_from_word(($encoded >> __offset) & mask);
                __offset += [<__width_ $out>];
            }
        )*
        let _ = __offset;
        $block
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    // a signed field, to check that masking keeps only the low bits
    struct Nibble(i8);
    impl CodeAsWord for Nibble {
        fn encode_as_word(&self) -> Word {
            self.0.to_le_bytes()[0] as Word
        }

        fn decode_from_word(encoded: Word) -> Self {
            // sign-extend the 4-bit field
            Self(((encoded as u8) << 4) as i8 >> 4)
        }
    }

    #[test]
    fn encodes_fields_in_order() {
        assert_eq!(
            0x1 | (0x2 << 7) | (0x3 << 10),
            encode!(Word;
                [..7..] = 1u8,
                [..3..] = 2u8,
                [..2..] = 3u8
            )
        );
    }

    #[test]
    fn encode_truncates_oversized_fields() {
        assert_eq!(0b11, encode!(Word; [..2..] = 0xffu8));
        assert_eq!(0xe, encode!(Word; [..4..] = Nibble(-2)));
    }

    #[test]
    fn encode_places_trailing_field() {
        assert_eq!(
            5 | (0xabcd << 8),
            encode!(Word; [..8..] = 5u8, [..*] = 0xabcdu64)
        );
    }

    #[test]
    fn decodes_fields_in_order() {
        let word: Word = 0x1 | (0x2 << 7) | (0x3 << 10);
        decode!(word; Word;
            @(a: u8 = [..7..], b: u8 = [..3..], c: u8 = [..2..]) => {
                assert_eq!(1, a);
                assert_eq!(2, b);
                assert_eq!(3, c);
            }
        );
    }

    #[test]
    fn decodes_signed_fields() {
        decode!(0xe | (0x3 << 4); Word;
            @(a: Nibble = [..4..], b: Nibble = [..4..]) => {
                assert_eq!(-2, a.0);
                assert_eq!(3, b.0);
            }
        );
    }
}
