use std::fmt;
use thiserror::Error;

use super::catalog::DataType;

/// 16-bit value stored in one device register.
pub type Word = u16;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected {expected} register words, got {actual}")]
pub struct DecodeError {
    pub expected: usize,
    pub actual: usize,
}

/// Decoded register value before scaling or enum mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue {
    Unsigned(u64),
    Signed(i64),
}

impl RawValue {
    pub fn as_f64(self) -> f64 {
        match self {
            RawValue::Unsigned(value) => value as f64,
            RawValue::Signed(value) => value as f64,
        }
    }

    /// Truncating integer key for enum-map lookups.
    pub fn enum_key(self) -> i64 {
        match self {
            RawValue::Unsigned(value) => value as i64,
            RawValue::Signed(value) => value,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Unsigned(value) => write!(f, "{value}"),
            RawValue::Signed(value) => write!(f, "{value}"),
        }
    }
}

/// Decode a word window read from the device. Word order and byte order
/// are big-endian, the convention of the KSEM register map.
pub fn decode(words: &[Word], ty: DataType) -> Result<RawValue, DecodeError> {
    let expected = usize::from(ty.word_count());
    if words.len() != expected {
        return Err(DecodeError { expected, actual: words.len() });
    }

    let mut wide: u64 = 0;
    for &word in words {
        wide = (wide << 16) | u64::from(word);
    }

    Ok(match ty {
        DataType::U16 | DataType::U32 | DataType::U64 => RawValue::Unsigned(wide),
        DataType::I16 => RawValue::Signed(i64::from(wide as u16 as i16)),
        DataType::I32 => RawValue::Signed(i64::from(wide as u32 as i32)),
        DataType::I64 => RawValue::Signed(wide as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_32bit_big_endian() {
        assert_eq!(decode(&[0x0000, 0x0001], DataType::U32), Ok(RawValue::Unsigned(1)));
        assert_eq!(
            decode(&[0x0001, 0x0000], DataType::U32),
            Ok(RawValue::Unsigned(0x0001_0000))
        );
    }

    #[test]
    fn unsigned_16bit_and_64bit() {
        assert_eq!(decode(&[0x1234], DataType::U16), Ok(RawValue::Unsigned(0x1234)));
        assert_eq!(
            decode(&[0x0000, 0x0000, 0x0000, 0x0005], DataType::U64),
            Ok(RawValue::Unsigned(5))
        );
        assert_eq!(
            decode(&[0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF], DataType::U64),
            Ok(RawValue::Unsigned(u64::MAX))
        );
    }

    #[test]
    fn signed_values_keep_their_sign() {
        assert_eq!(decode(&[0xFFFF], DataType::I16), Ok(RawValue::Signed(-1)));
        assert_eq!(decode(&[0xFFFF, 0xFFFE], DataType::I32), Ok(RawValue::Signed(-2)));
        assert_eq!(
            decode(&[0xFFFF, 0xFFFF, 0xFFFF, 0xFFFD], DataType::I64),
            Ok(RawValue::Signed(-3))
        );
    }

    #[test]
    fn word_count_mismatch_is_an_error() {
        assert_eq!(
            decode(&[0x0001], DataType::U32),
            Err(DecodeError { expected: 2, actual: 1 })
        );
        assert_eq!(
            decode(&[], DataType::U64),
            Err(DecodeError { expected: 4, actual: 0 })
        );
    }
}
