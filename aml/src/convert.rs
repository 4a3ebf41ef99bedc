use crate::{
    object::{Object, ObjectType},
    AmlError,
    Interpreter,
    Operation,
};
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use byteorder::{ByteOrder, LittleEndian};
use core::{cmp::Ordering, fmt::Write};

/// The end tag of a resource template: small item `0x79`, followed by a checksum byte.
const END_TAG: u8 = 0x79;

impl Interpreter {
    /// Mask an integer to the width of AML integers in the current table.
    pub(crate) fn mask(&self, value: u64) -> u64 {
        if self.integer_size == 4 {
            value & 0xffff_ffff
        } else {
            value
        }
    }

    pub(crate) fn ones(&self) -> u64 {
        self.mask(u64::MAX)
    }

    /// Implicitly convert an object to an integer. Strings are read as hexadecimal, stopping at the first
    /// character that isn't a hex digit, or once the integer is full.
    pub(crate) fn to_integer(&self, object: &Object) -> Result<u64, AmlError> {
        match object {
            Object::Integer(value) => Ok(self.mask(*value)),
            Object::String(string) => {
                let mut value: u64 = 0;
                let digits = string.iter().skip_while(|byte| byte.is_ascii_whitespace());
                for (i, &byte) in digits.enumerate() {
                    let Some(digit) = (byte as char).to_digit(16) else { break };
                    if i >= self.integer_size * 2 {
                        break;
                    }
                    value = (value << 4) | digit as u64;
                }
                Ok(value)
            }
            Object::Buffer(bytes) => Ok(self.buffer_to_integer(bytes)),
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::ConvertToInteger, typ: other.typ() }),
        }
    }

    /// `ToInteger`. Unlike the implicit conversion, strings are decimal unless they start with `0x`.
    pub(crate) fn to_integer_explicit(&self, object: &Object) -> Result<u64, AmlError> {
        let Object::String(string) = object else {
            return self.to_integer(object);
        };

        let string = string.trim_ascii();
        let (digits, radix) = match string.strip_prefix(b"0x").or_else(|| string.strip_prefix(b"0X")) {
            Some(hex) => (hex, 16),
            None => (string, 10),
        };

        let mut value: u64 = 0;
        for &byte in digits {
            let Some(digit) = (byte as char).to_digit(radix) else { break };
            value = value
                .checked_mul(radix as u64)
                .and_then(|value| value.checked_add(digit as u64))
                .filter(|value| self.mask(*value) == *value)
                .ok_or(AmlError::NumericOverflow)?;
        }
        Ok(value)
    }

    fn buffer_to_integer(&self, bytes: &[u8]) -> u64 {
        let mut padded = [0u8; 8];
        let length = usize::min(bytes.len(), self.integer_size);
        padded[..length].copy_from_slice(&bytes[..length]);
        LittleEndian::read_u64(&padded)
    }

    fn integer_to_bytes(&self, value: u64) -> Vec<u8> {
        let mut bytes = [0u8; 8];
        LittleEndian::write_u64(&mut bytes, value);
        bytes[..self.integer_size].to_vec()
    }

    /// Implicitly convert an object to the bytes of a string. Integers become fixed-width hexadecimal, and each
    /// byte of a buffer becomes two hex digits, separated by spaces.
    pub(crate) fn to_string(&self, object: &Object) -> Result<Vec<u8>, AmlError> {
        match object {
            Object::String(string) => Ok(string.clone()),
            Object::Integer(value) => Ok(format!("{:01$X}", self.mask(*value), self.integer_size * 2).into_bytes()),
            Object::Buffer(bytes) => {
                let mut string = String::new();
                for (i, byte) in bytes.iter().enumerate() {
                    if i > 0 {
                        string.push(' ');
                    }
                    // Writing to a `String` can't fail
                    let _ = write!(string, "{:02X}", byte);
                }
                Ok(string.into_bytes())
            }
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::ConvertToString, typ: other.typ() }),
        }
    }

    /// Implicitly convert an object to a buffer. Integers are encoded little-endian, at the width of AML
    /// integers.
    pub(crate) fn to_buffer(&self, object: &Object) -> Result<Vec<u8>, AmlError> {
        match object {
            Object::Buffer(bytes) => Ok(bytes.clone()),
            Object::Integer(value) => Ok(self.integer_to_bytes(*value)),
            Object::String(string) => Ok(string.clone()),
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::ConvertToBuffer, typ: other.typ() }),
        }
    }

    /// `ToBuffer`. Strings keep their null terminator.
    pub(crate) fn to_buffer_explicit(&self, object: &Object) -> Result<Vec<u8>, AmlError> {
        match object {
            Object::String(string) => {
                let mut bytes = Vec::new();
                bytes.try_reserve_exact(string.len() + 1).map_err(|_| AmlError::OutOfMemory)?;
                bytes.extend_from_slice(string);
                bytes.push(0);
                Ok(bytes)
            }
            other => self.to_buffer(other),
        }
    }

    /// `ToHexString`
    pub(crate) fn to_hex_string(&self, object: &Object) -> Result<Vec<u8>, AmlError> {
        match object {
            Object::Integer(value) => Ok(format!("0x{:01$X}", self.mask(*value), self.integer_size * 2).into_bytes()),
            Object::Buffer(bytes) => Ok(join_bytes(bytes, |string, byte| write!(string, "0x{:02X}", byte))),
            Object::String(string) => Ok(string.clone()),
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::ConvertToString, typ: other.typ() }),
        }
    }

    /// `ToDecimalString`
    pub(crate) fn to_decimal_string(&self, object: &Object) -> Result<Vec<u8>, AmlError> {
        match object {
            Object::Integer(value) => Ok(self.mask(*value).to_string().into_bytes()),
            Object::Buffer(bytes) => Ok(join_bytes(bytes, |string, byte| write!(string, "{}", byte))),
            Object::String(string) => Ok(string.clone()),
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::ConvertToString, typ: other.typ() }),
        }
    }

    /// Convert `object` to the type of `like`, for operators that coerce their second operand to the type of the
    /// first.
    pub(crate) fn convert_like(&self, object: &Object, like: ObjectType) -> Result<Object, AmlError> {
        match like {
            ObjectType::Integer => Ok(Object::Integer(self.to_integer(object)?)),
            ObjectType::String => Ok(Object::String(self.to_string(object)?)),
            ObjectType::Buffer => Ok(Object::Buffer(self.to_buffer(object)?)),
            _ => Err(AmlError::OperandType),
        }
    }

    /// `Concatenate`. The right operand is converted to the type of the left one. Two integers produce a buffer
    /// holding both.
    pub(crate) fn concatenate(&self, left: &Object, right: &Object) -> Result<Object, AmlError> {
        match left {
            Object::Integer(left) => {
                let right = self.to_integer(right)?;
                let mut bytes = self.integer_to_bytes(*left);
                bytes.extend(self.integer_to_bytes(right));
                Ok(Object::Buffer(bytes))
            }
            Object::String(left) => {
                let right = self.to_string(right)?;
                let mut string = Vec::new();
                string.try_reserve_exact(left.len() + right.len()).map_err(|_| AmlError::OutOfMemory)?;
                string.extend_from_slice(left);
                string.extend_from_slice(&right);
                self.check_size(string.len())?;
                Ok(Object::String(string))
            }
            Object::Buffer(left) => {
                let right = self.to_buffer(right)?;
                let mut bytes = Vec::new();
                bytes.try_reserve_exact(left.len() + right.len()).map_err(|_| AmlError::OutOfMemory)?;
                bytes.extend_from_slice(left);
                bytes.extend_from_slice(&right);
                self.check_size(bytes.len())?;
                Ok(Object::Buffer(bytes))
            }
            other => Err(AmlError::InvalidOperationOnObject { op: Operation::Concat, typ: other.typ() }),
        }
    }

    /// `ConcatenateResTemplate`: join two resource templates, keeping a single end tag. The checksum of the
    /// result is zero, meaning "don't check".
    pub(crate) fn concatenate_resource_templates(&self, left: &Object, right: &Object) -> Result<Object, AmlError> {
        let (Object::Buffer(left), Object::Buffer(right)) = (left, right) else {
            return Err(AmlError::OperandType);
        };

        fn strip_end_tag(bytes: &[u8]) -> &[u8] {
            match bytes {
                [rest @ .., END_TAG, _] => rest,
                _ => bytes,
            }
        }

        let left = strip_end_tag(left);
        let right = strip_end_tag(right);
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(left.len() + right.len() + 2).map_err(|_| AmlError::OutOfMemory)?;
        bytes.extend_from_slice(left);
        bytes.extend_from_slice(right);
        bytes.extend_from_slice(&[END_TAG, 0]);
        Ok(Object::Buffer(bytes))
    }

    /// Compare two objects for the logical operators. The right operand is converted to the type of the left.
    pub(crate) fn compare(&self, left: &Object, right: &Object) -> Result<Ordering, AmlError> {
        match left {
            Object::Integer(left) => Ok(self.mask(*left).cmp(&self.to_integer(right)?)),
            Object::String(left) => Ok(left.as_slice().cmp(self.to_string(right)?.as_slice())),
            Object::Buffer(left) => Ok(left.as_slice().cmp(self.to_buffer(right)?.as_slice())),
            _ => Err(AmlError::OperandType),
        }
    }

    pub(crate) fn check_size(&self, size: usize) -> Result<(), AmlError> {
        if size > self.config.max_object_size {
            return Err(AmlError::OutOfMemory);
        }
        Ok(())
    }
}

fn join_bytes<F>(bytes: &[u8], mut f: F) -> Vec<u8>
where
    F: FnMut(&mut String, u8) -> core::fmt::Result,
{
    let mut string = String::new();
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            string.push(',');
        }
        let _ = f(&mut string, *byte);
    }
    string.into_bytes()
}

/// Convert a binary-coded-decimal number (`FromBCD`).
pub(crate) fn from_bcd(mut value: u64) -> Result<u64, AmlError> {
    let mut result: u64 = 0;
    let mut multiplier: u64 = 1;
    while value != 0 {
        let digit = value & 0xf;
        if digit > 9 {
            return Err(AmlError::NumericOverflow);
        }
        result += digit * multiplier;
        multiplier = multiplier.saturating_mul(10);
        value >>= 4;
    }
    Ok(result)
}

/// Convert to binary-coded decimal (`ToBCD`). Fails if the result doesn't fit in an integer.
pub(crate) fn to_bcd(mut value: u64, integer_size: usize) -> Result<u64, AmlError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    while value != 0 {
        if shift >= integer_size * 8 {
            return Err(AmlError::NumericOverflow);
        }
        result |= (value % 10) << shift;
        value /= 10;
        shift += 4;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestHandler;
    use alloc::vec;

    #[test]
    fn implicit_string_to_integer() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        assert_eq!(interpreter.to_integer(&Object::String("1f".into())), Ok(0x1f));
        assert_eq!(interpreter.to_integer(&Object::String("12zz".into())), Ok(0x12));
        assert_eq!(interpreter.to_integer(&Object::String("".into())), Ok(0));
        // Only the first 16 digits fit in a 64-bit integer
        assert_eq!(interpreter.to_integer(&Object::String("123456789abcdef01".into())), Ok(0x1234_5678_9abc_def0));
    }

    #[test]
    fn explicit_string_to_integer() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        assert_eq!(interpreter.to_integer_explicit(&Object::String("0x1f".into())), Ok(0x1f));
        assert_eq!(interpreter.to_integer_explicit(&Object::String("123".into())), Ok(123));
        assert_eq!(
            interpreter.to_integer_explicit(&Object::String("99999999999999999999".into())),
            Err(AmlError::NumericOverflow)
        );
    }

    #[test]
    fn integer_width_follows_revision() {
        let interpreter = Interpreter::new(TestHandler::new(), 1);
        assert_eq!(interpreter.ones(), 0xffff_ffff);
        assert_eq!(interpreter.to_string(&Object::Integer(0x1a)).unwrap(), b"0000001A");
        assert_eq!(interpreter.to_buffer(&Object::Integer(0x0102)).unwrap(), vec![2, 1, 0, 0]);
    }

    #[test]
    fn concatenate_integers() {
        let interpreter = Interpreter::new(TestHandler::new(), 1);
        let result = interpreter.concatenate(&Object::Integer(1), &Object::Integer(2)).unwrap();
        assert_eq!(result.as_buffer().unwrap(), &[1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn concatenate_coerces_right_operand() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        let result =
            interpreter.concatenate(&Object::String("Value: ".into()), &Object::Integer(0xff)).unwrap();
        assert_eq!(result.as_string().unwrap(), "Value: 00000000000000FF");

        let result = interpreter.concatenate(&Object::Buffer(vec![1]), &Object::String("AB".into())).unwrap();
        assert_eq!(result.as_buffer().unwrap(), &[1, b'A', b'B']);
    }

    #[test]
    fn resource_templates() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        let a = Object::Buffer(vec![0x22, 0x01, 0x00, 0x79, 0x00]);
        let b = Object::Buffer(vec![0x2a, 0x10, 0x00, 0x79, 0x5c]);
        let result = interpreter.concatenate_resource_templates(&a, &b).unwrap();
        assert_eq!(result.as_buffer().unwrap(), &[0x22, 0x01, 0x00, 0x2a, 0x10, 0x00, 0x79, 0x00]);
    }

    #[test]
    fn string_forms() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        let buffer = Object::Buffer(vec![1, 0xab]);
        assert_eq!(interpreter.to_string(&buffer).unwrap(), b"01 AB");
        assert_eq!(interpreter.to_hex_string(&buffer).unwrap(), b"0x01,0xAB");
        assert_eq!(interpreter.to_decimal_string(&buffer).unwrap(), b"1,171");
        assert_eq!(interpreter.to_decimal_string(&Object::Integer(42)).unwrap(), b"42");
        assert_eq!(interpreter.to_buffer_explicit(&Object::String("hi".into())).unwrap(), vec![b'h', b'i', 0]);
    }

    #[test]
    fn comparisons() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        assert_eq!(
            interpreter.compare(&Object::Integer(0x10), &Object::String("10".into())),
            Ok(Ordering::Equal)
        );
        assert_eq!(
            interpreter.compare(&Object::String("abc".into()), &Object::String("abd".into())),
            Ok(Ordering::Less)
        );
        assert_eq!(interpreter.compare(&Object::Device, &Object::Integer(0)), Err(AmlError::OperandType));
    }

    #[test]
    fn bcd() {
        assert_eq!(from_bcd(0x1234), Ok(1234));
        assert_eq!(from_bcd(0x1a), Err(AmlError::NumericOverflow));
        assert_eq!(to_bcd(1234, 8), Ok(0x1234));
        assert_eq!(to_bcd(123_456_789, 4), Err(AmlError::NumericOverflow));
    }
}
