use crate::{
    namespace::{self, AmlName, NameComponent, NameSeg},
    opcode::Opcode,
    AmlError,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use bit_field::BitField;
use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

pub(crate) const NULL_NAME: u8 = 0x00;
pub(crate) const DUAL_NAME_PREFIX: u8 = 0x2e;
pub(crate) const MULTI_NAME_PREFIX: u8 = 0x2f;
pub(crate) const ROOT_CHAR: u8 = b'\\';
pub(crate) const PARENT_PREFIX_CHAR: u8 = b'^';

/// A range of an AML byte stream. Method bodies, and the operands of objects whose evaluation is deferred, hold
/// onto their bytecode as spans of the table they were loaded from.
#[derive(Clone)]
pub struct AmlSpan {
    stream: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl AmlSpan {
    pub fn new(bytes: &[u8]) -> AmlSpan {
        AmlSpan { stream: Arc::from(bytes), start: 0, end: bytes.len() }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.stream[self.start..self.end]
    }
}

impl fmt::Debug for AmlSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AmlSpan({:#x}..{:#x})", self.start, self.end)
    }
}

/// A cursor over a span of AML. Offsets (`pc` and `end`) index into the whole underlying stream, so a cursor can
/// be split into sub-cursors and re-wound without copying.
#[derive(Clone)]
pub(crate) struct AmlStream {
    stream: Arc<[u8]>,
    pub pc: usize,
    pub end: usize,
}

impl AmlStream {
    pub fn new(span: &AmlSpan) -> AmlStream {
        AmlStream { stream: span.stream.clone(), pc: span.start, end: span.end }
    }

    pub fn is_done(&self) -> bool {
        self.pc >= self.end
    }

    /// A new cursor over `pc..end` of the same stream.
    pub fn sub_stream(&self, end: usize) -> AmlStream {
        AmlStream { stream: self.stream.clone(), pc: self.pc, end }
    }

    pub fn span(&self, start: usize, end: usize) -> AmlSpan {
        AmlSpan { stream: self.stream.clone(), start, end }
    }

    pub fn bytes(&self, start: usize, end: usize) -> Result<&[u8], AmlError> {
        if start > end || end > self.end {
            return Err(AmlError::MalformedStream);
        }
        Ok(&self.stream[start..end])
    }

    pub fn next(&mut self) -> Result<u8, AmlError> {
        let byte = self.peek()?;
        self.pc += 1;
        Ok(byte)
    }

    pub fn peek(&self) -> Result<u8, AmlError> {
        if self.pc >= self.end {
            return Err(AmlError::RunOutOfStream);
        }
        Ok(self.stream[self.pc])
    }

    fn take(&mut self, n: usize) -> Result<&[u8], AmlError> {
        if self.end.saturating_sub(self.pc) < n {
            return Err(AmlError::RunOutOfStream);
        }
        let start = self.pc;
        self.pc += n;
        Ok(&self.stream[start..self.pc])
    }

    pub fn next_u16(&mut self) -> Result<u16, AmlError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn next_u32(&mut self) -> Result<u32, AmlError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn next_u64(&mut self) -> Result<u64, AmlError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Decode the next opcode. Name strings, locals and args are decoded separately.
    pub fn opcode(&mut self) -> Result<Opcode, AmlError> {
        let opcode: u16 = match self.next()? {
            0x5b => {
                let ext = self.next()?;
                (0x5b << 8) | ext as u16
            }
            /*
             * `0x92` is a bit strange. It can be an opcode in its own right (`LNotOp`), but when followed by
             * `0x93..=0x95`, it instead serves as a negating prefix to encode `LNotEqualOp`, `LLessEqualOp`, and
             * `LGreaterEqualOp`.
             */
            0x92 => match self.peek() {
                Ok(byte @ 0x93..=0x95) => {
                    self.pc += 1;
                    0x9200 | byte as u16
                }
                _ => 0x92,
            },
            other => other as u16,
        };

        Opcode::decode(opcode).ok_or(AmlError::IllegalOpcode(opcode))
    }

    /// Decode a `PkgLength`, returning the offset of the end of the package. The length includes the bytes of
    /// the encoding itself, and the package must fit inside the current stream.
    pub fn pkglength(&mut self) -> Result<usize, AmlError> {
        let start = self.pc;
        let length = self.raw_pkglength()?;
        let end = start.checked_add(length).ok_or(AmlError::MalformedStream)?;

        if length < (self.pc - start) || end > self.end {
            return Err(AmlError::MalformedStream);
        }
        Ok(end)
    }

    /// Decode a `PkgLength` encoding as a plain number. Field lists encode the widths of fields this way.
    pub fn raw_pkglength(&mut self) -> Result<usize, AmlError> {
        let lead_byte = self.next()?;
        let byte_count = lead_byte.get_bits(6..8);

        if byte_count == 0 {
            Ok(lead_byte.get_bits(0..6) as usize)
        } else {
            let mut length = lead_byte.get_bits(0..4) as usize;
            for i in 0..byte_count {
                length |= (self.next()? as usize) << (4 + i * 8);
            }
            Ok(length)
        }
    }

    pub fn name_seg(&mut self) -> Result<NameSeg, AmlError> {
        let bytes = self.take(4)?;
        NameSeg::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Decode a `NameString`: an optional root char or run of parent prefixes, followed by a single name path.
    pub fn namestring(&mut self) -> Result<AmlName, AmlError> {
        let mut components = Vec::new();

        match self.peek()? {
            ROOT_CHAR => {
                self.pc += 1;
                components.push(NameComponent::Root);
            }
            PARENT_PREFIX_CHAR => {
                while self.peek()? == PARENT_PREFIX_CHAR {
                    self.pc += 1;
                    components.push(NameComponent::Prefix);
                }
            }
            _ => (),
        }

        match self.peek()? {
            NULL_NAME => {
                self.pc += 1;
            }
            DUAL_NAME_PREFIX => {
                self.pc += 1;
                for _ in 0..2 {
                    components.push(NameComponent::Segment(self.name_seg()?));
                }
            }
            MULTI_NAME_PREFIX => {
                self.pc += 1;
                let count = self.next()?;
                if count == 0 {
                    return Err(AmlError::InvalidName(None));
                }
                for _ in 0..count {
                    components.push(NameComponent::Segment(self.name_seg()?));
                }
            }
            first_char if namespace::is_lead_name_char(first_char) => {
                components.push(NameComponent::Segment(self.name_seg()?));
            }
            _ => return Err(AmlError::InvalidName(None)),
        }

        if components.is_empty() {
            // A bare `NullName` isn't a name at all
            return Err(AmlError::InvalidName(None));
        }
        Ok(AmlName::from_components(components))
    }

    /// Decode the body of a `String`, which is a run of ASCII characters terminated by a null byte.
    pub fn string(&mut self) -> Result<String, AmlError> {
        let start = self.pc;
        while self.next()? != b'\0' {}
        let bytes = &self.stream[start..(self.pc - 1)];

        if !bytes.is_ascii() {
            return Err(AmlError::MalformedStream);
        }
        Ok(bytes.iter().map(|&b| b as char).collect())
    }
}

/// Whether a byte starts a `NameString`.
pub(crate) fn is_name_start(byte: u8) -> bool {
    namespace::is_lead_name_char(byte)
        || matches!(byte, ROOT_CHAR | PARENT_PREFIX_CHAR | DUAL_NAME_PREFIX | MULTI_NAME_PREFIX)
}
