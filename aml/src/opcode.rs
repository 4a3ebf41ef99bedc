/// The kind of each operand an opcode expects, in encoding order. The walk loop uses this to decide how to decode
/// the next thing in the stream: a `TermArg` is evaluated, while a `SuperName` or `Target` only names somewhere to
/// store to.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum ArgKind {
    TermArg,
    SuperName,
    /// A `SuperName`, or a `NullName` meaning "discard the result".
    Target,
    NameString,
    ByteData,
    WordData,
    DWordData,
}

use ArgKind::*;

/// Enough `TermArg`s for the longest argument list of a method call.
pub(crate) const TERM_ARGS: [ArgKind; 7] = [TermArg; 7];

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Opcode {
    Zero,
    One,
    Alias,
    Name,
    BytePrefix,
    WordPrefix,
    DWordPrefix,
    StringPrefix,
    QWordPrefix,
    Scope,
    Buffer,
    Package,
    VarPackage,
    Method,
    External,
    Mutex,
    Event,
    CondRefOf,
    CreateField,
    LoadTable,
    Load,
    Stall,
    Sleep,
    Acquire,
    Signal,
    Wait,
    Reset,
    Release,
    FromBCD,
    ToBCD,
    Revision,
    Debug,
    Fatal,
    Timer,
    OpRegion,
    Field,
    Device,
    Processor,
    PowerRes,
    ThermalZone,
    IndexField,
    BankField,
    DataRegion,
    Local(u8),
    Arg(u8),
    Store,
    RefOf,
    Add,
    Concat,
    Subtract,
    Increment,
    Decrement,
    Multiply,
    Divide,
    ShiftLeft,
    ShiftRight,
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Not,
    FindSetLeftBit,
    FindSetRightBit,
    DerefOf,
    ConcatRes,
    Mod,
    Notify,
    SizeOf,
    Index,
    Match,
    CreateDWordField,
    CreateWordField,
    CreateByteField,
    CreateBitField,
    ObjectType,
    CreateQWordField,
    LAnd,
    LOr,
    LNot,
    LNotEqual,
    LLessEqual,
    LGreaterEqual,
    LEqual,
    LGreater,
    LLess,
    ToBuffer,
    ToDecimalString,
    ToHexString,
    ToInteger,
    ToString,
    CopyObject,
    Mid,
    Continue,
    If,
    Else,
    While,
    Noop,
    Return,
    Break,
    Breakpoint,
    Ones,
}

impl Opcode {
    /// Decode a (possibly extended, or `0x92`-prefixed) opcode.
    pub(crate) fn decode(opcode: u16) -> Option<Opcode> {
        Some(match opcode {
            0x00 => Opcode::Zero,
            0x01 => Opcode::One,
            0x06 => Opcode::Alias,
            0x08 => Opcode::Name,
            0x0a => Opcode::BytePrefix,
            0x0b => Opcode::WordPrefix,
            0x0c => Opcode::DWordPrefix,
            0x0d => Opcode::StringPrefix,
            0x0e => Opcode::QWordPrefix,
            0x10 => Opcode::Scope,
            0x11 => Opcode::Buffer,
            0x12 => Opcode::Package,
            0x13 => Opcode::VarPackage,
            0x14 => Opcode::Method,
            0x15 => Opcode::External,
            0x5b01 => Opcode::Mutex,
            0x5b02 => Opcode::Event,
            0x5b12 => Opcode::CondRefOf,
            0x5b13 => Opcode::CreateField,
            0x5b1f => Opcode::LoadTable,
            0x5b20 => Opcode::Load,
            0x5b21 => Opcode::Stall,
            0x5b22 => Opcode::Sleep,
            0x5b23 => Opcode::Acquire,
            0x5b24 => Opcode::Signal,
            0x5b25 => Opcode::Wait,
            0x5b26 => Opcode::Reset,
            0x5b27 => Opcode::Release,
            0x5b28 => Opcode::FromBCD,
            0x5b29 => Opcode::ToBCD,
            0x5b30 => Opcode::Revision,
            0x5b31 => Opcode::Debug,
            0x5b32 => Opcode::Fatal,
            0x5b33 => Opcode::Timer,
            0x5b80 => Opcode::OpRegion,
            0x5b81 => Opcode::Field,
            0x5b82 => Opcode::Device,
            0x5b83 => Opcode::Processor,
            0x5b84 => Opcode::PowerRes,
            0x5b85 => Opcode::ThermalZone,
            0x5b86 => Opcode::IndexField,
            0x5b87 => Opcode::BankField,
            0x5b88 => Opcode::DataRegion,
            0x60..=0x67 => Opcode::Local(opcode as u8 - 0x60),
            0x68..=0x6e => Opcode::Arg(opcode as u8 - 0x68),
            0x70 => Opcode::Store,
            0x71 => Opcode::RefOf,
            0x72 => Opcode::Add,
            0x73 => Opcode::Concat,
            0x74 => Opcode::Subtract,
            0x75 => Opcode::Increment,
            0x76 => Opcode::Decrement,
            0x77 => Opcode::Multiply,
            0x78 => Opcode::Divide,
            0x79 => Opcode::ShiftLeft,
            0x7a => Opcode::ShiftRight,
            0x7b => Opcode::And,
            0x7c => Opcode::Nand,
            0x7d => Opcode::Or,
            0x7e => Opcode::Nor,
            0x7f => Opcode::Xor,
            0x80 => Opcode::Not,
            0x81 => Opcode::FindSetLeftBit,
            0x82 => Opcode::FindSetRightBit,
            0x83 => Opcode::DerefOf,
            0x84 => Opcode::ConcatRes,
            0x85 => Opcode::Mod,
            0x86 => Opcode::Notify,
            0x87 => Opcode::SizeOf,
            0x88 => Opcode::Index,
            0x89 => Opcode::Match,
            0x8a => Opcode::CreateDWordField,
            0x8b => Opcode::CreateWordField,
            0x8c => Opcode::CreateByteField,
            0x8d => Opcode::CreateBitField,
            0x8e => Opcode::ObjectType,
            0x8f => Opcode::CreateQWordField,
            0x90 => Opcode::LAnd,
            0x91 => Opcode::LOr,
            0x92 => Opcode::LNot,
            0x9293 => Opcode::LNotEqual,
            0x9294 => Opcode::LLessEqual,
            0x9295 => Opcode::LGreaterEqual,
            0x93 => Opcode::LEqual,
            0x94 => Opcode::LGreater,
            0x95 => Opcode::LLess,
            0x96 => Opcode::ToBuffer,
            0x97 => Opcode::ToDecimalString,
            0x98 => Opcode::ToHexString,
            0x99 => Opcode::ToInteger,
            0x9c => Opcode::ToString,
            0x9d => Opcode::CopyObject,
            0x9e => Opcode::Mid,
            0x9f => Opcode::Continue,
            0xa0 => Opcode::If,
            0xa1 => Opcode::Else,
            0xa2 => Opcode::While,
            0xa3 => Opcode::Noop,
            0xa4 => Opcode::Return,
            0xa5 => Opcode::Break,
            0xcc => Opcode::Breakpoint,
            0xff => Opcode::Ones,
            _ => return None,
        })
    }

    /// The operands of opcodes that are executed once all of their operands have been collected. Opcodes with
    /// a `PkgLength`, or with operands that aren't independent of each other, are decoded by hand and return
    /// `None`.
    pub(crate) fn arg_kinds(&self) -> Option<&'static [ArgKind]> {
        Some(match self {
            Opcode::Name => &[NameString, TermArg],
            Opcode::Mutex => &[NameString, ByteData],
            Opcode::Event => &[NameString],
            Opcode::OpRegion => &[NameString, ByteData, TermArg, TermArg],
            Opcode::DataRegion => &[NameString, TermArg, TermArg, TermArg],
            Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField => &[TermArg, TermArg, NameString],
            Opcode::CreateField => &[TermArg, TermArg, TermArg, NameString],
            Opcode::Load => &[NameString, Target],
            Opcode::LoadTable => &[TermArg, TermArg, TermArg, TermArg, TermArg, TermArg],

            Opcode::Store => &[TermArg, SuperName],
            Opcode::CopyObject => &[TermArg, Target],
            Opcode::RefOf => &[SuperName],
            Opcode::CondRefOf => &[SuperName, Target],
            Opcode::DerefOf => &[TermArg],
            Opcode::SizeOf => &[SuperName],
            Opcode::ObjectType => &[SuperName],
            Opcode::Index => &[TermArg, TermArg, Target],
            Opcode::Match => &[TermArg, ByteData, TermArg, ByteData, TermArg, TermArg],

            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::And
            | Opcode::Nand
            | Opcode::Or
            | Opcode::Nor
            | Opcode::Xor
            | Opcode::Mod
            | Opcode::Concat
            | Opcode::ConcatRes => &[TermArg, TermArg, Target],
            Opcode::Divide => &[TermArg, TermArg, Target, Target],
            Opcode::Increment | Opcode::Decrement => &[SuperName],
            Opcode::Not
            | Opcode::FindSetLeftBit
            | Opcode::FindSetRightBit
            | Opcode::FromBCD
            | Opcode::ToBCD
            | Opcode::ToBuffer
            | Opcode::ToDecimalString
            | Opcode::ToHexString
            | Opcode::ToInteger => &[TermArg, Target],
            Opcode::ToString => &[TermArg, TermArg, Target],
            Opcode::Mid => &[TermArg, TermArg, TermArg, Target],

            Opcode::LAnd
            | Opcode::LOr
            | Opcode::LEqual
            | Opcode::LNotEqual
            | Opcode::LLess
            | Opcode::LLessEqual
            | Opcode::LGreater
            | Opcode::LGreaterEqual => &[TermArg, TermArg],
            Opcode::LNot => &[TermArg],

            Opcode::Notify => &[SuperName, TermArg],
            Opcode::Sleep | Opcode::Stall => &[TermArg],
            Opcode::Acquire => &[SuperName, WordData],
            Opcode::Release | Opcode::Signal | Opcode::Reset => &[SuperName],
            Opcode::Wait => &[SuperName, TermArg],
            Opcode::Fatal => &[ByteData, DWordData, TermArg],
            Opcode::Return => &[TermArg],

            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        assert_eq!(Opcode::decode(0x5b23), Some(Opcode::Acquire));
        assert_eq!(Opcode::decode(0x63), Some(Opcode::Local(3)));
        assert_eq!(Opcode::decode(0x6e), Some(Opcode::Arg(6)));
        assert_eq!(Opcode::decode(0x9295), Some(Opcode::LGreaterEqual));
        assert_eq!(Opcode::decode(0x02), None);
        assert_eq!(Opcode::decode(0x5bff), None);
    }

    #[test]
    fn arg_kinds() {
        assert_eq!(Opcode::Divide.arg_kinds(), Some(&[TermArg, TermArg, Target, Target][..]));
        assert_eq!(Opcode::Acquire.arg_kinds(), Some(&[SuperName, WordData][..]));
        assert_eq!(Opcode::Scope.arg_kinds(), None);
        assert_eq!(Opcode::Package.arg_kinds(), None);
    }
}
