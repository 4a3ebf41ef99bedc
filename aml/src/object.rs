use crate::{
    mutex::{AmlMutex, OsSemaphore},
    op_region::OpRegion,
    opcode::Opcode,
    stream::AmlSpan,
    AmlError,
    Operation,
};
use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use bit_field::BitField;
use bitvec::prelude::*;
use core::fmt;
use spinning_top::{Spinlock, SpinlockGuard};

pub type NativeMethod = dyn Fn(&[WrappedObject]) -> Result<WrappedObject, AmlError> + Send + Sync;

/// Packages nested deeper than this can't be copied or printed. AML has no way to build one without
/// going through a `Reference`, which is never followed by either operation.
const MAX_COPY_DEPTH: usize = 256;

pub enum Object {
    Uninitialized,
    Buffer(Vec<u8>),
    BufferField(BufferField),
    Device,
    Event(OsSemaphore),
    FieldUnit(FieldUnit),
    Integer(u64),
    Method(Method),
    NativeMethod { f: Arc<NativeMethod>, flags: MethodFlags },
    Mutex(AmlMutex),
    Reference { kind: ReferenceKind, inner: WrappedObject },
    OpRegion(OpRegion),
    Package(Vec<WrappedObject>),
    PowerResource { system_level: u8, resource_order: u16 },
    Processor { proc_id: u8, pblk_address: u32, pblk_length: u8 },
    /// The bytes of a string, without its null terminator. AML strings are ASCII, but bytes stored into them
    /// through `Index` or a buffer field can be anything.
    String(Vec<u8>),
    ThermalZone,
    Debug,
}

impl Object {
    pub fn native_method<F>(num_args: u8, f: F) -> Object
    where
        F: Fn(&[WrappedObject]) -> Result<WrappedObject, AmlError> + Send + Sync + 'static,
    {
        let mut flags = 0;
        flags.set_bits(0..3, num_args);
        Object::NativeMethod { f: Arc::new(f), flags: MethodFlags(flags) }
    }

    pub fn wrap(self) -> WrappedObject {
        WrappedObject::new(self)
    }

    pub fn as_integer(&self) -> Result<u64, AmlError> {
        if let Object::Integer(value) = self {
            Ok(*value)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Integer, got: self.typ() })
        }
    }

    pub fn as_string(&self) -> Result<&str, AmlError> {
        if let Object::String(value) = self {
            core::str::from_utf8(value).map_err(|_| AmlError::OperandValue)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::String, got: self.typ() })
        }
    }

    pub fn as_buffer(&self) -> Result<&[u8], AmlError> {
        if let Object::Buffer(bytes) = self {
            Ok(bytes)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: self.typ() })
        }
    }

    /// Returns the `ObjectType` of this object. References are not followed here, as that needs cycle
    /// detection; see `Interpreter::resolve_object_type`.
    pub fn typ(&self) -> ObjectType {
        match self {
            Object::Uninitialized => ObjectType::Uninitialized,
            Object::Buffer(_) => ObjectType::Buffer,
            Object::BufferField(_) => ObjectType::BufferField,
            Object::Device => ObjectType::Device,
            Object::Event(_) => ObjectType::Event,
            Object::FieldUnit(_) => ObjectType::FieldUnit,
            Object::Integer(_) => ObjectType::Integer,
            Object::Method(_) => ObjectType::Method,
            Object::NativeMethod { .. } => ObjectType::Method,
            Object::Mutex(_) => ObjectType::Mutex,
            Object::Reference { .. } => ObjectType::Reference,
            Object::OpRegion(_) => ObjectType::OpRegion,
            Object::Package(_) => ObjectType::Package,
            Object::PowerResource { .. } => ObjectType::PowerResource,
            Object::Processor { .. } => ObjectType::Processor,
            Object::String(_) => ObjectType::String,
            Object::ThermalZone => ObjectType::ThermalZone,
            Object::Debug => ObjectType::Debug,
        }
    }

    /// Data objects are copied on store. Everything else (devices, mutexes, methods, regions...) is
    /// shared between every holder.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Object::Uninitialized
                | Object::Integer(_)
                | Object::String(_)
                | Object::Buffer(_)
                | Object::Package(_)
                | Object::Reference { .. }
        )
    }

    pub(crate) fn read_buffer_field(&self, dst: &mut [u8]) -> Result<(), AmlError> {
        let Object::BufferField(BufferField::Ready { buffer, offset, length }) = self else {
            return Err(AmlError::InvalidOperationOnObject { op: Operation::ReadBufferField, typ: self.typ() });
        };
        let buffer = buffer.lock();
        let bytes = match *buffer {
            Object::Buffer(ref bytes) => bytes.as_slice(),
            Object::String(ref string) => string.as_slice(),
            ref other => {
                return Err(AmlError::InvalidOperationOnObject {
                    op: Operation::ReadBufferField,
                    typ: other.typ(),
                })
            }
        };
        if offset + length > bytes.len() * 8 {
            return Err(AmlError::BufferLimit);
        }
        copy_bits(bytes, *offset, dst, 0, *length);
        Ok(())
    }

    pub(crate) fn write_buffer_field(&self, value: &[u8]) -> Result<(), AmlError> {
        let Object::BufferField(BufferField::Ready { buffer, offset, length }) = self else {
            return Err(AmlError::InvalidOperationOnObject { op: Operation::WriteBufferField, typ: self.typ() });
        };
        let mut buffer = buffer.lock();
        match *buffer {
            Object::Buffer(ref mut bytes) | Object::String(ref mut bytes) => {
                if offset + length > bytes.len() * 8 {
                    return Err(AmlError::BufferLimit);
                }
                copy_bits(value, 0, bytes, *offset, *length);
                Ok(())
            }
            ref other => {
                Err(AmlError::InvalidOperationOnObject { op: Operation::WriteBufferField, typ: other.typ() })
            }
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_object(self, f, 0)
    }
}

fn display_object(object: &Object, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    match object {
        Object::Uninitialized => write!(f, "[Uninitialized]"),
        Object::Buffer(bytes) => write!(f, "Buffer({bytes:x?})"),
        Object::BufferField(BufferField::Ready { offset, length, .. }) => {
            write!(f, "BufferField {{ offset: {offset}, length: {length} }}")
        }
        Object::BufferField(BufferField::Deferred { .. }) => write!(f, "BufferField [deferred]"),
        Object::Device => write!(f, "Device"),
        Object::Event(_) => write!(f, "Event"),
        Object::FieldUnit(field) => {
            write!(f, "FieldUnit {{ bit_index: {}, bit_length: {} }}", field.bit_index, field.bit_length)
        }
        Object::Integer(value) => write!(f, "Integer({value})"),
        Object::Method(method) => write!(f, "Method({} args)", method.flags.arg_count()),
        Object::NativeMethod { .. } => write!(f, "NativeMethod"),
        Object::Mutex(mutex) => write!(f, "Mutex(sync_level: {})", mutex.sync_level),
        // The target of a reference is never printed, as references can form cycles
        Object::Reference { kind, .. } => write!(f, "Reference({kind:?})"),
        Object::OpRegion(region) => write!(f, "{region}"),
        Object::Package(elements) => {
            if depth >= MAX_COPY_DEPTH {
                return write!(f, "Package {{ .. }}");
            }
            write!(f, "Package {{ ")?;
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match element.0.try_lock() {
                    Some(element) => display_object(&element, f, depth + 1)?,
                    None => write!(f, "[Busy]")?,
                }
            }
            write!(f, " }}")
        }
        Object::PowerResource { system_level, resource_order } => {
            write!(f, "PowerResource {{ system_level: {system_level}, resource_order: {resource_order} }}")
        }
        Object::Processor { proc_id, .. } => write!(f, "Processor({proc_id})"),
        Object::String(value) => write!(f, "String({:?})", String::from_utf8_lossy(value)),
        Object::ThermalZone => write!(f, "ThermalZone"),
        Object::Debug => write!(f, "Debug"),
    }
}

/// A shared, reference-counted handle to an [`Object`]. Cloning a `WrappedObject` adds a reference, and
/// dropping one releases it; the object is torn down when the last holder lets go.
///
/// The object is protected by a spinlock. It must never be held while another object is locked, unless the
/// two are known to be distinct, as locking the same object twice deadlocks.
#[derive(Clone)]
pub struct WrappedObject(Arc<Spinlock<Object>>);

impl WrappedObject {
    pub fn new(object: Object) -> WrappedObject {
        WrappedObject(Arc::new(Spinlock::new(object)))
    }

    pub fn lock(&self) -> SpinlockGuard<'_, Object> {
        self.0.lock()
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, Object>> {
        self.0.try_lock()
    }

    pub fn ptr_eq(&self, other: &WrappedObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Arc::downgrade(&self.0))
    }

    pub fn typ(&self) -> ObjectType {
        self.lock().typ()
    }

    /// Identity of the underlying object, used for cycle detection.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Make a copy of this object suitable for storing somewhere else. Data objects (including every element
    /// of a package) are copied; references are copied shallowly; everything else is shared.
    pub fn deep_copy(&self) -> Result<WrappedObject, AmlError> {
        self.deep_copy_at(0)
    }

    fn deep_copy_at(&self, depth: usize) -> Result<WrappedObject, AmlError> {
        if depth > MAX_COPY_DEPTH {
            return Err(AmlError::NestingTooDeep);
        }

        let elements = {
            let object = self.lock();
            match *object {
                Object::Uninitialized => return Ok(Object::Uninitialized.wrap()),
                Object::Integer(value) => return Ok(Object::Integer(value).wrap()),
                Object::String(ref value) => return Ok(Object::String(value.clone()).wrap()),
                Object::Buffer(ref bytes) => return Ok(Object::Buffer(bytes.clone()).wrap()),
                Object::Reference { kind, ref inner } => {
                    return Ok(Object::Reference { kind, inner: inner.clone() }.wrap());
                }
                Object::Package(ref elements) => elements.clone(),
                _ => return Ok(self.clone()),
            }
        };

        let mut copied = Vec::new();
        copied.try_reserve_exact(elements.len()).map_err(|_| AmlError::OutOfMemory)?;
        for element in elements {
            copied.push(element.deep_copy_at(depth + 1)?);
        }
        Ok(Object::Package(copied).wrap())
    }
}

impl fmt::Debug for WrappedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_lock() {
            Some(object) => write!(f, "WrappedObject({})", *object),
            None => write!(f, "WrappedObject([Busy])"),
        }
    }
}

#[derive(Clone)]
pub struct WeakObject(Weak<Spinlock<Object>>);

impl WeakObject {
    pub fn upgrade(&self) -> Option<WrappedObject> {
        self.0.upgrade().map(WrappedObject)
    }
}

pub enum BufferField {
    /// The source buffer and index operands have not been evaluated yet. They will be on first access.
    Deferred { op: Opcode, args: AmlSpan, scope: crate::namespace::AmlName },
    Ready { buffer: WrappedObject, offset: usize, length: usize },
}

pub struct Method {
    pub code: AmlSpan,
    pub flags: MethodFlags,
    pub(crate) state: MethodState,
    /// Implicit mutex acquired around invocations of serialized methods. Created on first call.
    pub(crate) serialization: Option<WrappedObject>,
}

#[derive(Clone, PartialEq, Debug)]
pub(crate) enum MethodState {
    Unparsed,
    Parsed,
    Invalid(AmlError),
}

impl Method {
    pub fn new(code: AmlSpan, flags: MethodFlags) -> Method {
        Method { code, flags, state: MethodState::Unparsed, serialization: None }
    }
}

#[derive(Clone, Debug)]
pub struct FieldUnit {
    pub kind: FieldUnitKind,
    pub flags: FieldFlags,
    pub bit_index: usize,
    pub bit_length: usize,
}

#[derive(Clone, Debug)]
pub enum FieldUnitKind {
    Normal { region: WrappedObject },
    Bank { region: WrappedObject, bank: WrappedObject, bank_value: u64 },
    Index { index: WrappedObject, data: WrappedObject },
}

#[derive(Clone, Copy, Debug)]
pub struct FieldFlags(pub u8);

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FieldAccessType {
    Any,
    Byte,
    Word,
    DWord,
    QWord,
    Buffer,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FieldUpdateRule {
    Preserve,
    WriteAsOnes,
    WriteAsZeros,
}

impl FieldFlags {
    pub fn access_type(&self) -> Result<FieldAccessType, AmlError> {
        match self.0.get_bits(0..4) {
            0 => Ok(FieldAccessType::Any),
            1 => Ok(FieldAccessType::Byte),
            2 => Ok(FieldAccessType::Word),
            3 => Ok(FieldAccessType::DWord),
            4 => Ok(FieldAccessType::QWord),
            5 => Ok(FieldAccessType::Buffer),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }

    pub fn access_type_bytes(&self) -> Result<usize, AmlError> {
        match self.access_type()? {
            FieldAccessType::Any | FieldAccessType::Byte | FieldAccessType::Buffer => Ok(1),
            FieldAccessType::Word => Ok(2),
            FieldAccessType::DWord => Ok(4),
            FieldAccessType::QWord => Ok(8),
        }
    }

    pub fn lock_rule(&self) -> bool {
        BitField::get_bit(&self.0, 4)
    }

    pub fn update_rule(&self) -> FieldUpdateRule {
        match self.0.get_bits(5..7) {
            1 => FieldUpdateRule::WriteAsOnes,
            2 => FieldUpdateRule::WriteAsZeros,
            // 3 is reserved
            _ => FieldUpdateRule::Preserve,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct MethodFlags(pub u8);

impl MethodFlags {
    pub fn arg_count(&self) -> usize {
        self.0.get_bits(0..3) as usize
    }

    pub fn serialize(&self) -> bool {
        BitField::get_bit(&self.0, 3)
    }

    pub fn sync_level(&self) -> u8 {
        self.0.get_bits(4..8)
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ReferenceKind {
    RefOf,
    /// Created by `RefOf` on a local or argument. Dereferences exactly like `RefOf`.
    Local(u8),
    Arg(u8),
    /// A reference to an element of a package, or a byte of a buffer or string.
    Index(usize),
    /// A bare name inside a package, resolved when the package was built.
    Named,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ObjectType {
    Uninitialized,
    Buffer,
    BufferField,
    Device,
    Event,
    FieldUnit,
    Integer,
    Method,
    Mutex,
    Reference,
    OpRegion,
    Package,
    PowerResource,
    Processor,
    String,
    ThermalZone,
    Debug,
}

impl ObjectType {
    /// The value returned by `ObjectTypeOp` for this type (ACPI §19.6.97).
    pub fn acpi_type_code(&self) -> u64 {
        match self {
            ObjectType::Uninitialized => 0,
            ObjectType::Integer => 1,
            ObjectType::String => 2,
            ObjectType::Buffer => 3,
            ObjectType::Package => 4,
            ObjectType::FieldUnit => 5,
            ObjectType::Device => 6,
            ObjectType::Event => 7,
            ObjectType::Method => 8,
            ObjectType::Mutex => 9,
            ObjectType::OpRegion => 10,
            ObjectType::PowerResource => 11,
            ObjectType::Processor => 12,
            ObjectType::ThermalZone => 13,
            ObjectType::BufferField => 14,
            ObjectType::Debug => 16,
            // References are followed before this is asked
            ObjectType::Reference => 0,
        }
    }
}

/// Copy an arbitrary bit range of `src` to an arbitrary bit range of `dst`. Data is zero-extended if `src` does
/// not cover `length` bits, and bits that would land past the end of `dst` are dropped.
pub(crate) fn copy_bits(src: &[u8], src_index: usize, dst: &mut [u8], dst_index: usize, length: usize) {
    let src_bits = src.view_bits::<Lsb0>();
    let dst_bits = dst.view_bits_mut::<Lsb0>();

    let length = usize::min(length, dst_bits.len().saturating_sub(dst_index));
    if length == 0 {
        return;
    }
    let available = usize::min(length, src_bits.len().saturating_sub(src_index));

    if available > 0 {
        dst_bits[dst_index..(dst_index + available)].clone_from_bitslice(&src_bits[src_index..(src_index + available)]);
    }
    dst_bits[(dst_index + available)..(dst_index + length)].fill(false);
}

#[inline]
pub(crate) fn align_down(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        // `align` is always a power of two here
        value & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_copy_bits() {
        let src = [0b1011_1111, 0b1111_0111, 0b1111_1111, 0b1111_1111, 0b1111_1111];
        let mut dst = [0b1110_0001, 0, 0, 0, 0];

        copy_bits(&src, 0, &mut dst, 2, 15);
        assert_eq!(dst, [0b1111_1101, 0b1101_1110, 0b0000_0001, 0b0000_0000, 0b0000_0000]);
    }

    #[test]
    fn copy_bits_zero_extends_short_source() {
        let mut dst = [0xff; 4];
        copy_bits(&[0xab], 0, &mut dst, 0, 32);
        assert_eq!(dst, [0xab, 0, 0, 0]);
    }

    #[test]
    fn copy_bits_clamps_to_destination() {
        let mut dst = [0u8; 1];
        copy_bits(&[0xff, 0xff], 0, &mut dst, 4, 12);
        assert_eq!(dst, [0xf0]);
    }

    #[test]
    fn buffer_fields_write_raw_bytes_into_strings() {
        let string = Object::String("abc".into()).wrap();
        let field = Object::BufferField(BufferField::Ready { buffer: string.clone(), offset: 8, length: 8 });
        field.write_buffer_field(&[0xe9]).unwrap();

        assert!(matches!(*string.lock(), Object::String(ref bytes) if bytes == &[b'a', 0xe9, b'c']));
        assert_eq!(string.lock().as_string(), Err(AmlError::OperandValue));
    }

    #[test]
    fn deep_copy_shares_non_data_objects() {
        let device = Object::Device.wrap();
        let package = Object::Package(vec![Object::Integer(4).wrap(), device.clone()]).wrap();

        let copy = package.deep_copy().unwrap();
        assert!(!copy.ptr_eq(&package));

        let copied = match *copy.lock() {
            Object::Package(ref elements) => elements.clone(),
            _ => panic!(),
        };
        let original = match *package.lock() {
            Object::Package(ref elements) => elements.clone(),
            _ => panic!(),
        };
        assert!(copied[1].ptr_eq(&device));
        assert!(!copied[0].ptr_eq(&original[0]));
    }

    #[test]
    fn method_flags() {
        let flags = MethodFlags(0b0011_1010);
        assert_eq!(flags.arg_count(), 2);
        assert!(flags.serialize());
        assert_eq!(flags.sync_level(), 3);
    }

    #[test]
    fn reserved_update_rule_is_preserve() {
        assert_eq!(FieldFlags(0b0110_0000).update_rule(), FieldUpdateRule::Preserve);
        assert_eq!(FieldFlags(0b0100_0011).update_rule(), FieldUpdateRule::WriteAsZeros);
        assert_eq!(FieldFlags(0b0100_0011).access_type(), Ok(FieldAccessType::DWord));
        assert!(FieldFlags(0x0f).access_type().is_err());
    }
}
