//! Execution of ops once all of their operands are known.

use crate::{
    convert::{from_bcd, to_bcd},
    mutex::{AmlMutex, OsSemaphore},
    namespace::AmlName,
    object::{BufferField, Object, ObjectType, ReferenceKind, WrappedObject},
    op_region::{OpRegion, RegionSpace},
    opcode::Opcode,
    walk::{Argument, MethodContext, Target},
    AmlError,
    Interpreter,
    Operation,
};
use alloc::{string::String, vec::Vec};
use core::{cmp::Ordering, str::FromStr};
use log::trace;

impl Interpreter {
    pub(crate) fn exec_op(
        &self,
        context: &mut MethodContext,
        op: Opcode,
        args: Vec<Argument>,
    ) -> Result<WrappedObject, AmlError> {
        trace!("Executing {:?}", op);

        match op {
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
            | Opcode::Mod => {
                let left = self.integer_operand(&args, 0)?;
                let right = self.integer_operand(&args, 1)?;
                let result = match op {
                    Opcode::Add => left.wrapping_add(right),
                    Opcode::Subtract => left.wrapping_sub(right),
                    Opcode::Multiply => left.wrapping_mul(right),
                    Opcode::ShiftLeft => left.checked_shl(shift_amount(right)).unwrap_or(0),
                    Opcode::ShiftRight => left.checked_shr(shift_amount(right)).unwrap_or(0),
                    Opcode::And => left & right,
                    Opcode::Nand => !(left & right),
                    Opcode::Or => left | right,
                    Opcode::Nor => !(left | right),
                    Opcode::Xor => left ^ right,
                    _ => left.checked_rem(right).ok_or(AmlError::DivideByZero)?,
                };
                self.store_result(context, Object::Integer(self.mask(result)), target(&args, 2)?)
            }
            Opcode::Divide => {
                let dividend = self.integer_operand(&args, 0)?;
                let divisor = self.integer_operand(&args, 1)?;
                let quotient = dividend.checked_div(divisor).ok_or(AmlError::DivideByZero)?;
                let remainder = dividend % divisor;

                self.store(context, Object::Integer(remainder).wrap(), target(&args, 2)?)?;
                self.store_result(context, Object::Integer(quotient), target(&args, 3)?)
            }
            Opcode::Not => {
                let value = self.integer_operand(&args, 0)?;
                self.store_result(context, Object::Integer(self.mask(!value)), target(&args, 1)?)
            }
            Opcode::FindSetLeftBit => {
                let value = self.integer_operand(&args, 0)?;
                let result = if value == 0 { 0 } else { 64 - value.leading_zeros() as u64 };
                self.store_result(context, Object::Integer(result), target(&args, 1)?)
            }
            Opcode::FindSetRightBit => {
                let value = self.integer_operand(&args, 0)?;
                let result = if value == 0 { 0 } else { value.trailing_zeros() as u64 + 1 };
                self.store_result(context, Object::Integer(result), target(&args, 1)?)
            }
            Opcode::FromBCD => {
                let value = from_bcd(self.integer_operand(&args, 0)?)?;
                self.store_result(context, Object::Integer(value), target(&args, 1)?)
            }
            Opcode::ToBCD => {
                let value = to_bcd(self.integer_operand(&args, 0)?, self.integer_size)?;
                self.store_result(context, Object::Integer(value), target(&args, 1)?)
            }
            Opcode::Increment | Opcode::Decrement => {
                let target = target(&args, 0)?;
                let value = self.read_target(context, target)?;
                let value = self.to_integer(&value.lock())?;
                let value = if op == Opcode::Increment { value.wrapping_add(1) } else { value.wrapping_sub(1) };
                self.store_result(context, Object::Integer(self.mask(value)), target)
            }

            Opcode::ToBuffer => {
                let value = self.to_buffer_explicit(&operand(&args, 0)?.lock())?;
                self.store_result(context, Object::Buffer(value), target(&args, 1)?)
            }
            Opcode::ToDecimalString => {
                let value = self.to_decimal_string(&operand(&args, 0)?.lock())?;
                self.store_result(context, Object::String(value), target(&args, 1)?)
            }
            Opcode::ToHexString => {
                let value = self.to_hex_string(&operand(&args, 0)?.lock())?;
                self.store_result(context, Object::String(value), target(&args, 1)?)
            }
            Opcode::ToInteger => {
                let value = self.to_integer_explicit(&operand(&args, 0)?.lock())?;
                self.store_result(context, Object::Integer(value), target(&args, 1)?)
            }
            Opcode::ToString => {
                let bytes = self.to_buffer(&operand(&args, 0)?.lock())?;
                let limit = usize::try_from(self.integer_operand(&args, 1)?).unwrap_or(usize::MAX);
                let string: Vec<u8> = bytes.iter().take(limit).take_while(|&&byte| byte != 0).copied().collect();
                self.store_result(context, Object::String(string), target(&args, 2)?)
            }
            Opcode::Mid => {
                let index = usize::try_from(self.integer_operand(&args, 1)?).unwrap_or(usize::MAX);
                let length = usize::try_from(self.integer_operand(&args, 2)?).unwrap_or(usize::MAX);
                let result = {
                    let source = operand(&args, 0)?.lock();
                    match *source {
                        Object::String(ref string) => Object::String(sub_slice(string, index, length).to_vec()),
                        Object::Buffer(ref bytes) => Object::Buffer(sub_slice(bytes, index, length).to_vec()),
                        ref other => {
                            return Err(AmlError::InvalidOperationOnObject { op: Operation::Mid, typ: other.typ() })
                        }
                    }
                };
                self.store_result(context, result, target(&args, 3)?)
            }
            Opcode::Concat => {
                let result = {
                    let left = operand(&args, 0)?.lock();
                    let right = if operand(&args, 0)?.ptr_eq(operand(&args, 1)?) {
                        None
                    } else {
                        Some(operand(&args, 1)?.lock())
                    };
                    self.concatenate(&left, right.as_deref().unwrap_or(&*left))?
                };
                self.store_result(context, result, target(&args, 2)?)
            }
            Opcode::ConcatRes => {
                let left = operand(&args, 0)?.deep_copy()?;
                let right = operand(&args, 1)?.deep_copy()?;
                let result = self.concatenate_resource_templates(&left.lock(), &right.lock())?;
                self.store_result(context, result, target(&args, 2)?)
            }

            Opcode::LAnd | Opcode::LOr => {
                let left = self.integer_operand(&args, 0)? != 0;
                let right = self.integer_operand(&args, 1)? != 0;
                let result = if op == Opcode::LAnd { left && right } else { left || right };
                Ok(self.boolean(result))
            }
            Opcode::LNot => {
                let value = self.integer_operand(&args, 0)?;
                Ok(self.boolean(value == 0))
            }
            Opcode::LEqual
            | Opcode::LNotEqual
            | Opcode::LLess
            | Opcode::LLessEqual
            | Opcode::LGreater
            | Opcode::LGreaterEqual => {
                let ordering = self.compare_operands(operand(&args, 0)?, operand(&args, 1)?)?;
                let result = match op {
                    Opcode::LEqual => ordering == Ordering::Equal,
                    Opcode::LNotEqual => ordering != Ordering::Equal,
                    Opcode::LLess => ordering == Ordering::Less,
                    Opcode::LLessEqual => ordering != Ordering::Greater,
                    Opcode::LGreater => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                Ok(self.boolean(result))
            }

            Opcode::Store => {
                let value = operand(&args, 0)?.clone();
                self.store(context, value.clone(), target(&args, 1)?)?;
                Ok(value)
            }
            Opcode::CopyObject => {
                let value = operand(&args, 0)?.clone();
                self.copy_object(context, value.clone(), target(&args, 1)?)?;
                Ok(value)
            }
            Opcode::RefOf => self.reference_to(context, target(&args, 0)?),
            Opcode::CondRefOf => {
                let source = target(&args, 0)?;
                if let Target::Null = source {
                    return Ok(Object::Integer(0).wrap());
                }
                let reference = self.reference_to(context, source)?;
                self.store(context, reference, target(&args, 1)?)?;
                Ok(Object::Integer(self.ones()).wrap())
            }
            Opcode::DerefOf => self.dereference(context, operand(&args, 0)?),
            Opcode::SizeOf => {
                let value = self.target_object(context, target(&args, 0)?)?;
                let size = match *value.lock() {
                    Object::Buffer(ref bytes) => bytes.len(),
                    Object::String(ref string) => string.len(),
                    Object::Package(ref elements) => elements.len(),
                    ref other => {
                        return Err(AmlError::InvalidOperationOnObject { op: Operation::SizeOf, typ: other.typ() })
                    }
                };
                Ok(Object::Integer(size as u64).wrap())
            }
            Opcode::ObjectType => {
                let typ = match target(&args, 0)? {
                    Target::Local(n) => self.resolve_object_type(&context.locals[*n as usize])?,
                    Target::Arg(n) => match context.args.get(*n as usize) {
                        Some(arg) => self.resolve_object_type(arg)?,
                        None => ObjectType::Uninitialized,
                    },
                    Target::Name(_, object) | Target::Object(object) => self.resolve_object_type(object)?,
                    Target::Debug => ObjectType::Debug,
                    Target::Null => return Err(AmlError::OperandType),
                };
                Ok(Object::Integer(typ.acpi_type_code()).wrap())
            }
            Opcode::Index => {
                let source = self.resolve_to_value(operand(&args, 0)?.clone())?;
                let index = self.integer_operand(&args, 1)?;

                let (length, limit) = match *source.lock() {
                    Object::Package(ref elements) => (elements.len(), AmlError::PackageLimit),
                    Object::Buffer(ref bytes) => (bytes.len(), AmlError::BufferLimit),
                    Object::String(ref string) => (string.len(), AmlError::BufferLimit),
                    ref other => {
                        return Err(AmlError::InvalidOperationOnObject { op: Operation::Index, typ: other.typ() })
                    }
                };
                let index = match usize::try_from(index) {
                    Ok(index) if index < length => index,
                    _ => return Err(limit),
                };

                let reference = Object::Reference { kind: ReferenceKind::Index(index), inner: source }.wrap();
                self.store(context, reference.clone(), target(&args, 2)?)?;
                Ok(reference)
            }
            Opcode::Match => self.do_match(&args),

            Opcode::Notify => {
                let value = self.integer_operand(&args, 1)?;
                match target(&args, 0)? {
                    Target::Name(path, object) => {
                        let typ = object.typ();
                        self.dispatch_notify(path, typ, value)?;
                    }
                    _ => return Err(AmlError::InvalidNotifyTarget),
                }
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Sleep => {
                let milliseconds = self.integer_operand(&args, 0)?;
                self.with_interpreter_unlocked(|| self.handler.sleep(milliseconds))?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Stall => {
                let microseconds = self.integer_operand(&args, 0)?;
                self.with_interpreter_unlocked(|| self.handler.stall(microseconds))?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Acquire => {
                let mutex = self.target_object(context, target(&args, 0)?)?;
                let timeout = self.integer_operand(&args, 1)? as u16;
                let timed_out = self.acquire_mutex(&mutex, timeout)?;
                Ok(self.boolean(timed_out))
            }
            Opcode::Release => {
                let mutex = self.target_object(context, target(&args, 0)?)?;
                self.release_mutex(&mutex)?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Signal => {
                let event = self.target_object(context, target(&args, 0)?)?;
                self.signal_event(&event)?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Wait => {
                let event = self.target_object(context, target(&args, 0)?)?;
                let timeout = self.integer_operand(&args, 1)?;
                let timed_out = self.wait_event(&event, timeout)?;
                Ok(self.boolean(timed_out))
            }
            Opcode::Reset => {
                let event = self.target_object(context, target(&args, 0)?)?;
                self.reset_event(&event)?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Fatal => {
                let fatal_type = self.integer_operand(&args, 0)? as u8;
                let fatal_code = self.integer_operand(&args, 1)? as u32;
                let fatal_arg = self.integer_operand(&args, 2)?;
                self.handler.handle_fatal_error(fatal_type, fatal_code, fatal_arg);
                Err(AmlError::FatalError)
            }

            Opcode::Name => {
                let path = namestring(&args, 0)?.resolve(&context.scope)?;
                let value = operand(&args, 1)?.deep_copy()?;
                self.namespace.lock().insert(path, value)?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Mutex => {
                let path = namestring(&args, 0)?.resolve(&context.scope)?;
                let sync_level = self.integer_operand(&args, 1)? as u8 & 0xf;
                let mutex = Object::Mutex(AmlMutex::new(&self.handler, sync_level)).wrap();
                self.namespace.lock().insert(path, mutex)?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::Event => {
                let path = namestring(&args, 0)?.resolve(&context.scope)?;
                let event = Object::Event(OsSemaphore::new(&self.handler, u32::MAX, 0)).wrap();
                self.namespace.lock().insert(path, event)?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::OpRegion => {
                let path = namestring(&args, 0)?.resolve(&context.scope)?;
                let space = RegionSpace::from(self.integer_operand(&args, 1)? as u8);
                let base = self.integer_operand(&args, 2)?;
                let length = self.integer_operand(&args, 3)?;

                let parent = self.device_scope(&context.scope);
                let region = Object::OpRegion(OpRegion::new(space, base, length, parent)).wrap();
                self.namespace.lock().insert(path, region.clone())?;
                self.pending_regions.lock().push(region);
                self.connect_new_regions()?;
                Ok(Object::Uninitialized.wrap())
            }
            Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField
            | Opcode::CreateField => {
                let buffer = self.resolve_to_value(operand(&args, 0)?.clone())?;
                let index = self.integer_operand(&args, 1)?;
                let (length, name) = if op == Opcode::CreateField {
                    (Some(self.integer_operand(&args, 2)?), namestring(&args, 3)?)
                } else {
                    (None, namestring(&args, 2)?)
                };

                let field = self.buffer_field(op, buffer, index, length)?;
                let path = name.resolve(&context.scope)?;
                self.namespace.lock().insert(path, Object::BufferField(field).wrap())?;
                Ok(Object::Uninitialized.wrap())
            }

            Opcode::Load | Opcode::LoadTable | Opcode::DataRegion => Err(AmlError::Unimplemented),
            _ => Err(AmlError::IllegalOpcode(0)),
        }
    }

    /// Build a buffer field over `buffer`. `index` is in bits for `CreateBitField` and `CreateField`, and in bytes
    /// otherwise.
    pub(crate) fn buffer_field(
        &self,
        op: Opcode,
        buffer: WrappedObject,
        index: u64,
        length: Option<u64>,
    ) -> Result<BufferField, AmlError> {
        let index = usize::try_from(index).map_err(|_| AmlError::BufferLimit)?;
        let (offset, length) = match op {
            Opcode::CreateBitField => (Some(index), 1),
            Opcode::CreateByteField => (index.checked_mul(8), 8),
            Opcode::CreateWordField => (index.checked_mul(8), 16),
            Opcode::CreateDWordField => (index.checked_mul(8), 32),
            Opcode::CreateQWordField => (index.checked_mul(8), 64),
            Opcode::CreateField => {
                let length = length.ok_or(AmlError::MalformedStream)?;
                (Some(index), usize::try_from(length).map_err(|_| AmlError::BufferLimit)?)
            }
            _ => return Err(AmlError::MalformedStream),
        };
        let offset = offset.ok_or(AmlError::BufferLimit)?;
        if length == 0 {
            return Err(AmlError::OperandValue);
        }

        let bits = match *buffer.lock() {
            Object::Buffer(ref bytes) => bytes.len() * 8,
            Object::String(ref string) => string.len() * 8,
            ref other => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::CreateField, typ: other.typ() })
            }
        };
        if offset.checked_add(length).map_or(true, |end| end > bits) {
            return Err(AmlError::BufferLimit);
        }

        Ok(BufferField::Ready { buffer, offset, length })
    }

    /// `Match`. Only integer elements are compared; anything else in the package is skipped.
    fn do_match(&self, args: &[Argument]) -> Result<WrappedObject, AmlError> {
        let package = self.resolve_to_value(operand(args, 0)?.clone())?;
        let first_op = self.integer_operand(args, 1)?;
        let first_value = self.integer_operand(args, 2)?;
        let second_op = self.integer_operand(args, 3)?;
        let second_value = self.integer_operand(args, 4)?;
        let start = self.integer_operand(args, 5)?;

        if first_op > 5 || second_op > 5 {
            return Err(AmlError::OperandValue);
        }
        let elements = match *package.lock() {
            Object::Package(ref elements) => elements.clone(),
            ref other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Package, got: other.typ() })
            }
        };
        let start = match usize::try_from(start) {
            Ok(start) if start < elements.len() => start,
            _ => return Err(AmlError::PackageLimit),
        };

        for (index, element) in elements.iter().enumerate().skip(start) {
            let Object::Integer(element) = *element.lock() else { continue };
            let element = self.mask(element);
            if match_element(first_op, element, first_value) && match_element(second_op, element, second_value) {
                return Ok(Object::Integer(index as u64).wrap());
            }
        }
        Ok(Object::Integer(self.ones()).wrap())
    }

    fn compare_operands(&self, left: &WrappedObject, right: &WrappedObject) -> Result<Ordering, AmlError> {
        if left.ptr_eq(right) {
            return Ok(Ordering::Equal);
        }
        let left = left.lock();
        let right = right.lock();
        self.compare(&left, &right)
    }

    fn reference_to(&self, context: &MethodContext, target: &Target) -> Result<WrappedObject, AmlError> {
        let reference = match target {
            Target::Local(n) => {
                Object::Reference { kind: ReferenceKind::Local(*n), inner: context.locals[*n as usize].clone() }
            }
            Target::Arg(n) => {
                let arg = context.args.get(*n as usize).cloned().unwrap_or_else(|| Object::Uninitialized.wrap());
                Object::Reference { kind: ReferenceKind::Arg(*n), inner: arg }
            }
            Target::Name(_, object) => Object::Reference { kind: ReferenceKind::RefOf, inner: object.clone() },
            Target::Object(object) => {
                if let Object::Reference { .. } = *object.lock() {
                    return Ok(object.clone());
                }
                Object::Reference { kind: ReferenceKind::RefOf, inner: object.clone() }
            }
            Target::Null | Target::Debug => return Err(AmlError::OperandType),
        };
        Ok(reference.wrap())
    }

    fn dereference(&self, context: &MethodContext, object: &WrappedObject) -> Result<WrappedObject, AmlError> {
        let path = match *object.lock() {
            Object::Reference { .. } => None,
            Object::String(ref path) => Some(path.clone()),
            ref other => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::DerefOf, typ: other.typ() })
            }
        };

        let target = match path {
            None => self.resolve_to_value(object.clone())?,
            Some(path) => {
                let name = AmlName::from_str(&String::from_utf8_lossy(&path))?;
                let (_, target) = self.namespace.lock().search(&name, &context.scope)?;
                target
            }
        };
        self.read_if_field(target)
    }

    /// The object a target names, without reading fields. Used by ops that act on the object itself, like
    /// `Acquire`.
    fn target_object(&self, context: &MethodContext, target: &Target) -> Result<WrappedObject, AmlError> {
        let object = match target {
            Target::Local(n) => context.locals[*n as usize].clone(),
            Target::Arg(n) => context.args.get(*n as usize).cloned().unwrap_or_else(|| Object::Uninitialized.wrap()),
            Target::Name(_, object) | Target::Object(object) => object.clone(),
            Target::Null | Target::Debug => return Err(AmlError::OperandType),
        };
        self.resolve_to_value(object)
    }

    fn store_result(&self, context: &mut MethodContext, result: Object, target: &Target) -> Result<WrappedObject, AmlError> {
        let result = result.wrap();
        self.store(context, result.clone(), target)?;
        Ok(result)
    }

    fn integer_operand(&self, args: &[Argument], index: usize) -> Result<u64, AmlError> {
        let object = operand(args, index)?;
        let value = self.to_integer(&object.lock())?;
        Ok(value)
    }

    fn boolean(&self, value: bool) -> WrappedObject {
        Object::Integer(if value { self.ones() } else { 0 }).wrap()
    }
}

fn operand(args: &[Argument], index: usize) -> Result<&WrappedObject, AmlError> {
    args.get(index).ok_or(AmlError::MalformedStream)?.object()
}

fn target(args: &[Argument], index: usize) -> Result<&Target, AmlError> {
    args.get(index).ok_or(AmlError::MalformedStream)?.target()
}

fn namestring(args: &[Argument], index: usize) -> Result<&AmlName, AmlError> {
    args.get(index).ok_or(AmlError::MalformedStream)?.namestring()
}

fn match_element(op: u64, element: u64, value: u64) -> bool {
    const MTR: u64 = 0;
    const MEQ: u64 = 1;
    const MLE: u64 = 2;
    const MLT: u64 = 3;
    const MGE: u64 = 4;

    match op {
        MTR => true,
        MEQ => element == value,
        MLE => element <= value,
        MLT => element < value,
        MGE => element >= value,
        _ => element > value,
    }
}

/// Shifts of the full width of an integer or more clear it.
fn shift_amount(amount: u64) -> u32 {
    u32::try_from(amount).unwrap_or(u32::MAX)
}

fn sub_slice(bytes: &[u8], index: usize, length: usize) -> &[u8] {
    if index >= bytes.len() {
        return &[];
    }
    let end = index.saturating_add(length).min(bytes.len());
    &bytes[index..end]
}
