use crate::{
    object::{Object, ObjectType, ReferenceKind, WrappedObject},
    walk::{MethodContext, Target},
    AmlError,
    Interpreter,
    Operation,
};
use alloc::collections::BTreeSet;
use core::mem;
use log::info;

impl Interpreter {
    /// Follow a chain of references to the object at the end of it. `Index` references to packages resolve to
    /// the element itself; those to buffers and strings resolve to a new integer holding the byte.
    pub(crate) fn resolve_to_value(&self, object: WrappedObject) -> Result<WrappedObject, AmlError> {
        let mut visited = BTreeSet::new();
        let mut current = object;

        loop {
            let (kind, inner) = match *current.lock() {
                Object::Reference { kind, ref inner } => (kind, inner.clone()),
                _ => return Ok(current.clone()),
            };
            if !visited.insert(current.addr()) {
                return Err(AmlError::CircularReference);
            }

            current = match kind {
                ReferenceKind::Index(index) => self.index_element(&inner, index)?,
                _ => inner,
            };
        }
    }

    fn index_element(&self, container: &WrappedObject, index: usize) -> Result<WrappedObject, AmlError> {
        let element = match *container.lock() {
            Object::Package(ref elements) => elements.get(index).ok_or(AmlError::PackageLimit)?.clone(),
            Object::Buffer(ref bytes) | Object::String(ref bytes) => {
                return Ok(Object::Integer(*bytes.get(index).ok_or(AmlError::BufferLimit)? as u64).wrap())
            }
            ref other => return Err(AmlError::InvalidOperationOnObject { op: Operation::Index, typ: other.typ() }),
        };

        if let Object::Uninitialized = *element.lock() {
            return Err(AmlError::UninitializedElement);
        }
        Ok(element)
    }

    /// The type of the object at the end of any chain of references.
    pub(crate) fn resolve_object_type(&self, object: &WrappedObject) -> Result<ObjectType, AmlError> {
        let container = match *object.lock() {
            Object::Reference { kind: ReferenceKind::Index(_), ref inner } => Some(inner.clone()),
            _ => None,
        };
        if let Some(container) = container {
            // An `Index` stored back into the object it indexes
            if container.ptr_eq(object) {
                return Err(AmlError::CircularReference);
            }
            if let ObjectType::Buffer | ObjectType::String = container.typ() {
                return Ok(ObjectType::BufferField);
            }
        }
        Ok(self.resolve_to_value(object.clone())?.typ())
    }

    /// Read the current value of somewhere that can be stored to.
    pub(crate) fn read_target(&self, context: &MethodContext, target: &Target) -> Result<WrappedObject, AmlError> {
        match target {
            Target::Local(n) => Ok(context.locals[*n as usize].clone()),
            Target::Arg(n) => {
                let arg = context.args.get(*n as usize).cloned().unwrap_or_else(|| Object::Uninitialized.wrap());
                let is_reference = matches!(*arg.lock(), Object::Reference { .. });
                if is_reference {
                    let value = self.resolve_to_value(arg)?;
                    self.read_if_field(value)
                } else {
                    Ok(arg)
                }
            }
            Target::Name(_, object) => self.read_if_field(object.clone()),
            Target::Object(object) => {
                let value = self.resolve_to_value(object.clone())?;
                self.read_if_field(value)
            }
            Target::Null | Target::Debug => Err(AmlError::OperandType),
        }
    }

    /// Store `value` to `target`, following the implicit conversion rules.
    pub(crate) fn store(
        &self,
        context: &mut MethodContext,
        value: WrappedObject,
        target: &Target,
    ) -> Result<(), AmlError> {
        match target {
            Target::Null => Ok(()),
            Target::Debug => {
                info!("[AML DEBUG] {}", *value.lock());
                self.handler.handle_debug(&value);
                Ok(())
            }
            Target::Local(n) => {
                context.locals[*n as usize] = value.deep_copy()?;
                Ok(())
            }
            Target::Arg(n) => {
                let n = *n as usize;
                let reference = match context.args.get(n) {
                    Some(arg) => match *arg.lock() {
                        Object::Reference { kind, ref inner } => Some((kind, inner.clone())),
                        _ => None,
                    },
                    None => None,
                };

                // Args holding a reference are stored through
                match reference {
                    Some((ReferenceKind::Index(index), container)) => self.store_index(&container, index, value),
                    Some((_, inner)) => self.store_to_object(&inner, value),
                    None => {
                        if context.args.len() <= n {
                            context.args.resize_with(n + 1, || Object::Uninitialized.wrap());
                        }
                        context.args[n] = value.deep_copy()?;
                        Ok(())
                    }
                }
            }
            Target::Name(_, object) | Target::Object(object) => {
                let reference = match *object.lock() {
                    Object::Reference { kind, ref inner } => Some((kind, inner.clone())),
                    _ => None,
                };
                match reference {
                    Some((ReferenceKind::Index(index), container)) => self.store_index(&container, index, value),
                    Some((_, inner)) => self.store_to_object(&inner, value),
                    None => self.store_to_object(object, value),
                }
            }
        }
    }

    /// Store to a named object. Integers, strings and buffers keep their type, converting whatever is stored to
    /// them; other objects are replaced by a copy of the value.
    pub(crate) fn store_to_object(&self, target: &WrappedObject, value: WrappedObject) -> Result<(), AmlError> {
        if target.ptr_eq(&value) {
            return Ok(());
        }

        let target_type = target.lock().typ();
        if let ObjectType::FieldUnit | ObjectType::BufferField = target_type {
            return self.write_field(target, &value);
        }

        let converted = {
            let source = value.lock();
            if !source.is_data() {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::Store, typ: source.typ() });
            }
            match target_type {
                ObjectType::Integer => Some(Object::Integer(self.to_integer(&source)?)),
                ObjectType::String => Some(Object::String(self.to_string(&source)?)),
                ObjectType::Buffer => Some(Object::Buffer(self.to_buffer(&source)?)),
                ObjectType::Uninitialized | ObjectType::Package | ObjectType::Reference => None,
                other => return Err(AmlError::InvalidOperationOnObject { op: Operation::Store, typ: other }),
            }
        };

        match converted {
            Some(Object::Buffer(bytes)) => {
                let mut target = target.lock();
                if let Object::Buffer(ref mut existing) = *target {
                    if existing.is_empty() {
                        *existing = bytes;
                    } else {
                        // Buffers keep their length: longer values are truncated, shorter ones zero-extended
                        let length = existing.len();
                        existing.clear();
                        existing.extend_from_slice(&bytes[..usize::min(length, bytes.len())]);
                        existing.resize(length, 0);
                    }
                }
            }
            Some(object) => *target.lock() = object,
            None => {
                let copy = take_copy(&value)?;
                *target.lock() = copy;
            }
        }
        Ok(())
    }

    /// Store to the target of an `Index` reference. Package elements are replaced by the value; bytes of
    /// buffers and strings take the low byte of its integer value.
    pub(crate) fn store_index(&self, container: &WrappedObject, index: usize, value: WrappedObject) -> Result<(), AmlError> {
        let element = match *container.lock() {
            Object::Package(ref elements) => Some(elements.get(index).ok_or(AmlError::PackageLimit)?.clone()),
            Object::Buffer(_) | Object::String(_) => None,
            ref other => return Err(AmlError::InvalidOperationOnObject { op: Operation::Store, typ: other.typ() }),
        };

        match element {
            Some(element) => {
                if element.ptr_eq(&value) {
                    return Ok(());
                }
                let is_data = value.lock().is_data();
                if is_data {
                    let copy = take_copy(&value)?;
                    *element.lock() = copy;
                } else if let Object::Package(ref mut elements) = *container.lock() {
                    if let Some(slot) = elements.get_mut(index) {
                        *slot = value;
                    }
                }
                Ok(())
            }
            None => {
                let byte = self.to_integer(&value.lock())? as u8;
                match *container.lock() {
                    Object::Buffer(ref mut bytes) | Object::String(ref mut bytes) => {
                        *bytes.get_mut(index).ok_or(AmlError::BufferLimit)? = byte;
                    }
                    _ => return Err(AmlError::OperandType),
                }
                Ok(())
            }
        }
    }

    /// `CopyObject`: like a store, but the target takes on the type of the value.
    pub(crate) fn copy_object(
        &self,
        context: &mut MethodContext,
        value: WrappedObject,
        target: &Target,
    ) -> Result<(), AmlError> {
        match target {
            Target::Null | Target::Debug => self.store(context, value, target),
            Target::Local(n) => {
                context.locals[*n as usize] = value.deep_copy()?;
                Ok(())
            }
            Target::Arg(n) => {
                let n = *n as usize;
                if context.args.len() <= n {
                    context.args.resize_with(n + 1, || Object::Uninitialized.wrap());
                }
                context.args[n] = value.deep_copy()?;
                Ok(())
            }
            Target::Name(path, object) => {
                if object.ptr_eq(&value) {
                    return Ok(());
                }
                let is_data = value.lock().is_data();
                if is_data {
                    let copy = take_copy(&value)?;
                    *object.lock() = copy;
                    Ok(())
                } else {
                    self.namespace.lock().insert(path.clone(), value)
                }
            }
            Target::Object(object) => {
                let reference = match *object.lock() {
                    Object::Reference { kind, ref inner } => Some((kind, inner.clone())),
                    _ => None,
                };
                match reference {
                    Some((ReferenceKind::Index(index), container)) => self.store_index(&container, index, value),
                    Some((_, inner)) if !inner.ptr_eq(&value) => {
                        let copy = take_copy(&value)?;
                        *inner.lock() = copy;
                        Ok(())
                    }
                    Some(_) => Ok(()),
                    None if object.ptr_eq(&value) => Ok(()),
                    None => {
                        let copy = take_copy(&value)?;
                        *object.lock() = copy;
                        Ok(())
                    }
                }
            }
        }
    }
}

/// A fresh copy of a data object, unwrapped so it can be moved into an existing object.
fn take_copy(value: &WrappedObject) -> Result<Object, AmlError> {
    {
        let object = value.lock();
        if !object.is_data() {
            return Err(AmlError::InvalidOperationOnObject { op: Operation::Store, typ: object.typ() });
        }
    }
    let copy = value.deep_copy()?;
    let object = mem::replace(&mut *copy.lock(), Object::Uninitialized);
    Ok(object)
}
