//! Reading and writing field units and buffer fields.
//!
//! Fields are accessed in units of their access width, starting from the unit containing the first bit of the
//! field. Bits of a unit that lie outside the field are handled according to the field's update rule on writes.

use crate::{
    object::{align_down, copy_bits, BufferField, FieldUnit, FieldUnitKind, FieldUpdateRule, Object, WrappedObject},
    AmlError,
    Interpreter,
    Operation,
};
use alloc::vec;
use byteorder::{ByteOrder, LittleEndian};

impl Interpreter {
    /// Fields and buffer fields evaluate to their contents when read. Any other object is returned as-is.
    pub(crate) fn read_if_field(&self, object: WrappedObject) -> Result<WrappedObject, AmlError> {
        let field = match *object.lock() {
            Object::FieldUnit(ref field) => Some(field.clone()),
            Object::BufferField(_) => None,
            _ => return Ok(object.clone()),
        };

        match field {
            Some(field) => self.read_field(&field),
            None => {
                self.evaluate_buffer_field(&object)?;
                self.read_buffer_field(&object)
            }
        }
    }

    /// Write `value` to a field unit or buffer field.
    pub(crate) fn write_field(&self, target: &WrappedObject, value: &WrappedObject) -> Result<(), AmlError> {
        let field = match *target.lock() {
            Object::FieldUnit(ref field) => Some(field.clone()),
            Object::BufferField(_) => None,
            ref other => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::WriteField, typ: other.typ() })
            }
        };
        let bytes = self.to_buffer(&value.lock())?;

        match field {
            Some(field) => self.with_field_lock(&field, || self.write_field_units(&field, &bytes)),
            None => {
                self.evaluate_buffer_field(target)?;
                target.lock().write_buffer_field(&bytes)
            }
        }
    }

    fn read_buffer_field(&self, object: &WrappedObject) -> Result<WrappedObject, AmlError> {
        let object = object.lock();
        let length = match *object {
            Object::BufferField(BufferField::Ready { length, .. }) => length,
            ref other => {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::ReadBufferField, typ: other.typ() })
            }
        };

        if length <= self.integer_size * 8 {
            let mut bytes = [0u8; 8];
            object.read_buffer_field(&mut bytes)?;
            Ok(Object::Integer(LittleEndian::read_u64(&bytes)).wrap())
        } else {
            let size = length.div_ceil(8);
            self.check_size(size)?;
            let mut bytes = vec![0u8; size];
            object.read_buffer_field(&mut bytes)?;
            Ok(Object::Buffer(bytes).wrap())
        }
    }

    fn read_field(&self, field: &FieldUnit) -> Result<WrappedObject, AmlError> {
        let size = field.bit_length.div_ceil(8);
        self.check_size(size)?;

        let mut output = vec![0u8; usize::max(size, 8)];
        self.with_field_lock(field, || self.read_field_units(field, &mut output))?;

        if field.bit_length <= self.integer_size * 8 {
            Ok(Object::Integer(LittleEndian::read_u64(&output)).wrap())
        } else {
            output.truncate(size);
            Ok(Object::Buffer(output).wrap())
        }
    }

    /// Fields with the lock rule set are accessed while holding the Global Lock.
    fn with_field_lock<F, R>(&self, field: &FieldUnit, f: F) -> Result<R, AmlError>
    where
        F: FnOnce() -> Result<R, AmlError>,
    {
        if !field.flags.lock_rule() {
            return f();
        }

        self.global_lock.acquire(self, 0xffff)?;
        let result = f();
        self.global_lock.release(self)?;
        result
    }

    fn read_field_units(&self, field: &FieldUnit, output: &mut [u8]) -> Result<(), AmlError> {
        let access_bits = field.flags.access_type_bytes()? * 8;
        let field_end = field.bit_index + field.bit_length;

        let mut unit_offset = align_down(field.bit_index, access_bits);
        while unit_offset < field_end {
            let value = self.read_unit(field, unit_offset / 8, access_bits)?;

            let start = usize::max(unit_offset, field.bit_index);
            let end = usize::min(unit_offset + access_bits, field_end);
            copy_bits(&value.to_le_bytes(), start - unit_offset, output, start - field.bit_index, end - start);

            unit_offset += access_bits;
        }
        Ok(())
    }

    fn write_field_units(&self, field: &FieldUnit, value: &[u8]) -> Result<(), AmlError> {
        let access_bits = field.flags.access_type_bytes()? * 8;
        let field_end = field.bit_index + field.bit_length;

        let mut unit_offset = align_down(field.bit_index, access_bits);
        while unit_offset < field_end {
            let start = usize::max(unit_offset, field.bit_index);
            let end = usize::min(unit_offset + access_bits, field_end);

            let initial = if end - start == access_bits {
                0
            } else {
                match field.flags.update_rule() {
                    FieldUpdateRule::Preserve => self.read_unit(field, unit_offset / 8, access_bits)?,
                    FieldUpdateRule::WriteAsOnes => u64::MAX,
                    FieldUpdateRule::WriteAsZeros => 0,
                }
            };

            let mut unit = initial.to_le_bytes();
            copy_bits(value, start - field.bit_index, &mut unit, start - unit_offset, end - start);
            let unit = LittleEndian::read_u64(&unit) & unit_mask(access_bits);
            self.write_unit(field, unit_offset / 8, access_bits, unit)?;

            unit_offset += access_bits;
        }
        Ok(())
    }

    fn read_unit(&self, field: &FieldUnit, byte_offset: usize, access_bits: usize) -> Result<u64, AmlError> {
        match field.kind {
            FieldUnitKind::Normal { ref region } => self.read_region(region, byte_offset as u64, access_bits as u8),
            FieldUnitKind::Bank { ref region, ref bank, bank_value } => {
                self.write_field(bank, &Object::Integer(bank_value).wrap())?;
                self.read_region(region, byte_offset as u64, access_bits as u8)
            }
            FieldUnitKind::Index { ref index, ref data } => {
                self.write_field(index, &Object::Integer(byte_offset as u64).wrap())?;
                let value = self.read_if_field(data.clone())?;
                let value = self.to_integer(&value.lock())?;
                Ok(value)
            }
        }
    }

    fn write_unit(&self, field: &FieldUnit, byte_offset: usize, access_bits: usize, value: u64) -> Result<(), AmlError> {
        match field.kind {
            FieldUnitKind::Normal { ref region } => {
                self.write_region(region, byte_offset as u64, access_bits as u8, value)
            }
            FieldUnitKind::Bank { ref region, ref bank, bank_value } => {
                self.write_field(bank, &Object::Integer(bank_value).wrap())?;
                self.write_region(region, byte_offset as u64, access_bits as u8, value)
            }
            FieldUnitKind::Index { ref index, ref data } => {
                self.write_field(index, &Object::Integer(byte_offset as u64).wrap())?;
                self.write_field(data, &Object::Integer(value).wrap())
            }
        }
    }
}

fn unit_mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}
