//! Checking the structure of AML without executing it.
//!
//! Skimming decodes every term of a method body, making sure each op is well-formed and that the body ends exactly
//! where it should, without evaluating anything. It's used to reject broken methods before they are first run,
//! and to find the extent of operands whose evaluation is deferred. The number of arguments a method call takes
//! isn't encoded in the stream, so names are looked up in the namespace as it is when skimming happens; names
//! that can't be found are taken to be objects rather than method calls.

use crate::{
    namespace::{AmlName, NamespaceLevel},
    object::{MethodState, Object, WrappedObject},
    opcode::{ArgKind, Opcode, TERM_ARGS},
    stream::{self, AmlSpan, AmlStream},
    AmlError,
    Interpreter,
};
use alloc::{vec, vec::Vec};
use log::{trace, warn};

#[derive(Clone, Copy, Debug)]
enum Frame {
    /// Terms up to `end`, which the last term must finish exactly on.
    TermList { end: usize },
    Args { kinds: &'static [ArgKind], next: usize },
    /// Package elements up to `end`. Names are never calls here.
    Elements { end: usize },
}

impl Interpreter {
    pub(crate) fn skim_method(&self, code: &AmlSpan, path: &AmlName) -> Result<(), AmlError> {
        let mut stream = AmlStream::new(code);
        let end = stream.end;
        self.skim(&mut stream, path, Frame::TermList { end })
    }

    /// Skip over `count` term args, leaving `stream` after the last of them.
    pub(crate) fn skim_term_args(&self, stream: &mut AmlStream, scope: &AmlName, count: usize) -> Result<(), AmlError> {
        let kinds = TERM_ARGS.get(..count).ok_or(AmlError::MalformedStream)?;
        self.skim(stream, scope, Frame::Args { kinds, next: 0 })
    }

    /// Check the body of every method that hasn't been checked yet. Broken methods are marked as such, and will
    /// fail when invoked, but don't stop the rest of the table being used.
    pub(crate) fn check_all_methods(&self) -> Result<(), AmlError> {
        let mut methods: Vec<(AmlName, WrappedObject)> = Vec::new();
        self.namespace.lock().traverse(|path, level: &NamespaceLevel| {
            for (seg, (_, object)) in level.values.iter() {
                let unparsed =
                    matches!(*object.lock(), Object::Method(ref method) if method.state == MethodState::Unparsed);
                if unparsed {
                    methods.push((AmlName::from_name_seg(*seg).resolve(path)?, object.clone()));
                }
            }
            Ok(true)
        })?;

        for (path, method) in methods {
            let code = match *method.lock() {
                Object::Method(ref inner) => inner.code.clone(),
                _ => continue,
            };

            let state = match self.skim_method(&code, &path) {
                Ok(()) => MethodState::Parsed,
                Err(err) => {
                    warn!("Method {} failed to parse: {:?}", path, err);
                    MethodState::Invalid(err)
                }
            };
            if let Object::Method(ref mut inner) = *method.lock() {
                inner.state = state;
            }
        }

        Ok(())
    }

    fn skim(&self, stream: &mut AmlStream, scope: &AmlName, root: Frame) -> Result<(), AmlError> {
        let mut frames = vec![root];

        while let Some(&frame) = frames.last() {
            match frame {
                Frame::TermList { end } | Frame::Elements { end } => {
                    if stream.pc == end {
                        frames.pop();
                        continue;
                    }
                    if stream.pc > end {
                        return Err(AmlError::MalformedStream);
                    }

                    let mut body = stream.sub_stream(end);
                    if let Frame::Elements { .. } = frame {
                        if stream::is_name_start(body.peek()?) {
                            body.namestring()?;
                            stream.pc = body.pc;
                            continue;
                        }
                    }
                    self.skim_term(&mut body, scope, &mut frames)?;
                    stream.pc = body.pc;
                }
                Frame::Args { kinds, next } => {
                    let Some(&kind) = kinds.get(next) else {
                        frames.pop();
                        continue;
                    };
                    if let Some(Frame::Args { next, .. }) = frames.last_mut() {
                        *next += 1;
                    }

                    match kind {
                        ArgKind::TermArg => self.skim_term(stream, scope, &mut frames)?,
                        ArgKind::SuperName | ArgKind::Target => self.skim_target(stream, scope, &mut frames)?,
                        ArgKind::NameString => {
                            stream.namestring()?;
                        }
                        ArgKind::ByteData => {
                            stream.next()?;
                        }
                        ArgKind::WordData => {
                            stream.next_u16()?;
                        }
                        ArgKind::DWordData => {
                            stream.next_u32()?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn skim_term(&self, stream: &mut AmlStream, scope: &AmlName, frames: &mut Vec<Frame>) -> Result<(), AmlError> {
        if stream::is_name_start(stream.peek()?) {
            let name = stream.namestring()?;
            let arg_count = self.arg_count(&name, scope);
            if arg_count > 0 {
                frames.push(Frame::Args { kinds: &TERM_ARGS[..arg_count], next: 0 });
            }
            return Ok(());
        }

        let opcode = stream.opcode()?;
        match opcode {
            Opcode::Zero
            | Opcode::One
            | Opcode::Ones
            | Opcode::Revision
            | Opcode::Timer
            | Opcode::Debug
            | Opcode::Local(_)
            | Opcode::Arg(_)
            | Opcode::Noop
            | Opcode::Breakpoint
            | Opcode::Break
            | Opcode::Continue => (),

            Opcode::BytePrefix => {
                stream.next()?;
            }
            Opcode::WordPrefix => {
                stream.next_u16()?;
            }
            Opcode::DWordPrefix => {
                stream.next_u32()?;
            }
            Opcode::QWordPrefix => {
                stream.next_u64()?;
            }
            Opcode::StringPrefix => {
                stream.string()?;
            }

            Opcode::Method | Opcode::Field | Opcode::IndexField | Opcode::BankField | Opcode::Buffer => {
                stream.pc = stream.pkglength()?;
            }
            Opcode::Package => {
                let end = stream.pkglength()?;
                stream.next()?;
                frames.push(Frame::Elements { end });
            }
            Opcode::VarPackage => {
                let end = stream.pkglength()?;
                frames.push(Frame::Elements { end });
                frames.push(Frame::Args { kinds: &TERM_ARGS[..1], next: 0 });
            }
            Opcode::If | Opcode::While => {
                let end = stream.pkglength()?;
                frames.push(Frame::TermList { end });
                frames.push(Frame::Args { kinds: &TERM_ARGS[..1], next: 0 });
            }
            Opcode::Else => {
                let end = stream.pkglength()?;
                frames.push(Frame::TermList { end });
            }
            Opcode::Scope | Opcode::Device | Opcode::ThermalZone | Opcode::Processor | Opcode::PowerRes => {
                let end = stream.pkglength()?;
                stream.namestring()?;
                match opcode {
                    Opcode::Processor => {
                        stream.next()?;
                        stream.next_u32()?;
                        stream.next()?;
                    }
                    Opcode::PowerRes => {
                        stream.next()?;
                        stream.next_u16()?;
                    }
                    _ => (),
                }
                frames.push(Frame::TermList { end });
            }
            Opcode::Alias => {
                stream.namestring()?;
                stream.namestring()?;
            }
            Opcode::External => {
                stream.namestring()?;
                stream.next()?;
                stream.next()?;
            }

            other => {
                let kinds = other.arg_kinds().ok_or(AmlError::MalformedStream)?;
                frames.push(Frame::Args { kinds, next: 0 });
            }
        }

        Ok(())
    }

    fn skim_target(&self, stream: &mut AmlStream, scope: &AmlName, frames: &mut Vec<Frame>) -> Result<(), AmlError> {
        match stream.peek()? {
            stream::NULL_NAME | 0x60..=0x6e => stream.pc += 1,
            0x5b if stream.bytes(stream.pc, stream.pc + 2).ok().map(|bytes| bytes[1]) == Some(0x31) => stream.pc += 2,
            byte if stream::is_name_start(byte) => {
                stream.namestring()?;
            }
            _ => self.skim_term(stream, scope, frames)?,
        }
        Ok(())
    }

    fn arg_count(&self, name: &AmlName, scope: &AmlName) -> usize {
        let Ok((_, object)) = self.namespace.lock().search(name, scope) else {
            trace!("Skimming: {} isn't defined yet, taking it to be an object", name);
            return 0;
        };
        let count = match *object.lock() {
            Object::Method(ref method) => method.flags.arg_count(),
            Object::NativeMethod { flags, .. } => flags.arg_count(),
            _ => 0,
        };
        usize::min(count, TERM_ARGS.len())
    }
}
