//! The walk loop. AML is executed with explicit stacks rather than recursion: each method invocation is a
//! [`MethodContext`], holding a stack of [`Block`]s (the bodies of scopes, packages, `If`s and `While`s being
//! executed) and a stack of ops that are waiting for their operands. Nested method calls push a new context.
//!
//! Every iteration of the loop does one of three things: retire the innermost op if all of its operands have been
//! collected, close the current block if its stream has run out, or decode the next thing in the stream.

use crate::{
    namespace::{AmlName, NamespaceLevelKind},
    object::{BufferField, FieldFlags, FieldUnit, FieldUnitKind, Method, MethodFlags, MethodState, Object, ObjectType, WrappedObject},
    op_region::{OpRegion, RegionSpace},
    opcode::{ArgKind, Opcode, TERM_ARGS},
    stream::{self, AmlSpan, AmlStream},
    AmlError,
    Interpreter,
};
use alloc::{vec, vec::Vec};
use core::mem;
use log::{trace, warn};

/// The value of `RevisionOp`.
const INTERPRETER_REVISION: u64 = 1;

const ELSE_OP: u8 = 0xa1;
const BUFFER_OP: u8 = 0x11;

/// Somewhere a result can be stored.
#[derive(Clone, Debug)]
pub(crate) enum Target {
    /// The result is discarded.
    Null,
    Local(u8),
    Arg(u8),
    Debug,
    /// A named object. The path is kept, as `Notify` needs it.
    Name(AmlName, WrappedObject),
    /// An object produced by an op, such as the reference returned by `Index`.
    Object(WrappedObject),
}

#[derive(Debug)]
pub(crate) enum Argument {
    Object(WrappedObject),
    Namestring(AmlName),
    Target(Target),
}

impl Argument {
    pub fn object(&self) -> Result<&WrappedObject, AmlError> {
        match self {
            Argument::Object(object) => Ok(object),
            _ => Err(AmlError::OperandType),
        }
    }

    pub fn namestring(&self) -> Result<&AmlName, AmlError> {
        match self {
            Argument::Namestring(name) => Ok(name),
            _ => Err(AmlError::OperandType),
        }
    }

    pub fn target(&self) -> Result<&Target, AmlError> {
        match self {
            Argument::Target(target) => Ok(target),
            _ => Err(AmlError::OperandType),
        }
    }
}

enum Pending {
    Exec(Opcode),
    /// Collects elements until the end of its block. Elements past `count` are dropped.
    Package { count: usize },
    VarPackage { end: usize },
    Buffer { end: usize },
    If { end: usize },
    While { predicate_pc: usize, end: usize, iterations: usize },
    BankField { end: usize },
    Call { method: WrappedObject, path: AmlName },
    /// Collects the operands of a deferred object, then finishes the context.
    Collect,
}

struct OpInFlight {
    op: Pending,
    kinds: &'static [ArgKind],
    arguments: Vec<Argument>,
}

enum Expect {
    Statement,
    Arg(ArgKind),
    Element,
    Ready,
}

impl OpInFlight {
    fn new(op: Pending, kinds: &'static [ArgKind]) -> OpInFlight {
        OpInFlight { op, kinds, arguments: Vec::new() }
    }

    fn expected(&self) -> Expect {
        if let Pending::Package { .. } = self.op {
            return Expect::Element;
        }
        match self.kinds.get(self.arguments.len()) {
            Some(kind) => Expect::Arg(*kind),
            None => Expect::Ready,
        }
    }
}

struct Block {
    stream: AmlStream,
    kind: BlockKind,
    /// Ops below this index belong to enclosing blocks.
    in_flight_base: usize,
}

enum BlockKind {
    Table,
    Method,
    Deferred,
    Scope { old_scope: AmlName },
    /// The `Package` op collecting the elements sits at `in_flight_base`.
    Package,
    IfThen,
    Else,
    While { predicate_pc: usize, end: usize, iterations: usize },
}

pub(crate) enum ContextKind {
    Table,
    Method {
        path: AmlName,
        /// Whether this invocation created the level that holds the method's named objects.
        owns_level: bool,
        serialization: Option<WrappedObject>,
    },
    Deferred,
}

pub(crate) struct MethodContext {
    block: Block,
    block_stack: Vec<Block>,
    in_flight: Vec<OpInFlight>,
    pub locals: [WrappedObject; 8],
    pub args: Vec<WrappedObject>,
    pub scope: AmlName,
    kind: ContextKind,
}

impl MethodContext {
    fn new(
        stream: AmlStream,
        block_kind: BlockKind,
        scope: AmlName,
        args: Vec<WrappedObject>,
        kind: ContextKind,
    ) -> MethodContext {
        MethodContext {
            block: Block { stream, kind: block_kind, in_flight_base: 0 },
            block_stack: Vec::new(),
            in_flight: Vec::new(),
            locals: core::array::from_fn(|_| Object::Uninitialized.wrap()),
            args,
            scope,
            kind,
        }
    }

    fn has_parent_op(&self) -> bool {
        self.in_flight.len() > self.block.in_flight_base
    }

    fn push_argument(&mut self, argument: Argument) {
        if let Some(op) = self.in_flight.last_mut() {
            op.arguments.push(argument);
        }
    }

    /// Hand the result of an op to the op waiting for it. Results of ops at statement level are discarded.
    fn feed(&mut self, object: WrappedObject) {
        if !self.has_parent_op() {
            return;
        }
        let Some(op) = self.in_flight.last_mut() else { return };
        match op.expected() {
            Expect::Arg(ArgKind::SuperName | ArgKind::Target) => {
                op.arguments.push(Argument::Target(Target::Object(object)))
            }
            _ => op.arguments.push(Argument::Object(object)),
        }
    }

    /// Start executing `kind` over the stream up to `end`. The enclosing stream skips past it.
    fn start_block(&mut self, end: usize, kind: BlockKind) {
        let stream = self.block.stream.sub_stream(end);
        self.block.stream.pc = end;
        let block = Block { stream, kind, in_flight_base: self.in_flight.len() };
        let outer = mem::replace(&mut self.block, block);
        self.block_stack.push(outer);
    }

    fn pop_block(&mut self) -> Result<Block, AmlError> {
        let outer = self.block_stack.pop().ok_or(AmlError::MalformedStream)?;
        let block = mem::replace(&mut self.block, outer);
        if let BlockKind::Scope { ref old_scope } = block.kind {
            self.scope = old_scope.clone();
        }
        Ok(block)
    }

    fn is_table(&self) -> bool {
        matches!(self.kind, ContextKind::Table)
    }
}

enum Step {
    Continue,
    Call(MethodContext),
    Finished(WrappedObject),
}

impl Interpreter {
    /// Load the term list of a table into the namespace.
    pub(crate) fn run_table(&self, span: AmlSpan) -> Result<(), AmlError> {
        let context =
            MethodContext::new(AmlStream::new(&span), BlockKind::Table, AmlName::root(), vec![], ContextKind::Table);
        self.execute(context).map(|_| ())
    }

    pub(crate) fn run_raw_method(&self, span: AmlSpan) -> Result<WrappedObject, AmlError> {
        let kind = ContextKind::Method { path: AmlName::root(), owns_level: false, serialization: None };
        let context = MethodContext::new(AmlStream::new(&span), BlockKind::Method, AmlName::root(), vec![], kind);
        self.execute(context)
    }

    pub(crate) fn run_method(
        &self,
        method: WrappedObject,
        path: AmlName,
        args: Vec<WrappedObject>,
    ) -> Result<WrappedObject, AmlError> {
        let context = self.method_context(&method, path, args)?;
        self.execute(context)
    }

    fn execute(&self, context: MethodContext) -> Result<WrappedObject, AmlError> {
        let mut context = context;
        let mut callers: Vec<MethodContext> = Vec::new();

        loop {
            let position = (context.block_stack.len(), context.block.stream.pc);

            match self.step(&mut context, callers.len()) {
                Ok(Step::Continue) => (),
                Ok(Step::Call(callee)) => callers.push(mem::replace(&mut context, callee)),
                Ok(Step::Finished(result)) => {
                    self.teardown(&mut context);
                    match callers.pop() {
                        Some(caller) => {
                            context = caller;
                            context.feed(result);
                        }
                        None => return Ok(result),
                    }
                }
                Err(err) => {
                    /*
                     * Errors unwind every method. At the table level, the broken object is skipped and
                     * loading carries on, so as much of the namespace as possible is usable.
                     */
                    while !context.is_table() {
                        self.teardown(&mut context);
                        match callers.pop() {
                            Some(caller) => context = caller,
                            None => return Err(err),
                        }
                    }

                    warn!("Error while loading table: {:?}. Skipping the object.", err);
                    let base = context.block.in_flight_base;
                    let base = if let BlockKind::Package = context.block.kind { base + 1 } else { base };
                    context.in_flight.truncate(base);

                    // Make sure we don't fail at the same place forever
                    if (context.block_stack.len(), context.block.stream.pc) == position {
                        context.block.stream.pc += 1;
                    }
                }
            }
        }
    }

    fn teardown(&self, context: &mut MethodContext) {
        if let ContextKind::Method { ref path, owns_level, ref mut serialization } = context.kind {
            if owns_level {
                if let Err(err) = self.namespace.lock().remove_level(path.clone()) {
                    warn!("Failed to remove the locals of {}: {:?}", path, err);
                }
            }
            if let Some(mutex) = serialization.take() {
                if let Err(err) = self.release_mutex(&mutex) {
                    warn!("Failed to release serialization mutex of {}: {:?}", path, err);
                }
            }
        }
    }

    fn step(&self, context: &mut MethodContext, depth: usize) -> Result<Step, AmlError> {
        if context.has_parent_op() {
            if let Some(op) = context.in_flight.last() {
                if let Expect::Ready = op.expected() {
                    if let Some(op) = context.in_flight.pop() {
                        return self.retire(context, op, depth);
                    }
                }
            }
        }

        if context.block.stream.is_done() {
            return self.end_block(context);
        }

        let expected = match context.in_flight.last() {
            Some(op) if context.has_parent_op() => op.expected(),
            _ => Expect::Statement,
        };
        match expected {
            Expect::Statement | Expect::Ready | Expect::Arg(ArgKind::TermArg) => self.decode_term(context),
            Expect::Element => self.decode_element(context),
            Expect::Arg(ArgKind::SuperName | ArgKind::Target) => self.decode_target(context),
            Expect::Arg(ArgKind::NameString) => {
                let name = context.block.stream.namestring()?;
                context.push_argument(Argument::Namestring(name));
                Ok(Step::Continue)
            }
            Expect::Arg(ArgKind::ByteData) => {
                let value = context.block.stream.next()?;
                context.push_argument(Argument::Object(Object::Integer(value as u64).wrap()));
                Ok(Step::Continue)
            }
            Expect::Arg(ArgKind::WordData) => {
                let value = context.block.stream.next_u16()?;
                context.push_argument(Argument::Object(Object::Integer(value as u64).wrap()));
                Ok(Step::Continue)
            }
            Expect::Arg(ArgKind::DWordData) => {
                let value = context.block.stream.next_u32()?;
                context.push_argument(Argument::Object(Object::Integer(value as u64).wrap()));
                Ok(Step::Continue)
            }
        }
    }

    fn end_block(&self, context: &mut MethodContext) -> Result<Step, AmlError> {
        let base = context.block.in_flight_base;
        let expected = if let BlockKind::Package = context.block.kind { base + 1 } else { base };

        if context.in_flight.len() != expected {
            // An op ran off the end of its block
            if !context.block_stack.is_empty() {
                context.in_flight.truncate(base);
                context.pop_block()?;
            }
            return Err(AmlError::MalformedStream);
        }

        match context.block.kind {
            BlockKind::Table | BlockKind::Method => Ok(Step::Finished(Object::Uninitialized.wrap())),
            BlockKind::Deferred => Err(AmlError::MalformedStream),
            BlockKind::Scope { .. } | BlockKind::Else => {
                context.pop_block()?;
                Ok(Step::Continue)
            }
            BlockKind::IfThen => {
                context.pop_block()?;
                let stream = &mut context.block.stream;
                if stream.peek() == Ok(ELSE_OP) {
                    stream.pc += 1;
                    stream.pc = stream.pkglength()?;
                }
                Ok(Step::Continue)
            }
            BlockKind::While { predicate_pc, end, iterations } => {
                context.pop_block()?;
                self.restart_while(context, predicate_pc, end, iterations);
                Ok(Step::Continue)
            }
            BlockKind::Package => {
                let op = context.in_flight.pop();
                context.pop_block()?;
                let Some(OpInFlight { op: Pending::Package { count }, arguments, .. }) = op else {
                    return Err(AmlError::MalformedStream);
                };

                let mut elements = Vec::new();
                elements.try_reserve_exact(count).map_err(|_| AmlError::OutOfMemory)?;
                for argument in arguments.into_iter().take(count) {
                    elements.push(match argument {
                        Argument::Object(object) => object,
                        _ => Object::Uninitialized.wrap(),
                    });
                }
                // Elements that aren't given are distinct uninitialized objects
                while elements.len() < count {
                    elements.push(Object::Uninitialized.wrap());
                }

                context.feed(Object::Package(elements).wrap());
                Ok(Step::Continue)
            }
        }
    }

    /// Evaluate the predicate of a `While` again, from the top.
    fn restart_while(&self, context: &mut MethodContext, predicate_pc: usize, end: usize, iterations: usize) {
        context.block.stream.pc = predicate_pc;
        context.in_flight.push(OpInFlight::new(Pending::While { predicate_pc, end, iterations }, &[ArgKind::TermArg]));
    }

    fn retire(&self, context: &mut MethodContext, op: OpInFlight, depth: usize) -> Result<Step, AmlError> {
        let OpInFlight { op, arguments, .. } = op;

        match op {
            Pending::Exec(Opcode::Return) => {
                let value = arguments.first().ok_or(AmlError::MalformedStream)?.object()?;
                Ok(Step::Finished(value.deep_copy()?))
            }
            Pending::Exec(opcode) => {
                let result = self.exec_op(context, opcode, arguments)?;
                context.feed(result);
                Ok(Step::Continue)
            }
            Pending::If { end } => {
                if self.predicate(&arguments)? {
                    context.start_block(end, BlockKind::IfThen);
                } else {
                    let stream = &mut context.block.stream;
                    stream.pc = end;
                    if stream.peek() == Ok(ELSE_OP) {
                        stream.pc += 1;
                        let else_end = stream.pkglength()?;
                        context.start_block(else_end, BlockKind::Else);
                    }
                }
                Ok(Step::Continue)
            }
            Pending::While { predicate_pc, end, iterations } => {
                if self.predicate(&arguments)? {
                    if iterations >= self.config.max_loop_iterations {
                        context.block.stream.pc = end;
                        return Err(AmlError::InfiniteLoop);
                    }
                    context.start_block(end, BlockKind::While { predicate_pc, end, iterations: iterations + 1 });
                } else {
                    context.block.stream.pc = end;
                }
                Ok(Step::Continue)
            }
            Pending::Buffer { end } => {
                let result = self.build_buffer(context, &arguments, end);
                context.block.stream.pc = end;
                context.feed(result?);
                Ok(Step::Continue)
            }
            Pending::VarPackage { end } => {
                let count = match arguments.first().map(Argument::object) {
                    Some(Ok(count)) => self.to_integer(&count.lock()),
                    _ => Err(AmlError::OperandType),
                };
                let count = match count.and_then(|count| {
                    let count = usize::try_from(count).map_err(|_| AmlError::OutOfMemory)?;
                    self.check_size(count).map(|()| count)
                }) {
                    Ok(count) => count,
                    Err(err) => {
                        context.block.stream.pc = end;
                        return Err(err);
                    }
                };

                context.in_flight.push(OpInFlight::new(Pending::Package { count }, &[]));
                context.start_block(end, BlockKind::Package);
                context.block.in_flight_base -= 1;
                Ok(Step::Continue)
            }
            Pending::BankField { end } => {
                let result = self.define_bank_field(context, &arguments, end);
                context.block.stream.pc = end;
                result.map(|()| Step::Continue)
            }
            Pending::Call { method, path } => {
                let args = arguments
                    .iter()
                    .map(|argument| argument.object().cloned())
                    .collect::<Result<Vec<_>, AmlError>>()?;

                let native = match *method.lock() {
                    Object::NativeMethod { ref f, .. } => Some(f.clone()),
                    _ => None,
                };
                if let Some(f) = native {
                    let result = f(&args)?;
                    context.feed(result);
                    return Ok(Step::Continue);
                }

                if depth + 1 >= self.config.max_call_depth {
                    return Err(AmlError::CallDepthExceeded);
                }
                trace!("Invoking {}", path);
                Ok(Step::Call(self.method_context(&method, path, args)?))
            }
            Pending::Collect => {
                let operands = arguments
                    .into_iter()
                    .map(|argument| match argument {
                        Argument::Object(object) => Ok(object),
                        _ => Err(AmlError::OperandType),
                    })
                    .collect::<Result<Vec<_>, AmlError>>()?;
                Ok(Step::Finished(Object::Package(operands).wrap()))
            }
            Pending::Package { .. } => Err(AmlError::MalformedStream),
        }
    }

    fn predicate(&self, arguments: &[Argument]) -> Result<bool, AmlError> {
        let predicate = arguments.first().ok_or(AmlError::MalformedStream)?.object()?;
        let value = self.to_integer(&predicate.lock())?;
        Ok(value != 0)
    }

    fn build_buffer(&self, context: &MethodContext, arguments: &[Argument], end: usize) -> Result<WrappedObject, AmlError> {
        let size = arguments.first().ok_or(AmlError::MalformedStream)?.object()?;
        let size = self.to_integer(&size.lock())?;
        let size = usize::try_from(size).map_err(|_| AmlError::OutOfMemory)?;

        let stream = &context.block.stream;
        let initializer = stream.bytes(stream.pc, end)?;
        let length = usize::max(size, initializer.len());
        self.check_size(length)?;

        let mut bytes = Vec::new();
        bytes.try_reserve_exact(length).map_err(|_| AmlError::OutOfMemory)?;
        bytes.extend_from_slice(initializer);
        bytes.resize(length, 0);
        Ok(Object::Buffer(bytes).wrap())
    }

    /// Build the context for an invocation of `method`. Methods are checked the first time they're invoked, if
    /// they haven't been already.
    fn method_context(
        &self,
        method: &WrappedObject,
        path: AmlName,
        args: Vec<WrappedObject>,
    ) -> Result<MethodContext, AmlError> {
        let (code, flags, state) = match *method.lock() {
            Object::Method(ref inner) => (inner.code.clone(), inner.flags, inner.state.clone()),
            ref other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Method, got: other.typ() })
            }
        };
        if args.len() != flags.arg_count() {
            return Err(AmlError::MethodArgCountIncorrect);
        }

        match state {
            MethodState::Parsed => (),
            MethodState::Invalid(_) => return Err(AmlError::InvalidMethodBody),
            MethodState::Unparsed => {
                let result = self.skim_method(&code, &path);
                if let Object::Method(ref mut inner) = *method.lock() {
                    inner.state = match result {
                        Ok(()) => MethodState::Parsed,
                        Err(ref err) => MethodState::Invalid(err.clone()),
                    };
                }
                if let Err(err) = result {
                    warn!("Method {} failed to parse: {:?}", path, err);
                    return Err(AmlError::InvalidMethodBody);
                }
            }
        }

        let args = args.iter().map(WrappedObject::deep_copy).collect::<Result<Vec<_>, AmlError>>()?;

        let owns_level = {
            let mut namespace = self.namespace.lock();
            let owns_level = namespace.level_kind(&path).is_none();
            if owns_level {
                namespace.add_level(path.clone(), NamespaceLevelKind::MethodLocals)?;
            }
            owns_level
        };

        let serialization = if flags.serialize() {
            match self.acquire_serialization(method, flags) {
                Ok(mutex) => Some(mutex),
                Err(err) => {
                    if owns_level {
                        if let Err(err) = self.namespace.lock().remove_level(path.clone()) {
                            warn!("Failed to remove the locals of {}: {:?}", path, err);
                        }
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let kind = ContextKind::Method { path: path.clone(), owns_level, serialization };
        Ok(MethodContext::new(AmlStream::new(&code), BlockKind::Method, path, args, kind))
    }

    /// Serialized methods hold an implicit mutex, at the method's sync level, while they run.
    fn acquire_serialization(&self, method: &WrappedObject, flags: MethodFlags) -> Result<WrappedObject, AmlError> {
        let mutex = {
            let mut object = method.lock();
            let Object::Method(ref mut inner) = *object else { return Err(AmlError::OperandType) };
            inner
                .serialization
                .get_or_insert_with(|| {
                    Object::Mutex(crate::mutex::AmlMutex::new(&self.handler, flags.sync_level())).wrap()
                })
                .clone()
        };
        self.acquire_mutex(&mutex, 0xffff)?;
        Ok(mutex)
    }

    fn decode_term(&self, context: &mut MethodContext) -> Result<Step, AmlError> {
        if stream::is_name_start(context.block.stream.peek()?) {
            let name = context.block.stream.namestring()?;
            return self.decode_name(context, name);
        }

        let opcode = context.block.stream.opcode()?;
        let stream = &mut context.block.stream;
        let constant = match opcode {
            Opcode::Zero => Some(Object::Integer(0)),
            Opcode::One => Some(Object::Integer(1)),
            Opcode::Ones => Some(Object::Integer(self.ones())),
            Opcode::BytePrefix => Some(Object::Integer(stream.next()? as u64)),
            Opcode::WordPrefix => Some(Object::Integer(stream.next_u16()? as u64)),
            Opcode::DWordPrefix => Some(Object::Integer(stream.next_u32()? as u64)),
            Opcode::QWordPrefix => Some(Object::Integer(self.mask(stream.next_u64()?))),
            Opcode::StringPrefix => Some(Object::String(stream.string()?.into_bytes())),
            Opcode::Revision => Some(Object::Integer(INTERPRETER_REVISION)),
            Opcode::Timer => Some(Object::Integer(self.handler.nanos_since_boot() / 100)),
            Opcode::Debug => Some(Object::Debug),
            _ => None,
        };
        if let Some(constant) = constant {
            context.feed(constant.wrap());
            return Ok(Step::Continue);
        }

        match opcode {
            Opcode::Local(n) => {
                let local = context.locals[n as usize].clone();
                context.feed(local);
            }
            Opcode::Arg(n) => {
                let arg = context.args.get(n as usize).cloned().unwrap_or_else(|| Object::Uninitialized.wrap());
                context.feed(arg);
            }
            Opcode::Noop | Opcode::Breakpoint => (),
            Opcode::Break => self.unwind_to_while(context, false)?,
            Opcode::Continue => self.unwind_to_while(context, true)?,

            Opcode::Scope | Opcode::Device | Opcode::Processor | Opcode::PowerRes | Opcode::ThermalZone => {
                let end = context.block.stream.pkglength()?;
                if let Err(err) = self.open_scope(context, opcode, end) {
                    context.block.stream.pc = end;
                    return Err(err);
                }
            }
            Opcode::Method => {
                let end = context.block.stream.pkglength()?;
                let result = self.define_method(context, end);
                context.block.stream.pc = end;
                result?;
            }
            Opcode::External => {
                let stream = &mut context.block.stream;
                stream.namestring()?;
                stream.next()?;
                stream.next()?;
            }
            Opcode::Alias => {
                let stream = &mut context.block.stream;
                let source = stream.namestring()?;
                let alias = stream.namestring()?;
                let mut namespace = self.namespace.lock();
                let (_, object) = namespace.search(&source, &context.scope)?;
                namespace.create_alias(alias.resolve(&context.scope)?, object)?;
            }
            Opcode::Field | Opcode::IndexField => {
                let end = context.block.stream.pkglength()?;
                let result = self.define_field(context, opcode, end);
                context.block.stream.pc = end;
                result?;
            }
            Opcode::BankField => {
                let end = context.block.stream.pkglength()?;
                context.in_flight.push(OpInFlight::new(
                    Pending::BankField { end },
                    &[ArgKind::NameString, ArgKind::NameString, ArgKind::TermArg],
                ));
            }
            Opcode::OpRegion if context.is_table() => self.define_deferred_region(context)?,
            Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField
            | Opcode::CreateField
                if context.is_table() =>
            {
                self.define_deferred_buffer_field(context, opcode)?
            }
            Opcode::Package => {
                let stream = &mut context.block.stream;
                let end = stream.pkglength()?;
                let count = match stream.next() {
                    Ok(count) => count as usize,
                    Err(err) => {
                        stream.pc = end;
                        return Err(err);
                    }
                };
                context.in_flight.push(OpInFlight::new(Pending::Package { count }, &[]));
                context.start_block(end, BlockKind::Package);
                context.block.in_flight_base -= 1;
            }
            Opcode::VarPackage => {
                let end = context.block.stream.pkglength()?;
                context.in_flight.push(OpInFlight::new(Pending::VarPackage { end }, &[ArgKind::TermArg]));
            }
            Opcode::Buffer => {
                let end = context.block.stream.pkglength()?;
                context.in_flight.push(OpInFlight::new(Pending::Buffer { end }, &[ArgKind::TermArg]));
            }
            Opcode::If => {
                let end = context.block.stream.pkglength()?;
                context.in_flight.push(OpInFlight::new(Pending::If { end }, &[ArgKind::TermArg]));
            }
            Opcode::Else => {
                // An `Else` that doesn't follow an `If` we've just run, or one whose predicate was true
                let stream = &mut context.block.stream;
                stream.pc = stream.pkglength()?;
            }
            Opcode::While => {
                let end = context.block.stream.pkglength()?;
                let predicate_pc = context.block.stream.pc;
                self.restart_while(context, predicate_pc, end, 0);
            }

            other => {
                let kinds = other.arg_kinds().ok_or(AmlError::MalformedStream)?;
                context.in_flight.push(OpInFlight::new(Pending::Exec(other), kinds));
            }
        }

        Ok(Step::Continue)
    }

    /// A name in a term position is evaluated: methods are invoked, fields are read, and anything else stands
    /// for itself.
    fn decode_name(&self, context: &mut MethodContext, name: AmlName) -> Result<Step, AmlError> {
        let (path, object) = self.namespace.lock().search(&name, &context.scope)?;

        enum Kind {
            Call(usize),
            Field,
            Value,
        }
        let kind = match *object.lock() {
            Object::Method(ref method) => Kind::Call(method.flags.arg_count()),
            Object::NativeMethod { flags, .. } => Kind::Call(flags.arg_count()),
            Object::FieldUnit(_) | Object::BufferField(_) => Kind::Field,
            _ => Kind::Value,
        };

        match kind {
            Kind::Call(arg_count) => {
                let kinds = &TERM_ARGS[..usize::min(arg_count, TERM_ARGS.len())];
                context.in_flight.push(OpInFlight::new(Pending::Call { method: object, path }, kinds));
            }
            Kind::Field => {
                let value = self.read_if_field(object)?;
                context.feed(value);
            }
            Kind::Value => context.feed(object),
        }
        Ok(Step::Continue)
    }

    /// Decode a package element. Bare names are resolved to references to the objects they name, or kept as
    /// strings if nothing by that name exists.
    fn decode_element(&self, context: &mut MethodContext) -> Result<Step, AmlError> {
        if !stream::is_name_start(context.block.stream.peek()?) {
            return self.decode_term(context);
        }

        let name = context.block.stream.namestring()?;
        let element = match self.namespace.lock().search(&name, &context.scope) {
            Ok((_, object)) => Object::Reference { kind: crate::object::ReferenceKind::Named, inner: object },
            Err(_) => Object::String(name.as_string().into_bytes()),
        };
        context.feed(element.wrap());
        Ok(Step::Continue)
    }

    fn decode_target(&self, context: &mut MethodContext) -> Result<Step, AmlError> {
        let stream = &mut context.block.stream;
        let byte = stream.peek()?;

        let target = match byte {
            stream::NULL_NAME => {
                stream.pc += 1;
                Target::Null
            }
            0x60..=0x67 => {
                stream.pc += 1;
                Target::Local(byte - 0x60)
            }
            0x68..=0x6e => {
                stream.pc += 1;
                Target::Arg(byte - 0x68)
            }
            0x5b if stream.bytes(stream.pc, stream.pc + 2).ok().map(|bytes| bytes[1]) == Some(0x31) => {
                stream.pc += 2;
                Target::Debug
            }
            byte if stream::is_name_start(byte) => {
                let name = stream.namestring()?;
                let tolerate_missing = matches!(
                    context.in_flight.last(),
                    Some(OpInFlight { op: Pending::Exec(Opcode::CondRefOf), arguments, .. }) if arguments.is_empty()
                );

                match self.namespace.lock().search(&name, &context.scope) {
                    Ok((path, object)) => Target::Name(path, object),
                    Err(AmlError::ObjectDoesNotExist(_) | AmlError::LevelDoesNotExist(_)) if tolerate_missing => {
                        Target::Null
                    }
                    Err(err) => return Err(err),
                }
            }
            // Something that evaluates to a reference, like `Index` or `RefOf`
            _ => return self.decode_term(context),
        };

        context.push_argument(Argument::Target(target));
        Ok(Step::Continue)
    }

    /// `Break` and `Continue`: leave every block up to the innermost `While`.
    fn unwind_to_while(&self, context: &mut MethodContext, is_continue: bool) -> Result<(), AmlError> {
        loop {
            match context.block.kind {
                BlockKind::IfThen | BlockKind::Else | BlockKind::Scope { .. } | BlockKind::Package => {
                    context.in_flight.truncate(context.block.in_flight_base);
                    context.pop_block()?;
                }
                BlockKind::While { predicate_pc, end, iterations } => {
                    context.in_flight.truncate(context.block.in_flight_base);
                    context.pop_block()?;
                    if is_continue {
                        self.restart_while(context, predicate_pc, end, iterations);
                    }
                    return Ok(());
                }
                BlockKind::Table | BlockKind::Method | BlockKind::Deferred => return Err(AmlError::BreakOutsideWhile),
            }
        }
    }

    fn open_scope(&self, context: &mut MethodContext, opcode: Opcode, end: usize) -> Result<(), AmlError> {
        let stream = &mut context.block.stream;
        let name = stream.namestring()?;
        let path = name.resolve(&context.scope)?;

        let object = match opcode {
            Opcode::Scope => None,
            Opcode::Device => Some((Object::Device, NamespaceLevelKind::Device)),
            Opcode::Processor => {
                let proc_id = stream.next()?;
                let pblk_address = stream.next_u32()?;
                let pblk_length = stream.next()?;
                Some((Object::Processor { proc_id, pblk_address, pblk_length }, NamespaceLevelKind::Processor))
            }
            Opcode::PowerRes => {
                let system_level = stream.next()?;
                let resource_order = stream.next_u16()?;
                Some((Object::PowerResource { system_level, resource_order }, NamespaceLevelKind::PowerResource))
            }
            Opcode::ThermalZone => Some((Object::ThermalZone, NamespaceLevelKind::ThermalZone)),
            _ => return Err(AmlError::MalformedStream),
        };

        let path = {
            let mut namespace = self.namespace.lock();
            match object {
                Some((object, kind)) => {
                    namespace.add_level(path.clone(), kind)?;
                    namespace.insert(path.clone(), object.wrap())?;
                    path
                }
                None if namespace.level_kind(&path).is_some() => path,
                None => namespace.search_for_level(&name, &context.scope)?,
            }
        };

        let old_scope = mem::replace(&mut context.scope, path);
        context.start_block(end, BlockKind::Scope { old_scope });
        Ok(())
    }

    fn define_method(&self, context: &mut MethodContext, end: usize) -> Result<(), AmlError> {
        let stream = &mut context.block.stream;
        let name = stream.namestring()?;
        let flags = MethodFlags(stream.next()?);
        let code = stream.span(stream.pc, end);

        let path = name.resolve(&context.scope)?;
        self.namespace.lock().insert(path, Object::Method(Method::new(code, flags)).wrap())
    }

    /// The device a named object belongs to. Objects created by a method belong to the device containing the
    /// method.
    pub(crate) fn device_scope(&self, scope: &AmlName) -> AmlName {
        let mut scope = scope.clone();
        loop {
            let kind = self.namespace.lock().level_kind(&scope);
            if kind != Some(NamespaceLevelKind::MethodLocals) {
                return scope;
            }
            match scope.parent() {
                Ok(parent) => scope = parent,
                Err(_) => return scope,
            }
        }
    }

    /// At the table level, the operands of an `OperationRegion` are only evaluated when the region is first
    /// accessed, as they can refer to objects defined later in the table.
    fn define_deferred_region(&self, context: &mut MethodContext) -> Result<(), AmlError> {
        let stream = &mut context.block.stream;
        let name = stream.namestring()?;
        let space = RegionSpace::from(stream.next()?);

        let start = stream.pc;
        self.skim_term_args(stream, &context.scope, 2)?;
        let args = stream.span(start, stream.pc);

        let path = name.resolve(&context.scope)?;
        let parent = self.device_scope(&context.scope);
        let region = Object::OpRegion(OpRegion::deferred(space, args, context.scope.clone(), parent)).wrap();
        self.namespace.lock().insert(path, region.clone())?;
        self.pending_regions.lock().push(region);
        Ok(())
    }

    fn define_deferred_buffer_field(&self, context: &mut MethodContext, op: Opcode) -> Result<(), AmlError> {
        let count = if op == Opcode::CreateField { 3 } else { 2 };
        let stream = &mut context.block.stream;

        let start = stream.pc;
        self.skim_term_args(stream, &context.scope, count)?;
        let args = stream.span(start, stream.pc);
        let name = stream.namestring()?;

        let path = name.resolve(&context.scope)?;
        let field = BufferField::Deferred { op, args, scope: context.scope.clone() };
        self.namespace.lock().insert(path, Object::BufferField(field).wrap())
    }

    /// Evaluate the operands of a region that was defined at the table level, if that hasn't happened yet.
    pub(crate) fn evaluate_region_operands(&self, region: &WrappedObject) -> Result<(), AmlError> {
        let (args, scope) = match *region.lock() {
            Object::OpRegion(OpRegion { deferred: Some((ref args, ref scope)), .. }) => (args.clone(), scope.clone()),
            _ => return Ok(()),
        };

        let operands = self.evaluate_deferred(&args, &scope, 2)?;
        let [base, length] = operands.as_slice() else { return Err(AmlError::MalformedStream) };
        let base = self.to_integer(&base.lock())?;
        let length = self.to_integer(&length.lock())?;

        if let Object::OpRegion(ref mut inner) = *region.lock() {
            inner.base = base;
            inner.length = length;
            inner.deferred = None;
        }
        Ok(())
    }

    /// Evaluate the operands of a buffer field defined at the table level, if that hasn't happened yet.
    pub(crate) fn evaluate_buffer_field(&self, field: &WrappedObject) -> Result<(), AmlError> {
        let (op, args, scope) = match *field.lock() {
            Object::BufferField(BufferField::Deferred { op, ref args, ref scope }) => (op, args.clone(), scope.clone()),
            _ => return Ok(()),
        };

        let count = if op == Opcode::CreateField { 3 } else { 2 };
        let operands = self.evaluate_deferred(&args, &scope, count)?;
        let (buffer, index, length) = match operands.as_slice() {
            [buffer, index] => (buffer, self.to_integer(&index.lock())?, None),
            [buffer, index, length] => (buffer, self.to_integer(&index.lock())?, Some(self.to_integer(&length.lock())?)),
            _ => return Err(AmlError::MalformedStream),
        };

        let ready = self.buffer_field(op, buffer.clone(), index, length)?;
        *field.lock() = Object::BufferField(ready);
        Ok(())
    }

    fn evaluate_deferred(&self, args: &AmlSpan, scope: &AmlName, count: usize) -> Result<Vec<WrappedObject>, AmlError> {
        let mut context = MethodContext::new(
            AmlStream::new(args),
            BlockKind::Deferred,
            scope.clone(),
            vec![],
            ContextKind::Deferred,
        );
        context.in_flight.push(OpInFlight::new(Pending::Collect, &TERM_ARGS[..count]));

        let operands = self.execute(context)?;
        let operands = match *operands.lock() {
            Object::Package(ref elements) => elements.clone(),
            _ => return Err(AmlError::MalformedStream),
        };
        Ok(operands)
    }

    fn define_field(&self, context: &mut MethodContext, opcode: Opcode, end: usize) -> Result<(), AmlError> {
        let stream = &mut context.block.stream;
        let kind = match opcode {
            Opcode::Field => {
                let region = stream.namestring()?;
                let (_, region) = self.namespace.lock().search(&region, &context.scope)?;
                FieldUnitKind::Normal { region }
            }
            _ => {
                let index = stream.namestring()?;
                let data = stream.namestring()?;
                let namespace = self.namespace.lock();
                let (_, index) = namespace.search(&index, &context.scope)?;
                let (_, data) = namespace.search(&data, &context.scope)?;
                FieldUnitKind::Index { index, data }
            }
        };
        let flags = stream.next()?;
        self.parse_field_list(context, end, kind, flags)
    }

    fn define_bank_field(&self, context: &mut MethodContext, arguments: &[Argument], end: usize) -> Result<(), AmlError> {
        let [region, bank, bank_value] = arguments else { return Err(AmlError::MalformedStream) };
        let kind = {
            let namespace = self.namespace.lock();
            let (_, region) = namespace.search(region.namestring()?, &context.scope)?;
            let (_, bank) = namespace.search(bank.namestring()?, &context.scope)?;
            let bank_value = self.to_integer(&bank_value.object()?.lock())?;
            FieldUnitKind::Bank { region, bank, bank_value }
        };
        let flags = context.block.stream.next()?;
        self.parse_field_list(context, end, kind, flags)
    }

    fn parse_field_list(
        &self,
        context: &mut MethodContext,
        end: usize,
        kind: FieldUnitKind,
        flags: u8,
    ) -> Result<(), AmlError> {
        const RESERVED_FIELD: u8 = 0x00;
        const ACCESS_FIELD: u8 = 0x01;
        const CONNECT_FIELD: u8 = 0x02;
        const EXTENDED_ACCESS_FIELD: u8 = 0x03;

        let mut flags = FieldFlags(flags);
        let mut bit_index = 0;
        let stream = &mut context.block.stream;

        while stream.pc < end {
            match stream.peek()? {
                RESERVED_FIELD => {
                    stream.pc += 1;
                    bit_index += stream.raw_pkglength()?;
                }
                ACCESS_FIELD => {
                    stream.pc += 1;
                    let access_type = stream.next()?;
                    let _access_attrib = stream.next()?;
                    flags.0 = (flags.0 & 0xf0) | (access_type & 0x0f);
                }
                CONNECT_FIELD => {
                    stream.pc += 1;
                    if stream.peek()? == BUFFER_OP {
                        stream.pc += 1;
                        stream.pc = stream.pkglength()?;
                    } else {
                        stream.namestring()?;
                    }
                }
                EXTENDED_ACCESS_FIELD => {
                    stream.pc += 1;
                    let access_type = stream.next()?;
                    let _access_attrib = stream.next()?;
                    let _access_length = stream.next()?;
                    flags.0 = (flags.0 & 0xf0) | (access_type & 0x0f);
                }
                _ => {
                    let name = stream.name_seg()?;
                    let bit_length = stream.raw_pkglength()?;
                    let field = FieldUnit { kind: kind.clone(), flags, bit_index, bit_length };
                    let path = AmlName::from_name_seg(name).resolve(&context.scope)?;
                    self.namespace.lock().insert(path, Object::FieldUnit(field).wrap())?;
                    bit_index += bit_length;
                }
            }
        }

        if stream.pc != end {
            return Err(AmlError::MalformedStream);
        }
        Ok(())
    }
}

