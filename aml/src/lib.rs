//! `aml-engine` is an interpreter for the ACPI Machine Language (AML), the bytecode that firmware uses to
//! describe hardware and the operations that can be performed on it. Tables (the DSDT and any SSDTs) are loaded
//! into a namespace of typed objects, and control methods in that namespace can then be invoked.
//!
//! The host kernel plugs in through the [`Handler`] trait, which provides access to memory, IO ports, PCI
//! configuration space, timing and semaphores. Everything the interpreter mutates is owned by an [`Interpreter`]:
//! there is no global state.
//!
//! ### Execution model
//! AML is executed by an explicit-stack walk loop, so deeply nested expressions and method calls use heap memory
//! rather than native stack. One thread executes AML at a time: the interpreter holds a lock (a semaphore provided
//! by the host) while it runs, and drops it around anything that blocks (`Sleep`, `Stall`, waiting on a mutex or
//! event), and around address space handlers that may re-enter the interpreter.

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod namespace;
pub mod notify;
pub mod object;
pub mod op_region;
pub mod opcode;
pub mod mutex;
pub mod stream;

mod convert;
mod exec;
mod field;
mod resolve;
mod skim;
mod walk;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

use alloc::{boxed::Box, collections::btree_map::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::AtomicU32;
use log::{error, warn};
use mutex::{AmlMutex, ThreadState};
use namespace::{AmlName, NameSeg, Namespace};
use notify::{GlobalLock, NotifyHandlers};
use object::{Object, ObjectType, WrappedObject};
use op_region::{InstalledHandler, RegionSpace};
use pci_types::PciAddress;
use spinning_top::Spinlock;
use stream::AmlSpan;

pub struct Interpreter {
    handler: Arc<dyn Handler>,
    pub namespace: Spinlock<Namespace>,
    config: InterpreterConfig,
    /// The size of an AML integer, in bytes. Tables with a revision below 2 use 32-bit integers.
    integer_size: usize,
    interpreter_lock: Handle,
    threads: Spinlock<BTreeMap<u64, ThreadState>>,
    region_handlers: Spinlock<Vec<(AmlName, Arc<InstalledHandler>)>>,
    /// Regions created while loading the current table, which are connected to their handlers once the load has
    /// finished.
    pending_regions: Spinlock<Vec<WrappedObject>>,
    notify_handlers: Spinlock<NotifyHandlers>,
    global_lock: GlobalLock,
}

/// When the bodies of control methods are checked.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParsePolicy {
    /// Every method is checked once its table has loaded, and broken methods are reported up front.
    AtInit,
    /// Methods are checked the first time they're invoked.
    JustInTime,
}

#[derive(Clone, Debug)]
pub struct InterpreterConfig {
    pub parse_policy: ParsePolicy,
    /// A `While` loop running more iterations than this is assumed to be stuck, and fails with
    /// `AmlError::InfiniteLoop`.
    pub max_loop_iterations: usize,
    pub max_call_depth: usize,
    /// The largest `Buffer` (in bytes) or `Package` (in elements) AML can create.
    pub max_object_size: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            parse_policy: ParsePolicy::JustInTime,
            max_loop_iterations: 0xffff,
            max_call_depth: 256,
            max_object_size: 16 * 1024 * 1024,
        }
    }
}

impl Interpreter {
    /// Create a new `Interpreter`. The revision of the DSDT decides the size of AML integers.
    pub fn new<H>(handler: H, dsdt_revision: u8) -> Interpreter
    where
        H: Handler + 'static,
    {
        Interpreter::with_config(handler, dsdt_revision, InterpreterConfig::default())
    }

    pub fn with_config<H>(handler: H, dsdt_revision: u8, config: InterpreterConfig) -> Interpreter
    where
        H: Handler + 'static,
    {
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let mut namespace = Namespace::new();
        namespace.insert_predefined(NameSeg(*b"_GL_"), Object::Mutex(AmlMutex::global_lock(&handler)).wrap());

        let interpreter = Interpreter {
            namespace: Spinlock::new(namespace),
            config,
            integer_size: if dsdt_revision < 2 { 4 } else { 8 },
            interpreter_lock: handler.create_semaphore(1, 1),
            threads: Spinlock::new(BTreeMap::new()),
            region_handlers: Spinlock::new(Vec::new()),
            pending_regions: Spinlock::new(Vec::new()),
            notify_handlers: Spinlock::new(NotifyHandlers::default()),
            global_lock: GlobalLock::new(&handler),
            handler,
        };

        if let Err(err) = interpreter.install_default_region_handlers() {
            warn!("Failed to install default address space handlers: {:?}", err);
        }
        interpreter
    }

    pub fn handler(&self) -> &dyn Handler {
        &*self.handler
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// The size of an AML integer, in bytes.
    pub fn integer_size(&self) -> usize {
        self.integer_size
    }

    /// Load a table of AML (the DSDT or an SSDT, without its header) into the namespace. Errors in individual
    /// objects of the table are reported and skipped, so as much of the namespace as possible becomes usable.
    pub fn load_table(&self, stream: &[u8]) -> Result<(), AmlError> {
        self.run_locked(|| self.load_table_locked(stream))
    }

    fn load_table_locked(&self, stream: &[u8]) -> Result<(), AmlError> {
        self.run_table(AmlSpan::new(stream))?;
        self.connect_new_regions()?;

        if self.config.parse_policy == ParsePolicy::AtInit {
            self.check_all_methods()?;
        }
        Ok(())
    }

    /// Invoke the method at `path` with the given arguments. If `path` names something other than a method,
    /// its value is returned instead.
    pub fn invoke_method(&self, path: AmlName, args: Vec<WrappedObject>) -> Result<WrappedObject, AmlError> {
        self.run_locked(|| self.invoke_method_locked(path, args))
    }

    /// Like [`Interpreter::invoke_method`], but returns `Ok(None)` if there is nothing at `path`.
    pub fn evaluate_if_present(
        &self,
        path: AmlName,
        args: Vec<WrappedObject>,
    ) -> Result<Option<WrappedObject>, AmlError> {
        self.run_locked(|| self.evaluate_if_present_locked(path, args))
    }

    /// Load `aml` as a table (if it isn't empty), then invoke `method` (if given), returning its result.
    pub fn parse_and_execute(
        &self,
        aml: &[u8],
        method: Option<AmlName>,
        args: Vec<WrappedObject>,
    ) -> Result<Option<WrappedObject>, AmlError> {
        self.run_locked(|| {
            if !aml.is_empty() {
                self.load_table_locked(aml)?;
            }
            match method {
                Some(path) => self.invoke_method_locked(path, args).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Execute a raw term list as the body of a method with no arguments, in the root scope.
    pub fn execute_method(&self, stream: &[u8]) -> Result<WrappedObject, AmlError> {
        self.run_locked(|| self.run_raw_method(AmlSpan::new(stream)))
    }

    pub(crate) fn invoke_method_locked(
        &self,
        path: AmlName,
        args: Vec<WrappedObject>,
    ) -> Result<WrappedObject, AmlError> {
        let path = path.resolve(&AmlName::root())?;
        let object = self.namespace.lock().get(path.clone())?;

        let native = match *object.lock() {
            Object::Method(_) => None,
            Object::NativeMethod { ref f, .. } => Some(f.clone()),
            _ => return self.read_if_field(object.clone()),
        };
        match native {
            Some(f) => f(&args),
            None => self.run_method(object, path, args),
        }
    }

    pub(crate) fn evaluate_if_present_locked(
        &self,
        path: AmlName,
        args: Vec<WrappedObject>,
    ) -> Result<Option<WrappedObject>, AmlError> {
        let path = path.resolve(&AmlName::root())?;
        match self.namespace.lock().get(path.clone()) {
            Ok(_) => (),
            Err(AmlError::ObjectDoesNotExist(_) | AmlError::LevelDoesNotExist(_)) => return Ok(None),
            Err(other) => return Err(other),
        }
        self.invoke_method_locked(path, args).map(Some)
    }

    /// Run `f` with the interpreter lock held, tracking this thread's entry into the interpreter. When the
    /// outermost invocation on a thread finishes, anything it left acquired is released.
    pub(crate) fn run_locked<F, R>(&self, f: F) -> Result<R, AmlError>
    where
        F: FnOnce() -> Result<R, AmlError>,
    {
        let _lock = self.lock_interpreter()?;
        let thread = self.handler.thread_id();
        self.with_thread_state(thread, |state| state.nesting += 1);

        let result = f();

        let leftover = {
            let mut threads = self.threads.lock();
            match threads.get_mut(&thread) {
                Some(state) if state.nesting > 1 => {
                    state.nesting -= 1;
                    Vec::new()
                }
                Some(_) => threads.remove(&thread).map(|state| state.acquired).unwrap_or_default(),
                None => Vec::new(),
            }
        };
        self.release_all_mutexes(leftover);

        result
    }

    pub(crate) fn lock_interpreter(&self) -> Result<InterpreterLock<'_>, AmlError> {
        self.handler.wait_semaphore(self.interpreter_lock, 1, 0xffff)?;
        Ok(InterpreterLock(self))
    }

    /// Drop the interpreter lock while `f` runs. Used around anything that blocks, or that could re-enter the
    /// interpreter.
    pub(crate) fn with_interpreter_unlocked<F, R>(&self, f: F) -> Result<R, AmlError>
    where
        F: FnOnce() -> R,
    {
        self.handler.signal_semaphore(self.interpreter_lock, 1);
        let result = f();
        self.handler.wait_semaphore(self.interpreter_lock, 1, 0xffff)?;
        Ok(result)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.handler.delete_semaphore(self.interpreter_lock);
        self.handler.delete_semaphore(self.global_lock.semaphore());
    }
}

pub(crate) struct InterpreterLock<'a>(&'a Interpreter);

impl Drop for InterpreterLock<'_> {
    fn drop(&mut self) {
        self.0.handler.signal_semaphore(self.0.interpreter_lock, 1);
    }
}

/// A semaphore created by a [`Handler`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handle(pub u32);

/// Operations that can fail with [`AmlError::InvalidOperationOnObject`].
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Operation {
    ReadBufferField,
    WriteBufferField,
    ReadField,
    WriteField,
    ConvertToInteger,
    ConvertToString,
    ConvertToBuffer,
    Store,
    DerefOf,
    Index,
    SizeOf,
    Mid,
    Concat,
    Acquire,
    Release,
    Signal,
    Wait,
    Reset,
    Notify,
    CreateField,
}

#[derive(Clone, PartialEq, Debug)]
pub enum AmlError {
    RunOutOfStream,
    IllegalOpcode(u16),
    MalformedStream,

    InvalidName(Option<AmlName>),
    InvalidNameSeg([u8; 4]),
    InvalidNormalizedName(AmlName),
    RootHasNoParent,
    EmptyNamesAreInvalid,
    LevelDoesNotExist(AmlName),
    NameCollision(AmlName),
    ObjectDoesNotExist(AmlName),

    OutOfMemory,

    OperandType,
    OperandValue,
    ObjectNotOfExpectedType { expected: ObjectType, got: ObjectType },
    InvalidOperationOnObject { op: Operation, typ: ObjectType },
    MethodArgCountIncorrect,
    InvalidFieldFlags,

    DivideByZero,
    NumericOverflow,
    PackageLimit,
    BufferLimit,
    RegionLimit,
    UninitializedElement,
    CircularReference,
    NestingTooDeep,

    MutexOrder,
    NotOwner,
    MutexNotAcquired,
    Timeout,

    NoHandlerForRegionAccess(RegionSpace),
    HandlerAlreadyInstalled,
    NoSuchHandler,
    InvalidNotifyTarget,
    RegionSetupFailed,

    BreakOutsideWhile,
    InfiniteLoop,
    CallDepthExceeded,
    /// The method failed to parse, when it was checked before its first invocation or after its table loaded.
    InvalidMethodBody,
    NoCurrentOp,

    /// A `Fatal` op was executed.
    FatalError,
    /// Raised by `Load`, `LoadTable` and `DataRegion`, which need tables this crate doesn't load.
    Unimplemented,
}

/// This trait represents the interface from the `Interpreter` to the hosting kernel, and allows
/// AML to interact with the underlying hardware.
pub trait Handler: Send + Sync {
    fn read_u8(&self, address: usize) -> u8;
    fn read_u16(&self, address: usize) -> u16;
    fn read_u32(&self, address: usize) -> u32;
    fn read_u64(&self, address: usize) -> u64;

    fn write_u8(&self, address: usize, value: u8);
    fn write_u16(&self, address: usize, value: u16);
    fn write_u32(&self, address: usize, value: u32);
    fn write_u64(&self, address: usize, value: u64);

    fn read_io_u8(&self, port: u16) -> u8;
    fn read_io_u16(&self, port: u16) -> u16;
    fn read_io_u32(&self, port: u16) -> u32;

    fn write_io_u8(&self, port: u16, value: u8);
    fn write_io_u16(&self, port: u16, value: u16);
    fn write_io_u32(&self, port: u16, value: u32);

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8;
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16;
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32;

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8);
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16);
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32);

    /// Returns a monotonically-increasing value of nanoseconds.
    fn nanos_since_boot(&self) -> u64;

    /// Stall for at least the given number of **microseconds**. An implementation should not relinquish control of
    /// the processor during the stall, and for this reason, firmwares should not stall for periods of more than
    /// 100 microseconds.
    fn stall(&self, microseconds: u64);

    /// Sleep for at least the given number of **milliseconds**. An implementation may round to the closest sleep
    /// time supported, and should relinquish the processor.
    fn sleep(&self, milliseconds: u64);

    fn create_semaphore(&self, max_units: u32, initial_units: u32) -> Handle;
    /// Wait for `units` units of a semaphore to become available, for at most `timeout` milliseconds. A timeout of
    /// `0xffff` waits forever. Should return `Err(AmlError::Timeout)` if the wait times out.
    fn wait_semaphore(&self, semaphore: Handle, units: u32, timeout: u16) -> Result<(), AmlError>;
    fn signal_semaphore(&self, semaphore: Handle, units: u32);
    fn delete_semaphore(&self, _semaphore: Handle) {}

    /// An identifier for the calling thread. Mutex ownership is tracked per thread.
    fn thread_id(&self) -> u64 {
        0
    }

    /// Run `work` outside of the current context (e.g. on a worker thread). Notify handlers and the wake-up of
    /// threads waiting for the Global Lock are queued through this. By default, the work is run immediately.
    fn queue_deferred(&self, work: Box<dyn FnOnce() + Send>) {
        work()
    }

    /// The Global Lock field of the FACS, if the platform has one.
    fn global_lock(&self) -> Option<&AtomicU32> {
        None
    }

    /// Tell firmware that the Global Lock has been released, after it asked to be told (by setting the pending
    /// bit). This is done by setting `GBL_RLS` in the PM1 control register.
    fn release_firmware_global_lock(&self) {}

    fn handle_debug(&self, _object: &WrappedObject) {}

    fn handle_fatal_error(&self, fatal_type: u8, fatal_code: u32, fatal_arg: u64) {
        error!(
            "Fatal error while executing AML (encountered DefFatalOp). fatal_type = {:?}, fatal_code = {:?}, fatal_arg = {:?}",
            fatal_type, fatal_code, fatal_arg
        );
    }
}
