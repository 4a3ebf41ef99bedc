use crate::{
    object::{Object, ObjectType, WrappedObject},
    AmlError,
    Handle,
    Handler,
    Interpreter,
    Operation,
};
use alloc::{sync::Arc, vec::Vec};
use log::{trace, warn};

/// A semaphore created by the host through [`Handler::create_semaphore`]. It is deleted when dropped, which happens
/// when the last reference to the `Mutex` or `Event` object that owns it goes away.
pub struct OsSemaphore {
    handle: Handle,
    handler: Arc<dyn Handler>,
}

impl OsSemaphore {
    pub(crate) fn new(handler: &Arc<dyn Handler>, max_units: u32, initial_units: u32) -> OsSemaphore {
        OsSemaphore { handle: handler.create_semaphore(max_units, initial_units), handler: handler.clone() }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl Drop for OsSemaphore {
    fn drop(&mut self) {
        self.handler.delete_semaphore(self.handle);
    }
}

/// An AML `Mutex`. A mutex is owned by at most one thread at a time, and may be re-acquired by its owner.
pub struct AmlMutex {
    semaphore: OsSemaphore,
    pub(crate) sync_level: u8,
    /// The `thread_id` of the owning thread, if the mutex is held. `depth > 0` exactly when this is `Some`.
    owner: Option<u64>,
    depth: usize,
    /// `\_GL` also takes the firmware Global Lock when it is acquired.
    is_global_lock: bool,
}

impl AmlMutex {
    pub(crate) fn new(handler: &Arc<dyn Handler>, sync_level: u8) -> AmlMutex {
        AmlMutex { semaphore: OsSemaphore::new(handler, 1, 1), sync_level, owner: None, depth: 0, is_global_lock: false }
    }

    pub(crate) fn global_lock(handler: &Arc<dyn Handler>) -> AmlMutex {
        AmlMutex { is_global_lock: true, ..AmlMutex::new(handler, 0) }
    }

    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// What the interpreter tracks about each thread currently executing AML.
#[derive(Default)]
pub(crate) struct ThreadState {
    /// Raised to the level of each mutex as it is acquired. Mutexes of a lower level can't be acquired.
    pub current_sync_level: u8,
    /// Mutexes held by this thread, most recently acquired last.
    pub acquired: Vec<WrappedObject>,
    /// How many invocations of the interpreter this thread is inside. Region setup and notify handlers can
    /// re-enter the interpreter on the same thread.
    pub nesting: usize,
}

impl Interpreter {
    /// Acquire an AML mutex, waiting for at most `timeout` milliseconds (`0xffff` waits forever). Returns `true`
    /// if the wait timed out, which is how AML sees the result of `Acquire`.
    pub(crate) fn acquire_mutex(&self, mutex: &WrappedObject, timeout: u16) -> Result<bool, AmlError> {
        let thread = self.handler.thread_id();

        let (sync_level, handle, is_global_lock) = {
            let mut object = mutex.lock();
            let Object::Mutex(ref mut inner) = *object else {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Mutex, got: object.typ() });
            };

            if self.thread_sync_level(thread) > inner.sync_level {
                return Err(AmlError::MutexOrder);
            }
            if inner.owner == Some(thread) {
                inner.depth += 1;
                return Ok(false);
            }
            (inner.sync_level, inner.semaphore.handle(), inner.is_global_lock)
        };

        match self.with_interpreter_unlocked(|| self.handler.wait_semaphore(handle, 1, timeout))? {
            Ok(()) => (),
            Err(AmlError::Timeout) => return Ok(true),
            Err(other) => return Err(other),
        }

        if is_global_lock {
            match self.global_lock.acquire(self, timeout) {
                Ok(()) => (),
                Err(AmlError::Timeout) => {
                    self.handler.signal_semaphore(handle, 1);
                    return Ok(true);
                }
                Err(other) => {
                    self.handler.signal_semaphore(handle, 1);
                    return Err(other);
                }
            }
        }

        {
            let mut object = mutex.lock();
            if let Object::Mutex(ref mut inner) = *object {
                inner.owner = Some(thread);
                inner.depth = 1;
            }
        }
        self.with_thread_state(thread, |state| {
            state.acquired.push(mutex.clone());
            state.current_sync_level = sync_level;
        });

        trace!("Thread {} acquired mutex (sync level {})", thread, sync_level);
        Ok(false)
    }

    pub(crate) fn release_mutex(&self, mutex: &WrappedObject) -> Result<(), AmlError> {
        let thread = self.handler.thread_id();

        let (sync_level, handle, is_global_lock) = {
            let mut object = mutex.lock();
            let Object::Mutex(ref mut inner) = *object else {
                return Err(AmlError::InvalidOperationOnObject { op: Operation::Release, typ: object.typ() });
            };

            match inner.owner {
                None => return Err(AmlError::MutexNotAcquired),
                Some(owner) if owner != thread => return Err(AmlError::NotOwner),
                Some(_) => (),
            }
            if inner.sync_level > self.thread_sync_level(thread) {
                return Err(AmlError::MutexOrder);
            }

            inner.depth -= 1;
            if inner.depth > 0 {
                return Ok(());
            }
            inner.owner = None;
            (inner.sync_level, inner.semaphore.handle(), inner.is_global_lock)
        };

        /*
         * The thread's sync level becomes the level of the mutex that was just released, rather than the level
         * of whatever is now the most recently acquired mutex.
         */
        self.with_thread_state(thread, |state| {
            state.acquired.retain(|held| !held.ptr_eq(mutex));
            state.current_sync_level = sync_level;
        });

        if is_global_lock {
            self.global_lock.release(self)?;
        }
        self.handler.signal_semaphore(handle, 1);
        Ok(())
    }

    /// Release every mutex a thread still holds. This happens when the outermost invocation of the interpreter on
    /// a thread finishes: firmware is supposed to release everything it acquires, but doesn't always.
    pub(crate) fn release_all_mutexes(&self, acquired: Vec<WrappedObject>) {
        for mutex in acquired.into_iter().rev() {
            let released = {
                let mut object = mutex.lock();
                match *object {
                    Object::Mutex(ref mut inner) if inner.owner.is_some() => {
                        inner.owner = None;
                        inner.depth = 0;
                        Some((inner.semaphore.handle(), inner.is_global_lock))
                    }
                    _ => None,
                }
            };

            if let Some((handle, is_global_lock)) = released {
                warn!("AML did not release a mutex before returning. Releasing it.");
                if is_global_lock {
                    if let Err(err) = self.global_lock.release(self) {
                        warn!("Failed to release the Global Lock: {:?}", err);
                    }
                }
                self.handler.signal_semaphore(handle, 1);
            }
        }
    }

    fn thread_sync_level(&self, thread: u64) -> u8 {
        self.threads.lock().get(&thread).map(|state| state.current_sync_level).unwrap_or(0)
    }

    pub(crate) fn with_thread_state<F, R>(&self, thread: u64, f: F) -> R
    where
        F: FnOnce(&mut ThreadState) -> R,
    {
        f(self.threads.lock().entry(thread).or_default())
    }

    /// `Signal`: add a unit to an `Event`.
    pub(crate) fn signal_event(&self, event: &WrappedObject) -> Result<(), AmlError> {
        let handle = self.event_handle(event, Operation::Signal)?;
        self.handler.signal_semaphore(handle, 1);
        Ok(())
    }

    /// `Wait`: wait for an `Event` to be signalled. Returns `true` if the wait timed out.
    pub(crate) fn wait_event(&self, event: &WrappedObject, timeout: u64) -> Result<bool, AmlError> {
        let handle = self.event_handle(event, Operation::Wait)?;
        let timeout = u16::try_from(timeout).unwrap_or(0xffff);

        match self.with_interpreter_unlocked(|| self.handler.wait_semaphore(handle, 1, timeout))? {
            Ok(()) => Ok(false),
            Err(AmlError::Timeout) => Ok(true),
            Err(other) => Err(other),
        }
    }

    /// `Reset`: drop any pending signals of an `Event`, by replacing its semaphore with a fresh one.
    pub(crate) fn reset_event(&self, event: &WrappedObject) -> Result<(), AmlError> {
        let semaphore = OsSemaphore::new(&self.handler, u32::MAX, 0);
        let mut object = event.lock();
        match *object {
            Object::Event(ref mut old) => {
                *old = semaphore;
                Ok(())
            }
            ref other => Err(AmlError::InvalidOperationOnObject { op: Operation::Reset, typ: other.typ() }),
        }
    }

    fn event_handle(&self, event: &WrappedObject, op: Operation) -> Result<Handle, AmlError> {
        match *event.lock() {
            Object::Event(ref semaphore) => Ok(semaphore.handle()),
            ref other => Err(AmlError::InvalidOperationOnObject { op, typ: other.typ() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestHandler;

    fn mutex(interpreter: &Interpreter, sync_level: u8) -> WrappedObject {
        Object::Mutex(AmlMutex::new(&interpreter.handler, sync_level)).wrap()
    }

    #[test]
    fn reacquire_increments_depth() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        let _lock = interpreter.lock_interpreter().unwrap();
        let m = mutex(&interpreter, 3);

        assert_eq!(interpreter.acquire_mutex(&m, 0xffff), Ok(false));
        assert_eq!(interpreter.acquire_mutex(&m, 0xffff), Ok(false));
        let thread = interpreter.handler().thread_id();
        assert!(matches!(*m.lock(), Object::Mutex(ref inner) if inner.depth() == 2 && inner.owner() == Some(thread)));

        interpreter.release_mutex(&m).unwrap();
        interpreter.release_mutex(&m).unwrap();
        assert!(matches!(*m.lock(), Object::Mutex(ref inner) if inner.depth() == 0 && inner.owner().is_none()));
        assert_eq!(interpreter.release_mutex(&m), Err(AmlError::MutexNotAcquired));
    }

    #[test]
    fn lower_sync_level_is_refused() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        let _lock = interpreter.lock_interpreter().unwrap();
        let a = mutex(&interpreter, 2);
        let b = mutex(&interpreter, 1);

        assert_eq!(interpreter.acquire_mutex(&a, 0xffff), Ok(false));
        assert_eq!(interpreter.acquire_mutex(&b, 0xffff), Err(AmlError::MutexOrder));
        interpreter.release_mutex(&a).unwrap();
    }

    #[test]
    fn out_of_order_release_is_refused() {
        let interpreter = Interpreter::new(TestHandler::new(), 2);
        let _lock = interpreter.lock_interpreter().unwrap();
        let a = mutex(&interpreter, 2);
        let b = mutex(&interpreter, 3);

        interpreter.acquire_mutex(&a, 0xffff).unwrap();
        interpreter.acquire_mutex(&b, 0xffff).unwrap();
        // Releasing `a` first drops the thread's level to 2, below the level of `b`
        interpreter.release_mutex(&a).unwrap();
        assert_eq!(interpreter.release_mutex(&b), Err(AmlError::MutexOrder));
    }

    #[test]
    fn timeout_is_reported_as_true() {
        let handler = TestHandler::new();
        let interpreter = Interpreter::new(handler.clone(), 2);
        let _lock = interpreter.lock_interpreter().unwrap();
        let m = mutex(&interpreter, 0);

        // Someone else holds the mutex's semaphore
        let handle = match *m.lock() {
            Object::Mutex(ref inner) => inner.semaphore.handle(),
            _ => panic!(),
        };
        handler.wait_semaphore(handle, 1, 0).unwrap();

        assert_eq!(interpreter.acquire_mutex(&m, 0), Ok(true));
    }

    #[test]
    fn semaphore_deleted_on_drop() {
        let handler = TestHandler::new();
        let interpreter = Interpreter::new(handler.clone(), 2);
        let live = handler.live_semaphores();
        let m = mutex(&interpreter, 0);
        assert_eq!(handler.live_semaphores(), live + 1);
        drop(m);
        assert_eq!(handler.live_semaphores(), live);
    }
}
