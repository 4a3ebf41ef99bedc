use crate::{
    namespace::AmlName,
    object::ObjectType,
    AmlError,
    Handle,
    Handler,
    Interpreter,
};
use alloc::{boxed::Box, format, sync::Arc, vec::Vec};
use core::{
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
};
use log::{trace, warn};
use spinning_top::Spinlock;

/// Notification values up to `0x7f` are defined by ACPI and go to the system handler. The rest are device-specific.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NotifyClass {
    System,
    Device,
}

impl NotifyClass {
    pub fn of(value: u64) -> NotifyClass {
        if value <= 0x7f {
            NotifyClass::System
        } else {
            NotifyClass::Device
        }
    }
}

pub trait NotifyHandler: Send + Sync {
    fn handle(&self, target: &AmlName, value: u64);
}

impl<F> NotifyHandler for F
where
    F: Fn(&AmlName, u64) + Send + Sync,
{
    fn handle(&self, target: &AmlName, value: u64) {
        self(target, value)
    }
}

pub trait GpeHandler: Send + Sync {
    fn handle(&self, number: u8);
}

impl<F> GpeHandler for F
where
    F: Fn(u8) + Send + Sync,
{
    fn handle(&self, number: u8) {
        self(number)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GpeTrigger {
    Level,
    Edge,
}

#[derive(Default)]
pub(crate) struct NotifyHandlers {
    system: Option<Arc<dyn NotifyHandler>>,
    device: Option<Arc<dyn NotifyHandler>>,
    objects: Vec<(AmlName, Arc<dyn NotifyHandler>)>,
    gpes: Vec<(u8, Arc<dyn GpeHandler>)>,
}

impl Interpreter {
    /// Install the handler that receives every notification of a class, whatever object it targets.
    pub fn install_global_notify_handler<H>(&self, class: NotifyClass, handler: H) -> Result<(), AmlError>
    where
        H: NotifyHandler + 'static,
    {
        let mut handlers = self.notify_handlers.lock();
        let slot = match class {
            NotifyClass::System => &mut handlers.system,
            NotifyClass::Device => &mut handlers.device,
        };
        if slot.is_some() {
            return Err(AmlError::HandlerAlreadyInstalled);
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    pub fn remove_global_notify_handler(&self, class: NotifyClass) -> Result<(), AmlError> {
        let mut handlers = self.notify_handlers.lock();
        let slot = match class {
            NotifyClass::System => &mut handlers.system,
            NotifyClass::Device => &mut handlers.device,
        };
        slot.take().map(|_| ()).ok_or(AmlError::NoSuchHandler)
    }

    /// Install a handler for notifications to a single object. Only devices, processors, power resources and
    /// thermal zones can be notified.
    pub fn install_notify_handler<H>(&self, target: AmlName, handler: H) -> Result<(), AmlError>
    where
        H: NotifyHandler + 'static,
    {
        let target = target.normalize()?;
        let typ = self.namespace.lock().get_type(target.clone())?;
        if !is_notify_target(typ) {
            return Err(AmlError::InvalidNotifyTarget);
        }

        let mut handlers = self.notify_handlers.lock();
        if handlers.objects.iter().any(|(path, _)| *path == target) {
            return Err(AmlError::HandlerAlreadyInstalled);
        }
        handlers.objects.push((target, Arc::new(handler)));
        Ok(())
    }

    pub fn remove_notify_handler(&self, target: AmlName) -> Result<(), AmlError> {
        let target = target.normalize()?;
        let mut handlers = self.notify_handlers.lock();
        let index = handlers.objects.iter().position(|(path, _)| *path == target).ok_or(AmlError::NoSuchHandler)?;
        handlers.objects.remove(index);
        Ok(())
    }

    /// Deliver a `Notify` from AML. The global handler for the value's class runs first, then the handler for
    /// the target object. Handlers run through [`Handler::queue_deferred`], with the interpreter unlocked.
    pub(crate) fn dispatch_notify(&self, target: &AmlName, typ: ObjectType, value: u64) -> Result<(), AmlError> {
        if !is_notify_target(typ) {
            return Err(AmlError::InvalidNotifyTarget);
        }

        let handlers: Vec<Arc<dyn NotifyHandler>> = {
            let handlers = self.notify_handlers.lock();
            let global = match NotifyClass::of(value) {
                NotifyClass::System => handlers.system.clone(),
                NotifyClass::Device => handlers.device.clone(),
            };
            global
                .into_iter()
                .chain(handlers.objects.iter().filter(|(path, _)| path == target).map(|(_, handler)| handler.clone()))
                .collect()
        };

        if handlers.is_empty() {
            trace!("No handler for Notify({}, {:#x})", target, value);
            return Ok(());
        }

        let target = target.clone();
        self.with_interpreter_unlocked(|| {
            self.handler.queue_deferred(Box::new(move || {
                for handler in handlers {
                    handler.handle(&target, value);
                }
            }))
        })
    }

    pub fn install_gpe_handler<H>(&self, number: u8, handler: H) -> Result<(), AmlError>
    where
        H: GpeHandler + 'static,
    {
        let mut handlers = self.notify_handlers.lock();
        if handlers.gpes.iter().any(|(gpe, _)| *gpe == number) {
            return Err(AmlError::HandlerAlreadyInstalled);
        }
        handlers.gpes.push((number, Arc::new(handler)));
        Ok(())
    }

    pub fn remove_gpe_handler(&self, number: u8) -> Result<(), AmlError> {
        let mut handlers = self.notify_handlers.lock();
        let index = handlers.gpes.iter().position(|(gpe, _)| *gpe == number).ok_or(AmlError::NoSuchHandler)?;
        handlers.gpes.remove(index);
        Ok(())
    }

    /// Handle a General Purpose Event. An installed handler takes priority. Otherwise, the event's control method
    /// (`\_GPE._Lxx` for level-triggered events, `\_GPE._Exx` for edge-triggered ones) is run.
    pub fn handle_gpe(&self, number: u8, trigger: GpeTrigger) -> Result<(), AmlError> {
        let handler =
            self.notify_handlers.lock().gpes.iter().find(|(gpe, _)| *gpe == number).map(|(_, handler)| handler.clone());
        if let Some(handler) = handler {
            handler.handle(number);
            return Ok(());
        }

        let prefix = match trigger {
            GpeTrigger::Level => 'L',
            GpeTrigger::Edge => 'E',
        };
        let path = AmlName::from_str(&format!("\\_GPE._{}{:02X}", prefix, number))?;
        match self.evaluate_if_present(path.clone(), Vec::new())? {
            Some(_) => Ok(()),
            None => {
                warn!("No handler or control method for GPE {:#x}", number);
                Err(AmlError::NoSuchHandler)
            }
        }
    }

    /// Acquire the Global Lock, shared with firmware, for the host. `timeout` is in milliseconds (`0xffff` waits
    /// forever).
    pub fn acquire_global_lock(&self, timeout: u16) -> Result<(), AmlError> {
        let _lock = self.lock_interpreter()?;
        self.global_lock.acquire(self, timeout)
    }

    pub fn release_global_lock(&self) -> Result<(), AmlError> {
        let _lock = self.lock_interpreter()?;
        self.global_lock.release(self)
    }

    /// Called by the host when firmware signals that it has released the Global Lock (the `GBL_RLS` SCI). Threads
    /// waiting for the lock are woken from a deferred task rather than from interrupt context.
    pub fn handle_global_lock_interrupt(&self) {
        let waiters = core::mem::take(&mut self.global_lock.state.lock().waiters);
        if waiters == 0 {
            return;
        }

        let handler = self.handler.clone();
        let semaphore = self.global_lock.semaphore;
        self.handler.queue_deferred(Box::new(move || handler.signal_semaphore(semaphore, waiters)));
    }
}

fn is_notify_target(typ: ObjectType) -> bool {
    matches!(typ, ObjectType::Device | ObjectType::Processor | ObjectType::PowerResource | ObjectType::ThermalZone)
}

const WAIT_FOREVER: u16 = 0xffff;

/// Bits of the Global Lock field in the FACS.
const PENDING: u32 = 1 << 0;
const OWNED: u32 = 1 << 1;

/// The Global Lock. The hardware lock is held exactly while at least one user of the lock in the OS holds it.
pub(crate) struct GlobalLock {
    semaphore: Handle,
    state: Spinlock<GlobalLockState>,
}

#[derive(Default)]
struct GlobalLockState {
    thread_count: usize,
    hardware_held: bool,
    waiters: u32,
}

impl GlobalLock {
    pub fn new(handler: &Arc<dyn Handler>) -> GlobalLock {
        GlobalLock { semaphore: handler.create_semaphore(u32::MAX, 0), state: Spinlock::new(GlobalLockState::default()) }
    }

    pub fn semaphore(&self) -> Handle {
        self.semaphore
    }

    /// Acquire the lock, waiting for firmware to release it for at most `timeout` milliseconds in total.
    /// `0xffff` waits forever.
    pub fn acquire(&self, interpreter: &Interpreter, timeout: u16) -> Result<(), AmlError> {
        let start = interpreter.handler.nanos_since_boot();
        loop {
            {
                let mut state = self.state.lock();
                if state.thread_count > 0 {
                    state.thread_count += 1;
                    return Ok(());
                }

                let acquired = match interpreter.handler.global_lock() {
                    Some(lock) => try_acquire_hardware(lock),
                    // No FACS, so there's no firmware to share the lock with
                    None => true,
                };
                if acquired {
                    state.hardware_held = true;
                    state.thread_count = 1;
                    return Ok(());
                }
                state.waiters += 1;
            }

            let remaining = if timeout == WAIT_FOREVER {
                WAIT_FOREVER
            } else {
                let elapsed = interpreter.handler.nanos_since_boot().saturating_sub(start) / 1_000_000;
                u16::try_from(u64::from(timeout).saturating_sub(elapsed)).unwrap_or(0)
            };

            trace!("Global Lock is owned by firmware. Waiting for it to be released.");
            let result = if remaining == 0 {
                Err(AmlError::Timeout)
            } else {
                interpreter
                    .with_interpreter_unlocked(|| interpreter.handler.wait_semaphore(self.semaphore, 1, remaining))?
            };
            if let Err(err) = result {
                let mut state = self.state.lock();
                state.waiters = state.waiters.saturating_sub(1);
                return Err(err);
            }
        }
    }

    pub fn release(&self, interpreter: &Interpreter) -> Result<(), AmlError> {
        let mut state = self.state.lock();
        if state.thread_count == 0 {
            return Err(AmlError::MutexNotAcquired);
        }

        state.thread_count -= 1;
        if state.thread_count == 0 && state.hardware_held {
            state.hardware_held = false;
            if let Some(lock) = interpreter.handler.global_lock() {
                if release_hardware(lock) {
                    interpreter.handler.release_firmware_global_lock();
                }
            }
        }
        Ok(())
    }
}

/// Try to take the hardware lock. If firmware owns it, the pending bit is set so firmware signals us when it
/// releases the lock. Returns whether the lock was acquired.
fn try_acquire_hardware(lock: &AtomicU32) -> bool {
    let mut old = lock.load(Ordering::Acquire);
    loop {
        let mut new = (old & !PENDING) | OWNED;
        if old & OWNED != 0 {
            new |= PENDING;
        }

        match lock.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return new & PENDING == 0,
            Err(current) => old = current,
        }
    }
}

/// Release the hardware lock. Returns whether firmware was waiting for it, in which case it must be told the
/// lock is free.
fn release_hardware(lock: &AtomicU32) -> bool {
    let old = lock.fetch_and(!(PENDING | OWNED), Ordering::AcqRel);
    old & PENDING != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_classes() {
        assert_eq!(NotifyClass::of(0x00), NotifyClass::System);
        assert_eq!(NotifyClass::of(0x7f), NotifyClass::System);
        assert_eq!(NotifyClass::of(0x80), NotifyClass::Device);
    }

    #[test]
    fn hardware_lock() {
        let lock = AtomicU32::new(0);
        assert!(try_acquire_hardware(&lock));
        assert_eq!(lock.load(Ordering::Relaxed), OWNED);
        assert!(!release_hardware(&lock));
        assert_eq!(lock.load(Ordering::Relaxed), 0);

        // Firmware owns the lock: we mark ourselves as waiting
        lock.store(OWNED, Ordering::Relaxed);
        assert!(!try_acquire_hardware(&lock));
        assert_eq!(lock.load(Ordering::Relaxed), OWNED | PENDING);

        // Firmware releases it, then we take it
        lock.store(0, Ordering::Relaxed);
        assert!(try_acquire_hardware(&lock));

        // If firmware started waiting while we held it, it must be told when we release it
        lock.store(OWNED | PENDING, Ordering::Relaxed);
        assert!(release_hardware(&lock));
    }
}
