#![no_main]
use aml_engine::{AmlError, Handle, Interpreter, InterpreterConfig, ParsePolicy};
use libfuzzer_sys::fuzz_target;
use pci_types::PciAddress;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex,
    },
};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

fuzz_target!(|data: &[u8]| {
    if let Ok(false) = INITIALIZED.compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed) {
        simplelog::SimpleLogger::init(simplelog::LevelFilter::Trace, simplelog::Config::default()).unwrap();
    }

    let config = InterpreterConfig {
        parse_policy: ParsePolicy::AtInit,
        max_loop_iterations: 64,
        max_call_depth: 16,
        max_object_size: 4096,
    };
    let interpreter = Interpreter::with_config(Handler::default(), 2, config);
    let _ = interpreter.load_table(data);
});

/// Everything reads as zero, and nothing ever blocks: a wait that can't be satisfied straight away times out.
#[derive(Default)]
struct Handler {
    semaphores: Mutex<HashMap<u32, (u32, u32)>>,
    next_semaphore: AtomicU32,
}

impl aml_engine::Handler for Handler {
    fn read_u8(&self, _address: usize) -> u8 {
        0
    }
    fn read_u16(&self, _address: usize) -> u16 {
        0
    }
    fn read_u32(&self, _address: usize) -> u32 {
        0
    }
    fn read_u64(&self, _address: usize) -> u64 {
        0
    }

    fn write_u8(&self, _address: usize, _value: u8) {}
    fn write_u16(&self, _address: usize, _value: u16) {}
    fn write_u32(&self, _address: usize, _value: u32) {}
    fn write_u64(&self, _address: usize, _value: u64) {}

    fn read_io_u8(&self, _port: u16) -> u8 {
        0
    }
    fn read_io_u16(&self, _port: u16) -> u16 {
        0
    }
    fn read_io_u32(&self, _port: u16) -> u32 {
        0
    }

    fn write_io_u8(&self, _port: u16, _value: u8) {}
    fn write_io_u16(&self, _port: u16, _value: u16) {}
    fn write_io_u32(&self, _port: u16, _value: u32) {}

    fn read_pci_u8(&self, _address: PciAddress, _offset: u16) -> u8 {
        0
    }
    fn read_pci_u16(&self, _address: PciAddress, _offset: u16) -> u16 {
        0
    }
    fn read_pci_u32(&self, _address: PciAddress, _offset: u16) -> u32 {
        0
    }
    fn write_pci_u8(&self, _address: PciAddress, _offset: u16, _value: u8) {}
    fn write_pci_u16(&self, _address: PciAddress, _offset: u16, _value: u16) {}
    fn write_pci_u32(&self, _address: PciAddress, _offset: u16, _value: u32) {}

    fn nanos_since_boot(&self) -> u64 {
        0
    }
    fn stall(&self, _microseconds: u64) {}
    fn sleep(&self, _milliseconds: u64) {}

    fn create_semaphore(&self, max_units: u32, initial_units: u32) -> Handle {
        let handle = self.next_semaphore.fetch_add(1, Ordering::Relaxed);
        self.semaphores.lock().unwrap().insert(handle, (initial_units, max_units));
        Handle(handle)
    }

    fn wait_semaphore(&self, semaphore: Handle, units: u32, _timeout: u16) -> Result<(), AmlError> {
        let mut semaphores = self.semaphores.lock().unwrap();
        let (available, _) = semaphores.get_mut(&semaphore.0).ok_or(AmlError::NoSuchHandler)?;
        if *available < units {
            return Err(AmlError::Timeout);
        }
        *available -= units;
        Ok(())
    }

    fn signal_semaphore(&self, semaphore: Handle, units: u32) {
        if let Some((available, max)) = self.semaphores.lock().unwrap().get_mut(&semaphore.0) {
            *available = u32::min(available.saturating_add(units), *max);
        }
    }
}
