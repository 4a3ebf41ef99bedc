use crate::{AmlError, Handle, Handler, WrappedObject};
use alloc::{
    boxed::Box,
    collections::btree_map::BTreeMap,
    format,
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use pci_types::PciAddress;
use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// A host for tests. Memory, IO and PCI configuration space are sparse maps of bytes, all reading as zero until
/// written. Semaphores are real, so tests can use more than one thread.
#[derive(Clone)]
pub(crate) struct TestHandler(Arc<Inner>);

struct Inner {
    semaphores: Mutex<BTreeMap<u32, Semaphore>>,
    semaphore_changed: Condvar,
    next_semaphore: AtomicU32,

    memory: Mutex<BTreeMap<usize, u8>>,
    io: Mutex<BTreeMap<u16, u8>>,
    pci: Mutex<BTreeMap<(u16, u8, u8, u8, u16), u8>>,

    nanos: AtomicU64,
    slept: AtomicU64,
    debug: Mutex<Vec<String>>,
    fatal: Mutex<Vec<(u8, u32, u64)>>,
    global_lock: Option<AtomicU32>,
}

struct Semaphore {
    units: u32,
    max_units: u32,
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

impl TestHandler {
    pub fn new() -> TestHandler {
        TestHandler::build(None)
    }

    /// A host with a FACS Global Lock field.
    pub fn with_global_lock() -> TestHandler {
        TestHandler::build(Some(AtomicU32::new(0)))
    }

    fn build(global_lock: Option<AtomicU32>) -> TestHandler {
        TestHandler(Arc::new(Inner {
            semaphores: Mutex::new(BTreeMap::new()),
            semaphore_changed: Condvar::new(),
            next_semaphore: AtomicU32::new(1),
            memory: Mutex::new(BTreeMap::new()),
            io: Mutex::new(BTreeMap::new()),
            pci: Mutex::new(BTreeMap::new()),
            nanos: AtomicU64::new(0),
            slept: AtomicU64::new(0),
            debug: Mutex::new(Vec::new()),
            fatal: Mutex::new(Vec::new()),
            global_lock,
        }))
    }

    pub fn live_semaphores(&self) -> usize {
        self.0.semaphores.lock().unwrap().len()
    }

    pub fn write_memory(&self, address: usize, bytes: &[u8]) {
        let mut memory = self.0.memory.lock().unwrap();
        for (i, byte) in bytes.iter().enumerate() {
            memory.insert(address + i, *byte);
        }
    }

    pub fn read_memory(&self, address: usize, length: usize) -> Vec<u8> {
        let memory = self.0.memory.lock().unwrap();
        (0..length).map(|i| memory.get(&(address + i)).copied().unwrap_or(0)).collect()
    }

    pub fn read_io(&self, port: u16) -> u8 {
        self.0.io.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    pub fn read_pci(&self, address: PciAddress, offset: u16) -> u8 {
        self.0.pci.lock().unwrap().get(&pci_key(address, offset)).copied().unwrap_or(0)
    }

    pub fn slept(&self) -> u64 {
        self.0.slept.load(Ordering::Relaxed)
    }

    pub fn debug_output(&self) -> Vec<String> {
        self.0.debug.lock().unwrap().clone()
    }

    pub fn fatal_errors(&self) -> Vec<(u8, u32, u64)> {
        self.0.fatal.lock().unwrap().clone()
    }

    pub fn global_lock_field(&self) -> u32 {
        self.0.global_lock.as_ref().map_or(0, |lock| lock.load(Ordering::Relaxed))
    }

    /// Stands in for firmware taking or releasing the Global Lock.
    pub fn set_global_lock_field(&self, value: u32) {
        if let Some(lock) = self.0.global_lock.as_ref() {
            lock.store(value, Ordering::Relaxed);
        }
    }

    fn read_memory_le(&self, address: usize, length: usize) -> u64 {
        self.read_memory(address, length).iter().rev().fold(0, |value, byte| (value << 8) | *byte as u64)
    }

    fn write_memory_le(&self, address: usize, length: usize, value: u64) {
        self.write_memory(address, &value.to_le_bytes()[..length]);
    }

    fn read_io_le(&self, port: u16, length: u16) -> u64 {
        (0..length).rev().fold(0, |value, i| (value << 8) | self.read_io(port + i) as u64)
    }

    fn write_io_le(&self, port: u16, length: u16, value: u64) {
        let mut io = self.0.io.lock().unwrap();
        for i in 0..length {
            io.insert(port + i, (value >> (8 * i)) as u8);
        }
    }

    fn read_pci_le(&self, address: PciAddress, offset: u16, length: u16) -> u64 {
        (0..length).rev().fold(0, |value, i| (value << 8) | self.read_pci(address, offset + i) as u64)
    }

    fn write_pci_le(&self, address: PciAddress, offset: u16, length: u16, value: u64) {
        let mut pci = self.0.pci.lock().unwrap();
        for i in 0..length {
            pci.insert(pci_key(address, offset + i), (value >> (8 * i)) as u8);
        }
    }
}

fn pci_key(address: PciAddress, offset: u16) -> (u16, u8, u8, u8, u16) {
    (address.segment(), address.bus(), address.device(), address.function(), offset)
}

impl Handler for TestHandler {
    fn read_u8(&self, address: usize) -> u8 {
        self.read_memory_le(address, 1) as u8
    }
    fn read_u16(&self, address: usize) -> u16 {
        self.read_memory_le(address, 2) as u16
    }
    fn read_u32(&self, address: usize) -> u32 {
        self.read_memory_le(address, 4) as u32
    }
    fn read_u64(&self, address: usize) -> u64 {
        self.read_memory_le(address, 8)
    }

    fn write_u8(&self, address: usize, value: u8) {
        self.write_memory_le(address, 1, value as u64)
    }
    fn write_u16(&self, address: usize, value: u16) {
        self.write_memory_le(address, 2, value as u64)
    }
    fn write_u32(&self, address: usize, value: u32) {
        self.write_memory_le(address, 4, value as u64)
    }
    fn write_u64(&self, address: usize, value: u64) {
        self.write_memory_le(address, 8, value)
    }

    fn read_io_u8(&self, port: u16) -> u8 {
        self.read_io_le(port, 1) as u8
    }
    fn read_io_u16(&self, port: u16) -> u16 {
        self.read_io_le(port, 2) as u16
    }
    fn read_io_u32(&self, port: u16) -> u32 {
        self.read_io_le(port, 4) as u32
    }

    fn write_io_u8(&self, port: u16, value: u8) {
        self.write_io_le(port, 1, value as u64)
    }
    fn write_io_u16(&self, port: u16, value: u16) {
        self.write_io_le(port, 2, value as u64)
    }
    fn write_io_u32(&self, port: u16, value: u32) {
        self.write_io_le(port, 4, value as u64)
    }

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8 {
        self.read_pci_le(address, offset, 1) as u8
    }
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16 {
        self.read_pci_le(address, offset, 2) as u16
    }
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32 {
        self.read_pci_le(address, offset, 4) as u32
    }

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8) {
        self.write_pci_le(address, offset, 1, value as u64)
    }
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16) {
        self.write_pci_le(address, offset, 2, value as u64)
    }
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32) {
        self.write_pci_le(address, offset, 4, value as u64)
    }

    fn nanos_since_boot(&self) -> u64 {
        self.0.nanos.fetch_add(1000, Ordering::Relaxed)
    }

    fn stall(&self, microseconds: u64) {
        self.0.nanos.fetch_add(microseconds * 1000, Ordering::Relaxed);
    }

    fn sleep(&self, milliseconds: u64) {
        self.0.slept.fetch_add(milliseconds, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(u64::min(milliseconds, 10)));
    }

    fn create_semaphore(&self, max_units: u32, initial_units: u32) -> Handle {
        let handle = self.0.next_semaphore.fetch_add(1, Ordering::Relaxed);
        self.0.semaphores.lock().unwrap().insert(handle, Semaphore { units: initial_units, max_units });
        Handle(handle)
    }

    fn wait_semaphore(&self, semaphore: Handle, units: u32, timeout: u16) -> Result<(), AmlError> {
        let deadline = Instant::now() + Duration::from_millis(timeout as u64);
        let mut semaphores = self.0.semaphores.lock().unwrap();

        loop {
            let entry = semaphores.get_mut(&semaphore.0).ok_or(AmlError::NoSuchHandler)?;
            if entry.units >= units {
                entry.units -= units;
                return Ok(());
            }

            match timeout {
                0 => return Err(AmlError::Timeout),
                0xffff => semaphores = self.0.semaphore_changed.wait(semaphores).unwrap(),
                _ => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(AmlError::Timeout);
                    }
                    semaphores = self.0.semaphore_changed.wait_timeout(semaphores, deadline - now).unwrap().0;
                }
            }
        }
    }

    fn signal_semaphore(&self, semaphore: Handle, units: u32) {
        if let Some(entry) = self.0.semaphores.lock().unwrap().get_mut(&semaphore.0) {
            entry.units = u32::min(entry.units.saturating_add(units), entry.max_units);
        }
        self.0.semaphore_changed.notify_all();
    }

    fn delete_semaphore(&self, semaphore: Handle) {
        self.0.semaphores.lock().unwrap().remove(&semaphore.0);
    }

    fn thread_id(&self) -> u64 {
        THREAD_ID.with(|id| *id)
    }

    fn queue_deferred(&self, work: Box<dyn FnOnce() + Send>) {
        work()
    }

    fn global_lock(&self) -> Option<&AtomicU32> {
        self.0.global_lock.as_ref()
    }

    fn handle_debug(&self, object: &WrappedObject) {
        self.0.debug.lock().unwrap().push(format!("{}", *object.lock()));
    }

    fn handle_fatal_error(&self, fatal_type: u8, fatal_code: u32, fatal_arg: u64) {
        self.0.fatal.lock().unwrap().push((fatal_type, fatal_code, fatal_arg));
    }
}

/*
 * A tiny assembler for the AML used in tests.
 */

/// Encode a `PkgLength` for a package whose contents (after the length) are `length` bytes long.
pub(crate) fn pkg_length(length: usize) -> Vec<u8> {
    if length + 1 < 0x40 {
        return alloc::vec![(length + 1) as u8];
    }
    for extra in 1..=3usize {
        let total = length + 1 + extra;
        if total < 1 << (4 + 8 * extra) {
            let mut bytes = alloc::vec![((extra as u8) << 6) | (total & 0xf) as u8];
            for i in 0..extra {
                bytes.push((total >> (4 + 8 * i)) as u8);
            }
            return bytes;
        }
    }
    panic!("Package too long to encode");
}

/// `op`, then a `PkgLength` covering `body`, then `body`.
pub(crate) fn pkg(op: &[u8], body: &[u8]) -> Vec<u8> {
    let mut bytes = op.to_vec();
    bytes.extend(pkg_length(body.len()));
    bytes.extend_from_slice(body);
    bytes
}

/// Encode a path like `\_SB.PCI0` or `^FOO`. Segments shorter than four characters are padded with `_`.
pub(crate) fn name_string(path: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut rest = path;
    if let Some(stripped) = rest.strip_prefix('\\') {
        bytes.push(b'\\');
        rest = stripped;
    }
    while let Some(stripped) = rest.strip_prefix('^') {
        bytes.push(b'^');
        rest = stripped;
    }

    let segments: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split('.').collect() };
    match segments.len() {
        0 => bytes.push(0x00),
        1 => (),
        2 => bytes.push(0x2e),
        n => {
            bytes.push(0x2f);
            bytes.push(n as u8);
        }
    }
    for segment in segments {
        let mut seg = [b'_'; 4];
        seg[..segment.len()].copy_from_slice(segment.as_bytes());
        bytes.extend_from_slice(&seg);
    }
    bytes
}

pub(crate) fn integer(value: u64) -> Vec<u8> {
    match value {
        0 => alloc::vec![0x00],
        1 => alloc::vec![0x01],
        0..=0xff => alloc::vec![0x0a, value as u8],
        0..=0xffff => [&[0x0b][..], &(value as u16).to_le_bytes()].concat(),
        0..=0xffff_ffff => [&[0x0c][..], &(value as u32).to_le_bytes()].concat(),
        _ => [&[0x0e][..], &value.to_le_bytes()].concat(),
    }
}

pub(crate) fn string(value: &str) -> Vec<u8> {
    [&[0x0d][..], value.as_bytes(), &[0x00]].concat()
}

pub(crate) fn buffer(bytes: &[u8]) -> Vec<u8> {
    let mut body = integer(bytes.len() as u64);
    body.extend_from_slice(bytes);
    pkg(&[0x11], &body)
}

pub(crate) fn package(elements: &[Vec<u8>]) -> Vec<u8> {
    let mut body = alloc::vec![elements.len() as u8];
    for element in elements {
        body.extend_from_slice(element);
    }
    pkg(&[0x12], &body)
}

pub(crate) fn name(path: &str, value: &[u8]) -> Vec<u8> {
    [&[0x08][..], &name_string(path), value].concat()
}

pub(crate) fn scope(path: &str, body: &[u8]) -> Vec<u8> {
    pkg(&[0x10], &[&name_string(path)[..], body].concat())
}

pub(crate) fn device(path: &str, body: &[u8]) -> Vec<u8> {
    pkg(&[0x5b, 0x82], &[&name_string(path)[..], body].concat())
}

/// A method taking `arg_count` arguments, with the other flags clear.
pub(crate) fn method(path: &str, arg_count: u8, body: &[u8]) -> Vec<u8> {
    method_with_flags(path, arg_count & 0x7, body)
}

pub(crate) fn method_with_flags(path: &str, flags: u8, body: &[u8]) -> Vec<u8> {
    pkg(&[0x14], &[&name_string(path)[..], &[flags], body].concat())
}

pub(crate) fn ret(value: &[u8]) -> Vec<u8> {
    [&[0xa4][..], value].concat()
}

pub(crate) fn store(value: &[u8], target: &[u8]) -> Vec<u8> {
    [&[0x70][..], value, target].concat()
}

pub(crate) fn if_else(predicate: &[u8], then: &[u8], otherwise: Option<&[u8]>) -> Vec<u8> {
    let mut bytes = pkg(&[0xa0], &[predicate, then].concat());
    if let Some(otherwise) = otherwise {
        bytes.extend(pkg(&[0xa1], otherwise));
    }
    bytes
}

pub(crate) fn while_loop(predicate: &[u8], body: &[u8]) -> Vec<u8> {
    pkg(&[0xa2], &[predicate, body].concat())
}

pub(crate) const LOCAL0: u8 = 0x60;
pub(crate) const LOCAL1: u8 = 0x61;
pub(crate) const LOCAL2: u8 = 0x62;
pub(crate) const ARG0: u8 = 0x68;
pub(crate) const ARG1: u8 = 0x69;
