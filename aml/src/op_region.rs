use crate::{
    namespace::{AmlName, NameSeg},
    object::{Object, ObjectType, WeakObject, WrappedObject},
    stream::AmlSpan,
    AmlError,
    Interpreter,
};
use alloc::{sync::Arc, vec, vec::Vec};
use bit_field::BitField;
use core::fmt;
use log::{trace, warn};
use pci_types::PciAddress;
use spinning_top::Spinlock;

#[derive(Clone)]
pub struct OpRegion {
    pub space: RegionSpace,
    pub base: u64,
    pub length: u64,
    pub parent_device_path: AmlName,
    /// The offset and length operands, if they haven't been evaluated yet.
    pub(crate) deferred: Option<(AmlSpan, AmlName)>,
    pub(crate) handler: Option<Arc<InstalledHandler>>,
    pub(crate) setup: SetupState,
}

impl OpRegion {
    pub(crate) fn new(space: RegionSpace, base: u64, length: u64, parent_device_path: AmlName) -> OpRegion {
        OpRegion { space, base, length, parent_device_path, deferred: None, handler: None, setup: SetupState::NotStarted }
    }

    pub(crate) fn deferred(space: RegionSpace, args: AmlSpan, scope: AmlName, parent_device_path: AmlName) -> OpRegion {
        OpRegion { deferred: Some((args, scope)), ..OpRegion::new(space, 0, 0, parent_device_path) }
    }
}

impl fmt::Display for OpRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deferred.is_some() {
            write!(f, "OpRegion({:?}, [deferred])", self.space)
        } else {
            write!(f, "OpRegion({:?}, base: {:#x}, length: {:#x})", self.space, self.base, self.length)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum SetupState {
    NotStarted,
    InProgress,
    /// Setup has run, and returned this region context.
    Done(u64),
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum SetupFunction {
    Activate,
    Deactivate,
}

/// Provides access to an address space. Handlers are installed on a device (or the root), and serve the regions
/// of their space below it that don't have a nearer handler.
pub trait RegionHandler: Send + Sync {
    /// Called once before the first access to a region, and when the handler is removed. The value returned on
    /// activation is passed back to `read` and `write` as the region context. This may evaluate AML.
    fn setup(&self, _interpreter: &Interpreter, _region: &OpRegion, _function: SetupFunction) -> Result<u64, AmlError> {
        Ok(0)
    }

    fn read(
        &self,
        interpreter: &Interpreter,
        region: &OpRegion,
        context: u64,
        offset: u64,
        bit_width: u8,
    ) -> Result<u64, AmlError>;

    fn write(
        &self,
        interpreter: &Interpreter,
        region: &OpRegion,
        context: u64,
        offset: u64,
        bit_width: u8,
        value: u64,
    ) -> Result<(), AmlError>;
}

pub struct InstalledHandler {
    pub(crate) space: RegionSpace,
    pub(crate) handler: Arc<dyn RegionHandler>,
    /// Handlers that may evaluate AML are called with the interpreter unlocked. Only the built-in memory and IO
    /// handlers are known not to.
    pub(crate) reentrant: bool,
    regions: Spinlock<Vec<WeakObject>>,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RegionSpace {
    SystemMemory,
    SystemIO,
    PciConfig,
    EmbeddedControl,
    SmBus,
    SystemCmos,
    PciBarTarget,
    Ipmi,
    GeneralPurposeIo,
    GenericSerialBus,
    Pcc,
    Oem(u8),
}

impl RegionSpace {
    /// The value passed to `_REG` to identify this space.
    pub fn id(&self) -> u8 {
        match self {
            RegionSpace::SystemMemory => 0,
            RegionSpace::SystemIO => 1,
            RegionSpace::PciConfig => 2,
            RegionSpace::EmbeddedControl => 3,
            RegionSpace::SmBus => 4,
            RegionSpace::SystemCmos => 5,
            RegionSpace::PciBarTarget => 6,
            RegionSpace::Ipmi => 7,
            RegionSpace::GeneralPurposeIo => 8,
            RegionSpace::GenericSerialBus => 9,
            RegionSpace::Pcc => 10,
            RegionSpace::Oem(id) => *id,
        }
    }

    /// Memory and IO are always available, so their regions are never told about handlers coming and going.
    fn runs_reg(&self) -> bool {
        !matches!(self, RegionSpace::SystemMemory | RegionSpace::SystemIO)
    }
}

impl From<u8> for RegionSpace {
    fn from(value: u8) -> Self {
        match value {
            0 => RegionSpace::SystemMemory,
            1 => RegionSpace::SystemIO,
            2 => RegionSpace::PciConfig,
            3 => RegionSpace::EmbeddedControl,
            4 => RegionSpace::SmBus,
            5 => RegionSpace::SystemCmos,
            6 => RegionSpace::PciBarTarget,
            7 => RegionSpace::Ipmi,
            8 => RegionSpace::GeneralPurposeIo,
            9 => RegionSpace::GenericSerialBus,
            10 => RegionSpace::Pcc,
            _ => RegionSpace::Oem(value),
        }
    }
}

impl Interpreter {
    /// Install a handler for `space`, serving regions below `device` (which may be the root). Regions in that
    /// subtree that were served by a more distant handler are moved over to the new one.
    pub fn install_region_handler<H>(&self, device: AmlName, space: RegionSpace, handler: H) -> Result<(), AmlError>
    where
        H: RegionHandler + 'static,
    {
        self.run_locked(|| self.install_region_handler_locked(device, space, Arc::new(handler), true))
    }

    pub(crate) fn install_region_handler_locked(
        &self,
        device: AmlName,
        space: RegionSpace,
        handler: Arc<dyn RegionHandler>,
        reentrant: bool,
    ) -> Result<(), AmlError> {
        let device = device.normalize()?;
        let installed = Arc::new(InstalledHandler { space, handler, reentrant, regions: Spinlock::new(vec![]) });

        {
            let mut handlers = self.region_handlers.lock();
            if handlers.iter().any(|(path, existing)| *path == device && existing.space == space) {
                return Err(AmlError::HandlerAlreadyInstalled);
            }
            handlers.push((device.clone(), installed.clone()));
        }

        for region in self.regions_below(&device, space)? {
            let (parent, current) = match *region.lock() {
                Object::OpRegion(ref region) => (region.parent_device_path.clone(), region.handler.clone()),
                _ => continue,
            };
            let Some(nearest) = self.find_region_handler(&parent, space) else { continue };
            if !Arc::ptr_eq(&nearest, &installed) {
                continue;
            }

            /*
             * A region is told it is losing its old handler before it is told about the new one.
             */
            if current.is_some() {
                self.disassociate_region(&region)?;
            }
            self.associate_region(&region, &installed)?;
        }

        Ok(())
    }

    /// Remove the handler for `space` installed on `device`. Each region it served has `_REG(space, 0)` run and
    /// is deactivated. The next access to one of those regions looks for a new handler.
    pub fn remove_region_handler(&self, device: AmlName, space: RegionSpace) -> Result<(), AmlError> {
        self.run_locked(|| self.remove_region_handler_locked(device, space))
    }

    fn remove_region_handler_locked(&self, device: AmlName, space: RegionSpace) -> Result<(), AmlError> {
        let device = device.normalize()?;

        let installed = {
            let mut handlers = self.region_handlers.lock();
            let index = handlers
                .iter()
                .position(|(path, existing)| *path == device && existing.space == space)
                .ok_or(AmlError::NoSuchHandler)?;
            handlers.remove(index).1
        };

        let regions: Vec<WeakObject> = core::mem::take(&mut *installed.regions.lock());
        for region in regions.iter().filter_map(WeakObject::upgrade) {
            self.disassociate_region(&region)?;
        }
        Ok(())
    }

    /// Find the handler nearest to `device` for a space: the first one installed on `device` or one of its
    /// ancestors.
    fn find_region_handler(&self, device: &AmlName, space: RegionSpace) -> Option<Arc<InstalledHandler>> {
        self.region_handlers
            .lock()
            .iter()
            .filter(|(path, handler)| handler.space == space && device.is_within(path))
            .max_by_key(|(path, _)| path.as_string().len())
            .map(|(_, handler)| handler.clone())
    }

    fn regions_below(&self, scope: &AmlName, space: RegionSpace) -> Result<Vec<WrappedObject>, AmlError> {
        let mut regions = Vec::new();
        self.namespace.lock().traverse(|path, level| {
            if !path.is_within(scope) {
                // Keep walking down towards `scope`
                return Ok(scope.is_within(path));
            }
            for (_, object) in level.values.values() {
                if matches!(*object.lock(), Object::OpRegion(ref region) if region.space == space) {
                    regions.push(object.clone());
                }
            }
            Ok(true)
        })?;
        Ok(regions)
    }

    fn associate_region(&self, region: &WrappedObject, installed: &Arc<InstalledHandler>) -> Result<(), AmlError> {
        let parent = {
            let mut object = region.lock();
            let Object::OpRegion(ref mut inner) = *object else { return Ok(()) };
            inner.handler = Some(installed.clone());
            inner.setup = SetupState::NotStarted;
            inner.parent_device_path.clone()
        };
        installed.regions.lock().push(region.downgrade());

        if installed.space.runs_reg() {
            self.run_reg(&parent, installed.space, true);
        }
        Ok(())
    }

    fn disassociate_region(&self, region: &WrappedObject) -> Result<(), AmlError> {
        let (snapshot, installed) = {
            let object = region.lock();
            let Object::OpRegion(ref inner) = *object else { return Ok(()) };
            let Some(ref installed) = inner.handler else { return Ok(()) };
            (inner.clone(), installed.clone())
        };

        if installed.space.runs_reg() {
            self.run_reg(&snapshot.parent_device_path, installed.space, false);
        }
        if let SetupState::Done(_) = snapshot.setup {
            let result =
                self.with_interpreter_unlocked(|| installed.handler.setup(self, &snapshot, SetupFunction::Deactivate))?;
            if let Err(err) = result {
                warn!("Deactivating region failed: {:?}", err);
            }
        }

        if let Object::OpRegion(ref mut inner) = *region.lock() {
            inner.handler = None;
            inner.setup = SetupState::NotStarted;
        }
        installed.regions.lock().retain(|weak| weak.upgrade().is_some_and(|other| !other.ptr_eq(region)));
        Ok(())
    }

    /// Run `_REG(space, connect)` in the region's parent device, if it has one. Failures are reported, but don't
    /// stop the handler being (dis)connected.
    fn run_reg(&self, device: &AmlName, space: RegionSpace, connect: bool) {
        let Ok(path) = AmlName::from_name_seg(NameSeg(*b"_REG")).resolve(device) else { return };
        let args = vec![Object::Integer(space.id() as u64).wrap(), Object::Integer(connect as u64).wrap()];

        trace!("Running {}({:?}, {})", path, space, connect);
        if let Err(err) = self.evaluate_if_present_locked(path.clone(), args) {
            warn!("{} failed: {:?}", path, err);
        }
    }

    /// Associate regions created while loading a table with their handlers, running `_REG` for them.
    pub(crate) fn connect_new_regions(&self) -> Result<(), AmlError> {
        let regions = core::mem::take(&mut *self.pending_regions.lock());
        for region in regions {
            let (space, parent, associated) = match *region.lock() {
                Object::OpRegion(ref inner) => (inner.space, inner.parent_device_path.clone(), inner.handler.is_some()),
                _ => continue,
            };
            if associated || !space.runs_reg() {
                continue;
            }
            if let Some(installed) = self.find_region_handler(&parent, space) {
                self.associate_region(&region, &installed)?;
            }
        }
        Ok(())
    }

    /// Get a region ready for access: evaluate its operands, find its handler, and run the handler's setup if
    /// this is the first access.
    fn prepare_region(&self, region: &WrappedObject) -> Result<(OpRegion, Arc<InstalledHandler>, u64), AmlError> {
        self.evaluate_region_operands(region)?;

        let (space, parent, current) = match *region.lock() {
            Object::OpRegion(ref inner) => (inner.space, inner.parent_device_path.clone(), inner.handler.clone()),
            ref other => {
                return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::OpRegion, got: other.typ() })
            }
        };
        let installed = match current {
            Some(installed) => installed,
            None => {
                let installed =
                    self.find_region_handler(&parent, space).ok_or(AmlError::NoHandlerForRegionAccess(space))?;
                self.associate_region(region, &installed)?;
                installed
            }
        };

        let snapshot = {
            let mut object = region.lock();
            let Object::OpRegion(ref mut inner) = *object else { return Err(AmlError::RegionSetupFailed) };
            match inner.setup {
                SetupState::Done(context) => return Ok((inner.clone(), installed, context)),
                // A reentrant Setup whose AML accesses the region it is setting up
                SetupState::InProgress => return Err(AmlError::RegionSetupFailed),
                SetupState::NotStarted => {
                    inner.setup = SetupState::InProgress;
                    inner.clone()
                }
            }
        };

        let result = if installed.reentrant {
            self.with_interpreter_unlocked(|| installed.handler.setup(self, &snapshot, SetupFunction::Activate))?
        } else {
            installed.handler.setup(self, &snapshot, SetupFunction::Activate)
        };

        let mut object = region.lock();
        let Object::OpRegion(ref mut inner) = *object else { return Err(AmlError::RegionSetupFailed) };
        match result {
            Ok(context) => {
                inner.setup = SetupState::Done(context);
                Ok((inner.clone(), installed, context))
            }
            Err(err) => {
                inner.setup = SetupState::NotStarted;
                Err(err)
            }
        }
    }

    pub(crate) fn read_region(&self, region: &WrappedObject, offset: u64, bit_width: u8) -> Result<u64, AmlError> {
        let (snapshot, installed, context) = self.prepare_region(region)?;
        check_region_bounds(&snapshot, offset, bit_width)?;

        if installed.reentrant {
            self.with_interpreter_unlocked(|| installed.handler.read(self, &snapshot, context, offset, bit_width))?
        } else {
            installed.handler.read(self, &snapshot, context, offset, bit_width)
        }
    }

    pub(crate) fn write_region(
        &self,
        region: &WrappedObject,
        offset: u64,
        bit_width: u8,
        value: u64,
    ) -> Result<(), AmlError> {
        let (snapshot, installed, context) = self.prepare_region(region)?;
        check_region_bounds(&snapshot, offset, bit_width)?;

        if installed.reentrant {
            self.with_interpreter_unlocked(|| {
                installed.handler.write(self, &snapshot, context, offset, bit_width, value)
            })?
        } else {
            installed.handler.write(self, &snapshot, context, offset, bit_width, value)
        }
    }

    /// Install the handlers for the spaces the host always provides.
    pub(crate) fn install_default_region_handlers(&self) -> Result<(), AmlError> {
        self.install_region_handler_locked(AmlName::root(), RegionSpace::SystemMemory, Arc::new(SystemMemoryHandler), false)?;
        self.install_region_handler_locked(AmlName::root(), RegionSpace::SystemIO, Arc::new(SystemIoHandler), false)?;
        // Setup evaluates `_ADR`, `_SEG` and `_BBN`
        self.install_region_handler_locked(AmlName::root(), RegionSpace::PciConfig, Arc::new(PciConfigHandler), true)?;
        Ok(())
    }
}

fn check_region_bounds(region: &OpRegion, offset: u64, bit_width: u8) -> Result<(), AmlError> {
    let end = offset.checked_add((bit_width as u64).div_ceil(8)).ok_or(AmlError::RegionLimit)?;
    if end > region.length {
        return Err(AmlError::RegionLimit);
    }
    Ok(())
}

struct SystemMemoryHandler;

impl RegionHandler for SystemMemoryHandler {
    fn read(&self, interpreter: &Interpreter, region: &OpRegion, _: u64, offset: u64, bit_width: u8) -> Result<u64, AmlError> {
        let address = region.base.checked_add(offset).ok_or(AmlError::RegionLimit)? as usize;
        let handler = interpreter.handler();
        Ok(match bit_width {
            8 => handler.read_u8(address) as u64,
            16 => handler.read_u16(address) as u64,
            32 => handler.read_u32(address) as u64,
            64 => handler.read_u64(address),
            _ => return Err(AmlError::OperandValue),
        })
    }

    fn write(
        &self,
        interpreter: &Interpreter,
        region: &OpRegion,
        _: u64,
        offset: u64,
        bit_width: u8,
        value: u64,
    ) -> Result<(), AmlError> {
        let address = region.base.checked_add(offset).ok_or(AmlError::RegionLimit)? as usize;
        let handler = interpreter.handler();
        match bit_width {
            8 => handler.write_u8(address, value as u8),
            16 => handler.write_u16(address, value as u16),
            32 => handler.write_u32(address, value as u32),
            64 => handler.write_u64(address, value),
            _ => return Err(AmlError::OperandValue),
        }
        Ok(())
    }
}

struct SystemIoHandler;

impl SystemIoHandler {
    fn port(region: &OpRegion, offset: u64) -> Result<u16, AmlError> {
        region.base.checked_add(offset).and_then(|port| u16::try_from(port).ok()).ok_or(AmlError::RegionLimit)
    }
}

impl RegionHandler for SystemIoHandler {
    fn read(&self, interpreter: &Interpreter, region: &OpRegion, _: u64, offset: u64, bit_width: u8) -> Result<u64, AmlError> {
        let port = Self::port(region, offset)?;
        let handler = interpreter.handler();
        Ok(match bit_width {
            8 => handler.read_io_u8(port) as u64,
            16 => handler.read_io_u16(port) as u64,
            32 => handler.read_io_u32(port) as u64,
            _ => return Err(AmlError::OperandValue),
        })
    }

    fn write(
        &self,
        interpreter: &Interpreter,
        region: &OpRegion,
        _: u64,
        offset: u64,
        bit_width: u8,
        value: u64,
    ) -> Result<(), AmlError> {
        let port = Self::port(region, offset)?;
        let handler = interpreter.handler();
        match bit_width {
            8 => handler.write_io_u8(port, value as u8),
            16 => handler.write_io_u16(port, value as u16),
            32 => handler.write_io_u32(port, value as u32),
            _ => return Err(AmlError::OperandValue),
        }
        Ok(())
    }
}

/// PCI configuration space. The region context packs the segment, bus, device and function of the region's
/// parent device, found by evaluating `_SEG`, `_BBN` and `_ADR`.
struct PciConfigHandler;

impl PciConfigHandler {
    fn address(context: u64) -> PciAddress {
        PciAddress::new(
            context.get_bits(32..48) as u16,
            context.get_bits(16..24) as u8,
            context.get_bits(8..16) as u8,
            context.get_bits(0..8) as u8,
        )
    }

    fn register(region: &OpRegion, offset: u64) -> Result<u16, AmlError> {
        region.base.checked_add(offset).and_then(|port| u16::try_from(port).ok()).ok_or(AmlError::RegionLimit)
    }

    /// Evaluate `name` on `device`, or on the nearest of its ancestors that has it.
    fn evaluate_upwards(interpreter: &Interpreter, device: &AmlName, name: &[u8; 4]) -> Result<Option<u64>, AmlError> {
        let mut scope = device.clone();
        loop {
            let path = AmlName::from_name_seg(NameSeg(*name)).resolve(&scope)?;
            if let Some(value) = interpreter.evaluate_if_present(path, vec![])? {
                return Ok(Some(value.lock().as_integer()?));
            }
            match scope.parent() {
                Ok(parent) => scope = parent,
                Err(_) => return Ok(None),
            }
        }
    }
}

impl RegionHandler for PciConfigHandler {
    fn setup(&self, interpreter: &Interpreter, region: &OpRegion, function: SetupFunction) -> Result<u64, AmlError> {
        if function == SetupFunction::Deactivate {
            return Ok(0);
        }

        let device = &region.parent_device_path;
        let adr_path = AmlName::from_name_seg(NameSeg(*b"_ADR")).resolve(device)?;
        let adr = match interpreter.evaluate_if_present(adr_path, vec![])? {
            Some(adr) => adr.lock().as_integer()?,
            None => 0,
        };
        let segment = Self::evaluate_upwards(interpreter, device, b"_SEG")?.unwrap_or(0);
        let bus = Self::evaluate_upwards(interpreter, device, b"_BBN")?.unwrap_or(0);

        let mut context = 0;
        context.set_bits(32..48, segment.get_bits(0..16));
        context.set_bits(16..24, bus.get_bits(0..8));
        context.set_bits(8..16, adr.get_bits(16..24));
        context.set_bits(0..8, adr.get_bits(0..8));
        Ok(context)
    }

    fn read(&self, interpreter: &Interpreter, region: &OpRegion, context: u64, offset: u64, bit_width: u8) -> Result<u64, AmlError> {
        let address = Self::address(context);
        let register = Self::register(region, offset)?;
        let handler = interpreter.handler();
        Ok(match bit_width {
            8 => handler.read_pci_u8(address, register) as u64,
            16 => handler.read_pci_u16(address, register) as u64,
            32 => handler.read_pci_u32(address, register) as u64,
            _ => return Err(AmlError::OperandValue),
        })
    }

    fn write(
        &self,
        interpreter: &Interpreter,
        region: &OpRegion,
        context: u64,
        offset: u64,
        bit_width: u8,
        value: u64,
    ) -> Result<(), AmlError> {
        let address = Self::address(context);
        let register = Self::register(region, offset)?;
        let handler = interpreter.handler();
        match bit_width {
            8 => handler.write_pci_u8(address, register, value as u8),
            16 => handler.write_pci_u16(address, register, value as u16),
            32 => handler.write_pci_u32(address, register, value as u32),
            _ => return Err(AmlError::OperandValue),
        }
        Ok(())
    }
}
