//! Byte-backed, permission-checked memory regions.
//!
//! Each [`MemoryRegion`] owns a fixed-size byte buffer mapped at a base
//! address and associated with a device instance. Typed reads/writes check
//! natural alignment, then permission, then range before touching the
//! backing buffer; buffer accesses skip the alignment check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;

use crate::device::DeviceHandle;
use crate::error::{PhyError, PhyResult};

bitflags! {
    /// Access permissions granted on a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// The kind of access being made to a region, reported to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Exec,
}

impl AccessKind {
    /// The wire encoding used by external action invocations: `0=READ,
    /// 1=WRITE, 2=EXEC`.
    pub fn as_code(self) -> u8 {
        match self {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
            AccessKind::Exec => 2,
        }
    }
}

/// Snapshot of a single memory access, handed to the monitor and to rule
/// conditions.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub region: RegionHandle,
    pub address: u64,
    pub size: u32,
    pub value: u64,
    pub kind: AccessKind,
}

/// A named, byte-backed memory region belonging to a device instance.
pub struct MemoryRegion {
    name: String,
    device: DeviceHandle,
    base_addr: u64,
    size: u64,
    permissions: Permissions,
    bytes: Mutex<Vec<u8>>,
}

impl PartialEq for MemoryRegion {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("base_addr", &self.base_addr)
            .field("size", &self.size)
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// Handle returned by [`RegionRegistry::create`].
pub type RegionHandle = Arc<MemoryRegion>;

impl MemoryRegion {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    fn end_addr(&self) -> u64 {
        self.base_addr + self.size
    }

    fn check_access(&self, addr: u64, size: u32, required: Permissions, natural_align: bool) -> PhyResult<usize> {
        if natural_align && addr % size as u64 != 0 {
            return Err(PhyError::MemoryAlignment);
        }
        let size = size as u64;
        if addr < self.base_addr || addr.checked_add(size).is_none() || addr + size > self.end_addr() {
            return Err(PhyError::MemoryOutOfRange);
        }
        if !self.permissions.contains(required) {
            return Err(PhyError::MemoryPermission);
        }
        Ok((addr - self.base_addr) as usize)
    }
}

macro_rules! typed_rw {
    ($read:ident, $write:ident, $ty:ty) => {
        impl RegionRegistry {
            pub fn $read(&self, region: &RegionHandle, addr: u64) -> PhyResult<$ty> {
                const WIDTH: u32 = std::mem::size_of::<$ty>() as u32;
                let offset = region.check_access(addr, WIDTH, Permissions::READ, true)?;
                let bytes = region.bytes.lock().unwrap();
                let slice = &bytes[offset..offset + WIDTH as usize];
                let value = <$ty>::from_le_bytes(slice.try_into().unwrap());
                drop(bytes);
                self.notify(region, addr, WIDTH, value as u64, AccessKind::Read);
                Ok(value)
            }

            pub fn $write(&self, region: &RegionHandle, addr: u64, value: $ty) -> PhyResult<()> {
                const WIDTH: u32 = std::mem::size_of::<$ty>() as u32;
                let offset = region.check_access(addr, WIDTH, Permissions::WRITE, true)?;
                {
                    let mut bytes = region.bytes.lock().unwrap();
                    bytes[offset..offset + WIDTH as usize].copy_from_slice(&value.to_le_bytes());
                }
                self.notify(region, addr, WIDTH, value as u64, AccessKind::Write);
                Ok(())
            }
        }
    };
}

typed_rw!(read_u8, write_u8, u8);
typed_rw!(read_u16, write_u16, u16);
typed_rw!(read_u32, write_u32, u32);
typed_rw!(read_u64, write_u64, u64);

#[derive(Default)]
struct RegionRegistryData {
    by_name: HashMap<(String, String), RegionHandle>,
}

/// Directory of memory regions plus the wiring that reports every access
/// to the monitor.
pub struct RegionRegistry {
    inner: ReentrantMutex<RefCell<RegionRegistryData>>,
    monitor: Arc<crate::monitor::Monitor>,
}

impl RegionRegistry {
    pub fn new(monitor: Arc<crate::monitor::Monitor>) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(RegionRegistryData::default())),
            monitor,
        }
    }

    pub fn create(
        &self,
        device: &DeviceHandle,
        name: &str,
        base_addr: u64,
        size: u64,
        permissions: Permissions,
    ) -> PhyResult<RegionHandle> {
        if name.is_empty() || size == 0 || base_addr.checked_add(size).is_none() {
            return Err(PhyError::InvalidParam);
        }
        let key = (device.name().to_string(), name.to_string());
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        if data.by_name.contains_key(&key) {
            return Err(PhyError::AlreadyExists);
        }
        let bytes = vec![0u8; size as usize];
        let region = Arc::new(MemoryRegion {
            name: name.to_string(),
            device: Arc::clone(device),
            base_addr,
            size,
            permissions,
            bytes: Mutex::new(bytes),
        });
        data.by_name.insert(key, Arc::clone(&region));
        log::debug!("created memory region '{name}' @ {base_addr:#x} size {size}");
        Ok(region)
    }

    pub fn destroy(&self, region: &RegionHandle) -> PhyResult<()> {
        let key = (region.device.name().to_string(), region.name.clone());
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        if data.by_name.remove(&key).is_none() {
            return Err(PhyError::MemoryRegionNotFound);
        }
        drop(data);
        drop(guard);
        self.monitor.cascade_destroy_for_region(region);
        log::debug!("destroyed memory region '{}'", region.name);
        Ok(())
    }

    pub fn find(&self, device: &DeviceHandle, name: &str) -> Option<RegionHandle> {
        let guard = self.inner.lock();
        let result = guard.borrow().by_name.get(&(device.name().to_string(), name.to_string())).cloned();
        result
    }

    pub fn read_buffer(&self, region: &RegionHandle, addr: u64, buffer: &mut [u8]) -> PhyResult<()> {
        let offset = region.check_access(addr, buffer.len() as u32, Permissions::READ, false)?;
        let bytes = region.bytes.lock().unwrap();
        buffer.copy_from_slice(&bytes[offset..offset + buffer.len()]);
        drop(bytes);
        self.notify(region, addr, buffer.len() as u32, 0, AccessKind::Read);
        Ok(())
    }

    pub fn write_buffer(&self, region: &RegionHandle, addr: u64, buffer: &[u8]) -> PhyResult<()> {
        let offset = region.check_access(addr, buffer.len() as u32, Permissions::WRITE, false)?;
        {
            let mut bytes = region.bytes.lock().unwrap();
            bytes[offset..offset + buffer.len()].copy_from_slice(buffer);
        }
        self.notify(region, addr, buffer.len() as u32, 0, AccessKind::Write);
        Ok(())
    }

    fn notify(&self, region: &RegionHandle, addr: u64, size: u32, value: u64, kind: AccessKind) {
        let ctx = AccessContext {
            region: Arc::clone(region),
            address: addr,
            size,
            value,
            kind,
        };
        if let Err(e) = self.monitor.notify(&ctx) {
            log::warn!("watchpoint dispatch reported an error after access to '{}': {e}", region.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, DeviceOps, DeviceRegistry};
    use crate::monitor::Monitor;

    struct NoopDevice;
    impl DeviceOps for NoopDevice {
        fn create(&self, _device: &DeviceHandle, _config: &DeviceConfig) -> PhyResult<()> {
            Ok(())
        }
    }

    fn setup() -> (DeviceHandle, RegionRegistry) {
        let devices = DeviceRegistry::new();
        devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();
        let device = devices.create_instance("tmp", "d0", &DeviceConfig::new()).unwrap();
        let actions = Arc::new(crate::action::ActionRegistry::new());
        let monitor = Arc::new(Monitor::new(actions));
        (device, RegionRegistry::new(monitor))
    }

    #[test]
    fn read_write_roundtrip() {
        let (device, regions) = setup();
        let region = regions.create(&device, "regs", 0x1000, 16, Permissions::READ | Permissions::WRITE).unwrap();
        regions.write_u32(&region, 0x1000, 0xdead_beef).unwrap();
        assert_eq!(regions.read_u32(&region, 0x1000).unwrap(), 0xdead_beef);
    }

    #[test]
    fn misaligned_access_rejected() {
        let (device, regions) = setup();
        let region = regions.create(&device, "regs", 0x1000, 16, Permissions::READ | Permissions::WRITE).unwrap();
        assert_eq!(regions.read_u32(&region, 0x1001), Err(PhyError::MemoryAlignment));
    }

    #[test]
    fn permission_enforced() {
        let (device, regions) = setup();
        let region = regions.create(&device, "ro", 0x2000, 8, Permissions::READ).unwrap();
        assert_eq!(regions.write_u8(&region, 0x2000, 1), Err(PhyError::MemoryPermission));
    }

    #[test]
    fn range_checked_before_permission() {
        let (device, regions) = setup();
        let region = regions.create(&device, "ro", 0x1000, 4, Permissions::READ).unwrap();
        // Out-of-range AND write-denied: range wins, matching the original's check order.
        assert_eq!(regions.write_u32(&region, 0x1004, 1), Err(PhyError::MemoryOutOfRange));
    }

    #[test]
    fn out_of_range_rejected() {
        let (device, regions) = setup();
        let region = regions.create(&device, "regs", 0x1000, 4, Permissions::READ | Permissions::WRITE).unwrap();
        assert_eq!(regions.read_u32(&region, 0x1004), Err(PhyError::MemoryOutOfRange));
    }

    #[test]
    fn buffer_access_ignores_alignment() {
        let (device, regions) = setup();
        let region = regions.create(&device, "regs", 0x1000, 16, Permissions::READ | Permissions::WRITE).unwrap();
        regions.write_buffer(&region, 0x1001, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        regions.read_buffer(&region, 0x1001, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn duplicate_region_name_per_device_rejected() {
        let (device, regions) = setup();
        regions.create(&device, "regs", 0x1000, 16, Permissions::READ).unwrap();
        assert_eq!(regions.create(&device, "regs", 0x2000, 16, Permissions::READ), Err(PhyError::AlreadyExists));
    }
}
