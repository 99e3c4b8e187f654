//! Device-class registry and device-instance lifecycle.
//!
//! A [`DeviceClass`] is registered once under a unique name and supplies
//! lifecycle hooks (`create`/`destroy`/`reset`/`save_state`/`load_state`/
//! `ioctl`) through the [`DeviceOps`] trait. [`DeviceRegistry::create_instance`]
//! allocates a [`DeviceInstance`], invokes the class's `create` hook with the
//! registry lock released, and only makes the instance visible to
//! [`DeviceRegistry::find_by_name`] after `create` succeeds — matching the
//! original design's "insert after successful create, remove before destroy"
//! ordering.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::ReentrantMutex;

use crate::error::{PhyError, PhyResult};

/// Opaque, downcastable user data shared across an API boundary, the Rust
/// stand-in for the C original's `void *user_data`.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Outcome of a `save_state` call.
///
/// Distinguishes "state was written" from "the supplied buffer was absent
/// or too small, here is the required size" with a dedicated variant
/// instead of overloading an error code for the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStateOutcome {
    /// State was written; the payload is the number of bytes written.
    Written(usize),
    /// The caller must retry with a buffer at least this many bytes.
    SizeRequired(usize),
}

/// Lifecycle hooks for a device class.
///
/// Every hook but `create` has a default implementation, so a class can
/// implement only the slots it needs: `reset`'s default succeeds as a
/// no-op, the rest default to [`PhyError::NotSupported`].
pub trait DeviceOps: Send + Sync {
    /// Initializes a freshly allocated instance. Called with no registry
    /// lock held; may freely call back into any registry.
    fn create(&self, device: &DeviceHandle, config: &DeviceConfig) -> PhyResult<()>;

    /// Tears down an instance already removed from the directory.
    fn destroy(&self, _device: &DeviceHandle) {}

    fn reset(&self, _device: &DeviceHandle) -> PhyResult<()> {
        Ok(())
    }

    fn save_state(&self, _device: &DeviceHandle, _buffer: Option<&mut [u8]>) -> PhyResult<SaveStateOutcome> {
        Err(PhyError::NotSupported)
    }

    fn load_state(&self, _device: &DeviceHandle, _buffer: &[u8]) -> PhyResult<()> {
        Err(PhyError::NotSupported)
    }

    fn ioctl(&self, _device: &DeviceHandle, _cmd: i32, _arg: &mut dyn Any) -> PhyResult<()> {
        Err(PhyError::NotSupported)
    }
}

/// Per-instance creation parameters, carrying an opaque config payload.
#[derive(Default)]
pub struct DeviceConfig {
    data: Option<UserData>,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self { data: None }
    }

    pub fn with_data(data: UserData) -> Self {
        Self { data: Some(data) }
    }

    pub fn data(&self) -> Option<&UserData> {
        self.data.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum InstanceState {
    Creating = 0,
    Live = 1,
    Destroying = 2,
    Gone = 3,
}

struct DeviceClassEntry {
    name: String,
    ops: Arc<dyn DeviceOps>,
    user_data: Mutex<Option<UserData>>,
    instance_count: AtomicUsize,
}

/// A live, named device instance. Cheaply cloneable; all clones refer to
/// the same underlying object.
pub struct DeviceInstance {
    name: String,
    class_name: String,
    ops: Arc<dyn DeviceOps>,
    state: AtomicU8,
    user_data: Mutex<Option<UserData>>,
}

impl PartialEq for DeviceInstance {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl std::fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("name", &self.name)
            .field("class_name", &self.class_name)
            .finish()
    }
}

/// Handle returned by [`DeviceRegistry::create_instance`].
pub type DeviceHandle = Arc<DeviceInstance>;

impl DeviceInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().unwrap().clone()
    }

    pub fn set_user_data(&self, data: Option<UserData>) {
        *self.user_data.lock().unwrap() = data;
    }

    fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == InstanceState::Live as u8
    }
}

#[derive(Default)]
struct DeviceRegistryData {
    classes: HashMap<String, Arc<DeviceClassEntry>>,
    instances: HashMap<String, DeviceHandle>,
}

/// Directory of device classes and live device instances.
pub struct DeviceRegistry {
    inner: ReentrantMutex<RefCell<DeviceRegistryData>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(DeviceRegistryData::default())),
        }
    }

    pub fn register_class(&self, name: &str, ops: Arc<dyn DeviceOps>, user_data: Option<UserData>) -> PhyResult<()> {
        if name.is_empty() {
            return Err(PhyError::InvalidParam);
        }
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        if data.classes.contains_key(name) {
            return Err(PhyError::AlreadyExists);
        }
        data.classes.insert(
            name.to_string(),
            Arc::new(DeviceClassEntry {
                name: name.to_string(),
                ops,
                user_data: Mutex::new(user_data),
                instance_count: AtomicUsize::new(0),
            }),
        );
        log::debug!("registered device class '{name}'");
        Ok(())
    }

    pub fn unregister_class(&self, name: &str) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let class = data.classes.get(name).ok_or(PhyError::DeviceTypeNotFound)?;
        if class.instance_count.load(Ordering::Acquire) > 0 {
            return Err(PhyError::Busy);
        }
        data.classes.remove(name);
        log::debug!("unregistered device class '{name}'");
        Ok(())
    }

    pub fn create_instance(&self, class_name: &str, instance_name: &str, config: &DeviceConfig) -> PhyResult<DeviceHandle> {
        if instance_name.is_empty() {
            return Err(PhyError::InvalidParam);
        }

        let class = {
            let guard = self.inner.lock();
            let data = guard.borrow();
            if data.instances.contains_key(instance_name) {
                return Err(PhyError::AlreadyExists);
            }
            data.classes.get(class_name).cloned().ok_or(PhyError::DeviceTypeNotFound)?
        };

        let instance: DeviceHandle = Arc::new(DeviceInstance {
            name: instance_name.to_string(),
            class_name: class_name.to_string(),
            ops: Arc::clone(&class.ops),
            state: AtomicU8::new(InstanceState::Creating as u8),
            user_data: Mutex::new(None),
        });

        // Registry lock is not held across the callback: `create` may call
        // back into this or any other registry on the same thread.
        if let Err(e) = class.ops.create(&instance, config) {
            log::warn!("device class '{class_name}' refused to create '{instance_name}': {e}");
            return Err(PhyError::DeviceCreateFailed);
        }

        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        if data.instances.contains_key(instance_name) {
            // Lost a race with a concurrent create_instance of the same name.
            drop(data);
            drop(guard);
            class.ops.destroy(&instance);
            return Err(PhyError::AlreadyExists);
        }
        instance.state.store(InstanceState::Live as u8, Ordering::Release);
        data.instances.insert(instance_name.to_string(), Arc::clone(&instance));
        class.instance_count.fetch_add(1, Ordering::AcqRel);
        log::debug!("created device instance '{instance_name}' (class '{class_name}')");
        Ok(instance)
    }

    pub fn destroy_instance(&self, device: &DeviceHandle) -> PhyResult<()> {
        let class;
        {
            let guard = self.inner.lock();
            let mut data = guard.borrow_mut();
            match data.instances.get(device.name()) {
                Some(existing) if Arc::ptr_eq(existing, device) => {}
                _ => return Err(PhyError::DeviceNotFound),
            }
            if device
                .state
                .compare_exchange(
                    InstanceState::Live as u8,
                    InstanceState::Destroying as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return Err(PhyError::Busy);
            }
            data.instances.remove(device.name());
            class = data.classes.get(device.class_name()).cloned();
        }

        device.ops.destroy(device);
        device.state.store(InstanceState::Gone as u8, Ordering::Release);
        if let Some(class) = class {
            class.instance_count.fetch_sub(1, Ordering::AcqRel);
        }
        log::debug!("destroyed device instance '{}'", device.name());
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<DeviceHandle> {
        let guard = self.inner.lock();
        let result = guard.borrow().instances.get(name).cloned();
        result
    }

    fn ensure_live(&self, device: &DeviceHandle) -> PhyResult<()> {
        if device.is_live() {
            Ok(())
        } else {
            Err(PhyError::DeviceNotFound)
        }
    }

    pub fn reset(&self, device: &DeviceHandle) -> PhyResult<()> {
        self.ensure_live(device)?;
        device.ops.reset(device)
    }

    pub fn save_state(&self, device: &DeviceHandle, buffer: Option<&mut [u8]>) -> PhyResult<SaveStateOutcome> {
        self.ensure_live(device)?;
        device.ops.save_state(device, buffer)
    }

    pub fn load_state(&self, device: &DeviceHandle, buffer: &[u8]) -> PhyResult<()> {
        self.ensure_live(device)?;
        device.ops.load_state(device, buffer)
    }

    pub fn ioctl(&self, device: &DeviceHandle, cmd: i32, arg: &mut dyn Any) -> PhyResult<()> {
        self.ensure_live(device)?;
        device.ops.ioctl(device, cmd, arg)
    }
}
