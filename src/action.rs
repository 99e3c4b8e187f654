//! Actions: callback, script, and subprocess-command reactions dispatched
//! by the monitor and the rule engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::ReentrantMutex;

use crate::device::UserData;
use crate::error::{PhyError, PhyResult};
use crate::region::AccessContext;

/// Identifier for a registered action. Never zero.
pub type ActionId = u32;

/// Signature for an in-process action callback. Receives the access
/// context that triggered it and its own user-data slot.
pub type ActionCallback = dyn Fn(&AccessContext, Option<&UserData>) -> PhyResult<()> + Send + Sync;

/// The kind of an action, reported by [`ActionRegistry::get_type`].
#[derive(Clone)]
pub enum ActionKind {
    Callback,
    Script(PathBuf),
    Command(String),
}

enum ActionPayload {
    Callback(Arc<ActionCallback>),
    Script(PathBuf),
    Command(String),
}

struct ActionEntry {
    payload: ActionPayload,
    user_data: Mutex<Option<UserData>>,
}

#[derive(Default)]
struct ActionRegistryData {
    actions: HashMap<ActionId, ActionEntry>,
}

/// Directory of actions, keyed by monotonic id.
pub struct ActionRegistry {
    inner: ReentrantMutex<RefCell<ActionRegistryData>>,
    next_id: AtomicU32,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(ActionRegistryData::default())),
            next_id: AtomicU32::new(1),
        }
    }

    fn insert(&self, payload: ActionPayload, user_data: Option<UserData>) -> ActionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = self.inner.lock();
        guard.borrow_mut().actions.insert(
            id,
            ActionEntry {
                payload,
                user_data: Mutex::new(user_data),
            },
        );
        id
    }

    pub fn create_callback(&self, callback: Arc<ActionCallback>, user_data: Option<UserData>) -> ActionId {
        self.insert(ActionPayload::Callback(callback), user_data)
    }

    pub fn create_script(&self, script_path: impl Into<PathBuf>) -> PhyResult<ActionId> {
        let path = script_path.into();
        if path.as_os_str().is_empty() {
            return Err(PhyError::InvalidParam);
        }
        Ok(self.insert(ActionPayload::Script(path), None))
    }

    pub fn create_command(&self, command: impl Into<String>) -> PhyResult<ActionId> {
        let command = command.into();
        if command.is_empty() {
            return Err(PhyError::InvalidParam);
        }
        Ok(self.insert(ActionPayload::Command(command), None))
    }

    pub fn destroy(&self, id: ActionId) -> PhyResult<()> {
        let guard = self.inner.lock();
        let result = guard.borrow_mut().actions.remove(&id).map(|_| ()).ok_or(PhyError::ActionNotFound);
        result
    }

    pub fn get_type(&self, id: ActionId) -> PhyResult<ActionKind> {
        let guard = self.inner.lock();
        let data = guard.borrow();
        let entry = data.actions.get(&id).ok_or(PhyError::ActionNotFound)?;
        Ok(match &entry.payload {
            ActionPayload::Callback(_) => ActionKind::Callback,
            ActionPayload::Script(p) => ActionKind::Script(p.clone()),
            ActionPayload::Command(c) => ActionKind::Command(c.clone()),
        })
    }

    pub fn set_user_data(&self, id: ActionId, data: Option<UserData>) -> PhyResult<()> {
        let guard = self.inner.lock();
        let reg = guard.borrow();
        let entry = reg.actions.get(&id).ok_or(PhyError::ActionNotFound)?;
        *entry.user_data.lock().unwrap() = data;
        Ok(())
    }

    pub fn get_user_data(&self, id: ActionId) -> PhyResult<Option<UserData>> {
        let guard = self.inner.lock();
        let reg = guard.borrow();
        let entry = reg.actions.get(&id).ok_or(PhyError::ActionNotFound)?;
        let result = Ok(entry.user_data.lock().unwrap().clone());
        result
    }

    /// Executes the action identified by `id` against `ctx`. Returns
    /// [`PhyError::ActionNotFound`] if the id is unbound — dispatch call
    /// sites in the monitor and rule engine treat that variant specially
    /// (silent skip) rather than as a real failure.
    pub fn execute(&self, id: ActionId, ctx: &AccessContext) -> PhyResult<()> {
        let (payload_kind, user_data) = {
            let guard = self.inner.lock();
            let data = guard.borrow();
            let entry = data.actions.get(&id).ok_or(PhyError::ActionNotFound)?;
            let user_data = entry.user_data.lock().unwrap().clone();
            let kind = match &entry.payload {
                ActionPayload::Callback(cb) => ExecKind::Callback(Arc::clone(cb)),
                ActionPayload::Script(p) => ExecKind::Script(p.clone()),
                ActionPayload::Command(c) => ExecKind::Command(c.clone()),
            };
            (kind, user_data)
        };

        match payload_kind {
            ExecKind::Callback(cb) => cb(ctx, user_data.as_ref()),
            ExecKind::Script(path) => {
                // argv: [script_path, address, size, value, access_kind_as_int].
                let mut cmd = Command::new(&path);
                push_positional_args(&mut cmd, ctx);
                run_subprocess(cmd)
            }
            ExecKind::Command(command) => {
                // `sh -c command $0 $1 $2 $3 $4`: the literal command string
                // sees the access as positional parameters $1..$4.
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(&command).arg("sh");
                push_positional_args(&mut cmd, ctx);
                run_subprocess(cmd)
            }
        }
    }
}

enum ExecKind {
    Callback(Arc<ActionCallback>),
    Script(PathBuf),
    Command(String),
}

fn push_positional_args(cmd: &mut Command, ctx: &AccessContext) {
    cmd.arg(ctx.address.to_string())
        .arg(ctx.size.to_string())
        .arg(ctx.value.to_string())
        .arg(ctx.kind.as_code().to_string());
}

fn run_subprocess(mut cmd: Command) -> PhyResult<()> {
    let status = cmd.status().map_err(|e| {
        log::warn!("failed to spawn action subprocess: {e}");
        PhyError::ActionExecuteFailed
    })?;
    if status.success() {
        Ok(())
    } else {
        Err(PhyError::ActionExecuteFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, DeviceHandle, DeviceOps, DeviceRegistry};
    use crate::region::{AccessKind, Permissions, RegionRegistry};
    use std::sync::atomic::AtomicBool;

    struct NoopDevice;
    impl DeviceOps for NoopDevice {
        fn create(&self, _device: &DeviceHandle, _config: &DeviceConfig) -> PhyResult<()> {
            Ok(())
        }
    }

    fn ctx() -> AccessContext {
        let devices = DeviceRegistry::new();
        devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();
        let device = devices.create_instance("tmp", "d0", &DeviceConfig::new()).unwrap();
        let actions = Arc::new(ActionRegistry::new());
        let monitor = Arc::new(crate::monitor::Monitor::new(actions));
        let regions = RegionRegistry::new(monitor);
        let region = regions.create(&device, "regs", 0, 4, Permissions::READ | Permissions::WRITE).unwrap();
        AccessContext {
            region,
            address: 0,
            size: 4,
            value: 9,
            kind: AccessKind::Write,
        }
    }

    #[test]
    fn callback_action_runs_and_sees_user_data() {
        let registry = ActionRegistry::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let id = registry.create_callback(
            Arc::new(move |access, data| {
                fired2.store(true, Ordering::SeqCst);
                assert_eq!(access.value, 9);
                assert!(data.is_some());
                Ok(())
            }),
            Some(Arc::new(42u32)),
        );
        registry.execute(id, &ctx()).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn execute_missing_action_reports_not_found() {
        let registry = ActionRegistry::new();
        assert_eq!(registry.execute(999, &ctx()), Err(PhyError::ActionNotFound));
    }

    #[test]
    fn destroy_then_execute_fails() {
        let registry = ActionRegistry::new();
        let id = registry.create_callback(Arc::new(|_, _| Ok(())), None);
        registry.destroy(id).unwrap();
        assert_eq!(registry.execute(id, &ctx()), Err(PhyError::ActionNotFound));
    }

    #[test]
    fn command_action_runs_real_subprocess() {
        let registry = ActionRegistry::new();
        let id = registry.create_command("true").unwrap();
        registry.execute(id, &ctx()).unwrap();

        let failing = registry.create_command("false").unwrap();
        assert_eq!(registry.execute(failing, &ctx()), Err(PhyError::ActionExecuteFailed));
    }

    #[test]
    fn empty_script_path_rejected() {
        let registry = ActionRegistry::new();
        assert_eq!(registry.create_script(""), Err(PhyError::InvalidParam));
    }

    #[test]
    fn command_action_receives_access_as_positional_args() {
        let registry = ActionRegistry::new();
        // ctx() is address=0, size=4, value=9, kind=Write (code 1).
        let id = registry.create_command("[ \"$1 $2 $3 $4\" = \"0 4 9 1\" ]").unwrap();
        registry.execute(id, &ctx()).unwrap();
    }
}
