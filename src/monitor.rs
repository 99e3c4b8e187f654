//! Watchpoints over memory regions, and the dispatch of matching actions.
//!
//! [`Monitor::notify`] is called on every memory access; it snapshots the
//! set of enabled watchpoints that match the access (region, address range,
//! kind, and value for [`WatchpointKind::ValueWrite`]) while holding the
//! registry lock, releases the lock, then invokes each watchpoint's bound
//! actions. This keeps user-supplied action callbacks from ever running
//! with the monitor lock held, so a callback that itself touches a
//! watched region cannot deadlock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::action::ActionRegistry;
use crate::error::{PhyError, PhyResult};
use crate::region::{AccessContext, AccessKind, RegionHandle};

/// Identifier for a registered watchpoint. Never zero.
pub type WatchpointId = u32;

/// The condition under which a watchpoint fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointKind {
    Read,
    Write,
    Access,
    ValueWrite(u64),
}

impl WatchpointKind {
    fn matches(&self, kind: AccessKind, value: u64) -> bool {
        match (self, kind) {
            (WatchpointKind::Read, AccessKind::Read) => true,
            (WatchpointKind::Write, AccessKind::Write) => true,
            (WatchpointKind::Access, AccessKind::Read | AccessKind::Write) => true,
            (WatchpointKind::ValueWrite(expected), AccessKind::Write) => *expected == value,
            _ => false,
        }
    }
}

/// Public snapshot of a watchpoint's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchpointInfo {
    pub region: RegionHandle,
    pub addr: u64,
    pub size: u32,
    pub kind: WatchpointKind,
    pub enabled: bool,
}

struct Watchpoint {
    region: RegionHandle,
    addr: u64,
    size: u32,
    kind: WatchpointKind,
    enabled: bool,
    actions: Vec<u32>,
}

impl Watchpoint {
    fn overlaps(&self, addr: u64, size: u32) -> bool {
        let (start, end) = (addr, addr + size as u64);
        let (wp_start, wp_end) = (self.addr, self.addr + self.size as u64);
        !(end <= wp_start || start >= wp_end)
    }
}

#[derive(Default)]
struct MonitorData {
    watchpoints: HashMap<WatchpointId, Watchpoint>,
    by_region: HashMap<(String, String), Vec<WatchpointId>>,
}

/// Watchpoint registry and memory-access dispatcher.
pub struct Monitor {
    inner: ReentrantMutex<RefCell<MonitorData>>,
    next_id: AtomicU32,
    actions: Arc<ActionRegistry>,
}

impl Monitor {
    pub fn new(actions: Arc<ActionRegistry>) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(MonitorData::default())),
            next_id: AtomicU32::new(1),
            actions,
        }
    }

    fn region_key(region: &RegionHandle) -> (String, String) {
        (region.device().name().to_string(), region.name().to_string())
    }

    pub fn add_watchpoint(&self, region: &RegionHandle, addr: u64, size: u32, kind: WatchpointKind) -> PhyResult<WatchpointId> {
        if size == 0 || size > 8 {
            return Err(PhyError::InvalidParam);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        data.watchpoints.insert(
            id,
            Watchpoint {
                region: Arc::clone(region),
                addr,
                size,
                kind,
                enabled: true,
                actions: Vec::new(),
            },
        );
        data.by_region.entry(Self::region_key(region)).or_default().push(id);
        log::debug!("added watchpoint {id} on '{}' @ {addr:#x}", region.name());
        Ok(id)
    }

    pub fn remove_watchpoint(&self, id: WatchpointId) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let wp = data.watchpoints.remove(&id).ok_or(PhyError::WatchpointNotFound)?;
        let key = Self::region_key(&wp.region);
        if let Some(ids) = data.by_region.get_mut(&key) {
            ids.retain(|&x| x != id);
        }
        Ok(())
    }

    pub fn enable_watchpoint(&self, id: WatchpointId) -> PhyResult<()> {
        self.set_enabled(id, true)
    }

    pub fn disable_watchpoint(&self, id: WatchpointId) -> PhyResult<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: WatchpointId, enabled: bool) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let wp = data.watchpoints.get_mut(&id).ok_or(PhyError::WatchpointNotFound)?;
        wp.enabled = enabled;
        Ok(())
    }

    pub fn bind_action(&self, id: WatchpointId, action_id: u32) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let wp = data.watchpoints.get_mut(&id).ok_or(PhyError::WatchpointNotFound)?;
        if !wp.actions.contains(&action_id) {
            wp.actions.push(action_id);
        }
        Ok(())
    }

    pub fn unbind_action(&self, id: WatchpointId, action_id: u32) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let wp = data.watchpoints.get_mut(&id).ok_or(PhyError::WatchpointNotFound)?;
        let before = wp.actions.len();
        wp.actions.retain(|&a| a != action_id);
        if wp.actions.len() == before {
            return Err(PhyError::NotFound);
        }
        Ok(())
    }

    pub fn get_info(&self, id: WatchpointId) -> PhyResult<WatchpointInfo> {
        let guard = self.inner.lock();
        let data = guard.borrow();
        let wp = data.watchpoints.get(&id).ok_or(PhyError::WatchpointNotFound)?;
        Ok(WatchpointInfo {
            region: Arc::clone(&wp.region),
            addr: wp.addr,
            size: wp.size,
            kind: wp.kind,
            enabled: wp.enabled,
        })
    }

    /// Snapshots matching, enabled watchpoints under the lock, then invokes
    /// their bound actions with no lock held. A missing action id is
    /// skipped silently; any other execution error is collected and the
    /// first one is returned after all matching watchpoints have run.
    pub fn notify(&self, ctx: &AccessContext) -> PhyResult<()> {
        let matches: Vec<(WatchpointId, Vec<u32>)> = {
            let guard = self.inner.lock();
            let data = guard.borrow();
            let key = Self::region_key(&ctx.region);
            data.by_region
                .get(&key)
                .into_iter()
                .flatten()
                .filter_map(|id| data.watchpoints.get(id).map(|wp| (*id, wp)))
                .filter(|(_, wp)| wp.enabled && wp.overlaps(ctx.address, ctx.size) && wp.kind.matches(ctx.kind, ctx.value))
                .map(|(id, wp)| (id, wp.actions.clone()))
                .collect()
        };

        let mut first_err = None;
        for (wp_id, action_ids) in matches {
            for action_id in action_ids {
                match self.actions.execute(action_id, ctx) {
                    Ok(()) => {}
                    Err(PhyError::ActionNotFound) => {
                        log::trace!("watchpoint {wp_id} bound to unknown action {action_id}, skipping");
                    }
                    Err(e) => {
                        log::warn!("action {action_id} bound to watchpoint {wp_id} failed: {e}");
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Force-detaches and removes every watchpoint on `region`, called when
    /// the region is destroyed so no watchpoint can outlive its region.
    pub fn cascade_destroy_for_region(&self, region: &RegionHandle) {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        if let Some(ids) = data.by_region.remove(&Self::region_key(region)) {
            for id in ids {
                data.watchpoints.remove(&id);
            }
        }
    }
}
