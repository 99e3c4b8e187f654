//! Physical-device simulation toolkit.
//!
//! Models peripheral devices as address-mapped memory regions, observes
//! accesses through typed watchpoints, and reacts through a two-level
//! engine: watchpoint-bound actions fire directly on a matching access,
//! and independently enabled rules evaluate an arbitrary condition over
//! the same access and fire their own action lists.
//!
//! [`PhySim`] owns one instance of each of the five cooperating
//! components (error taxonomy is ambient, not owned) in dependency order
//! and is the crate's typical entry point:
//!
//! ```
//! use physim::PhySim;
//!
//! let sim = PhySim::init();
//! sim.process_events().unwrap();
//! ```

pub mod action;
pub mod device;
pub mod error;
pub mod monitor;
pub mod region;
pub mod rule;

pub use action::{ActionCallback, ActionId, ActionKind, ActionRegistry};
pub use device::{DeviceConfig, DeviceHandle, DeviceOps, DeviceRegistry, SaveStateOutcome, UserData};
pub use error::{PhyError, PhyResult};
pub use monitor::{Monitor, WatchpointId, WatchpointInfo, WatchpointKind};
pub use region::{AccessContext, AccessKind, MemoryRegion, Permissions, RegionHandle, RegionRegistry};
pub use rule::{RuleCondition, RuleEngine, RuleId};

use std::sync::Arc;

/// Owns one instance of each registry and sequences their lifetimes.
///
/// Construction order matters: actions have no dependencies, the monitor
/// and rule engine both dispatch through the shared action registry, and
/// the region registry reports every access to the monitor. Devices are
/// independent of the other four and are created first only by
/// convention.
pub struct PhySim {
    pub devices: DeviceRegistry,
    pub regions: RegionRegistry,
    pub monitor: Arc<Monitor>,
    pub actions: Arc<ActionRegistry>,
    pub rules: RuleEngine,
}

impl Default for PhySim {
    fn default() -> Self {
        Self::init()
    }
}

impl PhySim {
    /// Builds all five registries. Infallible: registry construction
    /// never allocates resources that can fail at this stage.
    pub fn init() -> Self {
        log::info!("initializing simulation engine");
        let devices = DeviceRegistry::new();
        let actions = Arc::new(ActionRegistry::new());
        let monitor = Arc::new(Monitor::new(Arc::clone(&actions)));
        let regions = RegionRegistry::new(Arc::clone(&monitor));
        let rules = RuleEngine::new(Arc::clone(&actions));
        Self {
            devices,
            regions,
            monitor,
            actions,
            rules,
        }
    }

    /// Reserved for future per-tick dispatch of time-driven rules; today
    /// a genuine no-op, since watchpoint and rule dispatch both happen
    /// synchronously inside the memory-access call that triggers them.
    pub fn process_events(&self) -> PhyResult<()> {
        Ok(())
    }

    /// Tears the engine down. Registries drop in reverse of [`Self::init`]
    /// order via normal field-drop semantics; this method exists as the
    /// documented counterpart to `init` and for callers that want an
    /// explicit teardown point rather than relying on scope exit.
    pub fn cleanup(self) {
        log::info!("shutting down simulation engine");
    }
}
