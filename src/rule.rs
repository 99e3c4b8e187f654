//! Conditional rules: a named, independently enabled condition over an
//! access context plus a list of actions to run when it holds.
//!
//! [`RuleEngine::evaluate`] follows the same snapshot-then-invoke
//! discipline as [`crate::monitor::Monitor::notify`]: the condition is
//! evaluated and the action list is cloned under the registry lock, then
//! the lock is released before any action runs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::ReentrantMutex;

use crate::action::ActionRegistry;
use crate::device::UserData;
use crate::error::{PhyError, PhyResult};
use crate::region::AccessContext;

/// Identifier for a registered rule. Never zero.
pub type RuleId = u32;

/// Signature for a rule's condition predicate.
pub type RuleCondition = dyn Fn(&AccessContext, Option<&UserData>) -> bool + Send + Sync;

struct Rule {
    name: String,
    condition: Option<Arc<RuleCondition>>,
    condition_data: Option<UserData>,
    actions: Vec<u32>,
    enabled: bool,
    user_data: Mutex<Option<UserData>>,
}

#[derive(Default)]
struct RuleEngineData {
    rules: HashMap<RuleId, Rule>,
    by_name: HashMap<String, RuleId>,
}

/// Directory of rules bound to a shared [`ActionRegistry`].
pub struct RuleEngine {
    inner: ReentrantMutex<RefCell<RuleEngineData>>,
    next_id: AtomicU32,
    actions: Arc<ActionRegistry>,
}

impl RuleEngine {
    pub fn new(actions: Arc<ActionRegistry>) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(RuleEngineData::default())),
            next_id: AtomicU32::new(1),
            actions,
        }
    }

    pub fn create(&self, name: &str) -> PhyResult<RuleId> {
        if name.is_empty() {
            return Err(PhyError::InvalidParam);
        }
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        if data.by_name.contains_key(name) {
            return Err(PhyError::AlreadyExists);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        data.rules.insert(
            id,
            Rule {
                name: name.to_string(),
                condition: None,
                condition_data: None,
                actions: Vec::new(),
                // Matches the original demonstration's explicit enable-after-create.
                enabled: false,
                user_data: Mutex::new(None),
            },
        );
        data.by_name.insert(name.to_string(), id);
        log::debug!("created rule '{name}'");
        Ok(id)
    }

    pub fn destroy(&self, id: RuleId) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let rule = data.rules.remove(&id).ok_or(PhyError::RuleNotFound)?;
        data.by_name.remove(&rule.name);
        Ok(())
    }

    pub fn set_condition(&self, id: RuleId, condition: Arc<RuleCondition>, user_data: Option<UserData>) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let rule = data.rules.get_mut(&id).ok_or(PhyError::RuleNotFound)?;
        rule.condition = Some(condition);
        rule.condition_data = user_data;
        Ok(())
    }

    pub fn add_action(&self, id: RuleId, action_id: u32) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let rule = data.rules.get_mut(&id).ok_or(PhyError::RuleNotFound)?;
        if !rule.actions.contains(&action_id) {
            rule.actions.push(action_id);
        }
        Ok(())
    }

    pub fn remove_action(&self, id: RuleId, action_id: u32) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let rule = data.rules.get_mut(&id).ok_or(PhyError::RuleNotFound)?;
        rule.actions.retain(|&a| a != action_id);
        Ok(())
    }

    pub fn enable(&self, id: RuleId) -> PhyResult<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: RuleId) -> PhyResult<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: RuleId, enabled: bool) -> PhyResult<()> {
        let guard = self.inner.lock();
        let mut data = guard.borrow_mut();
        let rule = data.rules.get_mut(&id).ok_or(PhyError::RuleNotFound)?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<RuleId> {
        let guard = self.inner.lock();
        let result = guard.borrow().by_name.get(name).copied();
        result
    }

    pub fn name(&self, id: RuleId) -> PhyResult<String> {
        let guard = self.inner.lock();
        let data = guard.borrow();
        Ok(data.rules.get(&id).ok_or(PhyError::RuleNotFound)?.name.clone())
    }

    pub fn set_user_data(&self, id: RuleId, data: Option<UserData>) -> PhyResult<()> {
        let guard = self.inner.lock();
        let reg = guard.borrow();
        let rule = reg.rules.get(&id).ok_or(PhyError::RuleNotFound)?;
        *rule.user_data.lock().unwrap() = data;
        Ok(())
    }

    pub fn get_user_data(&self, id: RuleId) -> PhyResult<Option<UserData>> {
        let guard = self.inner.lock();
        let reg = guard.borrow();
        let rule = reg.rules.get(&id).ok_or(PhyError::RuleNotFound)?;
        let result = Ok(rule.user_data.lock().unwrap().clone());
        result
    }

    /// Evaluates a single rule's condition against `ctx`; if it holds
    /// (and the rule is enabled), runs its actions in order. An unbound
    /// action id is skipped; any other action failure is remembered and
    /// returned after the remaining actions have run.
    pub fn evaluate(&self, id: RuleId, ctx: &AccessContext) -> PhyResult<()> {
        let (enabled, condition, condition_data, action_ids) = {
            let guard = self.inner.lock();
            let data = guard.borrow();
            let rule = data.rules.get(&id).ok_or(PhyError::RuleNotFound)?;
            (rule.enabled, rule.condition.clone(), rule.condition_data.clone(), rule.actions.clone())
        };

        if !enabled {
            return Ok(());
        }
        let Some(condition) = condition else {
            return Ok(());
        };
        if !condition(ctx, condition_data.as_ref()) {
            return Ok(());
        }

        let mut first_err = None;
        for action_id in action_ids {
            match self.actions.execute(action_id, ctx) {
                Ok(()) => {}
                Err(PhyError::ActionNotFound) => {
                    log::trace!("rule {id} bound to unknown action {action_id}, skipping");
                }
                Err(e) => {
                    log::warn!("rule {id} action {action_id} failed: {e}");
                    first_err.get_or_insert(PhyError::RuleActionFailed);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
