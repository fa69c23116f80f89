//! In-memory bug tracker for tests and local simulation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Bug, BugId, BugStatus, BugTracker, BugUpdate, CreateRequest};
use crate::error::{Error, Result};

/// Number given to the first bug filed in each project.
pub const FIRST_BUG_NUMBER: u64 = 100;

#[derive(Default)]
struct State {
    bugs: BTreeMap<BugId, Bug>,
    by_key: HashMap<String, BugId>,
    /// Priority each bug was last given through this API.
    automatic_priority: HashMap<BugId, String>,
    next_number: HashMap<String, u64>,
    updates: Vec<BugUpdate>,
}

impl State {
    fn view(&self, bug: &Bug) -> Bug {
        let mut bug = bug.clone();
        bug.priority_changed_manually = self
            .automatic_priority
            .get(&bug.id)
            .is_some_and(|p| *p != bug.priority);
        bug
    }
}

/// A [`BugTracker`] keeping bugs in memory. Bug numbers are allocated per
/// project starting at [`FIRST_BUG_NUMBER`].
#[derive(Default)]
pub struct FakeBugTracker {
    state: Mutex<State>,
}

impl FakeBugTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::bug_tracker("bug tracker state poisoned"))
    }

    /// Every bug, ordered by ID.
    #[must_use]
    pub fn bugs(&self) -> Vec<Bug> {
        self.lock()
            .map(|s| s.bugs.values().map(|b| s.view(b)).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn bug(&self, id: &BugId) -> Option<Bug> {
        self.lock().ok().and_then(|s| s.bugs.get(id).map(|b| s.view(b)))
    }

    /// Updates applied so far, in order.
    #[must_use]
    pub fn updates(&self) -> Vec<BugUpdate> {
        self.lock().map(|s| s.updates.clone()).unwrap_or_default()
    }

    /// Edits a bug as a person using the tracker would. Clearing the manual
    /// priority flag returns the current priority to automatic control.
    pub fn edit(&self, id: &BugId, f: impl FnOnce(&mut Bug)) -> Result<()> {
        let mut state = self.lock()?;
        let bug = state
            .bugs
            .get_mut(id)
            .ok_or_else(|| Error::bug_tracker(format!("bug {id} not found")))?;
        let was_manual = bug.manual_priority;
        f(bug);
        if was_manual && !bug.manual_priority {
            let priority = bug.priority.clone();
            state.automatic_priority.insert(id.clone(), priority);
        }
        Ok(())
    }
}

#[async_trait]
impl BugTracker for FakeBugTracker {
    async fn create(&self, request: &CreateRequest) -> Result<BugId> {
        let mut state = self.lock()?;
        if let Some(existing) = state.by_key.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        let number = state
            .next_number
            .entry(request.project.clone())
            .or_insert(FIRST_BUG_NUMBER);
        let id = BugId::monorail(&request.project, *number);
        *number += 1;
        state.bugs.insert(
            id.clone(),
            Bug {
                id: id.clone(),
                title: request.title.clone(),
                description: request.description.clone(),
                priority: request.priority.clone(),
                status: BugStatus::Untriaged,
                owner: None,
                manual_priority: false,
                priority_changed_manually: false,
            },
        );
        state
            .automatic_priority
            .insert(id.clone(), request.priority.clone());
        state
            .by_key
            .insert(request.idempotency_key.clone(), id.clone());
        Ok(id)
    }

    async fn read(&self, ids: &[BugId]) -> Result<Vec<Bug>> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.bugs.get(id).map(|b| state.view(b)))
            .collect())
    }

    async fn update(&self, update: &BugUpdate) -> Result<()> {
        let mut state = self.lock()?;
        let bug = state
            .bugs
            .get_mut(&update.id)
            .ok_or_else(|| Error::bug_tracker(format!("bug {} not found", update.id)))?;
        if let Some(status) = update.status {
            bug.status = status;
        }
        if let Some(manual) = update.manual_priority {
            bug.manual_priority = manual;
        }
        if let Some(priority) = &update.priority {
            bug.priority.clone_from(priority);
            state
                .automatic_priority
                .insert(update.id.clone(), priority.clone());
        }
        state.updates.push(update.clone());
        Ok(())
    }
}
