// ABOUTME: Trigger table - maps a written snapshot key to the group whose run it starts
// ABOUTME: Manual testing keys are ignored; unknown keys are an error

use anyhow::{bail, Result};

use crate::hierarchy::EntityGroup;
use crate::orchestrator::{RunMode, RunState};

/// Marker in a snapshot file name that keeps it out of the trigger table.
pub const MANUAL_TESTING: &str = "MANUAL_TESTING";

const TRIGGERS: [(&str, EntityGroup); 3] = [
    ("company_new_run", EntityGroup::CompanyHierarchy),
    ("cost_center_new_run", EntityGroup::CostCenterHierarchy),
    ("building_new_run", EntityGroup::LocationHierarchy),
];

/// Group to start for a snapshot key, or `None` for a manual testing key.
pub fn route(key: &str) -> Result<Option<EntityGroup>> {
    let name = key.rsplit('/').next().unwrap_or(key);
    if name.contains(MANUAL_TESTING) {
        tracing::info!("Ignoring manual testing snapshot {}", key);
        return Ok(None);
    }
    for (prefix, group) in TRIGGERS {
        if name.starts_with(prefix) {
            return Ok(Some(group));
        }
    }
    bail!("No run is triggered by snapshot key '{}'", key)
}

/// Run state a trigger starts with.
pub fn start_state(group: EntityGroup) -> RunState {
    RunState::new(group, RunState::today(), RunMode::Continue)
}
