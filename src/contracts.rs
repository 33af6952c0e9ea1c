//! Host-side adapters for the two synchronous guest contracts: actions
//! (validate then execute) and AI behaviors (one decision per tick).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use mlua::Value;
use serde_json::Value as JsonValue;

use crate::bridge::{
    self, config_to_table, entity_to_table, params_to_table, HostWorld,
};
use crate::error::ScriptError;
use crate::registry::ScriptRegistry;
use crate::types::{AiDecision, BehaviorConfig, Outcome};

/// What became of an action attempt. Rejection is the normal shape for
/// both a `validate` veto and a contained script failure; it never consumes
/// the actor's turn.
#[derive(Debug, Clone)]
pub enum ActionResult {
    Rejected { reason: String },
    Completed(Outcome),
}

impl ActionResult {
    pub fn took_turn(&self) -> bool {
        match self {
            ActionResult::Rejected { .. } => false,
            ActionResult::Completed(outcome) => outcome.took_turn,
        }
    }
}

/// Drives an action script through validate-then-execute. `execute` runs
/// only after `validate` approves; nothing a script does can consume a turn
/// or mutate the world out of a rejected attempt's execute phase.
pub struct ActionRunner<W: HostWorld + 'static> {
    world: Rc<RefCell<W>>,
}

impl<W: HostWorld + 'static> ActionRunner<W> {
    pub fn new(world: Rc<RefCell<W>>) -> Self {
        ActionRunner { world }
    }

    pub fn run(
        &self,
        registry: &mut ScriptRegistry,
        script: &Path,
        actor_id: &str,
        params: &BTreeMap<String, JsonValue>,
    ) -> ActionResult {
        let label = script.display().to_string();
        let result = registry.with_script(script, |sandbox| {
            let args = params_to_table(sandbox.lua(), params).map_err(|err| {
                ScriptError::Runtime {
                    script: label.clone(),
                    function: "validate".to_string(),
                    reason: err.to_string(),
                }
            })?;
            let approved: bool = sandbox.call(&label, "validate", (actor_id, args))?;
            if !approved {
                return Ok(None);
            }
            // Fresh params table so execute never sees guest edits made
            // during validation.
            let args = params_to_table(sandbox.lua(), params).map_err(|err| {
                ScriptError::Runtime {
                    script: label.clone(),
                    function: "execute".to_string(),
                    reason: err.to_string(),
                }
            })?;
            let raw: Value = sandbox.call(&label, "execute", (actor_id, args))?;
            let outcome = bridge::decode_outcome(&raw).map_err(|reason| {
                ScriptError::Runtime {
                    script: label.clone(),
                    function: "execute".to_string(),
                    reason,
                }
            })?;
            Ok(Some(outcome))
        });

        match result {
            Ok(Some(outcome)) => ActionResult::Completed(outcome),
            Ok(None) => ActionResult::Rejected {
                reason: "rejected by validate".to_string(),
            },
            Err(err) => {
                eprintln!("[delve_mods] warning: action {label} failed: {err}");
                self.world
                    .borrow_mut()
                    .push_message("The attempt fizzles.".to_string());
                ActionResult::Rejected {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Ticks an AI behavior script and decodes its decision. Every failure mode
/// degrades to [`AiDecision::Idle`] so one broken mod never stalls the
/// monster loop.
pub struct BehaviorRunner<W: HostWorld + 'static> {
    world: Rc<RefCell<W>>,
}

impl<W: HostWorld + 'static> BehaviorRunner<W> {
    pub fn new(world: Rc<RefCell<W>>) -> Self {
        BehaviorRunner { world }
    }

    pub fn tick(
        &self,
        registry: &mut ScriptRegistry,
        script: &Path,
        monster_id: &str,
        config: &BehaviorConfig,
    ) -> AiDecision {
        let label = script.display().to_string();
        // Snapshot before the call; the view must not hold a world borrow
        // while guest code runs, since the bridge re-borrows per API call.
        let Some(view) = self.world.borrow().entity(monster_id) else {
            eprintln!("[delve_mods] warning: behavior {label} ticked for unknown entity {monster_id}");
            return AiDecision::Idle;
        };

        let result = registry.with_script(script, |sandbox| {
            let lua = sandbox.lua();
            let entity = entity_to_table(lua, &view).map_err(|err| ScriptError::Runtime {
                script: label.clone(),
                function: "update".to_string(),
                reason: err.to_string(),
            })?;
            let tuning = config_to_table(lua, config).map_err(|err| ScriptError::Runtime {
                script: label.clone(),
                function: "update".to_string(),
                reason: err.to_string(),
            })?;
            let raw: Value = sandbox.call(&label, "update", (entity, tuning))?;
            bridge::decode_decision(&raw).map_err(|reason| ScriptError::Runtime {
                script: label.clone(),
                function: "update".to_string(),
                reason,
            })
        });

        match result {
            Ok(decision) => decision,
            Err(err) => {
                eprintln!("[delve_mods] warning: behavior {label} idled: {err}");
                AiDecision::Idle
            }
        }
    }
}
