//! Embedded Lua scripting for a dungeon-crawler host.
//!
//! Guest mods extend the game along three contracts: custom player
//! **actions** (validate, then execute), monster **AI behaviors** (one
//! decision per tick), and **event handlers** driven by a typed
//! publish/subscribe bus. Every script runs inside its own default-deny
//! [`sandbox::Sandbox`] under a wall-clock watchdog, talking to the host
//! only through the capability functions the [`bridge`] installs.

pub mod bridge;
pub mod contracts;
pub mod error;
pub mod events;
pub mod registry;
pub mod sandbox;
pub mod types;
pub mod world;

pub use bridge::{HostBridge, HostWorld};
pub use contracts::{ActionResult, ActionRunner, BehaviorRunner};
pub use error::ScriptError;
pub use events::{EventBus, HandlerRef, BUILTIN_EVENT_TYPES, MANIFEST_FILE};
pub use registry::{LoadReport, ScriptKind, ScriptRegistry};
pub use sandbox::{Binder, Sandbox, SandboxBudget};
pub use types::{AiDecision, BehaviorConfig, EntityView, EventRecord, GameEvent, Outcome};
pub use world::{SimEntity, SimWorld};
