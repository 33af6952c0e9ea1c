//! Typed publish/subscribe dispatch into event handler scripts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::bridge::event_to_table;
use crate::error::ScriptError;
use crate::registry::{ScriptKind, ScriptRegistry};
use crate::types::GameEvent;

/// Events the host emits out of the box. Mods extend the taxonomy through
/// [`EventBus::register_type`].
pub const BUILTIN_EVENT_TYPES: &[&str] = &[
    "entity_died",
    "entity_spawned",
    "item_crafted",
    "item_picked_up",
    "floor_changed",
    "turn_ended",
    "player_leveled",
];

/// File the handlers directory may carry to declare its subscriptions.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One subscription: a handler script plus the exported function to call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HandlerRef {
    pub script: PathBuf,
    pub function: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    subscriptions: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    event: String,
    script: String,
    #[serde(default)]
    handler: Option<String>,
}

/// Synchronous event dispatcher. Emission walks the subscription list in
/// registration order on the caller's thread; there is no queue and no
/// deferral, so by the time `emit` returns every handler has run (or been
/// contained).
pub struct EventBus {
    types: BTreeSet<String>,
    subscriptions: BTreeMap<String, Vec<HandlerRef>>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus {
            types: BUILTIN_EVENT_TYPES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            subscriptions: BTreeMap::new(),
        }
    }

    /// Add a mod-defined event type. Returns false if it already existed.
    pub fn register_type(&mut self, event_type: &str) -> bool {
        self.types.insert(event_type.to_string())
    }

    pub fn event_types(&self) -> Vec<String> {
        self.types.iter().cloned().collect()
    }

    pub fn subscribers(&self, event_type: &str) -> &[HandlerRef] {
        self.subscriptions
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Subscribe a handler script to an event type. The handler function
    /// defaults to `on_<event_type>`. An exact duplicate subscription is a
    /// no-op reported as `Ok(false)`.
    pub fn subscribe(
        &mut self,
        registry: &ScriptRegistry,
        event_type: &str,
        script: &Path,
        function: Option<&str>,
    ) -> Result<bool, ScriptError> {
        if !self.types.contains(event_type) {
            return Err(ScriptError::UnknownEventType(event_type.to_string()));
        }
        if registry.kind_of(script) != Some(ScriptKind::EventHandler) {
            return Err(ScriptError::NotRegistered(script.to_path_buf()));
        }
        let function = function
            .map(str::to_string)
            .unwrap_or_else(|| format!("on_{event_type}"));
        if !registry.has_export(script, &function) {
            return Err(ScriptError::MissingExport {
                path: script.display().to_string(),
                function,
            });
        }
        let handler = HandlerRef {
            script: script.to_path_buf(),
            function,
        };
        let entries = self.subscriptions.entry(event_type.to_string()).or_default();
        if entries.contains(&handler) {
            return Ok(false);
        }
        entries.push(handler);
        Ok(true)
    }

    /// Drop every subscription the script holds under this event type.
    /// A dispatch already in flight iterates its own snapshot and is not
    /// affected.
    pub fn unsubscribe(&mut self, event_type: &str, script: &Path) -> bool {
        let Some(entries) = self.subscriptions.get_mut(event_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|handler| handler.script != script);
        entries.len() != before
    }

    /// Stamp and dispatch an event. Returns whether at least one handler
    /// ran to completion. Each handler is contained independently: a guest
    /// error or timeout is logged and the remaining handlers still run.
    pub fn emit(
        &mut self,
        registry: &mut ScriptRegistry,
        turn: u64,
        event_type: &str,
        data: BTreeMap<String, JsonValue>,
    ) -> Result<bool, ScriptError> {
        if !self.types.contains(event_type) {
            return Err(ScriptError::UnknownEventType(event_type.to_string()));
        }
        let event = GameEvent {
            event_type: event_type.to_string(),
            data,
            turn,
            timestamp: unix_timestamp(),
        };
        let snapshot: Vec<HandlerRef> = self.subscribers(event_type).to_vec();
        let mut delivered = false;
        for handler in snapshot {
            let label = handler.script.display().to_string();
            let outcome = registry.with_script(&handler.script, |sandbox| {
                let payload =
                    event_to_table(sandbox.lua(), &event).map_err(|err| ScriptError::Runtime {
                        script: label.clone(),
                        function: handler.function.clone(),
                        reason: err.to_string(),
                    })?;
                sandbox.call::<_, ()>(&label, &handler.function, payload)
            });
            match outcome {
                Ok(()) => delivered = true,
                Err(err) => {
                    eprintln!("[delve_mods] warning: handler {label} failed on {event_type}: {err}");
                }
            }
        }
        Ok(delivered)
    }

    /// Read `manifest.json` from the handlers directory and subscribe every
    /// resolvable entry. Script paths in the manifest are relative to the
    /// directory. Entries that do not resolve are skipped with a warning;
    /// returns how many subscriptions were installed.
    pub fn load_manifest(
        &mut self,
        registry: &ScriptRegistry,
        handlers_dir: &Path,
    ) -> Result<usize> {
        let manifest_path = handlers_dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Ok(0);
        }
        let raw = fs::read_to_string(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", manifest_path.display()))?;

        let mut installed = 0;
        for entry in manifest.subscriptions {
            let script = handlers_dir.join(&entry.script);
            match self.subscribe(registry, &entry.event, &script, entry.handler.as_deref()) {
                Ok(true) => installed += 1,
                Ok(false) => {}
                Err(err) => {
                    eprintln!(
                        "[delve_mods] warning: manifest entry {} -> {} skipped: {err}",
                        entry.event, entry.script
                    );
                }
            }
        }
        Ok(installed)
    }
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
