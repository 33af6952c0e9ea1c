use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Read-only snapshot of a host entity handed to guest code.
///
/// The host owns the underlying entity; a view is copied fresh for every API
/// call and discarded when the call returns. Guest code can only affect the
/// host through the validated mutation functions on the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct EntityView {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub x: i64,
    pub y: i64,
    pub hp: i64,
    pub max_hp: i64,
    pub attack: i64,
    pub defense: i64,
    pub is_alive: bool,
    /// Per-entity scratch values (cooldown turns, one-shot flags). Durable
    /// across ticks, cleared by the host when the entity dies or despawns.
    pub stats: BTreeMap<String, f64>,
}

/// Decision returned by an AI behavior `update` call.
///
/// Target requirements are structural: the kinds that need a target carry
/// one, the kinds that do not cannot. Decoding from guest output rejects
/// unknown kinds and missing targets, so a dispatcher matching on this enum
/// never sees a malformed decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiDecision {
    Attack { target_id: String },
    MoveTowards { target_id: String },
    FleeFrom { target_id: String },
    Wander,
    Idle,
}

impl AiDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            AiDecision::Attack { .. } => "attack",
            AiDecision::MoveTowards { .. } => "move_towards",
            AiDecision::FleeFrom { .. } => "flee_from",
            AiDecision::Wander => "wander",
            AiDecision::Idle => "idle",
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            AiDecision::Attack { target_id }
            | AiDecision::MoveTowards { target_id }
            | AiDecision::FleeFrom { target_id } => Some(target_id),
            AiDecision::Wander | AiDecision::Idle => None,
        }
    }

    /// Assemble a decision from the wire shape guest scripts produce.
    pub fn from_parts(action: &str, target_id: Option<String>) -> Option<AiDecision> {
        match action {
            "attack" => Some(AiDecision::Attack {
                target_id: target_id?,
            }),
            "move_towards" => Some(AiDecision::MoveTowards {
                target_id: target_id?,
            }),
            "flee_from" => Some(AiDecision::FleeFrom {
                target_id: target_id?,
            }),
            "wander" => Some(AiDecision::Wander),
            "idle" => Some(AiDecision::Idle),
            _ => None,
        }
    }
}

/// Event emitted as a side effect of an action script, for the host to
/// forward onto the bus once the action resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, JsonValue>,
}

/// Result of an action script `execute` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub took_turn: bool,
    pub messages: Vec<String>,
    pub events: Vec<EventRecord>,
}

/// A typed game event as delivered to handler scripts. Immutable once
/// constructed; every handler receives its own Lua-table copy.
#[derive(Debug, Clone, Serialize)]
pub struct GameEvent {
    pub event_type: String,
    pub data: BTreeMap<String, JsonValue>,
    pub turn: u64,
    pub timestamp: f64,
}

/// Tuning values for one AI behavior, loaded by the host configuration
/// collaborator and passed read-only into every `update` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorConfig(pub BTreeMap<String, f64>);

impl BehaviorConfig {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

impl<const N: usize> From<[(&str, f64); N]> for BehaviorConfig {
    fn from(pairs: [(&str, f64); N]) -> Self {
        BehaviorConfig(
            pairs
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_requires_target_where_the_kind_demands_one() {
        assert!(AiDecision::from_parts("attack", None).is_none());
        assert!(AiDecision::from_parts("move_towards", None).is_none());
        assert!(AiDecision::from_parts("flee_from", None).is_none());
        let decision = AiDecision::from_parts("attack", Some("rat".into())).unwrap();
        assert_eq!(decision.target_id(), Some("rat"));
    }

    #[test]
    fn decision_rejects_unknown_kinds() {
        assert!(AiDecision::from_parts("teleport", Some("rat".into())).is_none());
    }

    #[test]
    fn targetless_kinds_ignore_targets() {
        // A stray target_id on wander/idle is dropped, not an error.
        let decision = AiDecision::from_parts("wander", Some("rat".into())).unwrap();
        assert_eq!(decision, AiDecision::Wander);
        assert_eq!(decision.target_id(), None);
    }
}
