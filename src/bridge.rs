//! The host/guest boundary: the only channel through which guest code can
//! read or affect host state, plus the table marshaling that crosses it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use mlua::{Lua, Result as LuaResult, Table, Value};
use serde_json::Value as JsonValue;

use crate::sandbox::Binder;
use crate::types::{AiDecision, BehaviorConfig, EntityView, EventRecord, GameEvent, Outcome};

/// Host-side seam the bridge forwards into. The real game world and the
/// in-memory `SimWorld` both implement this; every mutation is expected to
/// enforce the host's own game rules (damage reduction, HP clamping) so
/// guest code cannot bypass combat math.
pub trait HostWorld {
    fn player(&self) -> Option<EntityView>;
    fn entity(&self, id: &str) -> Option<EntityView>;
    fn entity_at(&self, x: i64, y: i64) -> Option<EntityView>;
    fn entities_in_range(&self, x: i64, y: i64, radius: f64) -> Vec<EntityView>;
    fn entities_by_type(&self, entity_type: &str) -> Vec<EntityView>;
    fn is_walkable(&self, x: i64, y: i64) -> bool;
    fn in_bounds(&self, x: i64, y: i64) -> bool;
    fn turn_count(&self) -> u64;
    fn floor(&self) -> u32;

    fn modify_stat(&mut self, entity_id: &str, stat_name: &str, delta: f64) -> bool;
    fn deal_damage(&mut self, entity_id: &str, amount: i64) -> i64;
    fn heal(&mut self, entity_id: &str, amount: i64) -> i64;
    fn is_alive(&self, entity_id: &str) -> bool;
    fn push_message(&mut self, text: String);
}

/// Builds the capability set injected into every sandbox.
pub struct HostBridge<W: HostWorld + 'static> {
    world: Rc<RefCell<W>>,
}

impl<W: HostWorld + 'static> HostBridge<W> {
    pub fn new(world: Rc<RefCell<W>>) -> Self {
        HostBridge { world }
    }

    /// The binder handed to the registry; applied to each fresh sandbox,
    /// including the rebuild after a timeout.
    pub fn binder(&self) -> Binder {
        let world = self.world.clone();
        Rc::new(move |lua| install_host_api(lua, world.clone()))
    }
}

/// Registers the full guest-visible API surface as globals. Nothing outside
/// this catalog is reachable from guest code.
pub fn install_host_api<W: HostWorld + 'static>(
    lua: &Lua,
    world: Rc<RefCell<W>>,
) -> LuaResult<()> {
    let globals = lua.globals();

    let player_world = world.clone();
    globals.set(
        "get_player",
        lua.create_function(move |lua_ctx, ()| {
            entity_or_nil(lua_ctx, player_world.borrow().player())
        })?,
    )?;

    let entity_world = world.clone();
    globals.set(
        "get_entity",
        lua.create_function(move |lua_ctx, id: String| {
            entity_or_nil(lua_ctx, entity_world.borrow().entity(&id))
        })?,
    )?;

    let at_world = world.clone();
    globals.set(
        "get_entity_at",
        lua.create_function(move |lua_ctx, (x, y): (i64, i64)| {
            entity_or_nil(lua_ctx, at_world.borrow().entity_at(x, y))
        })?,
    )?;

    let range_world = world.clone();
    globals.set(
        "get_entities_in_range",
        lua.create_function(move |lua_ctx, (x, y, radius): (i64, i64, f64)| {
            let views = range_world.borrow().entities_in_range(x, y, radius);
            views_to_table(lua_ctx, &views)
        })?,
    )?;

    let by_type_world = world.clone();
    globals.set(
        "get_entities_by_type",
        lua.create_function(move |lua_ctx, entity_type: String| {
            let views = by_type_world.borrow().entities_by_type(&entity_type);
            views_to_table(lua_ctx, &views)
        })?,
    )?;

    let walkable_world = world.clone();
    globals.set(
        "is_walkable",
        lua.create_function(move |_, (x, y): (i64, i64)| {
            Ok(walkable_world.borrow().is_walkable(x, y))
        })?,
    )?;

    let bounds_world = world.clone();
    globals.set(
        "in_bounds",
        lua.create_function(move |_, (x, y): (i64, i64)| {
            Ok(bounds_world.borrow().in_bounds(x, y))
        })?,
    )?;

    let turn_world = world.clone();
    globals.set(
        "get_turn_count",
        lua.create_function(move |_, ()| Ok(turn_world.borrow().turn_count() as i64))?,
    )?;

    let floor_world = world.clone();
    globals.set(
        "get_floor",
        lua.create_function(move |_, ()| Ok(floor_world.borrow().floor() as i64))?,
    )?;

    let stat_world = world.clone();
    globals.set(
        "modify_stat",
        lua.create_function(move |_, (id, stat, delta): (String, String, f64)| {
            Ok(stat_world.borrow_mut().modify_stat(&id, &stat, delta))
        })?,
    )?;

    let damage_world = world.clone();
    globals.set(
        "deal_damage",
        lua.create_function(move |_, (id, amount): (String, i64)| {
            Ok(damage_world.borrow_mut().deal_damage(&id, amount))
        })?,
    )?;

    let heal_world = world.clone();
    globals.set(
        "heal",
        lua.create_function(move |_, (id, amount): (String, i64)| {
            Ok(heal_world.borrow_mut().heal(&id, amount))
        })?,
    )?;

    let alive_world = world.clone();
    globals.set(
        "is_alive",
        lua.create_function(move |_, id: String| Ok(alive_world.borrow().is_alive(&id)))?,
    )?;

    let message_world = world.clone();
    globals.set(
        "add_message",
        lua.create_function(move |_, text: String| {
            message_world.borrow_mut().push_message(text);
            Ok(())
        })?,
    )?;

    Ok(())
}

fn entity_or_nil(lua: &Lua, view: Option<EntityView>) -> LuaResult<Value> {
    match view {
        Some(view) => Ok(Value::Table(entity_to_table(lua, &view)?)),
        None => Ok(Value::Nil),
    }
}

pub(crate) fn entity_to_table<'lua>(lua: &'lua Lua, view: &EntityView) -> LuaResult<Table<'lua>> {
    let table = lua.create_table()?;
    table.set("id", view.id.as_str())?;
    table.set("name", view.name.as_str())?;
    table.set("entity_type", view.entity_type.as_str())?;
    table.set("x", view.x)?;
    table.set("y", view.y)?;
    table.set("hp", view.hp)?;
    table.set("max_hp", view.max_hp)?;
    table.set("attack", view.attack)?;
    table.set("defense", view.defense)?;
    table.set("is_alive", view.is_alive)?;
    let stats = lua.create_table()?;
    for (key, value) in &view.stats {
        stats.set(key.as_str(), *value)?;
    }
    table.set("stats", stats)?;
    Ok(table)
}

pub(crate) fn views_to_table<'lua>(
    lua: &'lua Lua,
    views: &[EntityView],
) -> LuaResult<Table<'lua>> {
    let table = lua.create_table()?;
    for (index, view) in views.iter().enumerate() {
        table.set(index + 1, entity_to_table(lua, view)?)?;
    }
    Ok(table)
}

pub(crate) fn config_to_table<'lua>(
    lua: &'lua Lua,
    config: &BehaviorConfig,
) -> LuaResult<Table<'lua>> {
    let table = lua.create_table()?;
    for (key, value) in config.entries() {
        table.set(key.as_str(), *value)?;
    }
    Ok(table)
}

pub(crate) fn event_to_table<'lua>(lua: &'lua Lua, event: &GameEvent) -> LuaResult<Table<'lua>> {
    let table = lua.create_table()?;
    table.set("event_type", event.event_type.as_str())?;
    table.set("turn", event.turn as i64)?;
    table.set("timestamp", event.timestamp)?;
    let data = lua.create_table()?;
    for (key, value) in &event.data {
        data.set(key.as_str(), json_to_lua(lua, value)?)?;
    }
    table.set("data", data)?;
    Ok(table)
}

pub(crate) fn params_to_table<'lua>(
    lua: &'lua Lua,
    params: &BTreeMap<String, JsonValue>,
) -> LuaResult<Table<'lua>> {
    let table = lua.create_table()?;
    for (key, value) in params {
        table.set(key.as_str(), json_to_lua(lua, value)?)?;
    }
    Ok(table)
}

pub(crate) fn json_to_lua<'lua>(lua: &'lua Lua, value: &JsonValue) -> LuaResult<Value<'lua>> {
    match value {
        JsonValue::Null => Ok(Value::Nil),
        JsonValue::Bool(flag) => Ok(Value::Boolean(*flag)),
        JsonValue::Number(number) => {
            if let Some(int) = number.as_i64() {
                Ok(Value::Integer(int))
            } else {
                Ok(Value::Number(number.as_f64().unwrap_or(0.0)))
            }
        }
        JsonValue::String(text) => Ok(Value::String(lua.create_string(text)?)),
        JsonValue::Array(items) => {
            let table = lua.create_table()?;
            for (index, item) in items.iter().enumerate() {
                table.set(index + 1, json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        JsonValue::Object(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

pub(crate) fn lua_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Nil => JsonValue::Null,
        Value::Boolean(flag) => JsonValue::Bool(*flag),
        Value::Integer(int) => JsonValue::from(*int),
        Value::Number(number) => {
            serde_json::Number::from_f64(*number).map_or(JsonValue::Null, JsonValue::Number)
        }
        Value::String(text) => match text.to_str() {
            Ok(text) => JsonValue::String(text.to_string()),
            Err(_) => JsonValue::Null,
        },
        Value::Table(table) => {
            if table.raw_len() > 0 {
                let items = table
                    .clone()
                    .sequence_values::<Value>()
                    .filter_map(|item| item.ok())
                    .map(|item| lua_to_json(&item))
                    .collect();
                JsonValue::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for pair in table.clone().pairs::<Value, Value>() {
                    let Ok((key, item)) = pair else { continue };
                    if let Value::String(key) = key {
                        if let Ok(key) = key.to_str() {
                            map.insert(key.to_string(), lua_to_json(&item));
                        }
                    }
                }
                JsonValue::Object(map)
            }
        }
        _ => JsonValue::Null,
    }
}

/// Decode the table an action script's `execute` returns. Missing fields
/// default to the conservative reading (failed, no turn consumed).
pub(crate) fn decode_outcome(value: &Value) -> Result<Outcome, String> {
    let Value::Table(table) = value else {
        return Err(format!("execute returned {}, expected a table", type_name(value)));
    };
    let success = table.get::<_, Option<bool>>("success").ok().flatten();
    let took_turn = table.get::<_, Option<bool>>("took_turn").ok().flatten();

    let mut messages = Vec::new();
    if let Ok(Some(list)) = table.get::<_, Option<Table>>("messages") {
        for item in list.sequence_values::<String>() {
            match item {
                Ok(text) => messages.push(text),
                Err(err) => return Err(format!("malformed messages entry: {err}")),
            }
        }
    }

    let mut events = Vec::new();
    if let Ok(Some(list)) = table.get::<_, Option<Table>>("events") {
        for item in list.sequence_values::<Table>() {
            let entry = item.map_err(|err| format!("malformed events entry: {err}"))?;
            let event_type: String = entry
                .get::<_, Option<String>>("event_type")
                .ok()
                .flatten()
                .ok_or_else(|| "event record missing event_type".to_string())?;
            let mut data = BTreeMap::new();
            if let Ok(Some(payload)) = entry.get::<_, Option<Table>>("data") {
                for pair in payload.pairs::<String, Value>() {
                    let (key, item) =
                        pair.map_err(|err| format!("malformed event data: {err}"))?;
                    data.insert(key, lua_to_json(&item));
                }
            }
            events.push(EventRecord { event_type, data });
        }
    }

    Ok(Outcome {
        success: success.unwrap_or(false),
        took_turn: took_turn.unwrap_or(false),
        messages,
        events,
    })
}

/// Decode the table an AI behavior's `update` returns into a decision.
pub(crate) fn decode_decision(value: &Value) -> Result<AiDecision, String> {
    let Value::Table(table) = value else {
        return Err(format!("update returned {}, expected a table", type_name(value)));
    };
    let action: String = table
        .get::<_, Option<String>>("action")
        .ok()
        .flatten()
        .ok_or_else(|| "decision missing action field".to_string())?;
    let target_id = table.get::<_, Option<String>>("target_id").ok().flatten();
    AiDecision::from_parts(&action, target_id.clone()).ok_or_else(|| match target_id {
        Some(_) => format!("unrecognised action kind {action}"),
        None => format!("action {action} is unrecognised or missing its target_id"),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) | Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Table(_) => "table",
        Value::Function(_) => "function",
        _ => "userdata",
    }
}
