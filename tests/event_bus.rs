use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use serde_json::{json, Value as JsonValue};
use tempfile::tempdir;

use delve_mods::{
    EventBus, HostBridge, SandboxBudget, ScriptError, ScriptKind, ScriptRegistry, SimEntity,
    SimWorld,
};

struct Fixture {
    world: Rc<RefCell<SimWorld>>,
    registry: ScriptRegistry,
    bus: EventBus,
}

fn fixture(world: SimWorld) -> Fixture {
    let world = Rc::new(RefCell::new(world));
    let bridge = HostBridge::new(world.clone());
    Fixture {
        registry: ScriptRegistry::new(SandboxBudget::default(), bridge.binder()),
        bus: EventBus::new(),
        world,
    }
}

fn write_handler(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, body)?;
    Ok(path)
}

fn died(entity_id: &str) -> BTreeMap<String, JsonValue> {
    BTreeMap::from([("entity_id".to_string(), json!(entity_id))])
}

#[test]
fn each_subscriber_fires_exactly_once_per_emit_in_order() -> Result<()> {
    let dir = tempdir()?;
    let first = write_handler(
        dir.path(),
        "first.lua",
        "function on_entity_died(event)\n  add_message('first saw ' .. event.data.entity_id)\nend",
    )?;
    let second = write_handler(
        dir.path(),
        "second.lua",
        "function on_entity_died(event)\n  add_message('second saw ' .. event.data.entity_id)\nend",
    )?;

    let mut fx = fixture(SimWorld::new(8, 8));
    fx.registry.register(&first, ScriptKind::EventHandler)?;
    fx.registry.register(&second, ScriptKind::EventHandler)?;
    fx.bus.subscribe(&fx.registry, "entity_died", &first, None)?;
    fx.bus.subscribe(&fx.registry, "entity_died", &second, None)?;

    let delivered = fx
        .bus
        .emit(&mut fx.registry, 7, "entity_died", died("rat"))?;
    assert!(delivered);
    assert_eq!(
        fx.world.borrow().messages(),
        ["first saw rat".to_string(), "second saw rat".to_string()]
    );

    // A second emit delivers again.
    fx.bus.emit(&mut fx.registry, 8, "entity_died", died("bat"))?;
    assert_eq!(fx.world.borrow().messages().len(), 4);
    Ok(())
}

#[test]
fn unsubscribe_stops_delivery() -> Result<()> {
    let dir = tempdir()?;
    let watcher = write_handler(
        dir.path(),
        "watcher.lua",
        "function on_entity_died(event)\n  add_message('saw it')\nend",
    )?;

    let mut fx = fixture(SimWorld::new(8, 8));
    fx.registry.register(&watcher, ScriptKind::EventHandler)?;
    fx.bus.subscribe(&fx.registry, "entity_died", &watcher, None)?;
    fx.bus.emit(&mut fx.registry, 1, "entity_died", died("rat"))?;
    assert_eq!(fx.world.borrow().messages().len(), 1);

    assert!(fx.bus.unsubscribe("entity_died", &watcher));
    let delivered = fx
        .bus
        .emit(&mut fx.registry, 2, "entity_died", died("rat"))?;
    assert!(!delivered);
    assert_eq!(fx.world.borrow().messages().len(), 1);
    Ok(())
}

#[test]
fn duplicate_subscription_delivers_once() -> Result<()> {
    let dir = tempdir()?;
    let watcher = write_handler(
        dir.path(),
        "watcher.lua",
        "function on_entity_died(event)\n  add_message('saw it')\nend",
    )?;

    let mut fx = fixture(SimWorld::new(8, 8));
    fx.registry.register(&watcher, ScriptKind::EventHandler)?;
    assert!(fx.bus.subscribe(&fx.registry, "entity_died", &watcher, None)?);
    assert!(!fx.bus.subscribe(&fx.registry, "entity_died", &watcher, None)?);

    fx.bus.emit(&mut fx.registry, 1, "entity_died", died("rat"))?;
    assert_eq!(fx.world.borrow().messages().len(), 1);
    Ok(())
}

#[test]
fn failing_handler_does_not_block_the_rest() -> Result<()> {
    let dir = tempdir()?;
    let broken = write_handler(
        dir.path(),
        "broken.lua",
        "function on_entity_died(event)\n  error('handler exploded')\nend",
    )?;
    let steady = write_handler(
        dir.path(),
        "steady.lua",
        "function on_entity_died(event)\n  add_message('still here')\nend",
    )?;

    let mut fx = fixture(SimWorld::new(8, 8));
    fx.registry.register(&broken, ScriptKind::EventHandler)?;
    fx.registry.register(&steady, ScriptKind::EventHandler)?;
    fx.bus.subscribe(&fx.registry, "entity_died", &broken, None)?;
    fx.bus.subscribe(&fx.registry, "entity_died", &steady, None)?;

    let delivered = fx
        .bus
        .emit(&mut fx.registry, 1, "entity_died", died("rat"))?;
    assert!(delivered);
    assert_eq!(fx.world.borrow().messages(), ["still here".to_string()]);
    Ok(())
}

#[test]
fn emit_of_an_unknown_type_is_an_error_with_no_side_effects() -> Result<()> {
    let mut fx = fixture(SimWorld::new(8, 8));
    let err = fx
        .bus
        .emit(&mut fx.registry, 1, "volcano_erupted", BTreeMap::new())
        .expect_err("unknown event type");
    assert!(matches!(err, ScriptError::UnknownEventType(_)));

    fx.bus.register_type("volcano_erupted");
    let delivered = fx
        .bus
        .emit(&mut fx.registry, 1, "volcano_erupted", BTreeMap::new())?;
    assert!(!delivered, "no subscribers yet");
    Ok(())
}

#[test]
fn handlers_see_the_stamped_turn() -> Result<()> {
    let dir = tempdir()?;
    let clock = write_handler(
        dir.path(),
        "clock.lua",
        "function on_turn_ended(event)\n  add_message('turn ' .. event.turn)\nend",
    )?;

    let mut fx = fixture(SimWorld::new(8, 8));
    fx.registry.register(&clock, ScriptKind::EventHandler)?;
    fx.bus.subscribe(&fx.registry, "turn_ended", &clock, None)?;
    fx.bus.emit(&mut fx.registry, 42, "turn_ended", BTreeMap::new())?;
    assert_eq!(fx.world.borrow().messages(), ["turn 42".to_string()]);
    Ok(())
}

#[test]
fn manifest_auto_discovery_subscribes_the_shipped_handlers() -> Result<()> {
    let scripts_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts");
    let mut world = SimWorld::new(8, 8);
    world.add_entity(SimEntity::new("hero", "Hero", "player").at(0, 0).vitals(20, 20));
    let mut fx = fixture(world);

    let report = fx.registry.load_dir(&scripts_root)?;
    assert!(report.skipped.is_empty(), "shipped scripts must all load");
    let installed = fx
        .bus
        .load_manifest(&fx.registry, &scripts_root.join("handlers"))?;
    assert_eq!(installed, 3);

    let data = BTreeMap::from([("item".to_string(), json!("iron sword"))]);
    let delivered = fx.bus.emit(&mut fx.registry, 5, "item_crafted", data)?;
    assert!(delivered);
    assert_eq!(
        fx.world.borrow().stat("hero", "quests.items_crafted"),
        Some(1.0)
    );
    assert_eq!(
        fx.world.borrow().messages(),
        ["Quest progress: 1 items crafted".to_string()]
    );

    // The kill tracker from the same manifest fires on entity_died.
    let data = BTreeMap::from([
        ("entity_id".to_string(), json!("rat")),
        ("killed_by".to_string(), json!("hero")),
    ]);
    fx.bus.emit(&mut fx.registry, 6, "entity_died", data)?;
    assert_eq!(fx.world.borrow().stat("hero", "achievements.kills"), Some(1.0));
    Ok(())
}
