use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use delve_mods::{
    BehaviorConfig, BehaviorRunner, EventBus, HostBridge, HostWorld, SandboxBudget, ScriptKind,
    ScriptRegistry, SimEntity, SimWorld,
};

/// Offline linter for a mod scripts directory.
#[derive(Parser, Debug)]
#[command(
    about = "Scan a scripts root, report what registers, and smoke-run behaviors",
    version
)]
struct Args {
    /// Scripts root holding the actions/, ai/, handlers/ directories
    #[arg(long, default_value = "scripts")]
    scripts_root: PathBuf,

    /// Optional JSON file mapping behavior script stems to tuning tables
    #[arg(long)]
    behavior_config: Option<PathBuf>,

    /// Tick every AI behavior once against a canned world and emit one
    /// turn_ended event
    #[arg(long)]
    smoke_test: bool,

    /// Path to write the report as JSON
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Print exports per script instead of the compact view
    #[arg(long)]
    verbose: bool,
}

#[derive(Serialize)]
struct ScriptEntry {
    path: PathBuf,
    kind: ScriptKind,
    exports: Vec<String>,
}

#[derive(Serialize)]
struct SkippedEntry {
    path: PathBuf,
    reason: String,
}

#[derive(Serialize)]
struct SubscriptionEntry {
    event: String,
    script: PathBuf,
    function: String,
}

#[derive(Serialize)]
struct SmokeEntry {
    script: PathBuf,
    decision: String,
    target: Option<String>,
}

#[derive(Serialize)]
struct Report {
    scripts: Vec<ScriptEntry>,
    skipped: Vec<SkippedEntry>,
    subscriptions: Vec<SubscriptionEntry>,
    smoke: Option<SmokeReport>,
}

#[derive(Serialize)]
struct SmokeReport {
    behaviors: Vec<SmokeEntry>,
    turn_ended_delivered: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let world = Rc::new(RefCell::new(canned_world()));
    let bridge = HostBridge::new(world.clone());
    let mut registry = ScriptRegistry::new(SandboxBudget::default(), bridge.binder());

    let load = registry
        .load_dir(&args.scripts_root)
        .with_context(|| format!("scanning {}", args.scripts_root.display()))?;

    let mut bus = EventBus::new();
    bus.load_manifest(&registry, &args.scripts_root.join("handlers"))
        .context("loading handler manifest")?;

    let mut report = Report {
        scripts: Vec::new(),
        skipped: Vec::new(),
        subscriptions: Vec::new(),
        smoke: None,
    };
    for (path, kind) in &load.registered {
        report.scripts.push(ScriptEntry {
            path: path.clone(),
            kind: *kind,
            exports: registry
                .exports_of(path)
                .map(|exports| exports.iter().cloned().collect())
                .unwrap_or_default(),
        });
    }
    for (path, reason) in &load.skipped {
        report.skipped.push(SkippedEntry {
            path: path.clone(),
            reason: reason.clone(),
        });
    }
    for event in bus.event_types() {
        for handler in bus.subscribers(&event) {
            report.subscriptions.push(SubscriptionEntry {
                event: event.clone(),
                script: handler.script.clone(),
                function: handler.function.clone(),
            });
        }
    }

    println!(
        "{} scripts registered, {} skipped, {} subscriptions",
        report.scripts.len(),
        report.skipped.len(),
        report.subscriptions.len()
    );
    for entry in &report.scripts {
        if args.verbose {
            println!(
                "  {:<14} {} (exports: {})",
                entry.kind.label(),
                entry.path.display(),
                entry.exports.join(", ")
            );
        } else {
            println!("  {:<14} {}", entry.kind.label(), entry.path.display());
        }
    }
    for entry in &report.skipped {
        println!("  skipped        {} ({})", entry.path.display(), entry.reason);
    }
    for entry in &report.subscriptions {
        println!(
            "  subscription   {} -> {}::{}",
            entry.event,
            entry.script.display(),
            entry.function
        );
    }

    if args.smoke_test {
        let configs = load_behavior_configs(args.behavior_config.as_deref())?;
        let runner = BehaviorRunner::new(world.clone());
        let mut behaviors = Vec::new();
        for script in registry.scripts_of_kind(ScriptKind::AiBehavior) {
            let stem = script
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let config = configs.get(&stem).cloned().unwrap_or_default();
            let decision = runner.tick(&mut registry, &script, "smoke_monster", &config);
            println!(
                "  smoke          {} -> {}{}",
                script.display(),
                decision.kind(),
                decision
                    .target_id()
                    .map(|target| format!(" ({target})"))
                    .unwrap_or_default()
            );
            behaviors.push(SmokeEntry {
                script,
                decision: decision.kind().to_string(),
                target: decision.target_id().map(str::to_string),
            });
        }
        world.borrow_mut().advance_turn();
        let turn = world.borrow().turn_count();
        let delivered = bus
            .emit(&mut registry, turn, "turn_ended", BTreeMap::new())
            .context("emitting turn_ended")?;
        println!(
            "  smoke          turn_ended {}",
            if delivered { "delivered" } else { "had no handlers" }
        );
        report.smoke = Some(SmokeReport {
            behaviors,
            turn_ended_delivered: delivered,
        });
    }

    if let Some(path) = args.report_json.as_ref() {
        let json = serde_json::to_string_pretty(&report).context("serialising report")?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("report written to {}", path.display());
    }

    Ok(())
}

fn canned_world() -> SimWorld {
    let mut world = SimWorld::new(24, 24);
    world.add_entity(
        SimEntity::new("hero", "Hero", "player")
            .at(2, 2)
            .vitals(20, 20)
            .combat(5, 2),
    );
    world.add_entity(
        SimEntity::new("smoke_monster", "Smoke Monster", "monster")
            .at(8, 8)
            .vitals(10, 20)
            .combat(4, 1),
    );
    world
}

fn load_behavior_configs(
    path: Option<&std::path::Path>,
) -> Result<BTreeMap<String, BehaviorConfig>> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
