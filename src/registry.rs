//! Loading, caching and hot-reloading of guest scripts.
//!
//! The registry is an explicit instance owned by the host and passed by
//! reference into whatever needs script resolution; there is deliberately
//! no process-wide singleton so tests stay hermetic.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::error::ScriptError;
use crate::sandbox::{Binder, Sandbox, SandboxBudget};

/// Contract a script implements, derived from the directory it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Action,
    AiBehavior,
    EventHandler,
}

impl ScriptKind {
    pub fn label(self) -> &'static str {
        match self {
            ScriptKind::Action => "action",
            ScriptKind::AiBehavior => "ai_behavior",
            ScriptKind::EventHandler => "event_handler",
        }
    }

    /// Entry points a script of this kind must export to register at all.
    /// Event handlers are validated later, against the manifest that names
    /// their handler functions.
    fn required_exports(self) -> &'static [&'static str] {
        match self {
            ScriptKind::Action => &["validate", "execute"],
            ScriptKind::AiBehavior => &["update"],
            ScriptKind::EventHandler => &[],
        }
    }

    fn directory(self) -> &'static str {
        match self {
            ScriptKind::Action => "actions",
            ScriptKind::AiBehavior => "ai",
            ScriptKind::EventHandler => "handlers",
        }
    }
}

struct ScriptHandle {
    kind: ScriptKind,
    exports: BTreeSet<String>,
    sandbox: Sandbox,
    source_len: u64,
    modified: Option<SystemTime>,
}

/// Result of a directory scan: what registered, what was skipped and why.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub registered: Vec<(PathBuf, ScriptKind)>,
    pub skipped: Vec<(PathBuf, String)>,
}

pub struct ScriptRegistry {
    budget: SandboxBudget,
    binder: Binder,
    scripts: BTreeMap<PathBuf, ScriptHandle>,
}

impl ScriptRegistry {
    pub fn new(budget: SandboxBudget, binder: Binder) -> ScriptRegistry {
        ScriptRegistry {
            budget,
            binder,
            scripts: BTreeMap::new(),
        }
    }

    /// Scan a scripts root laid out by the `actions/`, `ai/`, `handlers/`
    /// convention. A script that fails to load is reported and skipped; the
    /// host runs on without it.
    pub fn load_dir(&mut self, root: &Path) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for kind in [
            ScriptKind::Action,
            ScriptKind::AiBehavior,
            ScriptKind::EventHandler,
        ] {
            let dir = root.join(kind.directory());
            if !dir.is_dir() {
                continue;
            }
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("scanning script directory {}", dir.display()))?;
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|ext| ext == "lua").unwrap_or(false))
                .collect();
            paths.sort();
            for path in paths {
                match self.register(&path, kind) {
                    Ok(()) => report.registered.push((path, kind)),
                    Err(err) => {
                        eprintln!("[delve_mods] warning: skipping {}: {err}", path.display());
                        report.skipped.push((path, err.to_string()));
                    }
                }
            }
        }
        Ok(report)
    }

    /// Compile a script into a fresh bound sandbox and cache the handle.
    /// Re-registering an already-known path replaces the cached handle.
    pub fn register(&mut self, path: &Path, kind: ScriptKind) -> Result<(), ScriptError> {
        let label = path.display().to_string();
        let source = fs::read_to_string(path).map_err(|err| ScriptError::Load {
            path: label.clone(),
            reason: err.to_string(),
        })?;
        let sandbox = Sandbox::new(self.budget, &self.binder).map_err(|err| {
            ScriptError::Load {
                path: label.clone(),
                reason: err.to_string(),
            }
        })?;
        let exports: BTreeSet<String> =
            sandbox.load_chunk(&source, &label)?.into_iter().collect();
        for required in kind.required_exports() {
            if !exports.contains(*required) {
                return Err(ScriptError::MissingExport {
                    path: label,
                    function: (*required).to_string(),
                });
            }
        }
        let (source_len, modified) = source_fingerprint(path);
        self.scripts.insert(
            path.to_path_buf(),
            ScriptHandle {
                kind,
                exports,
                sandbox,
                source_len,
                modified,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, path: &Path) -> bool {
        self.scripts.remove(path).is_some()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.scripts.contains_key(path)
    }

    pub fn kind_of(&self, path: &Path) -> Option<ScriptKind> {
        self.scripts.get(path).map(|handle| handle.kind)
    }

    pub fn exports_of(&self, path: &Path) -> Option<&BTreeSet<String>> {
        self.scripts.get(path).map(|handle| &handle.exports)
    }

    pub fn has_export(&self, path: &Path, function: &str) -> bool {
        self.exports_of(path)
            .map(|exports| exports.contains(function))
            .unwrap_or(false)
    }

    pub fn scripts_of_kind(&self, kind: ScriptKind) -> Vec<PathBuf> {
        self.scripts
            .iter()
            .filter(|(_, handle)| handle.kind == kind)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Resolve a script and lend its sandbox to the caller.
    ///
    /// Reloads the script first if the source changed on disk. Afterwards,
    /// a sandbox poisoned by a timeout is discarded and rebuilt from source
    /// so the next call starts from a known state; if the rebuild fails the
    /// registration is dropped with a warning.
    pub fn with_script<T>(
        &mut self,
        path: &Path,
        f: impl FnOnce(&Sandbox) -> Result<T, ScriptError>,
    ) -> Result<T, ScriptError> {
        let kind = self
            .kind_of(path)
            .ok_or_else(|| ScriptError::NotRegistered(path.to_path_buf()))?;

        if self.source_changed(path) {
            self.register(path, kind).map_err(|err| {
                self.scripts.remove(path);
                err
            })?;
        }

        let handle = self
            .scripts
            .get(path)
            .ok_or_else(|| ScriptError::NotRegistered(path.to_path_buf()))?;
        let out = f(&handle.sandbox);

        if handle.sandbox.is_poisoned() {
            if let Err(err) = self.register(path, kind) {
                eprintln!(
                    "[delve_mods] warning: dropping {} after failed sandbox rebuild: {err}",
                    path.display()
                );
                self.scripts.remove(path);
            }
        }
        out
    }

    fn source_changed(&self, path: &Path) -> bool {
        let Some(handle) = self.scripts.get(path) else {
            return false;
        };
        let (source_len, modified) = source_fingerprint(path);
        source_len != handle.source_len || modified != handle.modified
    }
}

fn source_fingerprint(path: &Path) -> (u64, Option<SystemTime>) {
    match fs::metadata(path) {
        Ok(meta) => (meta.len(), meta.modified().ok()),
        Err(_) => (0, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::rc::Rc;
    use tempfile::tempdir;

    fn empty_binder() -> Binder {
        Rc::new(|_| Ok(()))
    }

    #[test]
    fn load_dir_registers_by_convention_and_skips_broken_scripts() -> Result<()> {
        let root = tempdir()?;
        fs::create_dir(root.path().join("actions"))?;
        fs::create_dir(root.path().join("ai"))?;
        fs::write(
            root.path().join("actions/shove.lua"),
            "function validate() return true end\nfunction execute() return {} end",
        )?;
        fs::write(
            root.path().join("ai/drifter.lua"),
            "function update() return { action = 'wander' } end",
        )?;
        fs::write(root.path().join("ai/broken.lua"), "function update( syntax error")?;
        // Missing required export.
        fs::write(root.path().join("actions/lopsided.lua"), "function validate() return true end")?;

        let mut registry = ScriptRegistry::new(SandboxBudget::default(), empty_binder());
        let report = registry.load_dir(root.path())?;

        assert_eq!(report.registered.len(), 2);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(
            registry.kind_of(&root.path().join("actions/shove.lua")),
            Some(ScriptKind::Action)
        );
        assert!(!registry.contains(&root.path().join("ai/broken.lua")));
        assert!(!registry.contains(&root.path().join("actions/lopsided.lua")));
        Ok(())
    }

    #[test]
    fn with_script_reloads_when_the_source_changes() -> Result<()> {
        let root = tempdir()?;
        let path = root.path().join("counter.lua");
        fs::write(&path, "function update() return { action = 'idle' } end")?;

        let mut registry = ScriptRegistry::new(SandboxBudget::default(), empty_binder());
        registry.register(&path, ScriptKind::AiBehavior)?;

        // Rewrite with a different length so the fingerprint check trips.
        fs::write(
            &path,
            "function update() return { action = 'wander' } end\nfunction extra() end",
        )?;
        registry.with_script(&path, |sandbox| {
            assert!(sandbox.has_function("extra"), "reload should pick up new exports");
            Ok(())
        })?;
        Ok(())
    }
}
