use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::{
    Error as LuaError, FromLuaMulti, Function, HookTriggers, IntoLuaMulti, Lua, LuaOptions,
    StdLib, Value,
};

use crate::error::ScriptError;

/// Installs the host-supplied capability set into a fresh guest interpreter.
/// The bridge builds one of these; the registry applies it to every sandbox
/// it constructs, including rebuilds after a timeout.
pub type Binder = Rc<dyn Fn(&Lua) -> mlua::Result<()>>;

/// Execution limits applied to every guest call.
#[derive(Debug, Clone, Copy)]
pub struct SandboxBudget {
    /// Wall-clock ceiling for a single call.
    pub wall_clock: Duration,
    /// How many VM instructions run between watchdog checks.
    pub instruction_interval: u32,
}

impl Default for SandboxBudget {
    fn default() -> Self {
        SandboxBudget {
            wall_clock: Duration::from_secs(3),
            instruction_interval: 2048,
        }
    }
}

/// Base-library functions removed from every sandbox. `load`/`dofile` and
/// friends are dynamic code loading; `pcall`/`xpcall` would let a guest
/// swallow the watchdog abort and keep running past its budget.
const SCRUBBED_GLOBALS: &[&str] = &[
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "collectgarbage",
    "pcall",
    "xpcall",
];

/// An isolated guest interpreter holding one compiled script.
///
/// Built default-deny: only the table/string/math standard libraries plus
/// whatever the binder injects are reachable. A sandbox that trips the
/// watchdog is poisoned and must be discarded by its owner, never resumed.
pub struct Sandbox {
    lua: Lua,
    budget: SandboxBudget,
    poisoned: Cell<bool>,
}

impl Sandbox {
    pub fn new(budget: SandboxBudget, binder: &Binder) -> mlua::Result<Sandbox> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )?;
        {
            let globals = lua.globals();
            for name in SCRUBBED_GLOBALS {
                globals.raw_set(*name, Value::Nil)?;
            }
        }
        binder(&lua)?;
        Ok(Sandbox {
            lua,
            budget,
            poisoned: Cell::new(false),
        })
    }

    /// Compile and run a script chunk, returning the global function names
    /// it defined. Syntax errors and top-level failures surface as load
    /// errors; the chunk is never partially registered.
    pub fn load_chunk(&self, source: &str, label: &str) -> Result<Vec<String>, ScriptError> {
        let before = self.global_functions().map_err(|err| ScriptError::Load {
            path: label.to_string(),
            reason: err.to_string(),
        })?;
        self.lua
            .load(source)
            .set_name(label)
            .exec()
            .map_err(|err| ScriptError::Load {
                path: label.to_string(),
                reason: err.to_string(),
            })?;
        let after = self.global_functions().map_err(|err| ScriptError::Load {
            path: label.to_string(),
            reason: err.to_string(),
        })?;
        Ok(after.difference(&before).cloned().collect())
    }

    pub fn has_function(&self, name: &str) -> bool {
        matches!(
            self.lua.globals().get::<_, Value>(name),
            Ok(Value::Function(_))
        )
    }

    /// True once a call has timed out in this sandbox. The interpreter may
    /// be mid-execution of unknown guest state; the owner must rebuild.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Invoke an exported function under the watchdog.
    ///
    /// Every path through here is contained: a missing export, a guest
    /// error, and a blown budget each map to their `ScriptError` variant
    /// instead of unwinding into the host.
    pub fn call<'lua, A, R>(
        &'lua self,
        script: &str,
        function: &str,
        args: A,
    ) -> Result<R, ScriptError>
    where
        A: IntoLuaMulti<'lua>,
        R: FromLuaMulti<'lua>,
    {
        if self.poisoned.get() {
            return Err(ScriptError::Runtime {
                script: script.to_string(),
                function: function.to_string(),
                reason: "sandbox was poisoned by an earlier timeout".to_string(),
            });
        }
        let func: Function = self.lua.globals().get(function).map_err(|_| {
            ScriptError::MissingExport {
                path: script.to_string(),
                function: function.to_string(),
            }
        })?;

        let deadline = Instant::now() + self.budget.wall_clock;
        let fired = Rc::new(Cell::new(false));
        let hook_fired = fired.clone();
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(self.budget.instruction_interval.max(1)),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    hook_fired.set(true);
                    return Err(LuaError::RuntimeError(
                        "execution budget exhausted".to_string(),
                    ));
                }
                Ok(())
            },
        );
        let result = func.call::<A, R>(args);
        self.lua.remove_hook();

        match result {
            Ok(value) => Ok(value),
            Err(_) if fired.get() => {
                self.poisoned.set(true);
                Err(ScriptError::Timeout {
                    script: script.to_string(),
                    function: function.to_string(),
                    budget_ms: self.budget.wall_clock.as_millis() as u64,
                })
            }
            Err(err) => Err(ScriptError::Runtime {
                script: script.to_string(),
                function: function.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    fn global_functions(&self) -> mlua::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for pair in self.lua.globals().pairs::<Value, Value>() {
            let (key, value) = pair?;
            if let (Value::String(name), Value::Function(_)) = (&key, &value) {
                names.insert(name.to_str()?.to_string());
            }
        }
        Ok(names)
    }
}
