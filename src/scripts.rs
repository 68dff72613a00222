//! Lua cloud code triggers.
//!
//! A trigger script defines a global `trigger(request)` function. `request` is a
//! table with the fields `object`, `original` (nil on create), `master`, `user`
//! (nil when anonymous) and `kind` (`"beforeSave"` or `"afterSave"`). Returning
//! a table replaces the pending object; returning nil keeps it. A global
//! `log(message)` helper forwards to tracing.
//!
//! Each invocation runs in a fresh Lua state, so scripts cannot leak state
//! between requests.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::storage::Object;
use crate::triggers::{Trigger, TriggerKind, TriggerRegistry, TriggerRequest};

pub struct LuaTrigger {
    name: String,
    source: String,
}

impl LuaTrigger {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self { name: name.into(), source: source.into() }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).with_context(|| format!("reading trigger script {}", path.display()))?;
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("trigger.lua").to_string();
        Ok(Self::new(name, source))
    }

    pub fn name(&self) -> &str { &self.name }

    fn run_sync(&self, request: &TriggerRequest) -> Result<Option<Object>, mlua::Error> {
        let lua = mlua::Lua::new();
        let globals = lua.globals();
        let script = self.name.clone();
        let log = lua.create_function(move |_, msg: String| {
            info!(target: "basalt::cloud", "[{}] {}", script, msg);
            Ok(())
        })?;
        globals.set("log", log)?;
        lua.load(self.source.as_str()).set_name(self.name.as_str()).exec()?;

        let func: mlua::Function = globals.get("trigger")?;
        let req = lua.create_table()?;
        req.set("object", json_to_lua(&lua, &Value::Object(request.object.to_json()))?)?;
        if let Some(original) = &request.original {
            req.set("original", json_to_lua(&lua, &Value::Object(original.to_json()))?)?;
        }
        req.set("master", request.master)?;
        if let Some(user) = &request.user_id {
            req.set("user", user.as_str())?;
        }
        req.set("kind", request.kind.as_str())?;

        let out: mlua::Value = func.call(req)?;
        match out {
            mlua::Value::Nil => Ok(None),
            mlua::Value::Table(_) => match lua_to_json(out)? {
                Value::Object(map) => Ok(Some(map)),
                // An empty table comes back as an empty object; arrays are not objects
                _ => Err(mlua::Error::RuntimeError("trigger must return a table of fields or nil".into())),
            },
            other => Err(mlua::Error::RuntimeError(format!("trigger returned a {}, expected table or nil", other.type_name()))),
        }
    }
}

#[async_trait]
impl Trigger for LuaTrigger {
    async fn run(&self, request: &TriggerRequest) -> AppResult<Option<Object>> {
        debug!(target: "basalt::cloud", "lua {} {} on {}", self.name, request.kind, request.object.class_name());
        self.run_sync(request).map_err(|e| AppError::script_failed(e.to_string()))
    }
}

fn json_to_lua<'lua>(lua: &'lua mlua::Lua, v: &Value) -> mlua::Result<mlua::Value<'lua>> {
    use mlua::Value as LVal;
    let lv = match v {
        Value::Null => LVal::Nil,
        Value::Bool(b) => LVal::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() { LVal::Integer(i) } else { LVal::Number(n.as_f64().unwrap_or(0.0)) }
        }
        Value::String(s) => LVal::String(lua.create_string(s)?),
        Value::Array(arr) => {
            let tbl = lua.create_table()?;
            for (i, item) in arr.iter().enumerate() { tbl.set((i + 1) as i64, json_to_lua(lua, item)?)?; }
            LVal::Table(tbl)
        }
        Value::Object(map) => {
            let tbl = lua.create_table()?;
            for (k, val) in map.iter() { tbl.set(k.as_str(), json_to_lua(lua, val)?)?; }
            LVal::Table(tbl)
        }
    };
    Ok(lv)
}

fn lua_to_json(v: mlua::Value) -> mlua::Result<Value> {
    use mlua::Value as LVal;
    let j = match v {
        LVal::Nil => Value::Null,
        LVal::Boolean(b) => Value::Bool(b),
        LVal::Integer(i) => serde_json::json!(i),
        LVal::Number(f) => serde_json::json!(f),
        LVal::String(s) => Value::String(s.to_str()?.to_string()),
        LVal::Table(t) => {
            let mut is_array = true;
            let mut max_idx = 0i64;
            for pair in t.clone().pairs::<LVal, LVal>() {
                let (k, _v) = pair?;
                match k {
                    LVal::Integer(i) if i > 0 => { max_idx = max_idx.max(i); }
                    _ => { is_array = false; break; }
                }
            }
            if is_array && max_idx > 0 {
                let mut arr = Vec::with_capacity(max_idx as usize);
                for i in 1..=max_idx { arr.push(lua_to_json(t.get::<i64, LVal>(i)?)?); }
                Value::Array(arr)
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<LVal, LVal>() {
                    let (k, v) = pair?;
                    if let LVal::String(s) = k { map.insert(s.to_str()?.to_string(), lua_to_json(v)?); }
                }
                Value::Object(map)
            }
        }
        _ => Value::Null,
    };
    Ok(j)
}

/// Register every `<Class>.before_save.lua` / `<Class>.after_save.lua` found in
/// `dir` for `app_id`. Returns the number of triggers loaded.
pub fn load_triggers_from_dir(registry: &TriggerRegistry, app_id: &str, dir: &Path) -> Result<usize> {
    if !dir.exists() { return Ok(0); }
    let mut loaded = 0usize;
    for ent in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = ent?.path();
        if !path.is_file() { continue; }
        let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else { continue; };
        let Some(stem) = file_name.strip_suffix(".lua") else { continue; };
        let Some((class_name, hook)) = stem.rsplit_once('.') else { continue; };
        let kind = match hook {
            "before_save" => TriggerKind::BeforeSave,
            "after_save" => TriggerKind::AfterSave,
            _ => continue,
        };
        let trigger = LuaTrigger::from_file(&path)?;
        info!(target: "basalt::cloud", "loaded {} trigger for {}.{} from {}", kind, app_id, class_name, path.display());
        registry.register(app_id, class_name, kind, Arc::new(trigger));
        loaded += 1;
    }
    Ok(loaded)
}
