// src/core/store/memory/scripting.rs

//! Runs Lua scripts against the in-memory keyspace with Redis scripting
//! semantics: `KEYS`/`ARGV` globals, `redis.call`/`redis.pcall` (also exposed
//! as `spinel.*`), and the standard reply conversions in both directions.

use super::keyspace::Keyspace;
use crate::core::BrokerError;
use crate::core::store::RespValue;
use bytes::Bytes;
use mlua::prelude::*;
use mlua::{HookTriggers, VmState};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many VM instructions run between two deadline checks.
const DEADLINE_CHECK_EVERY: u32 = 10_000;

/// Evaluates `source` to completion on the calling thread, aborting it once
/// `timeout` has elapsed. The caller is responsible for excluding concurrent
/// keyspace access.
pub fn run(
    keyspace: &Arc<Keyspace>,
    source: &str,
    keys: &[String],
    args: &[Bytes],
    memory_limit: usize,
    timeout: Duration,
) -> Result<RespValue, BrokerError> {
    let lua = Lua::new();
    if memory_limit > 0 {
        lua.set_memory_limit(memory_limit)?;
    }
    let deadline = Instant::now() + timeout;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_EVERY),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                return Err(LuaError::RuntimeError(format!(
                    "script killed after running for {timeout:?}"
                )));
            }
            Ok(VmState::Continue)
        },
    );
    sandbox(&lua)?;
    register_api(&lua, keyspace)?;

    let globals = lua.globals();
    let keys_table = lua.create_table_from(
        keys.iter()
            .enumerate()
            .map(|(i, k)| (i + 1, k.as_str())),
    )?;
    globals.set("KEYS", keys_table)?;
    // A `&[u8]` converts to a Lua table, so each argument is built as a string.
    let argv_table = lua.create_table_with_capacity(args.len(), 0)?;
    for (i, arg) in args.iter().enumerate() {
        argv_table.set(i + 1, lua.create_string(arg.as_ref())?)?;
    }
    globals.set("ARGV", argv_table)?;

    let result: LuaValue = lua.load(source).eval()?;
    Ok(lua_value_to_resp_value(result)?)
}

fn sandbox(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("collectgarbage", LuaValue::Nil)?;
    if let Ok(LuaValue::Table(os_table)) = globals.get::<LuaValue>("os") {
        os_table.set("execute", LuaValue::Nil)?;
        os_table.set("exit", LuaValue::Nil)?;
        os_table.set("remove", LuaValue::Nil)?;
        os_table.set("rename", LuaValue::Nil)?;
    }
    globals.set("io", LuaValue::Nil)?;
    Ok(())
}

fn register_api(lua: &Lua, keyspace: &Arc<Keyspace>) -> LuaResult<()> {
    let api = lua.create_table()?;

    // `call` raises on error replies.
    let call_keyspace = Arc::clone(keyspace);
    let call = lua.create_function(move |lua, m_args: LuaMultiValue| {
        let argv = lua_args_to_bytes(m_args)?;
        match call_keyspace.execute(&argv) {
            RespValue::Error(e) => Err(LuaError::RuntimeError(e)),
            reply => resp_value_to_lua_value(lua, reply),
        }
    })?;
    api.set("call", call)?;

    // `pcall` hands error replies back as `{ err = ... }`.
    let pcall_keyspace = Arc::clone(keyspace);
    let pcall = lua.create_function(move |lua, m_args: LuaMultiValue| {
        let argv = lua_args_to_bytes(m_args)?;
        resp_value_to_lua_value(lua, pcall_keyspace.execute(&argv))
    })?;
    api.set("pcall", pcall)?;

    let globals = lua.globals();
    globals.set("redis", api.clone())?;
    globals.set("spinel", api)?;
    Ok(())
}

fn lua_args_to_bytes(m_args: LuaMultiValue) -> LuaResult<Vec<Bytes>> {
    m_args
        .into_vec()
        .into_iter()
        .map(|val| match val {
            LuaValue::String(s) => Ok(Bytes::copy_from_slice(&s.as_bytes())),
            LuaValue::Integer(i) => Ok(Bytes::from(i.to_string())),
            LuaValue::Number(n) => Ok(Bytes::from(n.to_string())),
            other => Err(LuaError::RuntimeError(format!(
                "Lua redis lib command arguments must be strings or integers, got {}",
                other.type_name()
            ))),
        })
        .collect()
}

/// Converts a script's return value into a reply.
fn lua_value_to_resp_value(lua_val: LuaValue) -> LuaResult<RespValue> {
    match lua_val {
        LuaValue::String(s) => Ok(RespValue::BulkString(Bytes::copy_from_slice(&s.as_bytes()))),
        LuaValue::Integer(i) => Ok(RespValue::Integer(i)),
        // Numbers are truncated to integers.
        LuaValue::Number(n) => Ok(RespValue::Integer(n as i64)),
        LuaValue::Boolean(true) => Ok(RespValue::Integer(1)),
        LuaValue::Boolean(false) | LuaValue::Nil => Ok(RespValue::Null),
        LuaValue::Table(t) => {
            if let Some(err) = t.raw_get::<Option<String>>("err")? {
                return Ok(RespValue::Error(err));
            }
            if let Some(ok) = t.raw_get::<Option<String>>("ok")? {
                return Ok(RespValue::SimpleString(ok));
            }
            // Arrays stop at the first nil, as in Redis.
            let mut items = Vec::new();
            for i in 1..=t.raw_len() {
                let item: LuaValue = t.raw_get(i)?;
                if item.is_nil() {
                    break;
                }
                items.push(lua_value_to_resp_value(item)?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(LuaError::FromLuaConversionError {
            from: other.type_name(),
            to: "RespValue".to_string(),
            message: Some("Unsupported type conversion".to_string()),
        }),
    }
}

/// Converts a command reply into the Lua value a script sees.
fn resp_value_to_lua_value(lua: &Lua, resp_val: RespValue) -> LuaResult<LuaValue> {
    match resp_val {
        RespValue::SimpleString(s) => {
            let status = lua.create_table()?;
            status.set("ok", s)?;
            Ok(LuaValue::Table(status))
        }
        RespValue::BulkString(b) => Ok(LuaValue::String(lua.create_string(&b[..])?)),
        RespValue::Integer(i) => Ok(LuaValue::Integer(i)),
        // A nil bulk reply is `false`, never `nil`, so arrays keep their shape.
        RespValue::Null => Ok(LuaValue::Boolean(false)),
        RespValue::Error(e) => {
            let err_table = lua.create_table()?;
            err_table.set("err", e)?;
            Ok(LuaValue::Table(err_table))
        }
        RespValue::Array(arr) => {
            let table = lua.create_table_with_capacity(arr.len(), 0)?;
            for (i, item) in arr.into_iter().enumerate() {
                table.set(i + 1, resp_value_to_lua_value(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}
