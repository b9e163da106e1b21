//! Handles, primitive values, errors, closures and property bags.

use super::{fallible, flag, infallible};
use crate::closure;
use crate::codec;
use crate::error::{BridgeError, BridgeResult, HostError};
use crate::guest::HostGuest;
use crate::heap::Handle;
use crate::memory::GuestMemory;
use crate::runtime::host::{InterfaceBuilder, LinkerError};
use crate::state::BridgeState;
use crate::value::HostValue;
use hostbind_abi::Constant;
use std::collections::BTreeMap;
use wasmtime::Caller;

type Iface<'a, 'b> = InterfaceBuilder<'a, 'b, BridgeState>;

fn test_value(g: &mut HostGuest<'_>, h: i32, test: impl FnOnce(&HostValue) -> bool) -> BridgeResult<i32> {
    Ok(flag(test(g.state().value(Handle::from_abi(h))?)))
}

fn error_of(g: &HostGuest<'_>, h: i32) -> BridgeResult<HostError> {
    match g.state().value(Handle::from_abi(h))? {
        HostValue::Error(err) => Ok(err.clone()),
        other => Err(BridgeError::protocol(format!(
            "expected error, found {}",
            other.kind()
        ))),
    }
}

pub(super) fn register(iface: &mut Iface<'_, '_>) -> Result<(), LinkerError> {
    iface
        .func_raw("object_drop_ref", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "object_drop_ref", |g| {
                g.state_mut().drop_handle(Handle::from_abi(h)).map(drop)
            })
        })?
        .func_raw("object_clone_ref", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "object_clone_ref", |g| {
                Ok(g.state_mut().clone_handle(Handle::from_abi(h))?.to_abi())
            })
        })?
        .func_raw("string_new", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "string_new", |g| {
                let text = codec::decode(g, ptr as u32, len as u32)?;
                Ok(g.state_mut().alloc(HostValue::String(text)).to_abi())
            })
        })?
        .func_raw("string_get", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "string_get", |g| {
                let text = match g.state().value(Handle::from_abi(h))? {
                    HostValue::String(s) => Some(s.clone()),
                    _ => None,
                };
                g.return_opt_string(out as u32, text.as_deref())
            })
        })?
        .func_raw("number_new", |caller: Caller<'_, BridgeState>, n: f64| {
            infallible(caller, "number_new", |g| {
                Ok(g.state_mut().alloc(HostValue::Number(n)).to_abi())
            })
        })?
        .func_raw("number_get", |caller: Caller<'_, BridgeState>, h: i32| {
            fallible(caller, "number_get", |g| {
                match g.state().value(Handle::from_abi(h))? {
                    HostValue::Number(n) => Ok(*n),
                    other => Err(HostError::type_error(format!(
                        "expected a number, got {}",
                        other.kind()
                    ))
                    .into()),
                }
            })
        })?
        .func_raw("bytes_new", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "bytes_new", |g| {
                let bytes = g.read_bytes(ptr as u32, len as u32)?;
                Ok(g.state_mut().alloc(HostValue::Bytes(bytes)).to_abi())
            })
        })?
        .func_raw("bytes_get", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "bytes_get", |g| {
                let bytes = match g.state().value(Handle::from_abi(h))? {
                    HostValue::Bytes(bytes) => Some(bytes.clone()),
                    _ => None,
                };
                match bytes {
                    Some(bytes) => g.return_bytes(out as u32, &bytes).map(|()| 1),
                    None => g.write_pair(out as u32, 0, 0).map(|()| 0),
                }
            })
        })?
        .func_raw("is_undefined", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "is_undefined", |g| {
                test_value(g, h, |v| matches!(v, HostValue::Undefined))
            })
        })?
        .func_raw("is_null", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "is_null", |g| test_value(g, h, |v| matches!(v, HostValue::Null)))
        })?
        .func_raw("is_falsy", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "is_falsy", |g| test_value(g, h, HostValue::is_falsy))
        })?
        .func_raw("is_string", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "is_string", |g| {
                test_value(g, h, |v| matches!(v, HostValue::String(_)))
            })
        })?
        .func_raw("is_object", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "is_object", |g| test_value(g, h, HostValue::is_object))
        })?
        .func_raw("is_function", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "is_function", |g| {
                test_value(g, h, |v| matches!(v, HostValue::Closure(_)))
            })
        })?
        .func_raw("value_kind", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "value_kind", |g| {
                Ok(g.state().value(Handle::from_abi(h))?.kind().code())
            })
        })?
        .func_raw("debug_string", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "debug_string", |g| {
                let text = g.state().value(Handle::from_abi(h))?.debug_string();
                g.return_string(out as u32, &text)
            })
        })?
        .func_raw("throw", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            infallible(caller, "throw", |g| -> BridgeResult<()> {
                let message = codec::decode(g, ptr as u32, len as u32)
                    .unwrap_or_else(|_| "<message is not valid UTF-8>".to_string());
                Err(BridgeError::Trap(format!("module threw: {message}")))
            })
        })?
        .func_raw("error_pending", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "error_pending", |g| Ok(flag(g.state().pending.is_pending())))
        })?
        .func_raw("take_error", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "take_error", |g| Ok(g.state_mut().pending.take()?.to_abi()))
        })?
        .func_raw("error_message", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "error_message", |g| {
                let err = error_of(g, h)?;
                g.return_string(out as u32, &err.message)
            })
        })?
        .func_raw("error_name", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "error_name", |g| {
                let err = error_of(g, h)?;
                g.return_string(out as u32, &err.name)
            })
        })?
        .func_raw(
            "closure_new",
            |caller: Caller<'_, BridgeState>, code: i32, env: i32, destructor: i32, invoke: i32| {
                infallible(caller, "closure_new", |g| {
                    let state = g.state_mut();
                    let id = state
                        .closures
                        .wrap(code as u32, env as u32, destructor as u32, invoke as u32);
                    tracing::debug!(closure = %id, code, env, "closure wrapped");
                    Ok(state.alloc(HostValue::Closure(id)).to_abi())
                })
            },
        )?
        .func_raw("closure_drop", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "closure_drop", |g| {
                let handle = Handle::from_abi(h);
                let id = g.state().value(handle)?.expect_closure()?;
                g.state_mut().drop_handle(handle)?;
                Ok(flag(closure::release(g, id)?))
            })
        })?
        .func_raw("object_new", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "object_new", |g| {
                let state = g.state_mut();
                let id = state.objects.insert(BTreeMap::new());
                Ok(state.alloc(HostValue::Object(id)).to_abi())
            })
        })?
        .func_raw(
            "object_set",
            |caller: Caller<'_, BridgeState>, obj: i32, key_ptr: i32, key_len: i32, v: i32| {
                fallible(caller, "object_set", |g| {
                    let key = codec::decode_cached(g, key_ptr as u32, key_len as u32)?;
                    let state = g.state_mut();
                    let id = state.value(Handle::from_abi(obj))?.expect_object()?;
                    let value = state.value(Handle::from_abi(v))?.clone();
                    state.object_set(id, &key, value)
                })
            },
        )?
        .func_raw(
            "object_get",
            |caller: Caller<'_, BridgeState>, obj: i32, key_ptr: i32, key_len: i32| {
                fallible(caller, "object_get", |g| {
                    let key = codec::decode_cached(g, key_ptr as u32, key_len as u32)?;
                    let state = g.state_mut();
                    let id = state.value(Handle::from_abi(obj))?.expect_object()?;
                    let value = state
                        .objects
                        .get(id)
                        .ok_or_else(|| BridgeError::protocol(format!("unknown object {id}")))?
                        .get(&key)
                        .cloned();
                    Ok(match value {
                        Some(value) => state.alloc(value),
                        None => state.constant(Constant::Undefined),
                    }
                    .to_abi())
                })
            },
        )?
        .func_raw("window", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "window", |g| Ok(g.state_mut().alloc(HostValue::Window).to_abi()))
        })?
        .func_raw("now", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "now", |g| Ok(g.state().timers.now_ms()))
        })?;
    Ok(())
}
