//! Fetch imports.

use super::{fallible, infallible};
use crate::codec;
use crate::error::{BridgeError, BridgeResult};
use crate::guest::HostGuest;
use crate::heap::Handle;
use crate::runtime::host::{InterfaceBuilder, LinkerError};
use crate::state::BridgeState;
use crate::value::{HostValue, ResponseId};
use wasmtime::Caller;

fn response(g: &HostGuest<'_>, h: i32) -> BridgeResult<ResponseId> {
    g.state().value(Handle::from_abi(h))?.expect_response()
}

/// Request bodies may be given as bytes or as a string.
fn body(g: &HostGuest<'_>, h: i32) -> BridgeResult<Option<Vec<u8>>> {
    if h == hostbind_abi::NONE {
        return Ok(None);
    }
    match g.state().value(Handle::from_abi(h))? {
        HostValue::Bytes(bytes) => Ok(Some(bytes.clone())),
        HostValue::String(text) => Ok(Some(text.clone().into_bytes())),
        other => Err(BridgeError::protocol(format!(
            "expected request body, found {}",
            other.kind()
        ))),
    }
}

pub(super) fn register(iface: &mut InterfaceBuilder<'_, '_, BridgeState>) -> Result<(), LinkerError> {
    iface
        .func_raw("headers_new", |caller: Caller<'_, BridgeState>| {
            infallible(caller, "headers_new", |g| {
                let state = g.state_mut();
                let id = state.network.headers_new();
                Ok(state.alloc(HostValue::Headers(id)).to_abi())
            })
        })?
        .func_raw(
            "headers_append",
            |caller: Caller<'_, BridgeState>, h: i32, n_ptr: i32, n_len: i32, v_ptr: i32, v_len: i32| {
                fallible(caller, "headers_append", |g| {
                    let id = g.state().value(Handle::from_abi(h))?.expect_headers()?;
                    let name = codec::decode_cached(g, n_ptr as u32, n_len as u32)?;
                    let value = codec::decode_cached(g, v_ptr as u32, v_len as u32)?;
                    g.state_mut().network.headers_append(id, &name, &value)
                })
            },
        )?
        .func_raw(
            "headers_get",
            |caller: Caller<'_, BridgeState>, out: i32, h: i32, ptr: i32, len: i32| {
                fallible(caller, "headers_get", |g| {
                    let id = g.state().value(Handle::from_abi(h))?.expect_headers()?;
                    let name = codec::decode_cached(g, ptr as u32, len as u32)?;
                    let value = g.state().network.headers(id)?.get(&name);
                    g.return_opt_string(out as u32, value.as_deref())
                })
            },
        )?
        .func_raw(
            "request_new",
            |caller: Caller<'_, BridgeState>,
             url_ptr: i32,
             url_len: i32,
             m_ptr: i32,
             m_len: i32,
             headers: i32,
             body_handle: i32| {
                fallible(caller, "request_new", |g| {
                    let url = codec::decode_cached(g, url_ptr as u32, url_len as u32)?;
                    let method = if m_ptr == 0 && m_len == 0 {
                        String::new()
                    } else {
                        codec::decode_cached(g, m_ptr as u32, m_len as u32)?
                    };
                    let headers = match headers {
                        hostbind_abi::NONE => None,
                        h => Some(g.state().value(Handle::from_abi(h))?.expect_headers()?),
                    };
                    let body = body(g, body_handle)?;
                    let state = g.state_mut();
                    let id = state.network.request_new(&url, &method, headers, body)?;
                    Ok(state.alloc(HostValue::Request(id)).to_abi())
                })
            },
        )?
        .func_raw("fetch", |caller: Caller<'_, BridgeState>, request: i32, on_settle: i32| {
            fallible(caller, "fetch", |g| {
                let state = g.state_mut();
                let request = state.value(Handle::from_abi(request))?.expect_request()?;
                let closure = state.value(Handle::from_abi(on_settle))?.expect_closure()?;
                let id = state.network.fetch(request, closure)?;
                Ok(state.alloc(HostValue::Fetch(id)).to_abi())
            })
        })?
        .func_raw("fetch_abort", |caller: Caller<'_, BridgeState>, h: i32| {
            fallible(caller, "fetch_abort", |g| {
                let state = g.state_mut();
                let id = state.value(Handle::from_abi(h))?.expect_fetch()?;
                state.network.abort(id)
            })
        })?
        .func_raw("response_status", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "response_status", |g| {
                let id = response(g, h)?;
                Ok(i32::from(g.state().network.response(id)?.status))
            })
        })?
        .func_raw("response_url", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "response_url", |g| {
                let id = response(g, h)?;
                let url = g.state().network.response(id)?.url.clone();
                g.return_string(out as u32, &url)
            })
        })?
        .func_raw("response_headers", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "response_headers", |g| {
                let id = response(g, h)?;
                let headers = g.state().network.response(id)?.headers;
                Ok(g.state_mut().alloc(HostValue::Headers(headers)).to_abi())
            })
        })?
        .func_raw("response_text", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "response_text", |g| {
                let id = response(g, h)?;
                let text = g.state().network.response_text(id)?;
                g.return_string(out as u32, &text)
            })
        })?
        .func_raw("response_bytes", |caller: Caller<'_, BridgeState>, out: i32, h: i32| {
            fallible(caller, "response_bytes", |g| {
                let id = response(g, h)?;
                let bytes = g.state().network.response(id)?.body.clone();
                g.return_bytes(out as u32, &bytes)
            })
        })?;
    Ok(())
}
