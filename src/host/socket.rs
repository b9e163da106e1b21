//! Realtime socket imports, plus accessors for socket event records.

use super::{fallible, flag, infallible};
use crate::codec;
use crate::error::{BridgeResult, HostError};
use crate::event::EventDetail;
use crate::guest::HostGuest;
use crate::heap::Handle;
use crate::memory::GuestMemory;
use crate::runtime::host::{InterfaceBuilder, LinkerError};
use crate::socket::Payload;
use crate::state::BridgeState;
use crate::value::{HostValue, SocketId};
use hostbind_abi::{Constant, SocketEventKind};
use wasmtime::Caller;

fn socket(g: &HostGuest<'_>, h: i32) -> BridgeResult<SocketId> {
    g.state().value(Handle::from_abi(h))?.expect_socket()
}

fn detail(g: &HostGuest<'_>, ev: i32) -> BridgeResult<EventDetail> {
    Ok(g.state().event(Handle::from_abi(ev))?.detail.clone())
}

pub(super) fn register(iface: &mut InterfaceBuilder<'_, '_, BridgeState>) -> Result<(), LinkerError> {
    iface
        .func_raw("socket_open", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "socket_open", |g| {
                let url = codec::decode_cached(g, ptr as u32, len as u32)?;
                let state = g.state_mut();
                let id = state.sockets.open(&url)?;
                Ok(state.alloc(HostValue::Socket(id)).to_abi())
            })
        })?
        .func_raw("socket_on", |caller: Caller<'_, BridgeState>, h: i32, kind: i32, closure: i32| {
            fallible(caller, "socket_on", |g| {
                let id = socket(g, h)?;
                let kind = SocketEventKind::from_code(kind)
                    .ok_or_else(|| HostError::type_error(format!("unknown socket event kind {kind}")))?;
                let state = g.state_mut();
                let closure = state.value(Handle::from_abi(closure))?.expect_closure()?;
                if let Some(previous) = state.sockets.on(id, kind, closure)? {
                    tracing::debug!(socket = %id, ?kind, %previous, "socket handler replaced");
                }
                Ok(())
            })
        })?
        .func_raw("socket_send_text", |caller: Caller<'_, BridgeState>, h: i32, ptr: i32, len: i32| {
            fallible(caller, "socket_send_text", |g| {
                let id = socket(g, h)?;
                let text = codec::decode(g, ptr as u32, len as u32)?;
                g.state_mut().sockets.send(id, Payload::Text(text))
            })
        })?
        .func_raw("socket_send_bytes", |caller: Caller<'_, BridgeState>, h: i32, ptr: i32, len: i32| {
            fallible(caller, "socket_send_bytes", |g| {
                let id = socket(g, h)?;
                let bytes = g.read_bytes(ptr as u32, len as u32)?;
                g.state_mut().sockets.send(id, Payload::Binary(bytes))
            })
        })?
        .func_raw(
            "socket_close",
            |caller: Caller<'_, BridgeState>, h: i32, code: i32, r_ptr: i32, r_len: i32| {
                fallible(caller, "socket_close", |g| {
                    let id = socket(g, h)?;
                    // Codes outside u16 map to 0, which close rejects.
                    let code = (code != 0).then(|| u16::try_from(code).unwrap_or(0));
                    let reason = if r_ptr == 0 && r_len == 0 {
                        String::new()
                    } else {
                        codec::decode_cached(g, r_ptr as u32, r_len as u32)?
                    };
                    g.state_mut().sockets.close(id, code, &reason)
                })
            },
        )?
        .func_raw("socket_ready_state", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "socket_ready_state", |g| {
                let id = socket(g, h)?;
                Ok(g.state().sockets.ready_state(id)? as i32)
            })
        })?
        .func_raw("event_data", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "event_data", |g| {
                let data = match detail(g, ev)? {
                    EventDetail::Message(Payload::Text(text)) => Some(HostValue::String(text)),
                    EventDetail::Message(Payload::Binary(bytes)) => Some(HostValue::Bytes(bytes)),
                    _ => None,
                };
                let state = g.state_mut();
                Ok(match data {
                    Some(value) => state.alloc(value),
                    None => state.constant(Constant::Undefined),
                }
                .to_abi())
            })
        })?
        .func_raw("close_code", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "close_code", |g| {
                Ok(match detail(g, ev)? {
                    EventDetail::Close { code, .. } => i32::from(code),
                    _ => 0,
                })
            })
        })?
        .func_raw("close_reason", |caller: Caller<'_, BridgeState>, out: i32, ev: i32| {
            fallible(caller, "close_reason", |g| {
                let reason = match detail(g, ev)? {
                    EventDetail::Close { reason, .. } => reason,
                    _ => String::new(),
                };
                g.return_string(out as u32, &reason)
            })
        })?
        .func_raw("close_was_clean", |caller: Caller<'_, BridgeState>, ev: i32| {
            infallible(caller, "close_was_clean", |g| {
                Ok(flag(matches!(
                    detail(g, ev)?,
                    EventDetail::Close { was_clean: true, .. }
                )))
            })
        })?;
    Ok(())
}
