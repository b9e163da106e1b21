//! Logging and performance imports.

use super::{fallible, infallible};
use crate::codec;
use crate::memory::GuestMemory;
use crate::runtime::host::{InterfaceBuilder, LinkerError};
use crate::state::{BridgeState, ModuleLog};
use hostbind_abi::LogLevel;
use wasmtime::Caller;

fn emit(state: &mut BridgeState, level: LogLevel, message: String) {
    match level {
        LogLevel::Error => tracing::error!(target: "hostbind::module", "{message}"),
        LogLevel::Warn => tracing::warn!(target: "hostbind::module", "{message}"),
        LogLevel::Info => tracing::info!(target: "hostbind::module", "{message}"),
        LogLevel::Debug => tracing::debug!(target: "hostbind::module", "{message}"),
        LogLevel::Trace => tracing::trace!(target: "hostbind::module", "{message}"),
    }
    state.logs.push(ModuleLog { level, message });
}

pub(super) fn register(iface: &mut InterfaceBuilder<'_, '_, BridgeState>) -> Result<(), LinkerError> {
    iface
        .func_raw("log", |caller: Caller<'_, BridgeState>, level: i32, ptr: i32, len: i32| {
            infallible(caller, "log", |g| {
                let bytes = g.read_bytes(ptr as u32, len as u32)?;
                let message = String::from_utf8_lossy(&bytes).into_owned();
                emit(g.state_mut(), LogLevel::from_code(level), message);
                Ok(())
            })
        })?
        .func_raw("console_error", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "console_error", |g| {
                let message = codec::decode_owned(g, ptr as u32, len as u32)?;
                emit(g.state_mut(), LogLevel::Error, message);
                Ok(())
            })
        })?
        .func_raw("perf_mark", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
            fallible(caller, "perf_mark", |g| {
                let name = codec::decode_cached(g, ptr as u32, len as u32)?;
                let state = g.state_mut();
                let now = state.timers.now_ms();
                state.perf.mark(&name, now);
                Ok(())
            })
        })?
        .func_raw(
            "perf_measure",
            |caller: Caller<'_, BridgeState>, n_ptr: i32, n_len: i32, s_ptr: i32, s_len: i32| {
                fallible(caller, "perf_measure", |g| {
                    let name = codec::decode_cached(g, n_ptr as u32, n_len as u32)?;
                    let start = if s_ptr == 0 && s_len == 0 {
                        None
                    } else {
                        Some(codec::decode_cached(g, s_ptr as u32, s_len as u32)?)
                    };
                    let state = g.state_mut();
                    let now = state.timers.now_ms();
                    Ok(state.perf.measure(&name, start.as_deref(), now)?)
                })
            },
        )?;
    Ok(())
}
