//! Timer imports.

use super::{fallible, infallible};
use crate::heap::Handle;
use crate::runtime::host::{InterfaceBuilder, LinkerError};
use crate::state::BridgeState;
use crate::value::HostValue;
use wasmtime::Caller;

pub(super) fn register(iface: &mut InterfaceBuilder<'_, '_, BridgeState>) -> Result<(), LinkerError> {
    iface
        .func_raw("set_timeout", |caller: Caller<'_, BridgeState>, closure: i32, ms: i32| {
            fallible(caller, "set_timeout", |g| {
                let state = g.state_mut();
                let closure = state.value(Handle::from_abi(closure))?.expect_closure()?;
                let id = state.timers.schedule(closure, f64::from(ms));
                Ok(state.alloc(HostValue::Timer(id)).to_abi())
            })
        })?
        .func_raw("clear_timeout", |caller: Caller<'_, BridgeState>, h: i32| {
            infallible(caller, "clear_timeout", |g| {
                let state = g.state_mut();
                let handle = Handle::from_abi(h);
                let id = state.value(handle)?.expect_timer()?;
                state.drop_handle(handle)?;
                if !state.timers.cancel(id) {
                    tracing::trace!(timer = %id, "timer already fired");
                }
                Ok(())
            })
        })?;
    Ok(())
}
