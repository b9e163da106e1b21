//! Host functions the guest imports.
//!
//! Every import enters through [`fallible`] or [`infallible`]:
//!
//! - a poisoned bridge refuses the call by trapping;
//! - fallible imports must not be entered while an earlier error is still
//!   pending, and turn recoverable failures into a pending error plus the
//!   failure sentinel;
//! - fatal failures (and any failure of an infallible import) poison the
//!   bridge and trap.

mod diag;
mod dom;
mod net;
mod random;
mod socket;
mod timers;
mod values;

use crate::error::{BridgeError, BridgeResult};
use crate::error_bridge::{capture, FailureSentinel};
use crate::guest::{Guest, HostGuest};
use crate::runtime::host::{HostFunctionProvider, HostLinkerBuilder, LinkerError};
use crate::state::BridgeState;
use wasmtime::Caller;

/// Registers every capability group under one import module.
#[derive(Debug, Clone)]
pub struct HostCallSurface {
    module: String,
}

impl HostCallSurface {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }
}

impl Default for HostCallSurface {
    fn default() -> Self {
        Self::new(hostbind_abi::IMPORT_MODULE)
    }
}

impl HostFunctionProvider<BridgeState> for HostCallSurface {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, BridgeState>) -> Result<(), LinkerError> {
        let mut iface = builder.interface(&self.module)?;
        values::register(&mut iface)?;
        dom::register(&mut iface)?;
        net::register(&mut iface)?;
        socket::register(&mut iface)?;
        timers::register(&mut iface)?;
        random::register(&mut iface)?;
        diag::register(&mut iface)?;
        Ok(())
    }
}

/// Poison the bridge and turn `err` into a trap.
fn fail(state: &mut BridgeState, op: &str, err: BridgeError) -> anyhow::Error {
    state.poison(op, &err);
    anyhow::Error::new(err).context(format!("host call `{op}` failed"))
}

fn enter<'c>(
    mut caller: Caller<'c, BridgeState>,
    op: &str,
    fallible: bool,
) -> anyhow::Result<HostGuest<'c>> {
    tracing::trace!(op, "host call");
    if let Some(err) = caller.data().poisoned() {
        anyhow::bail!("host call `{op}` refused: bridge poisoned by {err}");
    }
    if fallible {
        if let Err(err) = caller.data().pending.ensure_clear(op) {
            return Err(fail(caller.data_mut(), op, err));
        }
    }
    let Some(exports) = caller.data().exports.clone() else {
        let err = BridgeError::protocol("host call before module exports were resolved");
        return Err(fail(caller.data_mut(), op, err));
    };
    Ok(Guest::new(caller, exports))
}

/// Run an import whose recoverable failures are reported through the
/// pending-error slot.
pub(crate) fn fallible<'c, R, F>(
    caller: Caller<'c, BridgeState>,
    op: &'static str,
    body: F,
) -> anyhow::Result<R>
where
    R: FailureSentinel,
    F: FnOnce(&mut HostGuest<'c>) -> BridgeResult<R>,
{
    let mut guest = enter(caller, op, true)?;
    let result = body(&mut guest);
    let state = guest.state_mut();
    capture(&mut state.table, &mut state.pending, op, result).map_err(|err| fail(state, op, err))
}

/// Run an import that cannot fail without a protocol breach.
pub(crate) fn infallible<'c, R, F>(
    caller: Caller<'c, BridgeState>,
    op: &'static str,
    body: F,
) -> anyhow::Result<R>
where
    F: FnOnce(&mut HostGuest<'c>) -> BridgeResult<R>,
{
    let mut guest = enter(caller, op, false)?;
    body(&mut guest).map_err(|err| fail(guest.state_mut(), op, err))
}

/// Boolean results cross the boundary as 0 or 1.
pub(crate) fn flag(value: bool) -> i32 {
    i32::from(value)
}

/// Non-negative counts and lengths as ABI integers.
pub(crate) fn count(value: usize) -> BridgeResult<i32> {
    i32::try_from(value).map_err(|_| BridgeError::AllocationFailure(format!("{value} does not fit in i32")))
}
