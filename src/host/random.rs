use super::fallible;
use crate::memory::GuestMemory;
use crate::random::RandomSource;
use crate::runtime::host::{InterfaceBuilder, LinkerError};
use crate::state::BridgeState;
use wasmtime::Caller;

pub(super) fn register(iface: &mut InterfaceBuilder<'_, '_, BridgeState>) -> Result<(), LinkerError> {
    iface.func_raw("random_fill", |caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
        fallible(caller, "random_fill", |g| {
            let len = len as u32 as usize;
            RandomSource::check_quota(len)?;
            let mut buf = vec![0u8; len];
            g.state().random.fill(&mut buf)?;
            g.write_bytes(ptr as u32, &buf)
        })
    })?;
    Ok(())
}
