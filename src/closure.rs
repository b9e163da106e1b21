//! Guest closures registered as host callbacks.
//!
//! A guest closure is a pair of pointers (code and captured environment)
//! plus two indirect-table entries: one that invokes it and one that destroys
//! the environment. The host keeps a reference count per closure. The guest's
//! handle counts as one reference and every in-flight invocation counts as
//! another, so a closure released from inside its own callback is destroyed
//! only after that callback returns, and exactly once.

use crate::error::{BridgeError, BridgeResult};
use crate::heap::Handle;
use crate::value::{Arena, ClosureId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    /// Destroyed; the record is gone and the closure can never run again.
    Inert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureState {
    pub code_ptr: u32,
    /// Zero while an invocation holds the environment.
    pub env_ptr: u32,
    pub ref_count: u32,
    pub destructor_id: u32,
    pub invoke_id: u32,
}

/// A call about to be dispatched into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub id: ClosureId,
    pub invoke_id: u32,
    pub code_ptr: u32,
    pub env_ptr: u32,
}

/// A destructor call owed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destruction {
    pub destructor_id: u32,
    pub code_ptr: u32,
    pub env_ptr: u32,
}

#[derive(Debug, Default)]
pub struct ClosureRegistry {
    closures: Arena<ClosureId, ClosureState>,
    destroyed: usize,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(&mut self, code_ptr: u32, env_ptr: u32, destructor_id: u32, invoke_id: u32) -> ClosureId {
        self.closures.insert(ClosureState {
            code_ptr,
            env_ptr,
            ref_count: 1,
            destructor_id,
            invoke_id,
        })
    }

    pub fn state(&self, id: ClosureId) -> Option<&ClosureState> {
        self.closures.get(id)
    }

    /// Whether `id` can still be invoked.
    pub fn is_live(&self, id: ClosureId) -> bool {
        self.closures.contains(id)
    }

    /// Ids are never reused, so a missing record means the closure was
    /// destroyed.
    pub fn phase(&self, id: ClosureId) -> Phase {
        if self.closures.contains(id) {
            Phase::Active
        } else {
            Phase::Inert
        }
    }

    /// Number of closures destroyed so far.
    pub fn destroyed_count(&self) -> usize {
        self.destroyed
    }

    pub fn live_count(&self) -> usize {
        self.closures.len()
    }

    fn active(&mut self, id: ClosureId, op: &str) -> BridgeResult<&mut ClosureState> {
        self.closures
            .get_mut(id)
            .ok_or_else(|| BridgeError::protocol(format!("{op} on destroyed or unknown closure {id}")))
    }

    /// Take a reference for the duration of one dispatch.
    pub fn begin(&mut self, id: ClosureId) -> BridgeResult<Invocation> {
        let state = self.active(id, "invoke")?;
        state.ref_count += 1;
        let env_ptr = std::mem::take(&mut state.env_ptr);
        Ok(Invocation {
            id,
            invoke_id: state.invoke_id,
            code_ptr: state.code_ptr,
            env_ptr,
        })
    }

    /// Drop the dispatch reference taken by [`begin`](Self::begin).
    pub fn finish(&mut self, call: &Invocation) -> BridgeResult<Option<Destruction>> {
        let state = self.active(call.id, "finish")?;
        state.ref_count -= 1;
        if state.ref_count > 0 {
            state.env_ptr = call.env_ptr;
            return Ok(None);
        }
        let destructor_id = state.destructor_id;
        Ok(Some(self.retire(call.id, destructor_id, call.code_ptr, call.env_ptr)))
    }

    /// Drop the guest's reference.
    pub fn release(&mut self, id: ClosureId) -> BridgeResult<Option<Destruction>> {
        let state = self.active(id, "release")?;
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return Ok(None);
        }
        let (destructor_id, code_ptr, env_ptr) = (state.destructor_id, state.code_ptr, state.env_ptr);
        Ok(Some(self.retire(id, destructor_id, code_ptr, env_ptr)))
    }

    fn retire(&mut self, id: ClosureId, destructor_id: u32, code_ptr: u32, env_ptr: u32) -> Destruction {
        self.closures.remove(id);
        self.destroyed += 1;
        Destruction {
            destructor_id,
            code_ptr,
            env_ptr,
        }
    }
}

/// Something that can run guest closures.
pub trait ClosureHost {
    fn closures(&mut self) -> &mut ClosureRegistry;

    /// Call the guest's invoke entry for `call` with `arg`.
    fn dispatch(&mut self, call: &Invocation, arg: Handle) -> BridgeResult<()>;

    /// Call the guest's destructor entry.
    fn destroy(&mut self, destruction: &Destruction) -> BridgeResult<()>;
}

/// Invoke closure `id` with `arg`.
///
/// The dispatch reference is dropped even when the dispatch fails, so a
/// trapping callback that was the last holder is still destroyed.
pub fn invoke<H: ClosureHost + ?Sized>(host: &mut H, id: ClosureId, arg: Handle) -> BridgeResult<()> {
    let call = host.closures().begin(id)?;
    tracing::debug!(closure = %id, %arg, env = call.env_ptr, "invoking closure");
    let outcome = host.dispatch(&call, arg);
    if let Some(destruction) = host.closures().finish(&call)? {
        tracing::debug!(closure = %id, "closure destroyed after its last invocation");
        host.destroy(&destruction)?;
    }
    outcome
}

/// Release the guest's reference to `id`; true if this destroyed it.
pub fn release<H: ClosureHost + ?Sized>(host: &mut H, id: ClosureId) -> BridgeResult<bool> {
    match host.closures().release(id)? {
        Some(destruction) => {
            tracing::debug!(closure = %id, "closure released and destroyed");
            host.destroy(&destruction)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ArenaId;
    use std::collections::VecDeque;

    enum Action {
        Release(ClosureId),
        Invoke(ClosureId),
        Fail,
    }

    #[derive(Default)]
    struct Scripted {
        registry: ClosureRegistry,
        script: VecDeque<Action>,
        seen_env: Vec<u32>,
        destroyed: Vec<Destruction>,
        released_inside: Vec<bool>,
    }

    impl ClosureHost for Scripted {
        fn closures(&mut self) -> &mut ClosureRegistry {
            &mut self.registry
        }

        fn dispatch(&mut self, call: &Invocation, _arg: Handle) -> BridgeResult<()> {
            self.seen_env.push(call.env_ptr);
            match self.script.pop_front() {
                Some(Action::Release(id)) => {
                    let destroyed = release(self, id)?;
                    self.released_inside.push(destroyed);
                    Ok(())
                }
                Some(Action::Invoke(id)) => invoke(self, id, Handle::NONE),
                Some(Action::Fail) => Err(BridgeError::Trap("unreachable".into())),
                None => Ok(()),
            }
        }

        fn destroy(&mut self, destruction: &Destruction) -> BridgeResult<()> {
            self.destroyed.push(destruction.clone());
            Ok(())
        }
    }

    #[test]
    fn release_after_invocations_destroys_once() {
        let mut host = Scripted::default();
        let id = host.registry.wrap(10, 20, 3, 4);

        invoke(&mut host, id, Handle::NONE).expect("first");
        invoke(&mut host, id, Handle::NONE).expect("second");
        assert!(host.destroyed.is_empty());
        assert_eq!(host.seen_env, vec![20, 20]);

        assert!(release(&mut host, id).expect("release"));
        assert_eq!(
            host.destroyed,
            vec![Destruction { destructor_id: 3, code_ptr: 10, env_ptr: 20 }]
        );
        assert!(!host.registry.is_live(id));
        assert_eq!(host.registry.phase(id), Phase::Inert);
        assert_eq!(host.registry.live_count(), 0);
    }

    #[test]
    fn destroyed_closures_leave_no_record_behind() {
        let mut host = Scripted::default();
        for round in 0..1_000 {
            let id = host.registry.wrap(round, round, 3, 4);
            invoke(&mut host, id, Handle::NONE).expect("invoke");
            assert!(release(&mut host, id).expect("release"));
        }
        assert_eq!(host.registry.destroyed_count(), 1_000);
        assert_eq!(host.registry.live_count(), 0);
        assert!(host.registry.state(ClosureId::from_raw(1)).is_none());
    }

    #[test]
    fn release_inside_callback_defers_destruction() {
        let mut host = Scripted::default();
        let id = host.registry.wrap(10, 20, 3, 4);
        host.script.push_back(Action::Release(id));

        invoke(&mut host, id, Handle::NONE).expect("invoke");

        assert_eq!(host.released_inside, vec![false]);
        assert_eq!(host.destroyed.len(), 1);
        assert_eq!(host.destroyed[0].env_ptr, 20);
        assert_eq!(host.registry.destroyed_count(), 1);

        let err = invoke(&mut host, id, Handle::NONE).expect_err("inert");
        assert!(matches!(err, BridgeError::ProtocolViolation(_)));
        assert!(release(&mut host, id).is_err());
    }

    #[test]
    fn nested_invocation_sees_a_zero_environment() {
        let mut host = Scripted::default();
        let id = host.registry.wrap(10, 20, 3, 4);
        host.script.push_back(Action::Invoke(id));

        invoke(&mut host, id, Handle::NONE).expect("invoke");

        assert_eq!(host.seen_env, vec![20, 0]);
        let state = host.registry.state(id).expect("state");
        assert_eq!(state.ref_count, 1);
        assert_eq!(state.env_ptr, 20);
        assert!(host.destroyed.is_empty());
    }

    #[test]
    fn failed_dispatch_still_drops_its_reference() {
        let mut host = Scripted::default();
        let id = host.registry.wrap(10, 20, 3, 4);
        host.script.push_back(Action::Fail);

        assert!(invoke(&mut host, id, Handle::NONE).is_err());
        let state = host.registry.state(id).expect("state");
        assert_eq!(state.ref_count, 1);
        assert_eq!(state.env_ptr, 20);

        assert!(release(&mut host, id).expect("release"));
        assert_eq!(host.destroyed.len(), 1);
    }
}
