//! The guest module as seen from inside a boundary call.
//!
//! [`Guest`] pairs a wasmtime context (a `Caller` inside host functions, the
//! `Store` when the embedder drives the module) with the resolved exports, and
//! implements [`GuestMemory`] and [`ClosureHost`] on top of them.

use crate::closure::{ClosureHost, ClosureRegistry, Destruction, Invocation};
use crate::codec;
use crate::error::{BridgeError, BridgeResult};
use crate::heap::Handle;
use crate::memory::{GuestMemory, MemoryView};
use crate::runtime::exports::{describe, ExpectedSignature};
use crate::state::BridgeState;
use wasmtime::{AsContextMut, Caller, Memory, Ref, Store, Table, TypedFunc};

/// Exports resolved once after instantiation.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    pub malloc: TypedFunc<(i32, i32), i32>,
    pub realloc: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    pub free: Option<TypedFunc<(i32, i32, i32), ()>>,
    /// Indirect function table, required for closures.
    pub table: Option<Table>,
}

/// A wasmtime context whose store data is the bridge state.
pub trait BridgeContext: AsContextMut<Data = BridgeState> {
    fn state(&self) -> &BridgeState;
    fn state_mut(&mut self) -> &mut BridgeState;
}

impl BridgeContext for Caller<'_, BridgeState> {
    fn state(&self) -> &BridgeState {
        self.data()
    }

    fn state_mut(&mut self) -> &mut BridgeState {
        self.data_mut()
    }
}

impl BridgeContext for Store<BridgeState> {
    fn state(&self) -> &BridgeState {
        self.data()
    }

    fn state_mut(&mut self) -> &mut BridgeState {
        self.data_mut()
    }
}

impl<T: BridgeContext> BridgeContext for &mut T {
    fn state(&self) -> &BridgeState {
        (**self).state()
    }

    fn state_mut(&mut self) -> &mut BridgeState {
        (**self).state_mut()
    }
}

pub(crate) fn trap(err: wasmtime::Error) -> BridgeError {
    BridgeError::Trap(format!("{err:#}"))
}

/// Guest access for the duration of one call.
pub struct Guest<C> {
    ctx: C,
    exports: GuestExports,
}

/// The guest as seen from a host function.
pub type HostGuest<'c> = Guest<Caller<'c, BridgeState>>;

impl<C: BridgeContext> Guest<C> {
    pub fn new(ctx: C, exports: GuestExports) -> Self {
        Self { ctx, exports }
    }

    /// Wrap `ctx` using the exports recorded in its state.
    pub fn attach(ctx: C) -> BridgeResult<Self> {
        let exports = ctx
            .state()
            .exports
            .clone()
            .ok_or_else(|| BridgeError::protocol("module exports have not been resolved"))?;
        Ok(Self::new(ctx, exports))
    }

    pub fn state(&self) -> &BridgeState {
        self.ctx.state()
    }

    pub fn state_mut(&mut self) -> &mut BridgeState {
        self.ctx.state_mut()
    }

    /// Encode `text` and write its `(ptr, len)` at `out`.
    pub fn return_string(&mut self, out: u32, text: &str) -> BridgeResult<()> {
        let (ptr, len) = codec::encode(self, text)?;
        self.write_pair(out, ptr as i32, len as i32)
    }

    /// Like [`return_string`](Self::return_string), writing `(0, 0)` for
    /// `None`. Returns 1 when a string was written.
    pub fn return_opt_string(&mut self, out: u32, text: Option<&str>) -> BridgeResult<i32> {
        match text {
            Some(text) => self.return_string(out, text).map(|()| 1),
            None => self.write_pair(out, 0, 0).map(|()| 0),
        }
    }

    pub fn return_bytes(&mut self, out: u32, bytes: &[u8]) -> BridgeResult<()> {
        let (ptr, len) = codec::pass_bytes(self, bytes)?;
        self.write_pair(out, ptr as i32, len as i32)
    }

    /// Table entry `index`, which must have the `expected` signature.
    fn indirect<P, R>(&mut self, index: u32, expected: ExpectedSignature) -> BridgeResult<TypedFunc<P, R>>
    where
        P: wasmtime::WasmParams,
        R: wasmtime::WasmResults,
    {
        let table = self
            .exports
            .table
            .ok_or_else(|| BridgeError::protocol("module exports no function table"))?;
        match table.get(&mut self.ctx, index.into()) {
            Some(Ref::Func(Some(func))) => func.typed::<P, R>(&self.ctx).map_err(|_| {
                BridgeError::protocol(format!(
                    "table entry {index} should be {}, found {}",
                    expected.description(),
                    describe(&func.ty(&self.ctx))
                ))
            }),
            Some(_) => Err(BridgeError::protocol(format!("table entry {index} is empty"))),
            None => Err(BridgeError::protocol(format!(
                "table index {index} is out of bounds"
            ))),
        }
    }
}

impl<C: BridgeContext> GuestMemory for Guest<C> {
    fn memory(&mut self) -> (&mut [u8], &mut MemoryView) {
        let memory = self.exports.memory;
        let (data, state) = memory.data_and_store_mut(self.ctx.as_context_mut());
        (data, &mut state.view)
    }

    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
        let ptr = self
            .exports
            .malloc
            .call(&mut self.ctx, (size as i32, align as i32))
            .map_err(trap)?;
        if ptr == 0 && size > 0 {
            return Err(BridgeError::AllocationFailure(format!(
                "module allocator returned null for {size} bytes"
            )));
        }
        Ok(ptr as u32)
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BridgeResult<u32> {
        let realloc = self
            .exports
            .realloc
            .as_ref()
            .ok_or_else(|| BridgeError::protocol("module exports no realloc"))?;
        let new_ptr = realloc
            .call(
                &mut self.ctx,
                (ptr as i32, old_size as i32, new_size as i32, align as i32),
            )
            .map_err(trap)?;
        if new_ptr == 0 && new_size > 0 {
            return Err(BridgeError::AllocationFailure(format!(
                "module allocator could not grow {ptr} to {new_size} bytes"
            )));
        }
        Ok(new_ptr as u32)
    }

    fn free(&mut self, ptr: u32, size: u32, align: u32) -> BridgeResult<()> {
        match &self.exports.free {
            Some(free) => free
                .call(&mut self.ctx, (ptr as i32, size as i32, align as i32))
                .map_err(trap),
            None => Ok(()),
        }
    }

    fn has_realloc(&self) -> bool {
        self.exports.realloc.is_some()
    }

    fn interned(&self, handle: Handle) -> BridgeResult<String> {
        self.state().table.get(handle)?.as_str().map(str::to_owned)
    }
}

impl<C: BridgeContext> ClosureHost for Guest<C> {
    fn closures(&mut self) -> &mut ClosureRegistry {
        &mut self.state_mut().closures
    }

    fn dispatch(&mut self, call: &Invocation, arg: Handle) -> BridgeResult<()> {
        let invoke = self.indirect::<(i32, i32, i32), ()>(call.invoke_id, ExpectedSignature::Invoke)?;
        invoke
            .call(
                &mut self.ctx,
                (call.code_ptr as i32, call.env_ptr as i32, arg.to_abi()),
            )
            .map_err(trap)
    }

    fn destroy(&mut self, destruction: &Destruction) -> BridgeResult<()> {
        let destructor = self.indirect::<(i32, i32), ()>(destruction.destructor_id, ExpectedSignature::Destroy)?;
        destructor
            .call(
                &mut self.ctx,
                (destruction.code_ptr as i32, destruction.env_ptr as i32),
            )
            .map_err(trap)
    }
}
