//! Host Function Registration API
//!
//! Provides a small builder for registering host functions under named
//! import modules. Capability groups implement [`HostFunctionProvider`] and
//! register themselves through an [`InterfaceBuilder`].
//!
//! # Example
//!
//! ```ignore
//! let mut builder = HostLinkerBuilder::new(&mut linker);
//! builder
//!     .interface("hostbind")?
//!     .func_raw("now", |caller: Caller<'_, BridgeState>| -> f64 {
//!         caller.data().timers.now_ms()
//!     })?;
//! ```

use std::marker::PhantomData;
use thiserror::Error;
use wasmtime::Linker;

/// Errors from linker operations
#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("Function registration failed: {0}")]
    FunctionRegistration(String),

    #[error("Invalid import module name: {0:?}")]
    InvalidModuleName(String),
}

/// Builder for registering host functions with a Linker.
///
/// Generic over `T` which is the store data type.
pub struct HostLinkerBuilder<'a, T> {
    linker: &'a mut Linker<T>,
    _marker: PhantomData<T>,
}

impl<'a, T> HostLinkerBuilder<'a, T> {
    /// Create a new builder wrapping a wasmtime Linker
    pub fn new(linker: &'a mut Linker<T>) -> Self {
        Self {
            linker,
            _marker: PhantomData,
        }
    }

    /// Start defining functions under the import module `name`.
    pub fn interface(&mut self, name: &str) -> Result<InterfaceBuilder<'_, 'a, T>, LinkerError> {
        if name.is_empty() {
            return Err(LinkerError::InvalidModuleName(name.to_string()));
        }
        Ok(InterfaceBuilder {
            linker: self,
            module_name: name.to_string(),
        })
    }

    /// Register a provider's functions.
    pub fn register_provider<P: HostFunctionProvider<T>>(
        &mut self,
        provider: &P,
    ) -> Result<&mut Self, LinkerError> {
        provider.register(self)?;
        Ok(self)
    }
}

/// Builder for registering functions within one import module.
pub struct InterfaceBuilder<'a, 'b, T> {
    linker: &'a mut HostLinkerBuilder<'b, T>,
    module_name: String,
}

impl<'a, 'b, T: 'static> InterfaceBuilder<'a, 'b, T> {
    /// Register a host function with plain numeric parameters.
    ///
    /// Returning `anyhow::Result` from `func` lets it trap the caller.
    pub fn func_raw<Params, Results>(
        &mut self,
        name: &str,
        func: impl wasmtime::IntoFunc<T, Params, Results>,
    ) -> Result<&mut Self, LinkerError> {
        self.linker
            .linker
            .func_wrap(&self.module_name, name, func)
            .map_err(|e| LinkerError::FunctionRegistration(format!("{}::{name}: {e}", self.module_name)))?;
        Ok(self)
    }
}

/// Trait for types that provide host functions.
///
/// Implement this to create reusable sets of host functions that can
/// be registered with multiple linkers.
pub trait HostFunctionProvider<T> {
    /// Register this provider's functions with the linker builder.
    fn register(&self, builder: &mut HostLinkerBuilder<'_, T>) -> Result<(), LinkerError>;
}
