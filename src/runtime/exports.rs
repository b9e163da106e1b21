//! Export resolution - check a guest instance provides the bridge's exports

use crate::config::ExportNames;
use crate::guest::GuestExports;
use thiserror::Error;
use wasmtime::{AsContextMut, Extern, FuncType, Instance, TypedFunc, ValType, WasmParams, WasmResults};

/// Errors from export resolution
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Missing function '{name}' required by the bridge")]
    MissingFunction { name: String },

    #[error("Function '{name}' has wrong signature: expected {expected}, got {actual}")]
    SignatureMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Missing memory export '{0}'")]
    MissingMemory(String),

    #[error("Export '{0}' is not a function table")]
    NotATable(String),
}

/// The WASM signatures the bridge calls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedSignature {
    /// (size, align) -> ptr
    Malloc,
    /// (ptr, old, new, align) -> ptr
    Realloc,
    /// (ptr, len, align) -> ()
    Free,
    /// () -> ()
    Start,
    /// Closure entry: (code, env, arg) -> ()
    Invoke,
    /// Closure destructor: (code, env) -> ()
    Destroy,
}

impl ExpectedSignature {
    pub fn description(&self) -> &'static str {
        match self {
            ExpectedSignature::Malloc => "(i32, i32) -> i32",
            ExpectedSignature::Realloc => "(i32, i32, i32, i32) -> i32",
            ExpectedSignature::Free => "(i32, i32, i32) -> ()",
            ExpectedSignature::Start => "() -> ()",
            ExpectedSignature::Invoke => "(i32, i32, i32) -> ()",
            ExpectedSignature::Destroy => "(i32, i32) -> ()",
        }
    }
}

fn type_name(ty: &ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        ValType::Ref(_) => "ref",
    }
}

/// Parameter and result type names of `ty`.
pub fn signature(ty: &FuncType) -> (Vec<String>, Vec<String>) {
    (
        ty.params().map(|t| type_name(&t).to_string()).collect(),
        ty.results().map(|t| type_name(&t).to_string()).collect(),
    )
}

pub(crate) fn describe(ty: &FuncType) -> String {
    let (params, results) = signature(ty);
    let results = if results.is_empty() {
        "()".to_string()
    } else {
        results.join(", ")
    };
    format!("({}) -> {results}", params.join(", "))
}

/// Look up `name` as a function with the given signature.
///
/// Returns `Ok(None)` when the export is absent, so callers decide whether it
/// is required.
fn typed_export<P, R>(
    mut store: impl AsContextMut,
    instance: &Instance,
    name: &str,
    expected: ExpectedSignature,
) -> Result<Option<TypedFunc<P, R>>, ExportError>
where
    P: WasmParams,
    R: WasmResults,
{
    match instance.get_export(&mut store, name) {
        None => Ok(None),
        Some(Extern::Func(func)) => match func.typed::<P, R>(&store) {
            Ok(typed) => Ok(Some(typed)),
            Err(_) => Err(ExportError::SignatureMismatch {
                name: name.to_string(),
                expected: expected.description().to_string(),
                actual: describe(&func.ty(&store)),
            }),
        },
        Some(_) => Err(ExportError::SignatureMismatch {
            name: name.to_string(),
            expected: expected.description().to_string(),
            actual: "not a function".to_string(),
        }),
    }
}

fn required<T>(found: Option<T>, name: &str) -> Result<T, ExportError> {
    found.ok_or_else(|| ExportError::MissingFunction {
        name: name.to_string(),
    })
}

/// Resolve memory, allocator and table exports.
///
/// `memory` and `malloc` are required; `realloc`, `free` and the function
/// table are optional but must have the right shape when present.
pub fn resolve_exports(
    mut store: impl AsContextMut,
    instance: &Instance,
    names: &ExportNames,
) -> Result<GuestExports, ExportError> {
    let memory = instance
        .get_memory(&mut store, &names.memory)
        .ok_or_else(|| ExportError::MissingMemory(names.memory.clone()))?;
    let malloc = required(
        typed_export(&mut store, instance, &names.malloc, ExpectedSignature::Malloc)?,
        &names.malloc,
    )?;
    let realloc = typed_export(&mut store, instance, &names.realloc, ExpectedSignature::Realloc)?;
    let free = typed_export(&mut store, instance, &names.free, ExpectedSignature::Free)?;
    let table = match instance.get_export(&mut store, &names.table) {
        None => None,
        Some(Extern::Table(table)) => Some(table),
        Some(_) => return Err(ExportError::NotATable(names.table.clone())),
    };

    tracing::debug!(
        realloc = realloc.is_some(),
        free = free.is_some(),
        table = table.is_some(),
        "resolved module exports"
    );
    Ok(GuestExports {
        memory,
        malloc,
        realloc,
        free,
        table,
    })
}

/// The start routine, which every guest must export.
pub fn start_func(
    store: impl AsContextMut,
    instance: &Instance,
    name: &str,
) -> Result<TypedFunc<(), ()>, ExportError> {
    required(typed_export(store, instance, name, ExpectedSignature::Start)?, name)
}
