//! PDFium WebAssembly build run by wasmtime
//!
//! The module must export `memory`, `malloc`, `free` and the `FPDF*`
//! functions. Imports are not provided: anything the build imports traps
//! when called, so only self-contained builds work.

use std::path::Path;

use tracing::{debug, info};
use wasmtime::{Engine, Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Val, ValType};

use super::{ModuleError, NativeModule, Value};
use crate::error::Result;

pub struct WasmModule {
    store: Store<StoreLimits>,
    instance: Instance,
    memory: Memory,
}

impl WasmModule {
    /// Compile and instantiate the module at `path`, capping linear memory
    /// at `memory_limit` bytes
    pub fn from_file(path: &Path, memory_limit: u64) -> Result<Self> {
        let engine = Engine::default();
        let module = Module::from_file(&engine, path).map_err(load_error)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(usize::try_from(memory_limit).unwrap_or(usize::MAX))
            .build();
        let mut store = Store::new(&engine, limits);
        store.limiter(|limits| limits);

        let mut linker: Linker<StoreLimits> = Linker::new(&engine);
        linker.define_unknown_imports_as_traps(&module).map_err(load_error)?;
        let instance = linker.instantiate(&mut store, &module).map_err(load_error)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| ModuleError::Load("module does not export `memory`".into()))?;

        // reactor-style builds run their constructors here
        if let Some(initialize) = instance.get_func(&mut store, "_initialize") {
            initialize
                .call(&mut store, &[], &mut [])
                .map_err(|e| ModuleError::trap("_initialize", e.to_string()))?;
        }

        info!(path = %path.display(), memory = memory.data_size(&store), "wasm module loaded");
        Ok(Self { store, instance, memory })
    }
}

fn load_error(err: impl std::fmt::Display) -> ModuleError {
    ModuleError::Load(err.to_string())
}

fn to_val(value: &Value) -> Val {
    match *value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
    }
}

fn from_val(function: &str, value: &Val) -> std::result::Result<Value, ModuleError> {
    match value {
        Val::I32(v) => Ok(Value::I32(*v)),
        Val::I64(v) => Ok(Value::I64(*v)),
        Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
        other => Err(ModuleError::bad_arguments(
            function,
            format!("unsupported return value {other:?}"),
        )),
    }
}

fn placeholder(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        _ => Val::I32(0),
    }
}

impl NativeModule for WasmModule {
    fn name(&self) -> &str {
        "wasm"
    }

    fn call(&mut self, function: &str, args: &[Value]) -> std::result::Result<Vec<Value>, ModuleError> {
        let func = self
            .instance
            .get_func(&mut self.store, function)
            .ok_or_else(|| ModuleError::MissingExport(function.to_string()))?;

        let ty = func.ty(&self.store);
        if ty.params().len() != args.len() {
            return Err(ModuleError::bad_arguments(
                function,
                format!("expected {} arguments, got {}", ty.params().len(), args.len()),
            ));
        }

        let params: Vec<Val> = args.iter().map(to_val).collect();
        let mut results: Vec<Val> = ty.results().map(|ty| placeholder(&ty)).collect();

        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| ModuleError::trap(function, e.to_string()))?;
        debug!(function, "wasm call");

        results.iter().map(|value| from_val(function, value)).collect()
    }

    fn read_memory(&self, offset: u64, len: u64) -> std::result::Result<Vec<u8>, ModuleError> {
        let data = self.memory.data(&self.store);
        let size = data.len() as u64;
        let end = offset.checked_add(len).filter(|end| *end <= size);
        match end {
            Some(end) => Ok(data[offset as usize..end as usize].to_vec()),
            None => Err(ModuleError::OutOfBounds { offset, len, size }),
        }
    }

    fn write_memory(&mut self, offset: u64, bytes: &[u8]) -> std::result::Result<(), ModuleError> {
        let size = self.memory.data_size(&self.store) as u64;
        let out_of_bounds = ModuleError::OutOfBounds {
            offset,
            len: bytes.len() as u64,
            size,
        };
        let offset = usize::try_from(offset).map_err(|_| load_error("offset overflow"))?;
        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|_| out_of_bounds)
    }

    fn memory_size(&self) -> u64 {
        self.memory.data_size(&self.store) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion_keeps_bits() {
        let values = [Value::I32(-7), Value::I64(1 << 40), Value::F32(0.25), Value::F64(-2.5)];
        for value in values {
            assert_eq!(from_val("f", &to_val(&value)).unwrap(), value);
        }
    }

    #[test]
    fn test_vector_results_are_rejected() {
        let err = from_val("FPDF_GetPageCount", &Val::V128(7u128.into())).unwrap_err();
        assert!(err.to_string().contains("FPDF_GetPageCount"), "{err}");
        assert!(err.to_string().contains("unsupported return value"), "{err}");
    }

    #[test]
    fn test_missing_file_is_a_load_error() {
        let err = WasmModule::from_file(Path::new("/nonexistent/pdfium.wasm"), 1 << 20).unwrap_err();
        assert!(err.to_string().contains("could not load module"));
    }
}
