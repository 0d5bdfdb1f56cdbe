//! Guest module compilation and validation.
//!
//! [`compile`] turns raw bytes (binary or text format) into a
//! [`GuestModule`] whose exports and imports have been checked against the
//! ABI contract, so that instantiation can only fail on genuine runtime
//! problems.

use serde::{Deserialize, Serialize};
use wasmtime::{Engine, ExternType, FuncType, Module, ValType};

use crate::abi::{self, AbiNames};
use crate::error::{Result, SandboxError};

/// Metadata describing a compiled guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Display name (usually the file stem).
    pub name: String,
    /// Size of the module bytes.
    pub size_bytes: usize,
    /// Version read from the `wacro_abi` custom section, if any.
    pub abi_version: Option<u32>,
    /// Function imports that will be satisfied by no-op stubs,
    /// as `module::name`.
    pub stubbed_imports: Vec<String>,
    /// Initialisation export that will be called once, if any.
    pub init_export: Option<String>,
}

/// A compiled Wasm module together with its metadata.
pub struct GuestModule {
    pub(crate) module: Module,
    pub(crate) info: ModuleInfo,
}

impl GuestModule {
    /// Metadata gathered during compilation.
    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }
}

impl std::fmt::Debug for GuestModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestModule")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Compile `bytes` and validate them against `names`.
pub fn compile(engine: &Engine, name: &str, bytes: &[u8], names: &AbiNames) -> Result<GuestModule> {
    let abi_version = abi::abi_version(bytes)?;
    abi::check_abi_version(bytes)?;

    let module =
        Module::new(engine, bytes).map_err(|e| SandboxError::Compilation(format!("{e:#}")))?;

    expect_func(&module, &names.allocate, 1, 1)?;
    expect_func(&module, &names.release, 1, 0)?;
    expect_func(&module, &names.process, 2, 1)?;
    match module.get_export(&names.memory) {
        Some(ExternType::Memory(_)) => {}
        Some(_) => {
            return Err(SandboxError::ExportSignature {
                name: names.memory.clone(),
                reason: "not a linear memory".into(),
            });
        }
        None => {
            return Err(SandboxError::MissingExport {
                name: names.memory.clone(),
            });
        }
    }

    let mut init_export = None;
    for candidate in &names.init {
        if module.get_export(candidate).is_some() {
            expect_func(&module, candidate, 0, 0)?;
            init_export = Some(candidate.clone());
            break;
        }
    }

    let mut stubbed_imports = Vec::new();
    for import in module.imports() {
        match import.ty() {
            ExternType::Func(_) => {
                stubbed_imports.push(format!("{}::{}", import.module(), import.name()));
            }
            _ => {
                return Err(SandboxError::UnsupportedImport {
                    module: import.module().to_owned(),
                    name: import.name().to_owned(),
                });
            }
        }
    }

    let info = ModuleInfo {
        name: name.to_owned(),
        size_bytes: bytes.len(),
        abi_version,
        stubbed_imports,
        init_export,
    };
    tracing::info!(
        module = name,
        size = info.size_bytes,
        imports = info.stubbed_imports.len(),
        init = info.init_export.as_deref().unwrap_or("-"),
        "compiled wasm module"
    );
    Ok(GuestModule { module, info })
}

/// Validate a module without keeping it around.
pub fn inspect(name: &str, bytes: &[u8], names: &AbiNames) -> Result<ModuleInfo> {
    let engine = Engine::default();
    compile(&engine, name, bytes, names).map(|m| m.info)
}

fn expect_func(module: &Module, name: &str, params: usize, results: usize) -> Result<()> {
    let ty = match module.get_export(name) {
        Some(ExternType::Func(ty)) => ty,
        Some(_) => {
            return Err(SandboxError::ExportSignature {
                name: name.to_owned(),
                reason: "not a function".into(),
            });
        }
        None => {
            return Err(SandboxError::MissingExport {
                name: name.to_owned(),
            });
        }
    };
    if all_i32(&ty, params, results) {
        Ok(())
    } else {
        Err(SandboxError::ExportSignature {
            name: name.to_owned(),
            reason: format!(
                "expected {params} i32 param(s) and {results} i32 result(s), found {}",
                describe(&ty)
            ),
        })
    }
}

fn all_i32(ty: &FuncType, params: usize, results: usize) -> bool {
    ty.params().len() == params
        && ty.results().len() == results
        && ty.params().chain(ty.results()).all(|v| matches!(v, ValType::I32))
}

fn describe(ty: &FuncType) -> String {
    format!(
        "({}) -> ({})",
        type_list(ty.params()),
        type_list(ty.results())
    )
}

fn type_list(types: impl Iterator<Item = ValType>) -> String {
    types
        .map(|v| match v {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            _ => "ref",
        })
        .collect::<Vec<_>>()
        .join(", ")
}
