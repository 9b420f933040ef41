use std::sync::Arc;

use crate::value::{Value, ValueType};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl FuncType {
    pub fn new(params: &[ValueType], results: &[ValueType]) -> Self {
        Self {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }

    pub fn result(&self) -> ValueType {
        self.results.first().copied().unwrap_or(ValueType::Void)
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub type_index: u32,
    /// Number of 8-byte register slots in one activation.
    pub register_count: u16,
    pub code: Vec<u8>,
    /// Statically flagged as eligible for compilation.
    pub hot: bool,
}

#[derive(Clone, Debug)]
pub struct Import {
    pub name: String,
    pub type_index: u32,
    /// Takes a per-call type tag list instead of its declared parameters.
    pub variadic: bool,
    /// Bit `i` set: argument `i` is a VM function pointer that must reach the
    /// host as a native trampoline address.
    pub callback_slots: u32,
}

impl Import {
    pub fn is_callback_slot(&self, arg: usize) -> bool {
        arg < 32 && self.callback_slots & (1 << arg) != 0
    }
}

#[derive(Clone, Debug)]
pub struct Global {
    pub ty: ValueType,
    pub mutable: bool,
    pub init: Value,
}

#[derive(Clone, Debug)]
pub struct DataSegment {
    /// Offset from the start of linear memory.
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// A validated module. Immutable once built; instances share it.
#[derive(Debug, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub functions: Vec<Function>,
    pub imports: Vec<Import>,
    pub globals: Vec<Global>,
    pub data: Vec<DataSegment>,
    pub table: Vec<Option<u32>>,
    pub memory_size: u32,
}

impl Module {
    pub fn function_type(&self, func: u32) -> Option<&FuncType> {
        let function = self.functions.get(func as usize)?;
        self.types.get(function.type_index as usize)
    }

    pub fn import_type(&self, import: u32) -> Option<&FuncType> {
        let import = self.imports.get(import as usize)?;
        self.types.get(import.type_index as usize)
    }

    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.functions
            .iter()
            .position(|function| function.name == name)
            .map(|index| index as u32)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleError {
    InvalidTypeIndex { item: String, index: u32 },
    TooManyResults { type_index: u32 },
    VoidParameter { type_index: u32 },
    RegisterCountTooSmall { function: String, required: usize },
    GlobalTypeMismatch { index: u32 },
    DataOutOfBounds { segment: usize },
    TableEntryOutOfRange { slot: usize, function: u32 },
    DuplicateFunction(String),
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::InvalidTypeIndex { item, index } => {
                write!(f, "{item} references missing type {index}")
            }
            ModuleError::TooManyResults { type_index } => {
                write!(f, "type {type_index} declares more than one result")
            }
            ModuleError::VoidParameter { type_index } => {
                write!(f, "type {type_index} declares a void parameter")
            }
            ModuleError::RegisterCountTooSmall { function, required } => write!(
                f,
                "function '{function}' needs at least {required} registers"
            ),
            ModuleError::GlobalTypeMismatch { index } => {
                write!(f, "global {index} initializer does not match its type")
            }
            ModuleError::DataOutOfBounds { segment } => {
                write!(f, "data segment {segment} exceeds linear memory")
            }
            ModuleError::TableEntryOutOfRange { slot, function } => {
                write!(f, "table slot {slot} references missing function {function}")
            }
            ModuleError::DuplicateFunction(name) => write!(f, "duplicate function '{name}'"),
        }
    }
}

impl std::error::Error for ModuleError {}

/// Builds validated modules. Bytecode bodies are not validated here; bad
/// bodies surface as compile failures or interpreter errors.
#[derive(Default)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, ty: FuncType) -> u32 {
        if let Some(index) = self.module.types.iter().position(|known| *known == ty) {
            return index as u32;
        }
        self.module.types.push(ty);
        (self.module.types.len() - 1) as u32
    }

    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        ty: FuncType,
        register_count: u16,
        code: Vec<u8>,
        hot: bool,
    ) -> u32 {
        let type_index = self.add_type(ty);
        self.module.functions.push(Function {
            name: name.into(),
            type_index,
            register_count,
            code,
            hot,
        });
        (self.module.functions.len() - 1) as u32
    }

    pub fn add_import(&mut self, name: impl Into<String>, ty: FuncType) -> u32 {
        self.push_import(name.into(), ty, false, 0)
    }

    pub fn add_variadic_import(&mut self, name: impl Into<String>, ty: FuncType) -> u32 {
        self.push_import(name.into(), ty, true, 0)
    }

    pub fn add_callback_import(
        &mut self,
        name: impl Into<String>,
        ty: FuncType,
        callback_slots: u32,
    ) -> u32 {
        self.push_import(name.into(), ty, false, callback_slots)
    }

    fn push_import(&mut self, name: String, ty: FuncType, variadic: bool, callback_slots: u32) -> u32 {
        let type_index = self.add_type(ty);
        self.module.imports.push(Import {
            name,
            type_index,
            variadic,
            callback_slots,
        });
        (self.module.imports.len() - 1) as u32
    }

    pub fn add_global(&mut self, ty: ValueType, mutable: bool, init: Value) -> u32 {
        self.module.globals.push(Global { ty, mutable, init });
        (self.module.globals.len() - 1) as u32
    }

    pub fn add_data(&mut self, offset: u32, bytes: Vec<u8>) -> &mut Self {
        self.module.data.push(DataSegment { offset, bytes });
        self
    }

    pub fn set_table(&mut self, table: Vec<Option<u32>>) -> &mut Self {
        self.module.table = table;
        self
    }

    pub fn memory_size(&mut self, bytes: u32) -> &mut Self {
        self.module.memory_size = bytes;
        self
    }

    pub fn build(self) -> Result<Arc<Module>, ModuleError> {
        let module = self.module;

        for (index, ty) in module.types.iter().enumerate() {
            if ty.results.len() > 1 {
                return Err(ModuleError::TooManyResults {
                    type_index: index as u32,
                });
            }
            if ty.params.contains(&ValueType::Void) {
                return Err(ModuleError::VoidParameter {
                    type_index: index as u32,
                });
            }
        }

        for (index, function) in module.functions.iter().enumerate() {
            if module.functions[..index]
                .iter()
                .any(|other| other.name == function.name)
            {
                return Err(ModuleError::DuplicateFunction(function.name.clone()));
            }
            let ty = module.types.get(function.type_index as usize).ok_or_else(|| {
                ModuleError::InvalidTypeIndex {
                    item: format!("function '{}'", function.name),
                    index: function.type_index,
                }
            })?;
            let required = ty.params.len().max(1);
            if (function.register_count as usize) < required {
                return Err(ModuleError::RegisterCountTooSmall {
                    function: function.name.clone(),
                    required,
                });
            }
        }

        for import in &module.imports {
            if module.types.get(import.type_index as usize).is_none() {
                return Err(ModuleError::InvalidTypeIndex {
                    item: format!("import '{}'", import.name),
                    index: import.type_index,
                });
            }
        }

        for (index, global) in module.globals.iter().enumerate() {
            if global.init.ty != global.ty || global.ty == ValueType::Void {
                return Err(ModuleError::GlobalTypeMismatch {
                    index: index as u32,
                });
            }
        }

        for (index, segment) in module.data.iter().enumerate() {
            let end = segment.offset as u64 + segment.bytes.len() as u64;
            if end > module.memory_size as u64 {
                return Err(ModuleError::DataOutOfBounds { segment: index });
            }
        }

        for (slot, entry) in module.table.iter().enumerate() {
            if let Some(function) = entry
                && *function as usize >= module.functions.len()
            {
                return Err(ModuleError::TableEntryOutOfRange {
                    slot,
                    function: *function,
                });
            }
        }

        Ok(Arc::new(module))
    }
}

/// Sorted `(address, function)` pairs for reverse lookup of function
/// pointers.
#[derive(Clone, Debug, Default)]
pub struct FunctionPointerMap {
    entries: Vec<(u32, u32)>,
}

impl FunctionPointerMap {
    pub fn new(mut entries: Vec<(u32, u32)>) -> Self {
        entries.sort_unstable_by_key(|(address, _)| *address);
        entries.dedup_by_key(|(address, _)| *address);
        Self { entries }
    }

    pub fn lookup(&self, address: u32) -> Option<u32> {
        self.entries
            .binary_search_by_key(&address, |(address, _)| *address)
            .ok()
            .map(|index| self.entries[index].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
