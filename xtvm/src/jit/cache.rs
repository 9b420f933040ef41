use std::collections::BTreeMap;

use tracing::debug;

use crate::error::VmResult;
use crate::memory::AddressSpace;

use super::CompiledCode;

/// Installed native code, keyed by function index.
///
/// Every entry is mirrored into the instance's entry table in data RAM so
/// generated code can find a compiled callee without leaving native code.
#[derive(Debug)]
pub struct CodeCache {
    entries: BTreeMap<u32, CompiledCode>,
    entry_table: u32,
}

impl CodeCache {
    pub fn new(entry_table: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            entry_table,
        }
    }

    /// Installs `code` for `func`. An existing entry wins: the new code is
    /// released and `false` is returned. On error the code is released too.
    pub fn insert(
        &mut self,
        mem: &mut AddressSpace,
        func: u32,
        code: CompiledCode,
    ) -> VmResult<bool> {
        if self.entries.contains_key(&func) {
            mem.free_exec(code.entry);
            debug!(function = func, "duplicate compilation discarded");
            return Ok(false);
        }
        if let Err(err) = mem.write_u32(self.entry_table + 4 * func, code.entry) {
            mem.free_exec(code.entry);
            return Err(err);
        }
        self.entries.insert(func, code);
        Ok(true)
    }

    pub fn lookup(&self, func: u32) -> Option<&CompiledCode> {
        self.entries.get(&func)
    }

    pub fn remove(&mut self, mem: &mut AddressSpace, func: u32) -> VmResult<Option<CompiledCode>> {
        let Some(code) = self.entries.remove(&func) else {
            return Ok(None);
        };
        mem.write_u32(self.entry_table + 4 * func, 0)?;
        mem.free_exec(code.entry);
        Ok(Some(code))
    }

    /// Releases every entry. Called at instance teardown.
    pub fn free_all(&mut self, mem: &mut AddressSpace) {
        for (func, code) in std::mem::take(&mut self.entries) {
            if mem.write_u32(self.entry_table + 4 * func, 0).is_err() {
                debug!(function = func, "entry table slot not writable");
            }
            mem.free_exec(code.entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DRAM_BASE;

    fn code(mem: &mut AddressSpace, size: u32) -> CompiledCode {
        let entry = mem.alloc_exec(size).expect("exec memory");
        CompiledCode {
            entry,
            size,
            literal_ranges: Vec::new(),
            pool_flushes: 0,
            fixups: 0,
            traps: 0,
        }
    }

    #[test]
    fn insert_is_a_no_op_for_an_existing_entry() {
        let mut mem = AddressSpace::new(1024, 256);
        let mut cache = CodeCache::new(DRAM_BASE);
        let first = code(&mut mem, 64);
        let first_entry = first.entry;
        assert_eq!(cache.insert(&mut mem, 2, first), Ok(true));
        let free_before = mem.exec_available();
        let second = code(&mut mem, 64);
        assert_eq!(cache.insert(&mut mem, 2, second), Ok(false));
        assert_eq!(mem.exec_available(), free_before);
        assert_eq!(cache.lookup(2).map(|code| code.entry), Some(first_entry));
        assert_eq!(mem.read_u32(DRAM_BASE + 8), Ok(first_entry));
    }

    #[test]
    fn remove_and_free_all_release_memory() {
        let mut mem = AddressSpace::new(1024, 256);
        let total = mem.exec_available();
        let mut cache = CodeCache::new(DRAM_BASE);
        let a = code(&mut mem, 64);
        let b = code(&mut mem, 128);
        cache.insert(&mut mem, 0, a).expect("insert");
        cache.insert(&mut mem, 1, b).expect("insert");
        assert!(cache.remove(&mut mem, 0).expect("remove").is_some());
        assert_eq!(mem.read_u32(DRAM_BASE), Ok(0));
        assert!(cache.lookup(0).is_none());
        cache.free_all(&mut mem);
        assert!(cache.is_empty());
        assert_eq!(mem.exec_available(), total);
        assert_eq!(mem.read_u32(DRAM_BASE + 4), Ok(0));
    }
}
