//! Registry of loaded objects: ordered address ranges plus lazily created
//! per-file symbolization state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::symbolize::demangle::Demangler;
use crate::symbolize::dwarf::{ResolvedFrames, SymData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub file_name: String,
    pub is_exe: bool,
    pub address_start: u64,
    pub address_end: u64,
}

/// Resolution result: the owning module's file name and, when debug
/// information was available, the resolved frames.
pub struct ResolvedIp {
    pub module: String,
    pub frames: Option<ResolvedFrames>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
    dirty: bool,
    /// Symbolization state per object file, shared between address ranges
    /// of the same file. `None` caches load failures and the vdso.
    states: HashMap<String, Option<Arc<Mutex<SymData>>>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    pub fn add_module(&mut self, file_name: &str, is_exe: bool, start: u64, end: u64) {
        self.modules.push(Module {
            file_name: file_name.to_owned(),
            is_exe,
            address_start: start,
            address_end: end,
        });
        self.dirty = true;
    }

    /// Wipes the module set, e.g. when the traced program unloads libraries
    /// en masse. Symbolization states stay cached; interned instruction
    /// pointers resolved earlier are unaffected.
    pub fn clear_modules(&mut self) {
        self.modules.clear();
        self.dirty = true;
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Finds the module covering `ip`, re-sorting and diagnosing overlaps
    /// after any mutation.
    pub fn resolve_module(&mut self, ip: u64) -> Option<&Module> {
        self.ensure_sorted();
        let idx = self.modules.partition_point(|m| m.address_end < ip);
        let module = self.modules.get(idx)?;
        if module.address_start <= ip && ip <= module.address_end {
            Some(module)
        } else {
            None
        }
    }

    /// Resolves an instruction pointer to its module and symbolic frames.
    pub fn resolve_ip(&mut self, ip: u64, demangler: &Demangler) -> Option<ResolvedIp> {
        let (file_name, address_start) = {
            let module = self.resolve_module(ip)?;
            (module.file_name.clone(), module.address_start)
        };

        let frames = self
            .state_for(&file_name, address_start)
            .map(|state| state.lock().unwrap().resolve(ip, demangler));

        Some(ResolvedIp {
            module: file_name,
            frames,
        })
    }

    fn ensure_sorted(&mut self) {
        if !self.dirty {
            return;
        }
        self.modules.sort_by(|a, b| {
            (a.address_start, a.address_end, &a.file_name).cmp(&(
                b.address_start,
                b.address_end,
                &b.file_name,
            ))
        });

        for i in 0..self.modules.len() {
            let m1 = &self.modules[i];
            for m2 in &self.modules[i + 1..] {
                if (m1.address_start <= m2.address_start && m1.address_end > m2.address_start)
                    || (m1.address_start < m2.address_end && m1.address_end >= m2.address_end)
                {
                    warn!(
                        "overlapping modules: {} ({:x} to {:x}) and {} ({:x} to {:x})",
                        m1.file_name,
                        m1.address_start,
                        m1.address_end,
                        m2.file_name,
                        m2.address_start,
                        m2.address_end
                    );
                } else if m2.address_start >= m1.address_end {
                    break;
                }
            }
        }

        self.dirty = false;
    }

    fn state_for(&mut self, file_name: &str, address_start: u64) -> Option<Arc<Mutex<SymData>>> {
        if let Some(state) = self.states.get(file_name) {
            return state.clone();
        }

        let state = if file_name.starts_with("linux-vdso") {
            // the virtual DSO has no backing file, loading it always fails
            None
        } else {
            match SymData::load(Path::new(file_name), address_start) {
                Ok(data) => Some(Arc::new(Mutex::new(data))),
                Err(err) => {
                    warn!("failed to load debug information for {}: {:#}", file_name, err);
                    None
                }
            }
        };

        self.states.insert(file_name.to_owned(), state.clone());
        state
    }
}
