//! Defmodule registry and construct headers
//!
//! Modules scope constructs and agendas. Parsing of module syntax is an
//! external concern; the registry only tracks identity, import/export port
//! items, and the small save-time id space modules use in the binary image.

use crate::arena::{Arena, Id};
use crate::atom::{AtomId, AtomTable, NULL_ID};
use crate::{ModelError, ModelResult};
use rustc_hash::FxHashMap;

/// Handle to a defined module.
pub type ModuleId = Id<DefModule>;

/// Construct kinds the engine tracks per module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConstructType {
    /// Deftemplate
    Template,
    /// Defrule
    Rule,
}

/// Common prefix of every defined construct.
#[derive(Clone, Debug)]
pub struct ConstructHeader {
    /// Construct name atom
    pub name: AtomId,
    /// Owning module
    pub module: ModuleId,
    /// Dense id assigned transiently during save; [`NULL_ID`] otherwise
    pub bsave_id: u64,
    /// Source text, when the defining caller supplied it
    pub pp_form: Option<Box<str>>,
}

impl ConstructHeader {
    /// Header for a freshly defined construct.
    pub fn new(name: AtomId, module: ModuleId) -> Self {
        Self {
            name,
            module,
            bsave_id: NULL_ID,
            pp_form: None,
        }
    }
}

/// Import/export declaration linking a named construct across modules.
///
/// `None` fields are wildcards (import everything a module exports).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortItem {
    /// Source/destination module name, or all modules
    pub module: Option<AtomId>,
    /// Construct kind restriction, or all kinds
    pub construct_type: Option<ConstructType>,
    /// Construct name restriction, or all names
    pub name: Option<AtomId>,
}

/// One defined module.
#[derive(Debug)]
pub struct DefModule {
    /// Module name atom
    pub name: AtomId,
    /// Port items this module imports
    pub imports: Vec<PortItem>,
    /// Port items this module exports
    pub exports: Vec<PortItem>,
    /// Small save-time id; modules have their own id space
    pub bsave_id: u64,
}

/// Registry of defined modules; always contains `MAIN`.
pub struct ModuleTable {
    modules: Arena<DefModule>,
    by_name: FxHashMap<AtomId, ModuleId>,
    /// The implicit `MAIN` module.
    pub main: ModuleId,
    /// Module whose agenda `fire_next` pops.
    pub current: ModuleId,
}

impl ModuleTable {
    /// Create the registry with `MAIN` defined and current.
    pub fn new(atoms: &mut AtomTable) -> Self {
        let mut table = Self {
            modules: Arena::new(),
            by_name: FxHashMap::default(),
            main: Id::from_raw_parts(0, 0),
            current: Id::from_raw_parts(0, 0),
        };
        let main_name = atoms.intern_symbol("MAIN");
        atoms.retain(main_name);
        let main = table.modules.insert(DefModule {
            name: main_name,
            imports: Vec::new(),
            exports: Vec::new(),
            bsave_id: NULL_ID,
        });
        table.by_name.insert(main_name, main);
        table.main = main;
        table.current = main;
        table
    }

    /// Define a new module.
    pub fn define(&mut self, atoms: &mut AtomTable, name: &str) -> ModelResult<ModuleId> {
        let name_atom = atoms.intern_symbol(name);
        if self.by_name.contains_key(&name_atom) {
            return Err(ModelError::DuplicateConstruct(name.to_owned()));
        }
        atoms.retain(name_atom);
        let id = self.modules.insert(DefModule {
            name: name_atom,
            imports: Vec::new(),
            exports: Vec::new(),
            bsave_id: NULL_ID,
        });
        self.by_name.insert(name_atom, id);
        Ok(id)
    }

    /// Look up a module by name atom.
    pub fn find(&self, name: AtomId) -> Option<ModuleId> {
        self.by_name.get(&name).copied()
    }

    /// Borrow a module.
    pub fn get(&self, id: ModuleId) -> Option<&DefModule> {
        self.modules.get(id)
    }

    /// Mutably borrow a module.
    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut DefModule> {
        self.modules.get_mut(id)
    }

    /// Switch the current module.
    pub fn set_current(&mut self, id: ModuleId) -> ModelResult<()> {
        if !self.modules.contains(id) {
            return Err(ModelError::UnknownConstruct("module".to_owned()));
        }
        self.current = id;
        Ok(())
    }

    /// Iterate modules in definition order.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &DefModule)> {
        self.modules.iter()
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Never true; `MAIN` always exists.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Tear everything down and recreate `MAIN` (load/clear path).
    pub fn reset(&mut self, atoms: &mut AtomTable) {
        for (_, module) in self.modules.iter() {
            atoms.release(module.name);
        }
        self.modules.clear();
        self.by_name.clear();
        let main_name = atoms.intern_symbol("MAIN");
        atoms.retain(main_name);
        let main = self.modules.insert(DefModule {
            name: main_name,
            imports: Vec::new(),
            exports: Vec::new(),
            bsave_id: NULL_ID,
        });
        self.by_name.insert(main_name, main);
        self.main = main;
        self.current = main;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_exists() {
        let mut atoms = AtomTable::new();
        let modules = ModuleTable::new(&mut atoms);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules.current, modules.main);
    }

    #[test]
    fn test_define_and_find() {
        let mut atoms = AtomTable::new();
        let mut modules = ModuleTable::new(&mut atoms);

        let detection = modules.define(&mut atoms, "DETECTION").unwrap();
        let name = atoms.intern_symbol("DETECTION");
        assert_eq!(modules.find(name), Some(detection));

        assert!(modules.define(&mut atoms, "DETECTION").is_err());
    }

    #[test]
    fn test_set_current() {
        let mut atoms = AtomTable::new();
        let mut modules = ModuleTable::new(&mut atoms);
        let other = modules.define(&mut atoms, "OTHER").unwrap();
        modules.set_current(other).unwrap();
        assert_eq!(modules.current, other);
    }
}
