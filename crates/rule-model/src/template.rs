//! Deftemplate identity, slot layout, and constraint metadata
//!
//! Template *parsing* is external; the engine only needs a stable id, the
//! slot layout, and per-slot constraint masks for LHS analysis.

use crate::arena::Arena;
use crate::atom::{AtomId, AtomKind, AtomTable};
use crate::module::{ConstructHeader, ModuleId};
use crate::value::Value;
use crate::{ModelError, ModelResult};
use rustc_hash::FxHashMap;

/// Handle to a defined template.
pub type TemplateId = crate::arena::Id<Template>;

/// Bitset of atom kinds a slot accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtomKindSet(u8);

impl AtomKindSet {
    /// Accept every kind.
    pub const ANY: AtomKindSet = AtomKindSet(0x7f);

    /// Empty set.
    pub const NONE: AtomKindSet = AtomKindSet(0);

    fn bit(kind: AtomKind) -> u8 {
        match kind {
            AtomKind::Symbol => 1 << 0,
            AtomKind::String => 1 << 1,
            AtomKind::InstanceName => 1 << 2,
            AtomKind::Integer => 1 << 3,
            AtomKind::Float => 1 << 4,
            AtomKind::Bitmap => 1 << 5,
            AtomKind::ExternalAddress => 1 << 6,
        }
    }

    /// Set with one kind added.
    pub fn with(self, kind: AtomKind) -> Self {
        AtomKindSet(self.0 | Self::bit(kind))
    }

    /// True when the set accepts `kind`.
    pub fn contains(self, kind: AtomKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    /// Raw bits (serialized form).
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild from raw bits.
    pub fn from_bits(bits: u8) -> Self {
        AtomKindSet(bits & 0x7f)
    }
}

/// One slot of a template.
#[derive(Clone, Debug)]
pub struct SlotDef {
    /// Slot name atom
    pub name: AtomId,
    /// True for multifield slots
    pub multifield: bool,
    /// Constraint mask applied during LHS analysis
    pub allowed: AtomKindSet,
    /// Default value installed on assert when the slot is absent
    pub default: Option<Value>,
}

impl SlotDef {
    /// Single-field slot accepting anything.
    pub fn single(name: AtomId) -> Self {
        Self {
            name,
            multifield: false,
            allowed: AtomKindSet::ANY,
            default: None,
        }
    }

    /// Multifield slot accepting anything.
    pub fn multi(name: AtomId) -> Self {
        Self {
            name,
            multifield: true,
            allowed: AtomKindSet::ANY,
            default: None,
        }
    }
}

/// A defined template.
#[derive(Debug)]
pub struct Template {
    /// Common construct prefix
    pub header: ConstructHeader,
    /// Slot layout, in declaration order
    pub slots: Vec<SlotDef>,
}

impl Template {
    /// Index of a slot by name atom.
    pub fn slot_index(&self, name: AtomId) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }
}

/// Registry of defined templates.
pub struct TemplateTable {
    templates: Arena<Template>,
    by_name: FxHashMap<(ModuleId, AtomId), TemplateId>,
    per_module: FxHashMap<ModuleId, Vec<TemplateId>>,
}

impl TemplateTable {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            templates: Arena::new(),
            by_name: FxHashMap::default(),
            per_module: FxHashMap::default(),
        }
    }

    /// Define a template; name and slot-name atoms are retained.
    pub fn define(
        &mut self,
        atoms: &mut AtomTable,
        module: ModuleId,
        name: &str,
        slots: Vec<SlotDef>,
    ) -> ModelResult<TemplateId> {
        let name_atom = atoms.intern_symbol(name);
        if self.by_name.contains_key(&(module, name_atom)) {
            return Err(ModelError::DuplicateConstruct(name.to_owned()));
        }
        atoms.retain(name_atom);
        for slot in &slots {
            atoms.retain(slot.name);
            if let Some(default) = &slot.default {
                default.retain_all(atoms);
            }
        }
        let id = self.templates.insert(Template {
            header: ConstructHeader::new(name_atom, module),
            slots,
        });
        self.by_name.insert((module, name_atom), id);
        self.per_module.entry(module).or_default().push(id);
        Ok(id)
    }

    /// Remove a template, releasing its atoms.
    pub fn undefine(&mut self, atoms: &mut AtomTable, id: TemplateId) -> ModelResult<()> {
        let template = self
            .templates
            .remove(id)
            .ok_or_else(|| ModelError::UnknownConstruct("template".to_owned()))?;
        self.by_name
            .remove(&(template.header.module, template.header.name));
        if let Some(list) = self.per_module.get_mut(&template.header.module) {
            list.retain(|&t| t != id);
        }
        atoms.release(template.header.name);
        for slot in &template.slots {
            atoms.release(slot.name);
            if let Some(default) = &slot.default {
                default.release_all(atoms);
            }
        }
        Ok(())
    }

    /// Look up by (module, name atom).
    pub fn find(&self, module: ModuleId, name: AtomId) -> Option<TemplateId> {
        self.by_name.get(&(module, name)).copied()
    }

    /// Borrow a template.
    pub fn get(&self, id: TemplateId) -> Option<&Template> {
        self.templates.get(id)
    }

    /// Mutably borrow a template (save-phase id assignment).
    pub fn get_mut(&mut self, id: TemplateId) -> Option<&mut Template> {
        self.templates.get_mut(id)
    }

    /// Iterate templates in definition (slot) order.
    pub fn iter(&self) -> impl Iterator<Item = (TemplateId, &Template)> {
        self.templates.iter()
    }

    /// Templates defined in one module, in definition order.
    pub fn in_module(&self, module: ModuleId) -> &[TemplateId] {
        self.per_module
            .get(&module)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// True when no templates are defined.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Tear everything down, releasing atoms (load/clear path).
    pub fn reset(&mut self, atoms: &mut AtomTable) {
        let ids: Vec<TemplateId> = self.templates.iter().map(|(id, _)| id).collect();
        for id in ids {
            let _ = self.undefine(atoms, id);
        }
    }
}

impl Default for TemplateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleTable;

    #[test]
    fn test_define_and_slot_lookup() {
        let mut atoms = AtomTable::new();
        let modules = ModuleTable::new(&mut atoms);
        let mut templates = TemplateTable::new();

        let x = atoms.intern_symbol("x");
        let y = atoms.intern_symbol("y");
        let id = templates
            .define(
                &mut atoms,
                modules.main,
                "point",
                vec![SlotDef::single(x), SlotDef::single(y)],
            )
            .unwrap();

        let template = templates.get(id).unwrap();
        assert_eq!(template.slot_index(x), Some(0));
        assert_eq!(template.slot_index(y), Some(1));

        assert!(templates
            .define(&mut atoms, modules.main, "point", vec![])
            .is_err());
    }

    #[test]
    fn test_undefine_releases_atoms() {
        let mut atoms = AtomTable::new();
        let modules = ModuleTable::new(&mut atoms);
        let mut templates = TemplateTable::new();

        let slot = atoms.intern_symbol("value");
        let id = templates
            .define(&mut atoms, modules.main, "reading", vec![SlotDef::single(slot)])
            .unwrap();
        templates.undefine(&mut atoms, id).unwrap();

        atoms.sweep();
        assert!(atoms.find_symbol("reading").is_none());
    }

    #[test]
    fn test_constraint_mask() {
        let set = AtomKindSet::NONE
            .with(AtomKind::Integer)
            .with(AtomKind::Float);
        assert!(set.contains(AtomKind::Integer));
        assert!(!set.contains(AtomKind::Symbol));
        assert_eq!(AtomKindSet::from_bits(set.bits()), set);
    }
}
