//! Core data model for the rule engine: interned atoms, expression trees,
//! modules, and templates
//!
//! Everything the match network references is interned here:
//! - Atoms: symbols, strings, instance names, integers, floats, bitmaps,
//!   external addresses; bucket-chained tables with fixed hash functions
//! - Expressions: owned trees during construction, hashed refcounted trees
//!   once attached to the network
//! - Constructs: defmodule and deftemplate identity with slot layouts
//!
//! The arena module provides the generational index store every node kind
//! in the engine is built on.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

/// Generational arena and typed ids
pub mod arena;
/// Interned atom tables
pub mod atom;
/// Expression trees and the hashed-expression pool
pub mod expr;
/// Defmodule registry and construct headers
pub mod module;
/// Deftemplate registry
pub mod template;
/// Slot values
pub mod value;

pub use arena::{Arena, Id};
pub use atom::{
    AtomCell, AtomId, AtomKind, AtomTable, AtomValue, LexemeKind, NULL_ID,
};
pub use expr::{ExprId, ExprNode, ExprPool, ExprValue, FuncId, HashedExpr, HashedExprId};
pub use module::{ConstructHeader, ConstructType, DefModule, ModuleId, ModuleTable, PortItem};
pub use template::{AtomKindSet, SlotDef, Template, TemplateId, TemplateTable};
pub use value::Value;

/// Model error types
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A construct with this name already exists in the module
    #[error("construct already defined: {0}")]
    DuplicateConstruct(String),

    /// No construct with this name exists
    #[error("unknown construct: {0}")]
    UnknownConstruct(String),

    /// Slot count or slot name did not match the template layout
    #[error("slot mismatch: expected {expected}, got {got}")]
    SlotMismatch {
        /// Slots the template declares
        expected: usize,
        /// Slots the caller supplied
        got: usize,
    },
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_bootstrap() {
        let mut atoms = AtomTable::new();
        let modules = ModuleTable::new(&mut atoms);
        assert!(atoms.get(atoms.true_symbol).is_some());
        assert!(modules.get(modules.main).is_some());
    }
}
