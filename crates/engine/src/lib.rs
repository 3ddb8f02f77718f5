//! Forward-chaining production-rule engine
//!
//! Ties the data model and the discrimination network together:
//! - Propagation: assert/retract drives through the alpha and join networks
//! - Rule compilation with structure sharing and incremental reset
//! - Per-module agendas with salience groups and pluggable strategies
//! - Pattern-parser plug-in registry (the deftemplate-fact flavour is
//!   built in)
//!
//! The LHS text parser and the RHS action interpreter are external
//! collaborators: rules arrive as [`RuleDef`] values and `fire_next` hands
//! the fired activation back to the caller.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

/// Agenda and conflict-resolution strategies
pub mod agenda;
/// Rule definition and compilation
pub mod compile;
/// Expression evaluation
pub mod eval;
/// Fact base
pub mod fact;
/// Pattern-parser plug-in protocol
pub mod parsers;
/// Assert/retract propagation drives
pub mod propagate;
/// Incremental reset
pub mod reset;

pub use agenda::{
    ActivationId, AgendaSet, Fired, SalienceEvaluation, Strategy, XorShift64, MAX_SALIENCE,
    MIN_SALIENCE,
};
pub use compile::{
    CeKind, Condition, Lit, PatternSpec, Rule, RuleDef, RuleId, RuleTable, Term, TestSpec,
};
pub use eval::{EvalContext, EvalValue, FunctionRegistry};
pub use fact::{Fact, FactBase};
pub use parsers::{FactParser, ParserRegistry, PatternParser};

use rete::{EntityId, Network};
use rule_model::atom::AtomTable;
use rule_model::expr::ExprPool;
use rule_model::module::ModuleTable;
use rule_model::template::{SlotDef, TemplateId, TemplateTable};
use rule_model::value::Value;
use rule_model::ModelError;
use tracing::error;

pub(crate) const COMPONENT_EVAL: &str = "EVAL";
pub(crate) const COMPONENT_AGENDA: &str = "AGENDA";
pub(crate) const COMPONENT_RETE: &str = "RETE";
pub(crate) const COMPONENT_COMPILE: &str = "RULECMP";

/// Emit an error-router line: `[COMPONENT id] message`.
pub(crate) fn route_error(component: &str, id: u32, message: &str) {
    error!("[{component} {id}] {message}");
}

/// Engine error types
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition rejected before reaching the network
    #[error("parse error: {0}")]
    Parse(String),

    /// LHS analysis or assertion violated a constraint
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A variable was referenced before any pattern bound it
    #[error("unbound variable ?{0}")]
    UnboundVariable(String),

    /// Rule removal attempted while propagation is in progress
    #[error("not deletable: {0}")]
    NotDeletable(String),

    /// No template with this name in the current module
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// No rule with this id
    #[error("unknown rule: {0}")]
    UnknownRule(String),

    /// Model-layer error
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Network-layer error
    #[error(transparent)]
    Network(#[from] rete::NetworkError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Conflict-resolution strategy
    pub strategy: Strategy,
    /// When dynamic salience expressions are evaluated
    pub salience_evaluation: SalienceEvaluation,
    /// Allow beta memories to grow past their load factor
    pub resize_beta_memories: bool,
    /// Seed for the random strategy's generator
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Depth,
            salience_evaluation: SalienceEvaluation::WhenDefined,
            resize_beta_memories: true,
            seed: 0x5eed_cafe_f00d_0001,
        }
    }
}

/// The production-rule engine.
pub struct Engine {
    /// Interned atoms
    pub atoms: AtomTable,
    /// Expression pool
    pub exprs: ExprPool,
    /// Module registry
    pub modules: ModuleTable,
    /// Template registry
    pub templates: TemplateTable,
    /// Discrimination network
    pub network: Network,
    /// Fact base
    pub facts: FactBase,
    /// Rule registry
    pub rules: RuleTable,
    /// Per-module agendas
    pub agenda: AgendaSet,
    /// Native function registry
    pub functions: FunctionRegistry,
    /// Pattern-parser registry
    pub parsers: ParserRegistry,
    /// Configuration
    pub config: EngineConfig,
    pub(crate) eval_error: bool,
    pub(crate) rng: XorShift64,
    pub(crate) initial_template: TemplateId,
    pub(crate) incremental_reset_in_progress: bool,
}

impl Engine {
    /// Engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with a custom configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        let mut atoms = AtomTable::new();
        let modules = ModuleTable::new(&mut atoms);
        let mut functions = FunctionRegistry::new();
        eval::register_builtins(&mut atoms, &mut functions);

        let mut parsers = ParserRegistry::new();
        parsers.register(Box::new(FactParser));
        for keyword in [
            "and", "or", "not", "exists", "forall", "test", "declare", "logical", "object",
        ] {
            parsers.reserve(keyword, "defrule");
        }

        let seed = config.seed;
        let resize = config.resize_beta_memories;
        let mut network = Network::new();
        network.resize_memories = resize;

        let mut engine = Self {
            atoms,
            exprs: ExprPool::new(),
            modules,
            templates: TemplateTable::new(),
            network,
            facts: FactBase::new(),
            rules: RuleTable::new(),
            agenda: AgendaSet::new(),
            functions,
            parsers,
            config,
            eval_error: false,
            rng: XorShift64::new(seed),
            initial_template: rule_model::arena::Id::from_raw_parts(0, 0),
            incremental_reset_in_progress: false,
        };
        engine.bootstrap();
        engine
    }

    // Install the initial-fact template and its fact; rules whose LHS has
    // no positive pattern match against it. The template carries one
    // implied multifield slot, like any ordered fact.
    fn bootstrap(&mut self) {
        let main = self.modules.main;
        let implied = self.atoms.intern_symbol("implied");
        let template = match self.templates.define(
            &mut self.atoms,
            main,
            "initial-fact",
            vec![SlotDef::multi(implied)],
        ) {
            Ok(template) => template,
            // The table is empty at bootstrap; a duplicate is impossible.
            Err(_) => unreachable!("initial-fact already defined"),
        };
        self.initial_template = template;
        self.parsers.reserve("initial-fact", "facts");
        let _ = self.assert_values(
            template,
            vec![Value::Multi(smallvec::SmallVec::new())],
        );
    }

    /// Define a template with single-field slots accepting any value.
    pub fn define_template(&mut self, name: &str, slots: &[&str]) -> EngineResult<TemplateId> {
        let slot_defs = slots
            .iter()
            .map(|slot| {
                let atom = self.atoms.intern_symbol(slot);
                SlotDef::single(atom)
            })
            .collect();
        self.define_template_slots(name, slot_defs)
    }

    /// Define a template from explicit slot definitions.
    pub fn define_template_slots(
        &mut self,
        name: &str,
        slots: Vec<SlotDef>,
    ) -> EngineResult<TemplateId> {
        if self.parsers.is_reserved(name) {
            return Err(EngineError::Parse(format!(
                "{} is a reserved symbol",
                name
            )));
        }
        let module = self.modules.current;
        Ok(self.templates.define(&mut self.atoms, module, name, slots)?)
    }

    /// Assert a fact by template name and named slot values.
    ///
    /// Unmentioned slots take their template default, or the `nil` symbol.
    pub fn assert_fact(&mut self, template: &str, slots: &[(&str, Lit)]) -> EngineResult<EntityId> {
        let module = self.modules.current;
        let name_atom = self.atoms.intern_symbol(template);
        let template_id = self
            .templates
            .find(module, name_atom)
            .ok_or_else(|| EngineError::UnknownTemplate(template.to_owned()))?;

        let slot_defs: Vec<(rule_model::atom::AtomId, bool, Option<Value>)> = self
            .templates
            .get(template_id)
            .map(|t| {
                t.slots
                    .iter()
                    .map(|slot| (slot.name, slot.multifield, slot.default.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut values: Vec<Value> = Vec::with_capacity(slot_defs.len());
        for (slot_name, multifield, default) in slot_defs {
            let provided = slots
                .iter()
                .find(|(name, _)| self.atoms.find_symbol(name) == Some(slot_name))
                .map(|(_, lit)| lit.clone());
            let value = match provided {
                Some(lit) => Value::Atom(lit.intern(&mut self.atoms)),
                None => match default {
                    Some(default) => default,
                    None if multifield => Value::Multi(smallvec::SmallVec::new()),
                    None => Value::Atom(self.atoms.intern_symbol("nil")),
                },
            };
            values.push(value);
        }
        self.assert_values(template_id, values)
    }

    /// Fire activations until the agenda empties or `limit` is reached.
    pub fn run(&mut self, limit: Option<u64>) -> u64 {
        self.run_with(limit, |_, _| {})
    }

    /// Fire activations, handing each fired activation to `handler` (the
    /// external action interpreter). The rule is marked executing around
    /// the handler call; handlers may re-enter the engine.
    pub fn run_with(
        &mut self,
        limit: Option<u64>,
        mut handler: impl FnMut(&mut Engine, &Fired),
    ) -> u64 {
        let mut fired = 0;
        while limit.map(|l| fired < l).unwrap_or(true) {
            let activation = match self.fire_next() {
                Some(activation) => activation,
                None => break,
            };
            fired += 1;
            if let Some(rule) = self.rules.get_mut(activation.rule) {
                rule.executing = true;
            }
            handler(self, &activation);
            if let Some(rule) = self.rules.get_mut(activation.rule) {
                rule.executing = false;
            }
            // Safe point between fires.
            self.atoms.sweep();
        }
        fired
    }

    /// Number of pending activations in the current module's agenda.
    pub fn agenda_len(&self) -> usize {
        self.agenda.len(self.modules.current)
    }

    /// (rule name, salience) of pending activations in firing order.
    pub fn agenda_snapshot(&self) -> Vec<(String, i32)> {
        self.agenda
            .order(self.modules.current)
            .into_iter()
            .map(|id| {
                let activation = &self.agenda.activations[id];
                let name = self
                    .rules
                    .get(activation.rule)
                    .and_then(|r| self.atoms.lexeme_text(r.header.name))
                    .unwrap_or("")
                    .to_owned();
                (name, activation.salience)
            })
            .collect()
    }

    /// Switch the conflict-resolution strategy and reorder every agenda.
    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.config.strategy = strategy;
        let modules: Vec<_> = self.modules.iter().map(|(id, _)| id).collect();
        for module in modules {
            self.reorder_agenda(module);
        }
    }

    /// Switch the salience evaluation mode.
    pub fn set_salience_evaluation(&mut self, mode: SalienceEvaluation) {
        self.config.salience_evaluation = mode;
    }

    /// Sticky evaluation-error flag, cleared on read.
    pub fn take_eval_error(&mut self) -> bool {
        std::mem::replace(&mut self.eval_error, false)
    }

    /// True while an incremental reset is running.
    pub fn incremental_reset_in_progress(&self) -> bool {
        self.incremental_reset_in_progress
    }

    /// Re-point the initial-fact template after the template table was
    /// rebuilt (image load).
    pub fn relink_initial_template(&mut self) {
        let main = self.modules.main;
        let name = self.atoms.intern_symbol("initial-fact");
        match self.templates.find(main, name) {
            Some(template) => self.initial_template = template,
            None => {
                // An image without the bootstrap template gets a fresh one.
                let implied = self.atoms.intern_symbol("implied");
                if let Ok(template) = self.templates.define(
                    &mut self.atoms,
                    main,
                    "initial-fact",
                    vec![SlotDef::multi(implied)],
                ) {
                    self.initial_template = template;
                    let _ = self.assert_values(
                        template,
                        vec![Value::Multi(smallvec::SmallVec::new())],
                    );
                }
            }
        }
    }

    /// Tear the engine down to its freshly constructed state.
    pub fn clear(&mut self) -> EngineResult<()> {
        if self.network.drive_in_progress() {
            return Err(EngineError::NotDeletable(
                "join operation in progress".to_owned(),
            ));
        }
        let rules: Vec<RuleId> = self.rules.iter().map(|(id, _)| id).collect();
        for rule in rules {
            self.remove_rule(rule)?;
        }
        for fact in self.facts.ids() {
            self.retract(fact)?;
        }
        self.templates.reset(&mut self.atoms);
        self.facts.reset();
        self.agenda.reset();
        self.network.reset();
        self.modules.reset(&mut self.atoms);
        self.atoms.sweep();
        self.bootstrap();
        Ok(())
    }

    /// (facts, rules, partial matches, pending activations).
    pub fn stats(&self) -> (usize, usize, usize, usize) {
        (
            self.facts.len(),
            self.rules.len(),
            self.network.pms.len(),
            self.agenda_len(),
        )
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_bootstrap() {
        let engine = Engine::new();
        // The initial fact is asserted.
        assert_eq!(engine.facts.len(), 1);
        assert_eq!(engine.rules.len(), 0);
        assert_eq!(engine.agenda_len(), 0);
    }

    #[test]
    fn test_reserved_symbols_rejected() {
        let mut engine = Engine::new();
        assert!(engine.define_template("not", &[]).is_err());
        assert!(engine.define_template("initial-fact", &[]).is_err());
    }

    #[test]
    fn test_clear_restores_bootstrap_state() {
        let mut engine = Engine::new();
        engine.define_template("signal", &["level"]).unwrap();
        engine
            .assert_fact("signal", &[("level", Lit::Int(3))])
            .unwrap();
        engine.clear().unwrap();
        assert_eq!(engine.facts.len(), 1);
        assert!(engine.templates.len() == 1);
    }
}
