//! Rule compilation: from a rule definition to shared network structure
//!
//! The external LHS parser hands the core parsed patterns; `RuleDef` is the
//! stand-in builder used by embedders and tests. Compilation performs the
//! variable analysis (with nand frames scoping not/exists groups), emits the
//! intra-pattern tests, the join tests with their matched left/right hash
//! pairs, adds patterns through the parser registry, and builds or reuses
//! join nodes. Freshly created nodes are then primed by the incremental
//! reset so the network state is identical to a define-before-assert
//! ordering.

use crate::agenda::{SalienceEvaluation, MAX_SALIENCE, MIN_SALIENCE};
use crate::eval::{EvalContext, EvalValue};
use crate::{Engine, EngineError, EngineResult, COMPONENT_COMPILE};
use ahash::AHashMap;
use rete::{
    BetaMemory, FieldTest, JoinId, JoinKind, JoinNode, ParsedPattern, RightInput, RuleToken, Side,
    TerminalId,
};
use rule_model::arena::{Arena, Id};
use rule_model::atom::{AtomId, AtomTable};
use rule_model::expr::{ExprId, ExprValue, FuncId, HashedExprId};
use rule_model::module::{ConstructHeader, ModuleId};
use rule_model::template::TemplateId;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::info;

/// Handle to a defined rule.
pub type RuleId = Id<Rule>;

/// A defined rule.
pub struct Rule {
    /// Common construct prefix
    pub header: ConstructHeader,
    /// Static salience
    pub salience: i32,
    /// Dynamic salience expression, when declared
    pub dynamic_salience: Option<HashedExprId>,
    /// Last successfully evaluated dynamic salience
    pub last_dynamic_salience: Option<i32>,
    /// LHS complexity used by the complexity/simplicity strategies
    pub complexity: u32,
    /// RHS action expression, evaluated by the external interpreter
    pub actions: Option<HashedExprId>,
    /// True while the rule is firing
    pub executing: bool,
    /// Alpha terminals of the rule's patterns, in CE order
    pub terminals: Vec<TerminalId>,
    /// Join chain, first to last
    pub joins: Vec<JoinId>,
}

/// Pack a rule id into the opaque token terminal joins carry.
pub fn rule_token(id: RuleId) -> RuleToken {
    RuleToken(((id.index() as u64) << 32) | u64::from(id.generation()))
}

/// Unpack a rule token.
pub fn token_rule(token: RuleToken) -> RuleId {
    Id::from_raw_parts((token.0 >> 32) as u32, token.0 as u32)
}

/// Registry of defined rules.
pub struct RuleTable {
    rules: Arena<Rule>,
    by_name: AHashMap<(ModuleId, AtomId), RuleId>,
    per_module: FxHashMap<ModuleId, Vec<RuleId>>,
}

impl RuleTable {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            rules: Arena::new(),
            by_name: AHashMap::new(),
            per_module: FxHashMap::default(),
        }
    }

    /// Borrow a rule.
    pub fn get(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(id)
    }

    /// Mutably borrow a rule.
    pub fn get_mut(&mut self, id: RuleId) -> Option<&mut Rule> {
        self.rules.get_mut(id)
    }

    /// Look up by (module, name atom).
    pub fn find(&self, module: ModuleId, name: AtomId) -> Option<RuleId> {
        self.by_name.get(&(module, name)).copied()
    }

    /// Iterate rules in definition order.
    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.rules.iter()
    }

    /// Rules of one module in definition order.
    pub fn in_module(&self, module: ModuleId) -> &[RuleId] {
        self.per_module
            .get(&module)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are defined.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Install an already-compiled rule record (image load path); network
    /// structure must exist and the caller sets the terminal join's token.
    pub fn insert_loaded(&mut self, rule: Rule) -> RuleId {
        self.insert(rule)
    }

    pub(crate) fn insert(&mut self, rule: Rule) -> RuleId {
        let key = (rule.header.module, rule.header.name);
        let module = rule.header.module;
        let id = self.rules.insert(rule);
        self.by_name.insert(key, id);
        self.per_module.entry(module).or_default().push(id);
        id
    }

    pub(crate) fn remove(&mut self, id: RuleId) -> Option<Rule> {
        let rule = self.rules.remove(id)?;
        self.by_name.remove(&(rule.header.module, rule.header.name));
        if let Some(list) = self.per_module.get_mut(&rule.header.module) {
            list.retain(|&r| r != id);
        }
        Some(rule)
    }

    /// Drop everything (clear/load path).
    pub fn reset(&mut self) {
        self.rules.clear();
        self.by_name.clear();
        self.per_module.clear();
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Literal value in a rule definition.
#[derive(Clone, Debug, PartialEq)]
pub enum Lit {
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// Symbol literal
    Sym(String),
    /// String literal
    Str(String),
}

impl Lit {
    pub(crate) fn intern(&self, atoms: &mut AtomTable) -> AtomId {
        match self {
            Lit::Int(v) => atoms.intern_integer(*v),
            Lit::Float(v) => atoms.intern_float(*v),
            Lit::Sym(s) => atoms.intern_symbol(s),
            Lit::Str(s) => atoms.intern_string(s),
        }
    }
}

/// One slot constraint in a pattern definition.
#[derive(Clone, Debug)]
pub enum Term {
    /// Constant
    Lit(Lit),
    /// Named variable
    Var(String),
    /// Single-field wildcard
    Any,
    /// Multifield wildcard (the rest of a multifield slot)
    Rest,
}

impl Term {
    /// Integer constant.
    pub fn int(v: i64) -> Self {
        Term::Lit(Lit::Int(v))
    }

    /// Float constant.
    pub fn float(v: f64) -> Self {
        Term::Lit(Lit::Float(v))
    }

    /// Symbol constant.
    pub fn sym(s: &str) -> Self {
        Term::Lit(Lit::Sym(s.to_owned()))
    }

    /// Variable.
    pub fn var(name: &str) -> Self {
        Term::Var(name.to_owned())
    }
}

/// Kind of a pattern conditional element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CeKind {
    /// Positive pattern
    Pattern,
    /// Negated pattern (`not`)
    Not,
    /// Existence pattern (`exists`)
    Exists,
}

/// A pattern CE in a rule definition.
#[derive(Clone, Debug)]
pub struct PatternSpec {
    /// Template name
    pub template: String,
    /// CE kind
    pub kind: CeKind,
    /// (slot name, constraint) pairs; unmentioned slots are wildcards
    pub slots: Vec<(String, Term)>,
}

/// A `test` CE: one function call over bound variables and literals.
#[derive(Clone, Debug)]
pub struct TestSpec {
    /// Function name
    pub func: String,
    /// Arguments
    pub args: Vec<Term>,
}

/// One conditional element.
#[derive(Clone, Debug)]
pub enum Condition {
    /// Pattern CE (positive, not, exists)
    Pattern(PatternSpec),
    /// Test CE
    Test(TestSpec),
    /// Forall group: `(forall p q)` ≡ `(not (and p (not q)))`; compiles to a
    /// from-the-right subnetwork feeding an outer negated join
    Forall(PatternSpec, PatternSpec),
}

/// A rule definition: the builder the external parser would produce.
#[derive(Clone, Debug)]
pub struct RuleDef {
    /// Rule name
    pub name: String,
    /// Static salience
    pub salience: i32,
    /// Dynamic salience expression
    pub dynamic_salience: Option<TestSpec>,
    /// Conditional elements in LHS order
    pub conditions: Vec<Condition>,
}

impl RuleDef {
    /// Start a definition.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            salience: 0,
            dynamic_salience: None,
            conditions: Vec::new(),
        }
    }

    /// Set the static salience.
    pub fn salience(mut self, salience: i32) -> Self {
        self.salience = salience;
        self
    }

    /// Declare a dynamic salience expression.
    pub fn dynamic_salience(mut self, spec: TestSpec) -> Self {
        self.dynamic_salience = Some(spec);
        self
    }

    /// Add a positive pattern.
    pub fn pattern(self, template: &str, slots: &[(&str, Term)]) -> Self {
        self.add_ce(template, CeKind::Pattern, slots)
    }

    /// Add a negated pattern.
    pub fn not_pattern(self, template: &str, slots: &[(&str, Term)]) -> Self {
        self.add_ce(template, CeKind::Not, slots)
    }

    /// Add an existence pattern.
    pub fn exists_pattern(self, template: &str, slots: &[(&str, Term)]) -> Self {
        self.add_ce(template, CeKind::Exists, slots)
    }

    /// Add a `forall` group: every match of `all` must have a matching
    /// `satisfy`. Equivalent to the nested `(not (and all (not satisfy)))`.
    pub fn forall(
        mut self,
        all: (&str, &[(&str, Term)]),
        satisfy: (&str, &[(&str, Term)]),
    ) -> Self {
        let mk = |(template, slots): (&str, &[(&str, Term)])| PatternSpec {
            template: template.to_owned(),
            kind: CeKind::Pattern,
            slots: slots
                .iter()
                .map(|(name, term)| ((*name).to_owned(), term.clone()))
                .collect(),
        };
        self.conditions.push(Condition::Forall(mk(all), mk(satisfy)));
        self
    }

    /// Add a test CE over bound variables.
    pub fn test(mut self, func: &str, args: &[Term]) -> Self {
        self.conditions.push(Condition::Test(TestSpec {
            func: func.to_owned(),
            args: args.to_vec(),
        }));
        self
    }

    fn add_ce(mut self, template: &str, kind: CeKind, slots: &[(&str, Term)]) -> Self {
        self.conditions.push(Condition::Pattern(PatternSpec {
            template: template.to_owned(),
            kind,
            slots: slots
                .iter()
                .map(|(name, term)| ((*name).to_owned(), term.clone()))
                .collect(),
        }));
        self
    }
}

/// Nand frame: scopes variables bound inside a not/exists group during
/// analysis. Bindings made inside the frame disappear when it pops.
struct NandFrame {
    locals: Vec<String>,
}

// Where a variable was first bound.
#[derive(Clone, Copy)]
struct Binding {
    pattern: u16,
    slot: u16,
    field: u16,
}

// Analysis output for one pattern CE.
struct AnalyzedPattern {
    template: TemplateId,
    kind: CeKind,
    parsed: ParsedPattern,
    join_test: Option<ExprId>,
    left_hash: Option<ExprId>,
    right_hash: Option<ExprId>,
}

// Analysis output for one conditional element.
enum AnalyzedCe {
    Single(AnalyzedPattern),
    // (all, satisfy): the subnetwork patterns of a forall group.
    Forall(AnalyzedPattern, AnalyzedPattern),
}

impl Engine {
    /// Define a rule, compiling it into the shared network and priming the
    /// fresh nodes from existing entities.
    pub fn add_rule(&mut self, def: RuleDef) -> EngineResult<RuleId> {
        let module = self.modules.current;
        let name_atom = self.atoms.intern_symbol(&def.name);
        if self.rules.find(module, name_atom).is_some() {
            return Err(EngineError::Parse(format!(
                "rule {} already defined",
                def.name
            )));
        }
        if !(MIN_SALIENCE..=MAX_SALIENCE).contains(&def.salience) {
            return Err(EngineError::ConstraintViolation(format!(
                "salience {} outside {}..{}",
                def.salience, MIN_SALIENCE, MAX_SALIENCE
            )));
        }

        let analyzed = self.analyze(&def)?;
        let ce_count = analyzed.len();

        let mut terminals: Vec<TerminalId> = Vec::new();
        let mut joins: Vec<JoinId> = Vec::new();
        let mut fresh_joins: FxHashSet<JoinId> = FxHashSet::default();
        let mut fresh_terminals: Vec<TerminalId> = Vec::new();
        let mut complexity: u32 = 0;
        // Last join of the main chain; forall subnetworks hang off to the
        // side and must not become left parents of later CEs.
        let mut chain_last: Option<JoinId> = None;

        for (index, ce) in analyzed.into_iter().enumerate() {
            let is_last = index + 1 == ce_count;
            match ce {
                AnalyzedCe::Single(pattern) => {
                    complexity += 1
                        + pattern.parsed.tests.iter().filter(|t| t.test.is_some()).count() as u32;
                    let terminal = self.install_pattern(
                        pattern.template,
                        pattern.parsed,
                        &mut fresh_terminals,
                    )?;
                    terminals.push(terminal);

                    let kind = match pattern.kind {
                        CeKind::Pattern => JoinKind::Positive,
                        CeKind::Not => JoinKind::Negated,
                        CeKind::Exists => JoinKind::Exists,
                    };
                    let network_test = pattern
                        .join_test
                        .map(|t| self.exprs.intern(t, &mut self.atoms));
                    let left_hash = pattern
                        .left_hash
                        .map(|t| self.exprs.intern(t, &mut self.atoms));
                    let right_hash = pattern
                        .right_hash
                        .map(|t| self.exprs.intern(t, &mut self.atoms));
                    let left_parent = chain_last;

                    let existing = self.find_shared_join(
                        left_parent,
                        terminal,
                        kind,
                        network_test,
                        left_hash,
                        right_hash,
                        is_last,
                    );
                    let join = match existing {
                        Some(join) => {
                            // The shared join holds its own references.
                            for expr in
                                [network_test, left_hash, right_hash].into_iter().flatten()
                            {
                                self.exprs.release_hashed(expr, &mut self.atoms);
                            }
                            join
                        }
                        None => {
                            let mut node = JoinNode::new(kind, RightInput::Alpha(terminal));
                            node.left_parent = left_parent;
                            node.network_test = network_test;
                            node.left_hash = left_hash;
                            node.right_hash = right_hash;
                            node.left_mem = BetaMemory::new(left_hash.is_some());
                            node.initialize = true;
                            let join = self.network.add_join(node);
                            fresh_joins.insert(join);
                            join
                        }
                    };
                    joins.push(join);
                    chain_last = Some(join);
                }
                AnalyzedCe::Forall(all, satisfy) => {
                    complexity += 3;
                    // Subnetwork: all-pattern, then a negated satisfy join.
                    let all_terminal = self.install_pattern(
                        all.template,
                        all.parsed,
                        &mut fresh_terminals,
                    )?;
                    terminals.push(all_terminal);
                    let mut all_join = JoinNode::new(
                        JoinKind::Positive,
                        RightInput::Alpha(all_terminal),
                    );
                    all_join.initialize = true;
                    let all_join = self.network.add_join(all_join);
                    fresh_joins.insert(all_join);
                    joins.push(all_join);

                    let satisfy_terminal = self.install_pattern(
                        satisfy.template,
                        satisfy.parsed,
                        &mut fresh_terminals,
                    )?;
                    terminals.push(satisfy_terminal);
                    let mut satisfy_join = JoinNode::new(
                        JoinKind::Negated,
                        RightInput::Alpha(satisfy_terminal),
                    );
                    satisfy_join.left_parent = Some(all_join);
                    satisfy_join.network_test = satisfy
                        .join_test
                        .map(|t| self.exprs.intern(t, &mut self.atoms));
                    satisfy_join.left_hash = satisfy
                        .left_hash
                        .map(|t| self.exprs.intern(t, &mut self.atoms));
                    satisfy_join.left_mem = BetaMemory::new(satisfy_join.left_hash.is_some());
                    satisfy_join.initialize = true;
                    let satisfy_join = self.network.add_join(satisfy_join);
                    fresh_joins.insert(satisfy_join);
                    joins.push(satisfy_join);

                    // Outer join: blocked while any all-without-satisfy
                    // tuple flows in from the right.
                    let mut outer = JoinNode::new(
                        JoinKind::Negated,
                        RightInput::Join(satisfy_join),
                    );
                    outer.left_parent = chain_last;
                    outer.initialize = true;
                    let outer = self.network.add_join(outer);
                    fresh_joins.insert(outer);
                    joins.push(outer);
                    chain_last = Some(outer);
                }
            }
        }

        let last_join = match joins.last() {
            Some(&join) => join,
            None => {
                return Err(EngineError::Parse(
                    "rule has no conditional elements".to_owned(),
                ))
            }
        };

        let dynamic_salience = match &def.dynamic_salience {
            Some(spec) => {
                let bindings = self.salience_bindings(&def)?;
                let expr = self.build_test_expr(spec, &bindings, u16::MAX)?;
                Some(self.exprs.intern(expr, &mut self.atoms))
            }
            None => None,
        };

        self.atoms.retain(name_atom);
        let mut rule = Rule {
            header: ConstructHeader::new(name_atom, module),
            salience: def.salience,
            dynamic_salience,
            last_dynamic_salience: None,
            complexity,
            actions: None,
            executing: false,
            terminals,
            joins: joins.clone(),
        };

        // WhenDefined evaluates the dynamic expression once, now.
        if let (Some(expr), SalienceEvaluation::WhenDefined) =
            (dynamic_salience, self.config.salience_evaluation)
        {
            let root = self.exprs.hashed_root(expr);
            let mut ctx = EvalContext::default();
            if let Some(EvalValue::Int(v)) = self.eval(&mut ctx, root) {
                rule.salience = (v as i32).clamp(MIN_SALIENCE, MAX_SALIENCE);
            }
        }

        let id = self.rules.insert(rule);
        self.network.joins[last_join].rule = Some(rule_token(id));

        // Prime the freshly created structure from live entities.
        for &terminal in &fresh_terminals {
            self.network.patterns.terminals[terminal].initialize = true;
        }
        self.incremental_reset(id, &fresh_joins, &fresh_terminals)?;

        info!(rule = %def.name, joins = joins.len(), "rule compiled");
        Ok(id)
    }

    /// Remove a rule, unsharing its network structure bottom-up.
    pub fn remove_rule(&mut self, id: RuleId) -> EngineResult<()> {
        if self.network.drive_in_progress() {
            return Err(EngineError::NotDeletable(
                "join operation in progress".to_owned(),
            ));
        }
        let rule = self
            .rules
            .remove(id)
            .ok_or_else(|| EngineError::UnknownRule(format!("{:?}", id)))?;

        self.clear_rule_from_agenda(id);

        // Detach the rule binding and flush the activation bases, then
        // delete unshared joins bottom-up; a kept (shared) join keeps every
        // ancestor alive, so the walk stops at the first one.
        for &join in rule.joins.iter().rev() {
            if !self.network.joins.contains(join) {
                continue;
            }
            if self.network.joins[join].rule == Some(rule_token(id)) {
                self.network.joins[join].rule = None;
                let mut cursor = self.network.joins[join].terminal_matches;
                while let Some(pm) = cursor {
                    cursor = self.network.pms[pm].next_in_memory;
                    self.network.unlink_terminal_match(join, pm);
                    self.network.discard_pm_links(pm);
                    self.network.retire_pm(pm);
                }
            }
            let removable = self.network.joins[join].children.is_empty()
                && self.network.joins[join].rule.is_none();
            if !removable {
                break;
            }
            self.network
                .remove_join(&mut self.exprs, &mut self.atoms, join)?;
        }

        // Release pattern terminals (shared ones just drop a use count).
        for &terminal in &rule.terminals {
            if !self.network.patterns.terminals.contains(terminal) {
                continue;
            }
            let template = self.network.patterns.terminals[terminal].template;
            let template_name = self.templates.get(template).map(|t| t.header.name);
            let parser = template_name.and_then(|name| self.parsers.find(self, name));
            match parser {
                Some(parser) => self.parser_remove_pattern(parser, terminal),
                None => self.network.patterns.detach_terminal(
                    &mut self.exprs,
                    &mut self.atoms,
                    &mut self.network.pms,
                    terminal,
                ),
            }
        }

        if let Some(expr) = rule.dynamic_salience {
            self.exprs.release_hashed(expr, &mut self.atoms);
        }
        if let Some(expr) = rule.actions {
            self.exprs.release_hashed(expr, &mut self.atoms);
        }
        self.atoms.release(rule.header.name);
        self.atoms.sweep();
        info!(rule = ?id, "rule removed");
        Ok(())
    }

    /// Partial-match count in each of a rule's join left memories
    /// (join-memory introspection).
    pub fn join_memory_counts(&self, rule: RuleId) -> Vec<usize> {
        self.rules
            .get(rule)
            .map(|r| {
                r.joins
                    .iter()
                    .map(|&j| self.network.joins[j].left_mem.count())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The join chain of a rule.
    pub fn rule_joins(&self, rule: RuleId) -> Vec<JoinId> {
        self.rules
            .get(rule)
            .map(|r| r.joins.clone())
            .unwrap_or_default()
    }

    // Search for an existing join with an identical signature at this level.
    // The last join of a rule never shares a join that already activates
    // another rule; an identical-LHS rule gets its own terminal join.
    #[allow(clippy::too_many_arguments)]
    fn find_shared_join(
        &self,
        left_parent: Option<JoinId>,
        terminal: TerminalId,
        kind: JoinKind,
        network_test: Option<HashedExprId>,
        left_hash: Option<HashedExprId>,
        right_hash: Option<HashedExprId>,
        is_last: bool,
    ) -> Option<JoinId> {
        let candidates: Vec<JoinId> = match left_parent {
            None => self
                .network
                .patterns
                .terminals
                .get(terminal)?
                .joins
                .iter()
                .copied()
                .filter(|&j| self.network.joins[j].first_join)
                .collect(),
            Some(parent) => self.network.joins[parent]
                .children
                .iter()
                .filter(|(_, side)| *side == Side::Left)
                .map(|(j, _)| *j)
                .collect(),
        };
        candidates.into_iter().find(|&j| {
            let join = &self.network.joins[j];
            join.kind == kind
                && join.right_input == RightInput::Alpha(terminal)
                && join.left_parent == left_parent
                && join.network_test == network_test
                && join.secondary_test.is_none()
                && join.left_hash == left_hash
                && join.right_hash == right_hash
                && !(is_last && join.rule.is_some())
        })
    }

    // Add one pattern through the parser registry, tracking fresh terminals.
    fn install_pattern(
        &mut self,
        template: TemplateId,
        parsed: ParsedPattern,
        fresh_terminals: &mut Vec<TerminalId>,
    ) -> EngineResult<TerminalId> {
        let template_name = self
            .templates
            .get(template)
            .map(|t| t.header.name)
            .ok_or_else(|| EngineError::UnknownTemplate("<removed>".to_owned()))?;
        let parser = self
            .parsers
            .find(self, template_name)
            .ok_or_else(|| EngineError::Parse("no pattern parser".to_owned()))?;
        let known_before = self.network.patterns.relevant_terminals(template).to_vec();
        let terminal = self.parser_add_pattern(parser, parsed)?;
        if !known_before.contains(&terminal) {
            fresh_terminals.push(terminal);
        }
        Ok(terminal)
    }

    // Variable analysis over the whole LHS.
    fn analyze(&mut self, def: &RuleDef) -> EngineResult<Vec<AnalyzedCe>> {
        let mut conditions: Vec<Condition> = def.conditions.clone();
        let has_pattern = conditions
            .iter()
            .any(|c| matches!(c, Condition::Pattern(_) | Condition::Forall(..)));
        if !has_pattern {
            // A test-only LHS matches against the initial fact.
            conditions.insert(
                0,
                Condition::Pattern(PatternSpec {
                    template: "initial-fact".to_owned(),
                    kind: CeKind::Pattern,
                    slots: Vec::new(),
                }),
            );
        }

        let mut bindings: FxHashMap<String, Binding> = FxHashMap::default();
        let mut analyzed: Vec<AnalyzedCe> = Vec::new();
        let mut pattern_index: u16 = 0;

        for condition in &conditions {
            match condition {
                Condition::Pattern(spec) => {
                    let pattern = self.analyze_pattern(spec, pattern_index, &mut bindings)?;
                    analyzed.push(AnalyzedCe::Single(pattern));
                    pattern_index += 1;
                }
                Condition::Forall(all, satisfy) => {
                    // The group's variables are scoped to its own subnetwork
                    // tuple: `all` binds at index 0, `satisfy` joins at 1.
                    let mut group_bindings: FxHashMap<String, Binding> = FxHashMap::default();
                    let all_pattern = self.analyze_pattern(all, 0, &mut group_bindings)?;
                    let satisfy_pattern =
                        self.analyze_pattern(satisfy, 1, &mut group_bindings)?;
                    analyzed.push(AnalyzedCe::Forall(all_pattern, satisfy_pattern));
                    // The group occupies one (empty) bind slot in the rule's
                    // tuple.
                    pattern_index += 1;
                }
                Condition::Test(spec) => {
                    let expr = self.build_test_expr(
                        spec,
                        &bindings,
                        pattern_index.saturating_sub(1),
                    )?;
                    let target = match analyzed.last_mut() {
                        Some(AnalyzedCe::Single(pattern)) => pattern,
                        Some(AnalyzedCe::Forall(..)) => {
                            return Err(EngineError::Parse(
                                "test CE cannot follow a forall group".to_owned(),
                            ))
                        }
                        None => {
                            return Err(EngineError::Parse(
                                "test CE before any pattern".to_owned(),
                            ))
                        }
                    };
                    target.join_test = match target.join_test.take() {
                        None => Some(expr),
                        Some(previous) => {
                            let and = self.func_id("and")?;
                            Some(self.exprs.alloc_call(and, &[previous, expr]))
                        }
                    };
                }
            }
        }
        Ok(analyzed)
    }

    // Analysis for one pattern CE.
    fn analyze_pattern(
        &mut self,
        spec: &PatternSpec,
        pattern_index: u16,
        bindings: &mut FxHashMap<String, Binding>,
    ) -> EngineResult<AnalyzedPattern> {
        let module = self.modules.current;
        let template_name = self.atoms.intern_symbol(&spec.template);
        let template = self
            .templates
            .find(module, template_name)
            .ok_or_else(|| EngineError::UnknownTemplate(spec.template.clone()))?;

        // Unknown slot names are constraint violations.
        for (name, _) in &spec.slots {
            let name_atom = self.atoms.intern_symbol(name);
            let known = self
                .templates
                .get(template)
                .map(|t| t.slot_index(name_atom).is_some())
                .unwrap_or(false);
            if !known {
                return Err(EngineError::ConstraintViolation(format!(
                    "template {} has no slot {}",
                    spec.template, name
                )));
            }
        }

        let slot_count = self
            .templates
            .get(template)
            .map(|t| t.slots.len())
            .unwrap_or(0);

        // Variables bound inside a not/exists group stay local to it.
        let mut frame = match spec.kind {
            CeKind::Pattern => None,
            CeKind::Not | CeKind::Exists => Some(NandFrame { locals: Vec::new() }),
        };

        let eq = self.func_id("eq")?;
        let mut tests: Vec<FieldTest> = Vec::new();
        let mut join_conjuncts: Vec<ExprId> = Vec::new();
        let mut left_hash: Option<ExprId> = None;
        let mut right_hash: Option<ExprId> = None;
        let mut local_bindings: FxHashMap<String, (u16, u16)> = FxHashMap::default();

        for slot_index in 0..slot_count {
            let (slot_name, multifield, allowed) = {
                let template = match self.templates.get(template) {
                    Some(t) => t,
                    None => return Err(EngineError::UnknownTemplate(spec.template.clone())),
                };
                let slot = &template.slots[slot_index];
                (slot.name, slot.multifield, slot.allowed)
            };
            let provided = spec
                .slots
                .iter()
                .find(|(name, _)| self.atoms.find_symbol(name) == Some(slot_name))
                .map(|(_, term)| term.clone());

            let slot = slot_index as u16;
            let mut field_test = FieldTest {
                slot,
                field: 0,
                multifield,
                leave_fields: 0,
                end_slot: true,
                selector: None,
                test: None,
            };

            match provided {
                None | Some(Term::Any) | Some(Term::Rest) => {
                    // Wildcard node; multifield slots bind the whole span.
                }
                Some(Term::Lit(lit)) => {
                    let atom = lit.intern(&mut self.atoms);
                    let kind = self.atoms.kind(atom);
                    if !allowed.contains(kind) {
                        return Err(EngineError::ConstraintViolation(format!(
                            "slot {} rejects {:?} values",
                            slot_index, kind
                        )));
                    }
                    field_test.multifield = false;
                    field_test.selector = Some(atom);
                    let access = self.exprs.alloc(ExprValue::GetRhsField { slot, field: 0 });
                    let constant = self.exprs.alloc(ExprValue::Atom(atom));
                    field_test.test = Some(self.exprs.alloc_call(eq, &[access, constant]));
                }
                Some(Term::Var(name)) => {
                    field_test.multifield = false;
                    if let Some(&(first_slot, first_field)) = local_bindings.get(&name) {
                        // Repeat within this pattern: intra-pattern test.
                        let here = self.exprs.alloc(ExprValue::GetRhsField { slot, field: 0 });
                        let there = self.exprs.alloc(ExprValue::GetRhsField {
                            slot: first_slot,
                            field: first_field,
                        });
                        field_test.test = Some(self.exprs.alloc_call(eq, &[here, there]));
                    } else if let Some(binding) = bindings.get(&name).copied() {
                        // Bound by an earlier pattern: join test plus the
                        // matched left/right hash pair.
                        let left = self.exprs.alloc(ExprValue::GetLhsField {
                            pattern: binding.pattern,
                            slot: binding.slot,
                            field: binding.field,
                        });
                        let right = self.exprs.alloc(ExprValue::GetRhsField { slot, field: 0 });
                        join_conjuncts.push(self.exprs.alloc_call(eq, &[left, right]));
                        if left_hash.is_none() {
                            left_hash = Some(self.exprs.alloc(ExprValue::GetLhsField {
                                pattern: binding.pattern,
                                slot: binding.slot,
                                field: binding.field,
                            }));
                            right_hash =
                                Some(self.exprs.alloc(ExprValue::GetRhsField { slot, field: 0 }));
                        }
                        local_bindings.insert(name.clone(), (slot, 0));
                    } else {
                        // First binding.
                        local_bindings.insert(name.clone(), (slot, 0));
                        match &mut frame {
                            Some(frame) => frame.locals.push(name.clone()),
                            None => {
                                bindings.insert(
                                    name.clone(),
                                    Binding {
                                        pattern: pattern_index,
                                        slot,
                                        field: 0,
                                    },
                                );
                            }
                        }
                    }
                }
            }
            tests.push(field_test);
        }

        // A pattern over a slotless template still needs one walkable node;
        // the bare wildcard passes regardless of the entity's shape.
        if tests.is_empty() {
            tests.push(FieldTest {
                slot: 0,
                field: 0,
                multifield: false,
                leave_fields: 0,
                end_slot: false,
                selector: None,
                test: None,
            });
        }

        let join_test = self.conjoin(join_conjuncts)?;

        Ok(AnalyzedPattern {
            template,
            kind: spec.kind,
            parsed: ParsedPattern {
                template,
                tests,
                right_hash,
            },
            join_test,
            left_hash,
            // The terminal owns the right-hash; joins on a shared alpha
            // memory read the hash the terminal computed.
            right_hash: None,
        })
    }

    fn conjoin(&mut self, mut conjuncts: Vec<ExprId>) -> EngineResult<Option<ExprId>> {
        Ok(match conjuncts.len() {
            0 => None,
            1 => conjuncts.pop(),
            _ => {
                let and = self.func_id("and")?;
                Some(self.exprs.alloc_call(and, &conjuncts))
            }
        })
    }

    // Expression for a test CE. Variables bound by pattern `rhs_pattern`
    // read from the right side; everything else reads from the left.
    fn build_test_expr(
        &mut self,
        spec: &TestSpec,
        bindings: &FxHashMap<String, Binding>,
        rhs_pattern: u16,
    ) -> EngineResult<ExprId> {
        let func = self.func_id(&spec.func)?;
        let mut args: Vec<ExprId> = Vec::new();
        for term in &spec.args {
            let arg = match term {
                Term::Lit(lit) => {
                    let atom = lit.intern(&mut self.atoms);
                    self.exprs.alloc(ExprValue::Atom(atom))
                }
                Term::Var(name) => {
                    let binding = bindings
                        .get(name)
                        .copied()
                        .ok_or_else(|| EngineError::UnboundVariable(name.clone()))?;
                    if binding.pattern == rhs_pattern {
                        self.exprs.alloc(ExprValue::GetRhsField {
                            slot: binding.slot,
                            field: binding.field,
                        })
                    } else {
                        self.exprs.alloc(ExprValue::GetLhsField {
                            pattern: binding.pattern,
                            slot: binding.slot,
                            field: binding.field,
                        })
                    }
                }
                Term::Any | Term::Rest => {
                    return Err(EngineError::Parse("wildcard in test expression".to_owned()))
                }
            };
            args.push(arg);
        }
        Ok(self.exprs.alloc_call(func, &args))
    }

    // Bindings visible to a dynamic salience expression (whole LHS).
    fn salience_bindings(&mut self, def: &RuleDef) -> EngineResult<FxHashMap<String, Binding>> {
        let mut bindings: FxHashMap<String, Binding> = FxHashMap::default();
        let mut pattern_index: u16 = 0;
        for condition in &def.conditions {
            if let Condition::Forall(..) = condition {
                pattern_index += 1;
                continue;
            }
            if let Condition::Pattern(spec) = condition {
                if spec.kind == CeKind::Pattern {
                    let module = self.modules.current;
                    let template_name = self.atoms.intern_symbol(&spec.template);
                    if let Some(template) = self.templates.find(module, template_name) {
                        for (slot_name, term) in &spec.slots {
                            if let Term::Var(var) = term {
                                let atom = self.atoms.intern_symbol(slot_name);
                                let slot = self
                                    .templates
                                    .get(template)
                                    .and_then(|t| t.slot_index(atom));
                                if let Some(slot) = slot {
                                    bindings.entry(var.clone()).or_insert(Binding {
                                        pattern: pattern_index,
                                        slot: slot as u16,
                                        field: 0,
                                    });
                                }
                            }
                        }
                    }
                }
                pattern_index += 1;
            }
        }
        Ok(bindings)
    }

    pub(crate) fn func_id(&mut self, name: &str) -> EngineResult<FuncId> {
        let atom = self.atoms.intern_symbol(name);
        self.functions.lookup(atom).ok_or_else(|| {
            crate::route_error(COMPONENT_COMPILE, 2, &format!("unknown function {name}"));
            EngineError::Parse(format!("unknown function {name}"))
        })
    }
}
