//! Agenda: per-module activation lists in strategy order
//!
//! Activations are partitioned into salience groups (primary key, sorted
//! descending); locating a group is a binary search over distinct saliences
//! and ordering within a group is strategy-dependent.

use crate::compile::RuleId;
use crate::eval::EvalContext;
use crate::{Engine, COMPONENT_AGENDA};
use rete::{EntityId, PartialMatchId};
use rule_model::arena::{Arena, Id};
use rule_model::module::ModuleId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

/// Highest legal salience.
pub const MAX_SALIENCE: i32 = 10_000;
/// Lowest legal salience.
pub const MIN_SALIENCE: i32 = -10_000;

/// Handle to an activation.
pub type ActivationId = Id<Activation>;

/// Conflict-resolution strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Newest activation first (default)
    Depth,
    /// Oldest activation first
    Breadth,
    /// Recency of all basis facts, lexicographically
    Lex,
    /// Recency of the first pattern's fact, then LEX
    Mea,
    /// Highest rule complexity first
    Complexity,
    /// Lowest rule complexity first
    Simplicity,
    /// Per-activation random draw
    Random,
}

/// When dynamic salience expressions are evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SalienceEvaluation {
    /// Once, at rule definition
    WhenDefined,
    /// At each activation
    WhenActivated,
    /// Before every fire
    EveryCycle,
}

/// An activation: a (rule, basis) pair eligible to fire.
pub struct Activation {
    /// Rule to fire
    pub rule: RuleId,
    /// Basis partial match
    pub basis: PartialMatchId,
    /// Salience at insertion
    pub salience: i32,
    /// Agenda-insertion timetag (monotone)
    pub timetag: u64,
    /// Draw used by the random strategy
    pub random_id: u32,
    /// Module whose agenda holds this activation
    pub module: ModuleId,
    /// Previous activation in the salience group
    pub prev: Option<ActivationId>,
    /// Next activation in the salience group
    pub next: Option<ActivationId>,
}

/// One salience group: a doubly-linked run of equal-salience activations.
pub struct SalienceGroup {
    /// Salience shared by the group
    pub salience: i32,
    /// First (next to fire) activation
    pub first: Option<ActivationId>,
    /// Last activation
    pub last: Option<ActivationId>,
}

/// All per-module agendas.
pub struct AgendaSet {
    /// Activation arena
    pub activations: Arena<Activation>,
    groups: FxHashMap<ModuleId, Vec<SalienceGroup>>,
    next_timetag: u64,
}

/// Splitmix-style generator backing activation random ids.
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Seeded generator; zero seeds are nudged.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed },
        }
    }

    /// Next draw.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }
}

/// Pack an activation id into the opaque token partial matches carry.
pub fn activation_token(id: ActivationId) -> u64 {
    ((id.index() as u64) << 32) | u64::from(id.generation())
}

/// Unpack an activation token.
pub fn token_activation(token: u64) -> ActivationId {
    Id::from_raw_parts((token >> 32) as u32, token as u32)
}

impl AgendaSet {
    /// Empty agenda set.
    pub fn new() -> Self {
        Self {
            activations: Arena::new(),
            groups: FxHashMap::default(),
            next_timetag: 1,
        }
    }

    /// Number of activations pending in one module's agenda.
    pub fn len(&self, module: ModuleId) -> usize {
        let mut count = 0;
        if let Some(groups) = self.groups.get(&module) {
            for group in groups {
                let mut cursor = group.first;
                while let Some(id) = cursor {
                    count += 1;
                    cursor = self.activations[id].next;
                }
            }
        }
        count
    }

    /// True when a module's agenda is empty.
    pub fn is_empty(&self, module: ModuleId) -> bool {
        self.groups
            .get(&module)
            .map(|groups| groups.is_empty())
            .unwrap_or(true)
    }

    /// Activations of one module in firing order.
    pub fn order(&self, module: ModuleId) -> Vec<ActivationId> {
        let mut out = Vec::new();
        if let Some(groups) = self.groups.get(&module) {
            for group in groups {
                let mut cursor = group.first;
                while let Some(id) = cursor {
                    out.push(id);
                    cursor = self.activations[id].next;
                }
            }
        }
        out
    }

    /// Next agenda timetag.
    pub fn take_timetag(&mut self) -> u64 {
        let tag = self.next_timetag;
        self.next_timetag += 1;
        tag
    }

    // Locate (or create) the group for a salience. Groups are sorted by
    // descending salience; lookup is a binary search.
    fn group_index(&mut self, module: ModuleId, salience: i32) -> usize {
        let groups = self.groups.entry(module).or_default();
        match groups.binary_search_by(|g| salience.cmp(&g.salience)) {
            Ok(index) => index,
            Err(index) => {
                groups.insert(
                    index,
                    SalienceGroup {
                        salience,
                        first: None,
                        last: None,
                    },
                );
                index
            }
        }
    }

    fn unlink(&mut self, id: ActivationId) {
        let (module, salience, prev, next) = {
            let activation = &self.activations[id];
            (
                activation.module,
                activation.salience,
                activation.prev,
                activation.next,
            )
        };
        match prev {
            Some(prev) => self.activations[prev].next = next,
            None => {
                if let Some(groups) = self.groups.get_mut(&module) {
                    if let Ok(index) = groups.binary_search_by(|g| salience.cmp(&g.salience)) {
                        groups[index].first = next;
                    }
                }
            }
        }
        match next {
            Some(next) => self.activations[next].prev = prev,
            None => {
                if let Some(groups) = self.groups.get_mut(&module) {
                    if let Ok(index) = groups.binary_search_by(|g| salience.cmp(&g.salience)) {
                        groups[index].last = prev;
                    }
                }
            }
        }
        // Drop the group when it empties.
        if let Some(groups) = self.groups.get_mut(&module) {
            if let Ok(index) = groups.binary_search_by(|g| salience.cmp(&g.salience)) {
                if groups[index].first.is_none() {
                    groups.remove(index);
                }
            }
            if groups.is_empty() {
                self.groups.remove(&module);
            }
        }
        let activation = &mut self.activations[id];
        activation.prev = None;
        activation.next = None;
    }

    /// Drop all agendas (clear/load path).
    pub fn reset(&mut self) {
        self.activations.clear();
        self.groups.clear();
        self.next_timetag = 1;
    }
}

impl Default for AgendaSet {
    fn default() -> Self {
        Self::new()
    }
}

/// What `fire_next` hands back; action evaluation is the caller's concern.
#[derive(Debug)]
pub struct Fired {
    /// Rule that fired
    pub rule: RuleId,
    /// Rule name text
    pub rule_name: String,
    /// Basis entity per pattern (None for not-CE slots)
    pub bindings: Vec<Option<EntityId>>,
    /// Salience the activation fired at
    pub salience: i32,
}

impl Engine {
    /// Create an activation for a terminal emission and insert it in
    /// strategy order.
    pub(crate) fn add_activation(&mut self, rule: RuleId, basis: PartialMatchId) {
        let module = match self.rules.get(rule) {
            Some(r) => r.header.module,
            None => return,
        };
        let salience = self.activation_salience(rule, basis);
        let timetag = self.agenda.take_timetag();
        let random_id = self.rng.next_u32();
        let id = self.agenda.activations.insert(Activation {
            rule,
            basis,
            salience,
            timetag,
            random_id,
            module,
            prev: None,
            next: None,
        });
        self.network.pms[basis].activation = Some(activation_token(id));
        self.insert_in_order(module, id);
        debug!(rule = ?rule, salience, "activation added");
    }

    /// Remove the activation a basis match carries, if any.
    pub(crate) fn remove_activation_of(&mut self, basis: PartialMatchId) {
        let token = match self.network.pms.get(basis).and_then(|pm| pm.activation) {
            Some(token) => token,
            None => return,
        };
        self.network.pms[basis].activation = None;
        let id = token_activation(token);
        if self.agenda.activations.contains(id) {
            self.agenda.unlink(id);
            self.agenda.activations.remove(id);
            debug!("activation removed");
        }
    }

    /// Remove every activation of a rule (rule removal, refresh).
    pub(crate) fn clear_rule_from_agenda(&mut self, rule: RuleId) {
        let ids: Vec<ActivationId> = self
            .agenda
            .activations
            .iter()
            .filter(|(_, a)| a.rule == rule)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            let basis = self.agenda.activations[id].basis;
            if let Some(pm) = self.network.pms.get_mut(basis) {
                pm.activation = None;
            }
            self.agenda.unlink(id);
            self.agenda.activations.remove(id);
        }
    }

    /// Pop the highest-priority activation of the current module.
    pub fn fire_next(&mut self) -> Option<Fired> {
        let module = self.modules.current;
        if self.config.salience_evaluation == SalienceEvaluation::EveryCycle {
            self.reevaluate_saliences(module);
        }
        let first = {
            let groups = self.agenda.groups.get(&module)?;
            groups.first()?.first?
        };
        let (rule, basis, salience) = {
            let activation = &self.agenda.activations[first];
            (activation.rule, activation.basis, activation.salience)
        };
        self.agenda.unlink(first);
        self.agenda.activations.remove(first);
        if let Some(pm) = self.network.pms.get_mut(basis) {
            pm.activation = None;
        }
        let rule_name = self
            .rules
            .get(rule)
            .and_then(|r| self.atoms.lexeme_text(r.header.name).map(str::to_owned))
            .unwrap_or_default();
        let bindings = self
            .network
            .pms
            .get(basis)
            .map(|pm| pm.binds.iter().map(|b| b.entity).collect())
            .unwrap_or_default();
        Some(Fired {
            rule,
            rule_name,
            bindings,
            salience,
        })
    }

    /// Re-evaluate every activation of a rule and re-insert in new order.
    pub fn refresh(&mut self, rule: RuleId) {
        let ids: Vec<ActivationId> = self
            .agenda
            .activations
            .iter()
            .filter(|(_, a)| a.rule == rule)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            let (module, basis) = {
                let activation = &self.agenda.activations[id];
                (activation.module, activation.basis)
            };
            self.agenda.unlink(id);
            let salience = self.activation_salience(rule, basis);
            self.agenda.activations[id].salience = salience;
            self.insert_in_order(module, id);
        }
    }

    /// Rebuild one module's agenda order (strategy change).
    pub fn reorder_agenda(&mut self, module: ModuleId) {
        let ids = self.agenda.order(module);
        for &id in &ids {
            self.agenda.unlink(id);
        }
        for id in ids {
            self.insert_in_order(module, id);
        }
    }

    fn reevaluate_saliences(&mut self, module: ModuleId) {
        let ids = self.agenda.order(module);
        for id in ids {
            let (rule, basis) = {
                let activation = &self.agenda.activations[id];
                (activation.rule, activation.basis)
            };
            let salience = self.activation_salience(rule, basis);
            if salience != self.agenda.activations[id].salience {
                self.agenda.unlink(id);
                self.agenda.activations[id].salience = salience;
                self.insert_in_order(module, id);
            }
        }
    }

    // Salience for a new or refreshed activation, honouring the evaluation
    // mode. A dynamic-salience evaluation error pins the value at the last
    // successful evaluation (static salience if none succeeded yet).
    fn activation_salience(&mut self, rule: RuleId, basis: PartialMatchId) -> i32 {
        let (static_salience, dynamic, last_good) = match self.rules.get(rule) {
            Some(r) => (r.salience, r.dynamic_salience, r.last_dynamic_salience),
            None => return 0,
        };
        let dynamic = match dynamic {
            Some(expr) if self.config.salience_evaluation != SalienceEvaluation::WhenDefined => {
                expr
            }
            _ => return static_salience,
        };
        let root = self.exprs.hashed_root(dynamic);
        let mut ctx = EvalContext {
            lhs: Some(basis),
            ..EvalContext::default()
        };
        let value = self.eval(&mut ctx, root);
        if ctx.error {
            self.eval_error = true;
        }
        let computed = match value {
            Some(crate::eval::EvalValue::Int(v)) => Some(v as i32),
            Some(crate::eval::EvalValue::Atom(a)) => {
                self.atoms.integer_value(a).map(|v| v as i32)
            }
            _ => None,
        };
        match computed {
            Some(v) => {
                let clamped = v.clamp(MIN_SALIENCE, MAX_SALIENCE);
                if let Some(r) = self.rules.get_mut(rule) {
                    r.last_dynamic_salience = Some(clamped);
                }
                clamped
            }
            None => {
                crate::route_error(
                    COMPONENT_AGENDA,
                    1,
                    "dynamic salience evaluation failed; keeping previous value",
                );
                last_good.unwrap_or(static_salience)
            }
        }
    }

    fn insert_in_order(&mut self, module: ModuleId, id: ActivationId) {
        let salience = self.agenda.activations[id].salience;
        let group_index = self.agenda.group_index(module, salience);
        let (mut cursor, last) = {
            let group = &self.agenda.groups[&module][group_index];
            (group.first, group.last)
        };
        while let Some(member) = cursor {
            if self.comes_before(id, member) {
                // Insert before `member`.
                let prev = self.agenda.activations[member].prev;
                self.agenda.activations[id].next = Some(member);
                self.agenda.activations[id].prev = prev;
                self.agenda.activations[member].prev = Some(id);
                match prev {
                    Some(prev) => self.agenda.activations[prev].next = Some(id),
                    None => {
                        if let Some(groups) = self.agenda.groups.get_mut(&module) {
                            groups[group_index].first = Some(id);
                        }
                    }
                }
                return;
            }
            cursor = self.agenda.activations[member].next;
        }
        // Append at the tail.
        self.agenda.activations[id].prev = last;
        self.agenda.activations[id].next = None;
        match last {
            Some(last) => self.agenda.activations[last].next = Some(id),
            None => {
                if let Some(groups) = self.agenda.groups.get_mut(&module) {
                    groups[group_index].first = Some(id);
                }
            }
        }
        if let Some(groups) = self.agenda.groups.get_mut(&module) {
            groups[group_index].last = Some(id);
        }
    }

    // Strategy order within a salience group.
    fn comes_before(&self, new: ActivationId, existing: ActivationId) -> bool {
        let a = &self.agenda.activations[new];
        let b = &self.agenda.activations[existing];
        match self.config.strategy {
            Strategy::Depth => a.timetag > b.timetag,
            Strategy::Breadth => a.timetag < b.timetag,
            Strategy::Lex => self.lex_before(a, b),
            Strategy::Mea => {
                let fa = self.first_pattern_timetag(a.basis);
                let fb = self.first_pattern_timetag(b.basis);
                match fa.cmp(&fb) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => self.lex_before(a, b),
                }
            }
            Strategy::Complexity => {
                let ca = self.rule_complexity(a.rule);
                let cb = self.rule_complexity(b.rule);
                ca > cb || (ca == cb && a.timetag > b.timetag)
            }
            Strategy::Simplicity => {
                let ca = self.rule_complexity(a.rule);
                let cb = self.rule_complexity(b.rule);
                ca < cb || (ca == cb && a.timetag > b.timetag)
            }
            Strategy::Random => a.random_id > b.random_id,
        }
    }

    fn lex_before(&self, a: &Activation, b: &Activation) -> bool {
        let ta = self.basis_timetags(a.basis);
        let tb = self.basis_timetags(b.basis);
        for (x, y) in ta.iter().zip(tb.iter()) {
            if x != y {
                return x > y;
            }
        }
        if ta.len() != tb.len() {
            return ta.len() > tb.len();
        }
        let ca = self.rule_complexity(a.rule);
        let cb = self.rule_complexity(b.rule);
        if ca != cb {
            return ca > cb;
        }
        a.timetag > b.timetag
    }

    // Basis fact timetags, sorted descending.
    fn basis_timetags(&self, basis: PartialMatchId) -> SmallVec<[u64; 4]> {
        let mut tags: SmallVec<[u64; 4]> = SmallVec::new();
        if let Some(pm) = self.network.pms.get(basis) {
            for bind in &pm.binds {
                if let Some(entity) = bind.entity {
                    if let Some(fact) = self.facts.get(entity) {
                        tags.push(fact.timetag);
                    }
                }
            }
        }
        tags.sort_unstable_by(|x, y| y.cmp(x));
        tags
    }

    fn first_pattern_timetag(&self, basis: PartialMatchId) -> u64 {
        self.network
            .pms
            .get(basis)
            .and_then(|pm| pm.binds.first())
            .and_then(|bind| bind.entity)
            .and_then(|entity| self.facts.get(entity))
            .map(|fact| fact.timetag)
            .unwrap_or(0)
    }

    fn rule_complexity(&self, rule: RuleId) -> u32 {
        self.rules.get(rule).map(|r| r.complexity).unwrap_or(0)
    }
}
