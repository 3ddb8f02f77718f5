//! Propagation: driving entities through the alpha and join networks
//!
//! Ordering contract: all of an entity's alpha-memory insertions happen
//! before any beta propagation for that entity; sibling joins see events in
//! left-to-right order; within a retraction every affected activation leaves
//! the agenda before its partial matches are reclaimed (reclamation is
//! deferred to drive depth zero).

use crate::compile::token_rule;
use crate::eval::{hash_eval_value, EvalContext};
use crate::{Engine, EngineError, EngineResult, COMPONENT_RETE};
use rete::{
    attach_blocker, detach_blocker, link_lineage, Bind, EntityId, JoinId, JoinKind, MemoryRef,
    Owner, PartialMatch, PartialMatchId, PatternNodeId, Side, SlotMarker, TerminalId,
};
use rule_model::template::TemplateId;
use rule_model::value::Value;
use smallvec::SmallVec;
use tracing::{debug, trace};

// One terminal reached by an entity's pattern-network walk.
struct AlphaHit {
    terminal: TerminalId,
    markers: SmallVec<[SlotMarker; 2]>,
}

impl Engine {
    /// Assert a fact built from positional slot values.
    ///
    /// Returns the existing id without propagation when an equal fact is
    /// already asserted (duplicate assertion is a no-op).
    pub fn assert_values(
        &mut self,
        template: TemplateId,
        slots: Vec<Value>,
    ) -> EngineResult<EntityId> {
        let slot_count = self
            .templates
            .get(template)
            .map(|t| t.slots.len())
            .ok_or_else(|| EngineError::UnknownTemplate(format!("{:?}", template)))?;
        if slots.len() != slot_count {
            return Err(EngineError::ConstraintViolation(format!(
                "expected {} slots, got {}",
                slot_count,
                slots.len()
            )));
        }
        for (index, value) in slots.iter().enumerate() {
            let allowed = self.templates.get(template).map(|t| t.slots[index].allowed);
            if let (Some(allowed), Value::Atom(atom)) = (allowed, value) {
                if !allowed.contains(self.atoms.kind(*atom)) {
                    return Err(EngineError::ConstraintViolation(format!(
                        "slot {index} rejects this value kind"
                    )));
                }
            }
        }
        if let Some(existing) = self.facts.find_equal(&self.atoms, template, &slots) {
            trace!(fact = ?existing, "duplicate assertion ignored");
            return Ok(existing);
        }
        for value in &slots {
            value.retain_all(&mut self.atoms);
        }
        let id = self.facts.insert(&self.atoms, template, slots);
        debug!(fact = ?id, "assert");

        self.network.begin_drive();
        self.alpha_drive(id, false);
        self.network.end_drive();
        self.atoms.sweep();
        Ok(id)
    }

    /// Retract a fact. Retracting an id that is no longer live is a no-op
    /// (retraction is idempotent).
    pub fn retract(&mut self, id: EntityId) -> EngineResult<bool> {
        let alpha_matches = match self.facts.get_mut(id) {
            Some(fact) => std::mem::take(&mut fact.alpha_matches),
            None => return Ok(false),
        };
        debug!(fact = ?id, "retract");

        self.network.begin_drive();
        for pm in alpha_matches {
            if self.network.pms.contains(pm) {
                self.delete_cascade(pm);
            }
        }
        self.network.end_drive();

        if let Some(fact) = self.facts.remove(&self.atoms, id) {
            for value in &fact.slots {
                value.release_all(&mut self.atoms);
            }
        }
        self.atoms.sweep();
        Ok(true)
    }

    /// Rebuild all match state from scratch (image load): every first join
    /// re-drives its empty left match, then every fact is driven through
    /// the pattern network in assertion order. Memories, blockers, and the
    /// agenda come out identical to a define-rules-then-assert ordering.
    pub fn repropagate_all_facts(&mut self) {
        self.network.begin_drive();
        let first_joins: Vec<JoinId> = self
            .network
            .joins
            .iter()
            .filter(|(_, join)| join.first_join)
            .map(|(id, _)| id)
            .collect();
        for join in first_joins {
            if let Some(empty) = self.network.joins[join].empty_left {
                self.network_assert_left(empty, join);
            }
        }
        for fact in self.facts.ids() {
            self.alpha_drive(fact, false);
        }
        self.network.end_drive();
        self.atoms.sweep();
    }

    /// Drive one entity through the pattern network: collect the alpha
    /// terminals it reaches, insert all alpha entries, then propagate each
    /// to the joins (alpha first, beta next).
    ///
    /// With `initialize_only`, insertion is restricted to terminals carrying
    /// the incremental-reset mark; established paths are idempotent no-ops.
    pub(crate) fn alpha_drive(&mut self, entity: EntityId, initialize_only: bool) {
        let template = match self.facts.get(entity) {
            Some(fact) => fact.template,
            None => return,
        };
        let hits = self.walk_pattern_network(entity, template);

        // Phase 1: all alpha-memory insertions.
        let mut inserted: SmallVec<[PartialMatchId; 4]> = SmallVec::new();
        for hit in hits {
            if initialize_only && !self.network.patterns.terminals[hit.terminal].initialize {
                continue;
            }
            let mut bind = Bind::entity(entity);
            bind.markers = hit.markers;
            let mut pm = PartialMatch::new(Owner::Terminal(hit.terminal), SmallVec::from_iter([bind]));
            pm.rhs_memory = true;
            let pm = self.network.pms.insert(pm);
            let hash = self.right_hash_of(hit.terminal, pm);
            self.network.pms[pm].hash_value = hash;
            self.network.insert_pm(MemoryRef::Alpha(hit.terminal), pm);
            if let Some(fact) = self.facts.get_mut(entity) {
                fact.alpha_matches.push(pm);
            }
            inserted.push(pm);
        }

        // Phase 2: beta propagation in terminal order, joins in sibling
        // order.
        for pm in inserted {
            let terminal = match self.network.pms[pm].owner {
                Owner::Terminal(t) => t,
                Owner::Join(_) => continue,
            };
            let joins = self.network.patterns.terminals[terminal].joins.clone();
            for join in joins {
                self.network_assert_right(pm, join);
            }
        }
    }

    fn right_hash_of(&mut self, terminal: TerminalId, pm: PartialMatchId) -> u64 {
        let expr = match self.network.patterns.terminals[terminal].right_hash {
            Some(expr) => self.exprs.hashed_root(expr),
            None => return 0,
        };
        let mut ctx = EvalContext {
            rhs: Some(pm),
            ..EvalContext::default()
        };
        let hash = self
            .eval(&mut ctx, expr)
            .map(|value| hash_eval_value(self, &value))
            .unwrap_or(0);
        if ctx.error {
            self.eval_error = true;
        }
        hash
    }

    pub(crate) fn left_hash_of(&mut self, join: JoinId, pm: PartialMatchId) -> u64 {
        let expr = match self.network.joins[join].left_hash {
            Some(expr) => self.exprs.hashed_root(expr),
            None => return 0,
        };
        let mut ctx = EvalContext {
            lhs: Some(pm),
            ..EvalContext::default()
        };
        let hash = self
            .eval(&mut ctx, expr)
            .map(|value| hash_eval_value(self, &value))
            .unwrap_or(0);
        if ctx.error {
            self.eval_error = true;
        }
        hash
    }

    // Pattern-network walk: depth-first through sibling groups, constants
    // through the selector table, multifield spans recorded as markers.
    fn walk_pattern_network(&self, entity: EntityId, template: TemplateId) -> Vec<AlphaHit> {
        let mut hits = Vec::new();
        let mut markers: Vec<SlotMarker> = Vec::new();
        self.walk_group(entity, template, None, &mut markers, &mut hits);
        hits
    }

    fn walk_group(
        &self,
        entity: EntityId,
        template: TemplateId,
        parent: Option<PatternNodeId>,
        markers: &mut Vec<SlotMarker>,
        hits: &mut Vec<AlphaHit>,
    ) {
        // Linear pass over non-selector siblings; selector (constant)
        // children sit at the tail and are reached through the hash table.
        let mut selector_pairs: SmallVec<[(u16, u16); 2]> = SmallVec::new();
        let mut cursor = self.network.patterns.child_head(template, parent);
        while let Some(node_id) = cursor {
            let node = &self.network.patterns.nodes[node_id];
            cursor = node.right_sibling;
            if node.blocked {
                continue;
            }
            if node.selector {
                if !selector_pairs.contains(&(node.slot, node.field)) {
                    selector_pairs.push((node.slot, node.field));
                }
                continue;
            }
            self.try_node(entity, template, node_id, markers, hits);
        }
        for (slot, field) in selector_pairs {
            let atom = self
                .facts
                .get(entity)
                .and_then(|fact| fact.slots.get(slot as usize))
                .and_then(|value| value.field(field as usize));
            if let Some(atom) = atom {
                if let Some(node_id) =
                    self.network
                        .patterns
                        .selector_child(template, parent, slot, field, atom)
                {
                    if !self.network.patterns.nodes[node_id].blocked {
                        self.try_node(entity, template, node_id, markers, hits);
                    }
                }
            }
        }
    }

    fn try_node(
        &self,
        entity: EntityId,
        template: TemplateId,
        node_id: PatternNodeId,
        markers: &mut Vec<SlotMarker>,
        hits: &mut Vec<AlphaHit>,
    ) {
        let node = &self.network.patterns.nodes[node_id];
        let field_count = match self
            .facts
            .get(entity)
            .and_then(|fact| fact.slots.get(node.slot as usize))
        {
            Some(value) => value.field_count(),
            // A bare wildcard over a slotless template passes vacuously.
            None if !node.multifield_node
                && !node.end_slot
                && !node.selector
                && node.network_test.is_none() =>
            {
                for &terminal in &self.network.patterns.nodes[node_id].terminals {
                    hits.push(AlphaHit {
                        terminal,
                        markers: SmallVec::from_slice(markers),
                    });
                }
                self.walk_group(entity, template, Some(node_id), markers, hits);
                return;
            }
            None => return,
        };

        let mut pushed_marker = false;
        if node.multifield_node {
            // The span must cover the fields before and after it.
            if field_count < node.field as usize + node.leave_fields as usize {
                return;
            }
            markers.push(SlotMarker {
                slot: node.slot,
                start: node.field,
                end: (field_count - node.leave_fields as usize) as u16,
            });
            pushed_marker = true;
        } else {
            if node.field as usize >= field_count {
                return;
            }
            // An end-slot single-field node asserts the exact slot length.
            if node.end_slot && field_count != node.field as usize + 1 {
                return;
            }
        }

        // Selector nodes were located through the constant table; their
        // equality test is already proven.
        let passes = if node.selector {
            true
        } else {
            match node.network_test {
                Some(test) => {
                    let root = self.exprs.hashed_root(test);
                    let mut ctx = EvalContext {
                        rhs_entity: Some(entity),
                        ..EvalContext::default()
                    };
                    self.eval_test(&mut ctx, root)
                }
                None => true,
            }
        };

        if passes {
            for &terminal in &self.network.patterns.nodes[node_id].terminals {
                hits.push(AlphaHit {
                    terminal,
                    markers: SmallVec::from_slice(markers),
                });
            }
            self.walk_group(entity, template, Some(node_id), markers, hits);
        }

        if pushed_marker {
            markers.pop();
        }
    }

    /// Right-side event: a new entry appeared in the memory feeding `join`'s
    /// right input.
    pub(crate) fn network_assert_right(&mut self, right: PartialMatchId, join: JoinId) {
        if self.network.pms[right].deleting {
            return;
        }
        let kind = self.network.joins[join].kind;
        let hash = self.network.pms[right].hash_value;
        let lefts = self.bucket_snapshot(MemoryRef::Left(join), hash);

        match kind {
            JoinKind::Positive => {
                for left in lefts {
                    if self.pm_gone(left) {
                        continue;
                    }
                    if self.evaluate_join(join, left, right) {
                        self.pp_drive(left, right, join);
                    }
                }
            }
            JoinKind::Negated => {
                for left in lefts {
                    if self.pm_gone(left) || self.network.pms[left].blocker.is_some() {
                        continue;
                    }
                    if self.evaluate_join(join, left, right) {
                        // Block transition: the left's emission is retracted.
                        attach_blocker(&mut self.network.pms, left, right);
                        self.retract_emissions_of_left(join, left);
                    }
                }
            }
            JoinKind::Exists => {
                for left in lefts {
                    if self.pm_gone(left) || self.network.pms[left].blocker.is_some() {
                        continue;
                    }
                    if self.evaluate_join(join, left, right) {
                        attach_blocker(&mut self.network.pms, left, right);
                        self.epm_drive(left, join);
                    }
                }
            }
        }
    }

    /// Left-side event: `left` was just inserted into `join`'s left memory.
    pub(crate) fn network_assert_left(&mut self, left: PartialMatchId, join: JoinId) {
        if self.network.pms[left].deleting {
            return;
        }
        let kind = self.network.joins[join].kind;
        let hash = self.network.pms[left].hash_value;
        let right_mem = self.network.right_memory_ref(join);
        let rights = self.bucket_snapshot(right_mem, hash);

        match kind {
            JoinKind::Positive => {
                for right in rights {
                    if self.pm_gone(right) {
                        continue;
                    }
                    if self.evaluate_join(join, left, right) {
                        self.pp_drive(left, right, join);
                    }
                }
            }
            JoinKind::Negated => {
                // A left that already holds a blocker was driven by a
                // right-side event before this left-side drive ran.
                if self.network.pms[left].blocker.is_some() {
                    return;
                }
                let blocker = self.first_conflicting(join, left, &rights, None);
                match blocker {
                    Some(right) => attach_blocker(&mut self.network.pms, left, right),
                    None => self.epm_drive(left, join),
                }
            }
            JoinKind::Exists => {
                if self.network.pms[left].blocker.is_some() {
                    return;
                }
                if let Some(right) = self.first_conflicting(join, left, &rights, None) {
                    attach_blocker(&mut self.network.pms, left, right);
                    self.epm_drive(left, join);
                }
            }
        }
    }

    // Positive-pair emission: combined binds carry the right entity.
    fn pp_drive(&mut self, left: PartialMatchId, right: PartialMatchId, join: JoinId) {
        let mut binds = self.network.pms[left].binds.clone();
        if let Some(bind) = self.network.pms[right].binds.first() {
            binds.push(bind.clone());
        }
        // A from-the-right group emission is gated by the secondary test.
        if self.network.joins[join].secondary_test.is_some() && !self.secondary_passes(join, left) {
            return;
        }
        self.emit(join, left, Some(right), binds);
    }

    // Negated/exists emission: the occupied slot has no entity.
    fn epm_drive(&mut self, left: PartialMatchId, join: JoinId) {
        if self.network.joins[join].secondary_test.is_some() && !self.secondary_passes(join, left) {
            return;
        }
        let mut binds = self.network.pms[left].binds.clone();
        binds.push(Bind::none());
        self.emit(join, left, None, binds);
    }

    // Deliver one emission: an activation basis for terminal joins, a copy
    // into each downstream join's memory otherwise.
    fn emit(
        &mut self,
        join: JoinId,
        left: PartialMatchId,
        right: Option<PartialMatchId>,
        binds: SmallVec<[Bind; 2]>,
    ) {
        if let Some(token) = self.network.joins[join].rule {
            let mut pm = PartialMatch::new(Owner::Join(join), binds.clone());
            pm.lhs_parent = Some(left);
            pm.rhs_parent = right;
            let pm = self.network.pms.insert(pm);
            link_lineage(&mut self.network.pms, pm);
            self.network.link_terminal_match(join, pm);
            self.add_activation(token_rule(token), pm);
        }

        let children = self.network.joins[join].children.clone();
        for (child, side) in children {
            let mut pm = PartialMatch::new(Owner::Join(child), binds.clone());
            pm.lhs_parent = Some(left);
            pm.rhs_parent = right;
            pm.rhs_memory = side == Side::Right;
            let pm = self.network.pms.insert(pm);
            link_lineage(&mut self.network.pms, pm);
            match side {
                Side::Left => {
                    let hash = self.left_hash_of(child, pm);
                    self.network.pms[pm].hash_value = hash;
                    self.network.insert_pm(MemoryRef::Left(child), pm);
                    self.network_assert_left(pm, child);
                }
                Side::Right => {
                    self.network.pms[pm].hash_value = 0;
                    self.network.insert_pm(MemoryRef::Right(child), pm);
                    self.network_assert_right(pm, child);
                }
            }
        }
    }

    // Delete every emission `join` produced from `left` (block acquired or
    // an exists witness vanished).
    fn retract_emissions_of_left(&mut self, join: JoinId, left: PartialMatchId) {
        let child_joins: SmallVec<[JoinId; 4]> = self.network.joins[join]
            .children
            .iter()
            .map(|&(child, _)| child)
            .collect();
        let mut cursor = self.network.pms[left].first_left_child;
        let mut to_delete: SmallVec<[PartialMatchId; 8]> = SmallVec::new();
        while let Some(child) = cursor {
            cursor = self.network.pms[child].next_left_sibling;
            match self.network.pms[child].owner {
                Owner::Join(owner) if owner == join || child_joins.contains(&owner) => {
                    to_delete.push(child);
                }
                _ => {}
            }
        }
        for pm in to_delete {
            self.delete_cascade(pm);
        }
    }

    /// Delete a partial match and all matches derived from it, unblocking
    /// negated-join lefts along the way. Iterative; the work list bounds the
    /// depth independently of the rule's join depth.
    pub(crate) fn delete_cascade(&mut self, root: PartialMatchId) {
        let mut stack: Vec<PartialMatchId> = vec![root];
        while let Some(pm) = stack.pop() {
            if !self.network.pms.contains(pm) || self.network.pms[pm].deleting {
                continue;
            }
            self.network.pms[pm].deleting = true;

            // Derived matches go first onto the work list.
            for child in rete::children_of(&self.network.pms, pm) {
                stack.push(child);
            }

            // Unblock lefts this (right-side) match was blocking.
            if self.network.pms[pm].first_blocked.is_some() {
                self.unblock_dependents(pm);
            }

            // Activations leave the agenda before matches are reclaimed.
            if self.network.pms[pm].activation.is_some() {
                self.remove_activation_of(pm);
            }

            match self.network.pms[pm].owner {
                Owner::Terminal(terminal) => {
                    if self.network.pms[pm].in_memory {
                        self.network.remove_pm(MemoryRef::Alpha(terminal), pm);
                    }
                }
                Owner::Join(join) => {
                    if self.network.pms[pm].in_memory {
                        let mem = if self.network.pms[pm].rhs_memory {
                            MemoryRef::Right(join)
                        } else {
                            MemoryRef::Left(join)
                        };
                        self.network.remove_pm(mem, pm);
                    } else if self.network.joins.contains(join) {
                        self.network.unlink_terminal_match(join, pm);
                    }
                }
            }
            self.network.discard_pm_links(pm);
            self.network.retire_pm(pm);
        }
    }

    // A right-side match is going away: each left it blocked either finds
    // the next conflicting right or, for negated joins, becomes satisfied.
    fn unblock_dependents(&mut self, right: PartialMatchId) {
        let mut blocked: SmallVec<[PartialMatchId; 4]> = SmallVec::new();
        let mut cursor = self.network.pms[right].first_blocked;
        while let Some(left) = cursor {
            cursor = self.network.pms[left].next_blocked;
            blocked.push(left);
        }
        for left in blocked {
            detach_blocker(&mut self.network.pms, left);
            if self.pm_gone(left) {
                continue;
            }
            let join = match self.network.pms[left].owner {
                Owner::Join(join) => join,
                Owner::Terminal(_) => continue,
            };
            if !self.network.joins.contains(join) {
                continue;
            }
            let next = self.find_next_conflicting(join, left, right);
            match (next, self.network.joins[join].kind) {
                (Some(next), _) => attach_blocker(&mut self.network.pms, left, next),
                (None, JoinKind::Negated) => {
                    // The not-CE is now satisfied.
                    self.epm_drive(left, join);
                }
                (None, JoinKind::Exists) => {
                    // The last witness vanished.
                    self.retract_emissions_of_left(join, left);
                }
                (None, _) => {}
            }
        }
    }

    /// Search the join's right memory for the next entry conflicting with
    /// `left`, skipping `exclude` and matches already marked deleting.
    pub(crate) fn find_next_conflicting(
        &mut self,
        join: JoinId,
        left: PartialMatchId,
        exclude: PartialMatchId,
    ) -> Option<PartialMatchId> {
        let hash = self.network.pms[left].hash_value;
        let right_mem = self.network.right_memory_ref(join);
        let rights = self.bucket_snapshot(right_mem, hash);
        self.first_conflicting(join, left, &rights, Some(exclude))
    }

    fn first_conflicting(
        &mut self,
        join: JoinId,
        left: PartialMatchId,
        rights: &[PartialMatchId],
        exclude: Option<PartialMatchId>,
    ) -> Option<PartialMatchId> {
        rights.iter().copied().find(|&right| {
            if Some(right) == exclude || self.pm_gone(right) {
                return false;
            }
            self.evaluate_join(join, left, right)
        })
    }

    // Evaluate a join's network test for a (left, right) pair. An
    // evaluation error counts as a match and raises the engine flag.
    fn evaluate_join(&mut self, join: JoinId, left: PartialMatchId, right: PartialMatchId) -> bool {
        let test = match self.network.joins[join].network_test {
            Some(test) => test,
            None => return true,
        };
        let root = self.exprs.hashed_root(test);
        let mut ctx = EvalContext {
            lhs: Some(left),
            rhs: Some(right),
            join: Some(join),
            ..EvalContext::default()
        };
        let verdict = self.eval_test(&mut ctx, root);
        if ctx.error {
            self.eval_error = true;
            crate::route_error(COMPONENT_RETE, 1, "join test evaluation error");
        }
        verdict
    }

    fn secondary_passes(&mut self, join: JoinId, left: PartialMatchId) -> bool {
        let test = match self.network.joins[join].secondary_test {
            Some(test) => test,
            None => return true,
        };
        let root = self.exprs.hashed_root(test);
        let mut ctx = EvalContext {
            lhs: Some(left),
            join: Some(join),
            ..EvalContext::default()
        };
        let verdict = self.eval_test(&mut ctx, root);
        if ctx.error {
            self.eval_error = true;
        }
        verdict
    }

    fn bucket_snapshot(&self, mem: MemoryRef, hash: u64) -> Vec<PartialMatchId> {
        let memory = self.network.memory(mem);
        let mut out = Vec::new();
        let mut cursor = memory.bucket_head(hash);
        while let Some(pm) = cursor {
            out.push(pm);
            cursor = self.network.pms[pm].next_in_memory;
        }
        out
    }

    fn pm_gone(&self, pm: PartialMatchId) -> bool {
        match self.network.pms.get(pm) {
            Some(pm) => pm.deleting,
            None => true,
        }
    }
}
