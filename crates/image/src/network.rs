//! Network chunks: the pattern (alpha) DAG and the join (beta) graph
//!
//! Partial matches are runtime-only state and never hit the disk; the
//! after-load hooks rebuild memories and the agenda by re-driving the
//! entity stream through the restored structure.

use crate::codec::{ByteReader, ByteWriter};
use crate::{atom_ref, expr_ref, BinaryItem, ImageError, ImageResult, LoadContext};
use engine::Engine;
use rete::{
    bitmap_bytes, AlphaTerminal, BetaMemory, JoinKind, JoinNode, MemoryRef, Owner, PartialMatch,
    PatternNode, RightInput, Side,
};
use rule_model::atom::NULL_ID;
use smallvec::SmallVec;

/// Pattern-network binary item.
pub struct PatternNetworkItem;

/// Join-network binary item.
pub struct JoinNetworkItem;

const FLAG_MULTIFIELD: u8 = 1 << 0;
const FLAG_END_SLOT: u8 = 1 << 1;
const FLAG_SELECTOR: u8 = 1 << 2;
const FLAG_BLOCKED: u8 = 1 << 3;

fn node_ref(engine: &Engine, id: Option<rete::PatternNodeId>) -> Option<u64> {
    id.map(|id| engine.network.patterns.nodes[id].bsave_id)
}

impl BinaryItem for PatternNetworkItem {
    fn name(&self) -> &'static str {
        "pattern-network"
    }

    fn priority(&self) -> i32 {
        70
    }

    fn find(&self, engine: &mut Engine) {
        let nodes: Vec<_> = engine
            .network
            .patterns
            .nodes
            .iter()
            .map(|(id, _)| id)
            .collect();
        for (dense, id) in nodes.into_iter().enumerate() {
            let constant = engine.network.patterns.nodes[id].constant;
            if let Some(atom) = constant {
                engine.atoms.mark_needed(atom);
            }
            engine.network.patterns.nodes[id].bsave_id = dense as u64;
        }
        let terminals: Vec<_> = engine
            .network
            .patterns
            .terminals
            .iter()
            .map(|(id, _)| id)
            .collect();
        for (dense, id) in terminals.into_iter().enumerate() {
            let slot_bitmap = engine.network.patterns.terminals[id].slot_bitmap;
            if let Some(atom) = slot_bitmap {
                engine.atoms.mark_needed(atom);
            }
            engine.network.patterns.terminals[id].bsave_id = dense as u64;
        }
    }

    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter) {
        writer.u64(engine.network.patterns.nodes.len() as u64);
        writer.u64(engine.network.patterns.terminals.len() as u64);
    }

    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter) {
        for (_, node) in engine.network.patterns.nodes.iter() {
            let template = engine
                .templates
                .get(node.template)
                .map(|template| template.header.bsave_id)
                .unwrap_or(NULL_ID);
            writer.u64(template);
            writer.id(node_ref(engine, node.parent));
            writer.id(node_ref(engine, node.first_child));
            writer.id(node_ref(engine, node.left_sibling));
            writer.id(node_ref(engine, node.right_sibling));
            writer.u16(node.slot);
            writer.u16(node.field);
            writer.u16(node.leave_fields);
            let mut flags = 0u8;
            if node.multifield_node {
                flags |= FLAG_MULTIFIELD;
            }
            if node.end_slot {
                flags |= FLAG_END_SLOT;
            }
            if node.selector {
                flags |= FLAG_SELECTOR;
            }
            if node.blocked {
                flags |= FLAG_BLOCKED;
            }
            writer.u8(flags);
            writer.id(node.constant.map(|atom| atom_ref(engine, atom)));
            writer.id(node.network_test.map(|expr| expr_ref(engine, expr)));
            writer.u64(node.terminals.len() as u64);
            for &terminal in &node.terminals {
                writer.u64(engine.network.patterns.terminals[terminal].bsave_id);
            }
        }

        for (_, terminal) in engine.network.patterns.terminals.iter() {
            writer.u64(engine.network.patterns.nodes[terminal.pattern_node].bsave_id);
            let template = engine
                .templates
                .get(terminal.template)
                .map(|template| template.header.bsave_id)
                .unwrap_or(NULL_ID);
            writer.u64(template);
            writer.id(terminal.slot_bitmap.map(|atom| atom_ref(engine, atom)));
            writer.id(terminal.right_hash.map(|expr| expr_ref(engine, expr)));
            writer.u32(terminal.use_count);
        }
    }

    fn read_storage(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let node_count = reader.u64()? as usize;
        let terminal_count = reader.u64()? as usize;
        ctx.nodes = Vec::with_capacity(node_count);
        ctx.terminals = Vec::with_capacity(terminal_count);
        ctx.pending_primary = node_count as u64;
        ctx.pending_secondary = terminal_count as u64;
        engine.network.patterns.reset();
        Ok(())
    }

    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let node_count = ctx.pending_primary as usize;
        let terminal_count = ctx.pending_secondary as usize;

        // Pass 1: nodes with unresolved links.
        struct RawNode {
            parent: Option<u64>,
            first_child: Option<u64>,
            left_sibling: Option<u64>,
            right_sibling: Option<u64>,
            terminals: Vec<u64>,
        }
        let mut raw: Vec<RawNode> = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let template = ctx.template(reader.u64()?)?;
            let parent = reader.id()?;
            let first_child = reader.id()?;
            let left_sibling = reader.id()?;
            let right_sibling = reader.id()?;
            let slot = reader.u16()?;
            let field = reader.u16()?;
            let leave_fields = reader.u16()?;
            let flags = reader.u8()?;
            let constant = ctx.opt_atom(reader.id()?)?;
            if let Some(atom) = constant {
                engine.atoms.retain(atom);
            }
            let network_test = ctx.opt_expr(engine, reader.id()?)?;
            let terminal_count = reader.u64()? as usize;
            let mut terminals = Vec::with_capacity(terminal_count);
            for _ in 0..terminal_count {
                terminals.push(reader.u64()?);
            }

            let id = engine.network.patterns.nodes.insert(PatternNode {
                parent: None,
                first_child: None,
                right_sibling: None,
                left_sibling: None,
                template,
                slot,
                field,
                leave_fields,
                multifield_node: flags & FLAG_MULTIFIELD != 0,
                end_slot: flags & FLAG_END_SLOT != 0,
                selector: flags & FLAG_SELECTOR != 0,
                blocked: flags & FLAG_BLOCKED != 0,
                initialize: false,
                constant,
                network_test,
                terminals: Vec::new(),
                bsave_id: NULL_ID,
            });
            ctx.nodes.push(id);
            raw.push(RawNode {
                parent,
                first_child,
                left_sibling,
                right_sibling,
                terminals,
            });
        }

        // Terminals.
        for _ in 0..terminal_count {
            let pattern_node = ctx.node(reader.u64()?)?;
            let template = ctx.template(reader.u64()?)?;
            let slot_bitmap = ctx.opt_atom(reader.id()?)?;
            if let Some(atom) = slot_bitmap {
                engine.atoms.retain(atom);
            }
            let right_hash = ctx.opt_expr(engine, reader.id()?)?;
            let use_count = reader.u32()?;

            // The class bitmap is recomputed against the rebuilt template
            // table rather than trusted from the image.
            let class_bitmap = engine
                .atoms
                .intern_bitmap(&bitmap_bytes(&[template.index()]));
            engine.atoms.retain(class_bitmap);

            let mut terminal =
                AlphaTerminal::new(pattern_node, template, class_bitmap, slot_bitmap, right_hash);
            terminal.use_count = use_count;
            terminal.memory = BetaMemory::new(right_hash.is_some());
            let id = engine.network.patterns.terminals.insert(terminal);
            ctx.terminals.push(id);
        }

        // Pass 2: link fix-up.
        for (position, raw_node) in raw.into_iter().enumerate() {
            let id = ctx.nodes[position];
            let parent = raw_node.parent.map(|p| ctx.node(p)).transpose()?;
            let first_child = raw_node.first_child.map(|p| ctx.node(p)).transpose()?;
            let left_sibling = raw_node.left_sibling.map(|p| ctx.node(p)).transpose()?;
            let right_sibling = raw_node.right_sibling.map(|p| ctx.node(p)).transpose()?;
            let mut terminals = Vec::with_capacity(raw_node.terminals.len());
            for terminal in raw_node.terminals {
                terminals.push(ctx.terminal(terminal)?);
            }
            let node = &mut engine.network.patterns.nodes[id];
            node.parent = parent;
            node.first_child = first_child;
            node.left_sibling = left_sibling;
            node.right_sibling = right_sibling;
            node.terminals = terminals;
        }

        engine.network.patterns.rebuild_indexes();
        Ok(())
    }

    fn clear(&self, engine: &mut Engine) {
        engine.network.reset();
    }
}

const SIDE_LEFT: u8 = 0;
const SIDE_RIGHT: u8 = 1;

// A join's from-the-right nature is not a kind: it travels with the right
// input record.
fn kind_tag(kind: JoinKind) -> u8 {
    match kind {
        JoinKind::Positive => 0,
        JoinKind::Negated => 1,
        JoinKind::Exists => 2,
    }
}

fn tag_kind(tag: u8) -> ImageResult<JoinKind> {
    Ok(match tag {
        0 => JoinKind::Positive,
        1 => JoinKind::Negated,
        2 => JoinKind::Exists,
        other => return Err(ImageError::Corrupt(format!("unknown join kind {other}"))),
    })
}

impl BinaryItem for JoinNetworkItem {
    fn name(&self) -> &'static str {
        "join-network"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn find(&self, engine: &mut Engine) {
        let joins: Vec<_> = engine.network.joins.iter().map(|(id, _)| id).collect();
        for (dense, id) in joins.into_iter().enumerate() {
            engine.network.joins[id].bsave_id = dense as u64;
        }
    }

    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter) {
        writer.u64(engine.network.joins.len() as u64);
        writer.u64(engine.network.patterns.terminals.len() as u64);
    }

    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter) {
        for (_, join) in engine.network.joins.iter() {
            writer.u8(kind_tag(join.kind));
            writer.id(
                join.left_parent
                    .map(|parent| engine.network.joins[parent].bsave_id),
            );
            match join.right_input {
                RightInput::Alpha(terminal) => {
                    writer.u8(0);
                    writer.u64(engine.network.patterns.terminals[terminal].bsave_id);
                }
                RightInput::Join(upstream) => {
                    writer.u8(1);
                    writer.u64(engine.network.joins[upstream].bsave_id);
                }
            }
            writer.id(join.network_test.map(|expr| expr_ref(engine, expr)));
            writer.id(join.secondary_test.map(|expr| expr_ref(engine, expr)));
            writer.id(join.left_hash.map(|expr| expr_ref(engine, expr)));
            writer.id(join.right_hash.map(|expr| expr_ref(engine, expr)));
            writer.u64(join.children.len() as u64);
            for &(child, side) in &join.children {
                writer.u64(engine.network.joins[child].bsave_id);
                writer.u8(match side {
                    Side::Left => SIDE_LEFT,
                    Side::Right => SIDE_RIGHT,
                });
            }
        }

        // Per-terminal join lists preserve sibling order.
        for (_, terminal) in engine.network.patterns.terminals.iter() {
            writer.u64(terminal.joins.len() as u64);
            for &join in &terminal.joins {
                writer.u64(engine.network.joins[join].bsave_id);
            }
        }
    }

    fn read_storage(
        &self,
        _engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let join_count = reader.u64()? as usize;
        let _terminal_count = reader.u64()?;
        ctx.joins = Vec::with_capacity(join_count);
        ctx.pending_primary = join_count as u64;
        Ok(())
    }

    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let join_count = ctx.pending_primary as usize;

        struct RawJoin {
            left_parent: Option<u64>,
            right_is_join: bool,
            right_id: u64,
            network_test: Option<u64>,
            secondary_test: Option<u64>,
            left_hash: Option<u64>,
            right_hash: Option<u64>,
            children: Vec<(u64, Side)>,
        }

        // Pass 1: allocate joins of the right shape so ids exist for the
        // link fix-up.
        let mut raw: Vec<RawJoin> = Vec::with_capacity(join_count);
        for _ in 0..join_count {
            let kind = tag_kind(reader.u8()?)?;
            let left_parent = reader.id()?;
            let right_is_join = match reader.u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(ImageError::Corrupt(format!(
                        "unknown right input tag {other}"
                    )))
                }
            };
            let right_id = reader.u64()?;
            let network_test = reader.id()?;
            let secondary_test = reader.id()?;
            let left_hash = reader.id()?;
            let right_hash = reader.id()?;
            let child_count = reader.u64()? as usize;
            let mut children = Vec::with_capacity(child_count);
            for _ in 0..child_count {
                let child = reader.u64()?;
                let side = match reader.u8()? {
                    SIDE_LEFT => Side::Left,
                    SIDE_RIGHT => Side::Right,
                    other => {
                        return Err(ImageError::Corrupt(format!("unknown side tag {other}")))
                    }
                };
                children.push((child, side));
            }

            let placeholder = if right_is_join {
                RightInput::Join(rule_model::arena::Id::from_raw_parts(0, 0))
            } else {
                RightInput::Alpha(rule_model::arena::Id::from_raw_parts(0, 0))
            };
            let id = engine.network.joins.insert(JoinNode::new(kind, placeholder));
            ctx.joins.push(id);
            raw.push(RawJoin {
                left_parent,
                right_is_join,
                right_id,
                network_test,
                secondary_test,
                left_hash,
                right_hash,
                children,
            });
        }

        // Pass 2: resolve links, tests, and memories; install the empty
        // left match of first joins.
        for (position, raw_join) in raw.into_iter().enumerate() {
            let id = ctx.joins[position];
            let left_parent = raw_join.left_parent.map(|p| ctx.join(p)).transpose()?;
            let right_input = if raw_join.right_is_join {
                RightInput::Join(ctx.join(raw_join.right_id)?)
            } else {
                RightInput::Alpha(ctx.terminal(raw_join.right_id)?)
            };
            let network_test = ctx.opt_expr(engine, raw_join.network_test)?;
            let secondary_test = ctx.opt_expr(engine, raw_join.secondary_test)?;
            let left_hash = ctx.opt_expr(engine, raw_join.left_hash)?;
            let right_hash = ctx.opt_expr(engine, raw_join.right_hash)?;
            let mut children = Vec::with_capacity(raw_join.children.len());
            for (child, side) in raw_join.children {
                children.push((ctx.join(child)?, side));
            }

            let first_join = left_parent.is_none();
            {
                let join = &mut engine.network.joins[id];
                join.left_parent = left_parent;
                join.right_input = right_input;
                join.network_test = network_test;
                join.secondary_test = secondary_test;
                join.left_hash = left_hash;
                join.right_hash = right_hash;
                join.left_mem = BetaMemory::new(left_hash.is_some());
                join.children = children;
                join.first_join = first_join;
            }
            if first_join {
                let pm = engine
                    .network
                    .pms
                    .insert(PartialMatch::new(Owner::Join(id), SmallVec::new()));
                engine.network.joins[id].empty_left = Some(pm);
                engine.network.insert_pm(MemoryRef::Left(id), pm);
            }
        }

        // Per-terminal join lists.
        for &terminal in &ctx.terminals {
            let count = reader.u64()? as usize;
            let mut joins = Vec::with_capacity(count);
            for _ in 0..count {
                joins.push(ctx.join(reader.u64()?)?);
            }
            engine.network.patterns.terminals[terminal].joins = joins;
        }
        Ok(())
    }

    fn clear(&self, engine: &mut Engine) {
        engine.network.reset();
    }
}
