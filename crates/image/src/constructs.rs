//! Construct chunks: modules, templates, rules, and the fact base

use crate::codec::{ByteReader, ByteWriter};
use crate::{atom_ref, expr_ref, BinaryItem, ImageError, ImageResult, LoadContext};
use engine::compile::{rule_token, Rule};
use engine::Engine;
use rete::EntityId;
use rule_model::module::{ConstructHeader, ConstructType, PortItem};
use rule_model::template::SlotDef;
use rule_model::value::Value;
use smallvec::SmallVec;

/// Defmodule table binary item.
pub struct ModulesItem;

/// Deftemplate table binary item.
pub struct TemplatesItem;

/// Defrule table binary item.
pub struct RulesItem;

/// Fact-base binary item.
pub struct FactsItem;

fn write_port_items(engine: &Engine, items: &[PortItem], writer: &mut ByteWriter) {
    writer.u64(items.len() as u64);
    for item in items {
        writer.id(item.module.map(|atom| atom_ref(engine, atom)));
        writer.u8(match item.construct_type {
            None => 0,
            Some(ConstructType::Template) => 1,
            Some(ConstructType::Rule) => 2,
        });
        writer.id(item.name.map(|atom| atom_ref(engine, atom)));
    }
}

fn read_port_items(
    engine: &mut Engine,
    ctx: &LoadContext,
    reader: &mut ByteReader<'_>,
) -> ImageResult<Vec<PortItem>> {
    let count = reader.u64()? as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let module = ctx.opt_atom(reader.id()?)?;
        let construct_type = match reader.u8()? {
            0 => None,
            1 => Some(ConstructType::Template),
            2 => Some(ConstructType::Rule),
            other => {
                return Err(ImageError::Corrupt(format!(
                    "unknown construct type {other}"
                )))
            }
        };
        let name = ctx.opt_atom(reader.id()?)?;
        for atom in [module, name].into_iter().flatten() {
            engine.atoms.retain(atom);
        }
        items.push(PortItem {
            module,
            construct_type,
            name,
        });
    }
    Ok(items)
}

impl BinaryItem for ModulesItem {
    fn name(&self) -> &'static str {
        "modules"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn find(&self, engine: &mut Engine) {
        let ids: Vec<_> = engine.modules.iter().map(|(id, _)| id).collect();
        for (dense, id) in ids.into_iter().enumerate() {
            let (name, port_atoms) = {
                let module = match engine.modules.get(id) {
                    Some(module) => module,
                    None => continue,
                };
                let mut atoms: SmallVec<[_; 4]> = SmallVec::new();
                for item in module.imports.iter().chain(module.exports.iter()) {
                    if let Some(atom) = item.module {
                        atoms.push(atom);
                    }
                    if let Some(atom) = item.name {
                        atoms.push(atom);
                    }
                }
                (module.name, atoms)
            };
            engine.atoms.mark_needed(name);
            for atom in port_atoms {
                engine.atoms.mark_needed(atom);
            }
            if let Some(module) = engine.modules.get_mut(id) {
                module.bsave_id = dense as u64;
            }
        }
    }

    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter) {
        writer.u64(engine.modules.len() as u64);
        let current = engine
            .modules
            .get(engine.modules.current)
            .map(|module| module.bsave_id)
            .unwrap_or(0);
        writer.u64(current);
    }

    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter) {
        for (_, module) in engine.modules.iter() {
            writer.u64(atom_ref(engine, module.name));
            write_port_items(engine, &module.imports, writer);
            write_port_items(engine, &module.exports, writer);
        }
    }

    fn read_storage(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let count = reader.u64()?;
        ctx.current_module = Some(reader.u64()?);
        ctx.modules = Vec::with_capacity(count as usize);
        engine.modules.reset(&mut engine.atoms);
        Ok(())
    }

    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        while !reader.at_end() {
            let name_atom = ctx.atom(reader.u64()?)?;
            let name = engine
                .atoms
                .lexeme_text(name_atom)
                .ok_or_else(|| ImageError::Corrupt("module name is not a lexeme".to_owned()))?
                .to_owned();
            let id = if name == "MAIN" {
                engine.modules.main
            } else {
                engine
                    .modules
                    .define(&mut engine.atoms, &name)
                    .map_err(engine::EngineError::from)?
            };
            let imports = read_port_items(engine, ctx, reader)?;
            let exports = read_port_items(engine, ctx, reader)?;
            if let Some(module) = engine.modules.get_mut(id) {
                module.imports = imports;
                module.exports = exports;
            }
            ctx.modules.push(id);
        }
        Ok(())
    }

    fn clear(&self, engine: &mut Engine) {
        engine.modules.reset(&mut engine.atoms);
    }
}

fn write_value(engine: &Engine, value: &Value, writer: &mut ByteWriter) {
    match value {
        Value::Atom(atom) => {
            writer.u8(0);
            writer.u64(atom_ref(engine, *atom));
        }
        Value::Multi(items) => {
            writer.u8(1);
            writer.u64(items.len() as u64);
            for atom in items {
                writer.u64(atom_ref(engine, *atom));
            }
        }
    }
}

fn read_value(ctx: &LoadContext, reader: &mut ByteReader<'_>) -> ImageResult<Value> {
    match reader.u8()? {
        0 => Ok(Value::Atom(ctx.atom(reader.u64()?)?)),
        1 => {
            let count = reader.u64()? as usize;
            let mut items = SmallVec::with_capacity(count);
            for _ in 0..count {
                items.push(ctx.atom(reader.u64()?)?);
            }
            Ok(Value::Multi(items))
        }
        other => Err(ImageError::Corrupt(format!("unknown value tag {other}"))),
    }
}

fn mark_value(engine: &mut Engine, value: &Value) {
    match value {
        Value::Atom(atom) => engine.atoms.mark_needed(*atom),
        Value::Multi(items) => {
            for atom in items.clone() {
                engine.atoms.mark_needed(atom);
            }
        }
    }
}

impl BinaryItem for TemplatesItem {
    fn name(&self) -> &'static str {
        "templates"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn find(&self, engine: &mut Engine) {
        let ids: Vec<_> = engine.templates.iter().map(|(id, _)| id).collect();
        for (dense, id) in ids.into_iter().enumerate() {
            let (name, slot_atoms, defaults) = {
                let template = match engine.templates.get(id) {
                    Some(template) => template,
                    None => continue,
                };
                let slot_atoms: Vec<_> = template.slots.iter().map(|slot| slot.name).collect();
                let defaults: Vec<_> = template
                    .slots
                    .iter()
                    .filter_map(|slot| slot.default.clone())
                    .collect();
                (template.header.name, slot_atoms, defaults)
            };
            engine.atoms.mark_needed(name);
            for atom in slot_atoms {
                engine.atoms.mark_needed(atom);
            }
            for default in &defaults {
                mark_value(engine, default);
            }
            if let Some(template) = engine.templates.get_mut(id) {
                template.header.bsave_id = dense as u64;
            }
        }
    }

    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter) {
        writer.u64(engine.templates.len() as u64);
    }

    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter) {
        for (_, template) in engine.templates.iter() {
            writer.u64(atom_ref(engine, template.header.name));
            let module = engine
                .modules
                .get(template.header.module)
                .map(|module| module.bsave_id)
                .unwrap_or(u64::MAX);
            writer.u64(module);
            match &template.header.pp_form {
                Some(text) => {
                    writer.u8(1);
                    writer.str(text);
                }
                None => writer.u8(0),
            }
            writer.u64(template.slots.len() as u64);
            for slot in &template.slots {
                writer.u64(atom_ref(engine, slot.name));
                writer.u8(u8::from(slot.multifield));
                writer.u8(slot.allowed.bits());
                match &slot.default {
                    Some(default) => {
                        writer.u8(1);
                        write_value(engine, default, writer);
                    }
                    None => writer.u8(0),
                }
            }
        }
    }

    fn read_storage(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let count = reader.u64()?;
        ctx.templates = Vec::with_capacity(count as usize);
        engine.templates.reset(&mut engine.atoms);
        Ok(())
    }

    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        while !reader.at_end() {
            let name_atom = ctx.atom(reader.u64()?)?;
            let name = engine
                .atoms
                .lexeme_text(name_atom)
                .ok_or_else(|| ImageError::Corrupt("template name is not a lexeme".to_owned()))?
                .to_owned();
            let module = ctx.module(reader.u64()?)?;
            let pp_form = match reader.u8()? {
                0 => None,
                _ => Some(reader.str()?.to_owned().into_boxed_str()),
            };
            let slot_count = reader.u64()? as usize;
            let mut slots = Vec::with_capacity(slot_count);
            for _ in 0..slot_count {
                let slot_name = ctx.atom(reader.u64()?)?;
                let multifield = reader.u8()? != 0;
                let allowed = rule_model::template::AtomKindSet::from_bits(reader.u8()?);
                let default = match reader.u8()? {
                    0 => None,
                    _ => Some(read_value(ctx, reader)?),
                };
                slots.push(SlotDef {
                    name: slot_name,
                    multifield,
                    allowed,
                    default,
                });
            }
            let id = engine
                .templates
                .define(&mut engine.atoms, module, &name, slots)
                .map_err(engine::EngineError::from)?;
            if let Some(template) = engine.templates.get_mut(id) {
                template.header.pp_form = pp_form;
            }
            ctx.templates.push(id);
        }
        Ok(())
    }

    fn clear(&self, engine: &mut Engine) {
        engine.templates.reset(&mut engine.atoms);
    }
}

impl BinaryItem for RulesItem {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn find(&self, engine: &mut Engine) {
        let ids: Vec<_> = engine.rules.iter().map(|(id, _)| id).collect();
        for (dense, id) in ids.into_iter().enumerate() {
            let name = match engine.rules.get(id) {
                Some(rule) => rule.header.name,
                None => continue,
            };
            engine.atoms.mark_needed(name);
            if let Some(rule) = engine.rules.get_mut(id) {
                rule.header.bsave_id = dense as u64;
            }
        }
    }

    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter) {
        writer.u64(engine.rules.len() as u64);
    }

    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter) {
        for (_, rule) in engine.rules.iter() {
            writer.u64(atom_ref(engine, rule.header.name));
            let module = engine
                .modules
                .get(rule.header.module)
                .map(|module| module.bsave_id)
                .unwrap_or(u64::MAX);
            writer.u64(module);
            writer.i64(i64::from(rule.salience));
            writer.u32(rule.complexity);
            writer.id(rule.dynamic_salience.map(|expr| expr_ref(engine, expr)));
            writer.id(rule.actions.map(|expr| expr_ref(engine, expr)));
            writer.u64(rule.terminals.len() as u64);
            for &terminal in &rule.terminals {
                writer.u64(engine.network.patterns.terminals[terminal].bsave_id);
            }
            writer.u64(rule.joins.len() as u64);
            for &join in &rule.joins {
                writer.u64(engine.network.joins[join].bsave_id);
            }
        }
    }

    fn read_storage(
        &self,
        engine: &mut Engine,
        _ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let _count = reader.u64()?;
        engine.rules.reset();
        Ok(())
    }

    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        while !reader.at_end() {
            let name = ctx.atom(reader.u64()?)?;
            engine.atoms.retain(name);
            let module = ctx.module(reader.u64()?)?;
            let salience = reader.i64()? as i32;
            let complexity = reader.u32()?;
            let dynamic_salience = ctx.opt_expr(engine, reader.id()?)?;
            let actions = ctx.opt_expr(engine, reader.id()?)?;

            let terminal_count = reader.u64()? as usize;
            let mut terminals = Vec::with_capacity(terminal_count);
            for _ in 0..terminal_count {
                terminals.push(ctx.terminal(reader.u64()?)?);
            }
            let join_count = reader.u64()? as usize;
            let mut joins = Vec::with_capacity(join_count);
            for _ in 0..join_count {
                joins.push(ctx.join(reader.u64()?)?);
            }
            let last_join = joins.last().copied();

            let rule = Rule {
                header: ConstructHeader::new(name, module),
                salience,
                dynamic_salience,
                last_dynamic_salience: None,
                complexity,
                actions,
                executing: false,
                terminals,
                joins,
            };
            let id = engine.rules.insert_loaded(rule);
            if let Some(last) = last_join {
                engine.network.joins[last].rule = Some(rule_token(id));
            }
        }
        Ok(())
    }

    fn clear(&self, engine: &mut Engine) {
        let ids: Vec<_> = engine.rules.iter().map(|(id, _)| id).collect();
        for id in ids {
            let _ = engine.remove_rule(id);
        }
    }
}

impl BinaryItem for FactsItem {
    fn name(&self) -> &'static str {
        "facts"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn find(&self, engine: &mut Engine) {
        let values: Vec<Value> = engine
            .facts
            .iter()
            .flat_map(|fact| fact.slots.iter().cloned())
            .collect();
        for value in &values {
            mark_value(engine, value);
        }
    }

    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter) {
        writer.u64(engine.facts.len() as u64);
        let (next_id, next_timetag) = engine.facts.counters();
        writer.u64(next_id);
        writer.u64(next_timetag);
    }

    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter) {
        for fact in engine.facts.iter() {
            writer.u64(fact.id.0);
            writer.u64(fact.timetag);
            let template = engine
                .templates
                .get(fact.template)
                .map(|template| template.header.bsave_id)
                .unwrap_or(u64::MAX);
            writer.u64(template);
            writer.u64(fact.slots.len() as u64);
            for slot in &fact.slots {
                write_value(engine, slot, writer);
            }
        }
    }

    fn read_storage(
        &self,
        engine: &mut Engine,
        _ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        let _count = reader.u64()?;
        let next_id = reader.u64()?;
        let next_timetag = reader.u64()?;
        engine.facts.reset();
        engine.facts.set_counters(next_id, next_timetag);
        Ok(())
    }

    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()> {
        while !reader.at_end() {
            let id = EntityId(reader.u64()?);
            let timetag = reader.u64()?;
            let template = ctx.template(reader.u64()?)?;
            let slot_count = reader.u64()? as usize;
            let mut slots = Vec::with_capacity(slot_count);
            for _ in 0..slot_count {
                let value = read_value(ctx, reader)?;
                value.retain_all(&mut engine.atoms);
                slots.push(value);
            }
            engine.facts.restore(&engine.atoms, id, timetag, template, slots);
        }
        Ok(())
    }

    fn clear(&self, engine: &mut Engine) {
        for id in engine.facts.ids() {
            let _ = engine.retract(id);
        }
    }
}
