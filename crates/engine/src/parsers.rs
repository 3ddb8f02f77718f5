//! Pattern-parser plug-in protocol
//!
//! The network is polymorphic over pattern flavours. A parser registers a
//! descriptor with a priority; parsers are queried in priority order and
//! the first one recognizing a name wins. A parser's name is reserved and
//! may not be used as a user symbol.

use crate::{Engine, EngineError, EngineResult};
use rete::{ParsedPattern, TerminalId};
use rule_model::atom::AtomId;
use tracing::debug;

/// Capability record for one pattern flavour.
///
/// Parsing itself (text to parsed-pattern tree) happens outside the core;
/// the descriptor covers the operations the core drives: attaching parsed
/// patterns to the network, detaching them, marking terminals for the
/// incremental reset, and re-walking the flavour's entities during one.
pub trait PatternParser {
    /// Flavour name (reserved symbol).
    fn name(&self) -> &'static str;

    /// Priority; higher parsers are queried first.
    fn priority(&self) -> i32;

    /// True when this flavour handles patterns naming `head`.
    fn recognizes(&self, engine: &Engine, head: AtomId) -> bool;

    /// Attach a parsed pattern to this flavour's network.
    fn add_pattern(&self, engine: &mut Engine, pattern: ParsedPattern)
        -> EngineResult<TerminalId>;

    /// Detach one use of a terminal.
    fn remove_pattern(&self, engine: &mut Engine, terminal: TerminalId);

    /// Set or clear the incremental-reset mark on a terminal.
    fn mark_initialize(&self, engine: &mut Engine, terminal: TerminalId, value: bool);

    /// Drive every entity of this flavour through the pattern network;
    /// only initialize-marked terminals accept insertions.
    fn incremental_reset(&self, engine: &mut Engine) -> EngineResult<()>;
}

/// Priority-ordered parser registry plus the reserved-symbol list.
pub struct ParserRegistry {
    pub(crate) items: Vec<Box<dyn PatternParser>>,
    reserved: Vec<(String, String)>,
}

impl ParserRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            reserved: Vec::new(),
        }
    }

    /// Register a parser; its name becomes a reserved symbol. A second
    /// parser under the same name is ignored with a warning.
    pub fn register(&mut self, parser: Box<dyn PatternParser>) {
        if self.items.iter().any(|p| p.name() == parser.name()) {
            tracing::warn!(name = parser.name(), "pattern parser already registered");
            return;
        }
        self.reserved
            .push((parser.name().to_owned(), "pattern parser".to_owned()));
        let priority = parser.priority();
        let position = self
            .items
            .iter()
            .position(|p| p.priority() < priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, parser);
        debug!("pattern parser registered");
    }

    /// Reserve a symbol on behalf of a subsystem.
    pub fn reserve(&mut self, symbol: &str, by: &str) {
        self.reserved.push((symbol.to_owned(), by.to_owned()));
    }

    /// True when a symbol is reserved.
    pub fn is_reserved(&self, symbol: &str) -> bool {
        self.reserved.iter().any(|(s, _)| s == symbol)
    }

    /// Who reserved a symbol, if anyone.
    pub fn reserved_by(&self, symbol: &str) -> Option<&str> {
        self.reserved
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, by)| by.as_str())
    }

    /// Index of the first parser recognizing `head`, in priority order.
    pub fn find(&self, engine: &Engine, head: AtomId) -> Option<usize> {
        self.items
            .iter()
            .position(|parser| parser.recognizes(engine, head))
    }

    /// Number of registered parsers.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no parser is registered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Parser invocations temporarily take the parser list out of the engine so
// the callback can borrow the engine mutably.
impl Engine {
    pub(crate) fn parser_add_pattern(
        &mut self,
        index: usize,
        pattern: ParsedPattern,
    ) -> EngineResult<TerminalId> {
        let items = std::mem::take(&mut self.parsers.items);
        let result = match items.get(index) {
            Some(parser) => parser.add_pattern(self, pattern),
            None => Err(EngineError::Parse("pattern parser vanished".to_owned())),
        };
        self.parsers.items = items;
        result
    }

    pub(crate) fn parser_remove_pattern(&mut self, index: usize, terminal: TerminalId) {
        let items = std::mem::take(&mut self.parsers.items);
        if let Some(parser) = items.get(index) {
            parser.remove_pattern(self, terminal);
        }
        self.parsers.items = items;
    }

    pub(crate) fn parsers_incremental_reset(&mut self) -> EngineResult<()> {
        let items = std::mem::take(&mut self.parsers.items);
        let mut result = Ok(());
        for parser in &items {
            result = parser.incremental_reset(self);
            if result.is_err() {
                break;
            }
        }
        self.parsers.items = items;
        result
    }
}

/// The deftemplate-fact pattern flavour.
pub struct FactParser;

impl PatternParser for FactParser {
    fn name(&self) -> &'static str {
        "facts"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn recognizes(&self, engine: &Engine, head: AtomId) -> bool {
        engine.templates.find(engine.modules.current, head).is_some()
    }

    fn add_pattern(
        &self,
        engine: &mut Engine,
        pattern: ParsedPattern,
    ) -> EngineResult<TerminalId> {
        Ok(engine
            .network
            .patterns
            .add_pattern(&mut engine.exprs, &mut engine.atoms, pattern)?)
    }

    fn remove_pattern(&self, engine: &mut Engine, terminal: TerminalId) {
        let Engine {
            network,
            exprs,
            atoms,
            ..
        } = engine;
        network
            .patterns
            .detach_terminal(exprs, atoms, &mut network.pms, terminal);
    }

    fn mark_initialize(&self, engine: &mut Engine, terminal: TerminalId, value: bool) {
        if let Some(node) = engine.network.patterns.terminals.get_mut(terminal) {
            node.initialize = value;
        }
    }

    fn incremental_reset(&self, engine: &mut Engine) -> EngineResult<()> {
        for fact in engine.facts.ids() {
            engine.alpha_drive(fact, true);
        }
        Ok(())
    }
}
