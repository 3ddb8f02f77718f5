//! Binary image serializer: save and restore the whole construct graph and
//! discrimination network as an index-referenced image
//!
//! The image is a header followed by one chunk per registered binary item
//! and a zero-length-name footer. Pointers never hit the disk: every
//! reference is a dense id assigned during the find phase, and `u64::MAX`
//! is the null id. Writer and reader must be identical builds; the header's
//! prefix, version, and primitive-width vector are verified before any
//! state is touched, and a mismatch leaves the engine in its cleared
//! pre-load state.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

/// Byte-level encoding
pub mod codec;

mod atoms;
mod constructs;
mod exprs;
mod network;

pub use atoms::write_atom_tables;
pub use codec::{ByteReader, ByteWriter};
pub use constructs::{FactsItem, ModulesItem, RulesItem, TemplatesItem};
pub use exprs::ExpressionsItem;
pub use network::{JoinNetworkItem, PatternNetworkItem};

use engine::{Engine, EngineError};
use rete::{JoinId, PatternNodeId, TerminalId};
use rule_model::atom::{AtomId, NULL_ID};
use rule_model::expr::{ExprId, HashedExprId};
use rule_model::module::ModuleId;
use rule_model::template::TemplateId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::info;

/// 8-byte magic prefix.
pub const PREFIX: &[u8; 8] = b"CORTEXB1";

/// 16-byte version field (crate version, space padded).
pub fn version_field() -> [u8; 16] {
    let mut field = [b' '; 16];
    let version = env!("CARGO_PKG_VERSION").as_bytes();
    let len = version.len().min(16);
    field[..len].copy_from_slice(&version[..len]);
    field
}

/// Primitive widths the reader must agree on.
pub fn sizes_vector() -> SmallVec<[u8; 8]> {
    SmallVec::from_slice(&[
        std::mem::size_of::<u16>() as u8,
        std::mem::size_of::<u32>() as u8,
        std::mem::size_of::<u64>() as u8,
        std::mem::size_of::<usize>() as u8,
        std::mem::size_of::<*const ()>() as u8,
    ])
}

/// Image error types
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// Input ended inside a record
    #[error("truncated image")]
    Truncated,

    /// Prefix, version, or sizes vector differ from this build
    #[error("binary format mismatch: {0}")]
    FormatMismatch(String),

    /// Structurally invalid image
    #[error("corrupt image: {0}")]
    Corrupt(String),

    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Engine rejected restored state
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result type for image operations
pub type ImageResult<T> = Result<T, ImageError>;

/// One subsystem contributing to the image.
///
/// `find` assigns dense save ids and marks referenced atoms as needed;
/// `write_storage` emits the counts the loader allocates from;
/// `write_data` emits the flat records; the `read_*` pair mirrors them.
pub trait BinaryItem {
    /// Chunk name (written length-prefixed).
    fn name(&self) -> &'static str;

    /// Save/load order; higher priorities come first.
    fn priority(&self) -> i32;

    /// Count objects, assign dense ids, mark needed atoms.
    fn find(&self, engine: &mut Engine);

    /// Write the storage block (counts).
    fn write_storage(&self, engine: &Engine, writer: &mut ByteWriter);

    /// Write the data block (records, id-encoded references).
    fn write_data(&self, engine: &Engine, writer: &mut ByteWriter);

    /// Read the storage block and allocate.
    fn read_storage(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()>;

    /// Read the data block and rebuild objects, resolving ids through the
    /// context.
    fn read_data(
        &self,
        engine: &mut Engine,
        ctx: &mut LoadContext,
        reader: &mut ByteReader<'_>,
    ) -> ImageResult<()>;

    /// Release this item's state (reverse-priority clear protocol).
    fn clear(&self, engine: &mut Engine);
}

/// Priority-ordered registry of binary items.
pub struct BinaryRegistry {
    items: Vec<Box<dyn BinaryItem>>,
}

impl BinaryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Registry with the engine's standard items installed.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(Box::new(ExpressionsItem));
        registry.add(Box::new(ModulesItem));
        registry.add(Box::new(TemplatesItem));
        registry.add(Box::new(PatternNetworkItem));
        registry.add(Box::new(JoinNetworkItem));
        registry.add(Box::new(RulesItem));
        registry.add(Box::new(FactsItem));
        registry
    }

    /// Register an item in stable priority order.
    pub fn add(&mut self, item: Box<dyn BinaryItem>) {
        let priority = item.priority();
        let position = self
            .items
            .iter()
            .position(|existing| existing.priority() < priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, item);
    }

    /// Items in save order.
    pub fn items(&self) -> &[Box<dyn BinaryItem>] {
        &self.items
    }
}

impl Default for BinaryRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Id-to-handle maps built while loading.
#[derive(Default)]
pub struct LoadContext {
    /// Dense atom id to interned atom
    pub atoms: Vec<AtomId>,
    /// Flat expression-node index to pool node
    pub expr_nodes: Vec<ExprId>,
    /// Hashed-expression root id to interned tree
    pub hashed_roots: FxHashMap<u64, HashedExprId>,
    /// One handle per interned root, released when loading finishes
    pub root_handles: Vec<HashedExprId>,
    /// Dense module id to module
    pub modules: Vec<ModuleId>,
    /// Dense template id to template
    pub templates: Vec<TemplateId>,
    /// Dense pattern-node id to node
    pub nodes: Vec<PatternNodeId>,
    /// Dense terminal id to terminal
    pub terminals: Vec<TerminalId>,
    /// Dense join id to join
    pub joins: Vec<JoinId>,
    /// Saved current-module id, applied by the after-load hooks
    pub current_module: Option<u64>,
    /// First record count announced by the current chunk's storage block
    pub pending_primary: u64,
    /// Second record count announced by the current chunk's storage block
    pub pending_secondary: u64,
}

impl LoadContext {
    /// Resolve a dense atom id.
    pub fn atom(&self, id: u64) -> ImageResult<AtomId> {
        self.atoms
            .get(id as usize)
            .copied()
            .ok_or_else(|| ImageError::Corrupt(format!("atom id {id} out of range")))
    }

    /// Resolve an optional dense atom id.
    pub fn opt_atom(&self, id: Option<u64>) -> ImageResult<Option<AtomId>> {
        id.map(|id| self.atom(id)).transpose()
    }

    /// Resolve a hashed-expression root id, taking one reference.
    pub fn expr(&self, engine: &mut Engine, id: u64) -> ImageResult<HashedExprId> {
        let hid = self
            .hashed_roots
            .get(&id)
            .copied()
            .ok_or_else(|| ImageError::Corrupt(format!("expression id {id} out of range")))?;
        engine.exprs.retain_hashed(hid);
        Ok(hid)
    }

    /// Resolve an optional hashed-expression root id.
    pub fn opt_expr(
        &self,
        engine: &mut Engine,
        id: Option<u64>,
    ) -> ImageResult<Option<HashedExprId>> {
        id.map(|id| self.expr(engine, id)).transpose()
    }

    /// Resolve a dense module id.
    pub fn module(&self, id: u64) -> ImageResult<ModuleId> {
        self.modules
            .get(id as usize)
            .copied()
            .ok_or_else(|| ImageError::Corrupt(format!("module id {id} out of range")))
    }

    /// Resolve a dense template id.
    pub fn template(&self, id: u64) -> ImageResult<TemplateId> {
        self.templates
            .get(id as usize)
            .copied()
            .ok_or_else(|| ImageError::Corrupt(format!("template id {id} out of range")))
    }

    /// Resolve a dense pattern-node id.
    pub fn node(&self, id: u64) -> ImageResult<PatternNodeId> {
        self.nodes
            .get(id as usize)
            .copied()
            .ok_or_else(|| ImageError::Corrupt(format!("pattern node id {id} out of range")))
    }

    /// Resolve a dense terminal id.
    pub fn terminal(&self, id: u64) -> ImageResult<TerminalId> {
        self.terminals
            .get(id as usize)
            .copied()
            .ok_or_else(|| ImageError::Corrupt(format!("terminal id {id} out of range")))
    }

    /// Resolve a dense join id.
    pub fn join(&self, id: u64) -> ImageResult<JoinId> {
        self.joins
            .get(id as usize)
            .copied()
            .ok_or_else(|| ImageError::Corrupt(format!("join id {id} out of range")))
    }
}

/// Dense atom-id reference for a marked atom (save side).
pub(crate) fn atom_ref(engine: &Engine, atom: AtomId) -> u64 {
    engine
        .atoms
        .get(atom)
        .map(|cell| cell.bsave_id)
        .unwrap_or(NULL_ID)
}

/// Dense root id of an interned expression (save side).
pub(crate) fn expr_ref(engine: &Engine, expr: HashedExprId) -> u64 {
    engine.exprs.hashed(expr).bsave_id
}

/// Serialize the engine into an image buffer.
///
/// Stop-the-world: no propagation may be in progress.
pub fn save(engine: &mut Engine, registry: &BinaryRegistry) -> ImageResult<Vec<u8>> {
    if engine.network.drive_in_progress() {
        return Err(ImageError::Engine(EngineError::NotDeletable(
            "propagation in progress".to_owned(),
        )));
    }

    // Find phase: every item assigns its dense ids and marks the atoms it
    // references; the atom tables are numbered afterwards so the marks are
    // complete.
    for item in registry.items() {
        item.find(engine);
    }
    let atom_count = atoms::assign_atom_ids(engine);

    let mut writer = ByteWriter::new();
    writer.raw(PREFIX);
    writer.raw(&version_field());
    let sizes = sizes_vector();
    writer.u8(sizes.len() as u8);
    writer.raw(&sizes);

    // Atom tables precede every other chunk: all id-encoded references
    // resolve through them.
    let mut storage = ByteWriter::new();
    let mut data = ByteWriter::new();
    atoms::write_atom_tables(engine, atom_count, &mut storage, &mut data);
    write_chunk(&mut writer, "atoms", storage, data);

    for item in registry.items() {
        let mut storage = ByteWriter::new();
        let mut data = ByteWriter::new();
        item.write_storage(engine, &mut storage);
        item.write_data(engine, &mut data);
        write_chunk(&mut writer, item.name(), storage, data);
    }

    // Footer sentinel.
    writer.u64(0);

    // Restore phase: the find phase overwrote in-object state.
    clear_save_marks(engine);

    info!(bytes = writer.len(), "image saved");
    Ok(writer.into_bytes())
}

fn write_chunk(writer: &mut ByteWriter, name: &str, storage: ByteWriter, data: ByteWriter) {
    writer.str(name);
    writer.bytes(&storage.into_bytes());
    writer.bytes(&data.into_bytes());
}

/// Restore an engine from an image buffer.
///
/// The engine is cleared first; a header mismatch fails the load and leaves
/// it in that cleared state.
pub fn load(engine: &mut Engine, registry: &BinaryRegistry, bytes: &[u8]) -> ImageResult<()> {
    engine.clear()?;

    let mut reader = ByteReader::new(bytes);
    let prefix = reader.raw(8)?;
    if prefix != PREFIX {
        return Err(ImageError::FormatMismatch("prefix".to_owned()));
    }
    let version = reader.raw(16)?;
    if version != version_field() {
        return Err(ImageError::FormatMismatch("version".to_owned()));
    }
    let size_count = reader.u8()? as usize;
    let sizes = reader.raw(size_count)?;
    if sizes != sizes_vector().as_slice() {
        return Err(ImageError::FormatMismatch("primitive sizes".to_owned()));
    }

    let mut ctx = LoadContext::default();
    loop {
        let name_len_probe = reader.u64()?;
        if name_len_probe == 0 {
            break;
        }
        let name_bytes = reader.raw(name_len_probe as usize)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| ImageError::Corrupt("invalid chunk name".to_owned()))?
            .to_owned();
        let storage = reader.bytes()?;
        let data = reader.bytes()?;

        if name == "atoms" {
            let mut storage_reader = ByteReader::new(storage);
            let mut data_reader = ByteReader::new(data);
            atoms::read_atom_tables(engine, &mut ctx, &mut storage_reader, &mut data_reader)?;
            continue;
        }
        let item = registry
            .items()
            .iter()
            .find(|item| item.name() == name)
            .ok_or_else(|| ImageError::Corrupt(format!("unknown chunk {name}")))?;
        let mut storage_reader = ByteReader::new(storage);
        item.read_storage(engine, &mut ctx, &mut storage_reader)?;
        let mut data_reader = ByteReader::new(data);
        item.read_data(engine, &mut ctx, &mut data_reader)?;
    }

    after_load(engine, &mut ctx)?;
    info!("image loaded");
    Ok(())
}

// After-load hooks: template relinking, empty-match drives, fact
// re-propagation, agenda rebuild, module focus restore.
fn after_load(engine: &mut Engine, ctx: &mut LoadContext) -> ImageResult<()> {
    engine.relink_initial_template();
    if let Some(current) = ctx.current_module {
        let module = ctx.module(current)?;
        engine
            .modules
            .set_current(module)
            .map_err(EngineError::from)?;
    }
    engine.repropagate_all_facts();

    // The interning pass took one handle per root; references hold their
    // own counts now.
    for hid in ctx.root_handles.drain(..) {
        engine.exprs.release_hashed(hid, &mut engine.atoms);
    }
    engine.atoms.sweep();
    Ok(())
}

// Reset transient save-phase state: needed marks and dense ids.
fn clear_save_marks(engine: &mut Engine) {
    engine.atoms.clear_needed();
    let atom_ids: Vec<AtomId> = engine.atoms.iter().map(|(id, _)| id).collect();
    for id in atom_ids {
        if let Some(cell) = engine.atoms.get_mut(id) {
            cell.bsave_id = NULL_ID;
        }
    }
    let hashed: Vec<HashedExprId> = engine.exprs.iter_hashed().map(|(id, _)| id).collect();
    for hid in hashed {
        engine.exprs.hashed_mut(hid).bsave_id = NULL_ID;
    }
    let modules: Vec<ModuleId> = engine.modules.iter().map(|(id, _)| id).collect();
    for id in modules {
        if let Some(module) = engine.modules.get_mut(id) {
            module.bsave_id = NULL_ID;
        }
    }
    let templates: Vec<TemplateId> = engine.templates.iter().map(|(id, _)| id).collect();
    for id in templates {
        if let Some(template) = engine.templates.get_mut(id) {
            template.header.bsave_id = NULL_ID;
        }
    }
    let nodes: Vec<PatternNodeId> = engine
        .network
        .patterns
        .nodes
        .iter()
        .map(|(id, _)| id)
        .collect();
    for id in nodes {
        if let Some(node) = engine.network.patterns.nodes.get_mut(id) {
            node.bsave_id = NULL_ID;
        }
    }
    let terminals: Vec<TerminalId> = engine
        .network
        .patterns
        .terminals
        .iter()
        .map(|(id, _)| id)
        .collect();
    for id in terminals {
        if let Some(terminal) = engine.network.patterns.terminals.get_mut(id) {
            terminal.bsave_id = NULL_ID;
        }
    }
    let joins: Vec<JoinId> = engine.network.joins.iter().map(|(id, _)| id).collect();
    for id in joins {
        if let Some(join) = engine.network.joins.get_mut(id) {
            join.bsave_id = NULL_ID;
        }
    }
    let rules: Vec<engine::RuleId> = engine.rules.iter().map(|(id, _)| id).collect();
    for id in rules {
        if let Some(rule) = engine.rules.get_mut(id) {
            rule.header.bsave_id = NULL_ID;
        }
    }
}

/// Save an image to a file.
pub fn save_to_path(
    engine: &mut Engine,
    registry: &BinaryRegistry,
    path: &std::path::Path,
) -> ImageResult<()> {
    let bytes = save(engine, registry)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Load an image from a file.
pub fn load_from_path(
    engine: &mut Engine,
    registry: &BinaryRegistry,
    path: &std::path::Path,
) -> ImageResult<()> {
    let bytes = std::fs::read(path)?;
    load(engine, registry, &bytes)
}
