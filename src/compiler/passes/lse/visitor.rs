//! Per-block heap value tracking.
//!
//! The visitor walks the blocks in reverse post-order. Each block starts from
//! the merge of its predecessors' exit records (or from placeholders at loop
//! headers) and updates them instruction by instruction. Loads with a known
//! value are recorded for replacement, stores are recorded with the value
//! they overwrite, and every store whose effect may be observed is marked as
//! kept, either directly or through the placeholder it flows into.

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    analysis::heap::HeapLocationCollector,
    compiler::{
        events::EventKind,
        passes::lse::{
            value::{PhiPlaceholder, Value, ValueRecord},
            Transformation,
        },
    },
    ir::{BlockId, ControlFlowInfo, DataType, Graph, InstId, Op, SideEffects},
    utils::BitSet,
    Result,
};

/// Which half of the pass is running.
///
/// Placeholder resolution behaves differently once loads are settled: no new
/// phis may be created while looking for the old values of stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    LoadElimination,
    StoreElimination,
}

/// The value a store overwrote and the value it writes.
#[derive(Debug, Clone, Copy)]
pub(super) struct StoreRecord {
    pub(super) old_value_record: ValueRecord,
    pub(super) stored_value: InstId,
    /// The heap value the store left in its location: the stored value, or
    /// the loop placeholder of a stored load still waiting for its phi.
    pub(super) written: Value,
}

/// A load or store in visiting order.
#[derive(Debug, Clone, Copy)]
pub(super) struct LoadStoreRecord {
    pub(super) inst: InstId,
    pub(super) block: BlockId,
    pub(super) location: usize,
}

/// State of one run of load-store elimination over a graph.
pub(super) struct LseVisitor<'a> {
    pub(super) graph: &'a mut Graph,
    pub(super) cfg: &'a ControlFlowInfo,
    pub(super) collector: &'a HeapLocationCollector,
    pub(super) phase: Phase,

    /// Exit records of every block, one per heap location.
    pub(super) heap_values_for: Vec<Vec<ValueRecord>>,

    /// Dense numbering of merge blocks, `usize::MAX` for the others.
    phi_block_index: Vec<usize>,
    phi_blocks: Vec<BlockId>,
    pub(super) phi_placeholder_replacements: Vec<Value>,

    pub(super) kept_stores: FxHashSet<InstId>,
    pub(super) phi_placeholders_to_search_for_kept_stores: BitSet,
    pub(super) loads_requiring_loop_phi: FxHashMap<InstId, ValueRecord>,
    pub(super) store_records: FxHashMap<InstId, StoreRecord>,
    /// Stores that wrote the value already held by an aliasing location,
    /// keyed by the store recorded for that location.
    pub(super) overlapping_stores: FxHashMap<InstId, Vec<InstId>>,
    pub(super) loads_and_stores: Vec<LoadStoreRecord>,
    pub(super) substitutes: FxHashMap<InstId, InstId>,
    pub(super) singleton_new_instances: Vec<InstId>,

    /// Default constants interned by the pass; dropped again if unused.
    pub(super) created_constants: Vec<InstId>,
    pub(super) transformations: Vec<Transformation>,
}

impl<'a> LseVisitor<'a> {
    pub(super) fn new(
        graph: &'a mut Graph,
        cfg: &'a ControlFlowInfo,
        collector: &'a HeapLocationCollector,
    ) -> Self {
        let location_count = collector.location_count();
        let block_count = graph.block_count();
        let mut phi_block_index = vec![usize::MAX; block_count];
        let mut phi_blocks = Vec::new();
        for &block in cfg.reverse_post_order() {
            if graph.block(block).predecessors().len() >= 2 {
                phi_block_index[block.index()] = phi_blocks.len();
                phi_blocks.push(block);
            }
        }
        let placeholder_count = phi_blocks.len() * location_count;

        Self {
            graph,
            cfg,
            collector,
            phase: Phase::LoadElimination,
            heap_values_for: vec![vec![ValueRecord::UNKNOWN; location_count]; block_count],
            phi_block_index,
            phi_blocks,
            phi_placeholder_replacements: vec![Value::Invalid; placeholder_count],
            kept_stores: FxHashSet::default(),
            phi_placeholders_to_search_for_kept_stores: BitSet::new(placeholder_count),
            loads_requiring_loop_phi: FxHashMap::default(),
            store_records: FxHashMap::default(),
            overlapping_stores: FxHashMap::default(),
            loads_and_stores: Vec::new(),
            substitutes: FxHashMap::default(),
            singleton_new_instances: Vec::new(),
            created_constants: Vec::new(),
            transformations: Vec::new(),
        }
    }

    /// Runs all phases and returns the transformations performed.
    pub(super) fn run(mut self) -> Result<Vec<Transformation>> {
        let cfg = self.cfg;
        for &block in cfg.reverse_post_order() {
            self.visit_block(block)?;
        }

        self.process_loads_requiring_loop_phis()?;
        self.settle_stored_loop_values();

        self.phase = Phase::StoreElimination;
        self.search_phi_placeholders_for_kept_stores();
        self.find_stores_writing_old_values()?;

        self.finish()?;
        Ok(self.transformations)
    }

    // ── Placeholders ────────────────────────────────────────────────────

    pub(super) fn location_count(&self) -> usize {
        self.collector.location_count()
    }

    pub(super) fn placeholder(&self, block: BlockId, location: usize) -> PhiPlaceholder {
        debug_assert_ne!(self.phi_block_index[block.index()], usize::MAX);
        PhiPlaceholder::new(block, location)
    }

    pub(super) fn placeholder_index(&self, placeholder: PhiPlaceholder) -> usize {
        self.phi_block_index[placeholder.block().index()] * self.location_count()
            + placeholder.location()
    }

    pub(super) fn placeholder_at(&self, index: usize) -> PhiPlaceholder {
        let count = self.location_count();
        PhiPlaceholder::new(self.phi_blocks[index / count], index % count)
    }

    pub(super) fn placeholder_count(&self) -> usize {
        self.phi_placeholder_replacements.len()
    }

    pub(super) fn replacement(&self, placeholder: PhiPlaceholder) -> Value {
        self.phi_placeholder_replacements[self.placeholder_index(placeholder)]
    }

    /// The replacement of a placeholder value once it is known, else `value`.
    pub(super) fn replacement_or_value(&self, value: Value) -> Value {
        match value {
            Value::NeedsNonLoopPhi(ph) | Value::NeedsLoopPhi(ph) => {
                let replacement = self.replacement(ph);
                if replacement.is_valid() {
                    replacement
                } else {
                    value
                }
            }
            _ => value,
        }
    }

    /// Follows recorded load substitutions to the value that replaces `inst`.
    pub(super) fn find_substitute(&self, inst: InstId) -> InstId {
        let mut current = inst;
        while let Some(&next) = self.substitutes.get(&current) {
            current = next;
        }
        current
    }

    /// The interned zero of `ty`.
    pub(super) fn default_value(&mut self, ty: DataType) -> InstId {
        let before = self.graph.instruction_count();
        let constant = self.graph.constant(ty.default_value());
        if self.graph.instruction_count() != before {
            self.created_constants.push(constant);
        }
        constant
    }

    pub(super) fn record(&mut self, kind: EventKind, inst: InstId, message: String) {
        trace!("{}: {} {}", self.graph.signature(), kind, message);
        self.transformations.push(Transformation {
            kind,
            inst,
            message,
        });
    }

    // ── Block entry ─────────────────────────────────────────────────────

    fn visit_block(&mut self, block: BlockId) -> Result<()> {
        if self.cfg.is_loop_header(block) {
            self.prepare_loop_records(block)?;
        } else {
            self.merge_predecessor_records(block);
        }
        let instructions = self.graph.block(block).instructions().to_vec();
        for inst in instructions {
            if self.graph.inst(inst).is_removed() {
                continue;
            }
            self.visit_instruction(block, inst)?;
        }
        Ok(())
    }

    fn prepare_loop_records(&mut self, header: BlockId) -> Result<()> {
        let preheader = self
            .cfg
            .loop_of(header)
            .and_then(|l| l.preheader)
            .ok_or_else(|| invariant_error!("loop at {} has no preheader", header))?;
        let records: Vec<ValueRecord> = (0..self.location_count())
            .map(|idx| ValueRecord {
                value: self.prepare_loop_value(header, preheader, idx),
                stored_by: self.prepare_loop_stored_by(header, idx),
            })
            .collect();
        self.heap_values_for[header.index()] = records;
        Ok(())
    }

    /// A known preheader value becomes a loop placeholder; the back edges are
    /// only known once the whole loop has been visited.
    pub(super) fn prepare_loop_value(&self, header: BlockId, preheader: BlockId, idx: usize) -> Value {
        let value = self.replacement_or_value(self.heap_values_for[preheader.index()][idx].value);
        if value.is_unknown() {
            return value;
        }
        self.replacement_or_value(Value::NeedsLoopPhi(self.placeholder(header, idx)))
    }

    fn prepare_loop_stored_by(&self, header: BlockId, idx: usize) -> Value {
        // A singleton allocated inside the loop is dead at the header.
        let ref_info = self.collector.reference_info_of(idx);
        let reference = ref_info.reference();
        let allocated_in_loop = self.graph.inst(reference).block().is_some_and(|block| {
            self.cfg
                .loop_of(header)
                .is_some_and(|loop_info| loop_info.contains(block))
        });
        if ref_info.is_singleton() && allocated_in_loop && !self.is_finalizable(reference) {
            return Value::Unknown;
        }
        Value::NeedsLoopPhi(self.placeholder(header, idx))
    }

    fn merge_predecessor_records(&mut self, block: BlockId) {
        let predecessors = self.graph.block(block).predecessors().to_vec();
        let count = self.location_count();
        let records = if predecessors.is_empty() {
            vec![ValueRecord::UNKNOWN; count]
        } else {
            (0..count)
                .map(|idx| ValueRecord {
                    value: self.merge_predecessor_values(block, &predecessors, idx),
                    stored_by: self.merge_predecessor_stored_by(block, &predecessors, idx),
                })
                .collect()
        };
        self.heap_values_for[block.index()] = records;
    }

    pub(super) fn merge_predecessor_values(
        &self,
        block: BlockId,
        predecessors: &[BlockId],
        idx: usize,
    ) -> Value {
        let Some((&first, rest)) = predecessors.split_first() else {
            return Value::Unknown;
        };
        let mut merged = self.replacement_or_value(self.heap_values_for[first.index()][idx].value);
        for &pred in rest {
            let pred_value =
                self.replacement_or_value(self.heap_values_for[pred.index()][idx].value);
            if pred_value.equals(merged, self.graph) {
                continue;
            }
            if pred_value.is_unknown() || merged.is_unknown() {
                merged = Value::MergedUnknown(self.placeholder(block, idx));
                break;
            }
            let needs_loop_phi = merged.needs_loop_phi() || pred_value.needs_loop_phi();
            merged = self.replacement_or_value(Value::for_phi_placeholder(
                self.placeholder(block, idx),
                needs_loop_phi,
            ));
        }
        merged
    }

    fn merge_predecessor_stored_by(&self, block: BlockId, predecessors: &[BlockId], idx: usize) -> Value {
        let first = self.heap_values_for[predecessors[0].index()][idx].stored_by;
        if predecessors
            .iter()
            .all(|pred| self.heap_values_for[pred.index()][idx].stored_by == first)
        {
            first
        } else {
            Value::NeedsNonLoopPhi(self.placeholder(block, idx))
        }
    }

    // ── Instructions ────────────────────────────────────────────────────

    fn visit_instruction(&mut self, block: BlockId, inst: InstId) -> Result<()> {
        let op = self.graph.op(inst).clone();
        match op {
            Op::InstanceFieldGet { .. } | Op::StaticFieldGet { .. } | Op::ArrayGet { .. } => {
                let idx = self.access_location(inst)?;
                self.visit_get(block, inst, idx)
            }
            Op::InstanceFieldSet {
                value,
                predicated: false,
                ..
            }
            | Op::StaticFieldSet { value, .. }
            | Op::ArraySet { value, .. } => {
                let idx = self.access_location(inst)?;
                self.visit_set(block, inst, idx, value)
            }
            Op::InstanceFieldSet {
                predicated: true, ..
            } => {
                self.handle_heap_barrier(block, inst, SideEffects::READS_HEAP | SideEffects::WRITES_HEAP);
                Ok(())
            }
            Op::PredicatedInstanceFieldGet { .. } => {
                self.handle_heap_barrier(block, inst, SideEffects::READS_HEAP);
                Ok(())
            }
            Op::NewInstance { .. } | Op::NewArray { .. } => {
                self.visit_allocation(block, inst);
                Ok(())
            }
            Op::Deoptimize { env, .. } => {
                self.visit_deoptimize(block, &env);
                Ok(())
            }
            Op::Return { .. } | Op::ReturnVoid | Op::Throw { .. } => {
                self.handle_exit(block);
                Ok(())
            }
            other => {
                if let Some(effects) = other.call_effects() {
                    self.handle_heap_barrier(block, inst, effects);
                } else if self.graph.can_throw(inst) {
                    self.handle_exit(block);
                }
                Ok(())
            }
        }
    }

    fn access_location(&self, access: InstId) -> Result<usize> {
        self.collector
            .location_of(access)
            .ok_or_else(|| invariant_error!("heap access {} has no location", access))
    }

    fn visit_get(&mut self, block: BlockId, load: InstId, idx: usize) -> Result<()> {
        self.loads_and_stores.push(LoadStoreRecord {
            inst: load,
            block,
            location: idx,
        });
        let bi = block.index();
        let record = self.heap_values_for[bi][idx];
        let mut value = self.replacement_or_value(record.value);
        if let Value::Instruction(known) = value {
            if self.graph.ty(known).kind() != self.graph.ty(load).kind() {
                value = Value::Unknown;
            }
        }

        match value {
            Value::Default => {
                self.keep_stores(record.stored_by);
                let constant = self.default_value(self.graph.ty(load));
                self.add_removed_load(load, constant)?;
                self.heap_values_for[bi][idx].value = Value::Instruction(constant);
            }
            Value::Unknown | Value::MergedUnknown(_) => {
                // The load stays and becomes the known value of its location.
                self.heap_values_for[bi][idx].value = Value::Instruction(load);
                self.keep_stores_if_aliased_to_location(bi, idx);
                self.keep_stores(value);
            }
            Value::NeedsLoopPhi(_) => {
                self.loads_requiring_loop_phi.insert(
                    load,
                    ValueRecord {
                        value,
                        stored_by: record.stored_by,
                    },
                );
            }
            Value::NeedsNonLoopPhi(_) | Value::Instruction(_) | Value::Invalid => {
                if let Value::NeedsNonLoopPhi(ph) = value {
                    self.materialize_non_loop_phis(ph, self.graph.ty(load))?;
                    value = self.replacement(ph);
                    self.heap_values_for[bi][idx].value = value;
                }
                let Value::Instruction(known) = value else {
                    return Err(invariant_error!("load {} resolved to {}", load, value));
                };
                let known = self.find_substitute(known);
                self.add_removed_load(load, known)?;
            }
        }
        Ok(())
    }

    fn visit_set(&mut self, block: BlockId, store: InstId, idx: usize, value: InstId) -> Result<()> {
        let value = self.find_substitute(value);
        let bi = block.index();
        let record = self.heap_values_for[bi][idx];

        if record.value.equals_instruction(value, self.graph) {
            self.graph.remove(store)?;
            self.record(
                EventKind::StoreEliminated,
                store,
                format!("{store} writes the value already held"),
            );
            return Ok(());
        }

        let new_value = match self.loads_requiring_loop_phi.get(&value) {
            Some(load_record) => load_record.value,
            None => Value::Instruction(value),
        };
        self.store_records.insert(
            store,
            StoreRecord {
                old_value_record: record,
                stored_value: value,
                written: new_value,
            },
        );
        self.loads_and_stores.push(LoadStoreRecord {
            inst: store,
            block,
            location: idx,
        });

        if self.graph.can_throw(store) {
            self.handle_exit(block);
            self.keep_store(store);
        }

        let records = &mut self.heap_values_for[bi];
        records[idx].value = new_value;
        records[idx].stored_by = Value::Instruction(store);

        // Kill the locations the store may overwrite.
        for i in 0..self.collector.location_count() {
            let current = self.heap_values_for[bi][i];
            if i == idx || current.value.is_unknown() || !self.collector.may_alias(i, idx) {
                continue;
            }
            if !current.value.equals_instruction(value, self.graph) {
                self.keep_stores(current.stored_by);
                self.heap_values_for[bi][i] = ValueRecord::UNKNOWN;
                continue;
            }
            // The value survives, but this store may now be the one that
            // wrote it.
            match current.stored_by {
                Value::Instruction(previous) => {
                    self.overlapping_stores.entry(previous).or_default().push(store);
                }
                Value::Unknown => {}
                stored_by => {
                    self.keep_stores(stored_by);
                    self.heap_values_for[bi][i].stored_by = Value::Unknown;
                }
            }
        }
        Ok(())
    }

    fn visit_allocation(&mut self, block: BlockId, allocation: InstId) {
        let Some(ref_info) = self.collector.find_reference_info(self.graph, allocation) else {
            return;
        };
        if ref_info.reference() != allocation {
            return;
        }
        if ref_info.is_singleton_and_removable() {
            self.singleton_new_instances.push(allocation);
        }
        let bi = block.index();
        for i in 0..self.location_count() {
            let info = self.collector.reference_info_of(i);
            if info.reference() == allocation {
                self.heap_values_for[bi][i] = ValueRecord {
                    value: Value::Default,
                    stored_by: Value::Unknown,
                };
            } else if !info.is_singleton_and_removable() {
                // The allocation may throw.
                let stored_by = self.heap_values_for[bi][i].stored_by;
                self.keep_stores(stored_by);
                self.heap_values_for[bi][i].stored_by = Value::Unknown;
            }
        }
    }

    fn visit_deoptimize(&mut self, block: BlockId, env: &[InstId]) {
        let bi = block.index();
        for i in 0..self.location_count() {
            let stored_by = self.heap_values_for[bi][i].stored_by;
            if stored_by.is_unknown() {
                continue;
            }
            let info = self.collector.reference_info_of(i);
            let reference = info.reference();
            let observable = !info.is_singleton()
                || self.is_finalizable(reference)
                || env.contains(&reference);
            if observable {
                self.keep_stores(stored_by);
                self.heap_values_for[bi][i].stored_by = Value::Unknown;
            }
        }
    }

    /// Calls, class initialization, unresolved and predicated accesses.
    fn handle_heap_barrier(&mut self, block: BlockId, inst: InstId, effects: SideEffects) {
        let bi = block.index();
        let touches_heap = effects.intersects(SideEffects::READS_HEAP | SideEffects::WRITES_HEAP);
        for i in 0..self.location_count() {
            if self.collector.reference_info_of(i).is_singleton() {
                continue;
            }
            if touches_heap {
                let stored_by = self.heap_values_for[bi][i].stored_by;
                self.keep_stores(stored_by);
                self.heap_values_for[bi][i].stored_by = Value::Unknown;
            }
            if effects.contains(SideEffects::WRITES_HEAP) {
                self.heap_values_for[bi][i].value = Value::Unknown;
            }
        }
        if self.graph.can_throw(inst) {
            self.handle_exit(block);
        }
    }

    /// Control may leave the method: stores to objects that outlive it stay.
    fn handle_exit(&mut self, block: BlockId) {
        let bi = block.index();
        for i in 0..self.location_count() {
            if self.collector.reference_info_of(i).is_singleton_and_removable() {
                continue;
            }
            let stored_by = self.heap_values_for[bi][i].stored_by;
            self.keep_stores(stored_by);
            self.heap_values_for[bi][i].stored_by = Value::Unknown;
        }
    }

    pub(super) fn is_finalizable(&self, reference: InstId) -> bool {
        matches!(self.graph.op(reference), Op::NewInstance { class, .. } if self.graph.class(*class).is_finalizable)
    }

    // ── Kept stores ─────────────────────────────────────────────────────

    pub(super) fn keep_stores(&mut self, stored_by: Value) {
        match stored_by {
            Value::MergedUnknown(ph) | Value::NeedsNonLoopPhi(ph) | Value::NeedsLoopPhi(ph) => {
                let index = self.placeholder_index(ph);
                self.phi_placeholders_to_search_for_kept_stores.insert(index);
            }
            Value::Instruction(store) => self.keep_store(store),
            Value::Unknown | Value::Default | Value::Invalid => {}
        }
    }

    /// Keeps `store` and the later stores that may have rewritten the same
    /// value into its location.
    pub(super) fn keep_store(&mut self, store: InstId) {
        let mut visited = FxHashSet::default();
        let mut work_queue = vec![store];
        while let Some(store) = work_queue.pop() {
            if !visited.insert(store) {
                continue;
            }
            self.kept_stores.insert(store);
            if let Some(overlapping) = self.overlapping_stores.get(&store) {
                work_queue.extend(overlapping.iter().copied());
            }
        }
    }

    fn keep_stores_if_aliased_to_location(&mut self, bi: usize, idx: usize) {
        for i in 0..self.location_count() {
            if i == idx || self.collector.may_alias(i, idx) {
                let stored_by = self.heap_values_for[bi][i].stored_by;
                self.keep_stores(stored_by);
                self.heap_values_for[bi][i].stored_by = Value::Unknown;
            }
        }
    }

    // ── Removed loads ───────────────────────────────────────────────────

    /// Records that `load` is replaced by `value`, converted to the load's type.
    pub(super) fn add_removed_load(&mut self, load: InstId, value: InstId) -> Result<()> {
        self.try_removing_null_check(load)?;
        let ty = self.graph.ty(load);
        let substitute = self
            .find_or_add_type_conversion(load, value, ty)?
            .unwrap_or(value);
        trace!("{}: {} -> {}", self.graph.signature(), load, substitute);
        self.substitutes.insert(load, substitute);
        Ok(())
    }

    /// A null check right before an eliminated load of its result is
    /// redundant: a known value means the reference was already dereferenced
    /// or allocated on every path.
    fn try_removing_null_check(&mut self, load: InstId) -> Result<()> {
        let object = match *self.graph.op(load) {
            Op::InstanceFieldGet { object, .. } => object,
            Op::ArrayGet { array, .. } => array,
            _ => return Ok(()),
        };
        if self.graph.previous_instruction(load) != Some(object) {
            return Ok(());
        }
        let Op::NullCheck { input } = *self.graph.op(object) else {
            return Ok(());
        };
        self.graph.replace_all_uses(object, input);
        self.graph.remove(object)?;
        self.record(
            EventKind::NullCheckRemoved,
            object,
            format!("{object} guarded eliminated {load}"),
        );
        Ok(())
    }

    fn find_or_add_type_conversion(
        &mut self,
        load: InstId,
        value: InstId,
        ty: DataType,
    ) -> Result<Option<InstId>> {
        if DataType::is_type_conversion_implicit(self.graph.ty(value), ty)
            || self.graph.is_zero_bit_pattern(value)
        {
            return Ok(None);
        }
        let existing = self.graph.uses(value).iter().copied().find(|&user| {
            matches!(self.graph.op(user), Op::TypeConversion { input } if *input == value)
                && self.graph.ty(user) == ty
                && self.cfg.instruction_dominates(self.graph, user, load, None)
        });
        if existing.is_some() {
            return Ok(existing);
        }
        let conversion = self
            .graph
            .insert_before(load, Op::TypeConversion { input: value }, ty)?;
        self.record(
            EventKind::TypeConversionInserted,
            conversion,
            format!("{value} as {ty} for {load}"),
        );
        Ok(Some(conversion))
    }
}
