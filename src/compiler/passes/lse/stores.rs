//! Store decisions and the final rewrite.

use log::trace;

use crate::{
    analysis::heap::{is_removable_allocation, ReferenceInfo},
    compiler::{
        events::EventKind,
        passes::lse::{
            value::{PhiPlaceholder, Value, ValueRecord},
            visitor::LseVisitor,
        },
    },
    ir::{DataType, InstId, Op},
    utils::BitSet,
    Result,
};

impl LseVisitor<'_> {
    /// Pins the values stored from loads that needed a loop phi.
    ///
    /// Such a store leaves the load's loop placeholder in its location. The
    /// load is settled now, and placeholder resolution starts over once stores
    /// go away, which would no longer describe what the load produced.
    pub(super) fn settle_stored_loop_values(&mut self) {
        for bi in 0..self.heap_values_for.len() {
            for idx in 0..self.location_count() {
                let record = self.heap_values_for[bi][idx];
                self.heap_values_for[bi][idx].value = self.settled_value(record, idx);
            }
        }

        let stores: Vec<(InstId, usize)> = self
            .loads_and_stores
            .iter()
            .filter(|r| self.store_records.contains_key(&r.inst))
            .map(|r| (r.inst, r.location))
            .collect();
        for (store, idx) in stores {
            let Some(old) = self.store_records.get(&store).map(|r| r.old_value_record) else {
                continue;
            };
            let value = self.settled_value(old, idx);
            if let Some(store_record) = self.store_records.get_mut(&store) {
                store_record.old_value_record.value = value;
            }
        }
    }

    fn settled_value(&self, record: ValueRecord, idx: usize) -> Value {
        let Value::NeedsLoopPhi(placeholder) = record.value else {
            return record.value;
        };
        if let Some(store_record) = record.stored_by.instruction().and_then(|s| self.store_records.get(&s)) {
            if store_record.written == record.value
                && self.loads_requiring_loop_phi.contains_key(&store_record.stored_value)
            {
                return Value::Instruction(self.find_substitute(store_record.stored_value));
            }
        }
        if placeholder.location() == idx {
            return record.value;
        }
        // Another location's placeholder, copied in by a store whose record
        // has been overwritten since.
        match self.replacement(placeholder) {
            Value::Instruction(inst) => Value::Instruction(self.find_substitute(inst)),
            _ => Value::Unknown,
        }
    }

    /// Marks every store that reaches a kept placeholder as kept.
    pub(super) fn search_phi_placeholders_for_kept_stores(&mut self) {
        let mut work_queue: Vec<usize> = self.phi_placeholders_to_search_for_kept_stores.iter().collect();
        while let Some(index) = work_queue.pop() {
            let placeholder = self.placeholder_at(index);
            let block = placeholder.block();
            let idx = placeholder.location();
            let is_loop_header = self.cfg.is_loop_header(block);
            let preheader = self.cfg.loop_of(block).and_then(|l| l.preheader);
            let predecessors = self.graph.block(block).predecessors().to_vec();
            for pred in predecessors {
                // On a back edge, stores to locations overlapping in a later
                // iteration are observable too.
                let back_edge = is_loop_header && Some(pred) != preheader;
                let range = if back_edge { 0..self.location_count() } else { idx..idx + 1 };
                for i in range {
                    let stored_by = self.heap_values_for[pred.index()][i].stored_by;
                    if stored_by.is_unknown() || (i != idx && !self.may_alias_on_back_edge(block, idx, i)) {
                        continue;
                    }
                    match stored_by {
                        Value::Instruction(store) => self.keep_store(store),
                        _ => {
                            if let Some(dep) = stored_by.phi_placeholder() {
                                let dep_index = self.placeholder_index(dep);
                                if self.phi_placeholders_to_search_for_kept_stores.insert(dep_index) {
                                    work_queue.push(dep_index);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drops kept stores that write the value the location already holds once
    /// all other removable stores are gone.
    pub(super) fn find_stores_writing_old_values(&mut self) -> Result<()> {
        // Replacements may have been computed from stores that are now
        // going away. Unknown ones stay unknown.
        for index in 0..self.placeholder_count() {
            if !self.phi_placeholder_replacements[index].is_unknown()
                && !self.phi_placeholders_to_search_for_kept_stores.contains(index)
            {
                self.phi_placeholder_replacements[index] = Value::Invalid;
            }
        }

        let cfg = self.cfg;
        for &block in cfg.reverse_post_order() {
            for idx in 0..self.location_count() {
                let mut record = self.heap_values_for[block.index()][idx];
                self.update_value_record_for_store_elimination(&mut record);
                self.heap_values_for[block.index()][idx] = record;
            }
        }

        let stores: Vec<_> = self
            .loads_and_stores
            .iter()
            .filter(|r| self.kept_stores.contains(&r.inst))
            .filter_map(|r| self.store_records.get(&r.inst).map(|s| (r.inst, *s)))
            .collect();
        let mut eliminated = Vec::new();
        for (store, mut store_record) in stores {
            let mut old = store_record.old_value_record;
            self.update_value_record_for_store_elimination(&mut old);
            if let Value::NeedsNonLoopPhi(placeholder) | Value::NeedsLoopPhi(placeholder) = old.value {
                let ty = self.graph.ty(store_record.stored_value);
                self.find_old_value_for_phi_placeholder(placeholder, ty)?;
                old.value = self.replacement_or_value(old.value);
            }
            store_record.old_value_record = old;
            self.store_records.insert(store, store_record);

            let stored_value = self.find_substitute(store_record.stored_value);
            if old.value.equals_instruction(stored_value, self.graph) {
                trace!("{}: {} writes the old value {}", self.graph.signature(), store, old.value);
                eliminated.push(store);
            }
        }
        for store in eliminated {
            self.kept_stores.remove(&store);
        }
        Ok(())
    }

    /// Rewinds a record past stores that are going away and normalizes the
    /// placeholders left in it.
    fn update_value_record_for_store_elimination(&self, record: &mut ValueRecord) {
        while let Value::Instruction(store) = record.stored_by {
            if self.kept_stores.contains(&store) {
                break;
            }
            let rewritten = self
                .overlapping_stores
                .get(&store)
                .is_some_and(|later| later.iter().any(|s| self.kept_stores.contains(s)));
            if rewritten {
                // Whether the value came from the dropped store or a kept
                // aliasing one is only known at run time.
                *record = ValueRecord::UNKNOWN;
                break;
            }
            let Some(store_record) = self.store_records.get(&store) else {
                break;
            };
            *record = store_record.old_value_record;
        }
        if let Some(placeholder) = record.stored_by.phi_placeholder() {
            if record.stored_by.needs_phi()
                && !self
                    .phi_placeholders_to_search_for_kept_stores
                    .contains(self.placeholder_index(placeholder))
            {
                // Some stores into the merge may go away: recompute the value.
                record.value = record.stored_by;
            }
        }
        record.value = self.replacement_or_value(record.value);
        if let Value::NeedsNonLoopPhi(placeholder) = record.value {
            // Treated as loop placeholders from here on so that resolution
            // never builds new phis.
            record.value = Value::NeedsLoopPhi(placeholder);
        }
    }

    fn find_old_value_for_phi_placeholder(&mut self, placeholder: PhiPlaceholder, ty: DataType) -> Result<()> {
        let mut to_materialize = BitSet::new(self.placeholder_count());
        if let Some(unknown) = self.find_loop_phis_to_materialize(placeholder, &mut to_materialize) {
            let index = self.placeholder_index(placeholder);
            self.phi_placeholder_replacements[index] = Value::Unknown;
            let unknown_index = self.placeholder_index(unknown);
            self.phi_placeholder_replacements[unknown_index] = Value::Unknown;
            return Ok(());
        }
        // Fails only when a phi would be needed; the replacements are then unknown.
        self.materialize_loop_phis(&to_materialize, ty)?;
        Ok(())
    }

    /// Applies the decisions: replaces eliminated loads, removes stores that
    /// are not kept and drops singletons that lost their last use.
    pub(super) fn finish(&mut self) -> Result<()> {
        let records = self.loads_and_stores.clone();
        for record in &records {
            let load = record.inst;
            if !self.substitutes.contains_key(&load) {
                continue;
            }
            let substitute = self.find_substitute(load);
            self.graph.replace_all_uses(load, substitute);
            self.graph.remove(load)?;
            self.record(
                EventKind::LoadEliminated,
                load,
                format!("{load} replaced by {substitute}"),
            );
        }

        for record in &records {
            let store = record.inst;
            if !self.store_records.contains_key(&store) || self.kept_stores.contains(&store) {
                continue;
            }
            if self.graph.inst(store).is_removed() {
                continue;
            }
            self.graph.remove(store)?;
            self.record(
                EventKind::StoreEliminated,
                store,
                format!("{store} is never observed"),
            );
        }

        let singletons = std::mem::take(&mut self.singleton_new_instances);
        for allocation in singletons {
            self.remove_constructor_fences(allocation)?;
            if !self.graph.has_uses(allocation) {
                self.graph.remove(allocation)?;
                self.record(
                    EventKind::AllocationRemoved,
                    allocation,
                    format!("{allocation} no longer used"),
                );
            }
        }

        // Allocations whose last accesses went away, such as an array only
        // read at a non-constant index.
        let unused: Vec<InstId> = self
            .collector
            .reference_infos()
            .iter()
            .map(ReferenceInfo::reference)
            .filter(|&reference| {
                !self.graph.inst(reference).is_removed()
                    && self.graph.op(reference).is_allocation()
                    && !self.graph.has_uses(reference)
                    && !self.is_finalizable(reference)
                    && is_removable_allocation(self.graph, reference)
            })
            .collect();
        for allocation in unused {
            self.graph.remove(allocation)?;
            self.record(
                EventKind::AllocationRemoved,
                allocation,
                format!("{allocation} lost its last access"),
            );
        }

        let constants = std::mem::take(&mut self.created_constants);
        for constant in constants {
            if !self.graph.inst(constant).is_removed() && !self.graph.has_uses(constant) {
                self.graph.remove(constant)?;
            }
        }
        Ok(())
    }

    /// Drops `allocation` from the constructor fences publishing it, removing
    /// fences left with nothing to publish.
    pub(super) fn remove_constructor_fences(&mut self, allocation: InstId) -> Result<()> {
        let mut fences: Vec<_> = self
            .graph
            .uses(allocation)
            .iter()
            .copied()
            .filter(|&user| matches!(self.graph.op(user), Op::ConstructorFence { .. }))
            .collect();
        fences.sort_unstable();
        fences.dedup();
        for fence in fences {
            let Op::ConstructorFence { objects } = self.graph.op(fence).clone() else {
                continue;
            };
            let remaining: Vec<_> = objects.into_iter().filter(|&o| o != allocation).collect();
            if remaining.is_empty() {
                self.graph.remove(fence)?;
                self.record(
                    EventKind::ConstructorFenceRemoved,
                    fence,
                    format!("{fence} only published {allocation}"),
                );
            } else {
                self.graph.set_op(fence, Op::ConstructorFence { objects: remaining });
            }
        }
        Ok(())
    }
}
