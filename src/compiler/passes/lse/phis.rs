//! Turning placeholders into real values.
//!
//! Non-loop placeholders are materialized on demand when a load observes
//! them. Loop placeholders are resolved after all blocks are visited: the
//! placeholders a load depends on are collected by a depth-first search over
//! predecessor values and materialized together, smallest dependency closure
//! first, so a closure fed by a single outside value reuses that value instead
//! of a chain of phis. A closure with an unknown input makes the load and the
//! loads depending on it unreplaceable, which is propagated by re-walking the
//! blocks from the offending merge.

use log::trace;
use rustc_hash::FxHashMap;

use crate::{
    analysis::heap::HeapLocationCollector,
    compiler::{
        events::EventKind,
        passes::lse::{
            value::{PhiPlaceholder, Value},
            visitor::{LseVisitor, Phase},
        },
    },
    ir::{BlockId, ClassId, DataType, Graph, InstId},
    utils::BitSet,
    Result,
};

impl LseVisitor<'_> {
    // ── Non-loop phis ───────────────────────────────────────────────────

    /// Materializes `placeholder` and the non-loop placeholders it depends on.
    pub(super) fn materialize_non_loop_phis(
        &mut self,
        placeholder: PhiPlaceholder,
        ty: DataType,
    ) -> Result<()> {
        let idx = placeholder.location();
        let mut work_queue = vec![placeholder];
        while let Some(&current) = work_queue.last() {
            if self.replacement(current).is_valid() {
                work_queue.pop();
                continue;
            }
            let block = current.block();
            if self.cfg.is_loop_header(block) {
                return Err(invariant_error!("non-loop placeholder {} at a loop header", current));
            }
            let predecessors = self.graph.block(block).predecessors().to_vec();
            let mut inputs = Vec::with_capacity(predecessors.len());
            for pred in predecessors.iter() {
                let value =
                    self.replacement_or_value(self.heap_values_for[pred.index()][idx].value);
                match value {
                    Value::NeedsNonLoopPhi(dep) => work_queue.push(dep),
                    Value::Default => inputs.push(self.default_value(ty.kind())),
                    Value::Instruction(inst) => inputs.push(self.find_substitute(inst)),
                    other => {
                        return Err(invariant_error!(
                            "{} has input {} from {}",
                            current,
                            other,
                            pred
                        ))
                    }
                }
            }
            if inputs.len() == predecessors.len() {
                let phi = self.find_or_construct_non_loop_phi(block, inputs, ty.kind());
                let index = self.placeholder_index(current);
                self.phi_placeholder_replacements[index] = Value::Instruction(phi);
                work_queue.pop();
            }
        }
        Ok(())
    }

    fn find_or_construct_non_loop_phi(
        &mut self,
        block: BlockId,
        inputs: Vec<InstId>,
        ty: DataType,
    ) -> InstId {
        let existing = self.graph.block(block).phis().iter().copied().find(|&phi| {
            self.graph.ty(phi) == ty && self.graph.op(phi).inputs() == inputs
        });
        if let Some(phi) = existing {
            return phi;
        }
        let phi = self.graph.add_phi(block, inputs, ty);
        if ty.is_reference() {
            assign_phi_classes(self.graph, &[phi]);
        }
        self.record(EventKind::PhiCreated, phi, format!("merge in {block}"));
        phi
    }

    // ── Loop phis ───────────────────────────────────────────────────────

    /// Replaces the loads whose value is a loop placeholder, or marks them
    /// unreplaceable.
    pub(super) fn process_loads_requiring_loop_phis(&mut self) -> Result<()> {
        // Visiting order keeps the result deterministic.
        let records = self.loads_and_stores.clone();
        for record in records {
            let load = record.inst;
            if !self.loads_requiring_loop_phi.contains_key(&load) {
                continue;
            }
            loop {
                let value = self.loads_requiring_loop_phi[&load].value;
                let Value::NeedsLoopPhi(placeholder) = value else {
                    break;
                };
                if self.replacement(placeholder).is_valid() {
                    break;
                }
                if let Some(unknown) = self.try_to_materialize_loop_phis(placeholder, load)? {
                    self.process_loop_phi_with_unknown_input(unknown)?;
                }
            }

            let value = self.loads_requiring_loop_phi[&load].value;
            if let Value::NeedsLoopPhi(placeholder) = value {
                let Value::Instruction(replacement) = self.replacement(placeholder) else {
                    return Err(invariant_error!(
                        "{} resolved to {}",
                        placeholder,
                        self.replacement(placeholder)
                    ));
                };
                if let Some(record) = self.loads_requiring_loop_phi.get_mut(&load) {
                    record.value = Value::Instruction(replacement);
                }
                let replacement = self.find_substitute(replacement);
                self.add_removed_load(load, replacement)?;
            }
        }
        Ok(())
    }

    /// Returns the placeholder with an unknown input that prevented
    /// materialization, if any.
    fn try_to_materialize_loop_phis(
        &mut self,
        placeholder: PhiPlaceholder,
        load: InstId,
    ) -> Result<Option<PhiPlaceholder>> {
        let ty = self.graph.ty(load);
        let mut to_materialize = BitSet::new(self.placeholder_count());
        if let Some(unknown) = self.find_loop_phis_to_materialize(placeholder, &mut to_materialize) {
            trace!("{}: {} has unknown input at {}", self.graph.signature(), placeholder, unknown);
            return Ok(Some(unknown));
        }
        if !self.materialize_loop_phis(&to_materialize, ty)? {
            return Err(invariant_error!("failed to materialize {} for {}", placeholder, load));
        }
        Ok(None)
    }

    /// Collects the loop placeholders `placeholder` depends on.
    pub(super) fn find_loop_phis_to_materialize(
        &mut self,
        placeholder: PhiPlaceholder,
        to_materialize: &mut BitSet,
    ) -> Option<PhiPlaceholder> {
        to_materialize.clear();
        to_materialize.insert(self.placeholder_index(placeholder));
        let mut work_queue = vec![placeholder];
        while let Some(current) = work_queue.pop() {
            if !to_materialize.contains(self.placeholder_index(current)) {
                // Replaced with the default value.
                continue;
            }
            let block = current.block();
            let idx = current.location();
            if self.cfg.is_loop_header(block) {
                if self.try_replacing_loop_phi_placeholder_with_default(current, to_materialize) {
                    continue;
                }
                // Otherwise an index defined inside the loop names a
                // different element on each iteration.
                if let Some(index) = self.collector.location(idx).index() {
                    if self.is_defined_in_loop(block, index) {
                        return Some(current);
                    }
                }
            }
            for pred in self.graph.block(block).predecessors() {
                let value =
                    self.replacement_or_value(self.heap_values_for[pred.index()][idx].value);
                if value.is_unknown() {
                    return Some(current);
                }
                if let Value::NeedsLoopPhi(dep) = value {
                    if to_materialize.insert(self.placeholder_index(dep)) {
                        work_queue.push(dep);
                    }
                }
            }
        }
        None
    }

    /// Replaces a loop placeholder with the default value when every value
    /// reaching it, including values of locations that may overlap on a back
    /// edge, is the default value.
    fn try_replacing_loop_phi_placeholder_with_default(
        &mut self,
        placeholder: PhiPlaceholder,
        to_materialize: &mut BitSet,
    ) -> bool {
        let kind = self.collector.location(placeholder.location()).ty().kind();
        let mut visited = BitSet::new(self.placeholder_count());
        visited.insert(self.placeholder_index(placeholder));
        let mut work_queue = vec![placeholder];
        while let Some(current) = work_queue.pop() {
            let block = current.block();
            let idx = current.location();
            let predecessors = self.graph.block(block).predecessors();
            for pred in predecessors {
                let value =
                    self.replacement_or_value(self.heap_values_for[pred.index()][idx].value);
                if !self.accepts_default_input(value, kind, &mut visited, &mut work_queue) {
                    return false;
                }
            }
            if !self.cfg.is_loop_header(block) {
                continue;
            }
            let preheader = self.cfg.loop_of(block).and_then(|l| l.preheader);
            for pred in predecessors.iter().filter(|&&p| Some(p) != preheader) {
                for i in 0..self.location_count() {
                    if i == idx || !self.may_alias_on_back_edge(block, idx, i) {
                        continue;
                    }
                    let value =
                        self.replacement_or_value(self.heap_values_for[pred.index()][i].value);
                    if !self.accepts_default_input(value, kind, &mut visited, &mut work_queue) {
                        return false;
                    }
                }
            }
        }

        let replaced: Vec<usize> = visited.iter().collect();
        for index in replaced {
            let location = self.placeholder_at(index).location();
            let constant = self.default_value(self.collector.location(location).ty().kind());
            self.phi_placeholder_replacements[index] = Value::Instruction(constant);
        }
        to_materialize.difference_with(&visited);
        true
    }

    fn accepts_default_input(
        &self,
        value: Value,
        kind: DataType,
        visited: &mut BitSet,
        work_queue: &mut Vec<PhiPlaceholder>,
    ) -> bool {
        match value {
            Value::NeedsNonLoopPhi(dep) | Value::NeedsLoopPhi(dep) => {
                if self.collector.location(dep.location()).ty().kind() != kind {
                    return false;
                }
                if visited.insert(self.placeholder_index(dep)) {
                    work_queue.push(dep);
                }
                true
            }
            _ => value.equals(Value::Default, self.graph),
        }
    }

    /// Materializes a closed set of loop placeholders, smallest dependency
    /// closure first. Returns `false` if a closure needs a new phi during
    /// store elimination; its dependents are then marked unknown.
    pub(super) fn materialize_loop_phis(&mut self, set: &BitSet, ty: DataType) -> Result<bool> {
        let indexes: Vec<usize> = set.iter().collect();
        let count = indexes.len();
        let matrix_index: FxHashMap<usize, usize> =
            indexes.iter().enumerate().map(|(m, &i)| (i, m)).collect();

        let mut dependencies: Vec<BitSet> = Vec::with_capacity(count);
        for (m, &index) in indexes.iter().enumerate() {
            let mut row = BitSet::new(count);
            row.insert(m);
            let placeholder = self.placeholder_at(index);
            let idx = placeholder.location();
            for pred in self.graph.block(placeholder.block()).predecessors() {
                let value =
                    self.replacement_or_value(self.heap_values_for[pred.index()][idx].value);
                if let Value::NeedsLoopPhi(dep) = value {
                    let Some(&d) = matrix_index.get(&self.placeholder_index(dep)) else {
                        return Err(invariant_error!("{} depends on unvisited {}", placeholder, dep));
                    };
                    row.insert(d);
                }
            }
            dependencies.push(row);
        }

        // Transitive closure.
        for k in 0..count {
            let via = dependencies[k].clone();
            for row in &mut dependencies {
                if row.contains(k) {
                    row.union_with(&via);
                }
            }
        }

        let mut num_dependencies: Vec<usize> = dependencies.iter().map(BitSet::count).collect();
        let mut remaining = count;
        while remaining != 0 {
            let Some((current, &current_count)) = num_dependencies
                .iter()
                .enumerate()
                .min_by_key(|&(_, &n)| n)
            else {
                break;
            };
            let closure = dependencies[current].clone();
            let subset: Vec<usize> = closure.iter().map(|m| indexes[m]).collect();
            if !self.materialize_loop_phi_subset(&subset, ty)? {
                for (m, row) in dependencies.iter().enumerate() {
                    if row.contains(current) {
                        self.phi_placeholder_replacements[indexes[m]] = Value::Unknown;
                    }
                }
                return Ok(false);
            }
            for m in 0..count {
                if closure.contains(m) {
                    num_dependencies[m] = count;
                } else if dependencies[m].contains(current) {
                    dependencies[m].difference_with(&closure);
                    num_dependencies[m] -= current_count;
                }
            }
            remaining -= current_count;
        }
        Ok(true)
    }

    fn materialize_loop_phi_subset(&mut self, subset: &[usize], ty: DataType) -> Result<bool> {
        // Settle the outside inputs and check whether they all agree.
        let mut other_value: Option<Value> = None;
        for &index in subset {
            let placeholder = self.placeholder_at(index);
            let idx = placeholder.location();
            let predecessors = self.graph.block(placeholder.block()).predecessors().to_vec();
            for pred in predecessors {
                let mut value =
                    self.replacement_or_value(self.heap_values_for[pred.index()][idx].value);
                if let Value::NeedsNonLoopPhi(dep) = value {
                    if self.phase == Phase::StoreElimination {
                        return Err(invariant_error!("non-loop placeholder {} in store elimination", dep));
                    }
                    self.materialize_non_loop_phis(dep, ty)?;
                    value = self.replacement(dep);
                }
                if value.needs_loop_phi() {
                    continue;
                }
                other_value = match other_value {
                    None => Some(value),
                    Some(other) if other.is_valid() && !value.equals(other, self.graph) => {
                        Some(Value::Invalid)
                    }
                    kept => kept,
                };
            }
        }

        let other_value =
            other_value.ok_or_else(|| invariant_error!("loop placeholders without outside input"))?;
        if other_value.is_valid() {
            let replacement = match other_value {
                Value::Default => self.default_value(ty.kind()),
                Value::Instruction(inst) => self.find_substitute(inst),
                other => return Err(invariant_error!("loop placeholders fed by {}", other)),
            };
            for &index in subset {
                self.phi_placeholder_replacements[index] = Value::Instruction(replacement);
            }
            return Ok(true);
        }

        if let Some(phis) = self.find_matching_loop_phis(subset, ty) {
            for (&index, phi) in subset.iter().zip(phis) {
                self.phi_placeholder_replacements[index] = Value::Instruction(phi);
            }
            return Ok(true);
        }

        if self.phase == Phase::StoreElimination {
            return Ok(false);
        }

        let phi_ty = ty.kind();
        let mut phis = Vec::with_capacity(subset.len());
        for &index in subset {
            let block = self.placeholder_at(index).block();
            let phi = self.graph.add_phi(block, Vec::new(), phi_ty);
            self.phi_placeholder_replacements[index] = Value::Instruction(phi);
            phis.push(phi);
        }
        for (&index, &phi) in subset.iter().zip(&phis) {
            let placeholder = self.placeholder_at(index);
            let idx = placeholder.location();
            let predecessors = self.graph.block(placeholder.block()).predecessors().to_vec();
            let mut inputs = Vec::with_capacity(predecessors.len());
            for pred in predecessors {
                let value =
                    self.replacement_or_value(self.heap_values_for[pred.index()][idx].value);
                let input = match value {
                    Value::Default => self.default_value(phi_ty),
                    Value::Instruction(inst) => self.find_substitute(inst),
                    other => return Err(invariant_error!("{} has input {}", placeholder, other)),
                };
                inputs.push(input);
            }
            self.graph.set_phi_inputs(phi, inputs)?;
            self.record(
                EventKind::PhiCreated,
                phi,
                format!("loop value of location {idx} in {}", placeholder.block()),
            );
        }
        if phi_ty.is_reference() {
            assign_phi_classes(self.graph, &phis);
        }
        Ok(true)
    }

    /// Existing phis that already compute the placeholders of `subset`, one
    /// per placeholder in order.
    ///
    /// A phi matches a placeholder if each input equals the value on its edge,
    /// or is the phi matched to the placeholder that edge carries. Candidates
    /// are pruned until every survivor is consistent with the others, then
    /// fixed one placeholder at a time.
    fn find_matching_loop_phis(&self, subset: &[usize], ty: DataType) -> Option<Vec<InstId>> {
        let position: FxHashMap<usize, usize> =
            subset.iter().enumerate().map(|(p, &index)| (index, p)).collect();
        let mut candidates: Vec<Vec<InstId>> = Vec::with_capacity(subset.len());
        for &index in subset {
            let block = self.graph.block(self.placeholder_at(index).block());
            let phis: Vec<InstId> = block
                .phis()
                .iter()
                .copied()
                .filter(|&phi| {
                    self.graph.ty(phi).kind() == ty.kind()
                        && self.graph.op(phi).inputs().len() == block.predecessors().len()
                })
                .collect();
            if phis.is_empty() {
                return None;
            }
            candidates.push(phis);
        }

        if !self.prune_loop_phi_candidates(subset, &position, &mut candidates) {
            return None;
        }
        for p in 0..subset.len() {
            let options = candidates[p].clone();
            let mut fixed = None;
            for phi in options {
                let mut trial = candidates.clone();
                trial[p] = vec![phi];
                if self.prune_loop_phi_candidates(subset, &position, &mut trial) {
                    fixed = Some(trial);
                    break;
                }
            }
            candidates = fixed?;
        }
        Some(candidates.into_iter().filter_map(|phis| phis.first().copied()).collect())
    }

    /// Drops candidates with an input no candidate of the other side can
    /// produce. Returns `false` once a placeholder runs out of candidates.
    fn prune_loop_phi_candidates(
        &self,
        subset: &[usize],
        position: &FxHashMap<usize, usize>,
        candidates: &mut [Vec<InstId>],
    ) -> bool {
        let mut changed = true;
        while changed {
            changed = false;
            for (p, &index) in subset.iter().enumerate() {
                let placeholder = self.placeholder_at(index);
                let idx = placeholder.location();
                let predecessors = self.graph.block(placeholder.block()).predecessors();
                let before = candidates[p].len();
                let surviving: Vec<InstId> = candidates[p]
                    .iter()
                    .copied()
                    .filter(|&phi| {
                        let inputs = self.graph.op(phi).inputs();
                        inputs.iter().zip(predecessors).all(|(&input, pred)| {
                            let value = self
                                .replacement_or_value(self.heap_values_for[pred.index()][idx].value);
                            match value {
                                Value::NeedsLoopPhi(dep) | Value::NeedsNonLoopPhi(dep) => position
                                    .get(&self.placeholder_index(dep))
                                    .is_some_and(|&d| candidates[d].contains(&input)),
                                Value::Instruction(inst) => self.find_substitute(inst) == input,
                                Value::Default => value.equals_instruction(input, self.graph),
                                _ => false,
                            }
                        })
                    })
                    .collect();
                if surviving.is_empty() {
                    return false;
                }
                if surviving.len() != before {
                    candidates[p] = surviving;
                    changed = true;
                }
            }
        }
        true
    }

    /// Marks `placeholder` unknown and re-walks the blocks from its merge,
    /// settling every load that depended on it.
    fn process_loop_phi_with_unknown_input(&mut self, placeholder: PhiPlaceholder) -> Result<()> {
        let index = self.placeholder_index(placeholder);
        self.phi_placeholder_replacements[index] = Value::MergedUnknown(placeholder);

        let cfg = self.cfg;
        let start = cfg
            .rpo_index(placeholder.block())
            .ok_or_else(|| invariant_error!("{} is unreachable", placeholder.block()))?;
        let mut cursor = self
            .loads_and_stores
            .iter()
            .position(|r| cfg.rpo_index(r.block).is_some_and(|i| i >= start))
            .unwrap_or(self.loads_and_stores.len());

        let mut local = vec![Value::Invalid; self.location_count()];
        for &block in &cfg.reverse_post_order()[start..] {
            local.fill(Value::Invalid);
            while let Some(&record) = self.loads_and_stores.get(cursor) {
                if record.block != block {
                    break;
                }
                cursor += 1;
                let idx = record.location;
                if let Some(store) = self.store_records.get(&record.inst).copied() {
                    let Some(load) = self.loads_requiring_loop_phi.get(&store.stored_value).copied()
                    else {
                        continue;
                    };
                    let replacement = self.replacement_or_value(load.value);
                    local[idx] = match replacement {
                        Value::NeedsLoopPhi(_) => load.value,
                        Value::Instruction(inst) => Value::Instruction(inst),
                        _ if replacement.is_unknown() => Value::Instruction(store.stored_value),
                        other => return Err(invariant_error!("stored load resolved to {}", other)),
                    };
                    continue;
                }

                let Some(mut load) = self.loads_requiring_loop_phi.get(&record.inst).copied() else {
                    continue;
                };
                let Value::NeedsLoopPhi(load_placeholder) = load.value else {
                    continue;
                };
                if local[idx].is_invalid() {
                    local[idx] = self.initial_value(block, idx)?;
                }
                if local[idx].is_unknown() {
                    // Stores feeding the placeholder become observable.
                    self.keep_stores(load.value);
                    load.value = Value::MergedUnknown(load_placeholder);
                    local[idx] = Value::Instruction(record.inst);
                } else if !local[idx].needs_loop_phi() {
                    if let Value::NeedsNonLoopPhi(dep) = local[idx] {
                        self.materialize_non_loop_phis(dep, self.graph.ty(record.inst))?;
                        local[idx] = self.replacement(dep);
                    }
                    load.value = local[idx];
                    let heap_value = match local[idx] {
                        Value::Default => self.default_value(self.graph.ty(record.inst)),
                        Value::Instruction(inst) => self.find_substitute(inst),
                        other => return Err(invariant_error!("load resolved to {}", other)),
                    };
                    self.add_removed_load(record.inst, heap_value)?;
                }
                self.loads_requiring_loop_phi.insert(record.inst, load);
            }

            for (idx, &value) in local.iter().enumerate() {
                if !self.heap_values_for[block.index()][idx].value.needs_loop_phi() {
                    continue;
                }
                let value = if value.is_valid() {
                    value
                } else {
                    self.initial_value(block, idx)?
                };
                self.heap_values_for[block.index()][idx].value = value;
            }
        }
        Ok(())
    }

    fn initial_value(&self, block: BlockId, idx: usize) -> Result<Value> {
        if self.cfg.is_loop_header(block) {
            let preheader = self
                .cfg
                .loop_of(block)
                .and_then(|l| l.preheader)
                .ok_or_else(|| invariant_error!("loop at {} has no preheader", block))?;
            Ok(self.prepare_loop_value(block, preheader, idx))
        } else {
            let predecessors = self.graph.block(block).predecessors();
            Ok(self.merge_predecessor_values(block, predecessors, idx))
        }
    }

    // ── Aliasing across iterations ──────────────────────────────────────

    /// Like [`HeapLocationCollector::may_alias`], but array locations whose
    /// index is defined inside the loop overlap every other element of an
    /// array they may share: `a[i]` and `a[i + 1]` meet on the next iteration.
    pub(super) fn may_alias_on_back_edge(&self, header: BlockId, idx1: usize, idx2: usize) -> bool {
        if self.collector.may_alias(idx1, idx2) {
            return true;
        }
        let first = self.collector.location(idx1);
        let second = self.collector.location(idx2);
        if !first.is_array() || !second.is_array() {
            return false;
        }
        let infos = self.collector.reference_infos();
        if !HeapLocationCollector::can_references_alias(
            self.graph,
            &infos[first.ref_info()],
            &infos[second.ref_info()],
        ) {
            return false;
        }
        [first.index(), second.index()]
            .into_iter()
            .flatten()
            .any(|index| self.is_defined_in_loop(header, index))
    }

    fn is_defined_in_loop(&self, header: BlockId, inst: InstId) -> bool {
        let Some(block) = self.graph.inst(inst).block() else {
            return false;
        };
        self.cfg
            .loops()
            .loop_for_header(header)
            .is_some_and(|loop_info| loop_info.contains(block))
    }
}

/// Sets the class of new reference phis to the closest common superclass of
/// their inputs, iterating until the classes of phis feeding each other
/// settle. Null inputs do not constrain the class.
pub(super) fn assign_phi_classes(graph: &mut Graph, phis: &[InstId]) {
    // `None` means no input seen yet, `Some(None)` means any class.
    let mut classes: FxHashMap<InstId, Option<Option<ClassId>>> =
        phis.iter().map(|&phi| (phi, None)).collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &phi in phis {
            let mut joined: Option<Option<ClassId>> = None;
            for input in graph.op(phi).inputs() {
                if graph.is_zero_bit_pattern(input) {
                    continue;
                }
                let class = match classes.get(&input) {
                    Some(&None) => continue,
                    Some(&Some(class)) => class,
                    None => graph.inst(input).class(),
                };
                joined = Some(match joined {
                    None => class,
                    Some(current) => join_classes(graph, current, class),
                });
            }
            if classes.get(&phi) != Some(&joined) {
                classes.insert(phi, joined);
                changed = true;
            }
        }
    }
    for &phi in phis {
        let class = classes.get(&phi).copied().flatten().flatten();
        graph.set_class(phi, class);
    }
}

fn join_classes(graph: &Graph, a: Option<ClassId>, b: Option<ClassId>) -> Option<ClassId> {
    match (a, b) {
        (Some(a), Some(b)) => graph.common_superclass(a, b),
        _ => None,
    }
}
