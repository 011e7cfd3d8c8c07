//! Materialization of partially escaping allocations.
//!
//! An allocation that escapes only inside some excluded cohorts is removed.
//! Its fields live in SSA "shadow" values while the object has not escaped,
//! and a real object is allocated at the entry of each cohort, initialised
//! from the shadows. A target reference tracks which object is live on every
//! path: null before the escape, the materialised object after it. Accesses
//! that can only run before the escape read and write the shadows directly;
//! accesses that may run after it become predicated on the target.

use log::{debug, trace};

use crate::{
    analysis::{
        escape::EscapeKind,
        heap::HeapLocationCollector,
        subgraph::{ExcludedCohort, ExecutionSubgraph},
    },
    compiler::{
        events::EventKind,
        passes::lse::{phis::assign_phi_classes, Transformation},
    },
    ir::{BlockId, ClassId, ControlFlowInfo, DataType, FieldId, Graph, InstId, Op},
    Result,
};

/// Materializes every eligible partially escaping allocation of `graph`.
///
/// The block structure is left unchanged, so `cfg` stays valid.
///
/// # Errors
///
/// Returns an error if the graph is modified inconsistently.
pub(super) fn materialize_partial_escapes(
    graph: &mut Graph,
    cfg: &ControlFlowInfo,
    collector: &HeapLocationCollector,
) -> Result<Vec<Transformation>> {
    let candidates: Vec<(InstId, ExecutionSubgraph)> = collector
        .reference_infos()
        .iter()
        .filter(|info| info.escape_kind() == EscapeKind::PartialEscape)
        .filter_map(|info| info.subgraph().map(|s| (info.reference(), s.clone())))
        .collect();

    let mut transformations = Vec::new();
    for (allocation, subgraph) in candidates {
        let Some(plan) = Plan::new(graph, cfg, allocation, &subgraph) else {
            trace!("{}: {} is not materializable", graph.signature(), allocation);
            continue;
        };
        debug!(
            "{}: materializing {} at {} cohort entries",
            graph.signature(),
            allocation,
            plan.cohorts.len()
        );
        let mut materializer = Materializer::new(graph, cfg, plan);
        materializer.run()?;
        transformations.append(&mut materializer.transformations);
    }
    Ok(transformations)
}

/// What an eligible allocation looks like.
struct Plan {
    allocation: InstId,
    class: ClassId,
    block: BlockId,
    /// Cohorts with their single entry block.
    cohorts: Vec<(ExcludedCohort, BlockId)>,
    /// Fields accessed through the allocation outside the cohorts.
    fields: Vec<FieldId>,
}

impl Plan {
    fn new(
        graph: &Graph,
        cfg: &ControlFlowInfo,
        allocation: InstId,
        subgraph: &ExecutionSubgraph,
    ) -> Option<Self> {
        let Op::NewInstance {
            class,
            needs_checks: false,
        } = *graph.op(allocation)
        else {
            return None;
        };
        if graph.class(class).is_finalizable {
            return None;
        }
        let block = graph.inst(allocation).block()?;
        if cfg.loop_of(block).is_some() || subgraph.excluded_cohorts().is_empty() {
            return None;
        }

        let mut cohorts = Vec::new();
        for cohort in subgraph.excluded_cohorts() {
            let mut entries = cohort.entry_blocks().iter();
            let entry = BlockId::new(entries.next()?);
            if entries.next().is_some()
                || cohort.contains_block(block)
                || !cfg.dominates(block, entry)
                || cfg.loop_of(entry).is_some()
            {
                return None;
            }
            let &[pred] = graph.block(entry).predecessors() else {
                return None;
            };
            if !subgraph.contains_block(pred) {
                return None;
            }
            cohorts.push((cohort.clone(), entry));
        }
        for (i, (cohort, _)) in cohorts.iter().enumerate() {
            for (j, (_, entry)) in cohorts.iter().enumerate() {
                if i != j && cohort.precedes_block(cfg, *entry) {
                    return None;
                }
            }
        }

        let mut fields = Vec::new();
        for &user in graph.uses(allocation) {
            let user_block = graph.inst(user).block()?;
            if cohorts.iter().any(|(c, _)| c.contains_block(user_block)) {
                if graph.op(user).is_phi() && cohorts.iter().any(|&(_, e)| e == user_block) {
                    return None;
                }
                continue;
            }
            let field = match *graph.op(user) {
                Op::InstanceFieldGet { object, field } if object == allocation => field,
                Op::InstanceFieldSet {
                    object,
                    field,
                    value,
                    predicated: false,
                } if object == allocation && value != allocation => field,
                Op::ConstructorFence { .. } => continue,
                _ => return None,
            };
            if !fields.contains(&field) {
                fields.push(field);
            }
        }

        Some(Self {
            allocation,
            class,
            block,
            cohorts,
            fields,
        })
    }
}

/// Per-block state: the target reference followed by one shadow per field.
type State = Vec<InstId>;

struct Materializer<'a> {
    graph: &'a mut Graph,
    cfg: &'a ControlFlowInfo,
    plan: Plan,
    null: InstId,
    states: Vec<Option<State>>,
    /// Eager loop header phis, filled once every back edge is known.
    loop_phis: Vec<(BlockId, State)>,
    created_phis: Vec<InstId>,
    transformations: Vec<Transformation>,
}

impl<'a> Materializer<'a> {
    fn new(graph: &'a mut Graph, cfg: &'a ControlFlowInfo, plan: Plan) -> Self {
        let null = graph.null_constant();
        let block_count = graph.block_count();
        Self {
            graph,
            cfg,
            plan,
            null,
            states: vec![None; block_count],
            loop_phis: Vec::new(),
            created_phis: Vec::new(),
            transformations: Vec::new(),
        }
    }

    fn record(&mut self, kind: EventKind, inst: InstId, message: String) {
        self.transformations.push(Transformation {
            kind,
            inst,
            message,
        });
    }

    fn slot_type(&self, slot: usize) -> DataType {
        if slot == 0 {
            DataType::Reference
        } else {
            self.graph.field(self.plan.fields[slot - 1]).ty.kind()
        }
    }

    fn run(&mut self) -> Result<()> {
        let cfg = self.cfg;
        for &block in cfg.reverse_post_order() {
            if !cfg.dominates(self.plan.block, block) {
                continue;
            }
            if let Some(cohort) = self.cohort_of(block) {
                self.visit_cohort_block(block, cohort)?;
                continue;
            }
            let state = self.entry_state(block)?;
            let state = self.rewrite_block(block, state)?;
            self.states[block.index()] = Some(state);
        }

        self.fill_loop_phis()?;
        self.fold_trivial_phis()?;
        self.graph.remove(self.plan.allocation)?;
        self.record(
            EventKind::AllocationRemoved,
            self.plan.allocation,
            format!("{} replaced by materializations", self.plan.allocation),
        );
        Ok(())
    }

    fn cohort_of(&self, block: BlockId) -> Option<usize> {
        self.plan
            .cohorts
            .iter()
            .position(|(cohort, _)| cohort.contains_block(block))
    }

    fn pred_state(&self, pred: BlockId) -> Result<&State> {
        self.states[pred.index()]
            .as_ref()
            .ok_or_else(|| invariant_error!("no materialization state at {}", pred))
    }

    fn entry_state(&mut self, block: BlockId) -> Result<State> {
        if block == self.plan.block {
            let mut state = vec![self.null];
            for i in 0..self.plan.fields.len() {
                let ty = self.graph.field(self.plan.fields[i]).ty;
                state.push(self.graph.constant(ty.default_value()));
            }
            return Ok(state);
        }

        let predecessors = self.graph.block(block).predecessors().to_vec();
        if let [pred] = predecessors[..] {
            return self.pred_state(pred).cloned();
        }

        let slots = self.plan.fields.len() + 1;
        if self.cfg.is_loop_header(block) {
            let mut phis = Vec::with_capacity(slots);
            for slot in 0..slots {
                let phi = self.graph.add_phi(block, Vec::new(), self.slot_type(slot));
                self.created_phis.push(phi);
                phis.push(phi);
            }
            self.loop_phis.push((block, phis.clone()));
            return Ok(phis);
        }

        let incoming: Vec<State> = predecessors
            .iter()
            .map(|&pred| self.pred_state(pred).cloned())
            .collect::<Result<_>>()?;
        let mut state = Vec::with_capacity(slots);
        for slot in 0..slots {
            let first = incoming[0][slot];
            if incoming.iter().all(|s| s[slot] == first) {
                state.push(first);
                continue;
            }
            let inputs = incoming.iter().map(|s| s[slot]).collect();
            let phi = self.graph.add_phi(block, inputs, self.slot_type(slot));
            if slot == 0 || self.slot_type(slot).is_reference() {
                assign_phi_classes(self.graph, &[phi]);
            }
            self.created_phis.push(phi);
            state.push(phi);
        }
        Ok(state)
    }

    fn visit_cohort_block(&mut self, block: BlockId, cohort: usize) -> Result<()> {
        let entry = self.plan.cohorts[cohort].1;
        if block != entry {
            let state = self.states[entry.index()].clone();
            self.states[block.index()] = state;
            return Ok(());
        }

        let &[pred] = self.graph.block(entry).predecessors() else {
            return Err(invariant_error!("cohort entry {} has several predecessors", entry));
        };
        let mut state = self.pred_state(pred)?.clone();

        let materialized = self.graph.insert_at(
            entry,
            0,
            Op::NewInstance {
                class: self.plan.class,
                needs_checks: false,
            },
            DataType::Reference,
        );
        self.graph.set_class(materialized, Some(self.plan.class));
        let mut position = 1;
        for (i, &field) in self.plan.fields.iter().enumerate() {
            let shadow = state[i + 1];
            if self.graph.is_zero_bit_pattern(shadow) {
                continue;
            }
            self.graph.insert_at(
                entry,
                position,
                Op::InstanceFieldSet {
                    object: materialized,
                    field,
                    value: shadow,
                    predicated: false,
                },
                DataType::Void,
            );
            position += 1;
        }

        let cohort_blocks = &self.plan.cohorts[cohort].0;
        let users: Vec<InstId> = self
            .graph
            .uses(self.plan.allocation)
            .iter()
            .copied()
            .filter(|&user| {
                self.graph
                    .inst(user)
                    .block()
                    .is_some_and(|b| cohort_blocks.contains_block(b))
            })
            .collect();
        for user in users {
            self.graph.replace_input(user, self.plan.allocation, materialized);
        }
        self.record(
            EventKind::AllocationMaterialized,
            materialized,
            format!("{} materialized in {}", self.plan.allocation, entry),
        );

        state[0] = materialized;
        self.states[entry.index()] = Some(state);
        Ok(())
    }

    fn rewrite_block(&mut self, block: BlockId, mut state: State) -> Result<State> {
        let allocation = self.plan.allocation;
        let instructions = self.graph.block(block).instructions().to_vec();
        let start = if block == self.plan.block {
            instructions
                .iter()
                .position(|&i| i == allocation)
                .map_or(instructions.len(), |p| p + 1)
        } else {
            0
        };

        for &inst in &instructions[start..] {
            if self.graph.inst(inst).is_removed() {
                continue;
            }
            match self.graph.op(inst).clone() {
                Op::InstanceFieldGet { object, field } if object == allocation => {
                    let slot = self.slot_of(field)?;
                    let ty = self.graph.ty(inst);
                    let shadow = self.converted(state[slot], ty, inst)?;
                    if state[0] == self.null {
                        self.graph.replace_all_uses(inst, shadow);
                        self.graph.remove(inst)?;
                        self.record(
                            EventKind::LoadEliminated,
                            inst,
                            format!("{inst} reads shadow {shadow}"),
                        );
                    } else {
                        self.graph.set_op(
                            inst,
                            Op::PredicatedInstanceFieldGet {
                                target: state[0],
                                default: shadow,
                                field,
                            },
                        );
                        self.record(
                            EventKind::PredicatedAccessCreated,
                            inst,
                            format!("{inst} reads through {}", state[0]),
                        );
                    }
                }
                Op::InstanceFieldSet {
                    object,
                    field,
                    value,
                    predicated: false,
                } if object == allocation => {
                    let slot = self.slot_of(field)?;
                    state[slot] = value;
                    if state[0] == self.null {
                        self.graph.remove(inst)?;
                        self.record(
                            EventKind::StoreEliminated,
                            inst,
                            format!("{inst} writes shadow {value}"),
                        );
                    } else {
                        self.graph.set_op(
                            inst,
                            Op::InstanceFieldSet {
                                object: state[0],
                                field,
                                value,
                                predicated: true,
                            },
                        );
                        self.record(
                            EventKind::PredicatedAccessCreated,
                            inst,
                            format!("{inst} writes through {}", state[0]),
                        );
                    }
                }
                Op::ConstructorFence { objects } if objects.contains(&allocation) => {
                    let remaining: Vec<_> =
                        objects.into_iter().filter(|&o| o != allocation).collect();
                    if remaining.is_empty() {
                        self.graph.remove(inst)?;
                        self.record(
                            EventKind::ConstructorFenceRemoved,
                            inst,
                            format!("{inst} only published {allocation}"),
                        );
                    } else {
                        self.graph.set_op(inst, Op::ConstructorFence { objects: remaining });
                    }
                }
                _ => {}
            }
        }
        Ok(state)
    }

    fn slot_of(&self, field: FieldId) -> Result<usize> {
        self.plan
            .fields
            .iter()
            .position(|&f| f == field)
            .map(|i| i + 1)
            .ok_or_else(|| invariant_error!("field {} of {} is not tracked", field, self.plan.allocation))
    }

    /// `value` as seen through a load of type `ty`.
    fn converted(&mut self, value: InstId, ty: DataType, before: InstId) -> Result<InstId> {
        if DataType::is_type_conversion_implicit(self.graph.ty(value), ty)
            || self.graph.is_zero_bit_pattern(value)
        {
            return Ok(value);
        }
        let conversion = self
            .graph
            .insert_before(before, Op::TypeConversion { input: value }, ty)?;
        self.record(
            EventKind::TypeConversionInserted,
            conversion,
            format!("{value} as {ty}"),
        );
        Ok(conversion)
    }

    fn fill_loop_phis(&mut self) -> Result<()> {
        let loop_phis = std::mem::take(&mut self.loop_phis);
        let mut references = Vec::new();
        for (header, phis) in loop_phis {
            let predecessors = self.graph.block(header).predecessors().to_vec();
            for (slot, &phi) in phis.iter().enumerate() {
                let inputs = predecessors
                    .iter()
                    .map(|&pred| self.pred_state(pred).map(|s| s[slot]))
                    .collect::<Result<Vec<_>>>()?;
                self.graph.set_phi_inputs(phi, inputs)?;
                if self.slot_type(slot).is_reference() {
                    references.push(phi);
                }
            }
        }
        assign_phi_classes(self.graph, &references);
        Ok(())
    }

    /// Removes created phis that merge a single value or are unused.
    fn fold_trivial_phis(&mut self) -> Result<()> {
        let mut changed = true;
        while changed {
            changed = false;
            for &phi in &self.created_phis {
                if self.graph.inst(phi).is_removed() {
                    continue;
                }
                if !self.graph.has_uses(phi) {
                    self.graph.remove(phi)?;
                    changed = true;
                    continue;
                }
                let inputs = self.graph.op(phi).inputs();
                let mut distinct = inputs.iter().copied().filter(|&i| i != phi);
                let Some(first) = distinct.next() else {
                    continue;
                };
                if distinct.all(|i| i == first) {
                    self.graph.replace_all_uses(phi, first);
                    self.graph.set_phi_inputs(phi, Vec::new())?;
                    self.graph.remove(phi)?;
                    changed = true;
                }
            }
        }
        let created = std::mem::take(&mut self.created_phis);
        for phi in created {
            if !self.graph.inst(phi).is_removed() {
                self.record(EventKind::PhiCreated, phi, format!("{phi} merges {}", self.plan.allocation));
            }
        }
        Ok(())
    }
}
