//! Heap location collection and alias analysis.
//!
//! [`HeapLocationCollector`] walks a method once in reverse post-order and
//! builds the universe of heap locations its loads and stores touch:
//!
//! - instance fields, keyed by (reference, field)
//! - static fields, keyed by (class reference, field)
//! - array elements, keyed by (array reference, index instruction)
//!
//! References are resolved through `NullCheck` and `BoundType` first, so
//! `obj.f` and `nullcheck(obj).f` name the same location. Every reference
//! gets a [`ReferenceInfo`] with its escape facts; reference infos and
//! locations are numbered in order of first appearance.
//!
//! # Aliasing
//!
//! The may-alias relation is computed once into a triangular bit matrix.
//! Two locations may alias only if they select the same field, or are both
//! array elements, and their references may alias. References never alias
//! when either is a singleton, when both are distinct allocations, when one is
//! an allocation and the other a parameter, or when their static classes are
//! unrelated. Array indices are compared after splitting them into a base and
//! a constant offset: `a[i + 1]` and `a[i]` do not alias at the same program
//! point. The relation says nothing about different loop iterations; the
//! elimination pass handles back edges itself.
//!
//! # Bail-outs
//!
//! Collection stops with a [`SkipReason`] when there is nothing worth
//! optimising or the method is out of reach for the analysis.

mod location;
mod reference;

use std::fmt;

use log::debug;
use rustc_hash::FxHashMap;

use crate::{
    ir::{ControlFlowInfo, DataType, Graph, InstId, Op},
    utils::BitSet,
};

pub use location::{HeapLocation, LocationKind, NormalizedIndex};
pub use reference::{is_removable_allocation, ReferenceInfo};

/// Default cap on the number of locations tracked per method.
pub const DEFAULT_MAX_HEAP_LOCATIONS: usize = 32;

/// Why a method was not analysed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The method has no resolved heap stores.
    NoHeapStores,
    /// The method touches more locations than the configured cap.
    TooManyLocations(usize),
    /// The method accesses a volatile field.
    VolatileAccess(InstId),
    /// The method enters or exits a monitor.
    MonitorOperation(InstId),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHeapStores => f.write_str("no heap stores"),
            Self::TooManyLocations(count) => write!(f, "too many heap locations ({count})"),
            Self::VolatileAccess(inst) => write!(f, "volatile access at {inst}"),
            Self::MonitorOperation(inst) => write!(f, "monitor operation at {inst}"),
        }
    }
}

/// Options of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorOptions {
    /// Maximum number of locations before bailing out.
    pub max_heap_locations: usize,
    /// Compute execution subgraphs for partially escaping allocations.
    pub partial_escape: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            max_heap_locations: DEFAULT_MAX_HEAP_LOCATIONS,
            partial_escape: true,
        }
    }
}

/// The heap locations of a method and their may-alias relation.
#[derive(Debug, Clone)]
pub struct HeapLocationCollector {
    ref_infos: Vec<ReferenceInfo>,
    ref_index: FxHashMap<InstId, usize>,
    locations: Vec<HeapLocation>,
    location_index: FxHashMap<(usize, LocationKind), usize>,
    access_location: FxHashMap<InstId, usize>,
    normalized: Vec<Option<NormalizedIndex>>,
    aliasing: BitSet,
}

impl HeapLocationCollector {
    /// Collects the heap locations of `graph`.
    ///
    /// # Errors
    ///
    /// Returns the [`SkipReason`] when the method should not be optimised.
    pub fn collect(
        graph: &Graph,
        cfg: &ControlFlowInfo,
        options: CollectorOptions,
    ) -> Result<Self, SkipReason> {
        let mut collector = Self {
            ref_infos: Vec::new(),
            ref_index: FxHashMap::default(),
            locations: Vec::new(),
            location_index: FxHashMap::default(),
            access_location: FxHashMap::default(),
            normalized: Vec::new(),
            aliasing: BitSet::new(0),
        };
        let mut has_heap_stores = false;

        for &block in cfg.reverse_post_order() {
            for inst in graph.block(block).all_instructions() {
                if graph.ty(inst) == DataType::Reference {
                    collector.reference_info_for(graph, cfg, inst, options);
                }
                match graph.op(inst) {
                    Op::MonitorOperation { .. } => return Err(SkipReason::MonitorOperation(inst)),
                    Op::InstanceFieldSet { .. }
                    | Op::StaticFieldSet { .. }
                    | Op::ArraySet { .. } => has_heap_stores = true,
                    _ => {}
                }
                let volatile = match collector.visit_access(graph, cfg, inst, options) {
                    Some(location) => collector.locations[location].is_volatile,
                    None => graph
                        .op(inst)
                        .accessed_field()
                        .is_some_and(|field| graph.field(field).is_volatile),
                };
                if volatile {
                    return Err(SkipReason::VolatileAccess(inst));
                }
            }
        }

        if !has_heap_stores {
            return Err(SkipReason::NoHeapStores);
        }
        if collector.locations.len() > options.max_heap_locations {
            return Err(SkipReason::TooManyLocations(collector.locations.len()));
        }
        collector.compute_aliasing(graph);
        debug!(
            "{}: {} references, {} heap locations",
            graph.signature(),
            collector.ref_infos.len(),
            collector.locations.len()
        );
        Ok(collector)
    }

    /// Resolves `reference` through instructions that only rename it.
    #[must_use]
    pub fn hunt_for_original_reference(graph: &Graph, mut reference: InstId) -> InstId {
        loop {
            match *graph.op(reference) {
                Op::NullCheck { input } | Op::BoundType { input } => reference = input,
                _ => return reference,
            }
        }
    }

    /// Number of heap locations.
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Returns a heap location.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn location(&self, index: usize) -> &HeapLocation {
        &self.locations[index]
    }

    /// All heap locations in discovery order.
    #[must_use]
    pub fn locations(&self) -> &[HeapLocation] {
        &self.locations
    }

    /// All reference infos in discovery order.
    #[must_use]
    pub fn reference_infos(&self) -> &[ReferenceInfo] {
        &self.ref_infos
    }

    /// The reference info of a location.
    #[must_use]
    pub fn reference_info_of(&self, location: usize) -> &ReferenceInfo {
        &self.ref_infos[self.locations[location].ref_info]
    }

    /// The reference info of `reference`, after resolving renames.
    #[must_use]
    pub fn find_reference_info(&self, graph: &Graph, reference: InstId) -> Option<&ReferenceInfo> {
        let original = Self::hunt_for_original_reference(graph, reference);
        self.ref_index
            .get(&original)
            .map(|&index| &self.ref_infos[index])
    }

    /// The location accessed by a field or array load or store.
    #[must_use]
    pub fn location_of(&self, access: InstId) -> Option<usize> {
        self.access_location.get(&access).copied()
    }

    /// The location `kind` of `reference`, if some access touches it.
    #[must_use]
    pub fn find_location(
        &self,
        graph: &Graph,
        reference: InstId,
        kind: LocationKind,
    ) -> Option<usize> {
        let original = Self::hunt_for_original_reference(graph, reference);
        let ref_info = *self.ref_index.get(&original)?;
        self.location_index.get(&(ref_info, kind)).copied()
    }

    /// Returns `true` if locations `a` and `b` may name the same slot.
    #[must_use]
    pub fn may_alias(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }
        self.aliasing.contains(alias_bit(a, b))
    }

    /// Returns `true` if references with the given infos may denote the same
    /// object.
    #[must_use]
    pub fn can_references_alias(graph: &Graph, a: &ReferenceInfo, b: &ReferenceInfo) -> bool {
        if a.reference() == b.reference() {
            return true;
        }
        if a.is_singleton() || b.is_singleton() {
            return false;
        }
        if !may_alias_fresh(graph, a.reference(), b.reference())
            || !may_alias_fresh(graph, b.reference(), a.reference())
        {
            return false;
        }
        graph.classes_may_alias(
            graph.inst(a.reference()).class(),
            graph.inst(b.reference()).class(),
        )
    }

    fn reference_info_for(
        &mut self,
        graph: &Graph,
        cfg: &ControlFlowInfo,
        reference: InstId,
        options: CollectorOptions,
    ) -> usize {
        if let Some(&index) = self.ref_index.get(&reference) {
            return index;
        }
        let index = self.ref_infos.len();
        self.ref_infos.push(ReferenceInfo::new(
            graph,
            cfg,
            reference,
            index,
            options.partial_escape,
        ));
        self.ref_index.insert(reference, index);
        index
    }

    /// Records the location `inst` accesses, if it is a plain load or store.
    fn visit_access(
        &mut self,
        graph: &Graph,
        cfg: &ControlFlowInfo,
        inst: InstId,
        options: CollectorOptions,
    ) -> Option<usize> {
        let (reference, kind, ty) = match *graph.op(inst) {
            Op::InstanceFieldGet { object, field }
            | Op::InstanceFieldSet {
                object,
                field,
                predicated: false,
                ..
            } => (object, LocationKind::Field(field), graph.field(field).ty),
            Op::StaticFieldGet { class, field } | Op::StaticFieldSet { class, field, .. } => {
                (class, LocationKind::Field(field), graph.field(field).ty)
            }
            Op::ArrayGet { array, index } => {
                (array, LocationKind::ArrayElement { index }, graph.ty(inst))
            }
            Op::ArraySet { array, index, value } => {
                let ty = match graph.op(array) {
                    Op::NewArray { elem, .. } => *elem,
                    _ => graph.ty(value),
                };
                (array, LocationKind::ArrayElement { index }, ty)
            }
            _ => return None,
        };

        let original = Self::hunt_for_original_reference(graph, reference);
        let ref_info = self.reference_info_for(graph, cfg, original, options);
        let location = match self.location_index.get(&(ref_info, kind)) {
            Some(&location) => location,
            None => {
                let location = self.locations.len();
                let is_volatile = match kind {
                    LocationKind::Field(field) => graph.field(field).is_volatile,
                    LocationKind::ArrayElement { .. } => false,
                };
                self.locations.push(HeapLocation {
                    ref_info,
                    kind,
                    ty,
                    is_volatile,
                    may_throw: false,
                    has_aliased_locations: false,
                });
                self.normalized.push(match kind {
                    LocationKind::ArrayElement { index } => Some(NormalizedIndex::of(graph, index)),
                    LocationKind::Field(_) => None,
                });
                self.location_index.insert((ref_info, kind), location);
                location
            }
        };
        self.locations[location].may_throw |= graph.can_throw(inst);
        self.access_location.insert(inst, location);
        Some(location)
    }

    fn compute_aliasing(&mut self, graph: &Graph) {
        let count = self.locations.len();
        self.aliasing = BitSet::new(count * count.saturating_sub(1) / 2);
        for b in 1..count {
            for a in 0..b {
                if self.compute_may_alias(graph, a, b) {
                    self.aliasing.insert(alias_bit(a, b));
                    self.locations[a].has_aliased_locations = true;
                    self.locations[b].has_aliased_locations = true;
                }
            }
        }
    }

    fn compute_may_alias(&self, graph: &Graph, a: usize, b: usize) -> bool {
        let (loc_a, loc_b) = (&self.locations[a], &self.locations[b]);
        match (loc_a.kind, loc_b.kind) {
            (LocationKind::Field(fa), LocationKind::Field(fb)) if fa != fb => return false,
            (LocationKind::Field(_), LocationKind::ArrayElement { .. })
            | (LocationKind::ArrayElement { .. }, LocationKind::Field(_)) => return false,
            _ => {}
        }
        if !Self::can_references_alias(
            graph,
            &self.ref_infos[loc_a.ref_info],
            &self.ref_infos[loc_b.ref_info],
        ) {
            return false;
        }
        match (self.normalized[a], self.normalized[b]) {
            (Some(ia), Some(ib)) => ia.may_overlap(ib),
            _ => true,
        }
    }
}

/// Bit of the pair `(a, b)` in the strictly lower triangular matrix.
fn alias_bit(a: usize, b: usize) -> usize {
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    high * (high - 1) / 2 + low
}

/// `false` when `fresh` is an allocation and `other` existed before it could
/// have been created.
fn may_alias_fresh(graph: &Graph, fresh: InstId, other: InstId) -> bool {
    if !graph.op(fresh).is_allocation() {
        return true;
    }
    !matches!(
        graph.op(other),
        Op::NewInstance { .. } | Op::NewArray { .. } | Op::ParameterValue { .. } | Op::LoadClass { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    fn collect(graph: &Graph) -> Result<HeapLocationCollector, SkipReason> {
        let cfg = ControlFlowInfo::compute(graph);
        HeapLocationCollector::collect(graph, &cfg, CollectorOptions::default())
    }

    #[test]
    fn fields_of_distinct_parameters_alias() {
        let (graph, (a_i, a_j, b_i, local_i)) = GraphBuilder::new("void Main.f(TestClass, TestClass)")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                let i = f.field(class, "i", DataType::Int32);
                let j = f.field(class, "j", DataType::Int32);
                let a = f.param_of(class);
                let b = f.param_of(class);
                f.block(0, |bb| {
                    let one = bb.int(1);
                    let local = bb.new_instance(class);
                    let a_i = bb.set_field(a, i, one);
                    let a_j = bb.set_field(a, j, one);
                    let checked = bb.null_check(b);
                    let b_i = bb.set_field(checked, i, one);
                    let local_i = bb.set_field(local, i, one);
                    bb.ret_void();
                    (a_i, a_j, b_i, local_i)
                })
            })
            .unwrap();

        let collector = collect(&graph).unwrap();
        assert_eq!(collector.location_count(), 4);
        let loc = |inst| collector.location_of(inst).unwrap();
        assert!(collector.may_alias(loc(a_i), loc(b_i)));
        assert!(!collector.may_alias(loc(a_i), loc(a_j)));
        assert!(!collector.may_alias(loc(a_i), loc(local_i)));
        assert!(collector.location(loc(a_i)).has_aliased_locations());
        assert!(!collector.location(loc(local_i)).has_aliased_locations());
        assert!(collector.reference_info_of(loc(local_i)).is_singleton_and_removable());
    }

    #[test]
    fn array_offsets_distinguish_elements() {
        let (graph, (at_i, at_next, at_zero)) = GraphBuilder::new("void Main.f(int[], int)")
            .build_with(|f| {
                let array = f.param(DataType::Reference);
                let i = f.param(DataType::Int32);
                f.block(0, |b| {
                    let one = b.int(1);
                    let zero = b.int(0);
                    let next = b.add(i, one);
                    let at_i = b.array_set(array, i, one);
                    let at_next = b.array_set(array, next, one);
                    let at_zero = b.array_set(array, zero, one);
                    b.ret_void();
                    (at_i, at_next, at_zero)
                })
            })
            .unwrap();

        let collector = collect(&graph).unwrap();
        let loc = |inst| collector.location_of(inst).unwrap();
        assert!(!collector.may_alias(loc(at_i), loc(at_next)));
        assert!(collector.may_alias(loc(at_i), loc(at_zero)));
        assert!(collector.may_alias(loc(at_next), loc(at_zero)));
        assert_eq!(collector.location(loc(at_i)).ty(), DataType::Int32);
    }

    #[test]
    fn locations_record_volatility_and_throwing_accesses() {
        let (graph, (int_store, ref_store, null_store)) = GraphBuilder::new("void Main.f(TestClass, Object[], Object[])")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                let i = f.field(class, "i", DataType::Int32);
                let obj = f.param_of(class);
                let objects = f.param(DataType::Reference);
                let nulls = f.param(DataType::Reference);
                f.block(0, |b| {
                    let one = b.int(1);
                    let zero = b.int(0);
                    let null = b.null();
                    let int_store = b.set_field(obj, i, one);
                    let ref_store = b.array_set(objects, zero, obj);
                    let null_store = b.array_set(nulls, zero, null);
                    b.ret_void();
                    (int_store, ref_store, null_store)
                })
            })
            .unwrap();

        let collector = collect(&graph).unwrap();
        let location = |inst| collector.location(collector.location_of(inst).unwrap());
        assert!(!location(int_store).is_volatile());
        assert!(!location(int_store).may_throw());
        // Storing a reference into an array needs a store check.
        assert!(location(ref_store).may_throw());
        assert!(!location(null_store).may_throw());
    }

    #[test]
    fn unrelated_classes_do_not_alias() {
        let (graph, (left_set, right_set)) = GraphBuilder::new("void Main.f(Left, Right)")
            .build_with(|f| {
                let base = f.class("Base", None);
                let left = f.class("Left", Some(base));
                let right = f.class("Right", Some(base));
                let i = f.field(base, "i", DataType::Int32);
                let l = f.param_of(left);
                let r = f.param_of(right);
                f.block(0, |b| {
                    let one = b.int(1);
                    let left_set = b.set_field(l, i, one);
                    let right_set = b.set_field(r, i, one);
                    b.ret_void();
                    (left_set, right_set)
                })
            })
            .unwrap();
        let collector = collect(&graph).unwrap();
        let loc = |inst| collector.location_of(inst).unwrap();
        assert!(!collector.may_alias(loc(left_set), loc(right_set)));
    }

    #[test]
    fn bail_outs() {
        let no_stores = GraphBuilder::new("int Main.f(TestClass)")
            .build(|f| {
                let class = f.class("TestClass", None);
                let i = f.field(class, "i", DataType::Int32);
                let obj = f.param_of(class);
                f.block(0, |b| {
                    let value = b.get_field(obj, i);
                    b.ret(value);
                });
            })
            .unwrap();
        assert_eq!(collect(&no_stores).unwrap_err(), SkipReason::NoHeapStores);

        let volatile = GraphBuilder::new("void Main.f(TestClass)")
            .build(|f| {
                let class = f.class("TestClass", None);
                let v = f.volatile_field(class, "v", DataType::Int32);
                let obj = f.param_of(class);
                f.block(0, |b| {
                    let one = b.int(1);
                    b.set_field(obj, v, one);
                    b.ret_void();
                });
            })
            .unwrap();
        assert!(matches!(collect(&volatile), Err(SkipReason::VolatileAccess(_))));

        let monitor = GraphBuilder::new("void Main.f(TestClass)")
            .build(|f| {
                let class = f.class("TestClass", None);
                let i = f.field(class, "i", DataType::Int32);
                let obj = f.param_of(class);
                f.block(0, |b| {
                    let one = b.int(1);
                    b.monitor(obj, true);
                    b.set_field(obj, i, one);
                    b.monitor(obj, false);
                    b.ret_void();
                });
            })
            .unwrap();
        assert!(matches!(collect(&monitor), Err(SkipReason::MonitorOperation(_))));
    }

    #[test]
    fn too_many_locations() {
        let graph = GraphBuilder::new("void Main.f(int[])")
            .build(|f| {
                let array = f.param(DataType::Reference);
                f.block(0, |b| {
                    let one = b.int(1);
                    for index in 0..3 {
                        let index = b.int(index);
                        b.array_set(array, index, one);
                    }
                    b.ret_void();
                });
            })
            .unwrap();
        let cfg = ControlFlowInfo::compute(&graph);
        let options = CollectorOptions {
            max_heap_locations: 2,
            partial_escape: false,
        };
        assert_eq!(
            HeapLocationCollector::collect(&graph, &cfg, options).unwrap_err(),
            SkipReason::TooManyLocations(3)
        );
    }

    #[test]
    fn removable_arrays_need_constant_shape() {
        let (graph, (fixed, sized)) = GraphBuilder::new("void Main.f(int)")
            .build_with(|f| {
                let n = f.param(DataType::Int32);
                f.block(0, |b| {
                    let two = b.int(2);
                    let zero = b.int(0);
                    let fixed = b.new_array(two, DataType::Int32);
                    let sized = b.new_array(n, DataType::Int32);
                    b.array_set(fixed, zero, two);
                    b.array_set(sized, zero, two);
                    b.ret_void();
                    (fixed, sized)
                })
            })
            .unwrap();
        assert!(is_removable_allocation(&graph, fixed));
        assert!(!is_removable_allocation(&graph, sized));
    }

    #[test]
    fn partial_escape_gets_a_subgraph() {
        let (graph, obj) = GraphBuilder::new("int Main.f(boolean)")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                let i = f.field(class, "i", DataType::Int32);
                let cond = f.param(DataType::Bool);
                let obj = f.block(0, |b| {
                    let obj = b.new_instance(class);
                    let one = b.int(1);
                    b.set_field(obj, i, one);
                    b.branch(cond, 1, 2);
                    obj
                });
                f.block(1, |b| {
                    b.invoke("Main.$noinline$escape", &[obj], DataType::Void);
                    b.goto(3);
                });
                f.block(2, |b| b.goto(3));
                f.block(3, |b| {
                    let value = b.get_field(obj, i);
                    b.ret(value);
                });
                obj
            })
            .unwrap();
        let collector = collect(&graph).unwrap();
        let info = collector.find_reference_info(&graph, obj).unwrap();
        assert_eq!(info.escape_kind(), crate::analysis::escape::EscapeKind::PartialEscape);
        let subgraph = info.subgraph().unwrap();
        assert_eq!(subgraph.excluded_cohorts().len(), 1);
    }
}
