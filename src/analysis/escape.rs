//! Escape classification of references.
//!
//! A reference is a *singleton* when it is the only name for a freshly
//! allocated object: nothing else can read or write the object's fields
//! behind the method's back. Singletons that are also never returned and never
//! visible to a deoptimization can have their field stores dropped entirely.
//!
//! Escapes are the uses that create another name for the object or hand it to
//! code outside the method:
//!
//! - `NullCheck` and `BoundType` (aliases, kept conservative)
//! - `Phi` and `Select` (merged aliases)
//! - calls that may touch the heap
//! - stores of the reference itself into a field, static or array element
//! - unresolved accesses on the reference (treated as opaque calls)
//! - predicated accesses (their target is a merge of possibly several objects)
//!
//! References that are not allocated in the method escape intrinsically.
//! Instances of finalizable classes count as returned, since the finalizer
//! observes their fields.

use strum::Display;

use crate::ir::{Graph, InstId, Op, SideEffects};

/// How far an allocation escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EscapeKind {
    /// The reference never escapes.
    NoEscape,
    /// The reference escapes on some paths only; the remaining paths form a
    /// valid execution subgraph.
    PartialEscape,
    /// The reference escapes, or escaping paths cannot be separated.
    FullEscape,
}

/// The escape facts of one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeInfo {
    /// Only name of a fresh allocation.
    pub is_singleton: bool,
    /// Singleton that is neither returned nor thrown.
    pub is_singleton_and_not_returned: bool,
    /// Singleton that does not appear in a deoptimization environment.
    pub is_singleton_and_not_deopt_visible: bool,
}

impl EscapeInfo {
    const ESCAPED: Self = Self {
        is_singleton: false,
        is_singleton_and_not_returned: false,
        is_singleton_and_not_deopt_visible: false,
    };
}

fn is_finalizable_allocation(graph: &Graph, reference: InstId) -> bool {
    match graph.op(reference) {
        Op::NewInstance { class, .. } => graph.class(*class).is_finalizable,
        _ => false,
    }
}

/// Returns `true` if `user` is an escaping use of `reference`.
#[must_use]
pub fn is_escaping_use(graph: &Graph, reference: InstId, user: InstId) -> bool {
    match graph.op(user) {
        Op::NullCheck { .. }
        | Op::BoundType { .. }
        | Op::Phi { .. }
        | Op::Select { .. }
        | Op::PredicatedInstanceFieldGet { .. } => true,
        Op::InvokeStaticOrDirect { effects, .. } => {
            effects.intersects(SideEffects::READS_HEAP | SideEffects::WRITES_HEAP)
        }
        Op::InstanceFieldSet {
            object,
            value,
            predicated,
            ..
        } => *value == reference || (*predicated && *object == reference),
        Op::StaticFieldSet { value, .. }
        | Op::UnresolvedStaticFieldSet { value, .. }
        | Op::ArraySet { value, .. } => *value == reference,
        Op::UnresolvedInstanceFieldSet { .. } | Op::UnresolvedInstanceFieldGet { .. } => true,
        _ => false,
    }
}

/// Calls `visitor` for every escape of `reference` until it returns `false`.
///
/// Non-allocations and finalizable instances first report the reference
/// itself, since they escape before any use is looked at.
pub fn visit_escapes(graph: &Graph, reference: InstId, mut visitor: impl FnMut(InstId) -> bool) {
    if (!graph.op(reference).is_allocation() || is_finalizable_allocation(graph, reference))
        && !visitor(reference)
    {
        return;
    }
    let mut users = graph.uses(reference).to_vec();
    users.dedup();
    for user in users {
        if is_escaping_use(graph, reference, user) && !visitor(user) {
            return;
        }
    }
}

/// Computes the escape facts of `reference`.
#[must_use]
pub fn calculate_escape(graph: &Graph, reference: InstId) -> EscapeInfo {
    if !graph.op(reference).is_allocation() {
        return EscapeInfo::ESCAPED;
    }

    let mut info = EscapeInfo {
        is_singleton: true,
        is_singleton_and_not_returned: !is_finalizable_allocation(graph, reference),
        is_singleton_and_not_deopt_visible: true,
    };

    visit_escapes(graph, reference, |escape| {
        if escape == reference {
            return true;
        }
        info = EscapeInfo::ESCAPED;
        false
    });
    if !info.is_singleton {
        return info;
    }

    for &user in graph.uses(reference) {
        match graph.op(user) {
            Op::Return { .. } | Op::Throw { .. } => info.is_singleton_and_not_returned = false,
            Op::Deoptimize { .. } => info.is_singleton_and_not_deopt_visible = false,
            _ => {}
        }
    }
    info
}

/// Returns `true` if `reference` is a singleton.
#[must_use]
pub fn does_not_escape(graph: &Graph, reference: InstId) -> bool {
    calculate_escape(graph, reference).is_singleton
}

/// Uses of `reference` that end its confinement to the method on their path:
/// every escape, plus returns, throws and deoptimization environments. Escapes
/// through `Phi` and `Select` are followed transitively.
#[must_use]
pub fn partial_escape_points(graph: &Graph, reference: InstId) -> Vec<InstId> {
    let mut points = Vec::new();
    let mut seen = vec![reference];
    let mut worklist = vec![reference];
    while let Some(current) = worklist.pop() {
        visit_escapes(graph, current, |escape| {
            points.push(escape);
            if matches!(graph.op(escape), Op::Phi { .. } | Op::Select { .. })
                && !seen.contains(&escape)
            {
                seen.push(escape);
                worklist.push(escape);
            }
            true
        });
        for &user in graph.uses(current) {
            if matches!(
                graph.op(user),
                Op::Return { .. } | Op::Throw { .. } | Op::Deoptimize { .. }
            ) {
                points.push(user);
            }
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, GraphBuilder};

    #[test]
    fn field_store_of_reference_escapes() {
        let (graph, (a, b)) = GraphBuilder::new("void Main.f()")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                let next = f.field(class, "next", DataType::Reference);
                f.block(0, |bb| {
                    let a = bb.new_instance(class);
                    let b = bb.new_instance(class);
                    // `a` is the receiver, `b` is the stored value.
                    bb.set_field(a, next, b);
                    bb.ret_void();
                    (a, b)
                })
            })
            .unwrap();
        assert!(does_not_escape(&graph, a));
        assert!(!does_not_escape(&graph, b));
    }

    #[test]
    fn returned_singleton_stays_singleton() {
        let (graph, obj) = GraphBuilder::new("TestClass Main.f()")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                f.block(0, |b| {
                    let obj = b.new_instance(class);
                    b.ret(obj);
                    obj
                })
            })
            .unwrap();
        let info = calculate_escape(&graph, obj);
        assert!(info.is_singleton);
        assert!(!info.is_singleton_and_not_returned);
        assert!(info.is_singleton_and_not_deopt_visible);
    }

    #[test]
    fn deoptimize_environment_is_visible() {
        let (graph, obj) = GraphBuilder::new("void Main.f(boolean)")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                let cond = f.param(DataType::Bool);
                f.block(0, |b| {
                    let obj = b.new_instance(class);
                    b.deoptimize(cond, &[obj]);
                    b.ret_void();
                    obj
                })
            })
            .unwrap();
        let info = calculate_escape(&graph, obj);
        assert!(info.is_singleton_and_not_returned);
        assert!(!info.is_singleton_and_not_deopt_visible);
    }

    #[test]
    fn pure_invoke_does_not_escape_but_opaque_does() {
        let (graph, (pure, opaque)) = GraphBuilder::new("void Main.f()")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                f.block(0, |b| {
                    let pure = b.new_instance(class);
                    let opaque = b.new_instance(class);
                    b.invoke_with("Main.hash", &[pure], DataType::Int32, SideEffects::PURE);
                    b.invoke("Main.$noinline$escape", &[opaque], DataType::Void);
                    b.ret_void();
                    (pure, opaque)
                })
            })
            .unwrap();
        assert!(does_not_escape(&graph, pure));
        assert!(!does_not_escape(&graph, opaque));
        assert_eq!(partial_escape_points(&graph, opaque).len(), 1);
    }

    #[test]
    fn finalizable_instances_are_never_removable() {
        let (graph, (param, fin)) = GraphBuilder::new("void Main.f(TestClass)")
            .build_with(|f| {
                let class = f.class("TestClass", None);
                let finalizable = f.finalizable_class("Finalizable", None);
                let param = f.param_of(class);
                f.block(0, |b| {
                    let fin = b.new_instance(finalizable);
                    b.ret_void();
                    (param, fin)
                })
            })
            .unwrap();
        assert!(!does_not_escape(&graph, param));
        let info = calculate_escape(&graph, fin);
        assert!(info.is_singleton);
        assert!(!info.is_singleton_and_not_returned);
        let mut escapes = Vec::new();
        visit_escapes(&graph, param, |e| {
            escapes.push(e);
            true
        });
        assert_eq!(escapes, vec![param]);
    }
}
