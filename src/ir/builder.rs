//! Fluent construction of instruction graphs.
//!
//! [`GraphBuilder`] creates a [`Graph`] from a closure that declares classes,
//! fields, parameters and blocks. Blocks are addressed by small integers; block
//! `0` is the entry. Edges are added by the terminators in the order they are
//! emitted, so the predecessor order of a block is the order in which its
//! predecessors' terminators were built. Phi inputs are given per predecessor
//! number and resolved into predecessor order when the graph is finished.
//!
//! The finished graph is verified before it is returned.
//!
//! # Example
//!
//! ```rust,ignore
//! use heapscope::prelude::*;
//!
//! let (graph, load) = GraphBuilder::new("int Main.test(TestClass)").build_with(|f| {
//!     let class = f.class("TestClass", None);
//!     let i = f.field(class, "i", DataType::Int32);
//!     let obj = f.param_of(class);
//!     let mut load = None;
//!     f.block(0, |b| {
//!         let one = b.int(1);
//!         b.set_field(obj, i, one);
//!         let value = b.get_field(obj, i);
//!         load = Some(value);
//!         b.ret(value);
//!     });
//!     load
//! })?;
//! ```

use crate::{
    ir::{
        verify::verify, BinaryOp, BlockId, ClassId, ClassInfo, Condition, ConstValue, DataType,
        FieldId, FieldInfo, Graph, InstId, Op, SideEffects, UnaryOp,
    },
    Result,
};

/// Builds a [`Graph`] from a declarative closure.
#[derive(Debug)]
pub struct GraphBuilder {
    signature: String,
    debuggable: bool,
    has_try_catch: bool,
}

impl GraphBuilder {
    /// Starts a graph for the method with the given signature.
    #[must_use]
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            debuggable: false,
            has_try_catch: false,
        }
    }

    /// Marks the graph as compiled for debugging.
    #[must_use]
    pub fn debuggable(mut self) -> Self {
        self.debuggable = true;
        self
    }

    /// Marks the method as containing exception handlers.
    #[must_use]
    pub fn with_try_catch(mut self) -> Self {
        self.has_try_catch = true;
        self
    }

    /// Runs `f` against a fresh function builder, then resolves phis and verifies.
    ///
    /// Whatever `f` returns is handed back next to the graph, which is how
    /// callers keep hold of the ids of instructions they want to inspect.
    ///
    /// # Errors
    ///
    /// Returns an error if a phi does not name every predecessor exactly once,
    /// or if the finished graph fails verification.
    pub fn build_with<R>(self, f: impl FnOnce(&mut FunctionBuilder) -> R) -> Result<(Graph, R)> {
        let mut graph = Graph::new(self.signature);
        graph.set_debuggable(self.debuggable);
        graph.set_has_try_catch(self.has_try_catch);

        let mut builder = FunctionBuilder {
            graph,
            pending_phis: Vec::new(),
            param_count: 0,
        };
        let result = f(&mut builder);
        let graph = builder.finish()?;
        verify(&graph)?;
        Ok((graph, result))
    }

    /// Like [`GraphBuilder::build_with`] for closures that return nothing.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::build_with`].
    pub fn build(self, f: impl FnOnce(&mut FunctionBuilder)) -> Result<Graph> {
        self.build_with(f).map(|(graph, ())| graph)
    }
}

/// Declares the contents of a graph. Handed to the closure of [`GraphBuilder::build_with`].
#[derive(Debug)]
pub struct FunctionBuilder {
    graph: Graph,
    pending_phis: Vec<(InstId, Vec<(usize, InstId)>)>,
    param_count: usize,
}

impl FunctionBuilder {
    /// Declares a class.
    pub fn class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        self.graph.add_class(ClassInfo {
            name: name.to_string(),
            superclass,
            is_finalizable: false,
        })
    }

    /// Declares a class whose instances need finalization.
    pub fn finalizable_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        self.graph.add_class(ClassInfo {
            name: name.to_string(),
            superclass,
            is_finalizable: true,
        })
    }

    /// Declares an instance field.
    pub fn field(&mut self, class: ClassId, name: &str, ty: DataType) -> FieldId {
        self.add_field(class, name, ty, false, false)
    }

    /// Declares a volatile instance field.
    pub fn volatile_field(&mut self, class: ClassId, name: &str, ty: DataType) -> FieldId {
        self.add_field(class, name, ty, true, false)
    }

    /// Declares a static field.
    pub fn static_field(&mut self, class: ClassId, name: &str, ty: DataType) -> FieldId {
        self.add_field(class, name, ty, false, true)
    }

    fn add_field(
        &mut self,
        class: ClassId,
        name: &str,
        ty: DataType,
        is_volatile: bool,
        is_static: bool,
    ) -> FieldId {
        self.graph.add_field(FieldInfo {
            name: name.to_string(),
            class,
            ty,
            is_volatile,
            is_static,
        })
    }

    /// Declares the next parameter.
    pub fn param(&mut self, ty: DataType) -> InstId {
        let index = self.param_count;
        self.param_count += 1;
        self.graph
            .insert_at(BlockId::new(0), index, Op::ParameterValue { index }, ty)
    }

    /// Declares the next parameter as a reference of static class `class`.
    pub fn param_of(&mut self, class: ClassId) -> InstId {
        let param = self.param(DataType::Reference);
        self.graph.set_class(param, Some(class));
        param
    }

    /// Fills block `index`, creating it (and any lower-numbered block) if needed.
    pub fn block<T>(&mut self, index: usize, f: impl FnOnce(&mut BlockBuilder<'_>) -> T) -> T {
        let block = self.ensure_block(index);
        let mut builder = BlockBuilder {
            function: self,
            block,
        };
        f(&mut builder)
    }

    /// Sets the inputs of a phi created with [`BlockBuilder::phi`].
    ///
    /// Each input is paired with the number of the predecessor it flows from.
    pub fn set_phi_inputs(&mut self, phi: InstId, inputs: &[(usize, InstId)]) {
        self.pending_phis.push((phi, inputs.to_vec()));
    }

    /// Direct access to the graph under construction.
    pub fn graph(&mut self) -> &mut Graph {
        &mut self.graph
    }

    fn ensure_block(&mut self, index: usize) -> BlockId {
        while self.graph.block_count() <= index {
            self.graph.add_block();
        }
        BlockId::new(index)
    }

    fn finish(mut self) -> Result<Graph> {
        for (phi, inputs) in std::mem::take(&mut self.pending_phis) {
            let block = self
                .graph
                .inst(phi)
                .block()
                .ok_or_else(|| malformed_error!("phi {} is not in a block", phi))?;
            let preds = self.graph.block(block).predecessors().to_vec();
            if inputs.len() != preds.len() {
                return Err(malformed_error!(
                    "phi {} in {} has {} inputs for {} predecessors",
                    phi,
                    block,
                    inputs.len(),
                    preds.len()
                ));
            }
            let mut ordered = Vec::with_capacity(preds.len());
            for pred in &preds {
                let value = inputs
                    .iter()
                    .find(|(p, _)| *p == pred.index())
                    .map(|(_, v)| *v)
                    .ok_or_else(|| {
                        malformed_error!("phi {} has no input for predecessor {}", phi, pred)
                    })?;
                ordered.push(value);
            }
            self.graph.set_phi_inputs(phi, ordered)?;
        }
        Ok(self.graph)
    }
}

/// Appends instructions to one block.
#[derive(Debug)]
pub struct BlockBuilder<'a> {
    function: &'a mut FunctionBuilder,
    block: BlockId,
}

impl BlockBuilder<'_> {
    /// The block being filled.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.block
    }

    /// Direct access to the graph under construction.
    pub fn graph(&mut self) -> &mut Graph {
        &mut self.function.graph
    }

    fn emit(&mut self, op: Op, ty: DataType) -> InstId {
        self.function.graph.append(self.block, op, ty)
    }

    fn value_type(&self, id: InstId) -> DataType {
        self.function.graph.ty(id).kind()
    }

    // ── Constants ───────────────────────────────────────────────────────

    /// The `int` constant `value`.
    pub fn int(&mut self, value: i32) -> InstId {
        self.function.graph.int_constant(value)
    }

    /// The `long` constant `value`.
    pub fn long(&mut self, value: i64) -> InstId {
        self.function.graph.constant(ConstValue::Long(value))
    }

    /// The `float` constant `value`.
    pub fn float(&mut self, value: f32) -> InstId {
        self.function.graph.constant(ConstValue::Float(value))
    }

    /// The `double` constant `value`.
    pub fn double(&mut self, value: f64) -> InstId {
        self.function.graph.constant(ConstValue::Double(value))
    }

    /// The `null` constant.
    pub fn null(&mut self) -> InstId {
        self.function.graph.null_constant()
    }

    // ── Arithmetic ──────────────────────────────────────────────────────

    /// `lhs op rhs`, typed after `lhs`.
    pub fn binary(&mut self, op: BinaryOp, lhs: InstId, rhs: InstId) -> InstId {
        let ty = self.value_type(lhs);
        self.emit(Op::Binary { op, lhs, rhs }, ty)
    }

    /// `lhs + rhs`
    pub fn add(&mut self, lhs: InstId, rhs: InstId) -> InstId {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`
    pub fn sub(&mut self, lhs: InstId, rhs: InstId) -> InstId {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    /// `lhs * rhs`
    pub fn mul(&mut self, lhs: InstId, rhs: InstId) -> InstId {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    /// Unary `op input`.
    pub fn unary(&mut self, op: UnaryOp, input: InstId) -> InstId {
        let ty = self.value_type(input);
        self.emit(Op::Unary { op, input }, ty)
    }

    /// `lhs cond rhs` as a `Bool`.
    pub fn compare(&mut self, cond: Condition, lhs: InstId, rhs: InstId) -> InstId {
        self.emit(Op::Compare { cond, lhs, rhs }, DataType::Bool)
    }

    /// Converts `input` to `ty`.
    pub fn convert(&mut self, input: InstId, ty: DataType) -> InstId {
        self.emit(Op::TypeConversion { input }, ty)
    }

    /// `condition ? if_true : if_false`
    pub fn select(&mut self, condition: InstId, if_true: InstId, if_false: InstId) -> InstId {
        let ty = self.function.graph.ty(if_true);
        let class = self.function.graph.inst(if_true).class();
        let select = self.emit(
            Op::Select {
                condition,
                if_true,
                if_false,
            },
            ty,
        );
        self.function.graph.set_class(select, class);
        select
    }

    /// An empty phi; inputs are given with [`FunctionBuilder::set_phi_inputs`].
    pub fn phi(&mut self, ty: DataType) -> InstId {
        self.function.graph.add_phi(self.block, Vec::new(), ty)
    }

    // ── References ──────────────────────────────────────────────────────

    /// `new Class()`
    pub fn new_instance(&mut self, class: ClassId) -> InstId {
        self.allocate(class, false)
    }

    /// `new Class()` that also performs an initialization check.
    pub fn new_instance_with_checks(&mut self, class: ClassId) -> InstId {
        self.allocate(class, true)
    }

    fn allocate(&mut self, class: ClassId, needs_checks: bool) -> InstId {
        let id = self.emit(
            Op::NewInstance {
                class,
                needs_checks,
            },
            DataType::Reference,
        );
        self.function.graph.set_class(id, Some(class));
        id
    }

    /// `new elem[length]`
    pub fn new_array(&mut self, length: InstId, elem: DataType) -> InstId {
        self.emit(Op::NewArray { length, elem }, DataType::Reference)
    }

    /// Null check of `input`, yielding it.
    pub fn null_check(&mut self, input: InstId) -> InstId {
        let class = self.function.graph.inst(input).class();
        let id = self.emit(Op::NullCheck { input }, DataType::Reference);
        self.function.graph.set_class(id, class);
        id
    }

    /// Refines the static class of `input`.
    pub fn bound_type(&mut self, input: InstId, class: ClassId) -> InstId {
        let id = self.emit(Op::BoundType { input }, DataType::Reference);
        self.function.graph.set_class(id, Some(class));
        id
    }

    /// Bounds check of `index` against `length`, yielding `index`.
    pub fn bounds_check(&mut self, index: InstId, length: InstId) -> InstId {
        self.emit(Op::BoundsCheck { index, length }, DataType::Int32)
    }

    /// `array.length`
    pub fn array_length(&mut self, array: InstId) -> InstId {
        self.emit(Op::ArrayLength { array }, DataType::Int32)
    }

    /// The class object of `class`.
    pub fn load_class(&mut self, class: ClassId) -> InstId {
        let id = self.emit(Op::LoadClass { class }, DataType::Reference);
        self.function.graph.set_class(id, Some(class));
        id
    }

    /// Runs the static initializer of the class loaded by `class`.
    pub fn clinit_check(&mut self, class: InstId) -> InstId {
        let id = self.emit(Op::ClinitCheck { class }, DataType::Reference);
        let loaded = self.function.graph.inst(class).class();
        self.function.graph.set_class(id, loaded);
        id
    }

    // ── Heap accesses ───────────────────────────────────────────────────

    /// `object.field`
    pub fn get_field(&mut self, object: InstId, field: FieldId) -> InstId {
        let ty = self.function.graph.field(field).ty;
        self.emit(Op::InstanceFieldGet { object, field }, ty)
    }

    /// `object.field = value`
    pub fn set_field(&mut self, object: InstId, field: FieldId, value: InstId) -> InstId {
        self.emit(
            Op::InstanceFieldSet {
                object,
                field,
                value,
                predicated: false,
            },
            DataType::Void,
        )
    }

    /// `Class.field`, with `class` the `LoadClass` of the declaring class.
    pub fn get_static(&mut self, class: InstId, field: FieldId) -> InstId {
        let ty = self.function.graph.field(field).ty;
        self.emit(Op::StaticFieldGet { class, field }, ty)
    }

    /// `Class.field = value`
    pub fn set_static(&mut self, class: InstId, field: FieldId, value: InstId) -> InstId {
        self.emit(Op::StaticFieldSet { class, field, value }, DataType::Void)
    }

    /// `array[index]`, loading a value of type `ty`.
    pub fn array_get(&mut self, array: InstId, index: InstId, ty: DataType) -> InstId {
        self.emit(Op::ArrayGet { array, index }, ty)
    }

    /// `array[index] = value`
    pub fn array_set(&mut self, array: InstId, index: InstId, value: InstId) -> InstId {
        self.emit(
            Op::ArraySet {
                array,
                index,
                value,
            },
            DataType::Void,
        )
    }

    /// Unresolved `object.field`.
    pub fn unresolved_get_field(&mut self, object: InstId, field: FieldId) -> InstId {
        let ty = self.function.graph.field(field).ty;
        self.emit(Op::UnresolvedInstanceFieldGet { object, field }, ty)
    }

    /// Unresolved `object.field = value`.
    pub fn unresolved_set_field(&mut self, object: InstId, field: FieldId, value: InstId) -> InstId {
        self.emit(
            Op::UnresolvedInstanceFieldSet {
                object,
                field,
                value,
            },
            DataType::Void,
        )
    }

    /// Unresolved `Class.field`.
    pub fn unresolved_get_static(&mut self, field: FieldId) -> InstId {
        let ty = self.function.graph.field(field).ty;
        self.emit(Op::UnresolvedStaticFieldGet { field }, ty)
    }

    /// Unresolved `Class.field = value`.
    pub fn unresolved_set_static(&mut self, field: FieldId, value: InstId) -> InstId {
        self.emit(Op::UnresolvedStaticFieldSet { field, value }, DataType::Void)
    }

    // ── Calls and barriers ──────────────────────────────────────────────

    /// A call with unknown side effects.
    pub fn invoke(&mut self, method: &str, args: &[InstId], ret: DataType) -> InstId {
        self.invoke_with(method, args, ret, SideEffects::OPAQUE)
    }

    /// A call with the given side effects.
    pub fn invoke_with(
        &mut self,
        method: &str,
        args: &[InstId],
        ret: DataType,
        effects: SideEffects,
    ) -> InstId {
        self.emit(
            Op::InvokeStaticOrDirect {
                method: method.to_string(),
                args: args.to_vec(),
                effects,
            },
            ret,
        )
    }

    /// Publication barrier for `objects`.
    pub fn constructor_fence(&mut self, objects: &[InstId]) -> InstId {
        self.emit(
            Op::ConstructorFence {
                objects: objects.to_vec(),
            },
            DataType::Void,
        )
    }

    /// Monitor enter (`true`) or exit (`false`).
    pub fn monitor(&mut self, object: InstId, enter: bool) -> InstId {
        self.emit(Op::MonitorOperation { object, enter }, DataType::Void)
    }

    /// Deoptimizes when `condition` holds, keeping `env` alive.
    pub fn deoptimize(&mut self, condition: InstId, env: &[InstId]) -> InstId {
        self.emit(
            Op::Deoptimize {
                condition,
                env: env.to_vec(),
            },
            DataType::Void,
        )
    }

    // ── Terminators ─────────────────────────────────────────────────────

    /// Jumps to block `target`.
    pub fn goto(&mut self, target: usize) -> InstId {
        let target = self.function.ensure_block(target);
        self.function.graph.add_edge(self.block, target);
        self.emit(Op::Goto, DataType::Void)
    }

    /// Branches to `if_true` when `condition` holds, else to `if_false`.
    pub fn branch(&mut self, condition: InstId, if_true: usize, if_false: usize) -> InstId {
        let if_true = self.function.ensure_block(if_true);
        let if_false = self.function.ensure_block(if_false);
        self.function.graph.add_edge(self.block, if_true);
        self.function.graph.add_edge(self.block, if_false);
        self.emit(Op::If { condition }, DataType::Void)
    }

    /// Returns `value`.
    pub fn ret(&mut self, value: InstId) -> InstId {
        self.emit(Op::Return { value }, DataType::Void)
    }

    /// Returns from a `void` method.
    pub fn ret_void(&mut self) -> InstId {
        self.emit(Op::ReturnVoid, DataType::Void)
    }

    /// Throws `exception`.
    pub fn throw(&mut self, exception: InstId) -> InstId {
        self.emit(Op::Throw { exception }, DataType::Void)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn phi_inputs_follow_predecessor_order() {
        let (graph, phi) = GraphBuilder::new("int Main.f(boolean)")
            .build_with(|f| {
                let cond = f.param(DataType::Bool);
                f.block(0, |b| b.branch(cond, 2, 1));
                let one = f.block(1, |b| {
                    b.goto(3);
                    b.int(1)
                });
                let two = f.block(2, |b| {
                    b.goto(3);
                    b.int(2)
                });
                let phi = f.block(3, |b| {
                    let phi = b.phi(DataType::Int32);
                    b.ret(phi);
                    phi
                });
                f.set_phi_inputs(phi, &[(1, one), (2, two)]);
                (phi, one, two)
            })
            .unwrap();
        let (phi, one, two) = phi;
        assert_eq!(graph.block(BlockId::new(3)).predecessors(), &[BlockId::new(1), BlockId::new(2)]);
        assert_eq!(graph.op(phi).inputs(), vec![one, two]);
    }

    #[test]
    fn missing_phi_input_is_rejected() {
        let result = GraphBuilder::new("int Main.f(boolean)").build(|f| {
            let cond = f.param(DataType::Bool);
            f.block(0, |b| b.branch(cond, 1, 2));
            f.block(1, |b| b.goto(3));
            f.block(2, |b| b.goto(3));
            let (phi, one) = f.block(3, |b| {
                let phi = b.phi(DataType::Int32);
                let one = b.int(1);
                b.ret(phi);
                (phi, one)
            });
            f.set_phi_inputs(phi, &[(1, one), (1, one)]);
        });
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }

    #[test]
    fn parameters_precede_constants() {
        let graph = GraphBuilder::new("int Main.f(int, int)")
            .build(|f| {
                let a = f.param(DataType::Int32);
                f.block(0, |b| {
                    let one = b.int(1);
                    let sum = b.add(a, one);
                    b.ret(sum);
                });
                let _ = f.param(DataType::Int32);
            })
            .unwrap();
        let entry = graph.block(graph.entry()).instructions();
        assert!(matches!(graph.op(entry[0]), Op::ParameterValue { index: 0 }));
        assert!(matches!(graph.op(entry[1]), Op::ParameterValue { index: 1 }));
        assert!(matches!(graph.op(entry[2]), Op::Constant(_)));
    }
}
