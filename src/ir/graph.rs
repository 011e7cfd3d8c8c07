//! The arena-indexed instruction graph of one method.
//!
//! [`Graph`] owns every block and instruction of a method. Blocks and
//! instructions refer to each other through dense indices ([`BlockId`],
//! [`InstId`]) instead of pointers, which lets the control-flow graph contain
//! cycles (loops) and lets passes hold on to identifiers across mutations.
//!
//! # Use lists
//!
//! The graph keeps, for every instruction, the list of instructions using it
//! (one entry per operand slot). All mutations go through the methods of
//! [`Graph`], which keep those lists exact: [`Graph::replace_all_uses`],
//! [`Graph::remove`] and the insertion methods update them eagerly.
//!
//! # Constants
//!
//! Constants are interned per graph and live at the start of the entry block,
//! so they dominate every possible use.

use rustc_hash::FxHashMap;

use crate::{
    ir::{
        BasicBlock, BinaryOp, BlockId, ClassId, ClassInfo, ConstValue, DataType, FieldId,
        FieldInfo, InstId, Instruction, Op,
    },
    utils::graph::{GraphBase, NodeId, Predecessors, RootedGraph, Successors},
    Error, Result,
};

/// The instruction graph of a single method.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    signature: String,
    blocks: Vec<BasicBlock>,
    instructions: Vec<Instruction>,
    uses: Vec<Vec<InstId>>,
    classes: Vec<ClassInfo>,
    fields: Vec<FieldInfo>,
    constants: FxHashMap<ConstValue, InstId>,
    debuggable: bool,
    has_try_catch: bool,
}

impl Graph {
    /// Creates a graph holding only an empty entry block.
    ///
    /// # Arguments
    ///
    /// * `signature` - Method signature used in dumps, e.g. `int Main.test1(TestClass)`
    #[must_use]
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            blocks: vec![BasicBlock::new(BlockId::new(0))],
            instructions: Vec::new(),
            uses: Vec::new(),
            classes: Vec::new(),
            fields: Vec::new(),
            constants: FxHashMap::default(),
            debuggable: false,
            has_try_catch: false,
        }
    }

    /// The method signature.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The entry block, always block 0.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        BlockId::new(0)
    }

    /// Graphs compiled for debugging must keep every heap access.
    #[must_use]
    pub fn is_debuggable(&self) -> bool {
        self.debuggable
    }

    /// Marks the graph as compiled for debugging.
    pub fn set_debuggable(&mut self, debuggable: bool) {
        self.debuggable = debuggable;
    }

    /// Returns `true` if the method contains exception handlers.
    #[must_use]
    pub fn has_try_catch(&self) -> bool {
        self.has_try_catch
    }

    /// Records whether the method contains exception handlers.
    pub fn set_has_try_catch(&mut self, has_try_catch: bool) {
        self.has_try_catch = has_try_catch;
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns a block.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    /// Iterates all blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    /// Appends a new empty block.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        self.blocks.push(BasicBlock::new(id));
        id
    }

    /// Adds the edge `from -> to`, appending to both adjacency lists.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].successors.push(to);
        self.blocks[to.index()].predecessors.push(from);
    }

    // ── Classes and fields ──────────────────────────────────────────────

    /// Registers a class.
    pub fn add_class(&mut self, info: ClassInfo) -> ClassId {
        let id = ClassId::new(self.classes.len());
        self.classes.push(info);
        id
    }

    /// Returns a class.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    #[must_use]
    pub fn class(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.index()]
    }

    /// Registers a field.
    pub fn add_field(&mut self, info: FieldInfo) -> FieldId {
        let id = FieldId::new(self.fields.len());
        self.fields.push(info);
        id
    }

    /// Returns a field.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    #[must_use]
    pub fn field(&self, id: FieldId) -> &FieldInfo {
        &self.fields[id.index()]
    }

    /// Number of registered fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if `sub` is `sup` or one of its subclasses.
    #[must_use]
    pub fn is_subclass_of(&self, sub: ClassId, sup: ClassId) -> bool {
        let mut current = Some(sub);
        while let Some(class) = current {
            if class == sup {
                return true;
            }
            current = self.classes[class.index()].superclass;
        }
        false
    }

    /// Returns `true` if references with the given static classes may point
    /// to the same object. Unknown classes are compatible with everything.
    #[must_use]
    pub fn classes_may_alias(&self, a: Option<ClassId>, b: Option<ClassId>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => self.is_subclass_of(a, b) || self.is_subclass_of(b, a),
            _ => true,
        }
    }

    /// The closest class both `a` and `b` derive from, if any.
    #[must_use]
    pub fn common_superclass(&self, a: ClassId, b: ClassId) -> Option<ClassId> {
        let mut current = Some(a);
        while let Some(class) = current {
            if self.is_subclass_of(b, class) {
                return Some(class);
            }
            current = self.classes[class.index()].superclass;
        }
        None
    }

    // ── Instructions ────────────────────────────────────────────────────

    /// Number of arena slots, including removed instructions.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Returns an instruction.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this graph.
    #[must_use]
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.instructions[id.index()]
    }

    /// Shorthand for `self.inst(id).op()`.
    #[must_use]
    pub fn op(&self, id: InstId) -> &Op {
        &self.instructions[id.index()].op
    }

    /// Shorthand for `self.inst(id).ty()`.
    #[must_use]
    pub fn ty(&self, id: InstId) -> DataType {
        self.instructions[id.index()].ty
    }

    /// Iterates the live instructions block by block, phis first.
    pub fn live_instructions(&self) -> impl Iterator<Item = InstId> + '_ {
        self.blocks.iter().flat_map(BasicBlock::all_instructions)
    }

    /// The users of `id`, one entry per operand slot referring to it.
    #[must_use]
    pub fn uses(&self, id: InstId) -> &[InstId] {
        &self.uses[id.index()]
    }

    /// Returns `true` if any instruction uses `id`.
    #[must_use]
    pub fn has_uses(&self, id: InstId) -> bool {
        !self.uses[id.index()].is_empty()
    }

    /// The constant held by a `Constant` instruction.
    #[must_use]
    pub fn constant_value(&self, id: InstId) -> Option<ConstValue> {
        match self.op(id) {
            Op::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns `true` for constants whose bits are all zero (`0`, `0L`, `0.0`, `null`).
    #[must_use]
    pub fn is_zero_bit_pattern(&self, id: InstId) -> bool {
        self.constant_value(id)
            .is_some_and(ConstValue::is_zero_bit_pattern)
    }

    /// The interned constant for `value`, created in the entry block if needed.
    pub fn constant(&mut self, value: ConstValue) -> InstId {
        if let Some(&id) = self.constants.get(&value) {
            return id;
        }
        let id = self.alloc(Op::Constant(value), value.data_type());
        let entry = &mut self.blocks[0];
        let position = entry
            .instructions
            .iter()
            .position(|&i| {
                !matches!(
                    self.instructions[i.index()].op,
                    Op::ParameterValue { .. } | Op::Constant(_)
                )
            })
            .unwrap_or(entry.instructions.len());
        entry.instructions.insert(position, id);
        self.instructions[id.index()].block = Some(BlockId::new(0));
        self.constants.insert(value, id);
        id
    }

    /// The interned `int` constant `value`.
    pub fn int_constant(&mut self, value: i32) -> InstId {
        self.constant(ConstValue::Int(value))
    }

    /// The interned `null` constant.
    pub fn null_constant(&mut self) -> InstId {
        self.constant(ConstValue::Null)
    }

    /// Sets the static class of a reference-typed instruction.
    pub fn set_class(&mut self, id: InstId, class: Option<ClassId>) {
        self.instructions[id.index()].class = class;
    }

    /// Appends an instruction at the end of `block`.
    pub fn append(&mut self, block: BlockId, op: Op, ty: DataType) -> InstId {
        let id = self.alloc(op, ty);
        self.blocks[block.index()].instructions.push(id);
        self.instructions[id.index()].block = Some(block);
        id
    }

    /// Inserts an instruction at `position` among the non-phi instructions of `block`.
    ///
    /// Positions past the end append.
    pub fn insert_at(&mut self, block: BlockId, position: usize, op: Op, ty: DataType) -> InstId {
        let id = self.alloc(op, ty);
        let instructions = &mut self.blocks[block.index()].instructions;
        let position = position.min(instructions.len());
        instructions.insert(position, id);
        self.instructions[id.index()].block = Some(block);
        id
    }

    /// Inserts an instruction immediately before `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error if `anchor` is a phi or has been removed.
    pub fn insert_before(&mut self, anchor: InstId, op: Op, ty: DataType) -> Result<InstId> {
        let block = self.instructions[anchor.index()]
            .block
            .ok_or_else(|| malformed_error!("anchor {} has been removed", anchor))?;
        let position = self.blocks[block.index()]
            .instructions
            .iter()
            .position(|&i| i == anchor)
            .ok_or_else(|| malformed_error!("cannot insert before phi {}", anchor))?;
        let id = self.alloc(op, ty);
        self.blocks[block.index()].instructions.insert(position, id);
        self.instructions[id.index()].block = Some(block);
        Ok(id)
    }

    /// Inserts an instruction before the terminator of `block`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block has no terminator.
    pub fn insert_before_terminator(
        &mut self,
        block: BlockId,
        op: Op,
        ty: DataType,
    ) -> Result<InstId> {
        let terminator = self.blocks[block.index()]
            .last()
            .filter(|&t| self.op(t).is_terminator())
            .ok_or_else(|| malformed_error!("block {} has no terminator", block))?;
        self.insert_before(terminator, op, ty)
    }

    /// Adds a phi to `block`. `inputs` may be empty and filled in later with
    /// [`Graph::set_phi_inputs`].
    pub fn add_phi(&mut self, block: BlockId, inputs: Vec<InstId>, ty: DataType) -> InstId {
        let id = self.alloc(Op::Phi { inputs }, ty);
        self.blocks[block.index()].phis.push(id);
        self.instructions[id.index()].block = Some(block);
        id
    }

    /// Replaces all inputs of a phi.
    ///
    /// # Errors
    ///
    /// Returns an error if `phi` is not a phi.
    pub fn set_phi_inputs(&mut self, phi: InstId, inputs: Vec<InstId>) -> Result<()> {
        let old = match &self.instructions[phi.index()].op {
            Op::Phi { inputs } => inputs.clone(),
            _ => return Err(malformed_error!("{} is not a phi", phi)),
        };
        for input in old {
            self.unregister_use(input, phi);
        }
        for &input in &inputs {
            self.uses[input.index()].push(phi);
        }
        self.instructions[phi.index()].op = Op::Phi { inputs };
        Ok(())
    }

    /// Replaces the operation of an instruction, keeping use lists exact.
    pub fn set_op(&mut self, id: InstId, op: Op) {
        for input in self.instructions[id.index()].op.inputs() {
            self.unregister_use(input, id);
        }
        for input in op.inputs() {
            self.uses[input.index()].push(id);
        }
        self.instructions[id.index()].op = op;
    }

    /// Replaces every occurrence of `old` in the operands of `user` with `new`.
    pub fn replace_input(&mut self, user: InstId, old: InstId, new: InstId) {
        if old == new {
            return;
        }
        let mut replaced = 0;
        for slot in self.instructions[user.index()].op.inputs_mut() {
            if *slot == old {
                *slot = new;
                replaced += 1;
            }
        }
        for _ in 0..replaced {
            self.unregister_use(old, user);
            self.uses[new.index()].push(user);
        }
    }

    /// Redirects every use of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: InstId, new: InstId) {
        if old == new {
            return;
        }
        let mut users = std::mem::take(&mut self.uses[old.index()]);
        users.dedup();
        for user in users {
            for slot in self.instructions[user.index()].op.inputs_mut() {
                if *slot == old {
                    *slot = new;
                    self.uses[new.index()].push(user);
                }
            }
        }
    }

    /// Removes an instruction from its block.
    ///
    /// Environment operands of a `Deoptimize` count as uses, so an instruction
    /// still needed for deoptimization cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StillInUse`] if other instructions still use `id`.
    pub fn remove(&mut self, id: InstId) -> Result<()> {
        if self.has_uses(id) {
            return Err(Error::StillInUse(id));
        }
        let Some(block) = self.instructions[id.index()].block.take() else {
            return Ok(());
        };
        let block = &mut self.blocks[block.index()];
        block.phis.retain(|&i| i != id);
        block.instructions.retain(|&i| i != id);
        for input in self.instructions[id.index()].op.inputs() {
            self.unregister_use(input, id);
        }
        if let Op::Constant(value) = self.instructions[id.index()].op {
            self.constants.remove(&value);
        }
        Ok(())
    }

    /// Position of an instruction inside its block: all phis share position 0,
    /// other instructions count from 1.
    #[must_use]
    pub fn position_in_block(&self, id: InstId) -> Option<usize> {
        let block = self.instructions[id.index()].block?;
        if self.op(id).is_phi() {
            return Some(0);
        }
        self.blocks[block.index()]
            .instructions
            .iter()
            .position(|&i| i == id)
            .map(|p| p + 1)
    }

    /// The non-phi instruction right before `id` in its block.
    #[must_use]
    pub fn previous_instruction(&self, id: InstId) -> Option<InstId> {
        let block = self.instructions[id.index()].block?;
        let instructions = &self.blocks[block.index()].instructions;
        let position = instructions.iter().position(|&i| i == id)?;
        position.checked_sub(1).map(|p| instructions[p])
    }

    /// Returns `true` if executing `id` may throw an exception.
    #[must_use]
    pub fn can_throw(&self, id: InstId) -> bool {
        match self.op(id) {
            Op::NullCheck { .. }
            | Op::BoundsCheck { .. }
            | Op::NewInstance { .. }
            | Op::NewArray { .. }
            | Op::ClinitCheck { .. }
            | Op::UnresolvedInstanceFieldGet { .. }
            | Op::UnresolvedInstanceFieldSet { .. }
            | Op::UnresolvedStaticFieldGet { .. }
            | Op::UnresolvedStaticFieldSet { .. }
            | Op::MonitorOperation { .. }
            | Op::Throw { .. } => true,
            Op::Binary {
                op: BinaryOp::Div | BinaryOp::Rem,
                ..
            } => self.ty(id).kind().is_integral(),
            Op::InvokeStaticOrDirect { effects, .. } => {
                effects.contains(crate::ir::SideEffects::CAN_THROW)
            }
            // Storing a non-null reference into an array needs a store check.
            Op::ArraySet { value, .. } => {
                self.ty(*value).is_reference()
                    && self.constant_value(*value) != Some(ConstValue::Null)
            }
            _ => false,
        }
    }

    fn alloc(&mut self, op: Op, ty: DataType) -> InstId {
        let id = InstId::new(self.instructions.len());
        for input in op.inputs() {
            self.uses[input.index()].push(id);
        }
        self.instructions.push(Instruction::new(id, op, ty));
        self.uses.push(Vec::new());
        id
    }

    fn unregister_use(&mut self, used: InstId, user: InstId) {
        let list = &mut self.uses[used.index()];
        if let Some(position) = list.iter().position(|&u| u == user) {
            list.swap_remove(position);
        }
    }
}

impl GraphBase for Graph {
    fn node_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Successors for Graph {
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.blocks[node.index()]
            .successors
            .iter()
            .map(|b| NodeId::new(b.index()))
    }
}

impl Predecessors for Graph {
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.blocks[node.index()]
            .predecessors
            .iter()
            .map(|b| NodeId::new(b.index()))
    }
}

impl RootedGraph for Graph {
    fn entry(&self) -> NodeId {
        NodeId::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_graph() -> (Graph, InstId, InstId) {
        let mut graph = Graph::new("int Main.f(int)");
        let exit = graph.add_block();
        graph.add_edge(graph.entry(), exit);
        let param = graph.append(
            graph.entry(),
            Op::ParameterValue { index: 0 },
            DataType::Int32,
        );
        graph.append(graph.entry(), Op::Goto, DataType::Void);
        let one = graph.int_constant(1);
        let sum = graph.append(
            exit,
            Op::Binary {
                op: BinaryOp::Add,
                lhs: param,
                rhs: one,
            },
            DataType::Int32,
        );
        graph.append(exit, Op::Return { value: sum }, DataType::Void);
        (graph, param, sum)
    }

    #[test]
    fn constants_are_interned_after_parameters() {
        let (mut graph, param, _) = two_block_graph();
        let one = graph.int_constant(1);
        assert_eq!(graph.int_constant(1), one);
        let entry = graph.block(graph.entry()).instructions().to_vec();
        assert_eq!(entry[0], param);
        assert_eq!(entry[1], one);
        assert!(graph.op(entry[2]).is_terminator());
    }

    #[test]
    fn use_lists_follow_replacement() {
        let (mut graph, param, sum) = two_block_graph();
        let two = graph.int_constant(2);
        let one = graph.int_constant(1);
        assert_eq!(graph.uses(one), &[sum]);
        graph.replace_all_uses(one, two);
        assert!(!graph.has_uses(one));
        assert_eq!(graph.uses(two), &[sum]);
        assert_eq!(graph.op(sum).inputs(), vec![param, two]);
        graph.remove(one).unwrap();
        assert!(graph.inst(one).is_removed());
    }

    #[test]
    fn removing_used_instruction_fails() {
        let (mut graph, param, _) = two_block_graph();
        assert!(matches!(graph.remove(param), Err(Error::StillInUse(_))));
    }

    #[test]
    fn class_hierarchy_queries() {
        let mut graph = Graph::new("void Main.f()");
        let base = graph.add_class(ClassInfo {
            name: "Base".into(),
            superclass: None,
            is_finalizable: false,
        });
        let left = graph.add_class(ClassInfo {
            name: "Left".into(),
            superclass: Some(base),
            is_finalizable: false,
        });
        let right = graph.add_class(ClassInfo {
            name: "Right".into(),
            superclass: Some(base),
            is_finalizable: false,
        });
        assert!(graph.is_subclass_of(left, base));
        assert!(!graph.classes_may_alias(Some(left), Some(right)));
        assert!(graph.classes_may_alias(Some(left), Some(base)));
        assert!(graph.classes_may_alias(None, Some(right)));
        assert_eq!(graph.common_superclass(left, right), Some(base));
    }

    #[test]
    fn insertion_positions() {
        let (mut graph, param, sum) = two_block_graph();
        let exit = graph.inst(sum).block().unwrap();
        let check = graph
            .insert_before(sum, Op::NullCheck { input: param }, DataType::Reference)
            .unwrap();
        assert_eq!(graph.block(exit).instructions()[0], check);
        assert_eq!(graph.position_in_block(sum), Some(2));
        let phi = graph.add_phi(exit, vec![param], DataType::Int32);
        assert_eq!(graph.position_in_block(phi), Some(0));
        assert_eq!(graph.uses(param).len(), 3);
    }
}
