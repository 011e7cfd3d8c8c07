//! A reference interpreter for instruction graphs.
//!
//! The interpreter executes a [`Graph`] against a small object heap and reports
//! an [`Observation`]: how the method completed and the canonical shape of all
//! heap state reachable from outside the method. Two graphs are
//! observationally equivalent for some arguments when their observations are
//! equal, which is what the differential tests check before and after
//! load-store elimination.
//!
//! # Observable state
//!
//! The roots of the snapshot are the arguments, the static fields, the value
//! returned or thrown, the environment of a taken deoptimization and every
//! value passed to an invoke. Objects are numbered in discovery order from
//! those roots, so allocation order and unreachable objects do not matter.
//! Fields holding their type's default value are omitted.
//!
//! # Ill-formed programs
//!
//! Dereferencing null or indexing out of bounds without a preceding
//! `NullCheck` or `BoundsCheck` is reported as [`Error::Execution`] rather than
//! as a Java exception, since the graph itself claims those cannot throw.

use std::{collections::VecDeque, fmt};

use rustc_hash::FxHashMap;

use crate::{
    ir::{
        BinaryOp, BlockId, ClassId, Condition, ConstValue, DataType, FieldId, Graph, InstId, Op,
        UnaryOp,
    },
    Error, Result,
};

/// Default bound on executed instructions.
pub const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// Index of an object in the interpreter heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(usize);

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Any value of `Int32` kind, including sub-word and boolean values.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Single precision float.
    Float(f32),
    /// Double precision float.
    Double(f64),
    /// A reference, `None` for null.
    Ref(Option<ObjRef>),
    /// Result of a `void` operation.
    Void,
}

impl Value {
    /// The default value stored in a fresh slot of type `ty`.
    #[must_use]
    pub fn default_of(ty: DataType) -> Self {
        Self::from_const(ty.default_value())
    }

    fn from_const(value: ConstValue) -> Self {
        match value {
            ConstValue::Int(v) => Self::Int(v),
            ConstValue::Long(v) => Self::Long(v),
            ConstValue::Float(v) => Self::Float(v),
            ConstValue::Double(v) => Self::Double(v),
            ConstValue::Null => Self::Ref(None),
        }
    }

    fn as_int(self) -> Result<i32> {
        match self {
            Self::Int(v) => Ok(v),
            other => Err(Error::Execution(format!("expected int, found {other:?}"))),
        }
    }

    fn as_ref(self) -> Result<Option<ObjRef>> {
        match self {
            Self::Ref(r) => Ok(r),
            other => Err(Error::Execution(format!("expected reference, found {other:?}"))),
        }
    }

    fn is_truthy(self) -> Result<bool> {
        Ok(self.as_int()? != 0)
    }
}

/// Java exception kinds raised by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// `NullCheck` on null.
    NullPointer,
    /// `BoundsCheck` failure.
    ArrayIndexOutOfBounds,
    /// Integral division by zero.
    Arithmetic,
    /// `NewArray` with a negative length.
    NegativeArraySize,
    /// A `Throw` instruction.
    Thrown,
    /// An exception raised by an invoke handler.
    FromCallee,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
enum HeapObject {
    Instance {
        class: ClassId,
        fields: FxHashMap<FieldId, Value>,
    },
    Array {
        elem: DataType,
        values: Vec<Value>,
    },
    Class(ClassId),
}

/// The object heap shared by the interpreter and invoke handlers.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    statics: FxHashMap<FieldId, Value>,
    class_objects: FxHashMap<ClassId, ObjRef>,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an instance of `class` with all fields at their defaults.
    pub fn alloc_instance(&mut self, class: ClassId) -> ObjRef {
        self.objects.push(HeapObject::Instance {
            class,
            fields: FxHashMap::default(),
        });
        ObjRef(self.objects.len() - 1)
    }

    /// Allocates an array of `length` default elements.
    pub fn alloc_array(&mut self, elem: DataType, length: usize) -> ObjRef {
        self.objects.push(HeapObject::Array {
            elem,
            values: vec![Value::default_of(elem); length],
        });
        ObjRef(self.objects.len() - 1)
    }

    fn class_object(&mut self, class: ClassId) -> ObjRef {
        if let Some(&r) = self.class_objects.get(&class) {
            return r;
        }
        self.objects.push(HeapObject::Class(class));
        let r = ObjRef(self.objects.len() - 1);
        self.class_objects.insert(class, r);
        r
    }

    /// Reads `object.field`, `None` if `object` is not an instance.
    #[must_use]
    pub fn field(&self, object: ObjRef, field: FieldId, ty: DataType) -> Option<Value> {
        match self.objects.get(object.0)? {
            HeapObject::Instance { fields, .. } => {
                Some(fields.get(&field).copied().unwrap_or(Value::default_of(ty)))
            }
            _ => None,
        }
    }

    /// Writes `object.field`, truncating to the slot type.
    pub fn set_field(&mut self, object: ObjRef, field: FieldId, ty: DataType, value: Value) -> bool {
        match self.objects.get_mut(object.0) {
            Some(HeapObject::Instance { fields, .. }) => {
                fields.insert(field, truncate(value, ty));
                true
            }
            _ => false,
        }
    }

    /// Reads a static field.
    #[must_use]
    pub fn static_field(&self, field: FieldId, ty: DataType) -> Value {
        self.statics
            .get(&field)
            .copied()
            .unwrap_or(Value::default_of(ty))
    }

    /// Writes a static field, truncating to the slot type.
    pub fn set_static_field(&mut self, field: FieldId, ty: DataType, value: Value) {
        self.statics.insert(field, truncate(value, ty));
    }

    fn array(&self, array: ObjRef) -> Option<(DataType, &Vec<Value>)> {
        match self.objects.get(array.0)? {
            HeapObject::Array { elem, values } => Some((*elem, values)),
            _ => None,
        }
    }

    fn array_mut(&mut self, array: ObjRef) -> Option<(DataType, &mut Vec<Value>)> {
        match self.objects.get_mut(array.0)? {
            HeapObject::Array { elem, values } => Some((*elem, values)),
            _ => None,
        }
    }
}

/// Truncates an `Int32` kind value to a sub-word slot type.
fn truncate(value: Value, ty: DataType) -> Value {
    match (value, ty) {
        (Value::Int(v), DataType::Bool) => Value::Int(i32::from(v & 1 != 0)),
        (Value::Int(v), DataType::Int8) => Value::Int(i32::from(v as i8)),
        (Value::Int(v), DataType::Uint8) => Value::Int(i32::from(v as u8)),
        (Value::Int(v), DataType::Int16) => Value::Int(i32::from(v as i16)),
        (Value::Int(v), DataType::Uint16) => Value::Int(i32::from(v as u16)),
        (other, _) => other,
    }
}

fn convert(value: Value, ty: DataType) -> Result<Value> {
    let converted = match (value, ty) {
        (Value::Int(_), DataType::Bool | DataType::Int8 | DataType::Uint8 | DataType::Int16 | DataType::Uint16) => {
            truncate(value, ty)
        }
        (Value::Int(v), DataType::Int32) => Value::Int(v),
        (Value::Int(v), DataType::Int64) => Value::Long(i64::from(v)),
        (Value::Int(v), DataType::Float32) => Value::Float(v as f32),
        (Value::Int(v), DataType::Float64) => Value::Double(f64::from(v)),
        (Value::Long(v), DataType::Int32) => Value::Int(v as i32),
        (Value::Long(v), DataType::Int64) => Value::Long(v),
        (Value::Long(v), DataType::Float32) => Value::Float(v as f32),
        (Value::Long(v), DataType::Float64) => Value::Double(v as f64),
        (Value::Long(v), sub) if sub.is_integral() => truncate(Value::Int(v as i32), sub),
        (Value::Float(v), DataType::Int32) => Value::Int(v as i32),
        (Value::Float(v), DataType::Int64) => Value::Long(v as i64),
        (Value::Float(v), DataType::Float32) => Value::Float(v),
        (Value::Float(v), DataType::Float64) => Value::Double(f64::from(v)),
        (Value::Double(v), DataType::Int32) => Value::Int(v as i32),
        (Value::Double(v), DataType::Int64) => Value::Long(v as i64),
        (Value::Double(v), DataType::Float32) => Value::Float(v as f32),
        (Value::Double(v), DataType::Float64) => Value::Double(v),
        (Value::Ref(r), DataType::Reference) => Value::Ref(r),
        (value, ty) => {
            return Err(Error::Execution(format!("cannot convert {value:?} to {ty}")));
        }
    };
    Ok(converted)
}

/// Result of an invoke handler: the returned value or the exception raised.
pub type HandlerResult = std::result::Result<Value, ExceptionKind>;

type Handler = Box<dyn Fn(&mut Heap, &[Value]) -> HandlerResult + Send + Sync>;

/// A value in a heap snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapValue {
    /// Integer of `Int32` kind.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Float, by bit pattern.
    Float(u32),
    /// Double, by bit pattern.
    Double(u64),
    /// Null reference.
    Null,
    /// Object, by discovery number.
    Object(usize),
    /// No value.
    Void,
}

/// An object in a heap snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectSnapshot {
    /// An instance with its non-default fields in field order.
    Instance {
        /// Allocated class.
        class: ClassId,
        /// Non-default fields.
        fields: Vec<(FieldId, SnapValue)>,
    },
    /// An array with all its elements.
    Array {
        /// Element type.
        elem: DataType,
        /// Elements.
        values: Vec<SnapValue>,
    },
    /// A class object.
    Class(ClassId),
}

/// How a method invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Normal return.
    Returned(SnapValue),
    /// An exception escaped the method.
    Threw(ExceptionKind, Option<SnapValue>),
    /// A `Deoptimize` was taken with the given environment.
    Deoptimized(Vec<SnapValue>),
}

/// The externally observable result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// How the method ended.
    pub completion: Completion,
    /// The arguments, as seen after execution.
    pub arguments: Vec<SnapValue>,
    /// Values passed to invokes, in call order.
    pub escaped: Vec<SnapValue>,
    /// Non-default static fields in field order.
    pub statics: Vec<(FieldId, SnapValue)>,
    /// Reachable objects in discovery order.
    pub objects: Vec<ObjectSnapshot>,
}

enum Exit {
    Return(Value),
    Throw(ExceptionKind, Option<Value>),
    Deopt(Vec<Value>),
}

/// Executes graphs.
pub struct Interpreter {
    handlers: FxHashMap<String, Handler>,
    step_limit: usize,
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("step_limit", &self.step_limit)
            .finish()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Creates an interpreter with no handlers and the default step limit.
    ///
    /// Invokes without a handler return their type's default value.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: FxHashMap::default(),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    /// Sets the bound on executed instructions.
    #[must_use]
    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Registers the behavior of invokes of `method`.
    #[must_use]
    pub fn with_handler(
        mut self,
        method: &str,
        handler: impl Fn(&mut Heap, &[Value]) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(method.to_string(), Box::new(handler));
        self
    }

    /// Runs `graph` on a fresh heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StepLimit`] if execution does not finish in time, and
    /// [`Error::Execution`] if the graph misbehaves (see module docs).
    pub fn run(&self, graph: &Graph, args: &[Value]) -> Result<Observation> {
        self.run_with_heap(graph, args, Heap::new())
    }

    /// Runs `graph` on a pre-populated heap.
    ///
    /// # Errors
    ///
    /// See [`Interpreter::run`].
    pub fn run_with_heap(&self, graph: &Graph, args: &[Value], heap: Heap) -> Result<Observation> {
        let mut frame = Frame {
            graph,
            heap,
            values: vec![None; graph.instruction_count()],
            escaped: Vec::new(),
        };
        let exit = self.execute(&mut frame, args)?;
        Ok(frame.observe(args, exit))
    }

    fn execute(&self, frame: &mut Frame<'_>, args: &[Value]) -> Result<Exit> {
        let graph = frame.graph;
        let mut block = graph.entry();
        let mut previous: Option<BlockId> = None;
        let mut steps = 0usize;

        loop {
            let current = graph.block(block);
            if let Some(pred) = previous {
                let slot = current
                    .predecessor_index(pred)
                    .ok_or_else(|| Error::Execution(format!("{pred} is not a predecessor of {block}")))?;
                let incoming: Vec<(InstId, Value)> = current
                    .phis()
                    .iter()
                    .map(|&phi| {
                        let input = graph.op(phi).inputs()[slot];
                        frame.get(input).map(|v| (phi, v))
                    })
                    .collect::<Result<_>>()?;
                for (phi, value) in incoming {
                    frame.values[phi.index()] = Some(value);
                }
            }

            for &inst in current.instructions() {
                steps += 1;
                if steps > self.step_limit {
                    return Err(Error::StepLimit(self.step_limit));
                }
                match self.step(frame, inst, args)? {
                    Step::Next => {}
                    Step::Jump(successor) => {
                        previous = Some(block);
                        block = current.successors()[successor];
                        break;
                    }
                    Step::Exit(exit) => return Ok(exit),
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(&self, frame: &mut Frame<'_>, inst: InstId, args: &[Value]) -> Result<Step> {
        let graph = frame.graph;
        let ty = graph.ty(inst);
        let value = match graph.op(inst) {
            Op::ParameterValue { index } => *args
                .get(*index)
                .ok_or_else(|| Error::Execution(format!("missing argument {index}")))?,
            Op::Constant(c) => Value::from_const(*c),
            Op::Binary { op, lhs, rhs } => {
                match binary(*op, frame.get(*lhs)?, frame.get(*rhs)?)? {
                    Some(v) => v,
                    None => return Ok(Step::Exit(Exit::Throw(ExceptionKind::Arithmetic, None))),
                }
            }
            Op::Unary { op, input } => unary(*op, frame.get(*input)?)?,
            Op::Compare { cond, lhs, rhs } => {
                Value::Int(i32::from(compare(*cond, frame.get(*lhs)?, frame.get(*rhs)?)?))
            }
            Op::TypeConversion { input } => convert(frame.get(*input)?, ty)?,
            Op::NullCheck { input } => {
                let v = frame.get(*input)?;
                if v.as_ref()?.is_none() {
                    return Ok(Step::Exit(Exit::Throw(ExceptionKind::NullPointer, None)));
                }
                v
            }
            Op::BoundType { input } => frame.get(*input)?,
            Op::BoundsCheck { index, length } => {
                let i = frame.get(*index)?.as_int()?;
                let n = frame.get(*length)?.as_int()?;
                if i < 0 || i >= n {
                    return Ok(Step::Exit(Exit::Throw(ExceptionKind::ArrayIndexOutOfBounds, None)));
                }
                Value::Int(i)
            }
            Op::ArrayLength { array } => {
                let r = frame.deref(*array, inst)?;
                let (_, values) = frame
                    .heap
                    .array(r)
                    .ok_or_else(|| Error::Execution(format!("{inst} on a non-array")))?;
                Value::Int(i32::try_from(values.len()).map_err(|e| Error::Execution(e.to_string()))?)
            }
            Op::NewInstance { class, .. } => Value::Ref(Some(frame.heap.alloc_instance(*class))),
            Op::NewArray { length, elem } => {
                let n = frame.get(*length)?.as_int()?;
                let Ok(n) = usize::try_from(n) else {
                    return Ok(Step::Exit(Exit::Throw(ExceptionKind::NegativeArraySize, None)));
                };
                Value::Ref(Some(frame.heap.alloc_array(*elem, n)))
            }
            Op::LoadClass { class } => Value::Ref(Some(frame.heap.class_object(*class))),
            Op::ClinitCheck { class } => frame.get(*class)?,
            Op::InstanceFieldGet { object, field }
            | Op::UnresolvedInstanceFieldGet { object, field } => {
                let r = frame.deref(*object, inst)?;
                let slot = graph.field(*field).ty;
                frame
                    .heap
                    .field(r, *field, slot)
                    .ok_or_else(|| Error::Execution(format!("{inst} on a non-instance")))?
            }
            Op::InstanceFieldSet {
                object,
                field,
                value,
                predicated,
            } => {
                let target = frame.get(*object)?.as_ref()?;
                if target.is_some() || !predicated {
                    let r = frame.deref(*object, inst)?;
                    let v = frame.get(*value)?;
                    let slot = graph.field(*field).ty;
                    if !frame.heap.set_field(r, *field, slot, v) {
                        return Err(Error::Execution(format!("{inst} on a non-instance")));
                    }
                }
                Value::Void
            }
            Op::UnresolvedInstanceFieldSet {
                object,
                field,
                value,
            } => {
                let r = frame.deref(*object, inst)?;
                let v = frame.get(*value)?;
                let slot = graph.field(*field).ty;
                if !frame.heap.set_field(r, *field, slot, v) {
                    return Err(Error::Execution(format!("{inst} on a non-instance")));
                }
                Value::Void
            }
            Op::StaticFieldGet { field, .. } | Op::UnresolvedStaticFieldGet { field } => {
                frame.heap.static_field(*field, graph.field(*field).ty)
            }
            Op::StaticFieldSet { field, value, .. } | Op::UnresolvedStaticFieldSet { field, value } => {
                let v = frame.get(*value)?;
                frame.heap.set_static_field(*field, graph.field(*field).ty, v);
                Value::Void
            }
            Op::ArrayGet { array, index } => {
                let r = frame.deref(*array, inst)?;
                let i = frame.get(*index)?.as_int()?;
                let (_, values) = frame
                    .heap
                    .array(r)
                    .ok_or_else(|| Error::Execution(format!("{inst} on a non-array")))?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| values.get(i).copied())
                    .ok_or_else(|| Error::Execution(format!("{inst} indexes out of bounds")))?
            }
            Op::ArraySet {
                array,
                index,
                value,
            } => {
                let r = frame.deref(*array, inst)?;
                let i = frame.get(*index)?.as_int()?;
                let v = frame.get(*value)?;
                let (elem, values) = frame
                    .heap
                    .array_mut(r)
                    .ok_or_else(|| Error::Execution(format!("{inst} on a non-array")))?;
                let slot = usize::try_from(i)
                    .ok()
                    .and_then(|i| values.get_mut(i))
                    .ok_or_else(|| Error::Execution(format!("{inst} indexes out of bounds")))?;
                *slot = truncate(v, elem);
                Value::Void
            }
            Op::PredicatedInstanceFieldGet {
                target,
                default,
                field,
            } => match frame.get(*target)?.as_ref()? {
                None => frame.get(*default)?,
                Some(r) => frame
                    .heap
                    .field(r, *field, graph.field(*field).ty)
                    .ok_or_else(|| Error::Execution(format!("{inst} on a non-instance")))?,
            },
            Op::InvokeStaticOrDirect { method, args, .. } => {
                let values: Vec<Value> = args.iter().map(|&a| frame.get(a)).collect::<Result<_>>()?;
                frame.escaped.extend(values.iter().copied());
                match self.handlers.get(method) {
                    Some(handler) => match handler(&mut frame.heap, &values) {
                        Ok(v) => v,
                        Err(kind) => return Ok(Step::Exit(Exit::Throw(kind, None))),
                    },
                    None if ty == DataType::Void => Value::Void,
                    None => Value::default_of(ty),
                }
            }
            Op::ConstructorFence { .. } => Value::Void,
            Op::MonitorOperation { object, .. } => {
                if frame.get(*object)?.as_ref()?.is_none() {
                    return Ok(Step::Exit(Exit::Throw(ExceptionKind::NullPointer, None)));
                }
                Value::Void
            }
            Op::Deoptimize { condition, env } => {
                if frame.get(*condition)?.is_truthy()? {
                    let values = env.iter().map(|&e| frame.get(e)).collect::<Result<_>>()?;
                    return Ok(Step::Exit(Exit::Deopt(values)));
                }
                Value::Void
            }
            Op::Select {
                condition,
                if_true,
                if_false,
            } => {
                if frame.get(*condition)?.is_truthy()? {
                    frame.get(*if_true)?
                } else {
                    frame.get(*if_false)?
                }
            }
            Op::Phi { .. } => {
                return Err(Error::Execution(format!("phi {inst} in instruction list")));
            }
            Op::Goto => return Ok(Step::Jump(0)),
            Op::If { condition } => {
                let taken = if frame.get(*condition)?.is_truthy()? { 0 } else { 1 };
                return Ok(Step::Jump(taken));
            }
            Op::Return { value } => return Ok(Step::Exit(Exit::Return(frame.get(*value)?))),
            Op::ReturnVoid => return Ok(Step::Exit(Exit::Return(Value::Void))),
            Op::Throw { exception } => {
                let v = frame.get(*exception)?;
                if v.as_ref()?.is_none() {
                    return Ok(Step::Exit(Exit::Throw(ExceptionKind::NullPointer, None)));
                }
                return Ok(Step::Exit(Exit::Throw(ExceptionKind::Thrown, Some(v))));
            }
        };
        frame.values[inst.index()] = Some(value);
        Ok(Step::Next)
    }
}

enum Step {
    Next,
    Jump(usize),
    Exit(Exit),
}

struct Frame<'g> {
    graph: &'g Graph,
    heap: Heap,
    values: Vec<Option<Value>>,
    escaped: Vec<Value>,
}

impl Frame<'_> {
    fn get(&self, id: InstId) -> Result<Value> {
        self.values
            .get(id.index())
            .copied()
            .flatten()
            .ok_or_else(|| Error::Execution(format!("{id} used before it was computed")))
    }

    fn deref(&self, id: InstId, user: InstId) -> Result<ObjRef> {
        self.get(id)?
            .as_ref()?
            .ok_or_else(|| Error::Execution(format!("{user} dereferences null without a check")))
    }

    fn observe(self, args: &[Value], exit: Exit) -> Observation {
        let mut snap = Snapshotter {
            heap: &self.heap,
            numbering: FxHashMap::default(),
            queue: VecDeque::new(),
        };

        let arguments = args.iter().map(|&v| snap.value(v)).collect();
        let completion = match exit {
            Exit::Return(v) => Completion::Returned(snap.value(v)),
            Exit::Throw(kind, v) => Completion::Threw(kind, v.map(|v| snap.value(v))),
            Exit::Deopt(env) => Completion::Deoptimized(env.into_iter().map(|v| snap.value(v)).collect()),
        };
        let escaped = self.escaped.iter().map(|&v| snap.value(v)).collect();
        let mut statics: Vec<(FieldId, Value)> = self
            .heap
            .statics
            .iter()
            .map(|(&f, &v)| (f, v))
            .filter(|&(_, v)| !is_default(v))
            .collect();
        statics.sort_by_key(|&(f, _)| f);
        let statics = statics.into_iter().map(|(f, v)| (f, snap.value(v))).collect();
        let objects = snap.drain();

        Observation {
            completion,
            arguments,
            escaped,
            statics,
            objects,
        }
    }
}

struct Snapshotter<'h> {
    heap: &'h Heap,
    numbering: FxHashMap<ObjRef, usize>,
    queue: VecDeque<ObjRef>,
}

impl Snapshotter<'_> {
    fn value(&mut self, value: Value) -> SnapValue {
        match value {
            Value::Int(v) => SnapValue::Int(v),
            Value::Long(v) => SnapValue::Long(v),
            Value::Float(v) => SnapValue::Float(v.to_bits()),
            Value::Double(v) => SnapValue::Double(v.to_bits()),
            Value::Void => SnapValue::Void,
            Value::Ref(None) => SnapValue::Null,
            Value::Ref(Some(r)) => {
                let next = self.numbering.len();
                let number = *self.numbering.entry(r).or_insert_with(|| {
                    self.queue.push_back(r);
                    next
                });
                SnapValue::Object(number)
            }
        }
    }

    fn drain(mut self) -> Vec<ObjectSnapshot> {
        let mut objects = Vec::new();
        let heap = self.heap;
        while let Some(r) = self.queue.pop_front() {
            let snapshot = match &heap.objects[r.0] {
                HeapObject::Instance { class, fields } => {
                    let mut sorted: Vec<(FieldId, Value)> = fields
                        .iter()
                        .map(|(&f, &v)| (f, v))
                        .filter(|&(_, v)| !is_default(v))
                        .collect();
                    sorted.sort_by_key(|&(f, _)| f);
                    ObjectSnapshot::Instance {
                        class: *class,
                        fields: sorted.into_iter().map(|(f, v)| (f, self.value(v))).collect(),
                    }
                }
                HeapObject::Array { elem, values } => ObjectSnapshot::Array {
                    elem: *elem,
                    values: values.iter().map(|&v| self.value(v)).collect(),
                },
                HeapObject::Class(class) => ObjectSnapshot::Class(*class),
            };
            objects.push(snapshot);
        }
        objects
    }
}

fn is_default(value: Value) -> bool {
    match value {
        Value::Int(v) => v == 0,
        Value::Long(v) => v == 0,
        Value::Float(v) => v.to_bits() == 0,
        Value::Double(v) => v.to_bits() == 0,
        Value::Ref(r) => r.is_none(),
        Value::Void => true,
    }
}

/// Evaluates a binary op; `None` signals integral division by zero.
fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Option<Value>> {
    let value = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Value::Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Ok(None),
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem => a.wrapping_rem(b),
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => a.wrapping_shl(b as u32 & 31),
            BinaryOp::Shr => a.wrapping_shr(b as u32 & 31),
            BinaryOp::UShr => ((a as u32) >> (b as u32 & 31)) as i32,
        }),
        (Value::Long(a), Value::Int(b))
            if matches!(op, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr) =>
        {
            Value::Long(match op {
                BinaryOp::Shl => a.wrapping_shl(b as u32 & 63),
                BinaryOp::Shr => a.wrapping_shr(b as u32 & 63),
                _ => ((a as u64) >> (b as u32 & 63)) as i64,
            })
        }
        (Value::Long(a), Value::Long(b)) => Value::Long(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Ok(None),
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem => a.wrapping_rem(b),
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => a.wrapping_shl(b as u32 & 63),
            BinaryOp::Shr => a.wrapping_shr(b as u32 & 63),
            BinaryOp::UShr => ((a as u64) >> (b as u32 & 63)) as i64,
        }),
        (Value::Float(a), Value::Float(b)) => Value::Float(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            _ => return Err(Error::Execution(format!("{op} on float"))),
        }),
        (Value::Double(a), Value::Double(b)) => Value::Double(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            _ => return Err(Error::Execution(format!("{op} on double"))),
        }),
        (a, b) => return Err(Error::Execution(format!("{op} on {a:?} and {b:?}"))),
    };
    Ok(Some(value))
}

fn unary(op: UnaryOp, input: Value) -> Result<Value> {
    Ok(match (op, input) {
        (UnaryOp::Neg, Value::Int(v)) => Value::Int(v.wrapping_neg()),
        (UnaryOp::Neg, Value::Long(v)) => Value::Long(v.wrapping_neg()),
        (UnaryOp::Neg, Value::Float(v)) => Value::Float(-v),
        (UnaryOp::Neg, Value::Double(v)) => Value::Double(-v),
        (UnaryOp::Not, Value::Int(v)) => Value::Int(!v),
        (UnaryOp::Not, Value::Long(v)) => Value::Long(!v),
        (op, v) => return Err(Error::Execution(format!("{op} on {v:?}"))),
    })
}

fn compare(cond: Condition, lhs: Value, rhs: Value) -> Result<bool> {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(&b)),
        (Value::Long(a), Value::Long(b)) => Some(a.cmp(&b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(&b),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(&b),
        (Value::Ref(a), Value::Ref(b)) => {
            return match cond {
                Condition::Equal => Ok(a == b),
                Condition::NotEqual => Ok(a != b),
                _ => Err(Error::Execution(format!("{cond} on references"))),
            };
        }
        (a, b) => return Err(Error::Execution(format!("{cond} on {a:?} and {b:?}"))),
    };
    // Unordered (NaN) comparisons are false except `!=`.
    let Some(ordering) = ordering else {
        return Ok(cond == Condition::NotEqual);
    };
    Ok(match cond {
        Condition::Equal => ordering == Ordering::Equal,
        Condition::NotEqual => ordering != Ordering::Equal,
        Condition::LessThan => ordering == Ordering::Less,
        Condition::LessThanOrEqual => ordering != Ordering::Greater,
        Condition::GreaterThan => ordering == Ordering::Greater,
        Condition::GreaterThanOrEqual => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    #[test]
    fn loop_sums_to_ten() {
        // for (i = 0, s = 0; i < 5; i++) s += i;  return s;
        let graph = GraphBuilder::new("int Main.sum()")
            .build(|f| {
                f.block(0, |b| b.goto(1));
                let (i, s) = f.block(1, |b| {
                    let i = b.phi(DataType::Int32);
                    let s = b.phi(DataType::Int32);
                    let five = b.int(5);
                    let cond = b.compare(Condition::LessThan, i, five);
                    b.branch(cond, 2, 3);
                    (i, s)
                });
                let (i2, s2) = f.block(2, |b| {
                    let one = b.int(1);
                    let s2 = b.add(s, i);
                    let i2 = b.add(i, one);
                    b.goto(1);
                    (i2, s2)
                });
                f.block(3, |b| b.ret(s));
                let zero = f.graph().int_constant(0);
                f.set_phi_inputs(i, &[(0, zero), (2, i2)]);
                f.set_phi_inputs(s, &[(0, zero), (2, s2)]);
            })
            .unwrap();
        let observation = Interpreter::new().run(&graph, &[]).unwrap();
        assert_eq!(observation.completion, Completion::Returned(SnapValue::Int(10)));
    }

    #[test]
    fn byte_field_truncates() {
        let graph = GraphBuilder::new("int Main.f(TestClass)")
            .build(|f| {
                let class = f.class("TestClass", None);
                let b8 = f.field(class, "b", DataType::Int8);
                let obj = f.param_of(class);
                f.block(0, |b| {
                    let v = b.int(300);
                    b.set_field(obj, b8, v);
                    let load = b.get_field(obj, b8);
                    b.ret(load);
                });
            })
            .unwrap();
        let mut heap = Heap::new();
        let obj = heap.alloc_instance(ClassId::new(0));
        let observation = Interpreter::new()
            .run_with_heap(&graph, &[Value::Ref(Some(obj))], heap)
            .unwrap();
        assert_eq!(observation.completion, Completion::Returned(SnapValue::Int(44)));
        assert_eq!(
            observation.objects,
            vec![ObjectSnapshot::Instance {
                class: ClassId::new(0),
                fields: vec![(FieldId::new(0), SnapValue::Int(44))],
            }]
        );
    }

    #[test]
    fn null_check_throws_and_step_limit_stops_loops() {
        let graph = GraphBuilder::new("void Main.f(Object)")
            .build(|f| {
                let class = f.class("Object", None);
                let obj = f.param_of(class);
                f.block(0, |b| {
                    b.null_check(obj);
                    b.ret_void();
                });
            })
            .unwrap();
        let observation = Interpreter::new().run(&graph, &[Value::Ref(None)]).unwrap();
        assert_eq!(
            observation.completion,
            Completion::Threw(ExceptionKind::NullPointer, None)
        );

        let spin = GraphBuilder::new("void Main.spin()")
            .build(|f| {
                f.block(0, |b| b.goto(1));
                f.block(1, |b| b.goto(1));
            })
            .unwrap();
        assert!(matches!(
            Interpreter::new().with_step_limit(50).run(&spin, &[]),
            Err(Error::StepLimit(50))
        ));
    }

    #[test]
    fn handlers_see_and_mutate_the_heap() {
        let graph = GraphBuilder::new("int Main.f()")
            .build(|f| {
                let class = f.class("TestClass", None);
                let i = f.field(class, "i", DataType::Int32);
                f.block(0, |b| {
                    let obj = b.new_instance(class);
                    b.invoke("Main.$noinline$poke", &[obj], DataType::Void);
                    let load = b.get_field(obj, i);
                    b.ret(load);
                });
            })
            .unwrap();
        let interpreter = Interpreter::new().with_handler("Main.$noinline$poke", |heap, args| {
            if let Value::Ref(Some(r)) = args[0] {
                heap.set_field(r, FieldId::new(0), DataType::Int32, Value::Int(7));
            }
            Ok(Value::Void)
        });
        let observation = interpreter.run(&graph, &[]).unwrap();
        assert_eq!(observation.completion, Completion::Returned(SnapValue::Int(7)));
        assert_eq!(observation.escaped, vec![SnapValue::Object(0)]);
    }
}
