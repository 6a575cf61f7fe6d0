//! The execution machine: an iterative AST walker with an explicit work
//! stack, operand stack, and call frames.
//!
//! Making every evaluation step explicit buys two properties at once:
//! deeply nested programs cannot overflow the native stack, and suspension
//! for external reads is simply "stop stepping", because all state already
//! lives in the machine. Resuming pushes the host's value onto the operand
//! stack and continues.

use ahash::AHashMap;
use std::time::Instant;

use crate::{
    ast::{Ast, Literal, NodeId, NodeKind, flags},
    builtins::{self, Builtin},
    command::{Command, CommandRecord, CommandSink},
    error::{ErrorKind, RunError, RunResult},
    library::{self, LibraryObject, MethodKind},
    platform::PlatformProfile,
    resource::{ResourceLimits, ResourceUsage},
    scope::{Scopes, VarId, Variable},
    value::{self, ArrayValue, BaseType, IntType, IntWidth, LibraryHandle, PointerTarget, PointerValue, StructValue, TypeDesc, Value},
};

/// What `Vm::run` stopped on.
#[derive(Debug)]
pub(crate) enum VmOutcome {
    /// Work stack empty: the program (or phase list) is finished.
    Done,
    /// An external read was issued; the machine is frozen awaiting a value.
    Suspended(Suspend),
    /// Step budget for this tick was exhausted.
    BudgetExhausted,
    /// Unrecoverable error; the run must terminate.
    Fatal(RunError),
}

/// Details of an issued external-read request.
#[derive(Debug, Clone)]
pub(crate) struct Suspend {
    pub request_id: String,
    /// Documented fallback substituted if the host never responds.
    pub fallback: Value,
}

/// Lifecycle steps seeded by the interpreter driver.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Phase {
    SetupStart,
    CallSetup,
    SetupEnd,
    LoopIteration(u32),
    LoopEnd(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    While,
    DoWhile,
    For,
    RangeFor,
    Switch,
}

#[derive(Debug)]
struct LoopCtx {
    kind: LoopKind,
    node: NodeId,
    /// Stack watermarks recorded before the loop pushed its own steps.
    work_len: usize,
    value_len: usize,
    scope_depth: usize,
    frame_len: usize,
    /// Range-for element cursor.
    range_index: usize,
}

#[derive(Debug)]
struct Frame {
    func: NodeId,
    work_len: usize,
    value_len: usize,
    scope_depth: usize,
    loop_len: usize,
}

/// Where a call's callee comes from.
#[derive(Debug, Clone)]
enum CallTarget {
    /// Plain `name(...)`: user function, builtin, or library constructor.
    Name(String),
    /// `object.method(...)`: object value is beneath the args.
    Method { method: String },
    /// `Class::method(...)` static call.
    Static { class: String, method: String },
    /// Callee evaluated to a value (function pointers).
    Value,
}

/// One unit of work. Steps are pushed in reverse execution order.
#[derive(Debug, Clone)]
enum Step {
    Exec(NodeId),
    Eval(NodeId),
    PushValue(Value),
    Discard,
    BoolCoerce,
    BinaryApply(NodeId),
    LogicalRhs(NodeId),
    UnaryApply(NodeId),
    TernaryDecide(NodeId),
    AssignApply(NodeId),
    IncDecApply {
        node: NodeId,
        postfix: bool,
    },
    AddrApply(NodeId),
    DerefApply(NodeId),
    SubscriptApply(NodeId),
    MemberApply(NodeId),
    ArrowApply(NodeId),
    CastApply(NodeId),
    SizeofValApply,
    TypeofApply,
    InitListApply(NodeId),
    CallInvoke {
        node: NodeId,
        argc: usize,
        target: CallTarget,
    },
    StoreVar {
        decl: NodeId,
        has_init: bool,
    },
    IfDecide(NodeId),
    WhileDecide(NodeId),
    DoWhileDecide(NodeId),
    ForDecide(NodeId),
    RangeForBegin(NodeId),
    RangeForNext(NodeId),
    SwitchDispatch(NodeId),
    ReturnApply {
        has_value: bool,
    },
    FrameEnd,
    PopScope,
    /// Closes a switch context after its statements finish without a break.
    PopLoop,
    Lifecycle(Phase),
}

/// A resolved storage location.
#[derive(Debug, Clone)]
enum PlacePath {
    Index(usize),
    Field(String),
}

#[derive(Debug, Clone)]
struct Place {
    var: VarId,
    path: Vec<PlacePath>,
}

pub(crate) struct Vm {
    ast: Ast,
    profile: &'static PlatformProfile,
    debug: bool,
    max_loop_iterations: u32,
    limits: ResourceLimits,
    usage: ResourceUsage,
    start: Instant,

    scopes: Scopes,
    objects: Vec<LibraryObject>,
    functions: AHashMap<String, NodeId>,
    structs: AHashMap<String, Vec<(String, TypeDesc, Vec<u32>)>>,
    typedefs: AHashMap<String, String>,

    work: Vec<Step>,
    values: Vec<Value>,
    frames: Vec<Frame>,
    loops: Vec<LoopCtx>,

    rng: u64,
    request_counter: u64,
    terminated: bool,
    /// Set when a fatal error already ended the run.
    failed: bool,
}

impl Vm {
    pub(crate) fn new(
        ast: Ast,
        profile: &'static PlatformProfile,
        libraries: &[String],
        limits: ResourceLimits,
        max_loop_iterations: u32,
        debug: bool,
    ) -> Self {
        let mut vm = Self {
            ast,
            profile,
            debug,
            max_loop_iterations,
            limits,
            usage: ResourceUsage::default(),
            start: Instant::now(),
            scopes: Scopes::new(),
            objects: Vec::new(),
            functions: AHashMap::new(),
            structs: AHashMap::new(),
            typedefs: AHashMap::new(),
            work: Vec::new(),
            values: Vec::new(),
            frames: Vec::new(),
            loops: Vec::new(),
            rng: 0x9E37_79B9_7F4A_7C15,
            request_counter: 0,
            terminated: false,
            failed: false,
        };
        vm.collect_declarations(libraries);
        vm
    }

    #[must_use]
    pub(crate) fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    #[must_use]
    pub(crate) fn command_count(&self) -> usize {
        self.usage.command_count()
    }

    /// Seeds the program lifecycle: global initializers in declaration
    /// order, then setup, then the loop phases. `PROGRAM_START` and
    /// `VERSION_INFO` are emitted by the driver before this runs.
    pub(crate) fn seed_lifecycle(&mut self) {
        // Pushed in reverse execution order.
        self.work.push(Step::Lifecycle(Phase::LoopIteration(0)));
        self.work.push(Step::Lifecycle(Phase::SetupEnd));
        self.work.push(Step::Lifecycle(Phase::CallSetup));
        self.work.push(Step::Lifecycle(Phase::SetupStart));
        let globals: Vec<NodeId> = self
            .ast
            .children(self.ast.root())
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    self.ast.kind(*id),
                    NodeKind::VarDecl | NodeKind::FunctionPtrDecl
                )
            })
            .collect();
        for decl in globals.into_iter().rev() {
            self.work.push(Step::Exec(decl));
        }
    }

    /// First pass over the program: bind functions, struct layouts, enum
    /// constants, typedefs, and library singletons.
    fn collect_declarations(&mut self, libraries: &[String]) {
        for singleton in ["Serial", "Serial1", "Serial2", "Serial3", "Wire", "SPI", "EEPROM"] {
            let known = singleton == "Serial" || libraries.iter().any(|l| l == singleton);
            let serial_port = matches!(singleton, "Serial1" | "Serial2" | "Serial3");
            if known || serial_port {
                let handle = LibraryHandle(self.objects.len() as u32);
                self.objects.push(LibraryObject::new(singleton, Vec::new()));
                self.scopes.declare(
                    singleton,
                    Variable {
                        value: Value::Library(handle),
                        ty: TypeDesc::parse(singleton, self.profile.int_bytes),
                        is_const: true,
                        dims: Vec::new(),
                        alias: None,
                        name: singleton.to_owned(),
                    },
                );
            }
        }

        let children: Vec<NodeId> = self.ast.children(self.ast.root()).to_vec();
        for id in children {
            match self.ast.kind(id) {
                NodeKind::FuncDef => {
                    if let Some(name) = self.ast.name(id) {
                        self.functions.insert(name.to_owned(), id);
                    }
                }
                NodeKind::StructDecl | NodeKind::UnionDecl => {
                    let name = self.ast.name(id).unwrap_or_default().to_owned();
                    let mut members = Vec::new();
                    for member in self.ast.children(id) {
                        if self.ast.kind(*member) != NodeKind::VarDecl {
                            continue;
                        }
                        let mname = self.ast.name(*member).unwrap_or_default().to_owned();
                        let ty = self.decl_type(*member);
                        let dims = self.static_dims(*member);
                        members.push((mname, ty, dims));
                    }
                    self.structs.insert(name, members);
                }
                NodeKind::EnumDecl => {
                    let mut next = 0i64;
                    let constants: Vec<NodeId> = self.ast.children(id).to_vec();
                    for constant in constants {
                        if let Some(value_node) = self.ast.child(constant, 0)
                            && let Some(v) = self.const_expr_value(value_node)
                        {
                            next = v;
                        }
                        let cname = self.ast.name(constant).unwrap_or_default().to_owned();
                        self.scopes.declare(
                            &cname,
                            Variable {
                                value: Value::int(next),
                                ty: TypeDesc::parse("int", self.profile.int_bytes),
                                is_const: true,
                                dims: Vec::new(),
                                alias: None,
                                name: cname.clone(),
                            },
                        );
                        next += 1;
                    }
                }
                NodeKind::TypedefDecl => {
                    if let (Some(alias), Some(ty)) = (self.ast.name(id), self.ast.child(id, 0)) {
                        let target = self.ast.name(ty).unwrap_or("int").to_owned();
                        self.typedefs.insert(alias.to_owned(), target);
                    }
                }
                _ => {}
            }
        }
    }

    /// Resolves typedef aliases down to a concrete type descriptor.
    fn resolve_type(&self, name: &str) -> TypeDesc {
        let mut current = name.to_owned();
        for _ in 0..16 {
            // Split pointer suffixes so `ulong*` resolves through `ulong`.
            let stars = current.chars().rev().take_while(|c| *c == '*').count();
            let base = current[..current.len() - stars].trim_end().to_owned();
            match self.typedefs.get(&base) {
                Some(target) => {
                    let mut next = target.clone();
                    for _ in 0..stars {
                        next.push('*');
                    }
                    current = next;
                }
                None => break,
            }
        }
        TypeDesc::parse(&current, self.profile.int_bytes)
    }

    fn decl_type(&self, decl: NodeId) -> TypeDesc {
        let name = self
            .ast
            .child(decl, 0)
            .and_then(|ty| self.ast.name(ty))
            .unwrap_or("int")
            .to_owned();
        let mut ty = self.resolve_type(&name);
        if self.ast.node(decl).flags & flags::REFERENCE != 0 {
            ty.reference = true;
        }
        ty
    }

    /// Array dimensions whose sizes are compile-time constants.
    fn static_dims(&self, decl: NodeId) -> Vec<u32> {
        let mut dims = Vec::new();
        for child in self.ast.children(decl) {
            if self.ast.kind(*child) == NodeKind::ArraySize {
                let size = self
                    .ast
                    .child(*child, 0)
                    .and_then(|e| self.const_expr_value(e))
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(0);
                dims.push(size);
            }
        }
        dims
    }

    /// Tiny constant evaluator for array sizes, case labels, and enum
    /// values: literals, const variables, and unary minus.
    fn const_expr_value(&self, node: NodeId) -> Option<i64> {
        match self.ast.kind(node) {
            NodeKind::IntLiteral => match self.ast.node(node).value {
                Some(Literal::Int { value, .. }) => Some(value),
                _ => None,
            },
            NodeKind::CharLiteral | NodeKind::WideCharLiteral => match self.ast.node(node).value {
                Some(Literal::Char(code)) => Some(i64::from(code)),
                _ => None,
            },
            NodeKind::BoolLiteral => match self.ast.node(node).value {
                Some(Literal::Bool(b)) => Some(i64::from(b)),
                _ => None,
            },
            NodeKind::UnaryExpr if self.ast.name(node) == Some("-") => {
                self.const_expr_value(self.ast.child(node, 0)?).map(i64::wrapping_neg)
            }
            NodeKind::Identifier => {
                let name = self.ast.name(node)?;
                let id = self.scopes.lookup(name)?;
                self.scopes.read(id).as_i64().ok()
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Command emission
    // ------------------------------------------------------------------

    fn emit(&mut self, sink: &mut dyn CommandSink, command: Command) -> RunResult<()> {
        self.usage.on_command(&self.limits)?;
        let record = CommandRecord {
            command,
            timestamp: self.now_ms(),
        };
        sink.emit(&record);
        Ok(())
    }

    pub(crate) fn emit_unchecked(&mut self, sink: &mut dyn CommandSink, command: Command) {
        let _ = self.emit(sink, command);
    }

    fn report(&mut self, sink: &mut dyn CommandSink, error: &RunError) {
        self.emit_unchecked(
            sink,
            Command::Error {
                kind: error.kind.to_string(),
                message: error.message.clone(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Runs up to `budget` steps. Recoverable errors emit `ERROR` and
    /// substitute a zero value; fatal errors end the run.
    pub(crate) fn run(&mut self, sink: &mut dyn CommandSink, budget: usize) -> VmOutcome {
        if self.failed {
            return VmOutcome::Done;
        }
        for _ in 0..budget {
            let Some(step) = self.work.pop() else {
                return VmOutcome::Done;
            };
            let recovery = Self::recovery_value(&step);
            match self.step(sink, step) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Suspend(suspend)) => return VmOutcome::Suspended(suspend),
                Err(error) if error.is_fatal() => {
                    self.failed = true;
                    self.report(sink, &error);
                    return VmOutcome::Fatal(error);
                }
                Err(error) => {
                    self.report(sink, &error);
                    if let Some(value) = recovery {
                        self.values.push(value);
                    }
                }
            }
        }
        if self.work.is_empty() {
            VmOutcome::Done
        } else {
            VmOutcome::BudgetExhausted
        }
    }

    /// The zero/undefined substitution for a failed value-producing step.
    fn recovery_value(step: &Step) -> Option<Value> {
        match step {
            Step::Eval(_)
            | Step::BinaryApply(_)
            | Step::UnaryApply(_)
            | Step::TernaryDecide(_)
            | Step::AssignApply(_)
            | Step::IncDecApply { .. }
            | Step::AddrApply(_)
            | Step::DerefApply(_)
            | Step::SubscriptApply(_)
            | Step::MemberApply(_)
            | Step::ArrowApply(_)
            | Step::CastApply(_)
            | Step::SizeofValApply
            | Step::TypeofApply
            | Step::InitListApply(_)
            | Step::CallInvoke { .. } => Some(Value::int(0)),
            Step::LogicalRhs(_) | Step::BoolCoerce => Some(Value::Bool(false)),
            // Return conversion failures still owe the caller a value; the
            // frame was already unwound.
            Step::ReturnApply { .. } | Step::FrameEnd => Some(Value::int(0)),
            _ => None,
        }
    }

    fn pop_value(&mut self) -> Value {
        self.values.pop().expect("operand stack underflow is a machine bug")
    }

    fn pop_args(&mut self, argc: usize) -> Vec<Value> {
        let at = self.values.len() - argc;
        self.values.split_off(at)
    }

    fn step(&mut self, sink: &mut dyn CommandSink, step: Step) -> RunResult<Flow> {
        match step {
            Step::Exec(node) => self.exec(sink, node),
            Step::Eval(node) => self.eval(sink, node),
            Step::PushValue(value) => {
                self.values.push(value);
                Ok(Flow::Continue)
            }
            Step::Discard => {
                self.pop_value();
                Ok(Flow::Continue)
            }
            Step::BoolCoerce => {
                let v = self.pop_value();
                let truth = v.truthy()?;
                self.values.push(Value::Bool(truth));
                Ok(Flow::Continue)
            }
            Step::BinaryApply(node) => {
                let rhs = self.pop_value();
                let lhs = self.pop_value();
                let op = self.ast.name(node).unwrap_or("+").to_owned();
                let result = value::binary_op(&op, &lhs, &rhs)?;
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Step::LogicalRhs(node) => {
                let lhs = self.pop_value();
                let truth = lhs.truthy()?;
                let op = self.ast.name(node).unwrap_or("&&");
                let short_circuit = (op == "&&" && !truth) || (op == "||" && truth);
                if short_circuit {
                    self.values.push(Value::Bool(truth));
                } else {
                    let rhs = self.ast.children(node)[1];
                    self.work.push(Step::BoolCoerce);
                    self.work.push(Step::Eval(rhs));
                }
                Ok(Flow::Continue)
            }
            Step::UnaryApply(node) => {
                let operand = self.pop_value();
                let op = self.ast.name(node).unwrap_or("-").to_owned();
                let result = value::unary_op(&op, &operand)?;
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Step::TernaryDecide(node) => {
                let cond = self.pop_value();
                let branch = if cond.truthy()? {
                    self.ast.children(node)[1]
                } else {
                    self.ast.children(node)[2]
                };
                self.work.push(Step::Eval(branch));
                Ok(Flow::Continue)
            }
            Step::AssignApply(node) => self.assign_apply(sink, node),
            Step::IncDecApply { node, postfix } => self.inc_dec_apply(sink, node, postfix),
            Step::AddrApply(node) => self.addr_apply(node),
            Step::DerefApply(_node) => {
                let pointer = self.pop_value();
                let place = self.pointer_place(&pointer)?;
                let result = self.read_place(&place)?;
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Step::SubscriptApply(_node) => {
                let index = self.pop_value();
                let base = self.pop_value();
                let result = self.subscript_value(&base, &index)?;
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Step::MemberApply(node) => {
                let base = self.pop_value();
                let member = self.ast.name(node).unwrap_or_default().to_owned();
                let result = self.member_value(&base, &member)?;
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Step::ArrowApply(node) => {
                let pointer = self.pop_value();
                let member = self.ast.name(node).unwrap_or_default().to_owned();
                let place = self.pointer_place(&pointer)?;
                let base = self.read_place(&place)?;
                let result = self.member_value(&base, &member)?;
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Step::CastApply(node) => {
                let operand = self.pop_value();
                let ty_name = self
                    .ast
                    .child(node, 0)
                    .and_then(|ty| self.ast.name(ty))
                    .unwrap_or("int")
                    .to_owned();
                let ty = self.resolve_type(&ty_name);
                let result = value::convert(operand, &ty)?;
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Step::SizeofValApply => {
                let operand = self.pop_value();
                let size = self.sizeof_value(&operand);
                self.values
                    .push(Value::typed_int(i64::from(size), IntType::U32));
                Ok(Flow::Continue)
            }
            Step::TypeofApply => {
                let operand = self.pop_value();
                self.values.push(Value::Str(operand.type_label()));
                Ok(Flow::Continue)
            }
            Step::InitListApply(node) => {
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                let mut items = self.pop_args(children.len());
                let designated = children
                    .iter()
                    .all(|c| self.ast.kind(*c) == NodeKind::DesignatedInit);
                if designated && !children.is_empty() {
                    let mut fields = indexmap::IndexMap::new();
                    for (child, item) in children.iter().zip(items.drain(..)) {
                        let field = self.ast.name(*child).unwrap_or_default().to_owned();
                        fields.insert(field, item);
                    }
                    self.values.push(Value::Struct(StructValue {
                        type_name: String::new(),
                        fields,
                    }));
                } else {
                    self.values.push(Value::Array(ArrayValue {
                        elem: TypeDesc::parse("auto", self.profile.int_bytes),
                        data: items,
                    }));
                }
                Ok(Flow::Continue)
            }
            Step::CallInvoke { node, argc, target } => self.call_invoke(sink, node, argc, target),
            Step::StoreVar { decl, has_init } => self.store_var(sink, decl, has_init),
            Step::IfDecide(node) => {
                let cond = self.pop_value();
                let truth = self.truthy_reported(sink, cond);
                if self.debug {
                    self.emit_unchecked(sink, Command::IfStatement { condition: truth });
                }
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                if truth {
                    self.work.push(Step::Exec(children[1]));
                } else if let Some(else_branch) = children.get(2) {
                    self.work.push(Step::Exec(*else_branch));
                }
                Ok(Flow::Continue)
            }
            Step::WhileDecide(node) => {
                let cond = self.pop_value();
                let truth = self.truthy_reported(sink, cond);
                if truth {
                    let body = self.ast.children(node)[1];
                    if self.debug {
                        let iteration = self.loops.last().map_or(0, |c| c.range_index as u32);
                        self.emit_unchecked(sink, Command::WhileLoop { iteration });
                    }
                    if let Some(ctx) = self.loops.last_mut() {
                        ctx.range_index += 1;
                    }
                    self.work.push(Step::WhileDecide(node));
                    self.work.push(Step::Eval(self.ast.children(node)[0]));
                    self.work.push(Step::Exec(body));
                } else {
                    self.finish_loop();
                }
                Ok(Flow::Continue)
            }
            Step::DoWhileDecide(node) => {
                let cond = self.pop_value();
                let truth = self.truthy_reported(sink, cond);
                if truth {
                    let children: Vec<NodeId> = self.ast.children(node).to_vec();
                    self.work.push(Step::DoWhileDecide(node));
                    self.work.push(Step::Eval(children[1]));
                    self.work.push(Step::Exec(children[0]));
                } else {
                    self.finish_loop();
                }
                Ok(Flow::Continue)
            }
            Step::ForDecide(node) => {
                let cond = self.pop_value();
                let truth = self.truthy_reported(sink, cond);
                if truth {
                    if self.debug {
                        let iteration = self.loops.last().map_or(0, |c| c.range_index as u32);
                        self.emit_unchecked(sink, Command::ForLoop { iteration });
                    }
                    if let Some(ctx) = self.loops.last_mut() {
                        ctx.range_index += 1;
                    }
                    self.push_for_round(node, true);
                } else {
                    self.finish_loop();
                }
                Ok(Flow::Continue)
            }
            Step::RangeForBegin(node) => {
                // The iterable value stays on the operand stack for the
                // loop's lifetime; RangeForNext indexes into it.
                let decl = self.ast.children(node)[0];
                let ty = self.decl_type(decl);
                let name = self.ast.name(decl).unwrap_or_default().to_owned();
                self.scopes.declare(
                    &name,
                    Variable {
                        value: ty.default_value(),
                        ty,
                        is_const: false,
                        dims: Vec::new(),
                        alias: None,
                        name: name.clone(),
                    },
                );
                self.work.push(Step::RangeForNext(node));
                Ok(Flow::Continue)
            }
            Step::RangeForNext(node) => self.range_for_next(node),
            Step::SwitchDispatch(node) => self.switch_dispatch(sink, node),
            Step::ReturnApply { has_value } => {
                let result = if has_value { self.pop_value() } else { Value::Void };
                self.unwind_return(result)
            }
            Step::FrameEnd => {
                // Implicit return at the end of a void body.
                self.unwind_return(Value::Void)
            }
            Step::PopScope => {
                self.scopes.pop();
                Ok(Flow::Continue)
            }
            Step::PopLoop => {
                self.loops.pop();
                Ok(Flow::Continue)
            }
            Step::Lifecycle(phase) => self.lifecycle(sink, phase),
        }
    }

    /// Truthiness with local error reporting: a bad condition reads as
    /// false rather than corrupting loop bookkeeping.
    fn truthy_reported(&mut self, sink: &mut dyn CommandSink, value: Value) -> bool {
        match value.truthy() {
            Ok(truth) => truth,
            Err(error) => {
                self.report(sink, &error);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn exec(&mut self, sink: &mut dyn CommandSink, node: NodeId) -> RunResult<Flow> {
        match self.ast.kind(node) {
            NodeKind::CompoundStmt => {
                self.scopes.push(false);
                self.work.push(Step::PopScope);
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                for child in children.into_iter().rev() {
                    self.work.push(Step::Exec(child));
                }
                Ok(Flow::Continue)
            }
            NodeKind::ExpressionStmt => {
                if let Some(expr) = self.ast.child(node, 0) {
                    self.work.push(Step::Discard);
                    self.work.push(Step::Eval(expr));
                }
                Ok(Flow::Continue)
            }
            NodeKind::EmptyStmt | NodeKind::ErrorStmt | NodeKind::CaseLabel | NodeKind::DefaultLabel => {
                Ok(Flow::Continue)
            }
            NodeKind::VarDecl | NodeKind::FunctionPtrDecl => self.exec_var_decl(node),
            NodeKind::IfStmt => {
                self.work.push(Step::IfDecide(node));
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::WhileStmt => {
                self.push_loop(LoopKind::While, node);
                self.work.push(Step::WhileDecide(node));
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::DoWhileStmt => {
                self.push_loop(LoopKind::DoWhile, node);
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                self.work.push(Step::DoWhileDecide(node));
                self.work.push(Step::Eval(children[1]));
                self.work.push(Step::Exec(children[0]));
                Ok(Flow::Continue)
            }
            NodeKind::ForStmt => {
                // The for header introduces its own scope for the init
                // declaration. The loop context records the depth *before*
                // that scope so loop exit tears it down.
                self.push_loop(LoopKind::For, node);
                self.scopes.push(false);
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                self.work.push(Step::ForDecide(node));
                if self.ast.kind(children[1]) == NodeKind::EmptyStmt {
                    self.work.push(Step::PushValue(Value::Bool(true)));
                } else {
                    self.work.push(Step::Eval(children[1]));
                }
                self.work.push(Step::Exec(children[0]));
                Ok(Flow::Continue)
            }
            NodeKind::RangeForStmt => {
                self.push_loop(LoopKind::RangeFor, node);
                self.scopes.push(false);
                self.work.push(Step::RangeForBegin(node));
                self.work.push(Step::Eval(self.ast.children(node)[1]));
                Ok(Flow::Continue)
            }
            NodeKind::SwitchStmt => {
                self.push_loop(LoopKind::Switch, node);
                self.work.push(Step::SwitchDispatch(node));
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::BreakStmt => {
                self.do_break()?;
                Ok(Flow::Continue)
            }
            NodeKind::ContinueStmt => {
                self.do_continue()?;
                Ok(Flow::Continue)
            }
            NodeKind::ReturnStmt => {
                match self.ast.child(node, 0) {
                    Some(expr) => {
                        self.work.push(Step::ReturnApply { has_value: true });
                        self.work.push(Step::Eval(expr));
                    }
                    None => {
                        self.work.push(Step::ReturnApply { has_value: false });
                    }
                }
                Ok(Flow::Continue)
            }
            // Type declarations were collected before execution.
            NodeKind::StructDecl | NodeKind::UnionDecl | NodeKind::EnumDecl | NodeKind::TypedefDecl
            | NodeKind::FuncDecl | NodeKind::FuncDef => Ok(Flow::Continue),
            // An expression in statement position (defensive).
            _ => {
                self.work.push(Step::Discard);
                self.work.push(Step::Eval(node));
                Ok(Flow::Continue)
            }
        }
    }

    fn exec_var_decl(&mut self, decl: NodeId) -> RunResult<Flow> {
        let node_flags = self.ast.node(decl).flags;
        let name = self.ast.name(decl).unwrap_or_default().to_owned();

        // Static locals: on re-entry, rebind the surviving slot.
        if node_flags & flags::STATIC != 0
            && let Some(frame) = self.frames.last()
            && let Some(slot) = self.scopes.static_slot(frame.func, decl)
        {
            self.scopes.bind(&name, slot);
            return Ok(Flow::Continue);
        }

        // References alias their initializer's storage and cannot rebind.
        if node_flags & flags::REFERENCE != 0 {
            let init = self.ast.children(decl).iter().copied().find(|c| {
                !matches!(self.ast.kind(*c), NodeKind::TypeName | NodeKind::ArraySize)
            });
            let Some(init) = init else {
                return Err(RunError::type_error(format!(
                    "reference `{name}` requires an initializer"
                )));
            };
            if self.ast.kind(init) != NodeKind::Identifier {
                return Err(RunError::type_error(format!(
                    "reference `{name}` must bind to a variable"
                )));
            }
            let target_name = self.ast.name(init).unwrap_or_default();
            let target = self.scopes.lookup(target_name).ok_or_else(|| {
                RunError::type_error(format!("unknown variable `{target_name}`"))
            })?;
            let ty = self.decl_type(decl);
            let mut variable = Variable {
                value: Value::Void,
                ty,
                is_const: node_flags & flags::CONST != 0,
                dims: Vec::new(),
                alias: Some(target),
                name: name.clone(),
            };
            variable.value = self.scopes.read(target);
            self.scopes.declare(&name, variable);
            return Ok(Flow::Continue);
        }

        let init = self.ast.children(decl).iter().copied().find(|c| {
            !matches!(self.ast.kind(*c), NodeKind::TypeName | NodeKind::ArraySize | NodeKind::ParamList)
        });
        match init {
            Some(init) => {
                self.work.push(Step::StoreVar { decl, has_init: true });
                if self.ast.kind(init) == NodeKind::CtorInit {
                    // Constructor-style initialization of a library object.
                    let args: Vec<NodeId> = self.ast.children(init).to_vec();
                    let argc = args.len();
                    let class = self
                        .ast
                        .child(decl, 0)
                        .and_then(|t| self.ast.name(t))
                        .unwrap_or_default()
                        .to_owned();
                    self.work.push(Step::CallInvoke {
                        node: init,
                        argc,
                        target: CallTarget::Name(class),
                    });
                    for arg in args.into_iter().rev() {
                        self.work.push(Step::Eval(arg));
                    }
                } else {
                    self.work.push(Step::Eval(init));
                }
            }
            None => {
                self.work.push(Step::StoreVar { decl, has_init: false });
            }
        }
        Ok(Flow::Continue)
    }

    fn store_var(&mut self, sink: &mut dyn CommandSink, decl: NodeId, has_init: bool) -> RunResult<Flow> {
        let node_flags = self.ast.node(decl).flags;
        let name = self.ast.name(decl).unwrap_or_default().to_owned();
        let ty = self.decl_type(decl);
        let dims = self.runtime_dims(decl)?;

        let raw = if has_init { self.pop_value() } else { Value::Void };

        // Declaring a library class without constructor arguments still
        // instantiates an object: `Servo s;`.
        let library_default = if !has_init && dims.is_empty() && ty.pointer == 0 {
            match &ty.base {
                BaseType::Named(class) if library::library(class).is_some() => {
                    let handle = LibraryHandle(self.objects.len() as u32);
                    self.objects.push(LibraryObject::new(class, Vec::new()));
                    Some(Value::Library(handle))
                }
                _ => None,
            }
        } else {
            None
        };

        let value = match library_default {
            Some(value) => value,
            None => match self.build_initial_value(&ty, &dims, raw, has_init) {
                Ok(value) => value,
                Err(error) => {
                    self.report(sink, &error);
                    if dims.is_empty() {
                        ty.default_value()
                    } else {
                        value::zero_array(&ty, &dims)
                    }
                }
            },
        };

        self.usage.on_allocate(&self.limits, value.estimate_bytes())?;

        // Library constructor declarations may produce a handle directly.
        let variable = Variable {
            value: value.clone(),
            ty,
            is_const: node_flags & flags::CONST != 0,
            dims: dims.clone(),
            alias: None,
            name: name.clone(),
        };
        let id = self.scopes.declare(&name, variable);

        if node_flags & flags::STATIC != 0
            && let Some(frame) = self.frames.last()
        {
            let func = frame.func;
            self.scopes.bind_static(func, decl, id);
        }

        self.emit(
            sink,
            Command::VarSet {
                name,
                value: value.to_json(),
            },
        )?;
        Ok(Flow::Continue)
    }

    /// Evaluates array dimensions at declaration time.
    fn runtime_dims(&mut self, decl: NodeId) -> RunResult<Vec<u32>> {
        let mut dims = Vec::new();
        for child in self.ast.children(decl) {
            if self.ast.kind(*child) != NodeKind::ArraySize {
                continue;
            }
            match self.ast.child(*child, 0) {
                Some(expr) => {
                    let size = self.const_expr_value(expr).ok_or_else(|| {
                        RunError::type_error("array size must be a constant expression")
                    })?;
                    let size = u32::try_from(size)
                        .map_err(|_| RunError::bounds("array size must be non-negative"))?;
                    dims.push(size);
                }
                // `int a[] = {...}`: size inferred from the initializer.
                None => dims.push(0),
            }
        }
        Ok(dims)
    }

    /// Shapes the raw initializer value to the declared type: scalars
    /// convert, aggregates fill arrays and structs.
    fn build_initial_value(&self, ty: &TypeDesc, dims: &[u32], raw: Value, has_init: bool) -> RunResult<Value> {
        if !has_init {
            if !dims.is_empty() {
                return Ok(value::zero_array(ty, dims));
            }
            if let BaseType::Named(struct_name) = &ty.base
                && ty.pointer == 0
                && let Some(layout) = self.structs.get(struct_name)
            {
                return Ok(self.zero_struct(struct_name, layout));
            }
            return Ok(ty.default_value());
        }

        if !dims.is_empty() {
            return self.fill_array(ty, dims, raw);
        }

        if ty.pointer == 0
            && let BaseType::Named(struct_name) = &ty.base
            && let Some(layout) = self.structs.get(struct_name).cloned()
        {
            return self.fill_struct(struct_name, &layout, raw);
        }

        // Library handles and function references pass through unchanged.
        if matches!(raw, Value::Library(_) | Value::Function(_)) {
            return Ok(raw);
        }
        value::convert(raw, ty)
    }

    fn zero_struct(&self, name: &str, layout: &[(String, TypeDesc, Vec<u32>)]) -> Value {
        let mut fields = indexmap::IndexMap::new();
        for (fname, fty, fdims) in layout {
            let v = if fdims.is_empty() {
                fty.default_value()
            } else {
                value::zero_array(fty, fdims)
            };
            fields.insert(fname.clone(), v);
        }
        Value::Struct(StructValue {
            type_name: name.to_owned(),
            fields,
        })
    }

    fn fill_struct(&self, name: &str, layout: &[(String, TypeDesc, Vec<u32>)], raw: Value) -> RunResult<Value> {
        match raw {
            // Designated initializer: start from zeros, overlay named
            // fields.
            Value::Struct(StructValue { fields: mut init, .. }) => {
                let mut fields = indexmap::IndexMap::new();
                for (fname, fty, fdims) in layout {
                    let v = match init.swap_remove(fname) {
                        Some(item) => {
                            if fdims.is_empty() {
                                value::convert(item, fty)?
                            } else {
                                self.fill_array(fty, fdims, item)?
                            }
                        }
                        None => {
                            if fdims.is_empty() {
                                fty.default_value()
                            } else {
                                value::zero_array(fty, fdims)
                            }
                        }
                    };
                    fields.insert(fname.clone(), v);
                }
                if let Some(unknown) = init.keys().next() {
                    return Err(RunError::type_error(format!(
                        "struct {name} has no member `{unknown}`"
                    )));
                }
                Ok(Value::Struct(StructValue {
                    type_name: name.to_owned(),
                    fields,
                }))
            }
            // Positional initializer list.
            Value::Array(list) => {
                let mut fields = indexmap::IndexMap::new();
                for (i, (fname, fty, fdims)) in layout.iter().enumerate() {
                    let v = match list.data.get(i) {
                        Some(item) => {
                            if fdims.is_empty() {
                                value::convert(item.clone(), fty)?
                            } else {
                                self.fill_array(fty, fdims, item.clone())?
                            }
                        }
                        None => fty.default_value(),
                    };
                    fields.insert(fname.clone(), v);
                }
                Ok(Value::Struct(StructValue {
                    type_name: name.to_owned(),
                    fields,
                }))
            }
            other => Err(RunError::type_error(format!(
                "cannot initialize struct {name} from {}",
                other.type_label()
            ))),
        }
    }

    fn fill_array(&self, elem: &TypeDesc, dims: &[u32], raw: Value) -> RunResult<Value> {
        let [head, rest @ ..] = dims else {
            return value::convert(raw, elem);
        };
        match raw {
            Value::Array(list) => {
                let declared = *head as usize;
                let size = if declared == 0 { list.data.len() } else { declared };
                if list.data.len() > size {
                    return Err(RunError::bounds(format!(
                        "too many initializers: {} for array of {size}",
                        list.data.len()
                    )));
                }
                let mut data = Vec::with_capacity(size);
                for item in list.data {
                    data.push(if rest.is_empty() {
                        value::convert(item, elem)?
                    } else {
                        self.fill_array(elem, rest, item)?
                    });
                }
                while data.len() < size {
                    data.push(if rest.is_empty() {
                        elem.default_value()
                    } else {
                        value::zero_array(elem, rest)
                    });
                }
                Ok(Value::Array(ArrayValue {
                    elem: elem.clone(),
                    data,
                }))
            }
            // `char buf[8] = "hi";`
            Value::Str(s) if rest.is_empty() => {
                let declared = *head as usize;
                let size = if declared == 0 { s.len() + 1 } else { declared };
                let mut data: Vec<Value> = s
                    .chars()
                    .take(size)
                    .map(|c| {
                        Value::typed_int(
                            i64::from(u32::from(c)),
                            IntType {
                                width: IntWidth::W8,
                                unsigned: false,
                            },
                        )
                    })
                    .collect();
                while data.len() < size {
                    data.push(Value::typed_int(
                        0,
                        IntType {
                            width: IntWidth::W8,
                            unsigned: false,
                        },
                    ));
                }
                Ok(Value::Array(ArrayValue {
                    elem: elem.clone(),
                    data,
                }))
            }
            other => Err(RunError::type_error(format!(
                "cannot initialize array from {}",
                other.type_label()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Loops and unwinding
    // ------------------------------------------------------------------

    fn push_loop(&mut self, kind: LoopKind, node: NodeId) {
        self.loops.push(LoopCtx {
            kind,
            node,
            work_len: self.work.len(),
            value_len: self.values.len(),
            scope_depth: self.scopes.depth(),
            frame_len: self.frames.len(),
            range_index: 0,
        });
    }

    /// Normal loop completion: the decide step already consumed everything
    /// above the watermarks.
    fn finish_loop(&mut self) {
        let ctx = self.loops.pop().expect("finish_loop without context");
        self.work.truncate(ctx.work_len);
        self.values.truncate(ctx.value_len);
        self.scopes.truncate(ctx.scope_depth);
    }

    fn innermost_loop(&self, include_switch: bool) -> Option<usize> {
        self.loops
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, ctx)| ctx.frame_len == self.frames.len())
            .find(|(_, ctx)| include_switch || ctx.kind != LoopKind::Switch)
            .map(|(i, _)| i)
    }

    fn do_break(&mut self) -> RunResult<()> {
        let Some(idx) = self.innermost_loop(true) else {
            return Err(RunError::type_error("break outside of loop or switch"));
        };
        let ctx = &self.loops[idx];
        self.work.truncate(ctx.work_len);
        self.values.truncate(ctx.value_len);
        let depth = ctx.scope_depth;
        self.scopes.truncate(depth);
        self.loops.truncate(idx);
        Ok(())
    }

    fn do_continue(&mut self) -> RunResult<()> {
        let Some(idx) = self.innermost_loop(false) else {
            return Err(RunError::type_error("continue outside of loop"));
        };
        let (work_len, value_len, scope_depth, kind, node) = {
            let ctx = &self.loops[idx];
            (ctx.work_len, ctx.value_len, ctx.scope_depth, ctx.kind, ctx.node)
        };
        self.work.truncate(work_len);
        // `for` loops keep their header scope (the loop variable) alive
        // across iterations; body scopes above it are discarded.
        let resume_depth = match kind {
            LoopKind::For | LoopKind::RangeFor => scope_depth + 1,
            _ => scope_depth,
        };
        self.scopes.truncate(resume_depth);
        self.loops.truncate(idx + 1);
        match kind {
            LoopKind::While => {
                self.values.truncate(value_len);
                self.work.push(Step::WhileDecide(node));
                self.work.push(Step::Eval(self.ast.children(node)[0]));
            }
            LoopKind::DoWhile => {
                self.values.truncate(value_len);
                self.work.push(Step::DoWhileDecide(node));
                self.work.push(Step::Eval(self.ast.children(node)[1]));
            }
            LoopKind::For => {
                self.values.truncate(value_len);
                self.push_for_round(node, false);
            }
            LoopKind::RangeFor => {
                // Keep the iterable value on the operand stack.
                self.work.push(Step::RangeForNext(node));
            }
            LoopKind::Switch => unreachable!("switch filtered out above"),
        }
        Ok(())
    }

    /// Queues one round of a C-style for: body (optional), update, cond,
    /// decide.
    fn push_for_round(&mut self, node: NodeId, with_body: bool) {
        let children: Vec<NodeId> = self.ast.children(node).to_vec();
        self.work.push(Step::ForDecide(node));
        if self.ast.kind(children[1]) == NodeKind::EmptyStmt {
            self.work.push(Step::PushValue(Value::Bool(true)));
        } else {
            self.work.push(Step::Eval(children[1]));
        }
        if self.ast.kind(children[2]) != NodeKind::EmptyStmt {
            self.work.push(Step::Discard);
            self.work.push(Step::Eval(children[2]));
        }
        if with_body {
            self.work.push(Step::Exec(children[3]));
        }
    }

    fn range_for_next(&mut self, node: NodeId) -> RunResult<Flow> {
        let ctx_idx = self
            .loops
            .iter()
            .rposition(|c| c.kind == LoopKind::RangeFor && c.node == node)
            .expect("range-for context missing");
        let index = self.loops[ctx_idx].range_index;
        let iterable_slot = self.loops[ctx_idx].value_len;
        let element = {
            let iterable = &self.values[iterable_slot];
            match iterable {
                Value::Array(array) => array.data.get(index).cloned(),
                Value::Str(s) => s.chars().nth(index).map(|c| {
                    Value::typed_int(
                        i64::from(u32::from(c)),
                        IntType {
                            width: IntWidth::W8,
                            unsigned: false,
                        },
                    )
                }),
                other => {
                    let label = other.type_label();
                    return Err(RunError::type_error(format!("cannot iterate over {label}")));
                }
            }
        };
        match element {
            Some(element) => {
                self.loops[ctx_idx].range_index += 1;
                let decl = self.ast.children(node)[0];
                let name = self.ast.name(decl).unwrap_or_default().to_owned();
                let id = self
                    .scopes
                    .lookup(&name)
                    .ok_or_else(|| RunError::type_error(format!("unknown variable `{name}`")))?;
                let converted = {
                    let ty = &self.scopes.get(id).ty;
                    if matches!(ty.base, BaseType::Auto) {
                        element
                    } else {
                        value::convert(element, &ty.clone())?
                    }
                };
                self.scopes.write(id, &name, converted)?;
                self.work.push(Step::RangeForNext(node));
                self.work.push(Step::Exec(self.ast.children(node)[2]));
                Ok(Flow::Continue)
            }
            None => {
                // Drop the iterable value and close the loop.
                self.finish_loop();
                Ok(Flow::Continue)
            }
        }
    }

    fn switch_dispatch(&mut self, sink: &mut dyn CommandSink, node: NodeId) -> RunResult<Flow> {
        let scrutinee = self.pop_value();
        let target = scrutinee.as_i64().unwrap_or(0);
        if self.debug {
            self.emit_unchecked(
                sink,
                Command::SwitchCase {
                    value: scrutinee.to_json(),
                },
            );
        }
        let body = self.ast.children(node)[1];
        let stmts: Vec<NodeId> = self.ast.children(body).to_vec();

        let mut start = None;
        let mut default = None;
        for (i, stmt) in stmts.iter().enumerate() {
            match self.ast.kind(*stmt) {
                NodeKind::CaseLabel => {
                    let label = self
                        .ast
                        .child(*stmt, 0)
                        .and_then(|e| self.const_expr_value(e))
                        .unwrap_or(0);
                    if label == target && start.is_none() {
                        start = Some(i);
                    }
                }
                NodeKind::DefaultLabel if default.is_none() => default = Some(i),
                _ => {}
            }
        }
        let Some(entry) = start.or(default) else {
            // No matching case: the switch is a no-op.
            self.finish_loop();
            return Ok(Flow::Continue);
        };

        self.scopes.push(false);
        self.work.push(Step::PopLoop);
        self.work.push(Step::PopScope);
        // Fall-through: execute from the matched label to the end unless a
        // break unwinds first.
        for stmt in stmts[entry..].iter().rev() {
            self.work.push(Step::Exec(*stmt));
        }
        Ok(Flow::Continue)
    }

    fn unwind_return(&mut self, result: Value) -> RunResult<Flow> {
        let Some(frame) = self.frames.pop() else {
            return Err(RunError::type_error("return outside of a function"));
        };
        self.work.truncate(frame.work_len);
        self.values.truncate(frame.value_len);
        self.scopes.truncate(frame.scope_depth);
        self.loops.truncate(frame.loop_len);
        // Convert to the declared return type.
        let ret_name = self
            .ast
            .child(frame.func, 0)
            .and_then(|t| self.ast.name(t))
            .unwrap_or("void")
            .to_owned();
        let ret_ty = self.resolve_type(&ret_name);
        let converted = if matches!(ret_ty.base, BaseType::Void) && ret_ty.pointer == 0 {
            Value::Void
        } else {
            value::convert(result, &ret_ty)?
        };
        self.values.push(converted);
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval(&mut self, sink: &mut dyn CommandSink, node: NodeId) -> RunResult<Flow> {
        match self.ast.kind(node) {
            NodeKind::IntLiteral => {
                let Some(Literal::Int { value, unsigned }) = self.ast.node(node).value else {
                    return Err(RunError::type_error("malformed integer literal"));
                };
                let fits32 = if unsigned {
                    u32::try_from(value as u64).is_ok()
                } else {
                    i32::try_from(value).is_ok()
                };
                let ty = IntType {
                    width: if fits32 { IntWidth::W32 } else { IntWidth::W64 },
                    unsigned,
                };
                self.values.push(Value::typed_int(value, ty));
                Ok(Flow::Continue)
            }
            NodeKind::FloatLiteral => {
                match self.ast.node(node).value {
                    Some(Literal::Float32(v)) => self.values.push(Value::Float32(v)),
                    Some(Literal::Float64(v)) => self.values.push(Value::Float64(v)),
                    _ => return Err(RunError::type_error("malformed float literal")),
                }
                Ok(Flow::Continue)
            }
            NodeKind::CharLiteral => {
                let Some(Literal::Char(code)) = self.ast.node(node).value else {
                    return Err(RunError::type_error("malformed character literal"));
                };
                self.values.push(Value::typed_int(
                    i64::from(code),
                    IntType {
                        width: IntWidth::W8,
                        unsigned: false,
                    },
                ));
                Ok(Flow::Continue)
            }
            NodeKind::WideCharLiteral => {
                let Some(Literal::Char(code)) = self.ast.node(node).value else {
                    return Err(RunError::type_error("malformed character literal"));
                };
                self.values.push(Value::typed_int(i64::from(code), IntType::I32));
                Ok(Flow::Continue)
            }
            NodeKind::StringLiteral => {
                let Some(Literal::Str(s)) = &self.ast.node(node).value else {
                    return Err(RunError::type_error("malformed string literal"));
                };
                self.values.push(Value::Str(s.clone()));
                Ok(Flow::Continue)
            }
            NodeKind::BoolLiteral => {
                let Some(Literal::Bool(b)) = self.ast.node(node).value else {
                    return Err(RunError::type_error("malformed bool literal"));
                };
                self.values.push(Value::Bool(b));
                Ok(Flow::Continue)
            }
            NodeKind::NullptrLiteral => {
                self.values.push(Value::Pointer(PointerValue::null()));
                Ok(Flow::Continue)
            }
            NodeKind::Identifier => {
                let name = self.ast.name(node).unwrap_or_default().to_owned();
                if let Some(id) = self.scopes.lookup(&name) {
                    let value = self.scopes.read(id);
                    if self.debug {
                        self.emit_unchecked(
                            sink,
                            Command::VarGet {
                                name,
                                value: value.to_json(),
                            },
                        );
                    }
                    self.values.push(value);
                    return Ok(Flow::Continue);
                }
                if let Some(func) = self.functions.get(&name) {
                    self.values.push(Value::Function(*func));
                    return Ok(Flow::Continue);
                }
                Err(RunError::type_error(format!("unknown identifier `{name}`")))
            }
            NodeKind::BinaryExpr => {
                let op = self.ast.name(node).unwrap_or_default();
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                if op == "&&" || op == "||" {
                    self.work.push(Step::LogicalRhs(node));
                    self.work.push(Step::Eval(children[0]));
                } else {
                    self.work.push(Step::BinaryApply(node));
                    self.work.push(Step::Eval(children[1]));
                    self.work.push(Step::Eval(children[0]));
                }
                Ok(Flow::Continue)
            }
            NodeKind::UnaryExpr => {
                let op = self.ast.name(node).unwrap_or_default().to_owned();
                let operand = self.ast.children(node)[0];
                match op.as_str() {
                    "++" | "--" => {
                        let inputs = self.place_inputs_checked(operand)?;
                        self.work.push(Step::IncDecApply { node, postfix: false });
                        self.push_input_evals(inputs);
                    }
                    "&" => {
                        let inputs = self.place_inputs_checked(operand)?;
                        self.work.push(Step::AddrApply(node));
                        self.push_input_evals(inputs);
                    }
                    "*" => {
                        self.work.push(Step::DerefApply(node));
                        self.work.push(Step::Eval(operand));
                    }
                    _ => {
                        self.work.push(Step::UnaryApply(node));
                        self.work.push(Step::Eval(operand));
                    }
                }
                Ok(Flow::Continue)
            }
            NodeKind::PostfixExpr => {
                let operand = self.ast.children(node)[0];
                let inputs = self.place_inputs_checked(operand)?;
                self.work.push(Step::IncDecApply { node, postfix: true });
                self.push_input_evals(inputs);
                Ok(Flow::Continue)
            }
            NodeKind::AssignExpr => {
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                // Validate the target shape before pushing anything so a
                // non-assignable LHS cannot leave the operand stack
                // unbalanced.
                let inputs = self.place_inputs_checked(children[0])?;
                self.work.push(Step::AssignApply(node));
                self.work.push(Step::Eval(children[1]));
                self.push_input_evals(inputs);
                Ok(Flow::Continue)
            }
            NodeKind::TernaryExpr => {
                self.work.push(Step::TernaryDecide(node));
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::CommaExpr => {
                // Evaluate left to right, keep only the last value. Steps
                // are pushed in reverse execution order, so each non-final
                // child gets its Discard pushed before its Eval.
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                for (i, child) in children.iter().enumerate().rev() {
                    if i + 1 != children.len() {
                        self.work.push(Step::Discard);
                    }
                    self.work.push(Step::Eval(*child));
                }
                Ok(Flow::Continue)
            }
            NodeKind::SubscriptExpr => {
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                self.work.push(Step::SubscriptApply(node));
                self.work.push(Step::Eval(children[1]));
                self.work.push(Step::Eval(children[0]));
                Ok(Flow::Continue)
            }
            NodeKind::MemberExpr => {
                self.work.push(Step::MemberApply(node));
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::ArrowExpr => {
                self.work.push(Step::ArrowApply(node));
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::CastExpr | NodeKind::FunctionCastExpr | NodeKind::StaticCastExpr => {
                self.work.push(Step::CastApply(node));
                self.work.push(Step::Eval(self.ast.children(node)[1]));
                Ok(Flow::Continue)
            }
            NodeKind::SizeofTypeExpr => {
                let ty_name = self
                    .ast
                    .child(node, 0)
                    .and_then(|t| self.ast.name(t))
                    .unwrap_or("int")
                    .to_owned();
                let ty = self.resolve_type(&ty_name);
                let size = ty.size_of(self.profile.pointer_bytes);
                self.values
                    .push(Value::typed_int(i64::from(size), IntType::U32));
                Ok(Flow::Continue)
            }
            NodeKind::SizeofExpr => {
                self.work.push(Step::SizeofValApply);
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::TypeofExpr => {
                self.work.push(Step::TypeofApply);
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::InitializerList => {
                let children: Vec<NodeId> = self.ast.children(node).to_vec();
                self.work.push(Step::InitListApply(node));
                for child in children.into_iter().rev() {
                    // Designated initializers evaluate their value child.
                    self.work.push(Step::Eval(child));
                }
                Ok(Flow::Continue)
            }
            NodeKind::DesignatedInit => {
                self.work.push(Step::Eval(self.ast.children(node)[0]));
                Ok(Flow::Continue)
            }
            NodeKind::CallExpr => self.eval_call(node),
            NodeKind::ScopeExpr => Err(RunError::type_error(
                "class constants are not supported outside of calls",
            )),
            other => Err(RunError::type_error(format!("cannot evaluate {other} node"))),
        }
    }

    fn eval_call(&mut self, node: NodeId) -> RunResult<Flow> {
        let children: Vec<NodeId> = self.ast.children(node).to_vec();
        let callee = children[0];
        let args = &children[1..];
        let argc = args.len();

        match self.ast.kind(callee) {
            NodeKind::Identifier => {
                let name = self.ast.name(callee).unwrap_or_default().to_owned();
                self.work.push(Step::CallInvoke {
                    node,
                    argc,
                    target: CallTarget::Name(name),
                });
                for arg in args.iter().rev() {
                    self.work.push(Step::Eval(*arg));
                }
            }
            NodeKind::MemberExpr => {
                let method = self.ast.name(callee).unwrap_or_default().to_owned();
                let object = self.ast.children(callee)[0];
                self.work.push(Step::CallInvoke {
                    node,
                    argc,
                    target: CallTarget::Method { method },
                });
                for arg in args.iter().rev() {
                    self.work.push(Step::Eval(*arg));
                }
                self.work.push(Step::Eval(object));
            }
            NodeKind::ScopeExpr => {
                let method = self.ast.name(callee).unwrap_or_default().to_owned();
                let class_node = self.ast.children(callee)[0];
                let class = self.ast.name(class_node).unwrap_or_default().to_owned();
                self.work.push(Step::CallInvoke {
                    node,
                    argc,
                    target: CallTarget::Static { class, method },
                });
                for arg in args.iter().rev() {
                    self.work.push(Step::Eval(*arg));
                }
            }
            _ => {
                self.work.push(Step::CallInvoke {
                    node,
                    argc,
                    target: CallTarget::Value,
                });
                for arg in args.iter().rev() {
                    self.work.push(Step::Eval(*arg));
                }
                self.work.push(Step::Eval(callee));
            }
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Places (lvalues)
    // ------------------------------------------------------------------

    /// The dynamic inputs of a place expression (subscript indices and
    /// pointer operands), in left-to-right evaluation order. Fails before
    /// any step is pushed when the expression is not assignable.
    fn place_inputs_checked(&self, node: NodeId) -> RunResult<Vec<NodeId>> {
        let mut inputs = Vec::new();
        self.collect_place_inputs(node, &mut inputs)?;
        Ok(inputs)
    }

    /// Queues the input evaluations so they pop left to right.
    fn push_input_evals(&mut self, inputs: Vec<NodeId>) {
        for input in inputs.into_iter().rev() {
            self.work.push(Step::Eval(input));
        }
    }

    fn collect_place_inputs(&self, node: NodeId, out: &mut Vec<NodeId>) -> RunResult<()> {
        match self.ast.kind(node) {
            NodeKind::Identifier => Ok(()),
            NodeKind::SubscriptExpr => {
                self.collect_place_inputs(self.ast.children(node)[0], out)?;
                out.push(self.ast.children(node)[1]);
                Ok(())
            }
            NodeKind::MemberExpr => self.collect_place_inputs(self.ast.children(node)[0], out),
            // The pointer operand of `*p` or `p->x` is a full expression
            // input, evaluated by the machine before place resolution.
            NodeKind::UnaryExpr if self.is_deref(node) => {
                out.push(self.ast.children(node)[0]);
                Ok(())
            }
            NodeKind::ArrowExpr => {
                out.push(self.ast.children(node)[0]);
                Ok(())
            }
            other => Err(RunError::type_error(format!("{other} is not assignable"))),
        }
    }

    fn is_deref(&self, node: NodeId) -> bool {
        self.ast.kind(node) == NodeKind::UnaryExpr && self.ast.name(node) == Some("*")
    }

    /// Count of values `resolve_place` will consume from the input list.
    fn place_input_count(&self, node: NodeId) -> usize {
        let mut out = Vec::new();
        let _ = self.collect_place_inputs(node, &mut out);
        out.len()
    }

    /// Resolves a place expression using previously evaluated inputs.
    fn resolve_place(&self, node: NodeId, inputs: &mut std::vec::IntoIter<Value>) -> RunResult<Place> {
        match self.ast.kind(node) {
            NodeKind::Identifier => {
                let name = self.ast.name(node).unwrap_or_default();
                let var = self
                    .scopes
                    .lookup(name)
                    .ok_or_else(|| RunError::type_error(format!("unknown variable `{name}`")))?;
                Ok(Place {
                    var: self.scopes.resolve(var),
                    path: Vec::new(),
                })
            }
            NodeKind::SubscriptExpr => {
                let mut place = self.resolve_place(self.ast.children(node)[0], inputs)?;
                let index = inputs
                    .next()
                    .ok_or_else(|| RunError::type_error("missing subscript value"))?;
                let idx = index.as_i64()?;
                if idx < 0 {
                    return Err(RunError::bounds(format!("negative array index {idx}")));
                }
                place.path.push(PlacePath::Index(idx as usize));
                Ok(place)
            }
            NodeKind::MemberExpr => {
                let mut place = self.resolve_place(self.ast.children(node)[0], inputs)?;
                let field = self.ast.name(node).unwrap_or_default().to_owned();
                place.path.push(PlacePath::Field(field));
                Ok(place)
            }
            NodeKind::ArrowExpr => {
                let pointer = inputs
                    .next()
                    .ok_or_else(|| RunError::type_error("missing pointer value"))?;
                let mut place = self.pointer_place(&pointer)?;
                let field = self.ast.name(node).unwrap_or_default().to_owned();
                place.path.push(PlacePath::Field(field));
                Ok(place)
            }
            NodeKind::UnaryExpr if self.is_deref(node) => {
                let pointer = inputs
                    .next()
                    .ok_or_else(|| RunError::type_error("missing pointer value"))?;
                self.pointer_place(&pointer)
            }
            other => Err(RunError::type_error(format!("{other} is not assignable"))),
        }
    }

    fn pointer_place(&self, pointer: &Value) -> RunResult<Place> {
        let Value::Pointer(p) = pointer else {
            return Err(RunError::type_error(format!(
                "cannot dereference {}",
                pointer.type_label()
            )));
        };
        match &p.target {
            PointerTarget::Null => Err(RunError::null_deref("null pointer dereference")),
            PointerTarget::Var(id) => Ok(Place {
                var: self.scopes.resolve(*id),
                path: Vec::new(),
            }),
            PointerTarget::Elem(id, index) => Ok(Place {
                var: self.scopes.resolve(*id),
                path: vec![PlacePath::Index(*index as usize)],
            }),
            PointerTarget::Member(id, field) => Ok(Place {
                var: self.scopes.resolve(*id),
                path: vec![PlacePath::Field(field.clone())],
            }),
            PointerTarget::Function(_) => Err(RunError::type_error("cannot dereference a function pointer")),
        }
    }

    fn read_place(&self, place: &Place) -> RunResult<Value> {
        let mut current = &self.scopes.get(place.var).value;
        for step in &place.path {
            current = navigate(current, step)?;
        }
        Ok(current.clone())
    }

    /// Writes through a place, converting to the slot's existing lane and
    /// enforcing const on the root variable.
    fn write_place(&mut self, place: &Place, new: Value) -> RunResult<Value> {
        let variable = self.scopes.get(place.var);
        if variable.is_const {
            let name = variable.name.clone();
            return Err(RunError::type_error(format!("cannot assign to const variable `{name}`")));
        }
        let root_ty = variable.ty.clone();
        let is_whole_scalar = place.path.is_empty() && variable.dims.is_empty();

        let converted = if is_whole_scalar {
            match &new {
                Value::Library(_) | Value::Pointer(_) | Value::Array(_) | Value::Struct(_) | Value::Function(_) => new,
                _ => value::convert(new, &root_ty)?,
            }
        } else {
            new
        };

        let variable = self.scopes.get_mut(place.var);
        let mut slot = &mut variable.value;
        for step in &place.path {
            slot = navigate_mut(slot, step)?;
        }
        // Element writes convert to the lane already stored there.
        let final_value = if place.path.is_empty() {
            converted
        } else {
            convert_like(converted, slot)?
        };
        *slot = final_value.clone();
        Ok(final_value)
    }

    fn assign_apply(&mut self, sink: &mut dyn CommandSink, node: NodeId) -> RunResult<Flow> {
        let children: Vec<NodeId> = self.ast.children(node).to_vec();
        let target = children[0];
        let rhs = self.pop_value();
        let input_count = self.place_input_count(target);
        let inputs = self.pop_args(input_count);
        let mut iter = inputs.into_iter();
        let place = self.resolve_place(target, &mut iter)?;

        let op = self.ast.name(node).unwrap_or("=").to_owned();
        let new = if op == "=" {
            rhs
        } else {
            let current = self.read_place(&place)?;
            let binary = op.trim_end_matches('=');
            value::binary_op(binary, &current, &rhs)?
        };
        self.usage.on_allocate(&self.limits, new.estimate_bytes())?;
        let written = self.write_place(&place, new)?;

        let root_name = self.scopes.get(place.var).name.clone();
        let root_value = self.scopes.get(place.var).value.to_json();
        self.emit(
            sink,
            Command::VarSet {
                name: root_name,
                value: root_value,
            },
        )?;
        self.values.push(written);
        Ok(Flow::Continue)
    }

    fn inc_dec_apply(&mut self, sink: &mut dyn CommandSink, node: NodeId, postfix: bool) -> RunResult<Flow> {
        let target = self.ast.children(node)[0];
        let input_count = self.place_input_count(target);
        let inputs = self.pop_args(input_count);
        let mut iter = inputs.into_iter();
        let place = self.resolve_place(target, &mut iter)?;

        let old = self.read_place(&place)?;
        let op = if self.ast.name(node) == Some("++") { "+" } else { "-" };
        let new = value::binary_op(op, &old, &Value::int(1))?;
        let written = self.write_place(&place, new)?;

        let root_name = self.scopes.get(place.var).name.clone();
        let root_value = self.scopes.get(place.var).value.to_json();
        self.emit(
            sink,
            Command::VarSet {
                name: root_name,
                value: root_value,
            },
        )?;
        self.values.push(if postfix { old } else { written });
        Ok(Flow::Continue)
    }

    fn addr_apply(&mut self, node: NodeId) -> RunResult<Flow> {
        let target = self.ast.children(node)[0];
        let input_count = self.place_input_count(target);
        let inputs = self.pop_args(input_count);
        let mut iter = inputs.into_iter();
        let place = self.resolve_place(target, &mut iter)?;

        let target_desc = match place.path.as_slice() {
            [] => PointerTarget::Var(place.var),
            [PlacePath::Index(i)] => PointerTarget::Elem(place.var, *i as u32),
            [PlacePath::Field(f)] => PointerTarget::Member(place.var, f.clone()),
            _ => {
                return Err(RunError::type_error(
                    "cannot take the address of a nested aggregate member",
                ));
            }
        };
        self.values.push(Value::Pointer(PointerValue { target: target_desc }));
        Ok(Flow::Continue)
    }

    fn subscript_value(&self, base: &Value, index: &Value) -> RunResult<Value> {
        let idx = index.as_i64()?;
        if idx < 0 {
            return Err(RunError::bounds(format!("negative array index {idx}")));
        }
        let idx = idx as usize;
        match base {
            Value::Array(array) => array
                .data
                .get(idx)
                .cloned()
                .ok_or_else(|| RunError::bounds(format!("index {idx} out of bounds for array of {}", array.data.len()))),
            Value::Str(s) => {
                let c = s.chars().nth(idx).ok_or_else(|| {
                    RunError::bounds(format!("index {idx} out of bounds for string of {}", s.chars().count()))
                })?;
                Ok(Value::typed_int(
                    i64::from(u32::from(c)),
                    IntType {
                        width: IntWidth::W8,
                        unsigned: false,
                    },
                ))
            }
            Value::Pointer(p) => {
                // Pointer indexing on array-element pointers.
                if let PointerTarget::Elem(var, offset) = &p.target {
                    let place = Place {
                        var: self.scopes.resolve(*var),
                        path: vec![PlacePath::Index(*offset as usize + idx)],
                    };
                    self.read_place(&place)
                } else if idx == 0 {
                    let place = self.pointer_place(base)?;
                    self.read_place(&place)
                } else {
                    Err(RunError::bounds("pointer index out of bounds"))
                }
            }
            other => Err(RunError::type_error(format!("cannot index {}", other.type_label()))),
        }
    }

    fn member_value(&self, base: &Value, member: &str) -> RunResult<Value> {
        match base {
            Value::Struct(s) => s
                .fields
                .get(member)
                .cloned()
                .ok_or_else(|| RunError::type_error(format!("struct {} has no member `{member}`", s.type_name))),
            Value::Library(handle) => {
                let object = self
                    .objects
                    .get(handle.0 as usize)
                    .ok_or_else(|| RunError::type_error("dangling library handle"))?;
                object
                    .props
                    .get(member)
                    .cloned()
                    .ok_or_else(|| RunError::type_error(format!("unknown member `{}.{member}`", object.library)))
            }
            other => Err(RunError::type_error(format!(
                "cannot access member `{member}` on {}",
                other.type_label()
            ))),
        }
    }

    fn sizeof_value(&self, value: &Value) -> u32 {
        match value {
            Value::Void => 1,
            Value::Bool(_) => 1,
            Value::Int { ty, .. } => ty.width.bytes(),
            Value::Float32(_) => 4,
            Value::Float64(_) => 8,
            Value::Str(s) => (s.len() + 1) as u32,
            Value::Array(a) => a.data.iter().map(|v| self.sizeof_value(v)).sum(),
            Value::Struct(s) => s.fields.values().map(|v| self.sizeof_value(v)).sum(),
            Value::Pointer(_) | Value::Library(_) | Value::Function(_) => u32::from(self.profile.pointer_bytes),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_invoke(&mut self, sink: &mut dyn CommandSink, node: NodeId, argc: usize, target: CallTarget) -> RunResult<Flow> {
        match target {
            CallTarget::Name(name) => {
                let args = self.pop_args(argc);
                self.invoke_named(sink, node, &name, args)
            }
            CallTarget::Method { method } => {
                let mut all = self.pop_args(argc + 1);
                let object = all.remove(0);
                self.invoke_method(sink, node, object, &method, all)
            }
            CallTarget::Static { class, method } => {
                let args = self.pop_args(argc);
                let result = library::call_static(&class, &method, &args)?;
                if self.debug {
                    self.emit_unchecked(
                        sink,
                        Command::LibraryMethodInternal {
                            library: class,
                            method,
                            args: args.iter().map(Value::to_json).collect(),
                            result: result.to_json(),
                        },
                    );
                }
                self.values.push(result);
                Ok(Flow::Continue)
            }
            CallTarget::Value => {
                let args = self.pop_args(argc);
                let callee = self.pop_value();
                match callee {
                    Value::Function(func) => self.invoke_user(sink, func, args, node),
                    Value::Pointer(PointerValue {
                        target: PointerTarget::Function(func),
                    }) => self.invoke_user(sink, func, args, node),
                    other => Err(RunError::type_error(format!(
                        "{} is not callable",
                        other.type_label()
                    ))),
                }
            }
        }
    }

    fn invoke_named(&mut self, sink: &mut dyn CommandSink, node: NodeId, name: &str, args: Vec<Value>) -> RunResult<Flow> {
        // User functions shadow builtins.
        if let Some(func) = self.functions.get(name).copied() {
            return self.invoke_user(sink, func, args, node);
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return self.invoke_builtin(sink, builtin, name, args);
        }
        // Function pointers stored in variables.
        if let Some(var) = self.scopes.lookup(name) {
            let value = self.scopes.read(var);
            if let Value::Function(func) = value {
                return self.invoke_user(sink, func, args, node);
            }
            if let Value::Pointer(PointerValue {
                target: PointerTarget::Function(func),
            }) = value
            {
                return self.invoke_user(sink, func, args, node);
            }
        }
        // Library constructor used as an expression.
        if library::library(name).is_some() {
            let handle = LibraryHandle(self.objects.len() as u32);
            self.objects.push(LibraryObject::new(name, args));
            self.values.push(Value::Library(handle));
            return Ok(Flow::Continue);
        }
        // `String(x)` constructor form.
        if name == "String" {
            let text = args.first().map(Value::display_text).unwrap_or_default();
            self.values.push(Value::Str(text));
            return Ok(Flow::Continue);
        }
        Err(RunError::type_error(format!("unknown function `{name}`")))
    }

    fn invoke_user(&mut self, sink: &mut dyn CommandSink, func: NodeId, args: Vec<Value>, call_node: NodeId) -> RunResult<Flow> {
        self.usage
            .check_recursion(&self.limits, self.frames.len())?;
        let fname = self.ast.name(func).unwrap_or_default().to_owned();
        if self.debug {
            self.emit_unchecked(
                sink,
                Command::FunctionCall {
                    name: fname.clone(),
                    args: args.iter().map(Value::to_json).collect(),
                },
            );
        }
        let children: Vec<NodeId> = self.ast.children(func).to_vec();
        if children.len() < 3 {
            return Err(RunError::type_error(format!("function `{fname}` has no body")));
        }
        let params: Vec<NodeId> = self.ast.children(children[1]).to_vec();
        let body = children[2];

        // Resolve reference-parameter targets against the caller's scopes
        // before the callee frame hides them.
        let arg_nodes: Vec<NodeId> = self.ast.children(call_node).get(1..).map(<[NodeId]>::to_vec).unwrap_or_default();
        let ref_targets: Vec<Option<VarId>> = params
            .iter()
            .enumerate()
            .map(|(i, param)| {
                if self.ast.node(*param).flags & flags::REFERENCE == 0 {
                    return None;
                }
                let arg_node = arg_nodes.get(i)?;
                if self.ast.kind(*arg_node) != NodeKind::Identifier {
                    return None;
                }
                self.ast.name(*arg_node).and_then(|n| self.scopes.lookup(n))
            })
            .collect();

        self.frames.push(Frame {
            func,
            work_len: self.work.len(),
            value_len: self.values.len(),
            scope_depth: self.scopes.depth(),
            loop_len: self.loops.len(),
        });
        self.scopes.push(true);

        // Bind parameters left to right; missing args default, extra args
        // are dropped.
        let mut args = args.into_iter();
        for (i, param) in params.iter().enumerate() {
            let pname = self.ast.name(*param).unwrap_or_default().to_owned();
            let pty_name = self
                .ast
                .child(*param, 0)
                .and_then(|t| self.ast.name(t))
                .unwrap_or("int")
                .to_owned();
            let pty = self.resolve_type(&pty_name);
            let supplied = args.next();

            // Reference parameters alias the caller's variable when the
            // argument names one.
            if let Some(Some(target)) = ref_targets.get(i) {
                let target = *target;
                let value = self.scopes.read(target);
                self.scopes.declare(
                    &pname,
                    Variable {
                        value,
                        ty: pty,
                        is_const: false,
                        dims: Vec::new(),
                        alias: Some(target),
                        name: pname.clone(),
                    },
                );
                continue;
            }

            let value = match supplied {
                Some(v) => match &pty.base {
                    BaseType::Named(_) => v,
                    _ if pty.pointer > 0 => v,
                    _ => value::convert(v, &pty)?,
                },
                None => pty.default_value(),
            };
            self.scopes.declare(
                &pname,
                Variable {
                    value,
                    ty: pty,
                    is_const: self.ast.node(*param).flags & flags::CONST != 0,
                    dims: Vec::new(),
                    alias: None,
                    name: pname.clone(),
                },
            );
        }

        self.work.push(Step::FrameEnd);
        self.work.push(Step::Exec(body));
        Ok(Flow::Continue)
    }

    fn next_request_id(&mut self, name: &str) -> String {
        self.request_counter += 1;
        let nonce: u32 = rand::random();
        format!("{name}_{}_{nonce:08x}", self.request_counter)
    }

    fn invoke_builtin(&mut self, sink: &mut dyn CommandSink, builtin: Builtin, name: &str, args: Vec<Value>) -> RunResult<Flow> {
        if !builtin.emits_command() && builtin != Builtin::Exit {
            let result = builtins::call_pure(builtin, &args, &mut self.rng)?;
            self.values.push(result);
            return Ok(Flow::Continue);
        }
        let arg_i64 = |i: usize| -> RunResult<i64> {
            args.get(i)
                .ok_or_else(|| RunError::type_error(format!("{name} missing argument {i}")))?
                .as_i64()
        };
        match builtin {
            Builtin::PinMode => {
                let pin = arg_i64(0)?;
                let mode = builtins::pin_mode_name(arg_i64(1)?);
                self.emit(sink, Command::PinMode { pin, mode })?;
                self.values.push(Value::Void);
            }
            Builtin::DigitalWrite => {
                let pin = arg_i64(0)?;
                let value = i64::from(arg_i64(1)? != 0);
                self.emit(sink, Command::DigitalWrite { pin, value })?;
                self.values.push(Value::Void);
            }
            Builtin::AnalogWrite => {
                let pin = arg_i64(0)?;
                let value = arg_i64(1)?;
                self.emit(sink, Command::AnalogWrite { pin, value })?;
                self.values.push(Value::Void);
            }
            Builtin::Delay => {
                let duration = arg_i64(0)?;
                self.emit(sink, Command::Delay { duration })?;
                self.values.push(Value::Void);
            }
            Builtin::DelayMicroseconds => {
                let duration = arg_i64(0)?;
                self.emit(sink, Command::DelayMicroseconds { duration })?;
                self.values.push(Value::Void);
            }
            Builtin::Tone => {
                let pin = arg_i64(0)?;
                let frequency = arg_i64(1)?;
                let duration = args.get(2).map(Value::as_i64).transpose()?;
                self.emit(sink, Command::Tone { pin, frequency, duration })?;
                self.values.push(Value::Void);
            }
            Builtin::NoTone => {
                let pin = arg_i64(0)?;
                self.emit(sink, Command::NoTone { pin })?;
                self.values.push(Value::Void);
            }
            Builtin::Exit => {
                // Drop all pending user code but keep the lifecycle steps,
                // so the open SETUP/LOOP phase still emits its END record
                // before the program finishes.
                self.terminated = true;
                self.work.retain(|step| matches!(step, Step::Lifecycle(_)));
                self.frames.clear();
                self.loops.clear();
                self.values.clear();
            }
            Builtin::DigitalRead => {
                let pin = arg_i64(0)?;
                let request_id = self.next_request_id("digitalRead");
                self.emit(
                    sink,
                    Command::DigitalReadRequest {
                        pin,
                        request_id: request_id.clone(),
                    },
                )?;
                return Ok(Flow::Suspend(Suspend {
                    request_id,
                    fallback: Value::int(0),
                }));
            }
            Builtin::AnalogRead => {
                let pin_num = arg_i64(0)?;
                let pin = self
                    .profile
                    .analog_pin_name(pin_num)
                    .map_or_else(|| pin_num.to_string(), str::to_owned);
                let request_id = self.next_request_id("analogRead");
                self.emit(
                    sink,
                    Command::AnalogReadRequest {
                        pin,
                        request_id: request_id.clone(),
                    },
                )?;
                return Ok(Flow::Suspend(Suspend {
                    request_id,
                    fallback: Value::int(0),
                }));
            }
            Builtin::Millis => {
                let request_id = self.next_request_id("millis");
                self.emit(
                    sink,
                    Command::MillisRequest {
                        request_id: request_id.clone(),
                    },
                )?;
                return Ok(Flow::Suspend(Suspend {
                    request_id,
                    fallback: Value::typed_int(0, IntType::U32),
                }));
            }
            Builtin::Micros => {
                let request_id = self.next_request_id("micros");
                self.emit(
                    sink,
                    Command::MicrosRequest {
                        request_id: request_id.clone(),
                    },
                )?;
                return Ok(Flow::Suspend(Suspend {
                    request_id,
                    fallback: Value::typed_int(0, IntType::U32),
                }));
            }
            _ => unreachable!("pure builtins handled above"),
        }
        Ok(Flow::Continue)
    }

    fn invoke_method(
        &mut self,
        sink: &mut dyn CommandSink,
        node: NodeId,
        object: Value,
        method: &str,
        args: Vec<Value>,
    ) -> RunResult<Flow> {
        match object {
            Value::Str(s) => {
                let result = builtins::string_method(&s, method, &args)?;
                // In-place String mutators write back when the receiver is a
                // plain variable.
                if matches!(method, "toUpperCase" | "toLowerCase" | "trim" | "concat")
                    && let Some(callee) = self.ast.child(node, 0)
                    && let Some(receiver) = self.ast.child(callee, 0)
                    && self.ast.kind(receiver) == NodeKind::Identifier
                    && let Some(var) = self.ast.name(receiver).and_then(|n| self.scopes.lookup(n))
                {
                    if let Value::Str(new_text) = &result {
                        let name = self.scopes.get(var).name.clone();
                        self.scopes.write(var, &name, Value::Str(new_text.clone()))?;
                    }
                }
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Value::Library(handle) => self.invoke_library_method(sink, handle, method, args),
            other => Err(RunError::type_error(format!(
                "unknown member `{method}` on {}",
                other.type_label()
            ))),
        }
    }

    fn invoke_library_method(
        &mut self,
        sink: &mut dyn CommandSink,
        handle: LibraryHandle,
        method: &str,
        args: Vec<Value>,
    ) -> RunResult<Flow> {
        let instance = self
            .objects
            .get(handle.0 as usize)
            .ok_or_else(|| RunError::type_error("dangling library handle"))?
            .library
            .clone();
        let Some(def) = library::library(&instance) else {
            return Err(RunError::type_error(format!("unknown library `{instance}`")));
        };

        // The Serial write family maps onto dedicated commands.
        if def.name == "Serial" {
            match method {
                "begin" => {
                    let baud_rate = args.first().map_or(Ok(9600), Value::as_i64)?;
                    self.emit(sink, Command::SerialBegin { baud_rate })?;
                    self.values.push(Value::Void);
                    return Ok(Flow::Continue);
                }
                "print" | "println" => {
                    let text = render_serial_text(&args);
                    let command = if method == "print" {
                        Command::SerialPrint { text }
                    } else {
                        Command::SerialPrintln { text }
                    };
                    self.emit(sink, command)?;
                    self.values.push(Value::Void);
                    return Ok(Flow::Continue);
                }
                "write" => {
                    let value = args.first().map_or(Ok(0), Value::as_i64)?;
                    self.emit(sink, Command::SerialWrite { value })?;
                    self.values.push(Value::Void);
                    return Ok(Flow::Continue);
                }
                _ => {}
            }
        }

        match def.method_kind(method) {
            Some(MethodKind::Internal) => {
                let object = &mut self.objects[handle.0 as usize];
                let result = library::call_internal(object, method, &args)?;
                if self.debug {
                    self.emit_unchecked(
                        sink,
                        Command::LibraryMethodInternal {
                            library: instance,
                            method: method.to_owned(),
                            args: args.iter().map(Value::to_json).collect(),
                            result: result.to_json(),
                        },
                    );
                }
                self.values.push(result);
                Ok(Flow::Continue)
            }
            Some(MethodKind::External) => {
                self.emit(
                    sink,
                    Command::LibraryMethodCall {
                        library: instance,
                        method: method.to_owned(),
                        args: args.iter().map(Value::to_json).collect(),
                    },
                )?;
                self.values.push(Value::Void);
                Ok(Flow::Continue)
            }
            Some(MethodKind::ExternalRequest) => {
                let request_id = self.next_request_id(&format!("{instance}.{method}"));
                self.emit(
                    sink,
                    Command::LibraryMethodRequest {
                        library: instance.clone(),
                        method: method.to_owned(),
                        args: args.iter().map(Value::to_json).collect(),
                        request_id: request_id.clone(),
                    },
                )?;
                let fallback = match (def.name, method) {
                    ("Serial", "read" | "peek") => Value::int(-1),
                    ("Serial", "parseFloat") => Value::Float32(0.0),
                    ("Serial", "readString") => Value::Str(String::new()),
                    _ => Value::int(0),
                };
                Ok(Flow::Suspend(Suspend { request_id, fallback }))
            }
            None => Err(RunError::type_error(format!(
                "unknown member `{instance}.{method}`"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn lifecycle(&mut self, sink: &mut dyn CommandSink, phase: Phase) -> RunResult<Flow> {
        match phase {
            Phase::SetupStart => {
                self.emit(sink, Command::SetupStart)?;
            }
            Phase::CallSetup => {
                if let Some(func) = self.functions.get("setup").copied() {
                    self.work.push(Step::Discard);
                    return self.invoke_user(sink, func, Vec::new(), func);
                }
                self.emit_unchecked(
                    sink,
                    Command::Warning {
                        kind: ErrorKind::TypeError.to_string(),
                        message: "sketch has no setup() function".to_owned(),
                        request_id: None,
                    },
                );
            }
            Phase::SetupEnd => {
                self.emit(sink, Command::SetupEnd)?;
            }
            Phase::LoopIteration(n) => {
                if self.terminated || n >= self.max_loop_iterations {
                    return Ok(Flow::Continue);
                }
                let Some(func) = self.functions.get("loop").copied() else {
                    if n == 0 {
                        self.emit_unchecked(
                            sink,
                            Command::Warning {
                                kind: ErrorKind::TypeError.to_string(),
                                message: "sketch has no loop() function".to_owned(),
                                request_id: None,
                            },
                        );
                    }
                    return Ok(Flow::Continue);
                };
                self.emit(sink, Command::LoopStart { iteration: n + 1 })?;
                self.work.push(Step::Lifecycle(Phase::LoopIteration(n + 1)));
                self.work.push(Step::Lifecycle(Phase::LoopEnd(n)));
                self.work.push(Step::Discard);
                return self.invoke_user(sink, func, Vec::new(), func);
            }
            Phase::LoopEnd(n) => {
                self.emit(sink, Command::LoopEnd { iteration: n + 1 })?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Pushes the host's response (or the timeout fallback) so the
    /// suspended call site sees it as its return value.
    pub(crate) fn resume_with(&mut self, value: Value) {
        self.values.push(value);
    }
}

enum Flow {
    Continue,
    Suspend(Suspend),
}

/// Serial.print renders its first argument; an optional second argument
/// selects the integer base, Arduino style.
fn render_serial_text(args: &[Value]) -> String {
    match args {
        [] => String::new(),
        [single] => single.display_text(),
        [value, base] => {
            let Ok(v) = value.as_i64() else {
                return value.display_text();
            };
            match base.as_i64() {
                Ok(2) => format!("{v:b}"),
                Ok(8) => format!("{v:o}"),
                Ok(16) => format!("{v:X}"),
                _ => value.display_text(),
            }
        }
        _ => args[0].display_text(),
    }
}

fn navigate<'v>(value: &'v Value, step: &PlacePath) -> RunResult<&'v Value> {
    match (value, step) {
        (Value::Array(array), PlacePath::Index(i)) => array
            .data
            .get(*i)
            .ok_or_else(|| RunError::bounds(format!("index {i} out of bounds for array of {}", array.data.len()))),
        (Value::Struct(s), PlacePath::Field(f)) => s
            .fields
            .get(f)
            .ok_or_else(|| RunError::type_error(format!("struct {} has no member `{f}`", s.type_name))),
        (other, PlacePath::Index(_)) => Err(RunError::type_error(format!("cannot index {}", other.type_label()))),
        (other, PlacePath::Field(f)) => Err(RunError::type_error(format!(
            "cannot access member `{f}` on {}",
            other.type_label()
        ))),
    }
}

fn navigate_mut<'v>(value: &'v mut Value, step: &PlacePath) -> RunResult<&'v mut Value> {
    match (value, step) {
        (Value::Array(array), PlacePath::Index(i)) => {
            let len = array.data.len();
            array
                .data
                .get_mut(*i)
                .ok_or_else(|| RunError::bounds(format!("index {i} out of bounds for array of {len}")))
        }
        (Value::Struct(s), PlacePath::Field(f)) => {
            let type_name = s.type_name.clone();
            s.fields
                .get_mut(f)
                .ok_or_else(|| RunError::type_error(format!("struct {type_name} has no member `{f}`")))
        }
        (other, PlacePath::Index(_)) => Err(RunError::type_error(format!("cannot index {}", other.type_label()))),
        (other, PlacePath::Field(f)) => Err(RunError::type_error(format!(
            "cannot access member `{f}` on {}",
            other.type_label()
        ))),
    }
}

/// Converts `new` to the integer/float lane of the value currently stored
/// in a slot, so element writes keep the array's element type.
fn convert_like(new: Value, existing: &Value) -> RunResult<Value> {
    match existing {
        Value::Int { ty, .. } => Ok(Value::typed_int(new.as_i64()?, *ty)),
        Value::Float32(_) => Ok(Value::Float32(new.as_f64()? as f32)),
        Value::Float64(_) => Ok(Value::Float64(new.as_f64()?)),
        Value::Bool(_) => Ok(Value::Bool(new.truthy()?)),
        Value::Str(_) => Ok(Value::Str(new.display_text())),
        _ => Ok(new),
    }
}
