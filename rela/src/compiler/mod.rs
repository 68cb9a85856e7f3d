// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Tree-to-bytecode compiler (§4.E): walks the AST produced by
//! [`crate::parser`], emits a flat [`Instr`] array, resolves jump
//! targets, assigns each function a compile-time scope-id path for
//! upvalue resolution, and runs a peephole optimizer over the result.
//!
//! The AST is immutable once parsed; the compiler never mutates it
//! except through the `Cell<u32>` scope ids that [`crate::parser::ast::Node`]
//! reserves for exactly this purpose.

pub mod opcode;
mod peephole;

use crate::error::{Error, SourcePos};
use crate::intern::StrHandle;
use crate::parser::ast::{BinOp, MapKey, Node, NodeKind, StringPart, UnaryOp};
use crate::value::Item;
use crate::vm::heap::Heap;
use opcode::{Instr, OpCode};
use std::collections::{HashMap, HashSet};

/// Bounded nesting depth for a function's scope-id path (§9 "source uses 8").
pub const MAX_SCOPE_DEPTH: usize = 8;

/// Bounded size of a frame's flat locals table (§9 "source uses 32").
pub const MAX_LOCALS: usize = 32;

/// Compiled output: the flat instruction array plus the side tables the
/// opcode inventory leans on instead of embedding variable-length data
/// in an `Instr` (§4.E "FOR imm is the vector of induction-variable
/// names", §4.F per-parameter binding, §4.E "PID imm").
#[derive(Default)]
pub struct Code {
    pub instrs: Vec<Instr>,
    /// `OpCode::For`'s `cache` indexes here: the induction variable names.
    pub for_names: Vec<Vec<StrHandle>>,
    /// Subroutine entry ip -> declared parameter names, in order.
    pub param_names: HashMap<usize, Vec<StrHandle>>,
    /// Subroutine entry ip -> compile-time scope-id path (§4.E "Scope and
    /// upvalues"), index 0 is the function's own id.
    pub scope_paths: HashMap<usize, Vec<u32>>,
    /// Entry ip of every module compiled into this `Code` so far, in
    /// `create` registration order.
    pub module_starts: Vec<usize>,
    /// Number of distinct `CFunc` call-site cache slots assigned; the VM
    /// allocates a `Vec<Option<Item>>` of this length per `run` (§4.E
    /// "Call-site cache").
    pub cfunc_slots: usize,
}

impl Code {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// One compilation pass over one module's AST, appending to a shared
/// [`Code`] (so later modules can call into earlier ones).
pub struct Compiler<'h, 'a> {
    heap: &'h mut Heap,
    src: &'a str,
    code: Code,
    /// Instruction indices that are the target of some jump; the
    /// peephole pass must never fuse across one of these (§9 "Peephole
    /// fusions must never cross a jump target").
    jump_targets: HashSet<usize>,
    next_scope_id: u32,
    /// Enclosing function scope-id path stack during AST walk, outermost
    /// first; `function_scope.last()` is the path of the function whose
    /// body we are currently compiling (`vec![0]` at module top level).
    function_scope: Vec<Vec<u32>>,
}

type CResult<T> = Result<T, Error>;

impl<'h, 'a> Compiler<'h, 'a> {
    #[must_use]
    pub fn new(heap: &'h mut Heap, src: &'a str) -> Self {
        Self {
            heap,
            src,
            code: Code::new(),
            jump_targets: HashSet::new(),
            next_scope_id: 1,
            function_scope: vec![vec![0]],
        }
    }

    pub fn into_code(mut self) -> Code {
        peephole::optimize(&mut self.code.instrs, &self.jump_targets);
        self.code
    }

    /// Resume compiling into a `Code` shared with earlier modules
    /// (`Vm::create`'s multi-module form), carrying forward the scope-id
    /// counter and jump-target set so a final [`Compiler::into_code`]
    /// call can run the peephole pass once over the whole array.
    #[must_use]
    pub fn resume(
        heap: &'h mut Heap,
        src: &'a str,
        code: Code,
        next_scope_id: u32,
        jump_targets: HashSet<usize>,
    ) -> Self {
        Self {
            heap,
            src,
            code,
            jump_targets,
            next_scope_id,
            function_scope: vec![vec![0]],
        }
    }

    /// Tear down without running the peephole pass, so a subsequent
    /// module can keep appending to the same `Code`.
    #[must_use]
    pub fn into_parts(self) -> (Code, u32, HashSet<usize>) {
        (self.code, self.next_scope_id, self.jump_targets)
    }

    fn snippet_at(&self, pos: SourcePos) -> &str {
        let start = pos.offset.saturating_sub(16);
        let end = (pos.offset + 16).min(self.src.len());
        let start = floor_char_boundary(self.src, start);
        let end = floor_char_boundary(self.src, end);
        &self.src[start..end]
    }

    fn err(&self, pos: SourcePos, message: impl Into<String>) -> Error {
        Error::compile(message, self.snippet_at(pos))
    }

    fn intern(&mut self, s: &str) -> StrHandle {
        self.heap.intern(s)
    }

    fn emit(&mut self, instr: Instr) -> usize {
        self.code.instrs.push(instr);
        self.code.instrs.len() - 1
    }

    fn here(&self) -> usize {
        self.code.instrs.len()
    }

    /// Patch a previously emitted jump-family instruction's `cache` to
    /// `target`, recording `target` as a jump target so the peephole
    /// pass leaves it alone.
    fn patch(&mut self, ip: usize, target: usize) {
        self.code.instrs[ip].cache = target as i32;
        self.jump_targets.insert(target);
    }

    fn alloc_cfunc_slot(&mut self) -> i32 {
        let slot = self.code.cfunc_slots;
        self.code.cfunc_slots += 1;
        slot as i32
    }

    /// Compile one module's program, appending its entry ip to
    /// `code.module_starts`. Top-level statements discard their value
    /// (§8 "Balance: after every top-level statement, `depth() == 0`").
    pub fn compile_module(&mut self, program: &[&Node<'_>]) -> CResult<()> {
        let start = self.here();
        self.code.module_starts.push(start);
        for stmt in program {
            self.compile_discarded(stmt)?;
        }
        self.emit(Instr::new(OpCode::Nil));
        self.emit(Instr::new(OpCode::Return));
        Ok(())
    }

    // ---- statement-sequence helpers ----

    /// Compile one statement whose value (however many items it leaves,
    /// whether 0, 1 or many) is not needed: bracket it in its own
    /// `Mark`/`Clean` pair so the stack returns to its pre-statement
    /// depth regardless of what the statement produced.
    fn compile_discarded(&mut self, stmt: &Node<'_>) -> CResult<()> {
        self.emit(Instr::new(OpCode::Mark));
        self.compile_stmt(stmt)?;
        self.emit(Instr::new(OpCode::Clean));
        Ok(())
    }

    /// Compile a sequence of statements where no resulting value is
    /// needed (loop bodies, function bodies): every statement's value is
    /// discarded.
    fn compile_discard_block(&mut self, stmts: &[&Node<'_>]) -> CResult<()> {
        for stmt in stmts {
            self.compile_discarded(stmt)?;
        }
        Ok(())
    }

    /// Compile a sequence of statements as an expression: all but the
    /// last discard their value, the last's value is squashed to exactly
    /// one (`Nil` if the sequence is empty). Used for `if`/`else`
    /// branches (§4.D "ternary style").
    fn compile_value_block(&mut self, stmts: &[&Node<'_>]) -> CResult<()> {
        if stmts.is_empty() {
            self.emit(Instr::new(OpCode::Nil));
            return Ok(());
        }
        let (last, init) = stmts.split_last().expect("checked non-empty");
        for stmt in init {
            self.compile_discarded(stmt)?;
        }
        self.emit(Instr::new(OpCode::Mark));
        self.compile_stmt(last)?;
        self.emit(Instr::with_imm(OpCode::Limit, Item::Int(1)));
        Ok(())
    }

    // ---- statements ----

    fn compile_stmt(&mut self, node: &Node<'_>) -> CResult<()> {
        match &node.kind {
            NodeKind::Return(values) => {
                self.compile_value_list(values)?;
                self.emit(Instr::new(OpCode::Return));
                Ok(())
            }
            NodeKind::Break => {
                self.emit(Instr::new(OpCode::Break));
                Ok(())
            }
            NodeKind::Continue => {
                self.emit(Instr::new(OpCode::Continue));
                Ok(())
            }
            NodeKind::While { cond, body } => self.compile_while(cond, body),
            NodeKind::For { vars, iter, body } => self.compile_for(vars, iter, body),
            NodeKind::Assign { targets, values } => self.compile_assign(targets, values),
            _ => self.compile_expr(node),
        }
    }

    // ---- expressions: always leave exactly one value, except Call
    // (and the coroutine/resume/yield intrinsics it covers) which may
    // leave any number and must be squashed by the caller when a single
    // value is required ----

    fn is_multi(node: &Node<'_>) -> bool {
        matches!(
            node.kind,
            NodeKind::Call { .. } | NodeKind::Unary(UnaryOp::Unpack, _)
        )
    }

    fn compile_expr_single(&mut self, node: &Node<'_>) -> CResult<()> {
        self.compile_expr(node)?;
        if Self::is_multi(node) {
            self.emit(Instr::with_imm(OpCode::Limit, Item::Int(1)));
        }
        Ok(())
    }

    /// Compile a list of expressions (call arguments, return values,
    /// assignment RHS): every element but the last is squashed to one
    /// value, the last is left to expand naturally if it is a call or
    /// `...` unpack (§4.D "the three-dot unpack of a vector").
    fn compile_value_list(&mut self, nodes: &[&Node<'_>]) -> CResult<()> {
        for (i, node) in nodes.iter().enumerate() {
            if i + 1 == nodes.len() {
                self.compile_expr(node)?;
            } else {
                self.compile_expr_single(node)?;
            }
        }
        Ok(())
    }

    fn compile_expr(&mut self, node: &Node<'_>) -> CResult<()> {
        match &node.kind {
            NodeKind::Nil => {
                self.emit(Instr::new(OpCode::Nil));
            }
            NodeKind::True => {
                self.emit(Instr::new(OpCode::True));
            }
            NodeKind::False => {
                self.emit(Instr::new(OpCode::False));
            }
            NodeKind::Int(v) => {
                self.emit(Instr::with_imm(OpCode::Lit, Item::Int(*v)));
            }
            NodeKind::Float(v) => {
                self.emit(Instr::with_imm(OpCode::Lit, Item::Float(*v)));
            }
            NodeKind::Str(parts) => self.compile_string(parts)?,
            NodeKind::Name(n) => {
                let handle = self.intern(n);
                self.emit(Instr::with_imm(OpCode::Find, Item::Str(handle)));
            }
            NodeKind::Global(n) => {
                let handle = self.intern(n);
                self.emit(Instr::new(OpCode::Global));
                self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
                self.emit(Instr::new(OpCode::Get));
            }
            NodeKind::Vector(items) => {
                self.emit(Instr::new(OpCode::Vector));
                for item in *items {
                    self.compile_expr_single(item)?;
                    self.emit(Instr::new(OpCode::VPush));
                }
            }
            NodeKind::Map(entries) => {
                // `Set` leaves its target on the stack (only the index
                // and value are consumed), so the map under construction
                // stays put across every entry.
                self.emit(Instr::new(OpCode::Map));
                for (key, value) in *entries {
                    match key {
                        MapKey::Name(n) => {
                            let handle = self.intern(n);
                            self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
                        }
                        MapKey::Expr(key_expr) => self.compile_expr_single(key_expr)?,
                    }
                    self.compile_expr_single(value)?;
                    self.emit(Instr::new(OpCode::Set));
                }
                self.emit(Instr::new(OpCode::UnMap));
            }
            NodeKind::Unary(op, operand) => self.compile_unary(*op, operand)?,
            NodeKind::Binary(op, lhs, rhs) => self.compile_binary(*op, lhs, rhs)?,
            NodeKind::Call { callee, args } => self.compile_call(callee, args)?,
            NodeKind::Index { target, index } => {
                self.compile_expr_single(target)?;
                self.compile_expr_single(index)?;
                self.emit(Instr::new(OpCode::Get));
            }
            NodeKind::Field {
                target,
                name,
                is_method,
            } => {
                if *is_method {
                    return Err(self.err(node.pos, "method reference used outside a call"));
                }
                self.compile_expr_single(target)?;
                let handle = self.intern(name);
                self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
                self.emit(Instr::new(OpCode::Get));
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.compile_if(cond, then_branch, else_branch)?,
            NodeKind::While { cond, body } => self.compile_while(cond, body)?,
            NodeKind::For { vars, iter, body } => self.compile_for(vars, iter, body)?,
            NodeKind::Function {
                name,
                params,
                body,
                scope_id,
            } => self.compile_function(node.pos, *name, params, body, scope_id)?,
            NodeKind::Return(_) | NodeKind::Break | NodeKind::Continue | NodeKind::Assign { .. } => {
                self.compile_stmt(node)?;
            }
        }
        Ok(())
    }

    fn compile_string(&mut self, parts: &[StringPart<'_>]) -> CResult<()> {
        if parts.is_empty() {
            let handle = self.intern("");
            self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
            return Ok(());
        }
        for (i, part) in parts.iter().enumerate() {
            match part {
                StringPart::Literal(s) => {
                    let handle = self.intern(s);
                    self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
                }
                StringPart::Name(n) => {
                    let handle = self.intern(n);
                    self.emit(Instr::with_imm(OpCode::Find, Item::Str(handle)));
                }
                StringPart::Expr(e) => self.compile_expr_single(e)?,
            }
            if i > 0 {
                self.emit(Instr::new(OpCode::Concat));
            }
        }
        Ok(())
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &Node<'_>) -> CResult<()> {
        match op {
            UnaryOp::Unpack => {
                self.compile_expr_single(operand)?;
                self.emit(Instr::new(OpCode::Unpack));
            }
            UnaryOp::Count => {
                self.compile_expr_single(operand)?;
                self.emit(Instr::new(OpCode::Count));
            }
            UnaryOp::Negate => {
                self.compile_expr_single(operand)?;
                self.emit(Instr::new(OpCode::Neg));
            }
            UnaryOp::Not => {
                self.compile_expr_single(operand)?;
                self.emit(Instr::new(OpCode::Not));
            }
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: BinOp, lhs: &Node<'_>, rhs: &Node<'_>) -> CResult<()> {
        match op {
            BinOp::And => {
                self.compile_expr_single(lhs)?;
                self.emit(Instr::new(OpCode::Copy));
                let jf = self.emit(Instr::new(OpCode::JFalse));
                self.emit(Instr::new(OpCode::Drop));
                self.compile_expr_single(rhs)?;
                let end = self.here();
                self.patch(jf, end);
            }
            BinOp::Or => {
                self.compile_expr_single(lhs)?;
                self.emit(Instr::new(OpCode::Copy));
                let jt = self.emit(Instr::new(OpCode::JTrue));
                self.emit(Instr::new(OpCode::Drop));
                self.compile_expr_single(rhs)?;
                let end = self.here();
                self.patch(jt, end);
            }
            _ => {
                self.compile_expr_single(lhs)?;
                self.compile_expr_single(rhs)?;
                let opc = match op {
                    BinOp::Eq => OpCode::Eq,
                    BinOp::Ne => OpCode::Ne,
                    BinOp::Gte => OpCode::Gte,
                    BinOp::Gt => OpCode::Gt,
                    BinOp::Lte => OpCode::Lte,
                    BinOp::Lt => OpCode::Lt,
                    BinOp::Match => OpCode::Match,
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Sub,
                    BinOp::Mul => OpCode::Mul,
                    BinOp::Div => OpCode::Div,
                    BinOp::Mod => OpCode::Mod,
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                };
                self.emit(Instr::new(opc));
            }
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Node<'_>,
        then_branch: &[&Node<'_>],
        else_branch: &[&Node<'_>],
    ) -> CResult<()> {
        self.compile_expr_single(cond)?;
        let jf = self.emit(Instr::new(OpCode::JFalse));
        self.compile_value_block(then_branch)?;
        let jend = self.emit(Instr::new(OpCode::Jmp));
        let else_ip = self.here();
        self.patch(jf, else_ip);
        self.compile_value_block(else_branch)?;
        let end = self.here();
        self.patch(jend, end);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Node<'_>, body: &[&Node<'_>]) -> CResult<()> {
        self.emit(Instr::new(OpCode::Mark));
        let loop_ip = self.emit(Instr::new(OpCode::Loop));
        let begin = self.here();
        self.compile_expr_single(cond)?;
        let jf = self.emit(Instr::new(OpCode::JFalse));
        self.compile_discard_block(body)?;
        let jmp = self.emit(Instr::new(OpCode::Jmp));
        self.patch(jmp, begin);
        let end = self.here();
        self.patch(loop_ip, end);
        self.patch(jf, end);
        self.emit(Instr::new(OpCode::Unloop));
        self.emit(Instr::with_imm(OpCode::Limit, Item::Int(0)));
        self.emit(Instr::new(OpCode::Nil));
        Ok(())
    }

    fn compile_for(&mut self, vars: &[&str], iter: &Node<'_>, body: &[&Node<'_>]) -> CResult<()> {
        let names: Vec<StrHandle> = vars.iter().map(|n| self.intern(n)).collect();
        let slot = self.code.for_names.len();
        self.code.for_names.push(names);

        self.emit(Instr::new(OpCode::Mark));
        self.compile_expr_single(iter)?;
        let loop_ip = self.emit(Instr::new(OpCode::Loop));
        let begin = self.here();
        let for_ip = self.emit(Instr::with_cache(OpCode::For, slot as i32));
        self.jump_targets.insert(for_ip);
        self.compile_discard_block(body)?;
        let jmp = self.emit(Instr::new(OpCode::Jmp));
        self.patch(jmp, begin);
        let end = self.here();
        self.patch(loop_ip, end);
        self.code.instrs[for_ip].imm = Item::Int(end as i64);
        self.emit(Instr::new(OpCode::Unloop));
        self.emit(Instr::with_imm(OpCode::Limit, Item::Int(0)));
        self.emit(Instr::new(OpCode::Nil));
        Ok(())
    }

    /// `a[,b...] = x[,y...]` (§4.D). The assignment's value is its last
    /// RHS value, stashed aside before targets (processed in reverse, so
    /// each pop lines up positionally) consume the rest.
    fn compile_assign(&mut self, targets: &[&Node<'_>], values: &[&Node<'_>]) -> CResult<()> {
        self.emit(Instr::new(OpCode::Mark));
        self.compile_value_list(values)?;
        self.emit(Instr::with_imm(OpCode::Limit, Item::Int(targets.len() as i64)));
        self.emit(Instr::new(OpCode::Copy));
        self.emit(Instr::new(OpCode::Shunt));
        for target in targets.iter().rev() {
            self.compile_assign_target(target)?;
        }
        self.emit(Instr::new(OpCode::Shift));
        Ok(())
    }

    /// Consume the current top-of-stack value as the assigned value for
    /// one target.
    fn compile_assign_target(&mut self, target: &Node<'_>) -> CResult<()> {
        match &target.kind {
            NodeKind::Name(n) => {
                let handle = self.intern(n);
                self.emit(Instr::with_imm(OpCode::Assign, Item::Str(handle)));
                self.emit(Instr::new(OpCode::Drop));
            }
            NodeKind::Global(n) => {
                // Sugar for `<globals>["name"] = value`: reuses the same
                // Shunt/Shift/Set/Drop shape as an index target below, with
                // `Global` standing in for the base expression.
                let handle = self.intern(n);
                self.emit(Instr::new(OpCode::Shunt));
                self.emit(Instr::new(OpCode::Global));
                self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
                self.emit(Instr::new(OpCode::Shift));
                self.emit(Instr::new(OpCode::Set));
                self.emit(Instr::new(OpCode::Drop));
            }
            NodeKind::Index { target: base, index } => {
                // `Set` wants [base, index, value] with value on top;
                // the value is already on the stack, so stash it, push
                // base/index, then bring it back to the top.
                self.emit(Instr::new(OpCode::Shunt));
                self.compile_expr_single(base)?;
                self.compile_expr_single(index)?;
                self.emit(Instr::new(OpCode::Shift));
                self.emit(Instr::new(OpCode::Set));
                // `Set` leaves `base` on the stack; this is a statement
                // target, not a map-literal entry, so drop it.
                self.emit(Instr::new(OpCode::Drop));
            }
            NodeKind::Field {
                target: base,
                name,
                is_method: false,
            } => {
                self.emit(Instr::new(OpCode::Shunt));
                self.compile_expr_single(base)?;
                let handle = self.intern(name);
                self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
                self.emit(Instr::new(OpCode::Shift));
                self.emit(Instr::new(OpCode::Set));
                self.emit(Instr::new(OpCode::Drop));
            }
            _ => {
                return Err(self.err(target.pos, "cannot assign to this expression"));
            }
        }
        Ok(())
    }

    /// `coroutine`/`resume`/`yield` are recognized as intrinsics when
    /// called through a bare, unshadowed name (§4.G). All other calls
    /// go through the call-site cache (§4.E "Call-site cache").
    fn compile_call(&mut self, callee: &Node<'_>, args: &[&Node<'_>]) -> CResult<()> {
        if let NodeKind::Name(n) = callee.kind {
            match n {
                "coroutine" => {
                    self.emit(Instr::new(OpCode::Mark));
                    self.compile_value_list(args)?;
                    self.emit(Instr::new(OpCode::Coroutine));
                    return Ok(());
                }
                "resume" => {
                    self.emit(Instr::new(OpCode::Mark));
                    self.compile_value_list(args)?;
                    self.emit(Instr::new(OpCode::Resume));
                    return Ok(());
                }
                "yield" => {
                    self.emit(Instr::new(OpCode::Mark));
                    self.compile_value_list(args)?;
                    self.emit(Instr::new(OpCode::Yield));
                    return Ok(());
                }
                "type" | "assert" | "sort" | "setmeta" | "getmeta" | "collect" => {
                    let opc = match n {
                        "type" => OpCode::Type,
                        "assert" => OpCode::Assert,
                        "sort" => OpCode::Sort,
                        "setmeta" => OpCode::MetaSet,
                        "getmeta" => OpCode::MetaGet,
                        "collect" => OpCode::Gc,
                        _ => unreachable!(),
                    };
                    self.emit(Instr::new(OpCode::Mark));
                    self.compile_value_list(args)?;
                    self.emit(Instr::new(opc));
                    return Ok(());
                }
                _ => {}
            }
        }

        if let NodeKind::Field {
            target,
            name,
            is_method: true,
        } = &callee.kind
        {
            // `recv:name(args)` pushes `recv` as the call's first
            // argument (§4.D postfix chains). The receiver is evaluated
            // once, duplicated, stashed aside while the rest of the
            // args are pushed, then brought back to resolve the method
            // so it ends up last (where `Call` expects the callee).
            self.emit(Instr::new(OpCode::Mark));
            self.compile_expr_single(target)?;
            self.emit(Instr::new(OpCode::Copy));
            self.emit(Instr::new(OpCode::Shunt));
            self.compile_value_list(args)?;
            self.emit(Instr::new(OpCode::Shift));
            let handle = self.intern(name);
            self.emit(Instr::with_imm(OpCode::Lit, Item::Str(handle)));
            self.emit(Instr::new(OpCode::Get));
            self.emit(Instr::new(OpCode::Call));
            return Ok(());
        }

        self.emit(Instr::new(OpCode::Mark));
        self.compile_value_list(args)?;

        if let NodeKind::Name(n) = callee.kind {
            let handle = self.intern(n);
            let slot = self.alloc_cfunc_slot();
            self.emit(Instr::full(OpCode::CFunc, Item::Str(handle), slot));
        } else {
            self.compile_expr_single(callee)?;
            self.emit(Instr::new(OpCode::Call));
        }
        Ok(())
    }

    fn compile_function(
        &mut self,
        pos: SourcePos,
        name: Option<&str>,
        params: &[&str],
        body: &[&Node<'_>],
        scope_id: &std::cell::Cell<u32>,
    ) -> CResult<()> {
        let my_id = self.next_scope_id;
        self.next_scope_id += 1;
        scope_id.set(my_id);

        let parent_path = self.function_scope.last().cloned().unwrap_or_else(|| vec![0]);
        let mut my_path = vec![my_id];
        my_path.extend(parent_path);
        if my_path.len() > MAX_SCOPE_DEPTH {
            return Err(self.err(pos, "function nesting too deep"));
        }

        let jmp_over = self.emit(Instr::new(OpCode::Jmp));
        let entry = self.here();

        let param_handles: Vec<StrHandle> = params.iter().map(|p| self.intern(p)).collect();

        // Params and every distinct name the body assigns (`Assign` to a
        // bare `Name`, a `for` induction variable, or a nested `function
        // name`) all land in this frame's flat locals table (§4.F), so the
        // MAX_LOCALS budget is checked against their union, not params alone.
        let mut local_names: HashSet<&str> = params.iter().copied().collect();
        for stmt in body {
            collect_locals(stmt, &mut local_names);
        }
        if local_names.len() > MAX_LOCALS {
            return Err(self.err(pos, "too many locals"));
        }
        self.code.param_names.insert(entry, param_handles);
        self.code.scope_paths.insert(entry, my_path.clone());

        self.function_scope.push(my_path);
        self.compile_discard_block(body)?;
        self.function_scope.pop();

        self.emit(Instr::new(OpCode::Nil));
        self.emit(Instr::new(OpCode::Return));
        let after = self.here();
        self.patch(jmp_over, after);

        self.emit(Instr::with_imm(OpCode::Lit, Item::Sub(entry)));

        if let Some(name) = name {
            let handle = self.intern(name);
            self.emit(Instr::with_imm(OpCode::Assign, Item::Str(handle)));
        }
        Ok(())
    }
}

/// Walk a function body collecting every name that will occupy a slot in
/// the enclosing frame's locals table (§4.F "Locals table"): `Assign`
/// targets that are a bare `Name`, `for` induction variables, and nested
/// `function name ... end` statements (the assignment of the function
/// value to `name` happens in *this* frame, not the nested one). Does not
/// descend into a nested function's own body — that function gets its own
/// frame and its own MAX_LOCALS budget.
fn collect_locals<'a>(node: &Node<'a>, names: &mut HashSet<&'a str>) {
    match &node.kind {
        NodeKind::Assign { targets, values } => {
            for t in targets.iter() {
                if let NodeKind::Name(n) = t.kind {
                    names.insert(n);
                }
                collect_locals(t, names);
            }
            for v in values.iter() {
                collect_locals(v, names);
            }
        }
        NodeKind::Function { name, .. } => {
            if let Some(n) = name {
                names.insert(n);
            }
        }
        NodeKind::For { vars, iter, body } => {
            for v in vars.iter() {
                names.insert(v);
            }
            collect_locals(iter, names);
            for b in body.iter() {
                collect_locals(b, names);
            }
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_locals(cond, names);
            for b in then_branch.iter() {
                collect_locals(b, names);
            }
            for b in else_branch.iter() {
                collect_locals(b, names);
            }
        }
        NodeKind::While { cond, body } => {
            collect_locals(cond, names);
            for b in body.iter() {
                collect_locals(b, names);
            }
        }
        NodeKind::Binary(_, l, r) => {
            collect_locals(l, names);
            collect_locals(r, names);
        }
        NodeKind::Unary(_, e) => collect_locals(e, names),
        NodeKind::Call { callee, args } => {
            collect_locals(callee, names);
            for a in args.iter() {
                collect_locals(a, names);
            }
        }
        NodeKind::Index { target, index } => {
            collect_locals(target, names);
            collect_locals(index, names);
        }
        NodeKind::Field { target, .. } => collect_locals(target, names),
        NodeKind::Vector(items) => {
            for i in items.iter() {
                collect_locals(i, names);
            }
        }
        NodeKind::Map(entries) => {
            for (k, v) in entries.iter() {
                if let MapKey::Expr(e) = k {
                    collect_locals(e, names);
                }
                collect_locals(v, names);
            }
        }
        NodeKind::Return(values) => {
            for v in values.iter() {
                collect_locals(v, names);
            }
        }
        NodeKind::Str(parts) => {
            for p in parts.iter() {
                if let StringPart::Expr(e) = p {
                    collect_locals(e, names);
                }
            }
        }
        NodeKind::Nil
        | NodeKind::True
        | NodeKind::False
        | NodeKind::Int(_)
        | NodeKind::Float(_)
        | NodeKind::Name(_)
        | NodeKind::Global(_)
        | NodeKind::Break
        | NodeKind::Continue => {}
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
