// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! The bytecode VM (§4.F "Execution", §4.G "Coroutines", §4.I "Embedding").
//!
//! [`Vm`] owns the heap, the compiled [`crate::compiler::Code`], the
//! `core`/`global` scopes, the native-callback registry and the routine
//! (coroutine) chain. Everything runs single-threaded and cooperatively:
//! exactly one coroutine is ever "active" ([`Vm::routines`]'s top), and
//! [`Vm::step`] is the single dispatch loop every other piece of control
//! flow — `run`, `resume`, a `for` over a coroutine or callable — drives.

pub mod heap;
pub mod coroutine;
mod gc;
mod meta;
mod native;

use crate::compiler::opcode::{Instr, OpCode, UpdateOp};
use crate::compiler::{Code, Compiler};
use crate::error::{Error, Result};
use crate::intern::StrHandle;
use crate::pool::PoolIndex;
use crate::value::{ops, Item};
use coroutine::{Coroutine, CoroutineState, Frame, LoopState};
use heap::Heap;
use std::any::Any;
use std::collections::HashMap;

pub use native::NativeFn;

/// Host-tunable knobs (§SPEC_FULL "Configuration"). `Default` matches
/// the most restrictive embedding posture: no filesystem access.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Gates the `slurp` builtin (SPEC_FULL.md "Supplemented features").
    pub allow_filesystem: bool,
    /// Emits a `tracing` event per dispatched opcode; off by default,
    /// expensive, meant for interpreter debugging rather than scripts.
    pub trace_opcodes: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            allow_filesystem: false,
            trace_opcodes: false,
        }
    }
}

enum StepOutcome {
    Continue,
    /// The main routine (routines[0]) finished; `run` should stop.
    Halted,
}

pub struct Vm {
    heap: Heap,
    code: Code,
    module_names: Vec<String>,
    core: HashMap<StrHandle, Item>,
    global: PoolIndex,
    routines: Vec<PoolIndex>,
    natives: Vec<Option<NativeFn>>,
    native_index: HashMap<String, usize>,
    cfunc_cache: Vec<Option<Item>>,
    custom: Option<Box<dyn Any>>,
    config: VmConfig,
    print_sink: Option<Box<dyn FnMut(&str)>>,
    /// Carried only so an in-flight error can be attributed to an ip;
    /// set at the top of every `step`.
    current_ip: usize,
    /// Values handed from a finishing/yielding coroutine to whichever
    /// `resume` drove it, consumed immediately by [`Vm::resume_sync`].
    pending_transfer: Vec<Item>,
}

impl Vm {
    /// Compile a single module and build a fresh VM for it (§4.I
    /// "create"). Interning is promoted to the old region once
    /// compilation finishes so bytecode literals survive every later GC.
    pub fn create(source: &str) -> Result<Self> {
        Self::create_modules(&[("main", source)])
    }

    /// Compile several named modules into one shared `Code`, in
    /// registration order (§SPEC_FULL "multi-module embedding" —
    /// later modules may call into earlier ones by name).
    pub fn create_modules(modules: &[(&str, &str)]) -> Result<Self> {
        let mut heap = Heap::new();
        let mut code = Code::new();
        let mut next_scope_id = 1u32;
        let mut jump_targets = std::collections::HashSet::new();
        let mut module_names = Vec::new();

        for (i, (name, src)) in modules.iter().enumerate() {
            tracing::debug!(module = %name, bytes = src.len(), "loading module");
            let arena = bumpalo::Bump::new();
            let mut parser = crate::parser::Parser::new(src, &arena)?;
            let program = parser.parse_program()?;
            let mut compiler = Compiler::resume(&mut heap, src, code, next_scope_id, jump_targets);
            compiler.compile_module(program)?;
            module_names.push((*name).to_string());
            if i + 1 == modules.len() {
                code = compiler.into_code();
            } else {
                let (c, n, jt) = compiler.into_parts();
                code = c;
                next_scope_id = n;
                jump_targets = jt;
            }
        }
        heap.strings.promote();

        let global = heap.alloc_map();
        let mut vm = Self {
            heap,
            code,
            module_names,
            core: HashMap::new(),
            global,
            routines: Vec::new(),
            natives: Vec::new(),
            native_index: HashMap::new(),
            cfunc_cache: Vec::new(),
            custom: None,
            config: VmConfig::default(),
            print_sink: None,
            current_ip: 0,
            pending_transfer: Vec::new(),
        };
        native::install_core(&mut vm);
        Ok(vm)
    }

    #[must_use]
    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: VmConfig) {
        self.config = config;
    }

    // ---- host embedding surface (§4.I) ----

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Register (or replace) a native callback under `name` in `core`,
    /// so scripts can call it like any other name (§4.I, §6).
    pub fn register(&mut self, name: &str, f: NativeFn) {
        let idx = if let Some(&existing) = self.native_index.get(name) {
            self.natives[existing] = Some(f);
            existing
        } else {
            let idx = self.natives.len();
            self.natives.push(Some(f));
            self.native_index.insert(name.to_string(), idx);
            idx
        };
        let handle = self.heap.intern(name);
        self.core.insert(handle, Item::Callback(idx));
    }

    /// Plant an arbitrary value under `name` in `core`, the way
    /// [`Vm::register`] plants a [`Item::Callback`] — used for `lib`,
    /// which is a plain `Item::Map` rather than a callable.
    pub(crate) fn register_value(&mut self, name: &str, value: Item) {
        let handle = self.heap.intern(name);
        self.core.insert(handle, value);
    }

    pub(crate) fn lookup_core(&mut self, name: &str) -> Option<Item> {
        let handle = self.heap.intern(name);
        self.core.get(&handle).copied()
    }

    pub(crate) fn map_set_entry(&mut self, map: Item, key: Item, value: Item) {
        let Item::Map(idx) = map else { return };
        self.with_map_mut(idx, |m, heap| m.set(key, value, |a, b| ops::less(heap, a, b)));
    }

    pub fn set_custom<T: Any>(&mut self, value: T) {
        self.custom = Some(Box::new(value));
    }

    #[must_use]
    pub fn custom<T: Any>(&self) -> Option<&T> {
        self.custom.as_deref().and_then(<dyn Any>::downcast_ref)
    }

    pub fn custom_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.custom.as_deref_mut().and_then(<dyn Any>::downcast_mut)
    }

    /// Redirect `print`'s output; without a sink it goes to stdout.
    pub fn set_print_sink(&mut self, sink: Box<dyn FnMut(&str)>) {
        self.print_sink = Some(sink);
    }

    pub(crate) fn emit_print(&mut self, line: &str) {
        if let Some(sink) = &mut self.print_sink {
            sink(line);
        } else {
            println!("{line}");
        }
    }

    pub(crate) fn global_index(&self) -> PoolIndex {
        self.global
    }

    pub(crate) fn core_values(&self) -> Vec<Item> {
        self.core.values().copied().collect()
    }

    pub(crate) fn routines(&self) -> &[PoolIndex] {
        &self.routines
    }

    /// Run mark-and-sweep collection now (§4.H, the `collect()` builtin
    /// and host-driven equivalent).
    pub fn collect(&mut self) {
        gc::collect(self);
    }

    /// Construct an `Item::Vector` the host can then populate.
    pub fn make_vector(&mut self) -> Item {
        Item::Vector(self.heap.alloc_vector())
    }

    pub fn make_map(&mut self) -> Item {
        Item::Map(self.heap.alloc_map())
    }

    pub fn make_string(&mut self, s: &str) -> Item {
        Item::Str(self.heap.intern(s))
    }

    pub fn make_userdata<T: Any>(&mut self, data: T) -> Item {
        Item::UserData(self.heap.alloc_userdata(Box::new(data)))
    }

    #[must_use]
    pub fn display(&self, item: Item) -> String {
        ops::display(&self.heap, item)
    }

    // ---- run ----

    /// Run the module registered at index `module` (§4.I). Resets
    /// per-run state first: routines, `global`, and the call-site cache
    /// (§7 "resets per-run state on error"; here, on every run).
    pub fn run(&mut self, module: usize) -> Result<()> {
        let &start = self
            .code
            .module_starts
            .get(module)
            .ok_or_else(|| Error::host(format!("no module at index {module}"), -1))?;
        self.reset_for_run(start);
        loop {
            match self.step() {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Halted) => return Ok(()),
                Err(e) => {
                    self.routines.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Run every registered module in order (§4.I multi-module form).
    pub fn run_all(&mut self) -> Result<()> {
        for i in 0..self.code.module_starts.len() {
            self.run(i)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn module_index(&self, name: &str) -> Option<usize> {
        self.module_names.iter().position(|n| n == name)
    }

    fn reset_for_run(&mut self, start: usize) {
        self.cfunc_cache = vec![None; self.code.cfunc_slots];
        self.global = self.heap.alloc_map();
        let mut main = Coroutine::new(start);
        main.frames.push(Frame::new(0, 0, 0, usize::MAX, vec![0]));
        main.state = CoroutineState::Running;
        self.heap.coroutines = crate::pool::Pool::new();
        let idx = self.heap.alloc_coroutine(main);
        self.routines = vec![idx];
    }

    /// Render the compiled bytecode for `-d`/decompile purposes (§6 CLI
    /// contract): one line per instruction, `NNNN  CACHE  OPCODE  LITERAL`.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, instr) in self.code.instrs.iter().enumerate() {
            let lit = if matches!(instr.imm, Item::Nil) {
                String::new()
            } else {
                ops::display(&self.heap, instr.imm)
            };
            out.push_str(&format!("{i:04}  {:>5}  {:?}  {lit}\n", instr.cache, instr.op));
        }
        out
    }

    // ---- coroutine/frame plumbing ----

    fn active_idx(&self) -> PoolIndex {
        *self.routines.last().expect("at least one active routine")
    }

    fn coro(&self) -> &Coroutine {
        self.heap
            .coroutines
            .get(self.active_idx())
            .expect("active routine index always valid")
    }

    fn coro_mut(&mut self) -> &mut Coroutine {
        let idx = self.active_idx();
        self.heap
            .coroutines
            .get_mut(idx)
            .expect("active routine index always valid")
    }

    fn type_err(&self, message: impl Into<String>) -> Error {
        Error::type_error(message, self.current_ip as i64)
    }

    fn name_err(&self, message: impl Into<String>) -> Error {
        Error::name(message, self.current_ip as i64)
    }

    fn runtime_err(&self, message: impl Into<String>) -> Error {
        Error::runtime(message, self.current_ip as i64)
    }

    /// Scan the active frame's locals, then ancestor call-stack frames
    /// whose scope id appears in the active frame's scope-id path
    /// (§4.E "Scope and upvalues" — this is deliberately the dynamic
    /// call stack, not a lexical chain: an upvalue only resolves if its
    /// defining function is still on the stack), then `global`, then
    /// `core`.
    fn resolve_name(&self, name: StrHandle) -> Result<Item> {
        let coro = self.coro();
        if let Some(frame) = coro.frames.last() {
            if let Some(v) = frame.find_local(name) {
                return Ok(v);
            }
            let path = &frame.scope_path;
            for ancestor in coro.frames[..coro.frames.len() - 1].iter().rev() {
                let aid = ancestor.scope_path.first().copied().unwrap_or(0);
                if path[1..].contains(&aid) {
                    if let Some(v) = ancestor.find_local(name) {
                        return Ok(v);
                    }
                }
            }
        }
        let global = self
            .heap
            .maps
            .get(self.global)
            .map(|m| m.get(Item::Str(name), |a, b| ops::less(&self.heap, a, b)))
            .unwrap_or(Item::Nil);
        if !global.is_nil() {
            return Ok(global);
        }
        if let Some(&v) = self.core.get(&name) {
            return Ok(v);
        }
        Err(self.name_err(format!("unresolved name '{}'", self.heap.resolve(name))))
    }

    fn assign_name(&mut self, name: StrHandle, value: Item) {
        self.coro_mut()
            .frames
            .last_mut()
            .expect("bootstrap frame always present while running")
            .assign_local(name, value);
    }

    fn with_map_mut<R>(&mut self, idx: PoolIndex, f: impl FnOnce(&mut crate::container::MapObj, &Heap) -> R) -> Option<R> {
        let mut obj = std::mem::replace(self.heap.maps.get_mut(idx)?, crate::container::MapObj::new());
        let r = f(&mut obj, &self.heap);
        *self.heap.maps.get_mut(idx).expect("slot still allocated") = obj;
        Some(r)
    }

    fn with_vector_mut<R>(&mut self, idx: PoolIndex, f: impl FnOnce(&mut crate::container::VectorObj, &Heap) -> R) -> Option<R> {
        let mut obj = std::mem::replace(self.heap.vectors.get_mut(idx)?, crate::container::VectorObj::new());
        let r = f(&mut obj, &self.heap);
        *self.heap.vectors.get_mut(idx).expect("slot still allocated") = obj;
        Some(r)
    }

    pub(crate) fn get_meta(&self, obj: Item) -> Item {
        match obj {
            Item::Vector(v) => self.heap.vectors.get(v).map_or(Item::Nil, |v| v.meta),
            Item::Map(m) => self.heap.maps.get(m).map_or(Item::Nil, |m| m.meta),
            Item::UserData(u) => self.heap.userdata.get(u).map_or(Item::Nil, |u| u.meta),
            _ => Item::Nil,
        }
    }

    pub(crate) fn set_meta(&mut self, obj: Item, meta: Item) -> Result<()> {
        match obj {
            Item::Vector(v) => {
                if let Some(v) = self.heap.vectors.get_mut(v) {
                    v.meta = meta;
                }
            }
            Item::Map(m) => {
                if let Some(m) = self.heap.maps.get_mut(m) {
                    m.meta = meta;
                }
            }
            Item::UserData(u) => {
                if let Some(u) = self.heap.userdata.get_mut(u) {
                    u.meta = meta;
                }
            }
            _ => return Err(self.type_err("setmeta target must be a vector, map or userdata")),
        }
        Ok(())
    }

    pub(crate) fn sort_vector(&mut self, idx: PoolIndex) {
        self.with_vector_mut(idx, |vec, heap| vec.sort_by(|a, b| ops::less(heap, a, b)));
    }

    /// `lib.resume`'s entry point: identical to the `RESUME` opcode but
    /// callable as a plain value from host or native-function code.
    pub(crate) fn resume_from_native(&mut self, idx: PoolIndex, extra: Vec<Item>) -> Result<Vec<Item>> {
        self.resume_sync(idx, extra)
    }

    // ---- calling ----

    /// Synchronously invoke `callee` with `args` and collect its
    /// results, used by meta-method dispatch and `for` over a plain
    /// callable (§4.C, §4.F). Mirrors the bytecode `Mark;args;Call`
    /// shape but driven from host code instead of the instruction
    /// stream.
    fn call_value_sync(&mut self, callee: Item, args: Vec<Item>) -> Result<Vec<Item>> {
        let idx = self.active_idx();
        let mark_base = self.coro().stack.len();
        self.coro_mut().marks.push(mark_base);
        self.coro_mut().stack.extend(args);
        match callee {
            Item::Sub(entry) => {
                let pre_len = self.coro().frames.len();
                // `enter_subroutine` shares this routine's `ip`, unlike
                // `resume_sync`'s routine switch, so the nested stepping
                // below clobbers it; restore it once the call unwinds.
                let saved_ip = self.coro().ip;
                self.enter_subroutine(entry, mark_base)?;
                loop {
                    if self.heap.coroutines.get(idx).map(|c| c.frames.len()).unwrap_or(0) <= pre_len {
                        break;
                    }
                    match self.step()? {
                        StepOutcome::Continue => {}
                        StepOutcome::Halted => break,
                    }
                }
                self.coro_mut().ip = saved_ip;
            }
            Item::Callback(slot) => self.invoke_native(slot, mark_base)?,
            _ => return Err(self.type_err(format!("value of type {} is not callable", callee.type_name()))),
        }
        self.coro_mut().marks.pop();
        let coro = self.coro_mut();
        Ok(coro.stack.split_off(mark_base))
    }

    /// Bind `entry`'s declared parameters from `stack[mark_base..]` into
    /// a fresh frame and jump there (the `CALL`/`CFunc` opcode shape,
    /// §4.F "Frames").
    fn enter_subroutine(&mut self, entry: usize, mark_base: usize) -> Result<()> {
        let params = self.code.param_names.get(&entry).cloned().unwrap_or_default();
        let scope_path = self.code.scope_paths.get(&entry).cloned().unwrap_or_else(|| vec![0]);
        let args = self.coro_mut().stack.split_off(mark_base);
        let marks_depth = self.coro().marks.len();
        let loops_depth = self.coro().loops.len();
        let maps_depth = self.coro().maps.len();
        let mut frame = Frame::new(marks_depth, loops_depth, maps_depth, 0, scope_path);
        for (i, &p) in params.iter().enumerate() {
            frame.assign_local(p, args.get(i).copied().unwrap_or(Item::Nil));
        }
        self.coro_mut().frames.push(frame);
        self.coro_mut().ip = entry;
        Ok(())
    }

    fn invoke_native(&mut self, slot: usize, mark_base: usize) -> Result<()> {
        let args = self.coro_mut().stack.split_off(mark_base);
        let f = self.natives[slot].take();
        let Some(f) = f else {
            return Err(self.runtime_err("native callback slot is already in use (reentrant call)"));
        };
        let result = f(self, &args);
        self.natives[slot] = Some(f);
        let results = result?;
        self.coro_mut().stack.extend(results);
        Ok(())
    }

    /// The `resume(c, ...)` opcode and `for x in coroutine` both need
    /// "run until this routine yields or finishes, then hand back the
    /// transferred values" — implemented by switching the active
    /// routine and driving the very same dispatch loop recursively.
    fn resume_sync(&mut self, idx: PoolIndex, extra: Vec<Item>) -> Result<Vec<Item>> {
        let state = self
            .heap
            .coroutines
            .get(idx)
            .map(|c| c.state)
            .ok_or_else(|| self.type_err("resume target is not a live coroutine"))?;
        if state == CoroutineState::Dead {
            return Ok(vec![Item::Nil]);
        }
        if state == CoroutineState::Running {
            return Err(self.runtime_err("coroutine is already running"));
        }
        let before_len = self.routines.len();
        let has_started = self.heap.coroutines.get(idx).is_some_and(|c| c.has_started);
        if !has_started {
            let start_ip = self.heap.coroutines.get(idx).map(|c| c.ip).unwrap_or(0);
            let params = self.code.param_names.get(&start_ip).cloned().unwrap_or_default();
            let scope_path = self.code.scope_paths.get(&start_ip).cloned().unwrap_or_else(|| vec![0]);
            let mut frame = Frame::new(0, 0, 0, usize::MAX, scope_path);
            for (i, &p) in params.iter().enumerate() {
                frame.assign_local(p, extra.get(i).copied().unwrap_or(Item::Nil));
            }
            let c = self.heap.coroutines.get_mut(idx).expect("checked above");
            c.has_started = true;
            c.frames.push(frame);
        } else {
            self.heap.coroutines.get_mut(idx).expect("checked above").stack.extend(extra);
        }
        self.heap.coroutines.get_mut(idx).expect("checked above").state = CoroutineState::Running;
        self.routines.push(idx);

        loop {
            if self.routines.len() <= before_len {
                break;
            }
            match self.step()? {
                StepOutcome::Continue => {}
                StepOutcome::Halted => break,
            }
        }
        Ok(std::mem::take(&mut self.pending_transfer))
    }

    // ---- for-loops (§4.F) ----

    fn for_step(&mut self, for_ip: usize, slot: usize, names: &[StrHandle], end_ip: i64) -> Result<()> {
        let iterable = *self
            .coro()
            .stack
            .last()
            .ok_or_else(|| self.runtime_err("for: missing iterable on stack"))?;
        let step = self.coro().loops.last().map(|l| l.step).unwrap_or(0);

        enum Outcome {
            Bind(Vec<Item>),
            Stop,
        }
        let outcome = match iterable {
            Item::Int(n) => {
                if step >= n {
                    Outcome::Stop
                } else {
                    Outcome::Bind(vec![Item::Int(step)])
                }
            }
            Item::Vector(v) => {
                let len = self.heap.vectors.get(v).map_or(0, |v| v.len() as i64);
                if step >= len {
                    Outcome::Stop
                } else {
                    let value = self.heap.vectors.get(v).and_then(|v| v.get(step)).unwrap_or(Item::Nil);
                    if names.len() >= 2 {
                        Outcome::Bind(vec![Item::Int(step), value])
                    } else {
                        Outcome::Bind(vec![value])
                    }
                }
            }
            Item::Map(m) => {
                let len = self.heap.maps.get(m).map_or(0, |m| m.len() as i64);
                if step >= len {
                    Outcome::Stop
                } else {
                    let (k, v) = self
                        .heap
                        .maps
                        .get(m)
                        .and_then(|m| m.entry_at(step as usize))
                        .unwrap_or((Item::Nil, Item::Nil));
                    if names.len() >= 2 {
                        Outcome::Bind(vec![k, v])
                    } else {
                        Outcome::Bind(vec![k])
                    }
                }
            }
            Item::Coroutine(idx) => {
                let results = self.resume_sync(idx, vec![])?;
                if results.is_empty() || results[0].is_nil() {
                    Outcome::Stop
                } else {
                    Outcome::Bind(results)
                }
            }
            Item::Sub(_) | Item::Callback(_) => {
                let results = self.call_value_sync(iterable, vec![Item::Int(step)])?;
                if results.is_empty() || results[0].is_nil() {
                    Outcome::Stop
                } else {
                    Outcome::Bind(results)
                }
            }
            _ => return Err(self.type_err(format!("cannot iterate a {}", iterable.type_name()))),
        };

        match outcome {
            Outcome::Stop => {
                self.coro_mut().ip = end_ip as usize;
            }
            Outcome::Bind(values) => {
                for (i, &name) in names.iter().enumerate() {
                    let v = values.get(i).copied().unwrap_or(Item::Nil);
                    self.assign_name(name, v);
                }
                if let Some(loop_state) = self.coro_mut().loops.last_mut() {
                    loop_state.step += 1;
                }
                let _ = for_ip;
                let _ = slot;
            }
        }
        Ok(())
    }

    // ---- the dispatch loop ----

    fn step(&mut self) -> Result<StepOutcome> {
        let ip = self.coro().ip;
        self.current_ip = ip;
        let instr = *self
            .code
            .instrs
            .get(ip)
            .ok_or_else(|| self.runtime_err(format!("ip {ip} out of bounds")))?;
        self.coro_mut().ip = ip + 1;
        if self.config.trace_opcodes {
            tracing::trace!(ip, op = ?instr.op, "dispatch");
        }
        self.dispatch(instr)
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, instr: Instr) -> Result<StepOutcome> {
        use OpCode::*;
        match instr.op {
            Mark => {
                let depth = self.coro().stack.len();
                self.coro_mut().marks.push(depth);
            }
            Clean => {
                let base = self.coro_mut().marks.pop().unwrap_or(0);
                self.coro_mut().stack.truncate(base);
            }
            Limit => {
                let n = match instr.imm {
                    Item::Int(n) => n,
                    _ => -1,
                };
                let base = self.coro_mut().marks.pop().unwrap_or(0);
                if n >= 0 {
                    let target = base + n as usize;
                    let coro = self.coro_mut();
                    if coro.stack.len() > target {
                        coro.stack.truncate(target);
                    } else {
                        while coro.stack.len() < target {
                            coro.stack.push(Item::Nil);
                        }
                    }
                }
            }
            Shunt => {
                let v = self
                    .coro_mut()
                    .stack
                    .pop()
                    .ok_or_else(|| self.runtime_err("stack underflow (shunt)"))?;
                self.coro_mut().other.push(v);
            }
            Shift => {
                let v = self
                    .coro_mut()
                    .other
                    .pop()
                    .ok_or_else(|| self.runtime_err("stash underflow (shift)"))?;
                self.coro_mut().stack.push(v);
            }
            Copy => {
                let v = *self
                    .coro()
                    .stack
                    .last()
                    .ok_or_else(|| self.runtime_err("stack underflow (copy)"))?;
                self.coro_mut().stack.push(v);
            }
            Drop => {
                self.coro_mut()
                    .stack
                    .pop()
                    .ok_or_else(|| self.runtime_err("stack underflow (drop)"))?;
            }
            Nil => self.coro_mut().stack.push(Item::Nil),
            True => self.coro_mut().stack.push(Item::Bool(true)),
            False => self.coro_mut().stack.push(Item::Bool(false)),
            Lit => self.coro_mut().stack.push(instr.imm),

            Jmp => {
                self.coro_mut().ip = instr.cache as usize;
            }
            JFalse => {
                let v = self.pop()?;
                if !ops::truth(&self.heap, v) {
                    self.coro_mut().ip = instr.cache as usize;
                }
            }
            JTrue => {
                let v = self.pop()?;
                if ops::truth(&self.heap, v) {
                    self.coro_mut().ip = instr.cache as usize;
                }
            }
            Loop => {
                let marks_depth = self.coro().marks.len();
                let stack_depth = self.coro().stack.len();
                let begin_ip = self.current_ip + 1;
                let end_ip = instr.cache as usize;
                self.coro_mut().loops.push(LoopState {
                    marks_depth,
                    stack_depth,
                    begin_ip,
                    end_ip,
                    step: 0,
                });
            }
            Unloop => {
                self.coro_mut().loops.pop();
            }
            Break => {
                let loop_state = self
                    .coro()
                    .loops
                    .last()
                    .cloned()
                    .ok_or_else(|| self.runtime_err("break outside a loop"))?;
                self.coro_mut().marks.truncate(loop_state.marks_depth);
                self.coro_mut().stack.truncate(loop_state.stack_depth);
                self.coro_mut().ip = loop_state.end_ip;
            }
            Continue => {
                let loop_state = self
                    .coro()
                    .loops
                    .last()
                    .cloned()
                    .ok_or_else(|| self.runtime_err("continue outside a loop"))?;
                self.coro_mut().marks.truncate(loop_state.marks_depth);
                self.coro_mut().stack.truncate(loop_state.stack_depth);
                self.coro_mut().ip = loop_state.begin_ip;
            }
            Stop => return self.finish_routine(),
            Return => return self.op_return(),
            Call => self.op_call()?,
            CFunc => self.op_cfunc(instr)?,
            For => {
                let slot = instr.cache as usize;
                let names = self.code.for_names.get(slot).cloned().unwrap_or_default();
                let end_ip = match instr.imm {
                    Item::Int(n) => n,
                    _ => self.current_ip as i64,
                };
                self.for_step(self.current_ip, slot, &names, end_ip)?;
            }
            Pid => {
                let id = self.active_idx().0 as i64;
                self.coro_mut().stack.push(Item::Int(id));
            }

            Coroutine => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                let mut args = self.coro_mut().stack.split_off(mark_base);
                if args.is_empty() {
                    return Err(self.type_err("coroutine expects a subroutine argument"));
                }
                let Item::Sub(entry) = args.remove(0) else {
                    return Err(self.type_err("coroutine expects a subroutine argument"));
                };
                let idx = self.heap.alloc_coroutine(Coroutine::new(entry));
                self.coro_mut().stack.push(Item::Coroutine(idx));
                self.coro_mut().marks.push(mark_base);
            }
            Resume => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                let mut args = self.coro_mut().stack.split_off(mark_base);
                if args.is_empty() {
                    return Err(self.type_err("resume expects a coroutine argument"));
                }
                let target = args.remove(0);
                let Item::Coroutine(idx) = target else {
                    return Err(self.type_err("resume expects a coroutine argument"));
                };
                tracing::debug!(?idx, "coroutine resume");
                let results = self.resume_sync(idx, args)?;
                self.coro_mut().stack.extend(results);
                self.coro_mut().marks.push(mark_base);
            }
            Yield => {
                let mark_base = self
                    .coro()
                    .marks
                    .last()
                    .copied()
                    .ok_or_else(|| self.runtime_err("yield outside a coroutine"))?;
                if self.routines.len() == 1 {
                    return Err(self.runtime_err("yield outside a coroutine"));
                }
                let yielded = self.coro_mut().stack.split_off(mark_base);
                self.coro_mut().state = CoroutineState::Suspended;
                self.pending_transfer = yielded;
                tracing::debug!(routine = ?self.routines.last(), "coroutine yield");
                self.routines.pop();
            }

            Assign => {
                let Item::Str(name) = instr.imm else {
                    return Err(self.runtime_err("assign: immediate is not a name"));
                };
                let v = *self
                    .coro()
                    .stack
                    .last()
                    .ok_or_else(|| self.runtime_err("stack underflow (assign)"))?;
                self.assign_name(name, v);
            }
            Find | FName => {
                let Item::Str(name) = instr.imm else {
                    return Err(self.runtime_err("find: immediate is not a name"));
                };
                let v = self.resolve_name(name)?;
                self.coro_mut().stack.push(v);
            }
            Copies => {
                let Item::Str(name) = instr.imm else {
                    return Err(self.runtime_err("copies: immediate is not a name"));
                };
                let v = self.resolve_name(name)?;
                let n = instr.cache.max(0) as usize;
                for _ in 0..n {
                    self.coro_mut().stack.push(v);
                }
            }
            Global => {
                self.coro_mut().stack.push(Item::Map(self.global));
            }
            Get => self.op_get()?,
            GName => {
                let Item::Str(name) = instr.imm else {
                    return Err(self.runtime_err("get: immediate is not a name"));
                };
                let base = self.pop()?;
                let v = self.get_item(base, Item::Str(name))?;
                self.coro_mut().stack.push(v);
            }
            Set => self.op_set()?,
            Count => {
                let v = self.pop()?;
                if let Some(r) = meta::try_unary(self, "#", v)? {
                    self.coro_mut().stack.push(r);
                } else {
                    self.coro_mut().stack.push(Item::Int(ops::count(&self.heap, v)));
                }
            }
            Add => self.binary_arith(BinArith::Add)?,
            Sub => self.binary_arith(BinArith::Sub)?,
            Mul => self.binary_arith(BinArith::Mul)?,
            Div => self.binary_arith(BinArith::Div)?,
            Mod => self.binary_arith(BinArith::Mod)?,
            AddLit => {
                let a = self.pop()?;
                let r = self.apply_arith(BinArith::Add, a, instr.imm)?;
                self.coro_mut().stack.push(r);
            }
            MulLit => {
                let a = self.pop()?;
                let r = self.apply_arith(BinArith::Mul, a, instr.imm)?;
                self.coro_mut().stack.push(r);
            }
            Neg => {
                let v = self.pop()?;
                let r = ops::negate(v).ok_or_else(|| self.type_err(format!("cannot negate a {}", v.type_name())))?;
                self.coro_mut().stack.push(r);
            }
            Not => {
                let v = self.pop()?;
                self.coro_mut().stack.push(Item::Bool(!ops::truth(&self.heap, v)));
            }
            Eq => {
                let (a, b) = self.pop2()?;
                if let Some(r) = meta::try_binary(self, "==", a, b)? {
                    self.coro_mut().stack.push(Item::Bool(ops::truth(&self.heap, r)));
                } else {
                    self.coro_mut().stack.push(Item::Bool(ops::equal(&self.heap, a, b)));
                }
            }
            Ne => {
                let (a, b) = self.pop2()?;
                let eq = if let Some(r) = meta::try_binary(self, "==", a, b)? {
                    ops::truth(&self.heap, r)
                } else {
                    ops::equal(&self.heap, a, b)
                };
                self.coro_mut().stack.push(Item::Bool(!eq));
            }
            Lt => {
                let (a, b) = self.pop2()?;
                let r = self.compare(a, b)?;
                self.coro_mut().stack.push(Item::Bool(r));
            }
            Gt => {
                let (a, b) = self.pop2()?;
                let r = self.compare(b, a)?;
                self.coro_mut().stack.push(Item::Bool(r));
            }
            Lte => {
                let (a, b) = self.pop2()?;
                let r = self.compare(b, a)?;
                self.coro_mut().stack.push(Item::Bool(!r));
            }
            Gte => {
                let (a, b) = self.pop2()?;
                let r = self.compare(a, b)?;
                self.coro_mut().stack.push(Item::Bool(!r));
            }
            Concat => {
                let (a, b) = self.pop2()?;
                let s = format!("{}{}", ops::display(&self.heap, a), ops::display(&self.heap, b));
                let handle = self.heap.intern(&s);
                self.coro_mut().stack.push(Item::Str(handle));
            }
            Unpack => {
                let v = self.pop()?;
                let Item::Vector(idx) = v else {
                    return Err(self.type_err("unpack (...) expects a vector"));
                };
                let items = self.heap.vectors.get(idx).map(|v| v.as_slice().to_vec()).unwrap_or_default();
                self.coro_mut().stack.extend(items);
            }
            And | Or => {
                return Err(self.runtime_err("and/or are compiled inline and never dispatched directly"));
            }

            Vector => {
                let idx = self.heap.alloc_vector();
                self.coro_mut().stack.push(Item::Vector(idx));
            }
            VPush => {
                let item = self.pop()?;
                let base = *self
                    .coro()
                    .stack
                    .last()
                    .ok_or_else(|| self.runtime_err("stack underflow (vpush)"))?;
                let Item::Vector(idx) = base else {
                    return Err(self.type_err("vpush target is not a vector"));
                };
                if let Some(v) = self.heap.vectors.get_mut(idx) {
                    v.push(item);
                }
            }
            Map => {
                let idx = self.heap.alloc_map();
                self.coro_mut().stack.push(Item::Map(idx));
            }
            UnMap => {
                // Every entry's `Set` leaves the map sitting at the same
                // stack slot it was pushed at (`Set` peeks, never pops,
                // its base); by the last entry the map literal has
                // already netted to exactly one value. Nothing to do.
            }
            MetaGet => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                let args = self.coro_mut().stack.split_off(mark_base);
                let obj = args.first().copied().unwrap_or(Item::Nil);
                let meta = self.get_meta(obj);
                self.coro_mut().stack.push(meta);
                self.coro_mut().marks.push(mark_base);
            }
            MetaSet => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                let args = self.coro_mut().stack.split_off(mark_base);
                let obj = args.first().copied().unwrap_or(Item::Nil);
                let meta = args.get(1).copied().unwrap_or(Item::Nil);
                self.set_meta(obj, meta)?;
                self.coro_mut().stack.push(obj);
                self.coro_mut().marks.push(mark_base);
            }
            Type => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                let args = self.coro_mut().stack.split_off(mark_base);
                let v = args.first().copied().unwrap_or(Item::Nil);
                let handle = self.heap.intern(v.type_name());
                self.coro_mut().stack.push(Item::Str(handle));
                self.coro_mut().marks.push(mark_base);
            }
            Assert => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                let args = self.coro_mut().stack.split_off(mark_base);
                let v = args.first().copied().unwrap_or(Item::Nil);
                if !ops::truth(&self.heap, v) {
                    return Err(self.runtime_err("assertion failed"));
                }
                self.coro_mut().stack.push(v);
                self.coro_mut().marks.push(mark_base);
            }
            Sort => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                let args = self.coro_mut().stack.split_off(mark_base);
                let v = args.first().copied().unwrap_or(Item::Nil);
                let Item::Vector(idx) = v else {
                    return Err(self.type_err("sort expects a vector"));
                };
                self.sort_vector(idx);
                self.coro_mut().stack.push(v);
                self.coro_mut().marks.push(mark_base);
            }
            Match => {
                let (a, b) = self.pop2()?;
                let r = self.regex_match(a, b)?;
                self.coro_mut().stack.push(Item::Bool(r));
            }
            Gc => {
                let mark_base = self.coro_mut().marks.pop().unwrap_or(0);
                self.coro_mut().stack.truncate(mark_base);
                self.collect();
                self.coro_mut().stack.push(Item::Nil);
                self.coro_mut().marks.push(mark_base);
            }

            AssignL => {
                // Never emitted by the current compiler or peephole pass
                // (see opcode.rs); `LIT k ; ASSIGN 0` folded into one
                // instruction, best-effort as a literal push so a stray
                // instance still leaves a well-defined stack.
                self.coro_mut().stack.push(instr.imm);
            }
            AssignP => {
                // `MARK ; LIT k ; ASSIGNL ; LIMIT 0` folded: statement
                // form, so nothing survives on the stack.
            }
            Update => {
                let Item::Str(name) = instr.imm else {
                    return Err(self.runtime_err("update: immediate is not a name"));
                };
                let op = UpdateOp::from_cache(instr.cache)
                    .ok_or_else(|| self.runtime_err("update: unknown update op"))?;
                let rhs = self.pop()?;
                let current = self.resolve_name(name)?;
                let result = match op {
                    UpdateOp::Add => ops::add(current, rhs),
                    UpdateOp::Sub => ops::sub(current, rhs),
                    UpdateOp::Mul => ops::mul(current, rhs),
                    UpdateOp::Div => ops::div(current, rhs),
                    UpdateOp::Mod => ops::rem(current, rhs),
                }
                .ok_or_else(|| self.type_err("update: incompatible operand types"))?;
                self.assign_name(name, result);
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn pop(&mut self) -> Result<Item> {
        self.coro_mut()
            .stack
            .pop()
            .ok_or_else(|| self.runtime_err("stack underflow"))
    }

    fn pop2(&mut self) -> Result<(Item, Item)> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn compare(&mut self, a: Item, b: Item) -> Result<bool> {
        if let Some(r) = meta::try_binary(self, "<", a, b)? {
            return Ok(ops::truth(&self.heap, r));
        }
        Ok(ops::less(&self.heap, a, b))
    }

    fn apply_arith(&mut self, kind: BinArith, a: Item, b: Item) -> Result<Item> {
        let name = kind.meta_name();
        if let Some(r) = meta::try_binary(self, name, a, b)? {
            return Ok(r);
        }
        let result = match kind {
            BinArith::Add => ops::add(a, b),
            BinArith::Sub => ops::sub(a, b),
            BinArith::Mul => ops::mul(a, b),
            BinArith::Div => ops::div(a, b),
            BinArith::Mod => ops::rem(a, b),
        };
        result.ok_or_else(|| {
            self.type_err(format!(
                "cannot apply '{name}' to {} and {}",
                a.type_name(),
                b.type_name()
            ))
        })
    }

    fn binary_arith(&mut self, kind: BinArith) -> Result<()> {
        let (a, b) = self.pop2()?;
        let r = self.apply_arith(kind, a, b)?;
        self.coro_mut().stack.push(r);
        Ok(())
    }

    fn get_item(&mut self, base: Item, key: Item) -> Result<Item> {
        match base {
            Item::Vector(idx) => {
                let Item::Int(i) = key else {
                    return Err(self.type_err("vector index must be an integer"));
                };
                Ok(self.heap.vectors.get(idx).and_then(|v| v.get(i)).unwrap_or(Item::Nil))
            }
            Item::Map(idx) => {
                let v = self
                    .heap
                    .maps
                    .get(idx)
                    .map(|m| m.get(key, |a, b| ops::less(&self.heap, a, b)))
                    .unwrap_or(Item::Nil);
                if !v.is_nil() {
                    return Ok(v);
                }
                Ok(meta::try_index(self, base, key)?.unwrap_or(Item::Nil))
            }
            Item::UserData(_) => Ok(meta::try_index(self, base, key)?.unwrap_or(Item::Nil)),
            _ => Err(self.type_err(format!("cannot index a {}", base.type_name()))),
        }
    }

    fn op_get(&mut self) -> Result<()> {
        let key = self.pop()?;
        let base = self.pop()?;
        let v = self.get_item(base, key)?;
        self.coro_mut().stack.push(v);
        Ok(())
    }

    /// `SET` (§4.F): `[base, index, value]` with `value` on top; writes
    /// into `base` at `index`/key and leaves `base` on the stack, which
    /// is exactly what both a map literal's repeated entries (base =
    /// the map being built) and an explicit assignment target (which
    /// `Drop`s it afterward) need.
    fn op_set(&mut self) -> Result<()> {
        let value = self.pop()?;
        let index = self.pop()?;
        let base = *self
            .coro()
            .stack
            .last()
            .ok_or_else(|| self.runtime_err("stack underflow (set)"))?;
        match base {
            Item::Vector(idx) => {
                let Item::Int(i) = index else {
                    return Err(self.type_err("vector index must be an integer"));
                };
                if let Some(v) = self.heap.vectors.get_mut(idx) {
                    v.set(i, value);
                }
            }
            Item::Map(idx) => {
                self.with_map_mut(idx, |m, heap| m.set(index, value, |a, b| ops::less(heap, a, b)));
            }
            _ => return Err(self.type_err(format!("cannot index-assign into a {}", base.type_name()))),
        }
        Ok(())
    }

    fn op_call(&mut self) -> Result<()> {
        let mark_base = self
            .coro()
            .marks
            .last()
            .copied()
            .ok_or_else(|| self.runtime_err("call without a mark"))?;
        let mut region = self.coro_mut().stack.split_off(mark_base);
        let callee = region
            .pop()
            .ok_or_else(|| self.runtime_err("call: missing callee"))?;
        self.coro_mut().stack.extend(region);
        match callee {
            Item::Sub(entry) => {
                let return_ip = self.current_ip + 1;
                self.enter_subroutine(entry, mark_base)?;
                self.coro_mut().frames.last_mut().expect("just pushed").return_ip = return_ip;
            }
            Item::Callback(slot) => self.invoke_native(slot, mark_base)?,
            _ => return Err(self.type_err(format!("value of type {} is not callable", callee.type_name()))),
        }
        Ok(())
    }

    fn op_cfunc(&mut self, instr: Instr) -> Result<()> {
        let slot = instr.cache as usize;
        let callee = if let Some(cached) = self.cfunc_cache.get(slot).copied().flatten() {
            cached
        } else {
            let Item::Str(name) = instr.imm else {
                return Err(self.runtime_err("cfunc: immediate is not a name"));
            };
            let resolved = self.resolve_name(name)?;
            if slot < self.cfunc_cache.len() {
                self.cfunc_cache[slot] = Some(resolved);
            }
            resolved
        };
        let mark_base = self
            .coro()
            .marks
            .last()
            .copied()
            .ok_or_else(|| self.runtime_err("call without a mark"))?;
        match callee {
            Item::Sub(entry) => {
                let return_ip = self.current_ip + 1;
                self.enter_subroutine(entry, mark_base)?;
                self.coro_mut().frames.last_mut().expect("just pushed").return_ip = return_ip;
            }
            Item::Callback(slot) => self.invoke_native(slot, mark_base)?,
            _ => return Err(self.type_err(format!("value of type {} is not callable", callee.type_name()))),
        }
        Ok(())
    }

    fn op_return(&mut self) -> Result<StepOutcome> {
        let Some(frame) = self.coro_mut().frames.pop() else {
            return self.finish_routine();
        };
        self.coro_mut().marks.truncate(frame.marks_depth);
        self.coro_mut().loops.truncate(frame.loops_depth);
        self.coro_mut().maps.truncate(frame.maps_depth);
        if self.coro().frames.is_empty() {
            self.finish_routine()
        } else {
            self.coro_mut().ip = frame.return_ip;
            Ok(StepOutcome::Continue)
        }
    }

    fn finish_routine(&mut self) -> Result<StepOutcome> {
        if self.routines.len() == 1 {
            self.coro_mut().state = CoroutineState::Dead;
            return Ok(StepOutcome::Halted);
        }
        let idx = self.routines.pop().expect("len checked above");
        let results = {
            let coro = self.heap.coroutines.get_mut(idx).expect("active routine");
            coro.state = CoroutineState::Dead;
            std::mem::take(&mut coro.stack)
        };
        self.pending_transfer = results;
        Ok(StepOutcome::Continue)
    }

    fn regex_match(&mut self, a: Item, b: Item) -> Result<bool> {
        let (Item::Str(sh), Item::Str(ph)) = (a, b) else {
            return Err(self.type_err("~ expects two strings"));
        };
        #[cfg(feature = "regex")]
        {
            let subject = self.heap.resolve(sh).to_string();
            let pattern = self.heap.resolve(ph);
            let re = regex::Regex::new(pattern).map_err(|e| self.runtime_err(format!("invalid pattern: {e}")))?;
            Ok(re.is_match(&subject))
        }
        #[cfg(not(feature = "regex"))]
        {
            let _ = (sh, ph);
            Err(self.runtime_err("the '~' match operator requires the 'regex' feature"))
        }
    }
}

#[derive(Clone, Copy)]
enum BinArith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinArith {
    fn meta_name(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }
}
