// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Coroutine state (§3, §4.G): a suspendable routine with its own operand
//! stack, "other" stash, frame stack, mark stack, loop stack and
//! map-construction stack, plus a program counter and run state.

use crate::intern::StrHandle;
use crate::value::Item;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CoroutineState {
    Suspended,
    Running,
    Dead,
}

/// A loop-stack entry: where the loop's induction state lives, where to
/// jump on exhaustion, and the step counter driving `for` over callables
/// and coroutines (§4.F "For-loops").
#[derive(Clone, Debug)]
pub struct LoopState {
    pub marks_depth: usize,
    /// Operand-stack depth when `Loop` dispatched, i.e. including a
    /// `for`'s iterable (pushed before `Loop`) but nothing from the body.
    /// `break`/`continue` unwind to this depth rather than the loop's
    /// own mark base, which sits one slot below the iterable.
    pub stack_depth: usize,
    /// First instruction after `Loop`; `Continue` jumps back here.
    pub begin_ip: usize,
    pub end_ip: usize,
    pub step: i64,
}

/// A call frame (§3 "Call frame", §4.E "Scope and upvalues").
#[derive(Clone, Debug)]
pub struct Frame {
    pub marks_depth: usize,
    pub loops_depth: usize,
    pub maps_depth: usize,
    pub return_ip: usize,
    /// Flat key -> value local table, bounded at [`crate::compiler::MAX_LOCALS`].
    pub locals: Vec<(StrHandle, Item)>,
    /// Compile-time scope-id path for this invocation, bounded at
    /// [`crate::compiler::MAX_SCOPE_DEPTH`]; index 0 is this function's
    /// own id, the rest are its statically enclosing functions.
    pub scope_path: Vec<u32>,
}

impl Frame {
    #[must_use]
    pub fn new(
        marks_depth: usize,
        loops_depth: usize,
        maps_depth: usize,
        return_ip: usize,
        scope_path: Vec<u32>,
    ) -> Self {
        Self {
            marks_depth,
            loops_depth,
            maps_depth,
            return_ip,
            locals: Vec::new(),
            scope_path,
        }
    }

    pub fn find_local(&self, name: StrHandle) -> Option<Item> {
        self.locals
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
    }

    pub fn assign_local(&mut self, name: StrHandle, value: Item) {
        if let Some(slot) = self.locals.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.locals.push((name, value));
        }
    }
}

pub struct Coroutine {
    pub stack: Vec<Item>,
    pub other: Vec<Item>,
    pub maps: Vec<Item>,
    pub frames: Vec<Frame>,
    pub loops: Vec<LoopState>,
    pub marks: Vec<usize>,
    pub ip: usize,
    pub state: CoroutineState,
    /// False until the first `resume` on this routine; the first resume's
    /// extra arguments bind the coroutine function's declared parameters,
    /// every later resume's arguments are just pushed for the pending
    /// `yield` expression to consume (§4.G "Coroutines").
    pub has_started: bool,
}

impl Coroutine {
    #[must_use]
    pub fn new(start_ip: usize) -> Self {
        Self {
            stack: Vec::new(),
            other: Vec::new(),
            maps: Vec::new(),
            frames: Vec::new(),
            loops: Vec::new(),
            marks: Vec::new(),
            ip: start_ip,
            state: CoroutineState::Suspended,
            has_started: false,
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, item: Item) {
        self.stack.push(item);
    }

    pub fn pop(&mut self) -> Option<Item> {
        self.stack.pop()
    }

    #[must_use]
    pub fn top(&self) -> Option<Item> {
        self.stack.last().copied()
    }

    /// Current map under construction, if any (top of the `maps` stack).
    #[must_use]
    pub fn current_map(&self) -> Option<Item> {
        self.maps.last().copied()
    }
}
