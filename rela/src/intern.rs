// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Interned string table: two regions, *old* and *young* (§4.A).
//!
//! `intern` is canonical: two calls with byte-equal input return the same
//! [`StrHandle`]. Equality on strings then reduces to handle equality,
//! which is the invariant the parser, compiler and `Item` equality all
//! lean on.
//!
//! Each region is a storage vector plus a separate sort permutation
//! (`*_order`, indices into the storage vector ordered by string value).
//! Lookups binary-search the permutation; storage indices themselves are
//! never reassigned once handed out, so a [`StrHandle`] baked into a
//! bytecode literal during compilation stays valid after [`Interner::promote`]
//! appends that generation's young strings onto `old`.

/// Which region a string lives in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Region {
    /// Survives GC; populated by promotion at the end of compilation.
    Old,
    /// Eligible for sweeping by the collector.
    Young,
}

/// A canonical handle to an interned string. `index` is stable into the
/// region's storage vector for the life of that string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StrHandle {
    pub region: Region,
    pub index: usize,
}

#[derive(Default)]
pub struct Interner {
    old: Vec<Box<str>>,
    old_order: Vec<usize>,
    young: Vec<Box<str>>,
    young_order: Vec<usize>,
}

impl Interner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn resolve(&self, handle: StrHandle) -> &str {
        match handle.region {
            Region::Old => &self.old[handle.index],
            Region::Young => &self.young[handle.index],
        }
    }

    fn search(storage: &[Box<str>], order: &[usize], s: &str) -> Result<usize, usize> {
        order.binary_search_by(|&i| storage[i].as_ref().cmp(s))
    }

    /// Intern `s`, returning the canonical handle. Old is searched first
    /// (stable across GC), then young; a miss appends to young.
    pub fn intern(&mut self, s: &str) -> StrHandle {
        if let Ok(pos) = Self::search(&self.old, &self.old_order, s) {
            return StrHandle {
                region: Region::Old,
                index: self.old_order[pos],
            };
        }
        match Self::search(&self.young, &self.young_order, s) {
            Ok(pos) => StrHandle {
                region: Region::Young,
                index: self.young_order[pos],
            },
            Err(pos) => {
                let index = self.young.len();
                self.young.push(s.into());
                self.young_order.insert(pos, index);
                StrHandle {
                    region: Region::Young,
                    index,
                }
            }
        }
    }

    /// Move every young string onto `old`, in storage order (no existing
    /// index is reassigned), then empty `young`.
    ///
    /// Called once at the end of [`crate::vm::Vm::create`] so that every
    /// literal referenced by compiled bytecode survives subsequent GC
    /// sweeps of the young region.
    pub fn promote(&mut self) {
        for young_index in self.young_order.drain(..).collect::<Vec<_>>() {
            let s = core::mem::take(&mut self.young[young_index]);
            let old_index = self.old.len();
            let pos = self
                .old_order
                .binary_search_by(|&i| self.old[i].as_ref().cmp(&s))
                .unwrap_or_else(|p| p);
            self.old.push(s);
            self.old_order.insert(pos, old_index);
        }
        self.young.clear();
        self.young_order.clear();
    }

    /// Sweep the young region, keeping only strings whose index is in
    /// `keep` (built by the collector's mark pass). Storage slots of
    /// dropped strings become empty placeholders so surviving indices
    /// don't shift.
    pub fn sweep_young(&mut self, keep: &[bool]) {
        for (i, slot) in self.young.iter_mut().enumerate() {
            if !keep.get(i).copied().unwrap_or(false) {
                *slot = Box::default();
            }
        }
        self.young_order
            .retain(|&i| keep.get(i).copied().unwrap_or(false));
    }

    #[must_use]
    pub fn young_len(&self) -> usize {
        self.young.len()
    }
}
