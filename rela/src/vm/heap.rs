// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! The pools and interner backing every heap-allocated `Item` (§3, §4.A).
//!
//! `Heap` is the single owner of vector, map, coroutine and userdata
//! pools plus the interned-string table. Everything that needs to look
//! *inside* a compound `Item` borrows a `&Heap` (or `&mut Heap`); `Item`
//! itself stays a cheap `Copy` handle.

use crate::container::{MapObj, VectorObj};
use crate::intern::{Interner, StrHandle};
use crate::pool::{Pool, PoolIndex};
use crate::vm::coroutine::Coroutine;
use std::any::Any;

/// Host-owned opaque data (§3 "UserData ... carries an opaque host
/// pointer"). `Box<dyn Any>` stands in for the C union's `void*`: the
/// host downcasts back to its concrete type via [`UserData::downcast_ref`].
pub struct UserData {
    pub data: Box<dyn Any>,
    pub meta: crate::value::Item,
}

#[derive(Default)]
pub struct Heap {
    pub strings: Interner,
    pub vectors: Pool<VectorObj>,
    pub maps: Pool<MapObj>,
    pub coroutines: Pool<Coroutine>,
    pub userdata: Pool<UserData>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> StrHandle {
        self.strings.intern(s)
    }

    #[must_use]
    pub fn resolve(&self, handle: StrHandle) -> &str {
        self.strings.resolve(handle)
    }

    pub fn alloc_vector(&mut self) -> PoolIndex {
        self.vectors.alloc(VectorObj::new())
    }

    pub fn alloc_map(&mut self) -> PoolIndex {
        self.maps.alloc(MapObj::new())
    }

    pub fn alloc_userdata(&mut self, data: Box<dyn Any>) -> PoolIndex {
        self.userdata.alloc(UserData {
            data,
            meta: crate::value::Item::Nil,
        })
    }

    pub fn alloc_coroutine(&mut self, coro: Coroutine) -> PoolIndex {
        self.coroutines.alloc(coro)
    }
}
