// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Ordered vector and sorted-key map containers (§4.B).

pub mod map;
pub mod vector;

pub use map::MapObj;
pub use vector::VectorObj;
