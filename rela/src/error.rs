// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Error kinds (§7). Every error is fatal to the operation it interrupts:
//! parse/compile errors abort [`crate::vm::Vm::create`], runtime errors
//! abort [`crate::vm::Vm::run`]. Nothing in this crate panics on
//! malformed script input — nonsensical bytecode indices and malformed
//! programs both surface as `Error`.

use thiserror::Error;

/// Position in source, used to render the trailing snippet on parse and
/// compile errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct SourcePos {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("parse error: {message}{snippet}")]
    Parse { message: String, snippet: String },

    #[error("compile error: {message}{snippet}")]
    Compile { message: String, snippet: String },

    #[error("{message} (ip {ip})")]
    Type { message: String, ip: i64 },

    #[error("{message} (ip {ip})")]
    Name { message: String, ip: i64 },

    #[error("{message} (ip {ip})")]
    Runtime { message: String, ip: i64 },

    #[error("{message} (ip {ip})")]
    Host { message: String, ip: i64 },
}

impl Error {
    #[must_use]
    pub fn parse(message: impl Into<String>, snippet: impl AsRef<str>) -> Self {
        Self::Parse {
            message: message.into(),
            snippet: render_snippet(snippet.as_ref()),
        }
    }

    #[must_use]
    pub fn compile(message: impl Into<String>, snippet: impl AsRef<str>) -> Self {
        Self::Compile {
            message: message.into(),
            snippet: render_snippet(snippet.as_ref()),
        }
    }

    #[must_use]
    pub fn type_error(message: impl Into<String>, ip: i64) -> Self {
        Self::Type {
            message: message.into(),
            ip,
        }
    }

    #[must_use]
    pub fn name(message: impl Into<String>, ip: i64) -> Self {
        Self::Name {
            message: message.into(),
            ip,
        }
    }

    #[must_use]
    pub fn runtime(message: impl Into<String>, ip: i64) -> Self {
        Self::Runtime {
            message: message.into(),
            ip,
        }
    }

    #[must_use]
    pub fn host(message: impl Into<String>, ip: i64) -> Self {
        Self::Host {
            message: message.into(),
            ip,
        }
    }

    /// True for errors that abort `create` rather than `run`.
    #[must_use]
    pub fn is_fatal_to_create(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Compile { .. })
    }
}

fn render_snippet(s: &str) -> String {
    if s.is_empty() {
        String::new()
    } else {
        format!(" near: {s}")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
