// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use thiserror::Error;

/// Errors surfaced by the public engine API.
///
/// Transient resolution misses inside the indexing pipeline are never
/// surfaced here; they drop the offending entry from the current pass and
/// the entry is retried on replay.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No active share exists for the requested pair.
    #[error("no active share for {context}:{recipient}")]
    NotShared { context: String, recipient: String },

    /// A required request field was missing or empty.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,

    /// Failure in the backing keyspace or feed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
