// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The node's append-only change feed, as consumed by the engine.
//!
//! Every materialized view is a pure projection of this log: entries carry
//! a dense, monotonic `change` index assigned by the feed, and replaying
//! the log from any persisted high-water mark reconstructs derived state
//! exactly.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// One entry of the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEntry {
    /// Monotonic index assigned by the feed, starting at 1.
    pub change: u64,
    pub value: ChangePayload,
}

/// Payload variants, discriminated by `topic` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "topic")]
pub enum ChangePayload {
    /// A newly observed object.
    #[serde(rename = "newobj")]
    NewObj(ObjRef),
    /// Control record: begin sharing a context with a recipient.
    #[serde(rename = "sharectx")]
    ShareCtx(ShareCtx),
    /// Control record: stop sharing a context with a recipient.
    #[serde(rename = "unsharectx")]
    UnshareCtx(UnshareCtx),
}

/// Reference to an observed object, plus (after preprocessing) its body.
///
/// The same shape serves as the top-level `newobj` value and as the
/// `objectinfo` describing the payload the object wraps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjRef {
    /// The object's declared kind.
    #[serde(rename = "type")]
    pub r#type: String,
    /// Content address; stable across re-observations.
    pub permalink: String,
    /// Version address; equals `permalink` for immutable messages.
    #[serde(default)]
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Metadata about the referenced payload when this object is a wrapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectinfo: Option<Box<ObjRef>>,
    /// Hydrated body, attached in-memory by preprocessing. Never persisted.
    #[serde(skip)]
    pub object: Option<serde_json::Value>,
}

impl ObjRef {
    /// Context string carried on the hydrated body, if any.
    pub fn body_context(&self) -> Option<&str> {
        self.object.as_ref()?.get("context")?.as_str()
    }

    /// Type tag of the hydrated body's own payload (`object.object.type`).
    pub fn payload_type(&self) -> Option<&str> {
        self.object.as_ref()?.get("object")?.get("type")?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShareCtx {
    pub context: String,
    pub recipient: String,
    /// Starting cursor; 0 means from the beginning.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnshareCtx {
    pub context: String,
    pub recipient: String,
    pub timestamp: u64,
}

/// Ordered, gapless stream of feed entries. Live until the feed closes or
/// the reader is dropped.
pub struct FeedStream {
    rx: mpsc::UnboundedReceiver<ChangeEntry>,
}

impl FeedStream {
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeEntry>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<ChangeEntry> {
        self.rx.recv().await
    }
}

/// The append-only change log contract.
///
/// `read` must deliver every entry with `change >= from`, in order and
/// without gaps, and keep tailing until the feed closes. Appends are
/// serialized by the feed itself.
#[async_trait]
pub trait Feed: Send + Sync {
    async fn append(&self, value: ChangePayload) -> anyhow::Result<u64>;
    async fn read(&self, from: u64) -> anyhow::Result<FeedStream>;
    async fn close(&self);
}

#[derive(Default)]
struct MemoryFeedInner {
    entries: Vec<ChangeEntry>,
    subscribers: Vec<mpsc::UnboundedSender<ChangeEntry>>,
    closed: bool,
}

/// In-memory feed. Snapshot and subscription happen under one lock, so a
/// reader sees every entry exactly once regardless of concurrent appends.
#[derive(Default)]
pub struct MemoryFeed {
    inner: Mutex<MemoryFeedInner>,
}

impl MemoryFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn len(&self) -> u64 {
        self.inner.lock().await.entries.len() as u64
    }
}

#[async_trait]
impl Feed for MemoryFeed {
    async fn append(&self, value: ChangePayload) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            anyhow::bail!("feed is closed");
        }
        let change = inner.entries.len() as u64 + 1;
        let entry = ChangeEntry { change, value };
        inner.entries.push(entry.clone());
        inner.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
        Ok(change)
    }

    async fn read(&self, from: u64) -> anyhow::Result<FeedStream> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let skip = from.saturating_sub(1).min(inner.entries.len() as u64) as usize;
        for entry in &inner.entries[skip..] {
            let _ = tx.send(entry.clone());
        }
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        Ok(FeedStream::new(rx))
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.subscribers.clear();
    }
}
