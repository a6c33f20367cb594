// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The context re-sharing engine and its public API.
//!
//! `share`/`unshare` append control records to the node's change feed and
//! re-enter the same indexing pipeline as every other entry, so the
//! materialized views remain the single source of truth and survive
//! restarts. The engine owns two keyspaces (`msg-<db>`, `ctx-<db>`), one
//! indexer over each, and the forwarding controller on top.


use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    error::EngineError,
    feed::{ChangePayload, Feed, ShareCtx, UnshareCtx},
    forward::ForwardingController,
    indexer::{Indexer, ReadStream},
    keeper::{Keeper, Objects},
    kv::{Keyspace, ReadOptions, SEP},
    message_view::{
        context_range, default_context_fn, default_seq_fn, ContextFn, MessageProjection,
        MessageRecord, SeqFn, CONTEXT_INDEX,
    },
    share_view::{ShareProjection, ShareState, CFR_INDEX},
    worker::{SendWorker, Worker},
};

/// The hosting node, as consumed by the engine.
///
/// The engine never touches identities, signing or transport; it reads the
/// change feed, resolves bodies and metadata, owns two KV namespaces the
/// node hands out, and delivers through `send`.
#[async_trait]
pub trait Node: Send + Sync {
    /// Node name, for logging only.
    fn name(&self) -> String;
    /// The append-only change feed.
    fn changes(&self) -> Arc<dyn Feed>;
    /// Content-addressed blob lookup.
    fn keeper(&self) -> Arc<dyn Keeper>;
    /// Metadata lookup for previously observed objects.
    fn objects(&self) -> Arc<dyn Objects>;
    /// Open an exclusively owned KV namespace.
    async fn create_db(&self, name: &str) -> anyhow::Result<Keyspace>;
    /// Deliver the object at `link` to the identity `to`.
    async fn send(&self, link: &str, to: &str) -> anyhow::Result<()>;
    /// Cancelled when the node is being destroyed; triggers engine close.
    fn destroying(&self) -> CancellationToken;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base name of the engine's keyspaces (`msg-<db>` / `ctx-<db>`).
    pub db: String,
    /// Type tag identifying message objects on the feed.
    pub message_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db: "contexts.db".to_string(),
            message_type: "msg".to_string(),
        }
    }
}

/// Application hooks: how to read a grouping context off a message and how
/// to derive the sequence credited to an entry.
#[derive(Clone)]
pub struct EngineHooks {
    pub context: ContextFn,
    pub seq: SeqFn,
}

impl Default for EngineHooks {
    fn default() -> Self {
        Self {
            context: default_context_fn(),
            seq: default_seq_fn(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShareRequest {
    pub context: String,
    pub recipient: String,
    /// Starting cursor, applied on the first share of the pair only.
    pub seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct UnshareRequest {
    pub context: String,
    pub recipient: String,
}

#[derive(Debug, Clone, Default)]
pub struct MessagesRequest {
    pub context: String,
    pub recipient: String,
    pub live: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContextStreamRequest {
    pub context: String,
    pub seq: u64,
    pub live: bool,
}

pub struct Engine;

impl Engine {
    /// Open the engine with the default hooks and the node's send path.
    pub async fn start(
        node: Arc<dyn Node>,
        config: EngineConfig,
    ) -> Result<EngineHandle, EngineError> {
        Self::start_custom(node, config, EngineHooks::default(), None).await
    }

    /// Open the engine with custom hooks and, optionally, a custom worker.
    pub async fn start_custom(
        node: Arc<dyn Node>,
        config: EngineConfig,
        hooks: EngineHooks,
        worker: Option<Arc<dyn Worker>>,
    ) -> Result<EngineHandle, EngineError> {
        let closed = CancellationToken::new();
        let feed = node.changes();

        let msg_db = node.create_db(&format!("msg-{}", config.db)).await?;
        let ctx_db = node.create_db(&format!("ctx-{}", config.db)).await?;

        let message_view = Indexer::open(
            msg_db.clone(),
            feed.clone(),
            MessageProjection::new(
                node.keeper(),
                config.message_type.clone(),
                hooks.context.clone(),
                hooks.seq.clone(),
                closed.child_token(),
            ),
            closed.child_token(),
        )
        .await?;
        let share_view = Indexer::open(
            ctx_db.clone(),
            feed.clone(),
            ShareProjection::new(
                node.keeper(),
                node.objects(),
                config.message_type.clone(),
                hooks.context.clone(),
                hooks.seq.clone(),
                closed.child_token(),
            ),
            closed.child_token(),
        )
        .await?;

        let worker = worker.unwrap_or_else(|| SendWorker::new(node.clone()));
        let controller = ForwardingController::new(
            share_view.clone(),
            message_view.clone(),
            worker,
            closed.child_token(),
        );
        controller.start();

        let handle = EngineHandle {
            inner: Arc::new(EngineInner {
                node,
                feed,
                msg_db,
                ctx_db,
                message_view,
                share_view,
                closed,
                close_started: AtomicBool::new(false),
            }),
        };

        // close when the node goes down
        let watcher = handle.clone();
        let destroying = handle.inner.node.destroying();
        let engine_closed = handle.inner.closed.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = destroying.cancelled() => {
                    let _ = watcher.close().await;
                }
                _ = engine_closed.cancelled() => {}
            }
        });

        info!(
            node = %handle.inner.node.name(),
            db = %config.db,
            "context sharing engine started"
        );
        Ok(handle)
    }
}

struct EngineInner {
    node: Arc<dyn Node>,
    feed: Arc<dyn Feed>,
    msg_db: Keyspace,
    ctx_db: Keyspace,
    message_view: Arc<Indexer<MessageProjection>>,
    share_view: Arc<Indexer<ShareProjection>>,
    closed: CancellationToken,
    close_started: AtomicBool,
}

/// Cheaply cloneable handle on a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Declare that `context` is shared with `recipient`, now and for all
    /// future messages bearing that context.
    pub async fn share(&self, req: ShareRequest) -> Result<(), EngineError> {
        validate_pair(&req.context, &req.recipient)?;
        self.ensure_open()?;
        self.inner
            .feed
            .append(ChangePayload::ShareCtx(ShareCtx {
                context: req.context,
                recipient: req.recipient,
                seq: req.seq,
                timestamp: now_unix_secs(),
            }))
            .await?;
        Ok(())
    }

    /// Stop sharing the pair. A no-op if the pair was never shared.
    pub async fn unshare(&self, req: UnshareRequest) -> Result<(), EngineError> {
        validate_pair(&req.context, &req.recipient)?;
        self.ensure_open()?;
        self.inner
            .feed
            .append(ChangePayload::UnshareCtx(UnshareCtx {
                context: req.context,
                recipient: req.recipient,
                timestamp: now_unix_secs(),
            }))
            .await?;
        Ok(())
    }

    /// Cursor of an active pair: the greatest accounted-for feed index.
    pub async fn position(&self, context: &str, recipient: &str) -> Result<u64, EngineError> {
        validate_pair(context, recipient)?;
        self.ensure_open()?;
        let mut stream = self
            .inner
            .share_view
            .index(CFR_INDEX)
            .read(ReadOptions::eq(format!("{context}{SEP}{recipient}")))
            .await?;
        match stream.next().await {
            Some(state) => Ok(state.seq),
            None => Err(EngineError::NotShared {
                context: context.to_string(),
                recipient: recipient.to_string(),
            }),
        }
    }

    /// Alias of [`position`](Self::position).
    pub async fn seq(&self, context: &str, recipient: &str) -> Result<u64, EngineError> {
        self.position(context, recipient).await
    }

    /// The pair's messages not yet accounted for, oldest first. Errors
    /// with `NotShared` when the pair is not actively shared.
    pub async fn messages(
        &self,
        req: MessagesRequest,
    ) -> Result<ReadStream<MessageRecord>, EngineError> {
        let seq = self.position(&req.context, &req.recipient).await?;
        self.create_context_stream(ContextStreamRequest {
            context: req.context,
            seq,
            live: req.live,
        })
        .await
    }

    /// Tail of a context's messages strictly above `seq`.
    pub async fn create_context_stream(
        &self,
        req: ContextStreamRequest,
    ) -> Result<ReadStream<MessageRecord>, EngineError> {
        self.ensure_open()?;
        let mut opts = context_range(&req.context, req.seq);
        opts.live = req.live;
        Ok(self
            .inner
            .message_view
            .index(CONTEXT_INDEX)
            .read(opts)
            .await?)
    }

    /// Alias of [`create_context_stream`](Self::create_context_stream).
    pub async fn context(
        &self,
        req: ContextStreamRequest,
    ) -> Result<ReadStream<MessageRecord>, EngineError> {
        self.create_context_stream(req).await
    }

    /// Raw stream of active share states.
    pub async fn cursor(&self, opts: ReadOptions) -> Result<ReadStream<ShareState>, EngineError> {
        self.ensure_open()?;
        Ok(self.inner.share_view.index(CFR_INDEX).read(opts).await?)
    }

    /// Idempotent. Cancels all pipeline stages and closes both keyspaces
    /// in parallel.
    pub async fn close(&self) -> Result<(), EngineError> {
        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.closed.cancel();
        let (msg, ctx) = tokio::join!(self.inner.msg_db.close(), self.inner.ctx_db.close());
        msg?;
        ctx?;
        info!(node = %self.inner.node.name(), "context sharing engine closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.inner.closed.is_cancelled() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

fn validate_pair(context: &str, recipient: &str) -> Result<(), EngineError> {
    if context.is_empty() {
        return Err(EngineError::InvalidRequest("context is required"));
    }
    if recipient.is_empty() {
        return Err(EngineError::InvalidRequest("recipient is required"));
    }
    Ok(())
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
