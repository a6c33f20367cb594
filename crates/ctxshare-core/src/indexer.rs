// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The materialized indexer: folds a filtered view of the change feed into
//! per-key state rows plus any number of ordered secondary indexes.
//!
//! One indexer exclusively owns one keyspace. Entries are processed
//! strictly one at a time in feed order; the row write, the secondary
//! index delta and the high-water mark land in a single atomic batch, so
//! replaying the feed from the persisted mark after a crash reconstructs
//! exactly the same rows.

use std::{fmt, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    cbor,
    feed::{ChangeEntry, Feed, FeedStream},
    kv::{Keyspace, KvOp, ReadOptions, SEP},
};

/// High-water mark row; lives outside the `r`/`i` subspaces.
const HWM_KEY: &str = "m\u{0}hwm";

pub(crate) fn row_key(primary: &str) -> String {
    format!("r{SEP}{primary}")
}

pub(crate) fn index_entry_key(index: &str, key: &str) -> String {
    format!("i{SEP}{index}{SEP}{key}")
}

/// Exclusive upper bound of an index's subspace: the prefix with its final
/// separator bumped, which sorts above every composable index key.
fn index_subspace_end(index: &str) -> String {
    format!("i{SEP}{index}\u{1}")
}

/// Outcome of a preprocessing or reduce step.
///
/// `Skip` is a deterministic drop: replaying the entry yields the same
/// decision, so progress advances past it. `Retry` is a transient
/// resolution miss: the persisted high-water mark freezes below the entry
/// so the next open retries it.
pub enum Step<T> {
    Emit(T),
    Skip,
    Retry,
}

/// A named ordered secondary index, derived from the current state.
pub struct IndexDef<S> {
    pub name: &'static str,
    pub key: Box<dyn Fn(&S) -> Option<String> + Send + Sync>,
}

/// Configuration of one materialized view.
///
/// `reduce` must be a pure function of `(prev, entry)`; together with the
/// durable rows and the deep-equality short-circuit this makes replay
/// idempotent across arbitrary crash points.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    type State: Serialize
        + DeserializeOwned
        + PartialEq
        + Clone
        + fmt::Debug
        + Send
        + Sync
        + 'static;

    fn filter(&self, _entry: &ChangeEntry) -> bool {
        true
    }

    /// Hydrate the entry (blob/metadata fetches) before keying and folding.
    async fn preprocess(&self, entry: ChangeEntry) -> anyhow::Result<Step<ChangeEntry>> {
        Ok(Step::Emit(entry))
    }

    fn primary_key(&self, entry: &ChangeEntry) -> Option<String>;

    async fn reduce(
        &self,
        prev: Option<&Self::State>,
        entry: &ChangeEntry,
    ) -> anyhow::Result<Step<Self::State>>;

    fn indexes(&self) -> Vec<IndexDef<Self::State>> {
        Vec::new()
    }
}

/// A running indexer task over one keyspace.
pub struct Indexer<P: Projection> {
    keyspace: Keyspace,
    projection: Arc<P>,
    indexes: Arc<Vec<IndexDef<P::State>>>,
    closed: CancellationToken,
}

impl<P: Projection> Indexer<P> {
    /// Open the view: read the persisted high-water mark and tail the feed
    /// strictly above it.
    pub async fn open(
        keyspace: Keyspace,
        feed: Arc<dyn Feed>,
        projection: P,
        closed: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let projection = Arc::new(projection);
        let indexes = Arc::new(projection.indexes());
        let indexer = Arc::new(Self {
            keyspace,
            projection,
            indexes,
            closed,
        });

        let hwm = indexer.high_water_mark().await?;
        let stream = feed.read(hwm + 1).await?;
        debug!(keyspace = %indexer.keyspace.name(), hwm, "indexer opened");

        let runner = indexer.clone();
        tokio::spawn(async move { runner.run(stream).await });
        Ok(indexer)
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Current state for a primary key.
    pub async fn get(&self, primary: &str) -> anyhow::Result<Option<P::State>> {
        match self.keyspace.get(&row_key(primary)).await? {
            Some(bytes) => Ok(Some(cbor::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Greatest feed index known to be fully accounted for.
    pub async fn high_water_mark(&self) -> anyhow::Result<u64> {
        match self.keyspace.get(HWM_KEY).await? {
            Some(bytes) => Ok(cbor::from_slice(&bytes)?),
            None => Ok(0),
        }
    }

    /// Handle on a secondary index declared by the projection.
    pub fn index(&self, name: &str) -> IndexHandle<P::State> {
        IndexHandle {
            keyspace: self.keyspace.clone(),
            name: name.to_string(),
            _marker: PhantomData,
        }
    }

    async fn run(self: Arc<Self>, mut stream: FeedStream) {
        // Once a transient drop occurs the persisted mark must not move past
        // it; later entries still process in this run and replay harmlessly.
        let mut frozen = false;
        loop {
            let entry = tokio::select! {
                _ = self.closed.cancelled() => break,
                entry = stream.next() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            if let Err(err) = self.apply(entry, &mut frozen).await {
                if self.closed.is_cancelled() || self.keyspace.closed_token().is_cancelled() {
                    break;
                }
                error!(
                    keyspace = %self.keyspace.name(),
                    error = %err,
                    "indexer stopped on storage failure"
                );
                break;
            }
        }
        debug!(keyspace = %self.keyspace.name(), "indexer task ended");
    }

    async fn apply(&self, entry: ChangeEntry, frozen: &mut bool) -> anyhow::Result<()> {
        let change = entry.change;

        if !self.projection.filter(&entry) {
            return self.advance(change, *frozen).await;
        }

        let entry = match self.projection.preprocess(entry).await? {
            Step::Emit(entry) => entry,
            Step::Skip => return self.advance(change, *frozen).await,
            Step::Retry => {
                warn!(
                    keyspace = %self.keyspace.name(),
                    change,
                    "transient resolution miss, entry dropped for retry on replay"
                );
                *frozen = true;
                return Ok(());
            }
        };

        let Some(primary) = self.projection.primary_key(&entry) else {
            return self.advance(change, *frozen).await;
        };

        let prev = self.get(&primary).await?;
        let next = match self.projection.reduce(prev.as_ref(), &entry).await? {
            Step::Emit(state) => state,
            Step::Skip => return self.advance(change, *frozen).await,
            Step::Retry => {
                warn!(
                    keyspace = %self.keyspace.name(),
                    change,
                    "transient resolution miss in reduce, entry dropped for retry"
                );
                *frozen = true;
                return Ok(());
            }
        };

        if prev.as_ref() == Some(&next) {
            return self.advance(change, *frozen).await;
        }

        let mut batch = Vec::new();
        for index in self.indexes.iter() {
            let old_key = prev.as_ref().and_then(|state| (index.key)(state));
            let new_key = (index.key)(&next);
            if let Some(old) = &old_key {
                if new_key.as_deref() != Some(old.as_str()) {
                    batch.push(KvOp::Del {
                        key: index_entry_key(index.name, old),
                    });
                }
            }
            if let Some(new) = &new_key {
                batch.push(KvOp::Put {
                    key: index_entry_key(index.name, new),
                    value: primary.as_bytes().to_vec(),
                });
            }
        }
        batch.push(KvOp::Put {
            key: row_key(&primary),
            value: cbor::to_vec(&next)?,
        });
        if !*frozen {
            batch.push(KvOp::Put {
                key: HWM_KEY.to_string(),
                value: cbor::to_vec(&change)?,
            });
        }

        debug!(
            keyspace = %self.keyspace.name(),
            change,
            primary = %primary,
            "state row updated"
        );
        self.keyspace.commit(batch).await
    }

    /// Record progress for an entry that produced no state change.
    async fn advance(&self, change: u64, frozen: bool) -> anyhow::Result<()> {
        if frozen {
            return Ok(());
        }
        self.keyspace
            .commit(vec![KvOp::Put {
                key: HWM_KEY.to_string(),
                value: cbor::to_vec(&change)?,
            }])
            .await
    }
}

/// Read handle on one ordered secondary index; emits decoded state rows.
pub struct IndexHandle<S> {
    keyspace: Keyspace,
    name: String,
    _marker: PhantomData<fn() -> S>,
}

impl<S: DeserializeOwned + Send + 'static> IndexHandle<S> {
    /// Range-read this index. Bounds in `opts` are expressed in index-key
    /// space; each hit is resolved to its primary row and decoded.
    pub async fn read(&self, opts: ReadOptions) -> anyhow::Result<ReadStream<S>> {
        let prefix = format!("i{SEP}{}{SEP}", self.name);
        let mut raw_opts = ReadOptions {
            gt: opts.gt.map(|bound| format!("{prefix}{bound}")),
            gte: opts.gte.map(|bound| format!("{prefix}{bound}")),
            lt: opts.lt.map(|bound| format!("{prefix}{bound}")),
            lte: opts.lte.map(|bound| format!("{prefix}{bound}")),
            old: opts.old,
            live: opts.live,
            reverse: opts.reverse,
        };
        if raw_opts.gt.is_none() && raw_opts.gte.is_none() {
            raw_opts.gte = Some(prefix);
        }
        if raw_opts.lt.is_none() && raw_opts.lte.is_none() {
            raw_opts.lt = Some(index_subspace_end(&self.name));
        }

        let mut raw = self.keyspace.read_raw(raw_opts).await?;
        let keyspace = self.keyspace.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some((_key, pointer)) = raw.next().await {
                let Ok(primary) = String::from_utf8(pointer) else {
                    continue;
                };
                let row = match keyspace.get(&row_key(&primary)).await {
                    Ok(row) => row,
                    Err(_) => break,
                };
                // the row may have been deleted since the index was read
                let Some(bytes) = row else {
                    continue;
                };
                let Ok(state) = cbor::from_slice::<S>(&bytes) else {
                    continue;
                };
                if tx.send(state).is_err() {
                    break;
                }
            }
        });
        Ok(ReadStream { rx })
    }
}

/// Ordered stream of decoded state rows.
pub struct ReadStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> ReadStream<T> {
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drain a finite (non-live) stream to completion.
    pub async fn collect(mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item);
        }
        out
    }
}
