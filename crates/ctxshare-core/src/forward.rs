// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Fan-out forwarding: one tailing session per active (context, recipient)
//! pair, fed from the message view's ordered context index.
//!
//! The controller never advances cursors itself. A delivered message comes
//! back around as a wrapper on the local feed, and the share view credits
//! it against the original's index; that indirection is what makes
//! forwarding at-most-once across restarts.

use std::{
    collections::HashSet,
    sync::Arc,
};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    indexer::Indexer,
    kv::ReadOptions,
    message_view::{context_range, MessageProjection, CONTEXT_INDEX},
    share_view::{share_primary_key, ShareProjection, ShareState, CFR_INDEX},
    worker::{DeliveryJob, Worker},
};

pub struct ForwardingController {
    share_view: Arc<Indexer<ShareProjection>>,
    message_view: Arc<Indexer<MessageProjection>>,
    worker: Arc<dyn Worker>,
    /// Pairs with a live session in this process.
    inflight: Mutex<HashSet<(String, String)>>,
    closed: CancellationToken,
}

impl ForwardingController {
    pub fn new(
        share_view: Arc<Indexer<ShareProjection>>,
        message_view: Arc<Indexer<MessageProjection>>,
        worker: Arc<dyn Worker>,
        closed: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            share_view,
            message_view,
            worker,
            inflight: Mutex::new(HashSet::new()),
            closed,
        })
    }

    /// Subscribe to the active-pairs index and keep sessions running until
    /// the engine closes.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move { controller.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut pairs = match self
            .share_view
            .index(CFR_INDEX)
            .read(ReadOptions::tail())
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "forwarding controller failed to open the pair stream");
                return;
            }
        };

        loop {
            let state = tokio::select! {
                _ = self.closed.cancelled() => break,
                state = pairs.next() => match state {
                    Some(state) => state,
                    None => break,
                },
            };
            // the index only holds active pairs; guard anyway in case a
            // stale row leaks through
            if state.active != Some(true) {
                continue;
            }
            let pair = (state.context.clone(), state.recipient.clone());
            {
                let mut inflight = self.inflight.lock().await;
                if !inflight.insert(pair.clone()) {
                    continue;
                }
            }
            let controller = self.clone();
            tokio::spawn(async move { controller.session(state, pair).await });
        }
        debug!("forwarding controller ended");
    }

    async fn session(self: Arc<Self>, state: ShareState, pair: (String, String)) {
        info!(
            context = %state.context,
            recipient = %state.recipient,
            seq = state.seq,
            "forwarding session started"
        );
        if let Err(err) = self.run_session(&state).await {
            warn!(
                context = %state.context,
                recipient = %state.recipient,
                error = %err,
                "forwarding session ended with error"
            );
        }
        self.inflight.lock().await.remove(&pair);
        debug!(
            context = %state.context,
            recipient = %state.recipient,
            "forwarding session ended"
        );
    }

    async fn run_session(&self, state: &ShareState) -> anyhow::Result<()> {
        let mut opts = context_range(&state.context, state.seq);
        opts.live = true;
        let mut messages = self.message_view.index(CONTEXT_INDEX).read(opts).await?;

        loop {
            let record = tokio::select! {
                _ = self.closed.cancelled() => break,
                record = messages.next() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            // lazy unshare: the pair may have gone inactive since the last
            // emission; ending here removes it from inflight so a later
            // re-share starts a fresh session from the updated cursor
            let current = self
                .share_view
                .get(&share_primary_key(&state.context, &state.recipient))
                .await?;
            if current.map(|s| s.active) != Some(Some(true)) {
                break;
            }

            debug!(
                context = %state.context,
                recipient = %state.recipient,
                permalink = %record.permalink,
                seq = record.seq,
                "forwarding message"
            );
            self.worker
                .deliver(DeliveryJob {
                    context: state.context.clone(),
                    recipient: state.recipient.clone(),
                    link: record.permalink.clone(),
                    permalink: record.permalink,
                })
                .await?;
        }
        Ok(())
    }
}
