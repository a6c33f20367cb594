// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Per-message view: one immutable row per observed message permalink,
//! ordered per context by the feed index of first observation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    feed::{ChangeEntry, ChangePayload, ObjRef},
    indexer::{IndexDef, Projection, Step},
    keeper::Keeper,
    kv::{ReadOptions, KEY_MAX, SEP},
    lexint::lexint_hex,
};

/// Name of the `(context, seq, permalink)` ordered index.
pub const CONTEXT_INDEX: &str = "context";

/// Extracts the grouping context from a hydrated object reference.
///
/// Shared by both views; the default reads the `context` field of the
/// resolved body. Applications supply their own to group by arbitrary
/// body material (e.g. a conversation key derived from author/recipient).
pub type ContextFn = Arc<dyn Fn(&ObjRef) -> Option<String> + Send + Sync>;

/// Derives the sequence credited to an entry. The default is the feed
/// index at which the entry was observed.
pub type SeqFn = Arc<dyn Fn(&ChangeEntry) -> u64 + Send + Sync>;

pub fn default_context_fn() -> ContextFn {
    Arc::new(|obj| obj.body_context().map(str::to_string))
}

pub fn default_seq_fn() -> SeqFn {
    Arc::new(|entry| entry.change)
}

/// Primary row: metadata of one observed message. Immutable once written;
/// re-observations of the permalink never move `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub permalink: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Feed index of first local observation.
    pub seq: u64,
}

/// Bounds selecting a context's rows strictly above `seq`, in index-key
/// space. Callers set `old`/`live` as needed.
///
/// Index keys carry a trailing permalink fragment, so the lower bound must
/// sort above the whole `seq` bucket, not just its prefix; the ceiling
/// sorts above every permalink that may follow the separator.
pub fn context_range(context: &str, seq: u64) -> ReadOptions {
    ReadOptions {
        gt: Some(format!(
            "{context}{SEP}{}{SEP}{KEY_MAX}",
            lexint_hex(seq)
        )),
        lt: Some(format!("{context}{SEP}{KEY_MAX}")),
        ..ReadOptions::default()
    }
}

pub struct MessageProjection {
    keeper: Arc<dyn Keeper>,
    message_type: String,
    get_context: ContextFn,
    get_seq: SeqFn,
    closed: CancellationToken,
}

impl MessageProjection {
    pub fn new(
        keeper: Arc<dyn Keeper>,
        message_type: impl Into<String>,
        get_context: ContextFn,
        get_seq: SeqFn,
        closed: CancellationToken,
    ) -> Self {
        Self {
            keeper,
            message_type: message_type.into(),
            get_context,
            get_seq,
            closed,
        }
    }
}

#[async_trait]
impl Projection for MessageProjection {
    type State = MessageRecord;

    fn filter(&self, entry: &ChangeEntry) -> bool {
        matches!(&entry.value, ChangePayload::NewObj(obj) if obj.r#type == self.message_type)
    }

    async fn preprocess(&self, mut entry: ChangeEntry) -> anyhow::Result<Step<ChangeEntry>> {
        if self.closed.is_cancelled() {
            return Ok(Step::Retry);
        }
        let ChangePayload::NewObj(obj) = &mut entry.value else {
            return Ok(Step::Skip);
        };
        let Some(body) = self.keeper.get(&obj.permalink).await? else {
            return Ok(Step::Retry);
        };
        obj.object = Some(body);
        Ok(Step::Emit(entry))
    }

    fn primary_key(&self, entry: &ChangeEntry) -> Option<String> {
        match &entry.value {
            ChangePayload::NewObj(obj) => Some(obj.permalink.clone()),
            _ => None,
        }
    }

    async fn reduce(
        &self,
        prev: Option<&MessageRecord>,
        entry: &ChangeEntry,
    ) -> anyhow::Result<Step<MessageRecord>> {
        // first writer wins; re-observation folds to the identical row
        if let Some(prev) = prev {
            return Ok(Step::Emit(prev.clone()));
        }
        let ChangePayload::NewObj(obj) = &entry.value else {
            return Ok(Step::Skip);
        };
        let Some(context) = (self.get_context)(obj) else {
            return Ok(Step::Skip);
        };
        Ok(Step::Emit(MessageRecord {
            permalink: obj.permalink.clone(),
            context,
            recipient: obj.recipient.clone(),
            seq: (self.get_seq)(entry),
        }))
    }

    fn indexes(&self) -> Vec<IndexDef<MessageRecord>> {
        vec![IndexDef {
            name: CONTEXT_INDEX,
            key: Box::new(|record| {
                Some(format!(
                    "{}{SEP}{}{SEP}{}",
                    record.context,
                    lexint_hex(record.seq),
                    record.permalink
                ))
            }),
        }]
    }
}
