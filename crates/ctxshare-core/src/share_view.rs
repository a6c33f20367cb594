// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Per-(context,recipient) view: share lifecycle plus the pair's cursor.
//!
//! Control records toggle `active`; every observed object that resolves to
//! a context advances the pair's cursor. The crucial twist is the second
//! tier: when the local node emits a wrapper carrying an already-indexed
//! message, the wrapper's `objectinfo` is swapped for the original's
//! metadata, so the entry keys to the original's pair and credits the
//! original's feed index. That credit is the only thing preventing
//! re-forwarding after a restart.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    feed::{ChangeEntry, ChangePayload, ObjRef},
    indexer::{IndexDef, Projection, Step},
    keeper::{Keeper, Objects},
    kv::SEP,
    message_view::{ContextFn, SeqFn},
};

/// Name of the active-pairs index ("context for recipient").
pub const CFR_INDEX: &str = "cfr";

/// Primary row: lifecycle and cursor of one (context, recipient) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareState {
    pub context: String,
    pub recipient: String,
    /// Absent until the first control record for the pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// Greatest accounted-for feed index; forwarding resumes strictly
    /// above this value. Non-decreasing.
    pub seq: u64,
}

/// Primary row key of a pair. Composed with the reserved separator so
/// that contexts and recipients containing ordinary punctuation cannot
/// collide onto one row.
pub fn share_primary_key(context: &str, recipient: &str) -> String {
    format!("{context}{SEP}{recipient}")
}

/// Index key of an active pair. The trailing separator makes an
/// exact-prefix read match exactly one pair.
pub fn cfr_key(context: &str, recipient: &str) -> String {
    format!("{context}{SEP}{recipient}{SEP}")
}

pub struct ShareProjection {
    keeper: Arc<dyn Keeper>,
    objects: Arc<dyn Objects>,
    message_type: String,
    get_context: ContextFn,
    get_seq: SeqFn,
    closed: CancellationToken,
}

impl ShareProjection {
    pub fn new(
        keeper: Arc<dyn Keeper>,
        objects: Arc<dyn Objects>,
        message_type: impl Into<String>,
        get_context: ContextFn,
        get_seq: SeqFn,
        closed: CancellationToken,
    ) -> Self {
        Self {
            keeper,
            objects,
            message_type: message_type.into(),
            get_context,
            get_seq,
            closed,
        }
    }

    /// The object the context is read from: the enriched `objectinfo` when
    /// the payload is itself a message, else the value.
    fn context_base<'a>(&self, obj: &'a ObjRef) -> &'a ObjRef {
        match &obj.objectinfo {
            Some(info) if info.r#type == self.message_type => info.as_ref(),
            _ => obj,
        }
    }
}

#[async_trait]
impl Projection for ShareProjection {
    type State = ShareState;

    // every topic participates: control records drive the lifecycle and
    // all observed objects may advance a cursor
    fn filter(&self, _entry: &ChangeEntry) -> bool {
        true
    }

    async fn preprocess(&self, mut entry: ChangeEntry) -> anyhow::Result<Step<ChangeEntry>> {
        let ChangePayload::NewObj(obj) = &mut entry.value else {
            return Ok(Step::Emit(entry));
        };
        if self.closed.is_cancelled() {
            return Ok(Step::Retry);
        }
        let Some(body) = self.keeper.get(&obj.permalink).await? else {
            return Ok(Step::Retry);
        };
        obj.object = Some(body);

        // second tier: the payload is a previously observed message; swap
        // in its indexed metadata so keying and crediting hit the original
        let wrapped_message = obj
            .objectinfo
            .as_ref()
            .filter(|info| info.r#type == self.message_type)
            .map(|info| info.permalink.clone());
        if let Some(inner_permalink) = wrapped_message {
            if let Some(orig_entry) = self.objects.get(&inner_permalink).await? {
                if let ChangePayload::NewObj(mut orig) = orig_entry.value {
                    let Some(orig_body) = self.keeper.get(&orig.permalink).await? else {
                        return Ok(Step::Retry);
                    };
                    orig.object = Some(orig_body);
                    obj.objectinfo = Some(Box::new(orig));
                }
            }
            // a metadata miss means the wrapper was not produced by a local
            // forward; it will key to nothing downstream
        }
        Ok(Step::Emit(entry))
    }

    fn primary_key(&self, entry: &ChangeEntry) -> Option<String> {
        match &entry.value {
            ChangePayload::ShareCtx(share) => {
                Some(share_primary_key(&share.context, &share.recipient))
            }
            ChangePayload::UnshareCtx(unshare) => {
                Some(share_primary_key(&unshare.context, &unshare.recipient))
            }
            ChangePayload::NewObj(obj) => {
                let context = (self.get_context)(self.context_base(obj))?;
                let recipient = obj.recipient.clone().unwrap_or_default();
                Some(share_primary_key(&context, &recipient))
            }
        }
    }

    async fn reduce(
        &self,
        prev: Option<&ShareState>,
        entry: &ChangeEntry,
    ) -> anyhow::Result<Step<ShareState>> {
        match &entry.value {
            ChangePayload::NewObj(obj) => {
                let context = (self.get_context)(self.context_base(obj));
                let mut next = match (prev, context) {
                    (Some(prev), _) => prev.clone(),
                    (None, Some(context)) => ShareState {
                        context,
                        recipient: obj.recipient.clone().unwrap_or_default(),
                        active: None,
                        seq: 0,
                    },
                    (None, None) => return Ok(Step::Skip),
                };

                let credited = if obj.payload_type() == Some(self.message_type.as_str()) {
                    // doubly wrapped: credit the original message's index
                    let Some(info) = &obj.objectinfo else {
                        return Ok(Step::Retry);
                    };
                    let link = if info.link.is_empty() {
                        &info.permalink
                    } else {
                        &info.link
                    };
                    match self.objects.get(link).await? {
                        Some(original) => (self.get_seq)(&original),
                        None => return Ok(Step::Retry),
                    }
                } else {
                    (self.get_seq)(entry)
                };
                next.seq = next.seq.max(credited);
                Ok(Step::Emit(next))
            }
            ChangePayload::ShareCtx(share) => {
                let mut next = prev.cloned().unwrap_or(ShareState {
                    context: share.context.clone(),
                    recipient: share.recipient.clone(),
                    active: None,
                    // starting cursor applies on first share only
                    seq: share.seq,
                });
                next.active = Some(true);
                Ok(Step::Emit(next))
            }
            ChangePayload::UnshareCtx(_) => {
                let Some(prev) = prev else {
                    return Ok(Step::Skip);
                };
                let mut next = prev.clone();
                next.active = Some(false);
                Ok(Step::Emit(next))
            }
        }
    }

    fn indexes(&self) -> Vec<IndexDef<ShareState>> {
        vec![IndexDef {
            name: CFR_INDEX,
            key: Box::new(|state| {
                (state.active == Some(true)).then(|| cfr_key(&state.context, &state.recipient))
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        feed::{Feed, MemoryFeed, ShareCtx, UnshareCtx},
        indexer::Indexer,
        keeper::{MemoryKeeper, MemoryObjects},
        kv::{Keyspace, MemoryKvBackend, ReadOptions},
        message_view::{default_context_fn, default_seq_fn},
        testutil::wait_until,
    };

    const MSG: &str = "msg";

    struct Fixture {
        feed: Arc<MemoryFeed>,
        keeper: Arc<MemoryKeeper>,
        objects: Arc<MemoryObjects>,
        view: Arc<Indexer<ShareProjection>>,
    }

    async fn fixture() -> Fixture {
        fixture_on(Keyspace::memory("ctx-test")).await
    }

    async fn fixture_on(keyspace: Keyspace) -> Fixture {
        let feed = MemoryFeed::new();
        let keeper = MemoryKeeper::new();
        let objects = MemoryObjects::new();
        let view = Indexer::open(
            keyspace,
            feed.clone(),
            ShareProjection::new(
                keeper.clone(),
                objects.clone(),
                MSG,
                default_context_fn(),
                default_seq_fn(),
                CancellationToken::new(),
            ),
            CancellationToken::new(),
        )
        .await
        .expect("open share view");
        Fixture {
            feed,
            keeper,
            objects,
            view,
        }
    }

    impl Fixture {
        async fn observe_message(
            &self,
            permalink: &str,
            context: Option<&str>,
            recipient: &str,
        ) -> u64 {
            let mut body = serde_json::json!({
                "type": MSG,
                "object": {"type": "something"},
            });
            if let Some(context) = context {
                body["context"] = serde_json::Value::String(context.to_string());
            }
            self.keeper.put(permalink, body).await;
            let payload = ChangePayload::NewObj(ObjRef {
                r#type: MSG.into(),
                permalink: permalink.into(),
                link: permalink.into(),
                author: Some("alice".into()),
                recipient: Some(recipient.into()),
                objectinfo: Some(Box::new(ObjRef {
                    r#type: "something".into(),
                    permalink: format!("{permalink}-payload"),
                    link: format!("{permalink}-payload"),
                    author: None,
                    recipient: None,
                    objectinfo: None,
                    object: None,
                })),
                object: None,
            });
            let change = self.feed.append(payload.clone()).await.expect("append");
            self.objects
                .record(&ChangeEntry {
                    change,
                    value: payload,
                })
                .await;
            change
        }

        /// Observe the wrapper the node produces when forwarding
        /// `original` to `recipient`.
        async fn observe_forward_wrapper(
            &self,
            wrapper: &str,
            original: &str,
            recipient: &str,
        ) -> u64 {
            let original_body = self
                .keeper
                .get(original)
                .await
                .expect("keeper get")
                .expect("original body");
            self.keeper
                .put(
                    wrapper,
                    serde_json::json!({
                        "type": MSG,
                        "object": original_body,
                    }),
                )
                .await;
            let payload = ChangePayload::NewObj(ObjRef {
                r#type: MSG.into(),
                permalink: wrapper.into(),
                link: wrapper.into(),
                author: Some("bob".into()),
                recipient: Some(recipient.into()),
                objectinfo: Some(Box::new(ObjRef {
                    r#type: MSG.into(),
                    permalink: original.into(),
                    link: original.into(),
                    author: None,
                    recipient: None,
                    objectinfo: None,
                    object: None,
                })),
                object: None,
            });
            let change = self.feed.append(payload.clone()).await.expect("append");
            self.objects
                .record(&ChangeEntry {
                    change,
                    value: payload,
                })
                .await;
            change
        }

        async fn share(&self, context: &str, recipient: &str, seq: u64) {
            self.feed
                .append(ChangePayload::ShareCtx(ShareCtx {
                    context: context.into(),
                    recipient: recipient.into(),
                    seq,
                    timestamp: 1,
                }))
                .await
                .expect("append sharectx");
        }

        async fn unshare(&self, context: &str, recipient: &str) {
            self.feed
                .append(ChangePayload::UnshareCtx(UnshareCtx {
                    context: context.into(),
                    recipient: recipient.into(),
                    timestamp: 2,
                }))
                .await
                .expect("append unsharectx");
        }

        async fn wait_for_feed(&self) {
            let len = self.feed.len().await;
            wait_until(|| {
                let view = self.view.clone();
                async move { view.high_water_mark().await.unwrap_or(0) == len }
            })
            .await;
        }

        async fn state(&self, context: &str, recipient: &str) -> Option<ShareState> {
            self.view
                .get(&share_primary_key(context, recipient))
                .await
                .expect("get share state")
        }

        async fn active_pairs(&self) -> Vec<(String, String)> {
            self.view
                .index(CFR_INDEX)
                .read(ReadOptions::default())
                .await
                .expect("read cfr")
                .collect()
                .await
                .into_iter()
                .map(|s: ShareState| (s.context, s.recipient))
                .collect()
        }
    }

    #[tokio::test]
    async fn share_activates_and_unshare_deactivates() {
        let fx = fixture().await;
        fx.share("boo!", "carol", 0).await;
        fx.wait_for_feed().await;

        let state = fx.state("boo!", "carol").await.expect("state");
        assert_eq!(state.active, Some(true));
        assert_eq!(state.seq, 0);
        assert_eq!(fx.active_pairs().await, vec![("boo!".into(), "carol".into())]);

        fx.unshare("boo!", "carol").await;
        fx.wait_for_feed().await;

        let state = fx.state("boo!", "carol").await.expect("state");
        assert_eq!(state.active, Some(false));
        assert!(fx.active_pairs().await.is_empty());
    }

    #[tokio::test]
    async fn unshare_before_any_share_is_a_noop() {
        let fx = fixture().await;
        fx.unshare("boo!", "carol").await;
        fx.wait_for_feed().await;
        assert!(fx.state("boo!", "carol").await.is_none());
    }

    #[tokio::test]
    async fn re_share_keeps_the_cursor() {
        let fx = fixture().await;
        fx.share("boo!", "carol", 7).await;
        fx.unshare("boo!", "carol").await;
        fx.share("boo!", "carol", 0).await;
        fx.wait_for_feed().await;

        let state = fx.state("boo!", "carol").await.expect("state");
        assert_eq!(state.active, Some(true));
        assert_eq!(state.seq, 7, "a later share must not rewind the cursor");
    }

    #[tokio::test]
    async fn punctuated_pairs_do_not_collide() {
        let fx = fixture().await;
        fx.share("a:b", "c", 4).await;
        fx.share("a", "b:c", 9).await;
        fx.wait_for_feed().await;

        assert_eq!(fx.state("a:b", "c").await.expect("state").seq, 4);
        assert_eq!(fx.state("a", "b:c").await.expect("state").seq, 9);

        fx.unshare("a:b", "c").await;
        fx.wait_for_feed().await;
        assert_eq!(
            fx.state("a:b", "c").await.expect("state").active,
            Some(false)
        );
        assert_eq!(
            fx.state("a", "b:c").await.expect("state").active,
            Some(true)
        );
    }

    #[tokio::test]
    async fn observed_message_tracks_seq_without_activating() {
        let fx = fixture().await;
        let change = fx.observe_message("m1", Some("boo!"), "bob").await;
        fx.wait_for_feed().await;

        let state = fx.state("boo!", "bob").await.expect("state");
        assert_eq!(state.active, None);
        assert_eq!(state.seq, change);
        assert!(fx.active_pairs().await.is_empty());
    }

    #[tokio::test]
    async fn message_without_context_keys_to_nothing() {
        let fx = fixture().await;
        fx.observe_message("m1", None, "bob").await;
        fx.wait_for_feed().await;
        assert!(fx.state("", "bob").await.is_none());
    }

    #[tokio::test]
    async fn forward_wrapper_credits_the_original_index() {
        let fx = fixture().await;
        let original_change = fx.observe_message("m1", Some("boo!"), "bob").await;
        fx.share("boo!", "carol", 0).await;
        fx.observe_forward_wrapper("w1", "m1", "carol").await;
        fx.wait_for_feed().await;

        let state = fx.state("boo!", "carol").await.expect("state");
        assert_eq!(state.active, Some(true));
        assert_eq!(
            state.seq, original_change,
            "the wrapper must credit the original message's feed index"
        );
    }

    #[tokio::test]
    async fn cursor_never_decreases() {
        let fx = fixture().await;
        let first = fx.observe_message("m1", Some("boo!"), "bob").await;
        let second = fx.observe_message("m2", Some("boo!"), "bob").await;
        fx.share("boo!", "carol", 0).await;
        // wrappers observed newest-first still leave the cursor at the max
        fx.observe_forward_wrapper("w2", "m2", "carol").await;
        fx.observe_forward_wrapper("w1", "m1", "carol").await;
        fx.wait_for_feed().await;

        assert!(first < second);
        let state = fx.state("boo!", "carol").await.expect("state");
        assert_eq!(state.seq, second);
    }

    #[tokio::test]
    async fn foreign_wrapper_without_local_metadata_keys_to_nothing() {
        let fx = fixture().await;
        // a wrapper arrives for a message this node never indexed
        fx.keeper
            .put(
                "w9",
                serde_json::json!({
                    "type": MSG,
                    "object": {"type": MSG, "context": "boo!", "object": {"type": "x"}},
                }),
            )
            .await;
        fx.feed
            .append(ChangePayload::NewObj(ObjRef {
                r#type: MSG.into(),
                permalink: "w9".into(),
                link: "w9".into(),
                author: Some("mallory".into()),
                recipient: Some("me".into()),
                objectinfo: Some(Box::new(ObjRef {
                    r#type: MSG.into(),
                    permalink: "unknown".into(),
                    link: "unknown".into(),
                    author: None,
                    recipient: None,
                    objectinfo: None,
                    object: None,
                })),
                object: None,
            }))
            .await
            .expect("append");
        fx.wait_for_feed().await;
        assert!(fx.state("boo!", "me").await.is_none());
    }

    #[tokio::test]
    async fn rebuild_from_empty_matches_incremental_rows() {
        let backend = MemoryKvBackend::new();
        let fx = fixture_on(Keyspace::new("ctx-test", Box::new(backend.clone()))).await;

        fx.observe_message("m1", Some("boo!"), "bob").await;
        fx.share("boo!", "carol", 0).await;
        fx.observe_forward_wrapper("w1", "m1", "carol").await;
        fx.unshare("boo!", "carol").await;
        fx.share("boo!", "carol", 0).await;
        fx.wait_for_feed().await;

        // replay the same feed into a fresh keyspace through a fresh view
        let rebuilt = Indexer::open(
            Keyspace::memory("ctx-rebuild"),
            fx.feed.clone(),
            ShareProjection::new(
                fx.keeper.clone(),
                fx.objects.clone(),
                MSG,
                default_context_fn(),
                default_seq_fn(),
                CancellationToken::new(),
            ),
            CancellationToken::new(),
        )
        .await
        .expect("open rebuild view");
        let len = fx.feed.len().await;
        wait_until(|| {
            let rebuilt = rebuilt.clone();
            async move { rebuilt.high_water_mark().await.unwrap_or(0) == len }
        })
        .await;

        let rows = |keyspace: Keyspace| async move {
            let mut stream = keyspace
                .read_raw(ReadOptions {
                    gte: Some(format!("r{SEP}")),
                    lt: Some("r\u{1}".to_string()),
                    ..ReadOptions::default()
                })
                .await
                .expect("scan rows");
            let mut out = Vec::new();
            while let Some(pair) = stream.next().await {
                out.push(pair);
            }
            out
        };
        let incremental = rows(fx.view.keyspace().clone()).await;
        let replayed = rows(rebuilt.keyspace().clone()).await;
        assert_eq!(incremental, replayed, "primary rows must be byte-identical");
        assert!(!incremental.is_empty());
    }
}
