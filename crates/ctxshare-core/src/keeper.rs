// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Content-addressed blob and object-metadata resolution.
//!
//! Both lookups are pure and idempotent; bodies are immutable. A miss is
//! not an error — preprocessing treats it as a transient condition and
//! drops the current entry so that a later replay retries it.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::feed::{ChangeEntry, ChangePayload};

/// Resolves a permalink to the referenced object's full body.
#[async_trait]
pub trait Keeper: Send + Sync {
    async fn get(&self, permalink: &str) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Resolves a link to the feed entry under which the object was first
/// indexed, carrying its original `change` index.
#[async_trait]
pub trait Objects: Send + Sync {
    async fn get(&self, link: &str) -> anyhow::Result<Option<ChangeEntry>>;
}

#[derive(Default)]
pub struct MemoryKeeper {
    blobs: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryKeeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put(&self, permalink: impl Into<String>, body: serde_json::Value) {
        self.blobs.write().await.insert(permalink.into(), body);
    }
}

#[async_trait]
impl Keeper for MemoryKeeper {
    async fn get(&self, permalink: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.blobs.read().await.get(permalink).cloned())
    }
}

#[derive(Default)]
pub struct MemoryObjects {
    entries: RwLock<HashMap<String, ChangeEntry>>,
}

impl MemoryObjects {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a `newobj` entry under both its permalink and its link.
    /// First observation wins; re-observations keep the original index.
    pub async fn record(&self, entry: &ChangeEntry) {
        let ChangePayload::NewObj(obj) = &entry.value else {
            return;
        };
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&obj.permalink) {
            entries.insert(obj.permalink.clone(), entry.clone());
        }
        if !obj.link.is_empty() && obj.link != obj.permalink && !entries.contains_key(&obj.link) {
            entries.insert(obj.link.clone(), entry.clone());
        }
    }
}

#[async_trait]
impl Objects for MemoryObjects {
    async fn get(&self, link: &str) -> anyhow::Result<Option<ChangeEntry>> {
        Ok(self.entries.read().await.get(link).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ObjRef;

    fn newobj_entry(change: u64, permalink: &str) -> ChangeEntry {
        ChangeEntry {
            change,
            value: ChangePayload::NewObj(ObjRef {
                r#type: "msg".into(),
                permalink: permalink.into(),
                link: permalink.into(),
                author: None,
                recipient: None,
                objectinfo: None,
                object: None,
            }),
        }
    }

    #[tokio::test]
    async fn keeper_miss_is_none_not_error() {
        let keeper = MemoryKeeper::new();
        assert!(keeper.get("missing").await.expect("get").is_none());

        keeper.put("p1", serde_json::json!({"hey": "ho"})).await;
        let body = keeper.get("p1").await.expect("get").expect("body");
        assert_eq!(body["hey"], "ho");
    }

    #[tokio::test]
    async fn objects_keep_first_observation() {
        let objects = MemoryObjects::new();
        objects.record(&newobj_entry(3, "p1")).await;
        objects.record(&newobj_entry(9, "p1")).await;

        let entry = objects.get("p1").await.expect("get").expect("entry");
        assert_eq!(entry.change, 3);
    }
}
