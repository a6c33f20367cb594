// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::Node;

/// One message to deliver to one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryJob {
    pub context: String,
    pub recipient: String,
    pub link: String,
    pub permalink: String,
}

/// Pluggable delivery. Implementations must complete exactly once per
/// invocation and must tolerate duplicate jobs across crash boundaries:
/// delivery is acknowledged indirectly, through the wrapper object the
/// outbound send leaves on the local feed.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn deliver(&self, job: DeliveryJob) -> anyhow::Result<()>;
}

/// Default worker: hand the message to the node's own send path.
pub struct SendWorker {
    node: Arc<dyn Node>,
}

impl SendWorker {
    pub fn new(node: Arc<dyn Node>) -> Arc<Self> {
        Arc::new(Self { node })
    }
}

#[async_trait]
impl Worker for SendWorker {
    async fn deliver(&self, job: DeliveryJob) -> anyhow::Result<()> {
        self.node.send(&job.link, &job.recipient).await
    }
}
