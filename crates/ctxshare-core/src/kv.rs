// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Ordered key-value namespaces with atomic batches and live range streams.
//!
//! A [`Keyspace`] owns one namespace: an ordered byte-string keyspace plus
//! a subscriber registry. Commits apply a batch atomically and publish one
//! event per operation under the same lock that readers use to snapshot,
//! so a snapshot-then-subscribe reader observes every row exactly once.
//!
//! Two backends implement the storage contract: an in-memory tree whose
//! clones share storage (a reopened engine finds its data through the same
//! handle) and a SQLite file using BLOB keys so range order is memcmp.

use std::{
    collections::BTreeMap,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reserved separator used to compose multi-field keys. Must not appear in
/// any key fragment (context, recipient, permalink).
pub const SEP: char = '\0';

/// Upper-bound sentinel; sorts above every character that may legally
/// follow a separator in a composed key.
pub const KEY_MAX: char = '\u{ff}';

#[derive(Debug, Clone)]
pub enum KvOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

/// Committed mutation, as published to live subscribers. `value` is `None`
/// for deletions.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Range-read options.
///
/// Bounds are raw key strings. `old` selects the existing rows, `live`
/// keeps the stream open for rows committed after the snapshot (puts
/// only). `reverse` affects the snapshot section only.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub old: bool,
    pub live: bool,
    pub reverse: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            old: true,
            live: false,
            reverse: false,
        }
    }
}

impl ReadOptions {
    /// Match exactly the keys composed from `key`: `gte = key`,
    /// `lte = key + SEP`.
    pub fn eq(key: impl Into<String>) -> Self {
        let key = key.into();
        let upper = format!("{key}{SEP}");
        Self {
            gte: Some(key),
            lte: Some(upper),
            ..Self::default()
        }
    }

    /// Snapshot plus live tail.
    pub fn tail() -> Self {
        Self {
            live: true,
            ..Self::default()
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        if let Some(gt) = &self.gt {
            if key <= gt.as_str() {
                return false;
            }
        }
        if let Some(gte) = &self.gte {
            if key < gte.as_str() {
                return false;
            }
        }
        if let Some(lt) = &self.lt {
            if key >= lt.as_str() {
                return false;
            }
        }
        if let Some(lte) = &self.lte {
            if key > lte.as_str() {
                return false;
            }
        }
        true
    }

    /// Normalize to an inclusive start / exclusive end scan range.
    ///
    /// `k + '\0'` is the immediate successor of `k` in byte order, which
    /// turns the exclusive/inclusive variants into one canonical form.
    fn scan_range(&self) -> (String, Option<String>) {
        let start = match (&self.gte, &self.gt) {
            (Some(gte), _) => gte.clone(),
            (None, Some(gt)) => format!("{gt}\0"),
            (None, None) => String::new(),
        };
        let end = match (&self.lt, &self.lte) {
            (Some(lt), _) => Some(lt.clone()),
            (None, Some(lte)) => Some(format!("{lte}\0")),
            (None, None) => None,
        };
        (start, end)
    }
}

/// Storage contract backing a [`Keyspace`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    /// Apply `batch` atomically.
    async fn write(&self, batch: &[KvOp]) -> anyhow::Result<()>;
    /// Rows with `start <= key` and, when given, `key < end`, ascending.
    async fn scan(&self, start: &str, end: Option<&str>) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// In-memory backend over a shared ordered map. Cloning shares storage.
#[derive(Clone, Default)]
pub struct MemoryKvBackend {
    map: Arc<StdMutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.map.lock().expect("kv map lock").get(key).cloned())
    }

    async fn write(&self, batch: &[KvOp]) -> anyhow::Result<()> {
        let mut map = self.map.lock().expect("kv map lock");
        for op in batch {
            match op {
                KvOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                KvOp::Del { key } => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, start: &str, end: Option<&str>) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let map = self.map.lock().expect("kv map lock");
        let upper = match end {
            Some(end) => Bound::Excluded(end.to_string()),
            None => Bound::Unbounded,
        };
        Ok(map
            .range((Bound::Included(start.to_string()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// SQLite-backed namespace; one file per keyspace. Keys are stored as
/// BLOBs so that range comparisons are memcmp, matching the in-memory
/// backend's byte order.
pub struct SqliteKvBackend {
    path: PathBuf,
}

impl SqliteKvBackend {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let backend = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = backend.open_connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(backend)
    }

    fn open_connection(&self) -> anyhow::Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }
}

fn key_from_blob(blob: Vec<u8>) -> anyhow::Result<String> {
    String::from_utf8(blob).map_err(|_| anyhow::anyhow!("non-utf8 key in keyspace"))
}

#[async_trait]
impl KvBackend for SqliteKvBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path.clone();
        let key = key.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            Ok(conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()?)
        })
        .await?
    }

    async fn write(&self, batch: &[KvOp]) -> anyhow::Result<()> {
        let path = self.path.clone();
        let batch = batch.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            for op in &batch {
                match op {
                    KvOp::Put { key, value } => {
                        tx.execute(
                            "INSERT INTO kv(key, value) VALUES(?1, ?2)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                            params![key.as_bytes().to_vec(), value],
                        )?;
                    }
                    KvOp::Del { key } => {
                        tx.execute(
                            "DELETE FROM kv WHERE key = ?1",
                            params![key.as_bytes().to_vec()],
                        )?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn scan(&self, start: &str, end: Option<&str>) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let path = self.path.clone();
        let start = start.as_bytes().to_vec();
        let end = end.map(|e| e.as_bytes().to_vec());
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut rows = Vec::new();
            match end {
                Some(end) => {
                    let mut stmt = conn.prepare(
                        "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
                    )?;
                    let mapped = stmt.query_map(params![start, end], |row| {
                        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?;
                    for row in mapped {
                        let (key, value) = row?;
                        rows.push((key_from_blob(key)?, value));
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key ASC")?;
                    let mapped = stmt.query_map(params![start], |row| {
                        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?;
                    for row in mapped {
                        let (key, value) = row?;
                        rows.push((key_from_blob(key)?, value));
                    }
                }
            }
            Ok(rows)
        })
        .await?
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct KeyspaceState {
    backend: Box<dyn KvBackend>,
    subscribers: Vec<mpsc::UnboundedSender<KvEvent>>,
    closed: bool,
}

/// One exclusively-owned ordered namespace with live range streams.
#[derive(Clone)]
pub struct Keyspace {
    name: Arc<String>,
    state: Arc<Mutex<KeyspaceState>>,
    closed: CancellationToken,
}

impl Keyspace {
    pub fn new(name: impl Into<String>, backend: Box<dyn KvBackend>) -> Self {
        Self {
            name: Arc::new(name.into()),
            state: Arc::new(Mutex::new(KeyspaceState {
                backend,
                subscribers: Vec::new(),
                closed: false,
            })),
            closed: CancellationToken::new(),
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(MemoryKvBackend::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        state.backend.get(key).await
    }

    /// Apply `batch` atomically and publish one event per operation to
    /// every live subscriber.
    pub async fn commit(&self, batch: Vec<KvOp>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            anyhow::bail!("keyspace {} is closed", self.name);
        }
        state.backend.write(&batch).await?;
        for op in &batch {
            let event = match op {
                KvOp::Put { key, value } => KvEvent {
                    key: key.clone(),
                    value: Some(value.clone()),
                },
                KvOp::Del { key } => KvEvent {
                    key: key.clone(),
                    value: None,
                },
            };
            state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        Ok(())
    }

    /// Range read over raw key/value pairs.
    ///
    /// The snapshot and the live subscription are taken under one lock, so
    /// no commit is ever missed or delivered twice. The live section emits
    /// puts only.
    pub async fn read_raw(&self, opts: ReadOptions) -> anyhow::Result<RawReadStream> {
        let mut state = self.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        if opts.old {
            let (start, end) = opts.scan_range();
            let mut snapshot = state.backend.scan(&start, end.as_deref()).await?;
            if opts.reverse {
                snapshot.reverse();
            }
            for (key, value) in snapshot {
                let _ = tx.send((key, value));
            }
        }

        if opts.live && !state.closed {
            let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<KvEvent>();
            state.subscribers.push(raw_tx);
            let bounds = opts.clone();
            tokio::spawn(async move {
                while let Some(event) = raw_rx.recv().await {
                    let Some(value) = event.value else {
                        continue;
                    };
                    if !bounds.contains(&event.key) {
                        continue;
                    }
                    if tx.send((event.key, value)).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(RawReadStream { rx })
    }

    /// Idempotent. Ends every live stream and releases the backend.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.subscribers.clear();
        self.closed.cancel();
        debug!(keyspace = %self.name, "keyspace closed");
        state.backend.close().await
    }
}

/// Ordered stream of raw `(key, value)` pairs from [`Keyspace::read_raw`].
pub struct RawReadStream {
    rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
}

impl RawReadStream {
    pub async fn next(&mut self) -> Option<(String, Vec<u8>)> {
        self.rx.recv().await
    }
}
