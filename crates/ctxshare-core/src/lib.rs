pub mod cbor;
pub mod engine;
pub mod error;
pub mod feed;
pub mod forward;
pub mod indexer;
pub mod keeper;
pub mod kv;
pub mod lexint;
pub mod message_view;
pub mod share_view;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use engine::{
    ContextStreamRequest, Engine, EngineConfig, EngineHandle, EngineHooks, MessagesRequest, Node,
    ShareRequest, UnshareRequest,
};
pub use error::EngineError;
pub use feed::{ChangeEntry, ChangePayload, Feed, FeedStream, MemoryFeed, ObjRef, ShareCtx, UnshareCtx};
pub use forward::ForwardingController;
pub use indexer::{IndexDef, IndexHandle, Indexer, Projection, ReadStream, Step};
pub use keeper::{Keeper, MemoryKeeper, MemoryObjects, Objects};
pub use kv::{
    Keyspace, KvBackend, KvEvent, KvOp, MemoryKvBackend, RawReadStream, ReadOptions,
    SqliteKvBackend, KEY_MAX, SEP,
};
pub use lexint::lexint_hex;
pub use message_view::{
    context_range, default_context_fn, default_seq_fn, ContextFn, MessageProjection,
    MessageRecord, SeqFn, CONTEXT_INDEX,
};
pub use share_view::{cfr_key, share_primary_key, ShareProjection, ShareState, CFR_INDEX};
pub use worker::{DeliveryJob, SendWorker, Worker};
