//! Unit-of-work persistence for event-sourced entities.
//!
//! An [`Engine`] wires a log store ([`EventStore`]), a shared
//! [`TieredCache`], a [`SnapshotStore`] and a [`Dispatcher`] together. Each
//! unit of work takes a [`Repository`] from the engine, loads or creates
//! entities, applies events to them and commits. Version conflicts on
//! commit are handed to a [`ConflictResolver`] chosen per entity type.

mod cache;
mod cancel;
mod context;
mod delayed;
mod dispatch;
mod engine;
mod entity;
mod error;
mod event;
mod factory;
mod id;
mod memory;
mod repository;
mod resolver;
mod snapshot;
mod state;
mod store;
mod stream;

pub use cache::{CacheConfig, CacheStats, CacheTtl, SweeperHandle, Tier, TieredCache};
pub use cancel::{CancelHandle, Cancellation};
pub use context::CommitContext;
pub use delayed::DelayedQueue;
pub use dispatch::{ChannelDispatcher, Dispatcher, NullDispatcher, OutgoingEvent};
pub use engine::{Engine, EngineBuilder};
pub use entity::{
    Entity, NEW_VERSION, OOB_DAYS_TO_LIVE_HEADER, OOB_ID_HEADER, OOB_TRANSIENT_HEADER, OobEvent,
};
pub use error::{ConflictError, DispatchError, RepositoryError, ResolveError, StoreError};
pub use event::{
    EventDescriptor, FullEvent, Headers, ProposedEvent, RecordedEvent, StreamType, decode_event,
    encode_event, event_id,
};
pub use factory::EntityFactory;
pub use id::{Id, Parent};
pub use memory::MemoryStore;
pub use repository::{CommitOutcome, CommitReport, Repository};
pub use resolver::{
    ConflictResolver, ConflictStrategy, Conflicting, DiscardResolver, FreezeConfig, IgnoreResolver,
    Resolution, StrongResolver, ThrowResolver, WeakConfig, WeakResolver, resolver_for,
};
pub use snapshot::{SNAPSHOT_EVENT_TYPE, Snapshot, SnapshotStore};
pub use state::{Route, State};
pub use store::{EventStore, ExpectedVersion};
pub use stream::{StreamIdentity, StreamKeyFn, default_stream_key, uuid_stream_key};
