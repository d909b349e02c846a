//! Queries, views and the engine that keeps them in sync.

pub mod async_queue;
pub mod document_set;
pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

#[doc(inline)]
pub use async_queue::{AsyncQueue, DelayedOperation};
#[doc(inline)]
pub use document_set::DocumentSet;
#[doc(inline)]
pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener, SnapshotObserver};
#[doc(inline)]
pub use query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query, Target};
#[doc(inline)]
pub use sync_engine::{RemoteCommand, SyncEngine, WriteCallback};
#[doc(inline)]
pub use target_id_generator::TargetIdGenerator;
#[doc(inline)]
pub use view::{LimboDocumentChange, SyncState, View, ViewChange, ViewDocumentChanges};
#[doc(inline)]
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
