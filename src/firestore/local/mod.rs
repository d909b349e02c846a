//! Local persistence and the caches layered on it.

pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
mod local_serializer;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod storage;
mod table;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use local_documents_view::OverlayedDocument;
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
#[doc(inline)]
pub use persistence::{PersistedState, Persistence};
#[doc(inline)]
pub use query_engine::{QueryContext, QueryEngine};
#[doc(inline)]
pub use storage::{FileStorageBackend, MemoryStorageBackend, StorageBackend};
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
