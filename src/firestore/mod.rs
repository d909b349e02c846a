//! Offline-first document sync: a local cache with optimistic writes, kept
//! consistent with a backend over listen and write streams.

pub mod api;
pub mod core;
pub mod credentials;
pub mod error;
pub mod local;
pub mod model;
mod query_evaluator;
pub mod remote;
pub mod settings;
pub mod value;

pub use api::{DocumentChange, DocumentSnapshot, FirestoreClient, ListenerRegistration, QuerySnapshot, SnapshotMetadata};
pub use self::core::{ChangeType, ListenOptions, Query};
pub use credentials::{NoopTokenProvider, TokenProvider, TokenProviderArc, User};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::{FirestoreSettings, PersistenceMode, RemoteSettings};
