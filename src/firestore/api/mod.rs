//! The client facade and the snapshots it hands to callers.

mod client;
mod snapshot;

pub use client::{FirestoreClient, ListenerRegistration};
pub use snapshot::{DocumentChange, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};
