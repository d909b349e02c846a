use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// Identity whose mutation queue and overlays are active.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which the user's rows are stored.
    pub fn storage_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

impl Default for User {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => write!(f, "User(anonymous)"),
        }
    }
}

/// Supplies auth tokens to the streams.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Drops any cached token so the next `get_token` fetches a fresh one.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;
