use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Names the backend database a client synchronizes with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    /// The `(default)` database of `project_id`.
    pub fn default_for(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// Prefix of every document name on the watch stream.
    pub fn resource_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_default_database() {
            write!(f, "{}", self.project_id)
        } else {
            write!(f, "{}/{}", self.project_id, self.database)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_resource_name() {
        let id = DatabaseId::default_for("demo");
        assert!(id.is_default_database());
        assert_eq!(id.resource_name(), "projects/demo/databases/(default)");
        assert_eq!(id.to_string(), "demo");
    }

    #[test]
    fn named_database_shows_in_display() {
        let id = DatabaseId::new("demo", "drinks");
        assert!(!id.is_default_database());
        assert_eq!(id.to_string(), "demo/drinks");
    }
}
