//! Error taxonomy for ARIEL.
//!
//! Configuration and module-gating errors are raised immediately; nothing in
//! the library silently degrades when a module is disabled. Driver failures
//! are wrapped in [`ArielError::DatabaseQuery`] together with the operation
//! that was attempted, via the [`DbContext`] extension trait.

use thiserror::Error;

/// Main error type for ARIEL operations.
#[derive(Error, Debug)]
pub enum ArielError {
    /// Invalid or missing configuration, a disabled module, or a missing table.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A module-specific operation was invoked while the module is disabled.
    #[error("Module '{module}' is not enabled (required by {operation})")]
    ModuleNotEnabled { module: String, operation: String },

    #[error("Database error during {operation}: {source}")]
    DatabaseQuery {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Unknown ingestion adapter '{name}'. Available: {}", .available.join(", "))]
    AdapterNotFound { name: String, available: Vec<String> },

    #[error("Ingestion error: {0}")]
    Ingestion(String),

    #[error("Migration '{name}' failed: {source}")]
    Migration {
        name: String,
        #[source]
        source: Box<ArielError>,
    },

    /// Returned by migrations that do not implement `down()`.
    #[error("Migration '{0}' does not support rollback")]
    RollbackNotImplemented(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Reasoning error: {0}")]
    Reasoning(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ArielError {
    /// True for [`ArielError::Configuration`] and its gating special case
    /// [`ArielError::ModuleNotEnabled`].
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ArielError::Configuration(_) | ArielError::ModuleNotEnabled { .. }
        )
    }

    pub(crate) fn module_not_enabled(module: &str, operation: &str) -> Self {
        ArielError::ModuleNotEnabled {
            module: module.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Result type alias for ARIEL.
pub type Result<T> = std::result::Result<T, ArielError>;

/// Attach the attempted operation to a driver error.
pub trait DbContext<T> {
    fn db_context(self, operation: &str) -> Result<T>;
}

impl<T> DbContext<T> for std::result::Result<T, sqlx::Error> {
    fn db_context(self, operation: &str) -> Result<T> {
        self.map_err(|source| ArielError::DatabaseQuery {
            operation: operation.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_not_enabled_is_configuration_error() {
        let err = ArielError::module_not_enabled("semantic", "semantic_search");
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("semantic_search"));
    }

    #[test]
    fn test_adapter_not_found_lists_available() {
        let err = ArielError::AdapterNotFound {
            name: "jlab".to_string(),
            available: vec!["als_logbook".to_string(), "generic_json".to_string()],
        };
        assert!(!err.is_configuration_error());
        assert_eq!(
            err.to_string(),
            "Unknown ingestion adapter 'jlab'. Available: als_logbook, generic_json"
        );
    }

    #[test]
    fn test_db_context_records_operation() {
        let res: std::result::Result<(), sqlx::Error> = Err(sqlx::Error::RowNotFound);
        let err = res.db_context("get_entry").unwrap_err();
        match err {
            ArielError::DatabaseQuery { operation, .. } => assert_eq!(operation, "get_entry"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
