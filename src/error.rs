//! Error types for the query engine

use thiserror::Error;

/// Main error type for the query engine
///
/// Client-input problems are split into two kinds: [`QueryError::InvalidField`]
/// for field expressions that cannot be parsed or name an unsupported
/// operation, and [`QueryError::InvalidParams`] for every other validation
/// failure. Both map to a 4xx-equivalent outcome at the request boundary and
/// are never retried.
#[derive(Error, Debug)]
pub enum QueryError {
    /// A field expression could not be parsed or names an unknown operation
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// Any other client-input validation failure (filter syntax, tag names,
    /// orderBy/limit conflicts, time window, unknown metric or tag)
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// An entity kind the backend does not implement yet
    ///
    /// This is a server-side capability gap, not a client error, and must
    /// never be coerced into an empty result.
    #[error("Entity not yet implemented: {0}")]
    UnsupportedEntity(String),

    /// The backend rejected or failed to execute a compiled query
    #[error("Backend error: {0}")]
    Backend(String),

    /// Indexer/backend inconsistency
    ///
    /// Raised when a code that is known to exist in backend results (e.g. a
    /// metric id coming back from a query) cannot be reverse-resolved. This
    /// is an internal invariant violation, not bad input.
    #[error("Indexer inconsistency: {0}")]
    Inconsistent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl QueryError {
    /// Whether this error was caused by client input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidField(_) | QueryError::InvalidParams(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, QueryError>;
