use thiserror::Error;

/// Errors produced by the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    /// The requested table was not declared when the store was opened.
    #[error("table {0} does not exist")]
    TableNotFound(&'static str),
    /// A stored value could not be decoded into its model type.
    #[error("failed to decode stored value in table {table}")]
    Decode {
        /// The table the malformed value was read from.
        table: &'static str,
    },
    /// Backend-specific failure.
    #[error("database backend error: {0}")]
    Backend(String),
}
