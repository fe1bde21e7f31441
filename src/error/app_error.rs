use std::fmt;

#[derive(Debug)]
pub enum SyncError {
    // Large-capacity cache errors
    Cache(sqlx::Error),

    // Small-capacity store rejected the write
    QuotaExceeded(String),

    // Remote store errors
    Remote(String),
    Decode(DecodeError),

    // Resource errors
    NotFound(String),

    // No remote backend available for this session
    Unconfigured(String),

    // Encoding errors
    Serialization(serde_json::Error),
    Io(std::io::Error),

    // Internal errors
    Internal(String),
}

/// A remote payload that did not match the collection's wire schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub collection: &'static str,
    pub id: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(collection: &'static str, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} record {}: {}",
            self.collection, self.id, self.message
        )
    }
}

impl std::error::Error for DecodeError {}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Cache(e) => write!(f, "Cache error: {}", e),
            SyncError::QuotaExceeded(msg) => write!(f, "Quota exceeded: {}", msg),
            SyncError::Remote(msg) => write!(f, "Remote store error: {}", msg),
            SyncError::Decode(e) => write!(f, "Decode error: {}", e),
            SyncError::NotFound(msg) => write!(f, "Not found: {}", msg),
            SyncError::Unconfigured(msg) => write!(f, "Backend not configured: {}", msg),
            SyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SyncError::Io(e) => write!(f, "I/O error: {}", e),
            SyncError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl SyncError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, SyncError::QuotaExceeded(_))
    }

    /// Short machine-readable code, recorded in the store's `sync_error` field.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Cache(_) => "CACHE_ERROR",
            SyncError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            SyncError::Remote(_) => "REMOTE_ERROR",
            SyncError::Decode(_) => "DECODE_ERROR",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::Unconfigured(_) => "UNCONFIGURED",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

// From implementations for automatic conversion
impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => SyncError::NotFound("Cached row not found".to_string()),
            _ => SyncError::Cache(err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err)
    }
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::Decode(err)
    }
}

// Result type alias
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: SyncError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn decode_error_display_names_collection_and_id() {
        let err = SyncError::from(DecodeError::new("notes", "n1", "missing field `x`"));
        assert_eq!(
            err.to_string(),
            "Decode error: invalid notes record n1: missing field `x`"
        );
        assert_eq!(err.code(), "DECODE_ERROR");
    }
}
