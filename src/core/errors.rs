// Custom error types for the annotation pipeline
//
// Using thiserror for ergonomic error definitions with:
// - Type-safe error matching per pipeline stage
// - Source error chaining
// - Per-item errors that can be logged and skipped without aborting a batch

use thiserror::Error;

/// Sign-in errors (invalid credentials or unreachable identity service)
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unable to sign in. Please check your login credentials. ({0})")]
    InvalidCredentials(String),

    #[error("Identity service unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("Invalid sign-in response: {0}")]
    InvalidResponse(String),

    #[error("Session token expired, sign in again")]
    SessionExpired,
}

/// Remote metadata / record query errors
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Feature service request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Feature service returned error {code}: {message}")]
    Service { code: i64, message: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Record is missing its object id field '{field}'")]
    MissingObjectId { field: String },
}

/// Per-attachment download errors (logged, item skipped)
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Download of attachment {attachment_id} for object {object_id} failed: {reason}")]
    Remote {
        object_id: i64,
        attachment_id: i64,
        reason: String,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Download cancelled")]
    Cancelled,
}

/// Per-image annotation errors (logged, item skipped)
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("No record found for object id {0}")]
    RecordMissing(i64),

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to decode image: {0}")]
    DecodeFailed(String),

    #[error("Text rendering failed: {0}")]
    RenderFailed(String),

    #[error("Failed to encode image: {0}")]
    EncodeFailed(String),

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },
}

/// Archive building errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive I/O failed for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Zip writing failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

/// Pipeline orchestration errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Layer query failed: {0}")]
    QueryFailed(#[from] QueryError),

    #[error("Invalid object id range: start {start} > end {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("Failed to create working folder {path}: {source}")]
    WorkingFolder {
        path: String,
        source: std::io::Error,
    },

    #[error("Unknown batch: {0}")]
    UnknownBatch(String),

    #[error("Batch is still running: {0}")]
    StillRunning(String),

    #[error("Batch is already being archived or discarded: {0}")]
    ArchiveInProgress(String),

    #[error("Batch task failed: {0}")]
    TaskFailed(String),

    #[error("Archive delivery failed: {0}")]
    ArchiveFailed(#[from] ArchiveError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid portal URL: {0}")]
    InvalidPortalUrl(String),

    #[error("Invalid upload folder: {0}")]
    InvalidUploadFolder(String),

    #[error("Font size must be in [6, 200], got {0}")]
    InvalidFontSize(f32),

    #[error("Download concurrency must be > 0, got {0}")]
    InvalidConcurrency(usize),

    #[error("Token expiration must be > 0 minutes, got {0}")]
    InvalidTokenExpiration(u32),

    #[error("Font file not found: {0}")]
    FontNotFound(String),

    #[error("Retention sweep interval must be > 0 seconds, got {0}")]
    InvalidSweepInterval(u64),
}

// Convenience type aliases for Results
pub type AuthResult<T> = Result<T, AuthError>;
pub type QueryResult<T> = Result<T, QueryError>;
pub type DownloadResult<T> = Result<T, DownloadError>;
pub type AnnotationResult<T> = Result<T, AnnotationError>;
pub type ArchiveResult<T> = Result<T, ArchiveError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = DownloadError::Remote {
            object_id: 7,
            attachment_id: 3,
            reason: "404".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Download of attachment 3 for object 7 failed: 404"
        );

        let err = PipelineError::InvalidRange { start: 9, end: 2 };
        assert!(err.to_string().contains("start 9 > end 2"));
    }

    #[test]
    fn test_query_error_converts_into_pipeline_error() {
        let query = QueryError::Service {
            code: 400,
            message: "Invalid token".to_string(),
        };
        let pipeline: PipelineError = query.into();
        assert!(matches!(pipeline, PipelineError::QueryFailed(_)));
    }
}
