use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the core. Per-file failures are recovered into
/// stats counters by the processor; everything else propagates to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("index missing: {0}")]
    IndexMissing(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("embedder failure: {0}")]
    EmbedderFailure(String),

    #[error("store write failed for {} point(s)", failed_ids.len())]
    StoreWriteFailed { failed_ids: Vec<Uuid> },

    #[error("operation canceled")]
    Canceled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }

    /// Stable wire-protocol name for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotARepo(_) => "NotARepo",
            Error::ConfigInvalid(_) => "ConfigInvalid",
            Error::IndexMissing(_) => "IndexMissing",
            Error::BackendUnavailable(_) => "BackendUnavailable",
            Error::EmbedderFailure(_) => "EmbedderFailure",
            Error::StoreWriteFailed { .. } => "StoreWriteFailed",
            Error::Canceled => "Canceled",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Internal(_) => "Internal",
        }
    }

    /// Rebuild an error from its wire kind and message (client side).
    pub fn from_kind(kind: &str, message: &str) -> Self {
        match kind {
            "NotARepo" => Error::NotARepo(message.into()),
            "ConfigInvalid" => Error::ConfigInvalid(message.into()),
            "IndexMissing" => Error::IndexMissing(message.into()),
            "BackendUnavailable" => Error::BackendUnavailable(message.into()),
            "EmbedderFailure" => Error::EmbedderFailure(message.into()),
            "StoreWriteFailed" => Error::StoreWriteFailed { failed_ids: Vec::new() },
            "Canceled" => Error::Canceled,
            "InvalidArgument" => Error::InvalidArgument(message.into()),
            _ => Error::Internal(message.into()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::BackendUnavailable(err.to_string())
    }
}

impl From<tantivy::TantivyError> for Error {
    fn from(err: tantivy::TantivyError) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_over_the_wire() {
        let errs = [
            Error::NotARepo("x".into()),
            Error::IndexMissing("fts".into()),
            Error::Canceled,
            Error::InvalidArgument("bad".into()),
        ];
        for e in errs {
            let rebuilt = Error::from_kind(e.kind(), "msg");
            assert_eq!(rebuilt.kind(), e.kind());
        }
    }

    #[test]
    fn store_write_failed_reports_count() {
        let e = Error::StoreWriteFailed { failed_ids: vec![Uuid::nil(), Uuid::nil()] };
        assert!(e.to_string().contains("2 point(s)"));
    }
}
