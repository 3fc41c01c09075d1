//! The closed error surface of the storage layer.
//!
//! Backends translate wire-level failures into one of the [`ErrorKind`]
//! variants; the transfer engine makes its retry decisions on the kind
//! alone. Messages carry the kind, the uri involved and a short actionable
//! hint. They never carry credentials, SAS tokens, raw SDK payloads or
//! stack traces.

use std::fmt;

use crate::uri::ObjectUri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    MalformedUri,
    UnsupportedScheme,
    NotFound,
    Permission,
    Authentication,
    Network,
    Timeout,
    ChecksumMismatch,
    SizeLimit,
    EtagChanged,
    NotEmpty,
    NotImplemented,
    HasDependents,
    Interrupted,
    OutOfScratch,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedUri => "malformedUri",
            ErrorKind::UnsupportedScheme => "unsupportedScheme",
            ErrorKind::NotFound => "notFound",
            ErrorKind::Permission => "permission",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ChecksumMismatch => "checksumMismatch",
            ErrorKind::SizeLimit => "sizeLimit",
            ErrorKind::EtagChanged => "etagChanged",
            ErrorKind::NotEmpty => "notEmpty",
            ErrorKind::NotImplemented => "notImplemented",
            ErrorKind::HasDependents => "hasDependents",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::OutOfScratch => "outOfScratch",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds the engine retries with backoff. Everything else fails the
    /// operation immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
    uri: Option<ObjectUri>,
    source: Option<anyhow::Error>,
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        StoreError {
            kind,
            message: message.into(),
            uri: None,
            source: None,
        }
    }

    pub fn with_uri(mut self, uri: &ObjectUri) -> Self {
        self.uri = Some(uri.clone());
        self
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The operation was cancelled through its token.
    pub fn cancelled() -> Self {
        StoreError::new(ErrorKind::Interrupted, "operation cancelled")
    }

    pub fn timeout() -> Self {
        StoreError::new(ErrorKind::Timeout, "request timed out")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn uri(&self) -> Option<&ObjectUri> {
        self.uri.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_cancel(&self) -> bool {
        self.kind == ErrorKind::Interrupted
    }

    pub(crate) fn from_io(err: std::io::Error, uri: &ObjectUri) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::Permission,
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe => ErrorKind::Network,
            _ => ErrorKind::Internal,
        };
        StoreError::new(kind, err.to_string())
            .with_uri(uri)
            .with_source(err)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(uri) = &self.uri {
            write!(f, " ({uri})")?;
        }
        Ok(())
    }
}

/// Marker error for requests that stopped due to the shared timeout or the
/// caller's cancellation token, kept distinct so `?`-chains can tell the
/// two apart from genuine wire failures.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOrCancel {
    #[error("request timed out")]
    Timeout,
    #[error("request was cancelled")]
    Cancel,
}

impl TimeoutOrCancel {
    pub fn caused_by_cancel(error: &anyhow::Error) -> bool {
        matches!(error.root_cause().downcast_ref(), Some(TimeoutOrCancel::Cancel))
    }
}

impl From<TimeoutOrCancel> for StoreError {
    fn from(value: TimeoutOrCancel) -> Self {
        match value {
            TimeoutOrCancel::Timeout => StoreError::timeout(),
            TimeoutOrCancel::Cancel => StoreError::cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set_is_exact() {
        let transient: Vec<_> = [
            ErrorKind::MalformedUri,
            ErrorKind::UnsupportedScheme,
            ErrorKind::NotFound,
            ErrorKind::Permission,
            ErrorKind::Authentication,
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::ChecksumMismatch,
            ErrorKind::SizeLimit,
            ErrorKind::EtagChanged,
            ErrorKind::NotEmpty,
            ErrorKind::NotImplemented,
            ErrorKind::HasDependents,
            ErrorKind::Interrupted,
            ErrorKind::OutOfScratch,
            ErrorKind::Internal,
        ]
        .into_iter()
        .filter(ErrorKind::is_transient)
        .collect();
        assert_eq!(transient, vec![ErrorKind::Network, ErrorKind::Timeout]);
    }

    #[test]
    fn display_includes_kind_and_uri() {
        let uri = ObjectUri::parse("s3://b/key").unwrap();
        let err = StoreError::new(ErrorKind::NotFound, "no such object").with_uri(&uri);
        assert_eq!(err.to_string(), "notFound: no such object (s3://b/key)");
    }
}
