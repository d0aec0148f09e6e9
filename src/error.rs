//! Error types for the Skeleton Crew daemon

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Skeleton Crew operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds carried on the wire.
///
/// These identifiers are part of the network contract: remote callers and
/// the audit log match on them, so variants are never renamed or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgs,
    ToolNotFound,
    ToolExists,
    JackUnavailable,
    EndpointMissing,
    DirectionMismatch,
    AlreadyConnected,
    NotConnected,
    TargetInPast,
    RemoteTimeout,
    /// Carried by the discovery `id_collision` warning event; no
    /// fallible operation returns it
    IdCollision,
    Internal,
}

impl ErrorKind {
    /// Wire identifier for this kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgs => "invalid_args",
            Self::ToolNotFound => "tool_not_found",
            Self::ToolExists => "tool_exists",
            Self::JackUnavailable => "jack_unavailable",
            Self::EndpointMissing => "endpoint_missing",
            Self::DirectionMismatch => "direction_mismatch",
            Self::AlreadyConnected => "already_connected",
            Self::NotConnected => "not_connected",
            Self::TargetInPast => "target_in_past",
            Self::RemoteTimeout => "remote_timeout",
            Self::IdCollision => "id_collision",
            Self::Internal => "internal",
        }
    }

    /// Whether a caller is advised to retry the failed operation.
    ///
    /// Resource and timeout errors may clear up on their own; validation,
    /// state, and conflict errors will not.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::JackUnavailable | Self::RemoteTimeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field-level validation problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDiagnostic {
    /// Parameter name
    pub field: String,
    /// What is wrong with it
    pub problem: String,
}

/// Errors that can occur in the Skeleton Crew daemon
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Tool arguments failed schema validation
    #[error("invalid arguments: {}", format_diagnostics(.0))]
    InvalidArgs(Vec<FieldDiagnostic>),

    /// No tool registered under the requested name
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A tool with this name is already registered
    #[error("tool already registered: {0}")]
    ToolExists(String),

    /// The JACK server is not reachable
    #[error("JACK unavailable: {0}")]
    JackUnavailable(String),

    /// A named port does not exist in the JACK graph
    #[error("port not found: {0}")]
    EndpointMissing(String),

    /// Connection endpoints have the wrong directions
    #[error("direction mismatch: {0}")]
    DirectionMismatch(String),

    /// The connection already exists
    #[error("already connected: {source_port} -> {sink_port}")]
    AlreadyConnected {
        source_port: String,
        sink_port: String,
    },

    /// The connection does not exist
    #[error("not connected: {source_port} -> {sink_port}")]
    NotConnected {
        source_port: String,
        sink_port: String,
    },

    /// A scheduled target instant is already in the past
    #[error("target instant in the past by {behind_ms:.1}ms")]
    TargetInPast { behind_ms: f64 },

    /// A remote invocation did not answer within the caller's timeout
    #[error("remote invocation timed out after {timeout_ms}ms")]
    RemoteTimeout { timeout_ms: u64 },

    /// Discovery error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Transport wire protocol error
    #[error("transport wire error: {0}")]
    Wire(String),

    /// Voice pipeline error
    #[error("voice error: {0}")]
    Voice(String),

    /// Recognizer backend error
    #[error("recognizer error: {0}")]
    Recognizer(String),

    /// Audio capture/recording error
    #[error("audio error: {0}")]
    Audio(String),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error onto its stable wire kind.
    ///
    /// Infrastructure errors (io, http, serde, database) collapse to
    /// `internal` so implementation detail never leaks onto the wire.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgs(_) => ErrorKind::InvalidArgs,
            Self::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Self::ToolExists(_) => ErrorKind::ToolExists,
            Self::JackUnavailable(_) => ErrorKind::JackUnavailable,
            Self::EndpointMissing(_) => ErrorKind::EndpointMissing,
            Self::DirectionMismatch(_) => ErrorKind::DirectionMismatch,
            Self::AlreadyConnected { .. } => ErrorKind::AlreadyConnected,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::TargetInPast { .. } => ErrorKind::TargetInPast,
            Self::RemoteTimeout { .. } => ErrorKind::RemoteTimeout,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the caller is advised to retry
    #[must_use]
    pub const fn retryable(&self) -> bool {
        self.kind().retryable()
    }
}

fn format_diagnostics(diags: &[FieldDiagnostic]) -> String {
    diags
        .iter()
        .map(|d| format!("{}: {}", d.field, d.problem))
        .collect::<Vec<_>>()
        .join("; ")
}
