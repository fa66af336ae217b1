//! Error taxonomy and failure classification.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! carries enough context (host, port, identity name, SCP status code) for the
//! caller to decide between retrying and aborting. Nothing here retries on its
//! own; [`Error::is_retryable`] only classifies.
//!
//! # Classification Strategy
//!
//! Transport failures reach us as free-form messages, so classification is
//! keyword based:
//!
//! 1. **Authentication failures (NOT retryable)**: wrong passwords, rejected
//!    keys, denied access. Retrying cannot help and may lock accounts out.
//!
//! 2. **Session-down failures (retryable after reconnect)**: the transport
//!    went away underneath a channel request.
//!
//! 3. **Channel-open failures**: the server refused or timed out a channel
//!    request while the session itself stayed up.
//!
//! Authentication patterns take precedence over everything else.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::channel::ChannelKind;

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Patterns that indicate the underlying transport is gone.
const SESSION_DOWN_ERRORS: &[&str] = &[
    "disconnect",
    "hup",
    "connection reset",
    "broken pipe",
    "session closed",
    "channel send error",
    "send error",
    "not connected",
    "keepalive",
    "inactivity",
];

/// Patterns that indicate the server refused or timed out a channel request.
const CHANNEL_OPEN_ERRORS: &[&str] = &[
    "channel open failure",
    "administratively prohibited",
    "resource shortage",
    "unknown channel type",
    "connect failed",
    "timeout",
    "timed out",
];

/// Transient connection failures worth a caller-driven retry.
const TRANSIENT_CONNECT_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Why a channel could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenReason {
    /// The session is not connected or its transport was lost.
    SessionDown,
    /// The session is up but the channel request failed, most likely a
    /// session-level timeout or a server refusal.
    ChannelOpenFailed,
    /// Anything else.
    Unknown,
}

impl fmt::Display for ChannelOpenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOpenReason::SessionDown => write!(f, "session down"),
            ChannelOpenReason::ChannelOpenFailed => write!(f, "channel open failed"),
            ChannelOpenReason::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to {username}@{host}:{port}: {reason}")]
    Connection {
        host: String,
        port: u16,
        username: String,
        reason: String,
    },

    #[error("session to {host}:{port} is not connected")]
    NotConnected { host: String, port: u16 },

    #[error("failed to open {kind} channel ({reason}): {message}")]
    ChannelOpen {
        kind: ChannelKind,
        reason: ChannelOpenReason,
        message: String,
    },

    #[error("unsupported sftp command: {0}")]
    UnsupportedCommand(String),

    #[error("invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("{} ({code}): {message}", scp_error_label(.code))]
    Scp { code: i32, message: String },

    #[error("scp protocol error: {0}")]
    ScpProtocol(String),

    #[error("cannot copy directory {0:?} without the recursive flag")]
    DirectoryCopyWithoutRecursiveFlag(PathBuf),

    #[error("cannot copy {count} remote files to the single file {destination:?}")]
    MultipleFilesToSingleDestination { destination: PathBuf, count: usize },

    #[error("no passphrase available for encrypted identity {identity}")]
    PassphraseNotFound { identity: String },

    #[error("cannot construct identity: {0}")]
    UnknownIdentityConstruction(String),

    #[error("invalid value {value:?} for session option {key}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unsupported output encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("transfer cancelled by progress monitor")]
    TransferCancelled,

    #[error("port forwarding failed: {0}")]
    Forward(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("SFTP error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Human-readable label for an SCP acknowledgement code.
pub(crate) fn scp_error_label(code: &i32) -> &'static str {
    match code {
        1 => "scp error",
        2 => "scp fatal error",
        -1 => "disconnect error",
        _ => "scp protocol error",
    }
}

impl Error {
    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Authentication failures are never retryable. Channel failures caused
    /// by a lost session are retryable after reconnecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { reason, .. } => is_retryable_connect_error(reason),
            Error::ChannelOpen { reason, .. } => *reason == ChannelOpenReason::SessionDown,
            Error::NotConnected { .. } => true,
            Error::Scp { code, .. } => *code == -1,
            _ => false,
        }
    }

    /// SCP status code carried by this error, if it is an SCP acknowledgement failure.
    pub fn scp_code(&self) -> Option<i32> {
        match self {
            Error::Scp { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Determines whether a connection failure message describes a transient problem.
///
/// Authentication patterns are checked first and win over connection
/// patterns, so "timeout during authentication failed" is not retryable.
pub(crate) fn is_retryable_connect_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    TRANSIENT_CONNECT_ERRORS
        .iter()
        .any(|p| error_lower.contains(p))
}

/// Classify a failed channel request.
///
/// `session_closed` reflects the transport state observed right after the
/// failure and overrides message inspection.
pub(crate) fn classify_channel_open(
    error: &russh::Error,
    session_closed: bool,
) -> ChannelOpenReason {
    if session_closed {
        return ChannelOpenReason::SessionDown;
    }
    if matches!(error, russh::Error::ChannelOpenFailure(_)) {
        return ChannelOpenReason::ChannelOpenFailed;
    }
    classify_channel_open_message(&error.to_string())
}

fn classify_channel_open_message(message: &str) -> ChannelOpenReason {
    let message = message.to_lowercase();

    if SESSION_DOWN_ERRORS.iter().any(|p| message.contains(p)) {
        ChannelOpenReason::SessionDown
    } else if CHANNEL_OPEN_ERRORS.iter().any(|p| message.contains(p)) {
        ChannelOpenReason::ChannelOpenFailed
    } else {
        ChannelOpenReason::Unknown
    }
}

/// Build a [`Error::ChannelOpen`] from a transport error.
pub(crate) fn channel_open_error(
    kind: ChannelKind,
    error: &russh::Error,
    session_closed: bool,
) -> Error {
    Error::ChannelOpen {
        kind,
        reason: classify_channel_open(error, session_closed),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod connect_classification {
        use super::*;

        #[test]
        fn test_auth_failures_not_retryable() {
            assert!(!is_retryable_connect_error("Permission denied"));
            assert!(!is_retryable_connect_error("Authentication failed"));
            assert!(!is_retryable_connect_error("publickey rejected"));
        }

        #[test]
        fn test_transient_failures_retryable() {
            assert!(is_retryable_connect_error("Connection refused"));
            assert!(is_retryable_connect_error("Network is unreachable"));
            assert!(is_retryable_connect_error("Connection timed out after 30s"));
        }

        #[test]
        fn test_auth_takes_precedence() {
            assert!(!is_retryable_connect_error(
                "Connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_unknown_message_not_retryable() {
            assert!(!is_retryable_connect_error("SSH version mismatch"));
            assert!(!is_retryable_connect_error(""));
        }

        #[test]
        fn test_case_insensitivity() {
            assert!(!is_retryable_connect_error("PERMISSION DENIED"));
            assert!(is_retryable_connect_error("CONNECTION REFUSED"));
        }
    }

    mod channel_classification {
        use super::*;

        #[test]
        fn test_closed_session_wins() {
            let err = russh::Error::Inconsistent;
            assert_eq!(
                classify_channel_open(&err, true),
                ChannelOpenReason::SessionDown
            );
        }

        #[test]
        fn test_session_down_messages() {
            assert_eq!(
                classify_channel_open_message("Disconnected"),
                ChannelOpenReason::SessionDown
            );
            assert_eq!(
                classify_channel_open_message("Channel send error"),
                ChannelOpenReason::SessionDown
            );
        }

        #[test]
        fn test_channel_open_failed_messages() {
            assert_eq!(
                classify_channel_open_message("Channel open failure: administratively prohibited"),
                ChannelOpenReason::ChannelOpenFailed
            );
            assert_eq!(
                classify_channel_open_message("operation timed out"),
                ChannelOpenReason::ChannelOpenFailed
            );
        }

        #[test]
        fn test_unknown_message() {
            assert_eq!(
                classify_channel_open_message("something odd"),
                ChannelOpenReason::Unknown
            );
        }
    }

    mod error_values {
        use super::*;

        #[test]
        fn test_scp_error_display_carries_label() {
            let err = Error::Scp {
                code: 1,
                message: "no such file".to_string(),
            };
            assert_eq!(err.to_string(), "scp error (1): no such file");
            assert_eq!(err.scp_code(), Some(1));

            let fatal = Error::Scp {
                code: 2,
                message: "boom".to_string(),
            };
            assert_eq!(fatal.to_string(), "scp fatal error (2): boom");

            let eof = Error::Scp {
                code: -1,
                message: "unexpected end of stream".to_string(),
            };
            assert!(eof.to_string().starts_with("disconnect error"));
            assert!(eof.is_retryable());
        }

        #[test]
        fn test_session_down_is_retryable() {
            let err = Error::ChannelOpen {
                kind: ChannelKind::Exec,
                reason: ChannelOpenReason::SessionDown,
                message: "gone".to_string(),
            };
            assert!(err.is_retryable());

            let err = Error::ChannelOpen {
                kind: ChannelKind::Exec,
                reason: ChannelOpenReason::ChannelOpenFailed,
                message: "refused".to_string(),
            };
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_precondition_errors_not_retryable() {
            let err = Error::DirectoryCopyWithoutRecursiveFlag(PathBuf::from("/tmp/dir"));
            assert!(!err.is_retryable());
            assert_eq!(err.scp_code(), None);
        }

        #[test]
        fn test_connection_error_context() {
            let err = Error::Connection {
                host: "example.com".to_string(),
                port: 2222,
                username: "deploy".to_string(),
                reason: "Connection refused".to_string(),
            };
            assert_eq!(
                err.to_string(),
                "failed to connect to deploy@example.com:2222: Connection refused"
            );
            assert!(err.is_retryable());
        }
    }
}
