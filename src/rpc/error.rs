use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::rpc::messenger::registry::{ServiceAlreadyRegistered, ServiceUnavailable};
use crate::rpc::wire::{ErrorCode, ErrorStatus};

/// Errors that can occur in the messenger transport or be reported by a remote peer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The remote side answered the call with a failure.
    #[error("remote error ({code:?}): {message}")]
    Remote {
        code: ErrorCode,
        message: String,
        app_error: Option<ApplicationError>,
    },

    /// No response arrived before the per-call timeout.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Failed to reach or resolve the remote endpoint.
    #[error("network error: {0}")]
    Network(String),

    /// Socket level failure.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The connection carrying the call was closed before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to encode a protobuf message.
    #[error("protobuf encode error")]
    Encode(#[from] prost::EncodeError),

    /// Failed to decode a protobuf message.
    #[error("protobuf decode error")]
    Decode(#[from] prost::DecodeError),

    /// A frame exceeded the configured maximum message size.
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// The response has no sidecar at the requested index.
    #[error("sidecar index {index} out of range ({count} sidecars)")]
    SidecarNotFound { index: usize, count: usize },

    /// Attaching the sidecar would push the response over its size budget.
    #[error("sidecars exceed the response budget of {budget} bytes")]
    SidecarBudget { budget: usize },

    /// A method was registered twice in the same dispatch table.
    #[error("method '{0}' registered twice")]
    DuplicateMethod(String),

    #[error(transparent)]
    AlreadyRegistered(#[from] ServiceAlreadyRegistered),

    #[error(transparent)]
    Unavailable(#[from] ServiceUnavailable),

    /// The acceptor was started without a listening address.
    #[error("messenger '{0}' has no listening address")]
    NotListening(String),

    /// The messenger has been shut down or dropped.
    #[error("messenger '{0}' is shut down")]
    MessengerShutdown(String),
}

/// Structured application error carried by a failed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationError {
    /// Extension number identifying the payload's message type.
    pub ext: u32,
    pub payload: Bytes,
}

/// Coarse classification of an [`RpcError`], used for asserting expected outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Application,
    NoSuchMethod,
    NoSuchService,
    InvalidRequest,
    ServerTooBusy,
    ServiceUnavailable,
    Fatal,
    Network,
    TimedOut,
    Internal,
}

impl RpcError {
    /// Rebuild the client side error from a failure status received on the wire.
    pub fn from_status(status: ErrorStatus) -> Self {
        let code = ErrorCode::try_from(status.code).unwrap_or(ErrorCode::Unknown);
        let app_error = status.app_error_ext.map(|ext| ApplicationError {
            ext,
            payload: status.app_error_payload,
        });
        RpcError::Remote {
            code,
            message: status.message,
            app_error,
        }
    }

    /// Translate into the status a server sends back when relaying this error.
    pub fn to_status(&self) -> ErrorStatus {
        match self {
            RpcError::Remote {
                code,
                message,
                app_error,
            } => ErrorStatus {
                code: (*code).into(),
                message: message.clone(),
                app_error_ext: app_error.as_ref().map(|e| e.ext),
                app_error_payload: app_error
                    .as_ref()
                    .map(|e| e.payload.clone())
                    .unwrap_or_default(),
            },
            other => ErrorStatus {
                code: ErrorCode::from(other.kind()).into(),
                message: other.to_string(),
                app_error_ext: None,
                app_error_payload: Bytes::new(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Remote { code, .. } => ErrorKind::from(*code),
            RpcError::TimedOut(_) => ErrorKind::TimedOut,
            RpcError::Network(_)
            | RpcError::Io(_)
            | RpcError::ConnectionClosed
            | RpcError::MessageTooLarge { .. } => ErrorKind::Network,
            RpcError::Unavailable(_) | RpcError::MessengerShutdown(_) => {
                ErrorKind::ServiceUnavailable
            }
            RpcError::SidecarBudget { .. } => ErrorKind::Application,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.kind() == ErrorKind::TimedOut
    }

    pub fn is_network_error(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// The structured application error, if the remote sent one.
    pub fn application_error(&self) -> Option<&ApplicationError> {
        match self {
            RpcError::Remote { app_error, .. } => app_error.as_ref(),
            _ => None,
        }
    }
}

impl From<ErrorCode> for ErrorKind {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Application => ErrorKind::Application,
            ErrorCode::NoSuchMethod => ErrorKind::NoSuchMethod,
            ErrorCode::NoSuchService => ErrorKind::NoSuchService,
            ErrorCode::InvalidRequest => ErrorKind::InvalidRequest,
            ErrorCode::ServerTooBusy => ErrorKind::ServerTooBusy,
            ErrorCode::ServiceUnavailable => ErrorKind::ServiceUnavailable,
            ErrorCode::Fatal => ErrorKind::Fatal,
            ErrorCode::Network => ErrorKind::Network,
            ErrorCode::TimedOut => ErrorKind::TimedOut,
            ErrorCode::Unknown => ErrorKind::Internal,
        }
    }
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Application => ErrorCode::Application,
            ErrorKind::NoSuchMethod => ErrorCode::NoSuchMethod,
            ErrorKind::NoSuchService => ErrorCode::NoSuchService,
            ErrorKind::InvalidRequest => ErrorCode::InvalidRequest,
            ErrorKind::ServerTooBusy => ErrorCode::ServerTooBusy,
            ErrorKind::ServiceUnavailable => ErrorCode::ServiceUnavailable,
            ErrorKind::Fatal => ErrorCode::Fatal,
            ErrorKind::Network => ErrorCode::Network,
            ErrorKind::TimedOut => ErrorCode::TimedOut,
            ErrorKind::Internal => ErrorCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_application_error() {
        let status = ErrorStatus {
            code: ErrorCode::Application.into(),
            message: "Got some error".to_string(),
            app_error_ext: Some(101),
            app_error_payload: Bytes::from_static(b"extra"),
        };

        let err = RpcError::from_status(status.clone());
        assert_eq!(err.kind(), ErrorKind::Application);
        assert_eq!(err.application_error().map(|e| e.ext), Some(101));
        assert_eq!(err.to_status(), status);
    }

    #[test]
    fn test_local_errors_relay_with_their_kind() {
        let status = RpcError::Network("Invalid host: bogus".to_string()).to_status();
        assert_eq!(status.code, i32::from(ErrorCode::Network));
        assert!(status.app_error_ext.is_none());

        let relayed = RpcError::from_status(status);
        assert!(relayed.is_network_error());
    }

    #[test]
    fn test_unknown_wire_code_is_internal() {
        let status = ErrorStatus {
            code: 9999,
            message: String::new(),
            app_error_ext: None,
            app_error_payload: Bytes::new(),
        };
        assert_eq!(RpcError::from_status(status).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_timeout_classification() {
        let err = RpcError::TimedOut(Duration::from_millis(50));
        assert!(err.is_timed_out());
        assert!(!err.is_network_error());
    }
}
