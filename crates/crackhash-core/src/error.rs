//! Error types shared by the manager and worker services.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure in the system. It implements
//! [`IntoResponse`] so HTTP handlers can return it directly with an
//! appropriate status code.
//!
//! ## Error Cases
//! - `QueueFull`: Admission control rejected a new request.
//! - `InvalidRequest`: A client request was malformed or out of bounds.
//! - `NotFound`: No request state exists for the given id.
//! - `Disconnected`: The broker connection is currently down.
//! - `Publish`: The broker refused or failed to accept a message.
//! - `Malformed`: A payload could not be decoded or failed validation.
//! - `Store`: The request store failed to read or persist state.
//! - `ChannelError`: An internal communication failure between tasks.
//! - `Report`: A worker could not hand its result back to the manager.
//! - `ServiceShutdown`: Work arrived while the service was shutting down.

use crate::types::RequestId;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the crackhash services.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The number of tracked requests reached the admission ceiling.
    #[error("Queue is full ({limit} requests tracked), try again later")]
    QueueFull { limit: usize },

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// No state is tracked for the request.
    #[error("Request {id} not found")]
    NotFound { id: RequestId },

    /// The broker connection is down; the supervisor is reconnecting.
    #[error("Broker is disconnected")]
    Disconnected,

    /// Publishing to the broker failed.
    #[error("Publish failed: {context}")]
    Publish { context: String },

    /// A payload could not be decoded or failed validation.
    #[error("Malformed payload: {reason}")]
    Malformed { reason: String },

    /// The request store failed.
    #[error("Store error: {context}")]
    Store { context: String },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A worker failed to hand its response to the manager.
    #[error("Report failed: {context}")]
    Report { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Errors that can never succeed on retry. Brokers drop such messages
    /// instead of requeueing them.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::InvalidRequest { .. })
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::QueueFull { .. } | Self::Disconnected | Self::ServiceShutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::InvalidRequest { .. } | Self::Malformed { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Report { .. } => StatusCode::BAD_GATEWAY,
            Self::Publish { .. } | Self::Store { .. } | Self::ChannelError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
