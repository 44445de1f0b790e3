//! Errors on the request path.

use std::time::Duration;

use hyper::StatusCode;
use splitway_core::RouteKey;
use thiserror::Error;

/// Why a request could not be forwarded. Each one is answered with a gateway error
/// and never touches the decision store.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The elastic pool was drawn for a route that has no elastic target.
    #[error("route {route} has no elastic target bound")]
    Unroutable {
        /// The requested route.
        route: RouteKey,
    },

    /// The chosen backend's base URL could not be turned into a request target.
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    /// No connection to the backend could be opened.
    #[error("failed to connect to {authority}: {source}")]
    Connect {
        /// Backend host and port.
        authority: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The exchange with the backend failed.
    #[error("upstream request failed: {0}")]
    Transport(#[from] hyper::Error),

    /// The backend did not answer in time.
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    /// The status code returned to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::InvalidTarget(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Unroutable { .. }
            | DispatchError::Connect { .. }
            | DispatchError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
