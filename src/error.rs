use std::time::Duration;

/// Failures with a meaning for callers of this crate. They travel inside `anyhow::Error` like all
///  other errors, so code that needs to react to a specific case uses `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceTransportError {
    #[error("handshake with the service failed: {0}")]
    Handshake(String),

    #[error("no data received from the service for {0:?}, aborting the connection")]
    ServiceTimeout(Duration),

    /// The service sent a `ServiceError` on this connection. Only the outbound path is affected.
    #[error("the service reported an error on this connection, outbound path is closed: {0}")]
    ServiceErrorFault(String),

    #[error("the service connection is not active, data cannot be sent")]
    ServiceConnectionNotActive,

    /// NB: only the number of failed endpoints is reported, not their individual causes
    #[error("{failed} of {targeted} endpoints failed to process the message")]
    AggregateEndpointFailure {
        failed: usize,
        targeted: usize,
    },

    #[error("no connection to any service endpoint is available")]
    ServiceNotConnected,

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// A failed write that another connection of the same pool may still be able to handle
pub fn is_retryable_write_error(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ServiceTransportError>(),
        Some(ServiceTransportError::ServiceConnectionNotActive) | Some(ServiceTransportError::ServiceErrorFault(_))
    )
}
