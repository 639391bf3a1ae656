//! Transport layer errors

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The link to the ECU is down
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame did not fit the link (e.g. longer than one ISO-TP message)
    #[error("Frame of {len} bytes rejected: {reason}")]
    FrameRejected { len: usize, reason: String },
}
