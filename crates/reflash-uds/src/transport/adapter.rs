//! Transport adapter trait

use std::time::Duration;

use async_trait::async_trait;

use super::TransportError;

/// Address information for CAN/ISO-TP
#[derive(Debug, Clone, Default)]
pub struct AddressInfo {
    /// Transmit ID (tester -> ECU)
    pub tx_id: u32,
    /// Receive ID (ECU -> tester)
    pub rx_id: u32,
    /// Functional (broadcast) ID used for keep-alive traffic
    pub functional_id: u32,
}

/// Transport-agnostic interface for diagnostic communication
///
/// This trait abstracts the underlying transport mechanism (J2534, SocketCAN,
/// ELM327, ...) and provides a unified interface for sending and receiving
/// diagnostic frames. Adapters are opened and closed by their owner; the
/// reflashing engine only ever sees an already-open adapter.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Send a physical request and wait for the matching response
    ///
    /// # Arguments
    /// * `request` - The raw request bytes
    /// * `timeout` - Maximum time to wait for a response
    ///
    /// # Returns
    /// The raw response bytes, or an error
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send a physical request without waiting for a response
    async fn send(&self, request: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next response without sending anything
    ///
    /// Used after a "response pending" answer, when the ECU is still
    /// working on the request that was already sent.
    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Send a request on the functional (broadcast) address without waiting
    ///
    /// Used for keep-alive traffic. Adapters without a separate functional
    /// channel fall back to a physical send.
    async fn broadcast(&self, request: &[u8]) -> Result<(), TransportError> {
        self.send(request).await
    }

    /// Check if the transport is connected
    async fn is_connected(&self) -> bool;

    /// Get the current address configuration
    fn address_info(&self) -> AddressInfo;
}
