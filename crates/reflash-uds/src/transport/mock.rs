//! Mock transport adapter for testing

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AddressInfo, TransportAdapter, TransportError};
use crate::config::MockConfig;

/// Mock transport adapter for testing
///
/// Responses are looked up in two places: one-shot scripted responses
/// (consumed in the order they were queued) and standing responses that
/// answer every matching request. Both match on a request prefix.
pub struct MockTransportAdapter {
    config: MockConfig,
    connected: AtomicBool,
    /// One-shot responses, consumed first
    scripted: RwLock<VecDeque<(Vec<u8>, Vec<u8>)>>,
    /// Standing responses (request prefix -> response)
    responses: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
    /// Every physical request seen, in order
    sent: RwLock<Vec<Vec<u8>>>,
    /// Every functional request seen, in order
    broadcasts: RwLock<Vec<Vec<u8>>>,
    /// Request that follow-up receives answer for
    last_request: RwLock<Vec<u8>>,
}

impl MockTransportAdapter {
    pub fn new(config: &MockConfig) -> Self {
        Self {
            config: config.clone(),
            connected: AtomicBool::new(true),
            scripted: RwLock::new(VecDeque::new()),
            responses: RwLock::new(Self::default_responses()),
            sent: RwLock::new(Vec::new()),
            broadcasts: RwLock::new(Vec::new()),
            last_request: RwLock::new(Vec::new()),
        }
    }

    /// Add a standing mock response for a given request prefix
    ///
    /// Later additions take precedence over earlier ones.
    pub fn add_response(&self, request: Vec<u8>, response: Vec<u8>) {
        self.responses.write().insert(0, (request, response));
    }

    /// Queue a one-shot response for the next request matching the prefix
    pub fn push_response(&self, request: Vec<u8>, response: Vec<u8>) {
        self.scripted.write().push_back((request, response));
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Physical requests seen so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.read().clone()
    }

    /// Functional (broadcast) requests seen so far
    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.broadcasts.read().clone()
    }

    /// Number of physical requests starting with `prefix`
    pub fn count_sent(&self, prefix: &[u8]) -> usize {
        self.sent
            .read()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    fn default_responses() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            // Session control - extended (0x10 03 -> 0x50 03)
            (vec![0x10, 0x03], vec![0x50, 0x03]),
            // Tester present (0x3E 00 -> 0x7E 00)
            (vec![0x3E, 0x00], vec![0x7E, 0x00]),
            // Tester present suppress response
            (vec![0x3E, 0x80], vec![]),
            // Disable normal communication
            (vec![0x28], vec![0x68]),
            // Report programmed state (fully programmed)
            (vec![0xA2], vec![0xE2, 0x00]),
            // Programming mode - request
            (vec![0xA5, 0x01], vec![0xE5]),
            // Return to normal
            (vec![0x20], vec![0x60]),
        ]
    }

    fn find_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        {
            let mut scripted = self.scripted.write();
            if let Some(pos) = scripted
                .iter()
                .position(|(req, _)| request.starts_with(req))
            {
                return scripted.remove(pos).map(|(_, resp)| resp);
            }
        }

        let responses = self.responses.read();

        // First try exact match
        for (req, resp) in responses.iter() {
            if req == request {
                return Some(resp.clone());
            }
        }

        // Then try prefix match for variable-length requests
        for (req, resp) in responses.iter() {
            if request.starts_with(req) {
                return Some(resp.clone());
            }
        }

        // Generate default response based on service ID
        if !request.is_empty() {
            let service_id = request[0];
            // Positive response = service_id + 0x40
            let positive_response = service_id.wrapping_add(0x40);
            return Some(vec![positive_response]);
        }

        None
    }

    /// Look up the response to `request`; follow-up receives answer
    /// for the last physical request
    async fn answer(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.find_response(request) {
            // An empty scripted response stands for an ECU that stays silent
            Some(response) if response.is_empty() => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            }
            Some(response) => Ok(response),
            None => Err(TransportError::ReceiveFailed(
                "No mock response configured".to_string(),
            )),
        }
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }
}

#[async_trait]
impl TransportAdapter for MockTransportAdapter {
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.simulate_latency().await;
        self.sent.write().push(request.to_vec());
        *self.last_request.write() = request.to_vec();

        self.answer(request, timeout).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let request = self.last_request.read().clone();
        self.answer(&request, timeout).await
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.simulate_latency().await;
        self.sent.write().push(request.to_vec());

        tracing::debug!(?request, "Mock transport: sent message");
        Ok(())
    }

    async fn broadcast(&self, request: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        self.broadcasts.write().push(request.to_vec());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn address_info(&self) -> AddressInfo {
        AddressInfo {
            tx_id: 0x7E0,
            rx_id: 0x7E8,
            functional_id: 0x101,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_response_consumed_once() {
        let mock = MockTransportAdapter::new(&MockConfig::default());
        mock.push_response(vec![0x1A, 0xC1], vec![0x7F, 0x1A, 0x31]);

        let timeout = Duration::from_millis(10);
        let first = mock.send_receive(&[0x1A, 0xC1], timeout).await.unwrap();
        let second = mock.send_receive(&[0x1A, 0xC1], timeout).await.unwrap();

        assert_eq!(first, vec![0x7F, 0x1A, 0x31]);
        assert_eq!(second, vec![0x5A]);
        assert_eq!(mock.count_sent(&[0x1A]), 2);
    }

    #[tokio::test]
    async fn test_disconnected_rejects_requests() {
        let mock = MockTransportAdapter::new(&MockConfig::default());
        mock.set_connected(false);

        let result = mock.send_receive(&[0x20], Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert!(mock.broadcast(&[0x3E, 0x80]).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_answers_last_request_without_sending() {
        let mock = MockTransportAdapter::new(&MockConfig::default());
        mock.push_response(vec![0x31], vec![0x7F, 0x31, 0x78]);
        mock.push_response(vec![0x31], vec![0x71, 0x01, 0xFF, 0x00, 0x00]);

        let timeout = Duration::from_millis(10);
        let first = mock.send_receive(&[0x31, 0x01, 0xFF, 0x00], timeout).await.unwrap();
        let second = mock.receive(timeout).await.unwrap();

        assert_eq!(first, vec![0x7F, 0x31, 0x78]);
        assert_eq!(second, vec![0x71, 0x01, 0xFF, 0x00, 0x00]);
        assert_eq!(mock.count_sent(&[0x31]), 1);
    }

    #[tokio::test]
    async fn test_broadcasts_are_recorded_separately() {
        let mock = MockTransportAdapter::new(&MockConfig::default());
        mock.broadcast(&[0x3E, 0x80]).await.unwrap();

        assert_eq!(mock.broadcasts(), vec![vec![0x3E, 0x80]]);
        assert!(mock.sent().is_empty());
    }
}
