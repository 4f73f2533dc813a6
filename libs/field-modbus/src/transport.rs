//! Transport seam
//!
//! [`Connector`] opens a [`Session`] for a [`ConnectionKey`]. The pool owns
//! sessions exclusively, one worker per key, so a session never sees two
//! requests at once. [`TcpConnector`] talks Modbus TCP over a socket; the
//! [`mock`] module provides an in-process device used by the test suites.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use errors::{protocol_error, FieldError, FieldResult};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::frame::{MbapCodec, MbapFrame};
use crate::pdu::{decode_response, encode_request};
use crate::request::{Request, Response};

/// Frames with a foreign transaction id skipped before giving up
const MAX_STALE_FRAMES: usize = 3;

/// Identity of a pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.unit_id)
    }
}

/// One open conversation with a device
#[async_trait]
pub trait Session: Send {
    async fn call(&mut self, unit_id: u8, request: &Request) -> FieldResult<Response>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, key: &ConnectionKey, timeout: Duration)
        -> FieldResult<Box<dyn Session>>;
}

// ============================================================================
// TCP
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        key: &ConnectionKey,
        timeout: Duration,
    ) -> FieldResult<Box<dyn Session>> {
        let endpoint = key.endpoint();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(FieldError::ConnectionFailed {
                    endpoint,
                    reason: e.to_string(),
                })
            },
            Err(_) => return Err(FieldError::Timeout(format!("connect {}", endpoint))),
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
        }
        debug!("Connected to {}", endpoint);

        Ok(Box::new(TcpSession {
            framed: Framed::new(stream, MbapCodec),
            endpoint,
            next_transaction_id: 1,
        }))
    }
}

pub struct TcpSession {
    framed: Framed<TcpStream, MbapCodec>,
    endpoint: String,
    next_transaction_id: u16,
}

impl TcpSession {
    fn transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    async fn read_frame(&mut self) -> FieldResult<MbapFrame> {
        match self.framed.next().await {
            Some(frame) => frame,
            None => Err(FieldError::ConnectionReset(self.endpoint.clone())),
        }
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn call(&mut self, unit_id: u8, request: &Request) -> FieldResult<Response> {
        let pdu = encode_request(request)?;
        let transaction_id = self.transaction_id();
        trace!("-> {} tid={} {}", self.endpoint, transaction_id, request);
        self.framed
            .send(MbapFrame::new(transaction_id, unit_id, pdu))
            .await?;

        for _ in 0..=MAX_STALE_FRAMES {
            let MbapFrame { header, pdu } = self.read_frame().await?;
            if header.transaction_id != transaction_id {
                debug!(
                    "Skipping stale frame from {}: tid {} (expected {})",
                    self.endpoint, header.transaction_id, transaction_id
                );
                continue;
            }
            if header.unit_id != unit_id {
                return Err(protocol_error!(
                    "unit id mismatch: expected {}, got {}",
                    unit_id,
                    header.unit_id
                ));
            }
            return decode_response(request, &pdu);
        }

        Err(protocol_error!(
            "no response for transaction {} from {}",
            transaction_id,
            self.endpoint
        ))
    }

    async fn close(&mut self) {
        if let Err(e) = self.framed.get_mut().shutdown().await {
            trace!("Shutdown of {} failed: {}", self.endpoint, e);
        }
    }
}

// ============================================================================
// Mock
// ============================================================================

pub mod mock {
    //! In-process device simulation.
    //!
    //! Holding and input registers share one table; coils and discrete inputs
    //! share another. Every call is recorded with global start/end sequence
    //! numbers so tests can check that calls on one key never overlap.

    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use errors::{FieldError, FieldResult};
    use parking_lot::Mutex;

    use super::{ConnectionKey, Connector, Session};
    use crate::request::{Request, Response};

    /// Fault injected into the next call for a host
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockFailure {
        /// Peer reset the connection
        Reset,
        /// Device never answers
        Hang,
        /// Modbus exception response with the given code
        Exception(u8),
        /// Plain I/O error
        Io,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CallRecord {
        pub key: ConnectionKey,
        pub request: Request,
        pub started: u64,
        pub finished: Option<u64>,
    }

    #[derive(Default)]
    pub struct MockState {
        registers: Mutex<HashMap<(String, u8, u16), u16>>,
        coils: Mutex<HashMap<(String, u8, u16), bool>>,
        failures: Mutex<HashMap<String, VecDeque<MockFailure>>>,
        offline: Mutex<HashSet<String>>,
        latency: Mutex<Duration>,
        calls: Mutex<Vec<CallRecord>>,
        active: Mutex<HashMap<ConnectionKey, usize>>,
        max_active: Mutex<HashMap<ConnectionKey, usize>>,
        sequence: AtomicU64,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    impl MockState {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_register(&self, host: &str, unit_id: u8, address: u16, value: u16) {
            self.registers
                .lock()
                .insert((host.to_string(), unit_id, address), value);
        }

        pub fn set_registers(&self, host: &str, unit_id: u8, address: u16, values: &[u16]) {
            for (i, value) in values.iter().enumerate() {
                self.set_register(host, unit_id, address.wrapping_add(i as u16), *value);
            }
        }

        pub fn register(&self, host: &str, unit_id: u8, address: u16) -> u16 {
            self.registers
                .lock()
                .get(&(host.to_string(), unit_id, address))
                .copied()
                .unwrap_or(0)
        }

        pub fn set_coil(&self, host: &str, unit_id: u8, address: u16, on: bool) {
            self.coils
                .lock()
                .insert((host.to_string(), unit_id, address), on);
        }

        pub fn coil(&self, host: &str, unit_id: u8, address: u16) -> bool {
            self.coils
                .lock()
                .get(&(host.to_string(), unit_id, address))
                .copied()
                .unwrap_or(false)
        }

        /// Queue a fault for the next call to `host`
        pub fn push_failure(&self, host: &str, failure: MockFailure) {
            self.failures
                .lock()
                .entry(host.to_string())
                .or_default()
                .push_back(failure);
        }

        pub fn push_failures(&self, host: &str, failure: MockFailure, count: usize) {
            for _ in 0..count {
                self.push_failure(host, failure);
            }
        }

        /// Refuse connections and reset open sessions for `host`
        pub fn set_offline(&self, host: &str, offline: bool) {
            let mut hosts = self.offline.lock();
            if offline {
                hosts.insert(host.to_string());
            } else {
                hosts.remove(host);
            }
        }

        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock() = latency;
        }

        pub fn calls(&self) -> Vec<CallRecord> {
            self.calls.lock().clone()
        }

        pub fn calls_for(&self, key: &ConnectionKey) -> Vec<CallRecord> {
            self.calls
                .lock()
                .iter()
                .filter(|c| &c.key == key)
                .cloned()
                .collect()
        }

        /// Highest number of simultaneous calls observed on `key`
        pub fn max_concurrency(&self, key: &ConnectionKey) -> usize {
            self.max_active.lock().get(key).copied().unwrap_or(0)
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        fn is_offline(&self, host: &str) -> bool {
            self.offline.lock().contains(host)
        }

        fn next_failure(&self, host: &str) -> Option<MockFailure> {
            self.failures
                .lock()
                .get_mut(host)
                .and_then(|queue| queue.pop_front())
        }

        fn begin(&self, key: &ConnectionKey, request: &Request) -> usize {
            let started = self.sequence.fetch_add(1, Ordering::SeqCst);
            let mut calls = self.calls.lock();
            calls.push(CallRecord {
                key: key.clone(),
                request: request.clone(),
                started,
                finished: None,
            });

            let mut active = self.active.lock();
            let count = active.entry(key.clone()).or_insert(0);
            *count += 1;
            let mut max_active = self.max_active.lock();
            let max = max_active.entry(key.clone()).or_insert(0);
            *max = (*max).max(*count);

            calls.len() - 1
        }

        fn end(&self, key: &ConnectionKey, index: usize) {
            let finished = self.sequence.fetch_add(1, Ordering::SeqCst);
            if let Some(call) = self.calls.lock().get_mut(index) {
                call.finished = Some(finished);
            }
            if let Some(count) = self.active.lock().get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }

        fn apply(&self, key: &ConnectionKey, unit_id: u8, request: &Request) -> Response {
            let host = key.host.as_str();
            match request {
                Request::ReadCoils { address, quantity }
                | Request::ReadDiscreteInputs { address, quantity } => Response::Bits(
                    (0..*quantity)
                        .map(|i| self.coil(host, unit_id, address.wrapping_add(i)))
                        .collect(),
                ),
                Request::ReadHoldingRegisters { address, quantity }
                | Request::ReadInputRegisters { address, quantity } => Response::Words(
                    (0..*quantity)
                        .map(|i| self.register(host, unit_id, address.wrapping_add(i)))
                        .collect(),
                ),
                Request::WriteSingleCoil { address, value } => {
                    self.set_coil(host, unit_id, *address, *value);
                    Response::Ack
                },
                Request::WriteSingleRegister { address, value } => {
                    self.set_register(host, unit_id, *address, *value);
                    Response::Ack
                },
                Request::WriteMultipleCoils { address, values } => {
                    for (i, on) in values.iter().enumerate() {
                        self.set_coil(host, unit_id, address.wrapping_add(i as u16), *on);
                    }
                    Response::Ack
                },
                Request::WriteMultipleRegisters { address, values } => {
                    self.set_registers(host, unit_id, *address, values);
                    Response::Ack
                },
            }
        }
    }

    #[derive(Clone)]
    pub struct MockConnector {
        state: Arc<MockState>,
    }

    impl MockConnector {
        pub fn new(state: Arc<MockState>) -> Self {
            Self { state }
        }

        pub fn state(&self) -> &Arc<MockState> {
            &self.state
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            key: &ConnectionKey,
            _timeout: Duration,
        ) -> FieldResult<Box<dyn Session>> {
            if self.state.is_offline(&key.host) {
                return Err(FieldError::ConnectionFailed {
                    endpoint: key.endpoint(),
                    reason: "connection refused".to_string(),
                });
            }
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                key: key.clone(),
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct MockSession {
        key: ConnectionKey,
        state: Arc<MockState>,
    }

    #[async_trait]
    impl Session for MockSession {
        async fn call(&mut self, unit_id: u8, request: &Request) -> FieldResult<Response> {
            request.validate()?;
            let index = self.state.begin(&self.key, request);
            let result = self.respond(unit_id, request).await;
            self.state.end(&self.key, index);
            result
        }

        async fn close(&mut self) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl MockSession {
        async fn respond(&self, unit_id: u8, request: &Request) -> FieldResult<Response> {
            let latency = *self.state.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            if self.state.is_offline(&self.key.host) {
                return Err(FieldError::ConnectionReset(self.key.endpoint()));
            }

            match self.state.next_failure(&self.key.host) {
                Some(MockFailure::Reset) => Err(FieldError::ConnectionReset(self.key.endpoint())),
                Some(MockFailure::Hang) => {
                    std::future::pending::<()>().await;
                    Err(FieldError::Timeout(self.key.endpoint()))
                },
                Some(MockFailure::Exception(code)) => Err(FieldError::ModbusException {
                    function: request.function_code().code() | 0x80,
                    code,
                }),
                Some(MockFailure::Io) => Err(FieldError::Io("injected I/O failure".to_string())),
                None => Ok(self.state.apply(&self.key, unit_id, request)),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::mock::{MockConnector, MockFailure, MockState};
    use super::*;

    #[test]
    fn test_key_display() {
        let key = ConnectionKey::new("10.0.0.5", 502, 1);
        assert_eq!(key.to_string(), "10.0.0.5:502#1");
        assert_eq!(key.endpoint(), "10.0.0.5:502");
    }

    #[tokio::test]
    async fn test_mock_reads_and_writes() {
        let state = MockState::new();
        state.set_register("dev", 1, 10, 42);
        let connector = MockConnector::new(state.clone());
        let key = ConnectionKey::new("dev", 502, 1);
        let mut session = connector.connect(&key, Duration::from_secs(1)).await.unwrap();

        let words = session
            .call(1, &Request::ReadHoldingRegisters { address: 10, quantity: 2 })
            .await
            .unwrap()
            .into_words()
            .unwrap();
        assert_eq!(words, vec![42, 0]);

        session
            .call(1, &Request::WriteSingleCoil { address: 3, value: true })
            .await
            .unwrap();
        assert!(state.coil("dev", 1, 3));

        state.push_failure("dev", MockFailure::Exception(2));
        let err = session
            .call(1, &Request::ReadCoils { address: 0, quantity: 1 })
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(state.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_offline_refuses() {
        let state = MockState::new();
        state.set_offline("dev", true);
        let connector = MockConnector::new(state);
        let err = connector
            .connect(&ConnectionKey::new("dev", 502, 1), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.is_connection_fault());
    }
}
