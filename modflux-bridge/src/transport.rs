//! Modbus TCP transport.
//!
//! One [`ModbusConnection`] per endpoint, shared by every target at that
//! endpoint. Requests on a connection are serialized; different endpoints are
//! independent. A connection follows
//! `Disconnected -> Connecting -> Connected -> Disconnected` and is torn down on
//! any I/O error, timeout or truncated response, so the next request starts on
//! a fresh stream. There is no retry inside a request.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_modbus::client::{Client, Context};
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use crate::registry::Endpoint;

/// Where a transport failure happened. Only used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Request,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Request => write!(f, "request"),
        }
    }
}

/// Errors from a single read attempt.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport to {endpoint} unavailable ({phase}): {reason}")]
    Unavailable {
        endpoint: Endpoint,
        phase: Phase,
        reason: String,
    },
    #[error("Truncated response: expected {expected} registers, got {got}")]
    Truncated { expected: u16, got: usize },
    #[error("Unit {unit} answered with exception {code}")]
    Exception { unit: u8, code: String },
}

impl TransportError {
    /// The connection phase, for unavailability errors.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TransportError::Unavailable { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkState::Disconnected => 0,
            LinkState::Connecting => 1,
            LinkState::Connected => 2,
        }
    }
}

/// A lazily established Modbus TCP connection to one endpoint.
pub struct ModbusConnection {
    endpoint: Endpoint,
    timeout: Duration,
    context: Mutex<Option<Context>>,
    state: AtomicU8,
    connects: AtomicU64,
    requests: AtomicU64,
}

impl fmt::Debug for ModbusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl ModbusConnection {
    /// Create a disconnected connection. Nothing happens on the network until
    /// the first request.
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            context: Mutex::new(None),
            state: AtomicU8::new(LinkState::Disconnected.as_u8()),
            connects: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Number of connection attempts made so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Number of read requests issued so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Read `count` input registers starting at `address` from `unit`.
    ///
    /// Connects first if needed. Bounded by the connection timeout for the
    /// connect and again for the request.
    pub async fn read_input_registers(
        &self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut slot = self.context.lock().await;

        let mut ctx = match slot.take() {
            Some(ctx) => ctx,
            None => self.connect().await?,
        };

        ctx.set_slave(Slave(unit));
        self.requests.fetch_add(1, Ordering::Relaxed);

        // Through `Client::call` so a short answer surfaces as an error
        // instead of tripping the length assertion in `Reader`.
        let request = Request::ReadInputRegisters(address, count);
        let result = tokio::time::timeout(self.timeout, ctx.call(request)).await;

        match result {
            Ok(Ok(Ok(Response::ReadInputRegisters(words))))
                if words.len() >= usize::from(count) =>
            {
                *slot = Some(ctx);
                Ok(words)
            }
            Ok(Ok(Ok(Response::ReadInputRegisters(words)))) => {
                self.drop_connection(ctx, "truncated response");
                Err(TransportError::Truncated {
                    expected: count,
                    got: words.len(),
                })
            }
            Ok(Ok(Ok(other))) => {
                self.drop_connection(ctx, "unexpected response");
                Err(self.unavailable(
                    Phase::Request,
                    format!("unexpected response {:?}", other),
                ))
            }
            Ok(Ok(Err(code))) => {
                // The exchange itself completed, so the stream is still in sync.
                *slot = Some(ctx);
                Err(TransportError::Exception {
                    unit,
                    code: format!("{:?}", code),
                })
            }
            Ok(Err(e)) => {
                self.drop_connection(ctx, "request failed");
                Err(self.unavailable(Phase::Request, e.to_string()))
            }
            Err(_) => {
                self.drop_connection(ctx, "request timed out");
                Err(self.unavailable(
                    Phase::Request,
                    format!("no response within {:?}", self.timeout),
                ))
            }
        }
    }

    async fn connect(&self) -> Result<Context, TransportError> {
        self.set_state(LinkState::Connecting);
        self.connects.fetch_add(1, Ordering::Relaxed);

        let attempt = async {
            let addr = self.resolve().await?;
            tcp::connect(addr).await.map_err(|e| e.to_string())
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(ctx)) => {
                self.set_state(LinkState::Connected);
                debug!(endpoint = %self.endpoint, "Modbus connection established");
                Ok(ctx)
            }
            Ok(Err(reason)) => {
                self.set_state(LinkState::Disconnected);
                Err(self.unavailable(Phase::Connect, reason))
            }
            Err(_) => {
                self.set_state(LinkState::Disconnected);
                Err(self.unavailable(
                    Phase::Connect,
                    format!("connect timed out after {:?}", self.timeout),
                ))
            }
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, String> {
        let mut addrs = tokio::net::lookup_host((self.endpoint.host.as_str(), self.endpoint.port))
            .await
            .map_err(|e| format!("cannot resolve host: {}", e))?;
        addrs
            .next()
            .ok_or_else(|| "host resolved to no addresses".to_string())
    }

    fn drop_connection(&self, ctx: Context, why: &str) {
        drop(ctx);
        self.set_state(LinkState::Disconnected);
        debug!(endpoint = %self.endpoint, reason = why, "Modbus connection reset");
    }

    fn unavailable(&self, phase: Phase, reason: String) -> TransportError {
        TransportError::Unavailable {
            endpoint: self.endpoint.clone(),
            phase,
            reason,
        }
    }

    /// Close the connection, waiting for an in-flight request to finish first.
    pub async fn close(&self) {
        let mut slot = self.context.lock().await;
        if slot.take().is_some() {
            debug!(endpoint = %self.endpoint, "Modbus connection closed");
        }
        self.set_state(LinkState::Disconnected);
    }
}

/// Connections keyed by endpoint, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    connections: HashMap<Endpoint, Arc<ModbusConnection>>,
}

impl ConnectionPool {
    /// One connection per distinct endpoint.
    pub fn new<'a>(endpoints: impl IntoIterator<Item = &'a Endpoint>, timeout: Duration) -> Self {
        let connections = endpoints
            .into_iter()
            .map(|ep| (ep.clone(), Arc::new(ModbusConnection::new(ep.clone(), timeout))))
            .collect();
        Self { connections }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<ModbusConnection>> {
        self.connections.get(endpoint).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection once its in-flight request (if any) completes.
    pub async fn close_all(&self) {
        for connection in self.connections.values() {
            connection.close().await;
        }
        info!(connections = self.connections.len(), "Modbus connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_roundtrip() {
        for state in [
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::Connected,
        ] {
            assert_eq!(LinkState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_pool_one_connection_per_endpoint() {
        let a = Endpoint::new("10.0.0.1", 502);
        let b = Endpoint::new("10.0.0.2", 502);
        let pool = ConnectionPool::new([&a, &b, &a], Duration::from_secs(1));

        assert_eq!(pool.len(), 2);
        let first = pool.get(&a).unwrap();
        let second = pool.get(&a).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(pool.get(&Endpoint::new("10.0.0.3", 502)).is_none());
        assert_eq!(first.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::Unavailable {
            endpoint: Endpoint::new("plc", 502),
            phase: Phase::Connect,
            reason: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Transport to plc:502 unavailable (connect): refused"
        );
        assert_eq!(err.phase(), Some(Phase::Connect));

        let err = TransportError::Truncated {
            expected: 22,
            got: 10,
        };
        assert!(err.phase().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused_reports_connect_phase() {
        // Bind then drop a listener to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = ModbusConnection::new(Endpoint::new("127.0.0.1", port), Duration::from_millis(500));
        let err = conn.read_input_registers(1, 0, 2).await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Connect));
        assert_eq!(conn.state(), LinkState::Disconnected);
        assert_eq!(conn.connect_count(), 1);
        assert_eq!(conn.request_count(), 0);
    }
}
