//! Modbus TCP client for the field controller
//!
//! Layers, bottom up: [`pdu`] and [`frame`] build and parse the wire format,
//! [`codec`] turns register words into typed values, [`transport`] opens
//! sessions, and [`pool`] serializes requests per connection with retry and
//! reconnect backoff.

pub mod backoff;
pub mod codec;
pub mod constants;
pub mod frame;
pub mod pdu;
pub mod pool;
pub mod request;
pub mod transport;

pub use backoff::{exponential_delay_ms, BackoffPolicy, ConnectionState, ReconnectTracker};
pub use pool::{ConnectionInfo, ConnectionPool, PoolConfig};
pub use request::{Request, RequestOptions, Response};
pub use transport::{ConnectionKey, Connector, Session, TcpConnector};
