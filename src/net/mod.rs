//! Connection tasks.
//!
//! One connection runs three cooperative tasks next to the session engine:
//! the receive loop (`recv`), the send pipeline with write coalescing
//! (`send`), and the keepalive timer (`keepalive`). `conn` performs the
//! CONNECT handshake and wires them together with bounded channels and a
//! connection-scoped cancellation token.

pub mod conn;
pub(crate) mod keepalive;
pub(crate) mod recv;
pub(crate) mod send;

pub use conn::Connection;
