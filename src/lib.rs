#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]

//! MQTT 3.1.1 / 5.0 client core.
//!
//! This crate contains the connection-scoped heart of an MQTT client:
//! - `protocol` - wire codec for all fifteen control-packet families,
//!   including MQTT 5.0 property tables
//! - `session` - the per-connection engine that enforces QoS 0/1/2
//!   delivery semantics, allocates packet identifiers, and drives
//!   persistence callbacks
//! - `net` - the cooperative tasks sharing one connection: receive loop,
//!   send pipeline with write coalescing, and keepalive
//! - `core` - configuration and deterministic time utilities
//!
//! Transports, reconnection policy, and persistence backends beyond the
//! shipped ones are the embedding client's concern.

pub mod core;
pub mod error;
pub mod net;
pub mod protocol;
pub mod session;

pub use crate::core::config::{Options, WillConfig};
pub use crate::core::time::{Clock, SystemClock};
pub use error::{CodecError, SessionError};
pub use net::conn::Connection;
pub use protocol::{ControlType, Packet, ProtocolVersion, Qos};
pub use session::persist::{
    recv_key, send_key, FilePersistence, MemPersistence, NoopPersistence, Persistence,
};
pub use session::{Notification, Request, SessionEngine, TopicGrant};
