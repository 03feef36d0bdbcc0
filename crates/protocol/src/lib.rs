//! Wire protocol spoken between third-party apps and the appgate core.
//!
//! An app opens one persistent connection, completes the session handshake
//! ([`ConnectRequest`] / [`ConnectResponse`]) and then exchanges
//! line-delimited JSON frames. Each request carries a `name` and an untrusted
//! `data` payload; [`parse_request`] is the only way to turn that pair into a
//! typed [`AppMessage`].

pub mod envelope;
pub mod error;
pub mod kind;
pub mod message;
pub mod model;
pub mod payloads;
pub mod results;
pub mod schema;
pub mod session;

pub use envelope::{ConnectRequest, ConnectResponse, ErrorBody, RequestFrame, ResponseFrame};
pub use error::{ErrorCode, ProtocolError, ValidationIssue};
pub use kind::MessageKind;
pub use message::AppMessage;
pub use model::{Event, HandlerKind, Task, TaskState};
pub use schema::{parse_request, ParsedRequest, RejectedRequest};

pub const DEFAULT_SOCK: &str = "/tmp/appgated.sock";

/// Version advertised by clients built from this crate.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
