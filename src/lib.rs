// Copyright 2020 Joyent, Inc.

//! grid-rpc: authenticated RPC between grid services
//!
//! Services are addressed by logical name (e.g.
//! `WorkloadManagement/JobManager`) and resolved to one or more endpoint
//! URLs.  The URL scheme selects the transport:
//!
//! * `dip`   framing only, no authentication.
//!
//! * `dips`  mutual certificate authentication, encryption, and delegation
//!           of the caller's credential to the service.
//!
//! Protocol definition
//!
//! Every message on a connection is one frame:
//!
//! * DLEN0...DLEN3      4-byte big-endian unsigned integer, the number of
//!                    payload bytes that follow.  Frames larger than the
//!                    configured maximum (16 MiB by default) end the
//!                    connection.
//!
//! * DATA0...DATAN      Payload.  A JSON object `{"kind": K, "body": B}`
//!                    where K is one of `ping`, `pong`, `request`,
//!                    `response`, `delegation_request` or
//!                    `delegation_reply`.
//!
//! On a `dips` connection the payload of every frame after the handshake is
//! sealed with ChaCha20-Poly1305 under per-direction session keys.
//!
//! A connection carries one call at a time.  The client sends a `request`
//! and reads until the matching `response`; in between the server may send
//! any number of `delegation_request`s, each answered by exactly one
//! `delegation_reply`.  Failed responses carry a numeric `errno` (see
//! `error::ErrorKind`), a message and optional structured data.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod connection;
pub mod credential;
pub mod delegation;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod trust;
pub mod value;

pub use crate::client::{CallReport, RpcClient};
pub use crate::credential::{Authority, Credential, Identity, Restriction};
pub use crate::dispatch::{
    AccessList, CallContext, Dispatcher, HandlerError, HandlerResult,
    MethodRegistration,
};
pub use crate::endpoint::{Endpoint, Resolver, StaticResolver};
pub use crate::error::{ErrorKind, RpcError, RpcResult};
pub use crate::registry::{ProtocolRegistry, SecureProtocol};
pub use crate::server::RpcServer;
pub use crate::value::{ArgType, Value};
