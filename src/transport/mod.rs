/*
 * Copyright 2020 Joyent, Inc.
 */

//! Authenticated byte channels carrying envelopes.
//!
//! A transport is created by a `Protocol` (see `registry`) either by
//! connecting (client role) or by wrapping an accepted stream (server role).
//! It must complete `handshake` before any envelope is exchanged.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::credential::Identity;
use crate::error::{RpcError, RpcResult};
use crate::protocol::{Envelope, FRAMING_VERSION};

pub mod plain;
pub mod secure;

pub use self::plain::PlainTransport;
pub use self::secure::SecureTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[async_trait]
pub trait Transport: Send {
    fn scheme(&self) -> &'static str;

    fn role(&self) -> Role;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Authenticate the peer.  On success the peer identity is fixed for the
    /// life of the transport.
    async fn handshake(&mut self) -> RpcResult<Identity>;

    fn peer_identity(&self) -> &Identity;

    async fn send(&mut self, envelope: &Envelope) -> RpcResult<()>;

    /// The next envelope, or `None` once the peer has closed.
    async fn receive(&mut self) -> RpcResult<Option<Envelope>>;

    async fn close(&mut self) -> RpcResult<()>;

    /// Verify the peer speaks the same framing version.  Only the client side
    /// initiates; servers answer pings from their request loop.
    async fn sanity_check(&mut self) -> RpcResult<()> {
        self.send(&Envelope::Ping {
            version: FRAMING_VERSION,
        })
        .await?;
        match self.receive().await? {
            Some(Envelope::Pong { version }) if version == FRAMING_VERSION => {
                Ok(())
            }
            Some(Envelope::Pong { version }) => {
                Err(RpcError::Handshake(format!(
                    "peer speaks framing version {}, expected {}",
                    version, FRAMING_VERSION
                )))
            }
            Some(other) => Err(RpcError::Protocol(format!(
                "expected pong, received {}",
                other.kind()
            ))),
            None => Err(RpcError::Connection(String::from(
                "peer closed during sanity check",
            ))),
        }
    }
}
