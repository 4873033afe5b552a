/*
 * Copyright 2020 Joyent, Inc.
 */

//! One transport and its lifecycle.
//!
//! ```text
//! Closed -> Connecting -> Handshaking -> Authenticated -> Ready <-> InCall
//!                              |                            |
//!                              +--------> Closing <---------+
//!                                            |
//!                                          Closed
//! ```
//!
//! A connection is exclusively owned by one task and carries at most one call
//! at a time.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, warn, Logger};
use tokio::time::timeout;

use crate::credential::Identity;
use crate::endpoint::Endpoint;
use crate::error::{RpcError, RpcResult};
use crate::protocol::{Envelope, RpcRequest, RpcResponse};
use crate::registry::Protocol;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Handshaking,
    Authenticated,
    Ready,
    InCall,
    Closing,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, Connecting) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Authenticated) => true,
            (Authenticated, Ready) => true,
            (Ready, InCall) | (InCall, Ready) => true,
            (Closing, Closed) => true,
            (Closed, _) | (Closing, _) => false,
            (_, Closing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Connection {
    endpoint: Endpoint,
    protocol: Arc<dyn Protocol>,
    transport: Box<dyn Transport>,
    state: ConnectionState,
    peer: Identity,
    failure: Option<String>,
    last_used: Instant,
    log: Logger,
}

impl Connection {
    fn new(
        endpoint: Endpoint,
        protocol: Arc<dyn Protocol>,
        transport: Box<dyn Transport>,
        state: ConnectionState,
        log: Logger,
    ) -> Connection {
        Connection {
            endpoint,
            protocol,
            transport,
            state,
            peer: Identity::anonymous(),
            failure: None,
            last_used: Instant::now(),
            log,
        }
    }

    /// Connect, authenticate and sanity check within `connect_timeout`.
    pub async fn open(
        endpoint: &Endpoint,
        protocol: Arc<dyn Protocol>,
        connect_timeout: Duration,
        log: &Logger,
    ) -> RpcResult<Connection> {
        let log = log.new(slog::o!("endpoint" => endpoint.to_string()));
        debug!(log, "opening connection");

        let establish = async {
            let transport = protocol.connect(endpoint).await?;
            let mut conn = Connection::new(
                endpoint.clone(),
                Arc::clone(&protocol),
                transport,
                ConnectionState::Connecting,
                log.clone(),
            );
            if let Err(e) = conn.establish().await {
                conn.fail(&e).await;
                return Err(e);
            }
            Ok(conn)
        };

        match timeout(connect_timeout, establish).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Connection(format!(
                "{} not established within {:?}",
                endpoint, connect_timeout
            ))),
        }
    }

    /// Take ownership of an accepted transport; the caller runs `handshake`.
    pub fn accepted(
        endpoint: Endpoint,
        protocol: Arc<dyn Protocol>,
        transport: Box<dyn Transport>,
        log: &Logger,
    ) -> Connection {
        Connection::new(
            endpoint,
            protocol,
            transport,
            ConnectionState::Connecting,
            log.clone(),
        )
    }

    async fn establish(&mut self) -> RpcResult<()> {
        self.handshake().await?;
        let protocol = Arc::clone(&self.protocol);
        protocol.sanity_check(self.transport.as_mut()).await?;
        self.transition(ConnectionState::Ready);
        Ok(())
    }

    /// Run the transport handshake and fix the peer identity.
    pub async fn handshake(&mut self) -> RpcResult<Identity> {
        self.transition(ConnectionState::Handshaking);
        let peer = self.transport.handshake().await?;
        self.peer = peer.clone();
        self.transition(ConnectionState::Authenticated);
        Ok(peer)
    }

    /// Server side: no sanity round trip, the peer initiates it.
    pub fn mark_ready(&mut self) {
        self.transition(ConnectionState::Ready);
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            warn!(self.log, "unexpected connection state change";
                  "from" => %self.state, "to" => %next);
        }
        self.state = next;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Re-run the protocol sanity check on an idle connection.
    pub async fn recheck(&mut self) -> RpcResult<()> {
        let protocol = Arc::clone(&self.protocol);
        match protocol.sanity_check(self.transport.as_mut()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// One synchronous request/response exchange.  Delegation requests from
    /// the server are answered while waiting.  Any failure leaves the
    /// connection closing; it must not be reused.
    pub async fn call(
        &mut self,
        request: RpcRequest,
    ) -> RpcResult<RpcResponse> {
        self.begin_call()?;
        match self.exchange(request).await {
            Ok(response) => {
                self.end_call();
                Ok(response)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Ready -> InCall.  Only one call may be in flight.
    pub fn begin_call(&mut self) -> RpcResult<()> {
        if !self.is_ready() {
            return Err(RpcError::Connection(format!(
                "connection is {}, not Ready",
                self.state
            )));
        }
        self.transition(ConnectionState::InCall);
        Ok(())
    }

    pub fn end_call(&mut self) {
        self.last_used = Instant::now();
        self.transition(ConnectionState::Ready);
    }

    async fn exchange(
        &mut self,
        request: RpcRequest,
    ) -> RpcResult<RpcResponse> {
        self.transport.send(&Envelope::Request(request)).await?;
        loop {
            match self.transport.receive().await? {
                Some(Envelope::Response(response)) => return Ok(response),
                Some(Envelope::DelegationRequest(req)) => {
                    debug!(self.log, "server requested delegation";
                           "lifetime" => req.lifetime_secs);
                    let reply = self.protocol.answer_delegation(
                        &req,
                        self.transport.as_ref(),
                        &self.log,
                    );
                    let reply = Envelope::DelegationReply(reply);
                    self.transport.send(&reply).await?;
                }
                Some(other) => {
                    return Err(RpcError::Protocol(format!(
                        "unexpected {} during call",
                        other.kind()
                    )))
                }
                None => {
                    return Err(RpcError::Connection(String::from(
                        "peer closed before responding",
                    )))
                }
            }
        }
    }

    /// Record `err` and close.
    pub async fn fail(&mut self, err: &RpcError) {
        self.failure = Some(err.to_string());
        debug!(self.log, "connection failed";
               "state" => %self.state, "err" => %err);
        self.close().await;
    }

    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.transition(ConnectionState::Closing);
        if let Err(e) = self.transport.close().await {
            debug!(self.log, "error closing transport"; "err" => %e);
        }
        self.transition(ConnectionState::Closed);
    }
}
