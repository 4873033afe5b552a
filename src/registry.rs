/*
 * Copyright 2020 Joyent, Inc.
 */

//! Scheme to transport mapping.
//!
//! Each registered `Protocol` bundles the three things a scheme decides: how
//! to build a transport (connect or accept), what to check once the handshake
//! is done, and how to take part in a delegation exchange.  Clients and
//! servers pick behaviour purely from an endpoint's scheme.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::Logger;
use tokio::net::TcpStream;

use crate::credential::{unix_now, Credential, Identity, Restriction};
use crate::delegation::{
    self, DelegationPolicy, DelegationReply, DelegationRequest,
};
use crate::endpoint::Endpoint;
use crate::error::{RpcError, RpcResult};
use crate::protocol::DEFAULT_MAX_FRAME;
use crate::transport::{
    plain, secure, PlainTransport, Role, SecureTransport, Transport,
};
use crate::trust::TrustStore;

#[async_trait]
pub trait Protocol: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Largest frame payload its transports send or accept.
    fn max_frame(&self) -> usize;

    /// Open a transport to `endpoint`.  The handshake is not yet run.
    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> RpcResult<Box<dyn Transport>>;

    /// Wrap an accepted stream in a server-role transport.
    fn accept(
        &self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
    ) -> Box<dyn Transport>;

    /// Checks run by the client after the handshake and before a pooled
    /// connection is reused.
    async fn sanity_check(
        &self,
        transport: &mut dyn Transport,
    ) -> RpcResult<()>;

    /// Server side: whether an authenticated peer may use this service at
    /// all.
    fn admit(&self, _peer: &Identity) -> RpcResult<()> {
        Ok(())
    }

    /// Client side of delegation: answer the peer's request.
    fn answer_delegation(
        &self,
        request: &DelegationRequest,
        transport: &dyn Transport,
        log: &Logger,
    ) -> DelegationReply;

    /// Server side of delegation: obtain a credential from the caller.
    async fn request_delegation(
        &self,
        transport: &mut dyn Transport,
        lifetime: Duration,
        restriction: Restriction,
        log: &Logger,
    ) -> RpcResult<Credential>;
}

async fn tcp_connect(
    endpoint: &Endpoint,
) -> RpcResult<(TcpStream, Option<SocketAddr>)> {
    let stream = TcpStream::connect(endpoint.address())
        .await
        .map_err(|e| RpcError::Connection(format!("{}: {}", endpoint, e)))?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr().ok();
    Ok((stream, peer))
}

/// `dip`: framing only.
#[derive(Debug, Clone)]
pub struct PlainProtocol {
    max_frame: usize,
}

impl PlainProtocol {
    pub fn new(max_frame: usize) -> PlainProtocol {
        PlainProtocol { max_frame }
    }
}

impl Default for PlainProtocol {
    fn default() -> Self {
        PlainProtocol::new(DEFAULT_MAX_FRAME)
    }
}

#[async_trait]
impl Protocol for PlainProtocol {
    fn scheme(&self) -> &'static str {
        plain::SCHEME
    }

    fn max_frame(&self) -> usize {
        self.max_frame
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> RpcResult<Box<dyn Transport>> {
        let (stream, peer) = tcp_connect(endpoint).await?;
        Ok(Box::new(PlainTransport::new(
            stream,
            Role::Client,
            peer,
            self.max_frame,
        )))
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
    ) -> Box<dyn Transport> {
        Box::new(PlainTransport::new(
            stream,
            Role::Server,
            peer,
            self.max_frame,
        ))
    }

    async fn sanity_check(
        &self,
        transport: &mut dyn Transport,
    ) -> RpcResult<()> {
        transport.sanity_check().await
    }

    fn answer_delegation(
        &self,
        _request: &DelegationRequest,
        _transport: &dyn Transport,
        _log: &Logger,
    ) -> DelegationReply {
        DelegationReply::Refused {
            reason: String::from("delegation requires a secure transport"),
        }
    }

    async fn request_delegation(
        &self,
        _transport: &mut dyn Transport,
        _lifetime: Duration,
        _restriction: Restriction,
        _log: &Logger,
    ) -> RpcResult<Credential> {
        Err(RpcError::DelegationRejected(String::from(
            "delegation requires a secure transport",
        )))
    }
}

/// Requirements on the peer checked after a secure handshake.
#[derive(Debug, Clone, Default)]
pub struct SanityPolicy {
    /// Properties the peer must hold.
    pub required_properties: Vec<String>,
    /// Refuse peers authenticating with a limited proxy.
    pub reject_limited: bool,
}

/// `dips`: mutual authentication, encryption and delegation.
#[derive(Clone)]
pub struct SecureProtocol {
    credential: Arc<Credential>,
    trust: TrustStore,
    sanity: SanityPolicy,
    delegation: DelegationPolicy,
    max_frame: usize,
}

impl SecureProtocol {
    pub fn new(
        credential: Arc<Credential>,
        trust: TrustStore,
    ) -> SecureProtocol {
        SecureProtocol {
            credential,
            trust,
            sanity: SanityPolicy::default(),
            delegation: DelegationPolicy::default(),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_sanity_policy(mut self, sanity: SanityPolicy) -> Self {
        self.sanity = sanity;
        self
    }

    pub fn with_delegation_policy(
        mut self,
        delegation: DelegationPolicy,
    ) -> Self {
        self.delegation = delegation;
        self
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// The same protocol acting as a different identity, typically a
    /// credential obtained through delegation.
    pub fn with_credential(
        &self,
        credential: Arc<Credential>,
    ) -> SecureProtocol {
        SecureProtocol {
            credential,
            ..self.clone()
        }
    }

    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }
}

#[async_trait]
impl Protocol for SecureProtocol {
    fn scheme(&self) -> &'static str {
        secure::SCHEME
    }

    fn max_frame(&self) -> usize {
        self.max_frame
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> RpcResult<Box<dyn Transport>> {
        let (stream, peer) = tcp_connect(endpoint).await?;
        Ok(Box::new(SecureTransport::new(
            stream,
            Role::Client,
            peer,
            Arc::clone(&self.credential),
            self.trust.clone(),
            self.max_frame,
        )))
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
    ) -> Box<dyn Transport> {
        Box::new(SecureTransport::new(
            stream,
            Role::Server,
            peer,
            Arc::clone(&self.credential),
            self.trust.clone(),
            self.max_frame,
        ))
    }

    async fn sanity_check(
        &self,
        transport: &mut dyn Transport,
    ) -> RpcResult<()> {
        self.credential.ensure_valid(unix_now())?;
        self.admit(transport.peer_identity())?;
        transport.sanity_check().await
    }

    fn admit(&self, peer: &Identity) -> RpcResult<()> {
        if !peer.is_authenticated() {
            return Err(RpcError::Handshake(String::from(
                "peer is not authenticated",
            )));
        }
        if self.sanity.reject_limited && peer.limited {
            return Err(RpcError::Handshake(format!(
                "{} uses a limited proxy",
                peer
            )));
        }
        let missing: Vec<&String> = self
            .sanity
            .required_properties
            .iter()
            .filter(|p| !peer.has_property(p))
            .collect();
        if !missing.is_empty() {
            return Err(RpcError::Handshake(format!(
                "{} lacks required properties {:?}",
                peer, missing
            )));
        }
        Ok(())
    }

    fn answer_delegation(
        &self,
        request: &DelegationRequest,
        transport: &dyn Transport,
        log: &Logger,
    ) -> DelegationReply {
        delegation::grant(
            &self.credential,
            request,
            transport.peer_identity(),
            &self.delegation,
            &self.trust.snapshot(),
            log,
        )
    }

    async fn request_delegation(
        &self,
        transport: &mut dyn Transport,
        lifetime: Duration,
        restriction: Restriction,
        log: &Logger,
    ) -> RpcResult<Credential> {
        let snapshot = self.trust.snapshot();
        delegation::request(transport, lifetime, restriction, &snapshot, log)
            .await
    }
}

/// The schemes a process understands.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<&'static str, Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> ProtocolRegistry {
        ProtocolRegistry::default()
    }

    /// `dip` always, `dips` when a secure protocol is supplied.
    pub fn standard(secure: Option<SecureProtocol>) -> ProtocolRegistry {
        let registry =
            ProtocolRegistry::new().with(Arc::new(PlainProtocol::default()));
        match secure {
            Some(secure) => registry.with(Arc::new(secure)),
            None => registry,
        }
    }

    /// As `standard`, with every transport limited to `max_frame` bytes.
    pub fn standard_with_max_frame(
        max_frame: usize,
        secure: Option<SecureProtocol>,
    ) -> ProtocolRegistry {
        let plain = PlainProtocol::new(max_frame);
        let registry = ProtocolRegistry::new().with(Arc::new(plain));
        match secure {
            Some(secure) => {
                registry.with(Arc::new(secure.with_max_frame(max_frame)))
            }
            None => registry,
        }
    }

    pub fn with(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.insert(protocol.scheme(), protocol);
        self
    }

    pub fn get(&self, scheme: &str) -> RpcResult<Arc<dyn Protocol>> {
        self.protocols
            .get(scheme)
            .cloned()
            .ok_or_else(|| {
                RpcError::Configuration(format!(
                    "unrecognized scheme {}",
                    scheme
                ))
            })
    }

    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<&'static str> =
            self.protocols.keys().cloned().collect();
        schemes.sort_unstable();
        schemes
    }
}
