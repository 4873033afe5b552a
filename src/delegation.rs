/*
 * Copyright 2020 Joyent, Inc.
 */

//! Credential delegation over an authenticated connection.
//!
//! The exchange runs inside a call, initiated by the server side:
//!
//! ```text
//! Client (holds credential)                     Server (handler)
//!   |  <-- delegation_request { lifetime, restriction, public_key } --|
//!   |      sign proxy for public_key, verify own chain                 |
//!   |  -- delegation_reply { granted: chain } ----------------------> |
//!   |      OR                                                          |
//!   |  -- delegation_reply { refused: reason } ---------------------> |
//!   |                                     verify chain, key and DN     |
//! ```
//!
//! The private key never leaves the server; the client only ever signs.  The
//! proxy expires no later than `now + lifetime` and no later than the
//! client's own credential, and its rights are narrowed by the restriction.
//! Delegating onward from a delegated credential is the same exchange again,
//! so every hop narrows independently.

use std::convert::TryFrom;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_derive::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use tokio::sync::{mpsc, oneshot};

use crate::credential::{
    decode_public_key, encode_public_key, unix_now, Certificate, Credential,
    Identity, Restriction,
};
use crate::error::{RpcError, RpcResult};
use crate::protocol::Envelope;
use crate::transport::Transport;
use crate::trust::TrustSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub lifetime_secs: u64,
    #[serde(default)]
    pub restriction: Restriction,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationReply {
    Granted { chain: Vec<Certificate> },
    Refused { reason: String },
}

/// What a process is willing to delegate when asked.
#[derive(Debug, Clone)]
pub struct DelegationPolicy {
    pub allow: bool,
    pub max_lifetime: Duration,
}

impl Default for DelegationPolicy {
    fn default() -> Self {
        DelegationPolicy {
            allow: true,
            max_lifetime: Duration::from_secs(86_400),
        }
    }
}

/// Sending side: sign a proxy of `credential` for the requester's key.
pub fn grant(
    credential: &Credential,
    request: &DelegationRequest,
    peer: &Identity,
    policy: &DelegationPolicy,
    trust: &TrustSnapshot,
    log: &Logger,
) -> DelegationReply {
    let refuse = |reason: String| {
        warn!(log, "refusing delegation request";
              "peer" => %peer, "reason" => &reason);
        DelegationReply::Refused { reason }
    };

    if !policy.allow {
        return refuse(String::from("delegation is disabled"));
    }
    if !peer.is_authenticated() {
        return refuse(String::from("requester is not authenticated"));
    }

    let public_key = match decode_public_key(&request.public_key) {
        Ok(k) => k,
        Err(e) => return refuse(format!("bad public key: {}", e)),
    };

    let lifetime = request.lifetime_secs.min(policy.max_lifetime.as_secs());
    let mut restriction = request.restriction.clone();
    restriction.lifetime_secs = Some(
        restriction
            .lifetime_secs
            .map_or(lifetime, |l| l.min(lifetime)),
    );

    let now = unix_now();
    let chain = match credential.issue_proxy(&public_key, &restriction, now) {
        Ok(chain) => chain,
        Err(e) => return refuse(e.to_string()),
    };
    if let Err(e) = trust.verify(&chain, now) {
        return refuse(format!("produced chain does not verify: {}", e));
    }

    info!(log, "delegating credential";
          "peer" => %peer,
          "subject" => credential.leaf().subject(),
          "lifetime" => lifetime);
    DelegationReply::Granted { chain }
}

/// Receiving side: run the exchange over `transport` and return the verified
/// credential.  The transport stays usable when the exchange is refused.
pub async fn request(
    transport: &mut dyn Transport,
    lifetime: Duration,
    restriction: Restriction,
    trust: &TrustSnapshot,
    log: &Logger,
) -> RpcResult<Credential> {
    let peer = transport.peer_identity().clone();
    let dn = peer.dn.clone().ok_or_else(|| {
        RpcError::DelegationRejected(String::from("peer is not authenticated"))
    })?;

    let key = SigningKey::generate(&mut OsRng);
    let req = DelegationRequest {
        lifetime_secs: lifetime.as_secs(),
        restriction,
        public_key: encode_public_key(&key.verifying_key()),
    };
    transport.send(&Envelope::DelegationRequest(req)).await?;

    let chain = match transport.receive().await? {
        Some(Envelope::DelegationReply(reply)) => match reply {
            DelegationReply::Granted { chain } => chain,
            DelegationReply::Refused { reason } => {
                return Err(RpcError::DelegationRejected(reason))
            }
        },
        Some(other) => {
            return Err(RpcError::Protocol(format!(
                "expected delegation reply, received {}",
                other.kind()
            )))
        }
        None => {
            return Err(RpcError::Connection(String::from(
                "peer closed during delegation",
            )))
        }
    };

    let now = unix_now();
    let reject = |msg: String| RpcError::DelegationRejected(msg);
    let identity = trust
        .verify(&chain, now)
        .map_err(|e| reject(e.to_string()))?;
    if identity.dn.as_deref() != Some(dn.as_str()) {
        return Err(reject(format!(
            "delegated chain belongs to {:?}, caller is {}",
            identity.dn, dn
        )));
    }

    let credential =
        Credential::new(chain, key).map_err(|e| reject(e.to_string()))?;
    let lifetime = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
    if credential.expiry() > now.saturating_add(lifetime) {
        return Err(reject(String::from(
            "delegated credential outlives the requested lifetime",
        )));
    }

    info!(log, "received delegated credential";
          "dn" => &dn,
          "expiry" => credential.expiry());
    Ok(credential)
}

pub(crate) struct DelegationCommand {
    pub lifetime: Duration,
    pub restriction: Restriction,
    pub reply: oneshot::Sender<RpcResult<Credential>>,
}

/// Handle through which a running handler asks its connection's worker to
/// run a delegation exchange with the caller.
#[derive(Clone)]
pub struct Delegator {
    tx: Option<mpsc::Sender<DelegationCommand>>,
}

impl Delegator {
    pub(crate) fn channel() -> (Delegator, mpsc::Receiver<DelegationCommand>) {
        let (tx, rx) = mpsc::channel(1);
        (Delegator { tx: Some(tx) }, rx)
    }

    /// A delegator for calls made outside any connection.
    pub fn unavailable() -> Delegator {
        Delegator { tx: None }
    }

    pub async fn request(
        &self,
        lifetime: Duration,
        restriction: Restriction,
    ) -> RpcResult<Credential> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            RpcError::DelegationRejected(String::from(
                "no connection to delegate over",
            ))
        })?;
        let (reply, rx) = oneshot::channel();
        let cmd = DelegationCommand {
            lifetime,
            restriction,
            reply,
        };
        tx.send(cmd).await.map_err(|_| {
            RpcError::DelegationRejected(String::from("connection is gone"))
        })?;
        rx.await.map_err(|_| {
            RpcError::DelegationRejected(String::from("connection is gone"))
        })?
    }
}
