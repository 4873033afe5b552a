/*
 * Copyright 2020 Joyent, Inc.
 */

//! Client, server and security settings.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working plain-transport configuration.  Settings are read from an optional
//! file and then from `GRIDRPC_*` environment variables, with `__` separating
//! nested keys, e.g. `GRIDRPC_SERVER__MAX_CONNECTIONS=20`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::delegation::DelegationPolicy;
use crate::error::{RpcError, RpcResult};
use crate::protocol::DEFAULT_MAX_FRAME;
use crate::registry::{
    PlainProtocol, Protocol, ProtocolRegistry, SanityPolicy, SecureProtocol,
};
use crate::trust::{TrustSnapshot, TrustStore};

pub const ENV_PREFIX: &str = "GRIDRPC";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
    /// Idle `Ready` connections kept per endpoint.
    pub pool_size: usize,
    /// Pooled connections idle longer than this are closed, not reused.
    pub pool_idle_secs: u64,
    pub allow_delegation: bool,
    pub max_delegation_secs: u64,
    pub max_frame: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout_secs: 10,
            call_timeout_secs: 120,
            pool_size: 4,
            pool_idle_secs: 60,
            allow_delegation: true,
            max_delegation_secs: 86_400,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn pool_idle(&self) -> Duration {
        Duration::from_secs(self.pool_idle_secs)
    }

    pub fn delegation_policy(&self) -> DelegationPolicy {
        DelegationPolicy {
            allow: self.allow_delegation,
            max_lifetime: Duration::from_secs(self.max_delegation_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Connections served at once; further clients wait in the accept queue.
    pub max_connections: usize,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// Bound on one delegation exchange run on behalf of a handler.
    pub delegation_timeout_secs: u64,
    pub max_frame: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: String::from("0.0.0.0:9135"),
            max_connections: 100,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 300,
            delegation_timeout_secs: 30,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn delegation_timeout(&self) -> Duration {
        Duration::from_secs(self.delegation_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub trust_roots_path: Option<PathBuf>,
    pub revocations_path: Option<PathBuf>,
    pub required_properties: Vec<String>,
    pub reject_limited: bool,
}

impl SecurityConfig {
    pub fn is_configured(&self) -> bool {
        self.cert_path.is_some()
            && self.key_path.is_some()
            && self.trust_roots_path.is_some()
    }

    pub fn trust_snapshot(&self) -> RpcResult<TrustSnapshot> {
        let roots = self.trust_roots_path.as_ref().ok_or_else(|| {
            RpcError::Configuration(String::from(
                "security.trust_roots_path is not set",
            ))
        })?;
        TrustSnapshot::load(roots, self.revocations_path.as_deref())
            .map_err(|e| RpcError::Configuration(e.to_string()))
    }

    pub fn trust_store(&self) -> RpcResult<TrustStore> {
        Ok(TrustStore::new(self.trust_snapshot()?))
    }

    pub fn credential(&self) -> RpcResult<Credential> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Ok(Credential::load_local(cert, key)?),
            _ => Err(RpcError::NoCredential(String::from(
                "security.cert_path and security.key_path must both be set",
            ))),
        }
    }

    pub fn sanity_policy(&self) -> SanityPolicy {
        SanityPolicy {
            required_properties: self.required_properties.clone(),
            reject_limited: self.reject_limited,
        }
    }

    /// The `dips` protocol for this process, acting as its local credential.
    pub fn secure_protocol(
        &self,
        delegation: DelegationPolicy,
        max_frame: usize,
    ) -> RpcResult<SecureProtocol> {
        let credential = Arc::new(self.credential()?);
        Ok(SecureProtocol::new(credential, self.trust_store()?)
            .with_sanity_policy(self.sanity_policy())
            .with_delegation_policy(delegation)
            .with_max_frame(max_frame))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub security: SecurityConfig,
}

impl Settings {
    /// Read `path` (any format the `config` crate knows, by extension) when
    /// given, then apply environment overrides.
    pub fn load(path: Option<&str>) -> RpcResult<Settings> {
        let mut settings = config::Config::default();
        if let Some(path) = path {
            settings.merge(config::File::with_name(path)).map_err(|e| {
                RpcError::Configuration(format!("{}: {}", path, e))
            })?;
        }
        settings
            .merge(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .map_err(|e| RpcError::Configuration(e.to_string()))?;
        settings
            .try_into()
            .map_err(|e| RpcError::Configuration(e.to_string()))
    }

    /// Schemes available to a caller: `dip`, plus `dips` when security
    /// material is configured.  Frames are bounded by `client.max_frame`.
    pub fn client_registry(&self) -> RpcResult<ProtocolRegistry> {
        let secure = if self.security.is_configured() {
            Some(self.security.secure_protocol(
                self.client.delegation_policy(),
                self.client.max_frame,
            )?)
        } else {
            None
        };
        Ok(ProtocolRegistry::standard_with_max_frame(
            self.client.max_frame,
            secure,
        ))
    }

    /// The protocol a server listens with: `dips` when security material is
    /// configured, `dip` otherwise.  Frames are bounded by `server.max_frame`.
    pub fn server_protocol(&self) -> RpcResult<Arc<dyn Protocol>> {
        if self.security.is_configured() {
            let secure = self.security.secure_protocol(
                self.client.delegation_policy(),
                self.server.max_frame,
            )?;
            Ok(Arc::new(secure))
        } else {
            Ok(Arc::new(PlainProtocol::new(self.server.max_frame)))
        }
    }
}
