// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use grid_rpc::config::{ClientConfig, ServerConfig};
use grid_rpc::delegation::DelegationPolicy;
use grid_rpc::registry::Protocol;
use grid_rpc::trust::{TrustSnapshot, TrustStore};
use grid_rpc::{
    Authority, CallContext, Credential, Dispatcher, Endpoint, HandlerError,
    MethodRegistration, ProtocolRegistry, RpcClient, RpcServer,
    SecureProtocol, StaticResolver, Value,
};

pub const DAY: Duration = Duration::from_secs(86_400);

pub fn log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

/// A test certificate authority and the trust store that anchors it.
pub struct Pki {
    pub ca: Authority,
    pub trust: TrustStore,
}

impl Pki {
    pub fn new(name: &str) -> Pki {
        let ca = Authority::new(&format!("/O=Grid/CN={} CA", name), 30 * DAY);
        let snapshot = TrustSnapshot::new()
            .with_root(ca.certificate().clone())
            .expect("self-signed root");
        Pki {
            ca,
            trust: TrustStore::new(snapshot),
        }
    }

    pub fn user(
        &self,
        name: &str,
        group: &str,
        properties: &[&str],
    ) -> Arc<Credential> {
        Arc::new(self.ca.issue(
            &format!("/O=Grid/OU=Users/CN={}", name),
            Some(group),
            properties.iter().copied(),
            DAY,
        ))
    }

    pub fn host(&self, name: &str) -> Arc<Credential> {
        Arc::new(self.ca.issue(
            &format!("/O=Grid/OU=Hosts/CN={}", name),
            Some("hosts"),
            vec!["TrustedHost"],
            DAY,
        ))
    }

    pub fn secure(&self, credential: Arc<Credential>) -> SecureProtocol {
        SecureProtocol::new(credential, self.trust.clone())
    }

    pub fn registry(&self, credential: Arc<Credential>) -> ProtocolRegistry {
        ProtocolRegistry::standard(Some(self.secure(credential)))
    }

    pub fn registry_with_policy(
        &self,
        credential: Arc<Credential>,
        policy: DelegationPolicy,
    ) -> ProtocolRegistry {
        ProtocolRegistry::standard(Some(
            self.secure(credential).with_delegation_policy(policy),
        ))
    }
}

pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl RunningServer {
    pub fn endpoint(&self, scheme: &str, service: &str) -> Endpoint {
        Endpoint::new(scheme, "127.0.0.1", self.addr.port(), service)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        bind: String::from("127.0.0.1:0"),
        ..ServerConfig::default()
    }
}

/// Serve `dispatcher` on an ephemeral loopback port.
pub async fn start_server(
    protocol: Arc<dyn Protocol>,
    dispatcher: Dispatcher,
    config: ServerConfig,
) -> RunningServer {
    let server =
        RpcServer::new(config, protocol, Arc::new(dispatcher), Some(&log()));
    let listener = server.bind().await.expect("bind loopback");
    let addr = listener.local_addr().expect("local address");
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async {
            let _ = rx.await;
        };
        let _ = server.serve_with_shutdown(listener, shutdown).await;
    });
    RunningServer {
        addr,
        shutdown: Some(tx),
    }
}

/// A port nothing is listening on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local address").port()
}

pub fn client(
    registry: ProtocolRegistry,
    services: Vec<(&str, Vec<Endpoint>)>,
    config: ClientConfig,
) -> RpcClient {
    let resolver = services
        .into_iter()
        .fold(StaticResolver::new(), |r, (name, endpoints)| {
            r.with_service(name, endpoints)
        });
    RpcClient::new(config, Arc::new(resolver), registry, Some(&log()))
}

pub fn no_kwargs() -> BTreeMap<String, Value> {
    BTreeMap::new()
}

/// `whoami`: the caller's identity as a map.
pub fn whoami() -> MethodRegistration {
    MethodRegistration::new("whoami", |_a, _k, ctx: CallContext| async move {
        let mut id = BTreeMap::new();
        id.insert(
            String::from("dn"),
            ctx.identity.dn.clone().map_or(Value::Null, Value::Str),
        );
        id.insert(
            String::from("group"),
            ctx.identity.group.clone().map_or(Value::Null, Value::Str),
        );
        id.insert(String::from("proxy"), Value::Bool(ctx.identity.proxy));
        Ok::<_, HandlerError>(Value::Map(id))
    })
    .access(vec!["authenticated"])
}

pub fn echo() -> MethodRegistration {
    MethodRegistration::new("echo", |args: Vec<Value>, _k, _c| async move {
        let first = args.into_iter().next();
        Ok::<_, HandlerError>(first.unwrap_or(Value::Null))
    })
    .access(vec!["anyone"])
}
