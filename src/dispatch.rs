/*
 * Copyright 2020 Joyent, Inc.
 */

//! Method tables and per-call dispatch.
//!
//! A service registers every callable method explicitly, each with an access
//! list and optionally a declared argument signature.  The resulting table is
//! immutable and shared by all connection workers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, error, info, o, Logger};
use thiserror::Error;

use crate::credential::{Credential, Identity, Restriction};
use crate::delegation::Delegator;
use crate::error::{RpcError, RpcResult};
use crate::protocol::{RpcRequest, RpcResponse};
use crate::value::{check_signature, ArgType, Value};

/// Failure raised by a handler.  Every variant reaches the caller as a
/// structured response; none of them affects the connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{message}")]
    Failed {
        message: String,
        class: Option<String>,
    },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> HandlerError {
        HandlerError::Failed {
            message: message.into(),
            class: None,
        }
    }

    pub fn with_class<S, C>(message: S, class: C) -> HandlerError
    where
        S: Into<String>,
        C: Into<String>,
    {
        HandlerError::Failed {
            message: message.into(),
            class: Some(class.into()),
        }
    }

    fn into_rpc_error(self) -> RpcError {
        match self {
            HandlerError::Failed { message, class } => RpcError::HandlerFailed {
                message,
                extra: class.map(exception_extra),
            },
            HandlerError::Rpc(RpcError::DelegationRejected(m)) => {
                RpcError::DelegationRejected(m)
            }
            // Errors from the handler's own downstream calls are not ours to
            // report as, say, Unauthorized.
            HandlerError::Rpc(other) => RpcError::HandlerFailed {
                message: other.to_string(),
                extra: Some(exception_extra(format!("{:?}", other.kind()))),
            },
        }
    }
}

fn exception_extra<S: Into<String>>(class: S) -> Value {
    let mut extra = BTreeMap::new();
    extra.insert(String::from("exception"), Value::Str(class.into()));
    Value::Map(extra)
}

pub type HandlerResult = Result<Value, HandlerError>;

/// Everything a handler knows about the call beyond its arguments.
#[derive(Clone)]
pub struct CallContext {
    pub identity: Identity,
    pub peer_addr: Option<SocketAddr>,
    pub method: String,
    pub log: Logger,
    delegator: Delegator,
}

impl CallContext {
    pub fn new(
        identity: Identity,
        delegator: Delegator,
        log: &Logger,
    ) -> CallContext {
        CallContext {
            identity,
            peer_addr: None,
            method: String::new(),
            log: log.clone(),
            delegator,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    /// Ask the caller for a proxy of its credential valid for at most
    /// `lifetime`.
    pub async fn delegate(
        &self,
        lifetime: Duration,
        restriction: Restriction,
    ) -> RpcResult<Credential> {
        self.delegator.request(lifetime, restriction).await
    }
}

pub type Handler = Arc<
    dyn Fn(
            Vec<Value>,
            BTreeMap<String, Value>,
            CallContext,
        ) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync,
>;

/// Who may call a method.  Entries match ANY-of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessList(Vec<String>);

impl AccessList {
    pub fn new<I, S>(entries: I) -> AccessList
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AccessList(entries.into_iter().map(Into::into).collect())
    }

    pub fn permits(&self, identity: &Identity) -> bool {
        self.0.iter().any(|entry| match entry.as_str() {
            "all" | "any" | "anyone" => true,
            "authenticated" => identity.is_authenticated(),
            other => {
                identity.group.as_deref() == Some(other)
                    || identity.has_property(other)
            }
        })
    }
}

pub struct MethodRegistration {
    name: String,
    handler: Handler,
    access: AccessList,
    signature: Option<Vec<ArgType>>,
}

impl MethodRegistration {
    /// Register `handler` under `name`.  Until `access` is called nobody may
    /// call it.
    pub fn new<F, Fut>(name: &str, handler: F) -> MethodRegistration
    where
        F: Fn(Vec<Value>, BTreeMap<String, Value>, CallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args, kwargs, ctx| {
            handler(args, kwargs, ctx).boxed()
        });
        MethodRegistration {
            name: name.to_string(),
            handler,
            access: AccessList::new(Vec::<String>::new()),
            signature: None,
        }
    }

    pub fn access<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.access = AccessList::new(entries);
        self
    }

    pub fn signature(mut self, types: Vec<ArgType>) -> Self {
        self.signature = Some(types);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for MethodRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistration")
            .field("name", &self.name)
            .field("access", &self.access)
            .field("signature", &self.signature)
            .finish()
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    service: String,
    methods: Vec<MethodRegistration>,
}

impl DispatcherBuilder {
    pub fn register(mut self, registration: MethodRegistration) -> Self {
        self.methods.push(registration);
        self
    }

    pub fn build(self) -> RpcResult<Dispatcher> {
        let mut methods = HashMap::with_capacity(self.methods.len());
        for reg in self.methods {
            if methods.contains_key(&reg.name) {
                return Err(RpcError::Configuration(format!(
                    "method {} registered twice for {}",
                    reg.name, self.service
                )));
            }
            methods.insert(reg.name.clone(), reg);
        }
        Ok(Dispatcher {
            service: self.service,
            methods,
        })
    }
}

/// The read-only method table of one service.
#[derive(Debug)]
pub struct Dispatcher {
    service: String,
    methods: HashMap<String, MethodRegistration>,
}

impl Dispatcher {
    pub fn builder(service: &str) -> DispatcherBuilder {
        DispatcherBuilder {
            service: service.to_string(),
            methods: Vec::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Authorize, validate and invoke one request.  Never fails: every
    /// outcome, including a panicking handler, becomes a response.
    pub async fn handle(
        &self,
        request: RpcRequest,
        mut ctx: CallContext,
    ) -> RpcResponse {
        let log = ctx.log.new(o!("method" => request.method.clone()));

        let reg = match self.methods.get(&request.method) {
            Some(reg) => reg,
            None => {
                debug!(log, "unknown method");
                return RpcResponse::failed(&RpcError::MethodNotFound(format!(
                    "{} has no method {}",
                    self.service, request.method
                )));
            }
        };

        if !reg.access.permits(&ctx.identity) {
            info!(log, "unauthorized call"; "identity" => %ctx.identity);
            return RpcResponse::failed(&RpcError::Unauthorized(format!(
                "{} may not call {}",
                ctx.identity, request.method
            )));
        }

        if let Some(signature) = &reg.signature {
            if let Err(msg) = check_signature(signature, &request.args) {
                debug!(log, "rejected arguments"; "err" => &msg);
                return RpcResponse::failed(&RpcError::BadArguments(msg));
            }
        }

        ctx.method = request.method.clone();
        ctx.log = log.clone();
        let handler = Arc::clone(&reg.handler);
        let (args, kwargs) = (request.args, request.kwargs);

        // Both building and polling the handler's future happen on their own
        // task, so a panic at either point is contained to this call.
        let call =
            tokio::spawn(async move { handler(args, kwargs, ctx).await });
        match call.await {
            Ok(Ok(value)) => RpcResponse::ok(value),
            Ok(Err(e)) => {
                let err = e.into_rpc_error();
                debug!(log, "handler returned an error"; "err" => %err);
                RpcResponse::failed(&err)
            }
            Err(join_err) => {
                error!(log, "handler aborted"; "err" => %join_err);
                let class = if join_err.is_panic() {
                    "panic"
                } else {
                    "cancelled"
                };
                RpcResponse::failed(&RpcError::HandlerFailed {
                    message: String::from("handler aborted unexpectedly"),
                    extra: Some(exception_extra(class)),
                })
            }
        }
    }
}
