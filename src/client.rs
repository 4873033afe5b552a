/*
 * Copyright 2020 Joyent, Inc.
 */

//! The calling side: resolve a service, pick an endpoint, run one call.
//!
//! Endpoints are tried in the order the resolver returns them.  Failing to
//! connect, authenticate or sanity check an endpoint moves on to the next
//! one; the failures are kept and logged with the eventual result.  Once a
//! request has been sent it is never retried elsewhere, since the remote
//! side may already have acted on it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slog::{debug, o, warn, Drain, Logger};
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::endpoint::{Endpoint, Resolver};
use crate::error::{EndpointFailure, RpcError, RpcResult};
use crate::protocol::RpcRequest;
use crate::registry::ProtocolRegistry;
use crate::value::Value;

/// The outcome of a successful call, with the endpoint that served it and
/// the failures suppressed along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    pub value: Value,
    pub endpoint: Endpoint,
    pub suppressed: Vec<EndpointFailure>,
}

pub struct RpcClient {
    config: ClientConfig,
    resolver: Arc<dyn Resolver>,
    registry: ProtocolRegistry,
    pool: Mutex<HashMap<Endpoint, Vec<Connection>>>,
    log: Logger,
}

impl RpcClient {
    pub fn new(
        config: ClientConfig,
        resolver: Arc<dyn Resolver>,
        registry: ProtocolRegistry,
        log: Option<&Logger>,
    ) -> RpcClient {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        RpcClient {
            config,
            resolver,
            registry,
            pool: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Call `method` on `service`.  `call_timeout` overrides the configured
    /// per-call timeout.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        call_timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        self.call_detailed(service, method, args, kwargs, call_timeout)
            .await
            .map(|report| report.value)
    }

    pub async fn call_detailed(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        call_timeout: Option<Duration>,
    ) -> RpcResult<CallReport> {
        let log = self.log.new(o!(
            "service" => service.to_string(),
            "method" => method.to_string()
        ));

        let endpoints = self.resolver.resolve(service).await?;
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoints(service.to_string()));
        }
        let call_timeout =
            call_timeout.unwrap_or_else(|| self.config.call_timeout());

        let mut suppressed = Vec::new();
        for endpoint in endpoints {
            let mut conn = match self.checkout(&endpoint, &log).await {
                Ok(conn) => conn,
                // An unusable scheme is a deployment mistake, not an outage.
                Err(e @ RpcError::Configuration(_)) => return Err(e),
                Err(e) => {
                    debug!(log, "endpoint unavailable";
                           "endpoint" => %endpoint, "err" => %e);
                    suppressed.push(EndpointFailure {
                        endpoint: endpoint.to_string(),
                        error: e,
                    });
                    continue;
                }
            };

            let request = RpcRequest::new(method, args.clone())
                .with_kwargs(kwargs.clone());
            let outcome = timeout(call_timeout, conn.call(request)).await;
            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    self.report_suppressed(&suppressed, &log);
                    return Err(e);
                }
                Err(_) => {
                    conn.close().await;
                    self.report_suppressed(&suppressed, &log);
                    warn!(log, "call timed out"; "endpoint" => %endpoint,
                          "timeout" => ?call_timeout);
                    return Err(RpcError::Timeout(call_timeout));
                }
            };

            self.checkin(conn);
            self.report_suppressed(&suppressed, &log);
            let value = response.into_result()?;
            return Ok(CallReport {
                value,
                endpoint,
                suppressed,
            });
        }

        warn!(log, "no endpoint reachable"; "attempts" => suppressed.len());
        Err(RpcError::AllEndpointsUnreachable(suppressed))
    }

    fn report_suppressed(&self, suppressed: &[EndpointFailure], log: &Logger) {
        for failure in suppressed {
            warn!(log, "skipped endpoint";
                  "endpoint" => &failure.endpoint, "err" => %failure.error);
        }
    }

    /// A `Ready` connection to `endpoint`: a pooled one that still passes
    /// the sanity check, or a new one.
    async fn checkout(
        &self,
        endpoint: &Endpoint,
        log: &Logger,
    ) -> RpcResult<Connection> {
        let protocol = self.registry.get(&endpoint.scheme)?;

        while let Some(mut conn) = self.take_pooled(endpoint) {
            if conn.idle_for() > self.config.pool_idle() {
                conn.close().await;
                continue;
            }
            match conn.recheck().await {
                Ok(()) => return Ok(conn),
                Err(e) => debug!(log, "discarding pooled connection";
                                 "endpoint" => %endpoint, "err" => %e),
            }
        }

        let connect_timeout = self.config.connect_timeout();
        Connection::open(endpoint, protocol, connect_timeout, log).await
    }

    fn take_pooled(&self, endpoint: &Endpoint) -> Option<Connection> {
        self.pool.lock().get_mut(endpoint).and_then(Vec::pop)
    }

    fn checkin(&self, conn: Connection) {
        if !conn.is_ready() || self.config.pool_size == 0 {
            return;
        }
        let mut pool = self.pool.lock();
        let idle = pool
            .entry(conn.endpoint().clone())
            .or_insert_with(Vec::new);
        if idle.len() < self.config.pool_size {
            idle.push(conn);
        }
    }

    /// Idle connections held for `endpoint`.
    pub fn pooled_connections(&self, endpoint: &Endpoint) -> usize {
        self.pool.lock().get(endpoint).map_or(0, Vec::len)
    }

    /// Close every pooled connection.
    pub async fn close_idle(&self) {
        let drained: Vec<Connection> = self
            .pool
            .lock()
            .drain()
            .flat_map(|(_, conns)| conns)
            .collect();
        for mut conn in drained {
            conn.close().await;
        }
    }
}
