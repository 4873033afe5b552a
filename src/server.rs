/*
 * Copyright 2020 Joyent, Inc.
 */

//! Accept loop and per-connection workers.
//!
//! Each accepted connection is owned by one worker task for its whole life.
//! The number of live workers is bounded by `max_connections`; once the bound
//! is reached the server stops accepting and further clients wait in the
//! listen backlog until a worker exits.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use slog::{debug, info, o, warn, Drain, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::delegation::Delegator;
use crate::dispatch::{CallContext, Dispatcher};
use crate::endpoint::Endpoint;
use crate::error::{RpcError, RpcResult};
use crate::protocol::{Envelope, RpcRequest, FRAMING_VERSION};
use crate::registry::Protocol;

pub struct RpcServer {
    worker: Arc<Worker>,
    limiter: Arc<Semaphore>,
    log: Logger,
}

struct Worker {
    config: ServerConfig,
    protocol: Arc<dyn Protocol>,
    dispatcher: Arc<Dispatcher>,
    log: Logger,
}

impl RpcServer {
    pub fn new(
        config: ServerConfig,
        protocol: Arc<dyn Protocol>,
        dispatcher: Arc<Dispatcher>,
        log: Option<&Logger>,
    ) -> RpcServer {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!(
                "service" => dispatcher.service().to_string(),
                "scheme" => protocol.scheme()
            ));
        if protocol.max_frame() != config.max_frame {
            warn!(log, "protocol frame limit differs from server.max_frame";
                  "protocol" => protocol.max_frame(),
                  "configured" => config.max_frame);
        }
        let limiter = Arc::new(Semaphore::new(config.max_connections.max(1)));
        RpcServer {
            worker: Arc::new(Worker {
                config,
                protocol,
                dispatcher,
                log: log.clone(),
            }),
            limiter,
            log,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> RpcResult<TcpListener> {
        let bind = &self.worker.config.bind;
        TcpListener::bind(bind).await.map_err(|e| {
            RpcError::Configuration(format!("bind {}: {}", bind, e))
        })
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        let limit = self.worker.config.max_connections.max(1);
        limit - self.limiter.available_permits()
    }

    pub async fn serve(&self, listener: TcpListener) -> RpcResult<()> {
        self.serve_with_shutdown(listener, futures::future::pending())
            .await
    }

    /// Accept until `shutdown` resolves.  Workers already running finish
    /// their connections on their own.
    pub async fn serve_with_shutdown<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> RpcResult<()>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(self.log, "listening"; "address" => %addr);
        }
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.limiter).acquire_owned() => {
                    permit.map_err(|_| {
                        RpcError::Configuration(String::from(
                            "connection limiter closed",
                        ))
                    })?
                }
            };

            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(self.log, "accept failed"; "err" => %e);
                        continue;
                    }
                }
            };

            let worker = Arc::clone(&self.worker);
            tokio::spawn(async move {
                worker.run(stream, addr).await;
                drop(permit);
            });
        }

        info!(self.log, "no longer accepting connections");
        Ok(())
    }
}

impl Worker {
    async fn run(&self, stream: TcpStream, addr: SocketAddr) {
        let log = self.log.new(o!("peer" => addr.to_string()));
        if let Err(e) = stream.set_nodelay(true) {
            debug!(log, "failed to set TCP_NODELAY"; "err" => %e);
        }

        let endpoint = Endpoint::new(
            self.protocol.scheme(),
            &addr.ip().to_string(),
            addr.port(),
            self.dispatcher.service(),
        );
        let transport = self.protocol.accept(stream, Some(addr));
        let mut conn = Connection::accepted(
            endpoint,
            Arc::clone(&self.protocol),
            transport,
            &log,
        );

        let handshake_timeout = self.config.handshake_timeout();
        let handshake = timeout(handshake_timeout, conn.handshake()).await;
        let established = match handshake {
            Ok(Ok(peer)) => self.protocol.admit(&peer).map(|()| peer),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Handshake(format!(
                "not completed within {:?}",
                handshake_timeout
            ))),
        };
        let peer = match established {
            Ok(peer) => peer,
            Err(e) => {
                // Nothing is sent back; the client only sees the close.
                info!(log, "handshake failed"; "err" => %e);
                conn.fail(&e).await;
                return;
            }
        };
        conn.mark_ready();
        let log = log.new(o!("dn" => peer.to_string()));
        debug!(log, "connection ready");

        if let Err(e) = self.serve_requests(&mut conn, &log).await {
            debug!(log, "connection ended with error"; "err" => %e);
            conn.fail(&e).await;
            return;
        }
        conn.close().await;
        debug!(log, "connection closed");
    }

    async fn serve_requests(
        &self,
        conn: &mut Connection,
        log: &Logger,
    ) -> RpcResult<()> {
        let idle_timeout = self.config.idle_timeout();
        loop {
            let received = conn.transport().receive();
            let envelope = match timeout(idle_timeout, received).await {
                Ok(Ok(Some(envelope))) => envelope,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(log, "closing idle connection");
                    return Ok(());
                }
            };

            match envelope {
                Envelope::Ping { version } => {
                    if version != FRAMING_VERSION {
                        warn!(log, "peer pinged with unknown framing version";
                              "version" => version);
                    }
                    conn.transport()
                        .send(&Envelope::Pong {
                            version: FRAMING_VERSION,
                        })
                        .await?;
                }
                Envelope::Request(request) => {
                    self.serve_call(conn, request, log).await?
                }
                Envelope::DelegationReply(_) => {
                    // Late answer to an exchange that already timed out.
                    warn!(log, "ignoring unsolicited delegation reply");
                }
                other => {
                    return Err(RpcError::Protocol(format!(
                        "unexpected {} from client",
                        other.kind()
                    )))
                }
            }
        }
    }

    /// Run one call to completion.  While the handler runs, the worker
    /// carries out any delegation exchanges it asks for; the connection is
    /// not otherwise read until the response is sent.
    async fn serve_call(
        &self,
        conn: &mut Connection,
        request: RpcRequest,
        log: &Logger,
    ) -> RpcResult<()> {
        conn.begin_call()?;
        debug!(log, "call"; "method" => &request.method);

        let (delegator, mut commands) = Delegator::channel();
        let ctx = CallContext::new(conn.peer().clone(), delegator, log)
            .with_peer_addr(conn.transport().peer_addr());
        let handling = self.dispatcher.handle(request, ctx);
        tokio::pin!(handling);

        let delegation_timeout = self.config.delegation_timeout();
        let response = loop {
            tokio::select! {
                response = &mut handling => break response,
                Some(cmd) = commands.recv() => {
                    let exchange = self.protocol.request_delegation(
                        conn.transport(),
                        cmd.lifetime,
                        cmd.restriction,
                        log,
                    );
                    let outcome = timeout(delegation_timeout, exchange).await;
                    let result = match outcome {
                        Ok(result) => result,
                        Err(_) => Err(RpcError::DelegationRejected(format!(
                            "no reply within {:?}",
                            delegation_timeout
                        ))),
                    };
                    if cmd.reply.send(result).is_err() {
                        debug!(log, "handler finished before its delegation");
                    }
                }
            }
        };

        conn.transport().send(&Envelope::Response(response)).await?;
        conn.end_call();
        Ok(())
    }
}
