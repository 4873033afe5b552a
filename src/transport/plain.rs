/*
 * Copyright 2020 Joyent, Inc.
 */

//! Framing only: no authentication, for trusted networks.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::credential::Identity;
use crate::error::RpcResult;
use crate::protocol::{Envelope, FrameCodec};
use crate::transport::{Role, Transport};

pub const SCHEME: &str = "dip";

pub struct PlainTransport<S> {
    framed: Framed<S, FrameCodec>,
    role: Role,
    peer_addr: Option<SocketAddr>,
    peer: Identity,
}

impl<S> PlainTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        role: Role,
        peer_addr: Option<SocketAddr>,
        max_frame: usize,
    ) -> PlainTransport<S> {
        PlainTransport {
            framed: Framed::new(stream, FrameCodec::new(max_frame)),
            role,
            peer_addr,
            peer: Identity::anonymous(),
        }
    }
}

#[async_trait]
impl<S> Transport for PlainTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn role(&self) -> Role {
        self.role
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    async fn handshake(&mut self) -> RpcResult<Identity> {
        Ok(self.peer.clone())
    }

    fn peer_identity(&self) -> &Identity {
        &self.peer
    }

    async fn send(&mut self, envelope: &Envelope) -> RpcResult<()> {
        let payload = envelope.encode()?;
        self.framed.send(Bytes::from(payload)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> RpcResult<Option<Envelope>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(Envelope::decode(&frame)?)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> RpcResult<()> {
        self.framed.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::io::Builder;

    use crate::error::RpcError;
    use crate::protocol::{RpcRequest, FRAMING_VERSION};
    use crate::value::Value;

    fn frame(env: &Envelope) -> Vec<u8> {
        let payload = env.encode().unwrap();
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&payload);
        out
    }

    #[tokio::test]
    async fn reads_request_split_across_reads() {
        let request = RpcRequest::new("echo", vec![Value::from("ping")]);
        let env = Envelope::Request(request);
        let bytes = frame(&env);
        let (head, tail) = bytes.split_at(6);
        let mock = Builder::new().read(head).read(tail).build();
        let mut t = PlainTransport::new(mock, Role::Server, None, 1024);
        assert_eq!(t.receive().await.unwrap(), Some(env));
        assert_eq!(t.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn sanity_check_accepts_matching_version() {
        let ping = frame(&Envelope::Ping {
            version: FRAMING_VERSION,
        });
        let pong = frame(&Envelope::Pong {
            version: FRAMING_VERSION,
        });
        let mock = Builder::new().write(&ping).read(&pong).build();
        let mut t = PlainTransport::new(mock, Role::Client, None, 1024);
        t.sanity_check().await.unwrap();
    }

    #[tokio::test]
    async fn sanity_check_rejects_other_version() {
        let ping = frame(&Envelope::Ping {
            version: FRAMING_VERSION,
        });
        let pong = frame(&Envelope::Pong { version: 99 });
        let mock = Builder::new().write(&ping).read(&pong).build();
        let mut t = PlainTransport::new(mock, Role::Client, None, 1024);
        assert!(matches!(t.sanity_check().await, Err(RpcError::Handshake(_))));
    }

    #[tokio::test]
    async fn handshake_yields_anonymous_identity() {
        let mock = Builder::new().build();
        let mut t = PlainTransport::new(mock, Role::Server, None, 1024);
        let id = t.handshake().await.unwrap();
        assert!(!id.is_authenticated());
    }
}
