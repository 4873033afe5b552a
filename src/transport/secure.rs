/*
 * Copyright 2020 Joyent, Inc.
 */

//! Mutually authenticated, encrypted framing.
//!
//! Handshake sequence:
//!
//! ```text
//! Client                                            Server
//!   |  -- client_hello { version, chain, eph, nonce } -->  |
//!   |  <-- server_hello { version, chain, eph, nonce,      |
//!   |                     sig(server, transcript) } ------ |
//!   |  -- finish { sig(client, transcript) } ----------->  |
//! ```
//!
//! Both chains are verified against one trust snapshot taken when the
//! handshake starts.  The transcript hash covers the client hello as sent and
//! the server hello fields.  Per-direction session keys are derived with
//! BLAKE3 from the X25519 shared secret and the transcript; every later frame
//! is sealed with ChaCha20-Poly1305 using a per-direction counter nonce.

use std::convert::TryInto;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, Verifier};
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::credential::{unix_now, Certificate, Credential, Identity};
use crate::error::{RpcError, RpcResult};
use crate::protocol::{Envelope, FrameCodec};
use crate::transport::{Role, Transport};
use crate::trust::TrustStore;

pub const SCHEME: &str = "dips";

pub const PROTOCOL_VERSION: u32 = 1;

const TRANSCRIPT_DOMAIN: &[u8] = b"grid-rpc handshake v1";
const CLIENT_TO_SERVER: &str = "grid-rpc v1 client to server";
const SERVER_TO_CLIENT: &str = "grid-rpc v1 server to client";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    version: u32,
    chain: Vec<Certificate>,
    ephemeral: String,
    nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum HandshakeMessage {
    ClientHello { hello: Hello },
    ServerHello { hello: Hello, signature: String },
    Finish { signature: String },
}

struct Session {
    seal: ChaCha20Poly1305,
    open: ChaCha20Poly1305,
    sent: u64,
    received: u64,
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

impl Session {
    fn derive(shared: &[u8; 32], transcript: &[u8; 32], role: Role) -> Session {
        let mut material = Vec::with_capacity(64);
        material.extend_from_slice(shared);
        material.extend_from_slice(transcript);
        let c2s = blake3::derive_key(CLIENT_TO_SERVER, &material);
        let s2c = blake3::derive_key(SERVER_TO_CLIENT, &material);
        let (seal, open) = match role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };
        Session {
            seal: ChaCha20Poly1305::new(Key::from_slice(&seal)),
            open: ChaCha20Poly1305::new(Key::from_slice(&open)),
            sent: 0,
            received: 0,
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> RpcResult<Vec<u8>> {
        let nonce = nonce_for(self.sent);
        self.sent = self.sent.checked_add(1).ok_or_else(|| {
            RpcError::Protocol(String::from("send counter exhausted"))
        })?;
        self.seal
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| RpcError::Protocol(String::from("cannot seal frame")))
    }

    fn open(&mut self, ciphertext: &[u8]) -> RpcResult<Vec<u8>> {
        let nonce = nonce_for(self.received);
        self.received = self.received.checked_add(1).ok_or_else(|| {
            RpcError::Protocol(String::from("receive counter exhausted"))
        })?;
        self.open
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| {
                RpcError::Protocol(String::from("frame failed authentication"))
            })
    }
}

fn transcript_hash(
    client_hello: &[u8],
    server_hello: &Hello,
) -> RpcResult<[u8; 32]> {
    let server_bytes = serde_json::to_vec(server_hello)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    hasher.update(&(client_hello.len() as u64).to_be_bytes());
    hasher.update(client_hello);
    hasher.update(&(server_bytes.len() as u64).to_be_bytes());
    hasher.update(&server_bytes);
    Ok(*hasher.finalize().as_bytes())
}

fn signed_message(label: &[u8], transcript: &[u8; 32]) -> Vec<u8> {
    let mut msg = label.to_vec();
    msg.extend_from_slice(transcript);
    msg
}

fn decode_key32(s: &str, what: &str) -> RpcResult<[u8; 32]> {
    let raw = hex::decode(s)
        .map_err(|e| RpcError::Handshake(format!("bad {}: {}", what, e)))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| RpcError::Handshake(format!("{} must be 32 bytes", what)))
}

fn verify_peer_signature(
    chain: &[Certificate],
    label: &[u8],
    transcript: &[u8; 32],
    signature: &str,
) -> RpcResult<()> {
    let handshake = |msg: &str| RpcError::Handshake(String::from(msg));
    let leaf = chain
        .first()
        .ok_or_else(|| handshake("peer sent an empty chain"))?;
    let key = leaf.verifying_key()?;
    let raw = hex::decode(signature)
        .map_err(|_| handshake("malformed handshake signature"))?;
    let sig = Signature::from_slice(&raw)
        .map_err(|_| handshake("malformed handshake signature"))?;
    key.verify(&signed_message(label, transcript), &sig)
        .map_err(|_| handshake("peer does not hold the certificate key"))
}

pub struct SecureTransport<S> {
    framed: Framed<S, FrameCodec>,
    role: Role,
    peer_addr: Option<SocketAddr>,
    credential: Arc<Credential>,
    trust: TrustStore,
    peer: Identity,
    session: Option<Session>,
}

impl<S> SecureTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        role: Role,
        peer_addr: Option<SocketAddr>,
        credential: Arc<Credential>,
        trust: TrustStore,
        max_frame: usize,
    ) -> SecureTransport<S> {
        SecureTransport {
            framed: Framed::new(stream, FrameCodec::new(max_frame)),
            role,
            peer_addr,
            credential,
            trust,
            peer: Identity::anonymous(),
            session: None,
        }
    }

    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    async fn send_raw(&mut self, payload: Vec<u8>) -> RpcResult<()> {
        self.framed.send(Bytes::from(payload)).await?;
        Ok(())
    }

    async fn receive_raw(&mut self) -> RpcResult<Vec<u8>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame.to_vec()),
            Some(Err(e)) => Err(e.into()),
            None => Err(RpcError::Handshake(String::from(
                "peer closed during handshake",
            ))),
        }
    }

    async fn receive_step(&mut self) -> RpcResult<(Vec<u8>, HandshakeMessage)> {
        let raw = self.receive_raw().await?;
        let msg = serde_json::from_slice(&raw).map_err(|e| {
            RpcError::Handshake(format!("malformed handshake message: {}", e))
        })?;
        Ok((raw, msg))
    }

    fn local_hello(&self, ephemeral: &PublicKey) -> Hello {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        Hello {
            version: PROTOCOL_VERSION,
            chain: self.credential.chain().to_vec(),
            ephemeral: hex::encode(ephemeral.as_bytes()),
            nonce: hex::encode(nonce),
        }
    }

    fn sign(&self, label: &[u8], transcript: &[u8; 32]) -> String {
        let sig = self
            .credential
            .signing_key()
            .sign(&signed_message(label, transcript));
        hex::encode(sig.to_bytes())
    }

    fn check_version(hello: &Hello) -> RpcResult<()> {
        if hello.version != PROTOCOL_VERSION {
            return Err(RpcError::Handshake(format!(
                "peer speaks protocol version {}, expected {}",
                hello.version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }

    fn agree(
        secret: EphemeralSecret,
        peer_ephemeral: &str,
    ) -> RpcResult<[u8; 32]> {
        let peer =
            PublicKey::from(decode_key32(peer_ephemeral, "ephemeral key")?);
        let shared = secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(RpcError::Handshake(String::from(
                "peer sent a degenerate ephemeral key",
            )));
        }
        Ok(*shared.as_bytes())
    }

    async fn client_handshake(&mut self) -> RpcResult<Identity> {
        let snapshot = self.trust.snapshot();
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let hello = self.local_hello(&PublicKey::from(&secret));
        let client_bytes =
            serde_json::to_vec(&HandshakeMessage::ClientHello { hello })?;
        self.send_raw(client_bytes.clone()).await?;

        let (server_hello, signature) = match self.receive_step().await? {
            (_, HandshakeMessage::ServerHello { hello, signature }) => {
                (hello, signature)
            }
            _ => {
                return Err(RpcError::Handshake(String::from(
                    "expected server hello",
                )))
            }
        };
        Self::check_version(&server_hello)?;
        let identity = snapshot.verify(&server_hello.chain, unix_now())?;
        let transcript = transcript_hash(&client_bytes, &server_hello)?;
        verify_peer_signature(
            &server_hello.chain,
            b"server",
            &transcript,
            &signature,
        )?;

        let finish = HandshakeMessage::Finish {
            signature: self.sign(b"client", &transcript),
        };
        self.send_raw(serde_json::to_vec(&finish)?).await?;

        let shared = Self::agree(secret, &server_hello.ephemeral)?;
        self.session =
            Some(Session::derive(&shared, &transcript, Role::Client));
        Ok(identity)
    }

    async fn server_handshake(&mut self) -> RpcResult<Identity> {
        let snapshot = self.trust.snapshot();
        let (client_bytes, client_hello) = match self.receive_step().await? {
            (raw, HandshakeMessage::ClientHello { hello }) => (raw, hello),
            _ => {
                return Err(RpcError::Handshake(String::from(
                    "expected client hello",
                )))
            }
        };
        Self::check_version(&client_hello)?;
        let identity = snapshot.verify(&client_hello.chain, unix_now())?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let hello = self.local_hello(&PublicKey::from(&secret));
        let transcript = transcript_hash(&client_bytes, &hello)?;
        let reply = HandshakeMessage::ServerHello {
            signature: self.sign(b"server", &transcript),
            hello,
        };
        self.send_raw(serde_json::to_vec(&reply)?).await?;

        match self.receive_step().await? {
            (_, HandshakeMessage::Finish { signature }) => {
                verify_peer_signature(
                    &client_hello.chain,
                    b"client",
                    &transcript,
                    &signature,
                )?
            }
            _ => {
                return Err(RpcError::Handshake(String::from(
                    "expected finish",
                )))
            }
        }

        let shared = Self::agree(secret, &client_hello.ephemeral)?;
        self.session =
            Some(Session::derive(&shared, &transcript, Role::Server));
        Ok(identity)
    }
}

#[async_trait]
impl<S> Transport for SecureTransport<S>
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
        if self.session.is_some() {
            return Ok(self.peer.clone());
        }
        // An expired local credential fails before anything is sent.
        self.credential.ensure_valid(unix_now())?;

        let identity = match self.role {
            Role::Client => self.client_handshake().await?,
            Role::Server => self.server_handshake().await?,
        };
        self.peer = identity.clone();
        Ok(identity)
    }

    fn peer_identity(&self) -> &Identity {
        &self.peer
    }

    async fn send(&mut self, envelope: &Envelope) -> RpcResult<()> {
        let payload = envelope.encode()?;
        let sealed = match self.session.as_mut() {
            Some(session) => session.seal(&payload)?,
            None => {
                return Err(RpcError::Protocol(String::from(
                    "send before handshake",
                )))
            }
        };
        self.send_raw(sealed).await
    }

    async fn receive(&mut self) -> RpcResult<Option<Envelope>> {
        if self.session.is_none() {
            return Err(RpcError::Protocol(String::from(
                "receive before handshake",
            )));
        }
        let frame = match self.framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        };
        let plaintext = match self.session.as_mut() {
            Some(session) => session.open(&frame)?,
            None => {
                return Err(RpcError::Protocol(String::from(
                    "receive before handshake",
                )))
            }
        };
        Ok(Some(Envelope::decode(&plaintext)?))
    }

    async fn close(&mut self) -> RpcResult<()> {
        self.framed.close().await?;
        Ok(())
    }
}
