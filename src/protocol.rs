/*
 * Copyright 2020 Joyent, Inc.
 */

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_derive::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::delegation::{DelegationReply, DelegationRequest};
use crate::error::{RpcError, RpcResult};
use crate::value::Value;

const FP_OFF_DATA: usize = 0x4;
const FP_HEADER_SZ: usize = FP_OFF_DATA;

pub const FRAMING_VERSION: u32 = 1;

/// Largest payload accepted by default.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl RpcRequest {
    pub fn new(method: &str, args: Vec<Value>) -> RpcRequest {
        RpcRequest {
            method: String::from(method),
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: BTreeMap<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Ok {
        value: Value,
    },
    Failed {
        errno: u32,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<Value>,
    },
}

impl RpcResponse {
    pub fn ok(value: Value) -> RpcResponse {
        RpcResponse::Ok { value }
    }

    pub fn failed(err: &RpcError) -> RpcResponse {
        RpcResponse::Failed {
            errno: err.kind().errno(),
            message: err.message(),
            extra: err.extra().cloned(),
        }
    }

    pub fn into_result(self) -> RpcResult<Value> {
        match self {
            RpcResponse::Ok { value } => Ok(value),
            RpcResponse::Failed {
                errno,
                message,
                extra,
            } => Err(RpcError::from_failure(errno, message, extra)),
        }
    }
}

/// One unit exchanged over a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Envelope {
    Ping { version: u32 },
    Pong { version: u32 },
    Request(RpcRequest),
    Response(RpcResponse),
    DelegationRequest(DelegationRequest),
    DelegationReply(DelegationReply),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::DelegationRequest(_) => "delegation_request",
            Envelope::DelegationReply(_) => "delegation_reply",
        }
    }

    pub fn encode(&self) -> RpcResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> RpcResult<Envelope> {
        Ok(serde_json::from_slice(buf)?)
    }
}

/// Length-prefixed frames: a 4-byte big-endian payload length followed by the
/// payload.  The codec is payload-agnostic so the secure transport can seal
/// frames after serialization.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> FrameCodec {
        FrameCodec { max_frame }
    }

    fn oversized(&self, len: usize) -> Error {
        let msg = format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, self.max_frame
        );
        Error::new(ErrorKind::InvalidData, msg)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<BytesMut>, Error> {
        if buf.len() < FP_HEADER_SZ {
            return Ok(None);
        }

        let data_len = BigEndian::read_u32(&buf[..FP_OFF_DATA]) as usize;
        if data_len > self.max_frame {
            return Err(self.oversized(data_len));
        }

        if buf.len() < FP_HEADER_SZ + data_len {
            buf.reserve(FP_HEADER_SZ + data_len - buf.len());
            return Ok(None);
        }

        buf.advance(FP_HEADER_SZ);
        Ok(Some(buf.split_to(data_len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, buf: &mut BytesMut) -> Result<(), Error> {
        if item.len() > self.max_frame {
            return Err(self.oversized(item.len()));
        }
        buf.reserve(FP_HEADER_SZ + item.len());
        buf.put_u32(item.len() as u32);
        buf.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};

    fn arbitrary_value(g: &mut Gen, depth: usize) -> Value {
        let leaf_only = depth == 0;
        let choice = u8::arbitrary(g) % if leaf_only { 6 } else { 8 };
        match choice {
            0 => Value::Null,
            1 => Value::Bool(bool::arbitrary(g)),
            2 => Value::Int(i64::arbitrary(g)),
            3 => Value::Float(f64::arbitrary(g)),
            4 => Value::Str(String::arbitrary(g)),
            5 => Value::Bytes(Vec::<u8>::arbitrary(g)),
            6 => {
                let n = usize::arbitrary(g) % 4;
                Value::List(
                    (0..n).map(|_| arbitrary_value(g, depth - 1)).collect(),
                )
            }
            _ => {
                let n = usize::arbitrary(g) % 4;
                Value::Map(
                    (0..n)
                        .map(|_| {
                            let key = String::arbitrary(g);
                            (key, arbitrary_value(g, depth - 1))
                        })
                        .collect(),
                )
            }
        }
    }

    #[derive(Debug, Clone)]
    struct AnyValue(Value);

    impl Arbitrary for AnyValue {
        fn arbitrary(g: &mut Gen) -> Self {
            AnyValue(arbitrary_value(g, 3))
        }
    }

    // Compares the serialized form, since NaN is never equal to itself.
    fn survives_frame(env: &Envelope) -> bool {
        through_frame(env).encode().unwrap() == env.encode().unwrap()
    }

    fn through_frame(env: &Envelope) -> Envelope {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let payload = env.encode().unwrap();
        codec.encode(Bytes::from(payload), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        Envelope::decode(&frame).unwrap()
    }

    #[test]
    fn request_round_trip() {
        fn prop(method: String, args: Vec<AnyValue>, kw: AnyValue) -> bool {
            let mut kwargs = BTreeMap::new();
            kwargs.insert(String::from("opt"), kw.0);
            let req = RpcRequest::new(
                &method,
                args.into_iter().map(|a| a.0).collect(),
            )
            .with_kwargs(kwargs);
            survives_frame(&Envelope::Request(req))
        }
        quickcheck(prop as fn(String, Vec<AnyValue>, AnyValue) -> bool);
    }

    #[test]
    fn response_round_trip() {
        fn prop(v: AnyValue, errno: u32, message: String) -> bool {
            let ok = Envelope::Response(RpcResponse::ok(v.0.clone()));
            let failed = Envelope::Response(RpcResponse::Failed {
                errno,
                message,
                extra: Some(v.0),
            });
            survives_frame(&ok) && survives_frame(&failed)
        }
        quickcheck(prop as fn(AnyValue, u32, String) -> bool);
    }

    #[test]
    fn non_finite_floats_cross_the_wire() {
        let args = vec![
            Value::Float(f64::NAN),
            Value::Float(f64::INFINITY),
            Value::List(vec![Value::Float(f64::NEG_INFINITY)]),
        ];
        let env = Envelope::Request(RpcRequest::new("sum", args));
        let args = match through_frame(&env) {
            Envelope::Request(req) => req.args,
            other => panic!("unexpected {:?}", other),
        };
        assert!(args[0].as_f64().unwrap().is_nan());
        assert_eq!(args[1], Value::Float(f64::INFINITY));
        assert_eq!(args[2], Value::List(vec![Value::Float(f64::NEG_INFINITY)]));
    }

    #[test]
    fn header_is_big_endian_length() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, b'h', b'e'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"llo");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 9][..]);
        assert!(codec.decode(&mut buf).is_err());
        let mut out = BytesMut::new();
        let payload = Bytes::from_static(b"too long");
        assert!(codec.encode(payload, &mut out).is_err());
    }

    #[test]
    fn response_converts_to_typed_error() {
        let err = RpcError::BadArguments(String::from("argument 0"));
        let resp = RpcResponse::failed(&err);
        assert_eq!(resp.into_result(), Err(err));
    }
}
