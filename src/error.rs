/*
 * Copyright 2020 Joyent, Inc.
 */

use std::fmt;
use std::io;
use std::time::Duration;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::credential::CredentialError;
use crate::value::Value;

/// The closed set of failure kinds.  The discriminant is the `errno` carried
/// by a failed response on the wire.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    FromPrimitive,
    ToPrimitive,
)]
pub enum ErrorKind {
    Connection = 1,
    Handshake = 2,
    Timeout = 3,
    MethodNotFound = 4,
    Unauthorized = 5,
    BadArguments = 6,
    HandlerFailed = 7,
    DelegationRejected = 8,
    AllEndpointsUnreachable = 9,
    NoEndpoints = 10,
    NoCredential = 11,
    Configuration = 12,
    Protocol = 13,
}

impl ErrorKind {
    pub fn errno(self) -> u32 {
        ToPrimitive::to_u32(&self).unwrap_or(0)
    }

    pub fn from_errno(errno: u32) -> Option<ErrorKind> {
        FromPrimitive::from_u32(errno)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One suppressed failure from an endpoint the client gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub error: RpcError,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.error)
    }
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<String>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("unknown method: {0}")]
    MethodNotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("handler failed: {message}")]
    HandlerFailed {
        message: String,
        extra: Option<Value>,
    },
    #[error("delegation rejected: {0}")]
    DelegationRejected(String),
    #[error("all endpoints unreachable: {}", join_failures(.0))]
    AllEndpointsUnreachable(Vec<EndpointFailure>),
    #[error("no endpoints for service {0}")]
    NoEndpoints(String),
    #[error("no credential: {0}")]
    NoCredential(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Connection(_) => ErrorKind::Connection,
            RpcError::Handshake(_) => ErrorKind::Handshake,
            RpcError::Timeout(_) => ErrorKind::Timeout,
            RpcError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            RpcError::Unauthorized(_) => ErrorKind::Unauthorized,
            RpcError::BadArguments(_) => ErrorKind::BadArguments,
            RpcError::HandlerFailed { .. } => ErrorKind::HandlerFailed,
            RpcError::DelegationRejected(_) => ErrorKind::DelegationRejected,
            RpcError::AllEndpointsUnreachable(_) => {
                ErrorKind::AllEndpointsUnreachable
            }
            RpcError::NoEndpoints(_) => ErrorKind::NoEndpoints,
            RpcError::NoCredential(_) => ErrorKind::NoCredential,
            RpcError::Configuration(_) => ErrorKind::Configuration,
            RpcError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// The message without the kind prefix, as carried by a failed response.
    pub fn message(&self) -> String {
        match self {
            RpcError::Connection(m)
            | RpcError::Handshake(m)
            | RpcError::MethodNotFound(m)
            | RpcError::Unauthorized(m)
            | RpcError::BadArguments(m)
            | RpcError::DelegationRejected(m)
            | RpcError::NoEndpoints(m)
            | RpcError::NoCredential(m)
            | RpcError::Configuration(m)
            | RpcError::Protocol(m) => m.clone(),
            RpcError::HandlerFailed { message, .. } => message.clone(),
            RpcError::Timeout(d) => format!("no response within {:?}", d),
            RpcError::AllEndpointsUnreachable(f) => join_failures(f),
        }
    }

    pub fn extra(&self) -> Option<&Value> {
        match self {
            RpcError::HandlerFailed { extra, .. } => extra.as_ref(),
            _ => None,
        }
    }

    /// Rebuild an error from the fields of a failed response.  Unknown codes
    /// are reported as handler failures so nothing is silently dropped.
    pub fn from_failure(
        errno: u32,
        message: String,
        extra: Option<Value>,
    ) -> RpcError {
        match ErrorKind::from_errno(errno) {
            Some(ErrorKind::Connection) => RpcError::Connection(message),
            Some(ErrorKind::Handshake) => RpcError::Handshake(message),
            Some(ErrorKind::MethodNotFound) => {
                RpcError::MethodNotFound(message)
            }
            Some(ErrorKind::Unauthorized) => RpcError::Unauthorized(message),
            Some(ErrorKind::BadArguments) => RpcError::BadArguments(message),
            Some(ErrorKind::DelegationRejected) => {
                RpcError::DelegationRejected(message)
            }
            Some(ErrorKind::NoEndpoints) => RpcError::NoEndpoints(message),
            Some(ErrorKind::NoCredential) => RpcError::NoCredential(message),
            Some(ErrorKind::Configuration) => {
                RpcError::Configuration(message)
            }
            Some(ErrorKind::Protocol) => RpcError::Protocol(message),
            // A server never reports these for itself; carry them as faults.
            Some(ErrorKind::Timeout)
            | Some(ErrorKind::AllEndpointsUnreachable)
            | Some(ErrorKind::HandlerFailed)
            | None => RpcError::HandlerFailed { message, extra },
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Protocol(format!("malformed payload: {}", e))
    }
}

impl From<CredentialError> for RpcError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Missing(_) | CredentialError::Io(_) => {
                RpcError::NoCredential(e.to_string())
            }
            _ => RpcError::Handshake(e.to_string()),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
