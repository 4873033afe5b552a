/*
 * Copyright 2020 Joyent, Inc.
 */

//! Endpoints and the service discovery seam.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use parking_lot::RwLock;
use url::Url;

use crate::error::{RpcError, RpcResult};

/// One candidate instance of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(scheme: &str, host: &str, port: u16, path: &str) -> Endpoint {
        Endpoint {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.trim_start_matches('/').to_string(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}/{}", self.scheme, self.host, self.port, self.path)
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Endpoint, RpcError> {
        let bad = |why: String| RpcError::Configuration(why);
        let url = Url::parse(s)
            .map_err(|e| bad(format!("bad endpoint {}: {}", s, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| bad(format!("endpoint {} has no host", s)))?;
        let port = url
            .port()
            .ok_or_else(|| bad(format!("endpoint {} has no port", s)))?;
        Ok(Endpoint::new(url.scheme(), host, port, url.path()))
    }
}

/// Resolves a logical service name to candidate endpoints, best first.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, service: &str) -> RpcResult<Vec<Endpoint>>;
}

/// A fixed service table, for tools and tests.
#[derive(Debug, Default)]
pub struct StaticResolver {
    services: RwLock<HashMap<String, Vec<Endpoint>>>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        StaticResolver::default()
    }

    pub fn with_service(self, service: &str, endpoints: Vec<Endpoint>) -> Self {
        self.set(service, endpoints);
        self
    }

    pub fn set(&self, service: &str, endpoints: Vec<Endpoint>) {
        self.services.write().insert(service.to_string(), endpoints);
    }

    /// Build a table from `service -> [url, ...]` strings.
    pub fn from_urls<'a, I>(entries: I) -> RpcResult<StaticResolver>
    where
        I: IntoIterator<Item = (&'a str, Vec<&'a str>)>,
    {
        let resolver = StaticResolver::new();
        for (service, urls) in entries {
            let endpoints = urls
                .into_iter()
                .map(Endpoint::from_str)
                .collect::<RpcResult<Vec<Endpoint>>>()?;
            resolver.set(service, endpoints);
        }
        Ok(resolver)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, service: &str) -> RpcResult<Vec<Endpoint>> {
        Ok(self
            .services
            .read()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_url() {
        let url = "dips://ce01.example.org:9135/WorkloadManagement/JobManager";
        let ep: Endpoint = url.parse().unwrap();
        assert_eq!(ep.scheme, "dips");
        assert_eq!(ep.host, "ce01.example.org");
        assert_eq!(ep.port, 9135);
        assert_eq!(ep.path, "WorkloadManagement/JobManager");
        assert_eq!(
            ep.to_string(),
            "dips://ce01.example.org:9135/WorkloadManagement/JobManager"
        );
    }

    #[test]
    fn endpoint_without_port_is_a_configuration_error() {
        let err = "dip://host/Service".parse::<Endpoint>().unwrap_err();
        assert!(matches!(err, RpcError::Configuration(_)));
    }

    #[tokio::test]
    async fn unknown_service_resolves_empty() {
        let resolver = StaticResolver::from_urls(vec![(
            "Framework/Echo",
            vec!["dip://127.0.0.1:9135/Framework/Echo"],
        )])
        .unwrap();
        assert_eq!(resolver.resolve("Framework/Echo").await.unwrap().len(), 1);
        assert!(resolver.resolve("Nope").await.unwrap().is_empty());
    }
}
