/*
 * Copyright 2020 Joyent, Inc.
 */

//! Certificates, credentials and the identities derived from them.
//!
//! A credential is a certificate chain, leaf first, together with the private
//! key for the leaf.  Chains are anchored at an authority certificate held in
//! a trust store (see `trust`).  Three certificate kinds exist:
//!
//! * `authority`  - may issue end entity and authority certificates
//! * `end_entity` - a long-lived user or host identity
//! * `proxy`      - a short-lived certificate issued by an end entity or by
//!                  another proxy, whose rights are a subset of its issuer's
//!
//! A proxy subject always extends its issuer subject with `/CN=<serial>`, so
//! the identity acting through any depth of proxies is the subject of the
//! first non-proxy certificate in the chain.

use std::collections::BTreeSet;
use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Proxies are backdated by this much to tolerate clock skew between peers.
const PROXY_BACKDATE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CredentialError {
    #[error("no credential available: {0}")]
    Missing(String),
    #[error("unable to read credential material: {0}")]
    Io(String),
    #[error("malformed certificate: {0}")]
    Malformed(String),
    #[error("certificate {subject} expired at {at}")]
    Expired { subject: String, at: DateTime<Utc> },
    #[error("certificate {0} is not yet valid")]
    NotYetValid(String),
    #[error("certificate {subject} (serial {serial}) is revoked")]
    Revoked { subject: String, serial: u64 },
    #[error("issuer {0} is not trusted")]
    UntrustedIssuer(String),
    #[error("bad signature on {0}")]
    BadSignature(String),
    #[error("broken chain: {0}")]
    ChainBroken(String),
    #[error("restriction would broaden rights: {0}")]
    Broadens(String),
    #[error("private key does not match certificate {0}")]
    KeyMismatch(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

fn to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertKind {
    Authority,
    EndEntity,
    Proxy,
}

/// The rights a certificate conveys.  A proxy's rights must be a subset of
/// its issuer's: same group, fewer or equal properties, and never unlimited
/// when the issuer is limited.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rights {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub properties: BTreeSet<String>,
    #[serde(default)]
    pub limited: bool,
}

impl Rights {
    pub fn is_subset_of(&self, other: &Rights) -> bool {
        self.group == other.group
            && self.properties.is_subset(&other.properties)
            && (self.limited || !other.limited)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub serial: u64,
    pub subject: String,
    pub issuer: String,
    pub public_key: String,
    pub not_before: i64,
    pub not_after: i64,
    pub kind: CertKind,
    pub rights: Rights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub body: CertificateBody,
    pub signature: String,
}

impl Certificate {
    pub fn sign(body: CertificateBody, key: &SigningKey) -> Certificate {
        // Serializing a plain struct cannot fail.
        let tbs = serde_json::to_vec(&body).unwrap_or_default();
        let signature = key.sign(&tbs);
        Certificate {
            body,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    pub fn subject(&self) -> &str {
        &self.body.subject
    }

    pub fn issuer(&self) -> &str {
        &self.body.issuer
    }

    pub fn serial(&self) -> u64 {
        self.body.serial
    }

    pub fn kind(&self) -> CertKind {
        self.body.kind
    }

    pub fn rights(&self) -> &Rights {
        &self.body.rights
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        to_utc(self.body.not_after)
    }

    pub fn verifying_key(&self) -> CredentialResult<VerifyingKey> {
        decode_public_key(&self.body.public_key).map_err(|e| {
            CredentialError::Malformed(format!("{}: {}", self.subject(), e))
        })
    }

    pub fn verify_signature(
        &self,
        issuer_key: &VerifyingKey,
    ) -> CredentialResult<()> {
        let bad = || CredentialError::BadSignature(self.subject().to_string());
        let raw = hex::decode(&self.signature).map_err(|_| bad())?;
        let signature = Signature::from_slice(&raw).map_err(|_| bad())?;
        let tbs = serde_json::to_vec(&self.body).map_err(|_| bad())?;
        issuer_key.verify(&tbs, &signature).map_err(|_| bad())
    }

    /// Check the validity window against `now` (unix seconds).
    pub fn check_time(&self, now: i64) -> CredentialResult<()> {
        if now < self.body.not_before {
            let subject = self.subject().to_string();
            return Err(CredentialError::NotYetValid(subject));
        }
        if now >= self.body.not_after {
            return Err(CredentialError::Expired {
                subject: self.subject().to_string(),
                at: self.not_after(),
            });
        }
        Ok(())
    }
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

pub fn decode_public_key(s: &str) -> Result<VerifyingKey, String> {
    let raw = hex::decode(s).map_err(|e| e.to_string())?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| String::from("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| e.to_string())
}

/// The authenticated view of a peer, fixed once the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub dn: Option<String>,
    pub group: Option<String>,
    pub properties: BTreeSet<String>,
    pub limited: bool,
    pub proxy: bool,
    pub expiry: Option<i64>,
}

impl Identity {
    pub fn anonymous() -> Identity {
        Identity::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.dn.is_some()
    }

    pub fn has_property(&self, property: &str) -> bool {
        self.properties.contains(property)
    }

    /// Derive the identity of a chain.  The chain is assumed verified.
    pub fn from_chain(chain: &[Certificate]) -> Identity {
        let leaf = match chain.first() {
            Some(leaf) => leaf,
            None => return Identity::anonymous(),
        };
        let dn = chain
            .iter()
            .find(|c| c.kind() != CertKind::Proxy)
            .map(|c| c.subject().to_string());
        Identity {
            dn,
            group: leaf.rights().group.clone(),
            properties: leaf.rights().properties.clone(),
            limited: leaf.rights().limited,
            proxy: leaf.kind() == CertKind::Proxy,
            expiry: chain.iter().map(|c| c.body.not_after).min(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dn {
            Some(dn) => write!(
                f,
                "{} (group {})",
                dn,
                self.group.as_deref().unwrap_or("none")
            ),
            None => write!(f, "anonymous"),
        }
    }
}

/// A request to narrow a credential.  Absent fields keep the parent's value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Restriction {
    #[serde(default)]
    pub properties: Option<BTreeSet<String>>,
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
    #[serde(default)]
    pub limited: bool,
}

impl Restriction {
    pub fn lifetime(secs: u64) -> Restriction {
        Restriction {
            lifetime_secs: Some(secs),
            ..Default::default()
        }
    }

    pub fn with_properties<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = Some(props.into_iter().map(Into::into).collect());
        self
    }

    pub fn limited(mut self) -> Self {
        self.limited = true;
        self
    }
}

#[derive(Clone)]
pub struct Credential {
    chain: Vec<Certificate>,
    key: SigningKey,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.leaf().subject())
            .field("proxy", &self.is_proxy())
            .field("expiry", &to_utc(self.expiry()))
            .finish()
    }
}

impl Credential {
    /// Pair a chain with its leaf key.
    pub fn new(
        chain: Vec<Certificate>,
        key: SigningKey,
    ) -> CredentialResult<Credential> {
        let leaf = chain.first().ok_or_else(|| {
            CredentialError::Missing(String::from("empty certificate chain"))
        })?;
        if leaf.verifying_key()? != key.verifying_key() {
            let subject = leaf.subject().to_string();
            return Err(CredentialError::KeyMismatch(subject));
        }
        Ok(Credential { chain, key })
    }

    /// Load this process's own certificate chain and key.  Fails when the
    /// material is absent or already expired.
    pub fn load_local<P: AsRef<Path>, K: AsRef<Path>>(
        cert_path: P,
        key_path: K,
    ) -> CredentialResult<Credential> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        if !cert_path.exists() || !key_path.exists() {
            return Err(CredentialError::Missing(format!(
                "{} / {} not found",
                cert_path.display(),
                key_path.display()
            )));
        }

        let io = |e: std::io::Error| CredentialError::Io(e.to_string());
        let chain_json = fs::read_to_string(cert_path).map_err(io)?;
        let chain: Vec<Certificate> = serde_json::from_str(&chain_json)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let key_hex = fs::read_to_string(key_path).map_err(io)?;
        let key = decode_signing_key(key_hex.trim())?;

        let credential = Credential::new(chain, key)?;
        credential
            .ensure_valid(unix_now())
            .map_err(|e| CredentialError::Missing(e.to_string()))?;
        Ok(credential)
    }

    pub fn save<P: AsRef<Path>, K: AsRef<Path>>(
        &self,
        cert_path: P,
        key_path: K,
    ) -> CredentialResult<()> {
        let chain_json = serde_json::to_string_pretty(&self.chain)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let io = |e: std::io::Error| CredentialError::Io(e.to_string());
        fs::write(cert_path, chain_json).map_err(io)?;
        fs::write(key_path, hex::encode(self.key.to_bytes())).map_err(io)
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn leaf(&self) -> &Certificate {
        // `new` guarantees a non-empty chain.
        &self.chain[0]
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn is_proxy(&self) -> bool {
        self.leaf().kind() == CertKind::Proxy
    }

    pub fn rights(&self) -> &Rights {
        self.leaf().rights()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_chain(&self.chain)
    }

    /// The earliest expiry along the chain, in unix seconds.
    pub fn expiry(&self) -> i64 {
        self.chain
            .iter()
            .map(|c| c.body.not_after)
            .min()
            .unwrap_or(0)
    }

    pub fn ensure_valid(&self, now: i64) -> CredentialResult<()> {
        for cert in &self.chain {
            cert.check_time(now)?;
        }
        Ok(())
    }

    /// Produce a proxy of this credential with a fresh key, with rights no
    /// broader than this credential's.
    pub fn restrict(
        &self,
        restriction: &Restriction,
    ) -> CredentialResult<Credential> {
        let key = SigningKey::generate(&mut OsRng);
        let chain =
            self.issue_proxy(&key.verifying_key(), restriction, unix_now())?;
        Credential::new(chain, key)
    }

    /// Sign a proxy certificate for `public_key` and return the full chain
    /// for it.  The proxy never outlives this credential and never carries
    /// rights this credential lacks.
    pub fn issue_proxy(
        &self,
        public_key: &VerifyingKey,
        restriction: &Restriction,
        now: i64,
    ) -> CredentialResult<Vec<Certificate>> {
        self.ensure_valid(now)?;
        let parent = self.leaf();
        if parent.kind() == CertKind::Authority {
            return Err(CredentialError::Broadens(String::from(
                "authorities do not issue proxies",
            )));
        }

        let rights = narrow_rights(parent.rights(), restriction)?;

        let mut not_after = self.expiry();
        if let Some(secs) = restriction.lifetime_secs {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            not_after = not_after.min(now.saturating_add(secs));
        }
        let not_before = parent
            .body
            .not_before
            .max(now - PROXY_BACKDATE_SECS)
            .min(not_after);

        let serial = rand::random::<u64>();
        let body = CertificateBody {
            serial,
            subject: format!("{}/CN={}", parent.subject(), serial),
            issuer: parent.subject().to_string(),
            public_key: encode_public_key(public_key),
            not_before,
            not_after,
            kind: CertKind::Proxy,
            rights,
        };

        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Certificate::sign(body, &self.key));
        chain.extend(self.chain.iter().cloned());
        Ok(chain)
    }
}

fn narrow_rights(
    parent: &Rights,
    restriction: &Restriction,
) -> CredentialResult<Rights> {
    let properties = match &restriction.properties {
        Some(requested) => {
            let extra: Vec<&String> =
                requested.difference(&parent.properties).collect();
            if !extra.is_empty() {
                return Err(CredentialError::Broadens(format!(
                    "properties {:?} are not held by the issuer",
                    extra
                )));
            }
            requested.clone()
        }
        None => parent.properties.clone(),
    };

    Ok(Rights {
        group: parent.group.clone(),
        properties,
        limited: parent.limited || restriction.limited,
    })
}

pub fn decode_signing_key(s: &str) -> CredentialResult<SigningKey> {
    let raw =
        hex::decode(s).map_err(|e| CredentialError::Malformed(e.to_string()))?;
    let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
        CredentialError::Malformed(String::from("private key must be 32 bytes"))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// A certificate authority able to issue end entity credentials.  Used by
/// tooling and tests; production roots are only ever loaded as certificates.
#[derive(Clone)]
pub struct Authority {
    cert: Certificate,
    key: SigningKey,
}

impl Authority {
    pub fn new(subject: &str, lifetime: Duration) -> Authority {
        let key = SigningKey::generate(&mut OsRng);
        let now = unix_now();
        let body = CertificateBody {
            serial: rand::random::<u64>(),
            subject: subject.to_string(),
            issuer: subject.to_string(),
            public_key: encode_public_key(&key.verifying_key()),
            not_before: now - PROXY_BACKDATE_SECS,
            not_after: now + lifetime.as_secs() as i64,
            kind: CertKind::Authority,
            rights: Rights::default(),
        };
        let cert = Certificate::sign(body, &key);
        Authority { cert, key }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    /// Issue an end entity credential valid from now for `lifetime`.
    pub fn issue<I, S>(
        &self,
        subject: &str,
        group: Option<&str>,
        properties: I,
        lifetime: Duration,
    ) -> Credential
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = unix_now();
        self.issue_window(
            subject,
            group,
            properties,
            now - PROXY_BACKDATE_SECS,
            now + lifetime.as_secs() as i64,
        )
    }

    /// Issue an end entity credential with an explicit validity window.
    pub fn issue_window<I, S>(
        &self,
        subject: &str,
        group: Option<&str>,
        properties: I,
        not_before: i64,
        not_after: i64,
    ) -> Credential
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = SigningKey::generate(&mut OsRng);
        let body = CertificateBody {
            serial: rand::random::<u64>(),
            subject: subject.to_string(),
            issuer: self.cert.subject().to_string(),
            public_key: encode_public_key(&key.verifying_key()),
            not_before,
            not_after: not_after.min(self.cert.body.not_after),
            kind: CertKind::EndEntity,
            rights: Rights {
                group: group.map(String::from),
                properties: properties.into_iter().map(Into::into).collect(),
                limited: false,
            },
        };
        let cert = Certificate::sign(body, &self.key);
        Credential {
            chain: vec![cert],
            key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};

    const DAY: Duration = Duration::from_secs(86_400);

    fn user() -> Credential {
        let ca = Authority::new("/O=Grid/CN=Test CA", DAY);
        ca.issue(
            "/O=Grid/CN=alice",
            Some("user"),
            vec!["NormalUser", "JobSharing"],
            DAY,
        )
    }

    #[test]
    fn proxy_extends_subject_and_keeps_identity() {
        let cred = user();
        let proxy = cred.restrict(&Restriction::lifetime(600)).unwrap();
        assert!(proxy.is_proxy());
        assert!(proxy.leaf().subject().starts_with("/O=Grid/CN=alice/CN="));
        let id = proxy.identity();
        assert_eq!(id.dn.as_deref(), Some("/O=Grid/CN=alice"));
        assert_eq!(id.group.as_deref(), Some("user"));
        assert!(id.proxy);
    }

    #[test]
    fn proxy_lifetime_is_capped_by_parent() {
        let cred = user();
        let proxy = cred
            .restrict(&Restriction::lifetime(10 * 86_400))
            .unwrap();
        assert!(proxy.expiry() <= cred.expiry());

        let short = cred.restrict(&Restriction::lifetime(60)).unwrap();
        assert!(short.expiry() <= unix_now() + 60);
    }

    #[test]
    fn restriction_cannot_add_properties() {
        let cred = user();
        let err = cred
            .restrict(&Restriction::default().with_properties(vec!["Admin"]))
            .unwrap_err();
        match err {
            CredentialError::Broadens(_) => (),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn limited_proxy_stays_limited() {
        let cred = user();
        let limited = cred.restrict(&Restriction::default().limited()).unwrap();
        let again = limited.restrict(&Restriction::default()).unwrap();
        assert!(again.rights().limited);
    }

    #[test]
    fn expired_credential_cannot_issue() {
        let ca = Authority::new("/CN=CA", DAY);
        let now = unix_now();
        let old = ca.issue_window(
            "/CN=old",
            None,
            Vec::<String>::new(),
            now - 100,
            now - 10,
        );
        let err = old.restrict(&Restriction::default()).unwrap_err();
        match err {
            CredentialError::Expired { .. } => (),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn tampered_certificate_fails_signature() {
        let ca = Authority::new("/CN=CA", DAY);
        let cred = ca.issue("/CN=bob", Some("user"), Vec::<String>::new(), DAY);
        let mut cert = cred.leaf().clone();
        cert.body.rights.group = Some(String::from("admin"));
        let ca_key = ca.certificate().verifying_key().unwrap();
        assert!(cred.leaf().verify_signature(&ca_key).is_ok());
        assert!(cert.verify_signature(&ca_key).is_err());
    }

    #[test]
    fn local_material_round_trips_through_disk() {
        let dir = std::env::temp_dir()
            .join(format!("grid-rpc-cred-{}", rand::random::<u32>()));
        fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.json");
        let key_path = dir.join("key.hex");

        assert!(matches!(
            Credential::load_local(&cert_path, &key_path),
            Err(CredentialError::Missing(_))
        ));

        let cred = user();
        cred.save(&cert_path, &key_path).unwrap();
        let loaded = Credential::load_local(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.chain(), cred.chain());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[derive(Debug, Clone)]
    struct Props(BTreeSet<String>);

    impl Arbitrary for Props {
        fn arbitrary(g: &mut Gen) -> Self {
            let pool = ["NormalUser", "JobSharing", "Admin", "Pilot", "Ops"];
            let n = usize::arbitrary(g) % pool.len();
            Props(
                (0..n)
                    .map(|_| g.choose(&pool).unwrap().to_string())
                    .collect(),
            )
        }
    }

    fn restrict_never_broadens(
        requested: Props,
        limited: bool,
        lifetime: u32,
    ) -> bool {
        let cred = user();
        let restriction = Restriction {
            properties: Some(requested.0),
            lifetime_secs: Some(u64::from(lifetime)),
            limited,
        };
        match cred.restrict(&restriction) {
            Ok(proxy) => {
                proxy.rights().is_subset_of(cred.rights())
                    && proxy.expiry() <= cred.expiry()
                    && proxy.expiry() <= unix_now() + i64::from(lifetime)
            }
            Err(CredentialError::Broadens(_)) => {
                let wanted = restriction.properties.unwrap_or_default();
                !wanted.is_subset(&cred.rights().properties)
            }
            Err(_) => false,
        }
    }

    #[test]
    fn restrict_never_broadens_rights() {
        quickcheck(restrict_never_broadens as fn(Props, bool, u32) -> bool);
    }
}
