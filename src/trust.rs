/*
 * Copyright 2020 Joyent, Inc.
 */

//! Trust roots and revocations used to verify peer chains.
//!
//! The store is process-wide and read-mostly.  Every handshake takes one
//! `Arc` snapshot and verifies against it, so a concurrent `refresh` never
//! changes the rules halfway through a verification.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_derive::{Deserialize, Serialize};

use crate::credential::{
    CertKind, Certificate, CredentialError, CredentialResult, Identity,
};

/// Proxy chains deeper than this are refused.
pub const MAX_CHAIN_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revocation {
    pub issuer: String,
    pub serial: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TrustSnapshot {
    roots: HashMap<String, Certificate>,
    revoked: HashSet<Revocation>,
}

impl TrustSnapshot {
    pub fn new() -> TrustSnapshot {
        TrustSnapshot::default()
    }

    /// Add a self-signed authority certificate as a trust anchor.
    pub fn add_root(&mut self, root: Certificate) -> CredentialResult<()> {
        let self_signed = root.issuer() == root.subject();
        if root.kind() != CertKind::Authority || !self_signed {
            return Err(CredentialError::Malformed(format!(
                "{} is not a self-signed authority",
                root.subject()
            )));
        }
        root.verify_signature(&root.verifying_key()?)?;
        self.roots.insert(root.subject().to_string(), root);
        Ok(())
    }

    pub fn with_root(mut self, root: Certificate) -> CredentialResult<Self> {
        self.add_root(root)?;
        Ok(self)
    }

    pub fn revoke(&mut self, issuer: &str, serial: u64) {
        self.revoked.insert(Revocation {
            issuer: issuer.to_string(),
            serial,
        });
    }

    pub fn is_revoked(&self, cert: &Certificate) -> bool {
        self.revoked.contains(&Revocation {
            issuer: cert.issuer().to_string(),
            serial: cert.serial(),
        })
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Load roots (a JSON array of certificates) and, optionally, a
    /// revocation list (a JSON array of `{issuer, serial}`).
    pub fn load<P: AsRef<Path>>(
        roots_path: P,
        revocations_path: Option<&Path>,
    ) -> CredentialResult<TrustSnapshot> {
        let mut snapshot = TrustSnapshot::new();
        let roots: Vec<Certificate> = read_json(roots_path.as_ref())?;
        for root in roots {
            snapshot.add_root(root)?;
        }
        if let Some(path) = revocations_path {
            let revoked: Vec<Revocation> = read_json(path)?;
            snapshot.revoked.extend(revoked);
        }
        Ok(snapshot)
    }

    /// Verify a leaf-first chain at `now` and derive the identity it proves.
    pub fn verify(
        &self,
        chain: &[Certificate],
        now: i64,
    ) -> CredentialResult<Identity> {
        let leaf = chain.first().ok_or_else(|| {
            CredentialError::ChainBroken(String::from("empty chain"))
        })?;
        if leaf.kind() == CertKind::Authority {
            return Err(CredentialError::ChainBroken(format!(
                "{} is an authority, not an identity",
                leaf.subject()
            )));
        }
        if chain.len() > MAX_CHAIN_LEN {
            return Err(CredentialError::ChainBroken(format!(
                "chain of {} certificates is too long",
                chain.len()
            )));
        }

        for (i, cert) in chain.iter().enumerate() {
            if self.is_anchor(cert) {
                // A copy of the trust root closes the chain.
                if i + 1 != chain.len() {
                    return Err(CredentialError::ChainBroken(String::from(
                        "certificates follow the trust root",
                    )));
                }
                break;
            }

            if self.is_revoked(cert) {
                return Err(CredentialError::Revoked {
                    subject: cert.subject().to_string(),
                    serial: cert.serial(),
                });
            }
            cert.check_time(now)?;

            let issuer = match chain.get(i + 1) {
                Some(next) => next,
                None => self.roots.get(cert.issuer()).ok_or_else(|| {
                    CredentialError::UntrustedIssuer(cert.issuer().to_string())
                })?,
            };
            check_link(cert, issuer)?;
        }

        Ok(Identity::from_chain(chain))
    }

    fn is_anchor(&self, cert: &Certificate) -> bool {
        self.roots
            .get(cert.subject())
            .map(|root| root == cert)
            .unwrap_or(false)
    }
}

fn check_link(
    cert: &Certificate,
    issuer: &Certificate,
) -> CredentialResult<()> {
    if cert.issuer() != issuer.subject() {
        return Err(CredentialError::ChainBroken(format!(
            "{} names issuer {} but is followed by {}",
            cert.subject(),
            cert.issuer(),
            issuer.subject()
        )));
    }
    cert.verify_signature(&issuer.verifying_key()?)?;

    match (cert.kind(), issuer.kind()) {
        (CertKind::Proxy, CertKind::EndEntity)
        | (CertKind::Proxy, CertKind::Proxy) => {
            let prefix = format!("{}/CN=", issuer.subject());
            if !cert.subject().starts_with(&prefix) {
                return Err(CredentialError::ChainBroken(format!(
                    "proxy {} does not extend {}",
                    cert.subject(),
                    issuer.subject()
                )));
            }
            if !cert.rights().is_subset_of(issuer.rights()) {
                return Err(CredentialError::Broadens(format!(
                    "proxy {} claims rights beyond its issuer",
                    cert.subject()
                )));
            }
            if cert.body.not_after > issuer.body.not_after
                || cert.body.not_before < issuer.body.not_before
            {
                return Err(CredentialError::ChainBroken(format!(
                    "proxy {} outlives its issuer",
                    cert.subject()
                )));
            }
            Ok(())
        }
        (CertKind::EndEntity, CertKind::Authority)
        | (CertKind::Authority, CertKind::Authority) => Ok(()),
        (kind, issuer_kind) => Err(CredentialError::ChainBroken(format!(
            "a {:?} certificate cannot issue a {:?} certificate",
            issuer_kind, kind
        ))),
    }
}

fn read_json<T>(path: &Path) -> CredentialResult<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw = fs::read_to_string(path).map_err(|e| {
        CredentialError::Io(format!("{}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        CredentialError::Malformed(format!("{}: {}", path.display(), e))
    })
}

/// Shared handle on the current trust snapshot.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    current: Arc<RwLock<Arc<TrustSnapshot>>>,
}

impl TrustStore {
    pub fn new(snapshot: TrustSnapshot) -> TrustStore {
        TrustStore {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Arc<TrustSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Swap in a new snapshot.  Handshakes already holding the previous one
    /// finish against it.
    pub fn refresh(&self, snapshot: TrustSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::credential::{unix_now, Authority, Restriction};

    const DAY: Duration = Duration::from_secs(86_400);

    fn setup() -> (Authority, TrustSnapshot) {
        let ca = Authority::new("/O=Grid/CN=CA", DAY);
        let trust = TrustSnapshot::new()
            .with_root(ca.certificate().clone())
            .unwrap();
        (ca, trust)
    }

    #[test]
    fn verifies_end_entity_and_proxy_chain() {
        let (ca, trust) = setup();
        let cred =
            ca.issue("/O=Grid/CN=alice", Some("user"), vec!["NormalUser"], DAY);
        let id = trust.verify(cred.chain(), unix_now()).unwrap();
        assert_eq!(id.dn.as_deref(), Some("/O=Grid/CN=alice"));

        let proxy = cred.restrict(&Restriction::lifetime(3600)).unwrap();
        let proxy2 = proxy.restrict(&Restriction::lifetime(600)).unwrap();
        let id = trust.verify(proxy2.chain(), unix_now()).unwrap();
        assert_eq!(id.dn.as_deref(), Some("/O=Grid/CN=alice"));
        assert!(id.proxy);
    }

    #[test]
    fn rejects_unknown_authority() {
        let (_, trust) = setup();
        let other = Authority::new("/O=Elsewhere/CN=CA", DAY);
        let cred = other.issue(
            "/O=Elsewhere/CN=mallory",
            None,
            Vec::<String>::new(),
            DAY,
        );
        assert!(matches!(
            trust.verify(cred.chain(), unix_now()),
            Err(CredentialError::UntrustedIssuer(_))
        ));
    }

    #[test]
    fn rejects_expired_and_revoked() {
        let (ca, mut trust) = setup();
        let now = unix_now();
        let old = ca.issue_window(
            "/CN=old",
            None,
            Vec::<String>::new(),
            now - 100,
            now - 1,
        );
        assert!(matches!(
            trust.verify(old.chain(), now),
            Err(CredentialError::Expired { .. })
        ));

        let cred = ca.issue("/CN=bob", None, Vec::<String>::new(), DAY);
        trust.revoke(ca.certificate().subject(), cred.leaf().serial());
        assert!(matches!(
            trust.verify(cred.chain(), now),
            Err(CredentialError::Revoked { .. })
        ));
    }

    #[test]
    fn rejects_forged_broader_proxy() {
        let (ca, trust) = setup();
        let cred = ca.issue("/CN=carol", Some("user"), vec!["NormalUser"], DAY);
        let proxy = cred.restrict(&Restriction::default()).unwrap();

        // Re-sign a broadened proxy with the correct issuer key.
        let mut body = proxy.leaf().body.clone();
        body.rights.properties.insert(String::from("Admin"));
        let forged = Certificate::sign(body, cred.signing_key());
        let mut chain = proxy.chain().to_vec();
        chain[0] = forged;
        assert!(matches!(
            trust.verify(&chain, unix_now()),
            Err(CredentialError::Broadens(_))
        ));
    }

    #[test]
    fn refresh_does_not_disturb_held_snapshot() {
        let (ca, trust) = setup();
        let store = TrustStore::new(trust);
        let held = store.snapshot();
        store.refresh(TrustSnapshot::new());
        let cred = ca.issue("/CN=dave", None, Vec::<String>::new(), DAY);
        assert!(held.verify(cred.chain(), unix_now()).is_ok());
        assert!(store.snapshot().verify(cred.chain(), unix_now()).is_err());
    }
}
