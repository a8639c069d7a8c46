//! Certificate-based peer identity.
//!
//! Peers are recognized by the SHA-256 of their certificate, not by
//! certificate-authority chains: every allow-listed certificate is loaded at
//! startup, hashed, and looked up again when a TLS handshake presents it.
//! The hash is computed over the base64 of the DER, which equals the PEM
//! body with armor and whitespace stripped, so a hash taken from a PEM file
//! with a shell one-liner matches what the node computes.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;

use anyhow::{bail, Context, Result};
use data_encoding::{BASE64, HEXLOWER};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PeerConfig;

/// What kind of counterpart a certificate belongs to. Decides which log
/// channels replicate and in which direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerKind {
    /// Measurement hardware bridged through the device gateway, not a
    /// replication peer.
    LabDevice,
    /// Sample-collection site: sends lab data up, receives user accounts.
    Field,
    /// Full lab node: replicates everything both ways.
    Lab,
    /// Central server: replicates everything both ways.
    Server,
    /// Present in config but not a kind this build knows. Connections from
    /// such peers are dropped.
    #[serde(untagged)]
    Other(String),
}

/// A recognized peer, as handed to the replication layer.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub kind: PeerKind,
    /// Human-readable tag for log output, derived from the cert file name.
    pub description: String,
}

impl PeerIdentity {
    /// The synthetic identity every unauthenticated connection gets when the
    /// node runs with TLS verification disabled.
    pub fn insecure() -> Self {
        PeerIdentity {
            kind: PeerKind::Lab,
            description: "insecure test peer".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    identity: PeerIdentity,
    cert: CertificateDer<'static>,
    connect: Option<String>,
}

/// Hex SHA-256 over the base64-encoded DER of a certificate.
pub fn cert_hash(der: &CertificateDer<'_>) -> String {
    use sha2::{Digest, Sha256};
    HEXLOWER.encode(&Sha256::digest(BASE64.encode(der.as_ref()).as_bytes()))
}

fn load_cert(config: &PeerConfig) -> Result<CertificateDer<'static>> {
    let path = &config.cert;
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening peer cert {}", path.display()))?,
    );
    let mut certs = rustls_pemfile::certs(&mut reader);
    let cert = match certs.next() {
        Some(cert) => {
            cert.with_context(|| format!("parsing peer cert {}", path.display()))?
        }
        None => bail!("no certificate in {}", path.display()),
    };
    Ok(cert)
}

/// The allow-list of peers this node will talk to.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    by_hash: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn load(peers: &[PeerConfig]) -> Result<Self> {
        let mut by_hash = HashMap::new();
        for config in peers {
            let cert = load_cert(config)?;
            let hash = cert_hash(&cert);
            let description = config
                .cert
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| hash.clone());
            info!(peer = %description, kind = ?config.kind, %hash, "registered peer");
            by_hash.insert(
                hash,
                PeerEntry {
                    identity: PeerIdentity {
                        kind: config.kind.clone(),
                        description,
                    },
                    cert,
                    connect: config.connect.clone(),
                },
            );
        }
        Ok(PeerRegistry { by_hash })
    }

    /// Identifies the presented certificate, or `None` if it is not on the
    /// allow-list.
    pub fn lookup(&self, der: &CertificateDer<'_>) -> Option<PeerIdentity> {
        self.by_hash
            .get(&cert_hash(der))
            .map(|entry| entry.identity.clone())
    }

    /// Every allow-listed certificate, for the TLS client verifier roots.
    pub fn certs(&self) -> Vec<CertificateDer<'static>> {
        self.by_hash
            .values()
            .map(|entry| entry.cert.clone())
            .collect()
    }

    /// Peers this node dials: identity, address and the certificate to pin.
    pub fn outbound(&self) -> Vec<(PeerIdentity, String, CertificateDer<'static>)> {
        self.by_hash
            .values()
            .filter_map(|entry| {
                let addr = entry.connect.clone()?;
                Some((entry.identity.clone(), addr, entry.cert.clone()))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_kebab_case_and_keeps_unknowns() {
        let kind: PeerKind = serde_json::from_str(r#""lab-device""#).unwrap();
        assert_eq!(kind, PeerKind::LabDevice);
        let kind: PeerKind = serde_json::from_str(r#""field""#).unwrap();
        assert_eq!(kind, PeerKind::Field);
        let kind: PeerKind = serde_json::from_str(r#""submarine""#).unwrap();
        assert_eq!(kind, PeerKind::Other("submarine".to_string()));
    }

    #[test]
    fn hash_matches_stripped_pem_body() {
        use sha2::{Digest, Sha256};

        let der = CertificateDer::from(vec![0x30, 0x82, 0x01, 0x0a, 0xff]);
        let pem_body = BASE64.encode(der.as_ref());
        let expected = HEXLOWER.encode(&Sha256::digest(pem_body.as_bytes()));
        assert_eq!(cert_hash(&der), expected);
    }

    #[test]
    fn registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["peer-a".to_string()]).unwrap();
        let path = dir.path().join("peer-a.pem");
        std::fs::write(&path, cert.cert.pem()).unwrap();

        let registry = PeerRegistry::load(&[PeerConfig {
            cert: path,
            kind: PeerKind::Field,
            connect: Some("peer-a:9077".to_string()),
        }])
        .unwrap();

        let identity = registry.lookup(cert.cert.der()).unwrap();
        assert_eq!(identity.kind, PeerKind::Field);
        assert_eq!(identity.description, "peer-a");

        let other = rcgen::generate_simple_self_signed(vec!["peer-b".to_string()]).unwrap();
        assert!(registry.lookup(other.cert.der()).is_none());

        let outbound = registry.outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].1, "peer-a:9077");
    }
}
