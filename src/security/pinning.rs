//! Public key pinning.
//!
//! Validates served certificate chains against expected SPKI (Subject
//! Public Key Info) SHA-256 hashes. Pins are checked after the TLS
//! handshake and before any request body byte is written; a mismatch
//! fails the connection with `SslPinnedKeyNotInCertChain`.

use crate::base::neterror::NetError;
use dashmap::DashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// SHA-256 hash of a certificate's SPKI (Subject Public Key Info).
pub type SpkiHash = [u8; 32];

/// A set of pins for a domain.
#[derive(Debug, Clone)]
pub struct PinSet {
    /// The domain this pin set applies to.
    pub domain: String,
    /// Whether to apply to subdomains.
    pub include_subdomains: bool,
    /// List of allowed SPKI SHA-256 hashes.
    pub pins: Vec<SpkiHash>,
    /// Optional expiration time (fail-open after expiry).
    pub expires: Option<OffsetDateTime>,
}

impl PinSet {
    /// Create a new pin set for a domain.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            include_subdomains: false,
            pins: Vec::new(),
            expires: None,
        }
    }

    /// Add a pin (base64-encoded SHA-256 hash).
    pub fn add_pin_base64(&mut self, pin_base64: &str) -> Result<(), NetError> {
        let decoded =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, pin_base64)
                .map_err(|_| NetError::InvalidArgument("pin is not valid base64".into()))?;

        if decoded.len() != 32 {
            return Err(NetError::InvalidArgument(
                "pin must be a SHA-256 digest (32 bytes)".into(),
            ));
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&decoded);
        self.pins.push(hash);
        Ok(())
    }

    /// Add a pin from raw bytes.
    pub fn add_pin(&mut self, hash: SpkiHash) {
        self.pins.push(hash);
    }

    /// Set include_subdomains flag.
    pub fn include_subdomains(mut self, include: bool) -> Self {
        self.include_subdomains = include;
        self
    }

    /// Set expiration time.
    pub fn expires_at(mut self, time: OffsetDateTime) -> Self {
        self.expires = Some(time);
        self
    }

    /// Check if pin set is expired.
    pub fn is_expired(&self) -> bool {
        if let Some(exp) = self.expires {
            OffsetDateTime::now_utc() > exp
        } else {
            false
        }
    }

    /// Check if any of the provided hashes match the pins.
    pub fn matches(&self, cert_hashes: &[SpkiHash]) -> bool {
        cert_hashes.iter().any(|hash| self.pins.contains(hash))
    }
}

/// Thread-safe store for certificate pins.
#[derive(Clone)]
pub struct PinStore {
    pins: Arc<DashMap<String, PinSet>>,
    /// When set, chains anchored in a locally installed trust root skip
    /// the pin check (the platform default).
    bypass_for_local_trust_anchors: bool,
}

impl Default for PinStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PinStore {
    /// Create a new empty pin store.
    pub fn new() -> Self {
        Self {
            pins: Arc::new(DashMap::new()),
            bypass_for_local_trust_anchors: true,
        }
    }

    pub fn set_bypass_for_local_trust_anchors(&mut self, bypass: bool) {
        self.bypass_for_local_trust_anchors = bypass;
    }

    /// Add or replace a pin set.
    pub fn add(&self, pin_set: PinSet) {
        self.pins.insert(pin_set.domain.to_lowercase(), pin_set);
    }

    /// Remove pins for a domain.
    pub fn remove(&self, domain: &str) {
        self.pins.remove(&domain.to_lowercase());
    }

    /// Check if the connection to `host` with given certificate hashes is
    /// allowed. `chain_is_locally_anchored` reports whether the verified
    /// chain terminates in a locally installed trust anchor.
    ///
    /// Returns Ok(()) if pins match, no pins exist for this host, or the
    /// local-anchor bypass applies.
    pub fn check(
        &self,
        host: &str,
        cert_hashes: &[SpkiHash],
        chain_is_locally_anchored: bool,
    ) -> Result<(), NetError> {
        if chain_is_locally_anchored && self.bypass_for_local_trust_anchors {
            return Ok(());
        }

        let host_lower = host.to_lowercase();

        // Check for exact domain match
        if let Some(pin_set) = self.pins.get(&host_lower) {
            return verify_pins(&pin_set, cert_hashes);
        }

        // Check parent domains for subdomain pins
        let parts: Vec<&str> = host_lower.split('.').collect();
        for i in 1..parts.len() {
            let parent = parts[i..].join(".");
            if let Some(pin_set) = self.pins.get(&parent) {
                if pin_set.include_subdomains {
                    return verify_pins(&pin_set, cert_hashes);
                }
            }
        }

        // No pins configured for this host - allow
        Ok(())
    }

    /// True if any (possibly inherited) pin set covers `host`.
    pub fn has_pins_for(&self, host: &str) -> bool {
        let host_lower = host.to_lowercase();
        if self.pins.contains_key(&host_lower) {
            return true;
        }
        let parts: Vec<&str> = host_lower.split('.').collect();
        for i in 1..parts.len() {
            let parent = parts[i..].join(".");
            if let Some(pin_set) = self.pins.get(&parent) {
                if pin_set.include_subdomains {
                    return true;
                }
            }
        }
        false
    }

    /// Get the number of pinned domains.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Check if store is empty.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

fn verify_pins(pin_set: &PinSet, cert_hashes: &[SpkiHash]) -> Result<(), NetError> {
    // Expired pins fail-open
    if pin_set.is_expired() {
        return Ok(());
    }

    if pin_set.matches(cert_hashes) {
        Ok(())
    } else {
        Err(NetError::SslPinnedKeyNotInCertChain)
    }
}

/// Compute SPKI hash from a DER-encoded certificate.
pub fn spki_hash(cert_der: &[u8]) -> Result<SpkiHash, NetError> {
    use boring::x509::X509;

    let cert = X509::from_der(cert_der).map_err(|_| NetError::SslProtocolError)?;
    spki_hash_of(&cert)
}

/// Compute the SPKI SHA-256 of a parsed certificate.
pub fn spki_hash_of(cert: &boring::x509::X509Ref) -> Result<SpkiHash, NetError> {
    use boring::hash::{hash, MessageDigest};

    let pubkey = cert.public_key().map_err(|_| NetError::SslProtocolError)?;
    let spki_der = pubkey
        .public_key_to_der()
        .map_err(|_| NetError::SslProtocolError)?;

    let digest = hash(MessageDigest::sha256(), &spki_der).map_err(|_| NetError::SslProtocolError)?;

    let mut result = [0u8; 32];
    result.copy_from_slice(&digest);
    Ok(result)
}
