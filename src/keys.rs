//! Authority signing keys, as consumed by signature verification.
//!
//! Acquiring keys (fetching and checking key certificates) is up to the
//! caller, who hands them to the parser through a [`KeyStore`].

use std::collections::BTreeMap;

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::Fingerprint;

/// A public key an authority signs documents with
pub trait SigningKey {
    /// SHA-1 digest of the key, as listed on `directory-signature` lines
    fn key_digest(&self) -> Fingerprint;

    /// Check `signature` over an already computed document digest.
    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool;
}

/// Lookup of authority signing keys
pub trait KeyStore {
    fn signing_key(&self, identity: &Fingerprint) -> Option<&dyn SigningKey>;

    /// Number of authorities a consensus needs a majority of
    fn authority_count(&self) -> usize;
}

/// An RSA signing key, as used by all current directory authorities.
///
/// Signatures are PKCS#1 v1.5 padded digests without a DigestInfo prefix.
#[derive(Debug, Clone)]
pub struct RsaSigningKey {
    key: RsaPublicKey,
    digest: Fingerprint,
}

impl RsaSigningKey {
    pub fn new(key: RsaPublicKey) -> Result<Self, DocumentParseError> {
        let der = key.to_pkcs1_der().context("signing key")?;
        let digest = Fingerprint::from_u8(&Sha1::digest(der.as_bytes()))
            .context("signing key digest")?;
        Ok(RsaSigningKey { key, digest })
    }

    /// From a `-----BEGIN RSA PUBLIC KEY-----` block
    pub fn from_pem(pem: &str) -> Result<Self, DocumentParseError> {
        Self::new(RsaPublicKey::from_pkcs1_pem(pem).context("signing key")?)
    }

    /// From the DER bytes of an `RSA PUBLIC KEY` object
    pub fn from_der(der: &[u8]) -> Result<Self, DocumentParseError> {
        Self::new(RsaPublicKey::from_pkcs1_der(der).context("signing key")?)
    }
}

impl SigningKey for RsaSigningKey {
    fn key_digest(&self) -> Fingerprint {
        self.digest
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
        self.key
            .verify(Pkcs1v15Sign::new_unprefixed(), digest, signature)
            .is_ok()
    }
}

/// In-memory [`KeyStore`] over RSA keys, indexed by authority identity
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: BTreeMap<Fingerprint, RsaSigningKey>,
    authority_count: Option<usize>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: Fingerprint, key: RsaSigningKey) {
        self.keys.insert(identity, key);
    }

    /// Override the number of configured authorities. By default it is
    /// the number of keys in the ring.
    pub fn with_authority_count(mut self, count: usize) -> Self {
        self.authority_count = Some(count);
        self
    }
}

impl KeyStore for KeyRing {
    fn signing_key(&self, identity: &Fingerprint) -> Option<&dyn SigningKey> {
        self.keys.get(identity).map(|k| k as &dyn SigningKey)
    }

    fn authority_count(&self) -> usize {
        self.authority_count.unwrap_or(self.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rsa::pkcs1::LineEnding;
    use rsa::RsaPrivateKey;
    use sha2::Sha256;

    #[test]
    fn verifies_unprefixed_pkcs1_signatures() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        let pem = public.to_pkcs1_pem(LineEnding::LF).unwrap();
        let key = RsaSigningKey::from_pem(&pem).unwrap();

        let der = public.to_pkcs1_der().unwrap();
        assert_eq!(
            key.key_digest().as_bytes(),
            Sha1::digest(der.as_bytes()).as_slice()
        );

        let digest = Sha256::digest(b"network-status-version 3\ndirectory-signature ");
        let signature = private
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
            .unwrap();
        assert!(key.verify(&digest, &signature));
        assert!(!key.verify(&Sha256::digest(b"something else"), &signature));
        assert!(!key.verify(&digest, b"garbage"));
    }

    #[test]
    fn key_ring_counts_authorities() {
        let ring = KeyRing::new();
        assert_eq!(ring.authority_count(), 0);
        let ring = ring.with_authority_count(9);
        assert_eq!(ring.authority_count(), 9);
        assert!(ring
            .signing_key(&Fingerprint::from_u8(&[0; 20]).unwrap())
            .is_none());
    }

    #[test]
    fn rejects_garbage_keys() {
        assert!(RsaSigningKey::from_pem("not a key").is_err());
        assert!(RsaSigningKey::from_der(&[1, 2, 3]).is_err());
    }
}
