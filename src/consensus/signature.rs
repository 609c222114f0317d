//! Authority signatures and their verification

use std::collections::BTreeSet;

use derive_builder::Builder;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use strum::{EnumString, IntoStaticStr};
use tracing::{debug, warn};

use crate::error::{DocumentParseError, ErrorContext, SignatureFailure};
use crate::keys::KeyStore;
use crate::meta::{Fingerprint, Item};

/// Digest algorithm named on a `directory-signature` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

/// How many of the listed signatures must verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePolicy {
    /// More than half of the authorities known to the key store
    #[default]
    Majority,
    /// Every signature with a known algorithm
    All,
}

/// One `directory-signature` item
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(build_fn(error = "DocumentParseError"))]
pub struct DocumentSignature {
    /// Algorithm name as listed; "sha1" when omitted
    pub algorithm: String,
    pub identity: Fingerprint,
    pub signing_key_digest: Fingerprint,
    pub signature: Vec<u8>,
}

impl DocumentSignature {
    /// `None` for algorithms this crate does not know, which are skipped
    /// during verification
    pub fn digest_algorithm(&self) -> Option<DigestAlgorithm> {
        self.algorithm.parse().ok()
    }
}

/// `directory-signature [Algorithm] identity signing-key-digest` + object
pub(crate) fn parse_signature(item: &Item) -> Result<DocumentSignature, DocumentParseError> {
    let mut builder = DocumentSignatureBuilder::default();
    let args = item.split_arguments();
    let (algorithm, identity, key_digest) = match args[..] {
        [identity, key_digest] => ("sha1", identity, key_digest),
        [algorithm, identity, key_digest, ..] => (algorithm, identity, key_digest),
        _ => return Err(DocumentParseError::args_missing(&item.keyword)),
    };
    builder
        .algorithm(algorithm.to_string())
        .identity(Fingerprint::from_str_hex(identity).context("signature identity")?)
        .signing_key_digest(Fingerprint::from_str_hex(key_digest).context("signing key digest")?);
    if let Some(object) = item.object.as_ref().filter(|o| o.label == "SIGNATURE") {
        builder.signature(object.data.clone());
    }
    builder.build()
}

/// Digests of the signed portion of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPortionDigests {
    pub sha1: Vec<u8>,
    pub sha256: Vec<u8>,
}

impl SignedPortionDigests {
    fn get(&self, algorithm: DigestAlgorithm) -> &[u8] {
        match algorithm {
            DigestAlgorithm::Sha1 => &self.sha1,
            DigestAlgorithm::Sha256 => &self.sha256,
        }
    }
}

/// Incrementally hashes the signed portion while the document streams by.
///
/// The signed portion runs from `network-status-version` through the
/// space after the first `directory-signature` keyword.
pub(crate) struct SignedDigest {
    sha1: Sha1,
    sha256: Sha256,
    started: bool,
    finished: Option<SignedPortionDigests>,
}

impl SignedDigest {
    pub(crate) fn new() -> Self {
        SignedDigest {
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            started: false,
            finished: None,
        }
    }

    /// Feed the raw bytes of the next item.
    pub(crate) fn update(&mut self, item: &Item) {
        // Leading annotations are not part of the document proper
        if self.finished.is_some() || (!self.started && item.is_annotation()) {
            return;
        }
        self.started = true;
        let raw = item.raw();
        if item.keyword == "directory-signature" {
            let keyword_end = raw
                .windows(b"directory-signature".len())
                .position(|w| w == b"directory-signature")
                .map_or(0, |pos| pos + b"directory-signature".len());
            let end = (keyword_end + 1).min(raw.len());
            self.sha1.update(&raw[..end]);
            self.sha256.update(&raw[..end]);
            self.finish();
        } else {
            self.sha1.update(raw);
            self.sha256.update(raw);
        }
    }

    fn finish(&mut self) {
        let sha1 = std::mem::replace(&mut self.sha1, Sha1::new());
        let sha256 = std::mem::replace(&mut self.sha256, Sha256::new());
        self.finished = Some(SignedPortionDigests {
            sha1: sha1.finalize().to_vec(),
            sha256: sha256.finalize().to_vec(),
        });
    }

    pub(crate) fn digests(&self) -> Option<&SignedPortionDigests> {
        self.finished.as_ref()
    }
}

/// Result of checking the footer signatures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureReport {
    /// Authorities with at least one verified signature
    pub verified: BTreeSet<Fingerprint>,
    pub failures: Vec<SignatureFailure>,
    /// Number of distinct authorities that had to verify
    pub required: usize,
}

/// Check every signature against the key store and apply the policy.
pub(crate) fn verify_signatures(
    signatures: &[DocumentSignature],
    digests: &SignedPortionDigests,
    key_store: &dyn KeyStore,
    policy: SignaturePolicy,
) -> Result<SignatureReport, DocumentParseError> {
    let required = key_store.authority_count() / 2 + 1;
    let mut report = SignatureReport {
        verified: BTreeSet::new(),
        failures: Vec::new(),
        required,
    };

    for signature in signatures {
        let algorithm = match signature.digest_algorithm() {
            Some(algorithm) => algorithm,
            None => {
                debug!(algorithm = %signature.algorithm, "skipping signature with unknown algorithm");
                continue;
            }
        };
        let outcome = match key_store.signing_key(&signature.identity) {
            None => Err("no signing key known for this authority"),
            Some(key) if key.key_digest() != signature.signing_key_digest => {
                Err("signing key digest does not match the known key")
            }
            Some(key) if !key.verify(digests.get(algorithm), &signature.signature) => {
                Err("signature does not match the document digest")
            }
            Some(_) => Ok(()),
        };

        match outcome {
            Ok(()) => {
                debug!(authority = %signature.identity, "signature verified");
                report.verified.insert(signature.identity);
            }
            Err(reason) => {
                warn!(authority = %signature.identity, reason, "invalid signature");
                if policy == SignaturePolicy::All {
                    return Err(DocumentParseError::SignatureValidation {
                        authority: signature.identity,
                        reason: reason.to_string(),
                    });
                }
                report.failures.push(SignatureFailure {
                    authority: signature.identity,
                    reason: reason.to_string(),
                });
            }
        }
    }

    if policy == SignaturePolicy::Majority && report.verified.len() < required {
        return Err(DocumentParseError::InsufficientSignatures {
            valid: report.verified.len(),
            required,
            failures: report.failures,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyStore, SigningKey};
    use crate::meta::Lexer;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    /// Accepts a signature iff it equals the digest, for exercising policy
    struct EchoKey(Fingerprint);

    impl SigningKey for EchoKey {
        fn key_digest(&self) -> Fingerprint {
            self.0
        }

        fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
            digest == signature
        }
    }

    struct EchoStore(BTreeMap<Fingerprint, EchoKey>);

    impl KeyStore for EchoStore {
        fn signing_key(&self, identity: &Fingerprint) -> Option<&dyn SigningKey> {
            self.0.get(identity).map(|k| k as &dyn SigningKey)
        }

        fn authority_count(&self) -> usize {
            self.0.len()
        }
    }

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_u8(&[byte; 20]).unwrap()
    }

    fn store(n: u8) -> EchoStore {
        EchoStore((0..n).map(|i| (fp(i), EchoKey(fp(100 + i)))).collect())
    }

    fn digests() -> SignedPortionDigests {
        SignedPortionDigests {
            sha1: vec![1; 20],
            sha256: vec![2; 32],
        }
    }

    fn signature(authority: u8, good: bool) -> DocumentSignature {
        DocumentSignature {
            algorithm: "sha256".to_string(),
            identity: fp(authority),
            signing_key_digest: fp(100 + authority),
            signature: if good { vec![2; 32] } else { vec![0; 32] },
        }
    }

    #[test]
    fn majority_is_enough() {
        let sigs = vec![
            signature(0, true),
            signature(1, true),
            signature(2, false),
            signature(3, true),
            signature(4, false),
        ];
        let report = verify_signatures(&sigs, &digests(), &store(5), SignaturePolicy::Majority)
            .unwrap();
        assert_eq!(report.verified.len(), 3);
        assert_eq!(report.required, 3);
        assert_eq!(report.failures.len(), 2);
    }

    #[test]
    fn minority_fails() {
        let sigs = vec![signature(0, true), signature(1, false), signature(2, false)];
        assert_matches!(
            verify_signatures(&sigs, &digests(), &store(3), SignaturePolicy::Majority),
            Err(DocumentParseError::InsufficientSignatures { valid: 1, required: 2, failures })
                if failures.len() == 2
        );
    }

    #[test]
    fn duplicate_signatures_count_once() {
        let sigs = vec![signature(0, true), signature(0, true), signature(1, false)];
        assert_matches!(
            verify_signatures(&sigs, &digests(), &store(3), SignaturePolicy::Majority),
            Err(DocumentParseError::InsufficientSignatures { valid: 1, .. })
        );
    }

    #[test]
    fn strict_policy_names_the_authority() {
        let sigs = vec![signature(0, true), signature(1, false)];
        assert_matches!(
            verify_signatures(&sigs, &digests(), &store(2), SignaturePolicy::All),
            Err(DocumentParseError::SignatureValidation { authority, .. }) if authority == fp(1)
        );
    }

    #[test]
    fn key_digest_must_match() {
        let mut sig = signature(0, true);
        sig.signing_key_digest = fp(42);
        let report = verify_signatures(&[sig], &digests(), &store(1), SignaturePolicy::Majority);
        assert_matches!(report, Err(DocumentParseError::InsufficientSignatures { .. }));
    }

    #[test]
    fn unknown_algorithms_are_skipped() {
        let mut sig = signature(0, false);
        sig.algorithm = "sha3-256".to_string();
        let report = verify_signatures(
            &[signature(1, true), sig],
            &digests(),
            &store(2),
            SignaturePolicy::All,
        )
        .unwrap();
        assert!(report.failures.is_empty());
    }

    #[test]
    fn parses_signature_items() {
        let text = "\
directory-signature sha256 0232AF901C31A04EE9848595AF9BB7620D4C5B2E CD1FD971855430880D3C31E0331C5C55800C2F79
-----BEGIN SIGNATURE-----
AAECAw==
-----END SIGNATURE-----
directory-signature 0232AF901C31A04EE9848595AF9BB7620D4C5B2E CD1FD971855430880D3C31E0331C5C55800C2F79
";
        let mut lexer = Lexer::new(text.as_bytes());
        let first = parse_signature(&lexer.next_item().unwrap().unwrap()).unwrap();
        assert_eq!(first.digest_algorithm(), Some(DigestAlgorithm::Sha256));
        assert_eq!(first.signature, vec![0, 1, 2, 3]);

        let second = lexer.next_item().unwrap().unwrap();
        assert_matches!(
            parse_signature(&second),
            Err(DocumentParseError::Validation { reason, .. }) if reason.contains("signature")
        );
    }

    #[test]
    fn signed_portion_ends_after_signature_keyword() {
        let text = "network-status-version 3\ndirectory-signature AA BB\nignored\n";
        let mut lexer = Lexer::new(text.as_bytes());
        let mut digest = SignedDigest::new();
        while let Some(item) = lexer.next_item().unwrap() {
            digest.update(&item);
        }
        let expected = Sha1::digest(b"network-status-version 3\ndirectory-signature ");
        assert_eq!(digest.digests().unwrap().sha1, expected.to_vec());
    }
}
