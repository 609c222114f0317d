//! Generator for synthetic, correctly signed network-status documents

#![allow(dead_code)]

use std::fmt::Write;

use lazy_static::lazy_static;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use tordoc_netstatus::keys::{KeyRing, RsaSigningKey};
use tordoc_netstatus::{Fingerprint, Flavor};

pub const AUTHORITIES: usize = 5;

pub const VALID_AFTER: &str = "2024-03-05 07:00:00";
pub const FRESH_UNTIL: &str = "2024-03-05 08:00:00";
pub const VALID_UNTIL: &str = "2024-03-05 10:00:00";

/// A flag no authority assigns (yet)
pub const NEW_FLAG: &str = "Trustworthy";
pub const ROUTER_EXTENSION: &str = "x-router-extension enabled";
pub const HEADER_EXTENSION: &str = "x-header-extension 1 2 3";

pub struct Authority {
    pub nickname: String,
    pub identity: Fingerprint,
    pub key: RsaPrivateKey,
    pub key_digest: Fingerprint,
}

lazy_static! {
    pub static ref AUTHORITY_KEYS: Vec<Authority> = {
        let mut rng = ChaCha8Rng::seed_from_u64(0x7012);
        (0..AUTHORITIES)
            .map(|i| {
                let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
                let der = RsaPublicKey::from(&key).to_pkcs1_der().unwrap();
                Authority {
                    nickname: format!("auth{i}"),
                    identity: sha1_fingerprint(format!("authority identity {i}").as_bytes()),
                    key_digest: sha1_fingerprint(der.as_bytes()),
                    key,
                }
            })
            .collect()
    };
}

fn sha1_fingerprint(data: &[u8]) -> Fingerprint {
    Fingerprint::from_u8(&Sha1::digest(data)).unwrap()
}

/// Key ring holding the signing keys of all generated authorities
pub fn key_ring() -> KeyRing {
    let mut ring = KeyRing::new();
    for authority in AUTHORITY_KEYS.iter() {
        let key = RsaSigningKey::new(RsaPublicKey::from(&authority.key)).unwrap();
        ring.insert(authority.identity, key);
    }
    ring
}

fn b64(data: &[u8]) -> String {
    base64::encode_config(data, base64::STANDARD_NO_PAD)
}

/// Shape of a generated document
#[derive(Debug, Clone)]
pub struct Fixture {
    pub flavor: Flavor,
    pub routers: usize,
    /// Authorities (taken in order) that sign correctly
    pub good_signatures: usize,
    /// Authorities (following the good ones) whose signature does not verify
    pub bad_signatures: usize,
    pub algorithm: &'static str,
    /// Add unknown flags and lines
    pub extensions: bool,
    /// Leave out the `fingerprint` line of a vote's key certificate
    pub omit_certificate_fingerprint: bool,
}

impl Fixture {
    pub fn new(flavor: Flavor, routers: usize) -> Self {
        Fixture {
            flavor,
            routers,
            good_signatures: AUTHORITIES,
            bad_signatures: 0,
            algorithm: "sha256",
            extensions: false,
            omit_certificate_fingerprint: false,
        }
    }

    pub fn signatures(mut self, good: usize, bad: usize) -> Self {
        assert!(good + bad <= AUTHORITIES);
        self.good_signatures = good;
        self.bad_signatures = bad;
        self
    }

    pub fn algorithm(mut self, algorithm: &'static str) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn without_certificate_fingerprint(mut self) -> Self {
        self.omit_certificate_fingerprint = true;
        self
    }

    pub fn with_extensions(mut self) -> Self {
        self.extensions = true;
        self
    }

    /// Whether router `i` carries the unknown flag
    pub fn has_new_flag(&self, i: usize) -> bool {
        self.extensions && i % 7 == 3
    }

    /// Whether router `i` carries the unknown line
    pub fn has_extension_line(&self, i: usize) -> bool {
        self.extensions && i % 5 == 1
    }

    fn header(&self, out: &mut String) {
        let microdesc = self.flavor == Flavor::MicrodescConsensus;
        out.push_str(if microdesc {
            "network-status-version 3 microdesc\n"
        } else {
            "network-status-version 3\n"
        });
        if self.flavor == Flavor::Vote {
            out.push_str("vote-status vote\nconsensus-methods 28 29 30 31 32 33\n");
            out.push_str("published 2024-03-05 06:50:00\n");
        } else {
            out.push_str("vote-status consensus\nconsensus-method 33\n");
        }
        writeln!(out, "valid-after {VALID_AFTER}").unwrap();
        writeln!(out, "fresh-until {FRESH_UNTIL}").unwrap();
        writeln!(out, "valid-until {VALID_UNTIL}").unwrap();
        out.push_str(
            "voting-delay 300 300
client-versions 0.4.7.16,0.4.8.10
server-versions 0.4.7.16,0.4.8.10
known-flags Authority BadExit Exit Fast Guard HSDir MiddleOnly Running Stable StaleDesc Sybil V2Dir Valid
recommended-client-protocols Cons=2 Desc=2 DirCache=2 HSDir=2 Link=4 Microdesc=2 Relay=2
required-client-protocols Cons=2 Desc=2 Link=4 Microdesc=2 Relay=2
params CircuitPriorityHalflifeMsec=30000 DoSCircuitCreationEnabled=1 cbttestfreq=-1
shared-rand-current-value 9 lNLsRBU2hDcKyLRF4N7lqO1FpDBtNF9M8A5n3HGhzQ4=
",
        );
        if self.extensions {
            writeln!(out, "{HEADER_EXTENSION}").unwrap();
        }
        if self.flavor == Flavor::Vote {
            out.push_str("flag-thresholds stable-uptime=693369 fast-speed=20480 guard-wfu=98.000%\n");
            self.key_certificate(&AUTHORITY_KEYS[0], out);
            return;
        }
        for (i, authority) in AUTHORITY_KEYS.iter().enumerate() {
            writeln!(
                out,
                "dir-source {} {} {}.example.org 10.0.0.{} 80 443",
                authority.nickname,
                authority.identity,
                authority.nickname,
                i + 1
            )
            .unwrap();
            writeln!(out, "contact {} <{} at example dot org>", authority.nickname, authority.nickname)
                .unwrap();
            writeln!(out, "vote-digest {}", sha1_fingerprint(authority.nickname.as_bytes())).unwrap();
        }
    }

    /// The voting authority's section of a vote, including its key
    /// certificate
    fn key_certificate(&self, authority: &Authority, out: &mut String) {
        writeln!(
            out,
            "dir-source {0} {1} {0}.example.org 10.0.0.1 80 443",
            authority.nickname, authority.identity
        )
        .unwrap();
        writeln!(out, "contact {0} <{0} at example dot org>", authority.nickname).unwrap();
        out.push_str("dir-key-certificate-version 3\n");
        if !self.omit_certificate_fingerprint {
            writeln!(out, "fingerprint {}", authority.identity).unwrap();
        }
        out.push_str("dir-key-published 2024-01-01 00:00:00\n");
        out.push_str("dir-key-expires 2025-01-01 00:00:00\n");
        let pem = RsaPublicKey::from(&authority.key)
            .to_pkcs1_pem(LineEnding::LF)
            .unwrap();
        let pem = pem.trim_end();
        writeln!(out, "dir-identity-key\n{pem}").unwrap();
        writeln!(out, "dir-signing-key\n{pem}").unwrap();
        let certification = authority
            .key
            .sign(Pkcs1v15Sign::new_unprefixed(), &Sha1::digest(b"certificate"))
            .unwrap();
        for label in ["dir-key-crosscert", "dir-key-certification"] {
            let object = if label == "dir-key-crosscert" { "ID SIGNATURE" } else { "SIGNATURE" };
            writeln!(out, "{label}").unwrap();
            push_object(out, object, &certification);
        }
    }

    fn router(&self, i: usize, out: &mut String) {
        let identity = Sha1::digest(format!("router identity {i}").as_bytes());
        let published = format!("2024-03-05 06:{:02}:{:02}", i / 60 % 60, i % 60);
        let address = format!("10.{}.{}.{}", 1 + i / 65536, i / 256 % 256, i % 256);
        if self.flavor == Flavor::MicrodescConsensus {
            writeln!(out, "r relay{i:04} {} {published} {address} 9001 0", b64(&identity)).unwrap();
        } else {
            let digest = Sha1::digest(format!("descriptor {i}").as_bytes());
            writeln!(
                out,
                "r relay{i:04} {} {} {published} {address} 9001 9030",
                b64(&identity),
                b64(&digest)
            )
            .unwrap();
        }
        if i % 10 == 0 {
            writeln!(out, "a [2001:db8::{:x}]:9001", i + 1).unwrap();
        }
        if self.flavor == Flavor::MicrodescConsensus {
            let digest = Sha256::digest(format!("microdescriptor {i}").as_bytes());
            writeln!(out, "m {}", b64(&digest)).unwrap();
        }
        out.push_str("s Fast Running Valid");
        if i % 3 == 0 {
            out.push_str(" Guard Stable");
        }
        if self.has_new_flag(i) {
            write!(out, " {NEW_FLAG}").unwrap();
        }
        out.push('\n');
        out.push_str("v Tor 0.4.8.10\n");
        out.push_str("pr Cons=1-2 Desc=1-2 DirCache=2 HSDir=2 Link=1-5 Microdesc=1-2 Relay=1-4\n");
        if self.flavor == Flavor::Vote {
            writeln!(out, "w Bandwidth={} Measured={}", 1000 + i, 900 + i).unwrap();
        } else if i % 4 == 2 {
            writeln!(out, "w Bandwidth={} Unmeasured=1", 20 + i).unwrap();
        } else {
            writeln!(out, "w Bandwidth={}", 1000 + i).unwrap();
        }
        if self.flavor != Flavor::MicrodescConsensus {
            out.push_str(if i % 2 == 0 {
                "p reject 1-65535\n"
            } else {
                "p accept 80,443\n"
            });
        }
        if self.flavor == Flavor::Vote {
            let old = Sha256::digest(format!("old microdescriptor {i}").as_bytes());
            let new = Sha256::digest(format!("microdescriptor {i}").as_bytes());
            writeln!(out, "m 28,29,30 sha256={}", b64(&old)).unwrap();
            writeln!(out, "m 31,32,33 sha256={}", b64(&new)).unwrap();
            writeln!(out, "id ed25519 {}", b64(&Sha256::digest(format!("ed25519 {i}").as_bytes())))
                .unwrap();
        }
        if self.has_extension_line(i) {
            writeln!(out, "{ROUTER_EXTENSION}").unwrap();
        }
    }

    /// Generate the document text, including a leading `@type` annotation.
    pub fn generate(&self) -> String {
        let mut out = String::new();
        let flavor: &'static str = self.flavor.into();
        writeln!(out, "@type {flavor} 1.0").unwrap();

        let mut body = String::new();
        self.header(&mut body);
        for i in 0..self.routers {
            self.router(i, &mut body);
        }
        body.push_str("directory-footer\n");
        if self.flavor != Flavor::Vote {
            body.push_str("bandwidth-weights Wbd=0 Wbe=0 Wbg=4143 Wbm=10000 Wdb=10000 Web=10000\n");
        }

        let signed = format!("{body}directory-signature ");
        let digest = match self.algorithm {
            "sha1" => Sha1::digest(signed.as_bytes()).to_vec(),
            _ => Sha256::digest(signed.as_bytes()).to_vec(),
        };
        let garbage = Sha256::digest(b"not the document")[..digest.len()].to_vec();

        out.push_str(&body);
        let signers = AUTHORITY_KEYS
            .iter()
            .take(self.good_signatures + self.bad_signatures)
            .enumerate();
        for (i, authority) in signers {
            let signed_digest = if i < self.good_signatures { &digest } else { &garbage };
            let signature = authority
                .key
                .sign(Pkcs1v15Sign::new_unprefixed(), signed_digest)
                .unwrap();
            if self.algorithm == "sha1" {
                writeln!(out, "directory-signature {} {}", authority.identity, authority.key_digest)
                    .unwrap();
            } else {
                writeln!(
                    out,
                    "directory-signature {} {} {}",
                    self.algorithm, authority.identity, authority.key_digest
                )
                .unwrap();
            }
            push_object(&mut out, "SIGNATURE", &signature);
        }
        out
    }
}

fn push_object(out: &mut String, label: &str, data: &[u8]) {
    writeln!(out, "-----BEGIN {label}-----").unwrap();
    let encoded = base64::encode(data);
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    writeln!(out, "-----END {label}-----").unwrap();
}
