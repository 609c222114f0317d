//! Tor sub-protocol versions (`pr` and `*-protocols` lines)

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use strum::{EnumString, IntoStaticStr};

use crate::error::{DocumentParseError, ErrorContext};

/// A Tor sub-protocol
#[derive(Debug, Clone, Copy, EnumString, IntoStaticStr, PartialEq, PartialOrd, Eq, Ord)]
pub enum Protocol {
    Conflux,
    Cons,
    Desc,
    DirCache,
    FlowCtrl,
    HSDir,
    HSIntro,
    HSRend,
    Link,
    LinkAuth,
    Microdesc,
    Padding,
    Relay,
}

/// A range of supported protocol versions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupportedProtocolVersion {
    versions: Vec<u8>,
}

impl SupportedProtocolVersion {
    pub fn supports(&self, v: u8) -> bool {
        self.versions.contains(&v)
    }
}

impl fmt::Display for SupportedProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ranges: Vec<(u8, u8)> = Vec::new();
        for &v in &self.versions {
            match ranges.last_mut() {
                Some((_, end)) if end.checked_add(1) == Some(v) => *end = v,
                _ => ranges.push((v, v)),
            }
        }
        for (i, (start, end)) in ranges.into_iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for SupportedProtocolVersion {
    type Err = DocumentParseError;

    /// Parse from "3", "2-5" or "1-2,4".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut versions = Vec::new();
        for component in s.split(',').filter(|c| !c.is_empty()) {
            match component.split_once('-') {
                Some((min, max)) => {
                    let min = min.parse::<u8>().context("protocol version (from)")?;
                    let max = max.parse::<u8>().context("protocol version (to)")?;
                    versions.extend(min..=max);
                }
                None => {
                    versions.push(component.parse::<u8>().context("protocol version")?);
                }
            }
        }
        versions.sort_unstable();
        versions.dedup();
        Ok(SupportedProtocolVersion { versions })
    }
}

/// The set of sub-protocols a relay supports, or that a consensus
/// recommends or requires.
///
/// Protocols this crate does not know are kept by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Protocols {
    known: BTreeMap<Protocol, SupportedProtocolVersion>,
    other: BTreeMap<String, SupportedProtocolVersion>,
}

impl Protocols {
    pub fn get(&self, protocol: Protocol) -> Option<&SupportedProtocolVersion> {
        self.known.get(&protocol)
    }

    pub fn supports(&self, protocol: Protocol, version: u8) -> bool {
        self.get(protocol).map_or(false, |v| v.supports(version))
    }

    /// Protocols not covered by [`Protocol`]
    pub fn unknown(&self) -> impl Iterator<Item = (&str, &SupportedProtocolVersion)> {
        self.other.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromStr for Protocols {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut protocols = Protocols::default();
        for split in s.split_ascii_whitespace() {
            let (left, right) = split
                .split_once('=')
                .ok_or_else(|| DocumentParseError::FieldDecode {
                    field: "protocol list".to_string(),
                    reason: format!("'{split}' is not of the form Name=Versions"),
                })?;
            let versions = right.parse::<SupportedProtocolVersion>()?;
            match left.parse::<Protocol>() {
                Ok(protocol) => {
                    protocols.known.insert(protocol, versions);
                }
                Err(_) => {
                    protocols.other.insert(left.to_string(), versions);
                }
            }
        }
        Ok(protocols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("3", "3")]
    #[case("1-5", "1-5")]
    #[case("1-2,4,6-7", "1-2,4,6-7")]
    #[case("4,1-2", "1-2,4")]
    fn protocol_versions_display(#[case] raw: &str, #[case] displayed: &str) {
        let v: SupportedProtocolVersion = raw.parse().unwrap();
        assert_eq!(v.to_string(), displayed);
    }

    #[test]
    fn unknown_protocols_are_kept() {
        let p: Protocols = "Cons=1-2 Link=1-5 Teleport=3".parse().unwrap();
        assert!(p.supports(Protocol::Link, 4));
        assert!(!p.supports(Protocol::Relay, 1));
        let unknown: Vec<_> = p.unknown().map(|(k, v)| (k, v.to_string())).collect();
        assert_eq!(unknown, vec![("Teleport", "3".to_string())]);
    }

    #[test]
    fn malformed_protocols_fail() {
        assert!("Cons".parse::<Protocols>().is_err());
        assert!("Cons=x".parse::<Protocols>().is_err());
    }
}
