//! Router status entries, the per-relay records of a network-status document

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use super::{EntryContext, Flag, Flags, Flavor, Protocols};
use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::{self, Digest256, Fingerprint, Item, RawLine};

static CONSENSUS_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "r", "a", "s", "v", "pr", "w", "p",
};

static MICRODESC_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "r", "a", "m", "s", "v", "pr", "w",
};

static VOTE_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "r", "a", "s", "v", "pr", "w", "p", "m", "id",
};

lazy_static! {
    static ref NICKNAME: Regex = Regex::new(r"^[A-Za-z0-9]{1,19}$").unwrap();
}

/// Exit policy type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicyType {
    Accept,
    Reject,
}

/// Exit port entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPolicyEntry {
    SinglePort(u16),
    PortRange { min: u16, max: u16 },
}

impl ExitPolicyEntry {
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            ExitPolicyEntry::SinglePort(x) => x == port,
            ExitPolicyEntry::PortRange { min, max } => min <= port && port <= max,
        }
    }
}

impl FromStr for ExitPolicyEntry {
    type Err = DocumentParseError;

    /// Parse from "3" or "2-5".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((min, max)) => Ok(ExitPolicyEntry::PortRange {
                min: min.parse().context("exit policy port (from)")?,
                max: max.parse().context("exit policy port (to)")?,
            }),
            None => Ok(ExitPolicyEntry::SinglePort(
                s.parse().context("exit policy port")?,
            )),
        }
    }
}

impl fmt::Display for ExitPolicyEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitPolicyEntry::SinglePort(x) => write!(f, "{}", x),
            ExitPolicyEntry::PortRange { min: x, max: y } => write!(f, "{}-{}", x, y),
        }
    }
}

/// A relay's condensed exit policy (ports for "most" target IP addresses)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondensedExitPolicy {
    pub policy_type: ExitPolicyType,
    pub entries: Vec<ExitPolicyEntry>,
}

impl CondensedExitPolicy {
    pub fn allows_port(&self, port: u16) -> bool {
        let listed = self.entries.iter().any(|entry| entry.contains(port));
        match self.policy_type {
            ExitPolicyType::Accept => listed,
            ExitPolicyType::Reject => !listed,
        }
    }
}

impl FromStr for CondensedExitPolicy {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || DocumentParseError::FieldDecode {
            field: "exit policy".to_string(),
            reason: format!("'{s}' is not 'accept|reject PortList'"),
        };
        let (cmd, ports) = s.split_once(' ').ok_or_else(malformed)?;
        let policy_type = match cmd {
            "accept" => ExitPolicyType::Accept,
            "reject" => ExitPolicyType::Reject,
            _ => return Err(malformed()),
        };
        let entries = ports
            .split(',')
            .map(|x| x.parse::<ExitPolicyEntry>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CondensedExitPolicy {
            policy_type,
            entries,
        })
    }
}

impl fmt::Display for CondensedExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}",
            match self.policy_type {
                ExitPolicyType::Accept => "accept",
                ExitPolicyType::Reject => "reject",
            },
            self.entries
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

/// Contents of a `w` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    /// Consensus weight (in kilobytes per second)
    pub bandwidth: u64,
    /// Bandwidth measured by bandwidth authorities (votes only)
    pub measured: Option<u64>,
    /// Whether fewer than three bandwidth authorities measured the relay
    pub unmeasured: bool,
}

impl FromStr for Bandwidth {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with("Bandwidth=") {
            return Err(DocumentParseError::FieldDecode {
                field: "bandwidth weight".to_string(),
                reason: "line does not start with 'Bandwidth='".to_string(),
            });
        }
        let mut bandwidth = Bandwidth {
            bandwidth: 0,
            measured: None,
            unmeasured: false,
        };
        for arg in s.split_ascii_whitespace() {
            let (k, v) = arg.split_once('=').ok_or_else(|| DocumentParseError::FieldDecode {
                field: "bandwidth weight".to_string(),
                reason: format!("'{arg}' is not a key=value pair"),
            })?;
            match k {
                "Bandwidth" => bandwidth.bandwidth = v.parse().context("bandwidth weight")?,
                "Measured" => bandwidth.measured = Some(v.parse().context("measured bandwidth")?),
                "Unmeasured" => bandwidth.unmeasured = v == "1",
                _ => {}
            }
        }
        Ok(bandwidth)
    }
}

/// A vote's `m` line: the microdescriptor digests a relay's descriptor
/// yields under a set of consensus methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrodescMethods {
    pub methods: Vec<u32>,
    pub digests: BTreeMap<String, String>,
}

impl FromStr for MicrodescMethods {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut args = s.split_ascii_whitespace();
        let methods = args
            .next()
            .ok_or_else(|| DocumentParseError::args_missing("m"))?
            .split(',')
            .map(|m| m.parse::<u32>().context("consensus method"))
            .collect::<Result<Vec<_>, _>>()?;
        let digests = args
            .filter_map(|arg| arg.split_once('='))
            .map(|(alg, digest)| (alg.to_string(), digest.to_string()))
            .collect();
        Ok(MicrodescMethods { methods, digests })
    }
}

/// A relay entry within a network-status document.
///
/// Fields are `None` when the corresponding line is missing, or when it
/// was malformed and the document was parsed without validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStatusEntry {
    pub nickname: Option<String>,
    pub identity: Option<Fingerprint>,
    /// Digest of the server descriptor (full consensus and votes)
    pub digest: Option<Fingerprint>,
    /// Digest of the microdescriptor (microdescriptor consensus)
    pub microdesc_digest: Option<Digest256>,
    pub published: Option<DateTime<Utc>>,
    pub address: Option<Ipv4Addr>,
    pub or_port: Option<u16>,
    /// `None` if the relay has no directory port
    pub dir_port: Option<u16>,
    /// Additional OR addresses from `a` lines
    pub or_addresses: Vec<SocketAddr>,
    pub flags: Flags,
    pub version_line: Option<String>,
    pub protocols: Option<Protocols>,
    pub bandwidth: Option<Bandwidth>,
    pub exit_policy: Option<CondensedExitPolicy>,
    /// `m` lines of a vote
    pub microdesc_methods: Vec<MicrodescMethods>,
    /// Ed25519 identity from the `id` line of a vote, or "none"
    pub ed25519_identity: Option<String>,
    unrecognized_lines: Vec<RawLine>,
}

impl RouterStatusEntry {
    /// Lines of this entry that are not part of the flavor's grammar,
    /// with their original bytes.
    pub fn unrecognized_lines(&self) -> &[RawLine] {
        &self.unrecognized_lines
    }
}

fn keywords(flavor: Flavor) -> &'static phf::Set<&'static str> {
    match flavor {
        Flavor::Consensus => &CONSENSUS_KEYWORDS,
        Flavor::MicrodescConsensus => &MICRODESC_KEYWORDS,
        Flavor::Vote => &VOTE_KEYWORDS,
    }
}

fn parse_nickname(s: &str) -> Result<String, DocumentParseError> {
    if NICKNAME.is_match(s) {
        Ok(s.to_string())
    } else {
        Err(DocumentParseError::FieldDecode {
            field: "nickname".to_string(),
            reason: format!("'{s}' is not 1-19 alphanumeric characters"),
        })
    }
}

fn parse_r_line(
    item: &Item,
    ctx: &mut EntryContext,
    entry: &mut RouterStatusEntry,
) -> Result<(), DocumentParseError> {
    let args = item.split_arguments();
    let with_digest = ctx.flavor != Flavor::MicrodescConsensus;
    let expected = if with_digest { 8 } else { 7 };
    ctx.require(args.len() >= expected, || {
        format!("'r' line has {} arguments, expected {expected}", args.len())
    })?;

    let arg = |i: usize| {
        args.get(i)
            .copied()
            .ok_or_else(|| DocumentParseError::args_missing("r"))
    };

    entry.nickname = ctx.field(arg(0).and_then(parse_nickname))?;
    if let Some(nickname) = &entry.nickname {
        ctx.rename(format!("router status entry '{nickname}'"));
    }
    entry.identity =
        ctx.field(arg(1).and_then(|s| Fingerprint::from_str_b64(s).context("identity")))?;

    let mut next = 2;
    if with_digest {
        entry.digest = ctx.field(
            arg(2).and_then(|s| Fingerprint::from_str_b64(s).context("descriptor digest")),
        )?;
        next = 3;
    }

    entry.published = ctx.field(arg(next).and_then(|date| {
        let time = arg(next + 1)?;
        meta::parse_timestamp(&format!("{date} {time}")).context("publication time")
    }))?;
    entry.address =
        ctx.field(arg(next + 2).and_then(|ip| Ipv4Addr::from_str(ip).context("address")))?;
    entry.or_port = ctx.field(arg(next + 3).and_then(|p| p.parse::<u16>().context("OR port")))?;
    ctx.require(entry.or_port != Some(0), || "OR port is 0".to_string())?;
    entry.dir_port = ctx
        .field(arg(next + 4).and_then(|p| p.parse::<u16>().context("dir port")))?
        .filter(|&p| p != 0);
    Ok(())
}

/// Build a router status entry from its items, the first being the `r` line
pub(crate) fn build_router(
    items: Vec<Item>,
    ctx: &mut EntryContext,
) -> Result<RouterStatusEntry, DocumentParseError> {
    let mut entry = RouterStatusEntry::default();
    let grammar = keywords(ctx.flavor);

    for item in items.iter() {
        if !grammar.contains(item.keyword.as_str()) {
            ctx.unrecognized(item, &mut entry.unrecognized_lines);
            continue;
        }
        let repeatable = matches!(item.keyword.as_str(), "a")
            || (ctx.flavor == Flavor::Vote && item.keyword == "m");
        if !repeatable {
            ctx.once(item)?;
        }

        match item.keyword.as_str() {
            "r" => parse_r_line(item, ctx, &mut entry)?,
            "a" => {
                let addr = ctx.field(
                    item.get_argument()
                        .and_then(|s| SocketAddr::from_str(s).context("OR address")),
                )?;
                entry.or_addresses.extend(addr);
            }
            "s" => {
                entry.flags = Flags::default();
                for name in item.split_arguments() {
                    let flag = Flag::new(name);
                    ctx.reporter.flag(&flag);
                    entry.flags.insert(flag);
                }
            }
            "v" => {
                entry.version_line = Some(item.arguments().to_string());
            }
            "pr" => {
                entry.protocols = ctx.field(item.arguments().parse::<Protocols>())?;
            }
            "w" => {
                entry.bandwidth =
                    ctx.field(item.get_argument().and_then(|s| s.parse::<Bandwidth>()))?;
            }
            "p" => {
                entry.exit_policy = ctx.field(
                    item.get_argument()
                        .and_then(|s| s.parse::<CondensedExitPolicy>()),
                )?;
            }
            "m" if ctx.flavor == Flavor::Vote => {
                let methods = ctx.field(
                    item.get_argument()
                        .and_then(|s| s.parse::<MicrodescMethods>()),
                )?;
                entry.microdesc_methods.extend(methods);
            }
            "m" => {
                entry.microdesc_digest = ctx.field(item.get_argument().and_then(|s| {
                    Digest256::from_str_b64(s).context("microdescriptor digest")
                }))?;
            }
            "id" => {
                let args = item.split_arguments();
                entry.ed25519_identity = match args[..] {
                    ["ed25519", key, ..] => Some(key.to_string()),
                    _ => ctx.field(Err(DocumentParseError::args_missing("id")))?,
                };
            }
            _ => unreachable!("keyword tables and match arms disagree"),
        }
    }

    ctx.require(ctx.seen("s"), || "missing 's' line".to_string())?;
    ctx.require(!entry.flags.is_empty(), || "'s' line lists no flags".to_string())?;
    if ctx.flavor == Flavor::MicrodescConsensus {
        ctx.require(ctx.seen("m"), || "missing 'm' line".to_string())?;
    }

    Ok(entry)
}
