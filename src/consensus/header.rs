//! Document header, directory authority sections and footer

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::signature::{self, DocumentSignature, SignatureReport};
use super::{EntryContext, Flag, Flavor, Protocols};
use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::{self, Fingerprint, Item, RawLine};

static COMMON_HEADER_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "network-status-version", "vote-status", "valid-after", "fresh-until",
    "valid-until", "voting-delay", "client-versions", "server-versions",
    "known-flags", "recommended-client-protocols", "recommended-relay-protocols",
    "required-client-protocols", "required-relay-protocols", "params",
    "shared-rand-previous-value", "shared-rand-current-value", "package",
};

static CONSENSUS_HEADER_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "consensus-method",
};

static VOTE_HEADER_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "consensus-methods", "published", "flag-thresholds",
    "bandwidth-file-headers", "bandwidth-file-digest",
};

static AUTHORITY_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "dir-source", "contact", "vote-digest", "legacy-dir-key",
    "shared-rand-participate", "shared-rand-commit",
    "shared-rand-previous-value", "shared-rand-current-value",
    "dir-key-certificate-version", "fingerprint", "dir-key-published",
    "dir-key-expires", "dir-identity-key", "dir-signing-key",
    "dir-key-crosscert", "dir-key-certification",
};

/// Header items that may appear at most once
static SINGLE_HEADER_KEYWORDS: phf::Set<&'static str> = phf::phf_set! {
    "network-status-version", "vote-status", "consensus-method", "consensus-methods",
    "published", "valid-after", "fresh-until", "valid-until", "voting-delay",
    "client-versions", "server-versions", "known-flags", "params",
    "recommended-client-protocols", "recommended-relay-protocols",
    "required-client-protocols", "required-relay-protocols",
    "shared-rand-previous-value", "shared-rand-current-value", "flag-thresholds",
};

/// `voting-delay VoteSeconds DistSeconds`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VotingDelay {
    pub vote_seconds: u32,
    pub dist_seconds: u32,
}

/// A shared random value with the number of reveals it is based on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRandomness {
    pub reveals: u32,
    pub value: Vec<u8>,
}

impl FromStr for SharedRandomness {
    type Err = DocumentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_ascii_whitespace().collect::<Vec<_>>()[..] {
            [reveals, value, ..] => Ok(SharedRandomness {
                reveals: reveals.parse::<u32>().context("shared random reveals")?,
                value: base64::decode(value).context("shared random value")?,
            }),
            _ => Err(DocumentParseError::args_missing("shared-rand-*-value")),
        }
    }
}

/// The preamble of a network-status document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flavor: Flavor,
    /// Leading `@type ...` annotation lines, which are not signed
    pub annotations: Vec<String>,
    pub version: Option<u32>,
    pub vote_status: Option<String>,
    pub consensus_method: Option<u32>,
    pub consensus_methods: Vec<u32>,
    pub published: Option<DateTime<Utc>>,
    pub valid_after: Option<DateTime<Utc>>,
    pub fresh_until: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub voting_delay: Option<VotingDelay>,
    pub client_versions: Vec<String>,
    pub server_versions: Vec<String>,
    pub known_flags: Vec<Flag>,
    pub recommended_client_protocols: Option<Protocols>,
    pub recommended_relay_protocols: Option<Protocols>,
    pub required_client_protocols: Option<Protocols>,
    pub required_relay_protocols: Option<Protocols>,
    pub params: BTreeMap<String, i32>,
    pub flag_thresholds: BTreeMap<String, String>,
    pub shared_rand_previous: Option<SharedRandomness>,
    pub shared_rand_current: Option<SharedRandomness>,
    pub packages: Vec<String>,
    unrecognized_lines: Vec<RawLine>,
}

impl Header {
    pub(crate) fn new(flavor: Flavor) -> Self {
        Header {
            flavor,
            annotations: Vec::new(),
            version: None,
            vote_status: None,
            consensus_method: None,
            consensus_methods: Vec::new(),
            published: None,
            valid_after: None,
            fresh_until: None,
            valid_until: None,
            voting_delay: None,
            client_versions: Vec::new(),
            server_versions: Vec::new(),
            known_flags: Vec::new(),
            recommended_client_protocols: None,
            recommended_relay_protocols: None,
            required_client_protocols: None,
            required_relay_protocols: None,
            params: BTreeMap::new(),
            flag_thresholds: BTreeMap::new(),
            shared_rand_previous: None,
            shared_rand_current: None,
            packages: Vec::new(),
            unrecognized_lines: Vec::new(),
        }
    }

    pub fn unrecognized_lines(&self) -> &[RawLine] {
        &self.unrecognized_lines
    }

    /// Check valid-after < fresh-until < valid-until.
    pub(crate) fn check_timestamps(&self) -> Result<(), DocumentParseError> {
        if let (Some(valid_after), Some(fresh_until), Some(valid_until)) =
            (self.valid_after, self.fresh_until, self.valid_until)
        {
            if !(valid_after < fresh_until && fresh_until < valid_until) {
                return Err(DocumentParseError::invalid(
                    "header",
                    format!(
                        "timestamps out of order: valid-after {}, fresh-until {}, valid-until {}",
                        meta::format_timestamp(&valid_after),
                        meta::format_timestamp(&fresh_until),
                        meta::format_timestamp(&valid_until),
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn is_header_keyword(flavor: Flavor, keyword: &str) -> bool {
    COMMON_HEADER_KEYWORDS.contains(keyword)
        || match flavor {
            Flavor::Vote => VOTE_HEADER_KEYWORDS.contains(keyword),
            _ => CONSENSUS_HEADER_KEYWORDS.contains(keyword),
        }
}

fn parse_timestamp(item: &Item) -> Result<DateTime<Utc>, DocumentParseError> {
    meta::parse_timestamp(item.get_argument()?).context(&item.keyword)
}

fn parse_versions(item: &Item) -> Vec<String> {
    item.arguments()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_params(item: &Item) -> Result<BTreeMap<String, i32>, DocumentParseError> {
    item.split_arguments()
        .into_iter()
        .map(|arg| {
            let (k, v) = arg
                .split_once('=')
                .ok_or_else(|| DocumentParseError::FieldDecode {
                    field: "params".to_string(),
                    reason: format!("'{arg}' is not a key=value pair"),
                })?;
            Ok((k.to_string(), v.parse::<i32>().context(format!("param '{k}'"))?))
        })
        .collect()
}

/// Build the header from its items. Annotations have already been split off.
pub(crate) fn build_header(
    annotations: Vec<String>,
    items: Vec<Item>,
    ctx: &mut EntryContext,
) -> Result<Header, DocumentParseError> {
    let flavor = ctx.flavor;
    let mut header = Header::new(flavor);
    header.annotations = annotations;

    if let Some(first) = items.first() {
        ctx.require(first.keyword == "network-status-version", || {
            format!("document starts with '{}'", first.keyword)
        })?;
    }

    for item in items.iter() {
        let keyword = item.keyword.as_str();
        if !is_header_keyword(flavor, keyword) {
            ctx.unrecognized(item, &mut header.unrecognized_lines);
            continue;
        }
        if SINGLE_HEADER_KEYWORDS.contains(keyword) {
            ctx.once(item)?;
        }

        match keyword {
            "network-status-version" => {
                let args = item.split_arguments();
                header.version = ctx.field(
                    args.first()
                        .ok_or_else(|| DocumentParseError::args_missing(keyword))
                        .and_then(|v| v.parse::<u32>().context("network-status-version")),
                )?;
                let microdesc = args.get(1) == Some(&"microdesc");
                ctx.require(header.version == Some(3), || {
                    format!("unsupported network-status-version '{}'", item.arguments())
                })?;
                ctx.require(microdesc == (flavor == Flavor::MicrodescConsensus), || {
                    format!("version line '{}' does not match the flavor", item.arguments())
                })?;
            }
            "vote-status" => {
                let status = item.arguments().trim().to_string();
                ctx.require(status == flavor.vote_status(), || {
                    format!("vote-status '{status}' in a {} document", flavor.vote_status())
                })?;
                header.vote_status = Some(status);
            }
            "consensus-method" => {
                header.consensus_method = ctx.field(
                    item.get_argument()
                        .and_then(|m| m.parse::<u32>().context("consensus-method")),
                )?;
            }
            "consensus-methods" => {
                header.consensus_methods = ctx
                    .field(
                        item.split_arguments()
                            .into_iter()
                            .map(|m| m.parse::<u32>().context("consensus-methods"))
                            .collect::<Result<Vec<_>, _>>(),
                    )?
                    .unwrap_or_default();
            }
            "published" => header.published = ctx.field(parse_timestamp(item))?,
            "valid-after" => header.valid_after = ctx.field(parse_timestamp(item))?,
            "fresh-until" => header.fresh_until = ctx.field(parse_timestamp(item))?,
            "valid-until" => header.valid_until = ctx.field(parse_timestamp(item))?,
            "voting-delay" => {
                header.voting_delay = ctx.field(match item.split_arguments()[..] {
                    [vote, dist] => vote
                        .parse::<u32>()
                        .context("voting-delay")
                        .and_then(|vote_seconds| {
                            Ok(VotingDelay {
                                vote_seconds,
                                dist_seconds: dist.parse::<u32>().context("voting-delay")?,
                            })
                        }),
                    _ => Err(DocumentParseError::args_missing(keyword)),
                })?;
            }
            "client-versions" => header.client_versions = parse_versions(item),
            "server-versions" => header.server_versions = parse_versions(item),
            "known-flags" => {
                header.known_flags = item.split_arguments().into_iter().map(Flag::new).collect();
            }
            "recommended-client-protocols" => {
                header.recommended_client_protocols = ctx.field(item.arguments().parse())?;
            }
            "recommended-relay-protocols" => {
                header.recommended_relay_protocols = ctx.field(item.arguments().parse())?;
            }
            "required-client-protocols" => {
                header.required_client_protocols = ctx.field(item.arguments().parse())?;
            }
            "required-relay-protocols" => {
                header.required_relay_protocols = ctx.field(item.arguments().parse())?;
            }
            "params" => {
                header.params = ctx.field(parse_params(item))?.unwrap_or_default();
            }
            "flag-thresholds" => {
                header.flag_thresholds = item
                    .split_arguments()
                    .into_iter()
                    .filter_map(|arg| arg.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
            }
            "shared-rand-previous-value" => {
                header.shared_rand_previous = ctx.field(item.arguments().parse())?;
            }
            "shared-rand-current-value" => {
                header.shared_rand_current = ctx.field(item.arguments().parse())?;
            }
            "package" => header.packages.push(item.arguments().to_string()),
            // bandwidth-file-* lines of votes are recognized but not kept
            _ => {}
        }
    }

    let mut required = vec![
        "network-status-version",
        "vote-status",
        "valid-after",
        "fresh-until",
        "valid-until",
        "voting-delay",
        "known-flags",
    ];
    match flavor {
        Flavor::Vote => required.extend(["consensus-methods", "published"]),
        _ => required.push("consensus-method"),
    }
    for keyword in required {
        ctx.require(ctx.seen(keyword), || format!("missing '{keyword}' line"))?;
    }

    Ok(header)
}

/// A directory authority section (`dir-source` and the lines following it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySource {
    pub nickname: Option<String>,
    pub identity: Option<Fingerprint>,
    pub hostname: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub dir_port: Option<u16>,
    pub or_port: Option<u16>,
    pub contact: Option<String>,
    /// Digest of the authority's vote (consensus only)
    pub vote_digest: Option<Fingerprint>,
    pub legacy_dir_key: Option<Fingerprint>,
    /// The `fingerprint` line of a vote's key certificate
    pub certificate_fingerprint: Option<Fingerprint>,
    /// DER encoded signing key from a vote's key certificate
    pub signing_key: Option<Vec<u8>>,
    unrecognized_lines: Vec<RawLine>,
}

impl DirectorySource {
    pub fn unrecognized_lines(&self) -> &[RawLine] {
        &self.unrecognized_lines
    }
}

fn parse_dir_source(
    item: &Item,
    ctx: &mut EntryContext,
    source: &mut DirectorySource,
) -> Result<(), DocumentParseError> {
    let args = item.split_arguments();
    ctx.require(args.len() >= 6, || {
        format!("'dir-source' line has {} arguments, expected 6", args.len())
    })?;
    let arg = |i: usize| {
        args.get(i)
            .copied()
            .ok_or_else(|| DocumentParseError::args_missing("dir-source"))
    };

    source.nickname = ctx.field(arg(0).map(str::to_string))?;
    if let Some(nickname) = &source.nickname {
        ctx.rename(format!("directory authority '{nickname}'"));
    }
    source.identity =
        ctx.field(arg(1).and_then(|s| Fingerprint::from_str_hex(s).context("authority identity")))?;
    source.hostname = ctx.field(arg(2).map(str::to_string))?;
    source.address =
        ctx.field(arg(3).and_then(|s| Ipv4Addr::from_str(s).context("authority address")))?;
    source.dir_port = ctx.field(arg(4).and_then(|s| s.parse::<u16>().context("authority dir port")))?;
    source.or_port = ctx.field(arg(5).and_then(|s| s.parse::<u16>().context("authority OR port")))?;
    Ok(())
}

/// Build one authority section; the first item is the `dir-source` line
pub(crate) fn build_directory_source(
    items: Vec<Item>,
    ctx: &mut EntryContext,
) -> Result<DirectorySource, DocumentParseError> {
    let mut source = DirectorySource {
        nickname: None,
        identity: None,
        hostname: None,
        address: None,
        dir_port: None,
        or_port: None,
        contact: None,
        vote_digest: None,
        legacy_dir_key: None,
        certificate_fingerprint: None,
        signing_key: None,
        unrecognized_lines: Vec::new(),
    };

    for item in items.iter() {
        let keyword = item.keyword.as_str();
        if !AUTHORITY_KEYWORDS.contains(keyword) {
            ctx.unrecognized(item, &mut source.unrecognized_lines);
            continue;
        }
        if !matches!(keyword, "shared-rand-commit") {
            ctx.once(item)?;
        }

        match keyword {
            "dir-source" => parse_dir_source(item, ctx, &mut source)?,
            "contact" => source.contact = Some(item.arguments().to_string()),
            "vote-digest" => {
                source.vote_digest = ctx.field(
                    item.get_argument()
                        .and_then(|s| Fingerprint::from_str_hex(s).context("vote-digest")),
                )?;
            }
            "legacy-dir-key" => {
                source.legacy_dir_key = ctx.field(
                    item.get_argument()
                        .and_then(|s| Fingerprint::from_str_hex(s).context("legacy-dir-key")),
                )?;
            }
            "fingerprint" => {
                source.certificate_fingerprint = ctx.field(
                    item.get_argument()
                        .and_then(|s| Fingerprint::from_str_hex(s).context("fingerprint")),
                )?;
            }
            "dir-signing-key" => {
                source.signing_key = item.object.as_ref().map(|o| o.data.clone());
            }
            // Remaining key certificate and shared randomness lines are
            // part of the grammar but carry nothing this crate exposes
            _ => {}
        }
    }

    if ctx.flavor == Flavor::Vote {
        ctx.require(ctx.seen("fingerprint"), || "missing 'fingerprint' line".to_string())?;
    } else {
        ctx.require(ctx.seen("contact"), || "missing 'contact' line".to_string())?;
        ctx.require(ctx.seen("vote-digest"), || {
            "missing 'vote-digest' line".to_string()
        })?;
    }

    Ok(source)
}

/// The footer: bandwidth weights and authority signatures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footer {
    pub bandwidth_weights: BTreeMap<String, i64>,
    pub signatures: Vec<DocumentSignature>,
    /// Outcome of the cryptographic check, if one was performed
    pub verification: Option<SignatureReport>,
    unrecognized_lines: Vec<RawLine>,
}

impl Footer {
    pub fn unrecognized_lines(&self) -> &[RawLine] {
        &self.unrecognized_lines
    }
}

fn parse_bandwidth_weights(item: &Item) -> Result<BTreeMap<String, i64>, DocumentParseError> {
    item.split_arguments()
        .into_iter()
        .map(|arg| {
            let (k, v) = arg
                .split_once('=')
                .ok_or_else(|| DocumentParseError::FieldDecode {
                    field: "bandwidth-weights".to_string(),
                    reason: format!("'{arg}' is not a key=value pair"),
                })?;
            Ok((k.to_string(), v.parse::<i64>().context("bandwidth-weights")?))
        })
        .collect()
}

/// Build the footer from all items following the last router status entry
pub(crate) fn build_footer(
    items: Vec<Item>,
    ctx: &mut EntryContext,
) -> Result<Footer, DocumentParseError> {
    let mut footer = Footer::default();

    for item in items.iter() {
        match item.keyword.as_str() {
            "directory-footer" => ctx.once(item)?,
            "bandwidth-weights" => {
                ctx.once(item)?;
                footer.bandwidth_weights =
                    ctx.field(parse_bandwidth_weights(item))?.unwrap_or_default();
            }
            "directory-signature" => {
                let signature = ctx.field(signature::parse_signature(item))?;
                footer.signatures.extend(signature);
            }
            _ => ctx.unrecognized(item, &mut footer.unrecognized_lines),
        }
    }

    Ok(footer)
}
