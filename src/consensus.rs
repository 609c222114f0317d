//! Tor network-status documents (consensus, microdescriptor consensus, vote)
//!
//! Documents are parsed as a stream: [`DocumentParser`] reads the header,
//! then yields one [`RouterStatusEntry`] at a time, and only checks the
//! document as a whole (timestamp order, signatures) once the footer has
//! been reached.

use std::io::{BufReader, Read};
use std::iter::FusedIterator;

use strum::{EnumIter, EnumString, IntoStaticStr};
use tracing::{debug, trace};

use crate::capability::{CapabilityReporter, CapabilitySink};
use crate::error::DocumentParseError;
use crate::keys::KeyStore;
use crate::meta::{Item, Lexer, RawLine};

mod flag;
pub use flag::{Flag, FlagSet, Flags, KnownFlag};

mod protocol;
pub use protocol::{Protocol, Protocols, SupportedProtocolVersion};

mod header;
pub use header::{DirectorySource, Footer, Header, SharedRandomness, VotingDelay};

mod router;
pub use router::{
    Bandwidth, CondensedExitPolicy, ExitPolicyEntry, ExitPolicyType, MicrodescMethods,
    RouterStatusEntry,
};

mod signature;
pub use signature::{
    DigestAlgorithm, DocumentSignature, SignaturePolicy, SignatureReport, SignedPortionDigests,
};
use signature::SignedDigest;

/// The flavor of a network-status document, named by its `@type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, IntoStaticStr)]
pub enum Flavor {
    #[strum(serialize = "network-status-consensus-3")]
    Consensus,
    #[strum(serialize = "network-status-microdesc-consensus-3")]
    MicrodescConsensus,
    #[strum(serialize = "network-status-vote-3")]
    Vote,
}

impl Flavor {
    /// Determine the flavor from a type annotation such as
    /// `@type network-status-microdesc-consensus-3 1.0`.
    pub fn from_annotation(annotation: &str) -> Option<Flavor> {
        let mut parts = annotation.split_ascii_whitespace();
        let mut name = parts.next()?;
        if name == "@type" {
            name = parts.next()?;
        }
        name.parse().ok()
    }

    pub(crate) fn vote_status(self) -> &'static str {
        match self {
            Flavor::Vote => "vote",
            Flavor::Consensus | Flavor::MicrodescConsensus => "consensus",
        }
    }
}

/// Settings of a single parse
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub flavor: Flavor,
    /// Enforce the document grammar. Signatures are additionally checked
    /// when a key store is attached to the parser.
    pub validate: bool,
    pub signature_policy: SignaturePolicy,
    /// Flags not worth reporting to a capability sink
    pub known_flags: FlagSet,
}

impl ParseOptions {
    pub fn new(flavor: Flavor) -> Self {
        ParseOptions {
            flavor,
            validate: false,
            signature_policy: SignaturePolicy::default(),
            known_flags: FlagSet::for_flavor(flavor),
        }
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self
    }

    pub fn with_known_flags(mut self, flags: FlagSet) -> Self {
        self.known_flags = flags;
        self
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions::new(Flavor::Consensus)
    }
}

/// Per-record state shared by the entry builders.
///
/// Decides whether a bad field is fatal or simply left unset, and tracks
/// which keywords the record has seen.
pub(crate) struct EntryContext<'r, 'a> {
    pub(crate) flavor: Flavor,
    validate: bool,
    pub(crate) reporter: &'r mut CapabilityReporter<'a>,
    entry: String,
    seen: Vec<String>,
}

impl<'r, 'a> EntryContext<'r, 'a> {
    pub(crate) fn new(
        flavor: Flavor,
        validate: bool,
        reporter: &'r mut CapabilityReporter<'a>,
        entry: impl Into<String>,
    ) -> Self {
        EntryContext {
            flavor,
            validate,
            reporter,
            entry: entry.into(),
            seen: Vec::new(),
        }
    }

    /// Name the record in error messages, once its name is known
    pub(crate) fn rename(&mut self, entry: String) {
        self.entry = entry;
    }

    /// Keep a parsed field. A failure is fatal when validating, otherwise
    /// the field stays unset.
    pub(crate) fn field<T>(
        &self,
        result: Result<T, DocumentParseError>,
    ) -> Result<Option<T>, DocumentParseError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(DocumentParseError::FieldDecode { field, reason }) if self.validate => {
                Err(DocumentParseError::FieldDecode {
                    field,
                    reason: format!("{reason} (in {})", self.entry),
                })
            }
            Err(err) if self.validate => Err(err),
            Err(err) => {
                trace!(entry = %self.entry, error = %err, "leaving malformed field unset");
                Ok(None)
            }
        }
    }

    pub(crate) fn require(
        &self,
        condition: bool,
        reason: impl FnOnce() -> String,
    ) -> Result<(), DocumentParseError> {
        if self.validate && !condition {
            return Err(DocumentParseError::invalid(&self.entry, reason()));
        }
        Ok(())
    }

    /// Record a keyword that may appear at most once in this record.
    pub(crate) fn once(&mut self, item: &Item) -> Result<(), DocumentParseError> {
        if self.seen(&item.keyword) {
            self.require(false, || format!("duplicate '{}' line", item.keyword))
        } else {
            self.seen.push(item.keyword.clone());
            Ok(())
        }
    }

    pub(crate) fn seen(&self, keyword: &str) -> bool {
        self.seen.iter().any(|k| k == keyword)
    }

    pub(crate) fn unrecognized(&mut self, item: &Item, lines: &mut Vec<RawLine>) {
        let line = item.raw_line();
        self.reporter.unrecognized_line(&item.keyword, &line);
        lines.push(line);
    }
}

/// Where a [`DocumentParser`] is within its document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Nothing read yet
    Header,
    /// Header and authorities read; yielding router status entries
    Entries,
    /// Past the last entry; footer and document checks pending
    Footer,
    /// Document complete, or parsing failed
    Done,
}

fn is_footer_start(keyword: &str) -> bool {
    matches!(keyword, "directory-footer" | "directory-signature")
}

/// Streaming parser over a network-status document.
///
/// Iterating yields the router status entries in document order. The
/// header and authority sections are available once the first entry was
/// returned; the footer once the iterator is exhausted. Document-level
/// validation happens when the footer is reached, so a caller that stops
/// early never triggers it.
pub struct DocumentParser<'a, R> {
    lexer: Lexer<BufReader<R>>,
    options: ParseOptions,
    state: ParserState,
    pending: Option<Item>,
    digest: SignedDigest,
    reporter: CapabilityReporter<'a>,
    key_store: Option<&'a dyn KeyStore>,
    header: Option<Header>,
    authorities: Vec<DirectorySource>,
    footer: Option<Footer>,
    entries: usize,
}

impl<'a, R: Read> DocumentParser<'a, R> {
    pub fn new(reader: R, options: ParseOptions) -> Self {
        let reporter = CapabilityReporter::new(options.flavor, options.known_flags.clone());
        DocumentParser {
            lexer: Lexer::new(BufReader::new(reader)),
            options,
            state: ParserState::Header,
            pending: None,
            digest: SignedDigest::new(),
            reporter,
            key_store: None,
            header: None,
            authorities: Vec::new(),
            footer: None,
            entries: 0,
        }
    }

    /// Verify signatures against these keys (only when validating)
    pub fn with_key_store(mut self, key_store: &'a dyn KeyStore) -> Self {
        self.key_store = Some(key_store);
        self
    }

    /// Report unknown flags and lines to this sink
    pub fn with_capability_sink(mut self, sink: &'a mut dyn CapabilitySink) -> Self {
        self.reporter.attach(sink);
        self
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn authorities(&self) -> &[DirectorySource] {
        &self.authorities
    }

    pub fn footer(&self) -> Option<&Footer> {
        self.footer.as_ref()
    }

    /// Read the remaining document into a [`Consensus`].
    pub fn into_consensus(mut self) -> Result<Consensus, DocumentParseError> {
        let mut relays = Vec::new();
        for entry in self.by_ref() {
            relays.push(entry?);
        }
        let flavor = self.options.flavor;
        Ok(Consensus {
            header: self.header.unwrap_or_else(|| Header::new(flavor)),
            authorities: self.authorities,
            relays,
            footer: self.footer.unwrap_or_default(),
        })
    }

    fn read_item(&mut self) -> Result<Option<Item>, DocumentParseError> {
        let item = self.lexer.next_item()?;
        if let Some(item) = &item {
            if self.options.validate && self.key_store.is_some() {
                self.digest.update(item);
            }
        }
        Ok(item)
    }

    fn take_item(&mut self) -> Result<Option<Item>, DocumentParseError> {
        match self.pending.take() {
            Some(item) => Ok(Some(item)),
            None => self.read_item(),
        }
    }

    fn peek_keyword(&mut self) -> Result<Option<String>, DocumentParseError> {
        if self.pending.is_none() {
            self.pending = self.read_item()?;
        }
        Ok(self.pending.as_ref().map(|item| item.keyword.clone()))
    }

    /// Take the next item plus everything up to (excluding) an item whose
    /// keyword satisfies `stop`.
    fn collect_group(&mut self, stop: fn(&str) -> bool) -> Result<Vec<Item>, DocumentParseError> {
        let mut items = Vec::new();
        items.extend(self.take_item()?);
        while let Some(keyword) = self.peek_keyword()? {
            if stop(&keyword) {
                break;
            }
            items.extend(self.take_item()?);
        }
        Ok(items)
    }

    fn context(&mut self, entry: impl Into<String>) -> EntryContext<'_, 'a> {
        EntryContext::new(
            self.options.flavor,
            self.options.validate,
            &mut self.reporter,
            entry,
        )
    }

    fn read_header(&mut self) -> Result<(), DocumentParseError> {
        let mut annotations = Vec::new();
        let mut items = Vec::new();
        while let Some(keyword) = self.peek_keyword()? {
            if keyword == "dir-source" || keyword == "r" || is_footer_start(&keyword) {
                break;
            }
            if let Some(item) = self.take_item()? {
                if items.is_empty() && item.is_annotation() {
                    annotations.push(item.raw_line().to_string_lossy());
                } else {
                    items.push(item);
                }
            }
        }
        let header = header::build_header(annotations, items, &mut self.context("header"))?;
        self.header = Some(header);

        while self.peek_keyword()?.as_deref() == Some("dir-source") {
            let items = self.collect_group(|k| k == "dir-source" || k == "r" || is_footer_start(k))?;
            let line = items.first().map_or(0, |item| item.line);
            let mut ctx = self.context(format!("directory authority at line {line}"));
            let source = header::build_directory_source(items, &mut ctx)?;
            self.authorities.push(source);
        }
        debug!(authorities = self.authorities.len(), "read document header");
        Ok(())
    }

    fn read_router(&mut self) -> Result<Option<RouterStatusEntry>, DocumentParseError> {
        if self.peek_keyword()?.as_deref() != Some("r") {
            return Ok(None);
        }
        let items = self.collect_group(|k| k == "r" || is_footer_start(k))?;
        let line = items.first().map_or(0, |item| item.line);
        let mut ctx = self.context(format!("router status entry at line {line}"));
        let entry = router::build_router(items, &mut ctx)?;
        self.entries += 1;
        Ok(Some(entry))
    }

    fn read_footer(&mut self) -> Result<(), DocumentParseError> {
        let mut items = Vec::new();
        while let Some(item) = self.take_item()? {
            items.push(item);
        }
        let footer = header::build_footer(items, &mut self.context("footer"))?;
        self.footer = Some(footer);
        Ok(())
    }

    /// Checks that need the complete document
    fn check_document(&mut self) -> Result<(), DocumentParseError> {
        if !self.options.validate {
            return Ok(());
        }
        if let Some(header) = &self.header {
            header.check_timestamps()?;
        }
        let key_store = match self.key_store {
            Some(key_store) => key_store,
            None => return Ok(()),
        };
        let footer = self.footer.get_or_insert_with(Footer::default);
        if footer.signatures.is_empty() {
            return Err(DocumentParseError::invalid(
                "footer",
                "no directory signatures to verify",
            ));
        }
        let digests = self.digest.digests().ok_or_else(|| {
            DocumentParseError::invalid("footer", "signed portion never ended")
        })?;
        let report = signature::verify_signatures(
            &footer.signatures,
            digests,
            key_store,
            self.options.signature_policy,
        )?;
        debug!(
            verified = report.verified.len(),
            required = report.required,
            "document signatures verified"
        );
        footer.verification = Some(report);
        Ok(())
    }

    fn transition(&mut self, next: ParserState) {
        debug!(from = ?self.state, to = ?next, entries = self.entries, "parser state change");
        self.state = next;
    }

    fn advance(&mut self) -> Result<Option<RouterStatusEntry>, DocumentParseError> {
        loop {
            match self.state {
                ParserState::Header => {
                    self.read_header()?;
                    self.transition(ParserState::Entries);
                }
                ParserState::Entries => match self.read_router()? {
                    Some(entry) => return Ok(Some(entry)),
                    None => self.transition(ParserState::Footer),
                },
                ParserState::Footer => {
                    self.read_footer()?;
                    self.check_document()?;
                    self.transition(ParserState::Done);
                }
                ParserState::Done => return Ok(None),
            }
        }
    }
}

impl<'a, R: Read> Iterator for DocumentParser<'a, R> {
    type Item = Result<RouterStatusEntry, DocumentParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                self.transition(ParserState::Done);
                Some(Err(err))
            }
        }
    }
}

impl<'a, R: Read> FusedIterator for DocumentParser<'a, R> {}

/// A fully parsed network-status document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consensus {
    pub header: Header,
    pub authorities: Vec<DirectorySource>,
    pub relays: Vec<RouterStatusEntry>,
    pub footer: Footer,
}

impl Consensus {
    /// Parse a whole document from a reader.
    ///
    /// Signatures are not checked; use a [`DocumentParser`] with a key
    /// store for that.
    pub fn parse<R: Read>(reader: R, options: ParseOptions) -> Result<Consensus, DocumentParseError> {
        DocumentParser::new(reader, options).into_consensus()
    }

    /// Parse and validate a document from raw text.
    pub fn from_str(text: impl AsRef<str>, flavor: Flavor) -> Result<Consensus, DocumentParseError> {
        Self::parse(
            text.as_ref().as_bytes(),
            ParseOptions::new(flavor).with_validation(true),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("@type network-status-consensus-3 1.0", Some(Flavor::Consensus))]
    #[case("@type network-status-microdesc-consensus-3 1.0", Some(Flavor::MicrodescConsensus))]
    #[case("network-status-vote-3 1.0", Some(Flavor::Vote))]
    #[case("@type server-descriptor 1.0", None)]
    #[case("", None)]
    fn flavor_from_annotation(#[case] annotation: &str, #[case] flavor: Option<Flavor>) {
        assert_eq!(Flavor::from_annotation(annotation), flavor);
    }

    #[test]
    fn options_default_to_lenient() {
        let options = ParseOptions::new(Flavor::Consensus);
        assert!(!options.validate);
        assert_eq!(options.signature_policy, SignaturePolicy::Majority);
        assert!(options.known_flags.contains(&Flag::new("Valid")));
    }

    #[test]
    fn empty_input_yields_nothing_without_validation() {
        let mut parser = DocumentParser::new(&b""[..], ParseOptions::new(Flavor::Consensus));
        assert!(parser.next().is_none());
        assert_eq!(parser.state(), ParserState::Done);
        assert!(parser.header().is_some());
    }

    #[test]
    fn empty_input_fails_validation() {
        let options = ParseOptions::new(Flavor::Consensus).with_validation(true);
        let mut parser = DocumentParser::new(&b""[..], options);
        assert!(matches!(
            parser.next(),
            Some(Err(DocumentParseError::Validation { .. }))
        ));
        assert!(parser.next().is_none());
    }

    const SIGNED: &[u8] = b"network-status-version 3\ndirectory-signature AA BB\n";

    #[test]
    fn signed_portion_is_only_hashed_for_verification() {
        let mut parser = DocumentParser::new(SIGNED, ParseOptions::new(Flavor::Consensus));
        assert!(parser.next().is_none());
        assert!(parser.digest.digests().is_none());

        let keys = crate::keys::KeyRing::new();
        let mut parser = DocumentParser::new(SIGNED, ParseOptions::new(Flavor::Consensus))
            .with_key_store(&keys);
        assert!(parser.next().is_none());
        assert!(parser.digest.digests().is_none());

        let options = ParseOptions::new(Flavor::Consensus).with_validation(true);
        let mut parser = DocumentParser::new(SIGNED, options).with_key_store(&keys);
        assert!(matches!(parser.next(), Some(Err(_))));
        assert!(parser.digest.digests().is_some());
    }
}
