//! Reporting of flags and lines that the parser does not know about.
//!
//! Authorities introduce new flags and new lines over time. The parser
//! never rejects them; instead each new one is handed to a
//! [`CapabilitySink`] supplied by the caller.

use std::collections::HashSet;

use crate::consensus::{Flag, FlagSet, Flavor};
use crate::meta::RawLine;

/// Receiver of newly observed capabilities.
///
/// Within a single parse, the parser calls this at most once per
/// `(kind, suppression_key)` pair. Deduplication across parses is up to
/// the implementor.
pub trait CapabilitySink {
    fn register_new_capability(&mut self, kind: &str, value: &str, suppression_key: &str);
}

impl<F> CapabilitySink for F
where
    F: FnMut(&str, &str, &str),
{
    fn register_new_capability(&mut self, kind: &str, value: &str, suppression_key: &str) {
        self(kind, value, suppression_key)
    }
}

/// A single registered capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub kind: String,
    pub value: String,
    pub suppression_key: String,
}

/// Sink that simply records every registration
#[derive(Debug, Default, Clone)]
pub struct CapabilityLog {
    pub entries: Vec<Capability>,
}

impl CapabilitySink for CapabilityLog {
    fn register_new_capability(&mut self, kind: &str, value: &str, suppression_key: &str) {
        self.entries.push(Capability {
            kind: kind.to_string(),
            value: value.to_string(),
            suppression_key: suppression_key.to_string(),
        });
    }
}

impl Flavor {
    pub(crate) fn flag_capability_kind(self) -> &'static str {
        match self {
            Flavor::Consensus => "Flag",
            Flavor::MicrodescConsensus => "Flag (microdescriptor)",
            Flavor::Vote => "Flag (vote)",
        }
    }

    pub(crate) fn line_capability_kind(self) -> &'static str {
        match self {
            Flavor::Consensus => "Consensus Line",
            Flavor::MicrodescConsensus => "Microdescriptor Consensus Line",
            Flavor::Vote => "Vote Line",
        }
    }
}

/// Per-parse deduplicating front of a [`CapabilitySink`]
pub(crate) struct CapabilityReporter<'a> {
    sink: Option<&'a mut dyn CapabilitySink>,
    flavor: Flavor,
    known_flags: FlagSet,
    reported: HashSet<(&'static str, String)>,
}

impl<'a> CapabilityReporter<'a> {
    pub(crate) fn new(flavor: Flavor, known_flags: FlagSet) -> Self {
        CapabilityReporter {
            sink: None,
            flavor,
            known_flags,
            reported: HashSet::new(),
        }
    }

    pub(crate) fn attach(&mut self, sink: &'a mut dyn CapabilitySink) {
        self.sink = Some(sink);
    }

    fn report(&mut self, kind: &'static str, value: &str, suppression_key: &str) {
        let sink = match self.sink.as_mut() {
            Some(sink) => sink,
            None => return,
        };
        if self.reported.insert((kind, suppression_key.to_string())) {
            tracing::debug!(kind, value, "new capability");
            sink.register_new_capability(kind, value, suppression_key);
        }
    }

    pub(crate) fn flag(&mut self, flag: &Flag) {
        if !self.known_flags.contains(flag) {
            let kind = self.flavor.flag_capability_kind();
            self.report(kind, flag.as_str(), flag.as_str());
        }
    }

    /// `keyword` is the item keyword, with any `opt` prefix removed
    pub(crate) fn unrecognized_line(&mut self, keyword: &str, line: &RawLine) {
        let kind = self.flavor.line_capability_kind();
        self.report(kind, &line.to_string_lossy(), keyword);
    }
}
