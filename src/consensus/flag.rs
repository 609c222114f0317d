//! Relay flags as an open set

use std::collections::BTreeSet;
use std::fmt;

use strum::{EnumIter, EnumString, EnumVariantNames, IntoEnumIterator, IntoStaticStr, VariantNames};

use super::Flavor;

/// A relay flag that Tor authorities assign or have assigned in the past
#[derive(
    Debug, Clone, Copy, EnumString, EnumVariantNames, EnumIter, IntoStaticStr, PartialEq, Eq, Hash,
)]
pub enum KnownFlag {
    Authority,
    BadDirectory,
    BadExit,
    Exit,
    Fast,
    Guard,
    HSDir,
    MiddleOnly,
    Named,
    NoEdConsensus,
    Running,
    Stable,
    StaleDesc,
    Sybil,
    Unnamed,
    V2Dir,
    Valid,
}

impl KnownFlag {
    pub fn known_flags_string() -> String {
        KnownFlag::VARIANTS.join(" ")
    }
}

/// A relay flag as listed on an `s` or `known-flags` line.
///
/// Any string is a valid flag; unknown flags are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Flag(String);

impl Flag {
    pub fn new(name: impl Into<String>) -> Self {
        Flag(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn known(&self) -> Option<KnownFlag> {
        self.0.parse().ok()
    }
}

impl From<KnownFlag> for Flag {
    fn from(flag: KnownFlag) -> Self {
        let name: &'static str = flag.into();
        Flag(name.to_string())
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The flags of a router status entry: deduplicated, in listing order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags(Vec<Flag>);

impl Flags {
    /// Add a flag unless already present. Returns whether it was new.
    pub fn insert(&mut self, flag: Flag) -> bool {
        if self.0.contains(&flag) {
            return false;
        }
        self.0.push(flag);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|f| f.as_str() == name)
    }

    pub fn has(&self, flag: KnownFlag) -> bool {
        let name: &'static str = flag.into();
        self.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Flags {
    type Item = &'a Flag;
    type IntoIter = std::slice::Iter<'a, Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A configurable set of flags considered well-known, i.e. not worth
/// reporting as a new capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSet(BTreeSet<String>);

impl FlagSet {
    pub fn empty() -> Self {
        FlagSet(BTreeSet::new())
    }

    /// Every [`KnownFlag`]
    pub fn tor_defaults() -> Self {
        FlagSet(
            KnownFlag::iter()
                .map(|f| <&'static str>::from(f).to_string())
                .collect(),
        )
    }

    /// The default set for a document flavor.
    ///
    /// All flavors currently share [`FlagSet::tor_defaults`]; flags are
    /// assigned by the same authorities regardless of the flavor.
    pub fn for_flavor(_flavor: Flavor) -> Self {
        Self::tor_defaults()
    }

    pub fn insert(&mut self, flag: impl Into<String>) {
        self.0.insert(flag.into());
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag.as_str())
    }
}

impl<S: Into<String>> FromIterator<S> for FlagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        FlagSet(iter.into_iter().map(Into::into).collect())
    }
}
