//! A streaming parser for Tor network-status documents.
//!
//! This crate parses the consensus, microdescriptor consensus and vote
//! flavors of network-status documents as specified in
//! [dir-spec](https://gitlab.torproject.org/tpo/core/torspec/-/blob/main/dir-spec.txt).
//! Router status entries are produced one at a time by a
//! [`DocumentParser`], so arbitrarily large documents can be processed
//! without holding them in memory. With validation enabled, the document
//! grammar is enforced and, given a [`keys::KeyStore`], the authority
//! signatures are checked.
//!
//! ```no_run
//! use tordoc_netstatus::{DocumentParser, Flavor, ParseOptions};
//!
//! let file = std::fs::File::open("cached-consensus").unwrap();
//! let options = ParseOptions::new(Flavor::Consensus).with_validation(true);
//! for entry in DocumentParser::new(file, options) {
//!     let entry = entry.unwrap();
//!     println!("{:?} {:?}", entry.nickname, entry.flags);
//! }
//! ```

pub mod capability;
pub use capability::CapabilitySink;

pub mod consensus;
#[doc(inline)]
pub use consensus::{Consensus, DocumentParser, Flavor, ParseOptions};

pub mod error;
pub use error::DocumentParseError;

pub mod keys;

pub mod meta;
pub use meta::Fingerprint;
