//! The generic meta format shared by all Tor directory documents.
//!
//! A document is a sequence of items. Each item is a keyword line
//! (`Keyword SP Arguments NL`), optionally followed by a single object
//! enclosed in `-----BEGIN <label>-----` / `-----END <label>-----` lines.
//! See section 1.2 of dir-spec.

use std::fmt;
use std::io::{self, BufRead};

use chrono::{offset::TimeZone, DateTime, NaiveDateTime, Utc};
use nom::bytes::complete::{tag, take_until, take_while1};
use nom::character::complete::space1;
use nom::combinator::{eof, opt, rest};
use nom::sequence::{delimited, preceded, terminated};
use nom::IResult;

use crate::error::DocumentParseError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a `YYYY-MM-DD HH:MM:SS` timestamp (always UTC).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::format::ParseError> {
    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Format a timestamp the way it appears in directory documents.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Why a digest could not be decoded
#[derive(thiserror::Error, Debug)]
pub enum DigestDecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid hex string")]
    Hex,
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// A fixed-length digest, such as a relay fingerprint or a descriptor digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest<const N: usize>([u8; N]);

/// A SHA-1 based identity fingerprint or descriptor digest
pub type Fingerprint = Digest<20>;

/// A SHA-256 digest, e.g. of a microdescriptor
pub type Digest256 = Digest<32>;

impl<const N: usize> Digest<N> {
    pub fn from_u8(bytes: &[u8]) -> Result<Self, DigestDecodeError> {
        let array: [u8; N] = bytes.try_into().map_err(|_| DigestDecodeError::Length {
            expected: N,
            actual: bytes.len(),
        })?;
        Ok(Digest(array))
    }

    /// Decode from base64, where trailing padding is optional.
    pub fn from_str_b64(s: &str) -> Result<Self, DigestDecodeError> {
        let raw = base64::decode_config(s.trim_end_matches('='), base64::STANDARD_NO_PAD)?;
        Self::from_u8(&raw)
    }

    pub fn from_str_hex(s: &str) -> Result<Self, DigestDecodeError> {
        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(DigestDecodeError::Hex);
        }
        let raw = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| DigestDecodeError::Hex)?;
        Self::from_u8(&raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base64 without padding, as used in router status entries
    pub fn to_b64(&self) -> String {
        base64::encode_config(self.0, base64::STANDARD_NO_PAD)
    }
}

impl<const N: usize> fmt::Display for Digest<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for Digest<N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// The exact bytes of an item as found in the document, without the
/// terminating newline of its last line.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawLine(Vec<u8>);

impl RawLine {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The first whitespace-delimited token of the raw bytes (`opt` for
    /// prefixed items)
    pub fn keyword(&self) -> String {
        let end = memchr::memchr2(b' ', b'\t', &self.0)
            .or_else(|| memchr::memchr(b'\n', &self.0))
            .unwrap_or(self.0.len());
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for RawLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawLine({:?})", self.to_string_lossy())
    }
}

/// An object attached to an item (signature, key, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub label: String,
    pub data: Vec<u8>,
}

/// A single item of a Tor document
#[derive(Debug, Clone)]
pub struct Item {
    pub keyword: String,
    pub arguments: Option<String>,
    pub object: Option<Object>,
    /// Line number (1-based) of the keyword line
    pub line: usize,
    raw: Vec<u8>,
}

impl Item {
    pub fn is_annotation(&self) -> bool {
        self.keyword.starts_with('@')
    }

    pub fn arguments(&self) -> &str {
        self.arguments.as_deref().unwrap_or("")
    }

    pub fn split_arguments(&self) -> Vec<&str> {
        self.arguments().split_ascii_whitespace().collect()
    }

    /// The full argument string, which must not be empty
    pub fn get_argument(&self) -> Result<&str, DocumentParseError> {
        match self.arguments.as_deref().map(str::trim) {
            Some(arg) if !arg.is_empty() => Ok(arg),
            _ => Err(DocumentParseError::args_missing(&self.keyword)),
        }
    }

    /// All bytes this item spans, including line terminators
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_line(&self) -> RawLine {
        let mut raw = self.raw.clone();
        if raw.last() == Some(&b'\n') {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }
        RawLine(raw)
    }
}

fn is_keyword_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-'
}

/// `Keyword [SP Arguments]`, spanning the whole line
fn keyword_line(input: &[u8]) -> IResult<&[u8], (&[u8], Option<&[u8]>)> {
    let (input, keyword) = take_while1(is_keyword_char)(input)?;
    let (input, arguments) = terminated(opt(preceded(space1, rest)), eof)(input)?;
    Ok((input, (keyword, arguments)))
}

/// `@annotation [SP Arguments]`
fn annotation_line(input: &[u8]) -> IResult<&[u8], (&[u8], Option<&[u8]>)> {
    let (input, _) = tag("@")(input)?;
    keyword_line(input)
}

fn begin_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(delimited(tag("-----BEGIN "), take_until("-----"), tag("-----")), eof)(input)
}

fn end_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(delimited(tag("-----END "), take_until("-----"), tag("-----")), eof)(input)
}

fn strip_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// A physical line read from the stream
struct Line {
    bytes: Vec<u8>,
    number: usize,
}

/// Lazily splits a byte stream into items.
///
/// Only the item currently being assembled is buffered.
pub(crate) struct Lexer<R> {
    reader: R,
    line_number: usize,
    peeked: Option<Line>,
}

impl<R: BufRead> Lexer<R> {
    pub(crate) fn new(reader: R) -> Self {
        Lexer {
            reader,
            line_number: 0,
            peeked: None,
        }
    }

    fn read_line(&mut self) -> io::Result<Option<Line>> {
        if let Some(line) = self.peeked.take() {
            return Ok(Some(line));
        }
        let mut bytes = Vec::new();
        if self.reader.read_until(b'\n', &mut bytes)? == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        Ok(Some(Line {
            bytes,
            number: self.line_number,
        }))
    }

    /// Read the next item, or `None` at the end of the stream.
    pub(crate) fn next_item(&mut self) -> Result<Option<Item>, DocumentParseError> {
        let line = match self.read_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        let content = strip_newline(&line.bytes);

        if content.first() == Some(&b'@') {
            let (_, (keyword, arguments)) = annotation_line(content)
                .map_err(|_| DocumentParseError::malformed(line.number, "invalid annotation"))?;
            return Ok(Some(Item {
                keyword: format!("@{}", to_text(keyword)),
                arguments: arguments.map(to_text),
                object: None,
                line: line.number,
                raw: line.bytes,
            }));
        }

        // Old documents prefix some items with "opt"
        let unwrapped = content.strip_prefix(b"opt ").unwrap_or(content);
        let (keyword, arguments) = match keyword_line(unwrapped) {
            Ok((_, (keyword, arguments))) => (to_text(keyword), arguments.map(to_text)),
            Err(_) if content.is_empty() => {
                return Err(DocumentParseError::malformed(line.number, "empty line"))
            }
            Err(_) => {
                return Err(DocumentParseError::malformed(
                    line.number,
                    format!("no keyword in '{}'", to_text(content)),
                ))
            }
        };

        let mut raw = line.bytes;
        let object = self.read_object(&mut raw)?;

        Ok(Some(Item {
            keyword,
            arguments,
            object,
            line: line.number,
            raw,
        }))
    }

    /// Read the object following a keyword line, if there is one.
    fn read_object(&mut self, raw: &mut Vec<u8>) -> Result<Option<Object>, DocumentParseError> {
        let begin = match self.read_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        let label = match begin_line(strip_newline(&begin.bytes)) {
            Ok((_, label)) => to_text(label),
            Err(_) => {
                self.peeked = Some(begin);
                return Ok(None);
            }
        };
        let start = begin.number;
        raw.extend_from_slice(&begin.bytes);

        let mut body = String::new();
        loop {
            let line = self.read_line()?.ok_or_else(|| {
                DocumentParseError::malformed(start, format!("unterminated '{label}' object"))
            })?;
            raw.extend_from_slice(&line.bytes);
            let content = strip_newline(&line.bytes);
            if let Ok((_, end_label)) = end_line(content) {
                if end_label != label.as_bytes() {
                    return Err(DocumentParseError::malformed(
                        line.number,
                        format!("object '{label}' closed as '{}'", to_text(end_label)),
                    ));
                }
                break;
            }
            body.push_str(&to_text(content));
        }

        let data = base64::decode_config(body.trim_end_matches('='), base64::STANDARD_NO_PAD)
            .map_err(|err| {
                DocumentParseError::malformed(start, format!("'{label}' object: {err}"))
            })?;
        Ok(Some(Object { label, data }))
    }
}
