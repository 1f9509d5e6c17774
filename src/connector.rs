//! Connector kinds, data formats and the compatibility rules used when wiring.

use crate::error::{GraphError, Result};
use crate::node::NodeId;
use crate::roi::Roi;
use crate::token::Token;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    /// Consumes the buffer of a producer node
    Read,
    /// Produces a buffer for downstream nodes
    Write,
    /// Produces a buffer filled from external data once per build
    Source,
    /// Consumes a buffer and hands it to an external consumer
    Sink,
}

impl ConnectorKind {
    pub fn is_input(self) -> bool {
        matches!(self, ConnectorKind::Read | ConnectorKind::Sink)
    }

    pub fn is_output(self) -> bool {
        matches!(self, ConnectorKind::Write | ConnectorKind::Source)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ConnectorKind::Read => "read",
            ConnectorKind::Write => "write",
            ConnectorKind::Source => "source",
            ConnectorKind::Sink => "sink",
        }
    }
}

/// Element format of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Ui8,
    Ui16,
    Ui32,
    F16,
    F32,
    /// Resolved from the producer on connect
    #[serde(rename = "*")]
    Any,
}

impl Format {
    /// Bytes per channel element
    pub fn bytes(self) -> usize {
        match self {
            Format::Ui8 | Format::Any => 1,
            Format::Ui16 | Format::F16 => 2,
            Format::Ui32 | Format::F32 => 4,
        }
    }

    pub fn parse(s: &str) -> Option<Format> {
        match s {
            "ui8" => Some(Format::Ui8),
            "ui16" => Some(Format::Ui16),
            "ui32" => Some(Format::Ui32),
            "f16" => Some(Format::F16),
            "f32" => Some(Format::F32),
            "*" => Some(Format::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Format::Ui8 => "ui8",
            Format::Ui16 => "ui16",
            Format::Ui32 => "ui32",
            Format::F16 => "f16",
            Format::F32 => "f32",
            Format::Any => "*",
        }
    }

    fn accepts(self, other: Format) -> bool {
        self == other || self == Format::Any || other == Format::Any
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SSBO: Token = Token::from_static("ssbo");
const RGGB: Token = Token::from_static("rggb");

/// Number of channels a tag describes; `None` for the wildcard.
///
/// Storage buffers and Bayer mosaics are single-plane, every other tag is one
/// letter per channel.
pub fn channel_count(chan: Token) -> Option<usize> {
    if chan.is_wildcard() {
        None
    } else if chan == SSBO || chan == RGGB {
        Some(1)
    } else {
        Some(chan.len())
    }
}

/// Bytes per pixel for a channel tag and format
pub fn element_size(chan: Token, format: Format) -> usize {
    channel_count(chan).unwrap_or(1) * format.bytes()
}

/// Where a consumer connector gets its data from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerRef {
    pub node: NodeId,
    pub connector: usize,
    /// Read the producer's previous-frame generation
    pub feedback: bool,
}

/// Connector declaration used when adding a node
#[derive(Debug, Clone, Copy)]
pub struct ConnectorDecl {
    pub name: &'static str,
    pub kind: ConnectorKind,
    pub chan: Token,
    pub format: Format,
    /// `None` inherits the producer's ROI on connect
    pub roi: Option<Roi>,
}

impl ConnectorDecl {
    pub fn read(name: &'static str, chan: Token, format: Format, roi: Option<Roi>) -> Self {
        Self { name, kind: ConnectorKind::Read, chan, format, roi }
    }

    pub fn write(name: &'static str, chan: Token, format: Format, roi: Roi) -> Self {
        Self { name, kind: ConnectorKind::Write, chan, format, roi: Some(roi) }
    }

    pub fn source(name: &'static str, chan: Token, format: Format, roi: Roi) -> Self {
        Self { name, kind: ConnectorKind::Source, chan, format, roi: Some(roi) }
    }

    pub fn sink(name: &'static str, chan: Token, format: Format) -> Self {
        Self { name, kind: ConnectorKind::Sink, chan, format, roi: None }
    }
}

/// A resolved node connector
#[derive(Debug, Clone)]
pub struct Connector {
    pub name: Token,
    pub kind: ConnectorKind,
    pub chan: Token,
    pub format: Format,
    pub roi: Option<Roi>,
    pub producer: Option<ProducerRef>,
    /// Set when a consumer reads this output through a feedback edge
    pub keep_history: bool,
}

impl Connector {
    pub fn from_decl(decl: &ConnectorDecl) -> Result<Self> {
        Ok(Self {
            name: Token::new(decl.name)?,
            kind: decl.kind,
            chan: decl.chan,
            format: decl.format,
            roi: decl.roi,
            producer: None,
            keep_history: false,
        })
    }

    /// Buffer size in bytes, once the ROI is resolved
    pub fn byte_size(&self) -> Option<usize> {
        self.roi
            .map(|roi| roi.pixels() * element_size(self.chan, self.format))
    }

    pub fn is_connected(&self) -> bool {
        self.producer.is_some()
    }
}

/// Check that data described by `(producer kind, chan, format)` may flow into
/// a consumer described the same way. Returns the reason on mismatch.
pub fn check_compatible(
    producer: (ConnectorKind, Token, Format),
    consumer: (ConnectorKind, Token, Format),
) -> std::result::Result<(), String> {
    let (p_kind, p_chan, p_format) = producer;
    let (c_kind, c_chan, c_format) = consumer;

    if !p_kind.is_output() {
        return Err(format!("producer is a {} connector", p_kind.as_str()));
    }
    if !c_kind.is_input() {
        return Err(format!("consumer is a {} connector", c_kind.as_str()));
    }
    if !p_format.accepts(c_format) {
        return Err(format!("format {} does not match {}", p_format, c_format));
    }
    match (channel_count(p_chan), channel_count(c_chan)) {
        (Some(p), Some(c)) if p != c => Err(format!(
            "channels {} ({}) do not match {} ({})",
            p_chan, p, c_chan, c
        )),
        _ => Ok(()),
    }
}

/// Same as [`check_compatible`] but producing a wiring error with names
pub fn ensure_compatible(
    producer_name: impl FnOnce() -> String,
    producer: &Connector,
    consumer_name: impl FnOnce() -> String,
    consumer: &Connector,
) -> Result<()> {
    check_compatible(
        (producer.kind, producer.chan, producer.format),
        (consumer.kind, consumer.chan, consumer.format),
    )
    .map_err(|reason| GraphError::IncompatibleConnection {
        producer: producer_name(),
        consumer: consumer_name(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Token {
        Token::new(s).unwrap()
    }

    #[test]
    fn test_channel_count() {
        assert_eq!(channel_count(tok("rgba")), Some(4));
        assert_eq!(channel_count(tok("rggb")), Some(1));
        assert_eq!(channel_count(tok("ssbo")), Some(1));
        assert_eq!(channel_count(tok("*")), None);
        assert_eq!(element_size(tok("rgba"), Format::F32), 16);
    }

    #[test]
    fn test_compatible() {
        let w = |chan| (ConnectorKind::Write, tok(chan), Format::F32);
        let r = ConnectorKind::Read;
        assert!(check_compatible(w("rgba"), (r, tok("rgba"), Format::F32)).is_ok());
        assert!(check_compatible(w("rgb"), (r, tok("yuv"), Format::F32)).is_ok());
        assert!(check_compatible(w("rgba"), (r, tok("*"), Format::Any)).is_ok());
        assert!(check_compatible(
            (ConnectorKind::Source, tok("ssbo"), Format::F16),
            (ConnectorKind::Sink, tok("ssbo"), Format::F16)
        )
        .is_ok());
    }

    #[test]
    fn test_incompatible() {
        let w = ConnectorKind::Write;
        let r = ConnectorKind::Read;
        let rgba = (w, tok("rgba"), Format::F32);
        let err = check_compatible(rgba, (r, tok("rgba"), Format::F16)).unwrap_err();
        assert!(err.contains("format"));
        let err = check_compatible(rgba, (r, tok("rg"), Format::F32)).unwrap_err();
        assert!(err.contains("channels"));
        assert!(check_compatible((r, tok("r"), Format::Ui8), (r, tok("r"), Format::Ui8)).is_err());
        assert!(check_compatible((w, tok("r"), Format::Ui8), (w, tok("r"), Format::Ui8)).is_err());
    }
}
