//! Zero-initialised node buffers with typed views.

use bytemuck::{cast_slice, cast_slice_mut};

use crate::connector::{element_size, Connector, Format};
use crate::roi::Roi;
use crate::token::Token;

/// Backing store of one output connector. Storage is word aligned so the
/// typed views below never fail.
#[derive(Debug, Clone)]
pub struct Buffer {
    words: Vec<u32>,
    len: usize,
    pub roi: Roi,
    pub chan: Token,
    pub format: Format,
}

impl Buffer {
    pub fn new(roi: Roi, chan: Token, format: Format) -> Self {
        let len = roi.pixels() * element_size(chan, format);
        Self {
            words: vec![0; len.div_ceil(4)],
            len,
            roi,
            chan,
            format,
        }
    }

    /// Allocate for a connector whose ROI has been resolved
    pub fn for_connector(connector: &Connector) -> Option<Self> {
        connector
            .roi
            .map(|roi| Self::new(roi, connector.chan, connector.format))
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &cast_slice(&self.words)[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut cast_slice_mut(&mut self.words)[..self.len]
    }

    pub fn as_u16(&self) -> &[u16] {
        &cast_slice(&self.words)[..self.len / 2]
    }

    pub fn as_u16_mut(&mut self) -> &mut [u16] {
        &mut cast_slice_mut(&mut self.words)[..self.len / 2]
    }

    pub fn as_f32(&self) -> &[f32] {
        &cast_slice(&self.words)[..self.len / 4]
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        &mut cast_slice_mut(&mut self.words)[..self.len / 4]
    }

    /// Overwrite with another buffer of the same size
    pub fn copy_from(&mut self, other: &Buffer) {
        if self.len == other.len {
            self.words.copy_from_slice(&other.words);
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_and_views() {
        let chan = Token::new("rgba").unwrap();
        let mut buf = Buffer::new(Roi::full(3, 2), chan, Format::F32);
        assert_eq!(buf.len(), 3 * 2 * 16);
        assert!(buf.bytes().iter().all(|&b| b == 0));

        buf.as_f32_mut()[5] = 1.5;
        assert_eq!(buf.as_f32().len(), 24);
        assert_eq!(buf.as_f32()[5], 1.5);
    }

    #[test]
    fn test_odd_byte_length() {
        let chan = Token::new("r").unwrap();
        let mut buf = Buffer::new(Roi::full(3, 1), chan, Format::Ui8);
        assert_eq!(buf.len(), 3);
        buf.bytes_mut().copy_from_slice(&[1, 2, 3]);
        assert_eq!(buf.bytes(), &[1, 2, 3]);
        buf.clear();
        assert_eq!(buf.bytes(), &[0, 0, 0]);
    }
}
