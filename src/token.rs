//! Interned short identifiers.
//!
//! Module kinds, instance names, kernel names, connector names and channel
//! tags are all short ASCII words. A `Token` packs up to eight bytes into a
//! `u64`, so validation happens once when the token is created and every
//! later comparison is an integer compare.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier is {0} bytes long, at most {max} allowed", max = Token::MAX_LEN)]
    TooLong(usize),

    #[error("identifier contains invalid byte 0x{0:02x}")]
    InvalidByte(u8),
}

/// Packed identifier of at most [`Token::MAX_LEN`] ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub const MAX_LEN: usize = 8;

    /// Matches any channel layout when used as a channel tag.
    pub const WILDCARD: Token = Token::from_static("*");

    /// Build a token from a literal. Meant for `const` items, where an
    /// invalid literal is a compile error.
    pub const fn from_static(s: &'static str) -> Token {
        match Self::pack(s.as_bytes()) {
            Ok(token) => token,
            Err(_) => panic!("invalid token literal"),
        }
    }

    /// Validate and pack a runtime string
    pub fn new(s: &str) -> Result<Token, TokenError> {
        Self::pack(s.as_bytes())
    }

    const fn pack(bytes: &[u8]) -> Result<Token, TokenError> {
        if bytes.is_empty() {
            return Err(TokenError::Empty);
        }
        if bytes.len() > Self::MAX_LEN {
            return Err(TokenError::TooLong(bytes.len()));
        }
        let mut value = 0u64;
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if !is_token_byte(c) {
                return Err(TokenError::InvalidByte(c));
            }
            value |= (c as u64) << (8 * i);
            i += 1;
        }
        Ok(Token(value))
    }

    /// Number of bytes in the identifier
    pub fn len(self) -> usize {
        Self::MAX_LEN - (self.0.leading_zeros() as usize / 8)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_wildcard(self) -> bool {
        self == Self::WILDCARD
    }

    fn bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

const fn is_token_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'*' || c == b'.'
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.bytes();
        // only ASCII ever gets packed
        let s = std::str::from_utf8(&bytes[..self.len()]).map_err(|_| fmt::Error)?;
        f.write_str(s)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

impl TryFrom<&str> for Token {
    type Error = TokenError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Token::new(s)
    }
}

impl PartialEq<&str> for Token {
    fn eq(&self, other: &&str) -> bool {
        Token::new(other).map_or(false, |t| t == *self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: Token = Token::from_static("input");

    #[test]
    fn test_token_round_trip() {
        let t = Token::new("assemble").unwrap();
        assert_eq!(t.to_string(), "assemble");
        assert_eq!(t.len(), 8);
        assert_eq!(INPUT, "input");
        assert_eq!(INPUT, Token::new("input").unwrap());
    }

    #[test]
    fn test_token_validation() {
        assert_eq!(Token::new(""), Err(TokenError::Empty));
        assert_eq!(Token::new("waytoolong"), Err(TokenError::TooLong(10)));
        assert_eq!(Token::new("in put"), Err(TokenError::InvalidByte(b' ')));
        assert!(Token::new("i-blob").is_ok());
    }

    #[test]
    fn test_wildcard() {
        assert!(Token::new("*").unwrap().is_wildcard());
        assert!(!INPUT.is_wildcard());
    }
}
