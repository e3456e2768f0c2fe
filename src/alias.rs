//! Alias and listen-port values.
//!
//! Both are validated once at the boundary; everything downstream takes the
//! typed value, so a malformed alias can never reach a byte of the artifacts.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Length every alias must have. Matches the length of the default name so
/// that substituted strings never change size.
pub const ALIAS_LEN: usize = 5;

/// The identifier the agent ships with.
pub const DEFAULT_NAME: &str = "frida";

/// The port the agent listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 27042;

/// A validated replacement name: `[A-Za-z][A-Za-z0-9]{4}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias(String);

impl Alias {
    pub fn new(value: &str) -> Result<Self> {
        let bytes = value.as_bytes();
        let valid = bytes.len() == ALIAS_LEN
            && bytes[0].is_ascii_alphabetic()
            && bytes[1..].iter().all(u8::is_ascii_alphanumeric);
        if !valid {
            return Err(Error::InvalidAlias(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// First three characters, substituted for the three-letter `gum` prefix.
    pub fn short(&self) -> &str {
        // ASCII-only by construction.
        &self.0[..3]
    }
}

impl FromStr for Alias {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Alias {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A TCP listen port in `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port(u16);

impl Port {
    pub fn new(value: u32) -> Result<Self> {
        match u16::try_from(value) {
            Ok(port) if port != 0 => Ok(Self(port)),
            _ => Err(Error::InvalidPort(value.to_string())),
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn is_default(self) -> bool {
        self.0 == DEFAULT_PORT
    }
}

impl Default for Port {
    fn default() -> Self {
        Self(DEFAULT_PORT)
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidPort(s.to_string()))?;
        Self::new(value)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_rejects_short_value() {
        assert!(matches!(Alias::new("ab1"), Err(Error::InvalidAlias(_))));
    }

    #[test]
    fn test_alias_rejects_leading_digit() {
        assert!(matches!(Alias::new("1bcde"), Err(Error::InvalidAlias(_))));
    }

    #[test]
    fn test_alias_accepts_letters_and_digits() {
        assert_eq!(Alias::new("abcde").unwrap().as_str(), "abcde");
        assert_eq!(Alias::new("Ab3d9").unwrap().short(), "Ab3");
    }

    #[test]
    fn test_alias_rejects_punctuation_and_multibyte() {
        assert!(Alias::new("ab-de").is_err());
        assert!(Alias::new("abcdé").is_err());
        assert!(Alias::new("abcdef").is_err());
        assert!(Alias::new("").is_err());
    }

    #[test]
    fn test_port_bounds() {
        assert!(Port::new(0).is_err());
        assert!(Port::new(65536).is_err());
        assert_eq!(Port::new(1).unwrap().get(), 1);
        assert_eq!(Port::new(65535).unwrap().get(), 65535);
        assert!(Port::default().is_default());
    }

    #[test]
    fn test_port_from_str() {
        assert_eq!("27043".parse::<Port>().unwrap().get(), 27043);
        assert!("http".parse::<Port>().is_err());
        assert!("-1".parse::<Port>().is_err());
    }
}
