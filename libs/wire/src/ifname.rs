//! Bounded interface names.
//!
//! Every kernel control structure carries interface names in a fixed
//! `IFNAMSIZ`-byte field, NUL-terminated and zero-padded. [`InterfaceName`]
//! enforces the bound at construction so encoding can never truncate and
//! decoding can never read past the field.

use std::fmt;
use std::str::FromStr;

use crate::error::WireError;

/// Size of a kernel interface-name field, including the NUL terminator.
pub const IFNAMSIZ: usize = 16;

/// Maximum length of an interface name in bytes.
pub const IFNAME_MAX: usize = IFNAMSIZ - 1;

/// A validated interface name.
///
/// Non-empty, at most [`IFNAME_MAX`] bytes, no interior NUL. Fits any
/// `IFNAMSIZ`-byte wire field without truncation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceName(String);

impl InterfaceName {
    /// Validate and wrap an interface name.
    pub fn new(name: &str) -> Result<Self, WireError> {
        if name.is_empty() {
            return Err(WireError::EmptyName);
        }
        if name.len() > IFNAME_MAX {
            return Err(WireError::NameTooLong {
                len: name.len(),
                max: IFNAME_MAX,
            });
        }
        if name.bytes().any(|b| b == 0) {
            return Err(WireError::EmbeddedNul);
        }
        Ok(Self(name.to_string()))
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Write the name into a fixed `IFNAMSIZ`-byte field.
    ///
    /// The whole field is zeroed first, so trailing bytes never carry
    /// host-memory garbage across the system-call boundary.
    pub fn encode_into(&self, field: &mut [u8]) -> Result<(), WireError> {
        if field.len() < IFNAMSIZ {
            return Err(WireError::BufferTooSmall {
                need: IFNAMSIZ,
                have: field.len(),
            });
        }
        let field = &mut field[..IFNAMSIZ];
        field.fill(0);
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        Ok(())
    }

    /// Decode a name from a fixed `IFNAMSIZ`-byte field.
    ///
    /// The field must contain a NUL terminator within bounds; anything else
    /// is a malformed record, not a panic.
    pub fn decode(field: &[u8]) -> Result<Self, WireError> {
        match Self::decode_opt(field)? {
            Some(name) => Ok(name),
            None => Err(WireError::MalformedRecord(
                "empty interface name field".to_string(),
            )),
        }
    }

    /// Decode a name field that may legitimately be empty.
    ///
    /// Returns `None` when the field starts with NUL (the kernel's encoding
    /// of "no interface"), distinguishing absence from malformed data.
    pub fn decode_opt(field: &[u8]) -> Result<Option<Self>, WireError> {
        if field.len() < IFNAMSIZ {
            return Err(WireError::MalformedRecord(format!(
                "name field is {} bytes, expected {}",
                field.len(),
                IFNAMSIZ
            )));
        }
        let field = &field[..IFNAMSIZ];
        let Some(len) = field.iter().position(|&b| b == 0) else {
            return Err(WireError::MalformedRecord(
                "interface name field is not NUL-terminated".to_string(),
            ));
        };
        if len == 0 {
            return Ok(None);
        }
        let name = std::str::from_utf8(&field[..len]).map_err(|_| {
            WireError::MalformedRecord("interface name is not valid UTF-8".to_string())
        })?;
        Ok(Some(Self(name.to_string())))
    }
}

impl FromStr for InterfaceName {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_names_up_to_fifteen_bytes() {
        let name = InterfaceName::new("feth123456789ab").unwrap();
        assert_eq!(name.as_str().len(), 15);
    }

    #[test]
    fn test_rejects_sixteen_byte_name() {
        let err = InterfaceName::new("feth123456789abc").unwrap_err();
        assert_eq!(
            err,
            WireError::NameTooLong {
                len: 16,
                max: IFNAME_MAX
            }
        );
    }

    #[test]
    fn test_rejects_empty_and_nul() {
        assert_eq!(InterfaceName::new("").unwrap_err(), WireError::EmptyName);
        assert_eq!(
            InterfaceName::new("fe\0th").unwrap_err(),
            WireError::EmbeddedNul
        );
    }

    #[test]
    fn test_encode_zero_fills_field() {
        let name = InterfaceName::new("en0").unwrap();
        let mut field = [0xffu8; IFNAMSIZ];
        name.encode_into(&mut field).unwrap();
        assert_eq!(&field[..3], b"en0");
        assert!(field[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_round_trip() {
        let name = InterfaceName::new("bridge0").unwrap();
        let mut field = [0u8; IFNAMSIZ];
        name.encode_into(&mut field).unwrap();
        assert_eq!(InterfaceName::decode(&field).unwrap(), name);
    }

    #[test]
    fn test_decode_requires_terminator() {
        let field = [b'a'; IFNAMSIZ];
        assert!(matches!(
            InterfaceName::decode(&field),
            Err(WireError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_decode_opt_empty_field_is_none() {
        let field = [0u8; IFNAMSIZ];
        assert_eq!(InterfaceName::decode_opt(&field).unwrap(), None);
    }
}
