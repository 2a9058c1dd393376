//! Source id parsing and formatting.
//!
//! An item is addressed two ways: a numeric source id used by the remote
//! catalog, and a human-readable source name used for local directories
//! (`RJ123456`, `VJ00456789`, ...). The name is a two-letter prefix plus the
//! zero-padded tail of the id; the prefix is encoded in the id's 10^8 band.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Band width separating the prefix families inside a numeric id.
const BAND: u64 = 100_000_000;

/// Error parsing a source id from user input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceIdError {
    /// The input was neither a prefixed name nor a bare number.
    #[error("invalid source id: {input}")]
    Invalid {
        /// The rejected input string.
        input: String,
    },
}

/// Numeric identifier of one content item.
///
/// Accepts `RJ`/`VJ`/`BJ`-prefixed names as well as bare digits when parsed,
/// and renders back to the canonical prefixed name via [`SourceId::name`].
///
/// # Example
///
/// ```
/// use workdl_core::ids::SourceId;
///
/// let id: SourceId = "RJ123456".parse().unwrap();
/// assert_eq!(id.name(), "RJ123456");
/// assert_eq!(id, "123456".parse().unwrap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl SourceId {
    /// Returns the human-readable source name for this id.
    ///
    /// Ids below 10^8 render as `RJ` plus 6 digits (8 when the tail needs
    /// 7-8 digits); the 3·10^8 and 4·10^8 bands render as `VJ` and `BJ`.
    #[must_use]
    pub fn name(self) -> String {
        let prefix = match self.0 / BAND {
            0 => "RJ",
            3 => "VJ",
            4 => "BJ",
            // Out-of-band ids keep the default family so local paths stay derivable.
            _ => "RJ",
        };
        let tail = self.0 % BAND;
        // Six digits historically; seven-digit tails are padded up to eight.
        if tail < 1_000_000 {
            format!("{prefix}{tail:06}")
        } else {
            format!("{prefix}{tail:08}")
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for SourceId {
    type Err = SourceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SourceIdError::Invalid {
            input: s.to_string(),
        };

        let prefixed = match s.get(..2) {
            Some("RJ" | "rj") => Some(0),
            Some("VJ" | "vj") => Some(3 * BAND),
            Some("BJ" | "bj") => Some(4 * BAND),
            _ => None,
        };

        match prefixed {
            Some(offset) => {
                let digits = &s[2..];
                let tail: u64 = digits.parse().map_err(|_| invalid())?;
                if digits.len() > 8 {
                    return Err(invalid());
                }
                Ok(Self(offset + tail))
            }
            None => {
                // Bare digits carry the band themselves.
                let id: u64 = s.parse().map_err(|_| invalid())?;
                if id >= 5 * BAND {
                    return Err(invalid());
                }
                Ok(Self(id))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixed_name() {
        assert_eq!("RJ123456".parse::<SourceId>().unwrap(), SourceId(123_456));
        assert_eq!(
            "VJ123456".parse::<SourceId>().unwrap(),
            SourceId(300_123_456)
        );
        assert_eq!(
            "BJ123456".parse::<SourceId>().unwrap(),
            SourceId(400_123_456)
        );
    }

    #[test]
    fn test_parse_bare_digits() {
        assert_eq!("123456".parse::<SourceId>().unwrap(), SourceId(123_456));
        assert_eq!(
            "301017818".parse::<SourceId>().unwrap(),
            SourceId(301_017_818)
        );
    }

    #[test]
    fn test_parse_lowercase_prefix() {
        assert_eq!("rj123456".parse::<SourceId>().unwrap(), SourceId(123_456));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("RJabc".parse::<SourceId>().is_err());
        assert!("".parse::<SourceId>().is_err());
        assert!("XJ123".parse::<SourceId>().is_err());
    }

    #[test]
    fn test_name_six_digit_padding() {
        assert_eq!(SourceId(1234).name(), "RJ001234");
        assert_eq!(SourceId(123_456).name(), "RJ123456");
    }

    #[test]
    fn test_name_eight_digit_ids() {
        assert_eq!(SourceId(1_017_818).name(), "RJ01017818");
        assert_eq!(SourceId(10_178_180).name(), "RJ10178180");
    }

    #[test]
    fn test_name_other_bands() {
        assert_eq!(SourceId(300_123_456).name(), "VJ123456");
        assert_eq!(SourceId(400_123_456).name(), "BJ123456");
    }

    #[test]
    fn test_round_trip() {
        for id in [SourceId(7), SourceId(123_456), SourceId(301_017_818)] {
            assert_eq!(id.name().parse::<SourceId>().unwrap(), id);
        }
    }
}
