//! Dialect codes and dialect negotiation

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{SmbError, SmbResult};

/// SMB dialect revisions
///
/// Serialised as its dotted form (`"3.0.2"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// SMB 2.0.2
    Smb202,
    /// SMB 2.1
    Smb210,
    /// SMB 3.0
    Smb300,
    /// SMB 3.0.2
    Smb302,
    /// SMB 3.1.1
    Smb311,
    /// Wildcard revision answered to a multi-protocol negotiate
    Wildcard,
    /// Unrecognised dialect code
    Unknown,
}

impl Dialect {
    /// Concrete dialects in ascending order
    pub const KNOWN: [Dialect; 5] = [
        Self::Smb202,
        Self::Smb210,
        Self::Smb300,
        Self::Smb302,
        Self::Smb311,
    ];

    /// Get the dialect value for the protocol
    pub fn code(&self) -> u16 {
        match self {
            Self::Smb202 => 0x0202,
            Self::Smb210 => 0x0210,
            Self::Smb300 => 0x0300,
            Self::Smb302 => 0x0302,
            Self::Smb311 => 0x0311,
            Self::Wildcard => 0x02FF,
            Self::Unknown => 0x0000,
        }
    }

    /// Create from raw value; unmapped codes become [`Dialect::Unknown`]
    pub fn from_code(val: u16) -> Self {
        match val {
            0x0202 => Self::Smb202,
            0x0210 => Self::Smb210,
            0x0300 => Self::Smb300,
            0x0302 => Self::Smb302,
            0x0311 => Self::Smb311,
            0x02FF => Self::Wildcard,
            _ => Self::Unknown,
        }
    }

    /// Whether this is one of the concrete, orderable dialects
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Wildcard | Self::Unknown)
    }

    /// Strictly earlier than `other`; false when either side is not comparable
    pub fn is_before(&self, other: Dialect) -> bool {
        self.is_known() && other.is_known() && self.code() < other.code()
    }

    /// Same as or later than `other`; false when either side is not comparable
    pub fn is_at_or_after(&self, other: Dialect) -> bool {
        self.is_known() && other.is_known() && self.code() >= other.code()
    }

    /// SMB 3.x family (AES-based signing, key derivation)
    pub fn is_smb3(&self) -> bool {
        self.is_at_or_after(Dialect::Smb300)
    }

    /// Check if this dialect supports multi-credit requests
    pub fn supports_multi_credit(&self) -> bool {
        self.is_at_or_after(Dialect::Smb210)
    }
}

impl PartialOrd for Dialect {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.is_known() && other.is_known() {
            Some(self.code().cmp(&other.code()))
        } else {
            None
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wildcard => write!(f, "2.???"),
            Self::Unknown => write!(f, "unknown"),
            _ => {
                let code = self.code();
                let major = code >> 8;
                let minor = (code >> 4) & 0xF;
                let patch = code & 0xF;
                if patch == 0 {
                    write!(f, "{major}.{minor}")
                } else {
                    write!(f, "{major}.{minor}.{patch}")
                }
            }
        }
    }
}

impl FromStr for Dialect {
    type Err = SmbError;

    /// Accepts the dotted form or a hex code such as `0x0302`
    fn from_str(s: &str) -> SmbResult<Self> {
        let s = s.trim();
        let dialect = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16)
                .map(Dialect::from_code)
                .unwrap_or(Dialect::Unknown),
            None => Dialect::KNOWN
                .into_iter()
                .find(|d| d.to_string() == s)
                .unwrap_or(Dialect::Unknown),
        };
        if dialect.is_known() {
            Ok(dialect)
        } else {
            Err(SmbError::Negotiation(format!("Unrecognised dialect '{s}'")))
        }
    }
}

impl Serialize for Dialect {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dialect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Contiguous dialect range offered by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectRange {
    /// Lowest offered dialect
    pub min: Dialect,
    /// Highest offered dialect
    pub max: Dialect,
}

impl DialectRange {
    /// Create a range; both ends must be concrete and ordered
    pub fn new(min: Dialect, max: Dialect) -> SmbResult<Self> {
        if !min.is_known() || !max.is_known() {
            return Err(SmbError::Negotiation(format!(
                "Dialect range ends must be concrete: {min}..{max}"
            )));
        }
        if max.is_before(min) {
            return Err(SmbError::Negotiation(format!(
                "Empty dialect range: {min}..{max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Check if a dialect falls inside the range
    pub fn contains(&self, dialect: Dialect) -> bool {
        dialect.is_at_or_after(self.min) && !self.max.is_before(dialect)
    }

    /// Concrete dialects in the range, lowest first
    pub fn dialects(&self) -> Vec<Dialect> {
        Dialect::KNOWN
            .iter()
            .copied()
            .filter(|d| self.contains(*d))
            .collect()
    }
}

impl Default for DialectRange {
    fn default() -> Self {
        Self {
            min: Dialect::Smb202,
            max: Dialect::Smb302,
        }
    }
}

/// Pick the highest dialect both sides support
///
/// Unknown and wildcard codes in either list never match.
pub fn negotiate_dialect(offered: &[Dialect], supported: &[Dialect]) -> SmbResult<Dialect> {
    offered
        .iter()
        .copied()
        .filter(|d| d.is_known() && supported.contains(d))
        .max_by_key(|d| d.code())
        .ok_or_else(|| {
            SmbError::Negotiation(format!(
                "No common dialect: offered {offered:?}, supported {supported:?}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_codes() {
        for dialect in Dialect::KNOWN {
            assert_eq!(Dialect::from_code(dialect.code()), dialect);
        }
        assert_eq!(Dialect::from_code(0x02FF), Dialect::Wildcard);
        assert_eq!(Dialect::from_code(0x0100), Dialect::Unknown);
        assert_eq!(Dialect::Unknown.code(), 0x0000);
    }

    #[test]
    fn test_dialect_ordering() {
        assert!(Dialect::Smb311 > Dialect::Smb302);
        assert!(Dialect::Smb202.is_before(Dialect::Smb210));
        assert!(Dialect::Smb300.is_at_or_after(Dialect::Smb300));
        assert!(Dialect::Smb302.is_smb3());
        assert!(!Dialect::Smb210.is_smb3());
    }

    #[test]
    fn test_unknown_is_incomparable() {
        assert!(!Dialect::Unknown.is_before(Dialect::Smb311));
        assert!(!Dialect::Unknown.is_at_or_after(Dialect::Smb202));
        assert!(!Dialect::Smb202.is_before(Dialect::Unknown));
        assert!(!Dialect::Wildcard.is_at_or_after(Dialect::Smb202));
        assert!(!Dialect::Unknown.is_smb3());
    }

    #[test]
    fn test_negotiate_picks_common() {
        let offered = DialectRange::new(Dialect::Smb202, Dialect::Smb311)
            .unwrap()
            .dialects();
        assert_eq!(offered.len(), 5);
        let selected = negotiate_dialect(&offered, &[Dialect::Smb300]).unwrap();
        assert_eq!(selected, Dialect::Smb300);
        assert_eq!(selected.code(), 0x0300);
    }

    #[test]
    fn test_negotiate_picks_highest() {
        let offered = [Dialect::Smb202, Dialect::Smb210, Dialect::Smb300];
        let supported = [Dialect::Smb210, Dialect::Smb300, Dialect::Smb311];
        assert_eq!(
            negotiate_dialect(&offered, &supported).unwrap(),
            Dialect::Smb300
        );
    }

    #[test]
    fn test_negotiate_disjoint_fails() {
        let offered = [Dialect::Smb202, Dialect::Smb210];
        let supported = [Dialect::Smb300, Dialect::Smb302];
        assert!(matches!(
            negotiate_dialect(&offered, &supported),
            Err(SmbError::Negotiation(_))
        ));
    }

    #[test]
    fn test_negotiate_ignores_unknown() {
        let offered = [Dialect::Unknown, Dialect::Smb202];
        let supported = [Dialect::Unknown, Dialect::Smb202];
        assert_eq!(
            negotiate_dialect(&offered, &supported).unwrap(),
            Dialect::Smb202
        );
    }

    #[test]
    fn test_range_validation() {
        assert!(DialectRange::new(Dialect::Smb300, Dialect::Smb202).is_err());
        assert!(DialectRange::new(Dialect::Unknown, Dialect::Smb202).is_err());
        let range = DialectRange::new(Dialect::Smb210, Dialect::Smb300).unwrap();
        assert_eq!(range.dialects(), vec![Dialect::Smb210, Dialect::Smb300]);
        assert!(!range.contains(Dialect::Smb311));
    }

    #[test]
    fn test_from_str() {
        assert_eq!("3.0.2".parse::<Dialect>().unwrap(), Dialect::Smb302);
        assert_eq!("2.1".parse::<Dialect>().unwrap(), Dialect::Smb210);
        assert_eq!("0x0300".parse::<Dialect>().unwrap(), Dialect::Smb300);
        assert!("0x02FF".parse::<Dialect>().is_err());
        assert!("4.0".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Dialect::Smb202.to_string(), "2.0.2");
        assert_eq!(Dialect::Smb210.to_string(), "2.1");
        assert_eq!(Dialect::Smb311.to_string(), "3.1.1");
    }
}
