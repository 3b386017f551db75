//! Wire scalar types: GUIDs and FILETIME timestamps

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{SmbError, SmbResult};

/// Milliseconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET_MILLIS: i64 = 11_644_473_600_000;

/// FILETIME ticks (100 ns) per millisecond
const TICKS_PER_MILLI: i64 = 10_000;

/// 16-byte GUID in the MS-DTYP mixed-endian wire layout
///
/// The first three groups are little-endian on the wire, the last eight
/// bytes are sent as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Guid(Uuid);

impl Guid {
    /// Wire size in bytes
    pub const SIZE: usize = 16;

    /// All-zero GUID
    pub const NIL: Self = Self(Uuid::nil());

    /// Wrap a UUID
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Random (v4) GUID
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Decode from wire bytes
    pub fn from_wire(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }

    /// Encode to wire bytes
    pub fn to_wire(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    /// Read from a buffer
    pub fn parse(buf: &mut &[u8]) -> SmbResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(SmbError::Protocol("GUID truncated".to_string()));
        }
        let mut bytes = [0u8; 16];
        buf.copy_to_slice(&mut bytes);
        Ok(Self::from_wire(bytes))
    }

    /// Write to a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.to_wire());
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Guid {
    type Err = SmbError;

    fn from_str(s: &str) -> SmbResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SmbError::Protocol(format!("Invalid GUID '{s}': {e}")))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl From<Uuid> for Guid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Windows FILETIME: 100-nanosecond intervals since 1601-01-01 UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileTime(u64);

impl FileTime {
    /// Wrap a raw tick count
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Raw tick count
    pub const fn ticks(&self) -> u64 {
        self.0
    }

    /// Current time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert from milliseconds since the Unix epoch
    ///
    /// Times before 1601 clamp to zero and times past the last FILETIME
    /// clamp to the maximum tick count.
    pub fn from_unix_millis(millis: i64) -> Self {
        Self::saturating(
            (i128::from(millis) + i128::from(FILETIME_UNIX_OFFSET_MILLIS))
                * i128::from(TICKS_PER_MILLI),
        )
    }

    fn saturating(ticks: i128) -> Self {
        Self(u64::try_from(ticks.max(0)).unwrap_or(u64::MAX))
    }

    /// Convert to milliseconds since the Unix epoch
    pub fn to_unix_millis(&self) -> i64 {
        (self.0 / TICKS_PER_MILLI as u64) as i64 - FILETIME_UNIX_OFFSET_MILLIS
    }

    /// Convert from a UTC timestamp (sub-100ns precision is dropped)
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let millis = i128::from(dt.timestamp_millis()) + i128::from(FILETIME_UNIX_OFFSET_MILLIS);
        let sub_milli = i128::from(dt.timestamp_subsec_nanos() % 1_000_000) / 100;
        Self::saturating(millis * i128::from(TICKS_PER_MILLI) + sub_milli)
    }

    /// Convert to a UTC timestamp
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let millis = self.to_unix_millis();
        let rem_ticks = self.0 % TICKS_PER_MILLI as u64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(|dt| dt + chrono::Duration::nanoseconds(rem_ticks as i64 * 100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_wire_round_trip() {
        let wire = [
            0xB1, 0x16, 0x6E, 0x99, 0xFB, 0xE7, 0x64, 0x94, 0x6B, 0x35, 0x35, 0x05, 0x7D, 0xE2,
            0x9F, 0x07,
        ];
        let guid = Guid::from_wire(wire);
        assert_eq!(guid.to_string(), "996e16b1-e7fb-9464-6b35-35057de29f07");

        let parsed: Guid = "996e16b1-e7fb-9464-6b35-35057de29f07".parse().unwrap();
        assert_eq!(parsed, guid);
        assert_eq!(parsed.to_wire(), wire);
    }

    #[test]
    fn test_guid_buffer_round_trip() {
        let guid = Guid::random();
        let mut buf = BytesMut::new();
        guid.encode(&mut buf);
        let mut slice = &buf[..];
        assert_eq!(Guid::parse(&mut slice).unwrap(), guid);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_guid_truncated() {
        let mut slice: &[u8] = &[0u8; 8];
        assert!(Guid::parse(&mut slice).is_err());
    }

    #[test]
    fn test_filetime_unix_millis() {
        let ft = FileTime::from_unix_millis(1_755_237_329_892);
        assert_eq!(ft.ticks(), 133_997_109_298_920_000);
        assert_eq!(ft.to_unix_millis(), 1_755_237_329_892);
    }

    #[test]
    fn test_filetime_datetime() {
        let dt = Utc.timestamp_millis_opt(1_755_237_329_892).single().unwrap();
        let ft = FileTime::from_datetime(dt);
        assert_eq!(ft.ticks(), 133_997_109_298_920_000);
        assert_eq!(ft.to_datetime().unwrap(), dt);
    }

    #[test]
    fn test_filetime_unix_epoch() {
        assert_eq!(FileTime::from_unix_millis(0).ticks(), 116_444_736_000_000_000);
    }

    #[test]
    fn test_filetime_clamps_out_of_range() {
        assert_eq!(FileTime::from_unix_millis(i64::MAX).ticks(), u64::MAX);
        assert_eq!(FileTime::from_unix_millis(i64::MAX / 1000).ticks(), u64::MAX);
        assert_eq!(FileTime::from_unix_millis(i64::MIN).ticks(), 0);
        assert_eq!(FileTime::from_unix_millis(-11_644_473_600_001).ticks(), 0);

        let far_future = Utc.with_ymd_and_hms(200_000, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(FileTime::from_datetime(far_future).ticks(), u64::MAX);
        let far_past = Utc.with_ymd_and_hms(1000, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(FileTime::from_datetime(far_past).ticks(), 0);
    }
}
