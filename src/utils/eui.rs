use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::error::GsError;

/// A 64-bit extended unique identifier, as carried by gateways and devices.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub const ZERO: Eui64 = Eui64([0; 8]);

    pub fn from_u64(value: u64) -> Self {
        Eui64(value.to_be_bytes())
    }

    pub fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    /// Parses an EUI from raw bytes; the slice must hold exactly 8 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GsError> {
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| GsError::InvalidArgument(format!("EUI must be 8 bytes, got {}", bytes.len())))?;
        Ok(Eui64(array))
    }

    /// The canonical gateway ID derived from an EUI: `eui-0102030405060708`.
    pub fn to_gateway_id(self) -> String {
        format!("eui-{}", hex::encode(self.0))
    }

    /// The dashed form used by Basic Station for device EUIs: `01-02-03-04-05-06-07-08`.
    pub fn to_dashed(self) -> String {
        self.0
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Formats the EUI as ID6: four 16-bit groups, leading zeros dropped and the
    /// longest run of zero groups compressed to `::`.
    pub fn to_id6(self) -> String {
        let value = self.to_u64();
        if value == 0 {
            return "::0".to_string();
        }
        let groups: Vec<u16> = (0..4)
            .map(|i| ((value >> (48 - 16 * i)) & 0xFFFF) as u16)
            .collect();

        // Longest run of zero groups, at least two long.
        let (mut best_start, mut best_len) = (0usize, 0usize);
        let mut i = 0;
        while i < 4 {
            if groups[i] == 0 {
                let start = i;
                while i < 4 && groups[i] == 0 {
                    i += 1;
                }
                if i - start > best_len {
                    best_start = start;
                    best_len = i - start;
                }
            } else {
                i += 1;
            }
        }

        let fmt = |gs: &[u16]| {
            gs.iter()
                .map(|g| format!("{:x}", g))
                .collect::<Vec<_>>()
                .join(":")
        };
        if best_len < 2 {
            return fmt(&groups);
        }
        format!(
            "{}::{}",
            fmt(&groups[..best_start]),
            fmt(&groups[best_start + best_len..])
        )
    }

    /// Parses an ID6 string, optionally prefixed (`router-1::2`, `muxs::0`).
    ///
    /// Plain EUI-64 notations (`0102030405060708`, `01-02-...`, `01:02:...`) are accepted
    /// as well, since gateways are not consistent about the form they send.
    pub fn parse_id6(input: &str) -> Result<Self, GsError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(GsError::InvalidArgument("empty ID6".into()));
        }
        if let Ok(eui) = input.parse::<Eui64>() {
            return Ok(eui);
        }
        let body = strip_id6_prefix(input);
        if let Ok(eui) = body.trim_start_matches(':').parse::<Eui64>() {
            return Ok(eui);
        }
        parse_id6_groups(body)
            .ok_or_else(|| GsError::InvalidArgument(format!("invalid ID6 `{}`", input)))
    }
}

/// Strips a textual prefix such as `router-` or `muxs::`.
///
/// A prefix must contain at least one non-hexadecimal letter, otherwise `f::1` would be
/// read as prefix `f`.
fn strip_id6_prefix(input: &str) -> &str {
    let letters = input
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_alphabetic())
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    if letters == 0 {
        return input;
    }
    let (prefix, rest) = input.split_at(letters);
    if prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return input;
    }
    if let Some(rest) = rest.strip_prefix('-') {
        return rest;
    }
    if rest.starts_with("::") {
        // `muxs::0` keeps its compressed zero run.
        return rest;
    }
    rest.strip_prefix(':').unwrap_or(rest)
}

fn parse_id6_groups(body: &str) -> Option<Eui64> {
    let parse_groups = |s: &str| -> Option<Vec<u16>> {
        if s.is_empty() {
            return Some(Vec::new());
        }
        s.split(':')
            .map(|g| {
                if g.is_empty() || g.len() > 4 {
                    None
                } else {
                    u16::from_str_radix(g, 16).ok()
                }
            })
            .collect()
    };

    let groups = match body.find("::") {
        Some(pos) => {
            let head = parse_groups(&body[..pos])?;
            let tail = parse_groups(&body[pos + 2..])?;
            if head.len() + tail.len() > 3 {
                return None;
            }
            let mut groups = head;
            groups.resize(4 - tail.len(), 0);
            groups.extend(tail);
            groups
        }
        None => {
            let groups = parse_groups(body)?;
            if groups.len() != 4 {
                return None;
            }
            groups
        }
    };
    let value = groups
        .iter()
        .fold(0u64, |acc, g| (acc << 16) | u64::from(*g));
    Some(Eui64::from_u64(value))
}

impl FromStr for Eui64 {
    type Err = GsError;

    /// Parses 16 hex digits, optionally separated by `-` or `:` between every byte.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let compact: String = if s.len() == 23 {
            let sep = s.as_bytes()[2];
            if sep != b'-' && sep != b':' {
                return Err(GsError::InvalidArgument(format!("invalid EUI `{}`", s)));
            }
            let parts: Vec<&str> = s.split(sep as char).collect();
            if parts.len() != 8 || parts.iter().any(|p| p.len() != 2) {
                return Err(GsError::InvalidArgument(format!("invalid EUI `{}`", s)));
            }
            parts.concat()
        } else {
            s.to_string()
        };
        if compact.len() != 16 {
            return Err(GsError::InvalidArgument(format!("invalid EUI `{}`", s)));
        }
        let bytes = hex::decode(&compact)
            .map_err(|e| GsError::InvalidArgument(format!("invalid EUI `{}`: {}", s, e)))?;
        Eui64::from_slice(&bytes)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl fmt::Debug for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eui64({})", self)
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eui_notations() {
        let want = Eui64([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!("0102030405060708".parse::<Eui64>().unwrap(), want);
        assert_eq!("01-02-03-04-05-06-07-08".parse::<Eui64>().unwrap(), want);
        assert_eq!("01:02:03:04:05:06:07:08".parse::<Eui64>().unwrap(), want);
        assert!("0102".parse::<Eui64>().is_err());
        assert!("zz02030405060708".parse::<Eui64>().is_err());
    }

    #[test]
    fn formats_id6() {
        assert_eq!(Eui64::ZERO.to_id6(), "::0");
        assert_eq!(Eui64([1, 2, 3, 4, 5, 6, 7, 8]).to_id6(), "102:304:506:708");
        assert_eq!(Eui64::from_u64(0x0001_0000_0000_0000).to_id6(), "1::");
        assert_eq!(Eui64::from_u64(0x0000_0000_000a_000b).to_id6(), "::a:b");
        assert_eq!(Eui64::from_u64(0x000f_0000_0000_0001).to_id6(), "f::1");
        assert_eq!(Eui64::from_u64(0x000f_a123_00f8_0100).to_id6(), "f:a123:f8:100");
        assert_eq!(Eui64::from_u64(0x0001_0000_0002_0003).to_id6(), "1:0:2:3");
    }

    #[test]
    fn parses_id6_forms() {
        for (input, want) in [
            ("::0", 0u64),
            ("1::", 0x0001_0000_0000_0000),
            ("::a:b", 0x0000_0000_000a_000b),
            ("f::1", 0x000f_0000_0000_0001),
            ("f:a123:f8:100", 0x000f_a123_00f8_0100),
            ("router-102:304:506:708", 0x0102_0304_0506_0708),
            ("router::0102030405060708", 0x0102_0304_0506_0708),
            ("muxs::0", 0),
            ("01-02-03-04-05-06-07-08", 0x0102_0304_0506_0708),
        ] {
            assert_eq!(Eui64::parse_id6(input).unwrap().to_u64(), want, "{}", input);
        }
        assert!(Eui64::parse_id6("").is_err());
        assert!(Eui64::parse_id6("1:2:3:4:5").is_err());
        assert!(Eui64::parse_id6("router-").is_err());
    }

    #[test]
    fn id6_round_trips() {
        for value in [0u64, 1, 0xFFFF, 0x0102_0304_0506_0708, u64::MAX, 0x1000_0000_0000_0001] {
            let eui = Eui64::from_u64(value);
            assert_eq!(Eui64::parse_id6(&eui.to_id6()).unwrap(), eui);
        }
    }

    #[test]
    fn gateway_id_form() {
        let eui = Eui64([0xAA, 0xBB, 0, 0, 0, 0, 0, 1]);
        assert_eq!(eui.to_gateway_id(), "eui-aabb000000000001");
        assert_eq!(eui.to_dashed(), "AA-BB-00-00-00-00-00-01");
    }
}
